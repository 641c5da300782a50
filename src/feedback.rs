use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::{error, info};

use crate::errors::{AppError, AppResult};

const FEEDBACK_TABLE: &str = "feedback";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Feedback {
    pub id: i64,
    pub username: Option<String>,
    pub title: String,
    pub description: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewFeedback {
    pub username: Option<String>,
    pub title: String,
    pub description: String,
}

#[async_trait]
pub trait FeedbackStore: Send + Sync {
    async fn insert(&self, feedback: NewFeedback) -> AppResult<()>;
    /// Newest first.
    async fn list(&self) -> AppResult<Vec<Feedback>>;
}

/// Feedback table on a hosted Supabase project, through its REST endpoint.
pub struct SupabaseFeedbackStore {
    client: reqwest::Client,
    base_url: String,
    anon_key: String,
}

impl SupabaseFeedbackStore {
    pub fn new(client: reqwest::Client, base_url: &str, anon_key: &str) -> Self {
        Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            anon_key: anon_key.to_string(),
        }
    }

    fn table_url(&self) -> String {
        format!("{}/rest/v1/{}", self.base_url, FEEDBACK_TABLE)
    }

    fn authorized(&self, req: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        req.header("apikey", &self.anon_key)
            .bearer_auth(&self.anon_key)
    }
}

#[async_trait]
impl FeedbackStore for SupabaseFeedbackStore {
    async fn insert(&self, feedback: NewFeedback) -> AppResult<()> {
        self.authorized(self.client.post(self.table_url()))
            .header("Prefer", "return=minimal")
            .json(&[feedback])
            .send()
            .await?
            .error_for_status()?;
        Ok(())
    }

    async fn list(&self) -> AppResult<Vec<Feedback>> {
        let rows = self
            .authorized(self.client.get(self.table_url()))
            .query(&[("select", "*"), ("order", "created_at.desc")])
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;
        Ok(rows)
    }
}

/// Process-local feedback table, used when no remote store is configured.
#[derive(Default)]
pub struct MemoryFeedbackStore {
    rows: Mutex<Vec<Feedback>>,
}

impl MemoryFeedbackStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl FeedbackStore for MemoryFeedbackStore {
    async fn insert(&self, feedback: NewFeedback) -> AppResult<()> {
        let mut rows = self.rows.lock().await;
        let id = rows.len() as i64 + 1;
        rows.push(Feedback {
            id,
            username: feedback.username,
            title: feedback.title,
            description: feedback.description,
            created_at: Utc::now(),
        });
        Ok(())
    }

    async fn list(&self) -> AppResult<Vec<Feedback>> {
        let mut rows = self.rows.lock().await.clone();
        rows.sort_by(|a, b| b.created_at.cmp(&a.created_at).then(b.id.cmp(&a.id)));
        Ok(rows)
    }
}

pub struct FeedbackService {
    store: Arc<dyn FeedbackStore>,
}

impl FeedbackService {
    pub fn new(store: Arc<dyn FeedbackStore>) -> Self {
        Self { store }
    }

    /// Submit feedback; `Ok(false)` when the remote store rejected it.
    ///
    /// Blank title or description is refused before any remote call.
    pub async fn submit(&self, username: Option<&str>, title: &str, description: &str) -> AppResult<bool> {
        let title = title.trim();
        let description = description.trim();
        if title.is_empty() || description.is_empty() {
            return Err(AppError::BadRequest(
                "feedback needs a title and a description".to_string(),
            ));
        }
        let username = username
            .map(str::trim)
            .filter(|u| !u.is_empty())
            .map(str::to_string);
        let row = NewFeedback {
            username,
            title: title.to_string(),
            description: description.to_string(),
        };
        match self.store.insert(row).await {
            Ok(()) => {
                info!("Feedback submitted: {}", title);
                Ok(true)
            }
            Err(e) => {
                error!("Submit failed: {}", e);
                Ok(false)
            }
        }
    }

    pub async fn list(&self) -> Vec<Feedback> {
        self.store.list().await.unwrap_or_else(|e| {
            error!("Fetch failed: {}", e);
            Vec::new()
        })
    }
}
