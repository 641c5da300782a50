use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::warn;

use crate::errors::{AppError, AppResult};
use crate::store::{RecordStore, LEARNING_DATA_KEY};

const MAX_CHOICES: usize = 100;
const MAX_SKIPPED: usize = 50;
const TOP_N: usize = 5;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UserChoice {
    pub from: String,
    pub to: String,
    pub selected_route: String,
    pub timestamp: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ai_suggestion: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SkippedSuggestion {
    pub from: String,
    pub to: String,
    pub ai_suggestion: String,
    pub timestamp: i64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LearningData {
    #[serde(default)]
    pub user_choices: Vec<UserChoice>,
    #[serde(default)]
    pub skipped_suggestions: Vec<SkippedSuggestion>,
    #[serde(default)]
    pub route_preferences: BTreeMap<String, u32>,
    #[serde(default)]
    pub location_preferences: BTreeMap<String, u32>,
}

#[derive(Debug, Clone, Serialize)]
pub struct TripPreferences {
    pub preferred_routes: Vec<String>,
    pub total_choices: usize,
    pub route_preferences: BTreeMap<String, u32>,
    pub location_preferences: BTreeMap<String, u32>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LearningStats {
    pub total_choices: usize,
    pub total_skipped: usize,
    pub unique_routes: usize,
    pub unique_locations: usize,
    pub last_activity: Option<i64>,
}

fn normalize(s: &str) -> String {
    s.trim().to_lowercase()
}

/// Entries by descending count; ties keep key order.
fn ranked(counts: &BTreeMap<String, u32>) -> Vec<(&String, u32)> {
    let mut entries: Vec<(&String, u32)> = counts.iter().map(|(k, v)| (k, *v)).collect();
    entries.sort_by(|a, b| b.1.cmp(&a.1));
    entries
}

fn keep_last<T>(items: &mut Vec<T>, max: usize) {
    if items.len() > max {
        let excess = items.len() - max;
        items.drain(..excess);
    }
}

/// Route choices the rider actually made, used to personalise suggestions.
pub struct LearningService {
    store: Arc<dyn RecordStore>,
    write_lock: Mutex<()>,
}

impl LearningService {
    pub fn new(store: Arc<dyn RecordStore>) -> Self {
        Self {
            store,
            write_lock: Mutex::new(()),
        }
    }

    pub async fn data(&self) -> LearningData {
        match self.store.get(LEARNING_DATA_KEY).await {
            Ok(Some(value)) => serde_json::from_value(value).unwrap_or_else(|e| {
                warn!("Failed to parse learning data, resetting: {}", e);
                LearningData::default()
            }),
            Ok(None) => LearningData::default(),
            Err(e) => {
                warn!("Failed to read learning data: {}", e);
                LearningData::default()
            }
        }
    }

    async fn save(&self, data: &LearningData) -> AppResult<()> {
        self.store
            .put(LEARNING_DATA_KEY, serde_json::to_value(data)?)
            .await
    }

    pub async fn record_choice(
        &self,
        from: &str,
        to: &str,
        selected_route: &str,
        ai_suggestion: Option<String>,
    ) -> AppResult<()> {
        if selected_route.trim().is_empty() {
            return Err(AppError::BadRequest("selected route is required".to_string()));
        }
        let _guard = self.write_lock.lock().await;
        let mut data = self.data().await;
        let choice = UserChoice {
            from: normalize(from),
            to: normalize(to),
            selected_route: selected_route.to_string(),
            timestamp: Utc::now().timestamp_millis(),
            ai_suggestion,
        };

        *data
            .route_preferences
            .entry(choice.selected_route.clone())
            .or_insert(0) += 1;
        *data.location_preferences.entry(choice.from.clone()).or_insert(0) += 1;
        *data.location_preferences.entry(choice.to.clone()).or_insert(0) += 1;

        data.user_choices.push(choice);
        keep_last(&mut data.user_choices, MAX_CHOICES);
        self.save(&data).await
    }

    pub async fn record_skipped(&self, from: &str, to: &str, ai_suggestion: &str) -> AppResult<()> {
        let _guard = self.write_lock.lock().await;
        let mut data = self.data().await;
        data.skipped_suggestions.push(SkippedSuggestion {
            from: normalize(from),
            to: normalize(to),
            ai_suggestion: ai_suggestion.to_string(),
            timestamp: Utc::now().timestamp_millis(),
        });
        keep_last(&mut data.skipped_suggestions, MAX_SKIPPED);
        self.save(&data).await
    }

    /// Routes chosen before for this pair of places, in either direction.
    pub async fn preferences(&self, from: &str, to: &str) -> TripPreferences {
        let data = self.data().await;
        let f = normalize(from);
        let t = normalize(to);

        let mut counts: BTreeMap<String, u32> = BTreeMap::new();
        let mut total = 0;
        for choice in &data.user_choices {
            let same = choice.from == f && choice.to == t;
            let reversed = choice.from == t && choice.to == f;
            if same || reversed {
                *counts.entry(choice.selected_route.clone()).or_insert(0) += 1;
                total += 1;
            }
        }

        TripPreferences {
            preferred_routes: ranked(&counts).into_iter().map(|(id, _)| id.clone()).collect(),
            total_choices: total,
            route_preferences: data.route_preferences,
            location_preferences: data.location_preferences,
        }
    }

    /// Plain-text summary appended to assistant prompts.
    pub async fn context_text(&self) -> String {
        let data = self.data().await;
        if data.user_choices.is_empty() {
            return "No learning data available yet.".to_string();
        }

        let top_routes: Vec<String> = ranked(&data.route_preferences)
            .into_iter()
            .take(TOP_N)
            .map(|(id, n)| format!("Route {} ({} times)", id, n))
            .collect();
        let top_locations: Vec<String> = ranked(&data.location_preferences)
            .into_iter()
            .take(TOP_N)
            .map(|(place, n)| format!("{} ({} times)", place, n))
            .collect();
        let recent: Vec<String> = data
            .user_choices
            .iter()
            .rev()
            .take(TOP_N)
            .rev()
            .map(|c| format!("Route {} for {} → {}", c.selected_route, c.from, c.to))
            .collect();

        format!(
            "User Learning Data:\n\
             - Total route choices recorded: {}\n\
             - Unique routes used: {}\n\
             - Unique locations visited: {}\n\
             - Most preferred routes: {}\n\
             - Most frequent locations: {}\n\n\
             Recent choices: {}",
            data.user_choices.len(),
            data.route_preferences.len(),
            data.location_preferences.len(),
            top_routes.join(", "),
            top_locations.join(", "),
            recent.join("; ")
        )
    }

    pub async fn stats(&self) -> LearningStats {
        let data = self.data().await;
        LearningStats {
            total_choices: data.user_choices.len(),
            total_skipped: data.skipped_suggestions.len(),
            unique_routes: data.route_preferences.len(),
            unique_locations: data.location_preferences.len(),
            last_activity: data.user_choices.last().map(|c| c.timestamp),
        }
    }

    pub async fn clear(&self) -> AppResult<()> {
        let _guard = self.write_lock.lock().await;
        self.store.clear(LEARNING_DATA_KEY).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;

    fn service() -> LearningService {
        LearningService::new(Arc::new(MemoryStore::new()))
    }

    #[tokio::test]
    async fn choices_count_routes_and_places() {
        let svc = service();
        svc.record_choice(" Hledan ", "Sule", "36", None).await.unwrap();
        svc.record_choice("sule", "hledan", "61", None).await.unwrap();
        svc.record_choice("Hledan", "Sule", "36", Some("take 36".to_string())).await.unwrap();

        let prefs = svc.preferences("HLEDAN", "sule").await;
        assert_eq!(prefs.preferred_routes, vec!["36", "61"]);
        assert_eq!(prefs.total_choices, 3);
        assert_eq!(prefs.location_preferences.get("hledan"), Some(&3));
    }

    #[tokio::test]
    async fn logs_keep_only_recent_entries() {
        let svc = service();
        for i in 0..(MAX_CHOICES + 5) {
            svc.record_choice("a", "b", &i.to_string(), None).await.unwrap();
        }
        for _ in 0..(MAX_SKIPPED + 3) {
            svc.record_skipped("a", "b", "try 8").await.unwrap();
        }
        let data = svc.data().await;
        assert_eq!(data.user_choices.len(), MAX_CHOICES);
        assert_eq!(data.user_choices[0].selected_route, "5");
        assert_eq!(data.skipped_suggestions.len(), MAX_SKIPPED);
        // preference counts are not trimmed
        assert_eq!(data.route_preferences.len(), MAX_CHOICES + 5);
    }

    #[tokio::test]
    async fn context_text_summarises() {
        let svc = service();
        assert_eq!(svc.context_text().await, "No learning data available yet.");
        svc.record_choice("Hledan", "Sule", "36", None).await.unwrap();
        let text = svc.context_text().await;
        assert!(text.contains("Total route choices recorded: 1"));
        assert!(text.contains("Route 36 (1 times)"));
        assert!(text.contains("Route 36 for hledan → sule"));
    }

    #[tokio::test]
    async fn stats_and_clear() {
        let svc = service();
        svc.record_choice("a", "b", "1", None).await.unwrap();
        svc.record_skipped("a", "b", "x").await.unwrap();
        let stats = svc.stats().await;
        assert_eq!(stats.total_choices, 1);
        assert_eq!(stats.total_skipped, 1);
        assert_eq!(stats.unique_locations, 2);
        assert!(stats.last_activity.is_some());

        svc.clear().await.unwrap();
        assert_eq!(svc.stats().await.total_choices, 0);
    }

    #[tokio::test]
    async fn blank_route_is_rejected() {
        assert!(service().record_choice("a", "b", " ", None).await.is_err());
    }
}
