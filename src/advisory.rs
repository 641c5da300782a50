//! Route advice and chat via a remote generative model.
//!
//! Every public call returns displayable text: remote failures become a
//! bilingual fallback rather than an error.

use std::sync::{Arc, OnceLock};
use std::time::Duration;

use async_trait::async_trait;
use regex::Regex;
use serde_json::{json, Value};
use tokio::sync::RwLock;
use tracing::{info, warn};

use crate::catalog::RouteCatalog;
use crate::errors::{AppError, AppResult};
use crate::learning::LearningService;
use crate::store::{RecordStore, DISCOVERY_CACHE_KEY};

pub const ROUTE_FALLBACK: &str = "AI ဝန်ဆောင်မှု မရနိုင်သေးပါ။ / AI service is currently unavailable.";
pub const CHAT_FALLBACK: &str = "အမှားအယွင်းရှိနေပါသည်။ / System error.";
pub const DISCOVERY_FALLBACK: &str = "Discovery info unavailable. / အချက်အလက်များ မရနိုင်ပါ။";

const CHAT_SYSTEM_INSTRUCTION: &str = "You are YBS Nova. Answer accurately. DO NOT use markdown characters like ** or ###. ALWAYS provide answers in BOTH Myanmar and English. Be proactive: if the weather is mentioned or detected as rainy, remind about umbrellas. Provide helpful YBS card top-up and balance check tips (USSD, App, G&G outlets) whenever relevant.";

const DISCOVERY_PROMPT: &str = "Proactively check Yangon weather and provide a transit advisory. 1. Describe current weather and suggest an umbrella if rainy/cloudy. 2. Provide 3 proactive tips for YBS card users (top-up, balance check, tapping rule). Entire response MUST be in BOTH Myanmar and English. NO MARKDOWN SYMBOLS like ** or ##. Use plain text only.";

fn markdown_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"\*\*|\*|#+|`|__").expect("static regex"))
}

/// Strip markdown emphasis, headings and code ticks the UI cannot render.
pub fn clean_text(text: &str) -> String {
    markdown_pattern().replace_all(text, "").trim().to_string()
}

#[derive(Debug, Clone, PartialEq)]
pub struct ChatRequest {
    pub prompt: String,
    pub system_instruction: Option<String>,
    pub use_search: bool,
}

#[async_trait]
pub trait ChatBackend: Send + Sync {
    async fn generate(&self, request: ChatRequest) -> AppResult<String>;
    /// Cheap reachability check.
    async fn probe(&self) -> AppResult<()>;
}

pub struct GeminiBackend {
    client: reqwest::Client,
    api_key: String,
    model: String,
    base_url: String,
}

impl GeminiBackend {
    pub fn new(client: reqwest::Client, api_key: &str, model: &str, base_url: &str) -> Self {
        Self {
            client,
            api_key: api_key.to_string(),
            model: model.to_string(),
            base_url: base_url.trim_end_matches('/').to_string(),
        }
    }

    fn model_url(&self) -> String {
        format!("{}/v1beta/models/{}", self.base_url, self.model)
    }
}

fn request_body(request: &ChatRequest) -> Value {
    let mut body = json!({
        "contents": [{ "role": "user", "parts": [{ "text": request.prompt }] }]
    });
    if let Some(system) = &request.system_instruction {
        body["systemInstruction"] = json!({ "parts": [{ "text": system }] });
    }
    if request.use_search {
        body["tools"] = json!([{ "google_search": {} }]);
    }
    body
}

fn response_text(body: &Value) -> AppResult<String> {
    let parts = body
        .pointer("/candidates/0/content/parts")
        .and_then(Value::as_array)
        .ok_or_else(|| AppError::ParseFailure("model response has no candidates".to_string()))?;
    Ok(parts
        .iter()
        .filter_map(|p| p.get("text").and_then(Value::as_str))
        .collect::<Vec<_>>()
        .join(""))
}

#[async_trait]
impl ChatBackend for GeminiBackend {
    async fn generate(&self, request: ChatRequest) -> AppResult<String> {
        let body: Value = self
            .client
            .post(format!("{}:generateContent", self.model_url()))
            .header("x-goog-api-key", &self.api_key)
            .json(&request_body(&request))
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;
        response_text(&body)
    }

    async fn probe(&self) -> AppResult<()> {
        self.client
            .get(self.model_url())
            .header("x-goog-api-key", &self.api_key)
            .send()
            .await?
            .error_for_status()?;
        Ok(())
    }
}

pub struct AdvisoryGateway {
    backend: Option<Arc<dyn ChatBackend>>,
    catalog: Arc<RouteCatalog>,
    learning: Arc<LearningService>,
    store: Arc<dyn RecordStore>,
    timeout: Duration,
    available: RwLock<Option<bool>>,
}

impl AdvisoryGateway {
    pub fn new(
        backend: Option<Arc<dyn ChatBackend>>,
        catalog: Arc<RouteCatalog>,
        learning: Arc<LearningService>,
        store: Arc<dyn RecordStore>,
        timeout: Duration,
    ) -> Self {
        Self {
            backend,
            catalog,
            learning,
            store,
            timeout,
            available: RwLock::new(None),
        }
    }

    /// Last probe result; `None` until the first probe.
    pub async fn availability(&self) -> Option<bool> {
        *self.available.read().await
    }

    /// Check the backend once and cache the answer until the next explicit probe.
    pub async fn probe(&self) -> bool {
        let ok = match &self.backend {
            None => false,
            Some(backend) => match tokio::time::timeout(self.timeout, backend.probe()).await {
                Ok(Ok(())) => true,
                Ok(Err(e)) => {
                    warn!("AI backend probe failed: {}", e);
                    false
                }
                Err(_) => {
                    warn!("AI backend probe timed out");
                    false
                }
            },
        };
        *self.available.write().await = Some(ok);
        info!("AI backend available: {}", ok);
        ok
    }

    async fn ask(&self, request: ChatRequest) -> AppResult<String> {
        let backend = self
            .backend
            .as_ref()
            .ok_or_else(|| AppError::NotSupported("no AI backend configured".to_string()))?;
        let raw = tokio::time::timeout(self.timeout, backend.generate(request))
            .await
            .map_err(|_| AppError::Timeout("AI backend did not answer in time".to_string()))??;
        let text = clean_text(&raw);
        if text.is_empty() {
            return Err(AppError::ParseFailure("AI backend returned no text".to_string()));
        }
        Ok(text)
    }

    pub async fn suggest_route(&self, from: &str, to: &str) -> String {
        let prompt = format!(
            "{}\n\n{}\n\nUser wants to go from \"{}\" to \"{}\". Suggest the best bus number(s).\n\
             - ALWAYS provide the answer in BOTH Myanmar language and English.\n\
             - DO NOT USE markdown symbols like ** or ##. Use plain text only.",
            self.catalog.context_text(),
            self.learning.context_text().await,
            from,
            to
        );
        let request = ChatRequest {
            prompt,
            system_instruction: None,
            use_search: false,
        };
        self.ask(request).await.unwrap_or_else(|e| {
            warn!("Route suggestion failed: {}", e);
            ROUTE_FALLBACK.to_string()
        })
    }

    pub async fn chat(&self, message: &str) -> String {
        let request = ChatRequest {
            prompt: format!(
                "Bus Context:\n{}\n\nUser Question: {}",
                self.catalog.context_text(),
                message
            ),
            system_instruction: Some(CHAT_SYSTEM_INSTRUCTION.to_string()),
            use_search: true,
        };
        self.ask(request).await.unwrap_or_else(|e| {
            warn!("Chat failed: {}", e);
            CHAT_FALLBACK.to_string()
        })
    }

    /// Weather and card advisory; serves the last good answer when offline.
    pub async fn discovery(&self) -> String {
        let request = ChatRequest {
            prompt: DISCOVERY_PROMPT.to_string(),
            system_instruction: None,
            use_search: true,
        };
        match self.ask(request).await {
            Ok(text) => {
                if let Err(e) = self.store.put(DISCOVERY_CACHE_KEY, Value::String(text.clone())).await {
                    warn!("Failed to cache discovery info: {}", e);
                }
                text
            }
            Err(e) => {
                warn!("Discovery advisory failed: {}", e);
                match self.store.get(DISCOVERY_CACHE_KEY).await {
                    Ok(Some(Value::String(cached))) => cached,
                    _ => DISCOVERY_FALLBACK.to_string(),
                }
            }
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::store::MemoryStore;
    use std::sync::Mutex;

    /// Scripted backend: pops replies in order, records prompts.
    pub(crate) struct ScriptedBackend {
        replies: Mutex<Vec<AppResult<String>>>,
        pub(crate) requests: Mutex<Vec<ChatRequest>>,
        reachable: bool,
        delay: Duration,
    }

    impl ScriptedBackend {
        pub(crate) fn new(replies: Vec<AppResult<String>>) -> Self {
            Self {
                replies: Mutex::new(replies),
                requests: Mutex::new(Vec::new()),
                reachable: true,
                delay: Duration::ZERO,
            }
        }

        pub(crate) fn with_delay(mut self, delay: Duration) -> Self {
            self.delay = delay;
            self
        }
    }

    #[async_trait]
    impl ChatBackend for ScriptedBackend {
        async fn generate(&self, request: ChatRequest) -> AppResult<String> {
            if !self.delay.is_zero() {
                tokio::time::sleep(self.delay).await;
            }
            self.requests.lock().unwrap().push(request);
            let mut replies = self.replies.lock().unwrap();
            if replies.is_empty() {
                return Err(AppError::NetworkFailure("script exhausted".to_string()));
            }
            replies.remove(0)
        }

        async fn probe(&self) -> AppResult<()> {
            if self.reachable {
                Ok(())
            } else {
                Err(AppError::NetworkFailure("unreachable".to_string()))
            }
        }
    }

    fn gateway(backend: Option<Arc<dyn ChatBackend>>) -> AdvisoryGateway {
        let store: Arc<dyn RecordStore> = Arc::new(MemoryStore::new());
        AdvisoryGateway::new(
            backend,
            Arc::new(RouteCatalog::builtin()),
            Arc::new(LearningService::new(store.clone())),
            store,
            Duration::from_secs(5),
        )
    }

    #[test]
    fn clean_text_strips_markdown() {
        assert_eq!(
            clean_text("  ## **Bus 36** takes you `there` __now__ * ok  "),
            "Bus 36 takes you there now  ok"
        );
        assert_eq!(clean_text("snake_case stays"), "snake_case stays");
    }

    #[test]
    fn response_text_joins_parts() {
        let body = json!({"candidates":[{"content":{"parts":[{"text":"a"},{"text":"b"}]}}]});
        assert_eq!(response_text(&body).unwrap(), "ab");
        assert!(response_text(&json!({})).is_err());
    }

    #[test]
    fn request_body_includes_optional_sections() {
        let body = request_body(&ChatRequest {
            prompt: "hi".to_string(),
            system_instruction: Some("sys".to_string()),
            use_search: true,
        });
        assert_eq!(body["contents"][0]["parts"][0]["text"], "hi");
        assert_eq!(body["systemInstruction"]["parts"][0]["text"], "sys");
        assert!(body["tools"].is_array());
    }

    #[tokio::test]
    async fn suggestion_is_cleaned_and_carries_context() {
        let backend = Arc::new(ScriptedBackend::new(vec![Ok("**Take bus 36**".to_string())]));
        let gw = gateway(Some(backend.clone()));
        assert_eq!(gw.suggest_route("Hledan", "Sule").await, "Take bus 36");

        let requests = backend.requests.lock().unwrap();
        assert!(requests[0].prompt.contains("Bus 36:"));
        assert!(requests[0].prompt.contains("from \"Hledan\" to \"Sule\""));
        assert!(!requests[0].use_search);
    }

    #[tokio::test]
    async fn failures_fall_back_to_bilingual_text() {
        let backend = Arc::new(ScriptedBackend::new(vec![
            Err(AppError::NetworkFailure("down".to_string())),
            Ok("  ** ".to_string()),
        ]));
        let gw = gateway(Some(backend));
        assert_eq!(gw.suggest_route("a", "b").await, ROUTE_FALLBACK);
        assert_eq!(gw.chat("hello").await, CHAT_FALLBACK);
    }

    #[tokio::test]
    async fn missing_backend_is_unavailable() {
        let gw = gateway(None);
        assert_eq!(gw.availability().await, None);
        assert!(!gw.probe().await);
        assert_eq!(gw.availability().await, Some(false));
        assert_eq!(gw.chat("hi").await, CHAT_FALLBACK);
    }

    #[tokio::test]
    async fn probe_result_is_cached() {
        let gw = gateway(Some(Arc::new(ScriptedBackend::new(vec![]))));
        assert!(gw.probe().await);
        assert_eq!(gw.availability().await, Some(true));
    }

    #[tokio::test]
    async fn discovery_serves_cache_when_offline() {
        let backend = Arc::new(ScriptedBackend::new(vec![
            Ok("Rainy today, bring an umbrella".to_string()),
            Err(AppError::Timeout("slow".to_string())),
        ]));
        let gw = gateway(Some(backend));
        assert_eq!(gw.discovery().await, "Rainy today, bring an umbrella");
        assert_eq!(gw.discovery().await, "Rainy today, bring an umbrella");
        assert_eq!(gateway(None).discovery().await, DISCOVERY_FALLBACK);
    }

    #[tokio::test(start_paused = true)]
    async fn slow_backend_times_out() {
        struct Stalled;

        #[async_trait]
        impl ChatBackend for Stalled {
            async fn generate(&self, _request: ChatRequest) -> AppResult<String> {
                tokio::time::sleep(Duration::from_secs(3600)).await;
                Ok("late".to_string())
            }
            async fn probe(&self) -> AppResult<()> {
                Ok(())
            }
        }

        let gw = gateway(Some(Arc::new(Stalled)));
        assert_eq!(gw.suggest_route("a", "b").await, ROUTE_FALLBACK);
    }
}
