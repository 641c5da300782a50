use anyhow::{bail, Context, Result};
use serde::Serialize;
use std::env;

#[derive(Debug, Clone, Serialize)]
pub struct GeminiConfig {
    #[serde(skip_serializing)]
    pub api_key: String,
    pub model: String,
    pub base_url: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct SupabaseConfig {
    pub url: String,
    #[serde(skip_serializing)]
    pub anon_key: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct AppConfig {
    pub api_host: String,
    pub api_port: u16,
    pub stops_source: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub routes_path: Option<String>,
    pub shapes_base: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub shape_index: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub store_path: Option<String>,
    pub gemini: Option<GeminiConfig>,
    pub supabase: Option<SupabaseConfig>,
    pub http_timeout_secs: u64,
    pub sim_interval_ms: u64,
    pub search_advice_ms: u64,
}

fn non_empty(name: &str) -> Option<String> {
    env::var(name).ok().filter(|v| !v.trim().is_empty())
}

/// Parse a millisecond period that must be strictly positive.
fn positive_millis(name: &str, raw: &str) -> Result<u64> {
    let ms: u64 = raw
        .trim()
        .parse()
        .with_context(|| format!("Failed to parse {}", name))?;
    if ms == 0 {
        bail!("{} must be greater than zero", name);
    }
    Ok(ms)
}

impl AppConfig {
    pub fn from_env() -> Result<Self> {
        let gemini = non_empty("GEMINI_API_KEY").map(|api_key| GeminiConfig {
            api_key,
            model: non_empty("GEMINI_MODEL").unwrap_or_else(|| "gemini-3-flash-preview".to_string()),
            base_url: non_empty("GEMINI_BASE_URL")
                .unwrap_or_else(|| "https://generativelanguage.googleapis.com".to_string()),
        });

        let supabase = match (non_empty("SUPABASE_URL"), non_empty("SUPABASE_ANON_KEY")) {
            (Some(url), Some(anon_key)) => Some(SupabaseConfig { url, anon_key }),
            _ => None,
        };

        Ok(Self {
            api_host: env::var("YBS_API_HOST").unwrap_or_else(|_| "0.0.0.0".to_string()),
            api_port: env::var("YBS_API_PORT")
                .unwrap_or_else(|_| "3030".to_string())
                .parse()
                .context("Failed to parse YBS_API_PORT")?,
            stops_source: env::var("YBS_STOPS_SOURCE")
                .unwrap_or_else(|_| "./data/stops.tsv".to_string()),
            routes_path: non_empty("YBS_ROUTES_PATH"),
            shapes_base: env::var("YBS_SHAPES_BASE")
                .unwrap_or_else(|_| "./data/routes".to_string()),
            shape_index: non_empty("YBS_SHAPE_INDEX"),
            store_path: non_empty("YBS_STORE_PATH"),
            gemini,
            supabase,
            http_timeout_secs: env::var("YBS_HTTP_TIMEOUT_SECS")
                .unwrap_or_else(|_| "20".to_string())
                .parse()
                .context("Failed to parse YBS_HTTP_TIMEOUT_SECS")?,
            sim_interval_ms: positive_millis(
                "YBS_SIM_INTERVAL_MS",
                &env::var("YBS_SIM_INTERVAL_MS").unwrap_or_else(|_| "1500".to_string()),
            )?,
            search_advice_ms: positive_millis(
                "YBS_SEARCH_ADVICE_MS",
                &env::var("YBS_SEARCH_ADVICE_MS").unwrap_or_else(|_| "1500".to_string()),
            )?,
        })
    }

    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.api_host, self.api_port)
    }

    pub fn shapes_are_remote(&self) -> bool {
        self.shapes_base.starts_with("http://") || self.shapes_base.starts_with("https://")
    }
}
