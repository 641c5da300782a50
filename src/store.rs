//! Keyed record store standing in for the browser's local storage.
//!
//! One handle is created per process and shared as `Arc<dyn RecordStore>`.
//! Append-only logs are stored as a JSON array under their key.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::Mutex;
use tracing::{debug, info};

use crate::errors::{AppError, AppResult};

pub const CARD_BALANCE_KEY: &str = "ybs_card_balance";
pub const CARD_TRANSACTIONS_KEY: &str = "ybs_card_transactions";
pub const CARD_SETTINGS_KEY: &str = "ybs_card_settings";
pub const SAVED_TRIPS_KEY: &str = "ybs_saved_trips";
pub const LEARNING_DATA_KEY: &str = "ybs_learning_data";
pub const DISCOVERY_CACHE_KEY: &str = "ybs_discovery_cache";

#[async_trait]
pub trait RecordStore: Send + Sync {
    async fn get(&self, key: &str) -> AppResult<Option<Value>>;
    async fn put(&self, key: &str, value: Value) -> AppResult<()>;
    async fn append(&self, key: &str, value: Value) -> AppResult<()>;
    async fn list(&self, key: &str) -> AppResult<Vec<Value>>;
    async fn clear(&self, key: &str) -> AppResult<()>;
}

fn append_to(records: &mut HashMap<String, Value>, key: &str, value: Value) -> AppResult<()> {
    let slot = records
        .entry(key.to_string())
        .or_insert_with(|| Value::Array(Vec::new()));
    match slot {
        Value::Array(items) => {
            items.push(value);
            Ok(())
        }
        _ => Err(AppError::Store(format!("record '{}' is not a log", key))),
    }
}

fn list_of(records: &HashMap<String, Value>, key: &str) -> AppResult<Vec<Value>> {
    match records.get(key) {
        None => Ok(Vec::new()),
        Some(Value::Array(items)) => Ok(items.clone()),
        Some(_) => Err(AppError::Store(format!("record '{}' is not a log", key))),
    }
}

#[derive(Default)]
pub struct MemoryStore {
    records: Mutex<HashMap<String, Value>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl RecordStore for MemoryStore {
    async fn get(&self, key: &str) -> AppResult<Option<Value>> {
        Ok(self.records.lock().await.get(key).cloned())
    }

    async fn put(&self, key: &str, value: Value) -> AppResult<()> {
        self.records.lock().await.insert(key.to_string(), value);
        Ok(())
    }

    async fn append(&self, key: &str, value: Value) -> AppResult<()> {
        append_to(&mut *self.records.lock().await, key, value)
    }

    async fn list(&self, key: &str) -> AppResult<Vec<Value>> {
        list_of(&*self.records.lock().await, key)
    }

    async fn clear(&self, key: &str) -> AppResult<()> {
        self.records.lock().await.remove(key);
        Ok(())
    }
}

/// All records in a single JSON file, rewritten on every change.
///
/// A change becomes visible only after it reached the disk.
pub struct JsonFileStore {
    path: PathBuf,
    records: Mutex<HashMap<String, Value>>,
}

impl JsonFileStore {
    pub async fn open(path: impl AsRef<Path>) -> AppResult<Self> {
        let path = path.as_ref().to_path_buf();
        let records = match tokio::fs::read_to_string(&path).await {
            Ok(text) if text.trim().is_empty() => HashMap::new(),
            Ok(text) => serde_json::from_str(&text)
                .map_err(|e| AppError::Store(format!("{} is corrupt: {}", path.display(), e)))?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                info!("Record store {} does not exist yet, starting empty", path.display());
                HashMap::new()
            }
            Err(e) => return Err(e.into()),
        };
        Ok(Self {
            path,
            records: Mutex::new(records),
        })
    }

    async fn flush(&self, records: &HashMap<String, Value>) -> AppResult<()> {
        let body = serde_json::to_vec_pretty(records)?;
        let tmp = self.path.with_extension("tmp");
        tokio::fs::write(&tmp, body).await?;
        tokio::fs::rename(&tmp, &self.path).await?;
        debug!("Flushed {} records to {}", records.len(), self.path.display());
        Ok(())
    }
}

#[async_trait]
impl RecordStore for JsonFileStore {
    async fn get(&self, key: &str) -> AppResult<Option<Value>> {
        Ok(self.records.lock().await.get(key).cloned())
    }

    async fn put(&self, key: &str, value: Value) -> AppResult<()> {
        let mut records = self.records.lock().await;
        let mut next = records.clone();
        next.insert(key.to_string(), value);
        self.flush(&next).await?;
        *records = next;
        Ok(())
    }

    async fn append(&self, key: &str, value: Value) -> AppResult<()> {
        let mut records = self.records.lock().await;
        let mut next = records.clone();
        append_to(&mut next, key, value)?;
        self.flush(&next).await?;
        *records = next;
        Ok(())
    }

    async fn list(&self, key: &str) -> AppResult<Vec<Value>> {
        list_of(&*self.records.lock().await, key)
    }

    async fn clear(&self, key: &str) -> AppResult<()> {
        let mut records = self.records.lock().await;
        if !records.contains_key(key) {
            return Ok(());
        }
        let mut next = records.clone();
        next.remove(key);
        self.flush(&next).await?;
        *records = next;
        Ok(())
    }
}
