//! Transit card ledger: balance, append-only transaction log, reminder settings.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::{error, info, warn};

use crate::errors::{AppError, AppResult};
use crate::store::{RecordStore, CARD_BALANCE_KEY, CARD_SETTINGS_KEY, CARD_TRANSACTIONS_KEY};

pub const DEFAULT_CURRENCY: &str = "MMK";
pub const DEFAULT_REMINDER_THRESHOLD: f64 = 1000.0;
const THRESHOLD_SPENDING_FACTOR: f64 = 1.5;
const SECONDS_PER_DAY: i64 = 60 * 60 * 24;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TxKind {
    Topup,
    Deduct,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CardBalance {
    pub balance: f64,
    pub last_updated: DateTime<Utc>,
    pub currency: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CardTransaction {
    pub id: String,
    pub amount: f64,
    #[serde(rename = "type")]
    pub kind: TxKind,
    pub description: String,
    pub timestamp: DateTime<Utc>,
    pub balance_after: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CardSettings {
    pub reminder_threshold: f64,
    pub average_daily_spending: f64,
    pub auto_calculate_average: bool,
}

impl Default for CardSettings {
    fn default() -> Self {
        Self {
            reminder_threshold: DEFAULT_REMINDER_THRESHOLD,
            average_daily_spending: 0.0,
            auto_calculate_average: true,
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct SettingsPatch {
    pub reminder_threshold: Option<f64>,
    pub average_daily_spending: Option<f64>,
    pub auto_calculate_average: Option<bool>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LowBalance {
    pub is_low: bool,
    pub message: String,
}

impl LowBalance {
    fn fine() -> Self {
        Self {
            is_low: false,
            message: String::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Insights {
    pub total_spent: f64,
    pub total_topups: f64,
    pub transaction_count: usize,
    pub avg_daily_spending: f64,
}

fn check_amount(amount: f64) -> AppResult<()> {
    if !amount.is_finite() || amount <= 0.0 {
        return Err(AppError::ValidationFailure(format!(
            "amount must be a positive number, got {}",
            amount
        )));
    }
    Ok(())
}

/// Average spend per day over the span of recorded deductions.
///
/// The span is whole days between the oldest and newest deduction, at least one.
pub fn average_daily_spending(transactions: &[CardTransaction]) -> f64 {
    let deductions: Vec<&CardTransaction> = transactions
        .iter()
        .filter(|t| t.kind == TxKind::Deduct)
        .collect();
    let (Some(oldest), Some(newest)) = (
        deductions.iter().map(|t| t.timestamp).min(),
        deductions.iter().map(|t| t.timestamp).max(),
    ) else {
        return 0.0;
    };
    let days = ((newest - oldest).num_seconds() / SECONDS_PER_DAY).max(1);
    let total: f64 = deductions.iter().map(|t| t.amount).sum();
    total / days as f64
}

fn low_balance_message(balance: &CardBalance, avg: f64) -> String {
    if avg > 0.0 {
        let days_left = (balance.balance / avg).floor() as i64;
        match days_left {
            0 => "Your balance may not be enough for today. Consider topping up soon.".to_string(),
            1 => format!(
                "Your balance may be low for tomorrow. You have approximately {} {} left.",
                balance.balance, balance.currency
            ),
            n => format!(
                "Your balance is running low. Based on your usage, you have about {} days left.",
                n
            ),
        }
    } else {
        format!(
            "Your balance is low ({} {}). Consider topping up soon.",
            balance.balance, balance.currency
        )
    }
}

pub struct CardLedger {
    store: Arc<dyn RecordStore>,
    // serializes read-modify-write of balance + log
    write_lock: Mutex<()>,
    tx_seq: AtomicU64,
}

impl CardLedger {
    pub fn new(store: Arc<dyn RecordStore>) -> Self {
        Self {
            store,
            write_lock: Mutex::new(()),
            tx_seq: AtomicU64::new(0),
        }
    }

    pub async fn balance(&self) -> Option<CardBalance> {
        match self.store.get(CARD_BALANCE_KEY).await {
            Ok(Some(value)) => match serde_json::from_value(value) {
                Ok(balance) => Some(balance),
                Err(e) => {
                    error!("Stored card balance is unreadable: {}", e);
                    None
                }
            },
            Ok(None) => None,
            Err(e) => {
                error!("Error getting card balance: {}", e);
                None
            }
        }
    }

    pub async fn set_balance(&self, balance: f64, currency: Option<&str>) -> AppResult<CardBalance> {
        if !balance.is_finite() || balance < 0.0 {
            return Err(AppError::ValidationFailure(
                "balance must be a non-negative number".to_string(),
            ));
        }
        let _guard = self.write_lock.lock().await;
        let currency = match currency {
            Some(c) => c.to_string(),
            None => self
                .balance()
                .await
                .map(|b| b.currency)
                .unwrap_or_else(|| DEFAULT_CURRENCY.to_string()),
        };
        self.write_balance(balance, currency, Utc::now()).await
    }

    async fn write_balance(&self, balance: f64, currency: String, now: DateTime<Utc>) -> AppResult<CardBalance> {
        let record = CardBalance {
            balance,
            last_updated: now,
            currency,
        };
        self.store
            .put(CARD_BALANCE_KEY, serde_json::to_value(&record)?)
            .await?;
        Ok(record)
    }

    pub async fn apply_transaction(&self, amount: f64, kind: TxKind, description: &str) -> AppResult<f64> {
        self.apply_transaction_at(amount, kind, description, Utc::now())
            .await
    }

    /// Top up or deduct, returning the new balance.
    ///
    /// A deduction that would go below zero is rejected with
    /// `ValidationFailure` and leaves both balance and log untouched.
    /// If the log entry cannot be stored the previous balance is put back.
    pub async fn apply_transaction_at(
        &self,
        amount: f64,
        kind: TxKind,
        description: &str,
        now: DateTime<Utc>,
    ) -> AppResult<f64> {
        check_amount(amount)?;
        let _guard = self.write_lock.lock().await;

        let current = self.balance().await;
        let old_balance = current.as_ref().map(|b| b.balance).unwrap_or(0.0);
        let new_balance = match kind {
            TxKind::Topup => old_balance + amount,
            TxKind::Deduct => old_balance - amount,
        };
        if new_balance < 0.0 {
            warn!("Rejected deduction of {} from balance {}", amount, old_balance);
            return Err(AppError::ValidationFailure("Insufficient balance".to_string()));
        }

        let previous = self.store.get(CARD_BALANCE_KEY).await?;
        let currency = current
            .map(|b| b.currency)
            .unwrap_or_else(|| DEFAULT_CURRENCY.to_string());
        self.write_balance(new_balance, currency, now).await?;

        let seq = self.tx_seq.fetch_add(1, Ordering::Relaxed);
        let tx = CardTransaction {
            id: format!("tx-{}-{}", now.timestamp_millis(), seq),
            amount,
            kind,
            description: description.to_string(),
            timestamp: now,
            balance_after: new_balance,
        };
        if let Err(e) = self
            .store
            .append(CARD_TRANSACTIONS_KEY, serde_json::to_value(&tx)?)
            .await
        {
            error!("Failed to log transaction {}, restoring balance {}: {}", tx.id, old_balance, e);
            let restored = match previous {
                Some(value) => self.store.put(CARD_BALANCE_KEY, value).await,
                None => self.store.clear(CARD_BALANCE_KEY).await,
            };
            if let Err(restore_err) = restored {
                error!("Failed to restore card balance: {}", restore_err);
            }
            return Err(e);
        }
        info!("Applied {:?} of {} ({}), balance now {}", kind, amount, description, new_balance);
        Ok(new_balance)
    }

    /// Newest first.
    pub async fn transactions(&self, limit: Option<usize>) -> Vec<CardTransaction> {
        let raw = match self.store.list(CARD_TRANSACTIONS_KEY).await {
            Ok(raw) => raw,
            Err(e) => {
                error!("Error getting transactions: {}", e);
                return Vec::new();
            }
        };
        let mut txs: Vec<CardTransaction> = raw
            .into_iter()
            .filter_map(|v| serde_json::from_value(v).ok())
            .collect();
        txs.sort_by(|a, b| b.timestamp.cmp(&a.timestamp));
        if let Some(limit) = limit {
            txs.truncate(limit);
        }
        txs
    }

    pub async fn clear_transactions(&self) -> AppResult<()> {
        let _guard = self.write_lock.lock().await;
        self.store.clear(CARD_TRANSACTIONS_KEY).await
    }

    pub async fn settings(&self) -> CardSettings {
        match self.store.get(CARD_SETTINGS_KEY).await {
            Ok(Some(value)) => serde_json::from_value(value).unwrap_or_else(|e| {
                warn!("Card settings unreadable, using defaults: {}", e);
                CardSettings::default()
            }),
            Ok(None) => CardSettings::default(),
            Err(e) => {
                error!("Error getting card settings: {}", e);
                CardSettings::default()
            }
        }
    }

    pub async fn update_settings(&self, patch: SettingsPatch) -> AppResult<CardSettings> {
        let mut settings = self.settings().await;
        if let Some(threshold) = patch.reminder_threshold {
            if !threshold.is_finite() || threshold < 0.0 {
                return Err(AppError::ValidationFailure(
                    "reminder threshold must be a non-negative number".to_string(),
                ));
            }
            settings.reminder_threshold = threshold;
        }
        if let Some(avg) = patch.average_daily_spending {
            if !avg.is_finite() || avg < 0.0 {
                return Err(AppError::ValidationFailure(
                    "average daily spending must be a non-negative number".to_string(),
                ));
            }
            settings.average_daily_spending = avg;
        }
        if let Some(auto) = patch.auto_calculate_average {
            settings.auto_calculate_average = auto;
        }
        self.store
            .put(CARD_SETTINGS_KEY, serde_json::to_value(&settings)?)
            .await?;
        Ok(settings)
    }

    pub async fn average_daily_spending(&self) -> f64 {
        average_daily_spending(&self.transactions(None).await)
    }

    /// Low-balance check with an advisory message.
    ///
    /// With auto-calculation on, the threshold is raised to 1.5x the average
    /// daily spend when that is higher, and the computed average is stored
    /// back into the settings.
    pub async fn low_balance(&self) -> LowBalance {
        let Some(balance) = self.balance().await else {
            return LowBalance::fine();
        };
        let settings = self.settings().await;

        let mut threshold = settings.reminder_threshold;
        let mut avg = settings.average_daily_spending;
        if settings.auto_calculate_average {
            avg = self.average_daily_spending().await;
            if avg > 0.0 {
                threshold = threshold.max(avg * THRESHOLD_SPENDING_FACTOR);
                let patch = SettingsPatch {
                    average_daily_spending: Some(avg),
                    ..Default::default()
                };
                if let Err(e) = self.update_settings(patch).await {
                    warn!("Failed to store computed daily average: {}", e);
                }
            }
        }

        if balance.balance >= threshold {
            return LowBalance::fine();
        }
        LowBalance {
            is_low: true,
            message: low_balance_message(&balance, avg),
        }
    }

    pub async fn insights(&self) -> Insights {
        let txs = self.transactions(None).await;
        let sum_of = |kind: TxKind| -> f64 {
            txs.iter().filter(|t| t.kind == kind).map(|t| t.amount).sum()
        };
        Insights {
            total_spent: sum_of(TxKind::Deduct),
            total_topups: sum_of(TxKind::Topup),
            transaction_count: txs.len(),
            avg_daily_spending: average_daily_spending(&txs),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;
    use chrono::{Duration, TimeZone};

    fn ledger() -> CardLedger {
        CardLedger::new(Arc::new(MemoryStore::new()))
    }

    fn day(n: i64) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 1, 8, 0, 0).unwrap() + Duration::days(n)
    }

    #[tokio::test]
    async fn overdraft_is_rejected_without_side_effects() {
        let ledger = ledger();
        ledger.set_balance(1000.0, None).await.unwrap();

        let err = ledger
            .apply_transaction(1500.0, TxKind::Deduct, "ride")
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::ValidationFailure(_)));
        assert_eq!(ledger.balance().await.unwrap().balance, 1000.0);
        assert!(ledger.transactions(None).await.is_empty());
    }

    #[tokio::test]
    async fn topup_and_deduct_are_logged() {
        let ledger = ledger();
        assert_eq!(ledger.apply_transaction_at(3000.0, TxKind::Topup, "kiosk", day(0)).await.unwrap(), 3000.0);
        assert_eq!(ledger.apply_transaction_at(200.0, TxKind::Deduct, "bus 36", day(1)).await.unwrap(), 2800.0);

        let txs = ledger.transactions(None).await;
        assert_eq!(txs.len(), 2);
        assert_eq!(txs[0].kind, TxKind::Deduct);
        assert_eq!(txs[0].balance_after, 2800.0);
        assert_eq!(txs[1].description, "kiosk");
        assert_ne!(txs[0].id, txs[1].id);
        assert_eq!(ledger.transactions(Some(1)).await.len(), 1);
        assert_eq!(ledger.balance().await.unwrap().currency, DEFAULT_CURRENCY);
    }

    /// Memory store whose transaction log refuses every write.
    struct LogRejectingStore(MemoryStore);

    #[async_trait::async_trait]
    impl RecordStore for LogRejectingStore {
        async fn get(&self, key: &str) -> AppResult<Option<serde_json::Value>> {
            self.0.get(key).await
        }
        async fn put(&self, key: &str, value: serde_json::Value) -> AppResult<()> {
            self.0.put(key, value).await
        }
        async fn append(&self, _key: &str, _value: serde_json::Value) -> AppResult<()> {
            Err(AppError::Store("disk full".to_string()))
        }
        async fn list(&self, key: &str) -> AppResult<Vec<serde_json::Value>> {
            self.0.list(key).await
        }
        async fn clear(&self, key: &str) -> AppResult<()> {
            self.0.clear(key).await
        }
    }

    #[tokio::test]
    async fn unlogged_transaction_restores_balance() {
        let ledger = CardLedger::new(Arc::new(LogRejectingStore(MemoryStore::new())));
        assert!(ledger.apply_transaction_at(500.0, TxKind::Topup, "kiosk", day(0)).await.is_err());
        assert!(ledger.balance().await.is_none());

        ledger.set_balance(1000.0, None).await.unwrap();
        assert!(ledger.apply_transaction_at(200.0, TxKind::Deduct, "bus 36", day(1)).await.is_err());
        assert_eq!(ledger.balance().await.unwrap().balance, 1000.0);
        assert!(ledger.transactions(None).await.is_empty());
    }

    #[tokio::test]
    async fn deducting_exact_balance_is_allowed() {
        let ledger = ledger();
        ledger.set_balance(400.0, None).await.unwrap();
        assert_eq!(ledger.apply_transaction(400.0, TxKind::Deduct, "ride").await.unwrap(), 0.0);
    }

    #[tokio::test]
    async fn invalid_amounts_are_rejected() {
        let ledger = ledger();
        for amount in [0.0, -5.0, f64::NAN] {
            assert!(matches!(
                ledger.apply_transaction(amount, TxKind::Topup, "x").await,
                Err(AppError::ValidationFailure(_))
            ));
        }
    }

    #[test]
    fn average_spans_whole_days_between_deductions() {
        let tx = |amount: f64, kind: TxKind, at: DateTime<Utc>| CardTransaction {
            id: String::new(),
            amount,
            kind,
            description: String::new(),
            timestamp: at,
            balance_after: 0.0,
        };
        let txs = vec![
            tx(200.0, TxKind::Deduct, day(0)),
            tx(5000.0, TxKind::Topup, day(2)),
            tx(400.0, TxKind::Deduct, day(4)),
        ];
        assert_eq!(average_daily_spending(&txs), 150.0);
        // same-day deductions divide by one
        let same_day = vec![tx(200.0, TxKind::Deduct, day(0)), tx(300.0, TxKind::Deduct, day(0))];
        assert_eq!(average_daily_spending(&same_day), 500.0);
        assert_eq!(average_daily_spending(&[]), 0.0);
    }

    #[tokio::test]
    async fn no_balance_means_not_low() {
        assert_eq!(ledger().low_balance().await, LowBalance::fine());
    }

    #[tokio::test]
    async fn low_balance_without_history_uses_plain_message() {
        let ledger = ledger();
        ledger.set_balance(500.0, None).await.unwrap();
        let status = ledger.low_balance().await;
        assert!(status.is_low);
        assert_eq!(status.message, "Your balance is low (500 MMK). Consider topping up soon.");
    }

    #[tokio::test]
    async fn auto_threshold_rises_with_spending() {
        let ledger = ledger();
        ledger.apply_transaction_at(5000.0, TxKind::Topup, "kiosk", day(0)).await.unwrap();
        ledger.apply_transaction_at(1000.0, TxKind::Deduct, "rides", day(0)).await.unwrap();
        ledger.apply_transaction_at(1000.0, TxKind::Deduct, "rides", day(1)).await.unwrap();
        // average 2000/day, threshold 3000, balance 3000 -> not low
        assert!(!ledger.low_balance().await.is_low);
        assert_eq!(ledger.settings().await.average_daily_spending, 2000.0);

        ledger.apply_transaction_at(500.0, TxKind::Deduct, "ride", day(1)).await.unwrap();
        // average 2500/day, balance 2500 -> one day left
        let status = ledger.low_balance().await;
        assert!(status.is_low);
        assert!(status.message.contains("tomorrow"), "{}", status.message);
    }

    #[tokio::test]
    async fn message_tiers_follow_days_left() {
        let ledger = ledger();
        ledger.apply_transaction_at(1200.0, TxKind::Topup, "kiosk", day(0)).await.unwrap();
        ledger.apply_transaction_at(600.0, TxKind::Deduct, "rides", day(0)).await.unwrap();
        ledger.apply_transaction_at(300.0, TxKind::Deduct, "rides", day(3)).await.unwrap();
        // average 300/day, balance 300 -> 1 day; bump threshold so it counts as low
        ledger
            .update_settings(SettingsPatch {
                reminder_threshold: Some(5000.0),
                ..Default::default()
            })
            .await
            .unwrap();
        assert!(ledger.low_balance().await.message.contains("tomorrow"));

        ledger.set_balance(1000.0, None).await.unwrap();
        assert!(ledger.low_balance().await.message.contains("about 3 days left"));

        ledger.set_balance(100.0, None).await.unwrap();
        assert!(ledger.low_balance().await.message.contains("not be enough for today"));
    }

    #[tokio::test]
    async fn manual_mode_uses_raw_threshold() {
        let ledger = ledger();
        ledger.apply_transaction_at(1500.0, TxKind::Topup, "kiosk", day(0)).await.unwrap();
        ledger.apply_transaction_at(400.0, TxKind::Deduct, "rides", day(0)).await.unwrap();
        ledger
            .update_settings(SettingsPatch {
                auto_calculate_average: Some(false),
                average_daily_spending: Some(1000.0),
                ..Default::default()
            })
            .await
            .unwrap();
        // balance 1100 >= 1000 threshold even though 1.5x average would be 1500
        assert!(!ledger.low_balance().await.is_low);
    }

    #[tokio::test]
    async fn settings_default_and_patch() {
        let ledger = ledger();
        assert_eq!(ledger.settings().await, CardSettings::default());
        let updated = ledger
            .update_settings(SettingsPatch {
                reminder_threshold: Some(2000.0),
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(updated.reminder_threshold, 2000.0);
        assert!(updated.auto_calculate_average);
        assert!(ledger
            .update_settings(SettingsPatch {
                reminder_threshold: Some(-1.0),
                ..Default::default()
            })
            .await
            .is_err());
    }

    #[tokio::test]
    async fn insights_sum_by_kind() {
        let ledger = ledger();
        ledger.apply_transaction_at(3000.0, TxKind::Topup, "kiosk", day(0)).await.unwrap();
        ledger.apply_transaction_at(200.0, TxKind::Deduct, "ride", day(0)).await.unwrap();
        ledger.apply_transaction_at(400.0, TxKind::Deduct, "ride", day(2)).await.unwrap();
        let insights = ledger.insights().await;
        assert_eq!(insights.total_spent, 600.0);
        assert_eq!(insights.total_topups, 3000.0);
        assert_eq!(insights.transaction_count, 3);
        assert_eq!(insights.avg_daily_spending, 300.0);

        ledger.clear_transactions().await.unwrap();
        assert_eq!(ledger.insights().await.transaction_count, 0);
    }
}
