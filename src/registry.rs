//! In-memory key pool shared by the dispatcher, the refresh collector and
//! the management API.
//!
//! Every entry lives behind a single reader/writer lock. Readers get cloned
//! snapshots, so scoring and reporting never hold the lock while they work,
//! and writers replace whole fields under exclusive access so nobody observes
//! a half-updated key.

use std::collections::HashMap;
use std::sync::{PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use chrono::Utc;
use serde::Serialize;
use thiserror::Error;

/// Balance at which the balance term of [`ApiKey::score`] reaches one half.
const SCORE_BALANCE_MIDPOINT: f64 = 10.0;
/// Requests per minute at which the RPM pressure term halves.
const SCORE_RPM_MIDPOINT: f64 = 60.0;
/// Tokens per minute at which the TPM pressure term halves.
const SCORE_TPM_MIDPOINT: f64 = 50_000.0;

const SCORE_WEIGHT_SUCCESS: f64 = 0.4;
const SCORE_WEIGHT_BALANCE: f64 = 0.3;
const SCORE_WEIGHT_RPM: f64 = 0.15;
const SCORE_WEIGHT_TPM: f64 = 0.15;

/// One upstream credential and its live metrics.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ApiKey {
    /// Short public identifier used by the management API.
    pub id: String,
    /// Secret sent upstream. Unique within the registry.
    pub key: String,
    pub enabled: bool,
    pub balance: f64,
    pub requests_per_minute: u32,
    pub tokens_per_minute: u64,
    pub success_count: u64,
    pub failure_count: u64,
    /// Unix seconds, 0 when the key was never used.
    pub last_used_at: i64,
    pub balance_checked_at: Option<i64>,
    pub created_at: i64,
}

impl ApiKey {
    pub fn new(id: impl Into<String>, key: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            key: key.into(),
            enabled: true,
            balance: 0.0,
            requests_per_minute: 0,
            tokens_per_minute: 0,
            success_count: 0,
            failure_count: 0,
            last_used_at: 0,
            balance_checked_at: None,
            created_at: Utc::now().timestamp(),
        }
    }

    /// Share of successful attempts. A key that was never tried counts as
    /// fully reliable so new keys get picked up.
    pub fn success_rate(&self) -> f64 {
        let attempts = self.success_count.saturating_add(self.failure_count);
        if attempts == 0 {
            return 1.0;
        }
        (self.success_count as f64 / attempts as f64).clamp(0.0, 1.0)
    }

    /// Composite ranking value in `[0, 1]`.
    ///
    /// Weighted sum of the success rate, a saturating balance term
    /// `b / (b + 10)` and two pressure terms `1 / (1 + rate / midpoint)` for
    /// RPM and TPM. Each input moves the score in one direction only: higher
    /// success rate or balance raises it, higher RPM or TPM lowers it.
    pub fn score(&self) -> f64 {
        let balance = self.balance.max(0.0);
        let balance_term = balance / (balance + SCORE_BALANCE_MIDPOINT);
        let rpm_term = 1.0 / (1.0 + f64::from(self.requests_per_minute) / SCORE_RPM_MIDPOINT);
        let tpm_term = 1.0 / (1.0 + self.tokens_per_minute as f64 / SCORE_TPM_MIDPOINT);

        SCORE_WEIGHT_SUCCESS * self.success_rate()
            + SCORE_WEIGHT_BALANCE * balance_term
            + SCORE_WEIGHT_RPM * rpm_term
            + SCORE_WEIGHT_TPM * tpm_term
    }

    /// Log-safe prefix of the secret.
    pub fn preview(&self) -> String {
        preview_key(&self.key)
    }
}

/// Rolling-window usage figures pushed into the registry.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct UsageSample {
    pub requests_per_minute: u32,
    pub tokens_per_minute: u64,
}

#[derive(Debug, Clone, Copy, Error, PartialEq, Eq)]
pub enum RegistryError {
    #[error("API key not found")]
    NotFound,
    #[error("API key already registered")]
    Duplicate,
}

#[derive(Debug, Default)]
struct Entries {
    order: Vec<String>,
    by_key: HashMap<String, ApiKey>,
}

#[derive(Debug, Default)]
pub struct KeyRegistry {
    entries: RwLock<Entries>,
}

impl KeyRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builds a registry from persisted keys. Later duplicates of the same
    /// secret are ignored.
    pub fn from_keys<I>(keys: I) -> Self
    where
        I: IntoIterator<Item = ApiKey>,
    {
        let registry = Self::new();
        for key in keys {
            let _ = registry.insert(key);
        }
        registry
    }

    /// Snapshot of every key in insertion order.
    pub fn list(&self) -> Vec<ApiKey> {
        let entries = self.read();
        entries
            .order
            .iter()
            .filter_map(|key| entries.by_key.get(key).cloned())
            .collect()
    }

    pub fn get(&self, key: &str) -> Result<ApiKey, RegistryError> {
        self.read()
            .by_key
            .get(key)
            .cloned()
            .ok_or(RegistryError::NotFound)
    }

    pub fn find_by_id(&self, id: &str) -> Option<ApiKey> {
        self.read().by_key.values().find(|k| k.id == id).cloned()
    }

    pub fn len(&self) -> usize {
        self.read().order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn enabled_count(&self) -> usize {
        self.read().by_key.values().filter(|k| k.enabled).count()
    }

    pub fn insert(&self, key: ApiKey) -> Result<(), RegistryError> {
        let mut entries = self.write();
        if entries.by_key.contains_key(&key.key) {
            return Err(RegistryError::Duplicate);
        }
        entries.order.push(key.key.clone());
        entries.by_key.insert(key.key.clone(), key);
        Ok(())
    }

    pub fn remove(&self, key: &str) -> Result<ApiKey, RegistryError> {
        let mut entries = self.write();
        let removed = entries.by_key.remove(key).ok_or(RegistryError::NotFound)?;
        entries.order.retain(|k| k != key);
        Ok(removed)
    }

    pub fn set_enabled(&self, key: &str, enabled: bool) -> Result<(), RegistryError> {
        self.with_entry(key, |entry| entry.enabled = enabled)
    }

    pub fn update_usage(&self, key: &str, sample: UsageSample) -> Result<(), RegistryError> {
        self.with_entry(key, |entry| {
            entry.requests_per_minute = sample.requests_per_minute;
            entry.tokens_per_minute = sample.tokens_per_minute;
        })
    }

    /// Moves `last_used_at` forward. Older timestamps are ignored so a slow
    /// attempt finishing late cannot make a key look idle.
    pub fn update_last_used(&self, key: &str, timestamp: i64) -> Result<(), RegistryError> {
        self.with_entry(key, |entry| {
            entry.last_used_at = entry.last_used_at.max(timestamp);
        })
    }

    pub fn update_balance(&self, key: &str, balance: f64) -> Result<(), RegistryError> {
        let checked_at = Utc::now().timestamp();
        self.with_entry(key, |entry| {
            entry.balance = sanitize_balance(balance);
            entry.balance_checked_at = Some(checked_at);
        })
    }

    pub fn record_success(&self, key: &str, timestamp: i64) -> Result<(), RegistryError> {
        self.with_entry(key, |entry| {
            entry.success_count = entry.success_count.saturating_add(1);
            entry.last_used_at = entry.last_used_at.max(timestamp);
        })
    }

    pub fn record_failure(&self, key: &str, timestamp: i64) -> Result<(), RegistryError> {
        self.with_entry(key, |entry| {
            entry.failure_count = entry.failure_count.saturating_add(1);
            entry.last_used_at = entry.last_used_at.max(timestamp);
        })
    }

    fn with_entry<T>(
        &self,
        key: &str,
        apply: impl FnOnce(&mut ApiKey) -> T,
    ) -> Result<T, RegistryError> {
        let mut entries = self.write();
        let entry = entries.by_key.get_mut(key).ok_or(RegistryError::NotFound)?;
        Ok(apply(entry))
    }

    fn read(&self) -> RwLockReadGuard<'_, Entries> {
        self.entries.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, Entries> {
        self.entries.write().unwrap_or_else(PoisonError::into_inner)
    }
}

fn sanitize_balance(balance: f64) -> f64 {
    if balance.is_finite() { balance.max(0.0) } else { 0.0 }
}

pub(crate) fn preview_key(key: &str) -> String {
    let shown = key
        .char_indices()
        .nth(6)
        .map(|(idx, _)| idx)
        .unwrap_or(key.len());
    format!("{}…", &key[..shown])
}
