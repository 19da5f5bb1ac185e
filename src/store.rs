//! SQLite persistence for keys, per-attempt request logs and daily totals.
//!
//! The in-memory registry is authoritative while running. The store is
//! loaded once at startup, receives attempt events from a background writer
//! and periodic key metric flushes.

use std::collections::BTreeMap;
use std::sync::Arc;

use nanoid::nanoid;
use serde::Serialize;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::{Row, Sqlite, SqlitePool, Transaction};
use tokio::sync::mpsc::UnboundedReceiver;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use crate::context::{AppContext, AttemptRecord};
use crate::error::ProxyError;
use crate::registry::ApiKey;
use crate::stats::{DailyStats, ModelDaily};

const UNKNOWN_MODEL: &str = "unknown";

#[derive(Debug, Clone, Serialize)]
pub struct RequestLogRecord {
    pub id: i64,
    pub key_id: String,
    pub method: String,
    pub path: String,
    pub model: Option<String>,
    pub status_code: Option<i64>,
    pub outcome: String,
    pub error_message: Option<String>,
    pub tokens: i64,
    pub latency_ms: i64,
    pub attempt: i64,
    pub created_at: i64,
}

#[derive(Debug, Clone)]
pub struct KeyStore {
    pool: SqlitePool,
}

impl KeyStore {
    pub async fn open(database_path: &str) -> Result<Self, ProxyError> {
        let options = SqliteConnectOptions::new()
            .filename(database_path)
            .create_if_missing(true);

        let pool = SqlitePoolOptions::new()
            .min_connections(1)
            .max_connections(5)
            .connect_with(options)
            .await?;

        let store = Self { pool };
        store.initialize_schema().await?;
        Ok(store)
    }

    async fn initialize_schema(&self) -> Result<(), ProxyError> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS api_keys (
                id TEXT PRIMARY KEY,
                api_key TEXT NOT NULL UNIQUE,
                enabled INTEGER NOT NULL DEFAULT 1,
                balance REAL NOT NULL DEFAULT 0,
                success_count INTEGER NOT NULL DEFAULT 0,
                failure_count INTEGER NOT NULL DEFAULT 0,
                last_used_at INTEGER NOT NULL DEFAULT 0,
                balance_checked_at INTEGER,
                created_at INTEGER NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS request_logs (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                api_key_id TEXT NOT NULL,
                method TEXT NOT NULL,
                path TEXT NOT NULL,
                model TEXT,
                status_code INTEGER,
                outcome TEXT NOT NULL,
                error_message TEXT,
                tokens INTEGER NOT NULL DEFAULT 0,
                latency_ms INTEGER NOT NULL DEFAULT 0,
                attempt INTEGER NOT NULL DEFAULT 1,
                created_at INTEGER NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_request_logs_created_at ON request_logs (created_at)",
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS daily_stats (
                day TEXT NOT NULL,
                model TEXT NOT NULL,
                requests INTEGER NOT NULL DEFAULT 0,
                successes INTEGER NOT NULL DEFAULT 0,
                failures INTEGER NOT NULL DEFAULT 0,
                tokens INTEGER NOT NULL DEFAULT 0,
                PRIMARY KEY (day, model)
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn generate_unique_key_id(
        tx: &mut Transaction<'_, Sqlite>,
    ) -> Result<String, ProxyError> {
        loop {
            let candidate = nanoid!(6);
            let exists = sqlx::query_scalar::<_, Option<String>>(
                "SELECT id FROM api_keys WHERE id = ? LIMIT 1",
            )
            .bind(&candidate)
            .fetch_optional(&mut **tx)
            .await?;

            if exists.is_none() {
                return Ok(candidate);
            }
        }
    }

    /// Every persisted key in insertion order.
    pub async fn load_keys(&self) -> Result<Vec<ApiKey>, ProxyError> {
        let rows = sqlx::query(
            r#"
            SELECT
                id,
                api_key,
                enabled,
                balance,
                success_count,
                failure_count,
                last_used_at,
                balance_checked_at,
                created_at
            FROM api_keys
            ORDER BY created_at ASC, rowid ASC
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        let keys = rows
            .into_iter()
            .map(|row| -> Result<ApiKey, sqlx::Error> {
                Ok(ApiKey {
                    id: row.try_get("id")?,
                    key: row.try_get("api_key")?,
                    enabled: row.try_get("enabled")?,
                    balance: row.try_get("balance")?,
                    requests_per_minute: 0,
                    tokens_per_minute: 0,
                    success_count: from_db(row.try_get("success_count")?),
                    failure_count: from_db(row.try_get("failure_count")?),
                    last_used_at: row.try_get("last_used_at")?,
                    balance_checked_at: row.try_get("balance_checked_at")?,
                    created_at: row.try_get("created_at")?,
                })
            })
            .collect::<Result<Vec<_>, _>>()?;

        Ok(keys)
    }

    /// Stores a new key under a fresh short id.
    pub async fn insert_key(&self, secret: &str) -> Result<ApiKey, ProxyError> {
        let secret = secret.trim();
        if secret.is_empty() {
            return Err(ProxyError::EmptyKey);
        }

        let mut tx = self.pool.begin().await?;
        let existing =
            sqlx::query_scalar::<_, String>("SELECT id FROM api_keys WHERE api_key = ? LIMIT 1")
                .bind(secret)
                .fetch_optional(&mut *tx)
                .await?;
        if existing.is_some() {
            return Err(ProxyError::DuplicateKey);
        }

        let id = Self::generate_unique_key_id(&mut tx).await?;
        let key = ApiKey::new(id, secret);
        sqlx::query(
            r#"
            INSERT INTO api_keys (id, api_key, enabled, balance, created_at)
            VALUES (?, ?, 1, 0, ?)
            "#,
        )
        .bind(&key.id)
        .bind(&key.key)
        .bind(key.created_at)
        .execute(&mut *tx)
        .await?;
        tx.commit().await?;

        Ok(key)
    }

    pub async fn delete_key(&self, id: &str) -> Result<bool, ProxyError> {
        let result = sqlx::query("DELETE FROM api_keys WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    pub async fn set_enabled(&self, id: &str, enabled: bool) -> Result<bool, ProxyError> {
        let result = sqlx::query("UPDATE api_keys SET enabled = ? WHERE id = ?")
            .bind(enabled)
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    /// Writes the live metrics of `keys` back. Keys deleted in the meantime
    /// are skipped.
    pub async fn save_key_metrics(&self, keys: &[ApiKey]) -> Result<usize, ProxyError> {
        let mut tx = self.pool.begin().await?;
        let mut saved = 0;
        for key in keys {
            let result = sqlx::query(
                r#"
                UPDATE api_keys
                SET enabled = ?,
                    balance = ?,
                    success_count = ?,
                    failure_count = ?,
                    last_used_at = ?,
                    balance_checked_at = ?
                WHERE id = ?
                "#,
            )
            .bind(key.enabled)
            .bind(key.balance)
            .bind(to_db(key.success_count))
            .bind(to_db(key.failure_count))
            .bind(key.last_used_at)
            .bind(key.balance_checked_at)
            .bind(&key.id)
            .execute(&mut *tx)
            .await?;
            if result.rows_affected() > 0 {
                saved += 1;
            }
        }
        tx.commit().await?;
        Ok(saved)
    }

    /// Appends an attempt to the request log and folds it into its day.
    pub async fn log_attempt(&self, record: &AttemptRecord) -> Result<(), ProxyError> {
        let status_code = record.status.map(i64::from);
        let tokens = to_db(record.tokens);
        let (successes, failures) = if record.outcome.is_success() {
            (1_i64, 0_i64)
        } else {
            (0, 1)
        };

        let mut tx = self.pool.begin().await?;
        sqlx::query(
            r#"
            INSERT INTO request_logs (
                api_key_id,
                method,
                path,
                model,
                status_code,
                outcome,
                error_message,
                tokens,
                latency_ms,
                attempt,
                created_at
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&record.key_id)
        .bind(&record.method)
        .bind(&record.path)
        .bind(record.model.as_deref())
        .bind(status_code)
        .bind(record.outcome.as_str())
        .bind(record.error.as_deref())
        .bind(tokens)
        .bind(record.latency_ms)
        .bind(i64::from(record.attempt))
        .bind(record.created_at)
        .execute(&mut *tx)
        .await?;

        sqlx::query(
            r#"
            INSERT INTO daily_stats (day, model, requests, successes, failures, tokens)
            VALUES (?, ?, 1, ?, ?, ?)
            ON CONFLICT(day, model) DO UPDATE SET
                requests = requests + 1,
                successes = successes + excluded.successes,
                failures = failures + excluded.failures,
                tokens = tokens + excluded.tokens
            "#,
        )
        .bind(&record.day)
        .bind(record.model.as_deref().unwrap_or(UNKNOWN_MODEL))
        .bind(successes)
        .bind(failures)
        .bind(tokens)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(())
    }

    /// Daily totals for days on or after `since` (`%Y-%m-%d`), oldest first.
    pub async fn load_daily_stats(&self, since: &str) -> Result<Vec<DailyStats>, ProxyError> {
        let rows = sqlx::query(
            r#"
            SELECT day, model, requests, successes, failures, tokens
            FROM daily_stats
            WHERE day >= ?
            ORDER BY day ASC, model ASC
            "#,
        )
        .bind(since)
        .fetch_all(&self.pool)
        .await?;

        let mut days: BTreeMap<String, DailyStats> = BTreeMap::new();
        for row in rows {
            let day: String = row.try_get("day")?;
            let model: String = row.try_get("model")?;
            let counts = ModelDaily {
                requests: from_db(row.try_get("requests")?),
                successes: from_db(row.try_get("successes")?),
                failures: from_db(row.try_get("failures")?),
                tokens: from_db(row.try_get("tokens")?),
            };
            let entry = days.entry(day.clone()).or_insert_with(|| DailyStats {
                date: day,
                ..DailyStats::default()
            });
            entry.requests += counts.requests;
            entry.successes += counts.successes;
            entry.failures += counts.failures;
            entry.tokens += counts.tokens;
            entry.models.insert(model, counts);
        }
        Ok(days.into_values().collect())
    }

    pub async fn recent_logs(&self, limit: usize) -> Result<Vec<RequestLogRecord>, ProxyError> {
        let limit = limit.clamp(1, 500) as i64;

        let rows = sqlx::query(
            r#"
            SELECT
                id,
                api_key_id,
                method,
                path,
                model,
                status_code,
                outcome,
                error_message,
                tokens,
                latency_ms,
                attempt,
                created_at
            FROM request_logs
            ORDER BY created_at DESC, id DESC
            LIMIT ?
            "#,
        )
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        let records = rows
            .into_iter()
            .map(|row| -> Result<RequestLogRecord, sqlx::Error> {
                Ok(RequestLogRecord {
                    id: row.try_get("id")?,
                    key_id: row.try_get("api_key_id")?,
                    method: row.try_get("method")?,
                    path: row.try_get("path")?,
                    model: row.try_get("model")?,
                    status_code: row.try_get("status_code")?,
                    outcome: row.try_get("outcome")?,
                    error_message: row.try_get("error_message")?,
                    tokens: row.try_get("tokens")?,
                    latency_ms: row.try_get("latency_ms")?,
                    attempt: row.try_get("attempt")?,
                    created_at: row.try_get("created_at")?,
                })
            })
            .collect::<Result<Vec<_>, _>>()?;

        Ok(records)
    }
}

fn to_db(value: u64) -> i64 {
    i64::try_from(value).unwrap_or(i64::MAX)
}

fn from_db(value: i64) -> u64 {
    u64::try_from(value).unwrap_or(0)
}

/// Persists attempt records until `cancel` fires, then drains what is
/// already queued.
pub async fn run_event_writer(
    store: Arc<KeyStore>,
    mut events: UnboundedReceiver<AttemptRecord>,
    cancel: CancellationToken,
) {
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            record = events.recv() => match record {
                Some(record) => write_event(&store, &record).await,
                None => return,
            },
        }
    }

    events.close();
    let mut drained = 0usize;
    while let Some(record) = events.recv().await {
        write_event(&store, &record).await;
        drained += 1;
    }
    debug!(drained, "request log writer stopped");
}

async fn write_event(store: &KeyStore, record: &AttemptRecord) {
    if let Err(err) = store.log_attempt(record).await {
        error!(key_id = %record.key_id, error = %err, "failed to write request log");
    }
}

/// Flushes registry metrics on the stats interval and once more on
/// cancellation.
pub async fn run_metrics_flusher(store: Arc<KeyStore>, ctx: AppContext, cancel: CancellationToken) {
    loop {
        let interval = ctx.settings.snapshot().stats_refresh_interval();
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = tokio::time::sleep(interval) => flush_metrics(&store, &ctx).await,
        }
    }
    flush_metrics(&store, &ctx).await;
    info!("key metrics flushed");
}

pub async fn flush_metrics(store: &KeyStore, ctx: &AppContext) {
    let keys = ctx.registry.list();
    match store.save_key_metrics(&keys).await {
        Ok(saved) => debug!(saved, "flushed key metrics"),
        Err(err) => error!(error = %err, "failed to flush key metrics"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    use crate::context::AttemptOutcome;

    async fn temp_store() -> (tempfile::TempDir, KeyStore) {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("flowrelay.db");
        let store = KeyStore::open(path.to_str().unwrap()).await.unwrap();
        (dir, store)
    }

    fn record(key_id: &str, model: Option<&str>, outcome: AttemptOutcome, tokens: u64) -> AttemptRecord {
        AttemptRecord {
            key_id: key_id.to_string(),
            method: "POST".to_string(),
            path: "/v1/chat/completions".to_string(),
            model: model.map(str::to_string),
            status: Some(if outcome.is_success() { 200 } else { 429 }),
            outcome,
            error: None,
            tokens,
            latency_ms: 12,
            attempt: 1,
            created_at: Utc::now().timestamp(),
            day: "2025-06-01".to_string(),
        }
    }

    #[tokio::test]
    async fn insert_load_and_delete_keys() {
        let (_dir, store) = temp_store().await;
        let first = store.insert_key("  sk-first  ").await.unwrap();
        let second = store.insert_key("sk-second").await.unwrap();
        assert_eq!(first.key, "sk-first");
        assert_ne!(first.id, second.id);
        assert_eq!(first.id.len(), 6);

        assert!(matches!(
            store.insert_key("sk-first").await,
            Err(ProxyError::DuplicateKey)
        ));
        assert!(matches!(
            store.insert_key("   ").await,
            Err(ProxyError::EmptyKey)
        ));

        let loaded = store.load_keys().await.unwrap();
        let secrets: Vec<_> = loaded.iter().map(|k| k.key.as_str()).collect();
        assert_eq!(secrets, vec!["sk-first", "sk-second"]);
        assert!(loaded.iter().all(|k| k.enabled));

        assert!(store.set_enabled(&second.id, false).await.unwrap());
        assert!(store.delete_key(&first.id).await.unwrap());
        assert!(!store.delete_key(&first.id).await.unwrap());

        let loaded = store.load_keys().await.unwrap();
        assert_eq!(loaded.len(), 1);
        assert!(!loaded[0].enabled);
    }

    #[tokio::test]
    async fn metrics_survive_reload() {
        let (_dir, store) = temp_store().await;
        let mut key = store.insert_key("sk-metrics").await.unwrap();
        key.balance = 12.5;
        key.success_count = 7;
        key.failure_count = 2;
        key.last_used_at = 1_700_000_000;
        key.balance_checked_at = Some(1_700_000_100);

        let ghost = ApiKey::new("gone", "sk-gone");
        assert_eq!(store.save_key_metrics(&[key.clone(), ghost]).await.unwrap(), 1);

        let loaded = store.load_keys().await.unwrap();
        assert_eq!(loaded[0].balance, 12.5);
        assert_eq!(loaded[0].success_count, 7);
        assert_eq!(loaded[0].failure_count, 2);
        assert_eq!(loaded[0].last_used_at, 1_700_000_000);
        assert_eq!(loaded[0].balance_checked_at, Some(1_700_000_100));
    }

    #[tokio::test]
    async fn attempts_feed_logs_and_daily_totals() {
        let (_dir, store) = temp_store().await;
        store
            .log_attempt(&record("k1", Some("chat"), AttemptOutcome::Success, 30))
            .await
            .unwrap();
        store
            .log_attempt(&record("k1", Some("chat"), AttemptOutcome::Error, 0))
            .await
            .unwrap();
        store
            .log_attempt(&record("k2", None, AttemptOutcome::Partial, 5))
            .await
            .unwrap();

        let logs = store.recent_logs(10).await.unwrap();
        assert_eq!(logs.len(), 3);
        assert_eq!(logs[0].outcome, "partial");
        assert_eq!(logs[0].model, None);
        assert_eq!(logs[2].status_code, Some(200));

        let days = store.load_daily_stats("2025-01-01").await.unwrap();
        assert_eq!(days.len(), 1);
        let day = &days[0];
        assert_eq!(day.date, "2025-06-01");
        assert_eq!(day.requests, 3);
        assert_eq!(day.successes, 2);
        assert_eq!(day.failures, 1);
        assert_eq!(day.tokens, 35);
        assert_eq!(day.models["chat"].requests, 2);
        assert_eq!(day.models[UNKNOWN_MODEL].tokens, 5);

        assert!(store.load_daily_stats("2025-07-01").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn event_writer_drains_queue_on_cancel() {
        let (_dir, store) = temp_store().await;
        let store = Arc::new(store);
        let (tx, rx) = tokio::sync::mpsc::unbounded_channel();
        for _ in 0..5 {
            tx.send(record("k1", Some("chat"), AttemptOutcome::Success, 1))
                .unwrap();
        }
        let cancel = CancellationToken::new();
        cancel.cancel();

        run_event_writer(store.clone(), rx, cancel).await;
        assert_eq!(store.recent_logs(50).await.unwrap().len(), 5);
        assert!(tx.send(record("k1", None, AttemptOutcome::Error, 0)).is_err());
    }
}
