//! Background balance and usage refresh.
//!
//! Two deadlines drive one task: a slow one that queries every enabled
//! key's balance upstream, and a fast one that copies rolling-window RPM/TPM
//! from the stats aggregator into the registry. Intervals are re-read from
//! the settings snapshot after every tick.

use std::time::Duration;

use chrono::Utc;
use futures_util::{StreamExt, stream};
use rand::Rng;
use reqwest::{StatusCode, Url};
use serde::Serialize;
use serde_json::Value;
use thiserror::Error;
use tokio::time::{Instant, sleep_until, timeout};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::context::AppContext;
use crate::registry::preview_key;

/// Account endpoint reporting the balance of the calling key.
pub const BALANCE_PATH: &str = "/v1/user/info";
const BALANCE_JITTER_SECS: u64 = 5;

#[derive(Debug, Error)]
pub enum RefreshError {
    #[error("balance request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("balance request returned {status}")]
    Status { status: StatusCode },
    #[error("balance response carried no balance field")]
    MissingBalance,
    #[error("balance request timed out after {0:?}")]
    Timeout(Duration),
    #[error("key was removed during refresh")]
    KeyRemoved,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct KeyRefresh {
    pub balance: f64,
    /// The key was disabled because its balance ran out.
    pub disabled: bool,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct RefreshReport {
    pub refreshed: usize,
    pub failed: usize,
    pub disabled: usize,
}

#[derive(Debug, Clone)]
pub struct RefreshCollector {
    ctx: AppContext,
}

impl RefreshCollector {
    pub fn new(ctx: AppContext) -> Self {
        Self { ctx }
    }

    /// Runs until `cancel` fires. A cycle in progress is abandoned at
    /// cancellation, so nothing touches the registry after this returns.
    pub async fn run(self, cancel: CancellationToken) {
        info!("refresh collector started");
        tokio::select! {
            _ = cancel.cancelled() => {
                info!("refresh collector stopped");
                return;
            }
            report = self.refresh_balances() => log_report(&report),
        }

        let settings = self.ctx.settings.snapshot();
        let now = Instant::now();
        let mut next_balance = now + settings.auto_update_interval() + jitter();
        let mut next_rates = now + settings.rate_refresh_interval();

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = sleep_until(next_balance.min(next_rates)) => {}
            }

            let settings = self.ctx.settings.snapshot();
            let now = Instant::now();
            if now >= next_rates {
                let updated = self.recompute_rates();
                debug!(keys = updated, "recomputed key usage");
                next_rates = now + settings.rate_refresh_interval();
            }
            if now >= next_balance {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    report = self.refresh_balances() => log_report(&report),
                }
                next_balance = Instant::now() + settings.auto_update_interval() + jitter();
            }
        }
        info!("refresh collector stopped");
    }

    /// Queries every enabled key's balance with bounded concurrency. Failed
    /// keys are logged and keep their previous balance and status.
    pub async fn refresh_balances(&self) -> RefreshReport {
        let settings = self.ctx.settings.snapshot();
        let keys: Vec<String> = self
            .ctx
            .registry
            .list()
            .into_iter()
            .filter(|k| k.enabled)
            .map(|k| k.key)
            .collect();
        let concurrency = settings.refresh_concurrency.max(1);

        let results: Vec<(String, Result<KeyRefresh, RefreshError>)> = stream::iter(keys)
            .map(|key| async move {
                let result = self.refresh_key(&key).await;
                (key, result)
            })
            .buffer_unordered(concurrency)
            .collect()
            .await;

        let mut report = RefreshReport::default();
        for (key, result) in results {
            match result {
                Ok(refresh) => {
                    report.refreshed += 1;
                    if refresh.disabled {
                        report.disabled += 1;
                    }
                }
                Err(err) => {
                    report.failed += 1;
                    warn!(key = %preview_key(&key), error = %err, "balance refresh failed");
                }
            }
        }
        report
    }

    /// Refreshes one key's balance, bounded by the configured timeout.
    pub async fn refresh_key(&self, key: &str) -> Result<KeyRefresh, RefreshError> {
        let settings = self.ctx.settings.snapshot();
        let limit = settings.refresh_timeout();
        let balance = timeout(limit, self.query_balance(key))
            .await
            .map_err(|_| RefreshError::Timeout(limit))??;

        self.ctx
            .registry
            .update_balance(key, balance)
            .map_err(|_| RefreshError::KeyRemoved)?;

        let disabled = settings.auto_disable_zero_balance
            && balance <= 0.0
            && self.ctx.registry.set_enabled(key, false).is_ok();
        if disabled {
            warn!(key = %preview_key(key), "balance exhausted, key disabled");
        } else {
            debug!(key = %preview_key(key), balance, "balance refreshed");
        }
        Ok(KeyRefresh { balance, disabled })
    }

    async fn query_balance(&self, key: &str) -> Result<f64, RefreshError> {
        let response = self
            .ctx
            .client
            .get(balance_url(&self.ctx.upstream))
            .bearer_auth(key)
            .send()
            .await?;
        let status = response.status();
        if !status.is_success() {
            return Err(RefreshError::Status { status });
        }
        let body: Value = response.json().await?;
        parse_balance(&body).ok_or(RefreshError::MissingBalance)
    }

    /// Copies rolling-window usage into the registry. Keys without recent
    /// traffic drop to zero. Returns the number of keys updated.
    pub fn recompute_rates(&self) -> usize {
        let windows = self.ctx.stats.current_windows(Utc::now());
        let mut updated = 0;
        for key in self.ctx.registry.list() {
            let usage = windows
                .get(&key.key)
                .map(|w| w.as_usage())
                .unwrap_or_default();
            if self.ctx.registry.update_usage(&key.key, usage).is_ok() {
                updated += 1;
            }
        }
        updated
    }
}

fn log_report(report: &RefreshReport) {
    info!(
        refreshed = report.refreshed,
        failed = report.failed,
        disabled = report.disabled,
        "balance refresh finished"
    );
}

fn jitter() -> Duration {
    Duration::from_secs(rand::thread_rng().gen_range(0..=BALANCE_JITTER_SECS))
}

fn balance_url(upstream: &Url) -> Url {
    let mut url = upstream.clone();
    let base = url.path().trim_end_matches('/').to_owned();
    url.set_path(&format!("{base}{BALANCE_PATH}"));
    url.set_query(None);
    url
}

/// Extracts the balance from an account response such as
/// `{"data":{"balance":"0.88","totalBalance":"88.88"}}`. The total balance
/// wins when present; values may be numbers or numeric strings.
pub fn parse_balance(body: &Value) -> Option<f64> {
    let scopes = [body.get("data"), Some(body)];
    for scope in scopes.into_iter().flatten() {
        for field in ["totalBalance", "total_balance", "balance"] {
            if let Some(value) = scope.get(field).and_then(numeric) {
                return Some(value);
            }
        }
    }
    None
}

fn numeric(value: &Value) -> Option<f64> {
    let parsed = match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse::<f64>().ok(),
        _ => None,
    }?;
    parsed.is_finite().then_some(parsed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use axum::Router;
    use axum::http::{HeaderMap, StatusCode as AxumStatus};
    use axum::response::{IntoResponse, Response};
    use axum::routing::get;
    use serde_json::json;
    use tokio::net::TcpListener;

    use crate::config::{Settings, SettingsHandle};
    use crate::registry::{ApiKey, KeyRegistry};
    use crate::stats::StatsAggregator;

    async fn user_info(headers: HeaderMap) -> Response {
        let key = headers
            .get("authorization")
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.strip_prefix("Bearer "))
            .unwrap_or_default()
            .to_string();
        match key.as_str() {
            "rich" => axum::Json(json!({
                "code": 20000,
                "data": {"balance": "1.50", "totalBalance": "12.34"}
            }))
            .into_response(),
            "broke" => axum::Json(json!({"data": {"balance": 0, "totalBalance": "0.00"}}))
                .into_response(),
            "slow" => {
                tokio::time::sleep(Duration::from_secs(5)).await;
                axum::Json(json!({"data": {"totalBalance": "1"}})).into_response()
            }
            "odd" => axum::Json(json!({"data": {"name": "x"}})).into_response(),
            _ => (AxumStatus::UNAUTHORIZED, "invalid key").into_response(),
        }
    }

    async fn spawn_upstream() -> String {
        let app = Router::new().route("/v1/user/info", get(user_info));
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        format!("http://{addr}")
    }

    fn collector(upstream: &str, keys: &[&str], settings: Settings) -> RefreshCollector {
        let registry = KeyRegistry::from_keys(keys.iter().map(|k| {
            let mut key = ApiKey::new(format!("id-{k}"), *k);
            key.balance = 3.0;
            key
        }));
        let ctx = AppContext::new(
            SettingsHandle::new(settings),
            Arc::new(registry),
            Arc::new(StatsAggregator::new()),
            upstream,
        )
        .unwrap();
        RefreshCollector::new(ctx)
    }

    fn fast_settings() -> Settings {
        Settings {
            refresh_timeout: 1,
            ..Settings::default()
        }
    }

    #[test]
    fn parses_balance_shapes() {
        assert_eq!(
            parse_balance(&json!({"data": {"balance": "0.88", "totalBalance": "88.88"}})),
            Some(88.88)
        );
        assert_eq!(parse_balance(&json!({"data": {"balance": 3.5}})), Some(3.5));
        assert_eq!(parse_balance(&json!({"balance": " 7 "})), Some(7.0));
        assert_eq!(parse_balance(&json!({"data": {"balance": "n/a"}})), None);
        assert_eq!(parse_balance(&json!({"data": null})), None);
    }

    #[test]
    fn balance_url_keeps_base_path() {
        let url = Url::parse("https://relay.example.com/api/").unwrap();
        assert_eq!(
            balance_url(&url).as_str(),
            "https://relay.example.com/api/v1/user/info"
        );
    }

    #[tokio::test]
    async fn refresh_updates_balances_and_skips_failures() {
        let upstream = spawn_upstream().await;
        let collector = collector(
            &upstream,
            &["rich", "broke", "denied", "slow", "odd"],
            fast_settings(),
        );
        collector.ctx.registry.set_enabled("odd", false).unwrap();

        let report = collector.refresh_balances().await;
        assert_eq!(
            report,
            RefreshReport {
                refreshed: 2,
                failed: 2,
                disabled: 0
            }
        );

        let registry = &collector.ctx.registry;
        let rich = registry.get("rich").unwrap();
        assert_eq!(rich.balance, 12.34);
        assert!(rich.balance_checked_at.is_some());
        assert_eq!(registry.get("broke").unwrap().balance, 0.0);
        assert!(registry.get("broke").unwrap().enabled);

        let denied = registry.get("denied").unwrap();
        assert_eq!(denied.balance, 3.0);
        assert!(denied.enabled);
        assert!(denied.balance_checked_at.is_none());
        assert_eq!(registry.get("slow").unwrap().balance, 3.0);
        assert_eq!(registry.get("odd").unwrap().balance, 3.0);
    }

    #[tokio::test]
    async fn refresh_key_reports_errors() {
        let upstream = spawn_upstream().await;
        let collector = collector(&upstream, &["denied", "slow", "odd"], fast_settings());

        assert!(matches!(
            collector.refresh_key("denied").await,
            Err(RefreshError::Status { status }) if status == StatusCode::UNAUTHORIZED
        ));
        assert!(matches!(
            collector.refresh_key("slow").await,
            Err(RefreshError::Timeout(_))
        ));
        assert!(matches!(
            collector.refresh_key("odd").await,
            Err(RefreshError::MissingBalance)
        ));
    }

    #[tokio::test]
    async fn zero_balance_disables_key_when_enabled_in_settings() {
        let upstream = spawn_upstream().await;
        let settings = Settings {
            auto_disable_zero_balance: true,
            ..fast_settings()
        };
        let collector = collector(&upstream, &["rich", "broke"], settings);

        let report = collector.refresh_balances().await;
        assert_eq!(report.refreshed, 2);
        assert_eq!(report.disabled, 1);
        assert!(!collector.ctx.registry.get("broke").unwrap().enabled);
        assert!(collector.ctx.registry.get("rich").unwrap().enabled);
    }

    #[tokio::test]
    async fn recompute_rates_copies_window_usage() {
        let collector = collector("http://127.0.0.1:9", &["a", "b"], Settings::default());
        let now = Utc::now();
        collector.ctx.stats.record_request("a", "m", true, 120, now);
        collector.ctx.stats.record_request("a", "m", false, 0, now);
        collector
            .ctx
            .registry
            .update_usage(
                "b",
                crate::registry::UsageSample {
                    requests_per_minute: 9,
                    tokens_per_minute: 900,
                },
            )
            .unwrap();

        assert_eq!(collector.recompute_rates(), 2);
        let a = collector.ctx.registry.get("a").unwrap();
        assert_eq!((a.requests_per_minute, a.tokens_per_minute), (2, 120));
        let b = collector.ctx.registry.get("b").unwrap();
        assert_eq!((b.requests_per_minute, b.tokens_per_minute), (0, 0));
    }

    #[tokio::test]
    async fn run_stops_on_cancel() {
        let upstream = spawn_upstream().await;
        let collector = collector(&upstream, &["rich"], fast_settings());
        let registry = collector.ctx.registry.clone();
        let cancel = CancellationToken::new();
        let task = tokio::spawn(collector.run(cancel.clone()));

        tokio::time::sleep(Duration::from_millis(300)).await;
        assert_eq!(registry.get("rich").unwrap().balance, 12.34);

        cancel.cancel();
        tokio::time::timeout(Duration::from_secs(2), task)
            .await
            .unwrap()
            .unwrap();
    }
}
