use std::sync::Arc;

use reqwest::{Client, Url};
use serde::Serialize;
use tokio::sync::mpsc::UnboundedSender;

use crate::config::SettingsHandle;
use crate::error::ProxyError;
use crate::registry::KeyRegistry;
use crate::stats::StatsAggregator;

/// Process-wide state, built once at startup and cloned into every
/// component. Cloning shares the same registry, stats and settings.
#[derive(Debug, Clone)]
pub struct AppContext {
    pub settings: SettingsHandle,
    pub registry: Arc<KeyRegistry>,
    pub stats: Arc<StatsAggregator>,
    pub upstream: Url,
    pub client: Client,
    events: Option<UnboundedSender<AttemptRecord>>,
}

impl AppContext {
    pub fn new(
        settings: SettingsHandle,
        registry: Arc<KeyRegistry>,
        stats: Arc<StatsAggregator>,
        upstream: &str,
    ) -> Result<Self, ProxyError> {
        let upstream = Url::parse(upstream).map_err(|source| ProxyError::InvalidEndpoint {
            endpoint: upstream.to_owned(),
            source,
        })?;
        let client = Client::builder().build()?;
        Ok(Self {
            settings,
            registry,
            stats,
            upstream,
            client,
            events: None,
        })
    }

    /// Attempt records are sent to `events` as each attempt finishes.
    pub fn with_events(mut self, events: UnboundedSender<AttemptRecord>) -> Self {
        self.events = Some(events);
        self
    }

    pub(crate) fn emit(&self, record: AttemptRecord) {
        if let Some(events) = &self.events {
            // Writer gone means we are shutting down.
            let _ = events.send(record);
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AttemptOutcome {
    Success,
    /// Caller went away mid-stream after the upstream accepted the request.
    Partial,
    Error,
    /// Caller went away before the upstream answered.
    Cancelled,
}

impl AttemptOutcome {
    pub const fn as_str(self) -> &'static str {
        match self {
            AttemptOutcome::Success => "success",
            AttemptOutcome::Partial => "partial",
            AttemptOutcome::Error => "error",
            AttemptOutcome::Cancelled => "cancelled",
        }
    }

    pub const fn is_success(self) -> bool {
        matches!(self, AttemptOutcome::Success | AttemptOutcome::Partial)
    }
}

/// One finished upstream attempt.
#[derive(Debug, Clone, Serialize)]
pub struct AttemptRecord {
    pub key_id: String,
    pub method: String,
    pub path: String,
    pub model: Option<String>,
    pub status: Option<u16>,
    pub outcome: AttemptOutcome,
    pub error: Option<String>,
    pub tokens: u64,
    pub latency_ms: i64,
    pub attempt: u32,
    /// Unix seconds.
    pub created_at: i64,
    /// Local day bucket, `%Y-%m-%d`.
    pub day: String,
}
