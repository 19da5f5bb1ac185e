//! Reverse proxy for OpenAI-compatible APIs that spreads traffic over a pool
//! of upstream API keys.
//!
//! The [`registry`] holds the keys and their live metrics, [`strategy`]
//! picks one per request, [`dispatch`] forwards and retries, [`refresh`]
//! keeps balances and usage current and [`stats`] aggregates traffic.

pub mod config;
pub mod context;
pub mod dispatch;
pub mod error;
pub mod headers;
pub mod manage;
pub mod outcome;
pub mod refresh;
pub mod registry;
pub mod stats;
pub mod store;
pub mod strategy;

pub use config::{DEFAULT_UPSTREAM, Settings, SettingsHandle};
pub use context::{AppContext, AttemptOutcome, AttemptRecord};
pub use dispatch::{Dispatcher, ProxyRequest, ProxyResponse, ResponseBody};
pub use error::ProxyError;
pub use manage::{ImportReport, KeyManager};
pub use refresh::{RefreshCollector, RefreshReport};
pub use registry::{ApiKey, KeyRegistry};
pub use stats::{DailyStats, StatsAggregator, WindowStats};
pub use store::KeyStore;
pub use strategy::{ModelStrategyMap, Strategy};
