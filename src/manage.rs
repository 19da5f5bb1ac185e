//! Key management: the only code that creates or removes keys.
//!
//! Every change is written to the store first and then mirrored into the
//! registry, so a crash between the two leaves the database authoritative.

use std::sync::Arc;

use serde::Serialize;
use tracing::{info, warn};

use crate::context::AppContext;
use crate::error::ProxyError;
use crate::registry::{ApiKey, preview_key};
use crate::store::KeyStore;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ImportReport {
    /// Ids of newly stored keys.
    pub added: Vec<String>,
    pub duplicates: usize,
}

#[derive(Debug, Clone)]
pub struct KeyManager {
    ctx: AppContext,
    store: Arc<KeyStore>,
}

impl KeyManager {
    pub fn new(ctx: AppContext, store: Arc<KeyStore>) -> Self {
        Self { ctx, store }
    }

    pub fn list(&self) -> Vec<ApiKey> {
        self.ctx.registry.list()
    }

    pub fn find(&self, id: &str) -> Result<ApiKey, ProxyError> {
        self.ctx
            .registry
            .find_by_id(id)
            .ok_or(ProxyError::KeyNotFound)
    }

    pub async fn add_key(&self, secret: &str) -> Result<ApiKey, ProxyError> {
        let key = self.store.insert_key(secret).await?;
        self.ctx.registry.insert(key.clone())?;
        info!(key = %key.preview(), id = %key.id, "api key added");
        Ok(key)
    }

    /// Adds every key found in `raw`: one or more per line, separated by
    /// commas or whitespace, `#` starting a comment.
    pub async fn import_keys(&self, raw: &str) -> Result<ImportReport, ProxyError> {
        let mut report = ImportReport::default();
        for secret in parse_key_list(raw) {
            match self.add_key(secret).await {
                Ok(key) => report.added.push(key.id),
                Err(ProxyError::DuplicateKey) => report.duplicates += 1,
                Err(err) => return Err(err),
            }
        }
        info!(
            added = report.added.len(),
            duplicates = report.duplicates,
            "api keys imported"
        );
        Ok(report)
    }

    /// Removes a key. Requests that already hold it finish normally.
    pub async fn delete_key(&self, id: &str) -> Result<ApiKey, ProxyError> {
        let key = self.find(id)?;
        self.store.delete_key(id).await?;
        let removed = self.ctx.registry.remove(&key.key)?;
        self.ctx.stats.forget_key(&key.key);
        info!(key = %preview_key(&removed.key), id, "api key deleted");
        Ok(removed)
    }

    pub async fn set_enabled(&self, id: &str, enabled: bool) -> Result<ApiKey, ProxyError> {
        let key = self.find(id)?;
        if !self.store.set_enabled(id, enabled).await? {
            return Err(ProxyError::KeyNotFound);
        }
        self.ctx.registry.set_enabled(&key.key, enabled)?;
        info!(key = %key.preview(), id, enabled, "api key status changed");
        self.find(id)
    }

    /// Deletes keys whose balance is below `below`, or exactly zero when no
    /// threshold is given. Returns the removed ids.
    pub async fn delete_low_balance(&self, below: Option<f64>) -> Result<Vec<String>, ProxyError> {
        let doomed: Vec<ApiKey> = self
            .list()
            .into_iter()
            .filter(|k| match below {
                Some(threshold) => k.balance < threshold,
                None => k.balance <= 0.0,
            })
            .collect();

        let mut removed = Vec::with_capacity(doomed.len());
        for key in doomed {
            match self.delete_key(&key.id).await {
                Ok(_) => removed.push(key.id),
                Err(ProxyError::KeyNotFound) => {
                    warn!(id = %key.id, "key vanished before low-balance cleanup")
                }
                Err(err) => return Err(err),
            }
        }
        Ok(removed)
    }
}

pub fn parse_key_list(raw: &str) -> impl Iterator<Item = &str> {
    raw.lines()
        .map(|line| line.split('#').next().unwrap_or_default())
        .flat_map(|line| line.split(|c: char| c == ',' || c.is_whitespace()))
        .filter(|token| !token.is_empty())
}
