use thiserror::Error;

use crate::config::ConfigError;
use crate::registry::RegistryError;

#[derive(Debug, Error)]
pub enum ProxyError {
    #[error("API key must not be empty")]
    EmptyKey,
    #[error("API key already registered")]
    DuplicateKey,
    #[error("API key not found")]
    KeyNotFound,
    #[error("invalid upstream endpoint '{endpoint}': {source}")]
    InvalidEndpoint {
        endpoint: String,
        #[source]
        source: url::ParseError,
    },
    #[error("no active API keys available")]
    NoActiveKeys,
    #[error("retry budget exhausted after {attempts} attempt(s): {last_error}")]
    RetryBudgetExhausted { attempts: u32, last_error: String },
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),
}

impl From<RegistryError> for ProxyError {
    fn from(err: RegistryError) -> Self {
        match err {
            RegistryError::NotFound => ProxyError::KeyNotFound,
            RegistryError::Duplicate => ProxyError::DuplicateKey,
        }
    }
}
