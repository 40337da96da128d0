// Bearer credential for the upstream calendar API.
// Renewal happens elsewhere; this only reads what is currently stored.

use async_trait::async_trait;
use parking_lot::RwLock;
use serde::Deserialize;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::debug;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum CredentialError {
    #[error("No upstream credential is currently stored")]
    Unavailable,

    #[error("Credential store error: {0}")]
    Store(String),
}

#[async_trait]
pub trait TokenStore: Send + Sync + 'static {
    // Ok(None) means the store is reachable but holds no token
    async fn load(&self) -> Result<Option<String>, CredentialError>;
}

// In-memory store; the renewal process swaps the token through `set`
#[derive(Default)]
pub struct StaticTokenStore {
    token: RwLock<Option<String>>,
}

impl StaticTokenStore {
    pub fn new(token: Option<String>) -> Self {
        Self {
            token: RwLock::new(token),
        }
    }

    pub fn set(&self, token: Option<String>) {
        *self.token.write() = token;
    }
}

#[async_trait]
impl TokenStore for StaticTokenStore {
    async fn load(&self) -> Result<Option<String>, CredentialError> {
        Ok(self.token.read().clone())
    }
}

// Reads the token from a file written by the renewal job
pub struct FileTokenStore {
    path: PathBuf,
}

impl FileTokenStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

#[async_trait]
impl TokenStore for FileTokenStore {
    async fn load(&self) -> Result<Option<String>, CredentialError> {
        match tokio::fs::read_to_string(&self.path).await {
            Ok(content) => {
                let token = content.trim();
                Ok((!token.is_empty()).then(|| token.to_string()))
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(CredentialError::Store(format!(
                "{}: {}",
                self.path.display(),
                e
            ))),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CredentialConfig {
    pub soft_ttl_seconds: u64,
}

impl Default for CredentialConfig {
    fn default() -> Self {
        Self {
            soft_ttl_seconds: 30,
        }
    }
}

impl CredentialConfig {
    pub fn soft_ttl(&self) -> Duration {
        Duration::from_secs(self.soft_ttl_seconds)
    }
}

struct CachedToken {
    token: String,
    read_at: Instant,
}

pub struct CredentialProvider {
    store: Arc<dyn TokenStore>,
    soft_ttl: Duration,
    cached: Mutex<Option<CachedToken>>,
}

impl CredentialProvider {
    pub fn new(store: Arc<dyn TokenStore>, config: CredentialConfig) -> Self {
        Self {
            store,
            soft_ttl: config.soft_ttl(),
            cached: Mutex::new(None),
        }
    }

    pub async fn get_token(&self) -> Result<String, CredentialError> {
        // Held across the store read so concurrent callers share one read
        let mut cached = self.cached.lock().await;
        if let Some(entry) = cached.as_ref() {
            if entry.read_at.elapsed() < self.soft_ttl {
                return Ok(entry.token.clone());
            }
        }
        self.reload(&mut cached).await
    }

    pub async fn force_refresh(&self) -> Result<String, CredentialError> {
        let mut cached = self.cached.lock().await;
        *cached = None;
        debug!("Forcing credential re-read");
        self.reload(&mut cached).await
    }

    async fn reload(&self, cached: &mut Option<CachedToken>) -> Result<String, CredentialError> {
        let token = self.store.load().await?.ok_or(CredentialError::Unavailable)?;
        *cached = Some(CachedToken {
            token: token.clone(),
            read_at: Instant::now(),
        });
        Ok(token)
    }
}
