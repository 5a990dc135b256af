use std::path::PathBuf;
use std::sync::Mutex;

use serde::Deserialize;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum TokenError {
    #[error("token file is missing: {}", .0.display())]
    Missing(PathBuf),
    #[error("token file is unreadable: {0}")]
    Io(#[from] std::io::Error),
    #[error("token file is malformed: {0}")]
    Malformed(#[from] serde_json::Error),
    #[error("token cannot be refreshed")]
    RefreshUnavailable,
}

/// Source of a currently-valid bearer token. The authorization flow itself
/// lives outside this crate; implementations only hand tokens over and react
/// to an expiry signal.
pub trait TokenProvider: Send + Sync {
    fn current_token(&self) -> Result<String, TokenError>;

    /// Called once by the retry harness when the provider's token was
    /// rejected as expired. Returns the replacement token.
    fn refresh(&self) -> Result<String, TokenError>;
}

/// Fixed token, for tests and one-shot invocations with a token in the
/// environment. Refresh cannot help here.
pub struct StaticToken {
    token: String,
}

impl StaticToken {
    pub fn new(token: impl Into<String>) -> Self {
        Self {
            token: token.into(),
        }
    }
}

impl TokenProvider for StaticToken {
    fn current_token(&self) -> Result<String, TokenError> {
        Ok(self.token.clone())
    }

    fn refresh(&self) -> Result<String, TokenError> {
        Err(TokenError::RefreshUnavailable)
    }
}

#[derive(Debug, Deserialize)]
struct StoredToken {
    access_token: String,
}

/// Reads `token.json` maintained by the external authorizer. Refresh
/// re-reads the file, picking up rotations performed out of process.
pub struct TokenFile {
    path: PathBuf,
    cached: Mutex<Option<String>>,
}

impl TokenFile {
    pub fn new(path: PathBuf) -> Self {
        Self {
            path,
            cached: Mutex::new(None),
        }
    }

    fn read(&self) -> Result<String, TokenError> {
        if !self.path.exists() {
            return Err(TokenError::Missing(self.path.clone()));
        }
        let raw = std::fs::read_to_string(&self.path)?;
        let stored: StoredToken = serde_json::from_str(&raw)?;
        Ok(stored.access_token)
    }
}

impl TokenProvider for TokenFile {
    fn current_token(&self) -> Result<String, TokenError> {
        let mut cached = self.cached.lock().expect("token mutex poisoned");
        if let Some(token) = cached.as_ref() {
            return Ok(token.clone());
        }
        let token = self.read()?;
        *cached = Some(token.clone());
        Ok(token)
    }

    fn refresh(&self) -> Result<String, TokenError> {
        let token = self.read()?;
        *self.cached.lock().expect("token mutex poisoned") = Some(token.clone());
        Ok(token)
    }
}
