//! Read-only view of the access-token cache.
//!
//! The file is maintained by an external refresher; this crate never writes
//! or refreshes it.

use std::path::{Path, PathBuf};

use reveil_scheduler::PlaybackError;
use serde::Deserialize;

/// A token expiring within this many seconds is treated as unusable.
pub const EXPIRY_MARGIN_SECS: i64 = 60;

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct CachedToken {
    pub access_token: String,
    /// Unix seconds.
    pub expires_at: i64,
}

impl CachedToken {
    pub fn is_fresh(&self, now_unix: i64) -> bool {
        !self.access_token.is_empty() && self.expires_at - now_unix > EXPIRY_MARGIN_SECS
    }
}

#[derive(Debug, Clone)]
pub struct TokenCache {
    path: PathBuf,
}

impl TokenCache {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn read(&self) -> Result<CachedToken, PlaybackError> {
        let raw = std::fs::read_to_string(&self.path)
            .map_err(|e| PlaybackError::Token(format!("cannot read {}: {e}", self.path.display())))?;
        serde_json::from_str(&raw)
            .map_err(|e| PlaybackError::Token(format!("malformed token cache: {e}")))
    }

    /// The cached token when it is still fresh at `now_unix`.
    pub fn fresh_token(&self, now_unix: i64) -> Result<String, PlaybackError> {
        let token = self.read()?;
        if token.is_fresh(now_unix) {
            Ok(token.access_token)
        } else {
            Err(PlaybackError::Token("access token expired or about to expire".into()))
        }
    }
}
