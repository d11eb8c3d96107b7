//! Seam to the external playback service.
//!
//! The scheduler only needs three capabilities: check the auth token, find
//! the target device, and start playback once. Retries of the trigger call
//! are deliberately absent here; readiness probing owns retrying.

use std::time::Duration;

use async_trait::async_trait;
use reveil_core::AlarmDefinition;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// A playback device as reported by the service.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceInfo {
    pub id: String,
    pub name: String,
}

/// Result of a live device lookup.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeviceLookup {
    Found(DeviceInfo),
    NotFound,
    /// The lookup did not complete in time; a cached device may stand in.
    Timeout,
    /// The service answered with an error.
    Failed(String),
}

/// Everything needed for the single trigger call of a window.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PlaybackRequest {
    pub device: DeviceInfo,
    pub playback_target: String,
    pub volume: u8,
    pub fade_in: bool,
    pub shuffle: bool,
}

impl PlaybackRequest {
    pub fn new(definition: &AlarmDefinition, device: DeviceInfo) -> Self {
        Self {
            device,
            playback_target: definition.playback_target.clone(),
            volume: definition.volume,
            fade_in: definition.fade_in,
            shuffle: definition.shuffle,
        }
    }
}

#[derive(Debug, Error)]
pub enum PlaybackError {
    #[error("API error {status}: {message}")]
    Api { status: u16, message: String },

    #[error("Playback request timed out after {ms}ms")]
    Timeout { ms: u64 },

    #[error("Access token unavailable: {0}")]
    Token(String),

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Device not found: {name}")]
    DeviceNotFound { name: String },
}

#[async_trait]
pub trait PlaybackClient: Send + Sync {
    /// Stable identifier for logs (e.g. `"spotify"`).
    fn name(&self) -> &str;

    /// Whether a usable access token is cached. Never refreshes it.
    async fn is_token_valid(&self) -> bool;

    /// Look up a device by its display name.
    async fn discover_device(&self, name: &str) -> DeviceLookup;

    /// Longest a complete `trigger_playback` call can take with every
    /// request hitting its own timeout. `None` when the client has no
    /// bound of its own.
    fn trigger_budget(&self) -> Option<Duration> {
        None
    }

    /// Start playback. Called at most once per trigger window.
    async fn trigger_playback(&self, request: &PlaybackRequest) -> Result<(), PlaybackError>;
}
