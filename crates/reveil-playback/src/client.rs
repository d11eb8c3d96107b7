use std::time::Duration;

use async_trait::async_trait;
use reveil_core::config::PlaybackConfig;
use reveil_scheduler::{DeviceInfo, DeviceLookup, PlaybackClient, PlaybackError, PlaybackRequest};
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::{debug, info, warn};

use crate::token::TokenCache;

const DEVICES_PATH: &str = "/v1/me/player/devices";
const SHUFFLE_PATH: &str = "/v1/me/player/shuffle";
const VOLUME_PATH: &str = "/v1/me/player/volume";
const PLAY_PATH: &str = "/v1/me/player/play";

/// Volume playback starts at when fading in.
const FADE_START_VOLUME: u8 = 5;
/// Interval between fade-in volume steps.
const FADE_STEP: Duration = Duration::from_secs(2);
/// Ceiling for the best-effort shuffle and volume requests.
const SETUP_TIMEOUT_CAP: Duration = Duration::from_secs(2);
/// Slack on top of the summed request timeouts in [`SpotifyClient::trigger_budget`].
const BUDGET_SLACK: Duration = Duration::from_millis(500);

#[derive(Debug, Deserialize)]
struct DevicesResponse {
    #[serde(default)]
    devices: Vec<ApiDevice>,
}

#[derive(Debug, Deserialize)]
struct ApiDevice {
    id: Option<String>,
    name: String,
    #[serde(default)]
    is_restricted: bool,
}

/// Spotify Web API playback client.
///
/// Reads its bearer token from the token cache on every call and never
/// refreshes it. The trigger call is made exactly once; there is no retry
/// wrapper here.
pub struct SpotifyClient {
    http: reqwest::Client,
    base_url: String,
    tokens: TokenCache,
    request_timeout: Duration,
    /// Timeout of the shuffle and volume calls, which never block `play`
    /// for longer than this each.
    setup_timeout: Duration,
    fade_in: Duration,
}

impl SpotifyClient {
    pub fn new(cfg: &PlaybackConfig) -> Result<Self, PlaybackError> {
        let request_timeout = Duration::from_secs(cfg.request_timeout_secs.max(1));
        let http = reqwest::Client::builder()
            .timeout(request_timeout)
            .build()
            .map_err(|e| PlaybackError::Transport(e.to_string()))?;
        Ok(Self {
            http,
            base_url: cfg.api_base_url.trim_end_matches('/').to_string(),
            tokens: TokenCache::new(&cfg.token_cache_path),
            request_timeout,
            setup_timeout: (request_timeout / 4).min(SETUP_TIMEOUT_CAP),
            fade_in: Duration::from_secs(cfg.fade_in_secs),
        })
    }

    fn token(&self) -> Result<String, PlaybackError> {
        self.tokens.fresh_token(chrono::Utc::now().timestamp())
    }

    fn classify(e: reqwest::Error, timeout: Duration) -> PlaybackError {
        if e.is_timeout() {
            PlaybackError::Timeout {
                ms: timeout.as_millis() as u64,
            }
        } else {
            PlaybackError::Transport(e.to_string())
        }
    }

    async fn put(
        &self,
        token: &str,
        path: &str,
        query: &[(&str, String)],
        body: Option<&Value>,
        timeout: Duration,
    ) -> Result<(), PlaybackError> {
        put(&self.http, &self.base_url, token, path, query, body, timeout)
            .await
            .map_err(|e| match e {
                PutError::Http(e) => Self::classify(e, timeout),
                PutError::Status(err) => err,
            })
    }

    fn spawn_fade(&self, token: String, device_id: String, start: u8, target: u8) {
        let http = self.http.clone();
        let base_url = self.base_url.clone();
        let (step, volumes) = ramp_steps(start, target, self.fade_in);
        let timeout = self.setup_timeout;
        tokio::spawn(async move {
            for volume in volumes {
                tokio::time::sleep(step).await;
                let query = [
                    ("volume_percent", volume.to_string()),
                    ("device_id", device_id.clone()),
                ];
                if let Err(e) = put(&http, &base_url, &token, VOLUME_PATH, &query, None, timeout).await {
                    warn!(volume, error = %e, "fade-in step failed; leaving volume as is");
                    return;
                }
            }
            debug!(volume = target, "fade-in complete");
        });
    }
}

#[async_trait]
impl PlaybackClient for SpotifyClient {
    fn name(&self) -> &str {
        "spotify"
    }

    /// Shuffle and volume at their short timeout, then `play` at the full one.
    fn trigger_budget(&self) -> Option<Duration> {
        Some(self.setup_timeout * 2 + self.request_timeout + BUDGET_SLACK)
    }

    async fn is_token_valid(&self) -> bool {
        match self.token() {
            Ok(_) => true,
            Err(e) => {
                debug!(path = %self.tokens.path().display(), error = %e, "token not usable");
                false
            }
        }
    }

    async fn discover_device(&self, name: &str) -> DeviceLookup {
        let token = match self.token() {
            Ok(t) => t,
            Err(e) => return DeviceLookup::Failed(e.to_string()),
        };
        let resp = match self
            .http
            .get(format!("{}{DEVICES_PATH}", self.base_url))
            .bearer_auth(&token)
            .send()
            .await
        {
            Ok(r) => r,
            Err(e) if e.is_timeout() => return DeviceLookup::Timeout,
            Err(e) => return DeviceLookup::Failed(e.to_string()),
        };
        if !resp.status().is_success() {
            return DeviceLookup::Failed(format!("device list returned {}", resp.status()));
        }
        let body: DevicesResponse = match resp.json().await {
            Ok(b) => b,
            Err(e) if e.is_timeout() => return DeviceLookup::Timeout,
            Err(e) => return DeviceLookup::Failed(format!("malformed device list: {e}")),
        };

        match find_device(&body.devices, name) {
            Some(device) => DeviceLookup::Found(device),
            None => {
                let available: Vec<&str> = body.devices.iter().map(|d| d.name.as_str()).collect();
                debug!(wanted = %name, ?available, "device not in list");
                DeviceLookup::NotFound
            }
        }
    }

    async fn trigger_playback(&self, request: &PlaybackRequest) -> Result<(), PlaybackError> {
        let token = self.token()?;
        let device_id = request.device.id.clone();

        // Shuffle and start volume are best effort; the play call decides the outcome.
        let shuffle = [
            ("state", request.shuffle.to_string()),
            ("device_id", device_id.clone()),
        ];
        if let Err(e) = self
            .put(&token, SHUFFLE_PATH, &shuffle, None, self.setup_timeout)
            .await
        {
            warn!(error = %e, "could not set shuffle");
        }

        let fading = request.fade_in && !self.fade_in.is_zero() && request.volume > FADE_START_VOLUME;
        let start_volume = if fading {
            FADE_START_VOLUME
        } else {
            request.volume
        };
        let volume = [
            ("volume_percent", start_volume.to_string()),
            ("device_id", device_id.clone()),
        ];
        if let Err(e) = self
            .put(&token, VOLUME_PATH, &volume, None, self.setup_timeout)
            .await
        {
            warn!(error = %e, "could not set start volume");
        }

        let body = play_body(&request.playback_target);
        let play = [("device_id", device_id.clone())];
        match self
            .put(&token, PLAY_PATH, &play, Some(&body), self.request_timeout)
            .await
        {
            Ok(()) => {}
            Err(PlaybackError::Api { status: 404, .. }) => {
                return Err(PlaybackError::DeviceNotFound {
                    name: request.device.name.clone(),
                })
            }
            Err(e) => return Err(e),
        }
        info!(device = %request.device.name, volume = start_volume, fading, "playback started");

        if fading {
            self.spawn_fade(token, device_id, start_volume, request.volume);
        }
        Ok(())
    }
}

enum PutError {
    Http(reqwest::Error),
    Status(PlaybackError),
}

impl std::fmt::Display for PutError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PutError::Http(e) => write!(f, "{e}"),
            PutError::Status(e) => write!(f, "{e}"),
        }
    }
}

async fn put(
    http: &reqwest::Client,
    base_url: &str,
    token: &str,
    path: &str,
    query: &[(&str, String)],
    body: Option<&Value>,
    timeout: Duration,
) -> Result<(), PutError> {
    let mut req = http
        .put(format!("{base_url}{path}"))
        .bearer_auth(token)
        .query(query)
        .timeout(timeout);
    if let Some(body) = body {
        req = req.json(body);
    }
    let resp = req.send().await.map_err(PutError::Http)?;
    let status = resp.status();
    if status.is_success() {
        return Ok(());
    }
    let message = resp.text().await.unwrap_or_default();
    Err(PutError::Status(PlaybackError::Api {
        status: status.as_u16(),
        message,
    }))
}

/// First controllable device whose name matches `name`, ignoring case.
fn find_device(devices: &[ApiDevice], name: &str) -> Option<DeviceInfo> {
    let wanted = name.trim();
    devices
        .iter()
        .filter(|d| !d.is_restricted)
        .find(|d| d.name.trim().eq_ignore_ascii_case(wanted))
        .and_then(|d| {
            d.id.clone().map(|id| DeviceInfo {
                id,
                name: d.name.clone(),
            })
        })
}

/// Body of the play request: tracks and episodes go in `uris`, everything
/// else (album, playlist, artist, show) is a `context_uri`.
pub fn play_body(target: &str) -> Value {
    let uri = normalize_uri(target);
    if uri.starts_with("spotify:track:") || uri.starts_with("spotify:episode:") {
        json!({ "uris": [uri] })
    } else {
        json!({ "context_uri": uri })
    }
}

/// Accept share links (`https://open.spotify.com/<kind>/<id>?si=…`) as well
/// as `spotify:<kind>:<id>` URIs.
fn normalize_uri(target: &str) -> String {
    let target = target.trim();
    if let Some(rest) = target.strip_prefix("https://open.spotify.com/") {
        let path = rest.split('?').next().unwrap_or(rest);
        let mut parts = path.split('/').filter(|p| !p.is_empty());
        if let (Some(kind), Some(id)) = (parts.next(), parts.next()) {
            return format!("spotify:{kind}:{id}");
        }
    }
    target.to_string()
}

/// Step interval and the volumes to set, ending at `target`.
fn ramp_steps(start: u8, target: u8, duration: Duration) -> (Duration, Vec<u8>) {
    if target <= start {
        return (Duration::ZERO, Vec::new());
    }
    let span = u32::from(target - start);
    let steps = ((duration.as_millis() / FADE_STEP.as_millis()) as u32).clamp(1, span);
    let interval = duration / steps;
    let volumes = (1..=steps)
        .map(|i| start + (span * i / steps) as u8)
        .collect();
    (interval, volumes)
}
