use figment::{
    providers::{Env, Format, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};

use crate::alarm::AlarmDefinition;

pub const DEFAULT_PORT: u16 = 18790;
pub const DEFAULT_BIND: &str = "127.0.0.1";
pub const DEFAULT_GRACE_WINDOW_SECS: u64 = 300; // late trigger still counts as a catch-up
pub const DEFAULT_TRIGGER_WINDOW_SECS: u64 = 180; // outer readiness deadline
pub const DEFAULT_RECHECK_INTERVAL_SECS: u64 = 60; // armed/idle wake cadence

/// Top-level config (reveil.toml + REVEIL_* env overrides).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ReveilConfig {
    #[serde(default)]
    pub gateway: GatewayConfig,
    #[serde(default)]
    pub database: DatabaseConfig,
    #[serde(default)]
    pub scheduler: SchedulerConfig,
    #[serde(default)]
    pub readiness: ReadinessConfig,
    #[serde(default)]
    pub playback: PlaybackConfig,
    #[serde(default)]
    pub telemetry: TelemetryConfig,
    /// Seed definition, written to the database only when none is stored yet.
    #[serde(default)]
    pub alarm: Option<AlarmDefinition>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayConfig {
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_bind")]
    pub bind: String,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            port: DEFAULT_PORT,
            bind: DEFAULT_BIND.to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    #[serde(default = "default_db_path")]
    pub path: String,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: default_db_path(),
        }
    }
}

/// Timing tunables for the scheduler loop.
///
/// The defaults suit a small always-on box on home Wi-Fi; deployments with
/// slower wake-up or flakier networks should widen both windows.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerConfig {
    /// Where the restart-recovery record is written.
    #[serde(default = "default_state_path")]
    pub state_path: String,
    /// How late a trigger may start and still count as a catch-up.
    #[serde(default = "default_grace_window_secs")]
    pub grace_window_secs: u64,
    /// Outer deadline for the readiness protocol, measured from window open.
    #[serde(default = "default_trigger_window_secs")]
    pub trigger_window_secs: u64,
    /// Maximum uninterrupted sleep while idle or armed.
    #[serde(default = "default_recheck_interval_secs")]
    pub recheck_interval_secs: u64,
    #[serde(default = "default_playback_timeout_secs")]
    pub playback_timeout_secs: u64,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            state_path: default_state_path(),
            grace_window_secs: DEFAULT_GRACE_WINDOW_SECS,
            trigger_window_secs: DEFAULT_TRIGGER_WINDOW_SECS,
            recheck_interval_secs: DEFAULT_RECHECK_INTERVAL_SECS,
            playback_timeout_secs: default_playback_timeout_secs(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReadinessConfig {
    /// `host:port` reached over TCP without DNS to prove the uplink works.
    #[serde(default = "default_network_probe_addr")]
    pub network_probe_addr: String,
    /// Host name of the playback API; must resolve before triggering.
    #[serde(default = "default_dns_host")]
    pub dns_host: String,
    #[serde(default = "default_stage_timeout_secs")]
    pub stage_timeout_secs: u64,
    #[serde(default = "default_backoff_base_ms")]
    pub backoff_base_ms: u64,
    #[serde(default = "default_backoff_max_ms")]
    pub backoff_max_ms: u64,
}

impl Default for ReadinessConfig {
    fn default() -> Self {
        Self {
            network_probe_addr: default_network_probe_addr(),
            dns_host: default_dns_host(),
            stage_timeout_secs: default_stage_timeout_secs(),
            backoff_base_ms: default_backoff_base_ms(),
            backoff_max_ms: default_backoff_max_ms(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlaybackConfig {
    #[serde(default = "default_api_base_url")]
    pub api_base_url: String,
    /// JSON file holding the current access token, maintained by an external refresher.
    #[serde(default = "default_token_cache_path")]
    pub token_cache_path: String,
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
    /// Duration of the volume ramp when an alarm has `fade_in` set.
    #[serde(default = "default_fade_in_secs")]
    pub fade_in_secs: u64,
}

impl Default for PlaybackConfig {
    fn default() -> Self {
        Self {
            api_base_url: default_api_base_url(),
            token_cache_path: default_token_cache_path(),
            request_timeout_secs: default_request_timeout_secs(),
            fade_in_secs: default_fade_in_secs(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TelemetryConfig {
    /// When set, every scheduling decision is appended here as one JSON line.
    #[serde(default)]
    pub jsonl_path: Option<String>,
}

fn default_port() -> u16 {
    DEFAULT_PORT
}
fn default_bind() -> String {
    DEFAULT_BIND.to_string()
}
fn default_grace_window_secs() -> u64 {
    DEFAULT_GRACE_WINDOW_SECS
}
fn default_trigger_window_secs() -> u64 {
    DEFAULT_TRIGGER_WINDOW_SECS
}
fn default_recheck_interval_secs() -> u64 {
    DEFAULT_RECHECK_INTERVAL_SECS
}
fn default_playback_timeout_secs() -> u64 {
    20
}
fn default_network_probe_addr() -> String {
    "1.1.1.1:443".to_string()
}
fn default_dns_host() -> String {
    "api.spotify.com".to_string()
}
fn default_stage_timeout_secs() -> u64 {
    10
}
fn default_backoff_base_ms() -> u64 {
    1_000
}
fn default_backoff_max_ms() -> u64 {
    30_000
}
fn default_api_base_url() -> String {
    "https://api.spotify.com".to_string()
}
fn default_request_timeout_secs() -> u64 {
    10
}
fn default_fade_in_secs() -> u64 {
    30
}
fn default_db_path() -> String {
    format!("{}/reveil.db", data_dir())
}
fn default_state_path() -> String {
    format!("{}/scheduler-state.json", data_dir())
}
fn default_token_cache_path() -> String {
    format!("{}/token.json", data_dir())
}

fn data_dir() -> String {
    let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
    format!("{}/.reveil", home)
}

impl ReveilConfig {
    /// Load config from a TOML file with REVEIL_* env var overrides.
    ///
    /// Nested keys use a double underscore, e.g.
    /// `REVEIL_SCHEDULER__GRACE_WINDOW_SECS=240`.
    pub fn load(config_path: Option<&str>) -> crate::error::Result<Self> {
        let path = config_path
            .map(String::from)
            .unwrap_or_else(default_config_path);

        Self::figment(&path)
            .extract()
            .map_err(|e| crate::error::CoreError::Config(e.to_string()))
    }

    fn figment(path: &str) -> Figment {
        Figment::new()
            .merge(Toml::file(path))
            .merge(Env::prefixed("REVEIL_").split("__"))
    }
}

fn default_config_path() -> String {
    format!("{}/reveil.toml", data_dir())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn missing_file_yields_defaults() {
        let cfg = ReveilConfig::load(Some("/nonexistent/reveil.toml")).unwrap();
        assert_eq!(cfg.gateway.port, DEFAULT_PORT);
        assert_eq!(cfg.scheduler.grace_window_secs, DEFAULT_GRACE_WINDOW_SECS);
        assert!(cfg.alarm.is_none());
    }

    #[test]
    fn toml_overrides_and_alarm_seed() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            r#"
[scheduler]
grace_window_secs = 120

[readiness]
dns_host = "example.org"

[alarm]
time_of_day = "06:30"
enabled = true
device_name = "Bedroom"
playback_target = "spotify:playlist:abc"
timezone = "Europe/Berlin"
"#
        )
        .unwrap();

        let cfg = ReveilConfig::load(file.path().to_str()).unwrap();
        assert_eq!(cfg.scheduler.grace_window_secs, 120);
        assert_eq!(cfg.scheduler.trigger_window_secs, DEFAULT_TRIGGER_WINDOW_SECS);
        assert_eq!(cfg.readiness.dns_host, "example.org");
        let alarm = cfg.alarm.unwrap();
        assert_eq!(alarm.time_of_day.to_string(), "06:30");
        assert_eq!(alarm.timezone, chrono_tz::Europe::Berlin);
    }

    #[test]
    fn malformed_alarm_is_a_config_error() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "[alarm]\ntime_of_day = \"7 o'clock\"").unwrap();
        let err = ReveilConfig::load(file.path().to_str()).unwrap_err();
        assert_eq!(err.code(), "CONFIG_ERROR");
    }
}
