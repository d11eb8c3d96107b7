//! Staged readiness protocol run before every trigger attempt.
//!
//! Stages run in order: network → DNS → token → device. Each stage is
//! retried with its own exponential backoff until it succeeds or the shared
//! deadline passes; every attempt is bounded by the per-stage timeout. A
//! stage that never succeeds marks all later stages as skipped.

use std::future::Future;
use std::sync::{Arc, Mutex};

use reveil_core::config::ReadinessConfig;
use serde::Serialize;
use tokio::time::{sleep, timeout, Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::{
    backoff::Backoff,
    net::Connectivity,
    playback::{DeviceInfo, DeviceLookup, PlaybackClient},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Network,
    Dns,
    Token,
    Device,
}

impl std::fmt::Display for Stage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Stage::Network => "network",
            Stage::Dns => "dns",
            Stage::Token => "token",
            Stage::Device => "device",
        };
        write!(f, "{s}")
    }
}

/// Result of one stage.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct StageReport {
    pub ready: bool,
    /// Reason of the last failed attempt, or why the stage was skipped.
    pub error: Option<String>,
    /// Wall time spent in the stage, retries included.
    pub latency_ms: u64,
    pub attempts: u32,
}

impl StageReport {
    fn skipped(after: Stage) -> Self {
        Self {
            error: Some(format!("skipped: {after} not ready")),
            ..Self::default()
        }
    }
}

/// Aggregated readiness for one trigger attempt. Never persisted.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ReadinessSnapshot {
    pub network_ready: StageReport,
    pub dns_ready: StageReport,
    pub token_ready: StageReport,
    pub device_ready: StageReport,
    pub overall_ready: bool,
    pub attempt_count: u32,
    pub elapsed_since_window_open_ms: u64,
    /// Device to hand to the trigger call when `overall_ready`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub resolved_device: Option<DeviceInfo>,
    /// Live discovery timed out and the last known device was used.
    pub used_cached_device: bool,
    pub cancelled: bool,
}

impl ReadinessSnapshot {
    /// Recompute the derived fields from the four stage reports.
    pub fn aggregate(&mut self) {
        let stages = [
            &self.network_ready,
            &self.dns_ready,
            &self.token_ready,
            &self.device_ready,
        ];
        self.overall_ready = stages.iter().all(|s| s.ready);
        self.attempt_count = stages.iter().map(|s| s.attempts).sum();
    }
}

/// Retry and timeout tunables for the prober.
#[derive(Debug, Clone)]
pub struct ProbeSettings {
    pub dns_host: String,
    pub stage_timeout: Duration,
    pub backoff_base: Duration,
    pub backoff_max: Duration,
}

impl From<&ReadinessConfig> for ProbeSettings {
    fn from(cfg: &ReadinessConfig) -> Self {
        Self {
            dns_host: cfg.dns_host.clone(),
            stage_timeout: Duration::from_secs(cfg.stage_timeout_secs.max(1)),
            backoff_base: Duration::from_millis(cfg.backoff_base_ms.max(1)),
            backoff_max: Duration::from_millis(cfg.backoff_max_ms),
        }
    }
}

pub struct ReadinessProber {
    connectivity: Arc<dyn Connectivity>,
    playback: Arc<dyn PlaybackClient>,
    settings: ProbeSettings,
    /// Last device found by live discovery.
    last_known_device: Mutex<Option<DeviceInfo>>,
}

impl ReadinessProber {
    pub fn new(
        connectivity: Arc<dyn Connectivity>,
        playback: Arc<dyn PlaybackClient>,
        settings: ProbeSettings,
    ) -> Self {
        Self {
            connectivity,
            playback,
            settings,
            last_known_device: Mutex::new(None),
        }
    }

    /// Run all stages against `deadline`.
    ///
    /// Cancellation is honoured before each stage and during every backoff
    /// sleep; a cancelled probe reports `cancelled = true`.
    pub async fn probe(
        &self,
        device_name: &str,
        window_open: Instant,
        deadline: Instant,
        cancel: &CancellationToken,
    ) -> ReadinessSnapshot {
        let mut snapshot = ReadinessSnapshot::default();

        let (network, _) = self
            .run_stage(Stage::Network, deadline, cancel, |budget| {
                bounded(budget, self.connectivity.check_network())
            })
            .await;
        snapshot.network_ready = network;

        if snapshot.network_ready.ready {
            let host = self.settings.dns_host.as_str();
            let (dns, _) = self
                .run_stage(Stage::Dns, deadline, cancel, |budget| {
                    bounded(budget, self.connectivity.check_dns(host))
                })
                .await;
            snapshot.dns_ready = dns;
        } else {
            snapshot.dns_ready = StageReport::skipped(Stage::Network);
        }

        if snapshot.dns_ready.ready {
            let (token, _) = self
                .run_stage(Stage::Token, deadline, cancel, |budget| {
                    bounded(budget, async {
                        if self.playback.is_token_valid().await {
                            Ok(())
                        } else {
                            Err("access token missing or near expiry".to_string())
                        }
                    })
                })
                .await;
            snapshot.token_ready = token;
        } else {
            snapshot.token_ready = StageReport::skipped(Stage::Dns);
        }

        if snapshot.token_ready.ready {
            let (device, found) = self
                .run_stage(Stage::Device, deadline, cancel, |budget| {
                    self.discover(device_name, budget)
                })
                .await;
            snapshot.device_ready = device;
            if let Some((info, cached)) = found {
                snapshot.resolved_device = Some(info);
                snapshot.used_cached_device = cached;
            }
        } else {
            snapshot.device_ready = StageReport::skipped(Stage::Token);
        }

        snapshot.cancelled = cancel.is_cancelled();
        snapshot.elapsed_since_window_open_ms = window_open.elapsed().as_millis() as u64;
        snapshot.aggregate();
        snapshot
    }

    /// One live lookup; a timeout falls back to the last known device.
    async fn discover(&self, name: &str, budget: Duration) -> Result<(DeviceInfo, bool), String> {
        let lookup = match timeout(budget, self.playback.discover_device(name)).await {
            Ok(lookup) => lookup,
            Err(_) => DeviceLookup::Timeout,
        };
        match lookup {
            DeviceLookup::Found(device) => {
                *self
                    .last_known_device
                    .lock()
                    .unwrap_or_else(|e| e.into_inner()) = Some(device.clone());
                Ok((device, false))
            }
            DeviceLookup::Timeout => {
                let cached = self
                    .last_known_device
                    .lock()
                    .unwrap_or_else(|e| e.into_inner())
                    .clone()
                    .filter(|d| d.name.eq_ignore_ascii_case(name));
                match cached {
                    Some(device) => {
                        warn!(device = %device.name, "device discovery timed out; using last known device");
                        Ok((device, true))
                    }
                    None => Err("device discovery timed out".to_string()),
                }
            }
            DeviceLookup::NotFound => Err(format!("device {name:?} not found")),
            DeviceLookup::Failed(reason) => Err(reason),
        }
    }

    async fn run_stage<T, F, Fut>(
        &self,
        stage: Stage,
        deadline: Instant,
        cancel: &CancellationToken,
        mut attempt: F,
    ) -> (StageReport, Option<T>)
    where
        F: FnMut(Duration) -> Fut,
        Fut: Future<Output = Result<T, String>>,
    {
        let started = Instant::now();
        let mut backoff = Backoff::new(self.settings.backoff_base, self.settings.backoff_max);
        let mut report = StageReport::default();
        let mut value = None;

        loop {
            if cancel.is_cancelled() {
                report.error = Some("cancelled".to_string());
                break;
            }
            let now = Instant::now();
            if now >= deadline {
                report.error.get_or_insert_with(|| "deadline reached".to_string());
                break;
            }

            let budget = self.settings.stage_timeout.min(deadline - now);
            report.attempts += 1;
            match attempt(budget).await {
                Ok(v) => {
                    report.ready = true;
                    report.error = None;
                    value = Some(v);
                    break;
                }
                Err(reason) => {
                    warn!(%stage, attempt = report.attempts, error = %reason, "readiness stage not ready");
                    report.error = Some(reason);
                }
            }

            let delay = backoff.next_delay();
            if Instant::now() + delay >= deadline {
                break;
            }
            tokio::select! {
                _ = sleep(delay) => {}
                _ = cancel.cancelled() => {
                    report.error = Some("cancelled".to_string());
                    break;
                }
            }
        }

        report.latency_ms = started.elapsed().as_millis() as u64;
        if report.ready {
            info!(%stage, attempts = report.attempts, latency_ms = report.latency_ms, "readiness stage ready");
        }
        (report, value)
    }
}

/// Bound a single attempt by `budget`.
async fn bounded<T>(
    budget: Duration,
    fut: impl Future<Output = Result<T, String>>,
) -> Result<T, String> {
    match timeout(budget, fut).await {
        Ok(res) => res,
        Err(_) => Err(format!("timed out after {}ms", budget.as_millis())),
    }
}
