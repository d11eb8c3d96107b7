//! In-process fakes for the scheduler's seams. Test-only.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use tokio::time::Instant;

use crate::{
    clock::Clock,
    net::Connectivity,
    playback::{DeviceInfo, DeviceLookup, PlaybackClient, PlaybackError, PlaybackRequest},
    telemetry::{EventType, TelemetryEvent, TelemetrySink},
};

/// Wall clock that advances with tokio's (pausable) clock and can be stepped.
pub struct ManualClock {
    base: DateTime<Utc>,
    started: Instant,
    offset: Mutex<ChronoDuration>,
}

impl ManualClock {
    pub fn starting_at(base: DateTime<Utc>) -> Arc<Self> {
        Arc::new(Self {
            base,
            started: Instant::now(),
            offset: Mutex::new(ChronoDuration::zero()),
        })
    }

    /// Jump the wall clock (NTP step, manual change). Monotonic time is unaffected.
    pub fn step(&self, by: ChronoDuration) {
        *self.offset.lock().unwrap() += by;
    }
}

impl Clock for ManualClock {
    fn now_utc(&self) -> DateTime<Utc> {
        let elapsed = ChronoDuration::from_std(self.started.elapsed()).unwrap();
        self.base + elapsed + *self.offset.lock().unwrap()
    }

    fn monotonic(&self) -> Instant {
        Instant::now()
    }
}

pub struct FakeConnectivity {
    network_failures: AtomicU32,
}

impl FakeConnectivity {
    pub fn healthy() -> Arc<Self> {
        Arc::new(Self {
            network_failures: AtomicU32::new(0),
        })
    }

    pub fn fail_network_times(&self, n: u32) {
        self.network_failures.store(n, Ordering::SeqCst);
    }
}

#[async_trait]
impl Connectivity for FakeConnectivity {
    async fn check_network(&self) -> Result<(), String> {
        let failed = self
            .network_failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failed {
            Err("network unreachable".into())
        } else {
            Ok(())
        }
    }

    async fn check_dns(&self, _host: &str) -> Result<(), String> {
        Ok(())
    }
}

pub struct FakePlayback {
    token_valid: AtomicBool,
    hang_discovery: AtomicBool,
    fail_trigger: AtomicBool,
    panic_on_trigger: AtomicBool,
    trigger_delay: Mutex<Duration>,
    trigger_budget: Mutex<Option<Duration>>,
    lookups: Mutex<VecDeque<DeviceLookup>>,
    discover_calls: AtomicU32,
    trigger_calls: AtomicU32,
    requests: Mutex<Vec<PlaybackRequest>>,
}

impl FakePlayback {
    pub fn healthy() -> Arc<Self> {
        Arc::new(Self {
            token_valid: AtomicBool::new(true),
            hang_discovery: AtomicBool::new(false),
            fail_trigger: AtomicBool::new(false),
            panic_on_trigger: AtomicBool::new(false),
            trigger_delay: Mutex::new(Duration::ZERO),
            trigger_budget: Mutex::new(None),
            lookups: Mutex::new(VecDeque::new()),
            discover_calls: AtomicU32::new(0),
            trigger_calls: AtomicU32::new(0),
            requests: Mutex::new(Vec::new()),
        })
    }

    pub fn kitchen() -> DeviceInfo {
        DeviceInfo {
            id: "dev-kitchen".into(),
            name: "Kitchen".into(),
        }
    }

    pub fn set_token_valid(&self, valid: bool) {
        self.token_valid.store(valid, Ordering::SeqCst);
    }

    pub fn hang_discovery(&self, hang: bool) {
        self.hang_discovery.store(hang, Ordering::SeqCst);
    }

    pub fn fail_trigger(&self, fail: bool) {
        self.fail_trigger.store(fail, Ordering::SeqCst);
    }

    pub fn panic_on_trigger(&self, panic: bool) {
        self.panic_on_trigger.store(panic, Ordering::SeqCst);
    }

    /// How long each trigger call takes before answering.
    pub fn set_trigger_delay(&self, delay: Duration) {
        *self.trigger_delay.lock().unwrap() = delay;
    }

    pub fn set_trigger_budget(&self, budget: Option<Duration>) {
        *self.trigger_budget.lock().unwrap() = budget;
    }

    /// Queue a lookup result; once drained, lookups find the kitchen device.
    pub fn push_lookup(&self, lookup: DeviceLookup) {
        self.lookups.lock().unwrap().push_back(lookup);
    }

    pub fn discover_calls(&self) -> u32 {
        self.discover_calls.load(Ordering::SeqCst)
    }

    pub fn trigger_calls(&self) -> u32 {
        self.trigger_calls.load(Ordering::SeqCst)
    }

    pub fn requests(&self) -> Vec<PlaybackRequest> {
        self.requests.lock().unwrap().clone()
    }
}

#[async_trait]
impl PlaybackClient for FakePlayback {
    fn name(&self) -> &str {
        "fake"
    }

    fn trigger_budget(&self) -> Option<Duration> {
        *self.trigger_budget.lock().unwrap()
    }

    async fn is_token_valid(&self) -> bool {
        self.token_valid.load(Ordering::SeqCst)
    }

    async fn discover_device(&self, _name: &str) -> DeviceLookup {
        self.discover_calls.fetch_add(1, Ordering::SeqCst);
        if self.hang_discovery.load(Ordering::SeqCst) {
            return std::future::pending().await;
        }
        let queued = self.lookups.lock().unwrap().pop_front();
        queued.unwrap_or_else(|| DeviceLookup::Found(Self::kitchen()))
    }

    async fn trigger_playback(&self, request: &PlaybackRequest) -> Result<(), PlaybackError> {
        self.trigger_calls.fetch_add(1, Ordering::SeqCst);
        if self.panic_on_trigger.load(Ordering::SeqCst) {
            panic!("playback client blew up");
        }
        self.requests.lock().unwrap().push(request.clone());
        let delay = *self.trigger_delay.lock().unwrap();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        if self.fail_trigger.load(Ordering::SeqCst) {
            return Err(PlaybackError::Api {
                status: 502,
                message: "bad gateway".into(),
            });
        }
        Ok(())
    }
}

/// Keeps every emitted event in memory.
#[derive(Default)]
pub struct MemorySink {
    events: Mutex<Vec<TelemetryEvent>>,
}

impl MemorySink {
    pub fn events(&self) -> Vec<TelemetryEvent> {
        self.events.lock().unwrap().clone()
    }

    pub fn kinds(&self) -> Vec<EventType> {
        self.events().iter().map(|e| e.event_type).collect()
    }
}

impl TelemetrySink for MemorySink {
    fn emit(&self, event: &TelemetryEvent) {
        self.events.lock().unwrap().push(event.clone());
    }
}
