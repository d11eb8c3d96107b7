//! `reveil-scheduler` — the alarm reliability core.
//!
//! # Overview
//!
//! A single background [`engine::SchedulerEngine`] drives one alarm through
//! `IDLE → ARMED → PROBING → EXECUTING → SETTLED/MISSED`, with `ABORTED`
//! when the alarm is disabled or redefined mid-cycle.
//!
//! | Module      | Role                                                     |
//! |-------------|----------------------------------------------------------|
//! | `schedule`  | DST-safe next occurrence (gap → gap end, overlap → earlier) |
//! | `clock`     | Wall-clock vs monotonic sources                          |
//! | `state`     | Restart-recovery record, written atomically              |
//! | `catchup`   | Execute / defer / already-handled decision               |
//! | `readiness` | Network → DNS → token → device probing with backoff      |
//! | `telemetry` | One structured event per decision point                  |
//!
//! At most one trigger call is made per occurrence.

pub mod backoff;
pub mod catchup;
pub mod clock;
pub mod engine;
pub mod error;
pub mod net;
pub mod playback;
pub mod readiness;
pub mod schedule;
pub mod state;
pub mod telemetry;
pub mod types;

#[cfg(test)]
pub(crate) mod testing;

pub use clock::{Clock, SystemClock};
pub use engine::{SchedulerEngine, SchedulerSettings};
pub use error::{Result, SchedulerError};
pub use net::{Connectivity, TcpConnectivity};
pub use playback::{DeviceInfo, DeviceLookup, PlaybackClient, PlaybackError, PlaybackRequest};
pub use readiness::{ProbeSettings, ReadinessProber, ReadinessSnapshot};
pub use state::{PersistedSchedulerState, StateStore};
pub use telemetry::{FanoutSink, JsonlSink, TelemetryEvent, TelemetrySink, TracingSink};
pub use types::{Outcome, Phase, ScheduledOccurrence, SchedulerStatus};
