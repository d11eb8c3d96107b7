//! Structured telemetry: one event per scheduling decision point.

use std::fs::OpenOptions;
use std::io::Write;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use chrono::{DateTime, FixedOffset, Utc};
use serde::Serialize;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::{readiness::ReadinessSnapshot, types::Outcome};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    Armed,
    Probing,
    Executing,
    Settled,
    Missed,
    Aborted,
}

impl std::fmt::Display for EventType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            EventType::Armed => "armed",
            EventType::Probing => "probing",
            EventType::Executing => "executing",
            EventType::Settled => "settled",
            EventType::Missed => "missed",
            EventType::Aborted => "aborted",
        };
        write!(f, "{s}")
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct TelemetryEvent {
    pub event_type: EventType,
    /// Shared by every event of one scheduling cycle.
    pub cycle_id: Uuid,
    pub scheduled_instant: DateTime<FixedOffset>,
    pub now_utc: DateTime<Utc>,
    /// Monotonic now minus the occurrence deadline; negative while early.
    pub monotonic_delta_ms: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub readiness_snapshot: Option<ReadinessSnapshot>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub outcome: Option<Outcome>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

impl TelemetryEvent {
    pub fn new(
        event_type: EventType,
        cycle_id: Uuid,
        scheduled_instant: DateTime<FixedOffset>,
        now_utc: DateTime<Utc>,
        monotonic_delta_ms: i64,
    ) -> Self {
        Self {
            event_type,
            cycle_id,
            scheduled_instant,
            now_utc,
            monotonic_delta_ms,
            readiness_snapshot: None,
            outcome: None,
            detail: None,
        }
    }

    pub fn with_readiness(mut self, snapshot: ReadinessSnapshot) -> Self {
        self.readiness_snapshot = Some(snapshot);
        self
    }

    pub fn with_outcome(mut self, outcome: Outcome) -> Self {
        self.outcome = Some(outcome);
        self
    }

    pub fn with_detail(mut self, detail: impl Into<String>) -> Self {
        self.detail = Some(detail.into());
        self
    }
}

/// Destination for telemetry events. Emitting never fails the caller.
pub trait TelemetrySink: Send + Sync {
    fn emit(&self, event: &TelemetryEvent);
}

/// Emits each event as a structured `tracing` record.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingSink;

impl TelemetrySink for TracingSink {
    fn emit(&self, event: &TelemetryEvent) {
        let readiness = event.readiness_snapshot.as_ref();
        info!(
            target: "reveil_scheduler::telemetry",
            event_type = %event.event_type,
            cycle_id = %event.cycle_id,
            scheduled_instant = %event.scheduled_instant,
            now_utc = %event.now_utc,
            monotonic_delta_ms = event.monotonic_delta_ms,
            overall_ready = readiness.map(|r| r.overall_ready),
            attempt_count = readiness.map(|r| r.attempt_count),
            outcome = event.outcome.map(|o| o.to_string()),
            detail = event.detail.as_deref(),
            "scheduler event"
        );
    }
}

/// Appends each event as one JSON line.
#[derive(Debug)]
pub struct JsonlSink {
    path: PathBuf,
    lock: Mutex<()>,
}

impl JsonlSink {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            lock: Mutex::new(()),
        }
    }

    fn append(&self, line: &str) -> std::io::Result<()> {
        let _guard = self.lock.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)?;
        writeln!(file, "{line}")
    }
}

impl TelemetrySink for JsonlSink {
    fn emit(&self, event: &TelemetryEvent) {
        let line = match serde_json::to_string(event) {
            Ok(line) => line,
            Err(e) => {
                error!(error = %e, "failed to encode telemetry event");
                return;
            }
        };
        if let Err(e) = self.append(&line) {
            warn!(path = %self.path.display(), error = %e, "failed to append telemetry event");
        }
    }
}

/// Forwards every event to each inner sink in order.
#[derive(Default)]
pub struct FanoutSink {
    sinks: Vec<Arc<dyn TelemetrySink>>,
}

impl FanoutSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, sink: Arc<dyn TelemetrySink>) -> Self {
        self.sinks.push(sink);
        self
    }
}

impl TelemetrySink for FanoutSink {
    fn emit(&self, event: &TelemetryEvent) {
        for sink in &self.sinks {
            sink.emit(event);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::MemorySink;
    use chrono::TimeZone;

    fn event(kind: EventType) -> TelemetryEvent {
        let at = Utc.with_ymd_and_hms(2026, 5, 4, 7, 0, 0).unwrap();
        TelemetryEvent::new(kind, Uuid::now_v7(), at.fixed_offset(), at, -250)
    }

    #[test]
    fn jsonl_sink_appends_one_line_per_event() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("logs").join("events.jsonl");
        let sink = JsonlSink::new(&path);

        sink.emit(&event(EventType::Armed));
        sink.emit(&event(EventType::Settled).with_outcome(Outcome::Success));

        let raw = std::fs::read_to_string(&path).unwrap();
        let lines: Vec<serde_json::Value> = raw
            .lines()
            .map(|l| serde_json::from_str(l).unwrap())
            .collect();
        assert_eq!(lines.len(), 2);
        assert_eq!(lines[0]["event_type"], "armed");
        assert_eq!(lines[0]["monotonic_delta_ms"], -250);
        assert!(lines[0].get("outcome").is_none());
        assert_eq!(lines[1]["outcome"], "success");
    }

    #[test]
    fn readiness_snapshot_is_embedded() {
        let mut snapshot = ReadinessSnapshot::default();
        snapshot.network_ready.ready = true;
        snapshot.dns_ready.error = Some("resolve failed".into());
        snapshot.aggregate();

        let json = serde_json::to_value(event(EventType::Missed).with_readiness(snapshot)).unwrap();
        let r = &json["readiness_snapshot"];
        assert_eq!(r["overall_ready"], false);
        assert_eq!(r["network_ready"]["ready"], true);
        assert_eq!(r["dns_ready"]["error"], "resolve failed");
    }

    #[test]
    fn fanout_reaches_every_sink() {
        let a = Arc::new(MemorySink::default());
        let b = Arc::new(MemorySink::default());
        let fanout = FanoutSink::new().with(a.clone()).with(b.clone());

        fanout.emit(&event(EventType::Aborted).with_detail("alarm disabled"));
        assert_eq!(a.kinds(), vec![EventType::Aborted]);
        assert_eq!(b.events()[0].detail.as_deref(), Some("alarm disabled"));
    }
}
