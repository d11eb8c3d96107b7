use chrono::{DateTime, FixedOffset, Utc};
use chrono_tz::Tz;
use serde::{Deserialize, Serialize};
use tokio::time::Instant;

/// Result recorded for a single occurrence.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Outcome {
    /// No decision recorded yet.
    #[default]
    None,
    /// Playback was triggered.
    Success,
    /// The occurrence passed without a trigger attempt (dependencies never
    /// became ready, or the grace window elapsed).
    Missed,
    /// The trigger call itself errored.
    Failed,
}

impl Outcome {
    /// Whether an occurrence with this outcome has been decided.
    pub fn is_recorded(self) -> bool {
        !matches!(self, Outcome::None)
    }
}

impl std::fmt::Display for Outcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Outcome::None => "none",
            Outcome::Success => "success",
            Outcome::Missed => "missed",
            Outcome::Failed => "failed",
        };
        write!(f, "{s}")
    }
}

/// The next instant the alarm should fire.
///
/// `deadline` is the monotonic instant matching `target` as of the last
/// wall-clock reading. The engine re-derives it on every wake while armed,
/// so a wall-clock step shifts it within one recheck interval.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScheduledOccurrence {
    pub target: DateTime<Tz>,
    pub deadline: Instant,
}

impl ScheduledOccurrence {
    pub fn target_utc(&self) -> DateTime<Utc> {
        self.target.with_timezone(&Utc)
    }

    /// Target with its local UTC offset, the form persisted and reported.
    pub fn target_fixed(&self) -> DateTime<FixedOffset> {
        self.target.fixed_offset()
    }
}

/// Scheduler state-machine phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    Idle,
    Armed,
    Probing,
    Executing,
    Settled,
    Missed,
    Aborted,
}

impl std::fmt::Display for Phase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Phase::Idle => "idle",
            Phase::Armed => "armed",
            Phase::Probing => "probing",
            Phase::Executing => "executing",
            Phase::Settled => "settled",
            Phase::Missed => "missed",
            Phase::Aborted => "aborted",
        };
        write!(f, "{s}")
    }
}

/// Operator-facing view of the scheduler, published after every transition.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SchedulerStatus {
    pub phase: Phase,
    pub next_target: Option<DateTime<FixedOffset>>,
    pub last_outcome: Outcome,
    pub last_outcome_at: Option<DateTime<FixedOffset>>,
    pub catchup_owed: bool,
}

impl Default for SchedulerStatus {
    fn default() -> Self {
        Self {
            phase: Phase::Idle,
            next_target: None,
            last_outcome: Outcome::None,
            last_outcome_at: None,
            catchup_owed: false,
        }
    }
}
