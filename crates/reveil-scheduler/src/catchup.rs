use chrono::{DateTime, Duration, Utc};
use serde::Serialize;

use crate::state::PersistedSchedulerState;

/// What to do with an occurrence when the scheduler looks at it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CatchupDecision {
    /// Inside `[scheduled, scheduled + grace]` with nothing recorded: fire.
    ExecuteNow,
    /// Past the grace window with nothing recorded: the occurrence is
    /// missed; move on to the following one.
    DeferToNext,
    /// An outcome is already recorded for this occurrence.
    AlreadyHandled,
    /// The wall clock has not reached the occurrence yet (early wake, clock
    /// stepped back, or a restart with the target still ahead).
    NotYetDue,
}

/// Decide an occurrence given the current wall-clock time.
pub fn decide(
    scheduled: DateTime<Utc>,
    now: DateTime<Utc>,
    grace_window: Duration,
    state: &PersistedSchedulerState,
) -> CatchupDecision {
    if state.is_handled(scheduled) {
        return CatchupDecision::AlreadyHandled;
    }
    if now < scheduled {
        return CatchupDecision::NotYetDue;
    }
    if now <= scheduled + grace_window {
        CatchupDecision::ExecuteNow
    } else {
        CatchupDecision::DeferToNext
    }
}
