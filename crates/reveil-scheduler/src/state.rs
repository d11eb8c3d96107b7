//! Durable scheduler record used to resume across restarts.
//!
//! Stored as pretty JSON at the configured `state_path`. Only the scheduler
//! engine writes it.

use std::fs;
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};

use chrono::{DateTime, Duration, FixedOffset, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::{error::Result, types::Outcome};

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PersistedSchedulerState {
    /// Occurrence the last recorded outcome belongs to. Only moves forward.
    #[serde(default)]
    pub last_target_instant: Option<DateTime<FixedOffset>>,
    #[serde(default)]
    pub last_outcome: Outcome,
    #[serde(default)]
    pub last_outcome_at: Option<DateTime<FixedOffset>>,
    /// An occurrence was armed and has no recorded outcome yet.
    #[serde(default)]
    pub catchup_owed: bool,
    /// The armed occurrence `catchup_owed` refers to.
    #[serde(default)]
    pub armed_instant: Option<DateTime<FixedOffset>>,
}

impl PersistedSchedulerState {
    /// Mark `target` as armed. Returns `false` when it already was.
    pub fn arm(&mut self, target: DateTime<FixedOffset>) -> bool {
        if self.catchup_owed && self.armed_instant == Some(target) {
            return false;
        }
        self.armed_instant = Some(target);
        self.catchup_owed = true;
        true
    }

    /// Drop the armed occurrence without recording an outcome (cycle aborted).
    pub fn release(&mut self) {
        self.armed_instant = None;
        self.catchup_owed = false;
    }

    /// Record the decision for `target`.
    ///
    /// Refused (returns `false`) when `target` is earlier than the last
    /// recorded occurrence, or when that same occurrence already has an
    /// outcome; this keeps `last_target_instant` non-decreasing and makes
    /// every occurrence settle at most once.
    pub fn record(
        &mut self,
        target: DateTime<FixedOffset>,
        outcome: Outcome,
        at: DateTime<FixedOffset>,
    ) -> bool {
        if let Some(last) = self.last_target_instant {
            if target < last || (target == last && self.last_outcome.is_recorded()) {
                warn!(
                    %target,
                    last_target = %last,
                    last_outcome = %self.last_outcome,
                    %outcome,
                    "refusing to rewrite scheduler history"
                );
                return false;
            }
        }
        self.last_target_instant = Some(target);
        self.last_outcome = outcome;
        self.last_outcome_at = Some(at);
        if self.armed_instant.is_some_and(|armed| armed <= target) {
            self.release();
        }
        true
    }

    /// Whether `target` already has a recorded outcome.
    pub fn is_handled(&self, target: DateTime<Utc>) -> bool {
        self.last_outcome.is_recorded() && self.last_target_instant.is_some_and(|t| t == target)
    }

    /// Earliest reference from which the next occurrence may be computed,
    /// so a decided occurrence is never armed again.
    pub fn reference_floor(&self) -> Option<DateTime<Utc>> {
        if !self.last_outcome.is_recorded() {
            return None;
        }
        self.last_target_instant
            .map(|t| t.with_timezone(&Utc) + Duration::seconds(1))
    }

    /// The armed occurrence a restart still owes a decision for.
    pub fn owed_target(&self) -> Option<DateTime<FixedOffset>> {
        if self.catchup_owed {
            self.armed_instant
        } else {
            None
        }
    }
}

/// Reads and atomically writes [`PersistedSchedulerState`].
#[derive(Debug, Clone)]
pub struct StateStore {
    path: PathBuf,
}

impl StateStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Load the persisted state.
    ///
    /// A missing file is a first start and yields the default state. An
    /// unparseable file is moved aside to `<path>.corrupt` and the default is
    /// used. Any other read error is returned: the caller cannot tell whether
    /// a catch-up is owed.
    pub fn load(&self) -> Result<PersistedSchedulerState> {
        let raw = match fs::read_to_string(&self.path) {
            Ok(raw) => raw,
            Err(e) if e.kind() == ErrorKind::NotFound => {
                debug!(path = %self.path.display(), "no scheduler state yet");
                return Ok(PersistedSchedulerState::default());
            }
            Err(e) => return Err(e.into()),
        };

        match serde_json::from_str(&raw) {
            Ok(state) => Ok(state),
            Err(e) => {
                let aside = with_suffix(&self.path, "corrupt");
                warn!(
                    path = %self.path.display(),
                    moved_to = %aside.display(),
                    error = %e,
                    "scheduler state unreadable; starting from defaults"
                );
                fs::rename(&self.path, &aside)?;
                Ok(PersistedSchedulerState::default())
            }
        }
    }

    /// Write temp file, fsync, then rename over the old record, so a crash
    /// mid-write never leaves a truncated file behind.
    pub fn save(&self, state: &PersistedSchedulerState) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }
        let json = serde_json::to_string_pretty(state)?;
        let tmp = with_suffix(&self.path, "tmp");
        {
            let mut file = fs::File::create(&tmp)?;
            file.write_all(json.as_bytes())?;
            file.sync_all()?;
        }
        if let Err(e) = fs::rename(&tmp, &self.path) {
            let _ = fs::remove_file(&tmp);
            return Err(e.into());
        }
        Ok(())
    }
}

fn with_suffix(path: &Path, suffix: &str) -> PathBuf {
    let mut s = path.as_os_str().to_owned();
    s.push(".");
    s.push(suffix);
    PathBuf::from(s)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn at(h: u32, m: u32) -> DateTime<FixedOffset> {
        FixedOffset::east_opt(2 * 3600)
            .unwrap()
            .with_ymd_and_hms(2026, 6, 1, h, m, 0)
            .unwrap()
    }

    #[test]
    fn reload_after_crash_reproduces_decision_inputs() {
        let dir = tempfile::tempdir().unwrap();
        let store = StateStore::new(dir.path().join("state.json"));

        let mut state = PersistedSchedulerState::default();
        state.record(at(7, 0), Outcome::Success, at(7, 0));
        state.arm(at(7, 0) + Duration::days(1));
        store.save(&state).unwrap();

        // Simulated crash: nothing but the file survives.
        let reloaded = StateStore::new(dir.path().join("state.json")).load().unwrap();
        assert_eq!(reloaded, state);
        assert!(reloaded.catchup_owed);
        assert_eq!(reloaded.last_outcome, Outcome::Success);
        assert_eq!(reloaded.owed_target(), Some(at(7, 0) + Duration::days(1)));
    }

    #[test]
    fn offsets_survive_serialization() {
        let mut state = PersistedSchedulerState::default();
        state.record(at(7, 0), Outcome::Missed, at(7, 5));
        let json = serde_json::to_string(&state).unwrap();
        assert!(json.contains("2026-06-01T07:00:00+02:00"), "{json}");
        assert!(json.contains("\"missed\""));
    }

    #[test]
    fn missing_file_is_a_first_start() {
        let dir = tempfile::tempdir().unwrap();
        let state = StateStore::new(dir.path().join("absent.json")).load().unwrap();
        assert_eq!(state, PersistedSchedulerState::default());
    }

    #[test]
    fn corrupt_file_is_moved_aside() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state.json");
        fs::write(&path, "{ not json").unwrap();

        let state = StateStore::new(&path).load().unwrap();
        assert_eq!(state, PersistedSchedulerState::default());
        assert!(!path.exists());
        assert!(dir.path().join("state.json.corrupt").exists());
    }

    #[test]
    fn save_leaves_no_temp_file() {
        let dir = tempfile::tempdir().unwrap();
        let store = StateStore::new(dir.path().join("nested").join("state.json"));
        store.save(&PersistedSchedulerState::default()).unwrap();
        assert!(store.path().exists());
        assert!(!dir.path().join("nested").join("state.json.tmp").exists());
    }

    #[test]
    fn last_target_never_rewinds() {
        let mut state = PersistedSchedulerState::default();
        assert!(state.record(at(7, 0), Outcome::Success, at(7, 0)));
        assert!(!state.record(at(6, 0), Outcome::Missed, at(7, 1)));
        assert_eq!(state.last_target_instant, Some(at(7, 0)));
        assert_eq!(state.last_outcome, Outcome::Success);
    }

    #[test]
    fn occurrence_settles_once() {
        let mut state = PersistedSchedulerState::default();
        assert!(state.record(at(7, 0), Outcome::Success, at(7, 0)));
        assert!(!state.record(at(7, 0), Outcome::Failed, at(7, 2)));
        assert_eq!(state.last_outcome, Outcome::Success);
    }

    #[test]
    fn recording_clears_the_armed_occurrence() {
        let mut state = PersistedSchedulerState::default();
        assert!(state.arm(at(7, 0)));
        assert!(!state.arm(at(7, 0)));
        assert!(state.catchup_owed);

        state.record(at(7, 0), Outcome::Failed, at(7, 1));
        assert!(!state.catchup_owed);
        assert!(state.owed_target().is_none());
        assert!(state.is_handled(at(7, 0).with_timezone(&Utc)));
        assert_eq!(
            state.reference_floor(),
            Some(at(7, 0).with_timezone(&Utc) + Duration::seconds(1))
        );
    }
}
