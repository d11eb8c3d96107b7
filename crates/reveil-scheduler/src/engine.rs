use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use chrono::{DateTime, FixedOffset, Utc};
use futures_util::FutureExt;
use reveil_core::{config::SchedulerConfig, AlarmDefinition, AlarmStore};
use tokio::sync::watch;
use tokio::time::{sleep, sleep_until, timeout, Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::{
    catchup::{self, CatchupDecision},
    clock::{deadline_for, monotonic_delta_ms, Clock, SystemClock},
    error::Result,
    playback::{PlaybackClient, PlaybackError, PlaybackRequest},
    readiness::{ReadinessProber, ReadinessSnapshot},
    schedule,
    state::{PersistedSchedulerState, StateStore},
    telemetry::{EventType, TelemetryEvent, TelemetrySink},
    types::{Outcome, Phase, ScheduledOccurrence, SchedulerStatus},
};

/// Longest grace window honoured; anything larger is clamped.
const MAX_GRACE_WINDOW_SECS: u64 = 24 * 60 * 60;

/// Pause after a panicked cycle before starting the next one.
const PANIC_PAUSE: Duration = Duration::from_secs(1);

/// Timing knobs of the loop, derived from [`SchedulerConfig`].
#[derive(Debug, Clone)]
pub struct SchedulerSettings {
    pub grace_window: chrono::Duration,
    pub trigger_window: Duration,
    pub recheck_interval: Duration,
    pub playback_timeout: Duration,
}

impl From<&SchedulerConfig> for SchedulerSettings {
    fn from(cfg: &SchedulerConfig) -> Self {
        Self {
            grace_window: chrono::Duration::seconds(
                cfg.grace_window_secs.min(MAX_GRACE_WINDOW_SECS) as i64,
            ),
            trigger_window: Duration::from_secs(cfg.trigger_window_secs),
            recheck_interval: Duration::from_secs(cfg.recheck_interval_secs.max(1)),
            playback_timeout: Duration::from_secs(cfg.playback_timeout_secs),
        }
    }
}

enum CycleEnd {
    Continue,
    Shutdown,
}

/// The alarm state machine: `IDLE → ARMED → PROBING → EXECUTING → SETTLED/MISSED`.
///
/// Runs as a single task for the process lifetime and is the only writer of
/// the persisted scheduler state. Cycles run strictly one after another.
pub struct SchedulerEngine {
    store: Arc<AlarmStore>,
    changes: watch::Receiver<u64>,
    prober: ReadinessProber,
    playback: Arc<dyn PlaybackClient>,
    state_store: StateStore,
    state: PersistedSchedulerState,
    telemetry: Arc<dyn TelemetrySink>,
    clock: Arc<dyn Clock>,
    settings: SchedulerSettings,
    status: watch::Sender<SchedulerStatus>,
    /// A one-shot alarm fired but `enabled = false` is not committed yet.
    pending_disable: Option<AlarmDefinition>,
}

impl SchedulerEngine {
    /// Create the engine and load the persisted state.
    ///
    /// Fails only when the state file exists but cannot be read at all.
    pub fn new(
        store: Arc<AlarmStore>,
        prober: ReadinessProber,
        playback: Arc<dyn PlaybackClient>,
        state_store: StateStore,
        telemetry: Arc<dyn TelemetrySink>,
        settings: SchedulerSettings,
    ) -> Result<Self> {
        let state = state_store.load()?;
        let changes = store.subscribe_on_change();
        let mut settings = settings;
        let budget = playback.trigger_budget();
        let effective = trigger_timeout(settings.playback_timeout, budget);
        if effective != settings.playback_timeout {
            warn!(
                client = playback.name(),
                configured = ?settings.playback_timeout,
                raised_to = ?effective,
                "playback timeout shorter than the client's request sequence; raising it"
            );
            settings.playback_timeout = effective;
        }
        let (status, _) = watch::channel(SchedulerStatus {
            last_outcome: state.last_outcome,
            last_outcome_at: state.last_outcome_at,
            catchup_owed: state.catchup_owed,
            ..SchedulerStatus::default()
        });
        Ok(Self {
            store,
            changes,
            prober,
            playback,
            state_store,
            state,
            telemetry,
            clock: Arc::new(SystemClock),
            settings,
            status,
            pending_disable: None,
        })
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Receiver for the status published after every transition.
    pub fn status(&self) -> watch::Receiver<SchedulerStatus> {
        self.status.subscribe()
    }

    /// Main loop. Runs cycles until `shutdown` broadcasts `true`.
    ///
    /// Shutdown is observed only while idle or armed. A panic inside a cycle
    /// is caught here and the armed occurrence is recorded as missed.
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) {
        info!(state_path = %self.state_store.path().display(), "scheduler engine started");
        match self.state.owed_target() {
            Some(armed) => info!(%armed, last_outcome = %self.state.last_outcome, "resuming with an owed occurrence"),
            None => debug!(last_outcome = %self.state.last_outcome, "no owed occurrence"),
        }

        loop {
            if *shutdown.borrow() {
                break;
            }
            match AssertUnwindSafe(self.cycle(&mut shutdown)).catch_unwind().await {
                Ok(CycleEnd::Continue) => {}
                Ok(CycleEnd::Shutdown) => break,
                Err(panic) => {
                    let message = panic
                        .downcast_ref::<&str>()
                        .map(|s| s.to_string())
                        .or_else(|| panic.downcast_ref::<String>().cloned())
                        .unwrap_or_else(|| "unknown panic".to_string());
                    error!(panic = %message, "scheduler cycle panicked");
                    self.recover_from_panic();
                    sleep(PANIC_PAUSE).await;
                }
            }
        }
        info!("scheduler engine shutting down");
    }

    // --- cycle -------------------------------------------------------------

    async fn cycle(&mut self, shutdown: &mut watch::Receiver<bool>) -> CycleEnd {
        if let Some(fired) = self.pending_disable.clone() {
            if !self.disable_one_shot(&fired).await {
                self.publish(Phase::Idle, None);
                return self.idle_wait(shutdown).await;
            }
        }

        // Mark the current revision seen before snapshotting, so a change
        // racing with the snapshot still wakes us.
        let _ = self.changes.borrow_and_update();
        let mut definition = self.store.load_snapshot().await;

        if !definition.enabled {
            if self.state.owed_target().is_some() {
                info!("alarm disabled; releasing the armed occurrence");
                self.state.release();
                self.persist();
            }
            self.publish(Phase::Idle, None);
            return self.idle_wait(shutdown).await;
        }

        let now = self.clock.now_utc();
        let mono = self.clock.monotonic();
        let occurrence = match self.owed_catchup(&definition, now, mono) {
            Some(occ) => occ,
            None => match self.next_occurrence(&definition, now, mono) {
                Some(occ) => occ,
                None => {
                    warn!(time = %definition.time_of_day, "alarm has no upcoming occurrence");
                    self.publish(Phase::Idle, None);
                    return self.idle_wait(shutdown).await;
                }
            },
        };

        let cycle_id = Uuid::now_v7();
        if self.state.arm(occurrence.target_fixed()) {
            self.persist();
        }
        self.publish(Phase::Armed, Some(occurrence.target_fixed()));
        self.emit(self.event(EventType::Armed, cycle_id, &occurrence));
        info!(%cycle_id, target = %occurrence.target, "alarm armed");

        // ARMED: sleep towards the deadline in recheck-sized naps; every wake
        // re-derives the remaining time from the wall clock.
        let mut occurrence = occurrence;
        loop {
            let now = self.clock.now_utc();
            if now >= occurrence.target_utc() {
                break;
            }
            let mono = self.clock.monotonic();
            occurrence.deadline = deadline_for(occurrence.target_utc(), now, mono);
            let wake = occurrence.deadline.min(mono + self.settings.recheck_interval);

            tokio::select! {
                _ = sleep_until(wake) => {}
                _ = self.changes.changed() => {
                    let latest = self.store.load_snapshot().await;
                    if let Some(reason) = interruption(&definition, &latest) {
                        self.abort(cycle_id, &occurrence, reason, None);
                        return CycleEnd::Continue;
                    }
                    definition = latest;
                }
                res = shutdown.changed() => {
                    if res.is_err() || *shutdown.borrow() {
                        return CycleEnd::Shutdown;
                    }
                }
            }
        }

        let now = self.clock.now_utc();
        match catchup::decide(
            occurrence.target_utc(),
            now,
            self.settings.grace_window,
            &self.state,
        ) {
            CatchupDecision::ExecuteNow => {}
            CatchupDecision::DeferToNext => {
                self.settle(
                    cycle_id,
                    &occurrence,
                    Outcome::Missed,
                    Some("grace window elapsed before the trigger window opened".into()),
                    None,
                );
                return CycleEnd::Continue;
            }
            CatchupDecision::AlreadyHandled => {
                debug!(%cycle_id, target = %occurrence.target, "occurrence already handled");
                return CycleEnd::Continue;
            }
            CatchupDecision::NotYetDue => return CycleEnd::Continue,
        }

        let latest = self.store.load_snapshot().await;
        if let Some(reason) = interruption(&definition, &latest) {
            self.abort(cycle_id, &occurrence, reason, None);
            return CycleEnd::Continue;
        }

        self.run_window(cycle_id, occurrence, latest).await
    }

    /// PROBING then, when ready, EXECUTING. Always ends in a recorded outcome
    /// or an abort.
    async fn run_window(
        &mut self,
        cycle_id: Uuid,
        occurrence: ScheduledOccurrence,
        mut definition: AlarmDefinition,
    ) -> CycleEnd {
        self.publish(Phase::Probing, Some(occurrence.target_fixed()));
        self.emit(self.event(EventType::Probing, cycle_id, &occurrence));

        let cancel = CancellationToken::new();
        let window_open = self.clock.monotonic();
        let window_deadline = window_open + self.settings.trigger_window;
        let device_name = definition.device_name.clone();
        let mut interrupted = None;

        let snapshot = {
            let probe = self
                .prober
                .probe(&device_name, window_open, window_deadline, &cancel);
            tokio::pin!(probe);
            loop {
                tokio::select! {
                    snapshot = &mut probe => break snapshot,
                    _ = self.changes.changed(), if interrupted.is_none() => {
                        let latest = self.store.load_snapshot().await;
                        match interruption(&definition, &latest) {
                            Some(reason) => {
                                interrupted = Some(reason);
                                cancel.cancel();
                            }
                            None => definition = latest,
                        }
                    }
                }
            }
        };

        if let Some(reason) = interrupted.or(snapshot.cancelled.then_some("cancelled")) {
            self.abort(cycle_id, &occurrence, reason, Some(snapshot));
            return CycleEnd::Continue;
        }

        // Last look at the definition before the one trigger call.
        let latest = self.store.load_snapshot().await;
        if let Some(reason) = interruption(&definition, &latest) {
            self.abort(cycle_id, &occurrence, reason, Some(snapshot));
            return CycleEnd::Continue;
        }
        let definition = latest;

        if !snapshot.overall_ready {
            self.settle(
                cycle_id,
                &occurrence,
                Outcome::Missed,
                Some("dependencies not ready within the trigger window".into()),
                Some(snapshot),
            );
            return CycleEnd::Continue;
        }
        let Some(device) = snapshot.resolved_device.clone() else {
            self.settle(
                cycle_id,
                &occurrence,
                Outcome::Missed,
                Some("no device resolved".into()),
                Some(snapshot),
            );
            return CycleEnd::Continue;
        };
        if self.state.is_handled(occurrence.target_utc()) {
            warn!(%cycle_id, target = %occurrence.target, "occurrence settled while probing; not triggering");
            return CycleEnd::Continue;
        }

        self.publish(Phase::Executing, Some(occurrence.target_fixed()));
        self.emit(
            self.event(EventType::Executing, cycle_id, &occurrence)
                .with_readiness(snapshot.clone()),
        );

        let request = PlaybackRequest::new(&definition, device);
        info!(
            %cycle_id,
            client = self.playback.name(),
            device = %request.device.name,
            playback_target = %request.playback_target,
            "triggering playback"
        );
        let (outcome, detail) = match timeout(
            self.settings.playback_timeout,
            self.playback.trigger_playback(&request),
        )
        .await
        {
            Ok(Ok(())) => (Outcome::Success, None),
            Ok(Err(e)) => (Outcome::Failed, Some(e.to_string())),
            Err(_) => {
                let e = PlaybackError::Timeout {
                    ms: self.settings.playback_timeout.as_millis() as u64,
                };
                (Outcome::Failed, Some(e.to_string()))
            }
        };

        // The disable must be durable before the next occurrence is computed.
        if outcome == Outcome::Success && definition.one_shot {
            self.disable_one_shot(&definition).await;
        }
        self.settle(cycle_id, &occurrence, outcome, detail, Some(snapshot));
        CycleEnd::Continue
    }

    // --- helpers -----------------------------------------------------------

    async fn idle_wait(&mut self, shutdown: &mut watch::Receiver<bool>) -> CycleEnd {
        tokio::select! {
            _ = sleep(self.settings.recheck_interval) => CycleEnd::Continue,
            _ = self.changes.changed() => CycleEnd::Continue,
            res = shutdown.changed() => {
                if res.is_err() || *shutdown.borrow() {
                    CycleEnd::Shutdown
                } else {
                    CycleEnd::Continue
                }
            }
        }
    }

    /// Next occurrence at or after `now`, never at or before an occurrence
    /// that already has a recorded outcome.
    fn next_occurrence(
        &self,
        definition: &AlarmDefinition,
        now: DateTime<Utc>,
        mono: Instant,
    ) -> Option<ScheduledOccurrence> {
        let reference = self
            .state
            .reference_floor()
            .map_or(now, |floor| floor.max(now));
        let mut occurrence = schedule::compute_next(definition, reference, mono)?;
        if reference > now {
            occurrence.deadline = deadline_for(occurrence.target_utc(), now, mono);
        }
        Some(occurrence)
    }

    /// Resolve an armed occurrence whose target has already passed (restart,
    /// suspend). Returns it when it should still execute.
    fn owed_catchup(
        &mut self,
        definition: &AlarmDefinition,
        now: DateTime<Utc>,
        mono: Instant,
    ) -> Option<ScheduledOccurrence> {
        let armed = self.state.owed_target()?;
        let armed_utc = armed.with_timezone(&Utc);
        if armed_utc > now {
            return None;
        }
        if !schedule::occurs_at(definition, armed_utc) {
            info!(%armed, "armed occurrence no longer matches the alarm; releasing");
            self.state.release();
            self.persist();
            return None;
        }

        let occurrence = ScheduledOccurrence {
            target: armed_utc.with_timezone(&definition.timezone),
            deadline: deadline_for(armed_utc, now, mono),
        };
        match catchup::decide(armed_utc, now, self.settings.grace_window, &self.state) {
            CatchupDecision::ExecuteNow => {
                warn!(
                    %armed,
                    late_by_secs = (now - armed_utc).num_seconds(),
                    "catching up on an owed occurrence"
                );
                Some(occurrence)
            }
            CatchupDecision::DeferToNext => {
                self.settle(
                    Uuid::now_v7(),
                    &occurrence,
                    Outcome::Missed,
                    Some("grace window elapsed while the scheduler was not running".into()),
                    None,
                );
                None
            }
            CatchupDecision::AlreadyHandled => {
                self.state.release();
                self.persist();
                None
            }
            CatchupDecision::NotYetDue => None,
        }
    }

    /// Commit `enabled = false` unless the alarm was redefined meanwhile.
    /// On failure the commit is retried at the start of the next cycle.
    async fn disable_one_shot(&mut self, fired: &AlarmDefinition) -> bool {
        let result = self
            .store
            .transactional_update(|d| {
                if !d.redefines(fired) {
                    d.enabled = false;
                }
            })
            .await;
        match result {
            Ok(def) => {
                info!(enabled = def.enabled, "one-shot alarm committed");
                self.pending_disable = None;
                true
            }
            Err(e) => {
                error!(error = %e, "failed to disable one-shot alarm; will retry before re-arming");
                self.pending_disable = Some(fired.clone());
                false
            }
        }
    }

    fn settle(
        &mut self,
        cycle_id: Uuid,
        occurrence: &ScheduledOccurrence,
        outcome: Outcome,
        detail: Option<String>,
        snapshot: Option<ReadinessSnapshot>,
    ) {
        let now = self.clock.now_utc();
        if self
            .state
            .record(occurrence.target_fixed(), outcome, now.fixed_offset())
        {
            self.persist();
        }

        let (phase, event_type) = match outcome {
            Outcome::Success => (Phase::Settled, EventType::Settled),
            _ => (Phase::Missed, EventType::Missed),
        };
        match outcome {
            Outcome::Success => info!(%cycle_id, target = %occurrence.target, "alarm settled"),
            _ => warn!(
                %cycle_id,
                target = %occurrence.target,
                %outcome,
                detail = detail.as_deref().unwrap_or(""),
                "alarm not played"
            ),
        }

        let mut event = self
            .event(event_type, cycle_id, occurrence)
            .with_outcome(outcome);
        if let Some(snapshot) = snapshot {
            event = event.with_readiness(snapshot);
        }
        if let Some(detail) = detail {
            event = event.with_detail(detail);
        }
        self.emit(event);
        self.publish(phase, None);
    }

    fn abort(
        &mut self,
        cycle_id: Uuid,
        occurrence: &ScheduledOccurrence,
        reason: &str,
        snapshot: Option<ReadinessSnapshot>,
    ) {
        info!(%cycle_id, target = %occurrence.target, %reason, "cycle aborted");
        self.state.release();
        self.persist();

        let mut event = self
            .event(EventType::Aborted, cycle_id, occurrence)
            .with_detail(reason);
        if let Some(snapshot) = snapshot {
            event = event.with_readiness(snapshot);
        }
        self.emit(event);
        self.publish(Phase::Aborted, None);
    }

    fn recover_from_panic(&mut self) {
        let Some(target) = self.state.owed_target() else {
            self.publish(Phase::Idle, None);
            return;
        };
        let now = self.clock.now_utc();
        if self.state.record(target, Outcome::Missed, now.fixed_offset()) {
            self.persist();
        }
        let delta_ms = (now - target.with_timezone(&Utc)).num_milliseconds();
        self.emit(
            TelemetryEvent::new(EventType::Missed, Uuid::now_v7(), target, now, delta_ms)
                .with_outcome(Outcome::Missed)
                .with_detail("scheduling cycle panicked"),
        );
        self.publish(Phase::Missed, None);
    }

    fn persist(&self) {
        if let Err(e) = self.state_store.save(&self.state) {
            error!(
                path = %self.state_store.path().display(),
                error = %e,
                "failed to persist scheduler state; restart recovery may act on stale data"
            );
        }
    }

    fn event(
        &self,
        event_type: EventType,
        cycle_id: Uuid,
        occurrence: &ScheduledOccurrence,
    ) -> TelemetryEvent {
        TelemetryEvent::new(
            event_type,
            cycle_id,
            occurrence.target_fixed(),
            self.clock.now_utc(),
            monotonic_delta_ms(self.clock.monotonic(), occurrence.deadline),
        )
    }

    fn emit(&self, event: TelemetryEvent) {
        self.telemetry.emit(&event);
    }

    fn publish(&self, phase: Phase, next_target: Option<DateTime<FixedOffset>>) {
        self.status.send_replace(SchedulerStatus {
            phase,
            next_target,
            last_outcome: self.state.last_outcome,
            last_outcome_at: self.state.last_outcome_at,
            catchup_owed: self.state.catchup_owed,
        });
    }
}

/// Timeout for the single trigger call: the configured value, or the
/// client's worst case when that is longer.
fn trigger_timeout(configured: Duration, client_budget: Option<Duration>) -> Duration {
    client_budget.map_or(configured, |budget| budget.max(configured))
}

/// Why a change to the definition ends the in-flight cycle, if it does.
fn interruption(current: &AlarmDefinition, latest: &AlarmDefinition) -> Option<&'static str> {
    if !latest.enabled {
        Some("alarm disabled")
    } else if latest.redefines(current) {
        Some("alarm redefined")
    } else {
        None
    }
}
