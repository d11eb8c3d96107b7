use axum::{extract::State, Json};
use serde_json::{json, Value};
use std::sync::Arc;

use crate::app::AppState;

/// GET /health — liveness plus the scheduler's current view.
pub async fn health_handler(State(state): State<Arc<AppState>>) -> Json<Value> {
    let status = state.status.borrow().clone();
    let alarm = state.store.load_snapshot().await;
    Json(json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
        "commit": env!("REVEIL_GIT_SHA"),
        "alarm_enabled": alarm.enabled,
        "alarm_revision": state.store.revision(),
        "scheduler": status,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use reveil_core::AlarmStore;
    use reveil_scheduler::{Phase, SchedulerStatus};
    use rusqlite::Connection;
    use tokio::sync::watch;

    #[tokio::test]
    async fn reports_phase_and_alarm_state() {
        let store = Arc::new(AlarmStore::open(Connection::open_in_memory().unwrap(), None).unwrap());
        let (tx, rx) = watch::channel(SchedulerStatus::default());
        tx.send_replace(SchedulerStatus {
            phase: Phase::Armed,
            ..SchedulerStatus::default()
        });
        let state = Arc::new(AppState::new(store, rx));

        let Json(body) = health_handler(State(state)).await;
        assert_eq!(body["status"], "ok");
        assert_eq!(body["alarm_enabled"], false);
        assert_eq!(body["scheduler"]["phase"], "armed");
        assert_eq!(body["scheduler"]["last_outcome"], "none");
    }
}
