use std::sync::Arc;

use axum::{routing::get, Router};
use reveil_core::AlarmStore;
use reveil_scheduler::SchedulerStatus;
use tokio::sync::watch;

/// Shared state passed as `Arc<AppState>` to all Axum handlers.
pub struct AppState {
    /// The same store the scheduler reads; handlers write through it.
    pub store: Arc<AlarmStore>,
    pub status: watch::Receiver<SchedulerStatus>,
}

impl AppState {
    pub fn new(store: Arc<AlarmStore>, status: watch::Receiver<SchedulerStatus>) -> Self {
        Self { store, status }
    }
}

pub fn build_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/health", get(crate::http::health::health_handler))
        .route(
            "/alarm",
            get(crate::http::alarm::get_alarm).put(crate::http::alarm::put_alarm),
        )
        .with_state(state)
        .layer(tower_http::trace::TraceLayer::new_for_http())
}
