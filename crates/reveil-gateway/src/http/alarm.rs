use axum::{extract::State, http::StatusCode, Json};
use reveil_core::{AlarmDefinition, CoreError};
use serde_json::{json, Value};
use std::sync::Arc;
use tracing::warn;

use crate::app::AppState;

/// GET /alarm — current definition.
pub async fn get_alarm(State(state): State<Arc<AppState>>) -> Json<AlarmDefinition> {
    Json(state.store.load_snapshot().await)
}

/// PUT /alarm — replace the definition through the transactional store.
///
/// Invalid definitions are rejected here and never reach the scheduler.
pub async fn put_alarm(
    State(state): State<Arc<AppState>>,
    Json(definition): Json<AlarmDefinition>,
) -> Result<Json<AlarmDefinition>, (StatusCode, Json<Value>)> {
    match state.store.replace(definition).await {
        Ok(saved) => Ok(Json(saved)),
        Err(e) => {
            warn!(error = %e, "alarm update rejected");
            let status = match e {
                CoreError::InvalidAlarm(_) => StatusCode::UNPROCESSABLE_ENTITY,
                _ => StatusCode::INTERNAL_SERVER_ERROR,
            };
            Err((
                status,
                Json(json!({ "error": e.code(), "message": e.to_string() })),
            ))
        }
    }
}
