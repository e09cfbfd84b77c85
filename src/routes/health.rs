use axum::{extract::State, http::StatusCode, Json};
use serde_json::{json, Value};

use crate::AppState;

pub async fn health_check(State(state): State<AppState>) -> (StatusCode, Json<Value>) {
    let pending: Result<i64, _> =
        sqlx::query_scalar("SELECT COUNT(*) FROM retry_queue WHERE status = 'pending'")
            .fetch_one(&state.db)
            .await;
    match pending {
        Ok(depth) => (
            StatusCode::OK,
            Json(json!({ "status": "ok", "db": "connected", "retry_queue_pending": depth })),
        ),
        Err(e) => (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(json!({ "status": "error", "db": e.to_string() })),
        ),
    }
}
