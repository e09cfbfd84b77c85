use axum::{
    extract::{Path, State},
    http::StatusCode,
    Json,
};
use serde_json::{json, Value};

use crate::services::business::{BusinessService, ProfilePatch};
use crate::AppState;

/// GET /api/businesses/{business_id}/profile - the effective profile
/// (business defaults overlaid by operator edits).
pub async fn get_profile(
    State(state): State<AppState>,
    Path(business_id): Path<String>,
) -> Result<Json<Value>, (StatusCode, Json<Value>)> {
    let profile = BusinessService::effective_profile(&state.db, &business_id)
        .await
        .map_err(internal)?
        .ok_or_else(not_found)?;

    Ok(Json(json!({
        "ok": true,
        "businessId": profile.business_id,
        "profile": {
            "timezone": profile.timezone.name(),
            "working_hours": profile.working_hours,
            "slot_duration_min": profile.default_duration_min,
            "slot_granularity_min": profile.slot_granularity_min,
            "buffer_before_min": profile.buffer_before_min,
            "buffer_after_min": profile.buffer_after_min,
            "lead_time_min": profile.lead_time_min,
            "max_days_ahead": profile.max_days_ahead,
            "emergency_enabled": profile.emergency_enabled,
            "emergency_phone": profile.emergency_sms_phone,
            "auto_sms_enabled": profile.auto_sms_enabled,
        },
    })))
}

/// PUT /api/businesses/{business_id}/profile - partial patch; validation
/// failures come back 400 with a details list.
pub async fn update_profile(
    State(state): State<AppState>,
    Path(business_id): Path<String>,
    Json(patch): Json<ProfilePatch>,
) -> Result<Json<Value>, (StatusCode, Json<Value>)> {
    BusinessService::get_business(&state.db, &business_id)
        .await
        .map_err(internal)?
        .ok_or_else(not_found)?;

    let errors = BusinessService::update_profile(&state.db, &business_id, &patch)
        .await
        .map_err(internal)?;
    if !errors.is_empty() {
        return Err((
            StatusCode::BAD_REQUEST,
            Json(json!({ "ok": false, "error": "Invalid profile", "details": errors })),
        ));
    }

    let profile = BusinessService::get_profile(&state.db, &business_id)
        .await
        .map_err(internal)?;
    Ok(Json(json!({ "ok": true, "profile": profile })))
}

fn not_found() -> (StatusCode, Json<Value>) {
    (
        StatusCode::NOT_FOUND,
        Json(json!({ "ok": false, "error": "Business not found" })),
    )
}

fn internal(e: anyhow::Error) -> (StatusCode, Json<Value>) {
    tracing::error!(error = %e, "profile request failed");
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Json(json!({ "ok": false, "error": "Internal error" })),
    )
}
