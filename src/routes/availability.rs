use axum::{
    extract::{Query, State},
    http::StatusCode,
    Json,
};
use chrono::{NaiveDate, Utc};
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::warn;

use crate::services::availability::{normalize_busy_utc, slots, BusyInterval};
use crate::services::business::BusinessService;
use crate::services::calendar::{CalendarApi, GoogleCalendar};
use crate::AppState;

const DEFAULT_DAYS: i64 = 7;
const MAX_WINDOW_DAYS: i64 = 30;

#[derive(Deserialize)]
pub struct SlotsQuery {
    pub business_id: String,
    /// Local start date YYYY-MM-DD; defaults to today in the tenant tz.
    pub from: Option<String>,
    pub days: Option<i64>,
    pub duration_min: Option<i64>,
}

/// GET /api/available-slots - pure enumeration over confirmed bookings plus
/// the external calendar's busy intervals. Bypasses the orchestrator; every
/// slot shown here is revalidated at booking time anyway.
pub async fn available_slots(
    State(state): State<AppState>,
    Query(query): Query<SlotsQuery>,
) -> Result<Json<Value>, (StatusCode, Json<Value>)> {
    let profile = BusinessService::effective_profile(&state.db, &query.business_id)
        .await
        .map_err(internal)?
        .ok_or_else(|| {
            (
                StatusCode::NOT_FOUND,
                Json(json!({ "ok": false, "error": "Business not found" })),
            )
        })?;

    let now_utc = Utc::now();
    let from_local = match &query.from {
        Some(raw) => NaiveDate::parse_from_str(raw, "%Y-%m-%d").map_err(|_| {
            (
                StatusCode::BAD_REQUEST,
                Json(json!({ "ok": false, "error": "Invalid from date, expected YYYY-MM-DD" })),
            )
        })?,
        None => now_utc.with_timezone(&profile.timezone).date_naive(),
    };
    let days = query.days.unwrap_or(DEFAULT_DAYS).clamp(1, MAX_WINDOW_DAYS);
    let duration_min = query.duration_min.unwrap_or(profile.default_duration_min);
    if duration_min <= 0 || duration_min > 480 {
        return Err((
            StatusCode::BAD_REQUEST,
            Json(json!({ "ok": false, "error": "Invalid duration_min" })),
        ));
    }

    // Window bounds in UTC, padded a day on each side so buffered
    // neighbors at the edges are seen.
    let window_start = from_local
        .and_hms_opt(0, 0, 0)
        .unwrap()
        .and_utc()
        - chrono::Duration::days(1);
    let window_end = window_start + chrono::Duration::days(days + 2);

    let mut busy: Vec<BusyInterval> = state
        .orchestrator
        .ledger()
        .confirmed_bookings_in_window(&query.business_id, window_start, window_end)
        .await
        .map_err(internal)?
        .into_iter()
        .map(|b| BusyInterval {
            start: b.start_utc,
            end: b.end_utc,
        })
        .collect();

    // The external calendar contributes best-effort: a tenant without a
    // connected calendar still sees ledger-derived availability.
    match GoogleCalendar::for_business(&state.config, state.vault.clone(), &query.business_id) {
        Ok(calendar) => match calendar.freebusy(window_start, window_end).await {
            Ok(mut external) => busy.append(&mut external),
            Err(e) => warn!(business_id = %query.business_id, error = %e,
                "freebusy unavailable for slot listing"),
        },
        Err(e) => warn!(business_id = %query.business_id, error = %e,
            "calendar not configured for slot listing"),
    }

    let merged = normalize_busy_utc(&busy, profile.buffer_before_min, profile.buffer_after_min);
    let available = slots(&profile, from_local, days, duration_min, &merged, now_utc);

    Ok(Json(json!({
        "ok": true,
        "businessId": query.business_id,
        "timezone": profile.timezone.name(),
        "from_local": from_local.to_string(),
        "days": days,
        "durationMin": duration_min,
        "count": available.len(),
        "slots": available,
    })))
}

fn internal(e: anyhow::Error) -> (StatusCode, Json<Value>) {
    tracing::error!(error = %e, "available-slots failed");
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Json(json!({ "ok": false, "error": "Internal error" })),
    )
}
