use axum::{extract::State, http::StatusCode, Json};
use serde_json::{json, Value};
use uuid::Uuid;

use crate::models::booking::CreateBookingRequest;
use crate::services::booking::BookingOutcome;
use crate::AppState;

/// POST /api/bookings (and the legacy /api/book alias).
pub async fn create_booking(
    State(state): State<AppState>,
    Json(body): Json<CreateBookingRequest>,
) -> (StatusCode, Json<Value>) {
    let request_id = Uuid::new_v4().to_string();

    match state.orchestrator.create_booking(body, &request_id).await {
        Ok(BookingOutcome::Confirmed {
            booking_id,
            gcal_event_id,
            start_utc,
            end_utc,
            is_emergency,
            emergency_escalated,
        }) => (
            StatusCode::OK,
            Json(json!({
                "ok": true,
                "bookingId": booking_id,
                "status": "confirmed",
                "gcalEventId": gcal_event_id,
                "startUtc": start_utc,
                "endUtc": end_utc,
                "isEmergency": is_emergency,
                "emergencyEscalated": emergency_escalated,
                "requestId": request_id,
            })),
        ),
        Ok(BookingOutcome::ReplayConfirmed { booking_id }) => (
            StatusCode::OK,
            Json(json!({
                "ok": true,
                "status": "confirmed",
                "bookingId": booking_id,
            })),
        ),
        Ok(BookingOutcome::ReplayPending { booking_id }) => (
            StatusCode::ACCEPTED,
            Json(json!({
                "ok": true,
                "status": "pending",
                "bookingId": booking_id,
            })),
        ),
        Err(err) => {
            let (status, body) = err.to_response();
            if status.is_server_error() {
                tracing::error!(%request_id, error = %err, "booking request failed");
            }
            (status, body)
        }
    }
}
