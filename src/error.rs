use axum::http::StatusCode;
use axum::Json;
use serde_json::{json, Value};
use thiserror::Error;

/// Domain error taxonomy, mapped to the HTTP contract at the route boundary.
/// Server-side failures never leak detail to clients: anything 5xx is
/// rendered as a generic "Internal error" and the specifics go to the logs.
#[derive(Debug, Error)]
pub enum BookingError {
    #[error("Business not found")]
    BusinessNotFound,

    /// Missing/invalid request fields, joined into one message.
    #[error("{0}")]
    Validation(String),

    #[error("INVALID_BOOKING_TIME_WINDOW")]
    TimeWindow {
        reason: TimeWindowViolation,
        detail: String,
    },

    #[error("SLOT_ALREADY_BOOKED")]
    SlotAlreadyBooked,

    #[error("Google Calendar is not connected")]
    NoGoogleTokens,

    #[error("GOOGLE_OAUTH_NOT_CONFIGURED")]
    OAuthNotConfigured,

    #[error("GOOGLE_TIMEOUT")]
    GoogleTimeout,

    #[error("GOOGLE_EVENTS_INSERT_FAILED")]
    EventInsertFailed,

    /// Internal programming error - a caller asked for a transition the
    /// status machine forbids.
    #[error("INVALID_STATUS_TRANSITION: {from} -> {to}")]
    InvalidStatusTransition {
        from: &'static str,
        to: &'static str,
    },

    #[error(transparent)]
    Db(#[from] sqlx::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimeWindowViolation {
    StartTooSoon,
    StartTooFar,
}

impl TimeWindowViolation {
    pub fn as_str(&self) -> &'static str {
        match self {
            TimeWindowViolation::StartTooSoon => "START_TOO_SOON",
            TimeWindowViolation::StartTooFar => "START_TOO_FAR",
        }
    }
}

impl BookingError {
    pub fn status(&self) -> StatusCode {
        match self {
            BookingError::BusinessNotFound => StatusCode::NOT_FOUND,
            BookingError::Validation(_) | BookingError::TimeWindow { .. } => {
                StatusCode::BAD_REQUEST
            }
            BookingError::SlotAlreadyBooked => StatusCode::CONFLICT,
            BookingError::NoGoogleTokens => StatusCode::FORBIDDEN,
            BookingError::OAuthNotConfigured
            | BookingError::GoogleTimeout
            | BookingError::EventInsertFailed
            | BookingError::InvalidStatusTransition { .. }
            | BookingError::Db(_)
            | BookingError::Other(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    pub fn to_response(&self) -> (StatusCode, Json<Value>) {
        let status = self.status();
        let body = if status.is_server_error() {
            json!({ "ok": false, "error": "Internal error" })
        } else {
            match self {
                BookingError::TimeWindow { reason, detail } => json!({
                    "ok": false,
                    "error": "INVALID_BOOKING_TIME_WINDOW",
                    "details": [{ "reason": reason.as_str(), "message": detail }],
                }),
                BookingError::SlotAlreadyBooked => {
                    json!({ "ok": false, "error": "SLOT_ALREADY_BOOKED" })
                }
                other => json!({ "ok": false, "error": other.to_string() }),
            }
        };
        (status, Json(body))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn server_errors_are_masked() {
        let err = BookingError::OAuthNotConfigured;
        let (status, body) = err.to_response();
        assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(body.0["error"], "Internal error");
    }

    #[test]
    fn time_window_carries_reason_detail() {
        let err = BookingError::TimeWindow {
            reason: TimeWindowViolation::StartTooSoon,
            detail: "requested start is before the lead-time minimum".into(),
        };
        let (status, body) = err.to_response();
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body.0["details"][0]["reason"], "START_TOO_SOON");
    }

    #[test]
    fn conflict_maps_to_409() {
        assert_eq!(
            BookingError::SlotAlreadyBooked.status(),
            StatusCode::CONFLICT
        );
    }
}
