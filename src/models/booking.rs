use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "booking_status", rename_all = "snake_case")]
#[serde(rename_all = "lowercase")]
pub enum BookingStatus {
    Pending,
    Confirmed,
    Cancelled,
    Failed,
}

impl BookingStatus {
    /// pending → {confirmed, failed, cancelled}; confirmed → {cancelled};
    /// failed and cancelled are terminal.
    pub fn can_transition_to(self, next: BookingStatus) -> bool {
        use BookingStatus::*;
        matches!(
            (self, next),
            (Pending, Confirmed) | (Pending, Failed) | (Pending, Cancelled) | (Confirmed, Cancelled)
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            BookingStatus::Pending => "pending",
            BookingStatus::Confirmed => "confirmed",
            BookingStatus::Cancelled => "cancelled",
            BookingStatus::Failed => "failed",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Booking {
    pub id: Uuid,
    pub business_id: String,
    pub start_utc: DateTime<Utc>,
    pub end_utc: DateTime<Utc>,
    pub overlap_start: DateTime<Utc>,
    pub overlap_end: DateTime<Utc>,
    pub status: BookingStatus,
    pub hold_expires_at: Option<DateTime<Utc>>,
    pub customer_name: Option<String>,
    pub customer_phone: Option<String>,
    pub customer_email: Option<String>,
    pub customer_address: Option<String>,
    pub service_type: Option<String>,
    pub notes: Option<String>,
    pub is_emergency: bool,
    pub job_summary: Option<String>,
    pub gcal_event_id: Option<String>,
    pub slot_key: String,
    pub idempotency_key: String,
    pub failure_reason: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Customer {
    pub name: Option<String>,
    pub phone: Option<String>,
    pub email: Option<String>,
    pub address: Option<String>,
}

/// Inbound booking request. The public API accepts both camelCase and
/// snake_case for every field; normalization happens once at this boundary
/// and nothing downstream ever looks at which alias was supplied.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct CreateBookingRequest {
    #[serde(rename = "businessId", alias = "business_id")]
    pub business_id: Option<String>,
    #[serde(rename = "startLocal", alias = "start_local")]
    pub start_local: Option<String>,
    pub timezone: Option<String>,
    #[serde(rename = "durationMins", alias = "duration_min", alias = "duration_mins")]
    pub duration_mins: Option<i64>,
    #[serde(rename = "bufferMins", alias = "buffer_min", alias = "buffer_mins")]
    pub buffer_mins: Option<i64>,
    pub service: Option<String>,
    #[serde(rename = "isEmergency", alias = "is_emergency")]
    pub is_emergency: Option<bool>,
    #[serde(default)]
    pub customer: Customer,
    pub notes: Option<String>,
    // Historical payloads put the address at the top level under any of
    // these names; all are treated as customer.address.
    #[serde(rename = "customerAddress", alias = "customer_address")]
    pub customer_address: Option<String>,
    #[serde(rename = "serviceAddress", alias = "service_address")]
    pub service_address: Option<String>,
    pub address: Option<String>,
}

impl CreateBookingRequest {
    /// Fold the top-level address aliases into customer.address (first
    /// non-empty wins, explicit customer.address first).
    pub fn canonical_address(&self) -> Option<String> {
        [
            self.customer.address.as_deref(),
            self.customer_address.as_deref(),
            self.service_address.as_deref(),
            self.address.as_deref(),
        ]
        .into_iter()
        .flatten()
        .map(str::trim)
        .find(|s| !s.is_empty())
        .map(str::to_owned)
    }
}

/// Everything the ledger needs to insert a pending hold row.
#[derive(Debug, Clone)]
pub struct PendingHold {
    pub business_id: String,
    pub start_utc: DateTime<Utc>,
    pub end_utc: DateTime<Utc>,
    pub overlap_start: DateTime<Utc>,
    pub overlap_end: DateTime<Utc>,
    pub hold_expires_at: DateTime<Utc>,
    pub customer: Customer,
    pub service_type: Option<String>,
    pub notes: Option<String>,
    pub is_emergency: bool,
    pub job_summary: String,
    pub slot_key: String,
    pub idempotency_key: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_machine_closure() {
        use BookingStatus::*;
        assert!(Pending.can_transition_to(Confirmed));
        assert!(Pending.can_transition_to(Failed));
        assert!(Pending.can_transition_to(Cancelled));
        assert!(Confirmed.can_transition_to(Cancelled));
        // confirmed must never regress to failed or pending
        assert!(!Confirmed.can_transition_to(Failed));
        assert!(!Confirmed.can_transition_to(Pending));
        // terminal states stay terminal
        for next in [Pending, Confirmed, Cancelled, Failed] {
            assert!(!Failed.can_transition_to(next));
            assert!(!Cancelled.can_transition_to(next));
        }
    }

    #[test]
    fn accepts_both_alias_styles() {
        let camel: CreateBookingRequest = serde_json::from_str(
            r#"{"businessId":"b1","startLocal":"2026-01-12T09:00:00","timezone":"America/Chicago","durationMins":60}"#,
        )
        .unwrap();
        let snake: CreateBookingRequest = serde_json::from_str(
            r#"{"business_id":"b1","start_local":"2026-01-12T09:00:00","timezone":"America/Chicago","duration_min":60}"#,
        )
        .unwrap();
        assert_eq!(camel.business_id.as_deref(), Some("b1"));
        assert_eq!(snake.business_id.as_deref(), Some("b1"));
        assert_eq!(camel.duration_mins, snake.duration_mins);
    }

    #[test]
    fn address_aliases_collapse_to_customer_address() {
        let req: CreateBookingRequest = serde_json::from_str(
            r#"{"business_id":"b1","service_address":"12 Oak St"}"#,
        )
        .unwrap();
        assert_eq!(req.canonical_address().as_deref(), Some("12 Oak St"));

        let explicit: CreateBookingRequest = serde_json::from_str(
            r#"{"customer":{"address":"1 Elm"},"address":"ignored"}"#,
        )
        .unwrap();
        assert_eq!(explicit.canonical_address().as_deref(), Some("1 Elm"));
    }
}
