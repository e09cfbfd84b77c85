use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sqlx::types::Json;
use sqlx::FromRow;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "retry_kind", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum RetryKind {
    TwilioSms,
    TwilioCall,
    GcalCreate,
    GcalUpdate,
    GcalDelete,
}

impl RetryKind {
    pub fn as_str(self) -> &'static str {
        match self {
            RetryKind::TwilioSms => "twilio_sms",
            RetryKind::TwilioCall => "twilio_call",
            RetryKind::GcalCreate => "gcal_create",
            RetryKind::GcalUpdate => "gcal_update",
            RetryKind::GcalDelete => "gcal_delete",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "retry_status", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum RetryStatus {
    Pending,
    Succeeded,
    Failed,
}

/// One durable outbox row describing a deferred external side effect.
#[derive(Debug, Clone, FromRow)]
pub struct RetryTask {
    pub id: Uuid,
    pub business_id: String,
    pub booking_id: Option<Uuid>,
    pub kind: RetryKind,
    pub payload: Json<Value>,
    pub attempt_count: i32,
    pub max_attempts: i32,
    pub next_attempt_at: DateTime<Utc>,
    pub last_error: Option<String>,
    pub status: RetryStatus,
    pub created_at: DateTime<Utc>,
}

/// Backoff between attempts: min(30·2^(k−1), 1800) seconds where k is the
/// attempt count after the failure being accounted.
pub fn retry_backoff_secs(attempt_count: i32) -> i64 {
    let k = attempt_count.max(1) as u32;
    let exp = 30i64.saturating_mul(1i64 << (k - 1).min(30));
    exp.min(1800)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_doubles_and_caps() {
        assert_eq!(retry_backoff_secs(1), 30);
        assert_eq!(retry_backoff_secs(2), 60);
        assert_eq!(retry_backoff_secs(3), 120);
        assert_eq!(retry_backoff_secs(4), 240);
        assert_eq!(retry_backoff_secs(5), 480);
        assert_eq!(retry_backoff_secs(6), 960);
        assert_eq!(retry_backoff_secs(7), 1800);
        assert_eq!(retry_backoff_secs(50), 1800);
    }
}
