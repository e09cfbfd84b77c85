use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "sms_kind", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum SmsKind {
    Confirmation,
    AutoSms,
    EmergencyNotify,
    MissedCall,
    Unavailable,
}

impl SmsKind {
    pub fn as_str(self) -> &'static str {
        match self {
            SmsKind::Confirmation => "confirmation",
            SmsKind::AutoSms => "auto_sms",
            SmsKind::EmergencyNotify => "emergency_notify",
            SmsKind::MissedCall => "missed_call",
            SmsKind::Unavailable => "unavailable",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "sms_status", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum SmsStatus {
    Queued,
    Sent,
    Failed,
}

#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct SmsLog {
    pub id: Uuid,
    pub business_id: String,
    pub booking_id: Option<Uuid>,
    pub to_number: Option<String>,
    pub from_number: Option<String>,
    pub body: Option<String>,
    pub provider_message_id: Option<String>,
    pub kind: SmsKind,
    pub status: SmsStatus,
    pub error_message: Option<String>,
    pub dedupe_key: Option<String>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "call_status", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum CallStatus {
    Started,
    Completed,
    Failed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "escalation_type", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum EscalationType {
    Sms,
    Call,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "escalation_status", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum EscalationStatus {
    Sent,
    Failed,
}

/// Dedupe key for outbound SMS: `{business}:{requestId}:{kind}[:{reason}]`.
pub fn sms_dedupe_key(
    business_id: &str,
    request_id: &str,
    kind: SmsKind,
    reason: Option<&str>,
) -> String {
    match reason {
        Some(r) => format!("{business_id}:{request_id}:{}:{r}", kind.as_str()),
        None => format!("{business_id}:{request_id}:{}", kind.as_str()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dedupe_key_formats() {
        assert_eq!(
            sms_dedupe_key("b1", "req-9", SmsKind::MissedCall, None),
            "b1:req-9:missed_call"
        );
        assert_eq!(
            sms_dedupe_key("b1", "req-9", SmsKind::Unavailable, Some("after_hours")),
            "b1:req-9:unavailable:after_hours"
        );
    }
}
