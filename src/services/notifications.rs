use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use sqlx::PgPool;
use tracing::{info, warn};
use uuid::Uuid;

use crate::models::booking::{Booking, BookingStatus};
use crate::models::business::EffectiveProfile;
use crate::models::logs::{
    sms_dedupe_key, EscalationStatus, EscalationType, SmsKind, SmsStatus,
};
use crate::services::observe::timed;

/// Injectable SMS/voice provider so tests and the retry worker can swap the
/// wire client out.
#[async_trait]
pub trait SmsProvider: Send + Sync {
    /// Returns the provider message sid.
    async fn send_sms(&self, to: &str, body: &str) -> anyhow::Result<String>;
    /// Returns the provider call sid.
    async fn make_call(&self, to: &str, twiml: &str) -> anyhow::Result<String>;
}

/// Twilio REST client: HTTP Basic auth, urlencoded form payloads.
pub struct TwilioClient {
    http: Client,
    account_sid: Option<String>,
    auth_token: Option<String>,
    from_number: Option<String>,
}

impl TwilioClient {
    pub fn new(
        account_sid: Option<String>,
        auth_token: Option<String>,
        from_number: Option<String>,
    ) -> Self {
        Self {
            http: Client::new(),
            account_sid,
            auth_token,
            from_number,
        }
    }

    fn credentials(&self) -> anyhow::Result<(&str, &str, &str)> {
        match (&self.account_sid, &self.auth_token, &self.from_number) {
            (Some(sid), Some(token), Some(from)) => Ok((sid, token, from)),
            _ => anyhow::bail!(
                "Twilio is not configured (account sid, auth token or sender missing)"
            ),
        }
    }
}

#[async_trait]
impl SmsProvider for TwilioClient {
    async fn send_sms(&self, to: &str, body: &str) -> anyhow::Result<String> {
        let (sid, token, from) = self.credentials()?;
        let response = self
            .http
            .post(format!(
                "https://api.twilio.com/2010-04-01/Accounts/{sid}/Messages.json"
            ))
            .basic_auth(sid, Some(token))
            .form(&[("To", to), ("From", from), ("Body", body)])
            .send()
            .await?;
        if !response.status().is_success() {
            let status = response.status();
            let text = response.text().await.unwrap_or_default();
            anyhow::bail!("Twilio SMS failed ({status}): {text}");
        }
        let parsed: serde_json::Value = response.json().await?;
        Ok(parsed["sid"].as_str().unwrap_or_default().to_string())
    }

    async fn make_call(&self, to: &str, twiml: &str) -> anyhow::Result<String> {
        let (sid, token, from) = self.credentials()?;
        let response = self
            .http
            .post(format!(
                "https://api.twilio.com/2010-04-01/Accounts/{sid}/Calls.json"
            ))
            .basic_auth(sid, Some(token))
            .form(&[("To", to), ("From", from), ("Twiml", twiml)])
            .send()
            .await?;
        if !response.status().is_success() {
            let status = response.status();
            let text = response.text().await.unwrap_or_default();
            anyhow::bail!("Twilio call failed ({status}): {text}");
        }
        let parsed: serde_json::Value = response.json().await?;
        Ok(parsed["sid"].as_str().unwrap_or_default().to_string())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SendOutcome {
    pub ok: bool,
    pub skipped: bool,
    pub sid: Option<String>,
    pub error: Option<String>,
}

pub struct NotificationService {
    pool: PgPool,
    provider: Arc<dyn SmsProvider>,
    fallback_emergency_phone: Option<String>,
}

impl NotificationService {
    pub fn new(
        pool: PgPool,
        provider: Arc<dyn SmsProvider>,
        fallback_emergency_phone: Option<String>,
    ) -> Self {
        Self {
            pool,
            provider,
            fallback_emergency_phone,
        }
    }

    pub fn provider(&self) -> Arc<dyn SmsProvider> {
        self.provider.clone()
    }

    /// Append one sms_log row.
    #[allow(clippy::too_many_arguments)]
    pub async fn log_sms(
        &self,
        business_id: &str,
        booking_id: Option<Uuid>,
        to: Option<&str>,
        body: Option<&str>,
        sid: Option<&str>,
        kind: SmsKind,
        status: SmsStatus,
        error_message: Option<&str>,
        dedupe_key: Option<&str>,
    ) -> anyhow::Result<()> {
        sqlx::query(
            "INSERT INTO sms_log
                (id, business_id, booking_id, to_number, body, provider_message_id,
                 kind, status, error_message, dedupe_key)
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)",
        )
        .bind(Uuid::new_v4())
        .bind(business_id)
        .bind(booking_id)
        .bind(to)
        .bind(body)
        .bind(sid)
        .bind(kind)
        .bind(status)
        .bind(error_message)
        .bind(dedupe_key)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn dedupe_seen(&self, dedupe_key: &str) -> anyhow::Result<bool> {
        let existing: Option<Uuid> =
            sqlx::query_scalar("SELECT id FROM sms_log WHERE dedupe_key = $1")
                .bind(dedupe_key)
                .fetch_optional(&self.pool)
                .await?;
        Ok(existing.is_some())
    }

    /// Confirmation SMS for a just-confirmed booking. Skips (not an error)
    /// when the booking is not confirmed or the customer left no phone.
    pub async fn send_booking_confirmation(
        &self,
        booking: &Booking,
        profile: &EffectiveProfile,
    ) -> anyhow::Result<SendOutcome> {
        if booking.status != BookingStatus::Confirmed {
            return Ok(skipped());
        }
        let Some(phone) = booking.customer_phone.as_deref().filter(|p| !p.is_empty()) else {
            return Ok(skipped());
        };

        let body = confirmation_sms_body(booking, profile);
        match self.provider.send_sms(phone, &body).await {
            Ok(sid) => Ok(SendOutcome {
                ok: true,
                skipped: false,
                sid: Some(sid),
                error: None,
            }),
            Err(e) => Ok(SendOutcome {
                ok: false,
                skipped: false,
                sid: None,
                error: Some(e.to_string()),
            }),
        }
    }

    /// Emergency escalation: SMS to the technician (business emergency
    /// phone, falling back to the configured default), then a voice call
    /// when the business has a call target. Every attempt lands in
    /// emergency_log; failures never bubble to the booking path.
    pub async fn handle_emergency(&self, booking: &Booking, profile: &EffectiveProfile) {
        let Some(phone) = profile
            .emergency_sms_phone
            .clone()
            .or_else(|| self.fallback_emergency_phone.clone())
        else {
            warn!(
                business_id = %booking.business_id,
                "emergency escalation skipped: no technician phone"
            );
            return;
        };

        let body = emergency_sms_body(booking);
        let mut attempt = 0u32;
        loop {
            attempt += 1;
            match self.provider.send_sms(&phone, &body).await {
                Ok(_) => {
                    let _ = self
                        .log_emergency(
                            booking,
                            &phone,
                            EscalationType::Sms,
                            EscalationStatus::Sent,
                            None,
                        )
                        .await;
                    break;
                }
                Err(e) => {
                    let _ = self
                        .log_emergency(
                            booking,
                            &phone,
                            EscalationType::Sms,
                            EscalationStatus::Failed,
                            Some(&e.to_string()),
                        )
                        .await;
                    if attempt > profile.emergency_retry_count {
                        break;
                    }
                    tokio::time::sleep(Duration::from_secs(profile.emergency_retry_delay_sec))
                        .await;
                }
            }
        }

        if let Some(call_phone) = profile.emergency_call_phone.as_deref() {
            let twiml = emergency_call_twiml(booking);
            let result = self.provider.make_call(call_phone, &twiml).await;
            let (status, error) = match &result {
                Ok(_) => (EscalationStatus::Sent, None),
                Err(e) => (EscalationStatus::Failed, Some(e.to_string())),
            };
            let _ = self
                .log_emergency(
                    booking,
                    call_phone,
                    EscalationType::Call,
                    status,
                    error.as_deref(),
                )
                .await;
        }
    }

    async fn log_emergency(
        &self,
        booking: &Booking,
        phone: &str,
        escalation: EscalationType,
        status: EscalationStatus,
        error: Option<&str>,
    ) -> anyhow::Result<()> {
        sqlx::query(
            "INSERT INTO emergency_log
                (id, business_id, booking_id, technician_phone, escalation_type, status, error)
             VALUES ($1, $2, $3, $4, $5, $6, $7)",
        )
        .bind(Uuid::new_v4())
        .bind(&booking.business_id)
        .bind(booking.id)
        .bind(phone)
        .bind(escalation)
        .bind(status)
        .bind(error)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Auto-SMS back to a caller we could not serve. Deduped per
    /// (business, request, kind, reason) against sms_log, 10 s deadline.
    pub async fn send_auto_sms_to_caller(
        &self,
        business_id: &str,
        request_id: &str,
        to: &str,
        body: &str,
        kind: SmsKind,
        reason: Option<&str>,
    ) -> anyhow::Result<SendOutcome> {
        let key = sms_dedupe_key(business_id, request_id, kind, reason);
        if self.dedupe_seen(&key).await? {
            info!(dedupe_key = %key, "auto-sms suppressed by dedupe");
            return Ok(skipped());
        }

        let result = timed(
            "twilio.send_sms",
            Duration::from_secs(10),
            "TWILIO_TIMEOUT",
            self.provider.send_sms(to, body),
        )
        .await;

        match result {
            Ok(sid) => {
                self.log_sms(
                    business_id,
                    None,
                    Some(to),
                    Some(body),
                    Some(&sid),
                    kind,
                    SmsStatus::Sent,
                    None,
                    Some(&key),
                )
                .await?;
                Ok(SendOutcome {
                    ok: true,
                    skipped: false,
                    sid: Some(sid),
                    error: None,
                })
            }
            Err(e) => {
                self.log_sms(
                    business_id,
                    None,
                    Some(to),
                    Some(body),
                    None,
                    kind,
                    SmsStatus::Failed,
                    Some(&e.to_string()),
                    Some(&key),
                )
                .await?;
                Ok(SendOutcome {
                    ok: false,
                    skipped: false,
                    sid: None,
                    error: Some(e.to_string()),
                })
            }
        }
    }

    /// Deduped emergency notification outside the booking flow (inbound
    /// call escalation).
    pub async fn send_emergency_notify(
        &self,
        business_id: &str,
        request_id: &str,
        to: &str,
        body: &str,
    ) -> anyhow::Result<SendOutcome> {
        self.send_auto_sms_to_caller(
            business_id,
            request_id,
            to,
            body,
            SmsKind::EmergencyNotify,
            None,
        )
        .await
    }
}

fn skipped() -> SendOutcome {
    SendOutcome {
        ok: false,
        skipped: true,
        sid: None,
        error: None,
    }
}

pub fn confirmation_sms_body(booking: &Booking, profile: &EffectiveProfile) -> String {
    let name = booking.customer_name.as_deref().unwrap_or("there");
    let local = booking.start_utc.with_timezone(&profile.timezone);
    let when = local.format("%A, %B %-d at %-I:%M %p").to_string();
    format!(
        "Hi {name}, your HVAC appointment is confirmed for {when}. Confirmation ID: {}",
        booking.id
    )
}

fn emergency_sms_body(booking: &Booking) -> String {
    let summary = booking
        .job_summary
        .as_deref()
        .unwrap_or("Emergency service request");
    let phone = booking.customer_phone.as_deref().unwrap_or("unknown");
    format!("{summary} (customer {phone}, booking {})", booking.id)
}

fn emergency_call_twiml(booking: &Booking) -> String {
    let summary = booking
        .job_summary
        .as_deref()
        .unwrap_or("an emergency service request");
    format!("<Response><Say>You have {summary}. Check your messages for details.</Say></Response>")
}

// ---------------------------------------------------------------------------
// Inbound-call SMS decision reducer
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NormalizedCallStatus {
    Started,
    Completed,
    Failed,
}

pub fn normalize_call_status(raw: &str) -> NormalizedCallStatus {
    match raw {
        "completed" => NormalizedCallStatus::Completed,
        "failed" | "busy" | "no-answer" | "canceled" => NormalizedCallStatus::Failed,
        _ => NormalizedCallStatus::Started,
    }
}

#[derive(Debug, Clone, Default)]
pub struct VoiceCallContext<'a> {
    pub call_status: &'a str,
    pub business_id: Option<&'a str>,
    pub auto_sms_enabled: bool,
    pub shutting_down: bool,
    pub ready: bool,
    pub after_hours: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VoiceCallDecision {
    NoSms,
    MissedCall,
    Unavailable(UnavailableReason),
    Both(UnavailableReason),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnavailableReason {
    ShuttingDown,
    NotReady,
    AfterHours,
}

impl UnavailableReason {
    pub fn as_str(self) -> &'static str {
        match self {
            UnavailableReason::ShuttingDown => "shutting_down",
            UnavailableReason::NotReady => "not_ready",
            UnavailableReason::AfterHours => "after_hours",
        }
    }
}

/// Classify an inbound-call context into which SMS (if any) to send.
/// Missed-call SMS fires for a failed call with a known business;
/// unavailable SMS fires when auto-SMS is on and the service cannot take
/// the call, with reason priority shutting_down > not_ready > after_hours.
pub fn decide_voice_call(ctx: &VoiceCallContext) -> VoiceCallDecision {
    let missed = matches!(
        normalize_call_status(ctx.call_status),
        NormalizedCallStatus::Failed
    ) && ctx.business_id.is_some();

    let reason = if ctx.shutting_down {
        Some(UnavailableReason::ShuttingDown)
    } else if !ctx.ready {
        Some(UnavailableReason::NotReady)
    } else if ctx.after_hours {
        Some(UnavailableReason::AfterHours)
    } else {
        None
    };
    let unavailable = ctx.business_id.is_some() && ctx.auto_sms_enabled && reason.is_some();

    match (missed, reason, unavailable) {
        (true, Some(r), true) => VoiceCallDecision::Both(r),
        (true, _, false) => VoiceCallDecision::MissedCall,
        (false, Some(r), true) => VoiceCallDecision::Unavailable(r),
        _ => VoiceCallDecision::NoSms,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn call_status_normalization() {
        assert_eq!(
            normalize_call_status("completed"),
            NormalizedCallStatus::Completed
        );
        for s in ["failed", "busy", "no-answer", "canceled"] {
            assert_eq!(normalize_call_status(s), NormalizedCallStatus::Failed);
        }
        assert_eq!(normalize_call_status("ringing"), NormalizedCallStatus::Started);
        assert_eq!(normalize_call_status(""), NormalizedCallStatus::Started);
    }

    fn ctx<'a>() -> VoiceCallContext<'a> {
        VoiceCallContext {
            call_status: "completed",
            business_id: Some("b1"),
            auto_sms_enabled: true,
            shutting_down: false,
            ready: true,
            after_hours: false,
        }
    }

    #[test]
    fn completed_in_hours_sends_nothing() {
        assert_eq!(decide_voice_call(&ctx()), VoiceCallDecision::NoSms);
    }

    #[test]
    fn failed_call_with_business_is_missed_call() {
        let c = VoiceCallContext {
            call_status: "no-answer",
            ..ctx()
        };
        assert_eq!(decide_voice_call(&c), VoiceCallDecision::MissedCall);
    }

    #[test]
    fn failed_call_without_business_sends_nothing() {
        let c = VoiceCallContext {
            call_status: "failed",
            business_id: None,
            ..ctx()
        };
        assert_eq!(decide_voice_call(&c), VoiceCallDecision::NoSms);
    }

    #[test]
    fn after_hours_completed_call_is_unavailable() {
        let c = VoiceCallContext {
            after_hours: true,
            ..ctx()
        };
        assert_eq!(
            decide_voice_call(&c),
            VoiceCallDecision::Unavailable(UnavailableReason::AfterHours)
        );
    }

    #[test]
    fn auto_sms_disabled_suppresses_unavailable() {
        let c = VoiceCallContext {
            after_hours: true,
            auto_sms_enabled: false,
            ..ctx()
        };
        assert_eq!(decide_voice_call(&c), VoiceCallDecision::NoSms);
    }

    #[test]
    fn reason_priority_prefers_shutdown() {
        let c = VoiceCallContext {
            shutting_down: true,
            ready: false,
            after_hours: true,
            ..ctx()
        };
        assert_eq!(
            decide_voice_call(&c),
            VoiceCallDecision::Unavailable(UnavailableReason::ShuttingDown)
        );
        let c2 = VoiceCallContext {
            ready: false,
            after_hours: true,
            ..ctx()
        };
        assert_eq!(
            decide_voice_call(&c2),
            VoiceCallDecision::Unavailable(UnavailableReason::NotReady)
        );
    }

    #[test]
    fn both_fires_when_missed_and_unavailable() {
        let c = VoiceCallContext {
            call_status: "busy",
            after_hours: true,
            ..ctx()
        };
        assert_eq!(
            decide_voice_call(&c),
            VoiceCallDecision::Both(UnavailableReason::AfterHours)
        );
    }
}
