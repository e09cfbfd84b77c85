use std::sync::Arc;

use chrono::{DateTime, Duration, NaiveDateTime, SecondsFormat, TimeZone, Utc};
use chrono_tz::Tz;
use serde_json::json;
use sha2::{Digest, Sha256};
use sqlx::PgPool;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::config::Config;
use crate::error::{BookingError, TimeWindowViolation};
use crate::models::booking::{Booking, BookingStatus, CreateBookingRequest, Customer, PendingHold};
use crate::models::business::EffectiveProfile;
use crate::models::logs::{SmsKind, SmsStatus};
use crate::models::retry::RetryKind;
use crate::services::availability::is_outside_business_hours;
use crate::services::business::BusinessService;
use crate::services::calendar::{
    event_matches_window, with_retries, CalendarApi, CalendarError, EventDraft, GoogleCalendar,
    RetryBudget,
};
use crate::services::ledger::{BookingLedger, HoldOutcome};
use crate::services::notifications::NotificationService;
use crate::services::token_vault::TokenVault;

const MAX_DURATION_MIN: i64 = 480;
const MAX_BUFFER_MIN: i64 = 1440;

#[derive(Debug)]
pub enum BookingOutcome {
    Confirmed {
        booking_id: Uuid,
        gcal_event_id: String,
        start_utc: DateTime<Utc>,
        end_utc: DateTime<Utc>,
        is_emergency: bool,
        emergency_escalated: bool,
    },
    /// A prior request with the same idempotency key already confirmed.
    ReplayConfirmed { booking_id: Uuid },
    /// A prior request with the same idempotency key still holds the slot.
    ReplayPending { booking_id: Uuid },
}

pub struct BookingOrchestrator {
    pool: PgPool,
    config: Arc<Config>,
    ledger: BookingLedger,
    vault: Arc<TokenVault>,
    notifications: Arc<NotificationService>,
}

impl BookingOrchestrator {
    pub fn new(
        pool: PgPool,
        config: Arc<Config>,
        vault: Arc<TokenVault>,
        notifications: Arc<NotificationService>,
    ) -> Self {
        Self {
            ledger: BookingLedger::new(pool.clone()),
            pool,
            config,
            vault,
            notifications,
        }
    }

    pub fn ledger(&self) -> &BookingLedger {
        &self.ledger
    }

    /// The booking state machine: validate, dedupe, hold, revalidate
    /// against the calendar of record, commit the event, confirm, then
    /// dispatch notifications without blocking the response.
    pub async fn create_booking(
        &self,
        request: CreateBookingRequest,
        request_id: &str,
    ) -> Result<BookingOutcome, BookingError> {
        // Business existence outranks every field error: an unknown tenant
        // is a 404 even when the rest of the payload is broken.
        let business_id = request
            .business_id
            .as_deref()
            .map(str::trim)
            .filter(|s| !s.is_empty());
        let profile = match business_id {
            Some(id) => Some(
                BusinessService::effective_profile(&self.pool, id)
                    .await
                    .map_err(BookingError::Other)?
                    .ok_or(BookingError::BusinessNotFound)?,
            ),
            None => None,
        };

        // Then field presence; the joined message lists everything missing.
        let mut missing = Vec::new();
        if business_id.is_none() {
            missing.push("businessId");
        }
        if blank(&request.start_local) {
            missing.push("startLocal");
        }
        if blank(&request.timezone) {
            missing.push("timezone");
        }
        if !missing.is_empty() {
            return Err(BookingError::Validation(format!(
                "Missing {}",
                missing.join(", ")
            )));
        }
        let business_id = business_id.unwrap();
        let profile = profile.unwrap();

        let duration_min = request.duration_mins.unwrap_or(profile.default_duration_min);
        if duration_min <= 0 || duration_min > MAX_DURATION_MIN {
            return Err(BookingError::Validation("Invalid durationMins".into()));
        }
        let (buffer_before, buffer_after) = match request.buffer_mins {
            Some(buffer) if !(0..=MAX_BUFFER_MIN).contains(&buffer) => {
                return Err(BookingError::Validation("Invalid bufferMins".into()));
            }
            Some(buffer) => (buffer, buffer),
            None => (profile.buffer_before_min, profile.buffer_after_min),
        };

        let tz: Tz = request
            .timezone
            .as_deref()
            .unwrap()
            .parse()
            .map_err(|_| BookingError::Validation("Invalid startLocal/timezone".into()))?;
        let start_local = parse_start_local(request.start_local.as_deref().unwrap(), tz)
            .ok_or_else(|| BookingError::Validation("Invalid startLocal/timezone".into()))?;

        let now_local = Utc::now().with_timezone(&tz);
        check_time_window(
            start_local,
            now_local,
            profile.lead_time_min,
            profile.max_days_ahead,
        )?;

        let start_utc = start_local.with_timezone(&Utc);
        let end_utc = start_utc + Duration::minutes(duration_min);

        let phone = request.customer.phone.clone().unwrap_or_default();
        let key = idempotency_key(business_id, start_utc, duration_min, &phone);

        if let Some(existing) = self
            .ledger
            .get_booking_by_idempotency_key(business_id, &key)
            .await
            .map_err(BookingError::Other)?
        {
            return Ok(replay(&existing));
        }

        // Credential preflight: fail before any state change when the
        // tenant never connected a calendar.
        let tokens = self
            .vault
            .get_tokens(business_id)
            .await
            .map_err(BookingError::Other)?;
        if tokens.is_none() {
            return Err(BookingError::NoGoogleTokens);
        }

        let calendar = GoogleCalendar::for_business(&self.config, self.vault.clone(), business_id)
            .map_err(map_calendar_error)?
            .with_inline_budget();

        // Synchronous freebusy revalidation under the short inline budget.
        let busy = with_retries(RetryBudget::freebusy(), || {
            calendar.freebusy(start_utc, end_utc)
        })
        .await
        .map_err(map_calendar_error)?;
        if !busy.is_empty() {
            return Err(BookingError::SlotAlreadyBooked);
        }

        let is_emergency_service = request.service.as_deref() == Some("emergency");
        let is_after_hours = is_outside_business_hours(start_utc, &profile);
        let is_emergency =
            is_emergency_service || is_after_hours || request.is_emergency.unwrap_or(false);

        let customer = Customer {
            name: request.customer.name.clone(),
            phone: request.customer.phone.clone(),
            email: request.customer.email.clone(),
            address: request.canonical_address(),
        };
        let summary = job_summary(request.service.as_deref(), customer.name.as_deref(), is_emergency);

        let hold = PendingHold {
            business_id: business_id.to_string(),
            start_utc,
            end_utc,
            overlap_start: start_utc - Duration::minutes(buffer_before),
            overlap_end: end_utc + Duration::minutes(buffer_after),
            hold_expires_at: Utc::now() + Duration::minutes(self.config.booking_hold_minutes),
            customer,
            service_type: request.service.clone(),
            notes: request.notes.clone(),
            is_emergency,
            job_summary: summary.clone(),
            slot_key: slot_key(business_id, start_utc),
            idempotency_key: key.clone(),
        };

        let booking = match self
            .ledger
            .create_pending_hold_if_available(&hold)
            .await
            .map_err(BookingError::Other)?
        {
            HoldOutcome::Created(booking) => booking,
            HoldOutcome::SlotTaken => return Err(BookingError::SlotAlreadyBooked),
            HoldOutcome::IdempotencyRace => {
                // A concurrent duplicate beat us to the insert; surface its
                // row instead of a conflict.
                return match self
                    .ledger
                    .get_booking_by_idempotency_key(business_id, &key)
                    .await
                    .map_err(BookingError::Other)?
                {
                    Some(existing) => Ok(replay(&existing)),
                    None => Err(BookingError::SlotAlreadyBooked),
                };
            }
        };

        info!(request_id, booking_id = %booking.id, business_id, "pending hold created");

        // Everything past this point owns a pending row; no exception path
        // may leave it alive.
        match self
            .finalize(&calendar, &profile, &booking, duration_min, request_id)
            .await
        {
            Ok(outcome) => Ok(outcome),
            Err(err) => {
                let safe_code = match &err {
                    BookingError::EventInsertFailed => "GOOGLE_EVENTS_INSERT_FAILED",
                    BookingError::GoogleTimeout => "GOOGLE_TIMEOUT",
                    _ => "BOOKING_FINALIZE_FAILED",
                };
                if let Err(fail_err) = self.ledger.fail_booking(booking.id, safe_code).await {
                    warn!(request_id, booking_id = %booking.id, error = %fail_err,
                        "could not mark booking failed after error");
                }
                Err(err)
            }
        }
    }

    async fn finalize(
        &self,
        calendar: &GoogleCalendar,
        profile: &EffectiveProfile,
        booking: &Booking,
        duration_min: i64,
        request_id: &str,
    ) -> Result<BookingOutcome, BookingError> {
        let draft = EventDraft {
            summary: booking.job_summary.clone().unwrap_or_default(),
            description: event_description(booking),
            start_utc: booking.start_utc,
            end_utc: booking.end_utc,
            timezone: profile.timezone.name().to_string(),
            idempotency_key: booking.idempotency_key.clone(),
        };

        let event_id = self
            .insert_event_with_recovery(calendar, &draft, duration_min)
            .await
            .map_err(|err| {
                error!(request_id, booking_id = %booking.id, error = %err, "calendar event insert failed");
                // A deadline on the final attempt is recorded as a timeout;
                // any other terminal insert failure keeps the insert code.
                match err {
                    CalendarError::Timeout => BookingError::GoogleTimeout,
                    _ => BookingError::EventInsertFailed,
                }
            })?;

        let confirmed = self.ledger.confirm_booking(booking.id, &event_id).await?;
        info!(request_id, booking_id = %confirmed.id, %event_id, "booking confirmed");

        self.spawn_dispatch(confirmed.clone(), profile.clone(), request_id.to_string());

        Ok(BookingOutcome::Confirmed {
            booking_id: confirmed.id,
            gcal_event_id: event_id,
            start_utc: confirmed.start_utc,
            end_utc: confirmed.end_utc,
            is_emergency: confirmed.is_emergency,
            emergency_escalated: confirmed.is_emergency,
        })
    }

    /// Two-attempt insert. After a retryable first failure, look for an
    /// event we may have created anyway (same idempotency key, expected
    /// window) before trying again; a match means the first insert landed
    /// and only the response was lost.
    async fn insert_event_with_recovery(
        &self,
        calendar: &GoogleCalendar,
        draft: &EventDraft,
        duration_min: i64,
    ) -> Result<String, CalendarError> {
        let first = calendar.insert_event(draft).await;
        let first_err = match first {
            Ok(event_id) => return Ok(event_id),
            Err(err) if err.is_retryable() => err,
            Err(err) => return Err(err),
        };
        warn!(error = %first_err, "first event insert failed, probing for orphaned event");

        let pad = Duration::minutes(60.max(duration_min + 60));
        let listed = with_retries(RetryBudget::lookup(), || {
            calendar.list_events_by_idempotency(
                draft.start_utc - pad,
                draft.end_utc + pad,
                &draft.idempotency_key,
            )
        })
        .await;

        if let Ok(events) = listed {
            if let Some(event) = events.iter().find(|ev| {
                event_matches_window(ev, draft.start_utc, draft.end_utc, &draft.idempotency_key)
            }) {
                info!(event_id = %event.id, "recovered orphaned calendar event");
                return Ok(event.id.clone());
            }
        }

        calendar.insert_event(draft).await
    }

    /// Fire-and-forget side effects. The outbox row is enqueued before the
    /// immediate send so a crash degrades to eventual delivery; a
    /// successful immediate send closes the row. Never blocks or fails the
    /// HTTP response.
    fn spawn_dispatch(&self, booking: Booking, profile: EffectiveProfile, request_id: String) {
        let ledger = self.ledger.clone();
        let notifications = self.notifications.clone();

        tokio::spawn(async move {
            let phone = booking.customer_phone.clone().filter(|p| !p.is_empty());

            if let Some(to) = phone {
                let body = crate::services::notifications::confirmation_sms_body(&booking, &profile);
                let payload = json!({
                    "to": to,
                    "body": body,
                    "logOnSuccess": { "kind": "confirmation" },
                });
                let retry_id = match ledger
                    .enqueue_retry(
                        &booking.business_id,
                        Some(booking.id),
                        RetryKind::TwilioSms,
                        &payload,
                    )
                    .await
                {
                    Ok(id) => Some(id),
                    Err(e) => {
                        warn!(%request_id, error = %e, "could not enqueue sms outbox row");
                        None
                    }
                };

                // Queued row first, then a terminal sent/failed row.
                let _ = notifications
                    .log_sms(
                        &booking.business_id,
                        Some(booking.id),
                        Some(&to),
                        Some(&body),
                        None,
                        SmsKind::Confirmation,
                        SmsStatus::Queued,
                        None,
                        None,
                    )
                    .await;

                match notifications
                    .send_booking_confirmation(&booking, &profile)
                    .await
                {
                    Ok(outcome) if outcome.ok => {
                        let _ = notifications
                            .log_sms(
                                &booking.business_id,
                                Some(booking.id),
                                Some(&to),
                                Some(&body),
                                outcome.sid.as_deref(),
                                SmsKind::Confirmation,
                                SmsStatus::Sent,
                                None,
                                None,
                            )
                            .await;
                        if let Some(id) = retry_id {
                            let _ = ledger.complete_retry(id).await;
                        }
                    }
                    Ok(outcome) if outcome.skipped => {
                        if let Some(id) = retry_id {
                            let _ = ledger.complete_retry(id).await;
                        }
                    }
                    Ok(outcome) => {
                        let _ = notifications
                            .log_sms(
                                &booking.business_id,
                                Some(booking.id),
                                Some(&to),
                                Some(&body),
                                None,
                                SmsKind::Confirmation,
                                SmsStatus::Failed,
                                outcome.error.as_deref(),
                                None,
                            )
                            .await;
                        // The outbox row stays pending; the retry worker
                        // picks it up.
                    }
                    Err(e) => {
                        warn!(%request_id, error = %e, "confirmation sms dispatch errored");
                    }
                }
            }

            if booking.is_emergency {
                notifications.handle_emergency(&booking, &profile).await;
            }
        });
    }
}

fn blank(field: &Option<String>) -> bool {
    field.as_deref().map(str::trim).unwrap_or("").is_empty()
}

fn replay(existing: &Booking) -> BookingOutcome {
    match existing.status {
        BookingStatus::Confirmed => BookingOutcome::ReplayConfirmed {
            booking_id: existing.id,
        },
        _ => BookingOutcome::ReplayPending {
            booking_id: existing.id,
        },
    }
}

fn map_calendar_error(err: CalendarError) -> BookingError {
    match err {
        CalendarError::NoTokens => BookingError::NoGoogleTokens,
        CalendarError::NotConfigured => BookingError::OAuthNotConfigured,
        CalendarError::Timeout | CalendarError::Network(_) => BookingError::GoogleTimeout,
        other => BookingError::Other(anyhow::anyhow!(other)),
    }
}

/// Local ISO datetime (no offset) interpreted in the request timezone.
pub fn parse_start_local(raw: &str, tz: Tz) -> Option<DateTime<Tz>> {
    let naive = NaiveDateTime::parse_from_str(raw, "%Y-%m-%dT%H:%M:%S")
        .or_else(|_| NaiveDateTime::parse_from_str(raw, "%Y-%m-%dT%H:%M"))
        .ok()?;
    tz.from_local_datetime(&naive).earliest()
}

/// Lead-time floor and booking horizon, both evaluated in local time. The
/// horizon is inclusive through the end of the last admissible day.
pub fn check_time_window(
    start_local: DateTime<Tz>,
    now_local: DateTime<Tz>,
    lead_time_min: i64,
    max_days_ahead: i64,
) -> Result<(), BookingError> {
    let earliest = now_local + Duration::minutes(lead_time_min);
    if start_local < earliest {
        return Err(BookingError::TimeWindow {
            reason: TimeWindowViolation::StartTooSoon,
            detail: format!("start must be at least {lead_time_min} minutes out"),
        });
    }

    let horizon_date = now_local.date_naive() + Duration::days(max_days_ahead);
    if start_local.date_naive() > horizon_date {
        return Err(BookingError::TimeWindow {
            reason: TimeWindowViolation::StartTooFar,
            detail: format!("start must be within {max_days_ahead} days"),
        });
    }
    Ok(())
}

/// `{businessId}:{startUtc}` - the natural identifier of a slot.
pub fn slot_key(business_id: &str, start_utc: DateTime<Utc>) -> String {
    format!(
        "{business_id}:{}",
        start_utc.to_rfc3339_opts(SecondsFormat::Secs, true)
    )
}

pub fn normalized_phone_digits(phone: &str) -> String {
    phone.chars().filter(|c| c.is_ascii_digit()).collect()
}

/// First 128 bits of SHA-256 over the stable request identity, hex-encoded.
pub fn idempotency_key(
    business_id: &str,
    start_utc: DateTime<Utc>,
    duration_min: i64,
    phone: &str,
) -> String {
    let material = format!(
        "{business_id}|{}|{duration_min}|{}",
        start_utc.to_rfc3339_opts(SecondsFormat::Secs, true),
        normalized_phone_digits(phone),
    );
    let digest = Sha256::digest(material.as_bytes());
    hex::encode(&digest[..16])
}

pub fn job_summary(service: Option<&str>, customer_name: Option<&str>, is_emergency: bool) -> String {
    let service = match service {
        Some(s) if !s.is_empty() => s,
        _ => "service call",
    };
    let base = match customer_name {
        Some(name) if !name.is_empty() => format!("{service} for {name}"),
        _ => service.to_string(),
    };
    if is_emergency {
        format!("[EMERGENCY] {base}")
    } else {
        base
    }
}

fn event_description(booking: &Booking) -> String {
    let mut lines = vec![format!("Booking {}", booking.id)];
    if let Some(name) = booking.customer_name.as_deref() {
        lines.push(format!("Customer: {name}"));
    }
    if let Some(phone) = booking.customer_phone.as_deref() {
        lines.push(format!("Phone: {phone}"));
    }
    if let Some(email) = booking.customer_email.as_deref() {
        lines.push(format!("Email: {email}"));
    }
    if let Some(address) = booking.customer_address.as_deref() {
        lines.push(format!("Address: {address}"));
    }
    if let Some(notes) = booking.notes.as_deref() {
        lines.push(format!("Notes: {notes}"));
    }
    lines.join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono_tz::America::Chicago;

    fn local(tz: Tz, s: &str) -> DateTime<Tz> {
        parse_start_local(s, tz).unwrap()
    }

    #[test]
    fn parses_local_iso_with_and_without_seconds() {
        assert!(parse_start_local("2026-01-12T09:00:00", Chicago).is_some());
        assert!(parse_start_local("2026-01-12T09:00", Chicago).is_some());
        assert!(parse_start_local("garbage", Chicago).is_none());
        assert_eq!(
            local(Chicago, "2026-01-12T09:00:00").with_timezone(&Utc),
            "2026-01-12T15:00:00Z".parse::<DateTime<Utc>>().unwrap()
        );
    }

    #[test]
    fn lead_time_violation_is_start_too_soon() {
        let now = local(Chicago, "2026-01-01T09:00:00");
        let start = local(Chicago, "2026-01-01T09:05:00");
        let err = check_time_window(start, now, 60, 14).unwrap_err();
        match err {
            BookingError::TimeWindow { reason, .. } => {
                assert_eq!(reason, TimeWindowViolation::StartTooSoon)
            }
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn horizon_violation_is_start_too_far() {
        let now = local(Chicago, "2026-01-01T09:00:00");
        let start = local(Chicago, "2027-01-01T09:00:00");
        let err = check_time_window(start, now, 60, 14).unwrap_err();
        match err {
            BookingError::TimeWindow { reason, .. } => {
                assert_eq!(reason, TimeWindowViolation::StartTooFar)
            }
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn horizon_is_inclusive_through_end_of_last_day() {
        let now = local(Chicago, "2026-01-01T09:00:00");
        // Day 14 at 23:00 is still bookable; day 15 at 00:30 is not.
        assert!(check_time_window(local(Chicago, "2026-01-15T23:00:00"), now, 60, 14).is_ok());
        assert!(check_time_window(local(Chicago, "2026-01-16T00:30:00"), now, 60, 14).is_err());
    }

    #[test]
    fn exact_lead_boundary_is_allowed() {
        let now = local(Chicago, "2026-01-01T09:00:00");
        assert!(check_time_window(local(Chicago, "2026-01-01T10:00:00"), now, 60, 14).is_ok());
    }

    #[test]
    fn idempotency_key_is_stable_128_bits() {
        let start = "2026-01-12T15:00:00Z".parse().unwrap();
        let a = idempotency_key("b1", start, 60, "+1 (555) 000-1111");
        let b = idempotency_key("b1", start, 60, "15550001111");
        // Phone normalization makes formatting irrelevant.
        assert_eq!(a, b);
        assert_eq!(a.len(), 32);
        // Any component changing changes the key.
        assert_ne!(a, idempotency_key("b2", start, 60, "15550001111"));
        assert_ne!(a, idempotency_key("b1", start, 90, "15550001111"));
        assert_ne!(a, idempotency_key("b1", start, 60, "15550002222"));
    }

    #[test]
    fn slot_key_embeds_utc_start() {
        let start = "2026-01-12T15:00:00Z".parse().unwrap();
        assert_eq!(slot_key("b1", start), "b1:2026-01-12T15:00:00Z");
    }

    #[test]
    fn phone_normalization_strips_punctuation() {
        assert_eq!(normalized_phone_digits("+1 (555) 000-1111"), "15550001111");
        assert_eq!(normalized_phone_digits(""), "");
    }

    #[test]
    fn job_summary_prefixes_emergencies() {
        assert_eq!(
            job_summary(Some("repair"), Some("Jane"), false),
            "repair for Jane"
        );
        assert_eq!(
            job_summary(Some("no heat"), Some("Jane"), true),
            "[EMERGENCY] no heat for Jane"
        );
        assert_eq!(job_summary(None, None, false), "service call");
    }
}
