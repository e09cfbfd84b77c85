use std::future::Future;
use std::sync::Arc;
use std::time::{Duration as StdDuration, Instant};

use async_trait::async_trait;
use chrono::{DateTime, Duration, NaiveDate, Utc};
use rand::Rng;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::json;
use thiserror::Error;
use tracing::{info, warn};

use crate::config::Config;
use crate::services::availability::BusyInterval;
use crate::services::oauth;
use crate::services::token_vault::TokenVault;

const CALENDAR_BASE: &str = "https://www.googleapis.com/calendar/v3";

#[derive(Debug, Error)]
pub enum CalendarError {
    #[error("GOOGLE_TIMEOUT")]
    Timeout,
    #[error("network error: {0}")]
    Network(String),
    #[error("google api returned {status}: {body}")]
    Api { status: u16, body: String },
    #[error("GOOGLE_OAUTH_NOT_CONFIGURED")]
    NotConfigured,
    #[error("NO_GOOGLE_TOKENS")]
    NoTokens,
    #[error("{0}")]
    Other(String),
}

impl CalendarError {
    /// Timeouts, connection failures, 5xx and 429 are worth retrying;
    /// everything else surfaces immediately.
    pub fn is_retryable(&self) -> bool {
        match self {
            CalendarError::Timeout | CalendarError::Network(_) => true,
            CalendarError::Api { status, .. } => *status >= 500 || *status == 429,
            _ => false,
        }
    }

    fn from_reqwest(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            CalendarError::Timeout
        } else if err.is_connect() {
            CalendarError::Network(err.to_string())
        } else {
            CalendarError::Other(err.to_string())
        }
    }
}

/// Start/end of a returned event: timed events carry `dateTime`, all-day
/// events carry `date`.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct EventTime {
    #[serde(rename = "dateTime")]
    pub date_time: Option<DateTime<Utc>>,
    pub date: Option<NaiveDate>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CalendarEvent {
    pub id: String,
    #[serde(default)]
    pub start: EventTime,
    #[serde(default)]
    pub end: EventTime,
    #[serde(default)]
    pub idempotency_key: Option<String>,
}

/// Does a listed event match the slot we tried to book? Timed events must
/// land within two minutes of the expected bounds; all-day events match on
/// the exact date.
pub fn event_matches_window(
    event: &CalendarEvent,
    expected_start: DateTime<Utc>,
    expected_end: DateTime<Utc>,
    expected_key: &str,
) -> bool {
    if event.idempotency_key.as_deref() != Some(expected_key) {
        return false;
    }
    let tolerance = Duration::minutes(2);
    let time_matches = |actual: &EventTime, expected: DateTime<Utc>| match actual {
        EventTime {
            date_time: Some(dt),
            ..
        } => (*dt - expected).abs() <= tolerance,
        EventTime {
            date: Some(d),
            date_time: None,
        } => *d == expected.date_naive(),
        _ => false,
    };
    time_matches(&event.start, expected_start) && time_matches(&event.end, expected_end)
}

#[derive(Debug, Clone)]
pub struct EventDraft {
    pub summary: String,
    pub description: String,
    pub start_utc: DateTime<Utc>,
    pub end_utc: DateTime<Utc>,
    pub timezone: String,
    pub idempotency_key: String,
}

/// Uniform calendar-of-record interface: freebusy, insert, lookup by
/// idempotency key, delete.
#[async_trait]
pub trait CalendarApi: Send + Sync {
    async fn freebusy(
        &self,
        time_min: DateTime<Utc>,
        time_max: DateTime<Utc>,
    ) -> Result<Vec<BusyInterval>, CalendarError>;

    async fn insert_event(&self, draft: &EventDraft) -> Result<String, CalendarError>;

    async fn list_events_by_idempotency(
        &self,
        time_min: DateTime<Utc>,
        time_max: DateTime<Utc>,
        idempotency_key: &str,
    ) -> Result<Vec<CalendarEvent>, CalendarError>;

    async fn delete_event(&self, event_id: &str) -> Result<(), CalendarError>;
}

/// Synchronous-path retry policy: exponential backoff from 250 ms doubling
/// to a 1500 ms cap, uniform jitter in [0, base), at most `max_attempts`
/// tries, all bounded by a wall-clock budget.
#[derive(Debug, Clone, Copy)]
pub struct RetryBudget {
    pub base_ms: u64,
    pub cap_ms: u64,
    pub max_attempts: u32,
    pub max_elapsed_ms: u64,
}

impl RetryBudget {
    pub fn freebusy() -> Self {
        Self {
            base_ms: 250,
            cap_ms: 1500,
            max_attempts: 3,
            max_elapsed_ms: 4500,
        }
    }

    pub fn lookup() -> Self {
        Self {
            base_ms: 250,
            cap_ms: 1500,
            max_attempts: 3,
            max_elapsed_ms: 2500,
        }
    }
}

/// Deterministic part of the backoff delay for attempt k (0-based).
pub fn backoff_base_ms(budget: &RetryBudget, attempt: u32) -> u64 {
    let exp = budget
        .base_ms
        .saturating_mul(1u64 << attempt.min(16));
    exp.min(budget.cap_ms)
}

/// Run `op` under the budget, sleeping between retryable failures. The next
/// sleep is abandoned early when it would overrun the elapsed budget.
pub async fn with_retries<T, F, Fut>(budget: RetryBudget, mut op: F) -> Result<T, CalendarError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, CalendarError>>,
{
    let started = Instant::now();
    let mut attempt = 0u32;
    loop {
        match op().await {
            Ok(value) => return Ok(value),
            Err(err) if err.is_retryable() && attempt + 1 < budget.max_attempts => {
                let base = backoff_base_ms(&budget, attempt);
                let jitter = rand::thread_rng().gen_range(0..=budget.base_ms);
                let delay = base + jitter;
                let elapsed = started.elapsed().as_millis() as u64;
                if elapsed + delay > budget.max_elapsed_ms {
                    warn!(
                        attempt,
                        elapsed_ms = elapsed,
                        "calendar retry budget exhausted, abandoning"
                    );
                    return Err(err);
                }
                tokio::time::sleep(StdDuration::from_millis(delay)).await;
                attempt += 1;
            }
            Err(err) => return Err(err),
        }
    }
}

/// Google Calendar client bound to one business. A fresh instance is built
/// per orchestration - the token refresh path writes back through the vault,
/// and sharing a client across tenants would cross-contaminate credentials.
pub struct GoogleCalendar {
    http: Client,
    vault: Arc<TokenVault>,
    business_id: String,
    client_id: String,
    client_secret: String,
    timeout: StdDuration,
}

impl GoogleCalendar {
    pub fn for_business(
        config: &Config,
        vault: Arc<TokenVault>,
        business_id: &str,
    ) -> Result<Self, CalendarError> {
        let client_id = config
            .google_client_id
            .clone()
            .ok_or(CalendarError::NotConfigured)?;
        let client_secret = config
            .google_client_secret
            .clone()
            .ok_or(CalendarError::NotConfigured)?;
        Ok(Self {
            http: Client::new(),
            vault,
            business_id: business_id.to_string(),
            client_id,
            client_secret,
            timeout: StdDuration::from_millis(config.google_api_timeout_ms),
        })
    }

    /// Shorter deadline for the freebusy/insert calls on the inline booking
    /// path.
    pub fn with_inline_budget(mut self) -> Self {
        self.timeout = StdDuration::from_millis(2500);
        self
    }

    /// Current access token, refreshed through the vault when stale.
    async fn access_token(&self) -> Result<String, CalendarError> {
        let record = self
            .vault
            .get_tokens(&self.business_id)
            .await
            .map_err(|e| CalendarError::Other(e.to_string()))?
            .ok_or(CalendarError::NoTokens)?;

        if !record.needs_refresh(Utc::now()) {
            if let Some(token) = record.access_token.clone() {
                return Ok(token);
            }
        }

        let refresh_token = self
            .vault
            .refresh_token_plaintext(&record)
            .map_err(|e| CalendarError::Other(e.to_string()))?
            .ok_or(CalendarError::NoTokens)?;

        let refreshed = oauth::refresh_access_token(
            &self.http,
            &self.client_id,
            &self.client_secret,
            &refresh_token,
        )
        .await
        .map_err(|e| CalendarError::Other(e.to_string()))?;

        self.vault
            .update_access_token(&self.business_id, &refreshed.access_token, refreshed.expires_in)
            .await
            .map_err(|e| CalendarError::Other(e.to_string()))?;
        info!(business_id = %self.business_id, "refreshed google access token");
        Ok(refreshed.access_token)
    }

    async fn check_status(response: reqwest::Response) -> Result<reqwest::Response, CalendarError> {
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let body = response.text().await.unwrap_or_default();
        Err(CalendarError::Api {
            status: status.as_u16(),
            body,
        })
    }
}

#[async_trait]
impl CalendarApi for GoogleCalendar {
    async fn freebusy(
        &self,
        time_min: DateTime<Utc>,
        time_max: DateTime<Utc>,
    ) -> Result<Vec<BusyInterval>, CalendarError> {
        let token = self.access_token().await?;
        let response = self
            .http
            .post(format!("{CALENDAR_BASE}/freeBusy"))
            .bearer_auth(&token)
            .timeout(self.timeout)
            .json(&json!({
                "timeMin": time_min.to_rfc3339(),
                "timeMax": time_max.to_rfc3339(),
                "items": [{ "id": "primary" }],
            }))
            .send()
            .await
            .map_err(CalendarError::from_reqwest)?;
        let response = Self::check_status(response).await?;

        #[derive(Deserialize)]
        struct FreeBusyResponse {
            calendars: std::collections::HashMap<String, CalendarBusy>,
        }
        #[derive(Deserialize)]
        struct CalendarBusy {
            #[serde(default)]
            busy: Vec<BusyInterval>,
        }

        let parsed: FreeBusyResponse = response
            .json()
            .await
            .map_err(|e| CalendarError::Other(e.to_string()))?;
        Ok(parsed
            .calendars
            .into_values()
            .flat_map(|c| c.busy)
            .collect())
    }

    async fn insert_event(&self, draft: &EventDraft) -> Result<String, CalendarError> {
        let token = self.access_token().await?;
        let response = self
            .http
            .post(format!("{CALENDAR_BASE}/calendars/primary/events"))
            .bearer_auth(&token)
            .timeout(self.timeout)
            .json(&json!({
                "summary": draft.summary,
                "description": draft.description,
                "start": { "dateTime": draft.start_utc.to_rfc3339(), "timeZone": draft.timezone },
                "end": { "dateTime": draft.end_utc.to_rfc3339(), "timeZone": draft.timezone },
                "extendedProperties": { "private": { "idempotencyKey": draft.idempotency_key } },
            }))
            .send()
            .await
            .map_err(CalendarError::from_reqwest)?;
        let response = Self::check_status(response).await?;

        #[derive(Deserialize)]
        struct Inserted {
            id: String,
        }
        let inserted: Inserted = response
            .json()
            .await
            .map_err(|e| CalendarError::Other(e.to_string()))?;
        Ok(inserted.id)
    }

    async fn list_events_by_idempotency(
        &self,
        time_min: DateTime<Utc>,
        time_max: DateTime<Utc>,
        idempotency_key: &str,
    ) -> Result<Vec<CalendarEvent>, CalendarError> {
        let token = self.access_token().await?;
        let response = self
            .http
            .get(format!("{CALENDAR_BASE}/calendars/primary/events"))
            .bearer_auth(&token)
            .timeout(self.timeout)
            .query(&[
                ("timeMin", time_min.to_rfc3339()),
                ("timeMax", time_max.to_rfc3339()),
                ("singleEvents", "true".into()),
                (
                    "privateExtendedProperty",
                    format!("idempotencyKey={idempotency_key}"),
                ),
            ])
            .send()
            .await
            .map_err(CalendarError::from_reqwest)?;
        let response = Self::check_status(response).await?;

        #[derive(Deserialize)]
        struct RawEvent {
            id: String,
            #[serde(default)]
            start: EventTime,
            #[serde(default)]
            end: EventTime,
            #[serde(default, rename = "extendedProperties")]
            extended: Option<ExtendedProps>,
        }
        #[derive(Deserialize)]
        struct ExtendedProps {
            #[serde(default)]
            private: std::collections::HashMap<String, String>,
        }
        #[derive(Deserialize)]
        struct Listing {
            #[serde(default)]
            items: Vec<RawEvent>,
        }

        let listing: Listing = response
            .json()
            .await
            .map_err(|e| CalendarError::Other(e.to_string()))?;
        Ok(listing
            .items
            .into_iter()
            .map(|raw| CalendarEvent {
                id: raw.id,
                start: raw.start,
                end: raw.end,
                idempotency_key: raw
                    .extended
                    .and_then(|e| e.private.get("idempotencyKey").cloned()),
            })
            .collect())
    }

    async fn delete_event(&self, event_id: &str) -> Result<(), CalendarError> {
        let token = self.access_token().await?;
        let response = self
            .http
            .delete(format!("{CALENDAR_BASE}/calendars/primary/events/{event_id}"))
            .bearer_auth(&token)
            .timeout(self.timeout)
            .send()
            .await
            .map_err(CalendarError::from_reqwest)?;
        // Already-gone events count as deleted.
        if matches!(response.status().as_u16(), 404 | 410) {
            return Ok(());
        }
        Self::check_status(response).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn utc(s: &str) -> DateTime<Utc> {
        s.parse().unwrap()
    }

    #[test]
    fn classification_of_retryable_errors() {
        assert!(CalendarError::Timeout.is_retryable());
        assert!(CalendarError::Network("reset".into()).is_retryable());
        assert!(CalendarError::Api { status: 503, body: String::new() }.is_retryable());
        assert!(CalendarError::Api { status: 429, body: String::new() }.is_retryable());
        assert!(!CalendarError::Api { status: 400, body: String::new() }.is_retryable());
        assert!(!CalendarError::Api { status: 404, body: String::new() }.is_retryable());
        assert!(!CalendarError::NotConfigured.is_retryable());
        assert!(!CalendarError::NoTokens.is_retryable());
    }

    #[test]
    fn backoff_doubles_to_cap() {
        let budget = RetryBudget::freebusy();
        assert_eq!(backoff_base_ms(&budget, 0), 250);
        assert_eq!(backoff_base_ms(&budget, 1), 500);
        assert_eq!(backoff_base_ms(&budget, 2), 1000);
        assert_eq!(backoff_base_ms(&budget, 3), 1500);
        assert_eq!(backoff_base_ms(&budget, 10), 1500);
    }

    #[tokio::test]
    async fn retries_stop_on_non_retryable() {
        let mut calls = 0;
        let result: Result<(), _> = with_retries(RetryBudget::lookup(), || {
            calls += 1;
            async move {
                Err(CalendarError::Api {
                    status: 403,
                    body: String::new(),
                })
            }
        })
        .await;
        assert!(result.is_err());
        assert_eq!(calls, 1);
    }

    #[tokio::test]
    async fn retries_exhaust_attempts_on_transient_errors() {
        let mut calls = 0;
        let result: Result<(), _> = with_retries(
            RetryBudget {
                base_ms: 1,
                cap_ms: 2,
                max_attempts: 3,
                max_elapsed_ms: 10_000,
            },
            || {
                calls += 1;
                async move { Err(CalendarError::Timeout) }
            },
        )
        .await;
        assert!(matches!(result, Err(CalendarError::Timeout)));
        assert_eq!(calls, 3);
    }

    #[tokio::test]
    async fn retry_succeeds_after_transient_failure() {
        let mut calls = 0;
        let result = with_retries(
            RetryBudget {
                base_ms: 1,
                cap_ms: 2,
                max_attempts: 3,
                max_elapsed_ms: 10_000,
            },
            || {
                calls += 1;
                let n = calls;
                async move {
                    if n < 2 {
                        Err(CalendarError::Timeout)
                    } else {
                        Ok(n)
                    }
                }
            },
        )
        .await
        .unwrap();
        assert_eq!(result, 2);
    }

    #[test]
    fn timed_event_matches_within_two_minutes() {
        let event = CalendarEvent {
            id: "ev1".into(),
            start: EventTime {
                date_time: Some(utc("2026-01-12T15:01:00Z")),
                date: None,
            },
            end: EventTime {
                date_time: Some(utc("2026-01-12T16:01:00Z")),
                date: None,
            },
            idempotency_key: Some("key1".into()),
        };
        assert!(event_matches_window(
            &event,
            utc("2026-01-12T15:00:00Z"),
            utc("2026-01-12T16:00:00Z"),
            "key1",
        ));
        // Off by five minutes: no match.
        assert!(!event_matches_window(
            &event,
            utc("2026-01-12T15:06:00Z"),
            utc("2026-01-12T16:06:00Z"),
            "key1",
        ));
        // Wrong idempotency key: no match even with exact times.
        assert!(!event_matches_window(
            &event,
            utc("2026-01-12T15:01:00Z"),
            utc("2026-01-12T16:01:00Z"),
            "other",
        ));
    }

    #[test]
    fn all_day_event_matches_on_exact_date() {
        let event = CalendarEvent {
            id: "ev2".into(),
            start: EventTime {
                date_time: None,
                date: Some(NaiveDate::from_ymd_opt(2026, 1, 12).unwrap()),
            },
            end: EventTime {
                date_time: None,
                date: Some(NaiveDate::from_ymd_opt(2026, 1, 12).unwrap()),
            },
            idempotency_key: Some("key1".into()),
        };
        assert!(event_matches_window(
            &event,
            utc("2026-01-12T15:00:00Z"),
            utc("2026-01-12T16:00:00Z"),
            "key1",
        ));
    }
}
