use std::sync::Arc;

use serde_json::Value;
use sqlx::PgPool;
use tracing::{info, warn};

use crate::config::Config;
use crate::models::booking::BookingStatus;
use crate::models::logs::{SmsKind, SmsStatus};
use crate::models::retry::{retry_backoff_secs, RetryKind, RetryTask};
use crate::services::calendar::{CalendarApi, GoogleCalendar};
use crate::services::ledger::BookingLedger;
use crate::services::notifications::NotificationService;
use crate::services::token_vault::TokenVault;

const TICK_SECS: u64 = 15;
const BATCH_SIZE: i64 = 20;

/// Spawn the durable-outbox worker: every tick, drain up to a batch of due
/// pending tasks through their kind-specific executors. Exactly one
/// instance runs per process; nothing a task does can kill the loop.
pub fn start(
    pool: PgPool,
    config: Arc<Config>,
    vault: Arc<TokenVault>,
    notifications: Arc<NotificationService>,
) {
    tokio::spawn(async move {
        let ledger = BookingLedger::new(pool.clone());
        loop {
            tokio::time::sleep(tokio::time::Duration::from_secs(TICK_SECS)).await;
            if let Err(e) = run_tick(&pool, &config, &vault, &notifications, &ledger).await {
                warn!("Retry worker tick failed: {e}");
            }
        }
    });
}

pub async fn run_tick(
    pool: &PgPool,
    config: &Config,
    vault: &Arc<TokenVault>,
    notifications: &Arc<NotificationService>,
    ledger: &BookingLedger,
) -> anyhow::Result<()> {
    let due: Vec<RetryTask> = sqlx::query_as(
        "SELECT id, business_id, booking_id, kind, payload, attempt_count,
                max_attempts, next_attempt_at, last_error, status, created_at
         FROM retry_queue
         WHERE status = 'pending' AND next_attempt_at <= NOW()
         ORDER BY next_attempt_at, created_at
         LIMIT $1",
    )
    .bind(BATCH_SIZE)
    .fetch_all(pool)
    .await?;

    for task in due {
        let outcome = execute(config, vault, notifications, ledger, &task).await;
        let attempt_count = task.attempt_count + 1;
        match outcome {
            Ok(()) => {
                sqlx::query(
                    "UPDATE retry_queue
                     SET status = 'succeeded', attempt_count = $2, last_error = NULL,
                         updated_at = NOW()
                     WHERE id = $1",
                )
                .bind(task.id)
                .bind(attempt_count)
                .execute(pool)
                .await?;
                info!(retry_id = %task.id, kind = task.kind.as_str(), "retry task succeeded");
            }
            Err(e) => {
                let exhausted = attempt_count >= task.max_attempts;
                warn!(
                    retry_id = %task.id,
                    kind = task.kind.as_str(),
                    attempt = attempt_count,
                    exhausted,
                    error = %e,
                    "retry task failed"
                );
                if exhausted {
                    sqlx::query(
                        "UPDATE retry_queue
                         SET status = 'failed', attempt_count = $2, last_error = $3,
                             updated_at = NOW()
                         WHERE id = $1",
                    )
                    .bind(task.id)
                    .bind(attempt_count)
                    .bind(e.to_string())
                    .execute(pool)
                    .await?;
                } else {
                    let delay = retry_backoff_secs(attempt_count);
                    sqlx::query(
                        "UPDATE retry_queue
                         SET attempt_count = $2, last_error = $3,
                             next_attempt_at = NOW() + $4 * INTERVAL '1 second',
                             updated_at = NOW()
                         WHERE id = $1",
                    )
                    .bind(task.id)
                    .bind(attempt_count)
                    .bind(e.to_string())
                    .bind(delay as f64)
                    .execute(pool)
                    .await?;
                }
            }
        }
    }
    Ok(())
}

async fn execute(
    config: &Config,
    vault: &Arc<TokenVault>,
    notifications: &Arc<NotificationService>,
    ledger: &BookingLedger,
    task: &RetryTask,
) -> anyhow::Result<()> {
    match task.kind {
        RetryKind::TwilioSms => execute_sms(notifications, task).await,
        RetryKind::GcalCreate => execute_gcal_create(config, vault, ledger, task).await,
        RetryKind::GcalDelete => execute_gcal_delete(config, vault, task).await,
        other => anyhow::bail!("UNSUPPORTED_KIND: {}", other.as_str()),
    }
}

async fn execute_sms(
    notifications: &Arc<NotificationService>,
    task: &RetryTask,
) -> anyhow::Result<()> {
    let payload = &task.payload.0;
    let to = payload_str(payload, "to")?;
    let body = payload_str(payload, "body")?;

    let sid = notifications.provider().send_sms(to, body).await?;

    if payload.get("logOnSuccess").is_some() {
        notifications
            .log_sms(
                &task.business_id,
                task.booking_id,
                Some(to),
                Some(body),
                Some(&sid),
                SmsKind::Confirmation,
                SmsStatus::Sent,
                None,
                None,
            )
            .await?;
    }
    Ok(())
}

async fn execute_gcal_create(
    config: &Config,
    vault: &Arc<TokenVault>,
    ledger: &BookingLedger,
    task: &RetryTask,
) -> anyhow::Result<()> {
    let booking_id = task
        .booking_id
        .ok_or_else(|| anyhow::anyhow!("gcal_create task without booking id"))?;
    let booking = ledger
        .get_booking_by_id(booking_id)
        .await?
        .ok_or_else(|| anyhow::anyhow!("booking {booking_id} not found"))?;

    let calendar = GoogleCalendar::for_business(config, vault.clone(), &task.business_id)?;
    let draft = crate::services::calendar::EventDraft {
        summary: booking.job_summary.clone().unwrap_or_default(),
        description: format!("Booking {}", booking.id),
        start_utc: booking.start_utc,
        end_utc: booking.end_utc,
        timezone: payload_str(&task.payload.0, "timezone")
            .unwrap_or("Etc/UTC")
            .to_string(),
        idempotency_key: booking.idempotency_key.clone(),
    };
    let event_id = calendar.insert_event(&draft).await?;

    // A booking that was marked failed while the calendar was down comes
    // back to confirmed once its event finally lands.
    if booking.status == BookingStatus::Failed {
        ledger
            .update_booking_status(
                booking_id,
                BookingStatus::Confirmed,
                None,
                Some(&event_id),
                None,
            )
            .await?;
    }
    Ok(())
}

async fn execute_gcal_delete(
    config: &Config,
    vault: &Arc<TokenVault>,
    task: &RetryTask,
) -> anyhow::Result<()> {
    let event_id = payload_str(&task.payload.0, "eventId")?;
    let calendar = GoogleCalendar::for_business(config, vault.clone(), &task.business_id)?;
    calendar.delete_event(event_id).await?;
    Ok(())
}

fn payload_str<'a>(payload: &'a Value, key: &str) -> anyhow::Result<&'a str> {
    payload
        .get(key)
        .and_then(Value::as_str)
        .ok_or_else(|| anyhow::anyhow!("retry payload missing '{key}'"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn payload_accessor_reports_missing_keys() {
        let payload = json!({ "to": "+15550001111" });
        assert_eq!(payload_str(&payload, "to").unwrap(), "+15550001111");
        let err = payload_str(&payload, "body").unwrap_err();
        assert!(err.to_string().contains("body"));
    }
}
