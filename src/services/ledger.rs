use chrono::{DateTime, Utc};
use serde_json::Value;
use sqlx::PgPool;
use tracing::{debug, info};
use uuid::Uuid;

use crate::error::BookingError;
use crate::models::booking::{Booking, BookingStatus, PendingHold};
use crate::models::retry::RetryKind;

const BOOKING_COLUMNS: &str =
    "id, business_id, start_utc, end_utc, overlap_start, overlap_end, status,
     hold_expires_at, customer_name, customer_phone, customer_email,
     customer_address, service_type, notes, is_emergency, job_summary,
     gcal_event_id, slot_key, idempotency_key, failure_reason,
     created_at, updated_at";

/// Predicate for a booking that still owns its slot: confirmed, or pending
/// with an unexpired hold.
const ACTIVE: &str =
    "(status = 'confirmed' OR (status = 'pending'
       AND (hold_expires_at IS NULL OR hold_expires_at > NOW())))";

#[derive(Debug)]
pub enum HoldOutcome {
    Created(Booking),
    /// An active booking overlaps the requested window, or the slot-key
    /// index fired.
    SlotTaken,
    /// The idempotency-key index fired - a concurrent request with the same
    /// key won; the caller should re-run the idempotency lookup.
    IdempotencyRace,
}

#[derive(Clone)]
pub struct BookingLedger {
    pool: PgPool,
}

impl BookingLedger {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Sweep expired pending holds for one business to `cancelled`.
    /// Idempotent; runs opportunistically on every booking attempt and from
    /// the periodic sweeper.
    pub async fn cleanup_expired_holds(&self, business_id: &str) -> anyhow::Result<u64> {
        let result = sqlx::query(
            "UPDATE bookings
             SET status = 'cancelled', hold_expires_at = NULL,
                 failure_reason = COALESCE(failure_reason, 'HOLD_EXPIRED'),
                 updated_at = NOW()
             WHERE business_id = $1 AND status = 'pending' AND hold_expires_at <= NOW()",
        )
        .bind(business_id)
        .execute(&self.pool)
        .await?;
        if result.rows_affected() > 0 {
            info!(business_id, swept = result.rows_affected(), "expired holds cancelled");
        }
        Ok(result.rows_affected())
    }

    /// The critical section. Writers for one business serialize on a
    /// per-tenant advisory lock (the pooled-Postgres equivalent of the
    /// single-writer BEGIN IMMEDIATE this design descends from): sweep
    /// expired holds, probe for an active overlap, then insert the pending
    /// row. Whichever transaction commits first wins; the partial unique
    /// indexes on slot_key/idempotency_key catch anything the probe missed.
    pub async fn create_pending_hold_if_available(
        &self,
        hold: &PendingHold,
    ) -> anyhow::Result<HoldOutcome> {
        let mut tx = self.pool.begin().await?;

        sqlx::query("SELECT pg_advisory_xact_lock(hashtext($1))")
            .bind(&hold.business_id)
            .execute(&mut *tx)
            .await?;

        sqlx::query(
            "UPDATE bookings
             SET status = 'cancelled', hold_expires_at = NULL,
                 failure_reason = COALESCE(failure_reason, 'HOLD_EXPIRED'),
                 updated_at = NOW()
             WHERE business_id = $1 AND status = 'pending' AND hold_expires_at <= NOW()",
        )
        .bind(&hold.business_id)
        .execute(&mut *tx)
        .await?;

        let conflict: Option<Uuid> = sqlx::query_scalar(&format!(
            "SELECT id FROM bookings
             WHERE business_id = $1 AND {ACTIVE}
               AND overlap_start < $2 AND overlap_end > $3
             LIMIT 1"
        ))
        .bind(&hold.business_id)
        .bind(hold.overlap_end)
        .bind(hold.overlap_start)
        .fetch_optional(&mut *tx)
        .await?;

        if let Some(existing) = conflict {
            tx.rollback().await?;
            debug!(business_id = %hold.business_id, conflicting = %existing, "hold rejected on overlap");
            return Ok(HoldOutcome::SlotTaken);
        }

        let inserted = sqlx::query_as::<_, Booking>(&format!(
            "INSERT INTO bookings
                (id, business_id, start_utc, end_utc, overlap_start, overlap_end,
                 status, hold_expires_at, customer_name, customer_phone,
                 customer_email, customer_address, service_type, notes,
                 is_emergency, job_summary, slot_key, idempotency_key)
             VALUES ($1, $2, $3, $4, $5, $6, 'pending', $7, $8, $9, $10, $11,
                     $12, $13, $14, $15, $16, $17)
             RETURNING {BOOKING_COLUMNS}"
        ))
        .bind(Uuid::new_v4())
        .bind(&hold.business_id)
        .bind(hold.start_utc)
        .bind(hold.end_utc)
        .bind(hold.overlap_start)
        .bind(hold.overlap_end)
        .bind(hold.hold_expires_at)
        .bind(&hold.customer.name)
        .bind(&hold.customer.phone)
        .bind(&hold.customer.email)
        .bind(&hold.customer.address)
        .bind(&hold.service_type)
        .bind(&hold.notes)
        .bind(hold.is_emergency)
        .bind(&hold.job_summary)
        .bind(&hold.slot_key)
        .bind(&hold.idempotency_key)
        .fetch_one(&mut *tx)
        .await;

        let booking = match inserted {
            Ok(b) => b,
            Err(err) => {
                tx.rollback().await?;
                return classify_insert_error(err);
            }
        };

        tx.commit().await?;
        Ok(HoldOutcome::Created(booking))
    }

    pub async fn get_booking_by_id(&self, id: Uuid) -> anyhow::Result<Option<Booking>> {
        let booking = sqlx::query_as::<_, Booking>(&format!(
            "SELECT {BOOKING_COLUMNS} FROM bookings WHERE id = $1"
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(booking)
    }

    /// Latest active booking (confirmed or live pending) for a client retry
    /// with the same idempotency key.
    pub async fn get_booking_by_idempotency_key(
        &self,
        business_id: &str,
        key: &str,
    ) -> anyhow::Result<Option<Booking>> {
        let booking = sqlx::query_as::<_, Booking>(&format!(
            "SELECT {BOOKING_COLUMNS} FROM bookings
             WHERE business_id = $1 AND idempotency_key = $2 AND {ACTIVE}
             ORDER BY created_at DESC
             LIMIT 1"
        ))
        .bind(business_id)
        .bind(key)
        .fetch_optional(&self.pool)
        .await?;
        Ok(booking)
    }

    pub async fn find_overlapping_active_bookings(
        &self,
        business_id: &str,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> anyhow::Result<Vec<Booking>> {
        let bookings = sqlx::query_as::<_, Booking>(&format!(
            "SELECT {BOOKING_COLUMNS} FROM bookings
             WHERE business_id = $1 AND {ACTIVE}
               AND overlap_start < $2 AND overlap_end > $3
             ORDER BY start_utc"
        ))
        .bind(business_id)
        .bind(end)
        .bind(start)
        .fetch_all(&self.pool)
        .await?;
        Ok(bookings)
    }

    /// Confirmed bookings whose buffered window intersects [from, to) -
    /// what the availability route folds into the busy list.
    pub async fn confirmed_bookings_in_window(
        &self,
        business_id: &str,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> anyhow::Result<Vec<Booking>> {
        let bookings = sqlx::query_as::<_, Booking>(&format!(
            "SELECT {BOOKING_COLUMNS} FROM bookings
             WHERE business_id = $1 AND status = 'confirmed'
               AND overlap_start < $2 AND overlap_end > $3
             ORDER BY start_utc"
        ))
        .bind(business_id)
        .bind(to)
        .bind(from)
        .fetch_all(&self.pool)
        .await?;
        Ok(bookings)
    }

    /// Single enforcement point for the status machine: read the row under
    /// the row lock, check the transition, apply status + fields in one
    /// UPDATE with `updated_at` bumped. `require_from` pins the expected
    /// current status for the named operations (confirm/fail); without it
    /// the table from the model applies, extended by failed → confirmed,
    /// which the retry worker uses when a deferred gcal_create lands.
    pub async fn update_booking_status(
        &self,
        id: Uuid,
        new_status: BookingStatus,
        require_from: Option<BookingStatus>,
        gcal_event_id: Option<&str>,
        failure_reason: Option<&str>,
    ) -> Result<Booking, BookingError> {
        let mut tx = self.pool.begin().await.map_err(BookingError::Db)?;

        let current: Option<Booking> = sqlx::query_as::<_, Booking>(&format!(
            "SELECT {BOOKING_COLUMNS} FROM bookings WHERE id = $1 FOR UPDATE"
        ))
        .bind(id)
        .fetch_optional(&mut *tx)
        .await
        .map_err(BookingError::Db)?;
        let current = current
            .ok_or_else(|| BookingError::Other(anyhow::anyhow!("booking {id} not found")))?;

        let allowed = match require_from {
            Some(required) => current.status == required,
            None => {
                current.status.can_transition_to(new_status)
                    || (current.status == BookingStatus::Failed
                        && new_status == BookingStatus::Confirmed)
            }
        };
        if !allowed {
            tx.rollback().await.map_err(BookingError::Db)?;
            return Err(BookingError::InvalidStatusTransition {
                from: current.status.as_str(),
                to: new_status.as_str(),
            });
        }

        let updated = sqlx::query_as::<_, Booking>(&format!(
            "UPDATE bookings
             SET status = $2,
                 hold_expires_at = NULL,
                 gcal_event_id = COALESCE($3, gcal_event_id),
                 failure_reason = COALESCE($4, failure_reason),
                 updated_at = NOW()
             WHERE id = $1
             RETURNING {BOOKING_COLUMNS}"
        ))
        .bind(id)
        .bind(new_status)
        .bind(gcal_event_id)
        .bind(failure_reason)
        .fetch_one(&mut *tx)
        .await
        .map_err(BookingError::Db)?;

        tx.commit().await.map_err(BookingError::Db)?;
        Ok(updated)
    }

    /// pending → confirmed, recording the external event id and clearing the
    /// hold.
    pub async fn confirm_booking(&self, id: Uuid, event_id: &str) -> Result<Booking, BookingError> {
        self.update_booking_status(
            id,
            BookingStatus::Confirmed,
            Some(BookingStatus::Pending),
            Some(event_id),
            None,
        )
        .await
    }

    /// pending → failed with a safe machine-readable reason.
    pub async fn fail_booking(&self, id: Uuid, reason: &str) -> Result<Booking, BookingError> {
        self.update_booking_status(
            id,
            BookingStatus::Failed,
            Some(BookingStatus::Pending),
            None,
            Some(reason),
        )
        .await
    }

    pub async fn cancel_booking(&self, id: Uuid) -> Result<Booking, BookingError> {
        self.update_booking_status(id, BookingStatus::Cancelled, None, None, None)
            .await
    }

    /// Append a durable outbox row for a deferred external side effect.
    pub async fn enqueue_retry(
        &self,
        business_id: &str,
        booking_id: Option<Uuid>,
        kind: RetryKind,
        payload: &Value,
    ) -> anyhow::Result<Uuid> {
        let id = Uuid::new_v4();
        sqlx::query(
            "INSERT INTO retry_queue (id, business_id, booking_id, kind, payload, next_attempt_at)
             VALUES ($1, $2, $3, $4, $5, NOW())",
        )
        .bind(id)
        .bind(business_id)
        .bind(booking_id)
        .bind(kind)
        .bind(sqlx::types::Json(payload))
        .execute(&self.pool)
        .await?;
        Ok(id)
    }

    /// Close an outbox row whose work already happened on the immediate
    /// path.
    pub async fn complete_retry(&self, id: Uuid) -> anyhow::Result<()> {
        sqlx::query(
            "UPDATE retry_queue
             SET status = 'succeeded', updated_at = NOW()
             WHERE id = $1 AND status = 'pending'",
        )
        .bind(id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

/// Map an insert failure on the partial unique indexes to its outcome;
/// anything else bubbles as a real error.
fn classify_insert_error(err: sqlx::Error) -> anyhow::Result<HoldOutcome> {
    if let sqlx::Error::Database(ref db_err) = err {
        match db_err.constraint() {
            Some("bookings_active_idempotency_key") => return Ok(HoldOutcome::IdempotencyRace),
            Some("bookings_active_slot_key") => return Ok(HoldOutcome::SlotTaken),
            _ => {}
        }
    }
    Err(err.into())
}
