use sqlx::PgPool;
use tracing::{info, warn};

const SWEEP_INTERVAL_SECS: u64 = 60;

/// Spawn the periodic hold-expiry sweeper. The booking path already sweeps
/// opportunistically inside its own transaction; this loop bounds how long
/// expired holds can linger on low-traffic tenants.
pub fn start(pool: PgPool) {
    tokio::spawn(async move {
        loop {
            tokio::time::sleep(tokio::time::Duration::from_secs(SWEEP_INTERVAL_SECS)).await;
            match sweep_all(&pool).await {
                Ok(0) => {}
                Ok(n) => info!(swept = n, "hold sweeper cancelled expired holds"),
                Err(e) => warn!("Hold sweeper pass failed: {e}"),
            }
        }
    });
}

/// Cancel every expired pending hold across all tenants. Idempotent.
pub async fn sweep_all(pool: &PgPool) -> anyhow::Result<u64> {
    let result = sqlx::query(
        "UPDATE bookings
         SET status = 'cancelled', hold_expires_at = NULL,
             failure_reason = COALESCE(failure_reason, 'HOLD_EXPIRED'),
             updated_at = NOW()
         WHERE status = 'pending' AND hold_expires_at <= NOW()",
    )
    .execute(pool)
    .await?;
    Ok(result.rows_affected())
}
