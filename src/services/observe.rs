use std::future::Future;
use std::time::{Duration, Instant};

use tracing::{info, warn};

/// Race an outbound call against a single-shot deadline, logging one
/// structured line per outcome: {op, ok, duration_ms, error?}. On deadline
/// the error message carries `timeout_code` so callers can classify it.
pub async fn timed<T, F>(
    op: &str,
    limit: Duration,
    timeout_code: &str,
    fut: F,
) -> anyhow::Result<T>
where
    F: Future<Output = anyhow::Result<T>>,
{
    let started = Instant::now();
    match tokio::time::timeout(limit, fut).await {
        Ok(Ok(value)) => {
            info!(op, ok = true, duration_ms = started.elapsed().as_millis() as u64);
            Ok(value)
        }
        Ok(Err(err)) => {
            warn!(
                op,
                ok = false,
                duration_ms = started.elapsed().as_millis() as u64,
                error = %err,
            );
            Err(err)
        }
        Err(_) => {
            warn!(
                op,
                ok = false,
                duration_ms = started.elapsed().as_millis() as u64,
                error = timeout_code,
            );
            Err(anyhow::anyhow!("{timeout_code}: {op} exceeded {}ms", limit.as_millis()))
        }
    }
}
