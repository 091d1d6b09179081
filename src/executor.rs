//! Retry wrapper for units of work against an already-acquired connection

use futures::future::BoxFuture;
use sqlx::sqlite::SqliteConnection;
use tracing::debug;

use crate::error::Result;
use crate::retry::RetryPolicy;

/// Run `op` against `conn`, retrying the whole unit of work when the engine
/// reports a transient condition (busy, locked, cannot-open, warning).
///
/// The policy wraps the ENTIRE closure, not individual statements inside it:
/// an aborted attempt may have left partial side effects behind, so callers
/// make the work idempotent (upsert rather than insert) when that matters.
/// Fatal errors and exhausted budgets propagate the original error
/// unchanged.
pub async fn execute_with_retry<T, F>(
   policy: &RetryPolicy,
   conn: &mut SqliteConnection,
   mut op: F,
) -> Result<T>
where
   F: for<'a> FnMut(&'a mut SqliteConnection) -> BoxFuture<'a, Result<T>>,
{
   let mut state = policy.state();
   loop {
      match op(conn).await {
         Ok(value) => return Ok(value),
         Err(e) if e.is_transient() => match state.next_delay() {
            Some(delay) => {
               debug!(delay_ms = delay.as_millis() as u64, "transient engine error, retrying: {}", e);
               tokio::time::sleep(delay).await;
            }
            None => return Err(e),
         },
         Err(e) => return Err(e),
      }
   }
}
