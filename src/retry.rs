//! Bounded retry with backoff for transient failures

use std::future::Future;
use std::time::Duration;

use tracing::debug;

/// Retry budget and backoff schedule applied to one logical operation.
///
/// The policy itself is reusable; each run gets its own [`RetryState`].
#[derive(Debug, Clone)]
pub struct RetryPolicy {
   /// Retries allowed after the initial attempt
   pub max_retries: u32,

   /// Delay before the first retry
   pub base_delay: Duration,

   /// Whether the delay doubles on each subsequent retry (instead of
   /// staying constant)
   pub double_delay: bool,
}

impl Default for RetryPolicy {
   fn default() -> Self {
      Self {
         max_retries: 3,
         base_delay: Duration::from_millis(500),
         double_delay: true,
      }
   }
}

impl RetryPolicy {
   /// Fresh attempt/delay state for a single run of this policy.
   pub fn state(&self) -> RetryState {
      RetryState {
         remaining: self.max_retries,
         delay: self.base_delay,
         double_delay: self.double_delay,
      }
   }

   /// Run `op`, retrying while `is_transient` classifies the failure as
   /// retryable and the attempt budget lasts.
   ///
   /// Waits are idle (`tokio::time::sleep`), never spinning. On a fatal
   /// classification or an exhausted budget the ORIGINAL error is
   /// propagated unchanged. Total attempts are `max_retries + 1`.
   pub async fn run<T, E, F, Fut>(
      &self,
      mut op: F,
      mut is_transient: impl FnMut(&E) -> bool,
   ) -> std::result::Result<T, E>
   where
      F: FnMut() -> Fut,
      Fut: Future<Output = std::result::Result<T, E>>,
   {
      let mut state = self.state();
      loop {
         match op().await {
            Ok(value) => return Ok(value),
            Err(e) if is_transient(&e) => match state.next_delay() {
               Some(delay) => {
                  debug!(delay_ms = delay.as_millis() as u64, "transient failure, retrying");
                  tokio::time::sleep(delay).await;
               }
               None => return Err(e),
            },
            Err(e) => return Err(e),
         }
      }
   }
}

/// Attempts remaining plus the current backoff delay.
///
/// Scoped to a single logical operation; never persisted.
#[derive(Debug)]
pub struct RetryState {
   remaining: u32,
   delay: Duration,
   double_delay: bool,
}

impl RetryState {
   /// Delay to wait before the next attempt, or `None` when the budget is
   /// exhausted.
   pub fn next_delay(&mut self) -> Option<Duration> {
      if self.remaining == 0 {
         return None;
      }
      self.remaining -= 1;
      let delay = self.delay;
      if self.double_delay {
         self.delay *= 2;
      }
      Some(delay)
   }
}

#[cfg(test)]
mod tests {
   use super::*;
   use std::sync::atomic::{AtomicU32, Ordering};

   fn fast_policy(max_retries: u32, double_delay: bool) -> RetryPolicy {
      RetryPolicy {
         max_retries,
         base_delay: Duration::from_millis(1),
         double_delay,
      }
   }

   #[test]
   fn test_doubling_delay_schedule() {
      let policy = RetryPolicy {
         max_retries: 3,
         base_delay: Duration::from_millis(100),
         double_delay: true,
      };
      let mut state = policy.state();
      assert_eq!(state.next_delay(), Some(Duration::from_millis(100)));
      assert_eq!(state.next_delay(), Some(Duration::from_millis(200)));
      assert_eq!(state.next_delay(), Some(Duration::from_millis(400)));
      assert_eq!(state.next_delay(), None);
   }

   #[test]
   fn test_constant_delay_schedule() {
      let policy = RetryPolicy {
         max_retries: 2,
         base_delay: Duration::from_millis(50),
         double_delay: false,
      };
      let mut state = policy.state();
      assert_eq!(state.next_delay(), Some(Duration::from_millis(50)));
      assert_eq!(state.next_delay(), Some(Duration::from_millis(50)));
      assert_eq!(state.next_delay(), None);
   }

   #[tokio::test]
   async fn test_transient_failures_attempted_max_plus_one_times() {
      let attempts = AtomicU32::new(0);
      let result: Result<(), &str> = fast_policy(3, true)
         .run(
            || {
               attempts.fetch_add(1, Ordering::SeqCst);
               async { Err("busy") }
            },
            |_| true,
         )
         .await;

      assert_eq!(result, Err("busy"), "original error propagates unchanged");
      assert_eq!(attempts.load(Ordering::SeqCst), 4, "initial + 3 retries");
   }

   #[tokio::test]
   async fn test_fatal_failure_attempted_exactly_once() {
      let attempts = AtomicU32::new(0);
      let result: Result<(), &str> = fast_policy(3, true)
         .run(
            || {
               attempts.fetch_add(1, Ordering::SeqCst);
               async { Err("corrupt") }
            },
            |_| false,
         )
         .await;

      assert_eq!(result, Err("corrupt"));
      assert_eq!(attempts.load(Ordering::SeqCst), 1);
   }

   #[tokio::test]
   async fn test_success_after_transient_failures() {
      let attempts = AtomicU32::new(0);
      let result: Result<u32, &str> = fast_policy(3, false)
         .run(
            || {
               let attempt = attempts.fetch_add(1, Ordering::SeqCst);
               async move { if attempt < 2 { Err("locked") } else { Ok(attempt) } }
            },
            |_| true,
         )
         .await;

      assert_eq!(result, Ok(2));
      assert_eq!(attempts.load(Ordering::SeqCst), 3);
   }

   #[tokio::test]
   async fn test_immediate_success_never_sleeps() {
      let result: Result<u32, &str> = fast_policy(3, true).run(|| async { Ok(7) }, |_| true).await;
      assert_eq!(result, Ok(7));
   }
}
