//! Integration tests for resilient execution against a genuinely busy
//! engine: two registries over the same file give two uncoordinated writers.

use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use futures::FutureExt;
use sqlx_sqlite_model_store::{
   PoolConfig, PoolRegistry, RetryPolicy, execute_with_retry,
};
use tempfile::TempDir;

fn zero_busy_config() -> PoolConfig {
   PoolConfig {
      // No engine-side waiting, so lock contention surfaces as SQLITE_BUSY
      // immediately and the retry layer is what gets exercised.
      busy_timeout: Duration::ZERO,
      retry: RetryPolicy {
         max_retries: 2,
         base_delay: Duration::from_millis(1),
         double_delay: true,
      },
      ..Default::default()
   }
}

fn fast_policy(max_retries: u32, base_delay_ms: u64) -> RetryPolicy {
   RetryPolicy {
      max_retries,
      base_delay: Duration::from_millis(base_delay_ms),
      double_delay: false,
   }
}

/// Two registries over one file: independent permit maps, so their writers
/// genuinely contend at the engine level.
async fn setup_contending_writers() -> (TempDir, PoolRegistry, PoolRegistry, std::path::PathBuf) {
   let temp_dir = TempDir::new().unwrap();
   let path = temp_dir.path().join("busy.db");

   let registry_a = PoolRegistry::new(zero_busy_config());
   let registry_b = PoolRegistry::new(zero_busy_config());

   let pool = registry_a.pool(&path);
   pool.ensure_created().await.unwrap();
   let mut db = pool.acquire(true).await.unwrap();
   sqlx::query("CREATE TABLE entries (id INTEGER PRIMARY KEY)")
      .execute(&mut *db)
      .await
      .unwrap();
   drop(db);

   (temp_dir, registry_a, registry_b, path)
}

#[tokio::test]
async fn test_fatal_error_attempted_exactly_once() {
   let temp_dir = TempDir::new().unwrap();
   let path = temp_dir.path().join("fatal.db");
   let registry = PoolRegistry::new(zero_busy_config());
   let pool = registry.pool(&path);
   pool.ensure_created().await.unwrap();

   let mut db = pool.acquire(true).await.unwrap();
   let attempts = AtomicU32::new(0);

   let result = execute_with_retry(&fast_policy(3, 1), &mut db, |conn| {
      attempts.fetch_add(1, Ordering::SeqCst);
      async move {
         sqlx::query("SELECT * FROM no_such_table").execute(conn).await?;
         Ok(())
      }
      .boxed()
   })
   .await;

   let err = result.unwrap_err();
   assert!(!err.is_transient(), "malformed query is fatal");
   assert_eq!(attempts.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_busy_engine_exhausts_retry_budget() {
   let (_temp_dir, registry_a, registry_b, path) = setup_contending_writers().await;

   // Writer A holds the write lock for the whole test
   let pool_a = registry_a.pool(&path);
   let mut holder = pool_a.acquire(true).await.unwrap();
   sqlx::query("BEGIN IMMEDIATE").execute(&mut *holder).await.unwrap();
   sqlx::query("INSERT INTO entries (id) VALUES (1)")
      .execute(&mut *holder)
      .await
      .unwrap();

   // Writer B retries against the held lock until the budget runs out
   let pool_b = registry_b.pool(&path);
   let mut db_b = pool_b.acquire(true).await.unwrap();
   let attempts = AtomicU32::new(0);

   let result = execute_with_retry(&fast_policy(2, 5), &mut db_b, |conn| {
      attempts.fetch_add(1, Ordering::SeqCst);
      async move {
         sqlx::query("INSERT INTO entries (id) VALUES (2)")
            .execute(conn)
            .await?;
         Ok(())
      }
      .boxed()
   })
   .await;

   let err = result.unwrap_err();
   assert!(err.is_transient(), "busy propagates once the budget is spent");
   assert_eq!(attempts.load(Ordering::SeqCst), 3, "initial + 2 retries");

   sqlx::query("ROLLBACK").execute(&mut *holder).await.unwrap();
}

#[tokio::test]
async fn test_busy_engine_recovers_within_budget() {
   let (_temp_dir, registry_a, registry_b, path) = setup_contending_writers().await;

   let pool_a = registry_a.pool(&path);
   let mut holder = pool_a.acquire(true).await.unwrap();
   sqlx::query("BEGIN IMMEDIATE").execute(&mut *holder).await.unwrap();
   sqlx::query("INSERT INTO entries (id) VALUES (1)")
      .execute(&mut *holder)
      .await
      .unwrap();

   // Release the lock while writer B is mid-retry
   let release = tokio::spawn(async move {
      tokio::time::sleep(Duration::from_millis(300)).await;
      sqlx::query("COMMIT").execute(&mut *holder).await.unwrap();
   });

   let pool_b = registry_b.pool(&path);
   let mut db_b = pool_b.acquire(true).await.unwrap();
   let attempts = AtomicU32::new(0);

   let result = execute_with_retry(&fast_policy(12, 50), &mut db_b, |conn| {
      attempts.fetch_add(1, Ordering::SeqCst);
      async move {
         sqlx::query("INSERT INTO entries (id) VALUES (2)")
            .execute(conn)
            .await?;
         Ok(())
      }
      .boxed()
   })
   .await;

   assert!(result.is_ok(), "succeeds once the lock is released");
   assert!(attempts.load(Ordering::SeqCst) >= 2, "at least one retry happened");
   release.await.unwrap();
}

#[tokio::test]
async fn test_read_acquire_on_missing_file_fails_after_retries() {
   let temp_dir = TempDir::new().unwrap();
   let registry = PoolRegistry::new(zero_busy_config());
   let pool = registry.pool(temp_dir.path().join("never-created.db"));

   // Readers never create the file, so the open fails with cannot-open on
   // every attempt and the exhausted transient error surfaces.
   let err = pool.acquire(false).await.unwrap_err();
   assert!(err.is_transient());
}
