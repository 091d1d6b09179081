//! Per-path connection pools with bounded readers and a single writer

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use sqlx::ConnectOptions;
use sqlx::sqlite::{SqliteConnectOptions, SqliteConnection};
use tokio::sync::Semaphore;
use tracing::{debug, info, warn};

use crate::cache::{ConnectionCache, ConnectionMode};
use crate::config::PoolConfig;
use crate::connection::PooledConnection;
use crate::error::{Error, Result};

/// The permit pair gating one database file.
#[derive(Debug, Clone)]
struct PathPermits {
   read: Arc<Semaphore>,
   write: Arc<Semaphore>,
}

#[derive(Debug)]
struct RegistryShared {
   config: PoolConfig,
   permits: Mutex<HashMap<PathBuf, PathPermits>>,
   cache: Arc<ConnectionCache>,
   shut_down: AtomicBool,
}

/// Registry owning the per-path permit maps and the connection cache.
///
/// Construct one per process (or per test) and pass it wherever pools are
/// made; there are no hidden globals. Cloning is cheap and every clone
/// shares the same state, so two pools for the same file always coordinate
/// through the same permits.
///
/// Lifecycle hooks: [`cancel_all`](Self::cancel_all) at process shutdown,
/// [`reset`](Self::reset) between test runs, and
/// [`purge_cache`](Self::purge_cache) to close idle connections.
#[derive(Debug, Clone)]
pub struct PoolRegistry {
   shared: Arc<RegistryShared>,
}

impl Default for PoolRegistry {
   fn default() -> Self {
      Self::new(PoolConfig::default())
   }
}

impl PoolRegistry {
   pub fn new(config: PoolConfig) -> Self {
      Self {
         shared: Arc::new(RegistryShared {
            config,
            permits: Mutex::new(HashMap::new()),
            cache: Arc::new(ConnectionCache::new()),
            shut_down: AtomicBool::new(false),
         }),
      }
   }

   /// Pool handle for `path`.
   ///
   /// The first call for a path installs its read/write permit pair; every
   /// later call — from any clone of the registry — reuses the same
   /// permits.
   pub fn pool(&self, path: impl Into<PathBuf>) -> ConnectionPool {
      let path = path.into();
      let permits = {
         let mut map = self.shared.permits.lock().expect("permit map lock poisoned");
         map.entry(path.clone())
            .or_insert_with(|| {
               let permits = PathPermits {
                  read: Arc::new(Semaphore::new(
                     self.shared.config.max_read_connections as usize,
                  )),
                  write: Arc::new(Semaphore::new(
                     self.shared.config.max_write_connections as usize,
                  )),
               };
               // Permits installed after shutdown start closed, so late
               // acquisitions fail fast instead of hanging.
               if self.shared.shut_down.load(Ordering::SeqCst) {
                  permits.read.close();
                  permits.write.close();
               }
               permits
            })
            .clone()
      };

      ConnectionPool {
         path,
         permits,
         shared: Arc::clone(&self.shared),
      }
   }

   /// Cancel all outstanding and future acquisitions across every pool.
   ///
   /// In-flight waiters wake with [`Error::PoolClosed`]; new acquisitions
   /// fail fast. Intended for process shutdown.
   pub fn cancel_all(&self) {
      info!("cancelling all pool acquisitions");
      self.shared.shut_down.store(true, Ordering::SeqCst);

      let map = self.shared.permits.lock().expect("permit map lock poisoned");
      for permits in map.values() {
         permits.read.close();
         permits.write.close();
      }
   }

   /// Discard all permit state so pools created afterwards start fresh.
   ///
   /// Pools created before the reset keep their old (possibly closed)
   /// permits; only future pools are affected. Intended for test teardown.
   pub fn reset(&self) {
      self.shared.permits.lock().expect("permit map lock poisoned").clear();
      self.shared.shut_down.store(false, Ordering::SeqCst);
   }

   /// Close every idle cached connection across every path and mode.
   pub async fn purge_cache(&self) {
      self.shared.cache.purge_all().await;
   }

   /// Globally enable or disable connection caching.
   pub fn set_cache_enabled(&self, enabled: bool) {
      self.shared.cache.set_enabled(enabled);
   }

   pub fn is_shut_down(&self) -> bool {
      self.shared.shut_down.load(Ordering::SeqCst)
   }

   /// Idle cached connections for `(path, mode)`. Diagnostic.
   pub fn cached_connections(&self, path: &Path, mode: ConnectionMode) -> usize {
      self.shared.cache.bucket_len(path, mode)
   }
}

/// Bounded gate for one database file: N concurrent readers, one writer.
///
/// Cheap to clone; clones (and any other pool for the same path from the
/// same registry) share the same permits and cache.
#[derive(Debug, Clone)]
pub struct ConnectionPool {
   path: PathBuf,
   permits: PathPermits,
   shared: Arc<RegistryShared>,
}

impl ConnectionPool {
   pub fn path(&self) -> &Path {
      &self.path
   }

   /// Acquire a connection, waiting for a free reader or writer slot.
   ///
   /// This is the primary suspension point of the subsystem: the caller is
   /// parked on the mode's semaphore until admitted. Dropping the returned
   /// future (e.g. from a caller-side `select!` or `timeout`) cancels the
   /// wait without leaking a permit. After admission the cache is tried
   /// first; on a miss a new connection is opened through the retry policy,
   /// since a file-level open can transiently fail.
   pub async fn acquire(&self, writable: bool) -> Result<PooledConnection> {
      if self.shared.shut_down.load(Ordering::SeqCst) {
         return Err(Error::PoolClosed);
      }

      let mode = if writable { ConnectionMode::Write } else { ConnectionMode::Read };
      let semaphore = match mode {
         ConnectionMode::Read => &self.permits.read,
         ConnectionMode::Write => &self.permits.write,
      };

      let started = Instant::now();
      let permit = Arc::clone(semaphore)
         .acquire_owned()
         .await
         .map_err(|_| Error::PoolClosed)?;
      log_wait(mode, started.elapsed());

      if let Some(conn) = self.shared.cache.withdraw(&self.path, mode) {
         return Ok(PooledConnection::new(
            conn,
            mode,
            self.path.clone(),
            Arc::clone(&self.shared.cache),
            permit,
         ));
      }

      // A shut-down registry reuses nothing and opens nothing.
      if self.shared.shut_down.load(Ordering::SeqCst) {
         return Err(Error::PoolClosed);
      }

      let conn = self
         .shared
         .config
         .retry
         .run(|| self.open_connection(mode), Error::is_transient)
         .await?;

      Ok(PooledConnection::new(
         conn,
         mode,
         self.path.clone(),
         Arc::clone(&self.shared.cache),
         permit,
      ))
   }

   /// Create the database file with WAL journaling and foreign-key
   /// enforcement.
   ///
   /// Idempotent: returns immediately when the file already exists. The
   /// write permit serializes the first-writer pragma setup.
   pub async fn ensure_created(&self) -> Result<()> {
      if self.path.exists() {
         return Ok(());
      }

      if let Some(parent) = self.path.parent()
         && !parent.as_os_str().is_empty()
      {
         tokio::fs::create_dir_all(parent).await?;
      }

      {
         let mut db = self.acquire(true).await?;

         let journal_mode: String = sqlx::query_scalar("PRAGMA journal_mode;")
            .fetch_one(&mut *db)
            .await?;
         if !journal_mode.eq_ignore_ascii_case("wal") {
            // WAL keeps readers from blocking the writer and vice versa,
            // which is what makes the bounded-parallel read gate useful.
            let _: String = sqlx::query_scalar("PRAGMA journal_mode=WAL;")
               .fetch_one(&mut *db)
               .await?;
         }

         sqlx::query("PRAGMA foreign_keys=ON;").execute(&mut *db).await?;
      }

      if !self.path.exists() {
         return Err(Error::Initialization {
            path: self.path.clone(),
         });
      }
      Ok(())
   }

   /// Delete the underlying database file. Controlled teardown only.
   pub async fn drop_database(&self) -> Result<()> {
      debug!(path = %self.path.display(), "dropping database file");
      tokio::fs::remove_file(&self.path).await?;
      Ok(())
   }

   /// Free reader slots right now. Diagnostic.
   pub fn available_read_permits(&self) -> usize {
      self.permits.read.available_permits()
   }

   /// Free writer slots right now. Diagnostic.
   pub fn available_write_permits(&self) -> usize {
      self.permits.write.available_permits()
   }

   async fn open_connection(&self, mode: ConnectionMode) -> Result<SqliteConnection> {
      let options = SqliteConnectOptions::new()
         .filename(&self.path)
         .read_only(mode == ConnectionMode::Read)
         .create_if_missing(mode == ConnectionMode::Write)
         .busy_timeout(self.shared.config.busy_timeout)
         .foreign_keys(true);

      debug!(path = %self.path.display(), ?mode, "opening new connection");
      Ok(options.connect().await?)
   }
}

fn log_wait(mode: ConnectionMode, waited: Duration) {
   let ms = waited.as_millis() as u64;
   if ms > 1000 {
      warn!(?mode, waited_ms = ms, "pool permit wait");
   } else if ms > 100 {
      info!(?mode, waited_ms = ms, "pool permit wait");
   } else if ms > 10 {
      debug!(?mode, waited_ms = ms, "pool permit wait");
   }
}
