//! Reuse pool for idle SQLite connections, bucketed by path and mode

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};

use sqlx::Connection;
use sqlx::sqlite::SqliteConnection;
use tracing::{debug, trace};

/// Read or write flavor of a pooled connection.
///
/// Cache buckets and permit gates are partitioned by this: a connection
/// opened read-only is never handed to a writer and vice versa.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnectionMode {
   Read,
   Write,
}

/// Read and write buckets for one database path. Keying by path alone lets
/// lookups borrow a `&Path` instead of allocating a key per call.
#[derive(Debug, Default)]
struct ModeBuckets {
   read: Vec<SqliteConnection>,
   write: Vec<SqliteConnection>,
}

impl ModeBuckets {
   fn bucket(&self, mode: ConnectionMode) -> &Vec<SqliteConnection> {
      match mode {
         ConnectionMode::Read => &self.read,
         ConnectionMode::Write => &self.write,
      }
   }

   fn bucket_mut(&mut self, mode: ConnectionMode) -> &mut Vec<SqliteConnection> {
      match mode {
         ConnectionMode::Read => &mut self.read,
         ConnectionMode::Write => &mut self.write,
      }
   }
}

/// Idle, previously-opened connections ready for reuse, avoiding the cost of
/// reopening the database file on every call.
///
/// Buckets live behind a plain mutex held only for the push/pop itself,
/// never across an engine call. A withdrawn entry is removed before the lock
/// is released, so no two callers can ever hold the same connection.
#[derive(Debug)]
pub struct ConnectionCache {
   enabled: AtomicBool,
   buckets: Mutex<HashMap<PathBuf, ModeBuckets>>,
}

impl Default for ConnectionCache {
   fn default() -> Self {
      Self::new()
   }
}

impl ConnectionCache {
   /// New cache with caching enabled.
   pub fn new() -> Self {
      Self {
         enabled: AtomicBool::new(true),
         buckets: Mutex::new(HashMap::new()),
      }
   }

   /// Globally enable or disable caching. Disabling does not purge existing
   /// entries; pair with [`purge_all`](Self::purge_all) when tearing down.
   pub fn set_enabled(&self, enabled: bool) {
      self.enabled.store(enabled, Ordering::SeqCst);
   }

   pub fn is_enabled(&self) -> bool {
      self.enabled.load(Ordering::SeqCst)
   }

   /// Park an idle connection for reuse by any future withdrawer of the
   /// same `(path, mode)`.
   ///
   /// When caching is disabled the connection is handed back and the caller
   /// must close it (dropping a `SqliteConnection` shuts it down).
   pub fn deposit(
      &self,
      path: &Path,
      mode: ConnectionMode,
      conn: SqliteConnection,
   ) -> Option<SqliteConnection> {
      if !self.is_enabled() {
         return Some(conn);
      }

      let mut buckets = self.buckets.lock().expect("connection cache lock poisoned");
      if !buckets.contains_key(path) {
         buckets.insert(path.to_path_buf(), ModeBuckets::default());
      }
      let bucket = buckets
         .get_mut(path)
         .expect("entry present after insert")
         .bucket_mut(mode);
      bucket.push(conn);
      trace!(path = %path.display(), ?mode, cached = bucket.len(), "connection cached");
      None
   }

   /// Atomically remove and return one idle connection for `(path, mode)`.
   ///
   /// No ordering guarantee among equivalent idle connections. `None` is not
   /// an error; it means the caller must open a new connection.
   pub fn withdraw(&self, path: &Path, mode: ConnectionMode) -> Option<SqliteConnection> {
      if !self.is_enabled() {
         return None;
      }

      let mut buckets = self.buckets.lock().expect("connection cache lock poisoned");
      let conn = buckets.get_mut(path)?.bucket_mut(mode).pop();
      if conn.is_some() {
         trace!(path = %path.display(), ?mode, "cached connection withdrawn");
      }
      conn
   }

   /// Remove and close every cached connection across all paths and modes.
   ///
   /// Entries are drained out of the map before any close runs, so a racing
   /// deposit or withdraw can never observe a half-closed connection and
   /// nothing is double-closed or leaked.
   pub async fn purge_all(&self) {
      let drained: Vec<SqliteConnection> = {
         let mut buckets = self.buckets.lock().expect("connection cache lock poisoned");
         buckets
            .drain()
            .flat_map(|(_, b)| b.read.into_iter().chain(b.write))
            .collect()
      };

      if drained.is_empty() {
         return;
      }

      debug!(count = drained.len(), "purging cached connections");
      for conn in drained {
         if let Err(e) = conn.close().await {
            debug!("error closing cached connection: {}", e);
         }
      }
   }

   /// Number of idle connections currently cached for `(path, mode)`.
   pub fn bucket_len(&self, path: &Path, mode: ConnectionMode) -> usize {
      let buckets = self.buckets.lock().expect("connection cache lock poisoned");
      buckets.get(path).map_or(0, |b| b.bucket(mode).len())
   }
}
