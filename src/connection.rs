//! Pooled connection guard tying a live connection to its admitting permit

use std::ops::{Deref, DerefMut};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use sqlx::sqlite::SqliteConnection;
use tokio::sync::OwnedSemaphorePermit;
use tracing::trace;

use crate::cache::{ConnectionCache, ConnectionMode};

/// A live connection admitted by a [`ConnectionPool`](crate::ConnectionPool).
///
/// Holds the semaphore permit that admitted it. On drop the connection is
/// deposited back into the cache (or closed when caching is disabled) and
/// the permit is released — strictly in that order, and exactly once on
/// every exit path including panics and early returns. Ownership makes a
/// double release impossible.
#[must_use = "dropping immediately returns the connection to the pool"]
#[derive(Debug)]
pub struct PooledConnection {
   conn: Option<SqliteConnection>,
   mode: ConnectionMode,
   path: PathBuf,
   cache: Arc<ConnectionCache>,
   _permit: OwnedSemaphorePermit,
}

impl PooledConnection {
   pub(crate) fn new(
      conn: SqliteConnection,
      mode: ConnectionMode,
      path: PathBuf,
      cache: Arc<ConnectionCache>,
      permit: OwnedSemaphorePermit,
   ) -> Self {
      Self {
         conn: Some(conn),
         mode,
         path,
         cache,
         _permit: permit,
      }
   }

   /// Whether this connection was opened read-only.
   pub fn is_read_only(&self) -> bool {
      self.mode == ConnectionMode::Read
   }

   pub fn mode(&self) -> ConnectionMode {
      self.mode
   }

   /// Database file this connection belongs to.
   pub fn path(&self) -> &Path {
      &self.path
   }

   /// Close the connection instead of returning it to the cache.
   ///
   /// For sessions whose state is no longer trustworthy, such as one whose
   /// transaction rollback failed: parking it would hand the next caller a
   /// connection that is still mid-transaction. The permit is released as
   /// usual when the guard drops.
   pub fn discard(mut self) {
      if let Some(conn) = self.conn.take() {
         trace!(path = %self.path.display(), "discarding connection instead of caching");
         drop(conn);
      }
   }
}

impl Deref for PooledConnection {
   type Target = SqliteConnection;

   fn deref(&self) -> &Self::Target {
      self.conn.as_ref().expect("connection present until drop")
   }
}

impl DerefMut for PooledConnection {
   fn deref_mut(&mut self) -> &mut Self::Target {
      self.conn.as_mut().expect("connection present until drop")
   }
}

impl Drop for PooledConnection {
   fn drop(&mut self) {
      if let Some(conn) = self.conn.take()
         && let Some(conn) = self.cache.deposit(&self.path, self.mode, conn)
      {
         // Caching disabled: dropping the connection shuts down its worker
         // and closes the underlying handle.
         trace!(path = %self.path.display(), "closing connection, cache disabled");
         drop(conn);
      }
      // The permit field drops after this body runs, releasing the slot
      // only once the connection has been parked or closed.
   }
}
