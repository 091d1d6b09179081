//! Configuration for connection pools and retry behavior

use std::time::Duration;

use crate::retry::RetryPolicy;

/// Settings shared by every pool created from one registry.
///
/// # Examples
///
/// ```
/// use sqlx_sqlite_model_store::PoolConfig;
/// use std::time::Duration;
///
/// // Use defaults
/// let config = PoolConfig::default();
///
/// // Override just one field
/// let config = PoolConfig {
///     max_read_connections: 8,
///     ..Default::default()
/// };
/// ```
#[derive(Debug, Clone)]
pub struct PoolConfig {
   /// Maximum concurrent read connections per database file.
   ///
   /// This bounds how many readers the pool admits before further readers
   /// queue on the read permit.
   ///
   /// Default: 64
   pub max_read_connections: u32,

   /// Maximum concurrent write connections per database file.
   ///
   /// SQLite tolerates a single writer per file; raising this is almost
   /// never the right call.
   ///
   /// Default: 1
   pub max_write_connections: u32,

   /// SQLite busy timeout applied to every opened connection.
   ///
   /// Default: 3 minutes
   pub busy_timeout: Duration,

   /// Retry policy used when opening connections (file-level open can
   /// transiently fail, e.g. the file is briefly locked by another process).
   ///
   /// Default: 3 retries, 500ms base delay, doubling
   pub retry: RetryPolicy,
}

impl Default for PoolConfig {
   fn default() -> Self {
      Self {
         max_read_connections: 64,
         max_write_connections: 1,
         busy_timeout: Duration::from_secs(180),
         retry: RetryPolicy::default(),
      }
   }
}
