//! Error types and transient-failure classification

use std::path::PathBuf;

use thiserror::Error;

/// A type alias for Results with our Error type
pub type Result<T> = std::result::Result<T, Error>;

const SQLITE_BUSY: i64 = 5;
const SQLITE_LOCKED: i64 = 6;
const SQLITE_CANTOPEN: i64 = 14;
const SQLITE_WARNING: i64 = 28;

/// Errors that may occur when working with pooled stores
#[derive(Error, Debug)]
pub enum Error {
   /// The database file still did not exist after the creation sequence ran.
   #[error("database was not created at {path}")]
   Initialization { path: PathBuf },

   /// Error from the sqlx library. Standard sqlx errors are converted to
   /// this variant; engine result codes stay reachable through it for
   /// transient classification.
   #[error("Sqlx error: {0}")]
   Sqlx(#[from] sqlx::Error),

   /// IO error when accessing database files. Standard library IO errors
   /// are converted to this variant.
   #[error("IO error: {0}")]
   Io(#[from] std::io::Error),

   /// The pool registry has been shut down; outstanding waits are woken with
   /// this and new acquisitions fail fast.
   #[error("connection pool is shut down")]
   PoolClosed,

   /// Model blob could not be encoded or decoded
   #[error("model serialization failed: {0}")]
   Serialization(#[from] serde_json::Error),
}

impl Error {
   /// True when the error is a known-transient engine condition worth
   /// retrying. Everything that is not an engine error with a transient
   /// result code is fatal.
   pub fn is_transient(&self) -> bool {
      match self {
         Error::Sqlx(e) => sqlx_error_code(e).is_some_and(transient_code),
         _ => false,
      }
   }
}

/// Whether a SQLite result code names a transient condition.
///
/// Extended result codes are masked down to their primary code first. The
/// transient set is deliberately conservative: busy, locked, cannot-open,
/// and the advisory warning code. Constraint violations, malformed SQL, and
/// corruption signals are never retried.
pub fn transient_code(code: i64) -> bool {
   matches!(
      code & 0xFF,
      SQLITE_BUSY | SQLITE_LOCKED | SQLITE_CANTOPEN | SQLITE_WARNING
   )
}

fn sqlx_error_code(e: &sqlx::Error) -> Option<i64> {
   e.as_database_error()
      .and_then(|db_err| db_err.code())
      .and_then(|code| code.parse::<i64>().ok())
}
