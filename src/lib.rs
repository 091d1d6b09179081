//! # sqlx-sqlite-model-store
//!
//! Local model storage for mobile and desktop applications over SQLite,
//! built on SQLx but with its own connection policies: the single-writer
//! embedded database file is shared by many concurrent callers, so the
//! crate owns the pooling, reuse, and transient-failure handling instead of
//! leaving them to each call site.
//!
//! ## Core Types
//!
//! - **[`PoolRegistry`] / [`ConnectionPool`]**: per-path gates bounding
//!   concurrent readers (default 64) and writers (default 1) via counting
//!   permits, with process-wide lifecycle hooks (`cancel_all`, `reset`,
//!   `purge_cache`)
//! - **[`PooledConnection`]**: RAII guard that returns its connection to the
//!   cache and releases its permit exactly once, on every exit path
//! - **[`ConnectionCache`]**: idle-connection reuse bucketed by path and
//!   mode, so the database file is not reopened on every call
//! - **[`RetryPolicy`] / [`execute_with_retry`]**: bounded retry with
//!   backoff for known-transient engine conditions (busy, locked,
//!   cannot-open); everything else surfaces unchanged
//! - **[`ModelStore`] / [`StorageModel`]**: thin typed facade persisting
//!   domain models as keyed, JSON-encoded blobs
//!
//! ## Architecture
//!
//! A caller asks a [`ConnectionPool`] for a read or write connection and is
//! parked on that path's permit. On admission the pool withdraws an idle
//! connection from the cache, or opens a new one through the retry policy.
//! When the [`PooledConnection`] drops, the connection is parked back in
//! the cache and the permit is released, unblocking the next waiter.
//! Operations against different database files never contend.

mod cache;
mod config;
mod connection;
mod error;
mod executor;
mod pool;
mod retry;
mod store;

pub use cache::{ConnectionCache, ConnectionMode};
pub use config::PoolConfig;
pub use connection::PooledConnection;
pub use error::{Error, Result, transient_code};
pub use executor::execute_with_retry;
pub use pool::{ConnectionPool, PoolRegistry};
pub use retry::{RetryPolicy, RetryState};
pub use store::{DATABASE_FOLDER, ModelStore, SAVE_ALL_ROLLED_BACK, StorageModel, store_path};
