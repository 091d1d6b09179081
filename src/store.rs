//! Thin typed store persisting models as keyed, serialized blobs

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use futures::FutureExt;
use futures::future::BoxFuture;
use serde::Serialize;
use serde::de::DeserializeOwned;
use sqlx::Row;
use sqlx::sqlite::SqliteConnection;
use tracing::debug;

use crate::error::{Error, Result};
use crate::executor::execute_with_retry;
use crate::pool::{ConnectionPool, PoolRegistry};
use crate::retry::RetryPolicy;

/// Subdirectory of the application's local storage root holding one database
/// file per logical store.
pub const DATABASE_FOLDER: &str = "sqlite-databases";

/// Sentinel returned by [`ModelStore::save_all`] when the batch transaction
/// was rolled back. Callers must not assume any row of the batch persisted.
pub const SAVE_ALL_ROLLED_BACK: i64 = -1;

/// Path of the database file backing `database_name` under `root`.
pub fn store_path(root: &Path, database_name: &str) -> PathBuf {
   root.join(DATABASE_FOLDER).join(database_name)
}

/// A domain object persisted as a keyed, JSON-encoded blob.
///
/// Each implementing type owns one table of shape
/// `(key TEXT PRIMARY KEY, model BLOB)`.
pub trait StorageModel: Serialize + DeserializeOwned + Send + Sync {
   /// Table backing this model type.
   const TABLE: &'static str;

   /// Primary key for this instance.
   fn key(&self) -> String;
}

/// Typed save/find/delete facade over one database file.
///
/// A thin consumer of the pool: every operation acquires a pooled
/// connection for its duration, and the delete paths run through the
/// retry executor so a momentarily busy engine does not surface to callers.
pub struct ModelStore {
   pool: ConnectionPool,
   retry: RetryPolicy,
   initialized_tables: Mutex<HashSet<&'static str>>,
}

impl ModelStore {
   /// Open the store named `database_name` under `root`, pooled through
   /// `registry`.
   pub fn open(registry: &PoolRegistry, root: &Path, database_name: &str) -> Self {
      Self {
         pool: registry.pool(store_path(root, database_name)),
         retry: RetryPolicy::default(),
         initialized_tables: Mutex::new(HashSet::new()),
      }
   }

   pub fn pool(&self) -> &ConnectionPool {
      &self.pool
   }

   /// Ensure the database file and the model's table exist.
   ///
   /// Idempotent per model type for the lifetime of this store.
   pub async fn initialize_table<M: StorageModel>(&self) -> Result<()> {
      {
         let initialized = self.initialized_tables.lock().expect("initialized set lock poisoned");
         if initialized.contains(M::TABLE) {
            return Ok(());
         }
      }

      self.pool.ensure_created().await?;

      let mut db = self.pool.acquire(true).await?;
      let sql = format!(
         "CREATE TABLE IF NOT EXISTS {} (key TEXT NOT NULL PRIMARY KEY, model BLOB NOT NULL)",
         M::TABLE
      );
      sqlx::query(&sql).execute(&mut *db).await?;

      self
         .initialized_tables
         .lock()
         .expect("initialized set lock poisoned")
         .insert(M::TABLE);
      Ok(())
   }

   /// Insert or replace one model. Returns rows affected.
   pub async fn save<M: StorageModel>(&self, model: &M) -> Result<u64> {
      let blob = serde_json::to_vec(model)?;
      let mut db = self.pool.acquire(true).await?;
      let sql = format!("INSERT OR REPLACE INTO {} (key, model) VALUES (?1, ?2)", M::TABLE);
      let result = sqlx::query(&sql)
         .bind(model.key())
         .bind(blob)
         .execute(&mut *db)
         .await?;
      Ok(result.rows_affected())
   }

   /// Save a batch of models inside a single transaction.
   ///
   /// On any failure mid-batch the whole transaction is rolled back and
   /// [`SAVE_ALL_ROLLED_BACK`] is returned — never a partial count. With
   /// `overwrite_existing` false, a duplicate key is a constraint violation
   /// and rolls the batch back.
   pub async fn save_all<M: StorageModel>(
      &self,
      models: &[M],
      overwrite_existing: bool,
   ) -> Result<i64> {
      let mut db = self.pool.acquire(true).await?;
      let verb = if overwrite_existing { "INSERT OR REPLACE" } else { "INSERT" };
      let sql = format!("{verb} INTO {} (key, model) VALUES (?1, ?2)", M::TABLE);

      sqlx::query("BEGIN IMMEDIATE").execute(&mut *db).await?;
      let failure = match insert_batch(&mut db, &sql, models).await {
         Ok(rows) => match sqlx::query("COMMIT").execute(&mut *db).await {
            Ok(_) => return Ok(rows),
            Err(e) => Error::from(e),
         },
         Err(e) => e,
      };

      // Any failure after BEGIN, the commit included, rolls the whole batch
      // back. A session whose rollback itself fails is still mid-transaction
      // and must never go back to the cache.
      debug!(table = M::TABLE, "batch save failed, rolling back: {}", failure);
      if let Err(rollback_err) = sqlx::query("ROLLBACK").execute(&mut *db).await {
         debug!(
            table = M::TABLE,
            "rollback failed, discarding connection: {}", rollback_err
         );
         db.discard();
      }
      Ok(SAVE_ALL_ROLLED_BACK)
   }

   /// Fetch one model by key.
   pub async fn get<M: StorageModel>(&self, key: &str) -> Result<Option<M>> {
      let mut db = self.pool.acquire(false).await?;
      let sql = format!("SELECT model FROM {} WHERE key = ?1", M::TABLE);
      let row = sqlx::query(&sql).bind(key).fetch_optional(&mut *db).await?;
      match row {
         Some(row) => {
            let blob: Vec<u8> = row.try_get(0)?;
            Ok(Some(serde_json::from_slice(&blob)?))
         }
         None => Ok(None),
      }
   }

   /// Paged scan in key order. `limit <= 0` means unlimited; a negative
   /// `offset` starts at the beginning.
   pub async fn find<M: StorageModel>(&self, offset: i64, limit: i64) -> Result<Vec<M>> {
      let mut db = self.pool.acquire(false).await?;
      let limit = if limit > 0 { limit } else { -1 };
      let offset = offset.max(0);
      let sql = format!("SELECT model FROM {} ORDER BY key LIMIT ?1 OFFSET ?2", M::TABLE);
      let rows = sqlx::query(&sql)
         .bind(limit)
         .bind(offset)
         .fetch_all(&mut *db)
         .await?;

      let mut models = Vec::with_capacity(rows.len());
      for row in rows {
         let blob: Vec<u8> = row.try_get(0)?;
         models.push(serde_json::from_slice(&blob)?);
      }
      Ok(models)
   }

   /// Delete one model. Returns rows affected.
   pub async fn delete<M: StorageModel>(&self, model: &M) -> Result<u64> {
      self.delete_by_key::<M>(&model.key()).await
   }

   /// Delete one row by key, retrying on a momentarily busy engine.
   pub async fn delete_by_key<M: StorageModel>(&self, key: &str) -> Result<u64> {
      let mut db = self.pool.acquire(true).await?;
      let sql = format!("DELETE FROM {} WHERE key = ?1", M::TABLE);
      execute_with_retry(&self.retry, &mut db, move |conn| {
         let sql = sql.clone();
         let key = key.to_string();
         async move {
            let result = sqlx::query(&sql).bind(key).execute(conn).await?;
            Ok(result.rows_affected())
         }
         .boxed()
      })
      .await
   }

   /// Delete every row of the model's table, retrying on a momentarily busy
   /// engine.
   pub async fn delete_all<M: StorageModel>(&self) -> Result<u64> {
      let mut db = self.pool.acquire(true).await?;
      let sql = format!("DELETE FROM {}", M::TABLE);
      execute_with_retry(&self.retry, &mut db, move |conn| {
         let sql = sql.clone();
         async move {
            let result = sqlx::query(&sql).execute(conn).await?;
            Ok(result.rows_affected())
         }
         .boxed()
      })
      .await
   }

   /// Run a caller-supplied unit of work on a pooled connection, with the
   /// store's retry policy applied around the whole unit.
   pub async fn with_retry<T, F>(&self, writable: bool, op: F) -> Result<T>
   where
      F: for<'a> FnMut(&'a mut SqliteConnection) -> BoxFuture<'a, Result<T>>,
   {
      let mut db = self.pool.acquire(writable).await?;
      execute_with_retry(&self.retry, &mut db, op).await
   }
}

async fn insert_batch<M: StorageModel>(
   db: &mut SqliteConnection,
   sql: &str,
   models: &[M],
) -> Result<i64> {
   let mut rows = 0i64;
   for model in models {
      let blob = serde_json::to_vec(model)?;
      let result = sqlx::query(sql)
         .bind(model.key())
         .bind(blob)
         .execute(&mut *db)
         .await?;
      rows += result.rows_affected() as i64;
   }
   Ok(rows)
}
