/*!
 * # Quantity Store
 *
 * Persists product code -> stock and hands out units of work that lock rows
 * exclusively. Every stock mutation in the service goes through a
 * [`UnitOfWork`]:
 *
 * - `lock_and_read` blocks until no other unit of work holds the row
 * - `write` / `delete` require the row lock held by the same unit
 * - nothing a unit stages is visible to other readers before `commit` returns
 * - dropping a unit without committing rolls it back
 *
 * Two backends are provided: [`DatabaseQuantityStore`] (sea-orm, PostgreSQL or
 * SQLite) and [`InMemoryQuantityStore`].
 */

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use utoipa::ToSchema;

mod database;
mod in_memory;

pub use database::DatabaseQuantityStore;
pub use in_memory::InMemoryQuantityStore;

/// A product's stock as seen by readers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct Product {
    #[schema(example = "SKU-1")]
    pub product_code: String,
    #[schema(example = 10)]
    pub stock: i32,
}

impl Product {
    pub fn new(product_code: impl Into<String>, stock: i32) -> Self {
        Self {
            product_code: product_code.into(),
            stock,
        }
    }
}

/// Row returned by [`UnitOfWork::lock_and_read`]; `stock` is the value as of
/// lock acquisition, including anything already staged by the same unit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LockedRow {
    pub id: i32,
    pub stock: i32,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StoreError {
    /// Lock wait timed out, deadlock detected or the database is locked.
    #[error("row lock unavailable")]
    Busy,

    #[error("product {0} already exists")]
    Conflict(String),

    #[error("row {0} is not locked by this unit of work")]
    NotLocked(String),

    #[error("store unavailable: {0}")]
    Unavailable(String),
}

#[async_trait]
pub trait QuantityStore: Send + Sync {
    /// Opens a unit of work. May wait when the backend serializes writers.
    async fn begin(&self) -> Result<Box<dyn UnitOfWork>, StoreError>;

    /// Committed products ordered by product code.
    async fn list(&self) -> Result<Vec<Product>, StoreError>;

    async fn get(&self, product_code: &str) -> Result<Option<Product>, StoreError>;

    async fn ping(&self) -> Result<(), StoreError>;

    /// Releases the underlying resources. Called once at shutdown.
    async fn close(&self) -> Result<(), StoreError>;

    fn backend_name(&self) -> &'static str;
}

#[async_trait]
pub trait UnitOfWork: Send {
    /// Acquires the exclusive row lock for `product_code` and reads its stock.
    /// Re-locking a row this unit already holds returns immediately.
    async fn lock_and_read(&mut self, product_code: &str) -> Result<Option<LockedRow>, StoreError>;

    async fn write(&mut self, product_code: &str, new_stock: i32) -> Result<(), StoreError>;

    /// Stages a new row. The row is held by this unit until it ends.
    async fn insert(&mut self, product_code: &str, stock: i32) -> Result<Product, StoreError>;

    async fn delete(&mut self, product_code: &str) -> Result<(), StoreError>;

    async fn commit(self: Box<Self>) -> Result<(), StoreError>;

    async fn rollback(self: Box<Self>) -> Result<(), StoreError>;
}
