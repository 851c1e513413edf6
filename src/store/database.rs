use super::{LockedRow, Product, QuantityStore, StoreError, UnitOfWork};
use crate::entities::product::{self, Entity as ProductEntity};
use async_trait::async_trait;
use sea_orm::{
    sea_query::Expr, ActiveModelTrait, ColumnTrait, ConnectionTrait, DatabaseConnection,
    DatabaseTransaction, DbBackend, DbErr, EntityTrait, QueryFilter, QueryOrder, QuerySelect, Set,
    SqlErr, Statement, TransactionTrait,
};
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::{debug, warn};

/// Maps a database error to the store taxonomy. Lock waits, deadlocks and
/// SQLite's busy state surface as `Busy`.
pub(crate) fn classify_db_error(err: &DbErr) -> StoreError {
    let message = err.to_string().to_lowercase();
    let busy_markers = [
        "55p03",
        "lock timeout",
        "lock_timeout",
        "could not obtain lock",
        "deadlock",
        "database is locked",
        "database table is locked",
    ];
    if busy_markers.iter().any(|marker| message.contains(marker)) {
        return StoreError::Busy;
    }
    StoreError::Unavailable(err.to_string())
}

/// sea-orm backed store. PostgreSQL rows are locked with `SELECT ... FOR
/// UPDATE`; SQLite has no row locks, so units of work are serialized through
/// an in-process write gate instead.
#[derive(Clone)]
pub struct DatabaseQuantityStore {
    db: DatabaseConnection,
    lock_timeout: Duration,
    write_gate: Option<Arc<Mutex<()>>>,
}

impl DatabaseQuantityStore {
    pub fn new(db: DatabaseConnection, lock_timeout: Duration) -> Self {
        let write_gate = match db.get_database_backend() {
            DbBackend::Sqlite => Some(Arc::new(Mutex::new(()))),
            _ => None,
        };
        Self {
            db,
            lock_timeout,
            write_gate,
        }
    }

    pub fn connection(&self) -> &DatabaseConnection {
        &self.db
    }
}

#[async_trait]
impl QuantityStore for DatabaseQuantityStore {
    async fn begin(&self) -> Result<Box<dyn UnitOfWork>, StoreError> {
        let gate = match &self.write_gate {
            Some(gate) => Some(gate.clone().lock_owned().await),
            None => None,
        };

        let txn = self
            .db
            .begin()
            .await
            .map_err(|e| classify_db_error(&e))?;

        if txn.get_database_backend() == DbBackend::Postgres {
            let stmt = Statement::from_string(
                DbBackend::Postgres,
                format!("SET LOCAL lock_timeout = '{}ms'", self.lock_timeout.as_millis()),
            );
            txn.execute(stmt).await.map_err(|e| classify_db_error(&e))?;
        }

        Ok(Box::new(DatabaseUnitOfWork {
            txn,
            locked: HashSet::new(),
            _gate: gate,
        }))
    }

    async fn list(&self) -> Result<Vec<Product>, StoreError> {
        let rows = ProductEntity::find()
            .order_by_asc(product::Column::Sku)
            .all(&self.db)
            .await
            .map_err(|e| classify_db_error(&e))?;
        Ok(rows
            .into_iter()
            .map(|row| Product::new(row.sku, row.stock))
            .collect())
    }

    async fn get(&self, product_code: &str) -> Result<Option<Product>, StoreError> {
        let row = ProductEntity::find()
            .filter(product::Column::Sku.eq(product_code))
            .one(&self.db)
            .await
            .map_err(|e| classify_db_error(&e))?;
        Ok(row.map(|row| Product::new(row.sku, row.stock)))
    }

    async fn ping(&self) -> Result<(), StoreError> {
        self.db.ping().await.map_err(|e| classify_db_error(&e))
    }

    async fn close(&self) -> Result<(), StoreError> {
        crate::db::close_pool(self.db.clone())
            .await
            .map_err(|e| classify_db_error(&e))
    }

    fn backend_name(&self) -> &'static str {
        match self.db.get_database_backend() {
            DbBackend::Postgres => "postgres",
            DbBackend::Sqlite => "sqlite",
            _ => "mysql",
        }
    }
}

struct DatabaseUnitOfWork {
    txn: DatabaseTransaction,
    locked: HashSet<String>,
    _gate: Option<OwnedMutexGuard<()>>,
}

impl DatabaseUnitOfWork {
    fn ensure_locked(&self, product_code: &str) -> Result<(), StoreError> {
        if self.locked.contains(product_code) {
            Ok(())
        } else {
            Err(StoreError::NotLocked(product_code.to_string()))
        }
    }
}

#[async_trait]
impl UnitOfWork for DatabaseUnitOfWork {
    async fn lock_and_read(&mut self, product_code: &str) -> Result<Option<LockedRow>, StoreError> {
        // FOR UPDATE on PostgreSQL; sea-query omits the lock clause on SQLite.
        let row = ProductEntity::find()
            .filter(product::Column::Sku.eq(product_code))
            .lock_exclusive()
            .one(&self.txn)
            .await
            .map_err(|e| classify_db_error(&e))?;

        Ok(row.map(|row| {
            self.locked.insert(row.sku.clone());
            LockedRow {
                id: row.id,
                stock: row.stock,
            }
        }))
    }

    async fn write(&mut self, product_code: &str, new_stock: i32) -> Result<(), StoreError> {
        self.ensure_locked(product_code)?;
        ProductEntity::update_many()
            .col_expr(product::Column::Stock, Expr::value(new_stock))
            .filter(product::Column::Sku.eq(product_code))
            .exec(&self.txn)
            .await
            .map_err(|e| classify_db_error(&e))?;
        Ok(())
    }

    async fn insert(&mut self, product_code: &str, stock: i32) -> Result<Product, StoreError> {
        let model = product::ActiveModel {
            sku: Set(product_code.to_string()),
            stock: Set(stock),
            ..Default::default()
        }
        .insert(&self.txn)
        .await
        .map_err(|e| match e.sql_err() {
            Some(SqlErr::UniqueConstraintViolation(_)) => {
                StoreError::Conflict(product_code.to_string())
            }
            _ => classify_db_error(&e),
        })?;

        self.locked.insert(model.sku.clone());
        Ok(Product::new(model.sku, model.stock))
    }

    async fn delete(&mut self, product_code: &str) -> Result<(), StoreError> {
        self.ensure_locked(product_code)?;
        ProductEntity::delete_many()
            .filter(product::Column::Sku.eq(product_code))
            .exec(&self.txn)
            .await
            .map_err(|e| classify_db_error(&e))?;
        self.locked.remove(product_code);
        Ok(())
    }

    async fn commit(self: Box<Self>) -> Result<(), StoreError> {
        let DatabaseUnitOfWork { txn, locked, _gate } = *self;
        debug!(rows = locked.len(), "committing unit of work");
        txn.commit().await.map_err(|e| {
            warn!(error = %e, "commit failed");
            classify_db_error(&e)
        })
    }

    async fn rollback(self: Box<Self>) -> Result<(), StoreError> {
        let DatabaseUnitOfWork { txn, _gate, .. } = *self;
        txn.rollback().await.map_err(|e| classify_db_error(&e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    async fn sqlite_store() -> DatabaseQuantityStore {
        let db = crate::db::establish_connection_with_config(&crate::db::DbConfig::in_memory())
            .await
            .unwrap();
        crate::db::ensure_schema(&db).await.unwrap();
        DatabaseQuantityStore::new(db, Duration::from_millis(500))
    }

    #[test]
    fn lock_errors_classify_as_busy() {
        let err = DbErr::Custom("ERROR: canceling statement due to lock timeout (55P03)".into());
        assert_eq!(classify_db_error(&err), StoreError::Busy);

        let err = DbErr::Custom("database is locked".into());
        assert_eq!(classify_db_error(&err), StoreError::Busy);

        let err = DbErr::Custom("connection refused".into());
        assert_matches!(classify_db_error(&err), StoreError::Unavailable(_));
    }

    #[tokio::test]
    async fn commit_publishes_and_rollback_discards() {
        let store = sqlite_store().await;

        let mut uow = store.begin().await.unwrap();
        uow.insert("A", 10).await.unwrap();
        uow.commit().await.unwrap();

        let mut uow = store.begin().await.unwrap();
        let row = uow.lock_and_read("A").await.unwrap().unwrap();
        uow.write("A", row.stock - 4).await.unwrap();
        uow.rollback().await.unwrap();
        assert_eq!(store.get("A").await.unwrap(), Some(Product::new("A", 10)));

        let mut uow = store.begin().await.unwrap();
        uow.lock_and_read("A").await.unwrap();
        uow.write("A", 6).await.unwrap();
        uow.commit().await.unwrap();
        assert_eq!(store.get("A").await.unwrap(), Some(Product::new("A", 6)));
    }

    #[tokio::test]
    async fn write_requires_the_row_lock() {
        let store = sqlite_store().await;
        let mut uow = store.begin().await.unwrap();
        assert_matches!(uow.write("A", 1).await, Err(StoreError::NotLocked(_)));
    }

    #[tokio::test]
    async fn duplicate_insert_is_a_conflict() {
        let store = sqlite_store().await;
        let mut uow = store.begin().await.unwrap();
        uow.insert("A", 1).await.unwrap();
        assert_matches!(uow.insert("A", 2).await, Err(StoreError::Conflict(code)) if code == "A");
    }

    #[tokio::test]
    async fn list_is_ordered_by_code() {
        let store = sqlite_store().await;
        let mut uow = store.begin().await.unwrap();
        uow.insert("B", 1).await.unwrap();
        uow.insert("A", 2).await.unwrap();
        uow.commit().await.unwrap();

        let products = store.list().await.unwrap();
        assert_eq!(products, vec![Product::new("A", 2), Product::new("B", 1)]);
    }
}
