use crate::{
    auth::AuthUser,
    errors::{DecrementError, StockError},
    notifications::{dispatch_detached, ShipmentNotice, ShipmentNotifier, ShippedItem},
    store::{LockedRow, Product, QuantityStore, UnitOfWork},
};
use metrics::{counter, histogram};
use std::collections::HashSet;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, instrument, warn};

/// One line of a decrement batch
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DecrementRequest {
    pub product_code: String,
    pub quantity: i32,
}

impl DecrementRequest {
    pub fn new(product_code: impl Into<String>, quantity: i32) -> Self {
        Self {
            product_code: product_code.into(),
            quantity,
        }
    }
}

/// Ordered decrement lines plus the identity that submitted them. Built per
/// request and dropped once processed.
#[derive(Debug, Clone)]
pub struct DecrementBatch {
    pub items: Vec<DecrementRequest>,
    pub requester: AuthUser,
    /// Forwarded to the shipping service
    pub bearer_token: String,
    /// Shipment recipient; falls back to the requester's email
    pub recipient_email: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewProduct {
    pub product_code: String,
    pub stock: i32,
}

/// Stock transaction manager. Every stock mutation runs inside one store unit
/// of work with the touched rows locked, and is either applied in full or
/// rolled back.
#[derive(Clone)]
pub struct StockService {
    store: Arc<dyn QuantityStore>,
    notifier: Arc<dyn ShipmentNotifier>,
    lock_timeout: Duration,
}

impl StockService {
    pub fn new(
        store: Arc<dyn QuantityStore>,
        notifier: Arc<dyn ShipmentNotifier>,
        lock_timeout: Duration,
    ) -> Self {
        Self {
            store,
            notifier,
            lock_timeout,
        }
    }

    /// Atomically applies every line of `batch`, or none of them.
    ///
    /// Lines are processed in order. Each row is locked before it is read, so
    /// concurrent batches touching the same product serialize, and a product
    /// listed twice sees the value left by its earlier line. The first
    /// failing line aborts the batch and its error is returned.
    ///
    /// After commit, non-admin requesters get a [`ShipmentNotice`] for the
    /// requested quantities. Delivery runs on a detached task and never
    /// affects the result.
    #[instrument(
        skip(self, batch),
        fields(requester = %batch.requester.subject_id, items = batch.items.len())
    )]
    pub async fn decrement(&self, batch: DecrementBatch) -> Result<Vec<Product>, DecrementError> {
        let started = Instant::now();
        let mut uow = self.begin().await?;

        let result = self.apply_decrements(uow.as_mut(), &batch.items).await;
        let updated = self.finish(uow, result, "decrement").await?;

        histogram!(
            "inventory_stock.decrement.duration_seconds",
            started.elapsed().as_secs_f64()
        );
        info!(products = updated.len(), "stock decrement committed");

        self.notify_shipment(batch);
        Ok(updated)
    }

    async fn apply_decrements(
        &self,
        uow: &mut dyn UnitOfWork,
        items: &[DecrementRequest],
    ) -> Result<Vec<Product>, StockError> {
        let mut updated = Vec::with_capacity(items.len());

        for item in items {
            let row = self
                .lock_row(uow, &item.product_code)
                .await?
                .ok_or_else(|| StockError::NotFound(item.product_code.clone()))?;

            if item.quantity <= 0 {
                return Err(StockError::InvalidQuantity {
                    product_code: item.product_code.clone(),
                    quantity: item.quantity,
                });
            }

            if row.stock < item.quantity {
                return Err(StockError::InsufficientStock {
                    product_code: item.product_code.clone(),
                    requested: item.quantity,
                    available: row.stock,
                });
            }

            let new_stock = row.stock - item.quantity;
            uow.write(&item.product_code, new_stock).await?;
            debug!(product_code = %item.product_code, new_stock, "staged decrement");
            updated.push(Product::new(item.product_code.clone(), new_stock));
        }

        Ok(updated)
    }

    fn notify_shipment(&self, batch: DecrementBatch) {
        if batch.items.is_empty() {
            return;
        }
        if batch.requester.is_admin() {
            debug!("shipment notice suppressed for admin requester");
            return;
        }

        let notice = ShipmentNotice {
            recipient: batch
                .recipient_email
                .unwrap_or_else(|| batch.requester.email.clone()),
            items: batch
                .items
                .into_iter()
                .map(|item| ShippedItem {
                    product_code: item.product_code,
                    quantity: item.quantity,
                })
                .collect(),
        };

        // The handle is intentionally dropped; the response never waits on delivery.
        let _ = dispatch_detached(self.notifier.clone(), batch.bearer_token, notice);
    }

    /// Committed products ordered by product code
    pub async fn list_products(&self) -> Result<Vec<Product>, StockError> {
        Ok(self.store.list().await?)
    }

    pub async fn get_product(&self, product_code: &str) -> Result<Product, StockError> {
        self.store
            .get(product_code)
            .await?
            .ok_or_else(|| StockError::NotFound(product_code.to_string()))
    }

    /// Creates all products or none. Codes must be non-empty and unique both
    /// within the batch and against existing products.
    #[instrument(skip(self, products), fields(count = products.len()))]
    pub async fn create_products(
        &self,
        products: Vec<NewProduct>,
    ) -> Result<Vec<Product>, StockError> {
        let mut seen = HashSet::new();
        for product in &products {
            if product.product_code.trim().is_empty() {
                return Err(StockError::Validation(
                    "productCode must not be empty".to_string(),
                ));
            }
            if product.stock < 0 {
                return Err(StockError::InvalidQuantity {
                    product_code: product.product_code.clone(),
                    quantity: product.stock,
                });
            }
            if !seen.insert(product.product_code.as_str()) {
                return Err(StockError::AlreadyExists(product.product_code.clone()));
            }
        }

        let mut uow = self.begin().await?;
        let result: Result<Vec<Product>, StockError> = async {
            let mut created = Vec::with_capacity(products.len());
            for product in &products {
                if self.lock_row(uow.as_mut(), &product.product_code).await?.is_some() {
                    return Err(StockError::AlreadyExists(product.product_code.clone()));
                }
                created.push(uow.insert(&product.product_code, product.stock).await?);
            }
            Ok(created)
        }
        .await;

        let created = self.finish(uow, result, "create").await?;
        info!(count = created.len(), "products created");
        Ok(created)
    }

    /// Deletes all listed products or none; returns one message per product.
    #[instrument(skip(self, product_codes), fields(count = product_codes.len()))]
    pub async fn delete_products(
        &self,
        product_codes: Vec<String>,
    ) -> Result<Vec<String>, StockError> {
        let mut uow = self.begin().await?;
        let result: Result<Vec<String>, StockError> = async {
            let mut messages = Vec::with_capacity(product_codes.len());
            for code in &product_codes {
                if self.lock_row(uow.as_mut(), code).await?.is_none() {
                    return Err(StockError::NotFound(code.clone()));
                }
                uow.delete(code).await?;
                messages.push(format!("Product {} has been deleted", code));
            }
            Ok(messages)
        }
        .await;

        let messages = self.finish(uow, result, "delete").await?;
        info!(count = messages.len(), "products deleted");
        Ok(messages)
    }

    /// Adds `quantity` to the stock of one product under its row lock.
    #[instrument(skip(self))]
    pub async fn increase_stock(
        &self,
        product_code: &str,
        quantity: i32,
    ) -> Result<Product, StockError> {
        let mut uow = self.begin().await?;
        let result: Result<Product, StockError> = async {
            let row = self
                .lock_row(uow.as_mut(), product_code)
                .await?
                .ok_or_else(|| StockError::NotFound(product_code.to_string()))?;

            let invalid = || StockError::InvalidQuantity {
                product_code: product_code.to_string(),
                quantity,
            };
            if quantity <= 0 {
                return Err(invalid());
            }
            let new_stock = row.stock.checked_add(quantity).ok_or_else(invalid)?;

            uow.write(product_code, new_stock).await?;
            Ok(Product::new(product_code, new_stock))
        }
        .await;

        self.finish(uow, result, "increase").await
    }

    async fn begin(&self) -> Result<Box<dyn UnitOfWork>, StockError> {
        match tokio::time::timeout(self.lock_timeout, self.store.begin()).await {
            Ok(result) => Ok(result?),
            Err(_) => {
                warn!(timeout_ms = self.lock_timeout.as_millis() as u64, "timed out opening unit of work");
                counter!("inventory_stock.busy", 1);
                Err(StockError::Busy)
            }
        }
    }

    async fn lock_row(
        &self,
        uow: &mut dyn UnitOfWork,
        product_code: &str,
    ) -> Result<Option<LockedRow>, StockError> {
        match tokio::time::timeout(self.lock_timeout, uow.lock_and_read(product_code)).await {
            Ok(result) => Ok(result?),
            Err(_) => {
                warn!(%product_code, timeout_ms = self.lock_timeout.as_millis() as u64, "timed out waiting for row lock");
                counter!("inventory_stock.busy", 1);
                Err(StockError::Busy)
            }
        }
    }

    /// Commits on success, rolls back on failure. A failed rollback is only
    /// logged; the original error is returned.
    async fn finish<T>(
        &self,
        uow: Box<dyn UnitOfWork>,
        result: Result<T, StockError>,
        operation: &'static str,
    ) -> Result<T, StockError> {
        match result {
            Ok(value) => {
                if let Err(e) = uow.commit().await {
                    counter!("inventory_stock.rolled_back", 1, "operation" => operation);
                    error!(operation, error = %e, "commit failed");
                    return Err(e.into());
                }
                counter!("inventory_stock.committed", 1, "operation" => operation);
                Ok(value)
            }
            Err(err) => {
                counter!("inventory_stock.rolled_back", 1, "operation" => operation);
                info!(operation, error = %err, "unit of work rolled back");
                if let Err(rollback_err) = uow.rollback().await {
                    error!(operation, error = %rollback_err, "rollback failed");
                }
                Err(err)
            }
        }
    }
}
