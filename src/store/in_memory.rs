use super::{LockedRow, Product, QuantityStore, StoreError, UnitOfWork};
use async_trait::async_trait;
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex as StdMutex, MutexGuard};
use tokio::sync::{Mutex, OwnedMutexGuard};

struct Row {
    id: i32,
    stock: i32,
    lock: Arc<Mutex<()>>,
}

#[derive(Default)]
struct Inner {
    rows: BTreeMap<String, Row>,
    next_id: i32,
}

fn lock_state(state: &StdMutex<Inner>) -> Result<MutexGuard<'_, Inner>, StoreError> {
    state
        .lock()
        .map_err(|_| StoreError::Unavailable("in-memory store poisoned".to_string()))
}

/// Process-local store. Each row carries its own async mutex; units of work
/// hold the owned guards until they commit or are dropped.
#[derive(Clone, Default)]
pub struct InMemoryQuantityStore {
    state: Arc<StdMutex<Inner>>,
}

impl InMemoryQuantityStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store pre-populated with committed rows.
    pub fn with_products<I, S>(products: I) -> Self
    where
        I: IntoIterator<Item = (S, i32)>,
        S: Into<String>,
    {
        let mut inner = Inner::default();
        for (code, stock) in products {
            inner.next_id += 1;
            inner.rows.insert(
                code.into(),
                Row {
                    id: inner.next_id,
                    stock,
                    lock: Arc::new(Mutex::new(())),
                },
            );
        }
        Self {
            state: Arc::new(StdMutex::new(inner)),
        }
    }
}

#[async_trait]
impl QuantityStore for InMemoryQuantityStore {
    async fn begin(&self) -> Result<Box<dyn UnitOfWork>, StoreError> {
        Ok(Box::new(InMemoryUnitOfWork {
            state: self.state.clone(),
            held: HashMap::new(),
        }))
    }

    async fn list(&self) -> Result<Vec<Product>, StoreError> {
        let inner = lock_state(&self.state)?;
        Ok(inner
            .rows
            .iter()
            .map(|(code, row)| Product::new(code.clone(), row.stock))
            .collect())
    }

    async fn get(&self, product_code: &str) -> Result<Option<Product>, StoreError> {
        let inner = lock_state(&self.state)?;
        Ok(inner
            .rows
            .get(product_code)
            .map(|row| Product::new(product_code, row.stock)))
    }

    async fn ping(&self) -> Result<(), StoreError> {
        lock_state(&self.state).map(|_| ())
    }

    async fn close(&self) -> Result<(), StoreError> {
        Ok(())
    }

    fn backend_name(&self) -> &'static str {
        "in-memory"
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Change {
    Unchanged,
    Written,
    Deleted,
    Inserted,
}

struct Held {
    id: i32,
    stock: i32,
    change: Change,
    lock: Arc<Mutex<()>>,
    _guard: OwnedMutexGuard<()>,
}

struct InMemoryUnitOfWork {
    state: Arc<StdMutex<Inner>>,
    held: HashMap<String, Held>,
}

#[async_trait]
impl UnitOfWork for InMemoryUnitOfWork {
    async fn lock_and_read(&mut self, product_code: &str) -> Result<Option<LockedRow>, StoreError> {
        if let Some(held) = self.held.get(product_code) {
            return Ok(match held.change {
                Change::Deleted => None,
                _ => Some(LockedRow {
                    id: held.id,
                    stock: held.stock,
                }),
            });
        }

        let lock = {
            let inner = lock_state(&self.state)?;
            match inner.rows.get(product_code) {
                Some(row) => row.lock.clone(),
                None => return Ok(None),
            }
        };

        let guard = lock.clone().lock_owned().await;

        // The row may have been deleted (or deleted and re-created) while we waited.
        let current = {
            let inner = lock_state(&self.state)?;
            inner
                .rows
                .get(product_code)
                .filter(|row| Arc::ptr_eq(&row.lock, &lock))
                .map(|row| (row.id, row.stock))
        };

        Ok(current.map(|(id, stock)| {
            self.held.insert(
                product_code.to_string(),
                Held {
                    id,
                    stock,
                    change: Change::Unchanged,
                    lock,
                    _guard: guard,
                },
            );
            LockedRow { id, stock }
        }))
    }

    async fn write(&mut self, product_code: &str, new_stock: i32) -> Result<(), StoreError> {
        match self.held.get_mut(product_code) {
            Some(held) if held.change != Change::Deleted => {
                held.stock = new_stock;
                if held.change == Change::Unchanged {
                    held.change = Change::Written;
                }
                Ok(())
            }
            _ => Err(StoreError::NotLocked(product_code.to_string())),
        }
    }

    async fn insert(&mut self, product_code: &str, stock: i32) -> Result<Product, StoreError> {
        if self.held.contains_key(product_code)
            || lock_state(&self.state)?.rows.contains_key(product_code)
        {
            return Err(StoreError::Conflict(product_code.to_string()));
        }

        let lock = Arc::new(Mutex::new(()));
        let guard = lock
            .clone()
            .try_lock_owned()
            .map_err(|_| StoreError::Unavailable("fresh row lock contended".to_string()))?;

        self.held.insert(
            product_code.to_string(),
            Held {
                id: 0,
                stock,
                change: Change::Inserted,
                lock,
                _guard: guard,
            },
        );
        Ok(Product::new(product_code, stock))
    }

    async fn delete(&mut self, product_code: &str) -> Result<(), StoreError> {
        match self.held.get(product_code).map(|held| held.change) {
            Some(Change::Inserted) => {
                self.held.remove(product_code);
                Ok(())
            }
            Some(Change::Deleted) | None => Err(StoreError::NotLocked(product_code.to_string())),
            Some(_) => {
                if let Some(held) = self.held.get_mut(product_code) {
                    held.change = Change::Deleted;
                }
                Ok(())
            }
        }
    }

    async fn commit(self: Box<Self>) -> Result<(), StoreError> {
        let this = *self;
        let mut inner = lock_state(&this.state)?;

        // Concurrent inserts of the same code are only detected here.
        if let Some((code, _)) = this
            .held
            .iter()
            .find(|(code, held)| held.change == Change::Inserted && inner.rows.contains_key(*code))
        {
            return Err(StoreError::Conflict(code.clone()));
        }

        for (code, held) in &this.held {
            match held.change {
                Change::Unchanged => {}
                Change::Written => {
                    if let Some(row) = inner.rows.get_mut(code) {
                        row.stock = held.stock;
                    }
                }
                Change::Deleted => {
                    inner.rows.remove(code);
                }
                Change::Inserted => {
                    inner.next_id += 1;
                    let id = inner.next_id;
                    inner.rows.insert(
                        code.clone(),
                        Row {
                            id,
                            stock: held.stock,
                            lock: held.lock.clone(),
                        },
                    );
                }
            }
        }

        drop(inner);
        // Row guards are released here, after the new values are published.
        drop(this.held);
        Ok(())
    }

    async fn rollback(self: Box<Self>) -> Result<(), StoreError> {
        Ok(())
    }
}
