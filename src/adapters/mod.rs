pub mod memory;

#[cfg(feature = "postgres")]
pub mod postgres;

#[cfg(feature = "sqlite")]
pub mod sqlite;

#[cfg(any(feature = "postgres", feature = "sqlite"))]
pub(crate) mod sql;

use std::{future::Future, sync::Arc};

use async_trait::async_trait;
use metrics::counter;
use serde_json::Value;
use tracing::warn;

pub use crate::error::Error;
use crate::{
    model::Model,
    query::{FilterCondition, OrderBy},
    record::Record,
};

/// Arguments of `Adapter::find_many`. An empty `order_by` means primary key
/// ascending; adapters always append the primary key as a tie-breaker.
#[derive(Debug, Clone, Default)]
pub struct FindOptions {
    pub conditions: Vec<FilterCondition>,
    pub order_by: Vec<OrderBy>,
    pub skip: u64,
    pub take: Option<u64>,
}

impl FindOptions {
    pub fn filtered(conditions: Vec<FilterCondition>) -> Self {
        Self {
            conditions,
            ..Default::default()
        }
    }

    pub fn take(mut self, take: u64) -> Self {
        self.take = Some(take);
        self
    }
}

/// -----------------------------
/// Adapter contract
/// -----------------------------
///
/// One implementation per backend. Operator semantics are owned by
/// `FilterEngine::render`; adapters only supply a `PredicateBuilder`.
#[async_trait]
pub trait Adapter: Send + Sync {
    async fn find_many(&self, model: &Model, options: FindOptions) -> Result<Vec<Record>, Error>;

    async fn count(&self, model: &Model, conditions: &[FilterCondition]) -> Result<u64, Error>;

    async fn find_by_key(&self, model: &Model, key: &[Value]) -> Result<Option<Record>, Error>;

    /// Insert a record. The primary key must be present; a duplicate key is a
    /// `Conflict`.
    async fn create(&self, model: &Model, data: Record) -> Result<Record, Error>;

    /// Shallow-merge `data` into the stored record and return the result.
    /// `NotFound` when no record has this key.
    async fn update(&self, model: &Model, key: &[Value], data: Record) -> Result<Record, Error>;

    /// Physical delete. `NotFound` when no record has this key.
    async fn delete(&self, model: &Model, key: &[Value]) -> Result<(), Error>;

    /// Open a transaction. Dropping the handle without `commit` rolls back.
    async fn begin(&self) -> Result<Arc<dyn Transaction>, Error>;

    fn in_transaction(&self) -> bool {
        false
    }
}

#[async_trait]
pub trait Transaction: Adapter {
    async fn commit(&self) -> Result<(), Error>;
    async fn rollback(&self) -> Result<(), Error>;
}

pub(crate) fn storage_key(model: &Model, data: &Record) -> Result<Vec<Value>, Error> {
    crate::record::key_of(data, model.primary_keys()).ok_or_else(|| {
        Error::validation(format!(
            "{} record is missing primary key field(s) {}",
            model.table_name(),
            model.primary_keys().join(", ")
        ))
    })
}

pub(crate) fn transaction_closed() -> Error {
    Error::Storage("transaction already finished".to_string())
}

pub(crate) fn nested_transaction() -> Error {
    Error::Storage("nested transactions are not supported".to_string())
}

/// Run `f` inside one transaction opened on `adapter`, committing when it
/// returns `Ok` and rolling back otherwise. When `adapter` already is a
/// transaction, `f` joins it and the outer caller decides the outcome.
///
/// `f` must issue every storage call through the handle it is given.
pub async fn atomic<T, F, Fut>(adapter: &Arc<dyn Adapter>, f: F) -> Result<T, Error>
where
    F: FnOnce(Arc<dyn Adapter>) -> Fut,
    Fut: Future<Output = Result<T, Error>>,
{
    if adapter.in_transaction() {
        return f(Arc::clone(adapter)).await;
    }

    let tx = adapter.begin().await?;
    let scoped: Arc<dyn Adapter> = tx.clone();
    let result = match f(scoped).await {
        Ok(value) => tx.commit().await.map(|_| value),
        Err(err) => {
            if let Err(rollback) = tx.rollback().await {
                warn!(error = %rollback, "rollback failed, relying on drop");
            }
            Err(err)
        }
    };

    counter!("ousia_rest.transactions.total",
        "status" => if result.is_ok() { "committed" } else { "rolled_back" }
    )
    .increment(1);

    result
}
