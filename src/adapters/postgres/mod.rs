mod helper;

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use sqlx::{PgPool, Postgres};
use tokio::sync::Mutex;

use crate::{
    adapters::{Adapter, Error, FindOptions, Transaction, nested_transaction, transaction_closed},
    model::Model,
    query::FilterCondition,
    record::Record,
};

/// PostgreSQL adapter using a unified JSON storage model
///
/// Schema:
/// ```sql
/// CREATE TABLE public.records (
///     model TEXT NOT NULL,
///     key TEXT NOT NULL,
///     data JSONB NOT NULL,
///     created_at TIMESTAMPTZ NOT NULL,
///     updated_at TIMESTAMPTZ NOT NULL,
///     PRIMARY KEY (model, key)
/// );
///
/// -- GIN index for containment lookups on record fields
/// CREATE INDEX idx_records_data ON public.records USING GIN (data jsonb_path_ops);
/// ```
pub struct PostgresAdapter {
    pub(crate) pool: PgPool,
}

impl PostgresAdapter {
    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Initialize the database schema
    pub async fn init_schema(&self) -> Result<(), Error> {
        let mut tx = self
            .pool
            .begin()
            .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS public.records (
                model TEXT NOT NULL,
                key TEXT NOT NULL,
                data JSONB NOT NULL,
                created_at TIMESTAMPTZ NOT NULL,
                updated_at TIMESTAMPTZ NOT NULL,
                PRIMARY KEY (model, key)
            );
            "#,
        )
        .execute(&mut *tx)
        .await?;

        sqlx::query(
            r#"
            CREATE INDEX IF NOT EXISTS idx_records_data
                ON public.records USING GIN (data jsonb_path_ops);
            "#,
        )
        .execute(&mut *tx)
        .await?;

        tx.commit()
            .await?;
        Ok(())
    }

    async fn acquire(&self) -> Result<sqlx::pool::PoolConnection<Postgres>, Error> {
        self.pool
            .acquire()
            .await
            .map_err(Error::from)
    }
}

#[async_trait]
impl Adapter for PostgresAdapter {
    async fn find_many(&self, model: &Model, options: FindOptions) -> Result<Vec<Record>, Error> {
        let mut conn = self.acquire().await?;
        helper::find_many(&mut conn, model, &options).await
    }

    async fn count(&self, model: &Model, conditions: &[FilterCondition]) -> Result<u64, Error> {
        let mut conn = self.acquire().await?;
        helper::count(&mut conn, model, conditions).await
    }

    async fn find_by_key(&self, model: &Model, key: &[Value]) -> Result<Option<Record>, Error> {
        let mut conn = self.acquire().await?;
        helper::find_by_key(&mut conn, model, key, false).await
    }

    async fn create(&self, model: &Model, data: Record) -> Result<Record, Error> {
        let mut conn = self.acquire().await?;
        helper::insert(&mut conn, model, data).await
    }

    async fn update(&self, model: &Model, key: &[Value], data: Record) -> Result<Record, Error> {
        let mut tx = self
            .pool
            .begin()
            .await?;
        let record = helper::update(&mut tx, model, key, data).await?;
        tx.commit()
            .await?;
        Ok(record)
    }

    async fn delete(&self, model: &Model, key: &[Value]) -> Result<(), Error> {
        let mut conn = self.acquire().await?;
        helper::delete(&mut conn, model, key).await
    }

    async fn begin(&self) -> Result<Arc<dyn Transaction>, Error> {
        let tx = self
            .pool
            .begin()
            .await?;
        Ok(Arc::new(PostgresTransaction {
            tx: Mutex::new(Some(tx)),
        }))
    }
}

/// Open Postgres transaction; dropping it unfinished issues a rollback.
pub struct PostgresTransaction {
    tx: Mutex<Option<sqlx::Transaction<'static, Postgres>>>,
}

#[async_trait]
impl Adapter for PostgresTransaction {
    async fn find_many(&self, model: &Model, options: FindOptions) -> Result<Vec<Record>, Error> {
        let mut guard = self.tx.lock().await;
        let tx = guard.as_mut().ok_or_else(transaction_closed)?;
        helper::find_many(tx, model, &options).await
    }

    async fn count(&self, model: &Model, conditions: &[FilterCondition]) -> Result<u64, Error> {
        let mut guard = self.tx.lock().await;
        let tx = guard.as_mut().ok_or_else(transaction_closed)?;
        helper::count(tx, model, conditions).await
    }

    async fn find_by_key(&self, model: &Model, key: &[Value]) -> Result<Option<Record>, Error> {
        let mut guard = self.tx.lock().await;
        let tx = guard.as_mut().ok_or_else(transaction_closed)?;
        helper::find_by_key(tx, model, key, false).await
    }

    async fn create(&self, model: &Model, data: Record) -> Result<Record, Error> {
        let mut guard = self.tx.lock().await;
        let tx = guard.as_mut().ok_or_else(transaction_closed)?;
        helper::insert(tx, model, data).await
    }

    async fn update(&self, model: &Model, key: &[Value], data: Record) -> Result<Record, Error> {
        let mut guard = self.tx.lock().await;
        let tx = guard.as_mut().ok_or_else(transaction_closed)?;
        helper::update(tx, model, key, data).await
    }

    async fn delete(&self, model: &Model, key: &[Value]) -> Result<(), Error> {
        let mut guard = self.tx.lock().await;
        let tx = guard.as_mut().ok_or_else(transaction_closed)?;
        helper::delete(tx, model, key).await
    }

    async fn begin(&self) -> Result<Arc<dyn Transaction>, Error> {
        Err(nested_transaction())
    }

    fn in_transaction(&self) -> bool {
        true
    }
}

#[async_trait]
impl Transaction for PostgresTransaction {
    async fn commit(&self) -> Result<(), Error> {
        let tx = self.tx.lock().await.take().ok_or_else(transaction_closed)?;
        tx.commit()
            .await
            .map_err(Error::from)
    }

    async fn rollback(&self) -> Result<(), Error> {
        let tx = self.tx.lock().await.take().ok_or_else(transaction_closed)?;
        tx.rollback()
            .await
            .map_err(Error::from)
    }
}
