//! # Ousia REST
//!
//! A storage-agnostic query and mutation engine that sits between REST
//! handlers and a pluggable storage backend. Models are described once,
//! declaratively; the engine turns query parameters and request bodies into
//! backend-neutral operations with the same semantics on every adapter.
//!
//! ## What's inside
//!
//! ### Filters
//! `filter[field][op]=value` parameters are parsed against a per-endpoint
//! allow-list into typed conditions, then rendered by each adapter through a
//! `PredicateBuilder`. Null handling is three-valued everywhere.
//!
//! ### Relations
//! `include=posts,profile` attaches related records with one fetch per
//! relation, whatever the page size.
//!
//! ### Nested writes
//! A single create or update may carry `create`, `update`, `delete`,
//! `connect` and `disconnect` operations on child relations. Everything runs
//! in one transaction and nothing is written unless every operation is
//! allowed.
//!
//! ```rust,ignore
//! let body = json!({
//!     "name": "Ada",
//!     "posts": [{ "title": "Notes on the engine" }]
//! });
//! let created = engine.create(&users, &ctx, body.as_object().cloned().unwrap()).await?;
//! ```
//!
//! ### Policies
//! Soft delete and multi-tenancy are declared on the model and rewrite every
//! read and write that touches it, including relation fetches and nested
//! children.
//!
//! ### Batch upsert
//! Items are matched on a configurable key tuple, then created or updated in
//! input order, either all-or-nothing or item by item.
//!
//! ## Quick start
//!
//! ```rust,ignore
//! use ousia_rest::{Engine, adapters::sqlite::SqliteAdapter};
//!
//! let adapter = SqliteAdapter::new_memory().await?;
//! adapter.init_schema().await?;
//!
//! let engine = Engine::new(Arc::new(adapter), registry);
//! let page = engine.list(&users, &ctx, &params).await?;
//! ```
//!
//! ## Feature flags
//!
//! | Flag       | Default | Description                        |
//! |------------|---------|------------------------------------|
//! | `postgres` | ✓       | PostgreSQL adapter via sqlx        |
//! | `sqlite`   | ✓       | SQLite adapter (in-memory or file) |
//!
//! The in-memory adapter is always available.

pub mod adapters;
pub mod context;
pub mod endpoint;
pub mod error;
pub mod model;
pub mod query;
pub mod record;
pub mod resolver;
pub mod response;
pub mod scope;
pub mod upsert;

mod nested;

use std::{future::Future, sync::Arc, time::Instant};

use metrics::histogram;
use serde_json::Value;

pub use crate::adapters::{Adapter, FindOptions, Transaction, atomic};
pub use crate::context::RequestContext;
pub use crate::endpoint::{EndpointConfig, ListQuery, ReadOptions, UpsertConfig};
pub use crate::error::Error;
pub use crate::model::*;
pub use crate::query::{
    Direction, FilterCondition, FilterConfig, FilterEngine, Operator, OrderBy, QueryParams,
};
pub use crate::record::{KeyTuple, Record};
pub use crate::response::{ListResponse, ReadResponse, ResultInfo, WriteResponse};
pub use crate::scope::{DeletedScope, Scope};
pub use crate::upsert::{ItemError, UpsertItem, UpsertResult};

use crate::{nested::NestedWrite, resolver::resolve_includes, upsert::Upsert};

/// The Engine is the entry point for every REST operation. It owns the
/// adapter and the model registry and is cheap to clone.
#[derive(Clone)]
pub struct Engine {
    inner: Arc<Ousia>,
}

pub struct Ousia {
    adapter: Arc<dyn Adapter>,
    registry: Arc<Registry>,
}

impl Engine {
    pub fn new(adapter: Arc<dyn Adapter>, registry: Arc<Registry>) -> Self {
        Self {
            inner: Arc::new(Ousia { adapter, registry }),
        }
    }

    pub fn registry(&self) -> &Registry {
        &self.inner.registry
    }

    pub fn adapter(&self) -> &Arc<dyn Adapter> {
        &self.inner.adapter
    }

    fn model(&self, endpoint: &EndpointConfig) -> Result<Arc<Model>, Error> {
        self.inner.registry.get(&endpoint.model)
    }

    // ==================== Reads ====================

    /// Paginated, filtered, ordered list with optional relations.
    pub async fn list(
        &self,
        endpoint: &EndpointConfig,
        ctx: &RequestContext,
        params: &QueryParams,
    ) -> Result<ListResponse, Error> {
        let model = self.model(endpoint)?;
        let query = endpoint.parse_list_query(&model, params)?;
        self.list_with(endpoint, ctx, query).await
    }

    /// List with an already built query, e.g. conditions produced outside
    /// the query string. The conditions still go through the endpoint's
    /// allow-list.
    pub async fn list_with(
        &self,
        endpoint: &EndpointConfig,
        ctx: &RequestContext,
        query: ListQuery,
    ) -> Result<ListResponse, Error> {
        let start = Instant::now();
        let model = self.model(endpoint)?;
        FilterEngine::check(&query.conditions, &endpoint.filters)?;
        endpoint.check_includes(&model, &query.include)?;

        let page = query.page.max(1);
        let per_page = query.per_page.min(endpoint.max_per_page).max(1);
        let scope = Scope::new(&model, ctx, query.deleted)?;
        let conditions = scope.restrict(query.conditions);
        let adapter = &*self.inner.adapter;

        let total_count = adapter.count(&model, &conditions).await?;
        let options = FindOptions {
            conditions,
            order_by: query.order_by.into_iter().collect(),
            skip: (page - 1).saturating_mul(per_page),
            take: Some(per_page),
        };
        let mut records = adapter.find_many(&model, options).await?;
        for record in records.iter_mut() {
            model.apply_computed(record);
        }
        resolve_includes(
            adapter,
            &self.inner.registry,
            &model,
            &mut records,
            &query.include,
            ctx,
            query.deleted,
        )
        .await?;

        histogram!("ousia_rest.list.duration_ms", "model" => model.table_name().to_string())
            .record(start.elapsed().as_millis() as f64);

        Ok(ListResponse {
            result: records,
            result_info: ResultInfo::new(page, per_page, total_count),
        })
    }

    /// Read one record by primary key. Key parts given as strings are coerced
    /// to the declared key kinds.
    pub async fn read(
        &self,
        endpoint: &EndpointConfig,
        ctx: &RequestContext,
        key: Vec<Value>,
        params: &QueryParams,
    ) -> Result<ReadResponse, Error> {
        let model = self.model(endpoint)?;
        let options = endpoint.parse_read_options(&model, params)?;
        let key = model.key(key)?;
        let scope = Scope::new(&model, ctx, options.deleted)?;
        let adapter = &*self.inner.adapter;

        let mut record = scope.fetch_required(adapter, &key).await?;
        model.apply_computed(&mut record);
        let mut records = [record];
        resolve_includes(
            adapter,
            &self.inner.registry,
            &model,
            &mut records,
            &options.include,
            ctx,
            options.deleted,
        )
        .await?;
        let [result] = records;
        Ok(ReadResponse { result })
    }

    // ==================== Writes ====================

    /// Create a record, together with any nested relation writes in `body`.
    pub async fn create(
        &self,
        endpoint: &EndpointConfig,
        ctx: &RequestContext,
        body: Record,
    ) -> Result<WriteResponse, Error> {
        self.write(endpoint, ctx, None, body).await
    }

    /// Partially update a record, together with any nested relation writes
    /// in `body`.
    pub async fn update(
        &self,
        endpoint: &EndpointConfig,
        ctx: &RequestContext,
        key: Vec<Value>,
        body: Record,
    ) -> Result<WriteResponse, Error> {
        self.write(endpoint, ctx, Some(key), body).await
    }

    async fn write(
        &self,
        endpoint: &EndpointConfig,
        ctx: &RequestContext,
        key: Option<Vec<Value>>,
        body: Record,
    ) -> Result<WriteResponse, Error> {
        let start = Instant::now();
        let model = self.model(endpoint)?;
        let key = key.map(|k| model.key(k)).transpose()?;
        let scope = Scope::new(&model, ctx, DeletedScope::Live)?;
        let registry = &*self.inner.registry;

        let write = NestedWrite::plan(&scope, body, key.is_none())?;
        write.authorize(endpoint, registry)?;

        let scope_ref = &scope;
        let key_ref = key.as_deref();
        let root = atomic(&self.inner.adapter, move |tx| async move {
            write.execute(&*tx, registry, scope_ref, ctx, key_ref).await
        })
        .await?;

        let mut record = scope.fetch_required(&*self.inner.adapter, &root).await?;
        model.apply_computed(&mut record);

        histogram!("ousia_rest.write.duration_ms",
            "model" => model.table_name().to_string(),
            "op" => if key.is_none() { "create" } else { "update" }
        )
        .record(start.elapsed().as_millis() as f64);

        Ok(WriteResponse::ok(record))
    }

    /// Delete a record: a soft delete when the model declares one, a physical
    /// delete otherwise. Returns the record as it was before a physical
    /// delete, or as marked by a soft one.
    pub async fn delete(
        &self,
        endpoint: &EndpointConfig,
        ctx: &RequestContext,
        key: Vec<Value>,
    ) -> Result<WriteResponse, Error> {
        let start = Instant::now();
        let model = self.model(endpoint)?;
        let key = model.key(key)?;
        let scope = Scope::new(&model, ctx, DeletedScope::Live)?;

        let (scope_ref, model_ref, key_ref) = (&scope, &*model, &key);
        let mut record = atomic(&self.inner.adapter, move |tx| async move {
            let record = scope_ref.fetch_required(&*tx, key_ref).await?;
            match scope_ref.soft_delete_patch() {
                Some(patch) => tx.update(model_ref, key_ref, patch).await,
                None => {
                    tx.delete(model_ref, key_ref).await?;
                    Ok(record)
                }
            }
        })
        .await?;
        model.apply_computed(&mut record);

        histogram!("ousia_rest.write.duration_ms",
            "model" => model.table_name().to_string(),
            "op" => "delete"
        )
        .record(start.elapsed().as_millis() as f64);

        Ok(WriteResponse::ok(record))
    }

    /// Clear the soft-delete marker of a record. Restoring a live record
    /// returns it unchanged.
    pub async fn restore(
        &self,
        endpoint: &EndpointConfig,
        ctx: &RequestContext,
        key: Vec<Value>,
    ) -> Result<WriteResponse, Error> {
        let model = self.model(endpoint)?;
        let key = model.key(key)?;
        let scope = Scope::new(&model, ctx, DeletedScope::WithDeleted)?;
        let patch = scope.restore_patch().ok_or_else(|| {
            Error::validation(format!("{} does not soft delete", model.table_name()))
        })?;

        let (scope_ref, model_ref, key_ref) = (&scope, &*model, &key);
        let mut record = atomic(&self.inner.adapter, move |tx| async move {
            let record = scope_ref.fetch_required(&*tx, key_ref).await?;
            if scope_ref.with_deleted(DeletedScope::Live).admits(&record) {
                return Ok(record);
            }
            tx.update(model_ref, key_ref, patch).await
        })
        .await?;
        model.apply_computed(&mut record);

        Ok(WriteResponse::ok(record))
    }

    /// Create or update every item, matched on the endpoint's upsert keys.
    pub async fn batch_upsert(
        &self,
        endpoint: &EndpointConfig,
        ctx: &RequestContext,
        items: Vec<Record>,
    ) -> Result<UpsertResult, Error> {
        let start = Instant::now();
        let model = self.model(endpoint)?;
        let scope = Scope::new(&model, ctx, DeletedScope::Live)?;

        let result = Upsert::new(&scope, &endpoint.upsert)
            .run(&self.inner.adapter, items)
            .await?;

        histogram!("ousia_rest.upsert.duration_ms", "model" => model.table_name().to_string())
            .record(start.elapsed().as_millis() as f64);

        Ok(result)
    }

    // ==================== Transactions ====================

    /// Run `f` with an engine bound to one transaction. Engine calls made
    /// through that handle join the transaction; it commits when `f` returns
    /// `Ok` and rolls back otherwise.
    pub async fn run_in_transaction<T, F, Fut>(&self, f: F) -> Result<T, Error>
    where
        F: FnOnce(Engine) -> Fut,
        Fut: Future<Output = Result<T, Error>>,
    {
        let registry = Arc::clone(&self.inner.registry);
        atomic(&self.inner.adapter, move |tx| f(Engine::new(tx, registry))).await
    }
}
