use std::{
    cmp::Ordering,
    collections::{BTreeMap, HashMap},
    sync::{Arc, Mutex as StdMutex, PoisonError},
};

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::debug;

use super::{Adapter, FindOptions, Transaction, nested_transaction, storage_key, transaction_closed};
use crate::{
    error::Error,
    model::Model,
    query::{Comparison, Direction, FilterCondition, FilterEngine, LikeMode, OrderBy, PredicateBuilder},
    record::{Record, canonical_tuple, compare_values, is_null, merge, sort_values},
};

/// Rows keyed by canonical primary-key tuple.
type Table = BTreeMap<String, Record>;

#[derive(Debug, Clone, Default)]
struct Store {
    tables: HashMap<String, Table>,
}

impl Store {
    fn rows<'a>(&'a self, model: &Model) -> impl Iterator<Item = &'a Record> + 'a {
        self.tables
            .get(model.table_name())
            .into_iter()
            .flat_map(|t| t.values())
    }

    fn find_many(&self, model: &Model, options: &FindOptions) -> Result<Vec<Record>, Error> {
        let matcher = FilterEngine::render(&options.conditions, &MemoryPredicates)?;
        let mut rows: Vec<Record> = self.rows(model).filter(|r| matcher(*r)).cloned().collect();
        sort_records(&mut rows, model, &options.order_by);
        let take = options.take.map_or(usize::MAX, |t| t as usize);
        Ok(rows
            .into_iter()
            .skip(options.skip as usize)
            .take(take)
            .collect())
    }

    fn count(&self, model: &Model, conditions: &[FilterCondition]) -> Result<u64, Error> {
        let matcher = FilterEngine::render(conditions, &MemoryPredicates)?;
        Ok(self.rows(model).filter(|r| matcher(*r)).count() as u64)
    }

    fn find_by_key(&self, model: &Model, key: &[Value]) -> Option<Record> {
        self.tables
            .get(model.table_name())
            .and_then(|t| t.get(&canonical_tuple(key)))
            .cloned()
    }

    fn create(&mut self, model: &Model, data: Record) -> Result<Record, Error> {
        let key = canonical_tuple(&storage_key(model, &data)?);
        let table = self
            .tables
            .entry(model.table_name().to_string())
            .or_default();
        if table.contains_key(&key) {
            return Err(Error::Conflict(format!(
                "{} with key {} already exists",
                model.table_name(),
                key
            )));
        }
        table.insert(key, data.clone());
        Ok(data)
    }

    fn update(&mut self, model: &Model, key: &[Value], data: Record) -> Result<Record, Error> {
        let old_key = canonical_tuple(key);
        let table = self
            .tables
            .get_mut(model.table_name())
            .ok_or(Error::NotFound)?;
        let mut record = table.get(&old_key).cloned().ok_or(Error::NotFound)?;
        merge(&mut record, &data);

        let new_key = canonical_tuple(&storage_key(model, &record)?);
        if new_key != old_key {
            if table.contains_key(&new_key) {
                return Err(Error::Conflict(format!(
                    "{} with key {} already exists",
                    model.table_name(),
                    new_key
                )));
            }
            table.remove(&old_key);
        }
        table.insert(new_key, record.clone());
        Ok(record)
    }

    fn delete(&mut self, model: &Model, key: &[Value]) -> Result<(), Error> {
        self.tables
            .get_mut(model.table_name())
            .and_then(|t| t.remove(&canonical_tuple(key)))
            .map(|_| ())
            .ok_or(Error::NotFound)
    }
}

type CallCounter = Arc<StdMutex<HashMap<String, usize>>>;

fn count_call(calls: &CallCounter, model: &Model) {
    let mut calls = calls.lock().unwrap_or_else(PoisonError::into_inner);
    *calls.entry(model.table_name().to_string()).or_insert(0) += 1;
}

/// In-memory adapter for tests and prototyping.
///
/// All state sits behind one async mutex. A transaction holds that mutex for
/// its whole lifetime together with a snapshot taken at `begin`, so
/// concurrent writers are serialised and a rollback is a snapshot restore.
#[derive(Clone, Default)]
pub struct MemoryAdapter {
    store: Arc<Mutex<Store>>,
    calls: CallCounter,
}

impl MemoryAdapter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of `find_many` calls issued against `model`, transactions
    /// included.
    pub fn find_many_calls(&self, model: &str) -> usize {
        self.calls
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(model)
            .copied()
            .unwrap_or(0)
    }

    pub fn reset_calls(&self) {
        self.calls
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
    }
}

#[async_trait]
impl Adapter for MemoryAdapter {
    async fn find_many(&self, model: &Model, options: FindOptions) -> Result<Vec<Record>, Error> {
        count_call(&self.calls, model);
        self.store.lock().await.find_many(model, &options)
    }

    async fn count(&self, model: &Model, conditions: &[FilterCondition]) -> Result<u64, Error> {
        self.store.lock().await.count(model, conditions)
    }

    async fn find_by_key(&self, model: &Model, key: &[Value]) -> Result<Option<Record>, Error> {
        Ok(self.store.lock().await.find_by_key(model, key))
    }

    async fn create(&self, model: &Model, data: Record) -> Result<Record, Error> {
        self.store.lock().await.create(model, data)
    }

    async fn update(&self, model: &Model, key: &[Value], data: Record) -> Result<Record, Error> {
        self.store.lock().await.update(model, key, data)
    }

    async fn delete(&self, model: &Model, key: &[Value]) -> Result<(), Error> {
        self.store.lock().await.delete(model, key)
    }

    async fn begin(&self) -> Result<Arc<dyn Transaction>, Error> {
        let guard = self.store.clone().lock_owned().await;
        let snapshot = guard.clone();
        Ok(Arc::new(MemoryTransaction {
            state: Mutex::new(Some(TxState { guard, snapshot })),
            calls: self.calls.clone(),
        }))
    }
}

struct TxState {
    guard: OwnedMutexGuard<Store>,
    snapshot: Store,
}

pub struct MemoryTransaction {
    state: Mutex<Option<TxState>>,
    calls: CallCounter,
}

impl MemoryTransaction {
    async fn with_store<T>(&self, f: impl FnOnce(&mut Store) -> Result<T, Error>) -> Result<T, Error> {
        let mut state = self.state.lock().await;
        let state = state.as_mut().ok_or_else(transaction_closed)?;
        f(&mut *state.guard)
    }
}

impl Drop for MemoryTransaction {
    fn drop(&mut self) {
        if let Some(mut state) = self.state.get_mut().take() {
            *state.guard = std::mem::take(&mut state.snapshot);
            debug!("memory transaction dropped without commit, rolled back");
        }
    }
}

#[async_trait]
impl Adapter for MemoryTransaction {
    async fn find_many(&self, model: &Model, options: FindOptions) -> Result<Vec<Record>, Error> {
        count_call(&self.calls, model);
        self.with_store(|s| s.find_many(model, &options)).await
    }

    async fn count(&self, model: &Model, conditions: &[FilterCondition]) -> Result<u64, Error> {
        self.with_store(|s| s.count(model, conditions)).await
    }

    async fn find_by_key(&self, model: &Model, key: &[Value]) -> Result<Option<Record>, Error> {
        self.with_store(|s| Ok(s.find_by_key(model, key))).await
    }

    async fn create(&self, model: &Model, data: Record) -> Result<Record, Error> {
        self.with_store(|s| s.create(model, data)).await
    }

    async fn update(&self, model: &Model, key: &[Value], data: Record) -> Result<Record, Error> {
        self.with_store(|s| s.update(model, key, data)).await
    }

    async fn delete(&self, model: &Model, key: &[Value]) -> Result<(), Error> {
        self.with_store(|s| s.delete(model, key)).await
    }

    async fn begin(&self) -> Result<Arc<dyn Transaction>, Error> {
        Err(nested_transaction())
    }

    fn in_transaction(&self) -> bool {
        true
    }
}

#[async_trait]
impl Transaction for MemoryTransaction {
    async fn commit(&self) -> Result<(), Error> {
        self.state
            .lock()
            .await
            .take()
            .map(drop)
            .ok_or_else(transaction_closed)
    }

    async fn rollback(&self) -> Result<(), Error> {
        let mut state = self.state.lock().await.take().ok_or_else(transaction_closed)?;
        *state.guard = std::mem::take(&mut state.snapshot);
        Ok(())
    }
}

fn sort_records(rows: &mut [Record], model: &Model, order_by: &[OrderBy]) {
    rows.sort_by(|a, b| {
        for order in order_by {
            let (x, y) = (a.get(&order.field), b.get(&order.field));
            let ord = match order.direction {
                Direction::Asc => sort_values(x, y),
                Direction::Desc => sort_values(y, x),
            };
            if ord != Ordering::Equal {
                return ord;
            }
        }
        model
            .primary_keys()
            .iter()
            .map(|pk| sort_values(a.get(pk), b.get(pk)))
            .find(|ord| *ord != Ordering::Equal)
            .unwrap_or(Ordering::Equal)
    });
}

type Matcher = Box<dyn Fn(&Record) -> bool + Send + Sync>;

/// Renders conditions into closures evaluated against each stored record.
struct MemoryPredicates;

impl PredicateBuilder for MemoryPredicates {
    type Predicate = Matcher;

    fn always(&self) -> Matcher {
        Box::new(|_| true)
    }

    fn compare(&self, field: &str, op: Comparison, value: &Value) -> Matcher {
        let field = field.to_string();
        let value = value.clone();
        Box::new(move |r| match r.get(&field) {
            Some(v) if !v.is_null() => {
                compare_values(v, &value).is_some_and(|ord| comparison_holds(op, ord))
            }
            _ => false,
        })
    }

    fn in_list(&self, field: &str, values: &[Value], negated: bool) -> Matcher {
        let field = field.to_string();
        let values = values.to_vec();
        Box::new(move |r| match r.get(&field) {
            Some(v) if !v.is_null() => {
                let hit = values
                    .iter()
                    .any(|c| compare_values(v, c) == Some(Ordering::Equal));
                hit != negated
            }
            _ => false,
        })
    }

    fn like(&self, field: &str, pattern: &str, mode: LikeMode) -> Matcher {
        let field = field.to_string();
        let pattern = pattern.to_string();
        Box::new(move |r| match r.get(&field) {
            Some(Value::String(s)) => match mode {
                LikeMode::Sensitive => like_match(s, &pattern),
                LikeMode::Lowered => like_match(&s.to_ascii_lowercase(), &pattern),
            },
            _ => false,
        })
    }

    fn null(&self, field: &str, null: bool) -> Matcher {
        let field = field.to_string();
        Box::new(move |r| is_null(r.get(&field)) == null)
    }

    fn and(&self, parts: Vec<Matcher>) -> Matcher {
        Box::new(move |r| parts.iter().all(|p| p(r)))
    }
}

fn comparison_holds(op: Comparison, ord: Ordering) -> bool {
    match op {
        Comparison::Eq => ord == Ordering::Equal,
        Comparison::Ne => ord != Ordering::Equal,
        Comparison::Gt => ord == Ordering::Greater,
        Comparison::Gte => ord != Ordering::Less,
        Comparison::Lt => ord == Ordering::Less,
        Comparison::Lte => ord != Ordering::Greater,
    }
}

/// `%` matches any run of characters; everything else is literal.
fn like_match(text: &str, pattern: &str) -> bool {
    let parts: Vec<&str> = pattern.split('%').collect();
    let [first, middle @ .., last] = parts.as_slice() else {
        return text == pattern;
    };
    let Some(mut rest) = text.strip_prefix(first) else {
        return false;
    };
    for part in middle {
        match rest.find(part) {
            Some(i) => rest = &rest[i + part.len()..],
            None => return false,
        }
    }
    rest.ends_with(last)
}
