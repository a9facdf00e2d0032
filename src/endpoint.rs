use std::{collections::HashMap, fmt, sync::Arc};

use crate::{
    error::Error,
    model::{Model, NestedOperation, NestedWrites},
    query::{Direction, FilterCondition, FilterConfig, FilterEngine, OrderBy, QueryParams},
    record::Record,
    scope::DeletedScope,
};

pub const DEFAULT_PER_PAGE: u64 = 20;
pub const MAX_PER_PAGE: u64 = 100;

/// Lifecycle hook run on every upsert item before it is applied:
/// `(data, index, is_create) -> data`.
pub type BeforeItemHook = dyn Fn(Record, usize, bool) -> Result<Record, Error> + Send + Sync;

#[derive(Clone, Default)]
pub struct UpsertConfig {
    /// Matching fields; the model's primary key when empty.
    pub keys: Vec<String>,
    /// Fields written on create and never overwritten on update.
    pub create_only_fields: Vec<String>,
    pub max_batch_size: Option<usize>,
    pub continue_on_error: bool,
    pub before_item: Option<Arc<BeforeItemHook>>,
}

impl fmt::Debug for UpsertConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("UpsertConfig")
            .field("keys", &self.keys)
            .field("create_only_fields", &self.create_only_fields)
            .field("max_batch_size", &self.max_batch_size)
            .field("continue_on_error", &self.continue_on_error)
            .field("before_item", &self.before_item.is_some())
            .finish()
    }
}

impl UpsertConfig {
    pub fn keys(mut self, keys: &[&str]) -> Self {
        self.keys = keys.iter().map(|k| k.to_string()).collect();
        self
    }

    pub fn create_only(mut self, fields: &[&str]) -> Self {
        self.create_only_fields = fields.iter().map(|k| k.to_string()).collect();
        self
    }

    pub fn max_batch_size(mut self, max: usize) -> Self {
        self.max_batch_size = Some(max);
        self
    }

    pub fn continue_on_error(mut self, enabled: bool) -> Self {
        self.continue_on_error = enabled;
        self
    }

    pub fn before_item<F>(mut self, hook: F) -> Self
    where
        F: Fn(Record, usize, bool) -> Result<Record, Error> + Send + Sync + 'static,
    {
        self.before_item = Some(Arc::new(hook));
        self
    }
}

/// What one REST endpoint exposes on top of its model.
#[derive(Debug, Clone)]
pub struct EndpointConfig {
    pub model: String,
    pub filters: FilterConfig,
    pub sortable: Vec<String>,
    pub includes: Vec<String>,
    pub nested_writes: HashMap<String, NestedWrites>,
    pub default_per_page: u64,
    pub max_per_page: u64,
    pub upsert: UpsertConfig,
}

impl EndpointConfig {
    pub fn new(model: impl Into<String>) -> Self {
        Self {
            model: model.into(),
            filters: FilterConfig::default(),
            sortable: Vec::new(),
            includes: Vec::new(),
            nested_writes: HashMap::new(),
            default_per_page: DEFAULT_PER_PAGE,
            max_per_page: MAX_PER_PAGE,
            upsert: UpsertConfig::default(),
        }
    }

    pub fn filters(mut self, filters: FilterConfig) -> Self {
        self.filters = filters;
        self
    }

    pub fn sortable(mut self, fields: &[&str]) -> Self {
        self.sortable = fields.iter().map(|f| f.to_string()).collect();
        self
    }

    pub fn includes(mut self, relations: &[&str]) -> Self {
        self.includes = relations.iter().map(|r| r.to_string()).collect();
        self
    }

    pub fn nested(mut self, relation: impl Into<String>, writes: NestedWrites) -> Self {
        self.nested_writes.insert(relation.into(), writes);
        self
    }

    pub fn per_page(mut self, default: u64, max: u64) -> Self {
        self.default_per_page = default.max(1);
        self.max_per_page = max.max(1);
        self
    }

    pub fn upsert(mut self, upsert: UpsertConfig) -> Self {
        self.upsert = upsert;
        self
    }

    pub fn allows_nested(&self, relation: &str, op: NestedOperation) -> bool {
        self.nested_writes
            .get(relation)
            .is_some_and(|w| w.allows(op))
    }

    /// Every requested relation must be declared on the model and exposed by
    /// this endpoint.
    pub fn check_includes(&self, model: &Model, names: &[String]) -> Result<(), Error> {
        for name in names {
            if model.relation(name).is_none() {
                return Err(Error::validation(format!(
                    "'{}' is not a relation of {}",
                    name,
                    model.table_name()
                )));
            }
            if !self.includes.iter().any(|i| i == name) {
                return Err(Error::validation(format!(
                    "relation '{}' cannot be included here",
                    name
                )));
            }
        }
        Ok(())
    }

    pub fn parse_read_options(&self, model: &Model, params: &QueryParams) -> Result<ReadOptions, Error> {
        let include: Vec<String> = params
            .get("include")
            .map(|raw| {
                raw.split(',')
                    .map(str::trim)
                    .filter(|s| !s.is_empty())
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default();
        self.check_includes(model, &include)?;
        Ok(ReadOptions {
            include,
            deleted: DeletedScope::from_params(model, params)?,
        })
    }

    pub fn parse_list_query(&self, model: &Model, params: &QueryParams) -> Result<ListQuery, Error> {
        let ReadOptions { include, deleted } = self.parse_read_options(model, params)?;
        let conditions = FilterEngine::parse(params, model, &self.filters)?;

        let page = match params.get("page") {
            Some(raw) => positive(raw, "page")?,
            None => 1,
        };
        let per_page = match params.get("perPage") {
            Some(raw) => positive(raw, "perPage")?.min(self.max_per_page),
            None => self.default_per_page.min(self.max_per_page),
        };

        let direction = match params.get("orderDirection") {
            Some(raw) => Direction::parse(raw)?,
            None => Direction::Asc,
        };
        let order_by = match params.get("orderBy") {
            Some(field) => {
                if !self.sortable.iter().any(|s| s == field) {
                    return Err(Error::validation(format!("cannot order by '{}'", field)));
                }
                Some(OrderBy {
                    field: field.to_string(),
                    direction,
                })
            }
            None => None,
        };

        Ok(ListQuery {
            conditions,
            include,
            deleted,
            page,
            per_page,
            order_by,
        })
    }
}

fn positive(raw: &str, name: &str) -> Result<u64, Error> {
    match raw.trim().parse::<u64>() {
        Ok(n) if n >= 1 => Ok(n),
        _ => Err(Error::validation(format!(
            "'{}' must be a positive integer, got '{}'",
            name, raw
        ))),
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ReadOptions {
    pub include: Vec<String>,
    pub deleted: DeletedScope,
}

/// A parsed list request.
#[derive(Debug, Clone, PartialEq)]
pub struct ListQuery {
    pub conditions: Vec<FilterCondition>,
    pub include: Vec<String>,
    pub deleted: DeletedScope,
    pub page: u64,
    pub per_page: u64,
    pub order_by: Option<OrderBy>,
}

impl Default for ListQuery {
    fn default() -> Self {
        Self {
            conditions: Vec::new(),
            include: Vec::new(),
            deleted: DeletedScope::Live,
            page: 1,
            per_page: DEFAULT_PER_PAGE,
            order_by: None,
        }
    }
}

impl ListQuery {
    pub fn skip(&self) -> u64 {
        (self.page.max(1) - 1).saturating_mul(self.per_page)
    }
}
