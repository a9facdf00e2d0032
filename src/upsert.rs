use std::sync::Arc;

use metrics::counter;
use serde::Serialize;
use serde_json::Value;
use tracing::warn;

use crate::{
    adapters::{Adapter, FindOptions, atomic},
    endpoint::UpsertConfig,
    error::Error,
    model::ValidationMode,
    query::FilterCondition,
    record::{Record, key_of},
    scope::Scope,
};

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ItemError {
    pub code: String,
    pub message: String,
}

impl From<&Error> for ItemError {
    fn from(err: &Error) -> Self {
        Self {
            code: err.code().to_string(),
            message: err.to_string(),
        }
    }
}

/// Outcome of one batch item, tagged with its position in the input.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum UpsertItem {
    Applied {
        index: usize,
        created: bool,
        record: Record,
    },
    Failed {
        index: usize,
        error: ItemError,
    },
}

impl UpsertItem {
    pub fn index(&self) -> usize {
        match self {
            UpsertItem::Applied { index, .. } | UpsertItem::Failed { index, .. } => *index,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UpsertResult {
    pub success: bool,
    pub created_count: usize,
    pub updated_count: usize,
    pub failed_count: usize,
    pub total_count: usize,
    pub items: Vec<UpsertItem>,
}

impl UpsertResult {
    fn from_items(items: Vec<UpsertItem>) -> Self {
        let mut result = UpsertResult {
            total_count: items.len(),
            ..Default::default()
        };
        for item in &items {
            match item {
                UpsertItem::Applied { created: true, .. } => result.created_count += 1,
                UpsertItem::Applied { created: false, .. } => result.updated_count += 1,
                UpsertItem::Failed { .. } => result.failed_count += 1,
            }
        }
        result.success = result.total_count == 0 || result.failed_count < result.total_count;
        result.items = items;
        result
    }
}

/// Matches batch items against stored records and applies them in input
/// order.
pub(crate) struct Upsert<'a> {
    scope: &'a Scope<'a>,
    config: &'a UpsertConfig,
    keys: Vec<String>,
}

impl<'a> Upsert<'a> {
    pub(crate) fn new(scope: &'a Scope<'a>, config: &'a UpsertConfig) -> Self {
        let keys = if config.keys.is_empty() {
            scope.model().primary_keys().to_vec()
        } else {
            config.keys.clone()
        };
        Self {
            scope,
            config,
            keys,
        }
    }

    pub(crate) async fn run(&self, adapter: &Arc<dyn Adapter>, items: Vec<Record>) -> Result<UpsertResult, Error> {
        if let Some(max) = self.config.max_batch_size {
            if items.len() > max {
                return Err(Error::validation(format!(
                    "batch of {} items exceeds the limit of {}",
                    items.len(),
                    max
                )));
            }
        }

        let outcomes = if self.config.continue_on_error {
            let mut outcomes = Vec::with_capacity(items.len());
            for (index, item) in items.into_iter().enumerate() {
                let outcome = atomic(adapter, move |tx| async move {
                    self.apply(&*tx, index, item).await
                })
                .await;
                outcomes.push(match outcome {
                    Ok(applied) => applied,
                    Err(err) => {
                        warn!(
                            model = self.scope.model().table_name(),
                            index,
                            error = %err,
                            "upsert item failed"
                        );
                        UpsertItem::Failed {
                            index,
                            error: ItemError::from(&err),
                        }
                    }
                });
            }
            outcomes
        } else {
            atomic(adapter, move |tx| async move {
                let mut outcomes = Vec::with_capacity(items.len());
                for (index, item) in items.into_iter().enumerate() {
                    outcomes.push(self.apply(&*tx, index, item).await?);
                }
                Ok(outcomes)
            })
            .await?
        };

        let result = UpsertResult::from_items(outcomes);
        let model = self.scope.model().table_name().to_string();
        counter!("ousia_rest.upsert.items", "model" => model.clone(), "outcome" => "created")
            .increment(result.created_count as u64);
        counter!("ousia_rest.upsert.items", "model" => model.clone(), "outcome" => "updated")
            .increment(result.updated_count as u64);
        counter!("ousia_rest.upsert.items", "model" => model, "outcome" => "failed")
            .increment(result.failed_count as u64);
        Ok(result)
    }

    /// Existing live, in-tenant record sharing the item's full key tuple.
    /// Items missing part of the tuple never match.
    async fn find_match(&self, tx: &dyn Adapter, item: &Record) -> Result<Option<Record>, Error> {
        let mut conditions = Vec::with_capacity(self.keys.len());
        for field in &self.keys {
            match item.get(field) {
                None | Some(Value::Null) => return Ok(None),
                Some(Value::Array(_)) | Some(Value::Object(_)) => {
                    return Err(Error::validation(format!(
                        "upsert key '{}' must be a scalar",
                        field
                    )));
                }
                Some(value) => conditions.push(FilterCondition::eq(field, value.clone())),
            }
        }

        let model = self.scope.model();
        let mut found = tx
            .find_many(model, FindOptions::filtered(self.scope.restrict(conditions)).take(2))
            .await?;
        if found.len() > 1 {
            return Err(Error::Conflict(format!(
                "more than one {} record matches upsert key ({})",
                model.table_name(),
                self.keys.join(", ")
            )));
        }
        Ok(found.pop())
    }

    fn before_item(&self, data: Record, index: usize, is_create: bool) -> Result<Record, Error> {
        match &self.config.before_item {
            Some(hook) => hook(data, index, is_create),
            None => Ok(data),
        }
    }

    async fn apply(&self, tx: &dyn Adapter, index: usize, item: Record) -> Result<UpsertItem, Error> {
        let model = self.scope.model();
        let (created, mut record) = match self.find_match(tx, &item).await? {
            Some(existing) => {
                let mut data = self.before_item(item, index, false)?;
                for field in &self.config.create_only_fields {
                    data.remove(field);
                }
                let patch = self.scope.prepare_update(data);
                model.validate(&patch, ValidationMode::Update)?;
                let key = key_of(&existing, model.primary_keys()).ok_or(Error::NotFound)?;
                (false, tx.update(model, &key, patch).await?)
            }
            None => {
                let data = self.before_item(item, index, true)?;
                let data = self.scope.prepare_create(data)?;
                model.validate(&data, ValidationMode::Create)?;
                (true, tx.create(model, data).await?)
            }
        };
        model.apply_computed(&mut record);
        Ok(UpsertItem::Applied {
            index,
            created,
            record,
        })
    }
}
