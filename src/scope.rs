use serde_json::Value;
use tracing::debug;
use uuid::Uuid;

use crate::{
    adapters::Adapter,
    context::RequestContext,
    error::Error,
    model::{Model, timestamp_now},
    query::{FilterCondition, QueryParams},
    record::{Record, is_null, key_of, values_equal},
};

/// Which records a read may see with respect to soft delete.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum DeletedScope {
    #[default]
    Live,
    WithDeleted,
    OnlyDeleted,
}

impl DeletedScope {
    /// Read the deleted-scope parameters named by the model's soft-delete
    /// policy. Ignored when the model has no policy or forbids them.
    pub fn from_params(model: &Model, params: &QueryParams) -> Result<Self, Error> {
        let Some(policy) = model.soft_delete() else {
            return Ok(DeletedScope::Live);
        };
        let only_param = policy.only_param();
        let with = flag(params, &policy.query_param)?;
        let only = flag(params, &only_param)?;
        if !with && !only {
            return Ok(DeletedScope::Live);
        }
        if !policy.allow_query_deleted {
            debug!(
                model = model.table_name(),
                "deleted-scope parameters ignored, querying deleted records is disabled"
            );
            return Ok(DeletedScope::Live);
        }
        Ok(if only {
            DeletedScope::OnlyDeleted
        } else {
            DeletedScope::WithDeleted
        })
    }

    /// Scope used for relations of a record read under `self`.
    pub fn for_relations(self) -> Self {
        match self {
            DeletedScope::Live => DeletedScope::Live,
            DeletedScope::WithDeleted | DeletedScope::OnlyDeleted => DeletedScope::WithDeleted,
        }
    }
}

fn flag(params: &QueryParams, name: &str) -> Result<bool, Error> {
    match params.get(name) {
        None => Ok(false),
        Some(raw) => crate::model::parse_bool(raw).ok_or_else(|| {
            Error::validation(format!("'{}' must be 'true' or 'false'", name))
        }),
    }
}

/// Soft-delete and tenant policies of one model, bound to one request.
///
/// Read side: `conditions()` yields the predicates every read must carry and
/// `admits()` applies the same test to a record fetched by key. Write side:
/// `prepare_create` / `prepare_update` rewrite incoming payloads.
#[derive(Debug, Clone)]
pub struct Scope<'a> {
    model: &'a Model,
    tenant: Option<Value>,
    deleted: DeletedScope,
}

impl<'a> Scope<'a> {
    pub fn new(model: &'a Model, ctx: &RequestContext, deleted: DeletedScope) -> Result<Self, Error> {
        let tenant = match model.multi_tenant() {
            Some(policy) => policy.resolve(ctx)?,
            None => None,
        };
        Ok(Self {
            model,
            tenant,
            deleted,
        })
    }

    pub fn model(&self) -> &'a Model {
        self.model
    }

    pub fn deleted(&self) -> DeletedScope {
        self.deleted
    }

    /// Same request, different deleted scope.
    pub fn with_deleted(&self, deleted: DeletedScope) -> Self {
        Self {
            deleted,
            ..self.clone()
        }
    }

    /// Tenant predicate first, then the soft-delete predicate.
    pub fn conditions(&self) -> Vec<FilterCondition> {
        let mut out = Vec::with_capacity(2);
        if let (Some(policy), Some(tenant)) = (self.model.multi_tenant(), &self.tenant) {
            out.push(FilterCondition::eq(&policy.field, tenant.clone()));
        }
        if let Some(policy) = self.model.soft_delete() {
            match self.deleted {
                DeletedScope::Live => out.push(FilterCondition::is_null(&policy.field, true)),
                DeletedScope::OnlyDeleted => {
                    out.push(FilterCondition::is_null(&policy.field, false))
                }
                DeletedScope::WithDeleted => {}
            }
        }
        out
    }

    /// Scope predicates conjoined with caller conditions.
    pub fn restrict(&self, conditions: Vec<FilterCondition>) -> Vec<FilterCondition> {
        let mut out = self.conditions();
        out.extend(conditions);
        out
    }

    pub fn admits(&self, record: &Record) -> bool {
        if let (Some(policy), Some(tenant)) = (self.model.multi_tenant(), &self.tenant) {
            match record.get(&policy.field) {
                Some(v) if values_equal(v, tenant) => {}
                _ => return false,
            }
        }
        if let Some(policy) = self.model.soft_delete() {
            let live = is_null(record.get(&policy.field));
            return match self.deleted {
                DeletedScope::Live => live,
                DeletedScope::OnlyDeleted => !live,
                DeletedScope::WithDeleted => true,
            };
        }
        true
    }

    /// Read by primary key. Records outside the scope are reported as absent.
    pub async fn fetch(&self, adapter: &dyn Adapter, key: &[Value]) -> Result<Option<Record>, Error> {
        let record = adapter.find_by_key(self.model, key).await?;
        Ok(record.filter(|r| self.admits(r)))
    }

    pub async fn fetch_required(&self, adapter: &dyn Adapter, key: &[Value]) -> Result<Record, Error> {
        self.fetch(adapter, key).await?.ok_or(Error::NotFound)
    }

    fn strip_managed(&self, data: &mut Record) {
        if let Some(policy) = self.model.soft_delete() {
            data.remove(&policy.field);
        }
        for (name, _) in &self.model.computed {
            data.remove(name);
        }
    }

    fn stamp_tenant(&self, data: &mut Record) {
        if let (Some(policy), Some(tenant)) = (self.model.multi_tenant(), &self.tenant) {
            data.insert(policy.field.clone(), tenant.clone());
        }
    }

    /// Strip policy-managed and computed fields, force the tenant and fill a
    /// missing single-field primary key with a UUID v7.
    pub fn prepare_create(&self, mut data: Record) -> Result<Record, Error> {
        self.strip_managed(&mut data);
        self.stamp_tenant(&mut data);

        let keys = self.model.primary_keys();
        if let [pk] = keys {
            if is_null(data.get(pk)) {
                data.insert(pk.clone(), Value::String(Uuid::now_v7().to_string()));
            }
        } else if key_of(&data, keys).is_none() {
            return Err(Error::validation(format!(
                "{} requires every primary key field: {}",
                self.model.table_name(),
                keys.join(", ")
            )));
        }
        Ok(data)
    }

    /// Strip policy-managed, computed and primary-key fields and force the
    /// tenant.
    pub fn prepare_update(&self, mut data: Record) -> Record {
        self.strip_managed(&mut data);
        for pk in self.model.primary_keys() {
            data.remove(pk);
        }
        self.stamp_tenant(&mut data);
        data
    }

    /// Patch marking a record deleted, when the model soft-deletes.
    pub fn soft_delete_patch(&self) -> Option<Record> {
        self.model.soft_delete().map(|policy| {
            let mut patch = Record::new();
            patch.insert(policy.field.clone(), timestamp_now());
            patch
        })
    }

    pub fn restore_patch(&self) -> Option<Record> {
        self.model.soft_delete().map(|policy| {
            let mut patch = Record::new();
            patch.insert(policy.field.clone(), Value::Null);
            patch
        })
    }
}
