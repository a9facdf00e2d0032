pub mod policy;
pub mod registry;
pub mod relation;

pub use policy::*;
pub use registry::*;
pub use relation::*;

use std::{fmt, sync::Arc};

use chrono::{DateTime, SecondsFormat, Utc};
use serde_json::{Number, Value};

use crate::{
    error::Error,
    record::{KeyTuple, Record},
};

/// Declared storage kind of a field. Drives coercion of query-string values
/// into typed JSON values.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldKind {
    String,
    Integer,
    Float,
    Boolean,
    Timestamp,
    Json,
}

impl FieldKind {
    pub fn coerce(&self, raw: &str) -> Result<Value, Error> {
        match self {
            FieldKind::String => Ok(Value::String(raw.to_string())),
            FieldKind::Integer => raw
                .trim()
                .parse::<i64>()
                .map(Value::from)
                .map_err(|_| Error::validation(format!("'{}' is not an integer", raw))),
            FieldKind::Float => raw
                .trim()
                .parse::<f64>()
                .ok()
                .and_then(Number::from_f64)
                .map(Value::Number)
                .ok_or_else(|| Error::validation(format!("'{}' is not a number", raw))),
            FieldKind::Boolean => parse_bool(raw)
                .map(Value::Bool)
                .ok_or_else(|| Error::validation(format!("'{}' is not a boolean", raw))),
            FieldKind::Timestamp => DateTime::parse_from_rfc3339(raw.trim())
                .map(|t| timestamp_value(t.with_timezone(&Utc)))
                .map_err(|_| Error::validation(format!("'{}' is not an RFC 3339 timestamp", raw))),
            FieldKind::Json => {
                Ok(serde_json::from_str(raw).unwrap_or_else(|_| Value::String(raw.to_string())))
            }
        }
    }

    /// Best-effort coercion for fields the model does not declare.
    pub fn infer(raw: &str) -> Value {
        if let Ok(i) = raw.parse::<i64>() {
            return Value::from(i);
        }
        if let Some(n) = raw.parse::<f64>().ok().and_then(Number::from_f64) {
            return Value::Number(n);
        }
        if let Some(b) = parse_bool(raw) {
            return Value::Bool(b);
        }
        Value::String(raw.to_string())
    }
}

pub(crate) fn parse_bool(raw: &str) -> Option<bool> {
    match raw.trim() {
        "true" => Some(true),
        "false" => Some(false),
        _ => None,
    }
}

/// Timestamps are stored as RFC 3339 strings with millisecond precision so
/// that lexical and chronological order agree.
pub fn timestamp_value(at: DateTime<Utc>) -> Value {
    Value::String(at.to_rfc3339_opts(SecondsFormat::Millis, true))
}

pub fn timestamp_now() -> Value {
    timestamp_value(Utc::now())
}

#[derive(Debug, Clone)]
pub struct Field {
    pub name: String,
    pub kind: FieldKind,
    pub nullable: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValidationMode {
    Create,
    Update,
}

/// Opaque schema validator supplied by the caller.
pub trait Validator: Send + Sync {
    fn validate(&self, data: &Record, mode: ValidationMode) -> Result<(), Vec<String>>;
}

pub type ComputeFn = dyn Fn(&Record) -> Value + Send + Sync;

#[derive(Clone)]
pub struct ComputedField {
    pub compute: Arc<ComputeFn>,
    pub depends_on: Vec<String>,
}

impl ComputedField {
    pub fn new<F>(depends_on: &[&str], compute: F) -> Self
    where
        F: Fn(&Record) -> Value + Send + Sync + 'static,
    {
        Self {
            compute: Arc::new(compute),
            depends_on: depends_on.iter().map(|s| s.to_string()).collect(),
        }
    }
}

/// Declarative description of one entity type. Immutable once registered.
pub struct Model {
    pub(crate) table_name: String,
    pub(crate) primary_keys: Vec<String>,
    pub(crate) fields: Vec<Field>,
    pub(crate) relations: Vec<(String, RelationDescriptor)>,
    pub(crate) soft_delete: Option<SoftDeletePolicy>,
    pub(crate) multi_tenant: Option<MultiTenantPolicy>,
    pub(crate) computed: Vec<(String, ComputedField)>,
    pub(crate) validator: Option<Arc<dyn Validator>>,
}

impl fmt::Debug for Model {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Model")
            .field("table_name", &self.table_name)
            .field("primary_keys", &self.primary_keys)
            .field("relations", &self.relations)
            .field("soft_delete", &self.soft_delete)
            .finish_non_exhaustive()
    }
}

impl Model {
    pub fn builder(table_name: impl Into<String>) -> ModelBuilder {
        ModelBuilder {
            model: Model {
                table_name: table_name.into(),
                primary_keys: vec!["id".to_string()],
                fields: Vec::new(),
                relations: Vec::new(),
                soft_delete: None,
                multi_tenant: None,
                computed: Vec::new(),
                validator: None,
            },
        }
    }

    pub fn table_name(&self) -> &str {
        &self.table_name
    }

    pub fn primary_keys(&self) -> &[String] {
        &self.primary_keys
    }

    pub fn fields(&self) -> &[Field] {
        &self.fields
    }

    pub fn field(&self, name: &str) -> Option<&Field> {
        self.fields.iter().find(|f| f.name == name)
    }

    pub fn relations(&self) -> impl Iterator<Item = (&str, &RelationDescriptor)> {
        self.relations.iter().map(|(n, r)| (n.as_str(), r))
    }

    pub fn relation(&self, name: &str) -> Option<&RelationDescriptor> {
        self.relations
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, r)| r)
    }

    pub fn soft_delete(&self) -> Option<&SoftDeletePolicy> {
        self.soft_delete.as_ref()
    }

    pub fn multi_tenant(&self) -> Option<&MultiTenantPolicy> {
        self.multi_tenant.as_ref()
    }

    pub fn is_computed(&self, name: &str) -> bool {
        self.computed.iter().any(|(n, _)| n == name)
    }

    /// Coerce a raw query-string value for `field` using its declared kind.
    pub fn coerce(&self, field: &str, raw: &str) -> Result<Value, Error> {
        match self.field(field) {
            Some(f) => f.kind.coerce(raw),
            None => Ok(FieldKind::infer(raw)),
        }
    }

    /// Build a key tuple from caller-supplied values, coercing string parts
    /// into the declared key kinds.
    pub fn key(&self, values: Vec<Value>) -> Result<KeyTuple, Error> {
        if values.len() != self.primary_keys.len() {
            return Err(Error::validation(format!(
                "{} expects a key of {} part(s), got {}",
                self.table_name,
                self.primary_keys.len(),
                values.len()
            )));
        }
        self.primary_keys
            .iter()
            .zip(values)
            .map(|(name, value)| match (&value, self.field(name)) {
                (Value::String(raw), Some(field)) if field.kind != FieldKind::String => {
                    field.kind.coerce(raw)
                }
                _ => Ok(value),
            })
            .collect()
    }

    /// Attach computed fields to a record that is about to leave the engine.
    pub fn apply_computed(&self, record: &mut Record) {
        for (name, field) in &self.computed {
            let value = (field.compute)(record);
            record.insert(name.clone(), value);
        }
    }

    /// Run the caller's validator, if one is attached.
    pub fn validate(&self, data: &Record, mode: ValidationMode) -> Result<(), Error> {
        if !self.fields.is_empty() {
            let unknown: Vec<&str> = data
                .keys()
                .filter(|k| self.field(k).is_none())
                .map(|k| k.as_str())
                .collect();
            if !unknown.is_empty() {
                return Err(Error::validation(format!(
                    "unknown field(s) for {}: {}",
                    self.table_name,
                    unknown.join(", ")
                )));
            }
        }
        if let Some(validator) = &self.validator {
            validator
                .validate(data, mode)
                .map_err(|issues| Error::Validation(issues.join("; ")))?;
        }
        Ok(())
    }
}

pub struct ModelBuilder {
    model: Model,
}

impl ModelBuilder {
    pub fn primary_key<I, S>(mut self, keys: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.model.primary_keys = keys.into_iter().map(Into::into).collect();
        self
    }

    pub fn field(mut self, name: impl Into<String>, kind: FieldKind) -> Self {
        self.model.fields.push(Field {
            name: name.into(),
            kind,
            nullable: false,
        });
        self
    }

    pub fn nullable_field(mut self, name: impl Into<String>, kind: FieldKind) -> Self {
        self.model.fields.push(Field {
            name: name.into(),
            kind,
            nullable: true,
        });
        self
    }

    pub fn relation(mut self, name: impl Into<String>, relation: RelationDescriptor) -> Self {
        self.model.relations.push((name.into(), relation));
        self
    }

    pub fn soft_delete(mut self, policy: SoftDeletePolicy) -> Self {
        self.model.soft_delete = Some(policy);
        self
    }

    pub fn multi_tenant(mut self, policy: MultiTenantPolicy) -> Self {
        self.model.multi_tenant = Some(policy);
        self
    }

    pub fn computed(mut self, name: impl Into<String>, field: ComputedField) -> Self {
        self.model.computed.push((name.into(), field));
        self
    }

    pub fn validator(mut self, validator: Arc<dyn Validator>) -> Self {
        self.model.validator = Some(validator);
        self
    }

    pub fn build(self) -> Model {
        self.model
    }
}
