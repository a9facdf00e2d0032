use std::{fmt, sync::Arc};

use serde_json::Value;

use crate::{context::RequestContext, error::Error};

/// Records whose `field` is non-null are considered deleted.
#[derive(Debug, Clone)]
pub struct SoftDeletePolicy {
    pub field: String,
    pub allow_query_deleted: bool,
    pub query_param: String,
}

impl Default for SoftDeletePolicy {
    fn default() -> Self {
        Self {
            field: "deletedAt".to_string(),
            allow_query_deleted: true,
            query_param: "withDeleted".to_string(),
        }
    }
}

impl SoftDeletePolicy {
    pub fn field(mut self, field: impl Into<String>) -> Self {
        self.field = field.into();
        self
    }

    pub fn allow_query_deleted(mut self, allow: bool) -> Self {
        self.allow_query_deleted = allow;
        self
    }

    pub fn query_param(mut self, param: impl Into<String>) -> Self {
        self.query_param = param.into();
        self
    }

    /// `withDeleted` -> `onlyDeleted`; any other name gets an `only` prefix.
    pub fn only_param(&self) -> String {
        match self.query_param.strip_prefix("with") {
            Some(rest) if !rest.is_empty() => format!("only{}", rest),
            _ => {
                let mut chars = self.query_param.chars();
                match chars.next() {
                    Some(first) => format!("only{}{}", first.to_uppercase(), chars.as_str()),
                    None => "only".to_string(),
                }
            }
        }
    }
}

pub type TenantExtractor = dyn Fn(&RequestContext) -> Option<Value> + Send + Sync;

#[derive(Clone)]
pub enum TenantSource {
    Context(String),
    Header(String),
    Custom(Arc<TenantExtractor>),
}

impl fmt::Debug for TenantSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TenantSource::Context(key) => f.debug_tuple("Context").field(key).finish(),
            TenantSource::Header(name) => f.debug_tuple("Header").field(name).finish(),
            TenantSource::Custom(_) => f.write_str("Custom(..)"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct MultiTenantPolicy {
    pub field: String,
    pub source: TenantSource,
    pub required: bool,
}

impl MultiTenantPolicy {
    pub fn from_context(field: impl Into<String>, key: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            source: TenantSource::Context(key.into()),
            required: true,
        }
    }

    pub fn from_header(field: impl Into<String>, header: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            source: TenantSource::Header(header.into()),
            required: true,
        }
    }

    pub fn custom<F>(field: impl Into<String>, extractor: F) -> Self
    where
        F: Fn(&RequestContext) -> Option<Value> + Send + Sync + 'static,
    {
        Self {
            field: field.into(),
            source: TenantSource::Custom(Arc::new(extractor)),
            required: true,
        }
    }

    pub fn optional(mut self) -> Self {
        self.required = false;
        self
    }

    /// Resolve the tenant for this request. A mandatory policy without a
    /// resolvable tenant rejects the request.
    pub fn resolve(&self, ctx: &RequestContext) -> Result<Option<Value>, Error> {
        let value = match &self.source {
            TenantSource::Context(key) => ctx.value(key).cloned(),
            TenantSource::Header(name) => ctx.header(name).map(|h| Value::String(h.to_string())),
            TenantSource::Custom(extractor) => extractor(ctx),
        }
        .filter(|v| match v {
            Value::Null => false,
            Value::String(s) => !s.is_empty(),
            _ => true,
        });

        match value {
            Some(v) => Ok(Some(v)),
            None if self.required => Err(Error::validation(format!(
                "tenant identifier for '{}' could not be resolved",
                self.field
            ))),
            None => Ok(None),
        }
    }
}
