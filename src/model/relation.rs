use std::sync::{Arc, Weak};

use once_cell::sync::OnceCell;

use super::{Model, Registry};
use crate::error::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelationKind {
    HasMany,
    HasOne,
    BelongsTo,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NestedOperation {
    Create,
    Update,
    Delete,
    Connect,
    Disconnect,
}

impl NestedOperation {
    pub const ALL: [NestedOperation; 5] = [
        NestedOperation::Create,
        NestedOperation::Update,
        NestedOperation::Delete,
        NestedOperation::Connect,
        NestedOperation::Disconnect,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            NestedOperation::Create => "create",
            NestedOperation::Update => "update",
            NestedOperation::Delete => "delete",
            NestedOperation::Connect => "connect",
            NestedOperation::Disconnect => "disconnect",
        }
    }

    pub fn from_key(key: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|op| op.as_str() == key)
    }
}

/// Capability set for nested writes. Used both on relation descriptors and
/// on the endpoint allow-list; an operation runs only when both allow it.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct NestedWrites {
    pub allow_create: bool,
    pub allow_update: bool,
    pub allow_delete: bool,
    pub allow_connect: bool,
    pub allow_disconnect: bool,
}

impl NestedWrites {
    pub fn none() -> Self {
        Self::default()
    }

    pub fn all() -> Self {
        Self {
            allow_create: true,
            allow_update: true,
            allow_delete: true,
            allow_connect: true,
            allow_disconnect: true,
        }
    }

    pub fn only(ops: &[NestedOperation]) -> Self {
        ops.iter().fold(Self::none(), |acc, op| acc.with(*op))
    }

    pub fn with(mut self, op: NestedOperation) -> Self {
        match op {
            NestedOperation::Create => self.allow_create = true,
            NestedOperation::Update => self.allow_update = true,
            NestedOperation::Delete => self.allow_delete = true,
            NestedOperation::Connect => self.allow_connect = true,
            NestedOperation::Disconnect => self.allow_disconnect = true,
        }
        self
    }

    pub fn allows(&self, op: NestedOperation) -> bool {
        match op {
            NestedOperation::Create => self.allow_create,
            NestedOperation::Update => self.allow_update,
            NestedOperation::Delete => self.allow_delete,
            NestedOperation::Connect => self.allow_connect,
            NestedOperation::Disconnect => self.allow_disconnect,
        }
    }
}

/// Declared association to another model, referenced by name.
///
/// For `HasMany`/`HasOne` the foreign key lives on the target and points at
/// `local_key` on the declaring model. For `BelongsTo` the foreign key lives
/// on the declaring model and points at `local_key` on the target. In both
/// cases `local_key` defaults to the primary key of the side it lives on.
#[derive(Debug, Clone)]
pub struct RelationDescriptor {
    pub kind: RelationKind,
    pub target: String,
    pub foreign_key: String,
    pub local_key: Option<String>,
    pub nested_writes: Option<NestedWrites>,
    resolved: OnceCell<Weak<Model>>,
}

impl RelationDescriptor {
    fn new(kind: RelationKind, target: impl Into<String>, foreign_key: impl Into<String>) -> Self {
        Self {
            kind,
            target: target.into(),
            foreign_key: foreign_key.into(),
            local_key: None,
            nested_writes: None,
            resolved: OnceCell::new(),
        }
    }

    pub fn has_many(target: impl Into<String>, foreign_key: impl Into<String>) -> Self {
        Self::new(RelationKind::HasMany, target, foreign_key)
    }

    pub fn has_one(target: impl Into<String>, foreign_key: impl Into<String>) -> Self {
        Self::new(RelationKind::HasOne, target, foreign_key)
    }

    pub fn belongs_to(target: impl Into<String>, foreign_key: impl Into<String>) -> Self {
        Self::new(RelationKind::BelongsTo, target, foreign_key)
    }

    pub fn local_key(mut self, local_key: impl Into<String>) -> Self {
        self.local_key = Some(local_key.into());
        self
    }

    pub fn nested_writes(mut self, writes: NestedWrites) -> Self {
        self.nested_writes = Some(writes);
        self
    }

    pub fn allows(&self, op: NestedOperation) -> bool {
        self.nested_writes.is_some_and(|w| w.allows(op))
    }

    /// Resolve the target model through the registry on first use.
    pub fn target(&self, registry: &Registry) -> Result<Arc<Model>, Error> {
        if let Some(model) = self.resolved.get().and_then(Weak::upgrade) {
            return Ok(model);
        }
        let model = registry.get(&self.target)?;
        let _ = self.resolved.set(Arc::downgrade(&model));
        Ok(model)
    }

    /// Field on the declaring model that holds the join value.
    pub fn owner_field<'a>(&'a self, owner: &'a Model) -> &'a str {
        match self.kind {
            RelationKind::BelongsTo => &self.foreign_key,
            RelationKind::HasMany | RelationKind::HasOne => self
                .local_key
                .as_deref()
                .unwrap_or_else(|| owner.primary_keys[0].as_str()),
        }
    }

    /// Field on the target model matched against `owner_field`.
    pub fn target_field<'a>(&'a self, target: &'a Model) -> &'a str {
        match self.kind {
            RelationKind::BelongsTo => self
                .local_key
                .as_deref()
                .unwrap_or_else(|| target.primary_keys[0].as_str()),
            RelationKind::HasMany | RelationKind::HasOne => &self.foreign_key,
        }
    }
}
