use serde_json::Value;

use crate::{
    adapters::Adapter,
    context::RequestContext,
    endpoint::EndpointConfig,
    error::Error,
    model::{Model, NestedOperation, Registry, RelationDescriptor, RelationKind, ValidationMode},
    record::{KeyTuple, Record, key_of, values_equal},
    scope::{DeletedScope, Scope},
};

/// Operations requested on one relation, executed in field order
/// create, update, delete, connect, disconnect.
#[derive(Debug, Default)]
struct RelationWrite {
    create: Vec<Record>,
    update: Vec<Record>,
    delete: Vec<Value>,
    connect: Vec<Value>,
    disconnect: Vec<Value>,
}

impl RelationWrite {
    fn operations(&self) -> impl Iterator<Item = NestedOperation> + '_ {
        NestedOperation::ALL.into_iter().filter(|op| match op {
            NestedOperation::Create => !self.create.is_empty(),
            NestedOperation::Update => !self.update.is_empty(),
            NestedOperation::Delete => !self.delete.is_empty(),
            NestedOperation::Connect => !self.connect.is_empty(),
            NestedOperation::Disconnect => !self.disconnect.is_empty(),
        })
    }
}

/// A write request split into the root record and its relation operations.
pub(crate) struct NestedWrite<'m> {
    root: Record,
    relations: Vec<(&'m str, &'m RelationDescriptor, RelationWrite)>,
}

impl<'m> NestedWrite<'m> {
    /// Decompose `body` and prepare the root payload through the scope's
    /// policies. Relations are visited in declaration order.
    pub(crate) fn plan(scope: &Scope<'m>, body: Record, creating: bool) -> Result<Self, Error> {
        let model = scope.model();
        let mut root = body;
        let mut relations = Vec::new();

        for (name, relation) in model.relations() {
            let Some(value) = root.remove(name) else {
                continue;
            };
            if value.is_null() {
                continue;
            }
            if relation.kind == RelationKind::BelongsTo {
                return Err(Error::validation(format!(
                    "nested writes are not supported on belongs-to relation '{}'",
                    name
                )));
            }
            let write = normalize(name, value)?;
            if creating {
                if let Some(op) = write.operations().find(|op| {
                    !matches!(op, NestedOperation::Create | NestedOperation::Connect)
                }) {
                    return Err(Error::validation(format!(
                        "'{}' on '{}' is only available when updating",
                        op.as_str(),
                        name
                    )));
                }
            }
            relations.push((name, relation, write));
        }

        let (root, mode) = if creating {
            (scope.prepare_create(root)?, ValidationMode::Create)
        } else {
            (scope.prepare_update(root), ValidationMode::Update)
        };
        model.validate(&root, mode)?;
        Ok(Self { root, relations })
    }

    /// Both the relation's capability flags and the endpoint allow-list must
    /// permit every requested operation. Runs before anything is written.
    pub(crate) fn authorize(&self, endpoint: &EndpointConfig, registry: &Registry) -> Result<(), Error> {
        for (name, relation, write) in &self.relations {
            for op in write.operations() {
                if !relation.allows(op) || !endpoint.allows_nested(name, op) {
                    return Err(Error::OperationNotAllowed {
                        relation: name.to_string(),
                        operation: op.as_str(),
                    });
                }
            }
            if !write.disconnect.is_empty() {
                let target = relation.target(registry)?;
                let nullable = match target.field(&relation.foreign_key) {
                    Some(field) => field.nullable,
                    None => target.fields().is_empty(),
                };
                if !nullable {
                    return Err(Error::validation(format!(
                        "cannot disconnect '{}': {}.{} is not nullable",
                        name,
                        target.table_name(),
                        relation.foreign_key
                    )));
                }
            }
        }
        Ok(())
    }

    /// Apply the root write, then every relation operation, on `tx`, and
    /// return the root key. The caller owns the transaction; any error here
    /// must abort it.
    pub(crate) async fn execute(
        self,
        tx: &dyn Adapter,
        registry: &Registry,
        scope: &Scope<'m>,
        ctx: &RequestContext,
        key: Option<&[Value]>,
    ) -> Result<KeyTuple, Error> {
        let model = scope.model();
        let root = match key {
            None => tx.create(model, self.root).await?,
            Some(key) => {
                let existing = scope.fetch_required(tx, key).await?;
                if self.root.is_empty() {
                    existing
                } else {
                    tx.update(model, key, self.root).await?
                }
            }
        };

        for (name, relation, write) in self.relations {
            let target = relation.target(registry)?;
            let target_scope = Scope::new(&target, ctx, DeletedScope::Live)?;
            let owner_field = relation.owner_field(model);
            let parent = root
                .get(owner_field)
                .filter(|v| !v.is_null())
                .cloned()
                .ok_or_else(|| {
                    Error::validation(format!(
                        "'{}' needs {}.{} to link related records",
                        name,
                        model.table_name(),
                        owner_field
                    ))
                })?;
            let children = Children {
                tx,
                scope: &target_scope,
                foreign_key: relation.target_field(&target),
                parent: &parent,
            };

            for data in write.create {
                children.create(data).await?;
            }
            for data in write.update {
                children.update(data).await?;
            }
            for id in write.delete {
                children.delete(id).await?;
            }
            for id in write.connect {
                children.connect(id).await?;
            }
            for id in write.disconnect {
                children.disconnect(id).await?;
            }
        }

        key_of(&root, model.primary_keys()).ok_or(Error::NotFound)
    }
}

fn normalize(name: &str, value: Value) -> Result<RelationWrite, Error> {
    let mut write = RelationWrite::default();
    match value {
        Value::Array(items) => write.create = objects(name, items)?,
        Value::Object(map) if map.keys().any(|k| NestedOperation::from_key(k).is_some()) => {
            for (key, value) in map {
                let op = NestedOperation::from_key(&key).ok_or_else(|| {
                    Error::validation(format!(
                        "unknown nested operation '{}' on '{}'",
                        key, name
                    ))
                })?;
                let items = match value {
                    Value::Array(items) => items,
                    Value::Null => Vec::new(),
                    single => vec![single],
                };
                match op {
                    NestedOperation::Create => write.create.extend(objects(name, items)?),
                    NestedOperation::Update => write.update.extend(objects(name, items)?),
                    NestedOperation::Delete => write.delete.extend(items),
                    NestedOperation::Connect => write.connect.extend(items),
                    NestedOperation::Disconnect => write.disconnect.extend(items),
                }
            }
        }
        Value::Object(map) => write.create.push(map),
        _ => {
            return Err(Error::validation(format!(
                "'{}' expects an object or an array",
                name
            )));
        }
    }
    Ok(write)
}

fn objects(name: &str, items: Vec<Value>) -> Result<Vec<Record>, Error> {
    items
        .into_iter()
        .map(|item| match item {
            Value::Object(map) => Ok(map),
            _ => Err(Error::validation(format!(
                "'{}' items must be objects",
                name
            ))),
        })
        .collect()
}

/// Writes against the children of one parent record.
struct Children<'a> {
    tx: &'a dyn Adapter,
    scope: &'a Scope<'a>,
    foreign_key: &'a str,
    parent: &'a Value,
}

impl Children<'_> {
    fn target(&self) -> &Model {
        self.scope.model()
    }

    /// An id is a scalar, a key tuple array or an object holding the key.
    fn key(&self, id: Value) -> Result<KeyTuple, Error> {
        let target = self.target();
        match id {
            Value::Object(map) => {
                let parts = key_of(&map, target.primary_keys()).ok_or_else(|| {
                    Error::validation(format!(
                        "{} id is missing primary key field(s)",
                        target.table_name()
                    ))
                })?;
                target.key(parts)
            }
            Value::Array(parts) => target.key(parts),
            scalar => target.key(vec![scalar]),
        }
    }

    /// The child, provided it exists in scope and belongs to the parent.
    async fn owned(&self, key: &[Value]) -> Result<Record, Error> {
        let child = self.scope.fetch_required(self.tx, key).await?;
        match child.get(self.foreign_key) {
            Some(v) if values_equal(v, self.parent) => Ok(child),
            _ => Err(Error::NotFound),
        }
    }

    fn link_patch(&self, value: Value) -> Record {
        let mut patch = Record::new();
        patch.insert(self.foreign_key.to_string(), value);
        patch
    }

    async fn create(&self, mut data: Record) -> Result<(), Error> {
        let target = self.target();
        // the link may be part of a composite key
        data.insert(self.foreign_key.to_string(), self.parent.clone());
        let data = self.scope.prepare_create(data)?;
        target.validate(&data, ValidationMode::Create)?;
        self.tx.create(target, data).await?;
        Ok(())
    }

    async fn update(&self, mut data: Record) -> Result<(), Error> {
        let target = self.target();
        data.entry(self.foreign_key)
            .or_insert_with(|| self.parent.clone());
        let parts = key_of(&data, target.primary_keys()).ok_or_else(|| {
            Error::validation(format!(
                "nested update of {} needs its primary key",
                target.table_name()
            ))
        })?;
        let key = target.key(parts)?;
        for (field, value) in target.primary_keys().iter().zip(&key) {
            data.insert(field.clone(), value.clone());
        }
        self.owned(&key).await?;
        data.remove(self.foreign_key);
        let patch = self.scope.prepare_update(data);
        target.validate(&patch, ValidationMode::Update)?;
        if !patch.is_empty() {
            self.tx.update(target, &key, patch).await?;
        }
        Ok(())
    }

    async fn delete(&self, id: Value) -> Result<(), Error> {
        let target = self.target();
        let key = self.key(id)?;
        self.owned(&key).await?;
        match self.scope.soft_delete_patch() {
            Some(patch) => self.tx.update(target, &key, patch).await.map(|_| ()),
            None => self.tx.delete(target, &key).await,
        }
    }

    async fn connect(&self, id: Value) -> Result<(), Error> {
        let key = self.key(id)?;
        self.scope.fetch_required(self.tx, &key).await?;
        self.tx
            .update(self.target(), &key, self.link_patch(self.parent.clone()))
            .await?;
        Ok(())
    }

    async fn disconnect(&self, id: Value) -> Result<(), Error> {
        let key = self.key(id)?;
        self.owned(&key).await?;
        self.tx
            .update(self.target(), &key, self.link_patch(Value::Null))
            .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{FieldKind, NestedWrites};
    use serde_json::json;

    fn users() -> Model {
        Model::builder("users")
            .relation(
                "posts",
                RelationDescriptor::has_many("posts", "userId").nested_writes(NestedWrites::all()),
            )
            .relation("team", RelationDescriptor::belongs_to("teams", "teamId"))
            .build()
    }

    fn body(v: Value) -> Record {
        v.as_object().cloned().unwrap()
    }

    fn plan(model: &Model, v: Value, creating: bool) -> Result<NestedWrite<'_>, Error> {
        let scope = Scope::new(model, &RequestContext::new(), DeletedScope::Live).unwrap();
        NestedWrite::plan(&scope, body(v), creating)
    }

    #[test]
    fn test_payload_shapes() {
        let model = users();

        let write = plan(&model, json!({"name": "a", "posts": [{"title": "x"}, {"title": "y"}]}), true).unwrap();
        assert_eq!(write.relations[0].2.create.len(), 2);
        assert!(write.root.contains_key("name"));
        assert!(!write.root.contains_key("posts"));

        let write = plan(&model, json!({"posts": {"title": "x"}}), true).unwrap();
        assert_eq!(write.relations[0].2.create.len(), 1);

        let write = plan(
            &model,
            json!({"posts": {"connect": ["p1"], "disconnect": "p2", "delete": ["p3"]}}),
            false,
        )
        .unwrap();
        let ops: Vec<_> = write.relations[0].2.operations().collect();
        assert_eq!(
            ops,
            vec![
                NestedOperation::Delete,
                NestedOperation::Connect,
                NestedOperation::Disconnect
            ]
        );
    }

    #[test]
    fn test_payload_rejections() {
        let model = users();
        for (payload, creating) in [
            (json!({"posts": {"delete": ["p1"]}}), true),
            (json!({"posts": {"explode": ["p1"]}}), false),
            (json!({"posts": "p1"}), false),
            (json!({"posts": [1, 2]}), true),
            (json!({"team": {"name": "t"}}), true),
        ] {
            assert!(
                matches!(plan(&model, payload.clone(), creating), Err(Error::Validation(_))),
                "{} should be rejected",
                payload
            );
        }
    }

    #[test]
    fn test_authorize_needs_both_gates() {
        let users = users();
        let registry = Registry::builder()
            .model(Model::builder("users").build())
            .model(
                Model::builder("posts")
                    .field("id", FieldKind::String)
                    .field("userId", FieldKind::String)
                    .build(),
            )
            .build()
            .unwrap();

        let write = plan(&users, json!({"posts": [{"title": "x"}]}), true).unwrap();
        let closed = EndpointConfig::new("users");
        assert!(matches!(
            write.authorize(&closed, &registry),
            Err(Error::OperationNotAllowed { .. })
        ));
        let open = EndpointConfig::new("users").nested("posts", NestedWrites::all());
        assert!(write.authorize(&open, &registry).is_ok());

        let write = plan(&users, json!({"posts": {"disconnect": ["p1"]}}), false).unwrap();
        assert!(matches!(
            write.authorize(&open, &registry),
            Err(Error::Validation(_))
        ));
    }
}
