#![allow(dead_code)]

pub mod suite;

use std::sync::Arc;

use ousia_rest::{
    ComputedField, EndpointConfig, Engine, FieldKind, FilterConfig, Model, MultiTenantPolicy,
    NestedOperation, NestedWrites, Operator, QueryParams, Record, Registry, RelationDescriptor,
    RequestContext, SoftDeletePolicy, UpsertConfig, timestamp_now,
};
use serde_json::{Value, json};

pub fn obj(value: Value) -> Record {
    match value {
        Value::Object(map) => map,
        other => panic!("expected an object, got {}", other),
    }
}

pub fn params(pairs: &[(&str, &str)]) -> QueryParams {
    pairs.iter().copied().collect()
}

pub fn ids(records: &[Record]) -> Vec<String> {
    records
        .iter()
        .map(|r| r["id"].as_str().unwrap_or_default().to_string())
        .collect()
}

pub fn tenant(id: &str) -> RequestContext {
    RequestContext::new().with_value("tenant", json!(id))
}

pub fn registry() -> Arc<Registry> {
    let users = Model::builder("users")
        .field("id", FieldKind::String)
        .field("name", FieldKind::String)
        .nullable_field("email", FieldKind::String)
        .nullable_field("age", FieldKind::Integer)
        .nullable_field("active", FieldKind::Boolean)
        .nullable_field("deletedAt", FieldKind::Timestamp)
        .soft_delete(SoftDeletePolicy::default())
        .computed(
            "label",
            ComputedField::new(&["name", "email"], |r| {
                let name = r.get("name").and_then(Value::as_str).unwrap_or_default();
                match r.get("email").and_then(Value::as_str) {
                    Some(email) => json!(format!("{} <{}>", name, email)),
                    None => json!(name),
                }
            }),
        )
        .relation(
            "posts",
            RelationDescriptor::has_many("posts", "userId").nested_writes(NestedWrites::all()),
        )
        .relation(
            "profile",
            RelationDescriptor::has_one("profiles", "userId").nested_writes(NestedWrites::all()),
        )
        .relation(
            "settings",
            RelationDescriptor::has_many("settings", "userId")
                .nested_writes(NestedWrites::only(&[NestedOperation::Create])),
        )
        .relation(
            "notes",
            RelationDescriptor::has_many("notes", "userId").nested_writes(NestedWrites::all()),
        )
        .build();

    let posts = Model::builder("posts")
        .field("id", FieldKind::String)
        .nullable_field("userId", FieldKind::String)
        .field("title", FieldKind::String)
        .nullable_field("views", FieldKind::Integer)
        .nullable_field("deletedAt", FieldKind::Timestamp)
        .soft_delete(SoftDeletePolicy::default())
        .relation("author", RelationDescriptor::belongs_to("users", "userId"))
        .build();

    let profiles = Model::builder("profiles")
        .field("id", FieldKind::String)
        .field("userId", FieldKind::String)
        .nullable_field("bio", FieldKind::String)
        .build();

    let notes = Model::builder("notes")
        .field("id", FieldKind::Integer)
        .nullable_field("userId", FieldKind::String)
        .field("body", FieldKind::String)
        .build();

    let settings = Model::builder("settings")
        .primary_key(["userId", "key"])
        .field("userId", FieldKind::String)
        .field("key", FieldKind::String)
        .nullable_field("value", FieldKind::Json)
        .nullable_field("createdAt", FieldKind::Timestamp)
        .nullable_field("updatedAt", FieldKind::Timestamp)
        .build();

    let projects = Model::builder("projects")
        .field("id", FieldKind::String)
        .field("orgId", FieldKind::String)
        .field("name", FieldKind::String)
        .multi_tenant(MultiTenantPolicy::from_context("orgId", "tenant"))
        .relation(
            "tasks",
            RelationDescriptor::has_many("tasks", "projectId").nested_writes(NestedWrites::all()),
        )
        .build();

    let tasks = Model::builder("tasks")
        .field("id", FieldKind::String)
        .field("orgId", FieldKind::String)
        .nullable_field("projectId", FieldKind::String)
        .field("title", FieldKind::String)
        .multi_tenant(MultiTenantPolicy::from_context("orgId", "tenant"))
        .build();

    Registry::builder()
        .model(users)
        .model(posts)
        .model(profiles)
        .model(settings)
        .model(notes)
        .model(projects)
        .model(tasks)
        .build()
        .unwrap()
}

pub fn users_endpoint() -> EndpointConfig {
    EndpointConfig::new("users")
        .filters(
            FilterConfig::new()
                .field_all("name")
                .field_all("email")
                .field_all("age")
                .field("active", &[Operator::Eq]),
        )
        .sortable(&["age", "name"])
        .includes(&["posts", "profile", "settings", "notes"])
        .nested("posts", NestedWrites::all())
        .nested("profile", NestedWrites::all())
        .nested("settings", NestedWrites::all())
        .nested("notes", NestedWrites::all())
        .per_page(20, 50)
}

pub fn posts_endpoint() -> EndpointConfig {
    EndpointConfig::new("posts")
        .filters(FilterConfig::new().field_all("userId").field_all("views"))
        .includes(&["author"])
}

pub fn settings_endpoint() -> EndpointConfig {
    EndpointConfig::new("settings").upsert(
        UpsertConfig::default()
            .keys(&["userId", "key"])
            .create_only(&["createdAt"])
            .max_batch_size(3)
            .before_item(|mut data, _index, is_create| {
                let now = timestamp_now();
                if is_create {
                    data.insert("createdAt".to_string(), now.clone());
                }
                data.insert("updatedAt".to_string(), now);
                Ok(data)
            }),
    )
}

pub fn projects_endpoint() -> EndpointConfig {
    EndpointConfig::new("projects")
        .includes(&["tasks"])
        .nested("tasks", NestedWrites::all())
}

/// Four users, four posts and one profile.
pub async fn seed(engine: &Engine) {
    let ctx = RequestContext::new();
    let users = users_endpoint();
    for user in [
        json!({"id": "u1", "name": "Ada", "email": "ada@example.com", "age": 36, "active": true}),
        json!({"id": "u2", "name": "Grace", "email": "grace@navy.mil", "age": 45, "active": false}),
        json!({"id": "u3", "name": "Linus", "email": null, "age": null, "active": true}),
        json!({"id": "u4", "name": "Barbara", "email": "barbara@example.com", "age": 30, "active": true}),
    ] {
        engine.create(&users, &ctx, obj(user)).await.unwrap();
    }

    let posts = posts_endpoint();
    for post in [
        json!({"id": "p1", "userId": "u1", "title": "Hello", "views": 10}),
        json!({"id": "p2", "userId": "u1", "title": "World", "views": 5}),
        json!({"id": "p3", "userId": "u2", "title": "Compilers", "views": 7}),
        json!({"id": "p4", "userId": null, "title": "Orphan"}),
    ] {
        engine.create(&posts, &ctx, obj(post)).await.unwrap();
    }

    engine
        .update(
            &users,
            &ctx,
            vec![json!("u1")],
            obj(json!({"profile": {"id": "pr1", "bio": "math"}})),
        )
        .await
        .unwrap();
}
