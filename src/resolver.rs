use std::{
    collections::{HashMap, HashSet},
    sync::Arc,
};

use futures::future::try_join_all;
use serde_json::Value;
use tracing::warn;

use crate::{
    adapters::{Adapter, FindOptions},
    context::RequestContext,
    error::Error,
    model::{Model, Registry, RelationDescriptor, RelationKind},
    query::{FilterCondition, Operator},
    record::{Record, canonical},
    scope::{DeletedScope, Scope},
};

/// Related records of one relation, grouped by the canonical join value.
struct Fetched<'a> {
    name: &'a str,
    kind: RelationKind,
    owner_field: &'a str,
    groups: HashMap<String, Vec<Record>>,
}

/// Attach the requested relations to `records`.
///
/// Each relation costs exactly one `find_many` on the target model, whatever
/// the number of base records. The fetches run concurrently; joining happens
/// afterwards in base-record order, so the output does not depend on which
/// fetch finishes first. Related models keep their own tenant and
/// soft-delete policies; deleted related records only appear when the base
/// read asked for deleted records.
pub async fn resolve_includes(
    adapter: &dyn Adapter,
    registry: &Registry,
    model: &Model,
    records: &mut [Record],
    include: &[String],
    ctx: &RequestContext,
    deleted: DeletedScope,
) -> Result<(), Error> {
    if include.is_empty() || records.is_empty() {
        return Ok(());
    }

    let mut relations = Vec::with_capacity(include.len());
    for name in include {
        let relation = model.relation(name).ok_or_else(|| {
            Error::validation(format!(
                "'{}' is not a relation of {}",
                name,
                model.table_name()
            ))
        })?;
        relations.push((name.as_str(), relation, relation.target(registry)?));
    }

    let base: &[Record] = records;
    let fetches = relations.iter().map(|(name, relation, target)| {
        fetch_relation(adapter, model, base, *name, *relation, target, ctx, deleted)
    });
    let fetched = try_join_all(fetches).await?;

    for relation in fetched {
        attach(model, records, relation);
    }
    Ok(())
}

#[allow(clippy::too_many_arguments)]
async fn fetch_relation<'a>(
    adapter: &dyn Adapter,
    model: &'a Model,
    records: &[Record],
    name: &'a str,
    relation: &'a RelationDescriptor,
    target: &Arc<Model>,
    ctx: &RequestContext,
    deleted: DeletedScope,
) -> Result<Fetched<'a>, Error> {
    let owner_field = relation.owner_field(model);
    let target_field = relation.target_field(target);

    let mut seen = HashSet::new();
    let values: Vec<Value> = records
        .iter()
        .filter_map(|r| r.get(owner_field))
        .filter(|v| !v.is_null())
        .filter(|v| seen.insert(canonical(v)))
        .cloned()
        .collect();

    let mut fetched = Fetched {
        name,
        kind: relation.kind,
        owner_field,
        groups: HashMap::new(),
    };
    if values.is_empty() {
        return Ok(fetched);
    }

    let scope = Scope::new(target, ctx, deleted.for_relations())?;
    let conditions = scope.restrict(vec![FilterCondition::new(
        target_field,
        Operator::In,
        Value::Array(values),
    )]);
    let rows = adapter
        .find_many(target, FindOptions::filtered(conditions))
        .await?;

    for mut row in rows {
        let Some(join) = row.get(target_field).filter(|v| !v.is_null()) else {
            continue;
        };
        let join = canonical(join);
        target.apply_computed(&mut row);
        fetched.groups.entry(join).or_default().push(row);
    }
    Ok(fetched)
}

fn attach(model: &Model, records: &mut [Record], relation: Fetched<'_>) {
    for record in records.iter_mut() {
        let matches = match record.get(relation.owner_field) {
            Some(v) if !v.is_null() => relation
                .groups
                .get(&canonical(v))
                .cloned()
                .unwrap_or_default(),
            _ => Vec::new(),
        };

        let value = match relation.kind {
            RelationKind::HasMany => Value::Array(matches.into_iter().map(Value::Object).collect()),
            RelationKind::HasOne | RelationKind::BelongsTo => {
                if matches.len() > 1 {
                    warn!(
                        model = model.table_name(),
                        relation = relation.name,
                        matches = matches.len(),
                        "to-one relation matched several records, keeping the first"
                    );
                }
                matches
                    .into_iter()
                    .next()
                    .map(Value::Object)
                    .unwrap_or(Value::Null)
            }
        };
        record.insert(relation.name.to_string(), value);
    }
}
