use serde_json::Value;
use sqlx::{
    PgConnection, Postgres, Row,
    postgres::{PgArguments, PgRow},
    query::{Query as PgQuery, QueryScalar},
};

use crate::{
    adapters::{
        FindOptions, storage_key,
        sql::{
            SqlFragment, SqlValue, ValueKind, decimal_bind, decode_record, escape_like, kind_of,
            number_placeholders, write_error,
        },
    },
    error::Error,
    model::Model,
    query::{Comparison, FilterCondition, FilterEngine, LikeMode, OrderBy, PredicateBuilder},
    record::{Record, derive_storage_key, merge},
};

/// Comparison rendered through `CASE` so that the cast only runs on values
/// of the matching JSON kind.
fn guarded(kind: ValueKind, op: &str) -> String {
    let (json_type, lhs, rhs) = match kind {
        ValueKind::Number => ("number", "(r.data->>(?::text))::numeric", "(?::text)::numeric"),
        ValueKind::String => ("string", "(r.data->>(?::text)) COLLATE \"C\"", "?::text"),
        ValueKind::Bool => ("boolean", "(r.data->>(?::text))::boolean", "?::boolean"),
    };
    format!(
        "CASE WHEN jsonb_typeof(r.data->(?::text)) = '{}' THEN {} {} {} ELSE FALSE END",
        json_type, lhs, op, rhs
    )
}

fn value_bind(kind: ValueKind, value: &Value) -> SqlValue {
    match kind {
        ValueKind::Number => decimal_bind(value),
        ValueKind::String => SqlValue::Text(value.as_str().unwrap_or_default().to_string()),
        ValueKind::Bool => SqlValue::Bool(value.as_bool().unwrap_or_default()),
    }
}

/// Predicates over `r.data->field`. `ilike` folds only `A-Z` through
/// `translate`, since `lower` and `ILIKE` follow the database locale.
pub(super) struct PgPredicates;

impl PredicateBuilder for PgPredicates {
    type Predicate = SqlFragment;

    fn always(&self) -> SqlFragment {
        SqlFragment::new("TRUE")
    }

    fn compare(&self, field: &str, op: Comparison, value: &Value) -> SqlFragment {
        let Some(kind) = kind_of(value) else {
            return SqlFragment::new("FALSE");
        };
        SqlFragment::new(guarded(kind, op.sql()))
            .bind_text(field)
            .bind_text(field)
            .bind(value_bind(kind, value))
    }

    fn in_list(&self, field: &str, values: &[Value], negated: bool) -> SqlFragment {
        let any = SqlFragment::join(
            values
                .iter()
                .map(|v| self.compare(field, Comparison::Eq, v))
                .collect(),
            " OR ",
        );
        if !negated {
            return any;
        }
        let mut out =
            SqlFragment::new("COALESCE(jsonb_typeof(r.data->(?::text)), 'null') <> 'null' AND NOT (")
                .bind_text(field);
        out.append(any);
        out.sql.push(')');
        out
    }

    fn like(&self, field: &str, pattern: &str, mode: LikeMode) -> SqlFragment {
        let lhs = match mode {
            LikeMode::Sensitive => "r.data->>(?::text)",
            LikeMode::Lowered => {
                "translate(r.data->>(?::text), 'ABCDEFGHIJKLMNOPQRSTUVWXYZ', 'abcdefghijklmnopqrstuvwxyz')"
            }
        };
        SqlFragment::new(format!(
            "CASE WHEN jsonb_typeof(r.data->(?::text)) = 'string' THEN {} LIKE ?::text ESCAPE '\\' ELSE FALSE END",
            lhs
        ))
        .bind_text(field)
        .bind_text(field)
        .bind_text(escape_like(pattern))
    }

    fn null(&self, field: &str, is_null: bool) -> SqlFragment {
        let test = if is_null { "=" } else { "<>" };
        SqlFragment::new(format!(
            "COALESCE(jsonb_typeof(r.data->(?::text)), 'null') {} 'null'",
            test
        ))
        .bind_text(field)
    }

    fn and(&self, parts: Vec<SqlFragment>) -> SqlFragment {
        SqlFragment::join(parts, " AND ")
    }
}

fn build_where(model: &Model, conditions: &[FilterCondition]) -> Result<SqlFragment, Error> {
    let mut out = SqlFragment::new("WHERE r.model = ? AND (").bind_text(model.table_name());
    out.append(FilterEngine::render(conditions, &PgPredicates)?);
    out.sql.push(')');
    Ok(out)
}

/// JSON null and a missing key sort together. The first term ranks by jsonb
/// kind and value with every string collapsed to `""`; the second orders
/// strings bytewise, as the string comparison filters do.
fn push_order_terms(terms: &mut Vec<String>, binds: &mut Vec<SqlValue>, field: &str, dir: &str) {
    terms.push(format!(
        "CASE WHEN jsonb_typeof(r.data->(?::text)) = 'string' THEN '\"\"'::jsonb \
         ELSE NULLIF(r.data->(?::text), 'null'::jsonb) END {}",
        dir
    ));
    terms.push(format!(
        "CASE WHEN jsonb_typeof(r.data->(?::text)) = 'string' \
         THEN (r.data->>(?::text)) COLLATE \"C\" END {}",
        dir
    ));
    for _ in 0..4 {
        binds.push(SqlValue::Text(field.to_string()));
    }
}

fn build_order_clause(model: &Model, order_by: &[OrderBy]) -> SqlFragment {
    let mut terms = Vec::new();
    let mut binds = Vec::new();
    for order in order_by {
        push_order_terms(&mut terms, &mut binds, &order.field, order.direction.sql());
    }
    for pk in model.primary_keys() {
        push_order_terms(&mut terms, &mut binds, pk, "ASC NULLS FIRST");
    }
    SqlFragment {
        sql: format!("ORDER BY {}", terms.join(", ")),
        binds,
    }
}

fn query_bind_values<'q>(
    mut query: PgQuery<'q, Postgres, PgArguments>,
    binds: Vec<SqlValue>,
) -> PgQuery<'q, Postgres, PgArguments> {
    for value in binds {
        query = match value {
            SqlValue::Text(s) => query.bind(s),
            SqlValue::Int(i) => query.bind(i),
            SqlValue::Float(f) => query.bind(f),
            SqlValue::Bool(b) => query.bind(b),
        };
    }
    query
}

fn query_scalar_bind_values<'q, O>(
    mut query: QueryScalar<'q, Postgres, O, PgArguments>,
    binds: Vec<SqlValue>,
) -> QueryScalar<'q, Postgres, O, PgArguments> {
    for value in binds {
        query = match value {
            SqlValue::Text(s) => query.bind(s),
            SqlValue::Int(i) => query.bind(i),
            SqlValue::Float(f) => query.bind(f),
            SqlValue::Bool(b) => query.bind(b),
        };
    }
    query
}

fn map_row_to_record(row: PgRow) -> Result<Record, Error> {
    let data: Value = row
        .try_get("data")
        .map_err(|e| Error::Deserialize(e.to_string()))?;
    decode_record(data)
}

// ── Connection-level operations shared by the pool and transactions ─────────

pub(super) async fn find_many(
    conn: &mut PgConnection,
    model: &Model,
    options: &FindOptions,
) -> Result<Vec<Record>, Error> {
    let mut stmt = SqlFragment::new("SELECT r.data FROM records r ");
    stmt.append(build_where(model, &options.conditions)?);
    stmt.sql.push(' ');
    stmt.append(build_order_clause(model, &options.order_by));
    if let Some(take) = options.take {
        stmt.sql.push_str(&format!(" LIMIT {}", take));
    }
    stmt.sql.push_str(&format!(" OFFSET {}", options.skip));

    let sql = number_placeholders(&stmt.sql);
    let rows = query_bind_values(sqlx::query(&sql), stmt.binds)
        .fetch_all(&mut *conn)
        .await?;
    rows.into_iter().map(map_row_to_record).collect()
}

pub(super) async fn count(
    conn: &mut PgConnection,
    model: &Model,
    conditions: &[FilterCondition],
) -> Result<u64, Error> {
    let mut stmt = SqlFragment::new("SELECT COUNT(*) FROM records r ");
    stmt.append(build_where(model, conditions)?);

    let sql = number_placeholders(&stmt.sql);
    let count: i64 = query_scalar_bind_values(sqlx::query_scalar(&sql), stmt.binds)
        .fetch_one(&mut *conn)
        .await?;
    Ok(count as u64)
}

pub(super) async fn find_by_key(
    conn: &mut PgConnection,
    model: &Model,
    key: &[Value],
    for_update: bool,
) -> Result<Option<Record>, Error> {
    let sql = if for_update {
        "SELECT r.data FROM records r WHERE r.model = $1 AND r.key = $2 FOR UPDATE"
    } else {
        "SELECT r.data FROM records r WHERE r.model = $1 AND r.key = $2"
    };
    let row = sqlx::query(sql)
        .bind(model.table_name())
        .bind(derive_storage_key(model.table_name(), key))
        .fetch_optional(&mut *conn)
        .await?;

    match row {
        Some(r) => map_row_to_record(r).map(Some),
        None => Ok(None),
    }
}

pub(super) async fn insert(
    conn: &mut PgConnection,
    model: &Model,
    data: Record,
) -> Result<Record, Error> {
    let key = storage_key(model, &data)?;
    sqlx::query(
        r#"
        INSERT INTO records (model, key, data, created_at, updated_at)
        VALUES ($1, $2, $3, now(), now())
        "#,
    )
    .bind(model.table_name())
    .bind(derive_storage_key(model.table_name(), &key))
    .bind(Value::Object(data.clone()))
    .execute(&mut *conn)
    .await
    .map_err(|e| write_error(model, e))?;
    Ok(data)
}

/// `jsonb ||` would do the merge, but the primary key may move with it, so
/// the row is locked, merged here and re-keyed.
pub(super) async fn update(
    conn: &mut PgConnection,
    model: &Model,
    key: &[Value],
    data: Record,
) -> Result<Record, Error> {
    let mut record = find_by_key(conn, model, key, true)
        .await?
        .ok_or(Error::NotFound)?;
    merge(&mut record, &data);
    let new_key = storage_key(model, &record)?;

    sqlx::query(
        r#"
        UPDATE records
        SET key = $1, data = $2, updated_at = now()
        WHERE model = $3 AND key = $4
        "#,
    )
    .bind(derive_storage_key(model.table_name(), &new_key))
    .bind(Value::Object(record.clone()))
    .bind(model.table_name())
    .bind(derive_storage_key(model.table_name(), key))
    .execute(&mut *conn)
    .await
    .map_err(|e| write_error(model, e))?;
    Ok(record)
}

pub(super) async fn delete(
    conn: &mut PgConnection,
    model: &Model,
    key: &[Value],
) -> Result<(), Error> {
    let result = sqlx::query("DELETE FROM records WHERE model = $1 AND key = $2")
        .bind(model.table_name())
        .bind(derive_storage_key(model.table_name(), key))
        .execute(&mut *conn)
        .await?;

    if result.rows_affected() == 0 {
        return Err(Error::NotFound);
    }
    Ok(())
}
