use chrono::Utc;
use serde_json::Value;
use sqlx::{
    Row, Sqlite, SqliteConnection,
    query::{Query as SqlxQuery, QueryScalar},
    sqlite::{SqliteArguments, SqliteRow},
};

use crate::{
    adapters::{
        FindOptions, storage_key,
        sql::{SqlFragment, SqlValue, ValueKind, decode_record, glob_pattern, kind_of, number_bind, write_error},
    },
    error::Error,
    model::Model,
    query::{Comparison, FilterCondition, FilterEngine, LikeMode, OrderBy, PredicateBuilder},
    record::{Record, derive_storage_key, merge},
};

/// JSON path for a top-level field, bound as a parameter.
fn path(field: &str) -> String {
    format!("$.\"{}\"", field.replace('"', "\\\""))
}

fn type_guard(kind: ValueKind) -> &'static str {
    match kind {
        ValueKind::Number => "json_type(r.data, ?) IN ('integer', 'real')",
        ValueKind::String => "json_type(r.data, ?) = 'text'",
        ValueKind::Bool => "json_type(r.data, ?) IN ('true', 'false')",
    }
}

fn value_bind(kind: ValueKind, value: &Value) -> SqlValue {
    match kind {
        ValueKind::Number => number_bind(value),
        ValueKind::String => SqlValue::Text(value.as_str().unwrap_or_default().to_string()),
        // json_extract yields 1/0 for JSON booleans
        ValueKind::Bool => SqlValue::Int(i64::from(value.as_bool().unwrap_or_default())),
    }
}

/// Predicates over `json_extract(r.data, path)`. A comparison only matches
/// a stored value of the same JSON kind; null and absent never match.
pub(super) struct SqlitePredicates;

impl PredicateBuilder for SqlitePredicates {
    type Predicate = SqlFragment;

    fn always(&self) -> SqlFragment {
        SqlFragment::new("1 = 1")
    }

    fn compare(&self, field: &str, op: Comparison, value: &Value) -> SqlFragment {
        let Some(kind) = kind_of(value) else {
            return SqlFragment::new("1 = 0");
        };
        SqlFragment::new(format!(
            "{} AND json_extract(r.data, ?) {} ?",
            type_guard(kind),
            op.sql()
        ))
        .bind_text(path(field))
        .bind_text(path(field))
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
        let mut out = SqlFragment::new("json_extract(r.data, ?) IS NOT NULL AND NOT (")
            .bind_text(path(field));
        out.append(any);
        out.sql.push(')');
        out
    }

    fn like(&self, field: &str, pattern: &str, mode: LikeMode) -> SqlFragment {
        // Built-in lower() folds ASCII only, matching the pattern's folding.
        let target = match mode {
            LikeMode::Sensitive => "json_extract(r.data, ?)",
            LikeMode::Lowered => "lower(json_extract(r.data, ?))",
        };
        SqlFragment::new(format!(
            "{} AND {} GLOB ?",
            type_guard(ValueKind::String),
            target
        ))
        .bind_text(path(field))
        .bind_text(path(field))
        .bind_text(glob_pattern(pattern))
    }

    fn null(&self, field: &str, is_null: bool) -> SqlFragment {
        let test = if is_null { "IS NULL" } else { "IS NOT NULL" };
        SqlFragment::new(format!("json_extract(r.data, ?) {}", test)).bind_text(path(field))
    }

    fn and(&self, parts: Vec<SqlFragment>) -> SqlFragment {
        SqlFragment::join(parts, " AND ")
    }
}

fn build_where(model: &Model, conditions: &[FilterCondition]) -> Result<SqlFragment, Error> {
    let mut out = SqlFragment::new("WHERE r.model = ? AND (").bind_text(model.table_name());
    out.append(FilterEngine::render(conditions, &SqlitePredicates)?);
    out.sql.push(')');
    Ok(out)
}

fn build_order_clause(model: &Model, order_by: &[OrderBy]) -> SqlFragment {
    let mut terms = Vec::new();
    let mut binds = Vec::new();
    for order in order_by {
        terms.push(format!("json_extract(r.data, ?) {}", order.direction.sql()));
        binds.push(SqlValue::Text(path(&order.field)));
    }
    for pk in model.primary_keys() {
        terms.push("json_extract(r.data, ?) ASC NULLS FIRST".to_string());
        binds.push(SqlValue::Text(path(pk)));
    }
    SqlFragment {
        sql: format!("ORDER BY {}", terms.join(", ")),
        binds,
    }
}

fn query_bind_values<'q>(
    mut query: SqlxQuery<'q, Sqlite, SqliteArguments<'q>>,
    binds: Vec<SqlValue>,
) -> SqlxQuery<'q, Sqlite, SqliteArguments<'q>> {
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
    mut query: QueryScalar<'q, Sqlite, O, SqliteArguments<'q>>,
    binds: Vec<SqlValue>,
) -> QueryScalar<'q, Sqlite, O, SqliteArguments<'q>> {
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

fn map_row_to_record(row: SqliteRow) -> Result<Record, Error> {
    let data = row
        .try_get::<String, _>("data")
        .map_err(|e| Error::Deserialize(e.to_string()))?;
    let data: Value = serde_json::from_str(&data)?;
    decode_record(data)
}

fn encode(data: &Record) -> Result<String, Error> {
    serde_json::to_string(data).map_err(|e| Error::Serialize(e.to_string()))
}

// ── Connection-level operations shared by the pool and transactions ─────────

pub(super) async fn find_many(
    conn: &mut SqliteConnection,
    model: &Model,
    options: &FindOptions,
) -> Result<Vec<Record>, Error> {
    let mut stmt = SqlFragment::new("SELECT r.data FROM records r ");
    stmt.append(build_where(model, &options.conditions)?);
    stmt.sql.push(' ');
    stmt.append(build_order_clause(model, &options.order_by));
    match options.take {
        Some(take) => stmt.sql.push_str(&format!(" LIMIT {}", take)),
        None => stmt.sql.push_str(" LIMIT -1"),
    }
    stmt.sql.push_str(&format!(" OFFSET {}", options.skip));

    let rows = query_bind_values(sqlx::query(&stmt.sql), stmt.binds)
        .fetch_all(&mut *conn)
        .await?;
    rows.into_iter().map(map_row_to_record).collect()
}

pub(super) async fn count(
    conn: &mut SqliteConnection,
    model: &Model,
    conditions: &[FilterCondition],
) -> Result<u64, Error> {
    let mut stmt = SqlFragment::new("SELECT COUNT(*) FROM records r ");
    stmt.append(build_where(model, conditions)?);

    let count: i64 = query_scalar_bind_values(sqlx::query_scalar(&stmt.sql), stmt.binds)
        .fetch_one(&mut *conn)
        .await?;
    Ok(count as u64)
}

pub(super) async fn find_by_key(
    conn: &mut SqliteConnection,
    model: &Model,
    key: &[Value],
) -> Result<Option<Record>, Error> {
    let row = sqlx::query("SELECT r.data FROM records r WHERE r.model = ? AND r.key = ?")
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
    conn: &mut SqliteConnection,
    model: &Model,
    data: Record,
) -> Result<Record, Error> {
    let key = storage_key(model, &data)?;
    let now = Utc::now().to_rfc3339();
    sqlx::query(
        r#"
        INSERT INTO records (model, key, data, created_at, updated_at)
        VALUES (?, ?, ?, ?, ?)
        "#,
    )
    .bind(model.table_name())
    .bind(derive_storage_key(model.table_name(), &key))
    .bind(encode(&data)?)
    .bind(&now)
    .bind(&now)
    .execute(&mut *conn)
    .await
    .map_err(|e| write_error(model, e))?;
    Ok(data)
}

/// SQLite has no JSON merge that keeps explicit nulls, so the merge happens
/// here between a read and a write on the same connection.
pub(super) async fn update(
    conn: &mut SqliteConnection,
    model: &Model,
    key: &[Value],
    data: Record,
) -> Result<Record, Error> {
    let mut record = find_by_key(conn, model, key)
        .await?
        .ok_or(Error::NotFound)?;
    merge(&mut record, &data);
    let new_key = storage_key(model, &record)?;

    sqlx::query(
        r#"
        UPDATE records
        SET key = ?, data = ?, updated_at = ?
        WHERE model = ? AND key = ?
        "#,
    )
    .bind(derive_storage_key(model.table_name(), &new_key))
    .bind(encode(&record)?)
    .bind(Utc::now().to_rfc3339())
    .bind(model.table_name())
    .bind(derive_storage_key(model.table_name(), key))
    .execute(&mut *conn)
    .await
    .map_err(|e| write_error(model, e))?;
    Ok(record)
}

pub(super) async fn delete(
    conn: &mut SqliteConnection,
    model: &Model,
    key: &[Value],
) -> Result<(), Error> {
    let result = sqlx::query("DELETE FROM records WHERE model = ? AND key = ?")
        .bind(model.table_name())
        .bind(derive_storage_key(model.table_name(), key))
        .execute(&mut *conn)
        .await?;

    if result.rows_affected() == 0 {
        return Err(Error::NotFound);
    }
    Ok(())
}
