use serde_json::Value;

use crate::{error::Error, model::Model, record::canonical};

/// Bind parameter for a rendered fragment.
#[derive(Debug, Clone)]
pub(crate) enum SqlValue {
    Text(String),
    Int(i64),
    Float(f64),
    Bool(bool),
}

/// SQL text with `?` placeholders and the values to bind, in order.
#[derive(Debug, Clone, Default)]
pub(crate) struct SqlFragment {
    pub sql: String,
    pub binds: Vec<SqlValue>,
}

impl SqlFragment {
    pub fn new(sql: impl Into<String>) -> Self {
        Self {
            sql: sql.into(),
            binds: Vec::new(),
        }
    }

    pub fn bind(mut self, value: SqlValue) -> Self {
        self.binds.push(value);
        self
    }

    pub fn bind_text(self, value: impl Into<String>) -> Self {
        self.bind(SqlValue::Text(value.into()))
    }

    /// Parenthesise and join; binds keep their left-to-right order.
    pub fn join(parts: Vec<SqlFragment>, separator: &str) -> Self {
        let mut sql = Vec::with_capacity(parts.len());
        let mut binds = Vec::new();
        for part in parts {
            sql.push(format!("({})", part.sql));
            binds.extend(part.binds);
        }
        Self {
            sql: sql.join(separator),
            binds,
        }
    }

    pub fn append(&mut self, other: SqlFragment) {
        self.sql.push_str(&other.sql);
        self.binds.extend(other.binds);
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ValueKind {
    Number,
    String,
    Bool,
}

pub(crate) fn kind_of(value: &Value) -> Option<ValueKind> {
    match value {
        Value::Number(_) => Some(ValueKind::Number),
        Value::String(_) => Some(ValueKind::String),
        Value::Bool(_) => Some(ValueKind::Bool),
        _ => None,
    }
}

pub(crate) fn number_bind(value: &Value) -> SqlValue {
    match value.as_i64() {
        Some(i) => SqlValue::Int(i),
        None => SqlValue::Float(value.as_f64().unwrap_or_default()),
    }
}

/// Numbers as exact decimal text, for backends that cast to `numeric`.
pub(crate) fn decimal_bind(value: &Value) -> SqlValue {
    SqlValue::Text(canonical(value))
}

/// Rewrite `?` placeholders as `$1, $2, ...`.
pub(crate) fn number_placeholders(sql: &str) -> String {
    let mut out = String::with_capacity(sql.len() + 8);
    let mut n = 0;
    for c in sql.chars() {
        if c == '?' {
            n += 1;
            out.push('$');
            out.push_str(&n.to_string());
        } else {
            out.push(c);
        }
    }
    out
}

/// `%` stays a wildcard; `_` and `\` become literals under `ESCAPE '\'`.
pub(crate) fn escape_like(pattern: &str) -> String {
    let mut out = String::with_capacity(pattern.len());
    for c in pattern.chars() {
        if matches!(c, '_' | '\\') {
            out.push('\\');
        }
        out.push(c);
    }
    out
}

/// Translate a `%`-only pattern into a case-sensitive GLOB pattern.
pub(crate) fn glob_pattern(pattern: &str) -> String {
    let mut out = String::with_capacity(pattern.len());
    for c in pattern.chars() {
        match c {
            '%' => out.push('*'),
            '*' => out.push_str("[*]"),
            '?' => out.push_str("[?]"),
            '[' => out.push_str("[[]"),
            _ => out.push(c),
        }
    }
    out
}

pub(crate) fn write_error(model: &Model, err: sqlx::Error) -> Error {
    match &err {
        sqlx::Error::Database(db) if db.is_unique_violation() => Error::Conflict(format!(
            "{} record with this key already exists",
            model.table_name()
        )),
        _ => err.into(),
    }
}

pub(crate) fn decode_record(data: Value) -> Result<crate::record::Record, Error> {
    match data {
        Value::Object(map) => Ok(map),
        other => Err(Error::Deserialize(format!(
            "stored record is not an object: {}",
            other
        ))),
    }
}
