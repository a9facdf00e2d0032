use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::{
    error::Error,
    model::{Model, parse_bool},
    record::compare_values,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Operator {
    Eq,
    Ne,
    Gt,
    Gte,
    Lt,
    Lte,
    In,
    Nin,
    Like,
    Ilike,
    Between,
    Null,
}

impl Operator {
    pub const ALL: [Operator; 12] = [
        Operator::Eq,
        Operator::Ne,
        Operator::Gt,
        Operator::Gte,
        Operator::Lt,
        Operator::Lte,
        Operator::In,
        Operator::Nin,
        Operator::Like,
        Operator::Ilike,
        Operator::Between,
        Operator::Null,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Operator::Eq => "eq",
            Operator::Ne => "ne",
            Operator::Gt => "gt",
            Operator::Gte => "gte",
            Operator::Lt => "lt",
            Operator::Lte => "lte",
            Operator::In => "in",
            Operator::Nin => "nin",
            Operator::Like => "like",
            Operator::Ilike => "ilike",
            Operator::Between => "between",
            Operator::Null => "null",
        }
    }

    pub fn parse(raw: &str) -> Result<Self, Error> {
        Self::ALL
            .into_iter()
            .find(|op| op.as_str() == raw)
            .ok_or_else(|| Error::validation(format!("unknown filter operator '{}'", raw)))
    }
}

/// Scalar comparisons handed to a `PredicateBuilder`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Comparison {
    Eq,
    Ne,
    Gt,
    Gte,
    Lt,
    Lte,
}

impl Comparison {
    pub fn sql(&self) -> &'static str {
        match self {
            Comparison::Eq => "=",
            Comparison::Ne => "<>",
            Comparison::Gt => ">",
            Comparison::Gte => ">=",
            Comparison::Lt => "<",
            Comparison::Lte => "<=",
        }
    }
}

/// One `field operator value` constraint on a read.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FilterCondition {
    pub field: String,
    pub operator: Operator,
    pub value: Value,
}

impl FilterCondition {
    pub fn new(field: impl Into<String>, operator: Operator, value: Value) -> Self {
        Self {
            field: field.into(),
            operator,
            value,
        }
    }

    pub fn eq(field: impl Into<String>, value: Value) -> Self {
        Self::new(field, Operator::Eq, value)
    }

    pub fn is_null(field: impl Into<String>, null: bool) -> Self {
        Self::new(field, Operator::Null, Value::Bool(null))
    }

    /// Check the value against the operator's shape constraint.
    pub fn validate(&self) -> Result<(), Error> {
        let bad = |why: &str| {
            Err(Error::validation(format!(
                "filter '{}[{}]': {}",
                self.field,
                self.operator.as_str(),
                why
            )))
        };
        if self.field.is_empty() {
            return bad("field name is empty");
        }
        match self.operator {
            Operator::Between => match &self.value {
                Value::Array(items) if items.len() == 2 => {
                    if compare_values(&items[0], &items[1]).is_none() {
                        return bad("bounds must be two comparable values");
                    }
                    Ok(())
                }
                _ => bad("expects exactly two values"),
            },
            Operator::In | Operator::Nin => match &self.value {
                Value::Array(items) if !items.is_empty() => {
                    if items.iter().any(|v| !is_scalar(v)) {
                        return bad("list items must be scalar values");
                    }
                    Ok(())
                }
                _ => bad("expects a non-empty list"),
            },
            Operator::Null => match self.value {
                Value::Bool(_) => Ok(()),
                _ => bad("expects true or false"),
            },
            Operator::Like | Operator::Ilike => match self.value {
                Value::String(_) => Ok(()),
                _ => bad("expects a string pattern"),
            },
            _ => {
                if is_scalar(&self.value) {
                    Ok(())
                } else {
                    bad("expects a scalar value")
                }
            }
        }
    }
}

fn is_scalar(value: &Value) -> bool {
    matches!(value, Value::String(_) | Value::Number(_) | Value::Bool(_))
}

/// Raw query parameters as produced by the HTTP layer, in request order.
#[derive(Debug, Clone, Default)]
pub struct QueryParams(Vec<(String, String)>);

impl QueryParams {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.0.push((key.into(), value.into()));
        self
    }

    /// Last value wins for scalar parameters.
    pub fn get(&self, key: &str) -> Option<&str> {
        self.0
            .iter()
            .rev()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }
}

impl<K: Into<String>, V: Into<String>> FromIterator<(K, V)> for QueryParams {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        Self(
            iter.into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        )
    }
}

/// Per-endpoint allow-list of filterable fields and their operators.
#[derive(Debug, Clone, Default)]
pub struct FilterConfig {
    fields: HashMap<String, Vec<Operator>>,
}

impl FilterConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn field(mut self, field: impl Into<String>, operators: &[Operator]) -> Self {
        self.fields.insert(field.into(), operators.to_vec());
        self
    }

    pub fn field_all(self, field: impl Into<String>) -> Self {
        self.field(field, &Operator::ALL)
    }

    pub fn allows(&self, field: &str, operator: Operator) -> bool {
        self.fields
            .get(field)
            .is_some_and(|ops| ops.contains(&operator))
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    #[default]
    Asc,
    Desc,
}

impl Direction {
    pub fn parse(raw: &str) -> Result<Self, Error> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "asc" => Ok(Direction::Asc),
            "desc" => Ok(Direction::Desc),
            _ => Err(Error::validation(format!(
                "orderDirection must be 'asc' or 'desc', got '{}'",
                raw
            ))),
        }
    }

    pub fn sql(&self) -> &'static str {
        match self {
            Direction::Asc => "ASC NULLS FIRST",
            Direction::Desc => "DESC NULLS LAST",
        }
    }
}

/// Sort key. Nulls sort first ascending and last descending.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OrderBy {
    pub field: String,
    pub direction: Direction,
}

impl OrderBy {
    pub fn asc(field: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            direction: Direction::Asc,
        }
    }

    pub fn desc(field: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            direction: Direction::Desc,
        }
    }
}

/// Case handling for `like` rendering.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LikeMode {
    /// Case-sensitive match.
    Sensitive,
    /// Fold ASCII `A-Z` of the stored value to lower case; the pattern is
    /// already folded. Non-ASCII characters compare as-is on every backend.
    Lowered,
}

/// Backend-specific rendering of individual predicates. The filter engine
/// owns operator semantics and only asks the builder for primitives.
pub trait PredicateBuilder {
    type Predicate;

    /// Predicate matching every record.
    fn always(&self) -> Self::Predicate;

    fn compare(&self, field: &str, op: Comparison, value: &Value) -> Self::Predicate;

    fn in_list(&self, field: &str, values: &[Value], negated: bool) -> Self::Predicate;

    /// `%` is the only wildcard; every other character matches literally.
    fn like(&self, field: &str, pattern: &str, mode: LikeMode) -> Self::Predicate;

    fn null(&self, field: &str, is_null: bool) -> Self::Predicate;

    fn and(&self, parts: Vec<Self::Predicate>) -> Self::Predicate;
}

pub struct FilterEngine;

impl FilterEngine {
    /// Parse `filter[field][op]=value` (and `filter[field]=value` as `eq`)
    /// parameters into checked conditions.
    pub fn parse(
        params: &QueryParams,
        model: &Model,
        config: &FilterConfig,
    ) -> Result<Vec<FilterCondition>, Error> {
        let mut conditions = Vec::new();
        for (key, raw) in params.iter() {
            if !key.starts_with("filter[") {
                continue;
            }
            let Some((field, op)) = split_filter_key(key) else {
                return Err(Error::validation(format!("malformed filter parameter '{}'", key)));
            };
            let operator = match op {
                Some(op) => Operator::parse(op)?,
                None => Operator::Eq,
            };
            let condition = FilterCondition {
                field: field.to_string(),
                operator,
                value: parse_value(model, field, operator, raw)?,
            };
            conditions.push(condition);
        }
        Self::check(&conditions, config)?;
        Ok(conditions)
    }

    /// Validate conditions built elsewhere against the allow-list and the
    /// operator shape rules.
    pub fn check(conditions: &[FilterCondition], config: &FilterConfig) -> Result<(), Error> {
        for condition in conditions {
            if !config.allows(&condition.field, condition.operator) {
                return Err(Error::validation(format!(
                    "filtering '{}' with '{}' is not allowed",
                    condition.field,
                    condition.operator.as_str()
                )));
            }
            condition.validate()?;
        }
        Ok(())
    }

    /// Render conditions through an adapter's predicate builder. All
    /// conditions are conjoined, including several on the same field.
    pub fn render<B: PredicateBuilder>(
        conditions: &[FilterCondition],
        builder: &B,
    ) -> Result<B::Predicate, Error> {
        let mut parts = Vec::with_capacity(conditions.len());
        for condition in conditions {
            condition.validate()?;
            parts.push(Self::render_one(condition, builder));
        }
        if parts.is_empty() {
            return Ok(builder.always());
        }
        Ok(builder.and(parts))
    }

    fn render_one<B: PredicateBuilder>(condition: &FilterCondition, builder: &B) -> B::Predicate {
        let field = condition.field.as_str();
        let value = &condition.value;
        match condition.operator {
            Operator::Eq => builder.compare(field, Comparison::Eq, value),
            Operator::Ne => builder.compare(field, Comparison::Ne, value),
            Operator::Gt => builder.compare(field, Comparison::Gt, value),
            Operator::Gte => builder.compare(field, Comparison::Gte, value),
            Operator::Lt => builder.compare(field, Comparison::Lt, value),
            Operator::Lte => builder.compare(field, Comparison::Lte, value),
            Operator::In => builder.in_list(field, as_slice(value), false),
            Operator::Nin => builder.in_list(field, as_slice(value), true),
            Operator::Like => builder.like(field, value.as_str().unwrap_or_default(), LikeMode::Sensitive),
            Operator::Ilike => builder.like(
                field,
                &value.as_str().unwrap_or_default().to_ascii_lowercase(),
                LikeMode::Lowered,
            ),
            Operator::Between => {
                let bounds = as_slice(value);
                builder.and(vec![
                    builder.compare(field, Comparison::Gte, &bounds[0]),
                    builder.compare(field, Comparison::Lte, &bounds[1]),
                ])
            }
            Operator::Null => builder.null(field, value.as_bool().unwrap_or(true)),
        }
    }
}

fn as_slice(value: &Value) -> &[Value] {
    value.as_array().map(Vec::as_slice).unwrap_or_default()
}

fn split_filter_key(key: &str) -> Option<(&str, Option<&str>)> {
    let rest = key.strip_prefix("filter[")?;
    let (field, rest) = rest.split_once(']')?;
    if field.is_empty() {
        return None;
    }
    if rest.is_empty() {
        return Some((field, None));
    }
    let op = rest.strip_prefix('[')?.strip_suffix(']')?;
    Some((field, Some(op)))
}

fn parse_value(model: &Model, field: &str, operator: Operator, raw: &str) -> Result<Value, Error> {
    match operator {
        Operator::Like | Operator::Ilike => Ok(Value::String(raw.to_string())),
        Operator::Null => parse_bool(raw).map(Value::Bool).ok_or_else(|| {
            Error::validation(format!("filter '{}[null]' expects true or false", field))
        }),
        Operator::Between => {
            let parts: Vec<&str> = raw.split(',').collect();
            if parts.len() != 2 {
                return Err(Error::validation(format!(
                    "filter '{}[between]' expects exactly two values",
                    field
                )));
            }
            let bounds = parts
                .into_iter()
                .map(|p| model.coerce(field, p.trim()))
                .collect::<Result<Vec<_>, _>>()?;
            Ok(Value::Array(bounds))
        }
        Operator::In | Operator::Nin => {
            let items = raw
                .split(',')
                .map(str::trim)
                .filter(|p| !p.is_empty())
                .map(|p| model.coerce(field, p))
                .collect::<Result<Vec<_>, _>>()?;
            Ok(Value::Array(items))
        }
        _ => model.coerce(field, raw),
    }
}
