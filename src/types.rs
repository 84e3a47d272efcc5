use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use rusqlite::types::{FromSql, FromSqlError, FromSqlResult, ToSql, ToSqlOutput, ValueRef};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Number, Value};

use crate::error::{CatalogError, Result};

/// Rendered by `compare` for a field a product has no value for.
pub const NOT_AVAILABLE: &str = "N/A";

/// Declared type of a product field. Stored in `field_definition.field_type`
/// by its lowercase name.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FieldType {
    Text,
    Integer,
    Real,
    /// Currency amount held as an integer number of cents.
    Cents,
}

impl FieldType {
    pub fn as_str(&self) -> &'static str {
        match self {
            FieldType::Text => "text",
            FieldType::Integer => "integer",
            FieldType::Real => "real",
            FieldType::Cents => "cents",
        }
    }

    /// Column type used in the product table.
    pub fn sql_type(&self) -> &'static str {
        match self {
            FieldType::Text => "TEXT",
            FieldType::Integer | FieldType::Cents => "INTEGER",
            FieldType::Real => "REAL",
        }
    }

    /// Converts an incoming JSON value to this type. `Null` passes through;
    /// whether null is acceptable is decided by the field definition.
    pub fn coerce(&self, field: &str, value: &Value) -> Result<Value> {
        let invalid = |reason: &str| CatalogError::invalid_value(field, reason);
        match (self, value) {
            (_, Value::Null) => Ok(Value::Null),
            (FieldType::Text, Value::String(_)) => Ok(value.clone()),
            (FieldType::Text, Value::Number(n)) => Ok(Value::String(n.to_string())),
            (FieldType::Text, Value::Bool(b)) => Ok(Value::String(b.to_string())),
            (_, Value::String(s)) if s.trim().is_empty() => Ok(Value::Null),
            (FieldType::Integer, Value::Number(n)) => integral(n)
                .map(Value::from)
                .ok_or_else(|| invalid("expected a whole number")),
            (FieldType::Integer, Value::String(s)) => s
                .trim()
                .parse::<i64>()
                .map(Value::from)
                .map_err(|_| invalid("expected a whole number")),
            (FieldType::Real, Value::Number(n)) => n
                .as_f64()
                .and_then(Number::from_f64)
                .map(Value::Number)
                .ok_or_else(|| invalid("expected a number")),
            (FieldType::Real, Value::String(s)) => s
                .trim()
                .parse::<f64>()
                .ok()
                .and_then(Number::from_f64)
                .map(Value::Number)
                .ok_or_else(|| invalid("expected a number")),
            (FieldType::Cents, Value::Number(n)) => integral(n)
                .map(Value::from)
                .ok_or_else(|| invalid("expected a whole number of cents")),
            (FieldType::Cents, Value::String(s)) => parse_cents(s)
                .map(Value::from)
                .ok_or_else(|| invalid("expected an amount like 12.34")),
            (_, Value::Bool(_)) => Err(invalid("booleans are not supported")),
            (_, Value::Array(_) | Value::Object(_)) => Err(invalid("expected a scalar value")),
        }
    }

    /// Converts a value stored under `from` to this type, as done when a
    /// field is retyped.
    pub fn convert_from(&self, from: FieldType, field: &str, value: &Value) -> Result<Value> {
        match (from, self, value) {
            (_, _, Value::Null) => Ok(Value::Null),
            (FieldType::Cents, FieldType::Real, Value::Number(n)) => {
                let cents = n.as_i64().ok_or_else(|| CatalogError::invalid_value(field, "corrupt cents value"))?;
                Ok(Number::from_f64(cents as f64 / 100.0).map_or(Value::Null, Value::Number))
            }
            (FieldType::Cents, FieldType::Integer, Value::Number(n)) => {
                let cents = n.as_i64().ok_or_else(|| CatalogError::invalid_value(field, "corrupt cents value"))?;
                if cents % 100 != 0 {
                    return Err(CatalogError::invalid_value(field, "not a whole amount"));
                }
                Ok(Value::from(cents / 100))
            }
            (FieldType::Integer, FieldType::Cents, Value::Number(n)) => n
                .as_i64()
                .and_then(|whole| whole.checked_mul(100))
                .map(Value::from)
                .ok_or_else(|| CatalogError::invalid_value(field, "amount out of range")),
            (FieldType::Cents, FieldType::Text, _) => Ok(Value::String(from.display(value))),
            (FieldType::Real, FieldType::Cents, Value::Number(n)) => parse_cents(&n.to_string())
                .map(Value::from)
                .ok_or_else(|| CatalogError::invalid_value(field, "amount out of range")),
            _ => self.coerce(field, value),
        }
    }

    /// Human readable rendering of a stored value.
    pub fn display(&self, value: &Value) -> String {
        match (self, value) {
            (_, Value::Null) => NOT_AVAILABLE.to_string(),
            (FieldType::Cents, Value::Number(n)) => match n.as_i64() {
                Some(cents) => format_cents(cents),
                None => n.to_string(),
            },
            (_, Value::String(s)) => s.clone(),
            (_, other) => other.to_string(),
        }
    }
}

impl fmt::Display for FieldType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for FieldType {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "text" | "string" => Ok(FieldType::Text),
            "integer" | "int" => Ok(FieldType::Integer),
            "real" | "float" => Ok(FieldType::Real),
            "cents" | "currency" => Ok(FieldType::Cents),
            other => Err(format!("unknown field type: {}", other)),
        }
    }
}

impl ToSql for FieldType {
    fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
        Ok(ToSqlOutput::from(self.as_str()))
    }
}

impl FromSql for FieldType {
    fn column_result(value: ValueRef<'_>) -> FromSqlResult<Self> {
        value
            .as_str()?
            .parse()
            .map_err(|e: String| FromSqlError::Other(e.into()))
    }
}

fn integral(n: &Number) -> Option<i64> {
    n.as_i64().or_else(|| {
        n.as_f64()
            .filter(|f| f.fract() == 0.0 && f.abs() < i64::MAX as f64)
            .map(|f| f as i64)
    })
}

/// Parses a decimal currency amount into cents, rounding half away from zero.
pub fn parse_cents(input: &str) -> Option<i64> {
    let s = input.trim();
    let (negative, s) = match s.strip_prefix('-') {
        Some(rest) => (true, rest),
        None => (false, s.strip_prefix('+').unwrap_or(s)),
    };
    let (whole, frac) = s.split_once('.').unwrap_or((s, ""));
    if whole.is_empty() && frac.is_empty() {
        return None;
    }
    if !whole.chars().all(|c| c.is_ascii_digit()) || !frac.chars().all(|c| c.is_ascii_digit()) {
        return None;
    }
    let whole: i64 = if whole.is_empty() { 0 } else { whole.parse().ok()? };
    let mut digits = frac.chars().map(|c| i64::from(c as u8 - b'0'));
    let tenths = digits.next().unwrap_or(0);
    let hundredths = digits.next().unwrap_or(0);
    let round_up = digits.next().is_some_and(|d| d >= 5);
    let cents = whole
        .checked_mul(100)?
        .checked_add(tenths * 10 + hundredths + i64::from(round_up))?;
    Some(if negative { -cents } else { cents })
}

pub fn format_cents(cents: i64) -> String {
    let sign = if cents < 0 { "-" } else { "" };
    let abs = cents.unsigned_abs();
    format!("{}{}.{:02}", sign, abs / 100, abs % 100)
}

/// Converts a JSON scalar to a SQLite value for binding.
pub(crate) fn json_to_sql(value: &Value) -> rusqlite::types::Value {
    use rusqlite::types::Value as Sql;
    match value {
        Value::Null => Sql::Null,
        Value::Bool(b) => Sql::Integer(i64::from(*b)),
        Value::Number(n) => match n.as_i64() {
            Some(i) => Sql::Integer(i),
            None => n.as_f64().map_or(Sql::Null, Sql::Real),
        },
        Value::String(s) => Sql::Text(s.clone()),
        other => Sql::Text(other.to_string()),
    }
}

pub(crate) fn sql_to_json(value: ValueRef<'_>) -> Value {
    match value {
        ValueRef::Null => Value::Null,
        ValueRef::Integer(i) => Value::from(i),
        ValueRef::Real(f) => Number::from_f64(f).map_or(Value::Null, Value::Number),
        ValueRef::Text(t) | ValueRef::Blob(t) => Value::String(String::from_utf8_lossy(t).into_owned()),
    }
}

/// A registered product field.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct FieldDefinition {
    /// Stable across renames.
    pub id: i64,
    pub name: String,
    pub field_type: FieldType,
    pub required: bool,
    /// Value given to existing products when the field is added and to new
    /// products that omit it.
    pub default_value: Value,
    pub position: i64,
}

impl FieldDefinition {
    /// Coerces a value for this field, rejecting null on required fields.
    pub fn coerce(&self, value: &Value) -> Result<Value> {
        let coerced = self.field_type.coerce(&self.name, value)?;
        if coerced.is_null() && self.required {
            return Err(CatalogError::MissingRequiredField(self.name.clone()));
        }
        Ok(coerced)
    }

    pub fn display(&self, value: &Value) -> String {
        self.field_type.display(value)
    }
}

/// Parameters for a new field.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct FieldSpec {
    pub name: String,
    pub field_type: FieldType,
    #[serde(default)]
    pub required: bool,
    #[serde(default)]
    pub default_value: Value,
}

impl FieldSpec {
    pub fn new(name: impl Into<String>, field_type: FieldType) -> Self {
        Self {
            name: name.into(),
            field_type,
            required: false,
            default_value: Value::Null,
        }
    }

    pub fn required(mut self) -> Self {
        self.required = true;
        self
    }

    pub fn with_default(mut self, default_value: impl Into<Value>) -> Self {
        self.default_value = default_value.into();
        self
    }
}

/// A product row: its id plus one value per registered field.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Product {
    pub id: i64,
    #[serde(flatten)]
    pub fields: Map<String, Value>,
}

impl Product {
    pub fn get(&self, field: &str) -> Option<&Value> {
        self.fields.get(field)
    }
}

/// What produced a version entry.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChangeKind {
    Edit,
    Rollback,
}

impl ChangeKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ChangeKind::Edit => "edit",
            ChangeKind::Rollback => "rollback",
        }
    }
}

impl ToSql for ChangeKind {
    fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
        Ok(ToSqlOutput::from(self.as_str()))
    }
}

impl FromSql for ChangeKind {
    fn column_result(value: ValueRef<'_>) -> FromSqlResult<Self> {
        match value.as_str()? {
            "edit" => Ok(ChangeKind::Edit),
            "rollback" => Ok(ChangeKind::Rollback),
            other => Err(FromSqlError::Other(format!("unknown change kind: {}", other).into())),
        }
    }
}

/// One immutable row of the version ledger.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct VersionEntry {
    /// Sequence number; strictly increasing in append order.
    pub id: i64,
    pub product_id: i64,
    /// Field name at the time of the change.
    pub field_name: String,
    pub field_id: Option<i64>,
    /// Declared type of the field when the change was made.
    pub field_type: Option<FieldType>,
    pub old_value: Value,
    pub new_value: Value,
    pub changed_at: DateTime<Utc>,
    pub kind: ChangeKind,
    /// For rollbacks, the entry whose previous value was restored.
    pub reverts: Option<i64>,
}

/// Optional criteria for ledger history queries.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct HistoryFilter {
    pub product_id: Option<i64>,
    pub field_name: Option<String>,
}

impl HistoryFilter {
    pub fn product(product_id: i64) -> Self {
        Self {
            product_id: Some(product_id),
            field_name: None,
        }
    }

    pub fn field(field_name: impl Into<String>) -> Self {
        Self {
            product_id: None,
            field_name: Some(field_name.into()),
        }
    }
}

/// Side-by-side view of several products.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Comparison {
    pub product_ids: Vec<i64>,
    pub rows: Vec<ComparisonRow>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ComparisonRow {
    pub field: String,
    /// One display value per product, in `product_ids` order.
    pub values: Vec<String>,
}
