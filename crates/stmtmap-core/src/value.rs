use std::sync::Arc;

use serde::Serialize;

use crate::driver::DriverError;
use crate::errors::{RegistryError, Result};

/// A dynamically typed SQL value, used for statement arguments and row cells.
#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(untagged)]
pub enum Value {
    Null,
    Integer(i64),
    Real(f64),
    Text(String),
    Blob(Vec<u8>),
}

impl Value {
    pub fn is_null(&self) -> bool {
        matches!(self, Self::Null)
    }

    /// Short type name used in scan errors.
    pub fn type_name(&self) -> &'static str {
        match self {
            Self::Null => "null",
            Self::Integer(_) => "integer",
            Self::Real(_) => "real",
            Self::Text(_) => "text",
            Self::Blob(_) => "blob",
        }
    }
}

macro_rules! impl_from_int {
    ($($t:ty),*) => {
        $(impl From<$t> for Value {
            fn from(v: $t) -> Self {
                Self::Integer(i64::from(v))
            }
        })*
    };
}

impl_from_int!(i8, i16, i32, i64, u8, u16, u32);

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Self::Real(v)
    }
}

impl From<f32> for Value {
    fn from(v: f32) -> Self {
        Self::Real(f64::from(v))
    }
}

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Self::Integer(i64::from(v))
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Self::Text(v.to_string())
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Self::Text(v)
    }
}

impl From<Vec<u8>> for Value {
    fn from(v: Vec<u8>) -> Self {
        Self::Blob(v)
    }
}

impl From<&[u8]> for Value {
    fn from(v: &[u8]) -> Self {
        Self::Blob(v.to_vec())
    }
}

impl<T: Into<Value>> From<Option<T>> for Value {
    fn from(v: Option<T>) -> Self {
        v.map_or(Self::Null, Into::into)
    }
}

/// Build a `[Value; N]` argument list from heterogeneous expressions.
///
/// ```
/// use stmtmap_core::{args, Value};
///
/// let a = args!["Hello World :D!", 1, None::<i64>];
/// assert_eq!(a[1], Value::Integer(1));
/// ```
#[macro_export]
macro_rules! args {
    () => {{
        let empty: [$crate::Value; 0] = [];
        empty
    }};
    ($($arg:expr),+ $(,)?) => {
        [$($crate::Value::from($arg)),+]
    };
}

/// Result of executing a statement that does not return rows.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
pub struct ExecOutcome {
    pub rows_affected: u64,
    pub last_insert_id: Option<i64>,
}

/// Conversion from a row cell into a Rust type.
pub trait FromValue: Sized {
    fn from_value(value: &Value) -> std::result::Result<Self, String>;
}

impl FromValue for Value {
    fn from_value(value: &Value) -> std::result::Result<Self, String> {
        Ok(value.clone())
    }
}

impl FromValue for i64 {
    fn from_value(value: &Value) -> std::result::Result<Self, String> {
        match value {
            Value::Integer(i) => Ok(*i),
            other => Err(format!("expected integer, got {}", other.type_name())),
        }
    }
}

impl FromValue for i32 {
    fn from_value(value: &Value) -> std::result::Result<Self, String> {
        let i = i64::from_value(value)?;
        i32::try_from(i).map_err(|_| format!("integer {i} out of range for i32"))
    }
}

impl FromValue for f64 {
    fn from_value(value: &Value) -> std::result::Result<Self, String> {
        match value {
            Value::Real(f) => Ok(*f),
            #[allow(clippy::cast_precision_loss)]
            Value::Integer(i) => Ok(*i as f64),
            other => Err(format!("expected real, got {}", other.type_name())),
        }
    }
}

impl FromValue for bool {
    fn from_value(value: &Value) -> std::result::Result<Self, String> {
        i64::from_value(value).map(|i| i != 0)
    }
}

impl FromValue for String {
    fn from_value(value: &Value) -> std::result::Result<Self, String> {
        match value {
            Value::Text(s) => Ok(s.clone()),
            other => Err(format!("expected text, got {}", other.type_name())),
        }
    }
}

impl FromValue for Vec<u8> {
    fn from_value(value: &Value) -> std::result::Result<Self, String> {
        match value {
            Value::Blob(b) => Ok(b.clone()),
            Value::Text(s) => Ok(s.as_bytes().to_vec()),
            other => Err(format!("expected blob, got {}", other.type_name())),
        }
    }
}

impl<T: FromValue> FromValue for Option<T> {
    fn from_value(value: &Value) -> std::result::Result<Self, String> {
        match value {
            Value::Null => Ok(None),
            other => T::from_value(other).map(Some),
        }
    }
}

/// One result row: shared column names plus the row's values.
#[derive(Clone, Debug, PartialEq)]
pub struct Row {
    columns: Arc<[String]>,
    values: Vec<Value>,
}

impl Row {
    pub fn new(columns: Arc<[String]>, values: Vec<Value>) -> Self {
        Self { columns, values }
    }

    pub fn columns(&self) -> &[String] {
        &self.columns
    }

    pub fn values(&self) -> &[Value] {
        &self.values
    }

    pub fn into_values(self) -> Vec<Value> {
        self.values
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// Convert the value at `idx`, returning `Scan` on a missing column or a
    /// type mismatch.
    pub fn get<T: FromValue>(&self, idx: usize) -> Result<T> {
        let column = || {
            self.columns
                .get(idx)
                .cloned()
                .unwrap_or_else(|| idx.to_string())
        };
        let value = self.values.get(idx).ok_or_else(|| RegistryError::Scan {
            column: column(),
            detail: format!("index out of range ({} columns)", self.values.len()),
        })?;
        T::from_value(value).map_err(|detail| RegistryError::Scan {
            column: column(),
            detail,
        })
    }

    pub fn get_named<T: FromValue>(&self, name: &str) -> Result<T> {
        let idx = self
            .columns
            .iter()
            .position(|c| c == name)
            .ok_or_else(|| RegistryError::Scan {
                column: name.to_string(),
                detail: "no such column".into(),
            })?;
        self.get(idx)
    }

    /// Column name / value pairs, in column order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &Value)> {
        self.columns
            .iter()
            .map(String::as_str)
            .zip(self.values.iter())
    }
}

/// Deferred result of a single-row query.
///
/// Holds whatever the fetch produced; errors surface only when the row is
/// resolved.
#[derive(Debug)]
pub struct SingleRow {
    outcome: std::result::Result<Option<Row>, DriverError>,
}

impl SingleRow {
    pub fn found(row: Row) -> Self {
        Self { outcome: Ok(Some(row)) }
    }

    pub fn empty() -> Self {
        Self { outcome: Ok(None) }
    }

    pub fn failed<E>(err: E) -> Self
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        Self {
            outcome: Err(Box::new(err)),
        }
    }

    /// Resolve to the row; no row is `NoRows`.
    pub fn row(self) -> Result<Row> {
        self.optional()?.ok_or(RegistryError::NoRows)
    }

    /// Resolve to the row if there was one.
    pub fn optional(self) -> Result<Option<Row>> {
        self.outcome.map_err(RegistryError::Driver)
    }

    /// Resolve and convert the value at `idx`.
    pub fn scan<T: FromValue>(self, idx: usize) -> Result<T> {
        self.row()?.get(idx)
    }
}
