//! SQL driver adapter behind the `db_query` effect.
//!
//! The core only requires parameterized statements, a closed bound-value set,
//! and rows addressable by column index with a type tag. Actual drivers live
//! outside the core; tests implement [`SqlDriver`] over canned data.

use async_trait::async_trait;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

use crate::context::CancelToken;
use crate::error::FlowResult;

/// The closed set of SQL bound values and column values
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SqlValue {
    Null,
    Int(i64),
    Float(f64),
    Bool(bool),
    Text(String),
    Blob(Bytes),
}

impl SqlValue {
    /// Type tag exposed alongside column values
    pub fn type_tag(&self) -> &'static str {
        match self {
            SqlValue::Null => "null",
            SqlValue::Int(_) => "int64",
            SqlValue::Float(_) => "float64",
            SqlValue::Bool(_) => "bool",
            SqlValue::Text(_) => "text",
            SqlValue::Blob(_) => "blob",
        }
    }

    fn to_json(&self) -> Value {
        match self {
            SqlValue::Null => Value::Null,
            SqlValue::Int(i) => json!(i),
            SqlValue::Float(f) => json!(f),
            SqlValue::Bool(b) => json!(b),
            SqlValue::Text(s) => json!(s),
            SqlValue::Blob(b) => json!(String::from_utf8_lossy(b)),
        }
    }
}

/// One result row; columns addressed by index
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SqlRow {
    pub columns: Vec<SqlValue>,
}

impl SqlRow {
    pub fn new(columns: Vec<SqlValue>) -> Self {
        Self { columns }
    }

    pub fn column(&self, index: usize) -> Option<&SqlValue> {
        self.columns.get(index)
    }
}

/// Driver contract behind `db_query`
#[async_trait]
pub trait SqlDriver: Send + Sync {
    async fn query(
        &self,
        sql: &str,
        params: &[SqlValue],
        cancel: &CancelToken,
    ) -> FlowResult<Vec<SqlRow>>;
}

/// JSON shape bound to the destination slot: an array of rows, each an array
/// of `{type, value}` columns
pub fn rows_to_json(rows: &[SqlRow]) -> Value {
    Value::Array(
        rows.iter()
            .map(|row| {
                Value::Array(
                    row.columns
                        .iter()
                        .map(|col| json!({"type": col.type_tag(), "value": col.to_json()}))
                        .collect(),
                )
            })
            .collect(),
    )
}
