//! Canonical scalar value representation shared by expression constants,
//! captured closure values, and extracted parameters.
use serde::{Deserialize, Serialize};

use crate::query::tree::QueryModel;

/// Typed scalar value tagged with explicit type information so payloads
/// remain unambiguous when handed across the host boundary.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "t", content = "v")]
pub enum Value {
    /// Null literal.
    Null,
    /// Boolean literal.
    Bool(bool),
    /// Signed 64-bit integer literal.
    Int(i64),
    /// 64-bit floating point literal.
    Float(f64),
    /// UTF-8 string literal.
    String(String),
    /// Arbitrary binary payload represented as bytes.
    Bytes(Vec<u8>),
}

impl Value {
    /// Returns true for the null literal.
    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }
}

impl From<&str> for Value {
    fn from(value: &str) -> Self {
        Value::String(value.to_owned())
    }
}

impl From<String> for Value {
    fn from(value: String) -> Self {
        Value::String(value)
    }
}

impl From<bool> for Value {
    fn from(value: bool) -> Self {
        Value::Bool(value)
    }
}

impl From<i64> for Value {
    fn from(value: i64) -> Self {
        Value::Int(value)
    }
}

impl From<f64> for Value {
    fn from(value: f64) -> Self {
        Value::Float(value)
    }
}

impl From<Vec<u8>> for Value {
    fn from(value: Vec<u8>) -> Self {
        Value::Bytes(value)
    }
}

/// Runtime value captured from the host when the query was built.
///
/// Captured values stay opaque to every rewriting pass; only parameter
/// extraction inspects them, turning scalars and sequences into named
/// parameters and recursively compiling captured queryables.
#[derive(Clone, Debug, PartialEq)]
pub enum CapturedValue {
    /// Single scalar capture.
    Scalar(Value),
    /// Captured sequence (e.g. a list used with `Contains`).
    Sequence(Vec<Value>),
    /// Captured queryable carrying its own query tree.
    Queryable(Box<QueryModel>),
}

/// Named closed-over value attached to an expression node.
#[derive(Clone, Debug, PartialEq)]
pub struct ExternalValue {
    /// Diagnostic label, usually the captured variable's name.
    pub label: String,
    /// The captured payload.
    pub value: CapturedValue,
}

impl ExternalValue {
    /// Wraps a scalar capture.
    pub fn scalar(label: impl Into<String>, value: impl Into<Value>) -> Self {
        Self {
            label: label.into(),
            value: CapturedValue::Scalar(value.into()),
        }
    }

    /// Wraps a sequence capture.
    pub fn sequence(label: impl Into<String>, values: Vec<Value>) -> Self {
        Self {
            label: label.into(),
            value: CapturedValue::Sequence(values),
        }
    }

    /// Wraps a queryable capture.
    pub fn queryable(label: impl Into<String>, query: QueryModel) -> Self {
        Self {
            label: label.into(),
            value: CapturedValue::Queryable(Box::new(query)),
        }
    }
}
