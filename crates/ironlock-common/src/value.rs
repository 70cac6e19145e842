//! Runtime value representation for IronLock
//!
//! Rows held by the store are plain vectors of `Value`. The transaction core
//! never inspects them; they exist so stores and the transaction log have
//! something concrete to index, persist and replay.

use serde::{Deserialize, Serialize};

/// Runtime value representation
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Value {
    /// NULL value
    Null,
    /// Boolean value
    Boolean(bool),
    /// 32-bit signed integer
    Integer(i32),
    /// 64-bit signed integer
    BigInt(i64),
    /// 64-bit floating point
    Double(f64),
    /// Variable-length string
    Varchar(String),
    /// Binary data
    Blob(Vec<u8>),
}

impl Value {
    /// Try to get as i64
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Value::Integer(i) => Some(*i as i64),
            Value::BigInt(i) => Some(*i),
            _ => None,
        }
    }
}

impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Value::Null, Value::Null) => true,
            (Value::Boolean(a), Value::Boolean(b)) => a == b,
            (Value::Integer(a), Value::Integer(b)) => a == b,
            (Value::BigInt(a), Value::BigInt(b)) => a == b,
            (Value::Integer(a), Value::BigInt(b)) => (*a as i64) == *b,
            (Value::BigInt(a), Value::Integer(b)) => *a == (*b as i64),
            // NaN equals itself so rows stay comparable after a round trip
            (Value::Double(a), Value::Double(b)) => a.to_bits() == b.to_bits() || a == b,
            (Value::Varchar(a), Value::Varchar(b)) => a == b,
            (Value::Blob(a), Value::Blob(b)) => a == b,
            _ => false,
        }
    }
}

impl Eq for Value {}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::Varchar(s.to_string())
    }
}
