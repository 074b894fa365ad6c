//! Result sinks.

pub mod csv;
pub mod jsonl;

use gpujoin_core::types::Scalar;

/// JSON form of one value; binary values are written as byte arrays.
pub(crate) fn scalar_to_json(v: &Scalar) -> serde_json::Value {
    use Scalar::*;
    match v {
        Null => serde_json::Value::Null,
        Bool(b) => serde_json::Value::Bool(*b),
        I32(i) => serde_json::Value::from(*i),
        I64(i) => serde_json::Value::from(*i),
        F32(f) => serde_json::Value::from(*f as f64),
        F64(f) => serde_json::Value::from(*f),
        Str(s) => serde_json::Value::String(s.clone()),
        Bin(b) => serde_json::Value::from(b.clone()),
    }
}

/// Text form used by the CSV writer; NULL is the empty field.
pub(crate) fn scalar_to_field(v: &Scalar) -> String {
    match v {
        Scalar::Null => String::new(),
        Scalar::Bool(b) => b.to_string(),
        Scalar::I32(i) => i.to_string(),
        Scalar::I64(i) => i.to_string(),
        Scalar::F32(f) => f.to_string(),
        Scalar::F64(f) => f.to_string(),
        Scalar::Str(s) => s.clone(),
        Scalar::Bin(b) => String::from_utf8_lossy(b).into_owned(),
    }
}
