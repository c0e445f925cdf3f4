//! Dynamic parameter bag for the get/set surface exposed to protocol daemons.
//!
//! The source system exposes symbolic keys of varying type over get/set.
//! [`ParamValue`] realizes that as a tagged variant per the design notes;
//! unknown keys are `None` on get and a silent no-op on set.

use serde::{Deserialize, Serialize};

/// A parameter value of one of the supported wire types.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ParamValue {
    Int(i64),
    Float(f64),
    Bool(bool),
    ListFloat(Vec<f64>),
}

impl ParamValue {
    /// Returns the value as `i64`, truncating a float if necessary.
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Self::Int(v) => Some(*v),
            Self::Float(v) => Some(*v as i64),
            _ => None,
        }
    }

    /// Returns the value as `f64`.
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Self::Int(v) => Some(*v as f64),
            Self::Float(v) => Some(*v),
            _ => None,
        }
    }

    /// Returns the value as `bool`.
    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Self::Bool(v) => Some(*v),
            _ => None,
        }
    }
}

impl From<i64> for ParamValue {
    fn from(v: i64) -> Self {
        Self::Int(v)
    }
}

impl From<u64> for ParamValue {
    fn from(v: u64) -> Self {
        Self::Int(v as i64)
    }
}

impl From<f64> for ParamValue {
    fn from(v: f64) -> Self {
        Self::Float(v)
    }
}

impl From<bool> for ParamValue {
    fn from(v: bool) -> Self {
        Self::Bool(v)
    }
}

impl From<Vec<f64>> for ParamValue {
    fn from(v: Vec<f64>) -> Self {
        Self::ListFloat(v)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn int_converts_to_f64() {
        let v = ParamValue::Int(6);
        assert_eq!(v.as_f64(), Some(6.0));
    }

    #[test]
    fn bool_does_not_convert_to_i64() {
        let v = ParamValue::Bool(true);
        assert_eq!(v.as_i64(), None);
    }

    #[test]
    fn untagged_serialization_round_trips() {
        let v = ParamValue::ListFloat(vec![96000.0]);
        let json = serde_json::to_string(&v).unwrap();
        assert_eq!(json, "[96000.0]");
        let back: ParamValue = serde_json::from_str(&json).unwrap();
        assert_eq!(back, v);
    }
}
