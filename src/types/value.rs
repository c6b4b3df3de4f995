use ndarray::{ArrayD, IxDyn};
use serde::Serialize;

use crate::prelude::*;

/// A runtime value flowing through a task graph: either a literal
/// configuration value or a block-shaped array produced by a kernel.
///
/// Partial aggregates (for example the `(sum, count)` pair a mean reduction
/// carries between tree levels) travel as `Tuple` values.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub enum Value {
    Int(i64),
    Float(f64),
    Bool(bool),
    Block(ArrayD<f64>),
    IntBlock(ArrayD<i64>),
    BoolBlock(ArrayD<bool>),
    Tuple(Vec<Value>),
}

impl Value {
    pub fn kind_name(&self) -> &'static str {
        match self {
            Value::Int(_) => "int",
            Value::Float(_) => "float",
            Value::Bool(_) => "bool",
            Value::Block(_) => "block",
            Value::IntBlock(_) => "int block",
            Value::BoolBlock(_) => "bool block",
            Value::Tuple(_) => "tuple",
        }
    }

    pub fn block(&self) -> Result<&ArrayD<f64>> {
        match self {
            Value::Block(b) => Ok(b),
            other => bail!("expected a float block, found {}", other.kind_name()),
        }
    }

    pub fn into_block(self) -> Result<ArrayD<f64>> {
        match self {
            Value::Block(b) => Ok(b),
            other => bail!("expected a float block, found {}", other.kind_name()),
        }
    }

    pub fn int_block(&self) -> Result<&ArrayD<i64>> {
        match self {
            Value::IntBlock(b) => Ok(b),
            other => bail!("expected an integer block, found {}", other.kind_name()),
        }
    }

    pub fn bool_block(&self) -> Result<&ArrayD<bool>> {
        match self {
            Value::BoolBlock(b) => Ok(b),
            other => bail!("expected a boolean block, found {}", other.kind_name()),
        }
    }

    pub fn tuple(&self) -> Result<&[Value]> {
        match self {
            Value::Tuple(items) => Ok(items),
            other => bail!("expected a tuple, found {}", other.kind_name()),
        }
    }

    pub fn float(&self) -> Result<f64> {
        match self {
            Value::Float(v) => Ok(*v),
            Value::Int(v) => Ok(*v as f64),
            other => bail!("expected a scalar, found {}", other.kind_name()),
        }
    }

    /// Canonical encoding used by the deterministic namer. Two equal values
    /// always produce the same encoding.
    pub fn canonical_token(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|_| format!("{:?}", self))
    }

    pub fn scalar_block(v: f64) -> Value {
        Value::Block(ArrayD::from_elem(IxDyn(&[]), v))
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Value::Float(v)
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Value::Int(v)
    }
}

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Value::Bool(v)
    }
}

impl From<ArrayD<f64>> for Value {
    fn from(v: ArrayD<f64>) -> Self {
        Value::Block(v)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_accessors() {
        let v = Value::from(2.5);
        assert_eq!(v.float().unwrap(), 2.5);
        assert!(v.block().is_err());

        let b = Value::Block(ArrayD::zeros(IxDyn(&[2, 2])));
        assert_eq!(b.block().unwrap().shape(), &[2, 2]);
    }

    #[test]
    fn test_canonical_token() {
        let a = Value::Tuple(vec![Value::Int(1), Value::Float(2.0)]);
        let b = Value::Tuple(vec![Value::Int(1), Value::Float(2.0)]);
        assert_eq!(a.canonical_token(), b.canonical_token());

        let c = Value::Tuple(vec![Value::Int(1), Value::Float(3.0)]);
        assert_ne!(a.canonical_token(), c.canonical_token());
    }
}
