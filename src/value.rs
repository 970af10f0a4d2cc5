use serde::{Deserialize, Serialize};
use std::fmt;

use crate::actor::ActorHandle;

/// Script-visible value. `Nil` doubles as the null sentinel: reads
/// through it coerce to the zero of whatever type the caller expects.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Value {
    Nil,
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
    Handle(ActorHandle),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ValueKind {
    Nil,
    Bool,
    Int,
    Float,
    Str,
    Handle,
}

impl Value {
    pub fn kind(&self) -> ValueKind {
        match self {
            Value::Nil => ValueKind::Nil,
            Value::Bool(_) => ValueKind::Bool,
            Value::Int(_) => ValueKind::Int,
            Value::Float(_) => ValueKind::Float,
            Value::Str(_) => ValueKind::Str,
            Value::Handle(_) => ValueKind::Handle,
        }
    }

    pub fn zero_of(kind: ValueKind) -> Value {
        match kind {
            ValueKind::Nil => Value::Nil,
            ValueKind::Bool => Value::Bool(false),
            ValueKind::Int => Value::Int(0),
            ValueKind::Float => Value::Float(0.0),
            ValueKind::Str => Value::Str(String::new()),
            ValueKind::Handle => Value::Nil,
        }
    }

    pub fn as_int(&self) -> i64 {
        match self {
            Value::Int(v) => *v,
            Value::Float(v) => *v as i64,
            Value::Bool(v) => *v as i64,
            _ => 0,
        }
    }

    pub fn as_float(&self) -> f64 {
        match self {
            Value::Float(v) => *v,
            Value::Int(v) => *v as f64,
            _ => 0.0,
        }
    }

    pub fn as_bool(&self) -> bool {
        match self {
            Value::Bool(v) => *v,
            Value::Int(v) => *v != 0,
            Value::Float(v) => *v != 0.0,
            Value::Str(v) => !v.is_empty(),
            Value::Handle(_) => true,
            Value::Nil => false,
        }
    }

    pub fn as_handle(&self) -> Option<ActorHandle> {
        match self {
            Value::Handle(h) => Some(*h),
            _ => None,
        }
    }

    /// Addition for the minimal op contract: numeric add, string
    /// concatenation when either side is a string.
    pub fn add(&self, rhs: &Value) -> Value {
        match (self, rhs) {
            (Value::Str(a), b) => Value::Str(format!("{a}{b}")),
            (a, Value::Str(b)) => Value::Str(format!("{a}{b}")),
            (Value::Float(a), b) => Value::Float(a + b.as_float()),
            (a, Value::Float(b)) => Value::Float(a.as_float() + b),
            (a, b) => Value::Int(a.as_int() + b.as_int()),
        }
    }
}

impl Default for Value {
    fn default() -> Self {
        Value::Nil
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Nil => write!(f, "nil"),
            Value::Bool(v) => write!(f, "{v}"),
            Value::Int(v) => write!(f, "{v}"),
            Value::Float(v) => write!(f, "{v}"),
            Value::Str(v) => write!(f, "{v}"),
            Value::Handle(h) => write!(f, "actor#{}", h.to_bits()),
        }
    }
}
