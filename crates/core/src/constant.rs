use serde::{Deserialize, Serialize};
use std::fmt;

/// Value stored in a chunk's constant pool.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ConstantValue {
    Nil,
    Boolean(bool),
    Number(f64),
    String(Vec<u8>),
    /// Metatable trap: a table that hangs the interpreter on any access.
    Crash,
}

impl ConstantValue {
    pub fn string(value: impl AsRef<[u8]>) -> Self {
        ConstantValue::String(value.as_ref().to_vec())
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            ConstantValue::String(bytes) => std::str::from_utf8(bytes).ok(),
            _ => None,
        }
    }

    /// Identity used by pool-integrity checks; numbers compare bitwise so NaN is stable.
    pub fn same_as(&self, other: &ConstantValue) -> bool {
        match (self, other) {
            (ConstantValue::Number(a), ConstantValue::Number(b)) => a.to_bits() == b.to_bits(),
            _ => self == other,
        }
    }
}

impl fmt::Display for ConstantValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConstantValue::Nil => f.write_str("nil"),
            ConstantValue::Boolean(value) => write!(f, "{value}"),
            ConstantValue::Number(value) => write!(f, "{value}"),
            ConstantValue::String(bytes) => write!(f, "{:?}", String::from_utf8_lossy(bytes)),
            ConstantValue::Crash => f.write_str("<crash>"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Constant {
    pub value: ConstantValue,
    /// Injected for anti-tamper correctness; later passes must leave it alone.
    pub tamper: bool,
}

impl Constant {
    pub fn new(value: ConstantValue) -> Self {
        Self {
            value,
            tamper: false,
        }
    }

    pub fn tamper(value: ConstantValue) -> Self {
        Self {
            value,
            tamper: true,
        }
    }
}
