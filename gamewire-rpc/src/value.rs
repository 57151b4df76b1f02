//! Values and types that may cross an RPC boundary.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

/// A serializable RPC argument or return value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum RpcValue {
    Bool(bool),
    I8(i8),
    I16(i16),
    I32(i32),
    I64(i64),
    F32(f32),
    F64(f64),
    String(String),
    Bytes(Vec<u8>),
    List(Vec<RpcValue>),
    Map(BTreeMap<String, RpcValue>),
}

impl RpcValue {
    pub fn as_bool(&self) -> Option<bool> {
        match self {
            RpcValue::Bool(v) => Some(*v),
            _ => None,
        }
    }

    /// Widens any integer variant to `i64`.
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            RpcValue::I8(v) => Some(*v as i64),
            RpcValue::I16(v) => Some(*v as i64),
            RpcValue::I32(v) => Some(*v as i64),
            RpcValue::I64(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            RpcValue::F32(v) => Some(*v as f64),
            RpcValue::F64(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            RpcValue::String(v) => Some(v),
            _ => None,
        }
    }

    pub fn as_list(&self) -> Option<&[RpcValue]> {
        match self {
            RpcValue::List(v) => Some(v),
            _ => None,
        }
    }
}

impl From<bool> for RpcValue {
    fn from(v: bool) -> Self {
        RpcValue::Bool(v)
    }
}

impl From<i32> for RpcValue {
    fn from(v: i32) -> Self {
        RpcValue::I32(v)
    }
}

impl From<i64> for RpcValue {
    fn from(v: i64) -> Self {
        RpcValue::I64(v)
    }
}

impl From<f64> for RpcValue {
    fn from(v: f64) -> Self {
        RpcValue::F64(v)
    }
}

impl From<String> for RpcValue {
    fn from(v: String) -> Self {
        RpcValue::String(v)
    }
}

impl From<&str> for RpcValue {
    fn from(v: &str) -> Self {
        RpcValue::String(v.to_string())
    }
}

impl From<Vec<u8>> for RpcValue {
    fn from(v: Vec<u8>) -> Self {
        RpcValue::Bytes(v)
    }
}

/// The closed set of types an RPC method may declare.
///
/// Written as `void`, `bool`, `i8`, `i16`, `i32`, `i64`, `f32`, `f64`,
/// `string`, `bytes`, `list<T>` or `map<T>` (string keys).
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum RpcType {
    Void,
    Bool,
    I8,
    I16,
    I32,
    I64,
    F32,
    F64,
    String,
    Bytes,
    List(Box<RpcType>),
    Map(Box<RpcType>),
}

impl RpcType {
    /// Whether `value` is an instance of this type.
    pub fn matches(&self, value: &RpcValue) -> bool {
        match (self, value) {
            (RpcType::Bool, RpcValue::Bool(_))
            | (RpcType::I8, RpcValue::I8(_))
            | (RpcType::I16, RpcValue::I16(_))
            | (RpcType::I32, RpcValue::I32(_))
            | (RpcType::I64, RpcValue::I64(_))
            | (RpcType::F32, RpcValue::F32(_))
            | (RpcType::F64, RpcValue::F64(_))
            | (RpcType::String, RpcValue::String(_))
            | (RpcType::Bytes, RpcValue::Bytes(_)) => true,
            (RpcType::List(inner), RpcValue::List(items)) => items.iter().all(|v| inner.matches(v)),
            (RpcType::Map(inner), RpcValue::Map(items)) => items.values().all(|v| inner.matches(v)),
            _ => false,
        }
    }

    pub fn is_void(&self) -> bool {
        matches!(self, RpcType::Void)
    }

    fn contains_void(&self) -> bool {
        match self {
            RpcType::Void => true,
            RpcType::List(inner) | RpcType::Map(inner) => inner.contains_void(),
            _ => false,
        }
    }

    /// Parses a parameter type. `void` is only valid as a return type.
    pub fn parse_param(s: &str) -> Result<Self, InvalidType> {
        let ty: RpcType = s.parse()?;
        if ty.contains_void() {
            return Err(InvalidType(s.to_string()));
        }
        Ok(ty)
    }

    /// Parses a return type.
    pub fn parse_return(s: &str) -> Result<Self, InvalidType> {
        let ty: RpcType = s.parse()?;
        match &ty {
            RpcType::List(inner) | RpcType::Map(inner) if inner.contains_void() => {
                Err(InvalidType(s.to_string()))
            }
            _ => Ok(ty),
        }
    }
}

/// A type name outside the allowed set.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unsupported RPC type '{0}'")]
pub struct InvalidType(pub String);

impl FromStr for RpcType {
    type Err = InvalidType;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let trimmed = s.trim();
        let generic = |prefix: &str| {
            trimmed
                .strip_prefix(prefix)
                .and_then(|rest| rest.strip_suffix('>'))
        };

        let ty = match trimmed {
            "void" => RpcType::Void,
            "bool" => RpcType::Bool,
            "i8" => RpcType::I8,
            "i16" => RpcType::I16,
            "i32" => RpcType::I32,
            "i64" => RpcType::I64,
            "f32" => RpcType::F32,
            "f64" => RpcType::F64,
            "string" => RpcType::String,
            "bytes" => RpcType::Bytes,
            _ => {
                if let Some(inner) = generic("list<") {
                    RpcType::List(Box::new(inner.parse()?))
                } else if let Some(inner) = generic("map<") {
                    RpcType::Map(Box::new(inner.parse()?))
                } else {
                    return Err(InvalidType(s.to_string()));
                }
            }
        };
        Ok(ty)
    }
}

impl fmt::Display for RpcType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RpcType::Void => f.write_str("void"),
            RpcType::Bool => f.write_str("bool"),
            RpcType::I8 => f.write_str("i8"),
            RpcType::I16 => f.write_str("i16"),
            RpcType::I32 => f.write_str("i32"),
            RpcType::I64 => f.write_str("i64"),
            RpcType::F32 => f.write_str("f32"),
            RpcType::F64 => f.write_str("f64"),
            RpcType::String => f.write_str("string"),
            RpcType::Bytes => f.write_str("bytes"),
            RpcType::List(inner) => write!(f, "list<{}>", inner),
            RpcType::Map(inner) => write!(f, "map<{}>", inner),
        }
    }
}
