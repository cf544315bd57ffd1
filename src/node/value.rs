//! Typed permission values

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Declared value type of a permission node
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum PermissionType {
    Bool,
    Int,
    Enum,
    /// No declared type, any value is accepted as-is
    #[default]
    Unset,
}

impl FromStr for PermissionType {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "bool" | "boolean" => Ok(PermissionType::Bool),
            "int" | "integer" => Ok(PermissionType::Int),
            "enum" => Ok(PermissionType::Enum),
            "unset" | "" => Ok(PermissionType::Unset),
            _ => Err(()),
        }
    }
}

impl fmt::Display for PermissionType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            PermissionType::Bool => "bool",
            PermissionType::Int => "int",
            PermissionType::Enum => "enum",
            PermissionType::Unset => "unset",
        };
        write!(f, "{}", s)
    }
}

/// A node default or an assigned value
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(tag = "type", content = "value", rename_all = "lowercase")]
pub enum PermissionValue {
    Bool(bool),
    Int(i64),
    Enum(String),
    #[default]
    Unset,
}

impl PermissionValue {
    pub fn value_type(&self) -> PermissionType {
        match self {
            PermissionValue::Bool(_) => PermissionType::Bool,
            PermissionValue::Int(_) => PermissionType::Int,
            PermissionValue::Enum(_) => PermissionType::Enum,
            PermissionValue::Unset => PermissionType::Unset,
        }
    }

    pub fn is_unset(&self) -> bool {
        matches!(self, PermissionValue::Unset)
    }

    /// Only an explicit `true` counts as granted
    pub fn is_true(&self) -> bool {
        matches!(self, PermissionValue::Bool(true))
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            PermissionValue::Bool(b) => Some(*b),
            _ => None,
        }
    }

    pub fn as_int(&self) -> Option<i64> {
        match self {
            PermissionValue::Int(n) => Some(*n),
            _ => None,
        }
    }

    /// Infer a value from its stored text: booleans, then integers, else enum
    pub fn parse_loose(s: &str) -> PermissionValue {
        let trimmed = s.trim();
        if trimmed.is_empty() {
            return PermissionValue::Unset;
        }
        if let Some(b) = parse_bool(trimmed) {
            return PermissionValue::Bool(b);
        }
        if let Ok(n) = trimmed.parse::<i64>() {
            return PermissionValue::Int(n);
        }
        PermissionValue::Enum(trimmed.to_string())
    }

    /// Rebuild a stored value from its text and the type tag saved beside it.
    ///
    /// A missing or `unset` tag falls back to `parse_loose`. Text that does
    /// not fit its tag comes back as `Err` with the loose reading.
    pub fn from_stored(text: &str, value_type: &str) -> Result<PermissionValue, PermissionValue> {
        match value_type.parse::<PermissionType>() {
            Ok(PermissionType::Unset) => Ok(PermissionValue::parse_loose(text)),
            Ok(declared) => PermissionValue::Enum(text.to_string())
                .coerce(declared)
                .map_err(|_| PermissionValue::parse_loose(text)),
            Err(()) => Err(PermissionValue::parse_loose(text)),
        }
    }

    /// Convert to the given type.
    ///
    /// - Bool from Int (non-zero is true) or `true/false/yes/no/1/0`
    /// - Int from Bool (1/0) or a decimal string
    /// - Enum from the textual form of anything
    /// - `Unset` target keeps the value unchanged
    pub fn coerce(self, target: PermissionType) -> Result<PermissionValue, PermissionValue> {
        match (target, self) {
            (PermissionType::Unset, v) | (_, v @ PermissionValue::Unset) => Ok(v),
            (PermissionType::Bool, PermissionValue::Bool(b)) => Ok(PermissionValue::Bool(b)),
            (PermissionType::Bool, PermissionValue::Int(n)) => Ok(PermissionValue::Bool(n != 0)),
            (PermissionType::Bool, PermissionValue::Enum(s)) => match parse_bool(&s) {
                Some(b) => Ok(PermissionValue::Bool(b)),
                None => Err(PermissionValue::Enum(s)),
            },
            (PermissionType::Int, PermissionValue::Int(n)) => Ok(PermissionValue::Int(n)),
            (PermissionType::Int, PermissionValue::Bool(b)) => Ok(PermissionValue::Int(b as i64)),
            (PermissionType::Int, PermissionValue::Enum(s)) => match s.trim().parse::<i64>() {
                Ok(n) => Ok(PermissionValue::Int(n)),
                Err(_) => Err(PermissionValue::Enum(s)),
            },
            (PermissionType::Enum, v) => Ok(PermissionValue::Enum(v.to_string())),
        }
    }
}

fn parse_bool(s: &str) -> Option<bool> {
    match s.to_lowercase().as_str() {
        "true" | "yes" | "1" => Some(true),
        "false" | "no" | "0" => Some(false),
        _ => None,
    }
}

impl fmt::Display for PermissionValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PermissionValue::Bool(b) => write!(f, "{}", b),
            PermissionValue::Int(n) => write!(f, "{}", n),
            PermissionValue::Enum(s) => write!(f, "{}", s),
            PermissionValue::Unset => Ok(()),
        }
    }
}

impl From<bool> for PermissionValue {
    fn from(b: bool) -> Self {
        PermissionValue::Bool(b)
    }
}

impl From<i64> for PermissionValue {
    fn from(n: i64) -> Self {
        PermissionValue::Int(n)
    }
}

impl From<&str> for PermissionValue {
    fn from(s: &str) -> Self {
        PermissionValue::Enum(s.to_string())
    }
}
