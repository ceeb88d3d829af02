//! # Values crossing the boundary
//!
//! Two vocabularies meet here. [`HostValue`] is what the host runtime
//! speaks: primitives plus opaque [`HostHandle`]s for its own objects and
//! [`CallbackId`]s naming embedded functions. [`ForeignValue`] is what
//! embedded code sees: the same primitives, but host objects appear as
//! reference-counted [`ForeignRef`]s owned through the bridge.

use serde::{Deserialize, Serialize};
use std::fmt;

/// A counted reference to a host object, issued by the bridge
///
/// Ids are never reused, so a stale id is always detectable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ForeignRef(pub(crate) u32);

impl ForeignRef {
    pub fn id(&self) -> u32 {
        self.0
    }
}

impl fmt::Display for ForeignRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ForeignRef({})", self.0)
    }
}

/// Names an embedded function the host may call back
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct CallbackId(pub u32);

impl fmt::Display for CallbackId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Callback({})", self.0)
    }
}

/// The host runtime's own id for one of its objects
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct HostHandle(pub u64);

/// A value as the host runtime represents it
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
pub enum HostValue {
    Undefined,
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
    Bytes(Vec<u8>),
    Handle(HostHandle),
    Callback(CallbackId),
}

/// Kind tag carried by every bridged value
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ValueKind {
    Primitive,
    String,
    Buffer,
    Callable,
    Object,
}

impl fmt::Display for ValueKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ValueKind::Primitive => "primitive",
            ValueKind::String => "string",
            ValueKind::Buffer => "buffer",
            ValueKind::Callable => "callable",
            ValueKind::Object => "object",
        };
        f.write_str(name)
    }
}

/// A value as embedded code sees it
#[derive(Debug, Clone, PartialEq)]
pub enum ForeignValue {
    /// `undefined` and `null` both land here
    None,
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
    Bytes(Vec<u8>),
    Callable(CallbackId),
    /// A host object; the holder owns one count on the reference
    Object(ForeignRef),
}

impl ForeignValue {
    pub fn kind(&self) -> ValueKind {
        match self {
            ForeignValue::None
            | ForeignValue::Bool(_)
            | ForeignValue::Int(_)
            | ForeignValue::Float(_) => ValueKind::Primitive,
            ForeignValue::Str(_) => ValueKind::String,
            ForeignValue::Bytes(_) => ValueKind::Buffer,
            ForeignValue::Callable(_) => ValueKind::Callable,
            ForeignValue::Object(_) => ValueKind::Object,
        }
    }

    pub fn is_none(&self) -> bool {
        matches!(self, ForeignValue::None)
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            ForeignValue::Bool(value) => Some(*value),
            _ => None,
        }
    }

    /// Integers, and floats with no fractional part
    pub fn as_int(&self) -> Option<i64> {
        match self {
            ForeignValue::Int(value) => Some(*value),
            ForeignValue::Float(value) if value.fract() == 0.0 => Some(*value as i64),
            _ => None,
        }
    }

    pub fn as_float(&self) -> Option<f64> {
        match self {
            ForeignValue::Float(value) => Some(*value),
            ForeignValue::Int(value) => Some(*value as f64),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            ForeignValue::Str(value) => Some(value),
            _ => None,
        }
    }

    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            ForeignValue::Bytes(value) => Some(value),
            _ => None,
        }
    }

    pub fn as_object(&self) -> Option<ForeignRef> {
        match self {
            ForeignValue::Object(reference) => Some(*reference),
            _ => None,
        }
    }
}

impl From<bool> for ForeignValue {
    fn from(value: bool) -> Self {
        ForeignValue::Bool(value)
    }
}

impl From<i64> for ForeignValue {
    fn from(value: i64) -> Self {
        ForeignValue::Int(value)
    }
}

impl From<u8> for ForeignValue {
    fn from(value: u8) -> Self {
        ForeignValue::Int(i64::from(value))
    }
}

impl From<u32> for ForeignValue {
    fn from(value: u32) -> Self {
        ForeignValue::Int(i64::from(value))
    }
}

impl From<f64> for ForeignValue {
    fn from(value: f64) -> Self {
        ForeignValue::Float(value)
    }
}

impl From<&str> for ForeignValue {
    fn from(value: &str) -> Self {
        ForeignValue::Str(value.to_string())
    }
}

impl From<String> for ForeignValue {
    fn from(value: String) -> Self {
        ForeignValue::Str(value)
    }
}

impl From<Vec<u8>> for ForeignValue {
    fn from(value: Vec<u8>) -> Self {
        ForeignValue::Bytes(value)
    }
}

impl From<&[u8]> for ForeignValue {
    fn from(value: &[u8]) -> Self {
        ForeignValue::Bytes(value.to_vec())
    }
}

impl From<ForeignRef> for ForeignValue {
    fn from(value: ForeignRef) -> Self {
        ForeignValue::Object(value)
    }
}

impl<T: Into<ForeignValue>> From<Option<T>> for ForeignValue {
    fn from(value: Option<T>) -> Self {
        value.map(Into::into).unwrap_or(ForeignValue::None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_tags() {
        assert_eq!(ForeignValue::None.kind(), ValueKind::Primitive);
        assert_eq!(ForeignValue::from(3i64).kind(), ValueKind::Primitive);
        assert_eq!(ForeignValue::from("x").kind(), ValueKind::String);
        assert_eq!(ForeignValue::from(vec![1u8]).kind(), ValueKind::Buffer);
        assert_eq!(ForeignValue::Callable(CallbackId(1)).kind(), ValueKind::Callable);
        assert_eq!(ForeignValue::Object(ForeignRef(1)).kind(), ValueKind::Object);
    }

    #[test]
    fn test_numeric_accessors() {
        assert_eq!(ForeignValue::Float(4.0).as_int(), Some(4));
        assert_eq!(ForeignValue::Float(4.5).as_int(), None);
        assert_eq!(ForeignValue::Int(2).as_float(), Some(2.0));
        assert_eq!(ForeignValue::from(None::<bool>), ForeignValue::None);
    }

    #[test]
    fn test_host_value_wire_form() {
        let json = serde_json::to_string(&HostValue::Handle(HostHandle(7))).unwrap();
        assert_eq!(json, r#"{"type":"handle","value":7}"#);
        let json = serde_json::to_string(&HostValue::Undefined).unwrap();
        assert_eq!(json, r#"{"type":"undefined"}"#);
    }
}
