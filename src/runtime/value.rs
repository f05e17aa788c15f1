//! Run-time values and identities.

use std::fmt;

use crate::metadata::signatures::TypeSig;

/// Index of an object or array on the interpreter heap.
pub type ObjectId = usize;

/// Identity of a type at run time: defining module and full name.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RuntimeType {
    /// Simple name of the defining module
    pub module: String,
    /// Full name, `Namespace.Name` or `Outer/Inner`
    pub name: String,
}

impl RuntimeType {
    /// Creates a type identity.
    pub fn new(module: impl Into<String>, name: impl Into<String>) -> Self {
        RuntimeType {
            module: module.into(),
            name: name.into(),
        }
    }
}

impl fmt::Display for RuntimeType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}]{}", self.module, self.name)
    }
}

/// Identity of a method at run time.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RuntimeMethod {
    /// Declaring type
    pub declaring: RuntimeType,
    /// Method name
    pub name: String,
    /// Number of declared parameters, `this` excluded
    pub arity: usize,
}

impl fmt::Display for RuntimeMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}::{}/{}", self.declaring.name, self.name, self.arity)
    }
}

/// Storage a managed pointer designates.
///
/// Arguments and locals name the activation that owns them, so an address handed to a callee
/// keeps reaching the caller's variable.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Location {
    /// An argument of an active frame
    Argument {
        /// Identity of the frame
        frame: u64,
        /// Argument index, `this` included
        index: usize,
    },
    /// A local of an active frame
    Local {
        /// Identity of the frame
        frame: u64,
        /// Local index
        index: usize,
    },
    /// Instance field of a heap object
    Field {
        /// The object
        object: ObjectId,
        /// Field name
        name: String,
    },
    /// Static field
    StaticField {
        /// Full name of the declaring type
        owner: String,
        /// Field name
        name: String,
    },
    /// Array element
    Element {
        /// The array
        array: ObjectId,
        /// Element index
        index: usize,
    },
}

impl fmt::Display for Location {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Location::Argument { frame, index } => write!(f, "&arg{index}@frame{frame}"),
            Location::Local { frame, index } => write!(f, "&local{index}@frame{frame}"),
            Location::Field { object, name } => write!(f, "&object#{object}.{name}"),
            Location::StaticField { owner, name } => write!(f, "&{owner}::{name}"),
            Location::Element { array, index } => write!(f, "&array#{array}[{index}]"),
        }
    }
}

/// A value on the evaluation stack, in a local, an argument, a field or an array element.
///
/// Primitive values are widened the way the evaluation stack widens them: every integer up to
/// 32 bits is an [`Value::I32`], both float sizes are [`Value::F64`]. Boxing is the identity.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    /// The null reference, also the result of void calls
    Null,
    /// 32-bit integer, booleans and characters included
    I32(i32),
    /// 64-bit integer
    I64(i64),
    /// Floating point
    F64(f64),
    /// String
    String(String),
    /// Object on the heap
    Object(ObjectId),
    /// Array on the heap
    Array(ObjectId),
    /// A loaded type token
    Type(RuntimeType),
    /// A loaded method token
    Method(RuntimeMethod),
    /// Managed pointer, as produced by `ldloca`, `ldarga`, `ldflda`, `ldsflda` and `ldelema`
    Address(Location),
}

impl Value {
    /// Zero value of `ty`: zero for primitive numeric types, null otherwise.
    #[must_use]
    pub fn default_for(ty: &RuntimeType) -> Value {
        match ty.name.as_str() {
            "System.Boolean" | "System.Char" | "System.SByte" | "System.Byte" | "System.Int16"
            | "System.UInt16" | "System.Int32" | "System.UInt32" => Value::I32(0),
            "System.Int64" | "System.UInt64" | "System.IntPtr" | "System.UIntPtr" => Value::I64(0),
            "System.Single" | "System.Double" => Value::F64(0.0),
            _ => Value::Null,
        }
    }

    /// Zero value of a signature type.
    pub(crate) fn zero_of(signature: &TypeSig) -> Value {
        match signature {
            TypeSig::Boolean
            | TypeSig::Char
            | TypeSig::I1
            | TypeSig::U1
            | TypeSig::I2
            | TypeSig::U2
            | TypeSig::I4
            | TypeSig::U4 => Value::I32(0),
            TypeSig::I8 | TypeSig::U8 | TypeSig::I | TypeSig::U => Value::I64(0),
            TypeSig::R4 | TypeSig::R8 => Value::F64(0.0),
            _ => Value::Null,
        }
    }

    /// The value as 32-bit integer.
    #[must_use]
    pub fn as_i32(&self) -> Option<i32> {
        match self {
            Value::I32(value) => Some(*value),
            _ => None,
        }
    }

    /// Integer values widened to 64 bits.
    #[must_use]
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Value::I32(value) => Some(i64::from(*value)),
            Value::I64(value) => Some(*value),
            _ => None,
        }
    }

    /// Numeric values as float.
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::I32(value) => Some(f64::from(*value)),
            Value::I64(value) => Some(*value as f64),
            Value::F64(value) => Some(*value),
            _ => None,
        }
    }

    /// The object id of an object reference.
    #[must_use]
    pub fn as_object(&self) -> Option<ObjectId> {
        match self {
            Value::Object(id) => Some(*id),
            _ => None,
        }
    }

    /// Truth value as used by `brtrue`: non-zero numbers and non-null references.
    #[must_use]
    pub fn is_truthy(&self) -> bool {
        match self {
            Value::Null => false,
            Value::I32(value) => *value != 0,
            Value::I64(value) => *value != 0,
            Value::F64(value) => *value != 0.0,
            _ => true,
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Null => write!(f, "null"),
            Value::I32(value) => write!(f, "{value}"),
            Value::I64(value) => write!(f, "{value}L"),
            Value::F64(value) => write!(f, "{value}"),
            Value::String(value) => write!(f, "{value:?}"),
            Value::Object(id) => write!(f, "object#{id}"),
            Value::Array(id) => write!(f, "array#{id}"),
            Value::Type(ty) => write!(f, "typeof({ty})"),
            Value::Method(method) => write!(f, "methodof({method})"),
            Value::Address(location) => write!(f, "{location}"),
        }
    }
}

impl From<i32> for Value {
    fn from(value: i32) -> Self {
        Value::I32(value)
    }
}

impl From<i64> for Value {
    fn from(value: i64) -> Self {
        Value::I64(value)
    }
}

impl From<bool> for Value {
    fn from(value: bool) -> Self {
        Value::I32(i32::from(value))
    }
}

impl From<&str> for Value {
    fn from(value: &str) -> Self {
        Value::String(value.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        assert_eq!(
            Value::default_for(&RuntimeType::new("mscorlib", "System.Int32")),
            Value::I32(0)
        );
        assert_eq!(
            Value::default_for(&RuntimeType::new("mscorlib", "System.Double")),
            Value::F64(0.0)
        );
        assert_eq!(
            Value::default_for(&RuntimeType::new("mscorlib", "System.String")),
            Value::Null
        );
        assert_eq!(Value::zero_of(&TypeSig::I8), Value::I64(0));
        assert_eq!(Value::zero_of(&TypeSig::Object), Value::Null);
    }

    #[test]
    fn conversions_and_truth() {
        assert_eq!(Value::from(true), Value::I32(1));
        assert_eq!(Value::I32(-3).as_i64(), Some(-3));
        assert_eq!(Value::I64(7).as_i32(), None);
        assert!(!Value::Null.is_truthy());
        assert!(Value::Object(0).is_truthy());
        assert!(!Value::I32(0).is_truthy());
        assert_eq!(Value::from("x").to_string(), "\"x\"");
    }
}
