//! Host value representation
//!
//! The dynamically typed values host code exchanges with the interop layer.
//! - Null, Bool, Int, Float: immediate values
//! - Int is 128-bit so every signed or unsigned 64-bit native integer fits
//! - Str: reference-counted, immutable
//! - List / Record: ordered sequences and field maps (struct contents)
//! - Handle: a typed native address (see `ffi::handle`)
//! - Function: a host closure, used as a callback argument

use crate::ffi::{FfiError, Handle};
use std::collections::BTreeMap;
use std::fmt;
use std::rc::Rc;

/// Field name → value map used for struct contents and multi-value results
pub type FieldMap = BTreeMap<String, Value>;

/// Host function callable from the binding layer and the callback bridge
pub type HostFunction = Rc<dyn Fn(&[Value]) -> Result<Value, FfiError>>;

/// Runtime value as seen by host code
#[derive(Clone)]
pub enum Value {
    /// Absent value (null pointer, void return)
    Null,
    /// Boolean value
    Bool(bool),
    /// Integer value
    Int(i128),
    /// Floating point value
    Float(f64),
    /// String value
    Str(Rc<str>),
    /// Ordered sequence (fixed arrays)
    List(Vec<Value>),
    /// Field map (struct contents)
    Record(FieldMap),
    /// Native handle
    Handle(Handle),
    /// Host function
    Function(HostFunction),
}

impl Value {
    /// Create a string value
    pub fn string(s: impl AsRef<str>) -> Self {
        Value::Str(Rc::from(s.as_ref()))
    }

    /// Wrap a Rust closure as a function value
    pub fn function<F>(f: F) -> Self
    where
        F: Fn(&[Value]) -> Result<Value, FfiError> + 'static,
    {
        Value::Function(Rc::new(f))
    }

    /// Get the type name for error messages
    pub fn type_name(&self) -> &'static str {
        match self {
            Value::Null => "null",
            Value::Bool(_) => "bool",
            Value::Int(_) => "int",
            Value::Float(_) => "float",
            Value::Str(_) => "string",
            Value::List(_) => "list",
            Value::Record(_) => "record",
            Value::Handle(_) => "handle",
            Value::Function(_) => "function",
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    pub fn as_int(&self) -> Option<i128> {
        match self {
            Value::Int(i) => Some(*i),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Str(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_handle(&self) -> Option<&Handle> {
        match self {
            Value::Handle(h) => Some(h),
            _ => None,
        }
    }

    pub fn as_record(&self) -> Option<&FieldMap> {
        match self {
            Value::Record(r) => Some(r),
            _ => None,
        }
    }

    pub fn as_list(&self) -> Option<&[Value]> {
        match self {
            Value::List(items) => Some(items),
            _ => None,
        }
    }
}

impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Value::Null, Value::Null) => true,
            (Value::Bool(a), Value::Bool(b)) => a == b,
            (Value::Int(a), Value::Int(b)) => a == b,
            (Value::Float(a), Value::Float(b)) => a == b,
            (Value::Str(a), Value::Str(b)) => a == b,
            (Value::List(a), Value::List(b)) => a == b,
            (Value::Record(a), Value::Record(b)) => a == b,
            // Handles compare by the memory they denote
            (Value::Handle(a), Value::Handle(b)) => {
                a.address() == b.address() && a.tag() == b.tag()
            }
            (Value::Function(a), Value::Function(b)) => Rc::ptr_eq(a, b),
            _ => false,
        }
    }
}

impl fmt::Debug for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Null => write!(f, "Null"),
            Value::Bool(b) => write!(f, "Bool({})", b),
            Value::Int(i) => write!(f, "Int({})", i),
            Value::Float(x) => write!(f, "Float({})", x),
            Value::Str(s) => write!(f, "Str({:?})", s),
            Value::List(items) => f.debug_list().entries(items).finish(),
            Value::Record(fields) => f.debug_map().entries(fields).finish(),
            Value::Handle(h) => write!(f, "{:?}", h),
            Value::Function(_) => write!(f, "<function>"),
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Null => write!(f, "null"),
            Value::Bool(b) => write!(f, "{}", b),
            Value::Int(i) => write!(f, "{}", i),
            Value::Float(x) => write!(f, "{}", x),
            Value::Str(s) => write!(f, "{:?}", s),
            Value::List(items) => {
                write!(f, "[")?;
                for (i, item) in items.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{}", item)?;
                }
                write!(f, "]")
            }
            Value::Record(fields) => {
                write!(f, "{{")?;
                for (i, (name, value)) in fields.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{}: {}", name, value)?;
                }
                write!(f, "}}")
            }
            Value::Handle(h) => write!(f, "{}", h),
            Value::Function(_) => write!(f, "<function>"),
        }
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Value::Bool(b)
    }
}

macro_rules! impl_from_int {
    ($($t:ty),*) => {
        $(impl From<$t> for Value {
            fn from(n: $t) -> Self {
                Value::Int(n as i128)
            }
        })*
    };
}

impl_from_int!(i8, u8, i16, u16, i32, u32, i64, u64, isize, usize);

impl From<f64> for Value {
    fn from(x: f64) -> Self {
        Value::Float(x)
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::string(s)
    }
}

impl From<Handle> for Value {
    fn from(h: Handle) -> Self {
        Value::Handle(h)
    }
}

impl From<FieldMap> for Value {
    fn from(fields: FieldMap) -> Self {
        Value::Record(fields)
    }
}

impl From<Vec<Value>> for Value {
    fn from(items: Vec<Value>) -> Self {
        Value::List(items)
    }
}
