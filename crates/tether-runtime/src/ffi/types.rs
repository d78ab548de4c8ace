//! FFI type system - C-compatible scalar types for the FFI boundary
//!
//! Defines:
//! - `ScalarKind`: the C scalar types descriptors can name
//! - `CValue`: runtime representation of C scalar values
//!
//! Type mapping:
//! - ScalarKind::I32 ↔ CValue::I32(i32) ↔ Value::Int
//! - ScalarKind::U64 ↔ CValue::U64(u64) ↔ Value::Int (no truncation: Int is 128-bit)
//! - ScalarKind::F64 ↔ CValue::F64(f64) ↔ Value::Float
//! - ScalarKind::Bool ↔ CValue::Bool(bool) ↔ Value::Bool

use crate::ffi::error::{FfiError, FfiResult};
use crate::ffi::handle::Address;
use crate::value::Value;
use libffi::middle::Type;
use serde::{Deserialize, Serialize};
use std::mem::{align_of, size_of};
use std::os::raw::c_void;

/// C scalar types
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScalarKind {
    /// C `_Bool`
    Bool,
    I8,
    U8,
    I16,
    U16,
    I32,
    U32,
    I64,
    U64,
    F32,
    F64,
    /// C `size_t`
    Usize,
    /// C `ptrdiff_t` / `ssize_t`
    Isize,
}

impl ScalarKind {
    /// Integer kind for a declared width in bits
    pub fn integer(width: u8, signed: bool) -> Option<ScalarKind> {
        match (width, signed) {
            (8, true) => Some(ScalarKind::I8),
            (8, false) => Some(ScalarKind::U8),
            (16, true) => Some(ScalarKind::I16),
            (16, false) => Some(ScalarKind::U16),
            (32, true) => Some(ScalarKind::I32),
            (32, false) => Some(ScalarKind::U32),
            (64, true) => Some(ScalarKind::I64),
            (64, false) => Some(ScalarKind::U64),
            _ => None,
        }
    }

    /// Float kind for a declared width in bits
    pub fn float(width: u8) -> Option<ScalarKind> {
        match width {
            32 => Some(ScalarKind::F32),
            64 => Some(ScalarKind::F64),
            _ => None,
        }
    }

    pub fn size(self) -> usize {
        match self {
            ScalarKind::Bool | ScalarKind::I8 | ScalarKind::U8 => 1,
            ScalarKind::I16 | ScalarKind::U16 => 2,
            ScalarKind::I32 | ScalarKind::U32 | ScalarKind::F32 => 4,
            ScalarKind::I64 | ScalarKind::U64 | ScalarKind::F64 => 8,
            ScalarKind::Usize | ScalarKind::Isize => size_of::<usize>(),
        }
    }

    pub fn align(self) -> usize {
        match self {
            ScalarKind::Bool | ScalarKind::I8 | ScalarKind::U8 => 1,
            ScalarKind::I16 | ScalarKind::U16 => align_of::<u16>(),
            ScalarKind::I32 | ScalarKind::U32 => align_of::<u32>(),
            ScalarKind::F32 => align_of::<f32>(),
            ScalarKind::I64 | ScalarKind::U64 => align_of::<u64>(),
            ScalarKind::F64 => align_of::<f64>(),
            ScalarKind::Usize | ScalarKind::Isize => align_of::<usize>(),
        }
    }

    pub fn is_float(self) -> bool {
        matches!(self, ScalarKind::F32 | ScalarKind::F64)
    }

    pub fn is_signed(self) -> bool {
        matches!(
            self,
            ScalarKind::I8
                | ScalarKind::I16
                | ScalarKind::I32
                | ScalarKind::I64
                | ScalarKind::Isize
                | ScalarKind::F32
                | ScalarKind::F64
        )
    }

    /// libffi type descriptor
    pub fn ffi_type(self) -> Type {
        match self {
            ScalarKind::Bool | ScalarKind::U8 => Type::u8(),
            ScalarKind::I8 => Type::i8(),
            ScalarKind::I16 => Type::i16(),
            ScalarKind::U16 => Type::u16(),
            ScalarKind::I32 => Type::i32(),
            ScalarKind::U32 => Type::u32(),
            ScalarKind::I64 => Type::i64(),
            ScalarKind::U64 => Type::u64(),
            ScalarKind::F32 => Type::f32(),
            ScalarKind::F64 => Type::f64(),
            ScalarKind::Usize => Type::usize(),
            ScalarKind::Isize => Type::isize(),
        }
    }

    /// Get a display name for this kind
    pub fn display_name(self) -> &'static str {
        match self {
            ScalarKind::Bool => "c_bool",
            ScalarKind::I8 => "int8_t",
            ScalarKind::U8 => "uint8_t",
            ScalarKind::I16 => "int16_t",
            ScalarKind::U16 => "uint16_t",
            ScalarKind::I32 => "int32_t",
            ScalarKind::U32 => "uint32_t",
            ScalarKind::I64 => "int64_t",
            ScalarKind::U64 => "uint64_t",
            ScalarKind::F32 => "float",
            ScalarKind::F64 => "double",
            ScalarKind::Usize => "size_t",
            ScalarKind::Isize => "ssize_t",
        }
    }
}

/// C value representation for the FFI boundary
///
/// Each variant owns its storage, so a pointer to the payload can be handed
/// to libffi as an argument slot.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum CValue {
    Bool(u8),
    I8(i8),
    U8(u8),
    I16(i16),
    U16(u16),
    I32(i32),
    U32(u32),
    I64(i64),
    U64(u64),
    F32(f32),
    F64(f64),
    Usize(usize),
    Isize(isize),
    /// Raw pointer argument (handles, strings, out-parameters, callbacks)
    Pointer(usize),
}

fn integer_of(value: &Value, kind: ScalarKind) -> FfiResult<i128> {
    match value {
        Value::Int(i) => Ok(*i),
        Value::Bool(b) => Ok(*b as i128),
        Value::Float(x) if x.is_finite() && x.fract() == 0.0 && x.abs() < 1e38 => Ok(*x as i128),
        Value::Float(x) => Err(FfiError::conversion(x, kind.display_name(), "not an integral number")),
        other => Err(FfiError::conversion(
            other.type_name(),
            kind.display_name(),
            "expected a number",
        )),
    }
}

fn float_of(value: &Value, kind: ScalarKind) -> FfiResult<f64> {
    match value {
        Value::Float(x) => Ok(*x),
        Value::Int(i) => Ok(*i as f64),
        other => Err(FfiError::conversion(
            other.type_name(),
            kind.display_name(),
            "expected a number",
        )),
    }
}

macro_rules! narrow {
    ($n:expr, $t:ty, $kind:expr) => {
        <$t>::try_from($n).map_err(|_| FfiError::conversion($n, $kind.display_name(), "value out of range"))?
    };
}

impl CValue {
    /// Marshal a host value to a C scalar
    ///
    /// Integers are range-checked against the declared width; nothing is
    /// silently truncated.
    pub fn from_value(value: &Value, kind: ScalarKind) -> FfiResult<CValue> {
        Ok(match kind {
            ScalarKind::Bool => match value {
                Value::Bool(b) => CValue::Bool(*b as u8),
                Value::Int(i) => CValue::Bool((*i != 0) as u8),
                other => {
                    return Err(FfiError::conversion(other.type_name(), kind.display_name(), "expected a bool"))
                }
            },
            ScalarKind::F32 => {
                let x = float_of(value, kind)?;
                if x.is_finite() && x.abs() > f32::MAX as f64 {
                    return Err(FfiError::conversion(x, kind.display_name(), "value out of range"));
                }
                CValue::F32(x as f32)
            }
            ScalarKind::F64 => CValue::F64(float_of(value, kind)?),
            _ => {
                let n = integer_of(value, kind)?;
                match kind {
                    ScalarKind::I8 => CValue::I8(narrow!(n, i8, kind)),
                    ScalarKind::U8 => CValue::U8(narrow!(n, u8, kind)),
                    ScalarKind::I16 => CValue::I16(narrow!(n, i16, kind)),
                    ScalarKind::U16 => CValue::U16(narrow!(n, u16, kind)),
                    ScalarKind::I32 => CValue::I32(narrow!(n, i32, kind)),
                    ScalarKind::U32 => CValue::U32(narrow!(n, u32, kind)),
                    ScalarKind::I64 => CValue::I64(narrow!(n, i64, kind)),
                    ScalarKind::U64 => CValue::U64(narrow!(n, u64, kind)),
                    ScalarKind::Usize => CValue::Usize(narrow!(n, usize, kind)),
                    ScalarKind::Isize => CValue::Isize(narrow!(n, isize, kind)),
                    ScalarKind::Bool | ScalarKind::F32 | ScalarKind::F64 => unreachable!(),
                }
            }
        })
    }

    /// Zero value of a kind
    pub fn zero(kind: ScalarKind) -> CValue {
        match kind {
            ScalarKind::Bool => CValue::Bool(0),
            ScalarKind::I8 => CValue::I8(0),
            ScalarKind::U8 => CValue::U8(0),
            ScalarKind::I16 => CValue::I16(0),
            ScalarKind::U16 => CValue::U16(0),
            ScalarKind::I32 => CValue::I32(0),
            ScalarKind::U32 => CValue::U32(0),
            ScalarKind::I64 => CValue::I64(0),
            ScalarKind::U64 => CValue::U64(0),
            ScalarKind::F32 => CValue::F32(0.0),
            ScalarKind::F64 => CValue::F64(0.0),
            ScalarKind::Usize => CValue::Usize(0),
            ScalarKind::Isize => CValue::Isize(0),
        }
    }

    /// Marshal a C scalar to a host value
    ///
    /// Signed kinds are sign-extended, unsigned kinds zero-extended.
    pub fn to_value(self) -> Value {
        match self {
            CValue::Bool(b) => Value::Bool(b != 0),
            CValue::I8(v) => Value::Int(v as i128),
            CValue::U8(v) => Value::Int(v as i128),
            CValue::I16(v) => Value::Int(v as i128),
            CValue::U16(v) => Value::Int(v as i128),
            CValue::I32(v) => Value::Int(v as i128),
            CValue::U32(v) => Value::Int(v as i128),
            CValue::I64(v) => Value::Int(v as i128),
            CValue::U64(v) => Value::Int(v as i128),
            CValue::F32(v) => Value::Float(v as f64),
            CValue::F64(v) => Value::Float(v),
            CValue::Usize(v) => Value::Int(v as i128),
            CValue::Isize(v) => Value::Int(v as i128),
            CValue::Pointer(p) => Value::Int(p as i128),
        }
    }

    /// Write the value to (possibly unaligned) native memory
    ///
    /// # Safety
    ///
    /// `dst` must be valid for writes of the value's size.
    pub unsafe fn write_to(self, dst: *mut u8) {
        match self {
            CValue::Bool(v) => dst.write(v),
            CValue::I8(v) => dst.cast::<i8>().write_unaligned(v),
            CValue::U8(v) => dst.write(v),
            CValue::I16(v) => dst.cast::<i16>().write_unaligned(v),
            CValue::U16(v) => dst.cast::<u16>().write_unaligned(v),
            CValue::I32(v) => dst.cast::<i32>().write_unaligned(v),
            CValue::U32(v) => dst.cast::<u32>().write_unaligned(v),
            CValue::I64(v) => dst.cast::<i64>().write_unaligned(v),
            CValue::U64(v) => dst.cast::<u64>().write_unaligned(v),
            CValue::F32(v) => dst.cast::<f32>().write_unaligned(v),
            CValue::F64(v) => dst.cast::<f64>().write_unaligned(v),
            CValue::Usize(v) => dst.cast::<usize>().write_unaligned(v),
            CValue::Isize(v) => dst.cast::<isize>().write_unaligned(v),
            CValue::Pointer(v) => dst.cast::<usize>().write_unaligned(v),
        }
    }

    /// Read a value of `kind` from (possibly unaligned) native memory
    ///
    /// # Safety
    ///
    /// `src` must be valid for reads of the kind's size.
    pub unsafe fn read_from(kind: ScalarKind, src: *const u8) -> CValue {
        match kind {
            ScalarKind::Bool => CValue::Bool(src.read()),
            ScalarKind::I8 => CValue::I8(src.cast::<i8>().read_unaligned()),
            ScalarKind::U8 => CValue::U8(src.read()),
            ScalarKind::I16 => CValue::I16(src.cast::<i16>().read_unaligned()),
            ScalarKind::U16 => CValue::U16(src.cast::<u16>().read_unaligned()),
            ScalarKind::I32 => CValue::I32(src.cast::<i32>().read_unaligned()),
            ScalarKind::U32 => CValue::U32(src.cast::<u32>().read_unaligned()),
            ScalarKind::I64 => CValue::I64(src.cast::<i64>().read_unaligned()),
            ScalarKind::U64 => CValue::U64(src.cast::<u64>().read_unaligned()),
            ScalarKind::F32 => CValue::F32(src.cast::<f32>().read_unaligned()),
            ScalarKind::F64 => CValue::F64(src.cast::<f64>().read_unaligned()),
            ScalarKind::Usize => CValue::Usize(src.cast::<usize>().read_unaligned()),
            ScalarKind::Isize => CValue::Isize(src.cast::<isize>().read_unaligned()),
        }
    }

    /// Read a scalar return value written by libffi
    ///
    /// libffi widens integral returns narrower than a machine word to a full
    /// `ffi_arg`, so those are read as a word and narrowed.
    ///
    /// # Safety
    ///
    /// `src` must point to a return buffer of at least one machine word.
    pub unsafe fn read_return(kind: ScalarKind, src: *const u8) -> CValue {
        let word = src.cast::<usize>().read_unaligned();
        match kind {
            ScalarKind::Bool => CValue::Bool(word as u8),
            ScalarKind::I8 => CValue::I8(word as i8),
            ScalarKind::U8 => CValue::U8(word as u8),
            ScalarKind::I16 => CValue::I16(word as i16),
            ScalarKind::U16 => CValue::U16(word as u16),
            ScalarKind::I32 if size_of::<usize>() > 4 => CValue::I32(word as i32),
            ScalarKind::U32 if size_of::<usize>() > 4 => CValue::U32(word as u32),
            _ => CValue::read_from(kind, src),
        }
    }

    /// Read a pointer from (possibly unaligned) native memory
    ///
    /// # Safety
    ///
    /// `src` must be valid for reads of a pointer.
    pub unsafe fn read_pointer(src: *const u8) -> Address {
        Address::from_usize(src.cast::<usize>().read_unaligned())
    }

    /// Pointer to the payload, for use as a libffi argument slot
    pub fn slot_ptr(&self) -> *mut c_void {
        match self {
            CValue::Bool(v) | CValue::U8(v) => v as *const u8 as *mut c_void,
            CValue::I8(v) => v as *const i8 as *mut c_void,
            CValue::I16(v) => v as *const i16 as *mut c_void,
            CValue::U16(v) => v as *const u16 as *mut c_void,
            CValue::I32(v) => v as *const i32 as *mut c_void,
            CValue::U32(v) => v as *const u32 as *mut c_void,
            CValue::I64(v) => v as *const i64 as *mut c_void,
            CValue::U64(v) => v as *const u64 as *mut c_void,
            CValue::F32(v) => v as *const f32 as *mut c_void,
            CValue::F64(v) => v as *const f64 as *mut c_void,
            CValue::Usize(v) | CValue::Pointer(v) => v as *const usize as *mut c_void,
            CValue::Isize(v) => v as *const isize as *mut c_void,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case(8, true, ScalarKind::I8)]
    #[case(8, false, ScalarKind::U8)]
    #[case(16, true, ScalarKind::I16)]
    #[case(32, false, ScalarKind::U32)]
    #[case(64, true, ScalarKind::I64)]
    #[case(64, false, ScalarKind::U64)]
    fn test_integer_kinds(#[case] width: u8, #[case] signed: bool, #[case] expected: ScalarKind) {
        assert_eq!(ScalarKind::integer(width, signed), Some(expected));
        assert_eq!(expected.size() * 8, width as usize);
    }

    #[test]
    fn test_invalid_widths() {
        assert_eq!(ScalarKind::integer(24, true), None);
        assert_eq!(ScalarKind::float(16), None);
    }

    #[test]
    fn test_marshal_number_to_i32() {
        assert_eq!(CValue::from_value(&Value::Int(42), ScalarKind::I32).unwrap(), CValue::I32(42));
        assert_eq!(CValue::from_value(&Value::Float(42.0), ScalarKind::I32).unwrap(), CValue::I32(42));
    }

    #[rstest]
    #[case(Value::Int(128), ScalarKind::I8)]
    #[case(Value::Int(-1), ScalarKind::U32)]
    #[case(Value::Int(1 << 40), ScalarKind::I32)]
    #[case(Value::Int(u64::MAX as i128 + 1), ScalarKind::U64)]
    #[case(Value::Float(1.5), ScalarKind::I64)]
    #[case(Value::Float(1e300), ScalarKind::F32)]
    #[case(Value::string("7"), ScalarKind::I32)]
    fn test_marshal_out_of_range(#[case] value: Value, #[case] kind: ScalarKind) {
        assert!(matches!(
            CValue::from_value(&value, kind),
            Err(FfiError::ConversionError { .. })
        ));
    }

    #[test]
    fn test_u64_max_round_trips_without_truncation() {
        let c = CValue::from_value(&Value::Int(u64::MAX as i128), ScalarKind::U64).unwrap();
        assert_eq!(c.to_value(), Value::Int(u64::MAX as i128));
    }

    #[test]
    fn test_sign_and_zero_extension() {
        let bytes = [0xffu8; 8];
        unsafe {
            assert_eq!(CValue::read_from(ScalarKind::I16, bytes.as_ptr()).to_value(), Value::Int(-1));
            assert_eq!(CValue::read_from(ScalarKind::U16, bytes.as_ptr()).to_value(), Value::Int(0xffff));
            assert_eq!(
                CValue::read_from(ScalarKind::U64, bytes.as_ptr()).to_value(),
                Value::Int(u64::MAX as i128)
            );
        }
    }

    #[test]
    fn test_write_then_read_unaligned() {
        let mut buf = [0u8; 16];
        unsafe {
            CValue::I32(-5).write_to(buf.as_mut_ptr().add(3));
            assert_eq!(CValue::read_from(ScalarKind::I32, buf.as_ptr().add(3)), CValue::I32(-5));
        }
    }

    #[test]
    fn test_bool_marshal() {
        assert_eq!(CValue::from_value(&Value::Bool(true), ScalarKind::Bool).unwrap(), CValue::Bool(1));
        assert_eq!(CValue::Bool(255).to_value(), Value::Bool(true));
    }
}
