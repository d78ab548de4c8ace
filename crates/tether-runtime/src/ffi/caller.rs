//! FFI function calling through libffi
//!
//! A `FunctionDescriptor` states the native signature of one C function in
//! terms of parameter and return kinds. Binding it checks every type it names
//! against the descriptor table and prepares the libffi call interface once;
//! each call then only converts arguments and wraps the result.

use crate::bridge::Bridge;
use crate::ffi::callbacks::{CallScope, CallbackSignature, CallbackState, PreparedCallback};
use crate::ffi::error::{FfiError, FfiResult};
use crate::ffi::handle::{Address, Handle, TypeTag};
use crate::ffi::marshal::read_c_string;
use crate::ffi::types::{CValue, ScalarKind};
use crate::value::{FieldMap, HostFunction, Value};
use libffi::middle::{Cif, Closure, CodePtr, Type};
use libffi::raw;
use std::ffi::CString;
use std::fmt;
use std::mem::align_of;
use std::os::raw::{c_char, c_void};
use std::ptr;
use std::rc::Rc;

/// Value an out-parameter points to
#[derive(Debug, Clone, PartialEq)]
pub enum OutKind {
    Scalar(ScalarKind),
    /// Pointer written by the callee
    Handle { tag: TypeTag, owned: bool },
    /// Struct filled in by the callee
    Struct { tag: TypeTag },
}

/// Kind of one native parameter
#[derive(Debug, Clone, PartialEq)]
pub enum ParamKind {
    Scalar(ScalarKind),
    Handle { tag: TypeTag, nullable: bool },
    /// Struct passed by value (a handle or a field map)
    Struct { tag: TypeTag },
    /// `const char*`
    CString { nullable: bool },
    /// `const char* const*` built from a list of strings
    CStringArray,
    /// Caller-provided `char*` buffer the callee writes into
    StringBuffer { capacity: usize },
    /// Pointer to storage the callee writes a result into
    Out(OutKind),
    /// Native function pointer bridged from a host function
    Callback(CallbackSignature),
    /// Opaque pointer passed back to callbacks; takes no host argument
    ClientData,
}

impl ParamKind {
    pub fn handle(tag: impl Into<TypeTag>) -> Self {
        ParamKind::Handle {
            tag: tag.into(),
            nullable: false,
        }
    }

    pub fn nullable_handle(tag: impl Into<TypeTag>) -> Self {
        ParamKind::Handle {
            tag: tag.into(),
            nullable: true,
        }
    }

    pub fn structure(tag: impl Into<TypeTag>) -> Self {
        ParamKind::Struct { tag: tag.into() }
    }

    pub fn c_string() -> Self {
        ParamKind::CString { nullable: false }
    }

    fn consumes_argument(&self) -> bool {
        !matches!(self, ParamKind::ClientData)
    }

    fn ffi_type(&self, bridge: &Bridge) -> FfiResult<Type> {
        Ok(match self {
            ParamKind::Scalar(kind) => kind.ffi_type(),
            ParamKind::Struct { tag } => bridge.table().ffi_type(tag)?,
            _ => Type::pointer(),
        })
    }
}

/// One parameter of a function descriptor
#[derive(Debug, Clone, PartialEq)]
pub struct ParamDescriptor {
    pub name: String,
    pub kind: ParamKind,
    /// May be omitted by the host (treated as null / zero)
    pub optional: bool,
}

impl ParamDescriptor {
    pub fn new(name: impl Into<String>, kind: ParamKind) -> Self {
        Self {
            name: name.into(),
            kind,
            optional: false,
        }
    }

    pub fn optional(mut self) -> Self {
        self.optional = true;
        self
    }

    fn may_be_omitted(&self) -> bool {
        self.optional || matches!(self.kind, ParamKind::Out(_) | ParamKind::StringBuffer { .. })
    }
}

/// Kind of a native return value
#[derive(Debug, Clone, PartialEq)]
pub enum ReturnKind {
    Void,
    Scalar(ScalarKind),
    /// Pointer; null becomes `Value::Null`
    Handle { tag: TypeTag, owned: bool },
    /// Struct by value, surfaced as an Owned heap copy
    Struct { tag: TypeTag },
    CString,
}

impl ReturnKind {
    pub fn handle(tag: impl Into<TypeTag>, owned: bool) -> Self {
        ReturnKind::Handle {
            tag: tag.into(),
            owned,
        }
    }

    pub fn structure(tag: impl Into<TypeTag>) -> Self {
        ReturnKind::Struct { tag: tag.into() }
    }
}

/// Native signature of one C function
#[derive(Debug, Clone, PartialEq)]
pub struct FunctionDescriptor {
    pub name: String,
    pub params: Vec<ParamDescriptor>,
    pub returns: ReturnKind,
}

impl FunctionDescriptor {
    pub fn new(name: impl Into<String>, returns: ReturnKind) -> Self {
        Self {
            name: name.into(),
            params: Vec::new(),
            returns,
        }
    }

    pub fn param(mut self, name: impl Into<String>, kind: ParamKind) -> Self {
        self.params.push(ParamDescriptor::new(name, kind));
        self
    }

    pub fn optional_param(mut self, name: impl Into<String>, kind: ParamKind) -> Self {
        self.params.push(ParamDescriptor::new(name, kind).optional());
        self
    }

    /// (required, maximum) host argument counts
    pub fn arity(&self) -> (usize, usize) {
        let mut required = 0;
        let mut max = 0;
        for param in self.params.iter().filter(|p| p.kind.consumes_argument()) {
            max += 1;
            if !param.may_be_omitted() {
                required = max;
            }
        }
        (required, max)
    }
}

enum Slot {
    Value(CValue),
    /// Argument data lives elsewhere (struct passed by value)
    Memory(Address),
}

enum PendingOut {
    Word { name: String, kind: OutKind, cell: Box<u64> },
    Struct { name: String, handle: Handle },
    Buffer { name: String, bytes: Vec<u8> },
}

/// Per-call storage that must outlive the native call
#[derive(Default)]
struct CallArena {
    strings: Vec<CString>,
    string_arrays: Vec<Vec<*const c_char>>,
    temporaries: Vec<Handle>,
    outs: Vec<PendingOut>,
}

impl CallArena {
    fn c_string(&mut self, s: &str, param: &str) -> FfiResult<usize> {
        let c = CString::new(s)
            .map_err(|_| FfiError::conversion(format!("{:?}", s), param, "string contains a NUL byte"))?;
        let address = c.as_ptr() as usize;
        self.strings.push(c);
        Ok(address)
    }
}

/// A C function bound to its descriptor
pub struct BoundFunction {
    descriptor: FunctionDescriptor,
    code: CodePtr,
    cif: Cif,
    callbacks: Vec<Option<PreparedCallback>>,
    return_size: usize,
    required: usize,
    max: usize,
    bridge: Rc<Bridge>,
}

impl BoundFunction {
    /// Bind a native function pointer to its descriptor
    ///
    /// Fails if the descriptor names unknown types, an owned handle type
    /// without a release function, or an over-aligned by-value struct.
    ///
    /// # Safety
    ///
    /// `code` must point to a function whose C signature matches
    /// `descriptor`, and must stay valid for the lifetime of the binding.
    pub unsafe fn new(descriptor: FunctionDescriptor, code: *const c_void, bridge: Rc<Bridge>) -> FfiResult<Self> {
        log::debug!("binding {}", descriptor.name);
        let table = bridge.table();
        let mut arg_types = Vec::with_capacity(descriptor.params.len());
        let mut callbacks = Vec::with_capacity(descriptor.params.len());
        for param in &descriptor.params {
            let mut prepared = None;
            match &param.kind {
                ParamKind::Handle { tag, .. } if !table.is_known(tag) => {
                    return Err(FfiError::UnknownType(tag.to_string()))
                }
                ParamKind::Struct { tag } => check_by_value(&bridge, tag)?,
                ParamKind::Out(OutKind::Handle { tag, owned }) => check_handle(&bridge, tag, *owned)?,
                ParamKind::Out(OutKind::Struct { tag }) => {
                    bridge.table().get_tag(tag)?;
                }
                ParamKind::Callback(signature) => {
                    prepared = Some(PreparedCallback::prepare(signature.clone(), table)?);
                }
                _ => {}
            }
            arg_types.push(param.kind.ffi_type(&bridge)?);
            callbacks.push(prepared);
        }

        let (return_type, return_size) = match &descriptor.returns {
            ReturnKind::Void => (Type::void(), 0),
            ReturnKind::Scalar(kind) => (kind.ffi_type(), kind.size()),
            ReturnKind::Handle { tag, owned } => {
                check_handle(&bridge, tag, *owned)?;
                (Type::pointer(), std::mem::size_of::<usize>())
            }
            ReturnKind::Struct { tag } => {
                check_by_value(&bridge, tag)?;
                (table.ffi_type(tag)?, table.get_tag(tag)?.size())
            }
            ReturnKind::CString => (Type::pointer(), std::mem::size_of::<usize>()),
        };

        let (required, max) = descriptor.arity();
        Ok(Self {
            cif: Cif::new(arg_types, return_type),
            code: CodePtr(code as *mut c_void),
            callbacks,
            return_size,
            required,
            max,
            descriptor,
            bridge,
        })
    }

    pub fn descriptor(&self) -> &FunctionDescriptor {
        &self.descriptor
    }

    pub fn name(&self) -> &str {
        &self.descriptor.name
    }

    /// (required, maximum) host argument counts
    pub fn arity(&self) -> (usize, usize) {
        (self.required, self.max)
    }

    /// Call the native function with host arguments
    ///
    /// The argument count is checked before anything else happens. Returns
    /// the converted return value, or a field map with `"return"` plus one
    /// entry per out-value when the call produces any.
    pub fn call(&self, args: &[Value]) -> FfiResult<Value> {
        if args.len() < self.required || args.len() > self.max {
            return Err(FfiError::ArityError {
                function: self.descriptor.name.clone(),
                required: self.required,
                max: self.max,
                got: args.len(),
            });
        }
        log::trace!("calling {} with {} argument(s)", self.descriptor.name, args.len());

        let params = &self.descriptor.params;
        let null = Value::Null;
        let mut remaining = args.iter();
        let inputs: Vec<&Value> = params
            .iter()
            .map(|param| {
                if param.kind.consumes_argument() {
                    remaining.next().unwrap_or(&null)
                } else {
                    &null
                }
            })
            .collect();

        let table = self.bridge.table();
        let scope = CallScope::new();
        let mut states = Vec::new();
        for (i, param) in params.iter().enumerate() {
            let Some(prepared) = &self.callbacks[i] else {
                continue;
            };
            match inputs[i] {
                Value::Function(function) => {
                    states.push((i, CallbackState::new(Rc::clone(function), prepared, table, &scope)))
                }
                Value::Null if param.optional => {}
                Value::Null => {
                    return Err(FfiError::NullHandle {
                        context: format!("callback parameter {}", param.name),
                    })
                }
                other => {
                    return Err(FfiError::conversion(
                        other.type_name(),
                        format!("callback parameter {}", param.name),
                        "expected a function",
                    ))
                }
            }
        }
        let closures: Vec<(usize, Closure<'_>)> = states
            .iter()
            .filter_map(|(i, state)| self.callbacks[*i].as_ref().map(|p| (*i, p.closure(state))))
            .collect();

        let mut arena = CallArena::default();
        let mut slots = Vec::with_capacity(params.len());
        for (i, param) in params.iter().enumerate() {
            let slot = match &param.kind {
                ParamKind::Callback(_) => {
                    let code = closures
                        .iter()
                        .find(|(index, _)| *index == i)
                        .map(|(_, closure)| *closure.code_ptr() as usize)
                        .unwrap_or(0);
                    Slot::Value(CValue::Pointer(code))
                }
                _ => self.convert_arg(param, inputs[i], &mut arena)?,
            };
            slots.push(slot);
        }
        let mut arg_ptrs: Vec<*mut c_void> = slots
            .iter()
            .map(|slot| match slot {
                Slot::Value(value) => value.slot_ptr(),
                Slot::Memory(address) => address.as_ptr(),
            })
            .collect();

        let mut ret = vec![0u64; self.return_size.div_ceil(8).max(1)];
        unsafe {
            raw::ffi_call(
                self.cif.as_raw_ptr(),
                Some(*self.code.as_safe_fun()),
                ret.as_mut_ptr() as *mut c_void,
                arg_ptrs.as_mut_ptr(),
            );
        }
        drop(closures);
        log::trace!("{} returned after {} callback invocation(s)", self.descriptor.name, scope.invocations());

        // Every result is wrapped before any error is reported, so owned
        // handles among them are released on drop whatever fails
        let returned = unsafe { self.convert_return(ret.as_ptr() as *const u8) };
        let outs: Vec<FfiResult<(String, Value)>> = arena
            .outs
            .into_iter()
            .map(|out| unsafe { self.read_out(out) })
            .collect();
        drop(arena.temporaries);
        scope.close()?;

        let returned = returned?;
        let mut outputs = FieldMap::new();
        for out in outs {
            let (name, value) = out?;
            outputs.insert(name, value);
        }
        if outputs.is_empty() {
            return Ok(returned);
        }
        if !matches!(self.descriptor.returns, ReturnKind::Void) {
            outputs.insert("return".to_string(), returned);
        }
        Ok(Value::Record(outputs))
    }

    /// Wrap this binding as a host function value
    pub fn into_host_function(self) -> HostFunction {
        Rc::new(move |args: &[Value]| self.call(args))
    }

    fn convert_arg(&self, param: &ParamDescriptor, value: &Value, arena: &mut CallArena) -> FfiResult<Slot> {
        let table = self.bridge.table();
        Ok(match &param.kind {
            ParamKind::Scalar(kind) => match value {
                Value::Null if param.optional => Slot::Value(CValue::zero(*kind)),
                other => Slot::Value(CValue::from_value(other, *kind)?),
            },
            ParamKind::Handle { tag, nullable } => {
                let address = table.unwrap_value(value, tag, *nullable || param.optional)?;
                Slot::Value(CValue::Pointer(address.as_usize()))
            }
            ParamKind::Struct { tag } => {
                let (address, temporary) = self.bridge.marshaller().by_value_arg(tag, value)?;
                arena.temporaries.extend(temporary);
                Slot::Memory(address)
            }
            ParamKind::CString { nullable } => match value {
                Value::Str(s) => Slot::Value(CValue::Pointer(arena.c_string(s, &param.name)?)),
                Value::Null if *nullable || param.optional => Slot::Value(CValue::Pointer(0)),
                Value::Null => {
                    return Err(FfiError::NullHandle {
                        context: format!("string parameter {}", param.name),
                    })
                }
                other => return Err(FfiError::conversion(other.type_name(), &param.name, "expected a string")),
            },
            ParamKind::CStringArray => match value {
                Value::List(items) => {
                    let mut pointers = Vec::with_capacity(items.len() + 1);
                    for item in items {
                        let s = item.as_str().ok_or_else(|| {
                            FfiError::conversion(item.type_name(), &param.name, "expected a list of strings")
                        })?;
                        pointers.push(arena.c_string(s, &param.name)? as *const c_char);
                    }
                    pointers.push(ptr::null());
                    let address = pointers.as_ptr() as usize;
                    arena.string_arrays.push(pointers);
                    Slot::Value(CValue::Pointer(address))
                }
                Value::Null => Slot::Value(CValue::Pointer(0)),
                other => {
                    return Err(FfiError::conversion(other.type_name(), &param.name, "expected a list of strings"))
                }
            },
            ParamKind::StringBuffer { capacity } => {
                let mut bytes = vec![0u8; (*capacity).max(1)];
                match value {
                    Value::Null => {}
                    Value::Str(s) if s.len() < bytes.len() => bytes[..s.len()].copy_from_slice(s.as_bytes()),
                    Value::Str(s) => {
                        return Err(FfiError::conversion(
                            format!("{} bytes", s.len()),
                            &param.name,
                            format!("does not fit a {} byte buffer", capacity),
                        ))
                    }
                    other => return Err(FfiError::conversion(other.type_name(), &param.name, "expected a string")),
                }
                let address = bytes.as_mut_ptr() as usize;
                arena.outs.push(PendingOut::Buffer {
                    name: param.name.clone(),
                    bytes,
                });
                Slot::Value(CValue::Pointer(address))
            }
            ParamKind::Out(kind) => match value {
                Value::Null => self.allocate_out(&param.name, kind, arena)?,
                supplied => {
                    let expected = match kind {
                        OutKind::Struct { tag } => tag.clone(),
                        _ => TypeTag::VOID,
                    };
                    let address = table.unwrap_value(supplied, &expected, false)?;
                    Slot::Value(CValue::Pointer(address.as_usize()))
                }
            },
            ParamKind::ClientData => Slot::Value(CValue::Pointer(0)),
            ParamKind::Callback(_) => Slot::Value(CValue::Pointer(0)),
        })
    }

    fn allocate_out(&self, name: &str, kind: &OutKind, arena: &mut CallArena) -> FfiResult<Slot> {
        match kind {
            OutKind::Struct { tag } => {
                let handle = self.bridge.marshaller().allocate(self.bridge.table().get_tag(tag)?, None)?;
                let address = handle.address();
                arena.outs.push(PendingOut::Struct {
                    name: name.to_string(),
                    handle,
                });
                Ok(Slot::Value(CValue::Pointer(address.as_usize())))
            }
            scalar_or_handle => {
                let mut cell = Box::new(0u64);
                let address = &mut *cell as *mut u64 as usize;
                arena.outs.push(PendingOut::Word {
                    name: name.to_string(),
                    kind: scalar_or_handle.clone(),
                    cell,
                });
                Ok(Slot::Value(CValue::Pointer(address)))
            }
        }
    }

    unsafe fn read_out(&self, out: PendingOut) -> FfiResult<(String, Value)> {
        Ok(match out {
            PendingOut::Word { name, kind, cell } => {
                let src = &*cell as *const u64 as *const u8;
                let value = match kind {
                    OutKind::Scalar(scalar) => CValue::read_from(scalar, src).to_value(),
                    OutKind::Handle { tag, owned } => self.wrap_pointer(CValue::read_pointer(src), &tag, owned)?,
                    OutKind::Struct { .. } => Value::Null,
                };
                (name, value)
            }
            PendingOut::Struct { name, handle } => (name, Value::Handle(handle)),
            PendingOut::Buffer { name, bytes } => {
                let end = bytes.iter().position(|&b| b == 0).unwrap_or(bytes.len());
                let text = std::str::from_utf8(&bytes[..end])
                    .map_err(|e| FfiError::conversion("string buffer", &name, e.to_string()))?;
                let value = Value::string(text);
                (name, value)
            }
        })
    }

    unsafe fn convert_return(&self, ret: *const u8) -> FfiResult<Value> {
        match &self.descriptor.returns {
            ReturnKind::Void => Ok(Value::Null),
            ReturnKind::Scalar(kind) => Ok(CValue::read_return(*kind, ret).to_value()),
            ReturnKind::Handle { tag, owned } => self.wrap_pointer(CValue::read_pointer(ret), tag, *owned),
            ReturnKind::Struct { tag } => Ok(Value::Handle(self.bridge.marshaller().heap_copy(tag, ret)?)),
            ReturnKind::CString => read_c_string(CValue::read_pointer(ret)),
        }
    }

    fn wrap_pointer(&self, address: Address, tag: &TypeTag, owned: bool) -> FfiResult<Value> {
        if address.is_null() {
            return Ok(Value::Null);
        }
        Ok(Value::Handle(self.bridge.wrap(address, tag.clone(), owned)?))
    }
}

impl fmt::Debug for BoundFunction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BoundFunction")
            .field("name", &self.descriptor.name)
            .field("required", &self.required)
            .field("max", &self.max)
            .finish()
    }
}

fn check_by_value(bridge: &Bridge, tag: &TypeTag) -> FfiResult<()> {
    let descriptor = bridge.table().get_tag(tag)?;
    if descriptor.align() > align_of::<u64>() {
        return Err(FfiError::UnsupportedSignature(format!("{} is over-aligned for by-value passing", tag)));
    }
    Ok(())
}

fn check_handle(bridge: &Bridge, tag: &TypeTag, owned: bool) -> FfiResult<()> {
    if !bridge.table().is_known(tag) {
        return Err(FfiError::UnknownType(tag.to_string()));
    }
    if owned && bridge.release_fn(tag).is_none() {
        return Err(FfiError::NoReleaseFunction(tag.clone()));
    }
    Ok(())
}
