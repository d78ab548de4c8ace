//! FFI Callbacks - let native code call host functions during a native call
//!
//! A host function is bridged into a native function pointer through a libffi
//! closure. The pointer is only valid inside one native call:
//! - every invocation wraps its native arguments as handles bound to the call
//!   scope (by-value structs are copied into the scope first)
//! - the host function runs synchronously on the calling thread
//! - errors and panics map to the abort code; the first one is kept and
//!   reported once the native call returns
//! - when the scope closes, every handle it created expires

use crate::ffi::error::{FfiError, FfiResult};
use crate::ffi::handle::{Address, Handle, ScopeToken, TypeTag};
use crate::ffi::layout::DescriptorTable;
use crate::ffi::marshal::read_c_string;
use crate::ffi::types::{CValue, ScalarKind};
use crate::value::{HostFunction, Value};
use libffi::low;
use libffi::middle::{Cif, Closure, Type};
use std::any::Any;
use std::cell::{Cell, RefCell};
use std::fmt;
use std::os::raw::c_void;
use std::panic::{self, AssertUnwindSafe};
use std::ptr;
use std::str::FromStr;

/// Traversal control returned by a visitor
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum VisitControl {
    /// Continue with the next sibling
    Continue,
    /// Descend into the children of the current node
    Recurse,
    /// Stop the traversal
    Break,
}

impl VisitControl {
    pub fn as_str(self) -> &'static str {
        match self {
            VisitControl::Continue => "continue",
            VisitControl::Recurse => "recurse",
            VisitControl::Break => "break",
        }
    }
}

impl fmt::Display for VisitControl {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for VisitControl {
    type Err = FfiError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "continue" => Ok(VisitControl::Continue),
            "recurse" => Ok(VisitControl::Recurse),
            "break" => Ok(VisitControl::Break),
            _ => Err(FfiError::conversion(
                format!("{:?}", s),
                "traversal control",
                "expected continue, recurse or break",
            )),
        }
    }
}

impl From<VisitControl> for Value {
    fn from(control: VisitControl) -> Self {
        Value::string(control.as_str())
    }
}

/// Native integer codes of the traversal control enum
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ControlFlowMapping {
    pub break_code: i32,
    pub continue_code: i32,
    pub recurse_code: i32,
}

impl ControlFlowMapping {
    /// `CXChildVisitResult`
    pub const CLANG: ControlFlowMapping = ControlFlowMapping {
        break_code: 0,
        continue_code: 1,
        recurse_code: 2,
    };

    pub fn code(&self, control: VisitControl) -> i32 {
        match control {
            VisitControl::Break => self.break_code,
            VisitControl::Continue => self.continue_code,
            VisitControl::Recurse => self.recurse_code,
        }
    }

    pub fn from_code(&self, code: i128) -> Option<VisitControl> {
        [VisitControl::Break, VisitControl::Continue, VisitControl::Recurse]
            .into_iter()
            .find(|&control| self.code(control) as i128 == code)
    }

    /// Interpret a host callback result
    ///
    /// Accepts the control names (any case) or the native integer codes.
    pub fn interpret(&self, value: &Value) -> FfiResult<VisitControl> {
        match value {
            Value::Str(s) => s.parse(),
            Value::Int(code) => self.from_code(*code).ok_or_else(|| {
                FfiError::conversion(code, "traversal control", "not a traversal control code")
            }),
            other => Err(FfiError::conversion(
                other.type_name(),
                "traversal control",
                "expected a string or an integer code",
            )),
        }
    }
}

impl Default for ControlFlowMapping {
    fn default() -> Self {
        ControlFlowMapping::CLANG
    }
}

/// One native argument of a callback
#[derive(Debug, Clone, PartialEq)]
pub enum CallbackArg {
    /// Pointer, surfaced as a scoped Borrowed handle (or null)
    Handle { tag: TypeTag },
    /// Struct by value, copied into the call scope
    Struct { tag: TypeTag },
    Scalar(ScalarKind),
    /// `const char*`, surfaced as a string (or null)
    CString,
    /// The opaque pointer handed through by the caller; not passed to the host
    ClientData,
}

impl CallbackArg {
    pub fn handle(tag: impl Into<TypeTag>) -> Self {
        CallbackArg::Handle { tag: tag.into() }
    }

    pub fn structure(tag: impl Into<TypeTag>) -> Self {
        CallbackArg::Struct { tag: tag.into() }
    }
}

/// What the native side expects back from a callback
#[derive(Debug, Clone, PartialEq)]
pub enum CallbackReturn {
    /// Traversal control enum
    ControlFlow(ControlFlowMapping),
    Scalar(ScalarKind),
    Void,
}

/// Native signature of a callback
#[derive(Debug, Clone, PartialEq)]
pub struct CallbackSignature {
    pub args: Vec<CallbackArg>,
    pub returns: CallbackReturn,
}

impl CallbackSignature {
    pub fn new(args: Vec<CallbackArg>, returns: CallbackReturn) -> Self {
        Self { args, returns }
    }

    /// Number of arguments surfaced to the host function
    pub fn host_arity(&self) -> usize {
        self.args
            .iter()
            .filter(|arg| !matches!(arg, CallbackArg::ClientData))
            .count()
    }
}

/// A signature checked against the descriptor table, with its call interface
pub(crate) struct PreparedCallback {
    signature: CallbackSignature,
    cif: Cif,
}

impl PreparedCallback {
    pub(crate) fn prepare(signature: CallbackSignature, table: &DescriptorTable) -> FfiResult<Self> {
        let mut arg_types = Vec::with_capacity(signature.args.len());
        for arg in &signature.args {
            arg_types.push(match arg {
                CallbackArg::Handle { tag } => {
                    if !table.is_known(tag) {
                        return Err(FfiError::UnknownType(tag.to_string()));
                    }
                    Type::pointer()
                }
                CallbackArg::Struct { tag } => {
                    let descriptor = table.get_tag(tag)?;
                    if descriptor.align() > std::mem::align_of::<u64>() {
                        return Err(FfiError::UnsupportedSignature(format!(
                            "callback struct {} is over-aligned",
                            tag
                        )));
                    }
                    table.ffi_type(tag)?
                }
                CallbackArg::Scalar(kind) => kind.ffi_type(),
                CallbackArg::CString | CallbackArg::ClientData => Type::pointer(),
            });
        }
        let return_type = match signature.returns {
            CallbackReturn::ControlFlow(_) => Type::i32(),
            CallbackReturn::Scalar(kind) => kind.ffi_type(),
            CallbackReturn::Void => Type::void(),
        };
        Ok(Self {
            cif: Cif::new(arg_types, return_type),
            signature,
        })
    }

    pub(crate) fn closure<'s>(&self, state: &'s CallbackState<'s>) -> Closure<'s> {
        Closure::new(self.cif.clone(), invoke, state)
    }
}

/// Scratch scope of one native call
///
/// Owns the copies of by-value callback arguments and the liveness flag of
/// every handle created during the call.
pub(crate) struct CallScope {
    token: ScopeToken,
    buffers: RefCell<Vec<Vec<u64>>>,
    first_error: RefCell<Option<FfiError>>,
    invocations: Cell<usize>,
}

impl CallScope {
    pub(crate) fn new() -> Self {
        Self {
            token: ScopeToken::new(),
            buffers: RefCell::new(Vec::new()),
            first_error: RefCell::new(None),
            invocations: Cell::new(0),
        }
    }

    fn borrowed(&self, address: Address, tag: &TypeTag) -> Handle {
        Handle::create_unregistered(address, tag.clone(), Some(self.token.clone()))
    }

    unsafe fn copy_in(&self, src: *const u8, size: usize) -> Address {
        let mut buffer = vec![0u64; size.div_ceil(8).max(1)];
        ptr::copy_nonoverlapping(src, buffer.as_mut_ptr() as *mut u8, size);
        let address = Address::from_mut_ptr(buffer.as_mut_ptr());
        // Moving the Vec into the list leaves its heap buffer in place
        self.buffers.borrow_mut().push(buffer);
        address
    }

    fn record_error(&self, error: FfiError) {
        let mut slot = self.first_error.borrow_mut();
        if slot.is_none() {
            log::warn!("host callback failed, aborting traversal: {}", error);
            *slot = Some(error);
        } else {
            log::debug!("ignoring further callback error: {}", error);
        }
    }

    fn failed(&self) -> bool {
        self.first_error.borrow().is_some()
    }

    pub(crate) fn invocations(&self) -> usize {
        self.invocations.get()
    }

    /// Expire the scope's handles and report the first callback error
    pub(crate) fn close(&self) -> FfiResult<()> {
        self.token.expire();
        self.buffers.borrow_mut().clear();
        match self.first_error.borrow_mut().take() {
            None => Ok(()),
            Some(FfiError::CallbackPanic(message)) => Err(FfiError::CallbackPanic(message)),
            Some(error) => Err(FfiError::Callback(Box::new(error))),
        }
    }
}

impl Drop for CallScope {
    fn drop(&mut self) {
        self.token.expire();
    }
}

/// Per-callback state handed to the libffi closure
pub(crate) struct CallbackState<'s> {
    function: HostFunction,
    prepared: &'s PreparedCallback,
    table: &'s DescriptorTable,
    scope: &'s CallScope,
}

impl<'s> CallbackState<'s> {
    pub(crate) fn new(
        function: HostFunction,
        prepared: &'s PreparedCallback,
        table: &'s DescriptorTable,
        scope: &'s CallScope,
    ) -> Self {
        Self {
            function,
            prepared,
            table,
            scope,
        }
    }

    fn abort_value(&self) -> Option<CValue> {
        match self.prepared.signature.returns {
            CallbackReturn::ControlFlow(mapping) => Some(CValue::I32(mapping.break_code)),
            CallbackReturn::Scalar(kind) => Some(CValue::zero(kind)),
            CallbackReturn::Void => None,
        }
    }

    unsafe fn dispatch(&self, args: *const *const c_void) -> FfiResult<Option<CValue>> {
        let signature = &self.prepared.signature;
        let mut values = Vec::with_capacity(signature.args.len());
        for (i, arg) in signature.args.iter().enumerate() {
            let slot = *args.add(i) as *const u8;
            match arg {
                CallbackArg::Handle { tag } => {
                    let address = CValue::read_pointer(slot);
                    values.push(if address.is_null() {
                        Value::Null
                    } else {
                        Value::Handle(self.scope.borrowed(address, tag))
                    });
                }
                CallbackArg::Struct { tag } => {
                    let size = self.table.get_tag(tag)?.size();
                    let address = self.scope.copy_in(slot, size);
                    values.push(Value::Handle(self.scope.borrowed(address, tag)));
                }
                CallbackArg::Scalar(kind) => values.push(CValue::read_from(*kind, slot).to_value()),
                CallbackArg::CString => values.push(read_c_string(CValue::read_pointer(slot))?),
                CallbackArg::ClientData => {}
            }
        }

        let result = (self.function)(&values)?;
        match signature.returns {
            CallbackReturn::ControlFlow(mapping) => {
                let control = mapping.interpret(&result)?;
                log::trace!("callback returned {}", control);
                Ok(Some(CValue::I32(mapping.code(control))))
            }
            CallbackReturn::Scalar(kind) => Ok(Some(CValue::from_value(&result, kind)?)),
            CallbackReturn::Void => Ok(None),
        }
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

/// Write a callback result into libffi's return slot
///
/// Integral results narrower than a word are widened to a full `ffi_arg`.
unsafe fn write_return(out: *mut usize, value: CValue) {
    let word = match value {
        CValue::Bool(v) | CValue::U8(v) => v as usize,
        CValue::I8(v) => v as isize as usize,
        CValue::I16(v) => v as isize as usize,
        CValue::U16(v) => v as usize,
        CValue::I32(v) => v as isize as usize,
        CValue::U32(v) => v as usize,
        other => {
            other.write_to(out as *mut u8);
            return;
        }
    };
    out.write(word);
}

unsafe extern "C" fn invoke(
    _cif: &low::ffi_cif,
    result: &mut usize,
    args: *const *const c_void,
    state: &CallbackState<'_>,
) {
    let scope = state.scope;
    let count = scope.invocations.get() + 1;
    scope.invocations.set(count);
    log::trace!("callback invocation #{}", count);

    let value = if scope.failed() {
        state.abort_value()
    } else {
        match panic::catch_unwind(AssertUnwindSafe(|| state.dispatch(args))) {
            Ok(Ok(value)) => value,
            Ok(Err(error)) => {
                scope.record_error(error);
                state.abort_value()
            }
            Err(payload) => {
                scope.record_error(FfiError::CallbackPanic(panic_message(payload.as_ref())));
                state.abort_value()
            }
        }
    };
    if let Some(value) = value {
        write_return(result as *mut usize, value);
    }
}

/// Bridge a host function into a native function pointer for one native call
///
/// `body` receives the code pointer and performs the native call. Once it
/// returns the pointer is dead, handles created by the callback expire, and
/// the first callback error (if any) is returned instead of `body`'s result.
pub fn with_bridge<R>(
    table: &DescriptorTable,
    signature: &CallbackSignature,
    function: HostFunction,
    body: impl FnOnce(*const c_void) -> R,
) -> FfiResult<R> {
    let prepared = PreparedCallback::prepare(signature.clone(), table)?;
    let scope = CallScope::new();
    let result = {
        let state = CallbackState::new(function, &prepared, table, &scope);
        let closure = prepared.closure(&state);
        body(*closure.code_ptr() as *const c_void)
    };
    log::debug!("native call made {} callback invocation(s)", scope.invocations());
    scope.close()?;
    Ok(result)
}
