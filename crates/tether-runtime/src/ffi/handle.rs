//! Native handles
//!
//! A `Handle` is the only way host code refers to native memory. It carries
//! the address, a type tag naming the native type the address is presumed to
//! point to, and whether the host owns the resource. Clones share identity;
//! when the last clone of an owned handle drops, its release action runs
//! (unless it already ran through `release` or a registry flush).

use crate::ffi::error::{FfiError, FfiResult};
use crate::ffi::registry::{FinalizationRegistry, Release};
use crate::value::Value;
use serde::{Deserialize, Serialize};
use std::borrow::Cow;
use std::cell::{Cell, RefCell};
use std::collections::BTreeMap;
use std::ffi::CString;
use std::fmt;
use std::os::raw::{c_char, c_void};
use std::rc::Rc;
use std::sync::atomic::{AtomicU64, Ordering};

static NEXT_HANDLE_ID: AtomicU64 = AtomicU64::new(1);

/// Opaque native address
///
/// Compared by identity only; the handle layer never dereferences it.
#[derive(Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Address(usize);

impl Address {
    pub const NULL: Address = Address(0);

    pub fn from_ptr<T>(ptr: *const T) -> Self {
        Address(ptr as usize)
    }

    pub fn from_mut_ptr<T>(ptr: *mut T) -> Self {
        Address(ptr as usize)
    }

    pub const fn from_usize(addr: usize) -> Self {
        Address(addr)
    }

    pub fn as_ptr(self) -> *mut c_void {
        self.0 as *mut c_void
    }

    pub fn as_usize(self) -> usize {
        self.0
    }

    pub fn is_null(self) -> bool {
        self.0 == 0
    }
}

impl fmt::Debug for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}

/// Name of the native type a handle points to
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TypeTag(Cow<'static, str>);

impl TypeTag {
    /// Universal supertype (`void*`): accepts every tag
    pub const VOID: TypeTag = TypeTag(Cow::Borrowed("void"));

    pub const fn from_static(name: &'static str) -> Self {
        TypeTag(Cow::Borrowed(name))
    }

    pub fn new(name: impl Into<String>) -> Self {
        TypeTag(Cow::Owned(name.into()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_void(&self) -> bool {
        self.0 == "void"
    }

    /// Whether a handle tagged `actual` may be used where `self` is expected
    pub fn accepts(&self, actual: &TypeTag) -> bool {
        self.is_void() || self == actual
    }
}

impl fmt::Debug for TypeTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self.0)
    }
}

impl fmt::Display for TypeTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&'static str> for TypeTag {
    fn from(name: &'static str) -> Self {
        TypeTag::from_static(name)
    }
}

impl From<String> for TypeTag {
    fn from(name: String) -> Self {
        TypeTag::new(name)
    }
}

/// Ownership of the native resource behind a handle
#[derive(Debug)]
pub enum Ownership {
    /// The host owns the resource; the action runs exactly once
    Owned(Release),
    /// The resource belongs to someone else; nothing is ever released
    Borrowed,
}

/// Liveness flag shared by the handles a callback scope creates
#[derive(Clone, Debug)]
pub(crate) struct ScopeToken(Rc<Cell<bool>>);

impl ScopeToken {
    pub(crate) fn new() -> Self {
        ScopeToken(Rc::new(Cell::new(true)))
    }

    pub(crate) fn is_live(&self) -> bool {
        self.0.get()
    }

    pub(crate) fn expire(&self) {
        self.0.set(false);
    }
}

struct HandleInner {
    id: u64,
    address: Address,
    tag: TypeTag,
    owned: bool,
    const_qualified: bool,
    // Set by whichever path runs the release action
    released: Rc<Cell<bool>>,
    scope: Option<ScopeToken>,
    registry: Option<FinalizationRegistry>,
    // C strings written into this handle's buffer, keyed by field offset
    strings: RefCell<BTreeMap<usize, CString>>,
}

impl Drop for HandleInner {
    fn drop(&mut self) {
        if self.owned && !self.released.get() {
            if let Some(registry) = &self.registry {
                registry.finalize(self.id);
            }
        }
    }
}

/// Host-visible reference to native memory
#[derive(Clone)]
pub struct Handle(Rc<HandleInner>);

impl Handle {
    /// Wrap an address using the current thread's registry
    ///
    /// Never fails. Owned handles register their release action; registering
    /// two owned handles for the same resource is a caller bug that is not
    /// detected here.
    pub fn wrap(address: Address, tag: impl Into<TypeTag>, ownership: Ownership) -> Handle {
        FinalizationRegistry::current().wrap(address, tag.into(), ownership)
    }

    /// Wrap an address the host does not own
    pub fn borrowed(address: Address, tag: impl Into<TypeTag>) -> Handle {
        Handle::create_unregistered(address, tag.into(), None)
    }

    pub(crate) fn create(
        registry: &FinalizationRegistry,
        address: Address,
        tag: TypeTag,
        ownership: Ownership,
        scope: Option<ScopeToken>,
    ) -> Handle {
        match ownership {
            Ownership::Borrowed => Handle::create_unregistered(address, tag, scope),
            Ownership::Owned(action) => {
                let id = NEXT_HANDLE_ID.fetch_add(1, Ordering::Relaxed);
                let released = Rc::new(Cell::new(false));
                registry.register(id, address, tag.clone(), action, Rc::clone(&released));
                Handle(Rc::new(HandleInner {
                    id,
                    address,
                    tag,
                    owned: true,
                    const_qualified: false,
                    released,
                    scope,
                    registry: Some(registry.clone()),
                    strings: RefCell::new(BTreeMap::new()),
                }))
            }
        }
    }

    pub(crate) fn create_unregistered(
        address: Address,
        tag: TypeTag,
        scope: Option<ScopeToken>,
    ) -> Handle {
        Handle(Rc::new(HandleInner {
            id: NEXT_HANDLE_ID.fetch_add(1, Ordering::Relaxed),
            address,
            tag,
            owned: false,
            const_qualified: false,
            released: Rc::new(Cell::new(false)),
            scope,
            registry: None,
            strings: RefCell::new(BTreeMap::new()),
        }))
    }

    /// Mark a freshly created handle as const-qualified (informational)
    pub fn into_const(mut self) -> Handle {
        if let Some(inner) = Rc::get_mut(&mut self.0) {
            inner.const_qualified = true;
        }
        self
    }

    pub fn id(&self) -> u64 {
        self.0.id
    }

    pub fn address(&self) -> Address {
        self.0.address
    }

    pub fn tag(&self) -> &TypeTag {
        &self.0.tag
    }

    pub fn is_owned(&self) -> bool {
        self.0.owned
    }

    pub fn is_const(&self) -> bool {
        self.0.const_qualified
    }

    pub fn is_released(&self) -> bool {
        self.0.released.get()
    }

    /// Whether this handle came from a callback whose native call returned
    pub fn is_expired(&self) -> bool {
        self.0.scope.as_ref().is_some_and(|scope| !scope.is_live())
    }

    /// Same handle identity (not merely the same address)
    pub fn ptr_eq(&self, other: &Handle) -> bool {
        Rc::ptr_eq(&self.0, &other.0)
    }

    /// Get the address, checking the tag
    ///
    /// `void` as the expected tag accepts any handle.
    pub fn unwrap(&self, expected: &TypeTag) -> FfiResult<Address> {
        self.unwrap_with(expected, |expected, actual| expected.accepts(actual))
    }

    pub(crate) fn unwrap_with<F>(&self, expected: &TypeTag, accepts: F) -> FfiResult<Address>
    where
        F: Fn(&TypeTag, &TypeTag) -> bool,
    {
        self.check_usable()?;
        if !accepts(expected, &self.0.tag) {
            return Err(FfiError::TypeMismatch {
                expected: expected.clone(),
                found: self.0.tag.to_string(),
            });
        }
        Ok(self.0.address)
    }

    pub(crate) fn check_usable(&self) -> FfiResult<()> {
        if self.is_expired() {
            return Err(FfiError::ReentrancyViolation {
                tag: self.0.tag.clone(),
            });
        }
        if self.0.released.get() {
            return Err(FfiError::Released {
                tag: self.0.tag.clone(),
            });
        }
        Ok(())
    }

    /// Release an owned resource now
    ///
    /// Cancels the pending finalizer before running the action, so the
    /// action never runs twice. A handle whose action already ran (here or in
    /// a registry flush) reports `DoubleRelease`. Borrowed handles are left
    /// untouched.
    pub fn release(&self) -> FfiResult<()> {
        if !self.0.owned {
            log::trace!("ignoring release of borrowed {} at {}", self.0.tag, self.0.address);
            return Ok(());
        }
        if self.0.released.replace(true) {
            return Err(FfiError::DoubleRelease {
                tag: self.0.tag.clone(),
                address: self.0.address.to_string(),
            });
        }
        if let Some(registry) = &self.0.registry {
            if let Some(entry) = registry.cancel(self.0.id) {
                registry.run(entry);
            }
        }
        self.0.strings.borrow_mut().clear();
        Ok(())
    }

    /// Store the C string for the field at `slot`, returning its pointer
    ///
    /// The string lives as long as this handle or until the same field is
    /// written again. `None` drops the field's previous string and yields null.
    pub(crate) fn set_string(&self, slot: *const u8, s: Option<CString>) -> *const c_char {
        let offset = (slot as usize).wrapping_sub(self.0.address.as_usize());
        let mut strings = self.0.strings.borrow_mut();
        match s {
            Some(s) => {
                let ptr = s.as_ptr();
                strings.insert(offset, s);
                ptr
            }
            None => {
                strings.remove(&offset);
                std::ptr::null()
            }
        }
    }

    /// Number of C strings kept alive by this handle
    pub fn string_count(&self) -> usize {
        self.0.strings.borrow().len()
    }
}

impl fmt::Debug for Handle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Handle")
            .field("id", &self.0.id)
            .field("tag", &self.0.tag)
            .field("address", &self.0.address)
            .field("owned", &self.0.owned)
            .field("const", &self.0.const_qualified)
            .finish()
    }
}

impl fmt::Display for Handle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let ownership = if self.0.owned { "owned" } else { "borrowed" };
        write!(f, "<{} @ {} {}>", self.0.tag, self.0.address, ownership)
    }
}

/// Get the address behind a host value
///
/// `Value::Null` yields the null address when `nullable`, `NullHandle`
/// otherwise. Any non-handle value is a `TypeMismatch`.
pub fn unwrap(value: &Value, expected: &TypeTag, nullable: bool) -> FfiResult<Address> {
    match value {
        Value::Handle(handle) => handle.unwrap(expected),
        Value::Null if nullable => Ok(Address::NULL),
        Value::Null => Err(FfiError::NullHandle {
            context: format!("{} parameter", expected),
        }),
        other => Err(FfiError::TypeMismatch {
            expected: expected.clone(),
            found: other.type_name().to_string(),
        }),
    }
}
