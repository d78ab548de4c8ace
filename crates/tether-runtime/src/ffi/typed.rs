//! Statically typed handles and traversal
//!
//! The dynamic layer checks ownership and argument lifetimes at run time.
//! Rust callers can get the same guarantees from the type system instead:
//! `Owned<T>` releases on drop, `Borrowed<'a, T>` cannot outlive its source,
//! and `traverse` hands the visitor `Visited` views that cannot escape a
//! single invocation.

use crate::ffi::callbacks::{ControlFlowMapping, VisitControl};
use crate::ffi::error::{FfiError, FfiResult};
use crate::ffi::handle::{Address, Handle, Ownership, TypeTag};
use crate::ffi::registry::{FinalizationRegistry, NativeRelease, Release};
use std::any::Any;
use std::fmt;
use std::marker::PhantomData;
use std::mem::ManuallyDrop;
use std::os::raw::{c_int, c_uint, c_void};
use std::panic::{self, AssertUnwindSafe};
use std::ptr::NonNull;

/// A native type known by tag
pub trait NativeResource {
    const TAG: &'static str;

    fn tag() -> TypeTag {
        TypeTag::from_static(Self::TAG)
    }
}

/// Uniquely owned native resource, released on drop
pub struct Owned<T: NativeResource> {
    ptr: NonNull<c_void>,
    release: NativeRelease,
    _marker: PhantomData<*mut T>,
}

impl<T: NativeResource> Owned<T> {
    /// Take ownership of `ptr`; `None` if it is null
    ///
    /// # Safety
    ///
    /// `ptr` must point to a live `T` that nothing else releases, and
    /// `release` must be the function that frees it.
    pub unsafe fn from_raw(ptr: *mut c_void, release: NativeRelease) -> Option<Self> {
        NonNull::new(ptr).map(|ptr| Owned {
            ptr,
            release,
            _marker: PhantomData,
        })
    }

    pub fn as_ptr(&self) -> *mut c_void {
        self.ptr.as_ptr()
    }

    pub fn borrow(&self) -> Borrowed<'_, T> {
        Borrowed {
            ptr: self.ptr.as_ptr(),
            _marker: PhantomData,
        }
    }

    /// Give up ownership without releasing
    pub fn into_raw(self) -> *mut c_void {
        let this = ManuallyDrop::new(self);
        this.ptr.as_ptr()
    }

    /// Hand ownership to the dynamic layer
    pub fn into_handle(self, registry: &FinalizationRegistry) -> Handle {
        let release = self.release;
        let address = Address::from_mut_ptr(self.into_raw());
        registry.wrap(address, T::tag(), Ownership::Owned(Release::Native(release)))
    }
}

impl<T: NativeResource> Drop for Owned<T> {
    fn drop(&mut self) {
        log::debug!("releasing {} at {:p}", T::TAG, self.ptr);
        unsafe { (self.release)(self.ptr.as_ptr()) }
    }
}

impl<T: NativeResource> fmt::Debug for Owned<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Owned<{}>({:p})", T::TAG, self.ptr)
    }
}

/// Non-owning view of a native resource, valid for `'a`
pub struct Borrowed<'a, T: NativeResource> {
    ptr: *mut c_void,
    _marker: PhantomData<&'a T>,
}

impl<T: NativeResource> Clone for Borrowed<'_, T> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<T: NativeResource> Copy for Borrowed<'_, T> {}

impl<'a, T: NativeResource> Borrowed<'a, T> {
    /// # Safety
    ///
    /// `ptr` must stay valid for `'a`.
    pub unsafe fn from_raw(ptr: *mut c_void) -> Self {
        Borrowed {
            ptr,
            _marker: PhantomData,
        }
    }

    /// View a dynamic handle, checking its tag and liveness
    pub fn from_handle(handle: &'a Handle) -> FfiResult<Self> {
        let address = handle.unwrap(&T::tag())?;
        if address.is_null() {
            return Err(FfiError::NullHandle {
                context: T::TAG.to_string(),
            });
        }
        Ok(Borrowed {
            ptr: address.as_ptr(),
            _marker: PhantomData,
        })
    }

    pub fn as_ptr(&self) -> *mut c_void {
        self.ptr
    }

    pub fn is_null(&self) -> bool {
        self.ptr.is_null()
    }

    /// Borrowed dynamic handle for the same address
    pub fn to_handle(&self) -> Handle {
        Handle::borrowed(Address::from_mut_ptr(self.ptr), T::tag())
    }
}

impl<T: NativeResource> fmt::Debug for Borrowed<'_, T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Borrowed<{}>({:p})", T::TAG, self.ptr)
    }
}

/// `CXCursorVisitor`-shaped visitor: (node, parent, client data) -> control code
pub type VisitFn<N> = unsafe extern "C" fn(N, N, *mut c_void) -> c_int;

/// `clang_visitChildren`-shaped traversal entry point
pub type TraverseFn<N> = unsafe extern "C" fn(N, VisitFn<N>, *mut c_void) -> c_uint;

/// One visitor argument, valid for a single invocation
///
/// Neither `Copy` nor `Clone`, and branded with the invocation's lifetime, so
/// a view cannot be kept once the visitor returns:
///
/// ```compile_fail
/// use std::os::raw::{c_uint, c_void};
/// use tether_runtime::ffi::{traverse, VisitControl, VisitFn, Visited};
///
/// unsafe extern "C" fn one_child(root: u32, visitor: VisitFn<u32>, data: *mut c_void) -> c_uint {
///     visitor(root + 1, root, data);
///     0
/// }
///
/// let mut kept: Vec<Visited<'_, u32>> = Vec::new();
/// unsafe {
///     traverse::<u32, _>(one_child, 0, |node, _parent| {
///         kept.push(node);
///         VisitControl::Continue
///     });
/// }
/// ```
pub struct Visited<'a, N> {
    raw: N,
    _call: PhantomData<fn(&'a ()) -> &'a ()>,
}

impl<'a, N> Visited<'a, N> {
    fn new(raw: N) -> Self {
        Visited {
            raw,
            _call: PhantomData,
        }
    }

    pub(crate) fn get(&self) -> &N {
        &self.raw
    }

    /// The native value, for passing on to other native functions
    ///
    /// # Safety
    ///
    /// The value must not be used after the visitor returns.
    pub unsafe fn raw(&self) -> N
    where
        N: Copy,
    {
        self.raw
    }
}

impl<N: fmt::Debug> fmt::Debug for Visited<'_, N> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Visited").field(&self.raw).finish()
    }
}

type Visitor<'f, N> = dyn for<'a> FnMut(Visited<'a, N>, Visited<'a, N>) -> VisitControl + 'f;

struct Traversal<'f, N> {
    visitor: &'f mut Visitor<'f, N>,
    mapping: ControlFlowMapping,
    panic: Option<Box<dyn Any + Send>>,
}

unsafe extern "C" fn trampoline<N: Copy>(node: N, parent: N, data: *mut c_void) -> c_int {
    let traversal = &mut *(data as *mut Traversal<'_, N>);
    if traversal.panic.is_some() {
        return traversal.mapping.break_code;
    }
    let visitor = &mut *traversal.visitor;
    match panic::catch_unwind(AssertUnwindSafe(|| visitor(Visited::new(node), Visited::new(parent)))) {
        Ok(control) => {
            log::trace!("typed visitor returned {}", control);
            traversal.mapping.code(control)
        }
        Err(payload) => {
            traversal.panic = Some(payload);
            traversal.mapping.break_code
        }
    }
}

/// Run a native child traversal with a Rust closure as the visitor
///
/// The closure's arguments are `Visited` views valid for one invocation
/// only. A panic in the closure stops the traversal and is resumed once the
/// native call has returned. Returns the native function's result.
///
/// # Safety
///
/// `visit_children` must call the visitor only during the call, passing the
/// client data it was given, and must expect the control codes in `mapping`.
pub unsafe fn traverse_with<N, F>(
    visit_children: TraverseFn<N>,
    root: N,
    mapping: ControlFlowMapping,
    mut visitor: F,
) -> u32
where
    N: Copy,
    F: for<'a> FnMut(Visited<'a, N>, Visited<'a, N>) -> VisitControl,
{
    let mut traversal = Traversal {
        visitor: &mut visitor,
        mapping,
        panic: None,
    };
    let data = &mut traversal as *mut Traversal<'_, N> as *mut c_void;
    let result = visit_children(root, trampoline::<N>, data);
    if let Some(payload) = traversal.panic.take() {
        panic::resume_unwind(payload);
    }
    result
}

/// `traverse_with` using the libclang control codes
///
/// # Safety
///
/// See `traverse_with`.
pub unsafe fn traverse<N, F>(visit_children: TraverseFn<N>, root: N, visitor: F) -> u32
where
    N: Copy,
    F: for<'a> FnMut(Visited<'a, N>, Visited<'a, N>) -> VisitControl,
{
    traverse_with(visit_children, root, ControlFlowMapping::CLANG, visitor)
}
