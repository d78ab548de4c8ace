//! Finalization registry for owned handles
//!
//! Every owned handle registers exactly one release action here. The action
//! is removed from the registry before it runs, so whichever path gets to it
//! first (explicit release, drop of the last host reference, or a flush) is
//! the only one that ever runs it. Running an action marks its handle as
//! released, so a flushed handle is rejected like an explicitly released one.

use crate::ffi::handle::{Address, Handle, Ownership, TypeTag};
use std::alloc::{dealloc, Layout};
use std::cell::{Cell, RefCell};
use std::collections::HashMap;
use std::fmt;
use std::os::raw::c_void;
use std::rc::Rc;

/// Native release function, e.g. `clang_disposeIndex`
pub type NativeRelease = unsafe extern "C" fn(*mut c_void);

/// Release action attached to an owned handle
pub enum Release {
    /// Call a native dispose function with the address
    Native(NativeRelease),
    /// Free a buffer allocated by the marshaller
    Dealloc(Layout),
    /// Run arbitrary host code with the address
    Custom(Box<dyn FnOnce(Address)>),
}

impl Release {
    fn run(self, address: Address) {
        match self {
            Release::Native(f) => unsafe { f(address.as_ptr()) },
            Release::Dealloc(layout) => {
                if !address.is_null() {
                    unsafe { dealloc(address.as_ptr() as *mut u8, layout) }
                }
            }
            Release::Custom(f) => f(address),
        }
    }
}

impl fmt::Debug for Release {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Release::Native(func) => write!(f, "Native({:p})", *func as *const ()),
            Release::Dealloc(layout) => write!(f, "Dealloc({:?})", layout),
            Release::Custom(_) => write!(f, "Custom"),
        }
    }
}

pub(crate) struct PendingRelease {
    address: Address,
    tag: TypeTag,
    action: Release,
    // Shared with the handle
    released: Rc<Cell<bool>>,
}

impl PendingRelease {
    fn run(self) {
        self.released.set(true);
        self.action.run(self.address);
    }
}

struct RegistryState {
    pending: HashMap<u64, PendingRelease>,
    released: u64,
    warn_on_leak: bool,
}

impl Drop for RegistryState {
    fn drop(&mut self) {
        if self.pending.is_empty() {
            return;
        }
        if self.warn_on_leak {
            log::warn!(
                "finalization registry dropped with {} pending release(s); releasing now",
                self.pending.len()
            );
        }
        for (_, entry) in self.pending.drain() {
            entry.run();
        }
    }
}

thread_local! {
    static CURRENT: FinalizationRegistry = FinalizationRegistry::new();
}

/// Registry of pending release actions
///
/// Cheap to clone; clones share the same state. The registry is
/// single-threaded like the handles it tracks.
#[derive(Clone)]
pub struct FinalizationRegistry {
    state: Rc<RefCell<RegistryState>>,
}

impl FinalizationRegistry {
    /// Create an empty registry
    pub fn new() -> Self {
        Self {
            state: Rc::new(RefCell::new(RegistryState {
                pending: HashMap::new(),
                released: 0,
                warn_on_leak: true,
            })),
        }
    }

    /// The registry shared by everything on the current thread
    pub fn current() -> Self {
        CURRENT.with(|registry| registry.clone())
    }

    /// Whether a flush at drop time logs a warning
    pub fn set_warn_on_leak(&self, warn: bool) {
        self.state.borrow_mut().warn_on_leak = warn;
    }

    /// Wrap a native address, registering its release action if owned
    pub fn wrap(&self, address: Address, tag: TypeTag, ownership: Ownership) -> Handle {
        Handle::create(self, address, tag, ownership, None)
    }

    pub(crate) fn register(
        &self,
        id: u64,
        address: Address,
        tag: TypeTag,
        action: Release,
        released: Rc<Cell<bool>>,
    ) {
        log::debug!("registering release for {} at {} (handle #{})", tag, address, id);
        let previous = self.state.borrow_mut().pending.insert(
            id,
            PendingRelease {
                address,
                tag,
                action,
                released,
            },
        );
        debug_assert!(previous.is_none(), "handle #{} registered twice", id);
    }

    /// Remove the pending action without running it
    pub(crate) fn cancel(&self, id: u64) -> Option<PendingRelease> {
        self.state.borrow_mut().pending.remove(&id)
    }

    /// Run a previously cancelled action
    pub(crate) fn run(&self, entry: PendingRelease) {
        log::debug!("releasing {} at {}", entry.tag, entry.address);
        self.state.borrow_mut().released += 1;
        // The borrow is dropped before running: actions may touch handles.
        entry.run();
    }

    /// Finalizer path, invoked when the last reference to a handle drops
    pub(crate) fn finalize(&self, id: u64) {
        if let Some(entry) = self.cancel(id) {
            log::debug!("finalizing unreachable handle #{}", id);
            self.run(entry);
        }
    }

    /// Run every pending release action now
    ///
    /// Handles whose action ran here are marked released: `unwrap` rejects
    /// them and an explicit `release` reports `DoubleRelease`. Returns the
    /// number of actions run.
    pub fn flush(&self) -> usize {
        let drained: Vec<PendingRelease> = {
            let mut state = self.state.borrow_mut();
            state.pending.drain().map(|(_, entry)| entry).collect()
        };
        let count = drained.len();
        for entry in drained {
            self.run(entry);
        }
        count
    }

    /// Number of owned handles whose release has not run yet
    pub fn pending(&self) -> usize {
        self.state.borrow().pending.len()
    }

    /// Number of release actions run so far
    pub fn released(&self) -> u64 {
        self.state.borrow().released
    }

    /// Whether the handle with this id still has a pending release
    pub fn is_pending(&self, id: u64) -> bool {
        self.state.borrow().pending.contains_key(&id)
    }
}

impl Default for FinalizationRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for FinalizationRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.state.borrow();
        f.debug_struct("FinalizationRegistry")
            .field("pending", &state.pending.len())
            .field("released", &state.released)
            .finish()
    }
}
