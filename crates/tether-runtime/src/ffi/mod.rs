//! Foreign Function Interface (FFI) infrastructure
//!
//! Lets host code drive a C library through:
//! - Typed handles with per-handle ownership (`handle`, `registry`)
//! - Struct layouts and marshaling (`layout`, `marshal`)
//! - Extern function calls (`caller`)
//! - Callbacks from C into host functions (`callbacks`)
//! - Dynamic library loading (`loader`)
//! - A statically typed rendition of handles and traversal (`typed`)
//!
//! # Safety
//!
//! FFI operations involve `unsafe` code and careful memory management.
//! All unsafe code is isolated in this module with safe wrappers. The layer
//! does not validate that native addresses are still live; it only guarantees
//! that the handles it creates are tracked, typed and released at most once.

pub mod callbacks;
pub mod caller;
pub mod error;
pub mod handle;
pub mod layout;
pub mod loader;
pub mod marshal;
pub mod registry;
pub mod typed;
pub mod types;

pub use callbacks::{with_bridge, CallbackArg, CallbackReturn, CallbackSignature, ControlFlowMapping, VisitControl};
pub use caller::{BoundFunction, FunctionDescriptor, OutKind, ParamDescriptor, ParamKind, ReturnKind};
pub use error::{FfiError, FfiResult};
pub use handle::{unwrap, Address, Handle, Ownership, TypeTag};
pub use layout::{DescriptorTable, FieldKind, StructDescriptor, TableBuilder};
pub use loader::{lookup_symbol, LibraryLoader, LoadError};
pub use marshal::{read_c_string, ArrayLengthPolicy, Marshaller};
pub use registry::{FinalizationRegistry, NativeRelease, Release};
pub use typed::{traverse, traverse_with, Borrowed, NativeResource, Owned, TraverseFn, VisitFn, Visited};
pub use types::{CValue, ScalarKind};
