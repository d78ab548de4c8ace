//! Tether Runtime - native interop core
//!
//! This library exposes a C API to a dynamically typed host value model:
//! - Typed, ownership-aware handles around native addresses
//! - A finalization registry that releases owned handles exactly once
//! - A struct marshaller driven by static layout descriptors
//! - Function binding and a synchronous callback bridge built on libffi
//! - Descriptor tables for libclang

/// Tether runtime version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

pub mod bridge;
pub mod clang;
pub mod ffi;
pub mod value;

pub use bridge::Bridge;
pub use clang::ClangLibrary;
pub use ffi::{FfiError, FfiResult, Handle, TypeTag};
pub use value::{FieldMap, HostFunction, Value};
