//! libclang descriptor tables
//!
//! Layouts of the libclang aggregates, the opaque handle types with their
//! dispose functions, and function descriptors for the part of the API used
//! to parse a file, walk its cursors, and read locations, diagnostics and
//! strings. `ClangLibrary` loads libclang and binds all of it.

use crate::bridge::Bridge;
use crate::ffi::callbacks::{CallbackArg, CallbackReturn, CallbackSignature, ControlFlowMapping, VisitControl};
use crate::ffi::caller::{FunctionDescriptor, OutKind, ParamKind, ReturnKind};
use crate::ffi::error::{FfiError, FfiResult};
use crate::ffi::handle::{Handle, TypeTag};
use crate::ffi::layout::{DescriptorTable, FieldKind};
use crate::ffi::loader::{lookup_symbol, LibraryLoader};
use crate::ffi::registry::NativeRelease;
use crate::ffi::typed::{self, NativeResource, Owned, TraverseFn, Visited};
use crate::ffi::types::ScalarKind;
use crate::value::{HostFunction, Value};
use libloading::Library;
use std::collections::BTreeMap;
use std::fmt;
use std::mem::ManuallyDrop;
use std::os::raw::{c_int, c_void};
use std::rc::Rc;
use tether_config::Config;

/// `#[repr(C)]` mirrors of the libclang aggregates
pub mod raw {
    use std::os::raw::{c_char, c_int, c_uint, c_ulong, c_ulonglong, c_void};

    #[repr(C)]
    #[derive(Debug, Clone, Copy)]
    pub struct CXString {
        pub data: *const c_void,
        pub private_flags: c_uint,
    }

    #[repr(C)]
    #[derive(Debug, Clone, Copy)]
    pub struct CXCursor {
        pub kind: c_int,
        pub xdata: c_int,
        pub data: [*const c_void; 3],
    }

    #[repr(C)]
    #[derive(Debug, Clone, Copy)]
    pub struct CXType {
        pub kind: c_int,
        pub data: [*mut c_void; 2],
    }

    #[repr(C)]
    #[derive(Debug, Clone, Copy)]
    pub struct CXSourceLocation {
        pub ptr_data: [*const c_void; 2],
        pub int_data: c_uint,
    }

    #[repr(C)]
    #[derive(Debug, Clone, Copy)]
    pub struct CXSourceRange {
        pub ptr_data: [*const c_void; 2],
        pub begin_int_data: c_uint,
        pub end_int_data: c_uint,
    }

    #[repr(C)]
    #[derive(Debug, Clone, Copy)]
    pub struct CXToken {
        pub int_data: [c_uint; 4],
        pub ptr_data: *mut c_void,
    }

    #[repr(C)]
    #[derive(Debug, Clone, Copy)]
    pub struct CXUnsavedFile {
        pub filename: *const c_char,
        pub contents: *const c_char,
        pub length: c_ulong,
    }

    #[repr(C)]
    #[derive(Debug, Clone, Copy)]
    pub struct CXFileUniqueID {
        pub data: [c_ulonglong; 3],
    }

    #[repr(C)]
    #[derive(Debug, Clone, Copy)]
    pub struct CXVersion {
        pub major: c_int,
        pub minor: c_int,
        pub subminor: c_int,
    }

    #[repr(C)]
    #[derive(Debug, Clone, Copy)]
    pub struct CXPlatformAvailability {
        pub platform: CXString,
        pub introduced: CXVersion,
        pub deprecated: CXVersion,
        pub obsoleted: CXVersion,
        pub unavailable: c_int,
        pub message: CXString,
    }
}

pub const CX_INDEX: &str = "CXIndex";
pub const CX_TRANSLATION_UNIT: &str = "CXTranslationUnit";
pub const CX_DIAGNOSTIC: &str = "CXDiagnostic";
pub const CX_FILE: &str = "CXFile";
pub const CX_CLIENT_DATA: &str = "CXClientData";

/// Opaque types released by a dispose function, with that function's symbol
pub const RELEASE_FUNCTIONS: &[(&str, &str)] = &[
    (CX_INDEX, "clang_disposeIndex"),
    (CX_TRANSLATION_UNIT, "clang_disposeTranslationUnit"),
    (CX_DIAGNOSTIC, "clang_disposeDiagnostic"),
];

/// `CXIndex`
pub struct Index;

impl NativeResource for Index {
    const TAG: &'static str = CX_INDEX;
}

/// `CXTranslationUnit`
pub struct TranslationUnit;

impl NativeResource for TranslationUnit {
    const TAG: &'static str = CX_TRANSLATION_UNIT;
}

fn void_ptr() -> FieldKind {
    FieldKind::pointer(TypeTag::VOID, true)
}

fn unsigned() -> FieldKind {
    FieldKind::int(32, false)
}

fn signed() -> FieldKind {
    FieldKind::int(32, true)
}

fn unsigned_long() -> FieldKind {
    // LLP64 keeps `long` at 32 bits
    if cfg!(windows) {
        FieldKind::int(32, false)
    } else {
        FieldKind::int(64, false)
    }
}

/// Descriptor table for the libclang aggregates and opaque types
pub fn descriptor_table() -> FfiResult<DescriptorTable> {
    DescriptorTable::builder()
        .struct_type("CXString", [("data", void_ptr()), ("private_flags", unsigned())])
        .struct_type(
            "CXCursor",
            [
                ("kind", FieldKind::enum32()),
                ("xdata", signed()),
                ("data", FieldKind::array(void_ptr(), 3)),
            ],
        )
        .struct_type("CXType", [("kind", FieldKind::enum32()), ("data", FieldKind::array(void_ptr(), 2))])
        .struct_type(
            "CXSourceLocation",
            [("ptr_data", FieldKind::array(void_ptr(), 2)), ("int_data", unsigned())],
        )
        .struct_type(
            "CXSourceRange",
            [
                ("ptr_data", FieldKind::array(void_ptr(), 2)),
                ("begin_int_data", unsigned()),
                ("end_int_data", unsigned()),
            ],
        )
        .struct_type(
            "CXToken",
            [("int_data", FieldKind::array(unsigned(), 4)), ("ptr_data", void_ptr())],
        )
        .struct_type(
            "CXUnsavedFile",
            [
                ("Filename", FieldKind::cstring()),
                ("Contents", FieldKind::cstring()),
                ("Length", unsigned_long()),
            ],
        )
        .struct_type("CXFileUniqueID", [("data", FieldKind::array(FieldKind::int(64, false), 3))])
        .struct_type("CXVersion", [("Major", signed()), ("Minor", signed()), ("Subminor", signed())])
        .struct_type(
            "CXPlatformAvailability",
            [
                ("Platform", FieldKind::nested("CXString")),
                ("Introduced", FieldKind::nested("CXVersion")),
                ("Deprecated", FieldKind::nested("CXVersion")),
                ("Obsoleted", FieldKind::nested("CXVersion")),
                ("Unavailable", signed()),
                ("Message", FieldKind::nested("CXString")),
            ],
        )
        .opaque(CX_INDEX)
        .opaque(CX_TRANSLATION_UNIT)
        .opaque(CX_DIAGNOSTIC)
        .opaque(CX_FILE)
        .opaque(CX_CLIENT_DATA)
        .build()
}

/// `(cursor, parent, client_data) -> CXChildVisitResult`
pub fn cursor_visitor() -> CallbackSignature {
    CallbackSignature::new(
        vec![
            CallbackArg::structure("CXCursor"),
            CallbackArg::structure("CXCursor"),
            CallbackArg::ClientData,
        ],
        CallbackReturn::ControlFlow(ControlFlowMapping::CLANG),
    )
}

/// Function descriptors bound by `ClangLibrary`
pub fn function_descriptors() -> Vec<FunctionDescriptor> {
    use ScalarKind::{I32, U32};

    let cursor = || ParamKind::structure("CXCursor");
    let cx_string = || ReturnKind::structure("CXString");
    vec![
        FunctionDescriptor::new("clang_createIndex", ReturnKind::handle(CX_INDEX, true))
            .param("exclude_declarations_from_pch", ParamKind::Scalar(I32))
            .param("display_diagnostics", ParamKind::Scalar(I32)),
        FunctionDescriptor::new(
            "clang_parseTranslationUnit",
            ReturnKind::handle(CX_TRANSLATION_UNIT, true),
        )
        .param("index", ParamKind::handle(CX_INDEX))
        .param("source_filename", ParamKind::CString { nullable: true })
        .param("command_line_args", ParamKind::CStringArray)
        .param("num_command_line_args", ParamKind::Scalar(I32))
        .optional_param("unsaved_files", ParamKind::nullable_handle("CXUnsavedFile"))
        .optional_param("num_unsaved_files", ParamKind::Scalar(U32))
        .optional_param("options", ParamKind::Scalar(U32)),
        FunctionDescriptor::new("clang_getTranslationUnitCursor", ReturnKind::structure("CXCursor"))
            .param("unit", ParamKind::handle(CX_TRANSLATION_UNIT)),
        FunctionDescriptor::new("clang_getTranslationUnitSpelling", cx_string())
            .param("unit", ParamKind::handle(CX_TRANSLATION_UNIT)),
        FunctionDescriptor::new("clang_visitChildren", ReturnKind::Scalar(U32))
            .param("parent", cursor())
            .param("visitor", ParamKind::Callback(cursor_visitor()))
            .param("client_data", ParamKind::ClientData),
        FunctionDescriptor::new("clang_getCursorKind", ReturnKind::Scalar(I32)).param("cursor", cursor()),
        FunctionDescriptor::new("clang_getCursorKindSpelling", cx_string()).param("kind", ParamKind::Scalar(I32)),
        FunctionDescriptor::new("clang_equalCursors", ReturnKind::Scalar(U32))
            .param("a", cursor())
            .param("b", cursor()),
        FunctionDescriptor::new("clang_getCursorSpelling", cx_string()).param("cursor", cursor()),
        FunctionDescriptor::new("clang_getCursorType", ReturnKind::structure("CXType")).param("cursor", cursor()),
        FunctionDescriptor::new("clang_getTypeSpelling", cx_string()).param("type", ParamKind::structure("CXType")),
        FunctionDescriptor::new("clang_getCursorLocation", ReturnKind::structure("CXSourceLocation"))
            .param("cursor", cursor()),
        FunctionDescriptor::new("clang_getCursorExtent", ReturnKind::structure("CXSourceRange"))
            .param("cursor", cursor()),
        FunctionDescriptor::new("clang_getSpellingLocation", ReturnKind::Void)
            .param("location", ParamKind::structure("CXSourceLocation"))
            .optional_param(
                "file",
                ParamKind::Out(OutKind::Handle {
                    tag: TypeTag::from_static(CX_FILE),
                    owned: false,
                }),
            )
            .optional_param("line", ParamKind::Out(OutKind::Scalar(U32)))
            .optional_param("column", ParamKind::Out(OutKind::Scalar(U32)))
            .optional_param("offset", ParamKind::Out(OutKind::Scalar(U32))),
        FunctionDescriptor::new("clang_getFileName", cx_string()).param("file", ParamKind::handle(CX_FILE)),
        FunctionDescriptor::new("clang_getNumDiagnostics", ReturnKind::Scalar(U32))
            .param("unit", ParamKind::handle(CX_TRANSLATION_UNIT)),
        FunctionDescriptor::new("clang_getDiagnostic", ReturnKind::handle(CX_DIAGNOSTIC, true))
            .param("unit", ParamKind::handle(CX_TRANSLATION_UNIT))
            .param("index", ParamKind::Scalar(U32)),
        FunctionDescriptor::new("clang_getDiagnosticSpelling", cx_string())
            .param("diagnostic", ParamKind::handle(CX_DIAGNOSTIC)),
        FunctionDescriptor::new("clang_getDiagnosticSeverity", ReturnKind::Scalar(I32))
            .param("diagnostic", ParamKind::handle(CX_DIAGNOSTIC)),
        FunctionDescriptor::new("clang_getClangVersion", cx_string()),
        FunctionDescriptor::new("clang_getCString", ReturnKind::CString)
            .param("string", ParamKind::structure("CXString")),
        FunctionDescriptor::new("clang_disposeString", ReturnKind::Void)
            .param("string", ParamKind::structure("CXString")),
    ]
}

/// Register the dispose functions and bind every descriptor
///
/// `resolve` maps a symbol name to its address.
///
/// # Safety
///
/// Every address `resolve` returns must be the libclang function of that
/// name and stay valid while the returned functions are in use.
pub unsafe fn bind_all<F>(mut bridge: Bridge, mut resolve: F) -> FfiResult<(Rc<Bridge>, BTreeMap<String, HostFunction>)>
where
    F: FnMut(&str) -> FfiResult<*const c_void>,
{
    for (tag, symbol) in RELEASE_FUNCTIONS {
        let address = resolve(symbol)?;
        let release = std::mem::transmute::<*const c_void, NativeRelease>(address);
        bridge.register_release(*tag, release);
    }

    let bridge = Rc::new(bridge);
    let mut functions = BTreeMap::new();
    for descriptor in function_descriptors() {
        let code = resolve(&descriptor.name)?;
        let name = descriptor.name.clone();
        let bound = bridge.bind(descriptor, code)?;
        functions.insert(name, bound.into_host_function());
    }
    Ok((bridge, functions))
}

type CreateIndexFn = unsafe extern "C" fn(c_int, c_int) -> *mut c_void;

/// libclang, loaded and bound
pub struct ClangLibrary {
    bridge: Rc<Bridge>,
    functions: BTreeMap<String, HostFunction>,
    create_index: CreateIndexFn,
    dispose_index: NativeRelease,
    visit_children: TraverseFn<raw::CXCursor>,
    // Never unloaded: owned handles and their dispose functions may outlive this value
    _library: ManuallyDrop<Rc<Library>>,
}

impl ClangLibrary {
    /// Load the configured libclang and bind every descriptor
    pub fn open(config: &Config) -> FfiResult<Self> {
        let mut loader = LibraryLoader::from_config(config);
        let name = config.library_name().to_string();
        let library = loader.load(&name)?;
        let bridge = Bridge::from_config(descriptor_table()?, config);

        unsafe {
            let resolve = |symbol: &str| -> FfiResult<*const c_void> { Ok(lookup_symbol(&library, &name, symbol)?) };
            let (bridge, functions) = bind_all(bridge, resolve)?;
            let create_index = std::mem::transmute::<*const c_void, CreateIndexFn>(resolve("clang_createIndex")?);
            let dispose_index = std::mem::transmute::<*const c_void, NativeRelease>(resolve("clang_disposeIndex")?);
            let visit_children =
                std::mem::transmute::<*const c_void, TraverseFn<raw::CXCursor>>(resolve("clang_visitChildren")?);
            log::debug!("bound {} libclang functions from {}", functions.len(), name);

            Ok(Self {
                bridge,
                functions,
                create_index,
                dispose_index,
                visit_children,
                _library: ManuallyDrop::new(library),
            })
        }
    }

    pub fn bridge(&self) -> &Rc<Bridge> {
        &self.bridge
    }

    pub fn function(&self, name: &str) -> Option<&HostFunction> {
        self.functions.get(name)
    }

    pub fn function_names(&self) -> impl Iterator<Item = &str> {
        self.functions.keys().map(String::as_str)
    }

    /// Call a bound function by name
    pub fn call(&self, name: &str, args: &[Value]) -> FfiResult<Value> {
        let function = self
            .functions
            .get(name)
            .ok_or_else(|| FfiError::Host(format!("{} is not bound", name)))?;
        function(args)
    }

    /// `clang_createIndex` as a typed owned resource
    pub fn create_index(&self, exclude_declarations_from_pch: bool, display_diagnostics: bool) -> FfiResult<Owned<Index>> {
        let ptr = unsafe {
            (self.create_index)(
                c_int::from(exclude_declarations_from_pch),
                c_int::from(display_diagnostics),
            )
        };
        unsafe { Owned::from_raw(ptr, self.dispose_index) }.ok_or_else(|| FfiError::NullHandle {
            context: "clang_createIndex result".to_string(),
        })
    }

    /// Copy a cursor out of a `CXCursor` handle
    pub fn cursor(&self, handle: &Handle) -> FfiResult<raw::CXCursor> {
        let address = self.bridge.table().unwrap(handle, &TypeTag::from_static("CXCursor"))?;
        if address.is_null() {
            return Err(FfiError::NullHandle {
                context: "CXCursor".to_string(),
            });
        }
        Ok(unsafe { *(address.as_ptr() as *const raw::CXCursor) })
    }

    /// `clang_visitChildren` with a Rust closure as the visitor
    ///
    /// The cursors handed to the visitor are only valid during that
    /// invocation.
    pub fn visit_children<F>(&self, parent: raw::CXCursor, visitor: F) -> u32
    where
        F: for<'a> FnMut(Visited<'a, raw::CXCursor>, Visited<'a, raw::CXCursor>) -> VisitControl,
    {
        unsafe { typed::traverse(self.visit_children, parent, visitor) }
    }
}

impl Visited<'_, raw::CXCursor> {
    /// `CXCursorKind` of the visited cursor
    pub fn kind(&self) -> i32 {
        self.get().kind
    }
}

impl fmt::Debug for ClangLibrary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClangLibrary")
            .field("functions", &self.functions.len())
            .field("bridge", &self.bridge)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ffi::registry::FinalizationRegistry;
    use std::mem::{offset_of, size_of};

    unsafe extern "C" fn never_called() {}

    #[test]
    fn test_table_builds() {
        let table = descriptor_table().unwrap();
        assert_eq!(table.struct_names().count(), 10);
        assert!(table.is_known(&TypeTag::from_static(CX_FILE)));
    }

    #[test]
    fn test_cursor_layout() {
        let table = descriptor_table().unwrap();
        let cursor = table.get("CXCursor").unwrap();
        assert_eq!(cursor.size(), size_of::<raw::CXCursor>());
        assert_eq!(cursor.offset_of("data").unwrap(), offset_of!(raw::CXCursor, data));
    }

    #[test]
    fn test_all_descriptors_bind() {
        let bridge = Bridge::new(descriptor_table().unwrap()).with_registry(FinalizationRegistry::new());
        let mut resolved = Vec::new();
        let (_, functions) = unsafe {
            bind_all(bridge, |symbol| {
                resolved.push(symbol.to_string());
                Ok(never_called as *const c_void)
            })
        }
        .unwrap();

        assert_eq!(functions.len(), function_descriptors().len());
        assert!(functions.contains_key("clang_visitChildren"));
        assert!(resolved.iter().any(|s| s == "clang_disposeTranslationUnit"));
    }

    #[test]
    fn test_bind_all_reports_missing_symbol() {
        let bridge = Bridge::new(descriptor_table().unwrap());
        let result = unsafe {
            bind_all(bridge, |symbol| {
                Err(FfiError::Load(crate::ffi::loader::LoadError::SymbolNotFound {
                    library: "clang".to_string(),
                    symbol: symbol.to_string(),
                }))
            })
        };
        assert!(matches!(result, Err(FfiError::Load(_))));
    }

    unsafe extern "C" fn one_level(
        parent: raw::CXCursor,
        visitor: crate::ffi::typed::VisitFn<raw::CXCursor>,
        data: *mut c_void,
    ) -> std::os::raw::c_uint {
        for kind in [parent.kind + 1, parent.kind + 2] {
            let child = raw::CXCursor { kind, ..parent };
            if visitor(child, parent, data) == 0 {
                return 1;
            }
        }
        0
    }

    #[test]
    fn test_visited_cursor_kind() {
        let root = raw::CXCursor {
            kind: 300,
            xdata: 0,
            data: [std::ptr::null(); 3],
        };
        let mut kinds = Vec::new();
        let broke = unsafe {
            typed::traverse(one_level, root, |cursor, parent| {
                assert_eq!(parent.kind(), 300);
                kinds.push(cursor.kind());
                VisitControl::Continue
            })
        };
        assert_eq!(broke, 0);
        assert_eq!(kinds, vec![301, 302]);
    }

    #[test]
    fn test_visitor_signature_uses_clang_codes() {
        let signature = cursor_visitor();
        assert_eq!(signature.host_arity(), 2);
        assert!(matches!(
            signature.returns,
            CallbackReturn::ControlFlow(ControlFlowMapping::CLANG)
        ));
    }
}
