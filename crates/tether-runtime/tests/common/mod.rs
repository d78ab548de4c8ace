//! Shared test fixtures: a small native library implemented in Rust
//!
//! The fixtures mimic the libclang shape: an opaque owned `Thing`, a by-value
//! `Node` struct, and a child traversal driven by a visitor callback over a
//! fixed tree.

#![allow(dead_code)]

use std::cell::Cell;
use std::os::raw::{c_int, c_uint, c_void};
use std::rc::Rc;
use tether_runtime::ffi::{
    CallbackArg, CallbackReturn, CallbackSignature, ControlFlowMapping, DescriptorTable, FieldKind,
    FinalizationRegistry, FunctionDescriptor, ParamKind, ReturnKind, ScalarKind,
};
use tether_runtime::{Bridge, FfiResult, Handle, Value};

pub use pretty_assertions::{assert_eq, assert_ne};

thread_local! {
    static NATIVE_CALLS: Cell<u32> = const { Cell::new(0) };
    static THINGS_FREED: Cell<u32> = const { Cell::new(0) };
}

/// Route `log` output through the test harness (`RUST_LOG=debug` to see it)
pub fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

/// Native calls made by `sum3` on this thread
pub fn native_calls() -> u32 {
    NATIVE_CALLS.with(|c| c.get())
}

/// `Thing`s freed by `thing_free` on this thread
pub fn things_freed() -> u32 {
    THINGS_FREED.with(|c| c.get())
}

// ============================================================================
// Native side
// ============================================================================

#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Node {
    pub id: i32,
    pub depth: i32,
}

pub type NodeVisitor = unsafe extern "C" fn(Node, Node, *mut c_void) -> c_int;

/// (id, parent id); node 0 is the root
///
/// ```text
/// 0
/// ├── 1
/// │   ├── 3
/// │   └── 4
/// └── 2
///     └── 5
/// ```
pub const TREE: &[(i32, i32)] = &[(1, 0), (2, 0), (3, 1), (4, 1), (5, 2)];

/// Ids in pre-order, root excluded
pub const PRE_ORDER: &[i32] = &[1, 3, 4, 2, 5];

pub const ROOT: Node = Node { id: 0, depth: 0 };

unsafe fn walk(parent: Node, visitor: NodeVisitor, data: *mut c_void) -> bool {
    for &(id, parent_id) in TREE {
        if parent_id != parent.id {
            continue;
        }
        let child = Node {
            id,
            depth: parent.depth + 1,
        };
        match visitor(child, parent, data) {
            0 => return true,
            2 => {
                if walk(child, visitor, data) {
                    return true;
                }
            }
            _ => {}
        }
    }
    false
}

/// Same contract as `clang_visitChildren`: nonzero when the visitor broke
pub unsafe extern "C" fn visit_children(parent: Node, visitor: NodeVisitor, data: *mut c_void) -> c_uint {
    c_uint::from(walk(parent, visitor, data))
}

pub extern "C" fn sum3(a: i32, b: i32, c: i32) -> i32 {
    NATIVE_CALLS.with(|n| n.set(n.get() + 1));
    a + b + c
}

pub extern "C" fn make_node(id: i32, depth: i32) -> Node {
    Node { id, depth }
}

pub extern "C" fn node_weight(node: Node) -> i32 {
    node.id * 10 + node.depth
}

pub extern "C" fn thing_new(value: i32) -> *mut c_void {
    Box::into_raw(Box::new(value)) as *mut c_void
}

pub unsafe extern "C" fn thing_value(thing: *mut c_void) -> i32 {
    *(thing as *const i32)
}

pub unsafe extern "C" fn thing_free(thing: *mut c_void) {
    drop(Box::from_raw(thing as *mut i32));
    THINGS_FREED.with(|c| c.set(c.get() + 1));
}

// ============================================================================
// Host side
// ============================================================================

pub fn table() -> DescriptorTable {
    DescriptorTable::builder()
        .struct_type(
            "Node",
            [("id", FieldKind::int(32, true)), ("depth", FieldKind::int(32, true))],
        )
        .opaque("Thing")
        .build()
        .unwrap()
}

/// Bridge with its own registry and `thing_free` registered for `Thing`
pub fn bridge() -> Rc<Bridge> {
    init_logging();
    let mut bridge = Bridge::new(table()).with_registry(FinalizationRegistry::new());
    bridge.register_release("Thing", thing_free);
    Rc::new(bridge)
}

pub fn node_visitor() -> CallbackSignature {
    CallbackSignature::new(
        vec![
            CallbackArg::structure("Node"),
            CallbackArg::structure("Node"),
            CallbackArg::ClientData,
        ],
        CallbackReturn::ControlFlow(ControlFlowMapping::CLANG),
    )
}

pub fn visit_children_descriptor() -> FunctionDescriptor {
    FunctionDescriptor::new("visit_children", ReturnKind::Scalar(ScalarKind::U32))
        .param("parent", ParamKind::structure("Node"))
        .param("visitor", ParamKind::Callback(node_visitor()))
        .param("client_data", ParamKind::ClientData)
}

pub fn sum3_descriptor() -> FunctionDescriptor {
    FunctionDescriptor::new("sum3", ReturnKind::Scalar(ScalarKind::I32))
        .param("a", ParamKind::Scalar(ScalarKind::I32))
        .param("b", ParamKind::Scalar(ScalarKind::I32))
        .param("c", ParamKind::Scalar(ScalarKind::I32))
}

pub fn node_record(id: i32, depth: i32) -> Value {
    let mut fields = tether_runtime::FieldMap::new();
    fields.insert("id".to_string(), Value::from(id));
    fields.insert("depth".to_string(), Value::from(depth));
    Value::Record(fields)
}

/// `id` field of a `Node` handle
pub fn node_id(bridge: &Bridge, handle: &Handle) -> FfiResult<i128> {
    let descriptor = bridge.table().get("Node")?;
    let value = bridge.marshaller().read_field(handle, descriptor, "id")?;
    Ok(value.as_int().unwrap_or_default())
}
