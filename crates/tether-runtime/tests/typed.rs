// Typed layer tests: owned resources and closure traversal over the fixture tree.

mod common;

use common::*;
use common::{assert_eq};
use std::panic::{self, AssertUnwindSafe};
use tether_runtime::ffi::{traverse, Borrowed, FinalizationRegistry, NativeResource, Owned, VisitControl, Visited};
use tether_runtime::FfiError;

struct Thing;

impl NativeResource for Thing {
    const TAG: &'static str = "Thing";
}

// Node holds plain integers, so reading it inside the visitor is sound
fn node(view: &Visited<'_, Node>) -> Node {
    unsafe { view.raw() }
}

fn new_thing(value: i32) -> Owned<Thing> {
    unsafe { Owned::from_raw(thing_new(value), thing_free) }.expect("non-null thing")
}

#[test]
fn test_owned_thing_freed_on_drop() {
    let before = things_freed();
    {
        let thing = new_thing(3);
        assert_eq!(unsafe { thing_value(thing.borrow().as_ptr()) }, 3);
    }
    assert_eq!(things_freed(), before + 1);
}

#[test]
fn test_owned_into_handle_and_back_as_borrowed() {
    let registry = FinalizationRegistry::new();
    let before = things_freed();
    let handle = new_thing(9).into_handle(&registry);

    let view = Borrowed::<Thing>::from_handle(&handle).unwrap();
    assert_eq!(unsafe { thing_value(view.as_ptr()) }, 9);

    handle.release().unwrap();
    assert_eq!(things_freed(), before + 1);
    assert!(matches!(
        Borrowed::<Thing>::from_handle(&handle),
        Err(FfiError::Released { .. })
    ));
}

#[test]
fn test_traverse_recurse_is_pre_order() {
    let mut seen = Vec::new();
    let broke = unsafe {
        traverse(visit_children, ROOT, |child, parent| {
            let (child, parent) = (node(&child), node(&parent));
            assert_eq!(child.depth, parent.depth + 1);
            seen.push(child.id);
            VisitControl::Recurse
        })
    };

    assert_eq!(broke, 0);
    assert_eq!(seen, PRE_ORDER);
}

#[test]
fn test_traverse_break_on_second_visit() {
    let mut calls = 0;
    let broke = unsafe {
        traverse(visit_children, ROOT, |_, _| {
            calls += 1;
            if calls == 2 {
                VisitControl::Break
            } else {
                VisitControl::Recurse
            }
        })
    };

    assert_eq!(broke, 1);
    assert_eq!(calls, 2);
}

#[test]
fn test_traverse_panic_resumes_after_native_call() {
    let mut calls = 0;
    let outcome = panic::catch_unwind(AssertUnwindSafe(|| unsafe {
        traverse(visit_children, ROOT, |child, _| {
            calls += 1;
            if node(&child).id == 3 {
                panic!("bad node");
            }
            VisitControl::Recurse
        })
    }));

    let payload = outcome.expect_err("panic resumed");
    assert_eq!(payload.downcast_ref::<&str>(), Some(&"bad node"));
    // 1, then 3 panics; no further visits
    assert_eq!(calls, 2);
}
