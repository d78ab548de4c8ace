// Handle wrapper and finalization registry tests.

mod common;

use common::*;
use common::{assert_eq};
use proptest::prelude::*;
use rstest::rstest;
use std::cell::Cell;
use std::rc::Rc;
use tether_runtime::ffi::{unwrap, Address, FinalizationRegistry, Ownership, Release};
use tether_runtime::{FfiError, Handle, TypeTag, Value};

fn counting(counter: &Rc<Cell<u32>>) -> Release {
    let counter = Rc::clone(counter);
    Release::Custom(Box::new(move |_| counter.set(counter.get() + 1)))
}

#[test]
fn test_owned_release_runs_once_on_explicit_release() {
    let registry = FinalizationRegistry::new();
    let count = Rc::new(Cell::new(0));
    let handle = registry.wrap(Address::from_usize(0x10), TypeTag::new("Thing"), Ownership::Owned(counting(&count)));
    let alias = handle.clone();

    handle.release().unwrap();
    assert!(matches!(alias.release(), Err(FfiError::DoubleRelease { .. })));
    drop(handle);
    drop(alias);
    registry.flush();

    assert_eq!(count.get(), 1);
    assert_eq!(registry.released(), 1);
}

#[test]
fn test_owned_release_runs_when_last_clone_drops() {
    let registry = FinalizationRegistry::new();
    let count = Rc::new(Cell::new(0));
    let handle = registry.wrap(Address::from_usize(0x10), TypeTag::new("Thing"), Ownership::Owned(counting(&count)));
    let value = Value::Handle(handle.clone());

    drop(handle);
    assert_eq!(count.get(), 0);
    drop(value);
    assert_eq!(count.get(), 1);
}

#[test]
fn test_flush_releases_pending_and_handles_see_it() {
    let registry = FinalizationRegistry::new();
    let count = Rc::new(Cell::new(0));
    let handles: Vec<Handle> = (1..=3)
        .map(|i| registry.wrap(Address::from_usize(i * 8), TypeTag::new("Thing"), Ownership::Owned(counting(&count))))
        .collect();

    assert_eq!(registry.flush(), 3);
    assert_eq!(count.get(), 3);
    assert!(handles.iter().all(Handle::is_released));

    // Flushed handles are rejected and never run the action again
    let tag = TypeTag::new("Thing");
    assert!(matches!(handles[0].unwrap(&tag), Err(FfiError::Released { .. })));
    assert!(matches!(handles[1].release(), Err(FfiError::DoubleRelease { .. })));
    assert!(matches!(
        unwrap(&Value::Handle(handles[2].clone()), &tag, true),
        Err(FfiError::Released { .. })
    ));
    drop(handles);
    assert_eq!(count.get(), 3);
    assert_eq!(registry.released(), 3);
}

#[test]
fn test_borrowed_never_released() {
    let registry = FinalizationRegistry::new();
    let handle = registry.wrap(Address::from_usize(0x20), TypeTag::new("Thing"), Ownership::Borrowed);

    assert!(!handle.is_owned());
    handle.release().unwrap();
    handle.release().unwrap();
    assert_eq!(registry.pending(), 0);
    assert_eq!(registry.released(), 0);
}

#[test]
fn test_native_release_through_bridge() {
    let bridge = bridge();
    let before = things_freed();
    let raw = thing_new(5);

    let handle = bridge
        .wrap(Address::from_mut_ptr(raw), TypeTag::new("Thing"), true)
        .unwrap();
    drop(handle);

    assert_eq!(things_freed(), before + 1);
}

#[rstest]
#[case("Thing", "Thing", true)]
#[case("Thing", "void", true)]
#[case("Thing", "Other", false)]
#[case("void", "Thing", false)]
fn test_unwrap_tag_rules(#[case] actual: &str, #[case] expected: &str, #[case] accepted: bool) {
    let handle = Handle::borrowed(Address::from_usize(0x30), TypeTag::new(actual));
    assert_eq!(handle.unwrap(&TypeTag::new(expected)).is_ok(), accepted);
}

#[test]
fn test_unwrap_values() {
    let tag = TypeTag::new("Thing");
    assert_eq!(unwrap(&Value::Null, &tag, true).unwrap(), Address::NULL);
    assert!(matches!(unwrap(&Value::Null, &tag, false), Err(FfiError::NullHandle { .. })));
    assert!(matches!(unwrap(&Value::Int(4), &tag, true), Err(FfiError::TypeMismatch { .. })));
}

proptest! {
    #[test]
    fn prop_wrap_then_unwrap_returns_address(addr in 1usize.., name in "[A-Z][A-Za-z]{0,12}") {
        let tag = TypeTag::new(name.clone());
        let handle = Handle::wrap(Address::from_usize(addr), tag.clone(), Ownership::Borrowed);
        prop_assert_eq!(handle.unwrap(&tag).unwrap().as_usize(), addr);

        let other = TypeTag::new(format!("{}X", name));
        let is_mismatch = matches!(handle.unwrap(&other), Err(FfiError::TypeMismatch { .. }));
        prop_assert!(is_mismatch);
    }
}
