// libclang table tests: computed layouts against #[repr(C)] mirrors.

mod common;

use common::*;
use common::{assert_eq};
use rstest::rstest;
use std::mem::{align_of, offset_of, size_of};
use tether_runtime::clang::{self, raw};
use tether_runtime::ffi::DescriptorTable;
use tether_runtime::{Bridge, TypeTag};

fn table() -> DescriptorTable {
    clang::descriptor_table().expect("libclang table builds")
}

#[rstest]
#[case("CXString", size_of::<raw::CXString>(), align_of::<raw::CXString>())]
#[case("CXCursor", size_of::<raw::CXCursor>(), align_of::<raw::CXCursor>())]
#[case("CXType", size_of::<raw::CXType>(), align_of::<raw::CXType>())]
#[case("CXSourceLocation", size_of::<raw::CXSourceLocation>(), align_of::<raw::CXSourceLocation>())]
#[case("CXSourceRange", size_of::<raw::CXSourceRange>(), align_of::<raw::CXSourceRange>())]
#[case("CXToken", size_of::<raw::CXToken>(), align_of::<raw::CXToken>())]
#[case("CXUnsavedFile", size_of::<raw::CXUnsavedFile>(), align_of::<raw::CXUnsavedFile>())]
#[case("CXFileUniqueID", size_of::<raw::CXFileUniqueID>(), align_of::<raw::CXFileUniqueID>())]
#[case("CXVersion", size_of::<raw::CXVersion>(), align_of::<raw::CXVersion>())]
#[case(
    "CXPlatformAvailability",
    size_of::<raw::CXPlatformAvailability>(),
    align_of::<raw::CXPlatformAvailability>()
)]
fn test_struct_size_and_alignment(#[case] name: &str, #[case] size: usize, #[case] align: usize) {
    let table = table();
    let descriptor = table.get(name).unwrap();
    assert_eq!((descriptor.size(), descriptor.align()), (size, align));
}

#[rstest]
#[case("CXString", "private_flags", offset_of!(raw::CXString, private_flags))]
#[case("CXCursor", "xdata", offset_of!(raw::CXCursor, xdata))]
#[case("CXCursor", "data", offset_of!(raw::CXCursor, data))]
#[case("CXType", "data", offset_of!(raw::CXType, data))]
#[case("CXSourceLocation", "int_data", offset_of!(raw::CXSourceLocation, int_data))]
#[case("CXSourceRange", "end_int_data", offset_of!(raw::CXSourceRange, end_int_data))]
#[case("CXToken", "ptr_data", offset_of!(raw::CXToken, ptr_data))]
#[case("CXUnsavedFile", "Length", offset_of!(raw::CXUnsavedFile, length))]
#[case("CXVersion", "Subminor", offset_of!(raw::CXVersion, subminor))]
#[case("CXPlatformAvailability", "Introduced", offset_of!(raw::CXPlatformAvailability, introduced))]
#[case("CXPlatformAvailability", "Unavailable", offset_of!(raw::CXPlatformAvailability, unavailable))]
#[case("CXPlatformAvailability", "Message", offset_of!(raw::CXPlatformAvailability, message))]
fn test_field_offsets(#[case] name: &str, #[case] field: &str, #[case] offset: usize) {
    let table = table();
    assert_eq!(table.get(name).unwrap().offset_of(field).unwrap(), offset);
}

#[test]
fn test_opaque_tags_known() {
    let table = table();
    for tag in [clang::CX_INDEX, clang::CX_TRANSLATION_UNIT, clang::CX_DIAGNOSTIC, clang::CX_FILE] {
        assert!(table.is_known(&TypeTag::from_static(tag)), "{} should be known", tag);
        assert!(!table.is_struct(&TypeTag::from_static(tag)));
    }
}

#[test]
fn test_every_owned_return_has_a_release_function() {
    let released: Vec<&str> = clang::RELEASE_FUNCTIONS.iter().map(|(tag, _)| *tag).collect();
    for descriptor in clang::function_descriptors() {
        if let tether_runtime::ffi::ReturnKind::Handle { tag, owned: true } = &descriptor.returns {
            assert!(released.contains(&tag.as_str()), "{} returns an owned {}", descriptor.name, tag);
        }
    }
}

#[test]
fn test_cursor_copy_from_handle_reads_raw_fields() {
    let bridge = Bridge::new(table());
    let descriptor = bridge.table().get("CXCursor").unwrap();
    let mut fields = tether_runtime::FieldMap::new();
    fields.insert("kind".to_string(), tether_runtime::Value::Int(300));
    fields.insert("xdata".to_string(), tether_runtime::Value::Int(-1));
    let handle = bridge.marshaller().allocate(descriptor, Some(&fields)).unwrap();

    let cursor = unsafe { *(handle.address().as_ptr() as *const raw::CXCursor) };
    assert_eq!((cursor.kind, cursor.xdata), (300, -1));
    assert!(cursor.data.iter().all(|p| p.is_null()));
}
