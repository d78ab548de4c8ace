//! Struct marshaling - host values ↔ native struct buffers
//!
//! Provides conversions driven by the descriptor table:
//! - `Marshaller::allocate()`: zeroed buffer, optionally initialized from a field map
//! - `Marshaller::read_field()` / `write_field()`: single field access
//! - `Marshaller::read_record()`: whole struct as a field map
//!
//! # Memory Safety
//!
//! - Buffers allocated here are Owned handles released through the registry
//! - C strings written into a buffer are owned by the buffer's handle
//! - Struct copies carry their own copies of C strings, never aliases
//! - Pointer fields only ever receive addresses of tag-checked handles
//! - Numeric writes are range-checked against the declared width

use crate::ffi::error::{FfiError, FfiResult};
use crate::ffi::handle::{Address, Handle, Ownership, TypeTag};
use crate::ffi::layout::{DescriptorTable, FieldKind, StructDescriptor};
use crate::ffi::registry::{FinalizationRegistry, Release};
use crate::ffi::types::CValue;
use crate::value::{FieldMap, Value};
use serde::{Deserialize, Serialize};
use std::alloc::{alloc_zeroed, handle_alloc_error, Layout};
use std::ffi::{CStr, CString};
use std::mem::size_of;
use std::os::raw::c_char;
use std::ptr;

/// What to do when a host list does not match a fixed array's length
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ArrayLengthPolicy {
    /// Zero-fill missing elements, drop extra ones
    #[default]
    Pad,
    /// Reject any length mismatch
    Strict,
}

/// How nested by-value structs are surfaced on reads
#[derive(Clone, Copy, PartialEq)]
enum NestedAs {
    /// Fresh Owned heap copy
    Handle,
    /// Nested field map
    Record,
}

/// Struct marshaller bound to a descriptor table
///
/// # Example
///
/// ```
/// # use tether_runtime::ffi::{DescriptorTable, FieldKind, Marshaller};
/// # use tether_runtime::{FieldMap, Value};
/// let table = DescriptorTable::builder()
///     .struct_type("Point", [("x", FieldKind::int(32, true)), ("y", FieldKind::int(32, true))])
///     .build()
///     .unwrap();
/// let marshaller = Marshaller::new(&table);
/// let point = table.get("Point").unwrap();
///
/// let mut init = FieldMap::new();
/// init.insert("x".to_string(), Value::Int(-5));
/// let handle = marshaller.allocate(point, Some(&init)).unwrap();
/// assert_eq!(marshaller.read_field(&handle, point, "x").unwrap(), Value::Int(-5));
/// assert_eq!(marshaller.read_field(&handle, point, "y").unwrap(), Value::Int(0));
/// ```
pub struct Marshaller<'a> {
    table: &'a DescriptorTable,
    registry: FinalizationRegistry,
    policy: ArrayLengthPolicy,
}

impl<'a> Marshaller<'a> {
    /// Marshaller using the current thread's registry and the default policy
    pub fn new(table: &'a DescriptorTable) -> Self {
        Self {
            table,
            registry: FinalizationRegistry::current(),
            policy: ArrayLengthPolicy::default(),
        }
    }

    pub fn with_registry(mut self, registry: FinalizationRegistry) -> Self {
        self.registry = registry;
        self
    }

    pub fn with_policy(mut self, policy: ArrayLengthPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn table(&self) -> &'a DescriptorTable {
        self.table
    }

    pub fn registry(&self) -> &FinalizationRegistry {
        &self.registry
    }

    pub fn policy(&self) -> ArrayLengthPolicy {
        self.policy
    }

    /// Allocate a zeroed buffer for a struct, optionally initializing fields
    pub fn allocate(&self, descriptor: &StructDescriptor, initial: Option<&FieldMap>) -> FfiResult<Handle> {
        let handle = self.alloc_buffer(descriptor)?;
        if let Some(fields) = initial {
            let base = handle.address().as_ptr() as *mut u8;
            unsafe { self.write_record_at(&handle, descriptor, fields, base)? };
        }
        Ok(handle)
    }

    /// Allocate by type name
    pub fn allocate_named(&self, type_name: &str, initial: Option<&FieldMap>) -> FfiResult<Handle> {
        self.allocate(self.table.get(type_name)?, initial)
    }

    /// Read one field
    ///
    /// Nested structs come back as Owned heap copies, pointers as Borrowed
    /// handles (or null), fixed arrays as lists, C strings as strings (or null).
    pub fn read_field(&self, handle: &Handle, descriptor: &StructDescriptor, field: &str) -> FfiResult<Value> {
        let base = self.base(handle, descriptor)?;
        let layout = descriptor.field(field)?;
        unsafe { self.read_kind(&layout.kind, base.add(layout.offset), NestedAs::Handle) }
    }

    /// Write one field, with the same conversion rules as `allocate`
    pub fn write_field(
        &self,
        handle: &Handle,
        descriptor: &StructDescriptor,
        field: &str,
        value: &Value,
    ) -> FfiResult<()> {
        let base = self.base(handle, descriptor)?;
        let layout = descriptor.field(field)?;
        unsafe {
            self.write_kind(
                handle,
                &layout.kind,
                base.add(layout.offset),
                value,
                &format!("{}.{}", descriptor.name(), field),
            )
        }
    }

    /// Read the whole struct, nested structs as nested field maps
    pub fn read_record(&self, handle: &Handle, descriptor: &StructDescriptor) -> FfiResult<FieldMap> {
        let base = self.base(handle, descriptor)?;
        unsafe { self.read_record_at(descriptor, base) }
    }

    /// Copy a native struct into a fresh Owned buffer
    ///
    /// C string fields (including those of nested structs and arrays) are
    /// duplicated into storage owned by the new handle, so the copy does not
    /// depend on the source's lifetime.
    ///
    /// # Safety
    ///
    /// `src` must be valid for reads of the struct's size, and its C string
    /// fields must be null or NUL-terminated.
    pub unsafe fn heap_copy(&self, tag: &TypeTag, src: *const u8) -> FfiResult<Handle> {
        let descriptor = self.table.get_tag(tag)?;
        let handle = self.alloc_buffer(descriptor)?;
        let dst = handle.address().as_ptr() as *mut u8;
        ptr::copy_nonoverlapping(src, dst, descriptor.size());
        for field in descriptor.fields() {
            self.adopt_strings(&handle, &field.kind, dst.add(field.offset))?;
        }
        Ok(handle)
    }

    /// Address of a struct value to pass by value, allocating one for field maps
    ///
    /// The returned handle (if any) owns the temporary buffer and must outlive
    /// the native call.
    pub(crate) fn by_value_arg(&self, tag: &TypeTag, value: &Value) -> FfiResult<(Address, Option<Handle>)> {
        match value {
            Value::Handle(handle) => {
                let address = self.table.unwrap(handle, tag)?;
                if address.is_null() {
                    return Err(FfiError::NullHandle {
                        context: format!("{} passed by value", tag),
                    });
                }
                Ok((address, None))
            }
            Value::Record(fields) => {
                let handle = self.allocate(self.table.get_tag(tag)?, Some(fields))?;
                Ok((handle.address(), Some(handle)))
            }
            other => Err(FfiError::TypeMismatch {
                expected: tag.clone(),
                found: other.type_name().to_string(),
            }),
        }
    }

    pub(crate) fn alloc_buffer(&self, descriptor: &StructDescriptor) -> FfiResult<Handle> {
        let layout = Layout::from_size_align(descriptor.size().max(1), descriptor.align())
            .map_err(|e| FfiError::invalid_descriptor(descriptor.name().to_string(), e.to_string()))?;
        let ptr = unsafe { alloc_zeroed(layout) };
        if ptr.is_null() {
            handle_alloc_error(layout);
        }
        Ok(Handle::create(
            &self.registry,
            Address::from_mut_ptr(ptr),
            descriptor.name().clone(),
            Ownership::Owned(Release::Dealloc(layout)),
            None,
        ))
    }

    fn base(&self, handle: &Handle, descriptor: &StructDescriptor) -> FfiResult<*mut u8> {
        let address = self.table.unwrap(handle, descriptor.name())?;
        if address.is_null() {
            return Err(FfiError::NullHandle {
                context: format!("{} struct access", descriptor.name()),
            });
        }
        Ok(address.as_ptr() as *mut u8)
    }

    fn kind_size(&self, kind: &FieldKind) -> FfiResult<usize> {
        Ok(match kind {
            FieldKind::Pointer { .. } | FieldKind::CString => size_of::<*const u8>(),
            FieldKind::Nested { type_name } => self.table.get(type_name)?.size(),
            FieldKind::FixedArray { element, count } => self.kind_size(element)? * count,
            scalar => scalar
                .scalar()
                .map(|s| s.size())
                .ok_or_else(|| FfiError::UnsupportedSignature(format!("{:?}", scalar)))?,
        })
    }

    /// Replace every C string pointer under `slot` with a copy owned by `owner`
    unsafe fn adopt_strings(&self, owner: &Handle, kind: &FieldKind, slot: *mut u8) -> FfiResult<()> {
        match kind {
            FieldKind::CString => {
                let source = CValue::read_pointer(slot);
                if !source.is_null() {
                    if !owner.is_owned() {
                        CValue::Pointer(0).write_to(slot);
                        return Err(FfiError::conversion(
                            "string",
                            owner.tag().as_str(),
                            "C strings can only be stored in buffers the host owns",
                        ));
                    }
                    let copy = CStr::from_ptr(source.as_ptr() as *const c_char).to_owned();
                    let pointer = owner.set_string(slot, Some(copy));
                    CValue::Pointer(pointer as usize).write_to(slot);
                }
            }
            FieldKind::Nested { type_name } => {
                for field in self.table.get(type_name)?.fields() {
                    self.adopt_strings(owner, &field.kind, slot.add(field.offset))?;
                }
            }
            FieldKind::FixedArray { element, count } => {
                let stride = self.kind_size(element)?;
                for i in 0..*count {
                    self.adopt_strings(owner, element, slot.add(i * stride))?;
                }
            }
            _ => {}
        }
        Ok(())
    }

    unsafe fn read_record_at(&self, descriptor: &StructDescriptor, base: *const u8) -> FfiResult<FieldMap> {
        let mut record = FieldMap::new();
        for field in descriptor.fields() {
            let value = self.read_kind(&field.kind, base.add(field.offset), NestedAs::Record)?;
            record.insert(field.name.clone(), value);
        }
        Ok(record)
    }

    unsafe fn read_kind(&self, kind: &FieldKind, src: *const u8, nested: NestedAs) -> FfiResult<Value> {
        match kind {
            FieldKind::Integer { .. } | FieldKind::Enum { .. } | FieldKind::Float { .. } => {
                let scalar = kind
                    .scalar()
                    .ok_or_else(|| FfiError::UnsupportedSignature(format!("{:?}", kind)))?;
                Ok(CValue::read_from(scalar, src).to_value())
            }
            FieldKind::FixedArray { element, count } => {
                let stride = self.kind_size(element)?;
                let mut items = Vec::with_capacity(*count);
                for i in 0..*count {
                    items.push(self.read_kind(element, src.add(i * stride), nested)?);
                }
                Ok(Value::List(items))
            }
            FieldKind::Nested { type_name } => match nested {
                NestedAs::Handle => Ok(Value::Handle(self.heap_copy(&TypeTag::new(type_name.clone()), src)?)),
                NestedAs::Record => {
                    let descriptor = self.table.get(type_name)?;
                    Ok(Value::Record(self.read_record_at(descriptor, src)?))
                }
            },
            FieldKind::Pointer { pointee, .. } => {
                let address = CValue::read_pointer(src);
                if address.is_null() {
                    Ok(Value::Null)
                } else {
                    Ok(Value::Handle(Handle::borrowed(address, pointee.clone())))
                }
            }
            FieldKind::CString => read_c_string(CValue::read_pointer(src)),
        }
    }

    unsafe fn write_record_at(
        &self,
        owner: &Handle,
        descriptor: &StructDescriptor,
        fields: &FieldMap,
        base: *mut u8,
    ) -> FfiResult<()> {
        for (name, value) in fields {
            let field = descriptor.field(name)?;
            self.write_kind(
                owner,
                &field.kind,
                base.add(field.offset),
                value,
                &format!("{}.{}", descriptor.name(), name),
            )?;
        }
        Ok(())
    }

    unsafe fn write_kind(
        &self,
        owner: &Handle,
        kind: &FieldKind,
        dst: *mut u8,
        value: &Value,
        path: &str,
    ) -> FfiResult<()> {
        match kind {
            FieldKind::Integer { .. } | FieldKind::Enum { .. } | FieldKind::Float { .. } => {
                let scalar = kind
                    .scalar()
                    .ok_or_else(|| FfiError::UnsupportedSignature(format!("{:?}", kind)))?;
                CValue::from_value(value, scalar)?.write_to(dst);
            }
            FieldKind::FixedArray { element, count } => {
                let items = value.as_list().ok_or_else(|| {
                    FfiError::conversion(value.type_name(), format!("{}[{}]", path, count), "expected a list")
                })?;
                if items.len() != *count {
                    match self.policy {
                        ArrayLengthPolicy::Strict => {
                            return Err(FfiError::conversion(
                                format!("{} elements", items.len()),
                                format!("{}[{}]", path, count),
                                "array length mismatch",
                            ))
                        }
                        ArrayLengthPolicy::Pad if items.len() > *count => {
                            log::debug!("truncating {} elements to {} for {}", items.len(), count, path);
                        }
                        ArrayLengthPolicy::Pad => {}
                    }
                }
                let stride = self.kind_size(element)?;
                for i in 0..*count {
                    let slot = dst.add(i * stride);
                    match items.get(i) {
                        Some(item) => self.write_kind(owner, element, slot, item, path)?,
                        None => ptr::write_bytes(slot, 0, stride),
                    }
                }
            }
            FieldKind::Nested { type_name } => {
                let descriptor = self.table.get(type_name)?;
                match value {
                    Value::Record(fields) => self.write_record_at(owner, descriptor, fields, dst)?,
                    Value::Handle(source) => {
                        let src = self.base(source, descriptor)?;
                        ptr::copy(src, dst, descriptor.size());
                        self.adopt_strings(owner, kind, dst)?;
                    }
                    other => {
                        return Err(FfiError::conversion(other.type_name(), type_name.as_str(), "expected a record"))
                    }
                }
            }
            FieldKind::Pointer { pointee, nullable } => {
                let address = match value {
                    Value::Null if !nullable => {
                        return Err(FfiError::NullHandle {
                            context: format!("field {}", path),
                        })
                    }
                    other => self.table.unwrap_value(other, pointee, *nullable)?,
                };
                CValue::Pointer(address.as_usize()).write_to(dst);
            }
            FieldKind::CString => {
                let pointer = match value {
                    Value::Null if owner.is_owned() => owner.set_string(dst, None),
                    Value::Null => ptr::null(),
                    Value::Str(s) => {
                        if !owner.is_owned() {
                            return Err(FfiError::conversion(
                                "string",
                                path,
                                "C strings can only be stored in buffers the host owns",
                            ));
                        }
                        let c = CString::new(s.as_bytes())
                            .map_err(|_| FfiError::conversion(format!("{:?}", s), path, "string contains a NUL byte"))?;
                        owner.set_string(dst, Some(c))
                    }
                    other => return Err(FfiError::conversion(other.type_name(), path, "expected a string")),
                };
                CValue::Pointer(pointer as usize).write_to(dst);
            }
        }
        Ok(())
    }
}

/// Convert a native C string to a host value (null → `Value::Null`)
///
/// # Safety
///
/// A non-null `address` must point to a NUL-terminated string.
pub unsafe fn read_c_string(address: Address) -> FfiResult<Value> {
    if address.is_null() {
        return Ok(Value::Null);
    }
    let c_str = CStr::from_ptr(address.as_ptr() as *const c_char);
    c_str
        .to_str()
        .map(Value::string)
        .map_err(|e| FfiError::conversion("C string", "string", e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn table() -> DescriptorTable {
        DescriptorTable::builder()
            .opaque("Foo")
            .struct_type(
                "Point",
                [("x", FieldKind::int(32, true)), ("y", FieldKind::pointer("Foo", true))],
            )
            .struct_type(
                "Shape",
                [
                    ("origin", FieldKind::nested("Point")),
                    ("sides", FieldKind::array(FieldKind::int(16, false), 4)),
                    ("label", FieldKind::cstring()),
                    ("big", FieldKind::int(64, false)),
                ],
            )
            .struct_type("Tagged", [("id", FieldKind::int(32, false)), ("shape", FieldKind::nested("Shape"))])
            .build()
            .unwrap()
    }

    fn fields(entries: Vec<(&str, Value)>) -> FieldMap {
        entries.into_iter().map(|(k, v)| (k.to_string(), v)).collect()
    }

    #[test]
    fn test_null_pointer_field_reads_back_null() {
        let table = table();
        let m = Marshaller::new(&table).with_registry(FinalizationRegistry::new());
        let point = table.get("Point").unwrap();
        let h = m
            .allocate(point, Some(&fields(vec![("x", Value::Int(-5)), ("y", Value::Null)])))
            .unwrap();
        assert_eq!(m.read_field(&h, point, "x").unwrap(), Value::Int(-5));
        assert_eq!(m.read_field(&h, point, "y").unwrap(), Value::Null);
    }

    #[test]
    fn test_pointer_field_reads_borrowed_handle() {
        let table = table();
        let m = Marshaller::new(&table).with_registry(FinalizationRegistry::new());
        let point = table.get("Point").unwrap();
        let foo = Handle::borrowed(Address::from_usize(0xbeef0), "Foo");
        let h = m.allocate(point, Some(&fields(vec![("y", Value::Handle(foo))]))).unwrap();

        let y = m.read_field(&h, point, "y").unwrap();
        let y = y.as_handle().unwrap();
        assert_eq!(y.address(), Address::from_usize(0xbeef0));
        assert_eq!(y.tag().as_str(), "Foo");
        assert!(!y.is_owned());
    }

    #[test]
    fn test_pointer_field_rejects_wrong_tag() {
        let table = table();
        let m = Marshaller::new(&table).with_registry(FinalizationRegistry::new());
        let point = table.get("Point").unwrap();
        let bar = Handle::borrowed(Address::from_usize(0x10), "Bar");
        let result = m.allocate(point, Some(&fields(vec![("y", Value::Handle(bar))])));
        assert!(matches!(result, Err(FfiError::TypeMismatch { .. })));
    }

    #[test]
    fn test_unknown_field_rejected() {
        let table = table();
        let m = Marshaller::new(&table).with_registry(FinalizationRegistry::new());
        let point = table.get("Point").unwrap();
        let result = m.allocate(point, Some(&fields(vec![("z", Value::Int(1))])));
        assert!(matches!(result, Err(FfiError::UnknownField { .. })));
    }

    #[test]
    fn test_array_pad_and_strict() {
        let table = table();
        let registry = FinalizationRegistry::new();
        let shape = table.get("Shape").unwrap();
        let init = fields(vec![("sides", Value::List(vec![Value::Int(3), Value::Int(4)]))]);

        let pad = Marshaller::new(&table).with_registry(registry.clone());
        let h = pad.allocate(shape, Some(&init)).unwrap();
        assert_eq!(
            pad.read_field(&h, shape, "sides").unwrap(),
            Value::List(vec![Value::Int(3), Value::Int(4), Value::Int(0), Value::Int(0)])
        );

        let strict = Marshaller::new(&table)
            .with_registry(registry)
            .with_policy(ArrayLengthPolicy::Strict);
        assert!(matches!(
            strict.allocate(shape, Some(&init)),
            Err(FfiError::ConversionError { .. })
        ));
    }

    #[test]
    fn test_nested_read_is_owned_copy() {
        let table = table();
        let registry = FinalizationRegistry::new();
        let m = Marshaller::new(&table).with_registry(registry.clone());
        let shape = table.get("Shape").unwrap();
        let init = fields(vec![("origin", Value::Record(fields(vec![("x", Value::Int(9))])))]);
        let h = m.allocate(shape, Some(&init)).unwrap();

        let origin = m.read_field(&h, shape, "origin").unwrap();
        let origin = origin.as_handle().unwrap().clone();
        assert!(origin.is_owned());
        assert_ne!(origin.address(), h.address());
        assert_eq!(registry.pending(), 2);

        let point = table.get("Point").unwrap();
        m.write_field(&origin, point, "x", &Value::Int(1)).unwrap();
        // The copy is independent of the original buffer
        let record = m.read_record(&h, shape).unwrap();
        assert_eq!(record["origin"].as_record().unwrap()["x"], Value::Int(9));

        drop(origin);
        assert_eq!(registry.pending(), 1);
    }

    #[test]
    fn test_c_string_owned_by_handle() {
        let table = table();
        let m = Marshaller::new(&table).with_registry(FinalizationRegistry::new());
        let shape = table.get("Shape").unwrap();
        let h = m.allocate(shape, Some(&fields(vec![("label", Value::string("square"))]))).unwrap();
        assert_eq!(m.read_field(&h, shape, "label").unwrap(), Value::string("square"));

        m.write_field(&h, shape, "label", &Value::Null).unwrap();
        assert_eq!(m.read_field(&h, shape, "label").unwrap(), Value::Null);
    }

    #[test]
    fn test_rewriting_c_string_keeps_one_copy() {
        let table = table();
        let m = Marshaller::new(&table).with_registry(FinalizationRegistry::new());
        let shape = table.get("Shape").unwrap();
        let h = m.allocate(shape, None).unwrap();

        for i in 0..50 {
            m.write_field(&h, shape, "label", &Value::string(format!("label-{}", i))).unwrap();
        }
        assert_eq!(h.string_count(), 1);
        assert_eq!(m.read_field(&h, shape, "label").unwrap(), Value::string("label-49"));

        m.write_field(&h, shape, "label", &Value::Null).unwrap();
        assert_eq!(h.string_count(), 0);
    }

    #[test]
    fn test_nested_copy_owns_its_strings() {
        let table = table();
        let m = Marshaller::new(&table).with_registry(FinalizationRegistry::new());
        let tagged = table.get("Tagged").unwrap();
        let shape = table.get("Shape").unwrap();
        let init = fields(vec![(
            "shape",
            Value::Record(fields(vec![("label", Value::string("hello-world-string"))])),
        )]);
        let h = m.allocate(tagged, Some(&init)).unwrap();

        let copy = m.read_field(&h, tagged, "shape").unwrap();
        let copy = copy.as_handle().unwrap().clone();
        let original_ptr = unsafe { CValue::read_pointer((h.address().as_ptr() as *const u8).add(tagged.offset_of("shape").unwrap() + shape.offset_of("label").unwrap())) };
        let copy_ptr = unsafe { CValue::read_pointer((copy.address().as_ptr() as *const u8).add(shape.offset_of("label").unwrap())) };
        assert_ne!(original_ptr, copy_ptr);

        drop(h);
        assert_eq!(m.read_field(&copy, shape, "label").unwrap(), Value::string("hello-world-string"));
    }

    #[test]
    fn test_nested_write_from_handle_copies_strings() {
        let table = table();
        let m = Marshaller::new(&table).with_registry(FinalizationRegistry::new());
        let tagged = table.get("Tagged").unwrap();
        let shape = table.get("Shape").unwrap();
        let source = m
            .allocate(shape, Some(&fields(vec![("label", Value::string("kept")), ("big", Value::Int(3))])))
            .unwrap();
        let target = m.allocate(tagged, None).unwrap();

        m.write_field(&target, tagged, "shape", &Value::Handle(source.clone())).unwrap();
        drop(source);

        let record = m.read_record(&target, tagged).unwrap();
        let nested = record["shape"].as_record().unwrap();
        assert_eq!(nested["label"], Value::string("kept"));
        assert_eq!(nested["big"], Value::Int(3));
    }

    #[test]
    fn test_c_string_rejected_for_borrowed_buffer() {
        let table = table();
        let m = Marshaller::new(&table).with_registry(FinalizationRegistry::new());
        let shape = table.get("Shape").unwrap();
        let owned = m.allocate(shape, None).unwrap();
        let borrowed = Handle::borrowed(owned.address(), "Shape");
        let result = m.write_field(&borrowed, shape, "label", &Value::string("x"));
        assert!(matches!(result, Err(FfiError::ConversionError { .. })));
    }

    #[test]
    fn test_u64_field_round_trip() {
        let table = table();
        let m = Marshaller::new(&table).with_registry(FinalizationRegistry::new());
        let shape = table.get("Shape").unwrap();
        let h = m
            .allocate(shape, Some(&fields(vec![("big", Value::Int(u64::MAX as i128))])))
            .unwrap();
        assert_eq!(m.read_field(&h, shape, "big").unwrap(), Value::Int(u64::MAX as i128));
        assert!(matches!(
            m.write_field(&h, shape, "big", &Value::Int(-1)),
            Err(FfiError::ConversionError { .. })
        ));
    }

    #[test]
    fn test_read_record_structure() {
        let table = table();
        let m = Marshaller::new(&table).with_registry(FinalizationRegistry::new());
        let point = table.get("Point").unwrap();
        let h = m.allocate(point, Some(&fields(vec![("x", Value::Int(7))]))).unwrap();
        assert_eq!(
            m.read_record(&h, point).unwrap(),
            fields(vec![("x", Value::Int(7)), ("y", Value::Null)])
        );
    }

    #[test]
    fn test_released_buffer_rejected() {
        let table = table();
        let m = Marshaller::new(&table).with_registry(FinalizationRegistry::new());
        let point = table.get("Point").unwrap();
        let h = m.allocate(point, None).unwrap();
        h.release().unwrap();
        assert!(matches!(m.read_field(&h, point, "x"), Err(FfiError::Released { .. })));
    }
}
