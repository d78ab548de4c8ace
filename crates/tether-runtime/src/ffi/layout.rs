//! Struct descriptor table
//!
//! Static, per-type field layout metadata. A table is built once (from the
//! builder or from TOML) and is read-only afterwards. Building computes the
//! C layout of every struct: each field at its natural alignment, the struct
//! size rounded up to its largest alignment. Nested structs are laid out
//! first, so declaration order does not matter.

use crate::ffi::error::{FfiError, FfiResult};
use crate::ffi::handle::{Address, Handle, TypeTag};
use crate::ffi::types::ScalarKind;
use crate::value::Value;
use libffi::middle::Type;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::mem::{align_of, size_of};

fn default_nullable() -> bool {
    true
}

/// Declared kind of a struct field
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum FieldKind {
    Integer {
        width: u8,
        signed: bool,
    },
    Float {
        width: u8,
    },
    Enum {
        width: u8,
        #[serde(default)]
        signed: bool,
    },
    FixedArray {
        element: Box<FieldKind>,
        count: usize,
    },
    /// Struct embedded by value
    Nested {
        type_name: String,
    },
    Pointer {
        pointee: TypeTag,
        #[serde(default = "default_nullable")]
        nullable: bool,
    },
    /// `const char*`
    CString,
}

impl FieldKind {
    pub fn int(width: u8, signed: bool) -> Self {
        FieldKind::Integer { width, signed }
    }

    pub fn float(width: u8) -> Self {
        FieldKind::Float { width }
    }

    /// C enum with an unsigned 32-bit underlying type
    pub fn enum32() -> Self {
        FieldKind::Enum {
            width: 32,
            signed: false,
        }
    }

    pub fn array(element: FieldKind, count: usize) -> Self {
        FieldKind::FixedArray {
            element: Box::new(element),
            count,
        }
    }

    pub fn nested(type_name: impl Into<String>) -> Self {
        FieldKind::Nested {
            type_name: type_name.into(),
        }
    }

    pub fn pointer(pointee: impl Into<TypeTag>, nullable: bool) -> Self {
        FieldKind::Pointer {
            pointee: pointee.into(),
            nullable,
        }
    }

    pub fn cstring() -> Self {
        FieldKind::CString
    }

    /// Scalar kind for integer, enum and float fields
    pub fn scalar(&self) -> Option<ScalarKind> {
        match self {
            FieldKind::Integer { width, signed } | FieldKind::Enum { width, signed } => {
                ScalarKind::integer(*width, *signed)
            }
            FieldKind::Float { width } => ScalarKind::float(*width),
            _ => None,
        }
    }
}

/// One field of a declared struct
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldSpec {
    pub name: String,
    #[serde(flatten)]
    pub kind: FieldKind,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct TypeSpec {
    name: String,
    #[serde(default)]
    fields: Vec<FieldSpec>,
}

/// On-disk form of a descriptor table
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
struct TableSpec {
    #[serde(default)]
    opaque: Vec<String>,
    #[serde(default)]
    types: Vec<TypeSpec>,
    #[serde(default)]
    supertypes: BTreeMap<String, String>,
}

/// Computed placement of one field
#[derive(Debug, Clone, PartialEq)]
pub struct FieldLayout {
    pub name: String,
    pub kind: FieldKind,
    pub offset: usize,
    pub size: usize,
    pub align: usize,
}

/// Layout of one native struct type
#[derive(Debug, Clone, PartialEq)]
pub struct StructDescriptor {
    name: TypeTag,
    fields: Vec<FieldLayout>,
    index: HashMap<String, usize>,
    size: usize,
    align: usize,
}

impl StructDescriptor {
    pub fn name(&self) -> &TypeTag {
        &self.name
    }

    pub fn size(&self) -> usize {
        self.size
    }

    pub fn align(&self) -> usize {
        self.align
    }

    pub fn fields(&self) -> &[FieldLayout] {
        &self.fields
    }

    pub fn field(&self, name: &str) -> FfiResult<&FieldLayout> {
        self.index
            .get(name)
            .map(|&i| &self.fields[i])
            .ok_or_else(|| FfiError::UnknownField {
                type_name: self.name.to_string(),
                field: name.to_string(),
            })
    }

    pub fn offset_of(&self, name: &str) -> FfiResult<usize> {
        self.field(name).map(|f| f.offset)
    }
}

/// Read-only table of struct descriptors and known type tags
#[derive(Debug, Clone, Default)]
pub struct DescriptorTable {
    structs: HashMap<TypeTag, StructDescriptor>,
    opaque: HashSet<TypeTag>,
    supertypes: HashMap<TypeTag, TypeTag>,
}

impl DescriptorTable {
    pub fn builder() -> TableBuilder {
        TableBuilder::default()
    }

    /// Parse and build a table from TOML
    ///
    /// ```toml
    /// opaque = ["CXIndex"]
    ///
    /// [[types]]
    /// name = "Point"
    /// fields = [
    ///     { name = "x", kind = "integer", width = 32, signed = true },
    ///     { name = "next", kind = "pointer", pointee = "Point" },
    /// ]
    /// ```
    pub fn from_toml_str(source: &str) -> FfiResult<Self> {
        let spec: TableSpec = toml::from_str(source)
            .map_err(|e| FfiError::invalid_descriptor("<table>", e.to_string()))?;
        let mut builder = TableBuilder::default();
        for name in spec.opaque {
            builder = builder.opaque(TypeTag::new(name));
        }
        for ty in spec.types {
            builder.structs.push((ty.name, ty.fields));
        }
        for (child, parent) in spec.supertypes {
            builder = builder.supertype(TypeTag::new(child), TypeTag::new(parent));
        }
        builder.build()
    }

    pub fn get(&self, name: &str) -> FfiResult<&StructDescriptor> {
        self.structs
            .get(&TypeTag::new(name))
            .ok_or_else(|| FfiError::UnknownType(name.to_string()))
    }

    pub fn get_tag(&self, tag: &TypeTag) -> FfiResult<&StructDescriptor> {
        self.structs
            .get(tag)
            .ok_or_else(|| FfiError::UnknownType(tag.to_string()))
    }

    pub fn is_struct(&self, tag: &TypeTag) -> bool {
        self.structs.contains_key(tag)
    }

    /// Whether the tag names a struct, a declared opaque type, or `void`
    pub fn is_known(&self, tag: &TypeTag) -> bool {
        tag.is_void() || self.structs.contains_key(tag) || self.opaque.contains(tag)
    }

    pub fn struct_names(&self) -> impl Iterator<Item = &TypeTag> {
        self.structs.keys()
    }

    /// Whether a handle tagged `actual` may stand in for `expected`
    pub fn is_subtype(&self, actual: &TypeTag, expected: &TypeTag) -> bool {
        if expected.accepts(actual) {
            return true;
        }
        let mut current = actual;
        // Chains are acyclic (checked at build), so this terminates
        while let Some(parent) = self.supertypes.get(current) {
            if parent == expected {
                return true;
            }
            current = parent;
        }
        false
    }

    /// Unwrap a handle, honoring declared supertypes
    pub fn unwrap(&self, handle: &Handle, expected: &TypeTag) -> FfiResult<Address> {
        handle.unwrap_with(expected, |expected, actual| self.is_subtype(actual, expected))
    }

    /// Unwrap a host value, honoring declared supertypes and nullability
    pub fn unwrap_value(&self, value: &Value, expected: &TypeTag, nullable: bool) -> FfiResult<Address> {
        match value {
            Value::Handle(handle) => self.unwrap(handle, expected),
            other => crate::ffi::handle::unwrap(other, expected, nullable),
        }
    }

    /// libffi type for passing a struct by value
    pub fn ffi_type(&self, tag: &TypeTag) -> FfiResult<Type> {
        let desc = self.get_tag(tag)?;
        let mut elements = Vec::new();
        for field in &desc.fields {
            self.push_ffi_elements(&field.kind, &mut elements)?;
        }
        Ok(Type::structure(elements))
    }

    fn push_ffi_elements(&self, kind: &FieldKind, out: &mut Vec<Type>) -> FfiResult<()> {
        match kind {
            FieldKind::Pointer { .. } | FieldKind::CString => out.push(Type::pointer()),
            FieldKind::Nested { type_name } => out.push(self.ffi_type(&TypeTag::new(type_name.clone()))?),
            // libffi has no array type; an inline array is its elements in sequence
            FieldKind::FixedArray { element, count } => {
                for _ in 0..*count {
                    self.push_ffi_elements(element, out)?;
                }
            }
            scalar => {
                let kind = scalar
                    .scalar()
                    .ok_or_else(|| FfiError::UnsupportedSignature(format!("{:?}", scalar)))?;
                out.push(kind.ffi_type());
            }
        }
        Ok(())
    }
}

/// Builder for `DescriptorTable`
#[derive(Debug, Default)]
pub struct TableBuilder {
    structs: Vec<(String, Vec<FieldSpec>)>,
    opaque: Vec<TypeTag>,
    supertypes: Vec<(TypeTag, TypeTag)>,
}

impl TableBuilder {
    /// Declare a struct with its fields in memory order
    pub fn struct_type<'a, I>(mut self, name: impl Into<String>, fields: I) -> Self
    where
        I: IntoIterator<Item = (&'a str, FieldKind)>,
    {
        let fields = fields
            .into_iter()
            .map(|(name, kind)| FieldSpec {
                name: name.to_string(),
                kind,
            })
            .collect();
        self.structs.push((name.into(), fields));
        self
    }

    /// Declare a type only ever handled through pointers
    pub fn opaque(mut self, tag: impl Into<TypeTag>) -> Self {
        self.opaque.push(tag.into());
        self
    }

    /// Declare that handles tagged `child` are accepted where `parent` is expected
    pub fn supertype(mut self, child: impl Into<TypeTag>, parent: impl Into<TypeTag>) -> Self {
        self.supertypes.push((child.into(), parent.into()));
        self
    }

    pub fn build(self) -> FfiResult<DescriptorTable> {
        let mut specs: HashMap<String, Vec<FieldSpec>> = HashMap::new();
        for (name, fields) in self.structs {
            if specs.insert(name.clone(), fields).is_some() {
                return Err(FfiError::invalid_descriptor(name, "declared twice"));
            }
        }

        let mut resolver = Resolver {
            specs: &specs,
            done: HashMap::new(),
            in_progress: HashSet::new(),
        };
        let mut names: Vec<&String> = specs.keys().collect();
        names.sort();
        for name in names {
            resolver.resolve(name)?;
        }

        let mut supertypes = HashMap::new();
        for (child, parent) in self.supertypes {
            if supertypes.insert(child.clone(), parent).is_some() {
                return Err(FfiError::invalid_descriptor(child.to_string(), "more than one supertype"));
            }
        }
        for start in supertypes.keys() {
            let mut seen = HashSet::new();
            let mut current = start;
            while let Some(parent) = supertypes.get(current) {
                if !seen.insert(current) {
                    return Err(FfiError::invalid_descriptor(start.to_string(), "cyclic supertypes"));
                }
                current = parent;
            }
        }

        log::debug!("built descriptor table with {} struct types", resolver.done.len());
        Ok(DescriptorTable {
            structs: resolver.done,
            opaque: self.opaque.into_iter().collect(),
            supertypes,
        })
    }
}

struct Resolver<'a> {
    specs: &'a HashMap<String, Vec<FieldSpec>>,
    done: HashMap<TypeTag, StructDescriptor>,
    in_progress: HashSet<String>,
}

fn align_up(offset: usize, align: usize) -> usize {
    offset.div_ceil(align) * align
}

impl Resolver<'_> {
    fn resolve(&mut self, name: &str) -> FfiResult<(usize, usize)> {
        let tag = TypeTag::new(name);
        if let Some(desc) = self.done.get(&tag) {
            return Ok((desc.size, desc.align));
        }
        let fields = self
            .specs
            .get(name)
            .ok_or_else(|| FfiError::UnknownType(name.to_string()))?;
        if !self.in_progress.insert(name.to_string()) {
            return Err(FfiError::invalid_descriptor(name, "contains itself by value"));
        }

        let mut offset = 0;
        let mut max_align = 1;
        let mut layouts = Vec::with_capacity(fields.len());
        let mut index = HashMap::with_capacity(fields.len());
        for field in fields {
            let (size, align) = self.kind_layout(name, &field.kind)?;
            offset = align_up(offset, align);
            if index.insert(field.name.clone(), layouts.len()).is_some() {
                return Err(FfiError::invalid_descriptor(
                    name,
                    format!("duplicate field '{}'", field.name),
                ));
            }
            layouts.push(FieldLayout {
                name: field.name.clone(),
                kind: field.kind.clone(),
                offset,
                size,
                align,
            });
            offset += size;
            max_align = max_align.max(align);
        }
        let size = align_up(offset, max_align);

        self.in_progress.remove(name);
        self.done.insert(
            tag.clone(),
            StructDescriptor {
                name: tag,
                fields: layouts,
                index,
                size,
                align: max_align,
            },
        );
        Ok((size, max_align))
    }

    fn kind_layout(&mut self, owner: &str, kind: &FieldKind) -> FfiResult<(usize, usize)> {
        match kind {
            FieldKind::Integer { width, .. } | FieldKind::Enum { width, .. } | FieldKind::Float { width } => {
                let scalar = kind.scalar().ok_or_else(|| {
                    FfiError::invalid_descriptor(owner, format!("unsupported width {}", width))
                })?;
                Ok((scalar.size(), scalar.align()))
            }
            FieldKind::Pointer { .. } | FieldKind::CString => {
                Ok((size_of::<*const u8>(), align_of::<*const u8>()))
            }
            FieldKind::Nested { type_name } => self.resolve(type_name),
            FieldKind::FixedArray { element, count } => {
                if *count == 0 {
                    return Err(FfiError::invalid_descriptor(owner, "zero-length array"));
                }
                let (size, align) = self.kind_layout(owner, element)?;
                Ok((size * count, align))
            }
        }
    }
}
