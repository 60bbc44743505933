//! Classes and per-instance metadata.
//!
//! A class describes a field layout and a virtual method table. The
//! interpreter never touches classes directly while executing field opcodes;
//! it goes through the instance [`Meta`], which is built lazily the first
//! time a class is instantiated and snapshots everything the hot path and
//! the collector need: instance size, method table, and the offsets of the
//! reference-holding fields.

use crate::{function::FuncRef, heap::Ref};
use std::{
    cell::{Cell, RefCell},
    rc::Rc,
};

/// Shape of one word-sized value: a stack slot, parameter, local or field.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum ValueKind {
    /// 8-bit signed integer.
    I8,
    /// 16-bit signed integer.
    I16,
    /// 32-bit signed integer.
    I32,
    /// 64-bit signed integer.
    I64,
    /// 32-bit IEEE 754 float.
    F32,
    /// 64-bit IEEE 754 float.
    F64,
    /// Boolean, stored as one byte in fields.
    Bool,
    /// The unit value.
    Unit,
    /// A reference to a heap object.
    Ref,
}

impl ValueKind {
    /// Size of a field of this kind inside an object, in bytes.
    pub fn byte_size(self) -> u32 {
        match self {
            ValueKind::I8 | ValueKind::Bool | ValueKind::Unit => 1,
            ValueKind::I16 => 2,
            ValueKind::I32 | ValueKind::F32 => 4,
            ValueKind::I64 | ValueKind::F64 | ValueKind::Ref => 8,
        }
    }

    /// Whether values of this kind are references the collector must trace.
    pub fn is_ref(self) -> bool {
        matches!(self, ValueKind::Ref)
    }
}

/// One field of a class layout.
#[derive(Debug, Copy, Clone)]
pub struct Field {
    /// Byte offset of the field inside an instance.
    pub offset: u32,
    /// Shape of the field.
    pub kind: ValueKind,
}

/// Shared handle to a [`Class`].
pub type ClassRef = Rc<Class>;

/// A class definition: name, supertype, flattened field layout and methods.
pub struct Class {
    name: Box<str>,
    supertype: Option<ClassRef>,
    fields: Vec<Field>,
    fields_end: u32,
    instance_size: u32,
    element: Option<ValueKind>,
    methods: RefCell<Vec<FuncRef>>,
    instance_meta: RefCell<Option<MetaRef>>,
    mirror: Cell<Ref>,
}

impl Class {
    pub(crate) fn new(
        name: &str,
        supertype: Option<ClassRef>,
        own_fields: &[ValueKind],
        element: Option<ValueKind>,
    ) -> Class {
        let (mut fields, mut offset) = match &supertype {
            Some(parent) => (parent.fields.clone(), parent.fields_end),
            None => (Vec::new(), 0),
        };
        for &kind in own_fields {
            let size = kind.byte_size();
            offset = (offset + size - 1) & !(size - 1);
            fields.push(Field { offset, kind });
            offset += size;
        }
        let instance_size = (offset + 7) & !7;
        Class {
            name: name.into(),
            supertype,
            fields,
            fields_end: offset,
            instance_size,
            element,
            methods: RefCell::new(Vec::new()),
            instance_meta: RefCell::new(None),
            mirror: Cell::new(Ref::NULL),
        }
    }

    /// The class name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The flattened field layout, inherited fields first.
    pub fn fields(&self) -> &[Field] {
        &self.fields
    }

    /// Resolves a field index to its byte offset inside an instance.
    pub fn field_offset(&self, index: usize) -> u32 {
        self.fields[index].offset
    }

    /// Element kind if instances of this class carry an array part.
    pub fn element(&self) -> Option<ValueKind> {
        self.element
    }

    /// The heap handle of this class's mirror object, pushed by `CLS`.
    pub fn mirror(&self) -> Ref {
        self.mirror.get()
    }

    pub(crate) fn set_mirror(&self, mirror: Ref) {
        self.mirror.set(mirror);
    }

    pub(crate) fn set_methods(&self, methods: Vec<FuncRef>) {
        *self.methods.borrow_mut() = methods;
    }

    /// Whether `this` equals `other` or names it on its supertype chain.
    pub fn is_subtype_of(this: &ClassRef, other: &ClassRef) -> bool {
        let mut current = Some(this.clone());
        while let Some(class) = current {
            if Rc::ptr_eq(&class, other) {
                return true;
            }
            current = class.supertype.clone();
        }
        false
    }

    /// Returns the instance metadata, building and installing it on first use.
    pub fn ensure_instance_meta(this: &ClassRef) -> MetaRef {
        if let Some(meta) = this.instance_meta.borrow().as_ref() {
            return meta.clone();
        }
        log::debug!("building instance meta for class `{}`", this.name);
        let meta = Rc::new(Meta {
            class: this.clone(),
            instance_size: this.instance_size,
            element: this.element,
            methods: this.methods.borrow().clone(),
            ref_offsets: this
                .fields
                .iter()
                .filter(|field| field.kind.is_ref())
                .map(|field| field.offset)
                .collect(),
        });
        *this.instance_meta.borrow_mut() = Some(meta.clone());
        meta
    }
}

/// Shared handle to a [`Meta`].
pub type MetaRef = Rc<Meta>;

/// Per-instance metadata: what the allocator, the virtual-call dispatcher and
/// the collector need to know about objects of one class.
pub struct Meta {
    class: ClassRef,
    instance_size: u32,
    element: Option<ValueKind>,
    methods: Vec<FuncRef>,
    ref_offsets: Vec<u32>,
}

impl Meta {
    /// The class this metadata was built from.
    pub fn class(&self) -> &ClassRef {
        &self.class
    }

    /// Size of the fixed part of an instance, in bytes.
    pub fn instance_size(&self) -> u32 {
        self.instance_size
    }

    /// Element kind of the array part, if any.
    pub fn element(&self) -> Option<ValueKind> {
        self.element
    }

    /// Total data size of an instance with `length` array elements.
    pub fn data_size(&self, length: u64) -> usize {
        let element = self
            .element
            .unwrap_or_else(|| panic!("array allocation on non-array class `{}`", self.class.name()));
        self.instance_size as usize + length as usize * element.byte_size() as usize
    }

    /// Looks a method up by its virtual table index.
    pub fn method(&self, index: usize) -> FuncRef {
        self.methods[index].clone()
    }

    /// Byte offsets of the reference fields the collector must trace.
    pub fn ref_offsets(&self) -> &[u32] {
        &self.ref_offsets
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fields_are_aligned_to_their_size() {
        let class = Rc::new(Class::new(
            "Layout",
            None,
            &[ValueKind::I8, ValueKind::I32, ValueKind::I8, ValueKind::I64],
            None,
        ));
        let offsets: Vec<u32> = class.fields().iter().map(|f| f.offset).collect();
        assert_eq!(offsets, [0, 4, 8, 16]);
        let meta = Class::ensure_instance_meta(&class);
        assert_eq!(meta.instance_size(), 24);
    }

    #[test]
    fn subclass_layout_extends_parent() {
        let parent = Rc::new(Class::new("Parent", None, &[ValueKind::Ref], None));
        let child = Rc::new(Class::new(
            "Child",
            Some(parent.clone()),
            &[ValueKind::I16],
            None,
        ));
        assert_eq!(child.field_offset(0), 0);
        assert_eq!(child.field_offset(1), 8);
        assert!(Class::is_subtype_of(&child, &parent));
        assert!(!Class::is_subtype_of(&parent, &child));
    }

    #[test]
    fn meta_collects_reference_offsets() {
        let class = Rc::new(Class::new(
            "Mixed",
            None,
            &[ValueKind::Ref, ValueKind::I32, ValueKind::Ref],
            None,
        ));
        let meta = Class::ensure_instance_meta(&class);
        assert_eq!(meta.ref_offsets(), [0, 16]);
    }
}
