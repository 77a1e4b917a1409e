//! Heap object layouts. Every object starts with an [`Object`] header so a
//! bare pointer can be asked for its type.
use std::ptr::{self, NonNull};

use crate::{Heap, HeapObject, Pointer, RuntimeError, SymbolRef, TypeRef, Value};

#[repr(C)]
pub struct Object {
    ty: Option<TypeRef>,
}

impl Object {
    pub fn new(ty: TypeRef) -> Self {
        Self { ty: Some(ty) }
    }

    pub fn untyped() -> Self {
        Self { ty: None }
    }

    pub fn ty(&self) -> Option<&TypeRef> {
        self.ty.as_ref()
    }

    /// # Safety
    /// `ptr` must be nil or point at a live heap object.
    pub unsafe fn from_pointer<'a>(ptr: Pointer) -> Option<&'a Object> {
        unsafe { (ptr as *const Object).as_ref() }
    }
}

#[repr(C)]
pub struct ClassInstance {
    header: Object,
    structure: NonNull<[u8]>,
}

unsafe impl HeapObject for ClassInstance {}

impl ClassInstance {
    /// Allocates a zeroed instance of a class or tuple type.
    pub fn allocate(heap: &Heap, ty: &TypeRef) -> Pointer {
        let size = ty.class().map_or(0, |c| c.size());
        Self::with_structure(heap, ty.clone(), vec![0u8; size])
    }

    fn with_structure(heap: &Heap, ty: TypeRef, bytes: Vec<u8>) -> Pointer {
        let structure = NonNull::from(Box::leak(bytes.into_boxed_slice()));
        let instance = Self {
            header: Object::new(ty),
            structure,
        };
        heap.allocate_object(instance).as_ptr() as Pointer
    }

    /// # Safety
    /// `ptr` must be nil or point at a live class instance.
    pub unsafe fn from_pointer<'a>(ptr: Pointer) -> Option<&'a ClassInstance> {
        unsafe { (ptr as *const ClassInstance).as_ref() }
    }

    pub fn ty(&self) -> Option<&TypeRef> {
        self.header.ty()
    }

    pub fn structure(&self) -> &[u8] {
        // SAFETY: owned allocation, live as long as self
        unsafe { self.structure.as_ref() }
    }

    /// Address of `len` bytes at `offset` in the structure.
    pub fn member_ptr(&self, offset: usize, len: usize) -> Result<Pointer, RuntimeError> {
        let size = self.structure.len();
        if offset.checked_add(len).is_none_or(|end| end > size) {
            return Err(RuntimeError::OutOfRange {
                index: offset as i64,
                length: size,
            });
        }
        // SAFETY: bounds checked
        Ok(unsafe { (self.structure.as_ptr() as *mut u8).add(offset) })
    }

    pub fn field(&self, index: usize) -> Option<Value> {
        let field = self.ty()?.class()?.fields().get(index)?;
        let src = self.member_ptr(field.offset, 0).ok()?;
        // SAFETY: the layout reserved the field's size at its offset
        Some(unsafe { field.ty.rep().load(src) })
    }

    pub fn set_field(&self, index: usize, value: Value) -> Result<(), RuntimeError> {
        let length = self.ty().and_then(|t| t.class()).map_or(0, |c| c.fields().len());
        let field = self
            .ty()
            .and_then(|t| t.class())
            .and_then(|c| c.fields().get(index))
            .ok_or(RuntimeError::OutOfRange {
                index: index as i64,
                length,
            })?;
        let dst = self.member_ptr(field.offset, 0)?;
        // SAFETY: see field
        unsafe { field.ty.rep().store(dst, value) };
        Ok(())
    }

    /// Shallow copy of the structure.
    pub fn duplicate(&self, heap: &Heap) -> Pointer {
        match self.ty() {
            Some(ty) => Self::with_structure(heap, ty.clone(), self.structure().to_vec()),
            None => ptr::null_mut(),
        }
    }
}

impl Drop for ClassInstance {
    fn drop(&mut self) {
        // SAFETY: leaked from a Box in with_structure
        drop(unsafe { Box::from_raw(self.structure.as_ptr()) });
    }
}

#[repr(C)]
pub struct VariantInstance {
    header: Object,
    payload: Value,
}

unsafe impl HeapObject for VariantInstance {}

impl VariantInstance {
    pub fn allocate(heap: &Heap, tag: TypeRef, payload: Value) -> Pointer {
        let instance = Self {
            header: Object::new(tag),
            payload,
        };
        heap.allocate_object(instance).as_ptr() as Pointer
    }

    /// # Safety
    /// `ptr` must be nil or point at a live variant instance.
    pub unsafe fn from_pointer<'a>(ptr: Pointer) -> Option<&'a VariantInstance> {
        unsafe { (ptr as *const VariantInstance).as_ref() }
    }

    pub fn tag(&self) -> Option<&TypeRef> {
        self.header.ty()
    }

    pub fn payload(&self) -> Value {
        self.payload
    }
}

/// Closure value: a function to be activated dynamically.
#[repr(C)]
pub struct FunctionObject {
    header: Object,
    function: Option<SymbolRef>,
}

unsafe impl HeapObject for FunctionObject {}

impl FunctionObject {
    pub fn allocate(heap: &Heap, ty: TypeRef, function: Option<SymbolRef>) -> Pointer {
        let object = Self {
            header: Object::new(ty),
            function,
        };
        heap.allocate_object(object).as_ptr() as Pointer
    }

    /// # Safety
    /// `ptr` must be nil or point at a live function object.
    pub unsafe fn from_pointer<'a>(ptr: Pointer) -> Option<&'a FunctionObject> {
        unsafe { (ptr as *const FunctionObject).as_ref() }
    }

    pub fn function(&self) -> Option<&SymbolRef> {
        self.function.as_ref()
    }
}

/// Array of values sharing one element representation.
#[repr(C)]
pub struct DynamicArray {
    header: Object,
    values: Vec<Value>,
}

unsafe impl HeapObject for DynamicArray {}

impl DynamicArray {
    pub fn allocate(heap: &Heap, ty: TypeRef, values: Vec<Value>) -> Pointer {
        let array = Self {
            header: Object::new(ty),
            values,
        };
        heap.allocate_object(array).as_ptr() as Pointer
    }

    /// # Safety
    /// `ptr` must be nil or point at a live array.
    pub unsafe fn from_pointer<'a>(ptr: Pointer) -> Option<&'a DynamicArray> {
        unsafe { (ptr as *const DynamicArray).as_ref() }
    }

    pub fn ty(&self) -> Option<&TypeRef> {
        self.header.ty()
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn values(&self) -> &[Value] {
        &self.values
    }
}
