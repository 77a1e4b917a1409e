//! Machine representations: one descriptor per storage kind, each carrying
//! its size facts and a dispatch table of node functions. The table entries
//! are instantiated from generic definitions over [`Native`].
use std::{fmt, ptr, sync::Arc};

use bitflags::bitflags;
use log::debug;

use crate::{
    ClassInstance, Eval, FloatVector, Heap, HeapCreateInfo, Native, Node, NodeFunc, Pointer,
    RuntimeError, Thread, Value, VariantInstance, Vector2f, Vector3f, Vector4f, activation,
};

#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RepKind {
    Void,
    Float,
    Double,
    Int,
    Int64,
    Short,
    Char,
    Bool,
    Pointer,
    Vector4f,
    Vector3f,
    Vector2f,
}

impl RepKind {
    /// Registration order.
    pub const ALL: [RepKind; 12] = [
        RepKind::Void,
        RepKind::Float,
        RepKind::Double,
        RepKind::Int,
        RepKind::Int64,
        RepKind::Short,
        RepKind::Char,
        RepKind::Bool,
        RepKind::Pointer,
        RepKind::Vector4f,
        RepKind::Vector3f,
        RepKind::Vector2f,
    ];

    #[inline]
    pub fn index(self) -> usize {
        self as usize
    }

    /// Reads a value of this representation from packed storage.
    ///
    /// # Safety
    /// `src` must be valid for reads of this representation's size.
    pub unsafe fn load(self, src: *const u8) -> Value {
        unsafe {
            match self {
                RepKind::Void => Value::ZERO,
                RepKind::Float => Value::new(ptr::read_unaligned(src as *const f32)),
                RepKind::Double => Value::new(ptr::read_unaligned(src as *const f64)),
                RepKind::Int => Value::new(ptr::read_unaligned(src as *const i32)),
                RepKind::Int64 => Value::new(ptr::read_unaligned(src as *const i64)),
                RepKind::Short => Value::new(ptr::read_unaligned(src as *const i16)),
                RepKind::Char => Value::new(ptr::read_unaligned(src)),
                RepKind::Bool => Value::new(ptr::read_unaligned(src) != 0),
                RepKind::Pointer => Value::new(ptr::read_unaligned(src as *const Pointer)),
                RepKind::Vector4f => Value::new(ptr::read_unaligned(src as *const Vector4f)),
                RepKind::Vector3f => Value::new(ptr::read_unaligned(src as *const Vector3f)),
                RepKind::Vector2f => Value::new(ptr::read_unaligned(src as *const Vector2f)),
            }
        }
    }

    /// Writes the active field of `value` into packed storage.
    ///
    /// # Safety
    /// `dst` must be valid for writes of this representation's size and
    /// `value` must have been produced with this representation.
    pub unsafe fn store(self, dst: *mut u8, value: Value) {
        unsafe {
            match self {
                RepKind::Void => {}
                RepKind::Float => ptr::write_unaligned(dst as *mut f32, value.float),
                RepKind::Double => ptr::write_unaligned(dst as *mut f64, value.double),
                RepKind::Int => ptr::write_unaligned(dst as *mut i32, value.int),
                RepKind::Int64 => ptr::write_unaligned(dst as *mut i64, value.int64),
                RepKind::Short => ptr::write_unaligned(dst as *mut i16, value.short),
                RepKind::Char => ptr::write_unaligned(dst, value.char),
                RepKind::Bool => ptr::write_unaligned(dst, value.bool as u8),
                RepKind::Pointer => ptr::write_unaligned(dst as *mut Pointer, value.pointer),
                RepKind::Vector4f => ptr::write_unaligned(dst as *mut Vector4f, value.vector4f),
                RepKind::Vector3f => ptr::write_unaligned(dst as *mut Vector3f, value.vector3f),
                RepKind::Vector2f => ptr::write_unaligned(dst as *mut Vector2f, value.vector2f),
            }
        }
    }
}

bitflags! {
    /// Dispatch table slots.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct Slots: u32 {
        const CONSTANT = 1 << 0;
        const REFERENCE_STACK = 1 << 1;
        const DEREFERENCE_STACK = 1 << 2;
        const REFERENCE_GLOBAL = 1 << 3;
        const DEREFERENCE_GLOBAL = 1 << 4;
        const REFERENCE_MEMBER = 1 << 5;
        const DEREFERENCE_MEMBER = 1 << 6;
        const EXTRACT_MEMBER = 1 << 7;
        const DEREFERENCE_CLASS_MEMBER = 1 << 8;
        const REFERENCE_CLASS_MEMBER = 1 << 9;
        const CALL_METHOD = 1 << 10;
        const INVOKE_INTERFACE = 1 << 11;
        const FRAME_BLOCK = 1 << 12;
        const SIMPLE_BLOCK = 1 << 13;
        const PATTERN_BLOCK = 1 << 14;
        const FUNCTION_ACTIVATION = 1 << 15;
        const FUNCTION_RETURN = 1 << 16;
        const DYNAMIC_ACTIVATION = 1 << 17;
        const FUNCTION_TAIL_FUSE = 1 << 18;
        const VARIANT_CONSTRUCTOR = 1 << 19;
        const UNPACK_VARIANT = 1 << 20;

        /// present on every representation, void included
        const CALL_PROTOCOL = Self::CONSTANT.bits()
            | Self::REFERENCE_CLASS_MEMBER.bits()
            | Self::CALL_METHOD.bits()
            | Self::INVOKE_INTERFACE.bits()
            | Self::FRAME_BLOCK.bits()
            | Self::SIMPLE_BLOCK.bits()
            | Self::PATTERN_BLOCK.bits()
            | Self::FUNCTION_ACTIVATION.bits()
            | Self::FUNCTION_RETURN.bits()
            | Self::DYNAMIC_ACTIVATION.bits()
            | Self::FUNCTION_TAIL_FUSE.bits()
            | Self::VARIANT_CONSTRUCTOR.bits()
            | Self::UNPACK_VARIANT.bits();
        const STORAGE = Self::REFERENCE_STACK.bits()
            | Self::DEREFERENCE_STACK.bits()
            | Self::REFERENCE_GLOBAL.bits()
            | Self::DEREFERENCE_GLOBAL.bits()
            | Self::DEREFERENCE_CLASS_MEMBER.bits();
        const VECTOR_MEMBER = Self::REFERENCE_MEMBER.bits()
            | Self::DEREFERENCE_MEMBER.bits()
            | Self::EXTRACT_MEMBER.bits();
    }
}

/// Descriptor and dispatch table for one representation.
pub struct MachineRep {
    kind: RepKind,
    name: &'static str,
    fmt_name: &'static str,
    element: RepKind,
    width: usize,
    size: usize,
    struct_alignment: usize,
    natural_alignment: usize,

    constant: NodeFunc,
    reference_stack: Option<NodeFunc>,
    dereference_stack: Option<NodeFunc>,
    reference_global: Option<NodeFunc>,
    dereference_global: Option<NodeFunc>,
    reference_member: Option<NodeFunc>,
    dereference_member: Option<NodeFunc>,
    extract_member: Option<NodeFunc>,
    dereference_class_member: Option<NodeFunc>,
    reference_class_member: NodeFunc,
    call_method: NodeFunc,
    invoke_interface: NodeFunc,
    frame_block: NodeFunc,
    simple_block: NodeFunc,
    pattern_block: NodeFunc,
    function_activation: NodeFunc,
    function_return: NodeFunc,
    dynamic_activation: NodeFunc,
    function_tail_fuse: NodeFunc,
    variant_constructor: NodeFunc,
    unpack_variant: NodeFunc,
}

impl MachineRep {
    /// Call protocol and variant slots, shared by every representation.
    fn base<T: Native>(name: &'static str, fmt_name: &'static str) -> Self {
        Self {
            kind: T::KIND,
            name,
            fmt_name,
            element: T::KIND,
            width: 1,
            size: size_of::<T>(),
            struct_alignment: align_of::<T>(),
            natural_alignment: align_of::<T>(),
            constant: T::wrap(constant::<T>),
            reference_stack: None,
            dereference_stack: None,
            reference_global: None,
            dereference_global: None,
            reference_member: None,
            dereference_member: None,
            extract_member: None,
            dereference_class_member: None,
            reference_class_member: NodeFunc::Pointer(reference_class_member),
            call_method: T::wrap(activation::call_method::<T>),
            invoke_interface: T::wrap(activation::invoke_interface::<T>),
            frame_block: T::wrap(activation::frame_block::<T>),
            simple_block: T::wrap(activation::simple_block::<T>),
            pattern_block: T::wrap(activation::pattern_block::<T>),
            function_activation: T::wrap(activation::function_activation::<T>),
            function_return: T::wrap(activation::function_return::<T>),
            dynamic_activation: T::wrap(activation::dynamic_activation::<T>),
            function_tail_fuse: T::wrap(activation::function_tail_fuse::<T>),
            variant_constructor: NodeFunc::Pointer(variant_constructor::<T>),
            unpack_variant: T::wrap(unpack_variant::<T>),
        }
    }

    fn scalar<T: Native>(name: &'static str, fmt_name: &'static str) -> Self {
        Self {
            reference_stack: Some(NodeFunc::Pointer(reference_stack::<T>)),
            dereference_stack: Some(T::wrap(dereference_stack::<T>)),
            reference_global: Some(NodeFunc::Pointer(reference_global::<T>)),
            dereference_global: Some(T::wrap(dereference_global::<T>)),
            dereference_class_member: Some(T::wrap(dereference_class_member::<T>)),
            ..Self::base::<T>(name, fmt_name)
        }
    }

    fn vector<V: FloatVector>(name: &'static str, fmt_name: &'static str) -> Self {
        Self {
            element: RepKind::Float,
            width: V::WIDTH,
            reference_member: Some(NodeFunc::Pointer(reference_member::<V>)),
            dereference_member: Some(NodeFunc::Float(dereference_member::<V>)),
            extract_member: Some(NodeFunc::Float(extract_member::<V>)),
            ..Self::scalar::<V>(name, fmt_name)
        }
    }

    fn void() -> Self {
        Self {
            size: 0,
            struct_alignment: 0,
            natural_alignment: 0,
            variant_constructor: NodeFunc::Pointer(void_variant_constructor),
            ..Self::base::<()>("void", "v")
        }
    }

    fn int64() -> Self {
        Self {
            // 64-bit integers pack on 4-byte boundaries inside structures
            struct_alignment: 4,
            natural_alignment: 8,
            ..Self::scalar::<i64>("int64", "L")
        }
    }

    fn pointer() -> Self {
        Self {
            variant_constructor: NodeFunc::Pointer(pointer_variant_constructor),
            ..Self::scalar::<Pointer>("Pointer", "p")
        }
    }

    pub fn kind(&self) -> RepKind {
        self.kind
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn fmt_name(&self) -> &'static str {
        self.fmt_name
    }

    /// Scalar element; self for scalars.
    pub fn element_rep(&self) -> RepKind {
        self.element
    }

    pub fn width(&self) -> usize {
        self.width
    }

    pub fn size(&self) -> usize {
        self.size
    }

    pub fn struct_alignment(&self) -> usize {
        self.struct_alignment
    }

    pub fn natural_alignment(&self) -> usize {
        self.natural_alignment
    }

    /// Slots documented for this representation.
    pub fn slots(&self) -> Slots {
        match self.kind {
            RepKind::Void => Slots::CALL_PROTOCOL,
            RepKind::Vector4f | RepKind::Vector3f | RepKind::Vector2f => Slots::all(),
            _ => Slots::CALL_PROTOCOL | Slots::STORAGE,
        }
    }

    /// Looks up a single slot.
    pub fn func(&self, slot: Slots) -> Option<NodeFunc> {
        match slot {
            Slots::CONSTANT => Some(self.constant),
            Slots::REFERENCE_STACK => self.reference_stack,
            Slots::DEREFERENCE_STACK => self.dereference_stack,
            Slots::REFERENCE_GLOBAL => self.reference_global,
            Slots::DEREFERENCE_GLOBAL => self.dereference_global,
            Slots::REFERENCE_MEMBER => self.reference_member,
            Slots::DEREFERENCE_MEMBER => self.dereference_member,
            Slots::EXTRACT_MEMBER => self.extract_member,
            Slots::DEREFERENCE_CLASS_MEMBER => self.dereference_class_member,
            Slots::REFERENCE_CLASS_MEMBER => Some(self.reference_class_member),
            Slots::CALL_METHOD => Some(self.call_method),
            Slots::INVOKE_INTERFACE => Some(self.invoke_interface),
            Slots::FRAME_BLOCK => Some(self.frame_block),
            Slots::SIMPLE_BLOCK => Some(self.simple_block),
            Slots::PATTERN_BLOCK => Some(self.pattern_block),
            Slots::FUNCTION_ACTIVATION => Some(self.function_activation),
            Slots::FUNCTION_RETURN => Some(self.function_return),
            Slots::DYNAMIC_ACTIVATION => Some(self.dynamic_activation),
            Slots::FUNCTION_TAIL_FUSE => Some(self.function_tail_fuse),
            Slots::VARIANT_CONSTRUCTOR => Some(self.variant_constructor),
            Slots::UNPACK_VARIANT => Some(self.unpack_variant),
            _ => None,
        }
    }

    pub fn constant_func(&self) -> NodeFunc {
        self.constant
    }

    pub fn function_activation_func(&self) -> NodeFunc {
        self.function_activation
    }

    pub fn function_return_func(&self) -> NodeFunc {
        self.function_return
    }

    pub fn function_tail_fuse_func(&self) -> NodeFunc {
        self.function_tail_fuse
    }
}

impl fmt::Debug for MachineRep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MachineRep")
            .field("name", &self.name)
            .field("size", &self.size)
            .field("struct_alignment", &self.struct_alignment)
            .field("natural_alignment", &self.natural_alignment)
            .field("width", &self.width)
            .finish()
    }
}

/// The representation table of one machine, indexed by [`RepKind`].
pub struct MachineReps {
    reps: Vec<MachineRep>,
}

impl MachineReps {
    fn new() -> Self {
        let reps = vec![
            MachineRep::void(),
            MachineRep::scalar::<f32>("float", "f"),
            MachineRep::scalar::<f64>("double", "F"),
            MachineRep::scalar::<i32>("int", "i"),
            MachineRep::int64(),
            MachineRep::scalar::<i16>("short", "s"),
            MachineRep::scalar::<u8>("char", "c"),
            MachineRep::scalar::<bool>("bool", "b"),
            MachineRep::pointer(),
            MachineRep::vector::<Vector4f>("Vector4f", "4f"),
            MachineRep::vector::<Vector3f>("Vector3f", "3f"),
            MachineRep::vector::<Vector2f>("Vector2f", "2f"),
        ];
        debug_assert!(
            reps.iter()
                .zip(RepKind::ALL)
                .all(|(rep, kind)| rep.kind == kind),
            "representations registered out of order"
        );
        Self { reps }
    }

    #[inline]
    pub fn get(&self, kind: RepKind) -> &MachineRep {
        &self.reps[kind.index()]
    }

    pub fn iter(&self) -> impl Iterator<Item = &MachineRep> {
        self.reps.iter()
    }

    pub fn len(&self) -> usize {
        self.reps.len()
    }

    /// Tears down every representation at once.
    fn delete_all(&mut self) {
        debug!("releasing {} machine representations", self.reps.len());
        self.reps.clear();
    }
}

#[derive(Debug, Clone, Default)]
pub struct MachineCreateInfo {
    pub heap: HeapCreateInfo,
}

/// The allocator plus the representation table. Several machines may live
/// side by side; nothing here is global.
pub struct Machine {
    heap: Arc<Heap>,
    reps: MachineReps,
}

impl Machine {
    pub fn new(info: MachineCreateInfo) -> Self {
        // the collector has to exist before any representation
        let heap = Arc::new(Heap::new(info.heap));
        let reps = MachineReps::new();
        debug!(
            "machine ready: {}",
            reps.iter().map(|r| r.name).collect::<Vec<_>>().join(", ")
        );
        Self { heap, reps }
    }

    pub fn heap(&self) -> &Arc<Heap> {
        &self.heap
    }

    pub fn reps(&self) -> &MachineReps {
        &self.reps
    }

    #[inline]
    pub fn rep(&self, kind: RepKind) -> &MachineRep {
        self.reps.get(kind)
    }
}

impl Drop for Machine {
    fn drop(&mut self) {
        self.reps.delete_all();
    }
}

// ── storage access ─────────────────────────────────────────────────────

pub fn constant<T: Native>(node: &Node, _thread: &mut Thread) -> Eval<T> {
    // SAFETY: constant nodes carry data of their own representation
    Ok(unsafe { node.data().get::<T>() })
}

pub fn reference_stack<T: Native>(node: &Node, thread: &mut Thread) -> Eval<Pointer> {
    let address = node.symbol()?.stack_address()?;
    let index = address + thread.stack_offset();
    Ok(thread.slot_ptr(index)? as Pointer)
}

pub fn dereference_stack<T: Native>(node: &Node, thread: &mut Thread) -> Eval<T> {
    let address = node.symbol()?.stack_address()?;
    let value = thread.slot(address + thread.stack_offset())?;
    // SAFETY: the compiler types stack slots
    Ok(unsafe { value.get::<T>() })
}

pub fn reference_global<T: Native>(node: &Node, thread: &mut Thread) -> Eval<Pointer> {
    let address = node.symbol()?.global_address()?;
    Ok(thread.process().global_ptr(address)? as Pointer)
}

pub fn dereference_global<T: Native>(node: &Node, thread: &mut Thread) -> Eval<T> {
    let address = node.symbol()?.global_address()?;
    let ptr = thread.process().global_ptr(address)?;
    // SAFETY: slot exists; global slots are typed by the compiler
    Ok(unsafe { (*ptr).get::<T>() })
}

fn class_instance<'a>(node: &Node, thread: &mut Thread) -> Eval<&'a ClassInstance> {
    let ptr = node.arg(0).eval::<Pointer>(thread)?;
    // SAFETY: argument 0 of a member access is a class instance or nil
    unsafe { ClassInstance::from_pointer(ptr) }.ok_or_else(|| RuntimeError::nil().into())
}

/// Address of a member inside the instance structure. Shared by every
/// representation.
pub fn reference_class_member(node: &Node, thread: &mut Thread) -> Eval<Pointer> {
    let offset = node.symbol()?.instance_offset()?;
    let instance = class_instance(node, thread)?;
    Ok(instance.member_ptr(offset, 0)?)
}

pub fn dereference_class_member<T: Native>(node: &Node, thread: &mut Thread) -> Eval<T> {
    let offset = node.symbol()?.instance_offset()?;
    let instance = class_instance(node, thread)?;
    let src = instance.member_ptr(offset, size_of::<T>())?;
    // SAFETY: bounds checked above, member typed by the compiler
    Ok(unsafe { ptr::read_unaligned(src as *const T) })
}

fn component(node: &Node, width: usize) -> Eval<usize> {
    let index = node.symbol()?.member_address()?;
    if index >= width {
        return Err(RuntimeError::OutOfRange {
            index: index as i64,
            length: width,
        }
        .into());
    }
    Ok(index)
}

pub fn reference_member<V: FloatVector>(node: &Node, thread: &mut Thread) -> Eval<Pointer> {
    let index = component(node, V::WIDTH)?;
    let vector = node.arg(0).eval::<Pointer>(thread)?;
    if vector.is_null() {
        return Err(RuntimeError::nil().into());
    }
    // SAFETY: index < width and the vector is laid out as packed floats
    Ok(unsafe { (vector as *mut f32).add(index) } as Pointer)
}

pub fn dereference_member<V: FloatVector>(node: &Node, thread: &mut Thread) -> Eval<f32> {
    let index = component(node, V::WIDTH)?;
    let vector = node.arg(0).eval::<Pointer>(thread)?;
    if vector.is_null() {
        return Err(RuntimeError::nil().into());
    }
    // SAFETY: see reference_member
    Ok(unsafe { ptr::read_unaligned((vector as *const f32).add(index)) })
}

pub fn extract_member<V: FloatVector>(node: &Node, thread: &mut Thread) -> Eval<f32> {
    let index = component(node, V::WIDTH)?;
    let vector = node.arg(0).eval::<V>(thread)?;
    Ok(vector.components()[index])
}

// ── variants ───────────────────────────────────────────────────────────

fn variant_instance<'a>(node: &Node, thread: &mut Thread) -> Eval<&'a VariantInstance> {
    let ptr = node.arg(0).eval::<Pointer>(thread)?;
    // SAFETY: argument 0 of an unpack is a variant instance or nil
    unsafe { VariantInstance::from_pointer(ptr) }.ok_or_else(|| RuntimeError::nil().into())
}

pub fn unpack_variant<T: Native>(node: &Node, thread: &mut Thread) -> Eval<T> {
    let instance = variant_instance(node, thread)?;
    // SAFETY: the tag fixes the payload representation
    Ok(unsafe { instance.payload().get::<T>() })
}

pub fn variant_constructor<T: Native>(node: &Node, thread: &mut Thread) -> Eval<Pointer> {
    let tag = node.symbol()?.variant_tag()?.clone();
    let payload = node.arg(0).eval::<T>(thread)?;
    let instance = VariantInstance::allocate(thread.heap(), tag, payload.into_value());
    Ok(instance)
}

/// Pointer payloads are copied through the tag's representation type.
pub fn pointer_variant_constructor(node: &Node, thread: &mut Thread) -> Eval<Pointer> {
    let tag = node.symbol()?.variant_tag()?.clone();
    let source = node.arg(0).eval::<Pointer>(thread)?;
    let representation = tag.representation_type()?;
    let copy = representation.copy_instance(thread.heap(), source);
    Ok(VariantInstance::allocate(thread.heap(), tag, Value::new(copy)))
}

pub fn void_variant_constructor(node: &Node, thread: &mut Thread) -> Eval<Pointer> {
    let tag = node.symbol()?.variant_tag()?.clone();
    Ok(VariantInstance::allocate(thread.heap(), tag, Value::ZERO))
}
