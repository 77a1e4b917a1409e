//! Language-level types: the representation each type is carried in, class
//! layout, dynamic dispatch tables and value printing.
use std::{ptr, sync::Arc};

use parking_lot::RwLock;

use crate::{
    ClassInstance, DynamicArray, FunctionObject, Heap, MachineReps, Name, Object, Pointer,
    RepKind, RuntimeError, StringObject, SymbolRef, Value, VariantInstance, format::float_text,
    format::g_text, half_to_float,
};

pub type TypeRef = Arc<Type>;

pub struct Type {
    name: Name,
    rep: RepKind,
    kind: TypeKind,
}

pub enum TypeKind {
    Void,
    Int,
    Int64,
    Short,
    /// binary16 bits in a short slot
    Half,
    Byte,
    /// unicode code point in an int slot
    Char,
    Float,
    Double,
    Bool,
    Vector { width: usize },
    String,
    Opaque,
    Function,
    Array { element: TypeRef },
    Class(ClassType),
    Tuple(ClassType),
    Interface(InterfaceType),
    VariantTag(VariantTagType),
}

#[derive(Clone)]
pub struct Field {
    pub name: Name,
    pub ty: TypeRef,
    pub offset: usize,
}

pub struct ClassType {
    super_class: Option<TypeRef>,
    fields: Vec<Field>,
    size: usize,
    alignment: usize,
    methods: RwLock<Vec<SymbolRef>>,
    implementations: RwLock<Vec<Arc<InterfaceImp>>>,
}

pub struct InterfaceType {
    functions: Vec<Name>,
}

/// How one class satisfies one interface; functions in interface order.
pub struct InterfaceImp {
    interface: TypeRef,
    functions: Vec<SymbolRef>,
}

pub struct VariantTagType {
    representation: TypeRef,
}

fn align_up(offset: usize, alignment: usize) -> usize {
    offset.div_ceil(alignment) * alignment
}

impl ClassType {
    /// Lays out `fields` after the inherited ones. Each field is placed on
    /// the structure alignment of its representation.
    pub fn new(super_class: Option<TypeRef>, fields: Vec<(Name, TypeRef)>, reps: &MachineReps) -> Self {
        let inherited = super_class.as_ref().and_then(|s| s.class());
        let mut offset = inherited.map_or(0, |c| c.size);
        let mut alignment = inherited.map_or(1, |c| c.alignment);
        let mut laid_out = inherited.map_or_else(Vec::new, |c| c.fields.clone());
        let methods = inherited.map_or_else(Vec::new, |c| c.methods.read().clone());

        for (name, ty) in fields {
            let rep = reps.get(ty.rep());
            let align = rep.struct_alignment().max(1);
            offset = align_up(offset, align);
            laid_out.push(Field { name, ty, offset });
            offset += rep.size();
            alignment = alignment.max(align);
        }

        Self {
            super_class,
            fields: laid_out,
            size: align_up(offset, alignment),
            alignment,
            methods: RwLock::new(methods),
            implementations: RwLock::new(Vec::new()),
        }
    }

    pub fn super_class(&self) -> Option<&TypeRef> {
        self.super_class.as_ref()
    }

    pub fn fields(&self) -> &[Field] {
        &self.fields
    }

    pub fn field(&self, name: &str) -> Option<(usize, &Field)> {
        self.fields
            .iter()
            .enumerate()
            .find(|(_, f)| f.name.as_str() == name)
    }

    pub fn size(&self) -> usize {
        self.size
    }

    pub fn alignment(&self) -> usize {
        self.alignment
    }

    pub fn method_count(&self) -> usize {
        self.methods.read().len()
    }

    /// Appends a method and returns its slot.
    pub(crate) fn push_method(&self, function: SymbolRef) -> usize {
        let mut methods = self.methods.write();
        methods.push(function);
        methods.len() - 1
    }

    pub(crate) fn replace_method(&self, slot: usize, function: SymbolRef) -> bool {
        match self.methods.write().get_mut(slot) {
            Some(entry) => {
                *entry = function;
                true
            }
            None => false,
        }
    }

    /// The override of a method for this class.
    pub fn dynamic_lookup(&self, slot: usize) -> Option<SymbolRef> {
        self.methods.read().get(slot).cloned()
    }

    pub fn implement(&self, interface: TypeRef, functions: Vec<SymbolRef>) {
        self.implementations
            .write()
            .push(Arc::new(InterfaceImp { interface, functions }));
    }

    /// Implementation of `interface` here or on an ancestor.
    pub fn implementation(&self, interface: &Type) -> Option<Arc<InterfaceImp>> {
        let found = self
            .implementations
            .read()
            .iter()
            .find(|imp| ptr::eq(imp.interface.as_ref(), interface))
            .cloned();
        found.or_else(|| self.super_class.as_ref()?.class()?.implementation(interface))
    }
}

impl InterfaceType {
    pub fn new(functions: Vec<Name>) -> Self {
        Self { functions }
    }

    pub fn functions(&self) -> &[Name] {
        &self.functions
    }
}

impl InterfaceImp {
    pub fn interface(&self) -> &TypeRef {
        &self.interface
    }

    pub fn function(&self, index: usize) -> Option<&SymbolRef> {
        self.functions.get(index)
    }
}

impl VariantTagType {
    pub fn new(representation: TypeRef) -> Self {
        Self { representation }
    }
}

impl Type {
    pub fn new(name: Name, rep: RepKind, kind: TypeKind) -> TypeRef {
        Arc::new(Self { name, rep, kind })
    }

    pub fn name(&self) -> &Name {
        &self.name
    }

    /// Names are interned already qualified.
    pub fn fully_qualified_name(&self) -> &str {
        self.name.as_str()
    }

    pub fn rep(&self) -> RepKind {
        self.rep
    }

    pub fn kind(&self) -> &TypeKind {
        &self.kind
    }

    /// Layout of classes and tuples.
    pub fn class(&self) -> Option<&ClassType> {
        match &self.kind {
            TypeKind::Class(class) | TypeKind::Tuple(class) => Some(class),
            _ => None,
        }
    }

    pub fn is_tuple(&self) -> bool {
        matches!(self.kind, TypeKind::Tuple(_))
    }

    pub fn is_string(&self) -> bool {
        matches!(self.kind, TypeKind::String)
    }

    pub fn is_char(&self) -> bool {
        matches!(self.kind, TypeKind::Char)
    }

    pub fn array_element(&self) -> Option<&TypeRef> {
        match &self.kind {
            TypeKind::Array { element } => Some(element),
            _ => None,
        }
    }

    pub fn representation_type(&self) -> Result<&TypeRef, RuntimeError> {
        match &self.kind {
            TypeKind::VariantTag(tag) => Ok(&tag.representation),
            _ => Err(RuntimeError::SymbolMismatch {
                expected: "variant tag",
                symbol: self.name.to_string(),
            }),
        }
    }

    /// Value copy for variant payloads: class instances are duplicated,
    /// everything else is shared.
    pub fn copy_instance(&self, heap: &Heap, src: Pointer) -> Pointer {
        if self.class().is_none() {
            return src;
        }
        // SAFETY: values of class types are class instances or nil
        match unsafe { ClassInstance::from_pointer(src) } {
            Some(instance) => instance.duplicate(heap),
            None => src,
        }
    }

    pub fn output_value(&self, value: Value) -> String {
        let mut out = String::new();
        self.output_recursive(&mut out, value, &mut Vec::new());
        out
    }

    fn output_recursive(&self, out: &mut String, value: Value, visiting: &mut Vec<Pointer>) {
        // SAFETY: `value` was produced with this type's representation
        unsafe {
            match &self.kind {
                TypeKind::Void => {}
                TypeKind::Int => out.push_str(&value.int.to_string()),
                TypeKind::Int64 => out.push_str(&value.int64.to_string()),
                TypeKind::Short => out.push_str(&value.short.to_string()),
                TypeKind::Byte => out.push_str(&value.char.to_string()),
                TypeKind::Half => out.push_str(&float_text(half_to_float(value.short) as f64)),
                TypeKind::Float => out.push_str(&float_text(value.float as f64)),
                TypeKind::Double => out.push_str(&float_text(value.double)),
                TypeKind::Bool => out.push_str(if value.bool { "true" } else { "false" }),
                TypeKind::Char => {
                    out.push('\'');
                    out.push(char::from_u32(value.int as u32).unwrap_or(char::REPLACEMENT_CHARACTER));
                    out.push('\'');
                }
                TypeKind::Vector { width } => {
                    let components = &value.vector4f.0[..*width];
                    out.push('<');
                    for (i, c) in components.iter().enumerate() {
                        if i > 0 {
                            out.push_str(", ");
                        }
                        out.push_str(&g_text(*c as f64));
                    }
                    out.push('>');
                }
                TypeKind::String => match StringObject::from_pointer(value.pointer) {
                    Some(string) => output_quoted_string(out, string.as_str(), '"'),
                    None => out.push_str("nil"),
                },
                TypeKind::Opaque => out.push_str(&format!("<#opaque {:p}>", value.pointer)),
                TypeKind::Function => match FunctionObject::from_pointer(value.pointer)
                    .and_then(|f| f.function())
                {
                    Some(function) => out.push_str(&format!("<#function {}>", function.name())),
                    None => out.push_str("nil"),
                },
                TypeKind::Array { element } => match DynamicArray::from_pointer(value.pointer) {
                    Some(array) => {
                        out.push('[');
                        for (i, item) in array.values().iter().enumerate() {
                            if i > 0 {
                                out.push_str(", ");
                            }
                            element.output_recursive(out, *item, visiting);
                        }
                        out.push(']');
                    }
                    None => out.push_str("nil"),
                },
                TypeKind::Class(class) | TypeKind::Tuple(class) => {
                    let ptr = value.pointer;
                    let Some(instance) = ClassInstance::from_pointer(ptr) else {
                        out.push_str("nil");
                        return;
                    };
                    if visiting.contains(&ptr) {
                        out.push_str("...ad infinitum...");
                        return;
                    }
                    visiting.push(ptr);
                    out.push_str(self.fully_qualified_name());
                    out.push_str(" {");
                    for (i, field) in class.fields().iter().enumerate() {
                        if i > 0 {
                            out.push_str(", ");
                        }
                        let field_value = instance.field(i).unwrap_or(Value::ZERO);
                        field.ty.output_recursive(out, field_value, visiting);
                    }
                    out.push('}');
                    visiting.pop();
                }
                TypeKind::Interface(_) => match Object::from_pointer(value.pointer).and_then(Object::ty) {
                    Some(actual) => actual.output_recursive(out, value, visiting),
                    None => out.push_str("nil"),
                },
                TypeKind::VariantTag(tag) => match VariantInstance::from_pointer(value.pointer) {
                    Some(instance) => {
                        out.push_str(self.fully_qualified_name());
                        if tag.representation.rep() != RepKind::Void {
                            out.push_str(" {");
                            tag.representation
                                .output_recursive(out, instance.payload(), visiting);
                            out.push('}');
                        }
                    }
                    None => out.push_str("nil"),
                },
            }
        }
    }
}

/// Writes `text` between `delimiter`s with control characters escaped.
pub fn output_quoted_string(out: &mut String, text: &str, delimiter: char) {
    out.push(delimiter);
    for c in text.chars() {
        match c {
            '\0' => out.push_str("^@"),
            '\n' => out.push_str("\\n"),
            '\u{8}' => out.push_str("\\b"),
            '\r' => out.push_str("\\r"),
            '\t' => out.push_str("\\t"),
            c if (c as u32) < 0x20 || c == '\u{7f}' => {
                out.push_str(&format!("\\u{:04x}", c as u32))
            }
            c if c == delimiter => {
                out.push('\\');
                out.push(c);
            }
            c => out.push(c),
        }
    }
    out.push(delimiter);
}
