//! The language context: machine, names, the standard types and the
//! registered native functions. Shared by every process built on it.
use std::{collections::HashMap, sync::Arc};

use log::debug;
use parking_lot::Mutex;
use regex::Regex;

use crate::{
    ClassType, FunctionRole, Heap, InterfaceType, Machine, MachineCreateInfo, NamePool, RepKind,
    RuntimeError, Symbol, SymbolRef, Type, TypeKind, TypeRef, VariantTagType, strings,
};

pub struct StandardTypes {
    pub void: TypeRef,
    pub int: TypeRef,
    pub int64: TypeRef,
    pub short: TypeRef,
    pub half: TypeRef,
    pub byte: TypeRef,
    pub char: TypeRef,
    pub float: TypeRef,
    pub double: TypeRef,
    pub bool: TypeRef,
    pub vec2f: TypeRef,
    pub vec3f: TypeRef,
    pub vec4f: TypeRef,
    pub string: TypeRef,
    pub opaque: TypeRef,
    pub function: TypeRef,
    pub char_array: TypeRef,
    pub string_array: TypeRef,
}

impl StandardTypes {
    fn new(names: &NamePool) -> Self {
        let ty = |name: &str, rep, kind| Type::new(names.intern(name), rep, kind);
        let char = ty("char", RepKind::Int, TypeKind::Char);
        let string = ty("string", RepKind::Pointer, TypeKind::String);
        Self {
            void: ty("void", RepKind::Void, TypeKind::Void),
            int: ty("int", RepKind::Int, TypeKind::Int),
            int64: ty("int64", RepKind::Int64, TypeKind::Int64),
            short: ty("short", RepKind::Short, TypeKind::Short),
            half: ty("half", RepKind::Short, TypeKind::Half),
            byte: ty("byte", RepKind::Char, TypeKind::Byte),
            float: ty("float", RepKind::Float, TypeKind::Float),
            double: ty("double", RepKind::Double, TypeKind::Double),
            bool: ty("bool", RepKind::Bool, TypeKind::Bool),
            vec2f: ty("Vector2f", RepKind::Vector2f, TypeKind::Vector { width: 2 }),
            vec3f: ty("Vector3f", RepKind::Vector3f, TypeKind::Vector { width: 3 }),
            vec4f: ty("Vector4f", RepKind::Vector4f, TypeKind::Vector { width: 4 }),
            opaque: ty("opaque", RepKind::Pointer, TypeKind::Opaque),
            function: ty("function", RepKind::Pointer, TypeKind::Function),
            char_array: ty("char[]", RepKind::Pointer, TypeKind::Array { element: char.clone() }),
            string_array: ty("string[]", RepKind::Pointer, TypeKind::Array { element: string.clone() }),
            char,
            string,
        }
    }
}

pub struct Context {
    machine: Machine,
    names: NamePool,
    types: StandardTypes,
    natives: HashMap<&'static str, SymbolRef, ahash::RandomState>,
    functions: Mutex<Vec<SymbolRef>>,
    format_directive: Regex,
}

impl Context {
    pub fn new(info: MachineCreateInfo) -> Arc<Self> {
        let machine = Machine::new(info);
        let names = NamePool::new();
        let types = StandardTypes::new(&names);

        let mut natives = HashMap::default();
        for desc in strings::natives() {
            let name = names.intern(&format!("string.{}", desc.name));
            natives.insert(desc.name, Symbol::native_function(name, desc.func, desc.arity));
        }
        debug!("registered {} string natives", natives.len());

        let format_directive = Regex::new(r"([^%]*)?(%[-+ 0]*([0-9]*)(\.[0-9]+)?[a-zA-Z%])?")
            .expect("format directive pattern should compile");

        Arc::new(Self {
            machine,
            names,
            types,
            natives,
            functions: Mutex::new(Vec::new()),
            format_directive,
        })
    }

    pub fn machine(&self) -> &Machine {
        &self.machine
    }

    pub fn heap(&self) -> &Heap {
        self.machine.heap()
    }

    pub fn names(&self) -> &NamePool {
        &self.names
    }

    pub fn types(&self) -> &StandardTypes {
        &self.types
    }

    pub(crate) fn format_directive(&self) -> &Regex {
        &self.format_directive
    }

    /// Native string operation by its table name, e.g. `"+"` or `"%(tuple)"`.
    pub fn native(&self, name: &str) -> Option<&SymbolRef> {
        self.natives.get(name)
    }

    pub fn natives(&self) -> impl Iterator<Item = (&'static str, &SymbolRef)> {
        self.natives.iter().map(|(name, symbol)| (*name, symbol))
    }

    // ── types ──────────────────────────────────────────────────────────

    pub fn class_type(
        &self,
        name: &str,
        super_class: Option<TypeRef>,
        fields: &[(&str, TypeRef)],
    ) -> TypeRef {
        let fields = fields
            .iter()
            .map(|(field, ty)| (self.names.intern(field), ty.clone()))
            .collect();
        let class = ClassType::new(super_class, fields, self.machine.reps());
        Type::new(self.names.intern(name), RepKind::Pointer, TypeKind::Class(class))
    }

    /// Tuples are named after their element types, `(int,string)`.
    pub fn tuple_type(&self, elements: &[TypeRef]) -> TypeRef {
        let name = format!(
            "({})",
            elements
                .iter()
                .map(|t| t.fully_qualified_name())
                .collect::<Vec<_>>()
                .join(",")
        );
        let fields = elements
            .iter()
            .enumerate()
            .map(|(i, ty)| (self.names.intern(&format!("_{i}")), ty.clone()))
            .collect();
        let class = ClassType::new(None, fields, self.machine.reps());
        Type::new(self.names.intern(&name), RepKind::Pointer, TypeKind::Tuple(class))
    }

    pub fn interface_type(&self, name: &str, functions: &[&str]) -> TypeRef {
        let functions = functions.iter().map(|f| self.names.intern(f)).collect();
        Type::new(
            self.names.intern(name),
            RepKind::Pointer,
            TypeKind::Interface(InterfaceType::new(functions)),
        )
    }

    pub fn variant_tag(&self, name: &str, representation: TypeRef) -> TypeRef {
        Type::new(
            self.names.intern(name),
            RepKind::Pointer,
            TypeKind::VariantTag(VariantTagType::new(representation)),
        )
    }

    pub fn array_type(&self, element: TypeRef) -> TypeRef {
        let name = format!("{}[]", element.fully_qualified_name());
        Type::new(self.names.intern(&name), RepKind::Pointer, TypeKind::Array { element })
    }

    // ── functions ──────────────────────────────────────────────────────

    /// A script function whose body is set later.
    pub fn function(
        &self,
        name: &str,
        return_rep: RepKind,
        stack_size: usize,
        role: FunctionRole,
    ) -> SymbolRef {
        let func = self.machine.rep(return_rep).function_activation_func();
        let symbol = Symbol::compiled_function(self.names.intern(name), func, stack_size, role);
        self.functions.lock().push(symbol.clone());
        symbol
    }

    /// Adds a virtual method in the next free slot of `class`.
    pub fn method(
        &self,
        class: &TypeRef,
        name: &str,
        return_rep: RepKind,
        stack_size: usize,
    ) -> SymbolRef {
        let Some(layout) = class.class() else {
            return self.function(name, return_rep, stack_size, FunctionRole::Free);
        };
        let slot = layout.method_count();
        let method = self.function(name, return_rep, stack_size, FunctionRole::Method { slot });
        layout.push_method(method.clone());
        method
    }

    /// Replaces `base` in the method table of `class` with a new function.
    pub fn override_method(
        &self,
        class: &TypeRef,
        base: &SymbolRef,
        name: &str,
    ) -> Result<SymbolRef, RuntimeError> {
        let function = base.function()?;
        let mismatch = || RuntimeError::SymbolMismatch {
            expected: "method",
            symbol: base.name().to_string(),
        };
        let FunctionRole::Method { slot } = *function.role() else {
            return Err(mismatch());
        };
        let method = self.function(
            name,
            function.return_rep(),
            function.stack_size(),
            FunctionRole::Method { slot },
        );
        match class.class() {
            Some(layout) if layout.replace_method(slot, method.clone()) => Ok(method),
            _ => Err(mismatch()),
        }
    }

    /// Dispatch stub for function `index` of `interface`.
    pub fn interface_function(&self, interface: &TypeRef, index: usize, return_rep: RepKind) -> SymbolRef {
        let name = match interface.kind() {
            TypeKind::Interface(iface) => iface
                .functions()
                .get(index)
                .map(|f| format!("{}.{}", interface.name(), f)),
            _ => None,
        }
        .unwrap_or_else(|| format!("{}.{}", interface.name(), index));
        let func = self.machine.rep(return_rep).function_activation_func();
        Symbol::compiled_function(
            self.names.intern(&name),
            func,
            1,
            FunctionRole::Interface {
                interface: interface.clone(),
                index,
            },
        )
    }

    pub fn variant_constructor(&self, tag: &TypeRef) -> SymbolRef {
        Symbol::variant_constructor(tag.name().clone(), tag.clone())
    }
}

impl Drop for Context {
    fn drop(&mut self) {
        // bodies refer back to their own symbols
        let functions = self.functions.get_mut();
        debug!("releasing {} function bodies", functions.len());
        for symbol in functions.drain(..) {
            if let Ok(function) = symbol.function() {
                function.clear_body();
            }
        }
    }
}
