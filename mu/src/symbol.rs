use std::{fmt, sync::Arc};

use parking_lot::RwLock;

use crate::{Name, NodeFunc, NodeRef, RepKind, RuntimeError, TypeRef};

pub type SymbolRef = Arc<Symbol>;

/// Compiler symbol attached to nodes: where a variable lives, or what a
/// function is.
pub struct Symbol {
    name: Name,
    kind: SymbolKind,
}

pub enum SymbolKind {
    StackVariable { address: usize },
    GlobalVariable { address: usize },
    MemberVariable { instance_offset: usize, address: usize },
    Function(Function),
    VariantConstructor { tag: TypeRef },
}

#[derive(Clone)]
pub enum FunctionRole {
    Free,
    /// slot in the class method table
    Method { slot: usize },
    /// position in an interface
    Interface { interface: TypeRef, index: usize },
}

pub struct Function {
    return_rep: RepKind,
    stack_size: usize,
    role: FunctionRole,
    func: NodeFunc,
    compiled: bool,
    body: RwLock<Option<NodeRef>>,
}

impl Function {
    pub fn return_rep(&self) -> RepKind {
        self.return_rep
    }

    pub fn stack_size(&self) -> usize {
        self.stack_size
    }

    pub fn role(&self) -> &FunctionRole {
        &self.role
    }

    /// Node function that activates this function at a call site.
    pub fn func(&self) -> NodeFunc {
        self.func
    }

    /// Script functions have a body; natives are their node function.
    pub fn is_compiled(&self) -> bool {
        self.compiled
    }

    pub fn body(&self) -> Option<NodeRef> {
        self.body.read().clone()
    }

    pub fn set_body(&self, body: NodeRef) {
        *self.body.write() = Some(body);
    }

    pub(crate) fn clear_body(&self) {
        self.body.write().take();
    }
}

impl Symbol {
    pub fn stack_variable(name: Name, address: usize) -> SymbolRef {
        Arc::new(Self {
            name,
            kind: SymbolKind::StackVariable { address },
        })
    }

    pub fn global_variable(name: Name, address: usize) -> SymbolRef {
        Arc::new(Self {
            name,
            kind: SymbolKind::GlobalVariable { address },
        })
    }

    pub fn member_variable(name: Name, instance_offset: usize, address: usize) -> SymbolRef {
        Arc::new(Self {
            name,
            kind: SymbolKind::MemberVariable {
                instance_offset,
                address,
            },
        })
    }

    /// A function compiled to a body; `func` is the activation node
    /// function of its return representation.
    pub fn compiled_function(
        name: Name,
        func: NodeFunc,
        stack_size: usize,
        role: FunctionRole,
    ) -> SymbolRef {
        Arc::new(Self {
            name,
            kind: SymbolKind::Function(Function {
                return_rep: func.kind(),
                stack_size,
                role,
                func,
                compiled: true,
                body: RwLock::new(None),
            }),
        })
    }

    /// A function implemented by a node function directly.
    pub fn native_function(name: Name, func: NodeFunc, arity: usize) -> SymbolRef {
        Arc::new(Self {
            name,
            kind: SymbolKind::Function(Function {
                return_rep: func.kind(),
                stack_size: arity,
                role: FunctionRole::Free,
                func,
                compiled: false,
                body: RwLock::new(None),
            }),
        })
    }

    pub fn variant_constructor(name: Name, tag: TypeRef) -> SymbolRef {
        Arc::new(Self {
            name,
            kind: SymbolKind::VariantConstructor { tag },
        })
    }

    pub fn name(&self) -> &Name {
        &self.name
    }

    pub fn kind(&self) -> &SymbolKind {
        &self.kind
    }

    fn mismatch(&self, expected: &'static str) -> RuntimeError {
        RuntimeError::SymbolMismatch {
            expected,
            symbol: self.name.to_string(),
        }
    }

    pub fn stack_address(&self) -> Result<usize, RuntimeError> {
        match self.kind {
            SymbolKind::StackVariable { address } => Ok(address),
            _ => Err(self.mismatch("stack variable")),
        }
    }

    pub fn global_address(&self) -> Result<usize, RuntimeError> {
        match self.kind {
            SymbolKind::GlobalVariable { address } => Ok(address),
            _ => Err(self.mismatch("global variable")),
        }
    }

    pub fn instance_offset(&self) -> Result<usize, RuntimeError> {
        match self.kind {
            SymbolKind::MemberVariable {
                instance_offset, ..
            } => Ok(instance_offset),
            _ => Err(self.mismatch("member variable")),
        }
    }

    /// Component index for vector members.
    pub fn member_address(&self) -> Result<usize, RuntimeError> {
        match self.kind {
            SymbolKind::MemberVariable { address, .. } => Ok(address),
            _ => Err(self.mismatch("member variable")),
        }
    }

    pub fn function(&self) -> Result<&Function, RuntimeError> {
        match &self.kind {
            SymbolKind::Function(function) => Ok(function),
            _ => Err(self.mismatch("function")),
        }
    }

    pub fn variant_tag(&self) -> Result<&TypeRef, RuntimeError> {
        match &self.kind {
            SymbolKind::VariantConstructor { tag } => Ok(tag),
            _ => Err(self.mismatch("variant constructor")),
        }
    }
}

impl fmt::Debug for Symbol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let kind = match &self.kind {
            SymbolKind::StackVariable { .. } => "stack variable",
            SymbolKind::GlobalVariable { .. } => "global variable",
            SymbolKind::MemberVariable { .. } => "member variable",
            SymbolKind::Function(_) => "function",
            SymbolKind::VariantConstructor { .. } => "variant constructor",
        };
        write!(f, "Symbol({} {})", kind, self.name)
    }
}
