//! Executable tree nodes. Each node carries the node function that
//! evaluates it, typed by the representation it produces.
use std::{
    fmt,
    sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
    },
};

use crate::{Eval, Native, Pointer, RepKind, RuntimeError, Symbol, SymbolRef, Thread, Value, machine};

pub type NodeFn<T> = fn(&Node, &mut Thread) -> Eval<T>;

#[derive(Clone, Copy)]
pub enum NodeFunc {
    Void(NodeFn<()>),
    Float(NodeFn<f32>),
    Double(NodeFn<f64>),
    Int(NodeFn<i32>),
    Int64(NodeFn<i64>),
    Short(NodeFn<i16>),
    Char(NodeFn<u8>),
    Bool(NodeFn<bool>),
    Pointer(NodeFn<Pointer>),
    Vector4f(NodeFn<crate::Vector4f>),
    Vector3f(NodeFn<crate::Vector3f>),
    Vector2f(NodeFn<crate::Vector2f>),
}

impl NodeFunc {
    pub fn kind(self) -> RepKind {
        match self {
            NodeFunc::Void(_) => RepKind::Void,
            NodeFunc::Float(_) => RepKind::Float,
            NodeFunc::Double(_) => RepKind::Double,
            NodeFunc::Int(_) => RepKind::Int,
            NodeFunc::Int64(_) => RepKind::Int64,
            NodeFunc::Short(_) => RepKind::Short,
            NodeFunc::Char(_) => RepKind::Char,
            NodeFunc::Bool(_) => RepKind::Bool,
            NodeFunc::Pointer(_) => RepKind::Pointer,
            NodeFunc::Vector4f(_) => RepKind::Vector4f,
            NodeFunc::Vector3f(_) => RepKind::Vector3f,
            NodeFunc::Vector2f(_) => RepKind::Vector2f,
        }
    }

    /// Evaluates `node` whatever its representation.
    pub fn call_value(self, node: &Node, thread: &mut Thread) -> Eval<Value> {
        match self {
            NodeFunc::Void(f) => f(node, thread).map(Native::into_value),
            NodeFunc::Float(f) => f(node, thread).map(Native::into_value),
            NodeFunc::Double(f) => f(node, thread).map(Native::into_value),
            NodeFunc::Int(f) => f(node, thread).map(Native::into_value),
            NodeFunc::Int64(f) => f(node, thread).map(Native::into_value),
            NodeFunc::Short(f) => f(node, thread).map(Native::into_value),
            NodeFunc::Char(f) => f(node, thread).map(Native::into_value),
            NodeFunc::Bool(f) => f(node, thread).map(Native::into_value),
            NodeFunc::Pointer(f) => f(node, thread).map(Native::into_value),
            NodeFunc::Vector4f(f) => f(node, thread).map(Native::into_value),
            NodeFunc::Vector3f(f) => f(node, thread).map(Native::into_value),
            NodeFunc::Vector2f(f) => f(node, thread).map(Native::into_value),
        }
    }
}

impl fmt::Debug for NodeFunc {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "NodeFunc({:?})", self.kind())
    }
}

pub type NodeRef = Arc<Node>;

pub struct Node {
    func: NodeFunc,
    symbol: Option<SymbolRef>,
    args: Box<[NodeRef]>,
    data: Value,
}

impl Node {
    pub fn new(func: NodeFunc, symbol: Option<SymbolRef>, args: Vec<NodeRef>) -> NodeRef {
        Arc::new(Self::unshared(func, symbol, args, Value::ZERO))
    }

    pub fn with_data(
        func: NodeFunc,
        symbol: Option<SymbolRef>,
        args: Vec<NodeRef>,
        data: Value,
    ) -> NodeRef {
        Arc::new(Self::unshared(func, symbol, args, data))
    }

    /// Constant of the representation of `T`.
    pub fn constant<T: Native>(value: T) -> NodeRef {
        Self::with_data(T::wrap(machine::constant::<T>), None, Vec::new(), value.into_value())
    }

    pub(crate) fn unshared(
        func: NodeFunc,
        symbol: Option<SymbolRef>,
        args: Vec<NodeRef>,
        data: Value,
    ) -> Self {
        Self {
            func,
            symbol,
            args: args.into_boxed_slice(),
            data,
        }
    }

    pub fn func(&self) -> NodeFunc {
        self.func
    }

    pub fn rep(&self) -> RepKind {
        self.func.kind()
    }

    pub fn symbol(&self) -> Result<&Symbol, RuntimeError> {
        self.symbol
            .as_deref()
            .ok_or_else(|| RuntimeError::SymbolMismatch {
                expected: "symbol",
                symbol: "<anonymous node>".into(),
            })
    }

    pub fn symbol_ref(&self) -> Option<&SymbolRef> {
        self.symbol.as_ref()
    }

    pub fn args(&self) -> &[NodeRef] {
        &self.args
    }

    pub fn num_args(&self) -> usize {
        self.args.len()
    }

    /// # Panics
    /// If the node has fewer than `index + 1` arguments; arity is fixed when
    /// the tree is built.
    #[inline]
    pub fn arg(&self, index: usize) -> &Node {
        &self.args[index]
    }

    #[inline]
    pub fn arg_ref(&self, index: usize) -> &NodeRef {
        &self.args[index]
    }

    pub fn data(&self) -> Value {
        self.data
    }

    fn describe(&self) -> String {
        match &self.symbol {
            Some(symbol) => symbol.name().to_string(),
            None => format!("<{:?} node>", self.rep()),
        }
    }

    /// Evaluates as `T`; a node of another representation is an error.
    #[inline]
    pub fn eval<T: Native>(&self, thread: &mut Thread) -> Eval<T> {
        match T::unwrap(self.func) {
            Some(f) => f(self, thread),
            None => Err(RuntimeError::NilNodeFunc {
                function: self.describe(),
            }
            .into()),
        }
    }

    #[inline]
    pub fn eval_any(&self, thread: &mut Thread) -> Eval<Value> {
        self.func.call_value(self, thread)
    }
}

impl fmt::Debug for Node {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Node")
            .field("func", &self.func)
            .field("symbol", &self.symbol)
            .field("args", &self.args.len())
            .finish()
    }
}

/// Scratch call node built for one dispatched call. The live count on the
/// thread drops when it goes away, whichever way the call exits.
pub struct ArgumentBuffer {
    node: Node,
    live: Arc<AtomicUsize>,
}

impl ArgumentBuffer {
    pub fn new(thread: &Thread, func: NodeFunc, symbol: SymbolRef, args: Vec<NodeRef>) -> Self {
        let live = thread.argument_buffer_counter().clone();
        live.fetch_add(1, Ordering::Relaxed);
        Self {
            node: Node::unshared(func, Some(symbol), args, Value::ZERO),
            live,
        }
    }

    /// Receiver constant first, then the call site's remaining arguments.
    pub fn with_receiver(
        thread: &Thread,
        func: NodeFunc,
        symbol: SymbolRef,
        receiver: Pointer,
        call: &Node,
    ) -> Self {
        let mut args = Vec::with_capacity(call.num_args());
        args.push(Node::constant::<Pointer>(receiver));
        args.extend(call.args().iter().skip(1).cloned());
        Self::new(thread, func, symbol, args)
    }

    pub fn node(&self) -> &Node {
        &self.node
    }
}

impl Drop for ArgumentBuffer {
    fn drop(&mut self) {
        self.live.fetch_sub(1, Ordering::Relaxed);
    }
}
