//! Process and thread state. A process shares the context and the global
//! slots; each thread owns a fixed-capacity value stack, so slot addresses
//! handed out by reference nodes stay valid for the lifetime of the frame.
use std::{
    cell::UnsafeCell,
    sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
    },
};

use log::trace;

use crate::{Context, Heap, Native, Node, NodeRef, RuntimeError, Unwind, Value};

#[derive(Debug, Clone)]
pub struct ProcessCreateInfo {
    /// number of global slots
    pub globals: usize,
}

impl Default for ProcessCreateInfo {
    fn default() -> Self {
        Self { globals: 256 }
    }
}

pub struct Process {
    context: Arc<Context>,
    globals: Box<[UnsafeCell<Value>]>,
}

// globals are unsynchronized machine slots, written through raw pointers
// exactly like compiled code would
unsafe impl Sync for Process {}
unsafe impl Send for Process {}

impl Process {
    pub fn new(context: Arc<Context>, info: &ProcessCreateInfo) -> Arc<Self> {
        let globals = (0..info.globals).map(|_| UnsafeCell::new(Value::ZERO)).collect();
        Arc::new(Self { context, globals })
    }

    pub fn context(&self) -> &Arc<Context> {
        &self.context
    }

    pub fn global_ptr(&self, address: usize) -> Result<*mut Value, RuntimeError> {
        self.globals
            .get(address)
            .map(UnsafeCell::get)
            .ok_or(RuntimeError::OutOfRange {
                index: address as i64,
                length: self.globals.len(),
            })
    }
}

#[derive(Debug, Clone)]
pub struct ThreadCreateInfo {
    /// capacity of the value stack, in slots
    pub stack_size: usize,
}

impl Default for ThreadCreateInfo {
    fn default() -> Self {
        Self {
            stack_size: 64 * 1024,
        }
    }
}

/// Saved frame position, restored on every exit from a block or call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StackRecord {
    offset: usize,
    top: usize,
}

impl StackRecord {
    pub fn top(&self) -> usize {
        self.top
    }
}

pub struct Thread {
    process: Arc<Process>,
    stack: Box<[Value]>,
    stack_offset: usize,
    top: usize,
    return_value: Value,
    continuation: Option<NodeRef>,
    activation_depth: usize,
    max_activation_depth: usize,
    argument_buffers: Arc<AtomicUsize>,
}

impl Thread {
    pub fn new(process: Arc<Process>, info: &ThreadCreateInfo) -> Self {
        Self {
            process,
            stack: vec![Value::ZERO; info.stack_size].into_boxed_slice(),
            stack_offset: 0,
            top: 0,
            return_value: Value::ZERO,
            continuation: None,
            activation_depth: 0,
            max_activation_depth: 0,
            argument_buffers: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn process(&self) -> &Arc<Process> {
        &self.process
    }

    pub fn context(&self) -> &Context {
        &self.process.context
    }

    pub fn heap(&self) -> &Heap {
        self.process.context.heap()
    }

    // ── stack ──────────────────────────────────────────────────────────

    pub fn stack_offset(&self) -> usize {
        self.stack_offset
    }

    pub fn stack_top(&self) -> usize {
        self.top
    }

    pub fn stack_capacity(&self) -> usize {
        self.stack.len()
    }

    fn out_of_range(&self, index: usize) -> RuntimeError {
        RuntimeError::OutOfRange {
            index: index as i64,
            length: self.stack.len(),
        }
    }

    pub fn slot(&self, index: usize) -> Result<Value, RuntimeError> {
        self.stack.get(index).copied().ok_or_else(|| self.out_of_range(index))
    }

    pub fn set_slot(&mut self, index: usize, value: Value) -> Result<(), RuntimeError> {
        if index >= self.stack.len() {
            return Err(self.out_of_range(index));
        }
        self.stack[index] = value;
        Ok(())
    }

    pub fn slot_ptr(&mut self, index: usize) -> Result<*mut Value, RuntimeError> {
        let len = self.stack.len();
        if index >= len {
            return Err(self.out_of_range(index));
        }
        // SAFETY: in bounds
        Ok(unsafe { self.stack.as_mut_ptr().add(index) })
    }

    pub fn record(&self) -> StackRecord {
        StackRecord {
            offset: self.stack_offset,
            top: self.top,
        }
    }

    pub fn restore(&mut self, record: StackRecord) {
        self.stack_offset = record.offset;
        self.top = record.top;
    }

    /// Pushes `size` zeroed slots and returns where they start.
    pub(crate) fn reserve(&mut self, size: usize) -> Result<usize, RuntimeError> {
        let start = self.top;
        let available = self.stack.len() - start;
        if size > available {
            return Err(RuntimeError::StackOverflow {
                requested: size,
                available,
            });
        }
        self.stack[start..start + size].fill(Value::ZERO);
        self.top = start + size;
        Ok(start)
    }

    /// Opens a zeroed frame of `size` slots at the top of the stack.
    pub fn new_stack_frame(&mut self, size: usize) -> Result<(), RuntimeError> {
        self.stack_offset = self.reserve(size)?;
        Ok(())
    }

    pub(crate) fn set_stack_offset(&mut self, offset: usize) {
        self.stack_offset = offset;
    }

    /// Moves a staged frame down to `to` and drops everything above it.
    pub(crate) fn slide_frame(&mut self, from: usize, to: usize, size: usize) {
        self.stack.copy_within(from..from + size, to);
        self.top = to + size;
    }

    // ── jumps ──────────────────────────────────────────────────────────

    pub fn return_value(&self) -> Value {
        self.return_value
    }

    pub(crate) fn set_return_value(&mut self, value: Value) {
        self.return_value = value;
    }

    pub(crate) fn set_continuation(&mut self, node: NodeRef) {
        self.continuation = Some(node);
    }

    pub(crate) fn take_continuation(&mut self) -> Option<NodeRef> {
        self.continuation.take()
    }

    // ── instrumentation ────────────────────────────────────────────────

    pub(crate) fn enter_activation(&mut self) {
        self.activation_depth += 1;
        self.max_activation_depth = self.max_activation_depth.max(self.activation_depth);
    }

    pub(crate) fn leave_activation(&mut self) {
        self.activation_depth -= 1;
    }

    pub fn activation_depth(&self) -> usize {
        self.activation_depth
    }

    /// Deepest nesting of function activations since the last reset.
    pub fn max_activation_depth(&self) -> usize {
        self.max_activation_depth
    }

    pub fn reset_max_activation_depth(&mut self) {
        self.max_activation_depth = self.activation_depth;
    }

    pub(crate) fn argument_buffer_counter(&self) -> &Arc<AtomicUsize> {
        &self.argument_buffers
    }

    pub fn live_argument_buffers(&self) -> usize {
        self.argument_buffers.load(Ordering::Relaxed)
    }

    // ── entry ──────────────────────────────────────────────────────────

    /// Top-level evaluation. A return that reaches this point delivers its
    /// value; any other jump becomes an error.
    pub fn call<T: Native>(&mut self, node: &Node) -> Result<T, RuntimeError> {
        let record = self.record();
        let result = match node.eval::<T>(self) {
            Ok(value) => Ok(value),
            // SAFETY: the return node was typed like the caller
            Err(Unwind::Return) => Ok(unsafe { self.return_value.get::<T>() }),
            Err(unwind) => Err(unwind.into_error()),
        };
        self.restore(record);
        self.continuation = None;
        if let Err(error) = &result {
            trace!("call failed: {error}");
        }
        result
    }

    pub fn call_value(&mut self, node: &Node) -> Result<Value, RuntimeError> {
        let record = self.record();
        let result = match node.eval_any(self) {
            Ok(value) => Ok(value),
            Err(Unwind::Return) => Ok(self.return_value),
            Err(unwind) => Err(unwind.into_error()),
        };
        self.restore(record);
        self.continuation = None;
        result
    }
}
