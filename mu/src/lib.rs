//! Runtime core of the Mu language: machine representations dispatching
//! evaluation nodes over a per-thread value stack, plus the string library.
mod value;
mod error;
mod heap;
mod interning;
mod types;
mod objects;
mod symbol;
mod node;
mod thread;
mod context;
pub mod machine;
pub mod activation;
pub mod strings;
pub mod format;

pub use value::{
    FloatVector, Native, Pointer, Value, Vector2f, Vector3f, Vector4f, half_to_float,
};
pub use error::{Eval, RuntimeError, Unwind};
pub use heap::{Heap, HeapCreateInfo, HeapObject, HeapStats};
pub use interning::{Name, NameId, NamePool};
pub use types::{
    ClassType, Field, InterfaceImp, InterfaceType, Type, TypeKind, TypeRef, VariantTagType,
    output_quoted_string,
};
pub use objects::{ClassInstance, DynamicArray, FunctionObject, Object, VariantInstance};
pub use symbol::{Function, FunctionRole, Symbol, SymbolKind, SymbolRef};
pub use node::{ArgumentBuffer, Node, NodeFn, NodeFunc, NodeRef};
pub use thread::{Process, ProcessCreateInfo, StackRecord, Thread, ThreadCreateInfo};
pub use context::{Context, StandardTypes};
pub use machine::{Machine, MachineCreateInfo, MachineRep, MachineReps, RepKind, Slots};
pub use strings::{NativeDesc, StringObject};
pub use format::FormatArg;

/// Fresh process and thread over `context` with default sizes.
#[cfg(test)]
pub(crate) fn test_thread(context: &std::sync::Arc<Context>) -> Thread {
    let process = Process::new(context.clone(), &ProcessCreateInfo::default());
    Thread::new(process, &ThreadCreateInfo::default())
}
