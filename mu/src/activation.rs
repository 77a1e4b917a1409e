//! Call protocol node functions: blocks, method and interface dispatch,
//! activation, return and tail fusion. Each is generic over the
//! representation of the value it produces.
use log::trace;

use crate::{
    ArgumentBuffer, ClassInstance, Eval, FunctionObject, FunctionRole, Native, Node, NodeRef,
    Pointer, RuntimeError, StackRecord, Thread, Unwind,
};

fn sequence<T: Native>(node: &Node, thread: &mut Thread) -> Eval<T> {
    let args = node.args();
    let Some((last, rest)) = args.split_last() else {
        return Ok(T::zero());
    };
    if T::KIND == crate::RepKind::Void {
        for arg in args {
            arg.eval_any(thread)?;
        }
        return Ok(T::zero());
    }
    for arg in rest {
        arg.eval_any(thread)?;
    }
    last.eval::<T>(thread)
}

/// Block with its own frame; the frame size is the node's int data.
pub fn frame_block<T: Native>(node: &Node, thread: &mut Thread) -> Eval<T> {
    // SAFETY: frame blocks are built with int data
    let size = unsafe { node.data().int }.max(0) as usize;
    let record = thread.record();
    let result = thread
        .new_stack_frame(size)
        .map_err(Unwind::from)
        .and_then(|()| sequence::<T>(node, thread));
    // a fused call still reads its arguments from this frame; the
    // enclosing activation drops it once they are staged
    if !matches!(result, Err(Unwind::TailFuse)) {
        thread.restore(record);
    }
    result
}

pub fn simple_block<T: Native>(node: &Node, thread: &mut Thread) -> Eval<T> {
    sequence::<T>(node, thread)
}

/// Block that turns a pattern failure inside it into an error.
pub fn pattern_block<T: Native>(node: &Node, thread: &mut Thread) -> Eval<T> {
    let record = thread.record();
    match sequence::<T>(node, thread) {
        Err(Unwind::PatternFail) => {
            thread.restore(record);
            Err(RuntimeError::PatternFailed.into())
        }
        result => result,
    }
}

pub fn pattern_fail<T: Native>(_node: &Node, _thread: &mut Thread) -> Eval<T> {
    Err(Unwind::PatternFail)
}

fn receiver<'a>(node: &Node, thread: &mut Thread) -> Eval<(Pointer, &'a ClassInstance)> {
    let ptr = node.arg(0).eval::<Pointer>(thread)?;
    // SAFETY: receivers are class instances or nil
    let instance = unsafe { ClassInstance::from_pointer(ptr) }.ok_or(RuntimeError::nil())?;
    Ok((ptr, instance))
}

fn unresolved(name: &crate::Name) -> Unwind {
    RuntimeError::UnresolvedFunction {
        function: name.to_string(),
    }
    .into()
}

/// Virtual call: the node's symbol is the statically bound method, the
/// receiver's class supplies the override.
pub fn call_method<T: Native>(node: &Node, thread: &mut Thread) -> Eval<T> {
    let symbol = node.symbol()?;
    let FunctionRole::Method { slot } = *symbol.function()?.role() else {
        return Err(RuntimeError::SymbolMismatch {
            expected: "method",
            symbol: symbol.name().to_string(),
        }
        .into());
    };
    let (ptr, instance) = receiver(node, thread)?;
    let target = instance
        .ty()
        .and_then(|ty| ty.class())
        .and_then(|class| class.dynamic_lookup(slot))
        .ok_or_else(|| unresolved(symbol.name()))?;
    let func = target.function()?.func();
    trace!("call_method {} -> {}", symbol.name(), target.name());
    let buffer = ArgumentBuffer::with_receiver(thread, func, target, ptr, node);
    buffer.node().eval::<T>(thread)
}

pub fn invoke_interface<T: Native>(node: &Node, thread: &mut Thread) -> Eval<T> {
    let symbol = node.symbol()?;
    let FunctionRole::Interface { interface, index } = symbol.function()?.role() else {
        return Err(RuntimeError::SymbolMismatch {
            expected: "interface function",
            symbol: symbol.name().to_string(),
        }
        .into());
    };
    let (ptr, instance) = receiver(node, thread)?;
    let Some(class_type) = instance.ty() else {
        return Err(unresolved(symbol.name()));
    };
    let imp = class_type
        .class()
        .and_then(|class| class.implementation(interface))
        .ok_or_else(|| RuntimeError::BadInterfaceInvocation {
            class: class_type.name().to_string(),
            interface: interface.name().to_string(),
        })?;
    let target = imp.function(*index).cloned().ok_or_else(|| unresolved(symbol.name()))?;
    let func = target.function()?.func();
    let buffer = ArgumentBuffer::with_receiver(thread, func, target, ptr, node);
    buffer.node().eval::<T>(thread)
}

/// Calls through a function object; the remaining arguments are passed on
/// unevaluated.
pub fn dynamic_activation<T: Native>(node: &Node, thread: &mut Thread) -> Eval<T> {
    let object = node.arg(0).eval::<Pointer>(thread)?;
    // SAFETY: argument 0 is a function object or nil
    let function = unsafe { FunctionObject::from_pointer(object) }
        .and_then(FunctionObject::function)
        .ok_or(RuntimeError::nil())?
        .clone();
    let func = function.function()?.func();
    let args = node.args()[1..].to_vec();
    let buffer = ArgumentBuffer::new(thread, func, function, args);
    buffer.node().eval::<T>(thread)
}

pub fn function_return<T: Native>(node: &Node, thread: &mut Thread) -> Eval<T> {
    let value = match node.args().first() {
        Some(arg) => arg.eval::<T>(thread)?.into_value(),
        None => crate::Value::ZERO,
    };
    thread.set_return_value(value);
    Err(Unwind::Return)
}

/// Replaces the running activation with the call in argument 0.
pub fn function_tail_fuse<T: Native>(node: &Node, thread: &mut Thread) -> Eval<T> {
    thread.set_continuation(node.arg_ref(0).clone());
    Err(Unwind::TailFuse)
}

/// Evaluates the parameters into a fresh frame, runs the body and catches
/// its return. A tail fusion loops here with the new call instead of
/// nesting, so chains of tail calls run in constant host stack and
/// constant value stack.
pub fn function_activation<T: Native>(node: &Node, thread: &mut Thread) -> Eval<T> {
    let record = thread.record();
    thread.enter_activation();
    let result = activate::<T>(node, record, thread);
    thread.leave_activation();
    thread.restore(record);
    result
}

fn activate<T: Native>(node: &Node, record: StackRecord, thread: &mut Thread) -> Eval<T> {
    let mut continuation: Option<NodeRef> = None;
    loop {
        let call = continuation.as_deref().unwrap_or(node);
        let symbol = call.symbol()?;
        let function = symbol.function()?;
        if continuation.is_some() && !function.is_compiled() {
            // natives need no frame of their own
            return call.eval::<T>(thread);
        }

        // parameters see the caller's frame (or the frame being replaced)
        let size = function.stack_size();
        let staged = thread.reserve(size)?;
        for i in 0..size.min(call.num_args()) {
            let value = call.arg(i).eval_any(thread)?;
            thread.set_slot(staged + i, value)?;
        }
        if staged != record.top() {
            thread.slide_frame(staged, record.top(), size);
        }
        thread.set_stack_offset(record.top());

        let body = function
            .body()
            .ok_or_else(|| RuntimeError::UnimplementedMethod {
                function: symbol.name().to_string(),
            })?;
        match body.eval::<T>(thread) {
            Ok(value) => return Ok(value),
            // SAFETY: return nodes inside a body share its representation
            Err(Unwind::Return) => return Ok(unsafe { thread.return_value().get::<T>() }),
            Err(Unwind::TailFuse) => {
                let next = thread
                    .take_continuation()
                    .ok_or(RuntimeError::UncaughtJump { tag: "tail fuse" })?;
                continuation = Some(next);
            }
            Err(unwind) => return Err(unwind),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        Context, MachineCreateInfo, NodeFunc, RepKind, Slots, Symbol, SymbolRef, TypeRef, Value,
        test_thread,
    };
    use std::{ptr, sync::Arc};

    fn is_zero(node: &Node, thread: &mut Thread) -> Eval<bool> {
        Ok(node.arg(0).eval::<i32>(thread)? == 0)
    }

    fn add(node: &Node, thread: &mut Thread) -> Eval<i32> {
        let a = node.arg(0).eval::<i32>(thread)?;
        let b = node.arg(1).eval::<i32>(thread)?;
        Ok(a.wrapping_add(b))
    }

    fn mul(node: &Node, thread: &mut Thread) -> Eval<i32> {
        let a = node.arg(0).eval::<i32>(thread)?;
        let b = node.arg(1).eval::<i32>(thread)?;
        Ok(a.wrapping_mul(b))
    }

    fn choose(node: &Node, thread: &mut Thread) -> Eval<i32> {
        if node.arg(0).eval::<bool>(thread)? {
            node.arg(1).eval(thread)
        } else {
            node.arg(2).eval(thread)
        }
    }

    struct Fixture {
        context: Arc<Context>,
    }

    impl Fixture {
        fn new() -> Self {
            Self {
                context: Context::new(MachineCreateInfo::default()),
            }
        }

        fn slot(&self, kind: RepKind, slot: Slots) -> NodeFunc {
            self.context
                .machine()
                .rep(kind)
                .func(slot)
                .expect("documented slot")
        }

        fn local(&self, name: &str, address: usize) -> crate::NodeRef {
            let symbol = Symbol::stack_variable(self.context.names().intern(name), address);
            Node::new(self.slot(RepKind::Int, Slots::DEREFERENCE_STACK), Some(symbol), vec![])
        }

        fn call(&self, function: &SymbolRef, args: Vec<crate::NodeRef>) -> crate::NodeRef {
            let func = function.function().expect("function").func();
            Node::new(func, Some(function.clone()), args)
        }

        fn this_member(&self, class: &TypeRef, field: &str) -> crate::NodeRef {
            let (_, f) = class.class().and_then(|c| c.field(field)).expect("field");
            let member = Symbol::member_variable(self.context.names().intern(field), f.offset, 0);
            let this = Symbol::stack_variable(self.context.names().intern("this"), 0);
            let this = Node::new(self.slot(RepKind::Pointer, Slots::DEREFERENCE_STACK), Some(this), vec![]);
            Node::new(
                self.slot(f.ty.rep(), Slots::DEREFERENCE_CLASS_MEMBER),
                Some(member),
                vec![this],
            )
        }
    }

    #[test]
    fn tail_fusion_runs_in_constant_depth() {
        let fx = Fixture::new();
        let mut thread = test_thread(&fx.context);
        let count = fx.context.function("count", RepKind::Int, 2, FunctionRole::Free);

        let recur = fx.call(
            &count,
            vec![
                Node::new(NodeFunc::Int(add), None, vec![fx.local("n", 0), Node::constant(-1i32)]),
                Node::new(NodeFunc::Int(add), None, vec![fx.local("acc", 1), Node::constant(1i32)]),
            ],
        );
        let body = Node::new(
            NodeFunc::Int(choose),
            None,
            vec![
                Node::new(NodeFunc::Bool(is_zero), None, vec![fx.local("n", 0)]),
                fx.local("acc", 1),
                Node::new(fx.slot(RepKind::Int, Slots::FUNCTION_TAIL_FUSE), None, vec![recur]),
            ],
        );
        count.function().expect("function").set_body(body);

        let iterations = 1_000_000;
        let entry = fx.call(&count, vec![Node::constant(iterations), Node::constant(0i32)]);
        assert_eq!(thread.call::<i32>(&entry), Ok(iterations));
        assert_eq!(thread.max_activation_depth(), 1);
        assert_eq!(thread.stack_top(), 0);
        assert_eq!(thread.activation_depth(), 0);
    }

    #[test]
    fn returns_unwind_nested_activations() {
        let fx = Fixture::new();
        let mut thread = test_thread(&fx.context);
        let fact = fx.context.function("fact", RepKind::Int, 1, FunctionRole::Free);
        let base = Node::new(
            fx.slot(RepKind::Int, Slots::FUNCTION_RETURN),
            None,
            vec![Node::constant(1i32)],
        );
        let step = Node::new(
            NodeFunc::Int(mul),
            None,
            vec![
                fx.local("n", 0),
                fx.call(
                    &fact,
                    vec![Node::new(NodeFunc::Int(add), None, vec![fx.local("n", 0), Node::constant(-1i32)])],
                ),
            ],
        );
        let body = Node::new(
            NodeFunc::Int(choose),
            None,
            vec![Node::new(NodeFunc::Bool(is_zero), None, vec![fx.local("n", 0)]), base, step],
        );
        fact.function().expect("function").set_body(body);

        let entry = fx.call(&fact, vec![Node::constant(10i32)]);
        assert_eq!(thread.call::<i32>(&entry), Ok(3_628_800));
        assert_eq!(thread.max_activation_depth(), 11);
        assert_eq!(thread.stack_top(), 0);
    }

    #[test]
    fn missing_parameters_are_zero_and_missing_bodies_fail() {
        let fx = Fixture::new();
        let mut thread = test_thread(&fx.context);
        let second = fx.context.function("second", RepKind::Int, 2, FunctionRole::Free);
        second.function().expect("function").set_body(fx.local("b", 1));
        let entry = fx.call(&second, vec![Node::constant(5i32)]);
        assert_eq!(thread.call::<i32>(&entry), Ok(0));

        let empty = fx.context.function("empty", RepKind::Int, 0, FunctionRole::Free);
        let entry = fx.call(&empty, vec![]);
        assert_eq!(
            thread.call::<i32>(&entry),
            Err(RuntimeError::UnimplementedMethod {
                function: "empty".into()
            })
        );
        assert_eq!(thread.stack_top(), 0);
    }

    #[test]
    fn methods_dispatch_on_the_receiver() {
        let fx = Fixture::new();
        let mut thread = test_thread(&fx.context);
        let t = fx.context.types();
        let animal = fx.context.class_type("Animal", None, &[("legs", t.int.clone())]);
        let speak = fx.context.method(&animal, "Animal.speak", RepKind::Int, 1);
        speak.function().expect("function").set_body(Node::constant(1i32));

        let dog = fx.context.class_type("Dog", Some(animal.clone()), &[]);
        let bark = fx.context.override_method(&dog, &speak, "Dog.speak").expect("override");
        bark.function().expect("function").set_body(fx.this_member(&dog, "legs"));

        let rex = ClassInstance::allocate(fx.context.heap(), &dog);
        let instance = unsafe { ClassInstance::from_pointer(rex) }.expect("instance");
        instance.set_field(0, Value::new(4i32)).expect("legs");
        let generic = ClassInstance::allocate(fx.context.heap(), &animal);

        let site = |receiver: Pointer| {
            Node::new(
                fx.slot(RepKind::Int, Slots::CALL_METHOD),
                Some(speak.clone()),
                vec![Node::constant(receiver)],
            )
        };
        assert_eq!(thread.call::<i32>(&site(rex)), Ok(4));
        assert_eq!(thread.call::<i32>(&site(generic)), Ok(1));
        assert_eq!(thread.call::<i32>(&site(ptr::null_mut())), Err(RuntimeError::nil()));
        assert_eq!(thread.live_argument_buffers(), 0);
    }

    #[test]
    fn interfaces_resolve_through_the_class() {
        let fx = Fixture::new();
        let mut thread = test_thread(&fx.context);
        let t = fx.context.types();
        let shape = fx.context.interface_type("Shape", &["area"]);
        let area = fx.context.interface_function(&shape, 0, RepKind::Double);

        let square = fx.context.class_type("Square", None, &[("area", t.double.clone())]);
        let square_area = fx.context.function("Square.area", RepKind::Double, 1, FunctionRole::Free);
        square_area
            .function()
            .expect("function")
            .set_body(fx.this_member(&square, "area"));
        square.class().expect("class").implement(shape.clone(), vec![square_area]);
        let child = fx.context.class_type("SmallSquare", Some(square.clone()), &[]);
        let circle = fx.context.class_type("Circle", None, &[]);

        let s = ClassInstance::allocate(fx.context.heap(), &child);
        unsafe { ClassInstance::from_pointer(s) }
            .expect("instance")
            .set_field(0, Value::new(2.25f64))
            .expect("area");
        let c = ClassInstance::allocate(fx.context.heap(), &circle);

        let site = |receiver: Pointer| {
            Node::new(
                fx.slot(RepKind::Double, Slots::INVOKE_INTERFACE),
                Some(area.clone()),
                vec![Node::constant(receiver)],
            )
        };
        assert_eq!(thread.call::<f64>(&site(s)), Ok(2.25));
        assert_eq!(
            thread.call::<f64>(&site(c)),
            Err(RuntimeError::BadInterfaceInvocation {
                class: "Circle".into(),
                interface: "Shape".into()
            })
        );
        assert_eq!(thread.call::<f64>(&site(ptr::null_mut())), Err(RuntimeError::nil()));
    }

    #[test]
    fn dynamic_activation_passes_remaining_arguments() {
        let fx = Fixture::new();
        let mut thread = test_thread(&fx.context);
        let sum = fx.context.function("sum", RepKind::Int, 2, FunctionRole::Free);
        sum.function()
            .expect("function")
            .set_body(Node::new(NodeFunc::Int(add), None, vec![fx.local("a", 0), fx.local("b", 1)]));
        let closure = FunctionObject::allocate(fx.context.heap(), fx.context.types().function.clone(), Some(sum));
        let empty = FunctionObject::allocate(fx.context.heap(), fx.context.types().function.clone(), None);

        let site = |object: Pointer| {
            Node::new(
                fx.slot(RepKind::Int, Slots::DYNAMIC_ACTIVATION),
                None,
                vec![Node::constant(object), Node::constant(20i32), Node::constant(22i32)],
            )
        };
        assert_eq!(thread.call::<i32>(&site(closure)), Ok(42));
        assert_eq!(thread.call::<i32>(&site(empty)), Err(RuntimeError::nil()));
        assert_eq!(thread.call::<i32>(&site(ptr::null_mut())), Err(RuntimeError::nil()));
    }

    #[test]
    fn errors_release_argument_buffers() {
        let fx = Fixture::new();
        let mut thread = test_thread(&fx.context);
        let class = fx.context.class_type("Failing", None, &[]);
        let method = fx.context.method(&class, "Failing.run", RepKind::Int, 1);
        method
            .function()
            .expect("function")
            .set_body(Node::new(NodeFunc::Int(pattern_fail::<i32>), None, vec![]));
        let receiver = ClassInstance::allocate(fx.context.heap(), &class);
        let site = Node::new(
            fx.slot(RepKind::Int, Slots::CALL_METHOD),
            Some(method),
            vec![Node::constant(receiver)],
        );
        let guarded = Node::new(fx.slot(RepKind::Int, Slots::PATTERN_BLOCK), None, vec![site]);
        assert_eq!(thread.call::<i32>(&guarded), Err(RuntimeError::PatternFailed));
        assert_eq!(thread.live_argument_buffers(), 0);
        assert_eq!(thread.stack_top(), 0);
    }

    #[test]
    fn frame_blocks_restore_the_stack() {
        let fx = Fixture::new();
        let mut thread = test_thread(&fx.context);
        let block = Node::with_data(
            fx.slot(RepKind::Int, Slots::FRAME_BLOCK),
            None,
            vec![Node::constant(1i32), Node::constant(2i32)],
            Value::new(6i32),
        );
        assert_eq!(thread.call::<i32>(&block), Ok(2));
        assert_eq!(thread.stack_top(), 0);

        let void = Node::with_data(
            fx.slot(RepKind::Void, Slots::FRAME_BLOCK),
            None,
            vec![Node::constant(1.5f32), Node::constant(true)],
            Value::new(2i32),
        );
        assert_eq!(thread.call::<()>(&void), Ok(()));
        let simple = Node::new(fx.slot(RepKind::Bool, Slots::SIMPLE_BLOCK), None, vec![Node::constant(true)]);
        assert_eq!(thread.call::<bool>(&simple), Ok(true));
    }

    /// Writes argument 0 into the first slot of the current frame.
    fn store_first(node: &Node, thread: &mut Thread) -> Eval<i32> {
        let value = node.arg(0).eval::<i32>(thread)?;
        thread.set_slot(thread.stack_offset(), Value::new(value))?;
        Ok(value)
    }

    fn identity(fx: &Fixture) -> SymbolRef {
        let id = fx.context.function("id", RepKind::Int, 1, FunctionRole::Free);
        id.function().expect("function").set_body(fx.local("x", 0));
        id
    }

    #[test]
    fn tail_calls_from_frame_blocks_read_block_locals() {
        let fx = Fixture::new();
        let mut thread = test_thread(&fx.context);
        let id = identity(&fx);
        let fuse = |call: crate::NodeRef| {
            Node::new(fx.slot(RepKind::Int, Slots::FUNCTION_TAIL_FUSE), None, vec![call])
        };
        let block = |args: Vec<crate::NodeRef>| {
            Node::with_data(fx.slot(RepKind::Int, Slots::FRAME_BLOCK), None, args, Value::new(1i32))
        };

        // the block local shadows the parameter slot and starts zeroed
        let fresh = fx.context.function("fresh", RepKind::Int, 1, FunctionRole::Free);
        fresh
            .function()
            .expect("function")
            .set_body(block(vec![fuse(fx.call(&id, vec![fx.local("t", 0)]))]));
        assert_eq!(thread.call::<i32>(&fx.call(&fresh, vec![Node::constant(7i32)])), Ok(0));
        assert_eq!(thread.stack_top(), 0);

        let stored = fx.context.function("stored", RepKind::Int, 1, FunctionRole::Free);
        stored.function().expect("function").set_body(block(vec![
            Node::new(NodeFunc::Int(store_first), None, vec![Node::constant(5i32)]),
            fuse(fx.call(&id, vec![fx.local("t", 0)])),
        ]));
        assert_eq!(thread.call::<i32>(&fx.call(&stored, vec![Node::constant(7i32)])), Ok(5));
        assert_eq!(thread.max_activation_depth(), 1);
        assert_eq!(thread.stack_top(), 0);

        let native = Symbol::native_function(fx.context.names().intern("add"), NodeFunc::Int(add), 2);
        let into_native = fx.context.function("into_native", RepKind::Int, 1, FunctionRole::Free);
        into_native.function().expect("function").set_body(block(vec![
            Node::new(NodeFunc::Int(store_first), None, vec![Node::constant(5i32)]),
            fuse(Node::new(NodeFunc::Int(add), Some(native), vec![fx.local("t", 0), Node::constant(1i32)])),
        ]));
        assert_eq!(thread.call::<i32>(&fx.call(&into_native, vec![Node::constant(7i32)])), Ok(6));
        assert_eq!(thread.stack_top(), 0);
    }

    #[test]
    fn tail_calls_from_pattern_blocks_stay_fused() {
        let fx = Fixture::new();
        let mut thread = test_thread(&fx.context);
        let count = fx.context.function("count", RepKind::Int, 2, FunctionRole::Free);
        let recur = fx.call(
            &count,
            vec![
                Node::new(NodeFunc::Int(add), None, vec![fx.local("n", 0), Node::constant(-1i32)]),
                Node::new(NodeFunc::Int(add), None, vec![fx.local("acc", 1), Node::constant(1i32)]),
            ],
        );
        let step = Node::new(
            NodeFunc::Int(choose),
            None,
            vec![
                Node::new(NodeFunc::Bool(is_zero), None, vec![fx.local("n", 0)]),
                fx.local("acc", 1),
                Node::new(fx.slot(RepKind::Int, Slots::FUNCTION_TAIL_FUSE), None, vec![recur]),
            ],
        );
        count
            .function()
            .expect("function")
            .set_body(Node::new(fx.slot(RepKind::Int, Slots::PATTERN_BLOCK), None, vec![step]));

        let entry = fx.call(&count, vec![Node::constant(10_000i32), Node::constant(0i32)]);
        assert_eq!(thread.call::<i32>(&entry), Ok(10_000));
        assert_eq!(thread.max_activation_depth(), 1);
        assert_eq!(thread.stack_top(), 0);
        assert_eq!(thread.stack_offset(), 0);
    }

    #[test]
    fn nil_receivers_fail_on_every_representation() {
        let fx = Fixture::new();
        let mut thread = test_thread(&fx.context);
        let class = fx.context.class_type("Any", None, &[]);
        let shape = fx.context.interface_type("Thing", &["f"]);
        let nil = || Node::constant::<Pointer>(ptr::null_mut());
        for kind in RepKind::ALL {
            let method = fx.context.method(&class, "Any.m", kind, 1);
            let iface = fx.context.interface_function(&shape, 0, kind);
            let member = Symbol::member_variable(fx.context.names().intern("m"), 0, 0);
            let mut sites = vec![
                Node::new(fx.slot(kind, Slots::CALL_METHOD), Some(method), vec![nil()]),
                Node::new(fx.slot(kind, Slots::INVOKE_INTERFACE), Some(iface), vec![nil()]),
                Node::new(fx.slot(kind, Slots::DYNAMIC_ACTIVATION), None, vec![nil()]),
                Node::new(fx.slot(kind, Slots::UNPACK_VARIANT), None, vec![nil()]),
                Node::new(fx.slot(kind, Slots::REFERENCE_CLASS_MEMBER), Some(member.clone()), vec![nil()]),
            ];
            if kind != RepKind::Void {
                sites.push(Node::new(
                    fx.slot(kind, Slots::DEREFERENCE_CLASS_MEMBER),
                    Some(member),
                    vec![nil()],
                ));
            }
            for site in sites {
                assert_eq!(
                    thread.call_value(&site).map(|_| ()),
                    Err(RuntimeError::nil()),
                    "{:?} {:?}",
                    kind,
                    site
                );
            }
        }
        assert_eq!(thread.live_argument_buffers(), 0);
    }

    #[test]
    fn unresolved_slots_fail_fast() {
        let fx = Fixture::new();
        let mut thread = test_thread(&fx.context);
        let base = fx.context.class_type("Base", None, &[]);
        let other = fx.context.class_type("Other", None, &[]);
        let method = fx.context.method(&base, "Base.m", RepKind::Int, 1);
        let receiver = ClassInstance::allocate(fx.context.heap(), &other);
        let site = Node::new(
            fx.slot(RepKind::Int, Slots::CALL_METHOD),
            Some(method),
            vec![Node::constant(receiver)],
        );
        assert_eq!(
            thread.call::<i32>(&site),
            Err(RuntimeError::UnresolvedFunction {
                function: "Base.m".into()
            })
        );
    }

    #[test]
    fn tail_fusion_into_natives_runs_them_in_place() {
        let fx = Fixture::new();
        let mut thread = test_thread(&fx.context);
        let native = Symbol::native_function(fx.context.names().intern("add"), NodeFunc::Int(add), 2);
        let wrapper = fx.context.function("wrapper", RepKind::Int, 1, FunctionRole::Free);
        let fused = Node::new(
            fx.slot(RepKind::Int, Slots::FUNCTION_TAIL_FUSE),
            None,
            vec![Node::new(NodeFunc::Int(add), Some(native), vec![fx.local("x", 0), Node::constant(1i32)])],
        );
        wrapper.function().expect("function").set_body(fused);
        let entry = fx.call(&wrapper, vec![Node::constant(41i32)]);
        assert_eq!(thread.call::<i32>(&entry), Ok(42));
    }
}
