use clap::{Parser as ClapParser, Subcommand};
use log::{debug, info};
use std::process;

use mu::{
    Context, DynamicArray, Eval, FormatArg, FunctionRole, MachineCreateInfo, Node, NodeFunc,
    NodeRef, Process, ProcessCreateInfo, RepKind, RuntimeError, Slots, Symbol, Thread,
    ThreadCreateInfo, Value, format, strings,
};

#[derive(ClapParser, Debug)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Value stack capacity of the evaluating thread, in slots
    #[arg(long, default_value_t = 64 * 1024)]
    stack_size: usize,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Apply the string % operator; integers, decimals and text are
    /// passed as int, double and string arguments
    Format { fmt: String, args: Vec<String> },
    /// Count down through a chain of tail calls
    Count {
        #[arg(long, default_value_t = 1_000_000)]
        iterations: i32,
    },
    /// Split text by a delimiter and print the pieces
    Split {
        text: String,
        delimiter: String,
        /// Treat the delimiter as one sequence instead of a character set
        #[arg(long)]
        sequence: bool,
    },
    /// List the machine representations
    Reps,
}

fn main() {
    env_logger::init();
    let cli = Cli::parse();

    let context = Context::new(MachineCreateInfo::default());
    let process = Process::new(context.clone(), &ProcessCreateInfo::default());
    let mut thread = Thread::new(
        process,
        &ThreadCreateInfo {
            stack_size: cli.stack_size,
        },
    );

    let result = match cli.command {
        Command::Format { fmt, args } => run_format(&context, &mut thread, &fmt, &args),
        Command::Count { iterations } => run_count(&context, &mut thread, iterations),
        Command::Split {
            text,
            delimiter,
            sequence,
        } => run_split(&mut thread, &text, &delimiter, sequence),
        Command::Reps => {
            for rep in context.machine().reps().iter() {
                println!(
                    "{:<10} {:>3} size={:<3} align={}/{} slots={:?}",
                    rep.name(),
                    rep.fmt_name(),
                    rep.size(),
                    rep.struct_alignment(),
                    rep.natural_alignment(),
                    rep.slots()
                );
            }
            Ok(())
        }
    };

    if let Err(err) = result {
        eprintln!("Error: {}", err);
        process::exit(1);
    }
}

fn run_format(
    context: &Context,
    thread: &mut Thread,
    fmt: &str,
    args: &[String],
) -> Result<(), RuntimeError> {
    let types = context.types();
    let args: Vec<FormatArg> = args
        .iter()
        .map(|arg| {
            if let Ok(i) = arg.parse::<i32>() {
                FormatArg::new(&types.int, Value::new(i))
            } else if let Ok(d) = arg.parse::<f64>() {
                FormatArg::new(&types.double, Value::new(d))
            } else {
                FormatArg::new(&types.string, Value::new(strings::allocate(thread, arg)))
            }
        })
        .collect();
    let fmt = strings::allocate(thread, fmt);
    let result = format::format(thread, fmt, &args)?;
    strings::print(result);
    println!();
    Ok(())
}

fn is_zero(node: &Node, thread: &mut Thread) -> Eval<bool> {
    Ok(node.arg(0).eval::<i32>(thread)? == 0)
}

fn decrement(node: &Node, thread: &mut Thread) -> Eval<i32> {
    Ok(node.arg(0).eval::<i32>(thread)?.wrapping_sub(1))
}

fn select(node: &Node, thread: &mut Thread) -> Eval<i32> {
    if node.arg(0).eval::<bool>(thread)? {
        node.arg(1).eval(thread)
    } else {
        node.arg(2).eval(thread)
    }
}

/// `count(n) = n == 0 ? 0 : count(n - 1)` with the recursion in tail
/// position.
fn run_count(context: &Context, thread: &mut Thread, iterations: i32) -> Result<(), RuntimeError> {
    let int = context.machine().rep(RepKind::Int);
    let local = int.func(Slots::DEREFERENCE_STACK).ok_or(RuntimeError::nil())?;
    let n = || -> NodeRef {
        Node::new(
            local,
            Some(Symbol::stack_variable(context.names().intern("n"), 0)),
            vec![],
        )
    };

    let count = context.function("count", RepKind::Int, 1, FunctionRole::Free);
    let activation = count.function()?.func();
    let recur = Node::new(
        activation,
        Some(count.clone()),
        vec![Node::new(NodeFunc::Int(decrement), None, vec![n()])],
    );
    let body = Node::new(
        NodeFunc::Int(select),
        None,
        vec![
            Node::new(NodeFunc::Bool(is_zero), None, vec![n()]),
            n(),
            Node::new(int.function_tail_fuse_func(), None, vec![recur]),
        ],
    );
    count.function()?.set_body(body);

    let entry = Node::new(activation, Some(count), vec![Node::constant(iterations)]);
    let result = thread.call::<i32>(&entry)?;
    info!(
        "count({}) = {} at activation depth {}",
        iterations,
        result,
        thread.max_activation_depth()
    );
    println!("{}", result);
    Ok(())
}

fn run_split(
    thread: &mut Thread,
    text: &str,
    delimiter: &str,
    sequence: bool,
) -> Result<(), RuntimeError> {
    let text = strings::allocate(thread, text);
    let delimiter = strings::allocate(thread, delimiter);
    let pieces = strings::split(thread, text, delimiter, sequence)?;
    // SAFETY: split returns a live string array
    let count = unsafe { DynamicArray::from_pointer(pieces) }.map_or(0, |a| a.len());
    debug!("split into {} pieces", count);
    let separator = strings::allocate(thread, "\n");
    strings::print(strings::join(thread, pieces, separator)?);
    println!();
    Ok(())
}
