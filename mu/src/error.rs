use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RuntimeError {
    #[error("nil argument{detail}")]
    NilArgument { detail: &'static str },
    #[error("index {index} out of range for length {length}")]
    OutOfRange { index: i64, length: usize },
    #[error("bad interface invocation: {class} does not implement {interface}")]
    BadInterfaceInvocation { class: String, interface: String },
    #[error("unimplemented method {function}")]
    UnimplementedMethod { function: String },
    #[error("unresolved function {function}")]
    UnresolvedFunction { function: String },
    #[error("nil node func in {function}")]
    NilNodeFunc { function: String },
    #[error(
        "bad argument type: argument {argument} of format operator (%) has type {type_name} \
         which is incompatible with format %{conversion}"
    )]
    BadArgumentType {
        argument: usize,
        conversion: char,
        type_name: String,
    },
    #[error("pattern failed")]
    PatternFailed,
    #[error("stack overflow: {requested} slots requested with {available} available")]
    StackOverflow { requested: usize, available: usize },
    #[error("symbol {symbol} is not a {expected}")]
    SymbolMismatch {
        expected: &'static str,
        symbol: String,
    },
    #[error("uncaught {tag} jump")]
    UncaughtJump { tag: &'static str },
    #[error("bad format string: {0}")]
    BadFormatString(String),
}

impl RuntimeError {
    pub const fn nil() -> Self {
        Self::NilArgument { detail: "" }
    }
}

/// Everything that can leave a node function early. The three jump tags
/// travel alongside ordinary errors; the thread holds their payload
/// (return value, continuation).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Unwind {
    Return,
    TailFuse,
    PatternFail,
    Error(RuntimeError),
}

impl Unwind {
    pub fn into_error(self) -> RuntimeError {
        match self {
            Unwind::Error(error) => error,
            Unwind::PatternFail => RuntimeError::PatternFailed,
            Unwind::Return => RuntimeError::UncaughtJump { tag: "return" },
            Unwind::TailFuse => RuntimeError::UncaughtJump { tag: "tail fuse" },
        }
    }
}

impl From<RuntimeError> for Unwind {
    fn from(error: RuntimeError) -> Self {
        Unwind::Error(error)
    }
}

pub type Eval<T> = Result<T, Unwind>;
