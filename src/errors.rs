//! Per-phase typed error enums, unified by `TalonError` at the CLI boundary.
//!
//! Grounded on the teacher's own `errors.rs` span-carrying `LexerError`/
//! `ParserError` pair, generalized to cover every phase named in §7 of
//! SPEC_FULL.md with one `thiserror`-derived enum apiece.

use thiserror::Error;

/// A byte-range position in a single source unit, carried by every
/// phase-local error that can be attributed to source text.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Default)]
pub struct Span {
    pub start: usize,
    pub end: usize,
}

impl Span {
    pub fn new(start: usize, end: usize) -> Span {
        Span { start, end }
    }

    pub fn merge(self, other: Span) -> Span {
        Span { start: self.start.min(other.start), end: self.end.max(other.end) }
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum LexError {
    #[error("unexpected character {ch:?} at {span:?}")]
    UnexpectedChar { ch: char, span: Span },
    #[error("unterminated string literal starting at {span:?}")]
    UnterminatedString { span: Span },
    #[error("malformed number literal {text:?} at {span:?}")]
    MalformedNumber { text: String, span: Span },
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ParseError {
    #[error("unexpected token {found:?}, expected {expected} at {span:?}")]
    UnexpectedToken { found: String, expected: &'static str, span: Span },
    #[error("unexpected end of input, expected {expected}")]
    UnexpectedEof { expected: &'static str },
    #[error(transparent)]
    Lex(#[from] LexError),
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CompileError {
    #[error("undeclared identifier {name:?} at {span:?}")]
    UndeclaredIdentifier { name: String, span: Span },
    #[error("assignment to immutable binding {name:?} at {span:?}")]
    AssignToImmutable { name: String, span: Span },
    #[error("duplicate argument name {name:?} at {span:?}")]
    DuplicateArgument { name: String, span: Span },
    #[error("block expects {expected} argument(s), got {actual} at {span:?}")]
    BlockArityMismatch { expected: usize, actual: usize, span: Span },
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum InterpError {
    #[error("heap exhausted")]
    OutOfMemory,
    #[error("{receiver_class} does not understand #{selector}")]
    DoesNotUnderstand { receiver_class: String, selector: String },
    #[error("non-boolean receiver used as a conditional")]
    MustBeBoolean,
    #[error("non-local return to a frame that has already returned")]
    NonLocalReturnToDeadFrame,
    #[error("stack underflow in frame at pc {pc}")]
    StackUnderflow { pc: usize },
    #[error("malformed bytecode at pc {pc}: {detail}")]
    MalformedBytecode { pc: usize, detail: String },
    #[error("index {index} out of bounds (size {size})")]
    IndexOutOfBounds { index: i64, size: usize },
}

#[derive(Error, Debug)]
pub enum TalonError {
    #[error(transparent)]
    Lex(#[from] LexError),
    #[error(transparent)]
    Parse(#[from] ParseError),
    #[error(transparent)]
    Compile(#[from] CompileError),
    #[error(transparent)]
    Interp(#[from] InterpError),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("config error: {0}")]
    Config(String),
}
