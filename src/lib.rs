//! SECD - a small Lisp compiled to bytecode for the SECD abstract machine
//!
//! This crate translates a minimal Scheme-like language into instructions for the
//! classic Stack-Environment-Code-Dump machine and executes them with an interpreter
//! that can be driven one instruction at a time.
//!
//! ```scheme
//! (- 10 (+ 2 (* 4 5)))                                   ; -12
//! (let ((x 1) (y 4)) (+ x y))                            ; 5
//! (letrec ((fact (lambda (n)
//!                  (if (= n 0) 1 (* n (fact (- n 1)))))))
//!   (fact 6))                                            ; 720
//! `(1 ,(+ 1 2) 3)                                        ; (1 3 3)
//! ```
//!
//! ## Pipeline
//!
//! Source text flows through the [`lexer`] into the recursive-descent [`compiler`],
//! which resolves every variable to a `(depth, offset)` pair using the [`scope`] chain
//! and emits a list of [`value::Value`]s. The [`machine`] takes that list as its
//! initial Code register and runs until Code is empty; the top of the Stack is the
//! result.
//!
//! ```
//! let code = secd::compile("(let ((x 1) (y 4)) (+ x y))").unwrap();
//! let mut machine = secd::machine::Machine::new(code);
//! let result = machine.run().unwrap();
//! assert_eq!(result, Some(secd::value::Value::from(5)));
//! ```
//!
//! ## Semantics worth knowing
//!
//! - Numbers are 64-bit integers; arithmetic overflow and division by zero are errors
//! - `#t` and `#f` compile to `1` and `0`; `0` and the empty list are false, anything else is true
//! - Binary operators compile their right operand first, so the left operand is on top
//!   of the Stack when the instruction runs
//! - `define` is only allowed at top level and binds into the global frame
//! - Strings are carried through unchanged and only ever printed
//!
//! ## Modules
//!
//! - `lexer`: tokens and the tokenizer
//! - `scope`: compile-time lexical frames
//! - `compiler`: source text to bytecode
//! - `value`: the shared code/data representation and opcodes
//! - `machine`: the SECD interpreter
//! - `session`: globals that persist across several compile-and-run rounds
//! - `trace`: optional step observers kept outside the evaluation core

use std::fmt;

/// Maximum nesting depth of expressions accepted by the compiler.
/// Bounds the recursion of the recursive-descent parser on hostile input.
pub const MAX_PARSE_DEPTH: usize = 64;

/// Maximum nesting depth of lists built at runtime by `CONS`.
/// List values are cloned, compared and dropped recursively.
pub const MAX_DATA_DEPTH: usize = 256;

/// Step budget used by [`run_source`] and the demo REPL so that a
/// non-terminating program cannot hang the caller.
pub const DEFAULT_STEP_LIMIT: usize = 1_000_000;

/// Byte range in the source text, half open.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Span {
    pub start: usize,
    pub end: usize,
}

impl Span {
    pub fn new(start: usize, end: usize) -> Self {
        Span { start, end }
    }
}

impl fmt::Display for Span {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}..{}", self.start, self.end)
    }
}

/// A character the tokenizer could not turn into a token.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum LexError {
    #[error("unrecognized character '{found}' at offset {offset}")]
    UnexpectedChar { found: char, offset: usize },
    #[error("unterminated string literal starting at offset {offset}")]
    UnterminatedString { offset: usize },
    #[error("invalid '#' literal at offset {offset} (expected #t or #f)")]
    InvalidHash { offset: usize },
    #[error("number literal '{text}' at offset {offset} does not fit in 64 bits")]
    NumberOverflow { text: String, offset: usize },
}

/// Categorizes the different kinds of syntax errors.
#[derive(Debug, PartialEq, Clone, Copy)]
pub enum SyntaxErrorKind {
    /// A token other than the one the grammar requires
    UnexpectedToken,
    /// Input ended before the expression was complete
    UnexpectedEof,
    /// Extra input after a complete program (e.g. a stray `)`)
    TrailingContent,
    /// Expression nesting exceeded [`MAX_PARSE_DEPTH`]
    TooDeeplyNested,
    /// Recognised syntax that this implementation deliberately does not support
    Unsupported,
    /// Well-formed tokens arranged into an ill-formed special form
    InvalidForm,
}

/// A structured error describing a token stream that does not match the grammar.
#[derive(Debug, PartialEq, Clone)]
pub struct SyntaxError {
    pub kind: SyntaxErrorKind,
    pub message: String,
    /// What the grammar required at this point, if a single token was required
    pub expected: Option<String>,
    /// The token actually encountered
    pub found: Option<String>,
    /// Context snippet from the input showing where the error occurred (max 100 chars)
    pub context: Option<String>,
}

impl SyntaxError {
    pub fn new(kind: SyntaxErrorKind, message: impl Into<String>) -> Self {
        SyntaxError {
            kind,
            message: message.into(),
            expected: None,
            found: None,
            context: None,
        }
    }

    pub fn expected(mut self, expected: impl Into<String>) -> Self {
        self.expected = Some(expected.into());
        self
    }

    pub fn found(mut self, found: impl Into<String>) -> Self {
        self.found = Some(found.into());
        self
    }

    /// Attach a snippet of `input` around `error_offset`
    pub fn with_context(mut self, input: &str, error_offset: usize) -> Self {
        const MAX_CONTEXT: usize = 100;

        let char_offset = input
            .char_indices()
            .take_while(|(byte, _)| *byte < error_offset)
            .count();
        let context_start = char_offset.saturating_sub(20);

        let context_str: String = input
            .chars()
            .skip(context_start)
            .take(MAX_CONTEXT)
            .collect();

        let mut display_context = String::new();
        if context_start > 0 {
            display_context.push_str("[...]");
        }
        display_context.push_str(&context_str);
        if context_start + context_str.chars().count() < input.chars().count() {
            display_context.push_str("[...]");
        }

        // Newlines would break single-line error output
        let display_context = display_context.replace('\n', "\\n").replace('\r', "");

        self.context = Some(display_context);
        self
    }
}

impl fmt::Display for SyntaxError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)?;
        if let Some(expected) = &self.expected {
            write!(f, "\nExpected: {expected}")?;
        }
        if let Some(found) = &self.found {
            write!(f, "\nFound: {found}")?;
        }
        if let Some(context) = &self.context {
            write!(f, "\nContext: {context}")?;
        }
        Ok(())
    }
}

/// Runtime failures of the SECD machine. All of them are fatal: the machine
/// must not be stepped again after returning one.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum InterpreterError {
    #[error("{opcode}: stack is empty")]
    EmptyStack { opcode: &'static str },
    #[error("{opcode}: code ended before its operand")]
    MissingOperand { opcode: &'static str },
    #[error("{opcode}: dump is empty")]
    EmptyDump { opcode: &'static str },
    #[error("{opcode}: expected a {expected} entry on the dump")]
    DumpMismatch {
        opcode: &'static str,
        expected: &'static str,
    },
    #[error("{opcode}: expected {expected}, found {found}")]
    TypeMismatch {
        opcode: &'static str,
        expected: &'static str,
        found: String,
    },
    #[error("expected an instruction, found {found}")]
    NotAnInstruction { found: String },
    #[error("{opcode}: no environment frame at depth {depth} (environment has {frames} frames)")]
    FrameOutOfRange {
        opcode: &'static str,
        depth: usize,
        frames: usize,
    },
    #[error("LD: no binding at offset {offset} of frame {depth} (frame has {len} values)")]
    OffsetOutOfRange {
        depth: usize,
        offset: usize,
        len: usize,
    },
    #[error("LD: unresolved variable reference ({depth}, {offset})")]
    UnresolvedVariable { depth: i64, offset: i64 },
    #[error("{opcode}: integer overflow")]
    Overflow { opcode: &'static str },
    #[error("DIV: division by zero")]
    DivisionByZero,
    #[error("{opcode}: list nested deeper than {limit} levels")]
    DataTooDeep { opcode: &'static str, limit: usize },
    #[error("step limit of {limit} exceeded")]
    StepLimitExceeded { limit: usize },
}

/// Error types for the compiler and interpreter
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum Error {
    #[error("LexError: {0}")]
    Lex(#[from] LexError),
    #[error("SyntaxError: {0}")]
    Syntax(SyntaxError),
    #[error("ScopeError: unbound variable '{name}'")]
    Scope { name: String },
    #[error("InterpreterError: {0}")]
    Interpreter(#[from] InterpreterError),
}

impl From<SyntaxError> for Error {
    fn from(err: SyntaxError) -> Self {
        Error::Syntax(err)
    }
}

pub type Result<T> = std::result::Result<T, Error>;

pub mod compiler;
pub mod lexer;
pub mod machine;
pub mod scope;
pub mod session;
pub mod trace;
pub mod value;

pub use compiler::{CompileConfig, Compiled, Compiler, compile};
pub use machine::Machine;
pub use value::{Atom, Opcode, Value};

/// Compile `source` and run it to completion under [`DEFAULT_STEP_LIMIT`].
///
/// Returns the top of the Stack, or `None` for programs that only contain
/// definitions.
pub fn run_source(source: &str) -> Result<Option<Value>> {
    let code = compile(source)?;
    Machine::new(code).run_with_limit(DEFAULT_STEP_LIMIT)
}
