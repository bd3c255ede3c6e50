//! This module defines the bytecode value model shared by compiled code and runtime
//! data. A [`Value`] is either an [`Atom`] (number, string, symbol or instruction
//! opcode), a [`Value::List`] (used for cons data, code blocks and quoted literals) or a
//! [`Closure`] produced by `LDF`. The same type fills all four machine registers, so a
//! code block is simply a list whose elements are opcode atoms interleaved with their
//! operands.
//!
//! Environments are lists of [`Frame`]s. Frames are the only shared, mutable part of
//! the model: `RAP` fills a frame that closures have already captured and `DEFUN`
//! appends to the global frame, and both updates must be visible through those
//! closures.
//!
//! Ergonomic helpers [`val`], [`sym`], [`nil`] and [`op`] build values in code and
//! tests; `From` conversions cover Rust integers, booleans (as `1`/`0`), string slices,
//! arrays and vectors.

use crate::Span;
use std::cell::RefCell;
use std::fmt;
use std::rc::Rc;

/// Type alias for number values on the machine
pub type NumberType = i64;

/// SECD instruction set
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Opcode {
    Nil,
    Ld,
    Ldc,
    Ldf,
    Ap,
    Rap,
    Rtn,
    Dum,
    Sel,
    Join,
    Cons,
    Car,
    Cdr,
    Consp,
    Pop,
    Add,
    Sub,
    Mul,
    Div,
    Eq,
    Ne,
    Lt,
    Le,
    /// `>`
    Ht,
    /// `>=`
    He,
    Or,
    And,
    Defun,
}

impl Opcode {
    pub const ALL: [Opcode; 28] = [
        Opcode::Nil,
        Opcode::Ld,
        Opcode::Ldc,
        Opcode::Ldf,
        Opcode::Ap,
        Opcode::Rap,
        Opcode::Rtn,
        Opcode::Dum,
        Opcode::Sel,
        Opcode::Join,
        Opcode::Cons,
        Opcode::Car,
        Opcode::Cdr,
        Opcode::Consp,
        Opcode::Pop,
        Opcode::Add,
        Opcode::Sub,
        Opcode::Mul,
        Opcode::Div,
        Opcode::Eq,
        Opcode::Ne,
        Opcode::Lt,
        Opcode::Le,
        Opcode::Ht,
        Opcode::He,
        Opcode::Or,
        Opcode::And,
        Opcode::Defun,
    ];

    pub fn mnemonic(self) -> &'static str {
        match self {
            Opcode::Nil => "NIL",
            Opcode::Ld => "LD",
            Opcode::Ldc => "LDC",
            Opcode::Ldf => "LDF",
            Opcode::Ap => "AP",
            Opcode::Rap => "RAP",
            Opcode::Rtn => "RTN",
            Opcode::Dum => "DUM",
            Opcode::Sel => "SEL",
            Opcode::Join => "JOIN",
            Opcode::Cons => "CONS",
            Opcode::Car => "CAR",
            Opcode::Cdr => "CDR",
            Opcode::Consp => "CONSP",
            Opcode::Pop => "POP",
            Opcode::Add => "ADD",
            Opcode::Sub => "SUB",
            Opcode::Mul => "MUL",
            Opcode::Div => "DIV",
            Opcode::Eq => "EQ",
            Opcode::Ne => "NE",
            Opcode::Lt => "LT",
            Opcode::Le => "LE",
            Opcode::Ht => "HT",
            Opcode::He => "HE",
            Opcode::Or => "OR",
            Opcode::And => "AND",
            Opcode::Defun => "DEFUN",
        }
    }

    pub fn from_mnemonic(name: &str) -> Option<Opcode> {
        Opcode::ALL.into_iter().find(|op| op.mnemonic() == name)
    }

    /// Number of inline operands that follow the opcode in a code block
    pub fn operand_count(self) -> usize {
        match self {
            Opcode::Ld | Opcode::Sel => 2,
            Opcode::Ldc | Opcode::Ldf => 1,
            _ => 0,
        }
    }
}

impl fmt::Display for Opcode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.mnemonic())
    }
}

/// Atomic payloads
#[derive(Clone)]
pub enum Atom {
    Number(NumberType),
    /// String literals, carried through unchanged
    String(String),
    /// Quoted identifiers
    Symbol(String),
    /// An instruction. `origin` points back at the syntax that produced it and
    /// takes no part in equality.
    Op { code: Opcode, origin: Option<Span> },
}

impl PartialEq for Atom {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Atom::Number(a), Atom::Number(b)) => a == b,
            (Atom::String(a), Atom::String(b)) => a == b,
            (Atom::Symbol(a), Atom::Symbol(b)) => a == b,
            (Atom::Op { code: a, .. }, Atom::Op { code: b, .. }) => a == b,
            _ => false,
        }
    }
}

impl fmt::Debug for Atom {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Atom::Number(n) => write!(f, "Number({n})"),
            Atom::String(s) => write!(f, "String(\"{s}\")"),
            Atom::Symbol(s) => write!(f, "Symbol({s})"),
            Atom::Op { code, .. } => write!(f, "{code}"),
        }
    }
}

/// One environment frame: the runtime values of one lexical scope, indexed by offset.
#[derive(Clone, Default)]
pub struct Frame(Rc<RefCell<Vec<Value>>>);

impl Frame {
    pub fn new(values: Vec<Value>) -> Self {
        Frame(Rc::new(RefCell::new(values)))
    }

    pub fn len(&self) -> usize {
        self.0.borrow().len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.borrow().is_empty()
    }

    pub fn get(&self, offset: usize) -> Option<Value> {
        self.0.borrow().get(offset).cloned()
    }

    pub fn push(&self, value: Value) {
        self.0.borrow_mut().push(value);
    }

    /// Replace the contents in place; every environment sharing this frame sees the change
    pub fn fill(&self, values: Vec<Value>) {
        *self.0.borrow_mut() = values;
    }

    pub fn truncate(&self, len: usize) {
        self.0.borrow_mut().truncate(len);
    }

    /// Copy of the current contents
    pub fn values(&self) -> Vec<Value> {
        self.0.borrow().clone()
    }

    pub fn ptr_eq(&self, other: &Frame) -> bool {
        Rc::ptr_eq(&self.0, &other.0)
    }
}

impl fmt::Debug for Frame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list().entries(self.0.borrow().iter()).finish()
    }
}

/// The Environment register: frames ordered outermost first, innermost last.
#[derive(Clone, Default)]
pub struct Environment {
    frames: Vec<Frame>,
}

impl Environment {
    /// An environment with no frames at all
    pub fn new() -> Self {
        Environment { frames: Vec::new() }
    }

    /// An environment holding a single empty global frame
    pub fn global() -> Self {
        Environment::from_frames(vec![Frame::default()])
    }

    pub fn from_frames(frames: Vec<Frame>) -> Self {
        Environment { frames }
    }

    pub fn frames(&self) -> &[Frame] {
        &self.frames
    }

    /// Number of frames
    pub fn depth(&self) -> usize {
        self.frames.len()
    }

    /// Frame reached by walking `depth` frames outward from the innermost one
    pub fn frame(&self, depth: usize) -> Option<&Frame> {
        let index = self.frames.len().checked_sub(depth + 1)?;
        self.frames.get(index)
    }

    pub fn global_frame(&self) -> Option<&Frame> {
        self.frames.first()
    }

    pub fn innermost(&self) -> Option<&Frame> {
        self.frames.last()
    }

    pub fn push_frame(&mut self, frame: Frame) {
        self.frames.push(frame);
    }

    pub fn pop_frame(&mut self) -> Option<Frame> {
        self.frames.pop()
    }

    /// Same frames, compared by identity
    pub fn shares_frames_with(&self, other: &Environment) -> bool {
        self.frames.len() == other.frames.len()
            && self
                .frames
                .iter()
                .zip(&other.frames)
                .all(|(a, b)| a.ptr_eq(b))
    }
}

impl fmt::Debug for Environment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list().entries(&self.frames).finish()
    }
}

/// A code block paired with the environment that was current when `LDF` ran.
#[derive(Clone)]
pub struct Closure {
    pub code: Rc<[Value]>,
    pub env: Environment,
}

/// Core value type of the machine
///
/// To build values, use the helper functions:
/// - `val(42)` for numbers, `val(true)` for `1`, `val("text")` for strings
/// - `sym("name")` for symbols, `nil()` for the empty list, `op(Opcode::Add)` for instructions
/// - `val([1, 2, 3])` for homogeneous lists, `val(vec![op(Opcode::Ldc), val(1)])` for mixed ones
#[derive(Clone)]
pub enum Value {
    Atom(Atom),
    List(Vec<Value>),
    Closure(Closure),
}

impl Value {
    pub fn number(n: NumberType) -> Value {
        Value::Atom(Atom::Number(n))
    }

    pub fn opcode(code: Opcode, origin: Option<Span>) -> Value {
        Value::Atom(Atom::Op { code, origin })
    }

    pub fn as_number(&self) -> Option<NumberType> {
        match self {
            Value::Atom(Atom::Number(n)) => Some(*n),
            _ => None,
        }
    }

    pub fn as_opcode(&self) -> Option<Opcode> {
        match self {
            Value::Atom(Atom::Op { code, .. }) => Some(*code),
            _ => None,
        }
    }

    pub fn as_list(&self) -> Option<&[Value]> {
        match self {
            Value::List(items) => Some(items),
            _ => None,
        }
    }

    /// Check if a value represents nil (empty list)
    pub fn is_nil(&self) -> bool {
        matches!(self, Value::List(items) if items.is_empty())
    }

    /// `0` and the empty list are false; every other value is true
    pub fn is_truthy(&self) -> bool {
        match self {
            Value::Atom(Atom::Number(n)) => *n != 0,
            Value::List(items) => !items.is_empty(),
            Value::Atom(_) | Value::Closure(_) => true,
        }
    }

    /// List nesting depth: 0 for atoms and closures, 1 for a flat list.
    /// Walks the value without recursing.
    pub fn depth(&self) -> usize {
        let mut deepest = 0;
        let mut pending = vec![(self, 0usize)];
        while let Some((value, level)) = pending.pop() {
            if let Value::List(items) = value {
                deepest = deepest.max(level + 1);
                pending.extend(items.iter().map(|item| (item, level + 1)));
            }
        }
        deepest
    }

    /// Short description of the variant, used in error messages
    pub fn type_name(&self) -> &'static str {
        match self {
            Value::Atom(Atom::Number(_)) => "number",
            Value::Atom(Atom::String(_)) => "string",
            Value::Atom(Atom::Symbol(_)) => "symbol",
            Value::Atom(Atom::Op { .. }) => "instruction",
            Value::List(items) if items.is_empty() => "empty list",
            Value::List(_) => "list",
            Value::Closure(_) => "closure",
        }
    }
}

impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Value::Atom(a), Value::Atom(b)) => a == b,
            (Value::List(a), Value::List(b)) => a == b,
            // Environments compare by frame identity; frames may contain the closure itself
            (Value::Closure(a), Value::Closure(b)) => {
                a.code == b.code && a.env.shares_frames_with(&b.env)
            }
            _ => false,
        }
    }
}

impl fmt::Debug for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Atom(atom) => write!(f, "{atom:?}"),
            Value::List(list) => {
                write!(f, "List(")?;
                for (i, v) in list.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{v:?}")?;
                }
                write!(f, ")")
            }
            Value::Closure(closure) => write!(
                f,
                "Closure(code={:?}, frames={})",
                Value::List(closure.code.to_vec()),
                closure.env.depth()
            ),
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Atom(Atom::Number(n)) => write!(f, "{n}"),
            Value::Atom(Atom::String(s)) => write!(f, "\"{s}\""),
            Value::Atom(Atom::Symbol(s)) => write!(f, "{s}"),
            Value::Atom(Atom::Op { code, .. }) => write!(f, "{code}"),
            Value::List(elements) => {
                write!(f, "(")?;
                for (i, elem) in elements.iter().enumerate() {
                    if i > 0 {
                        write!(f, " ")?;
                    }
                    write!(f, "{elem}")?;
                }
                write!(f, ")")
            }
            Value::Closure(_) => write!(f, "#<closure>"),
        }
    }
}

impl From<Atom> for Value {
    fn from(atom: Atom) -> Self {
        Value::Atom(atom)
    }
}

impl From<Opcode> for Value {
    fn from(code: Opcode) -> Self {
        Value::opcode(code, None)
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::Atom(Atom::String(s.to_owned()))
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Value::Atom(Atom::String(s))
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Value::number(NumberType::from(b))
    }
}

macro_rules! impl_from_integer {
    ($int_type:ty) => {
        impl From<$int_type> for Value {
            fn from(n: $int_type) -> Self {
                Value::number(NumberType::from(n))
            }
        }
    };
}

impl_from_integer!(i8);
impl_from_integer!(i16);
impl_from_integer!(i32);
impl_from_integer!(NumberType);
impl_from_integer!(u8);
impl_from_integer!(u16);
impl_from_integer!(u32);

impl<T: Into<Value>> From<Vec<T>> for Value {
    fn from(v: Vec<T>) -> Self {
        Value::List(v.into_iter().map(Into::into).collect())
    }
}

impl<T: Into<Value>, const N: usize> From<[T; N]> for Value {
    fn from(arr: [T; N]) -> Self {
        Value::List(arr.into_iter().map(Into::into).collect())
    }
}

/// Helper for creating values from anything convertible
pub fn val<T: Into<Value>>(value: T) -> Value {
    value.into()
}

/// Helper for creating symbol atoms
pub fn sym<S: AsRef<str>>(name: S) -> Value {
    Value::Atom(Atom::Symbol(name.as_ref().to_owned()))
}

/// Helper for the empty list
pub fn nil() -> Value {
    Value::List(vec![])
}

/// Helper for an instruction atom without origin
pub fn op(code: Opcode) -> Value {
    Value::opcode(code, None)
}
