//! The SECD interpreter.
//!
//! A [`Machine`] owns the four registers. [`Machine::step`] executes exactly one
//! instruction from the Code register; [`Machine::run`] steps until Code is empty and
//! returns the top of the Stack.
//!
//! Continuations on the Dump are snapshots: `AP`, `RAP` and `SEL` move the live
//! registers into the entry and start over with fresh ones, so nothing done after
//! the call can change what `RTN` or `JOIN` restores. The only shared state is the
//! contents of environment frames (see [`crate::value::Frame`]).

use std::fmt;
use std::mem;
use std::rc::Rc;

use tracing::{debug, instrument, trace};

use crate::trace::{Observer, StepEvent};
use crate::value::{Atom, Closure, Environment, Frame, NumberType, Opcode, Value};
use crate::{Error, InterpreterError, MAX_DATA_DEPTH, Span};

/// The Code register: a cursor over an immutable block. Pending instructions are
/// `block[pc..]`.
#[derive(Clone, Default)]
pub struct Code {
    block: Rc<[Value]>,
    pc: usize,
}

impl Code {
    pub fn new(block: impl Into<Rc<[Value]>>) -> Self {
        Code {
            block: block.into(),
            pc: 0,
        }
    }

    /// Instructions and operands not yet executed
    pub fn pending(&self) -> &[Value] {
        self.block.get(self.pc..).unwrap_or_default()
    }

    pub fn is_empty(&self) -> bool {
        self.pending().is_empty()
    }

    fn fetch(&mut self) -> Option<Value> {
        let value = self.block.get(self.pc).cloned();
        if value.is_some() {
            self.pc += 1;
        }
        value
    }
}

impl fmt::Debug for Code {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list().entries(self.pending()).finish()
    }
}

/// A saved continuation
#[derive(Debug, Clone)]
pub enum DumpEntry {
    /// Caller state saved by `AP` and `RAP`, restored by `RTN`
    Call {
        stack: Vec<Value>,
        env: Environment,
        code: Code,
    },
    /// Code following a `SEL`, resumed by `JOIN`
    Join { code: Code },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepOutcome {
    /// One instruction was executed
    Continue,
    /// Code was already empty; nothing was executed
    Halted,
}

#[derive(Debug)]
pub struct Machine {
    stack: Vec<Value>,
    env: Environment,
    code: Code,
    dump: Vec<DumpEntry>,
    steps: usize,
}

impl Machine {
    /// A machine about to run `code` with one empty global frame
    pub fn new(code: Vec<Value>) -> Self {
        Self::with_environment(code, Environment::global())
    }

    /// A machine about to run `code` in `env`. Sessions use this to keep one global
    /// frame across programs.
    pub fn with_environment(code: Vec<Value>, env: Environment) -> Self {
        Machine {
            stack: Vec::new(),
            env,
            code: Code::new(code),
            dump: Vec::new(),
            steps: 0,
        }
    }

    pub fn stack(&self) -> &[Value] {
        &self.stack
    }

    pub fn code(&self) -> &[Value] {
        self.code.pending()
    }

    pub fn environment(&self) -> &Environment {
        &self.env
    }

    pub fn dump(&self) -> &[DumpEntry] {
        &self.dump
    }

    /// Instructions executed so far
    pub fn steps(&self) -> usize {
        self.steps
    }

    pub fn is_halted(&self) -> bool {
        self.code.is_empty()
    }

    /// Run until Code is empty. Does not return for a program that never halts.
    pub fn run(&mut self) -> Result<Option<Value>, Error> {
        while self.step()? == StepOutcome::Continue {}
        debug!(steps = self.steps, "machine halted");
        Ok(self.stack.last().cloned())
    }

    /// Run until Code is empty, failing once `max_steps` more instructions have
    /// executed without halting
    #[instrument(level = "debug", skip(self))]
    pub fn run_with_limit(&mut self, max_steps: usize) -> Result<Option<Value>, Error> {
        self.run_bounded(max_steps, None)
    }

    /// [`Machine::run_with_limit`], reporting every step to `observer`
    pub fn run_observed(
        &mut self,
        observer: &mut dyn Observer,
        max_steps: usize,
    ) -> Result<Option<Value>, Error> {
        self.run_bounded(max_steps, Some(observer))
    }

    fn run_bounded(
        &mut self,
        max_steps: usize,
        mut observer: Option<&mut dyn Observer>,
    ) -> Result<Option<Value>, Error> {
        let mut executed = 0usize;
        while !self.is_halted() {
            if executed == max_steps {
                return Err(InterpreterError::StepLimitExceeded { limit: max_steps }.into());
            }
            self.execute(observer.as_deref_mut())?;
            executed += 1;
        }
        debug!(steps = self.steps, "machine halted");
        Ok(self.stack.last().cloned())
    }

    /// Execute exactly one instruction
    pub fn step(&mut self) -> Result<StepOutcome, Error> {
        self.execute(None)
    }

    /// [`Machine::step`], reporting the executed instruction to `observer`
    pub fn step_observed(&mut self, observer: &mut dyn Observer) -> Result<StepOutcome, Error> {
        self.execute(Some(observer))
    }

    fn execute<'o>(
        &mut self,
        observer: Option<&mut (dyn Observer + 'o)>,
    ) -> Result<StepOutcome, Error> {
        let Some(instruction) = self.code.fetch() else {
            return Ok(StepOutcome::Halted);
        };
        let (opcode, origin) = match instruction {
            Value::Atom(Atom::Op { code, origin }) => (code, origin),
            other => {
                return Err(InterpreterError::NotAnInstruction {
                    found: other.to_string(),
                }
                .into());
            }
        };

        self.dispatch(opcode)?;
        self.steps += 1;
        trace!(
            step = self.steps,
            %opcode,
            stack = self.stack.len(),
            dump = self.dump.len(),
            "executed"
        );

        if let Some(observer) = observer {
            observer.on_step(&StepEvent {
                step: self.steps,
                opcode,
                origin,
                stack: &self.stack,
                dump_depth: self.dump.len(),
            });
        }
        Ok(StepOutcome::Continue)
    }

    fn dispatch(&mut self, opcode: Opcode) -> Result<(), InterpreterError> {
        match opcode {
            Opcode::Nil => self.stack.push(Value::List(Vec::new())),
            Opcode::Ldc => {
                let value = self.operand(opcode)?;
                self.stack.push(value);
            }
            Opcode::Ld => self.load()?,
            Opcode::Ldf => {
                let block = self.block_operand(opcode)?;
                self.stack.push(Value::Closure(Closure {
                    code: block.into(),
                    env: self.env.clone(),
                }));
            }
            Opcode::Ap => self.apply()?,
            Opcode::Rap => self.recursive_apply()?,
            Opcode::Rtn => self.ret()?,
            Opcode::Dum => self.env.push_frame(Frame::default()),
            Opcode::Sel => {
                let condition = self.pop(opcode)?;
                let consequent = self.block_operand(opcode)?;
                let alternative = self.block_operand(opcode)?;
                let branch = if condition.is_truthy() {
                    consequent
                } else {
                    alternative
                };
                let rest = mem::replace(&mut self.code, Code::new(branch));
                self.dump.push(DumpEntry::Join { code: rest });
            }
            Opcode::Join => match self.dump.pop() {
                Some(DumpEntry::Join { code }) => self.code = code,
                Some(_) => {
                    return Err(InterpreterError::DumpMismatch {
                        opcode: opcode.mnemonic(),
                        expected: "join",
                    });
                }
                None => {
                    return Err(InterpreterError::EmptyDump {
                        opcode: opcode.mnemonic(),
                    });
                }
            },
            Opcode::Cons => {
                let head = self.pop(opcode)?;
                let mut list = self.pop_list(opcode)?;
                if head.depth() >= MAX_DATA_DEPTH {
                    return Err(InterpreterError::DataTooDeep {
                        opcode: opcode.mnemonic(),
                        limit: MAX_DATA_DEPTH,
                    });
                }
                list.insert(0, head);
                self.stack.push(Value::List(list));
            }
            Opcode::Car => {
                let list = self.pop_list(opcode)?;
                let head = list.into_iter().next().ok_or_else(|| empty_list(opcode))?;
                self.stack.push(head);
            }
            Opcode::Cdr => {
                let mut list = self.pop_list(opcode)?;
                if list.is_empty() {
                    return Err(empty_list(opcode));
                }
                list.remove(0);
                self.stack.push(Value::List(list));
            }
            Opcode::Consp => {
                let value = self.pop(opcode)?;
                let is_pair = matches!(&value, Value::List(items) if !items.is_empty());
                self.stack.push(Value::from(is_pair));
            }
            Opcode::Pop => {
                self.pop(opcode)?;
            }
            Opcode::Add => self.arithmetic(opcode, NumberType::checked_add)?,
            Opcode::Sub => self.arithmetic(opcode, NumberType::checked_sub)?,
            Opcode::Mul => self.arithmetic(opcode, NumberType::checked_mul)?,
            Opcode::Div => {
                let (left, right) = self.pop_operands(opcode)?;
                if right == 0 {
                    return Err(InterpreterError::DivisionByZero);
                }
                let quotient = left.checked_div(right).ok_or(InterpreterError::Overflow {
                    opcode: opcode.mnemonic(),
                })?;
                self.stack.push(Value::number(quotient));
            }
            Opcode::Eq => self.compare(opcode, |l, r| l == r)?,
            Opcode::Ne => self.compare(opcode, |l, r| l != r)?,
            Opcode::Lt => self.compare(opcode, |l, r| l < r)?,
            Opcode::Le => self.compare(opcode, |l, r| l <= r)?,
            Opcode::Ht => self.compare(opcode, |l, r| l > r)?,
            Opcode::He => self.compare(opcode, |l, r| l >= r)?,
            Opcode::And => self.compare(opcode, |l, r| l != 0 && r != 0)?,
            Opcode::Or => self.compare(opcode, |l, r| l != 0 || r != 0)?,
            Opcode::Defun => {
                let value = self.pop(opcode)?;
                let global = self.env.global_frame().ok_or(InterpreterError::FrameOutOfRange {
                    opcode: opcode.mnemonic(),
                    depth: 0,
                    frames: 0,
                })?;
                global.push(value);
            }
        }
        Ok(())
    }

    // ---- Register helpers ----

    fn pop(&mut self, opcode: Opcode) -> Result<Value, InterpreterError> {
        self.stack.pop().ok_or(InterpreterError::EmptyStack {
            opcode: opcode.mnemonic(),
        })
    }

    fn pop_list(&mut self, opcode: Opcode) -> Result<Vec<Value>, InterpreterError> {
        match self.pop(opcode)? {
            Value::List(items) => Ok(items),
            other => Err(type_mismatch(opcode, "list", &other)),
        }
    }

    fn pop_number(&mut self, opcode: Opcode) -> Result<NumberType, InterpreterError> {
        let value = self.pop(opcode)?;
        value
            .as_number()
            .ok_or_else(|| type_mismatch(opcode, "number", &value))
    }

    /// Left operand is on top, right operand below it
    fn pop_operands(
        &mut self,
        opcode: Opcode,
    ) -> Result<(NumberType, NumberType), InterpreterError> {
        let left = self.pop_number(opcode)?;
        let right = self.pop_number(opcode)?;
        Ok((left, right))
    }

    fn pop_closure(&mut self, opcode: Opcode) -> Result<Closure, InterpreterError> {
        match self.pop(opcode)? {
            Value::Closure(closure) => Ok(closure),
            other => Err(type_mismatch(opcode, "closure", &other)),
        }
    }

    fn operand(&mut self, opcode: Opcode) -> Result<Value, InterpreterError> {
        self.code.fetch().ok_or(InterpreterError::MissingOperand {
            opcode: opcode.mnemonic(),
        })
    }

    fn block_operand(&mut self, opcode: Opcode) -> Result<Vec<Value>, InterpreterError> {
        match self.operand(opcode)? {
            Value::List(block) => Ok(block),
            other => Err(type_mismatch(opcode, "code block", &other)),
        }
    }

    fn number_operand(&mut self, opcode: Opcode) -> Result<NumberType, InterpreterError> {
        let value = self.operand(opcode)?;
        value
            .as_number()
            .ok_or_else(|| type_mismatch(opcode, "number operand", &value))
    }

    fn arithmetic(
        &mut self,
        opcode: Opcode,
        op: fn(NumberType, NumberType) -> Option<NumberType>,
    ) -> Result<(), InterpreterError> {
        let (left, right) = self.pop_operands(opcode)?;
        let result = op(left, right).ok_or(InterpreterError::Overflow {
            opcode: opcode.mnemonic(),
        })?;
        self.stack.push(Value::number(result));
        Ok(())
    }

    fn compare(
        &mut self,
        opcode: Opcode,
        test: fn(NumberType, NumberType) -> bool,
    ) -> Result<(), InterpreterError> {
        let (left, right) = self.pop_operands(opcode)?;
        self.stack.push(Value::from(test(left, right)));
        Ok(())
    }

    // ---- Environment and control ----

    /// `LD depth offset`
    fn load(&mut self) -> Result<(), InterpreterError> {
        let depth = self.number_operand(Opcode::Ld)?;
        let offset = self.number_operand(Opcode::Ld)?;
        let (Ok(depth), Ok(offset)) = (usize::try_from(depth), usize::try_from(offset)) else {
            return Err(InterpreterError::UnresolvedVariable { depth, offset });
        };

        let frame = self
            .env
            .frame(depth)
            .ok_or(InterpreterError::FrameOutOfRange {
                opcode: Opcode::Ld.mnemonic(),
                depth,
                frames: self.env.depth(),
            })?;
        let value = frame.get(offset).ok_or(InterpreterError::OffsetOutOfRange {
            depth,
            offset,
            len: frame.len(),
        })?;
        self.stack.push(value);
        Ok(())
    }

    /// `AP`: call the closure on top of the Stack with the argument list below it
    fn apply(&mut self) -> Result<(), InterpreterError> {
        let closure = self.pop_closure(Opcode::Ap)?;
        let args = self.pop_list(Opcode::Ap)?;

        let mut env = closure.env;
        env.push_frame(Frame::new(args));
        self.enter(closure.code, env, self.env.clone());
        Ok(())
    }

    /// `RAP`: like `AP`, but the arguments fill the dummy frame that `DUM` pushed and
    /// the closure captured, so closures among the arguments can see each other
    fn recursive_apply(&mut self) -> Result<(), InterpreterError> {
        let closure = self.pop_closure(Opcode::Rap)?;
        let args = self.pop_list(Opcode::Rap)?;

        let dummy = closure
            .env
            .innermost()
            .ok_or(InterpreterError::FrameOutOfRange {
                opcode: Opcode::Rap.mnemonic(),
                depth: 0,
                frames: 0,
            })?;
        dummy.fill(args);

        let mut saved = self.env.clone();
        if saved.pop_frame().is_none() {
            return Err(InterpreterError::FrameOutOfRange {
                opcode: Opcode::Rap.mnemonic(),
                depth: 0,
                frames: 0,
            });
        }
        self.enter(closure.code, closure.env, saved);
        Ok(())
    }

    /// Save the caller on the Dump and start `code` with an empty Stack
    fn enter(&mut self, code: Rc<[Value]>, env: Environment, saved_env: Environment) {
        let stack = mem::take(&mut self.stack);
        let code = mem::replace(&mut self.code, Code::new(code));
        self.env = env;
        self.dump.push(DumpEntry::Call {
            stack,
            env: saved_env,
            code,
        });
    }

    /// `RTN`: hand the top of the Stack back to the saved caller
    fn ret(&mut self) -> Result<(), InterpreterError> {
        let result = self.pop(Opcode::Rtn)?;
        match self.dump.pop() {
            Some(DumpEntry::Call { stack, env, code }) => {
                self.stack = stack;
                self.env = env;
                self.code = code;
                self.stack.push(result);
                Ok(())
            }
            Some(_) => Err(InterpreterError::DumpMismatch {
                opcode: Opcode::Rtn.mnemonic(),
                expected: "call",
            }),
            None => Err(InterpreterError::EmptyDump {
                opcode: Opcode::Rtn.mnemonic(),
            }),
        }
    }
}

fn type_mismatch(opcode: Opcode, expected: &'static str, found: &Value) -> InterpreterError {
    InterpreterError::TypeMismatch {
        opcode: opcode.mnemonic(),
        expected,
        found: found.type_name().to_owned(),
    }
}

fn empty_list(opcode: Opcode) -> InterpreterError {
    InterpreterError::TypeMismatch {
        opcode: opcode.mnemonic(),
        expected: "non-empty list",
        found: "empty list".to_owned(),
    }
}

/// Source span of the next instruction, if it carries one
pub fn next_origin(machine: &Machine) -> Option<Span> {
    match machine.code().first() {
        Some(Value::Atom(Atom::Op { origin, .. })) => *origin,
        _ => None,
    }
}

#[cfg(test)]
#[expect(clippy::unwrap_used)] // test code OK
mod tests {
    use super::*;
    use crate::compile;
    use crate::value::{nil, op, sym, val};
    use Opcode::*;

    /// Test result variants for data-driven machine tests
    #[derive(Debug)]
    enum RunTestResult {
        Halts(Value),                // Program halts with this value on top of the Stack
        SpecificError(&'static str), // Program fails with an error containing this text
    }
    use RunTestResult::*;

    fn run_code(code: Vec<Value>) -> Result<Option<Value>, Error> {
        Machine::new(code).run_with_limit(10_000)
    }

    fn run_machine_tests(test_cases: Vec<(Vec<Value>, RunTestResult)>) {
        for (i, (code, expected)) in test_cases.into_iter().enumerate() {
            let test_id = format!("Machine test #{} ({code:?})", i + 1);
            match (run_code(code), expected) {
                (Ok(Some(actual)), Halts(value)) => {
                    assert_eq!(actual, value, "{test_id}: result mismatch");
                }
                (Err(err), SpecificError(text)) => {
                    let message = err.to_string();
                    assert!(
                        message.contains(text),
                        "{test_id}: error should contain '{text}', got: {message}"
                    );
                }
                (Ok(actual), expected) => {
                    panic!("{test_id}: expected {expected:?}, got {actual:?}")
                }
                (Err(err), expected) => {
                    panic!("{test_id}: expected {expected:?}, got error {err}")
                }
            }
        }
    }

    #[test]
    fn test_data_and_arithmetic_instructions() {
        run_machine_tests(vec![
            (vec![op(Nil)], Halts(nil())),
            (vec![op(Ldc), val(7)], Halts(val(7))),
            (vec![op(Ldc), val(2), op(Ldc), val(10), op(Sub)], Halts(val(8))),
            (vec![op(Ldc), val(3), op(Ldc), val(-7), op(Div)], Halts(val(-2))),
            (vec![op(Ldc), val(3), op(Ldc), val(4), op(Mul)], Halts(val(12))),
            (vec![op(Ldc), val(1), op(Ldc), val(2), op(Lt)], Halts(val(0))),
            (vec![op(Ldc), val(2), op(Ldc), val(1), op(Lt)], Halts(val(1))),
            (vec![op(Ldc), val(2), op(Ldc), val(2), op(Le)], Halts(val(1))),
            (vec![op(Ldc), val(2), op(Ldc), val(3), op(Ht)], Halts(val(1))),
            (vec![op(Ldc), val(3), op(Ldc), val(2), op(He)], Halts(val(0))),
            (vec![op(Ldc), val(5), op(Ldc), val(5), op(Eq)], Halts(val(1))),
            (vec![op(Ldc), val(5), op(Ldc), val(5), op(Ne)], Halts(val(0))),
            (vec![op(Ldc), val(0), op(Ldc), val(9), op(And)], Halts(val(0))),
            (vec![op(Ldc), val(0), op(Ldc), val(9), op(Or)], Halts(val(1))),
            (
                vec![op(Nil), op(Ldc), val(2), op(Cons), op(Ldc), val(1), op(Cons)],
                Halts(val([1, 2])),
            ),
            (vec![op(Ldc), val([1, 2, 3]), op(Car)], Halts(val(1))),
            (vec![op(Ldc), val([1, 2, 3]), op(Cdr)], Halts(val([2, 3]))),
            (vec![op(Ldc), val([1]), op(Cdr)], Halts(nil())),
            (vec![op(Ldc), val([1]), op(Consp)], Halts(val(1))),
            (vec![op(Nil), op(Consp)], Halts(val(0))),
            (vec![op(Ldc), val(4), op(Consp)], Halts(val(0))),
            (vec![op(Ldc), val(1), op(Ldc), val(2), op(Pop)], Halts(val(1))),
            (vec![op(Ldc), sym("a")], Halts(sym("a"))),
        ]);
    }

    #[test]
    fn test_control_instructions() {
        let join = |n: i32| val(vec![op(Ldc), val(n), op(Join)]);
        run_machine_tests(vec![
            (vec![op(Ldc), val(0), op(Sel), join(1), join(2)], Halts(val(2))),
            (vec![op(Ldc), val(3), op(Sel), join(1), join(2)], Halts(val(1))),
            (vec![op(Nil), op(Sel), join(1), join(2)], Halts(val(2))),
            (vec![op(Ldc), val([0]), op(Sel), join(1), join(2)], Halts(val(1))),
            // Code after the SEL resumes at JOIN
            (
                vec![op(Ldc), val(1), op(Sel), join(4), join(5), op(Ldc), val(1), op(Add)],
                Halts(val(5)),
            ),
            // ((lambda (x) (* x x)) 6)
            (
                vec![
                    op(Nil),
                    op(Ldc),
                    val(6),
                    op(Cons),
                    op(Ldf),
                    val(vec![op(Ld), val(0), val(0), op(Ld), val(0), val(0), op(Mul), op(Rtn)]),
                    op(Ap),
                ],
                Halts(val(36)),
            ),
            // DEFUN then LD from the global frame
            (
                vec![op(Ldc), val(9), op(Defun), op(Ld), val(0), val(0)],
                Halts(val(9)),
            ),
        ]);
    }

    #[test]
    fn test_runtime_errors() {
        run_machine_tests(vec![
            (vec![op(Add)], SpecificError("ADD: stack is empty")),
            (vec![op(Ldc), val(1), op(Add)], SpecificError("ADD: stack is empty")),
            (vec![op(Pop)], SpecificError("POP: stack is empty")),
            (vec![op(Ldc)], SpecificError("LDC: code ended before its operand")),
            (vec![op(Ld), val(0)], SpecificError("LD: code ended before its operand")),
            (vec![op(Ldc), val(1), op(Rtn)], SpecificError("RTN: dump is empty")),
            (vec![op(Join)], SpecificError("JOIN: dump is empty")),
            (vec![val(1)], SpecificError("expected an instruction, found 1")),
            (
                vec![op(Ld), val(-1), val(-1)],
                SpecificError("unresolved variable reference (-1, -1)"),
            ),
            (
                vec![op(Ld), val(3), val(0)],
                SpecificError("no environment frame at depth 3"),
            ),
            (
                vec![op(Ld), val(0), val(2)],
                SpecificError("no binding at offset 2 of frame 0"),
            ),
            (
                vec![op(Ldc), val(0), op(Ldc), val(1), op(Div)],
                SpecificError("division by zero"),
            ),
            (
                vec![op(Ldc), val(1), op(Ldc), val(i64::MAX), op(Add)],
                SpecificError("ADD: integer overflow"),
            ),
            (
                vec![op(Ldc), val(-1), op(Ldc), val(i64::MIN), op(Div)],
                SpecificError("DIV: integer overflow"),
            ),
            (vec![op(Nil), op(Car)], SpecificError("CAR: expected non-empty list")),
            (vec![op(Nil), op(Cdr)], SpecificError("CDR: expected non-empty list")),
            (
                vec![op(Ldc), val(1), op(Car)],
                SpecificError("CAR: expected list, found number"),
            ),
            (
                vec![op(Nil), op(Nil), op(Ap)],
                SpecificError("AP: expected closure, found empty list"),
            ),
            (
                vec![op(Ldc), val("s"), op(Ldc), val(1), op(Add)],
                SpecificError("expected number, found string"),
            ),
            (
                vec![op(Ldc), val(1), op(Sel), val(2), val(3)],
                SpecificError("SEL: expected code block, found number"),
            ),
            // RTN finding a JOIN entry
            (
                vec![op(Ldc), val(1), op(Sel), val(vec![op(Ldc), val(1), op(Rtn)]), nil()],
                SpecificError("RTN: expected a call entry"),
            ),
        ]);
    }

    #[test]
    fn test_step_by_step() {
        let mut machine = Machine::new(compile("(+ 1 2)").unwrap());
        assert!(!machine.is_halted());
        assert_eq!(machine.code().len(), 5);

        assert_eq!(machine.step().unwrap(), StepOutcome::Continue);
        assert_eq!(machine.stack(), &[val(2)]);
        assert_eq!(machine.code().len(), 3);

        assert_eq!(machine.step().unwrap(), StepOutcome::Continue);
        assert_eq!(machine.step().unwrap(), StepOutcome::Continue);
        assert_eq!(machine.stack(), &[val(3)]);
        assert!(machine.is_halted());
        assert_eq!(machine.steps(), 3);

        assert_eq!(machine.step().unwrap(), StepOutcome::Halted);
        assert_eq!(machine.steps(), 3);
    }

    #[test]
    fn test_dump_snapshot_is_independent() {
        // The caller has 5 on its Stack and SUB left to run when the call starts
        let code = compile("(- ((lambda (x) (+ x 1)) 1) 5)").unwrap();
        let mut machine = Machine::new(code);

        while machine.dump().is_empty() {
            machine.step().unwrap();
        }
        let DumpEntry::Call { stack, code, .. } = machine.dump()[0].clone() else {
            panic!("expected a call entry, got {:?}", machine.dump()[0]);
        };
        assert_eq!(stack, vec![val(5)]);
        assert_eq!(code.pending(), &[op(Sub)]);
        assert!(machine.stack().is_empty());

        // The callee pushes onto its own Stack; the snapshot does not change
        machine.step().unwrap();
        machine.step().unwrap();
        assert_eq!(machine.stack().len(), 2);
        let DumpEntry::Call { stack: still, .. } = &machine.dump()[0] else {
            panic!("dump entry changed kind");
        };
        assert_eq!(still, &vec![val(5)]);

        assert_eq!(machine.run().unwrap(), Some(val(-3)));
        assert!(machine.dump().is_empty());
    }

    #[test]
    fn test_rap_fills_captured_frame() {
        let code = compile("(letrec ((f (lambda (n) (if (= n 0) 0 (f (- n 1)))))) (f 3))").unwrap();
        let mut machine = Machine::new(code);

        // DUM leaves the dummy frame as the innermost one
        machine.step().unwrap();
        assert_eq!(machine.environment().depth(), 2);
        assert!(machine.environment().innermost().unwrap().is_empty());

        assert_eq!(machine.run().unwrap(), Some(val(0)));
        // RAP restored the environment without the dummy frame
        assert_eq!(machine.environment().depth(), 1);
    }

    #[test]
    fn test_step_limit() {
        let code = compile("(letrec ((loop (lambda (n) (loop n)))) (loop 1))").unwrap();
        let err = Machine::new(code).run_with_limit(500).unwrap_err();
        assert_eq!(
            err,
            Error::Interpreter(InterpreterError::StepLimitExceeded { limit: 500 })
        );

        let mut machine = Machine::new(compile("(+ 1 2)").unwrap());
        assert_eq!(machine.run_with_limit(3).unwrap(), Some(val(3)));
    }

    #[test]
    fn test_shared_environment() {
        let env = Environment::global();
        env.global_frame().unwrap().push(val(41));

        let mut machine = Machine::with_environment(
            vec![op(Ld), val(0), val(0), op(Ldc), val(1), op(Add), op(Defun)],
            env.clone(),
        );
        assert_eq!(machine.run().unwrap(), None);
        assert_eq!(env.global_frame().unwrap().values(), vec![val(41), val(42)]);
    }

    #[test]
    fn test_next_origin() {
        let machine = Machine::new(compile("(* 2 3)").unwrap());
        assert_eq!(next_origin(&machine), Some(Span::new(5, 6)));
        assert_eq!(next_origin(&Machine::new(vec![op(Nil)])), None);
    }

    #[test]
    fn test_cons_depth_limit() {
        let nested = |depth: usize| (1..depth).fold(nil(), |inner, _| val(vec![inner]));
        assert_eq!(nested(MAX_DATA_DEPTH).depth(), MAX_DATA_DEPTH);

        run_machine_tests(vec![
            (
                vec![op(Nil), op(Ldc), nested(MAX_DATA_DEPTH - 1), op(Cons), op(Consp)],
                Halts(val(1)),
            ),
            (
                vec![op(Nil), op(Ldc), nested(MAX_DATA_DEPTH), op(Cons)],
                SpecificError("CONS: list nested deeper than 256 levels"),
            ),
        ]);
    }
}
