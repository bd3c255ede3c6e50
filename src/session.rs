//! Globals that persist across programs.
//!
//! A [`Session`] keeps the global frame and the names bound in it, so a later
//! program can call what an earlier one defined. This is what the REPL runs on.
//! A program that fails, at compile time or at runtime, leaves the session as it
//! was before the program started.

use tracing::debug;

use crate::compiler::{Compiled, Compiler};
use crate::machine::Machine;
use crate::value::{Environment, Frame, Value};
use crate::{DEFAULT_STEP_LIMIT, Error};

#[derive(Debug)]
pub struct Session {
    compiler: Compiler,
    globals: Vec<String>,
    env: Environment,
    step_limit: usize,
}

impl Default for Session {
    fn default() -> Self {
        Self::new()
    }
}

impl Session {
    pub fn new() -> Self {
        Self::with_compiler(Compiler::new())
    }

    pub fn with_compiler(compiler: Compiler) -> Self {
        Session {
            compiler,
            globals: Vec::new(),
            env: Environment::global(),
            step_limit: DEFAULT_STEP_LIMIT,
        }
    }

    /// Steps each [`Session::eval`] may take (default [`DEFAULT_STEP_LIMIT`])
    pub fn with_step_limit(mut self, step_limit: usize) -> Self {
        self.step_limit = step_limit;
        self
    }

    /// Compile and run `source` against the session globals
    pub fn eval(&mut self, source: &str) -> Result<Option<Value>, Error> {
        let compiled = self.compile(source)?;
        let global = self.global_frame();
        let committed = global.len();

        let mut machine = Machine::with_environment(compiled.code, self.env.clone());
        match machine.run_with_limit(self.step_limit) {
            Ok(result) => {
                debug!(
                    steps = machine.steps(),
                    globals = compiled.globals.len(),
                    "session eval"
                );
                self.globals = compiled.globals;
                Ok(result)
            }
            Err(err) => {
                // Drop whatever the failed program managed to define
                global.truncate(committed);
                Err(err)
            }
        }
    }

    /// Compile `source` against the session globals without running it
    pub fn compile(&self, source: &str) -> Result<Compiled, Error> {
        self.compiler
            .compile_with_globals(source, self.globals.clone())
    }

    /// A machine ready to run `source` over a copy of the global frame. Nothing it
    /// does, definitions included, reaches the session.
    pub fn machine(&self, source: &str) -> Result<Machine, Error> {
        let compiled = self.compile(source)?;
        let snapshot = Environment::from_frames(vec![Frame::new(self.global_frame().values())]);
        Ok(Machine::with_environment(compiled.code, snapshot))
    }

    /// Names in the global frame, oldest first. A redefined name appears once per
    /// definition.
    pub fn globals(&self) -> &[String] {
        &self.globals
    }

    pub fn environment(&self) -> &Environment {
        &self.env
    }

    /// Current value of a global; the newest definition wins
    pub fn lookup(&self, name: &str) -> Option<Value> {
        let offset = self.globals.iter().rposition(|bound| bound == name)?;
        self.global_frame().get(offset)
    }

    /// Every visible global binding, sorted by name
    pub fn bindings(&self) -> Vec<(String, Value)> {
        let mut bindings: Vec<(String, Value)> = Vec::new();
        for name in &self.globals {
            if bindings.iter().any(|(bound, _)| bound == name) {
                continue;
            }
            if let Some(value) = self.lookup(name) {
                bindings.push((name.clone(), value));
            }
        }
        bindings.sort_by(|a, b| a.0.cmp(&b.0));
        bindings
    }

    fn global_frame(&self) -> Frame {
        self.env.global_frame().cloned().unwrap_or_default()
    }
}
