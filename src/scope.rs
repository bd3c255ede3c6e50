//! Compile-time lexical scope chain.
//!
//! A [`Scope`] mirrors the shape the runtime Environment will have when the code
//! being compiled executes: one frame per enclosing lambda, `let` or `letrec`, plus
//! the global frame at the bottom. Resolving a name yields the `(depth, offset)` pair
//! that `LD` uses at runtime, so the two must never drift apart.

/// Names bound by one lambda, `let`, `letrec` or the top level
pub type ScopeFrame = Vec<String>;

#[derive(Debug, Clone, PartialEq)]
pub struct Scope {
    /// Outermost (global) frame first
    frames: Vec<ScopeFrame>,
}

impl Default for Scope {
    fn default() -> Self {
        Self::new()
    }
}

impl Scope {
    /// A chain holding one empty global frame
    pub fn new() -> Self {
        Scope {
            frames: vec![Vec::new()],
        }
    }

    /// A chain whose global frame already holds `globals`, in runtime order
    pub fn with_globals(globals: Vec<String>) -> Self {
        Scope {
            frames: vec![globals],
        }
    }

    pub fn push(&mut self, frame: ScopeFrame) {
        self.frames.push(frame);
    }

    /// Leave the innermost frame. The global frame is never popped.
    pub fn pop(&mut self) -> Option<ScopeFrame> {
        if self.frames.len() > 1 {
            self.frames.pop()
        } else {
            None
        }
    }

    /// Append a name to the global frame, as `define` does at runtime with `DEFUN`
    pub fn add_binding(&mut self, name: impl Into<String>) {
        if let Some(global) = self.frames.first_mut() {
            global.push(name.into());
        }
    }

    /// Walk outward from the innermost frame. Within one frame the last binding of a
    /// name wins, and inner frames shadow outer ones.
    pub fn resolve(&self, name: &str) -> Option<(usize, usize)> {
        self.frames
            .iter()
            .rev()
            .enumerate()
            .find_map(|(depth, frame)| {
                frame
                    .iter()
                    .rposition(|bound| bound == name)
                    .map(|offset| (depth, offset))
            })
    }

    /// Number of frames, including the global one
    pub fn depth(&self) -> usize {
        self.frames.len()
    }

    pub fn globals(&self) -> &[String] {
        match self.frames.first() {
            Some(global) => global,
            None => &[],
        }
    }

    pub fn into_globals(self) -> Vec<String> {
        self.frames.into_iter().next().unwrap_or_default()
    }
}
