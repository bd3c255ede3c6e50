//! Step observers for the SECD machine.
//!
//! Nothing in here influences evaluation. [`crate::machine::Machine::step_observed`]
//! reports each executed instruction to an [`Observer`], and [`TraceLog`] is an
//! observer that keeps every step in an arena of [`TraceNode`]s. Each node links back
//! to the previous node of the same activation through `history`, so the chain of
//! reductions inside one function call (or one `if` branch) can be walked without
//! the steps of nested calls getting in the way.

use crate::Span;
use crate::value::{Opcode, Value};

/// What one executed instruction did, as seen right after it ran
#[derive(Debug)]
pub struct StepEvent<'a> {
    /// 1-based count of instructions executed so far
    pub step: usize,
    pub opcode: Opcode,
    /// Source span of the form that emitted the instruction, if known
    pub origin: Option<Span>,
    pub stack: &'a [Value],
    /// Number of Dump entries; grows on `AP`, `RAP` and `SEL`
    pub dump_depth: usize,
}

pub trait Observer {
    fn on_step(&mut self, event: &StepEvent<'_>);
}

impl<F> Observer for F
where
    F: FnMut(&StepEvent<'_>),
{
    fn on_step(&mut self, event: &StepEvent<'_>) {
        self(event)
    }
}

/// Index of a node in a [`TraceLog`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeIndex(usize);

impl NodeIndex {
    pub fn index(self) -> usize {
        self.0
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct TraceNode {
    pub step: usize,
    pub opcode: Opcode,
    pub origin: Option<Span>,
    /// Top of the Stack after the instruction
    pub result: Option<Value>,
    pub dump_depth: usize,
    /// Previous node of the same activation
    pub history: Option<NodeIndex>,
}

/// Arena of every observed step
#[derive(Debug, Clone, Default)]
pub struct TraceLog {
    nodes: Vec<TraceNode>,
    /// Latest node per dump depth
    frontier: Vec<Option<NodeIndex>>,
}

impl TraceLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn get(&self, index: NodeIndex) -> Option<&TraceNode> {
        self.nodes.get(index.0)
    }

    pub fn nodes(&self) -> &[TraceNode] {
        &self.nodes
    }

    pub fn last(&self) -> Option<NodeIndex> {
        self.nodes.len().checked_sub(1).map(NodeIndex)
    }

    /// `index` followed by its history chain, newest first
    pub fn history(&self, index: NodeIndex) -> impl Iterator<Item = (NodeIndex, &TraceNode)> {
        let mut next = Some(index);
        std::iter::from_fn(move || {
            let current = next?;
            let node = self.nodes.get(current.0)?;
            next = node.history;
            Some((current, node))
        })
    }

    fn record(&mut self, event: &StepEvent<'_>) -> NodeIndex {
        let depth = event.dump_depth;
        // Activations deeper than this one have returned
        self.frontier.truncate(depth + 1);
        if self.frontier.len() <= depth {
            self.frontier.resize(depth + 1, None);
        }

        let index = NodeIndex(self.nodes.len());
        self.nodes.push(TraceNode {
            step: event.step,
            opcode: event.opcode,
            origin: event.origin,
            result: event.stack.last().cloned(),
            dump_depth: depth,
            history: self.frontier[depth],
        });
        self.frontier[depth] = Some(index);
        index
    }
}

impl Observer for TraceLog {
    fn on_step(&mut self, event: &StepEvent<'_>) {
        self.record(event);
    }
}

#[cfg(test)]
#[expect(clippy::unwrap_used)] // test code OK
mod tests {
    use super::*;
    use crate::compile;
    use crate::machine::Machine;
    use crate::value::val;

    #[test]
    fn test_closure_observer_sees_every_step() {
        let mut machine = Machine::new(compile("(+ 1 2)").unwrap());
        let mut seen = Vec::new();
        let mut observer = |event: &StepEvent<'_>| {
            seen.push((event.step, event.opcode, event.stack.to_vec()));
        };
        let result = machine.run_observed(&mut observer, 100).unwrap();

        assert_eq!(result, Some(val(3)));
        assert_eq!(
            seen,
            vec![
                (1, Opcode::Ldc, vec![val(2)]),
                (2, Opcode::Ldc, vec![val(2), val(1)]),
                (3, Opcode::Add, vec![val(3)]),
            ]
        );
    }

    #[test]
    fn test_trace_log_history_skips_nested_activations() {
        let mut machine = Machine::new(compile("(+ 1 ((lambda (x) (* x 2)) 5))").unwrap());
        let mut log = TraceLog::new();
        machine.run_observed(&mut log, 100).unwrap();

        assert_eq!(log.len(), machine.steps());
        let last = log.last().unwrap();
        let node = log.get(last).unwrap();
        assert_eq!(node.opcode, Opcode::Add);
        assert_eq!(node.result, Some(val(11)));
        assert_eq!(node.origin, Some(Span::new(0, 30)));

        // Top-level chain, newest first. The RTN that ends the call stands in for
        // its AP; the multiplication happens one activation deeper.
        let chain: Vec<Opcode> = log.history(last).map(|(_, n)| n.opcode).collect();
        assert_eq!(
            chain,
            vec![
                Opcode::Add,
                Opcode::Ldc,
                Opcode::Rtn,
                Opcode::Ldf,
                Opcode::Cons,
                Opcode::Ldc,
                Opcode::Nil,
            ]
        );

        let callee: Vec<_> = log
            .nodes()
            .iter()
            .filter(|n| n.dump_depth == 1)
            .map(|n| n.opcode)
            .collect();
        assert_eq!(
            callee,
            vec![Opcode::Ap, Opcode::Ldc, Opcode::Ld, Opcode::Mul]
        );
    }

    #[test]
    fn test_empty_log() {
        let log = TraceLog::new();
        assert!(log.is_empty());
        assert_eq!(log.last(), None);
        assert_eq!(log.history(NodeIndex(3)).count(), 0);
    }
}
