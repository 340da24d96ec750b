//! Frame state snapshots.
//!
//! A [`FrameState`] is an immutable snapshot of the JVM frame: local slots, operand stack and
//! held monitors, plus a link to the caller state when the frame belongs to an inlined scope.
//! Snapshots are hash-consed by the arena; the builder mutates a working copy and interns it at
//! snapshot points instead of editing interned states in place.

use crate::hir::value::NodeId;
use std::fmt;

/// Dense index of an interned frame state.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub struct StateId(pub u32);

impl StateId {
    #[must_use]
    pub fn index(self) -> usize {
        usize::try_from(self.0).unwrap_or(usize::MAX)
    }
}

/// A snapshot of locals, stack and locks at one bytecode index.
///
/// Category-2 values occupy two slots; the upper slot holds `None`, as do dead slots.
#[derive(Clone, Debug, Eq, Hash, PartialEq)]
pub struct FrameState {
    pub bci: u32,
    pub locals: Vec<Option<NodeId>>,
    pub stack: Vec<Option<NodeId>>,
    /// Objects locked by enclosing monitor enters, innermost last
    pub locks: Vec<NodeId>,
    /// State of the calling scope for inlined frames
    pub caller: Option<StateId>,
}

impl FrameState {
    /// Create a state with `max_locals` empty locals and an empty stack.
    #[must_use]
    pub fn new(bci: u32, max_locals: usize, caller: Option<StateId>) -> FrameState {
        FrameState {
            bci,
            locals: vec![None; max_locals],
            stack: Vec::new(),
            locks: Vec::new(),
            caller,
        }
    }

    /// Push a raw slot.
    pub fn raw_push(&mut self, value: Option<NodeId>) {
        self.stack.push(value);
    }

    /// Pop a raw slot.
    ///
    /// # Panics
    ///
    /// if the stack is empty
    pub fn raw_pop(&mut self) -> Option<NodeId> {
        assert!(!self.stack.is_empty(), "operand stack underflow");
        self.stack.pop().flatten()
    }

    /// Push a value occupying `slots` stack slots.
    pub fn push(&mut self, slots: u32, value: NodeId) {
        self.stack.push(Some(value));
        if slots == 2 {
            self.stack.push(None);
        }
    }

    /// Pop a value occupying `slots` stack slots.
    ///
    /// # Panics
    ///
    /// if the stack does not hold a value of that shape
    pub fn pop(&mut self, slots: u32) -> NodeId {
        if slots == 2 {
            let filler = self.stack.pop().expect("operand stack underflow");
            assert!(filler.is_none(), "popping a category-2 value off a category-1 slot");
        }
        self.stack
            .pop()
            .expect("operand stack underflow")
            .expect("popping a dead stack slot")
    }

    /// Return the value `depth` slots below the top without popping.
    #[must_use]
    pub fn peek(&self, depth: usize) -> Option<NodeId> {
        let length = self.stack.len();
        if depth >= length {
            return None;
        }
        self.stack[length - 1 - depth]
    }

    /// Return the local at `index`.
    #[must_use]
    pub fn local(&self, index: usize) -> Option<NodeId> {
        self.locals.get(index).copied().flatten()
    }

    /// Store `value` into local `index`, killing any overlapped category-2 halves.
    ///
    /// `two_slots` marks category-2 values, which also kill the slot above. The slot below is
    /// killed unconditionally when it held the low half of a category-2 value; callers pass
    /// `kill_below` after checking the kind of that slot.
    pub fn store_local(&mut self, index: usize, value: NodeId, two_slots: bool, kill_below: bool) {
        if self.locals.len() <= index + usize::from(two_slots) {
            self.locals.resize(index + 1 + usize::from(two_slots), None);
        }
        self.locals[index] = Some(value);
        if two_slots {
            self.locals[index + 1] = None;
        }
        if kill_below && index > 0 {
            self.locals[index - 1] = None;
        }
    }

    /// Return the stack depth in slots.
    #[must_use]
    pub fn stack_size(&self) -> usize {
        self.stack.len()
    }

    /// Clear the operand stack.
    pub fn clear_stack(&mut self) {
        self.stack.clear();
    }

    /// Return all slots of the state, locals first, as (is-local, slot index, node) triples.
    #[must_use]
    pub fn slots(&self) -> Vec<(bool, usize, Option<NodeId>)> {
        slot_triples(self)
    }
}

/// Enumerate the slots of a state, locals first.
fn slot_triples(state: &FrameState) -> Vec<(bool, usize, Option<NodeId>)> {
    let mut triples = Vec::with_capacity(state.locals.len() + state.stack.len());
    for (index, value) in state.locals.iter().enumerate() {
        triples.push((true, index, *value));
    }
    for (index, value) in state.stack.iter().enumerate() {
        triples.push((false, index, *value));
    }
    triples
}

impl fmt::Display for FrameState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "state@{} [", self.bci)?;
        for (index, local) in self.locals.iter().enumerate() {
            if index > 0 {
                write!(f, " ")?;
            }
            match local {
                Some(node) => write!(f, "{node}")?,
                None => write!(f, "-")?,
            }
        }
        write!(f, " | ")?;
        for (index, slot) in self.stack.iter().enumerate() {
            if index > 0 {
                write!(f, " ")?;
            }
            match slot {
                Some(node) => write!(f, "{node}")?,
                None => write!(f, "-")?,
            }
        }
        write!(f, "]")
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_push_pop_category_1() {
        let mut state = FrameState::new(0, 2, None);
        state.push(1, NodeId(5));
        assert_eq!(1, state.stack_size());
        assert_eq!(Some(NodeId(5)), state.peek(0));
        assert_eq!(NodeId(5), state.pop(1));
        assert_eq!(0, state.stack_size());
    }

    #[test]
    fn test_push_pop_category_2() {
        let mut state = FrameState::new(0, 0, None);
        state.push(2, NodeId(9));
        assert_eq!(2, state.stack_size());
        assert_eq!(None, state.peek(0));
        assert_eq!(Some(NodeId(9)), state.peek(1));
        assert_eq!(NodeId(9), state.pop(2));
        assert_eq!(0, state.stack_size());
    }

    #[test]
    fn test_store_local_kills_overlaps() {
        let mut state = FrameState::new(0, 4, None);
        // Store a long at 0..2, then overwrite slot 1
        state.store_local(0, NodeId(1), true, false);
        assert_eq!(Some(NodeId(1)), state.local(0));
        assert_eq!(None, state.local(1));
        state.store_local(1, NodeId(2), false, true);
        assert_eq!(None, state.local(0));
        assert_eq!(Some(NodeId(2)), state.local(1));
    }

    #[test]
    fn test_store_local_grows() {
        let mut state = FrameState::new(0, 0, None);
        state.store_local(2, NodeId(3), true, false);
        assert_eq!(4, state.locals.len());
        assert_eq!(Some(NodeId(3)), state.local(2));
    }

    #[test]
    fn test_slots_enumeration() {
        let mut state = FrameState::new(0, 1, None);
        state.locals[0] = Some(NodeId(1));
        state.push(1, NodeId(2));
        let slots = state.slots();
        assert_eq!(vec![(true, 0, Some(NodeId(1))), (false, 0, Some(NodeId(2)))], slots);
    }

    #[test]
    #[should_panic(expected = "operand stack underflow")]
    fn test_underflow() {
        let mut state = FrameState::new(0, 0, None);
        let _ = state.pop(1);
    }

    #[test]
    fn test_display() {
        let mut state = FrameState::new(4, 2, None);
        state.locals[0] = Some(NodeId(1));
        state.push(1, NodeId(2));
        assert_eq!("state@4 [n1 - | n2]", state.to_string());
    }
}
