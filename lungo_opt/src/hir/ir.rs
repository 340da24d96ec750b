//! The IR graph.
//!
//! The graph owns every block, value node and frame state in per-compilation arenas; edges
//! between them are dense indices, never references. The graph is cyclic through loop back
//! edges, so the arenas free as a unit when the compilation ends. A reverse predecessor map is
//! maintained alongside the forward successor edges.

use crate::hir::block::{Block, BlockFlags, BlockId};
use crate::hir::frame_state::{FrameState, StateId};
use crate::hir::value::{NodeId, Value, ValueFlags, ValueTag};
use ahash::AHashMap;
use lungo_code::{Kind, ObjectHandle};

/// One exception handler of the method, in graph terms.
#[derive(Clone, Debug)]
pub struct IrHandler {
    pub start_bci: u32,
    pub end_bci: u32,
    /// The handler's entry block
    pub block: BlockId,
    /// Resolved catch class; `None` catches everything
    pub catch_type: Option<ObjectHandle>,
    /// Synthetic catch-all covering the whole method (synchronized method unwind)
    pub synthetic: bool,
}

impl IrHandler {
    /// Return whether the handler covers `bci`.
    #[must_use]
    pub fn covers(&self, bci: u32) -> bool {
        self.synthetic || (self.start_bci <= bci && bci < self.end_bci)
    }
}

/// The rooted, arena-owned HIR graph of one compilation.
#[derive(Debug, Default)]
pub struct Ir {
    values: Vec<Value>,
    blocks: Vec<Block>,
    states: Vec<FrameState>,
    state_index: AHashMap<FrameState, StateId>,
    pub start_block: Option<BlockId>,
    pub osr_block: Option<BlockId>,
    pub handlers: Vec<IrHandler>,
    /// Number of monitor slots the frame needs
    pub max_locks: u32,
}

impl Ir {
    #[must_use]
    pub fn new() -> Ir {
        Ir::default()
    }

    /// Allocate a new block.
    pub fn new_block(&mut self, bci: u32, flags: BlockFlags) -> BlockId {
        let id = BlockId(u32::try_from(self.blocks.len()).unwrap_or(u32::MAX));
        self.blocks.push(Block::new(id, bci, flags));
        id
    }

    /// Allocate a new value node without appending it to a block chain.
    pub fn new_value(&mut self, block: BlockId, bci: u32, kind: Kind, tag: ValueTag) -> NodeId {
        let id = NodeId(u32::try_from(self.values.len()).unwrap_or(u32::MAX));
        self.values.push(Value {
            id,
            kind,
            flags: ValueFlags::LIVE,
            operand: None,
            next: None,
            block,
            bci,
            state: None,
            handlers: Vec::new(),
            tag,
        });
        id
    }

    /// Append an already allocated node to its block's instruction chain.
    ///
    /// # Panics
    ///
    /// if the block already ends in a block end
    pub fn append(&mut self, block: BlockId, node: NodeId) {
        let last = self.block(block).last;
        match last {
            Some(last) => {
                assert!(
                    !self.value(last).tag.is_block_end(),
                    "appending {node} after the block end of {block}"
                );
                self.value_mut(last).next = Some(node);
            }
            None => {
                self.block_mut(block).first = Some(node);
            }
        }
        self.block_mut(block).last = Some(node);
        self.value_mut(node).block = block;
    }

    /// Create a phi merging `slot` at `block`.
    pub fn new_phi(
        &mut self,
        block: BlockId,
        kind: Kind,
        slot: crate::hir::value::PhiSlot,
        inputs: Vec<NodeId>,
    ) -> NodeId {
        let bci = self.block(block).bci;
        let phi = self.new_value(block, bci, kind, ValueTag::Phi { slot, inputs });
        self.block_mut(block).phis.push(phi);
        phi
    }

    /// Add a control flow edge, keeping the predecessor map consistent.
    pub fn add_edge(&mut self, from: BlockId, to: BlockId) {
        self.block_mut(from).successors.push(to);
        self.block_mut(to).predecessors.push(from);
    }

    /// Intern a frame state snapshot.
    pub fn intern_state(&mut self, state: FrameState) -> StateId {
        if let Some(id) = self.state_index.get(&state) {
            return *id;
        }
        let id = StateId(u32::try_from(self.states.len()).unwrap_or(u32::MAX));
        self.states.push(state.clone());
        self.state_index.insert(state, id);
        id
    }

    #[must_use]
    pub fn value(&self, id: NodeId) -> &Value {
        &self.values[id.index()]
    }

    pub fn value_mut(&mut self, id: NodeId) -> &mut Value {
        &mut self.values[id.index()]
    }

    #[must_use]
    pub fn block(&self, id: BlockId) -> &Block {
        &self.blocks[id.index()]
    }

    pub fn block_mut(&mut self, id: BlockId) -> &mut Block {
        &mut self.blocks[id.index()]
    }

    #[must_use]
    pub fn state(&self, id: StateId) -> &FrameState {
        &self.states[id.index()]
    }

    #[must_use]
    pub fn block_count(&self) -> usize {
        self.blocks.len()
    }

    #[must_use]
    pub fn value_count(&self) -> usize {
        self.values.len()
    }

    /// Return the instruction chain of a block, in order.
    #[must_use]
    pub fn instructions(&self, block: BlockId) -> Vec<NodeId> {
        let mut chain = Vec::new();
        let mut cursor = self.block(block).first;
        while let Some(node) = cursor {
            chain.push(node);
            cursor = self.value(node).next;
        }
        chain
    }

    /// Return the blocks reachable from the start block in reverse postorder.
    ///
    /// # Panics
    ///
    /// if the graph has no start block
    #[must_use]
    pub fn reverse_postorder(&self) -> Vec<BlockId> {
        let start = self.start_block.expect("graph has no start block");
        let mut postorder = Vec::with_capacity(self.blocks.len());
        let mut visited = vec![false; self.blocks.len()];
        // Iterative DFS; the second stack element is the next successor index to visit
        let mut stack = vec![(start, 0usize)];
        visited[start.index()] = true;
        while let Some((block, successor_index)) = stack.pop() {
            let successors = &self.block(block).successors;
            if successor_index < successors.len() {
                stack.push((block, successor_index + 1));
                let next = successors[successor_index];
                if !visited[next.index()] {
                    visited[next.index()] = true;
                    stack.push((next, 0));
                }
            } else {
                postorder.push(block);
            }
        }
        postorder.reverse();
        postorder
    }

    /// Check the structural invariants of the graph.
    ///
    /// # Errors
    ///
    /// with a description of the first violated invariant
    pub fn verify(&self) -> Result<(), String> {
        let reachable = self.reverse_postorder();
        for block_id in &reachable {
            let block = self.block(*block_id);
            // Every visited block ends in exactly one block end
            if block.is_visited() {
                let Some(last) = block.last else {
                    return Err(format!("{block_id} has no instructions"));
                };
                if !self.value(last).tag.is_block_end() {
                    return Err(format!("{block_id} does not end in a block end"));
                }
                let ends = self
                    .instructions(*block_id)
                    .iter()
                    .filter(|node| self.value(**node).tag.is_block_end())
                    .count();
                if ends != 1 {
                    return Err(format!("{block_id} has {ends} block ends"));
                }
            }
            // Predecessor counts match forward edges
            let incoming = reachable
                .iter()
                .flat_map(|other| self.block(*other).successors.iter())
                .filter(|successor| **successor == *block_id)
                .count();
            if incoming != block.predecessors.len() {
                return Err(format!(
                    "{block_id} has {} predecessors but {incoming} incoming edges",
                    block.predecessors.len()
                ));
            }
            // Phi arity matches the predecessor count
            for phi in &block.phis {
                let ValueTag::Phi { inputs, .. } = &self.value(*phi).tag else {
                    return Err(format!("{phi} in the phi list of {block_id} is not a phi"));
                };
                if inputs.len() != block.predecessors.len() {
                    return Err(format!(
                        "phi {phi} of {block_id} has {} inputs for {} predecessors",
                        inputs.len(),
                        block.predecessors.len()
                    ));
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use lungo_code::ConstValue;

    fn diamond() -> Ir {
        let mut ir = Ir::new();
        let entry = ir.new_block(0, BlockFlags::STANDARD_ENTRY);
        let left = ir.new_block(4, BlockFlags::empty());
        let right = ir.new_block(8, BlockFlags::empty());
        let join = ir.new_block(12, BlockFlags::empty());
        ir.start_block = Some(entry);
        ir.add_edge(entry, left);
        ir.add_edge(entry, right);
        ir.add_edge(left, join);
        ir.add_edge(right, join);
        ir
    }

    #[test]
    fn test_append_chains_values() {
        let mut ir = Ir::new();
        let block = ir.new_block(0, BlockFlags::empty());
        let first = ir.new_value(block, 0, Kind::Int, ValueTag::Constant(ConstValue::Int(1)));
        let second = ir.new_value(block, 1, Kind::Int, ValueTag::Constant(ConstValue::Int(2)));
        ir.append(block, first);
        ir.append(block, second);
        assert_eq!(vec![first, second], ir.instructions(block));
        assert_eq!(Some(second), ir.value(first).next);
    }

    #[test]
    fn test_edges_maintain_predecessors() {
        let ir = diamond();
        let join = BlockId(3);
        assert_eq!(vec![BlockId(1), BlockId(2)], ir.block(join).predecessors);
        assert_eq!(vec![BlockId(1), BlockId(2)], ir.block(BlockId(0)).successors);
    }

    #[test]
    fn test_reverse_postorder_visits_all() {
        let ir = diamond();
        let order = ir.reverse_postorder();
        assert_eq!(4, order.len());
        assert_eq!(BlockId(0), order[0]);
        // The join block comes after both branches
        assert_eq!(BlockId(3), order[3]);
    }

    #[test]
    fn test_state_interning() {
        let mut ir = Ir::new();
        let state = FrameState::new(0, 2, None);
        let first = ir.intern_state(state.clone());
        let second = ir.intern_state(state);
        assert_eq!(first, second);
        let other = FrameState::new(4, 2, None);
        let third = ir.intern_state(other);
        assert_ne!(first, third);
    }

    #[test]
    fn test_verify_phi_arity() {
        let mut ir = diamond();
        let join = BlockId(3);
        // A phi with only one input for two predecessors
        let lonely = ir.new_value(join, 12, Kind::Int, ValueTag::Constant(ConstValue::Int(0)));
        ir.new_phi(
            join,
            Kind::Int,
            crate::hir::value::PhiSlot::Stack(0),
            vec![lonely],
        );
        let error = ir.verify().expect_err("phi arity should be rejected");
        assert!(error.contains("inputs for 2 predecessors"));
    }

    #[test]
    fn test_verify_accepts_diamond() {
        let ir = diamond();
        assert_eq!(Ok(()), ir.verify());
    }
}
