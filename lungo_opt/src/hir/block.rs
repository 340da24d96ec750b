//! Basic blocks.

use crate::hir::frame_state::StateId;
use crate::hir::value::NodeId;
use bitflags::bitflags;
use std::fmt;

/// Dense index of a block in the compilation arena.
#[derive(Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub struct BlockId(pub u32);

impl BlockId {
    #[must_use]
    pub fn index(self) -> usize {
        usize::try_from(self.0).unwrap_or(usize::MAX)
    }
}

impl fmt::Display for BlockId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "B{}", self.0)
    }
}

bitflags! {
    /// Block properties.
    #[derive(Clone, Copy, Debug, Eq, PartialEq)]
    pub struct BlockFlags: u8 {
        /// The method's standard entry block
        const STANDARD_ENTRY = 1 << 0;
        /// The on stack replacement entry block
        const OSR_ENTRY = 1 << 1;
        /// An exception handler entry
        const EXCEPTION_ENTRY = 1 << 2;
        /// Target of a backward branch
        const LOOP_HEADER = 1 << 3;
        /// The block's instructions have been built
        const VISITED = 1 << 4;
        /// The block is queued for abstract interpretation
        const ON_WORKLIST = 1 << 5;
        /// Synthetic monitor release block of a synchronized method
        const SYNC_UNWIND = 1 << 6;
    }
}

/// A basic block.
///
/// The block owns its instruction chain through `first`/`last` and the `next` links of its
/// values; the last instruction of a finished block is always a block end. Successors are
/// derived from the block end; the predecessor list is kept consistent with the forward edges
/// by the graph.
#[derive(Clone, Debug)]
pub struct Block {
    pub id: BlockId,
    /// First bytecode index of the block
    pub bci: u32,
    pub flags: BlockFlags,
    /// Frame state on entry, once an edge has been merged into the block
    pub state_before: Option<StateId>,
    pub first: Option<NodeId>,
    pub last: Option<NodeId>,
    /// Phis merging values at this block's entry
    pub phis: Vec<NodeId>,
    pub predecessors: Vec<BlockId>,
    pub successors: Vec<BlockId>,
    pub loop_depth: u32,
}

impl Block {
    /// Create an empty block.
    #[must_use]
    pub fn new(id: BlockId, bci: u32, flags: BlockFlags) -> Block {
        Block {
            id,
            bci,
            flags,
            state_before: None,
            first: None,
            last: None,
            phis: Vec::new(),
            predecessors: Vec::new(),
            successors: Vec::new(),
            loop_depth: 0,
        }
    }

    /// Return whether the block has been filled with instructions.
    #[must_use]
    pub fn is_visited(&self) -> bool {
        self.flags.contains(BlockFlags::VISITED)
    }

    /// Return whether the block is an exception handler entry.
    #[must_use]
    pub fn is_exception_entry(&self) -> bool {
        self.flags.contains(BlockFlags::EXCEPTION_ENTRY)
    }

    /// Return whether the block is a loop header.
    #[must_use]
    pub fn is_loop_header(&self) -> bool {
        self.flags.contains(BlockFlags::LOOP_HEADER)
    }

    /// Return the position of `predecessor` among this block's predecessors.
    #[must_use]
    pub fn predecessor_index(&self, predecessor: BlockId) -> Option<usize> {
        self.predecessors
            .iter()
            .position(|block| *block == predecessor)
    }
}

impl fmt::Display for Block {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} @{}", self.id, self.bci)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_new_block() {
        let block = Block::new(BlockId(3), 8, BlockFlags::LOOP_HEADER);
        assert_eq!(BlockId(3), block.id);
        assert_eq!(8, block.bci);
        assert!(block.is_loop_header());
        assert!(!block.is_visited());
        assert!(block.state_before.is_none());
        assert_eq!("B3 @8", block.to_string());
    }

    #[test]
    fn test_predecessor_index() {
        let mut block = Block::new(BlockId(0), 0, BlockFlags::empty());
        block.predecessors.push(BlockId(4));
        block.predecessors.push(BlockId(7));
        assert_eq!(Some(0), block.predecessor_index(BlockId(4)));
        assert_eq!(Some(1), block.predecessor_index(BlockId(7)));
        assert_eq!(None, block.predecessor_index(BlockId(9)));
    }
}
