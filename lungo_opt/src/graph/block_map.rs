//! Basic block discovery.
//!
//! One pass over the bytecode records a block start at every branch target, exception handler
//! entry and fall-through point after a branch. A second pass over the backward branches marks
//! loop headers and computes the set of locals stored inside loops, which later limits phi
//! insertion at loop headers to locals that can actually change.

use crate::hir::{BlockFlags, BlockId, Ir};
use indexmap::IndexMap;
use lungo_code::{Bytecode, ExceptionHandler, RefMap};

/// The block structure of one method's bytecode.
#[derive(Debug)]
pub struct BlockMap {
    /// Block for each block start bytecode index, in ascending start order
    pub block_at: IndexMap<u32, BlockId>,
    /// Sorted block start indices
    pub starts: Vec<u32>,
    /// Locals stored to inside any loop body
    pub stores_in_loops: RefMap,
}

impl BlockMap {
    /// Return whether `bci` starts a block.
    #[must_use]
    pub fn is_start(&self, bci: u32) -> bool {
        self.block_at.contains_key(&bci)
    }

    /// Register an extra block created during parsing (an inlining continuation).
    pub fn insert(&mut self, bci: u32, block: BlockId) {
        self.block_at.insert(bci, block);
        if let Err(position) = self.starts.binary_search(&bci) {
            self.starts.insert(position, bci);
        }
    }
}

/// Discover the blocks of `code` and create them in `ir`.
///
/// With `force_loop_phis` set every local counts as stored in loops, forcing full phi rows at
/// loop headers; the OSR entry path needs this to join with arbitrary buffer values.
pub fn build_block_map(
    ir: &mut Ir,
    code: &[(u32, Bytecode)],
    handlers: &[ExceptionHandler],
    max_locals: usize,
    force_loop_phis: bool,
) -> BlockMap {
    let mut starts: Vec<u32> = vec![0];
    let mut loop_headers: Vec<u32> = Vec::new();
    let mut stores_in_loops = RefMap::new(max_locals);

    for (bci, bytecode) in code {
        if bytecode.is_branch() {
            for target in bytecode.branch_targets() {
                starts.push(target);
                if target <= *bci {
                    loop_headers.push(target);
                    record_loop_stores(code, target, *bci, &mut stores_in_loops);
                }
            }
            // The instruction after a branch starts a new block
            if let Some(next) = next_bci(code, *bci) {
                starts.push(next);
            }
        }
    }
    for handler in handlers {
        starts.push(handler.handler_bci);
    }
    starts.sort_unstable();
    starts.dedup();
    // A start must fall on an instruction; the slot after a trailing branch has none
    starts.retain(|bci| code.iter().any(|(at, _)| at == bci));

    if force_loop_phis {
        for index in 0..max_locals {
            stores_in_loops.set(index);
        }
    }

    let handler_bcis: Vec<u32> = handlers.iter().map(|handler| handler.handler_bci).collect();
    let mut block_at = IndexMap::new();
    for bci in &starts {
        let mut flags = BlockFlags::empty();
        if loop_headers.contains(bci) {
            flags |= BlockFlags::LOOP_HEADER;
        }
        if handler_bcis.contains(bci) {
            flags |= BlockFlags::EXCEPTION_ENTRY;
        }
        let block = ir.new_block(*bci, flags);
        block_at.insert(*bci, block);
    }

    BlockMap {
        block_at,
        starts,
        stores_in_loops,
    }
}

/// Record the locals stored between a loop header and the backward branch that closes it.
fn record_loop_stores(code: &[(u32, Bytecode)], header: u32, latch: u32, stores: &mut RefMap) {
    for (bci, bytecode) in code {
        if *bci < header || *bci > latch {
            continue;
        }
        let index = match bytecode {
            Bytecode::Store(kind, index) => {
                if kind.slots() == 2 && usize::from(*index) + 1 < stores.len() {
                    stores.set(usize::from(*index) + 1);
                }
                Some(usize::from(*index))
            }
            Bytecode::Iinc(index, _) => Some(usize::from(*index)),
            _ => None,
        };
        if let Some(index) = index
            && index < stores.len()
        {
            stores.set(index);
        }
    }
}

/// Return the bytecode index following `bci`.
fn next_bci(code: &[(u32, Bytecode)], bci: u32) -> Option<u32> {
    let position = code.iter().position(|(at, _)| *at == bci)?;
    code.get(position + 1).map(|(at, _)| *at)
}

#[cfg(test)]
mod test {
    use super::*;
    use lungo_code::{Condition, Kind};

    fn loop_code() -> Vec<(u32, Bytecode)> {
        // 0: iconst_0, 1: istore_1, 2: iload_1, 3: if >= 10 (-> 10), 6: iinc 1, 7: goto 2,
        // 10: return
        vec![
            (0, Bytecode::Iconst(0)),
            (1, Bytecode::Store(Kind::Int, 1)),
            (2, Bytecode::Load(Kind::Int, 1)),
            (3, Bytecode::If(Condition::GreaterEqual, 10)),
            (6, Bytecode::Iinc(1, 1)),
            (7, Bytecode::Goto(2)),
            (10, Bytecode::Return(Kind::Void)),
        ]
    }

    #[test]
    fn test_discovers_branch_targets_and_fall_throughs() {
        let mut ir = Ir::new();
        let map = build_block_map(&mut ir, &loop_code(), &[], 2, false);
        assert_eq!(vec![0, 2, 6, 10], map.starts);
        assert!(map.is_start(2));
        assert!(!map.is_start(7));
    }

    #[test]
    fn test_marks_loop_headers() {
        let mut ir = Ir::new();
        let map = build_block_map(&mut ir, &loop_code(), &[], 2, false);
        let header = map.block_at[&2];
        assert!(ir.block(header).is_loop_header());
        let entry = map.block_at[&0];
        assert!(!ir.block(entry).is_loop_header());
    }

    #[test]
    fn test_stores_in_loops() {
        let mut ir = Ir::new();
        let map = build_block_map(&mut ir, &loop_code(), &[], 2, false);
        // Local 1 is incremented inside the loop, local 0 never stored
        assert!(map.stores_in_loops.get(1));
        assert!(!map.stores_in_loops.get(0));
    }

    #[test]
    fn test_force_loop_phis() {
        let mut ir = Ir::new();
        let map = build_block_map(&mut ir, &loop_code(), &[], 2, true);
        assert!(map.stores_in_loops.get(0));
        assert!(map.stores_in_loops.get(1));
    }

    #[test]
    fn test_handler_entries_are_blocks() {
        let mut ir = Ir::new();
        let code = vec![
            (0, Bytecode::Iconst(0)),
            (1, Bytecode::Return(Kind::Int)),
            (2, Bytecode::Iconst(-1)),
            (3, Bytecode::Return(Kind::Int)),
        ];
        let handlers = vec![ExceptionHandler {
            start_bci: 0,
            end_bci: 2,
            handler_bci: 2,
            catch_type: None,
        }];
        let map = build_block_map(&mut ir, &code, &handlers, 1, false);
        assert!(map.is_start(2));
        let handler = map.block_at[&2];
        assert!(ir.block(handler).is_exception_entry());
    }
}
