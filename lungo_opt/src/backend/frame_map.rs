//! Frame layout and operand assignment.
//!
//! Operand assignment is a spill-everything policy: every virtual variable gets its own frame
//! slot and operations run through a small set of scratch registers. The layout below the
//! frame pointer is spill slots, then monitor slots, then raw stack allocations, with the
//! outgoing argument area at the stack pointer.

use lungo_code::{Kind, RefMap, Target, Variable};

/// Size of one monitor slot: the locked object and the lock word.
const MONITOR_SLOT_SIZE: i32 = 16;

/// The frame layout of one compiled method.
#[derive(Debug)]
pub struct FrameMap {
    /// Frame size in bytes, excluding the return address and the saved frame pointer
    pub frame_size: i32,
    variables: Vec<Kind>,
    monitor_count: i32,
    stack_alloc_bytes: i32,
    outgoing_slots: i32,
    /// Frame words (indexed from the stack pointer) holding object references
    object_slots: RefMap,
}

impl FrameMap {
    /// Lay out the frame for `variables` spill slots, `max_locks` monitors, raw allocations
    /// and the outgoing argument area.
    #[must_use]
    pub fn build(
        variables: &[Kind],
        max_locks: u32,
        stack_alloc_bytes: i32,
        max_outgoing_slots: i32,
        target: &Target,
    ) -> FrameMap {
        let spill_bytes = i32::try_from(variables.len()).unwrap_or(i32::MAX) * 8;
        let monitor_count = i32::try_from(max_locks).unwrap_or(i32::MAX);
        let raw = spill_bytes
            + monitor_count * MONITOR_SLOT_SIZE
            + stack_alloc_bytes
            + max_outgoing_slots * 8;
        let frame_size = target.align_frame_size(raw);
        let words = usize::try_from(frame_size / 8).unwrap_or(0);
        let mut object_slots = RefMap::new(words);
        for (index, kind) in variables.iter().enumerate() {
            if kind.is_object() {
                let offset = frame_size - 8 * (i32::try_from(index).unwrap_or(i32::MAX) + 1);
                object_slots.set(usize::try_from(offset / 8).unwrap_or(usize::MAX));
            }
        }
        FrameMap {
            frame_size,
            variables: variables.to_vec(),
            monitor_count,
            stack_alloc_bytes,
            outgoing_slots: max_outgoing_slots,
            object_slots,
        }
    }

    fn spill_offset_by_index(&self, index: usize) -> i32 {
        -8 * (i32::try_from(index).unwrap_or(i32::MAX) + 1)
    }

    /// Frame pointer relative offset of a variable's spill slot.
    ///
    /// # Panics
    ///
    /// if the variable was not allocated
    #[must_use]
    pub fn spill_offset(&self, variable: Variable) -> i32 {
        let index = usize::try_from(variable.index).unwrap_or(usize::MAX);
        assert!(index < self.variables.len(), "unallocated variable {variable}");
        self.spill_offset_by_index(index)
    }

    /// Frame pointer relative offset of a monitor slot.
    ///
    /// # Panics
    ///
    /// if the lock number is out of range
    #[must_use]
    pub fn monitor_offset(&self, lock: u32) -> i32 {
        let lock = i32::try_from(lock).unwrap_or(i32::MAX);
        assert!(lock < self.monitor_count, "monitor {lock} out of range");
        let spill_bytes = i32::try_from(self.variables.len()).unwrap_or(i32::MAX) * 8;
        -(spill_bytes + MONITOR_SLOT_SIZE * (lock + 1))
    }

    /// Frame pointer relative offset of a raw stack allocation.
    ///
    /// # Panics
    ///
    /// if the allocation offset is out of range
    #[must_use]
    pub fn stack_alloc_offset(&self, offset: i32) -> i32 {
        assert!(offset < self.stack_alloc_bytes, "allocation {offset} out of range");
        let spill_bytes = i32::try_from(self.variables.len()).unwrap_or(i32::MAX) * 8;
        -(spill_bytes + MONITOR_SLOT_SIZE * self.monitor_count + self.stack_alloc_bytes) + offset
    }

    /// Stack pointer relative offset of an outgoing argument slot.
    #[must_use]
    pub fn outgoing_offset(slot: i32) -> i32 {
        slot * 8
    }

    /// Frame pointer relative offset of an incoming stack argument.
    #[must_use]
    pub fn incoming_offset(slot: i32) -> i32 {
        16 + slot * 8
    }

    /// Map a frame pointer relative offset to a stack map word index.
    #[must_use]
    pub fn word_index(&self, rbp_offset: i32) -> usize {
        usize::try_from((self.frame_size + rbp_offset) / 8).unwrap_or(usize::MAX)
    }

    /// The frame words holding object spill slots.
    #[must_use]
    pub fn object_slots(&self) -> &RefMap {
        &self.object_slots
    }

    /// Build the stack map for a stop position: object spill slots plus the given outgoing
    /// argument slots.
    #[must_use]
    pub fn stack_map(&self, pointer_slots: &[i32]) -> RefMap {
        let mut map = self.object_slots.clone();
        for slot in pointer_slots {
            let word = usize::try_from(Self::outgoing_offset(*slot) / 8).unwrap_or(usize::MAX);
            if word < map.len() {
                map.set(word);
            }
        }
        map
    }

    /// Offsets of all object spill slots, for the prologue to clear.
    #[must_use]
    pub fn object_spill_offsets(&self) -> Vec<i32> {
        self.variables
            .iter()
            .enumerate()
            .filter(|(_, kind)| kind.is_object())
            .map(|(index, _)| self.spill_offset_by_index(index))
            .collect()
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_layout() {
        let target = Target::amd64();
        let variables = [Kind::Int, Kind::Object, Kind::Long];
        let map = FrameMap::build(&variables, 1, 8, 2, &target);
        // 24 spill + 16 monitor + 8 alloc + 16 outgoing = 64
        assert_eq!(64, map.frame_size);
        assert_eq!(-8, map.spill_offset(Variable { index: 0, kind: Kind::Int }));
        assert_eq!(-24, map.spill_offset(Variable { index: 2, kind: Kind::Long }));
        assert_eq!(-40, map.monitor_offset(0));
        assert_eq!(-48, map.stack_alloc_offset(0));
        assert_eq!(8, FrameMap::outgoing_offset(1));
        assert_eq!(24, FrameMap::incoming_offset(1));
    }

    #[test]
    fn test_frame_is_aligned() {
        let target = Target::amd64();
        let map = FrameMap::build(&[Kind::Int], 0, 0, 0, &target);
        assert_eq!(16, map.frame_size);
        assert_eq!(0, map.frame_size % target.stack_alignment);
    }

    #[test]
    fn test_object_slots() {
        let target = Target::amd64();
        let variables = [Kind::Int, Kind::Object, Kind::Object];
        let map = FrameMap::build(&variables, 0, 0, 0, &target);
        // Frame size 32: var 1 at rbp-16 -> word 2, var 2 at rbp-24 -> word 1
        assert_eq!(32, map.frame_size);
        assert!(map.object_slots().get(2));
        assert!(map.object_slots().get(1));
        assert!(!map.object_slots().get(3));
        assert_eq!(2, map.object_slots().count());
    }

    #[test]
    fn test_stack_map_marks_outgoing_pointers() {
        let target = Target::amd64();
        let map = FrameMap::build(&[Kind::Object], 0, 0, 2, &target);
        let stack_map = map.stack_map(&[1]);
        // Outgoing slot 1 is word 1
        assert!(stack_map.get(1));
        assert!(!stack_map.get(0));
    }
}
