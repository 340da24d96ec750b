//! Append-only code buffer with forward-patched labels.

use crate::Error::CodeBufferOverflow;
use crate::error::Result;
use crate::operand::ConstValue;
use byteorder::{ByteOrder, LittleEndian};
use std::fmt;

/// Upper bound on the size of one method's code.
pub const MAX_METHOD_CODE_SIZE: usize = 16 * 1024 * 1024;

/// A position in the code that may not be known yet.
///
/// A label is either *bound* to an offset or carries the list of 32-bit displacement sites that
/// are waiting for it. Binding patches every pending site. A label may be bound at most once;
/// rebinding to the same offset is idempotent, rebinding elsewhere is a programming error.
#[derive(Debug, Default)]
pub struct Label {
    position: Option<usize>,
    patch_positions: Vec<usize>,
}

impl Label {
    /// Create an unbound label.
    #[must_use]
    pub fn new() -> Label {
        Label::default()
    }

    /// Return whether the label has been bound.
    #[must_use]
    pub fn is_bound(&self) -> bool {
        self.position.is_some()
    }

    /// Return the bound offset.
    #[must_use]
    pub fn position(&self) -> Option<usize> {
        self.position
    }
}

/// The form of a relocation site.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum RelocationKind {
    /// A 32-bit displacement relative to the end of the patched word
    PcRelative32,
    /// A 64-bit absolute address
    Absolute64,
}

/// A site in the code the installer must fix up.
#[derive(Clone, Debug, PartialEq)]
pub struct Relocation {
    /// Offset of the patched word in the code
    pub position: usize,
    pub kind: RelocationKind,
    /// The constant the site refers to
    pub constant: ConstValue,
}

/// An append-only byte buffer the assembler writes machine code into.
///
/// Once [`finish`](CodeBuffer::finish)ed the bytes are immutable; all recorded positions are
/// in bounds by construction.
#[derive(Debug, Default)]
pub struct CodeBuffer {
    bytes: Vec<u8>,
    relocations: Vec<Relocation>,
}

impl CodeBuffer {
    /// Create an empty buffer.
    #[must_use]
    pub fn new() -> CodeBuffer {
        CodeBuffer::default()
    }

    /// Return the current emission position.
    #[must_use]
    pub fn position(&self) -> usize {
        self.bytes.len()
    }

    /// Check that the buffer has room for `additional` more bytes.
    ///
    /// # Errors
    ///
    /// if the buffer would exceed [`MAX_METHOD_CODE_SIZE`]
    pub fn check_capacity(&self, additional: usize) -> Result<()> {
        let requested = self.bytes.len().saturating_add(additional);
        if requested > MAX_METHOD_CODE_SIZE {
            return Err(CodeBufferOverflow {
                requested,
                limit: MAX_METHOD_CODE_SIZE,
            });
        }
        Ok(())
    }

    pub fn emit_u8(&mut self, value: u8) {
        self.bytes.push(value);
    }

    pub fn emit_u16(&mut self, value: u16) {
        self.bytes.extend_from_slice(&value.to_le_bytes());
    }

    pub fn emit_u32(&mut self, value: u32) {
        self.bytes.extend_from_slice(&value.to_le_bytes());
    }

    pub fn emit_u64(&mut self, value: u64) {
        self.bytes.extend_from_slice(&value.to_le_bytes());
    }

    pub fn emit_bytes(&mut self, bytes: &[u8]) {
        self.bytes.extend_from_slice(bytes);
    }

    /// Overwrite the 32-bit word at `position`.
    ///
    /// # Panics
    ///
    /// if the word is out of bounds
    pub fn patch_u32(&mut self, position: usize, value: u32) {
        assert!(
            position + 4 <= self.bytes.len(),
            "patch at {position} out of bounds"
        );
        LittleEndian::write_u32(&mut self.bytes[position..position + 4], value);
    }

    /// Read back the 32-bit word at `position`.
    ///
    /// # Panics
    ///
    /// if the word is out of bounds
    #[must_use]
    pub fn read_u32(&self, position: usize) -> u32 {
        assert!(
            position + 4 <= self.bytes.len(),
            "read at {position} out of bounds"
        );
        LittleEndian::read_u32(&self.bytes[position..position + 4])
    }

    /// Bind `label` to the current position, patching every pending site.
    ///
    /// # Panics
    ///
    /// if the label is already bound to a different offset
    pub fn bind(&mut self, label: &mut Label) {
        let position = self.position();
        if let Some(bound) = label.position {
            assert_eq!(
                bound, position,
                "label already bound at {bound}, rebinding at {position}"
            );
            return;
        }
        label.position = Some(position);
        for site in label.patch_positions.drain(..) {
            let displacement = i64::try_from(position).unwrap_or(i64::MAX)
                - i64::try_from(site + 4).unwrap_or(0);
            let displacement = i32::try_from(displacement).unwrap_or_else(|_| {
                panic!("label displacement out of range at {site}");
            });
            LittleEndian::write_i32(
                &mut self.bytes[site..site + 4],
                displacement,
            );
        }
    }

    /// Emit a 32-bit displacement to `label`, recording a patch site if it is unbound.
    ///
    /// # Panics
    ///
    /// if the displacement overflows 32 bits
    pub fn emit_rel32(&mut self, label: &mut Label) {
        let site = self.position();
        match label.position {
            Some(position) => {
                let displacement = i64::try_from(position).unwrap_or(0)
                    - i64::try_from(site + 4).unwrap_or(0);
                let displacement = i32::try_from(displacement).unwrap_or_else(|_| {
                    panic!("label displacement out of range at {site}");
                });
                self.emit_u32(displacement.cast_unsigned());
            }
            None => {
                label.patch_positions.push(site);
                self.emit_u32(0);
            }
        }
    }

    /// Record a relocation for the word most recently emitted.
    pub fn record_relocation(&mut self, position: usize, kind: RelocationKind, constant: ConstValue) {
        self.relocations.push(Relocation {
            position,
            kind,
            constant,
        });
    }

    /// Return the recorded relocations.
    #[must_use]
    pub fn relocations(&self) -> &[Relocation] {
        &self.relocations
    }

    /// Finish emission, returning the immutable code bytes and relocations.
    #[must_use]
    pub fn finish(self) -> (Vec<u8>, Vec<Relocation>) {
        (self.bytes, self.relocations)
    }

    /// Return the bytes emitted so far.
    #[must_use]
    pub fn bytes(&self) -> &[u8] {
        &self.bytes
    }
}

impl fmt::Display for CodeBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "code[{} bytes]", self.bytes.len())
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_emission_positions() {
        let mut buffer = CodeBuffer::new();
        assert_eq!(0, buffer.position());
        buffer.emit_u8(0x90);
        buffer.emit_u32(0xdead_beef);
        assert_eq!(5, buffer.position());
        assert_eq!(&[0x90, 0xef, 0xbe, 0xad, 0xde], buffer.bytes());
    }

    #[test]
    fn test_backward_label() {
        let mut buffer = CodeBuffer::new();
        let mut label = Label::new();
        buffer.emit_u8(0x90);
        buffer.bind(&mut label);
        assert_eq!(Some(1), label.position());
        buffer.emit_u8(0xe9);
        buffer.emit_rel32(&mut label);
        // Displacement from end of the word (position 6) back to 1
        assert_eq!((-5i32).cast_unsigned(), buffer.read_u32(2));
    }

    #[test]
    fn test_forward_label_is_patched_on_bind() {
        let mut buffer = CodeBuffer::new();
        let mut label = Label::new();
        buffer.emit_u8(0xe9);
        buffer.emit_rel32(&mut label);
        assert_eq!(0, buffer.read_u32(1));
        buffer.emit_u8(0x90);
        buffer.bind(&mut label);
        // Displacement from position 5 to position 6
        assert_eq!(1, buffer.read_u32(1));
    }

    #[test]
    fn test_forward_and_backward_agree() {
        // Binding before use and after use decode to the same offset
        let mut forward = CodeBuffer::new();
        let mut label = Label::new();
        forward.emit_rel32(&mut label);
        forward.emit_u8(0x90);
        forward.bind(&mut label);
        let forward_displacement = forward.read_u32(0).cast_signed();
        assert_eq!(5, 4 + 1 + forward_displacement);

        let mut backward = CodeBuffer::new();
        let mut target = Label::new();
        backward.emit_u8(0x90);
        backward.bind(&mut target);
        backward.emit_rel32(&mut target);
        let backward_displacement = backward.read_u32(1).cast_signed();
        assert_eq!(1, 1 + 4 + backward_displacement);
    }

    #[test]
    fn test_rebind_same_offset_is_idempotent() {
        let mut buffer = CodeBuffer::new();
        let mut label = Label::new();
        buffer.emit_u8(0x90);
        buffer.bind(&mut label);
        buffer.bind(&mut label);
        assert_eq!(Some(1), label.position());
    }

    #[test]
    #[should_panic(expected = "label already bound")]
    fn test_rebind_elsewhere_is_fatal() {
        let mut buffer = CodeBuffer::new();
        let mut label = Label::new();
        buffer.bind(&mut label);
        buffer.emit_u8(0x90);
        buffer.bind(&mut label);
    }

    #[test]
    fn test_capacity_check() {
        let buffer = CodeBuffer::new();
        assert!(buffer.check_capacity(64).is_ok());
        assert_eq!(
            Err(CodeBufferOverflow {
                requested: MAX_METHOD_CODE_SIZE + 1,
                limit: MAX_METHOD_CODE_SIZE,
            }),
            buffer.check_capacity(MAX_METHOD_CODE_SIZE + 1)
        );
    }

    #[test]
    fn test_relocations() {
        let mut buffer = CodeBuffer::new();
        buffer.emit_u64(0);
        buffer.record_relocation(0, RelocationKind::Absolute64, ConstValue::Word(0x1234));
        let (bytes, relocations) = buffer.finish();
        assert_eq!(8, bytes.len());
        assert_eq!(1, relocations.len());
        assert_eq!(RelocationKind::Absolute64, relocations[0].kind);
    }
}
