//! The method descriptor the compiler consumes.
//!
//! A [`Method`] carries everything the compiler needs from the class file: flags, the raw
//! bytecode blob, the constant pool, the exception table and the line number table. Resolution
//! of pool entries against loaded classes goes through the runtime interface; the pool itself
//! only models the entry shapes.

use crate::Error::InvalidConstantIndex;
use crate::error::Result;
use crate::signature::Signature;
use bitflags::bitflags;
use std::fmt;

bitflags! {
    /// Method properties the compiler cares about.
    #[derive(Clone, Copy, Debug, Eq, PartialEq)]
    pub struct MethodFlags: u16 {
        const STATIC = 1 << 0;
        const SYNCHRONIZED = 1 << 1;
        const NATIVE = 1 << 2;
        /// The method must not contain safepoints
        const NO_SAFEPOINTS = 1 << 3;
        /// The method is itself a calling convention adapter
        const ADAPTER = 1 << 4;
        /// The method is a baseline compiler template
        const TEMPLATE = 1 << 5;
        /// The method is a native entry stub
        const NATIVE_STUB = 1 << 6;
    }
}

/// One entry of the exception table, in bytecode index terms.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct ExceptionHandler {
    /// First covered bytecode index
    pub start_bci: u32,
    /// First bytecode index no longer covered
    pub end_bci: u32,
    /// Handler entry bytecode index
    pub handler_bci: u32,
    /// Constant pool index of the caught class; `None` catches everything
    pub catch_type: Option<u16>,
}

impl ExceptionHandler {
    /// Return whether this handler covers `bci`.
    #[must_use]
    pub fn covers(&self, bci: u32) -> bool {
        self.start_bci <= bci && bci < self.end_bci
    }
}

/// A constant pool entry.
///
/// See: <https://docs.oracle.com/javase/specs/jvms/se24/html/jvms-4.html#jvms-4.4>
#[derive(Clone, Debug, PartialEq)]
pub enum Constant {
    Integer(i32),
    Long(i64),
    Float(f32),
    Double(f64),
    String(String),
    Class(String),
    FieldRef {
        class: String,
        name: String,
        descriptor: String,
    },
    MethodRef {
        class: String,
        name: String,
        descriptor: String,
    },
    InterfaceMethodRef {
        class: String,
        name: String,
        descriptor: String,
    },
}

/// The constant pool of a method's holder.
///
/// Entries are addressed with the class file's one-based indices; index zero is unused.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct ConstantPool {
    entries: Vec<Option<Constant>>,
}

impl ConstantPool {
    /// Create an empty constant pool.
    #[must_use]
    pub fn new() -> ConstantPool {
        ConstantPool {
            entries: vec![None],
        }
    }

    /// Append an entry and return its index.
    ///
    /// Category-2 entries (long, double) occupy two indices, the second unusable, matching the
    /// class file layout.
    pub fn push(&mut self, constant: Constant) -> u16 {
        let index = u16::try_from(self.entries.len()).unwrap_or(u16::MAX);
        let category_2 = matches!(constant, Constant::Long(..) | Constant::Double(..));
        self.entries.push(Some(constant));
        if category_2 {
            self.entries.push(None);
        }
        index
    }

    /// Return the entry at `index`.
    ///
    /// # Errors
    ///
    /// if the index does not reference a valid entry
    pub fn try_get(&self, index: u16) -> Result<&Constant> {
        self.entries
            .get(usize::from(index))
            .and_then(Option::as_ref)
            .ok_or(InvalidConstantIndex(index))
    }

    /// Return the number of index slots in the pool, including the unused zero slot.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Return whether the pool holds no entries.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.len() <= 1
    }
}

/// Everything the compiler needs to know about one method.
#[derive(Clone, Debug)]
pub struct Method {
    /// Internal name of the holder class
    pub holder: String,
    pub name: String,
    /// JVM method descriptor
    pub descriptor: String,
    pub flags: MethodFlags,
    /// Raw bytecode of the Code attribute
    pub code: Vec<u8>,
    pub max_stack: u16,
    pub max_locals: u16,
    pub constant_pool: ConstantPool,
    pub exception_handlers: Vec<ExceptionHandler>,
    /// (bytecode index, source line) pairs
    pub line_numbers: Vec<(u32, u16)>,
}

impl Method {
    /// Return the parsed signature of the method.
    ///
    /// # Errors
    ///
    /// if the descriptor cannot be parsed
    pub fn signature(&self) -> Result<Signature> {
        Signature::parse(&self.descriptor)
    }

    /// Return whether the method is static.
    #[must_use]
    pub fn is_static(&self) -> bool {
        self.flags.contains(MethodFlags::STATIC)
    }

    /// Return whether the method is synchronized.
    #[must_use]
    pub fn is_synchronized(&self) -> bool {
        self.flags.contains(MethodFlags::SYNCHRONIZED)
    }

    /// Return whether the method takes a receiver.
    #[must_use]
    pub fn has_receiver(&self) -> bool {
        !self.is_static()
    }

    /// Return whether safepoints are forbidden in this method.
    #[must_use]
    pub fn no_safepoints(&self) -> bool {
        self.flags.contains(MethodFlags::NO_SAFEPOINTS)
    }

    /// Return whether this method has only one calling convention and is never adapted.
    #[must_use]
    pub fn single_convention(&self) -> bool {
        self.flags.intersects(
            MethodFlags::ADAPTER | MethodFlags::TEMPLATE | MethodFlags::NATIVE_STUB,
        )
    }

    /// Return the source line for a bytecode index, if the table has one.
    #[must_use]
    pub fn line_for(&self, bci: u32) -> Option<u16> {
        self.line_numbers
            .iter()
            .take_while(|(start, _)| *start <= bci)
            .last()
            .map(|(_, line)| *line)
    }
}

impl fmt::Display for Method {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}{}", self.holder, self.name, self.descriptor)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn method() -> Method {
        Method {
            holder: "java/lang/Math".to_string(),
            name: "max".to_string(),
            descriptor: "(II)I".to_string(),
            flags: MethodFlags::STATIC,
            code: Vec::new(),
            max_stack: 2,
            max_locals: 2,
            constant_pool: ConstantPool::new(),
            exception_handlers: Vec::new(),
            line_numbers: vec![(0, 10), (4, 11)],
        }
    }

    #[test]
    fn test_constant_pool_indices() -> Result<()> {
        let mut pool = ConstantPool::new();
        let int_index = pool.push(Constant::Integer(42));
        let long_index = pool.push(Constant::Long(7));
        let string_index = pool.push(Constant::String("hi".to_string()));
        assert_eq!(1, int_index);
        assert_eq!(2, long_index);
        // Long occupies two slots
        assert_eq!(4, string_index);
        assert_eq!(&Constant::Integer(42), pool.try_get(int_index)?);
        assert_eq!(&Constant::Long(7), pool.try_get(long_index)?);
        assert_eq!(Err(InvalidConstantIndex(3)), pool.try_get(3));
        assert_eq!(Err(InvalidConstantIndex(0)), pool.try_get(0));
        Ok(())
    }

    #[test]
    fn test_method_queries() -> Result<()> {
        let method = method();
        assert!(method.is_static());
        assert!(!method.is_synchronized());
        assert!(!method.has_receiver());
        let signature = method.signature()?;
        assert_eq!(2, signature.parameters().len());
        assert_eq!("java/lang/Math.max(II)I", method.to_string());
        Ok(())
    }

    #[test]
    fn test_line_for() {
        let method = method();
        assert_eq!(Some(10), method.line_for(0));
        assert_eq!(Some(10), method.line_for(3));
        assert_eq!(Some(11), method.line_for(4));
        assert_eq!(Some(11), method.line_for(100));
    }

    #[test]
    fn test_exception_handler_covers() {
        let handler = ExceptionHandler {
            start_bci: 4,
            end_bci: 10,
            handler_bci: 12,
            catch_type: None,
        };
        assert!(!handler.covers(3));
        assert!(handler.covers(4));
        assert!(handler.covers(9));
        assert!(!handler.covers(10));
    }

    #[test]
    fn test_single_convention() {
        let mut method = method();
        assert!(!method.single_convention());
        method.flags |= MethodFlags::ADAPTER;
        assert!(method.single_convention());
    }
}
