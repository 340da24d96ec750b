//! Signature keys for the adapter cache.

use crate::error::Result;
use lungo_code::{Kind, Method};
use std::fmt;

/// The argument kind sequence an adapter is keyed by.
///
/// Two methods share an adapter exactly when their argument kinds are equal element-wise,
/// receiver included. Results never participate: all calling conventions return results in the
/// same location.
#[derive(Clone, Debug, Eq, Hash, PartialEq)]
pub struct Sig {
    kinds: Vec<Kind>,
}

impl Sig {
    /// Create a signature key from raw kinds.
    #[must_use]
    pub fn new(kinds: Vec<Kind>) -> Sig {
        let kinds = kinds.into_iter().map(|kind| kind.stack_kind()).collect();
        Sig { kinds }
    }

    /// Build the key for `method`, prepending the receiver kind for instance methods.
    ///
    /// # Errors
    ///
    /// if the method descriptor cannot be parsed
    pub fn for_method(method: &Method) -> Result<Sig> {
        let signature = method.signature()?;
        Ok(Sig::new(signature.argument_kinds(method.has_receiver())))
    }

    /// The argument kinds.
    #[must_use]
    pub fn kinds(&self) -> &[Kind] {
        &self.kinds
    }

    /// Total JVM slots the arguments occupy.
    #[must_use]
    pub fn slot_count(&self) -> u32 {
        self.kinds.iter().map(Kind::slots).sum()
    }
}

impl fmt::Display for Sig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for kind in &self.kinds {
            write!(f, "{}", kind.code())?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use lungo_code::{ConstantPool, MethodFlags};

    fn method(descriptor: &str, flags: MethodFlags) -> Method {
        Method {
            holder: "Foo".to_string(),
            name: "bar".to_string(),
            descriptor: descriptor.to_string(),
            flags,
            code: Vec::new(),
            max_stack: 0,
            max_locals: 0,
            constant_pool: ConstantPool::new(),
            exception_handlers: Vec::new(),
            line_numbers: Vec::new(),
        }
    }

    #[test]
    fn test_static_signature() -> Result<()> {
        let sig = Sig::for_method(&method("(IJ)V", MethodFlags::STATIC))?;
        assert_eq!(&[Kind::Int, Kind::Long], sig.kinds());
        assert_eq!(3, sig.slot_count());
        assert_eq!("ij", sig.to_string());
        Ok(())
    }

    #[test]
    fn test_receiver_is_included() -> Result<()> {
        let sig = Sig::for_method(&method("(I)V", MethodFlags::empty()))?;
        assert_eq!(&[Kind::Object, Kind::Int], sig.kinds());
        Ok(())
    }

    #[test]
    fn test_sub_int_kinds_fold_to_int() {
        let first = Sig::new(vec![Kind::Byte, Kind::Boolean]);
        let second = Sig::new(vec![Kind::Int, Kind::Int]);
        assert_eq!(first, second);
    }

    #[test]
    fn test_equality_is_elementwise() -> Result<()> {
        let first = Sig::for_method(&method("(Ljava/lang/String;I)V", MethodFlags::STATIC))?;
        let second = Sig::for_method(&method("(Ljava/lang/Object;I)I", MethodFlags::STATIC))?;
        assert_eq!(first, second);
        let third = Sig::for_method(&method("(JI)V", MethodFlags::STATIC))?;
        assert_ne!(first, third);
        Ok(())
    }
}
