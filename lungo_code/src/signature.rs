use crate::Error::InvalidMethodDescriptor;
use crate::error::Result;
use crate::kind::Kind;
use std::fmt;

/// A method signature: an ordered sequence of parameter kinds and one result kind.
///
/// Object and array descriptors both map to [`Kind::Object`]; the compiler does not model
/// source-language types beyond their kind.
///
/// See: <https://docs.oracle.com/javase/specs/jvms/se24/html/jvms-4.html#jvms-4.3.3>
#[derive(Clone, Debug, Eq, Hash, PartialEq)]
pub struct Signature {
    parameters: Vec<Kind>,
    return_kind: Kind,
}

impl Signature {
    /// Create a signature from parts.
    #[must_use]
    pub fn new(parameters: Vec<Kind>, return_kind: Kind) -> Signature {
        Signature {
            parameters,
            return_kind,
        }
    }

    /// Parse a JVM method descriptor into a signature.
    ///
    /// # Errors
    ///
    /// if the descriptor cannot be parsed
    pub fn parse(descriptor: &str) -> Result<Signature> {
        let mut chars = descriptor.chars().peekable();
        let mut parameters = Vec::new();

        if chars.next() != Some('(') {
            return Err(InvalidMethodDescriptor(descriptor.to_string()));
        }

        while let Some(&ch) = chars.peek() {
            if ch == ')' {
                chars.next();
                break;
            }
            parameters.push(Self::parse_kind(descriptor, &mut chars)?);
        }

        let return_kind = match chars.next() {
            Some('V') => Kind::Void,
            Some(ch) => Self::parse_kind(descriptor, &mut std::iter::once(ch).chain(chars))?,
            None => return Err(InvalidMethodDescriptor(descriptor.to_string())),
        };

        Ok(Signature {
            parameters,
            return_kind,
        })
    }

    /// Parse a single field descriptor into a kind, consuming object and array descriptors whole.
    fn parse_kind<I>(descriptor: &str, chars: &mut I) -> Result<Kind>
    where
        I: Iterator<Item = char>,
    {
        match chars.next() {
            Some('L') => {
                for ch in chars.by_ref() {
                    if ch == ';' {
                        return Ok(Kind::Object);
                    }
                }
                Err(InvalidMethodDescriptor(descriptor.to_string()))
            }
            Some('[') => {
                Self::parse_kind(descriptor, chars)?;
                Ok(Kind::Object)
            }
            Some('Z') => Ok(Kind::Boolean),
            Some('B') => Ok(Kind::Byte),
            Some('S') => Ok(Kind::Short),
            Some('C') => Ok(Kind::Char),
            Some('I') => Ok(Kind::Int),
            Some('J') => Ok(Kind::Long),
            Some('F') => Ok(Kind::Float),
            Some('D') => Ok(Kind::Double),
            _ => Err(InvalidMethodDescriptor(descriptor.to_string())),
        }
    }

    /// Return the parameter kinds, not including any receiver.
    #[must_use]
    pub fn parameters(&self) -> &[Kind] {
        &self.parameters
    }

    /// Return the result kind.
    #[must_use]
    pub fn return_kind(&self) -> Kind {
        self.return_kind
    }

    /// Return the argument kinds, prepending an `Object` receiver for instance methods.
    #[must_use]
    pub fn argument_kinds(&self, receiver: bool) -> Vec<Kind> {
        let mut kinds = Vec::with_capacity(self.parameters.len() + usize::from(receiver));
        if receiver {
            kinds.push(Kind::Object);
        }
        kinds.extend_from_slice(&self.parameters);
        kinds
    }

    /// Return the number of JVM frame slots the arguments occupy.
    #[must_use]
    pub fn argument_slots(&self, receiver: bool) -> u32 {
        let receiver_slots = u32::from(receiver);
        self.parameters
            .iter()
            .map(Kind::slots)
            .sum::<u32>()
            .saturating_add(receiver_slots)
    }
}

impl fmt::Display for Signature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "(")?;
        for (index, parameter) in self.parameters.iter().enumerate() {
            if index > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{parameter}")?;
        }
        write!(f, ") -> {}", self.return_kind)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_parse_void() -> Result<()> {
        let signature = Signature::parse("()V")?;
        assert!(signature.parameters().is_empty());
        assert_eq!(Kind::Void, signature.return_kind());
        Ok(())
    }

    #[test]
    fn test_parse_primitives() -> Result<()> {
        let signature = Signature::parse("(IJFD)I")?;
        assert_eq!(
            &[Kind::Int, Kind::Long, Kind::Float, Kind::Double],
            signature.parameters()
        );
        assert_eq!(Kind::Int, signature.return_kind());
        Ok(())
    }

    #[test]
    fn test_parse_objects_and_arrays() -> Result<()> {
        let signature = Signature::parse("(Ljava/lang/String;[I[[Ljava/lang/Object;)Ljava/lang/Object;")?;
        assert_eq!(
            &[Kind::Object, Kind::Object, Kind::Object],
            signature.parameters()
        );
        assert_eq!(Kind::Object, signature.return_kind());
        Ok(())
    }

    #[test]
    fn test_parse_invalid() {
        assert!(matches!(
            Signature::parse(""),
            Err(InvalidMethodDescriptor(_))
        ));
        assert!(matches!(
            Signature::parse("()"),
            Err(InvalidMethodDescriptor(_))
        ));
        assert!(matches!(
            Signature::parse("(Ljava/lang/String)V"),
            Err(InvalidMethodDescriptor(_))
        ));
    }

    #[test]
    fn test_argument_kinds_with_receiver() -> Result<()> {
        let signature = Signature::parse("(IJ)V")?;
        assert_eq!(
            vec![Kind::Object, Kind::Int, Kind::Long],
            signature.argument_kinds(true)
        );
        assert_eq!(vec![Kind::Int, Kind::Long], signature.argument_kinds(false));
        Ok(())
    }

    #[test]
    fn test_argument_slots() -> Result<()> {
        let signature = Signature::parse("(IJD)V")?;
        assert_eq!(5, signature.argument_slots(false));
        assert_eq!(6, signature.argument_slots(true));
        Ok(())
    }

    #[test]
    fn test_display() -> Result<()> {
        let signature = Signature::parse("(IJ)V")?;
        assert_eq!("(int, long) -> void", signature.to_string());
        Ok(())
    }

    #[test]
    fn test_signature_equality_is_elementwise() -> Result<()> {
        let first = Signature::parse("(Ljava/lang/String;I)V")?;
        let second = Signature::parse("(Ljava/lang/Object;I)V")?;
        // Different class names, same kind sequence
        assert_eq!(first, second);
        let third = Signature::parse("(JI)V")?;
        assert_ne!(first, third);
        Ok(())
    }
}
