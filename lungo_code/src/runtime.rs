//! The interface through which the compiler queries the surrounding runtime.
//!
//! The compiler never touches VM data structures directly: field offsets, object layout,
//! resolved methods and classes, and the XIR templates for object operations all come through
//! [`Runtime`]. Resolution queries return `None` for entries the runtime cannot resolve yet;
//! whether that turns into a bailout is the compiler's decision.

use crate::bytecode::InvokeKind;
use crate::kind::Kind;
use crate::method::{ConstantPool, Method, MethodFlags};
use crate::operand::ObjectHandle;
use crate::signature::Signature;
use crate::xir::XirGenerator;
use std::fmt;
use std::sync::Arc;

/// Calls into the runtime that emitted code may perform.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub enum RuntimeCall {
    UnwindException,
    Deoptimize,
    AllocateInstance,
    AllocateArray,
    AllocateMultiArray,
    ResolveClass,
    MonitorEnter,
    MonitorExit,
    CheckCast,
    InstanceOf,
    ArrayStoreCheck,
    ArithmeticSin,
    ArithmeticCos,
    ArithmeticTan,
    ArithmeticLog,
    ArithmeticLog10,
    ArithmeticFrem,
    ArithmeticDrem,
    NanoTime,
    CurrentTimeMillis,
}

impl RuntimeCall {
    /// Return the kind of the call's result.
    #[must_use]
    pub fn result_kind(&self) -> Kind {
        match self {
            RuntimeCall::UnwindException
            | RuntimeCall::Deoptimize
            | RuntimeCall::MonitorEnter
            | RuntimeCall::MonitorExit
            | RuntimeCall::CheckCast
            | RuntimeCall::ArrayStoreCheck => Kind::Void,
            RuntimeCall::AllocateInstance
            | RuntimeCall::AllocateArray
            | RuntimeCall::AllocateMultiArray
            | RuntimeCall::ResolveClass => Kind::Object,
            RuntimeCall::InstanceOf => Kind::Int,
            RuntimeCall::ArithmeticSin
            | RuntimeCall::ArithmeticCos
            | RuntimeCall::ArithmeticTan
            | RuntimeCall::ArithmeticLog
            | RuntimeCall::ArithmeticLog10
            | RuntimeCall::ArithmeticDrem => Kind::Double,
            RuntimeCall::ArithmeticFrem => Kind::Float,
            RuntimeCall::NanoTime | RuntimeCall::CurrentTimeMillis => Kind::Long,
        }
    }

    /// Return the kinds of the call's arguments.
    #[must_use]
    pub fn argument_kinds(&self) -> &'static [Kind] {
        match self {
            RuntimeCall::UnwindException => &[Kind::Object],
            RuntimeCall::Deoptimize | RuntimeCall::NanoTime | RuntimeCall::CurrentTimeMillis => {
                &[]
            }
            RuntimeCall::AllocateInstance => &[Kind::Object],
            RuntimeCall::AllocateArray => &[Kind::Object, Kind::Int],
            RuntimeCall::AllocateMultiArray => &[Kind::Object, Kind::Word, Kind::Int],
            RuntimeCall::ResolveClass => &[Kind::Object, Kind::Int],
            RuntimeCall::MonitorEnter | RuntimeCall::MonitorExit => &[Kind::Object],
            RuntimeCall::CheckCast | RuntimeCall::InstanceOf => &[Kind::Object, Kind::Object],
            RuntimeCall::ArrayStoreCheck => &[Kind::Object, Kind::Object],
            RuntimeCall::ArithmeticSin
            | RuntimeCall::ArithmeticCos
            | RuntimeCall::ArithmeticTan
            | RuntimeCall::ArithmeticLog
            | RuntimeCall::ArithmeticLog10 => &[Kind::Double],
            RuntimeCall::ArithmeticFrem => &[Kind::Float, Kind::Float],
            RuntimeCall::ArithmeticDrem => &[Kind::Double, Kind::Double],
        }
    }
}

impl fmt::Display for RuntimeCall {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{self:?}")
    }
}

/// Out of line trap stubs shared by all compiled methods.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub enum StubId {
    ThrowNullPointerException,
    ThrowArrayIndexOutOfBoundsException,
    ThrowArithmeticException,
    ThrowClassCastException,
    ThrowArrayStoreException,
}

impl fmt::Display for StubId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{self:?}")
    }
}

/// A resolved field.
#[derive(Clone, Debug, PartialEq)]
pub struct FieldInfo {
    /// Offset of the field from the object origin, or from the static tuple for static fields
    pub offset: i32,
    pub kind: Kind,
    pub is_volatile: bool,
    pub is_static: bool,
    /// The static tuple holding the field, for static fields
    pub static_base: Option<ObjectHandle>,
}

/// A resolved class.
#[derive(Clone, Debug, PartialEq)]
pub struct ClassInfo {
    /// Handle to the class's hub, usable as a reference constant
    pub handle: ObjectHandle,
    pub name: String,
    /// Element kind for array classes
    pub element_kind: Option<Kind>,
}

/// A resolved method.
#[derive(Clone, Debug)]
pub struct MethodInfo {
    /// Dense method identifier recorded at call sites
    pub id: u32,
    pub signature: Signature,
    pub flags: MethodFlags,
    /// Virtual dispatch table index, for methods dispatched through the hub
    pub vtable_index: Option<i32>,
    /// Whether call sites may bind to this method directly
    pub statically_bound: bool,
    /// The method body, when the runtime makes it available for inlining
    pub body: Option<Arc<Method>>,
}

impl MethodInfo {
    /// Return whether the method takes a receiver.
    #[must_use]
    pub fn has_receiver(&self) -> bool {
        !self.flags.contains(MethodFlags::STATIC)
    }
}

/// Queries the compiler issues against the surrounding runtime.
pub trait Runtime: Send + Sync {
    /// Resolve a field reference pool entry.
    fn resolve_field(&self, pool: &ConstantPool, index: u16, is_static: bool)
    -> Option<FieldInfo>;

    /// Resolve a method reference pool entry.
    fn resolve_method(
        &self,
        pool: &ConstantPool,
        index: u16,
        invoke: InvokeKind,
    ) -> Option<MethodInfo>;

    /// Resolve a class reference pool entry.
    fn resolve_class(&self, pool: &ConstantPool, index: u16) -> Option<ClassInfo>;

    /// Return a reference constant for a string literal.
    fn string_constant(&self, value: &str) -> ObjectHandle;

    /// Return the class for a primitive array of the given element kind.
    fn primitive_array_class(&self, element: Kind) -> ClassInfo;

    /// Return the class holding `method`.
    fn method_holder(&self, method: &Method) -> ClassInfo;

    /// Return the array class with the given component class.
    fn array_class(&self, component: &ClassInfo) -> ClassInfo;

    /// Offset of the length field in array objects.
    fn array_length_offset(&self) -> i32;

    /// Offset of the first element of an array with the given element kind.
    fn array_base_offset(&self, element: Kind) -> i32;

    /// Offset of the hub word in object headers.
    fn hub_offset(&self) -> i32;

    /// The XIR template generators for object operations.
    fn xir(&self) -> &dyn XirGenerator;
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_runtime_call_result_kinds() {
        assert_eq!(Kind::Object, RuntimeCall::AllocateInstance.result_kind());
        assert_eq!(Kind::Double, RuntimeCall::ArithmeticSin.result_kind());
        assert_eq!(Kind::Long, RuntimeCall::NanoTime.result_kind());
        assert_eq!(Kind::Void, RuntimeCall::MonitorEnter.result_kind());
        assert_eq!(Kind::Int, RuntimeCall::InstanceOf.result_kind());
    }

    #[test]
    fn test_runtime_call_argument_kinds() {
        assert_eq!(
            &[Kind::Object, Kind::Int],
            RuntimeCall::AllocateArray.argument_kinds()
        );
        assert!(RuntimeCall::NanoTime.argument_kinds().is_empty());
        assert_eq!(
            &[Kind::Double, Kind::Double],
            RuntimeCall::ArithmeticDrem.argument_kinds()
        );
    }
}
