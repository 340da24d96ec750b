//! # Lungo Code
//!
//! The compiler/runtime interface layer of the Lungo optimizing compiler: the primitive kind
//! model, JVM method descriptors and bytecode, the target architecture description, the operand
//! model, the code buffer and AMD64 assembler, XIR templates and the sealed target method
//! record. Everything here is shared between the compiler, the adapter generator and the
//! surrounding runtime.

#![forbid(clippy::allow_attributes)]
#![allow(dead_code)]
#![deny(clippy::pedantic)]
#![deny(clippy::unwrap_in_result)]
#![deny(clippy::unwrap_used)]

pub mod asm;
mod bytecode;
mod calling_convention;
mod error;
mod kind;
mod method;
mod operand;
mod register;
mod runtime;
mod signature;
mod stack_map;
mod target;
mod target_method;
mod xir;

pub use bytecode::{ArithOp, Bytecode, Condition, InvokeKind, LogicOp, ShiftOp, decode};
pub use calling_convention::{
    CPU_ARGUMENT_REGISTERS, CallingConvention, ConventionKind, EXCEPTION_REGISTER,
    FPU_ARGUMENT_REGISTERS,
};
pub use error::{Error, Result};
pub use kind::Kind;
pub use method::{Constant, ConstantPool, ExceptionHandler, Method, MethodFlags};
pub use operand::{Address, ConstValue, ObjectHandle, Operand, Scale, Variable};
pub use register::{Register, RegisterClass, RegisterSet};
pub use runtime::{ClassInfo, FieldInfo, MethodInfo, Runtime, RuntimeCall, StubId};
pub use signature::Signature;
pub use stack_map::RefMap;
pub use target::{Architecture, Barriers, ByteOrder, Target};
pub use target_method::{
    CallSite, DataPatch, HandlerEntry, RuntimeCallSite, SafepointSite, StubCallSite,
    TargetMethod,
};
pub use xir::{
    GenericXir, ObjectLayout, XirArgument, XirGenerator, XirLabel, XirOp, XirOperand,
    XirSnippet, XirTemplate,
};
