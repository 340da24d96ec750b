//! XIR: parameterised inline code templates supplied by the runtime.
//!
//! XIR is a small target-independent micro-assembly. The runtime hands the compiler a template
//! per object operation (field access, type test, allocation, dispatch, barriers, safepoint);
//! the LIR generator binds template variables to operands at each site and the backend expands
//! the bound template into machine code. This keeps runtime-defined object layout out of the
//! compiler while still inlining the fast paths.

use crate::bytecode::Condition;
use crate::kind::Kind;
use crate::method::Method;
use crate::operand::{ConstValue, Scale};
use crate::register::Register;
use crate::runtime::{ClassInfo, FieldInfo, MethodInfo, RuntimeCall, StubId};
use std::fmt;
use std::sync::Arc;

/// A label local to one template, identified by index.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct XirLabel(pub usize);

/// An operand position inside a template.
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum XirOperand {
    /// The template's result variable
    Result,
    /// The n-th input argument
    Input(usize),
    /// The n-th template-local temporary
    Temp(usize),
    /// An inline constant
    Const(ConstValue),
    /// A fixed physical register the allocator must honor
    Fixed { register: Register, kind: Kind },
}

/// One micro-operation inside a template.
#[derive(Clone, Debug, PartialEq)]
pub enum XirOp {
    Mov {
        dest: XirOperand,
        src: XirOperand,
    },
    Add {
        dest: XirOperand,
        x: XirOperand,
        y: XirOperand,
    },
    Shr {
        dest: XirOperand,
        x: XirOperand,
        amount: XirOperand,
    },
    /// `dest = *(base + index * scale + displacement)`
    Load {
        dest: XirOperand,
        base: XirOperand,
        index: Option<XirOperand>,
        scale: Scale,
        displacement: i32,
        kind: Kind,
    },
    /// `*(base + index * scale + displacement) = value`
    Store {
        base: XirOperand,
        index: Option<XirOperand>,
        scale: Scale,
        displacement: i32,
        value: XirOperand,
        kind: Kind,
    },
    Jump {
        label: XirLabel,
    },
    /// Compare and branch within the template
    Jcc {
        condition: Condition,
        x: XirOperand,
        y: XirOperand,
        label: XirLabel,
    },
    Bind {
        label: XirLabel,
    },
    CallRuntime {
        call: RuntimeCall,
        arguments: Vec<XirOperand>,
        /// Where the call result lands; `None` for void calls
        result: Option<XirOperand>,
    },
    CallStub {
        stub: StubId,
    },
    /// A named position the emitter reports back as call-site metadata
    Mark {
        name: &'static str,
    },
    ShouldNotReachHere,
}

/// A parameterised code template.
#[derive(Clone, Debug, PartialEq)]
pub struct XirTemplate {
    pub name: &'static str,
    /// Kinds of the input operands
    pub inputs: Vec<Kind>,
    /// Indices of inputs the template writes; the LIR generator copies these so the original
    /// operand survives
    pub destroyed_inputs: Vec<usize>,
    /// Kinds of template-local temporaries
    pub temps: Vec<Kind>,
    /// Kind of the result, if the template produces one
    pub result: Option<Kind>,
    pub fast_path: Vec<XirOp>,
    pub slow_path: Vec<XirOp>,
    /// Number of labels used across both paths
    pub label_count: usize,
}

impl XirTemplate {
    /// Return the names of all marks in the template, in emission order.
    #[must_use]
    pub fn marks(&self) -> Vec<&'static str> {
        self.fast_path
            .iter()
            .chain(self.slow_path.iter())
            .filter_map(|op| match op {
                XirOp::Mark { name } => Some(*name),
                _ => None,
            })
            .collect()
    }

    /// Return whether the template makes a runtime call on its fast path.
    #[must_use]
    pub fn calls_runtime(&self) -> bool {
        self.fast_path
            .iter()
            .any(|op| matches!(op, XirOp::CallRuntime { .. }))
    }
}

impl fmt::Display for XirTemplate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "xir:{}", self.name)
    }
}

/// An argument bound to a template input at a concrete site.
#[derive(Clone, Debug, PartialEq)]
pub enum XirArgument {
    Const(ConstValue),
    /// A HIR value; carried as an opaque index the LIR generator resolves
    Value(u32),
}

impl XirArgument {
    /// Bind a HIR value by its node index.
    #[must_use]
    pub fn value(index: u32) -> XirArgument {
        XirArgument::Value(index)
    }
}

/// A template plus concrete arguments at one site.
#[derive(Clone, Debug, PartialEq)]
pub struct XirSnippet {
    pub template: Arc<XirTemplate>,
    pub arguments: Vec<XirArgument>,
}

impl XirSnippet {
    /// Create a snippet, checking the argument count against the template.
    ///
    /// # Panics
    ///
    /// if the argument count does not match the template's input count
    #[must_use]
    pub fn new(template: Arc<XirTemplate>, arguments: Vec<XirArgument>) -> XirSnippet {
        assert_eq!(
            template.inputs.len(),
            arguments.len(),
            "argument count mismatch for {}",
            template.name
        );
        XirSnippet {
            template,
            arguments,
        }
    }
}

/// The template generators the runtime supplies, one per object operation.
///
/// Generators returning `Option` may decline, in which case the compiler falls back to its
/// generic lowering (a plain direct call, or no code at all for prologue and epilogue).
pub trait XirGenerator: Send + Sync {
    fn prologue(&self, method: &Method) -> Option<XirSnippet>;
    fn epilogue(&self, method: &Method) -> Option<XirSnippet>;
    fn safepoint(&self) -> XirSnippet;
    fn array_length(&self, array: XirArgument) -> XirSnippet;
    fn array_load(&self, array: XirArgument, index: XirArgument, element: Kind) -> XirSnippet;
    fn array_store(
        &self,
        array: XirArgument,
        index: XirArgument,
        value: XirArgument,
        element: Kind,
    ) -> XirSnippet;
    fn get_field(&self, object: XirArgument, field: &FieldInfo) -> XirSnippet;
    fn put_field(&self, object: XirArgument, value: XirArgument, field: &FieldInfo)
    -> XirSnippet;
    fn get_static(&self, field: &FieldInfo) -> XirSnippet;
    fn put_static(&self, value: XirArgument, field: &FieldInfo) -> XirSnippet;
    fn check_cast(&self, object: XirArgument, class: &ClassInfo) -> XirSnippet;
    fn instance_of(&self, object: XirArgument, class: &ClassInfo) -> XirSnippet;
    fn monitor_enter(&self, object: XirArgument) -> XirSnippet;
    fn monitor_exit(&self, object: XirArgument) -> XirSnippet;
    fn new_instance(&self, class: &ClassInfo) -> XirSnippet;
    fn new_array(&self, class: &ClassInfo, length: XirArgument) -> XirSnippet;
    /// `lengths_buffer` points at a frame area holding `dimension_count` int lengths
    fn new_multi_array(
        &self,
        class: &ClassInfo,
        lengths_buffer: XirArgument,
        dimension_count: XirArgument,
    ) -> XirSnippet;
    fn resolve_class(&self, pool_index: u16) -> XirSnippet;
    fn exception_object(&self) -> XirSnippet;
    fn invoke_static(&self, method: &MethodInfo) -> Option<XirSnippet>;
    fn invoke_special(&self, method: &MethodInfo) -> Option<XirSnippet>;
    fn invoke_virtual(&self, receiver: XirArgument, method: &MethodInfo) -> Option<XirSnippet>;
    fn invoke_interface(&self, receiver: XirArgument, method: &MethodInfo)
    -> Option<XirSnippet>;
    fn intrinsic(&self, method: &MethodInfo) -> Option<XirSnippet>;
    fn write_barrier(&self, object: XirArgument) -> XirSnippet;
}

/// Object layout parameters for [`GenericXir`].
#[derive(Clone, Debug)]
pub struct ObjectLayout {
    pub hub_offset: i32,
    pub array_length_offset: i32,
    /// Element base offset, independent of element kind
    pub array_base_offset: i32,
    /// First vtable entry offset within a hub
    pub vtable_base_offset: i32,
    /// Card table base address for the post write barrier
    pub card_table_base: i64,
    /// log2 of the card size
    pub card_shift: u8,
    /// Address the safepoint poll reads
    pub safepoint_page: i64,
}

impl Default for ObjectLayout {
    fn default() -> ObjectLayout {
        ObjectLayout {
            hub_offset: 0,
            array_length_offset: 8,
            array_base_offset: 16,
            vtable_base_offset: 64,
            card_table_base: 0x2000_0000,
            card_shift: 9,
            safepoint_page: 0x1000_0000,
        }
    }
}

/// A generic template set for runtimes without hand-tuned templates.
///
/// Fast paths inline plain loads and stores; allocation, locking and type tests call into the
/// runtime. The write barrier is a card table mark.
#[derive(Debug)]
pub struct GenericXir {
    layout: ObjectLayout,
}

impl GenericXir {
    #[must_use]
    pub fn new(layout: ObjectLayout) -> GenericXir {
        GenericXir { layout }
    }

    fn template(
        name: &'static str,
        inputs: Vec<Kind>,
        temps: Vec<Kind>,
        result: Option<Kind>,
        fast_path: Vec<XirOp>,
    ) -> Arc<XirTemplate> {
        Arc::new(XirTemplate {
            name,
            inputs,
            destroyed_inputs: Vec::new(),
            temps,
            result,
            fast_path,
            slow_path: Vec::new(),
            label_count: 0,
        })
    }

    fn runtime_call_template(
        name: &'static str,
        call: RuntimeCall,
        inputs: Vec<Kind>,
        constants: Vec<ConstValue>,
    ) -> Arc<XirTemplate> {
        let result_kind = call.result_kind();
        let mut arguments: Vec<XirOperand> = constants.into_iter().map(XirOperand::Const).collect();
        arguments.extend((0..inputs.len()).map(XirOperand::Input));
        let result = if result_kind == Kind::Void {
            None
        } else {
            Some(result_kind)
        };
        Self::template(
            name,
            inputs,
            Vec::new(),
            result,
            vec![
                XirOp::CallRuntime {
                    call,
                    arguments,
                    result: result.map(|_| XirOperand::Result),
                },
                XirOp::Mark { name },
            ],
        )
    }
}

impl XirGenerator for GenericXir {
    fn prologue(&self, _method: &Method) -> Option<XirSnippet> {
        None
    }

    fn epilogue(&self, _method: &Method) -> Option<XirSnippet> {
        None
    }

    fn safepoint(&self) -> XirSnippet {
        let template = Self::template(
            "safepoint",
            Vec::new(),
            vec![Kind::Word],
            None,
            vec![
                XirOp::Load {
                    dest: XirOperand::Temp(0),
                    base: XirOperand::Const(ConstValue::Word(self.layout.safepoint_page)),
                    index: None,
                    scale: Scale::Times1,
                    displacement: 0,
                    kind: Kind::Word,
                },
                XirOp::Mark { name: "safepoint" },
            ],
        );
        XirSnippet::new(template, Vec::new())
    }

    fn array_length(&self, array: XirArgument) -> XirSnippet {
        let template = Self::template(
            "arrayLength",
            vec![Kind::Object],
            Vec::new(),
            Some(Kind::Int),
            vec![XirOp::Load {
                dest: XirOperand::Result,
                base: XirOperand::Input(0),
                index: None,
                scale: Scale::Times1,
                displacement: self.layout.array_length_offset,
                kind: Kind::Int,
            }],
        );
        XirSnippet::new(template, vec![array])
    }

    fn array_load(&self, array: XirArgument, index: XirArgument, element: Kind) -> XirSnippet {
        let scale = Scale::from_size(element.size_in_bytes(8)).unwrap_or(Scale::Times1);
        let template = Self::template(
            "arrayLoad",
            vec![Kind::Object, Kind::Int],
            Vec::new(),
            Some(element.stack_kind()),
            vec![XirOp::Load {
                dest: XirOperand::Result,
                base: XirOperand::Input(0),
                index: Some(XirOperand::Input(1)),
                scale,
                displacement: self.layout.array_base_offset,
                kind: element,
            }],
        );
        XirSnippet::new(template, vec![array, index])
    }

    fn array_store(
        &self,
        array: XirArgument,
        index: XirArgument,
        value: XirArgument,
        element: Kind,
    ) -> XirSnippet {
        let scale = Scale::from_size(element.size_in_bytes(8)).unwrap_or(Scale::Times1);
        let template = Self::template(
            "arrayStore",
            vec![Kind::Object, Kind::Int, element.stack_kind()],
            Vec::new(),
            None,
            vec![XirOp::Store {
                base: XirOperand::Input(0),
                index: Some(XirOperand::Input(1)),
                scale,
                displacement: self.layout.array_base_offset,
                value: XirOperand::Input(2),
                kind: element,
            }],
        );
        XirSnippet::new(template, vec![array, index, value])
    }

    fn get_field(&self, object: XirArgument, field: &FieldInfo) -> XirSnippet {
        let template = Self::template(
            "getField",
            vec![Kind::Object],
            Vec::new(),
            Some(field.kind.stack_kind()),
            vec![XirOp::Load {
                dest: XirOperand::Result,
                base: XirOperand::Input(0),
                index: None,
                scale: Scale::Times1,
                displacement: field.offset,
                kind: field.kind,
            }],
        );
        XirSnippet::new(template, vec![object])
    }

    fn put_field(
        &self,
        object: XirArgument,
        value: XirArgument,
        field: &FieldInfo,
    ) -> XirSnippet {
        let template = Self::template(
            "putField",
            vec![Kind::Object, field.kind.stack_kind()],
            Vec::new(),
            None,
            vec![XirOp::Store {
                base: XirOperand::Input(0),
                index: None,
                scale: Scale::Times1,
                displacement: field.offset,
                value: XirOperand::Input(1),
                kind: field.kind,
            }],
        );
        XirSnippet::new(template, vec![object, value])
    }

    fn get_static(&self, field: &FieldInfo) -> XirSnippet {
        let base = field.static_base.map_or(ConstValue::Null, ConstValue::Object);
        let template = Self::template(
            "getStatic",
            Vec::new(),
            Vec::new(),
            Some(field.kind.stack_kind()),
            vec![XirOp::Load {
                dest: XirOperand::Result,
                base: XirOperand::Const(base),
                index: None,
                scale: Scale::Times1,
                displacement: field.offset,
                kind: field.kind,
            }],
        );
        XirSnippet::new(template, Vec::new())
    }

    fn put_static(&self, value: XirArgument, field: &FieldInfo) -> XirSnippet {
        let base = field.static_base.map_or(ConstValue::Null, ConstValue::Object);
        let template = Self::template(
            "putStatic",
            vec![field.kind.stack_kind()],
            Vec::new(),
            None,
            vec![XirOp::Store {
                base: XirOperand::Const(base),
                index: None,
                scale: Scale::Times1,
                displacement: field.offset,
                value: XirOperand::Input(0),
                kind: field.kind,
            }],
        );
        XirSnippet::new(template, vec![value])
    }

    fn check_cast(&self, object: XirArgument, class: &ClassInfo) -> XirSnippet {
        let template = Self::runtime_call_template(
            "checkCast",
            RuntimeCall::CheckCast,
            vec![Kind::Object],
            vec![ConstValue::Object(class.handle)],
        );
        XirSnippet::new(template, vec![object])
    }

    fn instance_of(&self, object: XirArgument, class: &ClassInfo) -> XirSnippet {
        let template = Self::runtime_call_template(
            "instanceOf",
            RuntimeCall::InstanceOf,
            vec![Kind::Object],
            vec![ConstValue::Object(class.handle)],
        );
        XirSnippet::new(template, vec![object])
    }

    fn monitor_enter(&self, object: XirArgument) -> XirSnippet {
        let template = Self::runtime_call_template(
            "monitorEnter",
            RuntimeCall::MonitorEnter,
            vec![Kind::Object],
            Vec::new(),
        );
        XirSnippet::new(template, vec![object])
    }

    fn monitor_exit(&self, object: XirArgument) -> XirSnippet {
        let template = Self::runtime_call_template(
            "monitorExit",
            RuntimeCall::MonitorExit,
            vec![Kind::Object],
            Vec::new(),
        );
        XirSnippet::new(template, vec![object])
    }

    fn new_instance(&self, class: &ClassInfo) -> XirSnippet {
        let template = Self::runtime_call_template(
            "newInstance",
            RuntimeCall::AllocateInstance,
            Vec::new(),
            vec![ConstValue::Object(class.handle)],
        );
        XirSnippet::new(template, Vec::new())
    }

    fn new_array(&self, class: &ClassInfo, length: XirArgument) -> XirSnippet {
        let template = Self::runtime_call_template(
            "newArray",
            RuntimeCall::AllocateArray,
            vec![Kind::Int],
            vec![ConstValue::Object(class.handle)],
        );
        XirSnippet::new(template, vec![length])
    }

    fn new_multi_array(
        &self,
        class: &ClassInfo,
        lengths_buffer: XirArgument,
        dimension_count: XirArgument,
    ) -> XirSnippet {
        let template = Self::runtime_call_template(
            "newMultiArray",
            RuntimeCall::AllocateMultiArray,
            vec![Kind::Word, Kind::Int],
            vec![ConstValue::Object(class.handle)],
        );
        XirSnippet::new(template, vec![lengths_buffer, dimension_count])
    }

    fn resolve_class(&self, pool_index: u16) -> XirSnippet {
        let template = Self::runtime_call_template(
            "resolveClass",
            RuntimeCall::ResolveClass,
            Vec::new(),
            vec![ConstValue::Null, ConstValue::Int(i32::from(pool_index))],
        );
        XirSnippet::new(template, Vec::new())
    }

    fn exception_object(&self) -> XirSnippet {
        let template = Self::template(
            "exceptionObject",
            Vec::new(),
            Vec::new(),
            Some(Kind::Object),
            vec![XirOp::Mov {
                dest: XirOperand::Result,
                src: XirOperand::Fixed {
                    register: crate::calling_convention::EXCEPTION_REGISTER,
                    kind: Kind::Object,
                },
            }],
        );
        XirSnippet::new(template, Vec::new())
    }

    fn invoke_static(&self, _method: &MethodInfo) -> Option<XirSnippet> {
        // Resolved static calls are emitted as direct calls
        None
    }

    fn invoke_special(&self, _method: &MethodInfo) -> Option<XirSnippet> {
        None
    }

    fn invoke_virtual(&self, receiver: XirArgument, method: &MethodInfo) -> Option<XirSnippet> {
        let vtable_index = method.vtable_index?;
        let displacement = self.layout.vtable_base_offset + vtable_index * 8;
        let template = Self::template(
            "invokeVirtual",
            vec![Kind::Object],
            vec![Kind::Word],
            Some(Kind::Word),
            vec![
                XirOp::Load {
                    dest: XirOperand::Temp(0),
                    base: XirOperand::Input(0),
                    index: None,
                    scale: Scale::Times1,
                    displacement: self.layout.hub_offset,
                    kind: Kind::Word,
                },
                XirOp::Load {
                    dest: XirOperand::Result,
                    base: XirOperand::Temp(0),
                    index: None,
                    scale: Scale::Times1,
                    displacement,
                    kind: Kind::Word,
                },
            ],
        );
        Some(XirSnippet::new(template, vec![receiver]))
    }

    fn invoke_interface(
        &self,
        receiver: XirArgument,
        method: &MethodInfo,
    ) -> Option<XirSnippet> {
        // Interface dispatch resolves through the same table in this generic layout
        self.invoke_virtual(receiver, method)
    }

    fn intrinsic(&self, _method: &MethodInfo) -> Option<XirSnippet> {
        None
    }

    fn write_barrier(&self, object: XirArgument) -> XirSnippet {
        let template = Self::template(
            "writeBarrier",
            vec![Kind::Object],
            vec![Kind::Word],
            None,
            vec![
                XirOp::Mov {
                    dest: XirOperand::Temp(0),
                    src: XirOperand::Input(0),
                },
                XirOp::Shr {
                    dest: XirOperand::Temp(0),
                    x: XirOperand::Temp(0),
                    amount: XirOperand::Const(ConstValue::Int(i32::from(self.layout.card_shift))),
                },
                XirOp::Store {
                    base: XirOperand::Const(ConstValue::Word(self.layout.card_table_base)),
                    index: Some(XirOperand::Temp(0)),
                    scale: Scale::Times1,
                    displacement: 0,
                    value: XirOperand::Const(ConstValue::Int(0)),
                    kind: Kind::Byte,
                },
            ],
        );
        XirSnippet::new(template, vec![object])
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::operand::ObjectHandle;

    fn xir() -> GenericXir {
        GenericXir::new(ObjectLayout::default())
    }

    #[test]
    fn test_array_length_template() {
        let snippet = xir().array_length(XirArgument::value(1));
        assert_eq!("arrayLength", snippet.template.name);
        assert_eq!(vec![Kind::Object], snippet.template.inputs);
        assert_eq!(Some(Kind::Int), snippet.template.result);
        assert_eq!(1, snippet.arguments.len());
    }

    #[test]
    fn test_array_load_scale() {
        let snippet = xir().array_load(XirArgument::value(1), XirArgument::value(2), Kind::Long);
        let XirOp::Load { scale, .. } = &snippet.template.fast_path[0] else {
            panic!("expected load");
        };
        assert_eq!(Scale::Times8, *scale);
    }

    #[test]
    fn test_allocation_calls_runtime() {
        let class = ClassInfo {
            handle: ObjectHandle(7),
            name: "Foo".to_string(),
            element_kind: None,
        };
        let snippet = xir().new_instance(&class);
        assert!(snippet.template.calls_runtime());
        assert_eq!(vec!["newInstance"], snippet.template.marks());
    }

    #[test]
    fn test_write_barrier_marks_card() {
        let snippet = xir().write_barrier(XirArgument::value(1));
        assert_eq!(3, snippet.template.fast_path.len());
        let XirOp::Store { kind, .. } = &snippet.template.fast_path[2] else {
            panic!("expected store");
        };
        assert_eq!(Kind::Byte, *kind);
    }

    #[test]
    fn test_invoke_virtual_loads_through_hub() {
        let method = MethodInfo {
            id: 3,
            signature: crate::signature::Signature::new(Vec::new(), Kind::Void),
            flags: crate::method::MethodFlags::empty(),
            vtable_index: Some(2),
            statically_bound: false,
            body: None,
        };
        let snippet = xir()
            .invoke_virtual(XirArgument::value(1), &method)
            .expect("snippet");
        assert_eq!(2, snippet.template.fast_path.len());
        assert_eq!(Some(Kind::Word), snippet.template.result);
    }

    #[test]
    #[should_panic(expected = "argument count mismatch")]
    fn test_snippet_argument_count_checked() {
        let template = GenericXir::template(
            "broken",
            vec![Kind::Int],
            Vec::new(),
            None,
            Vec::new(),
        );
        let _ = XirSnippet::new(template, Vec::new());
    }
}
