//! Shared test fixtures: a synthetic runtime with deterministic layout answers and helpers for
//! assembling test methods from raw bytecode.

use lungo_code::{
    ClassInfo, Constant, ConstantPool, FieldInfo, GenericXir, InvokeKind, Kind, Method,
    MethodFlags, MethodInfo, ObjectLayout, ObjectHandle, Runtime, Signature, XirGenerator,
};
use std::sync::Arc;

/// A runtime resolving everything against the constant pool with fixed offsets.
#[derive(Debug)]
pub struct TestRuntime {
    xir: GenericXir,
}

impl TestRuntime {
    #[must_use]
    pub fn new() -> TestRuntime {
        TestRuntime {
            xir: GenericXir::new(ObjectLayout::default()),
        }
    }
}

impl Default for TestRuntime {
    fn default() -> TestRuntime {
        TestRuntime::new()
    }
}

impl Runtime for TestRuntime {
    fn resolve_field(
        &self,
        pool: &ConstantPool,
        index: u16,
        is_static: bool,
    ) -> Option<FieldInfo> {
        let Ok(Constant::FieldRef { name, descriptor, .. }) = pool.try_get(index) else {
            return None;
        };
        let kind = kind_of_descriptor(descriptor)?;
        Some(FieldInfo {
            offset: 16 + i32::from(index) * 8,
            kind,
            is_volatile: name.contains("volatile"),
            is_static,
            static_base: is_static.then(|| ObjectHandle(u32::from(index) + 1000)),
        })
    }

    fn resolve_method(
        &self,
        pool: &ConstantPool,
        index: u16,
        invoke: InvokeKind,
    ) -> Option<MethodInfo> {
        let descriptor = match pool.try_get(index) {
            Ok(
                Constant::MethodRef { descriptor, .. }
                | Constant::InterfaceMethodRef { descriptor, .. },
            ) => descriptor.clone(),
            _ => return None,
        };
        let signature = Signature::parse(&descriptor).ok()?;
        let flags = if invoke == InvokeKind::Static {
            MethodFlags::STATIC
        } else {
            MethodFlags::empty()
        };
        let vtable_index = matches!(invoke, InvokeKind::Virtual | InvokeKind::Interface)
            .then_some(i32::from(index));
        Some(MethodInfo {
            id: u32::from(index),
            signature,
            flags,
            vtable_index,
            statically_bound: matches!(invoke, InvokeKind::Static | InvokeKind::Special),
            body: None,
        })
    }

    fn resolve_class(&self, pool: &ConstantPool, index: u16) -> Option<ClassInfo> {
        let Ok(Constant::Class(name)) = pool.try_get(index) else {
            return None;
        };
        Some(ClassInfo {
            handle: ObjectHandle(u32::from(index)),
            name: name.clone(),
            element_kind: None,
        })
    }

    fn string_constant(&self, _value: &str) -> ObjectHandle {
        ObjectHandle(9999)
    }

    fn primitive_array_class(&self, element: Kind) -> ClassInfo {
        ClassInfo {
            handle: ObjectHandle(2000 + u32::from(element.code())),
            name: format!("[{element}"),
            element_kind: Some(element),
        }
    }

    fn method_holder(&self, _method: &Method) -> ClassInfo {
        ClassInfo {
            handle: ObjectHandle(1),
            name: "Test".to_string(),
            element_kind: None,
        }
    }

    fn array_class(&self, component: &ClassInfo) -> ClassInfo {
        ClassInfo {
            handle: ObjectHandle(component.handle.0 + 3000),
            name: format!("[L{};", component.name),
            element_kind: Some(Kind::Object),
        }
    }

    fn array_length_offset(&self) -> i32 {
        8
    }

    fn array_base_offset(&self, _element: Kind) -> i32 {
        16
    }

    fn hub_offset(&self) -> i32 {
        0
    }

    fn xir(&self) -> &dyn XirGenerator {
        &self.xir
    }
}

/// The kind named by the first character of a field descriptor.
fn kind_of_descriptor(descriptor: &str) -> Option<Kind> {
    match descriptor.chars().next()? {
        'Z' => Some(Kind::Boolean),
        'B' => Some(Kind::Byte),
        'S' => Some(Kind::Short),
        'C' => Some(Kind::Char),
        'I' => Some(Kind::Int),
        'J' => Some(Kind::Long),
        'F' => Some(Kind::Float),
        'D' => Some(Kind::Double),
        'L' | '[' => Some(Kind::Object),
        _ => None,
    }
}

/// Assemble a static test method from raw bytecode.
#[must_use]
pub fn static_method(
    descriptor: &str,
    code: Vec<u8>,
    max_stack: u16,
    max_locals: u16,
) -> Arc<Method> {
    static_method_with_pool(descriptor, code, max_stack, max_locals, ConstantPool::new())
}

/// Assemble a static test method with a prepared constant pool.
#[must_use]
pub fn static_method_with_pool(
    descriptor: &str,
    code: Vec<u8>,
    max_stack: u16,
    max_locals: u16,
    constant_pool: ConstantPool,
) -> Arc<Method> {
    Arc::new(Method {
        holder: "Test".to_string(),
        name: "test".to_string(),
        descriptor: descriptor.to_string(),
        flags: MethodFlags::STATIC,
        code,
        max_stack,
        max_locals,
        constant_pool,
        exception_handlers: Vec::new(),
        line_numbers: Vec::new(),
    })
}

/// A compiler over the test runtime with default options.
#[must_use]
pub fn compiler() -> lungo_opt::Compiler {
    init_tracing();
    lungo_opt::Compiler::new(
        lungo_code::Target::amd64(),
        Arc::new(TestRuntime::new()),
        lungo_opt::Options::default(),
    )
}

/// Install a subscriber so compiler events show up in test output.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
}
