//! `try { m(); } catch (ArithmeticException e) { return -1; }`: one handler entry covering the
//! call site, with the catch block starting at an exception object bound to the ABI exception
//! register.

mod util;

use lungo_code::{Constant, ConstantPool, ExceptionHandler, Method, MethodFlags, ObjectHandle};
use lungo_opt::Result;
use lungo_opt::graph::build_graph;
use lungo_opt::hir::ValueTag;
use std::sync::Arc;
use util::TestRuntime;

fn try_catch_method() -> Arc<Method> {
    let mut constant_pool = ConstantPool::new();
    let method_index = constant_pool.push(Constant::MethodRef {
        class: "Test".to_string(),
        name: "m".to_string(),
        descriptor: "()V".to_string(),
    });
    let class_index = constant_pool.push(Constant::Class(
        "java/lang/ArithmeticException".to_string(),
    ));
    assert_eq!(1, method_index);
    assert_eq!(2, class_index);
    Arc::new(Method {
        holder: "Test".to_string(),
        name: "test".to_string(),
        descriptor: "()I".to_string(),
        flags: MethodFlags::STATIC,
        code: vec![
            0xb8, 0x00, 0x01, // 0: invokestatic #1
            0x03, // 3: iconst_0
            0xac, // 4: ireturn
            0x57, // 5: pop              handler entry
            0x02, // 6: iconst_m1
            0xac, // 7: ireturn
        ],
        max_stack: 1,
        max_locals: 0,
        constant_pool,
        exception_handlers: vec![ExceptionHandler {
            start_bci: 0,
            end_bci: 3,
            handler_bci: 5,
            catch_type: Some(2),
        }],
        line_numbers: Vec::new(),
    })
}

#[test]
fn handler_table_entry() -> Result<()> {
    let compiled = util::compiler().compile(&try_catch_method(), None)?;

    assert_eq!(1, compiled.direct_calls().len());
    assert_eq!(1, compiled.exception_handlers().len());
    let handler = &compiled.exception_handlers()[0];
    // The covered range is exactly the call site
    assert_eq!(compiled.direct_calls()[0].position, handler.try_position);
    assert_eq!(Some(ObjectHandle(2)), handler.catch_type);
    let code_length = u32::try_from(compiled.code().len()).expect("length");
    assert!(handler.try_position < code_length);
    assert!(handler.catch_position < code_length);
    // Calls are stop positions
    assert!(
        compiled
            .stop_positions()
            .contains(&compiled.direct_calls()[0].position)
    );
    Ok(())
}

#[test]
fn catch_block_starts_with_exception_object() -> Result<()> {
    let runtime = TestRuntime::new();
    let options = lungo_opt::Options::default();
    let ir = build_graph(&runtime, &options, try_catch_method(), None)?;
    let handler = ir.handlers.first().expect("handler");
    let first = ir.instructions(handler.block)[0];
    assert!(matches!(ir.value(first).tag, ValueTag::ExceptionObject));
    Ok(())
}
