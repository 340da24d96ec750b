//! Concurrent adapter requests for the same signature observe one shared adapter whose bytes
//! were produced exactly once.

use lungo_adapter::{AdapterGenerator, Direction, Result};
use lungo_code::{ConstantPool, Method, MethodFlags, Target};
use std::sync::Arc;

fn callee() -> Method {
    Method {
        holder: "Test".to_string(),
        name: "target".to_string(),
        descriptor: "(Ljava/lang/Object;IJ)V".to_string(),
        flags: MethodFlags::STATIC,
        code: Vec::new(),
        max_stack: 0,
        max_locals: 4,
        constant_pool: ConstantPool::new(),
        exception_handlers: Vec::new(),
        line_numbers: Vec::new(),
    }
}

#[test]
fn concurrent_requests_share_one_adapter() -> Result<()> {
    let generator = Arc::new(AdapterGenerator::new(
        Direction::Baseline2Opt,
        Target::amd64(),
    ));
    let mut adapters = Vec::new();
    std::thread::scope(|scope| {
        let mut handles = Vec::new();
        for _ in 0..8 {
            let generator = Arc::clone(&generator);
            handles.push(scope.spawn(move || {
                let mut out = Vec::new();
                generator.adapt(&callee(), &mut out).map(|adapter| {
                    (adapter.expect("adapter expected"), out)
                })
            }));
        }
        for handle in handles {
            adapters.push(handle.join().expect("thread panicked"));
        }
    });

    let adapters: Result<Vec<_>> = adapters.into_iter().collect();
    let adapters = adapters?;
    let (first, first_prologue) = &adapters[0];
    for (adapter, prologue) in &adapters {
        // Every thread observes the same finished adapter object
        assert!(Arc::ptr_eq(first, adapter));
        assert_eq!(first_prologue, prologue);
    }
    // The body was built exactly once
    assert_eq!(1, generator.cached());
    assert!(!first.code.is_empty());
    Ok(())
}
