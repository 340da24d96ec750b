//! The global stub cache.
//!
//! Trap stubs and runtime call thunks are shared by every compiled method. Missing stubs are
//! emitted lazily under the cache lock, so each stub body exists exactly once per process no
//! matter how many compilations race for it.

use ahash::AHashMap;
use lungo_code::asm::Amd64Assembler;
use lungo_code::{RuntimeCall, StubId};
use parking_lot::Mutex;
use std::sync::Arc;
use tracing::debug;

/// Key of one global stub.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub enum StubKey {
    /// An out of line trap stub
    Trap(StubId),
    /// A thunk calling into the runtime
    Runtime(RuntimeCall),
}

/// One emitted stub, immutable once published.
#[derive(Debug)]
pub struct CompiledStub {
    pub key: StubKey,
    pub code: Vec<u8>,
    /// Position of the call displacement the installer links to the runtime
    pub link_position: u32,
}

/// Process wide stub cache, keyed by stub identifier.
#[derive(Debug, Default)]
pub struct StubCache {
    stubs: Mutex<AHashMap<StubKey, Arc<CompiledStub>>>,
}

impl StubCache {
    #[must_use]
    pub fn new() -> StubCache {
        StubCache::default()
    }

    /// Return the stub for `key`, emitting it if this is the first request. The lock spans the
    /// emission so the body is produced exactly once.
    #[must_use]
    pub fn get_or_emit(&self, key: StubKey) -> Arc<CompiledStub> {
        let mut stubs = self.stubs.lock();
        if let Some(stub) = stubs.get(&key) {
            return Arc::clone(stub);
        }
        let stub = Arc::new(emit_stub(key));
        stubs.insert(key, Arc::clone(&stub));
        debug!(?key, bytes = stub.code.len(), "emitted global stub");
        stub
    }

    /// Number of stubs emitted so far.
    #[must_use]
    pub fn len(&self) -> usize {
        self.stubs.lock().len()
    }

    /// Return whether no stub has been emitted yet.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.stubs.lock().is_empty()
    }
}

/// A stub body: a call the installer links to the runtime, then a trap in case the runtime
/// call ever returns.
fn emit_stub(key: StubKey) -> CompiledStub {
    let mut asm = Amd64Assembler::new();
    let link_position = u32::try_from(asm.call_rel32()).unwrap_or(u32::MAX);
    asm.int3();
    let (code, _) = asm.finish().finish();
    CompiledStub {
        key,
        code,
        link_position,
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_stub_emitted_once() {
        let cache = StubCache::new();
        assert!(cache.is_empty());
        let first = cache.get_or_emit(StubKey::Trap(StubId::ThrowNullPointerException));
        let second = cache.get_or_emit(StubKey::Trap(StubId::ThrowNullPointerException));
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(1, cache.len());
    }

    #[test]
    fn test_distinct_keys_distinct_stubs() {
        let cache = StubCache::new();
        let trap = cache.get_or_emit(StubKey::Trap(StubId::ThrowArithmeticException));
        let runtime = cache.get_or_emit(StubKey::Runtime(RuntimeCall::MonitorEnter));
        assert!(!Arc::ptr_eq(&trap, &runtime));
        assert_eq!(2, cache.len());
    }

    #[test]
    fn test_stub_body_shape() {
        let cache = StubCache::new();
        let stub = cache.get_or_emit(StubKey::Trap(StubId::ThrowClassCastException));
        // call rel32 followed by int3
        assert_eq!(0xe8, stub.code[0]);
        assert_eq!(0xcc, stub.code[5]);
        assert_eq!(1, stub.link_position);
    }
}
