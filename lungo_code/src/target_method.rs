//! The sealed output of a compilation: machine code plus the side tables the runtime needs to
//! execute, unwind, garbage collect and patch the method.

use crate::operand::{ConstValue, ObjectHandle};
use crate::runtime::{RuntimeCall, StubId};
use crate::stack_map::RefMap;
use crate::target::Target;
use byteorder::{ByteOrder, LittleEndian};
use std::fmt;
use tracing::debug;

/// A call site whose target is a method.
#[derive(Clone, Debug, PartialEq)]
pub struct CallSite {
    /// Offset of the call instruction
    pub position: u32,
    /// Dense id of the callee, when known at compile time
    pub method: Option<u32>,
    /// Object-holding outgoing stack slots at the call
    pub stack_map: RefMap,
}

/// A call site into the runtime.
#[derive(Clone, Debug, PartialEq)]
pub struct RuntimeCallSite {
    pub position: u32,
    pub call: RuntimeCall,
    pub stack_map: RefMap,
}

/// A call site into a global stub.
#[derive(Clone, Debug, PartialEq)]
pub struct StubCallSite {
    pub position: u32,
    pub stub: StubId,
    pub register_map: RefMap,
    pub stack_map: RefMap,
}

/// A safepoint position with its reference maps.
#[derive(Clone, Debug, PartialEq)]
pub struct SafepointSite {
    pub position: u32,
    pub register_map: RefMap,
    pub stack_map: RefMap,
}

/// A position that reads an inline constant the installer may need to relocate.
#[derive(Clone, Debug, PartialEq)]
pub struct DataPatch {
    pub position: u32,
    pub constant: ConstValue,
}

/// One exception handler range in code position terms.
#[derive(Clone, Debug, PartialEq)]
pub struct HandlerEntry {
    /// Position of the potentially throwing instruction
    pub try_position: u32,
    /// Position of the handler entry
    pub catch_position: u32,
    /// Handle of the caught class; `None` catches everything
    pub catch_type: Option<ObjectHandle>,
}

/// A finished target method.
///
/// Sealed after emission: apart from [`patch_call_site`](TargetMethod::patch_call_site) and
/// [`forward_to`](TargetMethod::forward_to), nothing mutates a sealed method.
#[derive(Debug, Default)]
pub struct TargetMethod {
    /// `holder.name(descriptor)` of the compiled method
    name: String,
    code: Vec<u8>,
    frame_size: i32,
    /// Entry offset for optimized convention callers
    opt_entry: u32,
    /// Entry offset for baseline convention callers
    baseline_entry: u32,
    /// Template of callee saved registers holding references, shared by all safepoints
    register_ref_map: RefMap,
    direct_calls: Vec<CallSite>,
    indirect_calls: Vec<CallSite>,
    runtime_calls: Vec<RuntimeCallSite>,
    stub_calls: Vec<StubCallSite>,
    safepoints: Vec<SafepointSite>,
    data_patches: Vec<DataPatch>,
    exception_handlers: Vec<HandlerEntry>,
    /// Positions where execution can be interrupted; superset of safepoints and calls
    stop_positions: Vec<u32>,
    /// Opaque descriptors of literal bytes inlined between instructions
    inline_data: Vec<u8>,
    reference_literals: Vec<ObjectHandle>,
    /// Address of the first code byte, filled on install
    code_start: Option<u64>,
    sealed: bool,
}

impl TargetMethod {
    /// Create an unsealed method record for `name`.
    #[must_use]
    pub fn new(name: String) -> TargetMethod {
        TargetMethod {
            name,
            ..TargetMethod::default()
        }
    }

    fn assert_unsealed(&self) {
        assert!(!self.sealed, "target method {} is sealed", self.name);
    }

    /// Install the finished code bytes.
    pub fn set_code(&mut self, code: Vec<u8>) {
        self.assert_unsealed();
        self.code = code;
    }

    pub fn set_frame_size(&mut self, frame_size: i32) {
        self.assert_unsealed();
        self.frame_size = frame_size;
    }

    pub fn set_entries(&mut self, opt_entry: u32, baseline_entry: u32) {
        self.assert_unsealed();
        self.opt_entry = opt_entry;
        self.baseline_entry = baseline_entry;
    }

    pub fn set_register_ref_map(&mut self, map: RefMap) {
        self.assert_unsealed();
        self.register_ref_map = map;
    }

    pub fn set_inline_data(&mut self, descriptors: Vec<u8>) {
        self.assert_unsealed();
        self.inline_data = descriptors;
    }

    pub fn record_direct_call(&mut self, site: CallSite) {
        self.assert_unsealed();
        self.direct_calls.push(site);
    }

    pub fn record_indirect_call(&mut self, site: CallSite) {
        self.assert_unsealed();
        self.indirect_calls.push(site);
    }

    pub fn record_runtime_call(&mut self, site: RuntimeCallSite) {
        self.assert_unsealed();
        self.runtime_calls.push(site);
    }

    pub fn record_stub_call(&mut self, site: StubCallSite) {
        self.assert_unsealed();
        self.stub_calls.push(site);
    }

    pub fn record_safepoint(&mut self, site: SafepointSite) {
        self.assert_unsealed();
        self.safepoints.push(site);
    }

    pub fn record_data_patch(&mut self, patch: DataPatch) {
        self.assert_unsealed();
        self.data_patches.push(patch);
    }

    pub fn record_exception_handler(&mut self, entry: HandlerEntry) {
        self.assert_unsealed();
        self.exception_handlers.push(entry);
    }

    /// Intern a reference literal, returning its pool index.
    pub fn add_reference_literal(&mut self, handle: ObjectHandle) -> usize {
        self.assert_unsealed();
        if let Some(index) = self
            .reference_literals
            .iter()
            .position(|existing| *existing == handle)
        {
            return index;
        }
        self.reference_literals.push(handle);
        self.reference_literals.len() - 1
    }

    /// Seal the method: compute stop positions and verify every recorded position is in bounds.
    ///
    /// # Panics
    ///
    /// if a recorded position lies outside the code
    pub fn seal(&mut self) {
        self.assert_unsealed();
        let code_length = u32::try_from(self.code.len()).unwrap_or(u32::MAX);
        let positions = self
            .direct_calls
            .iter()
            .map(|site| site.position)
            .chain(self.indirect_calls.iter().map(|site| site.position))
            .chain(self.runtime_calls.iter().map(|site| site.position))
            .chain(self.stub_calls.iter().map(|site| site.position))
            .chain(self.safepoints.iter().map(|site| site.position));
        let mut stop_positions: Vec<u32> = positions.collect();
        stop_positions.sort_unstable();
        stop_positions.dedup();
        for position in &stop_positions {
            assert!(*position < code_length, "stop position {position} out of bounds");
        }
        for patch in &self.data_patches {
            assert!(patch.position < code_length, "data patch out of bounds");
        }
        for handler in &self.exception_handlers {
            assert!(handler.try_position < code_length, "try position out of bounds");
            assert!(handler.catch_position < code_length, "catch position out of bounds");
        }
        assert!(self.opt_entry < code_length.max(1), "entry out of bounds");
        self.stop_positions = stop_positions;
        self.sealed = true;
    }

    /// Fill in the installed code address.
    pub fn install(&mut self, code_start: u64) {
        self.code_start = Some(code_start);
        debug!(method = %self.name, code_start, "installed");
    }

    // Accessors

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[must_use]
    pub fn code(&self) -> &[u8] {
        &self.code
    }

    #[must_use]
    pub fn frame_size(&self) -> i32 {
        self.frame_size
    }

    #[must_use]
    pub fn opt_entry(&self) -> u32 {
        self.opt_entry
    }

    #[must_use]
    pub fn baseline_entry(&self) -> u32 {
        self.baseline_entry
    }

    #[must_use]
    pub fn register_ref_map(&self) -> &RefMap {
        &self.register_ref_map
    }

    #[must_use]
    pub fn direct_calls(&self) -> &[CallSite] {
        &self.direct_calls
    }

    #[must_use]
    pub fn indirect_calls(&self) -> &[CallSite] {
        &self.indirect_calls
    }

    #[must_use]
    pub fn runtime_calls(&self) -> &[RuntimeCallSite] {
        &self.runtime_calls
    }

    #[must_use]
    pub fn stub_calls(&self) -> &[StubCallSite] {
        &self.stub_calls
    }

    #[must_use]
    pub fn safepoints(&self) -> &[SafepointSite] {
        &self.safepoints
    }

    #[must_use]
    pub fn data_patches(&self) -> &[DataPatch] {
        &self.data_patches
    }

    #[must_use]
    pub fn exception_handlers(&self) -> &[HandlerEntry] {
        &self.exception_handlers
    }

    #[must_use]
    pub fn stop_positions(&self) -> &[u32] {
        &self.stop_positions
    }

    #[must_use]
    pub fn inline_data(&self) -> &[u8] {
        &self.inline_data
    }

    #[must_use]
    pub fn reference_literals(&self) -> &[ObjectHandle] {
        &self.reference_literals
    }

    #[must_use]
    pub fn code_start(&self) -> Option<u64> {
        self.code_start
    }

    /// Rewrite the pc-relative displacement of the call at `call_position` to reach `target`.
    ///
    /// # Panics
    ///
    /// - if the method is not installed
    /// - if the call is not a recorded call site
    /// - if the displacement word straddles a cache line, which would break atomic patching
    pub fn patch_call_site(&mut self, target_desc: &Target, call_position: u32, target: u64) {
        let code_start = self.code_start.expect("patching an uninstalled method");
        let recorded = self
            .direct_calls
            .iter()
            .map(|site| site.position)
            .chain(self.runtime_calls.iter().map(|site| site.position))
            .any(|position| position == call_position);
        assert!(recorded, "position {call_position} is not a call site");
        // The displacement word of `call rel32` starts one byte into the instruction
        let word_position = u64::from(call_position) + 1;
        let word_address = code_start + word_position;
        assert!(
            target_desc.is_within_cache_line(word_address, 4),
            "call site patch at {word_address:#x} straddles a cache line"
        );
        let next = code_start + u64::from(call_position) + 5;
        let displacement = i64::try_from(target).unwrap_or(0) - i64::try_from(next).unwrap_or(0);
        let displacement =
            i32::try_from(displacement).expect("patched call target out of rel32 range");
        let word = usize::try_from(word_position).unwrap_or(usize::MAX);
        LittleEndian::write_i32(&mut self.code[word..word + 4], displacement);
        debug!(method = %self.name, call_position, target, "patched call site");
    }

    /// Redirect both entry points of this method to the corresponding entries of `new_method`
    /// with unconditional jumps.
    ///
    /// # Panics
    ///
    /// if either method is not installed
    pub fn forward_to(&mut self, new_method: &TargetMethod) {
        let code_start = self.code_start.expect("forwarding an uninstalled method");
        let new_start = new_method
            .code_start
            .expect("forwarding to an uninstalled method");
        let mut entries = vec![(self.opt_entry, new_method.opt_entry)];
        if self.baseline_entry != self.opt_entry {
            entries.push((self.baseline_entry, new_method.baseline_entry));
        }
        for (from, to) in entries {
            let from_address = code_start + u64::from(from);
            let to_address = new_start + u64::from(to);
            let displacement = i64::try_from(to_address).unwrap_or(0)
                - i64::try_from(from_address + 5).unwrap_or(0);
            let displacement =
                i32::try_from(displacement).expect("forwarding target out of rel32 range");
            let at = usize::try_from(from).unwrap_or(usize::MAX);
            self.code[at] = 0xe9;
            LittleEndian::write_i32(&mut self.code[at + 1..at + 5], displacement);
        }
        debug!(method = %self.name, to = %new_method.name, "forwarded entry points");
    }
}

impl fmt::Display for TargetMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} [{} bytes, frame {}]", self.name, self.code.len(), self.frame_size)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn method_with_call() -> TargetMethod {
        let mut method = TargetMethod::new("Foo.bar()V".to_string());
        // nop; call rel32 0; nop; ret
        let mut code = vec![0x90, 0xe8, 0, 0, 0, 0, 0x90, 0xc3];
        code.resize(32, 0x90);
        method.set_code(code);
        method.record_direct_call(CallSite {
            position: 1,
            method: Some(7),
            stack_map: RefMap::new(0),
        });
        method.seal();
        method
    }

    #[test]
    fn test_seal_computes_stop_positions() {
        let mut method = TargetMethod::new("Foo.bar()V".to_string());
        method.set_code(vec![0x90; 16]);
        method.record_safepoint(SafepointSite {
            position: 8,
            register_map: RefMap::new(0),
            stack_map: RefMap::new(2),
        });
        method.record_direct_call(CallSite {
            position: 2,
            method: None,
            stack_map: RefMap::new(0),
        });
        method.seal();
        assert_eq!(&[2, 8], method.stop_positions());
    }

    #[test]
    #[should_panic(expected = "is sealed")]
    fn test_sealed_rejects_mutation() {
        let mut method = method_with_call();
        method.set_frame_size(16);
    }

    #[test]
    fn test_patch_call_site() {
        let target = Target::amd64();
        let mut method = method_with_call();
        method.install(0x10000);
        method.patch_call_site(&target, 1, 0x10100);
        // Displacement = 0x10100 - (0x10000 + 1 + 5)
        let displacement = LittleEndian::read_i32(&method.code()[2..6]);
        assert_eq!(0x10100 - 0x10006, displacement);
    }

    #[test]
    #[should_panic(expected = "straddles a cache line")]
    fn test_patch_straddling_cache_line() {
        let target = Target::amd64();
        let mut method = TargetMethod::new("Foo.bar()V".to_string());
        let mut code = vec![0x90; 64];
        // Call at offset 29: displacement word at 30..34 straddles the 32-byte line
        code[29] = 0xe8;
        method.set_code(code);
        method.record_direct_call(CallSite {
            position: 29,
            method: None,
            stack_map: RefMap::new(0),
        });
        method.seal();
        method.install(0x0);
        method.patch_call_site(&target, 29, 0x100);
    }

    #[test]
    fn test_forward_to() {
        let mut old = method_with_call();
        old.set_code_start_for_test(0x1000);
        let mut new = TargetMethod::new("Foo.bar()V".to_string());
        new.set_code(vec![0x90; 16]);
        new.set_entries(8, 0);
        new.seal();
        new.install(0x2000);
        old.forward_to(&new);
        assert_eq!(0xe9, old.code()[0]);
        let displacement = LittleEndian::read_i32(&old.code()[1..5]);
        // old entry 0 at 0x1000 jumps to new baseline entry 0 at 0x2000... both entries
        // default to 0, so only the opt entry jump is written
        assert_eq!(0x2008 - 0x1005, displacement);
    }

    #[test]
    fn test_reference_literals_are_interned() {
        let mut method = TargetMethod::new("Foo.bar()V".to_string());
        let first = method.add_reference_literal(ObjectHandle(9));
        let second = method.add_reference_literal(ObjectHandle(4));
        let third = method.add_reference_literal(ObjectHandle(9));
        assert_eq!(0, first);
        assert_eq!(1, second);
        assert_eq!(0, third);
        assert_eq!(2, method.reference_literals().len());
    }

    impl TargetMethod {
        fn set_code_start_for_test(&mut self, address: u64) {
            self.code_start = Some(address);
        }
    }
}
