//! Bytecode to HIR translation.
//!
//! The builder abstractly interprets the bytecode over a worklist of basic blocks. Each block
//! is entered with the frame state merged from its predecessors; values flowing together at a
//! join produce phis. Loop headers receive phis up front, limited to the locals actually stored
//! inside loops. Invocations may push a nested inlining scope whose return sites thread control
//! back into the caller's block stream.

use crate::error::Result;
use crate::graph::block_map::{BlockMap, build_block_map};
use crate::hir::{
    BlockFlags, BlockId, FrameState, IntrinsicId, Ir, IrHandler, NodeId, PhiSlot, StateId,
    ValueFlags, ValueTag,
};
use crate::options::Options;
use ahash::AHashMap;
use lungo_code::{
    ArithOp, Bytecode, Condition, ConstValue, Constant, InvokeKind, Kind, LogicOp, Method,
    MethodInfo, Runtime, ShiftOp, decode,
};
use std::sync::Arc;
use tracing::debug;

use crate::Error::{
    InvariantViolation, UnresolvedReference, UnsupportedBytecode, UnsupportedMethod,
};

/// One (possibly inlined) method scope under construction.
struct ScopeData {
    method: Arc<Method>,
    code: Vec<(u32, Bytecode)>,
    /// Instruction index for each bytecode index
    index_of: AHashMap<u32, usize>,
    block_map: BlockMap,
    worklist: Vec<BlockId>,
    /// Indices of this scope's handlers in the graph handler table
    handler_range: (usize, usize),
    /// Block the inlined return sites jump to
    continuation: Option<BlockId>,
    /// Caller frame at the call site, with the arguments already popped
    caller_state: Option<FrameState>,
    /// Interned caller state linked from this scope's snapshots
    caller_state_id: Option<StateId>,
    /// Call site bytecode index in the caller
    caller_bci: u32,
    /// Object locked on entry of a synchronized method
    sync_object: Option<NodeId>,
    /// First monitor number of this scope
    lock_base: u32,
    max_locals: usize,
}

/// Builds the HIR graph for one method.
pub struct GraphBuilder<'a> {
    runtime: &'a dyn Runtime,
    options: &'a Options,
    ir: Ir,
    scopes: Vec<ScopeData>,
    /// Owning scope index of every block
    block_scope: AHashMap<BlockId, usize>,
    cur_block: BlockId,
    state: FrameState,
}

/// Build the HIR graph of `method`, or bail out.
///
/// # Errors
///
/// - if the method is native or abstract
/// - if the bytecode is malformed, unsupported or references unresolvable pool entries
/// - if an internal invariant does not hold during construction
pub fn build_graph(
    runtime: &dyn Runtime,
    options: &Options,
    method: Arc<Method>,
    osr_bci: Option<u32>,
) -> Result<Ir> {
    let mut builder = GraphBuilder {
        runtime,
        options,
        ir: Ir::new(),
        scopes: Vec::new(),
        block_scope: AHashMap::default(),
        cur_block: BlockId(0),
        state: FrameState::new(0, 0, None),
    };
    builder.build(method, osr_bci)?;
    Ok(builder.ir)
}

impl<'a> GraphBuilder<'a> {
    fn build(&mut self, method: Arc<Method>, osr_bci: Option<u32>) -> Result<()> {
        if method.flags.contains(lungo_code::MethodFlags::NATIVE) {
            return Err(UnsupportedMethod(format!("native method {method}")));
        }
        if method.code.is_empty() {
            return Err(UnsupportedMethod(format!("abstract method {method}")));
        }
        if method.is_synchronized() && method.no_safepoints() {
            return Err(UnsupportedMethod(format!(
                "synchronized NO_SAFEPOINTS method {method}"
            )));
        }
        let signature = method.signature()?;
        let code = decode(&method.code)?;
        let max_locals = usize::from(method.max_locals);

        // The start block holds the parameter definitions and the Base end
        let start = self.ir.new_block(0, BlockFlags::STANDARD_ENTRY);
        self.push_scope(
            Arc::clone(&method),
            code,
            max_locals,
            osr_bci.is_some(),
            None,
            None,
            0,
        )?;
        self.cur_block = start;
        self.block_scope.insert(start, 0);

        // Bind parameters to Local nodes
        let mut entry_state = FrameState::new(0, max_locals, None);
        let mut slot = 0u32;
        for kind in signature.argument_kinds(method.has_receiver()) {
            let stack_kind = kind.stack_kind();
            let local = self.append(stack_kind, ValueTag::Local { index: slot }, 0);
            if slot == 0 && method.has_receiver() {
                self.ir.value_mut(local).flags |= ValueFlags::NON_NULL;
            }
            entry_state.store_local(usize::try_from(slot)?, local, kind.slots() == 2, false);
            slot += kind.slots();
        }

        // Synchronized methods lock on entry and unlock on every exit edge
        if method.is_synchronized() {
            let object = if method.has_receiver() {
                entry_state.local(0).ok_or_else(|| {
                    InvariantViolation("synchronized method without receiver local".to_string())
                })?
            } else {
                let holder = self.runtime.method_holder(&method);
                self.constant(ConstValue::Object(holder.handle), 0)
            };
            self.state = entry_state.clone();
            let state_id = self.snapshot(0);
            let enter = self.append(
                Kind::Void,
                ValueTag::MonitorEnter { object, lock: 0 },
                0,
            );
            self.ir.value_mut(enter).state = Some(state_id);
            entry_state.locks.push(object);
            self.ir.max_locks = self.ir.max_locks.max(1);
            self.scope_mut().sync_object = Some(object);
            self.create_sync_unwind(object)?;
        }

        self.append(Kind::Void, ValueTag::Base, 0);
        self.ir.start_block = Some(start);

        // Edge from the start block into the bytecode entry
        let entry = self.block_at(0)?;
        self.state = entry_state;
        self.join(entry)?;
        self.process_scope()?;

        if let Some(osr_bci) = osr_bci {
            self.wire_osr_entry(osr_bci)?;
        }
        self.split_critical_edges();
        debug!(
            method = %method,
            blocks = self.ir.block_count(),
            values = self.ir.value_count(),
            "graph built"
        );
        Ok(())
    }

    // Scope handling

    #[expect(clippy::too_many_arguments)]
    fn push_scope(
        &mut self,
        method: Arc<Method>,
        code: Vec<(u32, Bytecode)>,
        max_locals: usize,
        force_loop_phis: bool,
        caller_state: Option<FrameState>,
        caller_state_id: Option<StateId>,
        caller_bci: u32,
    ) -> Result<()> {
        let scope_index = self.scopes.len();
        let block_map = build_block_map(
            &mut self.ir,
            &code,
            &method.exception_handlers,
            max_locals,
            force_loop_phis,
        );
        for block in block_map.block_at.values() {
            self.block_scope.insert(*block, scope_index);
        }
        let handler_start = self.ir.handlers.len();
        for handler in &method.exception_handlers {
            let block = *block_map.block_at.get(&handler.handler_bci).ok_or_else(|| {
                InvariantViolation(format!(
                    "handler entry {} is not a block start",
                    handler.handler_bci
                ))
            })?;
            let catch_type = match handler.catch_type {
                Some(index) => Some(
                    self.runtime
                        .resolve_class(&method.constant_pool, index)
                        .ok_or(UnresolvedReference { index })?
                        .handle,
                ),
                None => None,
            };
            self.ir.handlers.push(IrHandler {
                start_bci: handler.start_bci,
                end_bci: handler.end_bci,
                block,
                catch_type,
                synthetic: false,
            });
        }
        let handler_range = (handler_start, self.ir.handlers.len());
        let index_of = code
            .iter()
            .enumerate()
            .map(|(index, (bci, _))| (*bci, index))
            .collect();
        let lock_base = self
            .scopes
            .last()
            .map_or(0, |scope| scope.lock_base + u32::try_from(self.state.locks.len()).unwrap_or(0));
        self.scopes.push(ScopeData {
            method,
            code,
            index_of,
            block_map,
            worklist: Vec::new(),
            handler_range,
            continuation: None,
            caller_state,
            caller_state_id,
            caller_bci,
            sync_object: None,
            lock_base,
            max_locals,
        });
        Ok(())
    }

    fn scope(&self) -> &ScopeData {
        self.scopes.last().expect("no active scope")
    }

    fn scope_mut(&mut self) -> &mut ScopeData {
        self.scopes.last_mut().expect("no active scope")
    }

    fn block_at(&self, bci: u32) -> Result<BlockId> {
        self.scope()
            .block_map
            .block_at
            .get(&bci)
            .copied()
            .ok_or_else(|| InvariantViolation(format!("no block at bytecode index {bci}")))
    }

    /// Create the synthetic unwind block releasing the monitor of a synchronized method.
    fn create_sync_unwind(&mut self, object: NodeId) -> Result<()> {
        let unwind = self
            .ir
            .new_block(u32::MAX, BlockFlags::SYNC_UNWIND | BlockFlags::VISITED);
        let exception = self.ir.new_value(unwind, u32::MAX, Kind::Object, ValueTag::ExceptionObject);
        self.ir.append(unwind, exception);
        let exit = self.ir.new_value(
            unwind,
            u32::MAX,
            Kind::Void,
            ValueTag::MonitorExit { object, lock: 0 },
        );
        let state = self.ir.intern_state(FrameState {
            bci: u32::MAX,
            locals: Vec::new(),
            stack: vec![Some(exception)],
            locks: Vec::new(),
            caller: None,
        });
        self.ir.value_mut(exit).state = Some(state);
        self.ir.append(unwind, exit);
        let throw = self.ir.new_value(
            unwind,
            u32::MAX,
            Kind::Void,
            ValueTag::Throw { exception },
        );
        self.ir.value_mut(throw).state = Some(state);
        self.ir.append(unwind, throw);
        self.ir.block_mut(unwind).state_before = Some(state);
        self.ir.handlers.push(IrHandler {
            start_bci: 0,
            end_bci: u32::MAX,
            block: unwind,
            catch_type: None,
            synthetic: true,
        });
        Ok(())
    }

    // Worklist

    fn process_scope(&mut self) -> Result<()> {
        while let Some(block) = self.scope_mut().worklist.pop() {
            self.ir.block_mut(block).flags.remove(BlockFlags::ON_WORKLIST);
            if self.ir.block(block).is_visited() {
                continue;
            }
            self.parse_block(block)?;
        }
        Ok(())
    }

    fn parse_block(&mut self, block: BlockId) -> Result<()> {
        self.ir.block_mut(block).flags |= BlockFlags::VISITED;
        self.cur_block = block;
        let state_id = self.ir.block(block).state_before.ok_or_else(|| {
            InvariantViolation(format!("parsing {block} without an entry state"))
        })?;
        self.state = self.ir.state(state_id).clone();

        if self.ir.block(block).is_exception_entry() {
            let exception = self.append(Kind::Object, ValueTag::ExceptionObject, self.state.bci);
            self.ir.value_mut(exception).flags |= ValueFlags::NON_NULL;
            self.state.push(1, exception);
        }

        let start_bci = self.ir.block(block).bci;
        let mut index = *self
            .scope()
            .index_of
            .get(&start_bci)
            .ok_or_else(|| InvariantViolation(format!("no instruction at {start_bci}")))?;
        loop {
            let Some((bci, bytecode)) = self.scope().code.get(index).cloned() else {
                return Err(InvariantViolation(format!(
                    "control falls off the end of the bytecode after {start_bci}"
                )));
            };
            if bci != start_bci && self.scope().block_map.is_start(bci) {
                // Fall through into the next block
                let target = self.block_at(bci)?;
                self.append(Kind::Void, ValueTag::Goto, bci);
                return self.join(target);
            }
            if self.append_bytecode(bci, &bytecode)? {
                return Ok(());
            }
            index += 1;
        }
    }

    // State plumbing

    /// Intern the working state at `bci`, linking the caller chain of the current scope.
    fn snapshot(&mut self, bci: u32) -> StateId {
        let mut state = self.state.clone();
        state.bci = bci;
        state.caller = self.scope().caller_state_id;
        self.ir.intern_state(state)
    }

    fn append(&mut self, kind: Kind, tag: ValueTag, bci: u32) -> NodeId {
        let node = self.ir.new_value(self.cur_block, bci, kind, tag);
        self.ir.append(self.cur_block, node);
        node
    }

    fn constant(&mut self, value: ConstValue, bci: u32) -> NodeId {
        let kind = value.kind();
        self.append(kind, ValueTag::Constant(value), bci)
    }

    fn pop(&mut self, kind: Kind) -> NodeId {
        self.state.pop(kind.stack_kind().slots())
    }

    fn push(&mut self, kind: Kind, node: NodeId) {
        self.state.push(kind.stack_kind().slots(), node);
    }

    fn value_kind(&self, node: NodeId) -> Kind {
        self.ir.value(node).kind
    }

    /// Append a null check for `object` unless it is known non-null.
    fn null_check(&mut self, object: NodeId, state: StateId, bci: u32) {
        let value = self.ir.value(object);
        if value.flags.contains(ValueFlags::NON_NULL) {
            return;
        }
        if matches!(
            value.as_constant(),
            Some(ConstValue::Object(..))
        ) {
            return;
        }
        let check = self.append(Kind::Object, ValueTag::NullCheck { object }, bci);
        self.ir.value_mut(check).state = Some(state);
        self.ir.value_mut(object).flags |= ValueFlags::NON_NULL;
        self.handle_exceptions(bci, check);
    }

    // Control flow edges

    /// Add an edge from the current block to `target` and merge the working state into it.
    fn join(&mut self, target: BlockId) -> Result<()> {
        self.ir.add_edge(self.cur_block, target);
        self.merge_into(target)?;
        let block = self.ir.block(target);
        if !block.is_visited() && !block.flags.contains(BlockFlags::ON_WORKLIST) {
            self.ir.block_mut(target).flags |= BlockFlags::ON_WORKLIST;
            let scope_index = *self
                .block_scope
                .get(&target)
                .ok_or_else(|| InvariantViolation(format!("{target} belongs to no scope")))?;
            self.scopes[scope_index].worklist.push(target);
        }
        Ok(())
    }

    fn merge_into(&mut self, target: BlockId) -> Result<()> {
        let preds = self.ir.block(target).predecessors.len();
        let target_bci = self.ir.block(target).bci;
        // The caller link follows the scope that owns the target, which differs from the
        // current scope when an inlined return joins the caller's continuation
        let target_caller = self
            .block_scope
            .get(&target)
            .map_or_else(|| self.scope().caller_state_id, |scope| self.scopes[*scope].caller_state_id);
        match self.ir.block(target).state_before {
            None => {
                let mut state = self.state.clone();
                state.bci = target_bci;
                state.caller = target_caller;
                if self.ir.block(target).is_loop_header() {
                    // Phis up front, limited to locals stored inside loops
                    let stores = &self.scope().block_map.stores_in_loops;
                    let phi_locals: Vec<usize> = (0..state.locals.len())
                        .filter(|index| {
                            state.locals[*index].is_some()
                                && *index < stores.len()
                                && stores.get(*index)
                        })
                        .collect();
                    for index in phi_locals {
                        let old = state.locals[index].ok_or_else(|| {
                            InvariantViolation("loop phi over a dead local".to_string())
                        })?;
                        let kind = self.value_kind(old);
                        let phi = self.ir.new_phi(
                            target,
                            kind,
                            PhiSlot::Local(u32::try_from(index)?),
                            vec![old],
                        );
                        state.locals[index] = Some(phi);
                    }
                    for index in 0..state.stack.len() {
                        if let Some(old) = state.stack[index] {
                            let kind = self.value_kind(old);
                            let phi = self.ir.new_phi(
                                target,
                                kind,
                                PhiSlot::Stack(u32::try_from(index)?),
                                vec![old],
                            );
                            state.stack[index] = Some(phi);
                        }
                    }
                }
                let state_id = self.ir.intern_state(state);
                self.ir.block_mut(target).state_before = Some(state_id);
                Ok(())
            }
            Some(existing) => {
                let mut merged = self.ir.state(existing).clone();
                if merged.stack.len() != self.state.stack.len() {
                    return Err(InvariantViolation(format!(
                        "stack depth mismatch merging into {target}: {} vs {}",
                        merged.stack.len(),
                        self.state.stack.len()
                    )));
                }
                let visited = self.ir.block(target).is_visited();
                let local_count = merged.locals.len().min(self.state.locals.len());
                for index in 0..local_count {
                    let incoming = self.state.locals[index];
                    self.merge_slot(target, preds, visited, true, &mut merged.locals, index, incoming)?;
                }
                for index in local_count..merged.locals.len() {
                    self.kill_slot(target, &mut merged.locals, index);
                }
                for index in 0..merged.stack.len() {
                    let incoming = self.state.stack[index];
                    self.merge_slot(target, preds, visited, false, &mut merged.stack, index, incoming)?;
                }
                // Locks must agree along every path
                let common = merged
                    .locks
                    .iter()
                    .zip(self.state.locks.iter())
                    .take_while(|(left, right)| left == right)
                    .count();
                if common != merged.locks.len() || common != self.state.locks.len() {
                    return Err(InvariantViolation(format!(
                        "monitor stacks differ merging into {target}"
                    )));
                }
                let state_id = self.ir.intern_state(merged);
                self.ir.block_mut(target).state_before = Some(state_id);
                Ok(())
            }
        }
    }

    #[expect(clippy::too_many_arguments)]
    fn merge_slot(
        &mut self,
        target: BlockId,
        preds: usize,
        visited: bool,
        is_local: bool,
        slots: &mut [Option<NodeId>],
        index: usize,
        incoming: Option<NodeId>,
    ) -> Result<()> {
        let Some(existing) = slots[index] else {
            return Ok(());
        };
        let Some(incoming) = incoming else {
            self.kill_slot(target, slots, index);
            return Ok(());
        };
        if existing == incoming {
            return Ok(());
        }
        let existing_kind = self.value_kind(existing).stack_kind();
        let incoming_kind = self.value_kind(incoming).stack_kind();
        if existing_kind != incoming_kind {
            self.kill_slot(target, slots, index);
            return Ok(());
        }
        if self.ir.value(existing).is_phi_of(target) {
            let ValueTag::Phi { inputs, .. } = &mut self.ir.value_mut(existing).tag else {
                return Err(InvariantViolation("phi tag changed".to_string()));
            };
            inputs.push(incoming);
            return Ok(());
        }
        if visited {
            return Err(InvariantViolation(format!(
                "merge into already parsed {target} requires a phi"
            )));
        }
        let slot = if is_local {
            PhiSlot::Local(u32::try_from(index)?)
        } else {
            PhiSlot::Stack(u32::try_from(index)?)
        };
        let mut inputs = vec![existing; preds.saturating_sub(1)];
        inputs.push(incoming);
        let phi = self.ir.new_phi(target, existing_kind, slot, inputs);
        slots[index] = Some(phi);
        Ok(())
    }

    fn kill_slot(&mut self, target: BlockId, slots: &mut [Option<NodeId>], index: usize) {
        if let Some(existing) = slots[index]
            && self.ir.value(existing).is_phi_of(target)
        {
            self.ir.block_mut(target).phis.retain(|phi| *phi != existing);
        }
        slots[index] = None;
    }

    // Exception edges

    /// Merge the frame into every handler covering the current point, walking outward through
    /// the inlining scopes until a catch-all handler stops propagation. The covering handlers
    /// are recorded on `node` for the emitter's exception table.
    fn handle_exceptions(&mut self, bci: u32, node: NodeId) {
        let mut level = self.scopes.len();
        let mut at_bci = bci;
        let mut locals = self.state.locals.clone();
        let mut locks = self.state.locks.clone();
        let mut recorded: Vec<(BlockId, Option<lungo_code::ObjectHandle>)> = Vec::new();
        loop {
            level -= 1;
            let (range_start, range_end) = self.scopes[level].handler_range;
            // The synthetic catch-all of a synchronized method sits past the recorded range
            let covering = self
                .ir
                .handlers
                .iter()
                .enumerate()
                .skip(range_start)
                .filter(|(index, handler)| {
                    (*index < range_end || (level == 0 && handler.synthetic))
                        && handler.covers(at_bci)
                })
                .map(|(_, handler)| (handler.block, handler.catch_type))
                .collect::<Vec<_>>();
            let mut stopped = false;
            for (handler_block, catch_type) in covering {
                if self.ir.block(handler_block).flags.contains(BlockFlags::SYNC_UNWIND)
                    && self.cur_block == handler_block
                {
                    continue;
                }
                self.merge_handler(handler_block, &locals, &locks);
                recorded.push((handler_block, catch_type));
                if catch_type.is_none() {
                    stopped = true;
                    break;
                }
            }
            if stopped || level == 0 {
                self.ir.value_mut(node).handlers = recorded;
                return;
            }
            // Step out to the caller scope
            let child = &self.scopes[level];
            at_bci = child.caller_bci;
            if let Some(caller_state) = &child.caller_state {
                locals = caller_state.locals.clone();
                locks = caller_state.locks.clone();
            } else {
                self.ir.value_mut(node).handlers = recorded;
                return;
            }
        }
    }

    /// Merge locals into a handler entry state, killing slots that differ between throwing
    /// sites. Handlers never receive phis; a differing local is simply dead in the handler.
    fn merge_handler(&mut self, handler: BlockId, locals: &[Option<NodeId>], locks: &[NodeId]) {
        let handler_bci = self.ir.block(handler).bci;
        match self.ir.block(handler).state_before {
            None => {
                let state = FrameState {
                    bci: handler_bci,
                    locals: locals.to_vec(),
                    stack: Vec::new(),
                    locks: locks.to_vec(),
                    caller: None,
                };
                let state_id = self.ir.intern_state(state);
                self.ir.block_mut(handler).state_before = Some(state_id);
            }
            Some(existing) => {
                let mut merged = self.ir.state(existing).clone();
                for index in 0..merged.locals.len() {
                    let incoming = locals.get(index).copied().flatten();
                    if merged.locals[index] != incoming {
                        merged.locals[index] = None;
                    }
                }
                let common = merged
                    .locks
                    .iter()
                    .zip(locks.iter())
                    .take_while(|(left, right)| left == right)
                    .count();
                merged.locks.truncate(common);
                let state_id = self.ir.intern_state(merged);
                self.ir.block_mut(handler).state_before = Some(state_id);
            }
        }
        let block = self.ir.block(handler);
        if !block.is_visited() && !block.flags.contains(BlockFlags::ON_WORKLIST) {
            self.ir.block_mut(handler).flags |= BlockFlags::ON_WORKLIST;
            if let Some(scope_index) = self.block_scope.get(&handler).copied() {
                self.scopes[scope_index].worklist.push(handler);
            } else {
                // Synthetic unwind blocks are prebuilt and never parsed
                self.ir.block_mut(handler).flags.remove(BlockFlags::ON_WORKLIST);
            }
        }
    }

    // OSR and critical edges

    /// Wire the on stack replacement entry: a block that materializes the frame from the OSR
    /// buffer and jumps to the loop header.
    fn wire_osr_entry(&mut self, osr_bci: u32) -> Result<()> {
        let target = self.block_at(osr_bci)?;
        let Some(target_state) = self.ir.block(target).state_before else {
            return Err(UnsupportedMethod(format!(
                "OSR entry at unreachable bytecode index {osr_bci}"
            )));
        };
        if !self.ir.block(target).is_loop_header() {
            return Err(UnsupportedMethod(format!(
                "OSR entry at {osr_bci} is not a loop header"
            )));
        }
        let template = self.ir.state(target_state).clone();
        if !template.stack.is_empty() {
            return Err(UnsupportedMethod(
                "OSR entry with a non-empty operand stack".to_string(),
            ));
        }
        if !template.locks.is_empty() {
            return Err(UnsupportedMethod("OSR entry with held monitors".to_string()));
        }
        let osr = self
            .ir
            .new_block(osr_bci, BlockFlags::OSR_ENTRY | BlockFlags::VISITED);
        self.cur_block = osr;
        let buffer = self.append(Kind::Word, ValueTag::OsrEntry, osr_bci);
        let mut locals = vec![None; template.locals.len()];
        for (index, slot) in template.locals.iter().enumerate() {
            if let Some(node) = slot {
                let kind = self.value_kind(*node).stack_kind();
                let offset = i32::try_from(index)? * 8;
                let load = self.append(
                    kind,
                    ValueTag::LoadPointer {
                        pointer: buffer,
                        offset,
                    },
                    osr_bci,
                );
                locals[index] = Some(load);
            }
        }
        self.state = FrameState {
            bci: osr_bci,
            locals,
            stack: Vec::new(),
            locks: Vec::new(),
            caller: None,
        };
        self.append(Kind::Void, ValueTag::Goto, osr_bci);
        self.join(target)?;
        let start = self
            .ir
            .start_block
            .ok_or_else(|| InvariantViolation("no start block".to_string()))?;
        self.ir.add_edge(start, osr);
        self.ir.osr_block = Some(osr);
        Ok(())
    }

    /// Split every critical edge so phi moves always have a block of their own.
    fn split_critical_edges(&mut self) {
        let block_count = self.ir.block_count();
        for index in 0..block_count {
            let block = BlockId(u32::try_from(index).unwrap_or(u32::MAX));
            if self.ir.block(block).successors.len() < 2 {
                continue;
            }
            let successors = self.ir.block(block).successors.clone();
            for (position, successor) in successors.iter().enumerate() {
                if self.ir.block(*successor).predecessors.len() < 2 {
                    continue;
                }
                let bci = self.ir.block(*successor).bci;
                let split = self.ir.new_block(bci, BlockFlags::VISITED);
                let goto = self.ir.new_value(split, bci, Kind::Void, ValueTag::Goto);
                self.ir.append(split, goto);
                self.ir.block_mut(block).successors[position] = split;
                self.ir.block_mut(split).predecessors.push(block);
                self.ir.block_mut(split).successors.push(*successor);
                // Replace the first remaining occurrence to keep phi input order aligned
                let preds = &mut self.ir.block_mut(*successor).predecessors;
                if let Some(slot) = preds.iter().position(|pred| *pred == block) {
                    preds[slot] = split;
                }
            }
        }
    }

    // Bytecode dispatch

    /// Append the HIR for one instruction; returns whether the block ended.
    #[expect(clippy::too_many_lines)]
    fn append_bytecode(&mut self, bci: u32, bytecode: &Bytecode) -> Result<bool> {
        match bytecode {
            Bytecode::Nop => {}
            Bytecode::AconstNull => {
                let node = self.constant(ConstValue::Null, bci);
                self.push(Kind::Object, node);
            }
            Bytecode::Iconst(value) => {
                let node = self.constant(ConstValue::Int(*value), bci);
                self.push(Kind::Int, node);
            }
            Bytecode::Lconst(value) => {
                let node = self.constant(ConstValue::Long(*value), bci);
                self.push(Kind::Long, node);
            }
            Bytecode::Fconst(value) => {
                let node = self.constant(ConstValue::Float(*value), bci);
                self.push(Kind::Float, node);
            }
            Bytecode::Dconst(value) => {
                let node = self.constant(ConstValue::Double(*value), bci);
                self.push(Kind::Double, node);
            }
            Bytecode::Ldc(index) => return self.do_ldc(bci, *index),
            Bytecode::Ldc2(index) => return self.do_ldc2(bci, *index),
            Bytecode::Load(kind, index) => {
                let node = self.state.local(usize::from(*index)).ok_or_else(|| {
                    InvariantViolation(format!("load of dead local {index} at {bci}"))
                })?;
                self.push(*kind, node);
            }
            Bytecode::Store(kind, index) => {
                let value = self.pop(*kind);
                self.store_local_checked(usize::from(*index), value, kind.slots() == 2);
            }
            Bytecode::Iinc(index, constant) => {
                let local = self.state.local(usize::from(*index)).ok_or_else(|| {
                    InvariantViolation(format!("iinc of dead local {index} at {bci}"))
                })?;
                let amount = self.constant(ConstValue::Int(*constant), bci);
                let sum = self.arithmetic(ArithOp::Add, Kind::Int, local, amount, bci, None);
                self.store_local_checked(usize::from(*index), sum, false);
            }
            Bytecode::ArrayLoad(element) => return self.do_array_load(bci, *element),
            Bytecode::ArrayStore(element) => return self.do_array_store(bci, *element),
            Bytecode::Pop => {
                self.state.raw_pop();
            }
            Bytecode::Pop2 => {
                self.state.raw_pop();
                self.state.raw_pop();
            }
            Bytecode::Dup => {
                let top = self.state.raw_pop();
                self.state.raw_push(top);
                self.state.raw_push(top);
            }
            Bytecode::DupX1 => {
                let v1 = self.state.raw_pop();
                let v2 = self.state.raw_pop();
                self.state.raw_push(v1);
                self.state.raw_push(v2);
                self.state.raw_push(v1);
            }
            Bytecode::DupX2 => {
                let v1 = self.state.raw_pop();
                let v2 = self.state.raw_pop();
                let v3 = self.state.raw_pop();
                self.state.raw_push(v1);
                self.state.raw_push(v3);
                self.state.raw_push(v2);
                self.state.raw_push(v1);
            }
            Bytecode::Dup2 => {
                let v1 = self.state.raw_pop();
                let v2 = self.state.raw_pop();
                self.state.raw_push(v2);
                self.state.raw_push(v1);
                self.state.raw_push(v2);
                self.state.raw_push(v1);
            }
            Bytecode::Dup2X1 => {
                let v1 = self.state.raw_pop();
                let v2 = self.state.raw_pop();
                let v3 = self.state.raw_pop();
                self.state.raw_push(v2);
                self.state.raw_push(v1);
                self.state.raw_push(v3);
                self.state.raw_push(v2);
                self.state.raw_push(v1);
            }
            Bytecode::Dup2X2 => {
                let v1 = self.state.raw_pop();
                let v2 = self.state.raw_pop();
                let v3 = self.state.raw_pop();
                let v4 = self.state.raw_pop();
                self.state.raw_push(v2);
                self.state.raw_push(v1);
                self.state.raw_push(v4);
                self.state.raw_push(v3);
                self.state.raw_push(v2);
                self.state.raw_push(v1);
            }
            Bytecode::Swap => {
                let v1 = self.state.raw_pop();
                let v2 = self.state.raw_pop();
                self.state.raw_push(v1);
                self.state.raw_push(v2);
            }
            Bytecode::Arith(op, kind) => {
                let trapping = matches!(op, ArithOp::Div | ArithOp::Rem)
                    && matches!(kind, Kind::Int | Kind::Long);
                let state = trapping.then(|| self.snapshot(bci));
                let y = self.pop(*kind);
                let x = self.pop(*kind);
                let node = self.arithmetic(*op, *kind, x, y, bci, state);
                self.push(*kind, node);
                if trapping {
                    self.handle_exceptions(bci, node);
                }
            }
            Bytecode::Neg(kind) => {
                let x = self.pop(*kind);
                let node = match self.fold_negate(*kind, x) {
                    Some(folded) => self.constant(folded, bci),
                    None => self.append(*kind, ValueTag::Negate { x }, bci),
                };
                self.push(*kind, node);
            }
            Bytecode::Shift(op, kind) => {
                let y = self.pop(Kind::Int);
                let x = self.pop(*kind);
                let node = match self.fold_shift(*op, *kind, x, y) {
                    Some(folded) => self.constant(folded, bci),
                    None => self.append(*kind, ValueTag::ShiftOp { op: *op, x, y }, bci),
                };
                self.push(*kind, node);
            }
            Bytecode::Logic(op, kind) => {
                let y = self.pop(*kind);
                let x = self.pop(*kind);
                let node = match self.fold_logic(*op, *kind, x, y) {
                    Some(folded) => self.constant(folded, bci),
                    None => self.append(*kind, ValueTag::LogicOp { op: *op, x, y }, bci),
                };
                self.push(*kind, node);
            }
            Bytecode::Convert(from, to) => {
                let x = self.pop(*from);
                let node = match self.fold_convert(*from, *to, x) {
                    Some(folded) => self.constant(folded, bci),
                    None => self.append(*to, ValueTag::Convert { x }, bci),
                };
                self.push(to.stack_kind(), node);
            }
            Bytecode::Compare { kind, nan_greater } => {
                let y = self.pop(*kind);
                let x = self.pop(*kind);
                let node = self.append(
                    Kind::Int,
                    ValueTag::Compare {
                        x,
                        y,
                        nan_greater: *nan_greater,
                    },
                    bci,
                );
                self.push(Kind::Int, node);
            }
            Bytecode::If(condition, target) => {
                let y = self.constant(ConstValue::Int(0), bci);
                let x = self.pop(Kind::Int);
                return self.do_if(bci, x, *condition, y, *target);
            }
            Bytecode::IfIcmp(condition, target) => {
                let y = self.pop(Kind::Int);
                let x = self.pop(Kind::Int);
                return self.do_if(bci, x, *condition, y, *target);
            }
            Bytecode::IfAcmp(condition, target) => {
                let y = self.pop(Kind::Object);
                let x = self.pop(Kind::Object);
                return self.do_if(bci, x, *condition, y, *target);
            }
            Bytecode::IfNull { is_null, target } => {
                let y = self.constant(ConstValue::Null, bci);
                let x = self.pop(Kind::Object);
                let condition = if *is_null {
                    Condition::Equal
                } else {
                    Condition::NotEqual
                };
                return self.do_if(bci, x, condition, y, *target);
            }
            Bytecode::Goto(target) => {
                if *target <= bci {
                    self.append_safepoint(bci);
                }
                let block = self.block_at(*target)?;
                self.append(Kind::Void, ValueTag::Goto, bci);
                self.join(block)?;
                return Ok(true);
            }
            Bytecode::TableSwitch {
                default,
                low,
                targets,
            } => {
                let value = self.pop(Kind::Int);
                if targets.iter().chain([default]).any(|target| *target <= bci) {
                    self.append_safepoint(bci);
                }
                self.append(
                    Kind::Void,
                    ValueTag::TableSwitch { value, low: *low },
                    bci,
                );
                for target in targets {
                    let block = self.block_at(*target)?;
                    self.join(block)?;
                }
                let block = self.block_at(*default)?;
                self.join(block)?;
                return Ok(true);
            }
            Bytecode::LookupSwitch { default, pairs } => {
                let value = self.pop(Kind::Int);
                if pairs
                    .iter()
                    .map(|(_, target)| target)
                    .chain([default])
                    .any(|target| *target <= bci)
                {
                    self.append_safepoint(bci);
                }
                let keys: Vec<i32> = pairs.iter().map(|(key, _)| *key).collect();
                self.append(Kind::Void, ValueTag::LookupSwitch { value, keys }, bci);
                for (_, target) in pairs {
                    let block = self.block_at(*target)?;
                    self.join(block)?;
                }
                let block = self.block_at(*default)?;
                self.join(block)?;
                return Ok(true);
            }
            Bytecode::Return(kind) => return self.do_return(bci, *kind),
            Bytecode::GetStatic(index) => return self.do_get_field(bci, *index, true),
            Bytecode::PutStatic(index) => return self.do_put_field(bci, *index, true),
            Bytecode::GetField(index) => return self.do_get_field(bci, *index, false),
            Bytecode::PutField(index) => return self.do_put_field(bci, *index, false),
            Bytecode::Invoke(invoke, index) => return self.do_invoke(bci, *invoke, *index),
            Bytecode::New(index) => {
                let class = self.resolve_class(*index)?;
                let state = self.snapshot(bci);
                let node = self.append(Kind::Object, ValueTag::NewInstance { class }, bci);
                self.ir.value_mut(node).flags |= ValueFlags::NON_NULL;
                self.ir.value_mut(node).state = Some(state);
                self.handle_exceptions(bci, node);
                self.push(Kind::Object, node);
            }
            Bytecode::NewArray(element) => {
                let class = self.runtime.primitive_array_class(*element);
                let state = self.snapshot(bci);
                let length = self.pop(Kind::Int);
                let node = self.append(
                    Kind::Object,
                    ValueTag::NewTypeArray {
                        length,
                        element: *element,
                        class,
                    },
                    bci,
                );
                self.ir.value_mut(node).flags |= ValueFlags::NON_NULL;
                self.ir.value_mut(node).state = Some(state);
                self.handle_exceptions(bci, node);
                self.push(Kind::Object, node);
            }
            Bytecode::ANewArray(index) => {
                let component = self.resolve_class(*index)?;
                let class = self.runtime.array_class(&component);
                let state = self.snapshot(bci);
                let length = self.pop(Kind::Int);
                let node = self.append(
                    Kind::Object,
                    ValueTag::NewObjectArray { length, class },
                    bci,
                );
                self.ir.value_mut(node).flags |= ValueFlags::NON_NULL;
                self.ir.value_mut(node).state = Some(state);
                self.handle_exceptions(bci, node);
                self.push(Kind::Object, node);
            }
            Bytecode::MultiANewArray(index, dimension_count) => {
                let class = self.resolve_class(*index)?;
                let state = self.snapshot(bci);
                let mut dimensions = Vec::with_capacity(usize::from(*dimension_count));
                for _ in 0..*dimension_count {
                    dimensions.push(self.pop(Kind::Int));
                }
                dimensions.reverse();
                let node = self.append(
                    Kind::Object,
                    ValueTag::NewMultiArray { class, dimensions },
                    bci,
                );
                self.ir.value_mut(node).flags |= ValueFlags::NON_NULL;
                self.ir.value_mut(node).state = Some(state);
                self.handle_exceptions(bci, node);
                self.push(Kind::Object, node);
            }
            Bytecode::ArrayLength => {
                let state = self.snapshot(bci);
                let array = self.pop(Kind::Object);
                let node = self.append(Kind::Int, ValueTag::ArrayLength { array }, bci);
                self.ir.value_mut(node).state = Some(state);
                self.handle_exceptions(bci, node);
                self.push(Kind::Int, node);
            }
            Bytecode::Athrow => {
                let state = self.snapshot(bci);
                let exception = self.pop(Kind::Object);
                self.null_check(exception, state, bci);
                let node = self.append(Kind::Void, ValueTag::Throw { exception }, bci);
                self.ir.value_mut(node).state = Some(state);
                self.handle_exceptions(bci, node);
                return Ok(true);
            }
            Bytecode::CheckCast(index) => {
                let class = self.resolve_class(*index)?;
                let state = self.snapshot(bci);
                let object = self.pop(Kind::Object);
                let node = self.append(Kind::Object, ValueTag::CheckCast { object, class }, bci);
                self.ir.value_mut(node).state = Some(state);
                self.handle_exceptions(bci, node);
                self.push(Kind::Object, node);
            }
            Bytecode::InstanceOf(index) => {
                let class = self.resolve_class(*index)?;
                let object = self.pop(Kind::Object);
                let node = self.append(Kind::Int, ValueTag::InstanceOf { object, class }, bci);
                self.push(Kind::Int, node);
            }
            Bytecode::MonitorEnter => return self.do_monitor(bci, true),
            Bytecode::MonitorExit => return self.do_monitor(bci, false),
            Bytecode::Jsr(..) | Bytecode::Ret(..) | Bytecode::Breakpoint => {
                return Err(UnsupportedBytecode {
                    bci,
                    bytecode: format!("{bytecode}"),
                });
            }
        }
        Ok(false)
    }

    fn store_local_checked(&mut self, index: usize, value: NodeId, two_slots: bool) {
        let kill_below = index > 0
            && self
                .state
                .local(index - 1)
                .is_some_and(|below| self.ir.value(below).kind.slots() == 2);
        self.state.store_local(index, value, two_slots, kill_below);
    }

    fn append_safepoint(&mut self, bci: u32) {
        if self.scope().method.no_safepoints() {
            return;
        }
        let state = self.snapshot(bci);
        let node = self.append(Kind::Void, ValueTag::Safepoint, bci);
        self.ir.value_mut(node).state = Some(state);
    }

    fn do_if(
        &mut self,
        bci: u32,
        x: NodeId,
        condition: Condition,
        y: NodeId,
        target: u32,
    ) -> Result<bool> {
        let next = self
            .scope()
            .code
            .iter()
            .find(|(at, _)| *at > bci)
            .map(|(at, _)| *at)
            .ok_or_else(|| {
                InvariantViolation(format!("conditional branch at {bci} falls off the end"))
            })?;
        // Fold a branch on two constants into a goto
        if self.options.canonicalize()
            && let (Some(left), Some(right)) = (
                self.ir.value(x).as_constant().and_then(|value| value.as_long()),
                self.ir.value(y).as_constant().and_then(|value| value.as_long()),
            )
        {
            let taken = if condition.evaluate(left, right) {
                target
            } else {
                next
            };
            if taken <= bci {
                self.append_safepoint(bci);
            }
            let block = self.block_at(taken)?;
            self.append(Kind::Void, ValueTag::Goto, bci);
            self.join(block)?;
            return Ok(true);
        }
        if target <= bci {
            self.append_safepoint(bci);
        }
        self.append(Kind::Void, ValueTag::If { x, condition, y }, bci);
        let true_block = self.block_at(target)?;
        self.join(true_block)?;
        let false_block = self.block_at(next)?;
        self.join(false_block)?;
        Ok(true)
    }

    fn do_return(&mut self, bci: u32, kind: Kind) -> Result<bool> {
        if let Some(sync_object) = self.scope().sync_object {
            let state = self.snapshot(bci);
            let lock = self.scope().lock_base;
            let exit = self.append(
                Kind::Void,
                ValueTag::MonitorExit {
                    object: sync_object,
                    lock,
                },
                bci,
            );
            self.ir.value_mut(exit).state = Some(state);
        }
        let value = if kind == Kind::Void {
            None
        } else {
            Some(self.pop(kind))
        };
        if self.scope().continuation.is_some() {
            // An inlined return threads control back into the caller
            let continuation = self.scope().continuation.ok_or_else(|| {
                InvariantViolation("inlined scope without continuation".to_string())
            })?;
            let caller_state = self
                .scope()
                .caller_state
                .clone()
                .ok_or_else(|| InvariantViolation("inlined scope without caller state".to_string()))?;
            self.state = caller_state;
            if let Some(value) = value {
                let slots = self.ir.value(value).kind.stack_kind().slots();
                self.state.push(slots, value);
            }
            self.append(Kind::Void, ValueTag::Goto, bci);
            self.join(continuation)?;
            return Ok(true);
        }
        self.append(Kind::Void, ValueTag::Return { value }, bci);
        Ok(true)
    }

    fn do_ldc(&mut self, bci: u32, index: u16) -> Result<bool> {
        let entry = self
            .scope()
            .method
            .constant_pool
            .try_get(index)
            .map_err(crate::Error::from)?
            .clone();
        let node = match entry {
            Constant::Integer(value) => self.constant(ConstValue::Int(value), bci),
            Constant::Float(value) => self.constant(ConstValue::Float(value), bci),
            Constant::String(value) => {
                let handle = self.runtime.string_constant(&value);
                self.constant(ConstValue::Object(handle), bci)
            }
            Constant::Class(..) => {
                let class = self.resolve_class(index)?;
                self.constant(ConstValue::Object(class.handle), bci)
            }
            _ => {
                return Err(UnsupportedBytecode {
                    bci,
                    bytecode: format!("ldc of {entry:?}"),
                });
            }
        };
        let kind = self.ir.value(node).kind;
        self.push(kind, node);
        Ok(false)
    }

    fn do_ldc2(&mut self, bci: u32, index: u16) -> Result<bool> {
        let entry = self
            .scope()
            .method
            .constant_pool
            .try_get(index)
            .map_err(crate::Error::from)?
            .clone();
        let node = match entry {
            Constant::Long(value) => self.constant(ConstValue::Long(value), bci),
            Constant::Double(value) => self.constant(ConstValue::Double(value), bci),
            _ => {
                return Err(UnsupportedBytecode {
                    bci,
                    bytecode: format!("ldc2 of {entry:?}"),
                });
            }
        };
        let kind = self.ir.value(node).kind;
        self.push(kind, node);
        Ok(false)
    }

    fn do_array_load(&mut self, bci: u32, element: Kind) -> Result<bool> {
        let state = self.snapshot(bci);
        let index = self.pop(Kind::Int);
        let array = self.pop(Kind::Object);
        if !self.options.gen_bounds_checks {
            // Without a range check nothing subsumes the null check
            self.null_check(array, state, bci);
        }
        let node = self.append(
            element.stack_kind(),
            ValueTag::LoadIndexed {
                array,
                index,
                element,
            },
            bci,
        );
        self.ir.value_mut(node).state = Some(state);
        self.handle_exceptions(bci, node);
        self.push(element.stack_kind(), node);
        Ok(false)
    }

    fn do_array_store(&mut self, bci: u32, element: Kind) -> Result<bool> {
        let state = self.snapshot(bci);
        let value = self.pop(element.stack_kind());
        let index = self.pop(Kind::Int);
        let array = self.pop(Kind::Object);
        if !self.options.gen_bounds_checks {
            self.null_check(array, state, bci);
        }
        let node = self.append(
            Kind::Void,
            ValueTag::StoreIndexed {
                array,
                index,
                value,
                element,
            },
            bci,
        );
        self.ir.value_mut(node).state = Some(state);
        self.handle_exceptions(bci, node);
        Ok(false)
    }

    fn do_get_field(&mut self, bci: u32, index: u16, is_static: bool) -> Result<bool> {
        let pool = &self.scope().method.constant_pool;
        let field = self
            .runtime
            .resolve_field(pool, index, is_static)
            .ok_or(UnresolvedReference { index })?;
        let state = self.snapshot(bci);
        let object = if is_static {
            None
        } else {
            let object = self.pop(Kind::Object);
            self.null_check(object, state, bci);
            Some(object)
        };
        let kind = field.kind.stack_kind();
        let node = self.append(kind, ValueTag::LoadField { object, field }, bci);
        self.ir.value_mut(node).state = Some(state);
        self.handle_exceptions(bci, node);
        self.push(kind, node);
        Ok(false)
    }

    fn do_put_field(&mut self, bci: u32, index: u16, is_static: bool) -> Result<bool> {
        let pool = &self.scope().method.constant_pool;
        let field = self
            .runtime
            .resolve_field(pool, index, is_static)
            .ok_or(UnresolvedReference { index })?;
        let state = self.snapshot(bci);
        let value = self.pop(field.kind.stack_kind());
        let object = if is_static {
            None
        } else {
            let object = self.pop(Kind::Object);
            self.null_check(object, state, bci);
            Some(object)
        };
        let node = self.append(
            Kind::Void,
            ValueTag::StoreField {
                object,
                value,
                field,
            },
            bci,
        );
        self.ir.value_mut(node).state = Some(state);
        self.handle_exceptions(bci, node);
        Ok(false)
    }

    fn do_monitor(&mut self, bci: u32, enter: bool) -> Result<bool> {
        if self.scope().method.no_safepoints() {
            return Err(UnsupportedMethod(format!(
                "monitor operation in NO_SAFEPOINTS method {}",
                self.scope().method
            )));
        }
        let state = self.snapshot(bci);
        let object = self.pop(Kind::Object);
        self.null_check(object, state, bci);
        let lock_base = self.scope().lock_base;
        let node = if enter {
            let lock = lock_base + u32::try_from(self.state.locks.len())?;
            self.state.locks.push(object);
            self.ir.max_locks = self.ir.max_locks.max(lock + 1);
            self.append(Kind::Void, ValueTag::MonitorEnter { object, lock }, bci)
        } else {
            self.state.locks.pop();
            let lock = lock_base + u32::try_from(self.state.locks.len())?;
            self.append(Kind::Void, ValueTag::MonitorExit { object, lock }, bci)
        };
        self.ir.value_mut(node).state = Some(state);
        self.handle_exceptions(bci, node);
        Ok(false)
    }

    fn resolve_class(&mut self, index: u16) -> Result<lungo_code::ClassInfo> {
        let pool = &self.scope().method.constant_pool;
        self.runtime
            .resolve_class(pool, index)
            .ok_or(UnresolvedReference { index })
    }

    // Invocations

    fn do_invoke(&mut self, bci: u32, invoke: InvokeKind, index: u16) -> Result<bool> {
        if invoke == InvokeKind::Dynamic {
            return Err(UnsupportedBytecode {
                bci,
                bytecode: "invokedynamic".to_string(),
            });
        }
        let pool = &self.scope().method.constant_pool;
        let (holder, name) = match pool.try_get(index).map_err(crate::Error::from)? {
            Constant::MethodRef { class, name, .. }
            | Constant::InterfaceMethodRef { class, name, .. } => (class.clone(), name.clone()),
            entry => {
                return Err(UnsupportedBytecode {
                    bci,
                    bytecode: format!("invoke of {entry:?}"),
                });
            }
        };
        let info = self
            .runtime
            .resolve_method(pool, index, invoke)
            .ok_or(UnresolvedReference { index })?;
        let state = self.snapshot(bci);
        let has_receiver = invoke != InvokeKind::Static;
        let mut arguments = Vec::new();
        for kind in info.signature.parameters().iter().rev() {
            arguments.push(self.pop(*kind));
        }
        if has_receiver {
            let receiver = self.pop(Kind::Object);
            self.null_check(receiver, state, bci);
            arguments.push(receiver);
        }
        arguments.reverse();

        // Object.<init> on a fresh instance does nothing worth a call
        if name == "<init>" && holder == "java/lang/Object" {
            return Ok(false);
        }
        if let Some(intrinsic) = recognize_intrinsic(&holder, &name, info.signature.parameters()) {
            let kind = info.signature.return_kind().stack_kind();
            let node = self.append(
                kind,
                ValueTag::Intrinsic {
                    intrinsic,
                    arguments,
                },
                bci,
            );
            self.ir.value_mut(node).state = Some(state);
            if kind != Kind::Void {
                self.push(kind, node);
            }
            return Ok(false);
        }
        if self.should_inline(&info, invoke) && self.try_inline(bci, &info, &arguments)? {
            return Ok(true);
        }
        let kind = info.signature.return_kind().stack_kind();
        let node = self.append(
            kind,
            ValueTag::Invoke {
                invoke,
                method: info,
                arguments,
            },
            bci,
        );
        self.ir.value_mut(node).state = Some(state);
        self.handle_exceptions(bci, node);
        if kind != Kind::Void {
            self.push(kind, node);
        }
        Ok(false)
    }

    fn should_inline(&self, info: &MethodInfo, invoke: InvokeKind) -> bool {
        if !self.options.inline() {
            return false;
        }
        if !matches!(invoke, InvokeKind::Static | InvokeKind::Special) && !info.statically_bound {
            return false;
        }
        let Some(body) = &info.body else {
            return false;
        };
        if body.code.is_empty()
            || body.code.len() > usize::from(self.options.max_inline_size)
            || body.is_synchronized()
            || !body.exception_handlers.is_empty()
            || body.flags.contains(lungo_code::MethodFlags::NATIVE)
        {
            return false;
        }
        if self.scopes.len() >= usize::try_from(self.options.max_inline_depth).unwrap_or(usize::MAX)
        {
            return false;
        }
        // No recursive inlining
        !self.scopes.iter().any(|scope| {
            scope.method.holder == body.holder
                && scope.method.name == body.name
                && scope.method.descriptor == body.descriptor
        })
    }

    /// Inline the callee, or return false to fall back to a call.
    fn try_inline(&mut self, bci: u32, info: &MethodInfo, arguments: &[NodeId]) -> Result<bool> {
        let Some(body) = info.body.clone() else {
            return Ok(false);
        };
        let Ok(code) = decode(&body.code) else {
            return Ok(false);
        };
        // Monitors and subroutines keep bookkeeping honest by not inlining at all
        if code.iter().any(|(_, bytecode)| {
            matches!(
                bytecode,
                Bytecode::MonitorEnter | Bytecode::MonitorExit | Bytecode::Jsr(..) | Bytecode::Ret(..)
            )
        }) {
            return Ok(false);
        }
        let next_bci = self
            .scope()
            .code
            .iter()
            .find(|(at, _)| *at > bci)
            .map(|(at, _)| *at)
            .ok_or_else(|| InvariantViolation(format!("call at {bci} falls off the end")))?;
        // The continuation is the caller block the inlined returns jump to. Joining an
        // already parsed block would need phis after the fact, so fall back to a call.
        if let Some(existing) = self.scope().block_map.block_at.get(&next_bci)
            && self.ir.block(*existing).is_visited()
        {
            return Ok(false);
        }
        let continuation = match self.scope().block_map.block_at.get(&next_bci) {
            Some(existing) => *existing,
            None => {
                let block = self.ir.new_block(next_bci, BlockFlags::empty());
                let scope_index = self.scopes.len() - 1;
                self.scope_mut().block_map.insert(next_bci, block);
                self.block_scope.insert(block, scope_index);
                block
            }
        };
        let caller_state_id = self.snapshot(bci);
        let caller_state = self.state.clone();

        let max_locals = usize::from(body.max_locals);
        let mut child_state = FrameState::new(0, max_locals, Some(caller_state_id));
        let mut slot = 0usize;
        for argument in arguments {
            let two_slots = self.ir.value(*argument).kind.slots() == 2;
            child_state.store_local(slot, *argument, two_slots, false);
            slot += if two_slots { 2 } else { 1 };
        }
        debug!(callee = %body, "inlining");
        self.push_scope(
            body,
            code,
            max_locals,
            false,
            Some(caller_state),
            Some(caller_state_id),
            bci,
        )?;
        self.scope_mut().continuation = Some(continuation);
        let entry = self.block_at(0)?;
        self.append(Kind::Void, ValueTag::Goto, bci);
        self.state = child_state;
        self.join(entry)?;
        self.process_scope()?;
        self.scopes.pop();
        Ok(true)
    }

    // Canonicalization

    fn arithmetic(
        &mut self,
        op: ArithOp,
        kind: Kind,
        x: NodeId,
        y: NodeId,
        bci: u32,
        state: Option<StateId>,
    ) -> NodeId {
        if self.options.canonicalize()
            && let (Some(left), Some(right)) = (
                self.ir.value(x).as_constant(),
                self.ir.value(y).as_constant(),
            )
            && let Some(folded) = fold_arith(op, kind, left, right)
        {
            return self.constant(folded, bci);
        }
        let node = self.append(kind, ValueTag::ArithmeticOp { op, x, y }, bci);
        self.ir.value_mut(node).state = state;
        node
    }

    fn fold_negate(&self, kind: Kind, x: NodeId) -> Option<ConstValue> {
        if !self.options.canonicalize() {
            return None;
        }
        match (kind, self.ir.value(x).as_constant()?) {
            (Kind::Int, ConstValue::Int(value)) => Some(ConstValue::Int(value.wrapping_neg())),
            (Kind::Long, ConstValue::Long(value)) => Some(ConstValue::Long(value.wrapping_neg())),
            (Kind::Float, ConstValue::Float(value)) => Some(ConstValue::Float(-value)),
            (Kind::Double, ConstValue::Double(value)) => Some(ConstValue::Double(-value)),
            _ => None,
        }
    }

    fn fold_shift(&self, op: ShiftOp, kind: Kind, x: NodeId, y: NodeId) -> Option<ConstValue> {
        if !self.options.canonicalize() {
            return None;
        }
        let amount = match self.ir.value(y).as_constant()? {
            ConstValue::Int(amount) => amount,
            _ => return None,
        };
        match (kind, self.ir.value(x).as_constant()?) {
            (Kind::Int, ConstValue::Int(value)) => {
                let amount = amount & 0x1f;
                Some(ConstValue::Int(match op {
                    ShiftOp::Shl => value.wrapping_shl(amount.cast_unsigned()),
                    ShiftOp::Shr => value.wrapping_shr(amount.cast_unsigned()),
                    ShiftOp::Ushr => {
                        (value.cast_unsigned().wrapping_shr(amount.cast_unsigned())).cast_signed()
                    }
                }))
            }
            (Kind::Long, ConstValue::Long(value)) => {
                let amount = (amount & 0x3f).cast_unsigned();
                Some(ConstValue::Long(match op {
                    ShiftOp::Shl => value.wrapping_shl(amount),
                    ShiftOp::Shr => value.wrapping_shr(amount),
                    ShiftOp::Ushr => (value.cast_unsigned().wrapping_shr(amount)).cast_signed(),
                }))
            }
            _ => None,
        }
    }

    fn fold_logic(&self, op: LogicOp, kind: Kind, x: NodeId, y: NodeId) -> Option<ConstValue> {
        if !self.options.canonicalize() {
            return None;
        }
        match (
            kind,
            self.ir.value(x).as_constant()?,
            self.ir.value(y).as_constant()?,
        ) {
            (Kind::Int, ConstValue::Int(left), ConstValue::Int(right)) => {
                Some(ConstValue::Int(match op {
                    LogicOp::And => left & right,
                    LogicOp::Or => left | right,
                    LogicOp::Xor => left ^ right,
                }))
            }
            (Kind::Long, ConstValue::Long(left), ConstValue::Long(right)) => {
                Some(ConstValue::Long(match op {
                    LogicOp::And => left & right,
                    LogicOp::Or => left | right,
                    LogicOp::Xor => left ^ right,
                }))
            }
            _ => None,
        }
    }

    fn fold_convert(&self, from: Kind, to: Kind, x: NodeId) -> Option<ConstValue> {
        if !self.options.canonicalize() {
            return None;
        }
        let value = self.ir.value(x).as_constant()?;
        fold_convert_const(from, to, value)
    }
}

/// Fold a constant arithmetic operation with Java semantics; division by zero stays a node.
fn fold_arith(op: ArithOp, kind: Kind, x: ConstValue, y: ConstValue) -> Option<ConstValue> {
    match (kind, x, y) {
        (Kind::Int, ConstValue::Int(left), ConstValue::Int(right)) => {
            let folded = match op {
                ArithOp::Add => left.wrapping_add(right),
                ArithOp::Sub => left.wrapping_sub(right),
                ArithOp::Mul => left.wrapping_mul(right),
                ArithOp::Div => {
                    if right == 0 {
                        return None;
                    }
                    left.wrapping_div(right)
                }
                ArithOp::Rem => {
                    if right == 0 {
                        return None;
                    }
                    left.wrapping_rem(right)
                }
            };
            Some(ConstValue::Int(folded))
        }
        (Kind::Long, ConstValue::Long(left), ConstValue::Long(right)) => {
            let folded = match op {
                ArithOp::Add => left.wrapping_add(right),
                ArithOp::Sub => left.wrapping_sub(right),
                ArithOp::Mul => left.wrapping_mul(right),
                ArithOp::Div => {
                    if right == 0 {
                        return None;
                    }
                    left.wrapping_div(right)
                }
                ArithOp::Rem => {
                    if right == 0 {
                        return None;
                    }
                    left.wrapping_rem(right)
                }
            };
            Some(ConstValue::Long(folded))
        }
        (Kind::Float, ConstValue::Float(left), ConstValue::Float(right)) => {
            let folded = match op {
                ArithOp::Add => left + right,
                ArithOp::Sub => left - right,
                ArithOp::Mul => left * right,
                ArithOp::Div => left / right,
                ArithOp::Rem => left % right,
            };
            Some(ConstValue::Float(folded))
        }
        (Kind::Double, ConstValue::Double(left), ConstValue::Double(right)) => {
            let folded = match op {
                ArithOp::Add => left + right,
                ArithOp::Sub => left - right,
                ArithOp::Mul => left * right,
                ArithOp::Div => left / right,
                ArithOp::Rem => left % right,
            };
            Some(ConstValue::Double(folded))
        }
        _ => None,
    }
}

/// Fold a constant conversion with Java semantics.
#[expect(clippy::cast_possible_truncation)]
#[expect(clippy::cast_precision_loss)]
#[expect(clippy::cast_sign_loss)]
fn fold_convert_const(from: Kind, to: Kind, value: ConstValue) -> Option<ConstValue> {
    match (from, to, value) {
        (Kind::Int, Kind::Long, ConstValue::Int(v)) => Some(ConstValue::Long(i64::from(v))),
        (Kind::Int, Kind::Float, ConstValue::Int(v)) => Some(ConstValue::Float(v as f32)),
        (Kind::Int, Kind::Double, ConstValue::Int(v)) => Some(ConstValue::Double(f64::from(v))),
        (Kind::Int, Kind::Byte, ConstValue::Int(v)) => Some(ConstValue::Int(i32::from(v as i8))),
        (Kind::Int, Kind::Char, ConstValue::Int(v)) => Some(ConstValue::Int(i32::from(v as u16))),
        (Kind::Int, Kind::Short, ConstValue::Int(v)) => Some(ConstValue::Int(i32::from(v as i16))),
        (Kind::Long, Kind::Int, ConstValue::Long(v)) => Some(ConstValue::Int(v as i32)),
        (Kind::Long, Kind::Float, ConstValue::Long(v)) => Some(ConstValue::Float(v as f32)),
        (Kind::Long, Kind::Double, ConstValue::Long(v)) => Some(ConstValue::Double(v as f64)),
        (Kind::Float, Kind::Int, ConstValue::Float(v)) => {
            Some(ConstValue::Int(java_float_to_int(f64::from(v)) as i32))
        }
        (Kind::Float, Kind::Long, ConstValue::Float(v)) => {
            Some(ConstValue::Long(java_float_to_long(f64::from(v))))
        }
        (Kind::Float, Kind::Double, ConstValue::Float(v)) => {
            Some(ConstValue::Double(f64::from(v)))
        }
        (Kind::Double, Kind::Int, ConstValue::Double(v)) => {
            Some(ConstValue::Int(java_float_to_int(v) as i32))
        }
        (Kind::Double, Kind::Long, ConstValue::Double(v)) => {
            Some(ConstValue::Long(java_float_to_long(v)))
        }
        (Kind::Double, Kind::Float, ConstValue::Double(v)) => Some(ConstValue::Float(v as f32)),
        _ => None,
    }
}

/// Java float-to-int saturating conversion semantics over an i32 range.
#[expect(clippy::cast_possible_truncation)]
fn java_float_to_int(value: f64) -> i64 {
    if value.is_nan() {
        0
    } else {
        value.clamp(f64::from(i32::MIN), f64::from(i32::MAX)) as i64
    }
}

/// Java float-to-long saturating conversion semantics.
#[expect(clippy::cast_precision_loss)]
fn java_float_to_long(value: f64) -> i64 {
    if value.is_nan() {
        0
    } else if value >= i64::MAX as f64 {
        i64::MAX
    } else if value <= i64::MIN as f64 {
        i64::MIN
    } else {
        #[expect(clippy::cast_possible_truncation)]
        {
            value as i64
        }
    }
}

/// Recognize well known methods that compile to specialized nodes.
fn recognize_intrinsic(holder: &str, name: &str, parameters: &[Kind]) -> Option<IntrinsicId> {
    match (holder, name) {
        ("java/lang/Math", "sin") => Some(IntrinsicId::Sin),
        ("java/lang/Math", "cos") => Some(IntrinsicId::Cos),
        ("java/lang/Math", "tan") => Some(IntrinsicId::Tan),
        ("java/lang/Math", "log") => Some(IntrinsicId::Log),
        ("java/lang/Math", "log10") => Some(IntrinsicId::Log10),
        ("java/lang/Math", "sqrt") => Some(IntrinsicId::Sqrt),
        // The integral overloads of abs stay ordinary calls
        ("java/lang/Math", "abs") => match parameters {
            [Kind::Double] => Some(IntrinsicId::AbsDouble),
            [Kind::Float] => Some(IntrinsicId::AbsFloat),
            _ => None,
        },
        ("java/lang/Float", "floatToRawIntBits") => Some(IntrinsicId::FloatToRawIntBits),
        ("java/lang/Float", "intBitsToFloat") => Some(IntrinsicId::IntBitsToFloat),
        ("java/lang/Double", "doubleToRawLongBits") => Some(IntrinsicId::DoubleToRawLongBits),
        ("java/lang/Double", "longBitsToDouble") => Some(IntrinsicId::LongBitsToDouble),
        ("java/lang/System", "nanoTime") => Some(IntrinsicId::NanoTime),
        ("java/lang/System", "currentTimeMillis") => Some(IntrinsicId::CurrentTimeMillis),
        ("sun/misc/Unsafe" | "jdk/internal/misc/Unsafe", "compareAndSwapInt") => {
            Some(IntrinsicId::CompareAndSwapInt)
        }
        ("sun/misc/Unsafe" | "jdk/internal/misc/Unsafe", "compareAndSwapLong") => {
            Some(IntrinsicId::CompareAndSwapLong)
        }
        ("sun/misc/Unsafe" | "jdk/internal/misc/Unsafe", "compareAndSwapObject") => {
            Some(IntrinsicId::CompareAndSwapObject)
        }
        _ => None,
    }
}

