//! HIR to LIR lowering.
//!
//! A visitor over the HIR in reverse postorder. Every live instruction either receives a
//! virtual operand or is lowered purely for its effects. Calling conventions are materialized
//! as explicit moves, object operations expand through XIR snippets, switches lower through
//! switch ranges, and phi inputs are resolved into ordered moves at block exits.

use crate::Error::{InvariantViolation, UnsupportedMethod};
use crate::error::Result;
use crate::hir::{BlockId, IntrinsicId, Ir, NodeId, ValueFlags, ValueTag};
use crate::lir::{
    BoundXirSnippet, LirDebugInfo, LirOp, PhiResolver, create_ranges,
};
use crate::options::Options;
use ahash::AHashMap;
use lungo_code::{
    Address, ArithOp, Barriers, CallingConvention, Condition, ConstValue, ConventionKind,
    InvokeKind, Kind, Method, Operand, Runtime, RuntimeCall, Scale, StubId, Target, Variable,
    XirArgument, XirSnippet,
};
use tracing::debug;

/// The lowered method: per-block LIR lists plus operand bookkeeping.
#[derive(Debug)]
pub struct LirFunction {
    /// Blocks in emission order
    pub blocks: Vec<BlockId>,
    pub lists: AHashMap<BlockId, Vec<LirOp>>,
    /// Kind of every virtual variable, indexed by variable number
    pub variables: Vec<Kind>,
    /// Bytes of raw frame memory claimed by stack allocations
    pub stack_alloc_bytes: i32,
    /// Largest outgoing argument area in slots
    pub max_outgoing_slots: i32,
}

struct LirGenerator<'a> {
    ir: &'a mut Ir,
    runtime: &'a dyn Runtime,
    options: &'a Options,
    target: &'a Target,
    method: &'a Method,
    variables: Vec<Kind>,
    cur: Vec<LirOp>,
    cur_block: BlockId,
    local_labels: u32,
    stack_alloc_bytes: i32,
    max_outgoing_slots: i32,
}

/// Lower the HIR graph into per-block LIR lists.
///
/// # Errors
///
/// if the graph is inconsistent or an operation cannot be lowered for this target
pub fn generate_lir(
    ir: &mut Ir,
    runtime: &dyn Runtime,
    options: &Options,
    target: &Target,
    method: &Method,
) -> Result<LirFunction> {
    let blocks = emission_order(ir);
    let mut generator = LirGenerator {
        ir,
        runtime,
        options,
        target,
        method,
        variables: Vec::new(),
        cur: Vec::new(),
        cur_block: BlockId(0),
        local_labels: 0,
        stack_alloc_bytes: 0,
        max_outgoing_slots: 0,
    };
    let mut lists = AHashMap::default();
    for block in &blocks {
        generator.cur = Vec::new();
        generator.cur_block = *block;
        generator.local_labels = 0;
        let chain = generator.ir.instructions(*block);
        for node in chain {
            generator.lower(node)?;
        }
        lists.insert(*block, std::mem::take(&mut generator.cur));
    }
    debug!(
        blocks = blocks.len(),
        variables = generator.variables.len(),
        "LIR generated"
    );
    Ok(LirFunction {
        blocks,
        lists,
        variables: generator.variables,
        stack_alloc_bytes: generator.stack_alloc_bytes,
        max_outgoing_slots: generator.max_outgoing_slots,
    })
}

/// Emission order: reverse postorder from the start, then any handler blocks not reached by
/// normal edges, each with its own reachable successors.
fn emission_order(ir: &Ir) -> Vec<BlockId> {
    let mut order = ir.reverse_postorder();
    let mut seen: Vec<bool> = vec![false; ir.block_count()];
    for block in &order {
        seen[block.index()] = true;
    }
    let handler_roots: Vec<BlockId> = ir.handlers.iter().map(|handler| handler.block).collect();
    for root in handler_roots {
        if seen[root.index()] {
            continue;
        }
        let mut stack = vec![root];
        seen[root.index()] = true;
        while let Some(block) = stack.pop() {
            order.push(block);
            for successor in &ir.block(block).successors {
                if !seen[successor.index()] {
                    seen[successor.index()] = true;
                    stack.push(*successor);
                }
            }
        }
    }
    order
}

impl<'a> LirGenerator<'a> {
    fn new_variable(&mut self, kind: Kind) -> Variable {
        let index = u32::try_from(self.variables.len()).unwrap_or(u32::MAX);
        self.variables.push(kind.stack_kind());
        Variable {
            index,
            kind: kind.stack_kind(),
        }
    }

    fn result_variable(&mut self, node: NodeId) -> Result<Variable> {
        let kind = self.ir.value(node).kind.stack_kind();
        let variable = self.new_variable(kind);
        self.ir.value_mut(node).operand = Some(Operand::Variable(variable));
        Ok(variable)
    }

    /// Return the operand of a value, materializing constants and phis lazily.
    fn operand_of(&mut self, node: NodeId) -> Result<Operand> {
        if let Some(operand) = self.ir.value(node).operand.clone() {
            return Ok(operand);
        }
        let operand = match &self.ir.value(node).tag {
            ValueTag::Constant(value) => Operand::Const(*value),
            ValueTag::Phi { .. } => {
                let kind = self.ir.value(node).kind;
                Operand::Variable(self.new_variable(kind))
            }
            tag => {
                return Err(InvariantViolation(format!(
                    "value {node} ({tag:?}) used before it was lowered"
                )));
            }
        };
        self.ir.value_mut(node).operand = Some(operand.clone());
        self.ir.value_mut(node).flags |= ValueFlags::LIVE_VALUE;
        Ok(operand)
    }

    fn debug_info(&self, node: NodeId) -> Option<LirDebugInfo> {
        let value = self.ir.value(node);
        value.state.map(|state| LirDebugInfo {
            state,
            bci: value.bci,
            handlers: value.handlers.clone(),
        })
    }

    fn required_debug_info(&self, node: NodeId) -> Result<LirDebugInfo> {
        self.debug_info(node).ok_or_else(|| {
            InvariantViolation(format!("trapping value {node} carries no frame state"))
        })
    }

    // XIR binding

    /// Resolve snippet arguments into operands.
    fn resolve_arguments(&mut self, snippet: &XirSnippet) -> Result<Vec<Operand>> {
        snippet
            .arguments
            .iter()
            .map(|argument| match argument {
                XirArgument::Const(value) => Ok(Operand::Const(*value)),
                XirArgument::Value(index) => self.operand_of(NodeId(*index)),
            })
            .collect()
    }

    /// Bind a template to concrete operands: copy destroyed inputs, allocate temps and the
    /// result, and append the expansion op.
    fn emit_snippet(
        &mut self,
        snippet: &XirSnippet,
        inputs: Vec<Operand>,
        result_node: Option<NodeId>,
        info: Option<LirDebugInfo>,
    ) -> Result<Option<Variable>> {
        let template = &snippet.template;
        let mut bound_inputs = inputs;
        for destroyed in &template.destroyed_inputs {
            let original = bound_inputs[*destroyed].clone();
            let copy = self.new_variable(original.kind());
            self.cur.push(LirOp::Move {
                src: original,
                dest: Operand::Variable(copy),
            });
            bound_inputs[*destroyed] = Operand::Variable(copy);
        }
        let temps: Vec<Operand> = template
            .temps
            .clone()
            .into_iter()
            .map(|kind| Operand::Variable(self.new_variable(kind)))
            .collect();
        let result = match (template.result, result_node) {
            (Some(_), Some(node)) => {
                let variable = self.result_variable(node)?;
                Some(variable)
            }
            (Some(kind), None) => Some(self.new_variable(kind)),
            (None, _) => None,
        };
        self.cur.push(LirOp::Xir {
            snippet: BoundXirSnippet {
                template: std::sync::Arc::clone(template),
                inputs: bound_inputs,
                temps,
                result: result.map_or(Operand::Illegal, Operand::Variable),
            },
            info,
        });
        Ok(result)
    }

    fn xir_value(node: NodeId) -> XirArgument {
        XirArgument::value(node.0)
    }

    // Helpers

    fn membar(&mut self, requested: Barriers) {
        let required = self.target.required_barriers(requested);
        if !required.is_empty() {
            self.cur.push(LirOp::Membar { barriers: required });
        }
    }

    /// Queue phi moves for the single successor of the current block.
    fn move_to_phis(&mut self, successor: BlockId) -> Result<()> {
        let phis = self.ir.block(successor).phis.clone();
        if phis.is_empty() {
            return Ok(());
        }
        let pred_index = self
            .ir
            .block(successor)
            .predecessor_index(self.cur_block)
            .ok_or_else(|| {
                InvariantViolation(format!(
                    "{} is not a predecessor of {successor}",
                    self.cur_block
                ))
            })?;
        let mut resolver = PhiResolver::new();
        for phi in phis {
            let input = match &self.ir.value(phi).tag {
                ValueTag::Phi { inputs, .. } => *inputs.get(pred_index).ok_or_else(|| {
                    InvariantViolation(format!("phi {phi} lacks an input for edge {pred_index}"))
                })?,
                _ => return Err(InvariantViolation(format!("{phi} is not a phi"))),
            };
            let source = self.operand_of(input)?;
            let Operand::Variable(dest) = self.operand_of(phi)? else {
                return Err(InvariantViolation(format!("phi {phi} has no variable")));
            };
            resolver.add_move(source, dest);
        }
        let mut ops = Vec::new();
        resolver.resolve(&mut ops, |kind| {
            let index = u32::try_from(self.variables.len()).unwrap_or(u32::MAX);
            self.variables.push(kind);
            Variable { index, kind }
        });
        self.cur.append(&mut ops);
        Ok(())
    }

    /// Move call arguments into their convention locations, recording object-holding outgoing
    /// stack slots for the caller's stack map.
    fn materialize_arguments(&mut self, arguments: &[NodeId]) -> Result<Vec<i32>> {
        let kinds: Vec<Kind> = arguments
            .iter()
            .map(|argument| self.ir.value(*argument).kind.stack_kind())
            .collect();
        let convention =
            CallingConvention::compute(ConventionKind::Optimized, &kinds, self.target, true);
        self.max_outgoing_slots = self
            .max_outgoing_slots
            .max(convention.stack_size / self.target.opt_slot_size);
        let mut pointer_slots = Vec::new();
        for (argument, location) in arguments.iter().zip(convention.locations.iter()) {
            let source = self.operand_of(*argument)?;
            if let Operand::StackSlot { index, kind, .. } = location
                && kind.is_object()
            {
                pointer_slots.push(*index);
            }
            self.cur.push(LirOp::Move {
                src: source,
                dest: location.clone(),
            });
        }
        Ok(pointer_slots)
    }

    // Lowering dispatch

    #[expect(clippy::too_many_lines)]
    fn lower(&mut self, node: NodeId) -> Result<()> {
        let tag = self.ir.value(node).tag.clone();
        match tag {
            ValueTag::Constant(..) => {
                // Materialized lazily at use sites
            }
            ValueTag::Local { index } => self.lower_local(node, index)?,
            ValueTag::Phi { .. } => {
                // Inputs are moved at predecessor exits
            }
            ValueTag::ArithmeticOp { op, x, y } => self.lower_arithmetic(node, op, x, y)?,
            ValueTag::ShiftOp { op, x, y } => {
                let value = self.operand_of(x)?;
                let amount = self.operand_of(y)?;
                let kind = self.ir.value(node).kind;
                let dest = self.result_variable(node)?;
                self.cur.push(LirOp::Shift {
                    op,
                    kind,
                    value,
                    amount,
                    dest: Operand::Variable(dest),
                });
            }
            ValueTag::LogicOp { op, x, y } => {
                let left = self.operand_of(x)?;
                let right = self.operand_of(y)?;
                let kind = self.ir.value(node).kind;
                let dest = self.result_variable(node)?;
                self.cur.push(LirOp::Logic {
                    op,
                    kind,
                    x: left,
                    y: right,
                    dest: Operand::Variable(dest),
                });
            }
            ValueTag::Negate { x } => {
                let value = self.operand_of(x)?;
                let kind = self.ir.value(node).kind;
                let dest = self.result_variable(node)?;
                self.cur.push(LirOp::Negate {
                    kind,
                    value,
                    dest: Operand::Variable(dest),
                });
            }
            ValueTag::Convert { x } => {
                let from = self.ir.value(x).kind.stack_kind();
                let to = self.ir.value(node).kind;
                let value = self.operand_of(x)?;
                let dest = self.result_variable(node)?;
                self.cur.push(LirOp::Convert {
                    from,
                    to,
                    value,
                    dest: Operand::Variable(dest),
                });
            }
            ValueTag::Compare { x, y, nan_greater } => {
                let kind = self.ir.value(x).kind.stack_kind();
                let left = self.operand_of(x)?;
                let right = self.operand_of(y)?;
                let dest = self.result_variable(node)?;
                self.cur.push(LirOp::CompareToInt {
                    kind,
                    x: left,
                    y: right,
                    nan_greater,
                    dest: Operand::Variable(dest),
                });
            }
            ValueTag::IfOp {
                x,
                condition,
                y,
                true_value,
                false_value,
            } => {
                let kind = self.ir.value(x).kind.stack_kind();
                let left = self.operand_of(x)?;
                let right = self.operand_of(y)?;
                let true_operand = self.operand_of(true_value)?;
                let false_operand = self.operand_of(false_value)?;
                let result_kind = self.ir.value(node).kind;
                let dest = self.result_variable(node)?;
                self.cur.push(LirOp::Cmp {
                    kind,
                    x: left,
                    y: right,
                });
                self.cur.push(LirOp::CondMove {
                    condition,
                    kind: result_kind,
                    true_value: true_operand,
                    false_value: false_operand,
                    dest: Operand::Variable(dest),
                });
            }
            ValueTag::NullCheck { object } => {
                let info = self.required_debug_info(node)?;
                let operand = self.operand_of(object)?;
                self.cur.push(LirOp::Trap {
                    condition: Condition::Equal,
                    kind: Kind::Object,
                    x: operand.clone(),
                    y: Operand::Const(ConstValue::Null),
                    stub: StubId::ThrowNullPointerException,
                    info,
                });
                // The checked object is the result
                self.ir.value_mut(node).operand = Some(operand);
            }
            ValueTag::Invoke {
                invoke,
                method,
                arguments,
            } => self.lower_invoke(node, invoke, &method, &arguments)?,
            ValueTag::LoadField { object, field } => {
                let info = self.required_debug_info(node)?;
                let snippet = match object {
                    Some(object) => self
                        .runtime
                        .xir()
                        .get_field(Self::xir_value(object), &field),
                    None => self.runtime.xir().get_static(&field),
                };
                let inputs = self.resolve_arguments(&snippet)?;
                self.emit_snippet(&snippet, inputs, Some(node), Some(info))?;
                if field.is_volatile {
                    self.membar(Barriers::post_volatile_read());
                }
            }
            ValueTag::StoreField {
                object,
                value,
                field,
            } => {
                let info = self.required_debug_info(node)?;
                if field.is_volatile {
                    self.membar(Barriers::pre_volatile_write());
                }
                let snippet = match object {
                    Some(object) => self.runtime.xir().put_field(
                        Self::xir_value(object),
                        Self::xir_value(value),
                        &field,
                    ),
                    None => self
                        .runtime
                        .xir()
                        .put_static(Self::xir_value(value), &field),
                };
                let inputs = self.resolve_arguments(&snippet)?;
                self.emit_snippet(&snippet, inputs, None, Some(info))?;
                if field.kind.is_object()
                    && !self.ir.value(node).flags.contains(ValueFlags::NO_WRITE_BARRIER)
                {
                    self.emit_write_barrier(object, field.static_base.map(ConstValue::Object))?;
                }
                if field.is_volatile {
                    self.membar(Barriers::post_volatile_write());
                }
            }
            ValueTag::LoadIndexed {
                array,
                index,
                element,
            } => {
                let info = self.required_debug_info(node)?;
                let checked = self.emit_bounds_check(node, array, index, &info)?;
                let snippet = self.runtime.xir().array_load(
                    Self::xir_value(array),
                    Self::xir_value(index),
                    element,
                );
                let inputs = self.resolve_arguments(&snippet)?;
                let access_info = if checked { None } else { Some(info) };
                self.emit_snippet(&snippet, inputs, Some(node), access_info)?;
            }
            ValueTag::StoreIndexed {
                array,
                index,
                value,
                element,
            } => {
                let info = self.required_debug_info(node)?;
                let checked = self.emit_bounds_check(node, array, index, &info)?;
                if element.is_object()
                    && self.options.gen_array_store_check
                    && !self.ir.value(node).flags.contains(ValueFlags::NO_STORE_CHECK)
                    && self.ir.value(value).as_constant() != Some(ConstValue::Null)
                {
                    let array_operand = self.operand_of(array)?;
                    let value_operand = self.operand_of(value)?;
                    self.cur.push(LirOp::CallRuntime {
                        call: RuntimeCall::ArrayStoreCheck,
                        arguments: vec![array_operand, value_operand],
                        result: Operand::Illegal,
                        info: Some(info.clone()),
                    });
                }
                let snippet = self.runtime.xir().array_store(
                    Self::xir_value(array),
                    Self::xir_value(index),
                    Self::xir_value(value),
                    element,
                );
                let inputs = self.resolve_arguments(&snippet)?;
                let access_info = if checked { None } else { Some(info) };
                self.emit_snippet(&snippet, inputs, None, access_info)?;
                if element.is_object() {
                    self.emit_write_barrier(Some(array), None)?;
                }
            }
            ValueTag::ArrayLength { array } => {
                let info = self.required_debug_info(node)?;
                let snippet = self.runtime.xir().array_length(Self::xir_value(array));
                let inputs = self.resolve_arguments(&snippet)?;
                self.emit_snippet(&snippet, inputs, Some(node), Some(info))?;
            }
            ValueTag::CheckCast { object, class } => {
                let info = self.required_debug_info(node)?;
                self.emit_resolution_if_patching(&info)?;
                let snippet = self
                    .runtime
                    .xir()
                    .check_cast(Self::xir_value(object), &class);
                let inputs = self.resolve_arguments(&snippet)?;
                self.emit_snippet(&snippet, inputs, None, Some(info))?;
                let operand = self.operand_of(object)?;
                self.ir.value_mut(node).operand = Some(operand);
            }
            ValueTag::InstanceOf { object, class } => {
                let snippet = self
                    .runtime
                    .xir()
                    .instance_of(Self::xir_value(object), &class);
                let inputs = self.resolve_arguments(&snippet)?;
                self.emit_snippet(&snippet, inputs, Some(node), None)?;
            }
            ValueTag::MonitorEnter { object, .. } => {
                let info = self.required_debug_info(node)?;
                let snippet = self.runtime.xir().monitor_enter(Self::xir_value(object));
                let inputs = self.resolve_arguments(&snippet)?;
                self.emit_snippet(&snippet, inputs, None, Some(info))?;
            }
            ValueTag::MonitorExit { object, .. } => {
                let info = self.required_debug_info(node)?;
                let snippet = self.runtime.xir().monitor_exit(Self::xir_value(object));
                let inputs = self.resolve_arguments(&snippet)?;
                self.emit_snippet(&snippet, inputs, None, Some(info))?;
            }
            ValueTag::MonitorAddress { lock } => {
                let dest = self.result_variable(node)?;
                self.cur.push(LirOp::MonitorAddress {
                    lock,
                    dest: Operand::Variable(dest),
                });
            }
            ValueTag::NewInstance { class } => {
                let info = self.required_debug_info(node)?;
                self.emit_resolution_if_patching(&info)?;
                let snippet = self.runtime.xir().new_instance(&class);
                let inputs = self.resolve_arguments(&snippet)?;
                self.emit_snippet(&snippet, inputs, Some(node), Some(info))?;
            }
            ValueTag::NewTypeArray { length, class, .. }
            | ValueTag::NewObjectArray { length, class } => {
                let info = self.required_debug_info(node)?;
                let snippet = self
                    .runtime
                    .xir()
                    .new_array(&class, Self::xir_value(length));
                let inputs = self.resolve_arguments(&snippet)?;
                self.emit_snippet(&snippet, inputs, Some(node), Some(info))?;
            }
            ValueTag::NewMultiArray { class, dimensions } => {
                self.lower_new_multi_array(node, &class, &dimensions)?;
            }
            ValueTag::ExceptionObject => {
                let snippet = self.runtime.xir().exception_object();
                self.emit_snippet(&snippet, Vec::new(), Some(node), None)?;
            }
            ValueTag::Intrinsic {
                intrinsic,
                arguments,
            } => self.lower_intrinsic(node, intrinsic, &arguments)?,
            ValueTag::LoadPointer { pointer, offset } => {
                let base = self.operand_of(pointer)?;
                let kind = self.ir.value(node).kind;
                let dest = self.result_variable(node)?;
                self.cur.push(LirOp::Load {
                    address: Address::offset(base, offset, kind),
                    dest: Operand::Variable(dest),
                    info: None,
                });
            }
            ValueTag::StorePointer {
                pointer,
                offset,
                value,
            } => {
                let base = self.operand_of(pointer)?;
                let operand = self.operand_of(value)?;
                let kind = operand.kind();
                self.cur.push(LirOp::Store {
                    address: Address::offset(base, offset, kind),
                    value: operand,
                    info: None,
                });
            }
            ValueTag::UnsafeGetObject {
                object,
                offset,
                volatile,
            } => {
                let base = self.operand_of(object)?;
                let index = self.operand_of(offset)?;
                let kind = self.ir.value(node).kind;
                let dest = self.result_variable(node)?;
                self.cur.push(LirOp::Load {
                    address: Address::indexed(base, index, Scale::Times1, 0, kind),
                    dest: Operand::Variable(dest),
                    info: None,
                });
                if volatile {
                    self.membar(Barriers::post_volatile_read());
                }
            }
            ValueTag::UnsafePutObject {
                object,
                offset,
                value,
                volatile,
            } => {
                if volatile {
                    self.membar(Barriers::pre_volatile_write());
                }
                let base = self.operand_of(object)?;
                let index = self.operand_of(offset)?;
                let operand = self.operand_of(value)?;
                let kind = operand.kind();
                self.cur.push(LirOp::Store {
                    address: Address::indexed(base, index, Scale::Times1, 0, kind),
                    value: operand,
                    info: None,
                });
                if kind.is_object() {
                    self.emit_write_barrier(Some(object), None)?;
                }
                if volatile {
                    self.membar(Barriers::post_volatile_write());
                }
            }
            ValueTag::MemoryBarrier { barriers } => self.membar(barriers),
            ValueTag::Safepoint => {
                let info = self.required_debug_info(node)?;
                let snippet = self.runtime.xir().safepoint();
                self.emit_snippet(&snippet, Vec::new(), None, Some(info))?;
            }
            ValueTag::UnsafeCast { x } => {
                let operand = self.operand_of(x)?;
                self.ir.value_mut(node).operand = Some(operand);
            }
            ValueTag::StackAllocate { size } => {
                let offset = self.stack_alloc_bytes;
                self.stack_alloc_bytes += (size + 7) & !7;
                let dest = self.result_variable(node)?;
                self.cur.push(LirOp::StackAllocate {
                    offset,
                    dest: Operand::Variable(dest),
                });
            }
            ValueTag::OsrEntry => {
                let dest = self.result_variable(node)?;
                self.cur.push(LirOp::OsrEntry {
                    dest: Operand::Variable(dest),
                });
            }
            ValueTag::Base | ValueTag::Goto => {
                let successor = self.ir.block(self.cur_block).successors.first().copied();
                let successor = successor.ok_or_else(|| {
                    InvariantViolation(format!("{} ends without a successor", self.cur_block))
                })?;
                self.move_to_phis(successor)?;
                self.cur.push(LirOp::Jump { target: successor });
            }
            ValueTag::If { x, condition, y } => {
                let successors = self.ir.block(self.cur_block).successors.clone();
                let [true_block, false_block] = successors.as_slice() else {
                    return Err(InvariantViolation(format!(
                        "{} has {} successors for a branch",
                        self.cur_block,
                        successors.len()
                    )));
                };
                let kind = self.ir.value(x).kind.stack_kind();
                let left = self.operand_of(x)?;
                let right = self.operand_of(y)?;
                self.cur.push(LirOp::Cmp {
                    kind,
                    x: left,
                    y: right,
                });
                self.cur.push(LirOp::Branch {
                    condition,
                    target: *true_block,
                });
                self.cur.push(LirOp::Jump {
                    target: *false_block,
                });
            }
            ValueTag::TableSwitch { value, low } => {
                let successors = self.ir.block(self.cur_block).successors.clone();
                let keys: Vec<i32> = (0..successors.len().saturating_sub(1))
                    .map(|index| low + i32::try_from(index).unwrap_or(i32::MAX))
                    .collect();
                self.lower_switch(value, &keys, &successors)?;
            }
            ValueTag::LookupSwitch { value, keys } => {
                let successors = self.ir.block(self.cur_block).successors.clone();
                self.lower_switch(value, &keys, &successors)?;
            }
            ValueTag::Return { value } => {
                let operand = match value {
                    Some(value) => {
                        let kind = self.ir.value(value).kind.stack_kind();
                        let source = self.operand_of(value)?;
                        let location = CallingConvention::result_location(kind);
                        self.cur.push(LirOp::Move {
                            src: source,
                            dest: location.clone(),
                        });
                        Some(location)
                    }
                    None => None,
                };
                self.cur.push(LirOp::Return { value: operand });
            }
            ValueTag::Throw { exception } => {
                let info = self.required_debug_info(node)?;
                let operand = self.operand_of(exception)?;
                self.cur.push(LirOp::CallRuntime {
                    call: RuntimeCall::UnwindException,
                    arguments: vec![operand],
                    result: Operand::Illegal,
                    info: Some(info),
                });
            }
        }
        Ok(())
    }

    // Individual lowerings

    /// Move an incoming parameter from its convention location into a fresh variable.
    fn lower_local(&mut self, node: NodeId, slot: u32) -> Result<()> {
        let signature = self.method.signature().map_err(crate::Error::from)?;
        let kinds = signature.argument_kinds(self.method.has_receiver());
        let convention =
            CallingConvention::compute(ConventionKind::Optimized, &kinds, self.target, false);
        let mut at = 0u32;
        for (kind, location) in kinds.iter().zip(convention.locations.iter()) {
            if at == slot {
                let dest = self.result_variable(node)?;
                self.cur.push(LirOp::Move {
                    src: location.clone(),
                    dest: Operand::Variable(dest),
                });
                return Ok(());
            }
            at += kind.slots();
        }
        Err(InvariantViolation(format!(
            "no parameter at local slot {slot}"
        )))
    }

    fn lower_arithmetic(&mut self, node: NodeId, op: ArithOp, x: NodeId, y: NodeId) -> Result<()> {
        let kind = self.ir.value(node).kind;
        let left = self.operand_of(x)?;
        let right = self.operand_of(y)?;
        let trapping = matches!(op, ArithOp::Div | ArithOp::Rem)
            && matches!(kind, Kind::Int | Kind::Long);
        let info = if trapping {
            let info = self.required_debug_info(node)?;
            if self.options.gen_explicit_div0_checks {
                let zero = if kind == Kind::Long {
                    ConstValue::Long(0)
                } else {
                    ConstValue::Int(0)
                };
                self.cur.push(LirOp::Trap {
                    condition: Condition::Equal,
                    kind,
                    x: right.clone(),
                    y: Operand::Const(zero),
                    stub: StubId::ThrowArithmeticException,
                    info: info.clone(),
                });
                None
            } else {
                Some(info)
            }
        } else {
            None
        };
        let dest = self.result_variable(node)?;
        self.cur.push(LirOp::Arith {
            op,
            kind,
            x: left,
            y: right,
            dest: Operand::Variable(dest),
            info,
        });
        Ok(())
    }

    /// Emit the range check for an indexed access. Returns whether a check was emitted, in
    /// which case the length load has already performed the implicit null check.
    fn emit_bounds_check(
        &mut self,
        node: NodeId,
        array: NodeId,
        index: NodeId,
        info: &LirDebugInfo,
    ) -> Result<bool> {
        if !self.options.gen_bounds_checks
            || self.ir.value(node).flags.contains(ValueFlags::NO_BOUNDS_CHECK)
        {
            return Ok(false);
        }
        let snippet = self.runtime.xir().array_length(Self::xir_value(array));
        let inputs = self.resolve_arguments(&snippet)?;
        // The length load traps on a null array, subsuming the null check
        let length = self
            .emit_snippet(&snippet, inputs, None, Some(info.clone()))?
            .ok_or_else(|| {
                InvariantViolation("array length template has no result".to_string())
            })?;
        let index_operand = self.operand_of(index)?;
        self.cur.push(LirOp::Trap {
            condition: Condition::AboveEqual,
            kind: Kind::Int,
            x: index_operand,
            y: Operand::Variable(length),
            stub: StubId::ThrowArrayIndexOutOfBoundsException,
            info: info.clone(),
        });
        Ok(true)
    }

    /// Emit the GC write barrier for a store of an object reference into the heap.
    fn emit_write_barrier(
        &mut self,
        object: Option<NodeId>,
        static_base: Option<ConstValue>,
    ) -> Result<()> {
        let snippet = match (object, static_base) {
            (Some(object), _) => self.runtime.xir().write_barrier(Self::xir_value(object)),
            (None, Some(base)) => self.runtime.xir().write_barrier(XirArgument::Const(base)),
            (None, None) => return Ok(()),
        };
        let inputs = self.resolve_arguments(&snippet)?;
        self.emit_snippet(&snippet, inputs, None, None)?;
        Ok(())
    }

    /// Force the resolution path when patching is being exercised.
    fn emit_resolution_if_patching(&mut self, info: &LirDebugInfo) -> Result<()> {
        if !self.options.test_patching {
            return Ok(());
        }
        let snippet = self.runtime.xir().resolve_class(0);
        self.emit_snippet(&snippet, Vec::new(), None, Some(info.clone()))?;
        Ok(())
    }

    fn lower_invoke(
        &mut self,
        node: NodeId,
        invoke: InvokeKind,
        method: &lungo_code::MethodInfo,
        arguments: &[NodeId],
    ) -> Result<()> {
        let info = self.required_debug_info(node)?;
        let result_kind = method.signature.return_kind();

        // The dispatch snippet computes the target address for indirect calls
        let snippet = match invoke {
            InvokeKind::Virtual => {
                let receiver = *arguments.first().ok_or_else(|| {
                    InvariantViolation("virtual call without a receiver".to_string())
                })?;
                self.runtime
                    .xir()
                    .invoke_virtual(Self::xir_value(receiver), method)
            }
            InvokeKind::Interface => {
                let receiver = *arguments.first().ok_or_else(|| {
                    InvariantViolation("interface call without a receiver".to_string())
                })?;
                self.runtime
                    .xir()
                    .invoke_interface(Self::xir_value(receiver), method)
            }
            InvokeKind::Special => self.runtime.xir().invoke_special(method),
            InvokeKind::Static => self.runtime.xir().invoke_static(method),
            InvokeKind::Dynamic => None,
        };

        let mut address = None;
        if !self.options.invoke_snippet_after_arguments
            && let Some(snippet) = &snippet
        {
            let inputs = self.resolve_arguments(snippet)?;
            address = self.emit_snippet(snippet, inputs, None, None)?;
        }
        let pointer_slots = self.materialize_arguments(arguments)?;
        if self.options.invoke_snippet_after_arguments
            && let Some(snippet) = &snippet
        {
            let inputs = self.resolve_arguments(snippet)?;
            address = self.emit_snippet(snippet, inputs, None, None)?;
        }

        let result_location = CallingConvention::result_location(result_kind);
        match address {
            Some(address) => {
                self.cur.push(LirOp::IndirectCall {
                    address: Operand::Variable(address),
                    method: method.id,
                    result: result_location.clone(),
                    pointer_slots,
                    info,
                });
            }
            None => {
                let direct = matches!(invoke, InvokeKind::Static | InvokeKind::Special)
                    || method.statically_bound;
                if !direct {
                    return Err(UnsupportedMethod(format!(
                        "virtual dispatch without a vtable index for method {}",
                        method.id
                    )));
                }
                self.cur.push(LirOp::DirectCall {
                    method: method.id,
                    result: result_location.clone(),
                    pointer_slots,
                    info,
                });
            }
        }
        if result_kind != Kind::Void {
            let dest = self.result_variable(node)?;
            self.cur.push(LirOp::Move {
                src: result_location,
                dest: Operand::Variable(dest),
            });
        }
        Ok(())
    }

    fn lower_new_multi_array(
        &mut self,
        node: NodeId,
        class: &lungo_code::ClassInfo,
        dimensions: &[NodeId],
    ) -> Result<()> {
        let info = self.required_debug_info(node)?;
        // The dimension counts travel through a raw frame buffer
        let count = i32::try_from(dimensions.len()).unwrap_or(i32::MAX);
        let offset = self.stack_alloc_bytes;
        self.stack_alloc_bytes += (count * 4 + 7) & !7;
        let buffer = self.new_variable(Kind::Word);
        self.cur.push(LirOp::StackAllocate {
            offset,
            dest: Operand::Variable(buffer),
        });
        for (position, dimension) in dimensions.iter().enumerate() {
            let value = self.operand_of(*dimension)?;
            self.cur.push(LirOp::Store {
                address: Address::offset(
                    Operand::Variable(buffer),
                    i32::try_from(position).unwrap_or(i32::MAX) * 4,
                    Kind::Int,
                ),
                value,
                info: None,
            });
        }
        let snippet = self.runtime.xir().new_multi_array(
            class,
            XirArgument::Const(ConstValue::Word(0)),
            XirArgument::Const(ConstValue::Int(count)),
        );
        let inputs = vec![
            Operand::Variable(buffer),
            Operand::Const(ConstValue::Int(count)),
        ];
        self.emit_snippet(&snippet, inputs, Some(node), Some(info))?;
        Ok(())
    }

    fn lower_intrinsic(
        &mut self,
        node: NodeId,
        intrinsic: IntrinsicId,
        arguments: &[NodeId],
    ) -> Result<()> {
        match intrinsic {
            IntrinsicId::Sin
            | IntrinsicId::Cos
            | IntrinsicId::Tan
            | IntrinsicId::Log
            | IntrinsicId::Log10
            | IntrinsicId::NanoTime
            | IntrinsicId::CurrentTimeMillis => {
                let call = match intrinsic {
                    IntrinsicId::Sin => RuntimeCall::ArithmeticSin,
                    IntrinsicId::Cos => RuntimeCall::ArithmeticCos,
                    IntrinsicId::Tan => RuntimeCall::ArithmeticTan,
                    IntrinsicId::Log => RuntimeCall::ArithmeticLog,
                    IntrinsicId::Log10 => RuntimeCall::ArithmeticLog10,
                    IntrinsicId::NanoTime => RuntimeCall::NanoTime,
                    _ => RuntimeCall::CurrentTimeMillis,
                };
                let operands = arguments
                    .iter()
                    .map(|argument| self.operand_of(*argument))
                    .collect::<Result<Vec<_>>>()?;
                let dest = self.result_variable(node)?;
                let info = self.debug_info(node);
                self.cur.push(LirOp::CallRuntime {
                    call,
                    arguments: operands,
                    result: Operand::Variable(dest),
                    info,
                });
            }
            IntrinsicId::Sqrt => {
                let value = self.operand_of(arguments[0])?;
                let dest = self.result_variable(node)?;
                self.cur.push(LirOp::Sqrt {
                    double: true,
                    value,
                    dest: Operand::Variable(dest),
                });
            }
            IntrinsicId::AbsDouble | IntrinsicId::AbsFloat => {
                let value = self.operand_of(arguments[0])?;
                let dest = self.result_variable(node)?;
                self.cur.push(LirOp::FpAbs {
                    double: intrinsic == IntrinsicId::AbsDouble,
                    value,
                    dest: Operand::Variable(dest),
                });
            }
            IntrinsicId::FloatToRawIntBits
            | IntrinsicId::IntBitsToFloat
            | IntrinsicId::DoubleToRawLongBits
            | IntrinsicId::LongBitsToDouble => {
                // A raw move between kinds: the bits travel through the spill slot
                let value = self.operand_of(arguments[0])?;
                let dest = self.result_variable(node)?;
                self.cur.push(LirOp::Move {
                    src: value,
                    dest: Operand::Variable(dest),
                });
            }
            IntrinsicId::CompareAndSwapInt
            | IntrinsicId::CompareAndSwapLong
            | IntrinsicId::CompareAndSwapObject => {
                // (unsafe, object, offset, expected, update)
                if arguments.len() != 5 {
                    return Err(InvariantViolation(
                        "compare and swap expects five arguments".to_string(),
                    ));
                }
                let object = self.operand_of(arguments[1])?;
                let offset = self.operand_of(arguments[2])?;
                let expect = self.operand_of(arguments[3])?;
                let update = self.operand_of(arguments[4])?;
                let kind = match intrinsic {
                    IntrinsicId::CompareAndSwapInt => Kind::Int,
                    IntrinsicId::CompareAndSwapLong => Kind::Long,
                    _ => Kind::Object,
                };
                let dest = self.result_variable(node)?;
                self.cur.push(LirOp::Cas {
                    address: Address::indexed(object, offset, Scale::Times1, 0, kind),
                    expect,
                    update,
                    result: Operand::Variable(dest),
                    kind,
                });
            }
        }
        Ok(())
    }

    fn lower_switch(&mut self, value: NodeId, keys: &[i32], successors: &[BlockId]) -> Result<()> {
        let operand = self.operand_of(value)?;
        let case_count = successors.len().saturating_sub(1);
        let default = *successors.last().ok_or_else(|| {
            InvariantViolation("switch without a default successor".to_string())
        })?;
        let case_successors = &successors[..case_count];
        if keys.len() != case_count {
            return Err(InvariantViolation(format!(
                "switch has {} keys for {case_count} case successors",
                keys.len()
            )));
        }
        if self.options.gen_table_ranges {
            let ranges = create_ranges(keys, case_successors);
            for range in &ranges {
                if range.low_key == range.high_key {
                    self.cur.push(LirOp::Cmp {
                        kind: Kind::Int,
                        x: operand.clone(),
                        y: Operand::Const(ConstValue::Int(range.low_key)),
                    });
                    self.cur.push(LirOp::Branch {
                        condition: Condition::Equal,
                        target: range.successor,
                    });
                } else if range.key_count() == 2 {
                    for key in [range.low_key, range.high_key] {
                        self.cur.push(LirOp::Cmp {
                            kind: Kind::Int,
                            x: operand.clone(),
                            y: Operand::Const(ConstValue::Int(key)),
                        });
                        self.cur.push(LirOp::Branch {
                            condition: Condition::Equal,
                            target: range.successor,
                        });
                    }
                } else {
                    let skip = self.local_labels;
                    self.local_labels += 1;
                    self.cur.push(LirOp::Cmp {
                        kind: Kind::Int,
                        x: operand.clone(),
                        y: Operand::Const(ConstValue::Int(range.low_key)),
                    });
                    self.cur.push(LirOp::BranchLocal {
                        condition: Condition::Less,
                        label: skip,
                    });
                    self.cur.push(LirOp::Cmp {
                        kind: Kind::Int,
                        x: operand.clone(),
                        y: Operand::Const(ConstValue::Int(range.high_key)),
                    });
                    self.cur.push(LirOp::Branch {
                        condition: Condition::LessEqual,
                        target: range.successor,
                    });
                    self.cur.push(LirOp::LabelLocal { label: skip });
                }
            }
        } else {
            for (key, successor) in keys.iter().zip(case_successors.iter()) {
                self.cur.push(LirOp::Cmp {
                    kind: Kind::Int,
                    x: operand.clone(),
                    y: Operand::Const(ConstValue::Int(*key)),
                });
                self.cur.push(LirOp::Branch {
                    condition: Condition::Equal,
                    target: *successor,
                });
            }
        }
        self.cur.push(LirOp::Jump { target: default });
        Ok(())
    }
}
