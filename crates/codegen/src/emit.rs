//! The code transform: a forward walk over the data-flow graph that shuffles
//! the concrete stack into each precomputed layout and emits native
//! instructions into the assembly sink.
//!
//! Blocks are emitted depth-first with fallthrough where a target has a
//! single predecessor; everything else is staged behind a label and drained
//! by the two-queue driver (blocks first, then functions, which may stage
//! further blocks).

use rustc_hash::{FxHashMap, FxHashSet};
use std::collections::{BTreeMap, VecDeque};

use halyard_ir::asm::{Assembly, JumpKind, LabelId, Opcode};
use halyard_ir::ast::Span;
use halyard_ir::dfg::{BlockExit, BlockId, CallId, Dfg, FuncId, OperationKind, Stack, StackSlot};
use halyard_ir::dialect::Dialect;
use halyard_ir::display::slot_to_string;

use crate::error::CodegenError;
use crate::layout::StackLayout;
use crate::shuffle::{
    common_prefix_len, create_stack_layout, shallowest_depth, ShuffleOp, DUP_DEPTH_MAX,
    SWAP_DEPTH_MAX,
};

pub struct CodeGenerator<'a, D: Dialect> {
    asm: &'a mut dyn Assembly,
    dialect: &'a D,
    dfg: &'a Dfg,
    layout: &'a StackLayout,
    use_named_labels: bool,
    stack: Stack,
    current_span: Span,
    return_labels: FxHashMap<CallId, LabelId>,
    block_labels: FxHashMap<BlockId, LabelId>,
    function_labels: FxHashMap<FuncId, LabelId>,
    generated: FxHashSet<BlockId>,
    generated_functions: FxHashSet<FuncId>,
    staged_blocks: VecDeque<BlockId>,
    staged_functions: VecDeque<FuncId>,
    current_function: Option<FuncId>,
}

impl<'a, D: Dialect> CodeGenerator<'a, D> {
    pub fn run(
        asm: &'a mut dyn Assembly,
        dialect: &'a D,
        dfg: &'a Dfg,
        layout: &'a StackLayout,
        use_named_labels: bool,
    ) -> Result<(), CodegenError> {
        let mut generator = CodeGenerator {
            asm,
            dialect,
            dfg,
            layout,
            use_named_labels,
            stack: Stack::new(),
            current_span: Span::DUMMY,
            return_labels: FxHashMap::default(),
            block_labels: FxHashMap::default(),
            function_labels: FxHashMap::default(),
            generated: FxHashSet::default(),
            generated_functions: FxHashSet::default(),
            staged_blocks: VecDeque::new(),
            staged_functions: VecDeque::new(),
            current_function: None,
        };
        generator.visit_block(dfg.entry)?;
        generator.generate_staged()
    }

    fn visit_block(&mut self, block: BlockId) -> Result<(), CodegenError> {
        if !self.generated.insert(block) {
            return Ok(());
        }

        let dfg = self.dfg;
        let layout = self.layout;
        let block_layout = &layout.block_layout[block];

        if let Some(&label) = self.block_labels.get(&block) {
            self.asm.append_label(label);
        }

        debug_assert!(
            layout_compatible(&self.stack, &block_layout.entry),
            "incompatible stack at {block} entry"
        );
        self.stack = block_layout.entry.clone();
        debug_assert_eq!(self.asm.stack_height(), self.stack.len() as i32);

        for idx in 0..dfg.block(block).operations.len() {
            let target = layout.operation_entry[block][idx].clone();
            self.create_stack_layout(&target)?;
            self.execute_operation(block, idx)?;
        }
        self.create_stack_layout(&block_layout.exit.clone())?;

        match dfg.block(block).exit {
            BlockExit::MainExit => {
                self.asm.append_instruction(Opcode::Stop);
                Ok(())
            }
            BlockExit::Terminated => Ok(()),
            BlockExit::Jump { target, .. } => {
                let entry = layout.block_layout[target].entry.clone();
                self.create_stack_layout(&entry)?;

                if !self.block_labels.contains_key(&target)
                    && dfg.block(target).entries.len() == 1
                {
                    self.visit_block(target)
                } else {
                    let label = self.block_label(target);
                    debug_assert_eq!(self.stack, entry);
                    self.asm.append_jump_to(label, 0, JumpKind::Ordinary);
                    if !self.generated.contains(&target) {
                        self.staged_blocks.push_back(target);
                    }
                    Ok(())
                }
            }
            BlockExit::ConditionalJump { non_zero, zero, .. } => {
                let non_zero_label = self.block_label(non_zero);
                self.asm.append_jump_to_if(non_zero_label);
                self.stack.pop();

                debug_assert!(layout_compatible(
                    &self.stack,
                    &layout.block_layout[non_zero].entry
                ));
                debug_assert!(layout_compatible(
                    &self.stack,
                    &layout.block_layout[zero].entry
                ));

                if !self.generated.contains(&non_zero) {
                    self.staged_blocks.push_back(non_zero);
                }

                let zero_label = self.block_label(zero);
                if self.generated.contains(&zero) {
                    self.asm.append_jump_to(zero_label, 0, JumpKind::Ordinary);
                    Ok(())
                } else {
                    self.visit_block(zero)
                }
            }
            BlockExit::FunctionReturn { function } => {
                debug_assert_eq!(self.current_function, Some(function));
                let info = &dfg.functions[function];
                let mut exit_stack: Stack = info
                    .return_variables
                    .iter()
                    .map(|var| StackSlot::Variable(*var))
                    .collect();
                exit_stack.push(StackSlot::FunctionReturnLabel);

                self.create_stack_layout(&exit_stack)?;
                self.asm.set_source_location(info.span);
                self.asm.append_jump(0, JumpKind::OutOfFunction);
                self.asm.set_stack_height(0);
                self.stack.clear();
                Ok(())
            }
        }
    }

    fn execute_operation(&mut self, block: BlockId, idx: usize) -> Result<(), CodegenError> {
        let dfg = self.dfg;
        let op = &dfg.block(block).operations[idx];
        self.current_span = op.span;
        self.asm.set_source_location(op.span);

        match &op.kind {
            OperationKind::BuiltinCall { builtin, call, args } => {
                debug_assert!(self.stack.len() >= *args);
                debug_assert!(self.stack.ends_with(&op.input));
                let call_site = &dfg.calls[*call];
                self.dialect
                    .emit_builtin(*builtin, &call_site.literal_args, &mut *self.asm);
                self.stack.truncate(self.stack.len() - args);
                let returns = self.dialect.builtin_info(*builtin).returns;
                for i in 0..returns {
                    self.stack.push(StackSlot::Temporary(*call, i as u16));
                }
            }
            OperationKind::FunctionCall { function, call } => {
                let info = &dfg.functions[*function];
                let num_args = info.parameters.len();
                let num_returns = info.return_variables.len();

                debug_assert_eq!(
                    self.stack[self.stack.len() - num_args - 1],
                    StackSlot::CallReturnLabel(*call),
                    "return label missing below call arguments"
                );

                let function_label = self.function_label(*function);
                let return_label = self.return_label(*call);
                self.asm.append_jump_to(
                    function_label,
                    num_returns as i32 - num_args as i32 - 1,
                    JumpKind::IntoFunction,
                );
                self.asm.append_label(return_label);
                self.stack.truncate(self.stack.len() - num_args - 1);
                for i in 0..num_returns {
                    self.stack.push(StackSlot::Temporary(*call, i as u16));
                }
            }
            OperationKind::Assignment { vars } => {
                // Stale copies of the assigned variables become junk, then
                // the freshly computed values on top take their names.
                for slot in self.stack.iter_mut() {
                    if let StackSlot::Variable(var) = slot {
                        if vars.contains(var) {
                            *slot = StackSlot::Junk;
                        }
                    }
                }
                let len = self.stack.len();
                debug_assert!(len >= vars.len());
                for (slot, var) in self.stack[len - vars.len()..].iter_mut().zip(vars.iter()) {
                    *slot = StackSlot::Variable(*var);
                }
            }
        }

        debug_assert_eq!(self.asm.stack_height(), self.stack.len() as i32);
        Ok(())
    }

    fn visit_function(&mut self, function: FuncId) -> Result<(), CodegenError> {
        debug_assert!(self.current_function.is_none());
        self.current_function = Some(function);

        let dfg = self.dfg;
        let info = &dfg.functions[function];
        let entry_layout = self.layout.block_layout[info.entry].entry.clone();

        // Calling convention: the return label sits below the reversed
        // parameters, the first parameter on top.
        self.stack.clear();
        self.stack.push(StackSlot::FunctionReturnLabel);
        for &param in info.parameters.iter().rev() {
            self.stack.push(StackSlot::Variable(param));
        }
        self.asm.set_stack_height(self.stack.len() as i32);
        self.current_span = info.span;
        self.asm.set_source_location(info.span);

        let label = self.function_labels[&function];
        self.asm.append_label(label);
        self.create_stack_layout(&entry_layout)?;
        self.visit_block(info.entry)?;

        self.current_function = None;
        Ok(())
    }

    /// Drain staged blocks, then staged functions; function bodies may stage
    /// more blocks, which belong to that function's frame.
    fn generate_staged(&mut self) -> Result<(), CodegenError> {
        while let Some(block) = self.staged_blocks.pop_front() {
            self.stack = self.layout.block_layout[block].entry.clone();
            self.asm.set_stack_height(self.stack.len() as i32);
            self.visit_block(block)?;
        }
        while let Some(function) = self.staged_functions.pop_front() {
            if self.generated_functions.insert(function) {
                self.visit_function(function)?;
            }
            debug_assert!(self.current_function.is_none());
            self.current_function = Some(function);
            while let Some(block) = self.staged_blocks.pop_front() {
                self.stack = self.layout.block_layout[block].entry.clone();
                self.asm.set_stack_height(self.stack.len() as i32);
                self.visit_block(block)?;
            }
            self.current_function = None;
        }
        Ok(())
    }

    fn block_label(&mut self, block: BlockId) -> LabelId {
        if let Some(&label) = self.block_labels.get(&block) {
            return label;
        }
        let label = self.asm.new_label();
        self.block_labels.insert(block, label);
        label
    }

    fn function_label(&mut self, function: FuncId) -> LabelId {
        if let Some(&label) = self.function_labels.get(&function) {
            return label;
        }
        let dfg = self.dfg;
        let info = &dfg.functions[function];
        let label = if self.use_named_labels {
            self.asm.named_label(
                &info.name,
                info.parameters.len(),
                info.return_variables.len(),
            )
        } else {
            self.asm.new_label()
        };
        self.function_labels.insert(function, label);
        self.staged_functions.push_back(function);
        label
    }

    fn return_label(&mut self, call: CallId) -> LabelId {
        if let Some(&label) = self.return_labels.get(&call) {
            return label;
        }
        let label = self.asm.new_label();
        self.return_labels.insert(call, label);
        label
    }

    /// Whether the shuffle to `target` stays within reach, including `DUP`s
    /// of slots that only exist in the untouched common prefix.
    fn try_create_stack_layout(&self, target: &[StackSlot]) -> bool {
        let prefix_len = common_prefix_len(&self.stack, target);
        let prefix = &self.stack[..prefix_len];
        let mut tail = self.stack[prefix_len..].to_vec();

        let mut good = true;
        let outcome: Result<(), std::convert::Infallible> =
            create_stack_layout(&mut tail, &target[prefix_len..], |stack, op| {
                match op {
                    ShuffleOp::Swap(depth) if depth > SWAP_DEPTH_MAX => good = false,
                    ShuffleOp::Dup(depth) if depth > DUP_DEPTH_MAX => good = false,
                    ShuffleOp::Push(slot) => {
                        if let Some(depth) = shallowest_depth_concat(prefix, stack, &slot) {
                            if depth + 1 > DUP_DEPTH_MAX {
                                good = false;
                            }
                        }
                    }
                    _ => {}
                }
                Ok(())
            });
        debug_assert!(outcome.is_ok());
        good
    }

    /// Shuffle the concrete stack into `target`, emitting instructions.
    ///
    /// If the plain shuffle would exceed the reach limit, deep slots needed
    /// by the target are first duplicated to the top (deepest first) so the
    /// remaining moves stay within reach. A slot that still cannot be
    /// reached is a stack-too-deep failure.
    fn create_stack_layout(&mut self, target: &[StackSlot]) -> Result<(), CodegenError> {
        let prefix_len = common_prefix_len(&self.stack, target);

        if !self.try_create_stack_layout(target) {
            let mut slots_by_depth: BTreeMap<usize, StackSlot> = BTreeMap::new();
            for slot in &target[prefix_len.min(target.len())..] {
                if let Some(depth) = shallowest_depth(&self.stack, slot) {
                    slots_by_depth.insert(depth, *slot);
                }
            }
            for (_, slot) in slots_by_depth.into_iter().rev() {
                if self.stack[prefix_len..].contains(&slot) {
                    continue;
                }
                let depth = shallowest_depth(&self.stack, &slot).unwrap();
                if depth + 1 > DUP_DEPTH_MAX {
                    return Err(self.stack_too_deep(&slot));
                }
                self.asm.append_instruction(Opcode::dup_n(depth + 1));
                self.stack.push(slot);
            }
        }

        let prefix: Stack = self.stack[..prefix_len].to_vec();
        let mut tail: Stack = self.stack[prefix_len..].to_vec();
        let target_tail = &target[prefix_len.min(target.len())..];

        let asm = &mut *self.asm;
        let return_labels = &mut self.return_labels;
        let dfg = self.dfg;
        let current_function = self.current_function;
        let current_span = self.current_span;

        create_stack_layout(&mut tail, target_tail, |stack, op| {
            match op {
                ShuffleOp::Swap(depth) => {
                    if depth > SWAP_DEPTH_MAX {
                        let slot = stack[stack.len() - 1 - depth];
                        return Err(CodegenError::StackTooDeep {
                            span: current_span,
                            slot: slot_to_string(dfg, slot),
                        });
                    }
                    asm.append_instruction(Opcode::swap_n(depth));
                }
                ShuffleOp::Dup(depth) => {
                    if depth > DUP_DEPTH_MAX {
                        let slot = stack[stack.len() - depth];
                        return Err(CodegenError::StackTooDeep {
                            span: current_span,
                            slot: slot_to_string(dfg, slot),
                        });
                    }
                    asm.append_instruction(Opcode::dup_n(depth));
                }
                ShuffleOp::Push(slot) => {
                    // A copy may still exist on the stack (possibly in the
                    // untouched prefix); dup beats rematerializing.
                    if let Some(depth) = shallowest_depth_concat(&prefix, stack, &slot) {
                        if depth + 1 > DUP_DEPTH_MAX {
                            return Err(CodegenError::StackTooDeep {
                                span: current_span,
                                slot: slot_to_string(dfg, slot),
                            });
                        }
                        asm.append_instruction(Opcode::dup_n(depth + 1));
                        return Ok(());
                    }
                    push_slot(&mut *asm, &mut *return_labels, dfg, current_function, slot);
                }
                ShuffleOp::Pop => {
                    asm.append_instruction(Opcode::Pop);
                }
            }
            Ok(())
        })?;

        self.stack = prefix;
        self.stack.extend(tail);
        debug_assert_eq!(self.stack, target);
        debug_assert_eq!(self.asm.stack_height(), self.stack.len() as i32);
        Ok(())
    }

    fn stack_too_deep(&self, slot: &StackSlot) -> CodegenError {
        CodegenError::StackTooDeep {
            span: self.current_span,
            slot: slot_to_string(self.dfg, *slot),
        }
    }
}

/// Materialize a slot that exists nowhere on the stack.
fn push_slot(
    asm: &mut dyn Assembly,
    return_labels: &mut FxHashMap<CallId, LabelId>,
    dfg: &Dfg,
    current_function: Option<FuncId>,
    slot: StackSlot,
) {
    match slot {
        StackSlot::Literal(value) => {
            asm.append_constant(value);
        }
        StackSlot::CallReturnLabel(call) => {
            let label = match return_labels.get(&call) {
                Some(&label) => label,
                None => {
                    let label = asm.new_label();
                    return_labels.insert(call, label);
                    label
                }
            };
            asm.append_label_reference(label);
        }
        StackSlot::Variable(var) => {
            // Return variables start out uninitialized; everything else must
            // already be on the stack.
            let is_return_var = current_function
                .map(|f| dfg.functions[f].return_variables.contains(&var))
                .unwrap_or(false);
            assert!(
                is_return_var,
                "cannot materialize variable `{}`",
                dfg.var_name(var)
            );
            asm.append_constant(halyard_ir::U256::zero());
        }
        StackSlot::Junk => {
            // Always popped later; any 2-gas deterministic value will do.
            asm.append_instruction(Opcode::Pc);
        }
        StackSlot::Temporary(..) | StackSlot::FunctionReturnLabel => {
            panic!("cannot materialize {slot:?}");
        }
    }
}

/// Shallowest depth of `slot` in `prefix ++ tail` (0 = top of `tail`).
fn shallowest_depth_concat(
    prefix: &[StackSlot],
    tail: &[StackSlot],
    slot: &StackSlot,
) -> Option<usize> {
    if let Some(depth) = shallowest_depth(tail, slot) {
        return Some(depth);
    }
    shallowest_depth(prefix, slot).map(|depth| depth + tail.len())
}

/// Each desired slot is either equal to the present one or junk (which
/// matches anything).
fn layout_compatible(current: &[StackSlot], desired: &[StackSlot]) -> bool {
    current
        .iter()
        .zip(desired.iter())
        .all(|(cur, want)| *want == StackSlot::Junk || cur == want)
}
