//! The stack layout generator: a backward dataflow pass that assigns every
//! basic block an entry and exit stack layout, and every operation the exact
//! stack it must see before executing.
//!
//! Layouts are chosen so that operations find their inputs on top, layouts at
//! control-flow joins are compatible, and the expected shuffling cost stays
//! low under the machine's depth-16 reach limit. Two post-passes then stitch
//! conditional-jump successors to a common witnessed layout and patch layouts
//! that would force the emitter beyond `DUP16`.

mod trace;

pub use trace::{LayoutObserver, LayoutTrace, NullObserver};

use cranelift_entity::SecondaryMap;
use rustc_hash::FxHashSet;
use std::collections::VecDeque;

use halyard_ir::dfg::{BlockExit, BlockId, Dfg, Operation, OperationKind, Stack, StackSlot};

use crate::shuffle::{
    create_stack_layout, unreachable_slots, ShuffleOp, DUP_DEPTH_MAX, SWAP_DEPTH_MAX,
};

/// Above this length, candidate suffixes at joins are not permuted (the
/// enumeration is factorial).
const MAX_PERMUTED_CANDIDATE: usize = 6;

/// Layouts above this size are rebuilt keeping one copy of each
/// non-regenerable slot.
const MAX_PROPAGATED_SIZE: usize = 12;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BlockLayout {
    pub entry: Stack,
    pub exit: Stack,
}

#[derive(Debug, Default)]
pub struct StackLayout {
    pub block_layout: SecondaryMap<BlockId, BlockLayout>,
    /// Entry stack per operation, parallel to `BasicBlock::operations`.
    pub operation_entry: SecondaryMap<BlockId, Vec<Stack>>,
}

impl StackLayout {
    pub fn run(dfg: &Dfg) -> Self {
        Self::run_with_observer(dfg, &mut NullObserver)
    }

    pub fn run_with_observer<O: LayoutObserver>(dfg: &Dfg, observer: &mut O) -> Self {
        let mut generator = LayoutGenerator {
            dfg,
            layout: StackLayout::default(),
            has_layout: FxHashSet::default(),
            observer,
        };

        generator.process_entry_point(dfg.entry);
        for (_, info) in dfg.functions.iter() {
            generator.process_entry_point(info.entry);
        }

        generator.stitch_conditional_jumps(dfg.entry);
        for (_, info) in dfg.functions.iter() {
            generator.stitch_conditional_jumps(info.entry);
        }

        generator.fix_stack_too_deep(dfg.entry);
        for (_, info) in dfg.functions.iter() {
            generator.fix_stack_too_deep(info.entry);
        }

        generator.layout
    }
}

/// Backward propagation through one operation.
///
/// Given the layout required after the operation, returns the recorded
/// pre-operation layout (inputs on top) and the compressed layout the
/// propagation continues with.
pub fn propagate_through_operation(exit_stack: Stack, op: &Operation) -> (Stack, Stack) {
    // Exit positions holding an output value are produced by the operation
    // (or copied from its results by the following shuffle); everything else
    // must already exist before the operation, keeping its relative order.
    let mut covered = vec![false; exit_stack.len()];
    for output in &op.output {
        for (idx, slot) in exit_stack.iter().enumerate() {
            if slot == output {
                covered[idx] = true;
            }
        }
    }
    let mut stack: Stack = exit_stack
        .iter()
        .enumerate()
        .filter(|(idx, _)| !covered[*idx])
        .map(|(_, slot)| *slot)
        .collect();

    // Values assigned by the operation are dead before it.
    if let OperationKind::Assignment { vars } = &op.kind {
        for slot in stack.iter_mut() {
            if let StackSlot::Variable(var) = slot {
                if vars.contains(var) {
                    *slot = StackSlot::Junk;
                }
            }
        }
    }

    stack.extend(op.input.iter().copied());
    let entry = stack.clone();

    // Compression: slots that can be regenerated or dupped from below need
    // not be kept on the stack between operations.
    while let Some(&top) = stack.last() {
        if top.is_regenerable() {
            stack.pop();
            continue;
        }
        if stack[..stack.len() - 1].contains(&top) {
            stack.pop();
            continue;
        }
        break;
    }

    // Size cap: beyond this, keep one copy of each slot that cannot be
    // regenerated. Lossy for cost, harmless for correctness.
    if stack.len() > MAX_PROPAGATED_SIZE {
        let mut compressed: Stack = Vec::new();
        for slot in &stack {
            if matches!(slot, StackSlot::Literal(_) | StackSlot::CallReturnLabel(_)) {
                continue;
            }
            if compressed.contains(slot) {
                continue;
            }
            compressed.push(*slot);
        }
        stack = compressed;
    }

    (entry, stack)
}

struct LayoutGenerator<'a, O: LayoutObserver> {
    dfg: &'a Dfg,
    layout: StackLayout,
    /// Blocks whose layout has been computed at least once (across entry
    /// points and reconciliation rounds).
    has_layout: FxHashSet<BlockId>,
    observer: &'a mut O,
}

impl<'a, O: LayoutObserver> LayoutGenerator<'a, O> {
    fn propagate_through_block(&mut self, exit_stack: Stack, block: BlockId) -> Stack {
        let ops = &self.dfg.block(block).operations;
        let mut entries = vec![Stack::new(); ops.len()];
        let mut stack = exit_stack;
        for (idx, op) in ops.iter().enumerate().rev() {
            let (entry, continued) = propagate_through_operation(stack, op);
            entries[idx] = entry;
            stack = continued;
        }
        self.layout.operation_entry[block] = entries;
        stack
    }

    /// Worklist pass over all blocks reachable backwards from `entry`'s
    /// exits. A block's exit layout is derived from its successors; blocks
    /// whose successors are not yet known are deferred behind them.
    fn process_entry_point(&mut self, entry: BlockId) {
        let mut to_visit: VecDeque<BlockId> = VecDeque::new();
        to_visit.push_back(entry);
        let mut visited: FxHashSet<BlockId> = FxHashSet::default();
        let mut backwards_jumps: Vec<(BlockId, BlockId)> = Vec::new();

        while let Some(block) = to_visit.pop_front() {
            if visited.contains(&block) {
                continue;
            }

            let exit_layout: Option<Stack> = match self.dfg.block(block).exit {
                BlockExit::MainExit | BlockExit::Terminated => {
                    visited.insert(block);
                    Some(Stack::new())
                }
                BlockExit::Jump {
                    target,
                    backwards: true,
                } => {
                    visited.insert(block);
                    backwards_jumps.push((block, target));
                    if self.has_layout.contains(&target) {
                        Some(self.layout.block_layout[target].entry.clone())
                    } else {
                        Some(Stack::new())
                    }
                }
                BlockExit::Jump {
                    target,
                    backwards: false,
                } => {
                    if visited.contains(&target) {
                        visited.insert(block);
                        Some(self.layout.block_layout[target].entry.clone())
                    } else {
                        to_visit.push_front(block);
                        to_visit.push_front(target);
                        None
                    }
                }
                BlockExit::ConditionalJump {
                    condition,
                    non_zero,
                    zero,
                } => {
                    let zero_visited = visited.contains(&zero);
                    let non_zero_visited = visited.contains(&non_zero);
                    if zero_visited && non_zero_visited {
                        let zero_entry = self.layout.block_layout[zero].entry.clone();
                        let non_zero_entry = self.layout.block_layout[non_zero].entry.clone();
                        let mut stack = combine_stack(&zero_entry, &non_zero_entry);
                        stack.push(condition);
                        visited.insert(block);
                        Some(stack)
                    } else {
                        to_visit.push_front(block);
                        if !zero_visited {
                            to_visit.push_front(zero);
                        }
                        if !non_zero_visited {
                            to_visit.push_front(non_zero);
                        }
                        None
                    }
                }
                BlockExit::FunctionReturn { function } => {
                    visited.insert(block);
                    let info = &self.dfg.functions[function];
                    let mut stack: Stack = info
                        .return_variables
                        .iter()
                        .map(|var| StackSlot::Variable(*var))
                        .collect();
                    stack.push(StackSlot::FunctionReturnLabel);
                    Some(stack)
                }
            };

            if let Some(exit_layout) = exit_layout {
                let entry_layout = self.propagate_through_block(exit_layout.clone(), block);
                self.observer
                    .on_block_layout(self.dfg, block, &entry_layout, &exit_layout);
                self.layout.block_layout[block] = BlockLayout {
                    entry: entry_layout,
                    exit: exit_layout,
                };
                self.has_layout.insert(block);
                for &pred in &self.dfg.block(block).entries {
                    to_visit.push_back(pred);
                }
            }
        }

        // A block that jumps backwards must provide everything its target
        // expects on entry. If it does not, re-run its subgraph; the target's
        // (now known) entry layout widens the requirement, so this
        // stabilizes.
        for (block, target) in backwards_jumps {
            let missing = self.layout.block_layout[target]
                .entry
                .iter()
                .any(|slot| !self.layout.block_layout[block].exit.contains(slot));
            if missing {
                self.observer.on_backwards_revisit(self.dfg, block, target);
                self.process_entry_point(block);
            }
        }
    }

    /// Force both successors of every conditional jump to an entry layout
    /// witnessed by the predecessor's exit: the exit minus the condition,
    /// with slots the branch does not need rewritten to junk.
    fn stitch_conditional_jumps(&mut self, entry: BlockId) {
        let mut visited: FxHashSet<BlockId> = FxHashSet::default();
        let mut worklist: VecDeque<BlockId> = VecDeque::new();
        worklist.push_back(entry);

        while let Some(block) = worklist.pop_front() {
            if !visited.insert(block) {
                continue;
            }
            match self.dfg.block(block).exit {
                BlockExit::Jump {
                    target,
                    backwards: false,
                } => worklist.push_back(target),
                BlockExit::ConditionalJump { non_zero, zero, .. } => {
                    let mut exit_layout = self.layout.block_layout[block].exit.clone();
                    assert!(!exit_layout.is_empty(), "conditional jump without condition");
                    exit_layout.pop();

                    for successor in [zero, non_zero] {
                        let target_entry = self.layout.block_layout[successor].entry.clone();
                        let stitched: Stack = exit_layout
                            .iter()
                            .map(|slot| {
                                if target_entry.contains(slot) {
                                    *slot
                                } else {
                                    StackSlot::Junk
                                }
                            })
                            .collect();
                        self.layout.block_layout[successor].entry = stitched;
                    }

                    worklist.push_back(zero);
                    worklist.push_back(non_zero);
                }
                _ => {}
            }
        }
    }

    /// Replay the layouts forward; wherever a shuffle would have to address
    /// the stack beyond the reach limit, splice the offending slots into the
    /// earlier operation layouts of the block, just below their inputs, so
    /// they surface within reach. Edges that still fail are reported; the
    /// emitter makes a final attempt.
    fn fix_stack_too_deep(&mut self, entry: BlockId) {
        let mut visited: FxHashSet<BlockId> = FxHashSet::default();
        let mut worklist: VecDeque<BlockId> = VecDeque::new();
        worklist.push_back(entry);

        while let Some(block) = worklist.pop_front() {
            if !visited.insert(block) {
                continue;
            }

            let mut stack = self.layout.block_layout[block].entry.clone();
            let num_ops = self.dfg.block(block).operations.len();

            for idx in 0..num_ops {
                let op_entry = self.layout.operation_entry[block][idx].clone();
                let unreachable = unreachable_slots(&stack, &op_entry);
                if !unreachable.is_empty() {
                    self.observer
                        .on_unreachable_slots(self.dfg, block, Some(idx), &unreachable);
                    self.hoist_into_operations(block, 0..idx, &unreachable);
                }

                let op = &self.dfg.block(block).operations[idx];
                stack = op_entry;
                stack.truncate(stack.len() - op.input.len());
                stack.extend(op.output.iter().copied());
            }

            let exit_layout = self.layout.block_layout[block].exit.clone();
            let unreachable = unreachable_slots(&stack, &exit_layout);
            if !unreachable.is_empty() {
                self.observer
                    .on_unreachable_slots(self.dfg, block, None, &unreachable);
                self.hoist_into_operations(block, 0..num_ops, &unreachable);
            }
            stack = exit_layout;

            match self.dfg.block(block).exit {
                BlockExit::Jump { target, backwards } => {
                    let unreachable =
                        unreachable_slots(&stack, &self.layout.block_layout[target].entry);
                    if !unreachable.is_empty() {
                        self.observer
                            .on_unfixable_edge(self.dfg, block, target, &unreachable);
                    }
                    if !backwards {
                        worklist.push_back(target);
                    }
                }
                BlockExit::ConditionalJump { non_zero, zero, .. } => {
                    for successor in [zero, non_zero] {
                        let unreachable =
                            unreachable_slots(&stack, &self.layout.block_layout[successor].entry);
                        if !unreachable.is_empty() {
                            self.observer.on_unfixable_edge(
                                self.dfg,
                                block,
                                successor,
                                &unreachable,
                            );
                        }
                        worklist.push_back(successor);
                    }
                }
                _ => {}
            }
        }
    }

    /// Insert `slots` just below the inputs in the entry layout of every
    /// operation in `range`.
    fn hoist_into_operations(
        &mut self,
        block: BlockId,
        range: std::ops::Range<usize>,
        slots: &[StackSlot],
    ) {
        for idx in range {
            let input_len = self.dfg.block(block).operations[idx].input.len();
            let entry = &mut self.layout.operation_entry[block][idx];
            let keep = entry.len() - input_len;
            let mut patched: Stack = entry[..keep].to_vec();
            patched.extend(slots.iter().copied());
            patched.extend(entry[keep..].iter().copied());
            *entry = patched;
        }
    }
}

/// Estimated shuffle cost, with deep operations heavily penalized.
fn shuffle_cost(from: &[StackSlot], to: &[StackSlot]) -> usize {
    let mut cost = 0usize;
    let mut test = from.to_vec();
    let outcome: Result<(), std::convert::Infallible> =
        create_stack_layout(&mut test, to, |_stack, op| {
            cost += 1;
            match op {
                ShuffleOp::Swap(depth) if depth > SWAP_DEPTH_MAX => cost += 1000,
                ShuffleOp::Dup(depth) if depth > DUP_DEPTH_MAX => cost += 1000,
                _ => {}
            }
            Ok(())
        });
    debug_assert!(outcome.is_ok());
    cost
}

/// A single stack from which both `stack1` and `stack2` can be reached
/// cheaply; used as the entry layout of a block flowing into both.
pub fn combine_stack(stack1: &[StackSlot], stack2: &[StackSlot]) -> Stack {
    if stack1.is_empty() {
        return stack2.to_vec();
    }
    if stack2.is_empty() {
        return stack1.to_vec();
    }

    let prefix_len = crate::shuffle::common_prefix_len(stack1, stack2);
    let mut prefix: Stack = stack1[..prefix_len].to_vec();
    let tail1 = &stack1[prefix_len..];
    let tail2 = &stack2[prefix_len..];

    // First occurrences from both suffixes; regenerable-on-demand slots are
    // left for the shuffle to produce.
    let mut candidate: Stack = Vec::new();
    for slot in tail1.iter().chain(tail2.iter()) {
        if !candidate.contains(slot) {
            candidate.push(*slot);
        }
    }
    candidate.retain(|slot| {
        !matches!(slot, StackSlot::Literal(_) | StackSlot::CallReturnLabel(_))
    });

    let evaluate = |cand: &[StackSlot]| shuffle_cost(cand, tail1) + shuffle_cost(cand, tail2);

    let mut best = candidate.clone();
    let mut best_cost = evaluate(&candidate);

    // Heap's algorithm over the candidate arrangement, keeping the cheapest.
    let n = candidate.len();
    if (2..=MAX_PERMUTED_CANDIDATE).contains(&n) {
        let mut counters = vec![0usize; n];
        let mut permuted = candidate;
        let mut i = 1;
        while i < n {
            if counters[i] < i {
                if i % 2 == 0 {
                    permuted.swap(0, i);
                } else {
                    permuted.swap(counters[i], i);
                }
                let cost = evaluate(&permuted);
                if cost < best_cost {
                    best_cost = cost;
                    best = permuted.clone();
                }
                counters[i] += 1;
                i = 1;
            } else {
                counters[i] = 0;
                i += 1;
            }
        }
    }

    prefix.extend(best);
    prefix
}

#[cfg(test)]
mod tests {
    use super::*;
    use halyard_ir::ast::{Expression, Statement, Symbols};
    use halyard_ir::builder::build_dfg;
    use halyard_ir::dialect::Dialect;
    use smallvec::SmallVec;

    use crate::isa::evm::EvmDialect;
    use halyard_ir::ast::VarId;
    use halyard_ir::dfg::Operation;
    use halyard_ir::U256;

    fn var(idx: u32) -> StackSlot {
        StackSlot::Variable(VarId(idx))
    }

    #[test]
    fn propagate_keeps_untouched_slots_in_order() {
        // exit: [a b TMP], operation produces TMP from [a].
        let dialect = EvmDialect::new();
        let builtin = dialect.builtin("iszero").unwrap();
        let mut symbols = Symbols::new();
        let a = symbols.declare("a");
        let b = symbols.declare("b");

        let call = halyard_ir::dfg::CallId(0);
        let op = Operation {
            input: vec![StackSlot::Variable(a)],
            output: vec![StackSlot::Temporary(call, 0)],
            kind: halyard_ir::dfg::OperationKind::BuiltinCall {
                builtin,
                call,
                args: 1,
            },
            span: halyard_ir::ast::Span::DUMMY,
        };
        let exit = vec![
            StackSlot::Variable(a),
            StackSlot::Variable(b),
            StackSlot::Temporary(call, 0),
        ];
        let (entry, _continued) = propagate_through_operation(exit, &op);
        // a and b survive below, the input sits on top.
        assert_eq!(
            entry,
            vec![
                StackSlot::Variable(a),
                StackSlot::Variable(b),
                StackSlot::Variable(a),
            ]
        );
    }

    #[test]
    fn propagate_covers_every_occurrence_of_an_output() {
        let mut symbols = Symbols::new();
        let x = symbols.declare("x");
        let op = Operation {
            input: vec![StackSlot::Literal(U256::from(1u64))],
            output: vec![StackSlot::Variable(x)],
            kind: halyard_ir::dfg::OperationKind::Assignment {
                vars: SmallVec::from_slice(&[x]),
            },
            span: halyard_ir::ast::Span::DUMMY,
        };
        // Every copy of x in the exit layout is produced by the assignment;
        // nothing survives below the input.
        let exit = vec![StackSlot::Variable(x), StackSlot::Variable(x)];
        let (entry, continued) = propagate_through_operation(exit, &op);
        assert_eq!(entry, vec![StackSlot::Literal(U256::from(1u64))]);
        // The literal input is regenerable and compresses away.
        assert!(continued.is_empty());
    }

    #[test]
    fn combine_stack_prefers_cheap_arrangements() {
        let s1 = vec![var(0), var(1), var(2)];
        let s2 = vec![var(0), var(2), var(1)];
        let combined = combine_stack(&s1, &s2);
        // The shared prefix survives; the rest covers both suffixes.
        assert_eq!(combined[0], var(0));
        assert!(combined.contains(&var(1)));
        assert!(combined.contains(&var(2)));
        assert!(shuffle_cost(&combined, &s1) + shuffle_cost(&combined, &s2) <= 4);
    }

    #[test]
    fn combine_stack_drops_regenerable_slots() {
        let s1 = vec![StackSlot::Literal(U256::from(7u64)), var(1)];
        let s2 = vec![var(1)];
        let combined = combine_stack(&s1, &s2);
        assert!(!combined
            .iter()
            .any(|slot| matches!(slot, StackSlot::Literal(_))));
    }

    #[test]
    fn block_propagation_round_trips() {
        // For every computed block: re-propagating its exit layout must
        // reproduce its entry layout and per-operation layouts.
        let dialect = EvmDialect::new();
        let mut symbols = Symbols::new();
        let x = symbols.declare("x");
        let y = symbols.declare("y");
        let program = halyard_ir::ast::Block::new(vec![
            Statement::declare(
                vec![x],
                Some(Expression::call(
                    "add",
                    vec![Expression::literal(1u64), Expression::literal(2u64)],
                )),
            ),
            Statement::declare(
                vec![y],
                Some(Expression::call(
                    "mul",
                    vec![Expression::identifier(x), Expression::identifier(x)],
                )),
            ),
            Statement::expression(Expression::call(
                "sstore",
                vec![Expression::literal(0u64), Expression::identifier(y)],
            )),
        ]);
        let dfg = build_dfg(&program, symbols, &dialect);
        let layout = StackLayout::run(&dfg);

        // The program is straight-line, so the post-passes leave the worklist
        // result intact and re-propagation must reproduce it exactly.
        for block in dfg.blocks.keys() {
            let ops = &dfg.block(block).operations;
            if ops.is_empty() {
                continue;
            }
            let info = &layout.block_layout[block];
            let mut stack = info.exit.clone();
            let mut entries = vec![Stack::new(); ops.len()];
            for (idx, op) in ops.iter().enumerate().rev() {
                let (entry, continued) = propagate_through_operation(stack, op);
                entries[idx] = entry;
                stack = continued;
            }
            assert_eq!(stack, info.entry);
            assert_eq!(entries, layout.operation_entry[block]);
        }
    }

    #[test]
    fn trace_observer_records_block_layouts() {
        let dialect = EvmDialect::new();
        let mut symbols = Symbols::new();
        let x = symbols.declare("x");
        let program = halyard_ir::ast::Block::new(vec![Statement::declare(
            vec![x],
            Some(Expression::call(
                "add",
                vec![Expression::literal(1u64), Expression::literal(2u64)],
            )),
        )]);
        let dfg = build_dfg(&program, symbols, &dialect);

        let mut trace = LayoutTrace::default();
        let _ = StackLayout::run_with_observer(&dfg, &mut trace);
        assert!(trace.render().contains("block0"));
    }
}
