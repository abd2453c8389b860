//! The shuffler: transforms any current stack into any target stack using
//! only `SWAP`, `DUP`, `PUSH` and `POP`.
//!
//! This is the shared kernel of the backend. The layout generator runs it
//! with a counting callback to estimate shuffling cost, and the code
//! transform runs it with an emitting callback to produce instructions.
//!
//! Termination: every step either removes a surplus copy of the top slot,
//! materializes a missing slot, or moves the top into a position where it is
//! needed; the multiset difference between current and target shrinks, or a
//! misplaced top is corrected without growing it.

use halyard_ir::dfg::{Stack, StackSlot};

/// Deepest element `SWAP*` can exchange with the top (`SWAP16`).
pub const SWAP_DEPTH_MAX: usize = 16;
/// Deepest element `DUP*` can copy (`DUP16`).
pub const DUP_DEPTH_MAX: usize = 16;

/// A single stack-machine move produced by the shuffler.
///
/// The callback observes the stack state *before* the move is applied.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShuffleOp {
    /// `SWAP<depth>`: exchange the top with the element `depth` below it
    /// (one-based; the top itself is never addressed).
    Swap(usize),
    /// `DUP<depth>`: copy the element at `depth` (1 = top) to the top.
    Dup(usize),
    /// Materialize `slot` on top of the stack.
    Push(StackSlot),
    /// `POP` the top.
    Pop,
}

pub fn count_occurrences(stack: &[StackSlot], slot: &StackSlot) -> usize {
    stack.iter().filter(|s| *s == slot).count()
}

/// Depth of the shallowest occurrence of `slot`, counted from the top
/// (0 = top).
pub fn shallowest_depth(stack: &[StackSlot], slot: &StackSlot) -> Option<usize> {
    stack.iter().rev().position(|s| s == slot)
}

pub fn common_prefix_len(a: &[StackSlot], b: &[StackSlot]) -> usize {
    a.iter().zip(b.iter()).take_while(|(x, y)| x == y).count()
}

/// Transform `current` into `target`, reporting every move through `emit`.
///
/// On success `current == target`. The algorithm itself applies each move to
/// `current`; `emit` only observes (and may fail, aborting the transform).
pub fn create_stack_layout<E>(
    current: &mut Stack,
    target: &[StackSlot],
    mut emit: impl FnMut(&[StackSlot], ShuffleOp) -> Result<(), E>,
) -> Result<(), E> {
    loop {
        if current.as_slice() == target {
            return Ok(());
        }

        if current.is_empty() {
            while current.len() < target.len() {
                let slot = target[current.len()];
                emit(current, ShuffleOp::Push(slot))?;
                current.push(slot);
            }
            debug_assert_eq!(current.as_slice(), target);
            return Ok(());
        }

        let top = *current.last().unwrap();

        // A surplus copy of the top is never needed again.
        if count_occurrences(target, &top) < count_occurrences(current, &top) {
            emit(current, ShuffleOp::Pop)?;
            current.pop();
            continue;
        }

        if target.len() >= current.len() && target[current.len() - 1] == top {
            // Top is in place: first fill in whatever is missing below,
            // then fix the deepest misplaced slot.
            if dup_or_push(current, target, &mut emit)? {
                continue;
            }
            let mut swapped = false;
            for offset in 0..current.len() {
                if current[offset] != target[offset] && current[offset] != top {
                    let depth = current.len() - offset - 1;
                    emit(current, ShuffleOp::Swap(depth))?;
                    let back = current.len() - 1;
                    current.swap(offset, back);
                    swapped = true;
                    break;
                }
            }
            if swapped {
                continue;
            }
            debug_assert_eq!(current.as_slice(), target);
            return Ok(());
        }

        // Top is not in place: thread it down into the shallowest target
        // position that still needs it.
        let mut threaded = false;
        for offset in 0..current.len().min(target.len()) {
            if target[offset] == top && current[offset] != target[offset] {
                let depth = current.len() - offset - 1;
                emit(current, ShuffleOp::Swap(depth))?;
                let back = current.len() - 1;
                current.swap(offset, back);
                threaded = true;
                break;
            }
        }
        if threaded {
            continue;
        }
        if dup_or_push(current, target, &mut emit)? {
            continue;
        }
        unreachable!("shuffle stuck: target requires a slot that cannot be produced");
    }
}

/// Duplicate the deepest underrepresented slot, or push the first target slot
/// absent from the stack. Returns whether progress was made.
fn dup_or_push<E>(
    current: &mut Stack,
    target: &[StackSlot],
    emit: &mut impl FnMut(&[StackSlot], ShuffleOp) -> Result<(), E>,
) -> Result<bool, E> {
    for offset in 0..current.len() {
        let slot = current[offset];
        if count_occurrences(current, &slot) < count_occurrences(target, &slot) {
            // Address the shallowest copy; equal slots are interchangeable.
            let depth = shallowest_depth(current, &slot).unwrap();
            emit(current, ShuffleOp::Dup(depth + 1))?;
            current.push(slot);
            return Ok(true);
        }
    }
    for slot in target {
        if !current.contains(slot) {
            emit(current, ShuffleOp::Push(*slot))?;
            current.push(*slot);
            return Ok(true);
        }
    }
    Ok(false)
}

/// Dry-run probe used by the stack-too-deep repair: the non-regenerable
/// slots the shuffle from `source` to `target` would address deeper than the
/// `SWAP16`/`DUP16` reach.
pub fn unreachable_slots(source: &[StackSlot], target: &[StackSlot]) -> Vec<StackSlot> {
    let mut current = source.to_vec();
    let mut result: Vec<StackSlot> = Vec::new();
    let outcome: Result<(), std::convert::Infallible> =
        create_stack_layout(&mut current, target, |stack, op| {
            let deep = match op {
                ShuffleOp::Swap(depth) if depth > SWAP_DEPTH_MAX => {
                    Some(stack[stack.len() - 1 - depth])
                }
                ShuffleOp::Dup(depth) if depth > DUP_DEPTH_MAX => Some(stack[stack.len() - depth]),
                _ => None,
            };
            if let Some(slot) = deep {
                if !slot.is_regenerable() && !result.contains(&slot) {
                    result.push(slot);
                }
            }
            Ok(())
        });
    debug_assert!(outcome.is_ok());
    result
}

/// Whether the shuffle from `source` to `target` stays within reach.
pub fn shuffle_within_reach(source: &[StackSlot], target: &[StackSlot]) -> bool {
    let mut current = source.to_vec();
    let mut good = true;
    let result: Result<(), std::convert::Infallible> =
        create_stack_layout(&mut current, target, |_stack, op| {
            match op {
                ShuffleOp::Swap(depth) if depth > SWAP_DEPTH_MAX => good = false,
                ShuffleOp::Dup(depth) if depth > DUP_DEPTH_MAX => good = false,
                _ => {}
            }
            Ok(())
        });
    debug_assert!(result.is_ok());
    good
}

#[cfg(test)]
mod tests {
    use super::*;
    use halyard_ir::ast::VarId;
    use halyard_ir::dfg::{CallId, StackSlot};
    use halyard_ir::U256;

    fn var(idx: u32) -> StackSlot {
        StackSlot::Variable(VarId(idx))
    }

    fn lit(value: u64) -> StackSlot {
        StackSlot::Literal(U256::from(value))
    }

    fn tmp(call: u32, idx: u16) -> StackSlot {
        StackSlot::Temporary(CallId(call), idx)
    }

    /// Run the shuffler and record the emitted moves, checking that every
    /// depth is valid for the stack it was emitted against.
    fn shuffle(mut current: Stack, target: &[StackSlot]) -> (Stack, Vec<ShuffleOp>) {
        let mut ops = Vec::new();
        let result: Result<(), std::convert::Infallible> =
            create_stack_layout(&mut current, target, |stack, op| {
                match op {
                    ShuffleOp::Swap(depth) => {
                        assert!(depth >= 1 && depth < stack.len(), "bad SWAP{depth}");
                    }
                    ShuffleOp::Dup(depth) => {
                        assert!(depth >= 1 && depth <= stack.len(), "bad DUP{depth}");
                    }
                    ShuffleOp::Pop => assert!(!stack.is_empty()),
                    ShuffleOp::Push(_) => {}
                }
                ops.push(op);
                Ok(())
            });
        assert!(result.is_ok());
        (current, ops)
    }

    #[test]
    fn already_equal_emits_nothing() {
        let stack = vec![var(0), var(1), lit(7)];
        let (out, ops) = shuffle(stack.clone(), &stack);
        assert_eq!(out, stack);
        assert!(ops.is_empty());
    }

    #[test]
    fn builds_from_empty() {
        let target = vec![lit(1), var(0), StackSlot::Junk];
        let (out, ops) = shuffle(Vec::new(), &target);
        assert_eq!(out, target);
        assert_eq!(
            ops,
            vec![
                ShuffleOp::Push(lit(1)),
                ShuffleOp::Push(var(0)),
                ShuffleOp::Push(StackSlot::Junk),
            ]
        );
    }

    #[test]
    fn pops_surplus_top() {
        let (out, ops) = shuffle(vec![var(0), var(1)], &[var(0)]);
        assert_eq!(out, vec![var(0)]);
        assert_eq!(ops, vec![ShuffleOp::Pop]);
    }

    #[test]
    fn swaps_two_elements() {
        let (out, ops) = shuffle(vec![var(0), var(1)], &[var(1), var(0)]);
        assert_eq!(out, vec![var(1), var(0)]);
        assert_eq!(ops.iter().filter(|op| matches!(op, ShuffleOp::Swap(_))).count(), 1);
    }

    #[test]
    fn dups_needed_copy() {
        let (out, ops) = shuffle(vec![var(0)], &[var(0), var(0)]);
        assert_eq!(out, vec![var(0), var(0)]);
        assert_eq!(ops, vec![ShuffleOp::Dup(1)]);
    }

    #[test]
    fn dup_addresses_shallowest_occurrence() {
        // var(0) exists both deep and on top; the copy must come from the top.
        let current = vec![var(0), var(1), var(2), var(0)];
        let target = vec![var(0), var(1), var(2), var(0), var(0)];
        let (out, ops) = shuffle(current, &target);
        assert_eq!(out, target);
        assert_eq!(ops, vec![ShuffleOp::Dup(1)]);
    }

    #[test]
    fn reverses_a_stack() {
        let current = vec![var(0), var(1), var(2), var(3)];
        let target = vec![var(3), var(2), var(1), var(0)];
        let (out, ops) = shuffle(current, &target);
        assert_eq!(out, target);
        assert!(ops.iter().all(|op| matches!(op, ShuffleOp::Swap(_))));
    }

    #[test]
    fn rebuilds_with_dups_and_pops() {
        let current = vec![var(0), var(1), var(2)];
        let target = vec![var(2), var(0), var(0), lit(3)];
        let (out, _) = shuffle(current, &target);
        assert_eq!(out, target);
    }

    #[test]
    fn junk_slots_compare_equal() {
        let current = vec![StackSlot::Junk, var(1)];
        let target = vec![StackSlot::Junk, var(1)];
        let (_, ops) = shuffle(current, &target);
        assert!(ops.is_empty());
    }

    #[test]
    fn temporaries_are_distinct_per_call_and_index() {
        let current = vec![tmp(0, 0), tmp(0, 1)];
        let target = vec![tmp(0, 1), tmp(0, 0)];
        let (out, _) = shuffle(current, &target);
        assert_eq!(out, target);
    }

    #[test]
    fn terminates_on_large_random_like_inputs() {
        // A worst-case-ish mixture: duplicates, drops, and reordering.
        let current: Stack = (0..10).map(var).chain((0..4).map(var)).collect();
        let target: Stack = (0..10)
            .rev()
            .map(var)
            .chain([lit(1), lit(2)])
            .chain((5..8).map(var))
            .collect();
        let (out, ops) = shuffle(current, &target);
        assert_eq!(out, target);
        // Loose sanity bound; the point is that it terminated.
        assert!(ops.len() < 200);
    }

    #[test]
    fn within_reach_detects_deep_swaps() {
        // 18 distinct slots, bottom two swapped: needs SWAP17+.
        let mut current: Stack = (0..18).map(var).collect();
        let mut target = current.clone();
        target.swap(0, 1);
        assert!(!shuffle_within_reach(&current, &target));
        current.truncate(4);
        let mut shallow = current.clone();
        shallow.swap(0, 1);
        assert!(shuffle_within_reach(&current, &shallow));
    }

    #[test]
    fn unreachable_slots_reports_deep_needed_slot() {
        // var(0) is buried under 17 other slots and must be duplicated.
        let mut current: Stack = vec![var(0)];
        current.extend((1..18).map(var));
        let mut target = current.clone();
        target.push(var(0));
        let unreachable = unreachable_slots(&current, &target);
        assert_eq!(unreachable, vec![var(0)]);
    }
}
