use halyard_ir::dfg::{BlockId, Dfg, StackSlot};
use halyard_ir::display::stack_to_string;
use std::fmt::Write;

/// Optional observer hooks for layout generation.
///
/// The generator may re-run subgraphs while reconciling backwards jumps;
/// observers see every pass, in order.
pub trait LayoutObserver {
    fn on_block_layout(&mut self, _dfg: &Dfg, _block: BlockId, _entry: &[StackSlot], _exit: &[StackSlot]) {
    }

    fn on_backwards_revisit(&mut self, _dfg: &Dfg, _block: BlockId, _target: BlockId) {}

    /// Slots that cannot be reached within `DUP16` before an operation
    /// (`operation` is its index) or at the block exit (`None`); the repair
    /// pass is about to rewrite earlier operation layouts.
    fn on_unreachable_slots(
        &mut self,
        _dfg: &Dfg,
        _block: BlockId,
        _operation: Option<usize>,
        _slots: &[StackSlot],
    ) {
    }

    /// Unreachable slots on an outgoing edge; nothing can be rewritten at
    /// this point, the emitter will attempt its own repair.
    fn on_unfixable_edge(&mut self, _dfg: &Dfg, _block: BlockId, _target: BlockId, _slots: &[StackSlot]) {
    }
}

pub struct NullObserver;

impl LayoutObserver for NullObserver {}

/// Collects layout decisions into a stable, human-oriented report.
#[derive(Default)]
pub struct LayoutTrace {
    out: String,
}

impl LayoutTrace {
    pub fn render(&self) -> &str {
        &self.out
    }
}

impl LayoutObserver for LayoutTrace {
    fn on_block_layout(&mut self, dfg: &Dfg, block: BlockId, entry: &[StackSlot], exit: &[StackSlot]) {
        let _ = writeln!(
            &mut self.out,
            "{block}: entry {} exit {}",
            stack_to_string(dfg, entry),
            stack_to_string(dfg, exit)
        );
    }

    fn on_backwards_revisit(&mut self, _dfg: &Dfg, block: BlockId, target: BlockId) {
        let _ = writeln!(&mut self.out, "revisit {block} (backwards jump to {target})");
    }

    fn on_unreachable_slots(
        &mut self,
        dfg: &Dfg,
        block: BlockId,
        operation: Option<usize>,
        slots: &[StackSlot],
    ) {
        let at = match operation {
            Some(idx) => format!("operation {idx}"),
            None => "exit".to_string(),
        };
        let _ = writeln!(
            &mut self.out,
            "unreachable at {block} {at}: {}",
            stack_to_string(dfg, slots)
        );
    }

    fn on_unfixable_edge(&mut self, dfg: &Dfg, block: BlockId, target: BlockId, slots: &[StackSlot]) {
        let _ = writeln!(
            &mut self.out,
            "unreachable on edge {block} -> {target}: {}",
            stack_to_string(dfg, slots)
        );
    }
}
