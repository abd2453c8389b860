//! Deterministic textual form of the data-flow graph, for tests and traces.

use std::fmt;

use crate::dfg::{BlockExit, BlockId, Dfg, OperationKind, StackSlot};

pub fn slot_to_string(dfg: &Dfg, slot: StackSlot) -> String {
    match slot {
        StackSlot::Literal(value) => format!("{value:#x}"),
        StackSlot::Variable(var) => dfg.var_name(var).to_string(),
        StackSlot::Temporary(call, idx) => {
            format!("TMP[{}, {idx}]", dfg.calls[call].callee)
        }
        StackSlot::CallReturnLabel(call) => format!("RET[{}]", dfg.calls[call].callee),
        StackSlot::FunctionReturnLabel => "RET".to_string(),
        StackSlot::Junk => "JUNK".to_string(),
    }
}

pub fn stack_to_string(dfg: &Dfg, stack: &[StackSlot]) -> String {
    let mut result = String::from("[ ");
    for slot in stack {
        result.push_str(&slot_to_string(dfg, *slot));
        result.push(' ');
    }
    result.push(']');
    result
}

pub struct DisplayDfg<'a> {
    dfg: &'a Dfg,
}

impl Dfg {
    pub fn display(&self) -> DisplayDfg<'_> {
        DisplayDfg { dfg: self }
    }
}

impl fmt::Display for DisplayDfg<'_> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let dfg = self.dfg;
        writeln!(f, "dfg entry {}", dfg.entry)?;
        for (_, info) in dfg.functions.iter() {
            let params: Vec<&str> = info.parameters.iter().map(|v| dfg.var_name(*v)).collect();
            let returns: Vec<&str> = info
                .return_variables
                .iter()
                .map(|v| dfg.var_name(*v))
                .collect();
            writeln!(
                f,
                "func {}({}) -> ({}) entry {}",
                info.name,
                params.join(" "),
                returns.join(" "),
                info.entry
            )?;
        }
        for block_id in dfg.blocks.keys() {
            write_block(f, dfg, block_id)?;
        }
        Ok(())
    }
}

fn write_block(f: &mut fmt::Formatter, dfg: &Dfg, block_id: BlockId) -> fmt::Result {
    let block = dfg.block(block_id);
    writeln!(f, "{block_id}:")?;
    for op in &block.operations {
        let kind = match &op.kind {
            OperationKind::BuiltinCall { call, .. } => {
                format!("builtin {}", dfg.calls[*call].callee)
            }
            OperationKind::FunctionCall { call, .. } => {
                format!("call {}", dfg.calls[*call].callee)
            }
            OperationKind::Assignment { vars } => {
                let names: Vec<&str> = vars.iter().map(|v| dfg.var_name(*v)).collect();
                format!("assign {}", names.join(" "))
            }
        };
        writeln!(
            f,
            "  {} => {} {kind}",
            stack_to_string(dfg, &op.input),
            stack_to_string(dfg, &op.output),
        )?;
    }
    match block.exit {
        BlockExit::MainExit => writeln!(f, "  main exit"),
        BlockExit::Terminated => writeln!(f, "  terminated"),
        BlockExit::Jump { target, backwards } => {
            if backwards {
                writeln!(f, "  jump {target} (backwards)")
            } else {
                writeln!(f, "  jump {target}")
            }
        }
        BlockExit::ConditionalJump {
            condition,
            non_zero,
            zero,
        } => writeln!(
            f,
            "  jumpi {} ? {non_zero} : {zero}",
            slot_to_string(dfg, condition)
        ),
        BlockExit::FunctionReturn { function } => {
            writeln!(f, "  return from {}", dfg.functions[function].name)
        }
    }
}
