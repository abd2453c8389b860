pub mod asm;
pub mod ast;
pub mod builder;
pub mod dfg;
pub mod dialect;
pub mod display;

pub use asm::{AsmOp, Assembly, EvmAssembly, JumpKind, LabelId, Opcode, ResolvedCode};
pub use ast::{Span, Symbols, VarId};
pub use builder::build_dfg;
pub use dfg::{
    BasicBlock, BlockExit, BlockId, CallId, CallSite, Dfg, FuncId, FunctionInfo, Operation,
    OperationKind, Stack, StackSlot,
};
pub use dialect::{BuiltinId, BuiltinInfo, Dialect};
pub use primitive_types::U256;
