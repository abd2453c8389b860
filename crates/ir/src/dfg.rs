//! The data-flow graph: a control-flow graph of basic blocks whose operations
//! are expressed purely in terms of stack slots.
//!
//! All nodes live in entity arenas owned by [`Dfg`], so references are
//! copyable ids that stay valid across the layout and emission passes.
//! Back-edges and predecessor lists form cycles; traversals use explicit
//! visited sets.

use cranelift_entity::{entity_impl, PrimaryMap};
use primitive_types::U256;
use smallvec::SmallVec;
use smol_str::SmolStr;

use crate::ast::{Span, Symbols, VarId};
use crate::dialect::BuiltinId;

/// An opaque reference to a [`BasicBlock`].
#[derive(Clone, PartialEq, Eq, Copy, Hash, PartialOrd, Ord)]
pub struct BlockId(pub u32);
entity_impl!(BlockId, "block");

/// An opaque reference to a [`CallSite`].
#[derive(Clone, PartialEq, Eq, Copy, Hash, PartialOrd, Ord)]
pub struct CallId(pub u32);
entity_impl!(CallId, "call");

/// An opaque reference to a [`FunctionInfo`].
#[derive(Clone, PartialEq, Eq, Copy, Hash, PartialOrd, Ord)]
pub struct FuncId(pub u32);
entity_impl!(FuncId, "func");

/// A symbolic occupant of one position on the concrete stack.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum StackSlot {
    /// A concrete constant, emittable via `PUSH`.
    Literal(U256),
    /// A named user (or ghost) variable.
    Variable(VarId),
    /// The i-th return value of a specific call site.
    Temporary(CallId, u16),
    /// The return address pushed before a user-function call.
    CallReturnLabel(CallId),
    /// The return-label slot at the bottom of a function's entry stack.
    /// All instances compare equal.
    FunctionReturnLabel,
    /// A slot whose value is never read again; any cheap value may sit there.
    Junk,
}

impl StackSlot {
    /// Regenerable slots can be recreated on demand without consulting the
    /// existing stack.
    pub fn is_regenerable(self) -> bool {
        matches!(self, Self::Literal(_) | Self::CallReturnLabel(_) | Self::Junk)
    }
}

/// Ordered slot sequence; bottom at index 0, top at the back.
pub type Stack = Vec<StackSlot>;

#[derive(Debug, Clone)]
pub struct Operation {
    /// Exactly what must sit on top of the stack, in order, immediately
    /// before the operation executes.
    pub input: Stack,
    /// What replaces the consumed inputs on top immediately after.
    pub output: Stack,
    pub kind: OperationKind,
    pub span: Span,
}

#[derive(Debug, Clone)]
pub enum OperationKind {
    BuiltinCall {
        builtin: BuiltinId,
        call: CallId,
        /// Stack arguments only; literal arguments are immediates.
        args: usize,
    },
    FunctionCall {
        function: FuncId,
        call: CallId,
    },
    Assignment {
        vars: SmallVec<[VarId; 2]>,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum BlockExit {
    /// The program terminates; emitted as `STOP`.
    #[default]
    MainExit,
    /// The preceding operation terminates control flow; no fallthrough.
    Terminated,
    Jump {
        target: BlockId,
        backwards: bool,
    },
    /// The condition slot sits on top of the stack at exit and is consumed
    /// by the jump.
    ConditionalJump {
        condition: StackSlot,
        non_zero: BlockId,
        zero: BlockId,
    },
    /// Pops to the function return label and jumps through it.
    FunctionReturn { function: FuncId },
}

#[derive(Debug, Clone, Default)]
pub struct BasicBlock {
    /// Predecessors; back-edges allowed.
    pub entries: Vec<BlockId>,
    pub operations: Vec<Operation>,
    pub exit: BlockExit,
}

/// One call site. Every AST call visited by the builder allocates an entry;
/// ghost calls created by the `switch` lowering share the arena.
#[derive(Debug, Clone)]
pub struct CallSite {
    pub callee: SmolStr,
    pub returns: usize,
    /// Values of the argument positions the dialect flags as literal, in
    /// source order.
    pub literal_args: SmallVec<[U256; 2]>,
    pub span: Span,
}

#[derive(Debug, Clone)]
pub struct FunctionInfo {
    pub name: SmolStr,
    pub entry: BlockId,
    pub parameters: Vec<VarId>,
    pub return_variables: Vec<VarId>,
    pub span: Span,
}

pub struct Dfg {
    pub entry: BlockId,
    /// Variable arena taken over from the front-end; ghost variables extend it.
    pub vars: Symbols,
    pub blocks: PrimaryMap<BlockId, BasicBlock>,
    pub calls: PrimaryMap<CallId, CallSite>,
    pub functions: PrimaryMap<FuncId, FunctionInfo>,
    ghost_count: u32,
}

impl Dfg {
    pub fn new(vars: Symbols) -> Self {
        let mut blocks = PrimaryMap::default();
        let entry = blocks.push(BasicBlock::default());
        Self {
            entry,
            vars,
            blocks,
            calls: PrimaryMap::default(),
            functions: PrimaryMap::default(),
            ghost_count: 0,
        }
    }

    pub fn make_block(&mut self) -> BlockId {
        self.blocks.push(BasicBlock::default())
    }

    pub fn block(&self, block: BlockId) -> &BasicBlock {
        &self.blocks[block]
    }

    pub fn block_mut(&mut self, block: BlockId) -> &mut BasicBlock {
        &mut self.blocks[block]
    }

    pub fn make_ghost_var(&mut self) -> VarId {
        let idx = self.ghost_count;
        self.ghost_count += 1;
        self.vars.declare(&format!("GHOST[{idx}]"))
    }

    pub fn var_name(&self, var: VarId) -> &str {
        self.vars.name(var)
    }
}
