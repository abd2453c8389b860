//! The assembly sink: the downstream interface the code transform emits into,
//! plus a concrete recording implementation with label resolution.

use cranelift_entity::{entity_impl, PrimaryMap};
use primitive_types::U256;
use rustc_hash::FxHashMap;
use smol_str::SmolStr;
use std::fmt;

use crate::ast::Span;

/// An opaque reference to an assembly label.
#[derive(Clone, PartialEq, Eq, Copy, Hash, PartialOrd, Ord)]
pub struct LabelId(pub u32);
entity_impl!(LabelId, "label");

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JumpKind {
    Ordinary,
    IntoFunction,
    OutOfFunction,
}

/// The native instruction subset the backend and its dialects emit.
///
/// `PUSH` is not listed here; constants and label references go through
/// [`Assembly::append_constant`] and [`Assembly::append_label_reference`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Opcode {
    Stop,
    Add,
    Mul,
    Sub,
    Div,
    Mod,
    AddMod,
    MulMod,
    Lt,
    Gt,
    Eq,
    IsZero,
    And,
    Or,
    Xor,
    Not,
    Byte,
    Shl,
    Shr,
    Keccak256,
    Address,
    Origin,
    Caller,
    CallValue,
    CallDataLoad,
    CallDataSize,
    Gas,
    Pc,
    Pop,
    MLoad,
    MStore,
    MStore8,
    SLoad,
    SStore,
    Log0,
    Log1,
    Log2,
    Log3,
    Log4,
    Return,
    Revert,
    SelfDestruct,
    Invalid,
    Swap(u8),
    Dup(u8),
}

impl Opcode {
    /// `SWAP<depth>`: exchanges the top with the element `depth` below it.
    pub fn swap_n(depth: usize) -> Self {
        assert!((1..=16).contains(&depth), "SWAP{depth} out of range");
        Self::Swap(depth as u8)
    }

    /// `DUP<depth>`: copies the element at `depth` (1 = top) to the top.
    pub fn dup_n(depth: usize) -> Self {
        assert!((1..=16).contains(&depth), "DUP{depth} out of range");
        Self::Dup(depth as u8)
    }

    /// Net stack height change.
    pub fn stack_delta(self) -> i32 {
        match self {
            Self::Stop
            | Self::IsZero
            | Self::Not
            | Self::CallDataLoad
            | Self::MLoad
            | Self::SLoad
            | Self::Invalid
            | Self::Swap(_) => 0,
            Self::Add
            | Self::Mul
            | Self::Sub
            | Self::Div
            | Self::Mod
            | Self::Lt
            | Self::Gt
            | Self::Eq
            | Self::And
            | Self::Or
            | Self::Xor
            | Self::Byte
            | Self::Shl
            | Self::Shr
            | Self::Keccak256
            | Self::Pop
            | Self::SelfDestruct => -1,
            Self::AddMod
            | Self::MulMod
            | Self::MStore
            | Self::MStore8
            | Self::SStore
            | Self::Log0
            | Self::Return
            | Self::Revert => -2,
            Self::Log1 => -3,
            Self::Log2 => -4,
            Self::Log3 => -5,
            Self::Log4 => -6,
            Self::Address
            | Self::Origin
            | Self::Caller
            | Self::CallValue
            | Self::CallDataSize
            | Self::Gas
            | Self::Pc
            | Self::Dup(_) => 1,
        }
    }
}

impl fmt::Display for Opcode {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Self::Swap(n) => write!(f, "SWAP{n}"),
            Self::Dup(n) => write!(f, "DUP{n}"),
            other => write!(f, "{}", format!("{other:?}").to_uppercase()),
        }
    }
}

/// The command set the code transform drives. Implementations receive a linear
/// stream of instructions, labels and jumps; stack heights are reported so the
/// sink can annotate or verify the stream.
pub trait Assembly {
    fn new_label(&mut self) -> LabelId;

    fn named_label(&mut self, name: &str, params: usize, returns: usize) -> LabelId;

    fn append_label(&mut self, label: LabelId);

    fn append_constant(&mut self, value: U256);

    fn append_instruction(&mut self, op: Opcode);

    fn append_jump_to(&mut self, label: LabelId, stack_delta: i32, kind: JumpKind);

    /// Conditional jump; consumes the condition on top of the stack.
    fn append_jump_to_if(&mut self, label: LabelId);

    /// Indirect jump; consumes the target on top of the stack.
    fn append_jump(&mut self, stack_delta: i32, kind: JumpKind);

    /// Push the label's eventual code offset as a constant.
    fn append_label_reference(&mut self, label: LabelId);

    fn stack_height(&self) -> i32;

    fn set_stack_height(&mut self, height: i32);

    fn set_source_location(&mut self, span: Span);
}

/// One recorded assembly command.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AsmOp {
    Label(LabelId),
    Constant(U256),
    Instruction(Opcode),
    JumpTo { label: LabelId, kind: JumpKind },
    JumpToIf { label: LabelId },
    Jump { kind: JumpKind },
    LabelReference(LabelId),
}

#[derive(Debug, Clone, Default)]
struct LabelData {
    name: Option<SmolStr>,
}

/// A recording [`Assembly`] implementation.
///
/// Commands are stored as an [`AsmOp`] stream; [`EvmAssembly::finish`]
/// resolves labels to positions in that stream so the result can be executed
/// or inspected. Bytecode serialization and linking are out of scope.
#[derive(Debug, Default)]
pub struct EvmAssembly {
    ops: Vec<AsmOp>,
    labels: PrimaryMap<LabelId, LabelData>,
    stack_height: i32,
    source_location: Span,
}

impl EvmAssembly {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn ops(&self) -> &[AsmOp] {
        &self.ops
    }

    pub fn label_name(&self, label: LabelId) -> Option<&str> {
        self.labels[label].name.as_deref()
    }

    pub fn source_location(&self) -> Span {
        self.source_location
    }

    /// Resolve label positions. Panics if a referenced label was never placed.
    pub fn finish(self) -> ResolvedCode {
        let mut label_pos = FxHashMap::default();
        for (pos, op) in self.ops.iter().enumerate() {
            if let AsmOp::Label(label) = op {
                let prev = label_pos.insert(*label, pos);
                debug_assert!(prev.is_none(), "label placed twice");
            }
        }
        for op in &self.ops {
            let referenced = match op {
                AsmOp::JumpTo { label, .. }
                | AsmOp::JumpToIf { label }
                | AsmOp::LabelReference(label) => Some(*label),
                _ => None,
            };
            if let Some(label) = referenced {
                assert!(
                    label_pos.contains_key(&label),
                    "dangling reference to {label}"
                );
            }
        }
        ResolvedCode {
            ops: self.ops,
            label_pos,
        }
    }
}

impl Assembly for EvmAssembly {
    fn new_label(&mut self) -> LabelId {
        self.labels.push(LabelData::default())
    }

    fn named_label(&mut self, name: &str, _params: usize, _returns: usize) -> LabelId {
        self.labels.push(LabelData {
            name: Some(name.into()),
        })
    }

    fn append_label(&mut self, label: LabelId) {
        self.ops.push(AsmOp::Label(label));
    }

    fn append_constant(&mut self, value: U256) {
        self.ops.push(AsmOp::Constant(value));
        self.stack_height += 1;
    }

    fn append_instruction(&mut self, op: Opcode) {
        self.stack_height += op.stack_delta();
        self.ops.push(AsmOp::Instruction(op));
    }

    fn append_jump_to(&mut self, label: LabelId, stack_delta: i32, kind: JumpKind) {
        self.ops.push(AsmOp::JumpTo { label, kind });
        self.stack_height += stack_delta;
    }

    fn append_jump_to_if(&mut self, label: LabelId) {
        self.ops.push(AsmOp::JumpToIf { label });
        self.stack_height -= 1;
    }

    fn append_jump(&mut self, stack_delta: i32, kind: JumpKind) {
        self.ops.push(AsmOp::Jump { kind });
        self.stack_height += stack_delta - 1;
    }

    fn append_label_reference(&mut self, label: LabelId) {
        self.ops.push(AsmOp::LabelReference(label));
        self.stack_height += 1;
    }

    fn stack_height(&self) -> i32 {
        self.stack_height
    }

    fn set_stack_height(&mut self, height: i32) {
        self.stack_height = height;
    }

    fn set_source_location(&mut self, span: Span) {
        self.source_location = span;
    }
}

/// The finished command stream with label references resolved to positions.
#[derive(Debug, Clone)]
pub struct ResolvedCode {
    ops: Vec<AsmOp>,
    label_pos: FxHashMap<LabelId, usize>,
}

impl ResolvedCode {
    pub fn ops(&self) -> &[AsmOp] {
        &self.ops
    }

    pub fn label_position(&self, label: LabelId) -> usize {
        self.label_pos[&label]
    }
}
