//! The dialect describes the builtin functions of the source language: their
//! arity, their control-flow side effects, and how they lower to native
//! instructions. The backend itself is dialect-agnostic.

use cranelift_entity::entity_impl;
use primitive_types::U256;
use smallvec::SmallVec;
use smol_str::SmolStr;

use crate::asm::Assembly;

/// An opaque reference to a builtin function of a [`Dialect`].
#[derive(Clone, PartialEq, Eq, Copy, Hash, PartialOrd, Ord)]
pub struct BuiltinId(pub u32);
entity_impl!(BuiltinId, "builtin");

#[derive(Debug, Clone)]
pub struct BuiltinInfo {
    pub name: SmolStr,
    /// Total arity, literal arguments included.
    pub args: usize,
    pub returns: usize,
    /// Positions flagged `true` are passed as immediates, not via the stack.
    /// An empty mask means all arguments are stack arguments.
    pub literal_args: SmallVec<[bool; 4]>,
    /// The builtin terminates control flow (`stop`, `return`, `revert`, ...).
    pub terminates: bool,
}

impl BuiltinInfo {
    pub fn is_literal_argument(&self, idx: usize) -> bool {
        self.literal_args.get(idx).copied().unwrap_or(false)
    }

    /// Number of arguments consumed from the stack.
    pub fn stack_args(&self) -> usize {
        self.args - self.literal_args.iter().filter(|lit| **lit).count()
    }
}

pub trait Dialect {
    fn builtin(&self, name: &str) -> Option<BuiltinId>;

    fn builtin_info(&self, builtin: BuiltinId) -> &BuiltinInfo;

    /// The `eq` builtin used to lower `switch` cases into conditional jumps.
    fn equality_builtin(&self) -> BuiltinId;

    /// Emit the builtin's native instructions. Stack arguments are already in
    /// place on top of the stack; `literal_args` carries the values of the
    /// argument positions flagged as literal, in source order.
    fn emit_builtin(&self, builtin: BuiltinId, literal_args: &[U256], asm: &mut dyn Assembly);
}
