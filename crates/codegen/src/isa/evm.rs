//! The EVM dialect: the builtin surface the backend is exercised with.
//!
//! Most builtins lower to a single opcode. `memoryguard` takes a literal
//! argument and lowers to a `PUSH` of that value, exercising the
//! immediate-argument path end to end.

use cranelift_entity::PrimaryMap;
use rustc_hash::FxHashMap;
use smallvec::{smallvec, SmallVec};
use smol_str::SmolStr;

use halyard_ir::asm::{Assembly, Opcode};
use halyard_ir::dialect::{BuiltinId, BuiltinInfo, Dialect};
use halyard_ir::U256;

#[derive(Clone, Copy)]
enum Lowering {
    Opcode(Opcode),
    /// `PUSH` the literal argument.
    MemoryGuard,
}

struct EvmBuiltin {
    info: BuiltinInfo,
    lowering: Lowering,
}

pub struct EvmDialect {
    builtins: PrimaryMap<BuiltinId, EvmBuiltin>,
    by_name: FxHashMap<SmolStr, BuiltinId>,
    eq: BuiltinId,
}

impl EvmDialect {
    pub fn new() -> Self {
        let mut dialect = EvmDialect {
            builtins: PrimaryMap::default(),
            by_name: FxHashMap::default(),
            eq: BuiltinId(0),
        };

        dialect.add("add", 2, 1, false, Opcode::Add);
        dialect.add("sub", 2, 1, false, Opcode::Sub);
        dialect.add("mul", 2, 1, false, Opcode::Mul);
        dialect.add("div", 2, 1, false, Opcode::Div);
        dialect.add("mod", 2, 1, false, Opcode::Mod);
        dialect.add("addmod", 3, 1, false, Opcode::AddMod);
        dialect.add("mulmod", 3, 1, false, Opcode::MulMod);
        dialect.eq = dialect.add("eq", 2, 1, false, Opcode::Eq);
        dialect.add("lt", 2, 1, false, Opcode::Lt);
        dialect.add("gt", 2, 1, false, Opcode::Gt);
        dialect.add("iszero", 1, 1, false, Opcode::IsZero);
        dialect.add("and", 2, 1, false, Opcode::And);
        dialect.add("or", 2, 1, false, Opcode::Or);
        dialect.add("xor", 2, 1, false, Opcode::Xor);
        dialect.add("not", 1, 1, false, Opcode::Not);
        dialect.add("byte", 2, 1, false, Opcode::Byte);
        dialect.add("shl", 2, 1, false, Opcode::Shl);
        dialect.add("shr", 2, 1, false, Opcode::Shr);
        dialect.add("keccak256", 2, 1, false, Opcode::Keccak256);
        dialect.add("address", 0, 1, false, Opcode::Address);
        dialect.add("origin", 0, 1, false, Opcode::Origin);
        dialect.add("caller", 0, 1, false, Opcode::Caller);
        dialect.add("callvalue", 0, 1, false, Opcode::CallValue);
        dialect.add("calldataload", 1, 1, false, Opcode::CallDataLoad);
        dialect.add("calldatasize", 0, 1, false, Opcode::CallDataSize);
        dialect.add("gas", 0, 1, false, Opcode::Gas);
        dialect.add("pop", 1, 0, false, Opcode::Pop);
        dialect.add("mload", 1, 1, false, Opcode::MLoad);
        dialect.add("mstore", 2, 0, false, Opcode::MStore);
        dialect.add("mstore8", 2, 0, false, Opcode::MStore8);
        dialect.add("sload", 1, 1, false, Opcode::SLoad);
        dialect.add("sstore", 2, 0, false, Opcode::SStore);
        dialect.add("log0", 2, 0, false, Opcode::Log0);
        dialect.add("log1", 3, 0, false, Opcode::Log1);
        dialect.add("log2", 4, 0, false, Opcode::Log2);
        dialect.add("log3", 5, 0, false, Opcode::Log3);
        dialect.add("log4", 6, 0, false, Opcode::Log4);
        dialect.add("stop", 0, 0, true, Opcode::Stop);
        dialect.add("return", 2, 0, true, Opcode::Return);
        dialect.add("revert", 2, 0, true, Opcode::Revert);
        dialect.add("selfdestruct", 1, 0, true, Opcode::SelfDestruct);
        dialect.add("invalid", 0, 0, true, Opcode::Invalid);

        let memoryguard = EvmBuiltin {
            info: BuiltinInfo {
                name: "memoryguard".into(),
                args: 1,
                returns: 1,
                literal_args: smallvec![true],
                terminates: false,
            },
            lowering: Lowering::MemoryGuard,
        };
        let id = dialect.builtins.push(memoryguard);
        dialect.by_name.insert("memoryguard".into(), id);

        dialect
    }

    fn add(
        &mut self,
        name: &str,
        args: usize,
        returns: usize,
        terminates: bool,
        opcode: Opcode,
    ) -> BuiltinId {
        let builtin = EvmBuiltin {
            info: BuiltinInfo {
                name: name.into(),
                args,
                returns,
                literal_args: SmallVec::new(),
                terminates,
            },
            lowering: Lowering::Opcode(opcode),
        };
        let id = self.builtins.push(builtin);
        self.by_name.insert(name.into(), id);
        id
    }
}

impl Default for EvmDialect {
    fn default() -> Self {
        Self::new()
    }
}

impl Dialect for EvmDialect {
    fn builtin(&self, name: &str) -> Option<BuiltinId> {
        self.by_name.get(name).copied()
    }

    fn builtin_info(&self, builtin: BuiltinId) -> &BuiltinInfo {
        &self.builtins[builtin].info
    }

    fn equality_builtin(&self) -> BuiltinId {
        self.eq
    }

    fn emit_builtin(&self, builtin: BuiltinId, literal_args: &[U256], asm: &mut dyn Assembly) {
        match self.builtins[builtin].lowering {
            Lowering::Opcode(opcode) => asm.append_instruction(opcode),
            Lowering::MemoryGuard => {
                debug_assert_eq!(literal_args.len(), 1);
                asm.append_constant(literal_args[0]);
            }
        }
    }
}
