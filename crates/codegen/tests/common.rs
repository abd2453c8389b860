//! Shared test plumbing: a reference stack VM that executes resolved
//! assembly, and helpers to compile programs with the EVM dialect.

use rustc_hash::FxHashMap;

use halyard_codegen::isa::evm::EvmDialect;
use halyard_codegen::{compile, CodegenError};
use halyard_ir::asm::{AsmOp, EvmAssembly, Opcode, ResolvedCode};
use halyard_ir::ast::{Block, Symbols};
use halyard_ir::U256;

pub fn compile_program(block: &Block, symbols: Symbols) -> EvmAssembly {
    try_compile_program(block, symbols).expect("compilation failed")
}

pub fn try_compile_program(
    block: &Block,
    symbols: Symbols,
) -> Result<EvmAssembly, CodegenError> {
    let dialect = EvmDialect::new();
    let mut asm = EvmAssembly::new();
    compile(block, symbols, &dialect, &mut asm, true)?;
    Ok(asm)
}

/// Run a program and return the VM state at the halt.
pub fn run_program(block: &Block, symbols: Symbols, calldata: &[U256]) -> Vm {
    let code = compile_program(block, symbols).finish();
    let mut vm = Vm::new(calldata);
    vm.run(&code);
    vm
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Halt {
    Stop,
    Return,
    Revert,
    Invalid,
    SelfDestruct,
}

/// A small reference interpreter over the resolved op stream.
///
/// Word-addressed calldata (`calldataload` offsets must be multiples of 32);
/// memory and storage are word maps. Enough surface for the backend tests,
/// nothing more.
pub struct Vm {
    pub stack: Vec<U256>,
    pub memory: FxHashMap<U256, U256>,
    pub storage: FxHashMap<U256, U256>,
    pub halt: Option<Halt>,
    calldata: Vec<U256>,
}

impl Vm {
    pub fn new(calldata: &[U256]) -> Self {
        Self {
            stack: Vec::new(),
            memory: FxHashMap::default(),
            storage: FxHashMap::default(),
            halt: None,
            calldata: calldata.to_vec(),
        }
    }

    pub fn storage_at(&self, key: u64) -> U256 {
        self.storage
            .get(&U256::from(key))
            .copied()
            .unwrap_or_else(U256::zero)
    }

    fn pop(&mut self) -> U256 {
        self.stack.pop().expect("vm stack underflow")
    }

    fn push(&mut self, value: U256) {
        self.stack.push(value);
    }

    fn binop(&mut self, f: impl FnOnce(U256, U256) -> U256) {
        let a = self.pop();
        let b = self.pop();
        self.push(f(a, b));
    }

    fn bool_to_word(v: bool) -> U256 {
        if v {
            U256::one()
        } else {
            U256::zero()
        }
    }

    pub fn run(&mut self, code: &ResolvedCode) {
        let ops = code.ops();
        let mut pc = 0usize;
        let mut steps = 0usize;

        while pc < ops.len() {
            steps += 1;
            assert!(steps < 100_000, "vm step limit exceeded (diverging code?)");

            match ops[pc] {
                AsmOp::Label(_) => {}
                AsmOp::Constant(value) => self.push(value),
                AsmOp::LabelReference(label) => {
                    self.push(U256::from(code.label_position(label) as u64))
                }
                AsmOp::JumpTo { label, .. } => {
                    pc = code.label_position(label);
                    continue;
                }
                AsmOp::JumpToIf { label } => {
                    let condition = self.pop();
                    if !condition.is_zero() {
                        pc = code.label_position(label);
                        continue;
                    }
                }
                AsmOp::Jump { .. } => {
                    let target = self.pop();
                    pc = target.as_usize();
                    continue;
                }
                AsmOp::Instruction(op) => {
                    if let Some(halt) = self.step(op, pc) {
                        self.halt = Some(halt);
                        return;
                    }
                }
            }
            pc += 1;
        }
        // Falling off the end means the transform forgot a terminator.
        panic!("vm ran past the end of the code");
    }

    fn step(&mut self, op: Opcode, pc: usize) -> Option<Halt> {
        match op {
            Opcode::Stop => return Some(Halt::Stop),
            Opcode::Add => self.binop(|a, b| a.overflowing_add(b).0),
            Opcode::Mul => self.binop(|a, b| a.overflowing_mul(b).0),
            Opcode::Sub => self.binop(|a, b| a.overflowing_sub(b).0),
            Opcode::Div => self.binop(|a, b| {
                if b.is_zero() {
                    U256::zero()
                } else {
                    a / b
                }
            }),
            Opcode::Mod => self.binop(|a, b| {
                if b.is_zero() {
                    U256::zero()
                } else {
                    a % b
                }
            }),
            Opcode::AddMod => {
                let a = self.pop();
                let b = self.pop();
                let n = self.pop();
                self.push(if n.is_zero() {
                    U256::zero()
                } else {
                    ((a % n) + (b % n)) % n
                });
            }
            Opcode::MulMod => {
                let a = self.pop();
                let b = self.pop();
                let n = self.pop();
                self.push(if n.is_zero() {
                    U256::zero()
                } else {
                    a.overflowing_mul(b).0 % n
                });
            }
            Opcode::Lt => self.binop(|a, b| Self::bool_to_word(a < b)),
            Opcode::Gt => self.binop(|a, b| Self::bool_to_word(a > b)),
            Opcode::Eq => self.binop(|a, b| Self::bool_to_word(a == b)),
            Opcode::IsZero => {
                let a = self.pop();
                self.push(Self::bool_to_word(a.is_zero()));
            }
            Opcode::And => self.binop(|a, b| a & b),
            Opcode::Or => self.binop(|a, b| a | b),
            Opcode::Xor => self.binop(|a, b| a ^ b),
            Opcode::Not => {
                let a = self.pop();
                self.push(!a);
            }
            Opcode::Shl => self.binop(|shift, value| {
                if shift >= U256::from(256u64) {
                    U256::zero()
                } else {
                    value << shift.as_usize()
                }
            }),
            Opcode::Shr => self.binop(|shift, value| {
                if shift >= U256::from(256u64) {
                    U256::zero()
                } else {
                    value >> shift.as_usize()
                }
            }),
            Opcode::Byte => self.binop(|i, x| {
                if i >= U256::from(32u64) {
                    U256::zero()
                } else {
                    (x >> (8 * (31 - i.as_usize()))) & U256::from(0xffu64)
                }
            }),
            Opcode::CallDataLoad => {
                let offset = self.pop();
                let word = offset.as_usize() / 32;
                debug_assert_eq!(offset.as_usize() % 32, 0, "unaligned calldataload");
                self.push(
                    self.calldata
                        .get(word)
                        .copied()
                        .unwrap_or_else(U256::zero),
                );
            }
            Opcode::CallDataSize => self.push(U256::from((self.calldata.len() * 32) as u64)),
            Opcode::Address => self.push(U256::from(0xaau64)),
            Opcode::Origin => self.push(U256::from(0x01u64)),
            Opcode::Caller => self.push(U256::from(0xcau64)),
            Opcode::CallValue => self.push(U256::zero()),
            Opcode::Gas => self.push(U256::from(u64::MAX)),
            Opcode::Pc => self.push(U256::from(pc as u64)),
            Opcode::Pop => {
                self.pop();
            }
            Opcode::MLoad => {
                let addr = self.pop();
                let value = self.memory.get(&addr).copied().unwrap_or_else(U256::zero);
                self.push(value);
            }
            Opcode::MStore => {
                let addr = self.pop();
                let value = self.pop();
                self.memory.insert(addr, value);
            }
            Opcode::SLoad => {
                let key = self.pop();
                let value = self.storage.get(&key).copied().unwrap_or_else(U256::zero);
                self.push(value);
            }
            Opcode::SStore => {
                let key = self.pop();
                let value = self.pop();
                self.storage.insert(key, value);
            }
            Opcode::Log0 | Opcode::Log1 | Opcode::Log2 | Opcode::Log3 | Opcode::Log4 => {
                let topics = match op {
                    Opcode::Log0 => 0,
                    Opcode::Log1 => 1,
                    Opcode::Log2 => 2,
                    Opcode::Log3 => 3,
                    _ => 4,
                };
                for _ in 0..(2 + topics) {
                    self.pop();
                }
            }
            Opcode::Return => {
                self.pop();
                self.pop();
                return Some(Halt::Return);
            }
            Opcode::Revert => {
                self.pop();
                self.pop();
                return Some(Halt::Revert);
            }
            Opcode::SelfDestruct => {
                self.pop();
                return Some(Halt::SelfDestruct);
            }
            Opcode::Invalid => return Some(Halt::Invalid),
            Opcode::Swap(depth) => {
                let len = self.stack.len();
                assert!(len > depth as usize, "SWAP{depth} beyond stack");
                self.stack.swap(len - 1, len - 1 - depth as usize);
            }
            Opcode::Dup(depth) => {
                let len = self.stack.len();
                assert!(len >= depth as usize, "DUP{depth} beyond stack");
                let value = self.stack[len - depth as usize];
                self.push(value);
            }
            Opcode::MStore8 | Opcode::Keccak256 => {
                panic!("{op} is not supported by the test vm")
            }
        }
        None
    }
}

/// Count instruction occurrences matching a predicate.
pub fn count_ops(ops: &[AsmOp], pred: impl Fn(&AsmOp) -> bool) -> usize {
    ops.iter().filter(|op| pred(op)).count()
}

/// Assert no `SWAP`/`DUP` ever addresses beyond the machine's reach.
pub fn assert_reach_limit(ops: &[AsmOp]) {
    for op in ops {
        if let AsmOp::Instruction(Opcode::Swap(n) | Opcode::Dup(n)) = op {
            assert!(*n <= 16, "emitted {op:?} beyond reach");
        }
    }
}
