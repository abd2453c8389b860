pub mod emit;
pub mod error;
pub mod isa;
pub mod layout;
pub mod shuffle;

pub use emit::CodeGenerator;
pub use error::CodegenError;
pub use layout::StackLayout;

use halyard_ir::asm::Assembly;
use halyard_ir::ast::{Block, Symbols};
use halyard_ir::builder::build_dfg;
use halyard_ir::dialect::Dialect;

/// Run the full pipeline: build the data-flow graph, compute the stack
/// layout, and emit code into `assembly`.
pub fn compile<D: Dialect>(
    block: &Block,
    symbols: Symbols,
    dialect: &D,
    assembly: &mut dyn Assembly,
    use_named_labels: bool,
) -> Result<(), CodegenError> {
    let dfg = build_dfg(block, symbols, dialect);
    let layout = StackLayout::run(&dfg);
    CodeGenerator::run(assembly, dialect, &dfg, &layout, use_named_labels)
}
