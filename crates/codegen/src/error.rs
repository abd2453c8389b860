use halyard_ir::ast::Span;
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CodegenError {
    /// A value must be addressed deeper than `SWAP16`/`DUP16` reach and the
    /// repair passes could not hoist it. Localized by the source region of
    /// the operation being emitted.
    #[error("stack too deep: {slot} is unreachable (source bytes {}..{})", span.start, span.end)]
    StackTooDeep { span: Span, slot: String },
}
