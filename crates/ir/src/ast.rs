//! The analyzed source form consumed by the backend.
//!
//! The front-end (parsing, semantic analysis, scope resolution) is not part of
//! this crate; its product is modeled directly. Identifiers carry resolved
//! [`VarId`]s allocated from a [`Symbols`] arena, so the backend never performs
//! name lookup for variables. Function calls name their callee by string; user
//! function names are unique in an analyzed program.

use cranelift_entity::{entity_impl, PrimaryMap};
use primitive_types::U256;
use smol_str::SmolStr;

/// A byte range in the original source, used to localize diagnostics.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Span {
    pub start: u32,
    pub end: u32,
}

impl Span {
    pub const DUMMY: Span = Span { start: 0, end: 0 };

    pub fn new(start: u32, end: u32) -> Self {
        Self { start, end }
    }
}

impl Default for Span {
    fn default() -> Self {
        Self::DUMMY
    }
}

/// An opaque reference to a variable in [`Symbols`].
#[derive(Clone, PartialEq, Eq, Copy, Hash, PartialOrd, Ord)]
pub struct VarId(pub u32);
entity_impl!(VarId, "var");

#[derive(Debug, Clone)]
pub struct VarData {
    pub name: SmolStr,
}

/// Arena of variables. The front-end allocates one entry per declared
/// variable; the data-flow graph takes ownership of the arena so synthetic
/// (ghost) variables extend the same id space.
#[derive(Debug, Clone, Default)]
pub struct Symbols {
    vars: PrimaryMap<VarId, VarData>,
}

impl Symbols {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn declare(&mut self, name: &str) -> VarId {
        self.vars.push(VarData { name: name.into() })
    }

    pub fn name(&self, var: VarId) -> &str {
        &self.vars[var].name
    }

    pub fn len(&self) -> usize {
        self.vars.len()
    }

    pub fn is_empty(&self) -> bool {
        self.vars.is_empty()
    }
}

#[derive(Debug, Clone)]
pub enum Expression {
    Literal(Literal),
    Identifier(Identifier),
    Call(FunctionCall),
}

impl Expression {
    pub fn literal(value: impl Into<U256>) -> Self {
        Self::Literal(Literal {
            value: value.into(),
            span: Span::DUMMY,
        })
    }

    pub fn identifier(var: VarId) -> Self {
        Self::Identifier(Identifier {
            var,
            span: Span::DUMMY,
        })
    }

    pub fn call(callee: &str, args: Vec<Expression>) -> Self {
        Self::Call(FunctionCall {
            callee: callee.into(),
            args,
            span: Span::DUMMY,
        })
    }

    pub fn span(&self) -> Span {
        match self {
            Self::Literal(lit) => lit.span,
            Self::Identifier(ident) => ident.span,
            Self::Call(call) => call.span,
        }
    }
}

#[derive(Debug, Clone)]
pub struct Literal {
    pub value: U256,
    pub span: Span,
}

#[derive(Debug, Clone)]
pub struct Identifier {
    pub var: VarId,
    pub span: Span,
}

#[derive(Debug, Clone)]
pub struct FunctionCall {
    pub callee: SmolStr,
    pub args: Vec<Expression>,
    pub span: Span,
}

#[derive(Debug, Clone)]
pub enum Statement {
    VariableDeclaration(VariableDeclaration),
    Assignment(Assignment),
    Expression(ExpressionStatement),
    If(If),
    Switch(Switch),
    For(ForLoop),
    Break(Span),
    Continue(Span),
    Leave(Span),
    FunctionDefinition(FunctionDefinition),
    Block(Block),
}

impl Statement {
    pub fn declare(vars: Vec<VarId>, value: Option<Expression>) -> Self {
        Self::VariableDeclaration(VariableDeclaration {
            vars,
            value,
            span: Span::DUMMY,
        })
    }

    pub fn assign(targets: Vec<VarId>, value: Expression) -> Self {
        Self::Assignment(Assignment {
            targets,
            value,
            span: Span::DUMMY,
        })
    }

    pub fn expression(expr: Expression) -> Self {
        Self::Expression(ExpressionStatement {
            expr,
            span: Span::DUMMY,
        })
    }

    pub fn if_stmt(condition: Expression, body: Block) -> Self {
        Self::If(If {
            condition,
            body,
            span: Span::DUMMY,
        })
    }

    pub fn switch(expr: Expression, cases: Vec<Case>) -> Self {
        Self::Switch(Switch {
            expr,
            cases,
            span: Span::DUMMY,
        })
    }

    pub fn for_loop(pre: Block, condition: Expression, post: Block, body: Block) -> Self {
        Self::For(ForLoop {
            pre,
            condition,
            post,
            body,
            span: Span::DUMMY,
        })
    }

    pub fn function(name: &str, params: Vec<VarId>, returns: Vec<VarId>, body: Block) -> Self {
        Self::FunctionDefinition(FunctionDefinition {
            name: name.into(),
            params,
            returns,
            body,
            span: Span::DUMMY,
        })
    }
}

#[derive(Debug, Clone)]
pub struct VariableDeclaration {
    pub vars: Vec<VarId>,
    /// `None` declares the variables as zero.
    pub value: Option<Expression>,
    pub span: Span,
}

#[derive(Debug, Clone)]
pub struct Assignment {
    pub targets: Vec<VarId>,
    pub value: Expression,
    pub span: Span,
}

/// A call in statement position. Must evaluate to zero values.
#[derive(Debug, Clone)]
pub struct ExpressionStatement {
    pub expr: Expression,
    pub span: Span,
}

#[derive(Debug, Clone)]
pub struct If {
    pub condition: Expression,
    pub body: Block,
    pub span: Span,
}

#[derive(Debug, Clone)]
pub struct Switch {
    pub expr: Expression,
    /// At most one default case (value `None`), which must come last.
    pub cases: Vec<Case>,
    pub span: Span,
}

#[derive(Debug, Clone)]
pub struct Case {
    pub value: Option<Literal>,
    pub body: Block,
    pub span: Span,
}

impl Case {
    pub fn new(value: impl Into<U256>, body: Block) -> Self {
        Self {
            value: Some(Literal {
                value: value.into(),
                span: Span::DUMMY,
            }),
            body,
            span: Span::DUMMY,
        }
    }

    pub fn default(body: Block) -> Self {
        Self {
            value: None,
            body,
            span: Span::DUMMY,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ForLoop {
    pub pre: Block,
    pub condition: Expression,
    pub post: Block,
    pub body: Block,
    pub span: Span,
}

#[derive(Debug, Clone)]
pub struct FunctionDefinition {
    pub name: SmolStr,
    pub params: Vec<VarId>,
    pub returns: Vec<VarId>,
    pub body: Block,
    pub span: Span,
}

#[derive(Debug, Clone, Default)]
pub struct Block {
    pub statements: Vec<Statement>,
    pub span: Span,
}

impl Block {
    pub fn new(statements: Vec<Statement>) -> Self {
        Self {
            statements,
            span: Span::DUMMY,
        }
    }
}
