//! Abstract syntax tree of the kernel language.
//!
//! Names borrow from the compile session arena. Every expression carries an
//! [`ExprId`] so the checker can attach types in a side table.

use crate::core::Span;
use std::fmt;

/// Source-level types.
///
/// `Never` and `Error` are never written by users: the checker uses them for
/// diverging expressions and to suppress cascading reports.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Type {
    I32,
    I64,
    F64,
    Bool,
    Unit,
    Never,
    Error,
}

impl Type {
    pub fn is_integer(self) -> bool {
        matches!(self, Type::I32 | Type::I64)
    }

    pub fn is_numeric(self) -> bool {
        matches!(self, Type::I32 | Type::I64 | Type::F64)
    }
}

impl fmt::Display for Type {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Type::I32 => "i32",
            Type::I64 => "i64",
            Type::F64 => "f64",
            Type::Bool => "bool",
            Type::Unit => "()",
            Type::Never => "!",
            Type::Error => "{error}",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ExprId(pub u32);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Ident<'a> {
    pub name: &'a str,
    pub span: Span,
}

#[derive(Debug, Clone)]
pub struct Module<'a> {
    pub name: &'a str,
    pub items: Vec<Item<'a>>,
}

#[derive(Debug, Clone)]
pub enum Item<'a> {
    Fn(FnDecl<'a>),
    Extern(FnSig<'a>),
}

impl<'a> Item<'a> {
    pub fn sig(&self) -> &FnSig<'a> {
        match self {
            Item::Fn(decl) => &decl.sig,
            Item::Extern(sig) => sig,
        }
    }
}

#[derive(Debug, Clone)]
pub struct Param<'a> {
    pub name: Ident<'a>,
    pub ty: Type,
    pub span: Span,
}

#[derive(Debug, Clone)]
pub struct FnSig<'a> {
    pub name: Ident<'a>,
    pub params: Vec<Param<'a>>,
    pub ret: Type,
    pub span: Span,
}

#[derive(Debug, Clone)]
pub struct FnDecl<'a> {
    pub public: bool,
    pub sig: FnSig<'a>,
    pub body: Block<'a>,
}

#[derive(Debug, Clone)]
pub struct Block<'a> {
    pub stmts: Vec<Stmt<'a>>,
    pub tail: Option<Box<Expr<'a>>>,
    pub span: Span,
}

#[derive(Debug, Clone)]
pub struct Stmt<'a> {
    pub kind: StmtKind<'a>,
    pub span: Span,
}

#[derive(Debug, Clone)]
pub enum StmtKind<'a> {
    Let {
        name: Ident<'a>,
        mutable: bool,
        ty: Option<Type>,
        init: Expr<'a>,
    },
    /// `x = e` or a compound `x op= e`.
    Assign {
        target: Ident<'a>,
        op: Option<BinOp>,
        value: Expr<'a>,
    },
    While {
        cond: Expr<'a>,
        body: Block<'a>,
    },
    Return(Option<Expr<'a>>),
    Expr(Expr<'a>),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnOp {
    Neg,
    Not,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinOp {
    Add,
    Sub,
    Mul,
    Div,
    Rem,
    BitAnd,
    BitOr,
    BitXor,
    Shl,
    Shr,
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
    And,
    Or,
}

impl BinOp {
    pub fn is_comparison(self) -> bool {
        matches!(
            self,
            BinOp::Eq | BinOp::Ne | BinOp::Lt | BinOp::Le | BinOp::Gt | BinOp::Ge
        )
    }

    pub fn is_logical(self) -> bool {
        matches!(self, BinOp::And | BinOp::Or)
    }

    pub fn symbol(self) -> &'static str {
        match self {
            BinOp::Add => "+",
            BinOp::Sub => "-",
            BinOp::Mul => "*",
            BinOp::Div => "/",
            BinOp::Rem => "%",
            BinOp::BitAnd => "&",
            BinOp::BitOr => "|",
            BinOp::BitXor => "^",
            BinOp::Shl => "<<",
            BinOp::Shr => ">>",
            BinOp::Eq => "==",
            BinOp::Ne => "!=",
            BinOp::Lt => "<",
            BinOp::Le => "<=",
            BinOp::Gt => ">",
            BinOp::Ge => ">=",
            BinOp::And => "&&",
            BinOp::Or => "||",
        }
    }
}

#[derive(Debug, Clone)]
pub struct Expr<'a> {
    pub id: ExprId,
    pub kind: ExprKind<'a>,
    pub span: Span,
}

#[derive(Debug, Clone)]
pub enum ExprKind<'a> {
    Int {
        value: u64,
        suffix: Option<Type>,
    },
    Float(f64),
    Bool(bool),
    Var(Ident<'a>),
    Call {
        callee: Ident<'a>,
        args: Vec<Expr<'a>>,
    },
    Unary {
        op: UnOp,
        operand: Box<Expr<'a>>,
    },
    Binary {
        op: BinOp,
        lhs: Box<Expr<'a>>,
        rhs: Box<Expr<'a>>,
    },
    Cast {
        expr: Box<Expr<'a>>,
        ty: Type,
    },
    If {
        cond: Box<Expr<'a>>,
        then_block: Block<'a>,
        /// Either a block expression or a nested `if`.
        else_branch: Option<Box<Expr<'a>>>,
    },
    Block(Block<'a>),
}

impl<'a> ExprKind<'a> {
    /// Expressions that end in a block and may stand as statements without `;`.
    pub fn is_block_like(&self) -> bool {
        matches!(self, ExprKind::If { .. } | ExprKind::Block(_))
    }
}
