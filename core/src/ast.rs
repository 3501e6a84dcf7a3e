//! The lowered, storable representation of a compiled contract.
//!
//! `rustpython_parser`'s own AST borrows source spans and isn't
//! `Serialize`, so the rewriter (see `sanitizer::rewrite`) lowers it into
//! this crate-private tree before it is handed to `bincode` and stored as
//! `__compiled__`. Every variant here corresponds 1:1 to a node kind on
//! spec.md §4.5's allow-list; nothing outside that list can be constructed.

use serde_derive::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompiledModule {
    pub name: String,
    pub functions: Vec<CompiledFunction>,
    /// Mangled name of the at-most-one constructor, renamed by rewrite
    /// rule 2 so it can only ever be invoked by the install path.
    pub constructor: Option<String>,
    /// Top-level `name = Variable(...)`/`Hash(...)`/... declarations, in
    /// source order, already carrying the `contract=`/`name=` keywords
    /// rewrite rule 3 injects. Evaluated once when the module loads to
    /// bind each name to its `OrmObject` handle.
    pub globals: Vec<(String, Expr)>,
    /// Names from top-level `import <name>` statements, bound into every
    /// function's scope as a callable module reference.
    pub imports: Vec<String>,
}

impl CompiledModule {
    pub fn function(&self, name: &str) -> Option<&CompiledFunction> {
        self.functions.iter().find(|f| f.name == name)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompiledFunction {
    pub name: String,
    pub params: Vec<Param>,
    pub body: Vec<Stmt>,
    /// True if the *original* source carried the export decorator. Kept
    /// even though the decorator node itself is stripped by rewrite.
    pub exported: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Param {
    pub name: String,
    pub default: Option<Expr>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Stmt {
    Assign { targets: Vec<Expr>, value: Expr },
    AugAssign { target: Expr, op: BinOp, value: Expr },
    Return(Option<Expr>),
    Pass,
    Assert { test: Expr, msg: Option<Expr> },
    If { test: Expr, body: Vec<Stmt>, orelse: Vec<Stmt> },
    For { target: Expr, iter: Expr, body: Vec<Stmt>, orelse: Vec<Stmt> },
    While { test: Expr, body: Vec<Stmt>, orelse: Vec<Stmt> },
    Expr(Expr),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Expr {
    Constant(Literal),
    Name(String),
    Attribute { value: Box<Expr>, attr: String },
    Subscript { value: Box<Expr>, index: Box<Expr> },
    Slice { lower: Option<Box<Expr>>, upper: Option<Box<Expr>>, step: Option<Box<Expr>> },
    List(Vec<Expr>),
    Tuple(Vec<Expr>),
    SetLit(Vec<Expr>),
    Dict(Vec<(Expr, Expr)>),
    /// Single-clause comprehension: spec.md's allow-list names
    /// "list-comprehension + comprehension" without nested-for support.
    ListComp { element: Box<Expr>, target: Box<Expr>, iter: Box<Expr>, ifs: Vec<Expr> },
    BoolOp { op: BoolOp, values: Vec<Expr> },
    BinOp { left: Box<Expr>, op: BinOp, right: Box<Expr> },
    UnaryOp { op: UnaryOp, operand: Box<Expr> },
    Compare { left: Box<Expr>, ops: Vec<CmpOp>, comparators: Vec<Expr> },
    Call { func: Box<Expr>, args: Vec<Expr>, keywords: Vec<(Option<String>, Expr)> },
    Starred(Box<Expr>),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BinOp {
    Add,
    Sub,
    Mul,
    Div,
    Mod,
    Pow,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BoolOp {
    And,
    Or,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum UnaryOp {
    Not,
    Neg,
    Pos,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CmpOp {
    Eq,
    NotEq,
    Lt,
    LtE,
    Gt,
    GtE,
    In,
    NotIn,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Literal {
    Null,
    Bool(bool),
    Int(i128),
    /// Produced by rewrite rule 4: every numeric literal in source is
    /// wrapped in a fixed-precision decimal constructor at compile time.
    Decimal { scale: u32, unscaled: i128 },
    Str(String),
    Bytes(Vec<u8>),
}
