//! Shared syntax types for the vks script engine: source positions, the
//! syntax-stage error type, and the AST produced by `vks_parser` and
//! consumed by the `vks_vm` compiler.
//!
//! The AST is arena-shaped: nodes live in a flat `Vec` inside [`Ast`] and
//! refer to each other by [`NodeId`]. The parser fills the arena without
//! native recursion, so node depth is bounded only by memory, and the
//! compiler walks it the same way.

use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct Pos {
    pub line: u32,
    pub col: u32,
}

impl Pos {
    pub fn new(line: u32, col: u32) -> Self {
        Self { line, col }
    }
}

impl fmt::Display for Pos {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.line, self.col)
    }
}

/// Error for everything that happens before execution: lexing, parsing and
/// compilation. Runtime errors are a separate type in `vks_vm`; the two
/// stages never share a failure path.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct SyntaxError {
    pub message: String,
    pub pos: Option<Pos>,
}

impl SyntaxError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            pos: None,
        }
    }

    pub fn at(message: impl Into<String>, pos: Pos) -> Self {
        Self {
            message: message.into(),
            pos: Some(pos),
        }
    }
}

impl fmt::Display for SyntaxError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.pos {
            Some(pos) => write!(f, "syntax error at {pos}: {}", self.message),
            None => write!(f, "syntax error: {}", self.message),
        }
    }
}

impl std::error::Error for SyntaxError {}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
pub struct NodeId(pub u32);

impl NodeId {
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

/// A literal produced by the parser. Integers use unsigned 32-bit storage
/// and are reinterpreted as signed wherever the language coerces them;
/// `Null` only ever comes from the compiler's implicit pushes.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub enum Literal {
    Null,
    Int(u32),
    Float(f64),
    Str(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum BinOp {
    Add,
    Sub,
    Mul,
    Div,
    Mod,
    BitAnd,
    BitOr,
    Shl,
    Shr,
    Eq,
    Ne,
    Ge,
    Gt,
    Le,
    Lt,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum UnOp {
    Not,
    Invert,
    Neg,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum LogicOp {
    And,
    Or,
}

/// The two fixed single-argument built-in calls. `ParseFloat` is spelled
/// `parseDouble` in source.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum BuiltinFn {
    ParseInt,
    ParseFloat,
}

/// One `name [= init]` entry of a `var` statement.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct VarInit {
    pub name: String,
    pub pos: Pos,
    pub init: Option<NodeId>,
}

#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub enum Node {
    /// Statement sequence. The program root is the only unscoped block.
    Block {
        stmts: Vec<NodeId>,
        scoped: bool,
    },
    If {
        cond: NodeId,
        body: Vec<NodeId>,
        els: Option<Vec<NodeId>>,
    },
    While {
        cond: NodeId,
        body: Vec<NodeId>,
    },
    VarDecl {
        decls: Vec<VarInit>,
    },
    Delete {
        target: NodeId,
        pos: Pos,
    },
    Return {
        value: NodeId,
    },
    /// Expression statement; the value is evaluated and dropped.
    DropExpr {
        expr: NodeId,
    },
    Assign {
        target: NodeId,
        value: NodeId,
        pos: Pos,
    },
    Ternary {
        cond: NodeId,
        then: NodeId,
        els: NodeId,
    },
    Logic {
        op: LogicOp,
        lhs: NodeId,
        rhs: NodeId,
    },
    Binary {
        op: BinOp,
        lhs: NodeId,
        rhs: NodeId,
    },
    Unary {
        op: UnOp,
        expr: NodeId,
    },
    Literal(Literal),
    Var {
        name: String,
        pos: Pos,
    },
    Array {
        items: Vec<NodeId>,
    },
    Object {
        keys: Vec<String>,
        values: Vec<NodeId>,
    },
    /// `API.some.method(arg?)`; `method` has the `API.` prefix stripped.
    ApiCall {
        method: String,
        arg: Option<NodeId>,
    },
    Builtin {
        func: BuiltinFn,
        arg: NodeId,
    },
    MethodCall {
        recv: NodeId,
        name: String,
        args: Vec<NodeId>,
    },
    Index {
        recv: NodeId,
        index: NodeId,
    },
    AttrGet {
        recv: NodeId,
        name: String,
    },
    /// `expr@.name`: maps an array of objects to one field per element.
    AttrFilter {
        recv: NodeId,
        name: String,
    },
}

impl Node {
    /// Child ids in source order; drives the parser's and compiler's
    /// explicit work stacks.
    pub fn children(&self) -> Vec<NodeId> {
        match self {
            Node::Block { stmts, .. } => stmts.clone(),
            Node::If { cond, body, els } => {
                let mut out = vec![*cond];
                out.extend_from_slice(body);
                if let Some(els) = els {
                    out.extend_from_slice(els);
                }
                out
            }
            Node::While { cond, body } => {
                let mut out = vec![*cond];
                out.extend_from_slice(body);
                out
            }
            Node::VarDecl { decls } => decls.iter().filter_map(|d| d.init).collect(),
            Node::Delete { target, .. } => vec![*target],
            Node::Return { value } => vec![*value],
            Node::DropExpr { expr } => vec![*expr],
            Node::Assign { target, value, .. } => vec![*target, *value],
            Node::Ternary { cond, then, els } => vec![*cond, *then, *els],
            Node::Logic { lhs, rhs, .. } | Node::Binary { lhs, rhs, .. } => vec![*lhs, *rhs],
            Node::Unary { expr, .. } => vec![*expr],
            Node::Literal(_) | Node::Var { .. } => Vec::new(),
            Node::Array { items } => items.clone(),
            Node::Object { values, .. } => values.clone(),
            Node::ApiCall { arg, .. } => arg.iter().copied().collect(),
            Node::Builtin { arg, .. } => vec![*arg],
            Node::MethodCall { recv, args, .. } => {
                let mut out = vec![*recv];
                out.extend_from_slice(args);
                out
            }
            Node::Index { recv, index } => vec![*recv, *index],
            Node::AttrGet { recv, .. } | Node::AttrFilter { recv, .. } => vec![*recv],
        }
    }
}

/// A parsed program: the node arena plus the root block.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct Ast {
    pub nodes: Vec<Node>,
    pub root: NodeId,
}

impl Ast {
    pub fn node(&self, id: NodeId) -> &Node {
        &self.nodes[id.index()]
    }
}
