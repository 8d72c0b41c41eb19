//! The AST the lowering pass operates on.
//!
//! This is the shape of the language *after* semantic analysis and for-loop
//! desugaring: structured control flow, statement-list expressions, labelled
//! blocks, try/except/finally, and statement-position yields. `GotoState` is
//! the one node produced (and later consumed) by the pass itself; it never
//! appears in legal input.

use serde::{Deserialize, Serialize};
use smallvec::SmallVec;

pub type Symbol = String;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HirFunction {
    pub name: Symbol,
    pub params: SmallVec<[HirParam; 4]>,
    pub ret_type: Type,
    pub body: Vec<HirStmt>,
    /// True for resumable generators; the pass refuses plain functions.
    pub is_closure_iter: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HirParam {
    pub name: Symbol,
    pub ty: Type,
}

impl HirParam {
    pub fn new(name: impl Into<Symbol>, ty: Type) -> Self {
        Self { name: name.into(), ty }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Type {
    Unknown,
    Int,
    Int16,
    Float,
    Bool,
    String,
    Unit,
    Exception,
    Custom(String),
    Array {
        element_type: Box<Type>,
        size: usize,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Literal {
    Int(i64),
    Float(f64),
    String(String),
    Bool(bool),
    None,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BinOp {
    Add,
    Sub,
    Mul,
    Div,
    Mod,
    Eq,
    NotEq,
    Lt,
    LtEq,
    Gt,
    GtEq,
    And,
    Or,
}

impl BinOp {
    /// Short-circuit operators get their own normalisation rule.
    pub fn is_lazy(self) -> bool {
        matches!(self, BinOp::And | BinOp::Or)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum UnaryOp {
    Not,
    Neg,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum AssignTarget {
    Symbol(Symbol),
    Field {
        base: Box<HirExpr>,
        field: Symbol,
    },
    Index {
        base: Box<HirExpr>,
        index: Box<HirExpr>,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CondArm {
    pub condition: HirExpr,
    pub body: Vec<HirStmt>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CaseArm {
    pub labels: Vec<Literal>,
    pub body: Vec<HirStmt>,
}

/// An `except` branch. Empty `exception_types` is the catch-all form.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExceptHandler {
    pub exception_types: Vec<Symbol>,
    pub body: Vec<HirStmt>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum HirStmt {
    Expr(HirExpr),
    VarDecl {
        name: Symbol,
        ty: Type,
        init: Option<HirExpr>,
        mutable: bool,
    },
    Assign {
        target: AssignTarget,
        value: HirExpr,
        /// Shallow assignment; carried through untouched.
        fast: bool,
    },
    Return(Option<HirExpr>),
    /// `Raise(None)` re-raises the currently propagating exception.
    Raise(Option<HirExpr>),
    Yield(Option<HirExpr>),
    If {
        arms: Vec<CondArm>,
        else_body: Option<Vec<HirStmt>>,
    },
    Case {
        selector: HirExpr,
        arms: Vec<CaseArm>,
        else_body: Option<Vec<HirStmt>>,
    },
    While {
        condition: HirExpr,
        body: Vec<HirStmt>,
    },
    /// Must be desugared to `While` before this pass runs.
    For {
        target: Symbol,
        iter: HirExpr,
        body: Vec<HirStmt>,
    },
    Block {
        label: Option<Symbol>,
        body: Vec<HirStmt>,
    },
    Break {
        label: Option<Symbol>,
    },
    Continue,
    Try {
        body: Vec<HirStmt>,
        handlers: Vec<ExceptHandler>,
        finally: Option<Vec<HirStmt>>,
    },
    /// Abstract edge to another state; `-1` is the exit until the
    /// empty-state eliminator resolves it.
    GotoState(i32),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum HirExpr {
    Literal(Literal),
    Var(Symbol),
    Field {
        base: Box<HirExpr>,
        field: Symbol,
    },
    Index {
        base: Box<HirExpr>,
        index: Box<HirExpr>,
    },
    Binary {
        op: BinOp,
        left: Box<HirExpr>,
        right: Box<HirExpr>,
    },
    Unary {
        op: UnaryOp,
        operand: Box<HirExpr>,
    },
    Call {
        func: Symbol,
        args: Vec<HirExpr>,
    },
    Tuple(Vec<HirExpr>),
    Array(Vec<HirExpr>),
    ObjConstr {
        ty: Symbol,
        fields: Vec<(Symbol, HirExpr)>,
    },
    Cast {
        ty: Type,
        operand: Box<HirExpr>,
    },
    /// `(s1; s2; e)` - statements evaluated for effect, `value` is the result.
    StmtListExpr {
        stmts: Vec<HirStmt>,
        value: Box<HirExpr>,
    },
    IfExpr {
        arms: Vec<(HirExpr, HirExpr)>,
        orelse: Box<HirExpr>,
    },
    CaseExpr {
        selector: Box<HirExpr>,
        arms: Vec<(Vec<Literal>, HirExpr)>,
        orelse: Box<HirExpr>,
    },
    TryExpr {
        body: Box<HirExpr>,
        handlers: Vec<(Vec<Symbol>, HirExpr)>,
        finally: Option<Vec<HirStmt>>,
    },
    /// Nested routine; opaque to every walk in this crate.
    Lambda {
        params: Vec<Symbol>,
        body: Box<HirExpr>,
    },
}

impl HirExpr {
    pub fn int(v: i64) -> Self {
        HirExpr::Literal(Literal::Int(v))
    }

    pub fn truth(v: bool) -> Self {
        HirExpr::Literal(Literal::Bool(v))
    }

    pub fn name(s: impl Into<Symbol>) -> Self {
        HirExpr::Var(s.into())
    }

    pub fn nil() -> Self {
        HirExpr::Literal(Literal::None)
    }

    pub fn binary(op: BinOp, left: HirExpr, right: HirExpr) -> Self {
        HirExpr::Binary {
            op,
            left: Box::new(left),
            right: Box::new(right),
        }
    }

    pub fn not(operand: HirExpr) -> Self {
        HirExpr::Unary {
            op: UnaryOp::Not,
            operand: Box::new(operand),
        }
    }

    pub fn is_literal(&self) -> bool {
        matches!(self, HirExpr::Literal(_))
    }
}

/// True if a yield statement occurs anywhere inside `stmt`, including inside
/// statement-list expressions buried in its expressions.
pub fn stmt_contains_yield(stmt: &HirStmt) -> bool {
    match stmt {
        HirStmt::Yield(_) => true,
        HirStmt::Expr(e) => expr_contains_yield(e),
        HirStmt::VarDecl { init, .. } => init.as_ref().is_some_and(expr_contains_yield),
        HirStmt::Assign { target, value, .. } => {
            target_contains_yield(target) || expr_contains_yield(value)
        }
        HirStmt::Return(e) | HirStmt::Raise(e) => e.as_ref().is_some_and(expr_contains_yield),
        HirStmt::If { arms, else_body } => {
            arms.iter().any(|a| {
                expr_contains_yield(&a.condition) || stmts_contain_yield(&a.body)
            }) || else_body.as_deref().is_some_and(stmts_contain_yield)
        }
        HirStmt::Case {
            selector,
            arms,
            else_body,
        } => {
            expr_contains_yield(selector)
                || arms.iter().any(|a| stmts_contain_yield(&a.body))
                || else_body.as_deref().is_some_and(stmts_contain_yield)
        }
        HirStmt::While { condition, body } => {
            expr_contains_yield(condition) || stmts_contain_yield(body)
        }
        HirStmt::For { iter, body, .. } => {
            expr_contains_yield(iter) || stmts_contain_yield(body)
        }
        HirStmt::Block { body, .. } => stmts_contain_yield(body),
        HirStmt::Try {
            body,
            handlers,
            finally,
        } => {
            stmts_contain_yield(body)
                || handlers.iter().any(|h| stmts_contain_yield(&h.body))
                || finally.as_deref().is_some_and(stmts_contain_yield)
        }
        HirStmt::Break { .. } | HirStmt::Continue | HirStmt::GotoState(_) => false,
    }
}

pub fn stmts_contain_yield(stmts: &[HirStmt]) -> bool {
    stmts.iter().any(stmt_contains_yield)
}

/// True if a yield hides inside an *expression* of `stmt` (or of any nested
/// statement): the shape the normaliser exists to flatten. Yields that are
/// already plain statements do not count.
pub fn stmt_has_expr_yields(stmt: &HirStmt) -> bool {
    match stmt {
        HirStmt::Yield(e) => e.as_ref().is_some_and(expr_contains_yield),
        HirStmt::Expr(e) => expr_contains_yield(e),
        HirStmt::VarDecl { init, .. } => init.as_ref().is_some_and(expr_contains_yield),
        HirStmt::Assign { target, value, .. } => {
            target_contains_yield(target) || expr_contains_yield(value)
        }
        HirStmt::Return(e) | HirStmt::Raise(e) => e.as_ref().is_some_and(expr_contains_yield),
        HirStmt::If { arms, else_body } => {
            arms.iter().any(|a| {
                expr_contains_yield(&a.condition) || a.body.iter().any(stmt_has_expr_yields)
            }) || else_body
                .as_deref()
                .is_some_and(|b| b.iter().any(stmt_has_expr_yields))
        }
        HirStmt::Case {
            selector,
            arms,
            else_body,
        } => {
            expr_contains_yield(selector)
                || arms.iter().any(|a| a.body.iter().any(stmt_has_expr_yields))
                || else_body
                    .as_deref()
                    .is_some_and(|b| b.iter().any(stmt_has_expr_yields))
        }
        HirStmt::While { condition, body } => {
            expr_contains_yield(condition) || body.iter().any(stmt_has_expr_yields)
        }
        HirStmt::For { iter, body, .. } => {
            expr_contains_yield(iter) || body.iter().any(stmt_has_expr_yields)
        }
        HirStmt::Block { body, .. } => body.iter().any(stmt_has_expr_yields),
        HirStmt::Try {
            body,
            handlers,
            finally,
        } => {
            body.iter().any(stmt_has_expr_yields)
                || handlers
                    .iter()
                    .any(|h| h.body.iter().any(stmt_has_expr_yields))
                || finally
                    .as_deref()
                    .is_some_and(|b| b.iter().any(stmt_has_expr_yields))
        }
        HirStmt::Break { .. } | HirStmt::Continue | HirStmt::GotoState(_) => false,
    }
}

fn target_contains_yield(target: &AssignTarget) -> bool {
    match target {
        AssignTarget::Symbol(_) => false,
        AssignTarget::Field { base, .. } => expr_contains_yield(base),
        AssignTarget::Index { base, index } => {
            expr_contains_yield(base) || expr_contains_yield(index)
        }
    }
}

pub fn expr_contains_yield(expr: &HirExpr) -> bool {
    match expr {
        HirExpr::Literal(_) | HirExpr::Var(_) | HirExpr::Lambda { .. } => false,
        HirExpr::Field { base, .. } => expr_contains_yield(base),
        HirExpr::Unary { operand, .. } | HirExpr::Cast { operand, .. } => {
            expr_contains_yield(operand)
        }
        HirExpr::Index { base, index } => {
            expr_contains_yield(base) || expr_contains_yield(index)
        }
        HirExpr::Binary { left, right, .. } => {
            expr_contains_yield(left) || expr_contains_yield(right)
        }
        HirExpr::Call { args, .. } | HirExpr::Tuple(args) | HirExpr::Array(args) => {
            args.iter().any(expr_contains_yield)
        }
        HirExpr::ObjConstr { fields, .. } => {
            fields.iter().any(|(_, e)| expr_contains_yield(e))
        }
        HirExpr::StmtListExpr { stmts, value } => {
            stmts_contain_yield(stmts) || expr_contains_yield(value)
        }
        HirExpr::IfExpr { arms, orelse } => {
            arms.iter()
                .any(|(c, v)| expr_contains_yield(c) || expr_contains_yield(v))
                || expr_contains_yield(orelse)
        }
        HirExpr::CaseExpr {
            selector,
            arms,
            orelse,
        } => {
            expr_contains_yield(selector)
                || arms.iter().any(|(_, v)| expr_contains_yield(v))
                || expr_contains_yield(orelse)
        }
        HirExpr::TryExpr {
            body,
            handlers,
            finally,
        } => {
            expr_contains_yield(body)
                || handlers.iter().any(|(_, v)| expr_contains_yield(v))
                || finally.as_deref().is_some_and(stmts_contain_yield)
        }
    }
}
