//! Typed expressions.
//!
//! Function bodies are expression trees. Every node carries a program-wide
//! [`ExprId`], its resolved [`Type`] and a [`Span`]. The set of expression
//! kinds is closed; passes match on it exhaustively.

use serde::{Deserialize, Serialize};

use super::def::{DefId, ExprId, LocalId, OpRef};
use super::ty::Type;
use crate::span::Span;

/// A typed expression.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Expr {
    pub id: ExprId,
    pub kind: ExprKind,
    pub ty: Type,
    pub span: Span,
}

/// Expression kinds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ExprKind {
    /// Literal value. Integer literals take their width from the
    /// expression type.
    Literal(Literal),

    /// Local variable read.
    Local(LocalId),

    /// Reference to a function definition.
    Def(DefId),

    /// Binary operation. `And`/`Or` evaluate both operands.
    Binary {
        op: BinOp,
        lhs: Box<Expr>,
        rhs: Box<Expr>,
    },

    Unary { op: UnaryOp, operand: Box<Expr> },

    /// Call. A `Def` callee is a direct call; any other callee evaluates
    /// to a callable value (closure, continuation, intrinsic, operation).
    Call { callee: Box<Expr>, args: Vec<Expr> },

    /// Perform an effect operation. `type_args` instantiate the generic
    /// parameters of the operation at this site.
    Perform {
        op: OpRef,
        args: Vec<Expr>,
        type_args: Vec<Type>,
    },

    /// An effect operation used as a first-class callable.
    Op { op: OpRef, type_args: Vec<Type> },

    /// Block: `{ stmts; tail }`.
    Block {
        stmts: Vec<Stmt>,
        tail: Option<Box<Expr>>,
    },

    /// Assignment to a local. Evaluates to unit.
    Assign { local: LocalId, value: Box<Expr> },

    If {
        cond: Box<Expr>,
        then_branch: Box<Expr>,
        else_branch: Option<Box<Expr>>,
    },

    /// Match on a scalar. Arms are tried in order.
    Match {
        scrutinee: Box<Expr>,
        arms: Vec<MatchArm>,
    },

    /// Infinite loop, left with `break` or `return`.
    Loop { body: Box<Expr> },

    While { cond: Box<Expr>, body: Box<Expr> },

    Break,

    Continue,

    Return(Option<Box<Expr>>),

    /// Install handler clauses around `body`. `finally` runs after the
    /// handled computation produces its value.
    Handle {
        body: Box<Expr>,
        clauses: Vec<HandlerClause>,
        finally: Option<Box<Expr>>,
    },

    /// Closure. Free locals are captured from the defining frame.
    Closure { params: Vec<LocalId>, body: Box<Expr> },

    Tuple(Vec<Expr>),

    /// Tuple field projection.
    Field { base: Box<Expr>, index: u32 },

    /// A builtin callable.
    Intrinsic(Intrinsic),
}

/// Literal values.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum Literal {
    Unit,
    Bool(bool),
    Int(i64),
    Float(f64),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum BinOp {
    Add,
    Sub,
    Mul,
    Div,
    Rem,
    And,
    Or,
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
}

impl BinOp {
    /// Whether the operator yields `bool` regardless of operand type.
    pub fn is_comparison(self) -> bool {
        matches!(
            self,
            BinOp::Eq | BinOp::Ne | BinOp::Lt | BinOp::Le | BinOp::Gt | BinOp::Ge
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum UnaryOp {
    Neg,
    Not,
}

/// Builtin callables available to programs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Intrinsic {
    /// Absolute value of an integer.
    Abs,
    Min,
    Max,
}

/// A statement in a block.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Stmt {
    /// `let local = init;`
    Let { local: LocalId, init: Option<Expr> },
    /// An expression statement; its value is discarded.
    Expr(Expr),
}

impl Stmt {
    /// The expression evaluated by this statement, if any.
    pub fn expr(&self) -> Option<&Expr> {
        match self {
            Stmt::Let { init, .. } => init.as_ref(),
            Stmt::Expr(e) => Some(e),
        }
    }

    pub fn expr_mut(&mut self) -> Option<&mut Expr> {
        match self {
            Stmt::Let { init, .. } => init.as_mut(),
            Stmt::Expr(e) => Some(e),
        }
    }
}

/// A match arm.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MatchArm {
    pub pattern: Pattern,
    pub body: Expr,
}

/// Scalar patterns.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Pattern {
    Wildcard,
    Binding(LocalId),
    Literal(Literal),
}

impl Pattern {
    /// Whether the pattern matches every value.
    pub fn is_irrefutable(&self) -> bool {
        matches!(self, Pattern::Wildcard | Pattern::Binding(_))
    }
}

/// One operation clause of a `handle` expression.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HandlerClause {
    /// The effect whose operation this clause handles.
    pub effect: DefId,
    /// Operation name. Overloads are told apart by `annotations`.
    pub op: String,
    /// Declared parameter types, when the clause spells them out.
    pub annotations: Option<Vec<Type>>,
    /// Parameter bindings, one per operation argument.
    pub params: Vec<LocalId>,
    /// Binding for the captured continuation.
    pub continuation: LocalId,
    pub body: Expr,
    pub span: Span,
}

impl Expr {
    /// Visit direct children in evaluation order. Clause bodies follow the
    /// guarded body, then `finally`.
    pub fn for_each_child<'a>(&'a self, f: &mut impl FnMut(&'a Expr)) {
        match &self.kind {
            ExprKind::Literal(_)
            | ExprKind::Local(_)
            | ExprKind::Def(_)
            | ExprKind::Op { .. }
            | ExprKind::Break
            | ExprKind::Continue
            | ExprKind::Intrinsic(_) => {}
            ExprKind::Binary { lhs, rhs, .. } => {
                f(lhs);
                f(rhs);
            }
            ExprKind::Unary { operand, .. } => f(operand),
            ExprKind::Call { callee, args } => {
                f(callee);
                args.iter().for_each(&mut *f);
            }
            ExprKind::Perform { args, .. } | ExprKind::Tuple(args) => args.iter().for_each(f),
            ExprKind::Block { stmts, tail } => {
                for stmt in stmts {
                    if let Some(e) = stmt.expr() {
                        f(e);
                    }
                }
                if let Some(tail) = tail {
                    f(tail);
                }
            }
            ExprKind::Assign { value, .. } => f(value),
            ExprKind::If {
                cond,
                then_branch,
                else_branch,
            } => {
                f(cond);
                f(then_branch);
                if let Some(e) = else_branch {
                    f(e);
                }
            }
            ExprKind::Match { scrutinee, arms } => {
                f(scrutinee);
                for arm in arms {
                    f(&arm.body);
                }
            }
            ExprKind::Loop { body } => f(body),
            ExprKind::While { cond, body } => {
                f(cond);
                f(body);
            }
            ExprKind::Return(value) => {
                if let Some(v) = value {
                    f(v);
                }
            }
            ExprKind::Handle {
                body,
                clauses,
                finally,
            } => {
                f(body);
                for clause in clauses {
                    f(&clause.body);
                }
                if let Some(fin) = finally {
                    f(fin);
                }
            }
            ExprKind::Closure { body, .. } => f(body),
            ExprKind::Field { base, .. } => f(base),
        }
    }

    /// Mutable counterpart of [`Expr::for_each_child`], same order.
    pub fn for_each_child_mut(&mut self, f: &mut impl FnMut(&mut Expr)) {
        match &mut self.kind {
            ExprKind::Literal(_)
            | ExprKind::Local(_)
            | ExprKind::Def(_)
            | ExprKind::Op { .. }
            | ExprKind::Break
            | ExprKind::Continue
            | ExprKind::Intrinsic(_) => {}
            ExprKind::Binary { lhs, rhs, .. } => {
                f(lhs);
                f(rhs);
            }
            ExprKind::Unary { operand, .. } => f(operand),
            ExprKind::Call { callee, args } => {
                f(callee);
                args.iter_mut().for_each(&mut *f);
            }
            ExprKind::Perform { args, .. } | ExprKind::Tuple(args) => args.iter_mut().for_each(f),
            ExprKind::Block { stmts, tail } => {
                for stmt in stmts {
                    if let Some(e) = stmt.expr_mut() {
                        f(e);
                    }
                }
                if let Some(tail) = tail {
                    f(tail);
                }
            }
            ExprKind::Assign { value, .. } => f(value),
            ExprKind::If {
                cond,
                then_branch,
                else_branch,
            } => {
                f(cond);
                f(then_branch);
                if let Some(e) = else_branch {
                    f(e);
                }
            }
            ExprKind::Match { scrutinee, arms } => {
                f(scrutinee);
                for arm in arms {
                    f(&mut arm.body);
                }
            }
            ExprKind::Loop { body } => f(body),
            ExprKind::While { cond, body } => {
                f(cond);
                f(body);
            }
            ExprKind::Return(value) => {
                if let Some(v) = value {
                    f(v);
                }
            }
            ExprKind::Handle {
                body,
                clauses,
                finally,
            } => {
                f(body);
                for clause in clauses {
                    f(&mut clause.body);
                }
                if let Some(fin) = finally {
                    f(fin);
                }
            }
            ExprKind::Closure { body, .. } => f(body),
            ExprKind::Field { base, .. } => f(base),
        }
    }

    /// Post-order traversal: children before their parent.
    pub fn walk_post<'a>(&'a self, f: &mut impl FnMut(&'a Expr)) {
        self.for_each_child(&mut |child| child.walk_post(&mut *f));
        f(self);
    }

    /// Pre-order traversal of this expression and all descendants.
    pub fn walk<'a>(&'a self, f: &mut impl FnMut(&'a Expr)) {
        f(self);
        self.for_each_child(&mut |child| child.walk(&mut *f));
    }

    /// Whether any node in the tree satisfies `pred`.
    pub fn any(&self, pred: &mut impl FnMut(&Expr) -> bool) -> bool {
        if pred(self) {
            return true;
        }
        let mut found = false;
        self.for_each_child(&mut |child| {
            if !found && child.any(&mut *pred) {
                found = true;
            }
        });
        found
    }

    /// Whether the expression performs an operation anywhere, including
    /// inside nested handlers and closures.
    pub fn contains_perform(&self) -> bool {
        self.any(&mut |e| matches!(e.kind, ExprKind::Perform { .. }))
    }

    pub fn is_literal(&self) -> bool {
        matches!(self.kind, ExprKind::Literal(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn lit(id: u32, v: i64) -> Expr {
        Expr {
            id: ExprId(id),
            kind: ExprKind::Literal(Literal::Int(v)),
            ty: Type::I32,
            span: Span::dummy(),
        }
    }

    #[test]
    fn test_walk_visits_in_evaluation_order() {
        let sum = Expr {
            id: ExprId(3),
            kind: ExprKind::Binary {
                op: BinOp::Add,
                lhs: Box::new(lit(1, 1)),
                rhs: Box::new(lit(2, 2)),
            },
            ty: Type::I32,
            span: Span::dummy(),
        };
        let mut seen = Vec::new();
        sum.walk(&mut |e| seen.push(e.id.0));
        assert_eq!(seen, vec![3, 1, 2]);
        assert!(!sum.contains_perform());
    }

    #[test]
    fn test_pattern_irrefutable() {
        assert!(Pattern::Wildcard.is_irrefutable());
        assert!(Pattern::Binding(LocalId::new(0)).is_irrefutable());
        assert!(!Pattern::Literal(Literal::Int(0)).is_irrefutable());
        assert!(BinOp::Le.is_comparison());
        assert!(!BinOp::And.is_comparison());
    }
}
