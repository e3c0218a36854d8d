//! # Continuation Usage
//!
//! Counts how often a clause body invokes its continuation, to decide
//! whether a `tail` clause provably resumes exactly once.
//!
//! The analysis is structural over the clause body:
//!
//! | Construct | Usage |
//! |-----------|-------|
//! | `k(v)` in direct-call position | `{1, 1}` plus the argument's usage |
//! | sequence (operands, arguments) | sum |
//! | block statements | sum, stopping after a statement that definitely resumes |
//! | `if` / `match` | min of mins, max of maxes (missing `else` counts as `{0, 0}`) |
//! | loop body with nonzero usage | `{0, ∞}` |
//! | nested handler clause with nonzero usage | `{0, ∞}` |
//! | `return` | ends the path with the count so far |
//! | `k` as a value | leaked |
//! | any use under a closure | captured |
//!
//! Calling a tail continuation transfers control out of the clause, so
//! statements after one that definitely resumes are unreachable. Their
//! escapes still count: a continuation handed away after it resumed is a
//! leak all the same.

use std::fmt;

use crate::diagnostics::{Diagnostic, ErrorCode};
use crate::hir::{Expr, ExprKind, HandlerClause, LocalId, Stmt};

/// Upper bound on a resumption count.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UsageBound {
    Finite(u32),
    Unbounded,
}

impl UsageBound {
    fn add(self, other: UsageBound) -> UsageBound {
        match (self, other) {
            (UsageBound::Finite(a), UsageBound::Finite(b)) => UsageBound::Finite(a.saturating_add(b)),
            _ => UsageBound::Unbounded,
        }
    }

    fn max(self, other: UsageBound) -> UsageBound {
        match (self, other) {
            (UsageBound::Finite(a), UsageBound::Finite(b)) => UsageBound::Finite(a.max(b)),
            _ => UsageBound::Unbounded,
        }
    }

    fn is_zero(self) -> bool {
        self == UsageBound::Finite(0)
    }
}

impl fmt::Display for UsageBound {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            UsageBound::Finite(n) => write!(f, "{n}"),
            UsageBound::Unbounded => f.write_str("∞"),
        }
    }
}

/// How the continuation leaves direct-call position, ordered by severity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum EscapeKind {
    None,
    /// Used inside a nested closure.
    Captured,
    /// Used as a first-class value.
    Leaked,
}

/// Resumption count bounds of one clause body.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ContinuationUsage {
    pub min: u32,
    pub max: UsageBound,
    pub escape: EscapeKind,
}

impl ContinuationUsage {
    pub const ZERO: ContinuationUsage = ContinuationUsage {
        min: 0,
        max: UsageBound::Finite(0),
        escape: EscapeKind::None,
    };

    const ONCE: ContinuationUsage = ContinuationUsage {
        min: 1,
        max: UsageBound::Finite(1),
        escape: EscapeKind::None,
    };

    fn then(self, next: ContinuationUsage) -> ContinuationUsage {
        ContinuationUsage {
            min: self.min.saturating_add(next.min),
            max: self.max.add(next.max),
            escape: self.escape.max(next.escape),
        }
    }

    fn or(self, other: ContinuationUsage) -> ContinuationUsage {
        ContinuationUsage {
            min: self.min.min(other.min),
            max: self.max.max(other.max),
            escape: self.escape.max(other.escape),
        }
    }

    fn escaping(self, escape: EscapeKind) -> ContinuationUsage {
        ContinuationUsage {
            escape: self.escape.max(escape),
            ..self
        }
    }

    pub fn escapes(&self) -> bool {
        self.escape != EscapeKind::None
    }

    /// Whether the count is exactly one on every path.
    pub fn is_exactly_once(&self) -> bool {
        self.min == 1 && self.max == UsageBound::Finite(1)
    }

    /// How the single-resumption rule is enforced for a tail clause.
    pub fn enforcement(&self) -> Enforcement {
        if !self.escapes() && self.is_exactly_once() {
            Enforcement::Static
        } else {
            Enforcement::Runtime
        }
    }
}

impl fmt::Display for ContinuationUsage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.max == UsageBound::Finite(self.min) {
            write!(f, "{}", self.min)
        } else {
            write!(f, "{}..{}", self.min, self.max)
        }
    }
}

/// How a tail clause's single resumption is guaranteed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Enforcement {
    /// Proven at compile time; no guard is emitted.
    Static,
    /// A resumption counter traps on misuse.
    Runtime,
}

/// Analyze how `body` uses the continuation bound to `k`.
pub fn analyze(body: &Expr, k: LocalId) -> ContinuationUsage {
    UsageWalker { k, closure_depth: 0 }.expr(body).total()
}

/// Analyze a clause and report misuse of a tail continuation.
///
/// Leaks are always rejected. Counts are rejected when they are provably
/// wrong: never resumed, always resumed more than once, or a finite range
/// that is not exactly one.
pub fn check_clause(clause: &HandlerClause, label: &str) -> (ContinuationUsage, Option<Diagnostic>) {
    let usage = analyze(&clause.body, clause.continuation);
    let diagnostic = match usage.escape {
        EscapeKind::Leaked => Some(Diagnostic::coded(
            ErrorCode::TailResumeEscape,
            format!("the continuation of tail operation `{label}` escapes its clause"),
            clause.span,
        )),
        EscapeKind::Captured => None,
        EscapeKind::None => {
            let wrong = usage.max.is_zero()
                || usage.min > 1
                || matches!(usage.max, UsageBound::Finite(max) if max != usage.min);
            wrong.then(|| {
                let observed = if usage.max == UsageBound::Finite(usage.min) {
                    format!("observed count {usage}")
                } else {
                    format!("observed range {usage}")
                };
                Diagnostic::coded(
                    ErrorCode::TailResumeCount,
                    format!("tail operation `{label}` must resume exactly once; {observed}"),
                    clause.span,
                )
            })
        }
    };
    (usage, diagnostic)
}

/// Usage split by how control leaves an expression.
///
/// `fall` covers paths that continue to the next expression, `exit` paths
/// that left the clause through `return`. `None` means no such path.
#[derive(Debug, Clone, Copy)]
struct Flow {
    fall: Option<ContinuationUsage>,
    exit: Option<ContinuationUsage>,
    escape: EscapeKind,
}

impl Flow {
    const ZERO: Flow = Flow::value(ContinuationUsage::ZERO);

    const fn value(usage: ContinuationUsage) -> Flow {
        Flow {
            fall: Some(usage),
            exit: None,
            escape: usage.escape,
        }
    }

    fn escaped(escape: EscapeKind) -> Flow {
        Flow {
            escape,
            ..Flow::ZERO
        }
    }

    /// `self` followed by `next`. Escapes merge even when `next` is unreachable.
    fn then(self, next: Flow) -> Flow {
        let escape = self.escape.max(next.escape);
        match self.fall {
            Some(before) => Flow {
                fall: next.fall.map(|n| before.then(n)),
                exit: join(self.exit, next.exit.map(|n| before.then(n))),
                escape,
            },
            None => Flow { escape, ..self },
        }
    }

    fn or(self, other: Flow) -> Flow {
        Flow {
            fall: join(self.fall, other.fall),
            exit: join(self.exit, other.exit),
            escape: self.escape.max(other.escape),
        }
    }

    fn escaping(self, escape: EscapeKind) -> Flow {
        Flow {
            escape: self.escape.max(escape),
            ..self
        }
    }

    fn definitely_resumed(&self) -> bool {
        !matches!(self.fall, Some(f) if f.min == 0)
    }

    /// Every path through the expression, whichever way it ends.
    fn total(self) -> ContinuationUsage {
        join(self.fall, self.exit)
            .unwrap_or(ContinuationUsage::ZERO)
            .escaping(self.escape)
    }

    /// The expression may run any number of times.
    fn repeated(self) -> Flow {
        let total = self.total();
        if total.max.is_zero() {
            return Flow {
                fall: Some(total),
                ..self
            };
        }
        let any = ContinuationUsage {
            min: 0,
            max: UsageBound::Unbounded,
            escape: EscapeKind::None,
        };
        Flow {
            fall: Some(any),
            exit: self.exit.map(|_| any),
            escape: self.escape,
        }
    }
}

fn join(a: Option<ContinuationUsage>, b: Option<ContinuationUsage>) -> Option<ContinuationUsage> {
    match (a, b) {
        (Some(a), Some(b)) => Some(a.or(b)),
        (a, None) => a,
        (None, b) => b,
    }
}

struct UsageWalker {
    k: LocalId,
    closure_depth: u32,
}

impl UsageWalker {
    fn is_k(&self, expr: &Expr) -> bool {
        matches!(expr.kind, ExprKind::Local(id) if id == self.k)
    }

    fn seq<'a>(&mut self, exprs: impl IntoIterator<Item = &'a Expr>) -> Flow {
        exprs.into_iter().fold(Flow::ZERO, |acc, e| {
            let next = self.expr(e);
            acc.then(next)
        })
    }

    fn expr(&mut self, expr: &Expr) -> Flow {
        match &expr.kind {
            ExprKind::Local(id) if *id == self.k => Flow::escaped(EscapeKind::Leaked),
            ExprKind::Literal(_)
            | ExprKind::Local(_)
            | ExprKind::Def(_)
            | ExprKind::Op { .. }
            | ExprKind::Break
            | ExprKind::Continue
            | ExprKind::Intrinsic(_) => Flow::ZERO,

            ExprKind::Call { callee, args } if self.is_k(callee) => {
                let args = self.seq(args);
                if self.closure_depth > 0 {
                    args.escaping(EscapeKind::Captured)
                } else {
                    args.then(Flow::value(ContinuationUsage::ONCE))
                }
            }
            ExprKind::Call { callee, args } => {
                let callee = self.expr(callee);
                callee.then(self.seq(args))
            }
            ExprKind::Binary { lhs, rhs, .. } => self.seq([&**lhs, &**rhs]),
            ExprKind::Unary { operand, .. } => self.expr(operand),
            ExprKind::Perform { args, .. } | ExprKind::Tuple(args) => self.seq(args),
            ExprKind::Field { base, .. } => self.expr(base),
            ExprKind::Assign { value, .. } => self.expr(value),
            ExprKind::Return(value) => {
                let value = match value {
                    Some(v) => self.expr(v),
                    None => Flow::ZERO,
                };
                Flow {
                    fall: None,
                    exit: join(value.exit, value.fall),
                    escape: value.escape,
                }
            }

            ExprKind::Block { stmts, tail } => {
                let mut acc = Flow::ZERO;
                let exprs = stmts
                    .iter()
                    .filter_map(|stmt| match stmt {
                        Stmt::Let { init: Some(e), .. } | Stmt::Expr(e) => Some(e),
                        Stmt::Let { init: None, .. } => None,
                    })
                    .chain(tail.as_deref());
                for e in exprs {
                    let usage = self.expr(e);
                    acc = if acc.definitely_resumed() {
                        acc.escaping(usage.escape)
                    } else {
                        acc.then(usage)
                    };
                }
                acc
            }

            ExprKind::If {
                cond,
                then_branch,
                else_branch,
            } => {
                let cond = self.expr(cond);
                let then_usage = self.expr(then_branch);
                let else_usage = match else_branch {
                    Some(e) => self.expr(e),
                    None => Flow::ZERO,
                };
                cond.then(then_usage.or(else_usage))
            }
            ExprKind::Match { scrutinee, arms } => {
                let scrutinee = self.expr(scrutinee);
                let mut branches: Option<Flow> = None;
                for arm in arms {
                    let usage = self.expr(&arm.body);
                    branches = Some(match branches {
                        Some(acc) => acc.or(usage),
                        None => usage,
                    });
                }
                // The implicit default arm of a non-exhaustive match.
                if !arms.iter().any(|a| a.pattern.is_irrefutable()) {
                    branches = Some(match branches {
                        Some(acc) => acc.or(Flow::ZERO),
                        None => Flow::ZERO,
                    });
                }
                scrutinee.then(branches.unwrap_or(Flow::ZERO))
            }
            ExprKind::Loop { body } => self.expr(body).repeated(),
            ExprKind::While { cond, body } => {
                let cond = self.expr(cond);
                let body = self.expr(body);
                cond.then(body).repeated()
            }

            ExprKind::Handle {
                body,
                clauses,
                finally,
            } => {
                let mut usage = self.expr(body);
                // A nested clause runs once per operation its body performs.
                for clause in clauses {
                    let clause = Flow::value(self.expr(&clause.body).total()).repeated();
                    usage = usage.then(clause);
                }
                if let Some(fin) = finally {
                    usage = usage.then(self.expr(fin));
                }
                usage
            }
            ExprKind::Closure { body, .. } => {
                self.closure_depth += 1;
                let inner = self.expr(body).total();
                self.closure_depth -= 1;
                Flow::escaped(if inner.escapes() {
                    inner.escape.max(EscapeKind::Captured)
                } else {
                    EscapeKind::None
                })
            }
        }
    }
}
