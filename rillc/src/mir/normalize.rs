//! # Normalization
//!
//! Rewrites function bodies so that every effect site can be re-entered:
//!
//! 1. `handle { .. } finally { f }` becomes
//!    `{ let $t = handle { .. }; f; $t }`.
//! 2. Operands evaluated before a sibling that may suspend are spilled into
//!    `let $tN = operand;` statements ahead of the expression. When the
//!    expression itself may suspend (a perform or an effectful call) all of
//!    its operands are spilled.
//!
//! After normalization an operand list holds at most one operand containing a
//! site, and nothing before it but literals and spilled locals. Re-entering
//! the expression on resumption therefore never re-runs an earlier operand.
//! Evaluation order is unchanged.

use tracing::trace;

use crate::effects::EffectAnalysis;
use crate::hir::{Expr, ExprIdGen, ExprKind, LocalDecl, LocalId, Program, Stmt, Type};

/// Normalize every function of `program`, returning the rewritten copy.
pub fn normalize(program: &Program, analysis: &EffectAnalysis) -> Program {
    let mut out = program.clone();
    let mut ids = program.expr_ids();
    for function in &mut out.functions {
        let mut normalizer = Normalizer {
            analysis,
            locals: &mut function.locals,
            ids: &mut ids,
            spilled: 0,
        };
        normalizer.expr(&mut function.body);
        trace!(function = %function.name, spilled = normalizer.spilled, "normalized");
    }
    out
}

/// Whether evaluating `expr` itself (not its operands) may suspend.
pub fn suspends(expr: &Expr, analysis: &EffectAnalysis) -> bool {
    match &expr.kind {
        ExprKind::Perform { .. } | ExprKind::Handle { .. } => true,
        ExprKind::Call { callee, .. } => match callee.kind {
            ExprKind::Def(def) => analysis.is_effectful(def),
            ExprKind::Intrinsic(_) => false,
            _ => true,
        },
        _ => false,
    }
}

/// Whether `expr` or anything inside it may suspend.
pub fn may_suspend(expr: &Expr, analysis: &EffectAnalysis) -> bool {
    expr.any(&mut |e| suspends(e, analysis))
}

struct Normalizer<'a> {
    analysis: &'a EffectAnalysis,
    locals: &'a mut Vec<LocalDecl>,
    ids: &'a mut ExprIdGen,
    spilled: usize,
}

impl Normalizer<'_> {
    fn expr(&mut self, expr: &mut Expr) {
        match &mut expr.kind {
            ExprKind::Literal(_)
            | ExprKind::Local(_)
            | ExprKind::Def(_)
            | ExprKind::Op { .. }
            | ExprKind::Break
            | ExprKind::Continue
            | ExprKind::Intrinsic(_) => {}
            ExprKind::Unary { operand, .. } => self.expr(operand),
            ExprKind::Assign { value, .. } => self.expr(value),
            ExprKind::Field { base, .. } => self.expr(base),
            ExprKind::Return(value) => {
                if let Some(v) = value {
                    self.expr(v);
                }
            }
            ExprKind::Block { stmts, tail } => {
                for stmt in stmts.iter_mut() {
                    if let Some(e) = stmt.expr_mut() {
                        self.expr(e);
                    }
                }
                if let Some(tail) = tail {
                    self.expr(tail);
                }
            }
            ExprKind::If {
                cond,
                then_branch,
                else_branch,
            } => {
                self.expr(cond);
                self.expr(then_branch);
                if let Some(e) = else_branch {
                    self.expr(e);
                }
            }
            ExprKind::Match { scrutinee, arms } => {
                self.expr(scrutinee);
                for arm in arms {
                    self.expr(&mut arm.body);
                }
            }
            ExprKind::Loop { body } => self.expr(body),
            ExprKind::While { cond, body } => {
                self.expr(cond);
                self.expr(body);
            }
            ExprKind::Closure { body, .. } => self.expr(body),
            ExprKind::Handle {
                body,
                clauses,
                finally,
            } => {
                self.expr(body);
                for clause in clauses.iter_mut() {
                    self.expr(&mut clause.body);
                }
                if let Some(mut fin) = finally.take() {
                    self.expr(&mut fin);
                    self.desugar_finally(expr, *fin);
                }
                return;
            }
            ExprKind::Binary { lhs, rhs, .. } => {
                self.expr(lhs);
                self.expr(rhs);
            }
            ExprKind::Call { callee, args } => {
                self.expr(callee);
                args.iter_mut().for_each(|a| self.expr(a));
            }
            ExprKind::Perform { args, .. } | ExprKind::Tuple(args) => {
                args.iter_mut().for_each(|a| self.expr(a));
            }
        }
        self.spill_operands(expr);
    }

    /// `handle` (already stripped of its `finally`) becomes
    /// `{ let $t = handle; fin; $t }`.
    fn desugar_finally(&mut self, handle: &mut Expr, fin: Expr) {
        let ty = handle.ty.clone();
        let span = handle.span;
        let local = self.fresh_local(ty.clone());
        let placeholder = self.mk(ExprKind::Literal(crate::hir::Literal::Unit), Type::Unit, span);
        let inner = std::mem::replace(handle, placeholder);
        let read = self.mk(ExprKind::Local(local), ty.clone(), span);
        *handle = self.mk(
            ExprKind::Block {
                stmts: vec![
                    Stmt::Let {
                        local,
                        init: Some(inner),
                    },
                    Stmt::Expr(fin),
                ],
                tail: Some(Box::new(read)),
            },
            ty,
            span,
        );
    }

    fn spill_operands(&mut self, expr: &mut Expr) {
        let node_suspends = suspends(expr, self.analysis);
        let analysis = self.analysis;
        let operands: Vec<&mut Expr> = match &mut expr.kind {
            ExprKind::Binary { lhs, rhs, .. } => vec![lhs.as_mut(), rhs.as_mut()],
            ExprKind::Call { callee, args } => {
                let mut v = vec![callee.as_mut()];
                v.extend(args.iter_mut());
                v
            }
            ExprKind::Perform { args, .. } | ExprKind::Tuple(args) => args.iter_mut().collect(),
            _ => return,
        };
        let last = if node_suspends {
            Some(operands.len())
        } else {
            operands.iter().rposition(|e| may_suspend(e, analysis))
        };
        let Some(last) = last else {
            return;
        };

        let mut stmts = Vec::new();
        for operand in operands.into_iter().take(last) {
            if is_stable(operand) {
                continue;
            }
            let local = self.fresh_local(operand.ty.clone());
            let read = self.mk(ExprKind::Local(local), operand.ty.clone(), operand.span);
            let value = std::mem::replace(operand, read);
            stmts.push(Stmt::Let {
                local,
                init: Some(value),
            });
        }
        if stmts.is_empty() {
            return;
        }
        self.spilled += stmts.len();

        let ty = expr.ty.clone();
        let span = expr.span;
        let placeholder = self.mk(ExprKind::Literal(crate::hir::Literal::Unit), Type::Unit, span);
        let inner = std::mem::replace(expr, placeholder);
        *expr = self.mk(
            ExprKind::Block {
                stmts,
                tail: Some(Box::new(inner)),
            },
            ty,
            span,
        );
    }

    fn fresh_local(&mut self, ty: Type) -> LocalId {
        let name = format!("$t{}", self.locals.len());
        self.locals.push(LocalDecl { name, ty });
        LocalId::new((self.locals.len() - 1) as u32)
    }

    fn mk(&mut self, kind: ExprKind, ty: Type, span: crate::span::Span) -> Expr {
        Expr {
            id: self.ids.fresh(),
            kind,
            ty,
            span,
        }
    }
}

/// Operands whose value cannot change between evaluation and use.
fn is_stable(expr: &Expr) -> bool {
    match expr.kind {
        ExprKind::Literal(_) | ExprKind::Def(_) | ExprKind::Intrinsic(_) | ExprKind::Op { .. } => true,
        // Continuation bindings are never reassigned.
        ExprKind::Local(_) => matches!(expr.ty, Type::Continuation { .. }),
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CompilerConfig;
    use crate::effects;
    use crate::hir::{FnBuilder, OpRef, ProgramBuilder};
    use rill_runtime::ResumeKind;

    fn ask_program(build: impl FnOnce(&mut FnBuilder<'_>, OpRef) -> Expr) -> Program {
        let mut b = ProgramBuilder::new();
        let ask = b.effect(
            "Ask",
            vec![ProgramBuilder::op("ask", vec![], Type::I32, ResumeKind::Tail)],
        );
        let op = OpRef::new(ask, 0);
        b.function("f", &[("x", Type::I32)], Type::I32, |f| build(f, op));
        b.finish()
    }

    fn normalized(program: &Program) -> Program {
        let analysis = effects::analyze(program, &CompilerConfig::default());
        normalize(program, &analysis)
    }

    #[test]
    fn test_operand_before_site_is_spilled() {
        let program = ask_program(|f, op| {
            let x = f.var(f.param(0));
            let asked = f.perform(op, vec![]);
            f.add(x, asked)
        });
        let out = normalized(&program);
        let body = &out.functions[0].body;
        let ExprKind::Block { stmts, tail } = &body.kind else {
            panic!("expected a block, got {:?}", body.kind);
        };
        assert_eq!(stmts.len(), 1);
        assert!(matches!(stmts[0], Stmt::Let { .. }));
        let tail = tail.as_ref().expect("tail");
        let ExprKind::Binary { lhs, .. } = &tail.kind else {
            panic!("expected the addition as tail");
        };
        assert!(matches!(lhs.kind, ExprKind::Local(_)));
        assert_eq!(out.functions[0].local_name(LocalId::new(1)), "$t1");
    }

    #[test]
    fn test_literal_operands_stay() {
        let program = ask_program(|f, op| {
            let one = f.i32(1);
            let asked = f.perform(op, vec![]);
            f.add(one, asked)
        });
        let out = normalized(&program);
        assert!(matches!(out.functions[0].body.kind, ExprKind::Binary { .. }));
    }

    #[test]
    fn test_pure_expressions_untouched() {
        let program = ask_program(|f, _| {
            let x = f.var(f.param(0));
            let y = f.var(f.param(0));
            f.add(x, y)
        });
        let out = normalized(&program);
        assert_eq!(out.functions[0].body, program.functions[0].body);
    }

    #[test]
    fn test_finally_desugars_to_block() {
        let program = ask_program(|f, op| {
            let asked = f.perform(op, vec![]);
            let clause = f.clause(op.effect, "ask", &[], false, Type::I32, |f, k, _| {
                let seven = f.i32(7);
                f.resume(k, seven)
            });
            let fin = f.unit();
            f.handle(asked, vec![clause], Some(fin))
        });
        let out = normalized(&program);
        let ExprKind::Block { stmts, tail } = &out.functions[0].body.kind else {
            panic!("expected a block");
        };
        assert_eq!(stmts.len(), 2);
        let Stmt::Let { init: Some(init), .. } = &stmts[0] else {
            panic!("expected the handle in a let");
        };
        assert!(matches!(init.kind, ExprKind::Handle { finally: None, .. }));
        assert!(matches!(tail.as_deref().map(|t| &t.kind), Some(ExprKind::Local(_))));
    }
}
