//! # Liveness
//!
//! Backward live-variable analysis over one lowering unit. The result is the
//! set of locals live right after every call, perform and lifted handle in
//! the unit; site lowering keeps the ones that are sites.
//!
//! Operands are evaluated left to right, so a value read by an earlier
//! operand stays live across every site in a later one.
//!
//! Loops iterate to a fixpoint with `break` flowing to the loop exit and
//! `continue` to the loop head. `return` kills everything. In drive units a
//! tail resumption transfers control back to the dispatch loop, so only the
//! forced locals survive it.

use std::collections::BTreeSet;

use rustc_hash::FxHashMap;

use super::lift::{free_locals, LiftedHandle, LoweringUnit};
use crate::hir::{Expr, ExprId, ExprKind, LocalId, Pattern, Stmt};

pub type LiveSet = BTreeSet<LocalId>;

/// Context of one liveness run.
pub struct LivenessCx<'a> {
    pub lifted: &'a FxHashMap<ExprId, LiftedHandle>,
    /// Locals live everywhere in the unit (drive-unit parameters).
    pub forced: LiveSet,
    /// Continuations whose call transfers control instead of returning.
    pub transfers: LiveSet,
}

/// Live-after sets keyed by expression.
pub fn analyze_unit(unit: &LoweringUnit, cx: &LivenessCx<'_>) -> FxHashMap<ExprId, LiveSet> {
    let mut walker = Walker {
        cx,
        loops: Vec::new(),
        live_after: FxHashMap::default(),
    };
    match &unit.body.kind {
        ExprKind::Handle { clauses, .. } if unit.is_drive() => {
            for clause in clauses {
                walker.live(&clause.body, &cx.forced);
            }
        }
        _ => {
            walker.live(&unit.body, &LiveSet::new());
        }
    }
    walker.live_after
}

struct Walker<'a, 'c> {
    cx: &'a LivenessCx<'c>,
    /// `(break target, continue target)` per enclosing loop.
    loops: Vec<(LiveSet, LiveSet)>,
    live_after: FxHashMap<ExprId, LiveSet>,
}

impl Walker<'_, '_> {
    fn record(&mut self, id: ExprId, out: &LiveSet) {
        self.live_after.insert(id, out.clone());
    }

    /// Locals live before `expr` given those live after it.
    fn live(&mut self, expr: &Expr, out: &LiveSet) -> LiveSet {
        match &expr.kind {
            ExprKind::Literal(_)
            | ExprKind::Def(_)
            | ExprKind::Op { .. }
            | ExprKind::Intrinsic(_) => out.clone(),
            ExprKind::Local(l) => {
                let mut s = out.clone();
                s.insert(*l);
                s
            }
            ExprKind::Assign { local, value } => {
                let mut s = out.clone();
                s.remove(local);
                self.live(value, &s)
            }
            ExprKind::Unary { operand, .. } => self.live(operand, out),
            ExprKind::Field { base, .. } => self.live(base, out),
            ExprKind::Binary { lhs, rhs, .. } => self.live_operands(&[&**lhs, &**rhs], out),
            ExprKind::Tuple(items) => self.live_operands(&items.iter().collect::<Vec<_>>(), out),
            ExprKind::Perform { args, .. } => {
                self.record(expr.id, out);
                self.live_operands(&args.iter().collect::<Vec<_>>(), out)
            }
            ExprKind::Call { callee, args } => {
                if let ExprKind::Local(k) = callee.kind {
                    if self.cx.transfers.contains(&k) {
                        let mut s = self.live_seq(args.iter().rev(), self.cx.forced.clone());
                        s.insert(k);
                        return s;
                    }
                }
                self.record(expr.id, out);
                let operands: Vec<&Expr> = std::iter::once(&**callee).chain(args.iter()).collect();
                self.live_operands(&operands, out)
            }
            ExprKind::Block { stmts, tail } => {
                let mut s = match tail {
                    Some(t) => self.live(t, out),
                    None => out.clone(),
                };
                for stmt in stmts.iter().rev() {
                    s = match stmt {
                        Stmt::Let { local, init } => {
                            s.remove(local);
                            match init {
                                Some(e) => self.live(e, &s),
                                None => s,
                            }
                        }
                        Stmt::Expr(e) => self.live(e, &s),
                    };
                }
                s
            }
            ExprKind::If {
                cond,
                then_branch,
                else_branch,
            } => {
                let mut s = self.live(then_branch, out);
                match else_branch {
                    Some(e) => s.extend(self.live(e, out)),
                    None => s.extend(out.iter().copied()),
                }
                self.live(cond, &s)
            }
            ExprKind::Match { scrutinee, arms } => {
                let mut s = LiveSet::new();
                if !arms.iter().any(|a| a.pattern.is_irrefutable()) {
                    s.extend(out.iter().copied());
                }
                for arm in arms {
                    let mut arm_in = self.live(&arm.body, out);
                    if let Pattern::Binding(l) = arm.pattern {
                        arm_in.remove(&l);
                    }
                    s.extend(arm_in);
                }
                self.live(scrutinee, &s)
            }
            ExprKind::Loop { body } => {
                let mut head = LiveSet::new();
                loop {
                    self.loops.push((out.clone(), head.clone()));
                    let mut next = self.live(body, &head);
                    self.loops.pop();
                    next.extend(head.iter().copied());
                    if next == head {
                        return head;
                    }
                    head = next;
                }
            }
            ExprKind::While { cond, body } => {
                let mut head = LiveSet::new();
                loop {
                    self.loops.push((out.clone(), head.clone()));
                    let mut after_cond = self.live(body, &head);
                    self.loops.pop();
                    after_cond.extend(out.iter().copied());
                    let mut next = self.live(cond, &after_cond);
                    next.extend(head.iter().copied());
                    if next == head {
                        return head;
                    }
                    head = next;
                }
            }
            ExprKind::Break => self.loops.last().map(|(b, _)| b.clone()).unwrap_or_default(),
            ExprKind::Continue => self.loops.last().map(|(_, c)| c.clone()).unwrap_or_default(),
            ExprKind::Return(value) => match value {
                Some(v) => self.live(v, &self.cx.forced.clone()),
                None => self.cx.forced.clone(),
            },
            ExprKind::Handle { body, .. } => match self.cx.lifted.get(&expr.id) {
                Some(lifted) => {
                    self.record(expr.id, out);
                    let mut s = out.clone();
                    s.extend(lifted.body_args.iter().copied());
                    s.extend(lifted.drive_args.iter().copied());
                    s
                }
                None => self.live(body, out),
            },
            ExprKind::Closure { .. } => {
                let mut s = out.clone();
                s.extend(free_locals(expr));
                s
            }
        }
    }

    /// Live-in of operands evaluated in order. Locals read by `operands[..i]`
    /// are held live across `operands[i]`.
    fn live_operands(&mut self, operands: &[&Expr], out: &LiveSet) -> LiveSet {
        let mut s = out.clone();
        for (i, operand) in operands.iter().enumerate().rev() {
            let mut held = s;
            for earlier in &operands[..i] {
                held.extend(reads(earlier));
            }
            s = self.live(operand, &held);
        }
        s
    }

    fn live_seq<'e>(&mut self, rev: impl Iterator<Item = &'e Expr>, out: LiveSet) -> LiveSet {
        let mut s = out;
        for e in rev {
            s = self.live(e, &s);
        }
        s
    }
}

/// Every local `expr` reads.
fn reads(expr: &Expr) -> LiveSet {
    let mut s = LiveSet::new();
    expr.walk_post(&mut |e| {
        if let ExprKind::Local(l) = e.kind {
            s.insert(l);
        }
    });
    s
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CompilerConfig;
    use crate::effects;
    use crate::hir::{FnBuilder, OpRef, ProgramBuilder, Type};
    use crate::mir::lift;
    use rill_runtime::ResumeKind;

    fn run(build: impl FnOnce(&mut FnBuilder<'_>, OpRef) -> Expr) -> (FxHashMap<ExprId, LiveSet>, crate::hir::Program) {
        let mut b = ProgramBuilder::new();
        let ask = b.effect(
            "Ask",
            vec![ProgramBuilder::op("ask", vec![], Type::I32, ResumeKind::Tail)],
        );
        let op = OpRef::new(ask, 0);
        b.function("f", &[("x", Type::I32), ("y", Type::I32)], Type::I32, |f| build(f, op));
        let program = b.finish();
        let analysis = effects::analyze(&program, &CompilerConfig::default());
        let lifted = lift::lift(&program, &analysis);
        let cx = LivenessCx {
            lifted: &lifted.lifted,
            forced: LiveSet::new(),
            transfers: LiveSet::new(),
        };
        (analyze_unit(&lifted.units[0], &cx), program)
    }

    fn perform_ids(program: &crate::hir::Program) -> Vec<ExprId> {
        let mut ids = Vec::new();
        program.functions[0].body.walk_post(&mut |e| {
            if matches!(e.kind, ExprKind::Perform { .. }) {
                ids.push(e.id);
            }
        });
        ids
    }

    #[test]
    fn test_only_later_uses_are_live() {
        let (live, program) = run(|f, op| {
            let t = f.local("t", Type::I32);
            let asked = f.perform(op, vec![]);
            let read_t = f.var(t);
            let read_y = f.var(f.param(1));
            let sum = f.add(read_t, read_y);
            f.block(vec![FnBuilder::let_(t, asked)], Some(sum))
        });
        let ids = perform_ids(&program);
        // `t` is defined by the perform's result, `x` is never read again.
        assert_eq!(live[&ids[0]], [LocalId::new(1)].into_iter().collect());
    }

    #[test]
    fn test_loop_keeps_loop_carried_locals() {
        let (live, program) = run(|f, op| {
            let x = f.var(f.param(0));
            let zero = f.i32(0);
            let negative = f.lt(x, zero);
            let leave = f.break_();
            let check = f.if_(negative, leave, None);
            let asked = f.perform(op, vec![]);
            let body = f.block(vec![FnBuilder::stmt(check), FnBuilder::stmt(asked)], None);
            let looped = f.loop_(body);
            let result = f.i32(0);
            f.block(vec![FnBuilder::stmt(looped)], Some(result))
        });
        let ids = perform_ids(&program);
        // `x` is read again at the top of the next iteration.
        assert_eq!(live[&ids[0]], [LocalId::new(0)].into_iter().collect());
    }

    #[test]
    fn test_left_operand_survives_a_site_on_the_right() {
        let (live, program) = run(|f, op| {
            let x = f.var(f.param(0));
            let asked = f.perform(op, vec![]);
            f.add(x, asked)
        });
        let ids = perform_ids(&program);
        // `x` was read before the perform and is added after it resumes.
        assert_eq!(live[&ids[0]], [LocalId::new(0)].into_iter().collect());
    }

    #[test]
    fn test_earlier_tuple_items_survive_a_later_site() {
        let (live, program) = run(|f, op| {
            let x = f.var(f.param(0));
            let y = f.var(f.param(1));
            let asked = f.perform(op, vec![]);
            let tuple = f.tuple(vec![x, y, asked]);
            let zero = f.i32(0);
            f.block(vec![FnBuilder::stmt(tuple)], Some(zero))
        });
        let ids = perform_ids(&program);
        assert_eq!(live[&ids[0]], [LocalId::new(0), LocalId::new(1)].into_iter().collect());
    }
}
