//! # Handler Lifting
//!
//! Splits every `handle` expression whose guarded body is effectful into two
//! lowering units:
//!
//! - a **body unit** `<fn>$body<n>` running the guarded body, with the body's
//!   free locals as parameters
//! - a **drive unit** `<fn>$drive<n>` that inspects the body's outcome and
//!   dispatches it to the clauses, with the clauses' free locals as
//!   parameters
//!
//! The handle expression stays in its enclosing unit with an empty body and
//! no clauses; [`LiftedHandle`] records how to call the two units. Handles
//! with a pure body are left alone: their clauses can never run.
//!
//! Units are listed in pre-order: a function, then for each lifted handle
//! its body unit, the units nested in the body, its drive unit and the units
//! nested in its clauses.
//!
//! Free locals are passed by value. Assigning one inside a lifted region, or
//! leaving the region with `return`, `break` or `continue`, is reported as
//! `structural-unsupported`. A `return` inside a clause returns from the
//! clause.

use std::collections::BTreeSet;

use rustc_hash::FxHashMap;
use tracing::debug;

use crate::diagnostics::{Diagnostic, ErrorCode};
use crate::effects::EffectAnalysis;
use crate::hir::{DefId, Expr, ExprId, ExprKind, FnDecl, Literal, LocalId, Pattern, Program, Stmt, Type};

/// What a lowering unit runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnitKind {
    /// A source function.
    Function,
    /// The guarded body of a lifted handle.
    Body { handle: ExprId },
    /// The clause dispatch loop of a lifted handle.
    Drive { handle: ExprId },
}

/// One function-like piece of code the backends emit separately.
#[derive(Debug, Clone, PartialEq)]
pub struct LoweringUnit {
    pub name: String,
    pub kind: UnitKind,
    /// The source function the code came from.
    pub owner: DefId,
    pub params: Vec<LocalId>,
    /// For drive units, the handle expression itself with an empty body.
    pub body: Expr,
    pub result: Type,
    /// Whether the unit returns outcomes and can be resumed.
    pub effectful: bool,
}

impl LoweringUnit {
    pub fn is_drive(&self) -> bool {
        matches!(self.kind, UnitKind::Drive { .. })
    }
}

/// How a lifted handle calls its units.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LiftedHandle {
    pub body_unit: usize,
    pub drive_unit: usize,
    pub body_args: Vec<LocalId>,
    pub drive_args: Vec<LocalId>,
}

/// All units of a program.
#[derive(Debug, Clone, Default)]
pub struct LiftedProgram {
    pub units: Vec<LoweringUnit>,
    pub lifted: FxHashMap<ExprId, LiftedHandle>,
    pub diagnostics: Vec<Diagnostic>,
}

impl LiftedProgram {
    pub fn function_unit(&self, def: DefId) -> Option<usize> {
        self.units
            .iter()
            .position(|u| u.owner == def && u.kind == UnitKind::Function)
    }
}

/// Split `program` (already normalized) into lowering units.
pub fn lift(program: &Program, analysis: &EffectAnalysis) -> LiftedProgram {
    let mut out = LiftedProgram::default();
    for function in &program.functions {
        let mut lifter = Lifter {
            analysis,
            function,
            counter: 0,
            out: &mut out,
        };
        lifter.function();
    }
    debug!(units = out.units.len(), lifted = out.lifted.len(), "lifted handlers");
    out
}

struct Lifter<'a> {
    analysis: &'a EffectAnalysis,
    function: &'a FnDecl,
    counter: u32,
    out: &'a mut LiftedProgram,
}

impl Lifter<'_> {
    fn function(&mut self) {
        let f = self.function;
        let index = self.reserve(LoweringUnit {
            name: f.name.clone(),
            kind: UnitKind::Function,
            owner: f.def,
            params: f.params.clone(),
            body: placeholder(&f.body),
            result: f.ret.clone(),
            effectful: self.analysis.is_effectful(f.def),
        });
        let mut body = f.body.clone();
        self.lift_within(&mut body);
        self.out.units[index].body = body;
    }

    fn reserve(&mut self, unit: LoweringUnit) -> usize {
        self.out.units.push(unit);
        self.out.units.len() - 1
    }

    fn is_liftable(&self, expr: &Expr) -> bool {
        matches!(expr.kind, ExprKind::Handle { .. })
            && self
                .analysis
                .handler(expr.id)
                .is_some_and(|h| !self.analysis.rows.is_empty(h.body_row))
    }

    fn lift_within(&mut self, expr: &mut Expr) {
        if self.is_liftable(expr) {
            self.lift_handle(expr);
            return;
        }
        expr.for_each_child_mut(&mut |child| self.lift_within(child));
    }

    fn lift_handle(&mut self, handle: &mut Expr) {
        let ExprKind::Handle { body, clauses, .. } = &mut handle.kind else {
            return;
        };
        let n = self.counter;
        self.counter += 1;
        let owner = self.function;
        let result = handle.ty.clone();

        let hole = placeholder(body);
        let mut guarded = std::mem::replace(body.as_mut(), hole);
        let clauses = std::mem::take(clauses);

        let body_args = free_locals(&guarded);
        let body_unit = self.reserve(LoweringUnit {
            name: format!("{}$body{}", owner.name, n),
            kind: UnitKind::Body { handle: handle.id },
            owner: owner.def,
            params: body_args.clone(),
            body: placeholder(&guarded),
            result: result.clone(),
            effectful: true,
        });
        self.lift_within(&mut guarded);
        self.check_region(&guarded, &body_args, false);
        self.out.units[body_unit].body = guarded;

        let mut drive = Expr {
            id: handle.id,
            kind: ExprKind::Handle {
                body: Box::new(placeholder(handle)),
                clauses,
                finally: None,
            },
            ty: result.clone(),
            span: handle.span,
        };
        let drive_args = free_locals(&drive);
        let drive_unit = self.reserve(LoweringUnit {
            name: format!("{}$drive{}", owner.name, n),
            kind: UnitKind::Drive { handle: handle.id },
            owner: owner.def,
            params: drive_args.clone(),
            body: placeholder(handle),
            result,
            effectful: true,
        });
        if let ExprKind::Handle { clauses, .. } = &mut drive.kind {
            for clause in clauses.iter_mut() {
                self.lift_within(&mut clause.body);
            }
        }
        if let ExprKind::Handle { clauses, .. } = &drive.kind {
            for clause in clauses {
                self.check_region(&clause.body, &drive_args, true);
            }
        }
        self.out.units[drive_unit].body = drive;

        self.out.lifted.insert(
            handle.id,
            LiftedHandle {
                body_unit,
                drive_unit,
                body_args,
                drive_args,
            },
        );
    }

    /// Report code that cannot cross a unit boundary.
    fn check_region(&mut self, region: &Expr, free: &[LocalId], is_clause: bool) {
        let mut found = Vec::new();
        check_escapes(region, free, is_clause, 0, &mut found);
        for (span, what) in found {
            self.out.diagnostics.push(Diagnostic::coded(
                ErrorCode::StructuralUnsupported,
                format!("{what} inside a handled region of `{}`", self.function.name),
                span,
            ));
        }
    }
}

fn check_escapes(
    expr: &Expr,
    free: &[LocalId],
    is_clause: bool,
    loops: usize,
    found: &mut Vec<(crate::span::Span, String)>,
) {
    match &expr.kind {
        ExprKind::Assign { local, .. } if free.contains(local) => {
            found.push((expr.span, format!("assignment to captured local {local}")));
        }
        ExprKind::Return(_) if !is_clause => found.push((expr.span, "`return`".into())),
        ExprKind::Break if loops == 0 => found.push((expr.span, "`break` out of the region".into())),
        ExprKind::Continue if loops == 0 => found.push((expr.span, "`continue` out of the region".into())),
        ExprKind::Loop { .. } | ExprKind::While { .. } => {
            expr.for_each_child(&mut |c| check_escapes(c, free, is_clause, loops + 1, found));
            return;
        }
        // Closures are rejected by the structural backend as a whole.
        ExprKind::Closure { .. } => return,
        _ => {}
    }
    expr.for_each_child(&mut |c| check_escapes(c, free, is_clause, loops, found));
}

fn placeholder(like: &Expr) -> Expr {
    Expr {
        id: like.id,
        kind: ExprKind::Literal(Literal::Unit),
        ty: Type::Unit,
        span: like.span,
    }
}

/// Locals read or assigned in `expr` but declared outside it, by index.
pub fn free_locals(expr: &Expr) -> Vec<LocalId> {
    let mut used = BTreeSet::new();
    let mut declared = BTreeSet::new();
    expr.walk(&mut |e| match &e.kind {
        ExprKind::Local(l) | ExprKind::Assign { local: l, .. } => {
            used.insert(*l);
        }
        ExprKind::Block { stmts, .. } => {
            for stmt in stmts {
                if let Stmt::Let { local, .. } = stmt {
                    declared.insert(*local);
                }
            }
        }
        ExprKind::Match { arms, .. } => {
            for arm in arms {
                if let Pattern::Binding(l) = arm.pattern {
                    declared.insert(l);
                }
            }
        }
        ExprKind::Handle { clauses, .. } => {
            for clause in clauses {
                declared.insert(clause.continuation);
                declared.extend(clause.params.iter().copied());
            }
        }
        ExprKind::Closure { params, .. } => declared.extend(params.iter().copied()),
        _ => {}
    });
    used.difference(&declared).copied().collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CompilerConfig;
    use crate::effects;
    use crate::hir::{FnBuilder, OpRef, ProgramBuilder};
    use rill_runtime::ResumeKind;

    fn build(body: impl FnOnce(&mut FnBuilder<'_>, OpRef) -> Expr) -> (Program, LiftedProgram) {
        let mut b = ProgramBuilder::new();
        let ask = b.effect(
            "Ask",
            vec![ProgramBuilder::op("ask", vec![], Type::I32, ResumeKind::Tail)],
        );
        let op = OpRef::new(ask, 0);
        b.function("f", &[("x", Type::I32)], Type::I32, |f| body(f, op));
        let program = b.finish();
        let analysis = effects::analyze(&program, &CompilerConfig::default());
        let lifted = lift(&program, &analysis);
        (program, lifted)
    }

    fn handled(f: &mut FnBuilder<'_>, op: OpRef, body: Expr) -> Expr {
        let clause = f.clause(op.effect, "ask", &[], false, Type::I32, |f, k, _| {
            let x = f.var(f.param(0));
            f.resume(k, x)
        });
        f.handle(body, vec![clause], None)
    }

    #[test]
    fn test_units_in_pre_order() {
        let (_, lifted) = build(|f, op| {
            let inner_body = f.perform(op, vec![]);
            let inner = handled(f, op, inner_body);
            let outer_body = {
                let asked = f.perform(op, vec![]);
                f.add(inner, asked)
            };
            handled(f, op, outer_body)
        });
        let names: Vec<&str> = lifted.units.iter().map(|u| u.name.as_str()).collect();
        assert_eq!(names, vec!["f", "f$body0", "f$body1", "f$drive1", "f$drive0"]);
        assert!(!lifted.units[0].effectful);
        assert!(lifted.units[1..].iter().all(|u| u.effectful));
        assert!(lifted.diagnostics.is_empty());
    }

    #[test]
    fn test_free_locals_become_params() {
        let (program, lifted) = build(|f, op| {
            let x = f.var(f.param(0));
            let asked = f.perform(op, vec![]);
            let body = f.add(x, asked);
            handled(f, op, body)
        });
        let handle = lifted.lifted.values().next().expect("one lifted handle");
        let x = program.functions[0].params[0];
        assert_eq!(handle.body_args, vec![x]);
        assert_eq!(handle.drive_args, vec![x]);
        assert_eq!(lifted.units[handle.drive_unit].params, vec![x]);
    }

    #[test]
    fn test_pure_handle_not_lifted() {
        let (_, lifted) = build(|f, op| {
            let body = f.i32(3);
            handled(f, op, body)
        });
        assert_eq!(lifted.units.len(), 1);
        assert!(lifted.lifted.is_empty());
    }

    #[test]
    fn test_assigning_captured_local_is_unsupported() {
        let (_, lifted) = build(|f, op| {
            let asked = f.perform(op, vec![]);
            let assign = f.assign(f.param(0), asked);
            let x = f.var(f.param(0));
            let body = f.block(vec![FnBuilder::stmt(assign)], Some(x));
            handled(f, op, body)
        });
        assert_eq!(lifted.diagnostics.len(), 1);
        assert_eq!(lifted.diagnostics[0].slug(), Some("structural-unsupported"));
    }
}
