//! # Effect Inference
//!
//! Assigns an effect row to every function and `handle` expression.
//!
//! ```text
//! row(perform op)      = {op} ∪ row(args)
//! row(f(args))         = row(f) ∪ row(args)
//! row(handle ...)      = see handler checking
//! row(closure)         = row(body)      attributed to the defining function
//! row(anything else)   = ∪ row(children)
//! ```
//!
//! Function rows depend on each other through calls, so inference iterates
//! over all functions until no row changes. Rows only grow and the set of
//! operations is finite, so the iteration terminates. Diagnostics are
//! collected on one final pass over the stable rows.

use rustc_hash::FxHashMap;
use tracing::{debug, trace};

use super::handler::{HandlerChecker, HandlerResolution};
use super::row::{RowId, RowStore, RowVar};
use crate::config::CompilerConfig;
use crate::diagnostics::{Diagnostic, ErrorCode};
use crate::hir::{DefId, Expr, ExprId, ExprKind, FnDecl, Program};

/// Result of effect inference and handler checking for a whole program.
#[derive(Debug)]
pub struct EffectAnalysis {
    pub rows: RowStore,
    /// Row of each function.
    pub fn_rows: FxHashMap<DefId, RowId>,
    /// Resolution of each `handle` expression.
    pub handlers: FxHashMap<ExprId, HandlerResolution>,
    pub diagnostics: Vec<Diagnostic>,
}

impl EffectAnalysis {
    pub fn fn_row(&self, def: DefId) -> RowId {
        self.fn_rows.get(&def).copied().unwrap_or(RowId::PURE)
    }

    /// Whether calling `def` may perform an operation.
    pub fn is_effectful(&self, def: DefId) -> bool {
        !self.rows.is_empty(self.fn_row(def))
    }

    pub fn handler(&self, handle: ExprId) -> Option<&HandlerResolution> {
        self.handlers.get(&handle)
    }

    pub fn has_errors(&self) -> bool {
        crate::diagnostics::has_errors(&self.diagnostics)
    }
}

/// Infer rows for every function and check every handler.
pub fn analyze(program: &Program, config: &CompilerConfig) -> EffectAnalysis {
    let mut inferencer = Inferencer::new(program, config);
    inferencer.run();
    inferencer.finish()
}

struct Inferencer<'p> {
    program: &'p Program,
    exhaustive: bool,
    rows: RowStore,
    fn_rows: FxHashMap<DefId, RowId>,
    fn_tails: FxHashMap<DefId, RowVar>,
    handlers: FxHashMap<ExprId, HandlerResolution>,
    diagnostics: Vec<Diagnostic>,
}

impl<'p> Inferencer<'p> {
    fn new(program: &'p Program, config: &CompilerConfig) -> Self {
        let mut rows = RowStore::new();
        let mut fn_tails = FxHashMap::default();
        for function in &program.functions {
            if function.effects.as_ref().is_some_and(|d| d.open) {
                fn_tails.insert(function.def, rows.fresh_row_var());
            }
        }
        Self {
            program,
            exhaustive: config.exhaustive_handlers,
            rows,
            fn_rows: FxHashMap::default(),
            fn_tails,
            handlers: FxHashMap::default(),
            diagnostics: Vec::new(),
        }
    }

    fn run(&mut self) {
        let limit = self.program.functions.len() * 4 + 8;
        let mut iterations = 0;
        loop {
            iterations += 1;
            let mut changed = false;
            for function in &self.program.functions {
                let mut scratch = Vec::new();
                let row = self.infer_fn(function, &mut scratch);
                if self.fn_rows.insert(function.def, row) != Some(row) {
                    changed = true;
                }
            }
            if !changed {
                break;
            }
            if iterations >= limit {
                crate::ice!("row inference did not converge"; "iterations" => iterations);
                break;
            }
        }
        debug!(iterations, functions = self.program.functions.len(), "row inference converged");

        // Final pass: rows are stable, collect diagnostics once.
        self.handlers.clear();
        let mut diagnostics = Vec::new();
        for function in &self.program.functions {
            let row = self.infer_fn(function, &mut diagnostics);
            self.check_declared(function, row, &mut diagnostics);
            trace!(function = %function.name, row = %self.rows.display(row), "function row");
        }
        self.diagnostics = diagnostics;
    }

    fn finish(self) -> EffectAnalysis {
        EffectAnalysis {
            rows: self.rows,
            fn_rows: self.fn_rows,
            handlers: self.handlers,
            diagnostics: self.diagnostics,
        }
    }

    fn infer_fn(&mut self, function: &FnDecl, diagnostics: &mut Vec<Diagnostic>) -> RowId {
        let body = self.expr(&function.body, diagnostics);
        match self.fn_tails.get(&function.def) {
            Some(var) => {
                let tail = self.rows.intern(Vec::new(), Some(*var));
                self.rows.compose(&[body, tail])
            }
            None => body,
        }
    }

    fn check_declared(&mut self, function: &FnDecl, row: RowId, diagnostics: &mut Vec<Diagnostic>) {
        let Some(declared) = &function.effects else {
            return;
        };
        if declared.open {
            return;
        }
        let missing: Vec<&str> = self
            .rows
            .labels(row)
            .into_iter()
            .filter(|label| !declared.ops.iter().any(|d| d == label))
            .collect();
        if !missing.is_empty() {
            diagnostics.push(Diagnostic::coded(
                ErrorCode::UndeclaredEffects,
                format!(
                    "`{}` performs operations outside its declared row: {}",
                    function.name,
                    missing.join(", ")
                ),
                function.span,
            ));
        }
    }

    fn expr(&mut self, expr: &Expr, diagnostics: &mut Vec<Diagnostic>) -> RowId {
        match &expr.kind {
            ExprKind::Perform { op, args, .. } => {
                let mut parts: Vec<RowId> = args.iter().map(|a| self.expr(a, diagnostics)).collect();
                if let Some(decl) = self.program.op(*op) {
                    let label = self.program.op_label(*op);
                    let effect_op = self.rows.op(&label, op.effect, decl.kind);
                    parts.push(self.rows.intern([effect_op], None));
                } else {
                    diagnostics.push(crate::ice_err!(expr.span, "perform of undeclared operation {:?}", op));
                }
                self.rows.compose(&parts)
            }
            ExprKind::Call { callee, args } => {
                let mut parts = vec![self.expr(callee, diagnostics)];
                parts.extend(args.iter().map(|a| self.expr(a, diagnostics)));
                if let ExprKind::Def(def) = callee.kind {
                    parts.push(self.fn_rows.get(&def).copied().unwrap_or(RowId::PURE));
                }
                self.rows.compose(&parts)
            }
            ExprKind::Handle {
                body,
                clauses,
                finally,
            } => {
                let body_row = self.expr(body, diagnostics);
                let clause_rows: Vec<RowId> = clauses.iter().map(|c| self.expr(&c.body, diagnostics)).collect();
                let finally_row = finally.as_ref().map(|f| self.expr(f, diagnostics));
                let resolution = HandlerChecker::new(self.program, &mut self.rows, self.exhaustive).check(
                    expr,
                    body_row,
                    &clause_rows,
                    finally_row,
                    diagnostics,
                );
                let row = resolution.result_row;
                self.handlers.insert(expr.id, resolution);
                row
            }
            _ => {
                let mut parts = Vec::new();
                expr.for_each_child(&mut |child| parts.push(self.expr(child, diagnostics)));
                self.rows.compose(&parts)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hir::{FnBuilder, OpRef, ProgramBuilder, Type};
    use rill_runtime::ResumeKind;

    fn state_program() -> (ProgramBuilder, OpRef, OpRef) {
        let mut b = ProgramBuilder::new();
        let state = b.effect(
            "State",
            vec![
                ProgramBuilder::op("get", vec![], Type::I32, ResumeKind::Tail),
                ProgramBuilder::op("put", vec![Type::I32], Type::Unit, ResumeKind::Tail),
            ],
        );
        (b, OpRef::new(state, 0), OpRef::new(state, 1))
    }

    #[test]
    fn test_rows_flow_through_calls() {
        let (mut b, get, _) = state_program();
        // `a` calls `b` before `b` is defined, so the first pass sees `b` as pure.
        let leaf = b.declare_fn("leaf", &[], Type::I32);
        let caller = b.function("caller", &[], Type::I32, |f| f.call(leaf, vec![]));
        b.define_fn(leaf, |f| f.perform(get, vec![]));
        let program = b.finish();
        let analysis = analyze(&program, &CompilerConfig::default());
        assert!(analysis.diagnostics.is_empty(), "{:?}", analysis.diagnostics);
        assert_eq!(analysis.rows.labels(analysis.fn_row(caller)), vec!["State.get"]);
        assert!(analysis.is_effectful(caller));
    }

    #[test]
    fn test_recursive_functions_converge() {
        let (mut b, get, put) = state_program();
        let even = b.declare_fn("even", &[("n", Type::I32)], Type::I32);
        let odd = b.declare_fn("odd", &[("n", Type::I32)], Type::I32);
        b.define_fn(even, |f| {
            let n = f.var(f.param(0));
            let read = f.perform(get, vec![]);
            let sum = f.add(n, read);
            f.call(odd, vec![sum])
        });
        b.define_fn(odd, |f| {
            let n = f.var(f.param(0));
            let write = f.perform(put, vec![n]);
            let call = {
                let n = f.var(f.param(0));
                f.call(even, vec![n])
            };
            f.block(vec![FnBuilder::stmt(write)], Some(call))
        });
        let program = b.finish();
        let analysis = analyze(&program, &CompilerConfig::default());
        assert_eq!(analysis.fn_row(even), analysis.fn_row(odd));
        assert_eq!(analysis.rows.labels(analysis.fn_row(odd)), vec!["State.get", "State.put"]);
    }

    #[test]
    fn test_undeclared_effects() {
        let (mut b, get, _) = state_program();
        let f = b.function("f", &[], Type::I32, |f| f.perform(get, vec![]));
        b.declare_effects(f, &["State.put"], false);
        let g = b.function("g", &[], Type::I32, |f| f.perform(get, vec![]));
        b.declare_effects(g, &[], true);
        let program = b.finish();
        let analysis = analyze(&program, &CompilerConfig::default());
        assert_eq!(analysis.diagnostics.len(), 1);
        assert_eq!(analysis.diagnostics[0].slug(), Some("undeclared-effects"));
        assert!(analysis.rows.is_open(analysis.fn_row(g)));
    }

    #[test]
    fn test_closure_effects_belong_to_definer() {
        let (mut b, get, _) = state_program();
        let f = b.function("f", &[], Type::Unit, |f| {
            let closure = f.closure(&[], Type::I32, |f, _| f.perform(get, vec![]));
            let tmp = f.local("c", closure.ty.clone());
            let unit = f.unit();
            f.block(vec![FnBuilder::let_(tmp, closure)], Some(unit))
        });
        let program = b.finish();
        let analysis = analyze(&program, &CompilerConfig::default());
        assert!(analysis.is_effectful(f));
    }
}
