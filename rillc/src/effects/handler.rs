//! # Handler Checking
//!
//! Resolves the clauses of each `handle` expression against the declared
//! operations, types their continuations, checks tail-resumption usage and
//! computes the row of the handle expression.
//!
//! ## Overload Resolution
//!
//! Overloads of an operation share a name. A clause for a name with a single
//! declaration may omit parameter annotations. When several declarations
//! share the name the annotations are mandatory, and exactly one overload must
//! match them; a generic parameter in a declaration matches any annotation.
//!
//! ## Rows
//!
//! ```text
//! row(handle) = (row(body) - handled names) ∪ row(clauses) ∪ row(finally)
//! ```
//!
//! The continuation of a clause is typed `cont(opReturn) -> handlerType` and
//! tagged with the body row minus every handled name: resuming it may raise
//! whatever the handler does not cover.

use rill_runtime::ResumeKind;

use super::row::{OpName, RowId, RowStore};
use super::usage::{self, ContinuationUsage, Enforcement};
use crate::diagnostics::{Diagnostic, ErrorCode};
use crate::hir::{Expr, ExprId, ExprKind, HandlerClause, OpDecl, OpRef, Program, Type};

/// The type of a clause's continuation.
#[derive(Debug, Clone, PartialEq)]
pub struct ContinuationType {
    /// The value the continuation is resumed with (the operation's return type).
    pub param: Type,
    /// The result of resuming (the handle expression's type).
    pub ret: Type,
    /// Operations the resumed computation may still raise.
    pub row: RowId,
}

/// A clause resolved to one operation.
#[derive(Debug, Clone, PartialEq)]
pub struct ClauseResolution {
    pub op: OpRef,
    /// `Effect.op`.
    pub label: String,
    pub kind: ResumeKind,
    /// Parameter types after generic instantiation.
    pub params: Vec<Type>,
    /// Generic arguments inferred from the guarded body.
    pub type_args: Vec<Type>,
    pub continuation: ContinuationType,
    /// Usage bounds; only computed for tail operations.
    pub usage: Option<ContinuationUsage>,
    /// Enforcement of the single-resumption rule; only for tail operations.
    pub enforcement: Option<Enforcement>,
}

impl ClauseResolution {
    /// Whether resumption must be counted at run time.
    pub fn needs_guard(&self) -> bool {
        self.enforcement == Some(Enforcement::Runtime)
    }
}

/// Everything later passes need to know about one `handle` expression.
#[derive(Debug, Clone, PartialEq)]
pub struct HandlerResolution {
    pub handle: ExprId,
    pub body_row: RowId,
    /// Body row minus every handled name.
    pub continuation_row: RowId,
    /// Row of the whole handle expression.
    pub result_row: RowId,
    /// One entry per clause, in clause order; `None` when the clause failed
    /// to resolve.
    pub clauses: Vec<Option<ClauseResolution>>,
}

impl HandlerResolution {
    pub fn clause(&self, index: usize) -> Option<&ClauseResolution> {
        self.clauses.get(index).and_then(Option::as_ref)
    }
}

/// Checks handle expressions.
pub struct HandlerChecker<'a> {
    program: &'a Program,
    rows: &'a mut RowStore,
    exhaustive: bool,
}

impl<'a> HandlerChecker<'a> {
    pub fn new(program: &'a Program, rows: &'a mut RowStore, exhaustive: bool) -> Self {
        Self {
            program,
            rows,
            exhaustive,
        }
    }

    /// Check one `handle` expression given the rows of its parts.
    pub fn check(
        &mut self,
        handle: &Expr,
        body_row: RowId,
        clause_rows: &[RowId],
        finally_row: Option<RowId>,
        diagnostics: &mut Vec<Diagnostic>,
    ) -> HandlerResolution {
        let ExprKind::Handle { body, clauses, .. } = &handle.kind else {
            diagnostics.push(crate::ice_err!(handle.span, "handler check on a non-handle expression"));
            return HandlerResolution {
                handle: handle.id,
                body_row,
                continuation_row: body_row,
                result_row: body_row,
                clauses: Vec::new(),
            };
        };

        let handled: Vec<OpName> = clauses
            .iter()
            .filter_map(|c| self.clause_label(c))
            .filter_map(|label| self.rows.lookup_name(&label))
            .collect();
        let continuation_row = self.rows.drop_all(body_row, &handled);

        let mut resolved = Vec::with_capacity(clauses.len());
        for clause in clauses {
            let resolution = match self.resolve_overload(clause) {
                Ok((op, decl)) => self.resolve_clause(clause, op, decl, body, handle, continuation_row, diagnostics),
                Err(diag) => {
                    diagnostics.push(diag);
                    None
                }
            };
            resolved.push(resolution);
        }

        let mut parts = vec![continuation_row];
        parts.extend_from_slice(clause_rows);
        parts.extend(finally_row);
        let result_row = self.rows.compose(&parts);

        if self.exhaustive && !self.rows.is_open(result_row) {
            let leftovers: Vec<String> = self
                .rows
                .ops(continuation_row)
                .iter()
                .filter(|op| !clause_rows.iter().any(|r| self.rows.contains(*r, op.name)))
                .map(|op| self.rows.name(op.name).to_string())
                .collect();
            if !leftovers.is_empty() {
                diagnostics.push(Diagnostic::coded(
                    ErrorCode::UnhandledEffects,
                    format!("handler leaves operations unhandled: {}", leftovers.join(", ")),
                    handle.span,
                ));
            }
        }

        tracing::trace!(
            handle = ?handle.id,
            body = %self.rows.display(body_row),
            result = %self.rows.display(result_row),
            "checked handler"
        );

        HandlerResolution {
            handle: handle.id,
            body_row,
            continuation_row,
            result_row,
            clauses: resolved,
        }
    }

    fn clause_label(&self, clause: &HandlerClause) -> Option<String> {
        let effect = self.program.effect(clause.effect)?;
        Some(format!("{}.{}", effect.name, clause.op))
    }

    /// Pick the operation a clause handles.
    pub fn resolve_overload(&self, clause: &HandlerClause) -> Result<(OpRef, &'a OpDecl), Diagnostic> {
        let program = self.program;
        let Some(effect) = program.effect(clause.effect) else {
            return Err(Diagnostic::coded(
                ErrorCode::EffectUnknownOperation,
                format!("clause names unknown effect {}", clause.effect),
                clause.span,
            ));
        };
        let label = format!("{}.{}", effect.name, clause.op);
        let candidates: Vec<(u32, &'a OpDecl)> = effect.ops_named(&clause.op);

        let (index, decl) = match candidates.as_slice() {
            [] => {
                return Err(Diagnostic::coded(
                    ErrorCode::EffectUnknownOperation,
                    format!("effect `{}` has no operation `{}`", effect.name, clause.op),
                    clause.span,
                ))
            }
            [single] => {
                if let Some(annotations) = &clause.annotations {
                    if !annotations_match(annotations, &single.1.params) {
                        return Err(Diagnostic::coded(
                            ErrorCode::EffectHandlerAnnotation,
                            format!(
                                "clause annotations ({}) do not match `{label}`",
                                render_types(annotations)
                            ),
                            clause.span,
                        ));
                    }
                }
                *single
            }
            many => {
                let Some(annotations) = &clause.annotations else {
                    return Err(Diagnostic::coded(
                        ErrorCode::EffectHandlerAnnotation,
                        format!(
                            "`{label}` has {} overloads; the clause must annotate its parameter types",
                            many.len()
                        ),
                        clause.span,
                    ));
                };
                let matching: Vec<&(u32, &'a OpDecl)> = many
                    .iter()
                    .filter(|(_, decl)| annotations_match(annotations, &decl.params))
                    .collect();
                match matching.as_slice() {
                    [one] => **one,
                    none_or_many => {
                        return Err(Diagnostic::coded(
                            ErrorCode::EffectHandlerOverload,
                            format!(
                                "{} overloads of `{label}` match ({})",
                                none_or_many.len(),
                                render_types(annotations)
                            ),
                            clause.span,
                        ))
                    }
                }
            }
        };

        if clause.params.len() != decl.params.len() {
            return Err(Diagnostic::coded(
                ErrorCode::EffectHandlerAnnotation,
                format!(
                    "clause for `{label}` binds {} parameters, the operation takes {}",
                    clause.params.len(),
                    decl.params.len()
                ),
                clause.span,
            ));
        }
        Ok((OpRef::new(clause.effect, index), decl))
    }

    #[allow(clippy::too_many_arguments)]
    fn resolve_clause(
        &mut self,
        clause: &HandlerClause,
        op: OpRef,
        decl: &OpDecl,
        body: &Expr,
        handle: &Expr,
        continuation_row: RowId,
        diagnostics: &mut Vec<Diagnostic>,
    ) -> Option<ClauseResolution> {
        let label = self.program.op_label(op);

        let type_args = if decl.generics > 0 {
            match instantiations(body, op).as_slice() {
                [] => Vec::new(),
                [one] => one.clone(),
                several => {
                    let rendered: Vec<String> = several.iter().map(|args| format!("<{}>", render_types(args))).collect();
                    diagnostics.push(Diagnostic::coded(
                        ErrorCode::EffectGenericMismatch,
                        format!(
                            "`{label}` is performed at inconsistent instantiations {}",
                            rendered.join(", ")
                        ),
                        clause.span,
                    ));
                    return None;
                }
            }
        } else {
            Vec::new()
        };

        let continuation = ContinuationType {
            param: decl.ret.substitute(&type_args),
            ret: handle.ty.clone(),
            row: continuation_row,
        };

        let (usage, enforcement) = if decl.kind == ResumeKind::Tail {
            let (usage, diagnostic) = usage::check_clause(clause, &label);
            diagnostics.extend(diagnostic);
            (Some(usage), Some(usage.enforcement()))
        } else {
            (None, None)
        };

        Some(ClauseResolution {
            op,
            label,
            kind: decl.kind,
            params: decl.params.iter().map(|t| t.substitute(&type_args)).collect(),
            type_args,
            continuation,
            usage,
            enforcement,
        })
    }
}

fn annotations_match(annotations: &[Type], params: &[Type]) -> bool {
    annotations.len() == params.len() && annotations.iter().zip(params).all(|(a, p)| p.matches(a))
}

fn render_types(types: &[Type]) -> String {
    types.iter().map(Type::to_string).collect::<Vec<_>>().join(", ")
}

/// Distinct generic instantiations of `op` performed inside `body`, in
/// order of first occurrence.
fn instantiations(body: &Expr, op: OpRef) -> Vec<Vec<Type>> {
    let mut found: Vec<Vec<Type>> = Vec::new();
    body.walk(&mut |e| {
        if let ExprKind::Perform {
            op: performed,
            type_args,
            ..
        } = &e.kind
        {
            if *performed == op && !type_args.is_empty() && !found.contains(type_args) {
                found.push(type_args.clone());
            }
        }
    });
    found
}
