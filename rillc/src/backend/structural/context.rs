//! Per-unit emission state.

use rill_runtime::module::{Function, Instr, Label, LocalIdx, TrapCode, ValType};
use rill_runtime::ResumeKind;
use rustc_hash::FxHashMap;

use super::{val_type, ModuleLayout, ENV, OUTCOME};
use crate::diagnostics::{Diagnostic, ErrorCode};
use crate::effects::EffectAnalysis;
use crate::hir::{Expr, ExprId, ExprKind, FnDecl, LocalId, Type};
use crate::mir::{EffectMetadata, LoweredProgram, LoweringUnit, UnitKind};
use crate::span::Span;

pub(super) const STARTED: LocalIdx = 0;
pub(super) const ACTIVE: LocalIdx = 1;
pub(super) const ENV_PARAM: LocalIdx = 2;
pub(super) const RESUME: LocalIdx = 3;
/// The body outcome parameter of drive units.
pub(super) const DRIVE_OUTCOME: LocalIdx = 4;

/// Labels of the innermost enclosing loop.
#[derive(Debug, Clone, Copy)]
pub(super) struct LoopContext {
    pub exit: Label,
    pub top: Label,
}

/// A clause continuation visible in a drive unit.
#[derive(Debug, Clone, Copy)]
pub(super) struct ContinuationInfo {
    pub kind: ResumeKind,
    pub needs_guard: bool,
}

pub(super) struct UnitContext<'a> {
    pub lowered: &'a LoweredProgram,
    pub analysis: &'a EffectAnalysis,
    pub metadata: &'a EffectMetadata,
    pub layout: &'a ModuleLayout,
    pub index: usize,
    pub unit: &'a LoweringUnit,
    pub function: Option<&'a FnDecl>,
    /// Number of resumption parameters ahead of the unit's own.
    prefix: u32,
    extra_locals: Vec<ValType>,
    next_label: u32,
    pub loops: Vec<LoopContext>,
    /// Inclusive site-id range of every expression containing a site.
    ranges: FxHashMap<ExprId, (u32, u32)>,
    pub continuations: FxHashMap<LocalId, ContinuationInfo>,
    /// Dispatch loop label while compiling a drive unit.
    pub drive_loop: Option<Label>,
    /// Kind of the clause whose body is being compiled.
    pub clause_kind: Option<ResumeKind>,
    pub diagnostics: Vec<Diagnostic>,
}

impl<'a> UnitContext<'a> {
    pub fn new(
        lowered: &'a LoweredProgram,
        analysis: &'a EffectAnalysis,
        metadata: &'a EffectMetadata,
        layout: &'a ModuleLayout,
        index: usize,
    ) -> Self {
        let unit = &lowered.units.units[index];
        let prefix = match (unit.effectful, unit.kind) {
            (false, _) => 0,
            (true, UnitKind::Drive { .. }) => 5,
            (true, _) => 4,
        };
        let mut cx = Self {
            lowered,
            analysis,
            metadata,
            layout,
            index,
            unit,
            function: lowered.program.function(unit.owner),
            prefix,
            extra_locals: Vec::new(),
            next_label: 0,
            loops: Vec::new(),
            ranges: FxHashMap::default(),
            continuations: FxHashMap::default(),
            drive_loop: None,
            clause_kind: None,
            diagnostics: Vec::new(),
        };
        if unit.effectful {
            cx.collect_ranges();
        }
        cx
    }

    /// Compile the unit into a module function.
    pub fn compile(mut self) -> (Function, Vec<Diagnostic>) {
        let unit = self.unit;
        let body = if !unit.effectful {
            vec![self.compile_expr(&unit.body)]
        } else if unit.is_drive() {
            let mut body = self.prologue();
            body.extend(self.compile_drive());
            body
        } else {
            let mut body = self.prologue();
            let value = self.compile_expr(&unit.body);
            body.push(self.value_outcome(&unit.result, value, unit.body.span));
            body
        };

        let mut params = Vec::new();
        if unit.effectful {
            params.extend([ValType::I32, ValType::I32, ValType::Ref(Some(ENV)), ValType::I64]);
            if unit.is_drive() {
                params.push(ValType::Ref(Some(OUTCOME)));
            }
        }
        params.extend(self.layout.unit_params[self.index].iter().copied());

        let mut locals: Vec<ValType> = self
            .function
            .map(|f| f.locals.iter().map(|l| val_type(&l.ty)).collect())
            .unwrap_or_default();
        locals.append(&mut self.extra_locals);

        let result = if unit.effectful {
            ValType::Ref(Some(OUTCOME))
        } else {
            val_type(&unit.result)
        };
        let function = Function {
            name: unit.name.clone(),
            params,
            locals,
            result: Some(result),
            body,
        };
        (function, self.diagnostics)
    }

    // ------------------------------------------------------------------
    // Locals and labels
    // ------------------------------------------------------------------

    /// Module local index of a source local.
    pub fn local(&self, local: LocalId) -> LocalIdx {
        let params = self.unit.params.len() as u32;
        match self.unit.params.iter().position(|p| *p == local) {
            Some(position) => self.prefix + position as u32,
            None => self.prefix + params + local.index,
        }
    }

    pub fn local_ty(&self, local: LocalId) -> Type {
        self.function.map(|f| f.local_ty(local)).unwrap_or(Type::Unit)
    }

    /// A scratch local that no source local maps to.
    pub fn temp(&mut self, ty: ValType) -> LocalIdx {
        let declared = self.function.map_or(0, |f| f.locals.len()) as u32;
        let index = self.prefix + self.unit.params.len() as u32 + declared + self.extra_locals.len() as u32;
        self.extra_locals.push(ty);
        index
    }

    pub fn label(&mut self) -> Label {
        let label = Label(self.next_label);
        self.next_label += 1;
        label
    }

    /// A block that runs `body` for its effects and yields unit.
    pub fn unit_block(&mut self, mut body: Vec<Instr>) -> Instr {
        body.push(Instr::I32Const(0));
        Instr::Block {
            label: self.label(),
            body,
        }
    }

    pub fn block(&mut self, body: Vec<Instr>) -> Instr {
        Instr::Block {
            label: self.label(),
            body,
        }
    }

    // ------------------------------------------------------------------
    // Site ranges and guards
    // ------------------------------------------------------------------

    fn collect_ranges(&mut self) {
        let root = &self.unit.body;
        let mut ranges = FxHashMap::default();
        let sites = &self.lowered.sites;
        let index = self.index;
        let is_drive = self.unit.is_drive();
        root.walk_post(&mut |e: &Expr| {
            if is_drive && e.id == root.id {
                return;
            }
            let mut range = sites.at(index, e.id).map(|s| (s.site_id, s.site_id));
            e.for_each_child(&mut |child| {
                if let Some((lo, hi)) = ranges.get(&child.id).copied() {
                    range = Some(match range {
                        Some((a, b)) => (u32::min(a, lo), u32::max(b, hi)),
                        None => (lo, hi),
                    });
                }
            });
            if let Some(range) = range {
                ranges.insert(e.id, range);
            }
        });
        self.ranges = ranges;
    }

    pub fn range(&self, expr: &Expr) -> Option<(u32, u32)> {
        if !self.unit.effectful {
            return None;
        }
        self.ranges.get(&expr.id).copied()
    }

    pub fn has_sites(&self, expr: &Expr) -> bool {
        self.range(expr).is_some()
    }

    /// Whether the site being resumed lies in `range`.
    pub fn in_range(&self, range: Option<(u32, u32)>) -> Instr {
        match range {
            Some((lo, hi)) => super::within(Instr::local(ACTIVE), lo, hi),
            None => Instr::I32Const(0),
        }
    }

    /// Run the guarded code when executing normally or when it contains the
    /// site being resumed.
    pub fn guard(&self, range: Option<(u32, u32)>) -> Instr {
        match range {
            Some(_) => Instr::binary(
                rill_runtime::module::BinOp::Or,
                rill_runtime::module::NumType::I32,
                Instr::local(STARTED),
                self.in_range(range),
            ),
            None => Instr::local(STARTED),
        }
    }

    /// Restore captured locals when resuming.
    fn prologue(&mut self) -> Vec<Instr> {
        let mut restores = Vec::new();
        for site in self.lowered.sites.unit_sites(self.index) {
            let Some(env_ty) = self.layout.site_env.get(&site.site_id).copied() else {
                crate::ice!("site without an environment type"; "site" => site.site_id);
                continue;
            };
            let sets: Vec<Instr> = site
                .captures()
                .filter_map(|(field, f)| {
                    let local = f.source.local()?;
                    Some(Instr::set(
                        self.local(local),
                        Instr::struct_get(env_ty, field, Instr::local(ENV_PARAM)),
                    ))
                })
                .collect();
            restores.push(Instr::if_else(
                Instr::i32_eq(Instr::local(ACTIVE), Instr::I32Const(site.site_id as i32)),
                sets,
                vec![],
            ));
        }
        if restores.is_empty() {
            return Vec::new();
        }
        vec![Instr::if_else(Instr::eqz(Instr::local(STARTED)), restores, vec![])]
    }

    // ------------------------------------------------------------------
    // Values
    // ------------------------------------------------------------------

    pub fn value_outcome(&mut self, ty: &Type, value: Instr, span: Span) -> Instr {
        match super::value_outcome(ty, value) {
            Some(outcome) => outcome,
            None => self.unsupported(span, &format!("a `{ty}` result of an effectful unit")),
        }
    }

    pub fn box_bits(&mut self, ty: &Type, value: Instr, span: Span) -> Instr {
        match super::box_bits(ty, value) {
            Some(bits) => bits,
            None => self.unsupported(span, &format!("passing a `{ty}` value through an effect")),
        }
    }

    pub fn unbox(&mut self, ty: &Type, bits: Instr, span: Span) -> Instr {
        match super::unbox(ty, bits) {
            Some(value) => value,
            None => self.unsupported(span, &format!("resuming with a `{ty}` value")),
        }
    }

    /// Report a construct the structural backend cannot express.
    pub fn unsupported(&mut self, span: Span, what: &str) -> Instr {
        self.diagnostics.push(Diagnostic::coded(
            ErrorCode::StructuralUnsupported,
            format!("{what} is not supported by the structural backend (in `{}`)", self.unit.name),
            span,
        ));
        Instr::Unreachable(TrapCode::Unreachable)
    }

    pub fn unsupported_expr(&mut self, expr: &Expr) -> Instr {
        let what = match &expr.kind {
            ExprKind::Closure { .. } => "a closure",
            ExprKind::Tuple(_) => "a tuple",
            ExprKind::Field { .. } => "a tuple projection",
            ExprKind::Def(_) => "a function used as a value",
            ExprKind::Op { .. } => "an operation used as a value",
            ExprKind::Intrinsic(_) => "an intrinsic used as a value",
            ExprKind::Call { .. } => "a call through a value",
            _ => "this expression",
        };
        self.unsupported(expr.span, what)
    }
}
