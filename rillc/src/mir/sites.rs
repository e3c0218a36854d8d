//! # Effect Sites
//!
//! Numbers the points where an effectful unit can suspend and fixes the
//! layout of the environment saved at each of them.
//!
//! | Site | Where |
//! |------|-------|
//! | `Perform` | `perform` and calls of operation values |
//! | `Call` | direct calls of effectful functions |
//! | `Handle` | lifted handle expressions |
//! | `Resume` | resuming a `Resume`-kind continuation inside a drive unit |
//! | `Forward` | the drive unit re-raising an operation it does not handle |
//!
//! Site ids are module-wide. Units are visited in order and each unit in
//! post-order, so the sites inside any expression form a contiguous range;
//! a drive unit's forward site is its last.
//!
//! Every environment starts with `site: i32` and `handler: ref`, followed by
//! the locals live after the site in order of first definition. The
//! environment type of site `n` in unit `u` is `u$env<n>`, a subtype of
//! `u$env`.

use std::fmt;

use rill_runtime::ResumeKind;
use rustc_hash::FxHashMap;
use tracing::trace;

use super::lift::{LiftedProgram, LoweringUnit, UnitKind};
use super::liveness::{self, LiveSet, LivenessCx};
use super::metadata::EffectMetadata;
use crate::effects::EffectAnalysis;
use crate::hir::{DefId, Expr, ExprId, ExprKind, FnDecl, LocalId, OpRef, Pattern, Program, Stmt, Type};

/// Hands out module-wide site ids.
#[derive(Debug, Default)]
pub struct SiteCounter {
    next: u32,
}

impl SiteCounter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn next(&mut self) -> u32 {
        let id = self.next;
        self.next += 1;
        id
    }

    /// Number of ids handed out so far.
    pub fn count(&self) -> u32 {
        self.next
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SiteKind {
    Perform,
    Call(DefId),
    Handle(ExprId),
    Resume,
    Forward,
}

/// Where an environment field's value comes from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldSource {
    /// The site id header.
    Site,
    /// The callee's environment (or null for a perform).
    Handler,
    Param(LocalId),
    Local(LocalId),
}

impl FieldSource {
    pub fn local(self) -> Option<LocalId> {
        match self {
            FieldSource::Param(l) | FieldSource::Local(l) => Some(l),
            FieldSource::Site | FieldSource::Handler => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct EnvField {
    /// `site`, `handler`, or `<local name>#<local index>`.
    pub name: String,
    pub source: FieldSource,
    pub ty: Type,
}

/// One suspension point.
#[derive(Debug, Clone, PartialEq)]
pub struct EffectSite {
    pub site_id: u32,
    pub expr: ExprId,
    /// Index of the unit containing the site.
    pub unit: usize,
    /// The source function the unit came from.
    pub function: DefId,
    pub kind: SiteKind,
    pub op: Option<OpRef>,
    pub effect: Option<DefId>,
    /// Ordinal of the operation in the effect table.
    pub op_index: Option<u32>,
    pub resume_kind: Option<ResumeKind>,
    pub live_after: Vec<LocalId>,
    /// Argument positions in evaluation order.
    pub arg_order: Vec<usize>,
    pub fields: Vec<EnvField>,
    pub env_type: String,
}

impl EffectSite {
    /// Captured locals, i.e. the fields after the two-field header.
    pub fn captures(&self) -> impl Iterator<Item = (u32, &EnvField)> {
        self.fields
            .iter()
            .enumerate()
            .skip(2)
            .map(|(i, f)| (i as u32, f))
    }
}

impl fmt::Display for EffectSite {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let names: Vec<&str> = self.fields.iter().map(|f| f.name.as_str()).collect();
        write!(f, "{} {:?} {{{}}}", self.env_type, self.kind, names.join(", "))
    }
}

/// Site layout of one unit.
#[derive(Debug, Clone, PartialEq)]
pub struct UnitLayout {
    pub unit: usize,
    pub name: String,
    /// `<unit>$env`.
    pub base_env: String,
    /// Site ids of the unit, ascending.
    pub sites: Vec<u32>,
}

impl UnitLayout {
    /// Inclusive range of the unit's site ids.
    pub fn range(&self) -> Option<(u32, u32)> {
        Some((*self.sites.first()?, *self.sites.last()?))
    }
}

/// Sites and layouts of a whole module.
#[derive(Debug, Clone, Default)]
pub struct SiteTable {
    /// Indexed by site id.
    pub sites: Vec<EffectSite>,
    /// One per unit, in unit order.
    pub layouts: Vec<UnitLayout>,
    by_expr: FxHashMap<(usize, ExprId), u32>,
}

impl SiteTable {
    pub fn site(&self, id: u32) -> Option<&EffectSite> {
        self.sites.get(id as usize)
    }

    /// The site at `expr` in `unit`.
    pub fn at(&self, unit: usize, expr: ExprId) -> Option<&EffectSite> {
        self.by_expr.get(&(unit, expr)).and_then(|id| self.site(*id))
    }

    pub fn unit_sites(&self, unit: usize) -> impl Iterator<Item = &EffectSite> {
        self.layouts
            .get(unit)
            .into_iter()
            .flat_map(|l| l.sites.iter())
            .filter_map(|id| self.site(*id))
    }
}

/// Number sites and compute environment layouts for every effectful unit.
pub fn build(
    program: &Program,
    analysis: &EffectAnalysis,
    metadata: &EffectMetadata,
    lifted: &LiftedProgram,
    counter: &mut SiteCounter,
) -> SiteTable {
    let mut table = SiteTable::default();
    for (index, unit) in lifted.units.iter().enumerate() {
        let mut layout = UnitLayout {
            unit: index,
            name: unit.name.clone(),
            base_env: format!("{}$env", unit.name),
            sites: Vec::new(),
        };
        let Some(function) = program.function(unit.owner) else {
            table.layouts.push(layout);
            continue;
        };
        if unit.effectful {
            let builder = UnitSites {
                program,
                analysis,
                metadata,
                lifted,
                unit,
                index,
                function,
            };
            for site in builder.collect(counter) {
                layout.sites.push(site.site_id);
                table.by_expr.insert((index, site.expr), site.site_id);
                trace!(site = site.site_id, layout = %site, "site");
                table.sites.push(site);
            }
        }
        table.layouts.push(layout);
    }
    table
}

struct UnitSites<'a> {
    program: &'a Program,
    analysis: &'a EffectAnalysis,
    metadata: &'a EffectMetadata,
    lifted: &'a LiftedProgram,
    unit: &'a LoweringUnit,
    index: usize,
    function: &'a FnDecl,
}

impl UnitSites<'_> {
    fn collect(&self, counter: &mut SiteCounter) -> Vec<EffectSite> {
        let drive = self.drive_info();
        let forced: LiveSet = if self.unit.is_drive() {
            self.unit.params.iter().copied().collect()
        } else {
            LiveSet::new()
        };
        let cx = LivenessCx {
            lifted: &self.lifted.lifted,
            forced: forced.clone(),
            transfers: drive.tail_continuations.clone(),
        };
        let live = liveness::analyze_unit(self.unit, &cx);
        let order = self.definition_order();

        let mut found: Vec<(ExprId, SiteKind, Option<OpRef>, usize)> = Vec::new();
        let root = self.unit.body.id;
        self.unit.body.walk_post(&mut |e| {
            if self.unit.is_drive() && e.id == root {
                return;
            }
            if let Some((kind, op)) = self.classify(e, &drive) {
                let arity = match &e.kind {
                    ExprKind::Perform { args, .. } | ExprKind::Call { args, .. } => args.len(),
                    _ => 0,
                };
                found.push((e.id, kind, op, arity));
            }
        });
        if self.unit.is_drive() {
            found.push((root, SiteKind::Forward, None, 0));
        }

        found
            .into_iter()
            .map(|(expr, kind, op, arity)| {
                let site_id = counter.next();
                let mut live_after: Vec<LocalId> = match kind {
                    SiteKind::Forward => forced.iter().copied().collect(),
                    _ => {
                        let mut set = live.get(&expr).cloned().unwrap_or_default();
                        set.extend(forced.iter().copied());
                        set.into_iter().collect()
                    }
                };
                live_after.sort_by_key(|l| (order.get(l).copied().unwrap_or(usize::MAX), l.index));
                let ordinal = op.and_then(|op| self.metadata.ordinal_of(op));
                EffectSite {
                    site_id,
                    expr,
                    unit: self.index,
                    function: self.unit.owner,
                    kind,
                    op,
                    effect: op.map(|o| o.effect),
                    op_index: ordinal.map(|o| o.ordinal),
                    resume_kind: ordinal.map(|o| o.kind),
                    fields: self.fields(&live_after),
                    live_after,
                    arg_order: (0..arity).collect(),
                    env_type: format!("{}$env{}", self.unit.name, site_id),
                }
            })
            .collect()
    }

    fn classify(&self, e: &Expr, drive: &DriveInfo) -> Option<(SiteKind, Option<OpRef>)> {
        match &e.kind {
            ExprKind::Perform { op, .. } => Some((SiteKind::Perform, Some(*op))),
            ExprKind::Call { callee, .. } => match &callee.kind {
                ExprKind::Op { op, .. } => Some((SiteKind::Perform, Some(*op))),
                ExprKind::Def(def) if self.analysis.is_effectful(*def) => Some((SiteKind::Call(*def), None)),
                ExprKind::Local(k) if drive.resume_continuations.contains(k) => Some((SiteKind::Resume, None)),
                _ => None,
            },
            ExprKind::Handle { .. } if self.lifted.lifted.contains_key(&e.id) => Some((SiteKind::Handle(e.id), None)),
            _ => None,
        }
    }

    fn fields(&self, live_after: &[LocalId]) -> Vec<EnvField> {
        let mut fields = vec![
            EnvField {
                name: "site".into(),
                source: FieldSource::Site,
                ty: Type::I32,
            },
            EnvField {
                name: "handler".into(),
                source: FieldSource::Handler,
                ty: Type::Unit,
            },
        ];
        for local in live_after {
            let source = if self.unit.params.contains(local) {
                FieldSource::Param(*local)
            } else {
                FieldSource::Local(*local)
            };
            fields.push(EnvField {
                name: format!("{}#{}", self.function.local_name(*local), local.index),
                source,
                ty: self.function.local_ty(*local),
            });
        }
        fields
    }

    /// Position of each local's first definition: parameters first, then
    /// declarations in pre-order.
    fn definition_order(&self) -> FxHashMap<LocalId, usize> {
        let mut order = FxHashMap::default();
        let mut define = |l: LocalId, order: &mut FxHashMap<LocalId, usize>| {
            let next = order.len();
            order.entry(l).or_insert(next);
        };
        for p in &self.unit.params {
            define(*p, &mut order);
        }
        self.unit.body.walk(&mut |e| match &e.kind {
            ExprKind::Block { stmts, .. } => {
                for stmt in stmts {
                    if let Stmt::Let { local, .. } = stmt {
                        define(*local, &mut order);
                    }
                }
            }
            ExprKind::Assign { local, .. } => define(*local, &mut order),
            ExprKind::Match { arms, .. } => {
                for arm in arms {
                    if let Pattern::Binding(l) = arm.pattern {
                        define(l, &mut order);
                    }
                }
            }
            ExprKind::Handle { clauses, .. } => {
                for clause in clauses {
                    define(clause.continuation, &mut order);
                    for p in &clause.params {
                        define(*p, &mut order);
                    }
                }
            }
            ExprKind::Closure { params, .. } => {
                for p in params {
                    define(*p, &mut order);
                }
            }
            _ => {}
        });
        order
    }

    fn drive_info(&self) -> DriveInfo {
        let mut info = DriveInfo::default();
        let UnitKind::Drive { handle } = self.unit.kind else {
            return info;
        };
        let ExprKind::Handle { clauses, .. } = &self.unit.body.kind else {
            return info;
        };
        let Some(resolution) = self.analysis.handler(handle) else {
            return info;
        };
        for (i, clause) in clauses.iter().enumerate() {
            match resolution.clause(i).map(|c| c.kind) {
                Some(ResumeKind::Tail) => {
                    info.tail_continuations.insert(clause.continuation);
                }
                Some(ResumeKind::Resume) => {
                    info.resume_continuations.insert(clause.continuation);
                }
                None => {}
            }
        }
        info
    }
}

#[derive(Debug, Default)]
struct DriveInfo {
    tail_continuations: LiveSet,
    resume_continuations: LiveSet,
}

/// Continuations of a drive unit by clause kind.
pub fn continuation_kinds(analysis: &EffectAnalysis, unit: &LoweringUnit) -> FxHashMap<LocalId, ResumeKind> {
    let mut kinds = FxHashMap::default();
    let (UnitKind::Drive { handle }, ExprKind::Handle { clauses, .. }) = (unit.kind, &unit.body.kind) else {
        return kinds;
    };
    if let Some(resolution) = analysis.handler(handle) {
        for (i, clause) in clauses.iter().enumerate() {
            if let Some(c) = resolution.clause(i) {
                kinds.insert(clause.continuation, c.kind);
            }
        }
    }
    kinds
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CompilerConfig;
    use crate::effects;
    use crate::hir::{FnBuilder, ProgramBuilder};
    use crate::mir::{lift, normalize};

    fn lower(program: &Program) -> (LiftedProgram, SiteTable) {
        let analysis = effects::analyze(program, &CompilerConfig::default());
        let program = normalize::normalize(program, &analysis);
        let metadata = EffectMetadata::build(&program, &analysis);
        let lifted = lift::lift(&program, &analysis);
        let mut counter = SiteCounter::new();
        let table = build(&program, &analysis, &metadata, &lifted, &mut counter);
        (lifted, table)
    }

    fn state() -> (ProgramBuilder, OpRef, OpRef) {
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
    fn test_fields_follow_definition_order() {
        let (mut b, get, put) = state();
        b.function("step", &[("n", Type::I32)], Type::I32, |f| {
            let a = f.local("a", Type::I32);
            let z = f.local("z", Type::I32);
            let got = f.perform(get, vec![]);
            let one = f.i32(1);
            let read_n = f.var(f.param(0));
            let read_a = f.var(a);
            let sum = f.add(read_n, read_a);
            let write = f.perform(put, vec![sum]);
            let read_z = f.var(z);
            let read_a2 = f.var(a);
            let tail = f.add(read_z, read_a2);
            f.block(
                vec![
                    FnBuilder::let_(z, one),
                    FnBuilder::let_(a, got),
                    FnBuilder::stmt(write),
                ],
                Some(tail),
            )
        });
        let program = b.finish();
        let (_, table) = lower(&program);

        assert_eq!(table.sites.len(), 2);
        let first = &table.sites[0];
        assert_eq!(first.kind, SiteKind::Perform);
        assert_eq!(first.env_type, "step$env0");
        let names: Vec<&str> = first.fields.iter().map(|f| f.name.as_str()).collect();
        // `z` is defined before `a`, `n` is a parameter.
        assert_eq!(names, vec!["site", "handler", "n#0", "z#2"]);
        let second = &table.sites[1];
        let names: Vec<&str> = second.fields.iter().map(|f| f.name.as_str()).collect();
        assert_eq!(names, vec!["site", "handler", "z#2", "a#1"]);
        assert_eq!(second.op_index, Some(1));
        assert_eq!(table.layouts[0].range(), Some((0, 1)));
    }

    #[test]
    fn test_site_ids_are_module_wide() {
        let (mut b, get, _) = state();
        let leaf = b.function("leaf", &[], Type::I32, |f| f.perform(get, vec![]));
        b.function("caller", &[], Type::I32, |f| {
            let first = f.call(leaf, vec![]);
            let second = f.call(leaf, vec![]);
            f.add(first, second)
        });
        let program = b.finish();
        let (_, table) = lower(&program);
        let ids: Vec<(u32, String)> = table.sites.iter().map(|s| (s.site_id, s.env_type.clone())).collect();
        assert_eq!(
            ids,
            vec![
                (0, "leaf$env0".to_string()),
                (1, "caller$env1".to_string()),
                (2, "caller$env2".to_string()),
            ]
        );
        assert!(matches!(table.sites[1].kind, SiteKind::Call(d) if d == leaf));
        // The first call's result is spilled and live across the second.
        assert_eq!(table.sites[2].fields.len(), 3);
    }

    #[test]
    fn test_drive_unit_ends_with_forward_site() {
        let (mut b, get, put) = state();
        b.function("run", &[("init", Type::I32)], Type::I32, |f| {
            let got = f.perform(get, vec![]);
            let one = f.i32(1);
            let write = f.perform(put, vec![one]);
            let body = f.block(vec![FnBuilder::stmt(write)], Some(got));
            let clause = f.clause(get.effect, "get", &[], false, Type::I32, |f, k, _| {
                let init = f.var(f.param(0));
                f.resume(k, init)
            });
            f.handle(body, vec![clause], None)
        });
        let program = b.finish();
        let analysis = effects::analyze(&program, &CompilerConfig { exhaustive_handlers: false, ..Default::default() });
        let normalized = normalize::normalize(&program, &analysis);
        let metadata = EffectMetadata::build(&normalized, &analysis);
        let lifted = lift::lift(&normalized, &analysis);
        let table = build(&normalized, &analysis, &metadata, &lifted, &mut SiteCounter::new());

        let drive = lifted.units.iter().position(|u| u.is_drive()).expect("drive unit");
        let sites: Vec<&EffectSite> = table.unit_sites(drive).collect();
        assert_eq!(sites.len(), 1);
        assert_eq!(sites[0].kind, SiteKind::Forward);
        // The clause reads `init` on every dispatch, so it is always saved.
        assert_eq!(sites[0].fields[2].name, "init#0");
        assert_eq!(table.layouts[drive].base_env, "run$drive0$env");
    }
}
