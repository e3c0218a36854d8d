//! # Effect Lowering
//!
//! Prepares an analyzed program for the backends. Lowering never changes
//! what a program computes; it only makes every suspension point explicit.
//!
//! ## Pipeline
//!
//! | Pass | Output |
//! |------|--------|
//! | [`metadata`] | Operation ordinals, function summaries, the effect table |
//! | [`normalize`] | Operands spilled ahead of sites, `finally` desugared |
//! | [`lift`] | Lifted handles split into body and drive units |
//! | [`liveness`] | Locals live after each site |
//! | [`sites`] | Numbered sites with their environment layouts |
//!
//! ## Lowering Overview
//!
//! ```text
//! fn f(x) { let a = perform E.op(x); a + x }
//!
//! unit f       site 0: Perform E.op   env f$env0 { site, handler, x#0 }
//! ```
//!
//! Site ids are unique across the module; the host protocol and the
//! resume dispatcher both key on them.

pub mod lift;
pub mod liveness;
pub mod metadata;
pub mod normalize;
pub mod sites;

use tracing::debug;

use crate::diagnostics::Diagnostic;
use crate::effects::EffectAnalysis;
use crate::hir::Program;

pub use lift::{LiftedHandle, LiftedProgram, LoweringUnit, UnitKind};
pub use liveness::LiveSet;
pub use metadata::{EffectMetadata, FnSummary, OpOrdinal, RaisedOp};
pub use sites::{EffectSite, EnvField, FieldSource, SiteCounter, SiteKind, SiteTable, UnitLayout};

/// Everything the backends need.
#[derive(Debug, Clone)]
pub struct LoweredProgram {
    /// The normalized program the units were cut from.
    pub program: Program,
    pub units: LiftedProgram,
    pub sites: SiteTable,
    pub diagnostics: Vec<Diagnostic>,
}

impl LoweredProgram {
    pub fn has_errors(&self) -> bool {
        crate::diagnostics::has_errors(&self.diagnostics)
    }

    pub fn site_count(&self) -> usize {
        self.sites.sites.len()
    }
}

/// Normalize, lift and number the sites of an analyzed program.
pub fn lower_program(program: &Program, analysis: &EffectAnalysis, metadata: &EffectMetadata) -> LoweredProgram {
    let program = normalize::normalize(program, analysis);
    let units = lift::lift(&program, analysis);
    let mut counter = SiteCounter::new();
    let sites = sites::build(&program, analysis, metadata, &units, &mut counter);
    debug!(
        units = units.units.len(),
        sites = counter.count(),
        "lowered effect sites"
    );
    let diagnostics = units.diagnostics.clone();
    LoweredProgram {
        program,
        units,
        sites,
        diagnostics,
    }
}
