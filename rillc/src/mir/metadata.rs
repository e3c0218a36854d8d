//! # Effect Metadata
//!
//! A flat summary of the effect analysis that later passes consume without
//! going back to the row store:
//!
//! - one [`FnSummary`] per function (pure or not, which operations it may
//!   raise and with which resumption kind)
//! - one [`OpOrdinal`] per operation performed anywhere in the program
//!
//! Ordinals number operations by effect declaration order, then operation
//! order within the effect. The effect table is written in ordinal order,
//! and emitted code refers to operations by ordinal.

use rill_runtime::{effect_id_hash, signature_hash, EffectTable, EffectTableEntry, ResumeKind};
use rustc_hash::FxHashMap;
use tracing::debug;

use crate::effects::{EffectAnalysis, RowId};
use crate::hir::{DefId, ExprKind, OpRef, Program, Type};

/// One operation that may be performed, with everything the table and the
/// backends need about it.
#[derive(Debug, Clone, PartialEq)]
pub struct OpOrdinal {
    pub ordinal: u32,
    pub op: OpRef,
    /// `Effect.op`.
    pub label: String,
    pub effect_name: String,
    pub effect_id: u64,
    /// Index of the operation within its effect.
    pub op_id: u32,
    pub kind: ResumeKind,
    /// Canonical signature, e.g. `State.put(i32)->()`.
    pub signature: String,
    pub signature_hash: u32,
    pub params: Vec<Type>,
    pub ret: Type,
}

impl OpOrdinal {
    pub fn table_entry(&self) -> EffectTableEntry {
        EffectTableEntry {
            effect_id: self.effect_id,
            effect_name: self.effect_name.clone(),
            op_id: self.op_id,
            resume_kind: self.kind,
            signature_hash: self.signature_hash,
            label: self.label.clone(),
        }
    }
}

/// An operation a function may raise.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RaisedOp {
    pub label: String,
    pub effect: DefId,
    pub kind: ResumeKind,
}

/// Effect summary of one function.
#[derive(Debug, Clone, PartialEq)]
pub struct FnSummary {
    pub def: DefId,
    pub name: String,
    pub row: RowId,
    pub pure: bool,
    /// Whether the row ends in a row variable.
    pub open: bool,
    /// Operations the function may raise, in row order.
    pub raises: Vec<RaisedOp>,
    pub exported: bool,
}

/// Effect metadata for a whole program.
#[derive(Debug, Clone, Default)]
pub struct EffectMetadata {
    ordinals: Vec<OpOrdinal>,
    by_op: FxHashMap<OpRef, u32>,
    functions: Vec<FnSummary>,
}

impl EffectMetadata {
    pub fn build(program: &Program, analysis: &EffectAnalysis) -> Self {
        let mut performed: Vec<OpRef> = Vec::new();
        for function in &program.functions {
            function.body.walk(&mut |e| match &e.kind {
                ExprKind::Perform { op, .. } | ExprKind::Op { op, .. } => {
                    if !performed.contains(op) {
                        performed.push(*op);
                    }
                }
                _ => {}
            });
        }
        performed.retain(|op| program.op(*op).is_some());
        performed.sort_by_key(|op| (program.effect_position(op.effect).unwrap_or(usize::MAX), op.index));

        let mut ordinals = Vec::with_capacity(performed.len());
        let mut by_op = FxHashMap::default();
        for op in performed {
            let (Some(effect), Some(decl)) = (program.effect(op.effect), program.op(op)) else {
                continue;
            };
            let ordinal = ordinals.len() as u32;
            let signature = decl.canonical_signature(&effect.name);
            by_op.insert(op, ordinal);
            ordinals.push(OpOrdinal {
                ordinal,
                op,
                label: program.op_label(op),
                effect_name: effect.name.clone(),
                effect_id: effect_id_hash(&effect.name),
                op_id: op.index,
                kind: decl.kind,
                signature_hash: signature_hash(&signature),
                signature,
                params: decl.params.clone(),
                ret: decl.ret.clone(),
            });
        }

        let functions = program
            .functions
            .iter()
            .map(|f| {
                let row = analysis.fn_row(f.def);
                FnSummary {
                    def: f.def,
                    name: f.name.clone(),
                    row,
                    pure: analysis.rows.is_empty(row),
                    open: analysis.rows.is_open(row),
                    raises: analysis
                        .rows
                        .ops(row)
                        .iter()
                        .map(|op| RaisedOp {
                            label: analysis.rows.name(op.name).to_string(),
                            effect: op.effect,
                            kind: op.kind,
                        })
                        .collect(),
                    exported: f.exported,
                }
            })
            .collect();

        debug!(ops = ordinals.len(), "built effect metadata");
        Self {
            ordinals,
            by_op,
            functions,
        }
    }

    pub fn ordinals(&self) -> &[OpOrdinal] {
        &self.ordinals
    }

    pub fn ordinal_of(&self, op: OpRef) -> Option<&OpOrdinal> {
        let index = *self.by_op.get(&op)?;
        self.ordinals.get(index as usize)
    }

    pub fn op_count(&self) -> usize {
        self.ordinals.len()
    }

    pub fn functions(&self) -> &[FnSummary] {
        &self.functions
    }

    pub fn function(&self, def: DefId) -> Option<&FnSummary> {
        self.functions.iter().find(|f| f.def == def)
    }

    pub fn is_pure(&self, def: DefId) -> bool {
        self.function(def).map_or(true, |f| f.pure)
    }

    /// The effect table in ordinal order.
    pub fn to_table(&self) -> EffectTable {
        self.ordinals.iter().map(OpOrdinal::table_entry).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CompilerConfig;
    use crate::effects;
    use crate::hir::ProgramBuilder;

    #[test]
    fn test_ordinals_follow_declaration_order() {
        let mut b = ProgramBuilder::new();
        let log = b.effect(
            "Log",
            vec![ProgramBuilder::op("log", vec![Type::I32], Type::Unit, ResumeKind::Tail)],
        );
        let state = b.effect(
            "State",
            vec![
                ProgramBuilder::op("get", vec![], Type::I32, ResumeKind::Tail),
                ProgramBuilder::op("unused", vec![], Type::I32, ResumeKind::Tail),
                ProgramBuilder::op("put", vec![Type::I32], Type::Unit, ResumeKind::Resume),
            ],
        );
        // Performed in reverse order; ordinals still follow declarations.
        let f = b.function("f", &[], Type::Unit, |f| {
            let v = f.i32(1);
            let put = f.perform(OpRef::new(state, 2), vec![v]);
            let got = f.perform(OpRef::new(state, 0), vec![]);
            let logged = f.perform(OpRef::new(log, 0), vec![got]);
            f.block(vec![crate::hir::FnBuilder::stmt(put)], Some(logged))
        });
        let pure = b.function("pure", &[], Type::I32, |f| f.i32(0));
        let program = b.finish();
        let analysis = effects::analyze(&program, &CompilerConfig::default());
        let meta = EffectMetadata::build(&program, &analysis);

        let labels: Vec<&str> = meta.ordinals().iter().map(|o| o.label.as_str()).collect();
        assert_eq!(labels, vec!["Log.log", "State.get", "State.put"]);
        assert_eq!(meta.ordinal_of(OpRef::new(state, 2)).map(|o| o.op_id), Some(2));
        assert!(meta.ordinal_of(OpRef::new(state, 1)).is_none());

        let summary = meta.function(f).expect("summary");
        assert!(!summary.pure);
        assert_eq!(summary.raises.len(), 3);
        assert!(meta.is_pure(pure));

        let table = meta.to_table();
        assert_eq!(table.len(), 3);
        assert_eq!(table.entries()[2].resume_kind, ResumeKind::Resume);
        assert_eq!(table.entries()[0].effect_id, effect_id_hash("Log"));
    }
}
