//! # Structural Backend
//!
//! Emits a [`rill_runtime::Module`] in which every effectful lowering unit is
//! an ordinary function that can be re-entered at any of its sites.
//!
//! ## Type layout
//!
//! | Index | Type | Fields |
//! |-------|------|--------|
//! | 0 | `$env` | `site: i32`, `handler: anyref` |
//! | 1 | `$outcome` | `status: i32` |
//! | 2 | `$outcome.value` <: 1 | `status`, `tag: i32`, `bits: i64` |
//! | 3 | `$outcome.effect` <: 1 | `status`, `ordinal`, `effect_id: i64`, `op_id`, `kind`, `args`, `env`, `mut count` |
//! | .. | `<unit>$env` <: 0 | header only |
//! | .. | `<unit>$env<n>` <: `<unit>$env` | header, then captured locals |
//!
//! Values cross outcomes and environments as `(tag, bits)` pairs; unit is
//! `i32 0`, booleans are `i32`.
//!
//! ## Unit shape
//!
//! ```text
//! fn unit(started: i32, active: i32, env: ref $env, resume: i64, [o: ref $outcome,] params..) -> ref $outcome
//! ```
//!
//! A fresh call passes `started = 1`. Resuming passes `started = 0`, the
//! site id in `active`, the site's environment and the resume value's bits.
//! The prologue restores captured locals from the environment; every control
//! construct that contains a site then only runs the path leading to
//! `active`. Reaching the site sets `started` and execution carries on.
//!
//! Drive units additionally take the outcome `o` of the guarded body and
//! loop: a value finishes the handle, an effect is dispatched to a clause
//! by ordinal or forwarded with the drive's own environment wrapped around
//! it. `resume$dispatch` maps any environment back to its unit by site
//! range.

mod context;
mod control;
mod glue;
mod sites;


use rill_runtime::module::{
    ConvertOp, FieldType, FuncIdx, ImportIdx, Instr, NumType, StructType, TypeIdx, ValType,
};
use rill_runtime::table::EFFECT_TABLE_SECTION;
use rill_runtime::{BufferLayout, Module};
use rustc_hash::FxHashMap;
use tracing::{debug, trace};

use crate::config::CompilerConfig;
use crate::diagnostics::Diagnostic;
use crate::effects::EffectAnalysis;
use crate::hir::{Literal, Type};
use crate::mir::{EffectMetadata, LoweredProgram};

use context::UnitContext;

pub(crate) const ENV: TypeIdx = 0;
pub(crate) const OUTCOME: TypeIdx = 1;
pub(crate) const VALUE: TypeIdx = 2;
pub(crate) const EFFECT: TypeIdx = 3;

pub(crate) const ENV_SITE: u32 = 0;
pub(crate) const ENV_HANDLER: u32 = 1;

pub(crate) const STATUS: u32 = 0;
pub(crate) const VALUE_TAG: u32 = 1;
pub(crate) const VALUE_BITS: u32 = 2;
pub(crate) const EFFECT_ORDINAL: u32 = 1;
pub(crate) const EFFECT_ID: u32 = 2;
pub(crate) const EFFECT_OP: u32 = 3;
pub(crate) const EFFECT_KIND: u32 = 4;
pub(crate) const EFFECT_ARGS: u32 = 5;
pub(crate) const EFFECT_ENV: u32 = 6;
pub(crate) const EFFECT_COUNT: u32 = 7;

/// Host imports, in import order.
pub(crate) const IMPORT_WRITE_VALUE: ImportIdx = 0;
pub(crate) const IMPORT_WRITE_EFFECT: ImportIdx = 1;
pub(crate) const IMPORT_READ_VALUE: ImportIdx = 2;

/// Where everything lives in the module being built.
#[derive(Debug, Clone, Default)]
pub(crate) struct ModuleLayout {
    /// Environment type per site id.
    pub site_env: FxHashMap<u32, TypeIdx>,
    /// Trailing parameter types of each unit, after the resumption header.
    pub unit_params: Vec<Vec<ValType>>,
    pub dispatch: FuncIdx,
    pub handle_outcome: FuncIdx,
}

/// Output of the structural backend.
#[derive(Debug, Clone)]
pub struct StructuralOutput {
    pub module: Module,
    pub layout: BufferLayout,
    pub diagnostics: Vec<Diagnostic>,
}

/// Emit the target module for a lowered program.
pub fn emit(
    lowered: &LoweredProgram,
    analysis: &EffectAnalysis,
    metadata: &EffectMetadata,
    config: &CompilerConfig,
) -> StructuralOutput {
    let mut module = Module::new();
    declare_header_types(&mut module);
    glue::declare_imports(&mut module);

    let buffer = BufferLayout::new(metadata.op_count(), config.buffer_size);
    let mut layout = declare_env_types(&mut module, lowered);
    let units = &lowered.units.units;
    layout.dispatch = units.len() as FuncIdx;
    layout.handle_outcome = layout.dispatch + 1;

    let mut diagnostics = Vec::new();
    for (index, unit) in units.iter().enumerate() {
        let cx = UnitContext::new(lowered, analysis, metadata, &layout, index);
        let (function, mut found) = cx.compile();
        trace!(unit = %unit.name, params = function.params.len(), locals = function.locals.len(), "emitted unit");
        module.add_function(function);
        diagnostics.append(&mut found);
    }

    glue::emit_glue(&mut module, lowered, metadata, &layout, &buffer, &mut diagnostics);

    module.memory_size = buffer.memory_size();
    module.custom_sections.push(rill_runtime::module::CustomSection {
        name: EFFECT_TABLE_SECTION.to_string(),
        data: metadata.to_table().encode(),
    });
    debug!(
        types = module.types.len(),
        functions = module.functions.len(),
        exports = module.exports.len(),
        memory = module.memory_size,
        "emitted structural module"
    );
    StructuralOutput {
        module,
        layout: buffer,
        diagnostics,
    }
}

fn declare_header_types(module: &mut Module) {
    let header = || {
        vec![
            FieldType::new("site", ValType::I32),
            FieldType::new("handler", ValType::Ref(None)),
        ]
    };
    module.add_type(StructType {
        name: "$env".into(),
        supertype: None,
        fields: header(),
    });
    module.add_type(StructType {
        name: "$outcome".into(),
        supertype: None,
        fields: vec![FieldType::new("status", ValType::I32)],
    });
    module.add_type(StructType {
        name: "$outcome.value".into(),
        supertype: Some(OUTCOME),
        fields: vec![
            FieldType::new("status", ValType::I32),
            FieldType::new("tag", ValType::I32),
            FieldType::new("bits", ValType::I64),
        ],
    });
    module.add_type(StructType {
        name: "$outcome.effect".into(),
        supertype: Some(OUTCOME),
        fields: vec![
            FieldType::new("status", ValType::I32),
            FieldType::new("ordinal", ValType::I32),
            FieldType::new("effect_id", ValType::I64),
            FieldType::new("op_id", ValType::I32),
            FieldType::new("kind", ValType::I32),
            FieldType::new("args", ValType::Ref(None)),
            FieldType::new("env", ValType::Ref(Some(ENV))),
            FieldType::mutable("count", ValType::I32),
        ],
    });
}

fn declare_env_types(module: &mut Module, lowered: &LoweredProgram) -> ModuleLayout {
    let mut layout = ModuleLayout::default();
    for (index, unit) in lowered.units.units.iter().enumerate() {
        let function = lowered.program.function(unit.owner);
        let params = unit
            .params
            .iter()
            .map(|p| val_type(&function.map(|f| f.local_ty(*p)).unwrap_or(Type::Unit)))
            .collect();
        layout.unit_params.push(params);
        if !unit.effectful {
            continue;
        }
        let base = module.add_type(StructType {
            name: lowered.sites.layouts[index].base_env.clone(),
            supertype: Some(ENV),
            fields: vec![
                FieldType::new("site", ValType::I32),
                FieldType::new("handler", ValType::Ref(None)),
            ],
        });
        for site in lowered.sites.unit_sites(index) {
            let mut fields = vec![
                FieldType::new("site", ValType::I32),
                FieldType::new("handler", ValType::Ref(None)),
            ];
            fields.extend(
                site.captures()
                    .map(|(_, field)| FieldType::new(field.name.clone(), val_type(&field.ty))),
            );
            let ty = module.add_type(StructType {
                name: site.env_type.clone(),
                supertype: Some(base),
                fields,
            });
            layout.site_env.insert(site.site_id, ty);
        }
    }
    layout
}

// ----------------------------------------------------------------------
// Value representation
// ----------------------------------------------------------------------

pub(crate) fn val_type(ty: &Type) -> ValType {
    match ty {
        Type::Unit | Type::Bool | Type::I32 => ValType::I32,
        Type::I64 => ValType::I64,
        Type::F32 => ValType::F32,
        Type::F64 => ValType::F64,
        Type::Continuation { .. } => ValType::Ref(Some(OUTCOME)),
        Type::Tuple(_) | Type::Fn { .. } | Type::Param(_) => ValType::Ref(None),
    }
}

pub(crate) fn num_type(ty: &Type) -> NumType {
    match val_type(ty) {
        ValType::I64 => NumType::I64,
        ValType::F32 => NumType::F32,
        ValType::F64 => NumType::F64,
        ValType::I32 | ValType::Ref(_) => NumType::I32,
    }
}

/// Wire tag of a value of type `ty`.
pub(crate) fn tag(ty: &Type) -> Option<i32> {
    ty.value_tag().map(|t| t.as_u32() as i32)
}

/// The 64-bit payload of `value`.
pub(crate) fn box_bits(ty: &Type, value: Instr) -> Option<Instr> {
    Some(match ty {
        Type::Unit | Type::Bool | Type::I32 => Instr::convert(ConvertOp::ExtendI32U, value),
        Type::I64 => value,
        Type::F32 => Instr::convert(ConvertOp::ExtendI32U, Instr::convert(ConvertOp::F32ToBits, value)),
        Type::F64 => Instr::convert(ConvertOp::F64ToBits, value),
        _ => return None,
    })
}

/// A value of type `ty` from its 64-bit payload.
pub(crate) fn unbox(ty: &Type, bits: Instr) -> Option<Instr> {
    Some(match ty {
        Type::Unit | Type::Bool | Type::I32 => Instr::convert(ConvertOp::WrapI64, bits),
        Type::I64 => bits,
        Type::F32 => Instr::convert(ConvertOp::F32FromBits, Instr::convert(ConvertOp::WrapI64, bits)),
        Type::F64 => Instr::convert(ConvertOp::F64FromBits, bits),
        _ => return None,
    })
}

/// A `$outcome.value` holding `value`.
pub(crate) fn value_outcome(ty: &Type, value: Instr) -> Option<Instr> {
    Some(Instr::StructNew {
        ty: VALUE,
        fields: vec![Instr::I32Const(0), Instr::I32Const(tag(ty)?), box_bits(ty, value)?],
    })
}

pub(crate) fn status(outcome: Instr) -> Instr {
    Instr::struct_get(OUTCOME, STATUS, outcome)
}

pub(crate) fn effect_field(field: u32, outcome: Instr) -> Instr {
    Instr::struct_get(EFFECT, field, outcome)
}

/// Copy of an effect outcome with `env` in place of its environment.
pub(crate) fn rewrap(outcome: impl Fn() -> Instr, env: Instr) -> Instr {
    Instr::StructNew {
        ty: EFFECT,
        fields: vec![
            Instr::I32Const(1),
            effect_field(EFFECT_ORDINAL, outcome()),
            effect_field(EFFECT_ID, outcome()),
            effect_field(EFFECT_OP, outcome()),
            effect_field(EFFECT_KIND, outcome()),
            effect_field(EFFECT_ARGS, outcome()),
            env,
            effect_field(EFFECT_COUNT, outcome()),
        ],
    }
}

pub(crate) fn default_value(ty: ValType) -> Instr {
    match ty {
        ValType::I32 => Instr::I32Const(0),
        ValType::I64 => Instr::I64Const(0),
        ValType::F32 => Instr::F32Const(0.0),
        ValType::F64 => Instr::F64Const(0.0),
        ValType::Ref(_) => Instr::RefNull,
    }
}

pub(crate) fn literal(lit: Literal, ty: &Type) -> Instr {
    match (lit, ty) {
        (Literal::Unit, _) => Instr::I32Const(0),
        (Literal::Bool(b), _) => Instr::I32Const(b as i32),
        (Literal::Int(n), Type::I64) => Instr::I64Const(n),
        (Literal::Int(n), Type::F32) => Instr::F32Const(n as f32),
        (Literal::Int(n), Type::F64) => Instr::F64Const(n as f64),
        (Literal::Int(n), _) => Instr::I32Const(n as i32),
        (Literal::Float(x), Type::F32) => Instr::F32Const(x as f32),
        (Literal::Float(x), _) => Instr::F64Const(x),
    }
}

/// `lo <= value <= hi`, both sides evaluated.
pub(crate) fn within(value: Instr, lo: u32, hi: u32) -> Instr {
    use rill_runtime::module::BinOp;
    Instr::binary(
        BinOp::And,
        NumType::I32,
        Instr::binary(BinOp::Ge, NumType::I32, value.clone(), Instr::I32Const(lo as i32)),
        Instr::binary(BinOp::Le, NumType::I32, value, Instr::I32Const(hi as i32)),
    )
}

/// The arguments of a fresh call to an effectful unit.
pub(crate) fn fresh_call_args(args: impl IntoIterator<Item = Instr>) -> Vec<Instr> {
    let mut all = vec![Instr::I32Const(1), Instr::I32Const(0), Instr::RefNull, Instr::I64Const(0)];
    all.extend(args);
    all
}
