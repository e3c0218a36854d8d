//! Host-facing glue: imports, the resume dispatcher and the exports the
//! host runner drives.
//!
//! | Export | Signature |
//! |--------|-----------|
//! | `<f>_effectful` | `(buf, len) -> ref $outcome` |
//! | `effect_status` | `(o) -> i32`, `0` value, `1` effect |
//! | `effect_cont` | `(o) -> ref $outcome`, traps on a value |
//! | `read_value` | `(tag, ptr, len) -> i64`, one slot from linear memory |
//! | `outcome_bits` | `(o) -> i64`, raw bits of a value outcome |
//! | `resume_effectful` | `(cont, buf, len) -> ref $outcome` |
//! | `init_effects` | `() -> i32`, only when the table is non-empty |
//!
//! Every outcome handed to the host has already been written to the
//! buffer: values as a single slot, effects as an envelope whose arguments
//! were staged in the scratch area.

use rill_runtime::module::{
    BinOp, FuncIdx, Function, Import, Instr, Label, NumType, TrapCode, ValType,
};
use rill_runtime::runner::HOST_MODULE;
use rill_runtime::wire::{ARGS_HEADER_SIZE, MAX_WIRE_ARGS, SLOT_SIZE};
use rill_runtime::{BufferLayout, Module};
use tracing::debug;

use super::{
    default_value, effect_field, fresh_call_args, status, tag, unbox, value_outcome, within, ModuleLayout,
    EFFECT, EFFECT_ARGS, EFFECT_COUNT, EFFECT_ENV, EFFECT_ID, EFFECT_KIND, EFFECT_OP, EFFECT_ORDINAL, ENV,
    ENV_SITE, IMPORT_READ_VALUE, IMPORT_WRITE_EFFECT, IMPORT_WRITE_VALUE, OUTCOME, VALUE, VALUE_BITS, VALUE_TAG,
};
use crate::diagnostics::{Diagnostic, ErrorCode};
use crate::mir::{EffectMetadata, LoweredProgram};

const OUTCOME_REF: ValType = ValType::Ref(Some(OUTCOME));

pub(super) fn declare_imports(module: &mut Module) {
    let import = |name: &str, params: Vec<ValType>, result: ValType| Import {
        module: HOST_MODULE.to_string(),
        name: name.to_string(),
        params,
        result: Some(result),
    };
    use ValType::{I32, I64};
    let write_value = module.add_import(import("write_value", vec![I32, I64, I32, I32], I32));
    let write_effect = module.add_import(import(
        "write_effect",
        vec![I64, I32, I32, I32, I32, I32, I32, I32, I32],
        I32,
    ));
    let read_value = module.add_import(import("read_value", vec![I32, I32, I32], I64));
    debug_assert_eq!(
        (write_value, write_effect, read_value),
        (IMPORT_WRITE_VALUE, IMPORT_WRITE_EFFECT, IMPORT_READ_VALUE)
    );
}

/// Emit the dispatcher and host exports after the unit functions.
pub(super) fn emit_glue(
    module: &mut Module,
    lowered: &LoweredProgram,
    metadata: &EffectMetadata,
    layout: &ModuleLayout,
    buffer: &BufferLayout,
    diagnostics: &mut Vec<Diagnostic>,
) {
    let dispatch = module.add_function(resume_dispatch(lowered, layout));
    let handle_outcome = module.add_function(handle_outcome(buffer));
    if (dispatch, handle_outcome) != (layout.dispatch, layout.handle_outcome) {
        crate::ice!("glue emitted at the wrong index"; "dispatch" => dispatch, "expected" => layout.dispatch);
    }
    module.export("resume$dispatch", dispatch);
    module.export("handle_outcome", handle_outcome);

    let status_fn = module.add_function(Function {
        name: "effect_status".into(),
        params: vec![OUTCOME_REF],
        locals: vec![],
        result: Some(ValType::I32),
        body: vec![status(Instr::local(0))],
    });
    module.export("effect_status", status_fn);

    let cont = module.add_function(Function {
        name: "effect_cont".into(),
        params: vec![OUTCOME_REF],
        locals: vec![],
        result: Some(OUTCOME_REF),
        body: vec![
            Instr::if_else(
                Instr::i32_eq(status(Instr::local(0)), Instr::I32Const(1)),
                vec![],
                vec![Instr::Unreachable(TrapCode::Unreachable)],
            ),
            Instr::local(0),
        ],
    });
    module.export("effect_cont", cont);

    let read = module.add_function(Function {
        name: "read_value".into(),
        params: vec![ValType::I32, ValType::I32, ValType::I32],
        locals: vec![],
        result: Some(ValType::I64),
        body: vec![Instr::CallImport {
            import: IMPORT_READ_VALUE,
            args: vec![Instr::local(0), Instr::local(1), Instr::local(2)],
        }],
    });
    module.export("read_value", read);

    let bits = module.add_function(Function {
        name: "outcome_bits".into(),
        params: vec![OUTCOME_REF],
        locals: vec![],
        result: Some(ValType::I64),
        body: vec![Instr::struct_get(VALUE, VALUE_BITS, Instr::local(0))],
    });
    module.export("outcome_bits", bits);

    let resume = module.add_function(resume_effectful(metadata, layout));
    module.export("resume_effectful", resume);

    if metadata.op_count() > 0 {
        let mut body: Vec<Instr> = (0..metadata.op_count())
            .map(|i| Instr::store32(Instr::I32Const(buffer.handle_slot(i) as i32), Instr::I32Const(0)))
            .collect();
        body.push(Instr::I32Const(metadata.op_count() as i32));
        let init = module.add_function(Function {
            name: "init_effects".into(),
            params: vec![],
            locals: vec![],
            result: Some(ValType::I32),
            body,
        });
        module.export("init_effects", init);
    }

    for function in &lowered.program.functions {
        if !function.exported {
            continue;
        }
        let Some(unit) = lowered.units.function_unit(function.def) else {
            continue;
        };
        let params = function.param_types();
        let wire = params.iter().chain([&function.ret]).all(|t| t.value_tag().is_some());
        if !wire {
            diagnostics.push(Diagnostic::coded(
                ErrorCode::StructuralUnsupported,
                format!("exported function `{}` has a signature the host cannot call", function.name),
                function.span,
            ));
            continue;
        }
        let args = params.iter().enumerate().map(|(i, ty)| {
            let at = Instr::binary(
                BinOp::Add,
                NumType::I32,
                Instr::local(0),
                Instr::I32Const((ARGS_HEADER_SIZE + i * SLOT_SIZE) as i32),
            );
            let bits = Instr::CallImport {
                import: IMPORT_READ_VALUE,
                args: vec![Instr::I32Const(tag(ty).unwrap_or(0)), at, Instr::I32Const(SLOT_SIZE as i32)],
            };
            unbox(ty, bits).unwrap_or(Instr::Unreachable(TrapCode::UnsupportedValue))
        });
        let args: Vec<Instr> = args.collect();
        let call = if lowered.units.units[unit].effectful {
            Instr::Call {
                func: unit as FuncIdx,
                args: fresh_call_args(args),
            }
        } else {
            let call = Instr::Call {
                func: unit as FuncIdx,
                args,
            };
            value_outcome(&function.ret, call).unwrap_or(Instr::Unreachable(TrapCode::UnsupportedValue))
        };
        let name = format!("{}_effectful", function.name);
        let entry = module.add_function(Function {
            name: name.clone(),
            params: vec![ValType::I32, ValType::I32],
            locals: vec![],
            result: Some(OUTCOME_REF),
            body: vec![
                Instr::if_else(
                    Instr::binary(
                        BinOp::Ne,
                        NumType::I32,
                        Instr::load32(Instr::local(0)),
                        Instr::I32Const(params.len() as i32),
                    ),
                    vec![Instr::Unreachable(TrapCode::ArityMismatch)],
                    vec![],
                ),
                Instr::Call {
                    func: layout.handle_outcome,
                    args: vec![call, Instr::local(0), Instr::local(1)],
                },
            ],
        });
        module.export(name, entry);
    }
    debug!(exports = module.exports.len(), "emitted glue");
}

/// `resume$dispatch(env, bits)`: re-enter the unit owning `env.site`.
fn resume_dispatch(lowered: &LoweredProgram, layout: &ModuleLayout) -> Function {
    let site = || Instr::struct_get(ENV, ENV_SITE, Instr::local(0));
    let mut body = Vec::new();
    for (index, unit) in lowered.units.units.iter().enumerate() {
        let Some((lo, hi)) = lowered.sites.layouts.get(index).and_then(|l| l.range()) else {
            continue;
        };
        let mut args = vec![Instr::I32Const(0), site(), Instr::local(0), Instr::local(1)];
        if unit.is_drive() {
            args.push(Instr::RefNull);
        }
        args.extend(layout.unit_params[index].iter().map(|ty| default_value(*ty)));
        body.push(Instr::if_else(
            within(site(), lo, hi),
            vec![Instr::ret(Instr::Call {
                func: index as FuncIdx,
                args,
            })],
            vec![],
        ));
    }
    body.push(Instr::Unreachable(TrapCode::UnknownSite));
    Function {
        name: "resume$dispatch".into(),
        params: vec![ValType::Ref(Some(ENV)), ValType::I64],
        locals: vec![],
        result: Some(OUTCOME_REF),
        body,
    }
}

/// `handle_outcome(o, buf, len)`: write `o` for the host and return it.
fn handle_outcome(buffer: &BufferLayout) -> Function {
    const O: u32 = 0;
    const BUF: u32 = 1;
    const LEN: u32 = 2;
    const COUNT: u32 = 3;
    const I: u32 = 4;
    const ARG: u32 = 5;
    let (exit, top) = (Label(0), Label(1));

    let overflow = |call: Instr| {
        Instr::if_else(call, vec![Instr::Unreachable(TrapCode::BufferOverflow)], vec![])
    };
    let write_value = |value: Instr, at: Instr, len: Instr| {
        overflow(Instr::CallImport {
            import: IMPORT_WRITE_VALUE,
            args: vec![
                Instr::struct_get(VALUE, VALUE_TAG, value.clone()),
                Instr::struct_get(VALUE, VALUE_BITS, value),
                at,
                len,
            ],
        })
    };
    let field = |f: u32| effect_field(f, Instr::local(O));
    let i32_op = |op: BinOp, a: Instr, b: Instr| Instr::binary(op, NumType::I32, a, b);
    let scratch = buffer.scratch_offset as i32;

    let stage_args = Instr::Block {
        label: exit,
        body: vec![Instr::Loop {
            label: top,
            body: vec![
                Instr::if_else(
                    i32_op(BinOp::Ge, Instr::local(I), Instr::local(COUNT)),
                    vec![Instr::Br { label: exit, value: None }],
                    vec![],
                ),
                Instr::set(
                    ARG,
                    Instr::ArrayGet {
                        array: Box::new(field(EFFECT_ARGS)),
                        index: Box::new(Instr::local(I)),
                    },
                ),
                write_value(
                    Instr::local(ARG),
                    i32_op(
                        BinOp::Add,
                        Instr::I32Const(scratch),
                        i32_op(BinOp::Mul, Instr::local(I), Instr::I32Const(SLOT_SIZE as i32)),
                    ),
                    Instr::I32Const(SLOT_SIZE as i32),
                ),
                Instr::set(I, i32_op(BinOp::Add, Instr::local(I), Instr::I32Const(1))),
                Instr::br(top),
            ],
        }],
    };
    let write_effect = overflow(Instr::CallImport {
        import: IMPORT_WRITE_EFFECT,
        args: vec![
            field(EFFECT_ID),
            field(EFFECT_OP),
            field(EFFECT_ORDINAL),
            field(EFFECT_KIND),
            Instr::load32(i32_op(BinOp::Mul, field(EFFECT_ORDINAL), Instr::I32Const(4))),
            Instr::I32Const(scratch),
            Instr::local(COUNT),
            Instr::local(BUF),
            Instr::local(LEN),
        ],
    });

    Function {
        name: "handle_outcome".into(),
        params: vec![OUTCOME_REF, ValType::I32, ValType::I32],
        locals: vec![ValType::I32, ValType::I32, ValType::Ref(None)],
        result: Some(OUTCOME_REF),
        body: vec![
            Instr::if_else(
                Instr::i32_eq(status(Instr::local(O)), Instr::I32Const(0)),
                vec![write_value(Instr::local(O), Instr::local(BUF), Instr::local(LEN))],
                vec![
                    Instr::set(COUNT, Instr::ArrayLen(Box::new(field(EFFECT_ARGS)))),
                    Instr::if_else(
                        i32_op(BinOp::Gt, Instr::local(COUNT), Instr::I32Const(MAX_WIRE_ARGS as i32)),
                        vec![Instr::Unreachable(TrapCode::UnsupportedValue)],
                        vec![],
                    ),
                    Instr::set(I, Instr::I32Const(0)),
                    stage_args,
                    write_effect,
                ],
            ),
            Instr::local(O),
        ],
    }
}

/// `resume_effectful(cont, buf, len)`: read the host's answer and re-enter
/// the suspended computation.
fn resume_effectful(metadata: &EffectMetadata, layout: &ModuleLayout) -> Function {
    const CONT: u32 = 0;
    const BUF: u32 = 1;
    const LEN: u32 = 2;
    const BITS: u32 = 3;
    let field = |f: u32| effect_field(f, Instr::local(CONT));

    let mut answer = Instr::Unreachable(TrapCode::OpMismatch);
    for ordinal in metadata.ordinals().iter().rev() {
        let matches = Instr::binary(
            BinOp::And,
            NumType::I32,
            Instr::binary(BinOp::Eq, NumType::I64, field(EFFECT_ID), Instr::I64Const(ordinal.effect_id as i64)),
            Instr::i32_eq(field(EFFECT_OP), Instr::I32Const(ordinal.op_id as i32)),
        );
        let read = match tag(&ordinal.ret) {
            Some(tag) => Instr::CallImport {
                import: IMPORT_READ_VALUE,
                args: vec![Instr::I32Const(tag), Instr::local(BUF), Instr::local(LEN)],
            },
            None => Instr::Unreachable(TrapCode::UnsupportedValue),
        };
        answer = Instr::if_else(matches, vec![read], vec![answer]);
    }

    let count = field(EFFECT_COUNT);
    let single_use = Instr::if_else(
        Instr::i32_eq(field(EFFECT_KIND), Instr::I32Const(1)),
        vec![
            Instr::if_else(
                Instr::binary(BinOp::Ge, NumType::I32, count.clone(), Instr::I32Const(1)),
                vec![Instr::Unreachable(TrapCode::TailResumeExhausted)],
                vec![],
            ),
            Instr::struct_set(
                EFFECT,
                EFFECT_COUNT,
                Instr::local(CONT),
                Instr::binary(BinOp::Add, NumType::I32, count, Instr::I32Const(1)),
            ),
        ],
        vec![],
    );
    let resumed = Instr::Call {
        func: layout.dispatch,
        args: vec![field(EFFECT_ENV), Instr::local(BITS)],
    };

    Function {
        name: "resume_effectful".into(),
        params: vec![OUTCOME_REF, ValType::I32, ValType::I32],
        locals: vec![ValType::I64],
        result: Some(OUTCOME_REF),
        body: vec![
            single_use,
            Instr::set(BITS, answer),
            Instr::Call {
                func: layout.handle_outcome,
                args: vec![resumed, Instr::local(BUF), Instr::local(LEN)],
            },
        ],
    }
}
