//! The compiled module as the host sees it: table section, handles and the
//! resume protocol.

mod common;

use std::cell::RefCell;
use std::rc::Rc;

use rill_runtime::runner::WireHost;
use rill_runtime::table::{effect_id_hash, EFFECT_TABLE_SECTION};
use rill_runtime::wire::{encode_args, write_slot, BufferLayout};
use rill_runtime::{
    EffectTable, HandlerCall, HandlerError, HostRunner, Instance, ResumeKind, RunError, RunnerConfig, Trap,
    TrapCode, Val, ValueTag, WireValue,
};
use rillc::backend::interp::InterpError;
use rillc::config::{Backend, CompilerConfig};
use rillc::driver::{self, ExecError};
use rillc::hir::{FnBuilder, OpRef, Program, ProgramBuilder, Type};

fn config() -> CompilerConfig {
    CompilerConfig::default()
}

/// `n` nullary operations spread over effects of four, all performed by `touch`.
fn wide_program(n: usize) -> Program {
    let mut b = ProgramBuilder::new();
    let mut refs = Vec::new();
    for e in 0..n.div_ceil(4) {
        let ops = (0..(n - e * 4).min(4))
            .map(|j| {
                let kind = if j % 2 == 0 { ResumeKind::Tail } else { ResumeKind::Resume };
                ProgramBuilder::op(&format!("op{j}"), vec![], Type::I32, kind)
            })
            .collect::<Vec<_>>();
        let count = ops.len();
        let effect = b.effect(&format!("E{e}"), ops);
        refs.extend((0..count).map(|j| OpRef::new(effect, j as u32)));
    }
    let touch = b.function("touch", &[], Type::I32, |f| {
        let stmts = refs
            .iter()
            .map(|&op| {
                let performed = f.perform(op, vec![]);
                FnBuilder::stmt(performed)
            })
            .collect();
        let zero = f.i32(0);
        f.block(stmts, Some(zero))
    });
    b.export(touch);
    b.finish()
}

#[test]
fn test_table_section_round_trips() {
    for n in [0usize, 1, 16] {
        let compiled = driver::compile(&wide_program(n), &config()).unwrap();
        assert_eq!(compiled.table.len(), n);

        let section = compiled.module.custom_section(EFFECT_TABLE_SECTION).unwrap();
        assert_eq!(EffectTable::decode(section).unwrap(), compiled.table);
        assert_eq!(compiled.module.find_export("init_effects").is_some(), n > 0);

        for (ordinal, entry) in compiled.table.entries().iter().enumerate() {
            let effect = format!("E{}", ordinal / 4);
            assert_eq!(entry.label, format!("{effect}.op{}", ordinal % 4));
            assert_eq!(entry.effect_id, effect_id_hash(&effect));
            assert_eq!(entry.op_id, (ordinal % 4) as u32);
        }
    }
}

#[test]
fn test_every_ordinal_gets_its_own_handle() {
    let compiled = driver::compile(&wide_program(16), &config()).unwrap();
    let mut runner = HostRunner::new(compiled.module, RunnerConfig::default()).unwrap();
    let seen = Rc::new(RefCell::new(Vec::new()));
    for ordinal in compiled.metadata.ordinals() {
        assert_eq!(runner.handle_of(ordinal.ordinal as usize), Some(ordinal.ordinal + 1));
        let log = Rc::clone(&seen);
        runner.register(ordinal.label.as_str(), move |call| {
            log.borrow_mut().push((call.op_index, call.handle, call.resume_kind));
            Ok(WireValue::I32(call.op_index as i32))
        });
    }
    assert_eq!(runner.run("touch", &[]).unwrap(), WireValue::I32(0));

    let seen = seen.borrow();
    assert_eq!(seen.len(), 16);
    for (i, &(op_index, handle, kind)) in seen.iter().enumerate() {
        assert_eq!(op_index, i as u32);
        assert_eq!(handle, i as u32 + 1);
        let expected = if i % 2 == 0 { ResumeKind::Tail } else { ResumeKind::Resume };
        assert_eq!(kind, expected);
    }
}

#[test]
fn test_hashed_key_beats_the_label() {
    let compiled = driver::compile(&common::async_program(false), &config()).unwrap();
    let entry = compiled.table.get(0).unwrap().clone();
    let mut runner = HostRunner::new(compiled.module, RunnerConfig::default()).unwrap();

    runner.register("Async.await", |_| Ok(WireValue::I32(0)));
    runner.register(format!("{:016x}:{}", entry.effect_id, entry.op_id), |call| match call.args.as_slice() {
        [WireValue::I32(v)] => Ok(WireValue::I32(v * 2)),
        _ => Err(HandlerError("bad args".into())),
    });
    assert_eq!(runner.run("inner", &[WireValue::I32(4)]).unwrap(), WireValue::I32(9));
}

#[test]
fn test_unregistered_operation_is_reported() {
    let compiled = driver::compile(&common::async_program(false), &config()).unwrap();
    let mut runner = HostRunner::new(compiled.module, RunnerConfig::default()).unwrap();
    let err = runner.run("inner", &[WireValue::I32(4)]).unwrap_err();
    assert!(matches!(&err, RunError::MissingHandler { label } if label == "Async.await"), "{err}");
}

#[test]
fn test_recompilation_is_deterministic() {
    let program = common::async_program(true);
    let first = driver::compile(&program, &config()).unwrap();
    let second = driver::compile(&program, &config()).unwrap();
    assert_eq!(first.module, second.module);
    assert_eq!(first.table, second.table);

    let exports: Vec<&str> = first.module.exports.iter().map(|e| e.name.as_str()).collect();
    insta::assert_snapshot!(exports.join("\n"), @r"
    resume$dispatch
    handle_outcome
    effect_status
    effect_cont
    read_value
    outcome_bits
    resume_effectful
    init_effects
    inner_effectful
    outer_effectful
    ");
}

#[test]
fn test_host_tail_continuation_is_single_use() {
    let mut b = ProgramBuilder::new();
    let ask = b.effect("Ask", vec![ProgramBuilder::op("ask", vec![], Type::I32, ResumeKind::Tail)]);
    let main = b.function("main", &[], Type::I32, |f| f.perform(OpRef::new(ask, 0), vec![]));
    b.export(main);
    let compiled = driver::compile(&b.finish(), &config()).unwrap();

    let layout = BufferLayout::from_memory_size(compiled.table.len(), compiled.module.memory_size);
    let (buf, len) = (layout.buffer_offset, layout.buffer_len);
    let ptr_args = [Val::I32(buf as i32), Val::I32(len as i32)];
    let mut instance = Instance::new(Rc::new(compiled.module), 256);

    let count = instance.invoke("init_effects", &[], &mut WireHost).unwrap();
    assert!(matches!(count, Some(Val::I32(1))), "{count:?}");
    let at = layout.handle_slot(0);
    instance.memory_mut()[at..at + 4].copy_from_slice(&1u32.to_le_bytes());
    encode_args(&mut instance.memory_mut()[buf..buf + len], &[]).unwrap();

    let outcome = instance.invoke("main_effectful", &ptr_args, &mut WireHost).unwrap().unwrap();
    let status = instance.invoke("effect_status", &[outcome.clone()], &mut WireHost).unwrap();
    assert!(matches!(status, Some(Val::I32(1))), "{status:?}");

    write_slot(&mut instance.memory_mut()[buf..buf + len], WireValue::I32(5)).unwrap();
    let cont = instance.invoke("effect_cont", &[outcome], &mut WireHost).unwrap().unwrap();
    let resume_args = [cont, Val::I32(buf as i32), Val::I32(len as i32)];

    let done = instance.invoke("resume_effectful", &resume_args, &mut WireHost).unwrap().unwrap();
    let status = instance.invoke("effect_status", &[done], &mut WireHost).unwrap();
    assert!(matches!(status, Some(Val::I32(0))), "{status:?}");

    write_slot(&mut instance.memory_mut()[buf..buf + len], WireValue::I32(6)).unwrap();
    let err = instance.invoke("resume_effectful", &resume_args, &mut WireHost).unwrap_err();
    assert_eq!(err, Trap::Code(TrapCode::TailResumeExhausted));
}

#[test]
fn test_read_value_export_reads_linear_memory() {
    let compiled = driver::compile(&common::async_program(false), &config()).unwrap();
    let layout = BufferLayout::from_memory_size(compiled.table.len(), compiled.module.memory_size);
    let (buf, len) = (layout.buffer_offset, layout.buffer_len);
    let mut instance = Instance::new(Rc::new(compiled.module), 256);
    write_slot(&mut instance.memory_mut()[buf..buf + len], WireValue::I32(-7)).unwrap();

    let read = |instance: &mut Instance, tag: ValueTag| {
        let args = [Val::I32(tag.as_u32() as i32), Val::I32(buf as i32), Val::I32(len as i32)];
        instance.invoke("read_value", &args, &mut WireHost)
    };
    let bits = read(&mut instance, ValueTag::I32).unwrap();
    assert!(matches!(bits, Some(Val::I64(b)) if b == WireValue::I32(-7).to_bits() as i64), "{bits:?}");
    assert!(read(&mut instance, ValueTag::F64).is_err());
}

#[test]
fn test_unresumed_tail_clause_traps_on_both_backends() {
    // `while false { k(1) }` passes the static check but never resumes.
    let program = common::state_program(|f, k| {
        let no = f.bool(false);
        let one = f.i32(1);
        let resumed = f.resume(k, one);
        let looped = f.while_(no, resumed);
        let zero = f.i32(0);
        f.block(vec![FnBuilder::stmt(looped)], Some(zero))
    });
    let runner = RunnerConfig::default();
    let unexpected =
        |call: &HandlerCall| -> Result<WireValue, HandlerError> { Err(HandlerError(format!("unexpected {}", call.label))) };

    let interp = CompilerConfig::builder().backend(Backend::Interp).build().unwrap();
    let err = driver::execute(&program, &interp, &runner, "main", &[], unexpected).unwrap_err();
    assert!(
        matches!(err, ExecError::Interp(InterpError::Trap(TrapCode::TailResumeMissing))),
        "{err}"
    );

    let structural = CompilerConfig::builder().backend(Backend::Structural).build().unwrap();
    let err = driver::execute(&program, &structural, &runner, "main", &[], unexpected).unwrap_err();
    assert!(
        matches!(err, ExecError::Run(RunError::Trap(Trap::Code(TrapCode::TailResumeMissing)))),
        "{err}"
    );
}
