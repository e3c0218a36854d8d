//! Program fixtures shared by the integration tests.

#![allow(dead_code)]

use rill_runtime::ResumeKind;
use rillc::hir::{FnBuilder, OpRef, Program, ProgramBuilder, Type};

/// `inner(x) = perform Async.await(x) + 1`, optionally wrapped by
/// `outer() = handle inner(4) { await(v) => k(v * 2) }`.
pub fn async_program(handled: bool) -> Program {
    let mut b = ProgramBuilder::new();
    let async_ = b.effect(
        "Async",
        vec![ProgramBuilder::op("await", vec![Type::I32], Type::I32, ResumeKind::Resume)],
    );
    let await_ = OpRef::new(async_, 0);
    let inner = b.function("inner", &[("x", Type::I32)], Type::I32, |f| {
        let x = f.var(f.param(0));
        let awaited = f.perform(await_, vec![x]);
        let one = f.i32(1);
        f.add(awaited, one)
    });
    b.export(inner);
    if handled {
        let outer = b.function("outer", &[], Type::I32, |f| {
            let four = f.i32(4);
            let body = f.call(inner, vec![four]);
            let clause = f.clause(async_, "await", &[("v", Type::I32)], false, Type::I32, |f, k, params| {
                let v = f.var(params[0]);
                let two = f.i32(2);
                let doubled = f.mul(v, two);
                f.resume(k, doubled)
            });
            f.handle(body, vec![clause], None)
        });
        b.export(outer);
    }
    b.finish()
}

/// `count(n)` sums `perform Tick.tick(i)` for `i` in `0..n`.
pub fn count_program() -> Program {
    let mut b = ProgramBuilder::new();
    let tick = b.effect(
        "Tick",
        vec![ProgramBuilder::op("tick", vec![Type::I32], Type::I32, ResumeKind::Tail)],
    );
    let op = OpRef::new(tick, 0);
    let count = b.function("count", &[("n", Type::I32)], Type::I32, |f| {
        let i = f.local("i", Type::I32);
        let acc = f.local("acc", Type::I32);
        let zero = f.i32(0);
        let zero2 = f.i32(0);
        let read_i = f.var(i);
        let read_n = f.var(f.param(0));
        let cond = f.lt(read_i, read_n);
        let arg = f.var(i);
        let ticked = f.perform(op, vec![arg]);
        let read_acc = f.var(acc);
        let sum = f.add(read_acc, ticked);
        let bump_acc = f.assign(acc, sum);
        let read_i2 = f.var(i);
        let one = f.i32(1);
        let next = f.add(read_i2, one);
        let bump_i = f.assign(i, next);
        let body = f.block(vec![FnBuilder::stmt(bump_acc), FnBuilder::stmt(bump_i)], None);
        let looped = f.while_(cond, body);
        let result = f.var(acc);
        f.block(
            vec![FnBuilder::let_(i, zero), FnBuilder::let_(acc, zero2), FnBuilder::stmt(looped)],
            Some(result),
        )
    });
    b.export(count);
    b.finish()
}

/// `main() = handle { let a = State.get(); Log.emit(a); a + 1 } { get() => k(41) }`.
///
/// `Log.emit` is forwarded through the handler to the host.
pub fn forwarding_program() -> Program {
    let mut b = ProgramBuilder::new();
    let state = b.effect(
        "State",
        vec![ProgramBuilder::op("get", vec![], Type::I32, ResumeKind::Tail)],
    );
    let log = b.effect(
        "Log",
        vec![ProgramBuilder::op("emit", vec![Type::I32], Type::Unit, ResumeKind::Tail)],
    );
    let get = OpRef::new(state, 0);
    let emit = OpRef::new(log, 0);
    let main = b.function("main", &[], Type::I32, |f| {
        let a = f.local("a", Type::I32);
        let got = f.perform(get, vec![]);
        let read_a = f.var(a);
        let logged = f.perform(emit, vec![read_a]);
        let read_a2 = f.var(a);
        let one = f.i32(1);
        let result = f.add(read_a2, one);
        let body = f.block(vec![FnBuilder::let_(a, got), FnBuilder::stmt(logged)], Some(result));
        let clause = f.clause(state, "get", &[], false, Type::I32, |f, k, _| {
            let answer = f.i32(41);
            f.resume(k, answer)
        });
        f.handle(body, vec![clause], None)
    });
    b.export(main);
    b.finish()
}

/// `classify(n)` branches on `n` and asks the host on some paths:
///
/// ```text
/// match n { 0 => Ask.ask(), _ => if n < 5 { Ask.ask() + n } else { n } }
/// ```
pub fn classify_program() -> Program {
    let mut b = ProgramBuilder::new();
    let ask = b.effect(
        "Ask",
        vec![ProgramBuilder::op("ask", vec![], Type::I32, ResumeKind::Resume)],
    );
    let op = OpRef::new(ask, 0);
    let classify = b.function("classify", &[("n", Type::I32)], Type::I32, |f| {
        let n = f.param(0);
        let zero_arm = f.perform(op, vec![]);
        let read_n = f.var(n);
        let five = f.i32(5);
        let small = f.lt(read_n, five);
        let asked = f.perform(op, vec![]);
        let read_n2 = f.var(n);
        let bumped = f.add(asked, read_n2);
        let read_n3 = f.var(n);
        let other_arm = f.if_(small, bumped, Some(read_n3));
        let scrutinee = f.var(n);
        f.match_(
            scrutinee,
            vec![
                (rillc::hir::Pattern::Literal(rillc::hir::Literal::Int(0)), zero_arm),
                (rillc::hir::Pattern::Wildcard, other_arm),
            ],
        )
    });
    b.export(classify);
    b.finish()
}

/// `main() = handle (perform State.get() + 10) { get() => clause(k) }`.
pub fn state_program(clause: impl FnOnce(&mut FnBuilder<'_>, rillc::hir::LocalId) -> rillc::hir::Expr) -> Program {
    let mut b = ProgramBuilder::new();
    let state = b.effect(
        "State",
        vec![ProgramBuilder::op("get", vec![], Type::I32, ResumeKind::Tail)],
    );
    let get = OpRef::new(state, 0);
    let main = b.function("main", &[], Type::I32, |f| {
        let got = f.perform(get, vec![]);
        let ten = f.i32(10);
        let body = f.add(got, ten);
        let clause = f.clause(state, "get", &[], false, Type::I32, |f, k, _| clause(f, k));
        f.handle(body, vec![clause], None)
    });
    b.export(main);
    b.finish()
}
