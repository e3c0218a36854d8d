//! Expressions and control flow.
//!
//! Constructs without sites compile to plain instructions. When a construct
//! contains a site, each of its parts runs only while executing normally or
//! when the site being resumed lies inside that part.

use rill_runtime::module::{BinOp as Op, Instr, TrapCode, UnOp, ValType};
use rill_runtime::ResumeKind;

use super::context::{LoopContext, UnitContext, STARTED};
use super::{literal, num_type, val_type};
use crate::hir::{BinOp, Expr, ExprKind, Intrinsic, Literal, MatchArm, Pattern, Stmt, UnaryOp};

impl UnitContext<'_> {
    pub(super) fn compile_expr(&mut self, expr: &Expr) -> Instr {
        match &expr.kind {
            ExprKind::Literal(lit) => literal(*lit, &expr.ty),
            ExprKind::Local(l) => Instr::local(self.local(*l)),
            ExprKind::Binary { op, lhs, rhs } => {
                let ty = num_type(&lhs.ty);
                let lhs = self.compile_expr(lhs);
                let rhs = self.compile_expr(rhs);
                Instr::binary(bin_op(*op), ty, lhs, rhs)
            }
            ExprKind::Unary { op, operand } => {
                let ty = num_type(&operand.ty);
                let value = self.compile_expr(operand);
                match op {
                    UnaryOp::Neg => Instr::Unary(UnOp::Neg, ty, Box::new(value)),
                    UnaryOp::Not => Instr::eqz(value),
                }
            }
            ExprKind::Call { callee, args } => self.compile_call(expr, callee, args),
            ExprKind::Perform { op, args, .. } => self.compile_perform(expr, *op, args),
            ExprKind::Block { stmts, tail } => self.compile_block(expr, stmts, tail.as_deref()),
            ExprKind::Assign { local, value } => {
                let value = self.compile_expr(value);
                let set = Instr::set(self.local(*local), value);
                self.unit_block(vec![set])
            }
            ExprKind::If {
                cond,
                then_branch,
                else_branch,
            } => self.compile_if(expr, cond, then_branch, else_branch.as_deref()),
            ExprKind::Match { scrutinee, arms } => self.compile_match(expr, scrutinee, arms),
            ExprKind::Loop { body } => self.compile_loop(expr, None, body),
            ExprKind::While { cond, body } => self.compile_loop(expr, Some(&**cond), body),
            ExprKind::Break => match self.loops.last() {
                Some(l) => Instr::Br {
                    label: l.exit,
                    value: Some(Box::new(Instr::I32Const(0))),
                },
                None => self.unsupported(expr.span, "`break` outside a loop"),
            },
            ExprKind::Continue => match self.loops.last() {
                Some(l) => Instr::br(l.top),
                None => self.unsupported(expr.span, "`continue` outside a loop"),
            },
            ExprKind::Return(value) => self.compile_return(expr, value.as_deref()),
            ExprKind::Handle { .. } => self.compile_handle(expr),
            ExprKind::Def(_)
            | ExprKind::Op { .. }
            | ExprKind::Intrinsic(_)
            | ExprKind::Closure { .. }
            | ExprKind::Tuple(_)
            | ExprKind::Field { .. } => self.unsupported_expr(expr),
        }
    }

    fn compile_block(&mut self, expr: &Expr, stmts: &[Stmt], tail: Option<&Expr>) -> Instr {
        let guarded = self.has_sites(expr);
        let mut body = Vec::with_capacity(stmts.len() + 1);
        for stmt in stmts {
            let (instr, part) = match stmt {
                Stmt::Let { local, init: Some(init) } => {
                    let value = self.compile_expr(init);
                    (Instr::set(self.local(*local), value), init)
                }
                Stmt::Let { init: None, .. } => continue,
                Stmt::Expr(e) => (self.compile_expr(e), e),
            };
            if guarded {
                body.push(Instr::if_else(self.guard(self.range(part)), vec![instr], vec![]));
            } else {
                body.push(instr);
            }
        }
        match tail {
            Some(tail) => body.push(self.compile_expr(tail)),
            None => body.push(Instr::I32Const(0)),
        }
        self.block(body)
    }

    fn compile_if(&mut self, expr: &Expr, cond: &Expr, then: &Expr, else_: Option<&Expr>) -> Instr {
        let mut test = self.compile_expr(cond);
        if self.has_sites(expr) {
            test = Instr::if_else(
                self.guard(self.range(cond)),
                vec![test],
                vec![self.in_range(self.range(then))],
            );
        }
        let then = self.compile_expr(then);
        let else_ = match else_ {
            Some(e) => self.compile_expr(e),
            None => Instr::I32Const(0),
        };
        Instr::if_else(test, vec![then], vec![else_])
    }

    /// `loop` and `while`. A resumed `while` skips its test once so the
    /// interrupted iteration can finish.
    fn compile_loop(&mut self, expr: &Expr, cond: Option<&Expr>, body: &Expr) -> Instr {
        let exit = self.label();
        let top = self.label();
        self.loops.push(LoopContext { exit, top });

        let mut iteration = Vec::new();
        if let Some(cond) = cond {
            let mut test = self.compile_expr(cond);
            if self.has_sites(expr) {
                test = Instr::if_else(self.guard(self.range(cond)), vec![test], vec![Instr::I32Const(1)]);
            }
            iteration.push(Instr::if_else(
                Instr::eqz(test),
                vec![Instr::Br {
                    label: exit,
                    value: Some(Box::new(Instr::I32Const(0))),
                }],
                vec![],
            ));
        }
        iteration.push(self.compile_expr(body));
        iteration.push(Instr::br(top));
        self.loops.pop();

        Instr::Block {
            label: exit,
            body: vec![
                Instr::Loop {
                    label: top,
                    body: iteration,
                },
                Instr::I32Const(0),
            ],
        }
    }

    fn compile_match(&mut self, expr: &Expr, scrutinee: &Expr, arms: &[MatchArm]) -> Instr {
        let guarded = self.has_sites(expr);
        let value = self.temp(val_type(&scrutinee.ty));
        let selected = self.temp(ValType::I32);
        let ty = num_type(&scrutinee.ty);

        let mut by_value = Instr::I32Const(-1);
        for (i, arm) in arms.iter().enumerate().rev() {
            by_value = match arm.pattern {
                Pattern::Wildcard | Pattern::Binding(_) => Instr::I32Const(i as i32),
                Pattern::Literal(lit) => Instr::if_else(
                    Instr::binary(Op::Eq, ty, Instr::local(value), literal(lit, &scrutinee.ty)),
                    vec![Instr::I32Const(i as i32)],
                    vec![by_value],
                ),
            };
        }
        let scrutinee_value = self.compile_expr(scrutinee);
        let by_value = vec![Instr::set(value, scrutinee_value), by_value];

        let mut body = Vec::new();
        if guarded {
            let mut by_range = Instr::I32Const(-1);
            for (i, arm) in arms.iter().enumerate().rev() {
                if let Some(range) = self.range(&arm.body) {
                    by_range = Instr::if_else(self.in_range(Some(range)), vec![Instr::I32Const(i as i32)], vec![by_range]);
                }
            }
            let select = Instr::if_else(self.guard(self.range(scrutinee)), by_value, vec![by_range]);
            body.push(Instr::set(selected, select));
        } else {
            let select = self.block(by_value);
            body.push(Instr::set(selected, select));
        }

        let mut compiled = Vec::with_capacity(arms.len());
        for arm in arms {
            let mut instrs = Vec::new();
            if let Pattern::Binding(l) = arm.pattern {
                let bind = Instr::set(self.local(l), Instr::local(value));
                if guarded {
                    instrs.push(Instr::if_else(Instr::local(STARTED), vec![bind], vec![]));
                } else {
                    instrs.push(bind);
                }
            }
            instrs.push(self.compile_expr(&arm.body));
            compiled.push(instrs);
        }
        let mut dispatch = Instr::Unreachable(TrapCode::Unreachable);
        for (i, instrs) in compiled.into_iter().enumerate().rev() {
            dispatch = Instr::if_else(
                Instr::i32_eq(Instr::local(selected), Instr::I32Const(i as i32)),
                instrs,
                vec![dispatch],
            );
        }
        body.push(dispatch);
        self.block(body)
    }

    fn compile_return(&mut self, expr: &Expr, value: Option<&Expr>) -> Instr {
        let result = self.unit.result.clone();
        let value = match value {
            Some(v) => self.compile_expr(v),
            None => Instr::I32Const(0),
        };
        if self.clause_kind == Some(ResumeKind::Tail) {
            // A tail clause leaves only through its continuation.
            return self.block(vec![value, Instr::Unreachable(TrapCode::TailResumeMissing)]);
        }
        if self.unit.effectful {
            let outcome = self.value_outcome(&result, value, expr.span);
            Instr::ret(outcome)
        } else {
            Instr::ret(value)
        }
    }

    pub(super) fn compile_intrinsic(&mut self, expr: &Expr, intrinsic: Intrinsic, args: &[Expr]) -> Instr {
        let ty = num_type(&expr.ty);
        let vt = val_type(&expr.ty);
        let values: Vec<Instr> = args.iter().map(|a| self.compile_expr(a)).collect();
        match (intrinsic, values.as_slice()) {
            (Intrinsic::Abs, [x]) => {
                let t = self.temp(vt);
                let zero = literal(Literal::Int(0), &expr.ty);
                let test = Instr::binary(Op::Lt, ty, Instr::local(t), zero);
                let body = vec![
                    Instr::set(t, x.clone()),
                    Instr::if_else(
                        test,
                        vec![Instr::Unary(UnOp::Neg, ty, Box::new(Instr::local(t)))],
                        vec![Instr::local(t)],
                    ),
                ];
                self.block(body)
            }
            (Intrinsic::Min | Intrinsic::Max, [a, b]) => {
                let (ta, tb) = (self.temp(vt), self.temp(vt));
                let le = Instr::binary(Op::Le, ty, Instr::local(ta), Instr::local(tb));
                let (first, second) = match intrinsic {
                    Intrinsic::Min => (ta, tb),
                    _ => (tb, ta),
                };
                let body = vec![
                    Instr::set(ta, a.clone()),
                    Instr::set(tb, b.clone()),
                    Instr::if_else(le, vec![Instr::local(first)], vec![Instr::local(second)]),
                ];
                self.block(body)
            }
            _ => self.unsupported(expr.span, &format!("{intrinsic:?} with {} arguments", args.len())),
        }
    }
}

fn bin_op(op: BinOp) -> Op {
    match op {
        BinOp::Add => Op::Add,
        BinOp::Sub => Op::Sub,
        BinOp::Mul => Op::Mul,
        BinOp::Div => Op::Div,
        BinOp::Rem => Op::Rem,
        BinOp::And => Op::And,
        BinOp::Or => Op::Or,
        BinOp::Eq => Op::Eq,
        BinOp::Ne => Op::Ne,
        BinOp::Lt => Op::Lt,
        BinOp::Le => Op::Le,
        BinOp::Gt => Op::Gt,
        BinOp::Ge => Op::Ge,
    }
}
