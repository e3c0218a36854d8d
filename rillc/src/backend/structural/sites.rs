//! Sites and the handler drive loop.

use rill_runtime::module::{BinOp, FuncIdx, Instr, NumType, TrapCode, ValType};
use rill_runtime::ResumeKind;

use super::context::{ContinuationInfo, UnitContext, DRIVE_OUTCOME, ENV_PARAM, RESUME, STARTED};
use super::{
    effect_field, fresh_call_args, rewrap, status, tag, EFFECT, EFFECT_ARGS, EFFECT_COUNT, EFFECT_ENV,
    EFFECT_ORDINAL, ENV, ENV_HANDLER, OUTCOME, VALUE, VALUE_BITS,
};
use crate::hir::{Expr, ExprKind, LocalId, OpRef, Type};
use crate::mir::sites::continuation_kinds;
use crate::mir::{EffectSite, UnitKind};

impl UnitContext<'_> {
    pub(super) fn compile_call(&mut self, expr: &Expr, callee: &Expr, args: &[Expr]) -> Instr {
        match &callee.kind {
            ExprKind::Def(def) => {
                let Some(unit) = self.lowered.units.function_unit(*def) else {
                    return self.unsupported(callee.span, &format!("a call to unknown function {def}"));
                };
                let args: Vec<Instr> = args.iter().map(|a| self.compile_expr(a)).collect();
                let func = unit as FuncIdx;
                if !self.lowered.units.units[unit].effectful {
                    return Instr::Call { func, args };
                }
                let fresh = Instr::Call {
                    func,
                    args: fresh_call_args(args),
                };
                self.site_call(expr, fresh)
            }
            ExprKind::Op { op, .. } => self.compile_perform(expr, *op, args),
            ExprKind::Intrinsic(intrinsic) => self.compile_intrinsic(expr, *intrinsic, args),
            ExprKind::Local(k) => match self.continuations.get(k).copied() {
                Some(info) => self.compile_resume(expr, *k, info, args),
                None => self.unsupported(expr.span, "a call through a value"),
            },
            _ => self.unsupported(expr.span, "a call through a value"),
        }
    }

    /// Suspend with a fresh effect outcome, or pick up the resume value.
    pub(super) fn compile_perform(&mut self, expr: &Expr, op: OpRef, args: &[Expr]) -> Instr {
        let site = self.lowered.sites.at(self.index, expr.id);
        let (Some(site), Some(ordinal)) = (site, self.metadata.ordinal_of(op)) else {
            crate::ice!("perform outside an effectful unit"; "unit" => &self.unit.name, "expr" => expr.id);
            return Instr::Unreachable(TrapCode::Unreachable);
        };
        let mut boxed = Vec::with_capacity(args.len());
        for arg in args {
            let value = self.compile_expr(arg);
            let bits = self.box_bits(&arg.ty, value, arg.span);
            let Some(tag) = tag(&arg.ty) else {
                boxed.push(Instr::Unreachable(TrapCode::UnsupportedValue));
                continue;
            };
            boxed.push(Instr::StructNew {
                ty: VALUE,
                fields: vec![Instr::I32Const(0), Instr::I32Const(tag), bits],
            });
        }
        let outcome = Instr::StructNew {
            ty: EFFECT,
            fields: vec![
                Instr::I32Const(1),
                Instr::I32Const(ordinal.ordinal as i32),
                Instr::I64Const(ordinal.effect_id as i64),
                Instr::I32Const(ordinal.op_id as i32),
                Instr::I32Const(ordinal.kind.as_u32() as i32),
                Instr::ArrayNew(boxed),
                self.site_env(site, Instr::RefNull),
                Instr::I32Const(0),
            ],
        };
        let resumed = self.unbox(&expr.ty, Instr::local(RESUME), expr.span);
        Instr::if_else(
            Instr::local(STARTED),
            vec![Instr::ret(outcome)],
            vec![Instr::set(STARTED, Instr::I32Const(1)), resumed],
        )
    }

    pub(super) fn compile_handle(&mut self, expr: &Expr) -> Instr {
        let Some(lifted) = self.lowered.units.lifted.get(&expr.id) else {
            // Nothing in the body can reach the clauses.
            return match &expr.kind {
                ExprKind::Handle { body, .. } => self.compile_expr(body),
                _ => Instr::Unreachable(TrapCode::Unreachable),
            };
        };
        let body_args = lifted.body_args.iter().map(|l| Instr::local(self.local(*l))).collect::<Vec<_>>();
        let mut args = vec![Instr::Call {
            func: lifted.body_unit as FuncIdx,
            args: fresh_call_args(body_args),
        }];
        args.extend(lifted.drive_args.iter().map(|l| Instr::local(self.local(*l))));
        let fresh = Instr::Call {
            func: lifted.drive_unit as FuncIdx,
            args: fresh_call_args(args),
        };
        self.site_call(expr, fresh)
    }

    /// `k(v)` for a clause continuation.
    fn compile_resume(&mut self, expr: &Expr, k: LocalId, info: ContinuationInfo, args: &[Expr]) -> Instr {
        let (value, ty) = match args {
            [] => (Instr::I32Const(0), Type::Unit),
            [arg] => (self.compile_expr(arg), arg.ty.clone()),
            _ => return self.unsupported(expr.span, "resuming with more than one value"),
        };
        let bits = self.box_bits(&ty, value, expr.span);
        let cont = Instr::local(self.local(k));
        let resume_body = Instr::Call {
            func: self.layout.dispatch,
            args: vec![effect_field(EFFECT_ENV, cont.clone()), bits],
        };

        match info.kind {
            ResumeKind::Tail => {
                let Some(drive) = self.drive_loop else {
                    return self.unsupported(expr.span, "a tail resumption outside its clause");
                };
                let mut body = Vec::new();
                if info.needs_guard {
                    let count = effect_field(EFFECT_COUNT, cont.clone());
                    body.push(Instr::if_else(
                        Instr::binary(BinOp::Ge, NumType::I32, count.clone(), Instr::I32Const(1)),
                        vec![Instr::Unreachable(TrapCode::TailResumeExhausted)],
                        vec![],
                    ));
                    body.push(Instr::struct_set(
                        EFFECT,
                        EFFECT_COUNT,
                        cont,
                        Instr::binary(BinOp::Add, NumType::I32, count, Instr::I32Const(1)),
                    ));
                }
                body.push(Instr::set(DRIVE_OUTCOME, resume_body));
                body.push(Instr::br(drive));
                self.block(body)
            }
            ResumeKind::Resume => {
                let mut args = vec![resume_body];
                args.extend(self.unit.params.iter().map(|p| Instr::local(self.local(*p))));
                let fresh = Instr::Call {
                    func: self.index as FuncIdx,
                    args: fresh_call_args(args),
                };
                self.site_call(expr, fresh)
            }
        }
    }

    /// Run `fresh` (or resume the callee when resuming at this site) and
    /// propagate an effect outcome with this site's environment around it.
    fn site_call(&mut self, expr: &Expr, fresh: Instr) -> Instr {
        let result = self.temp(ValType::Ref(Some(OUTCOME)));
        let bits = Instr::struct_get(VALUE, VALUE_BITS, Instr::local(result));
        let value = self.unbox(&expr.ty, bits, expr.span);

        let site = match self.lowered.sites.at(self.index, expr.id) {
            Some(site) if self.unit.effectful => site,
            _ => {
                // Nothing above this unit can handle an escaping effect.
                let body = vec![
                    Instr::set(result, fresh),
                    Instr::if_else(
                        Instr::i32_eq(status(Instr::local(result)), Instr::I32Const(1)),
                        vec![Instr::Unreachable(TrapCode::Unreachable)],
                        vec![value],
                    ),
                ];
                return self.block(body);
            }
        };

        let resume_callee = Instr::Call {
            func: self.layout.dispatch,
            args: vec![
                Instr::struct_get(ENV, ENV_HANDLER, Instr::local(ENV_PARAM)),
                Instr::local(RESUME),
            ],
        };
        let env = self.site_env(site, effect_field(EFFECT_ENV, Instr::local(result)));
        let body = vec![
            Instr::set(result, Instr::if_else(Instr::local(STARTED), vec![fresh], vec![resume_callee])),
            Instr::set(STARTED, Instr::I32Const(1)),
            Instr::if_else(
                Instr::i32_eq(status(Instr::local(result)), Instr::I32Const(1)),
                vec![Instr::ret(rewrap(|| Instr::local(result), env))],
                vec![value],
            ),
        ];
        self.block(body)
    }

    /// The environment saved at `site`.
    fn site_env(&self, site: &EffectSite, handler: Instr) -> Instr {
        let Some(ty) = self.layout.site_env.get(&site.site_id).copied() else {
            crate::ice!("site without an environment type"; "site" => site.site_id);
            return Instr::RefNull;
        };
        let mut fields = vec![Instr::I32Const(site.site_id as i32), handler];
        fields.extend(site.captures().map(|(_, field)| match field.source.local() {
            Some(l) => Instr::local(self.local(l)),
            None => Instr::RefNull,
        }));
        Instr::StructNew { ty, fields }
    }

    /// Body of a drive unit: dispatch the guarded body's outcome to a
    /// clause, finish on a value, forward anything else.
    pub(super) fn compile_drive(&mut self) -> Vec<Instr> {
        let unit = self.unit;
        let (UnitKind::Drive { handle }, ExprKind::Handle { clauses, .. }) = (unit.kind, &unit.body.kind) else {
            crate::ice!("drive unit without a handle"; "unit" => &unit.name);
            return vec![Instr::Unreachable(TrapCode::Unreachable)];
        };
        let Some(resolution) = self.analysis.handler(handle) else {
            crate::ice!("unresolved handler"; "unit" => &unit.name);
            return vec![Instr::Unreachable(TrapCode::Unreachable)];
        };
        for (k, kind) in continuation_kinds(self.analysis, unit) {
            let needs_guard = clauses
                .iter()
                .enumerate()
                .any(|(i, c)| c.continuation == k && resolution.clause(i).is_some_and(|r| r.needs_guard()));
            self.continuations.insert(k, ContinuationInfo { kind, needs_guard });
        }
        let top = self.label();
        self.drive_loop = Some(top);
        let outcome = || Instr::local(DRIVE_OUTCOME);
        let selected = self.temp(ValType::I32);

        let mut by_ordinal = Instr::I32Const(-1);
        let mut by_range = Instr::I32Const(-1);
        for (i, clause) in clauses.iter().enumerate().rev() {
            if let Some(ordinal) = resolution.clause(i).and_then(|c| self.metadata.ordinal_of(c.op)) {
                by_ordinal = Instr::if_else(
                    Instr::i32_eq(effect_field(EFFECT_ORDINAL, outcome()), Instr::I32Const(ordinal.ordinal as i32)),
                    vec![Instr::I32Const(i as i32)],
                    vec![by_ordinal],
                );
            }
            if let Some(range) = self.range(&clause.body) {
                by_range = Instr::if_else(self.in_range(Some(range)), vec![Instr::I32Const(i as i32)], vec![by_range]);
            }
        }

        let mut arms = Vec::with_capacity(clauses.len());
        for (i, clause) in clauses.iter().enumerate() {
            let Some(resolution) = resolution.clause(i) else {
                arms.push(vec![Instr::Unreachable(TrapCode::OpMismatch)]);
                continue;
            };
            let mut load = vec![Instr::set(self.local(clause.continuation), outcome())];
            for (j, param) in clause.params.iter().enumerate() {
                let ty = self.local_ty(*param);
                let arg = Instr::array_get(effect_field(EFFECT_ARGS, outcome()), j as u32);
                let value = self.unbox(&ty, Instr::struct_get(VALUE, VALUE_BITS, arg), clause.span);
                load.push(Instr::set(self.local(*param), value));
            }
            let mut arm = vec![Instr::if_else(Instr::local(STARTED), load, vec![])];

            self.clause_kind = Some(resolution.kind);
            let body = self.compile_expr(&clause.body);
            self.clause_kind = None;
            match resolution.kind {
                ResumeKind::Resume => {
                    let outcome = self.value_outcome(&unit.result, body, clause.body.span);
                    arm.push(Instr::ret(outcome));
                }
                ResumeKind::Tail => {
                    arm.push(body);
                    arm.push(Instr::Unreachable(TrapCode::TailResumeMissing));
                }
            }
            arms.push(arm);
        }

        let forward = match self.lowered.sites.at(self.index, unit.body.id) {
            Some(site) => {
                let env = self.site_env(site, effect_field(EFFECT_ENV, outcome()));
                Instr::if_else(
                    Instr::local(STARTED),
                    vec![Instr::ret(rewrap(outcome, env))],
                    vec![
                        Instr::set(
                            DRIVE_OUTCOME,
                            Instr::Call {
                                func: self.layout.dispatch,
                                args: vec![
                                    Instr::struct_get(ENV, ENV_HANDLER, Instr::local(ENV_PARAM)),
                                    Instr::local(RESUME),
                                ],
                            },
                        ),
                        Instr::set(STARTED, Instr::I32Const(1)),
                        Instr::br(top),
                    ],
                )
            }
            None => {
                crate::ice!("drive unit without a forward site"; "unit" => &unit.name);
                Instr::Unreachable(TrapCode::Unreachable)
            }
        };
        let mut dispatch = forward;
        for (i, arm) in arms.into_iter().enumerate().rev() {
            dispatch = Instr::if_else(
                Instr::i32_eq(Instr::local(selected), Instr::I32Const(i as i32)),
                arm,
                vec![dispatch],
            );
        }

        let finished = Instr::if_else(
            Instr::i32_eq(status(outcome()), Instr::I32Const(0)),
            vec![Instr::ret(outcome())],
            vec![],
        );
        vec![
            Instr::Loop {
                label: top,
                body: vec![
                    Instr::if_else(Instr::local(STARTED), vec![finished], vec![]),
                    Instr::set(
                        selected,
                        Instr::if_else(Instr::local(STARTED), vec![by_ordinal], vec![by_range]),
                    ),
                    dispatch,
                ],
            },
            Instr::Unreachable(TrapCode::Unreachable),
        ]
    }
}
