//! Programmatic construction of typed programs.
//!
//! The front end normally produces [`Program`]s; the builder lets tests and
//! tools assemble them directly with correct types and unique expression ids.
//!
//! ```rust,ignore
//! let mut b = ProgramBuilder::new();
//! let state = b.effect("State", vec![ProgramBuilder::op("get", vec![], Type::I32, ResumeKind::Tail)]);
//! let get = OpRef::new(state, 0);
//! b.function("read", &[], Type::I32, |f| f.perform(get, vec![]));
//! let program = b.finish();
//! ```

use rill_runtime::ResumeKind;

use super::def::{DefId, LocalId, OpRef};
use super::expr::{BinOp, Expr, ExprKind, HandlerClause, Intrinsic, Literal, MatchArm, Pattern, Stmt, UnaryOp};
use super::item::{DeclaredRow, EffectDecl, FnDecl, LocalDecl, OpDecl};
use super::ty::Type;
use super::{ExprIdGen, Program};
use crate::span::Span;

/// Builds a [`Program`].
pub struct ProgramBuilder {
    program: Program,
    next_def: u32,
    ids: ExprIdGen,
}

impl Default for ProgramBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl ProgramBuilder {
    pub fn new() -> Self {
        Self {
            program: Program::new(),
            next_def: 0,
            ids: ExprIdGen::starting_at(1),
        }
    }

    fn fresh_def(&mut self) -> DefId {
        let def = DefId::new(self.next_def);
        self.next_def += 1;
        def
    }

    /// A non-generic operation declaration.
    pub fn op(name: &str, params: Vec<Type>, ret: Type, kind: ResumeKind) -> OpDecl {
        Self::generic_op(name, 0, params, ret, kind)
    }

    /// An operation with `generics` type parameters.
    pub fn generic_op(name: &str, generics: u32, params: Vec<Type>, ret: Type, kind: ResumeKind) -> OpDecl {
        OpDecl {
            name: name.to_string(),
            generics,
            params,
            ret,
            kind,
        }
    }

    pub fn effect(&mut self, name: &str, ops: Vec<OpDecl>) -> DefId {
        let def = self.fresh_def();
        self.program.effects.push(EffectDecl {
            def,
            name: name.to_string(),
            ops,
            span: Span::dummy(),
        });
        def
    }

    /// Declare a function signature; the body is supplied by [`define_fn`](Self::define_fn).
    pub fn declare_fn(&mut self, name: &str, params: &[(&str, Type)], ret: Type) -> DefId {
        let def = self.fresh_def();
        let locals: Vec<LocalDecl> = params
            .iter()
            .map(|(n, ty)| LocalDecl {
                name: n.to_string(),
                ty: ty.clone(),
            })
            .collect();
        let body = Expr {
            id: self.ids.fresh(),
            kind: ExprKind::Literal(Literal::Unit),
            ty: Type::Unit,
            span: Span::dummy(),
        };
        self.program.functions.push(FnDecl {
            def,
            name: name.to_string(),
            params: (0..params.len() as u32).map(LocalId::new).collect(),
            ret,
            locals,
            body,
            effects: None,
            exported: false,
            span: Span::dummy(),
        });
        def
    }

    /// Supply the body of a declared function.
    pub fn define_fn(&mut self, def: DefId, body: impl FnOnce(&mut FnBuilder<'_>) -> Expr) {
        let Some(index) = self.program.functions.iter().position(|f| f.def == def) else {
            return;
        };
        let (locals, params) = {
            let f = &self.program.functions[index];
            (f.locals.clone(), f.params.clone())
        };
        let mut builder = FnBuilder {
            program: &self.program,
            ids: &mut self.ids,
            locals,
            params,
        };
        let expr = body(&mut builder);
        let locals = builder.locals;
        let function = &mut self.program.functions[index];
        function.locals = locals;
        function.body = expr;
    }

    /// Declare and define a function in one step.
    pub fn function(
        &mut self,
        name: &str,
        params: &[(&str, Type)],
        ret: Type,
        body: impl FnOnce(&mut FnBuilder<'_>) -> Expr,
    ) -> DefId {
        let def = self.declare_fn(name, params, ret);
        self.define_fn(def, body);
        def
    }

    /// Mark a function as callable by the host.
    pub fn export(&mut self, def: DefId) {
        if let Some(f) = self.program.functions.iter_mut().find(|f| f.def == def) {
            f.exported = true;
        }
    }

    /// Attach a declared effect row to a function.
    pub fn declare_effects(&mut self, def: DefId, ops: &[&str], open: bool) {
        if let Some(f) = self.program.functions.iter_mut().find(|f| f.def == def) {
            f.effects = Some(DeclaredRow {
                ops: ops.iter().map(|s| s.to_string()).collect(),
                open,
            });
        }
    }

    pub fn program(&self) -> &Program {
        &self.program
    }

    pub fn finish(self) -> Program {
        self.program
    }
}

/// Builds the body of one function.
pub struct FnBuilder<'b> {
    program: &'b Program,
    ids: &'b mut ExprIdGen,
    locals: Vec<LocalDecl>,
    params: Vec<LocalId>,
}

impl<'b> FnBuilder<'b> {
    /// The `index`th parameter.
    pub fn param(&self, index: usize) -> LocalId {
        self.params[index]
    }

    pub fn local(&mut self, name: &str, ty: Type) -> LocalId {
        self.locals.push(LocalDecl {
            name: name.to_string(),
            ty,
        });
        LocalId::new((self.locals.len() - 1) as u32)
    }

    pub fn local_ty(&self, id: LocalId) -> Type {
        self.locals
            .get(id.index as usize)
            .map(|l| l.ty.clone())
            .unwrap_or(Type::Unit)
    }

    pub fn expr(&mut self, kind: ExprKind, ty: Type) -> Expr {
        Expr {
            id: self.ids.fresh(),
            kind,
            ty,
            span: Span::dummy(),
        }
    }

    /// Give an expression a source span.
    pub fn at(mut expr: Expr, start: usize, end: usize) -> Expr {
        expr.span = Span::new(start, end);
        expr
    }

    // ------------------------------------------------------------------
    // Literals and variables
    // ------------------------------------------------------------------

    pub fn unit(&mut self) -> Expr {
        self.expr(ExprKind::Literal(Literal::Unit), Type::Unit)
    }

    pub fn bool(&mut self, v: bool) -> Expr {
        self.expr(ExprKind::Literal(Literal::Bool(v)), Type::Bool)
    }

    pub fn i32(&mut self, v: i32) -> Expr {
        self.expr(ExprKind::Literal(Literal::Int(v as i64)), Type::I32)
    }

    pub fn i64(&mut self, v: i64) -> Expr {
        self.expr(ExprKind::Literal(Literal::Int(v)), Type::I64)
    }

    pub fn f32(&mut self, v: f32) -> Expr {
        self.expr(ExprKind::Literal(Literal::Float(v as f64)), Type::F32)
    }

    pub fn f64(&mut self, v: f64) -> Expr {
        self.expr(ExprKind::Literal(Literal::Float(v)), Type::F64)
    }

    pub fn var(&mut self, id: LocalId) -> Expr {
        let ty = self.local_ty(id);
        self.expr(ExprKind::Local(id), ty)
    }

    // ------------------------------------------------------------------
    // Operators
    // ------------------------------------------------------------------

    pub fn binary(&mut self, op: BinOp, lhs: Expr, rhs: Expr) -> Expr {
        let ty = if op.is_comparison() { Type::Bool } else { lhs.ty.clone() };
        self.expr(
            ExprKind::Binary {
                op,
                lhs: Box::new(lhs),
                rhs: Box::new(rhs),
            },
            ty,
        )
    }

    pub fn add(&mut self, lhs: Expr, rhs: Expr) -> Expr {
        self.binary(BinOp::Add, lhs, rhs)
    }

    pub fn sub(&mut self, lhs: Expr, rhs: Expr) -> Expr {
        self.binary(BinOp::Sub, lhs, rhs)
    }

    pub fn mul(&mut self, lhs: Expr, rhs: Expr) -> Expr {
        self.binary(BinOp::Mul, lhs, rhs)
    }

    pub fn lt(&mut self, lhs: Expr, rhs: Expr) -> Expr {
        self.binary(BinOp::Lt, lhs, rhs)
    }

    pub fn eq(&mut self, lhs: Expr, rhs: Expr) -> Expr {
        self.binary(BinOp::Eq, lhs, rhs)
    }

    pub fn unary(&mut self, op: UnaryOp, operand: Expr) -> Expr {
        let ty = operand.ty.clone();
        self.expr(
            ExprKind::Unary {
                op,
                operand: Box::new(operand),
            },
            ty,
        )
    }

    // ------------------------------------------------------------------
    // Calls and effects
    // ------------------------------------------------------------------

    /// Direct call of a declared function.
    pub fn call(&mut self, def: DefId, args: Vec<Expr>) -> Expr {
        let (fn_ty, ret) = match self.program.function(def) {
            Some(f) => (Type::func(f.param_types(), f.ret.clone()), f.ret.clone()),
            None => (Type::func(vec![], Type::Unit), Type::Unit),
        };
        let callee = self.expr(ExprKind::Def(def), fn_ty);
        self.expr(
            ExprKind::Call {
                callee: Box::new(callee),
                args,
            },
            ret,
        )
    }

    /// Call of a callable value (closure, continuation, intrinsic, operation).
    pub fn call_value(&mut self, callee: Expr, args: Vec<Expr>) -> Expr {
        let ret = match &callee.ty {
            Type::Fn { ret, .. } | Type::Continuation { ret, .. } => (**ret).clone(),
            _ => Type::Unit,
        };
        self.expr(
            ExprKind::Call {
                callee: Box::new(callee),
                args,
            },
            ret,
        )
    }

    /// Invoke a continuation bound to `k`.
    pub fn resume(&mut self, k: LocalId, value: Expr) -> Expr {
        let callee = self.var(k);
        self.call_value(callee, vec![value])
    }

    pub fn perform(&mut self, op: OpRef, args: Vec<Expr>) -> Expr {
        self.perform_generic(op, vec![], args)
    }

    pub fn perform_generic(&mut self, op: OpRef, type_args: Vec<Type>, args: Vec<Expr>) -> Expr {
        let ret = self
            .program
            .op(op)
            .map(|decl| decl.ret.substitute(&type_args))
            .unwrap_or(Type::Unit);
        self.expr(ExprKind::Perform { op, args, type_args }, ret)
    }

    /// An operation as a first-class callable.
    pub fn op_value(&mut self, op: OpRef) -> Expr {
        let ty = self
            .program
            .op(op)
            .map(|decl| Type::func(decl.params.clone(), decl.ret.clone()))
            .unwrap_or(Type::Unit);
        self.expr(ExprKind::Op { op, type_args: vec![] }, ty)
    }

    pub fn intrinsic(&mut self, intrinsic: Intrinsic, ty: Type) -> Expr {
        self.expr(ExprKind::Intrinsic(intrinsic), ty)
    }

    // ------------------------------------------------------------------
    // Blocks and control flow
    // ------------------------------------------------------------------

    pub fn block(&mut self, stmts: Vec<Stmt>, tail: Option<Expr>) -> Expr {
        let ty = tail.as_ref().map(|t| t.ty.clone()).unwrap_or(Type::Unit);
        self.expr(
            ExprKind::Block {
                stmts,
                tail: tail.map(Box::new),
            },
            ty,
        )
    }

    pub fn let_(local: LocalId, init: Expr) -> Stmt {
        Stmt::Let {
            local,
            init: Some(init),
        }
    }

    pub fn stmt(expr: Expr) -> Stmt {
        Stmt::Expr(expr)
    }

    pub fn assign(&mut self, local: LocalId, value: Expr) -> Expr {
        self.expr(
            ExprKind::Assign {
                local,
                value: Box::new(value),
            },
            Type::Unit,
        )
    }

    pub fn if_(&mut self, cond: Expr, then_branch: Expr, else_branch: Option<Expr>) -> Expr {
        let ty = if else_branch.is_some() {
            then_branch.ty.clone()
        } else {
            Type::Unit
        };
        self.expr(
            ExprKind::If {
                cond: Box::new(cond),
                then_branch: Box::new(then_branch),
                else_branch: else_branch.map(Box::new),
            },
            ty,
        )
    }

    pub fn match_(&mut self, scrutinee: Expr, arms: Vec<(Pattern, Expr)>) -> Expr {
        let ty = arms.first().map(|(_, e)| e.ty.clone()).unwrap_or(Type::Unit);
        let arms = arms
            .into_iter()
            .map(|(pattern, body)| MatchArm { pattern, body })
            .collect();
        self.expr(
            ExprKind::Match {
                scrutinee: Box::new(scrutinee),
                arms,
            },
            ty,
        )
    }

    pub fn loop_(&mut self, body: Expr) -> Expr {
        self.expr(ExprKind::Loop { body: Box::new(body) }, Type::Unit)
    }

    pub fn while_(&mut self, cond: Expr, body: Expr) -> Expr {
        self.expr(
            ExprKind::While {
                cond: Box::new(cond),
                body: Box::new(body),
            },
            Type::Unit,
        )
    }

    pub fn break_(&mut self) -> Expr {
        self.expr(ExprKind::Break, Type::Unit)
    }

    pub fn continue_(&mut self) -> Expr {
        self.expr(ExprKind::Continue, Type::Unit)
    }

    pub fn ret(&mut self, value: Option<Expr>) -> Expr {
        self.expr(ExprKind::Return(value.map(Box::new)), Type::Unit)
    }

    // ------------------------------------------------------------------
    // Handlers
    // ------------------------------------------------------------------

    pub fn handle(&mut self, body: Expr, clauses: Vec<HandlerClause>, finally: Option<Expr>) -> Expr {
        let ty = body.ty.clone();
        self.expr(
            ExprKind::Handle {
                body: Box::new(body),
                clauses,
                finally: finally.map(Box::new),
            },
            ty,
        )
    }

    /// A clause for `effect.op`. `result` is the type of the enclosing
    /// handle expression; `annotate` spells the parameter types out.
    pub fn clause(
        &mut self,
        effect: DefId,
        op: &str,
        params: &[(&str, Type)],
        annotate: bool,
        result: Type,
        body: impl FnOnce(&mut Self, LocalId, &[LocalId]) -> Expr,
    ) -> HandlerClause {
        let resume_ty = self
            .program
            .effect(effect)
            .and_then(|e| e.ops_named(op).first().map(|(_, decl)| decl.ret.clone()))
            .unwrap_or(Type::Unit);
        let k = self.local("k", Type::continuation(resume_ty, result));
        let locals: Vec<LocalId> = params.iter().map(|(n, ty)| self.local(n, ty.clone())).collect();
        let body = body(self, k, &locals);
        HandlerClause {
            effect,
            op: op.to_string(),
            annotations: annotate.then(|| params.iter().map(|(_, ty)| ty.clone()).collect()),
            params: locals,
            continuation: k,
            span: body.span,
            body,
        }
    }

    // ------------------------------------------------------------------
    // Closures and tuples
    // ------------------------------------------------------------------

    pub fn closure(
        &mut self,
        params: &[(&str, Type)],
        ret: Type,
        body: impl FnOnce(&mut Self, &[LocalId]) -> Expr,
    ) -> Expr {
        let locals: Vec<LocalId> = params.iter().map(|(n, ty)| self.local(n, ty.clone())).collect();
        let body = body(self, &locals);
        let ty = Type::func(params.iter().map(|(_, ty)| ty.clone()).collect(), ret);
        self.expr(
            ExprKind::Closure {
                params: locals,
                body: Box::new(body),
            },
            ty,
        )
    }

    pub fn tuple(&mut self, items: Vec<Expr>) -> Expr {
        let ty = Type::Tuple(items.iter().map(|e| e.ty.clone()).collect());
        self.expr(ExprKind::Tuple(items), ty)
    }

    pub fn field(&mut self, base: Expr, index: u32) -> Expr {
        let ty = match &base.ty {
            Type::Tuple(items) => items.get(index as usize).cloned().unwrap_or(Type::Unit),
            _ => Type::Unit,
        };
        self.expr(
            ExprKind::Field {
                base: Box::new(base),
                index,
            },
            ty,
        )
    }
}
