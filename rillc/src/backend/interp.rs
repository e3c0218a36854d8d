//! # Reference Interpreter
//!
//! A tree walker over the analyzed (un-normalized) program. It defines what
//! effectful programs mean; the structural backend is tested against it.
//!
//! Evaluation returns an [`Eval`]:
//!
//! - `Value` - the expression produced a value
//! - `Return` - a non-local exit (`return`, `break`, `continue`, or a tail
//!   transfer out of a handler clause)
//! - `Effect` - evaluation suspended on an operation; the request carries
//!   the rest of the computation as a resumption closure
//!
//! Compound expressions sequence their operands with [`Interpreter::then`],
//! which runs the next step directly on a value and otherwise folds it into
//! the pending request's resumption. Resumptions are `Fn`, so a
//! continuation can be resumed more than once.
//!
//! Handlers are deep: resuming a continuation re-installs the handler that
//! captured it. Calling a `Tail` continuation transfers control, so the
//! clause's result is the resumed computation's result.
//!
//! Locals live in arena frames with parent links. Closures and clause
//! invocations get child frames. A frame returns to the free list when its
//! call finishes, unless something outlives the call that can still reach
//! it: a suspended request, a closure or a captured continuation. Those
//! frames are pinned, with their ancestors, for the rest of the run, so a
//! suspended computation can always be resumed.

use std::cell::Cell;
use std::fmt;
use std::rc::Rc;

use rill_runtime::{effect_id_hash, EffectRequest, Outcome, ResumeKind, TrapCode, WireValue};
use rustc_hash::FxHashMap;
use thiserror::Error;
use tracing::{debug, trace};

use crate::effects::EffectAnalysis;
use crate::hir::{
    BinOp, DefId, Expr, ExprId, ExprKind, HandlerClause, Intrinsic, Literal, LocalId, OpRef, Pattern, Program, Stmt,
    Type, UnaryOp,
};

/// Errors that abort interpretation.
#[derive(Debug, Clone, Error)]
pub enum InterpError {
    #[error("trap: {0}")]
    Trap(TrapCode),
    #[error("integer division by zero")]
    DivisionByZero,
    #[error("type mismatch: {0}")]
    TypeMismatch(String),
    #[error("read of unbound local {0}")]
    UnboundLocal(LocalId),
    #[error("unknown function `{0}`")]
    UnknownFunction(String),
    #[error("`{name}` expects {expected} arguments, {found} given")]
    Arity {
        name: String,
        expected: usize,
        found: usize,
    },
    #[error("{0} escaped its enclosing construct")]
    StrayExit(&'static str),
    #[error("run exceeded {0} resume steps")]
    StepLimit(usize),
    #[error("handler for `{label}` failed: {message}")]
    Handler { label: String, message: String },
}

type Step<'p> = Result<Eval<'p>, InterpError>;
type Next<'p> = Rc<dyn Fn(&mut Interpreter<'p>, Value<'p>) -> Step<'p> + 'p>;
type ListNext<'p> = Rc<dyn Fn(&mut Interpreter<'p>, Vec<Value<'p>>) -> Step<'p> + 'p>;
type Resume<'p> = Rc<dyn Fn(&mut Interpreter<'p>, Value<'p>) -> Step<'p> + 'p>;

/// Index of a frame in the interpreter's arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FrameId(u32);

struct Frame<'p> {
    locals: FxHashMap<LocalId, Value<'p>>,
    parent: Option<FrameId>,
    pinned: bool,
}

/// A runtime value.
#[derive(Debug, Clone)]
pub enum Value<'p> {
    Unit,
    Bool(bool),
    I32(i32),
    I64(i64),
    F32(f32),
    F64(f64),
    Tuple(Rc<[Value<'p>]>),
    Callable(Callable<'p>),
}

/// Things a call expression can invoke.
#[derive(Debug, Clone)]
pub enum Callable<'p> {
    Fn(DefId),
    Lambda {
        params: &'p [LocalId],
        body: &'p Expr,
        env: FrameId,
    },
    EffectOp(OpRef),
    Continuation(Rc<Continuation<'p>>),
    Intrinsic(Intrinsic),
}

/// A continuation captured by a handler clause.
pub struct Continuation<'p> {
    handle: &'p Expr,
    frame: FrameId,
    resume: Resume<'p>,
    kind: ResumeKind,
    resumed: Cell<u32>,
}

impl fmt::Debug for Continuation<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Continuation")
            .field("handle", &self.handle.id)
            .field("kind", &self.kind)
            .field("resumed", &self.resumed.get())
            .finish()
    }
}

impl<'p> Value<'p> {
    pub fn type_name(&self) -> &'static str {
        match self {
            Value::Unit => "unit",
            Value::Bool(_) => "bool",
            Value::I32(_) => "i32",
            Value::I64(_) => "i64",
            Value::F32(_) => "f32",
            Value::F64(_) => "f64",
            Value::Tuple(_) => "tuple",
            Value::Callable(_) => "callable",
        }
    }

    fn truthy(&self) -> Result<bool, InterpError> {
        match self {
            Value::Bool(b) => Ok(*b),
            Value::I32(n) => Ok(*n != 0),
            other => Err(InterpError::TypeMismatch(format!("condition of type {}", other.type_name()))),
        }
    }

    /// Encode for the host boundary. Tuples and callables cannot cross it.
    pub fn to_wire(&self) -> Option<WireValue> {
        Some(match self {
            Value::Unit => WireValue::None,
            Value::Bool(b) => WireValue::I32(*b as i32),
            Value::I32(n) => WireValue::I32(*n),
            Value::I64(n) => WireValue::I64(*n),
            Value::F32(x) => WireValue::F32(*x),
            Value::F64(x) => WireValue::F64(*x),
            Value::Tuple(_) | Value::Callable(_) => return None,
        })
    }

    /// Decode a host value as a value of type `ty`.
    pub fn from_wire(value: WireValue, ty: &Type) -> Value<'p> {
        match (ty, value) {
            (Type::Unit, _) | (_, WireValue::None) => Value::Unit,
            (Type::Bool, WireValue::I32(n)) => Value::Bool(n != 0),
            (_, WireValue::I32(n)) => Value::I32(n),
            (_, WireValue::I64(n)) => Value::I64(n),
            (_, WireValue::F32(x)) => Value::F32(x),
            (_, WireValue::F64(x)) => Value::F64(x),
        }
    }
}

impl PartialEq for Value<'_> {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Value::Unit, Value::Unit) => true,
            (Value::Bool(a), Value::Bool(b)) => a == b,
            (Value::I32(a), Value::I32(b)) => a == b,
            (Value::I64(a), Value::I64(b)) => a == b,
            (Value::F32(a), Value::F32(b)) => a == b,
            (Value::F64(a), Value::F64(b)) => a == b,
            (Value::Tuple(a), Value::Tuple(b)) => a == b,
            _ => false,
        }
    }
}

impl fmt::Display for Value<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Unit => f.write_str("()"),
            Value::Bool(b) => write!(f, "{b}"),
            Value::I32(n) => write!(f, "{n}"),
            Value::I64(n) => write!(f, "{n}i64"),
            Value::F32(x) => write!(f, "{x}f32"),
            Value::F64(x) => write!(f, "{x}"),
            Value::Tuple(items) => {
                f.write_str("(")?;
                for (i, item) in items.iter().enumerate() {
                    if i > 0 {
                        f.write_str(", ")?;
                    }
                    write!(f, "{item}")?;
                }
                f.write_str(")")
            }
            Value::Callable(_) => f.write_str("<callable>"),
        }
    }
}

/// Result of evaluating one expression.
pub enum Eval<'p> {
    Value(Value<'p>),
    Return(Exit<'p>),
    Effect(Request<'p>),
}

/// Non-local exits.
#[derive(Debug, Clone)]
pub enum Exit<'p> {
    Return(Value<'p>),
    Break,
    Continue,
    /// A tail continuation of `handle` finished with this value.
    Transfer { handle: ExprId, value: Value<'p> },
}

/// A suspended operation.
pub struct Request<'p> {
    pub op: OpRef,
    pub args: Vec<Value<'p>>,
    resume: Resume<'p>,
}

impl<'p> Request<'p> {
    fn new(op: OpRef, args: Vec<Value<'p>>) -> Self {
        Self {
            op,
            args,
            resume: Rc::new(|_, v| Ok(Eval::Value(v))),
        }
    }

    /// Run `finish` on whatever the resumed computation produces.
    fn map_resume(self, finish: impl Fn(&mut Interpreter<'p>, Eval<'p>) -> Step<'p> + 'p) -> Self {
        let resume = self.resume;
        Self {
            op: self.op,
            args: self.args,
            resume: Rc::new(move |interp, value| {
                let result = resume(interp, value)?;
                finish(interp, result)
            }),
        }
    }
}

/// Continuation handed to the host with an unhandled request.
#[derive(Clone)]
pub struct Resumption<'p> {
    resume: Resume<'p>,
    kind: ResumeKind,
    resumed: Rc<Cell<u32>>,
}

impl fmt::Debug for Resumption<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Resumption")
            .field("kind", &self.kind)
            .field("resumed", &self.resumed.get())
            .finish()
    }
}

pub type InterpOutcome<'p> = Outcome<Value<'p>, Resumption<'p>>;

/// The reference interpreter.
pub struct Interpreter<'p> {
    program: &'p Program,
    analysis: &'p EffectAnalysis,
    frames: Vec<Frame<'p>>,
    free: Vec<FrameId>,
}

impl<'p> Interpreter<'p> {
    pub fn new(program: &'p Program, analysis: &'p EffectAnalysis) -> Self {
        Self {
            program,
            analysis,
            frames: Vec::new(),
            free: Vec::new(),
        }
    }

    /// Call the function `name`; an unhandled operation suspends the call.
    pub fn call(&mut self, name: &str, args: Vec<Value<'p>>) -> Result<InterpOutcome<'p>, InterpError> {
        let function = self
            .program
            .function_by_name(name)
            .ok_or_else(|| InterpError::UnknownFunction(name.to_string()))?;
        debug!(function = name, args = args.len(), "interpreting");
        let result = self.call_def(function.def, args)?;
        self.outcome(result)
    }

    /// Resume a suspended call with the operation's result.
    pub fn resume(&mut self, k: &Resumption<'p>, value: Value<'p>) -> Result<InterpOutcome<'p>, InterpError> {
        if k.kind.is_tail() && k.resumed.get() >= 1 {
            return Err(InterpError::Trap(TrapCode::TailResumeExhausted));
        }
        k.resumed.set(k.resumed.get() + 1);
        let result = (k.resume)(self, value)?;
        self.outcome(result)
    }

    /// Call `name` and answer every request with `handler` until it
    /// finishes. `max_steps` of zero means no limit.
    pub fn run<H>(
        &mut self,
        name: &str,
        args: Vec<Value<'p>>,
        max_steps: usize,
        mut handler: H,
    ) -> Result<Value<'p>, InterpError>
    where
        H: FnMut(&EffectRequest<Value<'p>, Resumption<'p>>) -> Result<Value<'p>, InterpError>,
    {
        let mut outcome = self.call(name, args)?;
        let mut steps = 0usize;
        loop {
            match outcome {
                Outcome::Value(value) => return Ok(value),
                Outcome::Effect(request) => {
                    steps += 1;
                    if max_steps != 0 && steps > max_steps {
                        return Err(InterpError::StepLimit(max_steps));
                    }
                    let value = handler(&request)?;
                    trace!(label = %request.label, %value, "resuming");
                    outcome = self.resume(&request.continuation, value)?;
                }
            }
        }
    }

    /// Number of frames currently in use.
    pub fn frame_count(&self) -> usize {
        self.frames.len() - self.free.len()
    }

    fn outcome(&mut self, result: Eval<'p>) -> Result<InterpOutcome<'p>, InterpError> {
        match result {
            Eval::Value(v) | Eval::Return(Exit::Return(v)) | Eval::Return(Exit::Transfer { value: v, .. }) => {
                Ok(Outcome::Value(v))
            }
            Eval::Return(Exit::Break | Exit::Continue) => Err(InterpError::StrayExit("break or continue")),
            Eval::Effect(request) => {
                let effect = self
                    .program
                    .effect(request.op.effect)
                    .ok_or_else(|| InterpError::TypeMismatch(format!("unknown effect {}", request.op.effect)))?;
                let decl = self
                    .program
                    .op(request.op)
                    .ok_or_else(|| InterpError::TypeMismatch(self.program.op_label(request.op)))?;
                trace!(label = %self.program.op_label(request.op), "request reached the host");
                Ok(Outcome::Effect(EffectRequest {
                    effect_id: effect_id_hash(&effect.name),
                    op_id: request.op.index,
                    label: self.program.op_label(request.op),
                    resume_kind: decl.kind,
                    args: request.args,
                    continuation: Resumption {
                        resume: request.resume,
                        kind: decl.kind,
                        resumed: Rc::new(Cell::new(0)),
                    },
                }))
            }
        }
    }

    // ------------------------------------------------------------------
    // Frames
    // ------------------------------------------------------------------

    fn push_frame(&mut self, parent: Option<FrameId>) -> FrameId {
        if let Some(id) = self.free.pop() {
            let frame = self.frame_mut(id);
            frame.parent = parent;
            frame.pinned = false;
            return id;
        }
        self.frames.push(Frame {
            locals: FxHashMap::default(),
            parent,
            pinned: false,
        });
        FrameId((self.frames.len() - 1) as u32)
    }

    /// Keep `frame` and its ancestors alive for the rest of the run.
    fn pin(&mut self, frame: FrameId) {
        let mut current = Some(frame);
        while let Some(id) = current {
            let f = self.frame_mut(id);
            if f.pinned {
                return;
            }
            f.pinned = true;
            current = f.parent;
        }
    }

    /// Called when the invocation that pushed `frame` produced `result`.
    fn release(&mut self, frame: FrameId, result: &Eval<'p>) {
        if matches!(result, Eval::Effect(_)) {
            self.pin(frame);
            return;
        }
        let f = self.frame_mut(frame);
        if !f.pinned {
            f.locals.clear();
            f.parent = None;
            self.free.push(frame);
        }
    }

    fn frame_mut(&mut self, id: FrameId) -> &mut Frame<'p> {
        &mut self.frames[id.0 as usize]
    }

    /// Frame in the chain starting at `frame` that binds `local`.
    fn owner(&self, frame: FrameId, local: LocalId) -> Option<FrameId> {
        let mut current = Some(frame);
        while let Some(id) = current {
            let f = &self.frames[id.0 as usize];
            if f.locals.contains_key(&local) {
                return Some(id);
            }
            current = f.parent;
        }
        None
    }

    fn read(&self, frame: FrameId, local: LocalId) -> Result<Value<'p>, InterpError> {
        self.owner(frame, local)
            .and_then(|id| self.frames[id.0 as usize].locals.get(&local).cloned())
            .ok_or(InterpError::UnboundLocal(local))
    }

    fn define(&mut self, frame: FrameId, local: LocalId, value: Value<'p>) {
        self.frame_mut(frame).locals.insert(local, value);
    }

    fn assign(&mut self, frame: FrameId, local: LocalId, value: Value<'p>) {
        let target = self.owner(frame, local).unwrap_or(frame);
        self.define(target, local, value);
    }

    // ------------------------------------------------------------------
    // Sequencing
    // ------------------------------------------------------------------

    /// Continue with `next` once `first` has produced a value.
    fn then<F>(&mut self, first: Eval<'p>, next: F) -> Step<'p>
    where
        F: Fn(&mut Interpreter<'p>, Value<'p>) -> Step<'p> + 'p,
    {
        match first {
            Eval::Value(v) => next(self, v),
            other => self.bind(other, Rc::new(next)),
        }
    }

    fn bind(&mut self, first: Eval<'p>, next: Next<'p>) -> Step<'p> {
        match first {
            Eval::Value(v) => next(self, v),
            Eval::Return(exit) => Ok(Eval::Return(exit)),
            Eval::Effect(request) => Ok(Eval::Effect(
                request.map_resume(move |interp, result| interp.bind(result, next.clone())),
            )),
        }
    }

    fn eval_list(&mut self, exprs: &'p [Expr], frame: FrameId, done: ListNext<'p>) -> Step<'p> {
        self.eval_rest(exprs, frame, Vec::with_capacity(exprs.len()), done)
    }

    fn eval_rest(&mut self, exprs: &'p [Expr], frame: FrameId, mut acc: Vec<Value<'p>>, done: ListNext<'p>) -> Step<'p> {
        for (index, expr) in exprs.iter().enumerate() {
            match self.eval(expr, frame)? {
                Eval::Value(v) => acc.push(v),
                other => {
                    let rest = &exprs[index + 1..];
                    return self.bind(
                        other,
                        Rc::new(move |interp, v| {
                            let mut acc = acc.clone();
                            acc.push(v);
                            interp.eval_rest(rest, frame, acc, done.clone())
                        }),
                    );
                }
            }
        }
        done(self, acc)
    }

    // ------------------------------------------------------------------
    // Expressions
    // ------------------------------------------------------------------

    fn eval(&mut self, expr: &'p Expr, frame: FrameId) -> Step<'p> {
        let value = |v| Ok(Eval::Value(v));
        match &expr.kind {
            ExprKind::Literal(lit) => value(literal(*lit, &expr.ty)),
            ExprKind::Local(local) => value(self.read(frame, *local)?),
            ExprKind::Def(def) => value(Value::Callable(Callable::Fn(*def))),
            ExprKind::Op { op, .. } => value(Value::Callable(Callable::EffectOp(*op))),
            ExprKind::Intrinsic(i) => value(Value::Callable(Callable::Intrinsic(*i))),
            ExprKind::Closure { params, body } => {
                self.pin(frame);
                value(Value::Callable(Callable::Lambda {
                    params,
                    body,
                    env: frame,
                }))
            }
            ExprKind::Binary { op, lhs, rhs } => {
                let op = *op;
                let first = self.eval(lhs, frame)?;
                self.then(first, move |interp, a| {
                    let second = interp.eval(rhs, frame)?;
                    interp.then(second, move |_, b| Ok(Eval::Value(binary(op, &a, &b)?)))
                })
            }
            ExprKind::Unary { op, operand } => {
                let op = *op;
                let first = self.eval(operand, frame)?;
                self.then(first, move |_, v| Ok(Eval::Value(unary(op, &v)?)))
            }
            ExprKind::Call { callee, args } => {
                let first = self.eval(callee, frame)?;
                self.then(first, move |interp, f| {
                    interp.eval_list(args, frame, Rc::new(move |interp, values| interp.apply(f.clone(), values)))
                })
            }
            ExprKind::Perform { op, args, .. } => {
                let op = *op;
                self.eval_list(
                    args,
                    frame,
                    Rc::new(move |_, values| Ok(Eval::Effect(Request::new(op, values)))),
                )
            }
            ExprKind::Block { stmts, tail } => self.eval_block(stmts, tail.as_deref(), 0, frame),
            ExprKind::Assign { local, value: init } => {
                let local = *local;
                let first = self.eval(init, frame)?;
                self.then(first, move |interp, v| {
                    interp.assign(frame, local, v);
                    Ok(Eval::Value(Value::Unit))
                })
            }
            ExprKind::If {
                cond,
                then_branch,
                else_branch,
            } => {
                let first = self.eval(cond, frame)?;
                let else_branch = else_branch.as_deref();
                self.then(first, move |interp, c| {
                    if c.truthy()? {
                        interp.eval(then_branch, frame)
                    } else {
                        match else_branch {
                            Some(e) => interp.eval(e, frame),
                            None => Ok(Eval::Value(Value::Unit)),
                        }
                    }
                })
            }
            ExprKind::Match { scrutinee, arms } => {
                let first = self.eval(scrutinee, frame)?;
                self.then(first, move |interp, s| {
                    for arm in arms {
                        match &arm.pattern {
                            Pattern::Wildcard => {}
                            Pattern::Binding(l) => interp.define(frame, *l, s.clone()),
                            Pattern::Literal(lit) => {
                                if !literal_matches(*lit, &s) {
                                    continue;
                                }
                            }
                        }
                        return interp.eval(&arm.body, frame);
                    }
                    Err(InterpError::Trap(TrapCode::Unreachable))
                })
            }
            ExprKind::Loop { body } => self.run_loop(None, body, frame, None),
            ExprKind::While { cond, body } => self.run_loop(Some(&**cond), body, frame, None),
            ExprKind::Break => Ok(Eval::Return(Exit::Break)),
            ExprKind::Continue => Ok(Eval::Return(Exit::Continue)),
            ExprKind::Return(v) => match v {
                Some(v) => {
                    let first = self.eval(v, frame)?;
                    self.then(first, |_, v| Ok(Eval::Return(Exit::Return(v))))
                }
                None => Ok(Eval::Return(Exit::Return(Value::Unit))),
            },
            ExprKind::Handle { body, finally, .. } => {
                let result = self.eval(body, frame)?;
                let handled = self.handled(expr, frame, result)?;
                match finally.as_deref() {
                    Some(fin) => self.then(handled, move |interp, v| {
                        let done = interp.eval(fin, frame)?;
                        interp.then(done, move |_, _| Ok(Eval::Value(v.clone())))
                    }),
                    None => Ok(handled),
                }
            }
            ExprKind::Tuple(items) => self.eval_list(
                items,
                frame,
                Rc::new(|_, values| Ok(Eval::Value(Value::Tuple(values.into())))),
            ),
            ExprKind::Field { base, index } => {
                let index = *index as usize;
                let first = self.eval(base, frame)?;
                self.then(first, move |_, v| match v {
                    Value::Tuple(items) => items
                        .get(index)
                        .cloned()
                        .map(Eval::Value)
                        .ok_or_else(|| InterpError::TypeMismatch(format!("no field {index}"))),
                    other => Err(InterpError::TypeMismatch(format!("field of {}", other.type_name()))),
                })
            }
        }
    }

    fn eval_block(&mut self, stmts: &'p [Stmt], tail: Option<&'p Expr>, from: usize, frame: FrameId) -> Step<'p> {
        for (index, stmt) in stmts.iter().enumerate().skip(from) {
            match stmt {
                Stmt::Let { local, init: Some(init) } => {
                    let local = *local;
                    match self.eval(init, frame)? {
                        Eval::Value(v) => self.define(frame, local, v),
                        other => {
                            return self.bind(
                                other,
                                Rc::new(move |interp, v| {
                                    interp.define(frame, local, v);
                                    interp.eval_block(stmts, tail, index + 1, frame)
                                }),
                            )
                        }
                    }
                }
                Stmt::Let { init: None, .. } => {}
                Stmt::Expr(e) => match self.eval(e, frame)? {
                    Eval::Value(_) => {}
                    other => {
                        return self.bind(
                            other,
                            Rc::new(move |interp, _| interp.eval_block(stmts, tail, index + 1, frame)),
                        )
                    }
                },
            }
        }
        match tail {
            Some(t) => self.eval(t, frame),
            None => Ok(Eval::Value(Value::Unit)),
        }
    }

    /// Iterate a loop. `pending` is the result of an iteration that was
    /// suspended and has now been resumed.
    fn run_loop(
        &mut self,
        cond: Option<&'p Expr>,
        body: &'p Expr,
        frame: FrameId,
        mut pending: Option<Eval<'p>>,
    ) -> Step<'p> {
        loop {
            let result = match pending.take() {
                Some(result) => result,
                None => {
                    if let Some(c) = cond {
                        match self.eval(c, frame)? {
                            Eval::Value(v) => {
                                if !v.truthy()? {
                                    return Ok(Eval::Value(Value::Unit));
                                }
                            }
                            other => {
                                return self.bind(
                                    other,
                                    Rc::new(move |interp, v| {
                                        if !v.truthy()? {
                                            return Ok(Eval::Value(Value::Unit));
                                        }
                                        let result = interp.eval(body, frame)?;
                                        interp.run_loop(cond, body, frame, Some(result))
                                    }),
                                )
                            }
                        }
                    }
                    self.eval(body, frame)?
                }
            };
            match result {
                Eval::Value(_) | Eval::Return(Exit::Continue) => {}
                Eval::Return(Exit::Break) => return Ok(Eval::Value(Value::Unit)),
                Eval::Return(exit) => return Ok(Eval::Return(exit)),
                Eval::Effect(request) => {
                    return Ok(Eval::Effect(request.map_resume(move |interp, result| {
                        interp.run_loop(cond, body, frame, Some(result))
                    })))
                }
            }
        }
    }

    // ------------------------------------------------------------------
    // Calls
    // ------------------------------------------------------------------

    fn apply(&mut self, callee: Value<'p>, args: Vec<Value<'p>>) -> Step<'p> {
        let Value::Callable(callable) = callee else {
            return Err(InterpError::TypeMismatch(format!("call of {}", callee.type_name())));
        };
        match callable {
            Callable::Fn(def) => self.call_def(def, args),
            Callable::Lambda { params, body, env } => {
                if params.len() != args.len() {
                    return Err(InterpError::Arity {
                        name: "closure".into(),
                        expected: params.len(),
                        found: args.len(),
                    });
                }
                let frame = self.push_frame(Some(env));
                for (p, v) in params.iter().zip(args) {
                    self.define(frame, *p, v);
                }
                let result = self.eval(body, frame)?;
                self.release(frame, &result);
                self.leave_call(result)
            }
            Callable::EffectOp(op) => Ok(Eval::Effect(Request::new(op, args))),
            Callable::Continuation(k) => {
                let value = args.into_iter().next().unwrap_or(Value::Unit);
                self.continue_with(k, value)
            }
            Callable::Intrinsic(i) => Ok(Eval::Value(intrinsic(i, &args)?)),
        }
    }

    fn call_def(&mut self, def: DefId, args: Vec<Value<'p>>) -> Step<'p> {
        let program = self.program;
        let function = program
            .function(def)
            .ok_or_else(|| InterpError::UnknownFunction(def.to_string()))?;
        if function.params.len() != args.len() {
            return Err(InterpError::Arity {
                name: function.name.clone(),
                expected: function.params.len(),
                found: args.len(),
            });
        }
        let frame = self.push_frame(None);
        for (p, v) in function.params.iter().zip(args) {
            self.define(frame, *p, v);
        }
        let result = self.eval(&function.body, frame)?;
        self.release(frame, &result);
        self.leave_call(result)
    }

    fn leave_call(&mut self, result: Eval<'p>) -> Step<'p> {
        match result {
            Eval::Value(v) | Eval::Return(Exit::Return(v)) => Ok(Eval::Value(v)),
            Eval::Return(exit @ Exit::Transfer { .. }) => Ok(Eval::Return(exit)),
            Eval::Return(Exit::Break | Exit::Continue) => Err(InterpError::StrayExit("break or continue")),
            Eval::Effect(request) => Ok(Eval::Effect(
                request.map_resume(|interp, result| interp.leave_call(result)),
            )),
        }
    }

    // ------------------------------------------------------------------
    // Handlers
    // ------------------------------------------------------------------

    /// Dispatch a request raised inside `handle`'s body to its clauses, or
    /// forward it with the handler re-installed around the resumption.
    fn handled(&mut self, handle: &'p Expr, frame: FrameId, result: Eval<'p>) -> Step<'p> {
        let request = match result {
            Eval::Effect(request) => request,
            other => return Ok(other),
        };
        let ExprKind::Handle { clauses, .. } = &handle.kind else {
            return Ok(Eval::Effect(request));
        };
        let Some((index, kind)) = self.clause_for(handle.id, clauses, request.op) else {
            return Ok(Eval::Effect(
                request.map_resume(move |interp, result| interp.handled(handle, frame, result)),
            ));
        };
        let clause = &clauses[index];
        trace!(op = %self.program.op_label(request.op), clause = index, "handling");
        self.pin(frame);
        let k = Rc::new(Continuation {
            handle,
            frame,
            resume: request.resume,
            kind,
            resumed: Cell::new(0),
        });
        let clause_frame = self.push_frame(Some(frame));
        self.define(clause_frame, clause.continuation, Value::Callable(Callable::Continuation(k)));
        for (p, v) in clause.params.iter().zip(request.args) {
            self.define(clause_frame, *p, v);
        }
        let result = self.eval(&clause.body, clause_frame)?;
        self.release(clause_frame, &result);
        self.leave_clause(handle.id, kind, result)
    }

    fn clause_for(&self, handle: ExprId, clauses: &[HandlerClause], op: OpRef) -> Option<(usize, ResumeKind)> {
        if let Some(resolution) = self.analysis.handler(handle) {
            return (0..clauses.len()).find_map(|i| {
                resolution
                    .clause(i)
                    .filter(|c| c.op == op)
                    .map(|c| (i, c.kind))
            });
        }
        let decl = self.program.op(op)?;
        clauses
            .iter()
            .position(|c| c.effect == op.effect && c.op == decl.name)
            .map(|i| (i, decl.kind))
    }

    fn leave_clause(&mut self, handle: ExprId, kind: ResumeKind, result: Eval<'p>) -> Step<'p> {
        match result {
            Eval::Return(Exit::Transfer { handle: h, value }) if h == handle => Ok(Eval::Value(value)),
            Eval::Return(exit @ Exit::Transfer { .. }) => Ok(Eval::Return(exit)),
            Eval::Value(v) | Eval::Return(Exit::Return(v)) => match kind {
                ResumeKind::Tail => Err(InterpError::Trap(TrapCode::TailResumeMissing)),
                ResumeKind::Resume => Ok(Eval::Value(v)),
            },
            Eval::Return(Exit::Break | Exit::Continue) => Err(InterpError::StrayExit("break or continue")),
            Eval::Effect(request) => Ok(Eval::Effect(
                request.map_resume(move |interp, result| interp.leave_clause(handle, kind, result)),
            )),
        }
    }

    fn continue_with(&mut self, k: Rc<Continuation<'p>>, value: Value<'p>) -> Step<'p> {
        if k.kind.is_tail() && k.resumed.get() >= 1 {
            return Err(InterpError::Trap(TrapCode::TailResumeExhausted));
        }
        k.resumed.set(k.resumed.get() + 1);
        let result = (k.resume)(self, value)?;
        let result = self.handled(k.handle, k.frame, result)?;
        match k.kind {
            ResumeKind::Resume => Ok(result),
            ResumeKind::Tail => self.transfer(k.handle.id, result),
        }
    }

    fn transfer(&mut self, handle: ExprId, result: Eval<'p>) -> Step<'p> {
        match result {
            Eval::Value(value) => Ok(Eval::Return(Exit::Transfer { handle, value })),
            Eval::Return(exit) => Ok(Eval::Return(exit)),
            Eval::Effect(request) => Ok(Eval::Effect(
                request.map_resume(move |interp, result| interp.transfer(handle, result)),
            )),
        }
    }
}

fn literal<'p>(lit: Literal, ty: &Type) -> Value<'p> {
    match (lit, ty) {
        (Literal::Unit, _) => Value::Unit,
        (Literal::Bool(b), _) => Value::Bool(b),
        (Literal::Int(n), Type::I64) => Value::I64(n),
        (Literal::Int(n), Type::F32) => Value::F32(n as f32),
        (Literal::Int(n), Type::F64) => Value::F64(n as f64),
        (Literal::Int(n), _) => Value::I32(n as i32),
        (Literal::Float(x), Type::F32) => Value::F32(x as f32),
        (Literal::Float(x), _) => Value::F64(x),
    }
}

fn literal_matches(lit: Literal, value: &Value<'_>) -> bool {
    match (lit, value) {
        (Literal::Unit, Value::Unit) => true,
        (Literal::Bool(a), Value::Bool(b)) => a == *b,
        (Literal::Int(a), Value::I32(b)) => a as i32 == *b,
        (Literal::Int(a), Value::I64(b)) => a == *b,
        (Literal::Float(a), Value::F64(b)) => a == *b,
        (Literal::Float(a), Value::F32(b)) => a as f32 == *b,
        _ => false,
    }
}

macro_rules! int_binary {
    ($op:expr, $x:expr, $y:expr, $wrap:path) => {{
        let (x, y) = ($x, $y);
        match $op {
            BinOp::Add => $wrap(x.wrapping_add(y)),
            BinOp::Sub => $wrap(x.wrapping_sub(y)),
            BinOp::Mul => $wrap(x.wrapping_mul(y)),
            BinOp::Div if y == 0 => return Err(InterpError::DivisionByZero),
            BinOp::Div => $wrap(x.wrapping_div(y)),
            BinOp::Rem if y == 0 => return Err(InterpError::DivisionByZero),
            BinOp::Rem => $wrap(x.wrapping_rem(y)),
            BinOp::And => $wrap(x & y),
            BinOp::Or => $wrap(x | y),
            BinOp::Eq => Value::Bool(x == y),
            BinOp::Ne => Value::Bool(x != y),
            BinOp::Lt => Value::Bool(x < y),
            BinOp::Le => Value::Bool(x <= y),
            BinOp::Gt => Value::Bool(x > y),
            BinOp::Ge => Value::Bool(x >= y),
        }
    }};
}

macro_rules! float_binary {
    ($op:expr, $x:expr, $y:expr, $wrap:path) => {{
        let (x, y) = ($x, $y);
        match $op {
            BinOp::Add => $wrap(x + y),
            BinOp::Sub => $wrap(x - y),
            BinOp::Mul => $wrap(x * y),
            BinOp::Div => $wrap(x / y),
            BinOp::Rem => $wrap(x % y),
            BinOp::Eq => Value::Bool(x == y),
            BinOp::Ne => Value::Bool(x != y),
            BinOp::Lt => Value::Bool(x < y),
            BinOp::Le => Value::Bool(x <= y),
            BinOp::Gt => Value::Bool(x > y),
            BinOp::Ge => Value::Bool(x >= y),
            BinOp::And | BinOp::Or => {
                return Err(InterpError::TypeMismatch(format!("{:?} on floats", $op)))
            }
        }
    }};
}

fn binary<'p>(op: BinOp, a: &Value<'p>, b: &Value<'p>) -> Result<Value<'p>, InterpError> {
    Ok(match (a, b) {
        (Value::I32(x), Value::I32(y)) => int_binary!(op, *x, *y, Value::I32),
        (Value::I64(x), Value::I64(y)) => int_binary!(op, *x, *y, Value::I64),
        (Value::F32(x), Value::F32(y)) => float_binary!(op, *x, *y, Value::F32),
        (Value::F64(x), Value::F64(y)) => float_binary!(op, *x, *y, Value::F64),
        (Value::Bool(x), Value::Bool(y)) => match op {
            BinOp::And => Value::Bool(*x & *y),
            BinOp::Or => Value::Bool(*x | *y),
            BinOp::Eq => Value::Bool(x == y),
            BinOp::Ne => Value::Bool(x != y),
            _ => return Err(InterpError::TypeMismatch(format!("{op:?} on bools"))),
        },
        (Value::Unit, Value::Unit) => match op {
            BinOp::Eq => Value::Bool(true),
            BinOp::Ne => Value::Bool(false),
            _ => return Err(InterpError::TypeMismatch(format!("{op:?} on unit"))),
        },
        (a, b) => {
            return Err(InterpError::TypeMismatch(format!(
                "{op:?} on {} and {}",
                a.type_name(),
                b.type_name()
            )))
        }
    })
}

fn unary<'p>(op: UnaryOp, v: &Value<'p>) -> Result<Value<'p>, InterpError> {
    Ok(match (op, v) {
        (UnaryOp::Neg, Value::I32(n)) => Value::I32(n.wrapping_neg()),
        (UnaryOp::Neg, Value::I64(n)) => Value::I64(n.wrapping_neg()),
        (UnaryOp::Neg, Value::F32(x)) => Value::F32(-x),
        (UnaryOp::Neg, Value::F64(x)) => Value::F64(-x),
        (UnaryOp::Not, Value::Bool(b)) => Value::Bool(!b),
        (UnaryOp::Not, Value::I32(n)) => Value::I32(!n),
        (UnaryOp::Not, Value::I64(n)) => Value::I64(!n),
        (op, v) => return Err(InterpError::TypeMismatch(format!("{op:?} on {}", v.type_name()))),
    })
}

fn intrinsic<'p>(i: Intrinsic, args: &[Value<'p>]) -> Result<Value<'p>, InterpError> {
    let pick_min = |a: &Value<'p>, b: &Value<'p>| -> Result<bool, InterpError> {
        binary(BinOp::Le, a, b).and_then(|v| v.truthy())
    };
    match (i, args) {
        (Intrinsic::Abs, [Value::I32(n)]) => Ok(Value::I32(n.wrapping_abs())),
        (Intrinsic::Abs, [Value::I64(n)]) => Ok(Value::I64(n.wrapping_abs())),
        (Intrinsic::Abs, [Value::F32(x)]) => Ok(Value::F32(x.abs())),
        (Intrinsic::Abs, [Value::F64(x)]) => Ok(Value::F64(x.abs())),
        (Intrinsic::Min, [a, b]) => Ok(if pick_min(a, b)? { a.clone() } else { b.clone() }),
        (Intrinsic::Max, [a, b]) => Ok(if pick_min(a, b)? { b.clone() } else { a.clone() }),
        (i, args) => Err(InterpError::TypeMismatch(format!("{i:?} with {} arguments", args.len()))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CompilerConfig;
    use crate::effects;
    use crate::hir::{FnBuilder, ProgramBuilder};

    fn async_program(handled: bool) -> Program {
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
        if handled {
            b.function("outer", &[], Type::I32, |f| {
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
        }
        b.finish()
    }

    fn analyze(program: &Program) -> EffectAnalysis {
        effects::analyze(program, &CompilerConfig::default())
    }

    #[test]
    fn test_host_answers_await() {
        let program = async_program(false);
        let analysis = analyze(&program);
        let mut interp = Interpreter::new(&program, &analysis);
        let mut seen = Vec::new();
        let result = interp
            .run("inner", vec![Value::I32(4)], 0, |request| {
                seen.push((request.label.clone(), request.args.clone()));
                match request.args.as_slice() {
                    [Value::I32(v)] => Ok(Value::I32(v * 2)),
                    _ => Err(InterpError::Handler {
                        label: request.label.clone(),
                        message: "bad args".into(),
                    }),
                }
            })
            .unwrap();
        assert_eq!(result, Value::I32(9));
        assert_eq!(seen, vec![("Async.await".to_string(), vec![Value::I32(4)])]);
    }

    #[test]
    fn test_in_language_handler() {
        let program = async_program(true);
        let analysis = analyze(&program);
        let mut interp = Interpreter::new(&program, &analysis);
        let outcome = interp.call("outer", vec![]).unwrap();
        assert_eq!(outcome.into_value(), Some(Value::I32(9)));
    }

    fn state_program(clause_body: impl FnOnce(&mut FnBuilder<'_>, LocalId) -> Expr) -> Program {
        let mut b = ProgramBuilder::new();
        let state = b.effect(
            "State",
            vec![ProgramBuilder::op("get", vec![], Type::I32, ResumeKind::Tail)],
        );
        let get = OpRef::new(state, 0);
        b.function("main", &[], Type::I32, |f| {
            let got = f.perform(get, vec![]);
            let ten = f.i32(10);
            let body = f.add(got, ten);
            let clause = f.clause(state, "get", &[], false, Type::I32, |f, k, _| clause_body(f, k));
            f.handle(body, vec![clause], None)
        });
        b.finish()
    }

    #[test]
    fn test_tail_resume_transfers_control() {
        let program = state_program(|f, k| {
            let five = f.i32(5);
            let resumed = f.resume(k, five);
            let never = f.i32(1000);
            f.block(vec![FnBuilder::stmt(resumed)], Some(never))
        });
        let analysis = analyze(&program);
        let mut interp = Interpreter::new(&program, &analysis);
        let outcome = interp.call("main", vec![]).unwrap();
        assert_eq!(outcome.into_value(), Some(Value::I32(15)));
    }

    #[test]
    fn test_tail_clause_without_resume_traps() {
        // `while false { k(1) }` passes the static check but never resumes.
        let program = state_program(|f, k| {
            let no = f.bool(false);
            let one = f.i32(1);
            let resumed = f.resume(k, one);
            let looped = f.while_(no, resumed);
            let zero = f.i32(0);
            f.block(vec![FnBuilder::stmt(looped)], Some(zero))
        });
        let analysis = analyze(&program);
        let mut interp = Interpreter::new(&program, &analysis);
        let err = interp.call("main", vec![]).unwrap_err();
        assert!(matches!(err, InterpError::Trap(TrapCode::TailResumeMissing)));
    }

    #[test]
    fn test_multi_shot_resume_runs_the_rest_twice() {
        let mut b = ProgramBuilder::new();
        let choice = b.effect(
            "Choice",
            vec![ProgramBuilder::op("choose", vec![], Type::Bool, ResumeKind::Resume)],
        );
        let choose = OpRef::new(choice, 0);
        b.function("main", &[], Type::I32, |f| {
            let chosen = f.perform(choose, vec![]);
            let one = f.i32(1);
            let two = f.i32(2);
            let body = f.if_(chosen, one, Some(two));
            let clause = f.clause(choice, "choose", &[], false, Type::I32, |f, k, _| {
                let yes = f.bool(true);
                let no = f.bool(false);
                let first = f.resume(k, yes);
                let second = f.resume(k, no);
                f.add(first, second)
            });
            f.handle(body, vec![clause], None)
        });
        let program = b.finish();
        let analysis = analyze(&program);
        let mut interp = Interpreter::new(&program, &analysis);
        let outcome = interp.call("main", vec![]).unwrap();
        assert_eq!(outcome.into_value(), Some(Value::I32(3)));
    }

    #[test]
    fn test_host_tail_resumption_is_single_use() {
        let mut b = ProgramBuilder::new();
        let state = b.effect(
            "State",
            vec![ProgramBuilder::op("get", vec![], Type::I32, ResumeKind::Tail)],
        );
        let get = OpRef::new(state, 0);
        b.function("main", &[], Type::I32, |f| f.perform(get, vec![]));
        let program = b.finish();
        let analysis = analyze(&program);
        let mut interp = Interpreter::new(&program, &analysis);
        let Outcome::Effect(request) = interp.call("main", vec![]).unwrap() else {
            panic!("expected a request");
        };
        assert!(interp.resume(&request.continuation, Value::I32(1)).is_ok());
        let err = interp.resume(&request.continuation, Value::I32(2)).unwrap_err();
        assert!(matches!(err, InterpError::Trap(TrapCode::TailResumeExhausted)));
    }

    #[test]
    fn test_loop_resumes_mid_iteration() {
        let mut b = ProgramBuilder::new();
        let tick = b.effect(
            "Tick",
            vec![ProgramBuilder::op("tick", vec![Type::I32], Type::I32, ResumeKind::Tail)],
        );
        let op = OpRef::new(tick, 0);
        b.function("count", &[("n", Type::I32)], Type::I32, |f| {
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
        let program = b.finish();
        let analysis = analyze(&program);
        let mut interp = Interpreter::new(&program, &analysis);
        let mut labels = 0;
        let result = interp
            .run("count", vec![Value::I32(4)], 0, |request| {
                labels += 1;
                match request.args.as_slice() {
                    [Value::I32(i)] => Ok(Value::I32(i * 10)),
                    _ => Ok(Value::I32(0)),
                }
            })
            .unwrap();
        assert_eq!(labels, 4);
        assert_eq!(result, Value::I32(60));
    }

    #[test]
    fn test_finished_calls_release_their_frames() {
        let mut b = ProgramBuilder::new();
        let step = b.function("step", &[("x", Type::I32)], Type::I32, |f| {
            let x = f.var(f.param(0));
            let one = f.i32(1);
            f.add(x, one)
        });
        b.function("spin", &[("n", Type::I32)], Type::I32, |f| {
            let i = f.local("i", Type::I32);
            let zero = f.i32(0);
            let read_i = f.var(i);
            let read_n = f.var(f.param(0));
            let cond = f.lt(read_i, read_n);
            let arg = f.var(i);
            let next = f.call(step, vec![arg]);
            let bump = f.assign(i, next);
            let looped = f.while_(cond, bump);
            let result = f.var(i);
            f.block(vec![FnBuilder::let_(i, zero), FnBuilder::stmt(looped)], Some(result))
        });
        let program = b.finish();
        let analysis = analyze(&program);
        let mut interp = Interpreter::new(&program, &analysis);

        let outcome = interp.call("spin", vec![Value::I32(500)]).unwrap();
        assert_eq!(outcome.into_value(), Some(Value::I32(500)));
        assert_eq!(interp.frame_count(), 0);
        // `spin` and one `step` at a time.
        assert!(interp.frames.len() <= 2, "{} frames allocated", interp.frames.len());
    }

    #[test]
    fn test_suspended_frames_survive_until_resumed() {
        let program = async_program(false);
        let analysis = analyze(&program);
        let mut interp = Interpreter::new(&program, &analysis);
        let Outcome::Effect(request) = interp.call("inner", vec![Value::I32(4)]).unwrap() else {
            panic!("expected a request");
        };
        assert_eq!(interp.frame_count(), 1);
        let outcome = interp.resume(&request.continuation, Value::I32(8)).unwrap();
        assert_eq!(outcome.into_value(), Some(Value::I32(9)));
        assert_eq!(interp.frame_count(), 1);
    }
}
