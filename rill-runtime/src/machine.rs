//! # Virtual Machine
//!
//! A tree-walking executor for [`Module`]s. Heap objects are reference
//! counted cells, so an [`Instance`] is single-threaded (`!Send`) and one
//! logical computation runs per instance at a time.
//!
//! ## Faults
//!
//! Every dynamic fault is a [`Trap`]. Traps are unrecoverable for the current
//! invocation: the machine unwinds to the caller of [`Instance::invoke`] and
//! the instance may be reused for a fresh top-level call.

use std::cell::RefCell;
use std::fmt;
use std::rc::Rc;

use thiserror::Error;
use tracing::trace;

use crate::module::{
    BinOp, ConvertOp, FuncIdx, Import, Instr, Label, LocalIdx, Module, NumType, TrapCode, TypeIdx,
    UnOp, ValType,
};

/// Shared reference to a heap object.
pub type GcRef = Rc<RefCell<Object>>;

/// A heap object.
#[derive(Debug, Clone, PartialEq)]
pub enum Object {
    Struct { ty: TypeIdx, fields: Vec<Val> },
    Array(Vec<Val>),
}

/// A runtime value.
#[derive(Debug, Clone)]
pub enum Val {
    I32(i32),
    I64(i64),
    F32(f32),
    F64(f64),
    Ref(Option<GcRef>),
}

impl Val {
    /// The zero value of a type.
    pub fn default_for(ty: ValType) -> Self {
        match ty {
            ValType::I32 => Val::I32(0),
            ValType::I64 => Val::I64(0),
            ValType::F32 => Val::F32(0.0),
            ValType::F64 => Val::F64(0.0),
            ValType::Ref(_) => Val::Ref(None),
        }
    }

    pub fn as_i32(&self) -> Result<i32, Trap> {
        match self {
            Val::I32(v) => Ok(*v),
            other => Err(Trap::TypeMismatch(format!("expected i32, found {other}"))),
        }
    }

    pub fn as_i64(&self) -> Result<i64, Trap> {
        match self {
            Val::I64(v) => Ok(*v),
            other => Err(Trap::TypeMismatch(format!("expected i64, found {other}"))),
        }
    }

    pub fn as_f32(&self) -> Result<f32, Trap> {
        match self {
            Val::F32(v) => Ok(*v),
            other => Err(Trap::TypeMismatch(format!("expected f32, found {other}"))),
        }
    }

    pub fn as_f64(&self) -> Result<f64, Trap> {
        match self {
            Val::F64(v) => Ok(*v),
            other => Err(Trap::TypeMismatch(format!("expected f64, found {other}"))),
        }
    }

    /// The referenced object, trapping on null.
    pub fn as_object(&self) -> Result<GcRef, Trap> {
        match self {
            Val::Ref(Some(r)) => Ok(Rc::clone(r)),
            Val::Ref(None) => Err(Trap::NullReference),
            other => Err(Trap::TypeMismatch(format!("expected reference, found {other}"))),
        }
    }
}

impl PartialEq for Val {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Val::I32(a), Val::I32(b)) => a == b,
            (Val::I64(a), Val::I64(b)) => a == b,
            (Val::F32(a), Val::F32(b)) => a.to_bits() == b.to_bits(),
            (Val::F64(a), Val::F64(b)) => a.to_bits() == b.to_bits(),
            (Val::Ref(None), Val::Ref(None)) => true,
            (Val::Ref(Some(a)), Val::Ref(Some(b))) => Rc::ptr_eq(a, b),
            _ => false,
        }
    }
}

impl fmt::Display for Val {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Val::I32(v) => write!(f, "{v}:i32"),
            Val::I64(v) => write!(f, "{v}:i64"),
            Val::F32(v) => write!(f, "{v}:f32"),
            Val::F64(v) => write!(f, "{v}:f64"),
            Val::Ref(None) => f.write_str("null"),
            Val::Ref(Some(r)) => match &*r.borrow() {
                Object::Struct { ty, .. } => write!(f, "<struct {ty}>"),
                Object::Array(items) => write!(f, "<array {}>", items.len()),
            },
        }
    }
}

/// Unrecoverable runtime faults.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum Trap {
    #[error("trap: {0}")]
    Code(TrapCode),
    #[error("integer division by zero")]
    DivisionByZero,
    #[error("null reference")]
    NullReference,
    #[error("type mismatch: {0}")]
    TypeMismatch(String),
    #[error("unknown export `{0}`")]
    UnknownExport(String),
    #[error("call stack exhausted at depth {0}")]
    CallStackExhausted(usize),
    #[error("memory access out of bounds: {addr}+{len}")]
    OutOfBounds { addr: usize, len: usize },
    #[error("host error: {0}")]
    Host(String),
    #[error("expected {expected} arguments, found {found}")]
    ArgumentCount { expected: usize, found: usize },
}

/// Provider of a module's imports.
pub trait Host {
    /// Invoke an import with evaluated arguments and access to linear memory.
    fn call_import(
        &mut self,
        import: &Import,
        args: &[Val],
        memory: &mut [u8],
    ) -> Result<Option<Val>, Trap>;
}

/// A host without imports.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoHost;

impl Host for NoHost {
    fn call_import(&mut self, import: &Import, _: &[Val], _: &mut [u8]) -> Result<Option<Val>, Trap> {
        Err(Trap::Host(format!(
            "import `{}.{}` is not provided",
            import.module, import.name
        )))
    }
}

/// Non-local control flow while evaluating a body.
enum Flow {
    Break(Label, Option<Val>),
    Return(Option<Val>),
    Trap(Trap),
}

impl From<Trap> for Flow {
    fn from(trap: Trap) -> Self {
        Flow::Trap(trap)
    }
}

type Eval = Result<Option<Val>, Flow>;

/// An instantiated module with its linear memory.
pub struct Instance {
    module: Rc<Module>,
    memory: Vec<u8>,
    max_call_depth: usize,
    depth: usize,
}

impl Instance {
    pub fn new(module: Rc<Module>, max_call_depth: usize) -> Self {
        let memory = vec![0u8; module.memory_size];
        Self {
            module,
            memory,
            max_call_depth,
            depth: 0,
        }
    }

    pub fn module(&self) -> &Module {
        &self.module
    }

    pub fn memory(&self) -> &[u8] {
        &self.memory
    }

    pub fn memory_mut(&mut self) -> &mut [u8] {
        &mut self.memory
    }

    /// Call an export by name.
    pub fn invoke(&mut self, export: &str, args: &[Val], host: &mut dyn Host) -> Result<Option<Val>, Trap> {
        let func = self
            .module
            .find_export(export)
            .ok_or_else(|| Trap::UnknownExport(export.to_string()))?;
        trace!(export, args = args.len(), "invoke");
        self.depth = 0;
        self.call(func, args.to_vec(), host)
    }

    /// Call a function by index.
    pub fn call(&mut self, func: FuncIdx, args: Vec<Val>, host: &mut dyn Host) -> Result<Option<Val>, Trap> {
        let module = Rc::clone(&self.module);
        let function = module
            .functions
            .get(func as usize)
            .ok_or_else(|| Trap::TypeMismatch(format!("no function {func}")))?;
        if args.len() != function.params.len() {
            return Err(Trap::ArgumentCount {
                expected: function.params.len(),
                found: args.len(),
            });
        }
        if self.depth >= self.max_call_depth {
            return Err(Trap::CallStackExhausted(self.depth));
        }
        let mut locals = args;
        locals.extend(function.locals.iter().map(|ty| Val::default_for(*ty)));

        self.depth += 1;
        let result = self.eval_seq(&function.body, &mut locals, host);
        self.depth -= 1;

        match result {
            Ok(v) | Err(Flow::Return(v)) => Ok(v),
            Err(Flow::Trap(trap)) => Err(trap),
            Err(Flow::Break(label, _)) => Err(Trap::TypeMismatch(format!(
                "branch to unknown label {} in `{}`",
                label.0, function.name
            ))),
        }
    }

    fn eval_seq(&mut self, body: &[Instr], locals: &mut Vec<Val>, host: &mut dyn Host) -> Eval {
        let mut last = None;
        for instr in body {
            last = self.eval(instr, locals, host)?;
        }
        Ok(last)
    }

    fn value(&mut self, instr: &Instr, locals: &mut Vec<Val>, host: &mut dyn Host) -> Result<Val, Flow> {
        match self.eval(instr, locals, host)? {
            Some(v) => Ok(v),
            None => Err(Trap::TypeMismatch("instruction produced no value".into()).into()),
        }
    }

    fn eval(&mut self, instr: &Instr, locals: &mut Vec<Val>, host: &mut dyn Host) -> Eval {
        match instr {
            Instr::I32Const(v) => Ok(Some(Val::I32(*v))),
            Instr::I64Const(v) => Ok(Some(Val::I64(*v))),
            Instr::F32Const(v) => Ok(Some(Val::F32(*v))),
            Instr::F64Const(v) => Ok(Some(Val::F64(*v))),
            Instr::RefNull => Ok(Some(Val::Ref(None))),

            Instr::LocalGet(idx) => Ok(Some(local(locals, *idx)?.clone())),
            Instr::LocalSet(idx, value) => {
                let v = self.value(value, locals, host)?;
                let slot = locals
                    .get_mut(*idx as usize)
                    .ok_or_else(|| Trap::TypeMismatch(format!("no local {idx}")))?;
                *slot = v;
                Ok(None)
            }

            Instr::Binary(op, ty, lhs, rhs) => {
                let a = self.value(lhs, locals, host)?;
                let b = self.value(rhs, locals, host)?;
                Ok(Some(binary(*op, *ty, &a, &b)?))
            }
            Instr::Unary(op, ty, operand) => {
                let v = self.value(operand, locals, host)?;
                Ok(Some(unary(*op, *ty, &v)?))
            }
            Instr::Convert(op, operand) => {
                let v = self.value(operand, locals, host)?;
                Ok(Some(convert(*op, &v)?))
            }

            Instr::Block { label, body } => match self.eval_seq(body, locals, host) {
                Err(Flow::Break(l, v)) if l == *label => Ok(v),
                other => other,
            },
            Instr::Loop { label, body } => loop {
                match self.eval_seq(body, locals, host) {
                    Err(Flow::Break(l, _)) if l == *label => continue,
                    other => return other,
                }
            },
            Instr::If { cond, then, else_ } => {
                if self.value(cond, locals, host)?.as_i32()? != 0 {
                    self.eval_seq(then, locals, host)
                } else {
                    self.eval_seq(else_, locals, host)
                }
            }
            Instr::Br { label, value } => {
                let v = match value {
                    Some(value) => Some(self.value(value, locals, host)?),
                    None => None,
                };
                Err(Flow::Break(*label, v))
            }
            Instr::Return(value) => {
                let v = match value {
                    Some(value) => Some(self.value(value, locals, host)?),
                    None => None,
                };
                Err(Flow::Return(v))
            }
            Instr::Unreachable(code) => Err(Trap::Code(*code).into()),
            Instr::Drop(value) => {
                self.eval(value, locals, host)?;
                Ok(None)
            }

            Instr::Call { func, args } => {
                let args = self.values(args, locals, host)?;
                Ok(self.call(*func, args, host)?)
            }
            Instr::CallImport { import, args } => {
                let args = self.values(args, locals, host)?;
                let module = Rc::clone(&self.module);
                let import = module
                    .imports
                    .get(*import as usize)
                    .ok_or_else(|| Trap::TypeMismatch(format!("no import {import}")))?;
                Ok(host.call_import(import, &args, &mut self.memory)?)
            }

            Instr::StructNew { ty, fields } => {
                let fields = self.values(fields, locals, host)?;
                let expected = self
                    .module
                    .types
                    .get(*ty as usize)
                    .map(|t| t.fields.len())
                    .ok_or_else(|| Trap::TypeMismatch(format!("no type {ty}")))?;
                if fields.len() != expected {
                    return Err(Trap::TypeMismatch(format!(
                        "type {ty} has {expected} fields, {} given",
                        fields.len()
                    ))
                    .into());
                }
                Ok(Some(Val::Ref(Some(Rc::new(RefCell::new(Object::Struct {
                    ty: *ty,
                    fields,
                }))))))
            }
            Instr::StructGet { ty, field, obj } => {
                let obj = self.value(obj, locals, host)?.as_object()?;
                let obj = obj.borrow();
                let fields = self.struct_fields(&obj, *ty)?;
                Ok(Some(field_of(fields, *field)?.clone()))
            }
            Instr::StructSet {
                ty,
                field,
                obj,
                value,
            } => {
                let obj = self.value(obj, locals, host)?.as_object()?;
                let v = self.value(value, locals, host)?;
                let mutable = self
                    .module
                    .types
                    .get(*ty as usize)
                    .and_then(|t| t.fields.get(*field as usize))
                    .map(|f| f.mutable)
                    .unwrap_or(false);
                if !mutable {
                    return Err(Trap::TypeMismatch(format!("field {field} of type {ty} is immutable")).into());
                }
                let mut obj = obj.borrow_mut();
                match &mut *obj {
                    Object::Struct { ty: actual, fields } if self.module.is_subtype(*actual, *ty) => {
                        let slot = fields
                            .get_mut(*field as usize)
                            .ok_or_else(|| Trap::TypeMismatch(format!("no field {field}")))?;
                        *slot = v;
                        Ok(None)
                    }
                    _ => Err(Trap::TypeMismatch(format!("object is not a {ty}")).into()),
                }
            }
            Instr::RefIsNull(value) => match self.value(value, locals, host)? {
                Val::Ref(r) => Ok(Some(Val::I32(r.is_none() as i32))),
                other => Err(Trap::TypeMismatch(format!("ref.is_null on {other}")).into()),
            },

            Instr::ArrayNew(items) => {
                let items = self.values(items, locals, host)?;
                Ok(Some(Val::Ref(Some(Rc::new(RefCell::new(Object::Array(items)))))))
            }
            Instr::ArrayGet { array, index } => {
                let array = self.value(array, locals, host)?.as_object()?;
                let index = self.value(index, locals, host)?.as_i32()?;
                let array = array.borrow();
                match &*array {
                    Object::Array(items) => items
                        .get(index as usize)
                        .cloned()
                        .map(Some)
                        .ok_or_else(|| Trap::OutOfBounds { addr: index as usize, len: items.len() }.into()),
                    Object::Struct { .. } => Err(Trap::TypeMismatch("array.get on struct".into()).into()),
                }
            }
            Instr::ArrayLen(array) => {
                let array = self.value(array, locals, host)?.as_object()?;
                let array = array.borrow();
                match &*array {
                    Object::Array(items) => Ok(Some(Val::I32(items.len() as i32))),
                    Object::Struct { .. } => Err(Trap::TypeMismatch("array.len on struct".into()).into()),
                }
            }

            Instr::MemLoad32(addr) => {
                let addr = self.value(addr, locals, host)?.as_i32()? as u32 as usize;
                let bytes = self.mem(addr, 4)?;
                let mut raw = [0u8; 4];
                raw.copy_from_slice(bytes);
                Ok(Some(Val::I32(i32::from_le_bytes(raw))))
            }
            Instr::MemLoad64(addr) => {
                let addr = self.value(addr, locals, host)?.as_i32()? as u32 as usize;
                let bytes = self.mem(addr, 8)?;
                let mut raw = [0u8; 8];
                raw.copy_from_slice(bytes);
                Ok(Some(Val::I64(i64::from_le_bytes(raw))))
            }
            Instr::MemStore32 { addr, value } => {
                let addr = self.value(addr, locals, host)?.as_i32()? as u32 as usize;
                let v = self.value(value, locals, host)?.as_i32()?;
                self.mem_mut(addr, 4)?.copy_from_slice(&v.to_le_bytes());
                Ok(None)
            }
            Instr::MemStore64 { addr, value } => {
                let addr = self.value(addr, locals, host)?.as_i32()? as u32 as usize;
                let v = self.value(value, locals, host)?.as_i64()?;
                self.mem_mut(addr, 8)?.copy_from_slice(&v.to_le_bytes());
                Ok(None)
            }
        }
    }

    fn values(&mut self, instrs: &[Instr], locals: &mut Vec<Val>, host: &mut dyn Host) -> Result<Vec<Val>, Flow> {
        instrs.iter().map(|i| self.value(i, locals, host)).collect()
    }

    fn struct_fields<'o>(&self, obj: &'o Object, ty: TypeIdx) -> Result<&'o [Val], Trap> {
        match obj {
            Object::Struct { ty: actual, fields } if self.module.is_subtype(*actual, ty) => Ok(fields),
            Object::Struct { ty: actual, .. } => Err(Trap::TypeMismatch(format!(
                "struct of type {actual} is not a subtype of {ty}"
            ))),
            Object::Array(_) => Err(Trap::TypeMismatch("struct.get on array".into())),
        }
    }

    fn mem(&self, addr: usize, len: usize) -> Result<&[u8], Trap> {
        self.memory
            .get(addr..addr + len)
            .ok_or(Trap::OutOfBounds { addr, len })
    }

    fn mem_mut(&mut self, addr: usize, len: usize) -> Result<&mut [u8], Trap> {
        self.memory
            .get_mut(addr..addr + len)
            .ok_or(Trap::OutOfBounds { addr, len })
    }
}

fn local(locals: &[Val], idx: LocalIdx) -> Result<&Val, Trap> {
    locals
        .get(idx as usize)
        .ok_or_else(|| Trap::TypeMismatch(format!("no local {idx}")))
}

fn field_of(fields: &[Val], field: u32) -> Result<&Val, Trap> {
    fields
        .get(field as usize)
        .ok_or_else(|| Trap::TypeMismatch(format!("no field {field}")))
}

fn binary(op: BinOp, ty: NumType, a: &Val, b: &Val) -> Result<Val, Trap> {
    let bool_val = |b: bool| Val::I32(b as i32);
    match ty {
        NumType::I32 => {
            let (x, y) = (a.as_i32()?, b.as_i32()?);
            Ok(match op {
                BinOp::Add => Val::I32(x.wrapping_add(y)),
                BinOp::Sub => Val::I32(x.wrapping_sub(y)),
                BinOp::Mul => Val::I32(x.wrapping_mul(y)),
                BinOp::Div if y == 0 => return Err(Trap::DivisionByZero),
                BinOp::Div => Val::I32(x.wrapping_div(y)),
                BinOp::Rem if y == 0 => return Err(Trap::DivisionByZero),
                BinOp::Rem => Val::I32(x.wrapping_rem(y)),
                BinOp::And => Val::I32(x & y),
                BinOp::Or => Val::I32(x | y),
                BinOp::Xor => Val::I32(x ^ y),
                BinOp::Eq => bool_val(x == y),
                BinOp::Ne => bool_val(x != y),
                BinOp::Lt => bool_val(x < y),
                BinOp::Le => bool_val(x <= y),
                BinOp::Gt => bool_val(x > y),
                BinOp::Ge => bool_val(x >= y),
            })
        }
        NumType::I64 => {
            let (x, y) = (a.as_i64()?, b.as_i64()?);
            Ok(match op {
                BinOp::Add => Val::I64(x.wrapping_add(y)),
                BinOp::Sub => Val::I64(x.wrapping_sub(y)),
                BinOp::Mul => Val::I64(x.wrapping_mul(y)),
                BinOp::Div if y == 0 => return Err(Trap::DivisionByZero),
                BinOp::Div => Val::I64(x.wrapping_div(y)),
                BinOp::Rem if y == 0 => return Err(Trap::DivisionByZero),
                BinOp::Rem => Val::I64(x.wrapping_rem(y)),
                BinOp::And => Val::I64(x & y),
                BinOp::Or => Val::I64(x | y),
                BinOp::Xor => Val::I64(x ^ y),
                BinOp::Eq => bool_val(x == y),
                BinOp::Ne => bool_val(x != y),
                BinOp::Lt => bool_val(x < y),
                BinOp::Le => bool_val(x <= y),
                BinOp::Gt => bool_val(x > y),
                BinOp::Ge => bool_val(x >= y),
            })
        }
        NumType::F32 => {
            let (x, y) = (a.as_f32()?, b.as_f32()?);
            float_binary(op, x as f64, y as f64).map(|v| match v {
                Val::F64(v) => Val::F32(v as f32),
                other => other,
            })
        }
        NumType::F64 => float_binary(op, a.as_f64()?, b.as_f64()?),
    }
}

fn float_binary(op: BinOp, x: f64, y: f64) -> Result<Val, Trap> {
    let bool_val = |b: bool| Val::I32(b as i32);
    Ok(match op {
        BinOp::Add => Val::F64(x + y),
        BinOp::Sub => Val::F64(x - y),
        BinOp::Mul => Val::F64(x * y),
        BinOp::Div => Val::F64(x / y),
        BinOp::Rem => Val::F64(x % y),
        BinOp::Eq => bool_val(x == y),
        BinOp::Ne => bool_val(x != y),
        BinOp::Lt => bool_val(x < y),
        BinOp::Le => bool_val(x <= y),
        BinOp::Gt => bool_val(x > y),
        BinOp::Ge => bool_val(x >= y),
        BinOp::And | BinOp::Or | BinOp::Xor => {
            return Err(Trap::TypeMismatch(format!("{op:?} on floats")))
        }
    })
}

fn unary(op: UnOp, ty: NumType, v: &Val) -> Result<Val, Trap> {
    Ok(match (op, ty) {
        (UnOp::Neg, NumType::I32) => Val::I32(v.as_i32()?.wrapping_neg()),
        (UnOp::Neg, NumType::I64) => Val::I64(v.as_i64()?.wrapping_neg()),
        (UnOp::Neg, NumType::F32) => Val::F32(-v.as_f32()?),
        (UnOp::Neg, NumType::F64) => Val::F64(-v.as_f64()?),
        (UnOp::Eqz, NumType::I32) => Val::I32((v.as_i32()? == 0) as i32),
        (UnOp::Eqz, NumType::I64) => Val::I32((v.as_i64()? == 0) as i32),
        (UnOp::Eqz, _) => return Err(Trap::TypeMismatch("eqz on float".into())),
    })
}

fn convert(op: ConvertOp, v: &Val) -> Result<Val, Trap> {
    Ok(match op {
        ConvertOp::WrapI64 => Val::I32(v.as_i64()? as i32),
        ConvertOp::ExtendI32S => Val::I64(v.as_i32()? as i64),
        ConvertOp::ExtendI32U => Val::I64(v.as_i32()? as u32 as i64),
        ConvertOp::F32FromBits => Val::F32(f32::from_bits(v.as_i32()? as u32)),
        ConvertOp::F32ToBits => Val::I32(v.as_f32()?.to_bits() as i32),
        ConvertOp::F64FromBits => Val::F64(f64::from_bits(v.as_i64()? as u64)),
        ConvertOp::F64ToBits => Val::I64(v.as_f64()?.to_bits() as i64),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::module::{FieldType, Function, StructType};

    fn module_with(functions: Vec<Function>) -> Rc<Module> {
        let mut module = Module::new();
        module.add_type(StructType {
            name: "cell".into(),
            supertype: None,
            fields: vec![FieldType::mutable("v", ValType::I32)],
        });
        for f in functions {
            let name = f.name.clone();
            let idx = module.add_function(f);
            module.export(name, idx);
        }
        module.memory_size = 64;
        Rc::new(module)
    }

    fn func(name: &str, params: Vec<ValType>, locals: Vec<ValType>, body: Vec<Instr>) -> Function {
        Function {
            name: name.into(),
            params,
            locals,
            result: Some(ValType::I32),
            body,
        }
    }

    #[test]
    fn test_loop_with_break_value() {
        // sum = 0; i = 0; loop { if i == 5 break sum; sum += i; i += 1 }
        let (sum, i) = (0, 1);
        let exit = Label(0);
        let top = Label(1);
        let body = vec![Instr::Block {
            label: exit,
            body: vec![Instr::Loop {
                label: top,
                body: vec![
                    Instr::if_else(
                        Instr::i32_eq(Instr::local(i), Instr::I32Const(5)),
                        vec![Instr::Br {
                            label: exit,
                            value: Some(Box::new(Instr::local(sum))),
                        }],
                        vec![],
                    ),
                    Instr::set(sum, Instr::binary(BinOp::Add, NumType::I32, Instr::local(sum), Instr::local(i))),
                    Instr::set(i, Instr::binary(BinOp::Add, NumType::I32, Instr::local(i), Instr::I32Const(1))),
                    Instr::br(top),
                ],
            }],
        }];
        let module = module_with(vec![func("sum", vec![], vec![ValType::I32, ValType::I32], body)]);
        let mut instance = Instance::new(module, 16);
        let result = instance.invoke("sum", &[], &mut NoHost).unwrap();
        assert_eq!(result, Some(Val::I32(10)));
    }

    #[test]
    fn test_struct_mutation_and_subtype_check() {
        let body = vec![
            Instr::set(0, Instr::StructNew { ty: 0, fields: vec![Instr::I32Const(1)] }),
            Instr::struct_set(0, 0, Instr::local(0), Instr::I32Const(41)),
            Instr::binary(
                BinOp::Add,
                NumType::I32,
                Instr::struct_get(0, 0, Instr::local(0)),
                Instr::I32Const(1),
            ),
        ];
        let module = module_with(vec![func("cell", vec![], vec![ValType::Ref(Some(0))], body)]);
        let mut instance = Instance::new(module, 16);
        assert_eq!(instance.invoke("cell", &[], &mut NoHost).unwrap(), Some(Val::I32(42)));
    }

    #[test]
    fn test_traps() {
        let div = func(
            "div",
            vec![ValType::I32],
            vec![],
            vec![Instr::binary(BinOp::Div, NumType::I32, Instr::I32Const(1), Instr::local(0))],
        );
        let guard = func("guard", vec![], vec![], vec![Instr::Unreachable(TrapCode::TailResumeExhausted)]);
        let null = func(
            "null",
            vec![],
            vec![],
            vec![Instr::struct_get(0, 0, Instr::RefNull)],
        );
        let mut instance = Instance::new(module_with(vec![div, guard, null]), 16);
        assert_eq!(
            instance.invoke("div", &[Val::I32(0)], &mut NoHost),
            Err(Trap::DivisionByZero)
        );
        assert_eq!(
            instance.invoke("guard", &[], &mut NoHost),
            Err(Trap::Code(TrapCode::TailResumeExhausted))
        );
        assert_eq!(instance.invoke("null", &[], &mut NoHost), Err(Trap::NullReference));
        assert!(matches!(
            instance.invoke("missing", &[], &mut NoHost),
            Err(Trap::UnknownExport(_))
        ));
        assert!(matches!(
            instance.invoke("div", &[], &mut NoHost),
            Err(Trap::ArgumentCount { expected: 1, found: 0 })
        ));
    }

    #[test]
    fn test_call_depth_limit() {
        let rec = func(
            "rec",
            vec![],
            vec![],
            vec![Instr::Call { func: 0, args: vec![] }],
        );
        let mut instance = Instance::new(module_with(vec![rec]), 8);
        assert_eq!(
            instance.invoke("rec", &[], &mut NoHost),
            Err(Trap::CallStackExhausted(8))
        );
    }

    #[test]
    fn test_memory_roundtrip_and_bounds() {
        let body = vec![
            Instr::store64(Instr::I32Const(8), Instr::I64Const(-5)),
            Instr::convert(ConvertOp::WrapI64, Instr::MemLoad64(Box::new(Instr::I32Const(8)))),
        ];
        let oob = func("oob", vec![], vec![], vec![Instr::load32(Instr::I32Const(62))]);
        let mut instance = Instance::new(module_with(vec![func("mem", vec![], vec![], body), oob]), 8);
        assert_eq!(instance.invoke("mem", &[], &mut NoHost).unwrap(), Some(Val::I32(-5)));
        assert_eq!(
            instance.invoke("oob", &[], &mut NoHost),
            Err(Trap::OutOfBounds { addr: 62, len: 4 })
        );
    }
}
