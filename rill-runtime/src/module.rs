//! # Target Module Format
//!
//! The structured-memory module the structural backend emits and the
//! [`machine`](crate::machine) executes. The shape follows a GC-style
//! bytecode target: typed struct records with single-inheritance subtyping,
//! untyped arrays, a flat linear memory for the host-facing buffer, imports
//! from the host and named exports.
//!
//! Function bodies are expression trees rather than a flat instruction
//! stream. Every [`Instr`] evaluates to at most one value. Structured control
//! flow uses function-unique [`Label`]s:
//!
//! | Construct | Meaning of `Br { label }` |
//! |-----------|---------------------------|
//! | `Block`   | leave the block, yielding the branch value |
//! | `Loop`    | jump back to the start of the loop body |
//!
//! Falling off the end of a `Loop` body leaves the loop.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Index into [`Module::types`].
pub type TypeIdx = u32;
/// Index into [`Module::functions`].
pub type FuncIdx = u32;
/// Index into [`Module::imports`].
pub type ImportIdx = u32;
/// Index into a function's locals (parameters first).
pub type LocalIdx = u32;

/// A structured-control label, unique within one function body.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Label(pub u32);

/// Value types.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ValType {
    I32,
    I64,
    F32,
    F64,
    /// Nullable reference. `Some(ty)` names a struct type; `None` is any
    /// heap reference (struct or array).
    Ref(Option<TypeIdx>),
}

impl fmt::Display for ValType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ValType::I32 => f.write_str("i32"),
            ValType::I64 => f.write_str("i64"),
            ValType::F32 => f.write_str("f32"),
            ValType::F64 => f.write_str("f64"),
            ValType::Ref(Some(ty)) => write!(f, "(ref null {ty})"),
            ValType::Ref(None) => f.write_str("anyref"),
        }
    }
}

/// Numeric operand type of arithmetic instructions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum NumType {
    I32,
    I64,
    F32,
    F64,
}

/// Binary operators. Comparisons produce an `i32` boolean.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum BinOp {
    Add,
    Sub,
    Mul,
    Div,
    Rem,
    And,
    Or,
    Xor,
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
}

/// Unary operators.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum UnOp {
    Neg,
    /// `1` if the operand is zero, `0` otherwise.
    Eqz,
}

/// Width changes and bit reinterpretations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ConvertOp {
    WrapI64,
    ExtendI32S,
    ExtendI32U,
    F32FromBits,
    F32ToBits,
    F64FromBits,
    F64ToBits,
}

/// Reasons an `Unreachable` instruction traps.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TrapCode {
    Unreachable,
    /// A tail continuation was resumed more than once.
    TailResumeExhausted,
    /// A handler clause finished without resuming its tail continuation.
    TailResumeMissing,
    /// A value shape the wire boundary cannot encode.
    UnsupportedValue,
    /// A host import reported that the buffer was too small.
    BufferOverflow,
    /// A continuation environment carried an unknown site id.
    UnknownSite,
    /// A resumed continuation did not match any compiled operation.
    OpMismatch,
    /// An export was invoked with the wrong number of arguments.
    ArityMismatch,
}

impl fmt::Display for TrapCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            TrapCode::Unreachable => "unreachable executed",
            TrapCode::TailResumeExhausted => "tail continuation resumed more than once",
            TrapCode::TailResumeMissing => "tail continuation never resumed",
            TrapCode::UnsupportedValue => "value shape not supported at the boundary",
            TrapCode::BufferOverflow => "serialization buffer too small",
            TrapCode::UnknownSite => "unknown continuation site",
            TrapCode::OpMismatch => "continuation does not match a compiled operation",
            TrapCode::ArityMismatch => "wrong number of arguments",
        };
        f.write_str(text)
    }
}

/// Instruction tree.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Instr {
    I32Const(i32),
    I64Const(i64),
    F32Const(f32),
    F64Const(f64),
    RefNull,

    LocalGet(LocalIdx),
    LocalSet(LocalIdx, Box<Instr>),

    Binary(BinOp, NumType, Box<Instr>, Box<Instr>),
    Unary(UnOp, NumType, Box<Instr>),
    Convert(ConvertOp, Box<Instr>),

    /// Sequence; yields the value of the last instruction unless left by `Br`.
    Block { label: Label, body: Vec<Instr> },
    Loop { label: Label, body: Vec<Instr> },
    If {
        cond: Box<Instr>,
        then: Vec<Instr>,
        else_: Vec<Instr>,
    },
    Br { label: Label, value: Option<Box<Instr>> },
    Return(Option<Box<Instr>>),
    Unreachable(TrapCode),
    Drop(Box<Instr>),

    Call { func: FuncIdx, args: Vec<Instr> },
    CallImport { import: ImportIdx, args: Vec<Instr> },

    StructNew { ty: TypeIdx, fields: Vec<Instr> },
    StructGet { ty: TypeIdx, field: u32, obj: Box<Instr> },
    StructSet {
        ty: TypeIdx,
        field: u32,
        obj: Box<Instr>,
        value: Box<Instr>,
    },
    RefIsNull(Box<Instr>),

    ArrayNew(Vec<Instr>),
    ArrayGet { array: Box<Instr>, index: Box<Instr> },
    ArrayLen(Box<Instr>),

    MemLoad32(Box<Instr>),
    MemStore32 { addr: Box<Instr>, value: Box<Instr> },
    MemLoad64(Box<Instr>),
    MemStore64 { addr: Box<Instr>, value: Box<Instr> },
}

impl Instr {
    pub fn local(idx: LocalIdx) -> Self {
        Instr::LocalGet(idx)
    }

    pub fn set(idx: LocalIdx, value: Instr) -> Self {
        Instr::LocalSet(idx, Box::new(value))
    }

    pub fn binary(op: BinOp, ty: NumType, lhs: Instr, rhs: Instr) -> Self {
        Instr::Binary(op, ty, Box::new(lhs), Box::new(rhs))
    }

    pub fn i32_eq(lhs: Instr, rhs: Instr) -> Self {
        Instr::binary(BinOp::Eq, NumType::I32, lhs, rhs)
    }

    pub fn eqz(value: Instr) -> Self {
        Instr::Unary(UnOp::Eqz, NumType::I32, Box::new(value))
    }

    pub fn convert(op: ConvertOp, value: Instr) -> Self {
        Instr::Convert(op, Box::new(value))
    }

    pub fn if_else(cond: Instr, then: Vec<Instr>, else_: Vec<Instr>) -> Self {
        Instr::If {
            cond: Box::new(cond),
            then,
            else_,
        }
    }

    pub fn br(label: Label) -> Self {
        Instr::Br { label, value: None }
    }

    pub fn ret(value: Instr) -> Self {
        Instr::Return(Some(Box::new(value)))
    }

    pub fn struct_get(ty: TypeIdx, field: u32, obj: Instr) -> Self {
        Instr::StructGet {
            ty,
            field,
            obj: Box::new(obj),
        }
    }

    pub fn struct_set(ty: TypeIdx, field: u32, obj: Instr, value: Instr) -> Self {
        Instr::StructSet {
            ty,
            field,
            obj: Box::new(obj),
            value: Box::new(value),
        }
    }

    pub fn array_get(array: Instr, index: u32) -> Self {
        Instr::ArrayGet {
            array: Box::new(array),
            index: Box::new(Instr::I32Const(index as i32)),
        }
    }

    pub fn load32(addr: Instr) -> Self {
        Instr::MemLoad32(Box::new(addr))
    }

    pub fn store32(addr: Instr, value: Instr) -> Self {
        Instr::MemStore32 {
            addr: Box::new(addr),
            value: Box::new(value),
        }
    }

    pub fn store64(addr: Instr, value: Instr) -> Self {
        Instr::MemStore64 {
            addr: Box::new(addr),
            value: Box::new(value),
        }
    }
}

/// One field of a struct type.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldType {
    pub name: String,
    pub ty: ValType,
    pub mutable: bool,
}

impl FieldType {
    pub fn new(name: impl Into<String>, ty: ValType) -> Self {
        Self {
            name: name.into(),
            ty,
            mutable: false,
        }
    }

    pub fn mutable(name: impl Into<String>, ty: ValType) -> Self {
        Self {
            name: name.into(),
            ty,
            mutable: true,
        }
    }
}

/// A struct type. A subtype repeats its supertype's fields as a prefix.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StructType {
    pub name: String,
    pub supertype: Option<TypeIdx>,
    pub fields: Vec<FieldType>,
}

/// A function definition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Function {
    pub name: String,
    pub params: Vec<ValType>,
    /// Locals beyond the parameters.
    pub locals: Vec<ValType>,
    pub result: Option<ValType>,
    pub body: Vec<Instr>,
}

/// A host-provided function.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Import {
    pub module: String,
    pub name: String,
    pub params: Vec<ValType>,
    pub result: Option<ValType>,
}

/// A named entry point.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Export {
    pub name: String,
    pub func: FuncIdx,
}

/// An opaque named byte section.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CustomSection {
    pub name: String,
    pub data: Vec<u8>,
}

/// A complete module.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Module {
    pub types: Vec<StructType>,
    pub imports: Vec<Import>,
    pub functions: Vec<Function>,
    pub exports: Vec<Export>,
    pub custom_sections: Vec<CustomSection>,
    /// Size of linear memory in bytes.
    pub memory_size: usize,
}

impl Module {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_type(&mut self, ty: StructType) -> TypeIdx {
        self.types.push(ty);
        (self.types.len() - 1) as TypeIdx
    }

    pub fn add_import(&mut self, import: Import) -> ImportIdx {
        self.imports.push(import);
        (self.imports.len() - 1) as ImportIdx
    }

    pub fn add_function(&mut self, func: Function) -> FuncIdx {
        self.functions.push(func);
        (self.functions.len() - 1) as FuncIdx
    }

    pub fn export(&mut self, name: impl Into<String>, func: FuncIdx) {
        self.exports.push(Export {
            name: name.into(),
            func,
        });
    }

    pub fn type_by_name(&self, name: &str) -> Option<TypeIdx> {
        self.types
            .iter()
            .position(|t| t.name == name)
            .map(|i| i as TypeIdx)
    }

    pub fn function_by_name(&self, name: &str) -> Option<FuncIdx> {
        self.functions
            .iter()
            .position(|f| f.name == name)
            .map(|i| i as FuncIdx)
    }

    pub fn find_export(&self, name: &str) -> Option<FuncIdx> {
        self.exports.iter().find(|e| e.name == name).map(|e| e.func)
    }

    pub fn custom_section(&self, name: &str) -> Option<&[u8]> {
        self.custom_sections
            .iter()
            .find(|s| s.name == name)
            .map(|s| s.data.as_slice())
    }

    /// Whether `sub` is `sup` or transitively declares it as supertype.
    pub fn is_subtype(&self, sub: TypeIdx, sup: TypeIdx) -> bool {
        let mut current = Some(sub);
        while let Some(ty) = current {
            if ty == sup {
                return true;
            }
            current = self.types.get(ty as usize).and_then(|t| t.supertype);
        }
        false
    }
}
