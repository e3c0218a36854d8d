//! Top-level items: effect declarations and functions.

use rill_runtime::ResumeKind;
use serde::{Deserialize, Serialize};

use super::def::{DefId, LocalId};
use super::expr::Expr;
use super::ty::Type;
use crate::span::Span;

/// An effect declaration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EffectDecl {
    pub def: DefId,
    pub name: String,
    /// Operations in declaration order. The position is the operation id.
    pub ops: Vec<OpDecl>,
    #[serde(default)]
    pub span: Span,
}

impl EffectDecl {
    /// Indices of all operations (overloads included) named `name`.
    pub fn ops_named(&self, name: &str) -> Vec<(u32, &OpDecl)> {
        self.ops
            .iter()
            .enumerate()
            .filter(|(_, op)| op.name == name)
            .map(|(i, op)| (i as u32, op))
            .collect()
    }
}

/// One effect operation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OpDecl {
    pub name: String,
    /// Number of generic parameters (`Type::Param(0..generics)`).
    #[serde(default)]
    pub generics: u32,
    pub params: Vec<Type>,
    pub ret: Type,
    pub kind: ResumeKind,
}

impl OpDecl {
    /// The canonical signature hashed into the effect table, e.g.
    /// `State.get()->i32`.
    pub fn canonical_signature(&self, effect_name: &str) -> String {
        let params: Vec<String> = self.params.iter().map(Type::to_string).collect();
        format!("{}.{}({})->{}", effect_name, self.name, params.join(","), self.ret)
    }
}

/// A local variable declaration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LocalDecl {
    pub name: String,
    pub ty: Type,
}

/// An effect row written on a function signature.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeclaredRow {
    /// Qualified operation labels (`Effect.op`).
    pub ops: Vec<String>,
    /// Whether the row ends in a row variable.
    #[serde(default)]
    pub open: bool,
}

/// A function definition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FnDecl {
    pub def: DefId,
    pub name: String,
    pub params: Vec<LocalId>,
    pub ret: Type,
    /// All locals of the body, parameters first.
    pub locals: Vec<LocalDecl>,
    pub body: Expr,
    /// The declared effect row; `None` lets inference decide.
    #[serde(default)]
    pub effects: Option<DeclaredRow>,
    /// Whether the host may call this function.
    #[serde(default)]
    pub exported: bool,
    #[serde(default)]
    pub span: Span,
}

impl FnDecl {
    pub fn local(&self, id: LocalId) -> Option<&LocalDecl> {
        self.locals.get(id.index as usize)
    }

    pub fn local_ty(&self, id: LocalId) -> Type {
        self.local(id).map(|l| l.ty.clone()).unwrap_or(Type::Unit)
    }

    pub fn local_name(&self, id: LocalId) -> &str {
        self.local(id).map(|l| l.name.as_str()).unwrap_or("_")
    }

    /// Add a local and return its id.
    pub fn add_local(&mut self, name: impl Into<String>, ty: Type) -> LocalId {
        self.locals.push(LocalDecl {
            name: name.into(),
            ty,
        });
        LocalId::new((self.locals.len() - 1) as u32)
    }

    pub fn param_types(&self) -> Vec<Type> {
        self.params.iter().map(|p| self.local_ty(*p)).collect()
    }
}
