//! Typed program graph.
//!
//! The effect subsystem consumes programs that an external front end has
//! already parsed, resolved and type checked. This module is the interface
//! to that front end:
//!
//! - [`Program`] - Effect declarations and functions of one compilation unit
//! - [`FnDecl`] - A function with its local table and body
//! - [`Expr`] - Typed expression trees
//!
//! Programs are serializable so the `rillc` binary can read them as JSON.
//! Tests build them with [`ProgramBuilder`].

pub mod build;
pub mod def;
pub mod expr;
pub mod item;
pub mod ty;

use serde::{Deserialize, Serialize};

pub use build::{FnBuilder, ProgramBuilder};
pub use def::{DefId, ExprId, LocalId, OpRef};
pub use expr::{BinOp, Expr, ExprKind, HandlerClause, Intrinsic, Literal, MatchArm, Pattern, Stmt, UnaryOp};
pub use item::{DeclaredRow, EffectDecl, FnDecl, LocalDecl, OpDecl};
pub use ty::Type;

/// One compilation unit.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Program {
    /// Effect declarations, in declaration order.
    pub effects: Vec<EffectDecl>,
    /// Functions, in program order.
    pub functions: Vec<FnDecl>,
}

impl Program {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn effect(&self, def: DefId) -> Option<&EffectDecl> {
        self.effects.iter().find(|e| e.def == def)
    }

    /// Position of an effect in declaration order.
    pub fn effect_position(&self, def: DefId) -> Option<usize> {
        self.effects.iter().position(|e| e.def == def)
    }

    pub fn function(&self, def: DefId) -> Option<&FnDecl> {
        self.functions.iter().find(|f| f.def == def)
    }

    pub fn function_by_name(&self, name: &str) -> Option<&FnDecl> {
        self.functions.iter().find(|f| f.name == name)
    }

    pub fn op(&self, op: OpRef) -> Option<&OpDecl> {
        self.effect(op.effect)?.ops.get(op.index as usize)
    }

    /// `Effect.op` label of an operation.
    pub fn op_label(&self, op: OpRef) -> String {
        match (self.effect(op.effect), self.op(op)) {
            (Some(effect), Some(decl)) => format!("{}.{}", effect.name, decl.name),
            _ => format!("{}.#{}", op.effect, op.index),
        }
    }

    /// A generator for expression ids not used anywhere in the program.
    pub fn expr_ids(&self) -> ExprIdGen {
        let mut max = 0;
        for function in &self.functions {
            function.body.walk(&mut |e| max = max.max(e.id.0));
        }
        ExprIdGen { next: max + 1 }
    }
}

/// Hands out fresh [`ExprId`]s.
#[derive(Debug, Clone)]
pub struct ExprIdGen {
    next: u32,
}

impl ExprIdGen {
    pub fn starting_at(next: u32) -> Self {
        Self { next }
    }

    pub fn fresh(&mut self) -> ExprId {
        let id = ExprId(self.next);
        self.next += 1;
        id
    }
}
