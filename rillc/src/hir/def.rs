//! Definition and local identifiers.
//!
//! - [`DefId`] - Global identifier for effects and functions
//! - [`LocalId`] - Identifier for a variable within one function
//! - [`ExprId`] - Program-wide identifier of an expression node
//! - [`OpRef`] - A resolved effect operation (one overload of an effect)

use std::fmt;

use serde::{Deserialize, Serialize};

/// A unique identifier for a top-level definition.
///
/// Effects and functions share one index space.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DefId {
    /// Program-local index for this definition.
    pub index: u32,
}

impl DefId {
    /// Create a new DefId with the given index.
    pub const fn new(index: u32) -> Self {
        Self { index }
    }
}

impl fmt::Debug for DefId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "DefId({})", self.index)
    }
}

impl fmt::Display for DefId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "def{}", self.index)
    }
}

/// A variable within a single function.
///
/// Indices are dense: they index [`FnDecl::locals`](super::FnDecl::locals).
/// Clause parameters, continuation bindings, closure parameters and
/// lowering temporaries all live in the owning function's local table.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct LocalId {
    pub index: u32,
}

impl LocalId {
    pub const fn new(index: u32) -> Self {
        Self { index }
    }
}

impl fmt::Debug for LocalId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "LocalId({})", self.index)
    }
}

impl fmt::Display for LocalId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "_{}", self.index)
    }
}

/// Identifies one expression node anywhere in the program.
///
/// Handler resolutions and effect sites are keyed by `ExprId`, so ids must
/// stay unique when lowering synthesizes new nodes; see
/// [`Program::fresh_expr_id`](super::Program::fresh_expr_id).
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ExprId(pub u32);

impl fmt::Debug for ExprId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ExprId({})", self.0)
    }
}

/// A resolved operation: an effect plus the index of one of its operations.
///
/// Overloads of an operation share a name but have distinct indices, so the
/// index doubles as the wire `opId`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct OpRef {
    pub effect: DefId,
    pub index: u32,
}

impl OpRef {
    pub const fn new(effect: DefId, index: u32) -> Self {
        Self { effect, index }
    }
}
