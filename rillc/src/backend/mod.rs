//! # Continuation Backends
//!
//! Two ways of giving effectful code an executable shape. Both evaluate an
//! effectful function to an [`Outcome`](rill_runtime::Outcome) and agree on
//! which operations are requested, in which order, and on the final value.
//!
//! - [`interp`]: a tree-walking reference evaluator over the program graph
//! - [`structural`]: a [`rill_runtime::Module`] whose effectful functions can
//!   be re-entered at any site, plus the effect table and host glue

pub mod interp;
pub mod structural;

pub use interp::{InterpError, InterpOutcome, Interpreter, Resumption, Value};
pub use structural::{emit, StructuralOutput};
