//! # Effects System
//!
//! Static side of Rill's algebraic effects: effect rows, handler checking,
//! continuation usage, and whole-program row inference.
//!
//! ## Module Structure
//!
//! - [`row`] - Interned effect rows and row composition
//! - [`handler`] - Handler clause resolution and row shrinking
//! - [`usage`] - How often a clause uses its continuation
//! - [`infer`] - Function rows by fixpoint over the call graph
//!
//! ```text
//! fn inner(x: i32) -> i32 / {Async.await} {
//!     perform Async.await(x) + 1
//! }
//!
//! handle inner(4) {
//!     Async.await(v) => resume(v * 2)     // row of the handle: {}
//! }
//! ```

pub mod handler;
pub mod infer;
pub mod row;
pub mod usage;

pub use handler::{ClauseResolution, ContinuationType, HandlerChecker, HandlerResolution};
pub use infer::{analyze, EffectAnalysis};
pub use row::{EffectOp, OpName, RowId, RowStore, RowVar};
pub use usage::{ContinuationUsage, Enforcement, EscapeKind, UsageBound};
