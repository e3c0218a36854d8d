//! # Rill Runtime Library
//!
//! The target side of the Rill effect system:
//!
//! - **Module format** ([`module`]): typed struct records, untyped arrays,
//!   linear memory, imports and exports, as emitted by the structural backend
//! - **Machine** ([`machine`]): executes modules; dynamic faults are [`Trap`]s
//! - **Effect table** ([`table`]): the versioned `rill.effects` custom section
//! - **Wire codec** ([`wire`]): value slots and call/effect envelopes
//! - **Host runner** ([`runner`]): parses the table, assigns handles and
//!   drives the call/inspect/handle/resume loop
//!
//! ## Architecture
//!
//! ```text
//! ┌────────────────────────────────────────────────────────────┐
//! │                        HOST RUNNER                          │
//! │   table ──► handles ──► registry (7-key lookup)             │
//! ├───────────────────────────┬────────────────────────────────┤
//! │  wire envelopes (buffer)  │  host imports (write/read)      │
//! ├───────────────────────────┴────────────────────────────────┤
//! │              MACHINE  (Instance, linear memory, GC refs)    │
//! ├────────────────────────────────────────────────────────────┤
//! │              MODULE   (types, functions, exports, sections) │
//! └────────────────────────────────────────────────────────────┘
//! ```
//!
//! Execution is single-threaded. A suspended computation is an ordinary
//! heap record returned from an export; nothing blocks.

#![warn(rust_2018_idioms)]

pub mod config;
pub mod machine;
pub mod module;
pub mod outcome;
pub mod runner;
pub mod table;
pub mod wire;

pub use config::{ConfigError, LogLevel, RunnerConfig, RunnerConfigBuilder};
pub use machine::{Host, Instance, NoHost, Trap, Val};
pub use module::{Module, TrapCode};
pub use outcome::{EffectRequest, Outcome, ResumeKind};
pub use runner::{HandlerCall, HandlerError, HandlerKey, HandlerRegistry, HostRunner, RunError};
pub use table::{effect_id_hash, signature_hash, EffectTable, EffectTableEntry, TableError};
pub use wire::{BufferLayout, ValueTag, WireError, WireValue};
