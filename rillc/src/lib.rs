//! # Rill Compiler: Effect Subsystem
//!
//! Effect row checking, continuation-usage analysis, effect-site lowering and
//! the two continuation backends of the Rill compiler.
//!
//! Programs arrive as an already-typed program graph ([`hir::Program`]); the
//! front end that produces it lives elsewhere.
//!
//! ## Pipeline
//!
//! ```text
//! hir::Program -> effects::analyze -> mir::EffectMetadata -> mir::lower_program
//!              -> backend::structural::emit -> rill_runtime::Module + effect table
//!              \-> backend::interp (reference evaluator)
//! ```
//!
//! ## Quick Start
//!
//! ```rust
//! use rill_runtime::ResumeKind;
//! use rillc::config::CompilerConfig;
//! use rillc::hir::{OpRef, ProgramBuilder, Type};
//!
//! let mut b = ProgramBuilder::new();
//! let ask = b.effect("Ask", vec![ProgramBuilder::op("ask", vec![], Type::I32, ResumeKind::Tail)]);
//! let main = b.function("main", &[], Type::I32, |f| f.perform(OpRef::new(ask, 0), vec![]));
//! b.export(main);
//!
//! let compiled = rillc::driver::compile(&b.finish(), &CompilerConfig::default()).unwrap();
//! assert_eq!(compiled.table.len(), 1);
//! assert!(compiled.module.find_export("main_effectful").is_some());
//! ```
//!
//! ## Module Overview
//!
//! - [`hir`] - Typed program graph and its builder
//! - [`effects`] - Row store, effect inference, handler checking, usage analysis
//! - [`mir`] - Effect metadata and effect-site lowering
//! - [`backend`] - Reference interpreter and structural backend
//! - [`driver`] - The passes in order, with a single error type
//! - [`diagnostics`] - Coded diagnostics rendered with ariadne
//! - [`config`] - Compiler configuration
//! - [`span`] - Source locations

pub mod backend;
pub mod config;
pub mod diagnostics;
pub mod driver;
pub mod effects;
pub mod hir;
pub mod mir;
pub mod span;

pub use diagnostics::{Diagnostic, DiagnosticEmitter, DiagnosticKind, ErrorCode};
pub use driver::{compile, CompiledModule, LoweringError};
pub use span::Span;
