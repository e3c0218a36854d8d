//! # Compilation Driver
//!
//! Runs the effect passes in order and hands the result to a backend:
//!
//! ```text
//! Program ─► analyze ─► EffectMetadata ─► lower_program ─► structural::emit ─► Module
//!                                    └──► Interpreter (reference backend)
//! ```
//!
//! Warnings travel with successful results; any error stops the pipeline at
//! the stage that reported it.

use std::cell::RefCell;
use std::rc::Rc;

use rill_runtime::{
    EffectTable, HandlerCall, HandlerError, HostRunner, Module, RunError, RunnerConfig, WireValue,
};
use thiserror::Error;
use tracing::{debug, info};

use crate::backend::{self, InterpError, Interpreter, Value};
use crate::config::{Backend, CompilerConfig, ConfigError};
use crate::diagnostics::{has_errors, Diagnostic};
use crate::effects::{self, EffectAnalysis};
use crate::hir::Program;
use crate::mir::{self, EffectMetadata, EffectSite, LoweredProgram};

/// Why a program could not be brought to an executable shape.
#[derive(Debug, Error)]
pub enum LoweringError {
    #[error("invalid configuration: {0}")]
    Config(#[from] ConfigError),
    #[error("effect checking failed with {} error(s)", count(.0))]
    Analysis(Vec<Diagnostic>),
    #[error("effect-site lowering failed with {} error(s)", count(.0))]
    Lowering(Vec<Diagnostic>),
    #[error("the structural backend rejected the program ({} error(s))", count(.0))]
    Emission(Vec<Diagnostic>),
}

fn count(diagnostics: &[Diagnostic]) -> usize {
    diagnostics.iter().filter(|d| d.is_error()).count()
}

impl LoweringError {
    /// Diagnostics behind the failure, warnings included.
    pub fn diagnostics(&self) -> &[Diagnostic] {
        match self {
            LoweringError::Config(_) => &[],
            LoweringError::Analysis(d) | LoweringError::Lowering(d) | LoweringError::Emission(d) => d,
        }
    }
}

/// A checked program.
#[derive(Debug)]
pub struct Checked {
    pub analysis: EffectAnalysis,
    pub metadata: EffectMetadata,
    pub warnings: Vec<Diagnostic>,
}

/// Output of a full structural compilation.
#[derive(Debug, Clone)]
pub struct CompiledModule {
    pub module: Module,
    pub table: EffectTable,
    pub metadata: EffectMetadata,
    /// Every effect site, in site-id order.
    pub sites: Vec<EffectSite>,
    pub warnings: Vec<Diagnostic>,
}

/// Check effect rows, handlers and continuation usage.
pub fn check(program: &Program, config: &CompilerConfig) -> Result<Checked, LoweringError> {
    config.validate()?;
    let analysis = effects::analyze(program, config);
    if has_errors(&analysis.diagnostics) {
        return Err(LoweringError::Analysis(analysis.diagnostics));
    }
    let metadata = EffectMetadata::build(program, &analysis);
    let warnings = analysis.diagnostics.clone();
    debug!(ops = metadata.op_count(), warnings = warnings.len(), "checked program");
    Ok(Checked {
        analysis,
        metadata,
        warnings,
    })
}

/// Check and lower a program without choosing a backend.
pub fn lower(program: &Program, config: &CompilerConfig) -> Result<(Checked, LoweredProgram), LoweringError> {
    let mut checked = check(program, config)?;
    let lowered = mir::lower_program(program, &checked.analysis, &checked.metadata);
    if lowered.has_errors() {
        return Err(LoweringError::Lowering(lowered.diagnostics));
    }
    checked.warnings.extend(lowered.diagnostics.iter().cloned());
    Ok((checked, lowered))
}

/// Compile a program to a target module with its effect table and glue.
pub fn compile(program: &Program, config: &CompilerConfig) -> Result<CompiledModule, LoweringError> {
    let (checked, lowered) = lower(program, config)?;
    let output = backend::emit(&lowered, &checked.analysis, &checked.metadata, config);
    if has_errors(&output.diagnostics) {
        return Err(LoweringError::Emission(output.diagnostics));
    }
    let mut warnings = checked.warnings;
    warnings.extend(output.diagnostics);
    info!(
        functions = output.module.functions.len(),
        sites = lowered.site_count(),
        ops = checked.metadata.op_count(),
        "compiled module"
    );
    Ok(CompiledModule {
        table: checked.metadata.to_table(),
        module: output.module,
        metadata: checked.metadata,
        sites: lowered.sites.sites,
        warnings,
    })
}

/// Why running a function failed.
#[derive(Debug, Error)]
pub enum ExecError {
    #[error(transparent)]
    Lowering(#[from] LoweringError),
    #[error(transparent)]
    Interp(#[from] InterpError),
    #[error(transparent)]
    Run(#[from] RunError),
    #[error("unknown function `{0}`")]
    UnknownFunction(String),
    #[error("`{0}` cannot cross the host boundary")]
    NotWire(String),
}

/// Run `function` on the backend `config` selects, answering every request
/// that reaches the host with `handler`.
pub fn execute<H>(
    program: &Program,
    config: &CompilerConfig,
    runner: &RunnerConfig,
    function: &str,
    args: &[WireValue],
    handler: H,
) -> Result<WireValue, ExecError>
where
    H: FnMut(&HandlerCall) -> Result<WireValue, HandlerError> + 'static,
{
    debug!(backend = %config.backend, function, "executing");
    match config.backend {
        Backend::Structural => execute_structural(program, config, runner, function, args, handler),
        Backend::Interp => execute_interp(program, config, runner, function, args, handler),
    }
}

fn execute_structural<H>(
    program: &Program,
    config: &CompilerConfig,
    runner: &RunnerConfig,
    function: &str,
    args: &[WireValue],
    handler: H,
) -> Result<WireValue, ExecError>
where
    H: FnMut(&HandlerCall) -> Result<WireValue, HandlerError> + 'static,
{
    let compiled = compile(program, config)?;
    let mut host = HostRunner::new(compiled.module, runner.clone())?;
    let shared = Rc::new(RefCell::new(handler));
    for ordinal in compiled.metadata.ordinals() {
        let handler = Rc::clone(&shared);
        host.register(ordinal.label.as_str(), move |call: &HandlerCall| {
            (handler.borrow_mut())(call)
        });
    }
    Ok(host.run(function, args)?)
}

fn execute_interp<H>(
    program: &Program,
    config: &CompilerConfig,
    runner: &RunnerConfig,
    function: &str,
    args: &[WireValue],
    mut handler: H,
) -> Result<WireValue, ExecError>
where
    H: FnMut(&HandlerCall) -> Result<WireValue, HandlerError>,
{
    let checked = check(program, config)?;
    let decl = program
        .function_by_name(function)
        .ok_or_else(|| ExecError::UnknownFunction(function.to_string()))?;
    let params = decl.param_types();
    if params.len() != args.len() {
        return Err(InterpError::Arity {
            name: function.to_string(),
            expected: params.len(),
            found: args.len(),
        }
        .into());
    }
    let values = args
        .iter()
        .zip(params)
        .map(|(arg, ty)| Value::from_wire(*arg, &ty))
        .collect();

    let metadata = &checked.metadata;
    let mut interp = Interpreter::new(program, &checked.analysis);
    let result = interp.run(function, values, runner.max_steps, |request| {
        let ordinal = metadata
            .ordinals()
            .iter()
            .find(|o| o.effect_id == request.effect_id && o.op_id == request.op_id)
            .ok_or_else(|| InterpError::Handler {
                label: request.label.clone(),
                message: "operation missing from the effect table".into(),
            })?;
        let mut wire_args = Vec::with_capacity(request.args.len());
        for arg in &request.args {
            wire_args.push(arg.to_wire().ok_or_else(|| InterpError::Handler {
                label: request.label.clone(),
                message: format!("a {} argument cannot cross the host boundary", arg.type_name()),
            })?);
        }
        let call = HandlerCall {
            label: ordinal.label.clone(),
            effect_name: ordinal.effect_name.clone(),
            effect_id: ordinal.effect_id,
            op_id: ordinal.op_id,
            op_index: ordinal.ordinal,
            resume_kind: ordinal.kind,
            signature_hash: ordinal.signature_hash,
            // Same numbering the host runner assigns.
            handle: ordinal.ordinal + 1,
            args: wire_args,
        };
        let answer = handler(&call).map_err(|e| InterpError::Handler {
            label: request.label.clone(),
            message: e.0,
        })?;
        Ok(Value::from_wire(answer, &ordinal.ret))
    })?;
    result.to_wire().ok_or_else(|| ExecError::NotWire(function.to_string()))
}

#[cfg(test)]
mod tests {
    use rill_runtime::ResumeKind;

    use super::*;
    use crate::diagnostics::ErrorCode;
    use crate::hir::{FnBuilder, OpRef, ProgramBuilder, Type};

    fn counter_program(declared: Option<&[&str]>) -> Program {
        let mut b = ProgramBuilder::new();
        let log = b.effect(
            "Log",
            vec![ProgramBuilder::op("emit", vec![Type::I32], Type::Unit, ResumeKind::Tail)],
        );
        let emit = OpRef::new(log, 0);
        let f = b.function("f", &[("x", Type::I32)], Type::I32, |f| {
            let x = f.var(f.param(0));
            let logged = f.perform(emit, vec![x]);
            let x = f.var(f.param(0));
            let one = f.i32(1);
            let sum = f.add(x, one);
            f.block(vec![FnBuilder::stmt(logged)], Some(sum))
        });
        b.export(f);
        if let Some(ops) = declared {
            b.declare_effects(f, ops, false);
        }
        b.finish()
    }

    #[test]
    fn test_compile_collects_table_and_sites() {
        let compiled = compile(&counter_program(None), &CompilerConfig::default()).unwrap();
        assert_eq!(compiled.table.len(), 1);
        assert_eq!(compiled.table.entries()[0].label, "Log.emit");
        assert_eq!(compiled.sites.len(), 1);
        assert!(compiled.module.find_export("f_effectful").is_some());
    }

    #[test]
    fn test_undeclared_effect_stops_at_analysis() {
        let err = compile(&counter_program(Some(&[])), &CompilerConfig::default()).unwrap_err();
        assert!(matches!(err, LoweringError::Analysis(_)), "{err}");
        assert!(err
            .diagnostics()
            .iter()
            .any(|d| d.code == Some(ErrorCode::UndeclaredEffects)));
    }

    #[test]
    fn test_invalid_config_is_rejected() {
        let config = CompilerConfig {
            buffer_size: 16,
            ..CompilerConfig::default()
        };
        let err = check(&counter_program(None), &config).unwrap_err();
        assert!(matches!(err, LoweringError::Config(_)));
    }

    #[test]
    fn test_both_backends_answer_through_the_handler() {
        for backend in [Backend::Interp, Backend::Structural] {
            let config = CompilerConfig {
                backend,
                ..CompilerConfig::default()
            };
            let seen = Rc::new(RefCell::new(Vec::new()));
            let log = Rc::clone(&seen);
            let result = execute(
                &counter_program(Some(&["Log.emit"])),
                &config,
                &RunnerConfig::default(),
                "f",
                &[WireValue::I32(6)],
                move |call| {
                    log.borrow_mut().push(call.args.clone());
                    Ok(WireValue::None)
                },
            )
            .unwrap();
            assert_eq!(result, WireValue::I32(7), "{backend}");
            assert_eq!(*seen.borrow(), vec![vec![WireValue::I32(6)]], "{backend}");
        }
    }
}
