//! Rill Compiler CLI
//!
//! Drives the effect subsystem over a typed program graph stored as JSON.
//!
//! # Usage
//!
//! ```text
//! rillc [OPTIONS] <COMMAND>
//!
//! Commands:
//!   check  Check effect rows, handlers and continuation usage
//!   emit   Compile to a target module and print it as JSON
//!   table  Print the effect table of a program
//!   run    Run one function on the configured backend
//!
//! Options:
//!   -v, --verbose  Increase verbosity (can be repeated)
//!   -q, --quiet    Suppress non-error output
//!   --color <WHEN> Control color output [default: auto]
//! ```
//!
//! Logging is controlled by `RILL_LOG` (an `EnvFilter` directive) and falls
//! back to `RILL_LOG_LEVEL`.

use std::fs;
use std::path::{Path, PathBuf};
use std::process::ExitCode;

use anyhow::{anyhow, bail, Context, Result};
use clap::{Args, Parser, Subcommand, ValueEnum};
use rustc_hash::FxHashMap;
use tracing::debug;
use tracing_subscriber::EnvFilter;

use rill_runtime::{HandlerError, RunnerConfig, WireValue};
use rillc::config::{Backend, CompilerConfig};
use rillc::diagnostics::{Diagnostic, DiagnosticEmitter};
use rillc::driver::{self, LoweringError};
use rillc::hir::Program;

/// The Rill compiler's effect subsystem
#[derive(Parser)]
#[command(name = "rillc")]
#[command(author = "Rill Language Team")]
#[command(version)]
#[command(about = "Effect checking and continuation lowering for Rill programs", long_about = None)]
#[command(propagate_version = true)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Increase verbosity (can be repeated: -v, -vv)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    /// Suppress non-error output
    #[arg(short, long, global = true, conflicts_with = "verbose")]
    quiet: bool,

    /// Control when to use colored output
    #[arg(long, value_enum, default_value_t = ColorChoice::Auto, global = true)]
    color: ColorChoice,
}

#[derive(Subcommand)]
enum Commands {
    /// Check effect rows, handlers and continuation usage
    ///
    /// Prints every function's inferred row and any diagnostics.
    Check(FileArgs),

    /// Compile to a target module and print it as JSON
    Emit {
        #[command(flatten)]
        file: FileArgs,

        /// Write the module here instead of stdout
        #[arg(short, long, value_name = "PATH")]
        output: Option<PathBuf>,
    },

    /// Print the effect table of a program
    Table {
        #[command(flatten)]
        file: FileArgs,

        /// Print the table as JSON
        #[arg(long)]
        json: bool,
    },

    /// Run one function on the configured backend
    ///
    /// Host requests are answered with the constants given by `--answer`.
    Run {
        #[command(flatten)]
        file: FileArgs,

        /// Function to call
        #[arg(short, long, default_value = "main")]
        function: String,

        /// Arguments, as `i32:4`, `i64:-1`, `f32:0.5`, `f64:2`, or `none`
        #[arg(long = "arg", value_name = "VALUE")]
        args: Vec<String>,

        /// Answer an operation with a constant, as `Effect.op=i32:8`
        #[arg(long = "answer", value_name = "LABEL=VALUE")]
        answers: Vec<String>,

        /// Backend to run on (overrides RILL_BACKEND)
        #[arg(long, value_enum)]
        backend: Option<BackendChoice>,
    },
}

#[derive(Args)]
struct FileArgs {
    /// Typed program graph (JSON)
    #[arg(value_name = "FILE")]
    file: PathBuf,

    /// Source text the program's spans point into, for diagnostics
    #[arg(long, value_name = "PATH")]
    source: Option<PathBuf>,
}

/// When to use colored output
#[derive(Copy, Clone, PartialEq, Eq, ValueEnum)]
enum ColorChoice {
    /// Automatically detect if terminal supports colors
    Auto,
    /// Always use colors
    Always,
    /// Never use colors
    Never,
}

impl ColorChoice {
    fn apply(self) {
        match self {
            ColorChoice::Auto => {}
            ColorChoice::Always => std::env::set_var("CLICOLOR_FORCE", "1"),
            ColorChoice::Never => std::env::set_var("NO_COLOR", "1"),
        }
    }
}

#[derive(Copy, Clone, PartialEq, Eq, ValueEnum)]
enum BackendChoice {
    Interp,
    Structural,
}

impl From<BackendChoice> for Backend {
    fn from(choice: BackendChoice) -> Self {
        match choice {
            BackendChoice::Interp => Backend::Interp,
            BackendChoice::Structural => Backend::Structural,
        }
    }
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    cli.color.apply();

    let config = CompilerConfig::from_env();
    let level = match (cli.quiet, cli.verbose) {
        (true, _) => "error",
        (false, 0) => config.log_level.as_str(),
        (false, 1) => "debug",
        (false, _) => "trace",
    };
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(EnvFilter::try_from_env("RILL_LOG").unwrap_or_else(|_| EnvFilter::new(level)))
        .init();

    let result = match cli.command {
        Commands::Check(file) => cmd_check(&file, &config, cli.quiet),
        Commands::Emit { file, output } => cmd_emit(&file, &config, output.as_deref()),
        Commands::Table { file, json } => cmd_table(&file, &config, json),
        Commands::Run {
            file,
            function,
            args,
            answers,
            backend,
        } => {
            let mut config = config;
            if let Some(backend) = backend {
                config.backend = backend.into();
            }
            cmd_run(&file, &config, &function, &args, &answers)
        }
    };

    match result {
        Ok(code) => code,
        Err(err) => {
            eprintln!("error: {err:#}");
            ExitCode::from(2)
        }
    }
}

/// A program graph together with the text its spans refer to.
struct Input {
    program: Program,
    name: String,
    source: String,
}

impl Input {
    fn load(args: &FileArgs) -> Result<Self> {
        let json = fs::read_to_string(&args.file)
            .with_context(|| format!("failed to read {}", args.file.display()))?;
        let program: Program = serde_json::from_str(&json)
            .with_context(|| format!("{} is not a program graph", args.file.display()))?;
        let (name, source) = match &args.source {
            Some(path) => (
                path.display().to_string(),
                fs::read_to_string(path).with_context(|| format!("failed to read {}", path.display()))?,
            ),
            None => (args.file.display().to_string(), String::new()),
        };
        debug!(
            effects = program.effects.len(),
            functions = program.functions.len(),
            "loaded program"
        );
        Ok(Self { program, name, source })
    }

    fn report(&self, diagnostics: &[Diagnostic]) -> Result<()> {
        let emitter = DiagnosticEmitter::new(&self.name, &self.source);
        for diagnostic in diagnostics {
            emitter.emit(diagnostic)?;
        }
        Ok(())
    }

    /// Report a failed pipeline; configuration errors are plain errors.
    fn fail(&self, err: LoweringError) -> Result<ExitCode> {
        if let LoweringError::Config(_) = err {
            return Err(err.into());
        }
        self.report(err.diagnostics())?;
        eprintln!("{err}");
        Ok(ExitCode::from(1))
    }
}

fn cmd_check(args: &FileArgs, config: &CompilerConfig, quiet: bool) -> Result<ExitCode> {
    let input = Input::load(args)?;
    let checked = match driver::check(&input.program, config) {
        Ok(checked) => checked,
        Err(err) => return input.fail(err),
    };
    input.report(&checked.warnings)?;
    if quiet {
        return Ok(ExitCode::SUCCESS);
    }
    for summary in checked.metadata.functions() {
        let mut ops: Vec<&str> = summary.raises.iter().map(|r| r.label.as_str()).collect();
        if summary.open {
            ops.push("..");
        }
        let row = if summary.pure { "pure".to_string() } else { format!("{{{}}}", ops.join(", ")) };
        let exported = if summary.exported { " (exported)" } else { "" };
        println!("fn {}: {row}{exported}", summary.name);
    }
    Ok(ExitCode::SUCCESS)
}

fn cmd_emit(args: &FileArgs, config: &CompilerConfig, output: Option<&Path>) -> Result<ExitCode> {
    let input = Input::load(args)?;
    let compiled = match driver::compile(&input.program, config) {
        Ok(compiled) => compiled,
        Err(err) => return input.fail(err),
    };
    input.report(&compiled.warnings)?;
    let json = serde_json::to_string_pretty(&compiled.module)?;
    match output {
        Some(path) => fs::write(path, json).with_context(|| format!("failed to write {}", path.display()))?,
        None => println!("{json}"),
    }
    Ok(ExitCode::SUCCESS)
}

fn cmd_table(args: &FileArgs, config: &CompilerConfig, json: bool) -> Result<ExitCode> {
    let input = Input::load(args)?;
    let checked = match driver::check(&input.program, config) {
        Ok(checked) => checked,
        Err(err) => return input.fail(err),
    };
    if json {
        println!("{}", serde_json::to_string_pretty(&checked.metadata.to_table())?);
        return Ok(ExitCode::SUCCESS);
    }
    println!("{:>3}  {:<24} {:<16} {:>4} {:<6} {:<8}  signature", "#", "label", "effect id", "op", "kind", "sig");
    for ordinal in checked.metadata.ordinals() {
        println!(
            "{:>3}  {:<24} {:016x} {:>4} {:<6} {:08x}  {}",
            ordinal.ordinal,
            ordinal.label,
            ordinal.effect_id,
            ordinal.op_id,
            ordinal.kind.to_string(),
            ordinal.signature_hash,
            ordinal.signature
        );
    }
    Ok(ExitCode::SUCCESS)
}

fn cmd_run(
    args: &FileArgs,
    config: &CompilerConfig,
    function: &str,
    raw_args: &[String],
    raw_answers: &[String],
) -> Result<ExitCode> {
    let input = Input::load(args)?;
    let values = raw_args.iter().map(|a| parse_wire(a)).collect::<Result<Vec<_>>>()?;
    let mut answers = FxHashMap::default();
    for raw in raw_answers {
        let (label, value) = raw
            .split_once('=')
            .ok_or_else(|| anyhow!("answer `{raw}` is not of the form Effect.op=VALUE"))?;
        answers.insert(label.to_string(), parse_wire(value)?);
    }

    let runner = RunnerConfig::from_env();
    let result = driver::execute(&input.program, config, &runner, function, &values, move |call| {
        answers
            .get(&call.label)
            .copied()
            .ok_or_else(|| HandlerError(format!("no answer given for `{}`", call.label)))
    });
    match result {
        Ok(value) => {
            println!("{}", format_wire(value));
            Ok(ExitCode::SUCCESS)
        }
        Err(driver::ExecError::Lowering(err)) => input.fail(err),
        Err(err) => {
            eprintln!("error: {err}");
            Ok(ExitCode::from(1))
        }
    }
}

fn parse_wire(text: &str) -> Result<WireValue> {
    if text == "none" {
        return Ok(WireValue::None);
    }
    let Some((tag, value)) = text.split_once(':') else {
        bail!("value `{text}` has no type prefix");
    };
    let parsed = match tag {
        "i32" => WireValue::I32(value.parse().with_context(|| format!("bad i32 `{value}`"))?),
        "i64" => WireValue::I64(value.parse().with_context(|| format!("bad i64 `{value}`"))?),
        "f32" => WireValue::F32(value.parse().with_context(|| format!("bad f32 `{value}`"))?),
        "f64" => WireValue::F64(value.parse().with_context(|| format!("bad f64 `{value}`"))?),
        other => bail!("unknown value type `{other}`"),
    };
    Ok(parsed)
}

fn format_wire(value: WireValue) -> String {
    match value {
        WireValue::None => "none".to_string(),
        WireValue::I32(n) => format!("i32:{n}"),
        WireValue::I64(n) => format!("i64:{n}"),
        WireValue::F32(x) => format!("f32:{x}"),
        WireValue::F64(x) => format!("f64:{x}"),
    }
}
