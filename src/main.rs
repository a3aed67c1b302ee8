//! CLI entry point: `talon path/to/script.tlk [flags]`.
//!
//! Layers configuration the way `axiom/src/main.rs` does (defaults < config
//! file < environment < explicit flags), installs the `tracing` subscriber,
//! then parses/compiles/runs the script file before optionally dispatching
//! to a `main` method on the global context.

use std::path::PathBuf;
use std::process::ExitCode;

use clap::{Parser, ValueEnum};

use talon::config::{Config, LogFormat};
use talon::diagnostics;
use talon::errors::TalonError;
use talon::interpreter::Interpreter;
use talon::script_host::{self, ScriptError};

#[derive(Copy, Clone, Debug, ValueEnum)]
enum LogFormatArg {
    Pretty,
    Json,
}

impl From<LogFormatArg> for LogFormat {
    fn from(v: LogFormatArg) -> LogFormat {
        match v {
            LogFormatArg::Pretty => LogFormat::Pretty,
            LogFormatArg::Json => LogFormat::Json,
        }
    }
}

#[derive(Parser, Debug)]
#[command(name = "talon", about = "Run a Smalltalk-family script file")]
struct Cli {
    /// Script file to parse, compile, and run.
    path: PathBuf,
    #[arg(long)]
    heap_mb: Option<usize>,
    #[arg(long)]
    trace_gc: bool,
    #[arg(long)]
    trace_send: bool,
    #[arg(long, value_enum)]
    log_format: Option<LogFormatArg>,
}

fn script_error_to_talon(err: ScriptError) -> TalonError {
    match err {
        ScriptError::Parse(e) => TalonError::Parse(e),
        ScriptError::Compile(e) => TalonError::Compile(e),
        ScriptError::Interp(e) => TalonError::Interp(e),
        ScriptError::UnknownSuperclass(name) => TalonError::Config(format!("unknown superclass {name:?}")),
        ScriptError::UnknownClass(name) => TalonError::Config(format!("unknown class {name:?}")),
    }
}

fn run() -> Result<(), TalonError> {
    let cli = Cli::parse();

    let mut config = Config::default();
    if let Some(path) = Config::default_config_path() {
        config = config.merge_file(&path);
    }
    config = config.merge_env();
    if let Some(mb) = cli.heap_mb {
        config.heap_words = mb * 1024 * 1024 / 8;
    }
    if cli.trace_gc {
        config.trace_gc = true;
    }
    if cli.trace_send {
        config.trace_send = true;
    }
    if let Some(fmt) = cli.log_format {
        config.log_format = fmt.into();
    }

    diagnostics::install_subscriber(config.log_format);

    let source = std::fs::read_to_string(&cli.path)?;
    let mut interp = Interpreter::new(&config);
    script_host::run_source(&mut interp, &source).map_err(script_error_to_talon)?;
    let global = interp.global_context();
    interp.send_main_if_present(global)?;
    Ok(())
}

fn main() -> ExitCode {
    match run() {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("talon: {e}");
            ExitCode::from(255)
        }
    }
}
