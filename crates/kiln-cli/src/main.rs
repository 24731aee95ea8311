//! Kiln command-line driver
//!
//! Compiles one source file into a module and runs its `main` procedure in
//! the bytecode interpreter. Exit code 0 means the program compiled and
//! returned zero; any failure (parse, compile, link, nonzero return)
//! exits 1.

mod output;

use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::{bail, Result};
use clap::Parser;
use kiln_engine::{Atom, Compiler, Module, State};

use output::{LogLevel, Output};

#[derive(Parser)]
#[command(name = "kiln")]
#[command(about = "Kiln compiler backend driver")]
// The version flag is declared manually below so it answers to `-v`
// rather than clap's default `-V`.
#[command(version, disable_version_flag = true)]
struct Cli {
    /// Input file (.nkir, .nkst, .nkl)
    file: PathBuf,

    /// Choose when to color output
    #[arg(short, long, default_value = "auto", value_parser = ["auto", "always", "never"])]
    color: String,

    /// Select logging level
    #[arg(
        short = 't',
        long,
        default_value = "error",
        value_parser = ["none", "error", "warning", "info", "debug", "trace"]
    )]
    loglevel: String,

    /// Show version information
    #[arg(short = 'v', long = "version", action = clap::ArgAction::Version)]
    version: Option<bool>,
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    let level = std::env::var("NK_LOG_LEVEL")
        .ok()
        .and_then(|v| LogLevel::parse(&v))
        .or_else(|| LogLevel::parse(&cli.loglevel))
        .unwrap_or(LogLevel::Error);
    let mut out = Output::new(output::resolve_color_choice(&cli.color), level);

    match run(&cli, &mut out) {
        Ok(code) => code,
        Err(err) => {
            out.error(&format!("{:#}", err));
            ExitCode::FAILURE
        }
    }
}

fn report_diagnostics(state: &State, out: &mut Output) {
    for diag in state.diagnostics() {
        out.diagnostic(&diag);
    }
}

fn run(cli: &Cli, out: &mut Output) -> Result<ExitCode> {
    let state = State::new();
    let compiler = Compiler::host(&state);
    compiler.add_library_alias("c", default_libc());

    let mut module = Module::new(&compiler);
    out.info(&format!("compiling `{}`", cli.file.display()));
    if module.compile_file(&cli.file).is_err() {
        report_diagnostics(&state, out);
        bail!("failed to compile `{}`", cli.file.display());
    }

    if out.debug_enabled() {
        out.debug("module after compilation:");
        eprintln!("{}", module.to_text());
    }

    let main_sym = Atom::intern("main");
    let Some(sym) = module.find_symbol(main_sym) else {
        bail!("no `main` procedure in module");
    };
    let Some(proc) = sym.as_proc() else {
        bail!("`main` is not a procedure");
    };
    if !proc.params.is_empty() {
        bail!("`main` must take no parameters");
    }

    out.info("running `main`");
    let mut ret: i64 = 0;
    let retv = if proc.ret.ty.size > 0 {
        &mut ret as *mut i64 as *mut std::ffi::c_void
    } else {
        std::ptr::null_mut()
    };
    if module.invoke(main_sym, &[], retv).is_err() {
        report_diagnostics(&state, out);
        bail!("`main` failed");
    }

    if ret != 0 {
        out.warning(&format!("`main` returned {}", ret));
        return Ok(ExitCode::FAILURE);
    }
    Ok(ExitCode::SUCCESS)
}

fn default_libc() -> &'static str {
    if cfg!(target_os = "macos") {
        "libSystem.B.dylib"
    } else {
        "libc.so.6"
    }
}
