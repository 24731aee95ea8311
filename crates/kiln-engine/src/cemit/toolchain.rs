//! Driving the external C compiler, linker, and archiver.
//!
//! The generated source is piped into the compiler's stdin (`-x c -`); a
//! nonzero exit is reported verbatim with the captured stderr. Temporary
//! object files go under the system temp directory; the caller (or the OS)
//! cleans them up.

use std::io::Write;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::sync::atomic::{AtomicU64, Ordering};

use crate::error::{Error, Result};

/// Kind of artifact to produce.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputKind {
    /// Syntax-check only; no artifact.
    None,
    /// Linked executable.
    Binary,
    /// Static library.
    Static,
    /// Shared library.
    Shared,
    /// Archive (same artifact as a static library).
    Archive,
    /// Relocatable object file.
    Object,
}

impl OutputKind {
    /// Conventional file extension, appended when the output name lacks it.
    pub fn extension(self) -> Option<&'static str> {
        match self {
            OutputKind::Object => Some("o"),
            OutputKind::Shared => Some("so"),
            OutputKind::Static | OutputKind::Archive => Some("a"),
            OutputKind::Binary | OutputKind::None => None,
        }
    }
}

/// External toolchain configuration.
#[derive(Debug, Clone)]
pub struct ToolchainConfig {
    pub compiler: String,
    pub archiver: String,
    pub additional_flags: Vec<String>,
    /// Target triple forwarded to the compiler (`--target=`); `None`
    /// builds for the host.
    pub target: Option<String>,
}

impl Default for ToolchainConfig {
    fn default() -> Self {
        ToolchainConfig {
            compiler: std::env::var("CC").unwrap_or_else(|_| "cc".to_string()),
            archiver: std::env::var("AR").unwrap_or_else(|_| "ar".to_string()),
            additional_flags: Vec::new(),
            target: None,
        }
    }
}

static TEMP_COUNTER: AtomicU64 = AtomicU64::new(0);

fn temp_object_path() -> PathBuf {
    let n = TEMP_COUNTER.fetch_add(1, Ordering::Relaxed);
    std::env::temp_dir().join(format!("kiln-{}-{}.o", std::process::id(), n))
}

fn run_with_stdin(mut cmd: Command, input: &str) -> Result<()> {
    let program = cmd.get_program().to_string_lossy().into_owned();
    let mut child = cmd
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
        .map_err(|e| Error::Toolchain(format!("failed to spawn `{}`: {}", program, e)))?;

    child
        .stdin
        .take()
        .expect("piped stdin")
        .write_all(input.as_bytes())?;

    let output = child.wait_with_output()?;
    if !output.status.success() {
        return Err(Error::Toolchain(format!(
            "`{}` exited with {}: {}",
            program,
            output.status,
            String::from_utf8_lossy(&output.stderr).trim_end()
        )));
    }
    Ok(())
}

fn run(mut cmd: Command) -> Result<()> {
    let program = cmd.get_program().to_string_lossy().into_owned();
    let output = cmd
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .output()
        .map_err(|e| Error::Toolchain(format!("failed to spawn `{}`: {}", program, e)))?;
    if !output.status.success() {
        return Err(Error::Toolchain(format!(
            "`{}` exited with {}: {}",
            program,
            output.status,
            String::from_utf8_lossy(&output.stderr).trim_end()
        )));
    }
    Ok(())
}

fn compiler_command(config: &ToolchainConfig) -> Command {
    let mut cmd = Command::new(&config.compiler);
    cmd.args(["-x", "c", "-", "-std=c11", "-fPIC"]);
    if let Some(target) = &config.target {
        cmd.arg(format!("--target={}", target));
    }
    cmd.args(&config.additional_flags);
    cmd
}

/// Check whether `config.compiler` can be spawned at all.
pub fn probe(config: &ToolchainConfig) -> bool {
    Command::new(&config.compiler)
        .arg("--version")
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status()
        .map(|s| s.success())
        .unwrap_or(false)
}

/// Compile `source` into `out_file` of the requested kind.
pub fn build(
    source: &str,
    out_file: &Path,
    kind: OutputKind,
    config: &ToolchainConfig,
) -> Result<()> {
    let out_file = match kind.extension() {
        Some(ext) if out_file.extension().map_or(true, |e| e != ext) => {
            out_file.with_extension(ext)
        }
        _ => out_file.to_path_buf(),
    };

    match kind {
        OutputKind::None => {
            let mut cmd = compiler_command(config);
            cmd.arg("-fsyntax-only");
            run_with_stdin(cmd, source)
        }
        OutputKind::Object => {
            let mut cmd = compiler_command(config);
            cmd.arg("-c").arg("-o").arg(&out_file);
            run_with_stdin(cmd, source)
        }
        OutputKind::Shared => {
            let mut cmd = compiler_command(config);
            cmd.arg("-shared").arg("-o").arg(&out_file);
            run_with_stdin(cmd, source)
        }
        OutputKind::Binary => {
            let mut cmd = compiler_command(config);
            cmd.arg("-o").arg(&out_file);
            run_with_stdin(cmd, source)
        }
        OutputKind::Static | OutputKind::Archive => {
            let obj = temp_object_path();
            let mut cmd = compiler_command(config);
            cmd.arg("-c").arg("-o").arg(&obj);
            run_with_stdin(cmd, source)?;

            let mut ar = Command::new(&config.archiver);
            ar.arg("rcs").arg(&out_file).arg(&obj);
            let result = run(ar);
            let _ = std::fs::remove_file(&obj);
            result
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const OK_SOURCE: &str = "int kiln_tc_probe(int x) { return x + 1; }\n";

    #[test]
    fn test_syntax_check() {
        let config = ToolchainConfig::default();
        if !probe(&config) {
            return;
        }
        build(OK_SOURCE, Path::new("/dev/null"), OutputKind::None, &config).unwrap();
    }

    #[test]
    fn test_compiler_error_is_reported() {
        let config = ToolchainConfig::default();
        if !probe(&config) {
            return;
        }
        let err = build(
            "int broken(",
            Path::new("/dev/null"),
            OutputKind::None,
            &config,
        )
        .unwrap_err();
        assert!(matches!(err, Error::Toolchain(_)));
    }

    #[test]
    fn test_object_and_shared_output() {
        let config = ToolchainConfig::default();
        if !probe(&config) {
            return;
        }
        let dir = tempfile::tempdir().unwrap();
        let obj = dir.path().join("probe.o");
        build(OK_SOURCE, &obj, OutputKind::Object, &config).unwrap();
        assert!(obj.exists());

        let lib = dir.path().join("libprobe.so");
        build(OK_SOURCE, &lib, OutputKind::Shared, &config).unwrap();
        assert!(lib.exists());
    }
}
