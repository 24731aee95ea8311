//! Diagnostic rendering and leveled logging for the driver.
//!
//! Uses `termcolor` for cross-platform colored output; the color policy
//! comes from `--color` and the log level from `--loglevel`, overridden by
//! the `NK_LOG_LEVEL` environment variable.

use std::io::Write;

use kiln_engine::Diagnostic;
use termcolor::{Color, ColorChoice, ColorSpec, StandardStream, WriteColor};

/// Log verbosity, most quiet first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum LogLevel {
    None,
    Fatal,
    Error,
    Warning,
    Info,
    Debug,
    Trace,
}

impl LogLevel {
    pub fn parse(s: &str) -> Option<LogLevel> {
        Some(match s {
            "none" => LogLevel::None,
            "fatal" => LogLevel::Fatal,
            "error" => LogLevel::Error,
            "warning" => LogLevel::Warning,
            "info" => LogLevel::Info,
            "debug" => LogLevel::Debug,
            "trace" => LogLevel::Trace,
            _ => return None,
        })
    }
}

/// Resolve the color choice from the `--color` flag value.
pub fn resolve_color_choice(flag: &str) -> ColorChoice {
    if std::env::var_os("NO_COLOR").is_some() {
        return ColorChoice::Never;
    }
    match flag {
        "always" => ColorChoice::Always,
        "never" => ColorChoice::Never,
        _ => {
            use std::io::IsTerminal;
            if std::io::stderr().is_terminal() {
                ColorChoice::Auto
            } else {
                ColorChoice::Never
            }
        }
    }
}

/// Stderr diagnostics writer.
pub struct Output {
    stderr: StandardStream,
    level: LogLevel,
}

impl Output {
    pub fn new(choice: ColorChoice, level: LogLevel) -> Output {
        Output {
            stderr: StandardStream::stderr(choice),
            level,
        }
    }

    fn tagged(&mut self, color: Color, tag: &str, message: &str) {
        let mut spec = ColorSpec::new();
        spec.set_fg(Some(color)).set_bold(true);
        let _ = self.stderr.set_color(&spec);
        let _ = write!(self.stderr, "{}:", tag);
        let _ = self.stderr.reset();
        let _ = writeln!(self.stderr, " {}", message);
    }

    pub fn error(&mut self, message: &str) {
        if self.level >= LogLevel::Error {
            self.tagged(Color::Red, "error", message);
        }
    }

    pub fn warning(&mut self, message: &str) {
        if self.level >= LogLevel::Warning {
            self.tagged(Color::Yellow, "warning", message);
        }
    }

    pub fn info(&mut self, message: &str) {
        if self.level >= LogLevel::Info {
            self.tagged(Color::Cyan, "info", message);
        }
    }

    pub fn debug(&mut self, message: &str) {
        if self.level >= LogLevel::Debug {
            self.tagged(Color::Magenta, "debug", message);
        }
    }

    pub fn debug_enabled(&self) -> bool {
        self.level >= LogLevel::Debug
    }

    /// Render one recorded diagnostic, with its source location when known.
    pub fn diagnostic(&mut self, diag: &Diagnostic) {
        match diag.loc {
            Some(loc) => {
                let mut spec = ColorSpec::new();
                spec.set_bold(true);
                let _ = self.stderr.set_color(&spec);
                let _ = write!(
                    self.stderr,
                    "{}:{}:{}:",
                    loc.file.as_str(),
                    loc.line,
                    loc.col
                );
                let _ = self.stderr.reset();
                let _ = write!(self.stderr, " ");
                self.tagged(Color::Red, "error", &diag.message);
            }
            None => self.error(&diag.message),
        }
    }
}
