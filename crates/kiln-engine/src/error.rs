//! Error and diagnostic types shared across the engine.
//!
//! Every fallible operation returns a [`Result`]; the pipeline additionally
//! records failures on the state's diagnostic chain so a driver can render
//! them after the fact (see `pipeline::State::diagnostics`).

use thiserror::Error;

use crate::atom::Atom;

/// Source location of a diagnostic, when one is known.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SourceLoc {
    pub file: Atom,
    pub line: u32,
    pub col: u32,
    pub len: u32,
}

/// One recorded failure; kept on the state in emission order.
#[derive(Debug, Clone)]
pub struct Diagnostic {
    pub message: String,
    pub loc: Option<SourceLoc>,
}

/// Engine error. Variants follow the failure domains of the backend.
#[derive(Debug, Error)]
pub enum Error {
    /// Malformed textual IR or AST input.
    #[error("parse error: {message}")]
    Parse {
        message: String,
        loc: Option<SourceLoc>,
    },

    /// Operand or signature types do not line up.
    #[error("type error: {0}")]
    Type(String),

    /// Duplicate or unresolvable symbols during linking or loading.
    #[error("link error: {0}")]
    Link(String),

    /// The external C compiler or linker failed.
    #[error("toolchain error: {0}")]
    Toolchain(String),

    /// The interpreter hit a condition it cannot continue from.
    #[error("runtime error: {0}")]
    Runtime(String),

    /// The native call layer rejected a signature or call.
    #[error("ffi error: {0}")]
    Ffi(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    /// Valid input asking for something this build does not provide.
    #[error("unsupported: {0}")]
    Unsupported(String),
}

impl Error {
    pub fn parse(message: impl Into<String>, loc: Option<SourceLoc>) -> Error {
        Error::Parse {
            message: message.into(),
            loc,
        }
    }

    /// Flatten into a diagnostic for the state's chain.
    pub fn to_diagnostic(&self) -> Diagnostic {
        let loc = match self {
            Error::Parse { loc, .. } => *loc,
            _ => None,
        };
        Diagnostic {
            message: self.to_string(),
            loc,
        }
    }
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
