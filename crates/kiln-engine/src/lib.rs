//! Kiln compiler backend
//!
//! This crate is a retargetable backend sitting between a language
//! frontend and executable code:
//! - **IR**: typed, structured program representation (`ir` module)
//! - **Bytecode**: dense lowering plus interpreter for in-process
//!   execution (`bc`, `interp` modules)
//! - **FFI**: native calls out of bytecode and closures back in (`ffi`)
//! - **C backend**: portable C11 emission and toolchain driving (`cemit`)
//! - **Pipeline**: state/compiler/module lifecycle (`pipeline`)
//!
//! # Example
//!
//! ```rust,ignore
//! use kiln_engine::{Atom, Compiler, Module, State};
//!
//! let state = State::new();
//! let compiler = Compiler::host(&state);
//! let mut module = Module::new(&compiler);
//!
//! module.compile_string_ir(r#"
//! pub proc plus(:i64 %a, :i64 %b) :i64 {
//!     add :i64 %a, :i64 %b -> :i64 ret
//!     ret
//! }
//! "#)?;
//!
//! let mut a = 4i64;
//! let mut b = 5i64;
//! let mut result = 0i64;
//! module.invoke(
//!     Atom::intern("plus"),
//!     &[&mut a as *mut _ as *mut _, &mut b as *mut _ as *mut _],
//!     &mut result as *mut _ as *mut _,
//! )?;
//! assert_eq!(result, 9);
//! ```

// ============================================================================
// Core Modules
// ============================================================================

/// Region allocators (arena, interpreter frame stack)
pub mod mem;

/// Process-global string interning
pub mod atom;

/// Value-type descriptors and the structural type store
pub mod types;

/// Error and diagnostic types
pub mod error;

/// The IR model: refs, instructions, symbols, inspection
pub mod ir;

/// Textual input formats (`.nkir`, `.nkst`)
pub mod text;

/// Bytecode lowering and run context
pub mod bc;

/// The bytecode interpreter
pub mod interp;

/// The FFI adapter: signatures, native calls, closures, library loading
pub mod ffi;

/// The C backend and toolchain driver
pub mod cemit;

/// State/compiler/module lifecycle
pub mod pipeline;

// ============================================================================
// Re-exports
// ============================================================================

pub use atom::Atom;
pub use cemit::toolchain::OutputKind;
pub use error::{Diagnostic, Error, Result, SourceLoc};
pub use pipeline::{Compiler, Module, State, Triple};
pub use types::{NumericType, TypeRef, TypeStore};
