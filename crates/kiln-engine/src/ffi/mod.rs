//! The FFI adapter: native calls out of bytecode and closures back in.
//!
//! Signatures are derived from IR procedure types and cached; the call and
//! closure layers implement the System V AMD64 convention in process (see
//! the module docs of [`call`] and [`closure`] for the envelope).

pub mod call;
pub mod closure;
pub mod loader;
pub mod sig;

pub use closure::ClosureHandle;
pub use loader::Library;
pub use sig::{build_sig, CallSig, SigCache};
