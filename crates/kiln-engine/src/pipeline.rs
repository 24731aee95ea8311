//! Top-level orchestration: state, compiler, and module lifecycle.
//!
//! One [`State`] per program holds the shared type store and the
//! diagnostic chain. A [`Compiler`] pins a target triple and the library
//! alias map; a [`Module`] accumulates symbols, compiles source files,
//! exports native artifacts through the C backend, and executes in process
//! through the bytecode backend.
//!
//! Every fallible module operation also records its error on the state's
//! diagnostic chain, so a driver can render everything at once with
//! [`State::diagnostics`].

use std::ffi::c_void;
use std::fmt::Write as _;
use std::path::Path;
use std::sync::Arc;

use parking_lot::Mutex;
use rustc_hash::{FxHashMap, FxHashSet};

use crate::atom::Atom;
use crate::bc::{RunCtx, SymbolResolver};
use crate::cemit::toolchain::{self, OutputKind, ToolchainConfig};
use crate::error::{Diagnostic, Error, Result};
use crate::ir::{self, Symbol};
use crate::text;
use crate::types::TypeStore;

/// Process-wide root: type store plus the diagnostic chain.
pub struct State {
    pub types: Arc<TypeStore>,
    diagnostics: Mutex<Vec<Diagnostic>>,
}

impl State {
    pub fn new() -> Arc<State> {
        Arc::new(State {
            types: Arc::new(TypeStore::new()),
            diagnostics: Mutex::new(Vec::new()),
        })
    }

    /// All diagnostics recorded so far, oldest first.
    pub fn diagnostics(&self) -> Vec<Diagnostic> {
        self.diagnostics.lock().clone()
    }

    pub(crate) fn record<T>(&self, result: Result<T>) -> Result<T> {
        if let Err(err) = &result {
            self.diagnostics.lock().push(err.to_diagnostic());
        }
        result
    }
}

/// A target triple: `arch-vendor-sys[-abi]`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Triple {
    pub arch: String,
    pub vendor: String,
    pub sys: String,
    pub abi: Option<String>,
}

impl Triple {
    pub fn parse(s: &str) -> Result<Triple> {
        let parts: Vec<&str> = s.split('-').collect();
        if parts.len() < 3 || parts.len() > 4 || parts.iter().any(|p| p.is_empty()) {
            return Err(Error::Unsupported(format!(
                "malformed target triple `{}` (expected arch-vendor-sys[-abi])",
                s
            )));
        }
        Ok(Triple {
            arch: parts[0].to_string(),
            vendor: parts[1].to_string(),
            sys: parts[2].to_string(),
            abi: parts.get(3).map(|p| p.to_string()),
        })
    }

    /// The triple of the machine this process runs on.
    pub fn host() -> Triple {
        let arch = std::env::consts::ARCH.to_string();
        match std::env::consts::OS {
            "macos" => Triple {
                arch,
                vendor: "apple".to_string(),
                sys: "darwin".to_string(),
                abi: None,
            },
            "windows" => Triple {
                arch,
                vendor: "pc".to_string(),
                sys: "windows".to_string(),
                abi: Some("msvc".to_string()),
            },
            _ => Triple {
                arch,
                vendor: "unknown".to_string(),
                sys: std::env::consts::OS.to_string(),
                abi: Some("gnu".to_string()),
            },
        }
    }
}

impl std::fmt::Display for Triple {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}-{}-{}", self.arch, self.vendor, self.sys)?;
        if let Some(abi) = &self.abi {
            write!(f, "-{}", abi)?;
        }
        Ok(())
    }
}

/// Bundles a target with the library alias map used for extern lookup.
pub struct Compiler {
    state: Arc<State>,
    triple: Triple,
    lib_aliases: Arc<Mutex<FxHashMap<Atom, String>>>,
    toolchain: ToolchainConfig,
}

impl Compiler {
    /// Create a compiler for an explicit target triple.
    pub fn new(state: &Arc<State>, triple: &str) -> Result<Arc<Compiler>> {
        let parsed = state.record(Triple::parse(triple))?;
        let mut toolchain = ToolchainConfig::default();
        if parsed != Triple::host() {
            toolchain.target = Some(parsed.to_string());
        }
        Ok(Arc::new(Compiler {
            state: state.clone(),
            triple: parsed,
            lib_aliases: Arc::new(Mutex::new(FxHashMap::default())),
            toolchain,
        }))
    }

    /// Create a compiler for the host machine.
    pub fn host(state: &Arc<State>) -> Arc<Compiler> {
        Arc::new(Compiler {
            state: state.clone(),
            triple: Triple::host(),
            lib_aliases: Arc::new(Mutex::new(FxHashMap::default())),
            toolchain: ToolchainConfig::default(),
        })
    }

    pub fn triple(&self) -> &Triple {
        &self.triple
    }

    /// Register a library alias, e.g. `"c"` → `"libc.so.6"`.
    pub fn add_library_alias(&self, alias: &str, lib: &str) {
        self.lib_aliases
            .lock()
            .insert(Atom::intern(alias), lib.to_string());
    }

    pub fn state(&self) -> &Arc<State> {
        &self.state
    }
}

/// An ordered collection of symbols that compile and link together.
pub struct Module {
    state: Arc<State>,
    compiler: Arc<Compiler>,
    symbols: Vec<Symbol>,
    run: Arc<RunCtx>,
}

impl Module {
    pub fn new(compiler: &Arc<Compiler>) -> Module {
        Module {
            state: compiler.state.clone(),
            compiler: compiler.clone(),
            symbols: Vec::new(),
            run: RunCtx::new(
                compiler.state.types.clone(),
                compiler.lib_aliases.clone(),
            ),
        }
    }

    // ===== Construction =====

    /// Append a symbol. Name uniqueness is checked by [`Module::validate`]
    /// and at link time.
    pub fn define_symbol(&mut self, sym: Symbol) {
        self.symbols.push(sym);
    }

    pub fn symbols(&self) -> &[Symbol] {
        &self.symbols
    }

    pub fn find_symbol(&self, name: Atom) -> Option<&Symbol> {
        ir::find_symbol(&self.symbols, name)
    }

    /// Check symbol-name uniqueness and jump-target sanity.
    pub fn validate(&self) -> Result<()> {
        self.state.record(ir::validate_symbols(&self.symbols))
    }

    /// Merge `src`'s symbols into this module. Name conflicts fail the
    /// whole link.
    pub fn link_module(&mut self, src: &Module) -> Result<()> {
        let result = (|| {
            let names: FxHashSet<Atom> = self.symbols.iter().map(|s| s.name).collect();
            for sym in &src.symbols {
                if names.contains(&sym.name) {
                    return Err(Error::Link(format!(
                        "duplicate symbol `{}` while linking",
                        sym.name
                    )));
                }
            }
            self.symbols.extend(src.symbols.iter().cloned());
            Ok(())
        })();
        self.state.record(result)
    }

    // ===== Compilation from source =====

    /// Compile a source file into this module, dispatching on extension.
    pub fn compile_file(&mut self, path: &Path) -> Result<()> {
        let result = (|| {
            let ext = path
                .extension()
                .and_then(|e| e.to_str())
                .unwrap_or_default();
            match ext {
                "nkir" => {
                    let src = std::fs::read_to_string(path)?;
                    let file = Atom::intern(&path.to_string_lossy());
                    self.ingest_ir(&src, file)
                }
                "nkst" => {
                    let src = std::fs::read_to_string(path)?;
                    let file = Atom::intern(&path.to_string_lossy());
                    let _nodes = text::parse_ast(&src, file)?;
                    Err(Error::Unsupported(
                        "no language frontend registered to compile AST input".into(),
                    ))
                }
                "nkl" => Err(Error::Unsupported(
                    "no language frontend registered to compile surface input".into(),
                )),
                other => Err(Error::Unsupported(format!(
                    "unsupported source file `*.{}` (supported: `*.nkir`, `*.nkst`, `*.nkl`)",
                    other
                ))),
            }
        })();
        self.state.record(result)
    }

    /// Compile textual IR from memory under an anonymous file name.
    pub fn compile_string_ir(&mut self, src: &str) -> Result<()> {
        let file = Atom::unique("<string>");
        let result = self.ingest_ir(src, file);
        self.state.record(result)
    }

    /// Parse AST text from memory; compilation needs a frontend.
    pub fn compile_string_ast(&mut self, src: &str) -> Result<()> {
        let file = Atom::unique("<string>");
        let result = (|| {
            let _nodes = text::parse_ast(src, file)?;
            Err(Error::Unsupported(
                "no language frontend registered to compile AST input".into(),
            ))
        })();
        self.state.record(result)
    }

    fn ingest_ir(&mut self, src: &str, file: Atom) -> Result<()> {
        let parsed = text::parse_ir(src, file, &self.state.types)?;
        let names: FxHashSet<Atom> = self.symbols.iter().map(|s| s.name).collect();
        for sym in &parsed {
            if names.contains(&sym.name) {
                return Err(Error::Link(format!(
                    "duplicate symbol `{}` in `{}`",
                    sym.name, file
                )));
            }
        }
        ir::validate_symbols(&parsed)?;
        self.symbols.extend(parsed);
        Ok(())
    }

    // ===== Native output =====

    /// Emit this module as C and drive the toolchain to `kind`.
    pub fn export(&self, out_file: &Path, kind: OutputKind) -> Result<()> {
        let result = (|| {
            let source = crate::cemit::emit_c(&self.symbols)?;
            toolchain::build(&source, out_file, kind, &self.compiler.toolchain)
        })();
        self.state.record(result)
    }

    /// The generated C source, without invoking the toolchain.
    pub fn emit_c(&self) -> Result<String> {
        let result = crate::cemit::emit_c(&self.symbols);
        self.state.record(result)
    }

    // ===== Execution =====

    /// Install the extern-symbol resolver callback.
    pub fn set_symbol_resolver(&self, resolver: SymbolResolver) -> Result<()> {
        let result = self.run.set_resolver(resolver);
        self.state.record(result)
    }

    /// Pre-register extern addresses (host-provided symbols).
    pub fn define_extern_symbols(&self, syms: &[(Atom, *mut c_void)]) {
        self.run.define_extern_syms(syms);
    }

    /// Load `name` into the process and return its native address.
    ///
    /// Procedures surface as C-callable entry points; data as the address
    /// of its linked storage. Loading is idempotent: the transitive
    /// dependency closure is translated once and cached, so a second call
    /// returns the same pointer without re-translating.
    pub fn get_symbol_address(&self, name: Atom) -> Result<*mut c_void> {
        let result = self
            .run
            .global_address(&self.symbols, name)
            .map(|addr| addr as *mut c_void);
        self.state.record(result)
    }

    /// Execute procedure `name` in the interpreter. `argv[i]` points at
    /// the i-th argument value; `retv` receives the return value (null to
    /// discard it).
    pub fn invoke(&self, name: Atom, argv: &[*mut c_void], retv: *mut c_void) -> Result<()> {
        let result = self.run.invoke(&self.symbols, name, argv, retv);
        self.state.record(result)
    }

    // ===== Inspection =====

    /// Render the module in textual IR syntax.
    pub fn to_text(&self) -> String {
        let mut out = String::new();
        let _ = ir::inspect::write_symbols(&mut out, &self.symbols);
        out
    }

    /// Render one symbol in textual IR syntax.
    pub fn symbol_to_text(&self, name: Atom) -> Option<String> {
        let sym = self.find_symbol(name)?;
        let mut out = String::new();
        let _ = ir::inspect::write_symbol(&mut out, sym);
        let _ = writeln!(out);
        Some(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_triple_parse_and_display() {
        let t = Triple::parse("x86_64-unknown-linux-gnu").unwrap();
        assert_eq!(t.arch, "x86_64");
        assert_eq!(t.abi.as_deref(), Some("gnu"));
        assert_eq!(t.to_string(), "x86_64-unknown-linux-gnu");

        let t = Triple::parse("aarch64-apple-darwin").unwrap();
        assert!(t.abi.is_none());

        assert!(Triple::parse("x86_64").is_err());
        assert!(Triple::parse("a-b--c").is_err());
    }

    #[test]
    fn test_bad_triple_is_recorded() {
        let state = State::new();
        assert!(Compiler::new(&state, "not a triple").is_err());
        assert_eq!(state.diagnostics().len(), 1);
    }

    #[test]
    fn test_compile_string_and_link_conflict() {
        let state = State::new();
        let compiler = Compiler::host(&state);

        let mut a = Module::new(&compiler);
        a.compile_string_ir("pub proc f() :i64 {\n    ret\n}\n").unwrap();

        let mut b = Module::new(&compiler);
        b.compile_string_ir("pub proc f() :i64 {\n    ret\n}\n").unwrap();

        assert!(matches!(a.link_module(&b), Err(Error::Link(_))));
        assert!(!state.diagnostics().is_empty());
    }

    #[test]
    fn test_link_merges_symbols() {
        let state = State::new();
        let compiler = Compiler::host(&state);

        let mut a = Module::new(&compiler);
        a.compile_string_ir("pub proc f() :i64 {\n    ret\n}\n").unwrap();
        let mut b = Module::new(&compiler);
        b.compile_string_ir("pub proc g() :i64 {\n    ret\n}\n").unwrap();

        a.link_module(&b).unwrap();
        assert!(a.find_symbol(Atom::intern("f")).is_some());
        assert!(a.find_symbol(Atom::intern("g")).is_some());
    }

    #[test]
    fn test_unknown_extension_rejected() {
        let state = State::new();
        let compiler = Compiler::host(&state);
        let mut module = Module::new(&compiler);
        let err = module.compile_file(Path::new("prog.xyz")).unwrap_err();
        assert!(matches!(err, Error::Unsupported(_)));
    }

    #[test]
    fn test_ast_parses_but_needs_frontend() {
        let state = State::new();
        let compiler = Compiler::host(&state);
        let mut module = Module::new(&compiler);
        let err = module.compile_string_ast("(proc main (ret))").unwrap_err();
        assert!(matches!(err, Error::Unsupported(_)));
    }
}
