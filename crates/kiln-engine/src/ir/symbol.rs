//! Module-level symbols: procedures, data, and externs.

use crate::atom::Atom;
use crate::ir::instr::Instr;
use crate::types::TypeRef;

/// Linker-level scope of a symbol.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Visibility {
    Default,
    #[default]
    Hidden,
    Protected,
    Internal,
    Local,
}

impl Visibility {
    pub fn keyword(self) -> Option<&'static str> {
        match self {
            Visibility::Default => Some("pub"),
            Visibility::Hidden => None,
            Visibility::Protected => Some("protected"),
            Visibility::Internal => Some("internal"),
            Visibility::Local => Some("local"),
        }
    }
}

/// Named, typed procedure parameter (also used for the return slot).
#[derive(Debug, Clone)]
pub struct Param {
    pub name: Atom,
    pub ty: TypeRef,
}

/// A procedure body. Blocks are implicit: `label` instructions delimit them
/// and `jmp*` instructions reference them by name or relative offset.
#[derive(Debug, Clone)]
pub struct Proc {
    pub params: Vec<Param>,
    pub ret: Param,
    pub instrs: Vec<Instr>,
    pub variadic: bool,
}

/// "Patch `offset` within the initializer with the address of `sym`."
#[derive(Debug, Clone, Copy)]
pub struct Reloc {
    pub sym: Atom,
    pub offset: u64,
}

/// Module-level data. `bytes = None` means zero-initialized storage.
#[derive(Debug, Clone)]
pub struct Data {
    pub ty: TypeRef,
    pub bytes: Option<Vec<u8>>,
    pub relocs: Vec<Reloc>,
    pub read_only: bool,
}

#[derive(Debug, Clone)]
pub enum ExternKind {
    Proc {
        param_types: Vec<TypeRef>,
        ret_t: TypeRef,
        variadic: bool,
    },
    Data {
        ty: TypeRef,
    },
}

/// A named external dependency, resolved against a shared library or a
/// host-provided address.
#[derive(Debug, Clone)]
pub struct Extern {
    pub lib: Atom,
    pub kind: ExternKind,
}

#[derive(Debug, Clone)]
pub enum SymbolKind {
    Proc(Proc),
    Data(Data),
    Extern(Extern),
}

/// A named top-level declaration.
#[derive(Debug, Clone)]
pub struct Symbol {
    pub name: Atom,
    pub vis: Visibility,
    pub thread_local: bool,
    pub kind: SymbolKind,
}

impl Symbol {
    pub fn proc(name: impl Into<Atom>, proc: Proc) -> Symbol {
        Symbol {
            name: name.into(),
            vis: Visibility::default(),
            thread_local: false,
            kind: SymbolKind::Proc(proc),
        }
    }

    pub fn data(name: impl Into<Atom>, data: Data) -> Symbol {
        Symbol {
            name: name.into(),
            vis: Visibility::default(),
            thread_local: false,
            kind: SymbolKind::Data(data),
        }
    }

    pub fn extern_(name: impl Into<Atom>, ext: Extern) -> Symbol {
        Symbol {
            name: name.into(),
            vis: Visibility::default(),
            thread_local: false,
            kind: SymbolKind::Extern(ext),
        }
    }

    pub fn with_vis(mut self, vis: Visibility) -> Symbol {
        self.vis = vis;
        self
    }

    pub fn with_kind(mut self, kind: SymbolKind) -> Symbol {
        self.kind = kind;
        self
    }

    pub fn as_proc(&self) -> Option<&Proc> {
        match &self.kind {
            SymbolKind::Proc(p) => Some(p),
            _ => None,
        }
    }

    pub fn as_data(&self) -> Option<&Data> {
        match &self.kind {
            SymbolKind::Data(d) => Some(d),
            _ => None,
        }
    }

    pub fn as_extern(&self) -> Option<&Extern> {
        match &self.kind {
            SymbolKind::Extern(e) => Some(e),
            _ => None,
        }
    }
}
