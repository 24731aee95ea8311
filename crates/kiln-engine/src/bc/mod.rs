//! The dense bytecode form and its run context.
//!
//! A run context owns everything needed to execute a module in process:
//! translated procedures, linked data, resolved extern addresses, native
//! closures for procedures that escape as values, and the read-only blob
//! arena all of those point into. One run context serves any number of
//! threads; each thread brings its own interpreter stack.

pub mod translate;

use std::ffi::c_void;
use std::sync::Arc;

use dashmap::DashMap;
use parking_lot::{Mutex, ReentrantMutex};
use rustc_hash::FxHashMap;

use crate::atom::Atom;
use crate::error::{Error, Result};
use crate::ffi::closure::ClosureHandle;
use crate::ffi::loader::Library;
use crate::ffi::sig::SigCache;
use crate::ir::{self, ExternKind, Symbol, SymbolKind};
use crate::mem::Arena;
use crate::types::{CallConv, NumericType, ProcInfo, TypeRef, TypeStore};

/// Operand size selector for `mov` and conditional jumps.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SizeClass {
    S8,
    S16,
    S32,
    S64,
}

impl SizeClass {
    pub fn from_size(size: u64) -> Option<SizeClass> {
        Some(match size {
            1 => SizeClass::S8,
            2 => SizeClass::S16,
            4 => SizeClass::S32,
            8 => SizeClass::S64,
            _ => return None,
        })
    }

    pub fn bytes(self) -> usize {
        match self {
            SizeClass::S8 => 1,
            SizeClass::S16 => 2,
            SizeClass::S32 => 4,
            SizeClass::S64 => 8,
        }
    }
}

/// Bytecode opcodes. Size- and type-specialized variants carry their
/// selector inline; the selection happens once, at translation time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BcOp {
    Nop,
    Ret,

    Jmp,
    Jmpz(SizeClass),
    Jmpnz(SizeClass),

    /// Indirect call through a runtime procedure value.
    Call,
    /// Direct call of a translated bytecode procedure.
    CallJmp,
    /// Call of a resolved native procedure.
    CallExt,

    Mov(SizeClass),
    /// Arbitrary-size copy (aggregates with non-power-of-two sizes).
    MovN(usize),
    Lea,

    Neg(NumericType),
    Add(NumericType),
    Sub(NumericType),
    Mul(NumericType),
    Div(NumericType),
    Mod(NumericType),

    And(NumericType),
    Or(NumericType),
    Xor(NumericType),
    Lsh(NumericType),
    Rsh(NumericType),

    CmpEq(NumericType),
    CmpNe(NumericType),
    CmpLt(NumericType),
    CmpLe(NumericType),
    CmpGt(NumericType),
    CmpGe(NumericType),

    Ext { from: NumericType, to: NumericType },
    Trunc { from: NumericType, to: NumericType },
    Fp2i { from: NumericType, to: NumericType },
    I2fp { from: NumericType, to: NumericType },

    Syscall,
}

/// Storage class of a translated ref.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BcRefKind {
    None,
    /// Offset into the current call frame.
    Frame,
    /// Offset into the current argument block.
    Arg,
    /// Offset from the return-slot base pointer.
    Ret,
    /// `offset` is an absolute address into the run context's blobs.
    Rodata,
    /// `offset` is the target instruction index (jump targets).
    Instr,
}

/// A translated operand.
#[derive(Debug, Clone)]
pub struct BcRef {
    pub kind: BcRefKind,
    pub offset: usize,
    pub post_offset: usize,
    pub indir: u8,
    pub ty: TypeRef,
}

impl BcRef {
    pub fn none(void_t: TypeRef) -> BcRef {
        BcRef {
            kind: BcRefKind::None,
            offset: 0,
            post_offset: 0,
            indir: 0,
            ty: void_t,
        }
    }

    pub fn is_none(&self) -> bool {
        matches!(self.kind, BcRefKind::None)
    }
}

#[derive(Debug, Clone)]
pub enum BcArg {
    None,
    Ref(BcRef),
    RefArray(Vec<BcRef>),
    /// Callee of a `CallJmp`; resolved against the run context at call time
    /// so mutually recursive procedures need no patching.
    ProcName(Atom),
    /// Callee of a `CallExt`.
    Native { addr: usize, proc_t: TypeRef },
}

impl BcArg {
    pub fn as_bc_ref(&self) -> Option<&BcRef> {
        match self {
            BcArg::Ref(r) => Some(r),
            _ => None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct BcInstr {
    pub op: BcOp,
    pub args: [BcArg; 3],
}

/// Argument-block slot of one parameter.
#[derive(Debug, Clone, Copy)]
pub struct BcParam {
    pub offset: usize,
    pub size: usize,
}

/// A translated procedure.
#[derive(Debug)]
pub struct BcProc {
    pub name: Atom,
    pub instrs: Vec<BcInstr>,
    pub frame_size: usize,
    pub frame_align: usize,
    pub args_size: usize,
    pub args_align: usize,
    pub params: Vec<BcParam>,
    pub ret_size: usize,
    /// Full procedure type, for closures and signature lookup.
    pub proc_t: TypeRef,
}

/// Callback resolving extern symbols the context cannot find on its own.
pub type SymbolResolver = Box<dyn Fn(Atom) -> Option<*mut c_void> + Send + Sync>;

/// Execution state shared by every thread running one module.
pub struct RunCtx {
    pub(crate) types: Arc<TypeStore>,
    /// Translated procedures; guarded map makes translation idempotent.
    pub(crate) procs: DashMap<Atom, Arc<BcProc>>,
    /// Serializes translation batches. Reentrant: linking data relocations
    /// mid-translation may pull in further procedures on the same thread.
    translating: ReentrantMutex<()>,
    /// Linked data symbols (address of their storage).
    data: Mutex<FxHashMap<Atom, usize>>,
    /// Resolved extern addresses.
    extern_syms: Mutex<FxHashMap<Atom, usize>>,
    /// Native entry points for procedures used as values.
    closures: Mutex<FxHashMap<Atom, ClosureHandle>>,
    /// Read-only blobs: immediates, data storage, address cells.
    rodata: Mutex<Arena>,
    /// FFI signature cache.
    pub(crate) sigs: SigCache,
    /// Loaded shared libraries, kept alive for the context's lifetime.
    libraries: Mutex<Vec<Library>>,
    /// Library alias map, shared with the owning compiler.
    lib_aliases: Arc<Mutex<FxHashMap<Atom, String>>>,
    resolver: Mutex<Option<SymbolResolver>>,
}

impl RunCtx {
    pub fn new(
        types: Arc<TypeStore>,
        lib_aliases: Arc<Mutex<FxHashMap<Atom, String>>>,
    ) -> Arc<RunCtx> {
        Arc::new(RunCtx {
            types,
            procs: DashMap::new(),
            translating: ReentrantMutex::new(()),
            data: Mutex::new(FxHashMap::default()),
            extern_syms: Mutex::new(FxHashMap::default()),
            closures: Mutex::new(FxHashMap::default()),
            rodata: Mutex::new(Arena::new()),
            sigs: SigCache::new(),
            libraries: Mutex::new(Vec::new()),
            lib_aliases,
            resolver: Mutex::new(None),
        })
    }

    /// Install the extern-symbol resolver callback. At most one may be set.
    pub fn set_resolver(&self, resolver: SymbolResolver) -> Result<()> {
        let mut slot = self.resolver.lock();
        if slot.is_some() {
            return Err(Error::Link("symbol resolver is already set".into()));
        }
        *slot = Some(resolver);
        Ok(())
    }

    /// Pre-register extern addresses (host-provided symbols).
    pub fn define_extern_syms(&self, syms: &[(Atom, *mut c_void)]) {
        let mut map = self.extern_syms.lock();
        for (name, addr) in syms {
            map.insert(*name, *addr as usize);
        }
    }

    /// Copy `bytes` into the context-owned blob arena.
    pub(crate) fn alloc_blob(&self, bytes: &[u8], align: usize) -> usize {
        self.rodata.lock().alloc_bytes(bytes, align) as usize
    }

    pub(crate) fn alloc_blob_zeroed(&self, size: usize, align: usize) -> usize {
        self.rodata.lock().alloc_zeroed(size.max(1), align) as usize
    }

    /// Translate `name` (and everything it references) if not done yet.
    pub fn ensure_translated(
        self: &Arc<Self>,
        symbols: &[Symbol],
        name: Atom,
    ) -> Result<Arc<BcProc>> {
        if let Some(existing) = self.procs.get(&name) {
            return Ok(existing.clone());
        }
        let _guard = self.translating.lock();
        if let Some(existing) = self.procs.get(&name) {
            return Ok(existing.clone());
        }
        translate::translate_proc(self, symbols, name)?;
        self.procs
            .get(&name)
            .map(|p| p.clone())
            .ok_or_else(|| Error::Link(format!("procedure `{}` did not translate", name)))
    }

    /// Procedure type of an IR procedure, in the store.
    pub(crate) fn proc_type(&self, proc: &ir::Proc) -> TypeRef {
        self.types.get_procedure(ProcInfo {
            param_types: proc.params.iter().map(|p| p.ty.clone()).collect(),
            ret_t: proc.ret.ty.clone(),
            call_conv: CallConv::Kiln,
            variadic: proc.variadic,
        })
    }

    fn extern_proc_type(&self, param_types: &[TypeRef], ret_t: &TypeRef, variadic: bool) -> TypeRef {
        self.types.get_procedure(ProcInfo {
            param_types: param_types.to_vec(),
            ret_t: ret_t.clone(),
            call_conv: CallConv::Cdecl,
            variadic,
        })
    }

    /// Native address of a procedure: its closure trampoline.
    pub fn closure_address(self: &Arc<Self>, symbols: &[Symbol], name: Atom) -> Result<usize> {
        self.ensure_translated(symbols, name)?;
        self.closure_for_translated(name)
    }

    /// Closure entry for an already-translated procedure. Keeps the first
    /// trampoline when two threads race, so handed-out addresses stay
    /// stable.
    pub(crate) fn closure_for_translated(self: &Arc<Self>, name: Atom) -> Result<usize> {
        if let Some(handle) = self.closures.lock().get(&name) {
            return Ok(handle.entry());
        }
        let proc = self
            .procs
            .get(&name)
            .map(|p| p.clone())
            .ok_or_else(|| Error::Link(format!("procedure `{}` is not translated", name)))?;
        let handle = crate::ffi::closure::make_closure(self, proc)?;
        let mut map = self.closures.lock();
        if let Some(existing) = map.get(&name) {
            return Ok(existing.entry());
        }
        let entry = handle.entry();
        map.insert(name, handle);
        Ok(entry)
    }

    /// Address of a linked data symbol; links it (and its relocations) on
    /// first use.
    pub fn data_address(self: &Arc<Self>, symbols: &[Symbol], name: Atom) -> Result<usize> {
        if let Some(&addr) = self.data.lock().get(&name) {
            return Ok(addr);
        }
        let sym = ir::find_symbol(symbols, name)
            .ok_or_else(|| Error::Link(format!("undefined symbol `{}`", name)))?;
        let data = sym
            .as_data()
            .ok_or_else(|| Error::Link(format!("`{}` is not a data symbol", name)))?;

        let addr = match &data.bytes {
            Some(bytes) => self.alloc_blob(bytes, data.ty.align.max(1) as usize),
            None => self.alloc_blob_zeroed(data.ty.size as usize, data.ty.align.max(1) as usize),
        };
        // Insert before applying relocations so reloc cycles terminate.
        self.data.lock().insert(name, addr);

        for reloc in &data.relocs {
            let target = self.global_address(symbols, reloc.sym)?;
            unsafe {
                let slot = (addr + reloc.offset as usize) as *mut usize;
                slot.write_unaligned(target);
            }
        }
        Ok(addr)
    }

    /// Resolve an extern symbol to a native address.
    pub fn extern_address(self: &Arc<Self>, symbols: &[Symbol], name: Atom) -> Result<usize> {
        if let Some(&addr) = self.extern_syms.lock().get(&name) {
            return Ok(addr);
        }
        if let Some(resolver) = self.resolver.lock().as_ref() {
            if let Some(addr) = resolver(name) {
                let addr = addr as usize;
                self.extern_syms.lock().insert(name, addr);
                return Ok(addr);
            }
        }

        let lib = ir::find_symbol(symbols, name)
            .and_then(|s| s.as_extern())
            .map(|e| e.lib)
            .unwrap_or(Atom::NONE);
        let addr = self.resolve_in_library(lib, name)?;
        self.extern_syms.lock().insert(name, addr);
        Ok(addr)
    }

    fn resolve_in_library(&self, lib: Atom, name: Atom) -> Result<usize> {
        let mut candidates = Vec::new();
        if !lib.is_none() {
            if let Some(alias) = self.lib_aliases.lock().get(&lib) {
                candidates.push(alias.clone());
            }
            let raw = lib.as_str();
            candidates.push(raw.to_string());
            if !raw.contains('/') && !raw.starts_with("lib") {
                candidates.push(format!("lib{}.so", raw));
                candidates.push(format!("lib{}.so.6", raw));
            }
        }

        // Already-loaded images first (including the process itself).
        {
            let libraries = self.libraries.lock();
            for library in libraries.iter() {
                if let Ok(addr) = library.symbol(name.as_str()) {
                    return Ok(addr as usize);
                }
            }
        }
        if let Ok(addr) = Library::this_process().symbol(name.as_str()) {
            return Ok(addr as usize);
        }

        for candidate in &candidates {
            if let Ok(library) = Library::open(candidate) {
                if let Ok(addr) = library.symbol(name.as_str()) {
                    self.libraries.lock().push(library);
                    return Ok(addr as usize);
                }
            }
        }

        Err(Error::Link(format!(
            "unresolved extern symbol `{}` (lib `{}`)",
            name, lib
        )))
    }

    /// Runtime address of any global: procedures surface as closure
    /// trampolines, data as linked storage, externs as native symbols.
    pub fn global_address(self: &Arc<Self>, symbols: &[Symbol], name: Atom) -> Result<usize> {
        let sym = ir::find_symbol(symbols, name)
            .ok_or_else(|| Error::Link(format!("undefined symbol `{}`", name)))?;
        match &sym.kind {
            SymbolKind::Proc(_) => self.closure_address(symbols, name),
            SymbolKind::Data(_) => self.data_address(symbols, name),
            SymbolKind::Extern(_) => self.extern_address(symbols, name),
        }
    }

    /// Extern signature of a symbol, as a procedure type.
    pub(crate) fn extern_sig(&self, symbols: &[Symbol], name: Atom) -> Result<TypeRef> {
        let ext = ir::find_symbol(symbols, name)
            .and_then(|s| s.as_extern())
            .ok_or_else(|| Error::Link(format!("`{}` is not an extern symbol", name)))?;
        match &ext.kind {
            ExternKind::Proc {
                param_types,
                ret_t,
                variadic,
            } => Ok(self.extern_proc_type(param_types, ret_t, *variadic)),
            ExternKind::Data { .. } => {
                Err(Error::Type(format!("extern data `{}` called as procedure", name)))
            }
        }
    }

    /// Translate and execute `name` with raw argument/return pointers.
    pub fn invoke(
        self: &Arc<Self>,
        symbols: &[Symbol],
        name: Atom,
        argv: &[*mut c_void],
        retv: *mut c_void,
    ) -> Result<()> {
        let proc = self.ensure_translated(symbols, name)?;
        crate::interp::invoke(self, &proc, argv, retv as *mut u8)
    }
}
