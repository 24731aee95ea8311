//! The C backend: IR → portable C11 source.
//!
//! Output is three buffers concatenated in order: type declarations,
//! forward declarations (signatures, globals, externs), and definitions.
//! Control flow is `goto` only; memory refs are emitted as casts through
//! `u8*` so offsets and reinterpretation match the interpreter exactly.
//!
//! Aggregate-returning procedures take the destination as an implicit
//! first pointer parameter; extern procedures keep their natural C
//! signature.

pub mod toolchain;

use std::fmt::Write;

use rustc_hash::{FxHashMap, FxHashSet};

use crate::atom::Atom;
use crate::error::{Error, Result};
use crate::ir::{
    self, Arg, Instr, Opcode, Proc, Ref, RefKind, Reloc, Symbol, SymbolKind, Visibility,
};
use crate::types::{NumericType, TypeKind, TypeRef};

const PREAMBLE: &str = "\
typedef signed char i8;
typedef signed short i16;
typedef signed int i32;
typedef signed long long i64;
typedef unsigned char u8;
typedef unsigned short u16;
typedef unsigned int u32;
typedef unsigned long long u64;
typedef float f32;
typedef double f64;

extern long syscall(long, ...);

";

/// Emit a whole module as one C translation unit.
pub fn emit_c(symbols: &[Symbol]) -> Result<String> {
    let mut emitter = Emitter {
        symbols,
        types_s: String::from(PREAMBLE),
        forward_s: String::new(),
        main_s: String::new(),
        type_map: FxHashMap::default(),
        typedecl_count: 0,
        procs_emitted: FxHashSet::default(),
        procs_queued: Vec::new(),
        data_emitted: FxHashSet::default(),
        extern_emitted: FxHashSet::default(),
    };

    // Externally visible symbols drive emission; local procedures and data
    // follow on first use.
    for sym in symbols {
        match &sym.kind {
            SymbolKind::Proc(_) if sym.vis != Visibility::Local => {
                emitter.emit_proc(sym.name)?;
                while let Some(name) = emitter.procs_queued.pop() {
                    emitter.emit_proc(name)?;
                }
            }
            SymbolKind::Data(_) if sym.vis != Visibility::Local => {
                emitter.emit_data_decl(sym.name)?;
            }
            _ => {}
        }
    }

    let mut out = emitter.types_s;
    out.push('\n');
    out.push_str(&emitter.forward_s);
    out.push('\n');
    out.push_str(&emitter.main_s);
    Ok(out)
}

struct Emitter<'a> {
    symbols: &'a [Symbol],
    types_s: String,
    forward_s: String,
    main_s: String,
    type_map: FxHashMap<u32, String>,
    typedecl_count: usize,
    procs_emitted: FxHashSet<Atom>,
    procs_queued: Vec<Atom>,
    data_emitted: FxHashSet<Atom>,
    extern_emitted: FxHashSet<Atom>,
}

fn sym_name(name: Atom) -> String {
    let s = name.as_str();
    if s.is_empty() {
        format!("__kiln_anon_{}__", name.id())
    } else {
        s.to_string()
    }
}

fn visibility_attr(vis: Visibility) -> &'static str {
    match vis {
        Visibility::Default => "__attribute__((visibility(\"default\"))) ",
        Visibility::Hidden => "",
        Visibility::Protected => "__attribute__((visibility(\"protected\"))) ",
        Visibility::Internal => "__attribute__((visibility(\"internal\"))) ",
        Visibility::Local => "static ",
    }
}

impl<'a> Emitter<'a> {
    // ===== Types =====

    /// C spelling of a type; complex types become cached typedefs.
    fn type_name(&mut self, ty: &TypeRef, allow_void: bool) -> String {
        if ty.size == 0 && allow_void {
            return "void".to_string();
        }
        if let Some(existing) = self.type_map.get(&ty.id) {
            return existing.clone();
        }

        let name = match &ty.kind {
            TypeKind::Numeric(n) => n.name().to_string(),
            TypeKind::Pointer(target) => format!("{}*", self.type_name(target, false)),
            // A zero-sized type has no C spelling and only ever appears
            // behind a pointer here.
            TypeKind::Aggregate(elems) if elems.is_empty() => "u8".to_string(),
            TypeKind::Aggregate(elems) => {
                let mut body = String::from("struct {\n");
                for (i, elem) in elems.iter().enumerate() {
                    let elem_name = self.type_name(&elem.ty, false);
                    if elem.count > 1 {
                        let _ = writeln!(body, "  {} _{}[{}];", elem_name, i, elem.count);
                    } else {
                        let _ = writeln!(body, "  {} _{};", elem_name, i);
                    }
                }
                body.push('}');
                let alias = format!("_type{}", self.typedecl_count);
                self.typedecl_count += 1;
                let _ = writeln!(self.types_s, "typedef {} {};", body, alias);
                alias
            }
            TypeKind::Procedure(info) => {
                let ret = self.type_name(&info.ret_t, true);
                let mut params = String::new();
                for (i, param) in info.param_types.iter().enumerate() {
                    if i > 0 {
                        params.push_str(", ");
                    }
                    params.push_str(&self.type_name(param, false));
                }
                if info.variadic {
                    if !info.param_types.is_empty() {
                        params.push_str(", ");
                    }
                    params.push_str("...");
                }
                let alias = format!("_type{}", self.typedecl_count);
                self.typedecl_count += 1;
                let _ = writeln!(self.types_s, "typedef {} (*{})({});", ret, alias, params);
                alias
            }
        };

        self.type_map.insert(ty.id, name.clone());
        name
    }

    /// A value cast for numeric/pointer destinations; aggregates assign
    /// without one.
    fn value_cast(&mut self, ty: &TypeRef) -> String {
        match ty.kind {
            TypeKind::Numeric(_) | TypeKind::Pointer(_) | TypeKind::Procedure(_) => {
                format!("({})", self.type_name(ty, false))
            }
            TypeKind::Aggregate(_) => String::new(),
        }
    }

    // ===== Data =====

    fn write_initializer(
        &mut self,
        out: &mut String,
        bytes: &[u8],
        base: u64,
        relocs: &[Reloc],
        ty: &TypeRef,
    ) {
        if let Some(reloc) = relocs.iter().find(|r| r.offset == base) {
            let _ = write!(out, "({})&{}", self.type_name(ty, false), sym_name(reloc.sym));
            return;
        }
        match &ty.kind {
            TypeKind::Numeric(n) => {
                let start = base as usize;
                let mut raw = [0u8; 8];
                let len = (n.size() as usize).min(bytes.len().saturating_sub(start));
                raw[..len].copy_from_slice(&bytes[start..start + len]);
                let bits = u64::from_le_bytes(raw);
                match n {
                    NumericType::Float32 => {
                        let _ = write!(out, "{:?}f", f32::from_bits(bits as u32));
                    }
                    NumericType::Float64 => {
                        let _ = write!(out, "{:?}", f64::from_bits(bits));
                    }
                    n if n.is_signed() => {
                        let shift = 64 - n.size() * 8;
                        let _ = write!(out, "{}ll", ((bits << shift) as i64) >> shift);
                    }
                    _ => {
                        let _ = write!(out, "{}ull", bits);
                    }
                }
            }
            TypeKind::Pointer(_) | TypeKind::Procedure(_) => {
                let start = base as usize;
                let mut raw = [0u8; 8];
                let len = 8.min(bytes.len().saturating_sub(start));
                raw[..len].copy_from_slice(&bytes[start..start + len]);
                let _ = write!(
                    out,
                    "({}){}ull",
                    self.type_name(ty, false),
                    u64::from_le_bytes(raw)
                );
            }
            TypeKind::Aggregate(elems) => {
                out.push_str("{ ");
                for (i, elem) in elems.iter().enumerate() {
                    if i > 0 {
                        out.push_str(", ");
                    }
                    let elem_ty = elem.ty.clone();
                    if elem.count > 1 {
                        out.push_str("{ ");
                        for c in 0..elem.count {
                            if c > 0 {
                                out.push_str(", ");
                            }
                            self.write_initializer(
                                out,
                                bytes,
                                base + elem.offset + c * elem_ty.size,
                                relocs,
                                &elem_ty,
                            );
                        }
                        out.push_str(" }");
                    } else {
                        self.write_initializer(out, bytes, base + elem.offset, relocs, &elem_ty);
                    }
                }
                out.push_str(" }");
            }
        }
    }

    /// Emit a data symbol's global definition on first use.
    fn emit_data_decl(&mut self, name: Atom) -> Result<()> {
        if !self.data_emitted.insert(name) {
            return Ok(());
        }
        let sym = ir::find_symbol(self.symbols, name)
            .ok_or_else(|| Error::Link(format!("undefined symbol `{}`", name)))?
            .clone();
        let data = sym
            .as_data()
            .ok_or_else(|| Error::Link(format!("`{}` is not a data symbol", name)))?;

        let ty_name = self.type_name(&data.ty, false);
        let mut decl = String::new();
        decl.push_str(visibility_attr(sym.vis));
        if sym.thread_local {
            decl.push_str("_Thread_local ");
        }
        decl.push_str(&ty_name);
        if data.read_only {
            decl.push_str(" const");
        }
        let _ = write!(decl, " {}", sym_name(name));
        match &data.bytes {
            Some(bytes) => {
                decl.push_str(" = ");
                let mut init = String::new();
                self.write_initializer(&mut init, bytes, 0, &data.relocs, &data.ty);
                decl.push_str(&init);
            }
            None => decl.push_str(" = {0}"),
        }
        decl.push_str(";\n");
        self.forward_s.push_str(&decl);
        Ok(())
    }

    /// Emit an extern declaration on first use.
    fn emit_extern_decl(&mut self, name: Atom) -> Result<()> {
        if !self.extern_emitted.insert(name) {
            return Ok(());
        }
        let sym = ir::find_symbol(self.symbols, name)
            .ok_or_else(|| Error::Link(format!("undefined symbol `{}`", name)))?
            .clone();
        let ext = sym
            .as_extern()
            .ok_or_else(|| Error::Link(format!("`{}` is not an extern symbol", name)))?;

        match &ext.kind {
            ir::ExternKind::Proc {
                param_types,
                ret_t,
                variadic,
            } => {
                let ret = self.type_name(ret_t, true);
                let mut params = String::new();
                for (i, param) in param_types.iter().enumerate() {
                    if i > 0 {
                        params.push_str(", ");
                    }
                    params.push_str(&self.type_name(param, false));
                }
                if *variadic {
                    if !param_types.is_empty() {
                        params.push_str(", ");
                    }
                    params.push_str("...");
                }
                let _ = writeln!(
                    self.forward_s,
                    "extern {} {}({});",
                    ret,
                    sym_name(name),
                    params
                );
            }
            ir::ExternKind::Data { ty } => {
                let ty_name = self.type_name(ty, false);
                let _ = writeln!(self.forward_s, "extern {} {};", ty_name, sym_name(name));
            }
        }
        Ok(())
    }

    // ===== Procedures =====

    fn emit_proc(&mut self, name: Atom) -> Result<()> {
        if !self.procs_emitted.insert(name) {
            return Ok(());
        }
        let sym = ir::find_symbol(self.symbols, name)
            .ok_or_else(|| Error::Link(format!("undefined symbol `{}`", name)))?
            .clone();
        let proc = sym
            .as_proc()
            .ok_or_else(|| Error::Link(format!("`{}` is not a procedure", name)))?;

        let fwd_signature = self.proc_signature(name, proc, false);
        let def_signature = self.proc_signature(name, proc, true);
        let body = ProcEmitter::new(self, name, proc).emit()?;

        self.forward_s.push_str(visibility_attr(sym.vis));
        self.forward_s.push_str(&fwd_signature);
        self.forward_s.push_str(";\n");

        self.main_s.push('\n');
        self.main_s.push_str(&def_signature);
        self.main_s.push_str(" {\n");
        self.main_s.push_str(&body);
        self.main_s.push_str("}\n");
        Ok(())
    }

    fn aggregate_ret(proc: &Proc) -> bool {
        matches!(proc.ret.ty.kind, TypeKind::Aggregate(_)) && proc.ret.ty.size > 0
    }

    fn proc_signature(&mut self, name: Atom, proc: &Proc, with_names: bool) -> String {
        let mut out = String::new();
        let aggregate_ret = Self::aggregate_ret(proc);
        let ret = if aggregate_ret {
            "void".to_string()
        } else {
            self.type_name(&proc.ret.ty, true)
        };
        let _ = write!(out, "{} {}(", ret, sym_name(name));
        let mut first = true;
        if aggregate_ret {
            let ret_ty = self.type_name(&proc.ret.ty, false);
            let _ = write!(out, "{}* _retp", ret_ty);
            first = false;
        }
        for (i, param) in proc.params.iter().enumerate() {
            if !first {
                out.push_str(", ");
            }
            first = false;
            let ty_name = self.type_name(&param.ty, false);
            out.push_str(&ty_name);
            if with_names {
                if param.name.is_none() {
                    let _ = write!(out, " _arg_{}", i);
                } else {
                    let _ = write!(out, " {}", param.name);
                }
            }
        }
        if proc.variadic {
            if !first {
                out.push_str(", ");
            }
            out.push_str("...");
        }
        out.push(')');
        out
    }
}

/// Emits one procedure body.
struct ProcEmitter<'e, 'a> {
    emitter: &'e mut Emitter<'a>,
    name: Atom,
    proc: &'e Proc,
    /// C names of labels by instruction index, suffix-deduplicated.
    label_names: FxHashMap<usize, String>,
    /// Instruction indices that need a synthetic label (relative jumps).
    rel_targets: FxHashSet<usize>,
    /// Name map from label atom to C label (first occurrence wins).
    by_atom: FxHashMap<Atom, String>,
    param_names: FxHashMap<Atom, ()>,
    out: String,
}

impl<'e, 'a> ProcEmitter<'e, 'a> {
    fn new(emitter: &'e mut Emitter<'a>, name: Atom, proc: &'e Proc) -> Self {
        ProcEmitter {
            emitter,
            name,
            proc,
            label_names: FxHashMap::default(),
            rel_targets: FxHashSet::default(),
            by_atom: FxHashMap::default(),
            param_names: proc.params.iter().map(|p| (p.name, ())).collect(),
            out: String::new(),
        }
    }

    fn err(&self, message: impl std::fmt::Display) -> Error {
        Error::Type(format!("proc `{}`: {}", self.name, message))
    }

    fn emit(mut self) -> Result<String> {
        self.collect_labels();
        self.declare_locals();

        let mut alloc_idx = 0usize;
        for (idx, instr) in self.proc.instrs.iter().enumerate() {
            if self.rel_targets.contains(&idx) && !self.label_names.contains_key(&idx) {
                let _ = writeln!(self.out, "l_i{}:;", idx);
            }
            if let Some(label) = self.label_names.get(&idx) {
                let _ = writeln!(self.out, "{}:;", label);
            }
            self.emit_instr(idx, instr, &mut alloc_idx)?;
        }
        Ok(self.out)
    }

    fn collect_labels(&mut self) {
        let mut used: FxHashMap<String, u32> = FxHashMap::default();
        for (idx, instr) in self.proc.instrs.iter().enumerate() {
            if let (Opcode::Label, Arg::Label(atom)) = (instr.code, &instr.args[1]) {
                let base = format!("l_{}", atom);
                let n = used.entry(base.clone()).or_insert(0);
                let label = if *n == 0 { base.clone() } else { format!("{}{}", base, n) };
                *n += 1;
                self.label_names.insert(idx, label.clone());
                self.by_atom.entry(*atom).or_insert(label);
            }
            if instr.code.is_jump() {
                for arg in &instr.args {
                    if let Arg::LabelRel(offset) = arg {
                        let target = idx as i64 + *offset as i64;
                        if target >= 0 {
                            self.rel_targets.insert(target as usize);
                        }
                    }
                }
            }
        }
    }

    fn declare_locals(&mut self) {
        // Named locals first (slot type discovery mirrors the bytecode
        // translator: a direct use fixes the slot type, indirect-only
        // locals hold a pointer), then one anonymous slot per `alloc`.
        let mut order: Vec<Atom> = Vec::new();
        let mut types: FxHashMap<Atom, Option<TypeRef>> = FxHashMap::default();
        let mut allocs: Vec<TypeRef> = Vec::new();
        for instr in &self.proc.instrs {
            if instr.code == Opcode::Alloc {
                if let Arg::Type(ty) = &instr.args[1] {
                    allocs.push(ty.clone());
                }
            }
            for arg in &instr.args {
                let refs: &[Ref] = match arg {
                    Arg::Ref(r) => std::slice::from_ref(r),
                    Arg::RefArray(refs) => refs,
                    _ => &[],
                };
                for r in refs {
                    if let RefKind::Local(sym) = r.kind {
                        if self.param_names.contains_key(&sym) {
                            continue;
                        }
                        let slot_ty = (r.indir == 0).then(|| r.ty.clone());
                        match types.get(&sym) {
                            None => {
                                order.push(sym);
                                types.insert(sym, slot_ty);
                            }
                            Some(None) if slot_ty.is_some() => {
                                types.insert(sym, slot_ty);
                            }
                            Some(Some(existing))
                                if r.indir == 0 && existing.size < r.ty.size =>
                            {
                                types.insert(sym, slot_ty);
                            }
                            _ => {}
                        }
                    }
                }
            }
        }

        for sym in &order {
            match types[sym].clone() {
                Some(ty) => {
                    let ty_name = self.emitter.type_name(&ty, false);
                    let _ = writeln!(self.out, "{} {} = {{0}};", ty_name, sym);
                }
                None => {
                    let _ = writeln!(self.out, "u8* {} = 0;", sym);
                }
            }
        }
        for (i, ty) in allocs.iter().enumerate() {
            let ty_name = self.emitter.type_name(ty, false);
            let _ = writeln!(self.out, "{} _alloc_{} = {{0}};", ty_name, i);
        }
        if self.proc.ret.ty.size > 0 {
            let ty_name = self.emitter.type_name(&self.proc.ret.ty, false);
            let _ = writeln!(self.out, "{} _ret = {{0}};", ty_name);
        }
        self.out.push('\n');
    }

    // ===== Refs =====

    /// The C lvalue (or value, for immediates) a ref denotes.
    fn ref_expr(&mut self, r: &Ref) -> Result<String> {
        match &r.kind {
            RefKind::Null => Ok(String::new()),
            RefKind::VariadicMarker => Err(self.err("variadic marker outside a call")),
            RefKind::Imm(imm) => {
                let ty_name = self.emitter.type_name(&r.ty, false);
                let text = match r.ty.as_numeric() {
                    Some(NumericType::Float32) => format!("{:?}f", imm.as_f32()),
                    Some(NumericType::Float64) => format!("{:?}", imm.as_f64()),
                    Some(n) if n.is_signed() => {
                        let shift = 64 - n.size() * 8;
                        format!("{}ll", ((imm.bits() << shift) as i64) >> shift)
                    }
                    _ => format!("{}ull", imm.bits()),
                };
                Ok(format!("(({}){})", ty_name, text))
            }
            RefKind::Global(sym) => {
                let target = ir::find_symbol(self.emitter.symbols, *sym)
                    .ok_or_else(|| Error::Link(format!("undefined symbol `{}`", sym)))?
                    .clone();
                match &target.kind {
                    SymbolKind::Proc(_) => {
                        if !self.emitter.procs_emitted.contains(sym) {
                            self.emitter.procs_queued.push(*sym);
                        }
                        Ok(sym_name(*sym))
                    }
                    SymbolKind::Extern(_) => {
                        self.emitter.emit_extern_decl(*sym)?;
                        Ok(self.wrap(&sym_name(*sym), r))
                    }
                    SymbolKind::Data(_) => {
                        self.emitter.emit_data_decl(*sym)?;
                        Ok(self.wrap(&sym_name(*sym), r))
                    }
                }
            }
            RefKind::Local(sym) => Ok(self.wrap(&sym.to_string(), r)),
            RefKind::Param(sym) => Ok(self.wrap(&sym.to_string(), r)),
            RefKind::Ret => Ok(self.wrap("_ret", r)),
        }
    }

    /// Wrap a storage name in the cast/offset/indirection pattern:
    /// `*(T*)( walk( (u8*)&name + offset ) + post_offset )`.
    fn wrap(&mut self, core: &str, r: &Ref) -> String {
        let ty_name = self.emitter.type_name(&r.ty, false);
        let mut expr = format!("(u8*)&{}", core);
        if r.offset != 0 {
            expr = format!("{} + {}", expr, r.offset);
        }
        for _ in 0..r.indir {
            expr = format!("*(u8**)({})", expr);
        }
        if r.post_offset != 0 {
            expr = format!("({}) + {}", expr, r.post_offset);
        }
        format!("(*({}*)({}))", ty_name, expr)
    }

    /// The address a ref denotes (for `lea`).
    fn addr_expr(&mut self, r: &Ref) -> Result<String> {
        let value = self.ref_expr(r)?;
        Ok(format!("(&{})", value))
    }

    // ===== Labels =====

    fn label_expr(&self, idx: usize, arg: &Arg) -> Result<String> {
        match arg {
            Arg::Label(atom) => self
                .by_atom
                .get(atom)
                .cloned()
                .ok_or_else(|| self.err(format!("jump to unknown label `@{}`", atom))),
            Arg::LabelRel(offset) => {
                let target = idx as i64 + *offset as i64;
                if target < 0 || target as usize > self.proc.instrs.len() {
                    return Err(self.err("relative jump out of range"));
                }
                let target = target as usize;
                if let Some(label) = self.label_names.get(&target) {
                    Ok(label.clone())
                } else {
                    Ok(format!("l_i{}", target))
                }
            }
            _ => Err(self.err("jump without a label")),
        }
    }

    // ===== Instructions =====

    fn arg_ref(&self, instr: &'e Instr, idx: usize) -> Result<&'e Ref> {
        instr.args[idx]
            .as_ref()
            .ok_or_else(|| self.err("missing operand"))
    }

    fn dst_prefix(&mut self, instr: &Instr) -> Result<String> {
        match instr.dst() {
            Some(dst) => {
                let lvalue = self.ref_expr(&dst.clone())?;
                let cast = self.emitter.value_cast(&dst.ty);
                Ok(format!("{} = {}", lvalue, cast))
            }
            None => Ok(String::new()),
        }
    }

    fn emit_instr(&mut self, idx: usize, instr: &'e Instr, alloc_idx: &mut usize) -> Result<()> {
        match instr.code {
            Opcode::Nop | Opcode::Label | Opcode::Comment => return Ok(()),
            _ => {}
        }

        self.out.push_str("  ");
        let stmt = match instr.code {
            Opcode::Ret => {
                if Emitter::aggregate_ret(self.proc) {
                    "*_retp = _ret; return".to_string()
                } else if self.proc.ret.ty.size > 0 {
                    "return _ret".to_string()
                } else {
                    "return".to_string()
                }
            }

            Opcode::Jmp => format!("goto {}", self.label_expr(idx, &instr.args[2])?),
            Opcode::Jmpz => {
                let cond = self.ref_expr(self.arg_ref(instr, 1)?)?;
                let label = self.label_expr(idx, &instr.args[2])?;
                format!("if (0 == {}) {{ goto {}; }}", cond, label)
            }
            Opcode::Jmpnz => {
                let cond = self.ref_expr(self.arg_ref(instr, 1)?)?;
                let label = self.label_expr(idx, &instr.args[2])?;
                format!("if ({}) {{ goto {}; }}", cond, label)
            }

            Opcode::Call => self.emit_call(instr)?,

            Opcode::Alloc => {
                let slot = format!("_alloc_{}", alloc_idx);
                *alloc_idx += 1;
                let prefix = self.dst_prefix(instr)?;
                format!("{}&{}", prefix, slot)
            }

            Opcode::Load => {
                let dst = self.arg_ref(instr, 0)?;
                let ptr = self.arg_ref(instr, 1)?;
                let src = ptr.clone().deref(dst.ty.clone());
                let prefix = self.dst_prefix(instr)?;
                format!("{}{}", prefix, self.ref_expr(&src)?)
            }
            Opcode::Store => {
                let ptr = self.arg_ref(instr, 0)?;
                let src = self.arg_ref(instr, 1)?;
                let dst = ptr.clone().deref(src.ty.clone());
                let lvalue = self.ref_expr(&dst)?;
                let cast = self.emitter.value_cast(&src.ty);
                format!("{} = {}{}", lvalue, cast, self.ref_expr(src)?)
            }
            Opcode::Mov => {
                let prefix = self.dst_prefix(instr)?;
                format!("{}{}", prefix, self.ref_expr(self.arg_ref(instr, 1)?)?)
            }
            Opcode::Lea => {
                let prefix = self.dst_prefix(instr)?;
                format!("{}{}", prefix, self.addr_expr(self.arg_ref(instr, 1)?)?)
            }

            Opcode::Neg => {
                let prefix = self.dst_prefix(instr)?;
                format!("{}(- {})", prefix, self.ref_expr(self.arg_ref(instr, 1)?)?)
            }

            Opcode::Add
            | Opcode::Sub
            | Opcode::Mul
            | Opcode::Div
            | Opcode::Mod
            | Opcode::And
            | Opcode::Or
            | Opcode::Xor
            | Opcode::Lsh
            | Opcode::Rsh
            | Opcode::CmpEq
            | Opcode::CmpNe
            | Opcode::CmpLt
            | Opcode::CmpLe
            | Opcode::CmpGt
            | Opcode::CmpGe => {
                let op = match instr.code {
                    Opcode::Add => "+",
                    Opcode::Sub => "-",
                    Opcode::Mul => "*",
                    Opcode::Div => "/",
                    Opcode::Mod => "%",
                    Opcode::And => "&",
                    Opcode::Or => "|",
                    Opcode::Xor => "^",
                    Opcode::Lsh => "<<",
                    Opcode::Rsh => ">>",
                    Opcode::CmpEq => "==",
                    Opcode::CmpNe => "!=",
                    Opcode::CmpLt => "<",
                    Opcode::CmpLe => "<=",
                    Opcode::CmpGt => ">",
                    _ => ">=",
                };
                let prefix = self.dst_prefix(instr)?;
                let lhs = self.ref_expr(self.arg_ref(instr, 1)?)?;
                let rhs = self.ref_expr(self.arg_ref(instr, 2)?)?;
                format!("{}({} {} {})", prefix, lhs, op, rhs)
            }

            Opcode::Ext => {
                let dst = self.arg_ref(instr, 0)?;
                let src = self.arg_ref(instr, 1)?;
                let src_n = src
                    .ty
                    .as_numeric()
                    .ok_or_else(|| self.err("ext on non-numeric operand"))?;
                let dst_n = dst
                    .ty
                    .as_numeric()
                    .ok_or_else(|| self.err("ext to non-numeric type"))?;
                // Re-read the source at the destination's signedness, then
                // let the assignment widen.
                let inner = match (src_n.size(), dst_n.is_signed()) {
                    (1, true) => "(i8)",
                    (1, false) => "(u8)",
                    (2, true) => "(i16)",
                    (2, false) => "(u16)",
                    (4, true) => "(i32)",
                    (4, false) => "(u32)",
                    (8, true) => "(i64)",
                    _ => "(u64)",
                };
                let prefix = self.dst_prefix(instr)?;
                format!("{}{}{}", prefix, inner, self.ref_expr(src)?)
            }
            Opcode::Trunc | Opcode::Fp2i | Opcode::I2fp => {
                let prefix = self.dst_prefix(instr)?;
                format!("{}{}", prefix, self.ref_expr(self.arg_ref(instr, 1)?)?)
            }

            Opcode::Syscall => {
                let n = self.ref_expr(self.arg_ref(instr, 1)?)?;
                let mut stmt = String::new();
                let prefix = self.dst_prefix(instr)?;
                let _ = write!(stmt, "{}syscall((long){}", prefix, n);
                if let Arg::RefArray(refs) = &instr.args[2] {
                    for r in refs {
                        let _ = write!(stmt, ", {}", self.ref_expr(r)?);
                    }
                }
                stmt.push(')');
                stmt
            }

            Opcode::Nop | Opcode::Label | Opcode::Comment => unreachable!(),
        };
        self.out.push_str(&stmt);
        self.out.push_str(";\n");
        Ok(())
    }

    fn emit_call(&mut self, instr: &'e Instr) -> Result<String> {
        let callee = self.arg_ref(instr, 1)?;
        let info = callee
            .ty
            .as_procedure()
            .cloned()
            .or_else(|| {
                // A direct call to a defined procedure: derive the
                // signature from the symbol itself.
                if let RefKind::Global(sym) = &callee.kind {
                    ir::find_symbol(self.emitter.symbols, *sym)
                        .and_then(|s| s.as_proc())
                        .map(|p| crate::types::ProcInfo {
                            param_types: p.params.iter().map(|param| param.ty.clone()).collect(),
                            ret_t: p.ret.ty.clone(),
                            call_conv: crate::types::CallConv::Kiln,
                            variadic: p.variadic,
                        })
                } else {
                    None
                }
            });

        let callee_expr = self.ref_expr(callee)?;

        // A call into a defined procedure with an aggregate return routes
        // the destination through the implicit first parameter.
        let target_proc = match &callee.kind {
            RefKind::Global(sym) => {
                ir::find_symbol(self.emitter.symbols, *sym).and_then(|s| s.as_proc().cloned())
            }
            _ => None,
        };
        let aggregate_ret = target_proc
            .as_ref()
            .map(Emitter::aggregate_ret)
            .unwrap_or(false);

        let mut args = String::new();
        let mut first = true;
        if aggregate_ret {
            if let Some(dst) = instr.dst() {
                let addr = self.addr_expr(&dst.clone())?;
                let _ = write!(args, "{}", addr);
                first = false;
            } else {
                return Err(self.err("aggregate-returning call needs a destination"));
            }
        }
        if let Arg::RefArray(refs) = &instr.args[2] {
            let mut fixed_idx = 0usize;
            for r in refs {
                if matches!(r.kind, RefKind::VariadicMarker) {
                    continue;
                }
                if !first {
                    args.push_str(", ");
                }
                first = false;
                if let Some(info) = &info {
                    if fixed_idx < info.param_types.len() {
                        args.push_str(&self.emitter.value_cast(&info.param_types[fixed_idx]));
                    }
                }
                fixed_idx += 1;
                args.push_str(&self.ref_expr(r)?);
            }
        }

        let prefix = if aggregate_ret {
            String::new()
        } else {
            self.dst_prefix(instr)?
        };
        Ok(format!("{}({})({})", prefix, callee_expr, args))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::{
        make_add, make_ref_imm, make_ref_param, make_ref_ret, make_ret, Imm, Param,
    };
    use crate::types::TypeStore;

    fn plus_module(store: &TypeStore) -> Vec<Symbol> {
        let i64_t = store.get_numeric(NumericType::Int64);
        let a = make_ref_param("a", i64_t.clone());
        let b = make_ref_param("b", i64_t.clone());
        let ret = make_ref_ret(i64_t.clone());
        vec![Symbol::proc(
            "plus",
            Proc {
                params: vec![
                    Param {
                        name: Atom::intern("a"),
                        ty: i64_t.clone(),
                    },
                    Param {
                        name: Atom::intern("b"),
                        ty: i64_t.clone(),
                    },
                ],
                ret: Param {
                    name: Atom::NONE,
                    ty: i64_t,
                },
                instrs: vec![make_add(ret, a, b), make_ret()],
                variadic: false,
            },
        )
        .with_vis(Visibility::Default)]
    }

    #[test]
    fn test_emit_plus() {
        let store = TypeStore::new();
        let src = emit_c(&plus_module(&store)).unwrap();
        assert!(src.contains("typedef signed long long i64;"));
        assert!(src.contains("i64 plus(i64 a, i64 b)"));
        assert!(src.contains("return _ret;"));
        assert!(src.contains(" + "));
    }

    #[test]
    fn test_emit_local_proc_is_static() {
        let store = TypeStore::new();
        let mut symbols = plus_module(&store);
        symbols[0].vis = Visibility::Local;
        // A local-only proc is unreachable, nothing should be emitted.
        let src = emit_c(&symbols).unwrap();
        assert!(!src.contains("plus("));
    }

    #[test]
    fn test_emit_extern_on_first_use() {
        let store = TypeStore::new();
        let i64_t = store.get_numeric(NumericType::Int64);
        let i8_t = store.get_numeric(NumericType::Int8);
        let str_t = store.get_pointer(i8_t);
        let printf_t = store.get_procedure(crate::types::ProcInfo {
            param_types: vec![str_t.clone()],
            ret_t: store.get_numeric(NumericType::Int32),
            call_conv: crate::types::CallConv::Cdecl,
            variadic: true,
        });

        let ret = make_ref_ret(i64_t.clone());
        let callee = ir::make_ref_global("printf", printf_t);
        let fmt = ir::make_ref_global("fmt", str_t.clone());
        let call = ir::make_call(
            ret,
            callee,
            vec![fmt, make_ref_imm(Imm::from_i64(7), i64_t.clone())],
        );

        let symbols = vec![
            Symbol::extern_(
                "printf",
                ir::Extern {
                    lib: Atom::intern("c"),
                    kind: ir::ExternKind::Proc {
                        param_types: vec![str_t.clone()],
                        ret_t: store.get_numeric(NumericType::Int32),
                        variadic: true,
                    },
                },
            ),
            Symbol::data(
                "fmt",
                ir::Data {
                    ty: str_t.clone(),
                    bytes: Some(vec![0; 8]),
                    relocs: vec![],
                    read_only: true,
                },
            ),
            Symbol::proc(
                "main",
                Proc {
                    params: vec![],
                    ret: Param {
                        name: Atom::NONE,
                        ty: i64_t,
                    },
                    instrs: vec![call, make_ret()],
                    variadic: false,
                },
            )
            .with_vis(Visibility::Default),
        ];

        let src = emit_c(&symbols).unwrap();
        assert!(src.contains("extern i32 printf(i8*, ...);"));
        assert!(src.contains("i64 main()"));
    }
}
