//! Textual rendering of IR.
//!
//! Symbols print in the same syntax the textual-IR parser reads, so a
//! printed module can be fed back through `compile_string_ir` (modulo
//! anonymous symbols, which print with a generated placeholder name).

use std::fmt::{self, Write};

use crate::atom::Atom;
use crate::ir::instr::{Arg, Instr, Opcode};
use crate::ir::refs::{Ref, RefKind};
use crate::ir::symbol::{Data, ExternKind, Proc, Reloc, Symbol, SymbolKind};
use crate::types::{NumericType, TypeKind, TypeRef};

/// Escape a string for a double-quoted literal.
pub fn escape_str(out: &mut impl Write, s: &str) -> fmt::Result {
    for c in s.chars() {
        match c {
            '\n' => out.write_str("\\n")?,
            '\t' => out.write_str("\\t")?,
            '\0' => out.write_str("\\0")?,
            '\\' => out.write_str("\\\\")?,
            '"' => out.write_str("\\\"")?,
            _ => out.write_char(c)?,
        }
    }
    Ok(())
}

/// Print a symbol name, substituting a stable placeholder for anonymous
/// atoms (whose interned string is empty).
pub fn write_symbol_name(out: &mut impl Write, name: Atom) -> fmt::Result {
    let s = name.as_str();
    if s.is_empty() {
        write!(out, "__kiln_anon_{}__", name.id())
    } else {
        out.write_str(s)
    }
}

fn write_place(out: &mut impl Write, r: &Ref) -> fmt::Result {
    for _ in 0..r.indir {
        out.write_str("[")?;
    }
    match &r.kind {
        RefKind::Local(sym) | RefKind::Param(sym) => write!(out, "%{}", sym)?,
        RefKind::Global(sym) => {
            out.write_str("$")?;
            write_symbol_name(out, *sym)?;
        }
        RefKind::Ret => out.write_str("ret")?,
        RefKind::Imm(imm) => {
            let value_type = r.ty.as_numeric().unwrap_or(NumericType::Int64);
            write_numeric(out, &imm.bits().to_le_bytes(), value_type)?;
        }
        RefKind::Null | RefKind::VariadicMarker => {}
    }
    if r.offset != 0 {
        write!(out, "+{}", r.offset)?;
    }
    for _ in 0..r.indir {
        out.write_str("]")?;
    }
    if r.post_offset != 0 {
        write!(out, "+{}", r.post_offset)?;
    }
    Ok(())
}

/// Print one ref as `:type place`.
pub fn write_ref(out: &mut impl Write, r: &Ref) -> fmt::Result {
    match r.kind {
        RefKind::Null => return Ok(()),
        RefKind::VariadicMarker => return out.write_str("..."),
        _ => {}
    }
    write!(out, ":{} ", r.ty)?;
    write_place(out, r)
}

fn write_arg(out: &mut impl Write, arg: &Arg) -> fmt::Result {
    match arg {
        Arg::None => Ok(()),
        Arg::Ref(r) => write_ref(out, r),
        Arg::RefArray(refs) => {
            out.write_str("(")?;
            for (i, r) in refs.iter().enumerate() {
                if i > 0 {
                    out.write_str(", ")?;
                }
                write_ref(out, r)?;
            }
            out.write_str(")")
        }
        Arg::Label(name) => write!(out, "@{}", name),
        Arg::LabelRel(offset) => {
            if *offset >= 0 {
                write!(out, "@+{}", offset)
            } else {
                write!(out, "@{}", offset)
            }
        }
        Arg::Type(ty) => write!(out, ":{}", ty),
        Arg::Str(s) => {
            out.write_str("\"")?;
            escape_str(out, s)?;
            out.write_str("\"")
        }
    }
}

/// Print one instruction (no trailing newline).
pub fn write_instr(out: &mut impl Write, instr: &Instr) -> fmt::Result {
    match instr.code {
        Opcode::Label => {
            if let Arg::Label(name) = &instr.args[1] {
                return write!(out, "@{}:", name);
            }
            Ok(())
        }
        Opcode::Comment => {
            if let Arg::Str(text) = &instr.args[1] {
                return write!(out, "// {}", text);
            }
            Ok(())
        }
        code => {
            write!(out, "    {}", code.name())?;
            let mut first = true;
            for arg in &instr.args[1..] {
                if matches!(arg, Arg::None) {
                    continue;
                }
                if let Arg::Ref(r) = arg {
                    if r.is_null() {
                        continue;
                    }
                }
                out.write_str(if first { " " } else { ", " })?;
                first = false;
                write_arg(out, arg)?;
            }
            if let Some(dst) = instr.dst() {
                out.write_str(" -> ")?;
                write_ref(out, dst)?;
            }
            Ok(())
        }
    }
}

fn write_numeric(out: &mut impl Write, bytes: &[u8], value_type: NumericType) -> fmt::Result {
    let mut raw = [0u8; 8];
    let n = (value_type.size() as usize).min(bytes.len());
    raw[..n].copy_from_slice(&bytes[..n]);
    let bits = u64::from_le_bytes(raw);
    match value_type {
        NumericType::Int8 => write!(out, "{}", bits as u8 as i8),
        NumericType::Uint8 => write!(out, "{}", bits as u8),
        NumericType::Int16 => write!(out, "{}", bits as u16 as i16),
        NumericType::Uint16 => write!(out, "{}", bits as u16),
        NumericType::Int32 => write!(out, "{}", bits as u32 as i32),
        NumericType::Uint32 => write!(out, "{}", bits as u32),
        NumericType::Int64 => write!(out, "{}", bits as i64),
        NumericType::Uint64 => write!(out, "{}", bits),
        NumericType::Float32 => write!(out, "{:?}", f32::from_bits(bits as u32)),
        NumericType::Float64 => write!(out, "{:?}", f64::from_bits(bits)),
    }
}

fn write_value(
    out: &mut impl Write,
    bytes: &[u8],
    base_offset: u64,
    relocs: &[Reloc],
    ty: &TypeRef,
) -> fmt::Result {
    match &ty.kind {
        TypeKind::Aggregate(elems) => {
            out.write_str("{")?;
            for (i, elem) in elems.iter().enumerate() {
                if i > 0 {
                    out.write_str(", ")?;
                }
                let mut offset = base_offset + elem.offset;
                let is_string =
                    matches!(elem.ty.kind, TypeKind::Numeric(n) if n.size() == 1) && elem.count > 1;
                if is_string {
                    let start = offset as usize;
                    let end = start + elem.count as usize;
                    let text: String = bytes[start..end.min(bytes.len())]
                        .iter()
                        .map(|&b| b as char)
                        .collect();
                    out.write_str("\"")?;
                    escape_str(out, &text)?;
                    out.write_str("\"")?;
                    continue;
                }
                if elem.count > 1 {
                    out.write_str("[")?;
                }
                for c in 0..elem.count {
                    if c > 0 {
                        out.write_str(", ")?;
                    }
                    if let Some(reloc) = relocs.iter().find(|r| r.offset == offset) {
                        out.write_str("$")?;
                        write_symbol_name(out, reloc.sym)?;
                    } else {
                        write_value(out, bytes, offset, relocs, &elem.ty)?;
                    }
                    offset += elem.ty.size;
                }
                if elem.count > 1 {
                    out.write_str("]")?;
                }
            }
            out.write_str("}")
        }
        TypeKind::Numeric(value_type) => {
            let start = base_offset as usize;
            write_numeric(out, &bytes[start.min(bytes.len())..], *value_type)
        }
        TypeKind::Pointer(_) | TypeKind::Procedure(_) => {
            if let Some(reloc) = relocs.iter().find(|r| r.offset == base_offset) {
                out.write_str("$")?;
                write_symbol_name(out, reloc.sym)
            } else {
                let start = base_offset as usize;
                write_numeric(out, &bytes[start.min(bytes.len())..], NumericType::Uint64)
            }
        }
    }
}

fn write_proc(out: &mut impl Write, name: Atom, proc: &Proc) -> fmt::Result {
    out.write_str("proc $")?;
    write_symbol_name(out, name)?;
    out.write_str("(")?;
    for (i, param) in proc.params.iter().enumerate() {
        if i > 0 {
            out.write_str(", ")?;
        }
        write!(out, ":{}", param.ty)?;
        if !param.name.is_none() {
            write!(out, " %{}", param.name)?;
        }
    }
    if proc.variadic {
        if !proc.params.is_empty() {
            out.write_str(", ")?;
        }
        out.write_str("...")?;
    }
    write!(out, ") :{}", proc.ret.ty)?;
    if !proc.ret.name.is_none() {
        write!(out, " %{}", proc.ret.name)?;
    }
    out.write_str(" {\n")?;
    for instr in &proc.instrs {
        write_instr(out, instr)?;
        out.write_str("\n")?;
    }
    out.write_str("}")
}

fn write_data(out: &mut impl Write, name: Atom, data: &Data) -> fmt::Result {
    out.write_str(if data.read_only { "const $" } else { "data $" })?;
    write_symbol_name(out, name)?;
    write!(out, " :{}", data.ty)?;
    if let Some(bytes) = &data.bytes {
        out.write_str(" = ")?;
        write_value(out, bytes, 0, &data.relocs, &data.ty)?;
    }
    Ok(())
}

/// Print one symbol (no trailing newline).
pub fn write_symbol(out: &mut impl Write, sym: &Symbol) -> fmt::Result {
    if let Some(keyword) = sym.vis.keyword() {
        write!(out, "{} ", keyword)?;
    }
    if sym.thread_local {
        out.write_str("thread_local ")?;
    }
    match &sym.kind {
        SymbolKind::Proc(proc) => write_proc(out, sym.name, proc),
        SymbolKind::Data(data) => write_data(out, sym.name, data),
        SymbolKind::Extern(ext) => {
            out.write_str("extern ")?;
            if !ext.lib.is_none() {
                out.write_str("\"")?;
                escape_str(out, ext.lib.as_str())?;
                out.write_str("\" ")?;
            }
            match &ext.kind {
                ExternKind::Proc {
                    param_types,
                    ret_t,
                    variadic,
                } => {
                    out.write_str("proc $")?;
                    write_symbol_name(out, sym.name)?;
                    out.write_str("(")?;
                    for (i, ty) in param_types.iter().enumerate() {
                        if i > 0 {
                            out.write_str(", ")?;
                        }
                        write!(out, ":{}", ty)?;
                    }
                    if *variadic {
                        if !param_types.is_empty() {
                            out.write_str(", ")?;
                        }
                        out.write_str("...")?;
                    }
                    write!(out, ") :{}", ret_t)
                }
                ExternKind::Data { ty } => {
                    out.write_str("data $")?;
                    write_symbol_name(out, sym.name)?;
                    write!(out, " :{}", ty)
                }
            }
        }
    }
}

/// Print every symbol of a module, blank-line separated.
pub fn write_symbols(out: &mut impl Write, symbols: &[Symbol]) -> fmt::Result {
    for sym in symbols {
        out.write_str("\n")?;
        write_symbol(out, sym)?;
        out.write_str("\n")?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::instr::{make_add, make_ret};
    use crate::ir::refs::{make_ref_param, make_ref_ret};
    use crate::ir::symbol::Param;
    use crate::types::TypeStore;

    fn plus_symbol(store: &TypeStore) -> Symbol {
        let i64_t = store.get_numeric(NumericType::Int64);
        let a = make_ref_param("a", i64_t.clone());
        let b = make_ref_param("b", i64_t.clone());
        let ret = make_ref_ret(i64_t.clone());
        Symbol::proc(
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
                    ty: i64_t.clone(),
                },
                instrs: vec![make_add(ret, a, b), make_ret()],
                variadic: false,
            },
        )
        .with_vis(crate::ir::symbol::Visibility::Default)
    }

    #[test]
    fn test_proc_rendering() {
        let store = TypeStore::new();
        let mut out = String::new();
        write_symbol(&mut out, &plus_symbol(&store)).unwrap();
        assert_eq!(
            out,
            "pub proc $plus(:i64 %a, :i64 %b) :i64 {\n    add :i64 %a, :i64 %b -> :i64 ret\n    ret\n}"
        );
    }

    #[test]
    fn test_data_rendering() {
        let store = TypeStore::new();
        let i8_t = store.get_numeric(NumericType::Int8);
        let str_t = store.get_aggregate(&[(i8_t, 6)]);
        let sym = Symbol::data(
            "greeting",
            Data {
                ty: str_t,
                bytes: Some(b"hi\n\0\0\0".to_vec()),
                relocs: vec![],
                read_only: true,
            },
        );
        let mut out = String::new();
        write_symbol(&mut out, &sym).unwrap();
        assert_eq!(out, "const $greeting :{[6]i8} = {\"hi\\n\\0\\0\\0\"}");
    }

    #[test]
    fn test_escape() {
        let mut out = String::new();
        escape_str(&mut out, "a\n\t\"b\\").unwrap();
        assert_eq!(out, "a\\n\\t\\\"b\\\\");
    }
}
