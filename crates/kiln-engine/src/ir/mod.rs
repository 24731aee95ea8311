//! The in-memory program representation.
//!
//! A module is an ordered list of [`Symbol`]s (procedures, data, externs).
//! Frontends build instruction streams out of [`Ref`]s and the `make_*`
//! factory functions, then hand complete symbols to the pipeline. Label
//! resolution is late: jumps carry names (or relative offsets) that the
//! backends resolve against `label` instructions.

pub mod inspect;
pub mod instr;
pub mod pic;
pub mod refs;
pub mod symbol;

pub use instr::{
    make_add, make_alloc, make_and, make_call, make_cmp_eq, make_cmp_ge, make_cmp_gt, make_cmp_le,
    make_cmp_lt, make_cmp_ne, make_comment, make_div, make_ext, make_fp2i, make_i2fp, make_jmp,
    make_jmpnz, make_jmpz, make_label, make_lea, make_load, make_lsh, make_mod, make_mov, make_mul,
    make_neg, make_nop, make_or, make_ret, make_rsh, make_store, make_sub, make_syscall,
    make_trunc, make_xor, Arg, Instr, Label, Opcode,
};
pub use pic::{collect_labels, convert_to_pic};
pub use refs::{
    make_ref_global, make_ref_imm, make_ref_local, make_ref_null, make_ref_param, make_ref_ret,
    make_variadic_marker, Imm, Ref, RefKind,
};
pub use symbol::{Data, Extern, ExternKind, Param, Proc, Reloc, Symbol, SymbolKind, Visibility};

use rustc_hash::FxHashSet;

use crate::error::{Error, Result};

/// Find a symbol by name in declaration order.
pub fn find_symbol(symbols: &[Symbol], name: crate::atom::Atom) -> Option<&Symbol> {
    symbols.iter().find(|s| s.name == name)
}

/// Validate a symbol list: names must be unique, and every named jump
/// target inside a procedure must resolve to a label in that procedure.
pub fn validate_symbols(symbols: &[Symbol]) -> Result<()> {
    let mut seen = FxHashSet::default();
    for sym in symbols {
        if !seen.insert(sym.name) {
            return Err(Error::Link(format!(
                "duplicate symbol `{}`",
                sym.name.as_str()
            )));
        }
        if let SymbolKind::Proc(proc) = &sym.kind {
            validate_proc(sym.name, proc)?;
        }
    }
    Ok(())
}

fn validate_proc(name: crate::atom::Atom, proc: &Proc) -> Result<()> {
    let labels: FxHashSet<_> = collect_labels(&proc.instrs)
        .into_iter()
        .map(|(label, _)| label)
        .collect();

    for (idx, instr) in proc.instrs.iter().enumerate() {
        if !instr.code.is_jump() {
            continue;
        }
        for arg in &instr.args {
            match arg {
                Arg::Label(target) if !labels.contains(target) => {
                    return Err(Error::Link(format!(
                        "proc `{}`: jump to unknown label `@{}`",
                        name.as_str(),
                        target
                    )));
                }
                Arg::LabelRel(offset) => {
                    let target = idx as i64 + *offset as i64;
                    if target < 0 || target >= proc.instrs.len() as i64 {
                        return Err(Error::Link(format!(
                            "proc `{}`: relative jump out of range ({:+})",
                            name.as_str(),
                            offset
                        )));
                    }
                }
                _ => {}
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::atom::Atom;
    use crate::types::{NumericType, TypeStore};

    fn empty_proc(store: &TypeStore, instrs: Vec<Instr>) -> Proc {
        Proc {
            params: vec![],
            ret: Param {
                name: Atom::NONE,
                ty: store.get_void(),
            },
            instrs,
            variadic: false,
        }
    }

    #[test]
    fn test_validate_duplicate_symbol() {
        let store = TypeStore::new();
        let symbols = vec![
            Symbol::proc("f", empty_proc(&store, vec![make_ret()])),
            Symbol::proc("f", empty_proc(&store, vec![make_ret()])),
        ];
        assert!(matches!(
            validate_symbols(&symbols),
            Err(Error::Link(_))
        ));
    }

    #[test]
    fn test_validate_unknown_label() {
        let store = TypeStore::new();
        let symbols = vec![Symbol::proc(
            "f",
            empty_proc(
                &store,
                vec![make_jmp(Label::Abs(Atom::intern("nowhere"))), make_ret()],
            ),
        )];
        assert!(validate_symbols(&symbols).is_err());
    }

    #[test]
    fn test_validate_ok() {
        let store = TypeStore::new();
        let i64_t = store.get_numeric(NumericType::Int64);
        let cond = make_ref_imm(Imm::from_i64(0), i64_t);
        let symbols = vec![Symbol::proc(
            "f",
            empty_proc(
                &store,
                vec![
                    make_label("top"),
                    make_jmpnz(cond, Label::Abs(Atom::intern("top"))),
                    make_ret(),
                ],
            ),
        )];
        assert!(validate_symbols(&symbols).is_ok());
    }

    #[test]
    fn test_find_symbol() {
        let store = TypeStore::new();
        let symbols = vec![Symbol::proc("f", empty_proc(&store, vec![make_ret()]))];
        assert!(find_symbol(&symbols, Atom::intern("f")).is_some());
        assert!(find_symbol(&symbols, Atom::intern("g")).is_none());
    }
}
