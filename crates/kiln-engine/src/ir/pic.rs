//! Position-independent instruction templates.
//!
//! Code templates that get pasted into several procedures must not carry
//! named labels: the names would collide and resolve against the wrong
//! copy. [`convert_to_pic`] rewrites jump targets that resolve inside the
//! template into instruction-relative offsets; names that resolve outside
//! the template are left alone.

use rustc_hash::FxHashMap;

use crate::atom::Atom;
use crate::ir::instr::{Arg, Instr, Opcode};

/// Collect `(name, instruction index)` for every `label` instruction.
pub fn collect_labels(instrs: &[Instr]) -> Vec<(Atom, usize)> {
    instrs
        .iter()
        .enumerate()
        .filter_map(|(idx, instr)| match (instr.code, &instr.args[1]) {
            (Opcode::Label, Arg::Label(name)) => Some((*name, idx)),
            _ => None,
        })
        .collect()
}

/// Rewrite named jump targets to relative offsets where the label is
/// defined inside `instrs`.
pub fn convert_to_pic(instrs: &[Instr]) -> Vec<Instr> {
    let labels: FxHashMap<Atom, usize> = collect_labels(instrs).into_iter().collect();

    instrs
        .iter()
        .enumerate()
        .map(|(idx, instr)| {
            let mut copy = instr.clone();
            if copy.code.is_jump() {
                for arg in copy.args.iter_mut() {
                    if let Arg::Label(name) = arg {
                        if let Some(&target) = labels.get(name) {
                            *arg = Arg::LabelRel(target as i32 - idx as i32);
                        }
                    }
                }
            }
            copy
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::instr::{make_jmp, make_jmpz, make_label, make_nop, make_ret, Label};
    use crate::ir::refs::{make_ref_imm, Imm};
    use crate::types::{NumericType, TypeStore};

    #[test]
    fn test_collect_labels() {
        let instrs = vec![make_label("start"), make_nop(), make_label("end")];
        let labels = collect_labels(&instrs);
        assert_eq!(labels.len(), 2);
        assert_eq!(labels[0].1, 0);
        assert_eq!(labels[1].1, 2);
    }

    #[test]
    fn test_convert_to_pic_rewrites_internal_labels() {
        let store = TypeStore::new();
        let i64_t = store.get_numeric(NumericType::Int64);
        let cond = make_ref_imm(Imm::from_i64(1), i64_t);

        let instrs = vec![
            make_label("loop"),
            make_jmpz(cond, Label::Abs(Atom::intern("done"))),
            make_jmp(Label::Abs(Atom::intern("loop"))),
            make_label("done"),
            make_ret(),
        ];

        let pic = convert_to_pic(&instrs);
        match pic[1].args[2] {
            Arg::LabelRel(offset) => assert_eq!(offset, 2),
            ref other => panic!("expected relative label, got {:?}", other),
        }
        match pic[2].args[2] {
            Arg::LabelRel(offset) => assert_eq!(offset, -2),
            ref other => panic!("expected relative label, got {:?}", other),
        }
    }

    #[test]
    fn test_convert_to_pic_keeps_external_labels() {
        let instrs = vec![make_jmp(Label::Abs(Atom::intern("elsewhere")))];
        let pic = convert_to_pic(&instrs);
        assert!(matches!(pic[0].args[2], Arg::Label(_)));
    }
}
