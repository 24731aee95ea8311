//! Instructions and their factory functions.
//!
//! An instruction is an opcode plus up to three arguments. By convention
//! `args[0]` is the destination, `args[1]` and `args[2]` are sources; jumps
//! keep their condition in `args[1]` and target in `args[2]`.
//!
//! Factories return plain values and never touch a module; the frontend
//! collects them into a procedure's instruction stream.

use crate::atom::Atom;
use crate::ir::refs::Ref;
use crate::types::TypeRef;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Opcode {
    Nop,
    Ret,

    Jmp,
    Jmpz,
    Jmpnz,

    Call,

    Alloc,
    Load,
    Store,
    Mov,
    Lea,

    Neg,
    Add,
    Sub,
    Mul,
    Div,
    Mod,

    And,
    Or,
    Xor,
    Lsh,
    Rsh,

    CmpEq,
    CmpNe,
    CmpLt,
    CmpLe,
    CmpGt,
    CmpGe,

    Ext,
    Trunc,
    Fp2i,
    I2fp,

    Syscall,

    Label,
    Comment,
}

impl Opcode {
    pub fn name(self) -> &'static str {
        match self {
            Opcode::Nop => "nop",
            Opcode::Ret => "ret",
            Opcode::Jmp => "jmp",
            Opcode::Jmpz => "jmpz",
            Opcode::Jmpnz => "jmpnz",
            Opcode::Call => "call",
            Opcode::Alloc => "alloc",
            Opcode::Load => "load",
            Opcode::Store => "store",
            Opcode::Mov => "mov",
            Opcode::Lea => "lea",
            Opcode::Neg => "neg",
            Opcode::Add => "add",
            Opcode::Sub => "sub",
            Opcode::Mul => "mul",
            Opcode::Div => "div",
            Opcode::Mod => "mod",
            Opcode::And => "and",
            Opcode::Or => "or",
            Opcode::Xor => "xor",
            Opcode::Lsh => "lsh",
            Opcode::Rsh => "rsh",
            Opcode::CmpEq => "cmp_eq",
            Opcode::CmpNe => "cmp_ne",
            Opcode::CmpLt => "cmp_lt",
            Opcode::CmpLe => "cmp_le",
            Opcode::CmpGt => "cmp_gt",
            Opcode::CmpGe => "cmp_ge",
            Opcode::Ext => "ext",
            Opcode::Trunc => "trunc",
            Opcode::Fp2i => "fp2i",
            Opcode::I2fp => "i2fp",
            Opcode::Syscall => "syscall",
            Opcode::Label => "label",
            Opcode::Comment => "comment",
        }
    }

    pub fn is_jump(self) -> bool {
        matches!(self, Opcode::Jmp | Opcode::Jmpz | Opcode::Jmpnz)
    }
}

/// Jump target: a named label or an instruction-relative offset.
///
/// Relative labels keep pasted instruction templates self-contained; see
/// [`convert_to_pic`](crate::ir::convert_to_pic).
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Label {
    Abs(Atom),
    Rel(i32),
}

#[derive(Debug, Clone, Default)]
pub enum Arg {
    #[default]
    None,
    Ref(Ref),
    RefArray(Vec<Ref>),
    Label(Atom),
    LabelRel(i32),
    Type(TypeRef),
    Str(String),
}

impl Arg {
    fn label(label: Label) -> Arg {
        match label {
            Label::Abs(name) => Arg::Label(name),
            Label::Rel(offset) => Arg::LabelRel(offset),
        }
    }

    pub fn as_ref(&self) -> Option<&Ref> {
        match self {
            Arg::Ref(r) => Some(r),
            _ => None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct Instr {
    pub code: Opcode,
    pub args: [Arg; 3],
}

impl Instr {
    pub fn new(code: Opcode, args: [Arg; 3]) -> Instr {
        Instr { code, args }
    }

    /// Destination ref, when the instruction has one.
    pub fn dst(&self) -> Option<&Ref> {
        self.args[0].as_ref().filter(|r| !r.is_null())
    }
}

pub fn make_nop() -> Instr {
    Instr::new(Opcode::Nop, [Arg::None, Arg::None, Arg::None])
}

pub fn make_ret() -> Instr {
    Instr::new(Opcode::Ret, [Arg::None, Arg::None, Arg::None])
}

pub fn make_jmp(label: Label) -> Instr {
    Instr::new(Opcode::Jmp, [Arg::None, Arg::None, Arg::label(label)])
}

pub fn make_jmpz(cond: Ref, label: Label) -> Instr {
    Instr::new(Opcode::Jmpz, [Arg::None, Arg::Ref(cond), Arg::label(label)])
}

pub fn make_jmpnz(cond: Ref, label: Label) -> Instr {
    Instr::new(Opcode::Jmpnz, [Arg::None, Arg::Ref(cond), Arg::label(label)])
}

pub fn make_call(dst: Ref, proc: Ref, args: Vec<Ref>) -> Instr {
    Instr::new(
        Opcode::Call,
        [Arg::Ref(dst), Arg::Ref(proc), Arg::RefArray(args)],
    )
}

pub fn make_alloc(dst: Ref, ty: TypeRef) -> Instr {
    Instr::new(Opcode::Alloc, [Arg::Ref(dst), Arg::Type(ty), Arg::None])
}

pub fn make_load(dst: Ref, ptr: Ref) -> Instr {
    Instr::new(Opcode::Load, [Arg::Ref(dst), Arg::Ref(ptr), Arg::None])
}

pub fn make_store(dst: Ref, src: Ref) -> Instr {
    Instr::new(Opcode::Store, [Arg::Ref(dst), Arg::Ref(src), Arg::None])
}

pub fn make_mov(dst: Ref, src: Ref) -> Instr {
    Instr::new(Opcode::Mov, [Arg::Ref(dst), Arg::Ref(src), Arg::None])
}

pub fn make_lea(dst: Ref, src: Ref) -> Instr {
    Instr::new(Opcode::Lea, [Arg::Ref(dst), Arg::Ref(src), Arg::None])
}

fn unary(code: Opcode, dst: Ref, arg: Ref) -> Instr {
    Instr::new(code, [Arg::Ref(dst), Arg::Ref(arg), Arg::None])
}

fn binary(code: Opcode, dst: Ref, lhs: Ref, rhs: Ref) -> Instr {
    Instr::new(code, [Arg::Ref(dst), Arg::Ref(lhs), Arg::Ref(rhs)])
}

pub fn make_neg(dst: Ref, arg: Ref) -> Instr {
    unary(Opcode::Neg, dst, arg)
}

pub fn make_add(dst: Ref, lhs: Ref, rhs: Ref) -> Instr {
    binary(Opcode::Add, dst, lhs, rhs)
}

pub fn make_sub(dst: Ref, lhs: Ref, rhs: Ref) -> Instr {
    binary(Opcode::Sub, dst, lhs, rhs)
}

pub fn make_mul(dst: Ref, lhs: Ref, rhs: Ref) -> Instr {
    binary(Opcode::Mul, dst, lhs, rhs)
}

pub fn make_div(dst: Ref, lhs: Ref, rhs: Ref) -> Instr {
    binary(Opcode::Div, dst, lhs, rhs)
}

pub fn make_mod(dst: Ref, lhs: Ref, rhs: Ref) -> Instr {
    binary(Opcode::Mod, dst, lhs, rhs)
}

pub fn make_and(dst: Ref, lhs: Ref, rhs: Ref) -> Instr {
    binary(Opcode::And, dst, lhs, rhs)
}

pub fn make_or(dst: Ref, lhs: Ref, rhs: Ref) -> Instr {
    binary(Opcode::Or, dst, lhs, rhs)
}

pub fn make_xor(dst: Ref, lhs: Ref, rhs: Ref) -> Instr {
    binary(Opcode::Xor, dst, lhs, rhs)
}

pub fn make_lsh(dst: Ref, lhs: Ref, rhs: Ref) -> Instr {
    binary(Opcode::Lsh, dst, lhs, rhs)
}

pub fn make_rsh(dst: Ref, lhs: Ref, rhs: Ref) -> Instr {
    binary(Opcode::Rsh, dst, lhs, rhs)
}

pub fn make_cmp_eq(dst: Ref, lhs: Ref, rhs: Ref) -> Instr {
    binary(Opcode::CmpEq, dst, lhs, rhs)
}

pub fn make_cmp_ne(dst: Ref, lhs: Ref, rhs: Ref) -> Instr {
    binary(Opcode::CmpNe, dst, lhs, rhs)
}

pub fn make_cmp_lt(dst: Ref, lhs: Ref, rhs: Ref) -> Instr {
    binary(Opcode::CmpLt, dst, lhs, rhs)
}

pub fn make_cmp_le(dst: Ref, lhs: Ref, rhs: Ref) -> Instr {
    binary(Opcode::CmpLe, dst, lhs, rhs)
}

pub fn make_cmp_gt(dst: Ref, lhs: Ref, rhs: Ref) -> Instr {
    binary(Opcode::CmpGt, dst, lhs, rhs)
}

pub fn make_cmp_ge(dst: Ref, lhs: Ref, rhs: Ref) -> Instr {
    binary(Opcode::CmpGe, dst, lhs, rhs)
}

pub fn make_ext(dst: Ref, src: Ref) -> Instr {
    unary(Opcode::Ext, dst, src)
}

pub fn make_trunc(dst: Ref, src: Ref) -> Instr {
    unary(Opcode::Trunc, dst, src)
}

pub fn make_fp2i(dst: Ref, src: Ref) -> Instr {
    unary(Opcode::Fp2i, dst, src)
}

pub fn make_i2fp(dst: Ref, src: Ref) -> Instr {
    unary(Opcode::I2fp, dst, src)
}

pub fn make_syscall(dst: Ref, n: Ref, args: Vec<Ref>) -> Instr {
    Instr::new(
        Opcode::Syscall,
        [Arg::Ref(dst), Arg::Ref(n), Arg::RefArray(args)],
    )
}

pub fn make_label(name: impl Into<Atom>) -> Instr {
    Instr::new(
        Opcode::Label,
        [Arg::None, Arg::Label(name.into()), Arg::None],
    )
}

pub fn make_comment(text: impl Into<String>) -> Instr {
    Instr::new(
        Opcode::Comment,
        [Arg::None, Arg::Str(text.into()), Arg::None],
    )
}
