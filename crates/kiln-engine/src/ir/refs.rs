//! Instruction operands.
//!
//! A [`Ref`] names a storage location (or inline value) together with its
//! static type. Refs may be indirect: `indir` counts pointer dereferences,
//! with `offset` applied to the base address before the dereference chain
//! and `post_offset` after it.

use crate::atom::Atom;
use crate::types::{NumericType, TypeRef};

/// Inline 64-bit immediate, reinterpreted through the ref's type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Imm {
    bits: u64,
}

impl Imm {
    pub fn from_bits(bits: u64) -> Imm {
        Imm { bits }
    }

    pub fn from_i64(v: i64) -> Imm {
        Imm { bits: v as u64 }
    }

    pub fn from_u64(v: u64) -> Imm {
        Imm { bits: v }
    }

    pub fn from_f64(v: f64) -> Imm {
        Imm { bits: v.to_bits() }
    }

    pub fn from_f32(v: f32) -> Imm {
        Imm {
            bits: v.to_bits() as u64,
        }
    }

    pub fn bits(self) -> u64 {
        self.bits
    }

    pub fn as_i64(self) -> i64 {
        self.bits as i64
    }

    pub fn as_f64(self) -> f64 {
        f64::from_bits(self.bits)
    }

    pub fn as_f32(self) -> f32 {
        f32::from_bits(self.bits as u32)
    }

    /// The low `value_type.size()` bytes, little-endian.
    pub fn bytes(self, value_type: NumericType) -> Vec<u8> {
        self.bits.to_le_bytes()[..value_type.size() as usize].to_vec()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum RefKind {
    /// No operand.
    Null,
    /// Named local of the enclosing procedure.
    Local(Atom),
    /// Named parameter of the enclosing procedure.
    Param(Atom),
    /// The return slot.
    Ret,
    /// Module-level symbol: procedure, data, or extern.
    Global(Atom),
    /// Inline immediate.
    Imm(Imm),
    /// Separates fixed from variadic arguments in a call's argument list.
    VariadicMarker,
}

/// A typed operand.
#[derive(Debug, Clone)]
pub struct Ref {
    pub kind: RefKind,
    pub ty: TypeRef,
    pub offset: u64,
    pub post_offset: u64,
    pub indir: u8,
}

impl Ref {
    fn direct(kind: RefKind, ty: TypeRef) -> Ref {
        Ref {
            kind,
            ty,
            offset: 0,
            post_offset: 0,
            indir: 0,
        }
    }

    /// One more dereference, reading the result as `ty`.
    pub fn deref(mut self, ty: TypeRef) -> Ref {
        self.indir += 1;
        self.ty = ty;
        self
    }

    /// Add to the pre-dereference offset.
    pub fn with_offset(mut self, offset: u64) -> Ref {
        self.offset += offset;
        self
    }

    /// Add to the post-dereference offset.
    pub fn with_post_offset(mut self, post_offset: u64) -> Ref {
        self.post_offset += post_offset;
        self
    }

    pub fn is_null(&self) -> bool {
        matches!(self.kind, RefKind::Null)
    }
}

pub fn make_ref_null(ty: TypeRef) -> Ref {
    Ref::direct(RefKind::Null, ty)
}

pub fn make_ref_local(sym: impl Into<Atom>, ty: TypeRef) -> Ref {
    Ref::direct(RefKind::Local(sym.into()), ty)
}

pub fn make_ref_param(sym: impl Into<Atom>, ty: TypeRef) -> Ref {
    Ref::direct(RefKind::Param(sym.into()), ty)
}

pub fn make_ref_ret(ty: TypeRef) -> Ref {
    Ref::direct(RefKind::Ret, ty)
}

pub fn make_ref_global(sym: impl Into<Atom>, ty: TypeRef) -> Ref {
    Ref::direct(RefKind::Global(sym.into()), ty)
}

pub fn make_ref_imm(imm: Imm, ty: TypeRef) -> Ref {
    Ref::direct(RefKind::Imm(imm), ty)
}

pub fn make_variadic_marker(void_t: TypeRef) -> Ref {
    Ref::direct(RefKind::VariadicMarker, void_t)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{NumericType, TypeStore};

    #[test]
    fn test_imm_round_trips() {
        assert_eq!(Imm::from_i64(-5).as_i64(), -5);
        assert_eq!(Imm::from_f64(3.25).as_f64(), 3.25);
        assert_eq!(Imm::from_f32(1.5).as_f32(), 1.5);
        assert_eq!(Imm::from_i64(0x1122).bytes(NumericType::Int16), vec![0x22, 0x11]);
    }

    #[test]
    fn test_deref_chains() {
        let store = TypeStore::new();
        let f64_t = store.get_numeric(NumericType::Float64);
        let ptr_t = store.get_pointer(f64_t.clone());

        let r = make_ref_param("v", ptr_t)
            .deref(f64_t.clone())
            .with_post_offset(8);
        assert_eq!(r.indir, 1);
        assert_eq!(r.post_offset, 8);
        assert_eq!(r.ty.id, f64_t.id);
    }
}
