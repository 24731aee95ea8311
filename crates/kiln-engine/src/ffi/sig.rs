//! Call signature construction from IR types.
//!
//! Signatures classify every parameter and the return value into System V
//! AMD64 register slots. Numerics and pointers take one slot; aggregates up
//! to 16 bytes are split into eightbytes, each classified SSE when it holds
//! only floating-point leaves and INTEGER otherwise; larger aggregates are
//! returned through a hidden pointer and rejected as by-value parameters
//! (register-only envelope, see the ffi module docs).

use std::sync::Arc;

use parking_lot::Mutex;
use rustc_hash::FxHashMap;

use crate::error::{Error, Result};
use crate::types::{NumericType, TypeKind, TypeRef};

/// Register class of one eightbyte.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlotClass {
    Int,
    Sse,
}

/// How one parameter is passed.
#[derive(Debug, Clone)]
pub struct ArgClass {
    pub ty: TypeRef,
    /// One entry per eightbyte of the value.
    pub slots: Vec<SlotClass>,
}

/// How the return value comes back.
#[derive(Debug, Clone)]
pub enum RetClass {
    Void,
    /// In registers, one entry per eightbyte (`rax`/`rdx`, `xmm0`/`xmm1`).
    Reg(Vec<SlotClass>),
    /// Through a hidden pointer passed as the first integer argument.
    Memory,
}

/// A classified call signature.
#[derive(Debug, Clone)]
pub struct CallSig {
    pub args: Vec<ArgClass>,
    pub ret: RetClass,
    pub ret_t: TypeRef,
    pub variadic: bool,
    /// Number of fixed (non-variadic) arguments.
    pub nfixed: usize,
}

/// Collect `(offset, is_float)` for every numeric/pointer leaf of a type.
fn collect_leaves(ty: &TypeRef, base: u64, out: &mut Vec<(u64, bool)>) {
    match &ty.kind {
        TypeKind::Numeric(n) => out.push((base, n.is_float())),
        TypeKind::Pointer(_) | TypeKind::Procedure(_) => out.push((base, false)),
        TypeKind::Aggregate(elems) => {
            for elem in elems {
                for c in 0..elem.count {
                    collect_leaves(&elem.ty, base + elem.offset + c * elem.ty.size, out);
                }
            }
        }
    }
}

fn classify_value(ty: &TypeRef) -> Result<Vec<SlotClass>> {
    match &ty.kind {
        TypeKind::Numeric(n) => Ok(vec![if n.is_float() {
            SlotClass::Sse
        } else {
            SlotClass::Int
        }]),
        TypeKind::Pointer(_) | TypeKind::Procedure(_) => Ok(vec![SlotClass::Int]),
        TypeKind::Aggregate(_) => {
            if ty.size == 0 {
                return Ok(vec![]);
            }
            if ty.size > 16 {
                return Err(Error::Ffi(format!(
                    "aggregate of {} bytes exceeds the register-passing envelope",
                    ty.size
                )));
            }
            let mut leaves = Vec::new();
            collect_leaves(ty, 0, &mut leaves);
            let mut slots = Vec::new();
            let mut offset = 0;
            while offset < ty.size {
                let all_float = leaves
                    .iter()
                    .filter(|(o, _)| *o >= offset && *o < offset + 8)
                    .all(|(_, is_float)| *is_float);
                slots.push(if all_float { SlotClass::Sse } else { SlotClass::Int });
                offset += 8;
            }
            Ok(slots)
        }
    }
}

fn classify_ret(ty: &TypeRef) -> Result<RetClass> {
    if ty.size == 0 {
        return Ok(RetClass::Void);
    }
    if ty.size > 16 {
        return Ok(RetClass::Memory);
    }
    Ok(RetClass::Reg(classify_value(ty)?))
}

/// Build a signature for `param_types` → `ret_t`. For a variadic call site,
/// `param_types` holds the actual argument types and `nfixed` how many of
/// them are fixed.
pub fn build_sig(
    param_types: &[TypeRef],
    ret_t: &TypeRef,
    variadic: bool,
    nfixed: usize,
) -> Result<CallSig> {
    let mut args = Vec::with_capacity(param_types.len());
    for ty in param_types {
        args.push(ArgClass {
            ty: ty.clone(),
            slots: classify_value(ty)?,
        });
    }
    Ok(CallSig {
        args,
        ret: classify_ret(ret_t)?,
        ret_t: ret_t.clone(),
        variadic,
        nfixed: if variadic { nfixed } else { param_types.len() },
    })
}

/// Signature cache, keyed by procedure type id.
///
/// Variadic call sites are classified per call (their trailing argument
/// types vary); everything else is amortized O(1).
#[derive(Default)]
pub struct SigCache {
    map: Mutex<FxHashMap<u32, Arc<CallSig>>>,
}

impl SigCache {
    pub fn new() -> SigCache {
        SigCache::default()
    }

    /// Signature for a (non-variadic) procedure type.
    pub fn get(&self, proc_t: &TypeRef) -> Result<Arc<CallSig>> {
        let info = proc_t
            .as_procedure()
            .ok_or_else(|| Error::Ffi("call through a non-procedure type".into()))?;

        if !info.variadic {
            let mut map = self.map.lock();
            if let Some(sig) = map.get(&proc_t.id) {
                return Ok(sig.clone());
            }
            let sig = Arc::new(build_sig(&info.param_types, &info.ret_t, false, 0)?);
            map.insert(proc_t.id, sig.clone());
            return Ok(sig);
        }

        Ok(Arc::new(build_sig(
            &info.param_types,
            &info.ret_t,
            true,
            info.param_types.len(),
        )?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{CallConv, ProcInfo, TypeStore};

    #[test]
    fn test_numeric_classification() {
        let store = TypeStore::new();
        let i64_t = store.get_numeric(NumericType::Int64);
        let f64_t = store.get_numeric(NumericType::Float64);
        let sig = build_sig(&[i64_t.clone(), f64_t.clone()], &i64_t, false, 0).unwrap();
        assert_eq!(sig.args[0].slots, vec![SlotClass::Int]);
        assert_eq!(sig.args[1].slots, vec![SlotClass::Sse]);
        assert!(matches!(&sig.ret, RetClass::Reg(slots) if slots == &vec![SlotClass::Int]));
    }

    #[test]
    fn test_small_aggregate_eightbytes() {
        let store = TypeStore::new();
        let f64_t = store.get_numeric(NumericType::Float64);
        let i32_t = store.get_numeric(NumericType::Int32);

        // {f64, f64} -> two SSE eightbytes.
        let vec2 = store.get_aggregate(&[(f64_t.clone(), 2)]);
        assert_eq!(
            classify_value(&vec2).unwrap(),
            vec![SlotClass::Sse, SlotClass::Sse]
        );

        // {i32, i32, f64} -> INT then SSE.
        let mixed = store.get_aggregate(&[(i32_t.clone(), 2), (f64_t.clone(), 1)]);
        assert_eq!(
            classify_value(&mixed).unwrap(),
            vec![SlotClass::Int, SlotClass::Sse]
        );
    }

    #[test]
    fn test_large_aggregate_param_rejected() {
        let store = TypeStore::new();
        let f64_t = store.get_numeric(NumericType::Float64);
        let big = store.get_aggregate(&[(f64_t.clone(), 4)]);
        assert!(classify_value(&big).is_err());
        // But returning it is fine: memory class.
        assert!(matches!(classify_ret(&big).unwrap(), RetClass::Memory));
    }

    #[test]
    fn test_cache_reuses_signature() {
        let store = TypeStore::new();
        let i64_t = store.get_numeric(NumericType::Int64);
        let proc_t = store.get_procedure(ProcInfo {
            param_types: vec![i64_t.clone()],
            ret_t: i64_t.clone(),
            call_conv: CallConv::Cdecl,
            variadic: false,
        });
        let cache = SigCache::new();
        let a = cache.get(&proc_t).unwrap();
        let b = cache.get(&proc_t).unwrap();
        assert!(Arc::ptr_eq(&a, &b));
    }
}
