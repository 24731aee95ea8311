//! Outgoing native calls.
//!
//! A pure in-process System V AMD64 caller: arguments are marshaled into
//! the six integer and eight SSE argument registers and the callee is
//! entered through one inline-asm sequence. `AL` carries the number of
//! vector registers used, which is what variadic callees consult. Calls
//! that would need stack-passed arguments are rejected up front.

use crate::error::{Error, Result};
use crate::ffi::sig::{CallSig, RetClass, SlotClass};
use crate::types::{NumericType, TypeKind};

pub const MAX_INT_SLOTS: usize = 6;
pub const MAX_SSE_SLOTS: usize = 8;

/// Raw register-file image for one call.
#[derive(Default)]
pub struct RegArgs {
    pub int: [u64; MAX_INT_SLOTS],
    pub sse: [u64; MAX_SSE_SLOTS],
    pub n_int: usize,
    pub n_sse: usize,
}

impl RegArgs {
    pub fn push_int(&mut self, value: u64) -> Result<()> {
        if self.n_int == MAX_INT_SLOTS {
            return Err(Error::Ffi(
                "call needs stack-passed integer arguments, which are unsupported".into(),
            ));
        }
        self.int[self.n_int] = value;
        self.n_int += 1;
        Ok(())
    }

    pub fn push_sse(&mut self, bits: u64) -> Result<()> {
        if self.n_sse == MAX_SSE_SLOTS {
            return Err(Error::Ffi(
                "call needs stack-passed vector arguments, which are unsupported".into(),
            ));
        }
        self.sse[self.n_sse] = bits;
        self.n_sse += 1;
        Ok(())
    }
}

/// Register-file image of a call's results.
pub struct RegRet {
    pub rax: u64,
    pub rdx: u64,
    pub xmm0: u64,
    pub xmm1: u64,
}

/// Enter `addr` with the given register image.
///
/// # Safety
///
/// `addr` must point at a function following the C calling convention whose
/// signature matches the marshaled registers.
#[cfg(target_arch = "x86_64")]
pub unsafe fn raw_call(addr: usize, regs: &RegArgs) -> RegRet {
    let mut rax: u64 = regs.n_sse as u64;
    let mut rdx: u64 = regs.int[2];
    let mut xmm0: u64 = regs.sse[0];
    let mut xmm1: u64 = regs.sse[1];

    std::arch::asm!(
        // The callee is entitled to a 16-aligned stack, and the 128-byte
        // red zone below rsp belongs to the enclosing Rust frame.
        "mov r15, rsp",
        "sub rsp, 128",
        "and rsp, -16",
        "call {f}",
        "mov rsp, r15",
        f = in(reg) addr,
        out("r15") _,
        inout("rax") rax,
        inout("rdi") regs.int[0] => _,
        inout("rsi") regs.int[1] => _,
        inout("rdx") rdx,
        inout("rcx") regs.int[3] => _,
        inout("r8") regs.int[4] => _,
        inout("r9") regs.int[5] => _,
        inout("xmm0") xmm0,
        inout("xmm1") xmm1,
        inout("xmm2") regs.sse[2] => _,
        inout("xmm3") regs.sse[3] => _,
        inout("xmm4") regs.sse[4] => _,
        inout("xmm5") regs.sse[5] => _,
        inout("xmm6") regs.sse[6] => _,
        inout("xmm7") regs.sse[7] => _,
        clobber_abi("C"),
    );

    RegRet {
        rax,
        rdx,
        xmm0,
        xmm1,
    }
}

#[cfg(not(target_arch = "x86_64"))]
pub unsafe fn raw_call(_addr: usize, _regs: &RegArgs) -> RegRet {
    unimplemented!("native calls are only implemented for x86_64")
}

fn supported() -> Result<()> {
    if cfg!(target_arch = "x86_64") {
        Ok(())
    } else {
        Err(Error::Unsupported(
            "native calls are only implemented for x86_64".into(),
        ))
    }
}

/// Read `size` bytes at `ptr` into the low bytes of a `u64`.
unsafe fn read_eightbyte(ptr: *const u8, size: usize) -> u64 {
    let mut raw = [0u8; 8];
    std::ptr::copy_nonoverlapping(ptr, raw.as_mut_ptr(), size.min(8));
    u64::from_le_bytes(raw)
}

/// Marshal one argument value into register slots.
fn marshal_arg(
    regs: &mut RegArgs,
    slots: &[SlotClass],
    ty_size: u64,
    is_f32: bool,
    ptr: *const u8,
) -> Result<()> {
    let mut remaining = ty_size as usize;
    for (i, slot) in slots.iter().enumerate() {
        let chunk = unsafe { read_eightbyte(ptr.add(i * 8), remaining.min(8)) };
        remaining = remaining.saturating_sub(8);
        match slot {
            SlotClass::Int => regs.push_int(chunk)?,
            SlotClass::Sse => {
                // An f32 travels in the low 32 bits of its register.
                let bits = if is_f32 { chunk & 0xffff_ffff } else { chunk };
                regs.push_sse(bits)?;
            }
        }
    }
    Ok(())
}

/// Call `addr` with the signature `sig`; `argv[i]` points at the i-th
/// argument value, `retv` (may be null for void) receives the result.
pub fn invoke(sig: &CallSig, addr: usize, argv: &[*mut u8], retv: *mut u8) -> Result<()> {
    supported()?;

    if argv.len() < sig.args.len() {
        return Err(Error::Ffi(format!(
            "expected {} arguments, got {}",
            sig.args.len(),
            argv.len()
        )));
    }

    let mut regs = RegArgs::default();

    if matches!(sig.ret, RetClass::Memory) {
        if retv.is_null() {
            return Err(Error::Ffi("aggregate return needs a destination".into()));
        }
        regs.push_int(retv as u64)?;
    }

    for (arg, &ptr) in sig.args.iter().zip(argv) {
        let is_f32 = matches!(arg.ty.kind, TypeKind::Numeric(NumericType::Float32));
        marshal_arg(&mut regs, &arg.slots, arg.ty.size, is_f32, ptr)?;
    }

    let ret = unsafe { raw_call(addr, &regs) };

    match &sig.ret {
        RetClass::Void | RetClass::Memory => {}
        RetClass::Reg(slots) => {
            if retv.is_null() {
                return Ok(());
            }
            let mut int_idx = 0;
            let mut sse_idx = 0;
            let mut remaining = sig.ret_t.size as usize;
            for (i, slot) in slots.iter().enumerate() {
                let value = match slot {
                    SlotClass::Int => {
                        let v = [ret.rax, ret.rdx][int_idx];
                        int_idx += 1;
                        v
                    }
                    SlotClass::Sse => {
                        let v = [ret.xmm0, ret.xmm1][sse_idx];
                        sse_idx += 1;
                        v
                    }
                };
                let n = remaining.min(8);
                unsafe {
                    std::ptr::copy_nonoverlapping(
                        value.to_le_bytes().as_ptr(),
                        retv.add(i * 8),
                        n,
                    );
                }
                remaining -= n;
            }
        }
    }

    Ok(())
}

#[cfg(all(test, target_arch = "x86_64"))]
mod tests {
    use super::*;
    use crate::ffi::sig::build_sig;
    use crate::types::{NumericType, TypeStore};

    extern "C" fn add3(a: i64, b: i64, c: i64) -> i64 {
        a + b + c
    }

    extern "C" fn fma(a: f64, b: f64, c: f64) -> f64 {
        a * b + c
    }

    extern "C" fn mix(a: i64, b: f64) -> f64 {
        a as f64 + b
    }

    #[test]
    fn test_integer_call() {
        let store = TypeStore::new();
        let i64_t = store.get_numeric(NumericType::Int64);
        let sig = build_sig(&[i64_t.clone(), i64_t.clone(), i64_t.clone()], &i64_t, false, 0)
            .unwrap();

        let (mut a, mut b, mut c) = (10i64, 20i64, 12i64);
        let mut ret = 0i64;
        let argv = [
            &mut a as *mut i64 as *mut u8,
            &mut b as *mut i64 as *mut u8,
            &mut c as *mut i64 as *mut u8,
        ];
        invoke(&sig, add3 as usize, &argv, &mut ret as *mut i64 as *mut u8).unwrap();
        assert_eq!(ret, 42);
    }

    #[test]
    fn test_float_call() {
        let store = TypeStore::new();
        let f64_t = store.get_numeric(NumericType::Float64);
        let sig = build_sig(&[f64_t.clone(), f64_t.clone(), f64_t.clone()], &f64_t, false, 0)
            .unwrap();

        let (mut a, mut b, mut c) = (2.0f64, 3.0f64, 1.5f64);
        let mut ret = 0.0f64;
        let argv = [
            &mut a as *mut f64 as *mut u8,
            &mut b as *mut f64 as *mut u8,
            &mut c as *mut f64 as *mut u8,
        ];
        invoke(&sig, fma as usize, &argv, &mut ret as *mut f64 as *mut u8).unwrap();
        assert_eq!(ret, 7.5);
    }

    #[test]
    fn test_mixed_call() {
        let store = TypeStore::new();
        let i64_t = store.get_numeric(NumericType::Int64);
        let f64_t = store.get_numeric(NumericType::Float64);
        let sig = build_sig(&[i64_t.clone(), f64_t.clone()], &f64_t, false, 0).unwrap();

        let mut a = 4i64;
        let mut b = 0.5f64;
        let mut ret = 0.0f64;
        let argv = [&mut a as *mut i64 as *mut u8, &mut b as *mut f64 as *mut u8];
        invoke(&sig, mix as usize, &argv, &mut ret as *mut f64 as *mut u8).unwrap();
        assert_eq!(ret, 4.5);
    }

    #[test]
    fn test_too_many_int_args_rejected() {
        let store = TypeStore::new();
        let i64_t = store.get_numeric(NumericType::Int64);
        let params: Vec<_> = (0..7).map(|_| i64_t.clone()).collect();
        let sig = build_sig(&params, &i64_t, false, 0).unwrap();
        let mut v = 0i64;
        let argv: Vec<*mut u8> = (0..7).map(|_| &mut v as *mut i64 as *mut u8).collect();
        let err = invoke(&sig, add3 as usize, &argv, &mut v as *mut i64 as *mut u8);
        assert!(matches!(err, Err(Error::Ffi(_))));
    }
}
