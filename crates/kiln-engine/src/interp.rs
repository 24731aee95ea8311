//! The bytecode interpreter.
//!
//! One interpreter state per OS thread, kept in thread-local storage. Two
//! stacks: a control stack of saved frames, and a frame arena the callee
//! locals and argument blocks live in. The inner loop is a plain match on
//! the opcode; no heap allocation happens on the hot path except argument
//! marshaling for calls.
//!
//! Reentrancy: a native callee reached through `call_ext` may call back
//! into bytecode through a closure trampoline on the same thread. The
//! interpreter state is therefore accessed through a raw pointer in short
//! scopes, and no borrow of it is live across a native call.

use std::cell::UnsafeCell;
use std::ffi::c_void;
use std::sync::Arc;

use crate::bc::{BcArg, BcInstr, BcOp, BcProc, BcRef, BcRefKind, RunCtx};
use crate::error::{Error, Result};
use crate::ffi;
use crate::mem::{StackArena, StackFrame};
use crate::types::{NumericType, TypeRef};

/// Per-thread frame-arena capacity.
const STACK_CAPACITY: usize = 8 * 1024 * 1024;

// ============================================================================
// Scalar operations
// ============================================================================

/// Arithmetic at one numeric type. Integers wrap (two's complement, like
/// the emitted machine code); floats follow IEEE. Division by zero is an
/// interpreter error, not a trap.
trait Scalar: Copy + PartialEq + PartialOrd {
    fn add(a: Self, b: Self) -> Self;
    fn sub(a: Self, b: Self) -> Self;
    fn mul(a: Self, b: Self) -> Self;
    fn div(a: Self, b: Self) -> Option<Self>;
    fn rem(a: Self, b: Self) -> Option<Self>;
    fn neg(a: Self) -> Self;
}

/// Bitwise and shift operations, integers only.
trait IntScalar: Scalar {
    fn band(a: Self, b: Self) -> Self;
    fn bor(a: Self, b: Self) -> Self;
    fn bxor(a: Self, b: Self) -> Self;
    fn shl(a: Self, count: u32) -> Self;
    fn shr(a: Self, count: u32) -> Self;
}

macro_rules! impl_scalar_int {
    ($($t:ty),*) => {$(
        impl Scalar for $t {
            fn add(a: Self, b: Self) -> Self { a.wrapping_add(b) }
            fn sub(a: Self, b: Self) -> Self { a.wrapping_sub(b) }
            fn mul(a: Self, b: Self) -> Self { a.wrapping_mul(b) }
            fn div(a: Self, b: Self) -> Option<Self> {
                if b == 0 { None } else { Some(a.wrapping_div(b)) }
            }
            fn rem(a: Self, b: Self) -> Option<Self> {
                if b == 0 { None } else { Some(a.wrapping_rem(b)) }
            }
            fn neg(a: Self) -> Self { a.wrapping_neg() }
        }
        impl IntScalar for $t {
            fn band(a: Self, b: Self) -> Self { a & b }
            fn bor(a: Self, b: Self) -> Self { a | b }
            fn bxor(a: Self, b: Self) -> Self { a ^ b }
            fn shl(a: Self, count: u32) -> Self { a.wrapping_shl(count) }
            fn shr(a: Self, count: u32) -> Self { a.wrapping_shr(count) }
        }
    )*};
}

macro_rules! impl_scalar_float {
    ($($t:ty),*) => {$(
        impl Scalar for $t {
            fn add(a: Self, b: Self) -> Self { a + b }
            fn sub(a: Self, b: Self) -> Self { a - b }
            fn mul(a: Self, b: Self) -> Self { a * b }
            fn div(a: Self, b: Self) -> Option<Self> { Some(a / b) }
            fn rem(a: Self, b: Self) -> Option<Self> { Some(a % b) }
            fn neg(a: Self) -> Self { -a }
        }
    )*};
}

impl_scalar_int!(i8, u8, i16, u16, i32, u32, i64, u64);
impl_scalar_float!(f32, f64);

/// Dispatch `$f::<T>(args…)` over every numeric type.
macro_rules! with_numeric {
    ($nt:expr, $f:ident($($args:expr),*)) => {
        match $nt {
            NumericType::Int8 => $f::<i8>($($args),*),
            NumericType::Uint8 => $f::<u8>($($args),*),
            NumericType::Int16 => $f::<i16>($($args),*),
            NumericType::Uint16 => $f::<u16>($($args),*),
            NumericType::Int32 => $f::<i32>($($args),*),
            NumericType::Uint32 => $f::<u32>($($args),*),
            NumericType::Int64 => $f::<i64>($($args),*),
            NumericType::Uint64 => $f::<u64>($($args),*),
            NumericType::Float32 => $f::<f32>($($args),*),
            NumericType::Float64 => $f::<f64>($($args),*),
        }
    };
}

/// Dispatch over the integer types only.
macro_rules! with_int {
    ($nt:expr, $f:ident($($args:expr),*)) => {
        match $nt {
            NumericType::Int8 => $f::<i8>($($args),*),
            NumericType::Uint8 => $f::<u8>($($args),*),
            NumericType::Int16 => $f::<i16>($($args),*),
            NumericType::Uint16 => $f::<u16>($($args),*),
            NumericType::Int32 => $f::<i32>($($args),*),
            NumericType::Uint32 => $f::<u32>($($args),*),
            NumericType::Int64 => $f::<i64>($($args),*),
            NumericType::Uint64 => $f::<u64>($($args),*),
            _ => return Err(Error::Runtime("integer operation on float type".into())),
        }
    };
}

// ============================================================================
// Interpreter state
// ============================================================================

struct ControlFrame {
    stack_frame: StackFrame,
    base_frame: *mut u8,
    base_arg: *mut u8,
    base_ret: *mut u8,
    proc: Option<Arc<BcProc>>,
    pc: usize,
}

struct InterpCtx {
    stack: StackArena,
    cur_stack_frame: StackFrame,
    ctrl: Vec<ControlFrame>,
    base_frame: *mut u8,
    base_arg: *mut u8,
    base_ret: *mut u8,
    proc: Option<Arc<BcProc>>,
    pc: usize,
}

impl InterpCtx {
    fn new() -> InterpCtx {
        let stack = StackArena::with_capacity(STACK_CAPACITY);
        let cur_stack_frame = stack.grab();
        InterpCtx {
            stack,
            cur_stack_frame,
            ctrl: Vec::new(),
            base_frame: std::ptr::null_mut(),
            base_arg: std::ptr::null_mut(),
            base_ret: std::ptr::null_mut(),
            proc: None,
            pc: 0,
        }
    }
}

thread_local! {
    static INTERP: UnsafeCell<InterpCtx> = UnsafeCell::new(InterpCtx::new());
}

fn overflow() -> Error {
    Error::Runtime("interpreter stack overflow".into())
}

// ============================================================================
// Memory access
// ============================================================================

/// Resolve a ref to the address it denotes: `offset` applies to the base,
/// then `indir` pointer loads, then `post_offset`.
unsafe fn deref(interp: &InterpCtx, r: &BcRef) -> *mut u8 {
    let mut p = match r.kind {
        BcRefKind::Frame => interp.base_frame.add(r.offset),
        BcRefKind::Arg => interp.base_arg.add(r.offset),
        BcRefKind::Ret => interp.base_ret.add(r.offset),
        BcRefKind::Rodata => r.offset as *mut u8,
        BcRefKind::Instr | BcRefKind::None => std::ptr::null_mut(),
    };
    for _ in 0..r.indir {
        p = (p as *const *mut u8).read_unaligned();
    }
    p.add(r.post_offset)
}

unsafe fn read_val<T: Copy>(p: *const u8) -> T {
    (p as *const T).read_unaligned()
}

unsafe fn write_val<T: Copy>(p: *mut u8, v: T) {
    (p as *mut T).write_unaligned(v)
}

unsafe fn read_uint(p: *const u8, size: usize) -> u64 {
    let mut raw = [0u8; 8];
    std::ptr::copy_nonoverlapping(p, raw.as_mut_ptr(), size.min(8));
    u64::from_le_bytes(raw)
}

unsafe fn write_uint(p: *mut u8, size: usize, value: u64) {
    std::ptr::copy_nonoverlapping(value.to_le_bytes().as_ptr(), p, size.min(8));
}

unsafe fn bin_op<T: Scalar>(dst: *mut u8, a: *const u8, b: *const u8, op: fn(T, T) -> T) {
    write_val(dst, op(read_val::<T>(a), read_val::<T>(b)));
}

unsafe fn bin_checked<T: Scalar>(
    dst: *mut u8,
    a: *const u8,
    b: *const u8,
    op: fn(T, T) -> Option<T>,
) -> Result<()> {
    match op(read_val::<T>(a), read_val::<T>(b)) {
        Some(v) => {
            write_val(dst, v);
            Ok(())
        }
        None => Err(Error::Runtime("division by zero".into())),
    }
}

unsafe fn un_op<T: Scalar>(dst: *mut u8, a: *const u8, op: fn(T) -> T) {
    write_val(dst, op(read_val::<T>(a)));
}

unsafe fn shift_op<T: IntScalar>(
    dst: *mut u8,
    a: *const u8,
    b: *const u8,
    count_size: usize,
    op: fn(T, u32) -> T,
) {
    let count = read_uint(b, count_size) as u32;
    write_val(dst, op(read_val::<T>(a), count));
}

unsafe fn cmp_op<T: Scalar>(dst: *mut u8, a: *const u8, b: *const u8, op: fn(T, T) -> bool) {
    write_val(dst, op(read_val::<T>(a), read_val::<T>(b)) as u8);
}

// ============================================================================
// Call machinery
// ============================================================================

/// Push a call frame and enter `proc`. `srcs` point at the argument
/// values; `ret_ptr` receives the return value (null when discarded).
fn push_frame(
    interp: &mut InterpCtx,
    proc: Arc<BcProc>,
    srcs: &[*const u8],
    ret_ptr: *mut u8,
) -> Result<()> {
    if srcs.len() < proc.params.len() {
        return Err(Error::Runtime(format!(
            "proc `{}` expects {} arguments, got {}",
            proc.name,
            proc.params.len(),
            srcs.len()
        )));
    }

    interp.ctrl.push(ControlFrame {
        stack_frame: interp.cur_stack_frame,
        base_frame: interp.base_frame,
        base_arg: interp.base_arg,
        base_ret: interp.base_ret,
        proc: interp.proc.take(),
        pc: interp.pc,
    });

    interp.cur_stack_frame = interp.stack.grab();

    let frame = interp
        .stack
        .alloc_aligned(proc.frame_size.max(1), proc.frame_align.max(1))
        .ok_or_else(overflow)?;
    unsafe { std::ptr::write_bytes(frame, 0, proc.frame_size.max(1)) };

    let args = interp
        .stack
        .alloc_aligned(proc.args_size.max(1), proc.args_align.max(1))
        .ok_or_else(overflow)?;
    for (param, &src) in proc.params.iter().zip(srcs) {
        unsafe { std::ptr::copy_nonoverlapping(src, args.add(param.offset), param.size) };
    }

    let ret = if ret_ptr.is_null() && proc.ret_size > 0 {
        interp
            .stack
            .alloc_aligned(proc.ret_size, 16)
            .ok_or_else(overflow)?
    } else {
        ret_ptr
    };

    interp.base_frame = frame;
    interp.base_arg = args;
    interp.base_ret = ret;
    interp.proc = Some(proc);
    interp.pc = 0;
    Ok(())
}

/// Execute `proc` with raw argument/return pointers. Reentrant per thread.
pub fn invoke(
    ctx: &Arc<RunCtx>,
    proc: &Arc<BcProc>,
    argv: &[*mut c_void],
    retv: *mut u8,
) -> Result<()> {
    INTERP.with(|cell| {
        let ip = cell.get();

        let (saved_depth, saved_stack_frame, entered) = {
            let interp = unsafe { &mut *ip };
            let srcs: Vec<*const u8> = argv.iter().map(|&p| p as *const u8).collect();
            let depth = interp.ctrl.len();
            let frame = interp.cur_stack_frame;
            let entered = push_frame(interp, proc.clone(), &srcs, retv);
            (depth, frame, entered)
        };

        let result = entered.and_then(|_| run_loop(ctx, ip, saved_depth));

        if result.is_err() {
            // Unwind every frame this invocation pushed; the first one
            // saved holds the pre-entry state.
            let interp = unsafe { &mut *ip };
            if interp.ctrl.len() > saved_depth {
                let entry = interp.ctrl.drain(saved_depth..).next().expect("entry frame");
                interp.base_frame = entry.base_frame;
                interp.base_arg = entry.base_arg;
                interp.base_ret = entry.base_ret;
                interp.proc = entry.proc;
                interp.pc = entry.pc;
            }
            interp.stack.pop(saved_stack_frame);
            interp.cur_stack_frame = saved_stack_frame;
        }

        result
    })
}

fn run_loop(ctx: &Arc<RunCtx>, ip: *mut InterpCtx, base_depth: usize) -> Result<()> {
    loop {
        let (proc, pc) = {
            let interp = unsafe { &mut *ip };
            if interp.ctrl.len() <= base_depth {
                return Ok(());
            }
            let Some(proc) = interp.proc.clone() else {
                return Ok(());
            };
            let pc = interp.pc;
            if pc >= proc.instrs.len() {
                return Err(Error::Runtime(format!(
                    "proc `{}`: fell off the end of the instruction stream",
                    proc.name
                )));
            }
            interp.pc = pc + 1;
            (proc, pc)
        };
        exec(ctx, ip, &proc.instrs[pc])?;
    }
}

fn shift_count_size(arg: &BcArg) -> usize {
    arg.as_bc_ref().map(|r| r.ty.size as usize).unwrap_or(8)
}

fn instr_target(arg: &BcArg) -> Result<usize> {
    match arg {
        BcArg::Ref(r) if r.kind == BcRefKind::Instr => Ok(r.offset),
        _ => Err(Error::Runtime("jump without a resolved target".into())),
    }
}

fn exec(ctx: &Arc<RunCtx>, ip: *mut InterpCtx, instr: &BcInstr) -> Result<()> {
    let interp = unsafe { &mut *ip };

    let dst = match &instr.args[0] {
        BcArg::Ref(r) => unsafe { deref(interp, r) },
        _ => std::ptr::null_mut(),
    };
    let a = match &instr.args[1] {
        BcArg::Ref(r) => unsafe { deref(interp, r) },
        _ => std::ptr::null_mut(),
    };
    let b = match &instr.args[2] {
        BcArg::Ref(r) if r.kind != BcRefKind::Instr => unsafe { deref(interp, r) },
        _ => std::ptr::null_mut(),
    };

    match &instr.op {
        BcOp::Nop => {}

        BcOp::Ret => {
            let fr = interp
                .ctrl
                .pop()
                .ok_or_else(|| Error::Runtime("return without a call frame".into()))?;
            interp.stack.pop(interp.cur_stack_frame);
            interp.cur_stack_frame = fr.stack_frame;
            interp.base_frame = fr.base_frame;
            interp.base_arg = fr.base_arg;
            interp.base_ret = fr.base_ret;
            interp.proc = fr.proc;
            interp.pc = fr.pc;
        }

        BcOp::Jmp => {
            interp.pc = instr_target(&instr.args[2])?;
        }
        BcOp::Jmpz(size) => {
            if unsafe { read_uint(a, size.bytes()) } == 0 {
                interp.pc = instr_target(&instr.args[2])?;
            }
        }
        BcOp::Jmpnz(size) => {
            if unsafe { read_uint(a, size.bytes()) } != 0 {
                interp.pc = instr_target(&instr.args[2])?;
            }
        }

        BcOp::Mov(size) => unsafe {
            std::ptr::copy(a, dst, size.bytes());
        },
        BcOp::MovN(size) => unsafe {
            std::ptr::copy(a, dst, *size);
        },
        BcOp::Lea => unsafe {
            write_val(dst, a as u64);
        },

        BcOp::Neg(nt) => unsafe { with_numeric!(nt, un_op(dst, a, Scalar::neg)) },
        BcOp::Add(nt) => unsafe { with_numeric!(nt, bin_op(dst, a, b, Scalar::add)) },
        BcOp::Sub(nt) => unsafe { with_numeric!(nt, bin_op(dst, a, b, Scalar::sub)) },
        BcOp::Mul(nt) => unsafe { with_numeric!(nt, bin_op(dst, a, b, Scalar::mul)) },
        BcOp::Div(nt) => unsafe { with_numeric!(nt, bin_checked(dst, a, b, Scalar::div))? },
        BcOp::Mod(nt) => unsafe { with_numeric!(nt, bin_checked(dst, a, b, Scalar::rem))? },

        BcOp::And(nt) => unsafe { with_int!(nt, bin_op(dst, a, b, IntScalar::band)) },
        BcOp::Or(nt) => unsafe { with_int!(nt, bin_op(dst, a, b, IntScalar::bor)) },
        BcOp::Xor(nt) => unsafe { with_int!(nt, bin_op(dst, a, b, IntScalar::bxor)) },
        BcOp::Lsh(nt) => {
            let count_size = shift_count_size(&instr.args[2]);
            unsafe { with_int!(nt, shift_op(dst, a, b, count_size, IntScalar::shl)) }
        }
        BcOp::Rsh(nt) => {
            let count_size = shift_count_size(&instr.args[2]);
            unsafe { with_int!(nt, shift_op(dst, a, b, count_size, IntScalar::shr)) }
        }

        BcOp::CmpEq(nt) => unsafe { with_numeric!(nt, cmp_op(dst, a, b, |x, y| x == y)) },
        BcOp::CmpNe(nt) => unsafe { with_numeric!(nt, cmp_op(dst, a, b, |x, y| x != y)) },
        BcOp::CmpLt(nt) => unsafe { with_numeric!(nt, cmp_op(dst, a, b, |x, y| x < y)) },
        BcOp::CmpLe(nt) => unsafe { with_numeric!(nt, cmp_op(dst, a, b, |x, y| x <= y)) },
        BcOp::CmpGt(nt) => unsafe { with_numeric!(nt, cmp_op(dst, a, b, |x, y| x > y)) },
        BcOp::CmpGe(nt) => unsafe { with_numeric!(nt, cmp_op(dst, a, b, |x, y| x >= y)) },

        BcOp::Ext { from, to } => {
            let raw = unsafe { read_uint(a, from.size() as usize) };
            // The source is re-read at the destination's signedness before
            // widening.
            let value = if to.is_signed() {
                let shift = 64 - from.size() * 8;
                (((raw << shift) as i64) >> shift) as u64
            } else {
                raw
            };
            unsafe { write_uint(dst, to.size() as usize, value) };
        }
        BcOp::Trunc { from, to } => {
            let raw = unsafe { read_uint(a, from.size() as usize) };
            unsafe { write_uint(dst, to.size() as usize, raw) };
        }
        BcOp::Fp2i { from, to } => {
            let value = unsafe {
                if *from == NumericType::Float32 {
                    read_val::<f32>(a) as f64
                } else {
                    read_val::<f64>(a)
                }
            };
            let bits = if to.is_signed() {
                (value as i64) as u64
            } else {
                (value as u64) as u64
            };
            unsafe { write_uint(dst, to.size() as usize, bits) };
        }
        BcOp::I2fp { from, to } => {
            let raw = unsafe { read_uint(a, from.size() as usize) };
            let value = if from.is_signed() {
                let shift = 64 - from.size() * 8;
                (((raw << shift) as i64) >> shift) as f64
            } else {
                raw as f64
            };
            unsafe {
                if *to == NumericType::Float32 {
                    write_val(dst, value as f32);
                } else {
                    write_val(dst, value);
                }
            }
        }

        BcOp::CallJmp => {
            let name = match &instr.args[1] {
                BcArg::ProcName(name) => *name,
                _ => return Err(Error::Runtime("call without a callee".into())),
            };
            let callee = ctx
                .procs
                .get(&name)
                .map(|p| p.clone())
                .ok_or_else(|| Error::Runtime(format!("proc `{}` is not translated", name)))?;
            let srcs = call_arg_ptrs(interp, &instr.args[2]);
            push_frame(interp, callee, &srcs, dst)?;
        }

        BcOp::CallExt => {
            let (addr, proc_t) = match &instr.args[1] {
                BcArg::Native { addr, proc_t } => (*addr, proc_t.clone()),
                _ => return Err(Error::Runtime("native call without a callee".into())),
            };
            native_call(ctx, ip, instr, addr, &proc_t)?;
        }

        BcOp::Call => {
            let callee_ref = match &instr.args[1] {
                BcArg::Ref(r) => r.clone(),
                _ => return Err(Error::Runtime("indirect call without a callee".into())),
            };
            let addr = unsafe { read_val::<u64>(a) } as usize;
            if addr == 0 {
                return Err(Error::Runtime("indirect call through a null pointer".into()));
            }
            native_call(ctx, ip, instr, addr, &callee_ref.ty)?;
        }

        BcOp::Syscall => {
            syscall(interp, instr, dst, a)?;
        }
    }
    Ok(())
}

fn call_arg_ptrs(interp: &InterpCtx, arg: &BcArg) -> Vec<*const u8> {
    match arg {
        BcArg::RefArray(refs) => refs
            .iter()
            .map(|r| unsafe { deref(interp, r) } as *const u8)
            .collect(),
        _ => Vec::new(),
    }
}

/// Dispatch a native (or indirect) call through the FFI adapter.
///
/// A procedure value at runtime is a C entry point, so the indirect path
/// and the extern path share this code; a bytecode callee reached this way
/// re-enters the interpreter through its closure trampoline.
fn native_call(
    ctx: &Arc<RunCtx>,
    ip: *mut InterpCtx,
    instr: &BcInstr,
    addr: usize,
    proc_t: &TypeRef,
) -> Result<()> {
    let info = proc_t
        .as_procedure()
        .ok_or_else(|| Error::Runtime("call through a non-procedure type".into()))?;

    let (argv, retv, sig) = {
        let interp = unsafe { &mut *ip };
        let arg_refs: &[BcRef] = match &instr.args[2] {
            BcArg::RefArray(refs) => refs,
            _ => &[],
        };
        let argv: Vec<*mut u8> = arg_refs
            .iter()
            .map(|r| unsafe { deref(interp, r) })
            .collect();
        let retv = match &instr.args[0] {
            BcArg::Ref(r) => unsafe { deref(interp, r) },
            _ => std::ptr::null_mut(),
        };

        let sig = if info.variadic {
            // The trailing argument types come from the call site.
            let mut types: Vec<TypeRef> = info.param_types.clone();
            for r in arg_refs.iter().skip(info.param_types.len()) {
                types.push(r.ty.clone());
            }
            Arc::new(ffi::sig::build_sig(
                &types,
                &info.ret_t,
                true,
                info.param_types.len(),
            )?)
        } else {
            ctx.sigs.get(proc_t)?
        };
        (argv, retv, sig)
    };

    // No interpreter borrow may be live here: the callee can re-enter.
    ffi::call::invoke(&sig, addr, &argv, retv)
}

#[cfg(unix)]
fn syscall(interp: &mut InterpCtx, instr: &BcInstr, dst: *mut u8, n_ptr: *const u8) -> Result<()> {
    let n = match &instr.args[1] {
        BcArg::Ref(r) => (unsafe { read_uint(n_ptr, r.ty.size as usize) }) as i64,
        _ => return Err(Error::Runtime("syscall without a number".into())),
    };
    let mut args = [0u64; 6];
    if let BcArg::RefArray(refs) = &instr.args[2] {
        if refs.len() > 6 {
            return Err(Error::Runtime("syscall with more than 6 arguments".into()));
        }
        for (slot, r) in args.iter_mut().zip(refs) {
            *slot = unsafe { read_uint(deref(interp, r), r.ty.size as usize) };
        }
    }
    let ret = unsafe {
        libc::syscall(
            n as libc::c_long,
            args[0],
            args[1],
            args[2],
            args[3],
            args[4],
            args[5],
        )
    };
    if !dst.is_null() {
        unsafe { write_val(dst, ret as i64) };
    }
    Ok(())
}

#[cfg(not(unix))]
fn syscall(
    _interp: &mut InterpCtx,
    _instr: &BcInstr,
    _dst: *mut u8,
    _n_ptr: *const u8,
) -> Result<()> {
    Err(Error::Unsupported("syscall is only available on unix".into()))
}
