//! Native → bytecode closures.
//!
//! A closure is a small executable trampoline, generated at runtime, whose
//! entry is ABI-compatible with a C function pointer of the procedure's
//! signature. The trampoline spills the argument registers to a block on
//! its stack, hands the block to a Rust delegate together with the closure
//! data, and re-loads the return registers from the block afterwards.
//!
//! Closures are owned by the run context and live until the owning state
//! is dropped.

use std::sync::{Arc, Weak};

use crate::bc::{BcProc, RunCtx};
use crate::error::{Error, Result};
use crate::ffi::call::{MAX_INT_SLOTS, MAX_SSE_SLOTS};
use crate::ffi::sig::{CallSig, RetClass, SlotClass};
use crate::interp;

// Spill block layout (offsets into the trampoline's stack block).
const INT_BASE: usize = 0x00;
const SSE_BASE: usize = 0x30;
const RET_INT_BASE: usize = 0x70;
const RET_SSE_BASE: usize = 0x80;

struct ClosureData {
    proc: Arc<BcProc>,
    ctx: Weak<RunCtx>,
    sig: Arc<CallSig>,
}

/// One generated trampoline plus its data block.
pub struct ClosureHandle {
    page: ExecPage,
    _data: Box<ClosureData>,
}

impl ClosureHandle {
    /// The C-callable entry point.
    pub fn entry(&self) -> usize {
        self.page.addr
    }
}

/// Build the trampoline for `proc`.
pub(crate) fn make_closure(ctx: &Arc<RunCtx>, proc: Arc<BcProc>) -> Result<ClosureHandle> {
    let sig = ctx.sigs.get(&proc.proc_t)?;

    // The trampoline only spills registers; signatures that would receive
    // stack-passed arguments are out of the envelope.
    let mut int_slots = if matches!(sig.ret, RetClass::Memory) { 1 } else { 0 };
    let mut sse_slots = 0;
    for arg in &sig.args {
        for slot in &arg.slots {
            match slot {
                SlotClass::Int => int_slots += 1,
                SlotClass::Sse => sse_slots += 1,
            }
        }
    }
    if int_slots > MAX_INT_SLOTS || sse_slots > MAX_SSE_SLOTS {
        return Err(Error::Ffi(format!(
            "closure for `{}` would need stack-passed arguments",
            proc.name
        )));
    }

    let data = Box::new(ClosureData {
        proc,
        ctx: Arc::downgrade(ctx),
        sig,
    });
    let page = ExecPage::new(&trampoline_code(
        &*data as *const ClosureData as usize,
        closure_delegate as usize,
    ))?;

    Ok(ClosureHandle { page, _data: data })
}

/// Delegate entered by every trampoline: unmarshal per the signature, run
/// the interpreter, marshal the return value back into the spill block.
extern "C" fn closure_delegate(spill: *mut u8, data: *const ClosureData) {
    let data = unsafe { &*data };
    let Some(ctx) = data.ctx.upgrade() else {
        eprintln!(
            "kiln: closure for `{}` called after its state was dropped",
            data.proc.name
        );
        std::process::abort();
    };

    let mut int_idx = 0usize;
    let mut sse_idx = 0usize;

    let read_slot = |class: SlotClass, int_idx: &mut usize, sse_idx: &mut usize| -> u64 {
        let value = match class {
            SlotClass::Int => unsafe {
                ((spill as usize + INT_BASE + *int_idx * 8) as *const u64).read()
            },
            SlotClass::Sse => unsafe {
                ((spill as usize + SSE_BASE + *sse_idx * 8) as *const u64).read()
            },
        };
        match class {
            SlotClass::Int => *int_idx += 1,
            SlotClass::Sse => *sse_idx += 1,
        }
        value
    };

    // Aggregate returns: the caller passed the destination pointer first.
    let mut ret_buf = [0u8; 16];
    let ret_ptr = match data.sig.ret {
        RetClass::Memory => read_slot(SlotClass::Int, &mut int_idx, &mut sse_idx) as *mut u8,
        RetClass::Void => std::ptr::null_mut(),
        RetClass::Reg(_) => ret_buf.as_mut_ptr(),
    };

    // Each argument gets contiguous storage rebuilt from its slots.
    let mut arg_bufs: Vec<[u8; 16]> = Vec::with_capacity(data.sig.args.len());
    for arg in &data.sig.args {
        let mut buf = [0u8; 16];
        let mut remaining = arg.ty.size as usize;
        for (i, &slot) in arg.slots.iter().enumerate() {
            let value = read_slot(slot, &mut int_idx, &mut sse_idx);
            let n = remaining.min(8);
            buf[i * 8..i * 8 + n].copy_from_slice(&value.to_le_bytes()[..n]);
            remaining -= n;
        }
        arg_bufs.push(buf);
    }
    let argv: Vec<*mut std::ffi::c_void> = arg_bufs
        .iter_mut()
        .map(|buf| buf.as_mut_ptr() as *mut std::ffi::c_void)
        .collect();

    if let Err(err) = interp::invoke(&ctx, &data.proc, &argv, ret_ptr) {
        eprintln!("kiln: closure for `{}` failed: {}", data.proc.name, err);
        std::process::abort();
    }

    if let RetClass::Reg(slots) = &data.sig.ret {
        let mut ret_int = 0usize;
        let mut ret_sse = 0usize;
        for (i, slot) in slots.iter().enumerate() {
            let mut raw = [0u8; 8];
            raw.copy_from_slice(&ret_buf[i * 8..i * 8 + 8]);
            let value = u64::from_le_bytes(raw);
            unsafe {
                match slot {
                    SlotClass::Int => {
                        ((spill as usize + RET_INT_BASE + ret_int * 8) as *mut u64).write(value);
                        ret_int += 1;
                    }
                    SlotClass::Sse => {
                        ((spill as usize + RET_SSE_BASE + ret_sse * 8) as *mut u64).write(value);
                        ret_sse += 1;
                    }
                }
            }
        }
    }
}

/// Emit the trampoline's machine code (x86_64 System V).
fn trampoline_code(data_addr: usize, delegate_addr: usize) -> Vec<u8> {
    let mut code = Vec::with_capacity(128);

    // sub rsp, 0x98  (keeps the stack 16-aligned at the call below)
    code.extend_from_slice(&[0x48, 0x81, 0xEC, 0x98, 0x00, 0x00, 0x00]);

    // Spill the six integer argument registers.
    code.extend_from_slice(&[0x48, 0x89, 0x7C, 0x24, 0x00]); // mov [rsp+0x00], rdi
    code.extend_from_slice(&[0x48, 0x89, 0x74, 0x24, 0x08]); // mov [rsp+0x08], rsi
    code.extend_from_slice(&[0x48, 0x89, 0x54, 0x24, 0x10]); // mov [rsp+0x10], rdx
    code.extend_from_slice(&[0x48, 0x89, 0x4C, 0x24, 0x18]); // mov [rsp+0x18], rcx
    code.extend_from_slice(&[0x4C, 0x89, 0x44, 0x24, 0x20]); // mov [rsp+0x20], r8
    code.extend_from_slice(&[0x4C, 0x89, 0x4C, 0x24, 0x28]); // mov [rsp+0x28], r9

    // Spill the eight SSE argument registers.
    for (i, modrm) in [0x44, 0x4C, 0x54, 0x5C, 0x64, 0x6C, 0x74, 0x7C]
        .iter()
        .enumerate()
    {
        // movsd [rsp+0x30 + 8*i], xmm<i>
        code.extend_from_slice(&[0xF2, 0x0F, 0x11, *modrm, 0x24, (0x30 + 8 * i) as u8]);
    }

    // mov rdi, rsp ; movabs rsi, data ; movabs rax, delegate ; call rax
    code.extend_from_slice(&[0x48, 0x89, 0xE7]);
    code.extend_from_slice(&[0x48, 0xBE]);
    code.extend_from_slice(&(data_addr as u64).to_le_bytes());
    code.extend_from_slice(&[0x48, 0xB8]);
    code.extend_from_slice(&(delegate_addr as u64).to_le_bytes());
    code.extend_from_slice(&[0xFF, 0xD0]);

    // Reload the return registers from the block.
    code.extend_from_slice(&[0x48, 0x8B, 0x44, 0x24, 0x70]); // mov rax, [rsp+0x70]
    code.extend_from_slice(&[0x48, 0x8B, 0x54, 0x24, 0x78]); // mov rdx, [rsp+0x78]
    code.extend_from_slice(&[0xF2, 0x0F, 0x10, 0x84, 0x24, 0x80, 0x00, 0x00, 0x00]); // movsd xmm0, [rsp+0x80]
    code.extend_from_slice(&[0xF2, 0x0F, 0x10, 0x8C, 0x24, 0x88, 0x00, 0x00, 0x00]); // movsd xmm1, [rsp+0x88]

    // add rsp, 0x98 ; ret
    code.extend_from_slice(&[0x48, 0x81, 0xC4, 0x98, 0x00, 0x00, 0x00]);
    code.push(0xC3);

    code
}

/// An executable code page.
struct ExecPage {
    addr: usize,
    len: usize,
}

#[cfg(all(unix, target_arch = "x86_64"))]
impl ExecPage {
    fn new(code: &[u8]) -> Result<ExecPage> {
        unsafe {
            let len = code.len().max(1);
            let ptr = libc::mmap(
                std::ptr::null_mut(),
                len,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
                -1,
                0,
            );
            if ptr == libc::MAP_FAILED {
                return Err(Error::Ffi("failed to map a closure page".into()));
            }
            std::ptr::copy_nonoverlapping(code.as_ptr(), ptr as *mut u8, code.len());
            if libc::mprotect(ptr, len, libc::PROT_READ | libc::PROT_EXEC) != 0 {
                libc::munmap(ptr, len);
                return Err(Error::Ffi("failed to make a closure page executable".into()));
            }
            Ok(ExecPage {
                addr: ptr as usize,
                len,
            })
        }
    }
}

#[cfg(not(all(unix, target_arch = "x86_64")))]
impl ExecPage {
    fn new(_code: &[u8]) -> Result<ExecPage> {
        Err(Error::Unsupported(
            "closures are only implemented for x86_64 unix".into(),
        ))
    }
}

#[cfg(unix)]
impl Drop for ExecPage {
    fn drop(&mut self) {
        unsafe {
            libc::munmap(self.addr as *mut libc::c_void, self.len);
        }
    }
}

// The page is immutable once protected; the data block is never mutated
// after construction.
unsafe impl Send for ClosureHandle {}
unsafe impl Sync for ClosureHandle {}
