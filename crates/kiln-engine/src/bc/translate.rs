//! IR → bytecode lowering.
//!
//! Each procedure lowers independently: frame layout for its locals (named
//! locals plus `alloc` slots), an argument block laid out like an
//! aggregate, then a single pass that selects size/type-specialized opcodes
//! and resolves every ref to a storage class + offset. Jump targets resolve
//! against a label prepass; procedures referenced by direct calls go onto a
//! work queue and translate before the batch returns.

use std::sync::Arc;

use rustc_hash::FxHashMap;

use crate::atom::Atom;
use crate::bc::{BcArg, BcInstr, BcOp, BcParam, BcProc, BcRef, BcRefKind, RunCtx, SizeClass};
use crate::error::{Error, Result};
use crate::ir::{self, Arg, Instr, Opcode, Ref, RefKind, Symbol, SymbolKind};
use crate::types::{aggregate_layout, NumericType, TypeRef};

/// A rodata cell to patch with a procedure's native entry once the whole
/// batch has translated (procedure-as-value references).
struct ClosureFixup {
    sym: Atom,
    cell: usize,
}

/// Translate `name` and every bytecode procedure it references.
pub(crate) fn translate_proc(ctx: &Arc<RunCtx>, symbols: &[Symbol], name: Atom) -> Result<()> {
    let mut queue = vec![name];
    let mut fixups: Vec<ClosureFixup> = Vec::new();
    while let Some(next) = queue.pop() {
        if ctx.procs.contains_key(&next) {
            continue;
        }
        let proc = translate_one(ctx, symbols, next, &mut queue, &mut fixups)?;
        // A nested batch (through data relocations) may have gotten here
        // first; keep the translation already visible to callers.
        ctx.procs.entry(next).or_insert_with(|| Arc::new(proc));
    }
    for fixup in fixups {
        let entry = ctx.closure_for_translated(fixup.sym)?;
        unsafe { (fixup.cell as *mut u64).write_unaligned(entry as u64) };
    }
    Ok(())
}

struct ProcTranslator<'a> {
    ctx: &'a Arc<RunCtx>,
    symbols: &'a [Symbol],
    name: Atom,
    proc: &'a ir::Proc,
    local_offsets: FxHashMap<Atom, usize>,
    alloc_slots: FxHashMap<usize, (usize, TypeRef)>,
    param_offsets: FxHashMap<Atom, usize>,
    frame_size: usize,
    frame_align: usize,
    args_size: usize,
    args_align: usize,
    params: Vec<BcParam>,
    labels: FxHashMap<Atom, usize>,
    ir2bc: Vec<usize>,
    queue: &'a mut Vec<Atom>,
    fixups: &'a mut Vec<ClosureFixup>,
}

fn translate_one(
    ctx: &Arc<RunCtx>,
    symbols: &[Symbol],
    name: Atom,
    queue: &mut Vec<Atom>,
    fixups: &mut Vec<ClosureFixup>,
) -> Result<BcProc> {
    let sym = ir::find_symbol(symbols, name)
        .ok_or_else(|| Error::Link(format!("undefined symbol `{}`", name)))?;
    let proc = sym
        .as_proc()
        .ok_or_else(|| Error::Link(format!("`{}` is not a procedure", name)))?;
    if proc.variadic {
        return Err(Error::Unsupported(format!(
            "variadic bytecode procedure `{}` cannot be translated",
            name
        )));
    }

    let mut tr = ProcTranslator {
        ctx,
        symbols,
        name,
        proc,
        local_offsets: FxHashMap::default(),
        alloc_slots: FxHashMap::default(),
        param_offsets: FxHashMap::default(),
        frame_size: 0,
        frame_align: 1,
        args_size: 0,
        args_align: 1,
        params: Vec::new(),
        labels: FxHashMap::default(),
        ir2bc: Vec::new(),
        queue,
        fixups,
    };

    tr.layout_frame()?;
    tr.layout_args();
    tr.prepass();
    let instrs = tr.translate_body()?;

    Ok(BcProc {
        name,
        instrs,
        frame_size: tr.frame_size,
        frame_align: tr.frame_align,
        args_size: tr.args_size,
        args_align: tr.args_align,
        params: tr.params,
        ret_size: proc.ret.ty.size as usize,
        proc_t: ctx.proc_type(proc),
    })
}

fn each_ref<'i>(instr: &'i Instr) -> impl Iterator<Item = &'i Ref> {
    instr.args.iter().flat_map(|arg| {
        let refs: &'i [Ref] = match arg {
            Arg::Ref(r) => std::slice::from_ref(r),
            Arg::RefArray(refs) => refs.as_slice(),
            _ => &[],
        };
        refs.iter()
    })
}

impl<'a> ProcTranslator<'a> {
    /// Discover locals and `alloc` slots, then lay out the frame.
    fn layout_frame(&mut self) -> Result<()> {
        let mut elems: Vec<(TypeRef, u64)> = Vec::new();
        let mut local_order: Vec<Atom> = Vec::new();
        let mut local_types: FxHashMap<Atom, TypeRef> = FxHashMap::default();
        let mut alloc_order: Vec<(usize, TypeRef)> = Vec::new();

        let param_names: FxHashMap<Atom, ()> = self
            .proc
            .params
            .iter()
            .map(|p| (p.name, ()))
            .collect();

        // Direct uses fix a local's slot type; indirect-only locals hold a
        // pointer.
        for instr in &self.proc.instrs {
            if instr.code == Opcode::Alloc {
                if let Arg::Type(ty) = &instr.args[1] {
                    alloc_order.push((alloc_order.len(), ty.clone()));
                }
            }
            for r in each_ref(instr) {
                if let RefKind::Local(sym) = r.kind {
                    if param_names.contains_key(&sym) {
                        continue;
                    }
                    let slot_ty = if r.indir == 0 {
                        r.ty.clone()
                    } else {
                        self.ctx.types.get_pointer(r.ty.clone())
                    };
                    match local_types.get(&sym) {
                        None => {
                            local_order.push(sym);
                            local_types.insert(sym, slot_ty);
                        }
                        Some(existing) if r.indir == 0 && existing.size < slot_ty.size => {
                            local_types.insert(sym, slot_ty);
                        }
                        _ => {}
                    }
                }
            }
        }

        for sym in &local_order {
            elems.push((local_types[sym].clone(), 1));
        }
        let alloc_base = elems.len();
        for (_, ty) in &alloc_order {
            elems.push((ty.clone(), 1));
        }

        let layout = aggregate_layout(&elems);
        for (i, sym) in local_order.iter().enumerate() {
            self.local_offsets.insert(*sym, layout.elems[i].offset as usize);
        }
        for (i, (slot, ty)) in alloc_order.into_iter().enumerate() {
            self.alloc_slots
                .insert(slot, (layout.elems[alloc_base + i].offset as usize, ty));
        }
        self.frame_size = layout.size as usize;
        self.frame_align = layout.align.max(1) as usize;
        Ok(())
    }

    fn layout_args(&mut self) {
        let elems: Vec<(TypeRef, u64)> = self
            .proc
            .params
            .iter()
            .map(|p| (p.ty.clone(), 1))
            .collect();
        let layout = aggregate_layout(&elems);
        for (param, elem) in self.proc.params.iter().zip(&layout.elems) {
            self.param_offsets.insert(param.name, elem.offset as usize);
            self.params.push(BcParam {
                offset: elem.offset as usize,
                size: param.ty.size as usize,
            });
        }
        self.args_size = layout.size as usize;
        self.args_align = layout.align.max(1) as usize;
    }

    fn emits(code: Opcode) -> bool {
        !matches!(code, Opcode::Label | Opcode::Comment)
    }

    /// Record label targets and the IR-index → bytecode-index mapping.
    fn prepass(&mut self) {
        let mut bc_idx = 0usize;
        for instr in &self.proc.instrs {
            self.ir2bc.push(bc_idx);
            match (instr.code, &instr.args[1]) {
                (Opcode::Label, Arg::Label(name)) => {
                    // First occurrence wins for duplicated names.
                    self.labels.entry(*name).or_insert(bc_idx);
                }
                _ => {
                    if Self::emits(instr.code) {
                        bc_idx += 1;
                    }
                }
            }
        }
        self.ir2bc.push(bc_idx);
    }

    fn translate_body(&mut self) -> Result<Vec<BcInstr>> {
        let mut out = Vec::with_capacity(self.proc.instrs.len());
        for (ir_idx, instr) in self.proc.instrs.iter().enumerate() {
            if !Self::emits(instr.code) {
                continue;
            }
            out.push(self.translate_instr(ir_idx, instr)?);
        }
        Ok(out)
    }

    fn err_type(&self, message: impl std::fmt::Display) -> Error {
        Error::Type(format!("proc `{}`: {}", self.name, message))
    }

    // ===== Refs =====

    fn translate_ref(&mut self, r: &Ref) -> Result<BcRef> {
        let mut bc = BcRef {
            kind: BcRefKind::None,
            offset: r.offset as usize,
            post_offset: r.post_offset as usize,
            indir: r.indir,
            ty: r.ty.clone(),
        };

        match &r.kind {
            RefKind::Null => {}
            RefKind::Local(sym) => {
                bc.kind = BcRefKind::Frame;
                bc.offset += *self
                    .local_offsets
                    .get(sym)
                    .ok_or_else(|| self.err_type(format!("unknown local `%{}`", sym)))?;
            }
            RefKind::Param(sym) => {
                bc.kind = BcRefKind::Arg;
                bc.offset += *self
                    .param_offsets
                    .get(sym)
                    .ok_or_else(|| self.err_type(format!("unknown parameter `%{}`", sym)))?;
            }
            RefKind::Ret => {
                bc.kind = BcRefKind::Ret;
            }
            RefKind::Imm(imm) => {
                let size = r.ty.size.max(1) as usize;
                let raw = imm.bits().to_le_bytes();
                bc.kind = BcRefKind::Rodata;
                bc.offset += self
                    .ctx
                    .alloc_blob(&raw[..size.min(8)], r.ty.align.max(1) as usize);
            }
            RefKind::Global(sym) => {
                let target = ir::find_symbol(self.symbols, *sym)
                    .ok_or_else(|| Error::Link(format!("undefined symbol `{}`", sym)))?;
                match &target.kind {
                    SymbolKind::Proc(_) => {
                        // Procedure value: a cell holding its native entry,
                        // patched once the batch finishes translating.
                        let cell = self.ctx.alloc_blob(&0u64.to_le_bytes(), 8);
                        bc.kind = BcRefKind::Rodata;
                        bc.offset += cell;
                        self.queue.push(*sym);
                        self.fixups.push(ClosureFixup { sym: *sym, cell });
                    }
                    SymbolKind::Data(_) => {
                        bc.kind = BcRefKind::Rodata;
                        bc.offset += self.ctx.data_address(self.symbols, *sym)?;
                    }
                    SymbolKind::Extern(ext) => match ext.kind {
                        ir::ExternKind::Proc { .. } => {
                            let addr = self.ctx.extern_address(self.symbols, *sym)?;
                            bc.kind = BcRefKind::Rodata;
                            bc.offset += self.ctx.alloc_blob(&addr.to_le_bytes(), 8);
                        }
                        ir::ExternKind::Data { .. } => {
                            bc.kind = BcRefKind::Rodata;
                            bc.offset += self.ctx.extern_address(self.symbols, *sym)?;
                        }
                    },
                }
            }
            RefKind::VariadicMarker => {
                return Err(self.err_type("variadic marker outside a call argument list"));
            }
        }
        Ok(bc)
    }

    fn translate_dst(&mut self, arg: &Arg) -> Result<BcArg> {
        match arg {
            Arg::Ref(r) if !r.is_null() => Ok(BcArg::Ref(self.translate_ref(r)?)),
            _ => Ok(BcArg::None),
        }
    }

    /// Translate a call argument list, dropping the variadic marker.
    fn translate_args(&mut self, refs: &[Ref]) -> Result<Vec<BcRef>> {
        let mut out = Vec::with_capacity(refs.len());
        for r in refs {
            if matches!(r.kind, RefKind::VariadicMarker) {
                continue;
            }
            out.push(self.translate_ref(r)?);
        }
        Ok(out)
    }

    // ===== Targets & opcode selection =====

    fn jump_target(&self, ir_idx: usize, arg: &Arg) -> Result<BcArg> {
        let bc_idx = match arg {
            Arg::Label(name) => *self.labels.get(name).ok_or_else(|| {
                Error::Link(format!(
                    "proc `{}`: jump to unknown label `@{}`",
                    self.name, name
                ))
            })?,
            Arg::LabelRel(offset) => {
                let target = ir_idx as i64 + *offset as i64;
                if target < 0 || target as usize >= self.ir2bc.len() {
                    return Err(Error::Link(format!(
                        "proc `{}`: relative jump out of range",
                        self.name
                    )));
                }
                self.ir2bc[target as usize]
            }
            _ => return Err(self.err_type("jump without a label argument")),
        };
        Ok(BcArg::Ref(BcRef {
            kind: BcRefKind::Instr,
            offset: bc_idx,
            post_offset: 0,
            indir: 0,
            ty: self.ctx.types.get_void(),
        }))
    }

    fn size_class(&self, ty: &TypeRef) -> Result<SizeClass> {
        SizeClass::from_size(ty.size)
            .ok_or_else(|| self.err_type(format!("no sized operation for {} bytes", ty.size)))
    }

    fn numeric_of(&self, r: &Ref) -> Result<NumericType> {
        r.ty.as_numeric()
            .ok_or_else(|| self.err_type(format!("numeric operand expected, got `{}`", r.ty)))
    }

    fn int_numeric_of(&self, r: &Ref) -> Result<NumericType> {
        let n = self.numeric_of(r)?;
        if n.is_float() {
            return Err(self.err_type(format!("integer operand expected, got `{}`", r.ty)));
        }
        Ok(n)
    }

    fn arg_ref<'i>(&self, instr: &'i Instr, idx: usize) -> Result<&'i Ref> {
        instr.args[idx]
            .as_ref()
            .ok_or_else(|| self.err_type("missing operand"))
    }

    fn translate_instr(&mut self, ir_idx: usize, instr: &Instr) -> Result<BcInstr> {
        let none = || [BcArg::None, BcArg::None, BcArg::None];

        let bc = match instr.code {
            Opcode::Nop => BcInstr {
                op: BcOp::Nop,
                args: none(),
            },
            Opcode::Ret => BcInstr {
                op: BcOp::Ret,
                args: none(),
            },

            Opcode::Jmp => BcInstr {
                op: BcOp::Jmp,
                args: [
                    BcArg::None,
                    BcArg::None,
                    self.jump_target(ir_idx, &instr.args[2])?,
                ],
            },
            Opcode::Jmpz | Opcode::Jmpnz => {
                let cond = self.arg_ref(instr, 1)?;
                let size = self.size_class(&cond.ty)?;
                let op = if instr.code == Opcode::Jmpz {
                    BcOp::Jmpz(size)
                } else {
                    BcOp::Jmpnz(size)
                };
                BcInstr {
                    op,
                    args: [
                        BcArg::None,
                        BcArg::Ref(self.translate_ref(cond)?),
                        self.jump_target(ir_idx, &instr.args[2])?,
                    ],
                }
            }

            Opcode::Call => return self.translate_call(instr),

            Opcode::Alloc => {
                // Slots were recorded in source order during layout.
                let idx = self
                    .proc
                    .instrs
                    .iter()
                    .take(ir_idx)
                    .filter(|i| i.code == Opcode::Alloc)
                    .count();
                let (offset, ty) = self
                    .alloc_slots
                    .get(&idx)
                    .cloned()
                    .ok_or_else(|| self.err_type("alloc slot missing"))?;
                let slot_ref = BcRef {
                    kind: BcRefKind::Frame,
                    offset,
                    post_offset: 0,
                    indir: 0,
                    ty,
                };
                BcInstr {
                    op: BcOp::Lea,
                    args: [
                        self.translate_dst(&instr.args[0])?,
                        BcArg::Ref(slot_ref),
                        BcArg::None,
                    ],
                }
            }

            Opcode::Load => {
                let dst = self.arg_ref(instr, 0)?;
                let ptr = self.arg_ref(instr, 1)?;
                let src = ptr.clone().deref(dst.ty.clone());
                self.sized_mov(&instr.args[0], &src)?
            }
            Opcode::Store => {
                let ptr = self.arg_ref(instr, 0)?;
                let src = self.arg_ref(instr, 1)?;
                let dst = ptr.clone().deref(src.ty.clone());
                let op = self.mov_op(&src.ty)?;
                BcInstr {
                    op,
                    args: [
                        BcArg::Ref(self.translate_ref(&dst)?),
                        BcArg::Ref(self.translate_ref(src)?),
                        BcArg::None,
                    ],
                }
            }
            Opcode::Mov => {
                let src = self.arg_ref(instr, 1)?.clone();
                self.sized_mov(&instr.args[0], &src)?
            }
            Opcode::Lea => BcInstr {
                op: BcOp::Lea,
                args: [
                    self.translate_dst(&instr.args[0])?,
                    BcArg::Ref(self.translate_ref(self.arg_ref(instr, 1)?)?),
                    BcArg::None,
                ],
            },

            Opcode::Neg
            | Opcode::Add
            | Opcode::Sub
            | Opcode::Mul
            | Opcode::Div
            | Opcode::Mod
            | Opcode::And
            | Opcode::Or
            | Opcode::Xor
            | Opcode::Lsh
            | Opcode::Rsh => {
                let dst = self.arg_ref(instr, 0)?;
                let op = match instr.code {
                    Opcode::Neg => BcOp::Neg(self.numeric_of(dst)?),
                    Opcode::Add => BcOp::Add(self.numeric_of(dst)?),
                    Opcode::Sub => BcOp::Sub(self.numeric_of(dst)?),
                    Opcode::Mul => BcOp::Mul(self.numeric_of(dst)?),
                    Opcode::Div => BcOp::Div(self.numeric_of(dst)?),
                    Opcode::Mod => BcOp::Mod(self.int_numeric_of(dst)?),
                    Opcode::And => BcOp::And(self.int_numeric_of(dst)?),
                    Opcode::Or => BcOp::Or(self.int_numeric_of(dst)?),
                    Opcode::Xor => BcOp::Xor(self.int_numeric_of(dst)?),
                    Opcode::Lsh => BcOp::Lsh(self.int_numeric_of(dst)?),
                    _ => BcOp::Rsh(self.int_numeric_of(dst)?),
                };
                self.expand(instr, op)?
            }

            Opcode::CmpEq
            | Opcode::CmpNe
            | Opcode::CmpLt
            | Opcode::CmpLe
            | Opcode::CmpGt
            | Opcode::CmpGe => {
                let lhs = self.arg_ref(instr, 1)?;
                let nt = self.numeric_of(lhs)?;
                let op = match instr.code {
                    Opcode::CmpEq => BcOp::CmpEq(nt),
                    Opcode::CmpNe => BcOp::CmpNe(nt),
                    Opcode::CmpLt => BcOp::CmpLt(nt),
                    Opcode::CmpLe => BcOp::CmpLe(nt),
                    Opcode::CmpGt => BcOp::CmpGt(nt),
                    _ => BcOp::CmpGe(nt),
                };
                self.expand(instr, op)?
            }

            Opcode::Ext | Opcode::Trunc | Opcode::Fp2i | Opcode::I2fp => {
                let dst = self.arg_ref(instr, 0)?;
                let src = self.arg_ref(instr, 1)?;
                let from = self.numeric_of(src)?;
                let to = self.numeric_of(dst)?;
                let op = match instr.code {
                    Opcode::Ext => BcOp::Ext { from, to },
                    Opcode::Trunc => BcOp::Trunc { from, to },
                    Opcode::Fp2i => BcOp::Fp2i { from, to },
                    _ => BcOp::I2fp { from, to },
                };
                self.expand(instr, op)?
            }

            Opcode::Syscall => {
                let args = match &instr.args[2] {
                    Arg::RefArray(refs) => self.translate_args(refs)?,
                    _ => Vec::new(),
                };
                BcInstr {
                    op: BcOp::Syscall,
                    args: [
                        self.translate_dst(&instr.args[0])?,
                        BcArg::Ref(self.translate_ref(self.arg_ref(instr, 1)?)?),
                        BcArg::RefArray(args),
                    ],
                }
            }

            Opcode::Label | Opcode::Comment => unreachable!("filtered by prepass"),
        };
        Ok(bc)
    }

    fn mov_op(&self, ty: &TypeRef) -> Result<BcOp> {
        Ok(match SizeClass::from_size(ty.size) {
            Some(size) => BcOp::Mov(size),
            None => BcOp::MovN(ty.size as usize),
        })
    }

    fn sized_mov(&mut self, dst: &Arg, src: &Ref) -> Result<BcInstr> {
        let op = self.mov_op(&src.ty)?;
        Ok(BcInstr {
            op,
            args: [
                self.translate_dst(dst)?,
                BcArg::Ref(self.translate_ref(src)?),
                BcArg::None,
            ],
        })
    }

    /// Translate a `dst, lhs[, rhs]` instruction generically.
    fn expand(&mut self, instr: &Instr, op: BcOp) -> Result<BcInstr> {
        Ok(BcInstr {
            op,
            args: [
                self.translate_dst(&instr.args[0])?,
                BcArg::Ref(self.translate_ref(self.arg_ref(instr, 1)?)?),
                match &instr.args[2] {
                    Arg::Ref(r) if !r.is_null() => BcArg::Ref(self.translate_ref(r)?),
                    _ => BcArg::None,
                },
            ],
        })
    }

    fn translate_call(&mut self, instr: &Instr) -> Result<BcInstr> {
        let callee = self.arg_ref(instr, 1)?;
        let arg_refs = match &instr.args[2] {
            Arg::RefArray(refs) => refs.as_slice(),
            _ => &[],
        };
        let args = self.translate_args(arg_refs)?;
        let dst = self.translate_dst(&instr.args[0])?;

        if let RefKind::Global(sym) = &callee.kind {
            let target = ir::find_symbol(self.symbols, *sym)
                .ok_or_else(|| Error::Link(format!("undefined symbol `{}`", sym)))?;
            match &target.kind {
                SymbolKind::Proc(_) => {
                    self.queue.push(*sym);
                    return Ok(BcInstr {
                        op: BcOp::CallJmp,
                        args: [dst, BcArg::ProcName(*sym), BcArg::RefArray(args)],
                    });
                }
                SymbolKind::Extern(ext) if matches!(ext.kind, ir::ExternKind::Proc { .. }) => {
                    let addr = self.ctx.extern_address(self.symbols, *sym)?;
                    let proc_t = self.ctx.extern_sig(self.symbols, *sym)?;
                    return Ok(BcInstr {
                        op: BcOp::CallExt,
                        args: [dst, BcArg::Native { addr, proc_t }, BcArg::RefArray(args)],
                    });
                }
                _ => {
                    return Err(self.err_type(format!("`${}` is not callable", sym)));
                }
            }
        }

        // Indirect: the callee ref's static type carries the signature.
        if callee.ty.as_procedure().is_none() {
            return Err(self.err_type(format!(
                "indirect call through non-procedure type `{}`",
                callee.ty
            )));
        }
        Ok(BcInstr {
            op: BcOp::Call,
            args: [
                dst,
                BcArg::Ref(self.translate_ref(callee)?),
                BcArg::RefArray(args),
            ],
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::atom::Atom;
    use crate::bc::{BcInstr, RunCtx};
    use crate::text::parse_ir;
    use crate::types::TypeStore;
    use parking_lot::Mutex;

    fn fresh_ctx(types: &Arc<TypeStore>) -> Arc<RunCtx> {
        RunCtx::new(types.clone(), Arc::new(Mutex::new(Default::default())))
    }

    const LOOP_IR: &str = r#"
proc helper(:i64 %x) :i64 {
    add :i64 %x, :i64 1 -> :i64 ret
    ret
}

pub proc count(:i64 %n) :i64 {
    mov :i64 0 -> :i64 %i
@loop:
    cmp_ge :i64 %i, :i64 %n -> :u8 %done
    jmpnz :u8 %done, @end
    call :(i64) i64 $helper, (:i64 %i) -> :i64 %i
    jmp @loop
@end:
    mov :i64 %i -> :i64 ret
    ret
}
"#;

    /// Instruction shape with relocated addresses masked out, for
    /// comparing translations across run contexts.
    fn shape(instr: &BcInstr) -> String {
        use std::fmt::Write;
        let mut out = format!("{:?}", instr.op);
        for arg in &instr.args {
            match arg {
                BcArg::None => out.push_str(" _"),
                BcArg::Ref(r) => shape_ref(&mut out, r),
                BcArg::RefArray(refs) => {
                    out.push_str(" [");
                    for r in refs {
                        shape_ref(&mut out, r);
                    }
                    out.push(']');
                }
                BcArg::ProcName(name) => {
                    let _ = write!(out, " proc:{}", name);
                }
                BcArg::Native { proc_t, .. } => {
                    let _ = write!(out, " native:{}", proc_t.id);
                }
            }
        }
        out
    }

    fn shape_ref(out: &mut String, r: &BcRef) {
        use std::fmt::Write;
        let offset = match r.kind {
            // Rodata offsets are absolute addresses; equal streams differ
            // only there.
            BcRefKind::Rodata => 0,
            _ => r.offset,
        };
        let _ = write!(
            out,
            " {:?}+{}+{}^{}:{}",
            r.kind, offset, r.post_offset, r.indir, r.ty.id
        );
    }

    #[test]
    fn test_translation_is_deterministic() {
        let types = Arc::new(TypeStore::new());
        let symbols = parse_ir(LOOP_IR, Atom::intern("det.nkir"), &types).unwrap();

        let ctx_a = fresh_ctx(&types);
        let ctx_b = fresh_ctx(&types);
        let name = Atom::intern("count");
        let a = ctx_a.ensure_translated(&symbols, name).unwrap();
        let b = ctx_b.ensure_translated(&symbols, name).unwrap();

        assert_eq!(a.instrs.len(), b.instrs.len());
        for (x, y) in a.instrs.iter().zip(&b.instrs) {
            assert_eq!(shape(x), shape(y));
        }
        assert_eq!(a.frame_size, b.frame_size);
        assert_eq!(a.args_size, b.args_size);
    }

    #[test]
    fn test_labels_resolve_into_the_procedure() {
        let types = Arc::new(TypeStore::new());
        let symbols = parse_ir(LOOP_IR, Atom::intern("lbl.nkir"), &types).unwrap();
        let ctx = fresh_ctx(&types);
        let proc = ctx
            .ensure_translated(&symbols, Atom::intern("count"))
            .unwrap();

        for instr in &proc.instrs {
            for arg in &instr.args {
                if let BcArg::Ref(r) = arg {
                    if r.kind == BcRefKind::Instr {
                        assert!(r.offset < proc.instrs.len());
                    }
                }
            }
        }
    }

    #[test]
    fn test_pic_conversion_preserves_targets() {
        let types = Arc::new(TypeStore::new());
        let symbols = parse_ir(LOOP_IR, Atom::intern("pic.nkir"), &types).unwrap();
        let proc = symbols[1].as_proc().unwrap();

        let pic = crate::ir::convert_to_pic(&proc.instrs);
        let mut pic_proc = proc.clone();
        pic_proc.instrs = pic;
        let mut pic_symbols = symbols.clone();
        pic_symbols[1] = crate::ir::Symbol::proc("count", pic_proc);

        let ctx = fresh_ctx(&types);
        let translated = ctx
            .ensure_translated(&pic_symbols, Atom::intern("count"))
            .unwrap();
        for instr in &translated.instrs {
            for arg in &instr.args {
                if let BcArg::Ref(r) = arg {
                    if r.kind == BcRefKind::Instr {
                        assert!(r.offset < translated.instrs.len());
                    }
                }
            }
        }
    }

    #[test]
    fn test_translation_is_idempotent() {
        let types = Arc::new(TypeStore::new());
        let symbols = parse_ir(LOOP_IR, Atom::intern("idem.nkir"), &types).unwrap();
        let ctx = fresh_ctx(&types);
        let name = Atom::intern("count");

        let first = ctx.ensure_translated(&symbols, name).unwrap();
        let second = ctx.ensure_translated(&symbols, name).unwrap();
        assert!(Arc::ptr_eq(&first, &second));

        // Referenced procedures were translated by the same batch.
        assert!(ctx.procs.contains_key(&Atom::intern("helper")));
    }

    #[test]
    fn test_frame_layout_assigns_aligned_slots() {
        let types = Arc::new(TypeStore::new());
        let symbols = parse_ir(
            r#"
pub proc mixed() :i64 {
    mov :i8 1 -> :i8 %small
    mov :f64 2.0 -> :f64 %wide
    mov :i8 %small -> :i8 %small
    mov :i64 3 -> :i64 ret
    ret
}
"#,
            Atom::intern("frame.nkir"),
            &types,
        )
        .unwrap();
        let ctx = fresh_ctx(&types);
        let proc = ctx
            .ensure_translated(&symbols, Atom::intern("mixed"))
            .unwrap();
        assert!(proc.frame_size >= 9);
        assert_eq!(proc.frame_size % proc.frame_align, 0);
    }

    #[test]
    fn test_variadic_bytecode_proc_rejected() {
        let types = Arc::new(TypeStore::new());
        let symbols = parse_ir(
            "pub proc bad(:i64 %x, ...) :i64 {\n    ret\n}\n",
            Atom::intern("var.nkir"),
            &types,
        )
        .unwrap();
        let ctx = fresh_ctx(&types);
        let err = ctx.ensure_translated(&symbols, Atom::intern("bad"));
        assert!(matches!(err, Err(Error::Unsupported(_))));
    }
}
