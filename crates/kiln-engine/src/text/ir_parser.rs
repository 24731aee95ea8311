//! Parser for the textual IR format.
//!
//! Line oriented: a newline terminates an instruction. Top-level
//! declarations are procedures, data/const definitions, and extern
//! declarations, in any order. The grammar matches what the inspector
//! prints, so modules round-trip through text.

use rustc_hash::FxHashMap;

use crate::atom::Atom;
use crate::error::{Error, Result};
use crate::ir::{
    self, make_alloc, make_call, make_label, make_ret, make_syscall, Arg, Instr, Label, Opcode,
    Param, Proc, Ref, Reloc, Symbol, Visibility,
};
use crate::ir::{make_ref_global, make_ref_imm, make_ref_local, make_ref_param, make_ref_ret};
use crate::ir::{make_variadic_marker, Imm};
use crate::text::lexer::{lex, unescape_string, Tok, Token};
use crate::types::{NumericType, TypeKind, TypeRef, TypeStore};

struct IrParser<'a> {
    src: &'a str,
    file: Atom,
    tokens: Vec<Token>,
    pos: usize,
    types: &'a TypeStore,
    /// Parameter names of the procedure being parsed.
    params: FxHashMap<Atom, TypeRef>,
    /// Name of the return slot, when the procedure gave it one.
    ret_name: Atom,
}

/// Parse textual IR into a symbol list.
pub fn parse_ir(src: &str, file: Atom, types: &TypeStore) -> Result<Vec<Symbol>> {
    let tokens = lex(src).map_err(|offset| {
        let token = Token {
            tok: Tok::Eof,
            start: offset,
            len: 1,
        };
        Error::parse("unexpected character", Some(token.loc(file, src)))
    })?;

    let mut parser = IrParser {
        src,
        file,
        tokens,
        pos: 0,
        types,
        params: FxHashMap::default(),
        ret_name: Atom::NONE,
    };
    parser.parse_module()
}

impl<'a> IrParser<'a> {
    fn cur(&self) -> Token {
        self.tokens[self.pos]
    }

    fn at(&self, tok: Tok) -> bool {
        self.cur().tok == tok
    }

    fn bump(&mut self) -> Token {
        let token = self.cur();
        if !self.at(Tok::Eof) {
            self.pos += 1;
        }
        token
    }

    fn accept(&mut self, tok: Tok) -> bool {
        if self.at(tok) {
            self.bump();
            true
        } else {
            false
        }
    }

    fn expect(&mut self, tok: Tok) -> Result<Token> {
        if self.at(tok) {
            Ok(self.bump())
        } else {
            Err(self.error(format!(
                "expected {} before {}",
                tok.describe(),
                self.cur().tok.describe()
            )))
        }
    }

    fn error(&self, message: impl Into<String>) -> Error {
        Error::parse(message, Some(self.cur().loc(self.file, self.src)))
    }

    fn text(&self, token: Token) -> &'a str {
        token.text(self.src)
    }

    fn skip_newlines(&mut self) {
        while self.accept(Tok::Newline) {}
    }

    fn end_of_line(&mut self) -> Result<()> {
        if self.at(Tok::Eof) {
            return Ok(());
        }
        self.expect(Tok::Newline)?;
        self.skip_newlines();
        Ok(())
    }

    // ===== Declarations =====

    fn parse_module(&mut self) -> Result<Vec<Symbol>> {
        let mut symbols = Vec::new();
        self.skip_newlines();
        while !self.at(Tok::Eof) {
            symbols.push(self.parse_symbol()?);
            self.skip_newlines();
        }
        Ok(symbols)
    }

    fn parse_symbol(&mut self) -> Result<Symbol> {
        let vis = if self.accept(Tok::Pub) {
            Visibility::Default
        } else if self.accept(Tok::Local) {
            Visibility::Local
        } else if self.accept(Tok::Protected) {
            Visibility::Protected
        } else if self.accept(Tok::Internal) {
            Visibility::Internal
        } else {
            Visibility::Hidden
        };
        let thread_local = self.accept(Tok::ThreadLocal);

        let mut sym = if self.accept(Tok::Proc) {
            self.parse_proc()?
        } else if self.accept(Tok::Const) {
            self.parse_data(true)?
        } else if self.accept(Tok::Data) {
            self.parse_data(false)?
        } else if self.accept(Tok::Extern) {
            self.parse_extern()?
        } else {
            return Err(self.error(format!(
                "expected declaration, found {}",
                self.cur().tok.describe()
            )));
        };
        sym.vis = vis;
        sym.thread_local = thread_local;
        Ok(sym)
    }

    fn parse_symbol_name(&mut self) -> Result<Atom> {
        let token = self.cur();
        match token.tok {
            Tok::Dollar => {
                self.bump();
                Ok(Atom::intern(&self.text(token)[1..]))
            }
            Tok::Id => {
                self.bump();
                Ok(Atom::intern(self.text(token)))
            }
            _ => Err(self.error("expected symbol name")),
        }
    }

    fn parse_proc(&mut self) -> Result<Symbol> {
        let name = self.parse_symbol_name()?;

        self.expect(Tok::LParen)?;
        let mut params = Vec::new();
        let mut variadic = false;
        if !self.at(Tok::RParen) {
            loop {
                if self.accept(Tok::Ellipsis) {
                    variadic = true;
                    break;
                }
                self.expect(Tok::Colon)?;
                let ty = self.parse_type()?;
                let pname = if self.at(Tok::Percent) {
                    let token = self.bump();
                    Atom::intern(&self.text(token)[1..])
                } else {
                    Atom::NONE
                };
                params.push(Param { name: pname, ty });
                if !self.accept(Tok::Comma) {
                    break;
                }
            }
        }
        self.expect(Tok::RParen)?;

        self.expect(Tok::Colon)?;
        let ret_t = self.parse_type()?;
        let ret_name = if self.at(Tok::Percent) {
            let token = self.bump();
            Atom::intern(&self.text(token)[1..])
        } else {
            Atom::NONE
        };

        self.params = params
            .iter()
            .filter(|p| !p.name.is_none())
            .map(|p| (p.name, p.ty.clone()))
            .collect();
        self.ret_name = ret_name;

        self.expect(Tok::LBrace)?;
        self.skip_newlines();

        let mut instrs = Vec::new();
        while !self.at(Tok::RBrace) && !self.at(Tok::Eof) {
            instrs.push(self.parse_instr()?);
        }
        self.expect(Tok::RBrace)?;
        self.end_of_line()?;

        self.params.clear();
        self.ret_name = Atom::NONE;

        Ok(Symbol::proc(
            name,
            Proc {
                params,
                ret: Param {
                    name: ret_name,
                    ty: ret_t,
                },
                instrs,
                variadic,
            },
        ))
    }

    // ===== Instructions =====

    fn parse_instr(&mut self) -> Result<Instr> {
        if self.at(Tok::LabelName) {
            let token = self.bump();
            let name = Atom::intern(&self.text(token)[1..]);
            self.expect(Tok::Colon)?;
            self.end_of_line()?;
            return Ok(make_label(name));
        }

        let token = self.expect(Tok::Id)?;
        let opcode = self.text(token);
        let instr = match opcode {
            "nop" => ir::make_nop(),
            "ret" => make_ret(),
            "jmp" => ir::make_jmp(self.parse_label()?),
            "jmpz" => {
                let cond = self.parse_ref()?;
                self.expect(Tok::Comma)?;
                ir::make_jmpz(cond, self.parse_label()?)
            }
            "jmpnz" => {
                let cond = self.parse_ref()?;
                self.expect(Tok::Comma)?;
                ir::make_jmpnz(cond, self.parse_label()?)
            }
            "call" => {
                let proc = self.parse_ref()?;
                self.expect(Tok::Comma)?;
                let args = self.parse_ref_list()?;
                let dst = self.parse_dst()?;
                make_call(dst, proc, args)
            }
            "syscall" => {
                let n = self.parse_ref()?;
                self.expect(Tok::Comma)?;
                let args = self.parse_ref_list()?;
                let dst = self.parse_dst()?;
                make_syscall(dst, n, args)
            }
            "alloc" => {
                self.expect(Tok::Colon)?;
                let ty = self.parse_type()?;
                let dst = self.parse_dst()?;
                make_alloc(dst, ty)
            }
            "load" | "store" | "mov" | "lea" | "neg" | "ext" | "trunc" | "fp2i" | "i2fp" => {
                let src = self.parse_ref()?;
                let dst = self.parse_dst()?;
                let code = match opcode {
                    "load" => Opcode::Load,
                    "store" => Opcode::Store,
                    "mov" => Opcode::Mov,
                    "lea" => Opcode::Lea,
                    "neg" => Opcode::Neg,
                    "ext" => Opcode::Ext,
                    "trunc" => Opcode::Trunc,
                    "fp2i" => Opcode::Fp2i,
                    _ => Opcode::I2fp,
                };
                Instr::new(code, [Arg::Ref(dst), Arg::Ref(src), Arg::None])
            }
            "add" | "sub" | "mul" | "div" | "mod" | "and" | "or" | "xor" | "lsh" | "rsh"
            | "cmp_eq" | "cmp_ne" | "cmp_lt" | "cmp_le" | "cmp_gt" | "cmp_ge" => {
                let lhs = self.parse_ref()?;
                self.expect(Tok::Comma)?;
                let rhs = self.parse_ref()?;
                let dst = self.parse_dst()?;
                let code = match opcode {
                    "add" => Opcode::Add,
                    "sub" => Opcode::Sub,
                    "mul" => Opcode::Mul,
                    "div" => Opcode::Div,
                    "mod" => Opcode::Mod,
                    "and" => Opcode::And,
                    "or" => Opcode::Or,
                    "xor" => Opcode::Xor,
                    "lsh" => Opcode::Lsh,
                    "rsh" => Opcode::Rsh,
                    "cmp_eq" => Opcode::CmpEq,
                    "cmp_ne" => Opcode::CmpNe,
                    "cmp_lt" => Opcode::CmpLt,
                    "cmp_le" => Opcode::CmpLe,
                    "cmp_gt" => Opcode::CmpGt,
                    _ => Opcode::CmpGe,
                };
                Instr::new(code, [Arg::Ref(dst), Arg::Ref(lhs), Arg::Ref(rhs)])
            }
            other => return Err(self.error(format!("unknown instruction `{}`", other))),
        };
        self.end_of_line()?;
        Ok(instr)
    }

    fn parse_label(&mut self) -> Result<Label> {
        let token = self.cur();
        match token.tok {
            Tok::LabelName => {
                self.bump();
                Ok(Label::Abs(Atom::intern(&self.text(token)[1..])))
            }
            Tok::LabelRel => {
                self.bump();
                let text = &self.text(token)[1..];
                let offset: i32 = text
                    .parse()
                    .map_err(|_| self.error("invalid relative label"))?;
                Ok(Label::Rel(offset))
            }
            _ => Err(self.error("expected label")),
        }
    }

    fn parse_dst(&mut self) -> Result<Ref> {
        if self.accept(Tok::Arrow) {
            self.parse_ref()
        } else {
            Ok(ir::make_ref_null(self.types.get_void()))
        }
    }

    fn parse_ref_list(&mut self) -> Result<Vec<Ref>> {
        self.expect(Tok::LParen)?;
        let mut refs = Vec::new();
        if !self.at(Tok::RParen) {
            loop {
                refs.push(self.parse_ref()?);
                if !self.accept(Tok::Comma) {
                    break;
                }
            }
        }
        self.expect(Tok::RParen)?;
        Ok(refs)
    }

    // ===== Refs =====

    fn parse_ref(&mut self) -> Result<Ref> {
        if self.accept(Tok::Ellipsis) {
            return Ok(make_variadic_marker(self.types.get_void()));
        }

        self.expect(Tok::Colon)?;
        let ty = self.parse_type()?;

        let mut indir: u8 = 0;
        while self.accept(Tok::LBracket) {
            indir += 1;
        }

        let token = self.cur();
        let mut r = match token.tok {
            Tok::Percent => {
                self.bump();
                let name = Atom::intern(&self.text(token)[1..]);
                if self.params.contains_key(&name) {
                    make_ref_param(name, ty)
                } else if name == self.ret_name {
                    make_ref_ret(ty)
                } else {
                    make_ref_local(name, ty)
                }
            }
            Tok::Dollar => {
                self.bump();
                make_ref_global(Atom::intern(&self.text(token)[1..]), ty)
            }
            Tok::Id if self.text(token) == "ret" => {
                self.bump();
                make_ref_ret(ty)
            }
            Tok::Id if self.text(token) == "null" => {
                self.bump();
                ir::make_ref_null(ty)
            }
            Tok::Int => {
                self.bump();
                let imm = self.parse_int_imm(self.text(token), &ty)?;
                make_ref_imm(imm, ty)
            }
            Tok::Float => {
                self.bump();
                let imm = self.parse_float_imm(self.text(token), &ty)?;
                make_ref_imm(imm, ty)
            }
            _ => return Err(self.error("expected reference")),
        };

        if self.accept(Tok::Plus) {
            let token = self.expect(Tok::Int)?;
            let offset: u64 = self
                .text(token)
                .parse()
                .map_err(|_| self.error("invalid offset"))?;
            r = r.with_offset(offset);
        }
        for _ in 0..indir {
            self.expect(Tok::RBracket)?;
        }
        if indir > 0 && self.accept(Tok::Plus) {
            let token = self.expect(Tok::Int)?;
            let post: u64 = self
                .text(token)
                .parse()
                .map_err(|_| self.error("invalid offset"))?;
            r = r.with_post_offset(post);
        }
        r.indir = indir;
        Ok(r)
    }

    fn parse_int_imm(&self, text: &str, ty: &TypeRef) -> Result<Imm> {
        let value: i128 = text
            .parse()
            .map_err(|_| self.error("failed to parse integer constant"))?;
        match ty.as_numeric() {
            Some(n) if n.is_float() => Ok(if n == NumericType::Float32 {
                Imm::from_f32(value as f32)
            } else {
                Imm::from_f64(value as f64)
            }),
            _ => Ok(Imm::from_bits(value as u64)),
        }
    }

    fn parse_float_imm(&self, text: &str, ty: &TypeRef) -> Result<Imm> {
        let value: f64 = text
            .parse()
            .map_err(|_| self.error("failed to parse float constant"))?;
        match ty.as_numeric() {
            Some(NumericType::Float32) => Ok(Imm::from_f32(value as f32)),
            Some(n) if n.is_float() => Ok(Imm::from_f64(value)),
            _ => Err(self.error("float constant used with non-float type")),
        }
    }

    // ===== Types =====

    fn parse_type(&mut self) -> Result<TypeRef> {
        if self.accept(Tok::Star) {
            let target = self.parse_type()?;
            return Ok(self.types.get_pointer(target));
        }
        if self.accept(Tok::LBrace) {
            let mut elems = Vec::new();
            if !self.at(Tok::RBrace) {
                loop {
                    let count = if self.accept(Tok::LBracket) {
                        let token = self.expect(Tok::Int)?;
                        let count: u64 = self
                            .text(token)
                            .parse()
                            .map_err(|_| self.error("invalid element count"))?;
                        self.expect(Tok::RBracket)?;
                        count
                    } else {
                        1
                    };
                    let ty = self.parse_type()?;
                    elems.push((ty, count));
                    if !self.accept(Tok::Comma) {
                        break;
                    }
                }
            }
            self.expect(Tok::RBrace)?;
            return Ok(self.types.get_aggregate(&elems));
        }
        if self.accept(Tok::LParen) {
            let mut param_types = Vec::new();
            let mut variadic = false;
            if !self.at(Tok::RParen) {
                loop {
                    if self.accept(Tok::Ellipsis) {
                        variadic = true;
                        break;
                    }
                    param_types.push(self.parse_type()?);
                    if !self.accept(Tok::Comma) {
                        break;
                    }
                }
            }
            self.expect(Tok::RParen)?;
            let ret_t = self.parse_type()?;
            return Ok(self.types.get_procedure(crate::types::ProcInfo {
                param_types,
                ret_t,
                call_conv: crate::types::CallConv::Cdecl,
                variadic,
            }));
        }

        let token = self.expect(Tok::Id)?;
        let name = self.text(token);
        if name == "void" {
            return Ok(self.types.get_void());
        }
        NumericType::from_name(name)
            .map(|n| self.types.get_numeric(n))
            .ok_or_else(|| self.error(format!("unknown type `{}`", name)))
    }

    // ===== Data =====

    fn parse_data(&mut self, read_only: bool) -> Result<Symbol> {
        let name = self.parse_symbol_name()?;
        self.expect(Tok::Colon)?;
        let ty = self.parse_type()?;

        let mut bytes = None;
        let mut relocs = Vec::new();
        if self.accept(Tok::Eq) {
            let mut buf = vec![0u8; ty.size as usize];
            self.parse_value(&mut buf, 0, &ty, &mut relocs)?;
            bytes = Some(buf);
        }
        self.end_of_line()?;

        Ok(Symbol::data(
            name,
            ir::Data {
                ty,
                bytes,
                relocs,
                read_only,
            },
        ))
    }

    fn parse_value(
        &mut self,
        buf: &mut [u8],
        offset: u64,
        ty: &TypeRef,
        relocs: &mut Vec<Reloc>,
    ) -> Result<()> {
        match &ty.kind {
            TypeKind::Numeric(value_type) => {
                let token = self.cur();
                let imm = match token.tok {
                    Tok::Int => {
                        self.bump();
                        self.parse_int_imm(self.text(token), ty)?
                    }
                    Tok::Float => {
                        self.bump();
                        self.parse_float_imm(self.text(token), ty)?
                    }
                    _ => return Err(self.error("expected numeric constant")),
                };
                let raw = imm.bytes(*value_type);
                let start = offset as usize;
                buf[start..start + raw.len()].copy_from_slice(&raw);
                Ok(())
            }
            TypeKind::Pointer(_) | TypeKind::Procedure(_) => {
                if self.at(Tok::Dollar) {
                    let token = self.bump();
                    relocs.push(Reloc {
                        sym: Atom::intern(&self.text(token)[1..]),
                        offset,
                    });
                    Ok(())
                } else {
                    let token = self.expect(Tok::Int)?;
                    let value: u64 = self
                        .text(token)
                        .parse()
                        .map_err(|_| self.error("invalid pointer constant"))?;
                    let start = offset as usize;
                    buf[start..start + 8].copy_from_slice(&value.to_le_bytes());
                    Ok(())
                }
            }
            TypeKind::Aggregate(elems) => {
                self.expect(Tok::LBrace)?;
                for (i, elem) in elems.iter().enumerate() {
                    if i > 0 {
                        self.expect(Tok::Comma)?;
                    }
                    let elem_offset = offset + elem.offset;

                    // Byte arrays may be written as string literals.
                    if self.at(Tok::Str) {
                        let token = self.bump();
                        let text = unescape_string(self.text(token));
                        let start = elem_offset as usize;
                        let max = (elem.count * elem.ty.size) as usize;
                        let raw = text.as_bytes();
                        if raw.len() > max {
                            return Err(self.error("string constant longer than element"));
                        }
                        buf[start..start + raw.len()].copy_from_slice(raw);
                        continue;
                    }

                    if elem.count > 1 {
                        self.expect(Tok::LBracket)?;
                        for c in 0..elem.count {
                            if c > 0 {
                                self.expect(Tok::Comma)?;
                            }
                            self.parse_value(
                                buf,
                                elem_offset + c * elem.ty.size,
                                &elem.ty,
                                relocs,
                            )?;
                        }
                        self.expect(Tok::RBracket)?;
                    } else {
                        self.parse_value(buf, elem_offset, &elem.ty, relocs)?;
                    }
                }
                self.expect(Tok::RBrace)?;
                Ok(())
            }
        }
    }

    // ===== Externs =====

    fn parse_extern(&mut self) -> Result<Symbol> {
        let lib = if self.at(Tok::Str) {
            let token = self.bump();
            Atom::intern(&unescape_string(self.text(token)))
        } else {
            Atom::NONE
        };

        if self.accept(Tok::Proc) {
            let name = self.parse_symbol_name()?;
            self.expect(Tok::LParen)?;
            let mut param_types = Vec::new();
            let mut variadic = false;
            if !self.at(Tok::RParen) {
                loop {
                    if self.accept(Tok::Ellipsis) {
                        variadic = true;
                        break;
                    }
                    self.expect(Tok::Colon)?;
                    param_types.push(self.parse_type()?);
                    if self.at(Tok::Percent) {
                        self.bump();
                    }
                    if !self.accept(Tok::Comma) {
                        break;
                    }
                }
            }
            self.expect(Tok::RParen)?;
            self.expect(Tok::Colon)?;
            let ret_t = self.parse_type()?;
            self.end_of_line()?;
            Ok(Symbol::extern_(
                name,
                ir::Extern {
                    lib,
                    kind: ir::ExternKind::Proc {
                        param_types,
                        ret_t,
                        variadic,
                    },
                },
            ))
        } else if self.accept(Tok::Data) {
            let name = self.parse_symbol_name()?;
            self.expect(Tok::Colon)?;
            let ty = self.parse_type()?;
            self.end_of_line()?;
            Ok(Symbol::extern_(
                name,
                ir::Extern {
                    lib,
                    kind: ir::ExternKind::Data { ty },
                },
            ))
        } else {
            Err(self.error("expected `proc` or `data` after `extern`"))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::RefKind;

    fn parse(src: &str) -> Vec<Symbol> {
        let store = TypeStore::new();
        parse_ir(src, Atom::intern("test.nkir"), &store).unwrap()
    }

    #[test]
    fn test_parse_plus_proc() {
        let symbols = parse(
            "pub proc plus(:i64 %a, :i64 %b) :i64 {\n    add :i64 %a, :i64 %b -> :i64 ret\n    ret\n}\n",
        );
        assert_eq!(symbols.len(), 1);
        let proc = symbols[0].as_proc().unwrap();
        assert_eq!(symbols[0].vis, Visibility::Default);
        assert_eq!(proc.params.len(), 2);
        assert_eq!(proc.instrs.len(), 2);
        assert_eq!(proc.instrs[0].code, Opcode::Add);
        assert!(matches!(
            proc.instrs[0].args[1].as_ref().unwrap().kind,
            RefKind::Param(_)
        ));
        assert!(matches!(
            proc.instrs[0].args[0].as_ref().unwrap().kind,
            RefKind::Ret
        ));
    }

    #[test]
    fn test_parse_labels_and_jumps() {
        let symbols = parse(
            "proc f(:i64 %x) :i64 {\n@start:\n    jmpz :i64 %x, @done\n    jmp @start\n@done:\n    ret\n}\n",
        );
        let proc = symbols[0].as_proc().unwrap();
        assert_eq!(symbols[0].vis, Visibility::Hidden);
        assert_eq!(proc.instrs[0].code, Opcode::Label);
        assert!(matches!(proc.instrs[1].args[2], Arg::Label(_)));
    }

    #[test]
    fn test_parse_extern_variadic() {
        let symbols = parse("extern \"c\" proc printf(:*i8, ...) :i32\n");
        let ext = symbols[0].as_extern().unwrap();
        assert_eq!(ext.lib.as_str(), "c");
        match &ext.kind {
            ir::ExternKind::Proc {
                param_types,
                variadic,
                ..
            } => {
                assert_eq!(param_types.len(), 1);
                assert!(variadic);
            }
            _ => panic!("expected extern proc"),
        }
    }

    #[test]
    fn test_parse_const_string_data() {
        let symbols = parse("const fmt :{[4]i8} = {\"ab\\n\"}\n");
        let data = symbols[0].as_data().unwrap();
        assert!(data.read_only);
        assert_eq!(data.bytes.as_deref().unwrap(), b"ab\n\0");
    }

    #[test]
    fn test_parse_data_with_reloc() {
        let symbols = parse("data table :{*i8, i64} = {$fmt, 7}\n");
        let data = symbols[0].as_data().unwrap();
        assert_eq!(data.relocs.len(), 1);
        assert_eq!(data.relocs[0].sym.as_str(), "fmt");
        assert_eq!(data.relocs[0].offset, 0);
        assert_eq!(&data.bytes.as_deref().unwrap()[8..16], &7u64.to_le_bytes());
    }

    #[test]
    fn test_parse_indirect_ref() {
        let symbols = parse(
            "proc f(:*f64 %v) :f64 {\n    mov :f64 [%v]+8 -> :f64 ret\n    ret\n}\n",
        );
        let proc = symbols[0].as_proc().unwrap();
        let src = proc.instrs[0].args[1].as_ref().unwrap();
        assert_eq!(src.indir, 1);
        assert_eq!(src.post_offset, 8);
    }

    #[test]
    fn test_parse_call_with_args() {
        let symbols = parse(
            "proc f() :i64 {\n    call :(i64, i64) i64 $plus, (:i64 4, :i64 5) -> :i64 ret\n    ret\n}\n",
        );
        let proc = symbols[0].as_proc().unwrap();
        assert_eq!(proc.instrs[0].code, Opcode::Call);
        match &proc.instrs[0].args[2] {
            Arg::RefArray(refs) => assert_eq!(refs.len(), 2),
            other => panic!("expected ref array, got {:?}", other),
        }
    }

    #[test]
    fn test_parse_error_has_location() {
        let store = TypeStore::new();
        let err = parse_ir(
            "proc f() :i64 {\n    bogus\n}\n",
            Atom::intern("bad.nkir"),
            &store,
        )
        .unwrap_err();
        match err {
            Error::Parse { loc: Some(loc), .. } => assert_eq!(loc.line, 2),
            other => panic!("expected located parse error, got {:?}", other),
        }
    }

    #[test]
    fn test_round_trip_through_inspector() {
        let store = TypeStore::new();
        let src = "pub proc plus(:i64 %a, :i64 %b) :i64 {\n    add :i64 %a, :i64 %b -> :i64 ret\n    ret\n}\n";
        let symbols = parse_ir(src, Atom::intern("rt.nkir"), &store).unwrap();
        let mut printed = String::new();
        crate::ir::inspect::write_symbols(&mut printed, &symbols).unwrap();
        let reparsed = parse_ir(&printed, Atom::intern("rt2.nkir"), &store).unwrap();
        assert_eq!(reparsed.len(), symbols.len());
        let mut printed_again = String::new();
        crate::ir::inspect::write_symbols(&mut printed_again, &reparsed).unwrap();
        assert_eq!(printed, printed_again);
    }
}
