//! Lexer for the textual IR and AST file formats.
//!
//! Tokenization is shared between the two formats; newline tokens are
//! significant for the IR grammar (an instruction ends at end of line) and
//! ignored by the s-expression grammar. A `#!` shebang is honored on the
//! first line only.

use logos::Logos;

use crate::atom::Atom;
use crate::error::SourceLoc;

#[derive(Logos, Debug, Clone, Copy, PartialEq, Eq)]
#[logos(skip r"[ \t\r]+")]
#[logos(skip r"//[^\n]*")]
#[logos(skip r"/\*(?:[^*]|\*[^/])*\*/")]
pub enum Tok {
    /// One or more newlines; terminates an instruction.
    #[regex(r"\n+")]
    Newline,

    // ===== Keywords =====
    #[token("pub")]
    Pub,
    #[token("protected")]
    Protected,
    #[token("internal")]
    Internal,
    #[token("local")]
    Local,
    #[token("thread_local")]
    ThreadLocal,
    #[token("proc")]
    Proc,
    #[token("data")]
    Data,
    #[token("const")]
    Const,
    #[token("extern")]
    Extern,

    // ===== Tagged identifiers =====
    /// `%name` — local or parameter.
    #[regex(r"%[a-zA-Z_][a-zA-Z0-9_]*")]
    Percent,
    /// `$name` — global symbol.
    #[regex(r"\$[a-zA-Z_][a-zA-Z0-9_]*")]
    Dollar,
    /// `@name` — label.
    #[regex(r"@[a-zA-Z_][a-zA-Z0-9_]*")]
    LabelName,
    /// `@+N` / `@-N` — instruction-relative label.
    #[regex(r"@[+-][0-9]+")]
    LabelRel,

    // ===== Literals =====
    #[regex(r"-?[0-9]+")]
    Int,
    #[regex(r"-?[0-9]+\.[0-9]*(?:[eE][+-]?[0-9]+)?")]
    #[regex(r"-?[0-9]+[eE][+-]?[0-9]+")]
    Float,
    #[regex(r#""(?:[^"\\\n]|\\[^\n]|\\\n)*""#)]
    Str,

    #[regex(r"[a-zA-Z_][a-zA-Z0-9_]*")]
    Id,

    // ===== Punctuation =====
    #[token("(")]
    LParen,
    #[token(")")]
    RParen,
    #[token("{")]
    LBrace,
    #[token("}")]
    RBrace,
    #[token("[")]
    LBracket,
    #[token("]")]
    RBracket,
    #[token(",")]
    Comma,
    #[token(":")]
    Colon,
    #[token("=")]
    Eq,
    #[token("*")]
    Star,
    #[token("+")]
    Plus,
    #[token("->")]
    Arrow,
    #[token("...")]
    Ellipsis,

    /// Synthetic end-of-input token appended by [`lex`].
    Eof,
}

impl Tok {
    pub fn describe(self) -> &'static str {
        match self {
            Tok::Newline => "newline",
            Tok::Pub => "`pub`",
            Tok::Protected => "`protected`",
            Tok::Internal => "`internal`",
            Tok::Local => "`local`",
            Tok::ThreadLocal => "`thread_local`",
            Tok::Proc => "`proc`",
            Tok::Data => "`data`",
            Tok::Const => "`const`",
            Tok::Extern => "`extern`",
            Tok::Percent => "`%` name",
            Tok::Dollar => "`$` name",
            Tok::LabelName => "label",
            Tok::LabelRel => "relative label",
            Tok::Int => "integer constant",
            Tok::Float => "float constant",
            Tok::Str => "string constant",
            Tok::Id => "identifier",
            Tok::LParen => "`(`",
            Tok::RParen => "`)`",
            Tok::LBrace => "`{`",
            Tok::RBrace => "`}`",
            Tok::LBracket => "`[`",
            Tok::RBracket => "`]`",
            Tok::Comma => "`,`",
            Tok::Colon => "`:`",
            Tok::Eq => "`=`",
            Tok::Star => "`*`",
            Tok::Plus => "`+`",
            Tok::Arrow => "`->`",
            Tok::Ellipsis => "`...`",
            Tok::Eof => "end of file",
        }
    }
}

/// One token with its source span.
#[derive(Debug, Clone, Copy)]
pub struct Token {
    pub tok: Tok,
    pub start: u32,
    pub len: u32,
}

impl Token {
    /// Slice the token's text out of the source.
    pub fn text(self, src: &str) -> &str {
        &src[self.start as usize..(self.start + self.len) as usize]
    }

    /// Compute line/column for diagnostics.
    pub fn loc(self, file: Atom, src: &str) -> SourceLoc {
        let upto = &src[..self.start as usize];
        let line = upto.bytes().filter(|&b| b == b'\n').count() as u32 + 1;
        let col = (self.start as usize - upto.rfind('\n').map(|i| i + 1).unwrap_or(0)) as u32 + 1;
        SourceLoc {
            file,
            line,
            col,
            len: self.len,
        }
    }
}

/// Tokenize `src`. Returns `Err` with the byte offset of the first
/// unrecognized character.
pub fn lex(src: &str) -> Result<Vec<Token>, u32> {
    let mut start = 0usize;
    if src.starts_with("#!") {
        start = src.find('\n').unwrap_or(src.len());
    }

    let mut tokens = Vec::with_capacity(src.len() / 4);
    let mut lexer = Tok::lexer(&src[start..]);
    while let Some(item) = lexer.next() {
        let span = lexer.span();
        match item {
            Ok(tok) => tokens.push(Token {
                tok,
                start: (start + span.start) as u32,
                len: (span.end - span.start) as u32,
            }),
            Err(()) => return Err((start + span.start) as u32),
        }
    }
    tokens.push(Token {
        tok: Tok::Eof,
        start: src.len() as u32,
        len: 0,
    });
    Ok(tokens)
}

/// Decode the escapes of a quoted string literal (quotes included).
pub fn unescape_string(quoted: &str) -> String {
    let inner = &quoted[1..quoted.len() - 1];
    let mut out = String::with_capacity(inner.len());
    let mut chars = inner.chars();
    while let Some(c) = chars.next() {
        if c != '\\' {
            out.push(c);
            continue;
        }
        match chars.next() {
            Some('n') => out.push('\n'),
            Some('t') => out.push('\t'),
            Some('0') => out.push('\0'),
            Some('\\') => out.push('\\'),
            Some('"') => out.push('"'),
            // Escaped newline: line continuation, contributes nothing.
            Some('\n') => {}
            Some(other) => {
                out.push('\\');
                out.push(other);
            }
            None => out.push('\\'),
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn kinds(src: &str) -> Vec<Tok> {
        lex(src).unwrap().into_iter().map(|t| t.tok).collect()
    }

    #[test]
    fn test_basic_tokens() {
        assert_eq!(
            kinds("pub proc $f(:i64 %a) :i64 {"),
            vec![
                Tok::Pub,
                Tok::Proc,
                Tok::Dollar,
                Tok::LParen,
                Tok::Colon,
                Tok::Id,
                Tok::Percent,
                Tok::RParen,
                Tok::Colon,
                Tok::Id,
                Tok::LBrace,
                Tok::Eof,
            ]
        );
    }

    #[test]
    fn test_newlines_are_tokens() {
        assert_eq!(
            kinds("ret\n\nret\n"),
            vec![Tok::Id, Tok::Newline, Tok::Id, Tok::Newline, Tok::Eof]
        );
    }

    #[test]
    fn test_comments_skipped() {
        assert_eq!(
            kinds("a // trailing\nb /* inline */ c"),
            vec![Tok::Id, Tok::Newline, Tok::Id, Tok::Id, Tok::Eof]
        );
    }

    #[test]
    fn test_shebang_first_line_only() {
        assert_eq!(kinds("#!/usr/bin/env kiln\nx"), vec![Tok::Newline, Tok::Id, Tok::Eof]);
    }

    #[test]
    fn test_numbers() {
        assert_eq!(kinds("42 -7 3.5 1e9 -2.5e-3"), vec![
            Tok::Int,
            Tok::Int,
            Tok::Float,
            Tok::Float,
            Tok::Float,
            Tok::Eof,
        ]);
    }

    #[test]
    fn test_labels() {
        assert_eq!(
            kinds("@loop @+3 @-2"),
            vec![Tok::LabelName, Tok::LabelRel, Tok::LabelRel, Tok::Eof]
        );
    }

    #[test]
    fn test_string_unescape() {
        let tokens = lex(r#""a\n\t\"\\\0b""#).unwrap();
        assert_eq!(tokens[0].tok, Tok::Str);
        let text = tokens[0].text(r#""a\n\t\"\\\0b""#);
        assert_eq!(unescape_string(text), "a\n\t\"\\\0b");
    }

    #[test]
    fn test_line_continuation() {
        assert_eq!(unescape_string("\"ab\\\ncd\""), "abcd");
    }

    #[test]
    fn test_unknown_char_is_error() {
        assert!(lex("a ; b").is_err());
    }

    #[test]
    fn test_loc() {
        let src = "ab\ncd ef";
        let tokens = lex(src).unwrap();
        let ef = tokens
            .iter()
            .find(|t| t.tok == Tok::Id && t.text(src) == "ef")
            .unwrap();
        let loc = ef.loc(crate::atom::Atom::intern("test.nkir"), src);
        assert_eq!((loc.line, loc.col, loc.len), (2, 4, 2));
    }
}
