//! S-expression AST file format.
//!
//! `( … )` forms a node whose id is the head atom; `[ … ]` forms an
//! anonymous list node. Leaf tokens (identifiers, numbers, strings) become
//! childless nodes whose id is the token text. The language frontend that
//! consumes these trees is an external collaborator; the backend only
//! parses and hands them over.

use crate::atom::Atom;
use crate::error::{Error, Result};
use crate::text::lexer::{lex, unescape_string, Tok, Token};

/// One AST node: a head atom plus zero or more children.
#[derive(Debug, Clone, PartialEq)]
pub struct AstNode {
    pub id: Atom,
    pub children: Vec<AstNode>,
}

impl AstNode {
    pub fn leaf(id: Atom) -> AstNode {
        AstNode {
            id,
            children: Vec::new(),
        }
    }
}

/// Id given to `[ … ]` list nodes.
pub fn list_id() -> Atom {
    Atom::intern("list")
}

struct AstParser<'a> {
    src: &'a str,
    file: Atom,
    tokens: Vec<Token>,
    pos: usize,
}

/// Parse an `.nkst` document into its top-level nodes.
pub fn parse_ast(src: &str, file: Atom) -> Result<Vec<AstNode>> {
    let tokens = lex(src).map_err(|offset| {
        let token = Token {
            tok: Tok::Eof,
            start: offset,
            len: 1,
        };
        Error::parse("unexpected character", Some(token.loc(file, src)))
    })?;

    let mut parser = AstParser {
        src,
        file,
        tokens,
        pos: 0,
    };

    let mut nodes = Vec::new();
    parser.skip_trivia();
    while !parser.at(Tok::Eof) {
        nodes.push(parser.parse_node()?);
        parser.skip_trivia();
    }
    Ok(nodes)
}

impl<'a> AstParser<'a> {
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

    fn skip_trivia(&mut self) {
        while self.at(Tok::Newline) {
            self.bump();
        }
    }

    fn error(&self, message: impl Into<String>) -> Error {
        Error::parse(message, Some(self.cur().loc(self.file, self.src)))
    }

    fn parse_node(&mut self) -> Result<AstNode> {
        self.skip_trivia();
        let token = self.cur();
        match token.tok {
            Tok::LParen => {
                self.bump();
                self.skip_trivia();
                let head = self.cur();
                let id = match head.tok {
                    Tok::Id => {
                        self.bump();
                        Atom::intern(head.text(self.src))
                    }
                    Tok::RParen => Atom::NONE,
                    _ => return Err(self.error("expected node id")),
                };
                let mut children = Vec::new();
                self.skip_trivia();
                while !self.at(Tok::RParen) {
                    if self.at(Tok::Eof) {
                        return Err(self.error("unexpected end of file in node"));
                    }
                    children.push(self.parse_node()?);
                    self.skip_trivia();
                }
                self.bump();
                Ok(AstNode { id, children })
            }
            Tok::LBracket => {
                self.bump();
                let mut children = Vec::new();
                self.skip_trivia();
                while !self.at(Tok::RBracket) {
                    if self.at(Tok::Eof) {
                        return Err(self.error("unexpected end of file in list"));
                    }
                    children.push(self.parse_node()?);
                    self.skip_trivia();
                }
                self.bump();
                Ok(AstNode {
                    id: list_id(),
                    children,
                })
            }
            Tok::Id | Tok::Int | Tok::Float => {
                self.bump();
                Ok(AstNode::leaf(Atom::intern(token.text(self.src))))
            }
            Tok::Str => {
                self.bump();
                Ok(AstNode::leaf(Atom::intern(&unescape_string(
                    token.text(self.src),
                ))))
            }
            other => Err(self.error(format!("unexpected {}", other.describe()))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_flat_node() {
        let nodes = parse_ast("(add 1 2)", Atom::intern("t.nkst")).unwrap();
        assert_eq!(nodes.len(), 1);
        assert_eq!(nodes[0].id.as_str(), "add");
        assert_eq!(nodes[0].children.len(), 2);
        assert_eq!(nodes[0].children[0].id.as_str(), "1");
    }

    #[test]
    fn test_parse_nested_with_lists() {
        let nodes = parse_ast("(proc f [i64 i64] (block (ret)))", Atom::intern("t.nkst")).unwrap();
        let proc = &nodes[0];
        assert_eq!(proc.children[1].id, list_id());
        assert_eq!(proc.children[1].children.len(), 2);
        assert_eq!(proc.children[2].children[0].id.as_str(), "ret");
    }

    #[test]
    fn test_parse_string_leaf() {
        let nodes = parse_ast("(msg \"hi\\n\")", Atom::intern("t.nkst")).unwrap();
        assert_eq!(nodes[0].children[0].id.as_str(), "hi\n");
    }

    #[test]
    fn test_unbalanced_is_error() {
        assert!(parse_ast("(a (b)", Atom::intern("t.nkst")).is_err());
    }

    #[test]
    fn test_newlines_insignificant() {
        let nodes = parse_ast("(a\n  b\n  (c\n))", Atom::intern("t.nkst")).unwrap();
        assert_eq!(nodes[0].children.len(), 2);
    }
}
