//! S-expression reader for the text format.
//!
//! Parsing is two-phase: the lexer's token stream is first grouped into a
//! tree of parenthesised forms (this module, syntax only), then the
//! assembler walks the tree to build the module (semantics). Working on a
//! tree removes lookahead concerns: every list's children are visible at
//! once.

use super::error::LexError;
use super::lexer::Lexer;
use super::token::{Span, Token, TokenKind};
use std::fmt;
use std::iter::Peekable;
use thiserror::Error;

/// An error encountered while reading S-expressions: lexical defects or
/// unbalanced parentheses.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{message} at line {}, column {}", .span.line, .span.column)]
pub struct ReadError {
    pub message: String,
    pub span: Span,
}

impl ReadError {
    pub fn new(message: impl Into<String>, span: Span) -> Self {
        Self {
            message: message.into(),
            span,
        }
    }
}

impl From<LexError> for ReadError {
    fn from(e: LexError) -> Self {
        Self {
            message: e.message,
            span: e.span,
        }
    }
}

/// An S-expression: a leaf token or a parenthesised list.
#[derive(Debug, Clone)]
pub enum SExpr {
    Atom(Token),
    /// The span covers the whole list including parentheses. The head is
    /// typically a keyword naming the construct.
    List { span: Span, items: Vec<SExpr> },
}

impl SExpr {
    pub fn span(&self) -> Span {
        match self {
            SExpr::Atom(token) => token.span,
            SExpr::List { span, .. } => *span,
        }
    }

    pub fn as_atom(&self) -> Option<&Token> {
        match self {
            SExpr::Atom(token) => Some(token),
            SExpr::List { .. } => None,
        }
    }

    pub fn as_list(&self) -> Option<SExprList<'_>> {
        match self {
            SExpr::Atom(_) => None,
            SExpr::List { span, items } => Some(SExprList { span: *span, items }),
        }
    }

    pub fn as_keyword(&self) -> Option<&str> {
        match self {
            SExpr::Atom(Token {
                kind: TokenKind::Keyword(kw),
                ..
            }) => Some(kw),
            _ => None,
        }
    }

    pub fn as_id(&self) -> Option<&str> {
        match self {
            SExpr::Atom(Token {
                kind: TokenKind::Id(id),
                ..
            }) => Some(id),
            _ => None,
        }
    }

    pub fn is_list_headed_by(&self, keyword: &str) -> bool {
        self.as_list()
            .map(|list| list.head_keyword() == Some(keyword))
            .unwrap_or(false)
    }

    pub fn expect_list(&self) -> Result<SExprList<'_>, ReadError> {
        self.as_list()
            .ok_or_else(|| ReadError::new("expected list", self.span()))
    }
}

/// A borrowed view of an S-expression list with accessors for the common
/// `(keyword arg1 arg2 …)` pattern.
#[derive(Debug, Clone, Copy)]
pub struct SExprList<'a> {
    pub span: Span,
    pub items: &'a [SExpr],
}

impl<'a> SExprList<'a> {
    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn get(&self, index: usize) -> Option<&'a SExpr> {
        self.items.get(index)
    }

    pub fn head(&self) -> Option<&'a SExpr> {
        self.items.first()
    }

    pub fn head_keyword(&self) -> Option<&'a str> {
        self.head().and_then(|s| s.as_keyword())
    }

    pub fn expect_head(&self, expected: &str) -> Result<(), ReadError> {
        match self.head_keyword() {
            Some(kw) if kw == expected => Ok(()),
            Some(kw) => Err(ReadError::new(
                format!("expected '{expected}', found '{kw}'"),
                self.head().unwrap().span(),
            )),
            None => Err(ReadError::new(format!("expected '{expected}' keyword"), self.span)),
        }
    }

    pub fn iter_from(&self, start: usize) -> impl Iterator<Item = &'a SExpr> {
        self.items.iter().skip(start)
    }
}

/// Reads a single S-expression from source text, requiring all input to be
/// consumed.
pub fn read(source: &str) -> Result<SExpr, ReadError> {
    let lexer = Lexer::new(source);
    let mut tokens = lexer.peekable();

    let sexpr = read_sexpr(&mut tokens)?;

    match tokens.next() {
        Some(Ok(token)) => Err(ReadError::new("unexpected token after expression", token.span)),
        Some(Err(e)) => Err(ReadError::from(e)),
        None => Ok(sexpr),
    }
}

/// Reads every top-level S-expression in the source (script files carry
/// several).
pub fn read_all(source: &str) -> Result<Vec<SExpr>, ReadError> {
    let lexer = Lexer::new(source);
    let mut tokens = lexer.peekable();
    let mut results = Vec::new();

    while tokens.peek().is_some() {
        results.push(read_sexpr(&mut tokens)?);
    }
    Ok(results)
}

fn read_sexpr<I>(tokens: &mut Peekable<I>) -> Result<SExpr, ReadError>
where
    I: Iterator<Item = Result<Token, LexError>>,
{
    let token = next_token(tokens)?;

    match token.kind {
        TokenKind::LeftParen => {
            let start_span = token.span;
            let mut items = Vec::new();

            loop {
                match peek_token(tokens)? {
                    Some(Token {
                        kind: TokenKind::RightParen,
                        ..
                    }) => {
                        let end_token = next_token(tokens)?;
                        let span = Span {
                            start: start_span.start,
                            end: end_token.span.end,
                            line: start_span.line,
                            column: start_span.column,
                        };
                        return Ok(SExpr::List { span, items });
                    }
                    Some(_) => {
                        items.push(read_sexpr(tokens)?);
                    }
                    None => {
                        return Err(ReadError::new("unclosed parenthesis", start_span));
                    }
                }
            }
        }
        TokenKind::RightParen => Err(ReadError::new("unexpected ')'", token.span)),
        _ => Ok(SExpr::Atom(token)),
    }
}

fn next_token<I>(tokens: &mut Peekable<I>) -> Result<Token, ReadError>
where
    I: Iterator<Item = Result<Token, LexError>>,
{
    match tokens.next() {
        Some(Ok(token)) => Ok(token),
        Some(Err(e)) => Err(ReadError::from(e)),
        None => Err(ReadError::new("unexpected end of input", Span::ZERO)),
    }
}

fn peek_token<I>(tokens: &mut Peekable<I>) -> Result<Option<&Token>, ReadError>
where
    I: Iterator<Item = Result<Token, LexError>>,
{
    match tokens.peek() {
        Some(Ok(token)) => Ok(Some(token)),
        Some(Err(e)) => Err(ReadError::new(e.message.clone(), e.span)),
        None => Ok(None),
    }
}

impl fmt::Display for SExpr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SExpr::Atom(token) => write!(f, "{}", token.kind),
            SExpr::List { items, .. } => {
                write!(f, "(")?;
                for (i, item) in items.iter().enumerate() {
                    if i > 0 {
                        write!(f, " ")?;
                    }
                    write!(f, "{item}")?;
                }
                write!(f, ")")
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn read_atoms() {
        assert_eq!(read("module").unwrap().as_keyword(), Some("module"));
        assert_eq!(read("$main").unwrap().as_id(), Some("main"));
        let sexpr = read("42").unwrap();
        assert!(matches!(
            sexpr.as_atom().unwrap().kind,
            TokenKind::UnsignedInteger(_)
        ));
    }

    #[test]
    fn read_lists() {
        let sexpr = read("()").unwrap();
        assert!(sexpr.as_list().unwrap().is_empty());

        let sexpr = read("(module (func) (memory 1))").unwrap();
        let list = sexpr.as_list().unwrap();
        assert_eq!(list.len(), 3);
        assert_eq!(list.head_keyword(), Some("module"));
        assert!(list.get(1).unwrap().is_list_headed_by("func"));
        assert!(list.get(2).unwrap().is_list_headed_by("memory"));
    }

    #[test]
    fn deeply_nested() {
        let sexpr = read("(a (b (c (d))))").unwrap();
        let a = sexpr.as_list().unwrap();
        let b = a.get(1).unwrap().as_list().unwrap();
        let c = b.get(1).unwrap().as_list().unwrap();
        let d = c.get(1).unwrap().as_list().unwrap();
        assert_eq!(d.head_keyword(), Some("d"));
    }

    #[test]
    fn complete_function() {
        let wat = r#"(module
            (func $add (param $a i32) (param $b i32) (result i32)
                (i32.add (local.get $a) (local.get $b))))"#;

        let sexpr = read(wat).unwrap();
        let module = sexpr.as_list().unwrap();
        assert_eq!(module.head_keyword(), Some("module"));

        let func = module.get(1).unwrap().as_list().unwrap();
        assert_eq!(func.head_keyword(), Some("func"));
        assert_eq!(func.get(1).unwrap().as_id(), Some("add"));
    }

    #[test]
    fn strings_are_atoms() {
        let sexpr = read(r#"(import "env" "memory" (memory 1))"#).unwrap();
        let list = sexpr.as_list().unwrap();
        let module_name = list.get(1).unwrap().as_atom().unwrap();
        assert!(matches!(module_name.kind, TokenKind::String(_)));
    }

    #[test]
    fn unbalanced_parens() {
        assert!(read("(module (func)").unwrap_err().message.contains("unclosed"));
        assert!(read(")").unwrap_err().message.contains("unexpected ')'"));
        assert!(read("(module) extra")
            .unwrap_err()
            .message
            .contains("unexpected token"));
    }

    #[test]
    fn lexer_errors_propagate() {
        assert!(read("\"unterminated").is_err());
    }

    #[test]
    fn read_multiple() {
        let sexprs = read_all("(a) (b) (c)").unwrap();
        assert_eq!(sexprs.len(), 3);
        assert!(sexprs[0].is_list_headed_by("a"));
        assert!(sexprs[2].is_list_headed_by("c"));
    }

    #[test]
    fn spans_cover_parens() {
        let sexpr = read("(a (b c))").unwrap();
        let outer = sexpr.as_list().unwrap();
        assert_eq!((outer.span.start, outer.span.end), (0, 9));
        let inner = outer.get(1).unwrap().as_list().unwrap();
        assert_eq!((inner.span.start, inner.span.end), (3, 8));
    }

    #[test]
    fn display_roundtrip() {
        let sexpr = read("(module (func $main (result i32) (i32.const 42)))").unwrap();
        let displayed = sexpr.to_string();
        assert!(displayed.starts_with("(module"));
        assert!(displayed.contains("$main"));
        assert!(displayed.contains("i32.const 42"));
    }
}
