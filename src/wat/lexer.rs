//! Lexer for the WebAssembly text format.
//!
//! Tokenises WAT source lazily via the `Iterator` trait. Malformed numeric
//! and word-like character runs become [`TokenKind::Reserved`] tokens — the
//! assembler reports those with a span when it actually reaches one — while
//! structural defects (unterminated strings and comments, bad escapes) stop
//! the lexer with an error.

use super::cursor::{Cursor, Position};
use super::error::LexError;
use super::token::{FloatLit, IntegerLit, Token, TokenKind};

pub struct Lexer<'a> {
    cursor: Cursor<'a>,
}

impl<'a> Lexer<'a> {
    pub fn new(source: &'a str) -> Self {
        Self {
            cursor: Cursor::new(source),
        }
    }

    /// Tokenises the entire source, returning all tokens or the first error.
    pub fn tokenise(source: &str) -> Result<Vec<Token>, LexError> {
        Lexer::new(source).collect()
    }

    fn error(&self, message: impl Into<String>, pos: Position) -> LexError {
        LexError::new(message, pos.span_here())
    }

    fn error_span(&self, message: impl Into<String>, start: Position) -> LexError {
        LexError::new(message, start.span_to(&self.cursor.position()))
    }
}

impl<'a> Iterator for Lexer<'a> {
    type Item = Result<Token, LexError>;

    fn next(&mut self) -> Option<Self::Item> {
        if let Err(e) = self.skip_whitespace_and_comments() {
            return Some(Err(e));
        }
        if self.cursor.is_eof() {
            return None;
        }

        let start = self.cursor.position();
        let kind = match self.lex_token(start) {
            Ok(k) => k,
            Err(e) => return Some(Err(e)),
        };
        let span = start.span_to(&self.cursor.position());

        Some(Ok(Token::new(kind, span)))
    }
}

// ===========================================================================
// Top-level token dispatch
// ===========================================================================

impl<'a> Lexer<'a> {
    fn lex_token(&mut self, start: Position) -> Result<TokenKind, LexError> {
        match self.cursor.peek().unwrap() {
            '(' => {
                self.cursor.advance();
                Ok(TokenKind::LeftParen)
            }
            ')' => {
                self.cursor.advance();
                Ok(TokenKind::RightParen)
            }
            '"' => {
                let result = self.lex_string()?;
                Ok(self.close_token(result, start))
            }
            '$' => {
                let result = self.lex_id(start)?;
                Ok(self.close_token(result, start))
            }
            '+' | '-' => {
                let result = self.lex_signed_number_or_keyword()?;
                Ok(self.close_token(result, start))
            }
            c if c.is_ascii_digit() => {
                let result = self.lex_number(false, false)?;
                Ok(self.close_token(result, start))
            }
            c if is_idchar(c) => {
                let result = self.lex_keyword_or_special_float();
                Ok(self.close_token(result, start))
            }
            c => {
                self.cursor.advance();
                Err(self.error(format!("unexpected character: {c:?}"), start))
            }
        }
    }

    /// WAT requires whitespace or parentheses between non-paren tokens:
    /// `1x` and `$l"a"` are not two tokens. A token followed by more
    /// idchars collapses into a single reserved token.
    fn close_token(&mut self, kind: TokenKind, start: Position) -> TokenKind {
        match self.cursor.peek() {
            None => kind,
            Some(c) if c.is_ascii_whitespace() => kind,
            Some('(' | ')' | ';') => kind,
            Some('"') if matches!(kind, TokenKind::String(_)) => {
                // "a""b" is one reserved token, not two strings.
                if self.lex_string().is_err() {
                    return TokenKind::Reserved(self.cursor.slice_from(&start).to_string());
                }
                self.cursor.skip_while(is_idchar);
                TokenKind::Reserved(self.cursor.slice_from(&start).to_string())
            }
            _ => {
                self.cursor.skip_while(is_idchar);
                TokenKind::Reserved(self.cursor.slice_from(&start).to_string())
            }
        }
    }

    /// Lex a keyword, checking for the special float forms (`inf`, `nan`,
    /// `nan:0x…`, `nan:canonical`, `nan:arithmetic`).
    fn lex_keyword_or_special_float(&mut self) -> TokenKind {
        let text = self.cursor.take_while(is_idchar);
        match parse_special_float(text, false) {
            Some(float) => TokenKind::Float(float),
            None => TokenKind::Keyword(text.to_string()),
        }
    }

    /// `+` or `-` prefix: a signed number, a signed special float, or just
    /// a keyword-shaped reserved word.
    fn lex_signed_number_or_keyword(&mut self) -> Result<TokenKind, LexError> {
        let second = self.cursor.peek_second();
        let is_number = matches!(second, Some(c) if c.is_ascii_digit() || c == '.' || c == 'i' || c == 'n');

        if is_number {
            let negative = self.cursor.advance() == Some('-');
            self.lex_number(negative, true)
        } else {
            Ok(self.lex_keyword_or_special_float())
        }
    }
}

// ===========================================================================
// Whitespace and comments
// ===========================================================================

impl<'a> Lexer<'a> {
    fn skip_whitespace_and_comments(&mut self) -> Result<(), LexError> {
        loop {
            self.cursor.skip_while(|c| c.is_ascii_whitespace());

            if self.cursor.is_eof() {
                return Ok(());
            }

            match (self.cursor.peek(), self.cursor.peek_second()) {
                // Line comment: ;; to end of line
                (Some(';'), Some(';')) => {
                    self.cursor.skip_while(|c| c != '\n' && c != '\r');
                }
                // Block comment: (; ... ;) with nesting
                (Some('('), Some(';')) => {
                    self.skip_block_comment()?;
                }
                _ => return Ok(()),
            }
        }
    }

    fn skip_block_comment(&mut self) -> Result<(), LexError> {
        let start = self.cursor.position();

        // Consume the opening "(;"
        self.cursor.advance();
        self.cursor.advance();

        let mut depth = 1;
        while depth > 0 {
            match (self.cursor.peek(), self.cursor.peek_second()) {
                (None, _) => {
                    return Err(self.error_span("unterminated block comment", start));
                }
                (Some('('), Some(';')) => {
                    self.cursor.advance();
                    self.cursor.advance();
                    depth += 1;
                }
                (Some(';'), Some(')')) => {
                    self.cursor.advance();
                    self.cursor.advance();
                    depth -= 1;
                }
                _ => {
                    self.cursor.advance();
                }
            }
        }
        Ok(())
    }
}

// ===========================================================================
// Identifiers
// ===========================================================================

impl<'a> Lexer<'a> {
    fn lex_id(&mut self, start: Position) -> Result<TokenKind, LexError> {
        // Consume the '$'
        self.cursor.advance();

        let name = self.cursor.take_while(is_idchar);
        if name.is_empty() {
            return Err(self.error_span("expected identifier after '$'", start));
        }

        Ok(TokenKind::Id(name.to_string()))
    }
}

// ===========================================================================
// String literals
// ===========================================================================

impl<'a> Lexer<'a> {
    fn lex_string(&mut self) -> Result<TokenKind, LexError> {
        let start = self.cursor.position();

        // Consume the opening quote
        self.cursor.advance();

        let mut bytes = Vec::new();
        loop {
            match self.cursor.peek() {
                None => {
                    return Err(self.error_span("unterminated string literal", start));
                }
                Some('"') => {
                    self.cursor.advance();
                    break;
                }
                Some('\\') => {
                    self.cursor.advance();
                    self.lex_escape(&mut bytes)?;
                }
                Some(c) if (c as u32) < 0x20 => {
                    return Err(self.error_span("control character in string literal", start));
                }
                Some(c) => {
                    self.cursor.advance();
                    let mut buf = [0u8; 4];
                    bytes.extend_from_slice(c.encode_utf8(&mut buf).as_bytes());
                }
            }
        }

        Ok(TokenKind::String(bytes))
    }

    fn lex_escape(&mut self, bytes: &mut Vec<u8>) -> Result<(), LexError> {
        let pos = self.cursor.position();
        let c = self
            .cursor
            .advance()
            .ok_or_else(|| self.error("unterminated escape sequence", pos))?;

        match c {
            't' => bytes.push(0x09),
            'n' => bytes.push(0x0A),
            'r' => bytes.push(0x0D),
            '"' => bytes.push(0x22),
            '\'' => bytes.push(0x27),
            '\\' => bytes.push(0x5C),
            'u' => self.lex_unicode_escape(bytes)?,
            c if c.is_ascii_hexdigit() => {
                let high = c.to_digit(16).unwrap() as u8;
                let low_pos = self.cursor.position();
                let low_char = self
                    .cursor
                    .advance()
                    .ok_or_else(|| self.error("unterminated hex escape", low_pos))?;
                let low = low_char
                    .to_digit(16)
                    .ok_or_else(|| self.error(format!("invalid hex digit: {low_char:?}"), low_pos))?
                    as u8;
                bytes.push((high << 4) | low);
            }
            _ => return Err(self.error(format!("invalid escape sequence: \\{c}"), pos)),
        }
        Ok(())
    }

    fn lex_unicode_escape(&mut self, bytes: &mut Vec<u8>) -> Result<(), LexError> {
        let pos = self.cursor.position();

        match self.cursor.advance() {
            Some('{') => {}
            Some(c) => return Err(self.error(format!("expected '{{' after \\u, got {c:?}"), pos)),
            None => return Err(self.error("unterminated unicode escape", pos)),
        }

        let digits_start = self.cursor.position();
        let digits = self.cursor.take_while(|c| c.is_ascii_hexdigit());
        if digits.is_empty() {
            return Err(self.error("empty unicode escape", digits_start));
        }

        let code_point = u32::from_str_radix(digits, 16)
            .map_err(|_| self.error("unicode escape value too large", digits_start))?;

        let close_pos = self.cursor.position();
        match self.cursor.advance() {
            Some('}') => {}
            Some(c) => return Err(self.error(format!("expected '}}' in unicode escape, got {c:?}"), close_pos)),
            None => return Err(self.error("unterminated unicode escape", close_pos)),
        }

        let c = char::from_u32(code_point)
            .ok_or_else(|| self.error(format!("invalid unicode code point: U+{code_point:X}"), digits_start))?;

        let mut buf = [0u8; 4];
        bytes.extend_from_slice(c.encode_utf8(&mut buf).as_bytes());
        Ok(())
    }
}

// ===========================================================================
// Number literals
// ===========================================================================

impl<'a> Lexer<'a> {
    /// Lex a number (integer or float). The sign has been consumed already.
    fn lex_number(&mut self, negative: bool, has_sign: bool) -> Result<TokenKind, LexError> {
        let start = self.cursor.position();

        // inf / nan after a sign
        if matches!(self.cursor.peek(), Some('i') | Some('n')) {
            return self.lex_special_float(negative);
        }

        let is_hex =
            self.cursor.peek() == Some('0') && matches!(self.cursor.peek_second(), Some('x') | Some('X'));

        if is_hex {
            self.cursor.advance(); // '0'
            self.cursor.advance(); // 'x'
            Ok(self.lex_hex_number(negative, has_sign, start))
        } else {
            Ok(self.lex_decimal_number(negative, has_sign, start))
        }
    }

    /// `token_start` is the first character of the token (before the `0x`
    /// prefix); the digit slice for float conversion starts here.
    fn lex_hex_number(&mut self, negative: bool, has_sign: bool, token_start: Position) -> TokenKind {
        let digits_start = self.cursor.position();
        let digits = self.cursor.take_while(|c| c.is_ascii_hexdigit() || c == '_');

        if matches!(self.cursor.peek(), Some('.') | Some('p') | Some('P')) {
            return self.lex_float(negative, digits_start, token_start, true);
        }

        if digits.is_empty() || !valid_underscores(digits, true) {
            self.cursor.skip_while(is_idchar);
            return TokenKind::Reserved(self.cursor.slice_from(&token_start).to_string());
        }

        let clean: String = digits.chars().filter(|&c| c != '_').collect();
        match u64::from_str_radix(&clean, 16) {
            Ok(magnitude) => integer_token(magnitude, negative, has_sign),
            // Overflow: valid only in float contexts; keep the digits so
            // fNN.const can round at its own precision.
            Err(_) => TokenKind::Float(FloatLit::Hex {
                negative,
                digits: clean,
            }),
        }
    }

    fn lex_decimal_number(&mut self, negative: bool, has_sign: bool, start: Position) -> TokenKind {
        let digits = self.cursor.take_while(|c| c.is_ascii_digit() || c == '_');

        if matches!(self.cursor.peek(), Some('.') | Some('e') | Some('E')) {
            return self.lex_float(negative, start, start, false);
        }

        if digits.is_empty() || !valid_underscores(digits, false) {
            self.cursor.skip_while(is_idchar);
            return TokenKind::Reserved(self.cursor.slice_from(&start).to_string());
        }

        let clean: String = digits.chars().filter(|&c| c != '_').collect();
        match clean.parse::<u64>() {
            Ok(magnitude) => integer_token(magnitude, negative, has_sign),
            Err(_) => TokenKind::Float(FloatLit::Decimal {
                negative,
                digits: clean,
            }),
        }
    }

    /// Lex the rest of a float literal. `digits_start` is the first digit
    /// (after any `0x` prefix); `token_start` covers the whole token for
    /// reserved-word recovery.
    fn lex_float(&mut self, negative: bool, digits_start: Position, token_start: Position, hex: bool) -> TokenKind {
        if self.cursor.peek() == Some('.') {
            self.cursor.advance();
            if hex {
                self.cursor.skip_while(|c| c.is_ascii_hexdigit() || c == '_');
            } else {
                self.cursor.skip_while(|c| c.is_ascii_digit() || c == '_');
            }
        }

        let has_exp = if hex {
            matches!(self.cursor.peek(), Some('p' | 'P'))
        } else {
            matches!(self.cursor.peek(), Some('e' | 'E'))
        };
        let mut exp_ok = true;
        if has_exp {
            self.cursor.advance();
            if matches!(self.cursor.peek(), Some('+' | '-')) {
                self.cursor.advance();
            }
            let exp_digits = self.cursor.take_while(|c| c.is_ascii_digit() || c == '_');
            exp_ok = exp_digits.contains(|c: char| c.is_ascii_digit());
        }

        let text = self.cursor.slice_from(&digits_start);
        if !exp_ok || !valid_underscores(text, hex) {
            self.cursor.skip_while(is_idchar);
            return TokenKind::Reserved(self.cursor.slice_from(&token_start).to_string());
        }

        let clean: String = text.chars().filter(|&c| c != '_').collect();
        if hex {
            if !clean.chars().any(|c| c.is_ascii_hexdigit()) {
                self.cursor.skip_while(is_idchar);
                return TokenKind::Reserved(self.cursor.slice_from(&token_start).to_string());
            }
            TokenKind::Float(FloatLit::Hex {
                negative,
                digits: clean,
            })
        } else {
            if clean.parse::<f64>().is_err() {
                self.cursor.skip_while(is_idchar);
                return TokenKind::Reserved(self.cursor.slice_from(&token_start).to_string());
            }
            TokenKind::Float(FloatLit::Decimal {
                negative,
                digits: clean,
            })
        }
    }

    /// Special float values (inf, nan…) after the sign has been consumed.
    fn lex_special_float(&mut self, negative: bool) -> Result<TokenKind, LexError> {
        let start = self.cursor.position();
        let text = self
            .cursor
            .take_while(|c| c.is_ascii_alphanumeric() || c == ':' || c == '_');

        parse_special_float(text, negative)
            .map(TokenKind::Float)
            .ok_or_else(|| self.error(format!("invalid number: {text}"), start))
    }
}

fn integer_token(magnitude: u64, negative: bool, has_sign: bool) -> TokenKind {
    let lit = IntegerLit::new(magnitude, negative);
    if has_sign {
        TokenKind::SignedInteger(lit)
    } else {
        TokenKind::UnsignedInteger(lit)
    }
}

// ===========================================================================
// Helper functions
// ===========================================================================

/// Underscores in numeric literals may only appear between two digits.
fn valid_underscores(s: &str, is_hex: bool) -> bool {
    let bytes = s.as_bytes();
    let mut in_exponent = false;

    for (i, &b) in bytes.iter().enumerate() {
        if b == b'_' {
            if i == 0 || i == bytes.len() - 1 {
                return false;
            }
            let digit = |b: u8| {
                if is_hex && !in_exponent {
                    b.is_ascii_hexdigit()
                } else {
                    b.is_ascii_digit()
                }
            };
            if !digit(bytes[i - 1]) || !digit(bytes[i + 1]) {
                return false;
            }
        } else if b == b'p' || b == b'P' || (!is_hex && (b == b'e' || b == b'E')) {
            in_exponent = true;
        }
    }
    true
}

/// Characters permitted in WAT identifiers and keywords.
fn is_idchar(c: char) -> bool {
    matches!(
        c,
        '0'..='9'
            | 'a'..='z'
            | 'A'..='Z'
            | '!'
            | '#'
            | '$'
            | '%'
            | '&'
            | '\''
            | '*'
            | '+'
            | '-'
            | '.'
            | '/'
            | ':'
            | '<'
            | '='
            | '>'
            | '?'
            | '@'
            | '\\'
            | '^'
            | '_'
            | '`'
            | '|'
            | '~'
    )
}

/// inf, nan, nan:0x…, nan:canonical, nan:arithmetic
fn parse_special_float(text: &str, negative: bool) -> Option<FloatLit> {
    match text {
        "inf" => Some(FloatLit::Inf { negative }),
        "nan" => Some(FloatLit::Nan { negative, payload: None }),
        "nan:canonical" if !negative => Some(FloatLit::NanCanonical),
        "nan:arithmetic" if !negative => Some(FloatLit::NanArithmetic),
        _ => {
            let payload_hex = text.strip_prefix("nan:0x")?;
            if payload_hex.is_empty() || !valid_underscores(payload_hex, true) {
                return None;
            }
            let clean: String = payload_hex.chars().filter(|&c| c != '_').collect();
            let payload = u64::from_str_radix(&clean, 16).ok()?;
            Some(FloatLit::Nan {
                negative,
                payload: Some(payload),
            })
        }
    }
}

// ===========================================================================
// Tests
// ===========================================================================


#[cfg(test)]
mod proptests {
    use super::*;
    use proptest::prelude::*;

    proptest! {
        /// Token spans stay within bounds and never invert or overlap.
        #[test]
        fn spans_are_valid(source in "\\PC{0,200}") {
            let mut last_end = 0usize;
            for result in Lexer::new(&source) {
                if let Ok(token) = result {
                    prop_assert!(token.span.start <= token.span.end);
                    prop_assert!(token.span.end <= source.len());
                    prop_assert!(token.span.start >= last_end);
                    last_end = token.span.end;
                }
            }
        }

        /// The lexer never panics on arbitrary input.
        #[test]
        fn never_panics(source in "\\PC{0,500}") {
            for result in Lexer::new(&source) {
                let _ = result;
            }
        }

        /// Line numbers are monotonically non-decreasing.
        #[test]
        fn line_numbers_increase(source in "[a-z0-9()\\n ]{0,100}") {
            let mut last_line = 0u32;
            for result in Lexer::new(&source) {
                if let Ok(token) = result {
                    prop_assert!(token.span.line >= last_line);
                    last_line = token.span.line;
                }
            }
        }
    }
}
