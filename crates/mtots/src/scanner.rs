//! Indentation-sensitive scanner.
//!
//! Produces a flat token stream including the synthetic `Newline`, `Indent`,
//! and `Dedent` tokens that make the block structure visible to the
//! compiler. Indentation is measured in two-space units; a line whose
//! leading-space count is odd is a scan error. Inside any `()`/`[]`/`{}`
//! grouping, newlines are consumed silently. At end of input the scanner
//! emits one final `Newline` followed by enough `Dedent`s to return to
//! level zero.

pub const MAX_IDENTIFIER_LENGTH: usize = 128;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TokenType {
    // Single- and double-character punctuation.
    LeftParen,
    RightParen,
    LeftBrace,
    RightBrace,
    LeftBracket,
    RightBracket,
    Colon,
    Semicolon,
    Comma,
    Dot,
    Minus,
    Plus,
    Slash,
    SlashSlash,
    Percent,
    Star,
    At,
    QMark,
    Tilde,
    Pipe,
    Ampersand,
    Caret,
    ShiftLeft,
    ShiftRight,
    Bang,
    BangEqual,
    Equal,
    EqualEqual,
    Less,
    LessEqual,
    Greater,
    GreaterEqual,

    // Literals.
    Identifier,
    Str,
    RawStr,
    RawTripleStr,
    Number,
    NumberHex,
    NumberBin,

    // Keywords. Several are reserved without a construct behind them
    // (assert, async, await, del, except, finally, from, global, lambda,
    // with, yield); using one simply fails to parse as an expression.
    And,
    As,
    Assert,
    Async,
    Await,
    Break,
    Class,
    Continue,
    Def,
    Del,
    Elif,
    Else,
    Except,
    False,
    Final,
    Finally,
    For,
    From,
    Global,
    If,
    Import,
    In,
    Is,
    Lambda,
    Nil,
    Not,
    Or,
    Pass,
    Raise,
    Return,
    Super,
    This,
    True,
    Try,
    Var,
    While,
    With,
    Yield,

    // Synthetic structure tokens.
    Newline,
    Indent,
    Dedent,

    Error,
    Eof,
}

#[derive(Clone, Copy, Debug)]
pub struct Token<'a> {
    pub ty: TokenType,
    /// The lexeme, or for `Error` tokens the message itself.
    pub text: &'a str,
    pub line: u32,
}

pub struct Scanner<'a> {
    source: &'a str,
    bytes: &'a [u8],
    start: usize,
    current: usize,
    line: u32,
    /// Nesting depth of `()`/`[]`/`{}`; newlines vanish while positive.
    grouping_depth: i32,
    /// Indentation level (units of two spaces) of the current line.
    indentation_level: i32,
    /// Pending synthetic tokens: positive for INDENTs, negative for DEDENTs.
    indentation_potential: i32,
    /// Whether the final synthetic newline has been produced.
    processed_synthetic_newline: bool,
}

impl<'a> Scanner<'a> {
    pub fn new(source: &'a str) -> Scanner<'a> {
        Scanner {
            source,
            bytes: source.as_bytes(),
            start: 0,
            current: 0,
            line: 1,
            grouping_depth: 0,
            indentation_level: 0,
            indentation_potential: 0,
            processed_synthetic_newline: false,
        }
    }

    fn is_at_end(&self) -> bool {
        self.current >= self.bytes.len()
    }

    fn advance(&mut self) -> u8 {
        let b = self.bytes[self.current];
        self.current += 1;
        b
    }

    fn peek(&self) -> u8 {
        if self.is_at_end() { 0 } else { self.bytes[self.current] }
    }

    fn peek_next(&self) -> u8 {
        if self.current + 1 >= self.bytes.len() {
            0
        } else {
            self.bytes[self.current + 1]
        }
    }

    fn matches(&mut self, expected: u8) -> bool {
        if self.is_at_end() || self.bytes[self.current] != expected {
            return false;
        }
        self.current += 1;
        true
    }

    fn make_token(&self, ty: TokenType) -> Token<'a> {
        Token {
            ty,
            text: &self.source[self.start..self.current],
            line: self.line,
        }
    }

    fn error_token(&self, message: &'static str) -> Token<'a> {
        Token {
            ty: TokenType::Error,
            text: message,
            line: self.line,
        }
    }

    fn skip_whitespace(&mut self) {
        loop {
            match self.peek() {
                b' ' | b'\r' | b'\t' => {
                    self.advance();
                }
                b'\n' => {
                    // Newlines only disappear inside a grouping; the line
                    // counter still advances.
                    if self.grouping_depth > 0 {
                        self.line += 1;
                        self.advance();
                    } else {
                        return;
                    }
                }
                b'#' => {
                    while self.peek() != b'\n' && !self.is_at_end() {
                        self.advance();
                    }
                }
                _ => return,
            }
        }
    }

    fn identifier(&mut self) -> Token<'a> {
        while is_alpha(self.peek()) || self.peek().is_ascii_digit() {
            self.advance();
        }
        if self.current - self.start > MAX_IDENTIFIER_LENGTH {
            return self.error_token("An identifier may not exceed 128 characters");
        }
        self.make_token(identifier_type(&self.source[self.start..self.current]))
    }

    fn number(&mut self) -> Token<'a> {
        if self.bytes[self.start] == b'0' {
            if self.matches(b'x') {
                while self.peek().is_ascii_hexdigit() {
                    self.advance();
                }
                return self.make_token(TokenType::NumberHex);
            }
            if self.matches(b'b') {
                while self.peek() == b'0' || self.peek() == b'1' {
                    self.advance();
                }
                return self.make_token(TokenType::NumberBin);
            }
        }

        while self.peek().is_ascii_digit() {
            self.advance();
        }
        if self.peek() == b'.' && self.peek_next().is_ascii_digit() {
            self.advance();
            while self.peek().is_ascii_digit() {
                self.advance();
            }
        }
        self.make_token(TokenType::Number)
    }

    fn string(&mut self, quote: u8) -> Token<'a> {
        if self.peek() == quote && self.peek_next() == quote {
            self.advance();
            self.advance();
            return self.triple_quote_string(quote);
        }
        while self.peek() != quote && !self.is_at_end() {
            if self.peek() == b'\n' {
                self.line += 1;
            }
            if self.peek() == b'\\' {
                self.advance();
                if self.is_at_end() {
                    return self.error_token("Expected string escape but got end of input");
                }
            }
            self.advance();
        }
        if self.is_at_end() {
            return self.error_token("Unterminated string literal");
        }
        self.advance();
        self.make_token(TokenType::Str)
    }

    fn triple_quote_string(&mut self, quote: u8) -> Token<'a> {
        while !self.is_at_end()
            && !(self.current + 2 < self.bytes.len()
                && self.bytes[self.current] == quote
                && self.bytes[self.current + 1] == quote
                && self.bytes[self.current + 2] == quote)
        {
            if self.peek() == b'\n' {
                self.line += 1;
            }
            if self.peek() == b'\\' {
                self.advance();
                if self.is_at_end() {
                    return self.error_token("Expected string escape but got end of input");
                }
            }
            self.advance();
        }
        if self.is_at_end() {
            return self.error_token("Unterminated string literal (triple quotes)");
        }
        self.advance();
        self.advance();
        self.advance();
        self.make_token(TokenType::Str)
    }

    fn raw_string(&mut self, quote: u8) -> Token<'a> {
        if self.peek() == quote && self.peek_next() == quote {
            self.advance();
            self.advance();
            return self.raw_triple_quote_string(quote);
        }
        while self.peek() != quote && !self.is_at_end() {
            if self.peek() == b'\n' {
                self.line += 1;
            }
            self.advance();
        }
        if self.is_at_end() {
            return self.error_token("Unterminated raw string literal");
        }
        self.advance();
        self.make_token(TokenType::RawStr)
    }

    fn raw_triple_quote_string(&mut self, quote: u8) -> Token<'a> {
        let mut quote_run = 0;
        while quote_run < 3 && !self.is_at_end() {
            if self.peek() == b'\n' {
                self.line += 1;
            }
            if self.peek() == quote {
                quote_run += 1;
            } else {
                quote_run = 0;
            }
            self.advance();
        }
        if quote_run < 3 {
            return self.error_token("Unterminated raw triple quote string literal");
        }
        self.make_token(TokenType::RawTripleStr)
    }

    pub fn scan_token(&mut self) -> Token<'a> {
        if self.indentation_potential > 0 {
            self.indentation_potential -= 1;
            return self.make_token(TokenType::Indent);
        }
        if self.indentation_potential < 0 {
            self.indentation_potential += 1;
            return self.make_token(TokenType::Dedent);
        }

        self.skip_whitespace();
        self.start = self.current;

        if self.is_at_end() {
            if !self.processed_synthetic_newline {
                self.indentation_potential = -self.indentation_level;
                self.processed_synthetic_newline = true;
                return self.make_token(TokenType::Newline);
            }
            return self.make_token(TokenType::Eof);
        }

        let c = self.advance();

        if c == b'r' && (self.peek() == b'"' || self.peek() == b'\'') {
            let quote = self.advance();
            return self.raw_string(quote);
        }
        if is_alpha(c) {
            return self.identifier();
        }
        if c.is_ascii_digit() {
            return self.number();
        }

        match c {
            b'(' => {
                self.grouping_depth += 1;
                self.make_token(TokenType::LeftParen)
            }
            b')' => {
                self.grouping_depth -= 1;
                self.make_token(TokenType::RightParen)
            }
            b'{' => {
                self.grouping_depth += 1;
                self.make_token(TokenType::LeftBrace)
            }
            b'}' => {
                self.grouping_depth -= 1;
                self.make_token(TokenType::RightBrace)
            }
            b'[' => {
                self.grouping_depth += 1;
                self.make_token(TokenType::LeftBracket)
            }
            b']' => {
                self.grouping_depth -= 1;
                self.make_token(TokenType::RightBracket)
            }
            b':' => self.make_token(TokenType::Colon),
            b';' => self.make_token(TokenType::Semicolon),
            b',' => self.make_token(TokenType::Comma),
            b'.' => self.make_token(TokenType::Dot),
            b'-' => self.make_token(TokenType::Minus),
            b'+' => self.make_token(TokenType::Plus),
            b'/' => {
                let ty = if self.matches(b'/') {
                    TokenType::SlashSlash
                } else {
                    TokenType::Slash
                };
                self.make_token(ty)
            }
            b'%' => self.make_token(TokenType::Percent),
            b'*' => self.make_token(TokenType::Star),
            b'@' => self.make_token(TokenType::At),
            b'?' => self.make_token(TokenType::QMark),
            b'~' => self.make_token(TokenType::Tilde),
            b'|' => self.make_token(TokenType::Pipe),
            b'&' => self.make_token(TokenType::Ampersand),
            b'^' => self.make_token(TokenType::Caret),
            b'!' => {
                let ty = if self.matches(b'=') {
                    TokenType::BangEqual
                } else {
                    TokenType::Bang
                };
                self.make_token(ty)
            }
            b'=' => {
                let ty = if self.matches(b'=') {
                    TokenType::EqualEqual
                } else {
                    TokenType::Equal
                };
                self.make_token(ty)
            }
            b'<' => {
                let ty = if self.matches(b'=') {
                    TokenType::LessEqual
                } else if self.matches(b'<') {
                    TokenType::ShiftLeft
                } else {
                    TokenType::Less
                };
                self.make_token(ty)
            }
            b'>' => {
                let ty = if self.matches(b'=') {
                    TokenType::GreaterEqual
                } else if self.matches(b'>') {
                    TokenType::ShiftRight
                } else {
                    TokenType::Greater
                };
                self.make_token(ty)
            }
            b'"' => self.string(b'"'),
            b'\'' => self.string(b'\''),
            b'\n' => {
                let newline_token = self.make_token(TokenType::Newline);

                // Collapse runs of newlines so blank lines cannot confuse
                // the indentation bookkeeping.
                self.line += 1;
                while self.peek() == b'\n' {
                    self.advance();
                    self.line += 1;
                }

                let mut space_count: i32 = 0;
                while self.peek() == b' ' {
                    self.advance();
                    space_count += 1;
                }
                if space_count % 2 == 1 {
                    return self.error_token("Indentations must always be a multiple of 2");
                }
                let new_level = space_count / 2;
                self.indentation_potential = new_level - self.indentation_level;
                self.indentation_level = new_level;

                newline_token
            }
            _ => self.error_token("Unexpected character"),
        }
    }
}

fn is_alpha(c: u8) -> bool {
    c.is_ascii_alphabetic() || c == b'_'
}

/// Keyword recognition: a hand-coded trie over the identifier's bytes.
fn identifier_type(text: &str) -> TokenType {
    fn check(text: &str, start: usize, rest: &str, ty: TokenType) -> TokenType {
        if text.len() == start + rest.len() && &text.as_bytes()[start..] == rest.as_bytes() {
            ty
        } else {
            TokenType::Identifier
        }
    }

    let bytes = text.as_bytes();
    match bytes.len() {
        0 | 1 => TokenType::Identifier,
        2 => match (bytes[0], bytes[1]) {
            (b'a', b's') => TokenType::As,
            (b'i', b'f') => TokenType::If,
            (b'i', b'n') => TokenType::In,
            (b'i', b's') => TokenType::Is,
            (b'o', b'r') => TokenType::Or,
            _ => TokenType::Identifier,
        },
        _ => match bytes[0] {
            b'a' => match bytes[1] {
                b'n' => check(text, 2, "d", TokenType::And),
                b's' => match bytes[2] {
                    b's' => check(text, 3, "ert", TokenType::Assert),
                    b'y' => check(text, 3, "nc", TokenType::Async),
                    _ => TokenType::Identifier,
                },
                b'w' => check(text, 2, "ait", TokenType::Await),
                _ => TokenType::Identifier,
            },
            b'b' => check(text, 1, "reak", TokenType::Break),
            b'c' => match bytes[1] {
                b'l' => check(text, 2, "ass", TokenType::Class),
                b'o' => check(text, 2, "ntinue", TokenType::Continue),
                _ => TokenType::Identifier,
            },
            b'd' => match bytes[1] {
                b'e' => match bytes[2] {
                    b'f' => check(text, 3, "", TokenType::Def),
                    b'l' => check(text, 3, "", TokenType::Del),
                    _ => TokenType::Identifier,
                },
                _ => TokenType::Identifier,
            },
            b'e' => match bytes[1] {
                b'l' => match bytes[2] {
                    b'i' => check(text, 3, "f", TokenType::Elif),
                    b's' => check(text, 3, "e", TokenType::Else),
                    _ => TokenType::Identifier,
                },
                b'x' => check(text, 2, "cept", TokenType::Except),
                _ => TokenType::Identifier,
            },
            b'f' => match bytes[1] {
                b'a' => check(text, 2, "lse", TokenType::False),
                b'i' => {
                    if bytes.len() == 5 {
                        check(text, 2, "nal", TokenType::Final)
                    } else {
                        check(text, 2, "nally", TokenType::Finally)
                    }
                }
                b'o' => check(text, 2, "r", TokenType::For),
                b'r' => check(text, 2, "om", TokenType::From),
                _ => TokenType::Identifier,
            },
            b'g' => check(text, 1, "lobal", TokenType::Global),
            b'i' => check(text, 1, "mport", TokenType::Import),
            b'l' => check(text, 1, "ambda", TokenType::Lambda),
            b'n' => match bytes[1] {
                b'i' => check(text, 2, "l", TokenType::Nil),
                b'o' => check(text, 2, "t", TokenType::Not),
                _ => TokenType::Identifier,
            },
            b'p' => check(text, 1, "ass", TokenType::Pass),
            b'r' => match bytes[1] {
                b'a' => check(text, 2, "ise", TokenType::Raise),
                b'e' => check(text, 2, "turn", TokenType::Return),
                _ => TokenType::Identifier,
            },
            b's' => check(text, 1, "uper", TokenType::Super),
            b't' => match bytes[1] {
                b'h' => check(text, 2, "is", TokenType::This),
                b'r' => match bytes[2] {
                    b'u' => check(text, 3, "e", TokenType::True),
                    b'y' => check(text, 3, "", TokenType::Try),
                    _ => TokenType::Identifier,
                },
                _ => TokenType::Identifier,
            },
            b'v' => check(text, 1, "ar", TokenType::Var),
            b'w' => match bytes[1] {
                b'h' => check(text, 2, "ile", TokenType::While),
                b'i' => check(text, 2, "th", TokenType::With),
                _ => TokenType::Identifier,
            },
            b'y' => check(text, 1, "ield", TokenType::Yield),
            _ => TokenType::Identifier,
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn scan_types(source: &str) -> Vec<TokenType> {
        let mut scanner = Scanner::new(source);
        let mut types = Vec::new();
        loop {
            let token = scanner.scan_token();
            types.push(token.ty);
            if token.ty == TokenType::Eof {
                return types;
            }
        }
    }

    #[test]
    fn keywords_and_identifiers() {
        use TokenType::*;
        assert_eq!(
            scan_types("def final finality in is var x"),
            vec![Def, Final, Identifier, In, Is, Var, Identifier, Newline, Eof]
        );
    }

    #[test]
    fn indent_and_dedent_tokens() {
        use TokenType::*;
        let source = "if x:\n  y\n  if z:\n    w\na\n";
        // The trailing Newline pair is the real line ending plus the
        // synthetic end-of-input newline.
        assert_eq!(
            scan_types(source),
            vec![
                If, Identifier, Colon, Newline, Indent, Identifier, Newline, If, Identifier,
                Colon, Newline, Indent, Identifier, Newline, Dedent, Dedent, Identifier, Newline,
                Newline, Eof,
            ]
        );
    }

    #[test]
    fn odd_indentation_is_an_error() {
        let mut scanner = Scanner::new("if x:\n   y\n");
        let mut saw_error = false;
        for _ in 0..16 {
            let token = scanner.scan_token();
            if token.ty == TokenType::Error {
                assert_eq!(token.text, "Indentations must always be a multiple of 2");
                saw_error = true;
                break;
            }
            if token.ty == TokenType::Eof {
                break;
            }
        }
        assert!(saw_error);
    }

    #[test]
    fn newlines_vanish_inside_groupings() {
        use TokenType::*;
        let source = "f(\n  1,\n  2,\n)\n";
        assert_eq!(
            scan_types(source),
            vec![
                Identifier, LeftParen, Number, Comma, Number, Comma, RightParen, Newline,
                Newline, Eof,
            ]
        );
    }

    #[test]
    fn lexing_is_idempotent_over_grouping_whitespace() {
        let a = "f(1,\n   2)\n";
        let b = "f(1,\n   2)\n";
        assert_eq!(scan_types(a), scan_types(b));
        // And a second pass over the same source yields the same stream.
        assert_eq!(scan_types(a), scan_types(a));
    }

    #[test]
    fn eof_emits_newline_then_dedents() {
        use TokenType::*;
        let source = "while x:\n  if y:\n    z";
        assert_eq!(
            scan_types(source),
            vec![
                While, Identifier, Colon, Newline, Indent, If, Identifier, Colon, Newline, Indent,
                Identifier, Newline, Dedent, Dedent, Eof,
            ]
        );
    }

    #[test]
    fn string_variants() {
        use TokenType::*;
        assert_eq!(
            scan_types("\"a\" 'b' r\"c\" \"\"\"d\ne\"\"\" r'''f'''\n"),
            vec![Str, Str, RawStr, Str, RawTripleStr, Newline, Newline, Eof]
        );
    }

    #[test]
    fn number_variants_and_shifts() {
        use TokenType::*;
        assert_eq!(
            scan_types("12 3.5 0x1F 0b101 1 << 2 >> 3\n"),
            vec![
                Number, Number, NumberHex, NumberBin, Number, ShiftLeft, Number, ShiftRight,
                Number, Newline, Newline, Eof
            ]
        );
    }

    #[test]
    fn comments_run_to_end_of_line() {
        use TokenType::*;
        assert_eq!(
            scan_types("x # comment\ny\n"),
            vec![Identifier, Newline, Identifier, Newline, Newline, Eof]
        );
    }
}
