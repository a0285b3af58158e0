//! Tokenizer: UTF-8 source text to a lazy token stream (spec §4.2).
//!
//! Indentation is tracked with a stack of column widths; a logical line
//! whose leading whitespace is wider than the stack top emits `Indent`,
//! narrower emits one `Dedent` per popped level, and a level that doesn't
//! match any popped width is `InconsistentDedent`. A backslash at end of
//! line, or an unmatched `( [ {`, suppresses the `Newline` token until the
//! continuation closes.

use crate::error::{LexError, LexErrorType};
use crate::token::{Spanned, Tok};
use protopython_common::Location;
use std::collections::VecDeque;
use std::iter::Peekable;
use std::str::Chars;

pub struct Lexer<'a> {
    chars: Peekable<Chars<'a>>,
    row: u32,
    col: u32,
    at_line_start: bool,
    indents: Vec<u32>,
    paren_depth: u32,
    pending: VecDeque<Spanned>,
    done: bool,
    blank_or_comment_line: bool,
}

type LexResult = Result<Spanned, LexError>;

impl<'a> Lexer<'a> {
    pub fn new(source: &'a str) -> Self {
        Lexer {
            chars: source.chars().peekable(),
            row: 1,
            col: 1,
            at_line_start: true,
            indents: vec![0],
            paren_depth: 0,
            pending: VecDeque::new(),
            done: false,
            blank_or_comment_line: false,
        }
    }

    fn loc(&self) -> Location {
        Location::new(self.row, self.col)
    }

    fn err(&self, kind: LexErrorType) -> LexError {
        LexError {
            error: kind,
            location: self.loc(),
        }
    }

    fn bump(&mut self) -> Option<char> {
        let c = self.chars.next()?;
        if c == '\n' {
            self.row += 1;
            self.col = 1;
        } else {
            self.col += 1;
        }
        Some(c)
    }

    fn peek(&mut self) -> Option<char> {
        self.chars.peek().copied()
    }

    fn peek2(&mut self) -> Option<char> {
        let mut clone = self.chars.clone();
        clone.next();
        clone.next()
    }

    fn spanned(&self, tok: Tok, location: Location) -> Spanned {
        Spanned { tok, location }
    }

    /// Consumes leading whitespace of a logical line, synthesizing
    /// `Indent`/`Dedent` tokens as needed. Returns `false` if the line was
    /// blank or comment-only and should be skipped entirely.
    fn measure_indent(&mut self) -> Result<bool, LexError> {
        let mut width = 0u32;
        loop {
            match self.peek() {
                Some(' ') => {
                    width += 1;
                    self.bump();
                }
                Some('\t') => {
                    width += 8 - (width % 8);
                    self.bump();
                }
                Some('\r') => {
                    self.bump();
                }
                _ => break,
            }
        }
        match self.peek() {
            None | Some('\n') | Some('#') => return Ok(false),
            _ => {}
        }
        let top = *self.indents.last().unwrap();
        if width > top {
            self.indents.push(width);
            self.pending.push_back(self.spanned(Tok::Indent, self.loc()));
        } else if width < top {
            while *self.indents.last().unwrap() > width {
                self.indents.pop();
                self.pending.push_back(self.spanned(Tok::Dedent, self.loc()));
            }
            if *self.indents.last().unwrap() != width {
                return Err(self.err(LexErrorType::InconsistentDedent));
            }
        }
        Ok(true)
    }

    fn skip_comment(&mut self) {
        while let Some(c) = self.peek() {
            if c == '\n' {
                break;
            }
            self.bump();
        }
    }

    fn read_name(&mut self) -> String {
        let mut s = String::new();
        while let Some(c) = self.peek() {
            if c.is_alphanumeric() || c == '_' {
                s.push(c);
                self.bump();
            } else {
                break;
            }
        }
        s
    }

    fn read_number(&mut self) -> Result<Tok, LexError> {
        let mut s = String::new();
        let mut is_float = false;
        if self.peek() == Some('0') && matches!(self.peek2(), Some('x') | Some('X')) {
            self.bump();
            self.bump();
            let mut digits = String::new();
            while let Some(c) = self.peek() {
                if c.is_ascii_hexdigit() || c == '_' {
                    if c != '_' {
                        digits.push(c);
                    }
                    self.bump();
                } else {
                    break;
                }
            }
            let v = i64::from_str_radix(&digits, 16)
                .map_err(|_| self.err(LexErrorType::Other("bad hex literal".into())))?;
            return Ok(Tok::Int(v));
        }
        while let Some(c) = self.peek() {
            if c.is_ascii_digit() || c == '_' {
                if c != '_' {
                    s.push(c);
                }
                self.bump();
            } else if c == '.' && !is_float && self.peek2().map_or(true, |n| n != '.') {
                is_float = true;
                s.push(c);
                self.bump();
            } else if (c == 'e' || c == 'E') && !s.is_empty() {
                is_float = true;
                s.push(c);
                self.bump();
                if matches!(self.peek(), Some('+') | Some('-')) {
                    s.push(self.bump().unwrap());
                }
            } else {
                break;
            }
        }
        if is_float {
            let v: f64 = s
                .parse()
                .map_err(|_| self.err(LexErrorType::Other("bad float literal".into())))?;
            Ok(Tok::Float(v))
        } else {
            let v: i64 = s
                .parse()
                .map_err(|_| self.err(LexErrorType::Other("integer literal too large".into())))?;
            Ok(Tok::Int(v))
        }
    }

    fn read_string(&mut self, is_raw: bool, is_bytes: bool, is_fstring: bool) -> Result<Tok, LexError> {
        let quote = self.bump().unwrap();
        let triple = self.peek() == Some(quote) && self.peek2() == Some(quote);
        if triple {
            self.bump();
            self.bump();
        }
        let mut raw = String::new();
        loop {
            match self.peek() {
                None => return Err(self.err(LexErrorType::Eof)),
                Some(c) if c == quote => {
                    if !triple {
                        self.bump();
                        break;
                    }
                    let save = self.chars.clone();
                    let save_row = self.row;
                    let save_col = self.col;
                    self.bump();
                    if self.peek() == Some(quote) && self.peek2() == Some(quote) {
                        self.bump();
                        self.bump();
                        break;
                    } else {
                        self.chars = save;
                        self.row = save_row;
                        self.col = save_col;
                        raw.push(self.bump().unwrap());
                    }
                }
                Some('\n') if !triple => return Err(self.err(LexErrorType::UnterminatedString)),
                Some('\\') => {
                    raw.push(self.bump().unwrap());
                    if let Some(escaped) = self.peek() {
                        raw.push(escaped);
                        self.bump();
                    }
                }
                Some(c) => {
                    raw.push(c);
                    self.bump();
                }
            }
        }
        let value = if is_raw {
            raw
        } else {
            crate::string::unescape(&raw)
        };
        if is_bytes {
            Ok(Tok::Bytes(value.into_bytes()))
        } else {
            Ok(Tok::Str {
                value,
                is_raw,
                is_fstring,
            })
        }
    }

    fn read_prefixed_string_or_name(&mut self) -> Result<Tok, LexError> {
        // Peek up to 2 prefix chars among r/R b/B f/F u/U before a quote.
        let mut clone = self.chars.clone();
        let mut prefix = String::new();
        for _ in 0..2 {
            match clone.next() {
                Some(c) if "rRbBfFuU".contains(c) => prefix.push(c.to_ascii_lowercase()),
                _ => break,
            }
        }
        let after_prefix_is_quote = clone.peek().map_or(false, |c| *c == '"' || *c == '\'');
        if !prefix.is_empty() && after_prefix_is_quote {
            for _ in 0..prefix.len() {
                self.bump();
            }
            let is_raw = prefix.contains('r');
            let is_bytes = prefix.contains('b');
            let is_fstring = prefix.contains('f');
            self.read_string(is_raw, is_bytes, is_fstring)
        } else {
            let name = self.read_name();
            Ok(Tok::keyword_from_str(&name).unwrap_or(Tok::Name(name)))
        }
    }

    fn next_raw(&mut self) -> LexResult {
        loop {
            if self.at_line_start && self.paren_depth == 0 {
                self.at_line_start = false;
                if !self.measure_indent()? {
                    self.skip_comment();
                    if self.peek() == Some('\n') {
                        self.bump();
                    } else if self.peek().is_none() {
                        // fallthrough to EOF handling below
                    }
                    self.at_line_start = true;
                    if self.peek().is_none() {
                        break;
                    }
                    continue;
                }
                if let Some(tok) = self.pending.pop_front() {
                    return Ok(tok);
                }
            }
            if let Some(tok) = self.pending.pop_front() {
                return Ok(tok);
            }

            let start = self.loc();
            let c = match self.peek() {
                Some(c) => c,
                None => break,
            };

            match c {
                ' ' | '\t' | '\r' => {
                    self.bump();
                    continue;
                }
                '#' => {
                    self.skip_comment();
                    continue;
                }
                '\\' if self.peek2() == Some('\n') => {
                    self.bump();
                    self.bump();
                    continue;
                }
                '\n' => {
                    self.bump();
                    if self.paren_depth > 0 {
                        continue;
                    }
                    self.at_line_start = true;
                    return Ok(self.spanned(Tok::Newline, start));
                }
                c if c.is_ascii_digit() => return Ok(self.spanned(self.read_number_checked()?, start)),
                '.' if self.peek2().map_or(false, |n| n.is_ascii_digit()) => {
                    return Ok(self.spanned(self.read_number_checked()?, start))
                }
                '"' | '\'' => return Ok(self.spanned(self.read_string(false, false, false)?, start)),
                c if c.is_alphabetic() || c == '_' => {
                    return Ok(self.spanned(self.read_prefixed_string_or_name()?, start))
                }
                _ => return Ok(self.spanned(self.read_operator()?, start)),
            }
        }
        // End of input: emit pending dedents then EOF.
        if let Some(tok) = self.pending.pop_front() {
            return Ok(tok);
        }
        while self.indents.len() > 1 {
            self.indents.pop();
            self.pending.push_back(self.spanned(Tok::Dedent, self.loc()));
        }
        if let Some(tok) = self.pending.pop_front() {
            return Ok(tok);
        }
        if self.done {
            return Ok(self.spanned(Tok::EndOfFile, self.loc()));
        }
        self.done = true;
        Ok(self.spanned(Tok::EndOfFile, self.loc()))
    }

    fn read_number_checked(&mut self) -> Result<Tok, LexError> {
        self.read_number()
    }

    fn read_operator(&mut self) -> Result<Tok, LexError> {
        use Tok::*;
        let c = self.bump().unwrap();
        macro_rules! two {
            ($second:expr, $yes:expr, $no:expr) => {{
                if self.peek() == Some($second) {
                    self.bump();
                    $yes
                } else {
                    $no
                }
            }};
        }
        Ok(match c {
            '(' => {
                self.paren_depth += 1;
                Lpar
            }
            ')' => {
                self.paren_depth = self.paren_depth.saturating_sub(1);
                Rpar
            }
            '[' => {
                self.paren_depth += 1;
                Lsqb
            }
            ']' => {
                self.paren_depth = self.paren_depth.saturating_sub(1);
                Rsqb
            }
            '{' => {
                self.paren_depth += 1;
                Lbrace
            }
            '}' => {
                self.paren_depth = self.paren_depth.saturating_sub(1);
                Rbrace
            }
            ',' => Comma,
            ':' => Colon,
            ';' => Semi,
            '.' => {
                if self.peek() == Some('.') && self.peek2() == Some('.') {
                    self.bump();
                    self.bump();
                    Ellipsis
                } else {
                    Dot
                }
            }
            '+' => two!('=', PlusEqual, Plus),
            '-' => {
                if self.peek() == Some('>') {
                    self.bump();
                    Arrow
                } else {
                    two!('=', MinusEqual, Minus)
                }
            }
            '*' => {
                if self.peek() == Some('*') {
                    self.bump();
                    two!('=', DoubleStarEqual, DoubleStar)
                } else {
                    two!('=', StarEqual, Star)
                }
            }
            '/' => {
                if self.peek() == Some('/') {
                    self.bump();
                    two!('=', DoubleSlashEqual, DoubleSlash)
                } else {
                    two!('=', SlashEqual, Slash)
                }
            }
            '%' => two!('=', PercentEqual, Percent),
            '@' => two!('=', AtEqual, At),
            '&' => two!('=', AmperEqual, Amper),
            '|' => two!('=', VBarEqual, VBar),
            '^' => two!('=', CircumflexEqual, Circumflex),
            '~' => Tilde,
            '<' => {
                if self.peek() == Some('<') {
                    self.bump();
                    two!('=', LShiftEqual, LShift)
                } else {
                    two!('=', LessEqual, Less)
                }
            }
            '>' => {
                if self.peek() == Some('>') {
                    self.bump();
                    two!('=', RShiftEqual, RShift)
                } else {
                    two!('=', GreaterEqual, Greater)
                }
            }
            '=' => two!('=', EqEqual, Equal),
            '!' => {
                if self.peek() == Some('=') {
                    self.bump();
                    NotEqual
                } else {
                    return Err(self.err(LexErrorType::IllegalCharacter('!')));
                }
            }
            other => return Err(self.err(LexErrorType::IllegalCharacter(other))),
        })
    }
}

impl<'a> Iterator for Lexer<'a> {
    type Item = LexResult;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done && self.pending.is_empty() {
            return None;
        }
        match self.next_raw() {
            Ok(spanned) => {
                if spanned.tok == Tok::EndOfFile {
                    self.done = true;
                }
                Some(Ok(spanned))
            }
            Err(e) => {
                self.done = true;
                Some(Err(e))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn toks(src: &str) -> Vec<Tok> {
        Lexer::new(src).map(|r| r.unwrap().tok).collect()
    }

    #[test]
    fn simple_assignment() {
        let t = toks("x = 1\n");
        assert_eq!(
            t,
            vec![
                Tok::Name("x".into()),
                Tok::Equal,
                Tok::Int(1),
                Tok::Newline,
                Tok::EndOfFile
            ]
        );
    }

    #[test]
    fn indent_dedent() {
        let t = toks("if x:\n    y\nz\n");
        assert_eq!(
            t,
            vec![
                Tok::If,
                Tok::Name("x".into()),
                Tok::Colon,
                Tok::Newline,
                Tok::Indent,
                Tok::Name("y".into()),
                Tok::Newline,
                Tok::Dedent,
                Tok::Name("z".into()),
                Tok::Newline,
                Tok::EndOfFile
            ]
        );
    }

    #[test]
    fn paren_suppresses_newline() {
        let t = toks("x = (1 +\n2)\n");
        assert!(!t.contains(&Tok::Newline) || t.iter().filter(|x| **x == Tok::Newline).count() == 1);
    }

    #[test]
    fn inconsistent_dedent_errors() {
        let err = Lexer::new("if x:\n  y\n z\n").find_map(|r| r.err());
        assert!(err.is_some());
    }

    #[test]
    fn string_prefixes() {
        let t = toks("r'\\n' b'hi' f'{x}'");
        assert_eq!(
            t[0],
            Tok::Str {
                value: "\\n".into(),
                is_raw: true,
                is_fstring: false
            }
        );
        assert_eq!(t[1], Tok::Bytes(b"hi".to_vec()));
        assert!(matches!(&t[2], Tok::Str { is_fstring: true, .. }));
    }
}
