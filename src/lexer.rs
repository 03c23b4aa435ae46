// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

use core::fmt::{self, Debug, Formatter};
use core::iter::Peekable;
use core::str::CharIndices;
use std::rc::Rc;

use anyhow::{anyhow, bail, Result};

struct SourceData {
    file: String,
    text: String,
    // Byte bounds of each line, excluding the terminator.
    line_bounds: Vec<(u32, u32)>,
}

/// A Stratus source file. Cheap to clone; every [`Span`] carries one.
#[derive(Clone)]
pub struct Source {
    data: Rc<SourceData>,
}

impl PartialEq for Source {
    fn eq(&self, other: &Source) -> bool {
        Rc::ptr_eq(&self.data, &other.data)
    }
}

impl Eq for Source {}

impl Debug for Source {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        self.data.file.fmt(f)
    }
}

impl Source {
    pub fn from_contents(file: String, text: String) -> Result<Source> {
        // Spans index the file with u32 offsets.
        if text.len() >= u32::MAX as usize - 1 {
            bail!("{file} is too large to index with 32-bit spans");
        }

        let mut line_bounds = vec![];
        let mut offset = 0u32;
        for line in text.split_inclusive('\n') {
            let body = match line.strip_suffix('\n') {
                Some(rest) => rest.strip_suffix('\r').unwrap_or(rest),
                None => line,
            };
            line_bounds.push((offset, offset + body.len() as u32));
            offset += line.len() as u32;
        }
        if text.is_empty() || text.ends_with('\n') {
            // The caret of an end-of-file error lands past the last newline.
            line_bounds.push((offset, offset));
        }

        Ok(Self {
            data: Rc::new(SourceData {
                file,
                text,
                line_bounds,
            }),
        })
    }

    pub fn from_file<P: AsRef<std::path::Path>>(path: P) -> Result<Source> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)
            .map_err(|err| anyhow!("failed to read {}: {err}", path.display()))?;
        Self::from_contents(path.to_string_lossy().to_string(), text)
    }

    pub fn file(&self) -> &String {
        &self.data.file
    }

    pub fn contents(&self) -> &String {
        &self.data.text
    }

    /// The text of the given zero-based line, without its terminator.
    pub fn line(&self, idx: u32) -> &str {
        match self.data.line_bounds.get(idx as usize) {
            Some(&(start, end)) => &self.data.text[start as usize..end as usize],
            None => "",
        }
    }

    /// Render a diagnostic pointing at `line:col`, one-based.
    pub fn message(&self, line: u32, col: u32, kind: &str, msg: &str) -> String {
        if line == 0 || line as usize > self.data.line_bounds.len() {
            return format!("{}: {kind}: {msg}", self.data.file);
        }
        let gutter = " ".repeat(line.to_string().len());
        let caret = " ".repeat(col.saturating_sub(1) as usize);
        format!(
            "\n--> {}:{line}:{col}\n{gutter} |\n{line} | {}\n{gutter} | {caret}^\n{kind}: {msg}",
            self.data.file,
            self.line(line - 1),
        )
    }

    pub fn error(&self, line: u32, col: u32, msg: &str) -> anyhow::Error {
        anyhow!(self.message(line, col, "error", msg))
    }
}

/// A region of a [`Source`], with the one-based position of its first
/// character.
#[derive(Clone)]
pub struct Span {
    pub source: Source,
    pub line: u32,
    pub col: u32,
    pub start: u32,
    pub end: u32,
}

impl Span {
    pub fn text(&self) -> &str {
        &self.source.contents()[self.start as usize..self.end as usize]
    }

    pub fn message(&self, kind: &str, msg: &str) -> String {
        self.source.message(self.line, self.col, kind, msg)
    }

    pub fn error(&self, msg: &str) -> anyhow::Error {
        self.source.error(self.line, self.col, msg)
    }
}

impl Debug for Span {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        let text: String = self.text().chars().take(24).collect();
        let more = if text.len() < self.text().len() {
            "..."
        } else {
            ""
        };
        write!(f, "{}:{} {:?}{more}", self.line, self.col, text)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TokenKind {
    Symbol,
    String,
    Number,
    Ident,
    Eof,
}

#[derive(Debug, Clone)]
pub struct Token(pub TokenKind, pub Span);

#[derive(Clone)]
pub struct Lexer<'src> {
    source: Source,
    chars: Peekable<CharIndices<'src>>,
    line: u32,
    col: u32,
}

impl<'src> Lexer<'src> {
    pub fn new(source: &'src Source) -> Self {
        Self {
            source: source.clone(),
            chars: source.contents().char_indices().peekable(),
            line: 1,
            col: 1,
        }
    }

    // Offset and character at the cursor; (len, '\0') at end of input.
    fn peek(&mut self) -> (u32, char) {
        match self.chars.peek() {
            Some(&(at, ch)) => (at as u32, ch),
            None => (self.source.contents().len() as u32, '\x00'),
        }
    }

    fn peek_nth(&mut self, n: usize) -> (u32, char) {
        match self.chars.clone().nth(n) {
            Some((at, ch)) => (at as u32, ch),
            None => (self.source.contents().len() as u32, '\x00'),
        }
    }

    fn token(&self, kind: TokenKind, line: u32, col: u32, start: u32, end: u32) -> Token {
        Token(
            kind,
            Span {
                source: self.source.clone(),
                line,
                col,
                start,
                end,
            },
        )
    }

    fn read_ident(&mut self) -> Token {
        let (start, _) = self.peek();
        let col = self.col;
        while matches!(self.peek().1, ch if ch.is_ascii_alphanumeric() || ch == '_') {
            self.chars.next();
        }
        let end = self.peek().0;
        self.col += end - start;
        self.token(TokenKind::Ident, self.line, col, start, end)
    }

    fn read_digits(&mut self) {
        while self.peek().1.is_ascii_digit() {
            self.chars.next();
        }
    }

    // Numbers follow the JSON grammar, including negative literals when the
    // caller has already decided the `-` is part of one.
    fn read_number(&mut self) -> Result<Token> {
        let (start, first) = self.peek();
        let col = self.col;
        self.chars.next();

        if first != '0' {
            self.read_digits();
        }
        if self.peek().1 == '.' && self.peek_nth(1).1.is_ascii_digit() {
            self.chars.next();
            self.read_digits();
        }
        if matches!(self.peek().1, 'e' | 'E') {
            self.chars.next();
            if matches!(self.peek().1, '+' | '-') {
                self.chars.next();
            }
            self.read_digits();
        }

        let end = self.peek().0;
        self.col += end - start;

        let next = self.peek().1;
        if next == '.' || next == '_' || next.is_ascii_alphanumeric() {
            bail!(self
                .source
                .error(self.line, self.col, "invalid number literal"));
        }

        // Range and leading-zero checks are delegated to serde_json.
        let text = &self.source.contents()[start as usize..end as usize];
        if let Err(err) = serde_json::from_str::<serde_json::Number>(text) {
            bail!(
                "{} {err}",
                self.source.error(self.line, col, "invalid number literal:")
            );
        }

        Ok(self.token(TokenKind::Number, self.line, col, start, end))
    }

    // Single- or double-quoted; the span excludes the quotes and keeps
    // escapes raw for `unescape` to decode.
    fn read_string(&mut self, quote: char) -> Result<Token> {
        let (line, col) = (self.line, self.col);
        self.chars.next();
        let start = self.peek().0;
        loop {
            let (at, ch) = self.peek();
            self.col = col + 1 + (at - start);
            match ch {
                _ if ch == quote => break,
                '\x00' | '\n' => {
                    bail!(self.source.error(line, col, "unmatched string quote"));
                }
                '\\' => {
                    self.chars.next();
                    let esc = self.peek().1;
                    self.chars.next();
                    match esc {
                        '"' | '\'' | '\\' | '/' | 'b' | 'f' | 'n' | 'r' | 't' => (),
                        'u' => {
                            for _ in 0..4 {
                                if !self.peek().1.is_ascii_hexdigit() {
                                    bail!(self.source.error(
                                        line,
                                        self.col,
                                        "invalid hex escape sequence"
                                    ));
                                }
                                self.chars.next();
                            }
                        }
                        _ => bail!(self.source.error(line, col, "invalid escape sequence")),
                    }
                }
                _ if ch < '\u{0020}' => {
                    bail!(self
                        .source
                        .error(line, self.col, "invalid character in string"));
                }
                _ => {
                    self.chars.next();
                }
            }
        }
        let end = self.peek().0;
        self.chars.next();
        self.col = col + (end - start) + 2;

        Ok(self.token(TokenKind::String, line, col + 1, start, end))
    }

    fn skip_ws(&mut self) -> Result<()> {
        loop {
            match self.peek().1 {
                ' ' => {
                    self.col += 1;
                    self.chars.next();
                }
                // A tab advances the caret by four columns.
                '\t' => {
                    self.col += 4;
                    self.chars.next();
                }
                '\n' => {
                    self.line += 1;
                    self.col = 1;
                    self.chars.next();
                }
                '\r' => {
                    if self.peek_nth(1).1 != '\n' {
                        bail!(self.source.error(
                            self.line,
                            self.col,
                            "\\r must be followed by \\n"
                        ));
                    }
                    self.chars.next();
                }
                // `#` comments run to end of line.
                '#' => {
                    while !matches!(self.peek().1, '\n' | '\x00') {
                        self.chars.next();
                    }
                }
                _ => return Ok(()),
            }
        }
    }

    fn symbol(&mut self, len: u32) -> Token {
        let (start, _) = self.peek();
        let col = self.col;
        for _ in 0..len {
            self.chars.next();
        }
        self.col += len;
        self.token(TokenKind::Symbol, self.line, col, start, start + len)
    }

    pub fn next_token(&mut self) -> Result<Token> {
        self.skip_ws()?;

        let (start, ch) = self.peek();
        match ch {
            // `-` directly followed by a digit starts a negative literal.
            '-' if self.peek_nth(1).1.is_ascii_digit() => self.read_number(),

            '{' | '}' | '[' | ']' | '(' | ')' | '+' | '-' | '*' | '/' | '%' | ',' | '.' | ':' => {
                Ok(self.symbol(1))
            }

            // = == ! != < <= > >=
            '=' | '!' | '<' | '>' => {
                let len = if self.peek_nth(1).1 == '=' { 2 } else { 1 };
                Ok(self.symbol(len))
            }

            '&' | '|' => {
                if self.peek_nth(1).1 == ch {
                    Ok(self.symbol(2))
                } else {
                    Err(self.source.error(self.line, self.col, "invalid character"))
                }
            }

            '"' | '\'' => self.read_string(ch),

            '\x00' => Ok(self.token(TokenKind::Eof, self.line, self.col, start, start)),

            _ if ch.is_ascii_digit() => self.read_number(),
            _ if ch.is_ascii_alphabetic() || ch == '_' => Ok(self.read_ident()),
            _ => Err(self.source.error(self.line, self.col, "invalid character")),
        }
    }
}

/// Decode the escape sequences in a string token's text.
pub fn unescape(text: &str) -> Result<String> {
    let mut out = String::with_capacity(text.len());
    let mut chars = text.chars();
    while let Some(ch) = chars.next() {
        if ch != '\\' {
            out.push(ch);
            continue;
        }
        match chars.next() {
            Some('"') => out.push('"'),
            Some('\'') => out.push('\''),
            Some('\\') => out.push('\\'),
            Some('/') => out.push('/'),
            Some('b') => out.push('\u{0008}'),
            Some('f') => out.push('\u{000c}'),
            Some('n') => out.push('\n'),
            Some('r') => out.push('\r'),
            Some('t') => out.push('\t'),
            Some('u') => {
                let mut code = 0u32;
                for _ in 0..4 {
                    let digit = chars
                        .next()
                        .and_then(|c| c.to_digit(16))
                        .ok_or_else(|| anyhow!("invalid hex escape sequence"))?;
                    code = code * 16 + digit;
                }
                match char::from_u32(code) {
                    Some(decoded) => out.push(decoded),
                    None => bail!("invalid unicode escape sequence"),
                }
            }
            _ => bail!("invalid escape sequence"),
        }
    }
    Ok(out)
}
