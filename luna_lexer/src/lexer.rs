//! The scanner.
//!
//! Byte stream in, tokens out, with a single token of lookahead. Line
//! breaks `\n`, `\r`, `\n\r`, and `\r\n` each count as one logical line.

use smallvec::SmallVec;

use luna_common::{limits, Interner, LunaError, LunaResult, LuaStr};

use crate::numeral::{self, Numeral};
use crate::reader::ByteReader;
use crate::token::{reserved, Token};

/// Inline capacity of the token buffer; longer lexemes spill to the heap.
const MIN_BUFFER: usize = 32;

pub struct Lexer<'a> {
    reader: ByteReader<'a>,
    /// Current character, `None` at end of stream.
    current: Option<u8>,
    /// Input line counter.
    linenumber: u32,
    /// Line of the last token consumed.
    lastline: u32,
    tok: Token,
    ahead: Option<Token>,
    buff: SmallVec<[u8; MIN_BUFFER]>,
    interner: Interner,
    /// Chunk name as given (with its `@`/`=` prefix, if any).
    source: LuaStr,
    /// Formatted chunk name for error prefixes.
    chunk: String,
}

impl<'a> Lexer<'a> {
    /// Set up the scanner, reading the first byte of the stream.
    pub fn new(mut reader: ByteReader<'a>, chunk_name: &str) -> LunaResult<Lexer<'a>> {
        let first = reader.next_byte()?;
        Lexer::with_first(reader, chunk_name, first)
    }

    /// Set up the scanner when the caller has already read the first
    /// byte (to sniff for a binary chunk signature).
    pub fn with_first(
        reader: ByteReader<'a>,
        chunk_name: &str,
        first: Option<u8>,
    ) -> LunaResult<Lexer<'a>> {
        let mut interner = Interner::new();
        let source = interner.intern_str(chunk_name);
        let current = first;
        Ok(Lexer {
            reader,
            current,
            linenumber: 1,
            lastline: 1,
            tok: Token::Eos,
            ahead: None,
            buff: SmallVec::new(),
            interner,
            source,
            chunk: limits::chunk_id(chunk_name),
        })
    }

    pub fn source(&self) -> &LuaStr {
        &self.source
    }

    pub fn line_number(&self) -> u32 {
        self.linenumber
    }

    pub fn last_line(&self) -> u32 {
        self.lastline
    }

    pub fn current_token(&self) -> &Token {
        &self.tok
    }

    pub fn intern(&mut self, bytes: &[u8]) -> LuaStr {
        self.interner.intern(bytes)
    }

    pub fn intern_str(&mut self, s: &str) -> LuaStr {
        self.interner.intern_str(s)
    }

    /// Read the next token into the current slot.
    pub fn next_token(&mut self) -> LunaResult<()> {
        self.lastline = self.linenumber;
        match self.ahead.take() {
            Some(t) => self.tok = t,
            None => self.tok = self.scan()?,
        }
        Ok(())
    }

    /// Peek one token ahead without consuming it.
    pub fn lookahead(&mut self) -> LunaResult<&Token> {
        if self.ahead.is_none() {
            let t = self.scan()?;
            self.ahead = Some(t);
        }
        Ok(self.ahead.as_ref().unwrap())
    }

    /// `<chunk>:<line>: <msg>` formatted error, optionally decorated
    /// with the offending token.
    pub fn error_at(&self, msg: &str, line: u32, token: Option<&Token>) -> LunaError {
        let mut text = format!("{}:{}: {}", self.chunk, line, msg);
        if let Some(t) = token {
            text.push_str(&format!(" near {}", self.near_text(t)));
        }
        LunaError::syntax(text)
    }

    /// Syntax error at the current token.
    pub fn syntax_error(&self, msg: &str) -> LunaError {
        self.error_at(msg, self.linenumber, Some(&self.tok))
    }

    /// Semantic error: same shape, but never decorated with "near".
    pub fn semantic_error(&self, msg: &str) -> LunaError {
        let text = format!("{}:{}: {}", self.chunk, self.linenumber, msg);
        LunaError::semantic(text)
    }

    fn near_text(&self, t: &Token) -> String {
        t.describe()
    }

    fn lex_error(&self, msg: &str, show_buffer: bool) -> LunaError {
        let mut text = format!("{}:{}: {}", self.chunk, self.linenumber, msg);
        if show_buffer && !self.buff.is_empty() {
            text.push_str(&format!(" near '{}'", String::from_utf8_lossy(&self.buff)));
        }
        LunaError::lexical(text)
    }

    fn next_char(&mut self) -> LunaResult<()> {
        self.current = self.reader.next_byte()?;
        Ok(())
    }

    fn save(&mut self, c: u8) {
        self.buff.push(c);
    }

    fn save_and_next(&mut self) -> LunaResult<()> {
        let c = self.current.expect("save_and_next at end of stream");
        self.save(c);
        self.next_char()
    }

    fn is_newline(&self) -> bool {
        matches!(self.current, Some(b'\n') | Some(b'\r'))
    }

    /// Increment the line counter, skipping `\n`, `\r`, `\n\r`, `\r\n`
    /// as one line break.
    fn inc_line(&mut self) -> LunaResult<()> {
        let old = self.current;
        debug_assert!(self.is_newline());
        self.next_char()?;
        if self.is_newline() && self.current != old {
            self.next_char()?;
        }
        self.linenumber = self
            .linenumber
            .checked_add(1)
            .filter(|&l| l < i32::MAX as u32)
            .ok_or_else(|| self.lex_error("chunk has too many lines", false))?;
        Ok(())
    }

    fn check_next(&mut self, c: u8) -> LunaResult<bool> {
        if self.current == Some(c) {
            self.next_char()?;
            Ok(true)
        } else {
            Ok(false)
        }
    }

    /// Check whether the current char is one of the two in `set`, saving
    /// it if so.
    fn check_next2(&mut self, set: [u8; 2]) -> LunaResult<bool> {
        match self.current {
            Some(c) if c == set[0] || c == set[1] => {
                self.save_and_next()?;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    fn read_numeral(&mut self) -> LunaResult<Token> {
        let first = self.current;
        debug_assert!(matches!(first, Some(c) if c.is_ascii_digit()));
        self.save_and_next()?;
        let expo: [u8; 2] = if first == Some(b'0') && self.check_next2([b'x', b'X'])? {
            [b'p', b'P']
        } else {
            [b'e', b'E']
        };
        loop {
            if self.check_next2(expo)? {
                // Sign is valid only right after an exponent mark.
                self.check_next2([b'-', b'+'])?;
            } else if matches!(self.current, Some(c) if c.is_ascii_hexdigit() || c == b'.') {
                self.save_and_next()?;
            } else {
                break;
            }
        }
        if matches!(self.current, Some(c) if c.is_ascii_alphanumeric() || c == b'_') {
            self.save_and_next()?; // numeral touching a letter: force error
        }
        match numeral::str_to_number(&self.buff) {
            Some(Numeral::Int(i)) => Ok(Token::Int(i)),
            Some(Numeral::Float(f)) => Ok(Token::Flt(f)),
            None => Err(self.lex_error("malformed number", true)),
        }
    }

    /// Read `[=*[` or `]=*]`, leaving the final bracket. A well-formed
    /// sequence yields its number of `=` signs plus 2; a lone bracket
    /// yields 1; an unfinished `[==...` yields 0.
    fn skip_sep(&mut self) -> LunaResult<usize> {
        let mut count = 0usize;
        let s = self.current;
        debug_assert!(matches!(s, Some(b'[') | Some(b']')));
        self.save_and_next()?;
        while self.current == Some(b'=') {
            self.save_and_next()?;
            count += 1;
        }
        Ok(if self.current == s {
            count + 2
        } else if count == 0 {
            1
        } else {
            0
        })
    }

    /// Long string or long comment body. `keep` is false for comments,
    /// where the content is discarded.
    fn read_long_string(&mut self, sep: usize, keep: bool) -> LunaResult<Option<LuaStr>> {
        let start_line = self.linenumber;
        self.save_and_next()?; // skip 2nd '['
        if self.is_newline() {
            self.inc_line()?; // first newline right after the opener is dropped
        }
        loop {
            match self.current {
                None => {
                    let what = if keep { "string" } else { "comment" };
                    return Err(self.lex_error(
                        &format!("unfinished long {} (starting at line {})", what, start_line),
                        false,
                    ));
                }
                Some(b']') => {
                    if self.skip_sep()? == sep {
                        self.save_and_next()?; // skip 2nd ']'
                        break;
                    }
                }
                Some(b'\n') | Some(b'\r') => {
                    self.save(b'\n');
                    self.inc_line()?;
                    if !keep {
                        self.buff.clear();
                    }
                }
                Some(_) => {
                    if keep {
                        self.save_and_next()?;
                    } else {
                        self.next_char()?;
                    }
                }
            }
        }
        if keep {
            let content = &self.buff[sep..self.buff.len() - sep];
            let s = self.interner.intern(content);
            Ok(Some(s))
        } else {
            Ok(None)
        }
    }

    fn esc_check(&mut self, ok: bool, msg: &str) -> LunaResult<()> {
        if !ok {
            if self.current.is_some() {
                self.save_and_next()?; // add current to the error context
            }
            return Err(self.lex_error(msg, true));
        }
        Ok(())
    }

    fn get_hex(&mut self) -> LunaResult<u32> {
        self.save_and_next()?;
        let ok = matches!(self.current, Some(c) if c.is_ascii_hexdigit());
        self.esc_check(ok, "hexadecimal digit expected")?;
        Ok(hex_value(self.current.unwrap()))
    }

    fn read_hex_esc(&mut self) -> LunaResult<u8> {
        let r = self.get_hex()?;
        let r = (r << 4) + self.get_hex()?;
        self.buff.truncate(self.buff.len() - 2);
        Ok(r as u8)
    }

    /// `\u{XXX}` escape, encoded as UTF-8 (up to 6 bytes, max value
    /// 0x7FFFFFFF).
    fn read_utf8_esc(&mut self) -> LunaResult<u32> {
        let mut removed = 4; // number of buffered chars: starts with "\u{X"
        self.save_and_next()?; // skip 'u'
        self.esc_check(self.current == Some(b'{'), "missing '{'")?;
        let mut r = self.get_hex()?;
        loop {
            self.save_and_next()?;
            match self.current {
                Some(c) if c.is_ascii_hexdigit() => {
                    removed += 1;
                    self.esc_check(r <= 0x7FFFFFFF >> 4, "UTF-8 value too large")?;
                    r = (r << 4) + hex_value(c);
                }
                _ => break,
            }
        }
        self.esc_check(self.current == Some(b'}'), "missing '}'")?;
        self.next_char()?; // skip '}'
        self.buff.truncate(self.buff.len() - removed);
        Ok(r)
    }

    fn utf8_esc(&mut self) -> LunaResult<()> {
        let r = self.read_utf8_esc()?;
        for b in utf8_encode(r) {
            self.save(b);
        }
        Ok(())
    }

    fn read_dec_esc(&mut self) -> LunaResult<u8> {
        let mut r: u32 = 0;
        let mut i = 0;
        while i < 3 && matches!(self.current, Some(c) if c.is_ascii_digit()) {
            r = 10 * r + (self.current.unwrap() - b'0') as u32;
            self.save_and_next()?;
            i += 1;
        }
        self.esc_check(r <= u8::MAX as u32, "decimal escape too large")?;
        self.buff.truncate(self.buff.len() - i);
        Ok(r as u8)
    }

    fn read_string(&mut self, del: u8) -> LunaResult<Token> {
        self.save_and_next()?; // keep delimiter for error messages
        while self.current != Some(del) {
            match self.current {
                None => return Err(self.lex_error("unfinished string", false)),
                Some(b'\n') | Some(b'\r') => {
                    return Err(self.lex_error("unfinished string", true))
                }
                Some(b'\\') => {
                    self.save_and_next()?; // keep '\\' for error messages
                    let c: Option<u8> = match self.current {
                        Some(b'a') => Some(0x07),
                        Some(b'b') => Some(0x08),
                        Some(b'f') => Some(0x0c),
                        Some(b'n') => Some(b'\n'),
                        Some(b'r') => Some(b'\r'),
                        Some(b't') => Some(b'\t'),
                        Some(b'v') => Some(0x0b),
                        Some(b'x') => Some(self.read_hex_esc()?),
                        Some(b'u') => {
                            // removes its own buffered chars, backslash included
                            self.utf8_esc()?;
                            continue;
                        }
                        Some(b'\n') | Some(b'\r') => {
                            self.inc_line()?;
                            // drop the '\\', keep a newline
                            self.buff.pop();
                            self.save(b'\n');
                            continue;
                        }
                        Some(b'\\') | Some(b'"') | Some(b'\'') => self.current,
                        None => continue, // error raised on next loop turn
                        Some(b'z') => {
                            self.buff.pop(); // remove '\\'
                            self.next_char()?; // skip 'z'
                            while matches!(self.current, Some(c) if c.is_ascii_whitespace() || c == 0x0b) {
                                if self.is_newline() {
                                    self.inc_line()?;
                                } else {
                                    self.next_char()?;
                                }
                            }
                            continue;
                        }
                        Some(c) => {
                            self.esc_check(c.is_ascii_digit(), "invalid escape sequence")?;
                            let v = self.read_dec_esc()?;
                            self.buff.pop(); // remove '\\'
                            self.save(v);
                            continue;
                        }
                    };
                    if let Some(c) = c {
                        self.next_char()?;
                        self.buff.pop(); // remove '\\'
                        self.save(c);
                    }
                }
                Some(_) => self.save_and_next()?,
            }
        }
        self.save_and_next()?; // skip delimiter
        let content = &self.buff[1..self.buff.len() - 1];
        let s = self.interner.intern(content);
        Ok(Token::Str(s))
    }

    /// The scanner proper: skip space and comments, produce one token.
    fn scan(&mut self) -> LunaResult<Token> {
        self.buff.clear();
        loop {
            match self.current {
                Some(b'\n') | Some(b'\r') => {
                    self.inc_line()?;
                }
                Some(b' ') | Some(0x0c) | Some(b'\t') | Some(0x0b) => {
                    self.next_char()?;
                }
                Some(b'-') => {
                    self.next_char()?;
                    if self.current != Some(b'-') {
                        return Ok(Token::Char(b'-'));
                    }
                    // a comment
                    self.next_char()?;
                    if self.current == Some(b'[') {
                        let sep = self.skip_sep()?;
                        self.buff.clear(); // skip_sep may dirty the buffer
                        if sep >= 2 {
                            self.read_long_string(sep, false)?;
                            self.buff.clear();
                            continue;
                        }
                    }
                    // short comment: until end of line
                    self.skip_line_comment()?;
                }
                Some(b'[') => {
                    let sep = self.skip_sep()?;
                    if sep >= 2 {
                        let s = self.read_long_string(sep, true)?.unwrap();
                        return Ok(Token::Str(s));
                    } else if sep == 0 {
                        return Err(self.lex_error("invalid long string delimiter", true));
                    }
                    return Ok(Token::Char(b'['));
                }
                Some(b'=') => {
                    self.next_char()?;
                    if self.check_next(b'=')? {
                        return Ok(Token::Eq);
                    }
                    return Ok(Token::Char(b'='));
                }
                Some(b'<') => {
                    self.next_char()?;
                    if self.check_next(b'=')? {
                        return Ok(Token::Le);
                    } else if self.check_next(b'<')? {
                        return Ok(Token::Shl);
                    }
                    return Ok(Token::Char(b'<'));
                }
                Some(b'>') => {
                    self.next_char()?;
                    if self.check_next(b'=')? {
                        return Ok(Token::Ge);
                    } else if self.check_next(b'>')? {
                        return Ok(Token::Shr);
                    }
                    return Ok(Token::Char(b'>'));
                }
                Some(b'/') => {
                    self.next_char()?;
                    if self.check_next(b'/')? {
                        return Ok(Token::IDiv);
                    }
                    return Ok(Token::Char(b'/'));
                }
                Some(b'~') => {
                    self.next_char()?;
                    if self.check_next(b'=')? {
                        return Ok(Token::Ne);
                    }
                    return Ok(Token::Char(b'~'));
                }
                Some(b':') => {
                    self.next_char()?;
                    if self.check_next(b':')? {
                        return Ok(Token::DbColon);
                    }
                    return Ok(Token::Char(b':'));
                }
                Some(c @ b'"') | Some(c @ b'\'') => {
                    return self.read_string(c);
                }
                Some(b'.') => {
                    // '.', '..', '...', or a numeral
                    self.save_and_next()?;
                    if self.check_next(b'.')? {
                        if self.check_next(b'.')? {
                            return Ok(Token::Dots);
                        }
                        return Ok(Token::Concat);
                    }
                    if !matches!(self.current, Some(c) if c.is_ascii_digit()) {
                        return Ok(Token::Char(b'.'));
                    }
                    return self.read_fractional_numeral();
                }
                Some(c) if c.is_ascii_digit() => {
                    return self.read_numeral();
                }
                None => {
                    return Ok(Token::Eos);
                }
                Some(c) if c.is_ascii_alphabetic() || c == b'_' => {
                    // identifier or reserved word
                    loop {
                        self.save_and_next()?;
                        match self.current {
                            Some(c) if c.is_ascii_alphanumeric() || c == b'_' => {}
                            _ => break,
                        }
                    }
                    if let Some(t) = reserved(&self.buff) {
                        return Ok(t);
                    }
                    let name = self.interner.intern(&self.buff);
                    return Ok(Token::Name(name));
                }
                Some(c) => {
                    // single-char tokens: '+', '*', '%', '{', '}', ...
                    self.next_char()?;
                    return Ok(Token::Char(c));
                }
            }
        }
    }

    /// Numeral continuation after an initial '.' was already buffered.
    fn read_fractional_numeral(&mut self) -> LunaResult<Token> {
        loop {
            if self.check_next2([b'e', b'E'])? {
                self.check_next2([b'-', b'+'])?;
            } else if matches!(self.current, Some(c) if c.is_ascii_hexdigit() || c == b'.') {
                self.save_and_next()?;
            } else {
                break;
            }
        }
        if matches!(self.current, Some(c) if c.is_ascii_alphanumeric() || c == b'_') {
            self.save_and_next()?;
        }
        match numeral::str_to_number(&self.buff) {
            Some(Numeral::Int(i)) => Ok(Token::Int(i)),
            Some(Numeral::Float(f)) => Ok(Token::Flt(f)),
            None => Err(self.lex_error("malformed number", true)),
        }
    }

    fn skip_line_comment(&mut self) -> LunaResult<()> {
        match self.current {
            Some(b'\n') | Some(b'\r') | None => Ok(()),
            Some(_) => {
                self.current = self.reader.skip_to_newline()?;
                Ok(())
            }
        }
    }
}

fn hex_value(c: u8) -> u32 {
    match c {
        b'0'..=b'9' => (c - b'0') as u32,
        b'a'..=b'f' => (c - b'a' + 10) as u32,
        _ => (c - b'A' + 10) as u32,
    }
}

/// Encode a code point (up to 0x7FFFFFFF) in extended UTF-8, 1-6 bytes.
pub fn utf8_encode(x: u32) -> SmallVec<[u8; 6]> {
    let mut out = SmallVec::new();
    if x < 0x80 {
        out.push(x as u8);
        return out;
    }
    let mut x = x;
    let mut mfb: u32 = 0x3f; // maximum that fits in the first byte
    let mut tail = SmallVec::<[u8; 6]>::new();
    loop {
        tail.push((0x80 | (x & 0x3f)) as u8);
        x >>= 6;
        mfb >>= 1;
        if x <= mfb {
            break;
        }
    }
    out.push((!mfb << 1) as u8 | x as u8);
    out.extend(tail.into_iter().rev());
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn lex_all(src: &str) -> Vec<Token> {
        let mut lx = Lexer::new(ByteReader::from_slice(src.as_bytes()), "=test").unwrap();
        let mut out = Vec::new();
        loop {
            lx.next_token().unwrap();
            if *lx.current_token() == Token::Eos {
                break;
            }
            out.push(lx.current_token().clone());
        }
        out
    }

    fn lex_err(src: &str) -> LunaError {
        let mut lx = Lexer::new(ByteReader::from_slice(src.as_bytes()), "=test").unwrap();
        loop {
            if let Err(e) = lx.next_token() {
                return e;
            }
            if *lx.current_token() == Token::Eos {
                panic!("no error for {:?}", src);
            }
        }
    }

    #[test]
    fn keywords_names_and_symbols() {
        let toks = lex_all("local x = y + 1");
        assert_eq!(toks[0], Token::Local);
        assert!(matches!(&toks[1], Token::Name(n) if n.as_bytes() == b"x"));
        assert_eq!(toks[2], Token::Char(b'='));
        assert!(matches!(&toks[3], Token::Name(_)));
        assert_eq!(toks[4], Token::Char(b'+'));
        assert_eq!(toks[5], Token::Int(1));
    }

    #[test]
    fn multichar_operators() {
        let toks = lex_all("// .. ... == >= <= ~= << >> ::");
        assert_eq!(
            toks,
            vec![
                Token::IDiv,
                Token::Concat,
                Token::Dots,
                Token::Eq,
                Token::Ge,
                Token::Le,
                Token::Ne,
                Token::Shl,
                Token::Shr,
                Token::DbColon,
            ]
        );
    }

    #[test]
    fn newline_pairs_count_once() {
        let mut lx =
            Lexer::new(ByteReader::from_slice(b"a\r\nb\n\rc\nd\re"), "=test").unwrap();
        let mut lines = Vec::new();
        loop {
            lx.next_token().unwrap();
            if *lx.current_token() == Token::Eos {
                break;
            }
            lines.push(lx.line_number());
        }
        assert_eq!(lines, vec![1, 2, 3, 4, 5]);
    }

    #[test]
    fn short_string_escapes() {
        let toks = lex_all(r#"x = "a\65\x42\tz\\""#);
        match &toks[2] {
            Token::Str(s) => assert_eq!(s.as_bytes(), b"aAB\tz\\"),
            t => panic!("not a string: {:?}", t),
        }
    }

    #[test]
    fn utf8_escapes() {
        let toks = lex_all(r#"s = "\u{48}\u{E9}\u{10348}""#);
        match &toks[2] {
            Token::Str(s) => assert_eq!(s.as_bytes(), "H\u{e9}\u{10348}".as_bytes()),
            t => panic!("not a string: {:?}", t),
        }
    }

    #[test]
    fn z_escape_skips_whitespace() {
        let toks = lex_all("s = \"a\\z  \n\t  b\"");
        match &toks[2] {
            Token::Str(s) => assert_eq!(s.as_bytes(), b"ab"),
            t => panic!("not a string: {:?}", t),
        }
    }

    #[test]
    fn backslash_newline_becomes_newline() {
        let toks = lex_all("s = \"a\\\nb\"");
        match &toks[2] {
            Token::Str(s) => assert_eq!(s.as_bytes(), b"a\nb"),
            t => panic!("not a string: {:?}", t),
        }
    }

    #[test]
    fn long_strings() {
        let toks = lex_all("s = [[hello]] t = [==[a]b]==]");
        match &toks[2] {
            Token::Str(s) => assert_eq!(s.as_bytes(), b"hello"),
            t => panic!("not a string: {:?}", t),
        }
        match &toks[5] {
            Token::Str(s) => assert_eq!(s.as_bytes(), b"a]b"),
            t => panic!("not a string: {:?}", t),
        }
    }

    #[test]
    fn long_string_strips_leading_newline() {
        let toks = lex_all("s = [[\nline]]");
        match &toks[2] {
            Token::Str(s) => assert_eq!(s.as_bytes(), b"line"),
            t => panic!("not a string: {:?}", t),
        }
    }

    #[test]
    fn comments_are_skipped() {
        let toks = lex_all("a -- short comment\nb --[[ long\ncomment ]] c --[==[x]==] d");
        assert_eq!(toks.len(), 4);
        assert!(toks.iter().all(|t| matches!(t, Token::Name(_))));
    }

    #[test]
    fn comment_with_level_one_bracket_is_short() {
        // '--[[' needs level >= 2; '--[=' followed by junk is a short comment
        let toks = lex_all("--[= not a long comment\nx");
        assert_eq!(toks.len(), 1);
    }

    #[test]
    fn numerals() {
        let toks = lex_all("1 3.5 0x10 1e2 .5 0x1p4");
        assert_eq!(
            toks,
            vec![
                Token::Int(1),
                Token::Flt(3.5),
                Token::Int(16),
                Token::Flt(100.0),
                Token::Flt(0.5),
                Token::Flt(16.0),
            ]
        );
    }

    #[test]
    fn lookahead_preserves_order() {
        let mut lx = Lexer::new(ByteReader::from_slice(b"a = 1"), "=t").unwrap();
        lx.next_token().unwrap();
        assert!(matches!(lx.current_token(), Token::Name(_)));
        assert!(lx.lookahead().unwrap().is_char(b'='));
        lx.next_token().unwrap();
        assert!(lx.current_token().is_char(b'='));
        lx.next_token().unwrap();
        assert_eq!(*lx.current_token(), Token::Int(1));
    }

    #[test]
    fn lexical_errors() {
        assert!(lex_err("\"unfinished").message().contains("unfinished string"));
        assert!(lex_err("[[unfinished").message().contains("unfinished long string"));
        assert!(lex_err("--[[unfinished").message().contains("unfinished long comment"));
        assert!(lex_err("3e").message().contains("malformed number"));
        assert!(lex_err("\"\\q\"").message().contains("invalid escape sequence"));
        assert!(lex_err("\"\\300\"").message().contains("decimal escape too large"));
        assert!(lex_err("\"\\u{80000000}\"").message().contains("UTF-8 value too large"));
    }

    #[test]
    fn error_messages_carry_chunk_and_line() {
        let e = lex_err("x\n\"oops");
        assert!(e.message().starts_with("test:2:"), "got {}", e.message());
    }

    #[test]
    fn utf8_encode_boundaries() {
        assert_eq!(utf8_encode(0x41).as_slice(), &[0x41]);
        assert_eq!(utf8_encode(0x7f).as_slice(), &[0x7f]);
        assert_eq!(utf8_encode(0x80).as_slice(), &[0xc2, 0x80]);
        assert_eq!(utf8_encode(0x7ff).as_slice(), &[0xdf, 0xbf]);
        assert_eq!(utf8_encode(0x800).as_slice(), &[0xe0, 0xa0, 0x80]);
        assert_eq!(utf8_encode(0x10348).as_slice(), &[0xf0, 0x90, 0x8d, 0x88]);
        assert_eq!(
            utf8_encode(0x7FFFFFFF).as_slice(),
            &[0xfd, 0xbf, 0xbf, 0xbf, 0xbf, 0xbf]
        );
    }
}
