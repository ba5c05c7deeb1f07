//! Scans an input string (manifest file) character by character.

use std::path::Path;

#[derive(Debug)]
pub struct ParseError {
    msg: String,
    ofs: usize,
}
pub type ParseResult<T> = Result<T, ParseError>;

impl ParseError {
    pub fn offset(&self) -> usize {
        self.ofs
    }
}

pub struct Scanner<'a> {
    buf: &'a str,
    pub ofs: usize,
    pub line: usize,
}

impl<'a> Scanner<'a> {
    pub fn new(buf: &'a str) -> Self {
        Scanner {
            buf,
            ofs: 0,
            line: 1,
        }
    }

    pub fn slice(&self, start: usize, end: usize) -> &'a str {
        &self.buf[start..end]
    }

    /// The current character, or '\0' at the end of input.
    pub fn peek(&self) -> char {
        self.buf[self.ofs..].chars().next().unwrap_or('\0')
    }

    pub fn at_end(&self) -> bool {
        self.ofs >= self.buf.len()
    }

    pub fn peek_newline(&self) -> bool {
        let rest = &self.buf[self.ofs..];
        rest.starts_with('\n') || rest.starts_with("\r\n")
    }

    pub fn next(&mut self) {
        let c = self.peek();
        if c == '\0' && self.at_end() {
            return;
        }
        if c == '\n' {
            self.line += 1;
        }
        self.ofs += c.len_utf8();
    }

    pub fn read(&mut self) -> char {
        let c = self.peek();
        self.next();
        c
    }

    pub fn skip(&mut self, ch: char) -> bool {
        if !self.at_end() && self.peek() == ch {
            self.next();
            return true;
        }
        false
    }

    pub fn skip_spaces(&mut self) {
        while self.skip(' ') || self.skip('\t') {}
    }

    /// Consumes a line ending, if there is one.
    pub fn skip_newline(&mut self) -> bool {
        self.skip('\r');
        self.skip('\n')
    }

    pub fn expect(&mut self, ch: char) -> ParseResult<()> {
        if self.peek() != ch || self.at_end() {
            return self.parse_error(format!("expected {:?}, got {:?}", ch, self.peek()));
        }
        self.next();
        Ok(())
    }

    /// Reads a run of non-blank characters.
    pub fn read_word(&mut self) -> &'a str {
        let start = self.ofs;
        while !self.at_end() && !matches!(self.peek(), ' ' | '\t' | '\r' | '\n' | '=') {
            self.next();
        }
        self.slice(start, self.ofs)
    }

    /// Reads up to (not including) the end of the line, without trailing blanks.
    pub fn read_to_eol(&mut self) -> &'a str {
        let start = self.ofs;
        while !self.at_end() && !self.peek_newline() {
            self.next();
        }
        self.slice(start, self.ofs).trim_end()
    }

    pub fn parse_error<T, S: Into<String>>(&self, msg: S) -> ParseResult<T> {
        self.parse_error_at(self.ofs, msg)
    }

    pub fn parse_error_at<T, S: Into<String>>(&self, ofs: usize, msg: S) -> ParseResult<T> {
        Err(ParseError {
            msg: msg.into(),
            ofs,
        })
    }

    /// The 1-based line containing a byte offset.
    pub fn line_of(&self, ofs: usize) -> usize {
        1 + self.buf[..ofs.min(self.buf.len())].matches('\n').count()
    }

    /// Renders an error with its file:line location and a caret under the
    /// offending column.
    pub fn format_parse_error(&self, filename: &Path, err: &ParseError) -> String {
        let mut ofs = 0;
        for (line_number, line) in self.buf.split('\n').enumerate() {
            if ofs + line.len() >= err.ofs {
                let mut msg = "parse error: ".to_string();
                msg.push_str(&err.msg);
                msg.push('\n');

                let prefix = format!("{}:{}: ", filename.display(), line_number + 1);
                msg.push_str(&prefix);

                let line = line.trim_end_matches('\r');
                let col = (err.ofs - ofs).min(line.len());
                let context: String = line.chars().take(60).collect();
                msg.push_str(&context);
                if context.len() < line.len() {
                    msg.push_str("...");
                }
                msg.push('\n');

                msg.push_str(&" ".repeat(prefix.len() + col.min(context.len())));
                msg.push_str("^\n");
                return msg;
            }
            ofs += line.len() + 1;
        }
        format!("parse error: {}\n{}: at end of file\n", err.msg, filename.display())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn words_and_lines() {
        let mut s = Scanner::new("target //a:b  \n  out=x y\n");
        assert_eq!(s.read_word(), "target");
        s.skip_spaces();
        assert_eq!(s.read_to_eol(), "//a:b");
        assert!(s.skip_newline());
        assert_eq!(s.line, 2);
        s.skip_spaces();
        assert_eq!(s.read_word(), "out");
        s.expect('=').unwrap();
        assert_eq!(s.read_to_eol(), "x y");
        assert!(s.skip_newline());
        assert!(s.at_end());
        assert_eq!(s.peek(), '\0');
    }

    #[test]
    fn error_points_at_column() {
        let mut s = Scanner::new("target //a:b\n  bogus x\n");
        s.read_to_eol();
        s.skip_newline();
        s.skip_spaces();
        s.read_word();
        s.skip_spaces();
        let err = s.expect('=').unwrap_err();
        let msg = s.format_parse_error(Path::new("BUILD.kiln"), &err);
        // "BUILD.kiln:2: " plus the offset of 'x' within the line.
        let caret = format!("{}^\n", " ".repeat(14 + 8));
        assert_eq!(
            msg,
            format!("parse error: expected '=', got 'x'\nBUILD.kiln:2:   bogus x\n{}", caret)
        );
    }
}
