// Object text tokenizer
//
//  Copyright (C) 2021-2024 The MOLT Project Contributors.
//
//  This file is part of MOLT.
//
//  This program is free software: you can redistribute it and/or modify
//  it under the terms of the GNU General Public License as published by
//  the Free Software Foundation, either version 3 of the License, or
//  (at your option) any later version.
//
//  This program is distributed in the hope that it will be useful,
//  but WITHOUT ANY WARRANTY; without even the implied warranty of
//  MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
//  GNU General Public License for more details.
//
//  You should have received a copy of the GNU General Public License
//  along with this program.  If not, see <http://www.gnu.org/licenses/>.

//! Object text tokenizer.
//!
//! Object text is line-oriented.
//! The tokenizer produces [`Statement`]s,
//!   each a non-empty token sequence terminated by a newline,
//!     a `;`,
//!     or end of input.
//! `#` begins a comment running to the end of the line.
//!
//! Tokens are whitespace-delimited words with four single-character
//!   tokens broken out regardless of surrounding whitespace
//!     (`{`, `}`, `=`, `@`)
//!   and double-quoted string literals with C-style escapes.
//! Composite type names such as `string(int32,int8&)*` are therefore a
//!   single word token;
//!     their internal structure is the business of the type-name
//!     resolver,
//!       not the tokenizer.

use memchr::memchr;
use std::error::Error;
use std::fmt::{self, Display};

/// A single token within a [`Statement`].
#[derive(Debug, PartialEq, Clone)]
pub enum Tok<'a> {
    /// A whitespace-delimited word.
    ///
    /// This covers directives,
    ///   mnemonics,
    ///   names,
    ///   composite type names,
    ///   numbers,
    ///   and labels (which carry their trailing `:`).
    Word(&'a str),

    /// A double-quoted string literal with escapes already applied.
    Str(String),

    OpenBrace,
    CloseBrace,
    Equals,
    At,
}

impl<'a> Tok<'a> {
    /// The word if this token is one.
    pub fn word(&self) -> Option<&'a str> {
        match self {
            Tok::Word(w) => Some(w),
            _ => None,
        }
    }
}

impl<'a> Display for Tok<'a> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Tok::Word(w) => write!(f, "`{}`", w),
            Tok::Str(_) => f.write_str("string literal"),
            Tok::OpenBrace => f.write_str("`{`"),
            Tok::CloseBrace => f.write_str("`}`"),
            Tok::Equals => f.write_str("`=`"),
            Tok::At => f.write_str("`@`"),
        }
    }
}

/// A logical statement with the 1-indexed line it began on.
#[derive(Debug, PartialEq, Clone)]
pub struct Statement<'a> {
    pub line: usize,
    pub toks: Vec<Tok<'a>>,
}

/// Tokenization failure at a given line.
#[derive(Debug, PartialEq, Eq, Clone)]
pub struct LexError {
    pub kind: LexErrorKind,
    pub line: usize,
}

#[derive(Debug, PartialEq, Eq, Clone)]
pub enum LexErrorKind {
    UnterminatedString,
    BadEscape(char),
}

impl Display for LexError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.kind {
            LexErrorKind::UnterminatedString => {
                write!(f, "unterminated string literal on line {}", self.line)
            }
            LexErrorKind::BadEscape(c) => write!(
                f,
                "unknown escape `\\{}` in string literal on line {}",
                c, self.line
            ),
        }
    }
}

impl Error for LexError {}

/// Tokenizer over a full unit of object text.
pub struct Lexer<'a> {
    src: &'a str,
    pos: usize,
    line: usize,
}

impl<'a> Lexer<'a> {
    pub fn new(src: &'a str) -> Self {
        Self { src, pos: 0, line: 1 }
    }

    fn skip_comment(&mut self) {
        match memchr(b'\n', &self.src.as_bytes()[self.pos..]) {
            // Leave the newline for the statement loop so it still
            //   terminates the current statement.
            Some(off) => self.pos += off,
            None => self.pos = self.src.len(),
        }
    }

    fn lex_string(&mut self) -> Result<String, LexError> {
        let bytes = self.src.as_bytes();
        let mut out = String::new();

        // Opening quote.
        self.pos += 1;

        loop {
            if self.pos >= bytes.len() || bytes[self.pos] == b'\n' {
                return Err(LexError {
                    kind: LexErrorKind::UnterminatedString,
                    line: self.line,
                });
            }

            match bytes[self.pos] {
                b'"' => {
                    self.pos += 1;
                    return Ok(out);
                }

                b'\\' => {
                    self.pos += 1;
                    let esc = if self.pos < bytes.len() {
                        bytes[self.pos] as char
                    } else {
                        return Err(LexError {
                            kind: LexErrorKind::UnterminatedString,
                            line: self.line,
                        });
                    };

                    out.push(match esc {
                        'n' => '\n',
                        't' => '\t',
                        'r' => '\r',
                        '0' => '\0',
                        '\\' => '\\',
                        '"' => '"',
                        other => {
                            return Err(LexError {
                                kind: LexErrorKind::BadEscape(other),
                                line: self.line,
                            })
                        }
                    });
                    self.pos += 1;
                }

                _ => {
                    // Multi-byte characters pass through unmodified.
                    let ch_start = self.pos;
                    let mut end = ch_start + 1;
                    while end < bytes.len()
                        && !self.src.is_char_boundary(end)
                    {
                        end += 1;
                    }
                    out.push_str(&self.src[ch_start..end]);
                    self.pos = end;
                }
            }
        }
    }

    fn lex_word(&mut self) -> &'a str {
        let bytes = self.src.as_bytes();
        let start = self.pos;

        while self.pos < bytes.len() {
            match bytes[self.pos] {
                b' ' | b'\t' | b'\r' | b'\n' | b';' | b'#' | b'{'
                | b'}' | b'=' | b'@' | b'"' => break,
                _ => self.pos += 1,
            }
        }

        &self.src[start..self.pos]
    }

    /// Produce the next non-empty statement,
    ///   or [`None`] at end of input.
    pub fn next_statement(
        &mut self,
    ) -> Option<Result<Statement<'a>, LexError>> {
        let bytes = self.src.as_bytes();
        let mut toks = Vec::new();
        let mut stmt_line = self.line;

        while self.pos < bytes.len() {
            match bytes[self.pos] {
                b' ' | b'\t' | b'\r' => self.pos += 1,

                b'#' => self.skip_comment(),

                b'\n' => {
                    self.pos += 1;
                    self.line += 1;

                    if toks.is_empty() {
                        stmt_line = self.line;
                    } else {
                        return Some(Ok(Statement {
                            line: stmt_line,
                            toks,
                        }));
                    }
                }

                b';' => {
                    self.pos += 1;

                    if !toks.is_empty() {
                        return Some(Ok(Statement {
                            line: stmt_line,
                            toks,
                        }));
                    }
                }

                b'{' => {
                    self.pos += 1;
                    toks.push(Tok::OpenBrace);
                }
                b'}' => {
                    self.pos += 1;
                    toks.push(Tok::CloseBrace);
                }
                b'=' => {
                    self.pos += 1;
                    toks.push(Tok::Equals);
                }
                b'@' => {
                    self.pos += 1;
                    toks.push(Tok::At);
                }

                b'"' => match self.lex_string() {
                    Ok(s) => toks.push(Tok::Str(s)),
                    Err(e) => return Some(Err(e)),
                },

                _ => toks.push(Tok::Word(self.lex_word())),
            }
        }

        if toks.is_empty() {
            None
        } else {
            Some(Ok(Statement {
                line: stmt_line,
                toks,
            }))
        }
    }
}

impl<'a> Iterator for Lexer<'a> {
    type Item = Result<Statement<'a>, LexError>;

    fn next(&mut self) -> Option<Self::Item> {
        self.next_statement()
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn lex(src: &str) -> Vec<Statement> {
        Lexer::new(src)
            .collect::<Result<Vec<_>, _>>()
            .expect("lexing failed")
    }

    #[test]
    fn words_split_on_whitespace() {
        let stmts = lex("public int32() main");

        assert_eq!(1, stmts.len());
        assert_eq!(
            vec![
                Tok::Word("public"),
                Tok::Word("int32()"),
                Tok::Word("main"),
            ],
            stmts[0].toks
        );
    }

    #[test]
    fn semicolon_and_newline_both_terminate() {
        let stmts = lex("ldc.i4 1; ret\nnop");

        assert_eq!(3, stmts.len());
        assert_eq!(vec![Tok::Word("ldc.i4"), Tok::Word("1")], stmts[0].toks);
        assert_eq!(vec![Tok::Word("ret")], stmts[1].toks);
        assert_eq!(vec![Tok::Word("nop")], stmts[2].toks);
    }

    #[test]
    fn braces_break_out_without_whitespace() {
        // Braces are tokens of their own even when glued to a word;
        //   they do not terminate the statement.
        let stmts = lex("public int32() main {ret}");

        assert_eq!(1, stmts.len());
        assert_eq!(
            vec![
                Tok::Word("public"),
                Tok::Word("int32()"),
                Tok::Word("main"),
                Tok::OpenBrace,
                Tok::Word("ret"),
                Tok::CloseBrace,
            ],
            stmts[0].toks
        );
    }

    #[test]
    fn comments_run_to_end_of_line() {
        let stmts = lex("nop # trailing comment\n# full line\nret");

        assert_eq!(2, stmts.len());
        assert_eq!(vec![Tok::Word("nop")], stmts[0].toks);
        assert_eq!(vec![Tok::Word("ret")], stmts[1].toks);
    }

    #[test]
    fn string_literals_with_escapes() {
        let stmts = lex(r#"ldstr "hello\n\"world\"""#);

        assert_eq!(
            vec![
                Tok::Word("ldstr"),
                Tok::Str("hello\n\"world\"".into()),
            ],
            stmts[0].toks
        );
    }

    #[test]
    fn unterminated_string_fails_with_line() {
        let err = Lexer::new("nop\nldstr \"oops")
            .collect::<Result<Vec<_>, _>>()
            .unwrap_err();

        assert_eq!(LexErrorKind::UnterminatedString, err.kind);
        assert_eq!(2, err.line);
    }

    #[test]
    fn bad_escape_fails() {
        let err = Lexer::new(r#"ldstr "\q""#)
            .collect::<Result<Vec<_>, _>>()
            .unwrap_err();

        assert_eq!(LexErrorKind::BadEscape('q'), err.kind);
    }

    #[test]
    fn statement_lines_are_tracked() {
        let stmts = lex("\n\nnop\n\nret");

        assert_eq!(3, stmts[0].line);
        assert_eq!(5, stmts[1].line);
    }

    #[test]
    fn offset_and_equals_break_out() {
        let stmts = lex("int32 x @ 4\nRED=2");

        assert_eq!(
            vec![
                Tok::Word("int32"),
                Tok::Word("x"),
                Tok::At,
                Tok::Word("4"),
            ],
            stmts[0].toks
        );
        assert_eq!(
            vec![Tok::Word("RED"), Tok::Equals, Tok::Word("2")],
            stmts[1].toks
        );
    }

    #[test]
    fn empty_input_yields_nothing() {
        assert!(lex("").is_empty());
        assert!(lex("  \n # only a comment \n;;\n").is_empty());
    }
}
