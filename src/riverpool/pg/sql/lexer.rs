use crate::riverpool::{Error, Result};


/// A lexical token. Keywords and unquoted identifiers are upper-cased, literals are not kept.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum Token {
    Word(String),
    QuotedIdentifier(String),
    Literal,
    Number,
    Param,
    Punct(char),
    Operator,
}

impl Token {
    pub fn is_word(&self, kw: &str) -> bool {
        matches!(self, Token::Word(w) if w == kw)
    }

    /// identifier returns the name for a word or quoted identifier
    pub fn identifier(&self) -> Option<&str> {
        match self {
            Token::Word(w) | Token::QuotedIdentifier(w) => Some(w),
            _ => None,
        }
    }
}

const ALL_OPERATORS: &str = "+-*/<>~=!@#%^&|`?";

/// Lexer splits a query into tokens, skipping whitespace and comments.
/// It stops at the first top-level semicolon, only the first statement is classified.
pub struct Lexer<'a> {
    src: &'a str,
    pos: usize,
}

impl<'a> Lexer<'a> {
    pub fn new(src: &'a str) -> Self {
        Self { src, pos: 0 }
    }

    pub fn tokenize(mut self) -> Result<Vec<Token>> {
        let mut tokens = Vec::new();
        loop {
            let c = match self.next() {
                Some(c) => c,
                None => break,
            };
            if c.is_whitespace() {
                continue;
            } else if c == '-' && self.peek() == Some('-') {
                self.sql_comment();
            } else if c == '/' && self.peek() == Some('*') {
                self.c_style_comment()?;
            } else if c == '\'' {
                self.string(false)?;
                tokens.push(Token::Literal);
            } else if (c == 'E' || c == 'e') && self.peek() == Some('\'') {
                self.next();
                self.string(true)?;
                tokens.push(Token::Literal);
            } else if c == '"' {
                tokens.push(Token::QuotedIdentifier(self.quoted_identifier()?));
            } else if c == '$' {
                tokens.push(self.dollar()?);
            } else if c.is_ascii_digit() {
                self.numeric();
                tokens.push(Token::Number);
            } else if c.is_alphabetic() || c == '_' {
                tokens.push(Token::Word(self.keyword_or_identifier()));
            } else if c == ';' {
                break;
            } else if "(),.[]:".contains(c) {
                tokens.push(Token::Punct(c));
            } else if ALL_OPERATORS.contains(c) {
                while matches!(self.peek(), Some(c) if ALL_OPERATORS.contains(c)) {
                    self.next();
                }
                tokens.push(Token::Operator);
            } else {
                return Err(Error::new(format!("unexpected char '{}' in query", c)));
            }
        }
        Ok(tokens)
    }

    fn peek(&self) -> Option<char> {
        self.src[self.pos..].chars().next()
    }

    fn next(&mut self) -> Option<char> {
        let c = self.peek()?;
        self.pos += c.len_utf8();
        Some(c)
    }

    fn sql_comment(&mut self) {
        while let Some(c) = self.next() {
            if c == '\r' || c == '\n' {
                break;
            }
        }
    }

    /// c-style comments nest
    fn c_style_comment(&mut self) -> Result<()> {
        self.next();
        let mut level = 1;
        while level > 0 {
            match self.next() {
                Some('/') if self.peek() == Some('*') => { self.next(); level += 1; },
                Some('*') if self.peek() == Some('/') => { self.next(); level -= 1; },
                Some(_) => (),
                None => return Err(Error::new("unexpected eof while parsing c-style comment")),
            }
        }
        Ok(())
    }

    fn string(&mut self, escapes: bool) -> Result<()> {
        let mut backslashes = 0;
        loop {
            match self.next() {
                None => return Err(Error::new("unexpected eof parsing string")),
                Some('\'') => {
                    if escapes && backslashes % 2 != 0 {
                        backslashes = 0;
                    } else if self.peek() == Some('\'') {
                        self.next(); // '' is an escaped quote
                    } else {
                        return Ok(());
                    }
                },
                Some('\\') => backslashes += 1,
                Some(_) => backslashes = 0,
            }
        }
    }

    fn quoted_identifier(&mut self) -> Result<String> {
        let mut ident = String::new();
        loop {
            match self.next() {
                Some('"') => {
                    if self.peek() == Some('"') {
                        self.next();
                        ident.push('"');
                    } else {
                        return Ok(ident);
                    }
                },
                Some(c) => ident.push(c),
                None => return Err(Error::new("unexpected eof parsing quoted identifier")),
            }
        }
    }

    /// dollar parses $1 style parameters and $tag$ quoted strings
    fn dollar(&mut self) -> Result<Token> {
        if matches!(self.peek(), Some(c) if c.is_ascii_digit()) {
            self.numeric();
            return Ok(Token::Param);
        }
        let start = self.pos - 1;
        let tag_end = match self.src[self.pos..].find('$') {
            Some(i) => self.pos + i + 1,
            None => return Err(Error::new("invalid $ in query")),
        };
        let tag = &self.src[start..tag_end];
        match self.src[tag_end..].find(tag) {
            Some(j) => {
                self.pos = tag_end + j + tag.len();
                Ok(Token::Literal)
            },
            None => Err(Error::new(format!("missing ending {} for $ quoted string", tag))),
        }
    }

    fn numeric(&mut self) {
        while matches!(self.peek(), Some(c) if c.is_ascii_alphanumeric() || c == '.') {
            self.next();
        }
    }

    fn keyword_or_identifier(&mut self) -> String {
        let start = self.pos - 1;
        while matches!(self.peek(), Some(c) if c.is_alphanumeric() || c == '_' || c == '$') {
            self.next();
        }
        self.src[start..self.pos].to_uppercase()
    }
}
