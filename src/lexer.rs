//! Minimal hand-written lexer. Not the object of study; just real enough to
//! drive the front end's three entry points (file, method fragment, do-it).
//!
//! Grounded on `axiom/src/lexer.rs`/`axiom/src/errors.rs`'s span-carrying
//! token style.

use crate::errors::{LexError, Span};

#[derive(Clone, Debug, PartialEq)]
pub enum TokenKind {
    Identifier(String),
    Keyword(String),   // "at:" — includes the trailing colon
    BinarySelector(String),
    Integer(i64),
    Character(char),
    String(String),
    Bar,                // |
    Colon,              // :
    Assign,             // :=
    Caret,              // ^
    Period,
    LParen,
    RParen,
    LBracket,
    RBracket,
    True,
    False,
    Nil,
    SelfKw,
    SuperKw,
    Eof,
}

#[derive(Clone, Debug)]
pub struct Token {
    pub kind: TokenKind,
    pub span: Span,
}

pub struct Lexer<'a> {
    source: &'a str,
    chars: Vec<(usize, char)>,
    pos: usize,
}

const BINARY_CHARS: &str = "+-*/~<>=&@%,?!\\";

impl<'a> Lexer<'a> {
    pub fn new(source: &'a str) -> Lexer<'a> {
        Lexer { source, chars: source.char_indices().collect(), pos: 0 }
    }

    fn peek(&self) -> Option<char> {
        self.chars.get(self.pos).map(|(_, c)| *c)
    }

    fn peek_at(&self, offset: usize) -> Option<char> {
        self.chars.get(self.pos + offset).map(|(_, c)| *c)
    }

    fn byte_offset(&self, idx: usize) -> usize {
        self.chars.get(idx).map(|(b, _)| *b).unwrap_or(self.source.len())
    }

    fn advance(&mut self) -> Option<char> {
        let c = self.peek();
        if c.is_some() {
            self.pos += 1;
        }
        c
    }

    fn skip_trivia(&mut self) {
        loop {
            match self.peek() {
                Some(c) if c.is_whitespace() => {
                    self.advance();
                }
                Some('"') => {
                    // Smalltalk-style comments, delimited by double quotes.
                    self.advance();
                    while let Some(c) = self.peek() {
                        self.advance();
                        if c == '"' {
                            break;
                        }
                    }
                }
                _ => break,
            }
        }
    }

    pub fn tokenize(mut self) -> Result<Vec<Token>, LexError> {
        let mut out = Vec::new();
        loop {
            self.skip_trivia();
            let start_idx = self.pos;
            let start = self.byte_offset(start_idx);
            let Some(c) = self.peek() else {
                out.push(Token { kind: TokenKind::Eof, span: Span::new(start, start) });
                break;
            };
            let kind = if c.is_ascii_digit() {
                self.lex_number(start)?
            } else if c == '$' {
                self.lex_character(start)?
            } else if c == '\'' {
                self.lex_string(start)?
            } else if c.is_alphabetic() || c == '_' {
                self.lex_word()
            } else if BINARY_CHARS.contains(c) {
                self.lex_binary_selector()
            } else {
                self.advance();
                match c {
                    '|' => TokenKind::Bar,
                    ':' => {
                        if self.peek() == Some('=') {
                            self.advance();
                            TokenKind::Assign
                        } else {
                            TokenKind::Colon
                        }
                    }
                    '^' => TokenKind::Caret,
                    '.' => TokenKind::Period,
                    '(' => TokenKind::LParen,
                    ')' => TokenKind::RParen,
                    '[' => TokenKind::LBracket,
                    ']' => TokenKind::RBracket,
                    other => {
                        let end = self.byte_offset(self.pos);
                        return Err(LexError::UnexpectedChar { ch: other, span: Span::new(start, end) });
                    }
                }
            };
            let end = self.byte_offset(self.pos);
            out.push(Token { kind, span: Span::new(start, end) });
        }
        Ok(out)
    }

    fn lex_number(&mut self, _start: usize) -> Result<TokenKind, LexError> {
        let start_idx = self.pos;
        while self.peek().is_some_and(|c| c.is_ascii_digit()) {
            self.advance();
        }
        let text: String = self.chars[start_idx..self.pos].iter().map(|(_, c)| *c).collect();
        text.parse::<i64>()
            .map(TokenKind::Integer)
            .map_err(|_| LexError::MalformedNumber {
                text,
                span: Span::new(self.byte_offset(start_idx), self.byte_offset(self.pos)),
            })
    }

    fn lex_character(&mut self, start: usize) -> Result<TokenKind, LexError> {
        self.advance(); // '$'
        match self.advance() {
            Some(c) => Ok(TokenKind::Character(c)),
            None => Err(LexError::UnexpectedChar { ch: '$', span: Span::new(start, start + 1) }),
        }
    }

    fn lex_string(&mut self, start: usize) -> Result<TokenKind, LexError> {
        self.advance(); // opening quote
        let mut text = String::new();
        loop {
            match self.advance() {
                Some('\'') => {
                    if self.peek() == Some('\'') {
                        self.advance();
                        text.push('\'');
                    } else {
                        return Ok(TokenKind::String(text));
                    }
                }
                Some(c) => text.push(c),
                None => {
                    return Err(LexError::UnterminatedString {
                        span: Span::new(start, self.byte_offset(self.pos)),
                    })
                }
            }
        }
    }

    fn lex_word(&mut self) -> TokenKind {
        let start_idx = self.pos;
        while self.peek().is_some_and(|c| c.is_alphanumeric() || c == '_') {
            self.advance();
        }
        let mut word: String = self.chars[start_idx..self.pos].iter().map(|(_, c)| *c).collect();
        if self.peek() == Some(':') && self.peek_at(1) != Some('=') {
            self.advance();
            word.push(':');
            return TokenKind::Keyword(word);
        }
        match word.as_str() {
            "true" => TokenKind::True,
            "false" => TokenKind::False,
            "nil" => TokenKind::Nil,
            "self" => TokenKind::SelfKw,
            "super" => TokenKind::SuperKw,
            _ => TokenKind::Identifier(word),
        }
    }

    fn lex_binary_selector(&mut self) -> TokenKind {
        let start_idx = self.pos;
        while self.peek().is_some_and(|c| BINARY_CHARS.contains(c)) {
            self.advance();
        }
        let sel: String = self.chars[start_idx..self.pos].iter().map(|(_, c)| *c).collect();
        TokenKind::BinarySelector(sel)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn kinds(src: &str) -> Vec<TokenKind> {
        Lexer::new(src).tokenize().unwrap().into_iter().map(|t| t.kind).collect()
    }

    #[test]
    fn lexes_temps_assignment_and_return() {
        let toks = kinds("| x | x := 2 + 3. ^ x");
        assert_eq!(
            toks,
            vec![
                TokenKind::Bar,
                TokenKind::Identifier("x".into()),
                TokenKind::Bar,
                TokenKind::Identifier("x".into()),
                TokenKind::Assign,
                TokenKind::Integer(2),
                TokenKind::BinarySelector("+".into()),
                TokenKind::Integer(3),
                TokenKind::Period,
                TokenKind::Caret,
                TokenKind::Identifier("x".into()),
                TokenKind::Eof,
            ]
        );
    }

    #[test]
    fn lexes_keyword_message_send() {
        let toks = kinds("1 to: 3 do: [:i | i]");
        assert!(matches!(toks[1], TokenKind::Keyword(ref s) if s == "to:"));
        assert!(matches!(toks[3], TokenKind::Keyword(ref s) if s == "do:"));
    }

    #[test]
    fn rejects_unterminated_string() {
        let err = Lexer::new("'abc").tokenize().unwrap_err();
        assert!(matches!(err, LexError::UnterminatedString { .. }));
    }
}
