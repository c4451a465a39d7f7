// Copyright 2024 OctoFHIR Team
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Tokenizer for FHIRPath expressions
//!
//! Tokens borrow slices of the input; string escapes are processed by the parser.

use super::error::{ParseError, ParseResult};
use std::borrow::Cow;

/// FHIRPath token
#[derive(Debug, Clone, PartialEq)]
pub enum Token<'input> {
    // Literals
    /// Integer literal (e.g., 42)
    Integer(i64),
    /// Decimal literal source text (e.g., 3.14)
    Decimal(&'input str),
    /// String literal content between the quotes, escapes unprocessed
    String(&'input str),
    /// Date literal without the `@` (e.g., 2023-01-01)
    Date(&'input str),
    /// DateTime literal without the `@` (e.g., 2023-01-01T12:00:00Z)
    DateTime(&'input str),
    /// Time literal without the `@T` (e.g., 12:00:00)
    Time(&'input str),

    /// Plain identifier
    Identifier(&'input str),
    /// Backtick delimited identifier content
    DelimitedIdentifier(&'input str),

    // Operators
    /// Addition operator (+)
    Plus,
    /// Subtraction operator (-)
    Minus,
    /// Multiplication operator (*)
    Multiply,
    /// Division operator (/)
    Divide,
    /// Modulo operator (mod keyword)
    Mod,
    /// Integer division operator (div keyword)
    Div,
    /// Equality operator (=)
    Equal,
    /// Inequality operator (!=)
    NotEqual,
    /// Less than operator (<)
    LessThan,
    /// Less than or equal operator (<=)
    LessThanOrEqual,
    /// Greater than operator (>)
    GreaterThan,
    /// Greater than or equal operator (>=)
    GreaterThanOrEqual,
    /// Equivalence operator (~)
    Equivalent,
    /// Non-equivalence operator (!~)
    NotEquivalent,
    /// Logical AND operator (and keyword)
    And,
    /// Logical OR operator (or keyword)
    Or,
    /// Logical XOR operator (xor keyword)
    Xor,
    /// Logical implication operator (implies keyword)
    Implies,
    /// Union operator (|)
    Union,
    /// Membership operator (in keyword)
    In,
    /// Contains operator (contains keyword)
    Contains,
    /// String concatenation (&)
    Ampersand,
    /// Type checking operator (is keyword)
    Is,
    /// Type casting operator (as keyword)
    As,

    // Punctuation
    /// Left parenthesis (
    LeftParen,
    /// Right parenthesis )
    RightParen,
    /// Left square bracket [
    LeftBracket,
    /// Right square bracket ]
    RightBracket,
    /// Left curly brace {
    LeftBrace,
    /// Right curly brace }
    RightBrace,
    /// Dot operator (.)
    Dot,
    /// Comma separator (,)
    Comma,
    /// Percent sign introducing an environment variable
    Percent,

    // Special variables
    /// $this
    DollarThis,
    /// $index
    DollarIndex,
    /// $total
    DollarTotal,
    /// Boolean literal true
    True,
    /// Boolean literal false
    False,
}

impl<'input> Token<'input> {
    /// Keyword lookup
    pub fn from_keyword(s: &str) -> Option<Token<'input>> {
        match s {
            "and" => Some(Token::And),
            "or" => Some(Token::Or),
            "xor" => Some(Token::Xor),
            "implies" => Some(Token::Implies),
            "in" => Some(Token::In),
            "contains" => Some(Token::Contains),
            "is" => Some(Token::Is),
            "as" => Some(Token::As),
            "div" => Some(Token::Div),
            "mod" => Some(Token::Mod),
            "true" => Some(Token::True),
            "false" => Some(Token::False),
            _ => None,
        }
    }

    /// Identifier text, including keywords that may name a member or function after `.`
    pub fn as_member_name(&self) -> Option<&'input str> {
        match self {
            Token::Identifier(name) | Token::DelimitedIdentifier(name) => Some(name),
            Token::Contains => Some("contains"),
            Token::As => Some("as"),
            Token::Is => Some("is"),
            Token::In => Some("in"),
            Token::Div => Some("div"),
            Token::Mod => Some("mod"),
            _ => None,
        }
    }

    /// Identifier text, if this is a plain identifier
    pub fn as_identifier(&self) -> Option<&'input str> {
        match self {
            Token::Identifier(name) => Some(name),
            _ => None,
        }
    }
}

/// FHIRPath tokenizer over a borrowed input
pub struct Tokenizer<'input> {
    input: &'input str,
    bytes: &'input [u8],
    pos: usize,
    end: usize,
}

impl<'input> Tokenizer<'input> {
    /// Create a new tokenizer
    pub fn new(input: &'input str) -> Self {
        Self {
            input,
            bytes: input.as_bytes(),
            pos: 0,
            end: input.len(),
        }
    }

    /// Current byte offset
    pub fn position(&self) -> usize {
        self.pos
    }

    fn slice(&self, start: usize, end: usize) -> &'input str {
        self.input.get(start..end).unwrap_or("")
    }

    fn peek_byte(&self, offset: usize) -> Option<u8> {
        self.bytes.get(self.pos + offset).copied()
    }

    fn is_id_start(ch: u8) -> bool {
        matches!(ch, b'A'..=b'Z' | b'a'..=b'z' | b'_')
    }

    fn is_id_continue(ch: u8) -> bool {
        matches!(ch, b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'_')
    }

    fn skip_whitespace_and_comments(&mut self) -> ParseResult<()> {
        loop {
            while self.pos < self.end && self.bytes[self.pos].is_ascii_whitespace() {
                self.pos += 1;
            }
            match (self.peek_byte(0), self.peek_byte(1)) {
                (Some(b'/'), Some(b'/')) => {
                    while self.pos < self.end && self.bytes[self.pos] != b'\n' {
                        self.pos += 1;
                    }
                }
                (Some(b'/'), Some(b'*')) => {
                    let start = self.pos;
                    self.pos += 2;
                    loop {
                        if self.pos + 1 >= self.end {
                            return Err(ParseError::UnexpectedToken {
                                token: Cow::Borrowed("Unclosed multi-line comment"),
                                position: start,
                            });
                        }
                        if self.bytes[self.pos] == b'*' && self.bytes[self.pos + 1] == b'/' {
                            self.pos += 2;
                            break;
                        }
                        self.pos += 1;
                    }
                }
                _ => return Ok(()),
            }
        }
    }

    fn parse_number(&mut self) -> ParseResult<Token<'input>> {
        let start = self.pos;
        while self.pos < self.end && self.bytes[self.pos].is_ascii_digit() {
            self.pos += 1;
        }

        let is_decimal = self.peek_byte(0) == Some(b'.')
            && self.peek_byte(1).is_some_and(|b| b.is_ascii_digit());

        if is_decimal {
            self.pos += 1;
            while self.pos < self.end && self.bytes[self.pos].is_ascii_digit() {
                self.pos += 1;
            }
            return Ok(Token::Decimal(self.slice(start, self.pos)));
        }

        let text = self.slice(start, self.pos);
        text.parse::<i64>()
            .map(Token::Integer)
            .map_err(|e| ParseError::InvalidLiteral {
                message: format!("integer '{text}': {e}"),
                position: start,
            })
    }

    fn parse_identifier(&mut self) -> &'input str {
        let start = self.pos;
        while self.pos < self.end && Self::is_id_continue(self.bytes[self.pos]) {
            self.pos += 1;
        }
        self.slice(start, self.pos)
    }

    /// Quoted content between `quote` characters; escapes are skipped, not processed
    fn parse_quoted(&mut self, quote: u8) -> ParseResult<&'input str> {
        let open = self.pos;
        self.pos += 1;
        let start = self.pos;
        while self.pos < self.end {
            match self.bytes[self.pos] {
                b'\\' => self.pos += 2,
                b if b == quote => {
                    let content = self.slice(start, self.pos);
                    self.pos += 1;
                    return Ok(content);
                }
                _ => self.pos += 1,
            }
        }
        Err(ParseError::UnclosedString { position: open })
    }

    fn scan_while(&mut self, accept: impl Fn(u8) -> bool) {
        while self.pos < self.end && accept(self.bytes[self.pos]) {
            self.pos += 1;
        }
    }

    fn scan_time(&mut self) {
        self.scan_while(|b| b.is_ascii_digit() || b == b':');
        if self.peek_byte(0) == Some(b'.') && self.peek_byte(1).is_some_and(|b| b.is_ascii_digit())
        {
            self.pos += 1;
            self.scan_while(|b| b.is_ascii_digit());
        }
    }

    fn parse_datetime_literal(&mut self) -> ParseResult<Token<'input>> {
        let at = self.pos;
        self.pos += 1;

        if self.peek_byte(0) == Some(b'T') {
            self.pos += 1;
            let start = self.pos;
            self.scan_time();
            if self.pos == start {
                return Err(ParseError::InvalidLiteral {
                    message: "empty time literal".to_string(),
                    position: at,
                });
            }
            return Ok(Token::Time(self.slice(start, self.pos)));
        }

        let start = self.pos;
        self.scan_while(|b| b.is_ascii_digit() || b == b'-');
        if self.pos == start {
            return Err(ParseError::InvalidLiteral {
                message: "expected date after '@'".to_string(),
                position: at,
            });
        }

        if self.peek_byte(0) != Some(b'T') {
            return Ok(Token::Date(self.slice(start, self.pos)));
        }

        self.pos += 1;
        self.scan_time();
        match self.peek_byte(0) {
            Some(b'Z') => self.pos += 1,
            Some(b'+') | Some(b'-') if self.peek_byte(1).is_some_and(|b| b.is_ascii_digit()) => {
                self.pos += 1;
                self.scan_while(|b| b.is_ascii_digit() || b == b':');
            }
            _ => {}
        }
        Ok(Token::DateTime(self.slice(start, self.pos)))
    }

    fn single(&mut self, token: Token<'input>) -> Token<'input> {
        self.pos += 1;
        token
    }

    fn double(&mut self, token: Token<'input>) -> Token<'input> {
        self.pos += 2;
        token
    }

    /// Next token, or `None` at end of input
    pub fn next_token(&mut self) -> ParseResult<Option<Token<'input>>> {
        self.skip_whitespace_and_comments()?;

        if self.pos >= self.end {
            return Ok(None);
        }

        let token = match self.bytes[self.pos] {
            b'.' => self.single(Token::Dot),
            b'(' => self.single(Token::LeftParen),
            b')' => self.single(Token::RightParen),
            b'[' => self.single(Token::LeftBracket),
            b']' => self.single(Token::RightBracket),
            b'{' => self.single(Token::LeftBrace),
            b'}' => self.single(Token::RightBrace),
            b',' => self.single(Token::Comma),
            b'+' => self.single(Token::Plus),
            b'-' => self.single(Token::Minus),
            b'*' => self.single(Token::Multiply),
            b'/' => self.single(Token::Divide),
            b'|' => self.single(Token::Union),
            b'&' => self.single(Token::Ampersand),
            b'~' => self.single(Token::Equivalent),
            b'%' => self.single(Token::Percent),
            b'=' => self.single(Token::Equal),
            b'!' => match self.peek_byte(1) {
                Some(b'=') => self.double(Token::NotEqual),
                Some(b'~') => self.double(Token::NotEquivalent),
                _ => {
                    return Err(ParseError::UnexpectedToken {
                        token: Cow::Borrowed("'!' must be followed by '=' or '~'"),
                        position: self.pos,
                    });
                }
            },
            b'<' => match self.peek_byte(1) {
                Some(b'=') => self.double(Token::LessThanOrEqual),
                _ => self.single(Token::LessThan),
            },
            b'>' => match self.peek_byte(1) {
                Some(b'=') => self.double(Token::GreaterThanOrEqual),
                _ => self.single(Token::GreaterThan),
            },
            b'\'' => Token::String(self.parse_quoted(b'\'')?),
            b'`' => Token::DelimitedIdentifier(self.parse_quoted(b'`')?),
            b'@' => self.parse_datetime_literal()?,
            b'$' => {
                let start = self.pos;
                self.pos += 1;
                match self.parse_identifier() {
                    "this" => Token::DollarThis,
                    "index" => Token::DollarIndex,
                    "total" => Token::DollarTotal,
                    other => {
                        return Err(ParseError::UnexpectedToken {
                            token: Cow::Owned(format!("unknown special variable '${other}'")),
                            position: start,
                        });
                    }
                }
            }
            b if b.is_ascii_digit() => self.parse_number()?,
            b if Self::is_id_start(b) => {
                let ident = self.parse_identifier();
                Token::from_keyword(ident).unwrap_or(Token::Identifier(ident))
            }
            _ => {
                let ch = self
                    .input
                    .get(self.pos..)
                    .and_then(|rest| rest.chars().next())
                    .unwrap_or('?');
                return Err(ParseError::UnexpectedToken {
                    token: Cow::Owned(format!("unexpected character '{ch}'")),
                    position: self.pos,
                });
            }
        };

        Ok(Some(token))
    }

    /// Tokenize the whole input
    pub fn tokenize_all(&mut self) -> ParseResult<Vec<Token<'input>>> {
        let mut tokens = Vec::new();
        while let Some(token) = self.next_token()? {
            tokens.push(token);
        }
        Ok(tokens)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn tokens(input: &str) -> Vec<Token<'_>> {
        Tokenizer::new(input).tokenize_all().unwrap()
    }

    #[test]
    fn test_tokenizer_basic() {
        let mut tokenizer = Tokenizer::new("QuestionnaireResponse.item");

        let token1 = tokenizer.next_token().unwrap().unwrap();
        assert_eq!(token1.as_identifier(), Some("QuestionnaireResponse"));
        assert_eq!(tokenizer.next_token().unwrap().unwrap(), Token::Dot);
        let token3 = tokenizer.next_token().unwrap().unwrap();
        assert_eq!(token3.as_identifier(), Some("item"));
        assert!(tokenizer.next_token().unwrap().is_none());
    }

    #[test]
    fn test_operators() {
        assert_eq!(
            tokens("= != < <= > >= ~ !~ | &"),
            vec![
                Token::Equal,
                Token::NotEqual,
                Token::LessThan,
                Token::LessThanOrEqual,
                Token::GreaterThan,
                Token::GreaterThanOrEqual,
                Token::Equivalent,
                Token::NotEquivalent,
                Token::Union,
                Token::Ampersand,
            ]
        );
    }

    #[test]
    fn test_keywords_and_variables() {
        assert_eq!(
            tokens("a and b or $this implies %resource"),
            vec![
                Token::Identifier("a"),
                Token::And,
                Token::Identifier("b"),
                Token::Or,
                Token::DollarThis,
                Token::Implies,
                Token::Percent,
                Token::Identifier("resource"),
            ]
        );
    }

    #[test]
    fn test_numbers() {
        assert_eq!(
            tokens("42 3.14 1.toString()"),
            vec![
                Token::Integer(42),
                Token::Decimal("3.14"),
                Token::Integer(1),
                Token::Dot,
                Token::Identifier("toString"),
                Token::LeftParen,
                Token::RightParen,
            ]
        );
    }

    #[test]
    fn test_string_literals() {
        assert_eq!(
            tokens(r"'hello' 'it\'s' `given name`"),
            vec![
                Token::String("hello"),
                Token::String(r"it\'s"),
                Token::DelimitedIdentifier("given name"),
            ]
        );
        assert!(matches!(
            Tokenizer::new("'open").tokenize_all(),
            Err(ParseError::UnclosedString { position: 0 })
        ));
    }

    #[test]
    fn test_temporal_literals() {
        assert_eq!(
            tokens("@2024-01-15 @2024-01-15T10:30:00.5+10:00 @T14:30 @2024-01-15T10:00Z"),
            vec![
                Token::Date("2024-01-15"),
                Token::DateTime("2024-01-15T10:30:00.5+10:00"),
                Token::Time("14:30"),
                Token::DateTime("2024-01-15T10:00Z"),
            ]
        );
    }

    #[test]
    fn test_comments_are_skipped() {
        assert_eq!(
            tokens("a // trailing\n + /* inline */ b"),
            vec![Token::Identifier("a"), Token::Plus, Token::Identifier("b")]
        );
    }

    #[test]
    fn test_rejects_unknown_characters() {
        let err = Tokenizer::new("a # b").tokenize_all().unwrap_err();
        assert_eq!(err.position(), 2);
    }
}
