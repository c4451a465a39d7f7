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

//! Pratt parser for FHIRPath expressions

use super::error::{ParseError, ParseResult};
use super::tokenizer::{Token, Tokenizer};
use crate::ast::{
    Arguments, BinaryOperator, ExpressionNode, LiteralValue, SpecialVariable, UnaryOperator,
};
use std::borrow::Cow;

/// Calendar duration keywords accepted as quantity units (`4 weeks`)
const CALENDAR_UNITS: &[&str] = &[
    "year",
    "years",
    "month",
    "months",
    "week",
    "weeks",
    "day",
    "days",
    "hour",
    "hours",
    "minute",
    "minutes",
    "second",
    "seconds",
    "millisecond",
    "milliseconds",
];

/// Operator precedence levels (higher = tighter binding)
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Precedence {
    /// Lowest precedence - implies (right associative)
    Implies = 1,
    /// Logical OR and XOR
    Or = 2,
    /// Logical AND
    And = 3,
    /// Membership operators (in, contains)
    Membership = 4,
    /// Equality operators (=, !=, ~, !~)
    Equality = 5,
    /// Inequality operators (<, >, <=, >=)
    Inequality = 6,
    /// Union operator (|)
    Union = 7,
    /// Type operators (is, as)
    Type = 8,
    /// Additive operators (+, -, &)
    Additive = 9,
    /// Multiplicative operators (*, /, div, mod)
    Multiplicative = 10,
    /// Unary operators (+, -)
    Unary = 11,
    /// Invocation/Indexing (., [])
    Invocation = 12,
}

impl Precedence {
    /// Next higher precedence level for left-associative operators
    pub const fn next_level(self) -> Self {
        match self {
            Precedence::Implies => Precedence::Or,
            Precedence::Or => Precedence::And,
            Precedence::And => Precedence::Membership,
            Precedence::Membership => Precedence::Equality,
            Precedence::Equality => Precedence::Inequality,
            Precedence::Inequality => Precedence::Union,
            Precedence::Union => Precedence::Type,
            Precedence::Type => Precedence::Additive,
            Precedence::Additive => Precedence::Multiplicative,
            Precedence::Multiplicative => Precedence::Unary,
            Precedence::Unary => Precedence::Invocation,
            Precedence::Invocation => Precedence::Invocation,
        }
    }

    /// Check if this precedence is right associative
    pub const fn is_right_associative(self) -> bool {
        matches!(self, Precedence::Implies)
    }
}

/// Precedence of infix tokens; `.` and `[` are handled as postfix
fn get_precedence(token: &Token<'_>) -> Option<Precedence> {
    match token {
        Token::Equal | Token::NotEqual | Token::Equivalent | Token::NotEquivalent => {
            Some(Precedence::Equality)
        }
        Token::Plus | Token::Minus | Token::Ampersand => Some(Precedence::Additive),
        Token::And => Some(Precedence::And),
        Token::Or | Token::Xor => Some(Precedence::Or),
        Token::Multiply | Token::Divide | Token::Div | Token::Mod => {
            Some(Precedence::Multiplicative)
        }
        Token::LessThan
        | Token::LessThanOrEqual
        | Token::GreaterThan
        | Token::GreaterThanOrEqual => Some(Precedence::Inequality),
        Token::In | Token::Contains => Some(Precedence::Membership),
        Token::Is | Token::As => Some(Precedence::Type),
        Token::Union => Some(Precedence::Union),
        Token::Implies => Some(Precedence::Implies),
        _ => None,
    }
}

fn token_to_binary_op(token: &Token<'_>) -> Option<BinaryOperator> {
    match token {
        Token::Equal => Some(BinaryOperator::Equal),
        Token::NotEqual => Some(BinaryOperator::NotEqual),
        Token::Plus => Some(BinaryOperator::Add),
        Token::Minus => Some(BinaryOperator::Subtract),
        Token::And => Some(BinaryOperator::And),
        Token::Or => Some(BinaryOperator::Or),
        Token::Equivalent => Some(BinaryOperator::Equivalent),
        Token::NotEquivalent => Some(BinaryOperator::NotEquivalent),
        Token::LessThan => Some(BinaryOperator::LessThan),
        Token::LessThanOrEqual => Some(BinaryOperator::LessThanOrEqual),
        Token::GreaterThan => Some(BinaryOperator::GreaterThan),
        Token::GreaterThanOrEqual => Some(BinaryOperator::GreaterThanOrEqual),
        Token::In => Some(BinaryOperator::In),
        Token::Contains => Some(BinaryOperator::Contains),
        Token::Multiply => Some(BinaryOperator::Multiply),
        Token::Divide => Some(BinaryOperator::Divide),
        Token::Div => Some(BinaryOperator::IntegerDivide),
        Token::Mod => Some(BinaryOperator::Modulo),
        Token::Union => Some(BinaryOperator::Union),
        Token::Ampersand => Some(BinaryOperator::Concatenate),
        Token::Xor => Some(BinaryOperator::Xor),
        Token::Implies => Some(BinaryOperator::Implies),
        _ => None,
    }
}

/// Pratt parser over the token stream
///
/// Binary operators are folded by precedence climbing; invocation (`.`), indexing and
/// function-call argument lists are parsed as postfix operations on the primary expression.
pub struct PrattParser<'input> {
    tokenizer: Tokenizer<'input>,
    current_token: Option<Token<'input>>,
    token_start: usize,
}

impl<'input> PrattParser<'input> {
    /// Create new parser
    pub fn new(input: &'input str) -> Self {
        Self {
            tokenizer: Tokenizer::new(input),
            current_token: None,
            token_start: 0,
        }
    }

    fn advance(&mut self) -> ParseResult<()> {
        self.token_start = self.tokenizer.position();
        self.current_token = self.tokenizer.next_token()?;
        Ok(())
    }

    fn current(&self) -> Option<&Token<'input>> {
        self.current_token.as_ref()
    }

    fn expect(&mut self, expected: Token<'input>) -> ParseResult<()> {
        match &self.current_token {
            Some(token) if std::mem::discriminant(token) == std::mem::discriminant(&expected) => {
                self.advance()
            }
            Some(token) => Err(ParseError::UnexpectedToken {
                token: Cow::Owned(format!("expected {expected:?}, found {token:?}")),
                position: self.token_start,
            }),
            None => Err(ParseError::UnexpectedEof {
                position: self.tokenizer.position(),
            }),
        }
    }

    /// Parse a complete expression; trailing tokens are an error
    pub fn parse(mut self) -> ParseResult<ExpressionNode> {
        self.advance()?;
        let expression = self.parse_expression_with_precedence(Precedence::Implies)?;
        if let Some(token) = self.current() {
            return Err(ParseError::UnexpectedToken {
                token: Cow::Owned(format!("unexpected trailing {token:?}")),
                position: self.token_start,
            });
        }
        Ok(expression)
    }

    fn parse_expression_with_precedence(
        &mut self,
        min_precedence: Precedence,
    ) -> ParseResult<ExpressionNode> {
        let mut left = self.parse_unary()?;

        loop {
            let (precedence, binary_op, is_type_check) = match self.current() {
                Some(token) => match get_precedence(token) {
                    Some(precedence) => (
                        precedence,
                        token_to_binary_op(token),
                        matches!(token, Token::Is),
                    ),
                    None => break,
                },
                None => break,
            };

            if precedence < min_precedence {
                break;
            }

            self.advance()?;

            if precedence == Precedence::Type {
                let type_name = self.parse_type_specifier()?;
                left = if is_type_check {
                    ExpressionNode::type_check(left, type_name)
                } else {
                    ExpressionNode::type_cast(left, type_name)
                };
                continue;
            }

            let Some(op) = binary_op else { break };
            let next_min = if precedence.is_right_associative() {
                precedence
            } else {
                precedence.next_level()
            };
            let right = self.parse_expression_with_precedence(next_min)?;
            left = ExpressionNode::binary_op(op, left, right);
        }

        Ok(left)
    }

    fn parse_unary(&mut self) -> ParseResult<ExpressionNode> {
        match self.current() {
            Some(Token::Minus) => {
                self.advance()?;
                let operand = self.parse_expression_with_precedence(Precedence::Unary)?;
                Ok(negate(operand))
            }
            Some(Token::Plus) => {
                self.advance()?;
                let operand = self.parse_expression_with_precedence(Precedence::Unary)?;
                Ok(ExpressionNode::unary_op(UnaryOperator::Positive, operand))
            }
            _ => {
                let primary = self.parse_primary()?;
                self.parse_postfix(primary)
            }
        }
    }

    fn parse_postfix(&mut self, mut left: ExpressionNode) -> ParseResult<ExpressionNode> {
        loop {
            match self.current() {
                Some(Token::Dot) => {
                    self.advance()?;
                    let Some(name) = self.current().and_then(Token::as_member_name) else {
                        return Err(ParseError::UnexpectedToken {
                            token: Cow::Borrowed("expected member name after '.'"),
                            position: self.token_start,
                        });
                    };
                    self.advance()?;
                    left = if matches!(self.current(), Some(Token::LeftParen)) {
                        let args = self.parse_arguments()?;
                        ExpressionNode::method_call(left, name, args)
                    } else {
                        ExpressionNode::path(left, name)
                    };
                }
                Some(Token::LeftBracket) => {
                    self.advance()?;
                    let index = self.parse_expression_with_precedence(Precedence::Implies)?;
                    self.expect(Token::RightBracket)?;
                    left = ExpressionNode::index(left, index);
                }
                _ => return Ok(left),
            }
        }
    }

    fn parse_primary(&mut self) -> ParseResult<ExpressionNode> {
        let position = self.token_start;
        let Some(token) = self.current_token.take() else {
            return Err(ParseError::UnexpectedEof {
                position: self.tokenizer.position(),
            });
        };
        self.advance()?;

        match token {
            Token::Identifier(name) => {
                if matches!(self.current(), Some(Token::LeftParen)) {
                    let args = self.parse_arguments()?;
                    Ok(ExpressionNode::function_call(name, args))
                } else {
                    Ok(ExpressionNode::identifier(name))
                }
            }
            Token::DelimitedIdentifier(name) => {
                Ok(ExpressionNode::identifier(process_string_escapes(name, position)?))
            }
            Token::Integer(value) => match self.parse_unit()? {
                Some(unit) => Ok(ExpressionNode::literal(LiteralValue::Quantity {
                    value: value.to_string(),
                    unit,
                })),
                None => Ok(ExpressionNode::literal(LiteralValue::Integer(value))),
            },
            Token::Decimal(value) => match self.parse_unit()? {
                Some(unit) => Ok(ExpressionNode::literal(LiteralValue::Quantity {
                    value: value.to_string(),
                    unit,
                })),
                None => Ok(ExpressionNode::literal(LiteralValue::Decimal(
                    value.to_string(),
                ))),
            },
            Token::String(value) => Ok(ExpressionNode::literal(LiteralValue::String(
                process_string_escapes(value, position)?,
            ))),
            Token::True => Ok(ExpressionNode::literal(LiteralValue::Boolean(true))),
            Token::False => Ok(ExpressionNode::literal(LiteralValue::Boolean(false))),
            Token::Date(value) => Ok(ExpressionNode::literal(LiteralValue::Date(
                value.to_string(),
            ))),
            Token::DateTime(value) => Ok(ExpressionNode::literal(LiteralValue::DateTime(
                value.to_string(),
            ))),
            Token::Time(value) => Ok(ExpressionNode::literal(LiteralValue::Time(
                value.to_string(),
            ))),
            Token::Percent => {
                let name_position = self.token_start;
                let name = match self.current_token.take() {
                    Some(Token::Identifier(name)) => name.to_string(),
                    Some(Token::DelimitedIdentifier(name)) | Some(Token::String(name)) => {
                        process_string_escapes(name, name_position)?
                    }
                    other => {
                        return Err(ParseError::UnexpectedToken {
                            token: Cow::Owned(format!(
                                "expected variable name after '%', found {other:?}"
                            )),
                            position: name_position,
                        });
                    }
                };
                self.advance()?;
                Ok(ExpressionNode::variable(name))
            }
            Token::DollarThis => Ok(ExpressionNode::Special(SpecialVariable::This)),
            Token::DollarIndex => Ok(ExpressionNode::Special(SpecialVariable::Index)),
            Token::DollarTotal => Ok(ExpressionNode::Special(SpecialVariable::Total)),
            Token::LeftParen => {
                let expression = self.parse_expression_with_precedence(Precedence::Implies)?;
                self.expect(Token::RightParen)?;
                Ok(expression)
            }
            Token::LeftBrace => {
                self.expect(Token::RightBrace)?;
                Ok(ExpressionNode::literal(LiteralValue::Null))
            }
            other => Err(ParseError::UnexpectedToken {
                token: Cow::Owned(format!("unexpected {other:?} at start of expression")),
                position,
            }),
        }
    }

    /// Unit following a numeric literal, if any
    fn parse_unit(&mut self) -> ParseResult<Option<String>> {
        let position = self.token_start;
        let unit = match self.current() {
            Some(Token::String(unit)) => Some(process_string_escapes(unit, position)?),
            Some(Token::Identifier(unit)) if CALENDAR_UNITS.contains(unit) => Some(unit.to_string()),
            _ => None,
        };
        if unit.is_some() {
            self.advance()?;
        }
        Ok(unit)
    }

    fn parse_arguments(&mut self) -> ParseResult<Arguments> {
        self.expect(Token::LeftParen)?;
        let mut args = Arguments::new();
        if matches!(self.current(), Some(Token::RightParen)) {
            self.advance()?;
            return Ok(args);
        }
        loop {
            args.push(self.parse_expression_with_precedence(Precedence::Implies)?);
            match self.current() {
                Some(Token::Comma) => self.advance()?,
                _ => {
                    self.expect(Token::RightParen)?;
                    return Ok(args);
                }
            }
        }
    }

    /// Type name after `is`/`as`; namespace qualifiers are dropped
    fn parse_type_specifier(&mut self) -> ParseResult<String> {
        let mut name = self.expect_type_segment()?;
        while matches!(self.current(), Some(Token::Dot)) {
            self.advance()?;
            name = self.expect_type_segment()?;
        }
        Ok(name)
    }

    fn expect_type_segment(&mut self) -> ParseResult<String> {
        let Some(name) = self.current().and_then(Token::as_member_name) else {
            return Err(ParseError::UnexpectedToken {
                token: Cow::Borrowed("expected type name"),
                position: self.token_start,
            });
        };
        self.advance()?;
        Ok(name.to_string())
    }
}

fn negate(operand: ExpressionNode) -> ExpressionNode {
    match operand {
        ExpressionNode::Literal(LiteralValue::Integer(value)) => {
            ExpressionNode::literal(LiteralValue::Integer(-value))
        }
        ExpressionNode::Literal(LiteralValue::Decimal(value)) => {
            ExpressionNode::literal(LiteralValue::Decimal(format!("-{value}")))
        }
        ExpressionNode::Literal(LiteralValue::Quantity { value, unit }) => {
            ExpressionNode::literal(LiteralValue::Quantity {
                value: format!("-{value}"),
                unit,
            })
        }
        other => ExpressionNode::unary_op(UnaryOperator::Negate, other),
    }
}

/// Process FHIRPath string escapes, including `\uXXXX`
pub fn process_string_escapes(raw: &str, position: usize) -> ParseResult<String> {
    if !raw.contains('\\') {
        return Ok(raw.to_string());
    }

    let mut result = String::with_capacity(raw.len());
    let mut chars = raw.chars();
    while let Some(ch) = chars.next() {
        if ch != '\\' {
            result.push(ch);
            continue;
        }
        match chars.next() {
            Some('\'') => result.push('\''),
            Some('"') => result.push('"'),
            Some('`') => result.push('`'),
            Some('\\') => result.push('\\'),
            Some('/') => result.push('/'),
            Some('f') => result.push('\u{000C}'),
            Some('n') => result.push('\n'),
            Some('r') => result.push('\r'),
            Some('t') => result.push('\t'),
            Some('u') => {
                let hex: String = chars.by_ref().take(4).collect();
                let decoded = u32::from_str_radix(&hex, 16)
                    .ok()
                    .filter(|_| hex.len() == 4)
                    .and_then(char::from_u32);
                match decoded {
                    Some(c) => result.push(c),
                    None => {
                        return Err(ParseError::InvalidEscape {
                            sequence: format!("\\u{hex}"),
                            position,
                        });
                    }
                }
            }
            Some(other) => {
                return Err(ParseError::InvalidEscape {
                    sequence: format!("\\{other}"),
                    position,
                });
            }
            None => {
                return Err(ParseError::InvalidEscape {
                    sequence: "\\".to_string(),
                    position,
                });
            }
        }
    }
    Ok(result)
}

/// Parse an expression with the Pratt parser
pub fn parse_expression_pratt(input: &str) -> ParseResult<ExpressionNode> {
    PrattParser::new(input).parse()
}
