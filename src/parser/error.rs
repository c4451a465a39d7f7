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

//! Parser error types

use std::borrow::Cow;
use thiserror::Error;

/// Result type for parse operations
pub type ParseResult<T> = Result<T, ParseError>;

/// Errors that can occur while tokenizing or parsing an expression
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ParseError {
    /// A token appeared where the grammar does not allow it
    #[error("Unexpected token at position {position}: {token}")]
    UnexpectedToken {
        /// Description of the token and what was expected
        token: Cow<'static, str>,
        /// Byte offset
        position: usize,
    },

    /// String or delimited identifier without a closing quote
    #[error("Unclosed string literal starting at position {position}")]
    UnclosedString {
        /// Byte offset of the opening quote
        position: usize,
    },

    /// Malformed numeric or temporal literal
    #[error("Invalid literal at position {position}: {message}")]
    InvalidLiteral {
        /// Error message
        message: String,
        /// Byte offset
        position: usize,
    },

    /// Unknown escape sequence inside a string
    #[error("Invalid escape sequence '{sequence}'")]
    InvalidEscape {
        /// Offending sequence
        sequence: String,
        /// Byte offset
        position: usize,
    },

    /// Input ended in the middle of an expression
    #[error("Unexpected end of expression at position {position}")]
    UnexpectedEof {
        /// Byte offset
        position: usize,
    },
}

impl ParseError {
    /// Byte offset the error refers to
    pub fn position(&self) -> usize {
        match self {
            ParseError::UnexpectedToken { position, .. }
            | ParseError::UnclosedString { position }
            | ParseError::InvalidLiteral { position, .. }
            | ParseError::InvalidEscape { position, .. }
            | ParseError::UnexpectedEof { position } => *position,
        }
    }
}
