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

//! Error types for the form evaluation engine

use crate::diagnostics::OperationOutcome;
use crate::parser::ParseError;
use thiserror::Error;

/// Result type used throughout the crate
pub type Result<T> = std::result::Result<T, EngineError>;

/// Errors produced while parsing, evaluating or synchronizing a questionnaire
#[derive(Error, Debug, Clone, PartialEq)]
pub enum EngineError {
    /// Expression text could not be parsed
    #[error("Parse error at position {position}: {message}")]
    Parse {
        /// Byte offset of the failure
        position: usize,
        /// Error message
        message: String,
    },

    /// Runtime failure of a FHIRPath expression
    #[error("Evaluation error: {message}")]
    Evaluation {
        /// Error message
        message: String,
        /// Expression that failed, when known
        expression: Option<String>,
    },

    /// A terminology or resolve request failed; the whole evaluation is aborted
    #[error("Terminology error: {0}")]
    Terminology(OperationOutcome),

    /// The asynchronous fixed point kept registering new jobs
    #[error("Expression did not converge after {iterations} passes: {expression}")]
    DidNotConverge {
        /// Number of passes performed
        iterations: usize,
        /// Expression being evaluated
        expression: String,
    },

    /// A linkId is not part of the loaded questionnaire
    #[error("Unknown linkId: {link_id}")]
    UnknownLinkId {
        /// Offending linkId
        link_id: String,
    },

    /// An edit has no place in the response tree
    #[error("Cannot edit '{link_id}': {message}")]
    InvalidEdit {
        /// Item the edit was addressed to
        link_id: String,
        /// Error message
        message: String,
    },

    /// An evaluation started before a newer edit tried to commit
    #[error("Evaluation for edit {ticket} superseded by edit {current}")]
    Superseded {
        /// Sequence number the evaluation was started at
        ticket: u64,
        /// Current edit sequence number
        current: u64,
    },

    /// A questionnaire or response payload did not deserialize
    #[error("Invalid resource: {message}")]
    InvalidResource {
        /// Error message
        message: String,
    },
}

impl EngineError {
    /// Create an evaluation error without expression context
    pub fn evaluation(message: impl Into<String>) -> Self {
        EngineError::Evaluation {
            message: message.into(),
            expression: None,
        }
    }

    /// Attach the expression text to an evaluation error
    pub fn with_expression(self, text: &str) -> Self {
        match self {
            EngineError::Evaluation {
                message,
                expression: None,
            } => EngineError::Evaluation {
                message,
                expression: Some(text.to_string()),
            },
            other => other,
        }
    }

    /// Create an unknown linkId error
    pub fn unknown_link_id(link_id: impl Into<String>) -> Self {
        EngineError::UnknownLinkId {
            link_id: link_id.into(),
        }
    }

    /// Structured outcome for errors that abort an evaluation
    pub fn outcome(&self) -> Option<&OperationOutcome> {
        match self {
            EngineError::Terminology(outcome) => Some(outcome),
            _ => None,
        }
    }
}

impl From<ParseError> for EngineError {
    fn from(error: ParseError) -> Self {
        EngineError::Parse {
            position: error.position(),
            message: error.to_string(),
        }
    }
}

impl From<serde_json::Error> for EngineError {
    fn from(error: serde_json::Error) -> Self {
        EngineError::InvalidResource {
            message: error.to_string(),
        }
    }
}
