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

//! Structured diagnostics reported as FHIR `OperationOutcome` resources
//!
//! Terminology failures and aborted asynchronous evaluations surface to callers as an
//! [`OperationOutcome`] so that form renderers can show them the same way a FHIR server
//! would report them.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;

/// Severity of a single outcome issue
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IssueSeverity {
    /// The issue caused the action to fail and no further checking could be performed
    Fatal,
    /// The issue is sufficiently important to cause the action to fail
    Error,
    /// The issue is not important enough to cause the action to fail
    Warning,
    /// The issue has no relation to the degree of success of the action
    Information,
}

impl fmt::Display for IssueSeverity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            IssueSeverity::Fatal => "fatal",
            IssueSeverity::Error => "error",
            IssueSeverity::Warning => "warning",
            IssueSeverity::Information => "information",
        };
        f.write_str(text)
    }
}

/// Human readable details attached to an issue
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IssueDetails {
    pub text: String,
}

/// A single issue inside an [`OperationOutcome`]
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutcomeIssue {
    pub severity: IssueSeverity,
    /// Issue type code, e.g. `exception` or `not-found`
    pub code: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub details: Option<IssueDetails>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub diagnostics: Option<String>,
}

/// FHIR `OperationOutcome` resource
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OperationOutcome {
    pub resource_type: String,
    #[serde(default)]
    pub issue: Vec<OutcomeIssue>,
}

impl OperationOutcome {
    /// Create an outcome carrying one issue
    pub fn new(
        severity: IssueSeverity,
        code: impl Into<String>,
        message: impl Into<String>,
        diagnostics: Option<String>,
    ) -> Self {
        Self {
            resource_type: "OperationOutcome".to_string(),
            issue: vec![OutcomeIssue {
                severity,
                code: code.into(),
                details: Some(IssueDetails {
                    text: message.into(),
                }),
                diagnostics,
            }],
        }
    }

    /// Shorthand for an `error`/`exception` outcome
    pub fn exception(message: impl Into<String>, diagnostics: Option<String>) -> Self {
        Self::new(IssueSeverity::Error, "exception", message, diagnostics)
    }

    /// Interpret a JSON payload as an outcome when its `resourceType` says so
    pub fn from_resource(resource: &Value) -> Option<Self> {
        if resource.get("resourceType").and_then(Value::as_str) != Some("OperationOutcome") {
            return None;
        }
        serde_json::from_value(resource.clone()).ok()
    }

    /// Text of the first issue, falling back to its diagnostics
    pub fn message(&self) -> &str {
        self.issue
            .first()
            .and_then(|issue| {
                issue
                    .details
                    .as_ref()
                    .map(|d| d.text.as_str())
                    .or(issue.diagnostics.as_deref())
            })
            .unwrap_or("")
    }

    /// True when any issue is `error` or `fatal`
    pub fn is_error(&self) -> bool {
        self.issue
            .iter()
            .any(|i| matches!(i.severity, IssueSeverity::Error | IssueSeverity::Fatal))
    }
}

impl fmt::Display for OperationOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, issue) in self.issue.iter().enumerate() {
            if i > 0 {
                f.write_str("; ")?;
            }
            write!(f, "{} ({})", issue.severity, issue.code)?;
            if let Some(details) = &issue.details {
                write!(f, ": {}", details.text)?;
            }
            if let Some(diagnostics) = &issue.diagnostics {
                write!(f, " [{diagnostics}]")?;
            }
        }
        Ok(())
    }
}
