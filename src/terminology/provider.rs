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

//! TerminologyProvider trait

use super::{CodedValue, ValueSetRef};
use crate::error::Result;
use async_trait::async_trait;
use serde_json::Value;

/// Backend for the asynchronous FHIRPath functions
///
/// Every operation receives the terminology server base URL so that items can override the
/// questionnaire default. Failures are reported as [`EngineError::Terminology`] carrying an
/// `OperationOutcome`.
///
/// [`EngineError::Terminology`]: crate::error::EngineError::Terminology
#[async_trait]
pub trait TerminologyProvider: Send + Sync {
    /// Expand a value set
    ///
    /// # Arguments
    /// * `server_url` - Base URL of the terminology server
    /// * `value_set` - Canonical URL or inline `ValueSet`
    /// * `params` - Extra `$expand` query parameters (`filter=abc&count=10`)
    ///
    /// # Returns
    /// * `Result<Value>` - The expanded `ValueSet` resource
    async fn expand(
        &self,
        server_url: &str,
        value_set: &ValueSetRef,
        params: Option<&str>,
    ) -> Result<Value>;

    /// Check whether a code is a member of a value set
    ///
    /// # Returns
    /// * `Result<Option<bool>>` - `None` when the server answered without a `result`
    async fn validate_code(
        &self,
        server_url: &str,
        value_set_url: &str,
        value: &CodedValue,
    ) -> Result<Option<bool>>;

    /// Fetch the resource a reference points to
    ///
    /// Relative references (`Patient/123`) are resolved against `server_url`.
    async fn resolve(&self, server_url: &str, reference: &str) -> Result<Value>;
}

/// Absolute URL of a reference
pub fn reference_url(server_url: &str, reference: &str) -> String {
    if reference.starts_with("http://") || reference.starts_with("https://") {
        reference.to_string()
    } else {
        format!(
            "{}/{}",
            server_url.trim_end_matches('/'),
            reference.trim_start_matches('/')
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn relative_references_join_server() {
        assert_eq!(
            reference_url("https://tx.example.org/fhir/", "/Patient/1"),
            "https://tx.example.org/fhir/Patient/1"
        );
        assert_eq!(
            reference_url("https://tx.example.org/fhir", "https://other.org/Patient/2"),
            "https://other.org/Patient/2"
        );
    }
}
