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

//! Terminology provider backed by a FHIR terminology server over HTTP

use super::provider::{TerminologyProvider, reference_url};
use super::{CodedValue, ValueSetRef};
use crate::diagnostics::OperationOutcome;
use crate::error::{EngineError, Result};
use async_trait::async_trait;
use reqwest::header::{ACCEPT, CONTENT_TYPE};
use serde_json::{Value, json};

const FHIR_JSON: &str = "application/fhir+json; charset=utf-8";

/// Terminology provider speaking the FHIR REST API
///
/// `$expand` uses `GET ?url=` for canonical URLs and `POST` with a `Parameters` body for
/// inline value sets. `$validate-code` uses `GET` for codes and codings and `POST` for
/// codeable concepts.
#[derive(Debug, Clone, Default)]
pub struct HttpTerminologyProvider {
    client: reqwest::Client,
}

impl HttpTerminologyProvider {
    /// Create a provider with a default HTTP client
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a provider sharing an existing client
    pub fn with_client(client: reqwest::Client) -> Self {
        Self { client }
    }

    async fn get(&self, url: &str, query: &[(String, String)], failure: &str) -> Result<Value> {
        log::debug!("GET {url} {query:?}");
        let request = self.client.get(url).header(ACCEPT, FHIR_JSON).query(query);
        read_response(request.send().await, failure).await
    }

    async fn post(&self, url: &str, body: &Value, failure: &str) -> Result<Value> {
        log::debug!("POST {url}");
        let request = self
            .client
            .post(url)
            .header(ACCEPT, FHIR_JSON)
            .header(CONTENT_TYPE, FHIR_JSON)
            .json(body);
        read_response(request.send().await, failure).await
    }
}

fn terminology_error(message: String, detail: impl ToString) -> EngineError {
    EngineError::Terminology(OperationOutcome::exception(message, Some(detail.to_string())))
}

async fn read_response(
    response: reqwest::Result<reqwest::Response>,
    failure: &str,
) -> Result<Value> {
    let response = response.map_err(|e| terminology_error(failure.to_string(), e))?;
    let status = response.status();
    let body: Value = response
        .json()
        .await
        .map_err(|e| terminology_error(failure.to_string(), format!("Failed to parse response: {e}")))?;

    if let Some(outcome) = OperationOutcome::from_resource(&body) {
        if outcome.is_error() || !status.is_success() {
            return Err(EngineError::Terminology(outcome));
        }
    }
    if !status.is_success() {
        return Err(terminology_error(
            failure.to_string(),
            format!("Terminology server error: {status}"),
        ));
    }
    Ok(body)
}

fn query_pairs(params: Option<&str>) -> Vec<(String, String)> {
    params
        .unwrap_or_default()
        .split('&')
        .filter(|pair| !pair.is_empty())
        .map(|pair| match pair.split_once('=') {
            Some((name, value)) => (name.to_string(), value.to_string()),
            None => (pair.to_string(), String::new()),
        })
        .collect()
}

fn membership_result(parameters: &Value) -> Option<bool> {
    parameters
        .get("parameter")?
        .as_array()?
        .iter()
        .find(|p| p.get("name").and_then(Value::as_str) == Some("result"))?
        .get("valueBoolean")?
        .as_bool()
}

#[async_trait]
impl TerminologyProvider for HttpTerminologyProvider {
    async fn expand(
        &self,
        server_url: &str,
        value_set: &ValueSetRef,
        params: Option<&str>,
    ) -> Result<Value> {
        let url = format!("{}/ValueSet/$expand", server_url.trim_end_matches('/'));
        let failure = format!("Failed to expand value set: {}", value_set.key());
        let result = match value_set {
            ValueSetRef::Url(canonical) => {
                let mut query = vec![("url".to_string(), canonical.clone())];
                query.extend(query_pairs(params));
                self.get(&url, &query, &failure).await?
            }
            ValueSetRef::Resource(resource) => {
                let mut parameter = vec![json!({"name": "valueSet", "resource": resource.as_ref()})];
                for (name, value) in query_pairs(params) {
                    parameter.push(json!({"name": name, "valueString": value}));
                }
                let body = json!({"resourceType": "Parameters", "parameter": parameter});
                self.post(&url, &body, &failure).await?
            }
        };

        if result.get("resourceType").and_then(Value::as_str) != Some("ValueSet") {
            return Err(terminology_error(failure, "Response is not a ValueSet"));
        }
        Ok(result)
    }

    async fn validate_code(
        &self,
        server_url: &str,
        value_set_url: &str,
        value: &CodedValue,
    ) -> Result<Option<bool>> {
        let url = format!("{}/ValueSet/$validate-code", server_url.trim_end_matches('/'));
        let failure = format!("Failed to check membership: {value} - {value_set_url}");
        let url_param = ("url".to_string(), value_set_url.to_string());
        let result = match value {
            CodedValue::Code(code) => {
                let query = [url_param, ("code".to_string(), code.clone())];
                self.get(&url, &query, &failure).await?
            }
            CodedValue::Coding { system, code } => {
                let query = [
                    url_param,
                    ("system".to_string(), system.clone().unwrap_or_default()),
                    ("code".to_string(), code.clone()),
                ];
                self.get(&url, &query, &failure).await?
            }
            CodedValue::CodeableConcept(concept) => {
                let body = json!({
                    "resourceType": "Parameters",
                    "parameter": [
                        {"name": "url", "valueUri": value_set_url},
                        {"name": "codeableConcept", "valueCodeableConcept": concept.as_ref()}
                    ]
                });
                self.post(&url, &body, &failure).await?
            }
        };
        Ok(membership_result(&result))
    }

    async fn resolve(&self, server_url: &str, reference: &str) -> Result<Value> {
        let url = reference_url(server_url, reference);
        let failure = format!("Failed to resolve reference: {reference}");
        self.get(&url, &[], &failure).await
    }
}
