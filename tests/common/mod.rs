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

//! Shared fixtures for the integration tests

#![allow(dead_code)]

use async_trait::async_trait;
use octofhir_sdc_forms::diagnostics::OperationOutcome;
use octofhir_sdc_forms::terminology::{CodedValue, TerminologyProvider, ValueSetRef};
use octofhir_sdc_forms::{EngineConfig, EngineError, FormEngine, Questionnaire, Result};
use serde_json::{Value, json};
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

/// In-memory terminology server counting the requests it receives
///
/// * `expand` returns the registered expansion, or an error for unknown value sets
/// * `validate_code` answers true for codes listed in the registered expansion
/// * `resolve` of `"n"` (a number) returns `{"reference": "n+1"}`, so chains never end
#[derive(Debug, Default)]
pub struct MockTerminologyProvider {
    pub value_sets: HashMap<String, Vec<Value>>,
    pub resources: HashMap<String, Value>,
    pub delay: Option<Duration>,
    pub expand_calls: AtomicUsize,
    pub validate_calls: AtomicUsize,
    pub resolve_calls: AtomicUsize,
}

impl MockTerminologyProvider {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_value_set(mut self, url: &str, codings: Vec<Value>) -> Self {
        self.value_sets.insert(url.to_string(), codings);
        self
    }

    pub fn with_resource(mut self, reference: &str, resource: Value) -> Self {
        self.resources.insert(reference.to_string(), resource);
        self
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn calls(&self) -> (usize, usize, usize) {
        (
            self.expand_calls.load(Ordering::SeqCst),
            self.validate_calls.load(Ordering::SeqCst),
            self.resolve_calls.load(Ordering::SeqCst),
        )
    }

    async fn pause(&self) {
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
    }
}

fn not_found(message: String) -> EngineError {
    EngineError::Terminology(OperationOutcome::exception(message, None))
}

#[async_trait]
impl TerminologyProvider for MockTerminologyProvider {
    async fn expand(&self, _server_url: &str, value_set: &ValueSetRef, _params: Option<&str>) -> Result<Value> {
        self.expand_calls.fetch_add(1, Ordering::SeqCst);
        self.pause().await;
        let codings = self
            .value_sets
            .get(&value_set.key())
            .ok_or_else(|| not_found(format!("Unknown value set {}", value_set.key())))?;
        Ok(json!({
            "resourceType": "ValueSet",
            "expansion": {"contains": codings}
        }))
    }

    async fn validate_code(&self, _server_url: &str, value_set_url: &str, value: &CodedValue) -> Result<Option<bool>> {
        self.validate_calls.fetch_add(1, Ordering::SeqCst);
        self.pause().await;
        let Some(codings) = self.value_sets.get(value_set_url) else {
            return Ok(None);
        };
        let code = match value {
            CodedValue::Code(code) | CodedValue::Coding { code, .. } => code.clone(),
            CodedValue::CodeableConcept(_) => return Ok(Some(false)),
        };
        Ok(Some(
            codings.iter().any(|c| c.get("code").and_then(Value::as_str) == Some(code.as_str())),
        ))
    }

    async fn resolve(&self, _server_url: &str, reference: &str) -> Result<Value> {
        self.resolve_calls.fetch_add(1, Ordering::SeqCst);
        self.pause().await;
        if let Some(resource) = self.resources.get(reference) {
            return Ok(resource.clone());
        }
        match reference.parse::<u64>() {
            Ok(n) => Ok(json!({"reference": (n + 1).to_string()})),
            Err(_) => Err(not_found(format!("Cannot resolve {reference}"))),
        }
    }
}

pub fn questionnaire(value: Value) -> Questionnaire {
    serde_json::from_value(value).expect("valid questionnaire")
}

pub fn engine_with(provider: Arc<MockTerminologyProvider>) -> FormEngine {
    let _ = env_logger::builder().is_test(true).try_init();
    FormEngine::new(EngineConfig::default(), provider)
}

pub fn calculated(expression: &str) -> Value {
    json!({
        "url": "http://hl7.org/fhir/uv/sdc/StructureDefinition/sdc-questionnaire-calculatedExpression",
        "valueExpression": {"language": "text/fhirpath", "expression": expression}
    })
}

pub fn enable_when_expression(expression: &str) -> Value {
    json!({
        "url": "http://hl7.org/fhir/uv/sdc/StructureDefinition/sdc-questionnaire-enableWhenExpression",
        "valueExpression": {"language": "text/fhirpath", "expression": expression}
    })
}

pub fn answer_expression(expression: &str) -> Value {
    json!({
        "url": "http://hl7.org/fhir/uv/sdc/StructureDefinition/sdc-questionnaire-answerExpression",
        "valueExpression": {"language": "text/fhirpath", "expression": expression}
    })
}

pub fn variable(name: &str, expression: &str) -> Value {
    json!({
        "url": "http://hl7.org/fhir/StructureDefinition/variable",
        "valueExpression": {"name": name, "language": "text/fhirpath", "expression": expression}
    })
}

/// `answerOptionsToggleExpression` switching the given codings together
pub fn answer_options_toggle(codings: Vec<Value>, expression: &str) -> Value {
    let mut parts: Vec<Value> = codings
        .into_iter()
        .map(|coding| json!({"url": "option", "valueCoding": coding}))
        .collect();
    parts.push(json!({
        "url": "expression",
        "valueExpression": {"language": "text/fhirpath", "expression": expression}
    }));
    json!({
        "url": "http://hl7.org/fhir/uv/sdc/StructureDefinition/sdc-questionnaire-answerOptionsToggleExpression",
        "extension": parts
    })
}
