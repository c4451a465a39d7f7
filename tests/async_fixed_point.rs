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

//! Asynchronous FHIRPath evaluation against a mock terminology server

mod common;

use common::MockTerminologyProvider;
use octofhir_sdc_forms::{
    AsyncFhirPathEvaluator, Collection, EngineConfig, EngineError, EvaluationContext, FhirPathValue,
};
use pretty_assertions::assert_eq;
use serde_json::{Value, json};
use std::sync::Arc;
use std::time::Duration;

const VS: &str = "http://example.org/fhir/ValueSet/smoking";

fn provider() -> MockTerminologyProvider {
    MockTerminologyProvider::new().with_value_set(
        VS,
        vec![
            json!({"system": "http://snomed.info/sct", "code": "77176002", "display": "Smoker"}),
            json!({"system": "http://snomed.info/sct", "code": "8392000", "display": "Non-smoker"}),
        ],
    )
}

fn evaluator(provider: Arc<MockTerminologyProvider>, config: &EngineConfig) -> AsyncFhirPathEvaluator {
    AsyncFhirPathEvaluator::new(provider, config)
}

fn response() -> Value {
    json!({
        "resourceType": "QuestionnaireResponse",
        "item": [{
            "linkId": "smoking",
            "answer": [{"valueCoding": {"system": "http://snomed.info/sct", "code": "77176002"}}]
        }]
    })
}

#[tokio::test]
async fn identical_calls_share_one_request() {
    let provider = Arc::new(provider());
    let evaluator = evaluator(provider.clone(), &EngineConfig::default());
    let expression = format!(
        "%resource.item.answer.value.memberOf('{VS}') and %resource.item.answer.value.memberOf('{VS}')"
    );

    let result = evaluator
        .evaluate(&expression, &response(), &EvaluationContext::new())
        .await
        .unwrap();

    assert_eq!(result, Collection::boolean(true));
    assert_eq!(provider.calls(), (0, 1, 0));
}

#[tokio::test]
async fn expand_results_feed_the_next_pass() {
    let provider = Arc::new(provider());
    let evaluator = evaluator(provider.clone(), &EngineConfig::default());
    let expression = format!("%terminologies.expand('{VS}').expansion.contains.code");

    let result = evaluator
        .evaluate(&expression, &response(), &EvaluationContext::new())
        .await
        .unwrap();

    assert_eq!(
        result,
        Collection::from_vec(vec![
            FhirPathValue::String("77176002".into()),
            FhirPathValue::String("8392000".into()),
        ])
    );
    assert_eq!(provider.calls(), (1, 0, 0));
}

#[tokio::test]
async fn chained_resolves_converge_within_the_bound() {
    let provider = Arc::new(provider());
    let evaluator = evaluator(provider.clone(), &EngineConfig::default());

    let result = evaluator
        .evaluate(
            "'1'.resolve().reference.resolve().reference",
            &json!({}),
            &EvaluationContext::new(),
        )
        .await
        .unwrap();

    assert_eq!(result, Collection::single(FhirPathValue::String("3".into())));
    assert_eq!(provider.calls(), (0, 0, 2));
}

#[tokio::test]
async fn endless_chains_do_not_converge() {
    let provider = Arc::new(provider());
    let evaluator = evaluator(provider.clone(), &EngineConfig::default());
    let expression = format!("'1'{}", ".resolve().reference".repeat(12));

    let error = evaluator
        .evaluate(&expression, &json!({}), &EvaluationContext::new())
        .await
        .unwrap_err();

    assert!(matches!(error, EngineError::DidNotConverge { iterations: 10, .. }));
    assert_eq!(provider.calls(), (0, 0, 9));
}

#[tokio::test]
async fn failed_requests_abort_with_an_outcome() {
    let provider = Arc::new(provider());
    let evaluator = evaluator(provider.clone(), &EngineConfig::default());

    let error = evaluator
        .evaluate(
            "%terminologies.expand('http://example.org/unknown').expansion.contains.code",
            &response(),
            &EvaluationContext::new(),
        )
        .await
        .unwrap_err();

    let outcome = error.outcome().expect("terminology errors carry an outcome");
    assert_eq!(outcome.issue.len(), 1);
}

#[tokio::test(start_paused = true)]
async fn slow_requests_time_out() {
    let provider = Arc::new(provider().with_delay(Duration::from_millis(200)));
    let config = EngineConfig::default().with_terminology_timeout_ms(50);
    let evaluator = evaluator(provider, &config);

    let error = evaluator
        .evaluate(
            &format!("%terminologies.expand('{VS}')"),
            &response(),
            &EvaluationContext::new(),
        )
        .await
        .unwrap_err();

    let outcome = error.outcome().expect("timeouts carry an outcome");
    assert_eq!(outcome.issue[0].code, "timeout");
}

#[tokio::test(start_paused = true)]
async fn pending_requests_run_concurrently() {
    let provider = Arc::new(provider().with_delay(Duration::from_millis(100)));
    let evaluator = evaluator(provider.clone(), &EngineConfig::default());
    let expression = format!(
        "%terminologies.expand('{VS}').exists() and '7'.resolve().exists() and %resource.item.answer.value.memberOf('{VS}')"
    );

    let started = tokio::time::Instant::now();
    let result = evaluator
        .evaluate(&expression, &response(), &EvaluationContext::new())
        .await
        .unwrap();

    assert_eq!(result, Collection::boolean(true));
    assert_eq!(provider.calls(), (1, 1, 1));
    assert!(started.elapsed() < Duration::from_millis(150));
}

#[tokio::test]
async fn expressions_without_async_functions_take_one_pass() {
    let provider = Arc::new(provider());
    let evaluator = evaluator(provider.clone(), &EngineConfig::default());

    let result = evaluator
        .evaluate("%resource.item.count()", &response(), &EvaluationContext::new())
        .await
        .unwrap();

    assert_eq!(result, Collection::single(FhirPathValue::Integer(1)));
    assert_eq!(provider.calls(), (0, 0, 0));
}
