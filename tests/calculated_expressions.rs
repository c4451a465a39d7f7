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

//! Calculated and answer expressions driven through the form engine

mod common;

use common::{
    MockTerminologyProvider, answer_expression, answer_options_toggle, calculated, engine_with, questionnaire, variable,
};
use octofhir_sdc_forms::questionnaire::{Expression, Variables};
use octofhir_sdc_forms::{
    AnswerValue, CommitOutcome, EngineError, FhirPathValue, FormEngine, QuestionnaireResponse,
    QuestionnaireResponseItem,
};
use pretty_assertions::assert_eq;
use serde_json::{Value, json};
use std::collections::BTreeSet;
use std::sync::Arc;

const SIZES: &str = "http://example.org/fhir/ValueSet/sizes";

fn item(link_id: &str, item_type: &str, extensions: Vec<Value>) -> Value {
    json!({"linkId": link_id, "type": item_type, "extension": extensions})
}

fn response_with_a(value: i64) -> QuestionnaireResponse {
    QuestionnaireResponse::new(vec![QuestionnaireResponseItem::with_answers(
        "a",
        [AnswerValue::Integer(value)],
    )])
}

async fn engine(items: Vec<Value>, root_extensions: Vec<Value>) -> FormEngine {
    let provider = MockTerminologyProvider::new().with_value_set(
        SIZES,
        vec![
            json!({"system": "http://example.org/sizes", "code": "S"}),
            json!({"system": "http://example.org/sizes", "code": "L"}),
        ],
    );
    let mut engine = engine_with(Arc::new(provider));
    engine
        .set_items(
            questionnaire(json!({
                "resourceType": "Questionnaire",
                "extension": root_extensions,
                "item": items
            })),
            None,
        )
        .await
        .unwrap();
    engine
}

#[tokio::test]
async fn a_failing_expression_does_not_block_the_others() {
    let mut engine = engine(
        vec![
            item("a", "integer", vec![]),
            item("broken", "integer", vec![calculated("%missing + 1")]),
            item("double", "integer", vec![calculated("%resource.item.where(linkId='a').answer.value * 2")]),
        ],
        vec![],
    )
    .await;

    let outcome = engine.update_expressions(response_with_a(3), None).await;

    assert!(outcome.is_applied());
    assert_eq!(engine.calculated_values().get("double"), Some(&FhirPathValue::Integer(6)));
    assert!(engine.calculated_values().get("broken").is_none());
    assert_eq!(engine.last_errors().len(), 1);
    assert_eq!(engine.last_errors()[0].0, "broken");
    assert!(matches!(engine.last_errors()[0].1, EngineError::Evaluation { .. }));
}

#[tokio::test]
async fn writing_back_calculated_values_reaches_a_fixed_point() {
    let mut engine = engine(
        vec![
            item("a", "integer", vec![]),
            item("double", "integer", vec![calculated("%resource.item.where(linkId='a').answer.value * 2")]),
        ],
        vec![],
    )
    .await;

    let outcome = engine.update_expressions(response_with_a(3), None).await;
    assert_eq!(
        outcome,
        CommitOutcome::Applied {
            changed: BTreeSet::from(["double".to_string()])
        }
    );

    let written = engine.apply_calculated_values();
    assert_eq!(written, BTreeSet::from(["double".to_string()]));
    let answers: Vec<&AnswerValue> = engine.response().find("double").unwrap().values().collect();
    assert_eq!(answers, vec![&AnswerValue::Integer(6)]);

    assert_eq!(engine.refresh_expressions().await, CommitOutcome::Unchanged);
    assert!(engine.apply_calculated_values().is_empty());
}

#[tokio::test]
async fn empty_results_keep_the_previous_value() {
    let mut engine = engine(
        vec![
            item("a", "integer", vec![]),
            item("double", "integer", vec![calculated("%resource.item.where(linkId='a').answer.value * 2")]),
        ],
        vec![],
    )
    .await;

    engine.update_expressions(response_with_a(4), None).await;
    let outcome = engine.update_expressions(QuestionnaireResponse::default(), None).await;

    assert_eq!(outcome, CommitOutcome::Unchanged);
    assert_eq!(engine.calculated_values().get("double"), Some(&FhirPathValue::Integer(8)));
}

#[tokio::test]
async fn variables_feed_calculations_and_can_be_overridden() {
    let mut engine = engine(
        vec![
            item("a", "integer", vec![]),
            item("scaled", "integer", vec![calculated("%a * %factor")]),
        ],
        vec![
            variable("a", "%resource.item.where(linkId='a').answer.value"),
            variable("factor", "2"),
        ],
    )
    .await;

    engine.update_expressions(response_with_a(5), None).await;
    assert_eq!(engine.calculated_values().get("scaled"), Some(&FhirPathValue::Integer(10)));

    let overrides = Variables {
        questionnaire_level: vec![
            Expression {
                name: Some("a".to_string()),
                language: Some("text/fhirpath".to_string()),
                expression: Some("%resource.item.where(linkId='a').answer.value".to_string()),
                description: None,
            },
            Expression {
                name: Some("factor".to_string()),
                language: Some("text/fhirpath".to_string()),
                expression: Some("10".to_string()),
                description: None,
            },
        ],
        ..Variables::default()
    };
    engine.update_expressions(response_with_a(5), Some(overrides)).await;
    assert_eq!(engine.calculated_values().get("scaled"), Some(&FhirPathValue::Integer(50)));
}

#[tokio::test]
async fn answer_expressions_supply_options() {
    let mut engine = engine(
        vec![item(
            "size",
            "choice",
            vec![answer_expression(&format!("%terminologies.expand('{SIZES}').expansion.contains"))],
        )],
        vec![],
    )
    .await;

    let codes: Vec<String> = engine
        .answer_options("size")
        .into_iter()
        .filter_map(|option| match option {
            AnswerValue::Coding(coding) => coding.code,
            _ => None,
        })
        .collect();
    assert_eq!(codes, vec!["S".to_string(), "L".to_string()]);

    // Options are cached until the expression result changes
    assert_eq!(engine.refresh_expressions().await, CommitOutcome::Unchanged);
}

fn symptom(code: &str) -> Value {
    json!({"system": "http://example.org/symptoms", "code": code})
}

fn codes(options: Vec<AnswerValue>) -> Vec<String> {
    options
        .into_iter()
        .filter_map(|option| match option {
            AnswerValue::Coding(coding) => coding.code,
            _ => None,
        })
        .collect()
}

fn response_with_unwell(unwell: bool) -> QuestionnaireResponse {
    QuestionnaireResponse::new(vec![QuestionnaireResponseItem::with_answers(
        "unwell",
        [AnswerValue::Boolean(unwell)],
    )])
}

#[tokio::test]
async fn toggle_expressions_switch_answer_options() {
    let mut symptoms = item(
        "symptoms",
        "choice",
        vec![
            answer_options_toggle(
                vec![symptom("fever"), symptom("cough")],
                "%resource.item.where(linkId='unwell').answer.value = true",
            ),
            answer_options_toggle(vec![symptom("rash")], "%missing.exists()"),
        ],
    );
    symptoms["answerOption"] = json!([
        {"valueCoding": symptom("fever")},
        {"valueCoding": symptom("cough")},
        {"valueCoding": symptom("none")},
        {"valueCoding": symptom("rash")}
    ]);
    let mut engine = engine(vec![item("unwell", "boolean", vec![]), symptoms], vec![]).await;

    // Empty results and failing expressions leave toggled options off
    assert_eq!(codes(engine.answer_options("symptoms")), vec!["none".to_string()]);
    assert!(engine.last_errors().iter().all(|(link_id, _)| link_id == "symptoms"));
    assert!(!engine.last_errors().is_empty());

    let outcome = engine.update_expressions(response_with_unwell(true), None).await;
    assert_eq!(
        outcome,
        CommitOutcome::Applied {
            changed: BTreeSet::from(["symptoms".to_string()])
        }
    );
    assert_eq!(
        codes(engine.answer_options("symptoms")),
        vec!["fever".to_string(), "cough".to_string(), "none".to_string()]
    );

    // Only flips are staged
    assert_eq!(engine.refresh_expressions().await, CommitOutcome::Unchanged);

    engine.update_expressions(response_with_unwell(false), None).await;
    assert_eq!(codes(engine.answer_options("symptoms")), vec!["none".to_string()]);
}
