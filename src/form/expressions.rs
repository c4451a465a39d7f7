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

//! Calculated, answer, answer option toggle and enableWhen expressions
//!
//! A round of evaluation runs against an [`ExpressionSnapshot`] and produces an
//! [`ExpressionUpdate`] holding only the values that changed. Nothing is applied until the
//! whole round has finished, so observers never see a half-updated state. A failing
//! expression is logged, recorded in the update and otherwise leaves its item untouched.

use crate::async_eval::AsyncFhirPathEvaluator;
use crate::error::EngineError;
use crate::evaluator::EvaluationContext;
use crate::model::FhirPathValue;
use crate::questionnaire::{
    AnswerOptionsToggle, AnswerValue, Coding, ItemType, Quantity, QuestionnaireItem, QuestionnaireModel,
};
use crate::terminology::expansion_codings;
use chrono::{NaiveDate, NaiveTime};
use indexmap::IndexMap;
use rust_decimal::RoundingStrategy;
use rust_decimal::prelude::ToPrimitive;
use serde_json::Value;
use std::collections::HashMap;

/// `calculatedExpression` of one item and its last committed result
#[derive(Debug, Clone, PartialEq)]
pub struct CalculatedExpression {
    pub expression: String,
    pub value: Option<FhirPathValue>,
    /// Value changed since it was last written into the response
    pub dirty: bool,
}

impl CalculatedExpression {
    pub fn new(expression: impl Into<String>) -> Self {
        Self {
            expression: expression.into(),
            value: None,
            dirty: false,
        }
    }
}

/// `answerExpression` of one item and the options it produced
#[derive(Debug, Clone, PartialEq)]
pub struct AnswerExpression {
    pub expression: String,
    pub options: Vec<AnswerValue>,
}

impl AnswerExpression {
    pub fn new(expression: impl Into<String>) -> Self {
        Self {
            expression: expression.into(),
            options: Vec::new(),
        }
    }
}

/// `answerOptionsToggleExpression` of one item and whether its options are offered
#[derive(Debug, Clone, PartialEq)]
pub struct AnswerOptionsToggleExpression {
    pub options: Vec<AnswerValue>,
    pub expression: String,
    /// Options stay disabled until the expression yields `true`
    pub enabled: bool,
}

impl From<&AnswerOptionsToggle> for AnswerOptionsToggleExpression {
    fn from(toggle: &AnswerOptionsToggle) -> Self {
        Self {
            options: toggle.options.clone(),
            expression: toggle.expression.clone(),
            enabled: false,
        }
    }
}

/// Expanded answer value sets keyed by canonical URL or contained reference
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ValueSetCache {
    entries: HashMap<String, Vec<Coding>>,
}

impl ValueSetCache {
    pub fn get(&self, key: &str) -> Option<&[Coding]> {
        self.entries.get(key).map(Vec::as_slice)
    }

    pub fn contains(&self, key: &str) -> bool {
        self.entries.contains_key(key)
    }

    pub fn insert(&mut self, key: impl Into<String>, codings: Vec<Coding>) {
        self.entries.insert(key.into(), codings);
    }

    /// Store the codings of an expanded `ValueSet` resource
    pub fn insert_expansion(&mut self, key: impl Into<String>, value_set: &Value) {
        let codings = expansion_codings(value_set)
            .into_iter()
            .filter_map(|coding| serde_json::from_value(coding).ok())
            .collect();
        self.insert(key, codings);
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Staged results of one evaluation round
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ExpressionUpdate {
    /// Edit sequence number the round was started at
    pub sequence: u64,
    pub calculated: IndexMap<String, FhirPathValue>,
    pub enable_when: IndexMap<String, bool>,
    pub answer_options: IndexMap<String, Vec<AnswerValue>>,
    /// linkId -> (index of the toggle on the item, enabled)
    pub answer_option_toggles: IndexMap<String, Vec<(usize, bool)>>,
    /// Expressions that failed, by linkId
    pub errors: Vec<(String, EngineError)>,
}

impl ExpressionUpdate {
    /// No value changed
    pub fn is_empty(&self) -> bool {
        self.calculated.is_empty()
            && self.enable_when.is_empty()
            && self.answer_options.is_empty()
            && self.answer_option_toggles.is_empty()
    }
}

/// Expressions and their current values, copied out for one round
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ExpressionSnapshot {
    pub calculated: IndexMap<String, CalculatedExpression>,
    /// linkId -> (expression, current result)
    pub enable_when: IndexMap<String, (String, bool)>,
    pub answer: IndexMap<String, AnswerExpression>,
    pub answer_option_toggles: IndexMap<String, Vec<AnswerOptionsToggleExpression>>,
}

impl ExpressionSnapshot {
    pub fn is_empty(&self) -> bool {
        self.calculated.is_empty()
            && self.enable_when.is_empty()
            && self.answer.is_empty()
            && self.answer_option_toggles.is_empty()
    }

    /// Evaluate every expression and stage the changed results
    pub async fn evaluate(
        &self,
        evaluator: &AsyncFhirPathEvaluator,
        model: &QuestionnaireModel,
        resource: &Value,
        context: &EvaluationContext,
        sequence: u64,
    ) -> ExpressionUpdate {
        let mut update = ExpressionUpdate {
            sequence,
            ..ExpressionUpdate::default()
        };
        let evaluator_for = |link_id: &str| match model.terminology_server(link_id) {
            Some(server) => evaluator.with_terminology_server(server),
            None => evaluator.clone(),
        };

        for (link_id, (expression, current)) in &self.enable_when {
            let enabled = match evaluator_for(link_id).evaluate(expression, resource, context).await {
                Ok(result) => match result.first() {
                    Some(FhirPathValue::Boolean(b)) => *b,
                    _ => true,
                },
                Err(error) => {
                    report(&mut update, link_id, "enableWhenExpression", error);
                    true
                }
            };
            if enabled != *current {
                update.enable_when.insert(link_id.clone(), enabled);
            }
        }

        for (link_id, calculated) in &self.calculated {
            match evaluator_for(link_id)
                .evaluate(&calculated.expression, resource, context)
                .await
            {
                Ok(result) => {
                    let Some(value) = result.first() else {
                        continue;
                    };
                    if calculated.value.as_ref() != Some(value) {
                        update.calculated.insert(link_id.clone(), value.clone());
                    }
                }
                Err(error) => report(&mut update, link_id, "calculatedExpression", error),
            }
        }

        for (link_id, answer) in &self.answer {
            match evaluator_for(link_id)
                .evaluate(&answer.expression, resource, context)
                .await
            {
                Ok(result) => {
                    let options: Vec<AnswerValue> = result.iter().filter_map(answer_option_value).collect();
                    if options != answer.options {
                        update.answer_options.insert(link_id.clone(), options);
                    }
                }
                Err(error) => report(&mut update, link_id, "answerExpression", error),
            }
        }

        for (link_id, toggles) in &self.answer_option_toggles {
            let evaluator = evaluator_for(link_id);
            for (index, toggle) in toggles.iter().enumerate() {
                let enabled = match evaluator.evaluate(&toggle.expression, resource, context).await {
                    Ok(result) => match result.first() {
                        Some(FhirPathValue::Boolean(b)) => *b,
                        Some(_) => continue,
                        None => false,
                    },
                    Err(error) => {
                        report(&mut update, link_id, "answerOptionsToggleExpression", error);
                        continue;
                    }
                };
                if enabled != toggle.enabled {
                    update
                        .answer_option_toggles
                        .entry(link_id.clone())
                        .or_default()
                        .push((index, enabled));
                }
            }
        }

        update
    }
}

fn report(update: &mut ExpressionUpdate, link_id: &str, kind: &str, error: EngineError) {
    match &error {
        EngineError::DidNotConverge { .. } | EngineError::Terminology(_) => {
            log::error!("{kind} on '{link_id}' aborted: {error}");
        }
        _ => log::warn!("{kind} on '{link_id}' failed: {error}"),
    }
    update.errors.push((link_id.to_string(), error));
}

/// Live expression state of a loaded questionnaire
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ExpressionEngine {
    calculated: IndexMap<String, CalculatedExpression>,
    answer: IndexMap<String, AnswerExpression>,
    answer_option_toggles: IndexMap<String, Vec<AnswerOptionsToggleExpression>>,
    value_sets: ValueSetCache,
}

impl ExpressionEngine {
    pub fn from_model(model: &QuestionnaireModel) -> Self {
        Self {
            calculated: model
                .calculated_expressions
                .iter()
                .map(|(link_id, e)| (link_id.clone(), CalculatedExpression::new(e.as_str())))
                .collect(),
            answer: model
                .answer_expressions
                .iter()
                .map(|(link_id, e)| (link_id.clone(), AnswerExpression::new(e.as_str())))
                .collect(),
            answer_option_toggles: model
                .answer_options_toggles
                .iter()
                .map(|(link_id, toggles)| (link_id.clone(), toggles.iter().map(Into::into).collect()))
                .collect(),
            value_sets: ValueSetCache::default(),
        }
    }

    /// Copy of the expressions for a round, with enableWhen state from `enable_when`
    pub fn snapshot(&self, enable_when: &super::EnableWhenEngine) -> ExpressionSnapshot {
        ExpressionSnapshot {
            calculated: self.calculated.clone(),
            enable_when: enable_when
                .expressions()
                .iter()
                .map(|(link_id, e)| (link_id.clone(), (e.expression.clone(), e.is_enabled())))
                .collect(),
            answer: self.answer.clone(),
            answer_option_toggles: self.answer_option_toggles.clone(),
        }
    }

    /// Apply the calculated, answer and toggle results of a round
    pub fn apply(&mut self, update: &ExpressionUpdate) {
        for (link_id, value) in &update.calculated {
            if let Some(calculated) = self.calculated.get_mut(link_id) {
                calculated.value = Some(value.clone());
                calculated.dirty = true;
            }
        }
        for (link_id, options) in &update.answer_options {
            if let Some(answer) = self.answer.get_mut(link_id) {
                answer.options = options.clone();
            }
        }
        for (link_id, flips) in &update.answer_option_toggles {
            let Some(toggles) = self.answer_option_toggles.get_mut(link_id) else {
                continue;
            };
            for (index, enabled) in flips {
                if let Some(toggle) = toggles.get_mut(*index) {
                    toggle.enabled = *enabled;
                }
            }
        }
    }

    pub fn calculated(&self) -> &IndexMap<String, CalculatedExpression> {
        &self.calculated
    }

    pub(crate) fn calculated_mut(&mut self) -> impl Iterator<Item = (&String, &mut CalculatedExpression)> {
        self.calculated.iter_mut()
    }

    pub fn answer_options(&self, link_id: &str) -> Option<&[AnswerValue]> {
        self.answer.get(link_id).map(|a| a.options.as_slice())
    }

    /// Whether `option` is offered on `link_id`
    ///
    /// Options no toggle names are always offered. An option named by several toggles
    /// follows the last of them.
    pub fn is_option_enabled(&self, link_id: &str, option: &AnswerValue) -> bool {
        self.answer_option_toggles
            .get(link_id)
            .and_then(|toggles| {
                toggles
                    .iter()
                    .rev()
                    .find(|toggle| toggle.options.iter().any(|o| o.matches(option)))
            })
            .is_none_or(|toggle| toggle.enabled)
    }

    pub fn value_sets(&self) -> &ValueSetCache {
        &self.value_sets
    }

    pub fn value_sets_mut(&mut self) -> &mut ValueSetCache {
        &mut self.value_sets
    }
}

fn coding_from(value: &Value) -> Option<Coding> {
    let object = value.as_object()?;
    if !object.contains_key("code") && !object.contains_key("display") {
        return None;
    }
    serde_json::from_value(value.clone()).ok()
}

/// Option produced by an `answerExpression` result item
fn answer_option_value(value: &FhirPathValue) -> Option<AnswerValue> {
    Some(match value {
        FhirPathValue::Resource(resource) => AnswerValue::Coding(coding_from(resource)?),
        FhirPathValue::String(s) => AnswerValue::String(s.clone()),
        FhirPathValue::Integer(i) => AnswerValue::Integer(*i),
        FhirPathValue::Decimal(d) => AnswerValue::Decimal(*d),
        FhirPathValue::Date(s) => AnswerValue::Date(s.clone()),
        FhirPathValue::Time(s) => AnswerValue::Time(s.clone()),
        FhirPathValue::Boolean(_) | FhirPathValue::DateTime(_) | FhirPathValue::Quantity(_) => {
            return None;
        }
    })
}

fn looks_like_date(text: &str) -> bool {
    match text.len() {
        4 => text.bytes().all(|b| b.is_ascii_digit()),
        7 => NaiveDate::parse_from_str(&format!("{text}-01"), "%Y-%m-%d").is_ok(),
        _ => NaiveDate::parse_from_str(text, "%Y-%m-%d").is_ok(),
    }
}

fn looks_like_date_time(text: &str) -> bool {
    looks_like_date(text.get(..10).unwrap_or(text)) && (text.len() <= 10 || text.as_bytes()[10] == b'T')
}

fn looks_like_time(text: &str) -> bool {
    NaiveTime::parse_from_str(text, "%H:%M:%S%.f").is_ok() || NaiveTime::parse_from_str(text, "%H:%M").is_ok()
}

fn quantity_from(value: &FhirPathValue) -> Option<Quantity> {
    match value {
        FhirPathValue::Resource(resource) => serde_json::from_value(resource.as_ref().clone()).ok(),
        FhirPathValue::Quantity(q) => Some(Quantity {
            value: Some(q.value),
            comparator: None,
            unit: q.unit.clone(),
            system: q.unit.as_ref().map(|_| "http://unitsofmeasure.org".to_string()),
            code: q.unit.clone(),
        }),
        _ => None,
    }
}

/// Convert a calculated result into an answer suited to the item's type
///
/// Codes are matched against the item's `answerOption` first. `None` means the value
/// cannot be stored as an answer to this item.
pub fn parse_value_to_answer(item: &QuestionnaireItem, value: &FhirPathValue) -> Option<AnswerValue> {
    let code = match value {
        FhirPathValue::Resource(resource) => resource.get("code").and_then(Value::as_str).map(str::to_string),
        FhirPathValue::String(s) => Some(s.clone()),
        _ => None,
    };
    if let Some(code) = code {
        let option = item.answer_option.iter().find(|option| match &option.value {
            AnswerValue::Coding(coding) => coding.code.as_deref() == Some(code.as_str()),
            _ => false,
        });
        if let Some(option) = option {
            return Some(option.value.clone());
        }
    }

    match (item.item_type, value) {
        (ItemType::Boolean, FhirPathValue::Boolean(b)) => Some(AnswerValue::Boolean(*b)),
        (_, FhirPathValue::Boolean(_)) => None,
        (ItemType::Integer, v) if v.as_decimal().is_some() => {
            v.as_decimal()
                .and_then(|d| d.round_dp_with_strategy(0, RoundingStrategy::MidpointAwayFromZero).to_i64())
                .map(AnswerValue::Integer)
        }
        (ItemType::Decimal, FhirPathValue::Quantity(q)) => Some(AnswerValue::Decimal(q.value)),
        (ItemType::Quantity, v) => quantity_from(v)
            .or_else(|| {
                v.as_decimal().map(|d| Quantity {
                    value: Some(d),
                    ..Quantity::default()
                })
            })
            .map(AnswerValue::Quantity),
        (ItemType::String | ItemType::Text, FhirPathValue::Integer(_) | FhirPathValue::Decimal(_)) => {
            Some(AnswerValue::String(value.to_display_string()))
        }
        (_, FhirPathValue::Integer(i)) => Some(AnswerValue::Integer(*i)),
        (_, FhirPathValue::Decimal(d)) => Some(AnswerValue::Decimal(*d)),
        (_, FhirPathValue::Quantity(q)) => Some(AnswerValue::Decimal(q.value)),
        (_, FhirPathValue::Resource(resource)) => coding_from(resource).map(AnswerValue::Coding),
        (ItemType::Date, v) => v.as_str().filter(|s| looks_like_date(s)).map(|s| AnswerValue::Date(s.to_string())),
        (ItemType::DateTime, v) => v
            .as_str()
            .filter(|s| looks_like_date_time(s))
            .map(|s| AnswerValue::DateTime(s.to_string())),
        (ItemType::Time, v) => v.as_str().filter(|s| looks_like_time(s)).map(|s| AnswerValue::Time(s.to_string())),
        (ItemType::Url, v) => v.as_str().map(|s| AnswerValue::Uri(s.to_string())),
        (_, v) => v.as_str().map(|s| AnswerValue::String(s.to_string())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::questionnaire::AnswerOption;
    use pretty_assertions::assert_eq;
    use rstest::rstest;
    use rust_decimal::Decimal;
    use serde_json::{Map, json};
    use std::str::FromStr;
    use std::sync::Arc;

    fn d(text: &str) -> Decimal {
        Decimal::from_str(text).unwrap()
    }

    #[rstest]
    #[case(ItemType::Decimal, FhirPathValue::Decimal(d("24.5")), Some(AnswerValue::Decimal(d("24.5"))))]
    #[case(ItemType::Integer, FhirPathValue::Decimal(d("24.5")), Some(AnswerValue::Integer(25)))]
    #[case(ItemType::Boolean, FhirPathValue::Boolean(true), Some(AnswerValue::Boolean(true)))]
    #[case(ItemType::String, FhirPathValue::Boolean(true), None)]
    #[case(ItemType::String, FhirPathValue::Integer(3), Some(AnswerValue::String("3".into())))]
    #[case(ItemType::Date, FhirPathValue::String("2024-03-01".into()), Some(AnswerValue::Date("2024-03-01".into())))]
    #[case(ItemType::Date, FhirPathValue::String("not a date".into()), None)]
    #[case(ItemType::DateTime, FhirPathValue::DateTime("2024-03-01T10:00:00Z".into()), Some(AnswerValue::DateTime("2024-03-01T10:00:00Z".into())))]
    #[case(ItemType::Time, FhirPathValue::String("10:30".into()), Some(AnswerValue::Time("10:30".into())))]
    #[case(ItemType::Text, FhirPathValue::String("hello".into()), Some(AnswerValue::String("hello".into())))]
    fn converts_by_item_type(
        #[case] item_type: ItemType,
        #[case] value: FhirPathValue,
        #[case] expected: Option<AnswerValue>,
    ) {
        let item = QuestionnaireItem::new("x", item_type);
        assert_eq!(parse_value_to_answer(&item, &value), expected);
    }

    #[test]
    fn codes_resolve_to_answer_options() {
        let mut item = QuestionnaireItem::new("risk", ItemType::Choice);
        let high = Coding {
            display: Some("High".into()),
            ..Coding::new("http://example.org/risk", "high")
        };
        item.answer_option.push(AnswerOption {
            value: AnswerValue::Coding(high.clone()),
            initial_selected: false,
            extra: Map::new(),
        });

        let value = FhirPathValue::String("high".into());
        assert_eq!(parse_value_to_answer(&item, &value), Some(AnswerValue::Coding(high)));

        let coding = FhirPathValue::resource(Arc::new(json!({"system": "s", "code": "other"})));
        assert_eq!(
            parse_value_to_answer(&item, &coding),
            Some(AnswerValue::Coding(Coding::new("s", "other")))
        );
    }

    #[test]
    fn answer_expression_results_become_options() {
        let coding = FhirPathValue::resource(Arc::new(json!({"system": "s", "code": "a", "display": "A"})));
        assert!(matches!(answer_option_value(&coding), Some(AnswerValue::Coding(_))));
        assert_eq!(
            answer_option_value(&FhirPathValue::String("x".into())),
            Some(AnswerValue::String("x".into()))
        );
        let not_a_coding = FhirPathValue::resource(Arc::new(json!({"resourceType": "Patient"})));
        assert_eq!(answer_option_value(&not_a_coding), None);
    }

    #[test]
    fn value_set_cache_reads_expansions() {
        let mut cache = ValueSetCache::default();
        cache.insert_expansion(
            "http://example.org/vs",
            &json!({"resourceType": "ValueSet", "expansion": {"contains": [
                {"system": "s", "code": "a", "display": "A"},
                {"system": "s", "code": "b"}
            ]}}),
        );
        let codings = cache.get("http://example.org/vs").unwrap();
        assert_eq!(codings.len(), 2);
        assert_eq!(codings[0].display.as_deref(), Some("A"));
    }

    #[test]
    fn apply_marks_calculated_values_dirty() {
        let mut engine = ExpressionEngine::default();
        engine
            .calculated
            .insert("bmi".into(), CalculatedExpression::new("%weight / %height.power(2)"));
        let mut update = ExpressionUpdate::default();
        update.calculated.insert("bmi".into(), FhirPathValue::Decimal(d("24.7")));
        update.calculated.insert("missing".into(), FhirPathValue::Integer(1));
        engine.apply(&update);

        let bmi = &engine.calculated()["bmi"];
        assert_eq!(bmi.value, Some(FhirPathValue::Decimal(d("24.7"))));
        assert!(bmi.dirty);
        assert_eq!(engine.calculated().len(), 1);
    }

    #[test]
    fn toggles_gate_only_the_options_they_name() {
        let mut engine = ExpressionEngine::default();
        let fever = AnswerValue::Coding(Coding::new("s", "fever"));
        engine.answer_option_toggles.insert(
            "symptoms".into(),
            vec![AnswerOptionsToggleExpression::from(&AnswerOptionsToggle {
                options: vec![fever.clone()],
                expression: "%hasSelectedYes".into(),
            })],
        );
        let other = AnswerValue::String("headache".into());
        assert!(!engine.is_option_enabled("symptoms", &fever));
        assert!(engine.is_option_enabled("symptoms", &other));

        let mut update = ExpressionUpdate::default();
        update.answer_option_toggles.insert("symptoms".into(), vec![(0, true), (3, false)]);
        assert!(!update.is_empty());
        engine.apply(&update);
        assert!(engine.is_option_enabled("symptoms", &fever));
    }
}
