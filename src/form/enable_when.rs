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

//! Conditional visibility
//!
//! Structural `enableWhen` conditions are kept per item together with the answers of the
//! questions they watch. A reverse index from trigger linkId to dependent items limits
//! re-evaluation to the items an answer change can affect. Items inside a repeating group
//! whose trigger lives in the same group are evaluated once per group instance.
//!
//! `enableWhenExpression` results are computed by the expression engine and stored here;
//! an expression that failed or returned nothing leaves its item enabled.

use crate::questionnaire::{
    AnswerValue, EnableBehavior, EnableWhen, EnableWhenOperator, QuestionnaireModel,
    QuestionnaireResponse, QuestionnaireResponseItem,
};
use std::cmp::Ordering;
use std::collections::{BTreeMap, BTreeSet, HashMap};

/// Structural conditions of one item and their current result
#[derive(Debug, Clone, PartialEq)]
pub struct EnableWhenItem {
    pub link_id: String,
    pub conditions: Vec<EnableWhen>,
    pub behavior: EnableBehavior,
    /// Repeating group whose instances are evaluated separately
    pub repeat_group: Option<String>,
    enabled: bool,
    enabled_instances: Vec<bool>,
}

impl EnableWhenItem {
    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    pub fn enabled_instances(&self) -> &[bool] {
        &self.enabled_instances
    }
}

/// `enableWhenExpression` of one item and its last result
#[derive(Debug, Clone, PartialEq)]
pub struct EnableWhenExpression {
    pub link_id: String,
    pub expression: String,
    enabled: bool,
}

impl EnableWhenExpression {
    pub fn new(link_id: impl Into<String>, expression: impl Into<String>) -> Self {
        Self {
            link_id: link_id.into(),
            expression: expression.into(),
            enabled: true,
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }
}

/// Answers of the watched questions
#[derive(Debug, Clone, Default, PartialEq)]
struct TriggerAnswers {
    answers: HashMap<String, Vec<AnswerValue>>,
    /// Per repeating-group instance, for triggers inside a repeating group
    instances: HashMap<String, Vec<Vec<AnswerValue>>>,
}

/// Visibility state for a questionnaire
#[derive(Debug, Clone, PartialEq)]
pub struct EnableWhenEngine {
    items: BTreeMap<String, EnableWhenItem>,
    expressions: BTreeMap<String, EnableWhenExpression>,
    linked_questions: HashMap<String, BTreeSet<String>>,
    /// Trigger linkId -> repeating group it is answered in
    trigger_groups: HashMap<String, String>,
    answers: TriggerAnswers,
    activated: bool,
}

impl Default for EnableWhenEngine {
    fn default() -> Self {
        Self {
            items: BTreeMap::new(),
            expressions: BTreeMap::new(),
            linked_questions: HashMap::new(),
            trigger_groups: HashMap::new(),
            answers: TriggerAnswers::default(),
            activated: true,
        }
    }
}

/// Whether one answer satisfies a non-`exists` condition
fn answer_satisfies(operator: EnableWhenOperator, answer: &AnswerValue, expected: &AnswerValue) -> bool {
    let ordering = || answer.compare(expected);
    match operator {
        EnableWhenOperator::Exists => true,
        EnableWhenOperator::Equal => answer.matches(expected),
        EnableWhenOperator::NotEqual => comparable(answer, expected) && !answer.matches(expected),
        EnableWhenOperator::GreaterThan => ordering() == Some(Ordering::Greater),
        EnableWhenOperator::LessThan => ordering() == Some(Ordering::Less),
        EnableWhenOperator::GreaterOrEqual => {
            matches!(ordering(), Some(Ordering::Greater | Ordering::Equal))
        }
        EnableWhenOperator::LessOrEqual => {
            matches!(ordering(), Some(Ordering::Less | Ordering::Equal))
        }
    }
}

fn comparable(a: &AnswerValue, b: &AnswerValue) -> bool {
    use AnswerValue as A;
    a.type_suffix() == b.type_suffix()
        || matches!(
            (a, b),
            (A::Integer(_) | A::Decimal(_), A::Integer(_) | A::Decimal(_))
                | (A::Date(_) | A::DateTime(_), A::Date(_) | A::DateTime(_))
        )
}

/// Evaluate one condition against the current answers of its question
pub fn condition_holds(condition: &EnableWhen, answers: &[AnswerValue]) -> bool {
    if condition.operator == EnableWhenOperator::Exists {
        let expected = !matches!(condition.answer, AnswerValue::Boolean(false));
        return !answers.is_empty() == expected;
    }
    answers
        .iter()
        .any(|answer| answer_satisfies(condition.operator, answer, &condition.answer))
}

fn combine(behavior: EnableBehavior, results: impl Iterator<Item = bool>) -> bool {
    let mut results = results.peekable();
    if results.peek().is_none() {
        return true;
    }
    match behavior {
        EnableBehavior::All => results.all(|r| r),
        EnableBehavior::Any => results.any(|r| r),
    }
}

fn answers_of(item: &QuestionnaireResponseItem) -> Vec<AnswerValue> {
    item.values().cloned().collect()
}

/// Items with `link_id` inside `items`, including items nested under answers
fn find_descendants<'a>(
    items: &'a [QuestionnaireResponseItem],
    link_id: &str,
    found: &mut Vec<&'a QuestionnaireResponseItem>,
) {
    for item in items {
        if item.link_id == link_id {
            found.push(item);
        }
        find_descendants(&item.item, link_id, found);
        for answer in &item.answer {
            find_descendants(&answer.item, link_id, found);
        }
    }
}

impl EnableWhenEngine {
    /// Collect conditions and the reverse dependency index from a questionnaire
    pub fn from_model(model: &QuestionnaireModel, activated: bool) -> Self {
        let mut engine = Self {
            activated,
            ..Self::default()
        };

        for link_id in model.link_ids() {
            let Some(item) = model.item(link_id) else {
                continue;
            };
            if let Some(expression) = model.enable_when_expressions.get(link_id) {
                engine
                    .expressions
                    .insert(link_id.to_string(), EnableWhenExpression::new(link_id, expression.as_str()));
            }
            if item.enable_when.is_empty() {
                continue;
            }

            let own_group = model.repeating_ancestor(link_id);
            let mut repeat_group = None;
            for condition in &item.enable_when {
                let trigger = condition.question.as_str();
                engine
                    .linked_questions
                    .entry(trigger.to_string())
                    .or_default()
                    .insert(link_id.to_string());
                if let Some(group) = model.repeating_ancestor(trigger) {
                    engine
                        .trigger_groups
                        .insert(trigger.to_string(), group.to_string());
                    if own_group == Some(group) {
                        repeat_group = Some(group.to_string());
                    }
                }
            }

            engine.items.insert(
                link_id.to_string(),
                EnableWhenItem {
                    link_id: link_id.to_string(),
                    conditions: item.enable_when.clone(),
                    behavior: item.enable_behavior.unwrap_or_default(),
                    repeat_group,
                    enabled: false,
                    enabled_instances: Vec::new(),
                },
            );
        }

        let all: Vec<String> = engine.items.keys().cloned().collect();
        for link_id in &all {
            engine.recompute(link_id);
        }
        engine
    }

    /// Load trigger answers from an existing response and recompute every item
    pub fn initialise(&mut self, response: &QuestionnaireResponse) {
        self.answers = TriggerAnswers::default();
        let triggers: Vec<String> = self.linked_questions.keys().cloned().collect();

        for trigger in triggers {
            match self.trigger_groups.get(&trigger).cloned() {
                Some(group) => {
                    let mut instances = Vec::new();
                    find_descendants(&response.item, &group, &mut instances);
                    let per_instance: Vec<Vec<AnswerValue>> = instances
                        .iter()
                        .map(|instance| {
                            let mut found = Vec::new();
                            find_descendants(&instance.item, &trigger, &mut found);
                            found.iter().flat_map(|item| answers_of(item)).collect()
                        })
                        .collect();
                    let flattened: Vec<AnswerValue> = per_instance.iter().flatten().cloned().collect();
                    self.answers.instances.insert(trigger.clone(), per_instance);
                    self.answers.answers.insert(trigger, flattened);
                }
                None => {
                    let answers: Vec<AnswerValue> = response
                        .find_all(&trigger)
                        .into_iter()
                        .flat_map(answers_of)
                        .collect();
                    self.answers.answers.insert(trigger, answers);
                }
            }
        }

        let all: Vec<String> = self.items.keys().cloned().collect();
        for link_id in &all {
            self.recompute(link_id);
        }
    }

    /// Record a new answer for `link_id` and re-evaluate its dependents
    ///
    /// `instance` selects the repeating-group instance for triggers answered inside a
    /// repeating group. Returns the dependents whose visibility flipped.
    pub fn update_answer(
        &mut self,
        link_id: &str,
        answers: &[AnswerValue],
        instance: Option<usize>,
    ) -> BTreeSet<String> {
        let Some(dependents) = self.linked_questions.get(link_id).cloned() else {
            return BTreeSet::new();
        };

        match (self.trigger_groups.contains_key(link_id), instance) {
            (true, Some(index)) => {
                let instances = self.answers.instances.entry(link_id.to_string()).or_default();
                if instances.len() <= index {
                    instances.resize(index + 1, Vec::new());
                }
                instances[index] = answers.to_vec();
                let flattened = instances.iter().flatten().cloned().collect();
                self.answers.answers.insert(link_id.to_string(), flattened);
            }
            _ => {
                self.answers
                    .answers
                    .insert(link_id.to_string(), answers.to_vec());
            }
        }

        let mut flipped = BTreeSet::new();
        for dependent in dependents {
            if self.recompute(&dependent) {
                flipped.insert(dependent);
            }
        }
        flipped
    }

    /// A new instance was inserted at `index` in `group`; later instances shift up
    pub fn insert_repeat_instance(&mut self, group: &str, index: usize) {
        self.shift_instances(group, |instances| {
            let at = index.min(instances.len());
            instances.insert(at, Vec::new());
        });
    }

    /// The instance at `index` in `group` was removed; later instances shift down
    pub fn remove_repeat_instance(&mut self, group: &str, index: usize) {
        self.shift_instances(group, |instances| {
            if index < instances.len() {
                instances.remove(index);
            }
        });
    }

    fn shift_instances(&mut self, group: &str, mut edit: impl FnMut(&mut Vec<Vec<AnswerValue>>)) {
        let triggers: Vec<String> = self
            .trigger_groups
            .iter()
            .filter(|(_, g)| g.as_str() == group)
            .map(|(trigger, _)| trigger.clone())
            .collect();
        for trigger in &triggers {
            let instances = self.answers.instances.entry(trigger.clone()).or_default();
            edit(instances);
            let flattened = instances.iter().flatten().cloned().collect();
            self.answers.answers.insert(trigger.clone(), flattened);
        }
        let affected: Vec<String> = self
            .items
            .values()
            .filter(|item| item.repeat_group.as_deref() == Some(group))
            .map(|item| item.link_id.clone())
            .collect();
        for link_id in &affected {
            self.recompute(link_id);
        }
    }

    /// Store the result of an `enableWhenExpression`; `None` keeps the item enabled
    pub fn set_expression_result(&mut self, link_id: &str, enabled: Option<bool>) -> bool {
        match self.expressions.get_mut(link_id) {
            Some(expression) => {
                let enabled = enabled.unwrap_or(true);
                let changed = expression.enabled != enabled;
                expression.enabled = enabled;
                changed
            }
            None => false,
        }
    }

    fn instance_count(&self, item: &EnableWhenItem) -> usize {
        item.conditions
            .iter()
            .filter_map(|c| self.answers.instances.get(&c.question))
            .map(Vec::len)
            .max()
            .unwrap_or(0)
    }

    fn evaluate_instance(&self, item: &EnableWhenItem, instance: usize) -> bool {
        let results = item.conditions.iter().map(|condition| {
            let in_group = self.trigger_groups.get(&condition.question) == item.repeat_group.as_ref();
            let answers = if in_group {
                self.answers
                    .instances
                    .get(&condition.question)
                    .and_then(|instances| instances.get(instance))
            } else {
                self.answers.answers.get(&condition.question)
            };
            condition_holds(condition, answers.map(Vec::as_slice).unwrap_or_default())
        });
        combine(item.behavior, results)
    }

    /// Recompute one item; true when its visibility flipped
    fn recompute(&mut self, link_id: &str) -> bool {
        let Some(item) = self.items.get(link_id) else {
            return false;
        };
        let (enabled, enabled_instances) = if item.repeat_group.is_some() {
            let count = self.instance_count(item).max(1);
            let instances: Vec<bool> = (0..count).map(|i| self.evaluate_instance(item, i)).collect();
            (instances.iter().any(|e| *e), instances)
        } else {
            let results = item.conditions.iter().map(|condition| {
                let answers = self
                    .answers
                    .answers
                    .get(&condition.question)
                    .map(Vec::as_slice)
                    .unwrap_or_default();
                condition_holds(condition, answers)
            });
            (combine(item.behavior, results), Vec::new())
        };

        let Some(item) = self.items.get_mut(link_id) else {
            return false;
        };
        let changed = item.enabled != enabled || item.enabled_instances != enabled_instances;
        item.enabled = enabled;
        item.enabled_instances = enabled_instances;
        changed
    }

    /// Visibility of an item; always true while the activation flag is off
    pub fn is_enabled(&self, link_id: &str) -> bool {
        if !self.activated {
            return true;
        }
        let structural = self.items.get(link_id).is_none_or(|item| item.enabled);
        let expression = self.expressions.get(link_id).is_none_or(|e| e.enabled);
        structural && expression
    }

    /// Visibility of an item within one repeating-group instance
    pub fn is_enabled_at(&self, link_id: &str, instance: usize) -> bool {
        if !self.activated {
            return true;
        }
        match self.items.get(link_id) {
            Some(item) if item.repeat_group.is_some() => {
                let structural = item
                    .enabled_instances
                    .get(instance)
                    .copied()
                    .unwrap_or_else(|| self.evaluate_instance(item, instance));
                structural && self.expressions.get(link_id).is_none_or(|e| e.enabled)
            }
            _ => self.is_enabled(link_id),
        }
    }

    /// Items that depend on `trigger`
    pub fn dependents(&self, trigger: &str) -> Option<&BTreeSet<String>> {
        self.linked_questions.get(trigger)
    }

    pub fn items(&self) -> &BTreeMap<String, EnableWhenItem> {
        &self.items
    }

    pub fn expressions(&self) -> &BTreeMap<String, EnableWhenExpression> {
        &self.expressions
    }

    /// Force every item visible (`false`) or apply conditions (`true`)
    pub fn set_activated(&mut self, activated: bool) {
        self.activated = activated;
    }

    pub fn is_activated(&self) -> bool {
        self.activated
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::questionnaire::{Coding, Questionnaire};
    use rstest::rstest;
    use rust_decimal::Decimal;
    use serde_json::json;
    use std::sync::Arc;

    fn condition(operator: EnableWhenOperator, answer: AnswerValue) -> EnableWhen {
        EnableWhen {
            question: "q".into(),
            operator,
            answer,
        }
    }

    #[rstest]
    #[case(EnableWhenOperator::Exists, AnswerValue::Boolean(true), vec![], false)]
    #[case(EnableWhenOperator::Exists, AnswerValue::Boolean(false), vec![], true)]
    #[case(EnableWhenOperator::Exists, AnswerValue::Boolean(true), vec![AnswerValue::Integer(1)], true)]
    #[case(EnableWhenOperator::Equal, AnswerValue::Integer(3), vec![], false)]
    #[case(EnableWhenOperator::Equal, AnswerValue::Integer(3), vec![AnswerValue::Decimal(Decimal::from(3))], true)]
    #[case(EnableWhenOperator::NotEqual, AnswerValue::Integer(3), vec![AnswerValue::Integer(4)], true)]
    #[case(EnableWhenOperator::NotEqual, AnswerValue::Integer(3), vec![AnswerValue::String("x".into())], false)]
    #[case(EnableWhenOperator::GreaterThan, AnswerValue::Integer(17), vec![AnswerValue::Integer(18)], true)]
    #[case(EnableWhenOperator::LessOrEqual, AnswerValue::Date("2020-01-01".into()), vec![AnswerValue::Date("2019-12-31".into())], true)]
    #[case(EnableWhenOperator::Equal, AnswerValue::Boolean(true), vec![AnswerValue::Boolean(false), AnswerValue::Boolean(true)], true)]
    fn conditions(
        #[case] operator: EnableWhenOperator,
        #[case] expected: AnswerValue,
        #[case] answers: Vec<AnswerValue>,
        #[case] holds: bool,
    ) {
        assert_eq!(condition_holds(&condition(operator, expected), &answers), holds);
    }

    #[test]
    fn coding_conditions_ignore_missing_system() {
        let c = condition(
            EnableWhenOperator::Equal,
            AnswerValue::Coding(Coding::new("http://snomed.info/sct", "Y")),
        );
        let answer = AnswerValue::Coding(Coding {
            code: Some("Y".into()),
            ..Coding::default()
        });
        assert!(condition_holds(&c, &[answer]));
    }

    fn model() -> QuestionnaireModel {
        let questionnaire: Questionnaire = serde_json::from_value(json!({
            "resourceType": "Questionnaire",
            "item": [
                {"linkId": "smoker", "type": "boolean"},
                {"linkId": "age", "type": "integer"},
                {"linkId": "packs", "type": "integer", "enableWhen": [
                    {"question": "smoker", "operator": "=", "answerBoolean": true}
                ]},
                {"linkId": "adult-smoker", "type": "string", "enableBehavior": "all", "enableWhen": [
                    {"question": "smoker", "operator": "=", "answerBoolean": true},
                    {"question": "age", "operator": ">=", "answerInteger": 18}
                ]},
                {"linkId": "meds", "type": "group", "repeats": true, "item": [
                    {"linkId": "med-taken", "type": "boolean"},
                    {"linkId": "med-dose", "type": "string", "enableWhen": [
                        {"question": "med-taken", "operator": "=", "answerBoolean": true}
                    ]}
                ]}
            ]
        }))
        .unwrap();
        QuestionnaireModel::new(Arc::new(questionnaire))
    }

    #[test]
    fn toggling_a_trigger_flips_only_its_dependents() {
        let mut engine = EnableWhenEngine::from_model(&model(), true);
        assert!(!engine.is_enabled("packs"));

        let flipped = engine.update_answer("smoker", &[AnswerValue::Boolean(true)], None);
        assert_eq!(flipped, BTreeSet::from(["packs".to_string()]));
        assert!(engine.is_enabled("packs"));
        assert!(!engine.is_enabled("adult-smoker"));

        let flipped = engine.update_answer("age", &[AnswerValue::Integer(30)], None);
        assert_eq!(flipped, BTreeSet::from(["adult-smoker".to_string()]));

        let flipped = engine.update_answer("smoker", &[AnswerValue::Boolean(false)], None);
        assert_eq!(
            flipped,
            BTreeSet::from(["adult-smoker".to_string(), "packs".to_string()])
        );
    }

    #[test]
    fn deactivation_shows_everything_without_losing_state() {
        let mut engine = EnableWhenEngine::from_model(&model(), true);
        engine.set_activated(false);
        assert!(engine.is_enabled("packs"));
        engine.set_activated(true);
        assert!(!engine.is_enabled("packs"));
        assert!(!engine.items()["packs"].is_enabled());
    }

    #[test]
    fn repeat_group_instances_are_independent() {
        let mut engine = EnableWhenEngine::from_model(&model(), true);
        engine.update_answer("med-taken", &[AnswerValue::Boolean(true)], Some(1));
        assert!(!engine.is_enabled_at("med-dose", 0));
        assert!(engine.is_enabled_at("med-dose", 1));

        engine.insert_repeat_instance("meds", 0);
        assert!(engine.is_enabled_at("med-dose", 2));
        assert!(!engine.is_enabled_at("med-dose", 1));

        engine.remove_repeat_instance("meds", 2);
        assert!(!engine.is_enabled("med-dose"));
    }

    #[test]
    fn initialises_from_response() {
        let response: QuestionnaireResponse = serde_json::from_value(json!({
            "resourceType": "QuestionnaireResponse",
            "item": [
                {"linkId": "smoker", "answer": [{"valueBoolean": true}]},
                {"linkId": "meds", "item": [{"linkId": "med-taken", "answer": [{"valueBoolean": false}]}]},
                {"linkId": "meds", "item": [{"linkId": "med-taken", "answer": [{"valueBoolean": true}]}]}
            ]
        }))
        .unwrap();
        let mut engine = EnableWhenEngine::from_model(&model(), true);
        engine.initialise(&response);
        assert!(engine.is_enabled("packs"));
        assert_eq!(engine.items()["med-dose"].enabled_instances(), &[false, true]);
    }

    #[test]
    fn failed_expressions_keep_items_enabled() {
        let mut engine = EnableWhenEngine::default();
        engine
            .expressions
            .insert("x".into(), EnableWhenExpression::new("x", "%broken"));
        assert!(engine.set_expression_result("x", Some(false)));
        assert!(!engine.is_enabled("x"));
        assert!(engine.set_expression_result("x", None));
        assert!(engine.is_enabled("x"));
    }
}
