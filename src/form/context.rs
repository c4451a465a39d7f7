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

//! Expression context construction
//!
//! Every expression sees the same base environment: `%resource` and `%rootResource` bound
//! to the response, `%questionnaire`, an empty `%terminologies`, the launch resources, and
//! the questionnaire's named variables evaluated against the current response.

use crate::async_eval::AsyncFhirPathEvaluator;
use crate::evaluator::EvaluationContext;
use crate::questionnaire::{Expression, QuestionnaireResponse, Variables};
use serde_json::{Value, json};

/// Resources supplied by the launching application
#[derive(Debug, Clone, Default, PartialEq)]
pub struct LaunchContext {
    pub patient: Option<Value>,
    pub user: Option<Value>,
    pub encounter: Option<Value>,
}

impl LaunchContext {
    pub fn with_patient(mut self, patient: Value) -> Self {
        self.patient = Some(patient);
        self
    }

    pub fn with_user(mut self, user: Value) -> Self {
        self.user = Some(user);
        self
    }

    pub fn with_encounter(mut self, encounter: Value) -> Self {
        self.encounter = Some(encounter);
        self
    }
}

/// Builds the [`EvaluationContext`] shared by one round of expression evaluation
#[derive(Debug)]
pub struct ContextBuilder<'a> {
    evaluator: &'a AsyncFhirPathEvaluator,
    launch: &'a LaunchContext,
    questionnaire: Option<&'a Value>,
}

impl<'a> ContextBuilder<'a> {
    pub fn new(evaluator: &'a AsyncFhirPathEvaluator, launch: &'a LaunchContext) -> Self {
        Self {
            evaluator,
            launch,
            questionnaire: None,
        }
    }

    pub fn with_questionnaire(mut self, questionnaire: &'a Value) -> Self {
        self.questionnaire = Some(questionnaire);
        self
    }

    /// Bind the fixed variables, then evaluate the named variables
    ///
    /// Questionnaire-level variables are evaluated in declaration order against the
    /// response, so later ones may use earlier ones. Item-level variables follow in
    /// post-order with the matching response item as focus; when an item repeats, the
    /// last instance wins. A variable that fails to evaluate is logged and left unbound.
    pub async fn build(&self, response: &QuestionnaireResponse, variables: &Variables) -> EvaluationContext {
        let resource = response.to_json();
        let mut context = EvaluationContext::new();
        context.set_resource("resource", resource.clone());
        context.set_resource("rootResource", resource.clone());
        context.set_resource("terminologies", json!({}));
        if let Some(questionnaire) = self.questionnaire {
            context.set_resource("questionnaire", questionnaire.clone());
        }
        for (name, launch) in [
            ("patient", &self.launch.patient),
            ("user", &self.launch.user),
            ("encounter", &self.launch.encounter),
        ] {
            if let Some(launch) = launch {
                context.set_resource(name, launch.clone());
            }
        }

        for variable in &variables.questionnaire_level {
            self.bind(&mut context, variable, &resource).await;
        }

        for (link_id, declared) in &variables.item_level {
            for item in response.find_all(link_id) {
                let focus = serde_json::to_value(item).unwrap_or(Value::Null);
                context.set_resource("context", focus.clone());
                for variable in declared {
                    self.bind(&mut context, variable, &focus).await;
                }
            }
        }
        context.remove("context");

        context
    }

    async fn bind(&self, context: &mut EvaluationContext, variable: &Expression, focus: &Value) {
        let (Some(name), Some(expression)) = (variable.name.as_deref(), variable.fhirpath()) else {
            return;
        };
        match self.evaluator.evaluate(expression, focus, context).await {
            Ok(value) => context.set_variable(name, value),
            Err(error) => {
                log::warn!("Variable %{name} could not be evaluated: {error}");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EngineConfig;
    use crate::model::{Collection, FhirPathValue};
    use crate::questionnaire::{AnswerValue, QuestionnaireResponseItem};
    use crate::terminology::http::HttpTerminologyProvider;
    use indexmap::IndexMap;
    use pretty_assertions::assert_eq;
    use std::sync::Arc;

    fn evaluator() -> AsyncFhirPathEvaluator {
        AsyncFhirPathEvaluator::new(Arc::new(HttpTerminologyProvider::new()), &EngineConfig::default())
    }

    fn variable(name: &str, expression: &str) -> Expression {
        Expression {
            name: Some(name.to_string()),
            language: Some("text/fhirpath".to_string()),
            expression: Some(expression.to_string()),
            description: None,
        }
    }

    fn response() -> QuestionnaireResponse {
        QuestionnaireResponse::new(vec![
            QuestionnaireResponseItem::with_answers("weight", [AnswerValue::Integer(80)]),
            QuestionnaireResponseItem::with_answers("height", [AnswerValue::Integer(2)]),
        ])
    }

    #[tokio::test]
    async fn binds_fixed_and_launch_variables() {
        let evaluator = evaluator();
        let launch = LaunchContext::default().with_patient(json!({"resourceType": "Patient", "id": "p1"}));
        let questionnaire = json!({"resourceType": "Questionnaire"});
        let context = ContextBuilder::new(&evaluator, &launch)
            .with_questionnaire(&questionnaire)
            .build(&response(), &Variables::default())
            .await;

        for name in ["resource", "rootResource", "terminologies", "questionnaire", "patient"] {
            assert!(context.contains(name), "missing %{name}");
        }
        assert!(!context.contains("user"));
    }

    #[tokio::test]
    async fn later_variables_see_earlier_ones() {
        let evaluator = evaluator();
        let launch = LaunchContext::default();
        let variables = Variables {
            questionnaire_level: vec![
                variable("weight", "%resource.item.where(linkId='weight').answer.value"),
                variable("double", "%weight * 2"),
                variable("broken", "%undefined + 1"),
            ],
            item_level: IndexMap::new(),
        };
        let context = ContextBuilder::new(&evaluator, &launch)
            .build(&response(), &variables)
            .await;

        assert_eq!(
            context.get_variable("double"),
            Some(&Collection::single(FhirPathValue::Integer(160)))
        );
        assert!(!context.contains("broken"));
    }

    #[tokio::test]
    async fn item_variables_use_the_item_as_focus() {
        let evaluator = evaluator();
        let launch = LaunchContext::default();
        let mut item_level = IndexMap::new();
        item_level.insert("height".to_string(), vec![variable("h", "answer.value")]);
        let variables = Variables {
            questionnaire_level: Vec::new(),
            item_level,
        };
        let context = ContextBuilder::new(&evaluator, &launch)
            .build(&response(), &variables)
            .await;

        assert_eq!(
            context.get_variable("h"),
            Some(&Collection::single(FhirPathValue::Integer(2)))
        );
        assert!(!context.contains("context"));
    }
}
