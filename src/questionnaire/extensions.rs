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

//! SDC extension scan
//!
//! [`QuestionnaireModel`] indexes a questionnaire once: item lookup by linkId, parent links,
//! and every SDC expression extension the engines evaluate.

use super::answer::AnswerValue;
use super::model::{Expression, Extension, Questionnaire, QuestionnaireItem};
use indexmap::IndexMap;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;

pub const ENABLE_WHEN_EXPRESSION: &str =
    "http://hl7.org/fhir/uv/sdc/StructureDefinition/sdc-questionnaire-enableWhenExpression";
pub const CALCULATED_EXPRESSION: &str =
    "http://hl7.org/fhir/uv/sdc/StructureDefinition/sdc-questionnaire-calculatedExpression";
pub const ANSWER_EXPRESSION: &str =
    "http://hl7.org/fhir/uv/sdc/StructureDefinition/sdc-questionnaire-answerExpression";
pub const ANSWER_OPTIONS_TOGGLE_EXPRESSION: &str =
    "http://hl7.org/fhir/uv/sdc/StructureDefinition/sdc-questionnaire-answerOptionsToggleExpression";
pub const VARIABLE: &str = "http://hl7.org/fhir/StructureDefinition/variable";
pub const TERMINOLOGY_SERVER: &str = "http://hl7.org/fhir/StructureDefinition/terminology-server";
pub const PREFERRED_TERMINOLOGY_SERVER: &str =
    "http://hl7.org/fhir/uv/sdc/StructureDefinition/sdc-questionnaire-preferredTerminologyServer";

/// Named FHIRPath variables declared on the questionnaire and on items
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Variables {
    pub questionnaire_level: Vec<Expression>,
    /// Item-level variables keyed by the declaring item's linkId, in post-order
    pub item_level: IndexMap<String, Vec<Expression>>,
}

impl Variables {
    pub fn is_empty(&self) -> bool {
        self.questionnaire_level.is_empty() && self.item_level.is_empty()
    }
}

/// Options of an item switched on and off together by one boolean expression
#[derive(Debug, Clone, PartialEq)]
pub struct AnswerOptionsToggle {
    pub options: Vec<AnswerValue>,
    pub expression: String,
}

impl AnswerOptionsToggle {
    fn from_extension(link_id: &str, extension: &Extension) -> Option<Self> {
        let parts = extension.rest.get("extension").and_then(Value::as_array)?;
        let mut options = Vec::new();
        let mut expression = None;
        for part in parts.iter().filter_map(Value::as_object) {
            match part.get("url").and_then(Value::as_str) {
                Some("option") => {
                    let mut part = part.clone();
                    match AnswerValue::take_prefixed(&mut part, "value") {
                        Ok(Some(value)) => options.push(value),
                        Ok(None) => {}
                        Err(message) => log::debug!("skipping toggled option on '{link_id}': {message}"),
                    }
                }
                Some("expression") => {
                    expression = part
                        .get("valueExpression")
                        .and_then(|v| serde_json::from_value::<Expression>(v.clone()).ok());
                }
                _ => {}
            }
        }
        let expression = expression?.fhirpath()?.to_string();
        if options.is_empty() {
            return None;
        }
        Some(Self { options, expression })
    }
}

#[derive(Debug, Clone)]
struct ItemNode {
    item: QuestionnaireItem,
    parent: Option<String>,
}

/// Index over a loaded questionnaire
#[derive(Debug, Clone)]
pub struct QuestionnaireModel {
    questionnaire: Arc<Questionnaire>,
    nodes: HashMap<String, ItemNode>,
    order: Vec<String>,
    pub enable_when_expressions: IndexMap<String, String>,
    pub calculated_expressions: IndexMap<String, String>,
    pub answer_expressions: IndexMap<String, String>,
    pub answer_value_sets: IndexMap<String, String>,
    pub answer_options_toggles: IndexMap<String, Vec<AnswerOptionsToggle>>,
    pub variables: Variables,
    terminology_servers: HashMap<String, String>,
}

fn fhirpath_extension(item: &QuestionnaireItem, url: &str) -> Option<String> {
    let expression = item.extensions(url).find_map(|e| e.value_expression())?;
    match expression.fhirpath() {
        Some(text) => Some(text.to_string()),
        None => {
            log::debug!(
                "skipping non-FHIRPath expression on '{}' ({url})",
                item.link_id
            );
            None
        }
    }
}

fn fhirpath_variables<'a>(extensions: impl Iterator<Item = &'a super::model::Extension>) -> Vec<Expression> {
    extensions
        .filter(|e| e.url == VARIABLE)
        .filter_map(|e| e.value_expression())
        .filter(|e| e.name.is_some() && e.fhirpath().is_some())
        .collect()
}

impl QuestionnaireModel {
    pub fn new(questionnaire: Arc<Questionnaire>) -> Self {
        let mut model = Self {
            questionnaire: Arc::clone(&questionnaire),
            nodes: HashMap::new(),
            order: Vec::new(),
            enable_when_expressions: IndexMap::new(),
            calculated_expressions: IndexMap::new(),
            answer_expressions: IndexMap::new(),
            answer_value_sets: IndexMap::new(),
            answer_options_toggles: IndexMap::new(),
            variables: Variables {
                questionnaire_level: fhirpath_variables(questionnaire.extension.iter()),
                item_level: IndexMap::new(),
            },
            terminology_servers: HashMap::new(),
        };

        let root_server = questionnaire
            .extension
            .iter()
            .find(|e| e.url == PREFERRED_TERMINOLOGY_SERVER)
            .and_then(|e| e.value_url())
            .map(str::to_string);

        for item in &questionnaire.item {
            model.index(item, None, root_server.as_deref());
        }
        model
    }

    fn index(&mut self, item: &QuestionnaireItem, parent: Option<&str>, inherited_server: Option<&str>) {
        let link_id = item.link_id.clone();
        self.order.push(link_id.clone());

        if let Some(expression) = fhirpath_extension(item, ENABLE_WHEN_EXPRESSION) {
            self.enable_when_expressions.insert(link_id.clone(), expression);
        }
        if let Some(expression) = fhirpath_extension(item, CALCULATED_EXPRESSION) {
            self.calculated_expressions.insert(link_id.clone(), expression);
        }
        if let Some(expression) = fhirpath_extension(item, ANSWER_EXPRESSION) {
            self.answer_expressions.insert(link_id.clone(), expression);
        }
        if let Some(value_set) = &item.answer_value_set {
            self.answer_value_sets.insert(link_id.clone(), value_set.clone());
        }
        let toggles: Vec<_> = item
            .extensions(ANSWER_OPTIONS_TOGGLE_EXPRESSION)
            .filter_map(|extension| AnswerOptionsToggle::from_extension(&link_id, extension))
            .collect();
        if !toggles.is_empty() {
            self.answer_options_toggles.insert(link_id.clone(), toggles);
        }

        let server = item
            .extension
            .iter()
            .find(|e| e.url == TERMINOLOGY_SERVER || e.url == PREFERRED_TERMINOLOGY_SERVER)
            .and_then(|e| e.value_url())
            .or(inherited_server)
            .map(str::to_string);
        if let Some(server) = &server {
            self.terminology_servers.insert(link_id.clone(), server.clone());
        }

        for child in &item.item {
            self.index(child, Some(link_id.as_str()), server.as_deref());
        }

        // Post-order so descendants bind before their ancestors
        let variables = fhirpath_variables(item.extension.iter());
        if !variables.is_empty() {
            self.variables.item_level.insert(link_id.clone(), variables);
        }

        self.nodes.insert(
            link_id,
            ItemNode {
                item: item.clone(),
                parent: parent.map(str::to_string),
            },
        );
    }

    pub fn questionnaire(&self) -> &Arc<Questionnaire> {
        &self.questionnaire
    }

    pub fn item(&self, link_id: &str) -> Option<&QuestionnaireItem> {
        self.nodes.get(link_id).map(|node| &node.item)
    }

    pub fn contains(&self, link_id: &str) -> bool {
        self.nodes.contains_key(link_id)
    }

    pub fn parent(&self, link_id: &str) -> Option<&str> {
        self.nodes.get(link_id)?.parent.as_deref()
    }

    /// Definitions of the children of `parent`, or the top-level items for `None`
    pub fn children(&self, parent: Option<&str>) -> &[QuestionnaireItem] {
        match parent {
            None => &self.questionnaire.item,
            Some(link_id) => self
                .nodes
                .get(link_id)
                .map(|node| node.item.item.as_slice())
                .unwrap_or_default(),
        }
    }

    /// Ancestor linkIds from the top level down to `link_id` itself
    pub fn path_to(&self, link_id: &str) -> Option<Vec<String>> {
        if !self.contains(link_id) {
            return None;
        }
        let mut path = vec![link_id.to_string()];
        let mut current = link_id;
        while let Some(parent) = self.parent(current) {
            path.push(parent.to_string());
            current = parent;
        }
        path.reverse();
        Some(path)
    }

    /// Nearest enclosing repeating group, excluding the item itself
    pub fn repeating_ancestor(&self, link_id: &str) -> Option<&str> {
        let mut current = self.parent(link_id);
        while let Some(link_id) = current {
            if self.item(link_id).is_some_and(QuestionnaireItem::is_repeating_group) {
                return Some(link_id);
            }
            current = self.parent(link_id);
        }
        None
    }

    /// All linkIds in document order
    pub fn link_ids(&self) -> impl Iterator<Item = &str> {
        self.order.iter().map(String::as_str)
    }

    /// Terminology server declared on the item or inherited from an ancestor
    pub fn terminology_server(&self, link_id: &str) -> Option<&str> {
        self.terminology_servers.get(link_id).map(String::as_str)
    }
}
