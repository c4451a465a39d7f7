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

//! FHIR R4 `Questionnaire` resource, restricted to what the engine reads

use super::answer::AnswerValue;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// `Questionnaire` resource
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Questionnaire {
    #[serde(default = "questionnaire_type")]
    pub resource_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub contained: Vec<Value>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub extension: Vec<Extension>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub item: Vec<QuestionnaireItem>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

fn questionnaire_type() -> String {
    "Questionnaire".to_string()
}

impl Default for Questionnaire {
    fn default() -> Self {
        Self {
            resource_type: questionnaire_type(),
            id: None,
            url: None,
            contained: Vec::new(),
            extension: Vec::new(),
            item: Vec::new(),
            extra: Map::new(),
        }
    }
}

impl Questionnaire {
    /// Contained resource referenced as `#id`
    pub fn contained_resource(&self, reference: &str) -> Option<&Value> {
        let id = reference.strip_prefix('#')?;
        self.contained
            .iter()
            .find(|resource| resource.get("id").and_then(Value::as_str) == Some(id))
    }
}

/// `Questionnaire.item`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QuestionnaireItem {
    pub link_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    #[serde(rename = "type")]
    pub item_type: ItemType,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub required: bool,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub repeats: bool,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub read_only: bool,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub enable_when: Vec<EnableWhen>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub enable_behavior: Option<EnableBehavior>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub answer_option: Vec<AnswerOption>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub answer_value_set: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub extension: Vec<Extension>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub item: Vec<QuestionnaireItem>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl QuestionnaireItem {
    /// Minimal item, mostly for building questionnaires in code
    pub fn new(link_id: impl Into<String>, item_type: ItemType) -> Self {
        Self {
            link_id: link_id.into(),
            text: None,
            item_type,
            required: false,
            repeats: false,
            read_only: false,
            enable_when: Vec::new(),
            enable_behavior: None,
            answer_option: Vec::new(),
            answer_value_set: None,
            extension: Vec::new(),
            item: Vec::new(),
            extra: Map::new(),
        }
    }

    pub fn is_repeating_group(&self) -> bool {
        self.item_type == ItemType::Group && self.repeats
    }

    /// Extensions with the given URL
    pub fn extensions<'a>(&'a self, url: &'a str) -> impl Iterator<Item = &'a Extension> + 'a {
        self.extension.iter().filter(move |e| e.url == url)
    }
}

/// `Questionnaire.item.type`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ItemType {
    Group,
    Display,
    Boolean,
    Decimal,
    Integer,
    Date,
    #[serde(rename = "dateTime")]
    DateTime,
    Time,
    String,
    Text,
    Url,
    Choice,
    OpenChoice,
    Attachment,
    Reference,
    Quantity,
    Question,
}

/// `Questionnaire.item.enableWhen.operator`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EnableWhenOperator {
    #[serde(rename = "exists")]
    Exists,
    #[serde(rename = "=")]
    Equal,
    #[serde(rename = "!=")]
    NotEqual,
    #[serde(rename = ">")]
    GreaterThan,
    #[serde(rename = "<")]
    LessThan,
    #[serde(rename = ">=")]
    GreaterOrEqual,
    #[serde(rename = "<=")]
    LessOrEqual,
}

/// `Questionnaire.item.enableBehavior`
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EnableBehavior {
    #[default]
    All,
    Any,
}

/// `Questionnaire.item.enableWhen`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "Map<String, Value>", into = "Map<String, Value>")]
pub struct EnableWhen {
    pub question: String,
    pub operator: EnableWhenOperator,
    pub answer: AnswerValue,
}

impl TryFrom<Map<String, Value>> for EnableWhen {
    type Error = String;

    fn try_from(mut map: Map<String, Value>) -> Result<Self, Self::Error> {
        let question = map
            .remove("question")
            .and_then(|q| q.as_str().map(str::to_string))
            .ok_or("enableWhen.question is required")?;
        let operator = map
            .remove("operator")
            .ok_or("enableWhen.operator is required")
            .and_then(|op| serde_json::from_value(op).map_err(|_| "unknown enableWhen.operator"))?;
        let answer = AnswerValue::take_prefixed(&mut map, "answer")?
            .ok_or_else(|| format!("enableWhen on '{question}' has no answer[x]"))?;
        Ok(Self {
            question,
            operator,
            answer,
        })
    }
}

impl From<EnableWhen> for Map<String, Value> {
    fn from(enable_when: EnableWhen) -> Self {
        let mut map = Map::new();
        map.insert("question".to_string(), Value::String(enable_when.question));
        map.insert(
            "operator".to_string(),
            serde_json::to_value(enable_when.operator).unwrap_or(Value::Null),
        );
        enable_when.answer.write_prefixed(&mut map, "answer");
        map
    }
}

/// `Questionnaire.item.answerOption`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "Map<String, Value>", into = "Map<String, Value>")]
pub struct AnswerOption {
    pub value: AnswerValue,
    pub initial_selected: bool,
    pub extra: Map<String, Value>,
}

impl TryFrom<Map<String, Value>> for AnswerOption {
    type Error = String;

    fn try_from(mut map: Map<String, Value>) -> Result<Self, Self::Error> {
        let value = AnswerValue::take_prefixed(&mut map, "value")?
            .ok_or("answerOption has no value[x]")?;
        let initial_selected = map
            .remove("initialSelected")
            .and_then(|v| v.as_bool())
            .unwrap_or(false);
        Ok(Self {
            value,
            initial_selected,
            extra: map,
        })
    }
}

impl From<AnswerOption> for Map<String, Value> {
    fn from(option: AnswerOption) -> Self {
        let mut map = option.extra;
        option.value.write_prefixed(&mut map, "value");
        if option.initial_selected {
            map.insert("initialSelected".to_string(), Value::Bool(true));
        }
        map
    }
}

/// FHIR `Extension`; the value is kept as raw JSON
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Extension {
    pub url: String,
    #[serde(flatten)]
    pub rest: Map<String, Value>,
}

impl Extension {
    pub fn value_expression(&self) -> Option<Expression> {
        self.rest
            .get("valueExpression")
            .and_then(|v| serde_json::from_value(v.clone()).ok())
    }

    /// `valueUrl`, `valueUri` or `valueString`
    pub fn value_url(&self) -> Option<&str> {
        ["valueUrl", "valueUri", "valueString", "valueCanonical"]
            .iter()
            .find_map(|key| self.rest.get(*key).and_then(Value::as_str))
    }
}

/// FHIR `Expression`
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Expression {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub language: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expression: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

impl Expression {
    /// FHIRPath text of the expression, when its language is FHIRPath
    pub fn fhirpath(&self) -> Option<&str> {
        match self.language.as_deref() {
            Some("text/fhirpath") | None => self.expression.as_deref(),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::questionnaire::answer::Coding;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    #[test]
    fn deserializes_enable_when() {
        let item: QuestionnaireItem = serde_json::from_value(json!({
            "linkId": "smoking-details",
            "type": "group",
            "enableWhen": [{
                "question": "smoker",
                "operator": "=",
                "answerCoding": {"system": "http://snomed.info/sct", "code": "77176002"}
            }],
            "enableBehavior": "any"
        }))
        .unwrap();

        assert_eq!(item.enable_behavior, Some(EnableBehavior::Any));
        let condition = &item.enable_when[0];
        assert_eq!(condition.operator, EnableWhenOperator::Equal);
        assert_eq!(
            condition.answer,
            AnswerValue::Coding(Coding::new("http://snomed.info/sct", "77176002"))
        );
    }

    #[test]
    fn answer_options_round_trip_their_extras() {
        let raw = json!({"valueString": "Other", "extension": [{"url": "x", "valueBoolean": true}]});
        let option: AnswerOption = serde_json::from_value(raw.clone()).unwrap();
        assert_eq!(option.value, AnswerValue::String("Other".into()));
        assert_eq!(serde_json::to_value(option).unwrap(), raw);
    }

    #[test]
    fn enable_when_without_answer_is_rejected() {
        let result: Result<EnableWhen, _> =
            serde_json::from_value(json!({"question": "a", "operator": "exists"}));
        assert!(result.is_err());
    }

    #[test]
    fn item_types_use_fhir_codes() {
        let item: QuestionnaireItem =
            serde_json::from_value(json!({"linkId": "a", "type": "open-choice"})).unwrap();
        assert_eq!(item.item_type, ItemType::OpenChoice);
        let item: QuestionnaireItem =
            serde_json::from_value(json!({"linkId": "b", "type": "dateTime"})).unwrap();
        assert_eq!(item.item_type, ItemType::DateTime);
    }
}
