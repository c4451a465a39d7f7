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

//! FHIR R4 `QuestionnaireResponse` resource

use super::answer::AnswerValue;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// `QuestionnaireResponse` resource
///
/// Only `item` is interpreted; every other property is carried through unchanged.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QuestionnaireResponse {
    #[serde(default = "response_type")]
    pub resource_type: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub item: Vec<QuestionnaireResponseItem>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

fn response_type() -> String {
    "QuestionnaireResponse".to_string()
}

impl Default for QuestionnaireResponse {
    fn default() -> Self {
        Self {
            resource_type: response_type(),
            item: Vec::new(),
            extra: Map::new(),
        }
    }
}

impl QuestionnaireResponse {
    pub fn new(item: Vec<QuestionnaireResponseItem>) -> Self {
        Self {
            item,
            ..Self::default()
        }
    }

    /// JSON form used as `%resource` in expressions
    pub fn to_json(&self) -> Value {
        serde_json::to_value(self).unwrap_or(Value::Null)
    }

    /// First item with `link_id` anywhere in the tree, depth first
    pub fn find(&self, link_id: &str) -> Option<&QuestionnaireResponseItem> {
        find_in(&self.item, link_id)
    }

    /// All items with `link_id`, depth first in document order
    pub fn find_all<'a>(&'a self, link_id: &str) -> Vec<&'a QuestionnaireResponseItem> {
        let mut found = Vec::new();
        collect_in(&self.item, link_id, &mut found);
        found
    }
}

fn find_in<'a>(items: &'a [QuestionnaireResponseItem], link_id: &str) -> Option<&'a QuestionnaireResponseItem> {
    for item in items {
        if item.link_id == link_id {
            return Some(item);
        }
        if let Some(found) = find_in(&item.item, link_id) {
            return Some(found);
        }
        for answer in &item.answer {
            if let Some(found) = find_in(&answer.item, link_id) {
                return Some(found);
            }
        }
    }
    None
}

fn collect_in<'a>(
    items: &'a [QuestionnaireResponseItem],
    link_id: &str,
    found: &mut Vec<&'a QuestionnaireResponseItem>,
) {
    for item in items {
        if item.link_id == link_id {
            found.push(item);
        }
        collect_in(&item.item, link_id, found);
        for answer in &item.answer {
            collect_in(&answer.item, link_id, found);
        }
    }
}

/// `QuestionnaireResponse.item`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QuestionnaireResponseItem {
    pub link_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub answer: Vec<Answer>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub item: Vec<QuestionnaireResponseItem>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl QuestionnaireResponseItem {
    pub fn new(link_id: impl Into<String>) -> Self {
        Self {
            link_id: link_id.into(),
            text: None,
            answer: Vec::new(),
            item: Vec::new(),
            extra: Map::new(),
        }
    }

    /// Item carrying the given answer values
    pub fn with_answers(link_id: impl Into<String>, values: impl IntoIterator<Item = AnswerValue>) -> Self {
        Self {
            answer: values.into_iter().map(Answer::new).collect(),
            ..Self::new(link_id)
        }
    }

    /// Group item carrying the given children
    pub fn with_items(link_id: impl Into<String>, items: Vec<QuestionnaireResponseItem>) -> Self {
        Self {
            item: items,
            ..Self::new(link_id)
        }
    }

    /// No answers and no children: such items are never stored
    pub fn is_empty(&self) -> bool {
        self.answer.is_empty() && self.item.is_empty()
    }

    /// Answer values in order
    pub fn values(&self) -> impl Iterator<Item = &AnswerValue> {
        self.answer.iter().filter_map(|a| a.value.as_ref())
    }
}

/// `QuestionnaireResponse.item.answer`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "Map<String, Value>", into = "Map<String, Value>")]
pub struct Answer {
    pub value: Option<AnswerValue>,
    pub item: Vec<QuestionnaireResponseItem>,
    pub extra: Map<String, Value>,
}

impl Answer {
    pub fn new(value: AnswerValue) -> Self {
        Self {
            value: Some(value),
            item: Vec::new(),
            extra: Map::new(),
        }
    }
}

impl TryFrom<Map<String, Value>> for Answer {
    type Error = String;

    fn try_from(mut map: Map<String, Value>) -> Result<Self, Self::Error> {
        let value = AnswerValue::take_prefixed(&mut map, "value")?;
        let item = match map.remove("item") {
            Some(items) => serde_json::from_value(items).map_err(|e| e.to_string())?,
            None => Vec::new(),
        };
        Ok(Self {
            value,
            item,
            extra: map,
        })
    }
}

impl From<Answer> for Map<String, Value> {
    fn from(answer: Answer) -> Self {
        let mut map = answer.extra;
        if let Some(value) = &answer.value {
            value.write_prefixed(&mut map, "value");
        }
        if !answer.item.is_empty() {
            map.insert(
                "item".to_string(),
                serde_json::to_value(answer.item).unwrap_or(Value::Array(Vec::new())),
            );
        }
        map
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    #[test]
    fn round_trips_response_json() {
        let raw = json!({
            "resourceType": "QuestionnaireResponse",
            "status": "in-progress",
            "item": [{
                "linkId": "bmi-group",
                "item": [
                    {"linkId": "weight", "answer": [{"valueDecimal": 80.5}]},
                    {"linkId": "nested", "answer": [{"valueBoolean": true, "item": [{"linkId": "child", "answer": [{"valueString": "x"}]}]}]}
                ]
            }]
        });
        let response: QuestionnaireResponse = serde_json::from_value(raw.clone()).unwrap();
        assert_eq!(response.to_json(), raw);
        assert_eq!(response.find("child").unwrap().values().count(), 1);
        assert!(response.find("missing").is_none());
    }

    #[test]
    fn empty_items() {
        assert!(QuestionnaireResponseItem::new("a").is_empty());
        assert!(!QuestionnaireResponseItem::with_answers("a", [AnswerValue::Integer(1)]).is_empty());
    }
}
