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

//! Typed `value[x]` answers

use crate::model::{decimal_to_json, json_number_to_decimal};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::cmp::Ordering;

/// FHIR `Coding`
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Coding {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub system: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub code: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub display: Option<String>,
}

impl Coding {
    pub fn new(system: impl Into<String>, code: impl Into<String>) -> Self {
        Self {
            system: Some(system.into()),
            code: Some(code.into()),
            ..Self::default()
        }
    }

    /// Match on code, and on system when both sides carry one
    pub fn matches(&self, other: &Coding) -> bool {
        if self.code != other.code {
            return false;
        }
        match (&self.system, &other.system) {
            (Some(a), Some(b)) => a == b,
            _ => true,
        }
    }
}

/// FHIR `Quantity`
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Quantity {
    #[serde(
        default,
        skip_serializing_if = "Option::is_none",
        with = "rust_decimal::serde::float_option"
    )]
    pub value: Option<Decimal>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub comparator: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub unit: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub system: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub code: Option<String>,
}

/// FHIR `Reference`
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Reference {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reference: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub display: Option<String>,
}

/// An answer value, tagged by the populated `value[x]` (or `answer[x]`) property
#[derive(Debug, Clone, PartialEq)]
pub enum AnswerValue {
    Boolean(bool),
    Decimal(Decimal),
    Integer(i64),
    Date(String),
    DateTime(String),
    Time(String),
    String(String),
    Uri(String),
    Coding(Coding),
    Quantity(Quantity),
    Reference(Reference),
    Attachment(Value),
}

const SUFFIXES: &[&str] = &[
    "Boolean",
    "Decimal",
    "Integer",
    "Date",
    "DateTime",
    "Time",
    "String",
    "Uri",
    "Coding",
    "Quantity",
    "Reference",
    "Attachment",
];

impl AnswerValue {
    /// Type suffix of the FHIR property (`Coding` for `valueCoding`)
    pub fn type_suffix(&self) -> &'static str {
        match self {
            AnswerValue::Boolean(_) => "Boolean",
            AnswerValue::Decimal(_) => "Decimal",
            AnswerValue::Integer(_) => "Integer",
            AnswerValue::Date(_) => "Date",
            AnswerValue::DateTime(_) => "DateTime",
            AnswerValue::Time(_) => "Time",
            AnswerValue::String(_) => "String",
            AnswerValue::Uri(_) => "Uri",
            AnswerValue::Coding(_) => "Coding",
            AnswerValue::Quantity(_) => "Quantity",
            AnswerValue::Reference(_) => "Reference",
            AnswerValue::Attachment(_) => "Attachment",
        }
    }

    /// Parse the JSON of a single typed property
    pub fn from_typed_json(suffix: &str, value: &Value) -> Result<Self, String> {
        let invalid = || format!("invalid {suffix} value: {value}");
        let text = || value.as_str().map(str::to_string).ok_or_else(invalid);
        Ok(match suffix {
            "Boolean" => AnswerValue::Boolean(value.as_bool().ok_or_else(invalid)?),
            "Decimal" => AnswerValue::Decimal(
                value
                    .as_number()
                    .and_then(json_number_to_decimal)
                    .ok_or_else(invalid)?,
            ),
            "Integer" => AnswerValue::Integer(value.as_i64().ok_or_else(invalid)?),
            "Date" => AnswerValue::Date(text()?),
            "DateTime" => AnswerValue::DateTime(text()?),
            "Time" => AnswerValue::Time(text()?),
            "String" => AnswerValue::String(text()?),
            "Uri" => AnswerValue::Uri(text()?),
            "Coding" => AnswerValue::Coding(
                serde_json::from_value(value.clone()).map_err(|e| e.to_string())?,
            ),
            "Quantity" => AnswerValue::Quantity(
                serde_json::from_value(value.clone()).map_err(|e| e.to_string())?,
            ),
            "Reference" => AnswerValue::Reference(
                serde_json::from_value(value.clone()).map_err(|e| e.to_string())?,
            ),
            "Attachment" => AnswerValue::Attachment(value.clone()),
            other => return Err(format!("unsupported answer type {other}")),
        })
    }

    /// Remove and parse the `<prefix>Xxx` property of `map`
    pub fn take_prefixed(map: &mut Map<String, Value>, prefix: &str) -> Result<Option<Self>, String> {
        for suffix in SUFFIXES {
            let key = format!("{prefix}{suffix}");
            if let Some(value) = map.remove(&key) {
                return Self::from_typed_json(suffix, &value).map(Some);
            }
        }
        Ok(None)
    }

    /// Insert the value as `<prefix>Xxx`
    pub fn write_prefixed(&self, map: &mut Map<String, Value>, prefix: &str) {
        map.insert(format!("{prefix}{}", self.type_suffix()), self.to_json());
    }

    /// JSON of the value without its property name
    pub fn to_json(&self) -> Value {
        match self {
            AnswerValue::Boolean(b) => Value::Bool(*b),
            AnswerValue::Decimal(d) => decimal_to_json(*d),
            AnswerValue::Integer(i) => Value::from(*i),
            AnswerValue::Date(s)
            | AnswerValue::DateTime(s)
            | AnswerValue::Time(s)
            | AnswerValue::String(s)
            | AnswerValue::Uri(s) => Value::String(s.clone()),
            AnswerValue::Coding(c) => serde_json::to_value(c).unwrap_or(Value::Null),
            AnswerValue::Quantity(q) => serde_json::to_value(q).unwrap_or(Value::Null),
            AnswerValue::Reference(r) => serde_json::to_value(r).unwrap_or(Value::Null),
            AnswerValue::Attachment(a) => a.clone(),
        }
    }

    /// Answer as a standalone `{"valueXxx": ...}` object
    pub fn to_answer_json(&self) -> Value {
        let mut map = Map::new();
        self.write_prefixed(&mut map, "value");
        Value::Object(map)
    }

    fn number(&self) -> Option<Decimal> {
        match self {
            AnswerValue::Decimal(d) => Some(*d),
            AnswerValue::Integer(i) => Some(Decimal::from(*i)),
            AnswerValue::Quantity(q) => q.value,
            _ => None,
        }
    }

    fn text(&self) -> Option<&str> {
        match self {
            AnswerValue::Date(s)
            | AnswerValue::DateTime(s)
            | AnswerValue::Time(s)
            | AnswerValue::String(s)
            | AnswerValue::Uri(s) => Some(s),
            _ => None,
        }
    }

    /// Equality used by enableWhen `=` and `!=`
    ///
    /// Numbers compare across integer and decimal, codings by system and code, quantities
    /// by value and by unit code when both sides carry one.
    pub fn matches(&self, other: &AnswerValue) -> bool {
        match (self, other) {
            (AnswerValue::Boolean(a), AnswerValue::Boolean(b)) => a == b,
            (AnswerValue::Coding(a), AnswerValue::Coding(b)) => a.matches(b),
            (AnswerValue::Quantity(a), AnswerValue::Quantity(b)) => {
                let units_agree = match (&a.code, &b.code) {
                    (Some(x), Some(y)) => x == y,
                    _ => true,
                };
                units_agree && a.value == b.value
            }
            (AnswerValue::Reference(a), AnswerValue::Reference(b)) => a.reference == b.reference,
            (AnswerValue::Attachment(a), AnswerValue::Attachment(b)) => a == b,
            _ => match (self.number(), other.number()) {
                (Some(a), Some(b)) => a == b,
                _ => match (self.text(), other.text()) {
                    (Some(a), Some(b)) => a == b,
                    _ => false,
                },
            },
        }
    }

    /// Ordering used by enableWhen `>`, `<`, `>=`, `<=`; `None` across types
    pub fn compare(&self, other: &AnswerValue) -> Option<Ordering> {
        if let (Some(a), Some(b)) = (self.number(), other.number()) {
            return Some(a.cmp(&b));
        }
        match (self, other) {
            (AnswerValue::Date(a), AnswerValue::Date(b))
            | (AnswerValue::DateTime(a), AnswerValue::DateTime(b))
            | (AnswerValue::Date(a), AnswerValue::DateTime(b))
            | (AnswerValue::DateTime(a), AnswerValue::Date(b))
            | (AnswerValue::Time(a), AnswerValue::Time(b))
            | (AnswerValue::String(a), AnswerValue::String(b)) => Some(a.cmp(b)),
            _ => None,
        }
    }

    /// Blank strings count as no answer when persisting
    pub fn is_blank(&self) -> bool {
        matches!(self, AnswerValue::String(s) if s.trim().is_empty())
    }
}
