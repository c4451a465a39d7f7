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

//! Terminology server access for `expand`, `memberOf` and `resolve`

pub mod http;
pub mod provider;

pub use http::HttpTerminologyProvider;
pub use provider::TerminologyProvider;

use serde_json::Value;
use std::fmt;
use std::sync::Arc;

/// Value set argument of `expand()`: a canonical URL or an inline `ValueSet` resource
#[derive(Debug, Clone, PartialEq)]
pub enum ValueSetRef {
    /// Canonical URL, expanded with `GET ValueSet/$expand?url=`
    Url(String),
    /// Inline resource, expanded with `POST ValueSet/$expand`
    Resource(Arc<Value>),
}

impl ValueSetRef {
    /// Identifier used in job keys: the URL, or the resource's `id`/`url`
    pub fn key(&self) -> String {
        match self {
            ValueSetRef::Url(url) => url.clone(),
            ValueSetRef::Resource(resource) => resource
                .get("id")
                .or_else(|| resource.get("url"))
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string(),
        }
    }
}

/// Input of `memberOf()`
#[derive(Debug, Clone, PartialEq)]
pub enum CodedValue {
    /// Bare code string
    Code(String),
    /// A single `Coding`
    Coding {
        /// Code system URL
        system: Option<String>,
        /// Code
        code: String,
    },
    /// A `CodeableConcept`, validated as a whole
    CodeableConcept(Arc<Value>),
}

impl CodedValue {
    /// Classify a FHIRPath input item; `None` for values that cannot carry a code
    pub fn from_json(value: &Value) -> Option<Self> {
        match value {
            Value::String(code) => Some(CodedValue::Code(code.clone())),
            Value::Object(object) => {
                if let Some(code) = object.get("code").and_then(Value::as_str) {
                    Some(CodedValue::Coding {
                        system: object
                            .get("system")
                            .and_then(Value::as_str)
                            .map(str::to_string),
                        code: code.to_string(),
                    })
                } else if object.get("coding").is_some_and(Value::is_array) {
                    Some(CodedValue::CodeableConcept(Arc::new(value.clone())))
                } else {
                    None
                }
            }
            _ => None,
        }
    }
}

impl fmt::Display for CodedValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let system_code = |coding: &Value| {
            format!(
                "{}|{}",
                coding.get("system").and_then(Value::as_str).unwrap_or("undefined"),
                coding.get("code").and_then(Value::as_str).unwrap_or("undefined")
            )
        };
        match self {
            CodedValue::Code(code) => f.write_str(code),
            CodedValue::Coding { system, code } => {
                write!(f, "{}|{}", system.as_deref().unwrap_or("undefined"), code)
            }
            CodedValue::CodeableConcept(concept) => {
                let codings: Vec<String> = concept
                    .get("coding")
                    .and_then(Value::as_array)
                    .map(|codings| codings.iter().map(system_code).collect())
                    .unwrap_or_default();
                f.write_str(&codings.join(","))
            }
        }
    }
}

/// Codings listed in a `ValueSet` expansion, nested `contains` flattened in order
pub fn expansion_codings(value_set: &Value) -> Vec<Value> {
    fn collect(contains: &[Value], out: &mut Vec<Value>) {
        for entry in contains {
            if entry.get("code").is_some() {
                let mut coding = serde_json::Map::new();
                for key in ["system", "version", "code", "display"] {
                    if let Some(value) = entry.get(key) {
                        coding.insert(key.to_string(), value.clone());
                    }
                }
                out.push(Value::Object(coding));
            }
            if let Some(nested) = entry.get("contains").and_then(Value::as_array) {
                collect(nested, out);
            }
        }
    }

    let mut codings = Vec::new();
    if let Some(contains) = value_set
        .get("expansion")
        .and_then(|e| e.get("contains"))
        .and_then(Value::as_array)
    {
        collect(contains, &mut codings);
    }
    codings
}

/// Codings of a value set that can be expanded without a server
///
/// Uses an existing `expansion`, otherwise enumerated `compose.include.concept` entries.
/// Returns `None` when the compose uses filters or whole code systems.
pub fn expand_locally(value_set: &Value) -> Option<Vec<Value>> {
    if value_set.get("expansion").is_some() {
        return Some(expansion_codings(value_set));
    }
    let includes = value_set
        .get("compose")?
        .get("include")?
        .as_array()?;
    let mut codings = Vec::new();
    for include in includes {
        let concepts = include.get("concept")?.as_array()?;
        let system = include.get("system").cloned();
        for concept in concepts {
            let mut coding = serde_json::Map::new();
            if let Some(system) = &system {
                coding.insert("system".to_string(), system.clone());
            }
            if let Some(code) = concept.get("code") {
                coding.insert("code".to_string(), code.clone());
            }
            if let Some(display) = concept.get("display") {
                coding.insert("display".to_string(), display.clone());
            }
            codings.push(Value::Object(coding));
        }
    }
    Some(codings)
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    #[test]
    fn coded_value_keys() {
        let coding = CodedValue::from_json(&json!({"system": "http://loinc.org", "code": "LA6576-8"}));
        assert_eq!(coding.unwrap().to_string(), "http://loinc.org|LA6576-8");

        let concept = CodedValue::from_json(&json!({"coding": [
            {"system": "s", "code": "a"},
            {"code": "b"}
        ]}));
        assert_eq!(concept.unwrap().to_string(), "s|a,undefined|b");

        assert!(CodedValue::from_json(&json!(42)).is_none());
    }

    #[test]
    fn flattens_nested_expansion() {
        let vs = json!({
            "resourceType": "ValueSet",
            "expansion": {"contains": [
                {"system": "s", "code": "parent", "display": "Parent", "contains": [
                    {"system": "s", "code": "child"}
                ]},
                {"abstract": true, "contains": [{"system": "s", "code": "other"}]}
            ]}
        });
        let codings = expansion_codings(&vs);
        let codes: Vec<&str> = codings
            .iter()
            .filter_map(|c| c["code"].as_str())
            .collect();
        assert_eq!(codes, vec!["parent", "child", "other"]);
    }

    #[test]
    fn local_expansion_from_compose() {
        let vs = json!({
            "resourceType": "ValueSet",
            "id": "yesno",
            "compose": {"include": [{
                "system": "http://terminology.hl7.org/CodeSystem/v2-0136",
                "concept": [{"code": "Y", "display": "Yes"}, {"code": "N", "display": "No"}]
            }]}
        });
        let codings = expand_locally(&vs).unwrap();
        assert_eq!(codings.len(), 2);
        assert_eq!(codings[1]["display"], "No");

        let filtered = json!({"compose": {"include": [{"system": "http://snomed.info/sct", "filter": []}]}});
        assert!(expand_locally(&filtered).is_none());
    }
}
