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

//! Core value types for FHIRPath expressions

use chrono::{DateTime, FixedOffset, NaiveDate, NaiveTime};
use rust_decimal::Decimal;
use rust_decimal::prelude::ToPrimitive;
use serde_json::{Map, Value};
use std::cmp::Ordering;
use std::fmt;
use std::ops::Deref;
use std::str::FromStr;
use std::sync::Arc;

/// Quantity value with optional unit
#[derive(Debug, Clone, PartialEq)]
pub struct Quantity {
    /// Numeric value
    pub value: Decimal,
    /// UCUM code or calendar keyword
    pub unit: Option<String>,
}

impl Quantity {
    /// Create a new quantity
    pub fn new(value: Decimal, unit: Option<String>) -> Self {
        Self { value, unit }
    }

    /// Units compare equal when both are absent, `'1'`, or textually identical
    fn same_unit(&self, other: &Quantity) -> bool {
        let normalize = |unit: &Option<String>| match unit.as_deref() {
            None | Some("1") | Some("") => None,
            Some(u) => Some(u.to_string()),
        };
        normalize(&self.unit) == normalize(&other.unit)
    }

    fn to_json(&self) -> Value {
        let mut map = Map::new();
        map.insert("value".to_string(), decimal_to_json(self.value));
        if let Some(unit) = &self.unit {
            map.insert("unit".to_string(), Value::String(unit.clone()));
            map.insert("code".to_string(), Value::String(unit.clone()));
            map.insert(
                "system".to_string(),
                Value::String("http://unitsofmeasure.org".to_string()),
            );
        }
        Value::Object(map)
    }
}

impl fmt::Display for Quantity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.unit {
            Some(unit) => write!(f, "{} '{}'", self.value.normalize(), unit),
            None => write!(f, "{}", self.value.normalize()),
        }
    }
}

/// Core value type for FHIRPath expressions
///
/// Temporal values keep their ISO text so that partial dates (`2024`, `2024-03`) survive
/// unchanged. Complex FHIR elements and resources are shared JSON objects.
#[derive(Debug, Clone, PartialEq)]
pub enum FhirPathValue {
    /// Boolean value
    Boolean(bool),
    /// Integer value (64-bit signed)
    Integer(i64),
    /// Decimal value with arbitrary precision
    Decimal(Decimal),
    /// String value
    String(String),
    /// Date value as ISO text
    Date(String),
    /// DateTime value as ISO text
    DateTime(String),
    /// Time value as ISO text
    Time(String),
    /// Quantity value
    Quantity(Quantity),
    /// FHIR resource or complex element
    Resource(Arc<Value>),
}

/// Ordered FHIRPath collection
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Collection(Vec<FhirPathValue>);

impl Collection {
    /// Create a new empty collection
    pub fn new() -> Self {
        Self(Vec::new())
    }

    /// Create a collection from a vector
    pub fn from_vec(values: Vec<FhirPathValue>) -> Self {
        Self(values)
    }

    /// Collection holding exactly one value
    pub fn single(value: FhirPathValue) -> Self {
        Self(vec![value])
    }

    /// Singleton boolean collection
    pub fn boolean(value: bool) -> Self {
        Self::single(FhirPathValue::Boolean(value))
    }

    /// Push a value to the collection
    pub fn push(&mut self, value: FhirPathValue) {
        self.0.push(value);
    }

    /// Extend the collection with another
    pub fn extend(&mut self, other: Collection) {
        self.0.extend(other.0);
    }

    /// Take ownership of the inner vector
    pub fn into_vec(self) -> Vec<FhirPathValue> {
        self.0
    }

    /// Membership by FHIRPath equality
    pub fn contains_value(&self, value: &FhirPathValue) -> bool {
        self.0.iter().any(|v| v.equals(value))
    }

    /// Convert a JSON value into a collection; arrays are flattened and `null` is empty
    pub fn from_json(value: &Value) -> Self {
        let mut collection = Collection::new();
        collection.push_json(value);
        collection
    }

    fn push_json(&mut self, value: &Value) {
        match value {
            Value::Null => {}
            Value::Array(items) => items.iter().for_each(|item| self.push_json(item)),
            other => {
                if let Some(v) = FhirPathValue::from_json(other) {
                    self.push(v);
                }
            }
        }
    }

    /// JSON array of the collection's values
    pub fn to_json(&self) -> Value {
        Value::Array(self.0.iter().map(FhirPathValue::to_json).collect())
    }
}

impl Deref for Collection {
    type Target = [FhirPathValue];

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl From<Vec<FhirPathValue>> for Collection {
    fn from(values: Vec<FhirPathValue>) -> Self {
        Self(values)
    }
}

impl FromIterator<FhirPathValue> for Collection {
    fn from_iter<I: IntoIterator<Item = FhirPathValue>>(iter: I) -> Self {
        Self(iter.into_iter().collect())
    }
}

impl IntoIterator for Collection {
    type Item = FhirPathValue;
    type IntoIter = std::vec::IntoIter<FhirPathValue>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.into_iter()
    }
}

impl<'a> IntoIterator for &'a Collection {
    type Item = &'a FhirPathValue;
    type IntoIter = std::slice::Iter<'a, FhirPathValue>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.iter()
    }
}

/// Convert a decimal to a JSON number without a trailing `.0` for whole values
pub fn decimal_to_json(value: Decimal) -> Value {
    let text = value.normalize().to_string();
    serde_json::Number::from_str(&text)
        .map(Value::Number)
        .or_else(|_| {
            value
                .to_f64()
                .and_then(serde_json::Number::from_f64)
                .map(Value::Number)
                .ok_or(())
        })
        .unwrap_or(Value::String(text))
}

/// Convert a JSON number to a decimal
pub fn json_number_to_decimal(number: &serde_json::Number) -> Option<Decimal> {
    Decimal::from_str(&number.to_string())
        .ok()
        .or_else(|| number.as_f64().and_then(|f| Decimal::try_from(f).ok()))
}

impl FhirPathValue {
    /// Convert a single JSON value; `null` and arrays have no single-value form
    pub fn from_json(value: &Value) -> Option<Self> {
        match value {
            Value::Null | Value::Array(_) => None,
            Value::Bool(b) => Some(Self::Boolean(*b)),
            Value::Number(n) => match n.as_i64() {
                Some(i) => Some(Self::Integer(i)),
                None => json_number_to_decimal(n).map(Self::Decimal),
            },
            Value::String(s) => Some(Self::String(s.clone())),
            Value::Object(_) => Some(Self::Resource(Arc::new(value.clone()))),
        }
    }

    /// Wrap a JSON object without copying the caller's `Arc`
    pub fn resource(value: Arc<Value>) -> Self {
        Self::Resource(value)
    }

    /// JSON form of the value
    pub fn to_json(&self) -> Value {
        match self {
            Self::Boolean(b) => Value::Bool(*b),
            Self::Integer(i) => Value::Number((*i).into()),
            Self::Decimal(d) => decimal_to_json(*d),
            Self::String(s) | Self::Date(s) | Self::DateTime(s) | Self::Time(s) => {
                Value::String(s.clone())
            }
            Self::Quantity(q) => q.to_json(),
            Self::Resource(r) => r.as_ref().clone(),
        }
    }

    /// Underlying JSON object of a complex value
    pub fn as_object(&self) -> Option<&Map<String, Value>> {
        match self {
            Self::Resource(r) => r.as_object(),
            _ => None,
        }
    }

    /// String content of string-like values
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::String(s) | Self::Date(s) | Self::DateTime(s) | Self::Time(s) => Some(s),
            _ => None,
        }
    }

    /// Numeric value as a decimal
    pub fn as_decimal(&self) -> Option<Decimal> {
        match self {
            Self::Integer(i) => Some(Decimal::from(*i)),
            Self::Decimal(d) => Some(*d),
            _ => None,
        }
    }

    /// Quantity form of a literal quantity or a FHIR `Quantity` element
    pub fn as_quantity(&self) -> Option<Quantity> {
        match self {
            Self::Quantity(q) => Some(q.clone()),
            Self::Resource(r) => {
                let value = match r.get("value")? {
                    Value::Number(n) => json_number_to_decimal(n)?,
                    _ => return None,
                };
                let unit = r
                    .get("code")
                    .or_else(|| r.get("unit"))
                    .and_then(Value::as_str)
                    .map(str::to_string);
                Some(Quantity::new(value, unit))
            }
            _ => None,
        }
    }

    /// FHIRPath type name; complex values are classified by `resourceType` or shape
    pub fn type_name(&self) -> &str {
        match self {
            Self::Boolean(_) => "Boolean",
            Self::Integer(_) => "Integer",
            Self::Decimal(_) => "Decimal",
            Self::String(_) => "String",
            Self::Date(_) => "Date",
            Self::DateTime(_) => "DateTime",
            Self::Time(_) => "Time",
            Self::Quantity(_) => "Quantity",
            Self::Resource(r) => {
                if let Some(resource_type) = r.get("resourceType").and_then(Value::as_str) {
                    resource_type
                } else if r.get("coding").is_some() {
                    "CodeableConcept"
                } else if r.get("reference").is_some() {
                    "Reference"
                } else if r.get("code").is_some() && r.get("value").is_none() {
                    "Coding"
                } else if r.get("value").is_some_and(Value::is_number) {
                    "Quantity"
                } else {
                    "Element"
                }
            }
        }
    }

    /// Type test used by `is`, `as` and `ofType`
    pub fn is_type(&self, type_name: &str) -> bool {
        let actual = self.type_name();
        if actual.eq_ignore_ascii_case(type_name) {
            return true;
        }
        match self {
            // FHIR primitive aliases
            Self::String(_) => matches!(
                type_name,
                "string" | "code" | "uri" | "url" | "canonical" | "id" | "markdown" | "oid"
            ),
            Self::Integer(_) => matches!(type_name, "positiveInt" | "unsignedInt"),
            Self::Resource(_) => type_name == "Resource" || type_name == "Element",
            _ => false,
        }
    }

    /// Primitive values have a `hasValue()`; complex values do not
    pub fn is_primitive(&self) -> bool {
        !matches!(self, Self::Resource(_))
    }

    fn is_temporal(&self) -> bool {
        matches!(self, Self::Date(_) | Self::DateTime(_) | Self::Time(_))
    }

    /// FHIRPath equality (`=`)
    pub fn equals(&self, other: &FhirPathValue) -> bool {
        use FhirPathValue::*;
        match (self, other) {
            (Boolean(a), Boolean(b)) => a == b,
            (Integer(a), Integer(b)) => a == b,
            (Integer(_) | Decimal(_), Integer(_) | Decimal(_)) => {
                self.as_decimal() == other.as_decimal()
            }
            (Quantity(_), _) | (_, Quantity(_)) => match (self.as_quantity(), other.as_quantity())
            {
                (Some(a), Some(b)) => a.same_unit(&b) && a.value == b.value,
                _ => false,
            },
            (Resource(a), Resource(b)) => a == b,
            _ if self.is_temporal() || other.is_temporal() => {
                compare_temporal(self, other) == Some(Ordering::Equal)
            }
            _ => match (self.as_str(), other.as_str()) {
                (Some(a), Some(b)) => a == b,
                _ => false,
            },
        }
    }

    /// FHIRPath equivalence (`~`): case and whitespace insensitive strings, decimals
    /// compared at the lower precision
    pub fn equivalent(&self, other: &FhirPathValue) -> bool {
        use FhirPathValue::*;
        match (self, other) {
            (String(a), String(b)) => normalize_whitespace(a) == normalize_whitespace(b),
            (Integer(_) | Decimal(_), Integer(_) | Decimal(_)) => {
                match (self.as_decimal(), other.as_decimal()) {
                    (Some(a), Some(b)) => {
                        let scale = a.scale().min(b.scale());
                        a.round_dp(scale) == b.round_dp(scale)
                    }
                    _ => false,
                }
            }
            (Resource(a), Resource(b)) => {
                // Codings are equivalent on system and code
                match (a.get("code"), b.get("code")) {
                    (Some(ca), Some(cb)) => ca == cb && a.get("system") == b.get("system"),
                    _ => a == b,
                }
            }
            _ => self.equals(other),
        }
    }

    /// Ordering for `<`, `>`, `<=`, `>=`; `None` when the values are not comparable
    pub fn compare(&self, other: &FhirPathValue) -> Option<Ordering> {
        use FhirPathValue::*;
        match (self, other) {
            (Integer(a), Integer(b)) => Some(a.cmp(b)),
            (Integer(_) | Decimal(_), Integer(_) | Decimal(_)) => {
                Some(self.as_decimal()?.cmp(&other.as_decimal()?))
            }
            (Quantity(_), _) | (_, Quantity(_)) => {
                let (a, b) = (self.as_quantity()?, other.as_quantity()?);
                a.same_unit(&b).then(|| a.value.cmp(&b.value))
            }
            (String(a), String(b)) => Some(a.cmp(b)),
            _ if self.is_temporal() || other.is_temporal() => compare_temporal(self, other),
            _ => None,
        }
    }

    /// Text used by `toString()` and `&`
    pub fn to_display_string(&self) -> String {
        match self {
            Self::Boolean(b) => b.to_string(),
            Self::Integer(i) => i.to_string(),
            Self::Decimal(d) => d.to_string(),
            Self::String(s) | Self::Date(s) | Self::DateTime(s) | Self::Time(s) => s.clone(),
            Self::Quantity(q) => q.to_string(),
            Self::Resource(r) => r.to_string(),
        }
    }
}

impl fmt::Display for FhirPathValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Date(d) | Self::DateTime(d) => write!(f, "@{d}"),
            Self::Time(t) => write!(f, "@T{t}"),
            other => f.write_str(&other.to_display_string()),
        }
    }
}

fn normalize_whitespace(s: &str) -> String {
    s.split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .to_lowercase()
}

/// Compare temporal values; values of different precision are incomparable
fn compare_temporal(a: &FhirPathValue, b: &FhirPathValue) -> Option<Ordering> {
    let (left, right) = (a.as_str()?, b.as_str()?);

    if let (Some(x), Some(y)) = (parse_datetime(left), parse_datetime(right)) {
        return Some(x.cmp(&y));
    }
    if let (Ok(x), Ok(y)) = (
        NaiveDate::parse_from_str(left, "%Y-%m-%d"),
        NaiveDate::parse_from_str(right, "%Y-%m-%d"),
    ) {
        return Some(x.cmp(&y));
    }
    if let (Some(x), Some(y)) = (parse_time(left), parse_time(right)) {
        return Some(x.cmp(&y));
    }
    (left.len() == right.len()).then(|| left.cmp(right))
}

fn parse_datetime(text: &str) -> Option<DateTime<FixedOffset>> {
    DateTime::parse_from_rfc3339(text).ok()
}

fn parse_time(text: &str) -> Option<NaiveTime> {
    NaiveTime::parse_from_str(text, "%H:%M:%S%.f")
        .or_else(|_| NaiveTime::parse_from_str(text, "%H:%M"))
        .ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    fn d(text: &str) -> Decimal {
        Decimal::from_str(text).unwrap()
    }

    #[test]
    fn test_from_json_flattens_arrays() {
        let collection = Collection::from_json(&json!([1, "a", null, [true, 2.5]]));
        assert_eq!(
            collection.into_vec(),
            vec![
                FhirPathValue::Integer(1),
                FhirPathValue::String("a".to_string()),
                FhirPathValue::Boolean(true),
                FhirPathValue::Decimal(d("2.5")),
            ]
        );
    }

    #[test]
    fn test_numeric_equality_across_types() {
        assert!(FhirPathValue::Integer(2).equals(&FhirPathValue::Decimal(d("2.0"))));
        assert_eq!(
            FhirPathValue::Integer(2).compare(&FhirPathValue::Decimal(d("2.5"))),
            Some(Ordering::Less)
        );
    }

    #[test]
    fn test_temporal_comparison() {
        let date = FhirPathValue::Date("2024-01-15".to_string());
        let from_json = FhirPathValue::String("2024-03-01".to_string());
        assert_eq!(from_json.compare(&date), Some(Ordering::Greater));
        let year = FhirPathValue::Date("2024".to_string());
        assert_eq!(year.compare(&date), None);
        let a = FhirPathValue::DateTime("2024-01-15T10:00:00+10:00".to_string());
        let b = FhirPathValue::DateTime("2024-01-15T00:00:00Z".to_string());
        assert!(a.equals(&b));
    }

    #[test]
    fn test_quantity_from_fhir_element() {
        let element = FhirPathValue::from_json(&json!({"value": 72.5, "unit": "kg", "code": "kg"}))
            .unwrap();
        assert_eq!(element.type_name(), "Quantity");
        let literal = FhirPathValue::Quantity(Quantity::new(d("72.5"), Some("kg".to_string())));
        assert!(element.equals(&literal));
    }

    #[test]
    fn test_type_inference_for_elements() {
        let coding = FhirPathValue::from_json(&json!({"system": "http://loinc.org", "code": "1"}))
            .unwrap();
        assert!(coding.is_type("Coding"));
        let cc = FhirPathValue::from_json(&json!({"coding": []})).unwrap();
        assert!(cc.is_type("CodeableConcept"));
        let qr = FhirPathValue::from_json(&json!({"resourceType": "QuestionnaireResponse"}))
            .unwrap();
        assert!(qr.is_type("QuestionnaireResponse"));
        assert!(FhirPathValue::String("x".to_string()).is_type("code"));
    }

    #[test]
    fn test_equivalence() {
        let a = FhirPathValue::String("Hello  World".to_string());
        let b = FhirPathValue::String("hello world".to_string());
        assert!(a.equivalent(&b));
        assert!(!a.equals(&b));
        assert!(FhirPathValue::Decimal(d("1.2")).equivalent(&FhirPathValue::Decimal(d("1.23"))));
    }

    #[test]
    fn test_decimal_to_json() {
        assert_eq!(decimal_to_json(d("24.50")), json!(24.5));
        assert_eq!(decimal_to_json(d("70.0")), json!(70));
    }
}
