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

//! Standard function library with eagerly evaluated arguments
//!
//! Functions whose arguments are evaluated per item (`where`, `select`, `all`, ...) live in
//! the evaluator; everything here receives argument collections that were evaluated once.

use super::operators::{singleton, to_boolean};
use crate::error::{EngineError, Result};
use crate::model::{Collection, FhirPathValue, Quantity};
use regex::Regex;
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::{Decimal, MathematicalOps};
use serde_json::Value;
use std::str::FromStr;
use std::sync::Arc;

fn arity(name: &str, args: &[Collection], min: usize, max: usize) -> Result<()> {
    if args.len() < min || args.len() > max {
        let expected = if min == max {
            min.to_string()
        } else {
            format!("{min}..{max}")
        };
        return Err(EngineError::evaluation(format!(
            "{name}() expects {expected} arguments, got {}",
            args.len()
        )));
    }
    Ok(())
}

fn arg_string(args: &[Collection], index: usize, name: &str) -> Result<Option<String>> {
    match args.get(index).map(|a| singleton(a, name)).transpose()?.flatten() {
        Some(value) => match value.as_str() {
            Some(s) => Ok(Some(s.to_string())),
            None => Err(EngineError::evaluation(format!(
                "{name}() expects a string argument, got {}",
                value.type_name()
            ))),
        },
        None => Ok(None),
    }
}

fn arg_integer(args: &[Collection], index: usize, name: &str) -> Result<Option<i64>> {
    match args.get(index).map(|a| singleton(a, name)).transpose()?.flatten() {
        Some(FhirPathValue::Integer(i)) => Ok(Some(*i)),
        Some(other) => Err(EngineError::evaluation(format!(
            "{name}() expects an integer argument, got {}",
            other.type_name()
        ))),
        None => Ok(None),
    }
}

fn input_string<'a>(input: &'a Collection, name: &str) -> Result<Option<&'a str>> {
    match singleton(input, name)? {
        Some(value) => match value {
            FhirPathValue::String(s) => Ok(Some(s)),
            other => Err(EngineError::evaluation(format!(
                "{name}() expects a string input, got {}",
                other.type_name()
            ))),
        },
        None => Ok(None),
    }
}

fn string(s: impl Into<String>) -> Collection {
    Collection::single(FhirPathValue::String(s.into()))
}

fn integer(i: i64) -> Collection {
    Collection::single(FhirPathValue::Integer(i))
}

fn checked_total(numbers: Vec<Decimal>, name: &str) -> Result<Decimal> {
    numbers.into_iter().try_fold(Decimal::ZERO, |total, n| {
        total
            .checked_add(n)
            .ok_or_else(|| EngineError::evaluation(format!("{name}(): overflow")))
    })
}

fn decimal(d: Decimal) -> Collection {
    Collection::single(FhirPathValue::Decimal(d))
}

fn distinct(values: impl IntoIterator<Item = FhirPathValue>) -> Collection {
    let mut result = Collection::new();
    for value in values {
        if !result.contains_value(&value) {
            result.push(value);
        }
    }
    result
}

fn numeric_input(input: &Collection, name: &str) -> Result<Option<FhirPathValue>> {
    match singleton(input, name)? {
        Some(v @ (FhirPathValue::Integer(_) | FhirPathValue::Decimal(_))) => Ok(Some(v.clone())),
        Some(FhirPathValue::Quantity(q)) => Ok(Some(FhirPathValue::Decimal(q.value))),
        Some(other) => Err(EngineError::evaluation(format!(
            "{name}() expects a number, got {}",
            other.type_name()
        ))),
        None => Ok(None),
    }
}

fn regex(pattern: &str, name: &str) -> Result<Regex> {
    Regex::new(pattern).map_err(|e| EngineError::evaluation(format!("{name}(): invalid regex: {e}")))
}

fn to_integer(value: &FhirPathValue) -> Option<i64> {
    match value {
        FhirPathValue::Integer(i) => Some(*i),
        FhirPathValue::Boolean(b) => Some(i64::from(*b)),
        FhirPathValue::String(s) => s.trim().parse().ok(),
        FhirPathValue::Decimal(d) if d.fract().is_zero() => d.to_i64(),
        _ => None,
    }
}

fn to_decimal(value: &FhirPathValue) -> Option<Decimal> {
    match value {
        FhirPathValue::Integer(i) => Some(Decimal::from(*i)),
        FhirPathValue::Decimal(d) => Some(*d),
        FhirPathValue::Boolean(b) => Some(if *b { Decimal::ONE } else { Decimal::ZERO }),
        FhirPathValue::String(s) => Decimal::from_str(s.trim()).ok(),
        _ => None,
    }
}

fn to_bool(value: &FhirPathValue) -> Option<bool> {
    match value {
        FhirPathValue::Boolean(b) => Some(*b),
        FhirPathValue::Integer(1) => Some(true),
        FhirPathValue::Integer(0) => Some(false),
        FhirPathValue::Decimal(d) if *d == Decimal::ONE => Some(true),
        FhirPathValue::Decimal(d) if d.is_zero() => Some(false),
        FhirPathValue::String(s) => match s.to_lowercase().as_str() {
            "true" | "t" | "yes" | "y" | "1" | "1.0" => Some(true),
            "false" | "f" | "no" | "n" | "0" | "0.0" => Some(false),
            _ => None,
        },
        _ => None,
    }
}

/// Direct children of complex values, in property order
pub fn children(input: &Collection) -> Collection {
    let mut result = Collection::new();
    for value in input.iter() {
        if let Some(object) = value.as_object() {
            for (key, child) in object {
                if key != "resourceType" && !key.starts_with('_') {
                    result.extend(Collection::from_json(child));
                }
            }
        }
    }
    result
}

fn aggregate_numbers(input: &Collection, name: &str) -> Result<Vec<Decimal>> {
    input
        .iter()
        .map(|v| {
            v.as_decimal().ok_or_else(|| {
                EngineError::evaluation(format!("{name}() expects numbers, got {}", v.type_name()))
            })
        })
        .collect()
}

fn all_integers(input: &Collection) -> bool {
    input.iter().all(|v| matches!(v, FhirPathValue::Integer(_)))
}

fn number_result(value: Decimal, integral: bool) -> Collection {
    match (integral, value.to_i64()) {
        (true, Some(i)) => integer(i),
        _ => decimal(value),
    }
}

/// Evaluate a standard function; `Ok(None)` when `name` is not a standard function
pub fn call_function(name: &str, input: &Collection, args: &[Collection]) -> Result<Option<Collection>> {
    let result = match name {
        // Existence
        "empty" => {
            arity(name, args, 0, 0)?;
            Collection::boolean(input.is_empty())
        }
        "exists" => {
            arity(name, args, 0, 0)?;
            Collection::boolean(!input.is_empty())
        }
        "count" => {
            arity(name, args, 0, 0)?;
            integer(input.len() as i64)
        }
        "hasValue" => {
            arity(name, args, 0, 0)?;
            Collection::boolean(input.len() == 1 && input[0].is_primitive())
        }
        "not" => {
            arity(name, args, 0, 0)?;
            match to_boolean(input)? {
                Some(b) => Collection::boolean(!b),
                None => Collection::new(),
            }
        }
        "allTrue" | "anyTrue" | "allFalse" | "anyFalse" => {
            arity(name, args, 0, 0)?;
            let flags: Vec<bool> = input
                .iter()
                .map(|v| matches!(v, FhirPathValue::Boolean(true)))
                .collect();
            Collection::boolean(match name {
                "allTrue" => flags.iter().all(|b| *b),
                "anyTrue" => flags.iter().any(|b| *b),
                "allFalse" => input.iter().all(|v| matches!(v, FhirPathValue::Boolean(false))),
                _ => input.iter().any(|v| matches!(v, FhirPathValue::Boolean(false))),
            })
        }
        "isDistinct" => {
            arity(name, args, 0, 0)?;
            Collection::boolean(distinct(input.iter().cloned()).len() == input.len())
        }

        // Subsetting
        "first" => {
            arity(name, args, 0, 0)?;
            input.first().cloned().map(Collection::single).unwrap_or_default()
        }
        "last" => {
            arity(name, args, 0, 0)?;
            input.last().cloned().map(Collection::single).unwrap_or_default()
        }
        "tail" => {
            arity(name, args, 0, 0)?;
            input.iter().skip(1).cloned().collect()
        }
        "skip" => {
            arity(name, args, 1, 1)?;
            let n = arg_integer(args, 0, name)?.unwrap_or(0).max(0) as usize;
            input.iter().skip(n).cloned().collect()
        }
        "take" => {
            arity(name, args, 1, 1)?;
            let n = arg_integer(args, 0, name)?.unwrap_or(0).max(0) as usize;
            input.iter().take(n).cloned().collect()
        }
        "single" => {
            arity(name, args, 0, 0)?;
            singleton(input, name)?
                .cloned()
                .map(Collection::single)
                .unwrap_or_default()
        }
        "distinct" => {
            arity(name, args, 0, 0)?;
            distinct(input.iter().cloned())
        }
        "union" => {
            arity(name, args, 1, 1)?;
            distinct(input.iter().chain(args[0].iter()).cloned())
        }
        "combine" => {
            arity(name, args, 1, 1)?;
            input.iter().chain(args[0].iter()).cloned().collect()
        }
        "intersect" => {
            arity(name, args, 1, 1)?;
            distinct(input.iter().filter(|v| args[0].contains_value(v)).cloned())
        }
        "exclude" => {
            arity(name, args, 1, 1)?;
            input
                .iter()
                .filter(|v| !args[0].contains_value(v))
                .cloned()
                .collect()
        }
        "subsetOf" => {
            arity(name, args, 1, 1)?;
            Collection::boolean(input.iter().all(|v| args[0].contains_value(v)))
        }
        "supersetOf" => {
            arity(name, args, 1, 1)?;
            Collection::boolean(args[0].iter().all(|v| input.contains_value(v)))
        }

        // Conversion
        "toString" => {
            arity(name, args, 0, 0)?;
            match singleton(input, name)? {
                Some(v) if v.is_primitive() => string(v.to_display_string()),
                _ => Collection::new(),
            }
        }
        "toInteger" | "convertsToInteger" => {
            arity(name, args, 0, 0)?;
            let converted = singleton(input, name)?.map(to_integer);
            match (name, converted) {
                (_, None) => Collection::new(),
                ("toInteger", Some(value)) => value.map(integer).unwrap_or_default(),
                (_, Some(value)) => Collection::boolean(value.is_some()),
            }
        }
        "toDecimal" | "convertsToDecimal" => {
            arity(name, args, 0, 0)?;
            let converted = singleton(input, name)?.map(to_decimal);
            match (name, converted) {
                (_, None) => Collection::new(),
                ("toDecimal", Some(value)) => value.map(decimal).unwrap_or_default(),
                (_, Some(value)) => Collection::boolean(value.is_some()),
            }
        }
        "toBoolean" | "convertsToBoolean" => {
            arity(name, args, 0, 0)?;
            let converted = singleton(input, name)?.map(to_bool);
            match (name, converted) {
                (_, None) => Collection::new(),
                ("toBoolean", Some(value)) => value.map(Collection::boolean).unwrap_or_default(),
                (_, Some(value)) => Collection::boolean(value.is_some()),
            }
        }
        "toDate" => {
            arity(name, args, 0, 0)?;
            match singleton(input, name)?.and_then(FhirPathValue::as_str) {
                Some(text) => {
                    let date = text.split('T').next().unwrap_or(text).to_string();
                    Collection::single(FhirPathValue::Date(date))
                }
                None => Collection::new(),
            }
        }
        "toDateTime" => {
            arity(name, args, 0, 0)?;
            match singleton(input, name)?.and_then(FhirPathValue::as_str) {
                Some(text) => Collection::single(FhirPathValue::DateTime(text.to_string())),
                None => Collection::new(),
            }
        }
        "toQuantity" => {
            arity(name, args, 0, 1)?;
            let unit = arg_string(args, 0, name)?;
            match singleton(input, name)? {
                Some(v) => match (v.as_quantity(), v.as_decimal()) {
                    (Some(q), _) => Collection::single(FhirPathValue::Quantity(q)),
                    (None, Some(d)) => {
                        Collection::single(FhirPathValue::Quantity(Quantity::new(d, unit)))
                    }
                    _ => Collection::new(),
                },
                None => Collection::new(),
            }
        }

        // Strings
        "startsWith" | "endsWith" | "contains" => {
            arity(name, args, 1, 1)?;
            match (input_string(input, name)?, arg_string(args, 0, name)?) {
                (Some(s), Some(p)) => Collection::boolean(match name {
                    "startsWith" => s.starts_with(p.as_str()),
                    "endsWith" => s.ends_with(p.as_str()),
                    _ => s.contains(p.as_str()),
                }),
                _ => Collection::new(),
            }
        }
        "matches" | "matchesFull" => {
            arity(name, args, 1, 1)?;
            match (input_string(input, name)?, arg_string(args, 0, name)?) {
                (Some(s), Some(p)) => {
                    let pattern = if name == "matchesFull" {
                        format!("^(?:{p})$")
                    } else {
                        p
                    };
                    Collection::boolean(regex(&pattern, name)?.is_match(s))
                }
                _ => Collection::new(),
            }
        }
        "replace" => {
            arity(name, args, 2, 2)?;
            match (
                input_string(input, name)?,
                arg_string(args, 0, name)?,
                arg_string(args, 1, name)?,
            ) {
                (Some(s), Some(pattern), Some(substitution)) => {
                    string(s.replace(pattern.as_str(), &substitution))
                }
                _ => Collection::new(),
            }
        }
        "replaceMatches" => {
            arity(name, args, 2, 2)?;
            match (
                input_string(input, name)?,
                arg_string(args, 0, name)?,
                arg_string(args, 1, name)?,
            ) {
                (Some(s), Some(pattern), Some(substitution)) => {
                    string(regex(&pattern, name)?.replace_all(s, substitution.as_str()))
                }
                _ => Collection::new(),
            }
        }
        "length" => {
            arity(name, args, 0, 0)?;
            match input_string(input, name)? {
                Some(s) => integer(s.chars().count() as i64),
                None => Collection::new(),
            }
        }
        "substring" => {
            arity(name, args, 1, 2)?;
            let Some(s) = input_string(input, name)? else {
                return Ok(Some(Collection::new()));
            };
            let Some(start) = arg_integer(args, 0, name)? else {
                return Ok(Some(Collection::new()));
            };
            let chars: Vec<char> = s.chars().collect();
            if start < 0 || start as usize >= chars.len() {
                Collection::new()
            } else {
                let start = start as usize;
                let end = match arg_integer(args, 1, name)? {
                    Some(len) => (start + len.max(0) as usize).min(chars.len()),
                    None => chars.len(),
                };
                string(chars[start..end].iter().collect::<String>())
            }
        }
        "upper" | "lower" | "trim" => {
            arity(name, args, 0, 0)?;
            match input_string(input, name)? {
                Some(s) => string(match name {
                    "upper" => s.to_uppercase(),
                    "lower" => s.to_lowercase(),
                    _ => s.trim().to_string(),
                }),
                None => Collection::new(),
            }
        }
        "indexOf" => {
            arity(name, args, 1, 1)?;
            match (input_string(input, name)?, arg_string(args, 0, name)?) {
                (Some(s), Some(needle)) => integer(
                    s.find(needle.as_str())
                        .map(|byte| s[..byte].chars().count() as i64)
                        .unwrap_or(-1),
                ),
                _ => Collection::new(),
            }
        }
        "split" => {
            arity(name, args, 1, 1)?;
            match (input_string(input, name)?, arg_string(args, 0, name)?) {
                (Some(s), Some(separator)) => s
                    .split(separator.as_str())
                    .map(|part| FhirPathValue::String(part.to_string()))
                    .collect(),
                _ => Collection::new(),
            }
        }
        "join" => {
            arity(name, args, 0, 1)?;
            let separator = arg_string(args, 0, name)?.unwrap_or_default();
            let parts: Vec<String> = input.iter().map(FhirPathValue::to_display_string).collect();
            string(parts.join(&separator))
        }
        "toChars" => {
            arity(name, args, 0, 0)?;
            match input_string(input, name)? {
                Some(s) => s
                    .chars()
                    .map(|c| FhirPathValue::String(c.to_string()))
                    .collect(),
                None => Collection::new(),
            }
        }

        // Math
        "abs" | "ceiling" | "floor" | "truncate" | "sqrt" => {
            arity(name, args, 0, 0)?;
            match numeric_input(input, name)? {
                Some(FhirPathValue::Integer(i)) if name != "sqrt" => match name {
                    "abs" => integer(
                        i.checked_abs()
                            .ok_or_else(|| EngineError::evaluation("abs(): overflow"))?,
                    ),
                    _ => integer(i),
                },
                Some(value) => {
                    let d = value.as_decimal().unwrap_or_default();
                    match name {
                        "abs" => decimal(d.abs()),
                        "ceiling" => number_result(d.ceil(), true),
                        "floor" => number_result(d.floor(), true),
                        "truncate" => number_result(d.trunc(), true),
                        _ => d.sqrt().map(decimal).unwrap_or_default(),
                    }
                }
                None => Collection::new(),
            }
        }
        "round" => {
            arity(name, args, 0, 1)?;
            let precision = arg_integer(args, 0, name)?.unwrap_or(0);
            if precision < 0 {
                return Err(EngineError::evaluation("round(): precision must be >= 0"));
            }
            match numeric_input(input, name)? {
                Some(value) => decimal(
                    value
                        .as_decimal()
                        .unwrap_or_default()
                        .round_dp_with_strategy(
                            precision as u32,
                            rust_decimal::RoundingStrategy::MidpointAwayFromZero,
                        ),
                ),
                None => Collection::new(),
            }
        }
        "power" => {
            arity(name, args, 1, 1)?;
            let base = numeric_input(input, name)?;
            let exponent = args[0].first().cloned();
            match (base, exponent) {
                (Some(FhirPathValue::Integer(b)), Some(FhirPathValue::Integer(e))) if e >= 0 => {
                    match u32::try_from(e).ok().and_then(|e| b.checked_pow(e)) {
                        Some(v) => integer(v),
                        None => Collection::new(),
                    }
                }
                (Some(b), Some(e)) => match (b.as_decimal(), e.as_decimal()) {
                    (Some(b), Some(e)) => b.checked_powd(e).map(decimal).unwrap_or_default(),
                    _ => Collection::new(),
                },
                _ => Collection::new(),
            }
        }
        "sum" => {
            arity(name, args, 0, 0)?;
            let total = checked_total(aggregate_numbers(input, name)?, name)?;
            number_result(total, all_integers(input))
        }
        "min" | "max" => {
            arity(name, args, 0, 0)?;
            let mut best: Option<&FhirPathValue> = None;
            for value in input.iter() {
                best = match best {
                    None => Some(value),
                    Some(current) => match value.compare(current) {
                        Some(std::cmp::Ordering::Less) if name == "min" => Some(value),
                        Some(std::cmp::Ordering::Greater) if name == "max" => Some(value),
                        Some(_) => Some(current),
                        None => {
                            return Err(EngineError::evaluation(format!(
                                "{name}(): values are not comparable"
                            )));
                        }
                    },
                };
            }
            best.cloned().map(Collection::single).unwrap_or_default()
        }
        "avg" => {
            arity(name, args, 0, 0)?;
            let numbers = aggregate_numbers(input, name)?;
            if numbers.is_empty() {
                Collection::new()
            } else {
                let count = Decimal::from(numbers.len() as i64);
                let total = checked_total(numbers, name)?;
                total.checked_div(count).map(decimal).unwrap_or_default()
            }
        }

        // Date and time
        "today" => {
            arity(name, args, 0, 0)?;
            Collection::single(FhirPathValue::Date(
                chrono::Local::now().format("%Y-%m-%d").to_string(),
            ))
        }
        "now" => {
            arity(name, args, 0, 0)?;
            Collection::single(FhirPathValue::DateTime(
                chrono::Local::now().to_rfc3339_opts(chrono::SecondsFormat::Millis, false),
            ))
        }
        "timeOfDay" => {
            arity(name, args, 0, 0)?;
            Collection::single(FhirPathValue::Time(
                chrono::Local::now().format("%H:%M:%S").to_string(),
            ))
        }

        // Tree navigation
        "children" => {
            arity(name, args, 0, 0)?;
            children(input)
        }
        "descendants" => {
            arity(name, args, 0, 0)?;
            let mut result = Collection::new();
            let mut frontier = children(input);
            while !frontier.is_empty() {
                let next = children(&frontier);
                result.extend(frontier);
                frontier = next;
            }
            result
        }
        "extension" => {
            arity(name, args, 1, 1)?;
            let Some(url) = arg_string(args, 0, name)? else {
                return Ok(Some(Collection::new()));
            };
            let mut result = Collection::new();
            for value in input.iter() {
                let Some(extensions) = value
                    .as_object()
                    .and_then(|o| o.get("extension"))
                    .and_then(Value::as_array)
                else {
                    continue;
                };
                for extension in extensions {
                    if extension.get("url").and_then(Value::as_str) == Some(url.as_str()) {
                        result.push(FhirPathValue::resource(Arc::new(extension.clone())));
                    }
                }
            }
            result
        }
        "trace" => {
            arity(name, args, 1, 2)?;
            let label = arg_string(args, 0, name)?.unwrap_or_default();
            log::trace!("trace({label}): {:?}", input.to_json());
            input.clone()
        }

        _ => return Ok(None),
    };
    Ok(Some(result))
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    fn s(text: &str) -> Collection {
        string(text)
    }

    fn call(name: &str, input: Collection, args: Vec<Collection>) -> Collection {
        call_function(name, &input, &args).unwrap().unwrap()
    }

    #[test]
    fn unknown_function_is_not_handled() {
        assert!(call_function("frobnicate", &Collection::new(), &[]).unwrap().is_none());
    }

    #[test]
    fn string_functions() {
        assert_eq!(call("substring", s("hello"), vec![integer(1), integer(3)]), s("ell"));
        assert_eq!(call("upper", s("abc"), vec![]), s("ABC"));
        assert_eq!(call("indexOf", s("abcabc"), vec![s("c")]), integer(2));
        assert_eq!(call("length", s("héllo"), vec![]), integer(5));
        assert_eq!(call("matches", s("A-123"), vec![s("[0-9]+")]), Collection::boolean(true));
        assert_eq!(call("matchesFull", s("A-123"), vec![s("[0-9]+")]), Collection::boolean(false));
        assert_eq!(call("replace", s("a.b.c"), vec![s("."), s("/")]), s("a/b/c"));
    }

    #[test]
    fn arity_is_checked() {
        assert!(call_function("substring", &s("x"), &[]).is_err());
        assert!(call_function("count", &s("x"), &[integer(1)]).is_err());
    }

    #[test]
    fn sum_of_empty_is_zero() {
        assert_eq!(call("sum", Collection::new(), vec![]), integer(0));
        let values: Collection = vec![FhirPathValue::Integer(2), FhirPathValue::Integer(3)].into();
        assert_eq!(call("sum", values, vec![]), integer(5));
    }

    #[test]
    fn aggregates_report_overflow() {
        let huge: Collection = vec![FhirPathValue::Decimal(Decimal::MAX), FhirPathValue::Decimal(Decimal::MAX)].into();
        for name in ["sum", "avg"] {
            assert!(matches!(
                call_function(name, &huge, &[]),
                Err(EngineError::Evaluation { .. })
            ));
        }
        let values: Collection = vec![FhirPathValue::Integer(1), FhirPathValue::Integer(2)].into();
        assert_eq!(call("avg", values, vec![]), decimal(Decimal::new(15, 1)));
    }

    #[test]
    fn round_and_power() {
        let bmi = decimal(Decimal::from_str("24.4898").unwrap());
        assert_eq!(
            call("round", bmi, vec![integer(1)]),
            decimal(Decimal::from_str("24.5").unwrap())
        );
        assert_eq!(call("power", integer(2), vec![integer(10)]), integer(1024));
    }

    #[test]
    fn conversions() {
        assert_eq!(call("toInteger", s("42"), vec![]), integer(42));
        assert_eq!(call("toInteger", s("4.2"), vec![]), Collection::new());
        assert_eq!(call("convertsToInteger", s("4.2"), vec![]), Collection::boolean(false));
        assert_eq!(call("toBoolean", s("yes"), vec![]), Collection::boolean(true));
        assert_eq!(call("toString", integer(7), vec![]), s("7"));
    }

    #[test]
    fn extension_filters_by_url() {
        let item = Collection::from_json(&json!({
            "linkId": "a",
            "extension": [
                {"url": "http://example.org/a", "valueString": "x"},
                {"url": "http://example.org/b", "valueString": "y"}
            ]
        }));
        let result = call("extension", item, vec![s("http://example.org/b")]);
        assert_eq!(result.len(), 1);
        assert_eq!(result[0].to_json()["valueString"], "y");
    }

    #[test]
    fn set_operations() {
        let a: Collection = vec![FhirPathValue::Integer(1), FhirPathValue::Integer(2)].into();
        let b: Collection = vec![FhirPathValue::Integer(2)].into();
        assert_eq!(call("exclude", a.clone(), vec![b.clone()]), integer(1));
        assert_eq!(call("intersect", a.clone(), vec![b.clone()]), integer(2));
        assert_eq!(call("subsetOf", b, vec![a]), Collection::boolean(true));
    }
}
