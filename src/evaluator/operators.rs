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

//! Binary and unary operator semantics

use crate::ast::{BinaryOperator, UnaryOperator};
use crate::error::{EngineError, Result};
use crate::model::{Collection, FhirPathValue, Quantity};
use chrono::{DateTime, Days, Duration, Months, NaiveDate, SecondsFormat};
use rust_decimal::Decimal;
use std::cmp::Ordering;

/// Collapse a collection to an optional boolean using singleton evaluation
pub fn to_boolean(collection: &Collection) -> Result<Option<bool>> {
    match collection.len() {
        0 => Ok(None),
        1 => Ok(Some(match &collection[0] {
            FhirPathValue::Boolean(b) => *b,
            _ => true,
        })),
        n => Err(EngineError::evaluation(format!(
            "expected a single boolean, got a collection of {n} items"
        ))),
    }
}

/// Single item of a collection; more than one item is an error
pub fn singleton<'a>(collection: &'a Collection, what: &str) -> Result<Option<&'a FhirPathValue>> {
    match collection.len() {
        0 => Ok(None),
        1 => Ok(Some(&collection[0])),
        n => Err(EngineError::evaluation(format!(
            "{what} requires a single item, got {n}"
        ))),
    }
}

fn from_bool(value: Option<bool>) -> Collection {
    value.map(Collection::boolean).unwrap_or_default()
}

fn overflow(op: BinaryOperator) -> EngineError {
    EngineError::evaluation(format!("arithmetic overflow in '{op}'"))
}

/// Evaluate a binary operator over two already evaluated operands
pub fn evaluate_binary(op: BinaryOperator, left: &Collection, right: &Collection) -> Result<Collection> {
    use BinaryOperator::*;
    match op {
        And => {
            let (l, r) = (to_boolean(left)?, to_boolean(right)?);
            Ok(from_bool(match (l, r) {
                (Some(false), _) | (_, Some(false)) => Some(false),
                (Some(true), Some(true)) => Some(true),
                _ => None,
            }))
        }
        Or => {
            let (l, r) = (to_boolean(left)?, to_boolean(right)?);
            Ok(from_bool(match (l, r) {
                (Some(true), _) | (_, Some(true)) => Some(true),
                (Some(false), Some(false)) => Some(false),
                _ => None,
            }))
        }
        Xor => {
            let (l, r) = (to_boolean(left)?, to_boolean(right)?);
            Ok(from_bool(match (l, r) {
                (Some(a), Some(b)) => Some(a != b),
                _ => None,
            }))
        }
        Implies => {
            let (l, r) = (to_boolean(left)?, to_boolean(right)?);
            Ok(from_bool(match (l, r) {
                (Some(true), r) => r,
                (Some(false), _) => Some(true),
                (None, Some(true)) => Some(true),
                (None, _) => None,
            }))
        }
        Equal | NotEqual => {
            if left.is_empty() || right.is_empty() {
                return Ok(Collection::new());
            }
            let equal = left.len() == right.len()
                && left.iter().zip(right.iter()).all(|(a, b)| a.equals(b));
            Ok(Collection::boolean(if op == Equal { equal } else { !equal }))
        }
        Equivalent | NotEquivalent => {
            let equivalent = left.len() == right.len()
                && left
                    .iter()
                    .all(|a| right.iter().any(|b| a.equivalent(b)));
            Ok(Collection::boolean(if op == Equivalent {
                equivalent
            } else {
                !equivalent
            }))
        }
        LessThan | LessThanOrEqual | GreaterThan | GreaterThanOrEqual => {
            let (Some(a), Some(b)) = (
                singleton(left, op.as_str())?,
                singleton(right, op.as_str())?,
            ) else {
                return Ok(Collection::new());
            };
            let Some(ordering) = a.compare(b) else {
                return Ok(Collection::new());
            };
            let result = match op {
                LessThan => ordering == Ordering::Less,
                LessThanOrEqual => ordering != Ordering::Greater,
                GreaterThan => ordering == Ordering::Greater,
                _ => ordering != Ordering::Less,
            };
            Ok(Collection::boolean(result))
        }
        Concatenate => {
            let text = |c: &Collection| -> Result<String> {
                Ok(singleton(c, "&")?
                    .map(FhirPathValue::to_display_string)
                    .unwrap_or_default())
            };
            Ok(Collection::single(FhirPathValue::String(
                text(left)? + &text(right)?,
            )))
        }
        Union => {
            let mut result = Collection::new();
            for value in left.iter().chain(right.iter()) {
                if !result.contains_value(value) {
                    result.push(value.clone());
                }
            }
            Ok(result)
        }
        In | Contains => {
            let (needle, haystack) = if op == In {
                (left, right)
            } else {
                (right, left)
            };
            match singleton(needle, op.as_str())? {
                Some(value) => Ok(Collection::boolean(haystack.contains_value(value))),
                None => Ok(Collection::new()),
            }
        }
        Add | Subtract | Multiply | Divide | IntegerDivide | Modulo => {
            let (Some(a), Some(b)) = (
                singleton(left, op.as_str())?,
                singleton(right, op.as_str())?,
            ) else {
                return Ok(Collection::new());
            };
            Ok(arithmetic(op, a, b)?
                .map(Collection::single)
                .unwrap_or_default())
        }
    }
}

fn arithmetic(op: BinaryOperator, a: &FhirPathValue, b: &FhirPathValue) -> Result<Option<FhirPathValue>> {
    use BinaryOperator::*;
    use FhirPathValue as V;

    match (a, b) {
        (V::Integer(x), V::Integer(y)) => {
            let value = match op {
                Add => x.checked_add(*y).map(V::Integer),
                Subtract => x.checked_sub(*y).map(V::Integer),
                Multiply => x.checked_mul(*y).map(V::Integer),
                Divide => {
                    if *y == 0 {
                        return Ok(None);
                    }
                    Decimal::from(*x)
                        .checked_div(Decimal::from(*y))
                        .map(V::Decimal)
                }
                IntegerDivide => {
                    if *y == 0 {
                        return Ok(None);
                    }
                    x.checked_div(*y).map(V::Integer)
                }
                Modulo => {
                    if *y == 0 {
                        return Ok(None);
                    }
                    x.checked_rem(*y).map(V::Integer)
                }
                _ => None,
            };
            value.map(Some).ok_or_else(|| overflow(op))
        }
        (V::Integer(_) | V::Decimal(_), V::Integer(_) | V::Decimal(_)) => {
            let (x, y) = match (a.as_decimal(), b.as_decimal()) {
                (Some(x), Some(y)) => (x, y),
                _ => return Ok(None),
            };
            if matches!(op, Divide | IntegerDivide | Modulo) && y.is_zero() {
                return Ok(None);
            }
            let value = match op {
                Add => x.checked_add(y).map(V::Decimal),
                Subtract => x.checked_sub(y).map(V::Decimal),
                Multiply => x.checked_mul(y).map(V::Decimal),
                Divide => x.checked_div(y).map(V::Decimal),
                IntegerDivide => x
                    .checked_div(y)
                    .and_then(|q| i64::try_from(q.trunc()).ok())
                    .map(V::Integer),
                Modulo => x.checked_rem(y).map(V::Decimal),
                _ => None,
            };
            value.map(Some).ok_or_else(|| overflow(op))
        }
        (V::String(x), V::String(y)) if op == Add => Ok(Some(V::String(format!("{x}{y}")))),
        (V::Date(_) | V::DateTime(_) | V::String(_), _) if matches!(op, Add | Subtract) => {
            let Some(quantity) = b.as_quantity() else {
                return Err(type_error(op, a, b));
            };
            let sign = if op == Add { 1 } else { -1 };
            shift_temporal(a, &quantity, sign)
                .map(Some)
                .ok_or_else(|| type_error(op, a, b))
        }
        _ => match (a.as_quantity(), b.as_quantity()) {
            (Some(x), Some(y)) if matches!(op, Add | Subtract) && same_unit(&x, &y) => {
                let value = if op == Add {
                    x.value.checked_add(y.value)
                } else {
                    x.value.checked_sub(y.value)
                };
                value
                    .map(|v| Some(V::Quantity(Quantity::new(v, x.unit.clone()))))
                    .ok_or_else(|| overflow(op))
            }
            (Some(q), None) if matches!(op, Multiply | Divide) => {
                let Some(factor) = b.as_decimal() else {
                    return Err(type_error(op, a, b));
                };
                if op == Divide && factor.is_zero() {
                    return Ok(None);
                }
                let value = if op == Multiply {
                    q.value.checked_mul(factor)
                } else {
                    q.value.checked_div(factor)
                };
                value
                    .map(|v| Some(V::Quantity(Quantity::new(v, q.unit.clone()))))
                    .ok_or_else(|| overflow(op))
            }
            _ => Err(type_error(op, a, b)),
        },
    }
}

fn same_unit(a: &Quantity, b: &Quantity) -> bool {
    a.unit.as_deref().unwrap_or("1") == b.unit.as_deref().unwrap_or("1")
}

fn type_error(op: BinaryOperator, a: &FhirPathValue, b: &FhirPathValue) -> EngineError {
    EngineError::evaluation(format!(
        "cannot apply '{op}' to {} and {}",
        a.type_name(),
        b.type_name()
    ))
}

/// Add a calendar duration to a full date or date-time
fn shift_temporal(value: &FhirPathValue, quantity: &Quantity, sign: i64) -> Option<FhirPathValue> {
    let text = value.as_str()?;
    let amount = i64::try_from(quantity.value.trunc()).ok()?.checked_mul(sign)?;
    let unit = quantity.unit.as_deref().unwrap_or("");

    if let Ok(date) = NaiveDate::parse_from_str(text, "%Y-%m-%d") {
        let shifted = match unit {
            "year" | "years" | "a" => add_months(date, amount.checked_mul(12)?),
            "month" | "months" | "mo" => add_months(date, amount),
            "week" | "weeks" | "wk" => add_days(date, amount.checked_mul(7)?),
            "day" | "days" | "d" => add_days(date, amount),
            _ => None,
        }?;
        return Some(FhirPathValue::Date(shifted.format("%Y-%m-%d").to_string()));
    }

    let datetime = DateTime::parse_from_rfc3339(text).ok()?;
    let shifted = match unit {
        "year" | "years" | "a" => shift_months(datetime, amount.checked_mul(12)?),
        "month" | "months" | "mo" => shift_months(datetime, amount),
        "week" | "weeks" | "wk" => datetime.checked_add_signed(Duration::try_weeks(amount)?),
        "day" | "days" | "d" => datetime.checked_add_signed(Duration::try_days(amount)?),
        "hour" | "hours" | "h" => datetime.checked_add_signed(Duration::try_hours(amount)?),
        "minute" | "minutes" | "min" => {
            datetime.checked_add_signed(Duration::try_minutes(amount)?)
        }
        "second" | "seconds" | "s" => datetime.checked_add_signed(Duration::try_seconds(amount)?),
        _ => None,
    }?;
    Some(FhirPathValue::DateTime(
        shifted.to_rfc3339_opts(SecondsFormat::AutoSi, false),
    ))
}

fn add_months(date: NaiveDate, months: i64) -> Option<NaiveDate> {
    let magnitude = Months::new(u32::try_from(months.unsigned_abs()).ok()?);
    if months >= 0 {
        date.checked_add_months(magnitude)
    } else {
        date.checked_sub_months(magnitude)
    }
}

fn add_days(date: NaiveDate, days: i64) -> Option<NaiveDate> {
    let magnitude = Days::new(days.unsigned_abs());
    if days >= 0 {
        date.checked_add_days(magnitude)
    } else {
        date.checked_sub_days(magnitude)
    }
}

fn shift_months(
    datetime: DateTime<chrono::FixedOffset>,
    months: i64,
) -> Option<DateTime<chrono::FixedOffset>> {
    let magnitude = Months::new(u32::try_from(months.unsigned_abs()).ok()?);
    if months >= 0 {
        datetime.checked_add_months(magnitude)
    } else {
        datetime.checked_sub_months(magnitude)
    }
}

/// Evaluate a unary operator
pub fn evaluate_unary(op: UnaryOperator, operand: &Collection) -> Result<Collection> {
    let Some(value) = singleton(operand, "unary operator")? else {
        return Ok(Collection::new());
    };
    let result = match (op, value) {
        (UnaryOperator::Positive, v @ (FhirPathValue::Integer(_)
        | FhirPathValue::Decimal(_)
        | FhirPathValue::Quantity(_))) => v.clone(),
        (UnaryOperator::Negate, FhirPathValue::Integer(i)) => FhirPathValue::Integer(
            i.checked_neg()
                .ok_or_else(|| EngineError::evaluation("arithmetic overflow in unary '-'"))?,
        ),
        (UnaryOperator::Negate, FhirPathValue::Decimal(d)) => FhirPathValue::Decimal(-*d),
        (UnaryOperator::Negate, FhirPathValue::Quantity(q)) => {
            FhirPathValue::Quantity(Quantity::new(-q.value, q.unit.clone()))
        }
        (op, other) => {
            return Err(EngineError::evaluation(format!(
                "cannot apply unary '{op}' to {}",
                other.type_name()
            )));
        }
    };
    Ok(Collection::single(result))
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use std::str::FromStr;

    fn int(i: i64) -> Collection {
        Collection::single(FhirPathValue::Integer(i))
    }

    fn boolean(b: bool) -> Collection {
        Collection::boolean(b)
    }

    #[test]
    fn three_valued_logic() {
        let empty = Collection::new();
        assert_eq!(evaluate_binary(BinaryOperator::And, &boolean(false), &empty).unwrap(), boolean(false));
        assert_eq!(evaluate_binary(BinaryOperator::And, &boolean(true), &empty).unwrap(), empty);
        assert_eq!(evaluate_binary(BinaryOperator::Or, &empty, &boolean(true)).unwrap(), boolean(true));
        assert_eq!(
            evaluate_binary(BinaryOperator::Implies, &boolean(false), &empty).unwrap(),
            boolean(true)
        );
    }

    #[test]
    fn equality_with_empty_is_empty() {
        let result = evaluate_binary(BinaryOperator::Equal, &int(1), &Collection::new()).unwrap();
        assert!(result.is_empty());
    }

    #[test]
    fn integer_division_by_zero_is_empty() {
        assert!(evaluate_binary(BinaryOperator::Divide, &int(1), &int(0)).unwrap().is_empty());
        assert!(evaluate_binary(BinaryOperator::Modulo, &int(1), &int(0)).unwrap().is_empty());
    }

    #[test]
    fn overflow_is_an_error() {
        assert!(evaluate_binary(BinaryOperator::Add, &int(i64::MAX), &int(1)).is_err());
    }

    #[test]
    fn decimal_arithmetic() {
        let weight = Collection::single(FhirPathValue::Decimal(Decimal::from_str("72.5").unwrap()));
        let result = evaluate_binary(BinaryOperator::Divide, &weight, &int(2)).unwrap();
        assert_eq!(
            result,
            Collection::single(FhirPathValue::Decimal(Decimal::from_str("36.25").unwrap()))
        );
    }

    #[test]
    fn date_minus_years() {
        let date = Collection::single(FhirPathValue::Date("2024-02-29".to_string()));
        let years = Collection::single(FhirPathValue::Quantity(Quantity::new(
            Decimal::from(18),
            Some("years".to_string()),
        )));
        let result = evaluate_binary(BinaryOperator::Subtract, &date, &years).unwrap();
        assert_eq!(
            result,
            Collection::single(FhirPathValue::Date("2006-02-28".to_string()))
        );
    }

    #[test]
    fn union_removes_duplicates() {
        let left: Collection = vec![FhirPathValue::Integer(1), FhirPathValue::Integer(2)].into();
        let right: Collection = vec![FhirPathValue::Integer(2), FhirPathValue::Integer(3)].into();
        assert_eq!(evaluate_binary(BinaryOperator::Union, &left, &right).unwrap().len(), 3);
    }

    #[test]
    fn concatenate_treats_empty_as_empty_string() {
        let left = Collection::single(FhirPathValue::String("a".to_string()));
        let result = evaluate_binary(BinaryOperator::Concatenate, &left, &Collection::new()).unwrap();
        assert_eq!(result, Collection::single(FhirPathValue::String("a".to_string())));
    }

    #[test]
    fn out_of_range_durations_yield_nothing() {
        let date = FhirPathValue::Date("2024-01-01".to_string());
        let days = Quantity::new(Decimal::from(i64::MIN), Some("days".to_string()));
        assert_eq!(shift_temporal(&date, &days, -1), None);
        assert_eq!(shift_temporal(&date, &days, 1), None);
    }
}
