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

//! FHIRPath tree-walking evaluator
//!
//! Evaluation is synchronous. Functions that need a server round trip (`expand`, `resolve`,
//! `memberOf`) are delegated to an [`ExternalFunctions`] hook, which the asynchronous
//! interpreter uses to record pending jobs and replay completed results.

pub mod context;
pub mod functions;
pub mod operators;

pub use context::EvaluationContext;

use crate::ast::{ExpressionNode, LiteralValue, SpecialVariable};
use crate::error::{EngineError, Result};
use crate::model::{Collection, FhirPathValue, Quantity};
use operators::{evaluate_binary, evaluate_unary, singleton, to_boolean};
use rust_decimal::Decimal;
use serde_json::Value;
use std::str::FromStr;

/// Functions that are only available with a terminology or resolve backend
pub const EXTERNAL_FUNCTIONS: &[&str] = &["expand", "resolve", "memberOf"];

/// FHIR type suffixes of choice elements (`value[x]`, `answer[x]`)
const CHOICE_TYPE_SUFFIXES: &[&str] = &[
    "Boolean",
    "Integer",
    "Decimal",
    "String",
    "Date",
    "DateTime",
    "Time",
    "Instant",
    "Uri",
    "Url",
    "Canonical",
    "Code",
    "Id",
    "Markdown",
    "PositiveInt",
    "UnsignedInt",
    "Coding",
    "CodeableConcept",
    "Quantity",
    "Reference",
    "Attachment",
    "Period",
    "Range",
    "Ratio",
    "Identifier",
    "Age",
    "Duration",
    "Expression",
];

/// Hook for functions that the evaluator cannot compute itself
pub trait ExternalFunctions {
    /// Evaluate `name` on `input`; `None` when the function is not handled
    fn call(&self, name: &str, input: &Collection, args: &[Collection]) -> Option<Result<Collection>>;
}

/// Iteration state: `$this`, `$index` and `$total`
#[derive(Debug, Clone, Default)]
pub struct Scope {
    this: Option<FhirPathValue>,
    index: Option<usize>,
    total: Option<Collection>,
}

impl Scope {
    fn item(&self, this: &FhirPathValue, index: usize) -> Self {
        Self {
            this: Some(this.clone()),
            index: Some(index),
            total: self.total.clone(),
        }
    }
}

/// Tree walker over a parsed expression
pub struct Evaluator<'a> {
    context: &'a EvaluationContext,
    root: Collection,
    external: Option<&'a dyn ExternalFunctions>,
}

impl<'a> Evaluator<'a> {
    /// Create an evaluator; `root` backs `%resource` when the context does not bind it
    pub fn new(context: &'a EvaluationContext, root: Collection) -> Self {
        Self {
            context,
            root,
            external: None,
        }
    }

    /// Route `expand`, `resolve` and `memberOf` through `external`
    pub fn with_external(mut self, external: &'a dyn ExternalFunctions) -> Self {
        self.external = Some(external);
        self
    }

    /// Evaluate `node` with the root collection as focus
    pub fn evaluate(&self, node: &ExpressionNode) -> Result<Collection> {
        self.eval(node, &self.root, &Scope::default())
    }

    fn eval(&self, node: &ExpressionNode, focus: &Collection, scope: &Scope) -> Result<Collection> {
        match node {
            ExpressionNode::Literal(literal) => literal_value(literal),
            ExpressionNode::Identifier(name) => Ok(navigate(focus, name)),
            ExpressionNode::Variable(name) => self.variable(name),
            ExpressionNode::Special(special) => Ok(match special {
                SpecialVariable::This => match &scope.this {
                    Some(this) => Collection::single(this.clone()),
                    None => focus.clone(),
                },
                SpecialVariable::Index => scope
                    .index
                    .map(|i| Collection::single(FhirPathValue::Integer(i as i64)))
                    .unwrap_or_default(),
                SpecialVariable::Total => scope.total.clone().unwrap_or_default(),
            }),
            ExpressionNode::Path { base, path } => {
                let base = self.eval(base, focus, scope)?;
                Ok(navigate(&base, path))
            }
            ExpressionNode::Index { base, index } => {
                let base = self.eval(base, focus, scope)?;
                let index = self.eval(index, focus, scope)?;
                match singleton(&index, "indexer")? {
                    Some(FhirPathValue::Integer(i)) if *i >= 0 => Ok(base
                        .get(*i as usize)
                        .cloned()
                        .map(Collection::single)
                        .unwrap_or_default()),
                    Some(FhirPathValue::Integer(_)) | None => Ok(Collection::new()),
                    Some(other) => Err(EngineError::evaluation(format!(
                        "Index must be an integer, got {}",
                        other.type_name()
                    ))),
                }
            }
            ExpressionNode::BinaryOp(data) => {
                let left = self.eval(&data.left, focus, scope)?;
                let right = self.eval(&data.right, focus, scope)?;
                evaluate_binary(data.op, &left, &right)
            }
            ExpressionNode::UnaryOp { op, operand } => {
                let operand = self.eval(operand, focus, scope)?;
                evaluate_unary(*op, &operand)
            }
            ExpressionNode::FunctionCall(data) => {
                self.invoke(&data.name, &data.args, focus, focus, scope)
            }
            ExpressionNode::MethodCall(data) => {
                let input = self.eval(&data.base, focus, scope)?;
                self.invoke(&data.method, &data.args, &input, focus, scope)
            }
            ExpressionNode::TypeCheck {
                expression,
                type_name,
            } => {
                let value = self.eval(expression, focus, scope)?;
                Ok(match singleton(&value, "is")? {
                    Some(v) => Collection::boolean(v.is_type(type_name)),
                    None => Collection::new(),
                })
            }
            ExpressionNode::TypeCast {
                expression,
                type_name,
            } => {
                let value = self.eval(expression, focus, scope)?;
                Ok(value.into_iter().filter(|v| v.is_type(type_name)).collect())
            }
        }
    }

    fn variable(&self, name: &str) -> Result<Collection> {
        if let Some(value) = self.context.get_variable(name) {
            return Ok(value.clone());
        }
        let constant = |s: &str| Ok(Collection::single(FhirPathValue::String(s.to_string())));
        match name {
            "resource" | "rootResource" | "context" => Ok(self.root.clone()),
            "ucum" => constant("http://unitsofmeasure.org"),
            "sct" => constant("http://snomed.info/sct"),
            "loinc" => constant("http://loinc.org"),
            _ => {
                if let Some(id) = name.strip_prefix("vs-") {
                    constant(&format!("http://hl7.org/fhir/ValueSet/{id}"))
                } else if let Some(id) = name.strip_prefix("ext-") {
                    constant(&format!("http://hl7.org/fhir/StructureDefinition/{id}"))
                } else {
                    Err(EngineError::evaluation(format!("Unknown variable %{name}")))
                }
            }
        }
    }

    /// Call `name` on `input`; eager arguments are evaluated against `outer`
    fn invoke(
        &self,
        name: &str,
        args: &[ExpressionNode],
        input: &Collection,
        outer: &Collection,
        scope: &Scope,
    ) -> Result<Collection> {
        match name {
            "where" | "select" | "all" | "repeat" => {
                let criteria = single_arg(name, args)?;
                return self.iterate(name, criteria, input, scope);
            }
            "exists" if !args.is_empty() => {
                let criteria = single_arg(name, args)?;
                let matching = self.iterate("where", criteria, input, scope)?;
                return Ok(Collection::boolean(!matching.is_empty()));
            }
            "iif" => return self.iif(args, outer, scope),
            "ofType" | "is" | "as" => {
                let type_name = single_arg(name, args)?.as_type_name().ok_or_else(|| {
                    EngineError::evaluation(format!("{name}() expects a type name"))
                })?;
                return Ok(match name {
                    "is" => match singleton(input, name)? {
                        Some(v) => Collection::boolean(v.is_type(type_name)),
                        None => Collection::new(),
                    },
                    _ => input.iter().filter(|v| v.is_type(type_name)).cloned().collect(),
                });
            }
            "aggregate" => return self.aggregate(args, input, scope),
            _ => {}
        }

        let evaluated = args
            .iter()
            .map(|arg| self.eval(arg, outer, scope))
            .collect::<Result<Vec<_>>>()?;

        if EXTERNAL_FUNCTIONS.contains(&name) {
            return match self.external {
                Some(external) => external.call(name, input, &evaluated).unwrap_or_else(|| {
                    Err(EngineError::evaluation(format!("{name}() is not available")))
                }),
                None => Err(EngineError::evaluation(format!(
                    "{name}() requires asynchronous evaluation"
                ))),
            };
        }

        if let Some(result) = functions::call_function(name, input, &evaluated)? {
            return Ok(result);
        }
        if let Some(result) = self
            .external
            .and_then(|external| external.call(name, input, &evaluated))
        {
            return result;
        }
        Err(EngineError::evaluation(format!("Unknown function {name}()")))
    }

    fn iterate(
        &self,
        name: &str,
        criteria: &ExpressionNode,
        input: &Collection,
        scope: &Scope,
    ) -> Result<Collection> {
        let mut result = Collection::new();
        match name {
            "where" => {
                for (i, item) in input.iter().enumerate() {
                    let value = self.eval(criteria, &Collection::single(item.clone()), &scope.item(item, i))?;
                    if to_boolean(&value)? == Some(true) {
                        result.push(item.clone());
                    }
                }
            }
            "select" => {
                for (i, item) in input.iter().enumerate() {
                    result.extend(self.eval(
                        criteria,
                        &Collection::single(item.clone()),
                        &scope.item(item, i),
                    )?);
                }
            }
            "all" => {
                for (i, item) in input.iter().enumerate() {
                    let value = self.eval(criteria, &Collection::single(item.clone()), &scope.item(item, i))?;
                    if to_boolean(&value)? != Some(true) {
                        return Ok(Collection::boolean(false));
                    }
                }
                return Ok(Collection::boolean(true));
            }
            _ => {
                // repeat: breadth-first closure without duplicates
                let mut frontier = input.clone();
                while !frontier.is_empty() {
                    let mut next = Collection::new();
                    for (i, item) in frontier.iter().enumerate() {
                        let produced = self.eval(
                            criteria,
                            &Collection::single(item.clone()),
                            &scope.item(item, i),
                        )?;
                        for value in produced {
                            if !result.contains_value(&value) {
                                result.push(value.clone());
                                next.push(value);
                            }
                        }
                    }
                    frontier = next;
                }
            }
        }
        Ok(result)
    }

    fn iif(&self, args: &[ExpressionNode], focus: &Collection, scope: &Scope) -> Result<Collection> {
        if !(2..=3).contains(&args.len()) {
            return Err(EngineError::evaluation(format!(
                "iif() expects 2..3 arguments, got {}",
                args.len()
            )));
        }
        let condition = self.eval(&args[0], focus, scope)?;
        if to_boolean(&condition)? == Some(true) {
            self.eval(&args[1], focus, scope)
        } else if let Some(otherwise) = args.get(2) {
            self.eval(otherwise, focus, scope)
        } else {
            Ok(Collection::new())
        }
    }

    fn aggregate(&self, args: &[ExpressionNode], input: &Collection, scope: &Scope) -> Result<Collection> {
        let Some(aggregator) = args.first() else {
            return Err(EngineError::evaluation("aggregate() expects an aggregator"));
        };
        let mut total = match args.get(1) {
            Some(init) => self.eval(init, input, scope)?,
            None => Collection::new(),
        };
        for (i, item) in input.iter().enumerate() {
            let item_scope = Scope {
                this: Some(item.clone()),
                index: Some(i),
                total: Some(total),
            };
            total = self.eval(aggregator, &Collection::single(item.clone()), &item_scope)?;
        }
        Ok(total)
    }
}

fn single_arg<'n>(name: &str, args: &'n [ExpressionNode]) -> Result<&'n ExpressionNode> {
    match args {
        [arg] => Ok(arg),
        _ => Err(EngineError::evaluation(format!(
            "{name}() expects 1 argument, got {}",
            args.len()
        ))),
    }
}

fn literal_value(literal: &LiteralValue) -> Result<Collection> {
    let parse_decimal = |text: &str| {
        Decimal::from_str(text)
            .map_err(|e| EngineError::evaluation(format!("Invalid decimal literal {text}: {e}")))
    };
    let value = match literal {
        LiteralValue::Boolean(b) => FhirPathValue::Boolean(*b),
        LiteralValue::String(s) => FhirPathValue::String(s.clone()),
        LiteralValue::Integer(i) => FhirPathValue::Integer(*i),
        LiteralValue::Decimal(text) => FhirPathValue::Decimal(parse_decimal(text)?),
        LiteralValue::Date(text) => FhirPathValue::Date(text.clone()),
        LiteralValue::DateTime(text) => FhirPathValue::DateTime(text.clone()),
        LiteralValue::Time(text) => FhirPathValue::Time(text.clone()),
        LiteralValue::Quantity { value, unit } => {
            FhirPathValue::Quantity(Quantity::new(parse_decimal(value)?, Some(unit.clone())))
        }
        LiteralValue::Null => return Ok(Collection::new()),
    };
    Ok(Collection::single(value))
}

/// Member navigation over every item of `input`
fn navigate(input: &Collection, name: &str) -> Collection {
    let mut result = Collection::new();
    for item in input.iter() {
        match item {
            FhirPathValue::Resource(resource) => {
                let Some(object) = resource.as_object() else {
                    continue;
                };
                if object.get("resourceType").and_then(Value::as_str) == Some(name) {
                    result.push(item.clone());
                } else if let Some(value) = object.get(name) {
                    result.extend(Collection::from_json(value));
                } else if let Some(value) = choice_element(object, name) {
                    result.extend(Collection::from_json(value));
                }
            }
            FhirPathValue::Quantity(quantity) => match name {
                "value" => result.push(FhirPathValue::Decimal(quantity.value)),
                "unit" | "code" => {
                    if let Some(unit) = &quantity.unit {
                        result.push(FhirPathValue::String(unit.clone()));
                    }
                }
                _ => {}
            },
            _ => {}
        }
    }
    result
}

fn choice_element<'v>(object: &'v serde_json::Map<String, Value>, name: &str) -> Option<&'v Value> {
    CHOICE_TYPE_SUFFIXES
        .iter()
        .find_map(|suffix| object.get(&format!("{name}{suffix}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parser::parse_expression;
    use pretty_assertions::assert_eq;
    use serde_json::json;
    use std::sync::Arc;

    fn eval(expression: &str, resource: Value) -> Result<Collection> {
        let ast = parse_expression(expression)?;
        let context = EvaluationContext::new();
        let root = Collection::single(FhirPathValue::resource(Arc::new(resource)));
        Evaluator::new(&context, root).evaluate(&ast)
    }

    fn response() -> Value {
        json!({
            "resourceType": "QuestionnaireResponse",
            "item": [
                {"linkId": "weight", "answer": [{"valueDecimal": 80.0}]},
                {"linkId": "height", "answer": [{"valueInteger": 180}]},
                {"linkId": "smoker", "answer": [{"valueCoding": {"system": "http://loinc.org", "code": "LA33-6"}}]}
            ]
        })
    }

    #[test]
    fn navigates_choice_elements() {
        let result = eval("item.where(linkId = 'height').answer.value", response()).unwrap();
        assert_eq!(result, Collection::single(FhirPathValue::Integer(180)));
    }

    #[test]
    fn leading_resource_type_selects_root() {
        let result = eval("QuestionnaireResponse.item.count()", response()).unwrap();
        assert_eq!(result, Collection::single(FhirPathValue::Integer(3)));
    }

    #[test]
    fn resource_variable_falls_back_to_root() {
        let result = eval(
            "%resource.item.where(linkId='smoker').answer.value.code",
            response(),
        )
        .unwrap();
        assert_eq!(result, Collection::single(FhirPathValue::String("LA33-6".into())));
    }

    #[test]
    fn iif_only_evaluates_chosen_branch() {
        let result = eval("iif(item.count() > 1, 'many', %undefined)", response()).unwrap();
        assert_eq!(result, Collection::single(FhirPathValue::String("many".into())));
    }

    #[test]
    fn unknown_variable_is_an_error() {
        assert!(eval("%nope", response()).is_err());
    }

    #[test]
    fn external_functions_need_a_hook() {
        let err = eval("'http://loinc.org/vs'.expand()", response()).unwrap_err();
        assert!(err.to_string().contains("asynchronous"));
    }

    #[test]
    fn aggregate_uses_total() {
        let result = eval("(1 | 2 | 3).aggregate($this + $total, 0)", json!({})).unwrap();
        assert_eq!(result, Collection::single(FhirPathValue::Integer(6)));
    }

    #[test]
    fn type_operators() {
        assert_eq!(
            eval("item.answer.value.ofType(Coding).code", response()).unwrap(),
            Collection::single(FhirPathValue::String("LA33-6".into()))
        );
        assert_eq!(
            eval("1 is Integer", json!({})).unwrap(),
            Collection::boolean(true)
        );
    }

    struct Echo;

    impl ExternalFunctions for Echo {
        fn call(&self, name: &str, _input: &Collection, _args: &[Collection]) -> Option<Result<Collection>> {
            (name == "resolve").then(|| Ok(Collection::single(FhirPathValue::String("resolved".into()))))
        }
    }

    #[test]
    fn external_hook_handles_resolve() {
        let ast = parse_expression("'Patient/1'.resolve()").unwrap();
        let context = EvaluationContext::new();
        let result = Evaluator::new(&context, Collection::new())
            .with_external(&Echo)
            .evaluate(&ast)
            .unwrap();
        assert_eq!(result, Collection::single(FhirPathValue::String("resolved".into())));
    }
}
