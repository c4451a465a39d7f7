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

//! FHIRPath engine - the synchronous entry point for parsing and evaluation

use crate::ast::ExpressionNode;
use crate::error::Result;
use crate::evaluator::{EvaluationContext, Evaluator, ExternalFunctions};
use crate::model::{Collection, FhirPathValue};
use crate::parser::parse_expression;
use lru::LruCache;
use parking_lot::Mutex;
use serde_json::Value;
use std::num::NonZeroUsize;
use std::sync::Arc;

const DEFAULT_CACHE_SIZE: usize = 1000;

/// Parses and evaluates FHIRPath expressions, caching compiled expressions
///
/// The engine is shared between evaluations; the cache sits behind a mutex so that
/// `compile` works through `&self`.
pub struct FhirPathEngine {
    expression_cache: Mutex<LruCache<String, Arc<ExpressionNode>>>,
}

impl Default for FhirPathEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for FhirPathEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FhirPathEngine")
            .field("cached_expressions", &self.cached_expressions())
            .finish()
    }
}

impl FhirPathEngine {
    /// Create an engine with the default cache size
    pub fn new() -> Self {
        Self::with_cache_size(DEFAULT_CACHE_SIZE)
    }

    /// Create an engine keeping at most `size` compiled expressions
    pub fn with_cache_size(size: usize) -> Self {
        let capacity = NonZeroUsize::new(size).unwrap_or(NonZeroUsize::MIN);
        Self {
            expression_cache: Mutex::new(LruCache::new(capacity)),
        }
    }

    /// Parse an expression, reusing a cached tree when available
    pub fn compile(&self, expression: &str) -> Result<Arc<ExpressionNode>> {
        if let Some(ast) = self.expression_cache.lock().get(expression) {
            return Ok(Arc::clone(ast));
        }
        let ast = Arc::new(parse_expression(expression)?);
        self.expression_cache
            .lock()
            .put(expression.to_string(), Arc::clone(&ast));
        Ok(ast)
    }

    /// Evaluate an expression against a resource
    pub fn evaluate(
        &self,
        expression: &str,
        resource: &Value,
        context: &EvaluationContext,
    ) -> Result<Collection> {
        let ast = self
            .compile(expression)
            .map_err(|e| e.with_expression(expression))?;
        self.evaluate_node(&ast, resource, context, None)
            .map_err(|e| e.with_expression(expression))
    }

    /// Evaluate a compiled expression, optionally routing external functions through a hook
    pub fn evaluate_node(
        &self,
        ast: &ExpressionNode,
        resource: &Value,
        context: &EvaluationContext,
        external: Option<&dyn ExternalFunctions>,
    ) -> Result<Collection> {
        let root = Collection::single(FhirPathValue::resource(Arc::new(resource.clone())));
        let evaluator = Evaluator::new(context, root);
        match external {
            Some(external) => evaluator.with_external(external).evaluate(ast),
            None => evaluator.evaluate(ast),
        }
    }

    /// Number of compiled expressions currently cached
    pub fn cached_expressions(&self) -> usize {
        self.expression_cache.lock().len()
    }

    /// Drop all cached expressions
    pub fn clear_cache(&self) {
        self.expression_cache.lock().clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn compiled_expressions_are_cached() {
        let engine = FhirPathEngine::with_cache_size(2);
        let first = engine.compile("1 + 1").unwrap();
        let second = engine.compile("1 + 1").unwrap();
        assert!(Arc::ptr_eq(&first, &second));

        engine.compile("2").unwrap();
        engine.compile("3").unwrap();
        assert_eq!(engine.cached_expressions(), 2);
    }

    #[test]
    fn parse_errors_carry_position() {
        let engine = FhirPathEngine::new();
        let err = engine
            .evaluate("item.where(", &json!({}), &EvaluationContext::new())
            .unwrap_err();
        assert!(matches!(err, crate::error::EngineError::Parse { .. }));
    }

    #[test]
    fn evaluates_against_resource() {
        let engine = FhirPathEngine::new();
        let patient = json!({"resourceType": "Patient", "birthDate": "1980-05-01"});
        let result = engine
            .evaluate("Patient.birthDate", &patient, &EvaluationContext::new())
            .unwrap();
        assert_eq!(result.to_json(), json!(["1980-05-01"]));
    }
}
