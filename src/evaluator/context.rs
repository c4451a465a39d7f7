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

//! Evaluation context: named environment variables visible as `%name`

use crate::model::{Collection, FhirPathValue};
use indexmap::IndexMap;
use serde_json::Value;
use std::sync::Arc;

/// Environment variables available to an expression
///
/// Insertion order is preserved so that later variables may be computed from earlier ones
/// and diagnostics list them in definition order.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct EvaluationContext {
    variables: IndexMap<String, Collection>,
}

impl EvaluationContext {
    /// Create an empty context
    pub fn new() -> Self {
        Self::default()
    }

    /// Bind a variable to a collection, replacing any previous binding
    pub fn set_variable(&mut self, name: impl Into<String>, value: Collection) {
        self.variables.insert(name.into(), value);
    }

    /// Bind a variable to a JSON resource
    pub fn set_resource(&mut self, name: impl Into<String>, resource: Value) {
        self.set_variable(
            name,
            Collection::single(FhirPathValue::resource(Arc::new(resource))),
        );
    }

    /// Builder form of [`set_variable`](Self::set_variable)
    pub fn with_variable(mut self, name: impl Into<String>, value: Collection) -> Self {
        self.set_variable(name, value);
        self
    }

    /// Look up a variable
    pub fn get_variable(&self, name: &str) -> Option<&Collection> {
        self.variables.get(name)
    }

    /// True when `name` is bound
    pub fn contains(&self, name: &str) -> bool {
        self.variables.contains_key(name)
    }

    /// Remove a binding
    pub fn remove(&mut self, name: &str) -> Option<Collection> {
        self.variables.shift_remove(name)
    }

    /// Variable names in definition order
    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.variables.keys().map(String::as_str)
    }

    /// Number of bound variables
    pub fn len(&self) -> usize {
        self.variables.len()
    }

    /// True when nothing is bound
    pub fn is_empty(&self) -> bool {
        self.variables.is_empty()
    }
}
