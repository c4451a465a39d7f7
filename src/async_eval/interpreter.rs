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

//! Fixed-point asynchronous FHIRPath evaluation
//!
//! Each call evaluates the expression synchronously. When the pass reaches an unresolved
//! `expand`, `resolve` or `memberOf`, the pending side calls are run concurrently and the
//! expression is evaluated again from scratch, until a pass needs nothing new.

use super::jobs::{AsyncRequest, JobKey, JobTable};
use crate::config::EngineConfig;
use crate::diagnostics::{IssueSeverity, OperationOutcome};
use crate::engine::FhirPathEngine;
use crate::error::{EngineError, Result};
use crate::evaluator::{EvaluationContext, ExternalFunctions};
use crate::model::{Collection, FhirPathValue};
use crate::terminology::{TerminologyProvider, ValueSetRef};
use futures::future::join_all;
use serde_json::{Value, json};
use std::sync::Arc;
use std::time::Duration;

/// Asynchronous FHIRPath evaluator
///
/// Cloning is cheap; clones share the parse cache and the terminology provider.
#[derive(Clone)]
pub struct AsyncFhirPathEvaluator {
    engine: Arc<FhirPathEngine>,
    provider: Arc<dyn TerminologyProvider>,
    terminology_server: String,
    max_iterations: usize,
    timeout: Duration,
}

impl std::fmt::Debug for AsyncFhirPathEvaluator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AsyncFhirPathEvaluator")
            .field("terminology_server", &self.terminology_server)
            .field("max_iterations", &self.max_iterations)
            .field("timeout", &self.timeout)
            .finish()
    }
}

impl AsyncFhirPathEvaluator {
    pub fn new(provider: Arc<dyn TerminologyProvider>, config: &EngineConfig) -> Self {
        Self {
            engine: Arc::new(FhirPathEngine::with_cache_size(config.expression_cache_size)),
            provider,
            terminology_server: config.default_terminology_server.clone(),
            max_iterations: config.max_async_iterations.max(1),
            timeout: config.terminology_timeout(),
        }
    }

    /// Same evaluator talking to another terminology server
    pub fn with_terminology_server(&self, server_url: impl Into<String>) -> Self {
        Self {
            terminology_server: server_url.into(),
            ..self.clone()
        }
    }

    pub fn terminology_server(&self) -> &str {
        &self.terminology_server
    }

    /// The shared synchronous engine
    pub fn engine(&self) -> &FhirPathEngine {
        &self.engine
    }

    /// Expand a value set outside of an expression, under the same request timeout
    pub async fn expand_value_set(&self, value_set: &ValueSetRef, params: Option<&str>) -> Result<Value> {
        let request = self
            .provider
            .expand(&self.terminology_server, value_set, params);
        match tokio::time::timeout(self.timeout, request).await {
            Ok(result) => result,
            Err(_) => Err(EngineError::Terminology(OperationOutcome::new(
                IssueSeverity::Error,
                "timeout",
                format!("ValueSet expansion timed out: {}", value_set.key()),
                Some(format!("No response within {} ms", self.timeout.as_millis())),
            ))),
        }
    }

    /// Evaluate `expression` against `resource`, resolving asynchronous functions
    ///
    /// # Errors
    /// * `EngineError::Parse` / `EngineError::Evaluation` for malformed or failing expressions
    /// * `EngineError::Terminology` when a side call fails; the whole evaluation is aborted
    /// * `EngineError::DidNotConverge` when every pass registers new jobs
    pub async fn evaluate(
        &self,
        expression: &str,
        resource: &Value,
        context: &EvaluationContext,
    ) -> Result<Collection> {
        let ast = self
            .engine
            .compile(expression)
            .map_err(|e| e.with_expression(expression))?;

        let mut context = context.clone();
        if !context.contains("terminologies") {
            context.set_resource("terminologies", json!({}));
        }

        let jobs = JobTable::new();
        for pass in 1..=self.max_iterations {
            let result = self
                .engine
                .evaluate_node(&ast, resource, &context, Some(&jobs as &dyn ExternalFunctions))
                .map_err(|e| e.with_expression(expression))?;

            if !jobs.take_needs_async() {
                if pass > 1 {
                    log::debug!("'{expression}' converged after {pass} passes");
                }
                return Ok(result);
            }
            if pass == self.max_iterations {
                break;
            }
            self.run_pending(&jobs).await?;
        }

        Err(EngineError::DidNotConverge {
            iterations: self.max_iterations,
            expression: expression.to_string(),
        })
    }

    /// Run every pending job concurrently and store the results
    ///
    /// All jobs settle before the first failure is reported; failed jobs are completed with
    /// an empty result.
    async fn run_pending(&self, jobs: &JobTable) -> Result<()> {
        let pending = jobs.pending();
        log::debug!("performing {} async requests", pending.len());

        let outcomes = join_all(pending.into_iter().map(|(key, request)| async move {
            let outcome = tokio::time::timeout(self.timeout, self.perform(&request)).await;
            (key, outcome)
        }))
        .await;

        let mut failure = None;
        for (key, outcome) in outcomes {
            match outcome {
                Ok(Ok(result)) => jobs.complete(&key, result),
                Ok(Err(error)) => {
                    jobs.complete(&key, Collection::new());
                    failure.get_or_insert_with(|| as_terminology_error(&key, error));
                }
                Err(_) => {
                    jobs.complete(&key, Collection::new());
                    failure.get_or_insert_with(|| {
                        EngineError::Terminology(OperationOutcome::new(
                            IssueSeverity::Error,
                            "timeout",
                            format!("Async request timed out: {key}"),
                            Some(format!("No response within {} ms", self.timeout.as_millis())),
                        ))
                    });
                }
            }
        }

        match failure {
            Some(error) => Err(error),
            None => Ok(()),
        }
    }

    async fn perform(&self, request: &AsyncRequest) -> Result<Collection> {
        let server = self.terminology_server.as_str();
        match request {
            AsyncRequest::Expand { value_set, params } => {
                let expansion = self
                    .provider
                    .expand(server, value_set, params.as_deref())
                    .await?;
                Ok(Collection::single(FhirPathValue::resource(Arc::new(expansion))))
            }
            AsyncRequest::Resolve { reference } => {
                let resource = self.provider.resolve(server, reference).await?;
                Ok(Collection::from_json(&resource))
            }
            AsyncRequest::MemberOf { value, value_set } => {
                let membership = self.provider.validate_code(server, value_set, value).await?;
                Ok(membership.map(Collection::boolean).unwrap_or_default())
            }
        }
    }
}

fn as_terminology_error(key: &JobKey, error: EngineError) -> EngineError {
    match error {
        EngineError::Terminology(_) => error,
        other => EngineError::Terminology(OperationOutcome::exception(
            format!("Async request failed: {key}"),
            Some(other.to_string()),
        )),
    }
}
