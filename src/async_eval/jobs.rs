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

//! Per-call table of asynchronous jobs
//!
//! The synchronous evaluator consults the table whenever it reaches `expand`, `resolve`
//! or `memberOf`. A completed job yields its stored result; anything else registers a
//! pending job and yields nothing for that branch.

use crate::error::{EngineError, Result};
use crate::evaluator::ExternalFunctions;
use crate::model::{Collection, FhirPathValue};
use crate::terminology::{CodedValue, ValueSetRef};
use indexmap::IndexMap;
use parking_lot::Mutex;
use serde_json::Value;
use std::fmt;
use std::sync::Arc;

/// Content-derived job identity
///
/// `Expand:<value set>[ - <params>]`, `Resolve:<reference>` or
/// `MemberOf:<system|code[,...]> - <value set>`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct JobKey(String);

impl JobKey {
    pub fn expand(value_set: &ValueSetRef, params: Option<&str>) -> Self {
        match params {
            Some(params) => Self(format!("Expand:{} - {}", value_set.key(), params)),
            None => Self(format!("Expand:{}", value_set.key())),
        }
    }

    pub fn resolve(reference: &str) -> Self {
        Self(format!("Resolve:{reference}"))
    }

    pub fn member_of(value: &CodedValue, value_set: &str) -> Self {
        Self(format!("MemberOf:{value} - {value_set}"))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for JobKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// The side call a job performs
#[derive(Debug, Clone, PartialEq)]
pub enum AsyncRequest {
    Expand {
        value_set: ValueSetRef,
        params: Option<String>,
    },
    Resolve {
        reference: String,
    },
    MemberOf {
        value: CodedValue,
        value_set: String,
    },
}

/// Lifecycle of one job
#[derive(Debug, Clone, PartialEq)]
pub enum JobState {
    Pending(AsyncRequest),
    /// Result of the side call; empty when the call failed
    Completed(Collection),
}

#[derive(Debug, Default)]
struct JobTableState {
    jobs: IndexMap<JobKey, JobState>,
    needs_async: bool,
}

/// Jobs of one top-level evaluation
#[derive(Debug, Default)]
pub struct JobTable {
    state: Mutex<JobTableState>,
}

impl JobTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Result of a completed job, or register `request` and return `None`
    fn lookup_or_register(&self, key: JobKey, request: impl FnOnce() -> AsyncRequest) -> Option<Collection> {
        let mut state = self.state.lock();
        if let Some(JobState::Completed(result)) = state.jobs.get(&key) {
            log::trace!("using cached result for: {key}");
            return Some(result.clone());
        }
        log::debug!("requires async evaluation for: {key}");
        if !state.jobs.contains_key(&key) {
            state.jobs.insert(key, JobState::Pending(request()));
        }
        state.needs_async = true;
        None
    }

    /// Whether the last pass hit an unresolved job; resets the flag
    pub fn take_needs_async(&self) -> bool {
        std::mem::take(&mut self.state.lock().needs_async)
    }

    /// Jobs that still need their side call
    pub fn pending(&self) -> Vec<(JobKey, AsyncRequest)> {
        self.state
            .lock()
            .jobs
            .iter()
            .filter_map(|(key, job)| match job {
                JobState::Pending(request) => Some((key.clone(), request.clone())),
                JobState::Completed(_) => None,
            })
            .collect()
    }

    /// Store the result of a job
    pub fn complete(&self, key: &JobKey, result: Collection) {
        self.state
            .lock()
            .jobs
            .insert(key.clone(), JobState::Completed(result));
    }

    pub fn state(&self, key: &JobKey) -> Option<JobState> {
        self.state.lock().jobs.get(key).cloned()
    }

    pub fn len(&self) -> usize {
        self.state.lock().jobs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn expand(&self, input: &Collection, args: &[Collection]) -> Result<Collection> {
        let value_set = match args.first().and_then(|a| a.first()) {
            Some(FhirPathValue::String(url)) => ValueSetRef::Url(url.clone()),
            Some(FhirPathValue::Resource(resource))
                if resource.get("resourceType").and_then(Value::as_str) == Some("ValueSet") =>
            {
                ValueSetRef::Resource(Arc::clone(resource))
            }
            Some(other) => {
                return Err(EngineError::evaluation(format!(
                    "expand() expects a value set URL or resource, got {}",
                    other.type_name()
                )));
            }
            None => return Ok(Collection::new()),
        };
        let params = match args.get(1).and_then(|a| a.first()) {
            Some(value) => Some(value.as_str().map(str::to_string).ok_or_else(|| {
                EngineError::evaluation("expand() expects string parameters")
            })?),
            None => None,
        };

        let mut result = Collection::new();
        for _ in input.iter() {
            let key = JobKey::expand(&value_set, params.as_deref());
            if let Some(value) = self.lookup_or_register(key, || AsyncRequest::Expand {
                value_set: value_set.clone(),
                params: params.clone(),
            }) {
                result.extend(value);
            }
        }
        Ok(result)
    }

    fn resolve(&self, input: &Collection) -> Collection {
        let mut result = Collection::new();
        for item in input.iter() {
            let reference = match item {
                FhirPathValue::String(reference) => reference.clone(),
                FhirPathValue::Resource(resource) => {
                    match resource.get("reference").and_then(Value::as_str) {
                        Some(reference) => reference.to_string(),
                        None => continue,
                    }
                }
                _ => continue,
            };
            let key = JobKey::resolve(&reference);
            if let Some(value) = self.lookup_or_register(key, || AsyncRequest::Resolve { reference }) {
                result.extend(value);
            }
        }
        result
    }

    fn member_of(&self, input: &Collection, args: &[Collection]) -> Result<Collection> {
        let value_set = match args.first().and_then(|a| a.first()) {
            Some(value) => value
                .as_str()
                .ok_or_else(|| EngineError::evaluation("memberOf() expects a value set URL"))?
                .to_string(),
            None => return Ok(Collection::new()),
        };

        let mut result = Collection::new();
        for item in input.iter() {
            let Some(value) = CodedValue::from_json(&item.to_json()) else {
                continue;
            };
            let key = JobKey::member_of(&value, &value_set);
            if let Some(membership) = self.lookup_or_register(key, || AsyncRequest::MemberOf {
                value,
                value_set: value_set.clone(),
            }) {
                result.extend(membership);
            }
        }
        Ok(result)
    }
}

impl ExternalFunctions for JobTable {
    fn call(&self, name: &str, input: &Collection, args: &[Collection]) -> Option<Result<Collection>> {
        match name {
            "expand" => Some(self.expand(input, args)),
            "resolve" => Some(Ok(self.resolve(input))),
            "memberOf" => Some(self.member_of(input, args)),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    fn coding() -> Collection {
        Collection::from_json(&json!({"system": "http://loinc.org", "code": "LA33-6"}))
    }

    fn url(value: &str) -> Collection {
        Collection::single(FhirPathValue::String(value.to_string()))
    }

    #[test]
    fn duplicate_calls_register_one_job() {
        let table = JobTable::new();
        let args = [url("http://example.org/vs")];
        assert_eq!(table.call("memberOf", &coding(), &args).unwrap().unwrap(), Collection::new());
        table.call("memberOf", &coding(), &args).unwrap().unwrap();

        let pending = table.pending();
        assert_eq!(pending.len(), 1);
        assert_eq!(
            pending[0].0.as_str(),
            "MemberOf:http://loinc.org|LA33-6 - http://example.org/vs"
        );
        assert!(table.take_needs_async());
        assert!(!table.take_needs_async());
    }

    #[test]
    fn completed_jobs_replay_results() {
        let table = JobTable::new();
        let input = url("Patient/1");
        table.call("resolve", &input, &[]).unwrap().unwrap();
        table.complete(&JobKey::resolve("Patient/1"), Collection::boolean(true));

        let result = table.call("resolve", &input, &[]).unwrap().unwrap();
        assert_eq!(result, Collection::boolean(true));
        assert!(!table.take_needs_async());
    }

    #[test]
    fn expand_key_includes_params() {
        let table = JobTable::new();
        let terminologies = Collection::from_json(&json!({}));
        table
            .call("expand", &terminologies, &[url("http://example.org/vs"), url("count=5")])
            .unwrap()
            .unwrap();
        assert_eq!(table.pending()[0].0.as_str(), "Expand:http://example.org/vs - count=5");
    }

    #[test]
    fn other_functions_are_not_handled() {
        assert!(JobTable::new().call("count", &Collection::new(), &[]).is_none());
    }
}
