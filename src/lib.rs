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

//! Reactive evaluation engine for FHIR SDC Questionnaires
//!
//! A FHIRPath subset with asynchronous `expand`, `resolve` and `memberOf`, and a form
//! engine that keeps enableWhen visibility, calculated values and answer options in step
//! with a QuestionnaireResponse as it is edited.

pub mod ast;
pub mod async_eval;
pub mod config;
pub mod diagnostics;
pub mod engine;
pub mod error;
pub mod evaluator;
pub mod form;
pub mod model;
pub mod parser;
pub mod questionnaire;
pub mod terminology;

// Re-export main types
pub use async_eval::AsyncFhirPathEvaluator;
pub use config::EngineConfig;
pub use engine::FhirPathEngine;
pub use error::{EngineError, Result};
pub use evaluator::EvaluationContext;
pub use form::{CommitOutcome, FormEngine, LaunchContext};
pub use model::{Collection, FhirPathValue};
pub use parser::{ParseError, parse_expression as parse};
pub use questionnaire::{AnswerValue, Questionnaire, QuestionnaireResponse, QuestionnaireResponseItem};
pub use terminology::{HttpTerminologyProvider, TerminologyProvider};
