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

//! Questionnaire form state: context, visibility, expressions and the response tree

pub mod context;
pub mod enable_when;
pub mod engine;
pub mod expressions;
pub mod response_tree;

pub use context::{ContextBuilder, LaunchContext};
pub use enable_when::{EnableWhenEngine, EnableWhenExpression, EnableWhenItem};
pub use engine::{CommitOutcome, EvaluationTicket, FormEngine};
pub use expressions::{
    AnswerExpression, AnswerOptionsToggleExpression, CalculatedExpression, ExpressionEngine, ExpressionSnapshot,
    ExpressionUpdate, ValueSetCache, parse_value_to_answer,
};
pub use response_tree::{Leaf, PathSegment};
