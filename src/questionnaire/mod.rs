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

//! Questionnaire and QuestionnaireResponse resources

pub mod answer;
pub mod extensions;
pub mod model;
pub mod response;

pub use answer::{AnswerValue, Coding, Quantity, Reference};
pub use extensions::{AnswerOptionsToggle, QuestionnaireModel, Variables};
pub use model::{
    AnswerOption, EnableBehavior, EnableWhen, EnableWhenOperator, Expression, Extension, ItemType,
    Questionnaire, QuestionnaireItem,
};
pub use response::{Answer, QuestionnaireResponse, QuestionnaireResponseItem};
