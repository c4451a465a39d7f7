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

//! Form engine
//!
//! [`FormEngine`] owns the loaded questionnaire, the live response and the derived state
//! (visibility, calculated values, answer options). The only mutations are
//! [`set_items`](FormEngine::set_items), [`update_item`](FormEngine::update_item) (and its
//! repeat-aware variants) and [`update_expressions`](FormEngine::update_expressions).
//!
//! Each mutation bumps an edit sequence number. Expression rounds are started with
//! [`begin_evaluation`](FormEngine::begin_evaluation), run without borrowing the engine,
//! and committed only if no newer edit happened in between.

use super::context::{ContextBuilder, LaunchContext};
use super::enable_when::{EnableWhenEngine, EnableWhenItem};
use super::expressions::{ExpressionEngine, ExpressionSnapshot, ExpressionUpdate, parse_value_to_answer};
use super::response_tree::{self, Leaf, PathSegment};
use crate::async_eval::AsyncFhirPathEvaluator;
use crate::config::EngineConfig;
use crate::error::{EngineError, Result};
use crate::model::FhirPathValue;
use crate::questionnaire::{
    AnswerValue, Questionnaire, QuestionnaireModel, QuestionnaireResponse, QuestionnaireResponseItem,
    Variables,
};
use crate::terminology::{HttpTerminologyProvider, TerminologyProvider, ValueSetRef, expand_locally};
use indexmap::IndexMap;
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

/// Result of [`FormEngine::commit`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CommitOutcome {
    /// The round changed these items
    Applied { changed: BTreeSet<String> },
    /// The round found nothing to change
    Unchanged,
    /// A newer edit happened while the round was running; nothing was applied
    Superseded { ticket: u64, current: u64 },
}

impl CommitOutcome {
    pub fn is_applied(&self) -> bool {
        matches!(self, CommitOutcome::Applied { .. })
    }
}

/// Everything an expression round needs, detached from the engine
#[derive(Debug, Clone)]
pub struct EvaluationTicket {
    sequence: u64,
    evaluator: AsyncFhirPathEvaluator,
    launch: LaunchContext,
    model: Arc<QuestionnaireModel>,
    questionnaire: Arc<Value>,
    response: QuestionnaireResponse,
    variables: Variables,
    snapshot: ExpressionSnapshot,
}

impl EvaluationTicket {
    /// Edit sequence number this round belongs to
    pub fn sequence(&self) -> u64 {
        self.sequence
    }

    /// Build the context and evaluate every expression
    pub async fn run(self) -> ExpressionUpdate {
        if self.snapshot.is_empty() {
            return ExpressionUpdate {
                sequence: self.sequence,
                ..ExpressionUpdate::default()
            };
        }
        let context = ContextBuilder::new(&self.evaluator, &self.launch)
            .with_questionnaire(&self.questionnaire)
            .build(&self.response, &self.variables)
            .await;
        let resource = self.response.to_json();
        self.snapshot
            .evaluate(&self.evaluator, &self.model, &resource, &context, self.sequence)
            .await
    }
}

type Visibility = BTreeMap<String, (bool, Vec<bool>)>;

fn visibility(items: &BTreeMap<String, EnableWhenItem>) -> Visibility {
    items
        .iter()
        .map(|(link_id, item)| (link_id.clone(), (item.is_enabled(), item.enabled_instances().to_vec())))
        .collect()
}

fn flipped(before: &Visibility, after: &Visibility) -> BTreeSet<String> {
    after
        .iter()
        .filter(|(link_id, state)| before.get(*link_id) != Some(*state))
        .map(|(link_id, _)| link_id.clone())
        .collect()
}

/// Reactive evaluation engine for one questionnaire and its response
#[derive(Debug)]
pub struct FormEngine {
    config: EngineConfig,
    evaluator: AsyncFhirPathEvaluator,
    launch: LaunchContext,
    model: Arc<QuestionnaireModel>,
    questionnaire: Arc<Value>,
    response: QuestionnaireResponse,
    enable_when: EnableWhenEngine,
    expressions: ExpressionEngine,
    last_errors: Vec<(String, EngineError)>,
    sequence: u64,
}

impl FormEngine {
    pub fn new(config: EngineConfig, provider: Arc<dyn TerminologyProvider>) -> Self {
        let evaluator = AsyncFhirPathEvaluator::new(provider, &config);
        let model = Arc::new(QuestionnaireModel::new(Arc::new(Questionnaire::default())));
        Self {
            enable_when: EnableWhenEngine::from_model(&model, config.enable_when_activated),
            expressions: ExpressionEngine::from_model(&model),
            questionnaire: Arc::new(serde_json::to_value(model.questionnaire().as_ref()).unwrap_or(Value::Null)),
            model,
            config,
            evaluator,
            launch: LaunchContext::default(),
            response: QuestionnaireResponse::default(),
            last_errors: Vec::new(),
            sequence: 0,
        }
    }

    /// Engine talking to terminology servers over HTTP
    pub fn with_http_provider(config: EngineConfig) -> Self {
        Self::new(config, Arc::new(HttpTerminologyProvider::new()))
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn set_launch_context(&mut self, launch: LaunchContext) {
        self.launch = launch;
        self.sequence += 1;
    }

    /// Load a questionnaire and an optional existing response
    ///
    /// Rebuilds every engine, expands answer value sets and runs a first expression round.
    pub async fn set_items(
        &mut self,
        questionnaire: Questionnaire,
        response: Option<QuestionnaireResponse>,
    ) -> Result<CommitOutcome> {
        self.questionnaire = Arc::new(serde_json::to_value(&questionnaire)?);
        let model = Arc::new(QuestionnaireModel::new(Arc::new(questionnaire)));
        log::info!(
            "Loaded questionnaire with {} items, {} calculated, {} enableWhen expressions",
            model.link_ids().count(),
            model.calculated_expressions.len(),
            model.enable_when_expressions.len()
        );

        self.response = response.unwrap_or_default();
        self.enable_when = EnableWhenEngine::from_model(&model, self.enable_when.is_activated());
        self.enable_when.initialise(&self.response);
        self.expressions = ExpressionEngine::from_model(&model);
        self.model = model;
        self.last_errors.clear();
        self.sequence += 1;

        for (link_id, error) in self.load_answer_value_sets().await {
            log::warn!("answerValueSet of '{link_id}' not loaded: {error}");
        }
        Ok(self.evaluate_now(None).await)
    }

    fn path(&self, link_id: &str, instance: Option<usize>) -> Result<Vec<PathSegment>> {
        response_tree::path_for(&self.model, link_id, instance).ok_or_else(|| EngineError::unknown_link_id(link_id))
    }

    /// Set the answers of `link_id`; returns the items whose visibility flipped
    ///
    /// For items inside a repeating group this edits the first group instance; use
    /// [`update_item_at`](Self::update_item_at) to pick another.
    ///
    /// # Errors
    /// `EngineError::UnknownLinkId` when the questionnaire has no such item.
    pub fn update_item(&mut self, link_id: &str, answers: Vec<AnswerValue>) -> Result<BTreeSet<String>> {
        self.update_item_at(link_id, None, answers)
    }

    /// Set the answers of `link_id` within instance `instance` of its repeating group
    ///
    /// `instance` may address a stored group instance or append the next one.
    ///
    /// # Errors
    /// * `EngineError::UnknownLinkId` when the questionnaire has no such item
    /// * `EngineError::InvalidEdit` when the instance is out of range or the item nests
    ///   under an unanswered question; neither the response nor visibility change
    pub fn update_item_at(
        &mut self,
        link_id: &str,
        instance: Option<usize>,
        answers: Vec<AnswerValue>,
    ) -> Result<BTreeSet<String>> {
        let path = self.path(link_id, instance)?;
        let repeat_group = self.model.repeating_ancestor(link_id).map(str::to_string);
        let existing = self.item_at(&path).cloned();

        let mut item = existing.unwrap_or_else(|| QuestionnaireResponseItem {
            text: self.model.item(link_id).and_then(|d| d.text.clone()),
            ..QuestionnaireResponseItem::new(link_id)
        });
        item.answer = answers.iter().cloned().map(crate::questionnaire::Answer::new).collect();

        let instances_before = repeat_group.as_deref().map(|g| self.response.find_all(g).len());
        response_tree::update_item_at_path(&mut self.response, &self.model, &path, Leaf::Item(item))?;
        self.sequence += 1;
        log::debug!("updated '{link_id}' (edit {})", self.sequence);

        let instances_after = repeat_group.as_deref().map(|g| self.response.find_all(g).len());
        if instances_before != instances_after {
            // Group instances were added or pruned; per-instance answers must be re-read
            let before = visibility(self.enable_when.items());
            self.enable_when.initialise(&self.response);
            return Ok(flipped(&before, &visibility(self.enable_when.items())));
        }

        let instance = repeat_group.map(|_| instance.unwrap_or(0));
        Ok(self.enable_when.update_answer(link_id, &answers, instance))
    }

    /// Replace all instances of the repeating group `link_id`
    pub fn update_repeat_group(
        &mut self,
        link_id: &str,
        instances: Vec<QuestionnaireResponseItem>,
    ) -> Result<BTreeSet<String>> {
        let definition = self
            .model
            .item(link_id)
            .ok_or_else(|| EngineError::unknown_link_id(link_id))?;
        if !definition.is_repeating_group() {
            return Err(EngineError::InvalidResource {
                message: format!("'{link_id}' is not a repeating group"),
            });
        }
        let path = self.path(link_id, None)?;
        response_tree::update_item_at_path(&mut self.response, &self.model, &path, Leaf::RepeatGroup(instances))?;
        self.sequence += 1;

        let before = visibility(self.enable_when.items());
        self.enable_when.initialise(&self.response);
        Ok(flipped(&before, &visibility(self.enable_when.items())))
    }

    /// Response item at `path`, following first answers through questions with children
    fn item_at(&self, path: &[PathSegment]) -> Option<&QuestionnaireResponseItem> {
        let mut siblings = self.response.item.as_slice();
        let mut found = None;
        for segment in path {
            let item = siblings
                .iter()
                .filter(|s| s.link_id == segment.link_id)
                .nth(segment.instance)?;
            siblings = match item.answer.first() {
                Some(answer) if item.item.is_empty() => answer.item.as_slice(),
                _ => item.item.as_slice(),
            };
            found = Some(item);
        }
        found
    }

    /// Snapshot the current state for an expression round
    pub fn begin_evaluation(&self) -> EvaluationTicket {
        self.ticket(None)
    }

    fn ticket(&self, variables: Option<Variables>) -> EvaluationTicket {
        EvaluationTicket {
            sequence: self.sequence,
            evaluator: self.evaluator.clone(),
            launch: self.launch.clone(),
            model: Arc::clone(&self.model),
            questionnaire: Arc::clone(&self.questionnaire),
            response: self.response.clone(),
            variables: variables.unwrap_or_else(|| self.model.variables.clone()),
            snapshot: self.expressions.snapshot(&self.enable_when),
        }
    }

    /// Apply a finished round unless a newer edit superseded it
    pub fn commit(&mut self, update: ExpressionUpdate) -> CommitOutcome {
        if update.sequence != self.sequence {
            log::debug!(
                "discarding results of edit {} (current edit {})",
                update.sequence,
                self.sequence
            );
            return CommitOutcome::Superseded {
                ticket: update.sequence,
                current: self.sequence,
            };
        }

        self.last_errors = update.errors.clone();
        if update.is_empty() {
            return CommitOutcome::Unchanged;
        }

        self.expressions.apply(&update);
        let mut changed = BTreeSet::new();
        for (link_id, enabled) in &update.enable_when {
            self.enable_when.set_expression_result(link_id, Some(*enabled));
            changed.insert(link_id.clone());
        }
        changed.extend(update.calculated.keys().cloned());
        changed.extend(update.answer_options.keys().cloned());
        changed.extend(update.answer_option_toggles.keys().cloned());
        log::debug!("committed expression results for {} items", changed.len());
        CommitOutcome::Applied { changed }
    }

    async fn evaluate_now(&mut self, variables: Option<Variables>) -> CommitOutcome {
        let update = self.ticket(variables).run().await;
        self.commit(update)
    }

    /// Replace the response and re-run every expression against it
    ///
    /// `variables` overrides the questionnaire's declared variables for this round.
    /// Expressions that failed are available from [`last_errors`](Self::last_errors).
    pub async fn update_expressions(
        &mut self,
        response: QuestionnaireResponse,
        variables: Option<Variables>,
    ) -> CommitOutcome {
        self.response = response;
        self.enable_when.initialise(&self.response);
        self.sequence += 1;
        self.evaluate_now(variables).await
    }

    /// Re-run every expression against the current response
    pub async fn refresh_expressions(&mut self) -> CommitOutcome {
        self.evaluate_now(None).await
    }

    /// Write changed calculated values into the response; returns the items written
    ///
    /// Items inside repeating groups are skipped, as are values that do not fit the item's
    /// type.
    pub fn apply_calculated_values(&mut self) -> BTreeSet<String> {
        let mut pending = Vec::new();
        for (link_id, calculated) in self.expressions.calculated_mut() {
            if !calculated.dirty {
                continue;
            }
            calculated.dirty = false;
            if let Some(value) = &calculated.value {
                pending.push((link_id.clone(), value.clone()));
            }
        }

        let mut written = BTreeSet::new();
        for (link_id, value) in pending {
            if self.model.repeating_ancestor(&link_id).is_some() {
                log::debug!("not writing calculated '{link_id}' inside a repeating group");
                continue;
            }
            let Some(definition) = self.model.item(&link_id) else {
                continue;
            };
            let Some(answer) = parse_value_to_answer(definition, &value) else {
                log::warn!("calculated value {value} does not fit '{link_id}'");
                continue;
            };
            let current: Vec<&AnswerValue> = self.response.find(&link_id).map(|i| i.values().collect()).unwrap_or_default();
            if current == [&answer] {
                continue;
            }
            match self.update_item(&link_id, vec![answer]) {
                Ok(_) => {
                    written.insert(link_id);
                }
                Err(error) => log::warn!("calculated value for '{link_id}' not written: {error}"),
            }
        }
        written
    }

    /// Expand every `answerValueSet` not yet cached
    ///
    /// Contained value sets (`#id`) are expanded locally when they enumerate their codes.
    /// Failures are returned per item and leave the cache untouched.
    pub async fn load_answer_value_sets(&mut self) -> Vec<(String, EngineError)> {
        let mut errors = Vec::new();
        let requests: Vec<(String, String)> = self
            .model
            .answer_value_sets
            .iter()
            .filter(|(_, url)| !self.expressions.value_sets().contains(url))
            .map(|(link_id, url)| (link_id.clone(), url.clone()))
            .collect();

        for (link_id, url) in requests {
            if self.expressions.value_sets().contains(&url) {
                continue;
            }
            let (value_set, params) = if url.starts_with('#') {
                let Some(resource) = self.model.questionnaire().contained_resource(&url) else {
                    errors.push((
                        link_id,
                        EngineError::InvalidResource {
                            message: format!("contained ValueSet {url} not found"),
                        },
                    ));
                    continue;
                };
                if let Some(codings) = expand_locally(resource) {
                    let codings = codings
                        .into_iter()
                        .filter_map(|c| serde_json::from_value(c).ok())
                        .collect();
                    self.expressions.value_sets_mut().insert(url, codings);
                    continue;
                }
                (ValueSetRef::Resource(Arc::new(resource.clone())), None)
            } else {
                match url.split_once('|') {
                    Some((canonical, version)) => (
                        ValueSetRef::Url(canonical.to_string()),
                        Some(format!("valueSetVersion={version}")),
                    ),
                    None => (ValueSetRef::Url(url.clone()), None),
                }
            };

            let evaluator = match self.model.terminology_server(&link_id) {
                Some(server) => self.evaluator.with_terminology_server(server),
                None => self.evaluator.clone(),
            };
            match evaluator.expand_value_set(&value_set, params.as_deref()).await {
                Ok(expansion) => self.expressions.value_sets_mut().insert_expansion(url, &expansion),
                Err(error) => errors.push((link_id, error)),
            }
        }
        errors
    }

    pub fn is_enabled(&self, link_id: &str) -> bool {
        self.enable_when.is_enabled(link_id)
    }

    pub fn is_enabled_at(&self, link_id: &str, instance: usize) -> bool {
        self.enable_when.is_enabled_at(link_id, instance)
    }

    /// True when some ancestor of `link_id` is disabled
    ///
    /// `instance` selects the instance of the item's nearest repeating group.
    pub fn is_hidden_by_ancestors(&self, link_id: &str, instance: Option<usize>) -> bool {
        let Some(path) = self.model.path_to(link_id) else {
            return false;
        };
        let group = self.model.repeating_ancestor(link_id);
        path.iter().take(path.len().saturating_sub(1)).any(|ancestor| {
            let same_group = group.is_some() && self.model.repeating_ancestor(ancestor) == group;
            match instance {
                Some(i) if same_group => !self.enable_when.is_enabled_at(ancestor, i),
                _ => !self.enable_when.is_enabled(ancestor),
            }
        })
    }

    /// Toggle enableWhen evaluation; while off every item is visible
    pub fn set_enable_when_activated(&mut self, activated: bool) {
        self.enable_when.set_activated(activated);
    }

    pub fn enable_when(&self) -> &EnableWhenEngine {
        &self.enable_when
    }

    /// Current calculated value of every item that has one
    pub fn calculated_values(&self) -> IndexMap<String, FhirPathValue> {
        self.expressions
            .calculated()
            .iter()
            .filter_map(|(link_id, c)| c.value.clone().map(|v| (link_id.clone(), v)))
            .collect()
    }

    /// Options of a choice item
    ///
    /// `answerExpression` results take precedence over an expanded `answerValueSet`,
    /// which takes precedence over static `answerOption` entries. Options switched off by
    /// an `answerOptionsToggleExpression` are left out.
    pub fn answer_options(&self, link_id: &str) -> Vec<AnswerValue> {
        let options = if let Some(options) = self.expressions.answer_options(link_id) {
            options.to_vec()
        } else if let Some(codings) = self
            .model
            .answer_value_sets
            .get(link_id)
            .and_then(|url| self.expressions.value_sets().get(url))
        {
            codings.iter().cloned().map(AnswerValue::Coding).collect()
        } else {
            self.model
                .item(link_id)
                .map(|item| item.answer_option.iter().map(|o| o.value.clone()).collect())
                .unwrap_or_default()
        };
        options
            .into_iter()
            .filter(|option| self.expressions.is_option_enabled(link_id, option))
            .collect()
    }

    pub fn response(&self) -> &QuestionnaireResponse {
        &self.response
    }

    pub fn model(&self) -> &QuestionnaireModel {
        &self.model
    }

    /// Copy of the response without hidden items, blank answers or empty items
    pub fn persistable_response(&self) -> QuestionnaireResponse {
        response_tree::persistable_response(&self.response, &self.model, |link_id, instance| match instance {
            Some(i) => self.enable_when.is_enabled_at(link_id, i),
            None => self.enable_when.is_enabled(link_id),
        })
    }

    /// Expressions that failed in the last committed round, by linkId
    pub fn last_errors(&self) -> &[(String, EngineError)] {
        &self.last_errors
    }

    /// Current edit sequence number
    pub fn sequence(&self) -> u64 {
        self.sequence
    }
}
