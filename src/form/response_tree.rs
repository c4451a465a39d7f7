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

//! Response tree synchronization
//!
//! Response items are kept in questionnaire order: among siblings, an item whose
//! definition comes earlier in the parent's definition list always comes first, and all
//! instances of a repeating group are contiguous. Items without answers and children are
//! never stored.

use crate::error::{EngineError, Result};
use crate::questionnaire::{
    AnswerValue, ItemType, QuestionnaireItem, QuestionnaireModel, QuestionnaireResponse,
    QuestionnaireResponseItem,
};
use std::collections::HashMap;

/// Position of each child definition within its parent
pub fn index_map(definitions: &[QuestionnaireItem]) -> HashMap<String, usize> {
    definitions
        .iter()
        .enumerate()
        .map(|(index, item)| (item.link_id.clone(), index))
        .collect()
}

fn position(index: &HashMap<String, usize>, item: &QuestionnaireResponseItem) -> usize {
    index.get(&item.link_id).copied().unwrap_or(usize::MAX)
}

/// Insert, replace or remove one item among `siblings`
///
/// An empty item removes the existing sibling with the same linkId, or does nothing.
/// Items whose linkId is not a child of this parent are ignored.
pub fn merge_item(
    siblings: &mut Vec<QuestionnaireResponseItem>,
    item: QuestionnaireResponseItem,
    index: &HashMap<String, usize>,
) {
    let Some(&target) = index.get(&item.link_id) else {
        log::debug!("ignoring response item '{}' outside its parent", item.link_id);
        return;
    };

    match siblings.iter().position(|s| position(index, s) >= target) {
        Some(at) if siblings[at].link_id == item.link_id => {
            if item.is_empty() {
                siblings.remove(at);
            } else {
                siblings[at] = item;
            }
        }
        Some(at) => {
            if !item.is_empty() {
                siblings.insert(at, item);
            }
        }
        None => {
            if !item.is_empty() {
                siblings.push(item);
            }
        }
    }
}

/// Replace every instance of the repeating group `link_id` among `siblings`
///
/// Existing instances are overwritten position by position, extra ones spliced in and
/// surplus ones removed. Empty instances are dropped.
pub fn merge_repeat_group(
    siblings: &mut Vec<QuestionnaireResponseItem>,
    link_id: &str,
    instances: Vec<QuestionnaireResponseItem>,
    index: &HashMap<String, usize>,
) {
    let Some(&target) = index.get(link_id) else {
        log::debug!("ignoring repeat group '{link_id}' outside its parent");
        return;
    };

    let instances: Vec<QuestionnaireResponseItem> = instances
        .into_iter()
        .filter(|instance| instance.link_id == link_id && !instance.is_empty())
        .collect();
    let start = siblings
        .iter()
        .position(|s| position(index, s) >= target)
        .unwrap_or(siblings.len());
    let existing = siblings[start..]
        .iter()
        .take_while(|s| s.link_id == link_id)
        .count();
    siblings.splice(start..start + existing, instances);
}

/// New content for the item at the end of a path
#[derive(Debug, Clone, PartialEq)]
pub enum Leaf {
    Item(QuestionnaireResponseItem),
    RepeatGroup(Vec<QuestionnaireResponseItem>),
}

/// One step of a path through the response: linkId and repeat instance
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PathSegment {
    pub link_id: String,
    pub instance: usize,
}

impl PathSegment {
    pub fn new(link_id: impl Into<String>, instance: usize) -> Self {
        Self {
            link_id: link_id.into(),
            instance,
        }
    }
}

/// Path from the top level to `link_id`, selecting `instance` of the nearest repeating
/// group above it and the first instance of any other repeating group
pub fn path_for(model: &QuestionnaireModel, link_id: &str, instance: Option<usize>) -> Option<Vec<PathSegment>> {
    let nearest = model.repeating_ancestor(link_id);
    let path = model.path_to(link_id)?;
    Some(
        path.into_iter()
            .map(|segment| {
                let index = match (nearest, instance) {
                    (Some(group), Some(i)) if group == segment => i,
                    _ => 0,
                };
                PathSegment::new(segment, index)
            })
            .collect(),
    )
}

/// Write `leaf` at `path`, creating missing ancestors and pruning ones left empty
///
/// A repeating group on the path may gain at most one instance: `instance` must address
/// a stored instance or the one right after the last. The response is left untouched
/// when the edit fails.
///
/// # Errors
/// `EngineError::InvalidEdit` when the instance is out of range or when the item would
/// nest under a question that has no answer.
pub fn update_item_at_path(
    response: &mut QuestionnaireResponse,
    model: &QuestionnaireModel,
    path: &[PathSegment],
    leaf: Leaf,
) -> Result<()> {
    update_in(&mut response.item, model, None, path, leaf)
}

fn update_in(
    siblings: &mut Vec<QuestionnaireResponseItem>,
    model: &QuestionnaireModel,
    parent: Option<&str>,
    path: &[PathSegment],
    leaf: Leaf,
) -> Result<()> {
    let Some((segment, rest)) = path.split_first() else {
        return Ok(());
    };
    let index = index_map(model.children(parent));

    if rest.is_empty() {
        match leaf {
            Leaf::Item(item) => merge_item(siblings, item, &index),
            Leaf::RepeatGroup(instances) => merge_repeat_group(siblings, &segment.link_id, instances, &index),
        }
        return Ok(());
    }

    let Some(definition) = model.item(&segment.link_id) else {
        return Err(EngineError::unknown_link_id(segment.link_id.as_str()));
    };
    let mut instances: Vec<QuestionnaireResponseItem> = siblings
        .iter()
        .filter(|s| s.link_id == segment.link_id)
        .cloned()
        .collect();
    let slot = if definition.is_repeating_group() { segment.instance } else { 0 };
    if slot > instances.len() {
        return Err(EngineError::InvalidEdit {
            link_id: segment.link_id.clone(),
            message: format!("instance {slot} requested but {} stored", instances.len()),
        });
    }
    if slot == instances.len() {
        instances.push(QuestionnaireResponseItem {
            text: definition.text.clone(),
            ..QuestionnaireResponseItem::new(segment.link_id.clone())
        });
    }

    let container = &mut instances[slot];
    if definition.item_type == ItemType::Group {
        update_in(&mut container.item, model, Some(segment.link_id.as_str()), rest, leaf)?;
    } else {
        // Children of a question live under its first answer
        let Some(answer) = container.answer.first_mut() else {
            return Err(EngineError::InvalidEdit {
                link_id: segment.link_id.clone(),
                message: "children of an unanswered question cannot be answered".to_string(),
            });
        };
        update_in(&mut answer.item, model, Some(segment.link_id.as_str()), rest, leaf)?;
    }

    if definition.is_repeating_group() {
        merge_repeat_group(siblings, &segment.link_id, instances, &index);
    } else {
        let item = instances.swap_remove(slot);
        merge_item(siblings, item, &index);
    }
    Ok(())
}

/// Copy of `response` holding only what should be saved
///
/// Hidden items and their subtrees are dropped, blank string answers are removed and
/// answer strings trimmed, and items left empty are pruned. `visible` receives the linkId
/// and, inside a repeating group, the index of the enclosing group instance.
pub fn persistable_response(
    response: &QuestionnaireResponse,
    model: &QuestionnaireModel,
    visible: impl Fn(&str, Option<usize>) -> bool,
) -> QuestionnaireResponse {
    QuestionnaireResponse {
        item: prune(&response.item, model, &visible, None),
        ..response.clone()
    }
}

fn prune(
    items: &[QuestionnaireResponseItem],
    model: &QuestionnaireModel,
    visible: &dyn Fn(&str, Option<usize>) -> bool,
    instance: Option<usize>,
) -> Vec<QuestionnaireResponseItem> {
    let mut seen: HashMap<&str, usize> = HashMap::new();
    let mut kept = Vec::new();

    for item in items {
        let counter = seen.entry(item.link_id.as_str()).or_insert(0);
        let nth = *counter;
        *counter += 1;

        if !visible(&item.link_id, instance) {
            continue;
        }
        let child_instance = match model.item(&item.link_id) {
            Some(definition) if definition.is_repeating_group() => Some(nth),
            _ => instance,
        };

        let mut item = item.clone();
        item.answer = item
            .answer
            .into_iter()
            .filter_map(|mut answer| {
                if let Some(AnswerValue::String(text)) = &mut answer.value {
                    let trimmed = text.trim();
                    if trimmed.len() != text.len() {
                        *text = trimmed.to_string();
                    }
                }
                if answer.value.as_ref().is_some_and(AnswerValue::is_blank) {
                    answer.value = None;
                }
                answer.item = prune(&answer.item, model, visible, child_instance);
                (answer.value.is_some() || !answer.item.is_empty()).then_some(answer)
            })
            .collect();
        item.item = prune(&item.item, model, visible, child_instance);

        if !item.is_empty() {
            kept.push(item);
        }
    }
    kept
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::questionnaire::Questionnaire;
    use pretty_assertions::assert_eq;
    use serde_json::json;
    use std::sync::Arc;

    fn model() -> QuestionnaireModel {
        let questionnaire: Questionnaire = serde_json::from_value(json!({
            "resourceType": "Questionnaire",
            "item": [
                {"linkId": "a", "type": "string"},
                {"linkId": "b", "type": "string"},
                {"linkId": "g", "type": "group", "item": [
                    {"linkId": "g1", "type": "string"},
                    {"linkId": "g2", "type": "string"}
                ]},
                {"linkId": "meds", "type": "group", "repeats": true, "item": [
                    {"linkId": "med-name", "type": "string"}
                ]},
                {"linkId": "z", "type": "string"},
                {"linkId": "q", "type": "boolean", "item": [
                    {"linkId": "c", "type": "string"}
                ]}
            ]
        }))
        .unwrap();
        QuestionnaireModel::new(Arc::new(questionnaire))
    }

    fn answered(link_id: &str, text: &str) -> QuestionnaireResponseItem {
        QuestionnaireResponseItem::with_answers(link_id, [AnswerValue::String(text.into())])
    }

    fn link_ids(items: &[QuestionnaireResponseItem]) -> Vec<&str> {
        items.iter().map(|i| i.link_id.as_str()).collect()
    }

    #[test]
    fn keeps_questionnaire_order_whatever_the_edit_order() {
        let model = model();
        let index = index_map(model.children(None));
        let mut siblings = Vec::new();
        merge_item(&mut siblings, answered("z", "1"), &index);
        merge_item(&mut siblings, answered("a", "1"), &index);
        merge_item(&mut siblings, answered("b", "1"), &index);
        assert_eq!(link_ids(&siblings), vec!["a", "b", "z"]);

        merge_item(&mut siblings, answered("b", "2"), &index);
        assert_eq!(siblings.len(), 3);
        assert_eq!(siblings[1], answered("b", "2"));
    }

    #[test]
    fn empty_items_remove_or_do_nothing() {
        let model = model();
        let index = index_map(model.children(None));
        let mut siblings = vec![answered("a", "1")];
        merge_item(&mut siblings, QuestionnaireResponseItem::new("b"), &index);
        assert_eq!(link_ids(&siblings), vec!["a"]);
        merge_item(&mut siblings, QuestionnaireResponseItem::new("a"), &index);
        assert!(siblings.is_empty());
        merge_item(&mut siblings, answered("unknown", "1"), &index);
        assert!(siblings.is_empty());
    }

    #[test]
    fn repeat_groups_resize_in_place() {
        let model = model();
        let index = index_map(model.children(None));
        let instance = |name: &str| QuestionnaireResponseItem::with_items("meds", vec![answered("med-name", name)]);
        let mut siblings = vec![answered("a", "1"), answered("z", "1")];

        merge_repeat_group(&mut siblings, "meds", vec![instance("x"), instance("y")], &index);
        assert_eq!(link_ids(&siblings), vec!["a", "meds", "meds", "z"]);

        merge_repeat_group(
            &mut siblings,
            "meds",
            vec![instance("x"), QuestionnaireResponseItem::new("meds"), instance("w"), instance("v")],
            &index,
        );
        assert_eq!(link_ids(&siblings), vec!["a", "meds", "meds", "meds", "z"]);
        assert_eq!(siblings[2], instance("w"));

        merge_repeat_group(&mut siblings, "meds", Vec::new(), &index);
        assert_eq!(link_ids(&siblings), vec!["a", "z"]);
    }

    #[test]
    fn nested_updates_create_and_prune_ancestors() {
        let model = model();
        let mut response = QuestionnaireResponse::default();
        let path = path_for(&model, "g2", None).unwrap();

        update_item_at_path(&mut response, &model, &path, Leaf::Item(answered("g2", "x"))).unwrap();
        assert_eq!(link_ids(&response.item), vec!["g"]);
        assert_eq!(link_ids(&response.item[0].item), vec!["g2"]);

        let first = path_for(&model, "g1", None).unwrap();
        update_item_at_path(&mut response, &model, &first, Leaf::Item(answered("g1", "y"))).unwrap();
        assert_eq!(link_ids(&response.item[0].item), vec!["g1", "g2"]);

        update_item_at_path(&mut response, &model, &first, Leaf::Item(QuestionnaireResponseItem::new("g1"))).unwrap();
        update_item_at_path(&mut response, &model, &path, Leaf::Item(QuestionnaireResponseItem::new("g2"))).unwrap();
        assert!(response.item.is_empty());
    }

    #[test]
    fn updates_target_one_repeat_instance() {
        let model = model();
        let mut response = QuestionnaireResponse::default();
        let second = path_for(&model, "med-name", Some(1)).unwrap();
        assert_eq!(second[0], PathSegment::new("meds", 1));

        let first = path_for(&model, "med-name", Some(0)).unwrap();
        update_item_at_path(&mut response, &model, &first, Leaf::Item(answered("med-name", "a"))).unwrap();
        update_item_at_path(&mut response, &model, &second, Leaf::Item(answered("med-name", "b"))).unwrap();
        update_item_at_path(&mut response, &model, &first, Leaf::Item(answered("med-name", "c"))).unwrap();

        let names: Vec<_> = response
            .find_all("med-name")
            .into_iter()
            .flat_map(|i| i.values().cloned())
            .collect();
        assert_eq!(names, vec![AnswerValue::String("c".into()), AnswerValue::String("b".into())]);
        assert_eq!(response.item.len(), 2);
    }

    #[test]
    fn editing_one_instance_twice_replaces_it() {
        let model = model();
        let mut response = QuestionnaireResponse::default();
        let first = path_for(&model, "med-name", Some(0)).unwrap();
        let second = path_for(&model, "med-name", Some(1)).unwrap();

        update_item_at_path(&mut response, &model, &first, Leaf::Item(answered("med-name", "a"))).unwrap();
        update_item_at_path(&mut response, &model, &second, Leaf::Item(answered("med-name", "b"))).unwrap();
        update_item_at_path(&mut response, &model, &second, Leaf::Item(answered("med-name", "b2"))).unwrap();

        let names: Vec<_> = response
            .find_all("med-name")
            .into_iter()
            .flat_map(|i| i.values().cloned())
            .collect();
        assert_eq!(names, vec![AnswerValue::String("a".into()), AnswerValue::String("b2".into())]);
    }

    #[test]
    fn instances_beyond_the_next_one_are_rejected() {
        let model = model();
        let mut response = QuestionnaireResponse::default();
        let second = path_for(&model, "med-name", Some(1)).unwrap();

        let error = update_item_at_path(&mut response, &model, &second, Leaf::Item(answered("med-name", "a")))
            .unwrap_err();

        assert!(matches!(error, EngineError::InvalidEdit { ref link_id, .. } if link_id == "meds"));
        assert!(response.item.is_empty());
    }

    #[test]
    fn children_of_unanswered_questions_are_rejected() {
        let model = model();
        let mut response = QuestionnaireResponse::new(vec![answered("a", "1")]);
        let path = path_for(&model, "c", None).unwrap();

        let error = update_item_at_path(&mut response, &model, &path, Leaf::Item(answered("c", "x"))).unwrap_err();
        assert!(matches!(error, EngineError::InvalidEdit { ref link_id, .. } if link_id == "q"));
        assert_eq!(response, QuestionnaireResponse::new(vec![answered("a", "1")]));

        let q = QuestionnaireResponseItem::with_answers("q", [AnswerValue::Boolean(true)]);
        update_item_at_path(&mut response, &model, &path[..1], Leaf::Item(q)).unwrap();
        update_item_at_path(&mut response, &model, &path, Leaf::Item(answered("c", "x"))).unwrap();
        let q = response.find("q").unwrap();
        assert_eq!(link_ids(&q.answer[0].item), vec!["c"]);
    }

    #[test]
    fn persistable_response_drops_hidden_and_blank() {
        let model = model();
        let response = QuestionnaireResponse::new(vec![
            answered("a", "  padded  "),
            answered("b", "   "),
            QuestionnaireResponseItem::with_items("g", vec![answered("g1", "x")]),
            QuestionnaireResponseItem::with_items("meds", vec![answered("med-name", "m0")]),
            QuestionnaireResponseItem::with_items("meds", vec![answered("med-name", "m1")]),
        ]);

        let saved = persistable_response(&response, &model, |link_id, instance| {
            link_id != "g" && !(link_id == "med-name" && instance == Some(0))
        });

        assert_eq!(link_ids(&saved.item), vec!["a", "meds"]);
        assert_eq!(saved.item[0], answered("a", "padded"));
        assert_eq!(saved.item[1].item[0], answered("med-name", "m1"));
    }
}
