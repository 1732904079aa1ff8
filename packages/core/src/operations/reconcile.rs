//! Reconciliation and Audit
//!
//! `descendants`, `nestingLevel`, `fullName` and `sequence` are caches of what
//! the parent pointers already say. After a partial walk failure they may
//! disagree with it. [`ClosureReconciler::rebuild`] loads a scope of the tree
//! into an arena indexed by id, recomputes every cached field from the parent
//! pointers, and rewrites the documents that differ. [`audit`] runs the same
//! computation read-only and lists every disagreement.

use crate::db::{Collection, DocumentStore, Filter, Patch};
use crate::models::{fields, Category};
use crate::operations::eradicate::collect_subtree;
use crate::operations::{
    compose_full_name, fetch_category, find_categories, WalkContext, WalkKind, WalkProgress,
};
use crate::services::TreeError;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet, VecDeque};
use std::sync::Arc;

/// Which part of the tree to rebuild
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReconcileScope {
    /// Every category in the store
    All,
    /// One node and everything below it; the node's own parent is trusted
    Subtree(String),
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReconcileReport {
    pub examined: usize,
    /// Ids of the documents that were rewritten
    pub repaired: Vec<String>,
    /// Ids not reachable from any root (parent pointers form a cycle)
    pub unreachable: Vec<String>,
}

/// A disagreement between a cached field and the parent pointers
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Violation {
    DanglingParent { id: String, parent: String },
    Cycle { id: String },
    NestingLevel { id: String, expected: u32, actual: u32 },
    FullName { id: String, expected: String, actual: String },
    MissingDescendant { ancestor: String, id: String },
    StaleDescendant { ancestor: String, id: String },
    SequenceGap { parent: Option<String>, sequences: Vec<u32> },
}

/// Cached fields as the parent pointers say they should be
#[derive(Debug, Clone, PartialEq)]
struct Expected {
    parent: Option<String>,
    nesting_level: u32,
    full_name: String,
    sequence: u32,
    descendants: BTreeSet<String>,
}

/// Where the arena walk starts
struct Anchor {
    id: String,
    nesting_level: u32,
    parent_full_name: Option<String>,
    /// Keep the stored sequence (the anchor's sibling group is out of scope)
    keep_sequence: bool,
}

struct Arena {
    nodes: HashMap<String, Category>,
}

impl Arena {
    fn new(categories: Vec<Category>) -> Self {
        Self {
            nodes: categories.into_iter().map(|c| (c.id.clone(), c)).collect(),
        }
    }

    /// Parent id if it points at a node of the arena
    fn live_parent(&self, category: &Category) -> Option<String> {
        category
            .parent
            .as_ref()
            .filter(|p| self.nodes.contains_key(p.as_str()))
            .cloned()
    }

    /// Children per parent, each group ordered by (stored sequence, id)
    fn child_groups(&self) -> HashMap<Option<String>, Vec<String>> {
        let mut groups: HashMap<Option<String>, Vec<&Category>> = HashMap::new();
        for category in self.nodes.values() {
            groups
                .entry(self.live_parent(category))
                .or_default()
                .push(category);
        }
        groups
            .into_iter()
            .map(|(parent, mut members)| {
                members.sort_by(|a, b| a.sequence.cmp(&b.sequence).then_with(|| a.id.cmp(&b.id)));
                (parent, members.into_iter().map(|c| c.id.clone()).collect())
            })
            .collect()
    }

    /// Anchors for a whole-store scope: every node without a live parent
    fn roots(&self, groups: &HashMap<Option<String>, Vec<String>>) -> Vec<Anchor> {
        groups
            .get(&None)
            .map(|ids| {
                ids.iter()
                    .map(|id| Anchor {
                        id: id.clone(),
                        nesting_level: 0,
                        parent_full_name: None,
                        keep_sequence: false,
                    })
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Recompute every cached field reachable from `anchors`
    fn compute(
        &self,
        anchors: Vec<Anchor>,
        groups: &HashMap<Option<String>, Vec<String>>,
        separator: &str,
    ) -> (Vec<String>, HashMap<String, Expected>) {
        let mut order = Vec::new();
        let mut expected: HashMap<String, Expected> = HashMap::new();
        let mut queue = VecDeque::new();

        for (index, anchor) in anchors.into_iter().enumerate() {
            let Some(node) = self.nodes.get(&anchor.id) else {
                continue;
            };
            let sequence = if anchor.keep_sequence {
                node.sequence
            } else {
                index as u32
            };
            expected.insert(
                anchor.id.clone(),
                Expected {
                    parent: if anchor.keep_sequence {
                        node.parent.clone()
                    } else {
                        None
                    },
                    nesting_level: anchor.nesting_level,
                    full_name: compose_full_name(
                        anchor.parent_full_name.as_deref(),
                        &node.name,
                        separator,
                    ),
                    sequence,
                    descendants: BTreeSet::new(),
                },
            );
            queue.push_back(anchor.id);
        }

        while let Some(id) = queue.pop_front() {
            order.push(id.clone());
            let Some(parent) = expected.get(&id).cloned() else {
                continue;
            };
            let Some(children) = groups.get(&Some(id.clone())) else {
                continue;
            };
            for (index, child_id) in children.iter().enumerate() {
                if expected.contains_key(child_id) {
                    continue;
                }
                let Some(child) = self.nodes.get(child_id) else {
                    continue;
                };
                expected.insert(
                    child_id.clone(),
                    Expected {
                        parent: Some(id.clone()),
                        nesting_level: parent.nesting_level + 1,
                        full_name: compose_full_name(
                            Some(&parent.full_name),
                            &child.name,
                            separator,
                        ),
                        sequence: index as u32,
                        descendants: BTreeSet::new(),
                    },
                );
                queue.push_back(child_id.clone());
            }
        }

        // Bottom-up: a node's closure is its children plus their closures
        for id in order.iter().rev() {
            let Some(parent) = expected.get(id).and_then(|e| e.parent.clone()) else {
                continue;
            };
            if !expected.contains_key(&parent) {
                continue;
            }
            let mut closure = expected
                .get(id)
                .map(|e| e.descendants.clone())
                .unwrap_or_default();
            closure.insert(id.clone());
            if let Some(entry) = expected.get_mut(&parent) {
                entry.descendants.extend(closure);
            }
        }

        (order, expected)
    }
}

/// Fields of `category` that differ from `expected`, as one patch
fn repair_patch(category: &Category, expected: &Expected) -> Patch {
    let mut patch = Patch::new();
    if category.parent != expected.parent {
        patch = patch.set(
            fields::PARENT,
            expected.parent.clone().map_or(Value::Null, Value::String),
        );
    }
    if category.nesting_level != expected.nesting_level {
        patch = patch.set(fields::NESTING_LEVEL, expected.nesting_level);
    }
    if category.full_name != expected.full_name {
        patch = patch.set(fields::FULL_NAME, expected.full_name.as_str());
    }
    if category.sequence != expected.sequence {
        patch = patch.set(fields::SEQUENCE, expected.sequence);
    }
    let actual: BTreeSet<String> = category.descendants.iter().cloned().collect();
    if actual != expected.descendants {
        patch = patch.set(
            fields::DESCENDANTS,
            Value::Array(
                expected
                    .descendants
                    .iter()
                    .cloned()
                    .map(Value::String)
                    .collect(),
            ),
        );
    }
    patch
}

/// Rebuilds the materialized tree data from parent pointers
pub struct ClosureReconciler {
    store: Arc<dyn DocumentStore>,
    separator: String,
}

impl ClosureReconciler {
    pub fn new(store: Arc<dyn DocumentStore>, separator: impl Into<String>) -> Self {
        Self {
            store,
            separator: separator.into(),
        }
    }

    pub async fn rebuild(
        &self,
        scope: &ReconcileScope,
        ctx: &WalkContext,
    ) -> Result<ReconcileReport, TreeError> {
        let (arena, anchors, ancestors) = match scope {
            ReconcileScope::All => {
                let categories = find_categories(self.store.as_ref(), &Filter::new())
                    .await
                    .map_err(|e| TreeError::store("reconcile: load categories", e))?;
                let arena = Arena::new(categories);
                let anchors = arena.roots(&arena.child_groups());
                (arena, anchors, None)
            }
            ReconcileScope::Subtree(root_id) => self.load_subtree(root_id, ctx).await?,
        };

        let groups = arena.child_groups();
        let (order, expected) = arena.compute(anchors, &groups, &self.separator);

        let reachable: HashSet<&String> = order.iter().collect();
        let mut unreachable: Vec<String> = arena
            .nodes
            .keys()
            .filter(|id| !reachable.contains(id))
            .cloned()
            .collect();
        unreachable.sort();
        if !unreachable.is_empty() {
            tracing::warn!(
                "Reconcile found {} categor(ies) in a parent cycle: {:?}",
                unreachable.len(),
                unreachable
            );
        }

        let origin = match scope {
            ReconcileScope::All => "*",
            ReconcileScope::Subtree(id) => id.as_str(),
        };
        let mut progress = WalkProgress::begin(ctx, WalkKind::Reconcile, origin);
        let mut repaired = Vec::new();

        for id in &order {
            let (Some(category), Some(want)) = (arena.nodes.get(id), expected.get(id)) else {
                continue;
            };
            let patch = repair_patch(category, want);
            if patch.is_empty() {
                continue;
            }
            if let Some(reason) = ctx.interruption() {
                return Err(progress.stopped(id, reason));
            }
            self.store
                .update_one(Collection::Categories, &Filter::by_id(id), &patch)
                .await
                .map_err(|e| progress.stopped(id, e))?;
            tracing::debug!("Repaired '{}' ({} field(s))", id, patch.ops().len());
            progress.advance(1);
            repaired.push(id.clone());
        }

        // Ancestors outside the scope must still list the subtree
        if let Some((parent_id, subtree_ids)) = ancestors {
            crate::operations::AncestorClosure::new(self.store.clone())
                .attach(&subtree_ids, &parent_id, ctx)
                .await?;
        }

        tracing::info!(
            "Reconciled {} categor(ies), repaired {}",
            arena.nodes.len(),
            repaired.len()
        );
        Ok(ReconcileReport {
            examined: arena.nodes.len(),
            repaired,
            unreachable,
        })
    }

    /// Arena of one subtree, its anchor, and the (parent, ids) to re-attach upward
    async fn load_subtree(
        &self,
        root_id: &str,
        ctx: &WalkContext,
    ) -> Result<(Arena, Vec<Anchor>, Option<(String, Vec<String>)>), TreeError> {
        let context = || format!("reconcile '{}'", root_id);
        let root = fetch_category(self.store.as_ref(), root_id)
            .await
            .map_err(|e| TreeError::store(context(), e))?
            .ok_or_else(|| TreeError::not_found(root_id))?;

        let ids = collect_subtree(self.store.as_ref(), root_id, ctx).await?;
        let categories = find_categories(self.store.as_ref(), &Filter::by_ids(ids.iter().cloned()))
            .await
            .map_err(|e| TreeError::store(context(), e))?;

        let parent = match root.parent.as_deref() {
            Some(parent_id) => fetch_category(self.store.as_ref(), parent_id)
                .await
                .map_err(|e| TreeError::store(context(), e))?,
            None => None,
        };

        let anchor = Anchor {
            id: root.id.clone(),
            nesting_level: parent.as_ref().map_or(0, |p| p.nesting_level + 1),
            parent_full_name: parent.as_ref().map(|p| p.full_name.clone()),
            keep_sequence: true,
        };
        let ancestors = parent.map(|p| (p.id, ids));

        let mut arena = Arena::new(categories);
        // The anchor's parent lies outside the arena; keep the pointer as stored
        if let Some(root) = arena.nodes.get_mut(root_id) {
            root.parent = None;
        }
        Ok((arena, vec![anchor], ancestors))
    }
}

/// Check every tree invariant over the whole store.
///
/// Returns every violation found; an empty list means the tree is consistent.
pub async fn audit(store: &dyn DocumentStore, separator: &str) -> Result<Vec<Violation>, TreeError> {
    let categories = find_categories(store, &Filter::new())
        .await
        .map_err(|e| TreeError::store("audit: load categories", e))?;
    let arena = Arena::new(categories);
    let groups = arena.child_groups();
    let (order, expected) = arena.compute(arena.roots(&groups), &groups, separator);

    let mut violations = Vec::new();
    let reachable: HashSet<&String> = order.iter().collect();

    let mut ids: Vec<&String> = arena.nodes.keys().collect();
    ids.sort();
    for id in ids {
        let category = &arena.nodes[id];
        if let Some(parent) = &category.parent {
            if !arena.nodes.contains_key(parent) {
                violations.push(Violation::DanglingParent {
                    id: id.clone(),
                    parent: parent.clone(),
                });
            }
        }
        if !reachable.contains(id) {
            violations.push(Violation::Cycle { id: id.clone() });
        }
    }

    for id in &order {
        let (Some(category), Some(want)) = (arena.nodes.get(id), expected.get(id)) else {
            continue;
        };
        if category.nesting_level != want.nesting_level {
            violations.push(Violation::NestingLevel {
                id: id.clone(),
                expected: want.nesting_level,
                actual: category.nesting_level,
            });
        }
        if category.full_name != want.full_name {
            violations.push(Violation::FullName {
                id: id.clone(),
                expected: want.full_name.clone(),
                actual: category.full_name.clone(),
            });
        }
        let actual: BTreeSet<&String> = category.descendants.iter().collect();
        for missing in want.descendants.iter().filter(|d| !actual.contains(d)) {
            violations.push(Violation::MissingDescendant {
                ancestor: id.clone(),
                id: missing.clone(),
            });
        }
        for stale in actual.iter().filter(|d| !want.descendants.contains(d.as_str())) {
            violations.push(Violation::StaleDescendant {
                ancestor: id.clone(),
                id: (*stale).clone(),
            });
        }
    }

    let mut by_parent: BTreeMap<Option<String>, Vec<u32>> = BTreeMap::new();
    for category in arena.nodes.values() {
        by_parent
            .entry(arena.live_parent(category))
            .or_default()
            .push(category.sequence);
    }
    for (parent, mut sequences) in by_parent {
        sequences.sort_unstable();
        let dense = sequences
            .iter()
            .enumerate()
            .all(|(index, sequence)| *sequence as usize == index);
        if !dense {
            violations.push(Violation::SequenceGap { parent, sequences });
        }
    }

    if !violations.is_empty() {
        tracing::warn!("Audit found {} violation(s)", violations.len());
    }
    Ok(violations)
}
