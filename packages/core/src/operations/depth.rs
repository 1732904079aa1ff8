//! Depth Recalculator
//!
//! Rewrites `nestingLevel` for a node and its entire subtree after the node's
//! depth changed. The subtree is walked level by level through parent
//! pointers: one `find` for the children of the current level and one bulk
//! update that assigns them all the next level. Every node is visited exactly
//! once, and the walk completes only when the deepest level has been written.

use crate::db::{Collection, DocumentStore, Filter, Patch};
use crate::models::fields;
use crate::operations::{find_categories, id_values, WalkContext, WalkKind, WalkProgress};
use crate::services::TreeError;
use std::collections::HashSet;
use std::sync::Arc;

pub struct DepthRecalculator {
    store: Arc<dyn DocumentStore>,
}

impl DepthRecalculator {
    pub fn new(store: Arc<dyn DocumentStore>) -> Self {
        Self { store }
    }

    /// Set `nestingLevel` of `node_id` to `new_level` and of every descendant to
    /// its distance from `node_id` plus `new_level`.
    ///
    /// Returns the number of nodes written (the node itself included).
    pub async fn recompute(
        &self,
        node_id: &str,
        new_level: u32,
        ctx: &WalkContext,
    ) -> Result<usize, TreeError> {
        let mut progress = WalkProgress::begin(ctx, WalkKind::Depth, node_id);
        progress.check(node_id)?;

        let updated = self
            .store
            .update_one(
                Collection::Categories,
                &Filter::by_id(node_id),
                &Patch::new().set(fields::NESTING_LEVEL, new_level),
            )
            .await
            .map_err(|e| progress.stopped(node_id, e))?;
        if updated.is_none() {
            return Err(TreeError::not_found(node_id));
        }
        progress.advance(1);

        let mut visited: HashSet<String> = HashSet::from([node_id.to_string()]);
        let mut frontier = vec![node_id.to_string()];
        let mut level = new_level;

        while !frontier.is_empty() {
            level += 1;
            let at = frontier.join(",");
            progress.check(&at)?;

            let children = find_categories(
                self.store.as_ref(),
                &Filter::new().is_in(fields::PARENT, id_values(&frontier)),
            )
            .await
            .map_err(|e| progress.stopped(&at, e))?;

            let next: Vec<String> = children
                .into_iter()
                .map(|c| c.id)
                .filter(|id| visited.insert(id.clone()))
                .collect();
            if next.is_empty() {
                break;
            }

            self.store
                .update_many(
                    Collection::Categories,
                    &Filter::by_ids(next.iter().cloned()),
                    &Patch::new().set(fields::NESTING_LEVEL, level),
                )
                .await
                .map_err(|e| progress.stopped(&next.join(","), e))?;

            tracing::debug!("Depth {} assigned to {} node(s) below '{}'", level, next.len(), node_id);
            progress.advance(next.len());
            frontier = next;
        }

        Ok(progress.completed())
    }
}
