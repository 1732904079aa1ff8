//! Ancestor Closure Maintainer
//!
//! Keeps the `descendants` set of every ancestor current when nodes are
//! attached to or detached from a parent. The walk goes upward one ancestor
//! at a time: each step is a single set-union (or set-difference) update on
//! one document, and the parent pointer of the updated document names the
//! next step. Repeating a step is a no-op, so a failed walk can be resumed.

use crate::db::{Collection, DocumentStore, Filter, Patch};
use crate::models::fields;
use crate::operations::{id_values, WalkContext, WalkKind, WalkProgress};
use crate::services::TreeError;
use std::sync::Arc;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Direction {
    Attach,
    Detach,
}

pub struct AncestorClosure {
    store: Arc<dyn DocumentStore>,
}

impl AncestorClosure {
    pub fn new(store: Arc<dyn DocumentStore>) -> Self {
        Self { store }
    }

    /// Add `ids` to the `descendants` of `parent_id` and of every ancestor above it.
    ///
    /// `ids` is the attached node followed by its own descendants, so a whole
    /// subtree is attached in one walk. Returns the number of ancestors updated.
    pub async fn attach(
        &self,
        ids: &[String],
        parent_id: &str,
        ctx: &WalkContext,
    ) -> Result<usize, TreeError> {
        self.walk(ids, parent_id, Direction::Attach, ctx).await
    }

    /// Remove `ids` from the `descendants` of `parent_id` and of every ancestor above it
    pub async fn detach(
        &self,
        ids: &[String],
        parent_id: &str,
        ctx: &WalkContext,
    ) -> Result<usize, TreeError> {
        self.walk(ids, parent_id, Direction::Detach, ctx).await
    }

    async fn walk(
        &self,
        ids: &[String],
        parent_id: &str,
        direction: Direction,
        ctx: &WalkContext,
    ) -> Result<usize, TreeError> {
        let Some(origin) = ids.first() else {
            return Ok(0);
        };

        let values = id_values(ids);
        let patch = match direction {
            Direction::Attach => Patch::new().add_to_set(fields::DESCENDANTS, values),
            Direction::Detach => Patch::new().pull(fields::DESCENDANTS, values),
        };

        let mut progress = WalkProgress::begin(ctx, WalkKind::AncestorClosure, origin);
        let mut next = Some(parent_id.to_string());

        while let Some(ancestor_id) = next.take() {
            progress.check(&ancestor_id)?;

            let updated = match self
                .store
                .update_one(Collection::Categories, &Filter::by_id(&ancestor_id), &patch)
                .await
            {
                Ok(updated) => updated,
                Err(e) => return Err(progress.stopped(&ancestor_id, e)),
            };

            let Some(ancestor) = updated else {
                if progress.completed() == 0 {
                    return Err(TreeError::not_found(ancestor_id));
                }
                return Err(progress.stopped(&ancestor_id, "ancestor no longer exists"));
            };

            tracing::debug!(
                "{:?} {} id(s) at ancestor '{}'",
                direction,
                ids.len(),
                ancestor_id
            );
            progress.advance(1);

            next = ancestor
                .get(fields::PARENT)
                .and_then(|p| p.as_str())
                .map(str::to_string);
        }

        Ok(progress.completed())
    }
}
