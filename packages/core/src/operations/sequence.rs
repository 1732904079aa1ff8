//! Sequence Reorderer
//!
//! Maintains the dense 0-based `sequence` of the children of every parent.
//! Siblings are never shifted one document at a time: each shift is a single
//! bulk update scoped by parent and a sequence range, so the ordering of one
//! sibling group changes atomically per call.
//!
//! The reorderer computes and returns the final position of the affected
//! node; writing that position (together with the new parent, on a move) is
//! the caller's job. The moved node itself is excluded from every shift.

use crate::db::{Collection, DocumentStore, Filter, Patch};
use crate::models::fields;
use crate::operations::children_of;
use crate::services::TreeError;
use std::sync::Arc;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReorderOperation {
    /// Append a new node to a parent's children
    Create,
    /// Close the gap left by a removed node
    Delete,
    /// Reposition a node, within its parent or into another one
    Move,
}

/// One reorder request
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reorder {
    pub operation: ReorderOperation,
    /// Node being deleted or moved (None on create, where it does not exist yet)
    pub node_id: Option<String>,
    pub parent_before: Option<String>,
    pub parent_after: Option<String>,
    pub old_sequence: u32,
    /// Requested position; `None` appends
    pub new_sequence: Option<u32>,
}

impl Reorder {
    pub fn create(parent: Option<&str>) -> Self {
        Self {
            operation: ReorderOperation::Create,
            node_id: None,
            parent_before: None,
            parent_after: parent.map(str::to_string),
            old_sequence: 0,
            new_sequence: None,
        }
    }

    pub fn delete(node_id: &str, parent: Option<&str>, old_sequence: u32) -> Self {
        Self {
            operation: ReorderOperation::Delete,
            node_id: Some(node_id.to_string()),
            parent_before: parent.map(str::to_string),
            parent_after: None,
            old_sequence,
            new_sequence: None,
        }
    }

    pub fn moved(
        node_id: &str,
        from: (Option<&str>, u32),
        to: (Option<&str>, Option<u32>),
    ) -> Self {
        Self {
            operation: ReorderOperation::Move,
            node_id: Some(node_id.to_string()),
            parent_before: from.0.map(str::to_string),
            parent_after: to.0.map(str::to_string),
            old_sequence: from.1,
            new_sequence: to.1,
        }
    }

    pub fn is_same_parent(&self) -> bool {
        self.parent_before == self.parent_after
    }
}

pub struct SequenceReorderer {
    store: Arc<dyn DocumentStore>,
}

impl SequenceReorderer {
    pub fn new(store: Arc<dyn DocumentStore>) -> Self {
        Self { store }
    }

    /// Shift the affected sibling groups and return the node's final sequence.
    ///
    /// For `Delete` the returned value is the removed position.
    pub async fn reorder(&self, request: &Reorder) -> Result<u32, TreeError> {
        match request.operation {
            ReorderOperation::Create => {
                self.sibling_count(request.parent_after.as_deref(), None)
                    .await
            }
            ReorderOperation::Delete => {
                self.close_gap(
                    request.parent_before.as_deref(),
                    request.old_sequence,
                    request.node_id.as_deref(),
                )
                .await?;
                Ok(request.old_sequence)
            }
            ReorderOperation::Move if request.is_same_parent() => self.move_within(request).await,
            ReorderOperation::Move => self.move_across(request).await,
        }
    }

    /// Number of children of `parent`, not counting `exclude`
    async fn sibling_count(
        &self,
        parent: Option<&str>,
        exclude: Option<&str>,
    ) -> Result<u32, TreeError> {
        let filter = Self::siblings(parent, exclude);
        let count = self
            .store
            .count(Collection::Categories, &filter)
            .await
            .map_err(|e| TreeError::store(format!("count children of {}", describe(parent)), e))?;
        Ok(u32::try_from(count).unwrap_or(u32::MAX))
    }

    async fn shift(
        &self,
        filter: Filter,
        delta: i64,
        parent: Option<&str>,
    ) -> Result<u64, TreeError> {
        let shifted = self
            .store
            .update_many(
                Collection::Categories,
                &filter,
                &Patch::new().inc(fields::SEQUENCE, delta),
            )
            .await
            .map_err(|e| TreeError::store(format!("shift siblings under {}", describe(parent)), e))?;
        tracing::debug!("Shifted {} sibling(s) under {} by {}", shifted, describe(parent), delta);
        Ok(shifted)
    }

    fn siblings(parent: Option<&str>, exclude: Option<&str>) -> Filter {
        match exclude {
            Some(id) => children_of(parent).ne(fields::ID, id),
            None => children_of(parent),
        }
    }

    async fn close_gap(
        &self,
        parent: Option<&str>,
        old_sequence: u32,
        exclude: Option<&str>,
    ) -> Result<u64, TreeError> {
        let filter = Self::siblings(parent, exclude).gt(fields::SEQUENCE, i64::from(old_sequence));
        self.shift(filter, -1, parent).await
    }

    async fn move_within(&self, request: &Reorder) -> Result<u32, TreeError> {
        let parent = request.parent_before.as_deref();
        let node_id = request.node_id.as_deref();
        let old = request.old_sequence;

        // Valid positions run from 0 up to the number of other siblings
        let others = self.sibling_count(parent, node_id).await?;
        let new = request.new_sequence.unwrap_or(others).min(others);

        if new > old {
            let filter = Self::siblings(parent, node_id)
                .gt(fields::SEQUENCE, i64::from(old))
                .lte(fields::SEQUENCE, i64::from(new));
            self.shift(filter, -1, parent).await?;
        } else if new < old {
            let filter = Self::siblings(parent, node_id)
                .gte(fields::SEQUENCE, i64::from(new))
                .lt(fields::SEQUENCE, i64::from(old));
            self.shift(filter, 1, parent).await?;
        }
        Ok(new)
    }

    async fn move_across(&self, request: &Reorder) -> Result<u32, TreeError> {
        let from = request.parent_before.as_deref();
        let to = request.parent_after.as_deref();
        let node_id = request.node_id.as_deref();

        let available = self.sibling_count(to, node_id).await?;
        let new = request.new_sequence.unwrap_or(available).min(available);

        // Disjoint sibling groups: no ordering between the two shifts
        let close = Self::siblings(from, node_id)
            .gte(fields::SEQUENCE, i64::from(request.old_sequence));
        let open = Self::siblings(to, node_id).gte(fields::SEQUENCE, i64::from(new));
        let (closed, opened) = tokio::join!(self.shift(close, -1, from), self.shift(open, 1, to));
        closed?;
        opened?;
        Ok(new)
    }
}

fn describe(parent: Option<&str>) -> String {
    match parent {
        Some(id) => format!("'{}'", id),
        None => "root".to_string(),
    }
}
