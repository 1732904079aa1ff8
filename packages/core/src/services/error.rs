//! Service Layer Error Types
//!
//! This module defines the errors every tree operation can surface. Store
//! failures are never swallowed: a walk that stops partway reports where it
//! stopped, and a cascade delete that only half succeeded says which half failed.

use crate::db::StoreError;
use crate::models::ValidationError;
use crate::operations::WalkKind;
use std::fmt;
use thiserror::Error;

/// The two independent branches of a subtree eradication
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CascadeBranch {
    Categories,
    ProductReferences,
}

impl fmt::Display for CascadeBranch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CascadeBranch::Categories => f.write_str("category deletion"),
            CascadeBranch::ProductReferences => f.write_str("product reference cleanup"),
        }
    }
}

/// Tree operation errors
///
/// Provides the error kinds of the engine with enough context (node id,
/// operation, position in a walk) to support manual repair.
#[derive(Error, Debug)]
pub enum TreeError {
    /// Referenced category does not exist
    #[error("Category not found: {id}")]
    NotFound { id: String },

    /// The store failed before the operation changed anything
    #[error("Store unavailable during {context}: {source}")]
    StoreUnavailable {
        context: String,
        #[source]
        source: StoreError,
    },

    /// An upward or downward walk stopped partway
    ///
    /// Nodes visited before `stopped_at` were updated; `stopped_at` and the rest
    /// of the walk were not. Each step is idempotent, so the operation (or
    /// `CategoryService::reconcile`) may be re-run to converge.
    #[error("{walk} walk from '{node_id}' stopped at '{stopped_at}' after {completed} step(s): {reason}")]
    PartialWalkFailure {
        walk: WalkKind,
        node_id: String,
        completed: usize,
        stopped_at: String,
        reason: String,
    },

    /// One eradication branch failed while the other completed
    #[error("Cascade delete of '{root_id}' incomplete: {failed} failed: {reason}")]
    CascadeDeletePartial {
        root_id: String,
        failed: CascadeBranch,
        reason: String,
    },

    /// Moving a category under itself or one of its descendants
    #[error("Cannot move '{id}' under '{target_parent}': target is inside the moved subtree")]
    CircularMove { id: String, target_parent: String },

    #[error("Invalid category name: {0}")]
    InvalidName(#[from] ValidationError),

    /// The tree root of a node kept changing while its lock was being acquired
    #[error("Lock contention on '{id}' after {attempts} attempt(s)")]
    LockContention { id: String, attempts: usize },

    #[error("Configuration error: {0}")]
    Config(String),
}

impl TreeError {
    /// Create a not found error
    pub fn not_found(id: impl Into<String>) -> Self {
        Self::NotFound { id: id.into() }
    }

    /// Wrap a store failure with the operation it interrupted
    pub fn store(context: impl Into<String>, source: StoreError) -> Self {
        Self::StoreUnavailable {
            context: context.into(),
            source,
        }
    }

    /// Create a circular move error
    pub fn circular_move(id: impl Into<String>, target_parent: impl Into<String>) -> Self {
        Self::CircularMove {
            id: id.into(),
            target_parent: target_parent.into(),
        }
    }

    /// Create a cascade delete error
    pub fn cascade_partial(
        root_id: impl Into<String>,
        failed: CascadeBranch,
        reason: impl fmt::Display,
    ) -> Self {
        Self::CascadeDeletePartial {
            root_id: root_id.into(),
            failed,
            reason: reason.to_string(),
        }
    }

    /// True when the tree may be left with a violated invariant that a re-run
    /// or a reconcile repairs
    pub fn is_partial(&self) -> bool {
        matches!(
            self,
            TreeError::PartialWalkFailure { .. } | TreeError::CascadeDeletePartial { .. }
        )
    }
}

impl From<StoreError> for TreeError {
    fn from(source: StoreError) -> Self {
        Self::store("store call", source)
    }
}
