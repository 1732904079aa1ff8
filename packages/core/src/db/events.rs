//! Domain Events for the Category Tree
//!
//! This module defines the domain events emitted by `CategoryService` after a
//! tree mutation has completed. Events follow the observer pattern, allowing
//! other parts of a host (caches, search indexers, UI bridges) to react to
//! tree changes without coupling to the store.
//!
//! # Architecture
//!
//! Events are emitted using tokio's broadcast channel, allowing multiple
//! subscribers to receive notifications asynchronously. Events are only emitted
//! for operations that finished successfully; partial failures surface as errors.

use crate::models::Category;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Where a category moved from and to
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CategoryMove {
    pub id: String,
    pub from_parent: Option<String>,
    pub to_parent: Option<String>,
    pub from_sequence: u32,
    pub to_sequence: u32,
}

/// What changed in the tree
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum TreeChange {
    /// A new category was inserted
    #[serde(rename = "category:created")]
    CategoryCreated { category: Category },

    /// A category was re-parented or reordered among its siblings
    #[serde(rename = "category:moved")]
    CategoryMoved(CategoryMove),

    /// A category's name changed (its subtree's full names were rewritten)
    #[serde(rename = "category:renamed")]
    #[serde(rename_all = "camelCase")]
    CategoryRenamed { id: String, full_name: String },

    /// A category, its descendants and their product references were removed
    #[serde(rename = "subtree:eradicated")]
    #[serde(rename_all = "camelCase")]
    SubtreeEradicated {
        root_id: String,
        category_ids: Vec<String>,
        product_references: u64,
    },
}

impl TreeChange {
    /// Get a string representation of the event type
    pub fn event_type(&self) -> &str {
        match self {
            TreeChange::CategoryCreated { .. } => "category:created",
            TreeChange::CategoryMoved(_) => "category:moved",
            TreeChange::CategoryRenamed { .. } => "category:renamed",
            TreeChange::SubtreeEradicated { .. } => "subtree:eradicated",
        }
    }
}

/// Domain event: a change plus the time it completed
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TreeEvent {
    pub occurred_at: DateTime<Utc>,
    #[serde(flatten)]
    pub change: TreeChange,
}

impl TreeEvent {
    pub fn now(change: TreeChange) -> Self {
        Self {
            occurred_at: Utc::now(),
            change,
        }
    }
}
