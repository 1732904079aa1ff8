//! Tree Maintenance Operations
//!
//! The algorithms that keep the materialized tree data of every category
//! consistent. Each one reads and writes the store on its own; none of them
//! assumes a transaction spanning more than one store call.
//!
//! - [`closure::AncestorClosure`] - `descendants` of every ancestor (upward walk)
//! - [`depth::DepthRecalculator`] - `nestingLevel` of a subtree (downward, level by level)
//! - [`sequence::SequenceReorderer`] - dense sibling `sequence` (bulk range shifts)
//! - [`path_name::PathNameMaterializer`] - `fullName` of a subtree (top-down)
//! - [`eradicate::SubtreeEradicator`] - cascading delete of a subtree and its product references
//! - [`reconcile`] - rebuild of the materialized data from parent pointers, and audit

pub mod closure;
pub mod depth;
pub mod eradicate;
pub mod path_name;
pub mod reconcile;
pub mod sequence;
pub mod walk;

pub use closure::AncestorClosure;
pub use depth::DepthRecalculator;
pub use eradicate::{EradicationReport, SubtreeEradicator};
pub use path_name::{compose_full_name, PathNameMaterializer};
pub use reconcile::{audit, ClosureReconciler, ReconcileReport, ReconcileScope, Violation};
pub use sequence::{Reorder, ReorderOperation, SequenceReorderer};
pub use walk::{WalkContext, WalkKind, WalkProgress};

use crate::db::{Collection, DocumentStore, Filter, StoreError};
use crate::models::{fields, Category};
use serde_json::Value;

/// Filter selecting the direct children of `parent` (roots when `None`)
pub fn children_of(parent: Option<&str>) -> Filter {
    Filter::new().eq(fields::PARENT, parent.map_or(Value::Null, Value::from))
}

/// Read and decode one category
pub async fn fetch_category(
    store: &dyn DocumentStore,
    id: &str,
) -> Result<Option<Category>, StoreError> {
    store
        .get(Collection::Categories, id)
        .await?
        .map(Category::from_document)
        .transpose()
}

/// Find and decode every category matching `filter`
pub async fn find_categories(
    store: &dyn DocumentStore,
    filter: &Filter,
) -> Result<Vec<Category>, StoreError> {
    store
        .find(Collection::Categories, filter)
        .await?
        .into_iter()
        .map(Category::from_document)
        .collect()
}

fn id_values(ids: &[String]) -> Vec<Value> {
    ids.iter().cloned().map(Value::String).collect()
}
