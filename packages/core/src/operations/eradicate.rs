//! Subtree Eradicator
//!
//! Cascading delete of a category, every category below it and every product
//! reference to any of them. The two deletions touch different collections
//! and are issued concurrently; both are always issued, and a failure of
//! either one is reported with the branch that failed.

use crate::config::ClosureSource;
use crate::db::{Collection, DocumentStore, Filter};
use crate::models::{fields, Category};
use crate::operations::{
    fetch_category, find_categories, id_values, WalkContext, WalkKind, WalkProgress,
};
use crate::services::{CascadeBranch, ReferenceCleaner, TreeError};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::sync::Arc;

/// Outcome of a completed eradication
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EradicationReport {
    pub root_id: String,
    /// The closure set: the root followed by every descendant
    pub category_ids: Vec<String>,
    pub categories_deleted: u64,
    /// Product documents cleared or deleted
    pub product_references: u64,
}

pub struct SubtreeEradicator {
    store: Arc<dyn DocumentStore>,
    cleaner: Arc<dyn ReferenceCleaner>,
    closure_source: ClosureSource,
}

impl SubtreeEradicator {
    pub fn new(
        store: Arc<dyn DocumentStore>,
        cleaner: Arc<dyn ReferenceCleaner>,
        closure_source: ClosureSource,
    ) -> Self {
        Self {
            store,
            cleaner,
            closure_source,
        }
    }

    /// `{root} ∪ descendants(root)`, from the cached closure or by walking children
    pub async fn closure_set(
        &self,
        root: &Category,
        ctx: &WalkContext,
    ) -> Result<Vec<String>, TreeError> {
        match self.closure_source {
            ClosureSource::Cache => Ok(root.subtree_ids()),
            ClosureSource::Walk => collect_subtree(self.store.as_ref(), &root.id, ctx).await,
        }
    }

    /// Delete `node_id`, its subtree and all product references to them
    pub async fn eradicate(
        &self,
        node_id: &str,
        ctx: &WalkContext,
    ) -> Result<EradicationReport, TreeError> {
        let root = fetch_category(self.store.as_ref(), node_id)
            .await
            .map_err(|e| TreeError::store(format!("eradicate '{}'", node_id), e))?
            .ok_or_else(|| TreeError::not_found(node_id))?;
        let ids = self.closure_set(&root, ctx).await?;
        self.eradicate_set(node_id, ids).await
    }

    /// Delete exactly the categories in `ids` and the product references to them
    pub async fn eradicate_set(
        &self,
        root_id: &str,
        ids: Vec<String>,
    ) -> Result<EradicationReport, TreeError> {
        let filter = Filter::by_ids(ids.iter().cloned());
        let (categories, references) = tokio::join!(
            self.store.delete_many(Collection::Categories, &filter),
            self.cleaner.remove_references(&ids),
        );

        match (categories, references) {
            (Ok(categories_deleted), Ok(product_references)) => {
                tracing::info!(
                    "Eradicated '{}': {} categor(ies), {} product reference(s)",
                    root_id,
                    categories_deleted,
                    product_references
                );
                Ok(EradicationReport {
                    root_id: root_id.to_string(),
                    category_ids: ids,
                    categories_deleted,
                    product_references,
                })
            }
            (Err(e), Ok(_)) => {
                tracing::warn!("Eradication of '{}' deleted product references only: {}", root_id, e);
                Err(TreeError::cascade_partial(root_id, CascadeBranch::Categories, e))
            }
            (Ok(_), Err(e)) => {
                tracing::warn!("Eradication of '{}' deleted categories only: {}", root_id, e);
                Err(TreeError::cascade_partial(
                    root_id,
                    CascadeBranch::ProductReferences,
                    e,
                ))
            }
            (Err(categories_err), Err(references_err)) => {
                tracing::warn!(
                    "Eradication of '{}' failed on both branches: {}; {}",
                    root_id,
                    categories_err,
                    references_err
                );
                Err(TreeError::store(
                    format!("eradicate '{}'", root_id),
                    categories_err,
                ))
            }
        }
    }
}

/// Collect `{root} ∪ descendants` by walking parent pointers downward, root first
pub async fn collect_subtree(
    store: &dyn DocumentStore,
    root_id: &str,
    ctx: &WalkContext,
) -> Result<Vec<String>, TreeError> {
    let mut progress = WalkProgress::begin(ctx, WalkKind::Subtree, root_id);
    let mut ids = vec![root_id.to_string()];
    let mut seen: HashSet<String> = HashSet::from([root_id.to_string()]);
    let mut frontier = vec![root_id.to_string()];

    while !frontier.is_empty() {
        let at = frontier.join(",");
        progress.check(&at)?;

        let children = find_categories(
            store,
            &Filter::new().is_in(fields::PARENT, id_values(&frontier)),
        )
        .await
        .map_err(|e| progress.stopped(&at, e))?;

        frontier = children
            .into_iter()
            .map(|c| c.id)
            .filter(|id| seen.insert(id.clone()))
            .collect();
        ids.extend(frontier.iter().cloned());
        progress.advance(frontier.len());
    }
    Ok(ids)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ProductReferenceConfig;
    use crate::db::{Document, Fault, InMemoryStore, StoreOperation};
    use crate::operations::test_support::{chain, load, put, set_descendants};
    use crate::services::ProductReferenceCleaner;
    use serde_json::{json, Value};

    async fn add_product(store: &InMemoryStore, id: &str, category: &str) {
        let Value::Object(document) = json!({
            "id": id,
            "accounting": {"category": {"_id": category, "name": category}}
        }) else {
            unreachable!()
        };
        store.insert(Collection::Products, document).await.unwrap();
    }

    fn eradicator(store: &Arc<InMemoryStore>, source: ClosureSource) -> SubtreeEradicator {
        let cleaner = Arc::new(ProductReferenceCleaner::new(
            store.clone(),
            ProductReferenceConfig::default(),
        ));
        SubtreeEradicator::new(store.clone(), cleaner, source)
    }

    async fn product(store: &InMemoryStore, id: &str) -> Document {
        store.get(Collection::Products, id).await.unwrap().unwrap()
    }

    #[tokio::test]
    async fn test_eradicate_removes_subtree_and_clears_references() {
        let store = chain().await;
        put(&store, "other", "Other", None, 1).await;
        add_product(&store, "p1", "b").await;
        add_product(&store, "p2", "other").await;

        let report = eradicator(&store, ClosureSource::Cache)
            .eradicate("a", &WalkContext::default())
            .await
            .unwrap();
        assert_eq!(report.category_ids, vec!["a", "b", "c"]);
        assert_eq!(report.categories_deleted, 3);
        assert_eq!(report.product_references, 1);

        assert_eq!(store.len(Collection::Categories).await, 1);
        assert_eq!(product(&store, "p1").await["accounting"]["category"], Value::Null);
        assert_eq!(
            product(&store, "p2").await["accounting"]["category"]["_id"],
            json!("other")
        );
    }

    #[tokio::test]
    async fn test_walk_source_ignores_stale_closure() {
        let store = chain().await;
        // Stale cache: A has lost track of C
        set_descendants(&store, "a", &["b"]).await;

        let cached = eradicator(&store, ClosureSource::Cache)
            .closure_set(&load(&store, "a").await, &WalkContext::default())
            .await
            .unwrap();
        assert_eq!(cached, vec!["a", "b"]);

        let report = eradicator(&store, ClosureSource::Walk)
            .eradicate("a", &WalkContext::default())
            .await
            .unwrap();
        assert_eq!(report.category_ids, vec!["a", "b", "c"]);
        assert!(store.is_empty(Collection::Categories).await);
    }

    #[tokio::test]
    async fn test_missing_root_is_not_found() {
        let store = Arc::new(InMemoryStore::new());
        let err = eradicator(&store, ClosureSource::Cache)
            .eradicate("ghost", &WalkContext::default())
            .await
            .unwrap_err();
        assert!(matches!(err, TreeError::NotFound { .. }));
    }

    #[tokio::test]
    async fn test_failed_product_branch_is_cascade_partial() {
        let store = chain().await;
        add_product(&store, "p1", "c").await;
        store.inject_fault(Fault::on(Collection::Products, StoreOperation::UpdateMany));

        let err = eradicator(&store, ClosureSource::Cache)
            .eradicate("b", &WalkContext::default())
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            TreeError::CascadeDeletePartial { failed: CascadeBranch::ProductReferences, .. }
        ));
        // The category branch was still issued
        assert_eq!(store.len(Collection::Categories).await, 1);
    }

    #[tokio::test]
    async fn test_failed_category_branch_is_cascade_partial() {
        let store = chain().await;
        add_product(&store, "p1", "c").await;
        store.inject_fault(Fault::on(Collection::Categories, StoreOperation::DeleteMany));

        let err = eradicator(&store, ClosureSource::Cache)
            .eradicate("b", &WalkContext::default())
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            TreeError::CascadeDeletePartial { failed: CascadeBranch::Categories, .. }
        ));
        assert_eq!(product(&store, "p1").await["accounting"]["category"], Value::Null);
    }

    #[tokio::test]
    async fn test_both_branches_failing_is_store_unavailable() {
        let store = chain().await;
        store.inject_fault(Fault::on(Collection::Categories, StoreOperation::DeleteMany));
        store.inject_fault(Fault::on(Collection::Products, StoreOperation::UpdateMany));

        let err = eradicator(&store, ClosureSource::Cache)
            .eradicate("a", &WalkContext::default())
            .await
            .unwrap_err();
        assert!(matches!(err, TreeError::StoreUnavailable { .. }));
        assert_eq!(store.len(Collection::Categories).await, 3);
    }

    #[tokio::test]
    async fn test_collect_subtree_of_leaf() {
        let store = chain().await;
        let ids = collect_subtree(store.as_ref(), "c", &WalkContext::default())
            .await
            .unwrap();
        assert_eq!(ids, vec!["c"]);
    }
}
