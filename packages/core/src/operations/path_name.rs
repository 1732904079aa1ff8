//! Path Name Materializer
//!
//! `fullName` is stored, not computed on read, so it has to be rewritten for
//! a node and every node below it whenever a name or a parent changes. The
//! subtree is processed top-down, one level at a time: a child's name is
//! composed from its parent's freshly written `fullName`, never from a stale
//! one. Writes within one level are independent and run concurrently.

use crate::db::{Collection, DocumentStore, Filter, Patch};
use crate::models::{fields, Category};
use crate::operations::{
    fetch_category, find_categories, id_values, WalkContext, WalkKind, WalkProgress,
};
use crate::services::TreeError;
use futures::future::try_join_all;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;

/// `parent_full_name + separator + name`, or `name` for a root
pub fn compose_full_name(parent_full_name: Option<&str>, name: &str, separator: &str) -> String {
    match parent_full_name {
        Some(parent) => format!("{}{}{}", parent, separator, name),
        None => name.to_string(),
    }
}

pub struct PathNameMaterializer {
    store: Arc<dyn DocumentStore>,
    separator: String,
}

impl PathNameMaterializer {
    pub fn new(store: Arc<dyn DocumentStore>, separator: impl Into<String>) -> Self {
        Self {
            store,
            separator: separator.into(),
        }
    }

    pub fn separator(&self) -> &str {
        &self.separator
    }

    /// Recompute and store the `fullName` of one node from its parent's current one
    pub async fn rematerialize(&self, node_id: &str) -> Result<Category, TreeError> {
        let context = || format!("rematerialize '{}'", node_id);

        let mut node = fetch_category(self.store.as_ref(), node_id)
            .await
            .map_err(|e| TreeError::store(context(), e))?
            .ok_or_else(|| TreeError::not_found(node_id))?;

        let parent_full_name = match node.parent.as_deref() {
            Some(parent_id) => Some(
                fetch_category(self.store.as_ref(), parent_id)
                    .await
                    .map_err(|e| TreeError::store(context(), e))?
                    .ok_or_else(|| TreeError::not_found(parent_id))?
                    .full_name,
            ),
            None => None,
        };

        let full_name = compose_full_name(parent_full_name.as_deref(), &node.name, &self.separator);
        if full_name != node.full_name {
            self.store
                .update_one(
                    Collection::Categories,
                    &Filter::by_id(node_id),
                    &Patch::new().set(fields::FULL_NAME, full_name.as_str()),
                )
                .await
                .map_err(|e| TreeError::store(context(), e))?
                .ok_or_else(|| TreeError::not_found(node_id))?;
            node.full_name = full_name;
        }
        Ok(node)
    }

    /// Rematerialize `node_id`, then every descendant top-down.
    ///
    /// Returns the number of nodes visited (the node itself included).
    pub async fn rematerialize_subtree(
        &self,
        node_id: &str,
        ctx: &WalkContext,
    ) -> Result<usize, TreeError> {
        let mut progress = WalkProgress::begin(ctx, WalkKind::PathName, node_id);
        progress.check(node_id)?;

        let root = self.rematerialize(node_id).await?;
        progress.advance(1);

        let mut visited: HashSet<String> = HashSet::from([root.id.clone()]);
        let mut frontier: HashMap<String, String> = HashMap::from([(root.id, root.full_name)]);

        while !frontier.is_empty() {
            let parent_ids: Vec<String> = frontier.keys().cloned().collect();
            let at = parent_ids.join(",");
            progress.check(&at)?;

            let children = find_categories(
                self.store.as_ref(),
                &Filter::new().is_in(fields::PARENT, id_values(&parent_ids)),
            )
            .await
            .map_err(|e| progress.stopped(&at, e))?;

            let mut next = HashMap::new();
            let mut writes = Vec::new();
            for child in children {
                if !visited.insert(child.id.clone()) {
                    continue;
                }
                let parent_full_name = child
                    .parent
                    .as_ref()
                    .and_then(|p| frontier.get(p))
                    .map(String::as_str);
                let full_name = compose_full_name(parent_full_name, &child.name, &self.separator);
                if full_name != child.full_name {
                    writes.push((child.id.clone(), full_name.clone()));
                }
                next.insert(child.id, full_name);
            }
            if next.is_empty() {
                break;
            }

            let requests: Vec<(Filter, Patch)> = writes
                .iter()
                .map(|(id, full_name)| {
                    (
                        Filter::by_id(id),
                        Patch::new().set(fields::FULL_NAME, full_name.as_str()),
                    )
                })
                .collect();
            try_join_all(requests.iter().map(|(filter, patch)| {
                self.store
                    .update_one(Collection::Categories, filter, patch)
            }))
            .await
            .map_err(|e| {
                let level_ids: Vec<&str> = next.keys().map(String::as_str).collect();
                progress.stopped(&level_ids.join(","), e)
            })?;

            tracing::debug!(
                "Rewrote {} full name(s) among {} node(s) below '{}'",
                writes.len(),
                next.len(),
                node_id
            );
            progress.advance(next.len());
            frontier = next;
        }

        Ok(progress.completed())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::{Fault, InMemoryStore, StoreOperation};
    use crate::operations::test_support::{chain, load, put};

    async fn rename(store: &InMemoryStore, id: &str, name: &str) {
        store
            .update_one(
                Collection::Categories,
                &Filter::by_id(id),
                &Patch::new().set(fields::NAME, name),
            )
            .await
            .unwrap();
    }

    #[test]
    fn test_compose_full_name() {
        assert_eq!(compose_full_name(Some("A"), "B", "/"), "A/B");
        assert_eq!(compose_full_name(Some("A / B"), "C", " / "), "A / B / C");
        assert_eq!(compose_full_name(None, "Root", "/"), "Root");
    }

    #[tokio::test]
    async fn test_rename_propagates_top_down() {
        let store = chain().await;
        let b = load(&store, "b").await;
        put(&store, "e", "E", Some(&b), 1).await;
        rename(&store, "a", "Hardware").await;

        let materializer = PathNameMaterializer::new(store.clone(), "/");
        let visited = materializer
            .rematerialize_subtree("a", &WalkContext::default())
            .await
            .unwrap();
        assert_eq!(visited, 4);

        assert_eq!(load(&store, "a").await.full_name, "Hardware");
        assert_eq!(load(&store, "b").await.full_name, "Hardware/B");
        assert_eq!(load(&store, "c").await.full_name, "Hardware/B/C");
        assert_eq!(load(&store, "e").await.full_name, "Hardware/B/E");
    }

    #[tokio::test]
    async fn test_rematerialize_single_node_reads_parent() {
        let store = chain().await;
        rename(&store, "c", "Screws").await;

        let c = PathNameMaterializer::new(store.clone(), "/")
            .rematerialize("c")
            .await
            .unwrap();
        assert_eq!(c.full_name, "A/B/Screws");
        assert_eq!(load(&store, "c").await.full_name, "A/B/Screws");
    }

    #[tokio::test]
    async fn test_consistent_subtree_is_not_rewritten() {
        let store = chain().await;
        let before = store.operation_count(StoreOperation::UpdateOne);

        PathNameMaterializer::new(store.clone(), "/")
            .rematerialize_subtree("a", &WalkContext::default())
            .await
            .unwrap();
        assert_eq!(store.operation_count(StoreOperation::UpdateOne), before);
    }

    #[tokio::test]
    async fn test_missing_parent_is_not_found() {
        let store = std::sync::Arc::new(InMemoryStore::new());
        let ghost = crate::models::Category {
            id: "ghost".to_string(),
            name: "Ghost".to_string(),
            full_name: "Ghost".to_string(),
            parent: None,
            descendants: Vec::new(),
            nesting_level: 0,
            sequence: 0,
            attributes: Default::default(),
        };
        put(&store, "orphan", "Orphan", Some(&ghost), 0).await;

        let err = PathNameMaterializer::new(store, "/")
            .rematerialize("orphan")
            .await
            .unwrap_err();
        assert!(matches!(err, TreeError::NotFound { id } if id == "ghost"));
    }

    #[tokio::test]
    async fn test_failed_level_reports_partial_walk() {
        let store = chain().await;
        rename(&store, "a", "Z").await;
        // Root write succeeds, the write for level B fails
        store.inject_fault(
            Fault::on(Collection::Categories, StoreOperation::UpdateOne).after(1),
        );

        let err = PathNameMaterializer::new(store.clone(), "/")
            .rematerialize_subtree("a", &WalkContext::default())
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            TreeError::PartialWalkFailure { walk: WalkKind::PathName, completed: 1, .. }
        ));
        assert_eq!(load(&store, "a").await.full_name, "Z");
        assert_eq!(load(&store, "b").await.full_name, "A/B");
    }
}
