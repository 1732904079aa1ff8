//! Category Service - Tree Operations Orchestration
//!
//! This module provides the `CategoryService` which composes the tree
//! maintenance algorithms into the operations callers use:
//!
//! - Create, move, rename and delete categories
//! - Read categories, their ordered children and their ancestor chain
//! - Reconcile and audit the materialized tree data
//! - Domain events for every completed mutation
//!
//! Every mutating operation runs under the lock of the tree(s) it touches and
//! under a fresh [`WalkContext`] (deadline from `walk_timeout_ms`, cancelled by
//! [`CategoryService::shutdown`]).

use crate::config::TreeConfig;
use crate::db::{CategoryMove, Collection, DocumentStore, Filter, Patch, TreeChange, TreeEvent};
use crate::models::{fields, Category, NewCategory};
use crate::operations::{
    audit, children_of, compose_full_name, fetch_category, find_categories, AncestorClosure,
    ClosureReconciler, DepthRecalculator, EradicationReport, PathNameMaterializer,
    ReconcileReport, ReconcileScope, Reorder, SequenceReorderer, SubtreeEradicator, Violation,
    WalkContext, WalkKind, WalkProgress,
};
use crate::services::locks::{LockKey, TreeGuard, TreeLocks};
use crate::services::{ProductReferenceCleaner, ReferenceCleaner, TreeError};
use serde_json::Value;
use std::collections::BTreeSet;
use std::sync::Arc;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tracing::instrument;

/// Fields the engine owns; callers cannot smuggle them in as attributes
const RESERVED_FIELDS: [&str; 7] = [
    fields::ID,
    fields::NAME,
    fields::FULL_NAME,
    fields::PARENT,
    fields::DESCENDANTS,
    fields::NESTING_LEVEL,
    fields::SEQUENCE,
];

/// Something whose tree must be locked
#[derive(Debug, Clone, Copy)]
enum LockTarget<'a> {
    /// An existing node (its tree, plus the root level if it is a root)
    Node(&'a str),
    /// A parent that gains or loses a child (`None` = the root level)
    Parent(Option<&'a str>),
    /// A node that becomes a root; its subtree turns into tree `id`
    NewRoot(&'a str),
    /// The root level and every tree
    AllTrees,
}

/// Orchestrates the tree algorithms over a document store
///
/// # Examples
///
/// ```rust
/// use category_tree_core::db::InMemoryStore;
/// use category_tree_core::{CategoryService, NewCategory, TreeConfig};
/// use std::sync::Arc;
///
/// # tokio_test::block_on(async {
/// let service = CategoryService::new(Arc::new(InMemoryStore::new()), TreeConfig::default())?;
///
/// let hardware = service.create_category(NewCategory::new("Hardware")).await?;
/// let tools = service
///     .create_category(NewCategory::new("Tools").under(&hardware.id))
///     .await?;
/// assert_eq!(tools.full_name, "Hardware/Tools");
/// assert_eq!(tools.nesting_level, 1);
/// # Ok::<_, category_tree_core::TreeError>(())
/// # }).unwrap();
/// ```
pub struct CategoryService {
    store: Arc<dyn DocumentStore>,
    config: TreeConfig,
    locks: TreeLocks,
    closure: AncestorClosure,
    depth: DepthRecalculator,
    sequence: SequenceReorderer,
    path_names: PathNameMaterializer,
    eradicator: SubtreeEradicator,
    reconciler: ClosureReconciler,

    /// Broadcast channel for domain events
    event_tx: broadcast::Sender<TreeEvent>,

    /// Parent of every walk's cancellation token
    shutdown: CancellationToken,
}

impl CategoryService {
    /// Create a service that cleans product references per `config.product_references`
    pub fn new(store: Arc<dyn DocumentStore>, config: TreeConfig) -> Result<Self, TreeError> {
        let cleaner = Arc::new(ProductReferenceCleaner::new(
            store.clone(),
            config.product_references.clone(),
        ));
        Self::with_reference_cleaner(store, config, cleaner)
    }

    /// Create a service with a host-provided reference cleaner
    pub fn with_reference_cleaner(
        store: Arc<dyn DocumentStore>,
        config: TreeConfig,
        cleaner: Arc<dyn ReferenceCleaner>,
    ) -> Result<Self, TreeError> {
        config.validate().map_err(TreeError::Config)?;

        let (event_tx, _) = broadcast::channel(config.event_channel_capacity);

        Ok(Self {
            closure: AncestorClosure::new(store.clone()),
            depth: DepthRecalculator::new(store.clone()),
            sequence: SequenceReorderer::new(store.clone()),
            path_names: PathNameMaterializer::new(store.clone(), config.path_separator.clone()),
            eradicator: SubtreeEradicator::new(store.clone(), cleaner, config.closure_source),
            reconciler: ClosureReconciler::new(store.clone(), config.path_separator.clone()),
            locks: TreeLocks::new(),
            store,
            config,
            event_tx,
            shutdown: CancellationToken::new(),
        })
    }

    pub fn store(&self) -> &Arc<dyn DocumentStore> {
        &self.store
    }

    pub fn config(&self) -> &TreeConfig {
        &self.config
    }

    /// Lock table serializing the service's mutations.
    ///
    /// Hosts writing to the store outside the service can take the same keys.
    pub fn locks(&self) -> &TreeLocks {
        &self.locks
    }

    /// Subscribe to domain events
    ///
    /// Events are sent after an operation completed; failed operations emit nothing.
    pub fn subscribe_to_events(&self) -> broadcast::Receiver<TreeEvent> {
        self.event_tx.subscribe()
    }

    /// Cancel every running and future walk.
    ///
    /// Operations interrupted mid-walk fail with `PartialWalkFailure`.
    pub fn shutdown(&self) {
        tracing::info!("Category service shutting down, cancelling walks");
        self.shutdown.cancel();
    }

    fn emit_event(&self, change: TreeChange) {
        let _ = self.event_tx.send(TreeEvent::now(change));
    }

    fn walk_context(&self) -> WalkContext {
        WalkContext::from_config(&self.config).with_cancel_token(self.shutdown.child_token())
    }

    async fn require(&self, id: &str) -> Result<Category, TreeError> {
        fetch_category(self.store.as_ref(), id)
            .await
            .map_err(|e| TreeError::store(format!("get '{}'", id), e))?
            .ok_or_else(|| TreeError::not_found(id))
    }

    // ========================================================================
    // Reads
    // ========================================================================

    /// Get a category by id
    pub async fn get_category(&self, id: &str) -> Result<Option<Category>, TreeError> {
        fetch_category(self.store.as_ref(), id)
            .await
            .map_err(|e| TreeError::store(format!("get '{}'", id), e))
    }

    /// Direct children of `parent` (roots when `None`), ordered by sequence
    pub async fn get_children(&self, parent: Option<&str>) -> Result<Vec<Category>, TreeError> {
        let mut children = find_categories(self.store.as_ref(), &children_of(parent))
            .await
            .map_err(|e| TreeError::store("get children", e))?;
        children.sort_by(|a, b| a.sequence.cmp(&b.sequence).then_with(|| a.id.cmp(&b.id)));
        Ok(children)
    }

    /// Ancestors of `id`, nearest first
    pub async fn get_ancestors(&self, id: &str) -> Result<Vec<Category>, TreeError> {
        self.ancestors_of(id, &self.walk_context()).await
    }

    async fn ancestors_of(&self, id: &str, ctx: &WalkContext) -> Result<Vec<Category>, TreeError> {
        let node = self.require(id).await?;
        let mut progress = WalkProgress::begin(ctx, WalkKind::Ancestors, id);
        let mut ancestors = Vec::new();
        let mut next = node.parent;

        while let Some(parent_id) = next.take() {
            progress.check(&parent_id)?;
            let parent = fetch_category(self.store.as_ref(), &parent_id)
                .await
                .map_err(|e| progress.stopped(&parent_id, e))?
                .ok_or_else(|| progress.stopped(&parent_id, "parent does not exist"))?;
            progress.advance(1);
            next = parent.parent.clone();
            ancestors.push(parent);
        }
        Ok(ancestors)
    }

    /// Id of the top-most ancestor of `id` (itself for a root)
    async fn root_of(&self, id: &str, ctx: &WalkContext) -> Result<String, TreeError> {
        let ancestors = self.ancestors_of(id, ctx).await?;
        Ok(ancestors
            .last()
            .map_or_else(|| id.to_string(), |root| root.id.clone()))
    }

    // ========================================================================
    // Locking
    // ========================================================================

    async fn resolve_keys(
        &self,
        targets: &[LockTarget<'_>],
        ctx: &WalkContext,
    ) -> Result<BTreeSet<LockKey>, TreeError> {
        let mut keys = BTreeSet::new();
        for target in targets {
            match *target {
                LockTarget::Node(id) => {
                    let root = self.root_of(id, ctx).await?;
                    if root == id {
                        keys.insert(LockKey::RootLevel);
                    }
                    keys.insert(LockKey::Tree(root));
                }
                LockTarget::Parent(Some(id)) => {
                    keys.insert(LockKey::Tree(self.root_of(id, ctx).await?));
                }
                LockTarget::Parent(None) => {
                    keys.insert(LockKey::RootLevel);
                }
                LockTarget::NewRoot(id) => {
                    keys.insert(LockKey::Tree(id.to_string()));
                }
                LockTarget::AllTrees => {
                    keys.insert(LockKey::RootLevel);
                    let roots = self.get_children(None).await?;
                    keys.extend(roots.into_iter().map(|root| LockKey::Tree(root.id)));
                }
            }
        }
        Ok(keys)
    }

    /// Lock the trees of `targets`, re-resolving until the keys are stable
    async fn lock(
        &self,
        targets: &[LockTarget<'_>],
        ctx: &WalkContext,
    ) -> Result<TreeGuard, TreeError> {
        let mut attempts = 0;
        loop {
            attempts += 1;
            let keys = self.resolve_keys(targets, ctx).await?;
            let guard = self.locks.acquire(keys).await;

            // A concurrent move may have re-rooted a target (or a root may
            // have been created) while we waited
            let current = self.resolve_keys(targets, ctx).await?;
            if guard.covers(&current) {
                return Ok(guard);
            }
            drop(guard);

            if attempts > self.config.lock_retry_limit {
                let id = match targets.first() {
                    Some(LockTarget::Node(id))
                    | Some(LockTarget::Parent(Some(id)))
                    | Some(LockTarget::NewRoot(id)) => *id,
                    _ => "<root level>",
                };
                tracing::warn!("Giving up on lock for '{}' after {} attempt(s)", id, attempts);
                return Err(TreeError::LockContention {
                    id: id.to_string(),
                    attempts,
                });
            }
            tracing::debug!("Lock keys changed while waiting (attempt {}), retrying", attempts);
        }
    }

    // ========================================================================
    // Mutations
    // ========================================================================

    /// Create a category, appended after its future siblings
    #[instrument(skip(self, params), fields(name = %params.name, parent = ?params.parent))]
    pub async fn create_category(&self, params: NewCategory) -> Result<Category, TreeError> {
        Category::validate_name(&params.name, &self.config.path_separator)?;

        let ctx = self.walk_context();
        let parent_id = params.parent.as_deref();
        let _guard = self.lock(&[LockTarget::Parent(parent_id)], &ctx).await?;

        let parent = match parent_id {
            Some(id) => Some(self.require(id).await?),
            None => None,
        };

        let sequence = self.sequence.reorder(&Reorder::create(parent_id)).await?;

        let mut attributes = params.attributes;
        attributes.retain(|key, _| !RESERVED_FIELDS.contains(&key.as_str()));
        let draft = Category {
            id: String::new(),
            name: params.name.clone(),
            full_name: compose_full_name(
                parent.as_ref().map(|p| p.full_name.as_str()),
                &params.name,
                &self.config.path_separator,
            ),
            parent: params.parent.clone(),
            descendants: Vec::new(),
            nesting_level: parent.as_ref().map_or(0, |p| p.nesting_level + 1),
            sequence,
            attributes,
        };
        let mut document = draft.to_document()?;
        // The store assigns the id
        document.remove(fields::ID);

        let stored = self
            .store
            .insert(Collection::Categories, document)
            .await
            .map_err(|e| TreeError::store("insert category", e))?;
        let category = Category::from_document(stored)?;

        if let Some(parent_id) = parent_id {
            self.closure
                .attach(&[category.id.clone()], parent_id, &ctx)
                .await?;
        }

        tracing::info!("Created category '{}' ({})", category.full_name, category.id);
        self.emit_event(TreeChange::CategoryCreated {
            category: category.clone(),
        });
        Ok(category)
    }

    /// Move a category to `new_parent` (`None` = root level) at `new_sequence`
    /// (`None` = append). Positions past the end are clamped.
    #[instrument(skip(self))]
    pub async fn move_category(
        &self,
        id: &str,
        new_parent: Option<&str>,
        new_sequence: Option<u32>,
    ) -> Result<Category, TreeError> {
        let ctx = self.walk_context();
        let mut targets = vec![LockTarget::Node(id), LockTarget::Parent(new_parent)];
        if new_parent.is_none() {
            // The subtree is walked after its parent pointer is cleared
            targets.push(LockTarget::NewRoot(id));
        }
        let _guard = self.lock(&targets, &ctx).await?;

        let node = self.require(id).await?;
        let target = match new_parent {
            Some(parent_id) => {
                if parent_id == id || node.has_descendant(parent_id) {
                    return Err(TreeError::circular_move(id, parent_id));
                }
                let target = self.require(parent_id).await?;
                // The cached closure may be stale; the parent chain is authoritative
                let chain = self.ancestors_of(parent_id, &ctx).await?;
                if chain.iter().any(|a| a.id == id) {
                    return Err(TreeError::circular_move(id, parent_id));
                }
                Some(target)
            }
            None => None,
        };

        let old_parent = node.parent.as_deref();
        let sequence = self
            .sequence
            .reorder(&Reorder::moved(
                id,
                (old_parent, node.sequence),
                (new_parent, new_sequence),
            ))
            .await?;

        if old_parent == new_parent {
            self.set_fields(id, Patch::new().set(fields::SEQUENCE, sequence))
                .await?;
        } else {
            self.set_fields(
                id,
                Patch::new()
                    .set(
                        fields::PARENT,
                        new_parent.map_or(Value::Null, Value::from),
                    )
                    .set(fields::SEQUENCE, sequence),
            )
            .await?;

            let subtree = self.eradicator.closure_set(&node, &ctx).await?;
            if let Some(old_parent) = old_parent {
                self.closure.detach(&subtree, old_parent, &ctx).await?;
            }
            if let Some(new_parent) = new_parent {
                self.closure.attach(&subtree, new_parent, &ctx).await?;
            }

            let level = target.as_ref().map_or(0, |t| t.nesting_level + 1);
            self.depth.recompute(id, level, &ctx).await?;
            self.path_names.rematerialize_subtree(id, &ctx).await?;
        }

        let moved = self.require(id).await?;
        tracing::info!(
            "Moved '{}' from {:?}:{} to {:?}:{}",
            id,
            node.parent,
            node.sequence,
            moved.parent,
            moved.sequence
        );
        self.emit_event(TreeChange::CategoryMoved(CategoryMove {
            id: id.to_string(),
            from_parent: node.parent.clone(),
            to_parent: moved.parent.clone(),
            from_sequence: node.sequence,
            to_sequence: moved.sequence,
        }));
        Ok(moved)
    }

    /// Rename a category; the full names of its whole subtree follow
    #[instrument(skip(self))]
    pub async fn rename_category(&self, id: &str, name: &str) -> Result<Category, TreeError> {
        Category::validate_name(name, &self.config.path_separator)?;

        let ctx = self.walk_context();
        let _guard = self.lock(&[LockTarget::Node(id)], &ctx).await?;

        self.set_fields(id, Patch::new().set(fields::NAME, name))
            .await?;
        self.path_names.rematerialize_subtree(id, &ctx).await?;

        let renamed = self.require(id).await?;
        tracing::info!("Renamed '{}' to '{}'", id, renamed.full_name);
        self.emit_event(TreeChange::CategoryRenamed {
            id: renamed.id.clone(),
            full_name: renamed.full_name.clone(),
        });
        Ok(renamed)
    }

    /// Delete a category with its whole subtree and every product reference to it.
    ///
    /// The sibling gap is closed and the ancestors forget the removed ids.
    #[instrument(skip(self))]
    pub async fn delete_category(&self, id: &str) -> Result<EradicationReport, TreeError> {
        let ctx = self.walk_context();
        let _guard = self.lock(&[LockTarget::Node(id)], &ctx).await?;

        let node = self.require(id).await?;
        let ids = self.eradicator.closure_set(&node, &ctx).await?;
        let report = self.eradicator.eradicate_set(id, ids).await?;

        self.sequence
            .reorder(&Reorder::delete(id, node.parent.as_deref(), node.sequence))
            .await?;
        if let Some(parent_id) = node.parent.as_deref() {
            self.closure
                .detach(&report.category_ids, parent_id, &ctx)
                .await?;
        }

        self.emit_event(TreeChange::SubtreeEradicated {
            root_id: report.root_id.clone(),
            category_ids: report.category_ids.clone(),
            product_references: report.product_references,
        });
        Ok(report)
    }

    async fn set_fields(&self, id: &str, patch: Patch) -> Result<(), TreeError> {
        self.store
            .update_one(Collection::Categories, &Filter::by_id(id), &patch)
            .await
            .map_err(|e| TreeError::store(format!("update '{}'", id), e))?
            .ok_or_else(|| TreeError::not_found(id))?;
        Ok(())
    }

    // ========================================================================
    // Repair
    // ========================================================================

    /// Rebuild the materialized tree data of `scope` from parent pointers
    #[instrument(skip(self))]
    pub async fn reconcile(&self, scope: ReconcileScope) -> Result<ReconcileReport, TreeError> {
        let ctx = self.walk_context();
        let target = match &scope {
            ReconcileScope::All => LockTarget::AllTrees,
            ReconcileScope::Subtree(id) => LockTarget::Node(id),
        };
        let _guard = self.lock(&[target], &ctx).await?;

        self.reconciler.rebuild(&scope, &ctx).await
    }

    /// Check every tree invariant; an empty list means the tree is consistent.
    ///
    /// Runs without locks, so mutations in flight may show up as violations.
    pub async fn audit(&self) -> Result<Vec<Violation>, TreeError> {
        audit(self.store.as_ref(), &self.config.path_separator).await
    }
}
