//! Service Tests for Category Tree Operations
//!
//! Validates create / move / rename / delete end to end against the in-memory
//! store, including the invariants the audit checks after each operation.

#[cfg(test)]
mod category_service_tests {
    use crate::config::{ClosureSource, TreeConfig};
    use crate::db::{
        Collection, Document, DocumentStore, Fault, InMemoryStore, StoreOperation, TreeChange,
    };
    use crate::models::{Category, NewCategory, ValidationError};
    use crate::operations::test_support::put;
    use crate::operations::{ReconcileScope, WalkKind};
    use crate::services::{CategoryService, LockKey, TreeError};
    use serde_json::{json, Value};
    use std::collections::BTreeSet;
    use std::sync::Arc;
    use std::time::Duration;
    use tokio_test::{assert_err, assert_ok};

    /// Helper to create a service over a fresh in-memory store
    fn create_test_service() -> (CategoryService, Arc<InMemoryStore>) {
        create_test_service_with(TreeConfig::default())
    }

    fn create_test_service_with(config: TreeConfig) -> (CategoryService, Arc<InMemoryStore>) {
        let store = Arc::new(InMemoryStore::new());
        let service = CategoryService::new(store.clone(), config).unwrap();
        (service, store)
    }

    async fn create(service: &CategoryService, name: &str, parent: Option<&Category>) -> Category {
        let mut params = NewCategory::new(name);
        if let Some(parent) = parent {
            params = params.under(&parent.id);
        }
        service.create_category(params).await.unwrap()
    }

    async fn get(service: &CategoryService, id: &str) -> Category {
        service.get_category(id).await.unwrap().unwrap()
    }

    async fn assert_consistent(service: &CategoryService) {
        let violations = service.audit().await.unwrap();
        assert!(violations.is_empty(), "violations: {violations:?}");
    }

    fn product(id: &str, category_id: &str) -> Document {
        let Value::Object(document) = json!({
            "id": id,
            "name": format!("Product {id}"),
            "accounting": {"category": {"_id": category_id, "name": "ref"}}
        }) else {
            unreachable!()
        };
        document
    }

    #[tokio::test]
    async fn test_create_sets_tree_fields() {
        let (service, _store) = create_test_service();

        let a = create(&service, "A", None).await;
        assert_eq!(a.sequence, 0);
        assert_eq!(a.nesting_level, 0);
        assert_eq!(a.full_name, "A");
        assert!(a.parent.is_none());

        let b = create(&service, "B", Some(&a)).await;
        assert_eq!(b.sequence, 0);
        assert_eq!(b.nesting_level, 1);
        assert_eq!(b.full_name, "A/B");

        let c = create(&service, "C", Some(&a)).await;
        assert_eq!(c.sequence, 1);

        let a = get(&service, &a.id).await;
        assert!(a.has_descendant(&b.id));
        assert!(a.has_descendant(&c.id));
        assert_consistent(&service).await;
    }

    #[tokio::test]
    async fn test_create_keeps_attributes_but_not_reserved_fields() {
        let (service, _store) = create_test_service();
        let params = NewCategory::new("Services")
            .with_attribute("integrationId", json!("erp-1"))
            .with_attribute("sequence", json!(42));

        let created = service.create_category(params).await.unwrap();
        assert_eq!(created.sequence, 0);
        assert_eq!(created.attributes.get("integrationId"), Some(&json!("erp-1")));
        assert!(!created.attributes.contains_key("sequence"));
    }

    #[tokio::test]
    async fn test_create_rejects_invalid_names() {
        let (service, _store) = create_test_service();

        let err = service
            .create_category(NewCategory::new("   "))
            .await
            .unwrap_err();
        assert!(matches!(err, TreeError::InvalidName(ValidationError::EmptyName)));

        let err = service
            .create_category(NewCategory::new("A/B"))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            TreeError::InvalidName(ValidationError::NameContainsSeparator { .. })
        ));
    }

    #[tokio::test]
    async fn test_create_under_missing_parent_is_not_found() {
        let (service, store) = create_test_service();
        let err = service
            .create_category(NewCategory::new("X").under("ghost"))
            .await
            .unwrap_err();
        assert!(matches!(err, TreeError::NotFound { .. }));
        assert!(store.is_empty(Collection::Categories).await);
    }

    #[tokio::test]
    async fn test_move_child_to_root_level() {
        let (service, _store) = create_test_service();
        let a = create(&service, "A", None).await;
        let b = create(&service, "B", Some(&a)).await;
        let c = create(&service, "C", Some(&a)).await;

        let moved = service.move_category(&b.id, None, Some(0)).await.unwrap();
        assert!(moved.parent.is_none());
        assert_eq!(moved.sequence, 0);
        assert_eq!(moved.nesting_level, 0);
        assert_eq!(moved.full_name, "B");

        // C closes the gap under A, A shifts behind B among roots
        assert_eq!(get(&service, &c.id).await.sequence, 0);
        let a = get(&service, &a.id).await;
        assert_eq!(a.sequence, 1);
        assert!(!a.has_descendant(&b.id));
        assert_consistent(&service).await;
    }

    #[tokio::test]
    async fn test_move_subtree_across_trees() {
        let (service, _store) = create_test_service();
        let a = create(&service, "A", None).await;
        let b = create(&service, "B", Some(&a)).await;
        let c = create(&service, "C", Some(&b)).await;
        let x = create(&service, "X", None).await;
        let y = create(&service, "Y", Some(&x)).await;

        let moved = service
            .move_category(&b.id, Some(&y.id), None)
            .await
            .unwrap();
        assert_eq!(moved.full_name, "X/Y/B");
        assert_eq!(moved.nesting_level, 2);

        let c = get(&service, &c.id).await;
        assert_eq!(c.full_name, "X/Y/B/C");
        assert_eq!(c.nesting_level, 3);

        let a = get(&service, &a.id).await;
        assert!(a.descendants.is_empty());
        let x = get(&service, &x.id).await;
        assert!(x.has_descendant(&b.id) && x.has_descendant(&c.id));
        assert_consistent(&service).await;
    }

    #[tokio::test]
    async fn test_reorder_within_parent() {
        let (service, _store) = create_test_service();
        let p = create(&service, "P", None).await;
        let mut kids = Vec::new();
        for name in ["K0", "K1", "K2", "K3"] {
            kids.push(create(&service, name, Some(&p)).await);
        }

        service
            .move_category(&kids[0].id, Some(&p.id), Some(2))
            .await
            .unwrap();
        let order: Vec<String> = service
            .get_children(Some(&p.id))
            .await
            .unwrap()
            .into_iter()
            .map(|c| c.name)
            .collect();
        assert_eq!(order, vec!["K1", "K2", "K0", "K3"]);

        service
            .move_category(&kids[3].id, Some(&p.id), Some(0))
            .await
            .unwrap();
        let order: Vec<String> = service
            .get_children(Some(&p.id))
            .await
            .unwrap()
            .into_iter()
            .map(|c| c.name)
            .collect();
        assert_eq!(order, vec!["K3", "K1", "K2", "K0"]);
        assert_consistent(&service).await;
    }

    #[tokio::test]
    async fn test_move_clamps_out_of_range_sequence() {
        let (service, _store) = create_test_service();
        let p = create(&service, "P", None).await;
        let a = create(&service, "A", Some(&p)).await;
        create(&service, "B", Some(&p)).await;

        let moved = service
            .move_category(&a.id, Some(&p.id), Some(50))
            .await
            .unwrap();
        assert_eq!(moved.sequence, 1);
        assert_consistent(&service).await;
    }

    #[tokio::test]
    async fn test_move_under_own_descendant_is_rejected() {
        let (service, _store) = create_test_service();
        let a = create(&service, "A", None).await;
        let b = create(&service, "B", Some(&a)).await;
        let c = create(&service, "C", Some(&b)).await;

        for target in [&a.id, &c.id] {
            let err = service
                .move_category(&a.id, Some(target), None)
                .await
                .unwrap_err();
            assert!(matches!(err, TreeError::CircularMove { .. }));
        }
        assert_consistent(&service).await;
    }

    #[tokio::test]
    async fn test_rename_rewrites_subtree_full_names() {
        let (service, _store) = create_test_service();
        let a = create(&service, "A", None).await;
        let b = create(&service, "B", Some(&a)).await;
        let c = create(&service, "C", Some(&b)).await;

        let renamed = service.rename_category(&b.id, "Tools").await.unwrap();
        assert_eq!(renamed.name, "Tools");
        assert_eq!(renamed.full_name, "A/Tools");
        assert_eq!(get(&service, &c.id).await.full_name, "A/Tools/C");
        assert_consistent(&service).await;
    }

    #[tokio::test]
    async fn test_delete_leaf_closes_sibling_gap() {
        let (service, _store) = create_test_service();
        let a = create(&service, "A", None).await;
        let b = create(&service, "B", Some(&a)).await;
        let c = create(&service, "C", Some(&a)).await;
        let d = create(&service, "D", Some(&a)).await;

        let report = assert_ok!(service.delete_category(&b.id).await);
        assert_eq!(report.category_ids, vec![b.id.clone()]);

        assert_eq!(get(&service, &c.id).await.sequence, 0);
        assert_eq!(get(&service, &d.id).await.sequence, 1);
        assert!(!get(&service, &a.id).await.has_descendant(&b.id));
        assert_consistent(&service).await;
    }

    #[tokio::test]
    async fn test_delete_eradicates_subtree_and_clears_product_reference() {
        let (service, store) = create_test_service();
        let a = create(&service, "A", None).await;
        let b = create(&service, "B", Some(&a)).await;
        let c = create(&service, "C", Some(&a)).await;
        let keep = create(&service, "Keep", None).await;
        store
            .insert(Collection::Products, product("p1", &b.id))
            .await
            .unwrap();

        let report = service.delete_category(&a.id).await.unwrap();
        assert_eq!(report.categories_deleted, 3);
        assert_eq!(report.product_references, 1);

        for id in [&a.id, &b.id, &c.id] {
            assert!(service.get_category(id).await.unwrap().is_none());
        }
        let p1 = store.get(Collection::Products, "p1").await.unwrap().unwrap();
        assert_eq!(p1["accounting"]["category"], Value::Null);

        // The remaining root moved up into the freed slot
        assert_eq!(get(&service, &keep.id).await.sequence, 0);
        assert_consistent(&service).await;
    }

    #[tokio::test]
    async fn test_walk_closure_source_deletes_despite_stale_cache() {
        let config = TreeConfig {
            closure_source: ClosureSource::Walk,
            ..Default::default()
        };
        let (service, store) = create_test_service_with(config);
        let a = create(&service, "A", None).await;
        let b = create(&service, "B", Some(&a)).await;
        create(&service, "C", Some(&b)).await;
        // Wipe A's cached closure
        store
            .update_one(
                Collection::Categories,
                &crate::db::Filter::by_id(&a.id),
                &crate::db::Patch::new().set("descendants", json!([])),
            )
            .await
            .unwrap();

        let report = service.delete_category(&a.id).await.unwrap();
        assert_eq!(report.categories_deleted, 3);
        assert!(store.is_empty(Collection::Categories).await);
    }

    #[tokio::test]
    async fn test_get_ancestors_nearest_first() {
        let (service, _store) = create_test_service();
        let a = create(&service, "A", None).await;
        let b = create(&service, "B", Some(&a)).await;
        let c = create(&service, "C", Some(&b)).await;

        let names: Vec<String> = service
            .get_ancestors(&c.id)
            .await
            .unwrap()
            .into_iter()
            .map(|c| c.name)
            .collect();
        assert_eq!(names, vec!["B", "A"]);
        assert!(service.get_ancestors(&a.id).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_events_are_emitted_for_completed_operations() {
        let (service, _store) = create_test_service();
        let mut rx = service.subscribe_to_events();

        let a = create(&service, "A", None).await;
        let b = create(&service, "B", Some(&a)).await;
        service.rename_category(&b.id, "Bee").await.unwrap();
        service.move_category(&b.id, None, None).await.unwrap();
        service.delete_category(&b.id).await.unwrap();

        let mut types = Vec::new();
        while let Ok(event) = rx.try_recv() {
            types.push(event.change.event_type().to_string());
        }
        assert_eq!(
            types,
            vec![
                "category:created",
                "category:created",
                "category:renamed",
                "category:moved",
                "subtree:eradicated"
            ]
        );

        // A failed operation emits nothing
        assert_err!(service.delete_category("ghost").await);
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_moved_event_carries_positions() {
        let (service, _store) = create_test_service();
        let a = create(&service, "A", None).await;
        let b = create(&service, "B", Some(&a)).await;
        let mut rx = service.subscribe_to_events();

        service.move_category(&b.id, None, None).await.unwrap();
        let event = rx.recv().await.unwrap();
        match event.change {
            TreeChange::CategoryMoved(moved) => {
                assert_eq!(moved.id, b.id);
                assert_eq!(moved.from_parent.as_deref(), Some(a.id.as_str()));
                assert_eq!(moved.to_parent, None);
                assert_eq!(moved.from_sequence, 0);
                assert_eq!(moved.to_sequence, 1);
            }
            other => panic!("expected CategoryMoved, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_failed_closure_walk_is_reported_and_reconcile_repairs() {
        let (service, store) = create_test_service();
        let a = create(&service, "A", None).await;
        let b = create(&service, "B", Some(&a)).await;

        // Parent update succeeds, the next ancestor update fails
        store.inject_fault(
            Fault::on(Collection::Categories, StoreOperation::UpdateOne).after(1),
        );
        let err = service
            .create_category(NewCategory::new("C").under(&b.id))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            TreeError::PartialWalkFailure { walk: WalkKind::AncestorClosure, completed: 1, .. }
        ));
        assert!(!service.audit().await.unwrap().is_empty());

        let report = service.reconcile(ReconcileScope::All).await.unwrap();
        assert_eq!(report.repaired, vec![a.id.clone()]);
        assert_consistent(&service).await;
    }

    #[tokio::test]
    async fn test_shutdown_cancels_walks() {
        let (service, _store) = create_test_service();
        let a = create(&service, "A", None).await;

        service.shutdown();
        let err = assert_err!(service.rename_category(&a.id, "Z").await);
        assert!(matches!(err, TreeError::PartialWalkFailure { .. }));
    }

    #[tokio::test]
    async fn test_move_to_root_level_locks_the_new_tree() {
        let (service, _store) = create_test_service();
        let service = Arc::new(service);
        let a = create(&service, "A", None).await;
        let b = create(&service, "B", Some(&a)).await;
        create(&service, "C", Some(&b)).await;

        // Someone is already working inside the tree B is about to become
        let held = service
            .locks()
            .acquire(BTreeSet::from([LockKey::Tree(b.id.clone())]))
            .await;

        let mover = {
            let service = service.clone();
            let id = b.id.clone();
            tokio::spawn(async move { service.move_category(&id, None, None).await })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!mover.is_finished());

        drop(held);
        let moved = tokio::time::timeout(Duration::from_secs(1), mover)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert!(moved.parent.is_none());
        assert_consistent(&service).await;
    }

    #[tokio::test]
    async fn test_reconcile_all_locks_roots_created_while_waiting() {
        let (service, store) = create_test_service();
        let service = Arc::new(service);
        create(&service, "A", None).await;

        // 1. Reconcile reads the roots, then waits for the root level
        let root_level = service
            .locks()
            .acquire(BTreeSet::from([LockKey::RootLevel]))
            .await;
        let reconcile = {
            let service = service.clone();
            tokio::spawn(async move { service.reconcile(ReconcileScope::All).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;

        // 2. A root appears meanwhile, and its tree is busy
        let late = put(&store, "late", "Late", None, 1).await;
        let late_tree = service
            .locks()
            .acquire(BTreeSet::from([LockKey::Tree(late.id.clone())]))
            .await;
        drop(root_level);

        // 3. Reconcile must wait for the late root's tree too
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!reconcile.is_finished());

        drop(late_tree);
        let report = tokio::time::timeout(Duration::from_secs(1), reconcile)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert_eq!(report.examined, 2);
        assert!(report.repaired.is_empty());
    }

    #[test]
    fn test_invalid_config_is_rejected() {
        let config = TreeConfig {
            path_separator: String::new(),
            ..Default::default()
        };
        let result = CategoryService::new(Arc::new(InMemoryStore::new()), config);
        assert!(matches!(result, Err(TreeError::Config(_))));
    }
}
