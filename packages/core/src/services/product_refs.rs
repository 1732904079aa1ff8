//! Product Reference Cleanup
//!
//! Products embed a reference to the category they are booked under. The tree
//! engine does not know the product schema; it only needs the host to
//! "remove references to this set of categories" when a subtree is
//! eradicated. [`ReferenceCleaner`] is that capability, and
//! [`ProductReferenceCleaner`] implements it over the Products collection.

use crate::config::{ProductReferenceConfig, ReferencePolicy};
use crate::db::{Collection, DocumentStore, Filter, Patch, StoreError};
use async_trait::async_trait;
use serde_json::Value;
use std::sync::Arc;

/// Removes cross-entity references to eradicated categories
#[async_trait]
pub trait ReferenceCleaner: Send + Sync {
    /// Clear or delete every reference to one of `category_ids`.
    ///
    /// Returns the number of referencing documents affected.
    async fn remove_references(&self, category_ids: &[String]) -> Result<u64, StoreError>;
}

/// Default cleaner: products carry the reference at a configurable path
pub struct ProductReferenceCleaner {
    store: Arc<dyn DocumentStore>,
    config: ProductReferenceConfig,
}

impl ProductReferenceCleaner {
    pub fn new(store: Arc<dyn DocumentStore>, config: ProductReferenceConfig) -> Self {
        Self { store, config }
    }

    pub fn policy(&self) -> ReferencePolicy {
        self.config.policy
    }
}

#[async_trait]
impl ReferenceCleaner for ProductReferenceCleaner {
    async fn remove_references(&self, category_ids: &[String]) -> Result<u64, StoreError> {
        if category_ids.is_empty() {
            return Ok(0);
        }

        let filter = Filter::new().is_in(
            &self.config.id_path(),
            category_ids.iter().cloned().map(Value::String),
        );

        let affected = match self.config.policy {
            ReferencePolicy::Clear => {
                let patch = Patch::new().set(&self.config.reference_path, Value::Null);
                self.store
                    .update_many(Collection::Products, &filter, &patch)
                    .await?
            }
            ReferencePolicy::Delete => {
                self.store
                    .delete_many(Collection::Products, &filter)
                    .await?
            }
        };

        tracing::debug!(
            "{:?} {} product reference(s) to {} categor(ies)",
            self.config.policy,
            affected,
            category_ids.len()
        );
        Ok(affected)
    }
}
