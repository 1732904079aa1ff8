//! Business Services
//!
//! This module contains the services the engine exposes:
//!
//! - `CategoryService` - Tree operations under per-tree locks, with domain events
//! - `TreeLocks` - Keyed async mutex table serializing mutations per tree
//! - `ReferenceCleaner` / `ProductReferenceCleaner` - Cleanup of product references
//!   to eradicated categories
//!
//! Services coordinate between the store and the tree algorithms in
//! [`crate::operations`].

pub mod category_service;
pub mod error;
pub mod locks;
pub mod product_refs;

#[cfg(test)]
mod category_service_test;

pub use category_service::CategoryService;
pub use error::{CascadeBranch, TreeError};
pub use locks::{LockKey, TreeGuard, TreeLocks};
pub use product_refs::{ProductReferenceCleaner, ReferenceCleaner};
