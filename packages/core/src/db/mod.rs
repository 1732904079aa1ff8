//! Database Layer
//!
//! This module handles all interactions with the document store:
//!
//! - The [`DocumentStore`] trait the tree engine is written against
//! - Filter and patch types describing store requests
//! - [`InMemoryStore`], the reference adapter used by tests and embedders
//! - [`SurrealStore`] (feature `surrealdb`), an embedded SurrealDB adapter
//! - Domain events emitted after tree mutations
//!
//! # Architecture
//!
//! The store offers no tree or ordering primitives and no multi-document
//! transactions. Each individual call is atomic; sequences of calls are not.
//! Higher layers are responsible for serializing mutating operations.

mod document_store;
mod error;
pub mod events;
mod memory_store;
#[cfg(feature = "surrealdb")]
mod surreal_store;

pub use document_store::{
    Collection, Condition, Document, DocumentStore, Filter, Patch, PatchOp, StoreOperation,
};
pub use error::StoreError;
pub use events::{CategoryMove, TreeChange, TreeEvent};
pub use memory_store::{Fault, InMemoryStore};
#[cfg(feature = "surrealdb")]
pub use surreal_store::SurrealStore;
