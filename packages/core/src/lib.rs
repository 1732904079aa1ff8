//! Category Tree Core
//!
//! This crate keeps a hierarchical category tree consistent while an external
//! document store holds the authoritative state.
//!
//! # Architecture
//!
//! - **Document store**: All state lives in two collections (categories, products)
//!   behind the [`db::DocumentStore`] trait. The store offers per-call atomicity only.
//! - **Materialized tree data**: Every category carries its ancestor closure
//!   (`descendants`), its depth (`nestingLevel`), its sibling position (`sequence`)
//!   and its full path name (`fullName`). These are maintained incrementally.
//! - **Serialized mutations**: Mutating operations on a tree are serialized through
//!   a keyed lock table so concurrent callers cannot interleave half-finished walks.
//!
//! # Modules
//!
//! - [`models`] - Category data structures
//! - [`db`] - Store abstraction, in-memory adapter, domain events
//! - [`operations`] - The tree maintenance algorithms
//! - [`services`] - `CategoryService` orchestration, locks, product reference cleanup
//! - [`config`] - Engine configuration
//! - [`logging`] - Tracing subscriber setup

pub mod config;
pub mod db;
pub mod logging;
pub mod models;
pub mod operations;
pub mod services;

// Re-export commonly used types
pub use config::TreeConfig;
pub use models::*;
pub use services::*;
