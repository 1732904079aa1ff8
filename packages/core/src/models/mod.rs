//! Data Models
//!
//! This module contains the data structures the tree engine works with:
//!
//! - `Category` - Typed view over a category document
//! - `NewCategory` - Parameters for creating a category
//!
//! Products are not modelled here. The engine only knows that a product document
//! embeds a category reference at a configurable path (see
//! [`crate::services::ProductReferenceCleaner`]).

mod category;

pub use category::{fields, Category, NewCategory, ValidationError};
