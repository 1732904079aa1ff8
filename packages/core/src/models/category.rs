//! Category Data Structures
//!
//! A category document carries, besides its own label, four pieces of
//! materialized tree data that the engine keeps consistent:
//!
//! - `fullName`: the ancestor names and its own name joined by the path separator
//! - `descendants`: ids of every node transitively below it (ancestor closure)
//! - `nestingLevel`: number of ancestors (roots are level 0)
//! - `sequence`: dense 0-based position among the children of its parent
//!
//! Everything else on the document (accounting references, flags, audit ids) is
//! opaque to the engine and round-trips through [`Category::attributes`].
//!
//! # Examples
//!
//! ```rust
//! use category_tree_core::models::NewCategory;
//! use serde_json::json;
//!
//! let params = NewCategory::new("Hardware")
//!     .under("cat-123")
//!     .with_attribute("integrationId", json!("erp-77"));
//! assert_eq!(params.parent.as_deref(), Some("cat-123"));
//! ```

use crate::db::{Collection, Document, StoreError};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;

/// Field names of the persisted category document
pub mod fields {
    pub const ID: &str = "id";
    pub const NAME: &str = "name";
    pub const FULL_NAME: &str = "fullName";
    pub const PARENT: &str = "parent";
    pub const DESCENDANTS: &str = "descendants";
    pub const NESTING_LEVEL: &str = "nestingLevel";
    pub const SEQUENCE: &str = "sequence";
}

/// Validation errors for category input
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ValidationError {
    #[error("Category name cannot be empty")]
    EmptyName,

    #[error("Category name '{name}' contains the path separator '{separator}'")]
    NameContainsSeparator { name: String, separator: String },
}

/// Persisted category.
///
/// `descendants` has set semantics: the store only ever applies set-union and
/// set-difference to it, so ordering is not meaningful.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Category {
    /// Store-assigned identifier
    pub id: String,

    /// Short label
    pub name: String,

    /// Materialized path name
    #[serde(default)]
    pub full_name: String,

    /// Parent category id (None for roots)
    #[serde(default)]
    pub parent: Option<String>,

    /// Ancestor closure: every id transitively below this node
    #[serde(default)]
    pub descendants: Vec<String>,

    /// Number of ancestors
    #[serde(default)]
    pub nesting_level: u32,

    /// Position among siblings
    #[serde(default)]
    pub sequence: u32,

    /// Opaque pass-through fields
    #[serde(flatten)]
    pub attributes: Map<String, Value>,
}

impl Category {
    /// Decode a category from a raw store document
    pub fn from_document(document: Document) -> Result<Self, StoreError> {
        serde_json::from_value(Value::Object(document)).map_err(|e| {
            StoreError::InvalidDocument {
                collection: Collection::Categories,
                reason: e.to_string(),
            }
        })
    }

    /// Encode this category as a raw store document
    pub fn to_document(&self) -> Result<Document, StoreError> {
        match serde_json::to_value(self) {
            Ok(Value::Object(map)) => Ok(map),
            Ok(other) => Err(StoreError::Serialization(format!(
                "category encoded to non-object value: {}",
                other
            ))),
            Err(e) => Err(StoreError::Serialization(e.to_string())),
        }
    }

    pub fn is_root(&self) -> bool {
        self.parent.is_none()
    }

    /// Whether `id` is recorded in this node's ancestor closure
    pub fn has_descendant(&self, id: &str) -> bool {
        self.descendants.iter().any(|d| d == id)
    }

    /// `{self.id} ∪ descendants`, self first
    pub fn subtree_ids(&self) -> Vec<String> {
        let mut ids = Vec::with_capacity(self.descendants.len() + 1);
        ids.push(self.id.clone());
        for id in &self.descendants {
            if id != &self.id && !ids.contains(id) {
                ids.push(id.clone());
            }
        }
        ids
    }

    /// Check a category name against the configured path separator
    pub fn validate_name(name: &str, separator: &str) -> Result<(), ValidationError> {
        if name.trim().is_empty() {
            return Err(ValidationError::EmptyName);
        }
        if !separator.is_empty() && name.contains(separator) {
            return Err(ValidationError::NameContainsSeparator {
                name: name.to_string(),
                separator: separator.to_string(),
            });
        }
        Ok(())
    }
}

/// Parameters for creating a category
#[derive(Debug, Clone, Default)]
pub struct NewCategory {
    /// Short label
    pub name: String,
    /// Parent category id (None creates a root)
    pub parent: Option<String>,
    /// Opaque pass-through fields stored verbatim
    pub attributes: Map<String, Value>,
}

impl NewCategory {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }

    pub fn under(mut self, parent_id: impl Into<String>) -> Self {
        self.parent = Some(parent_id.into());
        self
    }

    pub fn with_attribute(mut self, key: impl Into<String>, value: Value) -> Self {
        self.attributes.insert(key.into(), value);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_category_document_keeps_opaque_attributes() {
        let doc = json!({
            "id": "c1",
            "name": "Tools",
            "fullName": "Hardware/Tools",
            "parent": "c0",
            "descendants": ["c2"],
            "nestingLevel": 1,
            "sequence": 3,
            "main": false,
            "taxesAccount": "acc-9"
        });
        let Value::Object(map) = doc else {
            unreachable!()
        };

        let category = Category::from_document(map).unwrap();
        assert_eq!(category.full_name, "Hardware/Tools");
        assert_eq!(category.parent.as_deref(), Some("c0"));
        assert_eq!(category.sequence, 3);
        assert_eq!(category.attributes.get("taxesAccount"), Some(&json!("acc-9")));

        let encoded = category.to_document().unwrap();
        assert_eq!(encoded.get("main"), Some(&json!(false)));
        assert_eq!(encoded.get("nestingLevel"), Some(&json!(1)));
    }

    #[test]
    fn test_missing_tree_fields_default() {
        let Value::Object(map) = json!({"id": "c1", "name": "Root"}) else {
            unreachable!()
        };
        let category = Category::from_document(map).unwrap();
        assert!(category.is_root());
        assert!(category.descendants.is_empty());
        assert_eq!(category.nesting_level, 0);
    }

    #[test]
    fn test_invalid_document_reports_collection() {
        let Value::Object(map) = json!({"name": "no id"}) else {
            unreachable!()
        };
        let err = Category::from_document(map).unwrap_err();
        assert!(matches!(
            err,
            StoreError::InvalidDocument {
                collection: Collection::Categories,
                ..
            }
        ));
    }

    #[test]
    fn test_subtree_ids_puts_self_first_without_duplicates() {
        let category = Category {
            id: "a".to_string(),
            name: "A".to_string(),
            full_name: "A".to_string(),
            parent: None,
            descendants: vec!["b".to_string(), "c".to_string(), "b".to_string()],
            nesting_level: 0,
            sequence: 0,
            attributes: Map::new(),
        };
        assert_eq!(category.subtree_ids(), vec!["a", "b", "c"]);
        assert!(category.has_descendant("c"));
        assert!(!category.has_descendant("a"));
    }

    #[test]
    fn test_validate_name() {
        assert!(Category::validate_name("Tools", "/").is_ok());
        assert_eq!(
            Category::validate_name("   ", "/"),
            Err(ValidationError::EmptyName)
        );
        assert!(matches!(
            Category::validate_name("A/B", "/"),
            Err(ValidationError::NameContainsSeparator { .. })
        ));
    }
}
