//! DocumentStore Trait - Store Abstraction Layer
//!
//! This module defines the `DocumentStore` trait the tree engine is written
//! against, together with the request vocabulary it speaks:
//!
//! - [`Filter`]: conjunction of field conditions (dotted paths address nested fields)
//! - [`Patch`]: field updates applied atomically to every matched document
//!
//! # Design Decisions
//!
//! 1. **Async-First**: All methods are async so network-backed stores fit behind
//!    the same trait as the in-memory adapter
//! 2. **Per-call atomicity**: A single `update_many` applies its patch to every
//!    matched document before any other call observes the collection. Nothing
//!    stronger is assumed.
//! 3. **Set operations**: `add_to_set` / `pull` are set-union / set-difference,
//!    so repeating them is a no-op
//!
//! # Examples
//!
//! ```rust
//! use category_tree_core::db::{Filter, Patch};
//!
//! // Shift every sibling at or after position 2 under "parent-1" one slot right
//! let filter = Filter::new().eq("parent", "parent-1").gte("sequence", 2);
//! let patch = Patch::new().inc("sequence", 1);
//! # let _ = (filter, patch);
//! ```

use crate::db::StoreError;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;

/// Raw document as stored (a JSON object)
pub type Document = Map<String, Value>;

/// The collections the engine touches
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Collection {
    Categories,
    Products,
}

impl Collection {
    pub fn as_str(&self) -> &'static str {
        match self {
            Collection::Categories => "categories",
            Collection::Products => "products",
        }
    }
}

impl fmt::Display for Collection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Store primitives, used for error context and fault injection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum StoreOperation {
    Insert,
    Get,
    Find,
    UpdateOne,
    UpdateMany,
    Count,
    DeleteMany,
}

impl fmt::Display for StoreOperation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            StoreOperation::Insert => "insert",
            StoreOperation::Get => "get",
            StoreOperation::Find => "find",
            StoreOperation::UpdateOne => "updateOne",
            StoreOperation::UpdateMany => "updateMany",
            StoreOperation::Count => "count",
            StoreOperation::DeleteMany => "deleteMany",
        };
        f.write_str(name)
    }
}

/// A single predicate over a (possibly nested) field
#[derive(Debug, Clone, PartialEq)]
pub enum Condition {
    /// Field equals value. `Null` also matches a missing field.
    Eq(String, Value),
    /// Negation of `Eq`
    Ne(String, Value),
    /// Field value (missing = `Null`) is one of the values
    In(String, Vec<Value>),
    /// Negation of `In`
    NotIn(String, Vec<Value>),
    Gt(String, i64),
    Gte(String, i64),
    Lt(String, i64),
    Lte(String, i64),
    /// Field is an array containing the value
    Contains(String, Value),
}

impl Condition {
    pub fn path(&self) -> &str {
        match self {
            Condition::Eq(p, _)
            | Condition::Ne(p, _)
            | Condition::In(p, _)
            | Condition::NotIn(p, _)
            | Condition::Gt(p, _)
            | Condition::Gte(p, _)
            | Condition::Lt(p, _)
            | Condition::Lte(p, _)
            | Condition::Contains(p, _) => p,
        }
    }

    pub fn matches(&self, document: &Document) -> bool {
        let field = lookup(document, self.path());
        match self {
            Condition::Eq(_, expected) => value_eq(field, expected),
            Condition::Ne(_, expected) => !value_eq(field, expected),
            Condition::In(_, values) => values.iter().any(|v| value_eq(field, v)),
            Condition::NotIn(_, values) => !values.iter().any(|v| value_eq(field, v)),
            Condition::Gt(_, bound) => as_i64(field).is_some_and(|n| n > *bound),
            Condition::Gte(_, bound) => as_i64(field).is_some_and(|n| n >= *bound),
            Condition::Lt(_, bound) => as_i64(field).is_some_and(|n| n < *bound),
            Condition::Lte(_, bound) => as_i64(field).is_some_and(|n| n <= *bound),
            Condition::Contains(_, needle) => matches!(
                field,
                Some(Value::Array(items)) if items.contains(needle)
            ),
        }
    }
}

/// Conjunction of conditions. An empty filter matches every document.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Filter {
    conditions: Vec<Condition>,
}

impl Filter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Match a single document by id
    pub fn by_id(id: &str) -> Self {
        Self::new().eq("id", id)
    }

    /// Match documents whose id is one of `ids`
    pub fn by_ids<I, S>(ids: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self::new().is_in("id", ids.into_iter().map(|s| Value::String(s.into())))
    }

    pub fn eq(mut self, path: &str, value: impl Into<Value>) -> Self {
        self.conditions
            .push(Condition::Eq(path.to_string(), value.into()));
        self
    }

    pub fn ne(mut self, path: &str, value: impl Into<Value>) -> Self {
        self.conditions
            .push(Condition::Ne(path.to_string(), value.into()));
        self
    }

    pub fn is_in(mut self, path: &str, values: impl IntoIterator<Item = Value>) -> Self {
        self.conditions
            .push(Condition::In(path.to_string(), values.into_iter().collect()));
        self
    }

    pub fn not_in(mut self, path: &str, values: impl IntoIterator<Item = Value>) -> Self {
        self.conditions.push(Condition::NotIn(
            path.to_string(),
            values.into_iter().collect(),
        ));
        self
    }

    pub fn gt(mut self, path: &str, bound: i64) -> Self {
        self.conditions.push(Condition::Gt(path.to_string(), bound));
        self
    }

    pub fn gte(mut self, path: &str, bound: i64) -> Self {
        self.conditions.push(Condition::Gte(path.to_string(), bound));
        self
    }

    pub fn lt(mut self, path: &str, bound: i64) -> Self {
        self.conditions.push(Condition::Lt(path.to_string(), bound));
        self
    }

    pub fn lte(mut self, path: &str, bound: i64) -> Self {
        self.conditions.push(Condition::Lte(path.to_string(), bound));
        self
    }

    pub fn contains(mut self, path: &str, value: impl Into<Value>) -> Self {
        self.conditions
            .push(Condition::Contains(path.to_string(), value.into()));
        self
    }

    pub fn conditions(&self) -> &[Condition] {
        &self.conditions
    }

    pub fn matches(&self, document: &Document) -> bool {
        self.conditions.iter().all(|c| c.matches(document))
    }
}

/// A single field update
#[derive(Debug, Clone, PartialEq)]
pub enum PatchOp {
    /// Replace the field (intermediate objects are created as needed)
    Set(String, Value),
    /// Add a delta to an integer field (missing counts as 0)
    Inc(String, i64),
    /// Set-union into an array field
    AddToSet(String, Vec<Value>),
    /// Set-difference out of an array field
    Pull(String, Vec<Value>),
}

/// Ordered list of field updates applied together
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Patch {
    ops: Vec<PatchOp>,
}

impl Patch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(mut self, path: &str, value: impl Into<Value>) -> Self {
        self.ops.push(PatchOp::Set(path.to_string(), value.into()));
        self
    }

    pub fn inc(mut self, path: &str, delta: i64) -> Self {
        self.ops.push(PatchOp::Inc(path.to_string(), delta));
        self
    }

    pub fn add_to_set(mut self, path: &str, values: impl IntoIterator<Item = Value>) -> Self {
        self.ops.push(PatchOp::AddToSet(
            path.to_string(),
            values.into_iter().collect(),
        ));
        self
    }

    pub fn pull(mut self, path: &str, values: impl IntoIterator<Item = Value>) -> Self {
        self.ops
            .push(PatchOp::Pull(path.to_string(), values.into_iter().collect()));
        self
    }

    pub fn ops(&self) -> &[PatchOp] {
        &self.ops
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    /// Apply every op to `document` in order.
    ///
    /// Returns a description of the first type mismatch encountered; the
    /// document may be partially patched in that case, so adapters apply
    /// patches to a copy and commit only on success.
    pub fn apply(&self, document: &mut Document) -> Result<(), String> {
        for op in &self.ops {
            match op {
                PatchOp::Set(path, value) => {
                    *slot(document, path)? = value.clone();
                }
                PatchOp::Inc(path, delta) => {
                    let target = slot(document, path)?;
                    let current = match target {
                        Value::Null => 0,
                        Value::Number(n) => n
                            .as_i64()
                            .ok_or_else(|| format!("field '{}' is not an integer", path))?,
                        _ => return Err(format!("field '{}' is not an integer", path)),
                    };
                    *target = Value::from(current + delta);
                }
                PatchOp::AddToSet(path, values) => {
                    let target = slot(document, path)?;
                    if target.is_null() {
                        *target = Value::Array(Vec::new());
                    }
                    let Value::Array(items) = target else {
                        return Err(format!("field '{}' is not an array", path));
                    };
                    for value in values {
                        if !items.contains(value) {
                            items.push(value.clone());
                        }
                    }
                }
                PatchOp::Pull(path, values) => {
                    let target = slot(document, path)?;
                    match target {
                        Value::Null => {}
                        Value::Array(items) => items.retain(|item| !values.contains(item)),
                        _ => return Err(format!("field '{}' is not an array", path)),
                    }
                }
            }
        }
        Ok(())
    }
}

/// Resolve a dotted path for reading
pub fn lookup<'a>(document: &'a Document, path: &str) -> Option<&'a Value> {
    let mut segments = path.split('.');
    let first = segments.next()?;
    let mut current = document.get(first)?;
    for segment in segments {
        current = current.as_object()?.get(segment)?;
    }
    Some(current)
}

/// Resolve a dotted path for writing, creating intermediate objects
fn slot<'a>(document: &'a mut Document, path: &str) -> Result<&'a mut Value, String> {
    let mut segments = path.split('.');
    let first = segments
        .next()
        .filter(|s| !s.is_empty())
        .ok_or_else(|| "empty field path".to_string())?;
    let mut current: &mut Value = document.entry(first.to_string()).or_insert(Value::Null);
    for segment in segments {
        if current.is_null() {
            *current = Value::Object(Map::new());
        }
        current = current
            .as_object_mut()
            .ok_or_else(|| {
                format!(
                    "cannot descend into non-object at '{}' of '{}'",
                    segment, path
                )
            })?
            .entry(segment.to_string())
            .or_insert(Value::Null);
    }
    Ok(current)
}

fn value_eq(field: Option<&Value>, expected: &Value) -> bool {
    match field {
        None => expected.is_null(),
        Some(actual) => actual == expected,
    }
}

fn as_i64(field: Option<&Value>) -> Option<i64> {
    field.and_then(Value::as_i64)
}

/// Abstraction over the persistent document store
///
/// Implementations must be `Send + Sync` so a single store can be shared by the
/// service across tasks.
///
/// # Method Categories
///
/// - **Create**: `insert` (store assigns the id when the document has none)
/// - **Read**: `get`, `find`, `count`
/// - **Write**: `update_one` (returns the updated document), `update_many`
/// - **Delete**: `delete_many`
#[async_trait]
pub trait DocumentStore: Send + Sync {
    /// Insert a document. A missing `id` field is filled with a fresh UUID.
    ///
    /// Returns the stored document (including its id).
    async fn insert(&self, collection: Collection, document: Document)
        -> Result<Document, StoreError>;

    /// Get a document by id
    ///
    /// - `Ok(Some(doc))` if it exists
    /// - `Ok(None)` if it doesn't (not an error)
    async fn get(&self, collection: Collection, id: &str) -> Result<Option<Document>, StoreError>;

    /// All documents matching `filter`, in no particular order
    async fn find(&self, collection: Collection, filter: &Filter)
        -> Result<Vec<Document>, StoreError>;

    /// Patch the first document matching `filter`
    ///
    /// Returns the document after the patch, or `None` when nothing matched.
    async fn update_one(
        &self,
        collection: Collection,
        filter: &Filter,
        patch: &Patch,
    ) -> Result<Option<Document>, StoreError>;

    /// Patch every document matching `filter`, returning how many matched
    async fn update_many(
        &self,
        collection: Collection,
        filter: &Filter,
        patch: &Patch,
    ) -> Result<u64, StoreError>;

    /// Number of documents matching `filter`
    async fn count(&self, collection: Collection, filter: &Filter) -> Result<u64, StoreError>;

    /// Delete every document matching `filter`, returning how many were removed
    async fn delete_many(&self, collection: Collection, filter: &Filter)
        -> Result<u64, StoreError>;
}
