//! SurrealStore - DocumentStore Implementation for SurrealDB Backend
//!
//! This module implements the `DocumentStore` trait for an embedded SurrealDB
//! database (RocksDB engine). Filters and patches are rendered into SurrealQL so
//! range updates run server-side as a single statement.
//!
//! # Layout
//!
//! - One SCHEMALESS table per [`Collection`] (`categories`, `products`)
//! - Record id `table:uuid`; the uuid is duplicated into a `uuid` field and
//!   exposed to callers as the document's `id`
//!
//! # Examples
//!
//! ```rust,no_run
//! use category_tree_core::db::{Collection, DocumentStore, Filter, SurrealStore};
//! use std::path::PathBuf;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let store = SurrealStore::new(PathBuf::from("./data/categories.db")).await?;
//!     let roots = store
//!         .find(Collection::Categories, &Filter::new().eq("parent", serde_json::Value::Null))
//!         .await?;
//!     println!("{} roots", roots.len());
//!     Ok(())
//! }
//! ```

use crate::db::{
    Collection, Condition, Document, DocumentStore, Filter, Patch, PatchOp, StoreError,
    StoreOperation,
};
use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::Deserialize;
use serde_json::Value;
use std::path::PathBuf;
use std::sync::Arc;
use surrealdb::engine::local::{Db, RocksDb};
use surrealdb::Surreal;

/// Field holding the document id inside a record
const UUID_FIELD: &str = "uuid";

#[derive(Debug, Deserialize)]
struct CountRow {
    total: u64,
}

/// SurrealQL fragment plus the parameters it references
#[derive(Debug, Default)]
struct Rendered {
    sql: String,
    params: Vec<(String, Value)>,
}

impl Rendered {
    fn bind(&mut self, value: Value) -> String {
        let name = format!("p{}", self.params.len());
        self.params.push((name.clone(), value));
        format!("${}", name)
    }
}

/// DocumentStore backed by embedded SurrealDB
pub struct SurrealStore {
    /// SurrealDB connection (embedded RocksDB)
    db: Arc<Surreal<Db>>,
}

impl SurrealStore {
    /// Open (or create) an embedded store at `db_path`
    ///
    /// # Errors
    ///
    /// Returns error if RocksDB initialization or schema setup fails.
    pub async fn new(db_path: PathBuf) -> Result<Self> {
        let db = Surreal::new::<RocksDb>(db_path)
            .await
            .context("Failed to initialize SurrealDB with RocksDB backend")?;

        db.use_ns("category_tree")
            .use_db("catalog")
            .await
            .context("Failed to set namespace/database")?;

        for collection in [Collection::Categories, Collection::Products] {
            db.query(format!(
                "DEFINE TABLE IF NOT EXISTS {} SCHEMALESS;",
                collection.as_str()
            ))
            .await
            .with_context(|| format!("Failed to create {} table", collection))?;
        }

        db.query("DEFINE INDEX IF NOT EXISTS category_parent ON categories FIELDS parent;")
            .await
            .context("Failed to create category parent index")?;

        Ok(Self { db: Arc::new(db) })
    }

    async fn run<T>(
        &self,
        operation: StoreOperation,
        rendered: Rendered,
    ) -> Result<Vec<T>, StoreError>
    where
        T: serde::de::DeserializeOwned,
    {
        let mut query = self.db.query(rendered.sql);
        for (name, value) in rendered.params {
            query = query.bind((name, value));
        }
        let mut response = query
            .await
            .map_err(|e| StoreError::unavailable(operation, e.to_string()))?;
        response
            .take(0)
            .map_err(|e| StoreError::unavailable(operation, e.to_string()))
    }

    async fn matching_ids(
        &self,
        operation: StoreOperation,
        collection: Collection,
        filter: &Filter,
        limit: Option<usize>,
    ) -> Result<Vec<String>, StoreError> {
        let mut rendered = Rendered::default();
        let table = rendered.bind(Value::String(collection.as_str().to_string()));
        let predicate = render_filter(&mut rendered, collection, filter)?;
        rendered.sql = format!(
            "SELECT VALUE {} FROM type::table({}) WHERE {}{};",
            UUID_FIELD,
            table,
            predicate,
            limit.map(|n| format!(" LIMIT {}", n)).unwrap_or_default()
        );
        self.run(operation, rendered).await
    }
}

fn field_path(collection: Collection, path: &str) -> Result<String, StoreError> {
    if path == "id" {
        return Ok(UUID_FIELD.to_string());
    }
    let valid = !path.is_empty()
        && path
            .split('.')
            .all(|s| !s.is_empty() && s.chars().all(|c| c.is_ascii_alphanumeric() || c == '_'));
    if !valid {
        return Err(StoreError::InvalidDocument {
            collection,
            reason: format!("unsupported field path '{}'", path),
        });
    }
    Ok(path.to_string())
}

fn render_filter(
    rendered: &mut Rendered,
    collection: Collection,
    filter: &Filter,
) -> Result<String, StoreError> {
    if filter.conditions().is_empty() {
        return Ok("true".to_string());
    }

    let mut clauses = Vec::with_capacity(filter.conditions().len());
    for condition in filter.conditions() {
        let field = field_path(collection, condition.path())?;
        let clause = match condition {
            Condition::Eq(_, Value::Null) => format!("({f} = NONE OR {f} = NULL)", f = field),
            Condition::Ne(_, Value::Null) => format!("({f} != NONE AND {f} != NULL)", f = field),
            Condition::Eq(_, v) => format!("{} = {}", field, rendered.bind(v.clone())),
            Condition::Ne(_, v) => format!("{} != {}", field, rendered.bind(v.clone())),
            Condition::In(_, vs) => {
                format!("{} INSIDE {}", field, rendered.bind(Value::Array(vs.clone())))
            }
            Condition::NotIn(_, vs) => {
                format!("{} NOTINSIDE {}", field, rendered.bind(Value::Array(vs.clone())))
            }
            Condition::Gt(_, n) => format!("{} > {}", field, rendered.bind(Value::from(*n))),
            Condition::Gte(_, n) => format!("{} >= {}", field, rendered.bind(Value::from(*n))),
            Condition::Lt(_, n) => format!("{} < {}", field, rendered.bind(Value::from(*n))),
            Condition::Lte(_, n) => format!("{} <= {}", field, rendered.bind(Value::from(*n))),
            Condition::Contains(_, v) => {
                format!("{} CONTAINS {}", field, rendered.bind(v.clone()))
            }
        };
        clauses.push(clause);
    }
    Ok(clauses.join(" AND "))
}

fn render_patch(
    rendered: &mut Rendered,
    collection: Collection,
    patch: &Patch,
) -> Result<String, StoreError> {
    let mut assignments = Vec::with_capacity(patch.ops().len());
    for op in patch.ops() {
        let assignment = match op {
            PatchOp::Set(path, v) => {
                format!("{} = {}", field_path(collection, path)?, rendered.bind(v.clone()))
            }
            PatchOp::Inc(path, delta) => {
                let f = field_path(collection, path)?;
                format!("{f} = ({f} ?? 0) + {}", rendered.bind(Value::from(*delta)), f = f)
            }
            PatchOp::AddToSet(path, vs) => {
                let f = field_path(collection, path)?;
                format!(
                    "{f} = array::union({f} ?? [], {})",
                    rendered.bind(Value::Array(vs.clone())),
                    f = f
                )
            }
            PatchOp::Pull(path, vs) => {
                let f = field_path(collection, path)?;
                format!(
                    "{f} = array::complement({f} ?? [], {})",
                    rendered.bind(Value::Array(vs.clone())),
                    f = f
                )
            }
        };
        assignments.push(assignment);
    }
    Ok(assignments.join(", "))
}

/// Rename the stored `uuid` field back to `id`
fn into_document(collection: Collection, value: Value) -> Result<Document, StoreError> {
    let Value::Object(mut map) = value else {
        return Err(StoreError::InvalidDocument {
            collection,
            reason: "record is not an object".to_string(),
        });
    };
    if let Some(uuid) = map.remove(UUID_FIELD) {
        map.insert("id".to_string(), uuid);
    }
    Ok(map)
}

#[async_trait]
impl DocumentStore for SurrealStore {
    async fn insert(
        &self,
        collection: Collection,
        mut document: Document,
    ) -> Result<Document, StoreError> {
        let id = match document.remove("id") {
            Some(Value::String(id)) if !id.is_empty() => id,
            _ => uuid::Uuid::new_v4().to_string(),
        };
        if self.get(collection, &id).await?.is_some() {
            return Err(StoreError::DuplicateId { collection, id });
        }

        let mut content = document.clone();
        content.insert(UUID_FIELD.to_string(), Value::String(id.clone()));

        let mut rendered = Rendered::default();
        let table = rendered.bind(Value::String(collection.as_str().to_string()));
        let record = rendered.bind(Value::String(id.clone()));
        let body = rendered.bind(Value::Object(content));
        rendered.sql = format!(
            "CREATE type::thing({}, {}) CONTENT {} RETURN VALUE {};",
            table, record, body, UUID_FIELD
        );
        let _: Vec<String> = self.run(StoreOperation::Insert, rendered).await?;

        document.insert("id".to_string(), Value::String(id));
        Ok(document)
    }

    async fn get(&self, collection: Collection, id: &str) -> Result<Option<Document>, StoreError> {
        let mut rendered = Rendered::default();
        let table = rendered.bind(Value::String(collection.as_str().to_string()));
        let record = rendered.bind(Value::String(id.to_string()));
        rendered.sql = format!("SELECT * OMIT id FROM type::thing({}, {});", table, record);

        let rows: Vec<Value> = self.run(StoreOperation::Get, rendered).await?;
        rows.into_iter()
            .next()
            .map(|row| into_document(collection, row))
            .transpose()
    }

    async fn find(
        &self,
        collection: Collection,
        filter: &Filter,
    ) -> Result<Vec<Document>, StoreError> {
        let mut rendered = Rendered::default();
        let table = rendered.bind(Value::String(collection.as_str().to_string()));
        let predicate = render_filter(&mut rendered, collection, filter)?;
        rendered.sql = format!(
            "SELECT * OMIT id FROM type::table({}) WHERE {};",
            table, predicate
        );

        let rows: Vec<Value> = self.run(StoreOperation::Find, rendered).await?;
        rows.into_iter()
            .map(|row| into_document(collection, row))
            .collect()
    }

    async fn update_one(
        &self,
        collection: Collection,
        filter: &Filter,
        patch: &Patch,
    ) -> Result<Option<Document>, StoreError> {
        let ids = self
            .matching_ids(StoreOperation::UpdateOne, collection, filter, Some(1))
            .await?;
        let Some(id) = ids.into_iter().next() else {
            return Ok(None);
        };

        let mut rendered = Rendered::default();
        let table = rendered.bind(Value::String(collection.as_str().to_string()));
        let record = rendered.bind(Value::String(id.clone()));
        let assignments = render_patch(&mut rendered, collection, patch)?;
        // Re-check the predicate so a concurrent change between the two
        // statements turns into "no match" instead of a stale write
        let predicate = render_filter(&mut rendered, collection, filter)?;
        rendered.sql = format!(
            "UPDATE type::thing({}, {}) SET {} WHERE {} RETURN VALUE {};",
            table, record, assignments, predicate, UUID_FIELD
        );
        let updated: Vec<String> = self.run(StoreOperation::UpdateOne, rendered).await?;
        if updated.is_empty() {
            return Ok(None);
        }
        self.get(collection, &id).await
    }

    async fn update_many(
        &self,
        collection: Collection,
        filter: &Filter,
        patch: &Patch,
    ) -> Result<u64, StoreError> {
        let mut rendered = Rendered::default();
        let table = rendered.bind(Value::String(collection.as_str().to_string()));
        let assignments = render_patch(&mut rendered, collection, patch)?;
        let predicate = render_filter(&mut rendered, collection, filter)?;
        rendered.sql = format!(
            "UPDATE type::table({}) SET {} WHERE {} RETURN VALUE {};",
            table, assignments, predicate, UUID_FIELD
        );
        let updated: Vec<String> = self.run(StoreOperation::UpdateMany, rendered).await?;
        Ok(updated.len() as u64)
    }

    async fn count(&self, collection: Collection, filter: &Filter) -> Result<u64, StoreError> {
        let mut rendered = Rendered::default();
        let table = rendered.bind(Value::String(collection.as_str().to_string()));
        let predicate = render_filter(&mut rendered, collection, filter)?;
        rendered.sql = format!(
            "SELECT count() AS total FROM type::table({}) WHERE {} GROUP ALL;",
            table, predicate
        );
        let rows: Vec<CountRow> = self.run(StoreOperation::Count, rendered).await?;
        Ok(rows.first().map_or(0, |row| row.total))
    }

    async fn delete_many(
        &self,
        collection: Collection,
        filter: &Filter,
    ) -> Result<u64, StoreError> {
        let mut rendered = Rendered::default();
        let table = rendered.bind(Value::String(collection.as_str().to_string()));
        let predicate = render_filter(&mut rendered, collection, filter)?;
        rendered.sql = format!(
            "DELETE type::table({}) WHERE {} RETURN BEFORE;",
            table, predicate
        );
        let removed: Vec<Value> = self.run(StoreOperation::DeleteMany, rendered).await?;
        Ok(removed.len() as u64)
    }
}
