//! Configuration for the category tree engine

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

/// Walks longer than this are treated as a corrupted (cyclic) tree
const DEFAULT_MAX_WALK_DEPTH: usize = 1000;

/// Broadcast channel capacity for domain events.
///
/// 128 provides headroom for bursts (bulk imports) while limiting memory
/// overhead. Lagging subscribers only miss intermediate events.
const DEFAULT_EVENT_CHANNEL_CAPACITY: usize = 128;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    Io(#[from] std::io::Error),

    #[error("Failed to parse config: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

/// Where the eradication set of a subtree comes from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ClosureSource {
    /// Trust the materialized `descendants` of the subtree root
    #[default]
    Cache,
    /// Walk parent pointers downward (use when the closure may be stale)
    Walk,
}

/// What happens to a product that references an eradicated category
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ReferencePolicy {
    /// Null out the embedded category reference, keep the product
    #[default]
    Clear,
    /// Remove the product document
    Delete,
}

/// Location of the category reference embedded in product documents
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProductReferenceConfig {
    /// Dotted path of the embedded reference object (e.g. `accounting.category`)
    pub reference_path: String,
    /// Field inside the reference object holding the category id
    pub id_field: String,
    pub policy: ReferencePolicy,
}

impl Default for ProductReferenceConfig {
    fn default() -> Self {
        Self {
            reference_path: "accounting.category".to_string(),
            id_field: "_id".to_string(),
            policy: ReferencePolicy::Clear,
        }
    }
}

impl ProductReferenceConfig {
    /// Full dotted path of the referenced category id
    pub fn id_path(&self) -> String {
        format!("{}.{}", self.reference_path, self.id_field)
    }
}

/// Configuration for `CategoryService` and the tree algorithms
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TreeConfig {
    /// Separator between names in `fullName`
    pub path_separator: String,

    /// Maximum number of steps of any upward or downward walk
    pub max_walk_depth: usize,

    /// Deadline for a single mutating operation, in milliseconds
    pub walk_timeout_ms: Option<u64>,

    /// Retries when a tree root changes between lock resolution and acquisition
    pub lock_retry_limit: usize,

    pub closure_source: ClosureSource,

    pub product_references: ProductReferenceConfig,

    /// Capacity of the domain event broadcast channel
    pub event_channel_capacity: usize,
}

impl Default for TreeConfig {
    fn default() -> Self {
        Self {
            path_separator: "/".to_string(),
            max_walk_depth: DEFAULT_MAX_WALK_DEPTH,
            walk_timeout_ms: None,
            lock_retry_limit: 3,
            closure_source: ClosureSource::Cache,
            product_references: ProductReferenceConfig::default(),
            event_channel_capacity: DEFAULT_EVENT_CHANNEL_CAPACITY,
        }
    }
}

impl TreeConfig {
    /// Parse and validate a JSON configuration. Missing fields take defaults.
    pub fn from_json_str(json: &str) -> Result<Self, ConfigError> {
        let config: TreeConfig = serde_json::from_str(json)?;
        config.validate().map_err(ConfigError::Invalid)?;
        Ok(config)
    }

    /// Read, parse and validate a JSON configuration file
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path)?;
        Self::from_json_str(&contents)
    }

    pub fn walk_timeout(&self) -> Option<Duration> {
        self.walk_timeout_ms.map(Duration::from_millis)
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<(), String> {
        if self.path_separator.is_empty() {
            return Err("path_separator cannot be empty".to_string());
        }

        if self.max_walk_depth == 0 {
            return Err("max_walk_depth must be greater than 0".to_string());
        }

        if self.walk_timeout_ms == Some(0) {
            return Err("walk_timeout_ms must be greater than 0 when set".to_string());
        }

        if self.event_channel_capacity == 0 {
            return Err("event_channel_capacity must be greater than 0".to_string());
        }

        let refs = &self.product_references;
        if refs.reference_path.is_empty() || refs.id_field.is_empty() {
            return Err("product_references paths cannot be empty".to_string());
        }

        Ok(())
    }
}
