//! Dependency Updater
//!
//! Keeps derived records consistent when an upstream record changes:
//! - Change filter deciding whether a write is worth propagating
//! - Dependency resolver turning dependency specs into target records
//! - Traversal guard bounding re-entrant propagation per unit of work
//! - Refresh dispatcher refreshing targets in-line or through a task queue

pub mod dispatch;
pub mod notification;
pub mod propagation;
pub mod query;
pub mod store;

#[cfg(test)]
pub(crate) mod test_helpers;

use anyhow::Result;
use dispatch::TaskKind;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::str::FromStr;

// ============================================================================
// YAML config structs (deserialization targets)
// ============================================================================

/// Top-level YAML configuration file structure
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct YamlConfig {
    pub propagation: PropagationYamlConfig,
    pub query: QueryYamlConfig,
    pub queue: QueueYamlConfig,
    pub store: StoreYamlConfig,
}

/// Propagation section
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PropagationYamlConfig {
    /// Attribute whose values declare dependency specs
    pub property: String,
    /// Submit refresh tasks to the queue instead of refreshing in-line
    pub use_job_queue: bool,
    /// Follow reverse relations transitively
    pub recursive: bool,
    /// Relation attributes whose referrers also depend on the subject
    pub relations: Vec<String>,
    /// Multi-value list separator of the host, if any
    pub list_separator: Option<String>,
    /// Diff tables that never count as a semantic change
    pub ignored_tables: Vec<String>,
    /// Attributes (by name) removed from the diff before inspection
    pub ignored_attributes: Vec<String>,
    /// Attribute holding the record's modification date. Writes that only
    /// touch it on the subject itself are skipped by the housekeeping scan,
    /// which never sees it if it is also listed in `ignored_attributes`.
    pub modification_attribute: Option<String>,
    pub traversal_threshold: u32,
}

impl Default for PropagationYamlConfig {
    fn default() -> Self {
        Self {
            property: "Semantic Dependency".into(),
            use_job_queue: false,
            recursive: true,
            relations: Vec::new(),
            list_separator: None,
            ignored_tables: vec![propagation::MODIFICATION_DATE_TABLE.into()],
            ignored_attributes: Vec::new(),
            modification_attribute: Some("_MDAT".into()),
            traversal_threshold: propagation::DEFAULT_TRAVERSAL_THRESHOLD,
        }
    }
}

/// Query section
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct QueryYamlConfig {
    pub limit: usize,
}

impl Default for QueryYamlConfig {
    fn default() -> Self {
        Self {
            limit: store::DEFAULT_QUERY_LIMIT,
        }
    }
}

/// Task queue section
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct QueueYamlConfig {
    pub task_kind: TaskKind,
    /// Put all targets of one dispatch into a single task when supported
    pub batch_tasks: bool,
    /// Delivery attempts per target before the worker gives up
    pub max_attempts: u32,
    pub capacity: usize,
}

impl Default for QueueYamlConfig {
    fn default() -> Self {
        Self {
            task_kind: TaskKind::NullEdit,
            batch_tasks: false,
            max_attempts: dispatch::DEFAULT_MAX_ATTEMPTS,
            capacity: dispatch::DEFAULT_QUEUE_CAPACITY,
        }
    }
}

/// Store section (in-memory store snapshot used by the CLI)
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct StoreYamlConfig {
    pub path: Option<String>,
}

// ============================================================================
// Runtime config (what the application actually uses)
// ============================================================================

/// Application configuration
#[derive(Debug, Clone, Serialize)]
pub struct Config {
    pub property: String,
    pub use_job_queue: bool,
    pub recursive: bool,
    pub relations: Vec<String>,
    pub list_separator: Option<char>,
    pub ignored_tables: Vec<String>,
    pub ignored_attributes: Vec<String>,
    pub modification_attribute: Option<String>,
    pub traversal_threshold: u32,
    pub query_limit: usize,
    pub task_kind: TaskKind,
    pub batch_tasks: bool,
    pub worker_max_attempts: u32,
    pub queue_capacity: usize,
    pub store_path: Option<PathBuf>,
}

impl Default for Config {
    fn default() -> Self {
        Self::from_yaml(YamlConfig::default())
    }
}

impl Config {
    /// Load configuration from environment variables only.
    /// Equivalent to from_yaml_and_env(None).
    pub fn from_env() -> Result<Self> {
        Self::from_yaml_and_env(None)
    }

    /// Load configuration from an optional YAML file, then override with env vars.
    ///
    /// Priority: env var > YAML > default
    ///
    /// If `yaml_path` is None, tries "config.yaml" in CWD. If the file doesn't
    /// exist, falls back to pure env var / defaults.
    pub fn from_yaml_and_env(yaml_path: Option<&Path>) -> Result<Self> {
        let yaml = Self::load_yaml(yaml_path);
        let mut config = Self::from_yaml(yaml);

        if let Ok(v) = std::env::var("SDU_PROPERTY") {
            config.property = v;
        }
        if let Some(v) = env_parse::<bool>("SDU_USE_JOB_QUEUE")? {
            config.use_job_queue = v;
        }
        if let Some(v) = env_parse::<bool>("SDU_RECURSIVE")? {
            config.recursive = v;
        }
        if let Ok(v) = std::env::var("SDU_RELATIONS") {
            config.relations = split_list(&v);
        }
        if let Ok(v) = std::env::var("SDU_LIST_SEPARATOR") {
            config.list_separator = v.chars().next();
        }
        if let Some(v) = env_parse("SDU_TRAVERSAL_THRESHOLD")? {
            config.traversal_threshold = v;
        }
        if let Some(v) = env_parse("SDU_QUERY_LIMIT")? {
            config.query_limit = v;
        }
        if let Some(v) = env_parse::<bool>("SDU_BATCH_TASKS")? {
            config.batch_tasks = v;
        }
        if let Some(v) = env_parse::<TaskKind>("SDU_TASK_KIND")? {
            config.task_kind = v;
        }
        if let Ok(v) = std::env::var("SDU_STORE_PATH") {
            config.store_path = Some(PathBuf::from(v));
        }

        Ok(config)
    }

    fn from_yaml(yaml: YamlConfig) -> Self {
        let p = yaml.propagation;
        Self {
            property: p.property,
            use_job_queue: p.use_job_queue,
            recursive: p.recursive,
            relations: p.relations,
            list_separator: p.list_separator.and_then(|s| s.chars().next()),
            ignored_tables: p.ignored_tables,
            ignored_attributes: p.ignored_attributes,
            modification_attribute: p.modification_attribute,
            traversal_threshold: p.traversal_threshold,
            query_limit: yaml.query.limit,
            task_kind: yaml.queue.task_kind,
            batch_tasks: yaml.queue.batch_tasks,
            worker_max_attempts: yaml.queue.max_attempts,
            queue_capacity: yaml.queue.capacity,
            store_path: yaml.store.path.map(PathBuf::from),
        }
    }

    /// Try to load and parse a YAML config file. Returns defaults on any failure.
    fn load_yaml(yaml_path: Option<&Path>) -> YamlConfig {
        let default_path = Path::new("config.yaml");
        let path = yaml_path.unwrap_or(default_path);

        match std::fs::read_to_string(path) {
            Ok(contents) => match serde_yaml::from_str(&contents) {
                Ok(config) => {
                    tracing::info!("Loaded config from {}", path.display());
                    config
                }
                Err(e) => {
                    tracing::warn!("Failed to parse {}: {}. Using defaults.", path.display(), e);
                    YamlConfig::default()
                }
            },
            Err(_) => {
                tracing::debug!(
                    "No config file at {}, using env vars / defaults",
                    path.display()
                );
                YamlConfig::default()
            }
        }
    }
}

/// Parse an env var when set; a set but unparsable value is an error.
fn env_parse<T>(name: &str) -> Result<Option<T>>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match std::env::var(name) {
        Ok(raw) => raw
            .trim()
            .parse::<T>()
            .map(Some)
            .map_err(|e| anyhow::anyhow!("Invalid value {:?} for {}: {}", raw, name, e)),
        Err(_) => Ok(None),
    }
}

fn split_list(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

// ============================================================================
// Tests
// ============================================================================
