//! Effective propagation settings.
//!
//! Built once from [`Config`](crate::Config) at startup. Symbolic attribute
//! names are resolved to store ids here through the [`AttributeCatalog`], so
//! the filter only ever compares numbers.

use super::filter::IgnoredAttributes;
use super::guard::DEFAULT_TRAVERSAL_THRESHOLD;
use crate::dispatch::{DispatchMode, TaskKind, DEFAULT_MAX_ATTEMPTS, DEFAULT_QUEUE_CAPACITY};
use crate::notification::normalize_key;
use crate::store::{AttributeCatalog, DEFAULT_QUERY_LIMIT};
use crate::Config;
use anyhow::{bail, Result};
use serde::Serialize;

#[derive(Debug, Clone, Serialize)]
pub struct PropagationSettings {
    /// Tracked attribute, in store key form
    pub tracked_attribute: String,
    pub mode: DispatchMode,
    pub recursive: bool,
    /// Relation attributes, in store key form
    pub relations: Vec<String>,
    pub separator: Option<char>,
    pub ignored: IgnoredAttributes,
    pub traversal_threshold: u32,
    pub query_limit: usize,
    pub task_kind: TaskKind,
    pub batch_tasks: bool,
    pub worker_max_attempts: u32,
    pub queue_capacity: usize,
}

impl Default for PropagationSettings {
    fn default() -> Self {
        Self {
            tracked_attribute: "Semantic_Dependency".into(),
            mode: DispatchMode::Immediate,
            recursive: true,
            relations: Vec::new(),
            separator: None,
            ignored: IgnoredAttributes::new().with_table(super::filter::MODIFICATION_DATE_TABLE),
            traversal_threshold: DEFAULT_TRAVERSAL_THRESHOLD,
            query_limit: DEFAULT_QUERY_LIMIT,
            task_kind: TaskKind::NullEdit,
            batch_tasks: false,
            worker_max_attempts: DEFAULT_MAX_ATTEMPTS,
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
        }
    }
}

impl PropagationSettings {
    /// Resolve `config` against the store's attribute catalog.
    ///
    /// Attribute names the catalog does not know are skipped with a warning;
    /// they cannot appear in a diff anyway.
    pub fn resolve(config: &Config, catalog: &dyn AttributeCatalog) -> Result<Self> {
        let tracked_attribute = normalize_key(&config.property);
        if tracked_attribute.is_empty() {
            bail!("Tracked attribute name must not be empty");
        }
        if config.traversal_threshold == 0 {
            bail!("traversal_threshold must be at least 1");
        }
        if config.query_limit == 0 {
            bail!("query limit must be at least 1");
        }

        let mut ignored = IgnoredAttributes::new();
        for table in &config.ignored_tables {
            ignored = ignored.with_table(table.trim());
        }
        for name in &config.ignored_attributes {
            match catalog.attribute_id(name) {
                Some(id) => ignored = ignored.with_attribute_id(id),
                None => tracing::warn!("Unknown ignored attribute {:?}, skipping", name),
            }
        }
        if let Some(name) = &config.modification_attribute {
            let id = catalog.attribute_id(name);
            if id.is_none() {
                tracing::warn!(
                    "Unknown modification attribute {:?}, housekeeping scan disabled",
                    name
                );
            }
            ignored = ignored.with_modification_id(id);
        }

        let relations = config
            .relations
            .iter()
            .map(|r| normalize_key(r))
            .filter(|r| !r.is_empty())
            .collect();

        Ok(Self {
            tracked_attribute,
            mode: if config.use_job_queue {
                DispatchMode::Queued
            } else {
                DispatchMode::Immediate
            },
            recursive: config.recursive,
            relations,
            separator: config.list_separator,
            ignored,
            traversal_threshold: config.traversal_threshold,
            query_limit: config.query_limit,
            task_kind: config.task_kind,
            batch_tasks: config.batch_tasks,
            worker_max_attempts: config.worker_max_attempts,
            queue_capacity: config.queue_capacity,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::mock::MockQueryExecutor;

    #[test]
    fn test_resolve_defaults() {
        let catalog = MockQueryExecutor::new().with_attribute("_MDAT", 29);
        let settings = PropagationSettings::resolve(&Config::default(), &catalog).unwrap();

        assert_eq!(settings.tracked_attribute, "Semantic_Dependency");
        assert_eq!(settings.mode, DispatchMode::Immediate);
        assert!(settings.ignored.tables.contains("smw_fpt_mdat"));
        assert!(settings.ignored.attribute_ids.is_empty());
        assert_eq!(settings.ignored.modification_id, Some(29));
        assert_eq!(settings.traversal_threshold, 2);
    }

    #[test]
    fn test_unknown_attribute_names_skipped() {
        let catalog = MockQueryExecutor::new().with_attribute("_MDAT", 29);
        let config = Config {
            ignored_attributes: vec!["_MDAT".into(), "Nope".into()],
            modification_attribute: Some("Also nope".into()),
            ..Config::default()
        };
        let settings = PropagationSettings::resolve(&config, &catalog).unwrap();
        assert_eq!(settings.ignored.attribute_ids.len(), 1);
        assert_eq!(settings.ignored.modification_id, None);
    }

    #[test]
    fn test_queue_mode_and_relations() {
        let catalog = MockQueryExecutor::new();
        let config = Config {
            use_job_queue: true,
            relations: vec!["Part of".into(), " ".into()],
            ..Config::default()
        };
        let settings = PropagationSettings::resolve(&config, &catalog).unwrap();
        assert_eq!(settings.mode, DispatchMode::Queued);
        assert_eq!(settings.relations, vec!["Part_of"]);
    }

    #[test]
    fn test_invalid_values_rejected() {
        let catalog = MockQueryExecutor::new();
        for config in [
            Config {
                property: "  ".into(),
                ..Config::default()
            },
            Config {
                traversal_threshold: 0,
                ..Config::default()
            },
            Config {
                query_limit: 0,
                ..Config::default()
            },
        ] {
            assert!(PropagationSettings::resolve(&config, &catalog).is_err());
        }
    }
}
