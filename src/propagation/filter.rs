//! Change filter: decides whether a write is worth propagating.
//!
//! Checks run in order and the first failing one wins:
//! 1. the notification names a subject
//! 2. the subject carries the tracked attribute
//! 3. the diff still has rows after ignored tables and attributes are removed
//! 4. the remaining rows are not only the subject's modification timestamp
//! 5. the tracked attribute has at least one textual value
//!
//! The filter is pure; it only logs.

use crate::notification::{normalize_key, AttributeId, ChangeNotification, DataValue, TableDiff};
use crate::query::DependencySpec;
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use tracing::debug;

/// Diff table the store uses for its internal modification dates
pub const MODIFICATION_DATE_TABLE: &str = "smw_fpt_mdat";

/// Diff rows that never count as a semantic change
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct IgnoredAttributes {
    /// Tables dropped wholesale
    pub tables: BTreeSet<String>,
    /// Attribute ids dropped from every table
    pub attribute_ids: BTreeSet<AttributeId>,
    /// Id of the modification timestamp attribute, for the housekeeping scan
    pub modification_id: Option<AttributeId>,
}

impl IgnoredAttributes {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_table(mut self, table: impl Into<String>) -> Self {
        self.tables.insert(table.into());
        self
    }

    pub fn with_attribute_id(mut self, id: AttributeId) -> Self {
        self.attribute_ids.insert(id);
        self
    }

    pub fn with_modification_id(mut self, id: Option<AttributeId>) -> Self {
        self.modification_id = id;
        self
    }

    /// Copy of `diff` without ignored tables, ignored rows and tables left empty.
    pub fn strip(&self, diff: &BTreeMap<String, TableDiff>) -> BTreeMap<String, TableDiff> {
        diff.iter()
            .filter(|(table, _)| !self.tables.contains(table.as_str()))
            .filter_map(|(table, rows)| {
                let mut rows = rows.clone();
                rows.retain(|e| !self.attribute_ids.contains(&e.attribute_id));
                (!rows.is_empty()).then(|| (table.clone(), rows))
            })
            .collect()
    }
}

/// Why a notification did not trigger propagation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SkipReason {
    MissingSubject,
    NoTrackedAttribute,
    NoSemanticChanges,
    HousekeepingOnly,
    EmptyDependencySpec,
}

impl fmt::Display for SkipReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            SkipReason::MissingSubject => "no subject",
            SkipReason::NoTrackedAttribute => "no tracked attribute found",
            SkipReason::NoSemanticChanges => "no semantic data changes detected",
            SkipReason::HousekeepingOnly => "only the modification date changed",
            SkipReason::EmptyDependencySpec => "tracked attribute has no usable values",
        };
        f.write_str(text)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FilterDecision {
    Propagate(DependencySpec),
    Skip(SkipReason),
}

impl FilterDecision {
    pub fn triggers(&self) -> bool {
        matches!(self, FilterDecision::Propagate(_))
    }

    pub fn into_spec(self) -> Option<DependencySpec> {
        match self {
            FilterDecision::Propagate(spec) => Some(spec),
            FilterDecision::Skip(_) => None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ChangeFilter {
    tracked_attribute: String,
    ignored: IgnoredAttributes,
}

impl ChangeFilter {
    pub fn new(tracked_attribute: &str, ignored: IgnoredAttributes) -> Self {
        Self {
            tracked_attribute: normalize_key(tracked_attribute),
            ignored,
        }
    }

    pub fn tracked_attribute(&self) -> &str {
        &self.tracked_attribute
    }

    pub fn ignored(&self) -> &IgnoredAttributes {
        &self.ignored
    }

    pub fn evaluate(&self, notification: &ChangeNotification) -> FilterDecision {
        let Some(subject) = notification.subject() else {
            debug!("Notification without subject, nothing to do");
            return FilterDecision::Skip(SkipReason::MissingSubject);
        };

        let Some(descriptor) = notification
            .current_attributes
            .iter()
            .find(|(name, _)| normalize_key(name) == self.tracked_attribute)
            .map(|(_, d)| d)
        else {
            debug!(subject = %subject, "No {} attribute found", self.tracked_attribute);
            return FilterDecision::Skip(SkipReason::NoTrackedAttribute);
        };

        if let Some(reason) = self.change_skip_reason(notification) {
            debug!(subject = %subject, "Skipping: {}", reason);
            return FilterDecision::Skip(reason);
        }
        debug!(subject = %subject, "Data changes detected");

        let mut values = Vec::new();
        for value in &descriptor.values {
            match value.as_spec_text().map(str::trim) {
                Some(text) if !text.is_empty() => values.push(text.to_string()),
                Some(_) => {}
                None => debug!(
                    subject = %subject,
                    "Ignoring {} value of the tracked attribute",
                    value_kind(value)
                ),
            }
        }
        if values.is_empty() {
            debug!(subject = %subject, "Skipping: {}", SkipReason::EmptyDependencySpec);
            return FilterDecision::Skip(SkipReason::EmptyDependencySpec);
        }

        FilterDecision::Propagate(DependencySpec::new(values))
    }

    /// Diff-based checks only: `None` when the diff holds a semantic change.
    pub fn change_skip_reason(&self, notification: &ChangeNotification) -> Option<SkipReason> {
        let remaining = self.ignored.strip(&notification.diff);
        if remaining.is_empty() {
            return Some(SkipReason::NoSemanticChanges);
        }
        if self.housekeeping_only(notification, &remaining) {
            return Some(SkipReason::HousekeepingOnly);
        }
        None
    }

    /// True when every remaining row belongs to the subject and touches only
    /// its modification timestamp.
    fn housekeeping_only(
        &self,
        notification: &ChangeNotification,
        remaining: &BTreeMap<String, TableDiff>,
    ) -> bool {
        let (Some(modification_id), Some(record_id)) =
            (self.ignored.modification_id, notification.subject_record_id)
        else {
            return false;
        };

        let mut own_rows = 0usize;
        for entry in remaining.values().flat_map(|t| t.entries()) {
            if entry.record_id != record_id || entry.attribute_id != modification_id {
                return false;
            }
            own_rows += 1;
        }
        own_rows > 0
    }
}

fn value_kind(value: &DataValue) -> &'static str {
    match value {
        DataValue::Text(_) => "text",
        DataValue::Record(_) => "record",
        DataValue::Number(_) => "number",
        DataValue::Boolean(_) => "boolean",
    }
}

/// Boolean form of [`ChangeFilter::evaluate`].
pub fn should_propagate(
    notification: &ChangeNotification,
    tracked_attribute: &str,
    ignored: &IgnoredAttributes,
) -> (bool, Option<DependencySpec>) {
    let decision = ChangeFilter::new(tracked_attribute, ignored.clone()).evaluate(notification);
    (decision.triggers(), decision.into_spec())
}
