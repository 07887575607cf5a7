//! Propagation engine.
//!
//! Entry points called by the host after a write or a deletion completes.
//! A data update runs filter, guard, resolution and dispatch in that order;
//! a deletion skips the filter and the guard because there is no new state to
//! compare against.

use super::filter::{ChangeFilter, FilterDecision, SkipReason};
use super::guard::{GuardDecision, PropagationContext, TraversalGuard};
use super::settings::PropagationSettings;
use crate::dispatch::{DispatchReport, RefreshDispatcher, RefreshService, TaskQueue};
use crate::notification::{normalize_key, ChangeNotification, DeleteNotification};
use crate::query::{DependencyResolver, DependencySpec, Resolution, ResolutionFailure};
use crate::store::QueryExecutor;
use anyhow::{Context, Result};
use serde::Serialize;
use std::sync::Arc;
use tracing::{debug, info};

/// What a propagation run did for one subject
#[derive(Debug, Clone, Serialize)]
pub struct PropagationReport {
    pub subject: String,
    /// Resolved targets, in dispatch order
    pub targets: Vec<String>,
    /// A query hit the result cap; some dependents were not refreshed
    pub truncated: bool,
    pub failures: Vec<ResolutionFailure>,
    pub dispatch: DispatchReport,
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum PropagationOutcome {
    Skipped { reason: SkipReason },
    Suppressed { subject: String, count: u32 },
    Propagated(PropagationReport),
}

impl PropagationOutcome {
    pub fn report(&self) -> Option<&PropagationReport> {
        match self {
            PropagationOutcome::Propagated(report) => Some(report),
            _ => None,
        }
    }
}

pub struct Propagator {
    settings: PropagationSettings,
    filter: ChangeFilter,
    guard: TraversalGuard,
    resolver: DependencyResolver,
    dispatcher: RefreshDispatcher,
}

impl Propagator {
    pub fn new(
        settings: PropagationSettings,
        executor: Arc<dyn QueryExecutor>,
        refresher: Arc<dyn RefreshService>,
        queue: Arc<dyn TaskQueue>,
    ) -> Self {
        let filter = ChangeFilter::new(&settings.tracked_attribute, settings.ignored.clone());
        let guard = TraversalGuard::new(settings.traversal_threshold);
        let resolver = DependencyResolver::new(executor)
            .with_separator(settings.separator)
            .with_limit(settings.query_limit);
        let dispatcher = RefreshDispatcher::new(refresher, queue)
            .with_task_kind(settings.task_kind)
            .with_batching(settings.batch_tasks);

        Self {
            settings,
            filter,
            guard,
            resolver,
            dispatcher,
        }
    }

    pub fn settings(&self) -> &PropagationSettings {
        &self.settings
    }

    pub fn resolver(&self) -> &DependencyResolver {
        &self.resolver
    }

    /// Start a new unit of work.
    pub fn new_context(&self) -> PropagationContext {
        PropagationContext::new()
    }

    /// Handle the notification emitted after a write completed.
    ///
    /// The tracked attribute and the configured relations are independent
    /// triggers: a subject carrying only a relation still propagates to its
    /// referrers as long as the diff holds a semantic change.
    pub async fn on_data_update(
        &self,
        ctx: &mut PropagationContext,
        notification: &ChangeNotification,
    ) -> Result<PropagationOutcome> {
        let Some(subject) = notification.subject() else {
            debug!("Notification without subject, nothing to do");
            return Ok(PropagationOutcome::Skipped {
                reason: SkipReason::MissingSubject,
            });
        };

        let carried = self.carried_relations(notification);
        let spec = match self.filter.evaluate(notification) {
            FilterDecision::Propagate(spec) => spec,
            FilterDecision::Skip(
                reason @ (SkipReason::NoTrackedAttribute | SkipReason::EmptyDependencySpec),
            ) if !carried.is_empty() => {
                if let Some(reason) = self.filter.change_skip_reason(notification) {
                    debug!(subject = %subject, "Skipping: {}", reason);
                    return Ok(PropagationOutcome::Skipped { reason });
                }
                debug!(subject = %subject, "{}, following relations only", reason);
                DependencySpec::default()
            }
            FilterDecision::Skip(reason) => return Ok(PropagationOutcome::Skipped { reason }),
        };

        if let GuardDecision::Suppress { count } = self.guard.check(subject, &mut ctx.counter) {
            info!(
                context = %ctx.id,
                subject = %subject,
                count,
                "Propagation suppressed, subject already traversed"
            );
            return Ok(PropagationOutcome::Suppressed {
                subject: subject.to_string(),
                count,
            });
        }

        info!(context = %ctx.id, subject = %subject, "Propagating change");
        let mut resolution = self.resolver.resolve(&spec).await;
        resolution.merge(self.expand_relations(subject, &carried).await);

        self.dispatch(subject, resolution).await
    }

    /// Handle the removal of a record that held dependency spec values.
    pub async fn on_delete(&self, notification: &DeleteNotification) -> Result<PropagationOutcome> {
        let Some(subject) = notification.subject() else {
            debug!("Delete notification without subject, nothing to do");
            return Ok(PropagationOutcome::Skipped {
                reason: SkipReason::MissingSubject,
            });
        };

        let spec = DependencySpec::new(
            notification
                .prior_spec
                .iter()
                .map(|v| v.trim())
                .filter(|v| !v.is_empty()),
        );
        if spec.is_empty() {
            debug!(subject = %subject, "Deleted record held no dependency spec");
            return Ok(PropagationOutcome::Skipped {
                reason: SkipReason::EmptyDependencySpec,
            });
        }

        info!(subject = %subject, values = spec.values().len(), "Propagating deletion");
        let resolution = self.resolver.resolve(&spec).await;
        self.dispatch(subject, resolution).await
    }

    /// Configured relations the subject carries, in configuration order.
    fn carried_relations(&self, notification: &ChangeNotification) -> Vec<String> {
        self.settings
            .relations
            .iter()
            .filter(|r| {
                notification
                    .current_attributes
                    .keys()
                    .any(|name| normalize_key(name) == **r)
            })
            .cloned()
            .collect()
    }

    /// Referrers of `subject` through the configured relations.
    ///
    /// Only runs when the subject itself carries one of the relations. The
    /// one-level lookup follows the carried relations; the recursive walk
    /// follows all of them.
    async fn expand_relations(&self, subject: &str, carried: &[String]) -> Resolution {
        if self.settings.relations.is_empty() {
            return Resolution::default();
        }
        if carried.is_empty() {
            debug!(subject = %subject, "No relation attributes found");
            return Resolution::default();
        }
        debug!(subject = %subject, relations = ?carried, "Found relation attributes");

        if self.settings.recursive {
            self.resolver
                .resolve_transitive(subject, &self.settings.relations)
                .await
        } else {
            self.resolver.resolve_referrers(subject, carried).await
        }
    }

    async fn dispatch(&self, subject: &str, resolution: Resolution) -> Result<PropagationOutcome> {
        let Resolution {
            targets,
            truncated,
            failures,
        } = resolution;

        debug!(
            subject = %subject,
            targets = targets.len(),
            failures = failures.len(),
            "Dependencies resolved"
        );

        let dispatch = self
            .dispatcher
            .dispatch(&targets, self.settings.mode, Some(subject))
            .await
            .with_context(|| format!("Failed to dispatch refreshes for {}", subject))?;

        Ok(PropagationOutcome::Propagated(PropagationReport {
            subject: subject.to_string(),
            targets: targets.as_slice().to_vec(),
            truncated,
            failures,
            dispatch,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dispatch::DispatchMode;
    use crate::notification::{AttributeDescriptor, ChangeEntry};
    use crate::test_helpers::*;

    #[tokio::test]
    async fn test_missing_tracked_attribute_makes_no_calls() {
        let h = harness(PropagationSettings::default());
        let n = ChangeNotification::new("A")
            .with_attribute("Other", AttributeDescriptor::text(["B"]))
            .with_inserted("smw_di_blob", ChangeEntry::new(1, 7, "x"));

        let mut ctx = h.propagator.new_context();
        let outcome = h.propagator.on_data_update(&mut ctx, &n).await.unwrap();

        assert!(matches!(
            outcome,
            PropagationOutcome::Skipped {
                reason: SkipReason::NoTrackedAttribute
            }
        ));
        assert_eq!(h.executor.call_count().await, 0);
        assert!(h.refresher.refreshed().await.is_empty());
        assert_eq!(h.queue.submission_count().await, 0);
        // a skipped write does not count against the guard
        assert!(ctx.counter.is_empty());
    }

    #[tokio::test]
    async fn test_only_ignored_changes_makes_no_dispatch() {
        let h = harness(PropagationSettings::default());
        let n = ChangeNotification::new("A")
            .with_attribute("Semantic Dependency", AttributeDescriptor::text(["B"]))
            .with_inserted("smw_fpt_mdat", ChangeEntry::new(1, 29, "2024-01-01"));

        let mut ctx = h.propagator.new_context();
        let outcome = h.propagator.on_data_update(&mut ctx, &n).await.unwrap();

        assert!(outcome.report().is_none());
        assert_eq!(h.executor.call_count().await, 0);
        assert!(h.refresher.refreshed().await.is_empty());
    }

    #[tokio::test]
    async fn test_immediate_propagation() {
        let h = harness(PropagationSettings::default());
        h.executor.respond("[[B]] OR [[C]]", &["B", "C"]).await;

        let mut ctx = h.propagator.new_context();
        let outcome = h
            .propagator
            .on_data_update(&mut ctx, &changed("A", &["B OR C"]))
            .await
            .unwrap();

        let report = outcome.report().unwrap();
        assert_eq!(report.subject, "A");
        assert_eq!(report.targets, vec!["B", "C"]);
        assert_eq!(report.dispatch.mode, DispatchMode::Immediate);
        assert_eq!(h.refresher.refreshed().await, vec!["B", "C"]);
        assert_eq!(h.queue.submission_count().await, 0);
    }

    #[tokio::test]
    async fn test_queued_propagation() {
        let h = harness(PropagationSettings {
            mode: DispatchMode::Queued,
            ..Default::default()
        });
        h.executor.respond("[[B]] OR [[C]]", &["B", "C"]).await;

        let mut ctx = h.propagator.new_context();
        h.propagator
            .on_data_update(&mut ctx, &changed("A", &["B OR C"]))
            .await
            .unwrap();

        let tasks = h.queue.tasks().await;
        assert_eq!(h.queue.submission_count().await, 1);
        assert_eq!(tasks.len(), 2);
        assert_eq!(tasks[0].options.origin.as_deref(), Some("A"));
        assert!(h.refresher.refreshed().await.is_empty());
    }

    #[tokio::test]
    async fn test_queue_rejection_is_an_error() {
        let h = harness(PropagationSettings {
            mode: DispatchMode::Queued,
            ..Default::default()
        });
        h.executor.respond("[[B]]", &["B"]).await;
        h.queue.set_rejecting(true);

        let mut ctx = h.propagator.new_context();
        let result = h
            .propagator
            .on_data_update(&mut ctx, &changed("A", &["B"]))
            .await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_refresh_failure_is_not_fatal() {
        let h = harness(PropagationSettings::default());
        h.executor.respond("[[B]] OR [[C]]", &["B", "C"]).await;
        h.refresher.fail_on("B").await;

        let mut ctx = h.propagator.new_context();
        let outcome = h
            .propagator
            .on_data_update(&mut ctx, &changed("A", &["B OR C"]))
            .await
            .unwrap();

        let dispatch = &outcome.report().unwrap().dispatch;
        assert_eq!(dispatch.refreshed, vec!["C"]);
        assert_eq!(dispatch.failed.len(), 1);
    }

    #[tokio::test]
    async fn test_guard_suppresses_third_entry() {
        let h = harness(PropagationSettings::default());
        h.executor.respond("[[B]]", &["B"]).await;
        let n = changed("A", &["B"]);

        let mut ctx = h.propagator.new_context();
        for _ in 0..2 {
            let outcome = h.propagator.on_data_update(&mut ctx, &n).await.unwrap();
            assert!(outcome.report().is_some());
        }
        let outcome = h.propagator.on_data_update(&mut ctx, &n).await.unwrap();
        assert!(matches!(
            outcome,
            PropagationOutcome::Suppressed { count: 3, .. }
        ));
        assert_eq!(h.executor.call_count().await, 2);
        assert_eq!(h.refresher.refreshed().await.len(), 2);

        // a fresh unit of work starts counting from zero
        let mut next = h.propagator.new_context();
        let outcome = h.propagator.on_data_update(&mut next, &n).await.unwrap();
        assert!(outcome.report().is_some());
    }

    #[tokio::test]
    async fn test_separator_list_spec() {
        let h = harness(PropagationSettings {
            separator: Some(';'),
            ..Default::default()
        });
        h.executor.respond("[[B||C]]", &["B", "C"]).await;

        let mut ctx = h.propagator.new_context();
        let outcome = h
            .propagator
            .on_data_update(&mut ctx, &changed("A", &["B;C;"]))
            .await
            .unwrap();
        assert_eq!(outcome.report().unwrap().targets, vec!["B", "C"]);
    }

    #[tokio::test]
    async fn test_relation_expansion_recursive() {
        let h = harness(PropagationSettings {
            relations: vec!["Part_of".into()],
            ..Default::default()
        });
        h.executor.respond("[[B]]", &["B"]).await;
        h.executor.respond("[[Part_of::A]]", &["X"]).await;
        h.executor.respond("[[Part_of::X]]", &["Y"]).await;

        let n = changed("A", &["B"]).with_attribute("Part of", AttributeDescriptor::text(["Top"]));
        let mut ctx = h.propagator.new_context();
        let outcome = h.propagator.on_data_update(&mut ctx, &n).await.unwrap();

        assert_eq!(outcome.report().unwrap().targets, vec!["B", "X", "Y"]);
    }

    #[tokio::test]
    async fn test_relation_expansion_one_level() {
        let h = harness(PropagationSettings {
            relations: vec!["Part_of".into()],
            recursive: false,
            ..Default::default()
        });
        h.executor.respond("[[Part_of::A]]", &["X"]).await;
        h.executor.respond("[[Part_of::X]]", &["Y"]).await;

        let n = changed("A", &["B"]).with_attribute("Part_of", AttributeDescriptor::text(["Top"]));
        let mut ctx = h.propagator.new_context();
        let outcome = h.propagator.on_data_update(&mut ctx, &n).await.unwrap();

        assert_eq!(outcome.report().unwrap().targets, vec!["X"]);
    }

    #[tokio::test]
    async fn test_relations_ignored_when_subject_lacks_them() {
        let h = harness(PropagationSettings {
            relations: vec!["Part_of".into()],
            ..Default::default()
        });
        h.executor.respond("[[B]]", &["B"]).await;

        let mut ctx = h.propagator.new_context();
        h.propagator
            .on_data_update(&mut ctx, &changed("A", &["B"]))
            .await
            .unwrap();
        assert_eq!(h.executor.expressions().await, vec!["[[B]]"]);
    }

    #[tokio::test]
    async fn test_relation_only_subject_propagates() {
        let h = harness(PropagationSettings {
            relations: vec!["Part_of".into()],
            ..Default::default()
        });
        h.executor.respond("[[Part_of::A]]", &["X"]).await;

        let n = ChangeNotification::new("A")
            .with_record_id(1)
            .with_attribute("Part of", AttributeDescriptor::text(["Top"]))
            .with_inserted("smw_di_wikipage", ChangeEntry::new(1, 9, "Top"));
        let mut ctx = h.propagator.new_context();
        let outcome = h.propagator.on_data_update(&mut ctx, &n).await.unwrap();

        assert_eq!(outcome.report().unwrap().targets, vec!["X"]);
        assert_eq!(h.executor.expressions().await, vec!["[[Part_of::A]]", "[[Part_of::X]]"]);
        assert_eq!(h.refresher.refreshed().await, vec!["X"]);
        assert_eq!(ctx.counter.count("A"), 1);
    }

    #[tokio::test]
    async fn test_relation_only_subject_still_needs_a_change() {
        let h = harness(PropagationSettings {
            relations: vec!["Part_of".into()],
            ..Default::default()
        });
        let n = ChangeNotification::new("A")
            .with_attribute("Part of", AttributeDescriptor::text(["Top"]))
            .with_inserted("smw_fpt_mdat", ChangeEntry::new(1, 29, "2024-01-01"));

        let mut ctx = h.propagator.new_context();
        let outcome = h.propagator.on_data_update(&mut ctx, &n).await.unwrap();

        assert!(matches!(
            outcome,
            PropagationOutcome::Skipped {
                reason: SkipReason::NoSemanticChanges
            }
        ));
        assert_eq!(h.executor.call_count().await, 0);
        assert!(ctx.counter.is_empty());
    }

    #[tokio::test]
    async fn test_delete_always_propagates() {
        let h = harness(PropagationSettings::default());
        h.executor.respond("[[B]]", &["B"]).await;

        let n = DeleteNotification::new("A", ["B", " "]);
        for _ in 0..3 {
            let outcome = h.propagator.on_delete(&n).await.unwrap();
            assert_eq!(outcome.report().unwrap().targets, vec!["B"]);
        }
        assert_eq!(h.refresher.refreshed().await.len(), 3);
    }

    #[tokio::test]
    async fn test_delete_without_spec_or_subject() {
        let h = harness(PropagationSettings::default());

        let outcome = h
            .propagator
            .on_delete(&DeleteNotification::new("A", Vec::<String>::new()))
            .await
            .unwrap();
        assert!(matches!(
            outcome,
            PropagationOutcome::Skipped {
                reason: SkipReason::EmptyDependencySpec
            }
        ));

        let outcome = h
            .propagator
            .on_delete(&DeleteNotification::default())
            .await
            .unwrap();
        assert!(matches!(
            outcome,
            PropagationOutcome::Skipped {
                reason: SkipReason::MissingSubject
            }
        ));
        assert_eq!(h.executor.call_count().await, 0);
    }

    #[tokio::test]
    async fn test_outcome_serializes_with_tag() {
        let outcome = PropagationOutcome::Skipped {
            reason: SkipReason::HousekeepingOnly,
        };
        let json = serde_json::to_value(&outcome).unwrap();
        assert_eq!(json["outcome"], "skipped");
        assert_eq!(json["reason"], "housekeeping_only");
    }
}
