//! Propagation of changes to dependent records
//!
//! - [`filter`]: whether a write triggers propagation at all
//! - [`guard`]: per unit of work re-entrancy limit
//! - [`settings`]: effective configuration resolved against the store
//! - [`engine`]: the entry points tying filter, guard, resolver and dispatcher

pub mod engine;
pub mod filter;
pub mod guard;
pub mod settings;

pub use engine::{PropagationOutcome, PropagationReport, Propagator};
pub use filter::{
    should_propagate, ChangeFilter, FilterDecision, IgnoredAttributes, SkipReason,
    MODIFICATION_DATE_TABLE,
};
pub use guard::{
    GuardDecision, PropagationContext, TraversalCounter, TraversalGuard,
    DEFAULT_TRAVERSAL_THRESHOLD,
};
pub use settings::PropagationSettings;
