//! Query building and dependency resolution
//!
//! Turns dependency spec text into typed query expressions, runs them
//! against the store, and walks referrer relations transitively.

pub mod expr;
pub mod resolver;

pub use expr::{Condition, Conjunction, QueryBuildError, QueryExpr};
pub use resolver::{
    DependencyResolver, DependencySpec, Resolution, ResolutionFailure, TargetSet,
};
