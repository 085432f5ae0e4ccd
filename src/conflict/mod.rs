//! Conflict analysis
//!
//! Computes which resources a change request conflicts on, how bad that is,
//! and whether the conflict can be resolved mechanically. The raw "what
//! changed on the target" question is answered by a pluggable
//! [`ConflictSource`].

pub mod analyzer;
pub mod cache;
pub mod classify;
pub mod resolver;
pub mod source;
pub mod types;

pub use analyzer::{default_strategies, AnalyzerSettings, ConflictAnalyzer};
pub use cache::ReportCache;
pub use classify::{default_resource_classes, ResourceClassifier};
pub use resolver::resolve_conflicts;
pub use source::{ConflictSource, Git2ConflictSource};
pub use types::{
    ConflictError, ConflictReport, ConflictedResource, ResolutionStrategy, ResolvedResource,
    ResourceClass, Severity, SeverityThresholds,
};

#[cfg(any(test, feature = "testing"))]
pub use source::MockConflictSource;
