//! Queue module: readiness policy, dependency graph and retry/reclaim policy.
//!
//! Nothing here touches storage; both store implementations and the resolver
//! sweep call into these pure types.

pub mod dependency;
pub mod retry;

pub use dependency::{DependencyGraph, Readiness};
pub use retry::{ReclaimPolicy, ReclaimReport, RetryCascade, RetrySelection};
