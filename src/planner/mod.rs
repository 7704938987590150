//! Planning and execution.
//!
//! Builds the dependency graph of the desired resources, diffs them against
//! the applied state into an ordered plan, and runs that plan against a
//! provider.

mod diff;
mod graph;
mod plan;
mod executor;

pub use diff::{DiffDetail, DiffEngine};
pub use graph::DependencyGraph;
pub use plan::{Action, Plan, PlanCounts, PlanEngine, PlanOperation};
pub use executor::{ExecutionReport, Executor, ExecutionResult, Outcome};
