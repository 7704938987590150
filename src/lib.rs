// ============================================================================
// Linting
// ============================================================================

#![forbid(unsafe_code)]               // Unsafe code is forbidden
#![warn(missing_docs)]                // Public items should be documented
#![deny(unused_must_use)]             // Must handle Result and Option explicitly
#![deny(nonstandard_style)]           // Non-standard code style is forbidden

// Clippy lints (warnings only)
#![warn(clippy::all)]                 // All standard Clippy lints
#![warn(clippy::pedantic)]            // Very strict Clippy lints
#![warn(clippy::nursery)]             // Experimental lints
#![warn(clippy::unwrap_used)]         // unwrap() warning
#![warn(clippy::expect_used)]         // expect() warning
#![warn(clippy::panic)]               // panic!() warning
#![warn(clippy::print_stdout)]        // println!() warning
#![warn(clippy::todo)]                // TODO warning
#![warn(clippy::unimplemented)]       // unimplemented!() warning
#![warn(clippy::redundant_clone)]     // Useless clones warning
#![warn(clippy::cognitive_complexity)] // Limit cognitive complexity
#![cfg_attr(test, allow(clippy::unwrap_used, clippy::expect_used, clippy::panic))]

// ============================================================================
// Crate Documentation
// ============================================================================

//! # Kestrel
//!
//! A declarative, dependency-aware provisioning engine for small k3s
//! clusters of virtual machines.
//!
//! ## Overview
//!
//! Kestrel owns the whole provisioning workflow instead of shelling out to
//! an infrastructure-as-code binary:
//!
//! - Describe the cluster in `kestrel.yaml`
//! - Expand it into typed resource descriptors with typed references
//! - Plan create, update and delete operations against the applied state
//! - Execute the plan concurrently, retrying transient provider failures
//!   and skipping the dependents of anything that failed
//!
//! ## Architecture
//!
//! 1. **Desired State**: [`resource::ClusterBlueprint`] turns configuration
//!    into descriptors
//! 2. **Applied State**: [`state::StateStore`] records what the provider
//!    has confirmed
//! 3. **Reconciler**: plans the difference and runs it through the
//!    [`planner::Executor`] against a [`provider::Provider`]
//!
//! ## Modules
//!
//! - [`config`]: Configuration parsing and validation
//! - [`resource`]: Descriptors, validation, fingerprints and the blueprint
//! - [`planner`]: Dependency graph, diff, plan and executor
//! - [`provider`]: Cloud API boundary (in-memory and HTTP)
//! - [`state`]: Local state file, lock and transactions
//! - [`reconciler`]: Apply, destroy and status cycles
//! - [`cli`]: Command-line interface
//!
//! ## Example
//!
//! ```yaml
//! cluster:
//!   resource_group: k3s-cluster
//!   admin_username: azureuser
//!   ssh_key_path: ~/.ssh/id_rsa.pub
//!   node_count: 3
//! ```

// ============================================================================
// Modules
// ============================================================================

pub mod cli;
pub mod config;
pub mod error;
pub mod planner;
pub mod provider;
pub mod reconciler;
pub mod resource;
pub mod retry;
pub mod state;

// ============================================================================
// Re-exports
// ============================================================================

pub use cli::{Cli, Commands, OutputFormatter};
pub use config::{ConfigParser, ConfigValidator, KestrelConfig};
pub use error::{KestrelError, Result};
pub use planner::{Executor, Plan, PlanEngine};
pub use provider::{HttpProvider, MemoryProvider, Provider};
pub use reconciler::{ApplyReport, Reconciler};
pub use resource::{ResourceDescriptor, ResourceKind};
pub use state::{LocalStateStore, StateStore};
