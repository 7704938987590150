//! Resource descriptor model.
//!
//! Typed descriptors for every cloud resource the engine manages, their
//! per-kind validation, fingerprints, and the cluster blueprint that turns
//! configuration into descriptors.

mod descriptor;
mod validator;
mod hash;
mod blueprint;

pub use descriptor::{ResourceDescriptor, ResourceKind, ResourceRef};
pub use validator::DescriptorValidator;
pub(crate) use validator::is_valid_name;
pub use hash::Fingerprint;
pub use blueprint::{ClusterBlueprint, BOOTSTRAP_PROFILE};
