//! Stack model for lbstack
//!
//! A stack is the dependency-ordered graph of infrastructure resources that
//! one Service or Ingress needs. This crate owns the graph itself, the
//! single-assignment reference table used while deploying it, the ownership
//! tag schema used to discover live resources, and the builder that turns
//! an intent object into a stack.

#![deny(missing_docs)]

pub mod builder;
pub mod intent;
mod naming;
pub mod resource;
pub mod settings;
pub mod stack;
pub mod tags;

pub use builder::StackBuilder;
pub use intent::{
    BackendPort, BackendRef, ClassMatcher, DesiredState, Frontend, IntentObject, ObjectKind,
};
pub use resource::{ReferenceTable, Realized, Resolvable, ResourceKind, ResourceRef, ResourceSpec};
pub use settings::{BuildEnvironment, LoadBalancerSettings, ResolvedBackend};
pub use stack::{SharedRuleSpec, Stack, StackId, StackSequence};
pub use tags::{OwnershipTags, Tags};
