//! Deploying stacks against live infrastructure
//!
//! [`StackDeployer`] converges one stack per call: it discovers the live
//! resources carrying the stack's ownership tags, diffs them against the
//! desired graph kind by kind, and applies the delta in dependency order.
//! [`SharedSecurityGroupReconciler`] serializes every stack's writes to the
//! one security group they all share.

#![deny(missing_docs)]

pub mod cloud;
pub mod deployer;
pub mod diff;
pub mod fanout;
pub mod memory;
pub mod shared;

pub use cloud::{CloudApi, CloudError, LiveResource, SecurityGroupRule};
pub use deployer::{DeployReport, StackDeployer};
pub use memory::InMemoryCloud;
pub use shared::SharedSecurityGroupReconciler;
