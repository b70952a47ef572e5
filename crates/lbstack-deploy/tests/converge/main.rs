//! Convergence tests for the stack deployer
//!
//! These tests build real stacks with the stack builder and deploy them
//! against the in-memory infrastructure. They tell two kinds of story:
//!
//! - `properties`: guarantees every deploy must keep (idempotence,
//!   resumability, deletion completeness and isolation, dependency ordering,
//!   shared rule convergence under concurrency)
//!
//! - `scenarios`: the lifecycle of one load-balanced Service, from first
//!   deploy through a port addition, a transient failure and teardown

mod helpers;
mod properties;
mod scenarios;
