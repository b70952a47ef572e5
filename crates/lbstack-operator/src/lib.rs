//! lbstack operator: reconciles Services and Ingresses into load balancer stacks

#![deny(missing_docs)]

pub mod client;
pub mod config;
pub mod controller;
pub mod environment;
pub mod runner;

pub use client::{KubeObjectClient, ObjectClient};
pub use config::ControllerConfig;
pub use controller::{error_policy, plan, reconcile_ingress, reconcile_service, Context, Transition};
pub use environment::{ClusterEnvironment, DefaultSettings, EnvironmentResolver, SettingsResolver};
