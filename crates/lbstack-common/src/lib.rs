//! Common types for lbstack: errors, retry, events, telemetry and Kubernetes helpers

#![deny(missing_docs)]

pub mod error;
pub mod events;
pub mod kube_utils;
pub mod retry;
pub mod telemetry;

pub use error::Error;

/// Result type alias using our custom Error type
pub type Result<T> = std::result::Result<T, Error>;

/// Field manager used for every patch issued by the controller
pub const FIELD_MANAGER: &str = "lbstack-controller";

/// Tag prefix for infrastructure owned by Service stacks
pub const SERVICE_TAG_PREFIX: &str = "service.lbstack.io";

/// Tag prefix for infrastructure owned by Ingress stacks
pub const INGRESS_TAG_PREFIX: &str = "ingress.lbstack.io";

/// Finalizer guarding Services that may own load-balancer infrastructure
pub const SERVICE_FINALIZER: &str = "service.lbstack.io/load-balancer-finalizer";

/// Finalizer guarding Ingresses that may own load-balancer infrastructure
pub const INGRESS_FINALIZER: &str = "ingress.lbstack.io/resources";

/// Default ingress class handled when none is configured
pub const DEFAULT_INGRESS_CLASS: &str = "alb";

/// Legacy annotation naming the ingress class
pub const INGRESS_CLASS_ANNOTATION: &str = "kubernetes.io/ingress.class";
