//! Kubernetes Event recording for lbstack controllers.
//!
//! Provides a trait-based abstraction over `kube::runtime::events::Recorder`
//! so that reconcilers can emit Events visible via `kubectl describe` on the
//! Service or Ingress being reconciled.
//!
//! Events are **fire-and-forget**: failures are logged as warnings and never
//! propagate errors. A failed event must never break reconciliation.

use async_trait::async_trait;
use k8s_openapi::api::core::v1::ObjectReference;
use kube::runtime::events::{EventType, Recorder, Reporter};
use kube::Client;
use tracing::warn;

/// Trait for publishing Kubernetes Events.
#[async_trait]
pub trait EventPublisher: Send + Sync {
    /// Publish a Kubernetes Event on the given object.
    ///
    /// # Arguments
    ///
    /// * `resource_ref` - The Kubernetes object this event is about
    /// * `type_` - Normal or Warning
    /// * `reason` - Machine-readable reason string (e.g. "DeployFailed")
    /// * `action` - What action was taken (e.g. "Deploy")
    /// * `note` - Optional human-readable message
    async fn publish(
        &self,
        resource_ref: &ObjectReference,
        type_: EventType,
        reason: &str,
        action: &str,
        note: Option<String>,
    );
}

/// Production implementation wrapping `kube::runtime::events::Recorder`.
pub struct KubeEventPublisher {
    recorder: Recorder,
}

impl KubeEventPublisher {
    /// Create a new publisher for the given controller name.
    pub fn new(client: Client, controller_name: &str) -> Self {
        let reporter = Reporter {
            controller: controller_name.to_string(),
            instance: std::env::var("POD_NAME").ok(),
        };
        Self {
            recorder: Recorder::new(client, reporter),
        }
    }
}

#[async_trait]
impl EventPublisher for KubeEventPublisher {
    async fn publish(
        &self,
        resource_ref: &ObjectReference,
        type_: EventType,
        reason: &str,
        action: &str,
        note: Option<String>,
    ) {
        let event = kube::runtime::events::Event {
            type_,
            reason: reason.to_string(),
            note,
            action: action.to_string(),
            secondary: None,
        };
        if let Err(e) = self.recorder.publish(&event, resource_ref).await {
            warn!(
                reason,
                action,
                error = %e,
                "Failed to publish Kubernetes event"
            );
        }
    }
}

/// No-op implementation for tests.
pub struct NoopEventPublisher;

#[async_trait]
impl EventPublisher for NoopEventPublisher {
    async fn publish(
        &self,
        _resource_ref: &ObjectReference,
        _type_: EventType,
        _reason: &str,
        _action: &str,
        _note: Option<String>,
    ) {
    }
}

/// Well-known event reason strings.
pub mod reasons {
    /// Build, deploy and status update all completed
    pub const SUCCESSFULLY_RECONCILED: &str = "SuccessfullyReconciled";
    /// The object could not be turned into a stack
    pub const BUILD_FAILED: &str = "BuildFailed";
    /// The stack could not be converged
    pub const DEPLOY_FAILED: &str = "DeployFailed";
    /// Finalizer attached before first deploy
    pub const FINALIZER_ADDED: &str = "FinalizerAdded";
    /// Teardown of the object's infrastructure began
    pub const CLEANUP_STARTED: &str = "CleanupStarted";
    /// Teardown finished and the finalizer was released
    pub const CLEANUP_COMPLETE: &str = "CleanupComplete";
}

/// Well-known event action strings.
pub mod actions {
    /// Standard reconciliation loop
    pub const RECONCILE: &str = "Reconcile";
    /// Building the desired stack
    pub const BUILD: &str = "Build";
    /// Converging the stack against live infrastructure
    pub const DEPLOY: &str = "Deploy";
    /// Tearing down infrastructure
    pub const DELETE: &str = "Delete";
}
