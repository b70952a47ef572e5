//! Infrastructure API boundary
//!
//! The controller never talks to a provider SDK directly. Everything it needs
//! (tag-filtered discovery, create/update/delete, and the rule set of a
//! shared security group) goes through [`CloudApi`].

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use lbstack_common::Error;
use lbstack_model::{Realized, ResourceKind, Tags};

/// A resource as it currently exists in the infrastructure
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LiveResource {
    /// Resource type
    pub kind: ResourceKind,
    /// Cloud-assigned identifier
    pub cloud_id: String,
    /// Tags on the resource
    pub tags: Tags,
    /// Applied attribute document
    pub attributes: serde_json::Value,
    /// DNS name, for load balancers
    pub dns_name: Option<String>,
}

impl LiveResource {
    /// The attributes other nodes resolve against
    pub fn realized(&self) -> Realized {
        Realized {
            cloud_id: self.cloud_id.clone(),
            dns_name: self.dns_name.clone(),
        }
    }

    /// Whether any string in the applied attributes equals `cloud_id`
    pub fn references(&self, cloud_id: &str) -> bool {
        fn walk(value: &serde_json::Value, needle: &str) -> bool {
            match value {
                serde_json::Value::String(s) => s == needle,
                serde_json::Value::Array(items) => items.iter().any(|v| walk(v, needle)),
                serde_json::Value::Object(map) => map.values().any(|v| walk(v, needle)),
                _ => false,
            }
        }
        walk(&self.attributes, cloud_id)
    }
}

/// One inbound rule on a security group
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SecurityGroupRule {
    /// IP protocol
    pub protocol: String,
    /// First port
    pub from_port: u16,
    /// Last port
    pub to_port: u16,
    /// Source security group
    pub source: String,
    /// Free-form description; carries the owner annotation
    pub description: String,
}

/// Infrastructure API failure
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CloudError {
    /// Rate limit exceeded
    #[error("request throttled: {0}")]
    Throttled(String),

    /// Service temporarily unavailable or network failure
    #[error("service unavailable: {0}")]
    Unavailable(String),

    /// Resource does not exist
    #[error("resource {0} not found")]
    NotFound(String),

    /// Dependent objects are still detaching
    #[error("resource {0} has dependent objects")]
    DependencyViolation(String),

    /// Resource is in use in a way that will not clear by itself
    #[error("resource {0} is in use: {1}")]
    InUse(String, String),

    /// Caller lacks permission
    #[error("access denied: {0}")]
    AccessDenied(String),

    /// Request rejected as malformed
    #[error("invalid request: {0}")]
    Invalid(String),
}

/// Provider error codes treated as throttling
const THROTTLING_CODES: &[&str] = &["Throttling", "ThrottlingException", "RequestLimitExceeded"];

/// Provider error codes treated as not found
const NOT_FOUND_CODES: &[&str] = &[
    "LoadBalancerNotFound",
    "TargetGroupNotFound",
    "ListenerNotFound",
    "RuleNotFound",
    "InvalidGroup.NotFound",
    "InvalidPermission.NotFound",
];

impl CloudError {
    /// Whether the same request may succeed if retried
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            CloudError::Throttled(_)
                | CloudError::Unavailable(_)
                | CloudError::DependencyViolation(_)
        )
    }

    /// Whether the resource is already gone
    pub fn is_not_found(&self) -> bool {
        matches!(self, CloudError::NotFound(_))
    }

    /// Classify a provider error code
    pub fn classify(code: Option<&str>, message: &str) -> Self {
        let message = message.to_string();
        match code {
            Some(c) if THROTTLING_CODES.contains(&c) => CloudError::Throttled(message),
            Some(c) if NOT_FOUND_CODES.contains(&c) => CloudError::NotFound(message),
            Some("DependencyViolation") => CloudError::DependencyViolation(message),
            Some("ResourceInUse") => CloudError::InUse(message, "in use".to_string()),
            Some("AccessDenied" | "UnauthorizedOperation") => CloudError::AccessDenied(message),
            Some("ServiceUnavailable" | "InternalFailure") | None => {
                CloudError::Unavailable(message)
            }
            Some(_) => CloudError::Invalid(message),
        }
    }

    /// Attach operation and resource context, keeping the retry classification
    pub fn into_error(self, operation: &str, resource: impl Into<String>) -> Error {
        let retryable = self.is_retryable();
        Error::Cloud {
            operation: operation.to_string(),
            resource: resource.into(),
            message: self.to_string(),
            retryable,
        }
    }
}

/// The infrastructure the controller converges
#[async_trait]
pub trait CloudApi: Send + Sync {
    /// Live resources of `kind` carrying every tag in `filter`
    async fn list_tagged(
        &self,
        kind: ResourceKind,
        filter: &Tags,
    ) -> Result<Vec<LiveResource>, CloudError>;

    /// Create a resource with the given attributes and tags
    async fn create(
        &self,
        kind: ResourceKind,
        attributes: &serde_json::Value,
        tags: &Tags,
    ) -> Result<LiveResource, CloudError>;

    /// Replace a resource's attributes and tags in place
    async fn update(
        &self,
        kind: ResourceKind,
        cloud_id: &str,
        attributes: &serde_json::Value,
        tags: &Tags,
    ) -> Result<LiveResource, CloudError>;

    /// Delete a resource
    async fn delete(&self, kind: ResourceKind, cloud_id: &str) -> Result<(), CloudError>;

    /// Inbound rules of a security group
    async fn security_group_rules(
        &self,
        group_id: &str,
    ) -> Result<Vec<SecurityGroupRule>, CloudError>;

    /// Add inbound rules to a security group
    async fn authorize_rules(
        &self,
        group_id: &str,
        rules: &[SecurityGroupRule],
    ) -> Result<(), CloudError>;

    /// Remove inbound rules from a security group
    async fn revoke_rules(
        &self,
        group_id: &str,
        rules: &[SecurityGroupRule],
    ) -> Result<(), CloudError>;
}
