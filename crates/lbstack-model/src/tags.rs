//! Ownership tag schema
//!
//! Every resource the controller creates carries three tags:
//!
//! | key | value |
//! |---|---|
//! | `lbstack.io/cluster` | cluster name |
//! | `<prefix>/stack` | stack ID (`cluster/namespace/name`) |
//! | `<prefix>/resource` | logical ID within the stack |
//!
//! The prefix differs per object kind, so a Service and an Ingress sharing a
//! namespace and name never discover each other's resources.

use std::collections::BTreeMap;

use crate::stack::StackId;

/// Tag map attached to infrastructure resources
pub type Tags = BTreeMap<String, String>;

/// Cluster-wide tag key, independent of object kind
pub const CLUSTER_TAG_KEY: &str = "lbstack.io/cluster";

/// Tag schema for one object kind
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OwnershipTags {
    prefix: String,
}

impl OwnershipTags {
    /// Schema rooted at `prefix` (e.g. "service.lbstack.io")
    pub fn new(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
        }
    }

    /// Key holding the stack ID
    pub fn stack_key(&self) -> String {
        format!("{}/stack", self.prefix)
    }

    /// Key holding the logical resource ID
    pub fn resource_key(&self) -> String {
        format!("{}/resource", self.prefix)
    }

    /// Full tag set for one resource of `stack`
    pub fn for_resource(&self, stack: &StackId, logical_id: &str) -> Tags {
        let mut tags = self.filter(stack);
        tags.insert(self.resource_key(), logical_id.to_string());
        tags
    }

    /// Tags every resource of `stack` carries; used as a discovery filter
    pub fn filter(&self, stack: &StackId) -> Tags {
        Tags::from([
            (CLUSTER_TAG_KEY.to_string(), stack.cluster.clone()),
            (self.stack_key(), stack.to_string()),
        ])
    }

    /// Whether `tags` contain every entry of the discovery filter for `stack`
    pub fn matches(&self, tags: &Tags, stack: &StackId) -> bool {
        self.filter(stack)
            .iter()
            .all(|(k, v)| tags.get(k) == Some(v))
    }

    /// Logical ID recorded on a live resource
    pub fn logical_id_of<'a>(&self, tags: &'a Tags) -> Option<&'a str> {
        tags.get(&self.resource_key()).map(String::as_str)
    }
}
