//! Shared security group rule reconciliation
//!
//! When a backend security group is shared by every load balancer in the
//! cluster, each stack contributes inbound rules to it. Contributions are
//! identified by an owner annotation in the rule description, and every
//! read-modify-write of the rule set happens under one lock so that two
//! stacks reconciling at once never drop each other's rules.

use std::collections::BTreeSet;
use std::sync::Arc;

use tokio::sync::Mutex;
use tracing::{debug, info};

use lbstack_common::retry::{retry_with_backoff_when, RetryConfig};
use lbstack_common::Result;

use crate::cloud::{CloudApi, CloudError, SecurityGroupRule};

/// Prefix of the owner annotation carried in rule descriptions
pub const OWNER_ANNOTATION_PREFIX: &str = "lbstack:";

/// Annotation marking a rule as contributed by `owner`
pub fn owner_annotation(owner: &str) -> String {
    format!("{OWNER_ANNOTATION_PREFIX}{owner}")
}

/// Owner recorded on a rule, if it was contributed by this controller
pub fn owner_of(rule: &SecurityGroupRule) -> Option<&str> {
    rule.description.strip_prefix(OWNER_ANNOTATION_PREFIX)
}

/// Single writer for the rules of the cluster's shared backend security group
pub struct SharedSecurityGroupReconciler {
    cloud: Arc<dyn CloudApi>,
    group_id: String,
    lock: Mutex<()>,
    retry: RetryConfig,
}

impl SharedSecurityGroupReconciler {
    /// Reconciler for `group_id`
    pub fn new(cloud: Arc<dyn CloudApi>, group_id: impl Into<String>, retry: RetryConfig) -> Self {
        Self {
            cloud,
            group_id: group_id.into(),
            lock: Mutex::new(()),
            retry,
        }
    }

    /// The shared security group
    pub fn group_id(&self) -> &str {
        &self.group_id
    }

    async fn current_rules(&self) -> Result<Vec<SecurityGroupRule>> {
        retry_with_backoff_when(
            &self.retry,
            "list shared rules",
            || self.cloud.security_group_rules(&self.group_id),
            CloudError::is_retryable,
        )
        .await
        .map_err(|e| e.into_error("list", self.group_id.as_str()))
    }

    async fn authorize(&self, rules: &[SecurityGroupRule]) -> Result<()> {
        if rules.is_empty() {
            return Ok(());
        }
        retry_with_backoff_when(
            &self.retry,
            "authorize shared rules",
            || self.cloud.authorize_rules(&self.group_id, rules),
            CloudError::is_retryable,
        )
        .await
        .map_err(|e| e.into_error("authorize", self.group_id.as_str()))
    }

    async fn revoke(&self, rules: &[SecurityGroupRule]) -> Result<()> {
        if rules.is_empty() {
            return Ok(());
        }
        retry_with_backoff_when(
            &self.retry,
            "revoke shared rules",
            || self.cloud.revoke_rules(&self.group_id, rules),
            CloudError::is_retryable,
        )
        .await
        .map_err(|e| e.into_error("revoke", self.group_id.as_str()))
    }

    /// Make `owner`'s contribution exactly `desired`.
    ///
    /// Descriptions of `desired` are replaced with the owner annotation. Rules
    /// of other owners and unannotated rules are never touched.
    pub async fn reconcile(&self, owner: &str, desired: &[SecurityGroupRule]) -> Result<()> {
        let annotation = owner_annotation(owner);
        let desired: BTreeSet<SecurityGroupRule> = desired
            .iter()
            .map(|r| SecurityGroupRule {
                description: annotation.clone(),
                ..r.clone()
            })
            .collect();

        let _guard = self.lock.lock().await;
        let current = self.current_rules().await?;

        let missing: Vec<SecurityGroupRule> = desired
            .iter()
            .filter(|r| !current.contains(r))
            .cloned()
            .collect();
        let stale: Vec<SecurityGroupRule> = current
            .into_iter()
            .filter(|r| owner_of(r) == Some(owner) && !desired.contains(r))
            .collect();

        if missing.is_empty() && stale.is_empty() {
            return Ok(());
        }

        debug!(
            group = %self.group_id,
            owner,
            authorize = missing.len(),
            revoke = stale.len(),
            "Reconciling shared security group rules"
        );
        self.authorize(&missing).await?;
        self.revoke(&stale).await?;
        Ok(())
    }

    /// Remove every rule contributed by `owner`
    pub async fn cleanup(&self, owner: &str) -> Result<()> {
        self.reconcile(owner, &[]).await
    }

    /// Remove annotated rules whose owner is not in `live_owners`.
    ///
    /// Returns the number of rules revoked.
    pub async fn prune(&self, live_owners: &BTreeSet<String>) -> Result<usize> {
        let _guard = self.lock.lock().await;
        let orphaned: Vec<SecurityGroupRule> = self
            .current_rules()
            .await?
            .into_iter()
            .filter(|r| owner_of(r).is_some_and(|o| !live_owners.contains(o)))
            .collect();

        self.revoke(&orphaned).await?;
        if !orphaned.is_empty() {
            info!(group = %self.group_id, revoked = orphaned.len(), "Pruned orphaned shared rules");
        }
        Ok(orphaned.len())
    }
}
