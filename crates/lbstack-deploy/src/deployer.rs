//! Stack deployer
//!
//! A deploy is a pure re-diff of desired against discovered state, so it
//! keeps no progress of its own: a deploy that failed halfway is finished by
//! the next one, and a deploy with nothing to do performs no mutating call.
//!
//! The forward pass walks kinds in creation order. For each kind it lists the
//! live resources carrying the stack's ownership tags, publishes the realized
//! attributes of everything that already matches, then fans out creates and
//! updates. Deletes are held back until every kind has been created or
//! updated, then run in reverse creation order so a dependent is always gone
//! before the resource it points at.

use std::collections::BTreeMap;
use std::future::Future;
use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use lbstack_common::retry::{retry_with_backoff_when, RetryConfig};
use lbstack_common::{Error, Result, SERVICE_TAG_PREFIX};
use lbstack_model::{ReferenceTable, Realized, ResourceKind, ResourceRef, Stack, StackId};

use crate::cloud::{CloudApi, CloudError, LiveResource, SecurityGroupRule};
use crate::diff::{compute_changes, PlannedCreate, PlannedUpdate};
use crate::fanout::{TaskGroup, DEFAULT_CONCURRENCY};
use crate::shared::SharedSecurityGroupReconciler;

/// What a successful deploy did
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeployReport {
    /// The deployed stack
    pub stack: StackId,
    /// Nodes created
    pub created: Vec<ResourceRef>,
    /// Nodes updated in place
    pub updated: Vec<ResourceRef>,
    /// Cloud IDs of live resources deleted
    pub deleted: Vec<String>,
    /// Nodes already in the desired state
    pub unchanged: Vec<ResourceRef>,
    /// Realized attributes of every desired node
    pub realized: BTreeMap<ResourceRef, Realized>,
}

impl DeployReport {
    fn new(stack: StackId) -> Self {
        Self {
            stack,
            created: Vec::new(),
            updated: Vec::new(),
            deleted: Vec::new(),
            unchanged: Vec::new(),
            realized: BTreeMap::new(),
        }
    }

    /// Number of create, update and delete calls made
    pub fn mutations(&self) -> usize {
        self.created.len() + self.updated.len() + self.deleted.len()
    }

    /// DNS name of a realized node
    pub fn dns_name(&self, reference: &ResourceRef) -> Option<&str> {
        self.realized.get(reference).and_then(|r| r.dns_name.as_deref())
    }
}

/// Converges stacks against a [`CloudApi`]
pub struct StackDeployer {
    cloud: Arc<dyn CloudApi>,
    shared: Option<Arc<SharedSecurityGroupReconciler>>,
    retry: RetryConfig,
    fanout: TaskGroup,
}

impl StackDeployer {
    /// Deployer with the default converge retry bound and fan-out
    pub fn new(cloud: Arc<dyn CloudApi>) -> Self {
        Self {
            cloud,
            shared: None,
            retry: RetryConfig::converge(),
            fanout: TaskGroup::new(DEFAULT_CONCURRENCY),
        }
    }

    /// Route shared rule contributions through `shared`
    pub fn with_shared_security_group(
        mut self,
        shared: Arc<SharedSecurityGroupReconciler>,
    ) -> Self {
        self.shared = Some(shared);
        self
    }

    /// Retry bound for each infrastructure call
    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    /// Maximum concurrent calls within one kind
    pub fn with_concurrency(mut self, limit: usize) -> Self {
        self.fanout = TaskGroup::new(limit);
        self
    }

    /// The shared security group reconciler, if configured
    pub fn shared(&self) -> Option<&Arc<SharedSecurityGroupReconciler>> {
        self.shared.as_ref()
    }

    /// One infrastructure call with in-place retry, abandoned on cancellation
    async fn call<T, F, Fut>(
        &self,
        cancel: &CancellationToken,
        operation: &str,
        resource: &str,
        f: F,
    ) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = std::result::Result<T, CloudError>>,
    {
        let name = format!("{operation} {resource}");
        tokio::select! {
            _ = cancel.cancelled() => Err(Error::Cancelled),
            res = retry_with_backoff_when(&self.retry, &name, f, CloudError::is_retryable) => {
                res.map_err(|e| e.into_error(operation, resource))
            }
        }
    }

    async fn create(
        &self,
        cancel: &CancellationToken,
        plan: PlannedCreate,
    ) -> Result<(ResourceRef, LiveResource)> {
        let resource = plan.reference.to_string();
        let live = self
            .call(cancel, "create", &resource, || {
                self.cloud.create(plan.reference.kind, &plan.attributes, &plan.tags)
            })
            .await?;
        debug!(resource = %resource, cloud_id = %live.cloud_id, "Created resource");
        Ok((plan.reference, live))
    }

    async fn update(
        &self,
        cancel: &CancellationToken,
        plan: PlannedUpdate,
    ) -> Result<(ResourceRef, LiveResource)> {
        let resource = plan.reference.to_string();
        let live = self
            .call(cancel, "update", &resource, || {
                self.cloud
                    .update(plan.reference.kind, &plan.cloud_id, &plan.attributes, &plan.tags)
            })
            .await?;
        debug!(resource = %resource, cloud_id = %live.cloud_id, "Updated resource");
        Ok((plan.reference, live))
    }

    async fn delete(
        &self,
        cancel: &CancellationToken,
        target: LiveResource,
        survivors: &BTreeMap<String, LiveResource>,
    ) -> Result<String> {
        if let Some(dependent) = survivors
            .values()
            .find(|s| s.cloud_id != target.cloud_id && s.references(&target.cloud_id))
        {
            return Err(Error::DependencyInUse {
                resource: format!("{}/{}", target.kind, target.cloud_id),
                dependent: format!("{}/{}", dependent.kind, dependent.cloud_id),
            });
        }

        let resource = format!("{}/{}", target.kind, target.cloud_id);
        let cloud = &self.cloud;
        let kind = target.kind;
        let cloud_id = target.cloud_id.as_str();
        self.call(cancel, "delete", &resource, || async move {
            match cloud.delete(kind, cloud_id).await {
                Err(e) if e.is_not_found() => Ok(()),
                other => other,
            }
        })
        .await?;
        debug!(resource = %resource, "Deleted resource");
        Ok(target.cloud_id)
    }

    /// Converge `stack` and return what changed.
    ///
    /// Fails with [`Error::Deploy`] carrying every failure collected. No
    /// resource is deleted if any create, update or shared rule step failed.
    pub async fn deploy(&self, stack: &Stack, cancel: &CancellationToken) -> Result<DeployReport> {
        let id = stack.id().clone();
        let schema = stack.tags();
        let filter = schema.filter(&id);
        let refs = ReferenceTable::new();
        let mut report = DeployReport::new(id.clone());
        let mut failures: Vec<Error> = Vec::new();
        let mut live_index: BTreeMap<String, LiveResource> = BTreeMap::new();
        let mut deletes: BTreeMap<ResourceKind, Vec<LiveResource>> = BTreeMap::new();

        let sequence = stack.sequence();
        if sequence.creation_order().len() != stack.len() {
            return Err(Error::internal_with_context(
                "deployer",
                format!("{} has a dependency cycle", id),
            ));
        }
        debug!(stack = %id, groups = sequence.groups().len(), "Ordered stack");

        if tracing::enabled!(tracing::Level::DEBUG) {
            match stack.to_json() {
                Ok(json) => debug!(stack = %id, desired = %json, "Deploying stack"),
                Err(e) => warn!(stack = %id, error = %e, "Failed to serialize stack"),
            }
        }

        for kind in ResourceKind::CREATION_ORDER {
            if cancel.is_cancelled() {
                return Err(Error::Cancelled);
            }

            let actual = match self
                .call(cancel, "list", kind.as_str(), || self.cloud.list_tagged(kind, &filter))
                .await
            {
                Ok(actual) => actual,
                Err(e) => {
                    failures.push(e);
                    break;
                }
            };
            live_index.extend(actual.iter().map(|l| (l.cloud_id.clone(), l.clone())));

            let changes = compute_changes(stack.resources_of(kind), actual, &refs, &schema, &id);
            debug!(
                stack = %id,
                kind = %kind,
                create = changes.create.len(),
                update = changes.update.len(),
                delete = changes.delete.len(),
                unchanged = changes.unchanged.len(),
                "Computed changes"
            );

            for (reference, live) in changes.unchanged {
                Self::publish(&refs, &mut report, reference.clone(), &live)?;
                report.unchanged.push(reference);
            }
            failures.extend(changes.unresolvable);

            let created = self
                .fanout
                .run(changes.create.into_iter().map(|plan| self.create(cancel, plan)))
                .await;
            for (reference, live) in created.succeeded {
                Self::publish(&refs, &mut report, reference.clone(), &live)?;
                live_index.insert(live.cloud_id.clone(), live);
                report.created.push(reference);
            }
            failures.extend(created.failed);

            let updated = self
                .fanout
                .run(changes.update.into_iter().map(|plan| self.update(cancel, plan)))
                .await;
            for (reference, live) in updated.succeeded {
                Self::publish(&refs, &mut report, reference.clone(), &live)?;
                live_index.insert(live.cloud_id.clone(), live);
                report.updated.push(reference);
            }
            failures.extend(updated.failed);

            if !changes.delete.is_empty() {
                deletes.insert(kind, changes.delete);
            }
        }

        if failures.is_empty() {
            if let Err(e) = self.converge_shared_rules(stack, &refs, cancel).await {
                failures.push(e);
            }
        }

        if !failures.is_empty() {
            return Err(self.fail(&id, failures));
        }

        for kind in ResourceKind::CREATION_ORDER.iter().rev() {
            let Some(targets) = deletes.remove(kind) else {
                continue;
            };
            if cancel.is_cancelled() {
                return Err(Error::Cancelled);
            }

            let deleted = {
                let survivors = &live_index;
                self.fanout
                    .run(targets.into_iter().map(|t| self.delete(cancel, t, survivors)))
                    .await
            };
            for cloud_id in deleted.succeeded {
                live_index.remove(&cloud_id);
                report.deleted.push(cloud_id);
            }
            if !deleted.failed.is_empty() {
                return Err(self.fail(&id, deleted.failed));
            }
        }

        info!(
            stack = %id,
            created = report.created.len(),
            updated = report.updated.len(),
            deleted = report.deleted.len(),
            unchanged = report.unchanged.len(),
            "Deployed stack"
        );
        Ok(report)
    }

    fn publish(
        refs: &ReferenceTable,
        report: &mut DeployReport,
        reference: ResourceRef,
        live: &LiveResource,
    ) -> Result<()> {
        let realized = live.realized();
        refs.publish(reference.clone(), realized.clone())?;
        report.realized.insert(reference, realized);
        Ok(())
    }

    fn fail(&self, id: &StackId, failures: Vec<Error>) -> Error {
        warn!(stack = %id, failures = failures.len(), "Deploy failed");
        Error::Deploy {
            stack: id.to_string(),
            failures,
        }
    }

    async fn converge_shared_rules(
        &self,
        stack: &Stack,
        refs: &ReferenceTable,
        cancel: &CancellationToken,
    ) -> Result<()> {
        // Service stacks never contribute rules, so they stay off the shared lock
        if stack.tag_prefix() == SERVICE_TAG_PREFIX && stack.shared_rules().next().is_none() {
            return Ok(());
        }

        let owner = stack.owner_key();
        let rules: Vec<SecurityGroupRule> = stack
            .shared_rules()
            .map(|r| {
                Ok(SecurityGroupRule {
                    protocol: r.protocol.clone(),
                    from_port: r.port,
                    to_port: r.port,
                    source: match r.source.resolved(refs)? {
                        lbstack_model::Resolvable::Literal(id) => id,
                        lbstack_model::Resolvable::Ref(pending) => {
                            return Err(Error::unresolved(pending.to_string()))
                        }
                    },
                    description: String::new(),
                })
            })
            .collect::<Result<_>>()?;

        let Some(shared) = &self.shared else {
            if rules.is_empty() {
                return Ok(());
            }
            return Err(Error::internal_with_context(
                "deployer",
                format!(
                    "{} contributes shared rules but no shared security group is configured",
                    stack.id()
                ),
            ));
        };

        tokio::select! {
            _ = cancel.cancelled() => Err(Error::Cancelled),
            res = shared.reconcile(&owner, &rules) => res,
        }
    }
}
