//! In-memory infrastructure
//!
//! [`InMemoryCloud`] implements [`CloudApi`] over a process-local map. It is
//! the backend the controller binary runs against when no provider is wired
//! in, and the fixture the deploy tests assert against: it counts every
//! mutating call, keeps a journal of calls in the order they completed, can
//! inject faults for a chosen operation/kind/logical ID, and can add latency
//! to every call.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use tracing::trace;

use lbstack_model::{ResourceKind, Tags};

use crate::cloud::{CloudApi, CloudError, LiveResource, SecurityGroupRule};

/// Infrastructure API call, as recorded in the journal and matched by faults
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Operation {
    /// Tag-filtered discovery
    List,
    /// Resource creation
    Create,
    /// In-place update
    Update,
    /// Resource deletion
    Delete,
    /// Security group rule authorization
    Authorize,
    /// Security group rule revocation
    Revoke,
}

/// One completed mutating call
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JournalEntry {
    /// Call type
    pub operation: Operation,
    /// Resource type, absent for rule calls
    pub kind: Option<ResourceKind>,
    /// Cloud identifier of the resource or security group
    pub cloud_id: String,
    /// Logical ID from the ownership tags, when present
    pub logical_id: Option<String>,
}

#[derive(Debug)]
struct Fault {
    operation: Operation,
    kind: Option<ResourceKind>,
    logical_id: Option<String>,
    error: CloudError,
    remaining: u32,
}

impl Fault {
    fn matches(
        &self,
        operation: Operation,
        kind: Option<ResourceKind>,
        logical_id: Option<&str>,
    ) -> bool {
        self.remaining > 0
            && self.operation == operation
            && (self.kind.is_none() || self.kind == kind)
            && self
                .logical_id
                .as_deref()
                .map_or(true, |want| Some(want) == logical_id)
    }
}

#[derive(Debug, Default)]
struct Counters {
    lists: AtomicU64,
    creates: AtomicU64,
    updates: AtomicU64,
    deletes: AtomicU64,
    authorizes: AtomicU64,
    revokes: AtomicU64,
}

/// Process-local implementation of [`CloudApi`]
#[derive(Debug, Default)]
pub struct InMemoryCloud {
    resources: DashMap<String, LiveResource>,
    rules: DashMap<String, Vec<SecurityGroupRule>>,
    next_id: AtomicU64,
    counters: Counters,
    journal: Mutex<Vec<JournalEntry>>,
    faults: Mutex<Vec<Fault>>,
    latency: Option<Duration>,
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

fn id_prefix(kind: ResourceKind) -> &'static str {
    match kind {
        ResourceKind::SecurityGroup => "sg",
        ResourceKind::LoadBalancer => "lb",
        ResourceKind::TargetGroup => "tg",
        ResourceKind::Listener => "lsn",
        ResourceKind::ListenerRule => "rule",
        ResourceKind::TargetGroupBinding => "tgb",
    }
}

/// Logical ID carried by any kind's `<prefix>/resource` tag
fn logical_id(tags: &Tags) -> Option<&str> {
    tags.iter()
        .find(|(k, _)| k.ends_with("/resource"))
        .map(|(_, v)| v.as_str())
}

impl InMemoryCloud {
    /// Empty infrastructure with no latency
    pub fn new() -> Self {
        Self::default()
    }

    /// Delay every call by `latency`
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = Some(latency);
        self
    }

    /// Fail the next `times` calls matching `operation`, `kind` and `logical_id`.
    ///
    /// `None` for `kind` or `logical_id` matches any value.
    pub fn inject_fault(
        &self,
        operation: Operation,
        kind: Option<ResourceKind>,
        logical_id: Option<&str>,
        error: CloudError,
        times: u32,
    ) {
        lock(&self.faults).push(Fault {
            operation,
            kind,
            logical_id: logical_id.map(str::to_string),
            error,
            remaining: times,
        });
    }

    /// Drop every pending fault
    pub fn clear_faults(&self) {
        lock(&self.faults).clear();
    }

    fn take_fault(
        &self,
        operation: Operation,
        kind: Option<ResourceKind>,
        logical_id: Option<&str>,
    ) -> Result<(), CloudError> {
        let mut faults = lock(&self.faults);
        match faults.iter_mut().find(|f| f.matches(operation, kind, logical_id)) {
            Some(fault) => {
                fault.remaining -= 1;
                Err(fault.error.clone())
            }
            None => Ok(()),
        }
    }

    async fn delay(&self) {
        if let Some(latency) = self.latency {
            tokio::time::sleep(latency).await;
        }
    }

    fn record(
        &self,
        operation: Operation,
        kind: Option<ResourceKind>,
        cloud_id: &str,
        logical_id: Option<&str>,
    ) {
        trace!(?operation, ?kind, cloud_id, "Recorded cloud call");
        lock(&self.journal).push(JournalEntry {
            operation,
            kind,
            cloud_id: cloud_id.to_string(),
            logical_id: logical_id.map(str::to_string),
        });
    }

    fn allocate_id(&self, kind: ResourceKind) -> (u64, String) {
        let n = self.next_id.fetch_add(1, Ordering::SeqCst) + 1;
        (n, format!("{}-{:08x}", id_prefix(kind), n))
    }

    /// Number of create, update, delete, authorize and revoke calls that succeeded
    pub fn mutations(&self) -> u64 {
        self.creates() + self.updates() + self.deletes() + self.authorizes() + self.revokes()
    }

    /// Successful creates
    pub fn creates(&self) -> u64 {
        self.counters.creates.load(Ordering::SeqCst)
    }

    /// Successful updates
    pub fn updates(&self) -> u64 {
        self.counters.updates.load(Ordering::SeqCst)
    }

    /// Successful deletes
    pub fn deletes(&self) -> u64 {
        self.counters.deletes.load(Ordering::SeqCst)
    }

    /// Successful rule authorizations
    pub fn authorizes(&self) -> u64 {
        self.counters.authorizes.load(Ordering::SeqCst)
    }

    /// Successful rule revocations
    pub fn revokes(&self) -> u64 {
        self.counters.revokes.load(Ordering::SeqCst)
    }

    /// Discovery calls
    pub fn lists(&self) -> u64 {
        self.counters.lists.load(Ordering::SeqCst)
    }

    /// Zero every counter and clear the journal
    pub fn reset_counters(&self) {
        for c in [
            &self.counters.lists,
            &self.counters.creates,
            &self.counters.updates,
            &self.counters.deletes,
            &self.counters.authorizes,
            &self.counters.revokes,
        ] {
            c.store(0, Ordering::SeqCst);
        }
        lock(&self.journal).clear();
    }

    /// Mutating calls in completion order
    pub fn journal(&self) -> Vec<JournalEntry> {
        lock(&self.journal).clone()
    }

    /// Every live resource, ordered by cloud ID
    pub fn snapshot(&self) -> Vec<LiveResource> {
        let mut all: Vec<LiveResource> = self.resources.iter().map(|r| r.value().clone()).collect();
        all.sort_by(|a, b| a.cloud_id.cmp(&b.cloud_id));
        all
    }

    /// Live resources of one kind, ordered by cloud ID
    pub fn resources_of(&self, kind: ResourceKind) -> Vec<LiveResource> {
        self.snapshot().into_iter().filter(|r| r.kind == kind).collect()
    }

    /// Look up one live resource
    pub fn get(&self, cloud_id: &str) -> Option<LiveResource> {
        self.resources.get(cloud_id).map(|r| r.value().clone())
    }

    /// Number of live resources
    pub fn len(&self) -> usize {
        self.resources.len()
    }

    /// Whether nothing exists
    pub fn is_empty(&self) -> bool {
        self.resources.is_empty()
    }

    /// Current rules of a security group, sorted
    pub fn rules_of(&self, group_id: &str) -> Vec<SecurityGroupRule> {
        let mut rules = self.rules.get(group_id).map(|r| r.value().clone()).unwrap_or_default();
        rules.sort();
        rules
    }

    /// Overwrite a live resource's attributes without going through the API, simulating drift
    pub fn tamper(&self, cloud_id: &str, attributes: serde_json::Value) -> bool {
        match self.resources.get_mut(cloud_id) {
            Some(mut r) => {
                r.attributes = attributes;
                true
            }
            None => false,
        }
    }
}

#[async_trait]
impl CloudApi for InMemoryCloud {
    async fn list_tagged(
        &self,
        kind: ResourceKind,
        filter: &Tags,
    ) -> Result<Vec<LiveResource>, CloudError> {
        self.delay().await;
        self.take_fault(Operation::List, Some(kind), None)?;
        self.counters.lists.fetch_add(1, Ordering::SeqCst);

        let mut found: Vec<LiveResource> = self
            .resources
            .iter()
            .filter(|r| r.kind == kind && filter.iter().all(|(k, v)| r.tags.get(k) == Some(v)))
            .map(|r| r.value().clone())
            .collect();
        found.sort_by(|a, b| a.cloud_id.cmp(&b.cloud_id));
        Ok(found)
    }

    async fn create(
        &self,
        kind: ResourceKind,
        attributes: &serde_json::Value,
        tags: &Tags,
    ) -> Result<LiveResource, CloudError> {
        self.delay().await;
        let logical = logical_id(tags);
        self.take_fault(Operation::Create, Some(kind), logical)?;

        let (n, cloud_id) = self.allocate_id(kind);
        let dns_name = (kind == ResourceKind::LoadBalancer).then(|| {
            let name = attributes.get("name").and_then(serde_json::Value::as_str).unwrap_or("lb");
            format!("{name}-{n}.elb.lbstack.local")
        });
        let live = LiveResource {
            kind,
            cloud_id: cloud_id.clone(),
            tags: tags.clone(),
            attributes: attributes.clone(),
            dns_name,
        };
        self.resources.insert(cloud_id.clone(), live.clone());
        self.counters.creates.fetch_add(1, Ordering::SeqCst);
        self.record(Operation::Create, Some(kind), &cloud_id, logical);
        Ok(live)
    }

    async fn update(
        &self,
        kind: ResourceKind,
        cloud_id: &str,
        attributes: &serde_json::Value,
        tags: &Tags,
    ) -> Result<LiveResource, CloudError> {
        self.delay().await;
        let logical = logical_id(tags);
        self.take_fault(Operation::Update, Some(kind), logical)?;

        let live = {
            let mut entry = self
                .resources
                .get_mut(cloud_id)
                .filter(|r| r.kind == kind)
                .ok_or_else(|| CloudError::NotFound(cloud_id.to_string()))?;
            entry.attributes = attributes.clone();
            entry.tags = tags.clone();
            entry.value().clone()
        };
        self.counters.updates.fetch_add(1, Ordering::SeqCst);
        self.record(Operation::Update, Some(kind), cloud_id, logical);
        Ok(live)
    }

    async fn delete(&self, kind: ResourceKind, cloud_id: &str) -> Result<(), CloudError> {
        self.delay().await;
        let existing = self
            .get(cloud_id)
            .filter(|r| r.kind == kind)
            .ok_or_else(|| CloudError::NotFound(cloud_id.to_string()))?;
        let logical = logical_id(&existing.tags).map(str::to_string);
        self.take_fault(Operation::Delete, Some(kind), logical.as_deref())?;

        if let Some(dependent) = self
            .resources
            .iter()
            .find(|r| r.cloud_id != cloud_id && r.references(cloud_id))
        {
            return Err(CloudError::InUse(
                cloud_id.to_string(),
                format!("referenced by {}", dependent.cloud_id),
            ));
        }

        self.resources.remove(cloud_id);
        self.counters.deletes.fetch_add(1, Ordering::SeqCst);
        self.record(Operation::Delete, Some(kind), cloud_id, logical.as_deref());
        Ok(())
    }

    async fn security_group_rules(
        &self,
        group_id: &str,
    ) -> Result<Vec<SecurityGroupRule>, CloudError> {
        self.delay().await;
        self.take_fault(Operation::List, None, None)?;
        Ok(self.rules_of(group_id))
    }

    async fn authorize_rules(
        &self,
        group_id: &str,
        rules: &[SecurityGroupRule],
    ) -> Result<(), CloudError> {
        self.delay().await;
        self.take_fault(Operation::Authorize, None, None)?;
        {
            let mut current = self.rules.entry(group_id.to_string()).or_default();
            for rule in rules {
                if !current.contains(rule) {
                    current.push(rule.clone());
                }
            }
        }
        self.counters.authorizes.fetch_add(1, Ordering::SeqCst);
        self.record(Operation::Authorize, None, group_id, None);
        Ok(())
    }

    async fn revoke_rules(
        &self,
        group_id: &str,
        rules: &[SecurityGroupRule],
    ) -> Result<(), CloudError> {
        self.delay().await;
        self.take_fault(Operation::Revoke, None, None)?;
        if let Some(mut current) = self.rules.get_mut(group_id) {
            current.retain(|r| !rules.contains(r));
        }
        self.counters.revokes.fetch_add(1, Ordering::SeqCst);
        self.record(Operation::Revoke, None, group_id, None);
        Ok(())
    }
}
