//! The stack: one object's desired infrastructure as a dependency graph
//!
//! Nodes can only reference nodes that are already in the stack and whose
//! kind precedes theirs in [`ResourceKind::CREATION_ORDER`], so the graph is
//! acyclic by construction and per-kind convergence in creation order always
//! sees dependencies realized first.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use serde::{Deserialize, Serialize};
use tracing::debug;

use lbstack_common::{Error, Result};

use crate::resource::{Resolvable, ResourceKind, ResourceRef, ResourceSpec};
use crate::tags::OwnershipTags;

/// Stable identity of a stack: `<cluster>/<namespace>/<name>`
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct StackId {
    /// Cluster name prefix
    pub cluster: String,
    /// Namespace of the owning object
    pub namespace: String,
    /// Name of the owning object
    pub name: String,
}

impl StackId {
    /// Create a stack ID
    pub fn new(
        cluster: impl Into<String>,
        namespace: impl Into<String>,
        name: impl Into<String>,
    ) -> Self {
        Self {
            cluster: cluster.into(),
            namespace: namespace.into(),
            name: name.into(),
        }
    }
}

impl fmt::Display for StackId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}/{}", self.cluster, self.namespace, self.name)
    }
}

/// One rule this stack needs on the cluster-wide shared security group
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SharedRuleSpec {
    /// IP protocol ("tcp")
    pub protocol: String,
    /// Backend port to admit
    pub port: u16,
    /// Security group allowed in (usually this stack's managed group)
    pub source: Resolvable,
}

/// Dependency graph of resource nodes owned by one object
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Stack {
    id: StackId,
    tag_prefix: String,
    resources: BTreeMap<ResourceRef, ResourceSpec>,
    dependencies: BTreeMap<ResourceRef, BTreeSet<ResourceRef>>,
    shared_rules: BTreeSet<SharedRuleSpec>,
}

impl Stack {
    /// Create an empty stack. Deploying it tears down everything tagged with `id`.
    pub fn new(id: StackId, tag_prefix: impl Into<String>) -> Self {
        Self {
            id,
            tag_prefix: tag_prefix.into(),
            resources: BTreeMap::new(),
            dependencies: BTreeMap::new(),
            shared_rules: BTreeSet::new(),
        }
    }

    /// Stack identity
    pub fn id(&self) -> &StackId {
        &self.id
    }

    /// Tag prefix of the owning object kind
    pub fn tag_prefix(&self) -> &str {
        &self.tag_prefix
    }

    /// Tag schema used to discover this stack's live resources
    pub fn tags(&self) -> OwnershipTags {
        OwnershipTags::new(&self.tag_prefix)
    }

    /// Annotation identifying this stack's contributions to shared resources
    pub fn owner_key(&self) -> String {
        format!("{}/{}", self.tag_prefix, self.id)
    }

    /// Add a node under `logical_id`, recording an edge for every reference it holds.
    pub fn add(
        &mut self,
        logical_id: impl Into<String>,
        spec: ResourceSpec,
    ) -> Result<ResourceRef> {
        let reference = ResourceRef::new(spec.kind(), logical_id);
        if self.resources.contains_key(&reference) {
            return Err(Error::internal_with_context(
                "stack",
                format!("{} added twice to {}", reference, self.id),
            ));
        }

        let mut deps = BTreeSet::new();
        for dep in spec.references() {
            self.check_dependency(&reference, dep)?;
            deps.insert(dep.clone());
        }

        self.dependencies.insert(reference.clone(), deps);
        self.resources.insert(reference.clone(), spec);
        Ok(reference)
    }

    /// Declare that `dependent` must be created after `dependency`.
    pub fn add_dependency(
        &mut self,
        dependent: &ResourceRef,
        dependency: &ResourceRef,
    ) -> Result<()> {
        if !self.resources.contains_key(dependent) {
            return Err(Error::internal_with_context(
                "stack",
                format!("unknown dependent {}", dependent),
            ));
        }
        self.check_dependency(dependent, dependency)?;
        self.dependencies
            .entry(dependent.clone())
            .or_default()
            .insert(dependency.clone());
        Ok(())
    }

    fn check_dependency(&self, dependent: &ResourceRef, dependency: &ResourceRef) -> Result<()> {
        if !self.resources.contains_key(dependency) {
            return Err(Error::internal_with_context(
                "stack",
                format!("{} references {} which is not in the stack", dependent, dependency),
            ));
        }
        if dependency.kind >= dependent.kind {
            return Err(Error::internal_with_context(
                "stack",
                format!(
                    "{} cannot depend on {}: dependencies must precede in creation order",
                    dependent, dependency
                ),
            ));
        }
        Ok(())
    }

    /// Contribute a rule to the shared security group
    pub fn add_shared_rule(&mut self, rule: SharedRuleSpec) -> Result<()> {
        if let Some(source) = rule.source.reference() {
            if !self.resources.contains_key(source) {
                return Err(Error::internal_with_context(
                    "stack",
                    format!("shared rule source {} is not in the stack", source),
                ));
            }
        }
        self.shared_rules.insert(rule);
        Ok(())
    }

    /// Look up a node
    pub fn get(&self, reference: &ResourceRef) -> Option<&ResourceSpec> {
        self.resources.get(reference)
    }

    /// All nodes, ordered by kind then logical ID
    pub fn resources(&self) -> impl Iterator<Item = (&ResourceRef, &ResourceSpec)> {
        self.resources.iter()
    }

    /// Nodes of one kind
    pub fn resources_of(
        &self,
        kind: ResourceKind,
    ) -> impl Iterator<Item = (&ResourceRef, &ResourceSpec)> {
        self.resources.iter().filter(move |(r, _)| r.kind == kind)
    }

    /// Direct dependencies of a node
    pub fn dependencies_of(&self, reference: &ResourceRef) -> impl Iterator<Item = &ResourceRef> {
        self.dependencies.get(reference).into_iter().flatten()
    }

    /// Shared security-group contributions
    pub fn shared_rules(&self) -> impl Iterator<Item = &SharedRuleSpec> {
        self.shared_rules.iter()
    }

    /// Number of nodes
    pub fn len(&self) -> usize {
        self.resources.len()
    }

    /// Whether the desired set is empty (a teardown stack)
    pub fn is_empty(&self) -> bool {
        self.resources.is_empty() && self.shared_rules.is_empty()
    }

    /// Compute creation groups with Kahn's algorithm.
    ///
    /// Every node in group N has all its dependencies in groups 0..N.
    pub fn sequence(&self) -> StackSequence {
        let mut remaining: BTreeMap<&ResourceRef, usize> = self
            .resources
            .keys()
            .map(|r| (r, self.dependencies.get(r).map_or(0, BTreeSet::len)))
            .collect();

        let mut dependents: BTreeMap<&ResourceRef, Vec<&ResourceRef>> = BTreeMap::new();
        for (node, deps) in &self.dependencies {
            for dep in deps {
                dependents.entry(dep).or_default().push(node);
            }
        }

        let mut ready: BTreeSet<&ResourceRef> = remaining
            .iter()
            .filter(|(_, n)| **n == 0)
            .map(|(r, _)| *r)
            .collect();
        let mut groups = Vec::new();

        while !ready.is_empty() {
            let group: Vec<ResourceRef> = ready.iter().map(|r| (*r).clone()).collect();
            let mut next = BTreeSet::new();
            for node in std::mem::take(&mut ready) {
                for dependent in dependents.get(node).into_iter().flatten() {
                    if let Some(n) = remaining.get_mut(dependent) {
                        *n -= 1;
                        if *n == 0 {
                            next.insert(*dependent);
                        }
                    }
                }
            }
            groups.push(group);
            ready = next;
        }

        debug!(
            stack = %self.id,
            groups = groups.len(),
            resources = self.len(),
            "Computed stack sequence"
        );
        StackSequence { groups }
    }

    /// Serialize the stack for logging
    pub fn to_json(&self) -> Result<String> {
        let mut by_kind = serde_json::Map::new();
        for kind in ResourceKind::CREATION_ORDER {
            let nodes: serde_json::Map<String, serde_json::Value> = self
                .resources_of(kind)
                .map(|(r, spec)| -> Result<(String, serde_json::Value)> {
                    let deps: Vec<String> =
                        self.dependencies_of(r).map(ToString::to_string).collect();
                    let node = serde_json::json!({
                        "spec": serde_json::to_value(spec)?,
                        "dependsOn": deps,
                    });
                    Ok((r.id.clone(), node))
                })
                .collect::<Result<_>>()?;
            if !nodes.is_empty() {
                by_kind.insert(kind.to_string(), serde_json::Value::Object(nodes));
            }
        }

        let doc = serde_json::json!({
            "id": self.id.to_string(),
            "resources": by_kind,
            "sharedRules": serde_json::to_value(&self.shared_rules)?,
        });
        Ok(serde_json::to_string(&doc)?)
    }
}

/// Ordered creation groups of a stack
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StackSequence {
    groups: Vec<Vec<ResourceRef>>,
}

impl StackSequence {
    /// Groups in creation order
    pub fn groups(&self) -> &[Vec<ResourceRef>] {
        &self.groups
    }

    /// Dependencies before dependents
    pub fn creation_order(&self) -> Vec<ResourceRef> {
        self.groups.iter().flatten().cloned().collect()
    }

    /// Dependents before dependencies
    pub fn deletion_order(&self) -> Vec<ResourceRef> {
        self.groups.iter().rev().flatten().cloned().collect()
    }
}
