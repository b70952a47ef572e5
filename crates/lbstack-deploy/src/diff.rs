//! Desired-versus-actual diff for one resource kind

use std::collections::{BTreeMap, BTreeSet};

use tracing::debug;

use lbstack_common::Error;
use lbstack_model::{OwnershipTags, ReferenceTable, ResourceRef, ResourceSpec, StackId, Tags};

use crate::cloud::LiveResource;

/// A resource to create
#[derive(Debug, Clone, PartialEq)]
pub struct PlannedCreate {
    /// Node being created
    pub reference: ResourceRef,
    /// Resolved attribute document
    pub attributes: serde_json::Value,
    /// Ownership tags
    pub tags: Tags,
}

/// A live resource whose attributes or tags drifted
#[derive(Debug, Clone, PartialEq)]
pub struct PlannedUpdate {
    /// Node being updated
    pub reference: ResourceRef,
    /// Cloud identifier of the live resource
    pub cloud_id: String,
    /// Resolved attribute document
    pub attributes: serde_json::Value,
    /// Ownership tags
    pub tags: Tags,
}

/// Work needed to converge one kind
#[derive(Debug, Default)]
pub struct ChangeSet {
    /// Desired nodes with no live counterpart
    pub create: Vec<PlannedCreate>,
    /// Matched pairs with drift
    pub update: Vec<PlannedUpdate>,
    /// Live resources with no desired counterpart, including duplicates
    pub delete: Vec<LiveResource>,
    /// Matched pairs already in the desired state
    pub unchanged: Vec<(ResourceRef, LiveResource)>,
    /// Desired nodes whose references could not be resolved
    pub unresolvable: Vec<Error>,
}

impl ChangeSet {
    /// Whether converging requires no mutating call
    pub fn is_empty(&self) -> bool {
        self.create.is_empty() && self.update.is_empty() && self.delete.is_empty()
    }
}

/// Diff desired nodes of one kind against the live resources discovered for it.
///
/// Live resources are matched by the logical ID in their ownership tags. When
/// several share a logical ID, the one with the lowest cloud ID is kept and
/// the others are deleted, as are live resources carrying no logical ID.
pub fn compute_changes<'a>(
    desired: impl IntoIterator<Item = (&'a ResourceRef, &'a ResourceSpec)>,
    actual: Vec<LiveResource>,
    refs: &ReferenceTable,
    tags: &OwnershipTags,
    stack: &StackId,
) -> ChangeSet {
    let mut changes = ChangeSet::default();

    let mut actual = actual;
    actual.sort_by(|a, b| a.cloud_id.cmp(&b.cloud_id));
    let mut by_logical: BTreeMap<String, LiveResource> = BTreeMap::new();
    for live in actual {
        match tags.logical_id_of(&live.tags).map(str::to_string) {
            Some(id) if !by_logical.contains_key(&id) => {
                by_logical.insert(id, live);
            }
            Some(id) => {
                debug!(
                    stack = %stack,
                    logical_id = %id,
                    cloud_id = %live.cloud_id,
                    "Duplicate live resource"
                );
                changes.delete.push(live);
            }
            None => changes.delete.push(live),
        }
    }

    let mut matched = BTreeSet::new();
    for (reference, spec) in desired {
        let live = by_logical.get(&reference.id);
        if live.is_some() {
            matched.insert(reference.id.clone());
        }

        let attributes = match spec.resolve(refs).and_then(|s| s.to_attributes()) {
            Ok(a) => a,
            Err(e) => {
                changes.unresolvable.push(e);
                continue;
            }
        };
        let desired_tags = tags.for_resource(stack, &reference.id);

        match live {
            None => changes.create.push(PlannedCreate {
                reference: reference.clone(),
                attributes,
                tags: desired_tags,
            }),
            Some(live) if live.attributes != attributes || live.tags != desired_tags => {
                changes.update.push(PlannedUpdate {
                    reference: reference.clone(),
                    cloud_id: live.cloud_id.clone(),
                    attributes,
                    tags: desired_tags,
                })
            }
            Some(live) => changes.unchanged.push((reference.clone(), live.clone())),
        }
    }

    changes.delete.extend(
        by_logical
            .into_iter()
            .filter(|(id, _)| !matched.contains(id))
            .map(|(_, live)| live),
    );
    changes
}
