//! Deterministic infrastructure names
//!
//! Names are capped at 32 characters and carry a digest of the stack ID and
//! the attributes that force replacement, so two stacks never collide and the
//! same input always yields the same name.

use sha2::{Digest, Sha256};

use crate::resource::{Protocol, TargetType};
use crate::stack::StackId;

const MAX_NAME_LEN: usize = 32;
const HASH_LEN: usize = 10;
const SEGMENT_LEN: usize = 8;

fn digest(parts: &[&str]) -> String {
    let mut hasher = Sha256::new();
    for part in parts {
        hasher.update(part.as_bytes());
        hasher.update([0u8]);
    }
    hasher
        .finalize()
        .iter()
        .map(|b| format!("{b:02x}"))
        .collect::<String>()[..HASH_LEN]
        .to_string()
}

fn segment(s: &str) -> String {
    s.chars()
        .map(|c| if c.is_ascii_alphanumeric() { c } else { '-' })
        .take(SEGMENT_LEN)
        .collect::<String>()
        .trim_matches('-')
        .to_string()
}

fn compose(a: &str, b: &str, hash: &str) -> String {
    let name = format!("k8s-{}-{}-{}", segment(a), segment(b), hash);
    name.chars().take(MAX_NAME_LEN).collect()
}

/// Name of a stack's load balancer.
///
/// `tag_prefix` is part of the digest, so a Service and an Ingress sharing a
/// namespace and name still get different names.
pub(crate) fn load_balancer_name(tag_prefix: &str, stack: &StackId, scheme: &str) -> String {
    let hash = digest(&[tag_prefix, &stack.to_string(), scheme]);
    compose(&stack.namespace, &stack.name, &hash)
}

/// Name of a stack's managed security group
pub(crate) fn security_group_name(tag_prefix: &str, stack: &StackId) -> String {
    let hash = digest(&[tag_prefix, &stack.to_string(), "sg"]);
    compose(&stack.namespace, &stack.name, &hash)
}

/// Name of a target group
pub(crate) fn target_group_name(
    tag_prefix: &str,
    stack: &StackId,
    service: &str,
    logical_id: &str,
    port: u16,
    protocol: Protocol,
    target_type: TargetType,
) -> String {
    let hash = digest(&[
        tag_prefix,
        &stack.to_string(),
        logical_id,
        &port.to_string(),
        &protocol.to_string(),
        &target_type.to_string(),
    ]);
    compose(&stack.namespace, service, &hash)
}
