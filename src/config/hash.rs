//! Stack fingerprinting for change detection.
//!
//! This module provides deterministic hashing of resolved stack
//! specifications so re-deploying an unchanged stack is a no-op.

use sha2::{Digest, Sha256};

use crate::stack::ResolvedStack;

/// Hasher for computing stack fingerprints.
#[derive(Debug, Default, Clone, Copy)]
pub struct StackHasher;

impl StackHasher {
    /// Creates a new stack hasher.
    #[must_use]
    pub const fn new() -> Self {
        Self
    }

    /// Computes the fingerprint of a resolved stack.
    ///
    /// The fingerprint covers everything the backend is handed: rendered
    /// resources, export expressions, resolved import values and the
    /// effective removal directive. Any upstream export change therefore
    /// changes the fingerprint of every consumer.
    #[must_use]
    pub fn fingerprint(&self, stack: &ResolvedStack) -> String {
        let mut hasher = Sha256::new();

        hasher.update(stack.id.as_bytes());

        // Resources keep declaration order; reordering them changes the fingerprint.
        for resource in &stack.resources {
            hasher.update(b"\0resource\0");
            hasher.update(resource.name.as_bytes());
            hasher.update(b"\0");
            hasher.update(resource.kind.as_bytes());
            hasher.update(b"\0");
            // Object keys serialize sorted, so this is canonical.
            hasher.update(serde_json::to_vec(&resource.properties).unwrap_or_default());
        }

        for (name, expression) in &stack.exports {
            hasher.update(b"\0export\0");
            hasher.update(name.as_bytes());
            hasher.update(b"=");
            hasher.update(expression.as_bytes());
        }

        for (name, value) in &stack.imports {
            hasher.update(b"\0import\0");
            hasher.update(name.as_bytes());
            hasher.update(b"=");
            hasher.update(value.as_bytes());
        }

        hasher.update(b"\0removal\0");
        hasher.update(stack.removal.to_string().as_bytes());

        hex::encode(hasher.finalize())
    }

    /// Computes a short hash (first 8 characters) for display purposes.
    #[must_use]
    pub fn short_hash(hash: &str) -> String {
        hash.chars().take(8).collect()
    }

    /// Compares two hashes to determine if they are equal.
    #[must_use]
    pub fn hashes_match(hash1: &str, hash2: &str) -> bool {
        if hash1.len() != hash2.len() {
            return false;
        }

        hash1
            .bytes()
            .zip(hash2.bytes())
            .fold(0u8, |acc, (a, b)| acc | (a ^ b))
            == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{Removal, ResourceSpec};
    use std::collections::BTreeMap;

    fn resolved(id: &str, bucket_arn: &str) -> ResolvedStack {
        let mut imports = BTreeMap::new();
        imports.insert(String::from("bucketArn"), bucket_arn.to_string());
        ResolvedStack {
            id: id.to_string(),
            resources: vec![ResourceSpec::new("tracker", "function")
                .with_property("memory", serde_json::json!(256))],
            exports: BTreeMap::new(),
            imports,
            removal: Removal::Delete,
        }
    }

    #[test]
    fn test_fingerprint_deterministic() {
        let hasher = StackHasher::new();
        let stack = resolved("Compute", "arn:bucket");
        assert_eq!(hasher.fingerprint(&stack), hasher.fingerprint(&stack));
        assert_eq!(hasher.fingerprint(&stack).len(), 64);
    }

    #[test]
    fn test_upstream_value_changes_fingerprint() {
        let hasher = StackHasher::new();
        let before = hasher.fingerprint(&resolved("Compute", "arn:bucket-1"));
        let after = hasher.fingerprint(&resolved("Compute", "arn:bucket-2"));
        assert_ne!(before, after);
    }

    #[test]
    fn test_removal_changes_fingerprint() {
        let hasher = StackHasher::new();
        let delete = resolved("Compute", "arn:bucket");
        let mut retain = delete.clone();
        retain.removal = Removal::Retain;
        assert_ne!(hasher.fingerprint(&delete), hasher.fingerprint(&retain));
    }

    #[test]
    fn test_short_hash() {
        let short = StackHasher::short_hash("abcdef1234567890abcdef1234567890");
        assert_eq!(short, "abcdef12");
    }

    #[test]
    fn test_hashes_match() {
        assert!(StackHasher::hashes_match("abc123", "abc123"));
        assert!(!StackHasher::hashes_match("abc123", "abc124"));
        assert!(!StackHasher::hashes_match("abc123", "abc12"));
    }
}
