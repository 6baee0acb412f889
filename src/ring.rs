//! Consistent-hash ring mapping keys to cluster members.
//!
//! Each member occupies `replicas` positions, hashed from `"<member>:<index>"`.
//! A key belongs to the member owning the first position at or after the key's
//! own hash, wrapping to the lowest position past the end of the ring.

use sha2::{Digest, Sha256};
use std::collections::{BTreeSet, HashMap};

/// Virtual positions per member unless configured otherwise
pub const DEFAULT_REPLICAS: usize = 256;

/// Ring position of an arbitrary key: the first 128 bits of its SHA-256 digest
pub fn position_hash(key: &str) -> u128 {
    let digest = Sha256::digest(key.as_bytes());
    let mut bytes = [0u8; 16];
    bytes.copy_from_slice(&digest[..16]);
    u128::from_be_bytes(bytes)
}

#[derive(Debug, Clone)]
pub struct HashRing {
    replicas: usize,
    /// Always sorted ascending, one entry per key of `owners`
    positions: Vec<u128>,
    owners: HashMap<u128, String>,
}

impl HashRing {
    pub fn new(replicas: usize) -> Self {
        Self {
            replicas: replicas.max(1),
            positions: Vec::new(),
            owners: HashMap::new(),
        }
    }

    pub fn with_members<I, S>(members: I, replicas: usize) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut ring = Self::new(replicas);
        for member in members {
            ring.insert_positions(member.as_ref());
        }
        ring.rebuild();
        ring
    }

    pub fn replicas(&self) -> usize {
        self.replicas
    }

    /// Place all of `id`'s positions on the ring. Adding a present member is a no-op.
    pub fn add_member(&mut self, id: &str) {
        if self.contains(id) {
            return;
        }
        self.insert_positions(id);
        self.rebuild();
    }

    /// Take every position owned by `id` off the ring. Returns whether it was a member.
    pub fn remove_member(&mut self, id: &str) -> bool {
        let before = self.owners.len();
        self.owners.retain(|_, owner| owner != id);
        if self.owners.len() == before {
            return false;
        }
        self.rebuild();
        true
    }

    /// Member owning `key`, or `None` on an empty ring
    pub fn lookup(&self, key: &str) -> Option<&str> {
        if self.positions.is_empty() {
            return None;
        }
        let hash = position_hash(key);
        let mut index = self.positions.partition_point(|&position| position < hash);
        if index == self.positions.len() {
            index = 0;
        }
        self.owners
            .get(&self.positions[index])
            .map(String::as_str)
    }

    pub fn contains(&self, id: &str) -> bool {
        self.owners.values().any(|owner| owner == id)
    }

    /// Distinct members, sorted
    pub fn members(&self) -> Vec<String> {
        self.owners
            .values()
            .cloned()
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect()
    }

    pub fn member_count(&self) -> usize {
        self.owners.values().collect::<BTreeSet<_>>().len()
    }

    /// Total number of positions on the ring
    pub fn len(&self) -> usize {
        self.positions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.positions.is_empty()
    }

    fn insert_positions(&mut self, id: &str) {
        for replica in 0..self.replicas {
            let position = position_hash(&format!("{}:{}", id, replica));
            // A 128-bit collision keeps the earlier owner.
            self.owners.entry(position).or_insert_with(|| id.to_string());
        }
    }

    fn rebuild(&mut self) {
        self.positions = self.owners.keys().copied().collect();
        self.positions.sort_unstable();
    }
}

impl Default for HashRing {
    fn default() -> Self {
        Self::new(DEFAULT_REPLICAS)
    }
}
