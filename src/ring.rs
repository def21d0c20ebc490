//! Consistent-hash ring used by `ProxyConsistent`.
//!
//! Each member is placed on a 64-bit ring at many virtual points; a key maps
//! to the member owning the first point at or after the key's hash. Adding or
//! removing one of `n` members moves roughly `1/n` of the keys, and only
//! to or from that member.
//!
//! Hashes come from SHA-256 truncated to 64 bits, so placement is stable
//! across processes and platforms.

use sha2::{Digest, Sha256};
use thiserror::Error;

/// Virtual points per member.
pub const DEFAULT_REPLICAS: usize = 160;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum RingError {
    #[error("empty hash ring")]
    Empty,
}

#[derive(Clone, Debug)]
pub struct HashRing {
    replicas: usize,
    members: Vec<String>,
    /// Sorted by hash; the index points into `members`.
    points: Vec<(u64, usize)>,
}

impl HashRing {
    pub fn new() -> Self {
        Self::with_replicas(DEFAULT_REPLICAS)
    }

    pub fn with_replicas(replicas: usize) -> Self {
        Self { replicas: replicas.max(1), members: Vec::new(), points: Vec::new() }
    }

    /// Inserts `member`. Inserting a member twice is not deduplicated.
    pub fn add(&mut self, member: impl Into<String>) {
        let idx = self.members.len();
        self.members.push(member.into());
        self.place(idx);
        self.points.sort_unstable();
    }

    /// Removes `member`; returns whether it was present.
    pub fn remove(&mut self, member: &str) -> bool {
        let Some(idx) = self.members.iter().position(|m| m == member) else {
            return false;
        };
        self.members.remove(idx);
        self.points.clear();
        for i in 0..self.members.len() {
            self.place(i);
        }
        self.points.sort_unstable();
        true
    }

    /// The member responsible for `key`.
    pub fn get(&self, key: &str) -> Result<&str, RingError> {
        if self.points.is_empty() {
            return Err(RingError::Empty);
        }
        let h = hash(key.as_bytes());
        let i = self.points.partition_point(|(p, _)| *p < h);
        let (_, idx) = self.points[i % self.points.len()];
        Ok(&self.members[idx])
    }

    pub fn members(&self) -> &[String] {
        &self.members
    }

    pub fn len(&self) -> usize {
        self.members.len()
    }

    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }

    fn place(&mut self, idx: usize) {
        for replica in 0..self.replicas {
            let point = hash(format!("{}#{replica}", self.members[idx]).as_bytes());
            self.points.push((point, idx));
        }
    }
}

impl Default for HashRing {
    fn default() -> Self { Self::new() }
}

fn hash(data: &[u8]) -> u64 {
    let digest = Sha256::digest(data);
    let mut head = [0u8; 8];
    head.copy_from_slice(&digest[..8]);
    u64::from_be_bytes(head)
}
