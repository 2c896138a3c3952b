//! Seen-set of content fingerprints

use crate::types::ContentUnit;
use sha2::{Digest, Sha256};
use std::collections::HashSet;
use std::sync::Arc;
use tokio::sync::Mutex;

/// Deduplicator shared between the pipeline and its concurrent runs
pub type SharedDeduplicator = Arc<Mutex<Deduplicator>>;

/// Hash of the first `prefix_chars` characters of a unit's text.
///
/// Two units whose texts agree on that prefix share a fingerprint even if
/// they differ later.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Fingerprint(String);

impl Fingerprint {
    pub fn of(text: &str, prefix_chars: usize) -> Self {
        let prefix: String = text.chars().take(prefix_chars).collect();
        Self(compute_hash(&prefix))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Classification {
    /// Fingerprint was absent and has now been recorded
    New,
    /// Fingerprint was already recorded
    Seen,
}

/// Process-lifetime set of fingerprints. Grows without bound and is never
/// pruned.
#[derive(Debug)]
pub struct Deduplicator {
    seen: HashSet<Fingerprint>,
    prefix_chars: usize,
}

impl Deduplicator {
    pub fn new(prefix_chars: usize) -> Self {
        Self {
            seen: HashSet::new(),
            prefix_chars,
        }
    }

    pub fn with_defaults() -> Self {
        Self::new(200)
    }

    pub fn shared(self) -> SharedDeduplicator {
        Arc::new(Mutex::new(self))
    }

    pub fn fingerprint(&self, unit: &ContentUnit) -> Fingerprint {
        Fingerprint::of(&unit.text, self.prefix_chars)
    }

    /// Check and record in one step
    pub fn classify(&mut self, unit: &ContentUnit) -> Classification {
        if self.seen.insert(self.fingerprint(unit)) {
            Classification::New
        } else {
            Classification::Seen
        }
    }

    pub fn contains(&self, unit: &ContentUnit) -> bool {
        self.seen.contains(&self.fingerprint(unit))
    }

    /// Get dedup stats
    pub fn stats(&self) -> DedupStats {
        DedupStats {
            fingerprints: self.seen.len(),
            prefix_chars: self.prefix_chars,
        }
    }
}

#[derive(Debug, Clone)]
pub struct DedupStats {
    pub fingerprints: usize,
    pub prefix_chars: usize,
}

/// Compute SHA-256 hash of content
pub fn compute_hash(content: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(content.as_bytes());
    format!("{:x}", hasher.finalize())
}
