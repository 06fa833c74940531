use std::hash::Hasher;

use xxhash_rust::xxh3::Xxh3;

use crate::common::types::{Labels, METRIC_NAME_LABEL};

const SEP: &[u8] = b"\xff";

/// Fingerprints a label set. Labels are iterated in sorted order, so two
/// equal sets always hash identically regardless of construction order.
pub fn hash_labels(labels: &Labels) -> u64 {
    let mut hasher = Xxh3::with_seed(0);
    for label in labels.iter() {
        hasher.write(label.name.as_bytes());
        hasher.write(SEP);
        hasher.write(label.value.as_bytes());
        hasher.write(SEP);
    }
    hasher.digest()
}

/// Fingerprints a label set with `__name__` dropped, to be consistent with
/// Prometheus alert identity.
pub fn hash_labels_without_metric_name(labels: &Labels) -> u64 {
    let mut hasher = Xxh3::with_seed(0);
    for label in labels.iter().filter(|l| l.name != METRIC_NAME_LABEL) {
        hasher.write(label.name.as_bytes());
        hasher.write(SEP);
        hasher.write(label.value.as_bytes());
        hasher.write(SEP);
    }
    hasher.digest()
}

/// Stable hash over a sequence of strings, used for group identity and the
/// per-group evaluation phase. Must never depend on process state.
pub fn stable_hash(parts: &[&str]) -> u64 {
    let mut hasher = Xxh3::with_seed(0);
    for part in parts {
        hasher.write(part.as_bytes());
        hasher.write(SEP);
    }
    hasher.digest()
}
