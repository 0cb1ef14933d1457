use std::sync::atomic::{AtomicUsize, Ordering};

use serde::Deserialize;
use thiserror::Error;
use xxhash_rust::xxh3::xxh3_64;

/// No candidate instance is registered for a worker.
///
/// Transient: callers refresh the topology and retry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("routing unavailable: no candidates registered")]
pub struct RoutingUnavailable;

/// Configured selector policy for a worker kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SelectorKind {
    PinnedFirst,
    Hash,
    RoundRobin,
}

/// Chooses which candidate owns a key.
#[derive(Debug)]
pub enum Selector {
    /// Always the first candidate.
    PinnedFirst,
    /// `xxh3(key) mod n`. Stable across calls and across nodes.
    Hash,
    /// Monotonic counter mod n. No key affinity.
    RoundRobin(AtomicUsize),
}

impl Selector {
    pub fn new(kind: SelectorKind) -> Self {
        match kind {
            SelectorKind::PinnedFirst => Self::PinnedFirst,
            SelectorKind::Hash => Self::Hash,
            SelectorKind::RoundRobin => Self::RoundRobin(AtomicUsize::new(0)),
        }
    }

    pub fn kind(&self) -> SelectorKind {
        match self {
            Self::PinnedFirst => SelectorKind::PinnedFirst,
            Self::Hash => SelectorKind::Hash,
            Self::RoundRobin(_) => SelectorKind::RoundRobin,
        }
    }

    /// Returns the index of the owning candidate among `candidates`.
    ///
    /// A missing key hashes as the empty byte string.
    pub fn select(
        &self,
        key: Option<&[u8]>,
        candidates: usize,
    ) -> Result<usize, RoutingUnavailable> {
        if candidates == 0 {
            return Err(RoutingUnavailable);
        }

        let index = match self {
            Self::PinnedFirst => 0,
            Self::Hash => {
                let hash = xxh3_64(key.unwrap_or_default());
                (hash % candidates as u64) as usize
            }
            Self::RoundRobin(counter) => counter.fetch_add(1, Ordering::Relaxed) % candidates,
        };

        Ok(index)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_zero_candidates_is_unavailable() {
        for kind in [SelectorKind::PinnedFirst, SelectorKind::Hash, SelectorKind::RoundRobin] {
            assert_eq!(
                Selector::new(kind).select(Some(b"k".as_slice()), 0),
                Err(RoutingUnavailable)
            );
        }
    }

    #[test]
    fn test_pinned_first_ignores_key() {
        let selector = Selector::new(SelectorKind::PinnedFirst);
        assert_eq!(selector.select(Some(b"a".as_slice()), 5), Ok(0));
        assert_eq!(selector.select(Some(b"zzz".as_slice()), 5), Ok(0));
        assert_eq!(selector.select(None, 5), Ok(0));
    }

    #[test]
    fn test_hash_is_stable_and_in_range() {
        let selector = Selector::new(SelectorKind::Hash);
        let first = selector.select(Some(b"100:A".as_slice()), 3).expect("select");
        assert!(first < 3);
        for _ in 0..100 {
            assert_eq!(selector.select(Some(b"100:A".as_slice()), 3), Ok(first));
        }
        // Separate instances agree, which is what cross-node routing relies on.
        assert_eq!(
            Selector::new(SelectorKind::Hash).select(Some(b"100:A".as_slice()), 3),
            Ok(first)
        );
    }

    #[test]
    fn test_hash_spreads_keys() {
        let selector = Selector::new(SelectorKind::Hash);
        let mut seen = [0usize; 4];
        for i in 0..1000 {
            let key = format!("100:svc-{i}");
            let idx = selector.select(Some(key.as_bytes()), 4).expect("select");
            seen[idx] += 1;
        }
        assert!(seen.iter().all(|&n| n > 100), "skewed distribution: {seen:?}");
    }

    #[test]
    fn test_hash_none_key_matches_empty() {
        let selector = Selector::new(SelectorKind::Hash);
        assert_eq!(selector.select(None, 7), selector.select(Some(b"".as_slice()), 7));
    }

    #[test]
    fn test_round_robin_cycles() {
        let selector = Selector::new(SelectorKind::RoundRobin);
        let picks: Vec<usize> = (0..6)
            .map(|_| selector.select(None, 3).expect("select"))
            .collect();
        assert_eq!(picks, vec![0, 1, 2, 0, 1, 2]);
    }
}
