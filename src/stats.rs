//! Engine counters. Updated from the owning zone threads through atomics;
//! readers take a consistent snapshot by double-reading a sequence counter.

use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;

#[derive(Default)]
pub struct Stats {
    sequence: AtomicU64,
    posts_found: AtomicU64,
    posts_not_found: AtomicU64,
    queries_found: AtomicU64,
    queries_not_found: AtomicU64,
    updates_found: AtomicU64,
    updates_not_found: AtomicU64,
    deletions_found: AtomicU64,
    deletions_not_found: AtomicU64,
    requests: AtomicU64,
    entries_discarded: AtomicU64,
}

/// Point-in-time copy of the counters plus derived values.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
pub struct IndexStats {
    pub posts_found: u64,
    pub posts_not_found: u64,
    pub queries_found: u64,
    pub queries_not_found: u64,
    pub updates_found: u64,
    pub updates_not_found: u64,
    pub deletions_found: u64,
    pub deletions_not_found: u64,
    pub requests: u64,
    /// Records currently live in the index.
    pub entries_indexed: u64,
    pub entries_discarded: u64,
    pub collisions: u64,
    pub early_flushes: u64,
    pub memory_used: u64,
}

macro_rules! bump {
    ($name:ident) => {
        pub fn $name(&self) {
            self.sequence.fetch_add(1, Ordering::Release);
            self.$name.fetch_add(1, Ordering::Relaxed);
            self.sequence.fetch_add(1, Ordering::Release);
        }
    };
}

impl Stats {
    bump!(posts_found);
    bump!(posts_not_found);
    bump!(queries_found);
    bump!(queries_not_found);
    bump!(updates_found);
    bump!(updates_not_found);
    bump!(deletions_found);
    bump!(deletions_not_found);
    bump!(requests);
    bump!(entries_discarded);

    /// Snapshot of the request counters; retried while writers are mid
    /// update so the set is internally consistent.
    pub fn snapshot(&self) -> IndexStats {
        loop {
            let before = self.sequence.load(Ordering::Acquire);
            if before % 2 != 0 {
                std::hint::spin_loop();
                continue;
            }
            let stats = IndexStats {
                posts_found: self.posts_found.load(Ordering::Relaxed),
                posts_not_found: self.posts_not_found.load(Ordering::Relaxed),
                queries_found: self.queries_found.load(Ordering::Relaxed),
                queries_not_found: self.queries_not_found.load(Ordering::Relaxed),
                updates_found: self.updates_found.load(Ordering::Relaxed),
                updates_not_found: self.updates_not_found.load(Ordering::Relaxed),
                deletions_found: self.deletions_found.load(Ordering::Relaxed),
                deletions_not_found: self.deletions_not_found.load(Ordering::Relaxed),
                requests: self.requests.load(Ordering::Relaxed),
                entries_indexed: 0,
                entries_discarded: self.entries_discarded.load(Ordering::Relaxed),
                collisions: 0,
                early_flushes: 0,
                memory_used: 0,
            };
            if self.sequence.load(Ordering::Acquire) == before {
                return stats;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counters_accumulate() {
        let stats = Stats::default();
        stats.posts_found();
        stats.posts_found();
        stats.queries_not_found();
        stats.requests();
        let snap = stats.snapshot();
        assert_eq!(snap.posts_found, 2);
        assert_eq!(snap.queries_not_found, 1);
        assert_eq!(snap.requests, 1);
        assert_eq!(snap.deletions_found, 0);
    }
}
