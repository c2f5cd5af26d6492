//! Fixed-capacity read cache of volume pages. Shared by all zones; entries
//! are pinned for the duration of a lookup, at most one read of a given page
//! is in flight at a time, and eviction is approximate LRU over the unpinned
//! entries.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Condvar, Mutex};

use dedup_index_common::{Block, BlockStore, IndexError};
use tracing::trace;

struct Slot {
    page: u64,
    generation: u64,
    data: Arc<Block>,
    pins: u32,
    last_used: u64,
}

struct CacheState {
    slots: Vec<Option<Slot>>,
    by_page: HashMap<u64, usize>,
    in_flight: HashSet<u64>,
    clock: u64,
    hits: u64,
    misses: u64,
    wait_count: u64,
}

/// Guard for a cached page; the pin is dropped with it.
pub struct PinnedPage {
    cache: Arc<PageCacheInner>,
    page: u64,
    generation: u64,
    data: Arc<Block>,
}

impl PinnedPage {
    pub fn data(&self) -> &Block {
        &self.data
    }

    pub fn physical_page(&self) -> u64 {
        self.page
    }
}

impl Drop for PinnedPage {
    fn drop(&mut self) {
        let mut state = self.cache.state.lock().unwrap();
        if let Some(&slot) = state.by_page.get(&self.page) {
            if let Some(entry) = state.slots[slot].as_mut() {
                // A slot reinstalled after invalidation is a different pin
                // domain; only the matching generation may unpin it.
                if entry.generation == self.generation {
                    entry.pins = entry.pins.saturating_sub(1);
                }
            }
        }
    }
}

pub struct PageCacheInner {
    state: Mutex<CacheState>,
    read_finished: Condvar,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct PageCacheStats {
    pub hits: u64,
    pub misses: u64,
    pub wait_count: u64,
}

pub struct PageCache {
    inner: Arc<PageCacheInner>,
    capacity: usize,
}

impl PageCache {
    pub fn new(capacity: usize) -> Self {
        PageCache {
            inner: Arc::new(PageCacheInner {
                state: Mutex::new(CacheState {
                    slots: (0..capacity).map(|_| None).collect(),
                    by_page: HashMap::new(),
                    in_flight: HashSet::new(),
                    clock: 0,
                    hits: 0,
                    misses: 0,
                    wait_count: 0,
                }),
                read_finished: Condvar::new(),
            }),
            capacity,
        }
    }

    /// Fetch a page through the cache, pinning it for the caller. Concurrent
    /// requests for the same absent page wait for the single in-flight read.
    pub fn get(&self, store: &dyn BlockStore, page: u64) -> Result<PinnedPage, IndexError> {
        let mut state = self.inner.state.lock().unwrap();
        loop {
            if let Some(&slot) = state.by_page.get(&page) {
                state.clock += 1;
                let clock = state.clock;
                state.hits += 1;
                let entry = state.slots[slot].as_mut().unwrap();
                entry.pins += 1;
                entry.last_used = clock;
                return Ok(PinnedPage {
                    cache: Arc::clone(&self.inner),
                    page,
                    generation: entry.generation,
                    data: Arc::clone(&entry.data),
                });
            }
            if state.in_flight.contains(&page) {
                state.wait_count += 1;
                state = self.inner.read_finished.wait(state).unwrap();
                continue;
            }
            state.in_flight.insert(page);
            break;
        }
        drop(state);

        // Read without the lock held.
        let mut data = Box::new([0u8; dedup_index_common::BYTES_PER_BLOCK]);
        let result = store.read_block(page, &mut data);

        let mut state = self.inner.state.lock().unwrap();
        state.in_flight.remove(&page);
        self.inner.read_finished.notify_all();
        let data = match result {
            Ok(()) => Arc::new(*data),
            Err(e) => return Err(e),
        };

        state.misses += 1;
        state.clock += 1;
        let clock = state.clock;
        let slot = match self.pick_slot(&mut state) {
            Some(slot) => slot,
            None => {
                // Every slot pinned; serve the read without caching it.
                trace!(page, "page cache saturated, bypassing");
                return Ok(PinnedPage {
                    cache: Arc::clone(&self.inner),
                    page: u64::MAX, // unpin is a no-op for an uncached page
                    generation: 0,
                    data,
                });
            }
        };
        if let Some(old) = state.slots[slot].take() {
            state.by_page.remove(&old.page);
        }
        let generation = clock;
        state.by_page.insert(page, slot);
        state.slots[slot] = Some(Slot {
            page,
            generation,
            data: Arc::clone(&data),
            pins: 1,
            last_used: clock,
        });
        Ok(PinnedPage {
            cache: Arc::clone(&self.inner),
            page,
            generation,
            data,
        })
    }

    fn pick_slot(&self, state: &mut CacheState) -> Option<usize> {
        let mut victim: Option<(usize, u64)> = None;
        for (i, slot) in state.slots.iter().enumerate() {
            match slot {
                None => return Some(i),
                Some(entry) if entry.pins == 0 => {
                    if victim.map_or(true, |(_, used)| entry.last_used < used) {
                        victim = Some((i, entry.last_used));
                    }
                }
                Some(_) => {}
            }
        }
        victim.map(|(i, _)| i)
    }

    /// Drop all cached pages in `[first, first + count)`; called before a
    /// physical chapter is overwritten. Existing pins keep their (stale but
    /// consistent) copies alive.
    pub fn invalidate_range(&self, first: u64, count: u64) {
        let mut state = self.inner.state.lock().unwrap();
        let doomed: Vec<u64> = state
            .by_page
            .keys()
            .copied()
            .filter(|&p| p >= first && p < first + count)
            .collect();
        for page in doomed {
            if let Some(slot) = state.by_page.remove(&page) {
                state.slots[slot] = None;
            }
        }
    }

    pub fn stats(&self) -> PageCacheStats {
        let state = self.inner.state.lock().unwrap();
        PageCacheStats {
            hits: state.hits,
            misses: state.misses,
            wait_count: state.wait_count,
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}
