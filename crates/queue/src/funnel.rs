use std::ptr;
use std::sync::atomic::{AtomicPtr, Ordering};

use crossbeam_utils::CachePadded;

struct Node<T> {
    next: AtomicPtr<Node<T>>,
    value: Option<T>,
}

/// Lock-free multi-producer, single-consumer FIFO.
///
/// Producers publish with a single atomic exchange of `newest` and then link
/// the previous tail, so `put` never blocks and never fails. The consumer
/// walks `oldest`; a tail whose link is not yet visible makes `poll` return
/// `None` rather than wait, with the guarantee that an entry is seen by the
/// first poll that starts after its producer's `put` returned.
///
/// `poll`, `is_empty` and `drain` may only be called from one consumer
/// thread at a time; producers may call `put` from anywhere.
pub struct FunnelQueue<T> {
    newest: CachePadded<AtomicPtr<Node<T>>>,
    oldest: CachePadded<AtomicPtr<Node<T>>>,
    stub: *mut Node<T>,
}

unsafe impl<T: Send> Send for FunnelQueue<T> {}
unsafe impl<T: Send> Sync for FunnelQueue<T> {}

impl<T> FunnelQueue<T> {
    pub fn new() -> Self {
        let stub = Box::into_raw(Box::new(Node {
            next: AtomicPtr::new(ptr::null_mut()),
            value: None,
        }));
        FunnelQueue {
            newest: CachePadded::new(AtomicPtr::new(stub)),
            oldest: CachePadded::new(AtomicPtr::new(stub)),
            stub,
        }
    }

    /// Append an entry. Safe from any number of concurrent producers.
    pub fn put(&self, value: T) {
        let node = Box::into_raw(Box::new(Node {
            next: AtomicPtr::new(ptr::null_mut()),
            value: Some(value),
        }));
        self.link(node);
    }

    fn link(&self, node: *mut Node<T>) {
        // Publication point: after the swap the node is reachable from
        // `newest` even though the predecessor link may lag briefly.
        let prev = self.newest.swap(node, Ordering::AcqRel);
        unsafe {
            (*prev).next.store(node, Ordering::Release);
        }
    }

    /// Remove and return the oldest entry, or `None` when the queue is
    /// observably empty. Single consumer only.
    pub fn poll(&self) -> Option<T> {
        unsafe {
            let mut oldest = self.oldest.load(Ordering::Relaxed);
            let mut next = (*oldest).next.load(Ordering::Acquire);

            if oldest == self.stub {
                // Skip over the stub to the first real entry.
                if next.is_null() {
                    return None;
                }
                self.oldest.store(next, Ordering::Relaxed);
                oldest = next;
                next = (*oldest).next.load(Ordering::Acquire);
            }

            if !next.is_null() {
                self.oldest.store(next, Ordering::Relaxed);
                return Box::from_raw(oldest).value;
            }

            // `oldest` is the apparent tail. If a producer swapped `newest`
            // but has not linked yet, report empty; the entry surfaces on a
            // later poll.
            if oldest != self.newest.load(Ordering::Acquire) {
                return None;
            }

            // Re-append the stub so the tail entry gains a successor, then
            // take the tail.
            (*self.stub).next.store(ptr::null_mut(), Ordering::Relaxed);
            self.link(self.stub);

            next = (*oldest).next.load(Ordering::Acquire);
            if next.is_null() {
                return None;
            }
            self.oldest.store(next, Ordering::Relaxed);
            Box::from_raw(oldest).value
        }
    }

    /// Conservative emptiness check: true only when no entry is reachable.
    /// Single consumer only.
    pub fn is_empty(&self) -> bool {
        let oldest = self.oldest.load(Ordering::Relaxed);
        unsafe {
            oldest == self.stub
                && (*oldest).next.load(Ordering::Acquire).is_null()
                && self.newest.load(Ordering::Acquire) == self.stub
        }
    }

}

impl<T> Default for FunnelQueue<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Drop for FunnelQueue<T> {
    fn drop(&mut self) {
        while self.poll().is_some() {}
        unsafe {
            drop(Box::from_raw(self.stub));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn test_empty_poll() {
        let queue: FunnelQueue<u64> = FunnelQueue::new();
        assert!(queue.is_empty());
        assert_eq!(queue.poll(), None);
        assert_eq!(queue.poll(), None);
    }

    #[test]
    fn test_single_producer_fifo() {
        let queue = FunnelQueue::new();
        for i in 0..1000u64 {
            queue.put(i);
        }
        assert!(!queue.is_empty());
        for i in 0..1000u64 {
            assert_eq!(queue.poll(), Some(i));
        }
        assert_eq!(queue.poll(), None);
        assert!(queue.is_empty());
    }

    #[test]
    fn test_interleaved_put_poll() {
        let queue = FunnelQueue::new();
        queue.put(1u64);
        assert_eq!(queue.poll(), Some(1));
        queue.put(2);
        queue.put(3);
        assert_eq!(queue.poll(), Some(2));
        queue.put(4);
        assert_eq!(queue.poll(), Some(3));
        assert_eq!(queue.poll(), Some(4));
        assert_eq!(queue.poll(), None);
    }

    #[test]
    fn test_multi_producer_counts() {
        const PRODUCERS: usize = 10;
        const ITERATIONS: u64 = 200_000;

        let queue = Arc::new(FunnelQueue::new());
        let handles: Vec<_> = (0..PRODUCERS)
            .map(|_| {
                let queue = Arc::clone(&queue);
                thread::spawn(move || {
                    for i in 0..ITERATIONS {
                        queue.put(i);
                    }
                })
            })
            .collect();

        let mut seen = vec![0u32; ITERATIONS as usize];
        let mut total = 0u64;
        while total < (PRODUCERS as u64) * ITERATIONS {
            if let Some(value) = queue.poll() {
                seen[value as usize] += 1;
                total += 1;
            } else {
                thread::yield_now();
            }
        }
        for handle in handles {
            handle.join().unwrap();
        }

        assert_eq!(queue.poll(), None);
        assert!(seen.iter().all(|&count| count == PRODUCERS as u32));
    }

    #[test]
    fn test_drop_frees_pending_entries() {
        let queue = FunnelQueue::new();
        for i in 0..100 {
            queue.put(Box::new(i));
        }
        drop(queue); // miri/asan would flag leaks here
    }
}
