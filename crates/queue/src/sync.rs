use std::sync::{Condvar, Mutex};
use std::time::{Duration, Instant};

/// Counting semaphore. Zone threads park on one of these between requests,
/// always with a bounded timeout so an idle consumer never trips a hung-task
/// watchdog.
pub struct Semaphore {
    count: Mutex<u64>,
    available: Condvar,
}

impl Semaphore {
    pub fn new(initial: u64) -> Self {
        Semaphore {
            count: Mutex::new(initial),
            available: Condvar::new(),
        }
    }

    /// Wait until a permit is available, then take it.
    pub fn acquire(&self) {
        let mut count = self.count.lock().unwrap();
        while *count == 0 {
            count = self.available.wait(count).unwrap();
        }
        *count -= 1;
    }

    /// Try to take a permit within `timeout`. A zero timeout polls without
    /// blocking.
    pub fn attempt(&self, timeout: Duration) -> bool {
        let mut count = self.count.lock().unwrap();
        if *count > 0 {
            *count -= 1;
            return true;
        }
        if timeout.is_zero() {
            return false;
        }
        let deadline = Instant::now() + timeout;
        loop {
            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            let (guard, result) = self.available.wait_timeout(count, deadline - now).unwrap();
            count = guard;
            if *count > 0 {
                *count -= 1;
                return true;
            }
            if result.timed_out() {
                return false;
            }
        }
    }

    pub fn release(&self) {
        let mut count = self.count.lock().unwrap();
        *count += 1;
        self.available.notify_one();
    }
}

/// Reusable rendezvous point: `enter` blocks until the configured number of
/// threads have arrived, then releases them all. Exactly one caller per
/// generation is told it was last through the door.
pub struct Barrier {
    state: Mutex<BarrierState>,
    all_present: Condvar,
    thread_count: usize,
}

struct BarrierState {
    waiting: usize,
    generation: u64,
}

impl Barrier {
    pub fn new(thread_count: usize) -> Self {
        Barrier {
            state: Mutex::new(BarrierState {
                waiting: 0,
                generation: 0,
            }),
            all_present: Condvar::new(),
            thread_count,
        }
    }

    /// Returns true for the thread that completed the rendezvous.
    pub fn enter(&self) -> bool {
        let mut state = self.state.lock().unwrap();
        state.waiting += 1;
        if state.waiting == self.thread_count {
            state.waiting = 0;
            state.generation += 1;
            self.all_present.notify_all();
            return true;
        }
        let generation = state.generation;
        while state.generation == generation {
            state = self.all_present.wait(state).unwrap();
        }
        false
    }
}
