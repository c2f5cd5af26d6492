//! The session boundary: request submission, per-zone consumer threads,
//! flush/close/destroy lifecycle.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;

use dedup_index_common::{BlockStore, IndexConfig, IndexError};
use dedup_index_queue::{FunnelQueue, Semaphore};
use tracing::debug;

use crate::index::{Index, OpenMode};
use crate::request::Request;
use crate::stats::IndexStats;

/// Idle wait per poll cycle; short enough that a parked consumer never
/// resembles a hung task.
const IDLE_WAIT: Duration = Duration::from_millis(100);

struct ZoneWorker {
    queue: Arc<FunnelQueue<Request>>,
    doorbell: Arc<Semaphore>,
    handle: Option<JoinHandle<()>>,
}

struct InFlight {
    count: Mutex<u64>,
    drained: Condvar,
}

impl InFlight {
    fn add(&self) {
        *self.count.lock().unwrap() += 1;
    }

    fn finish(&self) {
        let mut count = self.count.lock().unwrap();
        *count -= 1;
        if *count == 0 {
            self.drained.notify_all();
        }
    }

    fn wait_empty(&self) {
        let mut count = self.count.lock().unwrap();
        while *count > 0 {
            count = self.drained.wait(count).unwrap();
        }
    }
}

struct OpenIndex {
    index: Arc<Index>,
    workers: Vec<ZoneWorker>,
    stop: Arc<AtomicBool>,
}

/// A client session. Owns at most one open index and the zone threads
/// serving it.
pub struct Session {
    state: Mutex<Option<OpenIndex>>,
    in_flight: Arc<InFlight>,
}

impl Session {
    pub fn create() -> Self {
        Session {
            state: Mutex::new(None),
            in_flight: Arc::new(InFlight {
                count: Mutex::new(0),
                drained: Condvar::new(),
            }),
        }
    }

    /// Open (or create) an index on `store`. `Create` formats; `Load` may
    /// rebuild; `NoRebuild` fails a dirty index with
    /// `IndexNotSavedCleanly`.
    pub fn open_index(
        &self,
        mode: OpenMode,
        config: &IndexConfig,
        store: Arc<dyn BlockStore>,
    ) -> Result<(), IndexError> {
        let mut state = self.state.lock().unwrap();
        if state.is_some() {
            return Err(IndexError::InvalidArgument("session already has an index"));
        }
        let index = Arc::new(match mode {
            OpenMode::Create => Index::create(store, config)?,
            OpenMode::Load | OpenMode::NoRebuild => Index::open(
                store,
                mode,
                Some(config.nonce),
                config.zone_count,
                true,
            )?,
        });

        let stop = Arc::new(AtomicBool::new(false));
        let workers = (0..index.zone_count())
            .map(|zone| spawn_zone_worker(zone, Arc::clone(&index), Arc::clone(&stop), &self.in_flight))
            .collect();
        *state = Some(OpenIndex {
            index,
            workers,
            stop,
        });
        Ok(())
    }

    /// Queue a request; its callback runs on the owning zone's thread.
    pub fn start_operation(&self, request: Request) -> Result<(), IndexError> {
        let state = self.state.lock().unwrap();
        let open = state.as_ref().ok_or(IndexError::Disabled)?;
        let zone = open.index.zone_for_name(&request.name);
        self.in_flight.add();
        open.workers[zone].queue.put(request);
        open.workers[zone].doorbell.release();
        Ok(())
    }

    /// Block until every previously submitted request's callback has
    /// returned.
    pub fn flush(&self) {
        self.in_flight.wait_empty();
    }

    /// Flush, stop the zone threads, and write a clean save.
    pub fn close_index(&self) -> Result<(), IndexError> {
        self.flush();
        let open = {
            let mut state = self.state.lock().unwrap();
            state.take()
        };
        let Some(mut open) = open else {
            return Ok(());
        };
        stop_workers(&mut open);
        let result = open.index.save();
        debug!("index closed");
        result
    }

    /// Tear the session down. Queued requests that never ran complete with
    /// `Disabled`; no resources survive the call.
    pub fn destroy(self) {
        let open = {
            let mut state = self.state.lock().unwrap();
            state.take()
        };
        if let Some(mut open) = open {
            stop_workers(&mut open);
        }
        // Any requests drained by the stopping workers have completed their
        // callbacks with Disabled; the in-flight count is now zero.
    }

    pub fn stats(&self) -> Result<IndexStats, IndexError> {
        let state = self.state.lock().unwrap();
        let open = state.as_ref().ok_or(IndexError::Disabled)?;
        Ok(open.index.stats())
    }

    pub fn parameters(&self) -> Result<IndexConfig, IndexError> {
        let state = self.state.lock().unwrap();
        let open = state.as_ref().ok_or(IndexError::Disabled)?;
        Ok(open.index.config().clone())
    }

    /// Direct access for embedders and tests.
    pub fn index(&self) -> Result<Arc<Index>, IndexError> {
        let state = self.state.lock().unwrap();
        let open = state.as_ref().ok_or(IndexError::Disabled)?;
        Ok(Arc::clone(&open.index))
    }
}

impl Default for Session {
    fn default() -> Self {
        Self::create()
    }
}

fn spawn_zone_worker(
    zone: usize,
    index: Arc<Index>,
    stop: Arc<AtomicBool>,
    in_flight: &Arc<InFlight>,
) -> ZoneWorker {
    let queue = Arc::new(FunnelQueue::<Request>::new());
    let doorbell = Arc::new(Semaphore::new(0));
    let worker_queue = Arc::clone(&queue);
    let worker_doorbell = Arc::clone(&doorbell);
    let in_flight = Arc::clone(in_flight);

    let handle = std::thread::Builder::new()
        .name(format!("index-zone-{zone}"))
        .spawn(move || loop {
            while let Some(mut request) = worker_queue.poll() {
                if stop.load(Ordering::SeqCst) {
                    request.status = Err(IndexError::Disabled);
                } else {
                    request.status = index.serve(&mut request);
                }
                if let Some(callback) = request.callback.take() {
                    callback(request);
                }
                // Flush waits on this count, so it must drop only after the
                // callback has returned.
                in_flight.finish();
            }
            if stop.load(Ordering::SeqCst) && worker_queue.is_empty() {
                break;
            }
            worker_doorbell.attempt(IDLE_WAIT);
        })
        .expect("spawn zone thread");

    ZoneWorker {
        queue,
        doorbell,
        handle: Some(handle),
    }
}

fn stop_workers(open: &mut OpenIndex) {
    open.stop.store(true, Ordering::SeqCst);
    for worker in &open.workers {
        worker.doorbell.release();
    }
    for worker in &mut open.workers {
        if let Some(handle) = worker.handle.take() {
            let _ = handle.join();
        }
    }
}
