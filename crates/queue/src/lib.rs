//! Request-dispatch plumbing: a lock-free multi-producer single-consumer
//! queue plus the counting semaphore and barrier the zone threads park on.

pub mod funnel;
pub mod sync;

pub use funnel::FunnelQueue;
pub use sync::{Barrier, Semaphore};
