//! Bounded FIFO job queue.
//!
//! Jobs carry their own reply slots: one-shot result and error channels that
//! the processing worker writes exactly once, plus the deadline the whole
//! pipeline honors. `submit` awaiting on a full queue is the backpressure
//! signal; the front-end bounds that wait with the job's own deadline.

use std::sync::Arc;

use tokio::sync::{mpsc, oneshot, Mutex};
use tokio::time::Instant;

use crate::executor::{ExecuteError, ExecuteOptions, ExecutionResult};
use crate::metrics;

pub struct Job {
    pub id: String,
    pub opts: ExecuteOptions,
    pub deadline: Instant,
    pub result_tx: oneshot::Sender<ExecutionResult>,
    pub error_tx: oneshot::Sender<ExecuteError>,
}

#[derive(Debug, thiserror::Error)]
#[error("job queue is closed")]
pub struct QueueClosed;

/// Shared receive side; workers take turns pulling one job at a time, which
/// preserves FIFO dequeue order across the pool.
pub type JobReceiver = Arc<Mutex<mpsc::Receiver<Job>>>;

#[derive(Clone)]
pub struct JobQueue {
    tx: mpsc::Sender<Job>,
}

impl JobQueue {
    pub fn new(capacity: usize) -> (Self, JobReceiver) {
        let (tx, rx) = mpsc::channel(capacity);
        (Self { tx }, Arc::new(Mutex::new(rx)))
    }

    /// Enqueue a job, waiting while the queue is full.
    pub async fn submit(&self, job: Job) -> Result<(), QueueClosed> {
        self.tx.send(job).await.map_err(|_| QueueClosed)?;
        metrics::global().queue_depth.set(self.depth() as u64);
        Ok(())
    }

    /// Number of jobs currently queued.
    pub fn depth(&self) -> usize {
        self.tx.max_capacity() - self.tx.capacity()
    }
}
