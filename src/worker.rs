//! Long-lived worker pool consuming the job queue.

use std::sync::Arc;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::executor::Executor;
use crate::metrics;
use crate::queue::{Job, JobReceiver};

pub struct Worker {
    id: usize,
    executor: Arc<Executor>,
    jobs: JobReceiver,
    shutdown: watch::Receiver<bool>,
}

impl Worker {
    pub fn new(
        id: usize,
        executor: Arc<Executor>,
        jobs: JobReceiver,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        Self {
            id,
            executor,
            jobs,
            shutdown,
        }
    }

    pub fn spawn(self) -> JoinHandle<()> {
        tokio::spawn(self.run())
    }

    async fn run(mut self) {
        info!(worker_id = self.id, "worker started");
        loop {
            let job = tokio::select! {
                _ = self.shutdown.changed() => break,
                job = next_job(&self.jobs) => match job {
                    Some(job) => job,
                    // Queue closed; nothing more will arrive
                    None => break,
                },
            };

            metrics::global().active_workers.inc();
            self.process(job).await;
            metrics::global().active_workers.dec();
        }
        info!(worker_id = self.id, "worker stopping");
    }

    /// Run one job and write exactly one of its reply slots.
    async fn process(&self, job: Job) {
        debug!(worker_id = self.id, job_id = %job.id, language = %job.opts.language, "processing job");

        let started = Instant::now();
        let outcome = self.executor.execute(&job.opts, job.deadline).await;
        let duration_ms = started.elapsed().as_millis() as u64;

        let m = metrics::global();
        match outcome {
            Err(err) => {
                warn!(worker_id = self.id, job_id = %job.id, error = %err, "job failed");
                m.executions_total.inc(&[&job.opts.language, "error"]);
                // Send fails only when the submitter already gave up
                let _ = job.error_tx.send(err);
            }
            Ok(result) => {
                m.executions_total
                    .inc(&[&job.opts.language, result.status.as_str()]);
                m.execution_duration_ms
                    .observe(&[&job.opts.language, "total"], duration_ms);
                if result.memory_kb > 0 {
                    m.memory_usage_kb
                        .observe(&[&job.opts.language], result.memory_kb);
                }
                debug!(worker_id = self.id, job_id = %job.id, status = %result.status, "job finished");
                let _ = job.result_tx.send(result);
            }
        }
    }
}

async fn next_job(jobs: &JobReceiver) -> Option<Job> {
    jobs.lock().await.recv().await
}

/// Spawn a fixed pool of workers sharing one queue receiver.
pub fn spawn_pool(
    count: usize,
    executor: Arc<Executor>,
    jobs: JobReceiver,
    shutdown: watch::Receiver<bool>,
) -> Vec<JoinHandle<()>> {
    (0..count)
        .map(|id| Worker::new(id, executor.clone(), jobs.clone(), shutdown.clone()).spawn())
        .collect()
}
