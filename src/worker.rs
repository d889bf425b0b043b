//! Worker pool used for everything that may block, allocate or take a mutex
//! on behalf of a fence callback.
//!
//! Two lanes are provided: the unbound lane (`queue_work`) for heavy jobs such
//! as CPU copies and page-table programming, and the irq-work lane
//! (`queue_irq_work`) for short, latency-sensitive completions.

use crate::error::{VmaError, VmaResult};
use crossbeam_channel::{Receiver, Sender, unbounded};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

pub type Job = Box<dyn FnOnce() + Send + 'static>;

#[derive(Debug, Default)]
struct PoolCounters {
    queued: AtomicU64,
    completed: AtomicU64,
    irq_queued: AtomicU64,
}

pub struct WorkerPool {
    work_tx: Option<Sender<Job>>,
    irq_tx: Option<Sender<Job>>,
    threads: Vec<JoinHandle<()>>,
    counters: Arc<PoolCounters>,
}

impl std::fmt::Debug for WorkerPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerPool")
            .field("threads", &self.threads.len())
            .field("counters", &self.counters)
            .finish()
    }
}

impl WorkerPool {
    /// Spawns `num_workers` unbound workers (at least one) plus one irq-work thread.
    ///
    /// # Errors
    /// `AllocationFailure` if a thread cannot be spawned.
    pub fn new(num_workers: usize) -> VmaResult<Self> {
        let (work_tx, work_rx) = unbounded::<Job>();
        let (irq_tx, irq_rx) = unbounded::<Job>();
        let counters = Arc::new(PoolCounters::default());

        let mut threads = Vec::with_capacity(num_workers.max(1) + 1);
        for id in 0..num_workers.max(1) {
            let rx = work_rx.clone();
            let counters = counters.clone();
            threads.push(spawn_lane(format!("gem-vma-wq/{id}"), rx, counters)?);
        }
        threads.push(spawn_lane("gem-vma-irq".to_string(), irq_rx, counters.clone())?);

        Ok(Self {
            work_tx: Some(work_tx),
            irq_tx: Some(irq_tx),
            threads,
            counters,
        })
    }

    /// Queue a job that may block or allocate.
    pub fn queue_work(&self, job: Job) {
        self.counters.queued.fetch_add(1, Ordering::Relaxed);
        Self::send(self.work_tx.as_ref(), job);
    }

    /// Queue a short job that must not block.
    pub fn queue_irq_work(&self, job: Job) {
        self.counters.irq_queued.fetch_add(1, Ordering::Relaxed);
        Self::send(self.irq_tx.as_ref(), job);
    }

    fn send(tx: Option<&Sender<Job>>, job: Job) {
        match tx {
            Some(tx) => {
                if let Err(err) = tx.send(job) {
                    // Receivers only disappear during teardown; run the job here
                    // so that no fence is left unsignalled.
                    log::warn!("worker pool is shutting down, running job inline");
                    (err.into_inner())();
                }
            }
            None => job(),
        }
    }

    #[must_use]
    pub fn completed(&self) -> u64 {
        self.counters.completed.load(Ordering::Relaxed)
    }
}

fn spawn_lane(
    name: String,
    rx: Receiver<Job>,
    counters: Arc<PoolCounters>,
) -> VmaResult<JoinHandle<()>> {
    thread::Builder::new()
        .name(name)
        .spawn(move || {
            while let Ok(job) = rx.recv() {
                job();
                counters.completed.fetch_add(1, Ordering::Relaxed);
            }
        })
        .map_err(|e| VmaError::AllocationFailure(format!("worker thread: {e}")))
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        // Dropping the senders lets every lane drain its queue and exit.
        self.work_tx.take();
        self.irq_tx.take();
        let current = thread::current().id();
        for handle in self.threads.drain(..) {
            // A job holding the last reference to the pool must not join itself.
            if handle.thread().id() == current {
                continue;
            }
            if handle.join().is_err() {
                log::warn!("worker thread panicked during shutdown");
            }
        }
    }
}
