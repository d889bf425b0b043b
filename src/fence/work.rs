use super::{DepKind, DependencySet, Fence};
use crate::error::{VmaError, VmaResult};
use crate::worker::WorkerPool;
use std::sync::Arc;

/// A deferred job gated by a dependency chain that publishes its own fence.
///
/// The job always runs on the worker pool, never in the signalling context
/// of its dependencies, and receives the outcome of the chain so it can
/// decide whether to do its work or just release its resources.
#[derive(Debug)]
pub struct FenceWork {
    fence: Fence,
    chain: DependencySet,
}

impl FenceWork {
    #[must_use]
    pub fn new(name: &'static str) -> Self {
        Self {
            fence: Fence::new(name),
            chain: DependencySet::new(),
        }
    }

    /// The fence signalled once the job has run.
    #[must_use]
    pub fn fence(&self) -> &Fence {
        &self.fence
    }

    /// Makes the job wait for `dep`.
    ///
    /// # Errors
    /// Returns the error of `dep` if it has already failed.
    pub fn chain(&mut self, dep: Option<&Fence>, kind: DepKind) -> VmaResult<()> {
        self.chain.add_dependency(dep, kind)
    }

    #[must_use]
    pub fn pending_dependencies(&self) -> usize {
        self.chain.len()
    }

    /// Arms the job. `job` receives `Err` if any dependency failed; its
    /// return value becomes the outcome of [`fence`](Self::fence).
    pub fn commit<F>(self, workers: &Arc<WorkerPool>, job: F)
    where
        F: FnOnce(VmaResult<()>) -> VmaResult<()> + Send + 'static,
    {
        let fence = self.fence;
        let workers = workers.clone();
        self.chain.when_all(move |err| {
            workers.queue_work(Box::new(move || {
                let outcome = job(err.map_or(Ok(()), Err));
                fence.signal(outcome);
            }));
        });
    }

    /// Signals the fence with `err` without running anything.
    pub fn cancel(self, err: VmaError) {
        self.fence.signal(Err(err));
    }
}
