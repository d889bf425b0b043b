use super::{Fence, OperationCtx, ReservationObject};
use crate::error::{VmaError, VmaResult};
use crossbeam_channel::{Receiver, bounded};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

/// Why a dependency was collected.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DepKind {
    /// A previous migration of the same buffer.
    Moving,
    /// A shared (read) fence from a reservation object.
    Shared,
    /// The exclusive (write) fence from a reservation object.
    Exclusive,
    /// An unbind in flight over an overlapping address range.
    Unbind,
    /// Anything else, e.g. a previous bind of the same VMA.
    Chain,
}

/// Ordered collection of fences that must all signal before the gated
/// operation may start.
///
/// Signalled fences are not stored: adding one either succeeds immediately
/// or, if it failed, propagates its error. Duplicates are collapsed.
#[derive(Debug, Default)]
pub struct DependencySet {
    fences: Vec<(Fence, DepKind)>,
}

impl DependencySet {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.fences.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.fences.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&Fence, DepKind)> {
        self.fences.iter().map(|(f, k)| (f, *k))
    }

    /// Adds `fence` if it is still pending.
    ///
    /// # Errors
    /// Returns the fence's error if it has already signalled with one.
    pub fn add_dependency(&mut self, fence: Option<&Fence>, kind: DepKind) -> VmaResult<()> {
        let Some(fence) = fence else {
            return Ok(());
        };

        if fence.is_signaled() {
            return fence.error().map_or(Ok(()), Err);
        }

        if self.fences.iter().any(|(f, _)| Fence::ptr_eq(f, fence)) {
            return Ok(());
        }

        self.fences.push((fence.clone(), kind));
        Ok(())
    }

    /// Adds every unsignalled fence of a reservation object.
    ///
    /// # Errors
    /// Propagates the error of any already-failed fence.
    pub fn add_reservation(&mut self, resv: &ReservationObject) -> VmaResult<()> {
        let (exclusive, shared) = resv.fences();
        self.add_dependency(exclusive.as_ref(), DepKind::Exclusive)?;
        for fence in &shared {
            self.add_dependency(Some(fence), DepKind::Shared)?;
        }
        Ok(())
    }

    /// Waits for every dependency, in insertion order.
    ///
    /// # Errors
    /// Returns the first dependency error, or `Interrupted` if the context's
    /// wait was aborted.
    pub fn sync(&self, ctx: &OperationCtx) -> VmaResult<()> {
        for (fence, _) in &self.fences {
            fence.wait_ctx(ctx)?;
        }
        Ok(())
    }

    /// Consumes the set and calls `f` once every dependency has signalled,
    /// passing the first error observed.
    ///
    /// `f` runs either on this thread (if nothing is pending) or in the
    /// signalling context of the last fence, so it must not block. The join
    /// itself takes no locks.
    pub fn when_all(self, f: impl FnOnce(Option<VmaError>) + Send + 'static) {
        const NO_ERROR: usize = usize::MAX;

        type Done = Box<dyn FnOnce(Option<VmaError>) + Send>;

        struct Join {
            fences: Vec<Fence>,
            remaining: AtomicUsize,
            /// Index of the first fence seen failing.
            first_error: AtomicUsize,
            /// One-shot slot for `f`, emptied by the last `put`.
            done: Receiver<Done>,
        }

        impl Join {
            fn record(&self, index: usize) {
                if self.fences[index].error().is_some() {
                    let _ = self.first_error.compare_exchange(
                        NO_ERROR,
                        index,
                        Ordering::AcqRel,
                        Ordering::Acquire,
                    );
                }
            }

            fn put(&self) {
                if self.remaining.fetch_sub(1, Ordering::AcqRel) != 1 {
                    return;
                }
                let err = match self.first_error.load(Ordering::Acquire) {
                    NO_ERROR => None,
                    index => self.fences[index].error(),
                };
                if let Ok(done) = self.done.try_recv() {
                    done(err);
                }
            }
        }

        let (tx, rx) = bounded::<Done>(1);
        let _ = tx.try_send(Box::new(f));

        let fences: Vec<Fence> = self.fences.into_iter().map(|(fence, _)| fence).collect();
        let count = fences.len();
        // One extra count held until every callback has been armed.
        let join = Arc::new(Join {
            fences,
            remaining: AtomicUsize::new(count + 1),
            first_error: AtomicUsize::new(NO_ERROR),
            done: rx,
        });

        for index in 0..count {
            let j = join.clone();
            let armed = join.fences[index].add_callback(move |_| {
                j.record(index);
                j.put();
            });
            if !armed {
                join.record(index);
                join.put();
            }
        }
        join.put();
    }
}
