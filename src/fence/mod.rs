//! Completion handles.
//!
//! A [`Fence`] represents the eventual outcome of one piece of asynchronous
//! work, which either succeeds or fails with an error. Any number of
//! observers can wait on it or register a callback; exactly one producer
//! signals it, after which it never changes again.
//!
//! Callbacks run synchronously inside [`Fence::signal`] in a restricted
//! context. They must not block or take a mutex; anything heavier has to be
//! handed to the [`WorkerPool`](crate::worker::WorkerPool).
//! Blocking waits assert (in debug builds) that they are not issued from that
//! context.

pub mod deps;
pub mod resv;
pub mod work;

use crate::error::{VmaError, VmaResult};
use parking_lot::{Condvar, Mutex};
use std::cell::Cell;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::{Duration, Instant};

pub use deps::{DepKind, DependencySet};
pub use resv::ReservationObject;
pub use work::FenceWork;

type Callback = Box<dyn FnOnce(&Fence) + Send + 'static>;

/// Granularity at which interruptible waits poll their interrupt flag.
const INTERRUPT_POLL: Duration = Duration::from_millis(2);

static NEXT_SEQNO: AtomicU64 = AtomicU64::new(1);

thread_local! {
    static SIGNAL_DEPTH: Cell<u32> = const { Cell::new(0) };
}

/// True while the current thread is running fence callbacks.
#[must_use]
pub fn in_signal_context() -> bool {
    SIGNAL_DEPTH.with(|d| d.get() > 0)
}

/// Debug check for operations that may sleep.
#[inline]
pub(crate) fn might_sleep() {
    debug_assert!(
        !in_signal_context(),
        "blocking operation issued from fence signalling context"
    );
}

struct SignalGuard;

impl SignalGuard {
    fn enter() -> Self {
        SIGNAL_DEPTH.with(|d| d.set(d.get() + 1));
        Self
    }
}

impl Drop for SignalGuard {
    fn drop(&mut self) {
        SIGNAL_DEPTH.with(|d| d.set(d.get() - 1));
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FenceStatus {
    Pending,
    Signaled,
    Failed(VmaError),
}

enum FenceState {
    Pending(Vec<Callback>),
    Signaled(Option<VmaError>),
}

struct FenceInner {
    seqno: u64,
    name: &'static str,
    state: Mutex<FenceState>,
    cond: Condvar,
}

/// Shared handle to a single eventual outcome. Cloning shares the same fence.
#[derive(Clone)]
pub struct Fence {
    inner: Arc<FenceInner>,
}

impl std::fmt::Debug for Fence {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Fence")
            .field("name", &self.inner.name)
            .field("seqno", &self.inner.seqno)
            .field("status", &self.status())
            .finish()
    }
}

impl Fence {
    /// Creates a pending fence. The caller becomes its single producer.
    #[must_use]
    pub fn new(name: &'static str) -> Self {
        Self {
            inner: Arc::new(FenceInner {
                seqno: NEXT_SEQNO.fetch_add(1, Ordering::Relaxed),
                name,
                state: Mutex::new(FenceState::Pending(Vec::new())),
                cond: Condvar::new(),
            }),
        }
    }

    /// An already signalled fence.
    #[must_use]
    pub fn stub() -> Self {
        let fence = Self::new("stub");
        fence.signal(Ok(()));
        fence
    }

    /// An already failed fence.
    #[must_use]
    pub fn failed(name: &'static str, err: VmaError) -> Self {
        let fence = Self::new(name);
        fence.signal(Err(err));
        fence
    }

    #[must_use]
    pub fn seqno(&self) -> u64 {
        self.inner.seqno
    }

    #[must_use]
    pub fn name(&self) -> &'static str {
        self.inner.name
    }

    #[must_use]
    pub fn ptr_eq(a: &Self, b: &Self) -> bool {
        Arc::ptr_eq(&a.inner, &b.inner)
    }

    #[must_use]
    pub fn is_signaled(&self) -> bool {
        matches!(*self.inner.state.lock(), FenceState::Signaled(_))
    }

    /// The error the fence was signalled with, if it has been signalled with one.
    #[must_use]
    pub fn error(&self) -> Option<VmaError> {
        match &*self.inner.state.lock() {
            FenceState::Signaled(err) => err.clone(),
            FenceState::Pending(_) => None,
        }
    }

    #[must_use]
    pub fn status(&self) -> FenceStatus {
        match &*self.inner.state.lock() {
            FenceState::Pending(_) => FenceStatus::Pending,
            FenceState::Signaled(None) => FenceStatus::Signaled,
            FenceState::Signaled(Some(e)) => FenceStatus::Failed(e.clone()),
        }
    }

    /// Signals the fence and runs all registered callbacks on this thread.
    ///
    /// Returns `false` if the fence had already been signalled; the first
    /// outcome is kept.
    pub fn signal(&self, result: VmaResult<()>) -> bool {
        let callbacks = {
            let mut state = self.inner.state.lock();
            match &mut *state {
                FenceState::Signaled(_) => {
                    log::warn!(
                        "fence {}:{} signalled twice",
                        self.inner.name,
                        self.inner.seqno
                    );
                    return false;
                }
                FenceState::Pending(cbs) => {
                    let cbs = std::mem::take(cbs);
                    *state = FenceState::Signaled(result.err());
                    cbs
                }
            }
        };
        self.inner.cond.notify_all();

        if !callbacks.is_empty() {
            let _ctx = SignalGuard::enter();
            for cb in callbacks {
                cb(self);
            }
        }
        true
    }

    /// Registers `cb` to run when the fence signals.
    ///
    /// Returns `false`, dropping `cb` without calling it, if the fence is
    /// already signalled.
    pub fn add_callback(&self, cb: impl FnOnce(&Self) + Send + 'static) -> bool {
        let mut state = self.inner.state.lock();
        match &mut *state {
            FenceState::Pending(cbs) => {
                cbs.push(Box::new(cb));
                true
            }
            FenceState::Signaled(_) => false,
        }
    }

    /// Blocks until the fence signals and returns its outcome.
    pub fn wait(&self) -> VmaResult<()> {
        might_sleep();
        let mut state = self.inner.state.lock();
        loop {
            if let FenceState::Signaled(err) = &*state {
                return err.clone().map_or(Ok(()), Err);
            }
            self.inner.cond.wait(&mut state);
        }
    }

    /// Like [`wait`](Self::wait) but gives up with `WaitTimeout` after `timeout`.
    pub fn wait_timeout(&self, timeout: Duration) -> VmaResult<()> {
        might_sleep();
        let deadline = Instant::now() + timeout;
        let mut state = self.inner.state.lock();
        loop {
            if let FenceState::Signaled(err) = &*state {
                return err.clone().map_or(Ok(()), Err);
            }
            if self.inner.cond.wait_until(&mut state, deadline).timed_out() {
                if let FenceState::Signaled(err) = &*state {
                    return err.clone().map_or(Ok(()), Err);
                }
                return Err(VmaError::WaitTimeout);
            }
        }
    }

    /// Waits honouring the context: interruptible waits return `Interrupted`
    /// as soon as the context's interrupt flag is raised. The underlying work
    /// keeps running either way.
    pub fn wait_ctx(&self, ctx: &OperationCtx) -> VmaResult<()> {
        if !ctx.interruptible {
            return self.wait();
        }
        loop {
            if ctx.is_interrupted() {
                return Err(VmaError::Interrupted);
            }
            match self.wait_timeout(INTERRUPT_POLL) {
                Err(VmaError::WaitTimeout) => {}
                outcome => return outcome,
            }
        }
    }
}

/// Per-operation wait policy, shared by binding and migration calls.
#[derive(Debug, Clone, Default)]
pub struct OperationCtx {
    /// Whether waits may be aborted through the interrupt flag.
    pub interruptible: bool,
    interrupt: Option<Arc<AtomicBool>>,
}

impl OperationCtx {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes waits interruptible through `flag`.
    #[must_use]
    pub fn interruptible(mut self, flag: Arc<AtomicBool>) -> Self {
        self.interruptible = true;
        self.interrupt = Some(flag);
        self
    }

    #[must_use]
    pub fn is_interrupted(&self) -> bool {
        self.interrupt
            .as_ref()
            .is_some_and(|f| f.load(Ordering::Acquire))
    }
}
