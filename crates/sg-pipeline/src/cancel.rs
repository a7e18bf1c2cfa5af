use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, Sender};
use parking_lot::Mutex;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

struct CancelInner {
    cancelled: AtomicBool,
    /// Never sent on; dropping it disconnects `watch`, which wakes every
    /// `select!` blocked on it.
    trigger: Mutex<Option<Sender<()>>>,
    watch: Receiver<()>,
    children: Mutex<Vec<Weak<CancelInner>>>,
}

impl CancelInner {
    fn cancel(&self) {
        if self.cancelled.swap(true, Ordering::SeqCst) {
            return;
        }
        self.trigger.lock().take();
        let children = std::mem::take(&mut *self.children.lock());
        for child in children.iter().filter_map(Weak::upgrade) {
            child.cancel();
        }
    }
}

/// Shared stop signal for workers, the router and requesters.
#[derive(Clone)]
pub struct CancelSignal {
    inner: Arc<CancelInner>,
}

impl CancelSignal {
    pub fn new() -> Self {
        let (trigger, watch) = bounded(0);
        Self {
            inner: Arc::new(CancelInner {
                cancelled: AtomicBool::new(false),
                trigger: Mutex::new(Some(trigger)),
                watch,
                children: Mutex::new(Vec::new()),
            }),
        }
    }

    /// Signal cancellation. Idempotent; also cancels every child.
    pub fn cancel(&self) {
        self.inner.cancel();
    }

    /// Derived signal that is cancelled whenever `self` is, but whose own
    /// cancellation does not reach `self`.
    pub fn child(&self) -> CancelSignal {
        let child = CancelSignal::new();
        let mut children = self.inner.children.lock();
        if self.is_cancelled() {
            drop(children);
            child.cancel();
        } else {
            children.retain(|c| c.strong_count() > 0);
            children.push(Arc::downgrade(&child.inner));
        }
        child
    }

    pub fn is_cancelled(&self) -> bool {
        self.inner.cancelled.load(Ordering::SeqCst)
    }

    /// Channel that becomes ready (disconnected) once cancelled; for use in
    /// `select!`.
    pub fn watch(&self) -> &Receiver<()> {
        &self.inner.watch
    }

    /// Block until cancelled or `timeout` elapses. Returns `true` if
    /// cancelled.
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        match self.inner.watch.recv_timeout(timeout) {
            Err(RecvTimeoutError::Timeout) => self.is_cancelled(),
            Ok(()) | Err(RecvTimeoutError::Disconnected) => true,
        }
    }
}

impl Default for CancelSignal {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for CancelSignal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CancelSignal")
            .field("cancelled", &self.is_cancelled())
            .finish()
    }
}
