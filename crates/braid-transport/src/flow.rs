//! Hierarchical lifecycle/cancellation token.
//!
//! A [`Flow`] bundles a cancellation signal, on-close hooks, and background
//! task handles. Flows form a tree: closing a parent closes every forked
//! child; closing a child does not propagate up. Every blocking primitive
//! in the transport either selects on [`Flow::closed`] or uses a deadline
//! short enough to re-check it.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use tokio::sync::watch;
use tokio::task::JoinHandle;

type CloseHook = Box<dyn FnOnce() + Send>;

/// A shareable cancellation/lifecycle token.
///
/// Cloning yields another handle to the same flow.
#[derive(Clone)]
pub struct Flow {
    inner: Arc<FlowInner>,
}

struct FlowInner {
    stop_tx: watch::Sender<bool>,
    stop_rx: watch::Receiver<bool>,
    closed: AtomicBool,
    on_close: Mutex<Vec<CloseHook>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl Flow {
    /// Create a root flow.
    pub fn new() -> Self {
        let (stop_tx, stop_rx) = watch::channel(false);
        Self {
            inner: Arc::new(FlowInner {
                stop_tx,
                stop_rx,
                closed: AtomicBool::new(false),
                on_close: Mutex::new(Vec::new()),
                tasks: Mutex::new(Vec::new()),
            }),
        }
    }

    /// Fork a child flow. The child is closed when this flow closes; the
    /// reverse does not hold.
    pub fn fork(&self) -> Flow {
        let child = Flow::new();
        let handle = child.clone();
        self.add_on_close(move || handle.close());
        child
    }

    /// Register a hook to run exactly once when the flow closes. Hooks run
    /// in registration order. Registering on an already-closed flow runs
    /// the hook immediately.
    pub fn add_on_close(&self, f: impl FnOnce() + Send + 'static) {
        {
            let mut hooks = self.inner.on_close.lock().expect("on_close poisoned");
            if !self.inner.closed.load(Ordering::SeqCst) {
                hooks.push(Box::new(f));
                return;
            }
        }
        f();
    }

    /// Close the flow. Idempotent: the first call signals cancellation and
    /// drains the hooks; later calls are no-ops.
    pub fn close(&self) {
        if self.inner.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        let _ = self.inner.stop_tx.send(true);

        let hooks: Vec<CloseHook> = {
            let mut guard = self.inner.on_close.lock().expect("on_close poisoned");
            guard.drain(..).collect()
        };
        for hook in hooks {
            hook();
        }
    }

    /// Whether the flow has been closed.
    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::SeqCst)
    }

    /// Wait until the flow closes.
    pub async fn closed(&self) {
        let mut rx = self.inner.stop_rx.clone();
        // Err means the sender was dropped, which only happens when the
        // flow itself is gone; treat both as closed.
        let _ = rx.wait_for(|stopped| *stopped).await;
    }

    /// A receiver on the cancellation signal, for `tokio::select!` loops.
    pub fn subscribe(&self) -> watch::Receiver<bool> {
        self.inner.stop_rx.clone()
    }

    /// Register a background task belonging to this flow.
    pub fn add_task(&self, handle: JoinHandle<()>) {
        self.inner.tasks.lock().expect("tasks poisoned").push(handle);
    }

    /// Await every registered task, draining the handle list. Join errors
    /// are ignored.
    pub async fn join_all(&self) {
        let handles: Vec<JoinHandle<()>> = {
            let mut guard = self.inner.tasks.lock().expect("tasks poisoned");
            guard.drain(..).collect()
        };
        for handle in handles {
            let _ = handle.await;
        }
    }
}

impl Default for Flow {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for Flow {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Flow")
            .field("closed", &self.is_closed())
            .finish()
    }
}
