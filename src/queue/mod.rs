//! Confinement queues: one dedicated worker thread per domain.
//!
//! Every transaction context is bound to exactly one queue; all access to
//! the context's state happens as jobs on that queue. Queues shut down when
//! the last handle is dropped.

use std::cell::RefCell;
use std::sync::mpsc;
use std::sync::{Arc, Weak};
use std::thread;

use tracing::trace;

type Job = Box<dyn FnOnce() + Send>;

struct QueueCore {
    label: String,
    thread: thread::ThreadId,
    tx: mpsc::Sender<Job>,
}

thread_local! {
    /// The queue the current thread belongs to, if it is a queue worker.
    /// Held weakly so a worker's self-reference cannot keep its own channel
    /// open after every external handle is gone.
    static CURRENT: RefCell<Option<Weak<QueueCore>>> = const { RefCell::new(None) };
}

/// Cloneable submitter for one confinement queue.
#[derive(Clone)]
pub struct QueueHandle {
    core: Arc<QueueCore>,
}

impl QueueHandle {
    /// Spawn a new queue with a dedicated worker thread.
    pub fn spawn(label: impl Into<String>) -> QueueHandle {
        let label = label.into();
        let (tx, rx) = mpsc::channel::<Job>();
        let (init_tx, init_rx) = mpsc::channel::<Weak<QueueCore>>();

        let thread_label = label.clone();
        let join = thread::Builder::new()
            .name(label.clone())
            .spawn(move || {
                let me = init_rx.recv().expect("queue init channel closed");
                CURRENT.with(|current| *current.borrow_mut() = Some(me));
                while let Ok(job) = rx.recv() {
                    job();
                }
                trace!(queue = %thread_label, "queue worker exiting");
            })
            .expect("failed to spawn queue worker thread");

        let core = Arc::new(QueueCore {
            label,
            thread: join.thread().id(),
            tx,
        });
        init_tx
            .send(Arc::downgrade(&core))
            .expect("queue worker died during init");
        QueueHandle { core }
    }

    /// The queue the calling code is currently running on, if any.
    pub fn current() -> Option<QueueHandle> {
        CURRENT.with(|current| {
            current
                .borrow()
                .as_ref()
                .and_then(Weak::upgrade)
                .map(|core| QueueHandle { core })
        })
    }

    pub fn label(&self) -> &str {
        &self.core.label
    }

    /// Whether the calling thread is this queue's worker.
    pub fn is_current(&self) -> bool {
        thread::current().id() == self.core.thread
    }

    /// Enqueue a job without waiting for it.
    pub fn perform(&self, job: impl FnOnce() + Send + 'static) {
        // A send failure means the worker died, which only happens after a
        // job panicked; there is nothing useful to do with the job then.
        let _ = self.core.tx.send(Box::new(job));
    }

    /// Run a job on the queue and block until it returns. Runs inline when
    /// already on the queue, so nested waits cannot deadlock on themselves.
    pub fn perform_wait<R: Send + 'static>(&self, job: impl FnOnce() -> R + Send + 'static) -> R {
        if self.is_current() {
            return job();
        }
        let (tx, rx) = mpsc::channel();
        self.perform(move || {
            let _ = tx.send(job());
        });
        rx.recv().expect("confinement queue terminated mid-wait")
    }
}

impl std::fmt::Debug for QueueHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QueueHandle")
            .field("label", &self.core.label)
            .finish()
    }
}

/// Invoke `completion` on `origin` when present, inline otherwise.
///
/// Used to marshal save and scheduler completions back to the queue that
/// initiated the call.
pub fn dispatch_completion(origin: Option<QueueHandle>, completion: impl FnOnce() + Send + 'static) {
    match origin {
        Some(queue) if !queue.is_current() => queue.perform(completion),
        _ => completion(),
    }
}
