use std::{
    fmt,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
};

use tokio::sync::mpsc;

/// Work handed to a [`Dispatch`] context
pub type Job = Box<dyn FnOnce() + Send + 'static>;

/// Execution context that runs listener callbacks
///
/// Callbacks never run while the connection is locked, so they may freely call back into the
/// client. Jobs must be run in the order they are dispatched.
pub trait Dispatch: Send + Sync + fmt::Debug + 'static {
    /// Run `job`, now or later
    fn dispatch(&self, job: Job);
}

/// Runs callbacks on the connection driver's task, right after each processing pass
#[derive(Debug, Default, Copy, Clone)]
pub struct Inline;

impl Dispatch for Inline {
    fn dispatch(&self, job: Job) {
        job()
    }
}

/// Runs callbacks one at a time on a dedicated tokio task
#[derive(Debug, Clone)]
pub struct TokioDispatcher {
    jobs: mpsc::UnboundedSender<Job>,
}

impl TokioDispatcher {
    /// Spawn the callback task on the current tokio runtime
    ///
    /// # Panics
    ///
    /// If called outside of a tokio runtime.
    pub fn new() -> Self {
        let (jobs, mut rx) = mpsc::unbounded_channel::<Job>();
        tokio::spawn(async move {
            while let Some(job) = rx.recv().await {
                job();
            }
        });
        Self { jobs }
    }
}

impl Default for TokioDispatcher {
    fn default() -> Self {
        Self::new()
    }
}

impl Dispatch for TokioDispatcher {
    fn dispatch(&self, job: Job) {
        // The task only exits once every sender is gone
        let _ = self.jobs.send(job);
    }
}

/// Identifies a registered listener for later removal
///
/// Unique across every emitter in the process.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
pub struct ListenerId(u64);

impl ListenerId {
    fn next() -> Self {
        static NEXT: AtomicU64 = AtomicU64::new(0);
        Self(NEXT.fetch_add(1, Ordering::Relaxed))
    }
}

pub(crate) type Handler<P> = Arc<dyn Fn(&P) + Send + Sync>;

struct Listener<K, P> {
    id: ListenerId,
    /// `None` listens to every event
    key: Option<K>,
    once: bool,
    handler: Handler<P>,
}

/// Listeners keyed by event kind
///
/// Emitting snapshots the matching listeners into a single [`Job`], so listeners added or removed
/// while that job runs only affect later emissions. Removed handlers are handed back so they can be
/// dropped after the client state is unlocked.
pub(crate) struct EventEmitter<K, P> {
    listeners: Vec<Listener<K, P>>,
}

impl<K, P> EventEmitter<K, P>
where
    K: PartialEq,
    P: Send + 'static,
{
    pub(crate) fn new() -> Self {
        Self {
            listeners: Vec::new(),
        }
    }

    pub(crate) fn on(&mut self, key: Option<K>, handler: Handler<P>) -> ListenerId {
        self.register(key, false, handler)
    }

    /// Register a listener that is removed after its first invocation
    pub(crate) fn once(&mut self, key: Option<K>, handler: Handler<P>) -> ListenerId {
        self.register(key, true, handler)
    }

    fn register(&mut self, key: Option<K>, once: bool, handler: Handler<P>) -> ListenerId {
        let id = ListenerId::next();
        self.listeners.push(Listener {
            id,
            key,
            once,
            handler,
        });
        id
    }

    /// Returns the handler if the listener was registered here
    pub(crate) fn off(&mut self, id: ListenerId) -> Option<Handler<P>> {
        let index = self.listeners.iter().position(|l| l.id == id)?;
        Some(self.listeners.remove(index).handler)
    }

    pub(crate) fn off_all(&mut self) -> Vec<Handler<P>> {
        self.listeners.drain(..).map(|l| l.handler).collect()
    }

    #[cfg(test)]
    pub(crate) fn len(&self) -> usize {
        self.listeners.len()
    }

    /// Prepare the invocation of every listener interested in `key`
    pub(crate) fn emit(&mut self, key: &K, payload: P) -> Option<Job> {
        let mut handlers = Vec::new();
        self.listeners.retain(|l| {
            if l.key.as_ref().map_or(true, |k| k == key) {
                handlers.push(l.handler.clone());
                !l.once
            } else {
                true
            }
        });
        if handlers.is_empty() {
            return None;
        }
        Some(Box::new(move || {
            for handler in handlers {
                handler(&payload);
            }
        }))
    }
}

impl<K, P> fmt::Debug for EventEmitter<K, P> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventEmitter")
            .field("listeners", &self.listeners.len())
            .finish()
    }
}
