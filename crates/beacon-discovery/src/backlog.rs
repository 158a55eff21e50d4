//! Resolve backlog.
//!
//! Many discovery facilities resolve one service at a time and misbehave when
//! asked to overlap resolutions. The backlog turns a burst of "service found"
//! callbacks into a FIFO of resolve requests with at most one in flight.
//!
//! The queue is owned by a single tokio task. `add`, `quit` and completions
//! are messages to that task, so the one-in-flight rule holds by construction
//! rather than by locking. Each dispatch is numbered and a completion only
//! counts when it carries the number of the resolve in flight.
//!
//! ```text
//!  service_found(A) ─┐
//!  service_found(B) ─┼─► [A, B, C] ──► resolve(A) ──► ResolveReply ──► proceed
//!  service_found(C) ─┘                    │                              │
//!                                         └──────── next head ◄──────────┘
//! ```

use beacon_core::{BeaconError, Result, ServiceDescriptor};
use std::collections::VecDeque;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender, WeakUnboundedSender};
use tracing::{debug, info, trace, warn};

/// Error code reported when a backend drops a [`ResolveReply`] without answering it.
pub const ABANDONED_RESOLVE: i32 = -1;

/// Issues a resolve request to the backend.
pub type ResolveFn<E> = Arc<dyn Fn(E, ResolveReply) + Send + Sync>;

/// Receives each successfully resolved service, in FIFO order.
pub type ResolvedFn = Arc<dyn Fn(ServiceDescriptor) + Send + Sync>;

/// Result of one resolution.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResolveOutcome {
    Resolved(ServiceDescriptor),
    Failed(i32),
}

enum Command<E> {
    Add(E),
    Proceed { seq: u64, outcome: ResolveOutcome },
    Quit,
}

#[derive(Debug, Default)]
struct Counters {
    queued: AtomicUsize,
    in_flight: AtomicBool,
    resolved: AtomicUsize,
    failed: AtomicUsize,
}

/// Handle to a running backlog. Cheap to clone; all clones feed the same queue.
pub struct ResolveBacklog<E> {
    label: Arc<str>,
    tx: UnboundedSender<Command<E>>,
    quit: Arc<AtomicBool>,
    counters: Arc<Counters>,
}

impl<E> Clone for ResolveBacklog<E> {
    fn clone(&self) -> Self {
        Self {
            label: self.label.clone(),
            tx: self.tx.clone(),
            quit: self.quit.clone(),
            counters: self.counters.clone(),
        }
    }
}

impl<E> fmt::Debug for ResolveBacklog<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResolveBacklog")
            .field("label", &self.label)
            .field("queued", &self.queued())
            .field("in_flight", &self.in_flight())
            .field("quit", &self.is_quit())
            .finish()
    }
}

impl<E> ResolveBacklog<E>
where
    E: fmt::Debug + Clone + Send + 'static,
{
    /// Spawns the backlog task on the current tokio runtime.
    ///
    /// # Errors
    ///
    /// Returns an error when called outside a tokio runtime.
    pub fn spawn(label: impl Into<String>, resolve: ResolveFn<E>, on_resolved: ResolvedFn) -> Result<Self> {
        let runtime = tokio::runtime::Handle::try_current()
            .map_err(|e| BeaconError::Internal(format!("resolve backlog needs a tokio runtime: {}", e)))?;

        let label: Arc<str> = Arc::from(label.into());
        let (tx, rx) = mpsc::unbounded_channel();
        let counters = Arc::new(Counters::default());

        let worker = Worker {
            label: label.clone(),
            rx,
            replies: tx.downgrade(),
            resolve,
            on_resolved,
            queue: VecDeque::new(),
            in_flight: None,
            dispatched: 0,
            counters: counters.clone(),
        };
        runtime.spawn(worker.run());

        Ok(Self {
            label,
            tx,
            quit: Arc::new(AtomicBool::new(false)),
            counters,
        })
    }

    /// Enqueues an entry. Dispatched immediately if nothing is in flight.
    /// A no-op once the backlog has quit.
    pub fn add(&self, entry: E) {
        if self.is_quit() {
            debug!(backlog = %self.label, ?entry, "Backlog has quit, ignoring entry");
            return;
        }
        self.counters.queued.fetch_add(1, Ordering::SeqCst);
        if let Err(mpsc::error::SendError(cmd)) = self.tx.send(Command::Add(entry)) {
            self.counters.queued.fetch_sub(1, Ordering::SeqCst);
            if let Command::Add(entry) = cmd {
                debug!(backlog = %self.label, ?entry, "Backlog task gone, ignoring entry");
            }
        }
    }

    /// Drops every queued entry and stops the task. Later calls are no-ops.
    pub fn quit(&self) {
        if self.quit.swap(true, Ordering::SeqCst) {
            return;
        }
        debug!(backlog = %self.label, queued = self.queued(), "Quitting resolve backlog");
        let _ = self.tx.send(Command::Quit);
    }
}

impl<E> ResolveBacklog<E> {
    /// Entries waiting, including the one in flight.
    pub fn queued(&self) -> usize {
        self.counters.queued.load(Ordering::SeqCst)
    }

    /// Whether a resolution is currently outstanding.
    pub fn in_flight(&self) -> bool {
        self.counters.in_flight.load(Ordering::SeqCst)
    }

    /// Number of entries resolved so far.
    pub fn resolved_count(&self) -> usize {
        self.counters.resolved.load(Ordering::SeqCst)
    }

    /// Number of entries dropped after a failed resolution.
    pub fn failed_count(&self) -> usize {
        self.counters.failed.load(Ordering::SeqCst)
    }

    pub fn is_quit(&self) -> bool {
        self.quit.load(Ordering::SeqCst)
    }
}

/// One-shot completion handle for a resolve request.
///
/// The backend must call exactly one of [`resolved`](Self::resolved) or
/// [`failed`](Self::failed). Dropping the reply unanswered counts as a
/// failure with [`ABANDONED_RESOLVE`].
pub struct ResolveReply {
    label: Arc<str>,
    tx: Option<Box<dyn FnOnce(ResolveOutcome) + Send>>,
}

impl ResolveReply {
    fn new<E: Send + 'static>(label: Arc<str>, seq: u64, tx: WeakUnboundedSender<Command<E>>) -> Self {
        let backlog = label.clone();
        let complete = move |outcome: ResolveOutcome| match tx.upgrade() {
            Some(tx) => {
                if tx.send(Command::Proceed { seq, outcome }).is_err() {
                    debug!(backlog = %backlog, "Backlog task gone, discarding resolution");
                }
            }
            None => debug!(backlog = %backlog, "Backlog closed, discarding stale resolution"),
        };
        Self {
            label,
            tx: Some(Box::new(complete)),
        }
    }

    /// Builds a reply that hands its outcome to `complete` instead of a
    /// backlog. Lets adapters exercise their resolve paths in isolation.
    pub fn from_fn(label: impl Into<String>, complete: impl FnOnce(ResolveOutcome) + Send + 'static) -> Self {
        Self {
            label: Arc::from(label.into()),
            tx: Some(Box::new(complete)),
        }
    }

    pub fn resolved(mut self, service: ServiceDescriptor) {
        self.finish(ResolveOutcome::Resolved(service));
    }

    pub fn failed(mut self, code: i32) {
        self.finish(ResolveOutcome::Failed(code));
    }

    fn finish(&mut self, outcome: ResolveOutcome) {
        if let Some(complete) = self.tx.take() {
            complete(outcome);
        }
    }
}

impl fmt::Debug for ResolveReply {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResolveReply")
            .field("backlog", &self.label)
            .field("answered", &self.tx.is_none())
            .finish()
    }
}

impl Drop for ResolveReply {
    fn drop(&mut self) {
        if self.tx.is_some() {
            warn!(backlog = %self.label, "Resolve reply dropped without an answer");
            self.finish(ResolveOutcome::Failed(ABANDONED_RESOLVE));
        }
    }
}

struct Worker<E> {
    label: Arc<str>,
    rx: UnboundedReceiver<Command<E>>,
    /// Weak so that the task ends once every handle is gone.
    replies: WeakUnboundedSender<Command<E>>,
    resolve: ResolveFn<E>,
    on_resolved: ResolvedFn,
    queue: VecDeque<E>,
    /// Sequence number of the outstanding resolve.
    in_flight: Option<u64>,
    dispatched: u64,
    counters: Arc<Counters>,
}

impl<E> Worker<E>
where
    E: fmt::Debug + Clone + Send + 'static,
{
    async fn run(mut self) {
        debug!(backlog = %self.label, "Resolve backlog started");

        while let Some(command) = self.rx.recv().await {
            match command {
                Command::Add(entry) => {
                    trace!(backlog = %self.label, ?entry, "Queued for resolution");
                    self.queue.push_back(entry);
                    if self.in_flight.is_none() {
                        self.dispatch_head();
                    }
                }
                Command::Proceed { seq, outcome } => self.complete(seq, outcome),
                Command::Quit => break,
            }
        }

        let dropped = self.queue.len();
        self.queue.clear();
        self.counters.queued.store(0, Ordering::SeqCst);
        self.counters.in_flight.store(false, Ordering::SeqCst);
        info!(backlog = %self.label, dropped, "Resolve backlog stopped");
    }

    fn complete(&mut self, seq: u64, outcome: ResolveOutcome) {
        if self.in_flight != Some(seq) {
            warn!(backlog = %self.label, seq, in_flight = ?self.in_flight, ?outcome, "Ignoring stale completion");
            return;
        }

        let finished = self.queue.pop_front();
        self.in_flight = None;
        self.counters.in_flight.store(false, Ordering::SeqCst);
        self.counters.queued.fetch_sub(1, Ordering::SeqCst);

        match outcome {
            ResolveOutcome::Resolved(service) => {
                debug!(backlog = %self.label, service = %service, "Service resolved");
                self.counters.resolved.fetch_add(1, Ordering::SeqCst);
                (self.on_resolved)(service);
            }
            ResolveOutcome::Failed(code) => {
                let entry = finished.map(|e| format!("{:?}", e)).unwrap_or_default();
                let error = BeaconError::resolve_failed(entry, code);
                warn!(backlog = %self.label, %error, "Dropping unresolvable service");
                self.counters.failed.fetch_add(1, Ordering::SeqCst);
            }
        }

        self.dispatch_head();
    }

    fn dispatch_head(&mut self) {
        let Some(entry) = self.queue.front().cloned() else {
            return;
        };

        self.dispatched += 1;
        let seq = self.dispatched;
        self.in_flight = Some(seq);
        self.counters.in_flight.store(true, Ordering::SeqCst);
        debug!(backlog = %self.label, ?entry, seq, pending = self.queue.len() - 1, "Dispatching resolve");

        let reply = ResolveReply::new(self.label.clone(), seq, self.replies.clone());
        (self.resolve)(entry, reply);
    }
}
