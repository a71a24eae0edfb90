//! Expiration Notifications
//!
//! Entries expire lazily: a segment notices an expired record while serving
//! some other request, removes it under its write lock, and only then hands
//! an event to the [`ExpiryNotifier`]. The notifier never calls the listener
//! itself; it packages the work as a task and submits it to an [`Executor`],
//! so listener code never runs while a segment lock is held.
//!
//! Delivery is fire-and-forget. There is no retry and no ordering between
//! events. A removal that freed nothing (another thread won the race) never
//! produces an event, so each expiry is reported at most once.
//!
//! ## Executors
//!
//! - [`InlineExecutor`]: runs the task on the calling thread, after the
//!   segment lock has been released. Handy for tests and simple embedders.
//! - `tokio::runtime::Handle`: runs each task on the blocking pool.
//! - [`QueueExecutor`]: a bounded queue drained by one background task.
//!   Events are delivered one at a time in submission order, so a slow
//!   listener delays every event queued behind it. When the queue is full
//!   new events are dropped and counted.

use crate::codec::EntityCodec;
use crate::config::NotifierConfig;
use crate::error::Result;
use bytes::Bytes;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

/// Unit of work submitted to an [`Executor`].
pub type Task = Box<dyn FnOnce() + Send + 'static>;

/// Runs notification tasks somewhere other than under a segment lock.
pub trait Executor: Send + Sync {
    fn submit(&self, task: Task);
}

/// Runs tasks immediately on the submitting thread.
#[derive(Debug, Default, Clone, Copy)]
pub struct InlineExecutor;

impl Executor for InlineExecutor {
    fn submit(&self, task: Task) {
        task();
    }
}

impl Executor for tokio::runtime::Handle {
    fn submit(&self, task: Task) {
        drop(self.spawn_blocking(task));
    }
}

/// Bounded queue of tasks drained by a background Tokio task.
///
/// The worker runs one task at a time and waits for it to finish before
/// taking the next. When this handle is dropped, the worker stops.
#[derive(Debug)]
pub struct QueueExecutor {
    tx: mpsc::Sender<Task>,
    shutdown_tx: watch::Sender<bool>,
    dropped: AtomicU64,
}

impl QueueExecutor {
    /// Starts the worker. Must be called from within a Tokio runtime.
    pub fn start(config: NotifierConfig) -> Result<Self> {
        config.validate()?;

        let (tx, rx) = mpsc::channel(config.queue_depth);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        tokio::spawn(worker_loop(rx, shutdown_rx));

        info!(queue_depth = config.queue_depth, "Expiry notification worker started");

        Ok(Self {
            tx,
            shutdown_tx,
            dropped: AtomicU64::new(0),
        })
    }

    /// Events rejected because the queue was full or closed.
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    /// Stops the worker. Queued tasks that have not started are discarded.
    pub fn stop(&self) {
        let _ = self.shutdown_tx.send(true);
    }
}

impl Executor for QueueExecutor {
    fn submit(&self, task: Task) {
        match self.tx.try_send(task) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(_)) => {
                self.dropped.fetch_add(1, Ordering::Relaxed);
                warn!("Expiry notification queue full, dropping event");
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                self.dropped.fetch_add(1, Ordering::Relaxed);
                debug!("Expiry notification worker stopped, dropping event");
            }
        }
    }
}

impl Drop for QueueExecutor {
    fn drop(&mut self) {
        self.stop();
    }
}

async fn worker_loop(mut rx: mpsc::Receiver<Task>, mut shutdown_rx: watch::Receiver<bool>) {
    loop {
        tokio::select! {
            task = rx.recv() => match task {
                Some(task) => {
                    if let Err(e) = tokio::task::spawn_blocking(task).await {
                        warn!(error = %e, "Expiry listener task failed");
                    }
                }
                None => return,
            },
            result = shutdown_rx.changed() => {
                if result.is_err() || *shutdown_rx.borrow() {
                    debug!("Expiry notification worker received shutdown signal");
                    return;
                }
            }
        }
    }
}

/// What an expiry event carries: the entity, or the raw payload.
#[derive(Debug, Clone, PartialEq)]
pub enum ExpiredValue<E> {
    Entity(E),
    Raw(Bytes),
}

/// One expired entry.
#[derive(Debug, Clone, PartialEq)]
pub struct ExpiredEvent<E> {
    pub value: ExpiredValue<E>,
    /// Persistent type name reported by the codec.
    pub type_name: String,
    /// The ttl the entry was written with, in milliseconds.
    pub ttl: u32,
}

/// Receives expiry events.
pub trait ExpirationListener<E>: Send + Sync {
    /// Whether events should carry the deserialized entity instead of raw bytes.
    fn wants_full_entity(&self) -> bool {
        false
    }

    fn on_expired(&self, event: ExpiredEvent<E>);
}

/// Dispatches expiry events for one persistent type.
pub struct ExpiryNotifier<C: EntityCodec> {
    codec: Arc<C>,
    listener: Option<Arc<dyn ExpirationListener<C::Entity>>>,
    executor: Arc<dyn Executor>,
    dispatched: AtomicU64,
}

impl<C: EntityCodec> fmt::Debug for ExpiryNotifier<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExpiryNotifier")
            .field("type_name", &self.codec.type_name())
            .field("has_listener", &self.listener.is_some())
            .field("dispatched", &self.dispatched.load(Ordering::Relaxed))
            .finish()
    }
}

impl<C: EntityCodec> ExpiryNotifier<C> {
    /// A notifier with no listener; expiries are silent.
    pub fn new(codec: Arc<C>) -> Self {
        Self {
            codec,
            listener: None,
            executor: Arc::new(InlineExecutor),
            dispatched: AtomicU64::new(0),
        }
    }

    /// Registers the listener and the executor that delivers to it.
    pub fn with_listener(
        mut self,
        listener: Arc<dyn ExpirationListener<C::Entity>>,
        executor: Arc<dyn Executor>,
    ) -> Self {
        self.listener = Some(listener);
        self.executor = executor;
        self
    }

    /// Number of events handed to the executor.
    pub fn dispatched(&self) -> u64 {
        self.dispatched.load(Ordering::Relaxed)
    }

    /// Queues delivery of one expired payload.
    ///
    /// Callers must have released the segment lock and must only call this
    /// when their own removal actually freed the entry.
    pub fn notify(&self, payload: Bytes, ttl: u32) {
        let Some(listener) = self.listener.clone() else {
            return;
        };
        let codec = Arc::clone(&self.codec);

        self.dispatched.fetch_add(1, Ordering::Relaxed);
        self.executor.submit(Box::new(move || {
            let value = if listener.wants_full_entity() {
                match codec.deserialize(&payload) {
                    Ok(entity) => ExpiredValue::Entity(entity),
                    Err(e) => {
                        warn!(error = %e, "Could not decode expired entry, delivering raw bytes");
                        ExpiredValue::Raw(payload)
                    }
                }
            } else {
                ExpiredValue::Raw(payload)
            };

            listener.on_expired(ExpiredEvent {
                value,
                type_name: codec.type_name().to_string(),
                ttl,
            });
        }));
    }
}
