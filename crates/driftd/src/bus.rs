//! In-process event bus.
//!
//! Producers publish into one bounded queue without ever blocking; a full
//! queue drops the event and bumps a counter. A single fan-out task copies
//! each event to every subscriber queue, again with non-blocking sends, so a
//! slow subscriber only loses its own copies.

use drift_common::Event;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Cloneable handle to the bus
#[derive(Clone)]
pub struct EventBus {
    inner: Arc<BusInner>,
}

struct BusInner {
    tx: mpsc::Sender<Event>,
    rx: Mutex<Option<mpsc::Receiver<Event>>>,
    subscribers: Mutex<Vec<mpsc::Sender<Event>>>,
    subscriber_capacity: usize,
    published: AtomicU64,
    dropped: AtomicU64,
    fanout_dropped: AtomicU64,
}

impl EventBus {
    pub fn new(capacity: usize, subscriber_capacity: usize) -> Self {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        Self {
            inner: Arc::new(BusInner {
                tx,
                rx: Mutex::new(Some(rx)),
                subscribers: Mutex::new(Vec::new()),
                subscriber_capacity: subscriber_capacity.max(1),
                published: AtomicU64::new(0),
                dropped: AtomicU64::new(0),
                fanout_dropped: AtomicU64::new(0),
            }),
        }
    }

    /// Enqueue an event; returns false if it was dropped
    pub fn publish(&self, event: Event) -> bool {
        match self.inner.tx.try_send(event) {
            Ok(()) => {
                self.inner.published.fetch_add(1, Ordering::Relaxed);
                true
            }
            Err(TrySendError::Full(event)) => {
                let dropped = self.inner.dropped.fetch_add(1, Ordering::Relaxed) + 1;
                debug!("Bus full, dropped {} event (total dropped: {})", event.kind(), dropped);
                false
            }
            Err(TrySendError::Closed(_)) => {
                self.inner.dropped.fetch_add(1, Ordering::Relaxed);
                false
            }
        }
    }

    /// Register a new subscriber; it sees events fanned out from now on
    pub fn subscribe(&self) -> mpsc::Receiver<Event> {
        let (tx, rx) = mpsc::channel(self.inner.subscriber_capacity);
        lock(&self.inner.subscribers).push(tx);
        rx
    }

    pub fn subscriber_count(&self) -> usize {
        lock(&self.inner.subscribers).len()
    }

    /// Events accepted by [`EventBus::publish`]
    pub fn published(&self) -> u64 {
        self.inner.published.load(Ordering::Relaxed)
    }

    /// Events rejected because the shared queue was full
    pub fn dropped(&self) -> u64 {
        self.inner.dropped.load(Ordering::Relaxed)
    }

    /// Per-subscriber copies lost to a full subscriber queue
    pub fn fanout_dropped(&self) -> u64 {
        self.inner.fanout_dropped.load(Ordering::Relaxed)
    }

    /// Drain the shared queue into subscriber queues until cancelled.
    ///
    /// Only the first caller gets the queue; later calls return immediately.
    pub async fn run_fanout(&self, cancel: CancellationToken) {
        let taken = lock(&self.inner.rx).take();
        let Some(mut rx) = taken else {
            warn!("Event bus fan-out is already running");
            return;
        };

        info!("Event bus fan-out started");
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                event = rx.recv() => match event {
                    Some(event) => self.fan_out(event),
                    None => break,
                },
            }
        }
        info!(
            "Event bus fan-out stopped ({} published, {} dropped, {} subscriber drops)",
            self.published(),
            self.dropped(),
            self.fanout_dropped()
        );
    }

    fn fan_out(&self, event: Event) {
        let mut subscribers = lock(&self.inner.subscribers);
        subscribers.retain(|tx| match tx.try_send(event.clone()) {
            Ok(()) => true,
            Err(TrySendError::Full(_)) => {
                self.inner.fanout_dropped.fetch_add(1, Ordering::Relaxed);
                debug!("Subscriber queue full, dropped {} event", event.kind());
                true
            }
            Err(TrySendError::Closed(_)) => {
                debug!("Removing closed subscriber");
                false
            }
        });
    }
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}
