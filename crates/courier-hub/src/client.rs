//! Registry of connected callers and their bounded send queues.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use courier_core::ids::ClientId;
use courier_core::Envelope;
use courier_telemetry::metrics::{HUB_CALLERS_ACTIVE, HUB_SEND_DROPS_TOTAL};
use dashmap::DashMap;
use metrics::{counter, gauge};
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{debug, warn};

/// A connected external caller.
pub struct Caller {
    pub id: ClientId,
    tx: mpsc::Sender<String>,
    pub connected_at: Instant,
    last_seen: Mutex<Instant>,
    dropped: AtomicU64,
}

impl Caller {
    fn new(id: ClientId, tx: mpsc::Sender<String>) -> Self {
        let now = Instant::now();
        Self {
            id,
            tx,
            connected_at: now,
            last_seen: Mutex::new(now),
            dropped: AtomicU64::new(0),
        }
    }

    /// Queue a frame. Full or closed queues drop it.
    pub fn send(&self, text: String) -> bool {
        match self.tx.try_send(text) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(text)) => {
                let _ = self.dropped.fetch_add(1, Ordering::Relaxed);
                counter!(HUB_SEND_DROPS_TOTAL).increment(1);
                warn!(
                    client_id = %self.id,
                    msg_len = text.len(),
                    "send queue full, dropping message"
                );
                false
            }
            Err(mpsc::error::TrySendError::Closed(_)) => false,
        }
    }

    pub fn touch(&self) {
        *self.last_seen.lock() = Instant::now();
    }

    pub fn idle_for(&self) -> Duration {
        self.last_seen.lock().elapsed()
    }

    pub fn drop_count(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

pub struct CallerRegistry {
    callers: DashMap<ClientId, Arc<Caller>>,
    max_send_queue: usize,
}

impl CallerRegistry {
    pub fn new(max_send_queue: usize) -> Self {
        Self {
            callers: DashMap::new(),
            max_send_queue: max_send_queue.max(1),
        }
    }

    /// Register a new caller; the receiver feeds its socket writer.
    pub fn register(&self) -> (ClientId, mpsc::Receiver<String>) {
        let id = ClientId::new();
        let (tx, rx) = mpsc::channel(self.max_send_queue);
        let _ = self
            .callers
            .insert(id.clone(), Arc::new(Caller::new(id.clone(), tx)));
        gauge!(HUB_CALLERS_ACTIVE).set(self.callers.len() as f64);
        (id, rx)
    }

    /// Remove a caller. Dropping its sender ends the socket writer.
    pub fn unregister(&self, id: &ClientId) -> bool {
        let removed = self.callers.remove(id).is_some();
        gauge!(HUB_CALLERS_ACTIVE).set(self.callers.len() as f64);
        removed
    }

    pub fn get(&self, id: &ClientId) -> Option<Arc<Caller>> {
        self.callers.get(id).map(|c| Arc::clone(c.value()))
    }

    pub fn send_to(&self, id: &ClientId, text: String) -> bool {
        match self.get(id) {
            Some(caller) => caller.send(text),
            None => {
                debug!(client_id = %id, "caller gone, dropping message");
                false
            }
        }
    }

    pub fn send_envelope(&self, id: &ClientId, envelope: &Envelope) -> bool {
        match envelope.to_json() {
            Ok(text) => self.send_to(id, text),
            Err(e) => {
                warn!(kind = %envelope.kind, error = %e, "failed to encode envelope");
                false
            }
        }
    }

    /// Send to every caller; returns how many accepted it.
    pub fn broadcast(&self, envelope: &Envelope) -> usize {
        let Ok(text) = envelope.to_json() else {
            return 0;
        };
        let callers: Vec<Arc<Caller>> =
            self.callers.iter().map(|c| Arc::clone(c.value())).collect();
        callers
            .iter()
            .filter(|caller| caller.send(text.clone()))
            .count()
    }

    pub fn touch(&self, id: &ClientId) {
        if let Some(caller) = self.callers.get(id) {
            caller.touch();
        }
    }

    /// Callers silent for longer than `timeout`.
    pub fn stale(&self, timeout: Duration) -> Vec<ClientId> {
        self.callers
            .iter()
            .filter(|c| c.idle_for() > timeout)
            .map(|c| c.key().clone())
            .collect()
    }

    pub fn count(&self) -> usize {
        self.callers.len()
    }

    pub fn contains(&self, id: &ClientId) -> bool {
        self.callers.contains_key(id)
    }
}
