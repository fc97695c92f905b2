//! The single privileged endpoint link.

use std::sync::Arc;

use courier_core::correlator::Outbound;
use courier_core::ids::LinkId;
use courier_core::Envelope;
use courier_telemetry::metrics::{HUB_LINK_UP, HUB_SEND_DROPS_TOTAL};
use metrics::{counter, gauge};
use parking_lot::{Mutex, RwLock};
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{debug, warn};

/// What the link's socket writer should do next.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum LinkFrame {
    Text(String),
    Close { code: u16, reason: String },
}

pub struct LinkHandle {
    pub id: LinkId,
    /// Identity the endpoint announced in its `id` query parameter.
    pub endpoint_id: String,
    tx: mpsc::Sender<LinkFrame>,
    pub connected_at: Instant,
    last_seen: Mutex<Instant>,
}

impl LinkHandle {
    fn send(&self, frame: LinkFrame) -> bool {
        match self.tx.try_send(frame) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(_)) => {
                counter!(HUB_SEND_DROPS_TOTAL).increment(1);
                warn!(link_id = %self.id, "endpoint send queue full, dropping message");
                false
            }
            Err(mpsc::error::TrySendError::Closed(_)) => false,
        }
    }

    pub fn touch(&self) {
        *self.last_seen.lock() = Instant::now();
    }

    pub fn idle_for(&self) -> std::time::Duration {
        self.last_seen.lock().elapsed()
    }
}

/// Holds at most one live endpoint link. A newer link replaces the older.
pub struct LinkSlot {
    current: RwLock<Option<Arc<LinkHandle>>>,
    queue_capacity: usize,
}

impl LinkSlot {
    pub fn new(queue_capacity: usize) -> Self {
        Self {
            current: RwLock::new(None),
            queue_capacity: queue_capacity.max(1),
        }
    }

    /// Install a new link, returning its id, the writer's receiver and the
    /// link it displaced, if any.
    pub fn attach(
        &self,
        endpoint_id: impl Into<String>,
    ) -> (LinkId, mpsc::Receiver<LinkFrame>, Option<Arc<LinkHandle>>) {
        let (tx, rx) = mpsc::channel(self.queue_capacity);
        let now = Instant::now();
        let handle = Arc::new(LinkHandle {
            id: LinkId::new(),
            endpoint_id: endpoint_id.into(),
            tx,
            connected_at: now,
            last_seen: Mutex::new(now),
        });
        let id = handle.id.clone();
        let previous = self.current.write().replace(handle);
        gauge!(HUB_LINK_UP).set(1.0);
        (id, rx, previous)
    }

    /// Clear the slot if `id` still holds it.
    pub fn detach(&self, id: &LinkId) -> bool {
        let mut current = self.current.write();
        if current.as_ref().is_some_and(|h| &h.id == id) {
            *current = None;
            gauge!(HUB_LINK_UP).set(0.0);
            true
        } else {
            false
        }
    }

    pub fn current(&self) -> Option<Arc<LinkHandle>> {
        self.current.read().clone()
    }

    pub fn is_current(&self, id: &LinkId) -> bool {
        self.current.read().as_ref().is_some_and(|h| &h.id == id)
    }

    pub fn is_connected(&self) -> bool {
        self.current.read().is_some()
    }

    /// Ask a displaced link's writer to close it.
    pub fn close(handle: &LinkHandle, code: u16, reason: &str) {
        let _ = handle.send(LinkFrame::Close {
            code,
            reason: reason.to_owned(),
        });
    }
}

impl Outbound for LinkSlot {
    fn send_envelope(&self, envelope: Envelope) -> bool {
        let Some(handle) = self.current() else {
            debug!(kind = %envelope.kind, "no endpoint link");
            return false;
        };
        match envelope.to_json() {
            Ok(text) => handle.send(LinkFrame::Text(text)),
            Err(e) => {
                warn!(kind = %envelope.kind, error = %e, "failed to encode envelope");
                false
            }
        }
    }
}
