//! Pending request table keyed by correlation id.
//!
//! A request is issued through an [`Outbound`] sink, parked until a response
//! with the same correlation id arrives or its timeout fires, and removed from
//! the table exactly once either way.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tokio::sync::oneshot;
use tracing::debug;

use crate::envelope::Envelope;
use crate::errors::CorrelationError;
use crate::ids::{ClientId, CorrelationIdGenerator};

/// Somewhere an envelope can be written without waiting.
pub trait Outbound: Send + Sync {
    /// Returns `false` when the envelope could not be handed to the transport.
    fn send_envelope(&self, envelope: Envelope) -> bool;
}

type Resolution = Result<Envelope, CorrelationError>;

struct PendingRequest {
    /// Hub caller this request was issued for, if any.
    origin: Option<ClientId>,
    created_at: Instant,
    timeout: Duration,
    tx: oneshot::Sender<Resolution>,
}

/// Snapshot of one in-flight request.
#[derive(Clone, Debug)]
pub struct PendingInfo {
    pub correlation_id: String,
    pub origin: Option<ClientId>,
    pub age: Duration,
    pub timeout: Duration,
}

/// A request already on the wire, waiting for its response.
#[must_use = "an issued request stays pending until awaited or resolved"]
#[derive(Debug)]
pub struct Issued {
    correlation_id: String,
    timeout: Duration,
    rx: oneshot::Receiver<Resolution>,
}

impl Issued {
    pub fn correlation_id(&self) -> &str {
        &self.correlation_id
    }
}

pub struct Correlator {
    ids: CorrelationIdGenerator,
    pending: Mutex<HashMap<String, PendingRequest>>,
}

/// Removes the entry when the awaiting future finishes or is dropped.
struct PendingGuard<'a> {
    correlator: &'a Correlator,
    correlation_id: &'a str,
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        self.correlator.pending.lock().remove(self.correlation_id);
    }
}

impl Correlator {
    pub fn new(prefix: impl Into<String>) -> Self {
        Self {
            ids: CorrelationIdGenerator::new(prefix),
            pending: Mutex::new(HashMap::new()),
        }
    }

    /// Send `payload` tagged with a fresh correlation id and wait for the
    /// matching response.
    pub async fn issue(
        &self,
        outbound: &dyn Outbound,
        payload: Envelope,
        timeout: Duration,
    ) -> Result<Envelope, CorrelationError> {
        let issued = self.begin(outbound, payload, timeout, None)?;
        self.await_response(issued).await
    }

    /// Like [`Correlator::issue`], remembering which hub caller the request
    /// belongs to so it can be dropped with [`Correlator::cancel_origin`].
    pub async fn issue_for(
        &self,
        origin: ClientId,
        outbound: &dyn Outbound,
        payload: Envelope,
        timeout: Duration,
    ) -> Result<Envelope, CorrelationError> {
        let issued = self.begin(outbound, payload, timeout, Some(origin))?;
        self.await_response(issued).await
    }

    /// Register and send without waiting.
    ///
    /// Frames leave in the order `begin` is called, so a caller that needs
    /// per-sender ordering sends here and awaits elsewhere. A send failure
    /// leaves no entry behind.
    pub fn begin(
        &self,
        outbound: &dyn Outbound,
        payload: Envelope,
        timeout: Duration,
        origin: Option<ClientId>,
    ) -> Result<Issued, CorrelationError> {
        let correlation_id = self.ids.next_id();
        let (tx, rx) = oneshot::channel();
        let _ = self.pending.lock().insert(
            correlation_id.clone(),
            PendingRequest {
                origin,
                created_at: Instant::now(),
                timeout,
                tx,
            },
        );

        if !outbound.send_envelope(payload.with_correlation_id(correlation_id.clone())) {
            let _ = self.pending.lock().remove(&correlation_id);
            debug!(correlation_id = %correlation_id, "request not sent, link unavailable");
            return Err(CorrelationError::NotConnected);
        }
        Ok(Issued {
            correlation_id,
            timeout,
            rx,
        })
    }

    /// Wait for the response to a request started with [`Correlator::begin`].
    pub async fn await_response(&self, issued: Issued) -> Result<Envelope, CorrelationError> {
        let Issued {
            correlation_id,
            timeout,
            rx,
        } = issued;
        let _guard = PendingGuard {
            correlator: self,
            correlation_id: &correlation_id,
        };

        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(resolution)) => resolution,
            Ok(Err(_)) => Err(CorrelationError::Cancelled {
                correlation_id: correlation_id.clone(),
            }),
            Err(_) => {
                debug!(correlation_id = %correlation_id, ?timeout, "request timed out");
                Err(CorrelationError::Timeout {
                    correlation_id: correlation_id.clone(),
                    timeout,
                })
            }
        }
    }

    /// Deliver a response. Returns `false` for unknown or already settled ids.
    pub fn resolve(&self, correlation_id: &str, response: Envelope) -> bool {
        let Some(pending) = self.pending.lock().remove(correlation_id) else {
            return false;
        };
        let _ = pending.tx.send(Ok(response));
        true
    }

    /// Fail every in-flight request with [`CorrelationError::ConnectionLost`].
    pub fn fail_all(&self, reason: &str) -> usize {
        let drained: Vec<(String, PendingRequest)> = self.pending.lock().drain().collect();
        let count = drained.len();
        for (correlation_id, pending) in drained {
            let _ = pending.tx.send(Err(CorrelationError::ConnectionLost {
                correlation_id,
                reason: reason.to_string(),
            }));
        }
        count
    }

    /// Drop every request issued on behalf of `origin`.
    pub fn cancel_origin(&self, origin: &ClientId) -> usize {
        let cancelled: Vec<(String, PendingRequest)> = {
            let mut pending = self.pending.lock();
            let ids: Vec<String> = pending
                .iter()
                .filter(|(_, p)| p.origin.as_ref() == Some(origin))
                .map(|(id, _)| id.clone())
                .collect();
            ids.into_iter()
                .filter_map(|id| pending.remove(&id).map(|p| (id, p)))
                .collect()
        };
        let count = cancelled.len();
        for (correlation_id, pending) in cancelled {
            let _ = pending
                .tx
                .send(Err(CorrelationError::Cancelled { correlation_id }));
        }
        count
    }

    pub fn pending_count(&self) -> usize {
        self.pending.lock().len()
    }

    pub fn is_pending(&self, correlation_id: &str) -> bool {
        self.pending.lock().contains_key(correlation_id)
    }

    pub fn pending(&self) -> Vec<PendingInfo> {
        self.pending
            .lock()
            .iter()
            .map(|(id, p)| PendingInfo {
                correlation_id: id.clone(),
                origin: p.origin.clone(),
                age: p.created_at.elapsed(),
                timeout: p.timeout,
            })
            .collect()
    }
}
