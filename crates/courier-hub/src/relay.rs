//! Request multiplexing between callers and the privileged link.
//!
//! Callers tag requests with their own `requestId`. The hub never forwards
//! that id: every request gets a fresh internal correlation id from the
//! hub's [`Correlator`], and the caller's id is restored on the response.

use std::sync::Arc;
use std::time::Instant;

use courier_core::correlator::{Correlator, Outbound};
use courier_core::envelope::ERROR;
use courier_core::ids::{ClientId, LinkId};
use courier_core::{close_code, CorrelationError, Envelope};
use courier_telemetry::metrics::{
    HUB_PENDING_REQUESTS, HUB_REQUESTS_TOTAL, HUB_REQUEST_DURATION_SECONDS,
    HUB_REQUEST_FAILURES_TOTAL, LINK_DECODE_ERRORS_TOTAL,
};
use metrics::{counter, gauge, histogram};
use serde_json::Value;
use tokio::sync::mpsc;
use tracing::{debug, info, instrument, warn};

use crate::client::CallerRegistry;
use crate::config::HubConfig;
use crate::health::{health_check, HealthResponse};
use crate::link::{LinkFrame, LinkSlot};

/// Prefix of internal correlation ids, e.g. `relay-7-1718000000000`.
pub const RELAY_ID_PREFIX: &str = "relay";

/// Field callers use for their own request ids.
pub const REQUEST_ID: &str = "requestId";

const LINK_LOST: &str = "Connection to endpoint lost";
const LINK_REPLACED: &str = "Replaced by a newer endpoint connection";

pub struct Hub {
    config: HubConfig,
    callers: CallerRegistry,
    link: LinkSlot,
    correlator: Correlator,
    started_at: Instant,
}

impl Hub {
    pub fn new(config: HubConfig) -> Self {
        Self {
            callers: CallerRegistry::new(config.max_send_queue),
            link: LinkSlot::new(config.max_send_queue),
            correlator: Correlator::new(RELAY_ID_PREFIX),
            started_at: Instant::now(),
            config,
        }
    }

    pub fn config(&self) -> &HubConfig {
        &self.config
    }

    pub fn callers(&self) -> &CallerRegistry {
        &self.callers
    }

    pub fn link(&self) -> &LinkSlot {
        &self.link
    }

    pub fn endpoint_connected(&self) -> bool {
        self.link.is_connected()
    }

    pub fn pending_requests(&self) -> usize {
        self.correlator.pending_count()
    }

    pub fn health(&self) -> HealthResponse {
        health_check(
            self.started_at,
            self.endpoint_connected(),
            self.callers.count(),
            self.pending_requests(),
            self.config.auth_required(),
        )
    }

    // -- callers --

    /// Register a caller and queue its welcome message.
    pub fn connect_caller(&self) -> (ClientId, mpsc::Receiver<String>) {
        let (id, rx) = self.callers.register();
        let welcome = Envelope::new("welcome")
            .with_field("connected", self.endpoint_connected())
            .with_field("authRequired", self.config.auth_required());
        let _ = self.callers.send_envelope(&id, &welcome);
        info!(client_id = %id, callers = self.callers.count(), "caller connected");
        (id, rx)
    }

    /// Forget a caller and drop whatever it still had in flight.
    pub fn disconnect_caller(&self, id: &ClientId) {
        let was_registered = self.callers.unregister(id);
        let cancelled = self.correlator.cancel_origin(id);
        self.record_pending();
        if was_registered || cancelled > 0 {
            info!(client_id = %id, cancelled, "caller disconnected");
        }
    }

    /// Handle one text frame from a caller.
    pub fn handle_caller_text(self: &Arc<Self>, caller: &ClientId, text: &str) {
        self.callers.touch(caller);
        let mut envelope = match Envelope::parse(text) {
            Ok(envelope) => envelope,
            Err(e) => {
                debug!(client_id = %caller, error = %e, "undecodable caller message");
                let _ = self.callers.send_envelope(
                    caller,
                    &caller_error(None, format!("Invalid message: {e}")),
                );
                return;
            }
        };
        if envelope.is_ping() {
            let _ = self.callers.send_envelope(caller, &Envelope::pong());
            return;
        }
        if envelope.is_pong() {
            return;
        }

        let request_id = envelope
            .take_field(REQUEST_ID)
            .or_else(|| envelope.correlation_id.take().map(Value::String));
        self.forward(caller, request_id, envelope);
    }

    /// Put the request on the link now, in arrival order, and await the
    /// response on a separate task.
    #[instrument(skip_all, fields(client_id = %caller, kind = %payload.kind))]
    fn forward(
        self: &Arc<Self>,
        caller: &ClientId,
        request_id: Option<Value>,
        payload: Envelope,
    ) {
        let kind = payload.kind.clone();
        counter!(HUB_REQUESTS_TOTAL, "kind" => kind.clone()).increment(1);
        let start = Instant::now();

        let issued = self.correlator.begin(
            &self.link,
            payload,
            self.config.request_timeout,
            Some(caller.clone()),
        );
        self.record_pending();
        let issued = match issued {
            Ok(issued) => issued,
            Err(err) => {
                self.fail_request(caller, &kind, request_id, &err);
                return;
            }
        };

        let hub = Arc::clone(self);
        let caller = caller.clone();
        let _ = tokio::spawn(async move {
            let result = hub.correlator.await_response(issued).await;
            histogram!(HUB_REQUEST_DURATION_SECONDS, "kind" => kind.clone())
                .record(start.elapsed().as_secs_f64());
            hub.record_pending();
            hub.deliver(&caller, &kind, request_id, result);
        });
    }

    fn deliver(
        &self,
        caller: &ClientId,
        kind: &str,
        request_id: Option<Value>,
        result: Result<Envelope, CorrelationError>,
    ) {
        match result {
            Ok(mut response) => {
                response.correlation_id = None;
                if let Some(id) = request_id {
                    let _ = response.fields.insert(REQUEST_ID.to_owned(), id);
                }
                let _ = self.callers.send_envelope(caller, &response);
            }
            Err(CorrelationError::Cancelled { correlation_id }) => {
                debug!(correlation_id, "request cancelled, caller gone");
            }
            Err(err) => self.fail_request(caller, kind, request_id, &err),
        }
    }

    fn fail_request(
        &self,
        caller: &ClientId,
        kind: &str,
        request_id: Option<Value>,
        err: &CorrelationError,
    ) {
        counter!(
            HUB_REQUEST_FAILURES_TOTAL,
            "kind" => kind.to_owned(),
            "error_type" => err.error_kind()
        )
        .increment(1);
        warn!(client_id = %caller, kind, error = %err, "request failed");
        let message = self.failure_message(err);
        let _ = self
            .callers
            .send_envelope(caller, &caller_error(request_id, message));
    }

    fn failure_message(&self, err: &CorrelationError) -> String {
        match err {
            CorrelationError::NotConnected => "Not connected to endpoint".to_owned(),
            CorrelationError::Timeout { timeout, .. } => {
                format!("No response within {} ms", timeout.as_millis())
            }
            CorrelationError::ConnectionLost { reason, .. } => reason.clone(),
            CorrelationError::Cancelled { .. } => "Request cancelled".to_owned(),
        }
    }

    fn record_pending(&self) {
        gauge!(HUB_PENDING_REQUESTS).set(self.correlator.pending_count() as f64);
    }

    // -- privileged link --

    /// Install a new endpoint link. A previous link is closed normally and
    /// everything it still owed fails at once.
    pub fn attach_link(&self, endpoint_id: &str) -> (LinkId, mpsc::Receiver<LinkFrame>) {
        let (id, rx, previous) = self.link.attach(endpoint_id);
        if let Some(previous) = previous {
            let failed = self.correlator.fail_all(LINK_LOST);
            warn!(
                old_link = %previous.id,
                endpoint_id = %previous.endpoint_id,
                failed,
                "endpoint link replaced"
            );
            LinkSlot::close(&previous, close_code::NORMAL, LINK_REPLACED);
        }
        info!(link_id = %id, endpoint_id, "endpoint connected");
        let _ = self.callers.broadcast(
            &Envelope::new("connected").with_field("message", "Connected to endpoint"),
        );
        (id, rx)
    }

    /// The link's socket went away. No-op for links already replaced.
    pub fn detach_link(&self, id: &LinkId) {
        if !self.link.detach(id) {
            return;
        }
        let failed = self.correlator.fail_all(LINK_LOST);
        self.record_pending();
        warn!(link_id = %id, failed, "endpoint disconnected");
        let _ = self.callers.broadcast(
            &Envelope::new("connection-lost").with_field("message", "Lost connection to endpoint"),
        );
    }

    /// Handle one text frame from the endpoint.
    pub fn handle_link_text(&self, link: &LinkId, text: &str) {
        let Some(handle) = self.link.current().filter(|h| &h.id == link) else {
            debug!(link_id = %link, "frame from a replaced link, ignoring");
            return;
        };
        handle.touch();

        let envelope = match Envelope::parse(text) {
            Ok(envelope) => envelope,
            Err(e) => {
                counter!(LINK_DECODE_ERRORS_TOTAL).increment(1);
                warn!(error = %e, kind = e.error_kind(), "dropping undecodable endpoint message");
                return;
            }
        };
        if envelope.is_ping() {
            let _ = self.link.send_envelope(Envelope::pong());
            return;
        }
        if envelope.is_pong() {
            return;
        }

        match envelope.correlation_id.clone() {
            Some(id) => {
                if !self.correlator.resolve(&id, envelope) {
                    debug!(correlation_id = %id, "no pending request for response, dropping");
                }
            }
            // uncorrelated messages are endpoint notices for every caller
            None => {
                let _ = self.callers.broadcast(&envelope);
            }
        }
    }

    pub fn touch_link(&self, link: &LinkId) {
        if let Some(handle) = self.link.current().filter(|h| &h.id == link) {
            handle.touch();
        }
    }

    /// Drop callers and the link once they've been silent past the client
    /// timeout. Returns how many connections were dropped.
    pub fn sweep_stale(&self) -> usize {
        let timeout = self.config.client_timeout;
        let stale = self.callers.stale(timeout);
        for id in &stale {
            info!(client_id = %id, "dropping unresponsive caller");
            self.disconnect_caller(id);
        }
        let mut dropped = stale.len();

        if let Some(handle) = self.link.current().filter(|h| h.idle_for() > timeout) {
            warn!(link_id = %handle.id, "endpoint link unresponsive, dropping");
            LinkSlot::close(&handle, close_code::GOING_AWAY, "Heartbeat timeout");
            self.detach_link(&handle.id);
            dropped += 1;
        }
        dropped
    }
}

/// `{ "kind": "error", "requestId": ..., "error": ... }`
fn caller_error(request_id: Option<Value>, message: impl Into<String>) -> Envelope {
    let mut envelope = Envelope::error_response(ERROR, None, message);
    if let Some(id) = request_id {
        let _ = envelope.fields.insert(REQUEST_ID.to_owned(), id);
    }
    envelope
}
