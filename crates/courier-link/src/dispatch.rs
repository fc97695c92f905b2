//! Kind-keyed handler registry with a failure boundary around every call.

use std::any::Any;
use std::collections::HashMap;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use courier_core::correlator::Outbound;
use courier_core::envelope::ERROR;
use courier_core::Envelope;
use courier_telemetry::metrics::{
    DISPATCH_DURATION_SECONDS, DISPATCH_ERRORS_TOTAL, DISPATCH_REQUESTS_TOTAL,
};
use futures::FutureExt;
use metrics::{counter, histogram};
use parking_lot::RwLock;
use tracing::{error, instrument, warn};

use crate::connection::{Connection, Subscriber};

/// Maximum time a single handler is allowed to run by default.
pub const DEFAULT_HANDLER_TIMEOUT: Duration = Duration::from_secs(60);

#[derive(Debug, thiserror::Error)]
pub enum HandlerError {
    #[error("{0}")]
    InvalidRequest(String),
    #[error("{0}")]
    NotFound(String),
    #[error("{0}")]
    Backend(String),
}

impl HandlerError {
    pub fn missing_field(field: &str) -> Self {
        Self::InvalidRequest(format!("Missing required field: {field}"))
    }

    pub fn error_kind(&self) -> &'static str {
        match self {
            Self::InvalidRequest(_) => "invalid_request",
            Self::NotFound(_) => "not_found",
            Self::Backend(_) => "backend",
        }
    }
}

/// What a handler uses to talk back.
#[derive(Clone)]
pub struct SendContext {
    outbound: Arc<dyn Outbound>,
    correlation_id: Option<String>,
}

impl SendContext {
    pub fn new(outbound: Arc<dyn Outbound>, correlation_id: Option<String>) -> Self {
        Self {
            outbound,
            correlation_id,
        }
    }

    pub fn correlation_id(&self) -> Option<&str> {
        self.correlation_id.as_deref()
    }

    /// Send an arbitrary envelope as-is.
    pub fn send(&self, envelope: Envelope) -> bool {
        self.outbound.send_envelope(envelope)
    }

    /// Send `envelope` tagged with the request's correlation id.
    pub fn reply(&self, mut envelope: Envelope) -> bool {
        envelope.correlation_id = self.correlation_id.clone();
        self.outbound.send_envelope(envelope)
    }
}

/// Trait implemented by every inbound request handler.
#[async_trait]
pub trait RequestHandler: Send + Sync {
    /// Handle one request, sending zero or more messages through `ctx`.
    async fn handle(&self, request: Envelope, ctx: &SendContext) -> Result<(), HandlerError>;

    /// Kind this handler answers with. Failures are reported under it too.
    fn response_kind(&self) -> Option<&str> {
        None
    }
}

/// Adapts an async closure into a [`RequestHandler`].
pub struct HandlerFn<F> {
    f: F,
    response_kind: Option<String>,
}

impl<F> HandlerFn<F> {
    pub fn new(f: F) -> Self {
        Self {
            f,
            response_kind: None,
        }
    }

    pub fn responding_as(mut self, kind: impl Into<String>) -> Self {
        self.response_kind = Some(kind.into());
        self
    }
}

#[async_trait]
impl<F, Fut> RequestHandler for HandlerFn<F>
where
    F: Fn(Envelope, SendContext) -> Fut + Send + Sync,
    Fut: Future<Output = Result<(), HandlerError>> + Send + 'static,
{
    async fn handle(&self, request: Envelope, ctx: &SendContext) -> Result<(), HandlerError> {
        (self.f)(request, ctx.clone()).await
    }

    fn response_kind(&self) -> Option<&str> {
        self.response_kind.as_deref()
    }
}

/// How a single dispatch ended.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum DispatchOutcome {
    Handled,
    /// Handler failed; one error response was sent.
    Failed(String),
    /// No handler; an `error` response was sent.
    UnknownKind,
    /// Reserved liveness kinds never reach handlers.
    Skipped,
}

/// Registry mapping message kinds to handlers.
pub struct DispatchTable {
    handlers: RwLock<HashMap<String, Arc<dyn RequestHandler>>>,
    handler_timeout: Duration,
}

impl DispatchTable {
    pub fn new() -> Self {
        Self::with_timeout(DEFAULT_HANDLER_TIMEOUT)
    }

    pub fn with_timeout(handler_timeout: Duration) -> Self {
        Self {
            handlers: RwLock::new(HashMap::new()),
            handler_timeout,
        }
    }

    /// Register a handler for a kind. Re-registering replaces it.
    pub fn register(&self, kind: &str, handler: impl RequestHandler + 'static) {
        let _ = self
            .handlers
            .write()
            .insert(kind.to_owned(), Arc::new(handler));
    }

    /// Run the handler for `request.kind`. Never propagates handler failure.
    #[instrument(skip_all, fields(kind = %request.kind, correlation_id = ?request.correlation_id))]
    pub async fn dispatch(
        &self,
        request: Envelope,
        outbound: Arc<dyn Outbound>,
    ) -> DispatchOutcome {
        if request.is_ping() || request.is_pong() {
            return DispatchOutcome::Skipped;
        }
        let kind = request.kind.clone();
        let correlation_id = request.correlation_id.clone();
        let ctx = SendContext::new(outbound, correlation_id.clone());

        let handler = self.handlers.read().get(&kind).cloned();
        let Some(handler) = handler else {
            counter!(DISPATCH_ERRORS_TOTAL, "kind" => "unknown", "error_type" => "unknown_kind")
                .increment(1);
            warn!("no handler for message kind");
            let _ = ctx.send(Envelope::error_response(
                ERROR,
                correlation_id,
                format!("Unknown message kind: {kind}"),
            ));
            return DispatchOutcome::UnknownKind;
        };
        counter!(DISPATCH_REQUESTS_TOTAL, "kind" => kind.clone()).increment(1);

        let start = Instant::now();
        let guarded = AssertUnwindSafe(handler.handle(request, &ctx)).catch_unwind();
        let failure = match tokio::time::timeout(self.handler_timeout, guarded).await {
            Ok(Ok(Ok(()))) => None,
            Ok(Ok(Err(err))) => {
                counter!(
                    DISPATCH_ERRORS_TOTAL,
                    "kind" => kind.clone(),
                    "error_type" => err.error_kind()
                )
                .increment(1);
                warn!(error = %err, "handler failed");
                Some(err.to_string())
            }
            Ok(Err(panic)) => {
                counter!(DISPATCH_ERRORS_TOTAL, "kind" => kind.clone(), "error_type" => "panic")
                    .increment(1);
                let message = panic_message(panic.as_ref());
                error!(panic = %message, "handler panicked");
                Some(format!("Handler panicked: {message}"))
            }
            Err(_elapsed) => {
                counter!(DISPATCH_ERRORS_TOTAL, "kind" => kind.clone(), "error_type" => "timeout")
                    .increment(1);
                error!("handler timed out after {:?}", self.handler_timeout);
                Some(format!("Handler for '{kind}' timed out"))
            }
        };
        histogram!(DISPATCH_DURATION_SECONDS, "kind" => kind.clone())
            .record(start.elapsed().as_secs_f64());

        match failure {
            None => DispatchOutcome::Handled,
            Some(message) => {
                let response_kind = handler.response_kind().unwrap_or(kind.as_str()).to_owned();
                let _ = ctx.send(Envelope::error_response(
                    response_kind,
                    correlation_id,
                    message.clone(),
                ));
                DispatchOutcome::Failed(message)
            }
        }
    }

    /// List all registered kinds (sorted).
    pub fn kinds(&self) -> Vec<String> {
        let mut names: Vec<String> = self.handlers.read().keys().cloned().collect();
        names.sort();
        names
    }

    pub fn has_kind(&self, kind: &str) -> bool {
        self.handlers.read().contains_key(kind)
    }
}

impl Default for DispatchTable {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Subscriber for DispatchTable {
    async fn on_message(&self, message: Envelope, connection: Connection) {
        let _ = self.dispatch(message, Arc::new(connection)).await;
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_owned()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_owned()
    }
}
