//! One persistent link to the relay with reconnect and keep-alive.
//!
//! [`Connection`] is a cheap handle. All transport state lives in a driver
//! task that owns the link, the timers and the reconnect policy, and is fed
//! through channels.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Weak};
use std::time::Duration;

use async_trait::async_trait;
use courier_core::backoff::{BackoffConfig, ReconnectPolicy};
use courier_core::correlator::{Correlator, Outbound};
use courier_core::{close_code, CorrelationError, Envelope};
use courier_settings::LinkSettings;
use courier_telemetry::metrics::{LINK_DECODE_ERRORS_TOTAL, LINK_RECONNECTS_TOTAL};
use metrics::counter;
use parking_lot::{Mutex, RwLock};
use tokio::sync::{mpsc, watch};
use tokio::time::{Instant, Interval, MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::transport::{endpoint_url, Transport, TransportError, TransportEvent, TransportLink};

/// Outbound frames accepted while open but not yet written.
const SEND_QUEUE_CAPACITY: usize = 256;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ConnectionState {
    Closed,
    Connecting,
    Open,
    Closing,
}

#[derive(Clone, Debug)]
pub struct ConnectionConfig {
    /// Fully formed relay URL, credentials included.
    pub url: String,
    pub connect_timeout: Duration,
    pub ping_interval: Duration,
    pub backoff: BackoffConfig,
    /// Prefix for correlation ids issued by [`Connection::request`].
    pub id_prefix: String,
}

impl ConnectionConfig {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            connect_timeout: Duration::from_secs(5),
            ping_interval: Duration::from_secs(30),
            backoff: BackoffConfig::default(),
            id_prefix: "req".to_string(),
        }
    }

    pub fn from_settings(settings: &LinkSettings) -> Result<Self, TransportError> {
        let url = endpoint_url(
            &settings.relay_url,
            &settings.endpoint_id,
            settings.api_key.as_deref(),
        )?;
        Ok(Self {
            url,
            connect_timeout: settings.connect_timeout(),
            ping_interval: settings.ping_interval(),
            backoff: BackoffConfig {
                base_delay: settings.reconnect_base_delay(),
                max_delay: settings.reconnect_max_delay(),
                max_attempts: settings.max_reconnect_attempts,
            },
            id_prefix: "req".to_string(),
        })
    }
}

/// Receives inbound envelopes of a subscribed kind.
#[async_trait]
pub trait Subscriber: Send + Sync {
    async fn on_message(&self, message: Envelope, connection: Connection);
}

/// Adapts an async closure into a [`Subscriber`].
pub struct FnSubscriber<F>(pub F);

#[async_trait]
impl<F, Fut> Subscriber for FnSubscriber<F>
where
    F: Fn(Envelope, Connection) -> Fut + Send + Sync,
    Fut: Future<Output = ()> + Send + 'static,
{
    async fn on_message(&self, message: Envelope, connection: Connection) {
        (self.0)(message, connection).await;
    }
}

#[derive(Default)]
struct Subscriptions {
    by_kind: RwLock<HashMap<String, Arc<dyn Subscriber>>>,
    fallback: RwLock<Option<Arc<dyn Subscriber>>>,
}

impl Subscriptions {
    fn route(&self, kind: &str) -> Option<Arc<dyn Subscriber>> {
        self.by_kind
            .read()
            .get(kind)
            .cloned()
            .or_else(|| self.fallback.read().clone())
    }
}

/// State shared by the handle and the driver.
struct Shared {
    subscriptions: Subscriptions,
    correlator: Correlator,
    last_activity: Mutex<Option<Instant>>,
}

impl Shared {
    fn touch(&self) {
        *self.last_activity.lock() = Some(Instant::now());
    }
}

enum Command {
    Connect,
    Disconnect,
}

struct Inner {
    commands: mpsc::UnboundedSender<Command>,
    outbound: mpsc::Sender<String>,
    state: watch::Receiver<ConnectionState>,
    shared: Arc<Shared>,
}

/// Handle to a relay connection. Clones share one link.
#[derive(Clone)]
pub struct Connection {
    inner: Arc<Inner>,
}

impl Connection {
    /// Create the connection in the `Closed` state. Must be called within a
    /// tokio runtime; nothing is opened until [`Connection::connect`].
    pub fn new(transport: Arc<dyn Transport>, config: ConnectionConfig) -> Self {
        let (commands, command_rx) = mpsc::unbounded_channel();
        let (outbound, outbound_rx) = mpsc::channel(SEND_QUEUE_CAPACITY);
        let (state_tx, state) = watch::channel(ConnectionState::Closed);
        let shared = Arc::new(Shared {
            subscriptions: Subscriptions::default(),
            correlator: Correlator::new(config.id_prefix.clone()),
            last_activity: Mutex::new(None),
        });
        let inner = Arc::new(Inner {
            commands,
            outbound,
            state,
            shared: shared.clone(),
        });

        let driver = Driver {
            policy: ReconnectPolicy::new(config.backoff.clone()),
            transport,
            config,
            command_rx,
            outbound_rx,
            state_tx,
            shared,
            handle: Arc::downgrade(&inner),
            wanted: false,
            link: None,
            opening: None,
            reconnect_at: None,
            keepalive: None,
        };
        let _ = tokio::spawn(driver.run());

        Self { inner }
    }

    /// Open the link. No-op while open or connecting. Also restores an
    /// exhausted reconnect budget.
    pub fn connect(&self) {
        let _ = self.inner.commands.send(Command::Connect);
    }

    /// Close with the normal code and stop reconnecting.
    pub fn disconnect(&self) {
        let _ = self.inner.commands.send(Command::Disconnect);
    }

    /// Queue `envelope` for transmission. Returns `false` unless the link is
    /// open; nothing is buffered while disconnected.
    pub fn send(&self, envelope: Envelope) -> bool {
        if !self.is_connected() {
            return false;
        }
        let text = match envelope.to_json() {
            Ok(text) => text,
            Err(e) => {
                warn!(kind = %envelope.kind, error = %e, "failed to encode envelope");
                return false;
            }
        };
        match self.inner.outbound.try_send(text) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(_)) => {
                warn!(kind = %envelope.kind, "send queue full, dropping message");
                false
            }
            Err(mpsc::error::TrySendError::Closed(_)) => false,
        }
    }

    /// Resolves once the connection reports `Closed`.
    pub async fn wait_closed(&self) {
        let mut state = self.subscribe_state();
        let _ = state.wait_for(|s| *s == ConnectionState::Closed).await;
    }

    pub fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Open
    }

    pub fn state(&self) -> ConnectionState {
        *self.inner.state.borrow()
    }

    pub fn subscribe_state(&self) -> watch::Receiver<ConnectionState> {
        self.inner.state.clone()
    }

    /// Route inbound envelopes of `kind` to `subscriber`, replacing any
    /// previous subscription for that kind.
    pub fn subscribe(&self, kind: impl Into<String>, subscriber: Arc<dyn Subscriber>) {
        let _ = self
            .inner
            .shared
            .subscriptions
            .by_kind
            .write()
            .insert(kind.into(), subscriber);
    }

    pub fn unsubscribe(&self, kind: &str) -> bool {
        self.inner
            .shared
            .subscriptions
            .by_kind
            .write()
            .remove(kind)
            .is_some()
    }

    /// Receives every kind without a dedicated subscription.
    pub fn set_fallback(&self, subscriber: Arc<dyn Subscriber>) {
        *self.inner.shared.subscriptions.fallback.write() = Some(subscriber);
    }

    /// Send `payload` with a fresh correlation id and await the reply.
    pub async fn request(
        &self,
        payload: Envelope,
        timeout: Duration,
    ) -> Result<Envelope, CorrelationError> {
        self.inner
            .shared
            .correlator
            .issue(self, payload, timeout)
            .await
    }

    pub fn pending_requests(&self) -> usize {
        self.inner.shared.correlator.pending_count()
    }

    /// When anything was last received on the current link.
    pub fn last_activity(&self) -> Option<Instant> {
        *self.inner.shared.last_activity.lock()
    }
}

impl Outbound for Connection {
    fn send_envelope(&self, envelope: Envelope) -> bool {
        self.send(envelope)
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("state", &self.state())
            .finish()
    }
}

type OpenFuture =
    Pin<Box<dyn Future<Output = Result<Box<dyn TransportLink>, TransportError>> + Send>>;

struct Driver {
    transport: Arc<dyn Transport>,
    config: ConnectionConfig,
    command_rx: mpsc::UnboundedReceiver<Command>,
    outbound_rx: mpsc::Receiver<String>,
    state_tx: watch::Sender<ConnectionState>,
    shared: Arc<Shared>,
    handle: Weak<Inner>,
    policy: ReconnectPolicy,
    /// Cleared by an explicit disconnect; gates every reconnect.
    wanted: bool,
    link: Option<Box<dyn TransportLink>>,
    opening: Option<OpenFuture>,
    reconnect_at: Option<Instant>,
    keepalive: Option<Interval>,
}

impl Driver {
    async fn run(mut self) {
        loop {
            tokio::select! {
                command = self.command_rx.recv() => match command {
                    Some(Command::Connect) => self.on_connect(),
                    Some(Command::Disconnect) => self.on_disconnect().await,
                    None => {
                        self.on_disconnect().await;
                        break;
                    }
                },
                Some(text) = self.outbound_rx.recv(), if self.link.is_some() => {
                    self.transmit(text).await;
                }
                result = poll_opening(&mut self.opening) => {
                    self.opening = None;
                    self.on_open_result(result).await;
                }
                event = recv_event(&mut self.link) => self.on_event(event).await,
                () = sleep_until(self.reconnect_at) => {
                    self.reconnect_at = None;
                    self.begin_open();
                }
                () = tick(&mut self.keepalive) => {
                    self.transmit_envelope(&Envelope::ping()).await;
                }
            }
        }
        debug!("connection driver stopped");
    }

    fn set_state(&self, state: ConnectionState) {
        let _ = self.state_tx.send_replace(state);
    }

    fn on_connect(&mut self) {
        if self.link.is_some() || self.opening.is_some() {
            debug!("connect ignored, already open or connecting");
            return;
        }
        self.wanted = true;
        self.policy.reset();
        self.reconnect_at = None;
        self.begin_open();
    }

    fn begin_open(&mut self) {
        if !self.wanted {
            return;
        }
        self.set_state(ConnectionState::Connecting);
        let transport = self.transport.clone();
        let url = self.config.url.clone();
        let limit = self.config.connect_timeout;
        self.opening = Some(Box::pin(async move {
            match tokio::time::timeout(limit, transport.open(&url)).await {
                Ok(result) => result,
                Err(_) => Err(TransportError::ConnectTimeout(limit)),
            }
        }));
    }

    async fn on_open_result(&mut self, result: Result<Box<dyn TransportLink>, TransportError>) {
        match result {
            Ok(link) => {
                self.link = Some(link);
                self.policy.reset();
                self.shared.touch();
                self.drain_outbound();
                self.set_state(ConnectionState::Open);
                info!("connected to relay");

                let period = self.config.ping_interval;
                let mut keepalive = tokio::time::interval_at(Instant::now() + period, period);
                keepalive.set_missed_tick_behavior(MissedTickBehavior::Delay);
                self.keepalive = Some(keepalive);
                self.transmit_envelope(&Envelope::ping()).await;
            }
            Err(e) => {
                warn!(error = %e, kind = e.error_kind(), "failed to open relay link");
                self.set_state(ConnectionState::Closed);
                self.schedule_reconnect();
            }
        }
    }

    async fn on_disconnect(&mut self) {
        self.wanted = false;
        self.opening = None;
        self.reconnect_at = None;
        self.keepalive = None;
        self.policy.reset();
        if let Some(mut link) = self.link.take() {
            self.set_state(ConnectionState::Closing);
            link.close(close_code::NORMAL, "client disconnect").await;
            info!("disconnected from relay");
        }
        self.set_state(ConnectionState::Closed);
        self.drain_outbound();
    }

    async fn on_event(&mut self, event: Option<TransportEvent>) {
        match event {
            Some(TransportEvent::Message(text)) => self.on_text(text).await,
            Some(TransportEvent::Closed { code, reason }) => self.on_closed(code, &reason),
            None => self.on_closed(None, "stream ended"),
        }
    }

    async fn on_text(&mut self, text: String) {
        self.shared.touch();
        let envelope = match Envelope::parse(&text) {
            Ok(envelope) => envelope,
            Err(e) => {
                counter!(LINK_DECODE_ERRORS_TOTAL).increment(1);
                warn!(error = %e, kind = e.error_kind(), "dropping undecodable message");
                return;
            }
        };

        if envelope.is_ping() {
            self.transmit_envelope(&Envelope::pong()).await;
            return;
        }
        if envelope.is_pong() {
            return;
        }

        if let Some(id) = envelope.correlation_id.clone() {
            if self.shared.correlator.is_pending(&id) {
                let _ = self.shared.correlator.resolve(&id, envelope);
                return;
            }
        }

        let Some(subscriber) = self.shared.subscriptions.route(&envelope.kind) else {
            debug!(kind = %envelope.kind, "no subscriber for message kind, dropping");
            return;
        };
        let Some(inner) = self.handle.upgrade() else {
            return;
        };
        let connection = Connection { inner };
        let _ = tokio::spawn(async move {
            subscriber.on_message(envelope, connection).await;
        });
    }

    fn on_closed(&mut self, code: Option<u16>, reason: &str) {
        self.link = None;
        self.keepalive = None;
        self.set_state(ConnectionState::Closed);
        self.drain_outbound();
        info!(?code, reason, "relay link closed");

        match code {
            Some(close_code::NORMAL) => {}
            Some(close_code::POLICY_VIOLATION) => {
                warn!("relay rejected credentials, not reconnecting");
            }
            _ => self.schedule_reconnect(),
        }
    }

    fn schedule_reconnect(&mut self) {
        if !self.wanted {
            return;
        }
        match self.policy.next_delay() {
            Some(delay) => {
                counter!(LINK_RECONNECTS_TOTAL).increment(1);
                info!(
                    attempt = self.policy.attempts(),
                    max_attempts = self.policy.config().max_attempts,
                    delay_ms = delay.as_millis() as u64,
                    "scheduling reconnect"
                );
                self.reconnect_at = Some(Instant::now() + delay);
            }
            None => {
                warn!(
                    attempts = self.policy.config().max_attempts,
                    "max reconnect attempts reached, giving up"
                );
            }
        }
    }

    async fn transmit_envelope(&mut self, envelope: &Envelope) {
        match envelope.to_json() {
            Ok(text) => self.transmit(text).await,
            Err(e) => warn!(kind = %envelope.kind, error = %e, "failed to encode envelope"),
        }
    }

    async fn transmit(&mut self, text: String) {
        let Some(link) = self.link.as_mut() else {
            return;
        };
        if let Err(e) = link.send(text).await {
            warn!(error = %e, "send failed, treating link as closed");
            self.on_closed(None, "send failed");
        }
    }

    /// Frames queued against a link that is gone are never replayed.
    fn drain_outbound(&mut self) {
        let mut dropped = 0usize;
        while self.outbound_rx.try_recv().is_ok() {
            dropped += 1;
        }
        if dropped > 0 {
            debug!(dropped, "discarded frames queued for a closed link");
        }
    }
}

async fn poll_opening(
    opening: &mut Option<OpenFuture>,
) -> Result<Box<dyn TransportLink>, TransportError> {
    match opening {
        Some(fut) => fut.await,
        None => std::future::pending().await,
    }
}

async fn recv_event(link: &mut Option<Box<dyn TransportLink>>) -> Option<TransportEvent> {
    match link {
        Some(link) => link.recv().await,
        None => std::future::pending().await,
    }
}

async fn sleep_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

async fn tick(interval: &mut Option<Interval>) {
    match interval {
        Some(interval) => {
            let _ = interval.tick().await;
        }
        None => std::future::pending().await,
    }
}
