//! In-memory transport for driving a `Connection` in tests.

use std::collections::VecDeque;
use std::sync::Arc;

use async_trait::async_trait;
use courier_core::Envelope;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::time::Instant;

use crate::transport::{Transport, TransportError, TransportEvent, TransportLink};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum OpenBehavior {
    Accept,
    Fail,
    /// Never completes; exercises the establishment timeout.
    Hang,
}

#[derive(Default)]
struct MockState {
    script: VecDeque<OpenBehavior>,
    default: Option<OpenBehavior>,
    attempts: Vec<Instant>,
}

/// Hands one [`MockPeer`] to the test per accepted open.
#[derive(Clone)]
pub struct MockTransport {
    state: Arc<Mutex<MockState>>,
    peers: mpsc::UnboundedSender<MockPeer>,
}

impl MockTransport {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<MockPeer>) {
        let (peers, rx) = mpsc::unbounded_channel();
        (
            Self {
                state: Arc::new(Mutex::new(MockState::default())),
                peers,
            },
            rx,
        )
    }

    /// Queue behaviours for the next opens; afterwards the default applies.
    pub fn script(&self, behaviors: impl IntoIterator<Item = OpenBehavior>) {
        self.state.lock().script.extend(behaviors);
    }

    pub fn set_default(&self, behavior: OpenBehavior) {
        self.state.lock().default = Some(behavior);
    }

    pub fn attempts(&self) -> Vec<Instant> {
        self.state.lock().attempts.clone()
    }
}

#[async_trait]
impl Transport for MockTransport {
    async fn open(&self, _url: &str) -> Result<Box<dyn TransportLink>, TransportError> {
        let behavior = {
            let mut state = self.state.lock();
            state.attempts.push(Instant::now());
            let default = state.default.unwrap_or(OpenBehavior::Accept);
            state.script.pop_front().unwrap_or(default)
        };
        match behavior {
            OpenBehavior::Accept => {
                let (to_link, link_rx) = mpsc::unbounded_channel();
                let (link_tx, from_link) = mpsc::unbounded_channel();
                let (close_tx, closes) = mpsc::unbounded_channel();
                let _ = self.peers.send(MockPeer {
                    to_link,
                    from_link,
                    closes,
                });
                Ok(Box::new(MockLink {
                    rx: link_rx,
                    tx: link_tx,
                    close_tx,
                }))
            }
            OpenBehavior::Fail => Err(TransportError::Connect("connection refused".into())),
            OpenBehavior::Hang => std::future::pending().await,
        }
    }
}

struct MockLink {
    rx: mpsc::UnboundedReceiver<TransportEvent>,
    tx: mpsc::UnboundedSender<String>,
    close_tx: mpsc::UnboundedSender<(u16, String)>,
}

#[async_trait]
impl TransportLink for MockLink {
    async fn send(&mut self, text: String) -> Result<(), TransportError> {
        self.tx
            .send(text)
            .map_err(|_| TransportError::Send("peer gone".into()))
    }

    async fn recv(&mut self) -> Option<TransportEvent> {
        self.rx.recv().await
    }

    async fn close(&mut self, code: u16, reason: &str) {
        let _ = self.close_tx.send((code, reason.to_owned()));
    }
}

/// The relay's side of one accepted mock link.
pub struct MockPeer {
    to_link: mpsc::UnboundedSender<TransportEvent>,
    from_link: mpsc::UnboundedReceiver<String>,
    closes: mpsc::UnboundedReceiver<(u16, String)>,
}

impl MockPeer {
    pub fn push_text(&self, text: &str) {
        let _ = self.to_link.send(TransportEvent::Message(text.to_owned()));
    }

    pub fn push(&self, envelope: &Envelope) {
        self.push_text(&envelope.to_json().unwrap());
    }

    pub fn close(&self, code: u16) {
        let _ = self.to_link.send(TransportEvent::Closed {
            code: Some(code),
            reason: String::new(),
        });
    }

    pub async fn next(&mut self) -> Option<Envelope> {
        let text = self.from_link.recv().await?;
        Some(Envelope::parse(&text).unwrap())
    }

    pub fn try_next(&mut self) -> Option<Envelope> {
        let text = self.from_link.try_recv().ok()?;
        Some(Envelope::parse(&text).unwrap())
    }

    pub async fn closed(&mut self) -> Option<(u16, String)> {
        self.closes.recv().await
    }
}
