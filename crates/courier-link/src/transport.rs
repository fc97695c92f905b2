//! Transport seam between a [`Connection`](crate::Connection) and the wire.

use std::time::Duration;

use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use url::Url;

/// Something that happened on an open link.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum TransportEvent {
    Message(String),
    Closed { code: Option<u16>, reason: String },
}

#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("invalid url: {0}")]
    InvalidUrl(String),
    #[error("connect failed: {0}")]
    Connect(String),
    #[error("connect timed out after {0:?}")]
    ConnectTimeout(Duration),
    #[error("send failed: {0}")]
    Send(String),
}

impl TransportError {
    pub fn error_kind(&self) -> &'static str {
        match self {
            Self::InvalidUrl(_) => "invalid_url",
            Self::Connect(_) => "connect",
            Self::ConnectTimeout(_) => "connect_timeout",
            Self::Send(_) => "send",
        }
    }
}

/// Opens links to a relay.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn open(&self, url: &str) -> Result<Box<dyn TransportLink>, TransportError>;
}

/// One open bidirectional text link.
///
/// `recv` must be cancel-safe: the connection driver races it against its
/// timers and drops the future whenever another branch wins.
#[async_trait]
pub trait TransportLink: Send {
    async fn send(&mut self, text: String) -> Result<(), TransportError>;
    /// `None` once the stream ended without a close frame.
    async fn recv(&mut self) -> Option<TransportEvent>;
    async fn close(&mut self, code: u16, reason: &str);
}

/// Append the endpoint identity and credential as query parameters.
pub fn endpoint_url(base: &str, id: &str, token: Option<&str>) -> Result<String, TransportError> {
    let mut url = Url::parse(base).map_err(|e| TransportError::InvalidUrl(format!("{base}: {e}")))?;
    {
        let mut query = url.query_pairs_mut();
        query.append_pair("id", id);
        if let Some(token) = token {
            query.append_pair("token", token);
        }
    }
    Ok(url.into())
}

/// WebSocket transport over `tokio-tungstenite`.
#[derive(Clone, Debug, Default)]
pub struct WsTransport;

#[async_trait]
impl Transport for WsTransport {
    async fn open(&self, url: &str) -> Result<Box<dyn TransportLink>, TransportError> {
        let (ws, _) = connect_async(url)
            .await
            .map_err(|e| TransportError::Connect(e.to_string()))?;
        Ok(Box::new(WsLink { ws }))
    }
}

struct WsLink {
    ws: WebSocketStream<MaybeTlsStream<TcpStream>>,
}

#[async_trait]
impl TransportLink for WsLink {
    async fn send(&mut self, text: String) -> Result<(), TransportError> {
        self.ws
            .send(Message::Text(text.into()))
            .await
            .map_err(|e| TransportError::Send(e.to_string()))
    }

    async fn recv(&mut self) -> Option<TransportEvent> {
        loop {
            match self.ws.next().await? {
                Ok(Message::Text(text)) => {
                    return Some(TransportEvent::Message(text.as_str().to_owned()))
                }
                Ok(Message::Binary(bytes)) => match String::from_utf8(bytes.to_vec()) {
                    Ok(text) => return Some(TransportEvent::Message(text)),
                    Err(_) => {
                        tracing::debug!(len = bytes.len(), "ignoring non-utf8 binary frame");
                    }
                },
                Ok(Message::Close(frame)) => {
                    let (code, reason) = frame
                        .map(|f| (Some(u16::from(f.code)), f.reason.as_str().to_owned()))
                        .unwrap_or((None, String::new()));
                    return Some(TransportEvent::Closed { code, reason });
                }
                // protocol ping/pong frames are answered by tungstenite
                Ok(_) => {}
                Err(e) => {
                    return Some(TransportEvent::Closed {
                        code: None,
                        reason: e.to_string(),
                    })
                }
            }
        }
    }

    async fn close(&mut self, code: u16, reason: &str) {
        let frame = CloseFrame {
            code: CloseCode::from(code),
            reason: reason.to_owned().into(),
        };
        if let Err(e) = self.ws.close(Some(frame)).await {
            tracing::debug!(error = %e, "close handshake failed");
        }
    }
}
