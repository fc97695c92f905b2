//! # courier-link
//!
//! The privileged side of the relay.
//!
//! - **Connection**: persistent relay link with reconnect and keep-alive
//! - **Dispatch**: kind-keyed request handlers behind a failure boundary
//! - **Endpoint**: leadership-gated connection plus its dispatch table
//! - **Documents**: the CRUD collaborator the entity handlers call into

#![deny(unsafe_code)]

pub mod connection;
pub mod dispatch;
pub mod documents;
pub mod endpoint;
pub mod handlers;
pub mod transport;

#[cfg(test)]
mod testing;

pub use connection::{Connection, ConnectionConfig, ConnectionState, FnSubscriber, Subscriber};
pub use dispatch::{
    DispatchOutcome, DispatchTable, HandlerError, HandlerFn, RequestHandler, SendContext,
};
pub use documents::{Document, DocumentError, DocumentStore, MemoryStore};
pub use endpoint::{Endpoint, EndpointConfig};
pub use transport::{Transport, TransportError, WsTransport};
