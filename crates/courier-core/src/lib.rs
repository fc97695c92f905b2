//! # courier-core
//!
//! Shared protocol vocabulary for the courier relay.
//!
//! - **Envelope**: the JSON wire message `{kind, correlationId, ...fields}`
//! - **Branded IDs**: `ClientId`, `LinkId` and the correlation id generator
//! - **Errors**: `CorrelationError`, `ProtocolError` with classification helpers
//! - **Backoff**: reconnect scheduling with a hard attempt ceiling
//! - **Correlator**: pending request table matching responses by correlation id
//! - **Leadership**: deterministic primary selection among candidates

#![deny(unsafe_code)]

pub mod backoff;
pub mod correlator;
pub mod envelope;
pub mod errors;
pub mod ids;
pub mod leadership;
pub mod security;

pub use envelope::{close_code, Envelope};
pub use errors::{CorrelationError, ProtocolError};
