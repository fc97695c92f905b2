//! # courier-hub
//!
//! Server half of the relay. Many external callers share one privileged
//! endpoint link; each forwarded request gets an internal correlation id and
//! the response is routed back to the caller that asked.

#![deny(unsafe_code)]

pub mod client;
pub mod config;
pub mod errors;
pub mod health;
pub mod link;
pub mod metrics;
pub mod relay;
pub mod server;
pub mod shutdown;

pub use config::HubConfig;
pub use errors::HubError;
pub use relay::Hub;
pub use server::{start, ServerHandle};
