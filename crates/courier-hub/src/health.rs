//! `/health` endpoint.

use serde::Serialize;
use std::time::Instant;

/// Health check response body.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthResponse {
    /// `"healthy"` while an endpoint link is up, `"unhealthy"` otherwise.
    pub status: String,
    pub endpoint_connected: bool,
    pub callers: usize,
    pub pending_requests: usize,
    pub auth_enabled: bool,
    pub uptime_secs: u64,
}

/// Build a health response from live counters.
pub fn health_check(
    start_time: Instant,
    endpoint_connected: bool,
    callers: usize,
    pending_requests: usize,
    auth_enabled: bool,
) -> HealthResponse {
    HealthResponse {
        status: if endpoint_connected { "healthy" } else { "unhealthy" }.into(),
        endpoint_connected,
        callers,
        pending_requests,
        auth_enabled,
        uptime_secs: start_time.elapsed().as_secs(),
    }
}
