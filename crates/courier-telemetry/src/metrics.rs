// Metric name constants to avoid typos across crates.

/// Dispatched handler invocations (counter, labels: kind).
pub const DISPATCH_REQUESTS_TOTAL: &str = "dispatch_requests_total";
/// Handler failures (counter, labels: kind, error_type).
pub const DISPATCH_ERRORS_TOTAL: &str = "dispatch_errors_total";
/// Handler duration seconds (histogram, labels: kind).
pub const DISPATCH_DURATION_SECONDS: &str = "dispatch_duration_seconds";
/// Inbound frames that failed to decode (counter).
pub const LINK_DECODE_ERRORS_TOTAL: &str = "link_decode_errors_total";
/// Reconnects scheduled (counter).
pub const LINK_RECONNECTS_TOTAL: &str = "link_reconnects_total";
/// Hub requests forwarded to the endpoint (counter).
pub const HUB_REQUESTS_TOTAL: &str = "hub_requests_total";
/// Hub requests that ended without a response (counter, labels: error_type).
pub const HUB_REQUEST_FAILURES_TOTAL: &str = "hub_request_failures_total";
/// Hub request round-trip seconds (histogram).
pub const HUB_REQUEST_DURATION_SECONDS: &str = "hub_request_duration_seconds";
/// Hub requests awaiting a response (gauge).
pub const HUB_PENDING_REQUESTS: &str = "hub_pending_requests";
/// Connected callers (gauge).
pub const HUB_CALLERS_ACTIVE: &str = "hub_callers_active";
/// Privileged link up (gauge). 1 = connected, 0 = not.
pub const HUB_LINK_UP: &str = "hub_link_up";
/// Messages dropped because a send queue was full (counter).
pub const HUB_SEND_DROPS_TOTAL: &str = "hub_send_drops_total";
