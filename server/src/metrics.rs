//! Engine server metrics.

use metriken::{metric, Counter, Gauge};

#[metric(
    name = "connections_accepted",
    description = "Total connections accepted across all listeners"
)]
pub static CONNECTIONS_ACCEPTED: Counter = Counter::new();

#[metric(
    name = "connections_active",
    description = "Connections currently open"
)]
pub static CONNECTIONS_ACTIVE: Gauge = Gauge::new();

#[metric(
    name = "connections_closed",
    description = "Total connections closed, any reason"
)]
pub static CONNECTIONS_CLOSED: Counter = Counter::new();

#[metric(
    name = "messages_received",
    description = "Whole messages delivered by framers"
)]
pub static MESSAGES_RECEIVED: Counter = Counter::new();

#[metric(name = "messages_sent", description = "Messages queued for sending")]
pub static MESSAGES_SENT: Counter = Counter::new();

#[metric(name = "bytes_received", description = "Message payload bytes in")]
pub static BYTES_RECEIVED: Counter = Counter::new();

#[metric(name = "bytes_sent", description = "Message payload bytes out")]
pub static BYTES_SENT: Counter = Counter::new();

#[metric(
    name = "protocol_errors",
    description = "Connections dropped for framing violations"
)]
pub static PROTOCOL_ERRORS: Counter = Counter::new();

#[metric(
    name = "worker_requests",
    description = "Requests submitted to worker threads"
)]
pub static WORKER_REQUESTS: Counter = Counter::new();

#[metric(
    name = "worker_results",
    description = "Results returned by worker threads"
)]
pub static WORKER_RESULTS: Counter = Counter::new();
