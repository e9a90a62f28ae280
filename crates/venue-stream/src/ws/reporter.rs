/*
[INPUT]:  Round-trip timings of correlated websocket requests
[OUTPUT]: Latency reports (tracing by default)
[POS]:    WebSocket layer - latency reporting seam
[UPDATE]: When adding reporter implementations or report fields
*/

use std::fmt;
use std::time::Duration;

use tracing::debug;

/// Receives the latency of each request/response round trip.
pub trait Reporter: Send + Sync + fmt::Debug {
    fn latency(&self, exchange: &str, message: &[u8], duration: Duration);
}

/// Reporter that writes latencies to the tracing pipeline
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingReporter;

impl Reporter for TracingReporter {
    fn latency(&self, exchange: &str, message: &[u8], duration: Duration) {
        debug!(
            exchange,
            bytes = message.len(),
            latency_ms = duration.as_secs_f64() * 1000.0,
            "ws request round trip"
        );
    }
}
