/*
[INPUT]:  Decoded socket frames, correlation acks, forwarded transport errors
[OUTPUT]: StreamEvent values flowing inbound -> relay -> consumer
[POS]:    Data layer - event sink message type
[UPDATE]: When adding new event kinds to the sink
*/

use serde_json::Value;
use tokio::sync::mpsc;

use crate::error::TransportError;

/// Everything the manager hands to the processing side.
#[derive(Debug, Clone)]
pub enum StreamEvent {
    /// Decoded frame payload
    Data(Value),
    /// Frame carrying a correlation id that no pending request claimed
    Ack { id: String, payload: Value },
    /// Non-disconnection transport error, forwarded verbatim
    Error(TransportError),
}

impl StreamEvent {
    pub fn is_error(&self) -> bool {
        matches!(self, StreamEvent::Error(_))
    }
}

/// Sender half of the inbound data queue handed to connections and collaborators
pub type DataSink = mpsc::Sender<StreamEvent>;
