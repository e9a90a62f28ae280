/*
[INPUT]:  Outbound request ids and inbound frames carrying ids
[OUTPUT]: Responses delivered to the waiting requester
[POS]:    WebSocket layer - request/response correlation
[UPDATE]: When changing how ids are extracted or matched
*/

use std::collections::HashMap;
use std::sync::{Mutex, PoisonError};

use serde_json::Value;
use tokio::sync::oneshot;

/// Pairs outbound requests with their inbound replies by id.
#[derive(Debug, Default)]
pub struct RequestMatcher {
    pending: Mutex<HashMap<String, oneshot::Sender<Value>>>,
}

impl RequestMatcher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register interest in the reply for `id`.
    ///
    /// Registering the same id twice replaces the earlier waiter, whose
    /// receiver then resolves with an error.
    pub fn register(&self, id: impl Into<String>) -> oneshot::Receiver<Value> {
        let (tx, rx) = oneshot::channel();
        self.lock().insert(id.into(), tx);
        rx
    }

    /// Hand an inbound payload to its waiter.
    ///
    /// The payload comes back when nobody claimed it so the caller can route
    /// it elsewhere.
    pub fn incoming(&self, id: &str, payload: Value) -> Option<Value> {
        let Some(tx) = self.lock().remove(id) else {
            return Some(payload);
        };
        // waiter may have timed out between lookup and send
        tx.send(payload).err()
    }

    pub fn cancel(&self, id: &str) {
        self.lock().remove(id);
    }

    pub fn pending(&self) -> usize {
        self.lock().len()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, oneshot::Sender<Value>>> {
        self.pending.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Pull a correlation id out of a decoded frame.
///
/// Strings are taken as-is, numbers are rendered in decimal.
pub fn extract_id(payload: &Value, field: &str) -> Option<String> {
    match payload.get(field)? {
        Value::String(id) => Some(id.clone()),
        Value::Number(id) => Some(id.to_string()),
        _ => None,
    }
}
