/*
[INPUT]:  Error sources (setup validation, lifecycle misuse, subscriptions, socket transport)
[OUTPUT]: Structured error types with category predicates
[POS]:    Error handling layer - unified error types for entire crate
[UPDATE]: When adding new error sources or changing disconnection classification
*/

use std::time::Duration;

use thiserror::Error;
use tokio_tungstenite::tungstenite::{self, error::ProtocolError};

use crate::types::ChannelSubscription;

/// Main error type for the stream manager
#[derive(Error, Debug)]
pub enum StreamError {
    /// Setup or settings problem; the caller must fix configuration
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),

    /// Subscription request failed
    #[error("subscription failure: {0}")]
    Subscription(#[from] SubscriptionError),

    /// Socket level failure
    #[error("transport error: {0}")]
    Transport(#[from] TransportError),

    /// Connector failed to establish the session
    #[error("{exchange} error connecting: {source}")]
    Connect {
        exchange: String,
        #[source]
        source: Box<StreamError>,
    },

    #[error("websocket not enabled")]
    NotEnabled,

    #[error("{exchange} websocket already attempting to connect")]
    AlreadyConnecting { exchange: String },

    #[error("{exchange} websocket already connected")]
    AlreadyConnected { exchange: String },

    #[error("{exchange} websocket is not connected")]
    NotConnected { exchange: String },

    #[error("{exchange} websocket cannot shutdown, in the process of reconnection")]
    ShutdownWhileConnecting { exchange: String },

    #[error("websocket already disabled for exchange '{exchange}'")]
    AlreadyDisabled { exchange: String },

    #[error("websocket is already enabled for exchange {exchange}")]
    AlreadyEnabled { exchange: String },

    /// `setup` has not been called yet
    #[error("websocket not initialised, setup must be called first")]
    NotInitialised,

    #[error("connection monitor is already running")]
    MonitorAlreadyRunning,

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Failure reported by a venue adapter
    #[error("venue error: {0}")]
    Venue(String),
}

impl StreamError {
    /// Build a venue-reported error
    pub fn venue(message: impl Into<String>) -> Self {
        StreamError::Venue(message.into())
    }

    pub fn is_config_error(&self) -> bool {
        matches!(self, StreamError::Config(_))
    }

    /// Check if the error is a precondition failure of connect/shutdown/enable/disable
    pub fn is_lifecycle_error(&self) -> bool {
        matches!(
            self,
            StreamError::NotEnabled
                | StreamError::AlreadyConnecting { .. }
                | StreamError::AlreadyConnected { .. }
                | StreamError::NotConnected { .. }
                | StreamError::ShutdownWhileConnecting { .. }
                | StreamError::AlreadyDisabled { .. }
                | StreamError::AlreadyEnabled { .. }
                | StreamError::NotInitialised
        )
    }

    pub fn is_subscription_failure(&self) -> bool {
        matches!(self, StreamError::Subscription(_))
    }

    /// Check if the error represents loss of the socket
    pub fn is_disconnection(&self) -> bool {
        match self {
            StreamError::Transport(err) => err.is_disconnection(),
            StreamError::Connect { source, .. } => source.is_disconnection(),
            _ => false,
        }
    }
}

/// Setup and settings validation errors
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("exchange settings are nil")]
    SettingsUnset,

    #[error("exchange name unset")]
    NameUnset,

    #[error("websocket features is unset")]
    FeaturesUnset,

    #[error("websocket connector not set")]
    ConnectorUnset,

    #[error("websocket subscriber needs to be set")]
    SubscriberUnset,

    #[error("websocket unsubscribe allowed but unsubscriber not set")]
    UnsubscriberUnset,

    #[error("websocket subscriptions generator needs to be set")]
    GeneratorUnset,

    #[error("default url is empty")]
    DefaultUrlEmpty,

    #[error("running url cannot be empty")]
    RunningUrlEmpty,

    #[error("invalid websocket url {url}: {reason}")]
    InvalidUrl { url: String, reason: String },

    #[error("invalid websocket url scheme for {url}, expected ws or wss")]
    InvalidScheme { url: String },

    #[error("invalid traffic timeout {timeout:?}, cannot be less than {minimum:?}")]
    InvalidTrafficTimeout { timeout: Duration, minimum: Duration },

    #[error("websocket already initialised")]
    AlreadyInitialised,

    #[error("cannot set proxy address {address}: {reason}")]
    InvalidProxy { address: String, reason: String },

    #[error("cannot set proxy address to the same address '{0}'")]
    DuplicateProxy(String),

    #[error("failed to read settings file: {0}")]
    Read(#[from] std::io::Error),

    #[error("failed to parse settings: {0}")]
    Parse(#[from] serde_yaml::Error),
}

/// Subscription bookkeeping and venue subscribe/unsubscribe errors
#[derive(Error, Debug)]
pub enum SubscriptionError {
    #[error("cannot subscribe, no channels supplied")]
    NoChannelsSupplied,

    #[error("channels not populated, cannot remove")]
    NotPopulated,

    #[error("{0} already subscribed")]
    AlreadySubscribed(ChannelSubscription),

    #[error("subscription not found in list: {0}")]
    NotFound(ChannelSubscription),

    #[error("unsubscribe is not supported by this venue")]
    UnsubscribeUnsupported,

    #[error("generating subscriptions failed: {0}")]
    Generate(#[source] Box<StreamError>),

    #[error("venue rejected subscription request: {0}")]
    Rejected(#[source] Box<StreamError>),
}

/// Errors raised by a single socket
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    /// Peer closed the socket without us asking
    #[error("websocket closed unexpectedly (code {code}): {reason}")]
    UnexpectedClose { code: u16, reason: String },

    #[error("network operation failed: {0}")]
    Network(String),

    /// Read or write on a socket this process already closed
    #[error("use of closed network connection")]
    ClosedConnection,

    #[error("malformed payload: {0}")]
    Malformed(String),

    #[error("websocket protocol error: {0}")]
    Protocol(String),

    #[error("websocket connection not established")]
    NotConnected,

    #[error("no response for request {id} within time limit")]
    ResponseTimeout { id: String },

    #[error("response channel for request {id} dropped")]
    ResponseDropped { id: String },

    #[error("proxy tunnel failed: {0}")]
    Proxy(String),
}

impl TransportError {
    pub fn is_disconnection(&self) -> bool {
        is_disconnection_error(self)
    }
}

/// Determine if an error from the read loop means the socket is gone.
///
/// A closure this process initiated is reported as `ClosedConnection` and is
/// not a disconnection.
pub fn is_disconnection_error(err: &TransportError) -> bool {
    match err {
        TransportError::UnexpectedClose { .. } => true,
        TransportError::Network(_) => true,
        TransportError::ClosedConnection => false,
        _ => false,
    }
}

impl From<tungstenite::Error> for TransportError {
    fn from(err: tungstenite::Error) -> Self {
        match err {
            tungstenite::Error::ConnectionClosed | tungstenite::Error::AlreadyClosed => {
                TransportError::ClosedConnection
            }
            tungstenite::Error::Io(io_err) => TransportError::Network(io_err.to_string()),
            tungstenite::Error::Protocol(ProtocolError::ResetWithoutClosingHandshake) => {
                TransportError::UnexpectedClose {
                    code: 1006,
                    reason: "connection reset without closing handshake".to_string(),
                }
            }
            other => TransportError::Protocol(other.to_string()),
        }
    }
}

impl From<tungstenite::Error> for StreamError {
    fn from(err: tungstenite::Error) -> Self {
        StreamError::Transport(err.into())
    }
}

/// Result type alias for stream operations
pub type Result<T> = std::result::Result<T, StreamError>;
