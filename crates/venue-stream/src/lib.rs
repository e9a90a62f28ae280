/*
[INPUT]:  Crate modules and public type definitions
[OUTPUT]: Public venue-stream crate surface
[POS]:    Crate root - module wiring
[UPDATE]: When public modules or exports change
*/

pub mod config;
pub mod error;
pub mod manager;
pub mod types;
pub mod ws;

pub use config::{OrderbookBufferConfig, StreamSettings};

pub use error::{
    ConfigError,
    Result,
    StreamError,
    SubscriptionError,
    TransportError,
    is_disconnection_error,
};

pub use manager::{
    ConnectionManager,
    Connector,
    FillNotifier,
    OrderbookBuffer,
    StreamSetup,
    Subscriber,
    SubscriptionGenerator,
    TradeNotifier,
    Unsubscriber,
};

pub use types::*;

pub use ws::{
    Connection,
    ConnectionSetup,
    PingHandler,
    PingMessage,
    Reporter,
    TracingReporter,
    WebsocketConnection,
};
