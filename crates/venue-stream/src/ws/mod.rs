/*
[INPUT]:  Socket URLs, outbound payloads, manager-owned queues
[OUTPUT]: Connection trait, tungstenite connection, request correlation, latency reporting
[POS]:    WebSocket layer - transport consumed by the connection manager
[UPDATE]: When adding transport implementations or correlation features
*/

pub mod connection;
pub mod matcher;
pub mod reporter;

pub use connection::{Connection, ConnectionSetup, PingHandler, PingMessage, WebsocketConnection};
pub(crate) use connection::{ConnectionLinks, ReadError};
pub use matcher::RequestMatcher;
pub use reporter::{Reporter, TracingReporter};
