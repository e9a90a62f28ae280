/*
[INPUT]:  Venue adapters and their stream settings
[OUTPUT]: ConnectionManager facade with setup, lifecycle, subscriptions and monitors
[POS]:    Manager layer - venue-agnostic connection lifecycle
[UPDATE]: When adding manager submodules or public exports
*/

mod lifecycle;
mod monitor;
mod relay;
mod setup;
mod subscriptions;
pub mod venue;

#[cfg(test)]
pub(crate) mod testing;

pub use self::lifecycle::ConnectionManager;
pub(crate) use self::lifecycle::ShutdownSignal;
pub use setup::{StreamSetup, check_websocket_url};
pub use venue::{
    Connector, FillNotifier, OrderbookBuffer, Subscriber, SubscriptionGenerator, TradeNotifier,
    Unsubscriber,
};
