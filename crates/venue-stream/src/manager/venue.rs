/*
[INPUT]:  Venue adapter implementations
[OUTPUT]: Capability traits the manager drives (connect, subscribe, generate) and collaborator contracts
[POS]:    Manager layer - seams between the generic lifecycle and venue code
[UPDATE]: When the manager needs new behaviour from venue adapters
*/

use async_trait::async_trait;

use crate::config::OrderbookBufferConfig;
use crate::error::Result;
use crate::manager::ConnectionManager;
use crate::types::{ChannelSubscription, DataSink};

/// Establishes the venue's socket(s), normally through
/// [`ConnectionManager::setup_new_connection`] followed by `dial`.
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self, manager: &ConnectionManager) -> Result<()>;
}

/// Sends subscribe requests for the given channels.
///
/// Success only means the request went out. The venue commits entries with
/// [`ConnectionManager::add_successful_subscriptions`] once it sees the ack.
#[async_trait]
pub trait Subscriber: Send + Sync {
    async fn subscribe(
        &self,
        manager: &ConnectionManager,
        subscriptions: &[ChannelSubscription],
    ) -> Result<()>;
}

#[async_trait]
pub trait Unsubscriber: Send + Sync {
    async fn unsubscribe(
        &self,
        manager: &ConnectionManager,
        subscriptions: &[ChannelSubscription],
    ) -> Result<()>;
}

/// Produces the subscription set the venue wants right now
#[async_trait]
pub trait SubscriptionGenerator: Send + Sync {
    async fn generate_subscriptions(&self) -> Result<Vec<ChannelSubscription>>;
}

/// Local order book buffer fed from the inbound queue
pub trait OrderbookBuffer: Send + Sync {
    fn setup(&self, config: &OrderbookBufferConfig, sink: DataSink) -> Result<()>;

    /// Drop buffered updates, called on every shutdown
    fn flush_buffer(&self);
}

pub trait TradeNotifier: Send + Sync {
    fn setup(&self, exchange: &str, enabled: bool, sink: DataSink) -> Result<()>;
}

pub trait FillNotifier: Send + Sync {
    fn setup(&self, enabled: bool, sink: DataSink) -> Result<()>;
}
