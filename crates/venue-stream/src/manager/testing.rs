/*
[INPUT]:  Unit tests of the manager layer
[OUTPUT]: Recording venue double and a ready-to-connect manager
[POS]:    Manager layer - test support
[UPDATE]: When venue traits change
*/

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;

use crate::config::StreamSettings;
use crate::error::Result;
use crate::manager::{
    ConnectionManager, Connector, StreamSetup, Subscriber, SubscriptionGenerator, Unsubscriber,
};
use crate::types::{ChannelSubscription, Features};

/// Venue that connects without a socket and records every request
#[derive(Debug, Default)]
pub(crate) struct MockVenue {
    connects: AtomicUsize,
    /// Held inside every connect before it succeeds
    pub connect_delay: Mutex<Duration>,
    pub generated: Mutex<Vec<ChannelSubscription>>,
    pub subscribed: Mutex<Vec<Vec<ChannelSubscription>>>,
    pub unsubscribed: Mutex<Vec<Vec<ChannelSubscription>>>,
}

impl MockVenue {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn connect_calls(&self) -> usize {
        self.connects.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Connector for MockVenue {
    async fn connect(&self, _manager: &ConnectionManager) -> Result<()> {
        self.connects.fetch_add(1, Ordering::SeqCst);
        let delay = *self.connect_delay.lock().unwrap();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        Ok(())
    }
}

#[async_trait]
impl Subscriber for MockVenue {
    async fn subscribe(
        &self,
        _manager: &ConnectionManager,
        subscriptions: &[ChannelSubscription],
    ) -> Result<()> {
        self.subscribed.lock().unwrap().push(subscriptions.to_vec());
        Ok(())
    }
}

#[async_trait]
impl Unsubscriber for MockVenue {
    async fn unsubscribe(
        &self,
        _manager: &ConnectionManager,
        subscriptions: &[ChannelSubscription],
    ) -> Result<()> {
        self.unsubscribed.lock().unwrap().push(subscriptions.to_vec());
        Ok(())
    }
}

#[async_trait]
impl SubscriptionGenerator for MockVenue {
    async fn generate_subscriptions(&self) -> Result<Vec<ChannelSubscription>> {
        Ok(self.generated.lock().unwrap().clone())
    }
}

/// Enabled manager bound to `venue` with granular subscriptions
pub(crate) fn test_manager(venue: Arc<MockVenue>) -> ConnectionManager {
    let mut settings = StreamSettings::new("mockex");
    settings.websocket_url = "ws://127.0.0.1:1/ws".to_string();

    let manager = ConnectionManager::new();
    manager
        .setup(
            StreamSetup::new(settings)
                .features(Features::granular())
                .venue(venue.clone())
                .unsubscriber(venue)
                .default_url("ws://127.0.0.1:1/ws"),
        )
        .unwrap();
    manager
}
