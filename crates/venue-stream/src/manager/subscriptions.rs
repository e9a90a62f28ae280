/*
[INPUT]:  Desired subscription sets from the venue generator, venue acks
[OUTPUT]: Active subscription set, set differences, subscribe/unsubscribe requests
[POS]:    Manager layer - subscription bookkeeping and two-phase subscribe
[UPDATE]: When changing subscription matching or reconciliation rules
*/

use std::sync::{Mutex, MutexGuard, PoisonError};

use tracing::{debug, info};

use crate::error::{Result, StreamError, SubscriptionError};
use crate::manager::ConnectionManager;
use crate::types::ChannelSubscription;

/// Active subscriptions of one manager.
///
/// Never holds two entries that compare equal.
#[derive(Debug, Default)]
pub(crate) struct SubscriptionManager {
    active: Mutex<Vec<ChannelSubscription>>,
}

impl SubscriptionManager {
    fn lock(&self) -> MutexGuard<'_, Vec<ChannelSubscription>> {
        self.active.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Split `desired` against the active set into `(to_subscribe, to_unsubscribe)`.
    pub fn difference(
        &self,
        desired: &[ChannelSubscription],
    ) -> (Vec<ChannelSubscription>, Vec<ChannelSubscription>) {
        let active = self.lock();

        let to_unsubscribe = active
            .iter()
            .filter(|current| !desired.contains(current))
            .cloned()
            .collect();
        let to_subscribe = desired
            .iter()
            .filter(|wanted| !active.contains(wanted))
            .cloned()
            .collect();

        (to_subscribe, to_unsubscribe)
    }

    pub fn ensure_not_subscribed(
        &self,
        requested: &[ChannelSubscription],
    ) -> std::result::Result<(), SubscriptionError> {
        let active = self.lock();
        match requested.iter().find(|sub| active.contains(sub)) {
            Some(existing) => Err(SubscriptionError::AlreadySubscribed(existing.clone())),
            None => Ok(()),
        }
    }

    /// Every entry must be active, otherwise the first missing one is reported
    pub fn ensure_subscribed(
        &self,
        requested: &[ChannelSubscription],
    ) -> std::result::Result<(), SubscriptionError> {
        let active = self.lock();
        match requested.iter().find(|sub| !active.contains(sub)) {
            Some(missing) => Err(SubscriptionError::NotFound(missing.clone())),
            None => Ok(()),
        }
    }

    /// Commit entries, skipping any already active. Returns how many were added.
    pub fn add(&self, subscriptions: &[ChannelSubscription]) -> usize {
        let mut active = self.lock();
        let before = active.len();
        for sub in subscriptions {
            if !active.contains(sub) {
                active.push(sub.clone());
            }
        }
        active.len() - before
    }

    pub fn remove(&self, subscriptions: &[ChannelSubscription]) -> usize {
        let mut active = self.lock();
        let before = active.len();
        for sub in subscriptions {
            if let Some(index) = active.iter().position(|current| current == sub) {
                active.swap_remove(index);
            }
        }
        before - active.len()
    }

    pub fn purge(&self) {
        self.lock().clear();
    }

    pub fn snapshot(&self) -> Vec<ChannelSubscription> {
        self.lock().clone()
    }
}

impl ConnectionManager {
    /// Ask the venue to subscribe to `subscriptions`.
    ///
    /// The whole request is rejected if any entry is already active. Nothing is
    /// committed here; the venue calls [`Self::add_successful_subscriptions`]
    /// once the subscription is acknowledged.
    pub async fn subscribe_to_channels(&self, subscriptions: &[ChannelSubscription]) -> Result<()> {
        if subscriptions.is_empty() {
            return Err(SubscriptionError::NoChannelsSupplied.into());
        }
        let bindings = self.bindings()?;
        self.inner.subscriptions.ensure_not_subscribed(subscriptions)?;

        bindings
            .subscriber
            .subscribe(self, subscriptions)
            .await
            .map_err(|err| SubscriptionError::Rejected(Box::new(err)))?;

        debug!(
            exchange = %bindings.name,
            count = subscriptions.len(),
            "ws subscribe requested"
        );
        Ok(())
    }

    /// Ask the venue to unsubscribe. Rejected as a whole when any entry is not active.
    pub async fn unsubscribe_channels(&self, subscriptions: &[ChannelSubscription]) -> Result<()> {
        if subscriptions.is_empty() {
            return Err(SubscriptionError::NotPopulated.into());
        }
        let bindings = self.bindings()?;
        self.inner.subscriptions.ensure_subscribed(subscriptions)?;

        let unsubscriber = bindings
            .unsubscriber
            .as_ref()
            .ok_or(SubscriptionError::UnsubscribeUnsupported)?;
        unsubscriber
            .unsubscribe(self, subscriptions)
            .await
            .map_err(|err| SubscriptionError::Rejected(Box::new(err)))?;

        debug!(
            exchange = %bindings.name,
            count = subscriptions.len(),
            "ws unsubscribe requested"
        );
        Ok(())
    }

    pub async fn resubscribe_to_channel(&self, subscription: &ChannelSubscription) -> Result<()> {
        let single = std::slice::from_ref(subscription);
        self.unsubscribe_channels(single).await?;
        self.subscribe_to_channels(single).await
    }

    /// Reconcile subscriptions after the venue's instrument set changed.
    ///
    /// Granular venues get an incremental diff, full-payload venues get the
    /// whole generated set resent, anything else is reconnected.
    pub async fn flush_channels(&self) -> Result<()> {
        let bindings = self.bindings()?;
        if !self.is_enabled() {
            return Err(StreamError::NotEnabled);
        }
        if !self.is_connected() {
            return Err(StreamError::NotConnected {
                exchange: bindings.name.clone(),
            });
        }

        let features = bindings.features;
        if features.subscribe {
            let desired = self.generate_subscriptions().await?;
            let (to_subscribe, to_unsubscribe) = self.channel_difference(&desired);
            if features.unsubscribe && !to_unsubscribe.is_empty() {
                self.unsubscribe_channels(&to_unsubscribe).await?;
            }
            if to_subscribe.is_empty() {
                return Ok(());
            }
            return self.subscribe_to_channels(&to_subscribe).await;
        }

        if features.full_payload_subscribe {
            let desired = self.generate_subscriptions().await?;
            if desired.is_empty() {
                return Ok(());
            }
            info!(
                exchange = %bindings.name,
                count = desired.len(),
                "ws resending full subscription payload"
            );
            self.inner.subscriptions.purge();
            return self.subscribe_to_channels(&desired).await;
        }

        let _lifecycle = self.inner.lifecycle.lock().await;
        self.shutdown_locked().await?;
        self.connect_locked().await
    }

    /// `(to_subscribe, to_unsubscribe)` of `desired` against the active set
    pub fn channel_difference(
        &self,
        desired: &[ChannelSubscription],
    ) -> (Vec<ChannelSubscription>, Vec<ChannelSubscription>) {
        self.inner.subscriptions.difference(desired)
    }

    /// Commit acknowledged subscriptions to the active set
    pub fn add_successful_subscriptions(&self, subscriptions: &[ChannelSubscription]) {
        let added = self.inner.subscriptions.add(subscriptions);
        if added < subscriptions.len() {
            debug!(
                exchange = %self.name(),
                skipped = subscriptions.len() - added,
                "ws subscriptions already active"
            );
        }
    }

    pub fn remove_successful_unsubscriptions(&self, subscriptions: &[ChannelSubscription]) {
        self.inner.subscriptions.remove(subscriptions);
    }

    pub fn subscriptions(&self) -> Vec<ChannelSubscription> {
        self.inner.subscriptions.snapshot()
    }

    pub(crate) async fn generate_subscriptions(&self) -> Result<Vec<ChannelSubscription>> {
        let bindings = self.bindings()?;
        let generated = bindings
            .generator
            .generate_subscriptions()
            .await
            .map_err(|err| SubscriptionError::Generate(Box::new(err)))?;
        Ok(generated)
    }
}
