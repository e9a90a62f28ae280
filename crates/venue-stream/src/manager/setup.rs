/*
[INPUT]:  StreamSetup from a venue adapter (settings, capabilities, URLs, collaborators)
[OUTPUT]: Validated VenueBindings frozen into the manager
[POS]:    Manager layer - one-shot setup and validation
[UPDATE]: When new setup fields or validation rules are added
*/

use std::sync::Arc;
use std::time::Duration;

use tracing::info;
use url::Url;

use crate::config::{
    DEFAULT_CONNECTION_MONITOR_DELAY, MIN_TRAFFIC_TIMEOUT, StreamSettings,
    WEBSOCKET_URL_NON_DEFAULT_MESSAGE,
};
use crate::error::{ConfigError, Result};
use crate::manager::ConnectionManager;
use crate::manager::lifecycle::{Endpoints, Timing};
use crate::manager::venue::{
    Connector, FillNotifier, OrderbookBuffer, Subscriber, SubscriptionGenerator, TradeNotifier,
    Unsubscriber,
};
use crate::types::{Features, StreamState};
use crate::ws::{Reporter, TracingReporter};

/// Everything a venue adapter hands the manager at startup.
///
/// Required pieces are `Option`s so a missing one is reported by name.
#[derive(Default)]
pub struct StreamSetup {
    pub settings: Option<StreamSettings>,
    pub features: Option<Features>,
    pub connector: Option<Arc<dyn Connector>>,
    pub subscriber: Option<Arc<dyn Subscriber>>,
    pub unsubscriber: Option<Arc<dyn Unsubscriber>>,
    pub generator: Option<Arc<dyn SubscriptionGenerator>>,
    pub default_url: String,
    pub default_auth_url: String,
    /// Overrides the settings' websocket URL when set
    pub running_url: String,
    pub running_auth_url: String,
    /// Overrides the settings' monitor delay when non-zero
    pub connection_monitor_delay: Duration,
    pub orderbook: Option<Arc<dyn OrderbookBuffer>>,
    pub trades: Option<Arc<dyn TradeNotifier>>,
    pub fills: Option<Arc<dyn FillNotifier>>,
    /// Latency reporter for connections that do not bring their own
    pub reporter: Option<Arc<dyn Reporter>>,
}

impl StreamSetup {
    pub fn new(settings: StreamSettings) -> Self {
        Self {
            settings: Some(settings),
            ..Self::default()
        }
    }

    pub fn features(mut self, features: Features) -> Self {
        self.features = Some(features);
        self
    }

    /// Use one adapter type as connector, subscriber and generator
    pub fn venue<V>(mut self, venue: Arc<V>) -> Self
    where
        V: Connector + Subscriber + SubscriptionGenerator + 'static,
    {
        self.connector = Some(venue.clone());
        self.subscriber = Some(venue.clone());
        self.generator = Some(venue);
        self
    }

    pub fn unsubscriber(mut self, unsubscriber: Arc<dyn Unsubscriber>) -> Self {
        self.unsubscriber = Some(unsubscriber);
        self
    }

    pub fn default_url(mut self, url: impl Into<String>) -> Self {
        self.default_url = url.into();
        self
    }

    pub fn default_auth_url(mut self, url: impl Into<String>) -> Self {
        self.default_auth_url = url.into();
        self
    }

    pub fn orderbook(mut self, buffer: Arc<dyn OrderbookBuffer>) -> Self {
        self.orderbook = Some(buffer);
        self
    }

    pub fn trades(mut self, notifier: Arc<dyn TradeNotifier>) -> Self {
        self.trades = Some(notifier);
        self
    }

    pub fn fills(mut self, notifier: Arc<dyn FillNotifier>) -> Self {
        self.fills = Some(notifier);
        self
    }

    pub fn reporter(mut self, reporter: Arc<dyn Reporter>) -> Self {
        self.reporter = Some(reporter);
        self
    }
}

/// Validated venue capabilities, fixed for the manager's lifetime
pub(crate) struct VenueBindings {
    pub name: String,
    pub features: Features,
    pub connector: Arc<dyn Connector>,
    pub subscriber: Arc<dyn Subscriber>,
    pub unsubscriber: Option<Arc<dyn Unsubscriber>>,
    pub generator: Arc<dyn SubscriptionGenerator>,
    pub orderbook: Option<Arc<dyn OrderbookBuffer>>,
    pub reporter: Arc<dyn Reporter>,
}

/// Accept only `ws://` and `wss://` URLs
pub fn check_websocket_url(url: &str) -> std::result::Result<(), ConfigError> {
    let parsed = Url::parse(url).map_err(|err| ConfigError::InvalidUrl {
        url: url.to_string(),
        reason: err.to_string(),
    })?;
    match parsed.scheme() {
        "ws" | "wss" => Ok(()),
        _ => Err(ConfigError::InvalidScheme {
            url: url.to_string(),
        }),
    }
}

pub(crate) fn check_proxy_address(address: &str) -> std::result::Result<(), ConfigError> {
    let parsed = Url::parse(address).map_err(|err| ConfigError::InvalidProxy {
        address: address.to_string(),
        reason: err.to_string(),
    })?;
    if parsed.host_str().is_none() {
        return Err(ConfigError::InvalidProxy {
            address: address.to_string(),
            reason: "missing host".to_string(),
        });
    }
    Ok(())
}

pub(crate) fn resolve_url(url: &str, default: &str) -> String {
    if url.is_empty() || url == WEBSOCKET_URL_NON_DEFAULT_MESSAGE {
        default.to_string()
    } else {
        url.to_string()
    }
}

impl ConnectionManager {
    /// Validate `setup` and bind the venue to this manager.
    ///
    /// Can only succeed once. Collaborators receive the inbound sink before
    /// the manager is marked as set up.
    pub fn setup(&self, setup: StreamSetup) -> Result<()> {
        if self.inner.bindings.get().is_some() {
            return Err(ConfigError::AlreadyInitialised.into());
        }

        let settings = setup.settings.ok_or(ConfigError::SettingsUnset)?;
        if settings.name.is_empty() {
            return Err(ConfigError::NameUnset.into());
        }
        let features = setup.features.ok_or(ConfigError::FeaturesUnset)?;
        let connector = setup.connector.ok_or(ConfigError::ConnectorUnset)?;
        let subscriber = setup.subscriber.ok_or(ConfigError::SubscriberUnset)?;
        if features.unsubscribe && setup.unsubscriber.is_none() {
            return Err(ConfigError::UnsubscriberUnset.into());
        }
        let generator = setup.generator.ok_or(ConfigError::GeneratorUnset)?;
        if setup.default_url.is_empty() {
            return Err(ConfigError::DefaultUrlEmpty.into());
        }

        let running_url = if setup.running_url.is_empty() {
            settings.websocket_url.clone()
        } else {
            setup.running_url
        };
        if running_url.is_empty() {
            return Err(ConfigError::RunningUrlEmpty.into());
        }
        let running_url = resolve_url(&running_url, &setup.default_url);
        check_websocket_url(&running_url)?;

        let running_auth_url = if setup.running_auth_url.is_empty() {
            settings.websocket_auth_url.clone()
        } else {
            setup.running_auth_url
        };
        let running_auth_url = resolve_url(&running_auth_url, &setup.default_auth_url);
        if !running_auth_url.is_empty() {
            check_websocket_url(&running_auth_url)?;
        }

        if settings.traffic_timeout < MIN_TRAFFIC_TIMEOUT {
            return Err(ConfigError::InvalidTrafficTimeout {
                timeout: settings.traffic_timeout,
                minimum: MIN_TRAFFIC_TIMEOUT,
            }
            .into());
        }
        if !settings.proxy.is_empty() {
            check_proxy_address(&settings.proxy)?;
        }

        let connection_monitor_delay = [
            setup.connection_monitor_delay,
            settings.connection_monitor_delay,
        ]
        .into_iter()
        .find(|delay| !delay.is_zero())
        .unwrap_or(DEFAULT_CONNECTION_MONITOR_DELAY);

        let sink = self.data_sink();
        if let Some(orderbook) = &setup.orderbook {
            orderbook.setup(&settings.orderbook, sink.clone())?;
        }
        if let Some(trades) = &setup.trades {
            trades.setup(&settings.name, settings.trade_feed, sink.clone())?;
        }
        if let Some(fills) = &setup.fills {
            fills.setup(settings.fill_feed, sink)?;
        }

        let bindings = VenueBindings {
            name: settings.name.clone(),
            features,
            connector,
            subscriber,
            unsubscriber: setup.unsubscriber,
            generator,
            orderbook: setup.orderbook,
            reporter: setup
                .reporter
                .unwrap_or_else(|| Arc::new(TracingReporter)),
        };
        if self.inner.bindings.set(bindings).is_err() {
            return Err(ConfigError::AlreadyInitialised.into());
        }

        *self.endpoints_mut() = Endpoints {
            default_url: setup.default_url,
            default_auth_url: setup.default_auth_url,
            running_url,
            running_auth_url,
            proxy: settings.proxy.clone(),
        };
        *self.timing_mut() = Timing {
            traffic_timeout: settings.traffic_timeout,
            connection_monitor_delay,
        };
        self.update_status(|status| {
            status.state = if settings.enabled {
                StreamState::Enabled
            } else {
                StreamState::Disabled
            };
            status.can_use_auth = settings.authenticated_support;
        });

        info!(
            exchange = %settings.name,
            enabled = settings.enabled,
            traffic_timeout_ms = settings.traffic_timeout.as_millis() as u64,
            monitor_delay_ms = connection_monitor_delay.as_millis() as u64,
            "websocket setup complete"
        );
        Ok(())
    }
}
