/*
[INPUT]:  Channel names and instruments chosen by a venue adapter
[OUTPUT]: ChannelSubscription values with venue-agnostic equality
[POS]:    Data layer - subscription identity
[UPDATE]: When subscription identity rules change
*/

use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// One (channel, instrument) stream subscription.
///
/// Two subscriptions are equal when their channel names match ignoring ASCII
/// case and their instruments match exactly. `params` never takes part in
/// equality.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct ChannelSubscription {
    pub channel: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub instrument: Option<String>,
    /// Venue specific extras (depth, interval, ...)
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub params: Map<String, Value>,
}

impl ChannelSubscription {
    pub fn new(channel: impl Into<String>, instrument: impl Into<String>) -> Self {
        Self {
            channel: channel.into(),
            instrument: Some(instrument.into()),
            params: Map::new(),
        }
    }

    /// Subscription to a channel that is not tied to an instrument (orders, balances)
    pub fn channel_only(channel: impl Into<String>) -> Self {
        Self {
            channel: channel.into(),
            instrument: None,
            params: Map::new(),
        }
    }

    pub fn with_param(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.params.insert(key.into(), value.into());
        self
    }
}

/// Unicode case-insensitive comparison of channel names
fn fold_eq(left: &str, right: &str) -> bool {
    left.chars()
        .flat_map(char::to_lowercase)
        .eq(right.chars().flat_map(char::to_lowercase))
}

impl PartialEq for ChannelSubscription {
    fn eq(&self, other: &Self) -> bool {
        fold_eq(&self.channel, &other.channel) && self.instrument == other.instrument
    }
}

impl Eq for ChannelSubscription {}

impl fmt::Display for ChannelSubscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.instrument {
            Some(instrument) => write!(f, "{}:{}", self.channel, instrument),
            None => f.write_str(&self.channel),
        }
    }
}
