/*
[INPUT]:  Venue capability flags and lifecycle phases
[OUTPUT]: Typed enums/structs with serialization support
[POS]:    Data layer - capability and state definitions
[UPDATE]: When venues gain new subscription modes or lifecycle phases change
*/

use serde::{Deserialize, Serialize};

/// Subscription capabilities a venue's stream supports
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Features {
    /// Granular subscribe of individual channels
    #[serde(default)]
    pub subscribe: bool,
    /// Granular unsubscribe of individual channels
    #[serde(default)]
    pub unsubscribe: bool,
    /// Every change must resend the whole subscription set
    #[serde(default)]
    pub full_payload_subscribe: bool,
}

impl Features {
    pub fn granular() -> Self {
        Self {
            subscribe: true,
            unsubscribe: true,
            full_payload_subscribe: false,
        }
    }

    pub fn full_payload() -> Self {
        Self {
            subscribe: false,
            unsubscribe: false,
            full_payload_subscribe: true,
        }
    }
}

/// Lifecycle phase of a connection manager.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StreamState {
    Disabled,
    Enabled,
    Connecting,
    Connected,
}

impl StreamState {
    pub fn is_enabled(self) -> bool {
        !matches!(self, StreamState::Disabled)
    }
}
