/*
[INPUT]:  Venue-agnostic stream data definitions
[OUTPUT]: Subscription, event and capability types
[POS]:    Data layer - type definitions shared by transport and manager
[UPDATE]: When new shared types are added
*/

pub mod event;
pub mod features;
pub mod subscription;

pub use event::{DataSink, StreamEvent};
pub use features::{Features, StreamState};
pub use subscription::ChannelSubscription;
