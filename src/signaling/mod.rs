//! Room-based signaling over a secure WebSocket.
//!
//! - `transport`: connect lifecycle and the ordered frame writer
//! - `message`: the JSON wire protocol
//! - `session`: per-stream negotiation bookkeeping
//! - `registry`: per-stream data channels
//! - `machine`: command dispatch and session orchestration
//! - `client`: the control context and host handle

pub mod client;
pub mod machine;
pub mod message;
pub mod registry;
pub mod session;
pub mod transport;

#[cfg(test)]
pub(crate) mod fakes;

pub use client::SignalingClient;
pub use machine::{
    ControlEvent, HostCallbacks, LocalTracks, NotifyCallback, PendingStats, SignalingMachine,
    SignalingStats, SignalingStatsSnapshot, StreamStats, TrackAddedCallback, TrackRemovedCallback,
};
pub use message::{InboundMessage, Notification, OutboundMessage, ServerError};
pub use session::NegotiationPhase;
pub use transport::SignalingPhase;
