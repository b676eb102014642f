//! room-signaling - WebRTC signaling client for room-based media servers
//!
//! Negotiates any number of publish and play streams over one secure
//! WebSocket using the `publish` / `play` / `joinRoom` command protocol.
//!
//! Features:
//! - wss:// transport with an explicit connect lifecycle
//! - One media session per stream id, created through a pluggable factory
//! - webrtc-rs backed sessions with per-stream data channels
//! - Room mode: publish own stream, play every other stream in the room
//! - Race-free bridging of media engine callbacks into one control task

pub mod config;
pub mod error;
pub mod ice;
pub mod media;
pub mod signaling;

pub use config::{AudioCodec, CodecPreferences, Role, SignalingConfig, SignalingUrl, VideoCodec};
pub use error::{Result, SignalingError};
pub use ice::{default_ice_servers, IceServerConfig};
pub use media::{
    ConnectivityState, DataChannel, MediaSession, MediaSessionFactory, SdpKind, SessionEvent,
    SessionEventSink, SessionParams, TrackKind, WebRtcSessionFactory,
};
pub use signaling::{
    HostCallbacks, SignalingClient, SignalingPhase, SignalingStatsSnapshot, StreamStats,
};

use std::sync::Arc;

use lazy_static::lazy_static;
use tokio::runtime::Runtime;

lazy_static! {
    /// Runtime shared by hosts that drive the client through blocking calls
    static ref RUNTIME: std::result::Result<Arc<Runtime>, String> =
        Runtime::new().map(Arc::new).map_err(|e| e.to_string());
}

/// The crate's shared multi-thread runtime
pub fn runtime() -> Result<Arc<Runtime>> {
    (*RUNTIME).clone().map_err(SignalingError::Runtime)
}

/// Initialise `env_logger` with an `info` default filter.
///
/// `RUST_LOG` overrides the default. Calling this more than once is harmless.
pub fn init_logging() {
    let _ = env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"))
        .try_init();
}
