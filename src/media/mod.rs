//! Media engine boundary.
//!
//! The signaling machine never touches the media engine directly. It asks a
//! [`MediaSessionFactory`] for one [`MediaSession`] per stream id and hears
//! back through a [`SessionEventSink`]. Engine callbacks run on engine
//! tasks; the sink only queues the event for the control context and
//! returns.

pub mod webrtc;

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::sync::{mpsc, oneshot};

use crate::error::Result;
use crate::ice::IceServerConfig;
use crate::signaling::ControlEvent;

pub use self::webrtc::{WebRtcDataChannel, WebRtcSession, WebRtcSessionFactory};

/// ICE connection state reported by a session
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum ConnectivityState {
    New = 0,
    Checking = 1,
    Connected = 2,
    Completed = 3,
    Failed = 4,
    Disconnected = 5,
    Closed = 6,
}

impl ConnectivityState {
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(Self::New),
            1 => Some(Self::Checking),
            2 => Some(Self::Connected),
            3 => Some(Self::Completed),
            4 => Some(Self::Failed),
            5 => Some(Self::Disconnected),
            6 => Some(Self::Closed),
            _ => None,
        }
    }

    /// Media is flowing
    pub fn is_connected(&self) -> bool {
        matches!(self, Self::Connected | Self::Completed)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::New => "new",
            Self::Checking => "checking",
            Self::Connected => "connected",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Disconnected => "disconnected",
            Self::Closed => "closed",
        }
    }
}

impl fmt::Display for ConnectivityState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Session description type
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SdpKind {
    Offer,
    Answer,
}

impl SdpKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            SdpKind::Offer => "offer",
            SdpKind::Answer => "answer",
        }
    }
}

/// Media kind of a track
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TrackKind {
    Audio,
    Video,
}

/// Parameters for one media session
#[derive(Clone, Debug)]
pub struct SessionParams {
    pub stream_id: String,
    /// STUN/TURN servers; encryption (DTLS-SRTP) and unified-plan
    /// semantics are always on
    pub ice_servers: Vec<IceServerConfig>,
    pub audio_only: bool,
    /// Receive only: no local tracks, offers ask to receive audio/video
    pub play_only: bool,
}

/// Inbound data channel payload observer
pub type DataChannelObserver = Arc<dyn Fn(&[u8]) + Send + Sync>;

/// Events emitted by a media session
pub enum SessionEvent {
    /// Local description created and applied
    DescriptionCreated { kind: SdpKind, sdp: String },
    /// A description (local or remote) has been applied
    DescriptionSet { kind: SdpKind },
    /// Local ICE candidate discovered
    Candidate {
        mid: String,
        mline_index: u16,
        candidate: String,
    },
    ConnectivityChanged(ConnectivityState),
    /// Remote side opened a data channel
    DataChannelOpened(Box<dyn DataChannel>),
    DataChannelMessage(Vec<u8>),
    TrackAdded { track_id: String, kind: TrackKind },
    TrackRemoved { track_id: String },
    /// The engine rejected a negotiation step
    NegotiationFailed(String),
}

impl fmt::Debug for SessionEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::DescriptionCreated { kind, sdp } => f
                .debug_struct("DescriptionCreated")
                .field("kind", kind)
                .field("sdp_len", &sdp.len())
                .finish(),
            Self::DescriptionSet { kind } => f.debug_struct("DescriptionSet").field("kind", kind).finish(),
            Self::Candidate { mid, mline_index, .. } => f
                .debug_struct("Candidate")
                .field("mid", mid)
                .field("mline_index", mline_index)
                .finish(),
            Self::ConnectivityChanged(state) => f.debug_tuple("ConnectivityChanged").field(state).finish(),
            Self::DataChannelOpened(dc) => f.debug_tuple("DataChannelOpened").field(&dc.label()).finish(),
            Self::DataChannelMessage(data) => f.debug_tuple("DataChannelMessage").field(&data.len()).finish(),
            Self::TrackAdded { track_id, kind } => f
                .debug_struct("TrackAdded")
                .field("track_id", track_id)
                .field("kind", kind)
                .finish(),
            Self::TrackRemoved { track_id } => f.debug_struct("TrackRemoved").field("track_id", track_id).finish(),
            Self::NegotiationFailed(reason) => f.debug_tuple("NegotiationFailed").field(reason).finish(),
        }
    }
}

/// Per-stream handle used by engine callbacks to reach the control context.
///
/// `post` never blocks and never runs signaling logic inline. Once the
/// owning entry is retired the sink is detached and further events are
/// dropped at the source.
#[derive(Clone)]
pub struct SessionEventSink {
    stream_id: Arc<str>,
    tx: mpsc::UnboundedSender<ControlEvent>,
    detached: Arc<AtomicBool>,
}

impl SessionEventSink {
    pub fn new(stream_id: &str, tx: mpsc::UnboundedSender<ControlEvent>) -> Self {
        Self {
            stream_id: Arc::from(stream_id),
            tx,
            detached: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn stream_id(&self) -> &str {
        &self.stream_id
    }

    /// Queue an event for the control context
    pub fn post(&self, event: SessionEvent) {
        if self.is_detached() {
            log::trace!("[{}] dropping {:?} after detach", self.stream_id, event);
            return;
        }
        let _ = self.tx.send(ControlEvent::Session {
            stream_id: self.stream_id.to_string(),
            event,
        });
    }

    /// Stop forwarding events; used before the session is destroyed
    pub fn detach(&self) {
        self.detached.store(true, Ordering::SeqCst);
    }

    pub fn is_detached(&self) -> bool {
        self.detached.load(Ordering::SeqCst) || self.tx.is_closed()
    }

    /// Observer that forwards data channel payloads through this sink
    pub fn data_channel_observer(&self) -> DataChannelObserver {
        let sink = self.clone();
        Arc::new(move |data: &[u8]| sink.post(SessionEvent::DataChannelMessage(data.to_vec())))
    }
}

/// Side channel for out-of-band text/binary messages on one stream
pub trait DataChannel: Send {
    fn label(&self) -> &str;

    /// Install the inbound payload observer, replacing any previous one
    fn observe(&self, observer: DataChannelObserver);

    /// Remove the observer; payloads received afterwards are dropped
    fn detach(&self);

    /// Queue a UTF-8 text message
    fn send_text(&self, text: &str) -> Result<()>;
}

/// One negotiated media connection
pub trait MediaSession: Send {
    /// Generate a local offer; `play_only` asks to receive audio and video
    fn create_offer(&self, play_only: bool);

    /// Generate a local answer to the applied remote offer
    fn create_answer(&self);

    /// Apply a remote description. Parse failures are returned; failures
    /// of the asynchronous application arrive as `NegotiationFailed`.
    fn set_remote_description(&self, kind: SdpKind, sdp: &str) -> Result<()>;

    /// Apply a remote ICE candidate
    fn add_candidate(&self, mid: &str, mline_index: u16, candidate: &str) -> Result<()>;

    fn connectivity_state(&self) -> ConnectivityState;

    fn create_data_channel(&self, label: &str) -> Result<Box<dyn DataChannel>>;

    /// Start or stop sending the local track of `kind` without renegotiating
    fn set_track_enabled(&self, kind: TrackKind, enabled: bool);

    /// Request the engine's statistics; the report arrives as a JSON object
    fn stats(&self) -> Result<oneshot::Receiver<serde_json::Value>>;

    /// Close the connection; no events are expected afterwards
    fn close(&self);
}

/// Sole producer of media sessions
pub trait MediaSessionFactory: Send + Sync {
    /// Create a session for `params.stream_id`. Returns `None` when the
    /// engine cannot create one; the caller abandons the stream.
    fn create_session(
        &self,
        params: SessionParams,
        events: SessionEventSink,
    ) -> Option<Box<dyn MediaSession>>;
}
