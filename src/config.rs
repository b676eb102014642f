//! Signaling session configuration.
//!
//! The configuration is fixed once the client is constructed; the machine
//! holds it behind an `Arc` and never mutates it.

use std::fmt;
use std::str::FromStr;

use url::Url;
use webrtc::api::media_engine::{MIME_TYPE_H264, MIME_TYPE_OPUS, MIME_TYPE_VP8, MIME_TYPE_VP9};
use webrtc::rtp_transceiver::rtp_codec::{
    RTCRtpCodecCapability, RTCRtpCodecParameters, RTPCodecType,
};
use webrtc::rtp_transceiver::RTCPFeedback;

use crate::error::{Result, SignalingError};
use crate::ice::{default_ice_servers, IceServerConfig};

/// Port used when the signaling URL does not name one
pub const DEFAULT_SIGNALING_PORT: u16 = 5443;

/// Local policy for which direction this client negotiates
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum Role {
    /// Publish only
    #[default]
    Sendonly,
    /// Play only
    Recvonly,
    /// Publish and play (room mode when multistream is enabled)
    Sendrecv,
}

impl FromStr for Role {
    type Err = SignalingError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "sendonly" => Ok(Role::Sendonly),
            "recvonly" => Ok(Role::Recvonly),
            "sendrecv" => Ok(Role::Sendrecv),
            other => Err(SignalingError::Config(format!("Unknown role: {}", other))),
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Role::Sendonly => "sendonly",
            Role::Recvonly => "recvonly",
            Role::Sendrecv => "sendrecv",
        };
        f.write_str(s)
    }
}

/// Preferred video codec for published streams
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum VideoCodec {
    #[default]
    VP9,
    VP8,
    H264,
}

impl VideoCodec {
    pub fn mime_type(&self) -> &'static str {
        match self {
            VideoCodec::VP9 => MIME_TYPE_VP9,
            VideoCodec::VP8 => MIME_TYPE_VP8,
            VideoCodec::H264 => MIME_TYPE_H264,
        }
    }
}

impl FromStr for VideoCodec {
    type Err = SignalingError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_uppercase().as_str() {
            "VP9" => Ok(VideoCodec::VP9),
            "VP8" => Ok(VideoCodec::VP8),
            "H264" => Ok(VideoCodec::H264),
            other => Err(SignalingError::Config(format!("Unsupported video codec: {}", other))),
        }
    }
}

/// Preferred audio codec for published streams
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum AudioCodec {
    #[default]
    Opus,
}

impl AudioCodec {
    pub fn mime_type(&self) -> &'static str {
        match self {
            AudioCodec::Opus => MIME_TYPE_OPUS,
        }
    }
}

/// Codecs preferred for published streams.
///
/// The preferred codecs are registered with the media engine ahead of its
/// defaults, so they lead every offer while the defaults stay available for
/// playback.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct CodecPreferences {
    pub video: VideoCodec,
    pub audio: AudioCodec,
}

impl CodecPreferences {
    /// Capability of the local audio track (48kHz stereo OPUS)
    pub fn audio_capability(&self) -> RTCRtpCodecCapability {
        RTCRtpCodecCapability {
            mime_type: self.audio.mime_type().to_owned(),
            clock_rate: 48000,
            channels: 2,
            sdp_fmtp_line: "minptime=10;useinbandfec=1".to_owned(),
            rtcp_feedback: vec![],
        }
    }

    /// Capability of the local video track
    pub fn video_capability(&self) -> RTCRtpCodecCapability {
        let sdp_fmtp_line = match self.video {
            VideoCodec::H264 => {
                "level-asymmetry-allowed=1;packetization-mode=1;profile-level-id=42001f".to_owned()
            }
            VideoCodec::VP9 => "profile-id=0".to_owned(),
            VideoCodec::VP8 => String::new(),
        };
        RTCRtpCodecCapability {
            mime_type: self.video.mime_type().to_owned(),
            clock_rate: 90000,
            channels: 0,
            sdp_fmtp_line,
            rtcp_feedback: vec![],
        }
    }

    /// Preferred codecs as media engine registrations, audio then video.
    ///
    /// Payload types and fmtp lines equal the engine's default entries for
    /// the same codec, so registering the defaults afterwards adds nothing
    /// twice.
    pub fn registrations(&self) -> Vec<(RTCRtpCodecParameters, RTPCodecType)> {
        let audio = RTCRtpCodecParameters {
            capability: self.audio_capability(),
            payload_type: match self.audio {
                AudioCodec::Opus => 111,
            },
            ..Default::default()
        };
        let mut capability = self.video_capability();
        capability.rtcp_feedback = video_rtcp_feedback();
        let video = RTCRtpCodecParameters {
            capability,
            payload_type: match self.video {
                VideoCodec::VP8 => 96,
                VideoCodec::VP9 => 98,
                VideoCodec::H264 => 102,
            },
            ..Default::default()
        };
        vec![(audio, RTPCodecType::Audio), (video, RTPCodecType::Video)]
    }
}

fn video_rtcp_feedback() -> Vec<RTCPFeedback> {
    [("goog-remb", ""), ("ccm", "fir"), ("nack", ""), ("nack", "pli")]
        .into_iter()
        .map(|(typ, parameter)| RTCPFeedback {
            typ: typ.to_owned(),
            parameter: parameter.to_owned(),
        })
        .collect()
}

/// Configuration for a signaling session
#[derive(Clone, Debug)]
pub struct SignalingConfig {
    /// Signaling endpoint, e.g. "wss://media.example.com:5443/WebRTCAppEE/websocket"
    pub signaling_url: String,
    /// Stream id (publish/play) or room id (multistream sendrecv)
    pub channel_id: String,
    /// Opaque metadata forwarded with publish requests
    pub metadata: serde_json::Value,
    pub role: Role,
    pub multistream: bool,
    pub audio_only: bool,
    pub codecs: CodecPreferences,
    /// ICE servers for NAT traversal
    pub ice_servers: Vec<IceServerConfig>,
    /// Accept plain ws:// endpoints (local servers only)
    pub allow_insecure: bool,
}

impl Default for SignalingConfig {
    fn default() -> Self {
        Self {
            signaling_url: String::new(),
            channel_id: String::new(),
            metadata: serde_json::Value::Null,
            role: Role::Sendonly,
            multistream: false,
            audio_only: false,
            codecs: CodecPreferences::default(),
            ice_servers: default_ice_servers(),
            allow_insecure: false,
        }
    }
}

impl SignalingConfig {
    pub fn new(signaling_url: &str, channel_id: &str) -> Self {
        Self {
            signaling_url: signaling_url.to_string(),
            channel_id: channel_id.to_string(),
            ..Default::default()
        }
    }

    pub fn with_role(mut self, role: Role) -> Self {
        self.role = role;
        self
    }

    pub fn with_multistream(mut self, multistream: bool) -> Self {
        self.multistream = multistream;
        self
    }

    pub fn with_audio_only(mut self, audio_only: bool) -> Self {
        self.audio_only = audio_only;
        self
    }

    pub fn with_metadata(mut self, metadata: serde_json::Value) -> Self {
        self.metadata = metadata;
        self
    }

    pub fn with_codecs(mut self, codecs: CodecPreferences) -> Self {
        self.codecs = codecs;
        self
    }

    pub fn with_ice_servers(mut self, ice_servers: Vec<IceServerConfig>) -> Self {
        self.ice_servers = ice_servers;
        self
    }

    pub fn with_allow_insecure(mut self, allow_insecure: bool) -> Self {
        self.allow_insecure = allow_insecure;
        self
    }

    /// True when the client joins a room and both publishes and plays
    pub fn is_room_mode(&self) -> bool {
        self.multistream && self.role == Role::Sendrecv
    }

    /// Check the configuration and parse the signaling endpoint
    pub fn validate(&self) -> Result<SignalingUrl> {
        if self.channel_id.is_empty() {
            return Err(SignalingError::Config("channel id is empty".to_string()));
        }
        SignalingUrl::parse(&self.signaling_url, self.allow_insecure)
    }
}

/// Parsed and checked signaling endpoint
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SignalingUrl {
    url: Url,
    host: String,
    port: u16,
    secure: bool,
}

impl SignalingUrl {
    /// Parse a signaling URL.
    ///
    /// `wss` is required; `ws` is accepted only with `allow_insecure`.
    /// A missing port defaults to [`DEFAULT_SIGNALING_PORT`].
    pub fn parse(raw: &str, allow_insecure: bool) -> Result<Self> {
        let invalid = |reason: String| SignalingError::InvalidUrl {
            url: raw.to_string(),
            reason,
        };

        let mut url = Url::parse(raw).map_err(|e| invalid(e.to_string()))?;

        let secure = match url.scheme() {
            "wss" => true,
            "ws" if allow_insecure => false,
            _ => return Err(SignalingError::InsecureScheme(raw.to_string())),
        };

        let host = url
            .host_str()
            .filter(|h| !h.is_empty())
            .ok_or_else(|| invalid("missing host".to_string()))?
            .trim_start_matches('[')
            .trim_end_matches(']')
            .to_string();

        // The url crate drops a port equal to the scheme default, so look
        // at the raw authority before falling back to the signaling default.
        let authority = raw
            .split("://")
            .nth(1)
            .and_then(|rest| rest.split('/').next())
            .unwrap_or_default();
        let explicit_default = url
            .port_or_known_default()
            .filter(|p| authority.ends_with(&format!(":{}", p)));

        let port = match url.port().or(explicit_default) {
            Some(port) => port,
            None => {
                url.set_port(Some(DEFAULT_SIGNALING_PORT))
                    .map_err(|_| invalid("cannot carry a port".to_string()))?;
                DEFAULT_SIGNALING_PORT
            }
        };

        Ok(Self { url, host, port, secure })
    }

    pub fn as_str(&self) -> &str {
        self.url.as_str()
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn is_secure(&self) -> bool {
        self.secure
    }
}
