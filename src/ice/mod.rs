//! ICE (Interactive Connectivity Establishment) configuration.
//!
//! Provides helpers for configuring STUN and TURN servers.

use webrtc::ice_transport::ice_server::RTCIceServer;

/// STUN server used when the configuration names none
pub const DEFAULT_STUN_SERVER: &str = "stun:stun1.l.google.com:19302";

/// ICE server configuration
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct IceServerConfig {
    pub urls: Vec<String>,
    pub username: Option<String>,
    pub credential: Option<String>,
}

impl IceServerConfig {
    /// Create a STUN-only server config
    pub fn stun(url: &str) -> Self {
        Self {
            urls: vec![url.to_string()],
            username: None,
            credential: None,
        }
    }

    /// Create a TURN server config with credentials
    pub fn turn(url: &str, username: &str, credential: &str) -> Self {
        Self {
            urls: vec![url.to_string()],
            username: Some(username.to_string()),
            credential: Some(credential.to_string()),
        }
    }

    /// Convert to webrtc-rs RTCIceServer
    pub fn to_rtc_ice_server(&self) -> RTCIceServer {
        RTCIceServer {
            urls: self.urls.clone(),
            username: self.username.clone().unwrap_or_default(),
            credential: self.credential.clone().unwrap_or_default(),
            ..Default::default()
        }
    }
}

/// The single Google STUN server the signaling client uses by default
pub fn default_ice_servers() -> Vec<IceServerConfig> {
    vec![IceServerConfig::stun(DEFAULT_STUN_SERVER)]
}
