//! Secure WebSocket transport for the signaling channel.
//!
//! Connecting walks the lifecycle explicitly: DNS lookup, TCP connect,
//! TLS handshake (wss only), WebSocket upgrade. Each step publishes its
//! phase so the host can see where a stalled connect is stuck.

use std::fmt;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;

use futures_util::stream::{SplitSink, SplitStream};
use futures_util::SinkExt;
use tokio::net::{lookup_host, TcpStream};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_rustls::rustls::crypto::ring;
use tokio_rustls::rustls::pki_types::ServerName;
use tokio_rustls::rustls::{ClientConfig, RootCertStore};
use tokio_rustls::TlsConnector;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};

use super::machine::SignalingStats;
use crate::config::SignalingUrl;
use crate::error::{Result, SignalingError};

pub type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;
pub type WsSink = SplitSink<WsStream, Message>;
pub type WsSource = SplitStream<WsStream>;

/// Transport lifecycle phase
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum SignalingPhase {
    Disconnected = 0,
    Resolving = 1,
    TransportConnecting = 2,
    SecurityHandshaking = 3,
    ProtocolHandshaking = 4,
    Connected = 5,
    Closing = 6,
    Closed = 7,
}

impl SignalingPhase {
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(Self::Disconnected),
            1 => Some(Self::Resolving),
            2 => Some(Self::TransportConnecting),
            3 => Some(Self::SecurityHandshaking),
            4 => Some(Self::ProtocolHandshaking),
            5 => Some(Self::Connected),
            6 => Some(Self::Closing),
            7 => Some(Self::Closed),
            _ => None,
        }
    }
}

impl fmt::Display for SignalingPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Disconnected => "disconnected",
            Self::Resolving => "resolving",
            Self::TransportConnecting => "transport-connecting",
            Self::SecurityHandshaking => "security-handshaking",
            Self::ProtocolHandshaking => "protocol-handshaking",
            Self::Connected => "connected",
            Self::Closing => "closing",
            Self::Closed => "closed",
        };
        f.write_str(s)
    }
}

/// Phase readable from any thread
#[derive(Debug)]
pub struct PhaseCell(AtomicU8);

impl Default for PhaseCell {
    fn default() -> Self {
        Self(AtomicU8::new(SignalingPhase::Disconnected as u8))
    }
}

impl PhaseCell {
    pub fn get(&self) -> SignalingPhase {
        SignalingPhase::from_u8(self.0.load(Ordering::SeqCst)).unwrap_or(SignalingPhase::Disconnected)
    }

    pub fn set(&self, phase: SignalingPhase) {
        let previous = self.0.swap(phase as u8, Ordering::SeqCst);
        if previous != phase as u8 {
            log::debug!("Signaling phase: {}", phase);
        }
    }
}

/// Open the signaling WebSocket, advancing `phase` as each step completes
pub async fn open(url: &SignalingUrl, phase: &PhaseCell) -> Result<WsStream> {
    phase.set(SignalingPhase::Resolving);
    let addrs: Vec<SocketAddr> = lookup_host((url.host(), url.port()))
        .await
        .map_err(|e| SignalingError::Resolve {
            host: url.host().to_string(),
            reason: e.to_string(),
        })?
        .collect();
    if addrs.is_empty() {
        return Err(SignalingError::Resolve {
            host: url.host().to_string(),
            reason: "no addresses".to_string(),
        });
    }

    phase.set(SignalingPhase::TransportConnecting);
    let tcp = connect_any(&addrs).await?;
    if let Err(e) = tcp.set_nodelay(true) {
        log::debug!("Failed to set TCP_NODELAY: {}", e);
    }

    let stream = if url.is_secure() {
        phase.set(SignalingPhase::SecurityHandshaking);
        let server_name = ServerName::try_from(url.host().to_owned())
            .map_err(|e| SignalingError::Tls(format!("Invalid server name '{}': {}", url.host(), e)))?;
        let tls = tls_connector()?
            .connect(server_name, tcp)
            .await
            .map_err(|e| SignalingError::Tls(e.to_string()))?;
        MaybeTlsStream::Rustls(tls)
    } else {
        MaybeTlsStream::Plain(tcp)
    };

    phase.set(SignalingPhase::ProtocolHandshaking);
    let (ws, response) = tokio_tungstenite::client_async(url.as_str(), stream)
        .await
        .map_err(SignalingError::Handshake)?;
    log::debug!("WebSocket upgrade accepted ({})", response.status());

    phase.set(SignalingPhase::Connected);
    Ok(ws)
}

async fn connect_any(addrs: &[SocketAddr]) -> Result<TcpStream> {
    let mut last_err = None;
    for addr in addrs {
        match TcpStream::connect(addr).await {
            Ok(stream) => {
                log::debug!("TCP connected to {}", addr);
                return Ok(stream);
            }
            Err(e) => {
                log::debug!("TCP connect to {} failed: {}", addr, e);
                last_err = Some(e);
            }
        }
    }
    Err(SignalingError::Connect(last_err.unwrap_or_else(|| {
        std::io::Error::new(std::io::ErrorKind::NotFound, "no address to connect to")
    })))
}

fn tls_connector() -> Result<TlsConnector> {
    let mut roots = RootCertStore::empty();
    roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());

    let config = ClientConfig::builder_with_provider(Arc::new(ring::default_provider()))
        .with_safe_default_protocol_versions()
        .map_err(|e| SignalingError::Tls(e.to_string()))?
        .with_root_certificates(roots)
        .with_no_client_auth();

    Ok(TlsConnector::from(Arc::new(config)))
}

/// Spawn the single writer task for the signaling socket.
///
/// Frames are written one at a time in the order they were queued. The task
/// ends after writing a close frame, on a write error, or when every sender
/// is dropped.
pub fn spawn_writer(
    mut sink: WsSink,
    stats: Arc<SignalingStats>,
) -> (mpsc::UnboundedSender<Message>, JoinHandle<()>) {
    let (tx, mut rx) = mpsc::unbounded_channel::<Message>();

    let task = tokio::spawn(async move {
        while let Some(msg) = rx.recv().await {
            let closing = matches!(msg, Message::Close(_));
            if let Err(e) = sink.send(msg).await {
                log::warn!("Signaling write failed: {}", e);
                break;
            }
            stats.frames_sent.fetch_add(1, Ordering::Relaxed);
            if closing {
                break;
            }
        }
        let _ = sink.close().await;
    });

    (tx, task)
}
