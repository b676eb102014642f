//! webrtc-rs backed media sessions.
//!
//! Every engine call for one session runs on that session's op worker task,
//! in the order the control context issued it. Engine callbacks only post
//! events through the session's sink.

use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::runtime::Handle;
use tokio::sync::{mpsc, oneshot};
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::MediaEngine;
use webrtc::api::{APIBuilder, API};
use webrtc::data_channel::data_channel_message::DataChannelMessage;
use webrtc::data_channel::data_channel_state::RTCDataChannelState;
use webrtc::data_channel::RTCDataChannel;
use webrtc::ice_transport::ice_candidate::{RTCIceCandidate, RTCIceCandidateInit};
use webrtc::ice_transport::ice_connection_state::RTCIceConnectionState;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::rtp_transceiver::rtp_codec::RTPCodecType;
use webrtc::rtp_transceiver::rtp_receiver::RTCRtpReceiver;
use webrtc::rtp_transceiver::rtp_sender::RTCRtpSender;
use webrtc::rtp_transceiver::rtp_transceiver_direction::RTCRtpTransceiverDirection;
use webrtc::rtp_transceiver::{RTCRtpTransceiver, RTCRtpTransceiverInit};
use webrtc::track::track_local::track_local_static_sample::TrackLocalStaticSample;
use webrtc::track::track_local::TrackLocal;
use webrtc::track::track_remote::TrackRemote;

use super::{
    ConnectivityState, DataChannel, DataChannelObserver, MediaSession, MediaSessionFactory, SdpKind,
    SessionEvent, SessionEventSink, SessionParams, TrackKind,
};
use crate::config::{CodecPreferences, SignalingConfig};
use crate::error::{Result, SignalingError};

const TRACK_STREAM_ID: &str = "room-signaling";

/// Produces one RTCPeerConnection per stream id from a shared API instance
pub struct WebRtcSessionFactory {
    api: Arc<API>,
    audio_track: Arc<TrackLocalStaticSample>,
    video_track: Arc<TrackLocalStaticSample>,
}

impl WebRtcSessionFactory {
    /// Build the media engine with the preferred codecs first, then the
    /// default codecs and interceptors.
    ///
    /// Published sessions share one local audio and one local video track;
    /// samples written to them go to every publishing peer.
    pub fn new(codecs: &CodecPreferences) -> Result<Self> {
        let mut media_engine = MediaEngine::default();
        for (codec, kind) in codecs.registrations() {
            log::debug!("Preferring {} ({})", codec.capability.mime_type, codec.payload_type);
            media_engine
                .register_codec(codec, kind)
                .map_err(|e| SignalingError::MediaEngine(format!("Failed to register codec: {}", e)))?;
        }
        media_engine
            .register_default_codecs()
            .map_err(|e| SignalingError::MediaEngine(format!("Failed to register codecs: {}", e)))?;

        let mut registry = Registry::new();
        registry = register_default_interceptors(registry, &mut media_engine)
            .map_err(|e| SignalingError::MediaEngine(format!("Failed to register interceptors: {}", e)))?;

        let api = APIBuilder::new()
            .with_media_engine(media_engine)
            .with_interceptor_registry(registry)
            .build();

        let audio_track = Arc::new(TrackLocalStaticSample::new(
            codecs.audio_capability(),
            "audio".to_owned(),
            TRACK_STREAM_ID.to_owned(),
        ));
        let video_track = Arc::new(TrackLocalStaticSample::new(
            codecs.video_capability(),
            "video".to_owned(),
            TRACK_STREAM_ID.to_owned(),
        ));

        Ok(Self {
            api: Arc::new(api),
            audio_track,
            video_track,
        })
    }

    /// Factory using the codec preferences of `config`
    pub fn from_config(config: &SignalingConfig) -> Result<Self> {
        Self::new(&config.codecs)
    }

    /// Local audio track fed by the host
    pub fn audio_track(&self) -> &Arc<TrackLocalStaticSample> {
        &self.audio_track
    }

    /// Local video track fed by the host
    pub fn video_track(&self) -> &Arc<TrackLocalStaticSample> {
        &self.video_track
    }
}

impl MediaSessionFactory for WebRtcSessionFactory {
    fn create_session(
        &self,
        params: SessionParams,
        events: SessionEventSink,
    ) -> Option<Box<dyn MediaSession>> {
        let handle = match Handle::try_current() {
            Ok(handle) => handle,
            Err(e) => {
                log::error!("[{}] Cannot create peer connection outside a runtime: {}", params.stream_id, e);
                return None;
            }
        };

        let (ops_tx, ops_rx) = mpsc::unbounded_channel();
        let state = Arc::new(AtomicU8::new(ConnectivityState::New as u8));

        let session = WebRtcSession {
            stream_id: params.stream_id.clone(),
            ops: ops_tx,
            state: state.clone(),
            handle: handle.clone(),
        };

        let worker = SessionWorker {
            api: self.api.clone(),
            audio_track: self.audio_track.clone(),
            video_track: self.video_track.clone(),
            params,
            events,
            state,
            handle: handle.clone(),
        };
        handle.spawn(worker.run(ops_rx));

        Some(Box::new(session))
    }
}

enum SessionOp {
    CreateOffer { play_only: bool },
    CreateAnswer,
    SetRemote { kind: SdpKind, description: RTCSessionDescription },
    AddCandidate(RTCIceCandidateInit),
    CreateDataChannel { label: String, slot: Arc<Mutex<ChannelSlot>> },
    SetTrackEnabled { kind: TrackKind, enabled: bool },
    Stats(oneshot::Sender<serde_json::Value>),
    Close,
}

/// Handle to one peer connection living on its op worker
pub struct WebRtcSession {
    stream_id: String,
    ops: mpsc::UnboundedSender<SessionOp>,
    state: Arc<AtomicU8>,
    handle: Handle,
}

impl WebRtcSession {
    fn submit(&self, op: SessionOp) -> Result<()> {
        self.ops
            .send(op)
            .map_err(|_| SignalingError::MediaEngine(format!("session worker for '{}' has stopped", self.stream_id)))
    }
}

impl MediaSession for WebRtcSession {
    fn create_offer(&self, play_only: bool) {
        if let Err(e) = self.submit(SessionOp::CreateOffer { play_only }) {
            log::warn!("[{}] {}", self.stream_id, e);
        }
    }

    fn create_answer(&self) {
        if let Err(e) = self.submit(SessionOp::CreateAnswer) {
            log::warn!("[{}] {}", self.stream_id, e);
        }
    }

    fn set_remote_description(&self, kind: SdpKind, sdp: &str) -> Result<()> {
        let description = match kind {
            SdpKind::Offer => RTCSessionDescription::offer(sdp.to_owned()),
            SdpKind::Answer => RTCSessionDescription::answer(sdp.to_owned()),
        }
        .map_err(|e| SignalingError::MediaEngine(format!("Invalid {} SDP: {}", kind.as_str(), e)))?;

        self.submit(SessionOp::SetRemote { kind, description })
    }

    fn add_candidate(&self, mid: &str, mline_index: u16, candidate: &str) -> Result<()> {
        self.submit(SessionOp::AddCandidate(RTCIceCandidateInit {
            candidate: candidate.to_owned(),
            sdp_mid: Some(mid.to_owned()),
            sdp_mline_index: Some(mline_index),
            username_fragment: None,
        }))
    }

    fn connectivity_state(&self) -> ConnectivityState {
        ConnectivityState::from_u8(self.state.load(Ordering::SeqCst)).unwrap_or(ConnectivityState::New)
    }

    fn create_data_channel(&self, label: &str) -> Result<Box<dyn DataChannel>> {
        let channel = WebRtcDataChannel::pending(label, self.handle.clone());
        self.submit(SessionOp::CreateDataChannel {
            label: label.to_owned(),
            slot: channel.slot.clone(),
        })?;
        Ok(Box::new(channel))
    }

    fn set_track_enabled(&self, kind: TrackKind, enabled: bool) {
        if let Err(e) = self.submit(SessionOp::SetTrackEnabled { kind, enabled }) {
            log::warn!("[{}] {}", self.stream_id, e);
        }
    }

    fn stats(&self) -> Result<oneshot::Receiver<serde_json::Value>> {
        let (tx, rx) = oneshot::channel();
        self.submit(SessionOp::Stats(tx))?;
        Ok(rx)
    }

    fn close(&self) {
        // The worker also closes when the last handle is dropped
        let _ = self.ops.send(SessionOp::Close);
    }
}

#[derive(Default)]
struct ChannelSlot {
    channel: Option<Arc<RTCDataChannel>>,
    observer: Option<DataChannelObserver>,
}

/// RTCDataChannel wrapper whose observer can be swapped or removed at any time
pub struct WebRtcDataChannel {
    label: String,
    slot: Arc<Mutex<ChannelSlot>>,
    handle: Handle,
}

impl WebRtcDataChannel {
    /// Channel the worker has not created yet
    fn pending(label: &str, handle: Handle) -> Self {
        Self {
            label: label.to_owned(),
            slot: Arc::new(Mutex::new(ChannelSlot::default())),
            handle,
        }
    }

    /// Wrap a channel opened by the remote side
    fn opened(channel: Arc<RTCDataChannel>, handle: Handle) -> Self {
        let dc = Self::pending(channel.label(), handle);
        install_channel(&dc.slot, channel);
        dc
    }
}

fn install_channel(slot: &Arc<Mutex<ChannelSlot>>, channel: Arc<RTCDataChannel>) {
    let slot_for_message = slot.clone();
    channel.on_message(Box::new(move |msg: DataChannelMessage| {
        let observer = slot_for_message.lock().observer.clone();
        if let Some(observer) = observer {
            observer(&msg.data);
        }
        Box::pin(async {})
    }));
    slot.lock().channel = Some(channel);
}

impl DataChannel for WebRtcDataChannel {
    fn label(&self) -> &str {
        &self.label
    }

    fn observe(&self, observer: DataChannelObserver) {
        self.slot.lock().observer = Some(observer);
    }

    fn detach(&self) {
        self.slot.lock().observer = None;
    }

    fn send_text(&self, text: &str) -> Result<()> {
        let channel = self
            .slot
            .lock()
            .channel
            .clone()
            .filter(|dc| dc.ready_state() == RTCDataChannelState::Open)
            .ok_or_else(|| SignalingError::DataChannelNotReady(self.label.clone()))?;

        let text = text.to_owned();
        let label = self.label.clone();
        self.handle.spawn(async move {
            if let Err(e) = channel.send_text(text).await {
                log::warn!("[{}] DataChannel send failed: {}", label, e);
            }
        });
        Ok(())
    }
}

fn map_ice_state(state: RTCIceConnectionState) -> Option<ConnectivityState> {
    match state {
        RTCIceConnectionState::New => Some(ConnectivityState::New),
        RTCIceConnectionState::Checking => Some(ConnectivityState::Checking),
        RTCIceConnectionState::Connected => Some(ConnectivityState::Connected),
        RTCIceConnectionState::Completed => Some(ConnectivityState::Completed),
        RTCIceConnectionState::Failed => Some(ConnectivityState::Failed),
        RTCIceConnectionState::Disconnected => Some(ConnectivityState::Disconnected),
        RTCIceConnectionState::Closed => Some(ConnectivityState::Closed),
        _ => None,
    }
}

fn map_track_kind(kind: RTPCodecType) -> Option<TrackKind> {
    match kind {
        RTPCodecType::Audio => Some(TrackKind::Audio),
        RTPCodecType::Video => Some(TrackKind::Video),
        _ => None,
    }
}

/// Sender of one local track, kept so the track can be detached and restored
struct LocalSender {
    kind: TrackKind,
    sender: Arc<RTCRtpSender>,
    track: Arc<dyn TrackLocal + Send + Sync>,
}

struct SessionWorker {
    api: Arc<API>,
    audio_track: Arc<TrackLocalStaticSample>,
    video_track: Arc<TrackLocalStaticSample>,
    params: SessionParams,
    events: SessionEventSink,
    state: Arc<AtomicU8>,
    handle: Handle,
}

impl SessionWorker {
    async fn run(self, mut ops: mpsc::UnboundedReceiver<SessionOp>) {
        let stream_id = self.params.stream_id.clone();

        let (pc, senders) = match self.build_peer_connection().await {
            Ok(built) => built,
            Err(e) => {
                log::error!("[{}] {}", stream_id, e);
                self.events.post(SessionEvent::NegotiationFailed(e.to_string()));
                return;
            }
        };
        log::debug!("[{}] Peer connection created (play_only={})", stream_id, self.params.play_only);

        while let Some(op) = ops.recv().await {
            let result = match op {
                SessionOp::CreateOffer { play_only } => self.create_offer(&pc, play_only).await,
                SessionOp::CreateAnswer => self.create_answer(&pc).await,
                SessionOp::SetRemote { kind, description } => pc
                    .set_remote_description(description)
                    .await
                    .map(|_| self.events.post(SessionEvent::DescriptionSet { kind }))
                    .map_err(|e| format!("Failed to set remote description: {}", e)),
                SessionOp::AddCandidate(init) => {
                    if let Err(e) = pc.add_ice_candidate(init).await {
                        log::warn!("[{}] Failed to add ICE candidate: {}", stream_id, e);
                    }
                    Ok(())
                }
                SessionOp::CreateDataChannel { label, slot } => match pc.create_data_channel(&label, None).await {
                    Ok(channel) => {
                        install_channel(&slot, channel);
                        Ok(())
                    }
                    Err(e) => {
                        log::warn!("[{}] Failed to create DataChannel: {}", stream_id, e);
                        Ok(())
                    }
                },
                SessionOp::SetTrackEnabled { kind, enabled } => {
                    set_track_enabled(&senders, kind, enabled, &stream_id).await;
                    Ok(())
                }
                SessionOp::Stats(reply) => {
                    let report = pc.get_stats().await;
                    match serde_json::to_value(&report) {
                        Ok(value) => {
                            let _ = reply.send(value);
                        }
                        Err(e) => log::warn!("[{}] Failed to encode stats: {}", stream_id, e),
                    }
                    Ok(())
                }
                SessionOp::Close => break,
            };

            if let Err(reason) = result {
                log::warn!("[{}] {}", stream_id, reason);
                self.events.post(SessionEvent::NegotiationFailed(reason));
            }
        }

        if let Err(e) = pc.close().await {
            log::warn!("[{}] Failed to close peer connection: {}", stream_id, e);
        }
        self.state.store(ConnectivityState::Closed as u8, Ordering::SeqCst);
        log::debug!("[{}] Peer connection closed", stream_id);
    }

    async fn build_peer_connection(
        &self,
    ) -> Result<(Arc<RTCPeerConnection>, Vec<LocalSender>)> {
        let rtc_config = RTCConfiguration {
            ice_servers: self.params.ice_servers.iter().map(|s| s.to_rtc_ice_server()).collect(),
            ..Default::default()
        };

        let pc = Arc::new(
            self.api
                .new_peer_connection(rtc_config)
                .await
                .map_err(|e| SignalingError::MediaEngine(format!("Failed to create peer connection: {}", e)))?,
        );

        let mut senders = Vec::new();
        if !self.params.play_only {
            let mut tracks = vec![(TrackKind::Audio, self.audio_track.clone())];
            if !self.params.audio_only {
                tracks.push((TrackKind::Video, self.video_track.clone()));
            }
            for (kind, track) in tracks {
                let track = track as Arc<dyn TrackLocal + Send + Sync>;
                let transceiver = pc
                    .add_transceiver_from_track(
                        track.clone(),
                        Some(RTCRtpTransceiverInit {
                            direction: RTCRtpTransceiverDirection::Sendonly,
                            send_encodings: vec![],
                        }),
                    )
                    .await
                    .map_err(|e| {
                        SignalingError::MediaEngine(format!("Failed to add transceiver: {}", e))
                    })?;
                senders.push(LocalSender {
                    kind,
                    sender: transceiver.sender().await,
                    track,
                });
            }
        }

        let events = self.events.clone();
        pc.on_ice_candidate(Box::new(move |candidate: Option<RTCIceCandidate>| {
            let events = events.clone();
            Box::pin(async move {
                let Some(init) = candidate.and_then(|c| c.to_json().ok()) else {
                    return;
                };
                events.post(SessionEvent::Candidate {
                    mid: init.sdp_mid.unwrap_or_default(),
                    mline_index: init.sdp_mline_index.unwrap_or(0),
                    candidate: init.candidate,
                });
            })
        }));

        let events = self.events.clone();
        let state = self.state.clone();
        pc.on_ice_connection_state_change(Box::new(move |s: RTCIceConnectionState| {
            if let Some(new_state) = map_ice_state(s) {
                state.store(new_state as u8, Ordering::SeqCst);
                events.post(SessionEvent::ConnectivityChanged(new_state));
            }
            Box::pin(async {})
        }));

        let events = self.events.clone();
        let handle = self.handle.clone();
        pc.on_data_channel(Box::new(move |dc: Arc<RTCDataChannel>| {
            let channel = WebRtcDataChannel::opened(dc, handle.clone());
            events.post(SessionEvent::DataChannelOpened(Box::new(channel)));
            Box::pin(async {})
        }));

        let events = self.events.clone();
        pc.on_track(Box::new(
            move |track: Arc<TrackRemote>, _receiver: Arc<RTCRtpReceiver>, _transceiver: Arc<RTCRtpTransceiver>| {
                let Some(kind) = map_track_kind(track.kind()) else {
                    return Box::pin(async {});
                };
                let track_id = track.id();
                events.post(SessionEvent::TrackAdded {
                    track_id: track_id.clone(),
                    kind,
                });

                let events = events.clone();
                Box::pin(async move {
                    tokio::spawn(drain_remote_track(track, track_id, events));
                })
            },
        ));

        Ok((pc, senders))
    }

    async fn create_offer(&self, pc: &Arc<RTCPeerConnection>, play_only: bool) -> std::result::Result<(), String> {
        if play_only && pc.get_transceivers().await.is_empty() {
            for kind in [RTPCodecType::Audio, RTPCodecType::Video] {
                pc.add_transceiver_from_kind(
                    kind,
                    Some(RTCRtpTransceiverInit {
                        direction: RTCRtpTransceiverDirection::Recvonly,
                        send_encodings: vec![],
                    }),
                )
                .await
                .map_err(|e| format!("Failed to add recvonly transceiver: {}", e))?;
            }
        }

        let offer = pc
            .create_offer(None)
            .await
            .map_err(|e| format!("Failed to create offer: {}", e))?;
        pc.set_local_description(offer.clone())
            .await
            .map_err(|e| format!("Failed to set local description: {}", e))?;

        self.events.post(SessionEvent::DescriptionCreated {
            kind: SdpKind::Offer,
            sdp: offer.sdp,
        });
        self.events.post(SessionEvent::DescriptionSet { kind: SdpKind::Offer });
        Ok(())
    }

    async fn create_answer(&self, pc: &Arc<RTCPeerConnection>) -> std::result::Result<(), String> {
        let answer = pc
            .create_answer(None)
            .await
            .map_err(|e| format!("Failed to create answer: {}", e))?;
        pc.set_local_description(answer.clone())
            .await
            .map_err(|e| format!("Failed to set local description: {}", e))?;

        self.events.post(SessionEvent::DescriptionCreated {
            kind: SdpKind::Answer,
            sdp: answer.sdp,
        });
        self.events.post(SessionEvent::DescriptionSet { kind: SdpKind::Answer });
        Ok(())
    }
}

/// Detach or restore the local track; the negotiated m-line stays as is
async fn set_track_enabled(
    senders: &[LocalSender],
    kind: TrackKind,
    enabled: bool,
    stream_id: &str,
) {
    for local in senders.iter().filter(|s| s.kind == kind) {
        let track = enabled.then(|| local.track.clone());
        match local.sender.replace_track(track).await {
            Ok(()) => {
                let state = if enabled { "enabled" } else { "disabled" };
                log::info!("[{}] Local {:?} track {}", stream_id, kind, state);
            }
            Err(e) => log::warn!("[{}] Failed to toggle local {:?} track: {}", stream_id, kind, e),
        }
    }
}

/// Read RTP until the remote track ends, then report its removal.
///
/// Depacketizing and decoding belong to the host; the reader only keeps
/// the receive path flowing.
async fn drain_remote_track(track: Arc<TrackRemote>, track_id: String, events: SessionEventSink) {
    let mut packets: u64 = 0;
    loop {
        match track.read_rtp().await {
            Ok(_) => packets += 1,
            Err(e) => {
                log::debug!("[{}] Remote track {} ended after {} packets: {}", events.stream_id(), track_id, packets, e);
                break;
            }
        }
    }
    events.post(SessionEvent::TrackRemoved { track_id });
}
