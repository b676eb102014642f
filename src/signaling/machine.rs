//! Signaling state machine.
//!
//! Owns every piece of per-stream state and runs only on the control
//! context. Inbound frames and posted [`ControlEvent`]s go in, outbound
//! protocol messages accumulate in an ordered outbox that the client drains
//! after each dispatch.

use std::sync::atomic::{AtomicBool, AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;

use tokio::sync::{mpsc, oneshot};

use super::message::{InboundMessage, Notification, OutboundMessage, ServerError};
use super::registry::DataChannelRegistry;
use super::session::{PendingCandidate, SessionEntry, SessionTable};
use crate::config::{Role, SignalingConfig};
use crate::media::{
    ConnectivityState, MediaSessionFactory, SdpKind, SessionEvent, SessionEventSink, SessionParams,
    TrackKind,
};

/// Work for the control context
pub enum ControlEvent {
    /// An engine callback, tagged with the stream it belongs to
    Session { stream_id: String, event: SessionEvent },
    /// Host request to send text over a stream's data channel
    SendData { stream_id: String, text: String },
    /// Host request for the current room membership
    RoomInfo { stream_id: String },
    /// A local track switch changed; applied to the publish stream
    TrackEnabled { kind: TrackKind },
    /// Host request for engine statistics of every stream
    Stats(oneshot::Sender<PendingStats>),
    /// Two-phase teardown of every session; acked when done
    Release(Option<oneshot::Sender<()>>),
    /// Release, then close the signaling socket; acked when the writer drained
    Close(Option<oneshot::Sender<()>>),
}

/// Signaling statistics (atomic, lock-free)
pub struct SignalingStats {
    pub frames_received: AtomicU64,
    pub frames_sent: AtomicU64,
    pub parse_errors: AtomicU64,
    pub reads_armed: AtomicU64,
    pub sessions_created: AtomicU64,
    pub sessions_removed: AtomicU64,
    pub notifications_delivered: AtomicU64,
    pub data_send_failures: AtomicU64,
}

impl Default for SignalingStats {
    fn default() -> Self {
        Self {
            frames_received: AtomicU64::new(0),
            frames_sent: AtomicU64::new(0),
            parse_errors: AtomicU64::new(0),
            reads_armed: AtomicU64::new(0),
            sessions_created: AtomicU64::new(0),
            sessions_removed: AtomicU64::new(0),
            notifications_delivered: AtomicU64::new(0),
            data_send_failures: AtomicU64::new(0),
        }
    }
}

/// Plain copy of [`SignalingStats`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SignalingStatsSnapshot {
    pub frames_received: u64,
    pub frames_sent: u64,
    pub parse_errors: u64,
    pub reads_armed: u64,
    pub sessions_created: u64,
    pub sessions_removed: u64,
    pub notifications_delivered: u64,
    pub data_send_failures: u64,
}

impl SignalingStats {
    pub fn snapshot(&self) -> SignalingStatsSnapshot {
        SignalingStatsSnapshot {
            frames_received: self.frames_received.load(Ordering::Relaxed),
            frames_sent: self.frames_sent.load(Ordering::Relaxed),
            parse_errors: self.parse_errors.load(Ordering::Relaxed),
            reads_armed: self.reads_armed.load(Ordering::Relaxed),
            sessions_created: self.sessions_created.load(Ordering::Relaxed),
            sessions_removed: self.sessions_removed.load(Ordering::Relaxed),
            notifications_delivered: self.notifications_delivered.load(Ordering::Relaxed),
            data_send_failures: self.data_send_failures.load(Ordering::Relaxed),
        }
    }
}

/// Engine statistics of one stream
#[derive(Debug, Clone, PartialEq)]
pub struct StreamStats {
    pub stream_id: String,
    pub report: serde_json::Value,
}

/// Reports still being collected by the engine, one per stream
pub type PendingStats = Vec<(String, oneshot::Receiver<serde_json::Value>)>;

/// Host switches for the local audio and video tracks
#[derive(Debug)]
pub struct LocalTracks {
    audio: AtomicBool,
    video: AtomicBool,
}

impl Default for LocalTracks {
    fn default() -> Self {
        Self {
            audio: AtomicBool::new(true),
            video: AtomicBool::new(true),
        }
    }
}

impl LocalTracks {
    fn flag(&self, kind: TrackKind) -> &AtomicBool {
        match kind {
            TrackKind::Audio => &self.audio,
            TrackKind::Video => &self.video,
        }
    }

    pub fn is_enabled(&self, kind: TrackKind) -> bool {
        self.flag(kind).load(Ordering::SeqCst)
    }

    /// Returns true when the switch changed
    pub fn set_enabled(&self, kind: TrackKind, enabled: bool) -> bool {
        self.flag(kind).swap(enabled, Ordering::SeqCst) != enabled
    }
}

const NO_STATE: u8 = u8::MAX;

/// Aggregate connectivity state readable from any thread
#[derive(Debug)]
pub struct StateCell(AtomicU8);

impl Default for StateCell {
    fn default() -> Self {
        Self(AtomicU8::new(NO_STATE))
    }
}

impl StateCell {
    pub fn get(&self) -> Option<ConnectivityState> {
        ConnectivityState::from_u8(self.0.load(Ordering::SeqCst))
    }

    pub fn set(&self, state: Option<ConnectivityState>) {
        self.0
            .store(state.map(|s| s as u8).unwrap_or(NO_STATE), Ordering::SeqCst);
    }
}

/// Payload text from a stream's data channel
pub type NotifyCallback = Arc<dyn Fn(&str, &str) + Send + Sync>;
/// Remote track appeared on a stream: (stream id, track id, kind)
pub type TrackAddedCallback = Arc<dyn Fn(&str, &str, TrackKind) + Send + Sync>;
/// Remote track ended on a stream: (stream id, track id)
pub type TrackRemovedCallback = Arc<dyn Fn(&str, &str) + Send + Sync>;

/// Host hooks, invoked on the control context
#[derive(Clone, Default)]
pub struct HostCallbacks {
    pub on_notify: Option<NotifyCallback>,
    pub on_track_added: Option<TrackAddedCallback>,
    pub on_track_removed: Option<TrackRemovedCallback>,
}

pub struct SignalingMachine {
    config: Arc<SignalingConfig>,
    factory: Arc<dyn MediaSessionFactory>,
    events_tx: mpsc::UnboundedSender<ControlEvent>,
    sessions: SessionTable,
    data_channels: DataChannelRegistry,
    /// Streams asked to play, in request order
    play_streams: Vec<String>,
    publish_stream: Option<String>,
    play_stream: Option<String>,
    outbox: Vec<OutboundMessage>,
    stats: Arc<SignalingStats>,
    state: Arc<StateCell>,
    tracks: Arc<LocalTracks>,
    callbacks: HostCallbacks,
    released: bool,
}

impl SignalingMachine {
    pub fn new(
        config: Arc<SignalingConfig>,
        factory: Arc<dyn MediaSessionFactory>,
        events_tx: mpsc::UnboundedSender<ControlEvent>,
        callbacks: HostCallbacks,
    ) -> Self {
        Self {
            config,
            factory,
            events_tx,
            sessions: SessionTable::default(),
            data_channels: DataChannelRegistry::default(),
            play_streams: Vec::new(),
            publish_stream: None,
            play_stream: None,
            outbox: Vec::new(),
            stats: Arc::new(SignalingStats::default()),
            state: Arc::new(StateCell::default()),
            tracks: Arc::new(LocalTracks::default()),
            callbacks,
            released: false,
        }
    }

    pub fn stats(&self) -> Arc<SignalingStats> {
        self.stats.clone()
    }

    pub fn state_cell(&self) -> Arc<StateCell> {
        self.state.clone()
    }

    pub fn local_tracks(&self) -> Arc<LocalTracks> {
        self.tracks.clone()
    }

    pub fn play_streams(&self) -> &[String] {
        &self.play_streams
    }

    pub fn publish_stream(&self) -> Option<&str> {
        self.publish_stream.as_deref()
    }

    pub fn is_released(&self) -> bool {
        self.released
    }

    /// Drain queued outbound messages in the order they were produced
    pub fn take_outbound(&mut self) -> Vec<OutboundMessage> {
        std::mem::take(&mut self.outbox)
    }

    /// Issue the entry command for the configured role
    pub fn on_connected(&mut self) {
        let channel_id = self.config.channel_id.clone();
        let msg = if self.config.is_room_mode() {
            OutboundMessage::JoinRoom { room: channel_id }
        } else if self.config.role == Role::Sendonly {
            self.publish_command(channel_id)
        } else {
            OutboundMessage::Play { stream_id: channel_id }
        };
        log::info!("Signaling connected, sending {}", msg.command());
        self.outbox.push(msg);
    }

    /// One inbound text frame
    pub fn handle_text(&mut self, text: &str) {
        self.stats.frames_received.fetch_add(1, Ordering::Relaxed);
        log::trace!("<- {}", text);
        match InboundMessage::parse(text) {
            Ok(msg) => self.dispatch(msg),
            Err(e) => {
                self.stats.parse_errors.fetch_add(1, Ordering::Relaxed);
                log::warn!("Ignoring signaling frame: {}", e);
            }
        }
        self.rearm();
    }

    /// One inbound binary/ping/pong frame
    pub fn handle_other_frame(&mut self) {
        self.stats.frames_received.fetch_add(1, Ordering::Relaxed);
        self.rearm();
    }

    fn rearm(&mut self) {
        self.stats.reads_armed.fetch_add(1, Ordering::Relaxed);
        self.publish_state();
    }

    pub fn handle_control(&mut self, event: ControlEvent) {
        match event {
            ControlEvent::Session { stream_id, event } => self.on_session_event(&stream_id, event),
            ControlEvent::SendData { stream_id, text } => {
                if let Err(e) = self.data_channels.send(&stream_id, &text) {
                    self.stats.data_send_failures.fetch_add(1, Ordering::Relaxed);
                    log::warn!("[{}] {}", stream_id, e);
                }
            }
            ControlEvent::RoomInfo { stream_id } => {
                self.outbox.push(OutboundMessage::GetRoomInfo {
                    room: self.config.channel_id.clone(),
                    stream_id,
                });
            }
            ControlEvent::TrackEnabled { kind } => self.apply_track_enabled(kind),
            ControlEvent::Stats(reply) => {
                let _ = reply.send(self.request_stats());
            }
            ControlEvent::Release(ack) => {
                self.release();
                if let Some(ack) = ack {
                    let _ = ack.send(());
                }
            }
            ControlEvent::Close(_) => log::debug!("Close is handled by the control loop"),
        }
        self.publish_state();
    }

    /// Aggregate connectivity of the role-relevant stream
    pub fn connection_state(&self) -> Option<ConnectivityState> {
        let stream_id = match (self.config.role, self.config.multistream) {
            (Role::Sendrecv, true) | (Role::Sendonly, _) => self.publish_stream.as_deref(),
            (Role::Recvonly, _) | (Role::Sendrecv, false) => self.play_stream.as_deref(),
        };
        stream_id
            .and_then(|id| self.sessions.get(id))
            .map(|entry| entry.state)
    }

    fn publish_state(&self) {
        self.state.set(self.connection_state());
    }

    /// Tear every session down. Observers and sinks are detached before any
    /// session is closed, so no engine callback reaches a dead entry.
    pub fn release(&mut self) {
        if self.released {
            return;
        }
        self.released = true;

        self.data_channels.detach_all();
        self.sessions.detach_all();

        let removed = self.sessions.len() as u64;
        self.sessions.close_all();
        self.stats.sessions_removed.fetch_add(removed, Ordering::Relaxed);

        self.publish_stream = None;
        self.play_stream = None;
        self.publish_state();
        log::info!("Released {} media session(s)", removed);
    }

    /// Push the current switch for `kind` to the publish stream's session
    fn apply_track_enabled(&self, kind: TrackKind) {
        let enabled = self.tracks.is_enabled(kind);
        let Some(stream_id) = self.publish_stream.as_deref() else {
            log::debug!("Local {:?} track {} with no publish stream", kind, enabled);
            return;
        };
        if let Some(entry) = self.sessions.get(stream_id) {
            entry.session.set_track_enabled(kind, enabled);
        }
    }

    /// Ask every session for its statistics, in stream id order
    fn request_stats(&self) -> PendingStats {
        let mut stream_ids: Vec<&str> = self.sessions.stream_ids().collect();
        stream_ids.sort_unstable();
        stream_ids
            .into_iter()
            .filter_map(|stream_id| {
                let entry = self.sessions.get(stream_id)?;
                match entry.session.stats() {
                    Ok(report) => Some((stream_id.to_string(), report)),
                    Err(e) => {
                        log::warn!("[{}] No stats: {}", stream_id, e);
                        None
                    }
                }
            })
            .collect()
    }

    fn publish_command(&self, stream_id: String) -> OutboundMessage {
        OutboundMessage::Publish {
            stream_id,
            video: !self.config.audio_only,
            metadata: self.config.metadata.clone(),
        }
    }

    fn dispatch(&mut self, msg: InboundMessage) {
        match msg {
            InboundMessage::Start { stream_id } => self.on_start(stream_id),
            InboundMessage::TakeConfiguration {
                stream_id,
                kind: SdpKind::Answer,
                sdp,
            } => self.on_remote_answer(&stream_id, &sdp),
            InboundMessage::TakeConfiguration {
                stream_id,
                kind: SdpKind::Offer,
                sdp,
            } => self.on_remote_offer(stream_id, &sdp),
            InboundMessage::TakeCandidate {
                stream_id,
                mid,
                mline_index,
                candidate,
            } => {
                self.outbox.push(OutboundMessage::Ping);
                match self.sessions.get_mut(&stream_id) {
                    Some(entry) => entry.add_candidate(
                        PendingCandidate {
                            mid,
                            mline_index,
                            candidate,
                        },
                        &stream_id,
                    ),
                    None => log::warn!("[{}] Candidate for unknown stream", stream_id),
                }
            }
            InboundMessage::Pong => {
                if !self.connection_state().is_some_and(|s| s.is_connected()) {
                    self.outbox.push(OutboundMessage::Ping);
                }
            }
            InboundMessage::Notification(notification) => self.on_notification(notification),
            InboundMessage::RoomInformation { streams } => {
                self.play_streams.clear();
                for stream_id in streams {
                    if !self.sessions.contains(&stream_id) {
                        self.outbox.push(OutboundMessage::Play {
                            stream_id: stream_id.clone(),
                        });
                    }
                    if !self.play_streams.contains(&stream_id) {
                        self.play_streams.push(stream_id);
                    }
                }
            }
            InboundMessage::Error(ServerError::PublishTimeout) => {
                log::error!("Publish timed out, resetting publish stream");
                if let Some(stream_id) = self.publish_stream.take() {
                    self.remove_stream(&stream_id);
                }
            }
            InboundMessage::Error(ServerError::NoStreamExist) => {
                log::info!("Server reports no stream with the requested id");
            }
            InboundMessage::Error(ServerError::Other(definition)) => {
                log::warn!("Server error: {}", definition);
            }
            InboundMessage::Unrecognized(command) => {
                log::debug!("Unhandled signaling command '{}'", command);
            }
        }
    }

    fn on_notification(&mut self, notification: Notification) {
        match notification {
            Notification::JoinedTheRoom { stream_id, streams } => {
                log::info!(
                    "Joined room '{}' as '{}' ({} stream(s))",
                    self.config.channel_id,
                    stream_id,
                    streams.len()
                );
                let publish = self.publish_command(stream_id);
                self.outbox.push(publish);
                for stream_id in streams {
                    if self.play_streams.contains(&stream_id) {
                        continue;
                    }
                    self.outbox.push(OutboundMessage::Play {
                        stream_id: stream_id.clone(),
                    });
                    self.play_streams.push(stream_id);
                }
            }
            Notification::PlayFinished { stream_id } => {
                if self.remove_stream(&stream_id) {
                    log::info!("[{}] Play finished, stream removed", stream_id);
                }
            }
            Notification::BitrateMeasurement => self.outbox.push(OutboundMessage::Ping),
            Notification::Other(definition) => log::info!("Notification: {}", definition),
        }
    }

    fn on_start(&mut self, stream_id: String) {
        if self.released {
            log::debug!("[{}] Ignoring start after release", stream_id);
            return;
        }
        self.remove_stream(&stream_id);

        let play_only = self.play_only(&stream_id);
        if !self.create_session(&stream_id, play_only) {
            return;
        }
        if let Some(entry) = self.sessions.get_mut(&stream_id) {
            match entry.session.create_data_channel(&stream_id) {
                Ok(channel) => self.data_channels.attach(&stream_id, channel, &entry.sink),
                Err(e) => log::warn!("[{}] No DataChannel: {}", stream_id, e),
            }
            if !play_only {
                for kind in [TrackKind::Audio, TrackKind::Video] {
                    if !self.tracks.is_enabled(kind) {
                        entry.session.set_track_enabled(kind, false);
                    }
                }
            }
            entry.session.create_offer(play_only);
        }
        self.publish_stream = Some(stream_id);
    }

    fn on_remote_answer(&mut self, stream_id: &str, sdp: &str) {
        let Some(entry) = self.sessions.get_mut(stream_id) else {
            log::warn!("[{}] Answer for unknown stream", stream_id);
            return;
        };
        match entry.session.set_remote_description(SdpKind::Answer, sdp) {
            Ok(()) => {
                entry.on_remote_description(SdpKind::Answer);
                entry.flush_candidates(stream_id);
            }
            Err(e) => {
                log::warn!("[{}] Remote answer rejected: {}", stream_id, e);
                entry.fail();
            }
        }
    }

    fn on_remote_offer(&mut self, stream_id: String, sdp: &str) {
        if self.released {
            log::debug!("[{}] Ignoring offer after release", stream_id);
            return;
        }
        if !self.sessions.contains(&stream_id) {
            let play_only = self.play_only(&stream_id);
            if !self.create_session(&stream_id, play_only) {
                return;
            }
        }
        if let Some(entry) = self.sessions.get_mut(&stream_id) {
            match entry.session.set_remote_description(SdpKind::Offer, sdp) {
                Ok(()) => {
                    entry.on_remote_description(SdpKind::Offer);
                    entry.flush_candidates(&stream_id);
                    entry.session.create_answer();
                }
                Err(e) => {
                    log::warn!("[{}] Remote offer rejected: {}", stream_id, e);
                    entry.fail();
                }
            }
        }
        self.play_stream = Some(stream_id);
    }

    fn on_session_event(&mut self, stream_id: &str, event: SessionEvent) {
        let Some(entry) = self.sessions.get_mut(stream_id) else {
            log::trace!("[{}] Dropping {:?} for retired stream", stream_id, event);
            return;
        };

        match event {
            SessionEvent::DescriptionCreated { kind, sdp } => {
                entry.on_local_description(kind);
                log::debug!("[{}] Sending local {}", stream_id, kind.as_str());
                self.outbox.push(OutboundMessage::TakeConfiguration {
                    stream_id: stream_id.to_string(),
                    kind: kind.as_str().to_string(),
                    sdp,
                });
            }
            SessionEvent::DescriptionSet { kind } => {
                log::debug!("[{}] {} description applied", stream_id, kind.as_str());
            }
            SessionEvent::Candidate {
                mid,
                mline_index,
                candidate,
            } => {
                self.outbox.push(OutboundMessage::TakeCandidate {
                    stream_id: stream_id.to_string(),
                    label: mline_index,
                    id: mid,
                    candidate,
                });
            }
            SessionEvent::ConnectivityChanged(state) => {
                log::info!("[{}] ICE connection state: {}", stream_id, state);
                entry.state = state;
            }
            SessionEvent::DataChannelOpened(channel) => {
                log::debug!("[{}] Remote DataChannel '{}' opened", stream_id, channel.label());
                self.data_channels.attach(stream_id, channel, &entry.sink);
            }
            SessionEvent::DataChannelMessage(data) => {
                if !self.data_channels.contains(stream_id) {
                    return;
                }
                let text = String::from_utf8_lossy(&data);
                self.stats.notifications_delivered.fetch_add(1, Ordering::Relaxed);
                if let Some(on_notify) = &self.callbacks.on_notify {
                    on_notify(stream_id, &text);
                }
            }
            SessionEvent::TrackAdded { track_id, kind } => {
                log::info!("[{}] Remote {:?} track {}", stream_id, kind, track_id);
                if let Some(on_track_added) = &self.callbacks.on_track_added {
                    on_track_added(stream_id, &track_id, kind);
                }
            }
            SessionEvent::TrackRemoved { track_id } => {
                log::info!("[{}] Remote track {} removed", stream_id, track_id);
                if let Some(on_track_removed) = &self.callbacks.on_track_removed {
                    on_track_removed(stream_id, &track_id);
                }
            }
            SessionEvent::NegotiationFailed(reason) => {
                log::warn!("[{}] Negotiation failed: {}", stream_id, reason);
                entry.fail();
            }
        }
    }

    fn play_only(&self, stream_id: &str) -> bool {
        self.config.role == Role::Recvonly
            || self
                .publish_stream
                .as_deref()
                .is_some_and(|publish| publish != stream_id)
    }

    fn create_session(&mut self, stream_id: &str, play_only: bool) -> bool {
        let sink = SessionEventSink::new(stream_id, self.events_tx.clone());
        let params = SessionParams {
            stream_id: stream_id.to_string(),
            ice_servers: self.config.ice_servers.clone(),
            audio_only: self.config.audio_only,
            play_only,
        };

        match self.factory.create_session(params, sink.clone()) {
            Some(session) => {
                self.sessions.insert(stream_id, SessionEntry::new(session, sink));
                self.stats.sessions_created.fetch_add(1, Ordering::Relaxed);
                log::debug!("[{}] Media session created (play_only={})", stream_id, play_only);
                true
            }
            None => {
                log::error!("[{}] Media engine could not create a session", stream_id);
                false
            }
        }
    }

    /// Detach the data channel and retire the entry; false when neither existed
    fn remove_stream(&mut self, stream_id: &str) -> bool {
        let had_channel = self.data_channels.detach(stream_id);
        let had_session = self.sessions.retire(stream_id);
        if had_session {
            self.stats.sessions_removed.fetch_add(1, Ordering::Relaxed);
        }
        had_channel || had_session
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::signaling::fakes::{Call, FakeDataChannel, FakeEngine};
    use parking_lot::Mutex;
    use serde_json::json;

    struct Harness {
        machine: SignalingMachine,
        engine: Arc<FakeEngine>,
        rx: mpsc::UnboundedReceiver<ControlEvent>,
    }

    impl Harness {
        fn new(config: SignalingConfig) -> Self {
            Self::with_callbacks(config, HostCallbacks::default())
        }

        fn with_callbacks(config: SignalingConfig, callbacks: HostCallbacks) -> Self {
            let engine = FakeEngine::new();
            let (tx, rx) = mpsc::unbounded_channel();
            let factory: Arc<dyn MediaSessionFactory> = Arc::new(engine.clone());
            let machine = SignalingMachine::new(Arc::new(config), factory, tx, callbacks);
            Self { machine, engine, rx }
        }

        fn text(&mut self, value: serde_json::Value) {
            self.machine.handle_text(&value.to_string());
        }

        /// Post an engine event through the stream's sink and process it
        fn engine_event(&mut self, stream_id: &str, event: SessionEvent) {
            self.engine.sink(stream_id).unwrap().post(event);
            self.pump();
        }

        fn pump(&mut self) {
            while let Ok(event) = self.rx.try_recv() {
                self.machine.handle_control(event);
            }
        }

        fn sent(&mut self) -> Vec<serde_json::Value> {
            self.machine
                .take_outbound()
                .iter()
                .map(|m| serde_json::from_str(&m.to_text().unwrap()).unwrap())
                .collect()
        }
    }

    fn config(role: Role, multistream: bool) -> SignalingConfig {
        SignalingConfig::new("wss://media.example.com/WebRTCAppEE/websocket", "room1")
            .with_role(role)
            .with_multistream(multistream)
    }

    fn offer(stream_id: &str) -> serde_json::Value {
        json!({"command": "takeConfiguration", "streamId": stream_id, "type": "offer", "sdp": "v=0 offer"})
    }

    fn answer(stream_id: &str) -> serde_json::Value {
        json!({"command": "takeConfiguration", "streamId": stream_id, "type": "answer", "sdp": "v=0 answer"})
    }

    fn candidate(stream_id: &str, label: u16) -> serde_json::Value {
        json!({"command": "takeCandidate", "streamId": stream_id, "id": label.to_string(), "label": label, "candidate": "candidate:1"})
    }

    #[test]
    fn test_entry_command_per_role() {
        let mut h = Harness::new(config(Role::Sendrecv, true));
        h.machine.on_connected();
        assert_eq!(h.sent(), vec![json!({"command": "joinRoom", "room": "room1"})]);

        let mut h = Harness::new(
            config(Role::Sendonly, false)
                .with_audio_only(true)
                .with_metadata(json!({"title": "cam"})),
        );
        h.machine.on_connected();
        assert_eq!(
            h.sent(),
            vec![json!({"command": "publish", "streamId": "room1", "video": false, "metaData": {"title": "cam"}})]
        );

        for (role, multistream) in [(Role::Recvonly, false), (Role::Recvonly, true), (Role::Sendrecv, false)] {
            let mut h = Harness::new(config(role, multistream));
            h.machine.on_connected();
            assert_eq!(h.sent(), vec![json!({"command": "play", "streamId": "room1"})]);
        }
    }

    #[test]
    fn test_start_publishes_with_offer_and_channel() {
        let mut h = Harness::new(config(Role::Sendonly, false));
        h.text(json!({"command": "start", "streamId": "pub1"}));

        assert_eq!(
            h.engine.calls("pub1"),
            vec![
                Call::CreateDataChannel("pub1".to_string()),
                Call::CreateOffer { play_only: false },
            ]
        );
        assert_eq!(h.machine.publish_stream(), Some("pub1"));
        assert!(!h.engine.params()[0].play_only);

        h.engine_event(
            "pub1",
            SessionEvent::DescriptionCreated {
                kind: SdpKind::Offer,
                sdp: "v=0 local".to_string(),
            },
        );
        assert_eq!(
            h.sent(),
            vec![json!({"command": "takeConfiguration", "streamId": "pub1", "type": "offer", "sdp": "v=0 local"})]
        );

        h.text(answer("pub1"));
        assert!(h.engine.calls("pub1").contains(&Call::SetRemote {
            kind: SdpKind::Answer,
            sdp: "v=0 answer".to_string(),
        }));
        assert_eq!(
            h.machine.sessions.get("pub1").unwrap().phase,
            super::super::session::NegotiationPhase::Stable
        );
    }

    #[test]
    fn test_offer_answer_round_trip_for_play() {
        let mut h = Harness::new(config(Role::Recvonly, false));
        h.text(offer("viewer"));

        assert!(h.engine.params()[0].play_only);
        assert_eq!(
            h.engine.calls("viewer"),
            vec![
                Call::SetRemote {
                    kind: SdpKind::Offer,
                    sdp: "v=0 offer".to_string(),
                },
                Call::CreateAnswer,
            ]
        );

        h.engine_event(
            "viewer",
            SessionEvent::DescriptionCreated {
                kind: SdpKind::Answer,
                sdp: "v=0 local answer".to_string(),
            },
        );
        assert_eq!(
            h.sent(),
            vec![json!({"command": "takeConfiguration", "streamId": "viewer", "type": "answer", "sdp": "v=0 local answer"})]
        );

        // A second offer for the same stream reuses the session
        h.text(offer("viewer"));
        assert_eq!(h.engine.params().len(), 1);
    }

    #[test]
    fn test_candidates_pinged_and_queued_until_answer() {
        let mut h = Harness::new(config(Role::Sendonly, false));
        h.text(json!({"command": "start", "streamId": "pub1"}));
        h.text(candidate("pub1", 0));
        h.text(candidate("pub1", 1));
        h.text(candidate("ghost", 0));

        assert_eq!(h.sent(), vec![json!({"command": "ping"}); 3]);
        assert!(!h
            .engine
            .calls("pub1")
            .iter()
            .any(|c| matches!(c, Call::AddCandidate { .. })));

        h.text(answer("pub1"));
        let labels: Vec<u16> = h
            .engine
            .calls("pub1")
            .into_iter()
            .filter_map(|c| match c {
                Call::AddCandidate { mline_index, .. } => Some(mline_index),
                _ => None,
            })
            .collect();
        assert_eq!(labels, vec![0, 1]);
    }

    #[test]
    fn test_local_candidate_wire_mapping() {
        let mut h = Harness::new(config(Role::Sendonly, false));
        h.text(json!({"command": "start", "streamId": "pub1"}));
        h.engine_event(
            "pub1",
            SessionEvent::Candidate {
                mid: "0".to_string(),
                mline_index: 0,
                candidate: "candidate:host".to_string(),
            },
        );
        assert_eq!(
            h.sent(),
            vec![json!({"command": "takeCandidate", "streamId": "pub1", "label": 0, "id": "0", "candidate": "candidate:host"})]
        );
    }

    #[test]
    fn test_play_finished_is_idempotent() {
        let mut h = Harness::new(config(Role::Sendrecv, true));
        h.text(offer("remote1"));
        h.engine_event(
            "remote1",
            SessionEvent::DataChannelOpened(FakeDataChannel::boxed(&h.engine, "remote1")),
        );
        assert!(h.machine.data_channels.contains("remote1"));

        let finished = json!({"command": "notification", "definition": "play_finished", "streamId": "remote1"});
        h.text(finished.clone());
        h.text(finished);

        assert!(!h.machine.sessions.contains("remote1"));
        assert!(!h.machine.data_channels.contains("remote1"));
        let stats = h.machine.stats().snapshot();
        assert_eq!(stats.sessions_removed, 1);
        let calls = h.engine.calls("remote1");
        assert_eq!(calls.iter().filter(|c| **c == Call::Close).count(), 1);
        assert_eq!(calls.iter().filter(|c| **c == Call::DetachChannel).count(), 1);
    }

    #[test]
    fn test_joined_the_room_publishes_then_plays_new_streams() {
        let mut h = Harness::new(config(Role::Sendrecv, true));
        h.text(json!({"command": "notification", "definition": "joinedTheRoom", "streamId": "me", "streams": ["a", "b"]}));
        assert_eq!(
            h.sent(),
            vec![
                json!({"command": "publish", "streamId": "me", "video": true}),
                json!({"command": "play", "streamId": "a"}),
                json!({"command": "play", "streamId": "b"}),
            ]
        );

        h.text(json!({"command": "notification", "definition": "joinedTheRoom", "streamId": "me", "streams": ["b", "c"]}));
        assert_eq!(
            h.sent(),
            vec![
                json!({"command": "publish", "streamId": "me", "video": true}),
                json!({"command": "play", "streamId": "c"}),
            ]
        );
        assert_eq!(h.machine.play_streams(), ["a", "b", "c"]);
    }

    #[test]
    fn test_room_information_skips_active_streams() {
        let mut h = Harness::new(config(Role::Sendrecv, true));
        h.text(json!({"command": "notification", "definition": "joinedTheRoom", "streamId": "me", "streams": ["a", "b"]}));
        h.text(offer("a"));
        h.sent();

        h.text(json!({"command": "roomInformation", "room": "room1", "streams": ["a", "d"]}));
        assert_eq!(h.sent(), vec![json!({"command": "play", "streamId": "d"})]);
        assert_eq!(h.machine.play_streams(), ["a", "d"]);
    }

    #[test]
    fn test_aggregate_state_follows_role() {
        // Room mode tracks the publish stream
        let mut h = Harness::new(config(Role::Sendrecv, true));
        assert_eq!(h.machine.connection_state(), None);
        h.text(json!({"command": "start", "streamId": "me"}));
        h.text(offer("other"));
        h.engine_event("other", SessionEvent::ConnectivityChanged(ConnectivityState::Connected));
        assert_eq!(h.machine.connection_state(), Some(ConnectivityState::New));
        h.engine_event("me", SessionEvent::ConnectivityChanged(ConnectivityState::Completed));
        assert_eq!(h.machine.connection_state(), Some(ConnectivityState::Completed));
        assert_eq!(h.machine.state_cell().get(), Some(ConnectivityState::Completed));

        // Recvonly tracks the play stream
        let mut h = Harness::new(config(Role::Recvonly, false));
        h.text(offer("viewer"));
        h.engine_event("viewer", SessionEvent::ConnectivityChanged(ConnectivityState::Checking));
        assert_eq!(h.machine.connection_state(), Some(ConnectivityState::Checking));

        // Sendrecv without multistream tracks the play stream
        let mut h = Harness::new(config(Role::Sendrecv, false));
        h.text(json!({"command": "start", "streamId": "pub"}));
        h.engine_event("pub", SessionEvent::ConnectivityChanged(ConnectivityState::Connected));
        assert_eq!(h.machine.connection_state(), None);
    }

    #[test]
    fn test_pong_pings_until_connected() {
        let mut h = Harness::new(config(Role::Sendonly, false));
        h.text(json!({"command": "start", "streamId": "pub1"}));
        h.text(json!({"command": "pong"}));
        assert_eq!(h.sent(), vec![json!({"command": "ping"})]);

        h.engine_event("pub1", SessionEvent::ConnectivityChanged(ConnectivityState::Connected));
        h.text(json!({"command": "pong"}));
        assert!(h.sent().is_empty());

        h.text(json!({"command": "notification", "definition": "bitrateMeasurement"}));
        assert_eq!(h.sent(), vec![json!({"command": "ping"})]);
    }

    #[test]
    fn test_publish_timeout_resets_publish_stream() {
        let mut h = Harness::new(config(Role::Sendonly, false));
        h.text(json!({"command": "start", "streamId": "pub1"}));
        h.text(json!({"command": "error", "defition": "publishTimeoutError"}));

        assert_eq!(h.machine.publish_stream(), None);
        assert!(!h.machine.sessions.contains("pub1"));
        assert!(!h.machine.data_channels.contains("pub1"));
        assert!(h.engine.sink("pub1").unwrap().is_detached());
        assert!(h.engine.calls("pub1").ends_with(&[Call::DetachChannel, Call::Close]));

        // Server-side no_stream_exist is informational only
        h.text(json!({"command": "error", "definition": "no_stream_exist"}));
        assert!(h.sent().is_empty());
    }

    #[test]
    fn test_restart_retires_previous_entry() {
        let mut h = Harness::new(config(Role::Sendonly, false));
        h.text(json!({"command": "start", "streamId": "pub1"}));
        let first_sink = h.engine.sink("pub1").unwrap();
        h.text(json!({"command": "start", "streamId": "pub1"}));

        assert!(first_sink.is_detached());
        assert!(!h.engine.sink("pub1").unwrap().is_detached());
        assert_eq!(h.engine.params().len(), 2);
        assert!(!h.engine.params()[1].play_only);
    }

    #[test]
    fn test_release_quiesces_sinks_and_ignores_later_commands() {
        let mut h = Harness::new(config(Role::Sendrecv, true));
        h.text(json!({"command": "start", "streamId": "me"}));
        h.text(offer("a"));
        let sinks = [h.engine.sink("me").unwrap(), h.engine.sink("a").unwrap()];

        let (ack_tx, mut ack_rx) = oneshot::channel();
        h.machine.handle_control(ControlEvent::Release(Some(ack_tx)));
        assert!(ack_rx.try_recv().is_ok());
        assert!(sinks.iter().all(|s| s.is_detached()));
        assert!(h.engine.calls("me").contains(&Call::Close));
        assert!(h.engine.calls("a").contains(&Call::Close));
        assert_eq!(h.machine.connection_state(), None);

        // Late engine callbacks and commands change nothing
        sinks[0].post(SessionEvent::ConnectivityChanged(ConnectivityState::Connected));
        h.pump();
        h.text(json!({"command": "start", "streamId": "me2"}));
        h.text(offer("b"));
        assert_eq!(h.engine.params().len(), 2);
        assert!(h.machine.is_released());
    }

    #[test]
    fn test_send_data_on_missing_channel_counts_failure() {
        let mut h = Harness::new(config(Role::Sendonly, false));
        h.machine.handle_control(ControlEvent::SendData {
            stream_id: "nobody".to_string(),
            text: "hi".to_string(),
        });
        assert_eq!(h.machine.stats().snapshot().data_send_failures, 1);

        h.text(json!({"command": "start", "streamId": "pub1"}));
        h.machine.handle_control(ControlEvent::SendData {
            stream_id: "pub1".to_string(),
            text: "hello".to_string(),
        });
        assert!(h.engine.calls("pub1").contains(&Call::SendText("hello".to_string())));
        assert_eq!(h.machine.stats().snapshot().data_send_failures, 1);
    }

    #[test]
    fn test_one_rearm_per_frame() {
        let mut h = Harness::new(config(Role::Sendonly, false));
        h.machine.handle_text(r#"{"command":"pong"}"#);
        h.machine.handle_text("{garbage");
        h.machine.handle_text(r#"{"command":"somethingNew"}"#);
        h.machine.handle_text(r#"{"command":"start"}"#);
        h.machine.handle_other_frame();

        let stats = h.machine.stats().snapshot();
        assert_eq!(stats.frames_received, 5);
        assert_eq!(stats.reads_armed, 5);
        assert_eq!(stats.parse_errors, 2);
    }

    #[test]
    fn test_outbound_order_matches_processing_order() {
        let mut h = Harness::new(config(Role::Sendrecv, true));
        h.machine.on_connected();
        h.text(json!({"command": "start", "streamId": "me"}));
        h.text(candidate("me", 0));
        h.engine_event(
            "me",
            SessionEvent::DescriptionCreated {
                kind: SdpKind::Offer,
                sdp: "v=0".to_string(),
            },
        );
        h.machine.handle_control(ControlEvent::RoomInfo {
            stream_id: "me".to_string(),
        });
        h.text(json!({"command": "pong"}));

        let commands: Vec<String> = h
            .sent()
            .iter()
            .map(|m| m["command"].as_str().unwrap().to_string())
            .collect();
        assert_eq!(commands, ["joinRoom", "ping", "takeConfiguration", "getRoomInfo", "ping"]);
    }

    #[test]
    fn test_data_channel_payload_reaches_host() {
        let received = Arc::new(Mutex::new(Vec::new()));
        let sink = received.clone();
        let callbacks = HostCallbacks {
            on_notify: Some(Arc::new(move |stream_id: &str, text: &str| {
                sink.lock().push(format!("{}:{}", stream_id, text));
            })),
            ..Default::default()
        };
        let mut h = Harness::with_callbacks(config(Role::Sendonly, false), callbacks);
        h.text(json!({"command": "start", "streamId": "pub1"}));

        assert!(h.engine.deliver("pub1", b"{\"chat\":\"hi\"}"));
        h.pump();
        assert_eq!(*received.lock(), vec!["pub1:{\"chat\":\"hi\"}".to_string()]);

        // After play_finished the observer is gone
        h.text(json!({"command": "notification", "definition": "play_finished", "streamId": "pub1"}));
        assert!(!h.engine.deliver("pub1", b"late"));
        assert_eq!(h.machine.stats().snapshot().notifications_delivered, 1);
    }

    #[test]
    fn test_track_callbacks() {
        let events = Arc::new(Mutex::new(Vec::new()));
        let added = events.clone();
        let removed = events.clone();
        let callbacks = HostCallbacks {
            on_track_added: Some(Arc::new(move |stream_id: &str, track_id: &str, kind: TrackKind| {
                added.lock().push(format!("+{}/{}/{:?}", stream_id, track_id, kind));
            })),
            on_track_removed: Some(Arc::new(move |stream_id: &str, track_id: &str| {
                removed.lock().push(format!("-{}/{}", stream_id, track_id));
            })),
            ..Default::default()
        };
        let mut h = Harness::with_callbacks(config(Role::Recvonly, false), callbacks);
        h.text(offer("viewer"));
        h.engine_event(
            "viewer",
            SessionEvent::TrackAdded {
                track_id: "v0".to_string(),
                kind: TrackKind::Video,
            },
        );
        h.engine_event(
            "viewer",
            SessionEvent::TrackRemoved {
                track_id: "v0".to_string(),
            },
        );
        assert_eq!(*events.lock(), vec!["+viewer/v0/Video".to_string(), "-viewer/v0".to_string()]);
    }

    #[test]
    fn test_negotiation_failures_are_per_stream() {
        let mut h = Harness::new(config(Role::Sendrecv, true));
        h.text(json!({"command": "takeConfiguration", "streamId": "bad", "type": "offer", "sdp": "garbage"}));
        h.text(offer("good"));
        h.engine_event("good", SessionEvent::NegotiationFailed("dtls".to_string()));
        h.text(offer("fine"));

        use super::super::session::NegotiationPhase;
        assert_eq!(h.machine.sessions.get("bad").unwrap().phase, NegotiationPhase::Failed);
        assert_eq!(h.machine.sessions.get("good").unwrap().phase, NegotiationPhase::Failed);
        assert_eq!(h.machine.sessions.get("fine").unwrap().phase, NegotiationPhase::HaveRemoteOffer);
        assert!(!h.engine.calls("bad").contains(&Call::CreateAnswer));
    }

    #[test]
    fn test_factory_refusal_abandons_stream() {
        let mut h = Harness::new(config(Role::Sendonly, false));
        h.engine.refuse_sessions(true);
        h.text(json!({"command": "start", "streamId": "pub1"}));

        assert!(h.machine.sessions.is_empty());
        assert_eq!(h.machine.publish_stream(), None);
        assert!(h.engine.calls("pub1").is_empty());
    }

    #[test]
    fn test_concurrent_engine_callbacks_keep_per_stream_order() {
        let mut h = Harness::new(config(Role::Sendrecv, true));
        h.text(json!({"command": "start", "streamId": "a"}));
        h.text(offer("b"));
        h.sent();

        let sinks = [h.engine.sink("a").unwrap(), h.engine.sink("b").unwrap()];
        let threads: Vec<_> = sinks
            .into_iter()
            .map(|sink| {
                std::thread::spawn(move || {
                    for i in 0..50u16 {
                        let state = if i % 2 == 0 {
                            ConnectivityState::Checking
                        } else {
                            ConnectivityState::Connected
                        };
                        sink.post(SessionEvent::ConnectivityChanged(state));
                        sink.post(SessionEvent::Candidate {
                            mid: i.to_string(),
                            mline_index: i,
                            candidate: format!("candidate:{}", i),
                        });
                    }
                })
            })
            .collect();
        for thread in threads {
            thread.join().unwrap();
        }

        let mut received = Vec::new();
        while let Ok(event) = h.rx.try_recv() {
            if let ControlEvent::Session {
                stream_id,
                event: SessionEvent::Candidate { mline_index, .. },
            } = &event
            {
                received.push((stream_id.clone(), *mline_index));
            }
            h.machine.handle_control(event);
        }

        let sent: Vec<(String, u16)> = h
            .sent()
            .iter()
            .map(|m| {
                let stream_id = m["streamId"].as_str().unwrap().to_string();
                (stream_id, m["label"].as_u64().unwrap() as u16)
            })
            .collect();
        assert_eq!(received.len(), 100);
        assert_eq!(sent, received);
        for stream_id in ["a", "b"] {
            let labels: Vec<u16> = sent
                .iter()
                .filter(|(id, _)| id == stream_id)
                .map(|(_, label)| *label)
                .collect();
            assert_eq!(labels, (0..50).collect::<Vec<u16>>());
        }
        assert_eq!(h.machine.connection_state(), Some(ConnectivityState::Connected));
        assert_eq!(h.machine.sessions.get("b").unwrap().state, ConnectivityState::Connected);
    }

    #[test]
    fn test_track_switches_follow_publish_stream() {
        let mut h = Harness::new(config(Role::Sendrecv, true));
        let tracks = h.machine.local_tracks();

        assert!(tracks.set_enabled(TrackKind::Video, false));
        assert!(!tracks.set_enabled(TrackKind::Video, false));
        h.machine.handle_control(ControlEvent::TrackEnabled {
            kind: TrackKind::Video,
        });

        h.text(json!({"command": "start", "streamId": "me"}));
        assert_eq!(
            h.engine.calls("me"),
            vec![
                Call::CreateDataChannel("me".to_string()),
                Call::SetTrackEnabled {
                    kind: TrackKind::Video,
                    enabled: false,
                },
                Call::CreateOffer { play_only: false },
            ]
        );

        h.text(offer("other"));
        tracks.set_enabled(TrackKind::Audio, false);
        h.machine.handle_control(ControlEvent::TrackEnabled {
            kind: TrackKind::Audio,
        });
        assert!(h.engine.calls("me").contains(&Call::SetTrackEnabled {
            kind: TrackKind::Audio,
            enabled: false,
        }));
        assert!(!h
            .engine
            .calls("other")
            .iter()
            .any(|c| matches!(c, Call::SetTrackEnabled { .. })));
        assert!(!tracks.is_enabled(TrackKind::Audio));
    }

    #[tokio::test]
    async fn test_stats_requested_from_every_session() {
        let mut h = Harness::new(config(Role::Sendrecv, true));
        h.text(json!({"command": "start", "streamId": "pub1"}));
        h.text(offer("remote1"));

        let (reply_tx, reply_rx) = oneshot::channel();
        h.machine.handle_control(ControlEvent::Stats(reply_tx));
        let pending = reply_rx.await.unwrap();

        let mut reports = Vec::new();
        for (stream_id, report) in pending {
            reports.push((stream_id, report.await.unwrap()));
        }
        assert_eq!(
            reports,
            vec![
                ("pub1".to_string(), json!({"streamId": "pub1"})),
                ("remote1".to_string(), json!({"streamId": "remote1"})),
            ]
        );
        assert!(h.engine.calls("remote1").contains(&Call::Stats));
    }
}
