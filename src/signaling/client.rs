//! Signaling client: the control context and the host-facing handle.
//!
//! One tokio task owns the socket reader and the [`SignalingMachine`]. It
//! selects between the next inbound frame and the next posted
//! [`ControlEvent`], and after every step hands the machine's outbox to the
//! writer task in order.

use std::sync::Arc;

use futures_util::StreamExt;
use tokio::runtime::Handle;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;

use super::machine::{
    ControlEvent, HostCallbacks, LocalTracks, SignalingMachine, SignalingStats,
    SignalingStatsSnapshot, StateCell, StreamStats,
};
use super::transport::{self, PhaseCell, SignalingPhase, WsSource};
use crate::config::SignalingConfig;
use crate::error::{Result, SignalingError};
use crate::media::{ConnectivityState, MediaSessionFactory, TrackKind};

/// Handle to a connected signaling session
pub struct SignalingClient {
    events_tx: mpsc::UnboundedSender<ControlEvent>,
    phase: Arc<PhaseCell>,
    state: Arc<StateCell>,
    stats: Arc<SignalingStats>,
    tracks: Arc<LocalTracks>,
    control_task: Option<JoinHandle<()>>,
}

impl SignalingClient {
    /// Connect to the signaling server and start the control context.
    ///
    /// Returns once the WebSocket is up and the entry command has been
    /// queued. Failures before that point are the only errors surfaced here;
    /// everything afterwards is logged and handled on the control context.
    pub async fn connect(
        config: SignalingConfig,
        factory: Arc<dyn MediaSessionFactory>,
        callbacks: HostCallbacks,
    ) -> Result<Self> {
        let url = config.validate()?;
        let config = Arc::new(config);
        let phase = Arc::new(PhaseCell::default());

        log::info!("Connecting to {} (channel '{}', role {})", url.as_str(), config.channel_id, config.role);
        let ws = match transport::open(&url, &phase).await {
            Ok(ws) => ws,
            Err(e) => {
                log::error!("Signaling connect failed during {}: {}", phase.get(), e);
                phase.set(SignalingPhase::Closed);
                return Err(e);
            }
        };
        let (sink, source) = ws.split();

        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let mut machine = SignalingMachine::new(config, factory, events_tx.clone(), callbacks);
        let stats = machine.stats();
        let state = machine.state_cell();
        let tracks = machine.local_tracks();

        let (writer_tx, writer_task) = transport::spawn_writer(sink, stats.clone());
        machine.on_connected();

        let control = ControlLoop {
            machine,
            source,
            events_rx,
            writer_tx,
            writer_task: Some(writer_task),
            phase: phase.clone(),
        };
        let control_task = tokio::spawn(control.run());

        Ok(Self {
            events_tx,
            phase,
            state,
            stats,
            tracks,
            control_task: Some(control_task),
        })
    }

    /// [`connect`](Self::connect) on the crate's shared runtime, for hosts
    /// without one. Must not be called from inside an async context.
    pub fn connect_blocking(
        config: SignalingConfig,
        factory: Arc<dyn MediaSessionFactory>,
        callbacks: HostCallbacks,
    ) -> Result<Self> {
        if Handle::try_current().is_ok() {
            return Err(SignalingError::Runtime(
                "connect_blocking called from inside an async runtime".to_string(),
            ));
        }
        crate::runtime()?.block_on(Self::connect(config, factory, callbacks))
    }

    pub fn phase(&self) -> SignalingPhase {
        self.phase.get()
    }

    /// State of the role-relevant stream; `None` before it exists
    pub fn connection_state(&self) -> Option<ConnectivityState> {
        self.state.get()
    }

    /// The role-relevant stream is connected or completed
    pub fn is_ready(&self) -> bool {
        self.connection_state().is_some_and(|s| s.is_connected())
    }

    pub fn stats(&self) -> SignalingStatsSnapshot {
        self.stats.snapshot()
    }

    /// Send text over a stream's data channel. A stream without a channel
    /// is logged and counted on the control context.
    pub fn send_data_message(&self, stream_id: &str, text: &str) -> Result<()> {
        self.post(ControlEvent::SendData {
            stream_id: stream_id.to_string(),
            text: text.to_string(),
        })
    }

    /// Ask the server for the room's current stream list
    pub fn request_room_info(&self, stream_id: &str) -> Result<()> {
        self.post(ControlEvent::RoomInfo {
            stream_id: stream_id.to_string(),
        })
    }

    /// Start or stop sending local audio on the publish stream
    pub fn set_audio_enabled(&self, enabled: bool) -> Result<()> {
        self.set_track_enabled(TrackKind::Audio, enabled)
    }

    /// Start or stop sending local video on the publish stream
    pub fn set_video_enabled(&self, enabled: bool) -> Result<()> {
        self.set_track_enabled(TrackKind::Video, enabled)
    }

    pub fn is_audio_enabled(&self) -> bool {
        self.tracks.is_enabled(TrackKind::Audio)
    }

    pub fn is_video_enabled(&self) -> bool {
        self.tracks.is_enabled(TrackKind::Video)
    }

    fn set_track_enabled(&self, kind: TrackKind, enabled: bool) -> Result<()> {
        if !self.tracks.set_enabled(kind, enabled) {
            return Ok(());
        }
        self.post(ControlEvent::TrackEnabled { kind })
    }

    /// Engine statistics of every live stream, ordered by stream id.
    ///
    /// A stream closed while its report is collected is left out.
    pub async fn get_stats(&self) -> Result<Vec<StreamStats>> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.post(ControlEvent::Stats(reply_tx))?;
        let pending = reply_rx.await.map_err(|_| SignalingError::ControlClosed)?;

        let mut reports = Vec::with_capacity(pending.len());
        for (stream_id, report) in pending {
            match report.await {
                Ok(report) => reports.push(StreamStats { stream_id, report }),
                Err(_) => log::debug!("[{}] Session closed before reporting stats", stream_id),
            }
        }
        Ok(reports)
    }

    /// Close every media session; the signaling socket stays open
    pub async fn release(&self) -> Result<()> {
        let (ack_tx, ack_rx) = oneshot::channel();
        self.post(ControlEvent::Release(Some(ack_tx)))?;
        ack_rx.await.map_err(|_| SignalingError::ControlClosed)
    }

    /// Release, send a close frame and wait for the control context to end
    pub async fn close(&mut self) -> Result<()> {
        let Some(task) = self.control_task.take() else {
            return Ok(());
        };

        let (ack_tx, ack_rx) = oneshot::channel();
        if self.events_tx.send(ControlEvent::Close(Some(ack_tx))).is_ok() {
            let _ = ack_rx.await;
        }
        if let Err(e) = task.await {
            log::warn!("Signaling control task ended abnormally: {}", e);
        }
        Ok(())
    }

    fn post(&self, event: ControlEvent) -> Result<()> {
        self.events_tx.send(event).map_err(|_| SignalingError::ControlClosed)
    }
}

impl Drop for SignalingClient {
    fn drop(&mut self) {
        if self.control_task.is_some() {
            let _ = self.events_tx.send(ControlEvent::Release(None));
            let _ = self.events_tx.send(ControlEvent::Close(None));
        }
    }
}

struct ControlLoop {
    machine: SignalingMachine,
    source: WsSource,
    events_rx: mpsc::UnboundedReceiver<ControlEvent>,
    writer_tx: mpsc::UnboundedSender<Message>,
    writer_task: Option<JoinHandle<()>>,
    phase: Arc<PhaseCell>,
}

impl ControlLoop {
    async fn run(mut self) {
        let mut reading = true;
        self.flush();

        loop {
            tokio::select! {
                frame = self.source.next(), if reading => {
                    match frame {
                        Some(Ok(Message::Text(text))) => self.machine.handle_text(&text),
                        Some(Ok(Message::Close(frame))) => {
                            log::info!("Signaling server closed the connection: {:?}", frame);
                            reading = false;
                        }
                        Some(Ok(_)) => self.machine.handle_other_frame(),
                        Some(Err(e)) => {
                            log::error!("Signaling read failed: {}", e);
                            reading = false;
                        }
                        None => {
                            log::info!("Signaling stream ended");
                            reading = false;
                        }
                    }
                    if !reading {
                        self.phase.set(SignalingPhase::Closed);
                    }
                }
                event = self.events_rx.recv() => {
                    match event {
                        Some(ControlEvent::Close(ack)) => {
                            self.shutdown(ack).await;
                            return;
                        }
                        Some(event) => self.machine.handle_control(event),
                        None => {
                            self.shutdown(None).await;
                            return;
                        }
                    }
                }
            }
            self.flush();
        }
    }

    /// Forward the machine's outbox to the writer in order
    fn flush(&mut self) {
        for msg in self.machine.take_outbound() {
            match msg.to_text() {
                Ok(text) => {
                    log::debug!("-> {}", msg.command());
                    if self.writer_tx.send(Message::Text(text)).is_err() {
                        log::warn!("Signaling writer has stopped, dropping {}", msg.command());
                    }
                }
                Err(e) => log::error!("Failed to encode {}: {}", msg.command(), e),
            }
        }
    }

    async fn shutdown(&mut self, ack: Option<oneshot::Sender<()>>) {
        if self.phase.get() != SignalingPhase::Closed {
            self.phase.set(SignalingPhase::Closing);
        }
        self.machine.release();
        self.flush();

        let _ = self.writer_tx.send(Message::Close(None));
        if let Some(task) = self.writer_task.take() {
            if let Err(e) = task.await {
                log::warn!("Signaling writer ended abnormally: {}", e);
            }
        }

        self.phase.set(SignalingPhase::Closed);
        log::info!("Signaling closed");
        if let Some(ack) = ack {
            let _ = ack.send(());
        }
    }
}
