//! In-memory media engine used by the signaling tests.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::oneshot;

use crate::error::{Result, SignalingError};
use crate::media::{
    ConnectivityState, DataChannel, DataChannelObserver, MediaSession, MediaSessionFactory, SdpKind,
    SessionEventSink, SessionParams, TrackKind,
};

/// Engine call recorded by the fakes
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Call {
    CreateOffer { play_only: bool },
    CreateAnswer,
    SetRemote { kind: SdpKind, sdp: String },
    AddCandidate { mid: String, mline_index: u16, candidate: String },
    CreateDataChannel(String),
    SetTrackEnabled { kind: TrackKind, enabled: bool },
    Stats,
    SendText(String),
    DetachChannel,
    Close,
}

#[derive(Default)]
pub struct FakeEngine {
    calls: Mutex<Vec<(String, Call)>>,
    params: Mutex<Vec<SessionParams>>,
    sinks: Mutex<HashMap<String, SessionEventSink>>,
    observers: Mutex<HashMap<String, DataChannelObserver>>,
    refuse: AtomicBool,
}

impl FakeEngine {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Make `create_session` return `None`
    pub fn refuse_sessions(&self, refuse: bool) {
        self.refuse.store(refuse, Ordering::SeqCst);
    }

    pub fn record(&self, stream_id: &str, call: Call) {
        self.calls.lock().push((stream_id.to_string(), call));
    }

    pub fn calls(&self, stream_id: &str) -> Vec<Call> {
        self.calls
            .lock()
            .iter()
            .filter(|(id, _)| id == stream_id)
            .map(|(_, call)| call.clone())
            .collect()
    }

    pub fn params(&self) -> Vec<SessionParams> {
        self.params.lock().clone()
    }

    /// Latest sink handed out for `stream_id`
    pub fn sink(&self, stream_id: &str) -> Option<SessionEventSink> {
        self.sinks.lock().get(stream_id).cloned()
    }

    /// Push a payload through the observer installed on a stream's channel
    pub fn deliver(&self, stream_id: &str, data: &[u8]) -> bool {
        let observer = self.observers.lock().get(stream_id).cloned();
        match observer {
            Some(observer) => {
                observer(data);
                true
            }
            None => false,
        }
    }
}

impl MediaSessionFactory for Arc<FakeEngine> {
    fn create_session(
        &self,
        params: SessionParams,
        events: SessionEventSink,
    ) -> Option<Box<dyn MediaSession>> {
        if self.refuse.load(Ordering::SeqCst) {
            return None;
        }
        let stream_id = params.stream_id.clone();
        self.sinks.lock().insert(stream_id.clone(), events);
        self.params.lock().push(params);
        Some(Box::new(FakeSession {
            stream_id,
            engine: self.clone(),
        }))
    }
}

pub struct FakeSession {
    stream_id: String,
    engine: Arc<FakeEngine>,
}

impl MediaSession for FakeSession {
    fn create_offer(&self, play_only: bool) {
        self.engine.record(&self.stream_id, Call::CreateOffer { play_only });
    }

    fn create_answer(&self) {
        self.engine.record(&self.stream_id, Call::CreateAnswer);
    }

    fn set_remote_description(&self, kind: SdpKind, sdp: &str) -> Result<()> {
        if !sdp.starts_with("v=0") {
            return Err(SignalingError::MediaEngine("unparseable SDP".to_string()));
        }
        self.engine.record(
            &self.stream_id,
            Call::SetRemote {
                kind,
                sdp: sdp.to_string(),
            },
        );
        Ok(())
    }

    fn add_candidate(&self, mid: &str, mline_index: u16, candidate: &str) -> Result<()> {
        self.engine.record(
            &self.stream_id,
            Call::AddCandidate {
                mid: mid.to_string(),
                mline_index,
                candidate: candidate.to_string(),
            },
        );
        Ok(())
    }

    fn connectivity_state(&self) -> ConnectivityState {
        ConnectivityState::New
    }

    fn create_data_channel(&self, label: &str) -> Result<Box<dyn DataChannel>> {
        self.engine
            .record(&self.stream_id, Call::CreateDataChannel(label.to_string()));
        Ok(Box::new(FakeDataChannel {
            label: label.to_string(),
            stream_id: self.stream_id.clone(),
            engine: self.engine.clone(),
        }))
    }

    fn set_track_enabled(&self, kind: TrackKind, enabled: bool) {
        self.engine
            .record(&self.stream_id, Call::SetTrackEnabled { kind, enabled });
    }

    fn stats(&self) -> Result<oneshot::Receiver<serde_json::Value>> {
        self.engine.record(&self.stream_id, Call::Stats);
        let (tx, rx) = oneshot::channel();
        let _ = tx.send(serde_json::json!({ "streamId": self.stream_id }));
        Ok(rx)
    }

    fn close(&self) {
        self.engine.record(&self.stream_id, Call::Close);
    }
}

pub struct FakeDataChannel {
    label: String,
    stream_id: String,
    engine: Arc<FakeEngine>,
}

impl FakeDataChannel {
    pub fn boxed(engine: &Arc<FakeEngine>, stream_id: &str) -> Box<dyn DataChannel> {
        Box::new(Self {
            label: stream_id.to_string(),
            stream_id: stream_id.to_string(),
            engine: engine.clone(),
        })
    }
}

impl DataChannel for FakeDataChannel {
    fn label(&self) -> &str {
        &self.label
    }

    fn observe(&self, observer: DataChannelObserver) {
        self.engine.observers.lock().insert(self.stream_id.clone(), observer);
    }

    fn detach(&self) {
        self.engine.observers.lock().remove(&self.stream_id);
        self.engine.record(&self.stream_id, Call::DetachChannel);
    }

    fn send_text(&self, text: &str) -> Result<()> {
        self.engine.record(&self.stream_id, Call::SendText(text.to_string()));
        Ok(())
    }
}
