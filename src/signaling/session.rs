//! Per-stream session bookkeeping.

use std::collections::HashMap;

use crate::media::{ConnectivityState, MediaSession, SdpKind, SessionEventSink};

/// Where a stream is in the offer/answer exchange
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum NegotiationPhase {
    Created,
    HaveLocalOffer,
    HaveRemoteOffer,
    Stable,
    Failed,
}

/// A remote candidate waiting for the remote description
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PendingCandidate {
    pub mid: String,
    pub mline_index: u16,
    pub candidate: String,
}

/// Everything the machine tracks for one stream id
pub struct SessionEntry {
    pub session: Box<dyn MediaSession>,
    pub phase: NegotiationPhase,
    /// Last state the session reported
    pub state: ConnectivityState,
    pub pending_candidates: Vec<PendingCandidate>,
    pub sink: SessionEventSink,
    /// A remote description has been handed to the session
    pub remote_requested: bool,
}

impl SessionEntry {
    pub fn new(session: Box<dyn MediaSession>, sink: SessionEventSink) -> Self {
        Self {
            session,
            phase: NegotiationPhase::Created,
            state: ConnectivityState::New,
            pending_candidates: Vec::new(),
            sink,
            remote_requested: false,
        }
    }

    /// Advance after a local description was created
    pub fn on_local_description(&mut self, kind: SdpKind) {
        if self.phase == NegotiationPhase::Failed {
            return;
        }
        self.phase = match kind {
            SdpKind::Offer => NegotiationPhase::HaveLocalOffer,
            SdpKind::Answer => NegotiationPhase::Stable,
        };
    }

    /// Advance after a remote description was handed over
    pub fn on_remote_description(&mut self, kind: SdpKind) {
        self.remote_requested = true;
        if self.phase == NegotiationPhase::Failed {
            return;
        }
        self.phase = match kind {
            SdpKind::Offer => NegotiationPhase::HaveRemoteOffer,
            SdpKind::Answer => NegotiationPhase::Stable,
        };
    }

    pub fn fail(&mut self) {
        self.phase = NegotiationPhase::Failed;
    }

    /// Apply or queue a remote candidate
    pub fn add_candidate(&mut self, candidate: PendingCandidate, stream_id: &str) {
        if !self.remote_requested {
            log::debug!("[{}] Queueing remote candidate until remote description", stream_id);
            self.pending_candidates.push(candidate);
            return;
        }
        apply_candidate(self.session.as_ref(), &candidate, stream_id);
    }

    /// Hand every queued candidate to the session
    pub fn flush_candidates(&mut self, stream_id: &str) {
        for candidate in self.pending_candidates.drain(..) {
            apply_candidate(self.session.as_ref(), &candidate, stream_id);
        }
    }

    /// Stop events and close the session
    pub fn retire(self) {
        self.sink.detach();
        self.session.close();
    }
}

fn apply_candidate(session: &dyn MediaSession, candidate: &PendingCandidate, stream_id: &str) {
    if let Err(e) = session.add_candidate(&candidate.mid, candidate.mline_index, &candidate.candidate) {
        log::warn!("[{}] Failed to add remote candidate: {}", stream_id, e);
    }
}

/// Session entries keyed by stream id
#[derive(Default)]
pub struct SessionTable {
    entries: HashMap<String, SessionEntry>,
}

impl SessionTable {
    pub fn contains(&self, stream_id: &str) -> bool {
        self.entries.contains_key(stream_id)
    }

    pub fn get(&self, stream_id: &str) -> Option<&SessionEntry> {
        self.entries.get(stream_id)
    }

    pub fn get_mut(&mut self, stream_id: &str) -> Option<&mut SessionEntry> {
        self.entries.get_mut(stream_id)
    }

    pub fn insert(&mut self, stream_id: &str, entry: SessionEntry) {
        if let Some(previous) = self.entries.insert(stream_id.to_string(), entry) {
            previous.retire();
        }
    }

    /// Retire and remove one entry; false when there was none
    pub fn retire(&mut self, stream_id: &str) -> bool {
        match self.entries.remove(stream_id) {
            Some(entry) => {
                entry.retire();
                true
            }
            None => false,
        }
    }

    /// Detach every sink so no further events are posted
    pub fn detach_all(&self) {
        for entry in self.entries.values() {
            entry.sink.detach();
        }
    }

    /// Close and drop every session
    pub fn close_all(&mut self) {
        for (_, entry) in self.entries.drain() {
            entry.retire();
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn stream_ids(&self) -> impl Iterator<Item = &str> {
        self.entries.keys().map(String::as_str)
    }
}
