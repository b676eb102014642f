//! Data channels keyed by stream id.

use std::collections::HashMap;

use crate::error::{Result, SignalingError};
use crate::media::{DataChannel, SessionEventSink};

/// At most one side channel per stream
#[derive(Default)]
pub struct DataChannelRegistry {
    channels: HashMap<String, Box<dyn DataChannel>>,
}

impl DataChannelRegistry {
    /// Register `channel` for `stream_id`, replacing any previous one, and
    /// route its inbound payloads through `sink`
    pub fn attach(
        &mut self,
        stream_id: &str,
        channel: Box<dyn DataChannel>,
        sink: &SessionEventSink,
    ) {
        if let Some(previous) = self.channels.remove(stream_id) {
            previous.detach();
        }
        channel.observe(sink.data_channel_observer());
        self.channels.insert(stream_id.to_string(), channel);
    }

    /// Remove the observer and the channel; false when there was none
    pub fn detach(&mut self, stream_id: &str) -> bool {
        match self.channels.remove(stream_id) {
            Some(channel) => {
                channel.detach();
                true
            }
            None => false,
        }
    }

    pub fn detach_all(&mut self) {
        for (_, channel) in self.channels.drain() {
            channel.detach();
        }
    }

    pub fn contains(&self, stream_id: &str) -> bool {
        self.channels.contains_key(stream_id)
    }

    pub fn send(&self, stream_id: &str, text: &str) -> Result<()> {
        self.channels
            .get(stream_id)
            .ok_or_else(|| SignalingError::DataChannelNotReady(stream_id.to_string()))?
            .send_text(text)
    }

    pub fn len(&self) -> usize {
        self.channels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.channels.is_empty()
    }
}
