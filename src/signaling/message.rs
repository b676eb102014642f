//! Signaling wire messages.
//!
//! Every frame is a UTF-8 JSON object discriminated by `command`.
//! Notifications and server errors carry a second discriminator in
//! `definition`; some servers spell it `defition`.

use serde::{Deserialize, Serialize};

use crate::error::{Result, SignalingError};
use crate::media::SdpKind;

/// Loose view of an inbound frame before validation
#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Envelope {
    command: Option<String>,
    stream_id: Option<String>,
    #[serde(rename = "type")]
    kind: Option<String>,
    sdp: Option<String>,
    id: Option<String>,
    label: Option<u16>,
    candidate: Option<String>,
    #[serde(alias = "defition")]
    definition: Option<String>,
    streams: Option<Vec<String>>,
}

/// `notification` sub-commands
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Notification {
    /// Room joined; publish `stream_id` and play every listed stream
    JoinedTheRoom { stream_id: String, streams: Vec<String> },
    PlayFinished { stream_id: String },
    BitrateMeasurement,
    Other(String),
}

/// `error` sub-commands
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ServerError {
    PublishTimeout,
    NoStreamExist,
    Other(String),
}

/// Inbound protocol message
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum InboundMessage {
    Start {
        stream_id: String,
    },
    TakeConfiguration {
        stream_id: String,
        kind: SdpKind,
        sdp: String,
    },
    TakeCandidate {
        stream_id: String,
        /// media stream identification (`id` on the wire)
        mid: String,
        /// m-line index (`label` on the wire)
        mline_index: u16,
        candidate: String,
    },
    Pong,
    Notification(Notification),
    RoomInformation {
        streams: Vec<String>,
    },
    Error(ServerError),
    Unrecognized(String),
}

impl InboundMessage {
    /// Decode one text frame
    pub fn parse(text: &str) -> Result<Self> {
        let env: Envelope = serde_json::from_str(text)?;
        let command = env.command.ok_or_else(|| SignalingError::MissingField {
            command: String::new(),
            field: "command",
        })?;

        let msg = match command.as_str() {
            "start" => InboundMessage::Start {
                stream_id: require(&command, "streamId", env.stream_id)?,
            },
            "takeConfiguration" => {
                let raw_kind = require(&command, "type", env.kind)?;
                let kind = match raw_kind.as_str() {
                    "offer" => SdpKind::Offer,
                    "answer" => SdpKind::Answer,
                    _ => {
                        return Err(SignalingError::UnexpectedValue {
                            command: command.clone(),
                            field: "type",
                            value: raw_kind,
                        })
                    }
                };
                InboundMessage::TakeConfiguration {
                    stream_id: require(&command, "streamId", env.stream_id)?,
                    kind,
                    sdp: require(&command, "sdp", env.sdp)?,
                }
            }
            "takeCandidate" => InboundMessage::TakeCandidate {
                stream_id: require(&command, "streamId", env.stream_id)?,
                mid: require(&command, "id", env.id)?,
                mline_index: require(&command, "label", env.label)?,
                candidate: require(&command, "candidate", env.candidate)?,
            },
            "pong" => InboundMessage::Pong,
            "notification" => {
                let notification = match env.definition.as_deref().unwrap_or_default() {
                    "joinedTheRoom" => Notification::JoinedTheRoom {
                        stream_id: require(&command, "streamId", env.stream_id)?,
                        streams: env.streams.unwrap_or_default(),
                    },
                    "play_finished" => Notification::PlayFinished {
                        stream_id: require(&command, "streamId", env.stream_id)?,
                    },
                    "bitrateMeasurement" => Notification::BitrateMeasurement,
                    other => Notification::Other(other.to_string()),
                };
                InboundMessage::Notification(notification)
            }
            "roomInformation" => InboundMessage::RoomInformation {
                streams: require(&command, "streams", env.streams)?,
            },
            "error" => {
                let error = match env.definition.as_deref().unwrap_or_default() {
                    "publishTimeoutError" => ServerError::PublishTimeout,
                    "no_stream_exist" => ServerError::NoStreamExist,
                    other => ServerError::Other(other.to_string()),
                };
                InboundMessage::Error(error)
            }
            _ => InboundMessage::Unrecognized(command.clone()),
        };
        Ok(msg)
    }
}

fn require<T>(command: &str, field: &'static str, value: Option<T>) -> Result<T> {
    value.ok_or_else(|| SignalingError::MissingField {
        command: command.to_string(),
        field,
    })
}

/// Outbound protocol message
#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(tag = "command", rename_all = "camelCase")]
pub enum OutboundMessage {
    JoinRoom {
        room: String,
    },
    Publish {
        #[serde(rename = "streamId")]
        stream_id: String,
        video: bool,
        #[serde(rename = "metaData", skip_serializing_if = "serde_json::Value::is_null")]
        metadata: serde_json::Value,
    },
    Play {
        #[serde(rename = "streamId")]
        stream_id: String,
    },
    Ping,
    GetRoomInfo {
        room: String,
        #[serde(rename = "streamId")]
        stream_id: String,
    },
    TakeConfiguration {
        #[serde(rename = "streamId")]
        stream_id: String,
        #[serde(rename = "type")]
        kind: String,
        sdp: String,
    },
    TakeCandidate {
        #[serde(rename = "streamId")]
        stream_id: String,
        label: u16,
        id: String,
        candidate: String,
    },
}

impl OutboundMessage {
    pub fn command(&self) -> &'static str {
        match self {
            OutboundMessage::JoinRoom { .. } => "joinRoom",
            OutboundMessage::Publish { .. } => "publish",
            OutboundMessage::Play { .. } => "play",
            OutboundMessage::Ping => "ping",
            OutboundMessage::GetRoomInfo { .. } => "getRoomInfo",
            OutboundMessage::TakeConfiguration { .. } => "takeConfiguration",
            OutboundMessage::TakeCandidate { .. } => "takeCandidate",
        }
    }

    /// Encode as a JSON text frame
    pub fn to_text(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }
}
