use bytes::Bytes;
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use thiserror::Error;

use crate::codec::{CodecError, Frame};

/// Protocol version announced in HELLO_REQ
pub const PROTOCOL_VERSION: u32 = 1;

/// Channel id reserved for control-plane messages
pub const CONTROL_CHANNEL: u32 = 0;

/// Flag bit marking message types with a raw binary payload
const BINARY_FLAG: u16 = 64;

/// Message type identifiers carried in the frame header
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u16)]
pub enum MessageType {
    HelloReq = 1,
    HelloResp = 2,
    End = 3,
    ServerOpen = 4,
    ServerClose = 5,
    ClientClose = 6,
    Ping = 7,
    Pong = 8,
    ServerData = 65,
    ClientData = 66,
}

impl MessageType {
    pub fn from_u16(value: u16) -> Option<Self> {
        Some(match value {
            1 => Self::HelloReq,
            2 => Self::HelloResp,
            3 => Self::End,
            4 => Self::ServerOpen,
            5 => Self::ServerClose,
            6 => Self::ClientClose,
            7 => Self::Ping,
            8 => Self::Pong,
            65 => Self::ServerData,
            66 => Self::ClientData,
            _ => return None,
        })
    }

    /// Whether frames of this type carry raw bytes instead of JSON
    pub fn is_binary(value: u16) -> bool {
        value & BINARY_FLAG != 0
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::HelloReq => "HELLO_REQ",
            Self::HelloResp => "HELLO_RESP",
            Self::End => "END",
            Self::ServerOpen => "SERVER_OPEN",
            Self::ServerClose => "SERVER_CLOSE",
            Self::ClientClose => "CLIENT_CLOSE",
            Self::Ping => "PING",
            Self::Pong => "PONG",
            Self::ServerData => "SERVER_DATA",
            Self::ClientData => "CLIENT_DATA",
        }
    }

    /// Display name for any raw type value
    pub fn name_of(value: u16) -> &'static str {
        Self::from_u16(value).map_or("UNKNOWN", |t| t.as_str())
    }
}

impl std::fmt::Display for MessageType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Errors produced when a frame does not match its message schema
#[derive(Debug, Error)]
pub enum MessageError {
    #[error("Unknown message type {0}")]
    UnknownType(u16),

    #[error("Invalid {msg_type} payload: {source}")]
    InvalidPayload {
        msg_type: MessageType,
        #[source]
        source: serde_json::Error,
    },
}

/// Client authentication and endpoint request
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HelloRequest {
    pub version: u32,
    #[serde(default)]
    pub user: String,
    #[serde(default)]
    pub token: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub endpoint: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub endpoint_prefix: Option<String>,
}

/// Server answer to HELLO_REQ
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "HelloResponseWire", into = "HelloResponseWire")]
pub enum HelloResponse {
    Accepted {
        endpoint: Option<String>,
        server_info: Option<String>,
    },
    Rejected {
        error: Option<String>,
    },
}

impl HelloResponse {
    pub fn accepted(endpoint: impl Into<String>, server_info: impl Into<String>) -> Self {
        Self::Accepted {
            endpoint: Some(endpoint.into()),
            server_info: Some(server_info.into()),
        }
    }

    pub fn rejected(error: impl Into<String>) -> Self {
        Self::Rejected {
            error: Some(error.into()),
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, Self::Accepted { .. })
    }
}

#[derive(Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct HelloResponseWire {
    success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    endpoint: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    server_info: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    error: Option<String>,
}

impl From<HelloResponseWire> for HelloResponse {
    fn from(wire: HelloResponseWire) -> Self {
        if wire.success {
            Self::Accepted {
                endpoint: wire.endpoint,
                server_info: wire.server_info,
            }
        } else {
            Self::Rejected { error: wire.error }
        }
    }
}

impl From<HelloResponse> for HelloResponseWire {
    fn from(resp: HelloResponse) -> Self {
        match resp {
            HelloResponse::Accepted {
                endpoint,
                server_info,
            } => Self {
                success: true,
                endpoint,
                server_info,
                error: None,
            },
            HelloResponse::Rejected { error } => Self {
                success: false,
                endpoint: None,
                server_info: None,
                error,
            },
        }
    }
}

/// Orderly termination of a control connection
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EndData {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// A visitor connected to the client's endpoint
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerOpen {
    pub channel_id: u32,
    pub client: String,
}

/// Close notice for one channel, used in both directions
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChannelClose {
    pub channel_id: u32,
}

/// A decoded tunnel message
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    HelloReq(HelloRequest),
    HelloResp(HelloResponse),
    End(EndData),
    ServerOpen(ServerOpen),
    ServerClose(ChannelClose),
    ClientClose(ChannelClose),
    Ping,
    Pong,
    /// Bytes from a public visitor, addressed to a channel
    ServerData { channel: u32, data: Bytes },
    /// Bytes from the local service, addressed to a channel
    ClientData { channel: u32, data: Bytes },
}

impl Message {
    pub fn end(error: Option<String>) -> Self {
        Self::End(EndData { error })
    }

    pub fn message_type(&self) -> MessageType {
        match self {
            Self::HelloReq(_) => MessageType::HelloReq,
            Self::HelloResp(_) => MessageType::HelloResp,
            Self::End(_) => MessageType::End,
            Self::ServerOpen(_) => MessageType::ServerOpen,
            Self::ServerClose(_) => MessageType::ServerClose,
            Self::ClientClose(_) => MessageType::ClientClose,
            Self::Ping => MessageType::Ping,
            Self::Pong => MessageType::Pong,
            Self::ServerData { .. } => MessageType::ServerData,
            Self::ClientData { .. } => MessageType::ClientData,
        }
    }

    /// Encode into a frame; control messages travel on channel 0
    pub fn into_frame(self) -> Result<Frame, CodecError> {
        let t = self.message_type() as u16;
        match self {
            Self::HelloReq(m) => Frame::json(t, CONTROL_CHANNEL, &m),
            Self::HelloResp(m) => Frame::json(t, CONTROL_CHANNEL, &m),
            Self::End(m) => Frame::json(t, CONTROL_CHANNEL, &m),
            Self::ServerOpen(m) => Frame::json(t, CONTROL_CHANNEL, &m),
            Self::ServerClose(m) | Self::ClientClose(m) => Frame::json(t, CONTROL_CHANNEL, &m),
            Self::Ping | Self::Pong => Ok(Frame::empty(t, CONTROL_CHANNEL)),
            Self::ServerData { channel, data } | Self::ClientData { channel, data } => {
                Ok(Frame::new(t, channel, data))
            }
        }
    }

    /// Validate a raw frame against the schema of its type
    pub fn from_frame(frame: Frame) -> Result<Self, MessageError> {
        let msg_type =
            MessageType::from_u16(frame.msg_type).ok_or(MessageError::UnknownType(frame.msg_type))?;

        let msg = match msg_type {
            MessageType::HelloReq => Self::HelloReq(parse(msg_type, &frame.payload)?),
            MessageType::HelloResp => Self::HelloResp(parse(msg_type, &frame.payload)?),
            MessageType::End if frame.payload.is_empty() => Self::End(EndData::default()),
            MessageType::End => Self::End(parse(msg_type, &frame.payload)?),
            MessageType::ServerOpen => Self::ServerOpen(parse(msg_type, &frame.payload)?),
            MessageType::ServerClose => Self::ServerClose(parse(msg_type, &frame.payload)?),
            MessageType::ClientClose => Self::ClientClose(parse(msg_type, &frame.payload)?),
            MessageType::Ping => Self::Ping,
            MessageType::Pong => Self::Pong,
            MessageType::ServerData => Self::ServerData {
                channel: frame.channel,
                data: frame.payload,
            },
            MessageType::ClientData => Self::ClientData {
                channel: frame.channel,
                data: frame.payload,
            },
        };
        Ok(msg)
    }
}

fn parse<T: DeserializeOwned>(msg_type: MessageType, payload: &[u8]) -> Result<T, MessageError> {
    serde_json::from_slice(payload).map_err(|source| MessageError::InvalidPayload { msg_type, source })
}
