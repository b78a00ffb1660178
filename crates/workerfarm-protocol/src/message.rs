use serde::{Deserialize, Serialize};
use serde_json::Value;
use workerfarm_core::{CallId, LogLevel, RemoteError, StdStream};

/// Task invocation on a worker
pub const RUN_METHOD: &str = "run";

/// Re-initialization; args are `[options, generation]`
pub const INIT_METHOD: &str = "$init";

/// No-op used to warm workers
pub const PING_METHOD: &str = "$ping";

/// Message types carried on a channel
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum MessageType {
    Call = 1,
    Response = 2,
    Error = 3,
    Log = 4,
    Stream = 5,
}

impl MessageType {
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            1 => Some(MessageType::Call),
            2 => Some(MessageType::Response),
            3 => Some(MessageType::Error),
            4 => Some(MessageType::Log),
            5 => Some(MessageType::Stream),
            _ => None,
        }
    }

    pub fn as_u8(&self) -> u8 {
        *self as u8
    }
}

/// Protocol messages. Either side may send any kind.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Message {
    /// Invoke a method on the peer
    Call(CallRequest),

    /// Successful result for one of our calls
    Response(CallResponse),

    /// Failure for one of our calls
    Error(CallErrorFrame),

    /// Structured log record
    Log(LogRecord),

    /// Raw text written to a standard stream
    Stream(StreamChunk),
}

impl Message {
    pub fn message_type(&self) -> MessageType {
        match self {
            Message::Call(_) => MessageType::Call,
            Message::Response(_) => MessageType::Response,
            Message::Error(_) => MessageType::Error,
            Message::Log(_) => MessageType::Log,
            Message::Stream(_) => MessageType::Stream,
        }
    }

    /// Call id this message refers to, if any
    pub fn call_id(&self) -> Option<CallId> {
        match self {
            Message::Call(req) => Some(req.id),
            Message::Response(resp) => Some(resp.id),
            Message::Error(err) => Some(err.id),
            Message::Log(_) | Message::Stream(_) => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CallRequest {
    pub id: CallId,
    pub method: String,
    pub args: Vec<Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CallResponse {
    pub id: CallId,
    pub result: Value,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CallErrorFrame {
    pub id: CallId,
    pub error: RemoteError,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogRecord {
    pub level: LogLevel,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StreamChunk {
    pub stream: StdStream,
    pub text: String,
}
