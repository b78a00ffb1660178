mod bridge;
mod channel;
mod codec;
mod message;

pub use bridge::{Bridge, CallHandler, DiscardEvents, EventSink, PendingCall};
pub use channel::Channel;
pub use codec::MessageCodec;
pub use message::{
    CallErrorFrame, CallRequest, CallResponse, LogRecord, Message, MessageType, StreamChunk,
    INIT_METHOD, PING_METHOD, RUN_METHOD,
};

use thiserror::Error;

#[derive(Error, Debug)]
pub enum ProtocolError {
    #[error("Invalid message type: {0}")]
    InvalidMessageType(u8),

    #[error("Message too large: {0} bytes")]
    MessageTooLarge(usize),

    #[error("Serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),
}

impl ProtocolError {
    /// True when this one message could not be put on the wire but the
    /// connection itself is still healthy
    pub fn is_message_local(&self) -> bool {
        matches!(
            self,
            ProtocolError::SerializationError(_) | ProtocolError::MessageTooLarge(_)
        )
    }
}

pub type Result<T> = std::result::Result<T, ProtocolError>;

/// Maximum frame size: 64MB (type byte + JSON payload)
pub const MAX_MESSAGE_SIZE: usize = 64 * 1024 * 1024;
