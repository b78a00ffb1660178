use crate::{Message, MessageType, ProtocolError, Result, MAX_MESSAGE_SIZE};
use bytes::{Buf, BufMut, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

/// Codec for encoding/decoding messages with length-prefixed framing
///
/// Frame format: [4-byte length (big-endian)] [1-byte message type] [JSON payload]
#[derive(Debug, Default, Clone, Copy)]
pub struct MessageCodec;

impl Decoder for MessageCodec {
    type Item = Message;
    type Error = ProtocolError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>> {
        // Need at least 5 bytes for length prefix + message type
        if src.len() < 5 {
            return Ok(None);
        }

        let mut length_bytes = [0u8; 4];
        length_bytes.copy_from_slice(&src[0..4]);
        let length = u32::from_be_bytes(length_bytes) as usize;

        if length > MAX_MESSAGE_SIZE {
            return Err(ProtocolError::MessageTooLarge(length));
        }
        if length == 0 {
            return Err(ProtocolError::InvalidMessageType(0));
        }

        // Wait for complete message
        if src.len() < 4 + length {
            src.reserve(4 + length - src.len());
            return Ok(None);
        }

        src.advance(4);

        let msg_type_byte = src.get_u8();
        let payload = src.split_to(length - 1);
        let msg_type = MessageType::from_u8(msg_type_byte)
            .ok_or(ProtocolError::InvalidMessageType(msg_type_byte))?;

        let message = match msg_type {
            MessageType::Call => Message::Call(serde_json::from_slice(&payload)?),
            MessageType::Response => Message::Response(serde_json::from_slice(&payload)?),
            MessageType::Error => Message::Error(serde_json::from_slice(&payload)?),
            MessageType::Log => Message::Log(serde_json::from_slice(&payload)?),
            MessageType::Stream => Message::Stream(serde_json::from_slice(&payload)?),
        };

        Ok(Some(message))
    }
}

impl Encoder<Message> for MessageCodec {
    type Error = ProtocolError;

    fn encode(&mut self, item: Message, dst: &mut BytesMut) -> Result<()> {
        // Serialize fully before touching `dst` so a failed message leaves
        // the stream intact
        let payload = match &item {
            Message::Call(req) => serde_json::to_vec(req)?,
            Message::Response(resp) => serde_json::to_vec(resp)?,
            Message::Error(err) => serde_json::to_vec(err)?,
            Message::Log(record) => serde_json::to_vec(record)?,
            Message::Stream(chunk) => serde_json::to_vec(chunk)?,
        };

        let total_length = 1 + payload.len();
        if total_length > MAX_MESSAGE_SIZE {
            return Err(ProtocolError::MessageTooLarge(total_length));
        }

        dst.reserve(4 + total_length);
        dst.put_u32(total_length as u32);
        dst.put_u8(item.message_type().as_u8());
        dst.put_slice(&payload);

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{CallRequest, LogRecord, StreamChunk};
    use proptest::prelude::*;
    use serde_json::json;
    use workerfarm_core::{CallId, LogLevel, StdStream};

    fn call(id: u64, args: Vec<serde_json::Value>) -> Message {
        Message::Call(CallRequest {
            id: CallId(id),
            method: "run".to_string(),
            args,
        })
    }

    #[test]
    fn test_codec_roundtrip() {
        let mut codec = MessageCodec;
        let mut buffer = BytesMut::new();

        let message = call(1, vec![json!({"key": 3}), json!("x")]);
        codec.encode(message.clone(), &mut buffer).unwrap();

        let decoded = codec.decode(&mut buffer).unwrap();
        assert_eq!(decoded, Some(message));
        assert!(buffer.is_empty());
    }

    #[test]
    fn test_partial_message() {
        let mut codec = MessageCodec;
        let mut buffer = BytesMut::new();

        codec.encode(call(2, vec![json!("data")]), &mut buffer).unwrap();

        let full_len = buffer.len();
        let partial = buffer.split_to(full_len / 2);
        let mut partial_buffer = BytesMut::from(&partial[..]);

        let result = codec.decode(&mut partial_buffer).unwrap();
        assert!(result.is_none());
    }

    #[test]
    fn test_back_to_back_frames_keep_order() {
        let mut codec = MessageCodec;
        let mut buffer = BytesMut::new();

        let stream = Message::Stream(StreamChunk {
            stream: StdStream::Stdout,
            text: "two\n".to_string(),
        });
        let log = Message::Log(LogRecord {
            level: LogLevel::Error,
            message: "three".to_string(),
        });
        codec.encode(stream.clone(), &mut buffer).unwrap();
        codec.encode(log.clone(), &mut buffer).unwrap();

        assert_eq!(codec.decode(&mut buffer).unwrap(), Some(stream));
        assert_eq!(codec.decode(&mut buffer).unwrap(), Some(log));
        assert_eq!(codec.decode(&mut buffer).unwrap(), None);
    }

    #[test]
    fn test_rejects_unknown_type() {
        let mut codec = MessageCodec;
        let mut buffer = BytesMut::new();
        buffer.put_u32(3);
        buffer.put_u8(42);
        buffer.put_slice(b"{}");

        let err = codec.decode(&mut buffer).unwrap_err();
        assert!(matches!(err, ProtocolError::InvalidMessageType(42)));
    }

    #[test]
    fn test_rejects_oversized_length() {
        let mut codec = MessageCodec;
        let mut buffer = BytesMut::new();
        buffer.put_u32((MAX_MESSAGE_SIZE + 1) as u32);
        buffer.put_u8(1);

        let err = codec.decode(&mut buffer).unwrap_err();
        assert!(matches!(err, ProtocolError::MessageTooLarge(_)));
    }

    #[test]
    fn test_large_payload() {
        let mut codec = MessageCodec;
        let mut buffer = BytesMut::new();

        let big: Vec<_> = (0..10_000).map(|_| json!("This is some big data")).collect();
        let message = call(7, vec![json!(big)]);
        codec.encode(message.clone(), &mut buffer).unwrap();

        assert_eq!(codec.decode(&mut buffer).unwrap(), Some(message));
    }

    proptest! {
        #[test]
        fn decode_is_independent_of_chunking(
            values in proptest::collection::vec(any::<i64>(), 1..20),
            chunk in 1usize..64,
        ) {
            let mut codec = MessageCodec;
            let mut wire = BytesMut::new();
            let messages: Vec<Message> = values
                .iter()
                .enumerate()
                .map(|(i, v)| call(i as u64 + 1, vec![json!(v)]))
                .collect();
            for message in &messages {
                codec.encode(message.clone(), &mut wire).unwrap();
            }

            let mut input = BytesMut::new();
            let mut decoded = Vec::new();
            for piece in wire.chunks(chunk) {
                input.extend_from_slice(piece);
                while let Some(message) = codec.decode(&mut input).unwrap() {
                    decoded.push(message);
                }
            }

            prop_assert_eq!(decoded, messages);
        }
    }
}
