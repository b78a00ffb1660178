//! Framed transport between the initiating process and one worker.

use crate::MessageCodec;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_util::codec::{FramedRead, FramedWrite};

/// Both directions of one connection. Frames arrive in the order the
/// peer sent them; EOF on the read half means the peer is gone.
pub struct Channel<R, W> {
    reader: FramedRead<R, MessageCodec>,
    writer: FramedWrite<W, MessageCodec>,
}

impl<R, W> Channel<R, W>
where
    R: AsyncRead + Unpin + Send + 'static,
    W: AsyncWrite + Unpin + Send + 'static,
{
    pub fn new(reader: R, writer: W) -> Self {
        Channel {
            reader: FramedRead::new(reader, MessageCodec),
            writer: FramedWrite::new(writer, MessageCodec),
        }
    }

    pub fn split(self) -> (FramedRead<R, MessageCodec>, FramedWrite<W, MessageCodec>) {
        (self.reader, self.writer)
    }
}

impl Channel<tokio::io::Stdin, tokio::io::Stdout> {
    /// The channel a child process shares with its parent
    pub fn stdio() -> Self {
        Channel::new(tokio::io::stdin(), tokio::io::stdout())
    }
}
