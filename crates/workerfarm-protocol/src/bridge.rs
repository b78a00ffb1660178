//! Request/response multiplexer over a [`Channel`].
//!
//! Either side may issue calls at any time. Every outgoing call gets an id
//! from a shared [`IdAllocator`] and a pending slot; `response`/`error`
//! frames are matched by id alone, so completion order does not matter.
//! Incoming calls run concurrently in their own tasks.

use crate::{
    CallErrorFrame, CallRequest, CallResponse, Channel, LogRecord, Message, MessageCodec,
    ProtocolError, StreamChunk,
};
use async_trait::async_trait;
use dashmap::DashMap;
use futures::{FutureExt, SinkExt, StreamExt};
use parking_lot::Mutex;
use serde_json::Value;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Weak};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{mpsc, oneshot, watch};
use tokio_util::codec::{FramedRead, FramedWrite};
use tracing::{debug, error, warn};
use workerfarm_core::{
    CallId, FarmError, IdAllocator, RemoteError, RemoteErrorKind, Result,
};

/// Answers calls issued by the peer
#[async_trait]
pub trait CallHandler: Send + Sync {
    async fn handle_call(
        &self,
        bridge: &Bridge,
        method: &str,
        args: Vec<Value>,
    ) -> std::result::Result<Value, RemoteError>;
}

/// Receives log and stream frames from the peer
pub trait EventSink: Send + Sync {
    fn on_log(&self, record: LogRecord);
    fn on_stream(&self, chunk: StreamChunk);
}

/// Sink for sides that never expect output frames
pub struct DiscardEvents;

impl EventSink for DiscardEvents {
    fn on_log(&self, record: LogRecord) {
        debug!(message = %record.message, "Discarding log frame");
    }

    fn on_stream(&self, chunk: StreamChunk) {
        debug!(text = %chunk.text, "Discarding stream frame");
    }
}

type Slot = oneshot::Sender<Result<Value>>;

struct Inner {
    outgoing: Mutex<Option<mpsc::UnboundedSender<Message>>>,
    pending: DashMap<CallId, Slot>,
    ids: IdAllocator,
    closed: Mutex<Option<FarmError>>,
    closed_tx: watch::Sender<bool>,
    disconnect: FarmError,
}

impl Inner {
    fn send(&self, message: Message) -> bool {
        match self.outgoing.lock().as_ref() {
            Some(tx) => tx.send(message).is_ok(),
            None => false,
        }
    }

    fn resolve(&self, id: CallId, outcome: Result<Value>) {
        match self.pending.remove(&id) {
            Some((_, slot)) => {
                let _ = slot.send(outcome);
            }
            None => debug!(call = %id, "Ignoring answer for unknown call"),
        }
    }

    fn close(&self, reason: FarmError) {
        {
            let mut closed = self.closed.lock();
            if closed.is_some() {
                return;
            }
            *closed = Some(reason.clone());
        }
        self.outgoing.lock().take();

        let ids: Vec<CallId> = self.pending.iter().map(|entry| *entry.key()).collect();
        for id in ids {
            if let Some((_, slot)) = self.pending.remove(&id) {
                let _ = slot.send(Err(reason.clone()));
            }
        }
        self.closed_tx.send_replace(true);
    }

    fn close_reason(&self) -> Option<FarmError> {
        self.closed.lock().clone()
    }
}

/// Handle to one side of a multiplexed connection; cheap to clone
#[derive(Clone)]
pub struct Bridge {
    inner: Arc<Inner>,
}

impl Bridge {
    /// Start the reader and writer tasks for `channel`.
    ///
    /// `disconnect` is the error pending calls receive if the peer goes
    /// away without an explicit [`Bridge::close`].
    pub fn spawn<R, W>(
        channel: Channel<R, W>,
        handler: Arc<dyn CallHandler>,
        sink: Arc<dyn EventSink>,
        ids: IdAllocator,
        disconnect: FarmError,
    ) -> Self
    where
        R: AsyncRead + Unpin + Send + 'static,
        W: AsyncWrite + Unpin + Send + 'static,
    {
        let (tx, rx) = mpsc::unbounded_channel();
        let (closed_tx, _) = watch::channel(false);
        let bridge = Bridge {
            inner: Arc::new(Inner {
                outgoing: Mutex::new(Some(tx)),
                pending: DashMap::new(),
                ids,
                closed: Mutex::new(None),
                closed_tx,
                disconnect,
            }),
        };

        let (reader, writer) = channel.split();
        tokio::spawn(write_loop(writer, rx, Arc::downgrade(&bridge.inner)));
        tokio::spawn(read_loop(reader, bridge.clone(), handler, sink));

        bridge
    }

    /// Enqueue a call and return its result slot.
    ///
    /// The call frame is queued before this returns, so callers that hold
    /// a lock across `start_call` know the frame precedes anything they
    /// send afterwards.
    pub fn start_call(&self, method: impl Into<String>, args: Vec<Value>) -> PendingCall {
        let id = self.inner.ids.next_call();
        let (slot, rx) = oneshot::channel();
        self.inner.pending.insert(id, slot);

        if let Some(reason) = self.inner.close_reason() {
            // close() may already have drained our slot; only one side
            // gets to answer it
            if self.inner.pending.remove(&id).is_some() {
                return PendingCall::failed(id, reason);
            }
            return PendingCall::new(id, rx);
        }

        let sent = self.inner.send(Message::Call(CallRequest {
            id,
            method: method.into(),
            args,
        }));
        if !sent && self.inner.pending.remove(&id).is_some() {
            let reason = self.inner.close_reason().unwrap_or(FarmError::ChannelClosed);
            return PendingCall::failed(id, reason);
        }

        PendingCall::new(id, rx)
    }

    pub async fn call(&self, method: impl Into<String>, args: Vec<Value>) -> Result<Value> {
        self.start_call(method, args).wait().await
    }

    /// Send a frame that expects no answer (log, stream)
    pub fn notify(&self, message: Message) -> bool {
        self.inner.send(message)
    }

    pub fn log(&self, record: LogRecord) -> bool {
        self.notify(Message::Log(record))
    }

    pub fn stream(&self, chunk: StreamChunk) -> bool {
        self.notify(Message::Stream(chunk))
    }

    /// Stop sending. The writer drains queued frames and then drops its
    /// end of the transport so the peer sees EOF. Pending calls keep
    /// waiting for their answers.
    pub fn close_outgoing(&self) {
        self.inner.outgoing.lock().take();
    }

    /// Tear the connection down, rejecting every pending call with `reason`
    pub fn close(&self, reason: FarmError) {
        self.inner.close(reason);
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.lock().is_some()
    }

    pub fn pending_count(&self) -> usize {
        self.inner.pending.len()
    }

    /// Resolves once the bridge is closed
    pub async fn closed(&self) {
        let mut rx = self.inner.closed_tx.subscribe();
        let _ = rx.wait_for(|closed| *closed).await;
    }
}

/// Result slot of one outgoing call
pub struct PendingCall {
    id: CallId,
    state: std::result::Result<oneshot::Receiver<Result<Value>>, FarmError>,
}

impl PendingCall {
    fn new(id: CallId, rx: oneshot::Receiver<Result<Value>>) -> Self {
        PendingCall { id, state: Ok(rx) }
    }

    fn failed(id: CallId, reason: FarmError) -> Self {
        PendingCall {
            id,
            state: Err(reason),
        }
    }

    pub fn id(&self) -> CallId {
        self.id
    }

    pub async fn wait(self) -> Result<Value> {
        match self.state {
            Ok(rx) => rx.await.unwrap_or(Err(FarmError::ChannelClosed)),
            Err(reason) => Err(reason),
        }
    }
}

async fn read_loop<R>(
    mut reader: FramedRead<R, MessageCodec>,
    bridge: Bridge,
    handler: Arc<dyn CallHandler>,
    sink: Arc<dyn EventSink>,
) where
    R: AsyncRead + Unpin + Send + 'static,
{
    while let Some(frame) = reader.next().await {
        match frame {
            Ok(Message::Call(req)) => {
                let bridge = bridge.clone();
                let handler = handler.clone();
                tokio::spawn(async move {
                    let id = req.id;
                    let outcome = AssertUnwindSafe(handler.handle_call(&bridge, &req.method, req.args))
                        .catch_unwind()
                        .await
                        .unwrap_or_else(|_| {
                            error!(call = %id, method = %req.method, "Call handler panicked");
                            Err(RemoteError::call(format!("handler for `{}` panicked", req.method)))
                        });

                    let reply = match outcome {
                        Ok(result) => Message::Response(CallResponse { id, result }),
                        Err(error) => Message::Error(CallErrorFrame { id, error }),
                    };
                    if !bridge.inner.send(reply) {
                        debug!(call = %id, "Connection closed before reply could be sent");
                    }
                });
            }
            Ok(Message::Response(resp)) => bridge.inner.resolve(resp.id, Ok(resp.result)),
            Ok(Message::Error(err)) => bridge.inner.resolve(err.id, Err(err.error.into())),
            Ok(Message::Log(record)) => sink.on_log(record),
            Ok(Message::Stream(chunk)) => sink.on_stream(chunk),
            Err(e) => {
                warn!("Protocol error, dropping connection: {}", e);
                break;
            }
        }
    }

    let reason = bridge.inner.disconnect.clone();
    bridge.inner.close(reason);
}

async fn write_loop<W>(
    mut writer: FramedWrite<W, MessageCodec>,
    mut rx: mpsc::UnboundedReceiver<Message>,
    inner: Weak<Inner>,
) where
    W: AsyncWrite + Unpin + Send + 'static,
{
    while let Some(message) = rx.recv().await {
        let refers_to = message.call_id();
        let was_call = matches!(message, Message::Call(_));

        match writer.send(message).await {
            Ok(()) => {}
            Err(e) if e.is_message_local() => {
                let Some(inner) = inner.upgrade() else { return };
                reject_unencodable(&inner, refers_to, was_call, &e);
            }
            Err(e) => {
                error!("Failed to write frame: {}", e);
                if let Some(inner) = inner.upgrade() {
                    let reason = inner.disconnect.clone();
                    inner.close(reason);
                }
                return;
            }
        }
    }

    // Flush and shut the transport down so the peer reads EOF
    if let Err(e) = writer.close().await {
        debug!("Error closing writer: {}", e);
    }
}

fn reject_unencodable(inner: &Inner, id: Option<CallId>, was_call: bool, err: &ProtocolError) {
    let Some(id) = id else {
        warn!("Dropping unencodable frame: {}", err);
        return;
    };

    if was_call {
        inner.resolve(id, Err(FarmError::SerializationFailure(err.to_string())));
    } else {
        // The peer is waiting on this id; tell it why there is no result
        inner.send(Message::Error(CallErrorFrame {
            id,
            error: RemoteError::new(RemoteErrorKind::Serialization, err.to_string()),
        }));
    }
}
