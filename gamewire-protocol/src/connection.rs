//! One network channel: a cloneable handle for sending plus the loop that
//! reads frames and hands them to a [`FrameHandler`].
//!
//! Frames from one connection are handled strictly in arrival order on the
//! connection's own task. Outbound frames are queued through the handle and
//! written by the same task, so handlers never block on the socket.

use crate::codec::{Decoder, Encoder, RawMessage};
use crate::error::ProtocolError;
use crate::frame::FrameParams;
use crate::message::Message;
use bytes::Bytes;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use uuid::Uuid;

/// Read buffer size.
const READ_BUF_SIZE: usize = 8192;

/// Handshake state of a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ConnectionState {
    /// Socket open, handshake not started.
    Connecting = 0,
    /// Challenge sent, waiting for the echo.
    AwaitingValidation = 1,
    /// Handshake complete; application traffic allowed.
    Validated = 2,
    Closed = 3,
}

impl ConnectionState {
    fn from_u8(v: u8) -> Self {
        match v {
            0 => ConnectionState::Connecting,
            1 => ConnectionState::AwaitingValidation,
            2 => ConnectionState::Validated,
            _ => ConnectionState::Closed,
        }
    }
}

enum Outbound {
    Frame(Bytes),
    Close,
}

struct HandleInner {
    id: Uuid,
    peer: SocketAddr,
    encoder: Encoder,
    state: AtomicU8,
    closed: AtomicBool,
    opened_at: Instant,
    outbound: mpsc::UnboundedSender<Outbound>,
}

/// Cheap, cloneable reference to a live connection.
#[derive(Clone)]
pub struct ConnectionHandle {
    inner: Arc<HandleInner>,
}

impl ConnectionHandle {
    pub fn id(&self) -> Uuid {
        self.inner.id
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.inner.peer
    }

    pub fn state(&self) -> ConnectionState {
        ConnectionState::from_u8(self.inner.state.load(Ordering::Acquire))
    }

    /// Moves the connection to `state`. A closed connection stays closed.
    pub fn set_state(&self, state: ConnectionState) {
        let _ = self
            .inner
            .state
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |current| {
                if current == ConnectionState::Closed as u8 {
                    None
                } else {
                    Some(state as u8)
                }
            });
    }

    pub fn is_validated(&self) -> bool {
        self.state() == ConnectionState::Validated
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::Acquire)
    }

    /// Time since the socket was accepted or connected.
    pub fn age(&self) -> std::time::Duration {
        self.inner.opened_at.elapsed()
    }

    /// Queues a message for sending.
    pub fn send<M: Message>(&self, message: &M) -> Result<(), ProtocolError> {
        if self.is_closed() {
            return Err(ProtocolError::ConnectionClosed);
        }
        let frame = self.inner.encoder.encode(message)?;
        self.inner
            .outbound
            .send(Outbound::Frame(frame.freeze()))
            .map_err(|_| ProtocolError::ConnectionClosed)
    }

    /// Closes the connection once frames queued before this call are written.
    ///
    /// Idempotent.
    pub fn close(&self) {
        if self.inner.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.inner
            .state
            .store(ConnectionState::Closed as u8, Ordering::Release);
        let _ = self.inner.outbound.send(Outbound::Close);
    }

    fn mark_closed(&self) {
        self.inner.closed.store(true, Ordering::Release);
        self.inner
            .state
            .store(ConnectionState::Closed as u8, Ordering::Release);
    }
}

impl std::fmt::Debug for ConnectionHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionHandle")
            .field("id", &self.inner.id)
            .field("peer", &self.inner.peer)
            .field("state", &self.state())
            .finish()
    }
}

/// Receives decoded frames for one connection.
///
/// An error return is a protocol violation and closes the connection.
pub trait FrameHandler: Send + Sync {
    fn on_frame(&self, conn: &ConnectionHandle, frame: RawMessage) -> Result<(), ProtocolError>;
}

/// An established channel that has not started running yet.
pub struct Connection {
    stream: TcpStream,
    handle: ConnectionHandle,
    outbound: mpsc::UnboundedReceiver<Outbound>,
    params: FrameParams,
}

impl Connection {
    pub fn new(stream: TcpStream, peer: SocketAddr, params: FrameParams) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let handle = ConnectionHandle {
            inner: Arc::new(HandleInner {
                id: Uuid::new_v4(),
                peer,
                encoder: Encoder::new(params),
                state: AtomicU8::new(ConnectionState::Connecting as u8),
                closed: AtomicBool::new(false),
                opened_at: Instant::now(),
                outbound: tx,
            }),
        };
        Self {
            stream,
            handle,
            outbound: rx,
            params,
        }
    }

    pub fn handle(&self) -> &ConnectionHandle {
        &self.handle
    }

    /// Runs the read/dispatch/write loop until the connection ends.
    ///
    /// Returns `Ok(())` on an orderly close from either side and `Err` on an
    /// I/O failure or protocol violation. The handle is closed either way.
    pub async fn run<H>(self, handler: &H) -> Result<(), ProtocolError>
    where
        H: FrameHandler + ?Sized,
    {
        let Connection {
            mut stream,
            handle,
            mut outbound,
            params,
        } = self;
        let addr = handle.peer_addr();
        let mut decoder = Decoder::new(params);
        let mut buf = [0u8; READ_BUF_SIZE];

        let result = loop {
            tokio::select! {
                biased;

                Some(out) = outbound.recv() => {
                    match out {
                        Outbound::Frame(frame) => {
                            tracing::trace!("[{}] Sending {} bytes", addr, frame.len());
                            if let Err(e) = stream.write_all(&frame).await {
                                break Err(ProtocolError::Io(e));
                            }
                        }
                        Outbound::Close => {
                            tracing::debug!("[{}] Closing connection", addr);
                            break Ok(());
                        }
                    }
                }

                result = stream.read(&mut buf) => {
                    match result {
                        Ok(0) => {
                            tracing::debug!("[{}] Connection closed by peer", addr);
                            break Ok(());
                        }
                        Ok(n) => {
                            tracing::trace!("[{}] Received {} bytes", addr, n);
                            decoder.extend(&buf[..n]);
                        }
                        Err(e) => {
                            tracing::debug!("[{}] Read error: {}", addr, e);
                            break Err(ProtocolError::Io(e));
                        }
                    }

                    if let Err(e) = Self::drain(&mut decoder, &handle, handler) {
                        break Err(e);
                    }
                }
            }
        };

        handle.mark_closed();
        // Flush whatever the handlers queued before the close.
        while let Ok(Outbound::Frame(frame)) = outbound.try_recv() {
            if stream.write_all(&frame).await.is_err() {
                break;
            }
        }
        let _ = stream.shutdown().await;
        result
    }

    fn drain<H>(
        decoder: &mut Decoder,
        handle: &ConnectionHandle,
        handler: &H,
    ) -> Result<(), ProtocolError>
    where
        H: FrameHandler + ?Sized,
    {
        while !handle.is_closed() {
            match decoder.decode_frame()? {
                Some(frame) => handler.on_frame(handle, frame)?,
                None => break,
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::{ChallengeEcho, Heartbeat, HeartbeatReply};
    use parking_lot::Mutex;
    use tokio::net::TcpListener;

    /// Replies to every heartbeat and records echo values.
    #[derive(Default)]
    struct Recorder {
        echoes: Mutex<Vec<u64>>,
    }

    impl FrameHandler for Recorder {
        fn on_frame(&self, conn: &ConnectionHandle, frame: RawMessage) -> Result<(), ProtocolError> {
            match frame.id {
                Heartbeat::ID => conn.send(&HeartbeatReply {
                    server_time_millis: 5,
                }),
                ChallengeEcho::ID => {
                    self.echoes.lock().push(frame.decode::<ChallengeEcho>()?.value);
                    Ok(())
                }
                other => Err(ProtocolError::UnknownMessage(other)),
            }
        }
    }

    async fn pair() -> (Connection, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let client = TcpStream::connect(addr).await.unwrap();
        let (server, peer) = listener.accept().await.unwrap();
        (Connection::new(server, peer, FrameParams::default()), client)
    }

    async fn read_message(stream: &mut TcpStream) -> RawMessage {
        let mut decoder = Decoder::default();
        let mut buf = [0u8; 256];
        loop {
            if let Some(msg) = decoder.decode_frame().unwrap() {
                return msg;
            }
            let n = stream.read(&mut buf).await.unwrap();
            assert!(n > 0, "peer closed");
            decoder.extend(&buf[..n]);
        }
    }

    #[tokio::test]
    async fn test_dispatch_in_order_and_reply() {
        let (conn, mut client) = pair().await;
        let handler = Arc::new(Recorder::default());
        let h = handler.clone();
        let task = tokio::spawn(async move { conn.run(h.as_ref()).await });

        let encoder = Encoder::default();
        let mut bytes = Vec::new();
        for value in [3u64, 1, 2] {
            bytes.extend_from_slice(&encoder.encode(&ChallengeEcho { value }).unwrap());
        }
        bytes.extend_from_slice(&encoder.encode(&Heartbeat).unwrap());
        client.write_all(&bytes).await.unwrap();

        let reply = read_message(&mut client).await;
        assert_eq!(reply.decode::<HeartbeatReply>().unwrap().server_time_millis, 5);
        assert_eq!(*handler.echoes.lock(), vec![3, 1, 2]);

        drop(client);
        assert!(task.await.unwrap().is_ok());
    }

    #[tokio::test]
    async fn test_protocol_violation_closes() {
        let (conn, mut client) = pair().await;
        let handle = conn.handle().clone();
        let task = tokio::spawn(async move { conn.run(&Recorder::default()).await });

        let frame = FrameParams::default().encode(&[0x00, 0x42]).unwrap();
        client.write_all(&frame).await.unwrap();

        let result = task.await.unwrap();
        assert!(matches!(result, Err(ProtocolError::UnknownMessage(0x0042))));
        assert!(handle.is_closed());
        assert!(matches!(
            handle.send(&Heartbeat),
            Err(ProtocolError::ConnectionClosed)
        ));

        let mut buf = [0u8; 8];
        assert_eq!(client.read(&mut buf).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_close_flushes_queued_frames() {
        let (conn, mut client) = pair().await;
        let handle = conn.handle().clone();
        let task = tokio::spawn(async move { conn.run(&Recorder::default()).await });

        handle.set_state(ConnectionState::Validated);
        handle.send(&HeartbeatReply { server_time_millis: 9 }).unwrap();
        handle.close();
        handle.close();
        handle.set_state(ConnectionState::Validated);
        assert_eq!(handle.state(), ConnectionState::Closed);

        let msg = read_message(&mut client).await;
        assert_eq!(msg.decode::<HeartbeatReply>().unwrap().server_time_millis, 9);
        assert!(task.await.unwrap().is_ok());
    }
}
