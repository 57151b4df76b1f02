//! Outbound connector with handshake response, heartbeats and
//! fixed-interval reconnection.
//!
//! A single supervisor task owns the dial/run/retry loop, so at most one
//! connection and one heartbeat timer exist at any time.

use crate::config::ClientConfig;
use crate::error::ClientError;
use gamewire_protocol::{
    is_inner, Challenge, ChallengeCipher, ChallengeEcho, Connection, ConnectionHandle,
    ConnectionState, Delivery, FrameHandler, HandlerError, Heartbeat, HeartbeatReply, Message,
    MessageContext, MessageRegistry, ProtocolError, RawMessage, ValidationSuccess,
};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::Arc;
use tokio::net::TcpStream;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;

/// Callbacks for client connection events.
pub trait ClientEventListener: Send + Sync + 'static {
    /// The channel went up (`true`) or down (`false`).
    fn on_channel_state_changed(&self, _active: bool) {}

    /// The server accepted our handshake.
    fn on_connection_effective(&self, _conn: &ConnectionHandle) {}

    /// A handler returned an error. The connection stays open.
    fn on_exception_caught(&self, _error: &HandlerError) {}

    /// Runs an application message. The default runs its handler inline.
    fn dispatch_message(&self, ctx: &MessageContext, delivery: Delivery) -> Result<(), HandlerError> {
        delivery.handle(ctx)
    }
}

/// Listener that ignores every event.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopClientListener;

impl ClientEventListener for NoopClientListener {}

/// Connector lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectorState {
    Disconnected,
    Connecting,
    Connected,
}

struct Inner {
    config: ClientConfig,
    cipher: ChallengeCipher,
    listener: Arc<dyn ClientEventListener>,
    state: watch::Sender<ConnectorState>,
    current: Mutex<Option<ConnectionHandle>>,
    heartbeat: Mutex<Option<JoinHandle<()>>>,
    heartbeats_started: AtomicU64,
    server_time: AtomicI64,
}

impl Inner {
    fn set_state(&self, state: ConnectorState) {
        self.state.send_replace(state);
    }

    fn on_challenge(&self, challenge: Challenge, ctx: &MessageContext) -> Result<(), HandlerError> {
        let conn = ctx.connection();
        match self.cipher.decrypt(&challenge.ciphertext) {
            Ok(value) => {
                conn.set_state(ConnectionState::AwaitingValidation);
                ctx.reply(&ChallengeEcho { value })?;
                tracing::debug!("[{}] Challenge answered", conn.peer_addr());
            }
            Err(e) => {
                tracing::error!(
                    "[{}] Cannot decrypt challenge, closing: {}",
                    conn.peer_addr(),
                    e
                );
                conn.close();
            }
        }
        Ok(())
    }

    fn on_validation_success(&self, _: ValidationSuccess, ctx: &MessageContext) -> Result<(), HandlerError> {
        let conn = ctx.connection();
        conn.set_state(ConnectionState::Validated);
        tracing::info!("[{}] Connection validated", conn.peer_addr());

        if !self.config.heartbeat_interval.is_zero() {
            self.start_heartbeat(conn.clone());
        }
        self.listener.on_connection_effective(conn);
        Ok(())
    }

    fn on_heartbeat_reply(&self, reply: HeartbeatReply, _: &MessageContext) -> Result<(), HandlerError> {
        self.server_time
            .store(reply.server_time_millis, Ordering::Relaxed);
        Ok(())
    }

    /// Replaces any running heartbeat timer with one bound to `conn`.
    fn start_heartbeat(&self, conn: ConnectionHandle) {
        let period = self.config.heartbeat_interval;
        let task = tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            loop {
                interval.tick().await;
                if let Err(e) = conn.send(&Heartbeat) {
                    tracing::debug!("[{}] Heartbeat stopped: {}", conn.peer_addr(), e);
                    break;
                }
            }
        });

        if let Some(old) = self.heartbeat.lock().replace(task) {
            old.abort();
        }
        self.heartbeats_started.fetch_add(1, Ordering::Relaxed);
    }

    fn stop_heartbeat(&self) {
        if let Some(task) = self.heartbeat.lock().take() {
            task.abort();
        }
    }

    /// Clears per-connection state after the channel goes down.
    fn channel_inactive(&self) {
        self.stop_heartbeat();
        self.current.lock().take();
        self.set_state(ConnectorState::Disconnected);
        self.listener.on_channel_state_changed(false);
    }
}

/// Routes frames of the client connection.
struct Dispatcher {
    inner: Arc<Inner>,
    handlers: MessageRegistry,
    application: MessageRegistry,
}

impl FrameHandler for Dispatcher {
    fn on_frame(&self, conn: &ConnectionHandle, frame: RawMessage) -> Result<(), ProtocolError> {
        let ctx = MessageContext::new(conn.clone());
        let result = if is_inner(frame.id) {
            self.handlers.resolve(&frame)?.handle(&ctx)
        } else {
            let delivery = self.application.resolve(&frame)?;
            tracing::debug!("[{}] Message {:?}", conn.peer_addr(), delivery);
            self.inner.listener.dispatch_message(&ctx, delivery)
        };

        if let Err(e) = result {
            tracing::error!(
                "[{}] Handler for message {:#06x} failed: {}",
                conn.peer_addr(),
                frame.id,
                e
            );
            self.inner.listener.on_exception_caught(&e);
        }
        Ok(())
    }
}

/// Client side of a gamewire connection.
pub struct ClientConnector {
    inner: Arc<Inner>,
    dispatcher: Arc<Dispatcher>,
    supervisor: Mutex<Option<(JoinHandle<()>, broadcast::Sender<()>)>>,
}

impl ClientConnector {
    /// Creates a connector. `registry` holds the application handlers.
    pub fn new(
        config: ClientConfig,
        registry: MessageRegistry,
        listener: Arc<dyn ClientEventListener>,
    ) -> Result<Self, ClientError> {
        let (state, _) = watch::channel(ConnectorState::Disconnected);
        let inner = Arc::new(Inner {
            cipher: ChallengeCipher::new(&config.address.secret),
            config,
            listener,
            state,
            current: Mutex::new(None),
            heartbeat: Mutex::new(None),
            heartbeats_started: AtomicU64::new(0),
            server_time: AtomicI64::new(0),
        });

        let mut handlers = MessageRegistry::new();
        let i = inner.clone();
        handlers.register(move |msg: Challenge, ctx| i.on_challenge(msg, ctx))?;
        let i = inner.clone();
        handlers.register(move |msg: ValidationSuccess, ctx| i.on_validation_success(msg, ctx))?;
        let i = inner.clone();
        handlers.register(move |msg: HeartbeatReply, ctx| i.on_heartbeat_reply(msg, ctx))?;

        Ok(Self {
            dispatcher: Arc::new(Dispatcher {
                inner: inner.clone(),
                handlers,
                application: registry,
            }),
            inner,
            supervisor: Mutex::new(None),
        })
    }

    /// Starts connecting in the background.
    ///
    /// The first attempt is made immediately. If auto-reconnect is enabled,
    /// failed attempts and dropped connections are retried at the configured
    /// interval until [`disconnect`](Self::disconnect) is called.
    pub fn connect(&self) -> Result<(), ClientError> {
        let mut supervisor = self.supervisor.lock();
        if let Some((task, _)) = supervisor.as_ref() {
            if !task.is_finished() {
                return Err(ClientError::AlreadyStarted);
            }
        }

        let (stop_tx, stop_rx) = broadcast::channel(1);
        let task = tokio::spawn(Self::supervise(
            self.inner.clone(),
            self.dispatcher.clone(),
            stop_rx,
        ));
        *supervisor = Some((task, stop_tx));
        Ok(())
    }

    async fn supervise(
        inner: Arc<Inner>,
        dispatcher: Arc<Dispatcher>,
        mut stop: broadcast::Receiver<()>,
    ) {
        let target = inner.config.address.dial_target();

        loop {
            inner.set_state(ConnectorState::Connecting);
            tracing::debug!("Connecting to {}...", target);

            let attempt = tokio::select! {
                result = Self::dial(&target, &inner.config) => result,
                _ = stop.recv() => break,
            };

            match attempt {
                Ok(stream) => {
                    let peer = match stream.peer_addr() {
                        Ok(peer) => peer,
                        Err(e) => {
                            tracing::warn!("Failed to connect to {}: {}", target, e);
                            inner.set_state(ConnectorState::Disconnected);
                            if !Self::wait_retry(&inner, &mut stop).await {
                                break;
                            }
                            continue;
                        }
                    };

                    let conn = Connection::new(stream, peer, inner.config.codec);
                    *inner.current.lock() = Some(conn.handle().clone());
                    inner.set_state(ConnectorState::Connected);
                    tracing::info!("Connected to {} (key {})", target, inner.cipher.fingerprint());
                    inner.listener.on_channel_state_changed(true);

                    match conn.run(dispatcher.as_ref()).await {
                        Ok(()) => tracing::info!("[{}] Disconnected", peer),
                        Err(e) => tracing::warn!("[{}] Connection lost: {}", peer, e),
                    }
                    inner.channel_inactive();
                }
                Err(e) => {
                    tracing::warn!("Failed to connect to {}: {}", target, e);
                    inner.set_state(ConnectorState::Disconnected);
                }
            }

            if !Self::wait_retry(&inner, &mut stop).await {
                break;
            }
        }

        inner.set_state(ConnectorState::Disconnected);
    }

    async fn dial(target: &str, config: &ClientConfig) -> Result<TcpStream, ClientError> {
        let stream = tokio::time::timeout(config.connect_timeout, TcpStream::connect(target))
            .await
            .map_err(|_| ClientError::Timeout)??;
        if let Err(e) = stream.set_nodelay(true) {
            tracing::debug!("Failed to set TCP_NODELAY: {}", e);
        }
        Ok(stream)
    }

    /// Sleeps for the reconnect interval. Returns `false` when the loop
    /// should end instead.
    async fn wait_retry(inner: &Inner, stop: &mut broadcast::Receiver<()>) -> bool {
        if !inner.config.reconnect_enabled() {
            return false;
        }
        let delay = inner.config.auto_reconnect;
        tracing::info!(
            "Reconnecting to {} in {:?}",
            inner.config.address,
            delay
        );
        tokio::select! {
            _ = tokio::time::sleep(delay) => true,
            _ = stop.recv() => false,
        }
    }

    /// Closes the connection and stops reconnecting.
    pub fn disconnect(&self) {
        if let Some((_, stop)) = self.supervisor.lock().take() {
            let _ = stop.send(());
        }
        if let Some(conn) = self.inner.current.lock().as_ref() {
            conn.close();
        }
    }

    /// Sends a message on the current connection.
    ///
    /// Fails with [`ClientError::NotConnected`] unless a channel is up and
    /// has completed the handshake, since the server drops anything earlier.
    /// The message is dropped, not queued.
    pub fn send<M: Message>(&self, message: &M) -> Result<(), ClientError> {
        let conn = self
            .connection()
            .filter(|c| c.is_validated())
            .ok_or(ClientError::NotConnected)?;
        conn.send(message).map_err(|e| match e {
            ProtocolError::ConnectionClosed => ClientError::NotConnected,
            other => ClientError::Protocol(other),
        })
    }

    /// The current connection, if any.
    pub fn connection(&self) -> Option<ConnectionHandle> {
        self.inner.current.lock().clone()
    }

    pub fn state(&self) -> ConnectorState {
        *self.inner.state.borrow()
    }

    /// Watches connector state changes.
    pub fn subscribe_state(&self) -> watch::Receiver<ConnectorState> {
        self.inner.state.subscribe()
    }

    /// Whether the current connection completed the handshake.
    pub fn is_effective(&self) -> bool {
        self.connection().map_or(false, |c| c.is_validated())
    }

    /// Latest server clock from a heartbeat reply, in milliseconds.
    ///
    /// Advisory only.
    pub fn server_time(&self) -> Option<i64> {
        match self.inner.server_time.load(Ordering::Relaxed) {
            0 => None,
            t => Some(t),
        }
    }

    /// Whether a heartbeat timer is currently running.
    pub fn heartbeat_running(&self) -> bool {
        self.inner
            .heartbeat
            .lock()
            .as_ref()
            .map_or(false, |task| !task.is_finished())
    }

    /// Number of heartbeat timers started so far.
    pub fn heartbeats_started(&self) -> u64 {
        self.inner.heartbeats_started.load(Ordering::Relaxed)
    }

    pub fn config(&self) -> &ClientConfig {
        &self.inner.config
    }
}

impl Drop for ClientConnector {
    fn drop(&mut self) {
        self.disconnect();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use gamewire_protocol::{AddressPair, MessageId};
    use gamewire_server::{Config, NoopListener, Server};
    use serde::{Deserialize, Serialize};
    use std::net::SocketAddr;
    use std::sync::atomic::AtomicBool;
    use std::time::{Duration, Instant};
    use tokio::net::TcpListener;

    const SECRET: &str = "shared";

    #[derive(Debug, Serialize, Deserialize)]
    struct Echo {
        text: String,
    }

    impl Message for Echo {
        const ID: MessageId = 0x0100;
    }

    #[derive(Default)]
    struct Flags {
        effective: AtomicU64,
        up: AtomicU64,
        down: AtomicU64,
        last_active: AtomicBool,
    }

    impl ClientEventListener for Flags {
        fn on_channel_state_changed(&self, active: bool) {
            if active {
                self.up.fetch_add(1, Ordering::SeqCst);
            } else {
                self.down.fetch_add(1, Ordering::SeqCst);
            }
            self.last_active.store(active, Ordering::SeqCst);
        }

        fn on_connection_effective(&self, _conn: &ConnectionHandle) {
            self.effective.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn server_registry() -> MessageRegistry {
        let mut registry = MessageRegistry::new();
        registry
            .register(|msg: Echo, ctx| {
                ctx.reply(&msg)?;
                Ok(())
            })
            .unwrap();
        registry
    }

    async fn start_server_on(listener: TcpListener) -> Arc<Server> {
        let config = Config::default().with_secret(SECRET);
        let server = Arc::new(Server::new(config, server_registry(), Arc::new(NoopListener)).unwrap());
        let s = server.clone();
        tokio::spawn(async move { s.serve(listener).await });
        server
    }

    async fn start_server() -> (Arc<Server>, SocketAddr) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        (start_server_on(listener).await, addr)
    }

    fn client_config(addr: SocketAddr, secret: &str) -> ClientConfig {
        ClientConfig::new(AddressPair::new("127.0.0.1", addr.port(), secret))
    }

    async fn wait_until(timeout: Duration, mut cond: impl FnMut() -> bool) -> bool {
        let deadline = Instant::now() + timeout;
        while Instant::now() < deadline {
            if cond() {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        cond()
    }

    #[tokio::test]
    async fn test_handshake_heartbeat_and_send() {
        let (server, addr) = start_server().await;

        let received = Arc::new(Mutex::new(Vec::new()));
        let mut registry = MessageRegistry::new();
        let r = received.clone();
        registry
            .register(move |msg: Echo, _| {
                r.lock().push(msg.text);
                Ok(())
            })
            .unwrap();

        let flags = Arc::new(Flags::default());
        let config = client_config(addr, SECRET).with_heartbeat(Duration::from_millis(50));
        let client = ClientConnector::new(config, registry, flags.clone()).unwrap();
        assert!(matches!(
            client.send(&Echo { text: "early".into() }),
            Err(ClientError::NotConnected)
        ));

        client.connect().unwrap();
        assert!(matches!(client.connect(), Err(ClientError::AlreadyStarted)));
        assert!(wait_until(Duration::from_secs(5), || client.is_effective()).await);
        assert_eq!(flags.effective.load(Ordering::SeqCst), 1);
        assert_eq!(client.state(), ConnectorState::Connected);

        client.send(&Echo { text: "hi".into() }).unwrap();
        assert!(wait_until(Duration::from_secs(5), || received.lock().len() == 1).await);
        assert_eq!(received.lock()[0], "hi");

        assert!(wait_until(Duration::from_secs(5), || client.server_time().is_some()).await);
        assert!(client.heartbeat_running());
        assert!(server.stats().heartbeats_received.load(Ordering::Relaxed) >= 1);

        client.disconnect();
        assert!(wait_until(Duration::from_secs(5), || {
            client.state() == ConnectorState::Disconnected && !client.heartbeat_running()
        })
        .await);
        assert!(!flags.last_active.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn test_send_refused_until_validated() {
        // A peer that accepts the socket but never starts the handshake.
        let silent = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = silent.local_addr().unwrap();
        let accepted = tokio::spawn(async move { silent.accept().await.map(|(stream, _)| stream) });

        let client = ClientConnector::new(
            client_config(addr, SECRET),
            MessageRegistry::new(),
            Arc::new(NoopClientListener),
        )
        .unwrap();
        client.connect().unwrap();
        assert!(wait_until(Duration::from_secs(5), || client.state() == ConnectorState::Connected).await);
        let _stream = accepted.await.unwrap().unwrap();

        assert!(client.connection().is_some());
        assert!(!client.is_effective());
        assert!(matches!(
            client.send(&Echo { text: "too soon".into() }),
            Err(ClientError::NotConnected)
        ));
        client.disconnect();
    }

    #[tokio::test]
    async fn test_wrong_secret_never_validates() {
        let (server, addr) = start_server().await;
        let flags = Arc::new(Flags::default());
        let client = ClientConnector::new(
            client_config(addr, "wrong"),
            MessageRegistry::new(),
            flags.clone(),
        )
        .unwrap();
        client.connect().unwrap();

        assert!(wait_until(Duration::from_secs(5), || flags.down.load(Ordering::SeqCst) == 1).await);
        assert_eq!(flags.effective.load(Ordering::SeqCst), 0);
        assert_eq!(server.stats().validations_succeeded.load(Ordering::Relaxed), 0);
        // No reconnect configured: the supervisor is done.
        assert!(wait_until(Duration::from_secs(1), || client.state() == ConnectorState::Disconnected).await);
    }

    #[tokio::test]
    async fn test_reconnect_after_refused_attempt() {
        // Reserve a port, then free it so the first attempt is refused.
        let reserved = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = reserved.local_addr().unwrap();
        drop(reserved);

        let reconnect = Duration::from_millis(500);
        let heartbeat = Duration::from_millis(100);
        let flags = Arc::new(Flags::default());
        let config = client_config(addr, SECRET)
            .with_auto_reconnect(reconnect)
            .with_heartbeat(heartbeat);
        let client = ClientConnector::new(config, MessageRegistry::new(), flags.clone()).unwrap();

        let first_failure = Instant::now();
        client.connect().unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(!client.is_effective());
        assert_eq!(flags.up.load(Ordering::SeqCst), 0);

        let server = start_server_on(TcpListener::bind(addr).await.unwrap()).await;

        assert!(wait_until(Duration::from_secs(3), || client.is_effective()).await);
        assert!(first_failure.elapsed() <= reconnect + Duration::from_millis(400));
        assert_eq!(flags.up.load(Ordering::SeqCst), 1);
        assert_eq!(client.heartbeats_started(), 1);
        assert!(client.heartbeat_running());

        // One timer: roughly one heartbeat per period, not two.
        let before = server.stats().heartbeats_received.load(Ordering::Relaxed);
        tokio::time::sleep(Duration::from_millis(1000)).await;
        let sent = server.stats().heartbeats_received.load(Ordering::Relaxed) - before;
        assert!((7..=13).contains(&sent), "heartbeats in 1s: {}", sent);

        client.disconnect();
    }

    #[tokio::test]
    async fn test_reconnect_after_server_drop() {
        let (server, addr) = start_server().await;
        let flags = Arc::new(Flags::default());
        let config = client_config(addr, SECRET)
            .with_auto_reconnect(Duration::from_millis(100))
            .with_heartbeat(Duration::from_millis(50));
        let client = ClientConnector::new(config, MessageRegistry::new(), flags.clone()).unwrap();
        client.connect().unwrap();
        assert!(wait_until(Duration::from_secs(5), || client.is_effective()).await);

        // Kick the client from the server side.
        for id in server.connection_ids() {
            server.connection(id).unwrap().close();
        }

        assert!(wait_until(Duration::from_secs(5), || flags.effective.load(Ordering::SeqCst) == 2).await);
        assert_eq!(flags.down.load(Ordering::SeqCst), 1);
        assert_eq!(client.heartbeats_started(), 2);
        assert!(client.heartbeat_running());
        client.disconnect();
    }
}
