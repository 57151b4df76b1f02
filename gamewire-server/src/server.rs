//! TCP server listener.
//!
//! Every accepted socket goes through the handshake before application
//! traffic is allowed:
//!
//! ```text
//! accept ── whitelist? ──no──> closed
//!    │
//!    └─> AwaitingValidation ── Challenge ──> peer
//!              │   <── ChallengeEcho ──
//!              ├─ mismatch / timeout ──> Closed
//!              └─ match ── ValidationSuccess ──> Validated
//! ```

use crate::config::Config;
use crate::error::ServerError;
use crate::session::{ValidationRecord, ValidationTable};
use dashmap::DashMap;
use gamewire_protocol::{
    is_inner, Challenge, ChallengeCipher, ChallengeEcho, Connection, ConnectionHandle,
    ConnectionState, Delivery, FrameHandler, HandlerError, Heartbeat, HeartbeatReply, Message,
    MessageContext, MessageRegistry, ProtocolError, RawMessage, ValidationSuccess,
};
use parking_lot::Mutex;
use std::collections::HashSet;
use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::watch;
use uuid::Uuid;

/// Callbacks for server lifecycle events.
///
/// All methods have no-op defaults. Callbacks run on the connection's own
/// task and must not block for long.
pub trait ServerEventListener: Send + Sync + 'static {
    /// The listener is bound and accepting.
    fn on_server_bind(&self, _addr: SocketAddr) {}

    /// A peer passed the whitelist and the handshake is about to start.
    fn on_channel_active(&self, _conn: &ConnectionHandle) {}

    /// The connection ended.
    fn on_channel_inactive(&self, _conn: &ConnectionHandle) {}

    /// The peer completed the handshake.
    fn on_connection_effective(&self, _conn: &ConnectionHandle) {}

    /// A handler returned an error. The connection stays open.
    fn on_exception_caught(&self, _conn: &ConnectionHandle, _error: &HandlerError) {}

    /// Runs an application message. The default runs its handler inline.
    fn dispatch_message(&self, ctx: &MessageContext, delivery: Delivery) -> Result<(), HandlerError> {
        delivery.handle(ctx)
    }
}

/// Listener that ignores every event.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopListener;

impl ServerEventListener for NoopListener {}

/// Server statistics.
#[derive(Debug, Default)]
pub struct ServerStats {
    pub connections_total: AtomicU64,
    pub connections_active: AtomicU64,
    pub connections_rejected: AtomicU64,
    pub validations_succeeded: AtomicU64,
    pub validations_failed: AtomicU64,
    pub validations_expired: AtomicU64,
    pub messages_dropped: AtomicU64,
    pub heartbeats_received: AtomicU64,
    pub errors_total: AtomicU64,
}

/// State shared between the accept loop, connection tasks and inner handlers.
struct Shared {
    config: Config,
    cipher: ChallengeCipher,
    whitelist: Option<HashSet<IpAddr>>,
    validations: ValidationTable,
    connections: DashMap<Uuid, ConnectionHandle>,
    listener: Arc<dyn ServerEventListener>,
    stats: ServerStats,
}

impl Shared {
    fn is_allowed(&self, ip: &IpAddr) -> bool {
        match &self.whitelist {
            Some(ips) => ips.contains(ip),
            None => true,
        }
    }

    /// Sends the challenge and records it. The record is stored first so an
    /// echo can never arrive before it.
    fn begin_validation(&self, conn: &ConnectionHandle) -> Result<(), ProtocolError> {
        let challenge = ChallengeCipher::random_challenge();
        let ciphertext = self.cipher.encrypt(challenge)?;

        conn.set_state(ConnectionState::AwaitingValidation);
        self.validations
            .insert(ValidationRecord::new(conn.clone(), challenge));

        if let Err(e) = conn.send(&Challenge { ciphertext }) {
            self.validations.remove(&conn.id());
            return Err(e);
        }
        tracing::debug!("[{}] Challenge sent", conn.peer_addr());
        Ok(())
    }

    fn on_challenge_echo(&self, echo: ChallengeEcho, ctx: &MessageContext) -> Result<(), HandlerError> {
        let conn = ctx.connection();
        let addr = conn.peer_addr();

        let record = match self.validations.take(&conn.id()) {
            Some(record) => record,
            None => {
                tracing::warn!("[{}] Challenge echo without pending validation, closing", addr);
                conn.close();
                return Ok(());
            }
        };

        if record.challenge != echo.value {
            tracing::warn!("[{}] Challenge mismatch, closing", addr);
            self.stats.validations_failed.fetch_add(1, Ordering::Relaxed);
            conn.close();
            return Ok(());
        }

        conn.set_state(ConnectionState::Validated);
        ctx.reply(&ValidationSuccess)?;
        self.stats
            .validations_succeeded
            .fetch_add(1, Ordering::Relaxed);
        tracing::info!("[{}] Connection validated in {:?}", addr, record.age());

        self.listener.on_connection_effective(conn);
        Ok(())
    }

    fn on_heartbeat(&self, _: Heartbeat, ctx: &MessageContext) -> Result<(), HandlerError> {
        self.stats
            .heartbeats_received
            .fetch_add(1, Ordering::Relaxed);
        ctx.reply(&HeartbeatReply {
            server_time_millis: chrono::Utc::now().timestamp_millis(),
        })?;
        Ok(())
    }

    fn report(&self, conn: &ConnectionHandle, id: u16, error: &HandlerError) {
        tracing::error!(
            "[{}] Handler for message {:#06x} failed: {}",
            conn.peer_addr(),
            id,
            error
        );
        self.stats.errors_total.fetch_add(1, Ordering::Relaxed);
        self.listener.on_exception_caught(conn, error);
    }
}

/// Routes frames of one server connection.
struct Dispatcher {
    shared: Arc<Shared>,
    inner: Arc<MessageRegistry>,
    application: Arc<MessageRegistry>,
}

impl FrameHandler for Dispatcher {
    fn on_frame(&self, conn: &ConnectionHandle, frame: RawMessage) -> Result<(), ProtocolError> {
        let addr = conn.peer_addr();
        let id = frame.id;
        let ctx = MessageContext::new(conn.clone());

        // Unknown or undecodable frames close the connection in any state.
        let result = if is_inner(id) {
            let delivery = self.inner.resolve(&frame)?;
            tracing::trace!("[{}] Inner message {:?}", addr, delivery);
            delivery.handle(&ctx)
        } else {
            let delivery = self.application.resolve(&frame)?;
            if !conn.is_validated() {
                tracing::warn!(
                    "[{}] Dropping message {:#06x} from unvalidated connection",
                    addr,
                    id
                );
                self.shared
                    .stats
                    .messages_dropped
                    .fetch_add(1, Ordering::Relaxed);
                return Ok(());
            }
            tracing::debug!("[{}] Message {:?}", addr, delivery);
            self.shared.listener.dispatch_message(&ctx, delivery)
        };

        if let Err(e) = result {
            self.shared.report(conn, id, &e);
        }
        Ok(())
    }
}

/// TCP server for gamewire.
pub struct Server {
    shared: Arc<Shared>,
    inner: Arc<MessageRegistry>,
    application: Arc<MessageRegistry>,
    local_addr: Mutex<Option<SocketAddr>>,
    shutdown: watch::Sender<bool>,
    running: AtomicBool,
}

impl Server {
    /// Creates a new server.
    ///
    /// `registry` holds the application handlers. Inner identifiers are
    /// handled by the server itself.
    pub fn new(
        config: Config,
        registry: MessageRegistry,
        listener: Arc<dyn ServerEventListener>,
    ) -> Result<Self, ServerError> {
        config.validate()?;
        let whitelist = config.network.whitelist_ips()?;

        for id in registry.ids().into_iter().filter(|id| is_inner(*id)) {
            tracing::warn!(
                "Application handler for inner message {:#06x} will never be called",
                id
            );
        }

        let (shutdown_tx, _) = watch::channel(false);
        let shared = Arc::new(Shared {
            cipher: ChallengeCipher::new(&config.handshake.secret),
            whitelist,
            validations: ValidationTable::new(),
            connections: DashMap::new(),
            listener,
            stats: ServerStats::default(),
            config,
        });

        let mut inner = MessageRegistry::new();
        let s = shared.clone();
        inner.register(move |msg: ChallengeEcho, ctx| s.on_challenge_echo(msg, ctx))?;
        let s = shared.clone();
        inner.register(move |msg: Heartbeat, ctx| s.on_heartbeat(msg, ctx))?;

        Ok(Self {
            shared,
            inner: Arc::new(inner),
            application: Arc::new(registry),
            local_addr: Mutex::new(None),
            shutdown: shutdown_tx,
            running: AtomicBool::new(false),
        })
    }

    /// Binds the configured address and runs the server.
    pub async fn run(&self) -> Result<(), ServerError> {
        let listener = TcpListener::bind(self.shared.config.network.bind_addr).await?;
        self.serve(listener).await
    }

    /// Runs the server on an already bound listener.
    pub async fn serve(&self, listener: TcpListener) -> Result<(), ServerError> {
        if self.running.swap(true, Ordering::SeqCst) {
            return Err(ServerError::AlreadyRunning);
        }

        let local_addr = listener.local_addr()?;
        *self.local_addr.lock() = Some(local_addr);
        tracing::info!(
            "Server '{}' listening on {} (key {})",
            self.shared.config.network.server_name,
            local_addr,
            self.shared.cipher.fingerprint()
        );
        self.shared.listener.on_server_bind(local_addr);

        let sweeper = tokio::spawn(Self::sweep_loop(
            self.shared.clone(),
            self.shutdown.subscribe(),
        ));

        let mut shutdown_rx = self.shutdown.subscribe();
        loop {
            if *shutdown_rx.borrow_and_update() {
                tracing::info!("Server shutting down");
                break;
            }

            tokio::select! {
                result = listener.accept() => {
                    match result {
                        Ok((stream, addr)) => self.accept(stream, addr),
                        Err(e) => {
                            tracing::error!("Accept error: {}", e);
                        }
                    }
                }
                _ = shutdown_rx.changed() => {}
            }
        }

        sweeper.abort();
        for conn in self.shared.connections.iter() {
            conn.value().close();
        }
        self.running.store(false, Ordering::SeqCst);
        Ok(())
    }

    fn accept(&self, stream: tokio::net::TcpStream, addr: SocketAddr) {
        let shared = &self.shared;

        if !shared.is_allowed(&addr.ip()) {
            tracing::warn!("[{}] Peer not in whitelist, rejecting", addr);
            shared
                .stats
                .connections_rejected
                .fetch_add(1, Ordering::Relaxed);
            return;
        }

        if shared.stats.connections_active.load(Ordering::Relaxed)
            >= shared.config.network.max_connections as u64
        {
            tracing::warn!("Connection limit reached, rejecting {}", addr);
            shared
                .stats
                .connections_rejected
                .fetch_add(1, Ordering::Relaxed);
            return;
        }

        if let Err(e) = stream.set_nodelay(true) {
            tracing::debug!("[{}] Failed to set TCP_NODELAY: {}", addr, e);
        }

        shared.stats.connections_total.fetch_add(1, Ordering::Relaxed);
        shared.stats.connections_active.fetch_add(1, Ordering::Relaxed);

        let conn = Connection::new(stream, addr, shared.config.codec);
        // Registered before the task starts so shutdown always sees it.
        shared
            .connections
            .insert(conn.handle().id(), conn.handle().clone());
        let dispatcher = Dispatcher {
            shared: shared.clone(),
            inner: self.inner.clone(),
            application: self.application.clone(),
        };
        tokio::spawn(Self::handle_connection(conn, dispatcher));
    }

    /// Handles a single connection from accept to close.
    async fn handle_connection(conn: Connection, dispatcher: Dispatcher) {
        let shared = dispatcher.shared.clone();
        let handle = conn.handle().clone();
        let addr = handle.peer_addr();
        tracing::info!("Client connected: {}", addr);

        shared.listener.on_channel_active(&handle);

        if let Err(e) = shared.begin_validation(&handle) {
            tracing::error!("[{}] Failed to start handshake: {}", addr, e);
            handle.close();
        }

        match conn.run(&dispatcher).await {
            Ok(()) => {}
            Err(ProtocolError::Io(e)) => {
                tracing::debug!("[{}] Connection error: {}", addr, e);
            }
            Err(e) => {
                tracing::error!("[{}] Protocol violation, closing: {}", addr, e);
                shared.stats.errors_total.fetch_add(1, Ordering::Relaxed);
            }
        }

        if shared.validations.remove(&handle.id()) {
            tracing::debug!("[{}] Dropped pending validation", addr);
        }
        shared.connections.remove(&handle.id());
        shared
            .stats
            .connections_active
            .fetch_sub(1, Ordering::Relaxed);
        shared.listener.on_channel_inactive(&handle);
        tracing::info!("Client disconnected: {}", addr);
    }

    /// Periodically evicts connections that never completed the handshake.
    async fn sweep_loop(shared: Arc<Shared>, mut shutdown: watch::Receiver<bool>) {
        let timeout = shared.config.handshake.validate_timeout();
        let mut interval = tokio::time::interval(shared.config.handshake.sweep_interval());
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            if *shutdown.borrow_and_update() {
                break;
            }
            tokio::select! {
                _ = interval.tick() => {
                    let evicted = shared.validations.sweep(timeout);
                    if evicted > 0 {
                        shared
                            .stats
                            .validations_expired
                            .fetch_add(evicted as u64, Ordering::Relaxed);
                        tracing::info!("Evicted {} unvalidated connection(s)", evicted);
                    }
                }
                _ = shutdown.changed() => {}
            }
        }
    }

    /// Sends a message to one connection.
    pub fn send_to<M: Message>(&self, id: Uuid, message: &M) -> Result<(), ServerError> {
        let conn = self.connection(id).ok_or(ServerError::ConnectionNotFound(id))?;
        conn.send(message)?;
        Ok(())
    }

    /// Sends a message to each listed connection. Returns how many accepted it.
    pub fn broadcast<M: Message>(&self, ids: &[Uuid], message: &M) -> usize {
        ids.iter()
            .filter(|id| match self.send_to(**id, message) {
                Ok(()) => true,
                Err(e) => {
                    tracing::debug!("Broadcast to {} failed: {}", id, e);
                    false
                }
            })
            .count()
    }

    /// Looks up a live connection.
    pub fn connection(&self, id: Uuid) -> Option<ConnectionHandle> {
        self.shared.connections.get(&id).map(|c| c.value().clone())
    }

    /// Ids of all live connections.
    pub fn connection_ids(&self) -> Vec<Uuid> {
        self.shared.connections.iter().map(|c| *c.key()).collect()
    }

    pub fn connection_count(&self) -> usize {
        self.shared.connections.len()
    }

    /// Number of connections still waiting to complete the handshake.
    pub fn pending_validations(&self) -> usize {
        self.shared.validations.len()
    }

    /// Address the server is bound to, once running.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        *self.local_addr.lock()
    }

    pub fn config(&self) -> &Config {
        &self.shared.config
    }

    /// Initiates server shutdown: stops accepting, closes live connections
    /// and stops the sweep.
    ///
    /// Shutdown is sticky. Calling it before [`serve`](Self::serve) makes
    /// `serve` return as soon as it starts.
    pub fn shutdown(&self) {
        self.shutdown.send_replace(true);
    }

    /// Returns whether the server is running.
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Returns server statistics.
    pub fn stats(&self) -> &ServerStats {
        &self.shared.stats
    }
}
