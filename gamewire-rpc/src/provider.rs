//! RPC provider node.
//!
//! A provider serves [`RpcExecute`] calls on its own listener and, when a
//! service center is configured, keeps a client connection to it:
//!
//! ```text
//! caller ── RpcExecute ──> provider ── RpcResult ──> caller
//!
//! provider ── PushServices ──> center       (on every validated connect)
//! provider ── AddSchedule ───> center
//! center ──── TriggerSchedule ─> provider    (job runs; end = forget it)
//! center ──── FetchServices ───> provider ── FetchServicesResult ──> center
//! ```

use crate::config::ProviderConfig;
use crate::error::RpcError;
use crate::messages::{
    AddSchedule, FetchServices, FetchServicesResult, PushServices, RpcExecute, RpcResult,
    TriggerSchedule,
};
use crate::schedule::ProviderJob;
use crate::service::{service_name, RpcService, ServiceCatalog, ServiceTable};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use gamewire_client::{ClientConfig, ClientConnector, ClientEventListener};
use gamewire_protocol::{ConnectionHandle, HandlerError, MessageContext, MessageRegistry};
use gamewire_server::{Server, ServerError, ServerEventListener};
use parking_lot::{Mutex, RwLock};
use std::net::SocketAddr;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use tokio::net::TcpListener;

/// Callbacks for provider lifecycle events.
pub trait ProviderListener: Send + Sync + 'static {
    /// The RPC listener is bound.
    fn on_provider_bind(&self, _addr: SocketAddr) {}

    /// The service center accepted our handshake and received our services.
    fn on_service_center_connected(&self, _services: &[String]) {}
}

/// Listener that ignores every event.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopProviderListener;

impl ProviderListener for NoopProviderListener {}

/// State shared by the provider, its handlers and both listeners.
struct ProviderCore {
    provider_id: u32,
    advertise_ip: String,
    bind_port: u16,
    services: RwLock<Arc<ServiceTable>>,
    jobs: DashMap<String, ProviderJob>,
    local_addr: Mutex<Option<SocketAddr>>,
    listener: Arc<dyn ProviderListener>,
}

impl ProviderCore {
    fn table(&self) -> Arc<ServiceTable> {
        self.services.read().clone()
    }

    fn advertised_port(&self) -> u16 {
        self.local_addr
            .lock()
            .map_or(self.bind_port, |addr| addr.port())
    }

    fn push_services(&self, conn: &ConnectionHandle) -> Result<Vec<String>, HandlerError> {
        let services = self.table().names();
        conn.send(&PushServices {
            provider_id: self.provider_id,
            ip: self.advertise_ip.clone(),
            port: self.advertised_port(),
            services: services.clone(),
        })?;
        tracing::info!(
            "[{}] Pushed {} service(s) to service center",
            conn.peer_addr(),
            services.len()
        );
        Ok(services)
    }

    fn on_execute(&self, request: RpcExecute, ctx: &MessageContext) -> Result<(), HandlerError> {
        tracing::debug!(
            "[{}] RPC {} {}::{}",
            ctx.connection().peer_addr(),
            request.request_id,
            request.service_name,
            request.method_signature
        );
        let result = self.table().execute(&request);
        ctx.reply(&result)?;
        Ok(())
    }

    fn on_fetch(&self, _: FetchServices, ctx: &MessageContext) -> Result<(), HandlerError> {
        ctx.reply(&FetchServicesResult {
            provider_id: self.provider_id,
            services: self.table().names(),
        })?;
        Ok(())
    }

    fn on_trigger(&self, trigger: TriggerSchedule, ctx: &MessageContext) -> Result<(), HandlerError> {
        let addr = ctx.connection().peer_addr();
        let name = trigger.job_name;

        let job = if trigger.end {
            self.jobs.remove(&name).map(|(_, job)| job)
        } else {
            self.jobs.get(&name).map(|job| job.value().clone())
        };
        let job = job.ok_or_else(|| HandlerError::failed(format!("trigger for unknown job '{}'", name)))?;

        if trigger.end {
            tracing::info!("[{}] Job '{}' ended", addr, name);
        }
        tracing::debug!("[{}] Running job '{}'", addr, name);
        catch_unwind(AssertUnwindSafe(|| job.run()))
            .map_err(|_| HandlerError::failed(format!("job '{}' panicked", name)))
    }
}

/// Forwards the bind event of the RPC listener.
struct ServerSide {
    core: Arc<ProviderCore>,
}

impl ServerEventListener for ServerSide {
    fn on_server_bind(&self, addr: SocketAddr) {
        *self.core.local_addr.lock() = Some(addr);
        self.core.listener.on_provider_bind(addr);
    }
}

/// Registers with the service center on every validated connection.
struct CenterSide {
    core: Arc<ProviderCore>,
}

impl ClientEventListener for CenterSide {
    fn on_channel_state_changed(&self, active: bool) {
        if !active {
            tracing::warn!("Service center connection lost");
        }
    }

    fn on_connection_effective(&self, conn: &ConnectionHandle) {
        match self.core.push_services(conn) {
            Ok(services) => self.core.listener.on_service_center_connected(&services),
            Err(e) => {
                tracing::error!("[{}] Failed to push services: {}", conn.peer_addr(), e);
            }
        }
    }

    fn on_exception_caught(&self, error: &HandlerError) {
        tracing::warn!("Service center message failed: {}", error);
    }
}

/// Hosts services over gamewire and optionally registers with a service center.
pub struct RpcProvider {
    core: Arc<ProviderCore>,
    server: Server,
    center: Option<ClientConnector>,
}

impl RpcProvider {
    /// Builds the service table from `catalog` and prepares the listener.
    ///
    /// Fails if any declaration or binding in the catalog is invalid.
    pub fn new(
        config: ProviderConfig,
        catalog: &ServiceCatalog,
        listener: Arc<dyn ProviderListener>,
    ) -> Result<Self, RpcError> {
        config.validate()?;
        let table = catalog.build()?;
        tracing::info!(
            "Provider {} hosting {} service(s)",
            config.provider.provider_id,
            table.len()
        );

        let core = Arc::new(ProviderCore {
            provider_id: config.provider.provider_id,
            advertise_ip: config.provider.advertise_ip.clone(),
            bind_port: config.server.network.bind_addr.port(),
            services: RwLock::new(Arc::new(table)),
            jobs: DashMap::new(),
            local_addr: Mutex::new(None),
            listener,
        });

        let mut registry = MessageRegistry::new();
        let c = core.clone();
        registry.register(move |msg: RpcExecute, ctx| c.on_execute(msg, ctx))?;
        let c = core.clone();
        registry.register(move |msg: FetchServices, ctx| c.on_fetch(msg, ctx))?;

        let center = match &config.provider.service_center {
            Some(center) => {
                let mut registry = MessageRegistry::new();
                let c = core.clone();
                registry.register(move |msg: TriggerSchedule, ctx| c.on_trigger(msg, ctx))?;
                let c = core.clone();
                registry.register(move |msg: FetchServices, ctx| c.on_fetch(msg, ctx))?;

                let client_config = ClientConfig::new(center.address())
                    .with_auto_reconnect(center.auto_reconnect())
                    .with_heartbeat(center.heartbeat())
                    .with_codec(config.server.codec);
                let side = Arc::new(CenterSide { core: core.clone() });
                Some(ClientConnector::new(client_config, registry, side)?)
            }
            None => None,
        };

        let side = Arc::new(ServerSide { core: core.clone() });
        let server = Server::new(config.server, registry, side)?;

        Ok(Self {
            core,
            server,
            center,
        })
    }

    /// Binds the configured address and serves until [`stop`](Self::stop).
    pub async fn run(&self) -> Result<(), RpcError> {
        let listener = TcpListener::bind(self.server.config().network.bind_addr)
            .await
            .map_err(ServerError::from)?;
        self.serve(listener).await
    }

    /// Serves on an already bound listener. Connects to the service center
    /// once the address to advertise is known.
    pub async fn serve(&self, listener: TcpListener) -> Result<(), RpcError> {
        let addr = listener.local_addr().map_err(ServerError::from)?;
        *self.core.local_addr.lock() = Some(addr);

        if let Some(center) = &self.center {
            tracing::info!("Registering with service center {}", center.config().address);
            center.connect()?;
        }

        self.server.serve(listener).await?;
        Ok(())
    }

    /// Stops the listener and the service center connection.
    pub fn stop(&self) {
        if let Some(center) = &self.center {
            center.disconnect();
        }
        self.server.shutdown();
    }

    /// Registers a job with the service center.
    ///
    /// A name already held locally is rejected before anything is sent. The
    /// job is kept only if the registration was sent.
    pub fn schedule(&self, job: ProviderJob) -> Result<(), RpcError> {
        let center = self.center.as_ref().ok_or(RpcError::NotServiceCenterMode)?;
        let name = job.name().to_string();
        job.spec()
            .validate()
            .map_err(|reason| RpcError::InvalidSchedule {
                job: name.clone(),
                reason,
            })?;

        let message = AddSchedule {
            job_name: name.clone(),
            provider_id: self.core.provider_id,
            spec: job.spec().clone(),
        };

        match self.core.jobs.entry(name.clone()) {
            Entry::Occupied(_) => return Err(RpcError::DuplicateJob(name)),
            Entry::Vacant(slot) => {
                slot.insert(job);
            }
        }

        if let Err(e) = center.send(&message) {
            self.core.jobs.remove(&name);
            return Err(e.into());
        }
        tracing::info!("Scheduled job '{}' ({})", name, message.spec);
        Ok(())
    }

    /// Replaces the service table. The new list is pushed to the service
    /// center if connected.
    pub fn reload(&self, catalog: &ServiceCatalog) -> Result<(), RpcError> {
        let table = catalog.build()?;
        tracing::info!("Reloaded {} service(s)", table.len());
        *self.core.services.write() = Arc::new(table);

        if let Some(conn) = self.center.as_ref().and_then(|c| c.connection()) {
            if conn.is_validated() {
                if let Err(e) = self.core.push_services(&conn) {
                    tracing::warn!("Failed to push reloaded services: {}", e);
                }
            }
        }
        Ok(())
    }

    /// Runs one invocation locally, as if it came over the wire.
    pub fn execute(&self, request: &RpcExecute) -> RpcResult {
        self.core.table().execute(request)
    }

    /// The implementation bound to (`provider`, `interface`).
    pub fn get_service_instance(&self, provider: &str, interface: &str) -> Option<Arc<dyn RpcService>> {
        self.core
            .table()
            .get(&service_name(provider, interface))
            .map(|s| s.instance().clone())
    }

    /// Sorted names of the hosted services.
    pub fn service_names(&self) -> Vec<String> {
        self.core.table().names()
    }

    /// Sorted names of the jobs held locally.
    pub fn job_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.core.jobs.iter().map(|j| j.key().clone()).collect();
        names.sort();
        names
    }

    pub fn has_job(&self, name: &str) -> bool {
        self.core.jobs.contains_key(name)
    }

    pub fn provider_id(&self) -> u32 {
        self.core.provider_id
    }

    /// Address the RPC listener is bound to, once serving.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        *self.core.local_addr.lock()
    }

    pub fn server(&self) -> &Server {
        &self.server
    }

    /// The service center connector, in service-center mode.
    pub fn center(&self) -> Option<&ClientConnector> {
        self.center.as_ref()
    }

    pub fn is_service_center_mode(&self) -> bool {
        self.center.is_some()
    }
}
