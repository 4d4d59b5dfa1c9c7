//! Host runtime.
//!
//! A [`PluginHost`] owns the plugin registry, spawns plugin executables,
//! serves the host side of the RPC contract and supervises every plugin for
//! its whole life:
//!
//! - one monitor task per plugin process turns unexpected exits into crashes
//! - one heartbeat sweep declares silent plugins crashed
//! - the restart policy restarts crashed plugins within their budget
//! - calls carrying a target plugin are relayed to that plugin
//!
//! ```no_run
//! # async fn demo() -> tether_core::Result<()> {
//! use tether_core::{HostConfig, PluginHost};
//!
//! let host = PluginHost::new(HostConfig::default());
//! host.start().await?;
//! let id = host.start_plugin_by_path("./plugins/echo").await?;
//! host.wait().await;
//! host.stop().await;
//! # let _ = id;
//! # Ok(())
//! # }
//! ```

pub mod builtins;
mod lifecycle;
mod service;
mod state;

use crate::cancel::CancellationToken;
use crate::config::HostConfig;
use crate::error::{Result, TetherError};
use crate::functions::{CallContext, Callable, FunctionTable};
use crate::ipc::IpcServer;
use crate::process::{CommandLauncher, PluginLauncher};
use crate::registry::{PluginRecord, PluginRegistry, PluginStatus};
use crate::rpc::{
    metadata, CallRequest, CallResponse, MessageRequest, MessageResponse, Metadata, Parameter,
    PluginClient, PluginDescriptor, StatusResponse,
};
use chrono::Utc;
use lifecycle::StartMode;
use service::HostService;
use state::{lock, HostState};
use std::future::Future;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::Path;
use std::sync::{Arc, Mutex};
use tokio::net::TcpListener;
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

/// Handle to a plugin host. Cheap to clone; all clones share one host.
#[derive(Clone)]
pub struct PluginHost {
    state: Arc<HostState>,
}

impl std::fmt::Debug for PluginHost {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PluginHost")
            .field("host_id", &self.state.host_id)
            .field("address", &self.state.address())
            .field("plugins", &self.state.registry.count())
            .finish()
    }
}

impl PluginHost {
    /// Create a host that runs plugins as child processes.
    pub fn new(config: HostConfig) -> Self {
        Self::with_launcher(config, Arc::new(CommandLauncher::new()))
    }

    /// Create a host with a custom process launcher.
    pub fn with_launcher(config: HostConfig, launcher: Arc<dyn PluginLauncher>) -> Self {
        let state = Arc::new_cyclic(|weak| {
            let functions = FunctionTable::new();
            builtins::register(&functions, weak.clone());
            HostState {
                config,
                host_id: format!("host-{}", uuid::Uuid::new_v4().simple()),
                registry: PluginRegistry::new(),
                functions,
                launcher,
                cancel: CancellationToken::new(),
                shutdown: CancellationToken::new(),
                started_at: Utc::now(),
                tasks: Mutex::new(JoinSet::new()),
                server: Mutex::new(None),
                address: Mutex::new(None),
            }
        });
        Self { state }
    }

    /// Bind the inbound server and start supervision.
    ///
    /// Binds `config.port` if set, otherwise the first free port of
    /// `config.port_range`. Returns the bound address.
    pub async fn start(&self) -> Result<SocketAddr> {
        let config = &self.state.config;
        config.validate()?;

        let (start, end) = config.port_candidates();
        let listener = IpcServer::bind_in_range(config.bind_address, start, end)
            .await
            .map_err(|e| {
                error!(
                    bind_address = %config.bind_address,
                    port_range = %format!("{}-{}", start, end),
                    "Failed to bind host server: {}",
                    e
                );
                e
            })?;
        self.start_on(listener)
    }

    /// Start the host on an already bound listener.
    pub fn start_on(&self, listener: TcpListener) -> Result<SocketAddr> {
        if self.state.cancel.is_cancelled() {
            return Err(TetherError::Cancelled);
        }
        let mut server = lock(&self.state.server);
        if server.is_some() {
            return Err(TetherError::Config {
                message: "host is already started".to_string(),
            });
        }

        let service = Arc::new(HostService::new(Arc::downgrade(&self.state)));
        let handle = IpcServer::start_on(listener, service)?;

        let mut address = handle.addr();
        if address.ip().is_unspecified() {
            address.set_ip(IpAddr::V4(Ipv4Addr::LOCALHOST));
        }
        *lock(&self.state.address) = Some(address);
        *server = Some(handle);
        drop(server);

        self.state
            .spawn_task(lifecycle::heartbeat_sweep(self.state.clone()));

        info!(
            host_id = %self.state.host_id,
            address = %address,
            "Plugin host started"
        );
        Ok(address)
    }

    /// Address plugins dial, once started.
    pub fn address(&self) -> Option<SocketAddr> {
        self.state.address()
    }

    /// Port the inbound server is bound to, once started.
    pub fn actual_port(&self) -> Option<u16> {
        self.address().map(|a| a.port())
    }

    pub fn host_id(&self) -> &str {
        &self.state.host_id
    }

    pub fn config(&self) -> &HostConfig {
        &self.state.config
    }

    pub fn registry(&self) -> &PluginRegistry {
        &self.state.registry
    }

    pub fn get_plugin(&self, id: &str) -> Option<PluginRecord> {
        self.state.registry.get(id)
    }

    pub fn list_plugins(&self) -> Vec<PluginRecord> {
        self.state.registry.list()
    }

    /// Run `path` in metadata query mode without loading it.
    pub async fn query_plugin_info(&self, path: impl AsRef<Path>) -> Result<PluginDescriptor> {
        self.state.launcher.query_info(path.as_ref()).await
    }

    /// Query a plugin's metadata and add a `stopped` record for it.
    ///
    /// Returns the plugin ID. A path that is already loaded returns its
    /// existing ID.
    pub async fn load_plugin(&self, path: impl AsRef<Path>) -> Result<String> {
        let path = path.as_ref();
        if let Some(existing) = self.state.registry.find_by_path(path) {
            debug!(plugin_id = %existing.id, path = %path.display(), "Plugin already loaded");
            return Ok(existing.id);
        }

        let mut descriptor = self.query_plugin_info(path).await.map_err(|e| {
            error!(path = %path.display(), "Failed to load plugin: {}", e);
            e
        })?;
        if descriptor.id.is_empty() {
            descriptor.id = format!("{}-{}", descriptor.name, Utc::now().timestamp());
        }
        if semver::Version::parse(&descriptor.version).is_err() {
            warn!(
                plugin_id = %descriptor.id,
                version = %descriptor.version,
                "Plugin version is not semver"
            );
        }

        let config = &self.state.config;
        let record = PluginRecord::from_descriptor(&descriptor, path)
            .with_restart_policy(config.auto_restart_plugin, config.max_restarts);

        if let Some(existing) = self.state.registry.register_new(record) {
            if existing.path == path {
                return Ok(existing.id);
            }
            return Err(TetherError::PluginAlreadyExists {
                id: existing.id,
                path: existing.path,
            });
        }

        info!(
            plugin_id = %descriptor.id,
            name = %descriptor.name,
            version = %descriptor.version,
            path = %path.display(),
            "Plugin loaded"
        );
        Ok(descriptor.id)
    }

    /// Spawn a loaded plugin. Resets its restart counter.
    pub async fn start_plugin(&self, id: &str) -> Result<()> {
        if !self.state.registry.contains(id) {
            return Err(TetherError::PluginNotFound { id: id.to_string() });
        }
        self.state.start_sequence(id, StartMode::Explicit).await
    }

    /// Load `path` if needed, then start it. Returns the plugin ID.
    pub async fn start_plugin_by_path(&self, path: impl AsRef<Path>) -> Result<String> {
        let id = self.load_plugin(path).await?;
        self.start_plugin(&id).await?;
        Ok(id)
    }

    pub async fn stop_plugin(&self, id: &str) -> Result<()> {
        self.state.stop_sequence(id).await
    }

    /// Stop every plugin concurrently. Failures are logged.
    pub async fn stop_all_plugins(&self) {
        let ids: Vec<String> = self.list_plugins().into_iter().map(|r| r.id).collect();
        let stops = ids.iter().map(|id| async move {
            if let Err(e) = self.stop_plugin(id).await {
                warn!(plugin_id = %id, "Failed to stop plugin: {}", e);
            }
        });
        futures::future::join_all(stops).await;
    }

    /// Stop a plugin and forget it.
    pub async fn unload_plugin(&self, id: &str) -> Result<PluginRecord> {
        self.stop_plugin(id).await?;
        self.state
            .registry
            .unregister(id)
            .ok_or_else(|| TetherError::PluginNotFound { id: id.to_string() })
    }

    /// Expose an async function to plugins under `name`.
    pub fn register_host_function<F, Fut>(&self, name: impl Into<String>, function: F)
    where
        F: Fn(CallContext, Vec<Parameter>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<Parameter>> + Send + 'static,
    {
        self.state.functions.register(name, function);
    }

    pub fn register_host_callable(&self, name: impl Into<String>, function: impl Callable + 'static) {
        self.state.functions.register_callable(name, function);
    }

    pub fn host_functions(&self) -> Vec<String> {
        self.state.functions.names()
    }

    /// Call `function` on a running plugin.
    pub async fn call_plugin_function(
        &self,
        id: &str,
        function: &str,
        parameters: Vec<Parameter>,
    ) -> Result<CallResponse> {
        self.call_plugin(id, CallRequest::new(function, parameters))
            .await
    }

    /// Send a prepared request to a running plugin.
    ///
    /// Fails if the plugin is unknown, not running or unreachable; otherwise
    /// returns the plugin's response as is.
    pub async fn call_plugin(&self, id: &str, mut request: CallRequest) -> Result<CallResponse> {
        let client = self.connected_client(id)?;
        request
            .metadata
            .entry(metadata::SOURCE.to_string())
            .or_insert_with(|| metadata::SOURCE_HOST.to_string());
        request
            .metadata
            .insert(metadata::TIMESTAMP.into(), Utc::now().timestamp().to_string());

        debug!(
            plugin_id = %id,
            function = %request.function_name,
            request_id = %request.request_id,
            "Calling plugin function"
        );
        client
            .call_function(&request, self.state.config.call_timeout)
            .await
    }

    /// Push one message to a running plugin.
    pub async fn send_message_to_plugin(
        &self,
        id: &str,
        message_type: &str,
        content: &str,
        metadata: Metadata,
    ) -> Result<MessageResponse> {
        let client = self.connected_client(id)?;
        let message = MessageRequest {
            metadata,
            ..MessageRequest::new(message_type, content)
        };
        client
            .send_messages(std::slice::from_ref(&message), self.state.config.message_timeout)
            .await
    }

    /// Push one message to every running plugin.
    pub async fn broadcast_message(
        &self,
        message_type: &str,
        content: &str,
        metadata: Metadata,
    ) -> Vec<(String, Result<MessageResponse>)> {
        let targets: Vec<String> = self
            .list_plugins()
            .into_iter()
            .filter(|r| r.is_callable())
            .map(|r| r.id)
            .collect();

        let sends = targets.into_iter().map(|id| {
            let metadata = metadata.clone();
            async move {
                let result = self
                    .send_message_to_plugin(&id, message_type, content, metadata)
                    .await;
                if let Err(e) = &result {
                    warn!(plugin_id = %id, "Broadcast delivery failed: {}", e);
                }
                (id, result)
            }
        });
        futures::future::join_all(sends).await
    }

    /// Ask a running plugin for its own status report.
    pub async fn get_plugin_status(&self, id: &str, include_metrics: bool) -> Result<StatusResponse> {
        self.connected_client(id)?.get_status(include_metrics).await
    }

    fn connected_client(&self, id: &str) -> Result<Arc<PluginClient>> {
        let record = self
            .state
            .registry
            .get(id)
            .ok_or_else(|| TetherError::PluginNotFound { id: id.to_string() })?;
        if record.status != PluginStatus::Running {
            return Err(TetherError::PluginNotRunning {
                id: id.to_string(),
                status: record.status,
            });
        }
        record
            .client
            .ok_or_else(|| TetherError::PluginNotConnected { id: id.to_string() })
    }

    /// Resolve on Ctrl-C or [`request_shutdown`](Self::request_shutdown).
    pub async fn wait(&self) {
        let ctrl_c = async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                warn!("Cannot listen for Ctrl-C: {}", e);
                std::future::pending::<()>().await;
            }
        };
        tokio::select! {
            _ = ctrl_c => info!("Interrupt received"),
            _ = self.state.shutdown.cancelled() => {}
        }
    }

    pub fn request_shutdown(&self) {
        self.state.shutdown.cancel();
    }

    /// Stop all plugins, the supervised tasks and the inbound server.
    pub async fn stop(&self) {
        if self.state.cancel.is_cancelled() {
            return;
        }
        info!(host_id = %self.state.host_id, "Stopping plugin host");

        self.stop_all_plugins().await;
        self.state.cancel.cancel();

        let mut tasks = std::mem::take(&mut *lock(&self.state.tasks));
        while let Some(result) = tasks.join_next().await {
            if let Err(e) = result {
                if e.is_panic() {
                    error!("Supervised task panicked: {}", e);
                }
            }
        }

        if let Some(mut server) = lock(&self.state.server).take() {
            server.shutdown();
        }
        self.state.shutdown.cancel();
        info!("Plugin host stopped");
    }

    #[cfg(test)]
    pub(crate) fn state(&self) -> &Arc<HostState> {
        &self.state
    }
}
