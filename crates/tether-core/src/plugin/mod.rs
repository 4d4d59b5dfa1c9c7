//! Plugin runtime.
//!
//! A [`Plugin`] is the subordinate side of the framework. It serves its
//! registered functions and message handlers on an ephemeral loopback port,
//! registers with the host named in its launch environment, keeps the link
//! alive with heartbeats and reconnects on its own when the host goes away.
//!
//! A plugin executable usually ends with [`Plugin::run_cli`], which also
//! answers the host's metadata query:
//!
//! ```no_run
//! use tether_core::{Parameter, Plugin, PluginConfig};
//!
//! #[tokio::main]
//! async fn main() -> std::process::ExitCode {
//!     let plugin = Plugin::new(PluginConfig::new("Echo", "1.0.0", "Echoes text"));
//!     plugin.register_function("Echo", |_ctx, params: Vec<Parameter>| async move {
//!         let text = params.into_iter().next().unwrap_or_default().value;
//!         Ok(Parameter::string("echo", text))
//!     });
//!     plugin.run_cli().await
//! }
//! ```

mod link;
mod service;
mod state;

pub use state::MessageHandler;

use crate::cancel::CancellationToken;
use crate::config::{EnvConfig, PluginConfig, TimeoutConfig};
use crate::error::{Result, TetherError};
use crate::functions::{CallContext, Callable, FunctionTable};
use crate::ipc::IpcServer;
use crate::registry::PluginStatus;
use crate::rpc::{
    metadata, CallRequest, CallResponse, HostClient, LogLevel, LogRequest, MessageRequest,
    Parameter, PluginDescriptor,
};
use chrono::Utc;
use service::PluginService;
use state::{lock, write_handlers, MessageHandlers, PluginState};
use std::future::Future;
use std::io::Write;
use std::process::ExitCode;
use std::sync::atomic::AtomicU64;
use std::sync::{Arc, Mutex, RwLock};
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

/// Values the host injects into a plugin process it launches.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PluginEnvironment {
    pub plugin_id: Option<String>,
    pub host_address: Option<String>,
    pub launch_token: Option<String>,
}

impl PluginEnvironment {
    /// Read the launch contract variables. Empty values count as absent.
    pub fn from_env() -> Self {
        let var = |name: &str| std::env::var(name).ok().filter(|v| !v.is_empty());
        Self {
            plugin_id: var(EnvConfig::PLUGIN_ID),
            host_address: var(EnvConfig::HOST_ADDRESS),
            launch_token: var(EnvConfig::LAUNCH_TOKEN),
        }
    }
}

/// Handle to a plugin runtime. Cheap to clone; all clones share one plugin.
#[derive(Clone)]
pub struct Plugin {
    state: Arc<PluginState>,
}

/// Non-owning handle for functions that call back into their own plugin.
#[derive(Clone, Debug)]
pub struct WeakPlugin {
    state: std::sync::Weak<PluginState>,
}

impl WeakPlugin {
    pub fn upgrade(&self) -> Option<Plugin> {
        self.state.upgrade().map(|state| Plugin { state })
    }
}

impl std::fmt::Debug for Plugin {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Plugin")
            .field("id", &self.state.id)
            .field("host_address", &self.state.host_address)
            .field("status", &self.state.status())
            .finish()
    }
}

impl Plugin {
    /// Create a plugin configured from its launch environment.
    pub fn new(config: PluginConfig) -> Self {
        Self::with_environment(config, PluginEnvironment::from_env())
    }

    /// Create a plugin with an explicit launch environment.
    ///
    /// The ID is the environment's, else `config.id`, else `name-unixtime`.
    /// The host address falls back to `config.host_address`.
    pub fn with_environment(config: PluginConfig, env: PluginEnvironment) -> Self {
        let id = env
            .plugin_id
            .or_else(|| config.id.clone().filter(|id| !id.is_empty()))
            .unwrap_or_else(|| format!("{}-{}", config.name, Utc::now().timestamp()));
        let host_address = env
            .host_address
            .unwrap_or_else(|| config.host_address.clone());

        let state = PluginState {
            id,
            host_address,
            launch_token: env.launch_token,
            config,
            functions: FunctionTable::new(),
            handlers: RwLock::new(MessageHandlers::default()),
            status: Mutex::new(PluginStatus::Stopped),
            started_at: Mutex::new(None),
            port: Mutex::new(None),
            host: Mutex::new(None),
            calls_served: AtomicU64::new(0),
            messages_processed: AtomicU64::new(0),
            cancel: CancellationToken::new(),
            shutdown: CancellationToken::new(),
            tasks: Mutex::new(JoinSet::new()),
            server: Mutex::new(None),
        };
        Self {
            state: Arc::new(state),
        }
    }

    pub fn id(&self) -> &str {
        &self.state.id
    }

    pub fn downgrade(&self) -> WeakPlugin {
        WeakPlugin {
            state: Arc::downgrade(&self.state),
        }
    }

    pub fn config(&self) -> &PluginConfig {
        &self.state.config
    }

    pub fn host_address(&self) -> &str {
        &self.state.host_address
    }

    pub fn status(&self) -> PluginStatus {
        self.state.status()
    }

    /// Port of the inbound server, once started.
    pub fn port(&self) -> Option<u16> {
        *lock(&self.state.port)
    }

    /// Serve an async function under `name`, replacing any previous entry.
    pub fn register_function<F, Fut>(&self, name: impl Into<String>, function: F)
    where
        F: Fn(CallContext, Vec<Parameter>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<Parameter>> + Send + 'static,
    {
        self.state.functions.register(name, function);
    }

    pub fn register_callable(&self, name: impl Into<String>, function: impl Callable + 'static) {
        self.state.functions.register_callable(name, function);
    }

    /// Handle pushed messages of `message_type`.
    pub fn on_message<F, Fut>(&self, message_type: impl Into<String>, handler: F)
    where
        F: Fn(MessageRequest) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        self.on_message_handler(message_type, handler);
    }

    pub fn on_message_handler(&self, message_type: impl Into<String>, handler: impl MessageHandler + 'static) {
        write_handlers(&self.state.handlers).insert(message_type.into(), Arc::new(handler));
    }

    /// Handle pushed messages no type-specific handler claims.
    pub fn on_any_message<F, Fut>(&self, handler: F)
    where
        F: Fn(MessageRequest) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        write_handlers(&self.state.handlers).set_fallback(Arc::new(handler));
    }

    /// Static metadata printed in metadata query mode.
    pub fn descriptor(&self) -> PluginDescriptor {
        let config = &self.state.config;
        PluginDescriptor {
            id: self.state.id.clone(),
            name: config.name.clone(),
            version: config.version.clone(),
            description: config.description.clone(),
            logo: config.logo.clone().unwrap_or_default(),
            capabilities: config.capabilities.clone(),
            functions: self.state.functions.names(),
        }
    }

    /// Write the descriptor as one line of JSON.
    pub fn write_info(&self, mut out: impl Write) -> Result<()> {
        serde_json::to_writer(&mut out, &self.descriptor())?;
        writeln!(out)?;
        out.flush()?;
        Ok(())
    }

    /// Start serving and register with the host.
    ///
    /// A plugin starts once; after [`stop`](Self::stop) create a new one.
    pub async fn start(&self) -> Result<()> {
        let state = &self.state;
        if state.cancel.is_cancelled() {
            return Err(TetherError::Cancelled);
        }
        {
            let mut status = lock(&state.status);
            if status.is_active() {
                return Err(TetherError::PluginAlreadyRunning {
                    id: state.id.clone(),
                });
            }
            *status = PluginStatus::Starting;
        }

        let service = Arc::new(PluginService::new(Arc::downgrade(state)));
        let server = match IpcServer::start(service).await {
            Ok(server) => server,
            Err(e) => {
                state.set_status(PluginStatus::Error);
                return Err(e);
            }
        };
        let port = server.port;
        *lock(&state.port) = Some(port);
        *lock(&state.server) = Some(server);

        let client = match link::register(state, port).await {
            Ok(client) => client,
            Err(e) => {
                error!(
                    plugin_id = %state.id,
                    host = %state.host_address,
                    "Failed to register with host: {}",
                    e
                );
                if let Some(mut server) = lock(&state.server).take() {
                    server.shutdown();
                }
                *lock(&state.port) = None;
                state.set_status(PluginStatus::Error);
                return Err(e);
            }
        };

        state.set_host_client(Some(Arc::new(client)));
        *lock(&state.started_at) = Some(Utc::now());
        state.set_status(PluginStatus::Running);

        state.spawn_task(link::heartbeat_loop(state.clone()));
        state.spawn_task(link::link_monitor(state.clone()));

        info!(plugin_id = %state.id, port, "Plugin started");
        Ok(())
    }

    /// Stop serving, end the background loops and wait for them.
    pub async fn stop(&self) {
        let state = &self.state;
        state.begin_shutdown("stop requested");

        let mut tasks = std::mem::take(&mut *lock(&state.tasks));
        while let Some(result) = tasks.join_next().await {
            if let Err(e) = result {
                if e.is_panic() {
                    error!(plugin_id = %state.id, "Background task panicked: {}", e);
                }
            }
        }

        state.set_host_client(None);
        *lock(&state.port) = None;
        state.set_status(PluginStatus::Stopped);
        info!(plugin_id = %state.id, "Plugin stopped");
    }

    /// Resolve once the plugin begins shutting down, by [`stop`](Self::stop),
    /// a host `Shutdown` request or an unreachable host.
    pub async fn wait_for_shutdown(&self) {
        self.state.shutdown.cancelled().await;
    }

    /// Start, wait for Ctrl-C or an internal shutdown, then stop.
    pub async fn run(&self) -> Result<()> {
        self.start().await?;

        let ctrl_c = async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                warn!("Cannot listen for Ctrl-C: {}", e);
                std::future::pending::<()>().await;
            }
        };
        tokio::select! {
            _ = ctrl_c => info!(plugin_id = %self.state.id, "Interrupt received"),
            _ = self.wait_for_shutdown() => {}
        }

        self.stop().await;
        Ok(())
    }

    /// Entry point for plugin executables.
    ///
    /// With the metadata flag on the command line, prints the descriptor and
    /// exits without opening a listener. Otherwise runs until shutdown.
    pub async fn run_cli(&self) -> ExitCode {
        if std::env::args().skip(1).any(|arg| arg == EnvConfig::INFO_FLAG) {
            return match self.write_info(std::io::stdout().lock()) {
                Ok(()) => ExitCode::SUCCESS,
                Err(e) => {
                    error!("Failed to write plugin info: {}", e);
                    ExitCode::FAILURE
                }
            };
        }

        match self.run().await {
            Ok(()) => ExitCode::SUCCESS,
            Err(e) => {
                error!(plugin_id = %self.state.id, "Plugin failed: {}", e);
                ExitCode::FAILURE
            }
        }
    }

    fn host(&self) -> Result<Arc<HostClient>> {
        self.state
            .host_client()
            .ok_or_else(|| TetherError::ConnectionLost {
                addr: self.state.host_address.clone(),
            })
    }

    fn outbound_request(&self, function: &str, parameters: Vec<Parameter>) -> CallRequest {
        CallRequest::new(function, parameters)
            .with_metadata(metadata::PLUGIN_ID, self.state.id.clone())
            .with_metadata(metadata::SOURCE, metadata::SOURCE_PLUGIN_VALUE)
    }

    /// Call a function the host exposes.
    pub async fn call_host_function(
        &self,
        function: &str,
        parameters: Vec<Parameter>,
    ) -> Result<CallResponse> {
        let request = self.outbound_request(function, parameters);
        debug!(plugin_id = %self.state.id, function, "Calling host function");
        self.host()?
            .call_host_function(&request, self.state.config.call_timeout)
            .await
    }

    /// Call a function on another plugin, relayed by the host.
    pub async fn call_other_plugin(
        &self,
        target_plugin_id: &str,
        function: &str,
        parameters: Vec<Parameter>,
    ) -> Result<CallResponse> {
        let relay_timeout = self.state.config.call_timeout;
        let request = self
            .outbound_request(function, parameters)
            .with_metadata(metadata::TARGET_PLUGIN_ID, target_plugin_id)
            .with_metadata(metadata::CALL_TYPE, metadata::INTER_PLUGIN)
            .with_metadata(
                metadata::RELAY_TIMEOUT_MS,
                relay_timeout.as_millis().to_string(),
            );
        debug!(
            plugin_id = %self.state.id,
            target_plugin = target_plugin_id,
            function,
            "Calling other plugin"
        );
        self.host()?
            .call_host_function(&request, relay_timeout + TimeoutConfig::RELAY_MARGIN)
            .await
    }

    /// Forward a log line to the host's log.
    pub async fn report_log(&self, level: LogLevel, message: impl Into<String>) -> Result<()> {
        let request = LogRequest {
            plugin_id: self.state.id.clone(),
            level,
            timestamp: Utc::now().timestamp(),
            message: message.into(),
        };
        self.host()?.report_log(&request).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ipc::{IpcDispatch, IpcStream};
    use crate::rpc::{methods, MessageResponse, PluginClient, ShutdownResponse, StatusResponse};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    fn plugin(env: PluginEnvironment) -> Plugin {
        Plugin::with_environment(
            PluginConfig::new("Sample", "1.2.3", "Test plugin").with_capabilities(["text"]),
            env,
        )
    }

    /// Serve the plugin's service without a host.
    async fn serve(plugin: &Plugin) -> (crate::ipc::IpcServerHandle, PluginClient) {
        let service = Arc::new(PluginService::new(Arc::downgrade(&plugin.state)));
        let server = IpcServer::start(service).await.unwrap();
        let client = PluginClient::connect(&server.addr().to_string()).await.unwrap();
        (server, client)
    }

    #[test]
    fn test_id_resolution_order() {
        let from_env = plugin(PluginEnvironment {
            plugin_id: Some("assigned".into()),
            ..Default::default()
        });
        assert_eq!(from_env.id(), "assigned");

        let from_config = Plugin::with_environment(
            PluginConfig::new("Sample", "1.0.0", "").with_id("fixed"),
            PluginEnvironment::default(),
        );
        assert_eq!(from_config.id(), "fixed");

        let generated = plugin(PluginEnvironment::default());
        assert!(generated.id().starts_with("Sample-"));
        assert_eq!(generated.host_address(), "127.0.0.1:50051");
    }

    #[test]
    fn test_write_info_single_json_line() {
        let plugin = plugin(PluginEnvironment {
            plugin_id: Some("sample".into()),
            ..Default::default()
        });
        plugin.register_function("Echo", |_ctx, params: Vec<Parameter>| async move {
            Ok(params.into_iter().next().unwrap_or_default())
        });

        let mut out = Vec::new();
        plugin.write_info(&mut out).unwrap();
        let text = String::from_utf8(out).unwrap();
        assert_eq!(text.lines().count(), 1);

        let descriptor: PluginDescriptor = serde_json::from_str(text.trim()).unwrap();
        assert_eq!(descriptor.id, "sample");
        assert_eq!(descriptor.version, "1.2.3");
        assert_eq!(descriptor.capabilities, vec!["text"]);
        assert_eq!(descriptor.functions, vec!["Echo"]);
        assert_eq!(plugin.port(), None);
    }

    #[tokio::test]
    async fn test_service_invokes_registered_function() {
        let plugin = plugin(PluginEnvironment::default());
        plugin.register_function("Upper", |_ctx, params: Vec<Parameter>| async move {
            let text = params.into_iter().next().unwrap_or_default().value;
            Ok(Parameter::string("upper", text.to_uppercase()))
        });
        let (_server, client) = serve(&plugin).await;

        let request = CallRequest::new("Upper", vec![Parameter::string("a", "x")]);
        let response = client
            .call_function(&request, Duration::from_secs(5))
            .await
            .unwrap();
        assert!(response.success);
        assert_eq!(response.request_id, request.request_id);
        assert_eq!(response.value(), Some("X"));

        let response = client
            .call_function(&CallRequest::new("Missing", vec![]), Duration::from_secs(5))
            .await
            .unwrap();
        assert_eq!(response.error_code, crate::rpc::error_codes::FUNCTION_NOT_FOUND);
    }

    #[tokio::test]
    async fn test_message_stream_dispatches_by_type() {
        let plugin = plugin(PluginEnvironment::default());
        let notifications = Arc::new(AtomicUsize::new(0));
        let others = Arc::new(AtomicUsize::new(0));
        {
            let notifications = notifications.clone();
            plugin.on_message("notification", move |_message: MessageRequest| {
                let notifications = notifications.clone();
                async move {
                    notifications.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                }
            });
            let others = others.clone();
            plugin.on_any_message(move |_message: MessageRequest| {
                let others = others.clone();
                async move {
                    others.fetch_add(1, Ordering::SeqCst);
                    anyhow::bail!("not interested")
                }
            });
        }
        let (_server, client) = serve(&plugin).await;

        let messages = vec![
            MessageRequest::new("notification", "a"),
            MessageRequest::new("data", "b"),
            MessageRequest::new("notification", "c"),
        ];
        let response: MessageResponse = client
            .send_messages(&messages, Duration::from_secs(5))
            .await
            .unwrap();
        assert!(response.success);
        assert_eq!(response.processed_count, 3);
        assert_eq!(notifications.load(Ordering::SeqCst), 2);
        assert_eq!(others.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_empty_message_stream() {
        let plugin = plugin(PluginEnvironment::default());
        let (server, _client) = serve(&plugin).await;

        let stream = IpcStream::open(
            &server.addr().to_string(),
            methods::RECEIVE_MESSAGES,
            serde_json::json!({}),
            Duration::from_secs(5),
        )
        .await
        .unwrap();
        let value = stream.finish(Duration::from_secs(5)).await.unwrap();
        let response: MessageResponse = serde_json::from_value(value).unwrap();
        assert_eq!(response.processed_count, 0);
    }

    #[tokio::test]
    async fn test_status_and_shutdown() {
        let plugin = plugin(PluginEnvironment::default());
        plugin.register_function("Noop", |_ctx, _params: Vec<Parameter>| async move {
            Ok(Parameter::default())
        });
        let (_server, client) = serve(&plugin).await;

        let status: StatusResponse = client.get_status(true).await.unwrap();
        assert_eq!(status.status, PluginStatus::Stopped);
        assert_eq!(status.active_functions, vec!["Noop"]);
        assert_eq!(status.metrics.get("calls_served").map(String::as_str), Some("0"));

        let response: ShutdownResponse = client.shutdown("test").await.unwrap();
        assert!(response.success);
        tokio::time::timeout(Duration::from_secs(5), plugin.wait_for_shutdown())
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_start_without_host_fails() {
        // Reserve a port and release it so nothing listens there
        let address = {
            let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
            listener.local_addr().unwrap().to_string()
        };
        let plugin = plugin(PluginEnvironment {
            host_address: Some(address),
            ..Default::default()
        });

        assert!(plugin.start().await.is_err());
        assert_eq!(plugin.status(), PluginStatus::Error);
        assert_eq!(plugin.port(), None);
        assert!(plugin.call_host_function("GetSystemTime", vec![]).await.is_err());
    }

    struct RejectingHost;

    #[async_trait::async_trait]
    impl IpcDispatch for RejectingHost {
        async fn dispatch(&self, method: &str, _params: serde_json::Value) -> Result<serde_json::Value> {
            assert_eq!(method, methods::REGISTER_PLUGIN);
            Ok(serde_json::json!({"success": false, "message": "go away", "host_id": "h"}))
        }
    }

    #[tokio::test]
    async fn test_rejected_registration_is_an_error() {
        let host = IpcServer::start(Arc::new(RejectingHost)).await.unwrap();
        let plugin = plugin(PluginEnvironment {
            host_address: Some(host.addr().to_string()),
            ..Default::default()
        });

        let err = plugin.start().await.unwrap_err();
        assert!(matches!(err, TetherError::RegistrationRejected { .. }));
    }
}
