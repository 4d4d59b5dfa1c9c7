//! The host's inbound RPC service: registration, heartbeats, host function
//! calls, inter-plugin relay and log forwarding.

use super::state::HostState;
use crate::error::{Result, TetherError};
use crate::ipc::IpcDispatch;
use crate::registry::PluginStatus;
use crate::rpc::{
    error_codes, metadata, methods, CallRequest, CallResponse, HeartbeatRequest,
    HeartbeatResponse, LogLevel, LogRequest, LogResponse, Metadata, RegisterRequest,
    RegisterResponse,
};
use chrono::Utc;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tracing::{debug, error, info, warn};

/// IPC dispatch for the host's inbound server.
///
/// Holds the host weakly so a forgotten server never keeps it alive.
pub(crate) struct HostService {
    state: Weak<HostState>,
}

impl HostService {
    pub(crate) fn new(state: Weak<HostState>) -> Self {
        Self { state }
    }
}

#[async_trait::async_trait]
impl IpcDispatch for HostService {
    async fn dispatch(&self, method: &str, params: serde_json::Value) -> Result<serde_json::Value> {
        let state = self
            .state
            .upgrade()
            .ok_or_else(|| TetherError::Other("host is shut down".to_string()))?;

        match method {
            methods::REGISTER_PLUGIN => {
                let request: RegisterRequest = serde_json::from_value(params)?;
                Ok(serde_json::to_value(state.handle_register(request))?)
            }
            methods::HEARTBEAT => {
                let request: HeartbeatRequest = serde_json::from_value(params)?;
                Ok(serde_json::to_value(state.handle_heartbeat(&request))?)
            }
            methods::CALL_HOST_FUNCTION => {
                let request: CallRequest = serde_json::from_value(params)?;
                Ok(serde_json::to_value(state.handle_call(request).await)?)
            }
            methods::REPORT_LOG => {
                let request: LogRequest = serde_json::from_value(params)?;
                Ok(serde_json::to_value(handle_log(&request))?)
            }
            _ => Err(TetherError::MethodNotFound {
                method: method.to_string(),
            }),
        }
    }
}

impl HostState {
    /// Match a registration to its record and schedule the connect-back.
    pub(crate) fn handle_register(self: &Arc<Self>, request: RegisterRequest) -> RegisterResponse {
        let reject = |message: String| {
            warn!(plugin_id = %request.plugin_id, "Rejected registration: {}", message);
            RegisterResponse {
                success: false,
                message,
                host_id: self.host_id.clone(),
            }
        };

        if request.plugin_id.is_empty() {
            return reject("plugin_id is required".to_string());
        }
        if request.port == 0 {
            return reject("plugin must report its listening port".to_string());
        }

        let token = request.launch_token.clone().filter(|t| !t.is_empty());
        let id = match &token {
            Some(token) => {
                match self
                    .registry
                    .find(|r| r.launch_token.as_deref() == Some(token.as_str()))
                {
                    Some(record) => record.id,
                    None => return reject("unknown launch token".to_string()),
                }
            }
            None => request.plugin_id.clone(),
        };
        if id != request.plugin_id {
            return reject(format!("launch token belongs to plugin {}", id));
        }

        let reconnect_allowed = self.config.enable_plugin_reconnect;
        let outcome = self.registry.update(&id, |r| {
            if r.launch_token != token {
                return Err("launch token does not match the current launch".to_string());
            }
            match r.status {
                PluginStatus::Starting => {}
                PluginStatus::Running if reconnect_allowed => {}
                PluginStatus::Running => {
                    return Err("plugin is already running and reconnect is disabled".to_string())
                }
                other => return Err(format!("plugin is {}", other)),
            }
            r.name = request.plugin_name.clone();
            r.version = request.version.clone();
            r.description = request.description.clone();
            r.capabilities = request.capabilities.clone();
            if !request.functions.is_empty() {
                r.functions = request.functions.clone();
            }
            r.port = request.port;
            r.last_heartbeat = Some(Utc::now());
            Ok(r.status)
        });

        let status = match outcome {
            None => return reject(format!("plugin {} is not loaded", id)),
            Some(Err(message)) => return reject(message),
            Some(Ok(status)) => status,
        };

        info!(
            plugin_id = %id,
            port = request.port,
            reconnect = status == PluginStatus::Running,
            "Plugin registered"
        );

        let state = self.clone();
        let port = request.port;
        self.spawn_task(async move { state.connect_back(id, token, port).await });

        RegisterResponse {
            success: true,
            message: "registered".to_string(),
            host_id: self.host_id.clone(),
        }
    }

    pub(crate) fn handle_heartbeat(&self, request: &HeartbeatRequest) -> HeartbeatResponse {
        let outcome = self.registry.update(&request.plugin_id, |r| {
            if r.status.is_active() {
                r.last_heartbeat = Some(Utc::now());
                Ok(())
            } else {
                Err(r.status)
            }
        });

        let (success, message) = match outcome {
            Some(Ok(())) => (true, "ok".to_string()),
            Some(Err(status)) => (false, format!("plugin is {}", status)),
            None => (false, format!("plugin {} is not registered", request.plugin_id)),
        };
        if !success {
            debug!(plugin_id = %request.plugin_id, "Heartbeat refused: {}", message);
        }

        HeartbeatResponse {
            success,
            message,
            server_timestamp: Utc::now().timestamp(),
        }
    }

    /// Run a host function, or relay the call when it names a target plugin.
    pub(crate) async fn handle_call(&self, request: CallRequest) -> CallResponse {
        if let Some(target) = request.target_plugin_id().map(str::to_owned) {
            return self.relay_call(request, &target).await;
        }

        debug!(
            function = %request.function_name,
            request_id = %request.request_id,
            "Host function call"
        );
        self.functions.invoke(request, self.cancel.clone()).await
    }

    async fn relay_call(&self, mut request: CallRequest, target: &str) -> CallResponse {
        let source = request
            .metadata
            .get(metadata::PLUGIN_ID)
            .cloned()
            .unwrap_or_else(|| "unknown".to_string());

        let Some(record) = self.registry.get(target) else {
            return CallResponse::failure(
                request.request_id,
                error_codes::TARGET_PLUGIN_NOT_FOUND,
                format!("target plugin {} does not exist", target),
            );
        };

        let client = match (&record.status, &record.client) {
            (PluginStatus::Running, Some(client)) => client.clone(),
            _ => {
                return CallResponse::failure(
                    request.request_id,
                    error_codes::TARGET_PLUGIN_NOT_RUNNING,
                    format!("target plugin {} is not running (status: {})", target, record.status),
                )
            }
        };

        let deadline = relay_deadline(&request.metadata, self.config.call_timeout);
        request.metadata.remove(metadata::TARGET_PLUGIN_ID);
        request.metadata.remove(metadata::RELAY_TIMEOUT_MS);
        request
            .metadata
            .insert(metadata::SOURCE.into(), metadata::INTER_PLUGIN.into());
        request
            .metadata
            .insert(metadata::SOURCE_PLUGIN.into(), source.clone());
        request
            .metadata
            .insert(metadata::TARGET_PLUGIN.into(), target.to_string());
        request
            .metadata
            .insert(metadata::TIMESTAMP.into(), Utc::now().timestamp().to_string());
        request
            .metadata
            .insert(metadata::VIA_HOST.into(), "true".into());

        debug!(
            source_plugin = %source,
            target_plugin = %target,
            function = %request.function_name,
            "Relaying inter-plugin call"
        );

        match client.call_function(&request, deadline).await {
            Ok(response) => response,
            Err(e) => {
                warn!(source_plugin = %source, target_plugin = %target, "Relay failed: {}", e);
                CallResponse::failure(
                    request.request_id,
                    error_codes::INTER_PLUGIN_CALL_ERROR,
                    format!("call to plugin {} failed: {}", target, e),
                )
            }
        }
    }
}

/// Deadline for a relayed call: the caller's requested budget, capped at
/// the host's own call timeout.
fn relay_deadline(meta: &Metadata, limit: Duration) -> Duration {
    meta.get(metadata::RELAY_TIMEOUT_MS)
        .and_then(|ms| ms.trim().parse::<u64>().ok())
        .filter(|ms| *ms > 0)
        .map_or(limit, |ms| Duration::from_millis(ms).min(limit))
}

/// Re-emit a plugin's log line through the host's subscriber.
fn handle_log(request: &LogRequest) -> LogResponse {
    let plugin_id = request.plugin_id.as_str();
    match request.level {
        LogLevel::Debug => debug!(plugin_id, "{}", request.message),
        LogLevel::Info => info!(plugin_id, "{}", request.message),
        LogLevel::Warn => warn!(plugin_id, "{}", request.message),
        LogLevel::Error => error!(plugin_id, "{}", request.message),
    }
    LogResponse { success: true }
}
