//! The plugin's inbound RPC service.

use super::state::{read_handlers, PluginState};
use crate::config::TimeoutConfig;
use crate::error::{Result, TetherError};
use crate::ipc::IpcDispatch;
use crate::rpc::{
    methods, CallRequest, MessageRequest, MessageResponse, ShutdownRequest, ShutdownResponse,
    StatusRequest, StatusResponse,
};
use std::collections::HashMap;
use std::sync::atomic::Ordering;
use std::sync::{Arc, Weak};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

pub(crate) struct PluginService {
    state: Weak<PluginState>,
}

impl PluginService {
    pub(crate) fn new(state: Weak<PluginState>) -> Self {
        Self { state }
    }

    fn state(&self) -> Result<Arc<PluginState>> {
        self.state
            .upgrade()
            .ok_or_else(|| TetherError::Other("plugin is shut down".to_string()))
    }
}

#[async_trait::async_trait]
impl IpcDispatch for PluginService {
    async fn dispatch(&self, method: &str, params: serde_json::Value) -> Result<serde_json::Value> {
        let state = self.state()?;
        match method {
            methods::CALL_PLUGIN_FUNCTION => {
                let request: CallRequest = serde_json::from_value(params)?;
                debug!(
                    function = %request.function_name,
                    request_id = %request.request_id,
                    "Plugin function call"
                );
                state.calls_served.fetch_add(1, Ordering::Relaxed);
                let response = state.functions.invoke(request, state.cancel.clone()).await;
                Ok(serde_json::to_value(response)?)
            }
            methods::GET_PLUGIN_STATUS => {
                let request: StatusRequest = serde_json::from_value(params)?;
                Ok(serde_json::to_value(status_report(&state, request.include_metrics))?)
            }
            methods::SHUTDOWN => {
                let request: ShutdownRequest = serde_json::from_value(params)?;
                info!(plugin_id = %state.id, reason = %request.reason, "Shutdown requested by host");
                // Delayed so this response is written before the server closes
                let weak = Arc::downgrade(&state);
                tokio::spawn(async move {
                    tokio::time::sleep(TimeoutConfig::SHUTDOWN_GRACE).await;
                    if let Some(state) = weak.upgrade() {
                        state.begin_shutdown("requested by host");
                    }
                });
                Ok(serde_json::to_value(ShutdownResponse {
                    success: true,
                    message: "shutting down".to_string(),
                })?)
            }
            _ => Err(TetherError::MethodNotFound {
                method: method.to_string(),
            }),
        }
    }

    fn accepts_stream(&self, method: &str) -> bool {
        method == methods::RECEIVE_MESSAGES
    }

    async fn dispatch_stream(
        &self,
        method: &str,
        _params: serde_json::Value,
        mut items: mpsc::Receiver<serde_json::Value>,
    ) -> Result<serde_json::Value> {
        if method != methods::RECEIVE_MESSAGES {
            return Err(TetherError::MethodNotFound {
                method: method.to_string(),
            });
        }
        let state = self.state()?;

        let mut processed: u64 = 0;
        while let Some(item) = items.recv().await {
            let message: MessageRequest = match serde_json::from_value(item) {
                Ok(message) => message,
                Err(e) => {
                    warn!(plugin_id = %state.id, "Skipping malformed message: {}", e);
                    continue;
                }
            };
            processed += 1;
            deliver(&state, message).await;
        }

        state
            .messages_processed
            .fetch_add(processed, Ordering::Relaxed);
        Ok(serde_json::to_value(MessageResponse {
            success: true,
            message: format!("processed {} messages", processed),
            processed_count: processed,
        })?)
    }
}

async fn deliver(state: &PluginState, message: MessageRequest) {
    let handler = read_handlers(&state.handlers).resolve(&message.message_type);
    let Some(handler) = handler else {
        debug!(
            plugin_id = %state.id,
            message_type = %message.message_type,
            "No handler for message"
        );
        return;
    };

    let message_id = message.message_id.clone();
    if let Err(e) = handler.handle(message).await {
        warn!(plugin_id = %state.id, message_id = %message_id, "Message handler failed: {:#}", e);
    }
}

fn status_report(state: &PluginState, include_metrics: bool) -> StatusResponse {
    let mut metrics = HashMap::new();
    if include_metrics {
        metrics.insert(
            "calls_served".to_string(),
            state.calls_served.load(Ordering::Relaxed).to_string(),
        );
        metrics.insert(
            "messages_processed".to_string(),
            state.messages_processed.load(Ordering::Relaxed).to_string(),
        );
        metrics.insert(
            "host_connected".to_string(),
            state
                .host_client()
                .map(|c| !c.is_closed())
                .unwrap_or(false)
                .to_string(),
        );
    }

    StatusResponse {
        status: state.status(),
        uptime: state.uptime_secs(),
        active_functions: state.functions.names(),
        metrics,
    }
}
