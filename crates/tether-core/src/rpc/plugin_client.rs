use super::methods;
use super::types::{
    CallRequest, CallResponse, MessageRequest, MessageResponse, ShutdownRequest,
    ShutdownResponse, StatusRequest, StatusResponse,
};
use crate::config::TimeoutConfig;
use crate::ipc::{IpcClient, IpcStream};
use crate::{Result, TetherError};
use std::time::Duration;

/// Host-side connection to one plugin's inbound server.
#[derive(Debug)]
pub struct PluginClient {
    inner: IpcClient,
    address: String,
}

impl PluginClient {
    /// Dial a plugin at `address` (`host:port`).
    pub async fn connect(address: &str) -> Result<Self> {
        let inner = IpcClient::connect(address, TimeoutConfig::CONNECT).await?;
        Ok(Self {
            inner,
            address: address.to_string(),
        })
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    pub fn is_closed(&self) -> bool {
        self.inner.is_closed()
    }

    pub async fn call_function(
        &self,
        request: &CallRequest,
        timeout: Duration,
    ) -> Result<CallResponse> {
        self.inner
            .request(methods::CALL_PLUGIN_FUNCTION, request, timeout)
            .await
    }

    /// Deliver messages over one stream and return the plugin's acknowledgement.
    ///
    /// `timeout` bounds the whole exchange, from connecting to the reply.
    pub async fn send_messages(
        &self,
        messages: &[MessageRequest],
        timeout: Duration,
    ) -> Result<MessageResponse> {
        let exchange = async {
            let mut stream = IpcStream::open(
                &self.address,
                methods::RECEIVE_MESSAGES,
                serde_json::json!({}),
                TimeoutConfig::CONNECT,
            )
            .await?;
            for message in messages {
                stream.send(message).await?;
            }
            let value = stream.finish(timeout).await?;
            Ok::<_, TetherError>(serde_json::from_value(value)?)
        };

        tokio::time::timeout(timeout, exchange)
            .await
            .map_err(|_| TetherError::Timeout(timeout))?
    }

    pub async fn get_status(&self, include_metrics: bool) -> Result<StatusResponse> {
        self.inner
            .request(
                methods::GET_PLUGIN_STATUS,
                &StatusRequest { include_metrics },
                TimeoutConfig::HEARTBEAT,
            )
            .await
    }

    pub async fn shutdown(&self, reason: &str) -> Result<ShutdownResponse> {
        self.inner
            .request(
                methods::SHUTDOWN,
                &ShutdownRequest {
                    reason: reason.to_string(),
                },
                TimeoutConfig::HEARTBEAT,
            )
            .await
    }
}
