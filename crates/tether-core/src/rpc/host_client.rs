use super::methods;
use super::types::{
    CallRequest, CallResponse, HeartbeatRequest, HeartbeatResponse, LogRequest, LogResponse,
    RegisterRequest, RegisterResponse,
};
use crate::config::TimeoutConfig;
use crate::ipc::IpcClient;
use crate::Result;
use std::time::Duration;

/// Plugin-side connection to the host's inbound server.
#[derive(Debug)]
pub struct HostClient {
    inner: IpcClient,
    address: String,
}

impl HostClient {
    /// Dial the host at `address` (`host:port`).
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

    pub async fn register(&self, request: &RegisterRequest) -> Result<RegisterResponse> {
        self.inner
            .request(methods::REGISTER_PLUGIN, request, TimeoutConfig::REGISTRATION)
            .await
    }

    pub async fn heartbeat(
        &self,
        request: &HeartbeatRequest,
        timeout: Duration,
    ) -> Result<HeartbeatResponse> {
        self.inner.request(methods::HEARTBEAT, request, timeout).await
    }

    pub async fn call_host_function(
        &self,
        request: &CallRequest,
        timeout: Duration,
    ) -> Result<CallResponse> {
        self.inner
            .request(methods::CALL_HOST_FUNCTION, request, timeout)
            .await
    }

    pub async fn report_log(&self, request: &LogRequest) -> Result<LogResponse> {
        self.inner
            .request(methods::REPORT_LOG, request, TimeoutConfig::LOG_REPORT)
            .await
    }
}
