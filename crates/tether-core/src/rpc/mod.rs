//! The host/plugin RPC contract.
//!
//! Method names, error codes, metadata keys and message bodies shared by
//! both sides, plus typed clients over the IPC transport.

mod host_client;
mod plugin_client;
mod types;

pub use host_client::HostClient;
pub use plugin_client::PluginClient;
pub use types::{
    CallRequest, CallResponse, HeartbeatRequest, HeartbeatResponse, LogLevel, LogRequest,
    LogResponse, MessageRequest, MessageResponse, Metadata, Parameter, ParameterType,
    PluginDescriptor, RegisterRequest, RegisterResponse, ShutdownRequest, ShutdownResponse,
    StatusRequest, StatusResponse,
};

/// JSON-RPC method names.
pub mod methods {
    // Served by the host
    pub const REGISTER_PLUGIN: &str = "RegisterPlugin";
    pub const HEARTBEAT: &str = "Heartbeat";
    pub const CALL_HOST_FUNCTION: &str = "CallHostFunction";
    pub const REPORT_LOG: &str = "ReportLog";

    // Served by plugins
    pub const CALL_PLUGIN_FUNCTION: &str = "CallPluginFunction";
    pub const RECEIVE_MESSAGES: &str = "ReceiveMessages";
    pub const GET_PLUGIN_STATUS: &str = "GetPluginStatus";
    pub const SHUTDOWN: &str = "Shutdown";
}

/// `CallResponse::error_code` values.
pub mod error_codes {
    pub const FUNCTION_NOT_FOUND: &str = "FUNCTION_NOT_FOUND";
    pub const FUNCTION_ERROR: &str = "FUNCTION_ERROR";
    pub const TARGET_PLUGIN_NOT_FOUND: &str = "TARGET_PLUGIN_NOT_FOUND";
    pub const TARGET_PLUGIN_NOT_RUNNING: &str = "TARGET_PLUGIN_NOT_RUNNING";
    pub const INTER_PLUGIN_CALL_ERROR: &str = "INTER_PLUGIN_CALL_ERROR";
}

/// Well-known keys and values in call metadata.
pub mod metadata {
    pub const SOURCE: &str = "source";
    pub const PLUGIN_ID: &str = "plugin_id";
    pub const TARGET_PLUGIN_ID: &str = "target_plugin_id";
    pub const CALL_TYPE: &str = "call_type";
    pub const SOURCE_PLUGIN: &str = "source_plugin";
    pub const TARGET_PLUGIN: &str = "target_plugin";
    pub const VIA_HOST: &str = "via_host";
    pub const TIMESTAMP: &str = "timestamp";
    /// Milliseconds the caller allows the host for a relayed call.
    pub const RELAY_TIMEOUT_MS: &str = "relay_timeout_ms";

    pub const SOURCE_HOST: &str = "host";
    pub const SOURCE_PLUGIN_VALUE: &str = "plugin";
    pub const INTER_PLUGIN: &str = "inter_plugin";
}
