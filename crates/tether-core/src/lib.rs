//! Tether Core - multi-process plugin framework.
//!
//! A host process launches plugin executables as child processes and talks to
//! them over bidirectional RPC: the host serves registration, heartbeats,
//! host functions and inter-plugin relay; each plugin serves its own
//! functions and message handlers. The host supervises every plugin with
//! exit monitoring, heartbeat checks and a bounded restart policy.
//!
//! # Example
//!
//! ```rust,ignore
//! use tether_core::{HostConfig, Parameter, PluginHost};
//!
//! #[tokio::main]
//! async fn main() -> tether_core::Result<()> {
//!     let host = PluginHost::new(HostConfig::default());
//!     host.start().await?;
//!
//!     let id = host.start_plugin_by_path("./plugins/sample").await?;
//!     let response = host
//!         .call_plugin_function(&id, "ReverseText", vec![Parameter::string("text", "hello")])
//!         .await?;
//!     println!("{:?}", response.value());
//!
//!     host.stop().await;
//!     Ok(())
//! }
//! ```

pub mod cancel;
pub mod config;
pub mod error;
pub mod functions;
pub mod host;
pub mod ipc;
pub mod plugin;
pub mod process;
pub mod registry;
pub mod rpc;
pub mod singleton;

// Re-export commonly used types
pub use cancel::{CancellationToken, CancelledError};
pub use config::{EnvConfig, HostConfig, IpcConfig, PluginConfig, TimeoutConfig};
pub use error::{Result, TetherError};
pub use functions::{CallContext, Callable, FunctionTable};
pub use host::PluginHost;
pub use plugin::{MessageHandler, Plugin, PluginEnvironment, WeakPlugin};
pub use process::{CommandLauncher, ExitReport, LaunchSpec, PluginLauncher, PluginProcess};
pub use registry::{PluginRecord, PluginRegistry, PluginStatus};
pub use rpc::{
    CallRequest, CallResponse, LogLevel, MessageRequest, MessageResponse, Metadata, Parameter,
    ParameterType, PluginDescriptor,
};
pub use singleton::{check_single_instance, CommandMessage, InstanceRole, SingletonConfig};
