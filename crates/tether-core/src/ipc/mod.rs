//! Local IPC transport between host and plugins.
//!
//! Length-prefixed JSON-RPC 2.0 over loopback TCP.
//!
//! # Architecture
//!
//! - **Server**: accepts connections and dispatches method calls concurrently
//! - **Client**: multiplexes calls over one connection, matched by request id
//! - **Stream**: one-way item stream over a dedicated connection
//! - **Protocol**: shared framing and JSON-RPC types used by all three

pub mod client;
pub mod protocol;
pub mod server;
pub mod stream;

pub use client::IpcClient;
pub use protocol::{IpcError, IpcRequest, IpcResponse};
pub use server::{IpcDispatch, IpcServer, IpcServerHandle};
pub use stream::IpcStream;
