//! Single-instance guard for host-level programs.
//!
//! The first instance of an application claims a loopback port derived from
//! the application name and becomes the primary. Later instances find the
//! port taken, forward their command line to the primary and exit.
//!
//! Forwarded commands wait in a bounded queue. When the queue is full the
//! newest command is dropped and the sender is told it was not accepted.

use crate::config::TimeoutConfig;
use crate::error::{Result, TetherError};
use crate::ipc::{IpcClient, IpcDispatch, IpcServer, IpcServerHandle};
use serde::{Deserialize, Serialize};
use std::net::{IpAddr, Ipv4Addr};
use std::path::PathBuf;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

const FORWARD_COMMAND: &str = "ForwardCommand";

/// A command line forwarded by a secondary instance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandMessage {
    pub args: Vec<String>,
    pub pid: u32,
    /// Unix seconds.
    pub timestamp: i64,
    pub work_dir: PathBuf,
}

impl CommandMessage {
    /// Describe the current process.
    pub fn current() -> Self {
        Self {
            args: std::env::args().skip(1).collect(),
            pid: std::process::id(),
            timestamp: chrono::Utc::now().timestamp(),
            work_dir: std::env::current_dir().unwrap_or_default(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct SingletonConfig {
    pub app_name: String,
    /// First port of the range the claim port is derived into.
    pub port_base: u16,
    pub port_span: u16,
    /// Forwarded commands buffered before new ones are dropped.
    pub queue_depth: usize,
}

impl SingletonConfig {
    pub fn new(app_name: impl Into<String>) -> Self {
        Self {
            app_name: app_name.into(),
            port_base: 40000,
            port_span: 10000,
            queue_depth: 16,
        }
    }

    pub fn with_port_range(mut self, base: u16, span: u16) -> Self {
        self.port_base = base;
        self.port_span = span;
        self
    }

    pub fn with_queue_depth(mut self, depth: usize) -> Self {
        self.queue_depth = depth;
        self
    }

    /// Claim port for this application name.
    pub fn port(&self) -> u16 {
        let hash = blake3::hash(self.app_name.as_bytes());
        let bytes = hash.as_bytes();
        let value = u16::from_be_bytes([bytes[0], bytes[1]]);
        let span = self.port_span.max(1);
        self.port_base.saturating_add(value % span)
    }
}

/// Outcome of [`check_single_instance`].
#[derive(Debug)]
pub enum InstanceRole {
    /// This process owns the claim and receives forwarded commands.
    Primary(PrimaryInstance),
    /// Another instance owns the claim. `accepted` tells whether it queued
    /// the forwarded command.
    Secondary { accepted: bool },
}

/// The claim held by the first instance. Dropping it releases the claim.
#[derive(Debug)]
pub struct PrimaryInstance {
    commands: mpsc::Receiver<CommandMessage>,
    server: IpcServerHandle,
}

impl PrimaryInstance {
    /// Next forwarded command; `None` after [`close`](Self::close).
    pub async fn recv(&mut self) -> Option<CommandMessage> {
        self.commands.recv().await
    }

    pub fn port(&self) -> u16 {
        self.server.port
    }

    /// Release the claim and stop accepting commands.
    pub fn close(&mut self) {
        self.server.shutdown();
        self.commands.close();
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct Forward {
    app: String,
    command: CommandMessage,
}

#[derive(Debug, Serialize, Deserialize)]
struct ForwardAck {
    app: String,
    accepted: bool,
}

struct SingletonService {
    app: String,
    queue: mpsc::Sender<CommandMessage>,
}

#[async_trait::async_trait]
impl IpcDispatch for SingletonService {
    async fn dispatch(&self, method: &str, params: serde_json::Value) -> Result<serde_json::Value> {
        if method != FORWARD_COMMAND {
            return Err(TetherError::MethodNotFound {
                method: method.to_string(),
            });
        }
        let forward: Forward = serde_json::from_value(params)?;
        if forward.app != self.app {
            return Err(TetherError::Validation {
                field: "app".to_string(),
                message: format!("instance belongs to {}", self.app),
            });
        }

        let pid = forward.command.pid;
        let accepted = match self.queue.try_send(forward.command) {
            Ok(()) => {
                debug!(pid, "Queued forwarded command");
                true
            }
            Err(mpsc::error::TrySendError::Full(_)) => {
                warn!(pid, "Command queue full; dropping forwarded command");
                false
            }
            Err(mpsc::error::TrySendError::Closed(_)) => false,
        };

        Ok(serde_json::to_value(ForwardAck {
            app: self.app.clone(),
            accepted,
        })?)
    }
}

/// Claim the single-instance slot, or forward `command` to its owner.
///
/// Fails when the claim port is held by a program that is not an instance
/// of this application.
pub async fn check_single_instance(
    config: &SingletonConfig,
    command: CommandMessage,
) -> Result<InstanceRole> {
    let port = config.port();
    let loopback = IpAddr::V4(Ipv4Addr::LOCALHOST);

    if let Ok(listener) = IpcServer::bind_in_range(loopback, port, port).await {
        let (queue, commands) = mpsc::channel(config.queue_depth.max(1));
        let service = std::sync::Arc::new(SingletonService {
            app: config.app_name.clone(),
            queue,
        });
        let server = IpcServer::start_on(listener, service)?;
        info!(app = %config.app_name, port, "Claimed single instance");
        return Ok(InstanceRole::Primary(PrimaryInstance { commands, server }));
    }

    let address = format!("{}:{}", loopback, port);
    let client = IpcClient::connect(&address, TimeoutConfig::CONNECT).await?;
    let forward = Forward {
        app: config.app_name.clone(),
        command,
    };
    let ack: ForwardAck = client
        .request(FORWARD_COMMAND, &forward, TimeoutConfig::CONNECT)
        .await
        .map_err(|e| TetherError::Config {
            message: format!("port {} is held by another program: {}", port, e),
        })?;
    if ack.app != config.app_name {
        return Err(TetherError::Config {
            message: format!("port {} is held by {}", port, ack.app),
        });
    }

    info!(app = %config.app_name, port, accepted = ack.accepted, "Forwarded command to running instance");
    Ok(InstanceRole::Secondary {
        accepted: ack.accepted,
    })
}
