//! Centralized configuration for Tether.
//!
//! Compile-time tunables (frame limits, fixed RPC deadlines, environment
//! variable names) live on unit structs with associated constants. Runtime
//! settings for the two sides of the framework are [`HostConfig`] and
//! [`PluginConfig`], both immutable once their owner is constructed.

use crate::error::{Result, TetherError};
use serde::{Deserialize, Serialize};
use std::net::{IpAddr, Ipv4Addr};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Framing and connection limits for the IPC transport.
pub struct IpcConfig;

impl IpcConfig {
    /// Largest accepted frame payload. Checked before the payload is allocated.
    pub const MAX_FRAME_SIZE: usize = 16 * 1024 * 1024;
    /// Concurrent connections accepted by one IPC server.
    pub const MAX_CONNECTIONS: usize = 256;
    /// Responses queued per connection before request tasks back off.
    pub const RESPONSE_QUEUE_DEPTH: usize = 64;
    /// Stream items buffered between the socket and a stream handler.
    pub const STREAM_BUFFER: usize = 32;
}

/// Fixed deadlines for RPC traffic.
pub struct TimeoutConfig;

impl TimeoutConfig {
    pub const FUNCTION_CALL: Duration = Duration::from_secs(30);
    pub const REGISTRATION: Duration = Duration::from_secs(10);
    pub const HEARTBEAT: Duration = Duration::from_secs(5);
    pub const LINK_PROBE: Duration = Duration::from_secs(3);
    pub const MESSAGE_DELIVERY: Duration = Duration::from_secs(60);
    pub const CONNECT: Duration = Duration::from_secs(5);
    pub const METADATA_QUERY: Duration = Duration::from_secs(10);
    pub const PROCESS_STOP: Duration = Duration::from_secs(5);
    pub const LOG_REPORT: Duration = Duration::from_secs(3);
    /// Extra time a plugin waits on a relayed call beyond the deadline it
    /// hands the host, so the host's structured failure arrives first.
    pub const RELAY_MARGIN: Duration = Duration::from_secs(2);
    /// Delay between a `Shutdown` request and the plugin actually stopping.
    pub const SHUTDOWN_GRACE: Duration = Duration::from_millis(500);
}

/// Process launch contract between host and plugin.
pub struct EnvConfig;

impl EnvConfig {
    /// Identifier the host assigned to the plugin.
    pub const PLUGIN_ID: &'static str = "TETHER_PLUGIN_ID";
    /// `host:port` of the host's inbound server.
    pub const HOST_ADDRESS: &'static str = "TETHER_HOST_ADDRESS";
    /// Per-spawn correlation token echoed back during registration.
    pub const LAUNCH_TOKEN: &'static str = "TETHER_LAUNCH_TOKEN";
    /// Flag that switches a plugin executable into metadata query mode.
    pub const INFO_FLAG: &'static str = "--info";
}

/// Host configuration.
///
/// Durations serialize as integer milliseconds so the struct can be loaded
/// from a JSON file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct HostConfig {
    /// Address the inbound server binds to.
    pub bind_address: IpAddr,
    /// Fixed port for the inbound server; `0` means scan `port_range`.
    pub port: u16,
    /// Inclusive `[start, end]` range scanned when `port` is `0`.
    pub port_range: (u16, u16),
    #[serde(with = "duration_ms")]
    pub heartbeat_interval: Duration,
    /// Missed heartbeat intervals tolerated before a plugin is declared crashed.
    pub max_heartbeat_miss: u32,
    pub auto_restart_plugin: bool,
    /// Accept re-registration from plugins that are already running.
    pub enable_plugin_reconnect: bool,
    /// Restart budget applied to every loaded plugin.
    pub max_restarts: u32,
    #[serde(with = "duration_ms")]
    pub restart_backoff: Duration,
    /// Pause between a registration and dialing back to the plugin.
    #[serde(with = "duration_ms")]
    pub connect_settle_delay: Duration,
    #[serde(with = "duration_ms")]
    pub call_timeout: Duration,
    #[serde(with = "duration_ms")]
    pub message_timeout: Duration,
    /// Directory receiving `<plugin_id>.log` files with plugin stdout/stderr.
    pub log_dir: Option<PathBuf>,
}

impl Default for HostConfig {
    fn default() -> Self {
        Self {
            bind_address: IpAddr::V4(Ipv4Addr::LOCALHOST),
            port: 0,
            port_range: (50051, 50100),
            heartbeat_interval: Duration::from_secs(10),
            max_heartbeat_miss: 3,
            auto_restart_plugin: true,
            enable_plugin_reconnect: true,
            max_restarts: 3,
            restart_backoff: Duration::from_secs(5),
            connect_settle_delay: Duration::from_secs(2),
            call_timeout: TimeoutConfig::FUNCTION_CALL,
            message_timeout: TimeoutConfig::MESSAGE_DELIVERY,
            log_dir: None,
        }
    }
}

impl HostConfig {
    /// Create a host config with default values.
    pub fn new() -> Self {
        Self::default()
    }

    /// Load a host config from a JSON file. Missing fields take their defaults.
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|e| {
            TetherError::io_with_context(e, format!("Failed to read {}", path.display()))
        })?;
        let config: Self = serde_json::from_str(&content).map_err(|e| TetherError::Config {
            message: format!("Failed to parse host config {}: {}", path.display(), e),
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Use a single fixed port.
    pub fn with_port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    /// Scan an inclusive port range.
    pub fn with_port_range(mut self, start: u16, end: u16) -> Self {
        self.port = 0;
        self.port_range = (start, end);
        self
    }

    pub fn with_bind_address(mut self, address: IpAddr) -> Self {
        self.bind_address = address;
        self
    }

    pub fn with_heartbeat(mut self, interval: Duration, max_miss: u32) -> Self {
        self.heartbeat_interval = interval;
        self.max_heartbeat_miss = max_miss;
        self
    }

    pub fn with_auto_restart(mut self, enable: bool) -> Self {
        self.auto_restart_plugin = enable;
        self
    }

    pub fn with_plugin_reconnect(mut self, enable: bool) -> Self {
        self.enable_plugin_reconnect = enable;
        self
    }

    pub fn with_max_restarts(mut self, max_restarts: u32) -> Self {
        self.max_restarts = max_restarts;
        self
    }

    pub fn with_restart_backoff(mut self, backoff: Duration) -> Self {
        self.restart_backoff = backoff;
        self
    }

    pub fn with_connect_settle_delay(mut self, delay: Duration) -> Self {
        self.connect_settle_delay = delay;
        self
    }

    pub fn with_call_timeout(mut self, timeout: Duration) -> Self {
        self.call_timeout = timeout;
        self
    }

    pub fn with_message_timeout(mut self, timeout: Duration) -> Self {
        self.message_timeout = timeout;
        self
    }

    pub fn with_log_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.log_dir = Some(dir.into());
        self
    }

    /// Inclusive port range the inbound server will try, in order.
    pub fn port_candidates(&self) -> (u16, u16) {
        if self.port > 0 {
            (self.port, self.port)
        } else {
            self.port_range
        }
    }

    /// Heartbeat age beyond which a running plugin is declared crashed.
    pub fn heartbeat_deadline(&self) -> Duration {
        self.heartbeat_interval
            .saturating_mul(self.max_heartbeat_miss.max(1))
    }

    /// Reject settings the runtime cannot honour.
    pub fn validate(&self) -> Result<()> {
        if self.heartbeat_interval.is_zero() {
            return Err(TetherError::Validation {
                field: "heartbeat_interval".into(),
                message: "must be greater than zero".into(),
            });
        }
        if self.max_heartbeat_miss == 0 {
            return Err(TetherError::Validation {
                field: "max_heartbeat_miss".into(),
                message: "must be at least 1".into(),
            });
        }
        let (start, end) = self.port_candidates();
        if start == 0 || start > end {
            return Err(TetherError::Validation {
                field: "port_range".into(),
                message: format!("invalid range {}-{}", start, end),
            });
        }
        if self.call_timeout.is_zero() || self.message_timeout.is_zero() {
            return Err(TetherError::Validation {
                field: "call_timeout".into(),
                message: "RPC deadlines must be greater than zero".into(),
            });
        }
        Ok(())
    }
}

/// Plugin-side configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PluginConfig {
    /// Fixed plugin identifier. When absent the plugin uses the host-assigned
    /// ID from the environment, or generates `name-unixtime`.
    pub id: Option<String>,
    pub name: String,
    pub version: String,
    pub description: String,
    /// Base64 image data or an image path.
    pub logo: Option<String>,
    pub capabilities: Vec<String>,
    /// Fallback host address when the launch environment provides none.
    pub host_address: String,
    #[serde(with = "duration_ms")]
    pub heartbeat_interval: Duration,
    #[serde(with = "duration_ms")]
    pub reconnect_interval: Duration,
    /// Failed reconnect cycles tolerated before giving up; `0` retries forever.
    pub max_reconnect_tries: u32,
    pub close_on_host_disconnect: bool,
    #[serde(with = "duration_ms")]
    pub health_check_interval: Duration,
    /// Time without a successful probe before a reconnect cycle starts.
    #[serde(with = "duration_ms")]
    pub link_grace_period: Duration,
    #[serde(with = "duration_ms")]
    pub call_timeout: Duration,
}

impl Default for PluginConfig {
    fn default() -> Self {
        Self {
            id: None,
            name: "UnnamedPlugin".to_string(),
            version: "1.0.0".to_string(),
            description: "A plugin built on tether".to_string(),
            logo: None,
            capabilities: Vec::new(),
            host_address: "127.0.0.1:50051".to_string(),
            heartbeat_interval: Duration::from_secs(10),
            reconnect_interval: Duration::from_secs(5),
            max_reconnect_tries: 0,
            close_on_host_disconnect: true,
            health_check_interval: Duration::from_secs(15),
            link_grace_period: Duration::from_secs(30),
            call_timeout: TimeoutConfig::FUNCTION_CALL,
        }
    }
}

impl PluginConfig {
    /// Create a plugin config with the given identity and default timings.
    pub fn new(
        name: impl Into<String>,
        version: impl Into<String>,
        description: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            version: version.into(),
            description: description.into(),
            ..Self::default()
        }
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = Some(id.into());
        self
    }

    pub fn with_logo(mut self, logo: impl Into<String>) -> Self {
        self.logo = Some(logo.into());
        self
    }

    pub fn with_capabilities<I, S>(mut self, capabilities: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.capabilities = capabilities.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_host_address(mut self, address: impl Into<String>) -> Self {
        self.host_address = address.into();
        self
    }

    pub fn with_heartbeat_interval(mut self, interval: Duration) -> Self {
        self.heartbeat_interval = interval;
        self
    }

    pub fn with_reconnect(mut self, interval: Duration, max_tries: u32) -> Self {
        self.reconnect_interval = interval;
        self.max_reconnect_tries = max_tries;
        self
    }

    pub fn with_health_check(mut self, interval: Duration, grace_period: Duration) -> Self {
        self.health_check_interval = interval;
        self.link_grace_period = grace_period;
        self
    }

    pub fn with_close_on_host_disconnect(mut self, enable: bool) -> Self {
        self.close_on_host_disconnect = enable;
        self
    }

    pub fn with_call_timeout(mut self, timeout: Duration) -> Self {
        self.call_timeout = timeout;
        self
    }
}

/// Serde adapter storing a [`Duration`] as integer milliseconds.
pub mod duration_ms {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        let millis = u64::try_from(value.as_millis()).unwrap_or(u64::MAX);
        serializer.serialize_u64(millis)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_host_defaults_match_documented_values() {
        let config = HostConfig::default();
        assert_eq!(config.port_candidates(), (50051, 50100));
        assert_eq!(config.heartbeat_interval, Duration::from_secs(10));
        assert_eq!(config.max_heartbeat_miss, 3);
        assert!(config.auto_restart_plugin);
        assert!(config.enable_plugin_reconnect);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_fixed_port_overrides_range() {
        let config = HostConfig::new().with_port(6000);
        assert_eq!(config.port_candidates(), (6000, 6000));

        let config = config.with_port_range(7000, 7005);
        assert_eq!(config.port_candidates(), (7000, 7005));
    }

    #[test]
    fn test_heartbeat_deadline() {
        let config = HostConfig::new().with_heartbeat(Duration::from_secs(1), 3);
        assert_eq!(config.heartbeat_deadline(), Duration::from_secs(3));
    }

    #[test]
    fn test_validate_rejects_inverted_range() {
        let config = HostConfig::new().with_port_range(6000, 5000);
        assert!(matches!(
            config.validate(),
            Err(TetherError::Validation { .. })
        ));
    }

    #[test]
    fn test_host_config_from_json_file() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("host.json");
        std::fs::write(
            &path,
            r#"{"port_range": [41000, 41010], "heartbeat_interval": 1500, "auto_restart_plugin": false}"#,
        )
        .unwrap();

        let config = HostConfig::from_json_file(&path).unwrap();
        assert_eq!(config.port_range, (41000, 41010));
        assert_eq!(config.heartbeat_interval, Duration::from_millis(1500));
        assert!(!config.auto_restart_plugin);
        // Untouched fields keep their defaults
        assert_eq!(config.max_heartbeat_miss, 3);
    }

    #[test]
    fn test_host_config_from_bad_json_is_config_error() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("host.json");
        std::fs::write(&path, "{ not json").unwrap();

        assert!(matches!(
            HostConfig::from_json_file(&path),
            Err(TetherError::Config { .. })
        ));
    }

    #[test]
    fn test_plugin_config_builder() {
        let config = PluginConfig::new("Sample", "2.1.0", "demo")
            .with_capabilities(["text", "math"])
            .with_reconnect(Duration::from_secs(1), 4);
        assert_eq!(config.name, "Sample");
        assert_eq!(config.capabilities, vec!["text", "math"]);
        assert_eq!(config.max_reconnect_tries, 4);
        assert!(config.close_on_host_disconnect);
    }
}
