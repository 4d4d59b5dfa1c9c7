//! Command line arguments and their mapping onto [`HostConfig`].

use anyhow::{bail, Context, Result};
use clap::Parser;
use std::net::IpAddr;
use std::path::PathBuf;
use std::time::Duration;
use tether_core::HostConfig;

#[derive(Parser, Debug)]
#[command(name = "tether-host")]
#[command(about = "Launch and supervise tether plugins")]
pub struct Args {
    /// Plugin executables to start
    pub plugins: Vec<PathBuf>,

    /// JSON host config; flags override its values
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Fixed port to listen on (0 = scan the port range)
    #[arg(short, long)]
    pub port: Option<u16>,

    /// Port range to scan, as START-END
    #[arg(long, value_parser = parse_port_range)]
    pub port_range: Option<(u16, u16)>,

    /// Address to bind to
    #[arg(long)]
    pub bind: Option<IpAddr>,

    /// Heartbeat interval in milliseconds
    #[arg(long)]
    pub heartbeat_ms: Option<u64>,

    /// Missed heartbeats tolerated before a plugin counts as crashed
    #[arg(long)]
    pub max_heartbeat_miss: Option<u32>,

    /// Restarts allowed per plugin after crashes
    #[arg(long)]
    pub max_restarts: Option<u32>,

    /// Leave crashed plugins down
    #[arg(long)]
    pub no_auto_restart: bool,

    /// Directory for per-plugin stdout/stderr logs
    #[arg(long)]
    pub log_dir: Option<PathBuf>,

    /// Forward plugin paths to an already running host instead of starting
    #[arg(long)]
    pub single_instance: bool,

    /// Enable debug logging
    #[arg(short, long)]
    pub debug: bool,

    /// Emit logs as JSON lines
    #[arg(long)]
    pub json_logs: bool,
}

fn parse_port_range(value: &str) -> Result<(u16, u16), String> {
    let (start, end) = value
        .split_once('-')
        .ok_or_else(|| format!("expected START-END, got {value}"))?;
    let start: u16 = start.trim().parse().map_err(|e| format!("bad start port: {e}"))?;
    let end: u16 = end.trim().parse().map_err(|e| format!("bad end port: {e}"))?;
    Ok((start, end))
}

impl Args {
    /// Load the config file if given, then apply flag overrides.
    pub fn host_config(&self) -> Result<HostConfig> {
        let mut config = match &self.config {
            Some(path) => HostConfig::from_json_file(path)
                .with_context(|| format!("loading {}", path.display()))?,
            None => HostConfig::default(),
        };

        if let Some(port) = self.port {
            config = config.with_port(port);
        }
        if let Some((start, end)) = self.port_range {
            config = config.with_port_range(start, end);
        }
        if let Some(bind) = self.bind {
            config = config.with_bind_address(bind);
        }
        if self.heartbeat_ms.is_some() || self.max_heartbeat_miss.is_some() {
            let interval = self
                .heartbeat_ms
                .map(Duration::from_millis)
                .unwrap_or(config.heartbeat_interval);
            let max_miss = self.max_heartbeat_miss.unwrap_or(config.max_heartbeat_miss);
            config = config.with_heartbeat(interval, max_miss);
        }
        if let Some(max_restarts) = self.max_restarts {
            config = config.with_max_restarts(max_restarts);
        }
        if self.no_auto_restart {
            config = config.with_auto_restart(false);
        }
        if let Some(dir) = &self.log_dir {
            config = config.with_log_dir(dir);
        }

        if let Err(e) = config.validate() {
            bail!("invalid host configuration: {e}");
        }
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(args: &[&str]) -> Args {
        Args::parse_from(std::iter::once("tether-host").chain(args.iter().copied()))
    }

    #[test]
    fn test_defaults() {
        let config = parse(&[]).host_config().unwrap();
        assert_eq!(config, HostConfig::default());
    }

    #[test]
    fn test_flags_override() {
        let args = parse(&[
            "--port-range",
            "6000-6010",
            "--heartbeat-ms",
            "500",
            "--no-auto-restart",
            "plugins/a",
            "plugins/b",
        ]);
        let config = args.host_config().unwrap();
        assert_eq!(config.port_range, (6000, 6010));
        assert_eq!(config.heartbeat_interval, Duration::from_millis(500));
        assert_eq!(config.max_heartbeat_miss, 3);
        assert!(!config.auto_restart_plugin);
        assert_eq!(args.plugins.len(), 2);
    }

    #[test]
    fn test_config_file_then_flags() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("host.json");
        std::fs::write(&path, r#"{"max_restarts": 7, "heartbeat_interval": 2000}"#).unwrap();

        let config = parse(&["--config", path.to_str().unwrap(), "--max-restarts", "1"])
            .host_config()
            .unwrap();
        assert_eq!(config.max_restarts, 1);
        assert_eq!(config.heartbeat_interval, Duration::from_secs(2));
    }

    #[test]
    fn test_bad_port_range() {
        assert!(parse_port_range("6000").is_err());
        assert!(parse_port_range("a-b").is_err());
        assert_eq!(parse_port_range("1-2"), Ok((1, 2)));

        let err = parse(&["--port-range", "7000-6000"]).host_config().unwrap_err();
        assert!(err.to_string().contains("invalid host configuration"));
    }
}
