//! Plugin process supervision: start, stop, exit monitoring, heartbeat
//! sweeps, connect-back and the restart policy.

use super::state::HostState;
use crate::config::TimeoutConfig;
use crate::error::{Result, TetherError};
use crate::process::{ExitReport, LaunchSpec, PluginProcess, ProcessHandle};
use crate::registry::{PluginRecord, PluginStatus};
use crate::rpc::PluginClient;
use chrono::{DateTime, Utc};
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum StartMode {
    /// Requested by a caller; resets the restart counter.
    Explicit,
    /// Scheduled by the restart policy; only proceeds from `crashed`.
    Restart,
}

enum ExitTrigger {
    Exited(Result<ExitReport>),
    Kill,
    Shutdown,
}

impl HostState {
    /// Spawn the plugin's process and move its record to `starting`.
    pub(crate) async fn start_sequence(self: &Arc<Self>, id: &str, mode: StartMode) -> Result<()> {
        let host_address = self.address().ok_or_else(|| TetherError::Config {
            message: "host server is not started".to_string(),
        })?;
        if self.cancel.is_cancelled() {
            return Err(TetherError::Cancelled);
        }

        let token = uuid::Uuid::new_v4().to_string();
        let path = self.registry.try_update(id, |r| {
            match r.status {
                PluginStatus::Crashed => {}
                // Stopped or started by someone else during the backoff
                _ if mode == StartMode::Restart => return Err(TetherError::Cancelled),
                PluginStatus::Running | PluginStatus::Starting => {
                    return Err(TetherError::PluginAlreadyRunning { id: r.id.clone() });
                }
                _ => {}
            }
            r.transition(PluginStatus::Starting)?;
            if mode == StartMode::Explicit {
                r.restart_count = 0;
            }
            r.launch_token = Some(token.clone());
            r.start_time = Some(Utc::now());
            r.last_heartbeat = None;
            r.port = 0;
            r.client = None;
            r.process = None;
            Ok(r.path.clone())
        })?;

        let spec = LaunchSpec {
            plugin_id: id.to_string(),
            path: path.clone(),
            host_address: host_address.to_string(),
            launch_token: token.clone(),
            log_file: self
                .config
                .log_dir
                .as_ref()
                .map(|dir| dir.join(format!("{}.log", id))),
        };

        let mut process = match self.launcher.spawn(&spec).await {
            Ok(process) => process,
            Err(e) => {
                error!(plugin_id = %id, path = %path.display(), "Failed to start plugin: {}", e);
                self.registry.update(id, |r| {
                    if r.launch_token.as_deref() == Some(token.as_str()) {
                        let _ = r.transition(PluginStatus::Error);
                        r.launch_token = None;
                    }
                });
                return Err(e);
            }
        };

        let handle = ProcessHandle::new(process.pid());
        let attached = self
            .registry
            .update(id, |r| {
                let current = r.launch_token.as_deref() == Some(token.as_str())
                    && r.status == PluginStatus::Starting;
                if current {
                    r.process = Some(handle.clone());
                }
                current
            })
            .unwrap_or(false);

        if !attached {
            warn!(plugin_id = %id, "Plugin was stopped while launching; killing new process");
            if let Err(e) = process.kill().await {
                warn!(plugin_id = %id, "Failed to kill abandoned process: {}", e);
            }
            return Err(TetherError::Cancelled);
        }

        info!(plugin_id = %id, pid = ?handle.pid(), "Plugin process started");

        let state = self.clone();
        let id = id.to_string();
        self.spawn_task(async move { state.monitor_process(id, token, handle, process).await });
        Ok(())
    }

    /// Close the plugin's connection, kill its process and mark it `stopped`.
    pub(crate) async fn stop_sequence(self: &Arc<Self>, id: &str) -> Result<()> {
        let process = self.registry.try_update(id, |r| match r.status {
            PluginStatus::Stopped | PluginStatus::Stopping => Ok(None),
            PluginStatus::Starting | PluginStatus::Running => {
                r.transition(PluginStatus::Stopping)?;
                r.client = None;
                Ok(Some(r.process.clone()))
            }
            PluginStatus::Crashed | PluginStatus::Error => {
                r.transition(PluginStatus::Stopped)?;
                r.launch_token = None;
                Ok(Some(r.process.take()))
            }
        })?;

        let Some(process) = process else {
            debug!(plugin_id = %id, "Plugin already stopped");
            return Ok(());
        };

        info!(plugin_id = %id, "Stopping plugin");
        if let Some(process) = process {
            process.request_kill();
            if !process.wait_exit(TimeoutConfig::PROCESS_STOP).await {
                warn!(plugin_id = %id, pid = ?process.pid(), "Plugin process did not exit in time");
            }
        }

        // The monitor normally does this on exit; covers a missing or stuck process
        self.registry.update(id, |r| {
            if r.status == PluginStatus::Stopping {
                let _ = r.transition(PluginStatus::Stopped);
                r.process = None;
                r.launch_token = None;
            }
        });
        Ok(())
    }

    /// Own `process` until it exits, then apply the exit to the record.
    async fn monitor_process(
        self: Arc<Self>,
        id: String,
        token: String,
        handle: ProcessHandle,
        mut process: Box<dyn PluginProcess>,
    ) {
        let trigger = tokio::select! {
            result = process.wait() => ExitTrigger::Exited(result),
            _ = handle.kill_requested().cancelled() => ExitTrigger::Kill,
            _ = self.cancel.cancelled() => ExitTrigger::Shutdown,
        };

        let host_shutdown = matches!(trigger, ExitTrigger::Shutdown);
        let report = match trigger {
            ExitTrigger::Exited(result) => result,
            ExitTrigger::Kill | ExitTrigger::Shutdown => {
                if let Err(e) = process.kill().await {
                    warn!(plugin_id = %id, "Failed to kill plugin process: {}", e);
                }
                process.wait().await
            }
        };
        handle.mark_exited();

        match &report {
            Ok(report) => debug!(plugin_id = %id, code = ?report.code, "Plugin process exited"),
            Err(e) => warn!(plugin_id = %id, "Lost track of plugin process: {}", e),
        }

        self.on_process_exit(&id, &token, host_shutdown);
    }

    fn on_process_exit(self: &Arc<Self>, id: &str, token: &str, host_shutdown: bool) {
        let crashed = self
            .registry
            .update(id, |r| {
                if r.launch_token.as_deref() != Some(token) {
                    // An older process of a plugin that has since been restarted
                    return false;
                }
                r.process = None;
                match r.status {
                    PluginStatus::Stopping => {
                        let _ = r.transition(PluginStatus::Stopped);
                        r.launch_token = None;
                        false
                    }
                    PluginStatus::Starting | PluginStatus::Running if host_shutdown => {
                        let _ = r.transition(PluginStatus::Stopping);
                        let _ = r.transition(PluginStatus::Stopped);
                        r.launch_token = None;
                        false
                    }
                    PluginStatus::Starting | PluginStatus::Running => {
                        r.transition(PluginStatus::Crashed).is_ok()
                    }
                    _ => false,
                }
            })
            .unwrap_or(false);

        if crashed {
            warn!(plugin_id = %id, "Plugin process exited unexpectedly");
            self.handle_crash(id);
        }
    }

    /// Apply the restart policy to a `crashed` plugin.
    pub(crate) fn handle_crash(self: &Arc<Self>, id: &str) {
        let attempt = self
            .registry
            .update(id, |r| {
                if r.status != PluginStatus::Crashed
                    || self.cancel.is_cancelled()
                    || !r.can_auto_restart()
                {
                    return None;
                }
                r.restart_count += 1;
                Some((r.restart_count, r.max_restarts, r.process.take()))
            })
            .flatten();

        let Some((attempt, max_restarts, old_process)) = attempt else {
            if let Some(record) = self.registry.get(id) {
                if record.status == PluginStatus::Crashed {
                    warn!(
                        plugin_id = %id,
                        restart_count = record.restart_count,
                        "Plugin left crashed; restart budget exhausted or auto-restart disabled"
                    );
                }
            }
            return;
        };

        info!(
            plugin_id = %id,
            attempt,
            max_restarts,
            "Scheduling plugin restart in {:?}",
            self.config.restart_backoff
        );

        let state = self.clone();
        let id = id.to_string();
        let backoff = self.config.restart_backoff;
        self.spawn_task(async move {
            if let Some(old) = old_process {
                old.request_kill();
                old.wait_exit(TimeoutConfig::PROCESS_STOP).await;
            }
            tokio::select! {
                _ = tokio::time::sleep(backoff) => {}
                _ = state.cancel.cancelled() => return,
            }
            match state.start_sequence(&id, StartMode::Restart).await {
                Ok(()) => info!(plugin_id = %id, attempt, "Plugin restarted"),
                Err(TetherError::Cancelled) => debug!(plugin_id = %id, "Restart abandoned"),
                Err(e) => error!(plugin_id = %id, "Plugin restart failed: {}", e),
            }
        });
    }

    /// Declare every `running` plugin with a stale heartbeat crashed.
    ///
    /// Returns the IDs that were marked crashed.
    pub(crate) fn sweep_heartbeats(self: &Arc<Self>, now: DateTime<Utc>) -> Vec<String> {
        let deadline = self.config.heartbeat_deadline();
        let is_stale = |r: &PluginRecord| {
            r.status == PluginStatus::Running
                && r.last_heartbeat
                    .or(r.start_time)
                    .map(|last| (now - last).to_std().unwrap_or_default() > deadline)
                    .unwrap_or(false)
        };

        let candidates: Vec<String> = self
            .registry
            .list()
            .into_iter()
            .filter(|r| is_stale(r))
            .map(|r| r.id)
            .collect();

        let mut crashed = Vec::new();
        for id in candidates {
            // Re-check under the write lock; a heartbeat may have landed meanwhile
            let process = self
                .registry
                .update(&id, |r| {
                    if !is_stale(r) {
                        return None;
                    }
                    r.transition(PluginStatus::Crashed).ok()?;
                    Some(r.process.clone())
                })
                .flatten();

            let Some(process) = process else { continue };
            warn!(plugin_id = %id, "Heartbeat timeout; marking plugin crashed");
            if let Some(process) = process {
                process.request_kill();
            }
            self.handle_crash(&id);
            crashed.push(id);
        }
        crashed
    }

    /// Dial back to a freshly registered plugin and promote it to `running`.
    pub(crate) async fn connect_back(self: Arc<Self>, id: String, token: Option<String>, port: u16) {
        tokio::select! {
            _ = tokio::time::sleep(self.config.connect_settle_delay) => {}
            _ = self.cancel.cancelled() => return,
        }

        let address = SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), port).to_string();
        let is_current = |r: &PluginRecord| {
            r.launch_token == token && r.port == port && r.status.is_active()
        };

        match PluginClient::connect(&address).await {
            Ok(client) => {
                let client = Arc::new(client);
                let promoted = self
                    .registry
                    .update(&id, |r| {
                        if !is_current(r) {
                            return false;
                        }
                        if r.status == PluginStatus::Starting
                            && r.transition(PluginStatus::Running).is_err()
                        {
                            return false;
                        }
                        r.client = Some(client.clone());
                        r.last_heartbeat = Some(Utc::now());
                        true
                    })
                    .unwrap_or(false);

                if promoted {
                    info!(plugin_id = %id, address = %address, "Plugin running");
                } else {
                    debug!(plugin_id = %id, "Discarding connection to superseded plugin instance");
                }
            }
            Err(e) => {
                error!(plugin_id = %id, address = %address, "Failed to connect to plugin: {}", e);
                let outcome = self
                    .registry
                    .update(&id, |r| {
                        if !is_current(r) {
                            return None;
                        }
                        let next = if r.status == PluginStatus::Starting {
                            PluginStatus::Error
                        } else {
                            PluginStatus::Crashed
                        };
                        r.transition(next).ok()?;
                        Some((next, r.process.clone()))
                    })
                    .flatten();

                if let Some((status, process)) = outcome {
                    if let Some(process) = process {
                        process.request_kill();
                    }
                    if status == PluginStatus::Crashed {
                        self.handle_crash(&id);
                    }
                }
            }
        }
    }
}

/// Periodic heartbeat sweep; runs until the host is cancelled.
pub(crate) async fn heartbeat_sweep(state: Arc<HostState>) {
    let mut ticker = tokio::time::interval(state.config.heartbeat_interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    // The first tick completes immediately
    ticker.tick().await;

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                state.sweep_heartbeats(Utc::now());
            }
            _ = state.cancel.cancelled() => break,
        }
    }
    debug!("Heartbeat sweep stopped");
}
