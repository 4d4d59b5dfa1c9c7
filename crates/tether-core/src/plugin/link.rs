//! The plugin's link to its host: registration, the heartbeat sender and
//! the connection monitor that reconnects after a lost host.

use super::state::{lock, PluginState};
use crate::config::TimeoutConfig;
use crate::error::{Result, TetherError};
use crate::rpc::{HeartbeatRequest, HostClient, RegisterRequest};
use chrono::Utc;
use std::sync::Arc;
use std::time::Instant;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

/// Dial the host and register. Returns the registered connection.
pub(crate) async fn register(state: &PluginState, port: u16) -> Result<HostClient> {
    let client = HostClient::connect(&state.host_address).await?;

    let request = RegisterRequest {
        plugin_id: state.id.clone(),
        plugin_name: state.config.name.clone(),
        version: state.config.version.clone(),
        description: state.config.description.clone(),
        port,
        capabilities: state.config.capabilities.clone(),
        functions: state.functions.names(),
        launch_token: state.launch_token.clone(),
    };
    let response = client.register(&request).await?;
    if !response.success {
        return Err(TetherError::RegistrationRejected {
            message: response.message,
        });
    }

    info!(
        plugin_id = %state.id,
        host = %state.host_address,
        host_id = %response.host_id,
        port,
        "Registered with host"
    );
    Ok(client)
}

fn heartbeat_request(state: &PluginState) -> HeartbeatRequest {
    HeartbeatRequest {
        plugin_id: state.id.clone(),
        timestamp: Utc::now().timestamp(),
        status: state.status(),
    }
}

/// Send a heartbeat every `heartbeat_interval`. Failures are only logged;
/// the connection monitor decides when to reconnect.
pub(crate) async fn heartbeat_loop(state: Arc<PluginState>) {
    let mut ticker = tokio::time::interval(state.config.heartbeat_interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    ticker.tick().await;

    loop {
        tokio::select! {
            _ = ticker.tick() => {}
            _ = state.cancel.cancelled() => break,
        }
        let Some(client) = state.host_client() else {
            continue;
        };
        match client
            .heartbeat(&heartbeat_request(&state), TimeoutConfig::HEARTBEAT)
            .await
        {
            Ok(response) if response.success => debug!(plugin_id = %state.id, "Heartbeat acknowledged"),
            Ok(response) => warn!(plugin_id = %state.id, "Heartbeat refused: {}", response.message),
            Err(e) => warn!(plugin_id = %state.id, "Heartbeat failed: {}", e),
        }
    }
    debug!(plugin_id = %state.id, "Heartbeat sender stopped");
}

async fn probe(state: &PluginState) -> bool {
    let Some(client) = state.host_client() else {
        return false;
    };
    if client.is_closed() {
        return false;
    }
    match client
        .heartbeat(&heartbeat_request(state), TimeoutConfig::LINK_PROBE)
        .await
    {
        Ok(response) => response.success,
        Err(e) => {
            debug!(plugin_id = %state.id, "Link probe failed: {}", e);
            false
        }
    }
}

async fn reconnect(state: &PluginState) -> Result<()> {
    state.set_host_client(None);
    let port = (*lock(&state.port)).ok_or_else(|| TetherError::Config {
        message: "plugin server is not running".to_string(),
    })?;
    let client = register(state, port).await?;
    state.set_host_client(Some(Arc::new(client)));
    Ok(())
}

/// Probe the host every `health_check_interval`; after `link_grace_period`
/// without a successful probe, redial and re-register.
pub(crate) async fn link_monitor(state: Arc<PluginState>) {
    let config = &state.config;
    let mut ticker = tokio::time::interval(config.health_check_interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    ticker.tick().await;

    let mut last_success = Instant::now();
    let mut failures: u32 = 0;

    'monitor: loop {
        tokio::select! {
            _ = ticker.tick() => {}
            _ = state.cancel.cancelled() => break,
        }

        if probe(&state).await {
            last_success = Instant::now();
            failures = 0;
            continue;
        }
        if last_success.elapsed() < config.link_grace_period {
            debug!(plugin_id = %state.id, "Host unreachable; within grace period");
            continue;
        }

        warn!(plugin_id = %state.id, host = %state.host_address, "Lost connection to host; reconnecting");
        loop {
            let retryable = match reconnect(&state).await {
                Ok(()) => {
                    info!(plugin_id = %state.id, "Reconnected to host");
                    last_success = Instant::now();
                    failures = 0;
                    break;
                }
                Err(e) => {
                    failures += 1;
                    warn!(plugin_id = %state.id, attempt = failures, "Reconnect failed: {}", e);
                    e.is_retryable()
                }
            };

            // Refused registrations do not heal by redialing
            let exhausted =
                config.max_reconnect_tries > 0 && failures >= config.max_reconnect_tries;
            if !retryable || exhausted {
                let reason = if retryable {
                    "host unreachable"
                } else {
                    "host refused reconnection"
                };
                if config.close_on_host_disconnect {
                    error!(plugin_id = %state.id, attempts = failures, "{}; stopping", reason);
                    state.begin_shutdown(reason);
                } else {
                    error!(
                        plugin_id = %state.id,
                        attempts = failures,
                        "{}; giving up reconnecting",
                        reason
                    );
                }
                break 'monitor;
            }

            tokio::select! {
                _ = tokio::time::sleep(config.reconnect_interval) => {}
                _ = state.cancel.cancelled() => break 'monitor,
            }
        }
    }
    debug!(plugin_id = %state.id, "Connection monitor stopped");
}
