//! Tether Host - launches plugin executables and supervises them.
//!
//! Starts the host's RPC server, starts every plugin named on the command
//! line and runs until Ctrl-C. The bound address is printed to stdout as
//! `TETHER_HOST_ADDRESS=<addr>` so wrapping tools can find it.

mod cli;

use anyhow::Result;
use clap::Parser;
use cli::Args;
use std::path::PathBuf;
use tether_core::singleton::PrimaryInstance;
use tether_core::{
    check_single_instance, CancellationToken, CommandMessage, InstanceRole, PluginHost,
    SingletonConfig,
};
use tracing::{debug, error, info, warn};
use tracing_subscriber::EnvFilter;

const APP_NAME: &str = "tether-host";

fn init_logging(debug: bool, json: bool) {
    let default_level = if debug { "debug" } else { "info" };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr);
    if json {
        builder.json().init();
    } else {
        builder.compact().init();
    }
}

async fn start_plugins(host: &PluginHost, paths: &[PathBuf]) {
    for path in paths {
        match host.start_plugin_by_path(path).await {
            Ok(id) => info!(plugin_id = %id, path = %path.display(), "Started plugin"),
            Err(e) => error!(path = %path.display(), "Failed to start plugin: {}", e),
        }
    }
}

/// Start plugins named by later invocations until `stop` fires, then
/// release the single-instance claim.
async fn forward_commands(
    host: PluginHost,
    mut instance: PrimaryInstance,
    stop: CancellationToken,
) {
    loop {
        let command = tokio::select! {
            command = instance.recv() => command,
            _ = stop.cancelled() => None,
        };
        let Some(command) = command else {
            break;
        };
        info!(pid = command.pid, "Received plugins from another instance");
        let forwarded =
            Args::try_parse_from(std::iter::once(APP_NAME.to_string()).chain(command.args));
        let paths: Vec<PathBuf> = match forwarded {
            Ok(forwarded) => forwarded
                .plugins
                .into_iter()
                .map(|p| command.work_dir.join(p))
                .collect(),
            Err(e) => {
                warn!("Ignoring forwarded command line: {}", e);
                continue;
            }
        };
        start_plugins(&host, &paths).await;
    }
    instance.close();
    debug!("Single-instance listener closed");
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    init_logging(args.debug, args.json_logs);

    let config = args.host_config()?;

    let mut primary = None;
    if args.single_instance {
        let singleton = SingletonConfig::new(APP_NAME);
        match check_single_instance(&singleton, CommandMessage::current()).await? {
            InstanceRole::Secondary { accepted } => {
                if accepted {
                    info!("Forwarded plugins to the running host");
                } else {
                    warn!("Running host is busy; plugins were not forwarded");
                }
                return Ok(());
            }
            InstanceRole::Primary(instance) => primary = Some(instance),
        }
    }

    info!("Starting tether host");
    let host = PluginHost::new(config);
    let address = host.start().await?;

    // Intentional stdout for tooling that launches the host
    println!("TETHER_HOST_ADDRESS={}", address);

    start_plugins(&host, &args.plugins).await;

    let forwarding = primary.take().map(|instance| {
        let stop = CancellationToken::new();
        let task = tokio::spawn(forward_commands(host.clone(), instance, stop.clone()));
        (stop, task)
    });

    host.wait().await;
    info!("Shutdown signal received");

    if let Some((stop, task)) = forwarding {
        stop.cancel();
        if let Err(e) = task.await {
            warn!("Forwarded command listener failed: {}", e);
        }
    }
    host.stop().await;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tether_core::HostConfig;

    #[tokio::test]
    async fn test_forwarding_listener_is_joined_on_shutdown() {
        let singleton = SingletonConfig::new(format!("tether-host-forwarding-{}", std::process::id()));
        let InstanceRole::Primary(instance) =
            check_single_instance(&singleton, CommandMessage::current()).await.unwrap()
        else {
            panic!("first claim must be primary");
        };

        let host = PluginHost::new(HostConfig::default());
        let stop = CancellationToken::new();
        let task = tokio::spawn(forward_commands(host.clone(), instance, stop.clone()));

        let forwarded = CommandMessage {
            args: vec!["./missing-plugin".to_string()],
            ..CommandMessage::current()
        };
        let role = check_single_instance(&singleton, forwarded).await.unwrap();
        assert!(matches!(role, InstanceRole::Secondary { accepted: true }));

        stop.cancel();
        tokio::time::timeout(Duration::from_secs(5), task)
            .await
            .expect("listener must finish once stopped")
            .unwrap();
        assert!(host.list_plugins().is_empty());
    }
}
