//! Sample tether plugin.
//!
//! Serves text and math functions, calls back into its host and into other
//! plugins through the host, and logs pushed messages by type. Run with
//! `--info` to print its descriptor.

mod functions;

use std::process::ExitCode;
use tether_core::{Plugin, PluginConfig};
use tracing_subscriber::EnvFilter;

fn sample_plugin() -> Plugin {
    let config = PluginConfig::new(
        "SamplePlugin",
        "1.0.0",
        "Sample plugin with text processing, math and inter-plugin calls",
    )
    .with_id("sample-plugin")
    .with_capabilities(["text_processing", "math_calculation", "inter_plugin_call"]);

    let plugin = Plugin::new(config);
    functions::register(&plugin);
    plugin
}

#[tokio::main]
async fn main() -> ExitCode {
    // Stdout carries the metadata query reply; logs go to stderr
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_target(false)
        .with_writer(std::io::stderr)
        .compact()
        .init();

    sample_plugin().run_cli().await
}
