//! End-to-end tests running the sample plugin as a real child process.

use std::net::Ipv4Addr;
use std::path::PathBuf;
use std::time::{Duration, Instant};
use tether_core::{HostConfig, Metadata, Parameter, PluginDescriptor, PluginHost, PluginStatus};
use tokio::net::TcpListener;

fn plugin_binary() -> PathBuf {
    PathBuf::from(env!("CARGO_BIN_EXE_tether-sample-plugin"))
}

async fn start_host(config: HostConfig) -> PluginHost {
    let host = PluginHost::new(config.with_connect_settle_delay(Duration::from_millis(100)));
    let listener = TcpListener::bind((Ipv4Addr::LOCALHOST, 0)).await.unwrap();
    host.start_on(listener).unwrap();
    host
}

async fn wait_until(host: &PluginHost, id: &str, what: &str, check: impl Fn(&tether_core::PluginRecord) -> bool) {
    let deadline = Instant::now() + Duration::from_secs(20);
    loop {
        if host.get_plugin(id).as_ref().map(&check).unwrap_or(false) {
            return;
        }
        assert!(Instant::now() < deadline, "timed out waiting for {what}");
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
}

#[tokio::test]
async fn test_info_mode_prints_descriptor_and_exits() {
    let output = tokio::time::timeout(
        Duration::from_secs(10),
        tokio::process::Command::new(plugin_binary())
            .arg("--info")
            .output(),
    )
    .await
    .expect("metadata query must terminate")
    .unwrap();

    assert!(output.status.success());
    let stdout = String::from_utf8(output.stdout).unwrap();
    let descriptor: PluginDescriptor = serde_json::from_str(stdout.trim()).unwrap();
    assert_eq!(descriptor.id, "sample-plugin");
    assert_eq!(descriptor.name, "SamplePlugin");
    for function in ["Add", "ReverseText", "TestHostCall", "TestPluginCall", "UpperCase"] {
        assert!(descriptor.functions.iter().any(|f| f == function), "missing {function}");
    }
}

#[tokio::test]
async fn test_host_runs_sample_plugin() {
    let logs = tempfile::tempdir().unwrap();
    let host = start_host(HostConfig::default().with_log_dir(logs.path())).await;

    let info = host.query_plugin_info(plugin_binary()).await.unwrap();
    assert_eq!(info.id, "sample-plugin");

    let id = host.start_plugin_by_path(plugin_binary()).await.unwrap();
    assert_eq!(id, "sample-plugin");
    wait_until(&host, &id, "running", |r| r.status == PluginStatus::Running).await;

    let response = host
        .call_plugin_function(&id, "ReverseText", vec![Parameter::string("text", "hello")])
        .await
        .unwrap();
    assert_eq!(response.value(), Some("olleh"));

    let response = host
        .call_plugin_function(
            &id,
            "Add",
            vec![Parameter::int("a", 1), Parameter::float("b", 2.0)],
        )
        .await
        .unwrap();
    assert_eq!(response.value(), Some("3.00"));

    let response = host
        .call_plugin_function(&id, "TestHostCall", vec![])
        .await
        .unwrap();
    assert!(response.success, "{}", response.message);
    assert!(response.value().unwrap().starts_with("host time: "));

    let response = host
        .send_message_to_plugin(&id, "notification", "hello", Metadata::new())
        .await
        .unwrap();
    assert_eq!(response.processed_count, 1);

    host.stop_plugin(&id).await.unwrap();
    assert_eq!(host.get_plugin(&id).unwrap().status, PluginStatus::Stopped);
    assert!(logs.path().join("sample-plugin.log").exists());

    host.stop().await;
}

#[tokio::test]
async fn test_exited_plugin_is_restarted() {
    let host = start_host(
        HostConfig::default()
            .with_max_restarts(1)
            .with_restart_backoff(Duration::from_millis(100)),
    )
    .await;

    let id = host.start_plugin_by_path(plugin_binary()).await.unwrap();
    wait_until(&host, &id, "running", |r| r.status == PluginStatus::Running).await;
    let first_pid = host.get_plugin(&id).unwrap().process.unwrap().pid();

    // A plugin that exits on its own while running has crashed
    let client = host.get_plugin(&id).unwrap().client.unwrap();
    assert!(client.shutdown("test").await.unwrap().success);

    wait_until(&host, &id, "restart", |r| {
        r.status == PluginStatus::Running && r.restart_count == 1
    })
    .await;
    let second_pid = host.get_plugin(&id).unwrap().process.unwrap().pid();
    assert_ne!(first_pid, second_pid);

    host.stop().await;
    assert_eq!(host.get_plugin(&id).unwrap().status, PluginStatus::Stopped);
}
