//! In-process host and plugin round trips over the real transport.
//!
//! Plugins here run inside the test process, so their host records are
//! created in `starting` state by hand instead of through a launcher.

use std::net::Ipv4Addr;
use std::time::{Duration, Instant};
use tether_core::rpc::{error_codes, metadata};
use tether_core::{
    CallRequest, HostConfig, MessageRequest, Metadata, Parameter, Plugin, PluginConfig,
    PluginEnvironment, PluginHost, PluginRecord, PluginStatus, TetherError,
};
use tokio::net::TcpListener;

async fn start_host() -> PluginHost {
    let host = PluginHost::new(
        HostConfig::default()
            .with_auto_restart(false)
            .with_connect_settle_delay(Duration::from_millis(20)),
    );
    let listener = TcpListener::bind((Ipv4Addr::LOCALHOST, 0)).await.unwrap();
    host.start_on(listener).unwrap();
    host
}

/// Connect an in-process plugin with `id` to `host` and wait until it runs.
async fn attach(host: &PluginHost, id: &str, config: PluginConfig) -> Plugin {
    host.registry().register(
        PluginRecord::new(id, format!("/in-process/{id}")).with_status(PluginStatus::Starting),
    );
    let plugin = Plugin::with_environment(
        config,
        PluginEnvironment {
            plugin_id: Some(id.to_string()),
            host_address: Some(host.address().unwrap().to_string()),
            launch_token: None,
        },
    );
    register_functions(&plugin);
    plugin.start().await.unwrap();

    wait_for_status(host, id, PluginStatus::Running).await;
    plugin
}

fn register_functions(plugin: &Plugin) {
    plugin.register_function("Echo", |_ctx, params: Vec<Parameter>| async move {
        Ok(params.into_iter().next().unwrap_or_default())
    });
    plugin.register_function("Upper", |ctx, params: Vec<Parameter>| async move {
        let text = params.into_iter().next().unwrap_or_default().value;
        let via_host = ctx.meta(metadata::VIA_HOST).unwrap_or("false").to_string();
        Ok(Parameter::string("upper", format!("{}|{}", text.to_uppercase(), via_host)))
    });
}

async fn wait_for_status(host: &PluginHost, id: &str, status: PluginStatus) {
    let deadline = Instant::now() + Duration::from_secs(5);
    while host.get_plugin(id).map(|r| r.status) != Some(status) {
        assert!(Instant::now() < deadline, "{id} never reached {status}");
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

fn config(name: &str) -> PluginConfig {
    PluginConfig::new(name, "1.0.0", "in-process test plugin")
}

#[tokio::test]
async fn test_host_to_plugin_round_trip() {
    let host = start_host().await;
    let plugin = attach(&host, "echo", config("Echo")).await;

    let record = host.get_plugin("echo").unwrap();
    assert_eq!(record.name, "Echo");
    assert_eq!(record.port, plugin.port().unwrap());
    assert_eq!(record.functions, vec!["Echo", "Upper"]);

    let request = CallRequest::new("Echo", vec![Parameter::string("a", "x")]);
    let request_id = request.request_id.clone();
    let response = host.call_plugin("echo", request).await.unwrap();
    assert!(response.success);
    assert_eq!(response.request_id, request_id);
    assert_eq!(response.value(), Some("x"));

    let response = host
        .call_plugin_function("echo", "Missing", vec![])
        .await
        .unwrap();
    assert!(!response.success);
    assert_eq!(response.error_code, error_codes::FUNCTION_NOT_FOUND);

    plugin.stop().await;
    host.stop().await;
}

#[tokio::test]
async fn test_plugin_calls_host_function() {
    let host = start_host().await;
    host.register_host_function("Double", |_ctx, params: Vec<Parameter>| async move {
        let n = params.into_iter().next().unwrap_or_default().as_i64()?;
        Ok(Parameter::int("doubled", n * 2))
    });
    let plugin = attach(&host, "caller", config("Caller")).await;

    let response = plugin
        .call_host_function("Double", vec![Parameter::int("n", 21)])
        .await
        .unwrap();
    assert!(response.success);
    assert_eq!(response.value(), Some("42"));

    let response = plugin.call_host_function("GetSystemTime", vec![]).await.unwrap();
    assert!(response.success);

    let response = plugin
        .call_host_function("Double", vec![Parameter::string("n", "abc")])
        .await
        .unwrap();
    assert_eq!(response.error_code, error_codes::FUNCTION_ERROR);

    plugin.stop().await;
    host.stop().await;
}

#[tokio::test]
async fn test_inter_plugin_relay() {
    let host = start_host().await;
    let caller = attach(&host, "caller", config("Caller")).await;
    let target = attach(&host, "target", config("Target")).await;

    let response = caller
        .call_other_plugin("target", "Upper", vec![Parameter::string("text", "hi")])
        .await
        .unwrap();
    assert!(response.success, "{}", response.message);
    assert_eq!(response.value(), Some("HI|true"));

    let response = caller
        .call_other_plugin("ghost", "Upper", vec![])
        .await
        .unwrap();
    assert!(!response.success);
    assert_eq!(response.error_code, error_codes::TARGET_PLUGIN_NOT_FOUND);

    target.stop().await;
    host.stop_plugin("target").await.unwrap();
    let response = caller.call_other_plugin("target", "Upper", vec![]).await.unwrap();
    assert_eq!(response.error_code, error_codes::TARGET_PLUGIN_NOT_RUNNING);

    caller.stop().await;
    host.stop().await;
}

#[tokio::test]
async fn test_relay_to_hung_target_answers_with_call_error() {
    let budget = Duration::from_millis(500);
    let host = PluginHost::new(
        HostConfig::default()
            .with_auto_restart(false)
            .with_call_timeout(budget)
            .with_connect_settle_delay(Duration::from_millis(20)),
    );
    let listener = TcpListener::bind((Ipv4Addr::LOCALHOST, 0)).await.unwrap();
    host.start_on(listener).unwrap();

    let caller = attach(&host, "caller", config("Caller").with_call_timeout(budget)).await;
    let target = attach(&host, "target", config("Target").with_call_timeout(budget)).await;
    target.register_function("Slow", |_ctx, _params: Vec<Parameter>| async move {
        tokio::time::sleep(Duration::from_secs(3)).await;
        Ok(Parameter::string("late", "too late"))
    });

    for _ in 0..3 {
        let started = Instant::now();
        let response = caller
            .call_other_plugin("target", "Slow", vec![])
            .await
            .expect("relay failures come back as a response");
        assert!(!response.success);
        assert_eq!(response.error_code, error_codes::INTER_PLUGIN_CALL_ERROR);
        assert!(started.elapsed() < Duration::from_secs(2));
    }

    target.stop().await;
    caller.stop().await;
    host.stop().await;
}

#[tokio::test]
async fn test_messages_and_status() {
    let host = start_host().await;
    let plugin = attach(&host, "inbox", config("Inbox")).await;
    let (seen_tx, mut seen_rx) = tokio::sync::mpsc::unbounded_channel();
    plugin.on_any_message(move |message: MessageRequest| {
        let seen_tx = seen_tx.clone();
        async move {
            let _ = seen_tx.send(message);
            Ok(())
        }
    });

    let mut tags = Metadata::new();
    tags.insert("priority".into(), "high".into());
    let response = host
        .send_message_to_plugin("inbox", "notification", "hello", tags)
        .await
        .unwrap();
    assert!(response.success);
    assert_eq!(response.processed_count, 1);
    let delivered = seen_rx.recv().await.unwrap();
    assert_eq!(delivered.content, "hello");
    assert_eq!(delivered.metadata.get("priority").map(String::as_str), Some("high"));

    let mut tags = Metadata::new();
    tags.insert("origin".into(), "broadcast".into());
    let results = host.broadcast_message("data", "payload", tags).await;
    assert_eq!(results.len(), 1);
    assert_eq!(results[0].0, "inbox");
    assert!(results[0].1.is_ok());
    let delivered = seen_rx.recv().await.unwrap();
    assert_eq!(delivered.message_type, "data");
    assert_eq!(delivered.metadata.get("origin").map(String::as_str), Some("broadcast"));

    let status = host.get_plugin_status("inbox", true).await.unwrap();
    assert_eq!(status.status, PluginStatus::Running);
    assert_eq!(status.metrics.get("messages_processed").map(String::as_str), Some("2"));

    plugin.stop().await;
    host.stop().await;
}

#[tokio::test]
async fn test_plugin_stops_after_losing_host() {
    let host = start_host().await;
    let plugin = attach(
        &host,
        "fragile",
        config("Fragile")
            .with_health_check(Duration::from_millis(50), Duration::from_millis(100))
            .with_reconnect(Duration::from_millis(50), 2)
            .with_close_on_host_disconnect(true),
    )
    .await;

    host.stop().await;

    tokio::time::timeout(Duration::from_secs(5), plugin.wait_for_shutdown())
        .await
        .expect("plugin should stop once the host is unreachable");
    plugin.stop().await;
    assert_eq!(plugin.status(), PluginStatus::Stopped);
}

#[tokio::test]
async fn test_plugin_stops_when_host_refuses_reconnection() {
    let host = start_host().await;
    let plugin = attach(
        &host,
        "drifter",
        config("Drifter")
            .with_health_check(Duration::from_millis(50), Duration::from_millis(100))
            .with_reconnect(Duration::from_millis(50), 0)
            .with_close_on_host_disconnect(true),
    )
    .await;

    // Unlimited retries, but the host no longer knows the plugin
    host.registry().unregister("drifter");

    tokio::time::timeout(Duration::from_secs(5), plugin.wait_for_shutdown())
        .await
        .expect("a refused re-registration should not be retried forever");
    plugin.stop().await;
    assert_eq!(plugin.status(), PluginStatus::Stopped);
    assert!(matches!(
        plugin.call_host_function("GetSystemTime", vec![]).await,
        Err(TetherError::ConnectionLost { .. })
    ));

    host.stop().await;
}
