//! Functions and message handling served by the sample plugin.

use anyhow::{anyhow, bail, Context, Result};
use tether_core::{CallContext, MessageRequest, Parameter, ParameterType, Plugin, WeakPlugin};
use tracing::info;

pub fn register(plugin: &Plugin) {
    plugin.register_function("ReverseText", reverse_text);
    plugin.register_function("UpperCase", upper_case);
    plugin.register_function("Add", add);

    let weak = plugin.downgrade();
    plugin.register_function("TestHostCall", move |_ctx, _params| {
        let weak = weak.clone();
        async move { test_host_call(&weak).await }
    });

    let weak = plugin.downgrade();
    plugin.register_function("TestPluginCall", move |_ctx, params| {
        let weak = weak.clone();
        async move { test_plugin_call(&weak, params).await }
    });

    plugin.on_any_message(|message| async move {
        handle_message(&message);
        Ok(())
    });
}

fn first_text(params: &[Parameter]) -> Result<&str> {
    params
        .first()
        .map(|p| p.value.as_str())
        .ok_or_else(|| anyhow!("a text parameter is required"))
}

pub async fn reverse_text(_ctx: CallContext, params: Vec<Parameter>) -> Result<Parameter> {
    let reversed: String = first_text(&params)?.chars().rev().collect();
    Ok(Parameter::string("reversed_text", reversed))
}

pub async fn upper_case(_ctx: CallContext, params: Vec<Parameter>) -> Result<Parameter> {
    Ok(Parameter::string("upper_text", first_text(&params)?.to_uppercase()))
}

pub async fn add(_ctx: CallContext, params: Vec<Parameter>) -> Result<Parameter> {
    if params.len() < 2 {
        bail!("at least two numbers are required");
    }
    let mut sum = 0.0;
    for param in &params {
        let value: f64 = param
            .value
            .trim()
            .parse()
            .with_context(|| format!("{} is not a number", param.value))?;
        sum += value;
    }
    Ok(Parameter::new("sum", ParameterType::Float, format!("{:.2}", sum)))
}

fn alive(plugin: &WeakPlugin) -> Result<Plugin> {
    plugin.upgrade().ok_or_else(|| anyhow!("plugin is shutting down"))
}

async fn test_host_call(plugin: &WeakPlugin) -> Result<Parameter> {
    let response = alive(plugin)?
        .call_host_function("GetSystemTime", Vec::new())
        .await
        .context("calling host")?;
    if !response.success {
        bail!("host function failed: {}", response.message);
    }
    Ok(Parameter::string(
        "host_call_result",
        format!("host time: {}", response.value().unwrap_or_default()),
    ))
}

async fn test_plugin_call(plugin: &WeakPlugin, params: Vec<Parameter>) -> Result<Parameter> {
    if params.len() < 2 {
        bail!("expected the target plugin ID and a function name");
    }
    let mut params = params.into_iter();
    let target = params.next().unwrap_or_default().value;
    let function = params.next().unwrap_or_default().value;

    let response = alive(plugin)?
        .call_other_plugin(&target, &function, params.collect())
        .await
        .with_context(|| format!("calling {}", target))?;
    if !response.success {
        bail!("{} failed on {}: {}", function, target, response.message);
    }
    Ok(Parameter::string(
        "plugin_call_result",
        format!(
            "target: {}\nfunction: {}\nresult: {}",
            target,
            function,
            response.value().unwrap_or_default()
        ),
    ))
}

fn handle_message(message: &MessageRequest) {
    match message.message_type.as_str() {
        "notification" => info!(content = %message.content, "Notification received"),
        "command" => info!(content = %message.content, "Command received"),
        "data" => info!(content = %message.content, "Data received"),
        other => info!(message_type = other, content = %message.content, "Message of unknown type received"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tether_core::CancellationToken;

    fn ctx() -> CallContext {
        CallContext {
            request_id: "req".into(),
            metadata: Default::default(),
            cancel: CancellationToken::new(),
        }
    }

    #[tokio::test]
    async fn test_reverse_text_handles_unicode() {
        let result = reverse_text(ctx(), vec![Parameter::string("text", "héllo")])
            .await
            .unwrap();
        assert_eq!(result.name, "reversed_text");
        assert_eq!(result.value, "olléh");
    }

    #[tokio::test]
    async fn test_upper_case_requires_text() {
        assert!(upper_case(ctx(), vec![]).await.is_err());
        let result = upper_case(ctx(), vec![Parameter::string("text", "abc")])
            .await
            .unwrap();
        assert_eq!(result.value, "ABC");
    }

    #[tokio::test]
    async fn test_add_formats_two_decimals() {
        let result = add(
            ctx(),
            vec![Parameter::float("a", 1.5), Parameter::string("b", "2.25")],
        )
        .await
        .unwrap();
        assert_eq!(result.kind, ParameterType::Float);
        assert_eq!(result.value, "3.75");

        let err = add(ctx(), vec![Parameter::string("a", "1"), Parameter::string("b", "x")])
            .await
            .unwrap_err();
        assert!(err.to_string().contains("x is not a number"));
        assert!(add(ctx(), vec![Parameter::string("a", "1")]).await.is_err());
    }
}
