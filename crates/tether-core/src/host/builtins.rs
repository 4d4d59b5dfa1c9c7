//! Host functions every host exposes to its plugins.

use super::state::HostState;
use crate::functions::{CallContext, FunctionTable};
use crate::rpc::Parameter;
use anyhow::anyhow;
use chrono::{Local, Utc};
use serde_json::json;
use std::sync::{Arc, Weak};

pub const GET_SYSTEM_TIME: &str = "GetSystemTime";
pub const GET_SYSTEM_INFO: &str = "GetSystemInfo";
pub const GET_PLUGIN_LIST: &str = "GetPluginList";

const TIME_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

pub(crate) fn register(functions: &FunctionTable, state: Weak<HostState>) {
    functions.register(GET_SYSTEM_TIME, |_ctx: CallContext, _params: Vec<Parameter>| async move {
        Ok(Parameter::string(
            "system_time",
            Local::now().format(TIME_FORMAT).to_string(),
        ))
    });

    let weak = state.clone();
    functions.register(GET_SYSTEM_INFO, move |_ctx: CallContext, _params: Vec<Parameter>| {
        let state = weak.upgrade();
        async move {
            let state = alive(state)?;
            let uptime = (Utc::now() - state.started_at).num_seconds().max(0);
            let info = json!({
                "os": std::env::consts::OS,
                "arch": std::env::consts::ARCH,
                "plugins": state.registry.count(),
                "uptime": uptime,
                "port": state.address().map(|a| a.port()).unwrap_or(0),
                "host_id": state.host_id,
            });
            Ok(Parameter::json("system_info", &info))
        }
    });

    functions.register(GET_PLUGIN_LIST, move |_ctx: CallContext, _params: Vec<Parameter>| {
        let state = state.upgrade();
        async move {
            let state = alive(state)?;
            let plugins: Vec<serde_json::Value> = state
                .registry
                .list()
                .into_iter()
                .map(|r| {
                    json!({
                        "id": r.id,
                        "name": r.name,
                        "status": r.status,
                        "port": r.port,
                    })
                })
                .collect();
            Ok(Parameter::json("plugin_list", &serde_json::Value::Array(plugins)))
        }
    });
}

fn alive(state: Option<Arc<HostState>>) -> anyhow::Result<Arc<HostState>> {
    state.ok_or_else(|| anyhow!("host is shut down"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::host::PluginHost;
    use crate::registry::PluginRecord;
    use crate::rpc::{CallRequest, ParameterType};
    use crate::HostConfig;

    #[tokio::test]
    async fn test_system_time_format() {
        let host = PluginHost::new(HostConfig::default());
        let response = host
            .state()
            .handle_call(CallRequest::new(GET_SYSTEM_TIME, vec![]))
            .await;
        assert!(response.success);

        let result = response.result.unwrap();
        assert_eq!(result.kind, ParameterType::String);
        assert!(chrono::NaiveDateTime::parse_from_str(&result.value, TIME_FORMAT).is_ok());
    }

    #[tokio::test]
    async fn test_plugin_list_reports_records() {
        let host = PluginHost::new(HostConfig::default());
        host.state()
            .registry
            .register(PluginRecord::new("alpha", "/bin/alpha"));

        let response = host
            .state()
            .handle_call(CallRequest::new(GET_PLUGIN_LIST, vec![]))
            .await;
        let list = response.result.unwrap().as_json().unwrap();
        assert_eq!(list[0]["id"], "alpha");
        assert_eq!(list[0]["status"], "stopped");

        let response = host
            .state()
            .handle_call(CallRequest::new(GET_SYSTEM_INFO, vec![]))
            .await;
        let info = response.result.unwrap().as_json().unwrap();
        assert_eq!(info["plugins"], 1);
        assert_eq!(info["os"], std::env::consts::OS);
    }
}
