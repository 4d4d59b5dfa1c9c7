//! Request and response bodies carried in JSON-RPC `params` / `result`.

use crate::registry::PluginStatus;
use crate::{Result, TetherError};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Free-form string metadata attached to calls and messages.
pub type Metadata = HashMap<String, String>;

/// Declared type of a [`Parameter`] value.
///
/// The protocol does not check that `value` actually parses as this type.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ParameterType {
    #[default]
    String,
    Int,
    Float,
    Bool,
    Json,
    Bytes,
}

/// A named, typed, string-encoded value.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Parameter {
    pub name: String,
    #[serde(rename = "type", default)]
    pub kind: ParameterType,
    #[serde(default)]
    pub value: String,
}

impl Parameter {
    pub fn new(name: impl Into<String>, kind: ParameterType, value: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            kind,
            value: value.into(),
        }
    }

    pub fn string(name: impl Into<String>, value: impl Into<String>) -> Self {
        Self::new(name, ParameterType::String, value)
    }

    pub fn int(name: impl Into<String>, value: i64) -> Self {
        Self::new(name, ParameterType::Int, value.to_string())
    }

    pub fn float(name: impl Into<String>, value: f64) -> Self {
        Self::new(name, ParameterType::Float, value.to_string())
    }

    pub fn bool(name: impl Into<String>, value: bool) -> Self {
        Self::new(name, ParameterType::Bool, value.to_string())
    }

    pub fn json(name: impl Into<String>, value: &serde_json::Value) -> Self {
        Self::new(name, ParameterType::Json, value.to_string())
    }

    /// Parse the value as an integer.
    pub fn as_i64(&self) -> Result<i64> {
        self.value.trim().parse().map_err(|e| self.invalid("integer", e))
    }

    /// Parse the value as a float.
    pub fn as_f64(&self) -> Result<f64> {
        self.value.trim().parse().map_err(|e| self.invalid("number", e))
    }

    /// Parse the value as a boolean (`true` / `false`).
    pub fn as_bool(&self) -> Result<bool> {
        self.value.trim().parse().map_err(|e| self.invalid("boolean", e))
    }

    /// Parse the value as JSON.
    pub fn as_json(&self) -> Result<serde_json::Value> {
        serde_json::from_str(&self.value).map_err(|e| self.invalid("JSON", e))
    }

    fn invalid(&self, expected: &str, err: impl std::fmt::Display) -> TetherError {
        TetherError::Validation {
            field: self.name.clone(),
            message: format!("{:?} is not a valid {}: {}", self.value, expected, err),
        }
    }
}

/// Function invocation, in either direction.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CallRequest {
    pub function_name: String,
    #[serde(default)]
    pub parameters: Vec<Parameter>,
    #[serde(default)]
    pub request_id: String,
    #[serde(default)]
    pub metadata: Metadata,
}

impl CallRequest {
    /// Build a request with a fresh random request id.
    pub fn new(function_name: impl Into<String>, parameters: Vec<Parameter>) -> Self {
        Self {
            function_name: function_name.into(),
            parameters,
            request_id: uuid::Uuid::new_v4().to_string(),
            metadata: Metadata::new(),
        }
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    /// Plugin a relay call is addressed to, if any.
    pub fn target_plugin_id(&self) -> Option<&str> {
        self.metadata
            .get(super::metadata::TARGET_PLUGIN_ID)
            .map(String::as_str)
            .filter(|id| !id.is_empty())
    }
}

/// Outcome of a function invocation.
///
/// Routing and user-function failures are carried here with an error code,
/// never as a transport error.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CallResponse {
    pub success: bool,
    #[serde(default)]
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Parameter>,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub error_code: String,
    #[serde(default)]
    pub request_id: String,
}

impl CallResponse {
    pub fn ok(request_id: impl Into<String>, result: Parameter) -> Self {
        Self {
            success: true,
            message: "call succeeded".to_string(),
            result: Some(result),
            error_code: String::new(),
            request_id: request_id.into(),
        }
    }

    pub fn failure(
        request_id: impl Into<String>,
        error_code: &str,
        message: impl Into<String>,
    ) -> Self {
        Self {
            success: false,
            message: message.into(),
            result: None,
            error_code: error_code.to_string(),
            request_id: request_id.into(),
        }
    }

    /// Result value of a successful call.
    pub fn value(&self) -> Option<&str> {
        self.result.as_ref().map(|p| p.value.as_str())
    }
}

/// Push-style notification delivered over a message stream.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MessageRequest {
    pub message_id: String,
    pub message_type: String,
    #[serde(default)]
    pub content: String,
    /// Unix seconds.
    #[serde(default)]
    pub timestamp: i64,
    #[serde(default)]
    pub metadata: Metadata,
}

impl MessageRequest {
    pub fn new(message_type: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            message_id: uuid::Uuid::new_v4().to_string(),
            message_type: message_type.into(),
            content: content.into(),
            timestamp: chrono::Utc::now().timestamp(),
            metadata: Metadata::new(),
        }
    }
}

/// Acknowledgement returned when a message stream ends.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageResponse {
    pub success: bool,
    #[serde(default)]
    pub message: String,
    pub processed_count: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegisterRequest {
    pub plugin_id: String,
    pub plugin_name: String,
    pub version: String,
    #[serde(default)]
    pub description: String,
    /// The plugin's inbound server port.
    pub port: u16,
    #[serde(default)]
    pub capabilities: Vec<String>,
    #[serde(default)]
    pub functions: Vec<String>,
    /// Token the host injected at spawn; absent for manually started plugins.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub launch_token: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegisterResponse {
    pub success: bool,
    #[serde(default)]
    pub message: String,
    #[serde(default)]
    pub host_id: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HeartbeatRequest {
    pub plugin_id: String,
    /// Unix seconds.
    pub timestamp: i64,
    pub status: PluginStatus,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct HeartbeatResponse {
    pub success: bool,
    #[serde(default)]
    pub message: String,
    /// Unix seconds.
    #[serde(default)]
    pub server_timestamp: i64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Debug,
    #[default]
    Info,
    Warn,
    Error,
}

impl std::fmt::Display for LogLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            LogLevel::Debug => "debug",
            LogLevel::Info => "info",
            LogLevel::Warn => "warn",
            LogLevel::Error => "error",
        };
        write!(f, "{}", s)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogRequest {
    pub plugin_id: String,
    pub level: LogLevel,
    /// Unix seconds.
    pub timestamp: i64,
    pub message: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogResponse {
    pub success: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusRequest {
    #[serde(default)]
    pub include_metrics: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusResponse {
    pub status: PluginStatus,
    /// Seconds since the plugin started.
    pub uptime: u64,
    pub active_functions: Vec<String>,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub metrics: HashMap<String, String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShutdownRequest {
    #[serde(default)]
    pub reason: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShutdownResponse {
    pub success: bool,
    #[serde(default)]
    pub message: String,
}

/// Static plugin metadata printed in metadata query mode.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PluginDescriptor {
    pub id: String,
    pub name: String,
    pub version: String,
    #[serde(default)]
    pub description: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub logo: String,
    #[serde(default)]
    pub capabilities: Vec<String>,
    #[serde(default)]
    pub functions: Vec<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parameter_wire_format() {
        let param = Parameter::string("a", "x");
        let json = serde_json::to_value(&param).unwrap();
        assert_eq!(json, serde_json::json!({"name": "a", "type": "STRING", "value": "x"}));

        let parsed: Parameter =
            serde_json::from_value(serde_json::json!({"name": "n", "type": "FLOAT", "value": "2.5"}))
                .unwrap();
        assert_eq!(parsed.kind, ParameterType::Float);
        assert_eq!(parsed.as_f64().unwrap(), 2.5);
    }

    #[test]
    fn test_parameter_parse_failure_names_field() {
        let param = Parameter::new("count", ParameterType::Int, "seven");
        match param.as_i64() {
            Err(TetherError::Validation { field, .. }) => assert_eq!(field, "count"),
            other => panic!("Expected Validation error, got {:?}", other),
        }
    }

    #[test]
    fn test_target_plugin_id_ignores_empty_value() {
        let req = CallRequest::new("Echo", vec![]);
        assert_eq!(req.target_plugin_id(), None);

        let req = req.with_metadata("target_plugin_id", "");
        assert_eq!(req.target_plugin_id(), None);

        let req = req.with_metadata("target_plugin_id", "other");
        assert_eq!(req.target_plugin_id(), Some("other"));
    }

    #[test]
    fn test_failure_response_shape() {
        let resp = CallResponse::failure("r1", "FUNCTION_NOT_FOUND", "function Nope not found");
        let json = serde_json::to_value(&resp).unwrap();
        assert_eq!(json["success"], false);
        assert_eq!(json["error_code"], "FUNCTION_NOT_FOUND");
        assert_eq!(json["request_id"], "r1");
        assert!(json.get("result").is_none());
    }

    #[test]
    fn test_descriptor_omits_empty_logo() {
        let descriptor = PluginDescriptor {
            id: "p".into(),
            name: "P".into(),
            version: "1.0.0".into(),
            ..Default::default()
        };
        let json = serde_json::to_string(&descriptor).unwrap();
        assert!(!json.contains("logo"));
        assert!(json.contains("\"functions\":[]"));
    }
}
