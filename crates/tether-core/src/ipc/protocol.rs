//! Shared IPC protocol types and framing.
//!
//! Every connection between host and plugin carries a 4-byte big-endian
//! length prefix followed by a UTF-8 JSON-RPC 2.0 payload.
//!
//! ```text
//! [u32 BE: len][UTF-8 JSON bytes of len]
//! ```
//!
//! Requests on one connection are matched to responses by `id`, so several
//! calls may be in flight at once. Client-to-server streams use a dedicated
//! connection: an opening request carrying an `id`, any number of
//! [`STREAM_ITEM`] notifications, then one [`STREAM_END`] notification. The
//! server answers the opening request once the stream is drained.

use crate::config::IpcConfig;
use crate::{Result, TetherError};
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncReadExt, AsyncWriteExt};

/// Notification method carrying one element of an open stream.
pub const STREAM_ITEM: &str = "$/item";
/// Notification method closing an open stream.
pub const STREAM_END: &str = "$/end";

/// JSON-RPC 2.0 request for IPC.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IpcRequest {
    pub jsonrpc: String,
    pub method: String,
    #[serde(default)]
    pub params: Option<serde_json::Value>,
    /// Absent for notifications, which receive no response.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<serde_json::Value>,
}

impl IpcRequest {
    /// Create a new JSON-RPC 2.0 request.
    pub fn new(method: impl Into<String>, params: serde_json::Value, id: u64) -> Self {
        Self {
            jsonrpc: "2.0".to_string(),
            method: method.into(),
            params: Some(params),
            id: Some(serde_json::Value::Number(id.into())),
        }
    }

    /// Create a notification (a request without an `id`).
    pub fn notification(method: impl Into<String>, params: serde_json::Value) -> Self {
        Self {
            jsonrpc: "2.0".to_string(),
            method: method.into(),
            params: Some(params),
            id: None,
        }
    }

    pub fn is_notification(&self) -> bool {
        self.id.is_none()
    }
}

/// JSON-RPC 2.0 response for IPC.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IpcResponse {
    pub jsonrpc: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<IpcError>,
    pub id: Option<serde_json::Value>,
}

impl IpcResponse {
    /// Create a success response.
    pub fn success(id: Option<serde_json::Value>, result: serde_json::Value) -> Self {
        Self {
            jsonrpc: "2.0".to_string(),
            result: Some(result),
            error: None,
            id,
        }
    }

    /// Create an error response.
    pub fn error(id: Option<serde_json::Value>, code: i32, message: String) -> Self {
        Self {
            jsonrpc: "2.0".to_string(),
            result: None,
            error: Some(IpcError {
                code,
                message,
                data: None,
            }),
            id,
        }
    }

    /// Create a response from a dispatch outcome.
    pub fn from_result(id: Option<serde_json::Value>, result: Result<serde_json::Value>) -> Self {
        match result {
            Ok(value) => Self::success(id, value),
            Err(e) => Self::error(id, e.to_rpc_error_code(), e.to_string()),
        }
    }

    /// Numeric request id, when the peer used one.
    pub fn numeric_id(&self) -> Option<u64> {
        self.id.as_ref().and_then(|id| id.as_u64())
    }

    /// Convert into the call result seen by the requesting side.
    pub fn into_result(self) -> Result<serde_json::Value> {
        if let Some(err) = self.error {
            return Err(err.into());
        }
        self.result
            .ok_or_else(|| TetherError::Other("IPC response missing result".to_string()))
    }
}

/// JSON-RPC 2.0 error object.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IpcError {
    pub code: i32,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<serde_json::Value>,
}

impl From<IpcError> for TetherError {
    fn from(err: IpcError) -> Self {
        if err.code == -32601 {
            TetherError::MethodNotFound {
                method: err.message,
            }
        } else {
            TetherError::Rpc {
                code: err.code,
                message: err.message,
            }
        }
    }
}

/// Read a length-prefixed frame from an async reader.
///
/// Frame format: `[4-byte BE u32 length][payload bytes]`
///
/// Returns `None` on clean EOF (peer closed connection).
pub async fn read_frame<R: AsyncReadExt + Unpin>(reader: &mut R) -> Result<Option<Vec<u8>>> {
    let mut len_buf = [0u8; 4];
    match reader.read_exact(&mut len_buf).await {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e.into()),
    }

    let len = u32::from_be_bytes(len_buf) as usize;

    if len > IpcConfig::MAX_FRAME_SIZE {
        return Err(TetherError::Validation {
            field: "ipc_frame".to_string(),
            message: format!(
                "IPC message size {} exceeds maximum {}",
                len,
                IpcConfig::MAX_FRAME_SIZE
            ),
        });
    }

    let mut payload = vec![0u8; len];
    reader.read_exact(&mut payload).await?;

    Ok(Some(payload))
}

/// Write a length-prefixed frame to an async writer.
///
/// Frame format: `[4-byte BE u32 length][payload bytes]`
pub async fn write_frame<W: AsyncWriteExt + Unpin>(writer: &mut W, payload: &[u8]) -> Result<()> {
    if payload.len() > IpcConfig::MAX_FRAME_SIZE {
        return Err(TetherError::Validation {
            field: "ipc_frame".to_string(),
            message: format!(
                "IPC message size {} exceeds maximum {}",
                payload.len(),
                IpcConfig::MAX_FRAME_SIZE
            ),
        });
    }
    let len = payload.len() as u32;
    writer.write_all(&len.to_be_bytes()).await?;
    writer.write_all(payload).await?;
    writer.flush().await?;
    Ok(())
}

/// Serialize a JSON-RPC message and write it as one frame.
pub async fn write_message<W, T>(writer: &mut W, message: &T) -> Result<()>
where
    W: AsyncWriteExt + Unpin,
    T: Serialize,
{
    let bytes = serde_json::to_vec(message)?;
    write_frame(writer, &bytes).await
}
