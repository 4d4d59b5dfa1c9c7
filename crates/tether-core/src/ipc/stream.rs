//! Client side of a one-way stream over a dedicated IPC connection.

use super::client::connect_stream;
use super::protocol::{read_frame, write_message, IpcRequest, IpcResponse, STREAM_END, STREAM_ITEM};
use crate::{Result, TetherError};
use serde::Serialize;
use std::time::Duration;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};

/// An open stream. Items are sent with [`send`](Self::send); the server's
/// single reply is collected by [`finish`](Self::finish).
#[derive(Debug)]
pub struct IpcStream {
    reader: OwnedReadHalf,
    writer: OwnedWriteHalf,
    addr: String,
}

impl IpcStream {
    /// Connect to `addr` and open a stream with `method`.
    pub async fn open(
        addr: &str,
        method: &str,
        params: serde_json::Value,
        connect_timeout: Duration,
    ) -> Result<Self> {
        let stream = connect_stream(addr, connect_timeout).await?;
        let (reader, mut writer) = stream.into_split();
        write_message(&mut writer, &IpcRequest::new(method, params, 1)).await?;
        Ok(Self {
            reader,
            writer,
            addr: addr.to_string(),
        })
    }

    /// Send one item.
    pub async fn send<T: Serialize + ?Sized>(&mut self, item: &T) -> Result<()> {
        let note = IpcRequest::notification(STREAM_ITEM, serde_json::to_value(item)?);
        write_message(&mut self.writer, &note).await
    }

    /// Close the stream and wait up to `timeout` for the server's reply.
    pub async fn finish(mut self, timeout: Duration) -> Result<serde_json::Value> {
        let end = IpcRequest::notification(STREAM_END, serde_json::Value::Null);
        write_message(&mut self.writer, &end).await?;

        let frame = tokio::time::timeout(timeout, read_frame(&mut self.reader))
            .await
            .map_err(|_| TetherError::Timeout(timeout))??
            .ok_or_else(|| TetherError::ConnectionLost {
                addr: self.addr.clone(),
            })?;

        let response: IpcResponse = serde_json::from_slice(&frame)?;
        response.into_result()
    }
}
