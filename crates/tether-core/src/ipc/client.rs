//! TCP IPC client used for host-to-plugin and plugin-to-host calls.
//!
//! One connection carries many concurrent calls. Requests are tagged with
//! an increasing id; a background reader task routes each response to the
//! caller waiting on that id.
//!
//! # Thread Safety
//!
//! Writes are serialized through a tokio `Mutex` around the write half.
//! The pending-call table is a std `Mutex` that is never held across an
//! await point.

use super::protocol::{read_frame, write_frame, IpcRequest, IpcResponse};
use crate::{Result, TetherError};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex, PoisonError};
use std::time::Duration;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::{oneshot, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

type PendingCalls = Arc<StdMutex<HashMap<u64, oneshot::Sender<IpcResponse>>>>;

/// Open a TCP connection with a deadline, mapping every failure to
/// [`TetherError::ConnectionLost`].
pub(crate) async fn connect_stream(addr: &str, timeout: Duration) -> Result<TcpStream> {
    let lost = || TetherError::ConnectionLost {
        addr: addr.to_string(),
    };
    let stream = tokio::time::timeout(timeout, TcpStream::connect(addr))
        .await
        .map_err(|_| lost())?
        .map_err(|_| lost())?;
    let _ = stream.set_nodelay(true);
    Ok(stream)
}

/// Multiplexed IPC client.
#[derive(Debug)]
pub struct IpcClient {
    writer: Mutex<OwnedWriteHalf>,
    pending: PendingCalls,
    closed: Arc<AtomicBool>,
    next_id: AtomicU64,
    addr: SocketAddr,
    reader_task: JoinHandle<()>,
}

impl IpcClient {
    /// Connect to an IPC server at `addr` (`host:port`).
    pub async fn connect(addr: &str, timeout: Duration) -> Result<Self> {
        let stream = connect_stream(addr, timeout).await?;
        let peer = stream.peer_addr()?;
        let (reader, writer) = stream.into_split();

        let pending: PendingCalls = Arc::default();
        let closed = Arc::new(AtomicBool::new(false));
        let reader_task = tokio::spawn(Self::read_loop(reader, pending.clone(), closed.clone(), peer));

        debug!("IPC client connected to {}", peer);

        Ok(Self {
            writer: Mutex::new(writer),
            pending,
            closed,
            next_id: AtomicU64::new(1),
            addr: peer,
            reader_task,
        })
    }

    /// Call a JSON-RPC method and wait up to `timeout` for its result.
    ///
    /// A broken connection yields `ConnectionLost`; an expired deadline
    /// yields `Timeout`. Neither affects other calls in flight.
    pub async fn call(
        &self,
        method: &str,
        params: serde_json::Value,
        timeout: Duration,
    ) -> Result<serde_json::Value> {
        if self.is_closed() {
            return Err(self.lost());
        }

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        let guard = PendingGuard {
            pending: &self.pending,
            id,
        };
        guard.insert(tx);

        let request_bytes = serde_json::to_vec(&IpcRequest::new(method, params, id))?;
        let written = {
            let mut writer = self.writer.lock().await;
            write_frame(&mut *writer, &request_bytes).await
        };
        if let Err(e) = written {
            if matches!(e, TetherError::Validation { .. }) {
                return Err(e);
            }
            debug!("IPC write to {} failed: {}", self.addr, e);
            self.closed.store(true, Ordering::SeqCst);
            return Err(self.lost());
        }

        let response = match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(response)) => response,
            Ok(Err(_)) => return Err(self.lost()),
            Err(_) => return Err(TetherError::Timeout(timeout)),
        };
        drop(guard);

        response.into_result()
    }

    /// Call a method with typed request and response bodies.
    pub async fn request<P, R>(&self, method: &str, params: &P, timeout: Duration) -> Result<R>
    where
        P: Serialize + ?Sized,
        R: DeserializeOwned,
    {
        let value = self
            .call(method, serde_json::to_value(params)?, timeout)
            .await?;
        serde_json::from_value(value).map_err(|e| TetherError::Json {
            message: format!("Failed to parse {} response: {}", method, e),
            source: Some(e),
        })
    }

    /// Whether the reader task has observed the connection closing.
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Get the address of the connected peer.
    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    fn lost(&self) -> TetherError {
        TetherError::ConnectionLost {
            addr: self.addr.to_string(),
        }
    }

    async fn read_loop(
        mut reader: OwnedReadHalf,
        pending: PendingCalls,
        closed: Arc<AtomicBool>,
        peer: SocketAddr,
    ) {
        loop {
            let frame = match read_frame(&mut reader).await {
                Ok(Some(frame)) => frame,
                Ok(None) => break,
                Err(e) => {
                    debug!("IPC read from {} failed: {}", peer, e);
                    break;
                }
            };

            let response: IpcResponse = match serde_json::from_slice(&frame) {
                Ok(resp) => resp,
                Err(e) => {
                    warn!("Discarding malformed IPC response from {}: {}", peer, e);
                    continue;
                }
            };

            let Some(id) = response.numeric_id() else {
                warn!("Discarding IPC response without id from {}", peer);
                continue;
            };

            let waiter = pending
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .remove(&id);
            match waiter {
                Some(tx) => {
                    let _ = tx.send(response);
                }
                None => debug!("No caller waiting for IPC response {} (timed out?)", id),
            }
        }

        closed.store(true, Ordering::SeqCst);
        // Dropping the senders wakes every waiting caller with ConnectionLost
        pending
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
    }
}

impl Drop for IpcClient {
    fn drop(&mut self) {
        self.reader_task.abort();
    }
}

/// Removes a pending call entry when the call finishes or its future is dropped.
struct PendingGuard<'a> {
    pending: &'a PendingCalls,
    id: u64,
}

impl PendingGuard<'_> {
    fn insert(&self, tx: oneshot::Sender<IpcResponse>) {
        self.pending
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(self.id, tx);
    }
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        self.pending
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&self.id);
    }
}
