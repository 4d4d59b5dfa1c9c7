//! TCP IPC server shared by the host and plugin runtimes.
//!
//! The host binds one of a configured port range; plugins bind an
//! OS-assigned loopback port. Each accepted connection gets a reader task
//! that parses frames and a writer task that serializes responses, so
//! requests on one connection are dispatched concurrently and answered in
//! completion order.
//!
//! # Thread Safety
//!
//! The dispatcher is shared via `Arc` across every connection and request
//! task; implementations synchronize their own state.

use super::protocol::{
    read_frame, write_message, IpcRequest, IpcResponse, STREAM_END, STREAM_ITEM,
};
use crate::config::IpcConfig;
use crate::{Result, TetherError};
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::net::tcp::OwnedWriteHalf;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

/// Handle to a running IPC server. Dropping shuts down the server.
#[derive(Debug)]
pub struct IpcServerHandle {
    pub addr: SocketAddr,
    pub port: u16,
    shutdown_tx: Option<oneshot::Sender<()>>,
    conn_shutdown_tx: watch::Sender<bool>,
    task_handle: Option<tokio::task::JoinHandle<()>>,
}

impl IpcServerHandle {
    /// Get the address the server is listening on.
    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// Shut down the server.
    ///
    /// Stops accepting new connections and signals all active connection
    /// handlers to close. In-flight requests are abandoned.
    pub fn shutdown(&mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
        let _ = self.conn_shutdown_tx.send(true);
    }
}

impl Drop for IpcServerHandle {
    fn drop(&mut self) {
        self.shutdown();
        if let Some(handle) = self.task_handle.take() {
            handle.abort();
        }
    }
}

/// Trait for dispatching IPC method calls.
///
/// Implemented by the host and plugin services.
#[async_trait::async_trait]
pub trait IpcDispatch: Send + Sync + 'static {
    /// Dispatch a JSON-RPC method call and return the result.
    async fn dispatch(&self, method: &str, params: serde_json::Value) -> Result<serde_json::Value>;

    /// Whether `method` opens a client-to-server stream.
    fn accepts_stream(&self, _method: &str) -> bool {
        false
    }

    /// Consume a stream opened with `method`. `items` ends when the peer
    /// sends the end marker.
    async fn dispatch_stream(
        &self,
        method: &str,
        _params: serde_json::Value,
        _items: mpsc::Receiver<serde_json::Value>,
    ) -> Result<serde_json::Value> {
        Err(TetherError::MethodNotFound {
            method: method.to_string(),
        })
    }
}

/// IPC server that listens for connections.
pub struct IpcServer;

impl IpcServer {
    /// Start the IPC server on an OS-assigned loopback port.
    pub async fn start<D: IpcDispatch>(dispatch: Arc<D>) -> Result<IpcServerHandle> {
        let listener = TcpListener::bind((Ipv4Addr::LOCALHOST, 0)).await?;
        Self::start_on(listener, dispatch)
    }

    /// Bind the first free port of the inclusive range `[start, end]`.
    pub async fn bind_in_range(address: IpAddr, start: u16, end: u16) -> Result<TcpListener> {
        for port in start..=end {
            match TcpListener::bind((address, port)).await {
                Ok(listener) => return Ok(listener),
                Err(e) => debug!("Port {} unavailable: {}", port, e),
            }
        }
        Err(TetherError::NoAvailablePort { start, end })
    }

    /// Start serving on an already bound listener.
    ///
    /// The server runs in background tokio tasks.
    pub fn start_on<D: IpcDispatch>(listener: TcpListener, dispatch: Arc<D>) -> Result<IpcServerHandle> {
        let addr = listener.local_addr()?;
        let port = addr.port();

        info!("IPC server listening on {}", addr);

        let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();
        let (conn_shutdown_tx, conn_shutdown_rx) = watch::channel(false);
        let active_connections = Arc::new(AtomicUsize::new(0));

        let task_handle = tokio::spawn(Self::accept_loop(
            listener,
            dispatch,
            shutdown_rx,
            conn_shutdown_rx,
            active_connections,
        ));

        Ok(IpcServerHandle {
            addr,
            port,
            shutdown_tx: Some(shutdown_tx),
            conn_shutdown_tx,
            task_handle: Some(task_handle),
        })
    }

    async fn accept_loop<D: IpcDispatch>(
        listener: TcpListener,
        dispatch: Arc<D>,
        mut shutdown_rx: oneshot::Receiver<()>,
        conn_shutdown_rx: watch::Receiver<bool>,
        active_connections: Arc<AtomicUsize>,
    ) {
        loop {
            tokio::select! {
                _ = &mut shutdown_rx => {
                    info!("IPC server shutting down");
                    break;
                }
                accept_result = listener.accept() => {
                    match accept_result {
                        Ok((stream, peer_addr)) => {
                            let current = active_connections.load(Ordering::Relaxed);
                            if current >= IpcConfig::MAX_CONNECTIONS {
                                warn!(
                                    "Rejecting IPC connection from {}: at max capacity ({})",
                                    peer_addr,
                                    IpcConfig::MAX_CONNECTIONS
                                );
                                continue;
                            }

                            active_connections.fetch_add(1, Ordering::Relaxed);
                            let dispatch = dispatch.clone();
                            let conns = active_connections.clone();
                            let conn_shutdown = conn_shutdown_rx.clone();

                            tokio::spawn(async move {
                                debug!("IPC connection from {}", peer_addr);
                                if let Err(e) = Self::handle_connection(stream, dispatch, conn_shutdown).await {
                                    debug!("IPC connection {} ended: {}", peer_addr, e);
                                }
                                conns.fetch_sub(1, Ordering::Relaxed);
                            });
                        }
                        Err(e) => {
                            error!("IPC accept error: {}", e);
                        }
                    }
                }
            }
        }
    }

    async fn handle_connection<D: IpcDispatch>(
        stream: TcpStream,
        dispatch: Arc<D>,
        mut shutdown_rx: watch::Receiver<bool>,
    ) -> Result<()> {
        let (mut reader, writer) = stream.into_split();
        let (resp_tx, resp_rx) = mpsc::channel::<IpcResponse>(IpcConfig::RESPONSE_QUEUE_DEPTH);
        let writer_task = tokio::spawn(Self::write_loop(writer, resp_rx));

        let mut in_flight = JoinSet::new();
        let mut stream_items: Option<mpsc::Sender<serde_json::Value>> = None;

        let outcome = loop {
            let frame = tokio::select! {
                result = read_frame(&mut reader) => {
                    match result {
                        Ok(Some(f)) => f,
                        Ok(None) => break Ok(()),
                        Err(e) => break Err(e),
                    }
                }
                _ = shutdown_rx.changed() => break Ok(()),
            };

            while in_flight.try_join_next().is_some() {}

            let request: IpcRequest = match serde_json::from_slice(&frame) {
                Ok(req) => req,
                Err(e) => {
                    let resp = IpcResponse::error(None, -32700, format!("Parse error: {}", e));
                    if resp_tx.send(resp).await.is_err() {
                        break Ok(());
                    }
                    continue;
                }
            };

            if request.jsonrpc != "2.0" {
                let resp = IpcResponse::error(
                    request.id,
                    -32600,
                    "Invalid Request: expected jsonrpc 2.0".to_string(),
                );
                if resp_tx.send(resp).await.is_err() {
                    break Ok(());
                }
                continue;
            }

            let params = request
                .params
                .unwrap_or(serde_json::Value::Object(Default::default()));

            match request.method.as_str() {
                STREAM_ITEM => {
                    match &stream_items {
                        // A handler that stopped reading early is not an error here
                        Some(items) => {
                            let _ = items.send(params).await;
                        }
                        None => debug!("Dropping stream item with no open stream"),
                    }
                    continue;
                }
                STREAM_END => {
                    stream_items = None;
                    continue;
                }
                _ => {}
            }

            let id = request.id;
            let method = request.method;
            let dispatch = dispatch.clone();

            if dispatch.accepts_stream(&method) {
                let (items_tx, items_rx) = mpsc::channel(IpcConfig::STREAM_BUFFER);
                stream_items = Some(items_tx);
                let resp_tx = resp_tx.clone();
                in_flight.spawn(async move {
                    let result = dispatch.dispatch_stream(&method, params, items_rx).await;
                    if id.is_some() {
                        let _ = resp_tx.send(IpcResponse::from_result(id, result)).await;
                    }
                });
                continue;
            }

            let resp_tx = resp_tx.clone();
            in_flight.spawn(async move {
                let result = dispatch.dispatch(&method, params).await;
                if id.is_some() {
                    let _ = resp_tx.send(IpcResponse::from_result(id, result)).await;
                } else if let Err(e) = result {
                    debug!("Notification {} failed: {}", method, e);
                }
            });
        };

        // Peer is gone or the server is stopping; nobody can receive these answers
        in_flight.abort_all();
        drop(stream_items);
        drop(resp_tx);
        let _ = writer_task.await;
        outcome
    }

    async fn write_loop(mut writer: OwnedWriteHalf, mut responses: mpsc::Receiver<IpcResponse>) {
        while let Some(response) = responses.recv().await {
            if let Err(e) = write_message(&mut writer, &response).await {
                debug!("IPC write failed: {}", e);
                break;
            }
        }
    }
}
