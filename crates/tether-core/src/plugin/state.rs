//! State shared by a plugin's public handle, its service and its link tasks.

use crate::cancel::CancellationToken;
use crate::config::PluginConfig;
use crate::functions::FunctionTable;
use crate::ipc::IpcServerHandle;
use crate::registry::PluginStatus;
use crate::rpc::{HostClient, MessageRequest};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::AtomicU64;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};
use tokio::task::JoinSet;
use tracing::{debug, info};

/// Receives pushed messages of one type.
#[async_trait]
pub trait MessageHandler: Send + Sync {
    async fn handle(&self, message: MessageRequest) -> anyhow::Result<()>;
}

#[async_trait]
impl<F, Fut> MessageHandler for F
where
    F: Fn(MessageRequest) -> Fut + Send + Sync,
    Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
{
    async fn handle(&self, message: MessageRequest) -> anyhow::Result<()> {
        (self)(message).await
    }
}

#[derive(Default)]
pub(crate) struct MessageHandlers {
    by_type: HashMap<String, Arc<dyn MessageHandler>>,
    fallback: Option<Arc<dyn MessageHandler>>,
}

impl MessageHandlers {
    pub(crate) fn resolve(&self, message_type: &str) -> Option<Arc<dyn MessageHandler>> {
        self.by_type
            .get(message_type)
            .or(self.fallback.as_ref())
            .cloned()
    }

    pub(crate) fn insert(&mut self, message_type: String, handler: Arc<dyn MessageHandler>) {
        self.by_type.insert(message_type, handler);
    }

    pub(crate) fn set_fallback(&mut self, handler: Arc<dyn MessageHandler>) {
        self.fallback = Some(handler);
    }
}

pub(crate) struct PluginState {
    pub(crate) config: PluginConfig,
    pub(crate) id: String,
    pub(crate) host_address: String,
    pub(crate) launch_token: Option<String>,
    pub(crate) functions: FunctionTable,
    pub(crate) handlers: RwLock<MessageHandlers>,
    pub(crate) status: Mutex<PluginStatus>,
    pub(crate) started_at: Mutex<Option<DateTime<Utc>>>,
    pub(crate) port: Mutex<Option<u16>>,
    pub(crate) host: Mutex<Option<Arc<HostClient>>>,
    pub(crate) calls_served: AtomicU64,
    pub(crate) messages_processed: AtomicU64,
    /// Stops the background loops.
    pub(crate) cancel: CancellationToken,
    /// Resolves [`Plugin::wait_for_shutdown`](super::Plugin::wait_for_shutdown).
    pub(crate) shutdown: CancellationToken,
    pub(crate) tasks: Mutex<JoinSet<()>>,
    pub(crate) server: Mutex<Option<IpcServerHandle>>,
}

impl PluginState {
    pub(crate) fn status(&self) -> PluginStatus {
        *lock(&self.status)
    }

    pub(crate) fn set_status(&self, status: PluginStatus) {
        *lock(&self.status) = status;
    }

    pub(crate) fn host_client(&self) -> Option<Arc<HostClient>> {
        lock(&self.host).clone()
    }

    pub(crate) fn set_host_client(&self, client: Option<Arc<HostClient>>) {
        *lock(&self.host) = client;
    }

    pub(crate) fn uptime_secs(&self) -> u64 {
        lock(&self.started_at)
            .map(|t| (Utc::now() - t).num_seconds().max(0) as u64)
            .unwrap_or(0)
    }

    pub(crate) fn spawn_task<F>(&self, task: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        if self.cancel.is_cancelled() {
            debug!("Plugin is stopping; not spawning task");
            return;
        }
        let mut tasks = lock(&self.tasks);
        while tasks.try_join_next().is_some() {}
        tasks.spawn(task);
    }

    /// Stop serving and signal every loop to exit. Idempotent.
    ///
    /// Safe to call from inside a background task; joining happens in
    /// [`Plugin::stop`](super::Plugin::stop).
    pub(crate) fn begin_shutdown(&self, reason: &str) {
        if self.cancel.is_cancelled() {
            return;
        }
        info!(plugin_id = %self.id, reason, "Plugin shutting down");
        if self.status().is_active() {
            self.set_status(PluginStatus::Stopping);
        }
        self.cancel.cancel();
        if let Some(mut server) = lock(&self.server).take() {
            server.shutdown();
        }
        self.shutdown.cancel();
    }
}

pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

pub(crate) fn read_handlers(handlers: &RwLock<MessageHandlers>) -> std::sync::RwLockReadGuard<'_, MessageHandlers> {
    handlers.read().unwrap_or_else(PoisonError::into_inner)
}

pub(crate) fn write_handlers(handlers: &RwLock<MessageHandlers>) -> std::sync::RwLockWriteGuard<'_, MessageHandlers> {
    handlers.write().unwrap_or_else(PoisonError::into_inner)
}
