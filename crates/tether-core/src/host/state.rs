//! State shared by every part of a running host.

use crate::cancel::CancellationToken;
use crate::config::HostConfig;
use crate::functions::FunctionTable;
use crate::ipc::IpcServerHandle;
use crate::process::PluginLauncher;
use crate::registry::PluginRegistry;
use chrono::{DateTime, Utc};
use std::future::Future;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::task::JoinSet;
use tracing::debug;

/// Everything a host owns.
///
/// Wrapped in `Arc` so supervised tasks and the inbound service can share
/// it. Long-lived tasks hold strong references until [`cancel`](Self::cancel)
/// fires; the inbound server only holds a weak one.
pub(crate) struct HostState {
    pub(crate) config: HostConfig,
    pub(crate) host_id: String,
    pub(crate) registry: PluginRegistry,
    pub(crate) functions: FunctionTable,
    pub(crate) launcher: Arc<dyn PluginLauncher>,
    /// Stops every supervised task.
    pub(crate) cancel: CancellationToken,
    /// Resolves [`PluginHost::wait`](super::PluginHost::wait).
    pub(crate) shutdown: CancellationToken,
    pub(crate) started_at: DateTime<Utc>,
    pub(crate) tasks: Mutex<JoinSet<()>>,
    pub(crate) server: Mutex<Option<IpcServerHandle>>,
    pub(crate) address: Mutex<Option<SocketAddr>>,
}

impl HostState {
    /// Address plugins dial to reach this host, once started.
    pub(crate) fn address(&self) -> Option<SocketAddr> {
        *lock(&self.address)
    }

    /// Run `task` under supervision. Ignored once the host is stopping.
    pub(crate) fn spawn_task<F>(&self, task: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        if self.cancel.is_cancelled() {
            debug!("Host is stopping; not spawning task");
            return;
        }
        let mut tasks = lock(&self.tasks);
        while tasks.try_join_next().is_some() {}
        tasks.spawn(task);
    }
}

/// Lock a std mutex, recovering the data if a holder panicked.
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
