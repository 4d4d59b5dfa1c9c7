//! Plugin process management.
//!
//! [`PluginLauncher`] is the seam between the host runtime and the OS: the
//! default [`CommandLauncher`] spawns real executables, tests substitute
//! in-process fakes. Each spawned [`PluginProcess`] is owned by a single
//! monitor task; everyone else interacts with it through a cloneable
//! [`ProcessHandle`] stored in the plugin's registry record.

mod launcher;

pub use launcher::{
    parse_descriptor, ChildProcess, CommandLauncher, ExitReport, LaunchSpec, PluginLauncher,
    PluginProcess,
};

use crate::cancel::CancellationToken;
use std::time::Duration;

/// Shared view of a process owned by a monitor task.
#[derive(Debug, Clone)]
pub struct ProcessHandle {
    pid: Option<u32>,
    kill: CancellationToken,
    exited: CancellationToken,
}

impl ProcessHandle {
    pub(crate) fn new(pid: Option<u32>) -> Self {
        Self {
            pid,
            kill: CancellationToken::new(),
            exited: CancellationToken::new(),
        }
    }

    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    /// Ask the monitor to terminate the process.
    pub fn request_kill(&self) {
        self.kill.cancel();
    }

    pub fn is_exited(&self) -> bool {
        self.exited.is_cancelled()
    }

    /// Wait up to `timeout` for the process to exit. Returns whether it did.
    pub async fn wait_exit(&self, timeout: Duration) -> bool {
        tokio::time::timeout(timeout, self.exited.cancelled())
            .await
            .is_ok()
    }

    pub(crate) fn kill_requested(&self) -> &CancellationToken {
        &self.kill
    }

    pub(crate) fn mark_exited(&self) {
        self.exited.cancel();
    }
}
