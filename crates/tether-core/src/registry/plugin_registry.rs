//! In-memory plugin registry.

use super::status::PluginStatus;
use crate::error::{Result, TetherError};
use crate::process::ProcessHandle;
use crate::rpc::{PluginClient, PluginDescriptor};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, PoisonError, RwLock};

/// State of one loaded plugin.
///
/// Snapshots returned by the registry are shallow copies: the process and
/// connection handles are shared, everything else is owned by the snapshot.
#[derive(Debug, Clone, Serialize)]
pub struct PluginRecord {
    pub id: String,
    pub name: String,
    pub version: String,
    pub description: String,
    pub capabilities: Vec<String>,
    pub functions: Vec<String>,
    pub path: PathBuf,
    /// Plugin's inbound server port; `0` until it registers.
    pub port: u16,
    pub status: PluginStatus,
    pub start_time: Option<DateTime<Utc>>,
    pub last_heartbeat: Option<DateTime<Utc>>,
    pub auto_restart: bool,
    pub max_restarts: u32,
    pub restart_count: u32,
    #[serde(skip)]
    pub process: Option<ProcessHandle>,
    #[serde(skip)]
    pub client: Option<Arc<PluginClient>>,
    /// Token of the current spawn; registration must echo it.
    #[serde(skip)]
    pub launch_token: Option<String>,
}

impl PluginRecord {
    /// A `stopped` record for a plugin that has not been started yet.
    pub fn new(id: impl Into<String>, path: impl Into<PathBuf>) -> Self {
        Self {
            id: id.into(),
            name: String::new(),
            version: String::new(),
            description: String::new(),
            capabilities: Vec::new(),
            functions: Vec::new(),
            path: path.into(),
            port: 0,
            status: PluginStatus::Stopped,
            start_time: None,
            last_heartbeat: None,
            auto_restart: true,
            max_restarts: 3,
            restart_count: 0,
            process: None,
            client: None,
            launch_token: None,
        }
    }

    /// Build a `stopped` record from queried metadata.
    pub fn from_descriptor(descriptor: &PluginDescriptor, path: impl Into<PathBuf>) -> Self {
        let mut record = Self::new(descriptor.id.clone(), path);
        record.name = descriptor.name.clone();
        record.version = descriptor.version.clone();
        record.description = descriptor.description.clone();
        record.capabilities = descriptor.capabilities.clone();
        record.functions = descriptor.functions.clone();
        record
    }

    pub fn with_status(mut self, status: PluginStatus) -> Self {
        self.status = status;
        self
    }

    pub fn with_restart_policy(mut self, auto_restart: bool, max_restarts: u32) -> Self {
        self.auto_restart = auto_restart;
        self.max_restarts = max_restarts;
        self
    }

    /// Whether the plugin accepts calls right now.
    pub fn is_callable(&self) -> bool {
        self.status == PluginStatus::Running && self.client.is_some()
    }

    /// Move to `next`, enforcing the lifecycle state machine.
    ///
    /// Leaving the active states drops the outbound connection.
    pub fn transition(&mut self, next: PluginStatus) -> Result<PluginStatus> {
        let previous = self.status;
        if !previous.can_transition_to(next) {
            return Err(TetherError::InvalidTransition {
                id: self.id.clone(),
                from: previous,
                to: next,
            });
        }
        self.status = next;
        if !next.is_active() {
            self.client = None;
        }
        Ok(previous)
    }

    /// Whether an automatic restart is still within budget.
    pub fn can_auto_restart(&self) -> bool {
        self.auto_restart && self.restart_count < self.max_restarts
    }
}

/// Concurrent map of plugin ID to [`PluginRecord`].
///
/// A single reader/writer lock guards the map. Closures passed to
/// [`update`](Self::update) run under the write lock, so every update is an
/// atomic step as seen by readers.
#[derive(Debug, Default)]
pub struct PluginRegistry {
    plugins: RwLock<HashMap<String, PluginRecord>>,
}

impl PluginRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or overwrite a record. Returns the previous record for that ID.
    pub fn register(&self, record: PluginRecord) -> Option<PluginRecord> {
        self.write().insert(record.id.clone(), record)
    }

    /// Insert a record only if its ID is free. Returns the occupying record
    /// otherwise.
    pub fn register_new(&self, record: PluginRecord) -> Option<PluginRecord> {
        use std::collections::hash_map::Entry;
        match self.write().entry(record.id.clone()) {
            Entry::Occupied(existing) => Some(existing.get().clone()),
            Entry::Vacant(slot) => {
                slot.insert(record);
                None
            }
        }
    }

    pub fn unregister(&self, id: &str) -> Option<PluginRecord> {
        self.write().remove(id)
    }

    pub fn get(&self, id: &str) -> Option<PluginRecord> {
        self.read().get(id).cloned()
    }

    pub fn contains(&self, id: &str) -> bool {
        self.read().contains_key(id)
    }

    /// Snapshot of all records, sorted by ID.
    pub fn list(&self) -> Vec<PluginRecord> {
        let mut records: Vec<PluginRecord> = self.read().values().cloned().collect();
        records.sort_by(|a, b| a.id.cmp(&b.id));
        records
    }

    pub fn count(&self) -> usize {
        self.read().len()
    }

    /// Mutate one record in place. Returns `None` if the ID is unknown.
    pub fn update<R>(&self, id: &str, f: impl FnOnce(&mut PluginRecord) -> R) -> Option<R> {
        self.write().get_mut(id).map(f)
    }

    /// Mutate one record, failing with `PluginNotFound` for unknown IDs.
    pub fn try_update<R>(
        &self,
        id: &str,
        f: impl FnOnce(&mut PluginRecord) -> Result<R>,
    ) -> Result<R> {
        let mut plugins = self.write();
        let record = plugins
            .get_mut(id)
            .ok_or_else(|| TetherError::PluginNotFound { id: id.to_string() })?;
        f(record)
    }

    /// First record matching `predicate`.
    pub fn find(&self, predicate: impl Fn(&PluginRecord) -> bool) -> Option<PluginRecord> {
        self.read().values().find(|r| predicate(r)).cloned()
    }

    pub fn find_by_path(&self, path: &Path) -> Option<PluginRecord> {
        self.find(|r| r.path == path)
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, HashMap<String, PluginRecord>> {
        self.plugins.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, HashMap<String, PluginRecord>> {
        self.plugins.write().unwrap_or_else(PoisonError::into_inner)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_register_get_unregister() {
        let registry = PluginRegistry::new();
        assert!(registry.get("a").is_none());

        assert!(registry.register(PluginRecord::new("a", "/bin/a")).is_none());
        assert_eq!(registry.get("a").unwrap().path, PathBuf::from("/bin/a"));
        assert_eq!(registry.count(), 1);

        // Overwrite by ID
        let previous = registry.register(PluginRecord::new("a", "/bin/a2"));
        assert!(previous.is_some());
        assert_eq!(registry.count(), 1);

        assert!(registry.unregister("a").is_some());
        assert!(registry.get("a").is_none());
        assert_eq!(registry.count(), 0);
    }

    #[test]
    fn test_snapshot_is_detached() {
        let registry = PluginRegistry::new();
        registry.register(PluginRecord::new("a", "/bin/a"));

        let mut snapshot = registry.get("a").unwrap();
        snapshot.name = "changed".into();

        assert_eq!(registry.get("a").unwrap().name, "");
    }

    #[test]
    fn test_transition_enforced() {
        let mut record = PluginRecord::new("a", "/bin/a");
        assert!(record.transition(PluginStatus::Starting).is_ok());
        assert!(record.transition(PluginStatus::Running).is_ok());

        let err = record.transition(PluginStatus::Starting).unwrap_err();
        assert!(matches!(err, TetherError::InvalidTransition { .. }));
        assert_eq!(record.status, PluginStatus::Running);
    }

    #[test]
    fn test_restart_budget() {
        let mut record = PluginRecord::new("a", "/bin/a").with_restart_policy(true, 2);
        assert!(record.can_auto_restart());
        record.restart_count = 2;
        assert!(!record.can_auto_restart());

        let record = PluginRecord::new("b", "/bin/b").with_restart_policy(false, 5);
        assert!(!record.can_auto_restart());
    }

    #[test]
    fn test_try_update_unknown_id() {
        let registry = PluginRegistry::new();
        let result = registry.try_update("ghost", |r| r.transition(PluginStatus::Starting));
        assert!(matches!(result, Err(TetherError::PluginNotFound { .. })));
    }

    #[test]
    fn test_find_by_path() {
        let registry = PluginRegistry::new();
        registry.register(PluginRecord::new("a", "/bin/a"));
        registry.register(PluginRecord::new("b", "/bin/b"));

        assert_eq!(registry.find_by_path(Path::new("/bin/b")).unwrap().id, "b");
        assert!(registry.find_by_path(Path::new("/bin/c")).is_none());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_register_and_list() {
        const WRITERS: usize = 64;
        const READERS: usize = 16;

        let registry = Arc::new(PluginRegistry::new());
        let mut tasks = Vec::new();

        for i in 0..WRITERS {
            let registry = registry.clone();
            tasks.push(tokio::spawn(async move {
                registry.register(PluginRecord::new(format!("plugin-{i}"), format!("/bin/{i}")));
            }));
        }
        for _ in 0..READERS {
            let registry = registry.clone();
            tasks.push(tokio::spawn(async move {
                for _ in 0..10 {
                    let snapshot = registry.list();
                    assert!(snapshot.len() <= WRITERS);
                    tokio::task::yield_now().await;
                }
            }));
        }
        for task in tasks {
            task.await.unwrap();
        }

        assert_eq!(registry.count(), WRITERS);
        let mut ids: Vec<String> = registry.list().into_iter().map(|r| r.id).collect();
        ids.dedup();
        assert_eq!(ids.len(), WRITERS);
    }
}
