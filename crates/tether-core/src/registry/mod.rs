//! Plugin registry: the host's in-memory record of every loaded plugin.
//!
//! Records persist for the lifetime of the host; nothing is written to disk.

mod plugin_registry;
mod status;

pub use plugin_registry::{PluginRecord, PluginRegistry};
pub use status::PluginStatus;
