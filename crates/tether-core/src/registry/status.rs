//! Plugin lifecycle states.

use serde::{Deserialize, Serialize};

/// Lifecycle status of a plugin record.
///
/// ```text
/// stopped -> starting -> running -> stopping -> stopped
///               |           |
///               |           +-----> crashed -> starting (auto-restart)
///               +-> error / crashed
/// ```
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PluginStatus {
    #[default]
    Stopped,
    Starting,
    Running,
    Stopping,
    /// Spawn or connect-back failed; the process is gone.
    Error,
    Crashed,
}

impl PluginStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            PluginStatus::Stopped => "stopped",
            PluginStatus::Starting => "starting",
            PluginStatus::Running => "running",
            PluginStatus::Stopping => "stopping",
            PluginStatus::Error => "error",
            PluginStatus::Crashed => "crashed",
        }
    }

    /// Whether moving from `self` to `next` is a legal lifecycle step.
    pub fn can_transition_to(&self, next: PluginStatus) -> bool {
        use PluginStatus::*;
        matches!(
            (self, next),
            (Stopped, Starting)
                | (Starting, Running)
                | (Starting, Stopping)
                | (Starting, Crashed)
                | (Starting, Error)
                | (Running, Stopping)
                | (Running, Crashed)
                | (Stopping, Stopped)
                | (Crashed, Starting)
                | (Crashed, Stopped)
                | (Error, Starting)
                | (Error, Stopped)
        )
    }

    /// Whether a live process is expected for this status.
    pub fn is_active(&self) -> bool {
        matches!(self, PluginStatus::Starting | PluginStatus::Running)
    }
}

impl std::fmt::Display for PluginStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::PluginStatus::*;
    use super::*;

    #[test]
    fn test_normal_lifecycle_is_allowed() {
        assert!(Stopped.can_transition_to(Starting));
        assert!(Starting.can_transition_to(Running));
        assert!(Running.can_transition_to(Stopping));
        assert!(Stopping.can_transition_to(Stopped));
    }

    #[test]
    fn test_crash_and_restart_path() {
        assert!(Running.can_transition_to(Crashed));
        assert!(Crashed.can_transition_to(Starting));
        assert!(Crashed.can_transition_to(Stopped));
    }

    #[test]
    fn test_illegal_transitions_are_rejected() {
        assert!(!Stopped.can_transition_to(Running));
        assert!(!Running.can_transition_to(Starting));
        assert!(!Running.can_transition_to(Running));
        assert!(!Stopping.can_transition_to(Running));
        assert!(!Crashed.can_transition_to(Running));
    }

    #[test]
    fn test_status_serializes_lowercase() {
        assert_eq!(serde_json::to_string(&Crashed).unwrap(), "\"crashed\"");
        assert_eq!(Running.to_string(), "running");
    }
}
