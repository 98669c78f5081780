//! Engine configuration, loadable from YAML.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

// ---------------------------------------------------------------------------
// EngineConfig
// ---------------------------------------------------------------------------

/// Tunables of the execution engine. Every field has a default, so a YAML
/// file only needs to list what it overrides.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Node units of work (start, resume) allowed to run at once. Time spent
    /// waiting on a remote module does not count against it.
    pub max_concurrent_dispatches: usize,
    /// How long concluded records are kept before `purge_expired` may drop them.
    pub node_retention_secs: u64,
    /// How long a module request's reply is replayed for redeliveries.
    pub dedupe_retention_secs: u64,
    /// Expiry of queued tasks whose request does not set one.
    pub default_task_timeout_secs: u64,
    /// Round trip limit for remote facilitation and advice.
    pub remote_call_timeout_ms: u64,
    /// Capacity of the channel between the wait/notify engine and its listener.
    pub notify_channel_capacity: usize,
    /// How often the listener expires overdue tasks.
    pub task_sweep_interval_secs: u64,
    /// Validate plans against the registries before starting them.
    pub validate_plans: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_concurrent_dispatches: 64,
            node_retention_secs: 7 * 24 * 3600,
            dedupe_retention_secs: 24 * 3600,
            default_task_timeout_secs: 3600,
            remote_call_timeout_ms: 30_000,
            notify_channel_capacity: 1024,
            task_sweep_interval_secs: 30,
            validate_plans: true,
        }
    }
}

impl EngineConfig {
    pub fn from_yaml(content: &str) -> Result<Self> {
        serde_yaml::from_str(content).context("Parsing engine config")
    }

    /// Load from a YAML file.
    pub fn load_from_file(path: &Path) -> Result<Self> {
        let content =
            std::fs::read_to_string(path).with_context(|| format!("Reading {}", path.display()))?;
        serde_yaml::from_str(&content).with_context(|| format!("Parsing {}", path.display()))
    }

    pub fn remote_call_timeout(&self) -> Duration {
        Duration::from_millis(self.remote_call_timeout_ms)
    }

    pub fn node_retention(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.node_retention_secs as i64)
    }

    pub fn dedupe_retention(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.dedupe_retention_secs as i64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_partial_yaml_keeps_defaults() {
        let config =
            EngineConfig::from_yaml("max_concurrent_dispatches: 4\nvalidate_plans: false\n")
            .unwrap();
        assert_eq!(config.max_concurrent_dispatches, 4);
        assert!(!config.validate_plans);
        assert_eq!(config.remote_call_timeout_ms, 30_000);
        assert_eq!(config.dedupe_retention(), chrono::Duration::hours(24));
    }

    #[test]
    fn test_load_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "remote_call_timeout_ms: 250").unwrap();
        writeln!(file, "node_retention_secs: 60").unwrap();
        let config = EngineConfig::load_from_file(file.path()).unwrap();
        assert_eq!(config.remote_call_timeout(), Duration::from_millis(250));
        assert_eq!(config.node_retention(), chrono::Duration::seconds(60));
    }

    #[test]
    fn test_bad_file_reports_path() {
        let err = EngineConfig::load_from_file(Path::new("/nonexistent/engine.yaml")).unwrap_err();
        assert!(format!("{:#}", err).contains("/nonexistent/engine.yaml"));
    }
}
