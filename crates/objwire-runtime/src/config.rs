//! Runtime configuration.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Tunables shared by every proxy and connection of one communicator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    /// Time allowed for connect plus validation (default: 10000).
    pub connect_timeout_ms: u64,
    /// Time allowed for a graceful close before it escalates to an abort (default: 10000).
    pub close_timeout_ms: u64,
    /// Default invocation timeout; `None` waits forever.
    pub invocation_timeout_ms: Option<u64>,
    /// Read idle timeout in seconds (default: 60).
    pub idle_timeout_secs: u64,
    /// Whether a silent peer aborts the connection (default: true).
    pub enable_idle_check: bool,
    /// Close connections without traffic after this many seconds; 0 disables (default: 300).
    pub inactivity_timeout_secs: u64,
    /// Delay before each retry; the list length is the retry limit (default: `[0]`).
    pub retry_intervals_ms: Vec<u64>,
    /// Flush a batch queue once it reaches this many bytes; 0 disables (default: 1 MiB).
    pub batch_auto_flush_size: usize,
    /// Largest message accepted or sent; 0 means unlimited (default: 1 MiB).
    pub message_size_max: usize,
    /// Whether message compression is available (default: true).
    pub enable_compression: bool,
    /// Funnel invocations through a per-proxy serial executor (default: false).
    pub queue_requests: bool,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            connect_timeout_ms: 10_000,
            close_timeout_ms: 10_000,
            invocation_timeout_ms: None,
            idle_timeout_secs: 60,
            enable_idle_check: true,
            inactivity_timeout_secs: 300,
            retry_intervals_ms: vec![0],
            batch_auto_flush_size: 1024 * 1024,
            message_size_max: 1024 * 1024,
            enable_compression: true,
            queue_requests: false,
        }
    }
}

impl RuntimeConfig {
    /// Loads a configuration from a `.toml` or `.json` file.
    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        let ext = path
            .extension()
            .and_then(|e| e.to_str())
            .unwrap_or_default();

        let config: RuntimeConfig = match ext.to_lowercase().as_str() {
            "toml" => toml::from_str(&contents)?,
            "json" => serde_json::from_str(&contents)?,
            _ => anyhow::bail!("Unsupported config file extension: {}", ext),
        };
        config.validate()?;
        Ok(config)
    }

    /// Rejects combinations the runtime cannot honor.
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.connect_timeout_ms == 0 {
            anyhow::bail!("connect_timeout_ms must be greater than zero");
        }
        if self.close_timeout_ms == 0 {
            anyhow::bail!("close_timeout_ms must be greater than zero");
        }
        if self.enable_idle_check && self.idle_timeout_secs == 0 {
            anyhow::bail!("idle_timeout_secs must be greater than zero when the idle check is enabled");
        }
        if self.invocation_timeout_ms == Some(0) {
            anyhow::bail!("invocation_timeout_ms must be greater than zero when set");
        }
        Ok(())
    }

    /// Connect timeout as a `Duration`.
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    /// Close timeout as a `Duration`.
    pub fn close_timeout(&self) -> Duration {
        Duration::from_millis(self.close_timeout_ms)
    }

    /// Default invocation timeout, if any.
    pub fn invocation_timeout(&self) -> Option<Duration> {
        self.invocation_timeout_ms.map(Duration::from_millis)
    }

    /// Idle timeout driving heartbeats, or `None` when set to 0.
    ///
    /// Heartbeats are sent whenever this is set; `enable_idle_check` only
    /// controls whether a silent peer aborts the connection.
    pub fn idle_timeout(&self) -> Option<Duration> {
        (self.idle_timeout_secs > 0).then(|| Duration::from_secs(self.idle_timeout_secs))
    }

    /// Inactivity timeout, or `None` when disabled.
    pub fn inactivity_timeout(&self) -> Option<Duration> {
        (self.inactivity_timeout_secs > 0).then(|| Duration::from_secs(self.inactivity_timeout_secs))
    }

    /// Retry delays in order.
    pub fn retry_intervals(&self) -> Vec<Duration> {
        self.retry_intervals_ms
            .iter()
            .map(|ms| Duration::from_millis(*ms))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn test_default_values() {
        let config = RuntimeConfig::default();
        assert_eq!(config.connect_timeout_ms, 10_000);
        assert_eq!(config.close_timeout_ms, 10_000);
        assert!(config.invocation_timeout_ms.is_none());
        assert_eq!(config.idle_timeout_secs, 60);
        assert!(config.enable_idle_check);
        assert_eq!(config.retry_intervals_ms, vec![0]);
        assert_eq!(config.batch_auto_flush_size, 1024 * 1024);
        assert!(config.enable_compression);
        assert!(!config.queue_requests);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_duration_helpers() {
        let mut config = RuntimeConfig::default();
        assert_eq!(config.idle_timeout(), Some(Duration::from_secs(60)));
        config.enable_idle_check = false;
        assert_eq!(config.idle_timeout(), Some(Duration::from_secs(60)));
        config.idle_timeout_secs = 0;
        assert_eq!(config.idle_timeout(), None);
        config.inactivity_timeout_secs = 0;
        assert_eq!(config.inactivity_timeout(), None);
        config.retry_intervals_ms = vec![0, 100, 500];
        assert_eq!(
            config.retry_intervals(),
            vec![
                Duration::ZERO,
                Duration::from_millis(100),
                Duration::from_millis(500)
            ]
        );
    }

    #[test]
    fn test_validate_rejects_zero_timeouts() {
        let config = RuntimeConfig {
            connect_timeout_ms: 0,
            ..Default::default()
        };
        assert!(config.validate().is_err());

        let config = RuntimeConfig {
            invocation_timeout_ms: Some(0),
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_from_file_json() {
        let mut file = NamedTempFile::with_suffix(".json").unwrap();
        writeln!(
            file,
            r#"{{
                "connect_timeout_ms": 2500,
                "retry_intervals_ms": [0, 50],
                "invocation_timeout_ms": 1000
            }}"#
        )
        .unwrap();

        let config = RuntimeConfig::from_file(file.path()).unwrap();
        assert_eq!(config.connect_timeout_ms, 2500);
        assert_eq!(config.retry_intervals_ms, vec![0, 50]);
        assert_eq!(config.invocation_timeout_ms, Some(1000));
        assert_eq!(config.close_timeout_ms, 10_000);
    }

    #[test]
    fn test_from_file_toml() {
        let mut file = NamedTempFile::with_suffix(".toml").unwrap();
        writeln!(
            file,
            r#"
idle_timeout_secs = 5
enable_compression = false
batch_auto_flush_size = 0
"#
        )
        .unwrap();

        let config = RuntimeConfig::from_file(file.path()).unwrap();
        assert_eq!(config.idle_timeout_secs, 5);
        assert!(!config.enable_compression);
        assert_eq!(config.batch_auto_flush_size, 0);
        assert_eq!(config.message_size_max, 1024 * 1024);
    }

    #[test]
    fn test_from_file_unsupported_extension() {
        let file = NamedTempFile::with_suffix(".yaml").unwrap();
        assert!(RuntimeConfig::from_file(file.path()).is_err());
    }
}
