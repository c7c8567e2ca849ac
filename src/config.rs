//! Simulator configuration
//!
//! Stored as JSON in the data directory (see [`crate::utils`]). Missing or
//! unreadable files fall back to defaults; missing fields take their default
//! individually, so older files keep working.

use crate::core::event_log::MAX_LOGS;
use crate::core::network::Terminal;
use crate::utils::default_config_path;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Delays between the steps of long-running tools
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct PacingConfig {
    /// Between ping replies
    pub ping_ms: u64,
    /// Between scanned ports
    pub scan_ms: u64,
    /// Between traceroute hops
    pub trace_ms: u64,
}

impl Default for PacingConfig {
    fn default() -> Self {
        Self {
            ping_ms: 100,
            scan_ms: 50,
            trace_ms: 50,
        }
    }
}

impl PacingConfig {
    /// No delays at all, for scripted runs and tests
    pub const fn instant() -> Self {
        Self {
            ping_ms: 0,
            scan_ms: 0,
            trace_ms: 0,
        }
    }

    pub const fn ping(&self) -> Duration {
        Duration::from_millis(self.ping_ms)
    }

    pub const fn scan(&self) -> Duration {
        Duration::from_millis(self.scan_ms)
    }

    pub const fn trace(&self) -> Duration {
        Duration::from_millis(self.trace_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct SimulatorConfig {
    /// Idle time after which a session is discarded (default: 45 minutes)
    pub idle_timeout_secs: u64,
    /// Event log capacity per session
    pub max_logs: usize,
    /// How often the sweeper looks for idle sessions
    pub sweep_interval_secs: u64,
    /// Smallest simulated payload added to a byte counter
    pub payload_min_bytes: u64,
    /// Largest simulated payload added to a byte counter
    pub payload_max_bytes: u64,
    pub pacing: PacingConfig,
    /// Terminal addressed by lines without an `@terminal` prefix
    pub default_terminal: Terminal,
}

impl Default for SimulatorConfig {
    fn default() -> Self {
        Self {
            idle_timeout_secs: 45 * 60,
            max_logs: MAX_LOGS,
            sweep_interval_secs: 60,
            payload_min_bytes: 40,
            payload_max_bytes: 1500,
            pacing: PacingConfig::default(),
            default_terminal: Terminal::default(),
        }
    }
}

impl SimulatorConfig {
    /// Clamps values that would make the simulator misbehave.
    pub fn normalized(mut self) -> Self {
        self.max_logs = self.max_logs.max(1);
        self.sweep_interval_secs = self.sweep_interval_secs.max(1);
        self.idle_timeout_secs = self.idle_timeout_secs.max(1);
        if self.payload_min_bytes > self.payload_max_bytes {
            std::mem::swap(&mut self.payload_min_bytes, &mut self.payload_max_bytes);
        }
        self
    }

    pub const fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs)
    }
}

/// Saves the config to `path` using an atomic write pattern.
/// 1. Writes to a temporary file next to the target.
/// 2. Sets restrictive permissions (0o600).
/// 3. Atomically renames to the target path.
///
/// # Errors
///
/// Returns any I/O or serialization error; the previous file is left intact.
pub async fn save_config_to(path: &Path, config: &SimulatorConfig) -> std::io::Result<()> {
    let json = serde_json::to_string_pretty(config)?;
    let temp_path = path.with_extension("json.tmp");

    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }

    // Permissions are set at creation so the file is never world-readable
    #[cfg(unix)]
    {
        use tokio::fs::OpenOptions;
        use tokio::io::AsyncWriteExt;

        let mut file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .mode(0o600)
            .open(&temp_path)
            .await?;

        file.write_all(json.as_bytes()).await?;
        file.sync_all().await?;
    }

    #[cfg(not(unix))]
    {
        use tokio::io::AsyncWriteExt;

        let mut file = tokio::fs::File::create(&temp_path).await?;
        file.write_all(json.as_bytes()).await?;
        file.sync_all().await?;
    }

    tokio::fs::rename(&temp_path, path).await.map_err(|e| {
        if e.kind() == std::io::ErrorKind::StorageFull {
            std::io::Error::new(
                std::io::ErrorKind::StorageFull,
                "Disk full: cannot save configuration. Free up space and try again.",
            )
        } else {
            e
        }
    })?;

    tracing::info!(path = %path.display(), "configuration saved");
    Ok(())
}

/// Saves the config to the default location, if one exists.
pub async fn save_config(config: &SimulatorConfig) -> std::io::Result<()> {
    match default_config_path() {
        Some(path) => save_config_to(&path, config).await,
        None => Ok(()),
    }
}

/// Loads the config from `path`, or returns defaults if it is missing or invalid.
pub async fn load_config_from(path: &Path) -> SimulatorConfig {
    match tokio::fs::read_to_string(path).await {
        Ok(json) => match serde_json::from_str::<SimulatorConfig>(&json) {
            Ok(config) => return config.normalized(),
            Err(e) => {
                tracing::warn!(path = %path.display(), "ignoring invalid configuration: {e}");
            }
        },
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => tracing::warn!(path = %path.display(), "cannot read configuration: {e}"),
    }
    SimulatorConfig::default()
}

/// Loads the config from the default location.
pub async fn load_config() -> SimulatorConfig {
    match default_config_path() {
        Some(path) => load_config_from(&path).await,
        None => SimulatorConfig::default(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_defaults() {
        let config = SimulatorConfig::default();
        assert_eq!(config.idle_timeout_secs, 2700);
        assert_eq!(config.max_logs, 1000);
        assert_eq!(config.pacing.ping(), Duration::from_millis(100));
        assert_eq!(config.default_terminal, Terminal::Insider);
    }

    #[test]
    fn test_partial_json_fills_defaults() {
        let config: SimulatorConfig =
            serde_json::from_str(r#"{"max_logs": 50, "pacing": {"scan_ms": 5}}"#).unwrap();
        assert_eq!(config.max_logs, 50);
        assert_eq!(config.pacing.scan_ms, 5);
        assert_eq!(config.pacing.ping_ms, 100);
        assert_eq!(config.idle_timeout_secs, 2700);
    }

    #[test]
    fn test_normalized_clamps() {
        let config = SimulatorConfig {
            max_logs: 0,
            payload_min_bytes: 900,
            payload_max_bytes: 100,
            ..SimulatorConfig::default()
        }
        .normalized();
        assert_eq!(config.max_logs, 1);
        assert_eq!(
            (config.payload_min_bytes, config.payload_max_bytes),
            (100, 900)
        );
    }

    #[tokio::test]
    async fn test_save_then_load() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("nested").join("config.json");
        let config = SimulatorConfig {
            idle_timeout_secs: 60,
            default_terminal: Terminal::Dmz,
            ..SimulatorConfig::default()
        };

        save_config_to(&path, &config).await.unwrap();
        assert_eq!(load_config_from(&path).await, config);
        assert!(!path.with_extension("json.tmp").exists());

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mode = std::fs::metadata(&path).unwrap().permissions().mode();
            assert_eq!(mode & 0o777, 0o600);
        }
    }

    #[tokio::test]
    async fn test_missing_or_corrupt_file_gives_defaults() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("config.json");
        assert_eq!(load_config_from(&path).await, SimulatorConfig::default());

        tokio::fs::write(&path, "{ not json").await.unwrap();
        assert_eq!(load_config_from(&path).await, SimulatorConfig::default());
    }
}
