use serde::{Deserialize, Serialize};

use crate::error::{ShadeError, ShadeResult};

/// Top-level daemon configuration, loaded from shade.toml.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ShadeConfig {
    #[serde(default)]
    pub daemon: DaemonConfig,
    #[serde(default)]
    pub checkpoint: CheckpointConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DaemonConfig {
    /// Bind address for the out-of-band control channel
    #[serde(default = "default_bind")]
    pub bind: String,
    /// Port of the data-plane RPC frontend
    #[serde(default = "default_rpc_port")]
    pub rpc_port: u16,
    /// Port of the out-of-band control channel
    #[serde(default = "default_oob_port")]
    pub oob_port: u16,
    /// Port to accept migration data from a peer daemon
    #[serde(default = "default_migration_port")]
    pub migration_port: u16,
    /// Path of the daemon's log
    #[serde(default = "default_daemon_log")]
    pub daemon_log_path: String,
    /// Path of the per-client logs
    #[serde(default = "default_client_log")]
    pub client_log_path: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckpointConfig {
    /// Continuous checkpoint interval in milliseconds; 0 disables the ticker.
    #[serde(default = "default_ckpt_interval_ms")]
    pub interval_ms: u64,
    /// Directory where checkpoint images are collapsed to
    #[serde(default = "default_ckpt_dir")]
    pub image_dir: String,
}

impl Default for ShadeConfig {
    fn default() -> Self {
        Self {
            daemon: DaemonConfig::default(),
            checkpoint: CheckpointConfig::default(),
        }
    }
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            bind: default_bind(),
            rpc_port: default_rpc_port(),
            oob_port: default_oob_port(),
            migration_port: default_migration_port(),
            daemon_log_path: default_daemon_log(),
            client_log_path: default_client_log(),
        }
    }
}

impl Default for CheckpointConfig {
    fn default() -> Self {
        Self {
            interval_ms: default_ckpt_interval_ms(),
            image_dir: default_ckpt_dir(),
        }
    }
}

impl ShadeConfig {
    /// Load configuration from a TOML file.
    pub fn load(path: &str) -> ShadeResult<Self> {
        let content = std::fs::read_to_string(path)?;
        toml::from_str(&content)
            .map_err(|e| ShadeError::InvalidInput(format!("bad config {path}: {e}")))
    }

    /// Load configuration from file if it exists, otherwise return defaults.
    pub fn load_or_default(path: &str) -> Self {
        Self::load(path).unwrap_or_default()
    }
}

fn default_bind() -> String {
    "0.0.0.0".to_string()
}

fn default_rpc_port() -> u16 {
    5212
}

fn default_oob_port() -> u16 {
    5213
}

fn default_migration_port() -> u16 {
    5214
}

fn default_daemon_log() -> String {
    "/var/log/shade/daemon.log".to_string()
}

fn default_client_log() -> String {
    "/var/log/shade/client.log".to_string()
}

fn default_ckpt_interval_ms() -> u64 {
    0
}

fn default_ckpt_dir() -> String {
    "/var/lib/shade/ckpt".to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn defaults_when_missing() {
        let cfg = ShadeConfig::load_or_default("/nonexistent/shade.toml");
        assert_eq!(cfg.daemon.oob_port, 5213);
        assert_eq!(cfg.checkpoint.interval_ms, 0);
    }

    #[test]
    fn partial_file_fills_defaults() {
        let mut f = tempfile::NamedTempFile::new().unwrap();
        writeln!(f, "[checkpoint]\ninterval_ms = 250").unwrap();
        let cfg = ShadeConfig::load(f.path().to_str().unwrap()).unwrap();
        assert_eq!(cfg.checkpoint.interval_ms, 250);
        assert_eq!(cfg.daemon.bind, "0.0.0.0");
    }
}
