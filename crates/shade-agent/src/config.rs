use serde::{Deserialize, Serialize};

use shade_core::{ShadeError, ShadeResult};
use shade_protocol::messages::MAX_JOB_NAME_LEN;

/// Agent configuration, loaded from a YAML document.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentConfig {
    pub job_name: String,
    #[serde(default = "default_daemon_addr")]
    pub daemon_addr: String,
}

fn default_daemon_addr() -> String {
    "127.0.0.1".to_string()
}

impl AgentConfig {
    pub fn load(path: &str) -> ShadeResult<Self> {
        let doc = std::fs::read_to_string(path)
            .map_err(|e| ShadeError::InvalidInput(format!("no agent config at {path}: {e}")))?;
        let config: AgentConfig = serde_yaml::from_str(&doc)
            .map_err(|e| ShadeError::InvalidInput(format!("bad agent config {path}: {e}")))?;

        if config.job_name.is_empty() {
            return Err(ShadeError::InvalidInput("agent config: empty job_name".into()));
        }
        if config.job_name.len() > MAX_JOB_NAME_LEN {
            return Err(ShadeError::InvalidInput(format!(
                "agent config: job_name longer than {MAX_JOB_NAME_LEN} bytes"
            )));
        }
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn write_config(doc: &str) -> tempfile::NamedTempFile {
        let mut f = tempfile::NamedTempFile::new().unwrap();
        f.write_all(doc.as_bytes()).unwrap();
        f
    }

    #[test]
    fn minimal_config_defaults_daemon_addr() {
        let f = write_config("job_name: llama-serving\n");
        let cfg = AgentConfig::load(f.path().to_str().unwrap()).unwrap();
        assert_eq!(cfg.job_name, "llama-serving");
        assert_eq!(cfg.daemon_addr, "127.0.0.1");
    }

    #[test]
    fn explicit_daemon_addr() {
        let f = write_config("job_name: train\ndaemon_addr: 10.0.0.7\n");
        let cfg = AgentConfig::load(f.path().to_str().unwrap()).unwrap();
        assert_eq!(cfg.daemon_addr, "10.0.0.7");
    }

    #[test]
    fn rejects_missing_or_oversized_job_name() {
        let f = write_config("daemon_addr: 10.0.0.7\n");
        assert!(AgentConfig::load(f.path().to_str().unwrap()).is_err());

        let long = format!("job_name: {}\n", "x".repeat(300));
        let f = write_config(&long);
        assert!(AgentConfig::load(f.path().to_str().unwrap()).is_err());
    }
}
