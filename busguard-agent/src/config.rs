//! Agent configuration.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

/// Configuration for a security agent instance.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentConfig {
    /// Path of the SQLite store holding the security state.
    pub storage_path: PathBuf,

    /// Name the agent's own identity certificate is issued under.
    #[serde(default = "default_agent_name")]
    pub agent_name: String,
}

fn default_agent_name() -> String {
    "Admin".into()
}

impl AgentConfig {
    pub fn new(storage_path: impl Into<PathBuf>) -> Self {
        AgentConfig {
            storage_path: storage_path.into(),
            agent_name: default_agent_name(),
        }
    }

    /// Load a TOML configuration file.
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let text = std::fs::read_to_string(path)?;
        Ok(toml::from_str(&text)?)
    }
}
