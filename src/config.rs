//! Agent configuration.
//!
//! One JSON document configures a whole agent session. Every section is
//! optional and falls back to its defaults:
//!
//! ```json
//! {
//!   "data_dir": "~/.synk",
//!   "retrieval": { "half_life_secs": 604800 },
//!   "registry": { "skill_dirs": ["~/.synk/skills"] },
//!   "orchestrator": { "autosave": true }
//! }
//! ```

use crate::error::{Error, Result};
use crate::memory::RetrievalConfig;
use crate::orchestrator::OrchestratorConfig;
use crate::skills::RegistryConfig;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

/// Environment variable overriding [`AgentConfig::data_dir`].
pub const DATA_DIR_ENV: &str = "SYNK_DATA_DIR";

/// Configuration for an [`Agent`](crate::agent::Agent) session.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentConfig {
    /// Directory holding the database; `~` and `$VARS` are expanded
    pub data_dir: String,
    /// Database file name inside `data_dir`
    pub database_file: String,
    /// Register `create_task`, `remember` and `current_time`
    pub builtin_skills: bool,
    pub retrieval: RetrievalConfig,
    pub registry: RegistryConfig,
    pub orchestrator: OrchestratorConfig,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            data_dir: "~/.synk".to_string(),
            database_file: "memory.db".to_string(),
            builtin_skills: true,
            retrieval: RetrievalConfig::default(),
            registry: RegistryConfig::default(),
            orchestrator: OrchestratorConfig::default(),
        }
    }
}

impl AgentConfig {
    /// Defaults, with the data directory taken from `SYNK_DATA_DIR` when set.
    pub fn from_env() -> Self {
        let mut config = Self::default();
        if let Ok(dir) = std::env::var(DATA_DIR_ENV) {
            if !dir.trim().is_empty() {
                config.data_dir = dir;
            }
        }
        config
    }

    pub fn from_json(json: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(json)
            .map_err(|e| Error::Config(format!("Invalid agent config: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Load and validate a JSON config file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let json = fs::read_to_string(path)
            .map_err(|e| Error::Config(format!("Failed to read {}: {}", path.display(), e)))?;
        Self::from_json(&json)
    }

    pub fn with_data_dir(mut self, dir: impl Into<String>) -> Self {
        self.data_dir = dir.into();
        self
    }

    pub fn with_builtin_skills(mut self, enabled: bool) -> Self {
        self.builtin_skills = enabled;
        self
    }

    pub fn with_retrieval(mut self, retrieval: RetrievalConfig) -> Self {
        self.retrieval = retrieval;
        self
    }

    pub fn with_registry(mut self, registry: RegistryConfig) -> Self {
        self.registry = registry;
        self
    }

    pub fn with_orchestrator(mut self, orchestrator: OrchestratorConfig) -> Self {
        self.orchestrator = orchestrator;
        self
    }

    /// `data_dir` with `~` and environment variables expanded.
    pub fn resolved_data_dir(&self) -> Result<PathBuf> {
        let expanded = shellexpand::full(&self.data_dir)
            .map_err(|e| Error::Config(format!("Cannot expand data_dir '{}': {}", self.data_dir, e)))?;
        Ok(PathBuf::from(expanded.as_ref()))
    }

    pub fn database_path(&self) -> Result<PathBuf> {
        Ok(self.resolved_data_dir()?.join(&self.database_file))
    }

    /// Reject settings no session could run with.
    pub fn validate(&self) -> Result<()> {
        if self.data_dir.trim().is_empty() {
            return Err(Error::Config("data_dir is empty".into()));
        }
        if self.database_file.trim().is_empty() {
            return Err(Error::Config("database_file is empty".into()));
        }

        let r = &self.retrieval;
        if r.similarity_weight < 0.0 || r.importance_weight < 0.0 {
            return Err(Error::Config("retrieval weights must be non-negative".into()));
        }
        if !(0.0..=1.0).contains(&r.default_importance) {
            return Err(Error::Config("default_importance must be within [0, 1]".into()));
        }
        if !(0.0..=1.0).contains(&r.touch_reinforcement) {
            return Err(Error::Config("touch_reinforcement must be within [0, 1]".into()));
        }

        let o = &self.orchestrator;
        if o.max_context_nodes == 0 {
            return Err(Error::Config("max_context_nodes must be at least 1".into()));
        }
        if o.max_concurrent_skills == 0 {
            return Err(Error::Config("max_concurrent_skills must be at least 1".into()));
        }
        if o.reasoner_timeout_ms == 0 || self.registry.default_timeout_ms == 0 {
            return Err(Error::Config("timeouts must be positive".into()));
        }
        Ok(())
    }
}
