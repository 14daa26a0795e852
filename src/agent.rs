//! Agent session facade.
//!
//! An [`Agent`] wires the pieces of one session together: SQLite storage in
//! the data directory, the memory graph loaded from it, the skill registry
//! (built-ins, discovered manifests and persisted enabled flags) and an
//! [`Orchestrator`] running cycles over all of them.
//!
//! ## Example
//!
//! ```rust,ignore
//! use synk_core::{Agent, AgentConfig};
//!
//! let agent = Agent::open(AgentConfig::from_env(), reasoner).await?;
//! let reply = agent.process("remind me to call John tomorrow").await?;
//! println!("{}", reply.response);
//! agent.save().await?;
//! ```

use crate::config::AgentConfig;
use crate::error::{Error, Result};
use crate::memory::{ContextWindow, GraphMeta, LoadOutcome, MemoryGraph, NodeId, NodeKind};
use crate::orchestrator::{CancelToken, CycleError, CycleEvent, CycleResponse, Orchestrator};
use crate::reasoning::Reasoner;
use crate::skills::builtin::register_builtins;
use crate::skills::{DiscoveryReport, Skill, SkillFactory, SkillRegistry};
use crate::storage::{SqliteStorage, Storage};
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{info, warn};

/// Assembles an [`Agent`].
///
/// Factories and in-process skills must be known before manifests are
/// discovered, so they are collected here and applied in order.
pub struct AgentBuilder {
    config: AgentConfig,
    reasoner: Arc<dyn Reasoner>,
    storage: Option<Arc<dyn Storage>>,
    factories: Vec<(String, SkillFactory)>,
    skills: Vec<Arc<dyn Skill>>,
}

impl AgentBuilder {
    pub fn new(config: AgentConfig, reasoner: Arc<dyn Reasoner>) -> Self {
        Self {
            config,
            reasoner,
            storage: None,
            factories: Vec::new(),
            skills: Vec::new(),
        }
    }

    /// Use this storage instead of opening the database in `data_dir`.
    pub fn with_storage(mut self, storage: Arc<dyn Storage>) -> Self {
        self.storage = Some(storage);
        self
    }

    /// Make a factory available to `skill.json` manifests.
    pub fn with_factory(mut self, name: impl Into<String>, factory: SkillFactory) -> Self {
        self.factories.push((name.into(), factory));
        self
    }

    pub fn with_skill(mut self, skill: Arc<dyn Skill>) -> Self {
        self.skills.push(skill);
        self
    }

    pub async fn build(self) -> Result<Agent> {
        let config = self.config;
        config.validate()?;

        let storage: Arc<dyn Storage> = match self.storage {
            Some(storage) => storage,
            None => {
                let path = config.database_path()?;
                info!(path = %path.display(), "Opening agent database");
                Arc::new(SqliteStorage::open(path)?)
            }
        };

        let graph = Arc::new(MemoryGraph::with_config(config.retrieval.clone()));
        // A missing snapshot is `LoadOutcome::Empty`; anything unreadable is fatal
        let load = graph.load(storage.as_ref()).await?;

        let registry = Arc::new(SkillRegistry::with_config(config.registry.clone()));
        if config.builtin_skills {
            register_builtins(&registry)?;
        }
        for skill in self.skills {
            registry.register(skill)?;
        }
        for (name, factory) in self.factories {
            registry.register_factory(name, factory)?;
        }
        let discovery = registry.discover(&config.registry.skill_dirs);
        for failure in &discovery.failed {
            warn!(path = %failure.path.display(), error = %failure.error, "Skill not loaded");
        }
        if let Err(e) = registry.restore_state(storage.as_ref()).await {
            warn!(error = %e, "Could not restore skill state");
        }

        let orchestrator = Orchestrator::new(
            Arc::clone(&graph),
            Arc::clone(&registry),
            self.reasoner,
        )
        .with_config(config.orchestrator.clone())
        .with_storage(Arc::clone(&storage));

        info!(
            nodes = graph.node_count(),
            skills = registry.len(),
            discovered = discovery.registered.len(),
            "Agent ready"
        );
        Ok(Agent {
            config,
            storage,
            graph,
            registry,
            orchestrator,
            discovery,
            load,
        })
    }
}

/// One agent session.
pub struct Agent {
    config: AgentConfig,
    storage: Arc<dyn Storage>,
    graph: Arc<MemoryGraph>,
    registry: Arc<SkillRegistry>,
    orchestrator: Orchestrator,
    discovery: DiscoveryReport,
    load: LoadOutcome,
}

impl Agent {
    /// Open a session with default wiring.
    pub async fn open(config: AgentConfig, reasoner: Arc<dyn Reasoner>) -> Result<Self> {
        AgentBuilder::new(config, reasoner).build().await
    }

    pub fn builder(config: AgentConfig, reasoner: Arc<dyn Reasoner>) -> AgentBuilder {
        AgentBuilder::new(config, reasoner)
    }

    pub async fn process(&self, query: &str) -> std::result::Result<CycleResponse, CycleError> {
        self.orchestrator.process(query).await
    }

    pub async fn process_with_cancel(
        &self,
        query: &str,
        cancel: &CancelToken,
    ) -> std::result::Result<CycleResponse, CycleError> {
        self.orchestrator.process_with_cancel(query, cancel).await
    }

    /// Store a fact directly, outside any cycle.
    pub fn add_memory(
        &self,
        kind: NodeKind,
        content: &str,
        importance: Option<f64>,
    ) -> Result<NodeId> {
        let content = content.trim();
        if content.is_empty() {
            return Err(Error::Config("memory content is empty".into()));
        }
        match importance {
            Some(importance) => self.graph.add_node_with_importance(kind, content, importance),
            None => self.graph.add_node(kind, content),
        }
    }

    /// Rank memory against `query` without touching anything.
    pub fn search_memory(&self, query: &str, limit: usize) -> Result<ContextWindow> {
        self.graph.retrieve_context(query, limit)
    }

    /// Persist the graph and the registry's enabled flags.
    pub async fn save(&self) -> Result<GraphMeta> {
        let meta = self.graph.save(self.storage.as_ref()).await?;
        self.registry.save_state(self.storage.as_ref()).await?;
        Ok(meta)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<CycleEvent> {
        self.orchestrator.subscribe()
    }

    pub fn config(&self) -> &AgentConfig {
        &self.config
    }

    pub fn graph(&self) -> &Arc<MemoryGraph> {
        &self.graph
    }

    pub fn registry(&self) -> &Arc<SkillRegistry> {
        &self.registry
    }

    pub fn orchestrator(&self) -> &Orchestrator {
        &self.orchestrator
    }

    /// What manifest discovery found when the session opened.
    pub fn discovery(&self) -> &DiscoveryReport {
        &self.discovery
    }

    /// What the graph load found when the session opened.
    pub fn load_outcome(&self) -> &LoadOutcome {
        &self.load
    }
}
