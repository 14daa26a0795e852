//! The skill registry.
//!
//! Skills are stored by name with an enabled flag. Lookups hand out
//! `Arc<dyn Skill>` clones so no lock is held while a skill runs.

use super::manifest::SkillManifest;
use super::validation::validate_params;
use super::{ExecutionResult, Params, Skill, SkillContext, SkillDescriptor};
use crate::error::{Error, Result};
use crate::storage::{read_json, write_json, Storage};
use futures::FutureExt;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// Storage prefix for persisted registry state.
pub const STATE_PREFIX: &str = "skills/";

/// What to do when a skill name is registered twice.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RegistrationPolicy {
    /// Fail with `DuplicateSkill`
    #[default]
    Reject,
    /// Swap in the new implementation, keeping the enabled flag
    Replace,
}

/// Configuration for the skill registry.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RegistryConfig {
    /// Per-invocation timeout in milliseconds
    pub default_timeout_ms: u64,
    pub registration_policy: RegistrationPolicy,
    /// Locations scanned for `skill.json` manifests (directories, files or globs)
    pub skill_dirs: Vec<String>,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            default_timeout_ms: 30_000,
            registration_policy: RegistrationPolicy::Reject,
            skill_dirs: Vec::new(),
        }
    }
}

impl RegistryConfig {
    pub fn with_timeout_ms(mut self, ms: u64) -> Self {
        self.default_timeout_ms = ms;
        self
    }

    pub fn with_policy(mut self, policy: RegistrationPolicy) -> Self {
        self.registration_policy = policy;
        self
    }

    pub fn with_skill_dir(mut self, dir: impl Into<String>) -> Self {
        self.skill_dirs.push(dir.into());
        self
    }
}

/// Persisted per-skill state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SkillState {
    pub descriptor: SkillDescriptor,
    pub enabled: bool,
}

/// Builds a skill from its manifest. Registered under the manifest's `factory` name.
pub type SkillFactory = Arc<dyn Fn(&SkillManifest) -> Result<Arc<dyn Skill>> + Send + Sync>;

struct SkillEntry {
    skill: Arc<dyn Skill>,
    enabled: bool,
}

/// Registry of available skills.
pub struct SkillRegistry {
    entries: RwLock<BTreeMap<String, SkillEntry>>,
    factories: RwLock<HashMap<String, SkillFactory>>,
    config: RegistryConfig,
}

impl Default for SkillRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for SkillRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SkillRegistry")
            .field("skills", &self.names())
            .field("config", &self.config)
            .finish()
    }
}

impl SkillRegistry {
    /// Create a new empty registry.
    pub fn new() -> Self {
        Self::with_config(RegistryConfig::default())
    }

    pub fn with_config(config: RegistryConfig) -> Self {
        Self {
            entries: RwLock::new(BTreeMap::new()),
            factories: RwLock::new(HashMap::new()),
            config,
        }
    }

    pub fn config(&self) -> &RegistryConfig {
        &self.config
    }

    fn read_entries(&self) -> Result<RwLockReadGuard<'_, BTreeMap<String, SkillEntry>>> {
        self.entries
            .read()
            .map_err(|e| Error::Internal(format!("Failed to lock registry: {}", e)))
    }

    fn write_entries(&self) -> Result<RwLockWriteGuard<'_, BTreeMap<String, SkillEntry>>> {
        self.entries
            .write()
            .map_err(|e| Error::Internal(format!("Failed to lock registry: {}", e)))
    }

    // ==================== Registration ====================

    /// Register a skill, enabled.
    pub fn register(&self, skill: Arc<dyn Skill>) -> Result<()> {
        self.register_with_state(skill, true)
    }

    /// Register a skill with an explicit enabled flag.
    pub fn register_with_state(&self, skill: Arc<dyn Skill>, enabled: bool) -> Result<()> {
        let descriptor = skill.descriptor();
        descriptor.validate()?;
        let name = descriptor.name.clone();

        let mut entries = self.write_entries()?;
        match entries.get_mut(&name) {
            Some(existing) => match self.config.registration_policy {
                RegistrationPolicy::Reject => return Err(Error::DuplicateSkill(name)),
                RegistrationPolicy::Replace => {
                    warn!(
                        skill = %name,
                        old_version = %existing.skill.descriptor().version,
                        new_version = %descriptor.version,
                        "Replacing registered skill"
                    );
                    existing.skill = skill;
                }
            },
            None => {
                info!(skill = %name, version = %descriptor.version, enabled, "Registered skill");
                entries.insert(name, SkillEntry { skill, enabled });
            }
        }
        Ok(())
    }

    /// Remove a skill entirely.
    pub fn unregister(&self, name: &str) -> Result<()> {
        self.write_entries()?
            .remove(name)
            .map(|_| ())
            .ok_or_else(|| Error::skill_not_found(name))
    }

    /// Make a factory available to manifests that name it.
    pub fn register_factory(&self, name: impl Into<String>, factory: SkillFactory) -> Result<()> {
        let name = name.into();
        debug!(factory = %name, "Registered skill factory");
        self.factories
            .write()
            .map_err(|e| Error::Internal(format!("Failed to lock factories: {}", e)))?
            .insert(name, factory);
        Ok(())
    }

    pub(crate) fn factory(&self, name: &str) -> Result<Option<SkillFactory>> {
        Ok(self
            .factories
            .read()
            .map_err(|e| Error::Internal(format!("Failed to lock factories: {}", e)))?
            .get(name)
            .cloned())
    }

    // ==================== Lookup ====================

    /// Look up an enabled skill. Absent and disabled skills are both `NotFound`.
    pub fn resolve(&self, name: &str) -> Result<Arc<dyn Skill>> {
        let entries = self.read_entries()?;
        match entries.get(name) {
            Some(entry) if entry.enabled => Ok(Arc::clone(&entry.skill)),
            _ => Err(Error::skill_not_found(name)),
        }
    }

    pub fn contains(&self, name: &str) -> bool {
        self.read_entries()
            .map(|e| e.contains_key(name))
            .unwrap_or(false)
    }

    pub fn is_enabled(&self, name: &str) -> bool {
        self.read_entries()
            .map(|e| e.get(name).map_or(false, |entry| entry.enabled))
            .unwrap_or(false)
    }

    pub fn enable(&self, name: &str) -> Result<()> {
        self.set_enabled(name, true)
    }

    pub fn disable(&self, name: &str) -> Result<()> {
        self.set_enabled(name, false)
    }

    fn set_enabled(&self, name: &str, enabled: bool) -> Result<()> {
        let mut entries = self.write_entries()?;
        let entry = entries
            .get_mut(name)
            .ok_or_else(|| Error::skill_not_found(name))?;
        if entry.enabled != enabled {
            info!(skill = %name, enabled, "Skill toggled");
        }
        entry.enabled = enabled;
        Ok(())
    }

    /// Registered skill names, sorted.
    pub fn names(&self) -> Vec<String> {
        self.read_entries()
            .map(|e| e.keys().cloned().collect())
            .unwrap_or_default()
    }

    pub fn len(&self) -> usize {
        self.read_entries().map(|e| e.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Descriptors sorted by name.
    pub fn descriptors(&self, enabled_only: bool) -> Vec<SkillDescriptor> {
        self.read_entries()
            .map(|entries| {
                entries
                    .values()
                    .filter(|e| !enabled_only || e.enabled)
                    .map(|e| e.skill.descriptor().clone())
                    .collect()
            })
            .unwrap_or_default()
    }

    // ==================== Execution ====================

    /// Validate raw parameters for an enabled skill.
    pub fn validate_params(&self, name: &str, raw: &Value) -> Result<Params> {
        let skill = self.resolve(name)?;
        validate_params(skill.descriptor(), raw)
    }

    /// Resolve, validate and run a skill with the default timeout.
    pub async fn invoke(&self, name: &str, ctx: &SkillContext, raw: &Value) -> Result<ExecutionResult> {
        self.invoke_with_timeout(name, ctx, raw, None).await
    }

    /// Resolve, validate and run a skill.
    ///
    /// Lookup and validation failures are returned as errors. Once the skill
    /// starts, every outcome is an `ExecutionResult`: implementation errors,
    /// panics and timeouts become failed results.
    pub async fn invoke_with_timeout(
        &self,
        name: &str,
        ctx: &SkillContext,
        raw: &Value,
        timeout: Option<Duration>,
    ) -> Result<ExecutionResult> {
        let skill = self.resolve(name)?;
        let params = validate_params(skill.descriptor(), raw)?;
        let timeout = timeout.unwrap_or(Duration::from_millis(self.config.default_timeout_ms));

        debug!(skill = %name, timeout_ms = timeout.as_millis() as u64, "Invoking skill");
        let start = Instant::now();
        let outcome = tokio::time::timeout(
            timeout,
            AssertUnwindSafe(skill.execute(ctx, params)).catch_unwind(),
        )
        .await;
        let duration_ms = start.elapsed().as_millis() as u64;

        let result = match outcome {
            Ok(Ok(Ok(output))) => ExecutionResult::succeeded(name, output, duration_ms),
            Ok(Ok(Err(err))) => {
                let err = match err {
                    Error::SkillExecution { .. } => err,
                    other => Error::skill_execution(name, other.to_string()),
                };
                ExecutionResult::failed(name, &err, duration_ms)
            }
            Ok(Err(panic)) => {
                let err = Error::skill_execution(name, format!("panicked: {}", panic_message(&panic)));
                ExecutionResult::failed(name, &err, duration_ms)
            }
            Err(_) => ExecutionResult::failed(
                name,
                &Error::timeout(timeout.as_millis() as u64),
                duration_ms,
            ),
        };

        if result.success {
            debug!(skill = %name, duration_ms, "Skill succeeded");
        } else {
            warn!(skill = %name, duration_ms, error = ?result.error, "Skill failed");
        }
        Ok(result)
    }

    // ==================== Persistence ====================

    /// Persist descriptors and enabled flags under `skills/<name>`.
    pub async fn save_state(&self, storage: &dyn Storage) -> Result<usize> {
        let states: Vec<SkillState> = self
            .read_entries()?
            .values()
            .map(|e| SkillState {
                descriptor: e.skill.descriptor().clone(),
                enabled: e.enabled,
            })
            .collect();
        for state in &states {
            let key = format!("{}{}", STATE_PREFIX, state.descriptor.name);
            write_json(storage, &key, state).await?;
        }
        debug!(skills = states.len(), "Saved registry state");
        Ok(states.len())
    }

    /// Re-apply persisted enabled flags to registered skills.
    ///
    /// Returns how many flags were applied. State for skills that are no
    /// longer registered is ignored.
    pub async fn restore_state(&self, storage: &dyn Storage) -> Result<usize> {
        let mut applied = 0;
        for key in storage.list_keys(STATE_PREFIX).await? {
            let Some(state) = read_json::<SkillState>(storage, &key).await? else {
                continue;
            };
            let name = state.descriptor.name.as_str();
            if !self.contains(name) {
                debug!(skill = %name, "Ignoring state for unregistered skill");
                continue;
            }
            self.set_enabled(name, state.enabled)?;
            applied += 1;
        }
        Ok(applied)
    }
}

pub(crate) fn panic_message(panic: &Box<dyn std::any::Any + Send>) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use crate::skills::{ParamType, ParameterSpec, SkillOutput};
    use crate::storage::MemoryStorage;
    use async_trait::async_trait;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    enum Behavior {
        Echo,
        Fail,
        Panic,
        Sleep(u64),
    }

    struct TestSkill {
        descriptor: SkillDescriptor,
        behavior: Behavior,
    }

    impl TestSkill {
        fn new(name: &str, behavior: Behavior) -> Arc<dyn Skill> {
            Arc::new(Self {
                descriptor: SkillDescriptor::new(name, "test skill")
                    .with_parameter(ParameterSpec::new("text", ParamType::String).optional()),
                behavior,
            })
        }
    }

    #[async_trait]
    impl Skill for TestSkill {
        fn descriptor(&self) -> &SkillDescriptor {
            &self.descriptor
        }

        async fn execute(&self, _ctx: &SkillContext, params: Params) -> Result<SkillOutput> {
            match self.behavior {
                Behavior::Echo => Ok(SkillOutput::new(Value::Object(params))),
                Behavior::Fail => Err(Error::Internal("mailbox full".into())),
                Behavior::Panic => panic!("skill exploded"),
                Behavior::Sleep(ms) => {
                    tokio::time::sleep(Duration::from_millis(ms)).await;
                    Ok(SkillOutput::default())
                }
            }
        }
    }

    #[test]
    fn test_duplicate_rejected_by_default() {
        let registry = SkillRegistry::new();
        registry.register(TestSkill::new("echo", Behavior::Echo)).unwrap();
        let err = registry
            .register(TestSkill::new("echo", Behavior::Fail))
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::DuplicateSkill);
    }

    #[tokio::test]
    async fn test_replace_policy_keeps_enabled_flag() {
        let registry =
            SkillRegistry::with_config(RegistryConfig::default().with_policy(RegistrationPolicy::Replace));
        registry.register(TestSkill::new("echo", Behavior::Fail)).unwrap();
        registry.disable("echo").unwrap();
        registry.register(TestSkill::new("echo", Behavior::Echo)).unwrap();
        assert!(!registry.is_enabled("echo"));

        registry.enable("echo").unwrap();
        let result = registry
            .invoke("echo", &SkillContext::new("q"), &json!({"text": "hi"}))
            .await
            .unwrap();
        assert!(result.success);
    }

    #[test]
    fn test_invalid_schema_rejected() {
        let registry = SkillRegistry::new();
        let err = registry
            .register(TestSkill::new("Bad Name", Behavior::Echo))
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidSchema);
        assert!(registry.is_empty());
    }

    #[tokio::test]
    async fn test_disabled_skill_not_found() {
        let registry = SkillRegistry::new();
        registry.register(TestSkill::new("email", Behavior::Echo)).unwrap();
        registry.disable("email").unwrap();

        assert!(registry.resolve("email").err().unwrap().is_skill_not_found());
        let err = registry
            .invoke("email", &SkillContext::new("q"), &json!({}))
            .await
            .unwrap_err();
        assert!(err.is_skill_not_found());
        assert_eq!(registry.descriptors(true).len(), 0);
        assert_eq!(registry.descriptors(false).len(), 1);
    }

    #[tokio::test]
    async fn test_validation_error_is_returned() {
        let registry = SkillRegistry::new();
        registry.register(TestSkill::new("echo", Behavior::Echo)).unwrap();
        let err = registry
            .invoke("echo", &SkillContext::new("q"), &json!({"bogus": 1}))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ParameterValidation);
    }

    #[tokio::test]
    async fn test_failures_become_results() {
        let registry = SkillRegistry::with_config(RegistryConfig::default().with_timeout_ms(20));
        registry.register(TestSkill::new("fail", Behavior::Fail)).unwrap();
        registry.register(TestSkill::new("boom", Behavior::Panic)).unwrap();
        registry.register(TestSkill::new("slow", Behavior::Sleep(200))).unwrap();
        let ctx = SkillContext::new("q");

        let failed = registry.invoke("fail", &ctx, &json!({})).await.unwrap();
        assert!(!failed.success);
        assert_eq!(failed.error_kind, Some(ErrorKind::SkillExecutionFailure));
        assert!(failed.error.unwrap().contains("mailbox full"));

        let panicked = registry.invoke("boom", &ctx, &json!({})).await.unwrap();
        assert!(!panicked.success);
        assert!(panicked.error.unwrap().contains("skill exploded"));

        let timed_out = registry.invoke("slow", &ctx, &json!({})).await.unwrap();
        assert!(!timed_out.success);
        assert_eq!(timed_out.error_kind, Some(ErrorKind::Timeout));

        let fast_enough = registry
            .invoke_with_timeout("slow", &ctx, &json!({}), Some(Duration::from_secs(30)))
            .await;
        assert!(fast_enough.is_ok());
    }

    #[tokio::test]
    async fn test_state_roundtrip() {
        let storage = MemoryStorage::new();
        let registry = SkillRegistry::new();
        registry.register(TestSkill::new("email", Behavior::Echo)).unwrap();
        registry.register(TestSkill::new("time", Behavior::Echo)).unwrap();
        registry.disable("email").unwrap();
        assert_eq!(registry.save_state(&storage).await.unwrap(), 2);

        let fresh = SkillRegistry::new();
        fresh.register(TestSkill::new("email", Behavior::Echo)).unwrap();
        assert_eq!(fresh.restore_state(&storage).await.unwrap(), 1);
        assert!(!fresh.is_enabled("email"));
        assert!(!fresh.contains("time"));
    }

    #[test]
    fn test_unregister() {
        let registry = SkillRegistry::new();
        registry.register(TestSkill::new("echo", Behavior::Echo)).unwrap();
        registry.unregister("echo").unwrap();
        assert!(registry.unregister("echo").is_err());
    }
}
