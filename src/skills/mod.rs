//! Skill contract and registry.
//!
//! A skill is an action the agent can take on the user's behalf. Every skill
//! declares a [`SkillDescriptor`] (name, version, typed parameters) and
//! implements [`Skill::execute`]. The [`SkillRegistry`] owns the set of known
//! skills, validates parameters against descriptors, and turns every
//! execution outcome (including panics and timeouts) into an
//! [`ExecutionResult`].
//!
//! Skills never write to the memory graph directly. Anything they want
//! remembered is returned as [`NodeDraft`] records, which the orchestration
//! loop persists together with the event that produced them.
//!
//! ## Example
//!
//! ```rust,ignore
//! use synk_core::skills::{SkillRegistry, SkillContext, builtin};
//! use serde_json::json;
//!
//! let registry = SkillRegistry::new();
//! builtin::register_builtins(&registry)?;
//!
//! let ctx = SkillContext::new("remind me to call John");
//! let result = registry
//!     .invoke("create_task", &ctx, &json!({"title": "call John", "due": "tomorrow"}))
//!     .await?;
//! assert!(result.success);
//! ```

pub mod builtin;
mod command;
mod manifest;
mod registry;
mod validation;

pub use command::CommandSkill;
pub use manifest::{DiscoveryFailure, DiscoveryReport, SkillManifest, MANIFEST_FILE};
pub use registry::{RegistrationPolicy, RegistryConfig, SkillFactory, SkillRegistry, SkillState};
pub use validation::{coerce_value, validate_params};

use crate::error::{Error, ErrorKind, Result};
use crate::memory::{Node, NodeKind};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::{BTreeMap, HashSet};
use std::fmt;
use std::sync::OnceLock;
use uuid::Uuid;

/// Validated skill parameters.
pub type Params = Map<String, Value>;

/// Declared type of a skill parameter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ParamType {
    String,
    Integer,
    Number,
    Boolean,
    Array,
    Object,
    /// Any JSON value, passed through unchanged
    Any,
}

impl ParamType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::String => "string",
            Self::Integer => "integer",
            Self::Number => "number",
            Self::Boolean => "boolean",
            Self::Array => "array",
            Self::Object => "object",
            Self::Any => "any",
        }
    }
}

impl fmt::Display for ParamType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One declared parameter.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParameterSpec {
    pub name: String,
    #[serde(rename = "type")]
    pub param_type: ParamType,
    #[serde(default = "default_required")]
    pub required: bool,
    #[serde(default)]
    pub description: String,
    /// Value used when the parameter is omitted
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default: Option<Value>,
}

fn default_required() -> bool {
    true
}

impl ParameterSpec {
    /// A required parameter.
    pub fn new(name: impl Into<String>, param_type: ParamType) -> Self {
        Self {
            name: name.into(),
            param_type,
            required: true,
            description: String::new(),
            default: None,
        }
    }

    pub fn optional(mut self) -> Self {
        self.required = false;
        self
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    /// Set a default. Parameters with a default are never reported missing.
    pub fn with_default(mut self, default: Value) -> Self {
        self.default = Some(default);
        self.required = false;
        self
    }
}

/// Static metadata describing a skill.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SkillDescriptor {
    /// Unique registry key
    pub name: String,
    pub description: String,
    /// Semantic version (`MAJOR.MINOR.PATCH`)
    #[serde(default = "default_version")]
    pub version: String,
    #[serde(default)]
    pub parameters: Vec<ParameterSpec>,
    #[serde(default)]
    pub author: String,
}

fn default_version() -> String {
    "0.1.0".to_string()
}

fn semver_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"^(0|[1-9]\d*)\.(0|[1-9]\d*)\.(0|[1-9]\d*)(?:-[0-9A-Za-z.-]+)?(?:\+[0-9A-Za-z.-]+)?$")
            .expect("valid semver pattern")
    })
}

fn name_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"^[a-z][a-z0-9_]*$").expect("valid skill name pattern")
    })
}

impl SkillDescriptor {
    pub fn new(name: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
            version: default_version(),
            parameters: Vec::new(),
            author: String::new(),
        }
    }

    pub fn with_version(mut self, version: impl Into<String>) -> Self {
        self.version = version.into();
        self
    }

    pub fn with_author(mut self, author: impl Into<String>) -> Self {
        self.author = author.into();
        self
    }

    pub fn with_parameter(mut self, param: ParameterSpec) -> Self {
        self.parameters.push(param);
        self
    }

    pub fn parameter(&self, name: &str) -> Option<&ParameterSpec> {
        self.parameters.iter().find(|p| p.name == name)
    }

    /// Check that the descriptor is well formed.
    ///
    /// Names are lowercase snake case, versions are semantic versions,
    /// parameter names are unique and defaults match their declared type.
    pub fn validate(&self) -> Result<()> {
        if !name_pattern().is_match(&self.name) {
            return Err(Error::invalid_schema(
                &self.name,
                "name must be lowercase snake_case",
            ));
        }
        if !semver_pattern().is_match(&self.version) {
            return Err(Error::invalid_schema(
                &self.name,
                format!("'{}' is not a semantic version", self.version),
            ));
        }
        let mut seen = HashSet::new();
        for param in &self.parameters {
            if param.name.trim().is_empty() {
                return Err(Error::invalid_schema(&self.name, "parameter with empty name"));
            }
            if !seen.insert(param.name.as_str()) {
                return Err(Error::invalid_schema(
                    &self.name,
                    format!("duplicate parameter '{}'", param.name),
                ));
            }
            if let Some(default) = &param.default {
                if coerce_value(default, param.param_type).is_none() {
                    return Err(Error::invalid_schema(
                        &self.name,
                        format!(
                            "default for '{}' is not a valid {}",
                            param.name, param.param_type
                        ),
                    ));
                }
            }
        }
        Ok(())
    }

    /// One-line summary used in reasoning prompts.
    pub fn to_prompt_line(&self) -> String {
        let params = self
            .parameters
            .iter()
            .map(|p| {
                let marker = if p.required { "" } else { "?" };
                format!("{}{}: {}", p.name, marker, p.param_type)
            })
            .collect::<Vec<_>>()
            .join(", ");
        format!("- {}({}): {}", self.name, params, self.description)
    }
}

/// Something a skill wants the agent to remember.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeDraft {
    pub kind: NodeKind,
    pub content: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub importance: Option<f64>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub metadata: BTreeMap<String, Value>,
}

impl NodeDraft {
    pub fn new(kind: NodeKind, content: impl Into<String>) -> Self {
        Self {
            kind,
            content: content.into(),
            importance: None,
            metadata: BTreeMap::new(),
        }
    }

    pub fn with_importance(mut self, importance: f64) -> Self {
        self.importance = Some(importance);
        self
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }
}

/// What a skill hands back on success.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SkillOutput {
    #[serde(default)]
    pub payload: Value,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub records: Vec<NodeDraft>,
    /// Short human-readable summary
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl SkillOutput {
    pub fn new(payload: Value) -> Self {
        Self {
            payload,
            ..Default::default()
        }
    }

    pub fn with_record(mut self, record: NodeDraft) -> Self {
        self.records.push(record);
        self
    }

    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = Some(message.into());
        self
    }
}

/// Read-only view handed to a skill for one invocation.
#[derive(Debug, Clone)]
pub struct SkillContext {
    pub cycle_id: Option<Uuid>,
    pub query: String,
    /// Nodes retrieved for the current cycle
    pub context: Vec<Node>,
    pub now: DateTime<Utc>,
}

impl SkillContext {
    pub fn new(query: impl Into<String>) -> Self {
        Self {
            cycle_id: None,
            query: query.into(),
            context: Vec::new(),
            now: Utc::now(),
        }
    }

    pub fn with_cycle(mut self, cycle_id: Uuid) -> Self {
        self.cycle_id = Some(cycle_id);
        self
    }

    pub fn with_context(mut self, context: Vec<Node>) -> Self {
        self.context = context;
        self
    }

    pub fn with_now(mut self, now: DateTime<Utc>) -> Self {
        self.now = now;
        self
    }
}

/// Outcome of one skill invocation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionResult {
    pub skill: String,
    pub success: bool,
    #[serde(default)]
    pub payload: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_kind: Option<ErrorKind>,
    pub timestamp: DateTime<Utc>,
    pub duration_ms: u64,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub records: Vec<NodeDraft>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl ExecutionResult {
    pub fn succeeded(skill: impl Into<String>, output: SkillOutput, duration_ms: u64) -> Self {
        Self {
            skill: skill.into(),
            success: true,
            payload: output.payload,
            error: None,
            error_kind: None,
            timestamp: Utc::now(),
            duration_ms,
            records: output.records,
            message: output.message,
        }
    }

    pub fn failed(skill: impl Into<String>, error: &Error, duration_ms: u64) -> Self {
        Self {
            skill: skill.into(),
            success: false,
            payload: Value::Null,
            error: Some(error.to_string()),
            error_kind: Some(error.kind()),
            timestamp: Utc::now(),
            duration_ms,
            records: Vec::new(),
            message: None,
        }
    }

    /// One-line summary used for event nodes and synthesized responses.
    pub fn summary(&self) -> String {
        if self.success {
            match &self.message {
                Some(message) => format!("{} succeeded: {}", self.skill, message),
                None => format!("{} succeeded", self.skill),
            }
        } else {
            format!(
                "{} failed: {}",
                self.skill,
                self.error.as_deref().unwrap_or("unknown error")
            )
        }
    }
}

/// An action the agent can perform.
#[async_trait]
pub trait Skill: Send + Sync {
    /// Static metadata. Must be stable for the lifetime of the skill.
    fn descriptor(&self) -> &SkillDescriptor;

    /// Run the skill with parameters already validated against the descriptor.
    async fn execute(&self, ctx: &SkillContext, params: Params) -> Result<SkillOutput>;
}
