//! Error types for synk-core.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Result type alias using synk-core's Error type.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in the memory graph, skill registry and orchestration loop.
#[derive(Error, Debug)]
pub enum Error {
    /// A node, edge or skill does not exist
    #[error("{entity} not found: {id}")]
    NotFound { entity: &'static str, id: String },

    /// A skill with this name is already registered
    #[error("Skill already registered: {0}")]
    DuplicateSkill(String),

    /// A skill descriptor is malformed
    #[error("Invalid schema for skill '{skill}': {message}")]
    InvalidSchema { skill: String, message: String },

    /// A parameter failed presence or type checks
    #[error("Invalid parameter '{parameter}' for skill '{skill}': {message}")]
    ParameterValidation {
        skill: String,
        parameter: String,
        message: String,
    },

    /// The reasoning collaborator failed or returned malformed output
    #[error("Reasoning failure: {0}")]
    ReasoningFailure(String),

    /// A skill implementation failed
    #[error("Skill '{skill}' failed: {message}")]
    SkillExecution { skill: String, message: String },

    /// The storage collaborator failed
    #[error("Persistence failure: {message}")]
    PersistenceFailure {
        message: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    /// Timeout during operation
    #[error("Operation timed out after {duration_ms}ms")]
    Timeout { duration_ms: u64 },

    /// Cooperative cancellation was requested
    #[error("Operation cancelled")]
    Cancelled,

    /// Serialization/deserialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

/// Coarse classification of an [`Error`], stable enough to hand to callers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    NotFound,
    DuplicateSkill,
    InvalidSchema,
    ParameterValidation,
    ReasoningFailure,
    SkillExecutionFailure,
    PersistenceFailure,
    Timeout,
    Cancelled,
    Serialization,
    Config,
    Internal,
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::NotFound => "not_found",
            Self::DuplicateSkill => "duplicate_skill",
            Self::InvalidSchema => "invalid_schema",
            Self::ParameterValidation => "parameter_validation",
            Self::ReasoningFailure => "reasoning_failure",
            Self::SkillExecutionFailure => "skill_execution_failure",
            Self::PersistenceFailure => "persistence_failure",
            Self::Timeout => "timeout",
            Self::Cancelled => "cancelled",
            Self::Serialization => "serialization",
            Self::Config => "config",
            Self::Internal => "internal",
        };
        write!(f, "{}", s)
    }
}

impl Error {
    /// Create a not-found error for a graph node.
    pub fn node_not_found(id: impl ToString) -> Self {
        Self::NotFound {
            entity: "node",
            id: id.to_string(),
        }
    }

    /// Create a not-found error for a graph edge.
    pub fn edge_not_found(id: impl ToString) -> Self {
        Self::NotFound {
            entity: "edge",
            id: id.to_string(),
        }
    }

    /// Create a not-found error for a skill (absent or disabled).
    pub fn skill_not_found(name: impl Into<String>) -> Self {
        Self::NotFound {
            entity: "skill",
            id: name.into(),
        }
    }

    /// Create an invalid schema error.
    pub fn invalid_schema(skill: impl Into<String>, message: impl Into<String>) -> Self {
        Self::InvalidSchema {
            skill: skill.into(),
            message: message.into(),
        }
    }

    /// Create a parameter validation error.
    pub fn parameter_validation(
        skill: impl Into<String>,
        parameter: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self::ParameterValidation {
            skill: skill.into(),
            parameter: parameter.into(),
            message: message.into(),
        }
    }

    /// Create a skill execution error.
    pub fn skill_execution(skill: impl Into<String>, message: impl Into<String>) -> Self {
        Self::SkillExecution {
            skill: skill.into(),
            message: message.into(),
        }
    }

    /// Create a persistence error.
    pub fn persistence(message: impl Into<String>) -> Self {
        Self::PersistenceFailure {
            message: message.into(),
            source: None,
        }
    }

    /// Create a persistence error with source.
    pub fn persistence_with_source(
        message: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self::PersistenceFailure {
            message: message.into(),
            source: Some(Box::new(source)),
        }
    }

    /// Create a timeout error.
    pub fn timeout(duration_ms: u64) -> Self {
        Self::Timeout { duration_ms }
    }

    /// True when this is a skill lookup failure (absent or disabled skill).
    pub fn is_skill_not_found(&self) -> bool {
        matches!(self, Self::NotFound { entity: "skill", .. })
    }

    /// Classify this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::NotFound { .. } => ErrorKind::NotFound,
            Self::DuplicateSkill(_) => ErrorKind::DuplicateSkill,
            Self::InvalidSchema { .. } => ErrorKind::InvalidSchema,
            Self::ParameterValidation { .. } => ErrorKind::ParameterValidation,
            Self::ReasoningFailure(_) => ErrorKind::ReasoningFailure,
            Self::SkillExecution { .. } => ErrorKind::SkillExecutionFailure,
            Self::PersistenceFailure { .. } => ErrorKind::PersistenceFailure,
            Self::Timeout { .. } => ErrorKind::Timeout,
            Self::Cancelled => ErrorKind::Cancelled,
            Self::Serialization(_) => ErrorKind::Serialization,
            Self::Config(_) => ErrorKind::Config,
            Self::Internal(_) => ErrorKind::Internal,
        }
    }
}

impl From<rusqlite::Error> for Error {
    fn from(e: rusqlite::Error) -> Self {
        Self::persistence_with_source("SQLite operation failed", e)
    }
}
