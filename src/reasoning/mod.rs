//! The reasoning collaborator.
//!
//! A [`Reasoner`] looks at the query, the retrieved context and the skills on
//! offer, and returns a [`Decision`]: which skills to invoke with which
//! parameters, whether they must run in order, and optionally a response.
//!
//! [`TextReasoner`] adapts any text-completion backend ([`Completer`]) by
//! building a prompt and parsing the JSON decision out of the reply.

mod text;

pub use text::{extract_decision, Completer, TextReasoner, DEFAULT_SYSTEM_PROMPT};

use crate::error::Result;
use crate::memory::Node;
use crate::skills::SkillDescriptor;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// One skill the reasoner wants invoked.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SkillInvocation {
    #[serde(alias = "name")]
    pub skill: String,
    #[serde(default, alias = "parameters")]
    pub params: Value,
    /// Overrides the registry's per-skill timeout
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_ms: Option<u64>,
}

impl SkillInvocation {
    pub fn new(skill: impl Into<String>, params: Value) -> Self {
        Self {
            skill: skill.into(),
            params,
            timeout_ms: None,
        }
    }

    pub fn with_timeout_ms(mut self, ms: u64) -> Self {
        self.timeout_ms = Some(ms);
        self
    }
}

/// What the reasoner decided for one query.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Decision {
    /// Skills to invoke, in order
    #[serde(default, alias = "skills")]
    pub invocations: Vec<SkillInvocation>,
    /// Run invocations one after another instead of concurrently
    #[serde(default)]
    pub sequential: bool,
    /// Response text for the user
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub response: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reasoning: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub intent: Option<String>,
}

impl Decision {
    /// A decision that only answers.
    pub fn respond(response: impl Into<String>) -> Self {
        Self {
            response: Some(response.into()),
            ..Default::default()
        }
    }

    pub fn with_invocation(mut self, invocation: SkillInvocation) -> Self {
        self.invocations.push(invocation);
        self
    }

    pub fn sequential(mut self) -> Self {
        self.sequential = true;
        self
    }

    pub fn with_response(mut self, response: impl Into<String>) -> Self {
        self.response = Some(response.into());
        self
    }

    pub fn is_noop(&self) -> bool {
        self.invocations.is_empty()
    }
}

/// Decides what to do about a query.
#[async_trait]
pub trait Reasoner: Send + Sync {
    async fn reason(
        &self,
        query: &str,
        context: &[Node],
        skills: &[SkillDescriptor],
    ) -> Result<Decision>;
}
