//! Reasoning over a plain text-completion backend.

use super::{Decision, Reasoner};
use crate::error::{Error, Result};
use crate::memory::Node;
use crate::skills::SkillDescriptor;
use async_trait::async_trait;
use regex::Regex;
use std::sync::OnceLock;
use tracing::debug;

/// Instructions sent as the system prompt.
pub const DEFAULT_SYSTEM_PROMPT: &str = "You are a personal assistant with long-term memory. \
Decide which of the available skills, if any, should run to satisfy the user's request. \
Reply with a single JSON object and nothing else:\n\
{\"reasoning\": string, \"intent\": string, \
\"skills\": [{\"name\": string, \"params\": object}], \
\"sequential\": boolean, \"response\": string}\n\
Only use skills from the list. Use an empty skills list when no action is needed.";

/// A text-completion backend.
#[async_trait]
pub trait Completer: Send + Sync {
    async fn complete(&self, system: &str, prompt: &str) -> Result<String>;
}

/// A [`Reasoner`] that prompts a [`Completer`] and parses its JSON reply.
pub struct TextReasoner<C: Completer> {
    completer: C,
    system_prompt: String,
}

impl<C: Completer> TextReasoner<C> {
    pub fn new(completer: C) -> Self {
        Self {
            completer,
            system_prompt: DEFAULT_SYSTEM_PROMPT.to_string(),
        }
    }

    pub fn with_system_prompt(mut self, prompt: impl Into<String>) -> Self {
        self.system_prompt = prompt.into();
        self
    }

    /// Build the user prompt for a query.
    pub fn build_prompt(query: &str, context: &[Node], skills: &[SkillDescriptor]) -> String {
        let memory = if context.is_empty() {
            "(nothing relevant remembered)".to_string()
        } else {
            context
                .iter()
                .map(|n| format!("- [{}] {}", n.kind, n.content))
                .collect::<Vec<_>>()
                .join("\n")
        };
        let available = if skills.is_empty() {
            "(none)".to_string()
        } else {
            skills
                .iter()
                .map(SkillDescriptor::to_prompt_line)
                .collect::<Vec<_>>()
                .join("\n")
        };
        format!(
            "Relevant memory:\n{}\n\nAvailable skills:\n{}\n\nUser request: {}",
            memory, available, query
        )
    }
}

#[async_trait]
impl<C: Completer> Reasoner for TextReasoner<C> {
    async fn reason(
        &self,
        query: &str,
        context: &[Node],
        skills: &[SkillDescriptor],
    ) -> Result<Decision> {
        let prompt = Self::build_prompt(query, context, skills);
        let reply = self
            .completer
            .complete(&self.system_prompt, &prompt)
            .await
            .map_err(|e| match e {
                Error::ReasoningFailure(_) | Error::Cancelled | Error::Timeout { .. } => e,
                other => Error::ReasoningFailure(other.to_string()),
            })?;
        debug!(reply_len = reply.len(), "Reasoner replied");
        extract_decision(&reply)
    }
}

fn object_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"(?s)\{.*\}").expect("valid object pattern"))
}

/// Pull the JSON decision out of a model reply.
///
/// Surrounding prose and code fences are tolerated. A reply without a JSON
/// object, or with one that is not a decision, is a `ReasoningFailure`.
pub fn extract_decision(reply: &str) -> Result<Decision> {
    let found = object_pattern()
        .find(reply)
        .ok_or_else(|| Error::ReasoningFailure("reply contains no JSON object".to_string()))?;
    let mut decision: Decision = serde_json::from_str(found.as_str())
        .map_err(|e| Error::ReasoningFailure(format!("malformed decision: {}", e)))?;

    if let Some(bad) = decision
        .invocations
        .iter()
        .find(|i| i.skill.trim().is_empty())
    {
        return Err(Error::ReasoningFailure(format!(
            "invocation without a skill name: {:?}",
            bad
        )));
    }
    if decision
        .response
        .as_deref()
        .is_some_and(|r| r.trim().is_empty())
    {
        decision.response = None;
    }
    Ok(decision)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use crate::memory::NodeKind;
    use crate::skills::{ParamType, ParameterSpec};
    use pretty_assertions::assert_eq;
    use serde_json::json;
    use std::sync::Mutex;

    struct CannedCompleter {
        reply: Result<String>,
        last_prompt: Mutex<Option<String>>,
    }

    impl CannedCompleter {
        fn new(reply: Result<String>) -> Self {
            Self {
                reply,
                last_prompt: Mutex::new(None),
            }
        }
    }

    #[async_trait]
    impl Completer for CannedCompleter {
        async fn complete(&self, _system: &str, prompt: &str) -> Result<String> {
            *self.last_prompt.lock().unwrap() = Some(prompt.to_string());
            match &self.reply {
                Ok(text) => Ok(text.clone()),
                Err(e) => Err(Error::Internal(e.to_string())),
            }
        }
    }

    #[test]
    fn test_extract_from_fenced_reply() {
        let reply = "Sure!\n```json\n{\"skills\": [{\"name\": \"create_task\", \"params\": {\"title\": \"call John\", \"due\": \"tomorrow\"}}], \"response\": \"Added.\"}\n```";
        let decision = extract_decision(reply).unwrap();
        assert_eq!(decision.invocations.len(), 1);
        assert_eq!(
            decision.invocations[0].params,
            json!({"title": "call John", "due": "tomorrow"})
        );
        assert_eq!(decision.response.as_deref(), Some("Added."));
    }

    #[test]
    fn test_malformed_reply_is_failure() {
        for reply in ["I think you should call John.", "{not json}", "{\"skills\": \"all\"}"] {
            let err = extract_decision(reply).unwrap_err();
            assert_eq!(err.kind(), ErrorKind::ReasoningFailure, "reply: {reply}");
        }
        let err = extract_decision("{\"skills\": [{\"name\": \"  \"}]}").unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ReasoningFailure);
    }

    #[test]
    fn test_empty_response_is_none() {
        let decision = extract_decision("{\"skills\": [], \"response\": \"\"}").unwrap();
        assert!(decision.is_noop());
        assert_eq!(decision.response, None);
    }

    #[tokio::test]
    async fn test_text_reasoner_prompt_and_parse() {
        let reasoner = TextReasoner::new(CannedCompleter::new(Ok(
            "{\"skills\": [{\"name\": \"current_time\"}], \"sequential\": true}".to_string(),
        )));
        let node = Node::new(NodeKind::Entity, "John", 0.5, chrono::Utc::now());
        let skill = SkillDescriptor::new("current_time", "Get the time")
            .with_parameter(ParameterSpec::new("format", ParamType::String).optional());

        let decision = reasoner
            .reason("what time is it?", &[node], &[skill])
            .await
            .unwrap();
        assert!(decision.sequential);
        assert_eq!(decision.invocations[0].skill, "current_time");

        let prompt = reasoner.completer.last_prompt.lock().unwrap().clone().unwrap();
        assert!(prompt.contains("- [entity] John"));
        assert!(prompt.contains("- current_time(format?: string): Get the time"));
        assert!(prompt.ends_with("User request: what time is it?"));
    }

    #[tokio::test]
    async fn test_backend_error_becomes_reasoning_failure() {
        let reasoner =
            TextReasoner::new(CannedCompleter::new(Err(Error::Internal("503".into()))));
        let err = reasoner.reason("hi", &[], &[]).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ReasoningFailure);
    }
}
