//! Skills that ship with the crate.
//!
//! - `create_task`: record an action item
//! - `remember`: store a free-form fact
//! - `current_time`: report the current time

use super::{
    NodeDraft, ParamType, ParameterSpec, Params, Skill, SkillContext, SkillDescriptor,
    SkillOutput, SkillRegistry,
};
use crate::error::{Error, Result};
use crate::memory::NodeKind;
use async_trait::async_trait;
use serde_json::json;
use std::sync::Arc;

const AUTHOR: &str = "synk-core";

fn str_param<'a>(params: &'a Params, name: &str) -> Option<&'a str> {
    params.get(name).and_then(|v| v.as_str())
}

/// Record an action item as a task node.
pub struct CreateTask {
    descriptor: SkillDescriptor,
}

impl Default for CreateTask {
    fn default() -> Self {
        Self::new()
    }
}

impl CreateTask {
    pub fn new() -> Self {
        Self {
            descriptor: SkillDescriptor::new("create_task", "Create a task or reminder")
                .with_version("1.0.0")
                .with_author(AUTHOR)
                .with_parameter(
                    ParameterSpec::new("title", ParamType::String)
                        .with_description("What needs to be done"),
                )
                .with_parameter(
                    ParameterSpec::new("due", ParamType::String)
                        .optional()
                        .with_description("When it is due, free text"),
                )
                .with_parameter(
                    ParameterSpec::new("priority", ParamType::String)
                        .with_default(json!("normal"))
                        .with_description("low, normal or high"),
                ),
        }
    }
}

#[async_trait]
impl Skill for CreateTask {
    fn descriptor(&self) -> &SkillDescriptor {
        &self.descriptor
    }

    async fn execute(&self, _ctx: &SkillContext, params: Params) -> Result<SkillOutput> {
        let title = str_param(&params, "title")
            .map(str::trim)
            .filter(|t| !t.is_empty())
            .ok_or_else(|| Error::skill_execution("create_task", "title is empty"))?;
        let priority = str_param(&params, "priority").unwrap_or("normal");
        let importance = match priority {
            "high" => 0.8,
            "low" => 0.3,
            _ => 0.6,
        };

        let mut draft = NodeDraft::new(NodeKind::Task, title)
            .with_importance(importance)
            .with_metadata("priority", priority);
        if let Some(due) = str_param(&params, "due") {
            draft = draft.with_metadata("due", due);
        }

        Ok(SkillOutput::new(json!({
            "title": title,
            "due": str_param(&params, "due"),
            "priority": priority,
        }))
        .with_message(format!("created task '{}'", title))
        .with_record(draft))
    }
}

/// Store a fact the user asked to keep.
pub struct Remember {
    descriptor: SkillDescriptor,
}

impl Default for Remember {
    fn default() -> Self {
        Self::new()
    }
}

impl Remember {
    pub fn new() -> Self {
        Self {
            descriptor: SkillDescriptor::new("remember", "Remember a fact for later")
                .with_version("1.0.0")
                .with_author(AUTHOR)
                .with_parameter(ParameterSpec::new("content", ParamType::String))
                .with_parameter(
                    ParameterSpec::new("kind", ParamType::String)
                        .with_default(json!("concept"))
                        .with_description("entity, event, concept, task or context"),
                )
                .with_parameter(ParameterSpec::new("importance", ParamType::Number).optional()),
        }
    }
}

#[async_trait]
impl Skill for Remember {
    fn descriptor(&self) -> &SkillDescriptor {
        &self.descriptor
    }

    async fn execute(&self, _ctx: &SkillContext, params: Params) -> Result<SkillOutput> {
        let content = str_param(&params, "content").unwrap_or_default().trim();
        if content.is_empty() {
            return Err(Error::skill_execution("remember", "nothing to remember"));
        }
        let kind: NodeKind = str_param(&params, "kind")
            .unwrap_or("concept")
            .parse()
            .map_err(|e: String| Error::skill_execution("remember", e))?;

        let mut draft = NodeDraft::new(kind, content);
        if let Some(importance) = params.get("importance").and_then(|v| v.as_f64()) {
            draft = draft.with_importance(importance);
        }

        Ok(SkillOutput::new(json!({"content": content, "kind": kind}))
            .with_message(format!("remembered {} '{}'", kind, content))
            .with_record(draft))
    }
}

/// Report the current time.
pub struct CurrentTime {
    descriptor: SkillDescriptor,
}

impl Default for CurrentTime {
    fn default() -> Self {
        Self::new()
    }
}

impl CurrentTime {
    pub fn new() -> Self {
        Self {
            descriptor: SkillDescriptor::new("current_time", "Get the current date and time")
                .with_version("1.0.0")
                .with_author(AUTHOR)
                .with_parameter(
                    ParameterSpec::new("format", ParamType::String)
                        .with_default(json!("%Y-%m-%d %H:%M:%S UTC"))
                        .with_description("strftime-style format"),
                ),
        }
    }
}

#[async_trait]
impl Skill for CurrentTime {
    fn descriptor(&self) -> &SkillDescriptor {
        &self.descriptor
    }

    async fn execute(&self, ctx: &SkillContext, params: Params) -> Result<SkillOutput> {
        let format = str_param(&params, "format").unwrap_or("%Y-%m-%d %H:%M:%S UTC");
        let items: Vec<_> = chrono::format::StrftimeItems::new(format).collect();
        if items.iter().any(|i| matches!(i, chrono::format::Item::Error)) {
            return Err(Error::skill_execution(
                "current_time",
                format!("invalid format '{}'", format),
            ));
        }
        let formatted = ctx.now.format_with_items(items.into_iter()).to_string();

        Ok(SkillOutput::new(json!({
            "iso": ctx.now.to_rfc3339(),
            "timestamp": ctx.now.timestamp(),
            "formatted": formatted,
        }))
        .with_message(formatted))
    }
}

/// Register every built-in skill.
pub fn register_builtins(registry: &SkillRegistry) -> Result<()> {
    registry.register(Arc::new(CreateTask::new()))?;
    registry.register(Arc::new(Remember::new()))?;
    registry.register(Arc::new(CurrentTime::new()))?;
    Ok(())
}
