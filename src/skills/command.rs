//! Skills backed by an external executable.
//!
//! Each invocation spawns the command, writes one JSON request to stdin and
//! reads one JSON document from stdout:
//!
//! ```json
//! {"skill": "weather", "params": {"city": "Oslo"}, "query": "...", "context": ["..."]}
//! ```
//!
//! The reply is either a [`SkillOutput`] (`payload`, `records`, `message`),
//! `{"error": "..."}`, or any other JSON value, which becomes the payload.
//! A non-zero exit status is a failure carrying stderr.

use super::manifest::SkillManifest;
use super::{Params, Skill, SkillContext, SkillDescriptor, SkillOutput};
use crate::error::{Error, Result};
use async_trait::async_trait;
use serde_json::{json, Value};
use std::path::{Path, PathBuf};
use std::process::Stdio;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::debug;

/// A skill that runs an external program per invocation.
#[derive(Debug, Clone)]
pub struct CommandSkill {
    descriptor: SkillDescriptor,
    command: String,
    args: Vec<String>,
    working_dir: PathBuf,
}

impl CommandSkill {
    pub fn new(descriptor: SkillDescriptor, command: impl Into<String>) -> Self {
        Self {
            descriptor,
            command: command.into(),
            args: Vec::new(),
            working_dir: PathBuf::from("."),
        }
    }

    pub fn with_args(mut self, args: Vec<String>) -> Self {
        self.args = args;
        self
    }

    pub fn with_working_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.working_dir = dir.into();
        self
    }

    pub fn from_manifest(manifest: &SkillManifest) -> Result<Self> {
        let command = manifest.command.clone().ok_or_else(|| {
            Error::invalid_schema(&manifest.descriptor.name, "manifest has no command")
        })?;
        Ok(Self::new(manifest.descriptor.clone(), command)
            .with_args(manifest.args.clone())
            .with_working_dir(manifest.base_dir.clone()))
    }

    /// Find the executable: paths resolve against the working directory,
    /// bare names against `PATH`.
    fn find_binary(&self) -> Result<PathBuf> {
        let expanded = shellexpand::tilde(&self.command).to_string();
        let path = Path::new(&expanded);
        if path.is_absolute() {
            return Ok(path.to_path_buf());
        }
        if path.components().count() > 1 {
            return Ok(self.working_dir.join(path));
        }
        if let Ok(found) = which::which(&expanded) {
            return Ok(found);
        }
        let local = self.working_dir.join(path);
        if local.is_file() {
            return Ok(local);
        }
        Err(Error::skill_execution(
            &self.descriptor.name,
            format!("command '{}' not found", self.command),
        ))
    }

    fn parse_reply(&self, stdout: &[u8]) -> Result<SkillOutput> {
        let reply: Value = serde_json::from_slice(stdout).map_err(|e| {
            Error::skill_execution(&self.descriptor.name, format!("invalid JSON reply: {}", e))
        })?;
        if let Some(message) = reply.get("error").and_then(Value::as_str) {
            return Err(Error::skill_execution(&self.descriptor.name, message));
        }
        let structured = reply.as_object().map_or(false, |obj| {
            ["payload", "records", "message"]
                .iter()
                .any(|k| obj.contains_key(*k))
        });
        if structured {
            serde_json::from_value(reply).map_err(|e| {
                Error::skill_execution(&self.descriptor.name, format!("invalid reply: {}", e))
            })
        } else {
            Ok(SkillOutput::new(reply))
        }
    }
}

#[async_trait]
impl Skill for CommandSkill {
    fn descriptor(&self) -> &SkillDescriptor {
        &self.descriptor
    }

    async fn execute(&self, ctx: &SkillContext, params: Params) -> Result<SkillOutput> {
        let binary = self.find_binary()?;
        let name = &self.descriptor.name;
        debug!(skill = %name, binary = %binary.display(), "Spawning skill command");

        let mut child = Command::new(&binary)
            .args(&self.args)
            .current_dir(&self.working_dir)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| Error::skill_execution(name, format!("failed to start: {}", e)))?;

        let request = json!({
            "skill": name,
            "params": params,
            "query": ctx.query,
            "context": ctx.context.iter().map(|n| n.content.as_str()).collect::<Vec<_>>(),
            "cycle_id": ctx.cycle_id,
        });
        let mut stdin = child
            .stdin
            .take()
            .ok_or_else(|| Error::Internal("Failed to get stdin".to_string()))?;
        let mut bytes = serde_json::to_vec(&request)?;
        bytes.push(b'\n');
        // Commands may exit without reading their input.
        match stdin.write_all(&bytes).await {
            Err(e) if e.kind() != std::io::ErrorKind::BrokenPipe => {
                return Err(Error::skill_execution(name, format!("write error: {}", e)));
            }
            _ => {}
        }
        drop(stdin);

        let output = child
            .wait_with_output()
            .await
            .map_err(|e| Error::skill_execution(name, format!("wait error: {}", e)))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(Error::skill_execution(
                name,
                format!("exited with {}: {}", output.status, stderr.trim()),
            ));
        }
        self.parse_reply(&output.stdout)
    }
}
