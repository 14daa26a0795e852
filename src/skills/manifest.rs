//! Skill discovery from `skill.json` manifests.
//!
//! A manifest carries a skill descriptor plus exactly one of:
//!
//! - `factory`: the name of a factory registered in-process with
//!   [`SkillRegistry::register_factory`]
//! - `command`: an external executable that receives a JSON request on stdin
//!   and answers with JSON on stdout (see [`CommandSkill`])
//!
//! ```json
//! {
//!   "name": "weather",
//!   "description": "Look up the forecast",
//!   "version": "1.0.0",
//!   "parameters": [{"name": "city", "type": "string"}],
//!   "command": "./weather.sh"
//! }
//! ```

use super::command::CommandSkill;
use super::registry::{panic_message, SkillRegistry};
use super::{Skill, SkillDescriptor};
use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// File name looked for in skill directories.
pub const MANIFEST_FILE: &str = "skill.json";

/// Parsed `skill.json`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SkillManifest {
    #[serde(flatten)]
    pub descriptor: SkillDescriptor,
    /// In-process factory name
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub factory: Option<String>,
    /// External executable (relative paths resolve against the manifest directory)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub command: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub args: Vec<String>,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    /// Free-form settings passed through to factories
    #[serde(default, skip_serializing_if = "serde_json::Value::is_null")]
    pub config: serde_json::Value,
    /// Directory containing the manifest
    #[serde(skip)]
    pub base_dir: PathBuf,
}

fn default_enabled() -> bool {
    true
}

impl SkillManifest {
    /// Read and parse a manifest file.
    pub fn from_file(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .map_err(|e| Error::Config(format!("Failed to read {}: {}", path.display(), e)))?;
        let mut manifest: SkillManifest = serde_json::from_str(&text).map_err(|e| {
            Error::invalid_schema(path.display().to_string(), format!("malformed manifest: {}", e))
        })?;
        manifest.base_dir = path
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from("."));
        Ok(manifest)
    }
}

/// A manifest that could not be turned into a registered skill.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DiscoveryFailure {
    pub path: PathBuf,
    pub error: String,
}

/// Outcome of a discovery scan. One bad manifest never stops the others.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DiscoveryReport {
    /// Names of skills registered by this scan
    pub registered: Vec<String>,
    pub failed: Vec<DiscoveryFailure>,
}

impl DiscoveryReport {
    pub fn is_clean(&self) -> bool {
        self.failed.is_empty()
    }

    fn fail(&mut self, path: PathBuf, error: impl ToString) {
        let error = error.to_string();
        warn!(path = %path.display(), error = %error, "Skill discovery failed");
        self.failed.push(DiscoveryFailure { path, error });
    }
}

fn is_glob(location: &str) -> bool {
    location.contains(|c: char| matches!(c, '*' | '?' | '['))
}

/// Manifest paths reachable from `path`: the file itself, `dir/skill.json`,
/// or `dir/*/skill.json`.
fn manifests_at(path: &Path) -> std::io::Result<Vec<PathBuf>> {
    if path.is_file() {
        return Ok(vec![path.to_path_buf()]);
    }
    let direct = path.join(MANIFEST_FILE);
    if direct.is_file() {
        return Ok(vec![direct]);
    }
    let mut found = Vec::new();
    for entry in std::fs::read_dir(path)? {
        let child = entry?.path();
        let manifest = child.join(MANIFEST_FILE);
        if child.is_dir() && manifest.is_file() {
            found.push(manifest);
        }
    }
    found.sort();
    Ok(found)
}

impl SkillRegistry {
    /// Scan locations for manifests and register what they describe.
    ///
    /// A location may be a directory holding `skill.json`, a directory of
    /// skill directories, a manifest file, or a glob pattern. `~` and
    /// environment variables are expanded.
    pub fn discover<S: AsRef<str>>(&self, locations: &[S]) -> DiscoveryReport {
        let mut report = DiscoveryReport::default();
        let mut candidates: BTreeSet<PathBuf> = BTreeSet::new();

        for location in locations {
            let raw = location.as_ref();
            let expanded = match shellexpand::full(raw) {
                Ok(s) => s.into_owned(),
                Err(e) => {
                    report.fail(PathBuf::from(raw), e);
                    continue;
                }
            };

            let roots: Vec<PathBuf> = if is_glob(&expanded) {
                match glob::glob(&expanded) {
                    Ok(paths) => paths.filter_map(|p| p.ok()).collect(),
                    Err(e) => {
                        report.fail(PathBuf::from(&expanded), e);
                        continue;
                    }
                }
            } else {
                let path = PathBuf::from(&expanded);
                if !path.exists() {
                    report.fail(path, "location does not exist");
                    continue;
                }
                vec![path]
            };

            for root in roots {
                match manifests_at(&root) {
                    Ok(paths) => candidates.extend(paths),
                    Err(e) => report.fail(root, e),
                }
            }
        }

        for path in candidates {
            match self.load_manifest(&path) {
                Ok(name) => report.registered.push(name),
                Err(e) => report.fail(path, e),
            }
        }

        info!(
            registered = report.registered.len(),
            failed = report.failed.len(),
            "Skill discovery finished"
        );
        report
    }

    /// Build and register the skill described by one manifest file.
    pub fn load_manifest(&self, path: &Path) -> Result<String> {
        let manifest = SkillManifest::from_file(path)?;
        let name = manifest.descriptor.name.clone();
        let skill: Arc<dyn Skill> = match (&manifest.factory, &manifest.command) {
            (Some(_), Some(_)) => {
                return Err(Error::invalid_schema(
                    &name,
                    "manifest declares both factory and command",
                ))
            }
            (None, None) => {
                return Err(Error::invalid_schema(
                    &name,
                    "manifest declares neither factory nor command",
                ))
            }
            (Some(factory), None) => {
                let build = self.factory(factory)?.ok_or_else(|| {
                    Error::invalid_schema(&name, format!("unknown factory '{}'", factory))
                })?;
                // A panicking factory fails this manifest, not the whole scan
                catch_unwind(AssertUnwindSafe(|| build(&manifest))).map_err(|panic| {
                    Error::invalid_schema(
                        &name,
                        format!("factory '{}' panicked: {}", factory, panic_message(&panic)),
                    )
                })??
            }
            (None, Some(_)) => Arc::new(CommandSkill::from_manifest(&manifest)?),
        };

        if skill.descriptor().name != name {
            return Err(Error::invalid_schema(
                &name,
                format!(
                    "factory produced skill named '{}'",
                    skill.descriptor().name
                ),
            ));
        }

        debug!(skill = %name, path = %path.display(), "Loaded skill manifest");
        self.register_with_state(skill, manifest.enabled)?;
        Ok(name)
    }
}
