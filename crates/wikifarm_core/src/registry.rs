use std::collections::BTreeMap;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::error::FarmError;

pub const REGISTRY_FILENAME: &str = "conf.json";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OrchestratorKind {
    Compose,
    Kubernetes,
}

impl OrchestratorKind {
    pub fn parse(value: &str) -> Result<Self> {
        let value = value.trim();
        if value.eq_ignore_ascii_case("compose") || value.eq_ignore_ascii_case("docker-compose") {
            return Ok(Self::Compose);
        }
        if value.eq_ignore_ascii_case("kubernetes") || value.eq_ignore_ascii_case("k8s") {
            return Ok(Self::Kubernetes);
        }
        Err(FarmError::ValidationFailed(format!(
            "unsupported orchestrator: {value} (expected compose|kubernetes)"
        ))
        .into())
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Compose => "compose",
            Self::Kubernetes => "kubernetes",
        }
    }
}

impl fmt::Display for OrchestratorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One registered farm. The orchestrator kind is chosen at creation and cached
/// here so every later command drives the same backend.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Installation {
    pub id: String,
    pub path: PathBuf,
    pub orchestrator: OrchestratorKind,
    #[serde(default)]
    pub dev_mode: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub managed_cluster: Option<String>,
}

impl Installation {
    pub fn config_dir(&self) -> PathBuf {
        self.path.join("config")
    }

    pub fn env_path(&self) -> PathBuf {
        self.path.join(".env")
    }

    pub fn wikis_path(&self) -> PathBuf {
        self.config_dir().join("wikis.yaml")
    }

    pub fn wiki_settings_dir(&self, wiki_id: &str) -> PathBuf {
        self.config_dir().join("settings").join("wikis").join(wiki_id)
    }

    pub fn wiki_images_dir(&self, wiki_id: &str) -> PathBuf {
        self.path.join("images").join(wiki_id)
    }

    pub fn staging_dir(&self) -> PathBuf {
        self.path.join(".backup").join("currentsnapshot")
    }
}

/// The installations document: read wholesale, mutated in memory, written
/// wholesale. Concurrent invocations against the same document are not guarded.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Registry {
    #[serde(default)]
    pub installations: BTreeMap<String, Installation>,
}

impl Registry {
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let content =
            fs::read_to_string(path).with_context(|| format!("failed to read {}", path.display()))?;
        if content.trim().is_empty() {
            return Ok(Self::default());
        }
        serde_json::from_str(&content).with_context(|| format!("failed to parse {}", path.display()))
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        let parent = path
            .parent()
            .ok_or_else(|| anyhow::anyhow!("registry path has no parent: {}", path.display()))?;
        fs::create_dir_all(parent)
            .with_context(|| format!("failed to create {}", parent.display()))?;
        let mut rendered =
            serde_json::to_string_pretty(self).context("failed to serialize registry")?;
        rendered.push('\n');

        let temp_path = path.with_extension("json.tmp");
        fs::write(&temp_path, rendered)
            .with_context(|| format!("failed to write {}", temp_path.display()))?;
        fs::rename(&temp_path, path)
            .with_context(|| format!("failed to replace {}", path.display()))
    }

    pub fn get(&self, id: &str) -> Result<&Installation> {
        self.installations
            .get(id)
            .ok_or_else(|| FarmError::NotFound(format!("installation '{id}' is not registered")).into())
    }

    /// Finds the installation whose root contains `dir`.
    pub fn find_by_path(&self, dir: &Path) -> Option<&Installation> {
        self.installations
            .values()
            .filter(|installation| dir.starts_with(&installation.path))
            .max_by_key(|installation| installation.path.components().count())
    }

    pub fn insert(&mut self, installation: Installation) -> Result<()> {
        if self.installations.contains_key(&installation.id) {
            return Err(FarmError::Conflict(format!(
                "installation '{}' is already registered",
                installation.id
            ))
            .into());
        }
        if let Some(existing) = self
            .installations
            .values()
            .find(|existing| existing.path == installation.path)
        {
            return Err(FarmError::Conflict(format!(
                "{} is already registered as installation '{}'",
                installation.path.display(),
                existing.id
            ))
            .into());
        }
        self.installations
            .insert(installation.id.clone(), installation);
        Ok(())
    }

    pub fn update(&mut self, installation: Installation) -> Result<()> {
        let slot = self.installations.get_mut(&installation.id).ok_or_else(|| {
            FarmError::NotFound(format!("installation '{}' is not registered", installation.id))
        })?;
        *slot = installation;
        Ok(())
    }

    pub fn remove(&mut self, id: &str) -> Result<Installation> {
        self.installations
            .remove(id)
            .ok_or_else(|| FarmError::NotFound(format!("installation '{id}' is not registered")).into())
    }
}
