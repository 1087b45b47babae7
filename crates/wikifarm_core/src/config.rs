use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

pub const CONFIG_FILENAME: &str = "config.toml";
pub const DEFAULT_COMPOSE_BINARY: &str = "docker";
pub const DEFAULT_KUBECTL_BINARY: &str = "kubectl";
pub const DEFAULT_KIND_BINARY: &str = "kind";
pub const DEFAULT_RESTIC_IMAGE: &str = "restic/restic:0.17.3";
pub const DEFAULT_CRONTAB_BINARY: &str = "crontab";

/// Tool-level settings shared by every installation (`config.toml` in the
/// configuration directory). Installation-level settings live in each farm's
/// `.env`, see [`crate::env_store`].
#[derive(Debug, Clone, Deserialize, Serialize, Default, PartialEq, Eq)]
pub struct ToolConfig {
    #[serde(default)]
    pub compose: ComposeSection,
    #[serde(default)]
    pub kubernetes: KubernetesSection,
    #[serde(default)]
    pub backup: BackupSection,
    #[serde(default)]
    pub stack: StackSection,
}

#[derive(Debug, Clone, Deserialize, Serialize, Default, PartialEq, Eq)]
pub struct ComposeSection {
    pub binary: Option<String>,
}

#[derive(Debug, Clone, Deserialize, Serialize, Default, PartialEq, Eq)]
pub struct KubernetesSection {
    pub kubectl_binary: Option<String>,
    pub kind_binary: Option<String>,
}

#[derive(Debug, Clone, Deserialize, Serialize, Default, PartialEq, Eq)]
pub struct BackupSection {
    pub restic_image: Option<String>,
    /// Host qualifier used in snapshot tags; defaults to the machine hostname.
    pub host: Option<String>,
    pub crontab_binary: Option<String>,
}

#[derive(Debug, Clone, Deserialize, Serialize, Default, PartialEq, Eq)]
pub struct StackSection {
    /// Directory copied into a new installation before first start.
    pub template_dir: Option<PathBuf>,
}

impl ToolConfig {
    pub fn compose_binary(&self) -> &str {
        self.compose
            .binary
            .as_deref()
            .unwrap_or(DEFAULT_COMPOSE_BINARY)
    }

    pub fn kubectl_binary(&self) -> &str {
        self.kubernetes
            .kubectl_binary
            .as_deref()
            .unwrap_or(DEFAULT_KUBECTL_BINARY)
    }

    pub fn kind_binary(&self) -> &str {
        self.kubernetes
            .kind_binary
            .as_deref()
            .unwrap_or(DEFAULT_KIND_BINARY)
    }

    pub fn restic_image(&self) -> &str {
        self.backup
            .restic_image
            .as_deref()
            .unwrap_or(DEFAULT_RESTIC_IMAGE)
    }

    pub fn crontab_binary(&self) -> &str {
        self.backup
            .crontab_binary
            .as_deref()
            .unwrap_or(DEFAULT_CRONTAB_BINARY)
    }

    /// Resolve the backup host qualifier: config > env HOSTNAME > /etc/hostname > "localhost".
    pub fn backup_host(&self) -> String {
        if let Some(host) = self.backup.host.as_deref().map(str::trim)
            && !host.is_empty()
        {
            return host.to_string();
        }
        if let Ok(value) = std::env::var("HOSTNAME") {
            let trimmed = value.trim();
            if !trimmed.is_empty() {
                return trimmed.to_string();
            }
        }
        fs::read_to_string("/etc/hostname")
            .ok()
            .map(|value| value.trim().to_string())
            .filter(|value| !value.is_empty())
            .unwrap_or_else(|| "localhost".to_string())
    }
}

/// Load and parse the tool config. Returns default if the file doesn't exist.
pub fn load_config(config_path: &Path) -> Result<ToolConfig> {
    if !config_path.exists() {
        return Ok(ToolConfig::default());
    }
    let content = fs::read_to_string(config_path)
        .with_context(|| format!("failed to read {}", config_path.display()))?;
    let parsed: ToolConfig = toml::from_str(&content)
        .with_context(|| format!("failed to parse {}", config_path.display()))?;
    Ok(parsed)
}
