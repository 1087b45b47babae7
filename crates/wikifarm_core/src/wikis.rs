use std::collections::HashSet;
use std::fmt;
use std::fs;
use std::path::Path;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::error::FarmError;

pub const MAX_WIKI_ID_LEN: usize = 64;
pub const STANDARD_HTTPS_PORT: u16 = 443;

/// Tenant ids that would shadow farm-level directories or routes.
pub const RESERVED_WIKI_IDS: &[&str] = &[
    "settings",
    "images",
    "w",
    "wiki",
    "api",
    "rest.php",
    "load.php",
    "extensions",
    "skins",
    "cache",
];

/// First path segments already claimed by MediaWiki's own routes.
pub const RESERVED_PATH_SEGMENTS: &[&str] = &[
    "w",
    "wiki",
    "api.php",
    "rest.php",
    "load.php",
    "images",
    "extensions",
    "skins",
    "resources",
];

pub fn validate_wiki_id(id: &str) -> Result<()> {
    if id.is_empty() {
        return Err(FarmError::ValidationFailed("wiki id must not be empty".to_string()).into());
    }
    if id.len() > MAX_WIKI_ID_LEN {
        return Err(FarmError::ValidationFailed(format!(
            "wiki id '{id}' is longer than {MAX_WIKI_ID_LEN} characters"
        ))
        .into());
    }
    if let Some(bad) = id
        .chars()
        .find(|ch| !(ch.is_ascii_alphanumeric() || *ch == '_'))
    {
        return Err(FarmError::ValidationFailed(format!(
            "wiki id '{id}' contains disallowed character {bad:?} (letters, digits and '_' only)"
        ))
        .into());
    }
    if RESERVED_WIKI_IDS
        .iter()
        .any(|reserved| reserved.eq_ignore_ascii_case(id))
    {
        return Err(
            FarmError::ValidationFailed(format!("wiki id '{id}' is a reserved name")).into(),
        );
    }
    Ok(())
}

/// `domain[:port][/path]` as stored in the tenant registry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WikiUrl {
    pub domain: String,
    pub port: Option<u16>,
    pub path: Option<String>,
}

impl WikiUrl {
    pub fn parse(raw: &str) -> Result<Self> {
        let trimmed = raw.trim();
        let without_scheme = trimmed
            .strip_prefix("https://")
            .or_else(|| trimmed.strip_prefix("http://"))
            .unwrap_or(trimmed);
        let (authority, path) = match without_scheme.split_once('/') {
            Some((authority, path)) => (authority, path.trim_matches('/')),
            None => (without_scheme, ""),
        };

        let (domain, port) = match authority.rsplit_once(':') {
            Some((domain, port)) => {
                let port = port.parse::<u16>().ok().filter(|port| *port > 0).ok_or_else(|| {
                    FarmError::ValidationFailed(format!("invalid port in wiki URL '{raw}'"))
                })?;
                (domain, Some(port))
            }
            None => (authority, None),
        };

        if domain.is_empty() {
            return Err(
                FarmError::ValidationFailed(format!("wiki URL '{raw}' has no domain")).into(),
            );
        }
        if !domain
            .chars()
            .all(|ch| ch.is_ascii_alphanumeric() || ch == '-' || ch == '.')
        {
            return Err(FarmError::ValidationFailed(format!(
                "wiki URL '{raw}' has an invalid domain '{domain}'"
            ))
            .into());
        }

        let path = if path.is_empty() {
            None
        } else {
            validate_url_path(path)?;
            Some(path.to_string())
        };

        Ok(Self {
            domain: domain.to_ascii_lowercase(),
            port,
            path,
        })
    }

    pub fn with_port(&self, https_port: u16) -> Self {
        Self {
            port: (https_port != STANDARD_HTTPS_PORT).then_some(https_port),
            ..self.clone()
        }
    }

    /// Origin MediaWiki is told it is served from.
    pub fn server(&self) -> String {
        match self.port {
            Some(port) => format!("https://{}:{port}", self.domain),
            None => format!("https://{}", self.domain),
        }
    }

    fn route_key(&self) -> (String, String) {
        (
            self.domain.clone(),
            self.path.clone().unwrap_or_default().to_ascii_lowercase(),
        )
    }
}

impl fmt::Display for WikiUrl {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.domain)?;
        if let Some(port) = self.port {
            write!(f, ":{port}")?;
        }
        if let Some(path) = &self.path {
            write!(f, "/{path}")?;
        }
        Ok(())
    }
}

fn validate_url_path(path: &str) -> Result<()> {
    let first = path.split('/').next().unwrap_or_default();
    if RESERVED_PATH_SEGMENTS
        .iter()
        .any(|reserved| reserved.eq_ignore_ascii_case(first))
    {
        return Err(FarmError::ValidationFailed(format!(
            "wiki path '/{path}' collides with the reserved route '/{first}'"
        ))
        .into());
    }
    if path
        .chars()
        .any(|ch| ch.is_whitespace() || matches!(ch, '?' | '#' | '%' | '\\'))
    {
        return Err(FarmError::ValidationFailed(format!(
            "wiki path '/{path}' contains disallowed characters"
        ))
        .into());
    }
    Ok(())
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Wiki {
    pub id: String,
    pub url: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
}

impl Wiki {
    pub fn display_name(&self) -> &str {
        self.name.as_deref().unwrap_or(&self.id)
    }

    pub fn parsed_url(&self) -> Result<WikiUrl> {
        WikiUrl::parse(&self.url).with_context(|| format!("wiki '{}' has an invalid URL", self.id))
    }
}

/// The per-installation tenant list (`config/wikis.yaml`). Order is
/// significant: the first entry is the farm's default wiki.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct WikiList {
    #[serde(default)]
    pub wikis: Vec<Wiki>,
}

impl WikiList {
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Err(FarmError::NotFound(format!(
                "tenant registry {} does not exist",
                path.display()
            ))
            .into());
        }
        let content =
            fs::read_to_string(path).with_context(|| format!("failed to read {}", path.display()))?;
        if content.trim().is_empty() {
            return Ok(Self::default());
        }
        serde_yaml::from_str(&content).with_context(|| format!("failed to parse {}", path.display()))
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("failed to create {}", parent.display()))?;
        }
        let rendered = serde_yaml::to_string(self).context("failed to serialize wiki list")?;
        fs::write(path, rendered).with_context(|| format!("failed to write {}", path.display()))
    }

    pub fn get(&self, id: &str) -> Option<&Wiki> {
        self.wikis.iter().find(|wiki| wiki.id == id)
    }

    /// Checks that `id` is free and `url` is not claimed by another tenant.
    pub fn ensure_available(&self, id: &str, url: &WikiUrl) -> Result<()> {
        if self.get(id).is_some() {
            return Err(FarmError::Conflict(format!("wiki '{id}' already exists")).into());
        }
        let key = url.route_key();
        for existing in &self.wikis {
            if existing.parsed_url()?.route_key() == key {
                return Err(FarmError::Conflict(format!(
                    "URL '{url}' is already served by wiki '{}'",
                    existing.id
                ))
                .into());
            }
        }
        Ok(())
    }

    pub fn add(&mut self, wiki: Wiki) -> Result<()> {
        validate_wiki_id(&wiki.id)?;
        let url = wiki.parsed_url()?;
        self.ensure_available(&wiki.id, &url)?;
        self.wikis.push(wiki);
        Ok(())
    }

    pub fn ensure_removable(&self, id: &str) -> Result<()> {
        if self.get(id).is_none() {
            return Err(FarmError::NotFound(format!("wiki '{id}' does not exist")).into());
        }
        if self.wikis.len() <= 1 {
            return Err(FarmError::RemoveLast(id.to_string()).into());
        }
        Ok(())
    }

    pub fn remove(&mut self, id: &str) -> Result<Wiki> {
        self.ensure_removable(id)?;
        let index = self
            .wikis
            .iter()
            .position(|wiki| wiki.id == id)
            .ok_or_else(|| FarmError::NotFound(format!("wiki '{id}' does not exist")))?;
        Ok(self.wikis.remove(index))
    }

    /// Distinct domains in first-seen order. Paths are routed inside the
    /// installation, so they never add edge routing entries.
    pub fn unique_domains(&self) -> Result<Vec<String>> {
        let mut seen = HashSet::new();
        let mut domains = Vec::new();
        for wiki in &self.wikis {
            let url = wiki.parsed_url()?;
            if seen.insert(url.domain.clone()) {
                domains.push(url.domain);
            }
        }
        Ok(domains)
    }

    /// Rewrites every URL for a new reachable HTTPS port.
    pub fn apply_https_port(&mut self, https_port: u16) -> Result<bool> {
        let mut changed = false;
        for wiki in &mut self.wikis {
            let rewritten = wiki.parsed_url()?.with_port(https_port).to_string();
            if rewritten != wiki.url {
                wiki.url = rewritten;
                changed = true;
            }
        }
        Ok(changed)
    }
}
