//! Batch mutation of an installation's `.env` settings store.
//!
//! Every change runs resolve, validate, persist, apply and restart in that
//! order for the whole batch, so a multi-key change restarts once.

use anyhow::Result;
use serde::Serialize;
use tracing::info;

use crate::context::FarmContext;
use crate::credentials::{DEFAULT_PASSWORD_LENGTH, generate_password};
use crate::env_store::EnvStore;
use crate::error::{FarmError, StepTracker};
use crate::lifecycle::{RestartReport, restart_installation};
use crate::wikis::{STANDARD_HTTPS_PORT, WikiList};

pub const OBSERVABILITY_USER_KEY: &str = "OS_USER";
pub const OBSERVABILITY_PASSWORD_KEY: &str = "OS_PASSWORD";
pub const DEFAULT_OBSERVABILITY_USER: &str = "admin";

/// Settings whose change has consequences beyond the stored value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SideEffect {
    /// Reachable HTTPS port; every wiki URL carries it unless it is 443.
    HttpsPort,
    HttpPort,
    /// `CADDY_AUTO_HTTPS` on/off; routing is regenerated.
    AutoHttps,
    /// Observability stack toggle; needs generated credentials.
    Observability,
}

impl SideEffect {
    /// Changing a port-class key changes host port mappings, which a managed
    /// cluster only picks up when recreated.
    pub fn is_port_class(self) -> bool {
        match self {
            Self::HttpsPort | Self::HttpPort => true,
            Self::AutoHttps | Self::Observability => false,
        }
    }

    pub fn validate(self, key: &str, value: &str) -> Result<()> {
        match self {
            Self::HttpsPort | Self::HttpPort => parse_port(key, value).map(|_| ()),
            Self::AutoHttps => {
                if ["on", "off"].iter().any(|allowed| allowed.eq_ignore_ascii_case(value)) {
                    Ok(())
                } else {
                    Err(invalid(key, value, "expected 'on' or 'off'"))
                }
            }
            Self::Observability => parse_flag(key, value).map(|_| ()),
        }
    }

    pub fn apply(self, context: &FarmContext, store: &mut EnvStore, key: &str, value: &str) -> Result<()> {
        match self {
            Self::HttpsPort => rewrite_wiki_urls(context, parse_port(key, value)?),
            // The new mapping lands through the restart sequence.
            Self::HttpPort => Ok(()),
            Self::AutoHttps => {
                context.orchestrator().update_config(&context.installation)?;
                Ok(())
            }
            Self::Observability => {
                if parse_flag(key, value)? {
                    ensure_observability_credentials(store)?;
                }
                Ok(())
            }
        }
    }

    pub fn unapply(self, context: &FarmContext, store: &mut EnvStore) -> Result<()> {
        match self {
            Self::HttpsPort => rewrite_wiki_urls(context, STANDARD_HTTPS_PORT),
            Self::HttpPort | Self::AutoHttps => Ok(()),
            Self::Observability => {
                store.remove(OBSERVABILITY_USER_KEY);
                store.remove(OBSERVABILITY_PASSWORD_KEY);
                store.save()
            }
        }
    }
}

fn invalid(key: &str, value: &str, reason: &str) -> anyhow::Error {
    FarmError::ValidationFailed(format!("{key}={value}: {reason}")).into()
}

fn parse_port(key: &str, value: &str) -> Result<u16> {
    value
        .trim()
        .parse::<u16>()
        .ok()
        .filter(|port| *port > 0)
        .ok_or_else(|| invalid(key, value, "expected a port between 1 and 65535"))
}

fn parse_flag(key: &str, value: &str) -> Result<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "true" | "1" | "yes" | "on" => Ok(true),
        "false" | "0" | "no" | "off" | "" => Ok(false),
        _ => Err(invalid(key, value, "expected true or false")),
    }
}

fn rewrite_wiki_urls(context: &FarmContext, https_port: u16) -> Result<()> {
    let path = context.installation.wikis_path();
    let mut wikis = WikiList::load(&path)?;
    if wikis.apply_https_port(https_port)? {
        wikis.save(&path)?;
        info!(installation = %context.installation.id, https_port, "rewrote wiki URLs");
    }
    Ok(())
}

fn ensure_observability_credentials(store: &mut EnvStore) -> Result<()> {
    let mut changed = false;
    if store.get_non_empty(OBSERVABILITY_USER_KEY).is_none() {
        store.set(OBSERVABILITY_USER_KEY, DEFAULT_OBSERVABILITY_USER);
        changed = true;
    }
    if store.get_non_empty(OBSERVABILITY_PASSWORD_KEY).is_none() {
        store.set(
            OBSERVABILITY_PASSWORD_KEY,
            &generate_password(DEFAULT_PASSWORD_LENGTH),
        );
        changed = true;
    }
    if changed {
        store.save()?;
    }
    Ok(())
}

#[derive(Debug, Clone, Copy)]
pub struct KnownSetting {
    pub key: &'static str,
    pub side_effect: Option<SideEffect>,
    pub description: &'static str,
}

const fn known(key: &'static str, side_effect: Option<SideEffect>, description: &'static str) -> KnownSetting {
    KnownSetting {
        key,
        side_effect,
        description,
    }
}

pub const KNOWN_SETTINGS: &[KnownSetting] = &[
    known("HTTP_PORT", Some(SideEffect::HttpPort), "host port for plain HTTP"),
    known("HTTPS_PORT", Some(SideEffect::HttpsPort), "reachable host port for HTTPS"),
    known("CADDY_AUTO_HTTPS", Some(SideEffect::AutoHttps), "automatic certificates (on/off)"),
    known("ENABLE_OBSERVABILITY", Some(SideEffect::Observability), "run the observability stack"),
    known(OBSERVABILITY_USER_KEY, None, "observability dashboard user"),
    known(OBSERVABILITY_PASSWORD_KEY, None, "observability dashboard password"),
    known("MW_SITE_SERVER", None, "default $wgServer"),
    known("MW_SITE_FQDN", None, "default site host name"),
    known("MW_SECRET_KEY", None, "MediaWiki $wgSecretKey"),
    known("MYSQL_PASSWORD", None, "database root password"),
    known("WIKI_DB_PASSWORD", None, "database password used by the wikis"),
    known("PHP_UPLOAD_MAX_FILESIZE", None, "PHP upload_max_filesize"),
    known("PHP_POST_MAX_SIZE", None, "PHP post_max_size"),
    known("RESTIC_REPOSITORY", None, "backup repository URL"),
    known("BACKUP_REPOSITORY", None, "alternate backup repository URL"),
    known("RESTIC_PASSWORD", None, "backup repository password"),
    known("AWS_S3_ENDPOINT", None, "object storage endpoint for backups"),
    known("AWS_S3_BUCKET", None, "object storage bucket for backups"),
    known("AWS_ACCESS_KEY_ID", None, "object storage access key"),
    known("AWS_SECRET_ACCESS_KEY", None, "object storage secret key"),
];

pub fn known_setting(key: &str) -> Option<&'static KnownSetting> {
    KNOWN_SETTINGS
        .iter()
        .find(|setting| setting.key.eq_ignore_ascii_case(key))
}

fn side_effect_for(key: &str) -> Option<SideEffect> {
    known_setting(key).and_then(|setting| setting.side_effect)
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SetOptions {
    /// Accept keys that are neither in the store nor in [`KNOWN_SETTINGS`].
    pub force: bool,
    pub skip_restart: bool,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct SettingsChangeReport {
    /// Keys as written to the store.
    pub keys: Vec<String>,
    pub restart: Option<RestartReport>,
}

/// Spelling the key is written with: the store's, else the known table's,
/// else (forced) the caller's.
fn resolve_key(store: &EnvStore, key: &str, force: bool) -> Result<String> {
    if key.is_empty() || key.contains(['=', ' ', '\n', '#']) {
        return Err(FarmError::ValidationFailed(format!("'{key}' is not a valid setting name")).into());
    }
    if let Some(existing) = store.resolve_key(key) {
        return Ok(existing.to_string());
    }
    if let Some(setting) = known_setting(key) {
        return Ok(setting.key.to_string());
    }
    if force {
        return Ok(key.to_string());
    }
    Err(FarmError::ValidationFailed(format!(
        "unknown setting '{key}' (pass --force to set it anyway)"
    ))
    .into())
}

pub fn set_settings(
    context: &FarmContext,
    batch: &[(String, String)],
    options: SetOptions,
) -> Result<SettingsChangeReport> {
    let mut store = EnvStore::load(&context.installation.env_path())?;

    let mut resolved = Vec::with_capacity(batch.len());
    for (key, value) in batch {
        resolved.push((resolve_key(&store, key, options.force)?, value.clone()));
    }
    for (key, value) in &resolved {
        if let Some(effect) = side_effect_for(key) {
            effect.validate(key, value)?;
        }
    }

    let guidance = "Values already written stay in .env; re-run `wikifarm config set` with the same batch to finish.";
    let mut steps = StepTracker::new();
    steps.run("persist settings", guidance, || {
        for (key, value) in &resolved {
            store.set(key, value);
        }
        store.save()
    })?;
    for (key, value) in &resolved {
        if let Some(effect) = side_effect_for(key) {
            steps.run(&format!("apply {key}"), guidance, || {
                effect.apply(context, &mut store, key, value)
            })?;
        }
    }
    info!(installation = %context.installation.id, keys = ?resolved.iter().map(|(key, _)| key).collect::<Vec<_>>(), "settings updated");

    let port_changed = resolved
        .iter()
        .any(|(key, _)| side_effect_for(key).is_some_and(SideEffect::is_port_class));
    let restart = restart_unless_skipped(context, options, port_changed, &mut steps)?;
    Ok(SettingsChangeReport {
        keys: resolved.into_iter().map(|(key, _)| key).collect(),
        restart,
    })
}

pub fn unset_settings(
    context: &FarmContext,
    keys: &[String],
    options: SetOptions,
) -> Result<SettingsChangeReport> {
    let mut store = EnvStore::load(&context.installation.env_path())?;
    let mut resolved = Vec::with_capacity(keys.len());
    for key in keys {
        let existing = store
            .resolve_key(key)
            .ok_or_else(|| FarmError::NotFound(format!("setting '{key}' is not set")))?;
        resolved.push(existing.to_string());
    }

    let guidance = "Re-run `wikifarm config unset` with the same keys to finish.";
    let mut steps = StepTracker::new();
    for key in &resolved {
        if let Some(effect) = side_effect_for(key) {
            steps.run(&format!("unapply {key}"), guidance, || {
                effect.unapply(context, &mut store)
            })?;
        }
    }
    steps.run("remove settings", guidance, || {
        for key in &resolved {
            store.remove(key);
        }
        store.save()
    })?;

    let port_changed = resolved
        .iter()
        .any(|key| side_effect_for(key).is_some_and(SideEffect::is_port_class));
    let restart = restart_unless_skipped(context, options, port_changed, &mut steps)?;
    Ok(SettingsChangeReport {
        keys: resolved,
        restart,
    })
}

fn restart_unless_skipped(
    context: &FarmContext,
    options: SetOptions,
    port_changed: bool,
    steps: &mut StepTracker,
) -> Result<Option<RestartReport>> {
    if options.skip_restart {
        info!("restart skipped; run `wikifarm restart` to pick up the change");
        return Ok(None);
    }
    let report = steps.run(
        "restart",
        "The settings are stored; run `wikifarm restart` once the backend is healthy.",
        || restart_installation(context, port_changed),
    )?;
    Ok(Some(report))
}

pub fn get_setting(context: &FarmContext, key: &str) -> Result<String> {
    let store = EnvStore::load(&context.installation.env_path())?;
    store
        .get(key)
        .map(str::to_string)
        .ok_or_else(|| FarmError::NotFound(format!("setting '{key}' is not set")).into())
}

pub fn get_settings(context: &FarmContext) -> Result<Vec<(String, String)>> {
    Ok(EnvStore::load(&context.installation.env_path())?
        .entries())
}
