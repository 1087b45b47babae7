use std::env;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail};

use crate::config::CONFIG_FILENAME;
use crate::registry::REGISTRY_FILENAME;

pub const SYSTEM_CONFIG_DIR: &str = "/etc/wikifarm";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValueSource {
    Flag,
    Env,
    Xdg,
    Home,
    System,
}

impl ValueSource {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Flag => "flag",
            Self::Env => "env",
            Self::Xdg => "xdg",
            Self::Home => "home",
            Self::System => "system",
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct PathOverrides {
    pub config_dir: Option<PathBuf>,
}

#[derive(Debug, Clone)]
pub struct ResolutionContext {
    pub cwd: PathBuf,
}

impl ResolutionContext {
    pub fn from_process() -> Result<Self> {
        let cwd = env::current_dir().context("failed to read current directory")?;
        Ok(Self { cwd })
    }
}

#[derive(Debug, Clone)]
pub struct RuntimePaths {
    pub cwd: PathBuf,
    pub config_dir: PathBuf,
    pub registry_path: PathBuf,
    pub tool_config_path: PathBuf,
    pub config_source: ValueSource,
}

impl RuntimePaths {
    pub fn diagnostics(&self) -> String {
        format!(
            "cwd={}\nconfig_dir={} ({})\nregistry_path={}\ntool_config_path={}",
            normalize_for_display(&self.cwd),
            normalize_for_display(&self.config_dir),
            self.config_source.as_str(),
            normalize_for_display(&self.registry_path),
            normalize_for_display(&self.tool_config_path),
        )
    }
}

pub fn resolve_paths(context: &ResolutionContext, overrides: &PathOverrides) -> Result<RuntimePaths> {
    resolve_paths_with_lookup(context, overrides, |key| env::var(key).ok())
}

pub(crate) fn resolve_paths_with_lookup<F>(
    context: &ResolutionContext,
    overrides: &PathOverrides,
    lookup_env: F,
) -> Result<RuntimePaths>
where
    F: Fn(&str) -> Option<String>,
{
    let (config_dir, config_source) = resolve_config_dir(context, overrides, &lookup_env)
        .context("failed to resolve configuration directory")?;
    Ok(RuntimePaths {
        cwd: context.cwd.clone(),
        registry_path: config_dir.join(REGISTRY_FILENAME),
        tool_config_path: config_dir.join(CONFIG_FILENAME),
        config_dir,
        config_source,
    })
}

fn resolve_config_dir<F>(
    context: &ResolutionContext,
    overrides: &PathOverrides,
    lookup_env: &F,
) -> Result<(PathBuf, ValueSource)>
where
    F: Fn(&str) -> Option<String>,
{
    if let Some(path) = overrides.config_dir.as_deref() {
        return Ok((absolutize(path, &context.cwd), ValueSource::Flag));
    }
    if let Some(value) = non_empty(lookup_env("WIKIFARM_CONFIG_DIR")) {
        return Ok((absolutize(Path::new(&value), &context.cwd), ValueSource::Env));
    }
    if non_empty(lookup_env("USER")).as_deref() == Some("root") {
        return Ok((PathBuf::from(SYSTEM_CONFIG_DIR), ValueSource::System));
    }
    if let Some(value) = non_empty(lookup_env("XDG_CONFIG_HOME")) {
        return Ok((PathBuf::from(value).join("wikifarm"), ValueSource::Xdg));
    }
    if let Some(value) = non_empty(lookup_env("HOME")) {
        return Ok((
            PathBuf::from(value).join(".config").join("wikifarm"),
            ValueSource::Home,
        ));
    }
    bail!(
        "cannot determine a configuration directory: pass --config-dir or set WIKIFARM_CONFIG_DIR"
    );
}

fn non_empty(value: Option<String>) -> Option<String> {
    value
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

pub(crate) fn absolutize(path: &Path, base: &Path) -> PathBuf {
    if path.is_absolute() {
        path.to_path_buf()
    } else {
        base.join(path)
    }
}

pub(crate) fn normalize_for_display(path: &Path) -> String {
    path.to_string_lossy().replace('\\', "/")
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;
    use std::path::PathBuf;

    use super::{PathOverrides, ResolutionContext, ValueSource, resolve_paths_with_lookup};

    fn context() -> ResolutionContext {
        ResolutionContext {
            cwd: PathBuf::from("/work"),
        }
    }

    #[test]
    fn flag_wins_over_env() {
        let env = HashMap::from([("WIKIFARM_CONFIG_DIR".to_string(), "/from-env".to_string())]);
        let overrides = PathOverrides {
            config_dir: Some(PathBuf::from("relative")),
        };
        let resolved = resolve_paths_with_lookup(&context(), &overrides, |key| env.get(key).cloned())
            .expect("resolve");
        assert_eq!(resolved.config_dir, PathBuf::from("/work/relative"));
        assert_eq!(resolved.config_source, ValueSource::Flag);
        assert_eq!(
            resolved.registry_path,
            PathBuf::from("/work/relative/conf.json")
        );
    }

    #[test]
    fn root_user_uses_system_dir() {
        let env = HashMap::from([
            ("USER".to_string(), "root".to_string()),
            ("HOME".to_string(), "/root".to_string()),
        ]);
        let resolved =
            resolve_paths_with_lookup(&context(), &PathOverrides::default(), |key| {
                env.get(key).cloned()
            })
            .expect("resolve");
        assert_eq!(resolved.config_dir, PathBuf::from("/etc/wikifarm"));
        assert_eq!(resolved.config_source, ValueSource::System);
    }

    #[test]
    fn xdg_precedes_home() {
        let env = HashMap::from([
            ("USER".to_string(), "alice".to_string()),
            ("XDG_CONFIG_HOME".to_string(), "/xdg".to_string()),
            ("HOME".to_string(), "/home/alice".to_string()),
        ]);
        let resolved =
            resolve_paths_with_lookup(&context(), &PathOverrides::default(), |key| {
                env.get(key).cloned()
            })
            .expect("resolve");
        assert_eq!(resolved.config_dir, PathBuf::from("/xdg/wikifarm"));
        assert_eq!(resolved.config_source, ValueSource::Xdg);
    }

    #[test]
    fn no_candidates_is_an_error() {
        let error = resolve_paths_with_lookup(&context(), &PathOverrides::default(), |_| None)
            .expect_err("must fail");
        assert!(format!("{error:#}").contains("--config-dir"));
    }
}
