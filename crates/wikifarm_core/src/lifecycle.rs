use std::fs;
use std::path::{Path, PathBuf};
use std::rc::Rc;

use anyhow::{Context, Result};
use serde::Serialize;
use tracing::info;

use crate::config::ToolConfig;
use crate::context::FarmContext;
use crate::credentials::{DEFAULT_PASSWORD_LENGTH, generate_password};
use crate::env_store::EnvStore;
use crate::error::{FarmError, StepTracker};
use crate::filesystem::copy_dir_contents;
use crate::orchestrator::compose::DEV_COMPOSE_FILE;
use crate::orchestrator::{DestroyReport, for_installation};
use crate::process::CommandRunner;
use crate::registry::{Installation, OrchestratorKind, Registry};
use crate::routing::{ConfigUpdateReport, DEFAULT_HTTP_PORT, DEFAULT_HTTPS_PORT};
use crate::runtime::{RuntimePaths, absolutize};
use crate::tenants::{InstallerRequest, run_installer};
use crate::wikis::{STANDARD_HTTPS_PORT, Wiki, WikiList, WikiUrl, validate_wiki_id};

pub const MAX_INSTALLATION_ID_LEN: usize = 64;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RestartReport {
    pub config: ConfigUpdateReport,
    pub cluster_recreated: bool,
}

/// Regenerates backend config, stops, optionally recreates the managed
/// cluster, then starts. The cluster is recreated at most once per call.
pub fn restart_installation(context: &FarmContext, recreate_cluster: bool) -> Result<RestartReport> {
    let installation = &context.installation;
    let orchestrator = context.orchestrator();
    info!(installation = %installation.id, "regenerating backend config");
    let config = orchestrator.update_config(installation)?;
    info!(installation = %installation.id, "stopping");
    orchestrator.stop(installation)?;
    let cluster_recreated = if recreate_cluster {
        orchestrator.recreate_managed_cluster(installation)?
    } else {
        false
    };
    info!(installation = %installation.id, "starting");
    orchestrator.start(installation)?;
    Ok(RestartReport {
        config,
        cluster_recreated,
    })
}

pub fn start(context: &FarmContext) -> Result<ConfigUpdateReport> {
    let report = context.orchestrator().update_config(&context.installation)?;
    context.orchestrator().start(&context.installation)?;
    Ok(report)
}

pub fn stop(context: &FarmContext) -> Result<()> {
    context.orchestrator().stop(&context.installation)
}

pub fn list_installations(paths: &RuntimePaths) -> Result<Vec<Installation>> {
    Ok(Registry::load(&paths.registry_path)?
        .installations
        .into_values()
        .collect())
}

/// Switches the compose dev overlay on or off. Returns `false` when the
/// installation already was in the requested mode.
pub fn set_dev_mode(context: &mut FarmContext, enabled: bool) -> Result<bool> {
    if context.installation.dev_mode == enabled {
        return Ok(false);
    }
    if context.installation.orchestrator != OrchestratorKind::Compose {
        return Err(FarmError::ValidationFailed(format!(
            "dev mode is only available for {} installations",
            OrchestratorKind::Compose
        ))
        .into());
    }
    if enabled && !context.installation.path.join(DEV_COMPOSE_FILE).is_file() {
        return Err(FarmError::NotFound(format!(
            "{} is missing from {}",
            DEV_COMPOSE_FILE,
            context.installation.path.display()
        ))
        .into());
    }
    // Stop with the old file set so every container of the old layering goes down.
    context.orchestrator().stop(&context.installation)?;
    context.installation.dev_mode = enabled;
    context.save_installation()?;
    context.orchestrator().start(&context.installation)?;
    Ok(true)
}

pub fn validate_installation_id(id: &str) -> Result<()> {
    if id.is_empty() || id.len() > MAX_INSTALLATION_ID_LEN {
        return Err(FarmError::ValidationFailed(format!(
            "installation id must be 1-{MAX_INSTALLATION_ID_LEN} characters"
        ))
        .into());
    }
    if !id
        .chars()
        .all(|ch| ch.is_ascii_alphanumeric() || ch == '_' || ch == '-')
    {
        return Err(FarmError::ValidationFailed(format!(
            "installation id '{id}' may only contain letters, digits, '_' and '-'"
        ))
        .into());
    }
    Ok(())
}

#[derive(Debug, Clone)]
pub struct CreateInstallationRequest {
    pub id: String,
    pub path: PathBuf,
    pub orchestrator: OrchestratorKind,
    pub managed_cluster: Option<String>,
    pub template_dir: Option<PathBuf>,
    pub wiki_id: String,
    pub wiki_url: String,
    pub wiki_name: Option<String>,
    pub admin_user: String,
    pub admin_password: Option<String>,
    /// Extra `.env` entries written on top of the defaults.
    pub env: Vec<(String, String)>,
}

#[derive(Debug, Clone, Serialize)]
pub struct CreateInstallationReport {
    pub installation: Installation,
    pub wiki: Wiki,
    pub generated_admin_password: Option<String>,
    pub config: ConfigUpdateReport,
}

/// Lays out a new installation, starts it, installs its first wiki and only
/// then registers it.
pub fn create_installation(
    paths: &RuntimePaths,
    tool: &ToolConfig,
    runner: Rc<dyn CommandRunner>,
    request: CreateInstallationRequest,
) -> Result<CreateInstallationReport> {
    validate_installation_id(&request.id)?;
    validate_wiki_id(&request.wiki_id)?;
    let url = WikiUrl::parse(&request.wiki_url)?;
    let path = absolutize(&request.path, &paths.cwd);
    if request.managed_cluster.is_some() && request.orchestrator != OrchestratorKind::Kubernetes {
        return Err(FarmError::ValidationFailed(
            "a managed cluster requires the kubernetes orchestrator".to_string(),
        )
        .into());
    }

    let mut registry = Registry::load(&paths.registry_path)?;
    let installation = Installation {
        id: request.id.clone(),
        path: path.clone(),
        orchestrator: request.orchestrator,
        dev_mode: false,
        managed_cluster: request.managed_cluster.clone(),
    };
    // Conflicts are detected before anything is written.
    registry.clone().insert(installation.clone())?;
    ensure_empty_target(&path)?;

    let orchestrator = for_installation(&installation, tool, runner);
    orchestrator.check_dependencies()?;

    let guidance = format!(
        "Remove {} (and any containers it started) before re-running create.",
        path.display()
    );
    let mut steps = StepTracker::new();
    let template_dir = request.template_dir.clone().or_else(|| tool.stack.template_dir.clone());
    steps.run("lay out installation files", &guidance, || {
        fs::create_dir_all(&path).with_context(|| format!("failed to create {}", path.display()))?;
        if let Some(template) = &template_dir {
            let copied = copy_dir_contents(template, &path)
                .with_context(|| format!("failed to copy stack template {}", template.display()))?;
            info!(template = %template.display(), files = copied, "copied stack template");
        }
        Ok(())
    })?;

    let https_port = steps.run("write settings", &guidance, || {
        write_default_env(&installation, &request.env)
    })?;
    let wiki = Wiki {
        id: request.wiki_id.clone(),
        url: if url.port.is_none() {
            url.with_port(https_port).to_string()
        } else {
            url.to_string()
        },
        name: request.wiki_name.clone(),
    };
    steps.run("write tenant registry", &guidance, || {
        let mut wikis = WikiList::default();
        wikis.add(wiki.clone())?;
        wikis.save(&installation.wikis_path())
    })?;

    let config = steps.run("generate backend config", &guidance, || {
        orchestrator.update_config(&installation)
    })?;
    steps.run("start", &guidance, || orchestrator.start(&installation))?;

    let (admin_password, generated_admin_password) = match &request.admin_password {
        Some(password) => (password.clone(), None),
        None => {
            let password = generate_password(DEFAULT_PASSWORD_LENGTH);
            (password.clone(), Some(password))
        }
    };
    steps.run("install first wiki", &guidance, || {
        run_installer(
            orchestrator.as_ref(),
            &installation,
            &InstallerRequest {
                wiki: &wiki,
                admin_user: &request.admin_user,
                admin_password: &admin_password,
            },
        )
    })?;

    steps.run("register installation", &guidance, || {
        registry.insert(installation.clone())?;
        registry.save(&paths.registry_path)
    })?;
    info!(installation = %installation.id, path = %path.display(), "installation created");

    Ok(CreateInstallationReport {
        installation,
        wiki,
        generated_admin_password,
        config,
    })
}

fn ensure_empty_target(path: &Path) -> Result<()> {
    if !path.exists() {
        return Ok(());
    }
    let mut entries = fs::read_dir(path).with_context(|| format!("failed to read {}", path.display()))?;
    if entries.next().is_some() {
        return Err(FarmError::Conflict(format!(
            "{} already exists and is not empty",
            path.display()
        ))
        .into());
    }
    Ok(())
}

/// Writes `.env` defaults without overwriting what a stack template already
/// provides, then the caller's overrides. Returns the effective HTTPS port.
fn write_default_env(installation: &Installation, overrides: &[(String, String)]) -> Result<u16> {
    let mut env = EnvStore::load(&installation.env_path())?;
    let http_port = DEFAULT_HTTP_PORT.to_string();
    let https_port = DEFAULT_HTTPS_PORT.to_string();
    let defaults = [
        ("HTTP_PORT", http_port.as_str()),
        ("HTTPS_PORT", https_port.as_str()),
    ];
    for (key, value) in defaults {
        if env.get(key).is_none() {
            env.set(key, value);
        }
    }
    for key in ["MYSQL_PASSWORD", "WIKI_DB_PASSWORD", "MW_SECRET_KEY"] {
        if env.get_non_empty(key).is_none() {
            env.set(key, &generate_password(DEFAULT_PASSWORD_LENGTH));
        }
    }
    for (key, value) in overrides {
        env.set(key, value);
    }
    env.save()?;

    match env.get_non_empty("HTTPS_PORT") {
        Some(value) => value.parse::<u16>().map_err(|_| {
            FarmError::ValidationFailed(format!("HTTPS_PORT={value} is not a valid port")).into()
        }),
        None => Ok(STANDARD_HTTPS_PORT),
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct DeleteInstallationReport {
    pub installation: Installation,
    pub destroy: DestroyReport,
    pub files_removed: bool,
}

/// Tears down every backend resource, deregisters the installation and
/// optionally removes its directory. Deregistration only happens once the
/// teardown succeeded completely, so a failed delete can be re-run.
pub fn delete_installation(
    paths: &RuntimePaths,
    tool: &ToolConfig,
    runner: Rc<dyn CommandRunner>,
    id: &str,
    remove_files: bool,
) -> Result<DeleteInstallationReport> {
    let mut registry = Registry::load(&paths.registry_path)?;
    let installation = registry.get(id)?.clone();
    let orchestrator = for_installation(&installation, tool, runner);
    orchestrator.check_dependencies()?;

    let destroy = orchestrator.destroy(&installation)?;
    if !destroy.failures.is_empty() {
        return Err(FarmError::partial(
            "destroy backend resources",
            &destroy.removed,
            format!(
                "failed: {}\nFix the failures and re-run delete; the installation stays registered.",
                destroy.failures.join("; ")
            ),
        )
        .into());
    }

    registry.remove(id)?;
    registry.save(&paths.registry_path)?;

    let files_removed = remove_files && installation.path.exists();
    if files_removed {
        fs::remove_dir_all(&installation.path)
            .with_context(|| format!("failed to remove {}", installation.path.display()))?;
    }
    info!(installation = %installation.id, "installation deleted");
    Ok(DeleteInstallationReport {
        installation,
        destroy,
        files_removed,
    })
}

#[cfg(test)]
mod tests {
    use std::fs;
    use std::path::Path;
    use std::rc::Rc;

    use tempfile::tempdir;

    use super::{
        CreateInstallationRequest, create_installation, delete_installation,
        restart_installation, set_dev_mode, validate_installation_id,
    };
    use crate::config::ToolConfig;
    use crate::env_store::EnvStore;
    use crate::error::FarmError;
    use crate::registry::{OrchestratorKind, Registry};
    use crate::runtime::{RuntimePaths, ValueSource};
    use crate::testing::{
        FakeOrchestrator, MockRunner, compose_installation, fake_context, kubernetes_installation,
        write_farm,
    };
    use crate::wikis::WikiList;

    fn paths(root: &Path) -> RuntimePaths {
        let config_dir = root.join("config");
        RuntimePaths {
            cwd: root.to_path_buf(),
            registry_path: config_dir.join("conf.json"),
            tool_config_path: config_dir.join("config.toml"),
            config_dir,
            config_source: ValueSource::Flag,
        }
    }

    fn request(root: &Path) -> CreateInstallationRequest {
        CreateInstallationRequest {
            id: "prod".to_string(),
            path: root.join("farm"),
            orchestrator: OrchestratorKind::Compose,
            managed_cluster: None,
            template_dir: None,
            wiki_id: "main".to_string(),
            wiki_url: "localhost".to_string(),
            wiki_name: Some("Main Wiki".to_string()),
            admin_user: "Admin".to_string(),
            admin_password: None,
            env: vec![("HTTPS_PORT".to_string(), "8443".to_string())],
        }
    }

    #[test]
    fn restart_recreates_cluster_only_when_asked() {
        let temp = tempdir().expect("tempdir");
        let installation = kubernetes_installation(&temp.path().join("farm"), Some("farm"));
        write_farm(&installation, &[("main", "localhost")], "");
        let fake = Rc::new(FakeOrchestrator::new(&temp.path().join("repo")));
        let context = fake_context(installation, fake.clone());

        let report = restart_installation(&context, false).expect("restart");
        assert!(!report.cluster_recreated);
        let report = restart_installation(&context, true).expect("restart");
        assert!(report.cluster_recreated);
        assert_eq!(
            fake.events(),
            vec![
                "update_config",
                "stop",
                "start",
                "update_config",
                "stop",
                "recreate_cluster",
                "start"
            ]
        );
    }

    #[test]
    fn create_installs_first_wiki_and_registers_last() {
        let temp = tempdir().expect("tempdir");
        let template = temp.path().join("template");
        fs::create_dir_all(template.join("config")).expect("template");
        fs::write(template.join("docker-compose.yml"), "services: {}\n").expect("compose");
        fs::write(template.join(".env"), "MYSQL_PASSWORD=fromtemplate\n").expect("env");
        let mut request = request(temp.path());
        request.template_dir = Some(template);

        let runner = Rc::new(MockRunner::default());
        runner.respond("docker compose -f docker-compose.yml --env-file .env ps", 0, "abc123\n", "");
        let report = create_installation(&paths(temp.path()), &ToolConfig::default(), runner.clone(), request)
            .expect("create");

        let farm = temp.path().join("farm");
        assert_eq!(report.wiki.url, "localhost:8443");
        assert!(report.generated_admin_password.is_some());
        assert!(farm.join("config").join("Caddyfile").is_file());
        let env = EnvStore::load(&farm.join(".env")).expect("env");
        assert_eq!(env.get("MYSQL_PASSWORD"), Some("fromtemplate"));
        assert_eq!(env.get("HTTPS_PORT"), Some("8443"));
        let wikis = WikiList::load(&farm.join("config").join("wikis.yaml")).expect("wikis");
        assert_eq!(wikis.wikis.len(), 1);
        assert_eq!(wikis.wikis[0].id, "main");

        let commands = runner.commands();
        let up = commands
            .iter()
            .position(|line| line.ends_with("up -d"))
            .expect("started");
        let install = commands
            .iter()
            .position(|line| line.contains("maintenance/install.php"))
            .expect("installer ran");
        assert!(up < install);

        let registry = Registry::load(&paths(temp.path()).registry_path).expect("registry");
        assert_eq!(registry.get("prod").expect("registered").path, farm);
    }

    #[test]
    fn create_failure_after_layout_is_partial_and_unregistered() {
        let temp = tempdir().expect("tempdir");
        let runner = Rc::new(MockRunner::default());
        runner.respond("docker compose -f docker-compose.yml --env-file .env up", 1, "", "port is already allocated");
        let error = create_installation(
            &paths(temp.path()),
            &ToolConfig::default(),
            runner,
            request(temp.path()),
        )
        .expect_err("start fails");
        match FarmError::find(&error) {
            Some(FarmError::PartialFailure { step, guidance, .. }) => {
                assert_eq!(step, "start");
                assert!(guidance.contains("port is already allocated"));
            }
            other => panic!("unexpected error class: {other:?}"),
        }
        let registry = Registry::load(&paths(temp.path()).registry_path).expect("registry");
        assert!(registry.installations.is_empty());
    }

    #[test]
    fn create_rejects_non_empty_target_before_writing() {
        let temp = tempdir().expect("tempdir");
        let farm = temp.path().join("farm");
        fs::create_dir_all(&farm).expect("farm");
        fs::write(farm.join("keep.txt"), "mine").expect("file");
        let runner = Rc::new(MockRunner::default());
        let error = create_installation(
            &paths(temp.path()),
            &ToolConfig::default(),
            runner.clone(),
            request(temp.path()),
        )
        .expect_err("conflict");
        assert!(matches!(FarmError::find(&error), Some(FarmError::Conflict(_))));
        assert!(runner.commands().is_empty());
        assert!(!farm.join(".env").exists());
    }

    #[test]
    fn delete_keeps_registration_when_teardown_fails() {
        let temp = tempdir().expect("tempdir");
        let farm = temp.path().join("farm");
        let paths = paths(temp.path());
        let mut registry = Registry::default();
        let mut installation = compose_installation(&farm);
        installation.id = "prod".to_string();
        registry.insert(installation).expect("insert");
        registry.save(&paths.registry_path).expect("save");

        let runner = Rc::new(MockRunner::default());
        runner.respond("docker compose -f docker-compose.yml down", 1, "", "daemon unreachable");
        let error = delete_installation(&paths, &ToolConfig::default(), runner, "prod", false)
            .expect_err("teardown fails");
        assert!(matches!(
            FarmError::find(&error),
            Some(FarmError::PartialFailure { .. })
        ));
        let registry = Registry::load(&paths.registry_path).expect("registry");
        assert!(registry.get("prod").is_ok());
    }

    #[test]
    fn delete_deregisters_and_removes_files() {
        let temp = tempdir().expect("tempdir");
        let farm = temp.path().join("farm");
        fs::create_dir_all(&farm).expect("farm");
        let paths = paths(temp.path());
        let mut registry = Registry::default();
        registry.insert(compose_installation(&farm)).expect("insert");
        registry.save(&paths.registry_path).expect("save");

        let runner = Rc::new(MockRunner::default());
        let report = delete_installation(&paths, &ToolConfig::default(), runner, "farm", true)
            .expect("delete");
        assert!(report.files_removed);
        assert!(!farm.exists());
        let registry = Registry::load(&paths.registry_path).expect("registry");
        assert!(registry.installations.is_empty());
    }

    #[test]
    fn dev_mode_requires_overlay_and_is_persisted() {
        let temp = tempdir().expect("tempdir");
        let farm = temp.path().join("farm");
        let installation = compose_installation(&farm);
        write_farm(&installation, &[("main", "localhost")], "");
        let fake = Rc::new(FakeOrchestrator::new(&temp.path().join("repo")).running());
        let mut context = fake_context(installation.clone(), fake.clone());
        let mut registry = Registry::default();
        registry.insert(installation).expect("insert");
        registry.save(&context.paths.registry_path).expect("save");

        let error = set_dev_mode(&mut context, true).expect_err("no overlay");
        assert!(matches!(FarmError::find(&error), Some(FarmError::NotFound(_))));

        fs::write(farm.join("docker-compose.dev.yml"), "services: {}\n").expect("overlay");
        assert!(set_dev_mode(&mut context, true).expect("enable"));
        assert!(!set_dev_mode(&mut context, true).expect("already on"));
        assert_eq!(fake.events(), vec!["stop", "start"]);
        let registry = Registry::load(&context.paths.registry_path).expect("registry");
        assert!(registry.get("farm").expect("farm").dev_mode);
    }

    #[test]
    fn installation_ids_allow_dashes() {
        assert!(validate_installation_id("prod-eu_1").is_ok());
        assert!(validate_installation_id("prod eu").is_err());
        assert!(validate_installation_id("").is_err());
    }
}
