use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::Serialize;
use tracing::info;

use crate::context::FarmContext;
use crate::credentials::{DEFAULT_PASSWORD_LENGTH, generate_password};
use crate::database::{drop_database, import_dump};
use crate::env_store::EnvStore;
use crate::error::{FarmError, StepTracker};
use crate::filesystem::copy_file;
use crate::lifecycle::{RestartReport, restart_installation};
use crate::orchestrator::{Orchestrator, WEB_SERVICE};
use crate::process::shell_quote;
use crate::registry::Installation;
use crate::routing::DEFAULT_HTTPS_PORT;
use crate::wikis::{Wiki, WikiList, WikiUrl, validate_wiki_id};

pub const DEFAULT_ADMIN_USER: &str = "Admin";

/// Arguments handed to the MediaWiki installer for one tenant.
#[derive(Debug, Clone)]
pub struct InstallerRequest<'a> {
    pub wiki: &'a Wiki,
    pub admin_user: &'a str,
    pub admin_password: &'a str,
}

/// Runs the installer for a single tenant inside the web service. The
/// database password is read from the container environment.
pub fn run_installer(
    orchestrator: &dyn Orchestrator,
    installation: &Installation,
    request: &InstallerRequest<'_>,
) -> Result<()> {
    let url = request.wiki.parsed_url()?;
    let script_path = match &url.path {
        Some(path) => format!("/{path}/w"),
        None => "/w".to_string(),
    };
    let command = format!(
        "php maintenance/install.php --dbserver=db --dbname={id} --dbuser=root \
         --dbpass=\"$MYSQL_PASSWORD\" --confpath=/tmp/{id} --server={server} \
         --scriptpath={script_path} --pass={password} {name} {admin}",
        id = request.wiki.id,
        server = shell_quote(&url.server()),
        password = shell_quote(request.admin_password),
        name = shell_quote(request.wiki.display_name()),
        admin = shell_quote(request.admin_user),
    );
    info!(installation = %installation.id, wiki = %request.wiki.id, "running installer");
    orchestrator
        .exec_streaming(installation, WEB_SERVICE, &command)
        .with_context(|| format!("installer failed for wiki '{}'", request.wiki.id))
}

#[derive(Debug, Clone)]
pub struct AddWikiRequest {
    pub id: String,
    pub url: String,
    pub name: Option<String>,
    pub database_dump: Option<PathBuf>,
    pub settings_file: Option<PathBuf>,
    pub admin_user: String,
    pub admin_password: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct AddWikiReport {
    pub wiki: Wiki,
    pub generated_admin_password: Option<String>,
    pub restart: RestartReport,
}

pub fn add_wiki(context: &FarmContext, request: AddWikiRequest) -> Result<AddWikiReport> {
    let installation = &context.installation;
    let orchestrator = context.orchestrator();

    validate_wiki_id(&request.id)?;
    let mut url = WikiUrl::parse(&request.url)?;

    orchestrator
        .check_running_status(installation)
        .context("the installation must be running to add a wiki")?;

    let mut wikis = WikiList::load(&installation.wikis_path())?;
    if url.port.is_none() {
        url = url.with_port(https_port(installation)?);
    }
    wikis.ensure_available(&request.id, &url)?;
    let wiki = Wiki {
        id: request.id.clone(),
        url: url.to_string(),
        name: request.name.clone(),
    };

    let mut generated_admin_password = None;
    match &request.database_dump {
        Some(dump) => import_dump(orchestrator, installation, &wiki.id, dump)?,
        None => {
            if let Some(settings) = &request.settings_file {
                stage_settings_file(installation, &wiki.id, settings)?;
            }
            let admin_password = match &request.admin_password {
                Some(password) => password.clone(),
                None => {
                    let password = generate_password(DEFAULT_PASSWORD_LENGTH);
                    generated_admin_password = Some(password.clone());
                    password
                }
            };
            run_installer(
                orchestrator,
                installation,
                &InstallerRequest {
                    wiki: &wiki,
                    admin_user: &request.admin_user,
                    admin_password: &admin_password,
                },
            )?;
        }
    }

    // Registration happens only once the tenant's database exists.
    let mut steps = StepTracker::new();
    steps.mark_done("provision database");
    let guidance = format!(
        "The database of '{}' exists; remove the wiki or register it by hand.",
        wiki.id
    );
    steps.run("register wiki", &guidance, || {
        wikis.add(wiki.clone())?;
        wikis.save(&installation.wikis_path())
    })?;
    info!(installation = %installation.id, wiki = %wiki.id, url = %wiki.url, "wiki registered");

    let restart = steps.run(
        "restart",
        "The wiki is in the tenant registry; run `wikifarm restart`.",
        || restart_installation(context, false),
    )?;
    Ok(AddWikiReport {
        wiki,
        generated_admin_password,
        restart,
    })
}

fn https_port(installation: &Installation) -> Result<u16> {
    let env = EnvStore::load(&installation.env_path())?;
    match env.get_non_empty("HTTPS_PORT") {
        Some(value) => value
            .parse::<u16>()
            .with_context(|| format!("HTTPS_PORT={value} in .env is not a valid port")),
        None => Ok(DEFAULT_HTTPS_PORT),
    }
}

fn stage_settings_file(installation: &Installation, wiki_id: &str, source: &Path) -> Result<()> {
    if !source.is_file() {
        return Err(FarmError::NotFound(format!(
            "settings file {} does not exist",
            source.display()
        ))
        .into());
    }
    let file_name = source
        .file_name()
        .ok_or_else(|| anyhow::anyhow!("settings file {} has no name", source.display()))?;
    copy_file(source, &installation.wiki_settings_dir(wiki_id).join(file_name))
}

#[derive(Debug, Clone, Serialize)]
pub struct RemoveWikiReport {
    pub removed: Wiki,
    pub restart: RestartReport,
}

/// Removes a tenant. `confirm` is asked once every precondition holds and
/// before anything is deleted; declining aborts without changes.
pub fn remove_wiki(
    context: &FarmContext,
    id: &str,
    confirm: impl FnOnce(&Wiki) -> Result<bool>,
) -> Result<RemoveWikiReport> {
    let installation = &context.installation;
    let orchestrator = context.orchestrator();

    let mut wikis = WikiList::load(&installation.wikis_path())?;
    wikis.ensure_removable(id)?;
    orchestrator
        .check_running_status(installation)
        .context("the installation must be running to remove a wiki")?;
    let wiki = wikis
        .get(id)
        .cloned()
        .ok_or_else(|| FarmError::NotFound(format!("wiki '{id}' does not exist")))?;
    if !confirm(&wiki)? {
        return Err(FarmError::ValidationFailed(format!("removal of wiki '{id}' was not confirmed")).into());
    }

    let guidance = format!("Re-run `wikifarm remove {id}`; completed steps are safe to repeat.");
    let mut steps = StepTracker::new();
    steps.run("remove settings", &guidance, || {
        remove_dir_if_present(&installation.wiki_settings_dir(id))
    })?;
    steps.run("drop database", &guidance, || {
        drop_database(orchestrator, installation, id)
    })?;
    steps.run("remove images", &guidance, || {
        remove_dir_if_present(&installation.wiki_images_dir(id))
    })?;
    let removed = steps.run("update tenant registry", &guidance, || {
        let removed = wikis.remove(id)?;
        wikis.save(&installation.wikis_path())?;
        Ok(removed)
    })?;
    let restart = steps.run(
        "restart",
        "The wiki is gone from the tenant registry; run `wikifarm restart`.",
        || restart_installation(context, false),
    )?;
    info!(installation = %installation.id, wiki = id, "wiki removed");
    Ok(RemoveWikiReport { removed, restart })
}

fn remove_dir_if_present(path: &Path) -> Result<()> {
    if path.exists() {
        fs::remove_dir_all(path).with_context(|| format!("failed to remove {}", path.display()))?;
    }
    Ok(())
}

pub fn list_wikis(installation: &Installation) -> Result<Vec<Wiki>> {
    Ok(WikiList::load(&installation.wikis_path())?.wikis)
}
