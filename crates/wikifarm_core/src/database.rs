use std::fs;
use std::path::Path;

use anyhow::{Context, Result};
use tracing::info;

use crate::error::FarmError;
use crate::orchestrator::{DB_SERVICE, Orchestrator};
use crate::registry::Installation;

/// Root credential as exposed inside the database container's environment.
/// Commands reference it through the shell so the secret stays off argv.
const ROOT_LOGIN: &str = "-u root -p\"$MYSQL_ROOT_PASSWORD\"";

fn remote_dump_path(wiki_id: &str) -> String {
    format!("/tmp/wikifarm-{wiki_id}.sql")
}

pub fn create_database(
    orchestrator: &dyn Orchestrator,
    installation: &Installation,
    wiki_id: &str,
) -> Result<()> {
    orchestrator.exec(
        installation,
        DB_SERVICE,
        &format!("mysql {ROOT_LOGIN} -e 'CREATE DATABASE IF NOT EXISTS `{wiki_id}`'"),
    )?;
    Ok(())
}

pub fn drop_database(
    orchestrator: &dyn Orchestrator,
    installation: &Installation,
    wiki_id: &str,
) -> Result<()> {
    info!(wiki = wiki_id, "dropping database");
    orchestrator.exec(
        installation,
        DB_SERVICE,
        &format!("mysql {ROOT_LOGIN} -e 'DROP DATABASE IF EXISTS `{wiki_id}`'"),
    )?;
    Ok(())
}

/// Loads a SQL dump from the host into the tenant's database, creating the
/// database first.
pub fn import_dump(
    orchestrator: &dyn Orchestrator,
    installation: &Installation,
    wiki_id: &str,
    dump: &Path,
) -> Result<()> {
    if !dump.is_file() {
        return Err(FarmError::NotFound(format!(
            "database dump {} does not exist",
            dump.display()
        ))
        .into());
    }
    info!(wiki = wiki_id, dump = %dump.display(), "importing database dump");
    create_database(orchestrator, installation, wiki_id)?;
    let remote = remote_dump_path(wiki_id);
    orchestrator.copy_to(installation, DB_SERVICE, dump, &remote)?;
    orchestrator
        .exec(
            installation,
            DB_SERVICE,
            &format!("mysql {ROOT_LOGIN} {wiki_id} < {remote} && rm -f {remote}"),
        )
        .with_context(|| format!("failed to import {} into '{wiki_id}'", dump.display()))?;
    Ok(())
}

/// Dumps the tenant's database to `target` on the host, creating the parent
/// directory first; backend copy tools do not.
pub fn export_dump(
    orchestrator: &dyn Orchestrator,
    installation: &Installation,
    wiki_id: &str,
    target: &Path,
) -> Result<()> {
    if let Some(parent) = target.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("failed to create {}", parent.display()))?;
    }
    let remote = remote_dump_path(wiki_id);
    orchestrator
        .exec(
            installation,
            DB_SERVICE,
            &format!("mysqldump {ROOT_LOGIN} --single-transaction {wiki_id} > {remote}"),
        )
        .with_context(|| format!("failed to dump database '{wiki_id}'"))?;
    orchestrator.copy_from(installation, DB_SERVICE, &remote, target)?;
    orchestrator.exec(installation, DB_SERVICE, &format!("rm -f {remote}"))?;
    Ok(())
}
