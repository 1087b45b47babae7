//! Snapshot pipeline: dump databases and copy installation content into the
//! staging area, snapshot the staging area with restic, and the reverse.

use std::collections::BTreeMap;
use std::fs;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::context::FarmContext;
use crate::database::{export_dump, import_dump};
use crate::env_store::EnvStore;
use crate::error::{FarmError, StepTracker};
use crate::filesystem::{clear_dir_contents, copy_dir_contents, copy_file, replace_dir_contents};
use crate::lifecycle::{RestartReport, restart_installation};
use crate::orchestrator::{SNAPSHOT_MOUNT, SnapshotToolInvocation};
use crate::wikis::WikiList;

/// Directories of the installation tree captured in every snapshot.
pub const STAGED_DIRS: &[&str] = &["config", "extensions", "images", "skins"];
/// Single files captured when present.
pub const STAGED_FILES: &[&str] = &[".env", "docker-compose.override.yml"];
/// Staging subdirectory holding one `<wiki>.sql` per tenant.
pub const DUMP_DIR: &str = "db";

pub const SAFETY_TAG_PREFIX: &str = "BeforeRestoring-";
const HOST_SEPARATOR: &str = "__on__";

/// Where snapshots go and the secrets the snapshot tool needs to reach it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Repository {
    pub url: String,
    pub env: BTreeMap<String, String>,
}

/// Resolves the repository from the settings store: `RESTIC_REPOSITORY`,
/// else `BACKUP_REPOSITORY`, else `s3:<AWS_S3_ENDPOINT>/<AWS_S3_BUCKET>`.
pub fn resolve_repository(store: &EnvStore) -> Result<Repository> {
    let url = store
        .get_non_empty("RESTIC_REPOSITORY")
        .or_else(|| store.get_non_empty("BACKUP_REPOSITORY"))
        .map(str::to_string)
        .or_else(|| {
            match (
                store.get_non_empty("AWS_S3_ENDPOINT"),
                store.get_non_empty("AWS_S3_BUCKET"),
            ) {
                (Some(endpoint), Some(bucket)) => Some(format!(
                    "s3:{}/{}",
                    endpoint.trim_end_matches('/'),
                    bucket.trim_matches('/')
                )),
                _ => None,
            }
        })
        .ok_or_else(|| {
            FarmError::ValidationFailed(
                "no backup repository configured: set RESTIC_REPOSITORY, BACKUP_REPOSITORY or AWS_S3_ENDPOINT and AWS_S3_BUCKET".to_string(),
            )
        })?;

    let password = store.get_non_empty("RESTIC_PASSWORD").ok_or_else(|| {
        FarmError::ValidationFailed("RESTIC_PASSWORD must be set to use backups".to_string())
    })?;
    let mut env = BTreeMap::new();
    env.insert("RESTIC_PASSWORD".to_string(), password.to_string());
    for key in ["AWS_ACCESS_KEY_ID", "AWS_SECRET_ACCESS_KEY"] {
        if let Some(value) = store.get_non_empty(key) {
            env.insert(key.to_string(), value.to_string());
        }
    }
    Ok(Repository { url, env })
}

pub fn snapshot_tag(label: &str, host: &str) -> Result<String> {
    validate_label(label)?;
    Ok(format!("{label}{HOST_SEPARATOR}{host}"))
}

pub fn validate_label(label: &str) -> Result<()> {
    if label.is_empty()
        || !label
            .chars()
            .all(|ch| ch.is_ascii_alphanumeric() || matches!(ch, '_' | '-' | '.'))
    {
        return Err(FarmError::ValidationFailed(format!(
            "backup tag '{label}' may only contain letters, digits, '_', '-' and '.'"
        ))
        .into());
    }
    if label.contains(HOST_SEPARATOR) {
        return Err(FarmError::ValidationFailed(format!(
            "backup tag '{label}' must not contain '{HOST_SEPARATOR}'"
        ))
        .into());
    }
    Ok(())
}

/// One entry of `restic snapshots --json`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Snapshot {
    pub id: String,
    #[serde(default)]
    pub short_id: String,
    pub time: String,
    #[serde(default)]
    pub hostname: String,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub paths: Vec<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct BackupReport {
    pub snapshot_id: Option<String>,
    pub tag: String,
    pub databases: Vec<String>,
    pub staged_files: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct RestoreReport {
    pub snapshot_id: String,
    pub safety_snapshot: Option<BackupReport>,
    pub databases: Vec<String>,
    pub restart: RestartReport,
}

fn load_repository(context: &FarmContext) -> Result<Repository> {
    resolve_repository(&EnvStore::load(&context.installation.env_path())?)
}

fn run_tool(context: &FarmContext, repository: &Repository, args: Vec<String>) -> Result<String> {
    context.orchestrator().run_backup(
        &context.installation,
        &SnapshotToolInvocation {
            repository: &repository.url,
            env: &repository.env,
            args,
            staging_dir: None,
        },
    )
}

pub fn init_repository(context: &FarmContext) -> Result<String> {
    let repository = load_repository(context)?;
    info!(installation = %context.installation.id, repository = %repository.url, "initialising backup repository");
    run_tool(context, &repository, vec!["init".to_string()])
}

pub fn list_snapshots(context: &FarmContext) -> Result<Vec<Snapshot>> {
    let repository = load_repository(context)?;
    let output = run_tool(
        context,
        &repository,
        vec!["snapshots".to_string(), "--json".to_string()],
    )?;
    parse_snapshot_list(&output)
}

pub fn parse_snapshot_list(output: &str) -> Result<Vec<Snapshot>> {
    let trimmed = output.trim();
    if trimmed.is_empty() || trimmed == "null" {
        return Ok(Vec::new());
    }
    serde_json::from_str(trimmed).context("failed to parse snapshot list from restic")
}

/// Forgets one snapshot. Repository data is not pruned.
pub fn delete_snapshot(context: &FarmContext, snapshot_id: &str) -> Result<()> {
    let repository = load_repository(context)?;
    info!(installation = %context.installation.id, snapshot = snapshot_id, "forgetting snapshot");
    run_tool(
        context,
        &repository,
        vec!["forget".to_string(), snapshot_id.to_string()],
    )?;
    Ok(())
}

pub fn create_backup(context: &FarmContext, label: &str) -> Result<BackupReport> {
    let tag = snapshot_tag(label, &context.tool.backup_host())?;
    let repository = load_repository(context)?;
    snapshot_with_tag(context, &repository, tag)
}

fn snapshot_with_tag(context: &FarmContext, repository: &Repository, tag: String) -> Result<BackupReport> {
    let installation = &context.installation;
    let orchestrator = context.orchestrator();
    orchestrator
        .check_running_status(installation)
        .context("the installation must be running to take a backup")?;

    let staging = installation.staging_dir();
    clear_dir_contents(&staging)?;

    let wikis = WikiList::load(&installation.wikis_path())?;
    let mut databases = Vec::new();
    for wiki in &wikis.wikis {
        info!(installation = %installation.id, wiki = %wiki.id, "dumping database");
        export_dump(
            orchestrator,
            installation,
            &wiki.id,
            &staging.join(DUMP_DIR).join(format!("{}.sql", wiki.id)),
        )?;
        databases.push(wiki.id.clone());
    }

    let mut staged_files = databases.len();
    for dir in STAGED_DIRS {
        let source = installation.path.join(dir);
        if source.is_dir() {
            staged_files += copy_dir_contents(&source, &staging.join(dir))?;
        }
    }
    for file in STAGED_FILES {
        let source = installation.path.join(file);
        if source.is_file() {
            copy_file(&source, &staging.join(file))?;
            staged_files += 1;
        }
    }
    info!(installation = %installation.id, files = staged_files, tag = %tag, "staging complete, taking snapshot");

    let output = orchestrator.run_backup(
        installation,
        &SnapshotToolInvocation {
            repository: &repository.url,
            env: &repository.env,
            args: vec![
                "backup".to_string(),
                SNAPSHOT_MOUNT.to_string(),
                "--tag".to_string(),
                tag.clone(),
                "--json".to_string(),
            ],
            staging_dir: Some(&staging),
        },
    )?;
    let snapshot_id = summary_snapshot_id(&output);
    if snapshot_id.is_none() {
        warn!("restic output carried no snapshot summary");
    }
    Ok(BackupReport {
        snapshot_id,
        tag,
        databases,
        staged_files,
    })
}

/// Picks the snapshot id out of `restic backup --json` progress lines.
fn summary_snapshot_id(output: &str) -> Option<String> {
    output
        .lines()
        .filter_map(|line| serde_json::from_str::<serde_json::Value>(line).ok())
        .find(|message| message.get("message_type").and_then(|kind| kind.as_str()) == Some("summary"))
        .and_then(|summary| summary.get("snapshot_id")?.as_str().map(str::to_string))
}

/// Restores a snapshot over the live installation. Unless skipped, a safety
/// snapshot tagged `BeforeRestoring-<id>` is taken first.
pub fn restore_backup(context: &FarmContext, snapshot_id: &str, skip_safety: bool) -> Result<RestoreReport> {
    let installation = &context.installation;
    let orchestrator = context.orchestrator();
    if snapshot_id.is_empty() || snapshot_id.starts_with('-') {
        return Err(FarmError::ValidationFailed(format!("'{snapshot_id}' is not a snapshot id")).into());
    }
    let repository = load_repository(context)?;

    let safety_snapshot = if skip_safety {
        None
    } else {
        let report = snapshot_with_tag(context, &repository, format!("{SAFETY_TAG_PREFIX}{snapshot_id}"))
            .context("safety snapshot failed; nothing was restored")?;
        info!(snapshot = ?report.snapshot_id, "safety snapshot taken");
        Some(report)
    };
    let guidance = match safety_snapshot.as_ref().and_then(|report| report.snapshot_id.as_deref()) {
        Some(safety_id) => format!(
            "The pre-restore state is in snapshot {safety_id}; run `wikifarm backup restore {safety_id} --skip-safety` to return to it."
        ),
        None => format!("Re-run `wikifarm backup restore {snapshot_id}` to finish."),
    };

    let staging = installation.staging_dir();
    let mut steps = StepTracker::new();
    if safety_snapshot.is_some() {
        steps.mark_done("safety snapshot");
    }
    steps.run("restore into staging area", &guidance, || {
        clear_dir_contents(&staging)?;
        orchestrator.restore_from_backup_volume(
            installation,
            &SnapshotToolInvocation {
                repository: &repository.url,
                env: &repository.env,
                args: vec![
                    "restore".to_string(),
                    snapshot_id.to_string(),
                    "--target".to_string(),
                    "/".to_string(),
                ],
                staging_dir: Some(&staging),
            },
        )
    })?;

    steps.run("copy files back", &guidance, || {
        for dir in STAGED_DIRS {
            let source = staging.join(dir);
            if source.is_dir() {
                replace_dir_contents(&source, &installation.path.join(dir))?;
            }
        }
        for file in STAGED_FILES {
            let source = staging.join(file);
            if source.is_file() {
                copy_file(&source, &installation.path.join(file))?;
            }
        }
        Ok(())
    })?;

    let databases = steps.run("reload databases", &guidance, || {
        let mut databases = Vec::new();
        let dump_dir = staging.join(DUMP_DIR);
        if dump_dir.is_dir() {
            let mut dumps = fs::read_dir(&dump_dir)
                .with_context(|| format!("failed to read {}", dump_dir.display()))?
                .filter_map(|entry| entry.ok().map(|entry| entry.path()))
                .filter(|path| path.extension().is_some_and(|ext| ext == "sql"))
                .collect::<Vec<_>>();
            dumps.sort();
            for dump in dumps {
                let Some(wiki_id) = dump.file_stem().and_then(|stem| stem.to_str()) else {
                    continue;
                };
                import_dump(orchestrator, installation, wiki_id, &dump)?;
                databases.push(wiki_id.to_string());
            }
        }
        Ok(databases)
    })?;

    let restart = steps.run("restart", &guidance, || restart_installation(context, false))?;
    info!(installation = %installation.id, snapshot = snapshot_id, "restore complete");
    Ok(RestoreReport {
        snapshot_id: snapshot_id.to_string(),
        safety_snapshot,
        databases,
        restart,
    })
}

#[cfg(test)]
mod tests {
    use std::fs;
    use std::rc::Rc;

    use tempfile::tempdir;

    use super::{
        create_backup, delete_snapshot, list_snapshots, parse_snapshot_list, resolve_repository,
        restore_backup, snapshot_tag,
    };
    use crate::context::FarmContext;
    use crate::env_store::EnvStore;
    use crate::error::FarmError;
    use crate::testing::{FakeOrchestrator, compose_installation, fake_context, write_farm};

    const BACKUP_ENV: &str = "RESTIC_REPOSITORY=s3:https://s3.example.org/farm\nRESTIC_PASSWORD=topsecret\n";

    fn farm(root: &std::path::Path) -> (FarmContext, Rc<FakeOrchestrator>) {
        let installation = compose_installation(&root.join("farm"));
        write_farm(
            &installation,
            &[("main", "localhost"), ("docs", "localhost/docs")],
            BACKUP_ENV,
        );
        fs::create_dir_all(installation.path.join("images").join("main")).expect("images");
        fs::write(
            installation.path.join("images").join("main").join("logo.png"),
            b"\x89PNG",
        )
        .expect("logo");
        let fake = Rc::new(FakeOrchestrator::new(&root.join("repo")).running());
        let mut context = fake_context(installation, fake.clone());
        context.tool.backup.host = Some("testhost".to_string());
        (context, fake)
    }

    fn store(content: &str) -> EnvStore {
        let temp = tempdir().expect("tempdir");
        let path = temp.path().join(".env");
        fs::write(&path, content).expect("env");
        EnvStore::load(&path).expect("load")
    }

    #[test]
    fn repository_precedence() {
        let repository = resolve_repository(&store(
            "RESTIC_REPOSITORY=/srv/restic\nBACKUP_REPOSITORY=/srv/other\nRESTIC_PASSWORD=pw\n",
        ))
        .expect("explicit");
        assert_eq!(repository.url, "/srv/restic");

        let repository = resolve_repository(&store(
            "RESTIC_REPOSITORY=\nBACKUP_REPOSITORY=/srv/other\nRESTIC_PASSWORD=pw\n",
        ))
        .expect("alternate");
        assert_eq!(repository.url, "/srv/other");

        let repository = resolve_repository(&store(
            "AWS_S3_ENDPOINT=https://s3.example.org/\nAWS_S3_BUCKET=farm\nAWS_ACCESS_KEY_ID=key\nRESTIC_PASSWORD=pw\n",
        ))
        .expect("object storage");
        assert_eq!(repository.url, "s3:https://s3.example.org/farm");
        assert_eq!(repository.env.get("AWS_ACCESS_KEY_ID").map(String::as_str), Some("key"));
    }

    #[test]
    fn repository_requires_location_and_password() {
        let error = resolve_repository(&store("RESTIC_PASSWORD=pw\n")).expect_err("no repo");
        assert!(matches!(
            FarmError::find(&error),
            Some(FarmError::ValidationFailed(_))
        ));
        let error = resolve_repository(&store("RESTIC_REPOSITORY=/srv/restic\n")).expect_err("no password");
        assert!(matches!(
            FarmError::find(&error),
            Some(FarmError::ValidationFailed(_))
        ));
    }

    #[test]
    fn tag_carries_host_qualifier() {
        assert_eq!(snapshot_tag("t1", "wiki01").expect("tag"), "t1__on__wiki01");
        assert!(snapshot_tag("has space", "wiki01").is_err());
        assert!(snapshot_tag("", "wiki01").is_err());
    }

    #[test]
    fn backup_stages_dumps_and_tree() {
        let temp = tempdir().expect("tempdir");
        let (context, fake) = farm(temp.path());
        let report = create_backup(&context, "t1").expect("backup");
        assert_eq!(report.snapshot_id.as_deref(), Some("snap0001"));
        assert_eq!(report.tag, "t1__on__testhost");
        assert_eq!(report.databases, vec!["main", "docs"]);

        let snapshot = temp.path().join("repo").join("snap0001");
        assert!(snapshot.join("db").join("main.sql").is_file());
        assert!(snapshot.join("db").join("docs.sql").is_file());
        assert!(snapshot.join("config").join("wikis.yaml").is_file());
        assert!(snapshot.join("images").join("main").join("logo.png").is_file());
        assert!(snapshot.join(".env").is_file());
        assert_eq!(
            fake.snapshot_tags(),
            vec![("snap0001".to_string(), vec!["t1__on__testhost".to_string()])]
        );
    }

    #[test]
    fn backup_then_restore_reproduces_registry_and_settings() {
        let temp = tempdir().expect("tempdir");
        let (context, _fake) = farm(temp.path());
        let installation = context.installation.clone();
        let wikis_before = fs::read(installation.wikis_path()).expect("wikis");
        let env_before = fs::read(installation.env_path()).expect("env");

        let report = create_backup(&context, "t1").expect("backup");
        let snapshot_id = report.snapshot_id.expect("snapshot id");

        write_farm(
            &installation,
            &[("main", "localhost"), ("blog", "blog.example.com")],
            &format!("{BACKUP_ENV}HTTP_PORT=8080\n"),
        );
        fs::write(installation.path.join("images").join("stray.png"), b"x").expect("stray");

        let restored = restore_backup(&context, &snapshot_id, true).expect("restore");
        assert!(restored.safety_snapshot.is_none());
        assert_eq!(restored.databases, vec!["docs", "main"]);
        assert_eq!(fs::read(installation.wikis_path()).expect("wikis"), wikis_before);
        assert_eq!(fs::read(installation.env_path()).expect("env"), env_before);
        assert!(!installation.path.join("images").join("stray.png").exists());
    }

    #[test]
    fn restore_takes_safety_snapshot_first() {
        let temp = tempdir().expect("tempdir");
        let (context, fake) = farm(temp.path());
        let report = create_backup(&context, "t1").expect("backup");
        let snapshot_id = report.snapshot_id.expect("snapshot id");

        let restored = restore_backup(&context, &snapshot_id, false).expect("restore");
        let safety = restored.safety_snapshot.expect("safety snapshot");
        assert_eq!(safety.tag, "BeforeRestoring-snap0001");
        assert_eq!(
            fake.snapshot_tags()[1],
            ("snap0002".to_string(), vec!["BeforeRestoring-snap0001".to_string()])
        );

        let events = fake.events();
        let safety_at = events
            .iter()
            .position(|event| event.contains("BeforeRestoring-snap0001"))
            .expect("safety backup");
        let restore_at = events
            .iter()
            .position(|event| event.starts_with("restic restore"))
            .expect("restore");
        assert!(safety_at < restore_at);
    }

    #[test]
    fn failed_restore_points_at_safety_snapshot() {
        let temp = tempdir().expect("tempdir");
        let (context, fake) = farm(temp.path());
        create_backup(&context, "t1").expect("backup");
        fake.fail_on("restic restore");

        let error = restore_backup(&context, "snap0001", false).expect_err("restore fails");
        match FarmError::find(&error) {
            Some(FarmError::PartialFailure { step, guidance, .. }) => {
                assert_eq!(step, "restore into staging area");
                assert!(guidance.contains("snap0002"));
            }
            other => panic!("unexpected error class: {other:?}"),
        }
    }

    #[test]
    fn list_and_forget_snapshots() {
        let temp = tempdir().expect("tempdir");
        let (context, _fake) = farm(temp.path());
        create_backup(&context, "t1").expect("first");
        create_backup(&context, "t2").expect("second");

        let snapshots = list_snapshots(&context).expect("list");
        assert_eq!(snapshots.len(), 2);
        assert_eq!(snapshots[1].tags, vec!["t2__on__testhost"]);

        delete_snapshot(&context, "snap0001").expect("forget");
        let snapshots = list_snapshots(&context).expect("list");
        assert_eq!(snapshots.len(), 1);
        assert_eq!(snapshots[0].id, "snap0002");
    }

    #[test]
    fn empty_snapshot_list_parses() {
        assert!(parse_snapshot_list("null\n").expect("null").is_empty());
        assert!(parse_snapshot_list("[]").expect("empty").is_empty());
    }

    #[test]
    fn backup_requires_running_installation() {
        let temp = tempdir().expect("tempdir");
        let installation = compose_installation(&temp.path().join("farm"));
        write_farm(&installation, &[("main", "localhost")], BACKUP_ENV);
        let fake = Rc::new(FakeOrchestrator::new(&temp.path().join("repo")));
        let context = fake_context(installation, fake);
        let error = create_backup(&context, "t1").expect_err("stopped");
        assert!(matches!(FarmError::find(&error), Some(FarmError::NotFound(_))));
    }
}
