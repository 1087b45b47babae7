//! Backend adapters.
//!
//! Every higher-level operation (tenants, settings, backups, lifecycle) is
//! written against [`Orchestrator`] only. Adding a backend means adding a
//! variant to [`OrchestratorKind`] and an implementation here; call sites do
//! not change.

pub mod compose;
pub mod kubernetes;

use std::collections::BTreeMap;
use std::path::Path;
use std::rc::Rc;

use anyhow::Result;
use serde::Serialize;

use crate::config::ToolConfig;
use crate::process::CommandRunner;
use crate::registry::{Installation, OrchestratorKind};
use crate::routing::ConfigUpdateReport;

pub use compose::ComposeOrchestrator;
pub use kubernetes::KubernetesOrchestrator;

/// Service names shared by both stacks.
pub const WEB_SERVICE: &str = "web";
pub const DB_SERVICE: &str = "db";

/// Mount point of the staging area inside whatever container runs the
/// snapshot tool.
pub const SNAPSHOT_MOUNT: &str = "/currentsnapshot";

/// One run of the snapshot tool (restic) against an installation's staging area.
#[derive(Debug, Clone)]
pub struct SnapshotToolInvocation<'a> {
    pub repository: &'a str,
    /// Secrets and repository credentials; passed through the process
    /// environment, never on the command line.
    pub env: &'a BTreeMap<String, String>,
    /// Arguments following `restic -r <repository>`.
    pub args: Vec<String>,
    /// Host-side staging directory mapped to [`SNAPSHOT_MOUNT`], when the
    /// invocation reads or writes snapshot content.
    pub staging_dir: Option<&'a Path>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct DestroyReport {
    pub removed: Vec<String>,
    pub failures: Vec<String>,
}

pub trait Orchestrator {
    /// Fails with `DependencyMissing` when the backend CLI is absent.
    fn check_dependencies(&self) -> Result<()>;

    /// Brings every service up. Starting a running installation is a no-op.
    fn start(&self, installation: &Installation) -> Result<()>;

    /// Brings every service down. Stopping a stopped installation is a no-op.
    fn stop(&self, installation: &Installation) -> Result<()>;

    /// Regenerates routing/config artifacts from the tenant list and settings.
    /// Never touches running containers.
    fn update_config(&self, installation: &Installation) -> Result<ConfigUpdateReport>;

    /// Runs `command` through `sh -c` in `service` and returns combined output.
    fn exec(&self, installation: &Installation, service: &str, command: &str) -> Result<String>;

    fn exec_streaming(&self, installation: &Installation, service: &str, command: &str)
    -> Result<()>;

    fn copy_to(
        &self,
        installation: &Installation,
        service: &str,
        host_path: &Path,
        remote_path: &str,
    ) -> Result<()>;

    fn copy_from(
        &self,
        installation: &Installation,
        service: &str,
        remote_path: &str,
        host_path: &Path,
    ) -> Result<()>;

    /// Fails unless the web service has at least one ready replica.
    fn check_running_status(&self, installation: &Installation) -> Result<()>;

    /// Best-effort teardown of every resource tied to the installation.
    fn destroy(&self, installation: &Installation) -> Result<DestroyReport>;

    /// Recreates the managed compute cluster so new host port mappings take
    /// effect. Returns `false` when the backend has nothing to recreate.
    fn recreate_managed_cluster(&self, installation: &Installation) -> Result<bool>;

    /// Runs the snapshot tool with the staging area made available read-only
    /// to it. Returns the tool's stdout.
    fn run_backup(
        &self,
        installation: &Installation,
        invocation: &SnapshotToolInvocation<'_>,
    ) -> Result<String>;

    /// Runs the snapshot tool so that it restores into the staging area, then
    /// makes the restored content available in the host staging directory.
    fn restore_from_backup_volume(
        &self,
        installation: &Installation,
        invocation: &SnapshotToolInvocation<'_>,
    ) -> Result<String>;
}

/// Builds the adapter recorded in the installation's registry entry.
pub fn for_installation(
    installation: &Installation,
    tool: &ToolConfig,
    runner: Rc<dyn CommandRunner>,
) -> Rc<dyn Orchestrator> {
    match installation.orchestrator {
        OrchestratorKind::Compose => Rc::new(ComposeOrchestrator::new(tool, runner)),
        OrchestratorKind::Kubernetes => Rc::new(KubernetesOrchestrator::new(tool, runner)),
    }
}
