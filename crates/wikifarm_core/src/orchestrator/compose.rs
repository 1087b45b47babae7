use std::io::{self, IsTerminal};
use std::path::Path;
use std::rc::Rc;

use anyhow::Result;
use tracing::{info, warn};

use super::{DestroyReport, Orchestrator, SNAPSHOT_MOUNT, SnapshotToolInvocation, WEB_SERVICE};
use crate::config::ToolConfig;
use crate::error::FarmError;
use crate::process::{
    CommandRunner, CommandSpec, require_binary, run_checked, run_streaming_checked,
};
use crate::registry::Installation;
use crate::routing::{ConfigUpdateReport, RoutingInputs, render_caddyfile, write_artifact};

pub const MAIN_COMPOSE_FILE: &str = "docker-compose.yml";
pub const OVERRIDE_COMPOSE_FILE: &str = "docker-compose.override.yml";
pub const DEV_COMPOSE_FILE: &str = "docker-compose.dev.yml";

/// Local multi-process backend driven through `docker compose`.
pub struct ComposeOrchestrator {
    binary: String,
    restic_image: String,
    runner: Rc<dyn CommandRunner>,
}

impl ComposeOrchestrator {
    pub fn new(tool: &ToolConfig, runner: Rc<dyn CommandRunner>) -> Self {
        Self {
            binary: tool.compose_binary().to_string(),
            restic_image: tool.restic_image().to_string(),
            runner,
        }
    }

    /// Compose files in layering order: main, override, dev. Later files win.
    pub fn compose_files(installation: &Installation) -> Vec<String> {
        let mut files = vec![MAIN_COMPOSE_FILE.to_string()];
        if installation.path.join(OVERRIDE_COMPOSE_FILE).exists() {
            files.push(OVERRIDE_COMPOSE_FILE.to_string());
        }
        if installation.dev_mode {
            files.push(DEV_COMPOSE_FILE.to_string());
        }
        files
    }

    fn compose<I, S>(&self, installation: &Installation, args: I) -> CommandSpec
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut spec = CommandSpec::new(&self.binary)
            .arg("compose")
            .current_dir(&installation.path);
        for file in Self::compose_files(installation) {
            spec = spec.arg("-f").arg(file);
        }
        if installation.env_path().exists() {
            spec = spec.arg("--env-file").arg(".env");
        }
        spec.args(args)
    }

    /// `exec` arguments; `-T` drops the pseudo-TTY, which compose refuses to
    /// allocate when stdin is not a terminal.
    fn exec_args<'a>(service: &'a str, command: &'a str, stdin_is_terminal: bool) -> Vec<&'a str> {
        let mut args = vec!["exec"];
        if !stdin_is_terminal {
            args.push("-T");
        }
        args.extend([service, "sh", "-c", command]);
        args
    }

    fn running_containers(&self, installation: &Installation, service: &str) -> Result<Vec<String>> {
        let output = run_checked(
            self.runner.as_ref(),
            &self.compose(
                installation,
                ["ps", "--status", "running", "--quiet", service],
            ),
        )?;
        Ok(output
            .stdout
            .lines()
            .map(str::trim)
            .filter(|line| !line.is_empty())
            .map(str::to_string)
            .collect())
    }

    fn require_service(&self, installation: &Installation, service: &str) -> Result<()> {
        if self.running_containers(installation, service)?.is_empty() {
            return Err(FarmError::NotFound(format!(
                "no running container for service '{service}' in installation '{}'",
                installation.id
            ))
            .into());
        }
        Ok(())
    }

    fn snapshot_tool(
        &self,
        invocation: &SnapshotToolInvocation<'_>,
        read_only: bool,
    ) -> CommandSpec {
        let mut spec = CommandSpec::new(&self.binary).args(["run", "--rm"]);
        for (key, value) in invocation.env {
            spec = spec.arg("-e").arg(key.clone()).env(key.clone(), value.clone());
        }
        if let Some(staging) = invocation.staging_dir {
            let mode = if read_only { ":ro" } else { "" };
            spec = spec
                .arg("-v")
                .arg(format!("{}:{SNAPSHOT_MOUNT}{mode}", staging.display()));
        }
        spec.arg(&self.restic_image)
            .arg("-r")
            .arg(invocation.repository)
            .args(invocation.args.iter().cloned())
    }
}

impl Orchestrator for ComposeOrchestrator {
    fn check_dependencies(&self) -> Result<()> {
        require_binary(self.runner.as_ref(), &self.binary, &["compose", "version"])
    }

    fn start(&self, installation: &Installation) -> Result<()> {
        info!(installation = %installation.id, "starting compose stack");
        run_checked(self.runner.as_ref(), &self.compose(installation, ["up", "-d"]))?;
        Ok(())
    }

    fn stop(&self, installation: &Installation) -> Result<()> {
        info!(installation = %installation.id, "stopping compose stack");
        run_checked(self.runner.as_ref(), &self.compose(installation, ["down"]))?;
        Ok(())
    }

    fn update_config(&self, installation: &Installation) -> Result<ConfigUpdateReport> {
        let inputs = RoutingInputs::load(installation)?;
        let caddyfile = write_artifact(
            &installation.config_dir().join("Caddyfile"),
            &render_caddyfile(&inputs),
        )?;
        Ok(ConfigUpdateReport {
            domains: inputs.domains,
            artifacts: vec![caddyfile],
        })
    }

    fn exec(&self, installation: &Installation, service: &str, command: &str) -> Result<String> {
        self.require_service(installation, service)?;
        let output = run_checked(
            self.runner.as_ref(),
            &self.compose(installation, Self::exec_args(service, command, false)),
        )?;
        Ok(output.combined())
    }

    fn exec_streaming(
        &self,
        installation: &Installation,
        service: &str,
        command: &str,
    ) -> Result<()> {
        self.require_service(installation, service)?;
        run_streaming_checked(
            self.runner.as_ref(),
            &self.compose(
                installation,
                Self::exec_args(service, command, io::stdin().is_terminal()),
            ),
        )
    }

    fn copy_to(
        &self,
        installation: &Installation,
        service: &str,
        host_path: &Path,
        remote_path: &str,
    ) -> Result<()> {
        self.require_service(installation, service)?;
        run_checked(
            self.runner.as_ref(),
            &self.compose(
                installation,
                [
                    "cp".to_string(),
                    host_path.display().to_string(),
                    format!("{service}:{remote_path}"),
                ],
            ),
        )?;
        Ok(())
    }

    fn copy_from(
        &self,
        installation: &Installation,
        service: &str,
        remote_path: &str,
        host_path: &Path,
    ) -> Result<()> {
        self.require_service(installation, service)?;
        run_checked(
            self.runner.as_ref(),
            &self.compose(
                installation,
                [
                    "cp".to_string(),
                    format!("{service}:{remote_path}"),
                    host_path.display().to_string(),
                ],
            ),
        )?;
        Ok(())
    }

    fn check_running_status(&self, installation: &Installation) -> Result<()> {
        self.require_service(installation, WEB_SERVICE)
    }

    fn destroy(&self, installation: &Installation) -> Result<DestroyReport> {
        let mut report = DestroyReport::default();
        let spec = self.compose(installation, ["down", "--volumes", "--remove-orphans"]);
        match run_checked(self.runner.as_ref(), &spec) {
            Ok(_) => report
                .removed
                .push("containers, networks and volumes".to_string()),
            Err(error) => {
                warn!(installation = %installation.id, "compose teardown failed: {error:#}");
                report.failures.push(format!("{error:#}"));
            }
        }
        Ok(report)
    }

    fn recreate_managed_cluster(&self, _installation: &Installation) -> Result<bool> {
        Ok(false)
    }

    fn run_backup(
        &self,
        installation: &Installation,
        invocation: &SnapshotToolInvocation<'_>,
    ) -> Result<String> {
        info!(installation = %installation.id, args = ?invocation.args, "running snapshot tool");
        let output = run_checked(self.runner.as_ref(), &self.snapshot_tool(invocation, true))?;
        Ok(output.stdout)
    }

    fn restore_from_backup_volume(
        &self,
        installation: &Installation,
        invocation: &SnapshotToolInvocation<'_>,
    ) -> Result<String> {
        info!(installation = %installation.id, args = ?invocation.args, "restoring into staging area");
        let output = run_checked(self.runner.as_ref(), &self.snapshot_tool(invocation, false))?;
        Ok(output.stdout)
    }
}
