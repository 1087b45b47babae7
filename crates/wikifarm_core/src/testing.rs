//! Test doubles shared by the module tests.

use std::cell::RefCell;
use std::fs;
use std::path::{Path, PathBuf};
use std::rc::Rc;

use anyhow::{Context, Result, anyhow, bail};

use crate::config::ToolConfig;
use crate::context::FarmContext;
use crate::error::FarmError;
use crate::filesystem::{clear_dir_contents, copy_dir_contents};
use crate::orchestrator::{DestroyReport, Orchestrator, SnapshotToolInvocation};
use crate::process::{CommandOutput, CommandRunner, CommandSpec};
use crate::registry::{Installation, OrchestratorKind};
use crate::runtime::{RuntimePaths, ValueSource};
use crate::routing::{ConfigUpdateReport, RoutingInputs, render_caddyfile, write_artifact};
use crate::wikis::{Wiki, WikiList};

/// Scripted runner: responses are keyed by command-line prefix (longest match
/// wins); unmatched commands succeed with empty output.
#[derive(Default)]
pub struct MockRunner {
    responses: RefCell<Vec<(String, CommandOutput)>>,
    missing: RefCell<Vec<String>>,
    calls: RefCell<Vec<CommandSpec>>,
}

impl MockRunner {
    pub fn respond(&self, prefix: &str, code: i32, stdout: &str, stderr: &str) {
        self.responses.borrow_mut().push((
            prefix.to_string(),
            CommandOutput {
                code,
                stdout: stdout.to_string(),
                stderr: stderr.to_string(),
            },
        ));
    }

    pub fn fail_spawn(&self, program: &str) {
        self.missing.borrow_mut().push(program.to_string());
    }

    pub fn calls(&self) -> Vec<CommandSpec> {
        self.calls.borrow().clone()
    }

    pub fn commands(&self) -> Vec<String> {
        self.calls.borrow().iter().map(CommandSpec::display).collect()
    }

    fn lookup(&self, spec: &CommandSpec) -> Result<CommandOutput> {
        if self.missing.borrow().contains(&spec.program) {
            bail!("No such file or directory (os error 2)");
        }
        self.calls.borrow_mut().push(spec.clone());
        let line = spec.display();
        Ok(self
            .responses
            .borrow()
            .iter()
            .filter(|(prefix, _)| line.starts_with(prefix.as_str()))
            .max_by_key(|(prefix, _)| prefix.len())
            .map(|(_, output)| output.clone())
            .unwrap_or_default())
    }
}

impl CommandRunner for MockRunner {
    fn run(&self, spec: &CommandSpec) -> Result<CommandOutput> {
        self.lookup(spec)
    }

    fn run_streaming(&self, spec: &CommandSpec) -> Result<i32> {
        Ok(self.lookup(spec)?.code)
    }
}

pub fn compose_installation(path: &Path) -> Installation {
    Installation {
        id: "farm".to_string(),
        path: path.to_path_buf(),
        orchestrator: OrchestratorKind::Compose,
        dev_mode: false,
        managed_cluster: None,
    }
}

pub fn kubernetes_installation(path: &Path, cluster: Option<&str>) -> Installation {
    let manifests = path.join("kubernetes");
    fs::create_dir_all(&manifests).expect("create manifest dir");
    fs::write(
        manifests.join("kustomization.yaml"),
        "namespace: farm\nresources:\n  - web.yaml\n",
    )
    .expect("write kustomization");
    Installation {
        id: "farm".to_string(),
        path: path.to_path_buf(),
        orchestrator: OrchestratorKind::Kubernetes,
        dev_mode: false,
        managed_cluster: cluster.map(str::to_string),
    }
}

/// Writes `config/wikis.yaml` and `.env` for a test farm.
pub fn write_farm(installation: &Installation, wikis: &[(&str, &str)], env: &str) {
    let list = WikiList {
        wikis: wikis
            .iter()
            .map(|(id, url)| Wiki {
                id: id.to_string(),
                url: url.to_string(),
                name: None,
            })
            .collect(),
    };
    list.save(&installation.wikis_path()).expect("write wikis");
    fs::write(installation.env_path(), env).expect("write env");
}

/// Context wired to a fake backend; the registry lives next to the farm.
pub fn fake_context(installation: Installation, orchestrator: Rc<FakeOrchestrator>) -> FarmContext {
    let config_dir = installation
        .path
        .parent()
        .unwrap_or(&installation.path)
        .join("wikifarm-config");
    FarmContext {
        paths: RuntimePaths {
            cwd: installation.path.clone(),
            registry_path: config_dir.join("conf.json"),
            tool_config_path: config_dir.join("config.toml"),
            config_dir,
            config_source: ValueSource::Flag,
        },
        tool: ToolConfig::default(),
        installation,
        orchestrator,
        runner: Rc::new(MockRunner::default()),
    }
}

#[derive(Debug, Default)]
struct FakeState {
    running: bool,
    events: Vec<String>,
    snapshots: Vec<(String, Vec<String>)>,
    fail_on: Option<String>,
}

/// In-memory backend: tracks running state and events, writes a real
/// Caddyfile, and keeps snapshots as directory copies under `repository`.
pub struct FakeOrchestrator {
    repository: PathBuf,
    state: RefCell<FakeState>,
}

impl FakeOrchestrator {
    pub fn new(repository: &Path) -> Self {
        Self {
            repository: repository.to_path_buf(),
            state: RefCell::new(FakeState::default()),
        }
    }

    pub fn running(self) -> Self {
        self.state.borrow_mut().running = true;
        self
    }

    /// Makes every operation whose event starts with `prefix` fail.
    pub fn fail_on(&self, prefix: &str) {
        self.state.borrow_mut().fail_on = Some(prefix.to_string());
    }

    pub fn events(&self) -> Vec<String> {
        self.state.borrow().events.clone()
    }

    pub fn snapshot_tags(&self) -> Vec<(String, Vec<String>)> {
        self.state.borrow().snapshots.clone()
    }

    fn record(&self, event: String) -> Result<()> {
        let mut state = self.state.borrow_mut();
        if let Some(prefix) = &state.fail_on
            && event.starts_with(prefix.as_str())
        {
            return Err(FarmError::CommandFailed {
                command: event,
                code: 1,
                output: "injected failure".to_string(),
            }
            .into());
        }
        state.events.push(event);
        Ok(())
    }

    fn snapshot(&self, invocation: &SnapshotToolInvocation<'_>) -> Result<String> {
        let staging = invocation
            .staging_dir
            .ok_or_else(|| anyhow!("backup requires a staging dir"))?;
        let tags = invocation
            .args
            .windows(2)
            .filter(|pair| pair[0] == "--tag")
            .map(|pair| pair[1].clone())
            .collect::<Vec<_>>();
        let id = format!("snap{:04}", self.state.borrow().snapshots.len() + 1);
        let target = self.repository.join(&id);
        fs::create_dir_all(&target)?;
        copy_dir_contents(staging, &target)?;
        self.state.borrow_mut().snapshots.push((id.clone(), tags));
        Ok(format!(
            "{{\"message_type\":\"status\"}}\n{{\"message_type\":\"summary\",\"snapshot_id\":\"{id}\"}}\n"
        ))
    }

    fn list_json(&self) -> String {
        let items = self
            .state
            .borrow()
            .snapshots
            .iter()
            .map(|(id, tags)| {
                serde_json::json!({
                    "id": id,
                    "short_id": id,
                    "time": "2026-10-16T12:00:00Z",
                    "hostname": "testhost",
                    "tags": tags,
                    "paths": ["/currentsnapshot"],
                })
            })
            .collect::<Vec<_>>();
        serde_json::Value::Array(items).to_string()
    }
}

impl Orchestrator for FakeOrchestrator {
    fn check_dependencies(&self) -> Result<()> {
        Ok(())
    }

    fn start(&self, _installation: &Installation) -> Result<()> {
        self.record("start".to_string())?;
        self.state.borrow_mut().running = true;
        Ok(())
    }

    fn stop(&self, _installation: &Installation) -> Result<()> {
        self.record("stop".to_string())?;
        self.state.borrow_mut().running = false;
        Ok(())
    }

    fn update_config(&self, installation: &Installation) -> Result<ConfigUpdateReport> {
        self.record("update_config".to_string())?;
        let inputs = RoutingInputs::load(installation)?;
        let artifact = write_artifact(
            &installation.config_dir().join("Caddyfile"),
            &render_caddyfile(&inputs),
        )?;
        Ok(ConfigUpdateReport {
            domains: inputs.domains,
            artifacts: vec![artifact],
        })
    }

    fn exec(&self, _installation: &Installation, service: &str, command: &str) -> Result<String> {
        self.record(format!("exec {service}: {command}"))?;
        Ok(String::new())
    }

    fn exec_streaming(
        &self,
        _installation: &Installation,
        service: &str,
        command: &str,
    ) -> Result<()> {
        self.record(format!("exec_streaming {service}: {command}"))
    }

    fn copy_to(
        &self,
        _installation: &Installation,
        service: &str,
        host_path: &Path,
        remote_path: &str,
    ) -> Result<()> {
        self.record(format!(
            "copy_to {service}: {} -> {remote_path}",
            host_path.display()
        ))
    }

    fn copy_from(
        &self,
        _installation: &Installation,
        service: &str,
        remote_path: &str,
        host_path: &Path,
    ) -> Result<()> {
        self.record(format!("copy_from {service}: {remote_path}"))?;
        // Like `docker compose cp`, the host directory must already exist.
        fs::write(host_path, format!("-- dump of {remote_path}\n"))
            .with_context(|| format!("lstat {}: no such file or directory", host_path.display()))?;
        Ok(())
    }

    fn check_running_status(&self, _installation: &Installation) -> Result<()> {
        if self.state.borrow().running {
            Ok(())
        } else {
            Err(FarmError::NotFound("no running container for service 'web'".to_string()).into())
        }
    }

    fn destroy(&self, _installation: &Installation) -> Result<DestroyReport> {
        self.record("destroy".to_string())?;
        self.state.borrow_mut().running = false;
        Ok(DestroyReport {
            removed: vec!["everything".to_string()],
            failures: Vec::new(),
        })
    }

    fn recreate_managed_cluster(&self, installation: &Installation) -> Result<bool> {
        if installation.managed_cluster.is_none() {
            return Ok(false);
        }
        self.record("recreate_cluster".to_string())?;
        Ok(true)
    }

    fn run_backup(
        &self,
        _installation: &Installation,
        invocation: &SnapshotToolInvocation<'_>,
    ) -> Result<String> {
        let command = invocation.args.first().cloned().unwrap_or_default();
        self.record(format!("restic {}", invocation.args.join(" ")))?;
        match command.as_str() {
            "backup" => self.snapshot(invocation),
            "snapshots" => Ok(self.list_json()),
            "forget" => {
                let id = invocation.args.get(1).cloned().unwrap_or_default();
                let mut state = self.state.borrow_mut();
                let before = state.snapshots.len();
                state.snapshots.retain(|(existing, _)| *existing != id);
                if state.snapshots.len() == before {
                    bail!("no snapshot {id}");
                }
                Ok(String::new())
            }
            _ => Ok(String::new()),
        }
    }

    fn restore_from_backup_volume(
        &self,
        _installation: &Installation,
        invocation: &SnapshotToolInvocation<'_>,
    ) -> Result<String> {
        self.record(format!("restic {}", invocation.args.join(" ")))?;
        let id = invocation
            .args
            .get(1)
            .ok_or_else(|| anyhow!("restore requires a snapshot id"))?;
        let source = self.repository.join(id);
        if !source.exists() {
            return Err(FarmError::NotFound(format!("snapshot {id}")).into());
        }
        let staging = invocation
            .staging_dir
            .ok_or_else(|| anyhow!("restore requires a staging dir"))?;
        clear_dir_contents(staging)?;
        copy_dir_contents(&source, staging)?;
        Ok(String::new())
    }
}

