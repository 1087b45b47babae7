use std::fs;
use std::path::{Path, PathBuf};
use std::rc::Rc;

use anyhow::{Context, Result};
use serde::Deserialize;
use serde_json::json;
use tracing::{info, warn};

use super::{DestroyReport, Orchestrator, SNAPSHOT_MOUNT, SnapshotToolInvocation, WEB_SERVICE};
use crate::config::ToolConfig;
use crate::error::FarmError;
use crate::process::{
    CommandRunner, CommandSpec, require_binary, run_checked, run_streaming_checked,
};
use crate::registry::Installation;
use crate::routing::{
    ConfigUpdateReport, RoutingInputs, render_ingress, render_kind_config, write_artifact,
};

pub const MANIFEST_DIR: &str = "kubernetes";
pub const KUSTOMIZATION_FILE: &str = "kustomization.yaml";
pub const INGRESS_FILE: &str = "ingress.yaml";
pub const KIND_CONFIG_FILE: &str = "kind-config.yaml";
const BACKUP_POD_READY_TIMEOUT: &str = "180s";

/// Cluster backend: `kubectl` against the namespace declared by the
/// installation's kustomization, optionally inside a managed `kind` cluster.
pub struct KubernetesOrchestrator {
    kubectl: String,
    kind: String,
    restic_image: String,
    runner: Rc<dyn CommandRunner>,
}

#[derive(Debug, Deserialize)]
struct Kustomization {
    namespace: Option<String>,
}

#[derive(Debug, Deserialize)]
struct PodList {
    #[serde(default)]
    items: Vec<Pod>,
}

#[derive(Debug, Deserialize)]
struct Pod {
    metadata: PodMetadata,
    #[serde(default)]
    status: PodStatus,
}

#[derive(Debug, Deserialize)]
struct PodMetadata {
    name: String,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PodStatus {
    phase: Option<String>,
    #[serde(default)]
    container_statuses: Vec<ContainerStatus>,
}

#[derive(Debug, Deserialize)]
struct ContainerStatus {
    ready: bool,
}

impl Pod {
    fn is_ready(&self) -> bool {
        self.status.phase.as_deref() == Some("Running")
            && !self.status.container_statuses.is_empty()
            && self.status.container_statuses.iter().all(|status| status.ready)
    }
}

impl KubernetesOrchestrator {
    pub fn new(tool: &ToolConfig, runner: Rc<dyn CommandRunner>) -> Self {
        Self {
            kubectl: tool.kubectl_binary().to_string(),
            kind: tool.kind_binary().to_string(),
            restic_image: tool.restic_image().to_string(),
            runner,
        }
    }

    pub fn manifest_dir(installation: &Installation) -> PathBuf {
        installation.path.join(MANIFEST_DIR)
    }

    /// Namespace declared by `kubernetes/kustomization.yaml`.
    pub fn namespace(installation: &Installation) -> Result<String> {
        let path = Self::manifest_dir(installation).join(KUSTOMIZATION_FILE);
        if !path.exists() {
            return Err(
                FarmError::NotFound(format!("manifest {} does not exist", path.display())).into(),
            );
        }
        let content =
            fs::read_to_string(&path).with_context(|| format!("failed to read {}", path.display()))?;
        let parsed: Kustomization = serde_yaml::from_str(&content)
            .with_context(|| format!("failed to parse {}", path.display()))?;
        parsed
            .namespace
            .map(|value| value.trim().to_string())
            .filter(|value| !value.is_empty())
            .ok_or_else(|| {
                FarmError::NotFound(format!("{} declares no namespace", path.display())).into()
            })
    }

    fn kubectl<I, S>(&self, installation: &Installation, namespace: &str, args: I) -> CommandSpec
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut spec = CommandSpec::new(&self.kubectl).current_dir(&installation.path);
        if let Some(cluster) = &installation.managed_cluster {
            spec = spec.arg("--context").arg(format!("kind-{cluster}"));
        }
        spec.arg("-n").arg(namespace).args(args)
    }

    fn ready_pods(&self, installation: &Installation, namespace: &str, service: &str) -> Result<Vec<String>> {
        let output = run_checked(
            self.runner.as_ref(),
            &self.kubectl(
                installation,
                namespace,
                [
                    "get".to_string(),
                    "pods".to_string(),
                    "-l".to_string(),
                    format!("app={service}"),
                    "-o".to_string(),
                    "json".to_string(),
                ],
            ),
        )?;
        let pods: PodList =
            serde_json::from_str(&output.stdout).context("failed to decode kubectl pod list")?;
        Ok(pods
            .items
            .into_iter()
            .filter(Pod::is_ready)
            .map(|pod| pod.metadata.name)
            .collect())
    }

    fn find_pod(&self, installation: &Installation, namespace: &str, service: &str) -> Result<String> {
        self.ready_pods(installation, namespace, service)?
            .into_iter()
            .next()
            .ok_or_else(|| {
                FarmError::NotFound(format!(
                    "no ready pod for service '{service}' in namespace '{namespace}'"
                ))
                .into()
            })
    }

    fn backup_pod_name(installation: &Installation) -> String {
        let slug = installation
            .id
            .to_ascii_lowercase()
            .chars()
            .map(|ch| if ch.is_ascii_alphanumeric() { ch } else { '-' })
            .collect::<String>();
        format!("wikifarm-backup-{}", slug.trim_matches('-'))
    }

    fn backup_pod_manifest(
        &self,
        name: &str,
        namespace: &str,
        invocation: &SnapshotToolInvocation<'_>,
    ) -> Result<String> {
        let env = invocation
            .env
            .iter()
            .map(|(key, value)| json!({ "name": key, "value": value }))
            .collect::<Vec<_>>();
        let manifest = json!({
            "apiVersion": "v1",
            "kind": "Pod",
            "metadata": {
                "name": name,
                "namespace": namespace,
                "labels": { "app.kubernetes.io/managed-by": "wikifarm", "app": "backup" }
            },
            "spec": {
                "restartPolicy": "Never",
                "containers": [{
                    "name": "restic",
                    "image": self.restic_image,
                    "command": ["sh", "-c", "sleep 86400"],
                    "env": env,
                    "volumeMounts": [{ "name": "staging", "mountPath": SNAPSHOT_MOUNT }]
                }],
                "volumes": [{ "name": "staging", "emptyDir": {} }]
            }
        });
        serde_json::to_string(&manifest).context("failed to render backup pod manifest")
    }

    /// Runs `body` against a transient restic pod, deleting the pod afterwards
    /// whatever the outcome.
    fn with_backup_pod<T>(
        &self,
        installation: &Installation,
        invocation: &SnapshotToolInvocation<'_>,
        body: impl FnOnce(&str, &str) -> Result<T>,
    ) -> Result<T> {
        let namespace = Self::namespace(installation)?;
        let pod = Self::backup_pod_name(installation);
        let manifest = self.backup_pod_manifest(&pod, &namespace, invocation)?;

        run_checked(
            self.runner.as_ref(),
            &self
                .kubectl(installation, &namespace, ["apply", "-f", "-"])
                .stdin(manifest),
        )?;
        let result = run_checked(
            self.runner.as_ref(),
            &self.kubectl(
                installation,
                &namespace,
                [
                    "wait".to_string(),
                    "--for=condition=Ready".to_string(),
                    format!("pod/{pod}"),
                    format!("--timeout={BACKUP_POD_READY_TIMEOUT}"),
                ],
            ),
        )
        .and_then(|_| body(&namespace, &pod));

        let cleanup = run_checked(
            self.runner.as_ref(),
            &self.kubectl(
                installation,
                &namespace,
                ["delete", "pod", pod.as_str(), "--ignore-not-found", "--wait=false"],
            ),
        );
        if let Err(error) = cleanup {
            warn!(pod = %pod, "failed to delete transient backup pod: {error:#}");
        }
        result
    }

    fn restic_exec(
        &self,
        installation: &Installation,
        namespace: &str,
        pod: &str,
        invocation: &SnapshotToolInvocation<'_>,
    ) -> Result<String> {
        let spec = self
            .kubectl(installation, namespace, ["exec", pod, "--", "restic", "-r"])
            .arg(invocation.repository)
            .args(invocation.args.iter().cloned());
        Ok(run_checked(self.runner.as_ref(), &spec)?.stdout)
    }

    fn cluster_exists(&self, cluster: &str) -> Result<bool> {
        let output = run_checked(
            self.runner.as_ref(),
            &CommandSpec::new(&self.kind).args(["get", "clusters"]),
        )?;
        Ok(output.stdout.lines().any(|line| line.trim() == cluster))
    }

    fn create_cluster(&self, installation: &Installation, cluster: &str) -> Result<()> {
        info!(cluster = %cluster, "creating managed cluster");
        let config = Self::manifest_dir(installation).join(KIND_CONFIG_FILE);
        let mut spec = CommandSpec::new(&self.kind)
            .args(["create", "cluster", "--name", cluster])
            .current_dir(&installation.path);
        if config.exists() {
            spec = spec.arg("--config").arg(config.display().to_string());
        }
        run_checked(self.runner.as_ref(), &spec)?;
        Ok(())
    }

    fn delete_cluster(&self, cluster: &str) -> Result<()> {
        info!(cluster = %cluster, "deleting managed cluster");
        run_checked(
            self.runner.as_ref(),
            &CommandSpec::new(&self.kind).args(["delete", "cluster", "--name", cluster]),
        )?;
        Ok(())
    }
}

impl Orchestrator for KubernetesOrchestrator {
    fn check_dependencies(&self) -> Result<()> {
        require_binary(self.runner.as_ref(), &self.kubectl, &["version", "--client"])
    }

    fn start(&self, installation: &Installation) -> Result<()> {
        if let Some(cluster) = &installation.managed_cluster {
            require_binary(self.runner.as_ref(), &self.kind, &["version"])?;
            if !self.cluster_exists(cluster)? {
                self.create_cluster(installation, cluster)?;
            }
        }
        let namespace = Self::namespace(installation)?;
        info!(installation = %installation.id, namespace = %namespace, "applying manifests");
        let mut apply = CommandSpec::new(&self.kubectl).current_dir(&installation.path);
        if let Some(cluster) = &installation.managed_cluster {
            apply = apply.arg("--context").arg(format!("kind-{cluster}"));
        }
        apply = apply.args(["apply", "-k", MANIFEST_DIR]);
        run_checked(self.runner.as_ref(), &apply)?;
        Ok(())
    }

    fn stop(&self, installation: &Installation) -> Result<()> {
        let namespace = Self::namespace(installation)?;
        info!(installation = %installation.id, namespace = %namespace, "scaling deployments to zero");
        run_checked(
            self.runner.as_ref(),
            &self.kubectl(
                installation,
                &namespace,
                ["scale", "deployment", "--all", "--replicas=0"],
            ),
        )?;
        Ok(())
    }

    fn update_config(&self, installation: &Installation) -> Result<ConfigUpdateReport> {
        let namespace = Self::namespace(installation)?;
        let inputs = RoutingInputs::load(installation)?;
        let dir = Self::manifest_dir(installation);
        let mut artifacts = vec![write_artifact(
            &dir.join(INGRESS_FILE),
            &render_ingress(&namespace, &inputs)?,
        )?];
        if let Some(cluster) = &installation.managed_cluster {
            artifacts.push(write_artifact(
                &dir.join(KIND_CONFIG_FILE),
                &render_kind_config(cluster, &inputs)?,
            )?);
        }
        Ok(ConfigUpdateReport {
            domains: inputs.domains,
            artifacts,
        })
    }

    fn exec(&self, installation: &Installation, service: &str, command: &str) -> Result<String> {
        let namespace = Self::namespace(installation)?;
        let pod = self.find_pod(installation, &namespace, service)?;
        let output = run_checked(
            self.runner.as_ref(),
            &self.kubectl(
                installation,
                &namespace,
                ["exec", pod.as_str(), "--", "sh", "-c", command],
            ),
        )?;
        Ok(output.combined())
    }

    fn exec_streaming(
        &self,
        installation: &Installation,
        service: &str,
        command: &str,
    ) -> Result<()> {
        let namespace = Self::namespace(installation)?;
        let pod = self.find_pod(installation, &namespace, service)?;
        run_streaming_checked(
            self.runner.as_ref(),
            &self.kubectl(
                installation,
                &namespace,
                ["exec", "-i", pod.as_str(), "--", "sh", "-c", command],
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
        let namespace = Self::namespace(installation)?;
        let pod = self.find_pod(installation, &namespace, service)?;
        run_checked(
            self.runner.as_ref(),
            &self.kubectl(
                installation,
                &namespace,
                [
                    "cp".to_string(),
                    host_path.display().to_string(),
                    format!("{namespace}/{pod}:{remote_path}"),
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
        let namespace = Self::namespace(installation)?;
        let pod = self.find_pod(installation, &namespace, service)?;
        run_checked(
            self.runner.as_ref(),
            &self.kubectl(
                installation,
                &namespace,
                [
                    "cp".to_string(),
                    format!("{namespace}/{pod}:{remote_path}"),
                    host_path.display().to_string(),
                ],
            ),
        )?;
        Ok(())
    }

    fn check_running_status(&self, installation: &Installation) -> Result<()> {
        let namespace = Self::namespace(installation)?;
        self.find_pod(installation, &namespace, WEB_SERVICE)
            .map(|_| ())
    }

    fn destroy(&self, installation: &Installation) -> Result<DestroyReport> {
        let mut report = DestroyReport::default();
        match Self::namespace(installation) {
            Ok(namespace) => {
                let spec = self.kubectl(
                    installation,
                    "default",
                    ["delete", "namespace", namespace.as_str(), "--ignore-not-found"],
                );
                match run_checked(self.runner.as_ref(), &spec) {
                    Ok(_) => report.removed.push(format!("namespace {namespace}")),
                    Err(error) => {
                        warn!(namespace = %namespace, "namespace deletion failed: {error:#}");
                        report.failures.push(format!("{error:#}"));
                    }
                }
            }
            Err(error) => report.failures.push(format!("{error:#}")),
        }
        if let Some(cluster) = &installation.managed_cluster {
            match self.delete_cluster(cluster) {
                Ok(()) => report.removed.push(format!("cluster {cluster}")),
                Err(error) => {
                    warn!(cluster = %cluster, "cluster deletion failed: {error:#}");
                    report.failures.push(format!("{error:#}"));
                }
            }
        }
        Ok(report)
    }

    fn recreate_managed_cluster(&self, installation: &Installation) -> Result<bool> {
        let Some(cluster) = &installation.managed_cluster else {
            return Ok(false);
        };
        if self.cluster_exists(cluster)? {
            self.delete_cluster(cluster)?;
        }
        self.create_cluster(installation, cluster)?;
        Ok(true)
    }

    fn run_backup(
        &self,
        installation: &Installation,
        invocation: &SnapshotToolInvocation<'_>,
    ) -> Result<String> {
        info!(installation = %installation.id, args = ?invocation.args, "running snapshot tool in transient pod");
        self.with_backup_pod(installation, invocation, |namespace, pod| {
            if let Some(staging) = invocation.staging_dir {
                run_checked(
                    self.runner.as_ref(),
                    &self.kubectl(
                        installation,
                        namespace,
                        [
                            "cp".to_string(),
                            format!("{}/.", staging.display()),
                            format!("{namespace}/{pod}:{SNAPSHOT_MOUNT}"),
                        ],
                    ),
                )?;
            }
            self.restic_exec(installation, namespace, pod, invocation)
        })
    }

    fn restore_from_backup_volume(
        &self,
        installation: &Installation,
        invocation: &SnapshotToolInvocation<'_>,
    ) -> Result<String> {
        info!(installation = %installation.id, args = ?invocation.args, "restoring into transient pod");
        self.with_backup_pod(installation, invocation, |namespace, pod| {
            let stdout = self.restic_exec(installation, namespace, pod, invocation)?;
            if let Some(staging) = invocation.staging_dir {
                run_checked(
                    self.runner.as_ref(),
                    &self.kubectl(
                        installation,
                        namespace,
                        [
                            "cp".to_string(),
                            format!("{namespace}/{pod}:{SNAPSHOT_MOUNT}"),
                            staging.display().to_string(),
                        ],
                    ),
                )?;
            }
            Ok(stdout)
        })
    }
}
