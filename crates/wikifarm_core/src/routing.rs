use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::Serialize;
use serde_json::json;
use sha2::{Digest, Sha256};

use crate::env_store::EnvStore;
use crate::registry::Installation;
use crate::wikis::WikiList;

pub const DEFAULT_HTTP_PORT: u16 = 80;
pub const DEFAULT_HTTPS_PORT: u16 = 443;
pub const UPSTREAM: &str = "varnish:80";

/// One file written by `update_config`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct GeneratedArtifact {
    pub path: PathBuf,
    pub sha256: String,
    pub changed: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ConfigUpdateReport {
    pub domains: Vec<String>,
    pub artifacts: Vec<GeneratedArtifact>,
}

/// Inputs every backend's routing config is derived from.
#[derive(Debug, Clone)]
pub struct RoutingInputs {
    pub domains: Vec<String>,
    pub http_port: u16,
    pub https_port: u16,
    pub auto_https: bool,
}

impl RoutingInputs {
    pub fn load(installation: &Installation) -> Result<Self> {
        let wikis = WikiList::load(&installation.wikis_path())?;
        let env = EnvStore::load(&installation.env_path())?;
        Ok(Self {
            domains: wikis.unique_domains()?,
            http_port: port_setting(&env, "HTTP_PORT", DEFAULT_HTTP_PORT)?,
            https_port: port_setting(&env, "HTTPS_PORT", DEFAULT_HTTPS_PORT)?,
            auto_https: !env
                .get_non_empty("CADDY_AUTO_HTTPS")
                .is_some_and(|value| value.eq_ignore_ascii_case("off")),
        })
    }
}

fn port_setting(env: &EnvStore, key: &str, default: u16) -> Result<u16> {
    match env.get_non_empty(key) {
        Some(value) => value
            .parse::<u16>()
            .with_context(|| format!("{key}={value} in .env is not a valid port")),
        None => Ok(default),
    }
}

pub fn render_caddyfile(inputs: &RoutingInputs) -> String {
    let mut out = String::from("# Generated by wikifarm from config/wikis.yaml. Do not edit.\n");
    if !inputs.auto_https {
        out.push_str("{\n\tauto_https off\n}\n");
    }
    for domain in &inputs.domains {
        let address = if inputs.auto_https {
            domain.clone()
        } else {
            format!("http://{domain}")
        };
        out.push_str(&format!(
            "\n{address} {{\n\treverse_proxy {UPSTREAM}\n}}\n"
        ));
    }
    out
}

pub fn render_ingress(namespace: &str, inputs: &RoutingInputs) -> Result<String> {
    let rules = inputs
        .domains
        .iter()
        .map(|domain| {
            json!({
                "host": domain,
                "http": {
                    "paths": [{
                        "path": "/",
                        "pathType": "Prefix",
                        "backend": { "service": { "name": "web", "port": { "number": 80 } } }
                    }]
                }
            })
        })
        .collect::<Vec<_>>();
    let manifest = json!({
        "apiVersion": "networking.k8s.io/v1",
        "kind": "Ingress",
        "metadata": {
            "name": "wikifarm",
            "namespace": namespace,
            "labels": { "app.kubernetes.io/managed-by": "wikifarm" }
        },
        "spec": { "rules": rules }
    });
    let rendered = serde_yaml::to_string(&manifest).context("failed to render ingress manifest")?;
    Ok(format!(
        "# Generated by wikifarm from config/wikis.yaml. Do not edit.\n{rendered}"
    ))
}

pub fn render_kind_config(cluster: &str, inputs: &RoutingInputs) -> Result<String> {
    let manifest = json!({
        "kind": "Cluster",
        "apiVersion": "kind.x-k8s.io/v1alpha4",
        "name": cluster,
        "nodes": [{
            "role": "control-plane",
            "extraPortMappings": [
                { "containerPort": 80, "hostPort": inputs.http_port, "protocol": "TCP" },
                { "containerPort": 443, "hostPort": inputs.https_port, "protocol": "TCP" }
            ]
        }]
    });
    serde_yaml::to_string(&manifest).context("failed to render kind cluster config")
}

/// Writes `content` only when it differs from what is on disk, so repeated
/// regeneration without registry changes leaves files untouched.
pub fn write_artifact(path: &Path, content: &str) -> Result<GeneratedArtifact> {
    let sha256 = compute_hash(content);
    let changed = match fs::read_to_string(path) {
        Ok(existing) => existing != content,
        Err(_) => true,
    };
    if changed {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("failed to create {}", parent.display()))?;
        }
        fs::write(path, content).with_context(|| format!("failed to write {}", path.display()))?;
    }
    Ok(GeneratedArtifact {
        path: path.to_path_buf(),
        sha256,
        changed,
    })
}

fn compute_hash(content: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(content.as_bytes());
    format!("{:x}", hasher.finalize())
}
