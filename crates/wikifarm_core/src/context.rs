use std::rc::Rc;

use anyhow::{Context, Result};

use crate::config::{ToolConfig, load_config};
use crate::error::FarmError;
use crate::orchestrator::{Orchestrator, for_installation};
use crate::process::CommandRunner;
use crate::registry::{Installation, Registry};
use crate::runtime::RuntimePaths;

/// Everything one invocation needs, built once and passed explicitly to every
/// component call.
pub struct FarmContext {
    pub paths: RuntimePaths,
    pub tool: ToolConfig,
    pub installation: Installation,
    pub orchestrator: Rc<dyn Orchestrator>,
    pub runner: Rc<dyn CommandRunner>,
}

impl FarmContext {
    /// Resolves the target installation (explicit id, else the registered
    /// installation containing the working directory), selects its backend and
    /// runs the backend's dependency pre-flight.
    pub fn open(paths: RuntimePaths, id: Option<&str>, runner: Rc<dyn CommandRunner>) -> Result<Self> {
        let tool = load_config(&paths.tool_config_path)?;
        let registry = Registry::load(&paths.registry_path)?;
        let installation = match id {
            Some(id) => registry.get(id)?.clone(),
            None => registry.find_by_path(&paths.cwd).cloned().ok_or_else(|| {
                FarmError::NotFound(format!(
                    "{} is not inside a registered installation; pass --id",
                    paths.cwd.display()
                ))
            })?,
        };
        let orchestrator = for_installation(&installation, &tool, runner.clone());
        orchestrator
            .check_dependencies()
            .with_context(|| format!("{} backend is not available", installation.orchestrator))?;
        Ok(Self {
            paths,
            tool,
            installation,
            orchestrator,
            runner,
        })
    }

    pub fn orchestrator(&self) -> &dyn Orchestrator {
        self.orchestrator.as_ref()
    }

    /// Writes the (possibly mutated) installation record back to the registry.
    pub fn save_installation(&self) -> Result<()> {
        let mut registry = Registry::load(&self.paths.registry_path)?;
        registry.update(self.installation.clone())?;
        registry.save(&self.paths.registry_path)
    }
}
