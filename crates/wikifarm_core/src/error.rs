use thiserror::Error;

/// Classified failures surfaced to the operator.
///
/// Library functions return `anyhow::Result`; a `FarmError` sits at the root of
/// the chain whenever the failure belongs to one of these classes, so the CLI
/// and tests can tell a conflict from a failed container command.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum FarmError {
    #[error("{0}")]
    DependencyMissing(String),

    #[error("validation failed: {0}")]
    ValidationFailed(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("cannot remove wiki '{0}': a farm must keep at least one wiki")]
    RemoveLast(String),

    #[error("command failed (exit {code}): {command}\n{output}")]
    CommandFailed {
        command: String,
        code: i32,
        output: String,
    },

    #[error(
        "partial failure during {step}\ncompleted: {completed}\n{guidance}\nFiles and containers were left in place; nothing was rolled back."
    )]
    PartialFailure {
        step: String,
        completed: String,
        guidance: String,
    },
}

impl FarmError {
    /// Returns the first `FarmError` in the error chain, if any.
    pub fn find(error: &anyhow::Error) -> Option<&FarmError> {
        error
            .chain()
            .find_map(|cause| cause.downcast_ref::<FarmError>())
    }

    pub fn partial(step: impl Into<String>, completed: &[String], guidance: impl Into<String>) -> Self {
        Self::PartialFailure {
            step: step.into(),
            completed: if completed.is_empty() {
                "<nothing>".to_string()
            } else {
                completed.join(", ")
            },
            guidance: guidance.into(),
        }
    }

    pub fn exit_code(&self) -> i32 {
        match self {
            Self::DependencyMissing(_) => 3,
            Self::ValidationFailed(_) => 4,
            Self::NotFound(_) => 5,
            Self::Conflict(_) | Self::RemoveLast(_) => 6,
            Self::CommandFailed { .. } => 7,
            Self::PartialFailure { .. } => 8,
        }
    }
}

/// Tracks the completed steps of a multi-step mutation. Once one step has
/// succeeded, a later failure surfaces as `PartialFailure`.
#[derive(Debug, Default)]
pub struct StepTracker {
    completed: Vec<String>,
}

impl StepTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn completed(&self) -> &[String] {
        &self.completed
    }

    /// Records a step that was carried out outside the tracker.
    pub fn mark_done(&mut self, step: &str) {
        self.completed.push(step.to_string());
    }

    pub fn run<T>(
        &mut self,
        step: &str,
        guidance: &str,
        action: impl FnOnce() -> anyhow::Result<T>,
    ) -> anyhow::Result<T> {
        match action() {
            Ok(value) => {
                self.completed.push(step.to_string());
                Ok(value)
            }
            Err(error) if self.completed.is_empty() => Err(error.context(format!("{step} failed"))),
            Err(error) => Err(FarmError::partial(
                step,
                &self.completed,
                format!("cause: {error:#}\n{guidance}"),
            )
            .into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use anyhow::{Context, bail};

    use super::{FarmError, StepTracker};

    #[test]
    fn find_walks_context_chain() {
        let error = Err::<(), _>(FarmError::Conflict("wiki 'main' exists".to_string()))
            .context("failed to add wiki")
            .expect_err("must fail");
        assert_eq!(
            FarmError::find(&error),
            Some(&FarmError::Conflict("wiki 'main' exists".to_string()))
        );
    }

    #[test]
    fn partial_failure_lists_completed_steps() {
        let error = FarmError::partial(
            "apply HTTPS_PORT",
            &["HTTP_PORT".to_string()],
            "Re-run `wikifarm config set` to finish.",
        );
        let message = error.to_string();
        assert!(message.contains("completed: HTTP_PORT"));
        assert!(message.contains("nothing was rolled back"));
    }

    #[test]
    fn step_tracker_reports_partial_failure_after_first_success() {
        let mut steps = StepTracker::new();
        steps
            .run("remove settings", "re-run remove", || Ok(()))
            .expect("first step");
        let error = steps
            .run("drop database", "re-run remove", || -> anyhow::Result<()> {
                bail!("db is down")
            })
            .expect_err("second step fails");
        match FarmError::find(&error) {
            Some(FarmError::PartialFailure {
                step, completed, guidance,
            }) => {
                assert_eq!(step, "drop database");
                assert_eq!(completed, "remove settings");
                assert!(guidance.contains("db is down"));
            }
            other => panic!("unexpected error class: {other:?}"),
        }
    }

    #[test]
    fn step_tracker_keeps_first_failure_unwrapped() {
        let mut steps = StepTracker::new();
        let error = steps
            .run("validate", "", || -> anyhow::Result<()> {
                Err(FarmError::NotFound("wiki 'x'".to_string()).into())
            })
            .expect_err("fails");
        assert!(matches!(FarmError::find(&error), Some(FarmError::NotFound(_))));
        assert!(steps.completed().is_empty());
    }
}
