use std::fmt::Write as _;
use std::io::Write as _;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};

use anyhow::{Context, Result};
use tracing::debug;

use crate::error::FarmError;

/// A fully described external command: program, arguments, working directory,
/// extra environment and optional stdin payload.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandSpec {
    pub program: String,
    pub args: Vec<String>,
    pub current_dir: Option<PathBuf>,
    pub env: Vec<(String, String)>,
    pub stdin: Option<String>,
}

impl CommandSpec {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            ..Self::default()
        }
    }

    pub fn arg(mut self, value: impl Into<String>) -> Self {
        self.args.push(value.into());
        self
    }

    pub fn args<I, S>(mut self, values: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(values.into_iter().map(Into::into));
        self
    }

    pub fn current_dir(mut self, path: &Path) -> Self {
        self.current_dir = Some(path.to_path_buf());
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }

    pub fn stdin(mut self, payload: impl Into<String>) -> Self {
        self.stdin = Some(payload.into());
        self
    }

    /// Shell-like rendering used in logs and error messages. Environment values
    /// are never rendered.
    pub fn display(&self) -> String {
        let mut out = self.program.clone();
        for arg in &self.args {
            out.push(' ');
            if arg.is_empty() || arg.chars().any(|ch| ch.is_whitespace() || ch == '"') {
                let _ = write!(out, "{arg:?}");
            } else {
                out.push_str(arg);
            }
        }
        out
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandOutput {
    pub code: i32,
    pub stdout: String,
    pub stderr: String,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.code == 0
    }

    pub fn combined(&self) -> String {
        match (self.stdout.trim().is_empty(), self.stderr.trim().is_empty()) {
            (false, false) => format!("{}\n{}", self.stdout.trim_end(), self.stderr.trim_end()),
            (false, true) => self.stdout.trim_end().to_string(),
            (true, false) => self.stderr.trim_end().to_string(),
            (true, true) => String::new(),
        }
    }
}

/// The only path through which backend CLIs are invoked.
pub trait CommandRunner {
    /// Runs the command and captures its output. A non-zero exit is not an
    /// error at this level; callers decide via [`run_checked`].
    fn run(&self, spec: &CommandSpec) -> Result<CommandOutput>;

    /// Runs the command with inherited stdout/stderr and returns the exit code.
    fn run_streaming(&self, spec: &CommandSpec) -> Result<i32>;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SystemRunner;

impl CommandRunner for SystemRunner {
    fn run(&self, spec: &CommandSpec) -> Result<CommandOutput> {
        debug!(command = %spec.display(), "running");
        let mut command = build_command(spec);
        command.stdout(Stdio::piped()).stderr(Stdio::piped());
        command.stdin(if spec.stdin.is_some() {
            Stdio::piped()
        } else {
            Stdio::null()
        });

        let mut child = command
            .spawn()
            .with_context(|| format!("failed to execute {}", spec.program))?;
        if let Some(payload) = &spec.stdin
            && let Some(mut stdin) = child.stdin.take()
        {
            stdin
                .write_all(payload.as_bytes())
                .with_context(|| format!("failed to write stdin for {}", spec.program))?;
        }
        let output = child
            .wait_with_output()
            .with_context(|| format!("failed to wait for {}", spec.program))?;

        Ok(CommandOutput {
            code: output.status.code().unwrap_or(1),
            stdout: String::from_utf8_lossy(&output.stdout).to_string(),
            stderr: String::from_utf8_lossy(&output.stderr).to_string(),
        })
    }

    fn run_streaming(&self, spec: &CommandSpec) -> Result<i32> {
        debug!(command = %spec.display(), "running (streaming)");
        let mut command = build_command(spec);
        command.stdin(Stdio::inherit());
        let status = command
            .status()
            .with_context(|| format!("failed to execute {}", spec.program))?;
        Ok(status.code().unwrap_or(1))
    }
}

fn build_command(spec: &CommandSpec) -> Command {
    let mut command = Command::new(&spec.program);
    command.args(&spec.args);
    if let Some(dir) = &spec.current_dir {
        command.current_dir(dir);
    }
    for (key, value) in &spec.env {
        command.env(key, value);
    }
    command
}

/// Runs a command and turns a non-zero exit into `FarmError::CommandFailed`
/// carrying the captured output verbatim.
pub fn run_checked(runner: &dyn CommandRunner, spec: &CommandSpec) -> Result<CommandOutput> {
    let output = runner.run(spec)?;
    if !output.success() {
        return Err(FarmError::CommandFailed {
            command: spec.display(),
            code: output.code,
            output: output.combined(),
        }
        .into());
    }
    Ok(output)
}

pub fn run_streaming_checked(runner: &dyn CommandRunner, spec: &CommandSpec) -> Result<()> {
    let code = runner.run_streaming(spec)?;
    if code != 0 {
        return Err(FarmError::CommandFailed {
            command: spec.display(),
            code,
            output: "<output was streamed to the terminal>".to_string(),
        }
        .into());
    }
    Ok(())
}

/// Probes a binary by running it with `args`; missing binaries and failing
/// probes both map to `DependencyMissing`.
pub fn require_binary(runner: &dyn CommandRunner, program: &str, args: &[&str]) -> Result<()> {
    let spec = CommandSpec::new(program).args(args.iter().copied());
    match runner.run(&spec) {
        Ok(output) if output.success() => Ok(()),
        Ok(output) => Err(FarmError::DependencyMissing(format!(
            "`{}` is not usable (exit {}): {}",
            spec.display(),
            output.code,
            output.combined()
        ))
        .into()),
        Err(error) => Err(FarmError::DependencyMissing(format!(
            "`{program}` is not installed or not on PATH: {error:#}"
        ))
        .into()),
    }
}

/// Quotes `value` for a POSIX `sh -c` command line.
pub fn shell_quote(value: &str) -> String {
    if !value.is_empty()
        && value
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || "-_./:=@%+".contains(c))
    {
        return value.to_string();
    }
    format!("'{}'", value.replace('\'', "'\\''"))
}
