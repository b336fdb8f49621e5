use std::{
    path::{Path, PathBuf},
    process::Output,
};

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use keyward_core::run_state::RunState;
use tokio::process::Command;
use tracing::{debug, instrument};

use crate::{RunStateSource, ScriptRunner, SourceRefresher};

/// Queries run state by executing a command and parsing its stdout.
pub struct CommandRunStateSource {
    program: String,
    args: Vec<String>,
}

impl CommandRunStateSource {
    pub fn new(program: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            program: program.into(),
            args,
        }
    }

    /// Build from a single whitespace-separated command line.
    pub fn from_command_line(line: &str) -> Result<Self> {
        let mut parts = line.split_whitespace().map(str::to_string);
        let program = parts.next().context("state command is empty")?;
        Ok(Self::new(program, parts.collect()))
    }
}

#[async_trait]
impl RunStateSource for CommandRunStateSource {
    #[instrument(skip_all, fields(program = %self.program))]
    async fn current_state(&self) -> Result<RunState> {
        let mut cmd = Command::new(&self.program);
        cmd.args(&self.args);
        let output = run_checked(cmd, "run state query").await?;
        let stdout = String::from_utf8_lossy(&output.stdout);
        let state: RunState = stdout.parse().unwrap_or_else(|never| match never {});
        debug!(%state, "run state read");
        Ok(state)
    }
}

/// Pulls the latest commits into a local git clone.
pub struct GitRefresher {
    repository: PathBuf,
}

impl GitRefresher {
    pub fn new(repository: impl Into<PathBuf>) -> Self {
        Self {
            repository: repository.into(),
        }
    }
}

#[async_trait]
impl SourceRefresher for GitRefresher {
    #[instrument(skip_all, fields(repository = %self.repository.display()))]
    async fn refresh(&self) -> Result<()> {
        let mut cmd = Command::new("git");
        cmd.arg("-C").arg(&self.repository).arg("pull");
        run_checked(cmd, "git pull").await?;
        Ok(())
    }
}

/// Runs the configuration script, directly or through an interpreter.
pub struct CommandScriptRunner {
    interpreter: Option<String>,
    args: Vec<String>,
}

impl CommandScriptRunner {
    /// Execute the script file itself.
    pub fn direct() -> Self {
        Self {
            interpreter: None,
            args: Vec::new(),
        }
    }

    /// Execute `<interpreter> <args...> <script>`.
    pub fn with_interpreter(interpreter: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            interpreter: Some(interpreter.into()),
            args,
        }
    }
}

#[async_trait]
impl ScriptRunner for CommandScriptRunner {
    #[instrument(skip_all, fields(script = %script.display()))]
    async fn run(&self, script: &Path) -> Result<()> {
        let cmd = match &self.interpreter {
            Some(interpreter) => {
                let mut cmd = Command::new(interpreter);
                cmd.args(&self.args).arg(script);
                cmd
            }
            None => Command::new(script),
        };
        run_checked(cmd, "configuration script").await?;
        Ok(())
    }
}

async fn run_checked(mut cmd: Command, what: &str) -> Result<Output> {
    let output = cmd
        .output()
        .await
        .with_context(|| format!("failed to launch {what}"))?;
    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        bail!("{what} exited with {}: {}", output.status, stderr.trim());
    }
    Ok(output)
}
