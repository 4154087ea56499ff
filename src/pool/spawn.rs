//! Worker subprocess spawning.
//!
//! Workers are fresh executions of a program (by default the current
//! executable) started with [`WORKER_FLAG`]. Re-executing instead of forking
//! keeps the parent's tokio runtime out of the child.

use super::proc::Proc;
use crate::error::{PoolError, Result};
use std::ffi::OsString;
use std::path::PathBuf;
use std::process::Stdio;
use tokio::process::Command;

/// Flag that switches a binary into worker mode.
pub const WORKER_FLAG: &str = "--internal-worker";

/// Flag carrying the worker's task budget.
pub const MAX_TASKS_FLAG: &str = "--max-tasks";

/// How to launch a worker process.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerCommand {
    /// Program to execute. It must call [`run_if_worker`](super::run_if_worker)
    /// with a registry containing the tasks the pool will be asked to run.
    pub program: PathBuf,
    /// Extra arguments placed before the worker flags.
    pub args: Vec<OsString>,
    /// Extra environment variables for the worker.
    pub env: Vec<(OsString, OsString)>,
}

impl WorkerCommand {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            env: Vec::new(),
        }
    }

    /// A command that re-executes the running binary.
    pub fn current_exe() -> Result<Self> {
        let exe = std::env::current_exe()
            .map_err(|e| PoolError::Spawn(format!("failed to get current executable: {}", e)))?;
        Ok(Self::new(exe))
    }

    pub fn arg(mut self, arg: impl Into<OsString>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn env(mut self, key: impl Into<OsString>, value: impl Into<OsString>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }

    /// Build the `Command` for a worker with the given task budget.
    fn build(&self, max_tasks: Option<u64>) -> Command {
        let mut cmd = Command::new(&self.program);
        cmd.args(&self.args);
        cmd.arg(WORKER_FLAG);
        if let Some(max) = max_tasks {
            cmd.arg(MAX_TASKS_FLAG);
            cmd.arg(max.to_string());
        }
        cmd.envs(self.env.iter().map(|(k, v)| (k, v)));

        // stdout carries the protocol; worker logs go to the parent's stderr.
        cmd.stdin(Stdio::piped());
        cmd.stdout(Stdio::piped());
        cmd.stderr(Stdio::inherit());
        cmd.kill_on_drop(true);
        cmd
    }
}

impl Default for WorkerCommand {
    fn default() -> Self {
        Self::current_exe().unwrap_or_else(|_| Self::new(env!("CARGO_PKG_NAME")))
    }
}

/// Spawn a worker subprocess.
///
/// Must be called from within a tokio runtime.
pub fn spawn_worker(command: &WorkerCommand, max_tasks: Option<u64>) -> Result<Proc> {
    let child = command.build(max_tasks).spawn().map_err(|e| {
        PoolError::Spawn(format!(
            "failed to spawn {}: {}",
            command.program.display(),
            e
        ))
    })?;

    let proc = Proc::from_child(child)?;
    tracing::trace!(pid = proc.pid(), program = %command.program.display(), "Spawned worker");
    Ok(proc)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args_of(cmd: &Command) -> Vec<String> {
        cmd.as_std()
            .get_args()
            .map(|a| a.to_string_lossy().into_owned())
            .collect()
    }

    #[test]
    fn test_worker_flags_appended() {
        let command = WorkerCommand::new("/bin/worker").arg("--profile").arg("fast");
        let cmd = command.build(Some(3));
        assert_eq!(
            args_of(&cmd),
            vec!["--profile", "fast", WORKER_FLAG, MAX_TASKS_FLAG, "3"]
        );
    }

    #[test]
    fn test_unbounded_budget_omits_max_tasks() {
        let cmd = WorkerCommand::new("/bin/worker").build(None);
        assert_eq!(args_of(&cmd), vec![WORKER_FLAG]);
    }

    #[test]
    fn test_env_is_forwarded() {
        let cmd = WorkerCommand::new("/bin/worker")
            .env("PROCPOOL_LOG_LEVEL", "debug")
            .build(None);
        let envs: Vec<_> = cmd.as_std().get_envs().collect();
        assert!(envs.iter().any(|(k, v)| {
            *k == "PROCPOOL_LOG_LEVEL" && v.map(|v| v == "debug").unwrap_or(false)
        }));
    }

    #[tokio::test]
    async fn test_spawn_missing_program_fails() {
        let command = WorkerCommand::new("/nonexistent/procpool-worker");
        let err = spawn_worker(&command, None).unwrap_err();
        assert!(matches!(err, PoolError::Spawn(_)));
    }
}
