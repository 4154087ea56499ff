//! Single-shot worker processes.
//!
//! A [`Process`] runs one registered task as the entry point of a fresh
//! worker process, outside of any pool. The capturing variant keeps the
//! entry point's outcome after `join`.

use super::proc::Proc;
use super::protocol::{Call, Outcome, ParentMessage, UnitOfWork, WorkerMessage};
use super::signals::{TerminationReason, analyze_exit_status};
use super::spawn::{WorkerCommand, spawn_worker};
use crate::error::{PoolError, Result};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tracing::{debug, warn};

static NEXT_PROCESS: AtomicUsize = AtomicUsize::new(1);

/// Task id used for the single unit a `Process` runs.
const ENTRY_TASK_ID: u64 = 1;

/// A supervised worker process running a single task.
pub struct Process {
    name: String,
    command: WorkerCommand,
    call: Call,
    capture: bool,
    proc: Option<Proc>,
    joined: bool,
    result: Option<Outcome>,
}

impl Process {
    /// A process that discards its entry point's return value.
    pub fn new(command: WorkerCommand, call: Call) -> Self {
        let id = NEXT_PROCESS.fetch_add(1, Ordering::Relaxed);
        Self {
            name: format!("process-{}", id),
            command,
            call,
            capture: false,
            proc: None,
            joined: false,
            result: None,
        }
    }

    /// A process whose entry point outcome is available from [`result`](Self::result) after join.
    pub fn capturing(command: WorkerCommand, call: Call) -> Self {
        Self {
            capture: true,
            ..Self::new(command, call)
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Process id, once started.
    pub fn pid(&self) -> Option<u32> {
        self.proc.as_ref().map(Proc::pid)
    }

    /// Spawn the process and hand it its entry point.
    pub async fn start(&mut self) -> Result<()> {
        if self.proc.is_some() {
            return Err(PoolError::AlreadyStarted);
        }

        let mut proc = spawn_worker(&self.command, Some(1))?;
        let unit = UnitOfWork::new(ENTRY_TASK_ID, self.call.clone());
        proc.send(&ParentMessage::Work(unit)).await?;
        debug!(name = %self.name, pid = proc.pid(), task = %self.call.task, "Started process");

        self.proc = Some(proc);
        Ok(())
    }

    /// Whether the process is currently running. Never blocks.
    pub fn is_alive(&mut self) -> bool {
        self.proc.as_mut().is_some_and(Proc::is_running)
    }

    /// Wait for the process to exit, at most `timeout` if given.
    ///
    /// The child's output is drained while waiting so it cannot stall on a
    /// full pipe. On timeout the process keeps running and `join` may be
    /// called again.
    pub async fn join(&mut self, timeout: Option<Duration>) -> Result<()> {
        if self.joined {
            return Ok(());
        }
        let Self {
            proc,
            result,
            capture,
            name,
            ..
        } = self;
        let proc = proc.as_mut().ok_or(PoolError::NotStarted)?;

        let drain = async {
            while let Some(message) = proc.recv().await? {
                if let WorkerMessage::Result(envelope) = message
                    && *capture
                {
                    *result = Some(envelope.outcome);
                }
            }
            proc.wait().await
        };

        let status = match timeout {
            Some(limit) => tokio::time::timeout(limit, drain)
                .await
                .map_err(|_| PoolError::Timeout(limit))??,
            None => drain.await?,
        };

        self.joined = true;
        if !status.success() {
            warn!(
                name = %name,
                pid = proc.pid(),
                reason = %analyze_exit_status(status),
                "Process exited abnormally"
            );
        }
        Ok(())
    }

    /// Request termination with SIGTERM. Best effort.
    pub fn terminate(&self) -> Result<()> {
        match &self.proc {
            Some(proc) => proc.terminate(),
            None => Err(PoolError::NotStarted),
        }
    }

    /// Kill the process with SIGKILL and reap it.
    pub async fn kill(&mut self) -> Result<()> {
        let proc = self.proc.as_mut().ok_or(PoolError::NotStarted)?;
        proc.kill().await?;
        Ok(())
    }

    /// The entry point's outcome for a capturing process that has been joined.
    pub fn result(&self) -> Option<&Outcome> {
        self.result.as_ref()
    }

    /// Why the process exited, once it has been reaped.
    pub fn exit_reason(&self) -> Option<TerminationReason> {
        self.proc.as_ref().and_then(Proc::exit_reason)
    }
}

impl std::fmt::Debug for Process {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Process")
            .field("name", &self.name)
            .field("task", &self.call.task)
            .field("pid", &self.pid())
            .field("capture", &self.capture)
            .finish()
    }
}
