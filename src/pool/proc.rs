//! Process handle for worker subprocesses.
//!
//! Wraps a child process with its protocol channels.

use super::ipc::{DEFAULT_BUFFER_SIZE, LineReader, LineWriter};
use super::protocol::{ParentMessage, WorkerMessage};
use super::signals::{TerminationReason, analyze_exit_status};
use crate::error::{PoolError, Result};
use nix::sys::signal::{self, Signal};
use nix::unistd::Pid;
use std::process::ExitStatus;
use std::time::Duration;
use tokio::io::BufReader;
use tokio::process::{Child, ChildStdin, ChildStdout};

/// Handle to a worker subprocess with IPC channels.
#[derive(Debug)]
pub struct Proc {
    child: Child,
    /// Process ID, kept after the child is reaped.
    pid: u32,
    /// Writer for sending messages to the worker's stdin (None once closed)
    writer: Option<LineWriter<ChildStdin>>,
    /// Reader for messages from the worker's stdout
    reader: LineReader<BufReader<ChildStdout>>,
    /// Exit status once the process has been reaped
    status: Option<ExitStatus>,
}

impl Proc {
    /// Create from a spawned child. Takes ownership of its stdin and stdout.
    pub fn from_child(mut child: Child) -> Result<Self> {
        let pid = child
            .id()
            .ok_or_else(|| PoolError::Spawn("child exited before it could be tracked".into()))?;
        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| PoolError::Spawn("child stdin not captured".into()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| PoolError::Spawn("child stdout not captured".into()))?;

        Ok(Self {
            child,
            pid,
            writer: Some(LineWriter::new(stdin)),
            reader: LineReader::new(BufReader::with_capacity(DEFAULT_BUFFER_SIZE, stdout)),
            status: None,
        })
    }

    pub fn pid(&self) -> u32 {
        self.pid
    }

    /// Send a message to the worker.
    pub async fn send(&mut self, message: &ParentMessage) -> Result<()> {
        match self.writer.as_mut() {
            Some(writer) => writer.send(message).await,
            None => Err(PoolError::Io(std::io::Error::new(
                std::io::ErrorKind::BrokenPipe,
                "worker stdin already closed",
            ))),
        }
    }

    /// Close the worker's stdin so it observes EOF.
    pub fn close_stdin(&mut self) {
        self.writer = None;
    }

    /// Receive a message from the worker.
    ///
    /// Returns `None` once the worker closed its stdout. Cancel-safe.
    pub async fn recv(&mut self) -> Result<Option<WorkerMessage>> {
        self.reader.recv().await
    }

    /// Check if the process is still running (non-blocking).
    pub fn is_running(&mut self) -> bool {
        matches!(self.try_wait(), Ok(None))
    }

    /// Try to reap the process without blocking.
    ///
    /// Returns `None` if the process is still running.
    pub fn try_wait(&mut self) -> Result<Option<ExitStatus>> {
        if self.status.is_some() {
            return Ok(self.status);
        }
        let status = self.child.try_wait()?;
        self.status = status;
        Ok(status)
    }

    /// Wait for the process to exit.
    pub async fn wait(&mut self) -> Result<ExitStatus> {
        if let Some(status) = self.status {
            return Ok(status);
        }
        let status = self.child.wait().await?;
        self.status = Some(status);
        Ok(status)
    }

    /// Why the process exited, once it has been reaped.
    pub fn exit_reason(&self) -> Option<TerminationReason> {
        self.status.map(analyze_exit_status)
    }

    /// Send SIGTERM to the process.
    pub fn terminate(&self) -> Result<()> {
        self.signal(Signal::SIGTERM)
    }

    /// Send SIGKILL to the process and wait for it to exit.
    pub async fn kill(&mut self) -> Result<ExitStatus> {
        if let Some(status) = self.status {
            return Ok(status);
        }
        self.signal(Signal::SIGKILL)?;
        self.wait().await
    }

    fn signal(&self, signal: Signal) -> Result<()> {
        if self.status.is_some() {
            return Ok(());
        }
        let pid = i32::try_from(self.pid)
            .map_err(|_| PoolError::Protocol(format!("pid {} out of range", self.pid)))?;
        match signal::kill(Pid::from_raw(pid), signal) {
            Ok(()) => Ok(()),
            // Already gone but not yet reaped.
            Err(nix::errno::Errno::ESRCH) => Ok(()),
            Err(e) => Err(PoolError::Io(std::io::Error::from_raw_os_error(e as i32))),
        }
    }

    /// Gracefully stop the worker: send exit command, wait up to `timeout`,
    /// then SIGTERM, then SIGKILL.
    pub async fn stop(&mut self, timeout: Duration) -> Result<ExitStatus> {
        if let Some(status) = self.status {
            return Ok(status);
        }

        // The worker may already be gone, in which case the write fails.
        let _ = self.send(&ParentMessage::Exit).await;
        self.close_stdin();

        if let Ok(status) = tokio::time::timeout(timeout, self.wait()).await {
            return status;
        }

        let _ = self.terminate();
        if let Ok(status) = tokio::time::timeout(Duration::from_millis(100), self.wait()).await {
            return status;
        }

        self.kill().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::process::Stdio;
    use tokio::process::Command;

    fn spawn(program: &str, args: &[&str]) -> Proc {
        let child = Command::new(program)
            .args(args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .expect("Failed to spawn");
        Proc::from_child(child).expect("Failed to create Proc")
    }

    #[tokio::test]
    async fn test_proc_stop_closes_stdin() {
        // `cat` exits once its stdin is closed.
        let mut proc = spawn("cat", &[]);
        assert!(proc.is_running());

        let status = proc.stop(Duration::from_secs(1)).await.expect("Failed to stop");
        assert!(status.success());
        assert!(!proc.is_running());
    }

    #[tokio::test]
    async fn test_proc_terminate() {
        let mut proc = spawn("sleep", &["60"]);
        assert!(proc.is_running());

        proc.terminate().expect("Failed to terminate");
        proc.wait().await.unwrap();
        assert!(!proc.is_running());
        assert_eq!(
            proc.exit_reason(),
            Some(TerminationReason::Signaled(Signal::SIGTERM))
        );
    }

    #[tokio::test]
    async fn test_proc_kill() {
        let mut proc = spawn("sleep", &["60"]);
        proc.kill().await.unwrap();
        assert_eq!(proc.exit_reason(), Some(TerminationReason::Killed));
        // Signalling a reaped process is a no-op.
        assert!(proc.terminate().is_ok());
    }

    #[tokio::test]
    async fn test_proc_recv_eof() {
        let mut proc = spawn("true", &[]);
        assert!(proc.recv().await.unwrap().is_none());
        assert!(proc.wait().await.unwrap().success());
    }
}
