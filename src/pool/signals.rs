//! Exit analysis for worker subprocesses.
//!
//! Turns a raw exit status into a reason suitable for logs and
//! [`PoolError::WorkerCrashed`](crate::PoolError::WorkerCrashed).

use nix::sys::signal::Signal;
use std::os::unix::process::ExitStatusExt;
use std::process::ExitStatus;

/// Reason why a worker process terminated.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TerminationReason {
    /// Normal exit with status code.
    Exited(i32),
    /// Killed by signal.
    Signaled(Signal),
    /// SIGKILL, most likely the OOM killer or a hard terminate.
    Killed,
    /// Stack overflow or memory fault (SIGSEGV / SIGBUS).
    Segfault,
    /// Panic or abort inside the worker runtime (SIGABRT).
    Aborted,
    /// Worker closed its pipes but the exit status could not be read.
    Unknown,
}

impl TerminationReason {
    /// Check if this is a successful exit.
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Exited(0))
    }

    /// Get a human-readable description.
    pub fn description(&self) -> String {
        match self {
            Self::Exited(code) => format!("exited with code {}", code),
            Self::Signaled(sig) => format!("killed by signal {:?}", sig),
            Self::Killed => "killed (SIGKILL)".to_string(),
            Self::Segfault => "memory fault (SIGSEGV/SIGBUS)".to_string(),
            Self::Aborted => "aborted (SIGABRT)".to_string(),
            Self::Unknown => "unknown reason".to_string(),
        }
    }
}

impl std::fmt::Display for TerminationReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.description())
    }
}

/// Analyze an `ExitStatus` to determine the termination reason.
pub fn analyze_exit_status(status: ExitStatus) -> TerminationReason {
    if let Some(code) = status.code() {
        return TerminationReason::Exited(code);
    }

    match status.signal().map(Signal::try_from) {
        Some(Ok(Signal::SIGKILL)) => TerminationReason::Killed,
        Some(Ok(Signal::SIGSEGV)) | Some(Ok(Signal::SIGBUS)) => TerminationReason::Segfault,
        Some(Ok(Signal::SIGABRT)) => TerminationReason::Aborted,
        Some(Ok(signal)) => TerminationReason::Signaled(signal),
        _ => TerminationReason::Unknown,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // Raw wait statuses: exit code lives in bits 8..16, a terminating signal in bits 0..7.
    fn exited(code: i32) -> ExitStatus {
        ExitStatus::from_raw(code << 8)
    }

    fn signaled(signal: Signal) -> ExitStatus {
        ExitStatus::from_raw(signal as i32)
    }

    #[test]
    fn test_termination_reason_success() {
        assert!(TerminationReason::Exited(0).is_success());
        assert!(!TerminationReason::Exited(1).is_success());
        assert!(!TerminationReason::Killed.is_success());
    }

    #[test]
    fn test_analyze_exit_codes() {
        assert_eq!(analyze_exit_status(exited(0)), TerminationReason::Exited(0));
        assert_eq!(analyze_exit_status(exited(3)), TerminationReason::Exited(3));
    }

    #[test]
    fn test_analyze_signals() {
        assert_eq!(
            analyze_exit_status(signaled(Signal::SIGKILL)),
            TerminationReason::Killed
        );
        assert_eq!(
            analyze_exit_status(signaled(Signal::SIGSEGV)),
            TerminationReason::Segfault
        );
        assert_eq!(
            analyze_exit_status(signaled(Signal::SIGABRT)),
            TerminationReason::Aborted
        );
        assert_eq!(
            analyze_exit_status(signaled(Signal::SIGTERM)),
            TerminationReason::Signaled(Signal::SIGTERM)
        );
    }

    #[test]
    fn test_description() {
        assert_eq!(TerminationReason::Exited(2).to_string(), "exited with code 2");
        assert!(TerminationReason::Killed.to_string().contains("SIGKILL"));
    }
}
