//! Worker subprocess main entry point.
//!
//! Runs when a binary is invoked with `--internal-worker`. The worker owns a
//! single-threaded tokio runtime and executes one unit of work at a time.

use super::ipc::{DEFAULT_BUFFER_SIZE, LineReader, LineWriter};
use super::protocol::{ParentMessage, RemoteFailure, ResultEnvelope, UnitOfWork, WorkerMessage};
use super::registry::TaskRegistry;
use super::spawn::WORKER_FLAG;
use crate::error::Result;
use crate::logging::{self, LogConfig};
use clap::Parser;
use futures::FutureExt;
use std::any::Any;
use std::ffi::OsString;
use std::panic::AssertUnwindSafe;
use std::time::Instant;
use tokio::io::{AsyncBufRead, AsyncWrite, BufReader};
use tracing::{debug, trace};

/// Command-line arguments understood in worker mode.
#[derive(Parser, Debug, Clone, PartialEq, Eq)]
#[command(name = "procpool-worker", no_binary_name = true)]
pub struct WorkerArgs {
    /// Run as a pool worker speaking the protocol on stdin/stdout.
    #[arg(long = "internal-worker")]
    pub internal_worker: bool,

    /// Exit after completing this many units of work.
    #[arg(long, value_parser = clap::value_parser!(u64).range(1..))]
    pub max_tasks: Option<u64>,
}

impl WorkerArgs {
    /// Extract worker arguments from a full argv, if it is a worker invocation.
    ///
    /// Only the arguments from [`WORKER_FLAG`] onwards are considered, so the
    /// host binary's own arguments placed before it are ignored.
    pub fn from_args<I, T>(args: I) -> Option<Self>
    where
        I: IntoIterator<Item = T>,
        T: Into<OsString>,
    {
        let args: Vec<OsString> = args.into_iter().map(Into::into).collect();
        let start = args.iter().position(|arg| arg == WORKER_FLAG)?;
        match Self::try_parse_from(&args[start..]) {
            Ok(parsed) => Some(parsed),
            Err(e) => e.exit(),
        }
    }
}

/// Enter worker mode if this process was spawned as a pool worker.
///
/// Call this first thing in `main`, before any CLI parsing. Returns normally
/// when the process is not a worker; otherwise never returns.
pub fn run_if_worker(registry: &TaskRegistry) {
    if let Some(args) = WorkerArgs::from_args(std::env::args_os()) {
        run_worker_main(registry.clone(), args.max_tasks);
    }
}

/// Run the worker subprocess main function.
///
/// Exits the process with 0 on a clean shutdown (exit request, EOF or budget
/// reached) and 1 on an IPC failure.
pub fn run_worker_main(registry: TaskRegistry, max_tasks: Option<u64>) -> ! {
    // Ignore SIGPIPE - pipe errors surface as io::Error instead.
    unsafe {
        nix::sys::signal::signal(
            nix::sys::signal::Signal::SIGPIPE,
            nix::sys::signal::SigHandler::SigIgn,
        )
        .ok();
    }

    logging::init(&LogConfig::for_worker().with_env_overrides());

    let runtime = match tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
    {
        Ok(runtime) => runtime,
        Err(e) => {
            eprintln!("Worker error: failed to build runtime: {}", e);
            std::process::exit(1);
        }
    };

    let code = match runtime.block_on(serve_stdio(&registry, max_tasks)) {
        Ok(completed) => {
            debug!(pid = std::process::id(), completed, "Worker exiting");
            0
        }
        Err(e) => {
            eprintln!("Worker error: {}", e);
            1
        }
    };
    drop(runtime);
    std::process::exit(code)
}

async fn serve_stdio(registry: &TaskRegistry, max_tasks: Option<u64>) -> Result<u64> {
    let mut reader = LineReader::new(BufReader::with_capacity(
        DEFAULT_BUFFER_SIZE,
        tokio::io::stdin(),
    ));
    let mut writer = LineWriter::new(tokio::fs::File::from_std(protocol_output()?));
    worker_loop(&mut reader, &mut writer, registry, max_tasks).await
}

/// Take the protocol channel off fd 1 and point fd 1 at stderr.
///
/// Task code that prints to stdout must not corrupt the protocol stream.
fn protocol_output() -> Result<std::fs::File> {
    use nix::fcntl::{FcntlArg, fcntl};
    use nix::libc::{STDERR_FILENO, STDOUT_FILENO};
    use std::os::fd::{FromRawFd, OwnedFd};

    let fd = fcntl(STDOUT_FILENO, FcntlArg::F_DUPFD_CLOEXEC(STDERR_FILENO + 1))
        .map_err(std::io::Error::from)?;
    // SAFETY: `fd` was just created by fcntl and nothing else owns it.
    let protocol = unsafe { OwnedFd::from_raw_fd(fd) };
    nix::unistd::dup2(STDERR_FILENO, STDOUT_FILENO).map_err(std::io::Error::from)?;
    Ok(std::fs::File::from(protocol))
}

/// Worker main loop.
///
/// Announces `ready`, then executes units until told to exit, the input
/// closes, or the task budget is spent. The budget check runs only after the
/// result for the unit just finished has been written, so a retiring worker
/// never holds a unit it did not complete. Returns the number of completed
/// units.
pub async fn worker_loop<R, W>(
    reader: &mut LineReader<R>,
    writer: &mut LineWriter<W>,
    registry: &TaskRegistry,
    max_tasks: Option<u64>,
) -> Result<u64>
where
    R: AsyncBufRead + Unpin,
    W: AsyncWrite + Unpin,
{
    writer.send(&WorkerMessage::Ready).await?;

    let mut completed = 0u64;
    loop {
        let unit = match reader.recv::<ParentMessage>().await? {
            Some(ParentMessage::Work(unit)) => unit,
            Some(ParentMessage::Exit) | None => return Ok(completed),
        };

        let envelope = execute(registry, unit).await;
        writer.send(&WorkerMessage::Result(envelope)).await?;
        completed += 1;

        if max_tasks.is_some_and(|max| completed >= max) {
            writer
                .send(&WorkerMessage::Retiring {
                    tasks_completed: completed,
                })
                .await?;
            return Ok(completed);
        }
        writer.send(&WorkerMessage::Ready).await?;
    }
}

/// Execute one unit. Task failures and panics become failure envelopes.
async fn execute(registry: &TaskRegistry, unit: UnitOfWork) -> ResultEnvelope {
    let task_id = unit.task_id;
    let task = unit.task.clone();
    let start = Instant::now();

    let outcome = AssertUnwindSafe(async { registry.invoke(unit).await })
        .catch_unwind()
        .await;

    let envelope = match outcome {
        Ok(Ok(value)) => ResultEnvelope::value(task_id, value),
        Ok(Err(failure)) => ResultEnvelope::failure(task_id, failure),
        Err(payload) => ResultEnvelope::failure(task_id, panic_failure(payload)),
    };

    trace!(
        task_id,
        task = %task,
        failed = envelope.outcome.is_failure(),
        elapsed_ms = start.elapsed().as_millis(),
        "Executed unit of work"
    );
    envelope
}

fn panic_failure(payload: Box<dyn Any + Send>) -> RemoteFailure {
    let message = if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "task panicked".to_string()
    };
    RemoteFailure::new("Panic", message)
}
