//! Asynchronous pool of worker processes.
//!
//! Work is described by a [`Call`]: the name of a task in a [`TaskRegistry`]
//! plus JSON arguments. Worker processes are fresh executions of a binary
//! that builds the same registry and calls [`run_if_worker`] first thing in
//! `main`, so a task name means the same function on both sides.
//!
//! # Architecture
//!
//! ```text
//!                       ┌──────────────────────┐
//!                       │    Parent Process    │
//!                       │ Pool + gather loop   │
//!                       └──────────┬───────────┘
//!                                  │ inbound queue
//!                 ┌────────────────┼────────────────┐
//!                 │                │                │
//!           ┌─────▼─────┐    ┌─────▼─────┐    ┌─────▼─────┐
//!           │ Slot 0    │    │ Slot 1    │    │ Slot N    │
//!           │ supervisor│    │ supervisor│    │ supervisor│
//!           └─────┬─────┘    └─────┬─────┘    └─────┬─────┘
//!                 │ stdin/stdout (JSON lines)       │
//!           ┌─────▼─────┐    ┌─────▼─────┐    ┌─────▼─────┐
//!           │ Worker    │    │ Worker    │    │ Worker    │
//!           │ (process) │    │ (process) │    │ (process) │
//!           └───────────┘    └───────────┘    └───────────┘
//! ```
//!
//! # Features
//!
//! - **Process isolation**: each worker has its own memory space and runtime
//! - **Task budgets**: workers retire after N units and are replaced
//! - **Crash recovery**: dead workers are respawned and their unit fails
//! - **Single processes**: [`Process`] runs one task outside any pool
//!
//! # Example
//!
//! ```no_run
//! use procpool::pool::{Pool, PoolConfig, TaskRegistry, RemoteFailure, run_if_worker};
//!
//! fn registry() -> TaskRegistry {
//!     TaskRegistry::new().register("double", |(x,): (i64,)| async move {
//!         Ok::<_, RemoteFailure>(x * 2)
//!     })
//! }
//!
//! fn main() -> anyhow::Result<()> {
//!     run_if_worker(&registry());
//!
//!     let runtime = tokio::runtime::Runtime::new()?;
//!     runtime.block_on(async {
//!         let pool = Pool::new(PoolConfig::default().with_processes(2)).await?;
//!         let doubled = pool.map("double", 0..10).await?;
//!         pool.close().await?;
//!         println!("{:?}", doubled);
//!         Ok::<_, anyhow::Error>(())
//!     })
//! }
//! ```

mod ipc;
mod proc;
mod process;
pub mod protocol;
mod registry;
mod scheduler;
pub mod signals;
mod spawn;
pub mod worker_main;

pub use process::Process;
pub use protocol::{Call, Outcome, RemoteFailure, ResultEnvelope, TaskId, UnitOfWork};
pub use registry::{Invocation, TaskFuture, TaskRegistry};
pub use scheduler::{
    CloseMode, Pool, PoolConfig, PoolState, PoolStats, TaskHandle, WorkerInfo, WorkerState,
};
pub use signals::TerminationReason;
pub use spawn::{MAX_TASKS_FLAG, WORKER_FLAG, WorkerCommand};
pub use worker_main::{run_if_worker, run_worker_main};
