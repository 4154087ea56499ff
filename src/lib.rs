//! procpool - an asynchronous pool of worker processes.
//!
//! See [`pool`] for the pool itself. [`builtins`] holds the tasks shipped
//! with the `procpool` binary.

pub mod builtins;
pub mod error;
pub mod logging;
pub mod pool;

pub use error::{PoolError, Result};
pub use pool::{Call, CloseMode, Pool, PoolConfig, Process, RemoteFailure, TaskRegistry, WorkerCommand};
