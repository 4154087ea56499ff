//! IPC protocol between the pool and its worker processes.
//!
//! Messages are JSON-serialized and newline-delimited. The parent only ever
//! sends `work` after the worker announced `ready`, which is what keeps
//! dispatch at-most-once per worker.

use crate::error::{PoolError, Result};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;

/// Identifier of one submitted unit of work, unique for the lifetime of a pool.
pub type TaskId = u64;

/// A task invocation as the caller describes it: registered task name plus arguments.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Call {
    /// Name of a task registered in the worker's [`TaskRegistry`](super::TaskRegistry).
    pub task: String,
    /// Positional arguments.
    #[serde(default)]
    pub args: Vec<Value>,
    /// Keyword arguments.
    #[serde(default)]
    pub kwargs: Map<String, Value>,
}

impl Call {
    /// A call with no arguments.
    pub fn new(task: impl Into<String>) -> Self {
        Self {
            task: task.into(),
            args: Vec::new(),
            kwargs: Map::new(),
        }
    }

    /// A call whose positional arguments are `args`, which must serialize to a
    /// sequence (a tuple, array or `Vec`). `()` means no arguments.
    pub fn with_args(task: impl Into<String>, args: impl Serialize) -> Result<Self> {
        Ok(Self {
            args: to_positional(args)?,
            ..Self::new(task)
        })
    }

    /// Append one positional argument.
    pub fn arg(mut self, value: impl Serialize) -> Result<Self> {
        self.args.push(serde_json::to_value(value)?);
        Ok(self)
    }

    /// Set one keyword argument.
    pub fn kwarg(mut self, key: impl Into<String>, value: impl Serialize) -> Result<Self> {
        self.kwargs.insert(key.into(), serde_json::to_value(value)?);
        Ok(self)
    }
}

/// Convert a serializable argument pack into a positional argument list.
pub fn to_positional(args: impl Serialize) -> Result<Vec<Value>> {
    match serde_json::to_value(args)? {
        Value::Array(values) => Ok(values),
        Value::Null => Ok(Vec::new()),
        other => Err(PoolError::InvalidArguments(format!(
            "positional arguments must serialize to a sequence, got {}",
            other
        ))),
    }
}

/// One dispatched invocation, shipped to exactly one worker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UnitOfWork {
    pub task_id: TaskId,
    pub task: String,
    #[serde(default)]
    pub args: Vec<Value>,
    #[serde(default)]
    pub kwargs: Map<String, Value>,
}

impl UnitOfWork {
    pub fn new(task_id: TaskId, call: Call) -> Self {
        Self {
            task_id,
            task: call.task,
            args: call.args,
            kwargs: call.kwargs,
        }
    }
}

/// Description of a failure raised by a task inside a worker.
///
/// The original error type cannot cross the process boundary, so only its
/// kind, message and optional trace text travel back.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteFailure {
    /// Error kind, usually the short type name of the original error.
    pub kind: String,
    /// Human-readable message.
    pub message: String,
    /// Optional trace text (source chain or panic location).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub trace: Option<String>,
}

impl RemoteFailure {
    pub fn new(kind: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            message: message.into(),
            trace: None,
        }
    }

    /// Attach trace text.
    pub fn with_trace(mut self, trace: impl Into<String>) -> Self {
        self.trace = Some(trace.into());
        self
    }

    /// Build a failure from any error, recording its source chain as the trace.
    pub fn from_error<E: std::error::Error>(err: &E) -> Self {
        let kind = short_type_name::<E>();
        let mut failure = Self::new(kind, err.to_string());

        let mut chain = Vec::new();
        let mut source = err.source();
        while let Some(cause) = source {
            chain.push(format!("caused by: {}", cause));
            source = cause.source();
        }
        if !chain.is_empty() {
            failure.trace = Some(chain.join("\n"));
        }
        failure
    }
}

fn short_type_name<T>() -> &'static str {
    let full = std::any::type_name::<T>();
    // Strip the module path but keep generic arguments intact.
    let head = full.split('<').next().unwrap_or(full);
    match head.rfind("::") {
        Some(idx) => &full[idx + 2..],
        None => full,
    }
}

impl fmt::Display for RemoteFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.kind, self.message)
    }
}

impl From<anyhow::Error> for RemoteFailure {
    fn from(err: anyhow::Error) -> Self {
        let mut failure = Self::new("Error", err.to_string());
        let chain: Vec<String> = err
            .chain()
            .skip(1)
            .map(|cause| format!("caused by: {}", cause))
            .collect();
        if !chain.is_empty() {
            failure.trace = Some(chain.join("\n"));
        }
        failure
    }
}

impl From<serde_json::Error> for RemoteFailure {
    fn from(err: serde_json::Error) -> Self {
        Self::from_error(&err)
    }
}

impl From<std::io::Error> for RemoteFailure {
    fn from(err: std::io::Error) -> Self {
        Self::from_error(&err)
    }
}

impl From<String> for RemoteFailure {
    fn from(message: String) -> Self {
        Self::new("Error", message)
    }
}

impl From<&str> for RemoteFailure {
    fn from(message: &str) -> Self {
        Self::new("Error", message)
    }
}

/// Tagged outcome of one unit of work.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Outcome {
    Value(Value),
    Failure(RemoteFailure),
}

impl Outcome {
    /// Convert into a plain result, failures becoming [`PoolError::Remote`].
    pub fn into_result(self) -> Result<Value> {
        match self {
            Self::Value(value) => Ok(value),
            Self::Failure(failure) => Err(PoolError::Remote(failure)),
        }
    }

    pub fn is_failure(&self) -> bool {
        matches!(self, Self::Failure(_))
    }
}

/// The reply for one unit of work.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResultEnvelope {
    pub task_id: TaskId,
    pub outcome: Outcome,
}

impl ResultEnvelope {
    pub fn value(task_id: TaskId, value: Value) -> Self {
        Self {
            task_id,
            outcome: Outcome::Value(value),
        }
    }

    pub fn failure(task_id: TaskId, failure: RemoteFailure) -> Self {
        Self {
            task_id,
            outcome: Outcome::Failure(failure),
        }
    }
}

/// Message from parent to worker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ParentMessage {
    /// Execute one unit of work.
    #[serde(rename = "work")]
    Work(UnitOfWork),

    /// Graceful shutdown request.
    #[serde(rename = "exit")]
    Exit,
}

/// Message from worker to parent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum WorkerMessage {
    /// Worker is idle and wants one unit of work.
    #[serde(rename = "ready")]
    Ready,

    /// Outcome of the unit the worker was given.
    #[serde(rename = "result")]
    Result(ResultEnvelope),

    /// Task budget exhausted; the worker exits right after this message.
    #[serde(rename = "retiring")]
    Retiring {
        /// Units completed over the worker's lifetime.
        tasks_completed: u64,
    },
}

/// Line-level encoding shared by both message directions.
pub trait Message: Serialize + for<'de> Deserialize<'de> + Sized {
    /// Serialize to a JSON line (with newline).
    fn to_line(&self) -> String {
        let mut json = serde_json::to_string(self).expect("protocol message serialization failed");
        json.push('\n');
        json
    }

    /// Deserialize from a JSON line.
    fn from_line(line: &str) -> std::result::Result<Self, serde_json::Error> {
        serde_json::from_str(line.trim())
    }
}

impl Message for ParentMessage {}
impl Message for WorkerMessage {}
