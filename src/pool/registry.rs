//! Named task functions runnable inside a worker process.
//!
//! Code cannot be shipped across a process boundary, so a unit of work
//! refers to its callable by name. Parent and workers run the same binary
//! and build the same registry, which is what makes the name meaningful on
//! both sides.

use super::protocol::{RemoteFailure, UnitOfWork};
use futures::FutureExt;
use futures::future::BoxFuture;
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

/// Future produced by one task invocation.
pub type TaskFuture = BoxFuture<'static, Result<Value, RemoteFailure>>;

type TaskFn = Arc<dyn Fn(Invocation) -> TaskFuture + Send + Sync>;

/// Arguments handed to a raw task.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Invocation {
    pub args: Vec<Value>,
    pub kwargs: Map<String, Value>,
}

/// Registry of task functions addressable by name.
#[derive(Clone, Default)]
pub struct TaskRegistry {
    tasks: HashMap<String, TaskFn>,
}

impl TaskRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a task that receives the raw positional and keyword arguments.
    pub fn register_raw<F, Fut>(mut self, name: impl Into<String>, task: F) -> Self
    where
        F: Fn(Invocation) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Value, RemoteFailure>> + Send + 'static,
    {
        let task: TaskFn = Arc::new(move |invocation| task(invocation).boxed());
        self.tasks.insert(name.into(), task);
        self
    }

    /// Register a typed task.
    ///
    /// The positional arguments are decoded as `A` (use a tuple such as
    /// `(i64,)` or `(i64, i64)`, or `()` for none) and the returned value is
    /// serialized back. Typed tasks reject keyword arguments.
    pub fn register<A, R, E, F, Fut>(self, name: impl Into<String>, task: F) -> Self
    where
        A: DeserializeOwned + Send + 'static,
        R: Serialize + Send + 'static,
        E: Into<RemoteFailure> + Send + 'static,
        F: Fn(A) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<R, E>> + Send + 'static,
    {
        let task = Arc::new(task);
        self.register_raw(name, move |invocation: Invocation| {
            let task = Arc::clone(&task);
            async move {
                if !invocation.kwargs.is_empty() {
                    return Err(RemoteFailure::new(
                        "InvalidArguments",
                        "task does not accept keyword arguments",
                    ));
                }
                let args: A = decode_args(invocation.args)?;
                let value = (*task)(args).await.map_err(Into::<RemoteFailure>::into)?;
                serde_json::to_value(value).map_err(RemoteFailure::from)
            }
        })
    }

    /// Whether a task with this name is registered.
    pub fn contains(&self, name: &str) -> bool {
        self.tasks.contains_key(name)
    }

    /// Registered task names, sorted.
    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.tasks.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    /// Start the task named by `unit`. Unknown names resolve to a failure.
    pub fn invoke(&self, unit: UnitOfWork) -> TaskFuture {
        match self.tasks.get(&unit.task) {
            Some(task) => task(Invocation {
                args: unit.args,
                kwargs: unit.kwargs,
            }),
            None => {
                let failure =
                    RemoteFailure::new("UnknownTask", format!("no task named '{}'", unit.task));
                async move { Err(failure) }.boxed()
            }
        }
    }
}

impl std::fmt::Debug for TaskRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskRegistry")
            .field("tasks", &self.names())
            .finish()
    }
}

fn decode_args<A: DeserializeOwned>(args: Vec<Value>) -> Result<A, RemoteFailure> {
    let empty = args.is_empty();
    match serde_json::from_value(Value::Array(args)) {
        Ok(decoded) => Ok(decoded),
        // `()` decodes from null rather than from an empty sequence.
        Err(e) if empty => serde_json::from_value(Value::Null).map_err(|_| invalid_args(e)),
        Err(e) => Err(invalid_args(e)),
    }
}

fn invalid_args(err: serde_json::Error) -> RemoteFailure {
    RemoteFailure::new("InvalidArguments", err.to_string())
}
