//! Built-in tasks available to the `procpool` binary and its workers.

use crate::pool::{Invocation, RemoteFailure, TaskRegistry};
use serde_json::{Value, json};
use std::time::Duration;

/// Registry with every built-in task.
pub fn registry() -> TaskRegistry {
    TaskRegistry::new()
        .register("double", double)
        .register("add", add)
        .register("add_pair", add)
        .register("sleep_ms", sleep_ms)
        .register("pid", pid)
        .register("fail", fail)
        .register("panic", panic)
        .register("exit", exit)
        .register("print", print)
        .register_raw("double_all", double_all)
        .register_raw("echo", echo)
}

async fn double((x,): (i64,)) -> Result<i64, RemoteFailure> {
    x.checked_mul(2)
        .ok_or_else(|| RemoteFailure::new("OverflowError", format!("{} * 2 overflows", x)))
}

async fn add((a, b): (i64, i64)) -> Result<i64, RemoteFailure> {
    a.checked_add(b)
        .ok_or_else(|| RemoteFailure::new("OverflowError", format!("{} + {} overflows", a, b)))
}

/// Sleep, then return the requested duration.
async fn sleep_ms((ms,): (u64,)) -> Result<u64, RemoteFailure> {
    tokio::time::sleep(Duration::from_millis(ms)).await;
    Ok(ms)
}

async fn pid(_: ()) -> Result<u32, RemoteFailure> {
    Ok(std::process::id())
}

async fn fail((message,): (String,)) -> Result<(), RemoteFailure> {
    Err(RemoteFailure::new("TaskError", message))
}

async fn panic((message,): (String,)) -> Result<(), RemoteFailure> {
    panic!("{}", message)
}

/// Print the message to stdout and return it.
async fn print((message,): (String,)) -> Result<String, RemoteFailure> {
    println!("{}", message);
    Ok(message)
}

/// Exit the worker process without answering. Used to exercise crash handling.
async fn exit((code,): (i32,)) -> Result<(), RemoteFailure> {
    std::process::exit(code)
}

async fn double_all(invocation: Invocation) -> Result<Value, RemoteFailure> {
    let doubled = invocation
        .args
        .iter()
        .map(|arg| {
            arg.as_i64()
                .and_then(|x| x.checked_mul(2))
                .map(Value::from)
                .ok_or_else(|| {
                    RemoteFailure::new("InvalidArguments", format!("not a doubleable integer: {}", arg))
                })
        })
        .collect::<Result<Vec<_>, _>>()?;
    Ok(Value::Array(doubled))
}

/// Return the arguments unchanged.
async fn echo(invocation: Invocation) -> Result<Value, RemoteFailure> {
    Ok(json!({
        "args": invocation.args,
        "kwargs": invocation.kwargs,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pool::UnitOfWork;
    use serde_json::Map;

    async fn run(task: &str, args: Value) -> Result<Value, RemoteFailure> {
        let Value::Array(args) = args else {
            panic!("args must be an array");
        };
        let unit = UnitOfWork {
            task_id: 1,
            task: task.to_string(),
            args,
            kwargs: Map::new(),
        };
        registry().invoke(unit).await
    }

    #[test]
    fn test_registry_names() {
        let registry = registry();
        for name in [
            "double", "add", "add_pair", "double_all", "echo", "fail", "pid", "print",
        ] {
            assert!(registry.contains(name), "missing {}", name);
        }
    }

    #[tokio::test]
    async fn test_arithmetic() {
        assert_eq!(run("double", json!([21])).await.unwrap(), json!(42));
        assert_eq!(run("add_pair", json!([1, 2])).await.unwrap(), json!(3));
        assert_eq!(run("double_all", json!([1, 2, 3])).await.unwrap(), json!([2, 4, 6]));
    }

    #[tokio::test]
    async fn test_overflow_is_a_failure() {
        let failure = run("double", json!([i64::MAX])).await.unwrap_err();
        assert_eq!(failure.kind, "OverflowError");
    }

    #[tokio::test]
    async fn test_double_all_rejects_strings() {
        let failure = run("double_all", json!([1, "two"])).await.unwrap_err();
        assert_eq!(failure.kind, "InvalidArguments");
    }

    #[tokio::test]
    async fn test_fail() {
        let failure = run("fail", json!(["boom"])).await.unwrap_err();
        assert_eq!(failure.kind, "TaskError");
        assert_eq!(failure.message, "boom");
    }

    #[tokio::test]
    async fn test_pid_and_echo() {
        assert_eq!(
            run("pid", json!([])).await.unwrap(),
            json!(std::process::id())
        );
        assert_eq!(
            run("echo", json!([1, "a"])).await.unwrap(),
            json!({"args": [1, "a"], "kwargs": {}})
        );
    }

    #[tokio::test]
    async fn test_sleep_ms_returns_duration() {
        assert_eq!(run("sleep_ms", json!([5])).await.unwrap(), json!(5));
    }
}
