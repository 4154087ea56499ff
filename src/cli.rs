//! Command-line interface definitions using clap.

use clap::{CommandFactory, Parser, Subcommand};
use clap_complete::Shell;
use procpool::logging::LogConfig;
use procpool::pool::{Call, CloseMode, PoolConfig, WorkerCommand};
use serde_json::{Map, Value};

/// Run built-in tasks on a pool of worker processes.
#[derive(Parser, Debug)]
#[command(name = "procpool")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Enable verbose output (-v for info, -vv for debug, -vvv for trace).
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Suppress all log output except errors.
    #[arg(short, long, conflicts_with = "verbose", global = true)]
    pub quiet: bool,

    /// Disable colored output.
    #[arg(long, env = "NO_COLOR", global = true)]
    pub no_color: bool,

    /// Number of worker processes [env: PROCPOOL_PROCESSES]
    #[arg(short = 'p', long, global = true)]
    pub processes: Option<usize>,

    /// Units a worker runs before it is replaced [env: PROCPOOL_MAX_TASKS]
    #[arg(long, global = true, value_parser = clap::value_parser!(u64).range(1..))]
    pub max_tasks: Option<u64>,

    /// Bound of the inbound queue, 0 for unbounded [env: PROCPOOL_QUEUE_CAPACITY]
    #[arg(long, global = true)]
    pub queue_capacity: Option<usize>,

    /// What closing the pool does with unfinished work [env: PROCPOOL_CLOSE_MODE]
    #[arg(long, value_enum, global = true)]
    pub close_mode: Option<CloseMode>,

    /// Pretty-print JSON results.
    #[arg(long, global = true)]
    pub pretty: bool,

    #[command(subcommand)]
    pub command: Commands,
}

impl Cli {
    /// Log filter implied by `-v`/`-q`, if any.
    fn log_filter(&self) -> Option<&'static str> {
        if self.quiet {
            return Some("error");
        }
        match self.verbose {
            0 => None,
            1 => Some("info"),
            2 => Some("debug"),
            _ => Some("trace"),
        }
    }

    /// Logging configuration: CLI flags first, then `PROCPOOL_LOG*` variables.
    pub fn log_config(&self) -> LogConfig {
        let config = LogConfig::for_cli();
        let config = match self.log_filter() {
            Some(filter) => config.with_filter(filter.to_string()),
            None => config,
        };
        config.with_env_overrides()
    }

    /// Pool configuration: `PROCPOOL_*` variables, overridden by CLI flags.
    ///
    /// `default_processes` applies when neither sets a process count.
    pub fn pool_config(&self, default_processes: Option<usize>) -> anyhow::Result<PoolConfig> {
        let mut worker = WorkerCommand::current_exe()?;
        // Workers don't see our flags, so hand them the same verbosity.
        if let Some(filter) = self.log_filter() {
            worker = worker.env("PROCPOOL_LOG", filter);
        }

        let mut config = PoolConfig::new(worker);
        if let Some(processes) = default_processes {
            config = config.with_processes(processes);
        }
        let mut config = config.with_env_overrides();

        if let Some(processes) = self.processes {
            config = config.with_processes(processes);
        }
        if let Some(max_tasks) = self.max_tasks {
            config = config.with_max_tasks(Some(max_tasks));
        }
        if let Some(capacity) = self.queue_capacity {
            config = config.with_queue_capacity(capacity);
        }
        if let Some(mode) = self.close_mode {
            config = config.with_close_mode(mode);
        }
        config.validate()?;
        Ok(config)
    }

    /// Render a result for stdout.
    pub fn render(&self, value: &Value) -> anyhow::Result<String> {
        let text = if self.pretty {
            serde_json::to_string_pretty(value)?
        } else {
            serde_json::to_string(value)?
        };
        Ok(text)
    }
}

/// Available subcommands.
#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Run one task and print its result.
    Apply(ApplyArgs),

    /// Run a task once per item and print the results in order.
    Map(MapArgs),

    /// Run a task once per argument list and print the results in order.
    Starmap(StarmapArgs),

    /// List the built-in tasks.
    Tasks,

    /// Generate shell completions.
    Completions(CompletionsArgs),
}

/// Arguments for the apply command.
#[derive(Parser, Debug)]
pub struct ApplyArgs {
    /// Task name.
    pub task: String,

    /// Positional arguments. Each is parsed as JSON, falling back to a string.
    #[arg(value_parser = parse_json_value, allow_negative_numbers = true)]
    pub args: Vec<Value>,

    /// Keyword argument as KEY=VALUE (VALUE parsed like positional arguments).
    #[arg(short = 'k', long = "kwarg", value_parser = parse_kwarg)]
    pub kwargs: Vec<(String, Value)>,
}

impl ApplyArgs {
    pub fn call(&self) -> Call {
        let mut call = Call::new(self.task.clone());
        call.args = self.args.clone();
        call.kwargs = self.kwargs.iter().cloned().collect::<Map<String, Value>>();
        call
    }
}

/// Arguments for the map command.
#[derive(Parser, Debug)]
pub struct MapArgs {
    /// Task name.
    pub task: String,

    /// Items, one unit of work each. Each is parsed as JSON, falling back to a string.
    #[arg(value_parser = parse_json_value, allow_negative_numbers = true)]
    pub items: Vec<Value>,
}

/// Arguments for the starmap command.
#[derive(Parser, Debug)]
pub struct StarmapArgs {
    /// Task name.
    pub task: String,

    /// Argument lists as JSON arrays, e.g. '[1, 2]'.
    #[arg(value_parser = parse_json_array, allow_negative_numbers = true)]
    pub tuples: Vec<Value>,
}

/// Arguments for shell completions.
#[derive(Parser, Debug)]
pub struct CompletionsArgs {
    /// Shell to generate completions for.
    #[arg(value_enum)]
    pub shell: Shell,
}

impl CompletionsArgs {
    /// Generate and print completions to stdout.
    pub fn generate(&self) {
        clap_complete::generate(
            self.shell,
            &mut Cli::command(),
            "procpool",
            &mut std::io::stdout(),
        );
    }
}

fn parse_json_value(s: &str) -> Result<Value, String> {
    Ok(serde_json::from_str(s).unwrap_or_else(|_| Value::String(s.to_string())))
}

fn parse_json_array(s: &str) -> Result<Value, String> {
    match serde_json::from_str(s) {
        Ok(value @ Value::Array(_)) => Ok(value),
        Ok(other) => Err(format!("expected a JSON array, got {}", other)),
        Err(e) => Err(format!("invalid JSON: {}", e)),
    }
}

fn parse_kwarg(s: &str) -> Result<(String, Value), String> {
    let (key, value) = s
        .split_once('=')
        .ok_or_else(|| format!("expected KEY=VALUE, got '{}'", s))?;
    if key.is_empty() {
        return Err("keyword argument name is empty".to_string());
    }
    Ok((key.to_string(), parse_json_value(value)?))
}
