//! procpool - run tasks on a pool of worker processes

mod cli;

use anyhow::{Context, Result};
use clap::Parser;
use owo_colors::{OwoColorize, Stream::Stderr, Stream::Stdout};
use procpool::builtins;
use procpool::logging;
use procpool::PoolError;
use procpool::pool::{Pool, run_if_worker};
use serde_json::Value;

use cli::{ApplyArgs, Cli, Commands, MapArgs, StarmapArgs};

fn main() {
    // Worker processes are re-executions of this binary.
    run_if_worker(&builtins::registry());

    let cli = Cli::parse();
    if cli.no_color {
        owo_colors::set_override(false);
    }
    logging::init(&cli.log_config());

    let result = match &cli.command {
        Commands::Apply(args) => block_on(cmd_apply(&cli, args)),
        Commands::Map(args) => block_on(cmd_map(&cli, args)),
        Commands::Starmap(args) => block_on(cmd_starmap(&cli, args)),
        Commands::Tasks => cmd_tasks(),
        Commands::Completions(args) => {
            args.generate();
            Ok(())
        }
    };

    if let Err(e) = result {
        eprintln!(
            "{}: {}",
            "error"
                .if_supports_color(Stderr, |text| text.red())
                .if_supports_color(Stderr, |text| text.bold()),
            e
        );
        // Print the error chain if there are causes
        for cause in e.chain().skip(1) {
            eprintln!(
                "  {}: {}",
                "caused by".if_supports_color(Stderr, |text| text.yellow()),
                cause
            );
        }
        // A task failure carries the worker-side trace.
        if let Some(trace) = e
            .downcast_ref::<PoolError>()
            .and_then(PoolError::remote)
            .and_then(|failure| failure.trace.as_deref())
        {
            for line in trace.lines() {
                eprintln!(
                    "  {}: {}",
                    "remote".if_supports_color(Stderr, |text| text.dimmed()),
                    line
                );
            }
        }
        std::process::exit(1);
    }
}

fn block_on<F: std::future::Future<Output = Result<()>>>(future: F) -> Result<()> {
    let runtime = tokio::runtime::Runtime::new().context("Failed to create Tokio runtime")?;
    runtime.block_on(future)
}

async fn cmd_apply(cli: &Cli, args: &ApplyArgs) -> Result<()> {
    // One unit needs one worker unless asked otherwise.
    let config = cli.pool_config(Some(1))?;
    let call = args.call();
    let value = Pool::scoped(config, |pool| async move {
        let value = pool.submit(call).await?.await?;
        Ok::<_, anyhow::Error>(value)
    })
    .await
    .with_context(|| format!("Task '{}' failed", args.task))?;

    println!("{}", cli.render(&value)?);
    Ok(())
}

async fn cmd_map(cli: &Cli, args: &MapArgs) -> Result<()> {
    let config = cli.pool_config(None)?;
    let task = args.task.clone();
    let items = args.items.clone();
    let results = Pool::scoped(config, |pool| async move {
        let results = pool.map(&task, items).await?;
        Ok::<_, anyhow::Error>(results)
    })
    .await
    .with_context(|| format!("Mapping '{}' failed", args.task))?;

    println!("{}", cli.render(&Value::Array(results))?);
    Ok(())
}

async fn cmd_starmap(cli: &Cli, args: &StarmapArgs) -> Result<()> {
    let config = cli.pool_config(None)?;
    let task = args.task.clone();
    let tuples = args.tuples.clone();
    let results = Pool::scoped(config, |pool| async move {
        let results = pool.starmap(&task, tuples).await?;
        Ok::<_, anyhow::Error>(results)
    })
    .await
    .with_context(|| format!("Mapping '{}' failed", args.task))?;

    println!("{}", cli.render(&Value::Array(results))?);
    Ok(())
}

fn cmd_tasks() -> Result<()> {
    let registry = builtins::registry();
    for name in registry.names() {
        println!("{}", name.if_supports_color(Stdout, |text| text.green()));
    }
    Ok(())
}
