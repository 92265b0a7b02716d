mod cli;
mod functions;
mod logging;

use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result, anyhow, bail};
use loom_core::app::{EngineBuilder, StatsSnapshot, format_eta};
use loom_core::domain::{Arg, BlobId, Dependency, TaskId, TaskSpec, TaskStatus};
use loom_core::impls::{FsBlobStore, LibSqlTaskStore};
use loom_core::queue::RetrySelection;
use loom_core::{Engine, EngineConfig};

use crate::cli::{CliArgs, Command};

#[tokio::main]
async fn main() {
    if let Err(err) = run_main().await {
        eprintln!("loom error: {err:?}");
        std::process::exit(1);
    }
}

async fn run_main() -> Result<()> {
    let args = cli::parse();
    logging::init_logging(args.log_level)?;
    run(args).await
}

async fn run(args: CliArgs) -> Result<()> {
    let mut config = load_config(args.config.as_deref())?;
    if let Command::Run {
        workers: Some(n), ..
    } = &args.command
    {
        config.workers = *n;
    }
    let engine = open_engine(config).await?;

    match args.command {
        Command::Run { once, .. } => run_engine(&engine, once).await,
        Command::Submit {
            function,
            args,
            after,
        } => {
            let spec = TaskSpec::new(
                function,
                args.iter()
                    .map(|a| parse_arg(a))
                    .collect::<Result<Vec<_>>>()?,
            );
            let dependencies = after
                .iter()
                .map(|a| parse_dependency(a))
                .collect::<Result<Vec<_>>>()?;
            let id = engine.submit(spec, dependencies).await?;
            println!("{id}");
            Ok(())
        }
        Command::Retry {
            ids,
            function,
            all,
            cascade,
        } => {
            let selection = if all {
                RetrySelection::AllFailed
            } else if let Some(function) = function {
                RetrySelection::Function(function)
            } else if !ids.is_empty() {
                RetrySelection::Ids(
                    ids.iter()
                        .map(|id| parse_task_id(id))
                        .collect::<Result<Vec<_>>>()?,
                )
            } else {
                bail!("nothing selected: pass --id, --function or --all");
            };
            let cascade = cascade
                .map(Into::into)
                .unwrap_or(engine.config().retry_cascade);
            let rearmed = engine.retry_with(&selection, cascade).await?;
            println!("{} task(s) re-armed", rearmed.len());
            Ok(())
        }
        Command::Stats { fresh, json } => {
            let snapshot = if fresh {
                Some(engine.stats().await?)
            } else {
                engine.latest_stats().await?
            };
            let Some(snapshot) = snapshot else {
                println!("no stats snapshot stored yet (run `loom stats --fresh`)");
                return Ok(());
            };
            if json {
                println!("{}", serde_json::to_string_pretty(&snapshot)?);
            } else {
                print_stats(&snapshot);
            }
            Ok(())
        }
        Command::Show { task } => {
            let id = parse_task_id(&task)?;
            let record = engine
                .get(&id)
                .await?
                .ok_or_else(|| anyhow!("no task {id}"))?;
            println!("{}", serde_json::to_string_pretty(&record)?);
            for (edge, status) in engine.store().dependencies(&id).await? {
                println!("after  {} ({}) [{status}]", edge.prev, edge.name);
            }
            for edge in engine.store().dependents(&id).await? {
                println!("before {} ({})", edge.next, edge.name);
            }
            Ok(())
        }
        Command::PutBlob { path } => {
            let bytes = tokio::fs::read(&path)
                .await
                .with_context(|| format!("reading {path:?}"))?;
            println!("{}", engine.put_blob(bytes).await?);
            Ok(())
        }
        Command::CatBlob { blob } => {
            let id: BlobId = blob.parse()?;
            let bytes = engine.get_blob(&id).await?;
            std::io::stdout().write_all(&bytes)?;
            Ok(())
        }
    }
}

fn load_config(path: Option<&Path>) -> Result<EngineConfig> {
    let default_path = PathBuf::from("loom.toml");
    let path = match path {
        Some(p) => p,
        None if default_path.exists() => default_path.as_path(),
        None => return Ok(EngineConfig::default()),
    };
    let config = EngineConfig::load(path)?;
    tracing::debug!(?path, "config loaded");
    Ok(config)
}

async fn open_engine(config: EngineConfig) -> Result<Engine> {
    let store = LibSqlTaskStore::open(&config.storage.database)
        .await
        .with_context(|| format!("opening task database {:?}", config.storage.database))?;
    let blobs = FsBlobStore::open(&config.storage.blobs)
        .await
        .with_context(|| format!("opening blob directory {:?}", config.storage.blobs))?;

    let builder = EngineBuilder::new(Arc::new(store), Arc::new(blobs)).config(config);
    let engine = functions::register(builder)?
        .expect_functions(functions::ALL)
        .build()?;
    Ok(engine)
}

async fn run_engine(engine: &Engine, once: bool) -> Result<()> {
    if once {
        let ran = engine.run_until_idle().await?;
        let snapshot = engine.stats_loop().snapshot_once().await?;
        println!("ran {ran} task(s); {}", snapshot.progress_str);
        return Ok(());
    }

    let handle = engine.start();
    tokio::signal::ctrl_c()
        .await
        .context("waiting for ctrl-c")?;
    tracing::info!("shutdown requested; waiting for running tasks");
    handle.shutdown().await;
    Ok(())
}

/// `blob:<hex>` is a blob reference; anything else must be JSON.
fn parse_arg(raw: &str) -> Result<Arg> {
    if let Some(hex) = raw.strip_prefix("blob:") {
        return Ok(Arg::blob(hex.parse()?));
    }
    let value: serde_json::Value =
        serde_json::from_str(raw).with_context(|| format!("argument {raw:?} is not JSON"))?;
    Ok(Arg::value(value))
}

fn parse_dependency(raw: &str) -> Result<Dependency> {
    let (id, name) = raw.split_once('=').unwrap_or((raw, "after"));
    Ok(Dependency::new(parse_task_id(id)?, name))
}

fn parse_task_id(raw: &str) -> Result<TaskId> {
    raw.trim()
        .parse()
        .with_context(|| format!("invalid task id {raw:?}"))
}

fn print_stats(snapshot: &StatsSnapshot) {
    println!(
        "{} (taken {}, window {}s)",
        snapshot.progress_str,
        snapshot.taken_at.to_rfc3339(),
        snapshot.window_secs
    );
    println!();
    println!(
        "{:<28} {:>8} {:>8} {:>8} {:>8} {:>8} {:>6} {:>9} {:>8} {:>12}",
        "function", "pending", "deferred", "running", "success", "broken", "error", "5m", "fill", "eta"
    );
    for (function, row) in &snapshot.task_matrix {
        println!(
            "{:<28} {:>8} {:>8} {:>8} {:>8} {:>8} {:>6} {:>9} {:>8} {:>12}",
            function,
            row.count(TaskStatus::Pending),
            row.count(TaskStatus::Deferred),
            row.count(TaskStatus::Running),
            row.count(TaskStatus::Success),
            row.count(TaskStatus::Broken),
            row.count(TaskStatus::Error),
            row.recent_count,
            row.recent_fill_pct
                .map(|f| format!("{f:.2}%"))
                .unwrap_or_default(),
            row.eta_secs.map(format_eta).unwrap_or_default(),
        );
    }

    if let Some(bytes) = snapshot.db_size {
        println!();
        println!("database size: {bytes} bytes");
    }

    if !snapshot.top_error_types.is_empty() {
        println!();
        println!("top error types:");
        for e in &snapshot.top_error_types {
            println!("  {:>6}  {}  {}", e.count, e.function, e.error_type);
        }
    }
}
