//! CLI argument parsing using `clap`.

use std::path::PathBuf;

use clap::{Parser, Subcommand, ValueEnum};
use loom_core::queue::RetryCascade;

/// Command-line arguments for `loom`.
#[derive(Debug, Clone, Parser)]
#[command(
    name = "loom",
    version,
    about = "Run and inspect a persisted graph of dependent tasks.",
    long_about = None
)]
pub struct CliArgs {
    /// Path to the engine config file (TOML).
    ///
    /// Default: `loom.toml` in the current directory if it exists, else built-in defaults.
    #[arg(long, global = true, env = "LOOM_CONFIG", value_name = "PATH")]
    pub config: Option<PathBuf>,

    /// Logging level (error, warn, info, debug, trace).
    ///
    /// If omitted, `LOOM_LOG` or a default level will be used.
    #[arg(long, global = true, value_enum, value_name = "LEVEL")]
    pub log_level: Option<LogLevel>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Clone, Subcommand)]
pub enum Command {
    /// Start workers, the reaper and the stats loop.
    Run {
        /// Run on the current task until nothing is claimable, then exit.
        #[arg(long)]
        once: bool,

        /// Override the configured worker count.
        #[arg(long, value_name = "N")]
        workers: Option<usize>,
    },

    /// Submit a task. Prints its id.
    Submit {
        /// Function name, e.g. `demo.extract`.
        function: String,

        /// Positional arguments: JSON values, or `blob:<hex digest>`.
        args: Vec<String>,

        /// Prerequisite as `<task id>` or `<task id>=<edge name>`. Repeatable.
        #[arg(long = "after", value_name = "TASK[=NAME]")]
        after: Vec<String>,
    },

    /// Re-arm failed tasks.
    Retry {
        /// Task ids to retry. Repeatable.
        #[arg(long = "id", value_name = "TASK", conflicts_with_all = ["function", "all"])]
        ids: Vec<String>,

        /// Retry every failed task of this function.
        #[arg(long, value_name = "NAME", conflicts_with = "all")]
        function: Option<String>,

        /// Retry every failed task.
        #[arg(long)]
        all: bool,

        /// Override the configured cascade policy.
        #[arg(long, value_enum)]
        cascade: Option<CascadeArg>,
    },

    /// Print the progress/ETA snapshot.
    Stats {
        /// Compute now instead of reading the last stored snapshot.
        #[arg(long)]
        fresh: bool,

        /// Print JSON.
        #[arg(long)]
        json: bool,
    },

    /// Print a task record and its edges.
    Show { task: String },

    /// Store a file in the content store. Prints its digest.
    PutBlob { path: PathBuf },

    /// Write a blob to stdout.
    CatBlob { blob: String },
}

/// Log level as exposed on the CLI.
#[derive(Debug, Copy, Clone, ValueEnum)]
pub enum LogLevel {
    Error,
    Warn,
    Info,
    Debug,
    Trace,
}

#[derive(Debug, Copy, Clone, ValueEnum)]
pub enum CascadeArg {
    None,
    Propagated,
}

impl From<CascadeArg> for RetryCascade {
    fn from(arg: CascadeArg) -> Self {
        match arg {
            CascadeArg::None => RetryCascade::None,
            CascadeArg::Propagated => RetryCascade::Propagated,
        }
    }
}

/// Convenience wrapper around `CliArgs::parse()`.
pub fn parse() -> CliArgs {
    CliArgs::parse()
}
