//! Command-line argument parsing for `parallel-exec`.
//!
//! Unlike its lineage's multi-source (CLI/environment/config-file) settings hierarchy, this
//! program takes its entire configuration from the command line: a worker count, an optional
//! output-buffer size, and an optional replacement for the default worker executor.

use anyhow::{Context, Result};
use clap::Parser;

/// Command-line arguments parser.
#[derive(Parser, Debug)]
#[command(about, version)]
struct CliArgs {
    /// Number of worker processes to run concurrently.
    worker_count: String,

    /// Maximum size in bytes of one captured output line. 0 (or omitted, or empty) means "do not
    /// capture output"; otherwise must be at least 2.
    line_buffer_size: Option<String>,

    /// A program to use in place of the default worker executor, followed by its own arguments.
    #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
    custom_worker_command: Vec<String>,
}

/// Resolved pool configuration, produced by [`get_pool_config`].
#[derive(Debug)]
pub struct PoolConfig {
    /// Number of worker processes to spawn.
    pub worker_count: usize,
    /// Maximum captured-output-line size in bytes, or 0 for "uncaptured".
    pub line_buffer_size: usize,
    /// The line-buffer-size argument exactly as the user typed it (possibly empty), preserved for
    /// a custom worker's `PARALLEL_EXEC_BUFFER` environment variable.
    pub raw_buffer_size_arg: String,
    /// Replacement program (and its arguments) for the default worker executor, if any.
    pub custom_worker_command: Vec<String>,
}

/// Gets the resolved pool configuration using the current process's command-line arguments.
pub fn get_pool_config() -> Result<PoolConfig> {
    get_pool_config_with_raw_args(std::env::args())
}

/// Resolves a [`PoolConfig`] from raw command-line arguments.
///
/// # Errors
///
/// Returns an error if the arguments cannot be parsed, the worker count is not a non-negative
/// integer, or the line buffer size is set, non-empty, and neither `0` nor `>= 2` while no custom
/// worker command is present.
fn get_pool_config_with_raw_args(
    raw_args: impl IntoIterator<Item = String>,
) -> Result<PoolConfig> {
    let cli_args = CliArgs::try_parse_from(raw_args).context("Error parsing arguments")?;

    let worker_count = cli_args
        .worker_count
        .parse::<usize>()
        .map_err(|_| PoolConfigError::InvalidWorkerCount(cli_args.worker_count.clone()))?;

    let raw_buffer_size_arg = cli_args.line_buffer_size.clone().unwrap_or_default();

    let line_buffer_size = if cli_args.custom_worker_command.is_empty() {
        parse_line_buffer_size(&raw_buffer_size_arg)?
    } else {
        // A custom worker reads this value back out of its own environment; the master never
        // interprets it in this mode, so an unparsable or out-of-range string is passed through
        // unvalidated here, exactly as the original program did.
        raw_buffer_size_arg.parse::<usize>().unwrap_or(0)
    };

    Ok(PoolConfig {
        worker_count,
        line_buffer_size,
        raw_buffer_size_arg,
        custom_worker_command: cli_args.custom_worker_command,
    })
}

/// Parses a line-buffer-size argument: empty means "uncaptured", `0` means "uncaptured", anything
/// else must be an integer `>= 2`.
fn parse_line_buffer_size(raw: &str) -> Result<usize, PoolConfigError> {
    if raw.is_empty() {
        return Ok(0);
    }
    match raw.parse::<usize>() {
        Ok(0) => Ok(0),
        Ok(n) if n >= 2 => Ok(n),
        _ => Err(PoolConfigError::InvalidLineBufferSize(raw.to_string())),
    }
}

/// Errors that can occur while resolving a [`PoolConfig`] from already-parsed CLI arguments.
#[derive(Debug)]
enum PoolConfigError {
    /// The worker count argument was not a non-negative integer.
    InvalidWorkerCount(String),
    /// The line buffer size argument was neither empty, `0`, nor an integer `>= 2`.
    InvalidLineBufferSize(String),
}

impl std::fmt::Display for PoolConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self {
            Self::InvalidWorkerCount(v) => write!(f, "invalid worker count: {v:?}"),
            Self::InvalidLineBufferSize(v) => {
                write!(f, "invalid line buffer size: {v:?} (must be 0 or >= 2)")
            }
        }
    }
}

impl std::error::Error for PoolConfigError {}
