//! `parallel-exec`: a parallel command dispatcher.
//!
//! Reads shell command lines from stdin, one per line, and distributes them across a fixed-size
//! pool of worker processes that run them concurrently, streaming captured output back to stdout
//! with line-level interleaving safety.

/// Module owning the unified readiness-poll dispatch loop.
mod dispatcher;
/// Module for cohort spawning, startup synchronization, and reaping.
mod pool;
/// Module for shell resolution.
mod process;
/// Module for command-line argument parsing.
mod settings;
/// Module for Unix signal handling.
mod signals;
/// Module for the default worker executor.
mod worker;

use anyhow::{Context, Result};
use libc::STDIN_FILENO;
use nix::unistd::isatty;
use pool::Pool;
use signals::SignalWatcher;
use std::io;
use std::os::fd::BorrowedFd;

/// Main entry point for `parallel-exec`.
///
/// # Exit Codes
///
/// - `1` for argument/setup errors and for refusal to read from a terminal.
/// - Otherwise, the bitwise OR of the raw wait-status values of every child (dispatcher plus
///   workers), truncated to the low 8 bits, as any Unix process exit status is. Zero means every
///   child exited with status zero.
fn main() {
    match run() {
        Ok(status) => std::process::exit(status & 0xff),
        Err(e) => {
            eprintln!("{e:#}");
            std::process::exit(1);
        }
    }
}

fn run() -> Result<i32> {
    let config = settings::get_pool_config()?;

    // SAFETY: borrowed only for the duration of this call; stdin remains owned by the process.
    let stdin_fd = unsafe { BorrowedFd::borrow_raw(STDIN_FILENO) };
    match isatty(stdin_fd) {
        Ok(true) => {
            eprintln!("refusing to read commands from a terminal");
            std::process::exit(1);
        }
        Ok(false) => (),
        Err(e) => eprintln!("warning: could not determine whether stdin is a terminal: {e}"),
    }

    let mut pool = Pool::spawn(&config)?;
    let mut signal_watcher =
        SignalWatcher::install().context("Error installing signal handlers")?;
    pool.release().context("Error releasing worker pool")?;

    let dispatcher_status = dispatcher::run(&mut pool, &mut signal_watcher, io::stdin())
        .context("Error running dispatch loop")?;
    pool.close_remaining_sockets();
    let reaped_status = pool.reap_remaining();

    Ok(dispatcher_status | reaped_status)
}
