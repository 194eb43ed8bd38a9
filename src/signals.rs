//! Signal policy for the master process and for freshly-forked workers.
//!
//! The master re-broadcasts fatal/termination signals to the whole process group after resetting
//! its own disposition to the default action, ignores a handful of signals that would otherwise
//! kill it for reasons unrelated to the pool's own health, and leaves everything else untouched. A
//! freshly-forked worker resets every signal this module touches back to its default disposition
//! before it runs, so none of the master's policy leaks into the child.

use anyhow::{Context, Result};
use nix::sys::signal::{self, Signal};
use signal_hook_mio::v1_0::Signals;
use std::os::raw::c_int;

/// Signals that terminate the whole pool. The master's handler resets each one's disposition to
/// the default action, then re-sends it to the process group: this both tears down every worker
/// and, via the signal's default action, ultimately terminates the master itself.
const FATAL_SIGNALS: &[c_int] = &[
    signal_hook::consts::SIGHUP,
    signal_hook::consts::SIGINT,
    signal_hook::consts::SIGQUIT,
    signal_hook::consts::SIGILL,
    signal_hook::consts::SIGTRAP,
    signal_hook::consts::SIGABRT,
    signal_hook::consts::SIGBUS,
    signal_hook::consts::SIGFPE,
    signal_hook::consts::SIGSEGV,
    signal_hook::consts::SIGSYS,
    signal_hook::consts::SIGALRM,
    signal_hook::consts::SIGTERM,
    signal_hook::consts::SIGXCPU,
    signal_hook::consts::SIGXFSZ,
    signal_hook::consts::SIGVTALRM,
    signal_hook::consts::SIGPROF,
];

/// `SIGPWR` ("power failure imminent") is part of the spec's fatal-signal table but is a
/// Linux-specific extension with no portable `signal_hook::consts` entry on every target this
/// crate might build for, so it is appended separately instead of living in [`FATAL_SIGNALS`].
#[cfg(target_os = "linux")]
const PLATFORM_FATAL_SIGNALS: &[c_int] = &[signal_hook::consts::SIGPWR];
#[cfg(not(target_os = "linux"))]
const PLATFORM_FATAL_SIGNALS: &[c_int] = &[];

/// All fatal signals this policy covers, on the current platform.
fn fatal_signals() -> impl Iterator<Item = c_int> {
    FATAL_SIGNALS
        .iter()
        .copied()
        .chain(PLATFORM_FATAL_SIGNALS.iter().copied())
}

/// Signals the master ignores outright: a broken worker pipe must not kill the master
/// (`SIGPIPE`), and being moved to the background must not stop the pool
/// (`SIGTTIN`/`SIGTTOU`). `SIGUSR1`/`SIGUSR2` are reserved and otherwise unused here.
const IGNORED_SIGNALS: &[c_int] = &[
    signal_hook::consts::SIGPIPE,
    signal_hook::consts::SIGTTIN,
    signal_hook::consts::SIGTTOU,
    signal_hook::consts::SIGUSR1,
    signal_hook::consts::SIGUSR2,
];

/// Owns the master's registration with [`FATAL_SIGNALS`] and knows how to act on it.
///
/// The inner [`Signals`] adapter is a normal `mio::event::Source`: register it into the
/// dispatcher's poll set like any other descriptor, and call [`SignalWatcher::handle_pending`]
/// whenever its token comes back readable.
pub struct SignalWatcher {
    pub signals: Signals,
}

impl SignalWatcher {
    /// Ignores [`IGNORED_SIGNALS`] and registers [`FATAL_SIGNALS`] for delivery through the
    /// returned watcher's self-pipe.
    ///
    /// # Errors
    ///
    /// Returns an error if a signal disposition cannot be changed or the signal adapter cannot be
    /// created.
    pub fn install() -> Result<Self> {
        for &signum in IGNORED_SIGNALS {
            let signal = Signal::try_from(signum).context("Unknown signal in ignore table")?;
            // SAFETY: `SigIgn` is async-signal-safe and installed before any worker exists.
            unsafe { signal::signal(signal, signal::SigHandler::SigIgn) }
                .context("Error ignoring signal")?;
        }

        let signals = Signals::new(fatal_signals()).context("Error registering signals")?;

        Ok(Self { signals })
    }

    /// Resets the disposition of, and re-broadcasts to the master's own process group, every
    /// signal that has arrived since the last call.
    pub fn handle_pending(&mut self) {
        for signum in self.signals.pending() {
            let Ok(signal) = Signal::try_from(signum) else {
                continue;
            };
            // SAFETY: resets to the default action, which is always a valid disposition.
            if let Err(e) = unsafe { signal::signal(signal, signal::SigHandler::SigDfl) } {
                eprintln!("Error resetting disposition for {signal}: {e}");
            }
            if let Err(e) = signal::killpg(nix::unistd::getpgrp(), signal) {
                eprintln!("Error re-broadcasting {signal} to process group: {e}");
            }
        }
    }
}

/// Resets every signal this module touches back to its default disposition.
///
/// Called by a freshly-forked worker before it raises its startup stop signal, so neither the
/// master's "propagate and default" handler nor its ignore table survive into the child.
///
/// # Errors
///
/// Returns an error if a disposition cannot be reset.
pub fn reset_all_to_default() -> Result<()> {
    for signum in fatal_signals().chain(IGNORED_SIGNALS.iter().copied()) {
        let signal = Signal::try_from(signum).context("Unknown signal in policy table")?;
        // SAFETY: resets to the default action, which is always a valid disposition, and runs
        // before the child has any threads of its own.
        unsafe { signal::signal(signal, signal::SigHandler::SigDfl) }
            .context("Error resetting signal disposition")?;
    }
    Ok(())
}
