//! Cohort lifecycle: spawning the worker pool, synchronizing its startup, and reaping it at the
//! end of a run.

use crate::settings::PoolConfig;
use crate::{signals, worker};
use anyhow::{Context, Result};
use nix::sys::socket::{AddressFamily, SockFlag, SockType};
use nix::sys::wait::WaitPidFlag;
use nix::unistd::{ForkResult, Pid};
use std::os::fd::{AsRawFd, OwnedFd, RawFd};
use std::os::unix::net::UnixStream;

/// One worker slot as seen by the master.
pub struct WorkerHandle {
    /// The master's end of the duplex socket to this worker, or `None` once retired.
    pub socket: Option<UnixStream>,
    /// The worker's process id.
    pub pid: Pid,
    /// 1-based slot index, exposed to custom worker commands via `PARALLEL_EXEC_ID`.
    pub slot_id: usize,
    /// Whether a readiness line from this worker is outstanding and unconsumed.
    pub ready: bool,
    /// Bytes read from the socket for an in-progress readiness line that has not yet seen its
    /// terminating `\n`. The dispatcher's poll set may report this socket readable more than once
    /// before a full line has arrived.
    pub readiness_buf: Vec<u8>,
}

/// The spawned, startup-synchronized cohort of workers.
pub struct Pool {
    pub workers: Vec<WorkerHandle>,
}

impl Pool {
    /// Spawns `config.worker_count` workers, holding each at a startup barrier (stopped via
    /// `SIGSTOP`, immediately after it resets its own signal dispositions and closes every other
    /// worker's socket) until every slot has either succeeded or been abandoned.
    ///
    /// A slot that fails to spawn or fails to reach the stopped state is abandoned: its child (if
    /// any) is killed and its sockets are closed, and the remaining slots still proceed.
    ///
    /// Call [`Pool::release`] once the cohort and the master's signal handlers are both ready, to
    /// let every stopped worker resume simultaneously.
    pub fn spawn(config: &PoolConfig) -> Result<Pool> {
        let mut workers = Vec::with_capacity(config.worker_count);
        let mut raw_worker_fds: Vec<RawFd> = Vec::with_capacity(config.worker_count);

        for slot_id in 1..=config.worker_count {
            match spawn_one(config, slot_id, &raw_worker_fds) {
                Ok(handle) => {
                    if let Some(socket) = &handle.socket {
                        raw_worker_fds.push(socket.as_raw_fd());
                    }
                    workers.push(handle);
                }
                Err(e) => {
                    eprintln!("Error spawning worker {slot_id}: {e}");
                }
            }
        }

        Ok(Pool { workers })
    }

    /// Releases every stopped worker by sending `SIGCONT` to the master's own process group.
    ///
    /// # Errors
    ///
    /// Returns an error if the signal cannot be sent.
    pub fn release(&self) -> Result<()> {
        nix::sys::signal::killpg(nix::unistd::getpgrp(), nix::sys::signal::Signal::SIGCONT)
            .context("Error releasing worker pool")?;
        Ok(())
    }

    /// Closes every still-open worker socket.
    ///
    /// Called once the dispatcher has stopped reading stdin, so that any worker still blocked
    /// reading its next command line sees EOF and exits its loop on its own, the same way the
    /// dispatcher itself reacts to stdin EOF. Must happen before [`Pool::reap_remaining`]: a
    /// worker socket left open would leave that worker blocked forever, and the master blocked
    /// forever waiting for it.
    pub fn close_remaining_sockets(&mut self) {
        for worker in &mut self.workers {
            worker.socket = None;
        }
    }

    /// Waits for every remaining child, OR-folding their raw wait-status values into a single
    /// outcome, the same way any Unix process's own exit status is built up from its children.
    ///
    /// Returns 0 if there were no remaining children to reap.
    pub fn reap_remaining(&mut self) -> i32 {
        let mut outcome = 0;
        loop {
            let mut status: i32 = 0;
            // SAFETY: a plain libc wait call; the buffer is only ever read by the kernel after
            // being written by it.
            let pid = unsafe { libc::waitpid(-1, &mut status, 0) };
            if pid > 0 {
                outcome |= status;
                continue;
            }
            if pid == -1 {
                let errno = std::io::Error::last_os_error();
                if errno.raw_os_error() == Some(libc::EINTR) {
                    continue;
                }
                // ECHILD: no children remain.
                break;
            }
            break;
        }
        outcome
    }
}

fn spawn_one(config: &PoolConfig, slot_id: usize, sibling_fds: &[RawFd]) -> Result<WorkerHandle> {
    let (parent_fd, child_fd) = socketpair_cloexec().context("Error creating worker socket")?;

    // SAFETY: `fork` is called before this process has spawned any additional threads of its
    // own beyond the implicit single main thread, and the child performs only async-signal-safe
    // work (signal resets, fd closes, `raise`) before either exec-ing or calling into
    // `worker::run_default_loop`, which itself only touches owned fds and stdio.
    match unsafe { nix::unistd::fork() }.context("Error forking worker")? {
        ForkResult::Child => {
            drop(parent_fd);
            run_child(config, slot_id, child_fd, sibling_fds)
        }
        ForkResult::Parent { child } => {
            drop(child_fd);
            finish_parent_side(parent_fd, child, slot_id)
        }
    }
}

/// Runs entirely inside the freshly-forked child, up to and including the point where it either
/// execs a replacement program or enters the default worker loop. Never returns to the caller
/// because both paths terminate the process.
fn run_child(config: &PoolConfig, slot_id: usize, socket: OwnedFd, sibling_fds: &[RawFd]) -> ! {
    if let Err(e) = signals::reset_all_to_default() {
        eprintln!("[{slot_id}]: error resetting signal dispositions: {e}");
        std::process::exit(1);
    }

    for &fd in sibling_fds {
        // SAFETY: each fd in `sibling_fds` is a worker socket owned by this process's parent
        // copy, duplicated across `fork`; closing our copy severs cross-talk between sibling
        // workers without affecting the original in the master.
        unsafe {
            libc::close(fd);
        }
    }

    let socket_fd = socket.as_raw_fd();

    if nix::sys::signal::raise(nix::sys::signal::Signal::SIGSTOP).is_err() {
        eprintln!("[{slot_id}]: error raising SIGSTOP");
        std::process::exit(1);
    }

    if config.custom_worker_command.is_empty() {
        // The dispatcher puts the master's stdin into non-blocking mode, which mutates the
        // shared open file description rather than a per-process table entry; without this, a
        // default worker (and any shell child it spawns) would still see the master's stdin fd
        // and inherit that non-blocking flag, turning an ordinary blocking read (`read`, `cat`)
        // into spurious `EAGAIN`s. Redirecting away from it here matches what the custom-worker
        // exec path already does for its own stdin.
        if let Err(e) = redirect_stdin_to_dev_null() {
            eprintln!("[{slot_id}]: error redirecting worker stdin: {e}");
            std::process::exit(1);
        }

        let stream = UnixStream::from(socket);
        match worker::run_default_loop(stream, slot_id, config.line_buffer_size) {
            Ok(code) => std::process::exit(code),
            Err(e) => {
                eprintln!("[{slot_id}]: error in worker loop: {e}");
                std::process::exit(1);
            }
        }
    }

    // `exec_custom_worker` consumes `socket_fd` directly; leak the `OwnedFd` wrapper so its
    // `Drop` does not close the descriptor out from under the exec.
    std::mem::forget(socket);
    worker::exec_custom_worker(
        &config.custom_worker_command,
        socket_fd,
        &config.raw_buffer_size_arg,
        slot_id,
    );
}

/// Replaces this process's stdin with `/dev/null`.
///
/// `dup2` only rewrites this process's own fd-0 table entry, so the master's stdin (and any other
/// worker's) is untouched.
fn redirect_stdin_to_dev_null() -> Result<()> {
    let devnull =
        std::fs::File::open("/dev/null").context("Error opening /dev/null for worker stdin")?;
    // SAFETY: `devnull` is a valid, open fd for the duration of this call.
    if unsafe { libc::dup2(devnull.as_raw_fd(), libc::STDIN_FILENO) } < 0 {
        return Err(std::io::Error::last_os_error())
            .context("Error redirecting worker stdin to /dev/null");
    }
    Ok(())
}

/// Waits for the freshly-forked child to report itself stopped, places it into the master's
/// process group, and wraps the master's socket end as a [`WorkerHandle`].
///
/// If the child does not reach the stopped state, it is killed and the slot is abandoned.
fn finish_parent_side(parent_fd: OwnedFd, child: Pid, slot_id: usize) -> Result<WorkerHandle> {
    let stopped = wait_for_stop(child).context("Error waiting for worker to reach startup barrier")?;
    if !stopped {
        let _ = nix::sys::signal::kill(child, nix::sys::signal::Signal::SIGKILL);
        let _ = wait_for_stop(child);
        anyhow::bail!("worker {slot_id} (pid {child}) did not stop at its startup barrier");
    }

    nix::unistd::setpgid(child, nix::unistd::getpgrp())
        .context("Error placing worker into master's process group")?;

    Ok(WorkerHandle {
        socket: Some(UnixStream::from(parent_fd)),
        pid: child,
        slot_id,
        ready: false,
        readiness_buf: Vec::new(),
    })
}

/// Waits (retrying across `EINTR`) for `pid` to either stop or exit; returns whether it stopped.
fn wait_for_stop(pid: Pid) -> Result<bool> {
    loop {
        match nix::sys::wait::waitpid(pid, Some(WaitPidFlag::WUNTRACED)) {
            Ok(nix::sys::wait::WaitStatus::Stopped(_, _)) => return Ok(true),
            Ok(_) => return Ok(false),
            Err(nix::errno::Errno::EINTR) => continue,
            Err(e) => return Err(e).context("Error in waitpid"),
        }
    }
}

/// Creates a `SOCK_STREAM` Unix domain socket pair with both ends marked close-on-exec at
/// creation, so neither leaks into an unrelated exec before the worker deliberately clears the
/// flag on its own end (see [`worker::exec_custom_worker`]).
fn socketpair_cloexec() -> nix::Result<(OwnedFd, OwnedFd)> {
    nix::sys::socket::socketpair(
        AddressFamily::Unix,
        SockType::Stream,
        None,
        SockFlag::SOCK_CLOEXEC,
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn socketpair_cloexec_creates_a_connected_pair() {
        let (a, b) = socketpair_cloexec().unwrap();
        let mut a = UnixStream::from(a);
        let mut b = UnixStream::from(b);
        use std::io::{Read, Write};
        a.write_all(b"ping").unwrap();
        let mut buf = [0u8; 4];
        b.read_exact(&mut buf).unwrap();
        assert_eq!(&buf, b"ping");
    }

    #[test]
    fn close_remaining_sockets_clears_every_handle_and_unblocks_the_peer() {
        let (a, b) = socketpair_cloexec().unwrap();
        let mut pool = Pool {
            workers: vec![WorkerHandle {
                socket: Some(UnixStream::from(a)),
                pid: Pid::from_raw(0),
                slot_id: 1,
                ready: false,
                readiness_buf: Vec::new(),
            }],
        };

        pool.close_remaining_sockets();

        assert!(pool.workers[0].socket.is_none());

        let mut b = UnixStream::from(b);
        use std::io::Read;
        let mut buf = [0u8; 1];
        assert_eq!(b.read(&mut buf).unwrap(), 0, "peer should observe EOF");
    }
}
