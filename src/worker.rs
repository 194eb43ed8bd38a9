//! The default worker executor: a run-loop over a duplex stream to the master, plus the
//! per-command execution logic that runs a line of input through a shell.

use crate::process::resolve_shell;
use anyhow::{Context, Result};
use std::io::{self, BufRead, BufReader, Write};
use std::os::fd::{AsRawFd, RawFd};
use std::os::unix::net::UnixStream;
use std::os::unix::process::{CommandExt, ExitStatusExt};
use std::process::{ChildStdout, Command, ExitStatus, Stdio};

/// Runs the default worker loop: advertise readiness, receive a command line, execute it, repeat.
///
/// Exits cleanly (returning the worst exit code seen across every command this worker ran, or `0`
/// if it ran none) when the master closes its end of `socket`.
///
/// # Errors
///
/// Returns an error if the socket cannot be read from or written to.
pub fn run_default_loop(socket: UnixStream, slot_id: usize, line_buffer_size: usize) -> Result<i32> {
    let mut writer = socket.try_clone().context("Error cloning worker socket")?;
    let mut reader = BufReader::new(socket);

    let mut returned = 0;
    let mut worst = 0;
    let mut line = String::new();

    loop {
        writeln!(writer, "{returned}").context("Error writing readiness message")?;
        writer.flush().context("Error flushing readiness message")?;

        line.clear();
        let bytes_read = reader
            .read_line(&mut line)
            .context("Error reading command line")?;
        if bytes_read == 0 {
            return Ok(worst);
        }
        let command = line.trim_end_matches('\n');

        eprintln!("[{slot_id}]: executing: {command}");
        returned = execute(command, line_buffer_size).unwrap_or_else(|e| {
            eprintln!("[{slot_id}]: error executing command: {e}");
            1
        });
        worst |= returned;
    }
}

/// Runs one shell command to completion and returns an exit-status-like integer: the process's
/// own exit code, or `128 + signal number` if it was killed by a signal.
fn execute(command: &str, line_buffer_size: usize) -> Result<i32> {
    let shell = resolve_shell()?;
    let mut cmd = Command::new(&shell);
    cmd.arg("-c").arg(command);

    if line_buffer_size == 0 {
        cmd.stdout(Stdio::inherit());
        let status = cmd.status().context("Error running shell")?;
        return Ok(exit_code_of(&status));
    }

    cmd.stdout(Stdio::piped());
    let mut child = cmd.spawn().context("Error spawning shell")?;
    let stdout = child
        .stdout
        .take()
        .context("Error taking shell stdout")?;
    forward_captured_output(stdout, line_buffer_size)?;
    let status = child.wait().context("Error waiting for shell")?;
    Ok(exit_code_of(&status))
}

fn exit_code_of(status: &ExitStatus) -> i32 {
    if let Some(code) = status.code() {
        return code;
    }
    if let Some(signum) = status.signal() {
        return 128 + signum;
    }
    1
}

/// Reads the shell child's stdout in `line_buffer_size`-capped chunks and forwards each one to the
/// master's stdout under an advisory write lock, degrading to lock-free once locking fails.
fn forward_captured_output(stdout: ChildStdout, line_buffer_size: usize) -> Result<()> {
    let mut reader = BufReader::with_capacity(line_buffer_size.max(1), stdout);
    let mut chunk = Vec::with_capacity(line_buffer_size);
    let mut lockable = true;

    while read_capped_line(&mut reader, line_buffer_size, &mut chunk)
        .context("Error reading captured output")?
    {
        if lockable {
            if let Err(e) = lock_stdout() {
                eprintln!("Unable to lock output file: {e}");
                lockable = false;
            }
        }

        let write_result = io::stdout()
            .write_all(&chunk)
            .and_then(|()| io::stdout().flush());

        if lockable {
            if let Err(e) = unlock_stdout() {
                eprintln!("Unable to unlock output file: {e}");
                lockable = false;
            }
        }

        write_result.context("Error writing captured output")?;
    }

    Ok(())
}

/// Reads at most `cap` bytes into `buf`, stopping early at the first newline (inclusive), mirroring
/// C's `fgets` so a line longer than `cap` is split across successive calls instead of growing
/// `buf` unbounded. Returns `false` once the stream is exhausted and nothing was read.
fn read_capped_line(reader: &mut impl BufRead, cap: usize, buf: &mut Vec<u8>) -> io::Result<bool> {
    buf.clear();
    loop {
        if buf.len() >= cap {
            return Ok(true);
        }
        let available = reader.fill_buf()?;
        if available.is_empty() {
            return Ok(!buf.is_empty());
        }
        if let Some(newline_at) = available.iter().position(|&b| b == b'\n') {
            let end = (newline_at + 1).min(cap - buf.len());
            buf.extend_from_slice(&available[..end]);
            reader.consume(end);
            return Ok(true);
        }
        let take = available.len().min(cap - buf.len());
        buf.extend_from_slice(&available[..take]);
        reader.consume(take);
    }
}

fn whole_file_lock(lock_type: libc::c_short) -> libc::flock {
    // SAFETY: every field of `libc::flock` is a plain integer for which zero is a valid value.
    let mut lock: libc::flock = unsafe { std::mem::zeroed() };
    lock.l_type = lock_type;
    lock.l_whence = libc::SEEK_SET as libc::c_short;
    lock
}

/// Acquires a whole-file advisory write lock on the master's stdout, blocking until it is free.
fn lock_stdout() -> nix::Result<()> {
    let lock = whole_file_lock(libc::F_WRLCK as libc::c_short);
    let stdout = io::stdout();
    nix::fcntl::fcntl(stdout.as_raw_fd(), nix::fcntl::FcntlArg::F_SETLKW(&lock))?;
    Ok(())
}

/// Releases the advisory write lock acquired by [`lock_stdout`].
fn unlock_stdout() -> nix::Result<()> {
    let lock = whole_file_lock(libc::F_UNLCK as libc::c_short);
    let stdout = io::stdout();
    nix::fcntl::fcntl(stdout.as_raw_fd(), nix::fcntl::FcntlArg::F_SETLK(&lock))?;
    Ok(())
}

/// Execs into a replacement worker program in place of the calling process, after the startup
/// barrier has released it.
///
/// Clears `FD_CLOEXEC` on `socket_fd` so it survives the exec, duplicates it into a second
/// "ready" descriptor (so the replacement can keep the line-protocol fd and the readiness-signal
/// fd distinct if it wants to), redirects stdin from `/dev/null`, and sets the four
/// `PARALLEL_EXEC_*` environment variables a replacement worker reads to find its socket and
/// configuration.
///
/// Never returns on success. On failure to exec, exits the process with a nonzero status: a
/// mistyped custom worker command should fail loudly rather than silently falling back to the
/// default worker.
pub fn exec_custom_worker(
    command: &[String],
    socket_fd: RawFd,
    raw_buffer_size_arg: &str,
    slot_id: usize,
) -> ! {
    if let Err(e) = run_exec_custom_worker(command, socket_fd, raw_buffer_size_arg, slot_id) {
        eprintln!("[{slot_id}]: error execing custom worker: {e}");
        std::process::exit(1);
    }
    unreachable!("exec either replaces this process or returns an error");
}

fn run_exec_custom_worker(
    command: &[String],
    socket_fd: RawFd,
    raw_buffer_size_arg: &str,
    slot_id: usize,
) -> Result<()> {
    let (program, args) = command
        .split_first()
        .context("Custom worker command is empty")?;

    clear_cloexec(socket_fd).context("Error clearing FD_CLOEXEC on worker socket")?;
    let ready_fd = nix::unistd::dup(socket_fd).context("Error duplicating worker socket")?;

    let devnull =
        std::fs::File::open("/dev/null").context("Error opening /dev/null for worker stdin")?;

    let mut cmd = Command::new(program);
    cmd.args(args)
        .env("PARALLEL_EXEC_ID", slot_id.to_string())
        .env("PARALLEL_EXEC_BUFFER", raw_buffer_size_arg)
        .env("PARALLEL_EXEC_LINE", socket_fd.to_string())
        .env("PARALLEL_EXEC_READY", ready_fd.to_string())
        .stdin(devnull);

    Err(cmd.exec().into())
}

fn clear_cloexec(fd: RawFd) -> nix::Result<()> {
    let flags = nix::fcntl::fcntl(fd, nix::fcntl::FcntlArg::F_GETFD)?;
    let mut flags = nix::fcntl::FdFlag::from_bits_truncate(flags);
    flags.remove(nix::fcntl::FdFlag::FD_CLOEXEC);
    nix::fcntl::fcntl(fd, nix::fcntl::FcntlArg::F_SETFD(flags))?;
    Ok(())
}
