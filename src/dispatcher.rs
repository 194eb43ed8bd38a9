//! The master's single dispatch loop: pulls one command line at a time off stdin and hands it to
//! whichever worker is ready first, over one unified readiness multiplexer.

use crate::pool::{Pool, WorkerHandle};
use crate::signals::SignalWatcher;
use anyhow::{Context, Result};
use mio::unix::SourceFd;
use mio::{Events, Interest, Poll, Token};
use nix::fcntl::{self, OFlag};
use std::io::{self, Read, Write};
use std::os::fd::{AsRawFd, BorrowedFd, RawFd};

const STDIN_TOKEN: Token = Token(0);
const SIGNAL_TOKEN: Token = Token(1);
const WORKER_TOKEN_BASE: usize = 2;

/// One page: the cap on a single stdin read and on how large an unterminated accumulation buffer
/// is allowed to grow before it is forcibly split into its own command.
const STDIN_CHUNK_SIZE: usize = 4096;
/// Generous bound for one readiness line; comfortably larger than any decimal exit code.
const READINESS_LINE_CAP: usize = 32;

/// Runs the dispatch loop to completion and returns this component's own contribution to the
/// program's final exit status.
///
/// The dispatcher terminating on its own (empty worker set, or stdin EOF with nothing pending) is
/// not itself a failure, so it always contributes 0; whatever the workers produced is folded in
/// separately when the pool is reaped.
///
/// # Errors
///
/// Returns an error if the poll set cannot be created or polling itself fails for a reason other
/// than being interrupted.
pub fn run(pool: &mut Pool, signal_watcher: &mut SignalWatcher, mut stdin: impl Read + AsRawFd) -> Result<i32> {
    set_nonblocking(stdin.as_raw_fd()).context("Error setting stdin non-blocking")?;

    let mut poll = Poll::new().context("Error creating poll of events")?;
    let registry = poll.registry();

    registry
        .register(
            &mut SourceFd(&stdin.as_raw_fd()),
            STDIN_TOKEN,
            Interest::READABLE,
        )
        .context("Error registering stdin in poll of events")?;
    registry
        .register(&mut signal_watcher.signals, SIGNAL_TOKEN, Interest::READABLE)
        .context("Error registering signal watcher in poll of events")?;

    for (index, worker) in pool.workers.iter().enumerate() {
        if let Some(socket) = &worker.socket {
            register_worker(registry, index, socket)
                .context("Error registering worker socket in poll of events")?;
        }
    }

    let mut events = Events::with_capacity(pool.workers.len() + 2);
    let mut accum = Vec::new();
    let mut stdin_eof = false;
    let mut pending_line: Option<String> = None;

    loop {
        // Drain every dispatch this wakeup made possible before blocking again: one `poll()`
        // batch can carry several workers' readiness lines at once (most reliably at startup,
        // when the whole cohort resumes and announces readiness together), and stopping after
        // the first successful write would leave the rest sitting ready-but-unconsumed until
        // their own socket happens to become readable again, which — under edge-triggered
        // readiness — may never happen on its own.
        loop {
            if pending_line.is_none() {
                pending_line = take_pending_line(&mut accum, stdin_eof);
            }
            if !dispatch_pending(pool, &mut pending_line) {
                break;
            }
        }

        if pool.workers.iter().all(|w| w.socket.is_none()) {
            return Ok(0);
        }
        if stdin_eof && pending_line.is_none() {
            return Ok(0);
        }

        match poll.poll(&mut events, None) {
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e).context("Error polling for events"),
            Ok(()) => (),
        }

        for event in events.iter() {
            match event.token() {
                STDIN_TOKEN => {
                    read_stdin(&mut stdin, &mut accum, &mut stdin_eof)
                        .context("Error reading stdin")?;
                }
                SIGNAL_TOKEN => signal_watcher.handle_pending(),
                Token(n) if n >= WORKER_TOKEN_BASE => {
                    handle_worker_readable(pool, n - WORKER_TOKEN_BASE);
                }
                _ => unreachable!("poll returned an unregistered token"),
            }
        }
    }
}

fn register_worker(registry: &mio::Registry, index: usize, socket: &std::os::unix::net::UnixStream) -> Result<()> {
    set_nonblocking(socket.as_raw_fd())?;
    registry.register(
        &mut SourceFd(&socket.as_raw_fd()),
        Token(WORKER_TOKEN_BASE + index),
        Interest::READABLE,
    )?;
    Ok(())
}

fn set_nonblocking(fd: RawFd) -> Result<()> {
    // SAFETY: `fd` is borrowed only for the duration of these two calls and stays owned by its
    // original holder (stdin or a worker's `UnixStream`).
    let borrowed = unsafe { BorrowedFd::borrow_raw(fd) };
    let flags = fcntl::fcntl(borrowed, fcntl::F_GETFL).context("Error getting fd flags")?;
    fcntl::fcntl(
        borrowed,
        fcntl::F_SETFL(OFlag::from_bits_truncate(flags) | OFlag::O_NONBLOCK),
    )
    .context("Error setting fd non-blocking")?;
    Ok(())
}

/// Reads as much as is currently available from stdin, up to one page, into `accum`. Leaves
/// `accum` untouched and returns cleanly on `WouldBlock`; marks `eof` once a zero-byte read is
/// observed.
fn read_stdin(stdin: &mut impl Read, accum: &mut Vec<u8>, eof: &mut bool) -> io::Result<()> {
    let mut chunk = [0u8; STDIN_CHUNK_SIZE];
    loop {
        match stdin.read(&mut chunk) {
            Ok(0) => {
                *eof = true;
                return Ok(());
            }
            Ok(n) => {
                accum.extend_from_slice(&chunk[..n]);
                if accum.len() >= STDIN_CHUNK_SIZE {
                    return Ok(());
                }
            }
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(()),
            Err(e) => return Err(e),
        }
    }
}

/// Slices one complete line out of `accum`, if one is available: a newline-terminated line, or
/// (failing that) the whole remainder on EOF, or (failing that) a forced split once `accum` has
/// grown to a full page without ever seeing a newline.
fn take_pending_line(accum: &mut Vec<u8>, eof: bool) -> Option<String> {
    if let Some(pos) = accum.iter().position(|&b| b == b'\n') {
        let rest = accum.split_off(pos + 1);
        let mut line = std::mem::replace(accum, rest);
        line.pop();
        return Some(String::from_utf8_lossy(&line).into_owned());
    }
    if eof && !accum.is_empty() {
        return Some(String::from_utf8_lossy(&std::mem::take(accum)).into_owned());
    }
    if accum.len() >= STDIN_CHUNK_SIZE {
        return Some(String::from_utf8_lossy(&std::mem::take(accum)).into_owned());
    }
    None
}

/// Drains a worker's socket until it would block, accumulating a readiness line. Marks the worker
/// ready once a terminating `\n` has been seen, and retires it on EOF or a read error.
///
/// A readiness line that never gains its terminating `\n` simply never makes the worker ready
/// again: a live-lock limited to that one slot, not a block on the whole dispatch loop.
fn handle_worker_readable(pool: &mut Pool, index: usize) {
    let Some(worker) = pool.workers.get_mut(index) else {
        return;
    };
    if worker.socket.is_none() {
        return;
    }

    let mut chunk = [0u8; READINESS_LINE_CAP];
    loop {
        let socket = worker.socket.as_mut().expect("checked above");
        match socket.read(&mut chunk) {
            Ok(0) => {
                retire(worker);
                return;
            }
            Ok(n) => {
                worker.readiness_buf.extend_from_slice(&chunk[..n]);
                if worker.readiness_buf.len() > READINESS_LINE_CAP {
                    eprintln!("[{}]: readiness line exceeded buffer, retiring worker", worker.slot_id);
                    retire(worker);
                    return;
                }
            }
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
            Err(e) => {
                eprintln!("[{}]: error reading readiness line: {e}", worker.slot_id);
                retire(worker);
                return;
            }
        }
    }

    let Some(newline_at) = worker.readiness_buf.iter().position(|&b| b == b'\n') else {
        return;
    };

    let payload = &worker.readiness_buf[..newline_at];
    let well_formed = std::str::from_utf8(payload)
        .ok()
        .is_some_and(|s| s.parse::<i32>().is_ok());

    if !well_formed {
        eprintln!(
            "[{}]: malformed readiness line, retiring worker",
            worker.slot_id
        );
        retire(worker);
        return;
    }

    worker.readiness_buf.clear();
    worker.ready = true;
}

fn retire(worker: &mut WorkerHandle) {
    worker.socket = None;
    worker.ready = false;
    worker.readiness_buf.clear();
}

/// Hands `pending_line`, if any, to the first ready worker in slot order. Clears the pending line
/// whether the write succeeds or fails; a write/flush failure retires that worker and the line in
/// flight to it is lost, per the dispatcher's error-handling policy.
///
/// Returns whether a line was actually handed off, so the caller can keep pulling the next line
/// and searching for another ready worker instead of stopping after one pairing.
fn dispatch_pending(pool: &mut Pool, pending_line: &mut Option<String>) -> bool {
    let Some(line) = pending_line.as_ref() else {
        return false;
    };

    for worker in &mut pool.workers {
        if !worker.ready {
            continue;
        }
        let Some(socket) = worker.socket.as_mut() else {
            continue;
        };

        let result = writeln!(socket, "{line}").and_then(|()| socket.flush());
        worker.ready = false;
        if let Err(e) = result {
            eprintln!(
                "[{}]: error dispatching command, retiring worker: {e}",
                worker.slot_id
            );
            worker.socket = None;
        }
        *pending_line = None;
        return true;
    }
    false
}

#[cfg(test)]
mod tests {
    use super::*;

    mod take_pending_line {
        use super::*;

        #[test]
        fn extracts_a_complete_line() {
            let mut accum = b"echo hi\nrest".to_vec();
            let line = take_pending_line(&mut accum, false).unwrap();
            assert_eq!(line, "echo hi");
            assert_eq!(accum, b"rest");
        }

        #[test]
        fn holds_partial_line_without_eof() {
            let mut accum = b"echo hi".to_vec();
            assert!(take_pending_line(&mut accum, false).is_none());
            assert_eq!(accum, b"echo hi");
        }

        #[test]
        fn flushes_remainder_on_eof() {
            let mut accum = b"echo hi".to_vec();
            let line = take_pending_line(&mut accum, true).unwrap();
            assert_eq!(line, "echo hi");
            assert!(accum.is_empty());
        }

        #[test]
        fn forces_a_split_at_page_boundary() {
            let mut accum = vec![b'a'; STDIN_CHUNK_SIZE];
            let line = take_pending_line(&mut accum, false).unwrap();
            assert_eq!(line.len(), STDIN_CHUNK_SIZE);
            assert!(accum.is_empty());
        }
    }

    /// Builds one end of a connected, non-blocking `UnixStream` pair wrapped as a [`WorkerHandle`]
    /// (mirroring what `register_worker` sets up in the real dispatch loop), and hands back the
    /// other end to act as the worker.
    fn handle_pair(ready: bool) -> (WorkerHandle, std::os::unix::net::UnixStream) {
        let (a, b) = nix::sys::socket::socketpair(
            nix::sys::socket::AddressFamily::Unix,
            nix::sys::socket::SockType::Stream,
            None,
            nix::sys::socket::SockFlag::empty(),
        )
        .unwrap();
        let socket = std::os::unix::net::UnixStream::from(a);
        set_nonblocking(socket.as_raw_fd()).unwrap();
        let handle = WorkerHandle {
            socket: Some(socket),
            pid: nix::unistd::Pid::from_raw(0),
            slot_id: 1,
            ready,
            readiness_buf: Vec::new(),
        };
        (handle, std::os::unix::net::UnixStream::from(b))
    }

    mod dispatch_pending {
        use super::*;

        #[test]
        fn hands_the_line_to_a_ready_worker_and_reports_it_dispatched() {
            let (handle, mut peer) = handle_pair(true);
            let mut pool = Pool {
                workers: vec![handle],
            };
            let mut pending = Some("echo hi".to_string());

            assert!(dispatch_pending(&mut pool, &mut pending));
            assert!(pending.is_none());
            assert!(!pool.workers[0].ready);

            let mut buf = [0u8; 64];
            let n = peer.read(&mut buf).unwrap();
            assert_eq!(&buf[..n], b"echo hi\n");
        }

        #[test]
        fn leaves_the_line_pending_when_no_worker_is_ready() {
            let (handle, _peer) = handle_pair(false);
            let mut pool = Pool {
                workers: vec![handle],
            };
            let mut pending = Some("echo hi".to_string());

            assert!(!dispatch_pending(&mut pool, &mut pending));
            assert_eq!(pending.as_deref(), Some("echo hi"));
        }

        #[test]
        fn reports_nothing_dispatched_when_there_is_no_pending_line() {
            let (handle, _peer) = handle_pair(true);
            let mut pool = Pool {
                workers: vec![handle],
            };
            let mut pending = None;

            assert!(!dispatch_pending(&mut pool, &mut pending));
        }

        #[test]
        fn dispatches_to_the_second_worker_once_the_first_is_already_spoken_for() {
            let (handle_a, mut peer_a) = handle_pair(true);
            let (handle_b, mut peer_b) = handle_pair(true);
            let mut pool = Pool {
                workers: vec![handle_a, handle_b],
            };

            let mut first = Some("echo a".to_string());
            assert!(dispatch_pending(&mut pool, &mut first));
            let mut second = Some("echo b".to_string());
            assert!(dispatch_pending(&mut pool, &mut second));

            let mut buf = [0u8; 64];
            let n = peer_a.read(&mut buf).unwrap();
            assert_eq!(&buf[..n], b"echo a\n");
            let n = peer_b.read(&mut buf).unwrap();
            assert_eq!(&buf[..n], b"echo b\n");
        }
    }

    mod handle_worker_readable_tests {
        use super::*;

        #[test]
        fn marks_ready_on_a_well_formed_integer_line() {
            let (handle, mut peer) = handle_pair(false);
            let mut pool = Pool {
                workers: vec![handle],
            };
            peer.write_all(b"0\n").unwrap();

            handle_worker_readable(&mut pool, 0);

            assert!(pool.workers[0].ready);
            assert!(pool.workers[0].socket.is_some());
        }

        #[test]
        fn retires_the_worker_on_a_malformed_readiness_line() {
            let (handle, mut peer) = handle_pair(false);
            let mut pool = Pool {
                workers: vec![handle],
            };
            peer.write_all(b"not-a-number\n").unwrap();

            handle_worker_readable(&mut pool, 0);

            assert!(!pool.workers[0].ready);
            assert!(pool.workers[0].socket.is_none());
        }

        #[test]
        fn retires_the_worker_on_peer_eof() {
            let (handle, peer) = handle_pair(false);
            let mut pool = Pool {
                workers: vec![handle],
            };
            drop(peer);

            handle_worker_readable(&mut pool, 0);

            assert!(pool.workers[0].socket.is_none());
        }
    }
}
