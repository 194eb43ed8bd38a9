//! A minimal replacement worker, built as its own binary, used by `tests/integration_test.rs` to
//! observe the `PARALLEL_EXEC_*` environment contract a custom worker command is launched with.
//!
//! It advertises readiness once, reads exactly one command line back from the master, prints both
//! its environment and the command it received to its own stdout, and exits — it never loops, so
//! the master sees EOF on its socket right after and retires this slot normally.

use std::io::{BufRead, BufReader, Write};
use std::os::fd::FromRawFd;
use std::os::unix::net::UnixStream;

fn env_var(name: &str) -> String {
    std::env::var(name).unwrap_or_else(|_| format!("<missing:{name}>"))
}

fn main() {
    let id = env_var("PARALLEL_EXEC_ID");
    let buffer = env_var("PARALLEL_EXEC_BUFFER");
    let line_fd: i32 = env_var("PARALLEL_EXEC_LINE")
        .parse()
        .expect("PARALLEL_EXEC_LINE must be a valid fd number");
    let ready_fd: i32 = env_var("PARALLEL_EXEC_READY")
        .parse()
        .expect("PARALLEL_EXEC_READY must be a valid fd number");

    // SAFETY: `PARALLEL_EXEC_LINE` names an open, valid socket fd handed to us by our launcher,
    // and nothing else in this process touches it before this point.
    let socket = unsafe { UnixStream::from_raw_fd(line_fd) };
    let mut writer = socket.try_clone().expect("clone socket for writer half");
    let mut reader = BufReader::new(socket);

    writeln!(writer, "0").expect("write readiness message");
    writer.flush().expect("flush readiness message");

    let mut command = String::new();
    reader
        .read_line(&mut command)
        .expect("read command line from master");
    let command = command.trim_end_matches('\n');

    println!("PARALLEL_EXEC_ID={id}");
    println!("PARALLEL_EXEC_BUFFER={buffer}");
    println!("PARALLEL_EXEC_READY_IS_DUP={}", ready_fd != line_fd);
    println!("command={command}");
}
