//! Fork-exec-pipe isolation for running a registered map/reduce plugin.
//!
//! The child is a fresh `fork()` of the parent process: a crashing or
//! malicious plugin corrupts only the child's address space, not the
//! server's. Parent and child exchange data over a pair of pipes, each
//! framed the same way the wire protocol frames fields: `u32 len | bytes`.

use std::os::unix::io::AsRawFd;

use nix::sys::wait::{waitpid, WaitStatus};
use nix::unistd::{fork, pipe, read, write, ForkResult};
use thiserror::Error;

use super::{call_map, call_reduce, MapFn, ReduceFn};

/// Errors from the fork/pipe execution sandbox.
#[derive(Error, Debug)]
pub enum SandboxError {
    /// A `fork`/`pipe`/`waitpid`/`read`/`write` syscall failed.
    #[error("sandbox syscall failed: {0}")]
    Errno(#[from] nix::errno::Errno),

    /// The child process exited with a non-zero status.
    #[error("map/reduce plugin exited with a non-zero status")]
    ChildFailed,

    /// The child process was terminated by a signal before completing.
    #[error("map/reduce plugin was terminated by a signal")]
    ChildSignaled,
}

/// Result alias for sandbox operations.
pub type SandboxResult<T> = Result<T, SandboxError>;

fn write_all(fd: impl AsRawFd, mut buf: &[u8]) -> SandboxResult<()> {
    let raw = fd.as_raw_fd();
    while !buf.is_empty() {
        let n = write(raw, buf)?;
        buf = &buf[n..];
    }
    Ok(())
}

/// Read exactly `buf.len()` bytes, or report that the stream ended exactly
/// on a record boundary (`Ok(false)`, only valid when `buf` is the 4-byte
/// length prefix) versus ended mid-record (an error).
fn read_exact_or_eof(fd: impl AsRawFd, buf: &mut [u8]) -> SandboxResult<bool> {
    let raw = fd.as_raw_fd();
    let mut total = 0usize;
    while total < buf.len() {
        let n = read(raw, &mut buf[total..])?;
        if n == 0 {
            return Ok(total == 0);
        }
        total += n;
    }
    Ok(true)
}

fn write_framed(fd: impl AsRawFd, bytes: &[u8]) -> SandboxResult<()> {
    let raw = fd.as_raw_fd();
    write_all(raw, &(bytes.len() as u32).to_le_bytes())?;
    write_all(raw, bytes)
}

/// Run `map_fn` over every `(key, value)` pair in a forked child, then
/// `reduce_fn` over the accumulated map outputs. Returns the reduce result
/// to the caller in the parent process.
pub fn run(map_fn: MapFn, reduce_fn: ReduceFn, pairs: &[(String, Vec<u8>)]) -> SandboxResult<Vec<u8>> {
    // parent -> child: streamed kv pairs
    let (to_child_read, to_child_write) = pipe()?;
    // child -> parent: the reduce result
    let (from_child_read, from_child_write) = pipe()?;

    match unsafe { fork()? } {
        ForkResult::Parent { child } => {
            drop(to_child_read);
            drop(from_child_write);

            for (k, v) in pairs {
                write_framed(&to_child_write, k.as_bytes())?;
                write_framed(&to_child_write, v)?;
            }
            drop(to_child_write); // EOF signal to the child

            let mut result = Vec::new();
            let mut chunk = [0u8; 4096];
            loop {
                let n = read(from_child_read.as_raw_fd(), &mut chunk)?;
                if n == 0 {
                    break;
                }
                result.extend_from_slice(&chunk[..n]);
            }
            drop(from_child_read);

            match waitpid(child, None)? {
                WaitStatus::Exited(_, 0) => Ok(result),
                WaitStatus::Exited(..) => Err(SandboxError::ChildFailed),
                WaitStatus::Signaled(..) => Err(SandboxError::ChildSignaled),
                _ => Err(SandboxError::ChildFailed),
            }
        }
        ForkResult::Child => {
            drop(to_child_write);
            drop(from_child_read);
            let outcome = child_main(&to_child_read, &from_child_write, map_fn, reduce_fn);
            drop(to_child_read);
            drop(from_child_write);
            std::process::exit(if outcome.is_ok() { 0 } else { 1 });
        }
    }
}

fn child_main(
    in_fd: impl AsRawFd,
    out_fd: impl AsRawFd,
    map_fn: MapFn,
    reduce_fn: ReduceFn,
) -> SandboxResult<()> {
    let mut mapped: Vec<Vec<u8>> = Vec::new();

    loop {
        let mut len_buf = [0u8; 4];
        if !read_exact_or_eof(&in_fd, &mut len_buf)? {
            break;
        }
        let key_len = u32::from_le_bytes(len_buf) as usize;
        let mut key = vec![0u8; key_len];
        read_exact_or_eof(&in_fd, &mut key)?;

        let mut len_buf = [0u8; 4];
        read_exact_or_eof(&in_fd, &mut len_buf)?;
        let val_len = u32::from_le_bytes(len_buf) as usize;
        let mut value = vec![0u8; val_len];
        read_exact_or_eof(&in_fd, &mut value)?;

        let mapped_one = unsafe { call_map(map_fn, &key, &value) };
        mapped.push(mapped_one);
    }

    let reduced = unsafe { call_reduce(reduce_fn, &mapped) };
    write_all(&out_fd, &reduced)
}
