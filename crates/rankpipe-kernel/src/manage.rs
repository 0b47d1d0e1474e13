//! Pipeline I/O driver: a cooperative, single-threaded multiplexer.
//!
//! `manage()` drives a work list of three kinds of entries until it is empty:
//!
//! ```text
//!   Write { fd, payload, offset }  ── write what the pipe accepts, resume later
//!   Read  { fd, stream }           ── drain into the stdout or stderr buffer
//!   Wait  { pid }                  ── waitpid(WNOHANG), record the status
//! ```
//!
//! Every descriptor is switched to non-blocking mode first, so the loop only
//! ever suspends in its idle sleep, never inside a system call. `EAGAIN` just
//! defers an entry to the next pass.
//!
//! Once every child has been reaped, streams that stay open longer than
//! [`ManageConfig::force_close_after`] are closed without waiting for
//! end-of-file. That covers a grandchild that inherited a descriptor and
//! outlives its parent.
//!
//! The loop also watches its [`ProcessRegistry`]. After a
//! [`shutdown`](ProcessRegistry::shutdown) it allows the children
//! [`ManageConfig::kill_after`] to exit on the SIGTERM they were sent, then
//! SIGKILLs and reaps whatever is left, closes every stream, and fails with
//! [`Error::NoMoreProcesses`].

use std::collections::BTreeMap;
use std::fs::File;
use std::io::{ErrorKind, Read, Write};
use std::os::fd::{AsRawFd, OwnedFd, RawFd};
use std::time::Instant;

use nix::errno::Errno;
use nix::fcntl::{FcntlArg, OFlag, fcntl};
use nix::sys::signal::{Signal, kill};
use nix::sys::wait::{WaitPidFlag, WaitStatus, waitpid};
use nix::unistd::Pid;

use rankpipe_types::ExitStatus;

use crate::config::ManageConfig;
use crate::error::{Error, Result};
use crate::registry::ProcessRegistry;

/// Which capture buffer a read entry drains into.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamKind {
    Stdout,
    Stderr,
}

#[derive(Debug)]
enum Entry {
    Write {
        file: File,
        payload: Vec<u8>,
        offset: usize,
    },
    Read {
        file: File,
        stream: StreamKind,
    },
    Wait {
        pid: Pid,
    },
}

impl Entry {
    fn is_stream(&self) -> bool {
        !matches!(self, Entry::Wait { .. })
    }
}

/// Outcome of polling one entry once.
enum Step {
    /// Nothing happened; try again next pass.
    Idle,
    /// Made progress; the entry stays.
    Busy,
    /// The entry is complete and its descriptor can close.
    Done,
}

/// Pending I/O and process waits for one `manage()` call.
#[derive(Debug, Default)]
pub struct WorkList {
    entries: Vec<Entry>,
}

impl WorkList {
    pub fn new() -> Self {
        Self::default()
    }

    /// Stream `payload` into `fd`, then close it.
    pub fn write(&mut self, fd: OwnedFd, payload: impl Into<Vec<u8>>) -> &mut Self {
        self.entries.push(Entry::Write {
            file: File::from(fd),
            payload: payload.into(),
            offset: 0,
        });
        self
    }

    /// Read `fd` to end-of-file into the given capture buffer.
    pub fn read(&mut self, fd: OwnedFd, stream: StreamKind) -> &mut Self {
        self.entries.push(Entry::Read {
            file: File::from(fd),
            stream,
        });
        self
    }

    /// Reap `pid`.
    pub fn wait(&mut self, pid: Pid) -> &mut Self {
        self.entries.push(Entry::Wait { pid });
        self
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn wants(&self, kind: StreamKind) -> bool {
        self.entries
            .iter()
            .any(|e| matches!(e, Entry::Read { stream, .. } if *stream == kind))
    }
}

/// What `manage()` collected.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Managed {
    /// Captured stdout, if any stdout read was requested.
    pub out: Option<String>,
    /// Captured stderr, if any stderr read was requested.
    pub err: Option<String>,
    /// Status of every reaped child.
    pub statuses: BTreeMap<Pid, ExitStatus>,
}

pub(crate) fn set_nonblocking(fd: RawFd) -> Result<()> {
    let flags = OFlag::from_bits_truncate(fcntl(fd, FcntlArg::F_GETFL)?);
    fcntl(fd, FcntlArg::F_SETFL(flags | OFlag::O_NONBLOCK))?;
    Ok(())
}

/// Drive `work` until every stream is closed and every child reaped.
///
/// "Would block" and interrupted calls are retried on a later pass; any
/// other I/O or wait error aborts the call, closing every descriptor still
/// in the work list. A write refused with `EPIPE` (the reader went away)
/// finishes that entry without error.
///
/// Fails with [`Error::NoMoreProcesses`] if `registry` shuts down while the
/// loop runs. Every child in the work list has been reaped by then.
pub fn manage(work: WorkList, config: &ManageConfig, registry: &ProcessRegistry) -> Result<Managed> {
    let mut statuses = BTreeMap::new();
    let (out, err) = drive(work, config, registry, &mut statuses)?;
    Ok(Managed { out, err, statuses })
}

/// The loop behind [`manage`]. Statuses land in `statuses` as children are
/// reaped, so they survive an error return.
#[tracing::instrument(level = "debug", skip_all, fields(entries = work.len()))]
pub(crate) fn drive(
    work: WorkList,
    config: &ManageConfig,
    registry: &ProcessRegistry,
    statuses: &mut BTreeMap<Pid, ExitStatus>,
) -> Result<(Option<String>, Option<String>)> {
    let mut out = work.wants(StreamKind::Stdout).then(Vec::new);
    let mut err = work.wants(StreamKind::Stderr).then(Vec::new);
    let mut entries = work.entries;
    for entry in &entries {
        if let Entry::Write { file, .. } | Entry::Read { file, .. } = entry {
            set_nonblocking(file.as_raw_fd())?;
        }
    }

    let mut buf = vec![0u8; config.read_chunk.max(1)];
    let mut last_reap = Instant::now();
    let mut shut_down_at: Option<Instant> = None;

    while !entries.is_empty() {
        if shut_down_at.is_none() && registry.is_shut_down() {
            tracing::debug!(entries = entries.len(), "registry shut down; waiting for children to exit");
            shut_down_at = Some(Instant::now());
        }

        let mut progressed = false;
        let mut reaped = false;

        let mut idx = 0;
        while idx < entries.len() {
            let step = match &mut entries[idx] {
                Entry::Write {
                    file,
                    payload,
                    offset,
                } => poll_write(file, payload, offset)?,
                Entry::Read { file, stream } => {
                    let sink = match stream {
                        StreamKind::Stdout => out.get_or_insert_with(Vec::new),
                        StreamKind::Stderr => err.get_or_insert_with(Vec::new),
                    };
                    poll_read(file, &mut buf, sink)?
                }
                Entry::Wait { pid } => {
                    let pid = *pid;
                    let (step, status) = poll_wait(pid)?;
                    if let Step::Done = step {
                        registry.forget(pid);
                        reaped = true;
                        if let Some(status) = status {
                            tracing::debug!(pid = pid.as_raw(), %status, "reaped");
                            statuses.insert(pid, status);
                        }
                    }
                    step
                }
            };
            match step {
                Step::Idle => idx += 1,
                Step::Busy => {
                    progressed = true;
                    idx += 1;
                }
                Step::Done => {
                    progressed = true;
                    // Dropping the entry closes its descriptor.
                    entries.remove(idx);
                }
            }
        }

        if reaped {
            last_reap = Instant::now();
        }

        let streams_open = entries.iter().filter(|e| e.is_stream()).count();
        let waits_left = entries.len() - streams_open;

        if let Some(since) = shut_down_at
            && (waits_left == 0 || since.elapsed() >= config.kill_after)
        {
            cancel(entries, registry, statuses);
            return Err(Error::NoMoreProcesses);
        }

        if streams_open > 0 && waits_left == 0 && last_reap.elapsed() > config.force_close_after {
            tracing::warn!(
                open = streams_open,
                grace_ms = config.force_close_after.as_millis() as u64,
                "children exited but streams stayed open; force-closing"
            );
            entries.clear();
            break;
        }

        if !progressed {
            let nap = if streams_open > 0 {
                config.stream_poll_interval
            } else {
                config.wait_poll_interval
            };
            std::thread::sleep(nap);
        }
    }

    Ok((
        out.map(|bytes| String::from_utf8_lossy(&bytes).into_owned()),
        err.map(|bytes| String::from_utf8_lossy(&bytes).into_owned()),
    ))
}

/// SIGKILL and reap every child still waited on, then close all streams.
fn cancel(entries: Vec<Entry>, registry: &ProcessRegistry, statuses: &mut BTreeMap<Pid, ExitStatus>) {
    let mut killed = 0;
    for entry in &entries {
        if let Entry::Wait { pid } = entry {
            if let Some(status) = kill_and_reap(*pid) {
                statuses.insert(*pid, status);
            }
            registry.forget(*pid);
            killed += 1;
        }
    }
    tracing::warn!(killed, streams = entries.len() - killed, "cancelled by registry shutdown");
}

/// SIGKILL `pid` and block until it is reaped. `None` if it was reaped elsewhere.
pub(crate) fn kill_and_reap(pid: Pid) -> Option<ExitStatus> {
    match kill(pid, Signal::SIGKILL) {
        Ok(()) | Err(Errno::ESRCH) => {}
        Err(e) => tracing::warn!(pid = pid.as_raw(), error = %e, "SIGKILL failed"),
    }
    loop {
        match waitpid(pid, None) {
            Ok(status) => match decode_wait(status) {
                Some(status) => return Some(status),
                None => continue,
            },
            Err(Errno::EINTR) => continue,
            Err(_) => return None,
        }
    }
}

fn poll_write(file: &mut File, payload: &[u8], offset: &mut usize) -> Result<Step> {
    if *offset >= payload.len() {
        return Ok(Step::Done);
    }
    match file.write(&payload[*offset..]) {
        Ok(0) => Ok(Step::Idle),
        Ok(n) => {
            *offset += n;
            tracing::trace!(fd = file.as_raw_fd(), wrote = n, remaining = payload.len() - *offset, "write");
            if *offset >= payload.len() {
                Ok(Step::Done)
            } else {
                Ok(Step::Busy)
            }
        }
        Err(e) if e.kind() == ErrorKind::WouldBlock || e.kind() == ErrorKind::Interrupted => Ok(Step::Idle),
        Err(e) if e.kind() == ErrorKind::BrokenPipe => {
            tracing::debug!(
                fd = file.as_raw_fd(),
                unsent = payload.len() - *offset,
                "reader closed before input was consumed"
            );
            Ok(Step::Done)
        }
        Err(e) => Err(e.into()),
    }
}

fn poll_read(file: &mut File, buf: &mut [u8], sink: &mut Vec<u8>) -> Result<Step> {
    match file.read(buf) {
        Ok(0) => Ok(Step::Done),
        Ok(n) => {
            tracing::trace!(fd = file.as_raw_fd(), read = n, "read");
            sink.extend_from_slice(&buf[..n]);
            Ok(Step::Busy)
        }
        Err(e) if e.kind() == ErrorKind::WouldBlock || e.kind() == ErrorKind::Interrupted => Ok(Step::Idle),
        Err(e) => Err(e.into()),
    }
}

/// Terminal wait statuses only; stops, continues and "still alive" are `None`.
pub(crate) fn decode_wait(status: WaitStatus) -> Option<ExitStatus> {
    match status {
        WaitStatus::Exited(_, code) => Some(ExitStatus::Exited(code)),
        WaitStatus::Signaled(_, signal, _) => Some(ExitStatus::Signaled(signal as i32)),
        _ => None,
    }
}

fn poll_wait(pid: Pid) -> Result<(Step, Option<ExitStatus>)> {
    match waitpid(pid, Some(WaitPidFlag::WNOHANG)) {
        Ok(status) => match decode_wait(status) {
            Some(status) => Ok((Step::Done, Some(status))),
            None => Ok((Step::Idle, None)),
        },
        Err(Errno::EINTR) => Ok((Step::Idle, None)),
        Err(Errno::ECHILD) => {
            tracing::warn!(pid = pid.as_raw(), "child already reaped elsewhere; no status");
            Ok((Step::Done, None))
        }
        Err(e) => Err(e.into()),
    }
}
