//! Pipeline façade: launch a chain of programs and collect what they produce.
//!
//! ```text
//!   input ──▶ [stage 0] ──pipe──▶ [stage 1] ──pipe──▶ … ──▶ [stage N] ──▶ out
//!                 │                   │                         │
//!                 └──────────── stderr (optionally captured) ───┘
//! ```
//!
//! A program description emits one launch request per stage into a
//! [`PipelineBuilder`]. [`Pipeline::new`] starts every stage, wiring each
//! stage's stdout into the next one's stdin, and registers the children with
//! a [`ProcessRegistry`]. [`Pipeline::communicate`] then hands all parent-side
//! descriptors and child pids to [`manage`] exactly once.

use std::collections::BTreeMap;
use std::os::fd::OwnedFd;

use nix::errno::Errno;
use nix::sys::signal::{Signal, kill};
use nix::sys::wait::{WaitPidFlag, waitpid};
use nix::unistd::Pid;

use rankpipe_types::ExitStatus;

use crate::config::ManageConfig;
use crate::error::{Error, Result};
use crate::launch::{LaunchRequest, Stdio, launch};
use crate::manage::{StreamKind, WorkList, decode_wait, drive, kill_and_reap};
use crate::program::ProgramDescription;
use crate::registry::ProcessRegistry;

/// Collects the launch requests a program description emits.
#[derive(Debug, Default)]
pub struct PipelineBuilder {
    stages: Vec<LaunchRequest>,
}

impl PipelineBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a stage. Its stdin is fed from the previous stage's stdout
    /// unless it was given an explicit directive.
    pub fn push(&mut self, request: LaunchRequest) -> &mut Self {
        self.stages.push(request);
        self
    }

    pub fn len(&self) -> usize {
        self.stages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.stages.is_empty()
    }

    pub fn stages(&self) -> &[LaunchRequest] {
        &self.stages
    }
}

/// How a pipeline is run.
#[derive(Debug, Clone)]
pub struct PipelineOptions {
    config: ManageConfig,
    input: Option<Vec<u8>>,
    capture_stdout: bool,
    capture_stderr: bool,
    registry: ProcessRegistry,
}

impl Default for PipelineOptions {
    fn default() -> Self {
        Self {
            config: ManageConfig::default(),
            input: None,
            capture_stdout: true,
            capture_stderr: false,
            registry: ProcessRegistry::global().clone(),
        }
    }
}

impl PipelineOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn config(mut self, config: ManageConfig) -> Self {
        self.config = config;
        self
    }

    /// Payload written to the first stage's stdin, which is then closed.
    pub fn input(mut self, input: impl Into<Vec<u8>>) -> Self {
        self.input = Some(input.into());
        self
    }

    /// Capture the last stage's stdout (on by default).
    pub fn capture_stdout(mut self, capture: bool) -> Self {
        self.capture_stdout = capture;
        self
    }

    /// Capture stderr of every stage whose stderr is not otherwise directed.
    pub fn capture_stderr(mut self, capture: bool) -> Self {
        self.capture_stderr = capture;
        self
    }

    pub fn registry(mut self, registry: ProcessRegistry) -> Self {
        self.registry = registry;
        self
    }
}

/// Output collected by [`Pipeline::communicate`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Captured {
    pub out: Option<String>,
    pub err: Option<String>,
}

/// A running (or finished) chain of processes.
#[derive(Debug)]
pub struct Pipeline {
    pids: Vec<Pid>,
    work: Option<WorkList>,
    captured: Option<Captured>,
    statuses: BTreeMap<Pid, ExitStatus>,
    config: ManageConfig,
    registry: ProcessRegistry,
}

impl Pipeline {
    /// Launch `program` with default options.
    pub fn new(program: &dyn ProgramDescription) -> Result<Self> {
        Self::with_options(program, PipelineOptions::default())
    }

    /// Launch `program`.
    pub fn with_options(program: &dyn ProgramDescription, options: PipelineOptions) -> Result<Self> {
        let mut builder = PipelineBuilder::new();
        program.emit(&mut builder)?;
        Self::launch(builder, options)
    }

    /// Launch the stages already collected in `builder`.
    #[tracing::instrument(level = "debug", skip_all, fields(stages = builder.len()))]
    pub fn launch(builder: PipelineBuilder, options: PipelineOptions) -> Result<Self> {
        let PipelineOptions {
            config,
            input,
            capture_stdout,
            capture_stderr,
            registry,
        } = options;

        if builder.is_empty() {
            return Err(Error::EmptyPipeline);
        }
        if input.is_some() && !builder.stages[0].stdin.is_inherit() {
            return Err(Error::InvalidArgument(
                "pipeline input given but the first stage already has a stdin directive".into(),
            ));
        }
        registry.check_open()?;

        let last = builder.len() - 1;
        let mut work = WorkList::new();
        let mut pids = Vec::with_capacity(builder.len());
        let mut input = input;
        let mut upstream: Option<OwnedFd> = None;

        for (i, mut request) in builder.stages.into_iter().enumerate() {
            if i == 0 {
                if input.is_some() && request.stdin.is_inherit() {
                    request.stdin = Stdio::Pipe;
                }
            } else if let Some(fd) = upstream.take()
                && request.stdin.is_inherit()
            {
                request.stdin = Stdio::Fd(fd);
            }
            if request.stdout.is_inherit() && (i < last || capture_stdout) {
                request.stdout = Stdio::Pipe;
            }
            if capture_stderr && request.stderr.is_inherit() {
                request.stderr = Stdio::Pipe;
            }

            let launched = match launch(request) {
                Ok(launched) => launched,
                Err(e) => {
                    abort(&pids, &registry);
                    return Err(e);
                }
            };
            pids.push(launched.pid);
            if let Err(e) = registry.register(launched.pid) {
                abort(&pids, &registry);
                return Err(e);
            }

            if let Some(fd) = launched.stdin {
                match input.take() {
                    Some(payload) if i == 0 => {
                        work.write(fd, payload);
                    }
                    // Nothing to send: closing the end gives the child EOF.
                    _ => drop(fd),
                }
            }
            if let Some(fd) = launched.stdout {
                if i < last {
                    upstream = Some(fd);
                } else {
                    work.read(fd, StreamKind::Stdout);
                }
            }
            if let Some(fd) = launched.stderr {
                work.read(fd, StreamKind::Stderr);
            }
        }

        tracing::debug!(pids = ?pids, "pipeline launched");
        Ok(Self {
            pids,
            work: Some(work),
            captured: None,
            statuses: BTreeMap::new(),
            config,
            registry,
        })
    }

    /// Feed input, drain output, and reap every stage.
    ///
    /// The first call runs the driver; later calls return the same result
    /// without touching any process or descriptor.
    ///
    /// If the registry shuts down meanwhile, every stage is killed and
    /// reaped and [`Error::NoMoreProcesses`] is returned.
    pub fn communicate(&mut self) -> Result<&Captured> {
        if self.captured.is_none() {
            let mut work = self.work.take().unwrap_or_default();
            for pid in &self.pids {
                if !self.statuses.contains_key(pid) {
                    work.wait(*pid);
                }
            }
            tracing::debug!(pids = ?self.pids, entries = work.len(), "communicate");
            let (out, err) = drive(work, &self.config, &self.registry, &mut self.statuses)?;
            self.captured = Some(Captured { out, err });
        }
        Ok(self.captured.get_or_insert_with(Captured::default))
    }

    /// Exit code of the last stage, if it has finished: its exit status, or
    /// the negated signal number when a signal killed it.
    ///
    /// Never blocks.
    pub fn poll(&mut self) -> Option<i32> {
        let pid = *self.pids.last()?;
        if let Some(status) = self.statuses.get(&pid) {
            return Some(status.code());
        }
        match waitpid(pid, Some(WaitPidFlag::WNOHANG)) {
            Ok(status) => {
                let status = decode_wait(status)?;
                self.registry.forget(pid);
                self.statuses.insert(pid, status);
                Some(status.code())
            }
            Err(Errno::EINTR) => None,
            Err(e) => {
                tracing::warn!(pid = pid.as_raw(), error = %e, "poll failed");
                None
            }
        }
    }

    /// Send `signal` to every stage not yet reaped.
    pub fn signal(&self, signal: Signal) -> Result<()> {
        for pid in self.pids.iter().filter(|pid| !self.statuses.contains_key(pid)) {
            match kill(*pid, signal) {
                Ok(()) | Err(Errno::ESRCH) => {}
                Err(e) => return Err(e.into()),
            }
        }
        Ok(())
    }

    pub fn terminate(&self) -> Result<()> {
        self.signal(Signal::SIGTERM)
    }

    pub fn kill(&self) -> Result<()> {
        self.signal(Signal::SIGKILL)
    }

    /// Captured stdout of the last stage, once communicated.
    pub fn out(&self) -> Option<&str> {
        self.captured.as_ref()?.out.as_deref()
    }

    /// Captured stderr, once communicated.
    pub fn err(&self) -> Option<&str> {
        self.captured.as_ref()?.err.as_deref()
    }

    /// Status of the last stage, if reaped.
    pub fn status(&self) -> Option<ExitStatus> {
        self.statuses.get(self.pids.last()?).copied()
    }

    /// Statuses of every reaped stage.
    pub fn statuses(&self) -> &BTreeMap<Pid, ExitStatus> {
        &self.statuses
    }

    /// Stage pids in pipeline order.
    pub fn pids(&self) -> &[Pid] {
        &self.pids
    }

    /// True once [`communicate`](Self::communicate) has completed.
    pub fn is_done(&self) -> bool {
        self.captured.is_some()
    }
}

/// Kill and reap stages started before a failed launch.
fn abort(pids: &[Pid], registry: &ProcessRegistry) {
    for &pid in pids {
        kill_and_reap(pid);
        registry.forget(pid);
    }
    if !pids.is_empty() {
        tracing::debug!(pids = ?pids, "aborted partially launched pipeline");
    }
}
