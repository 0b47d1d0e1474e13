//! Process launcher: allocate pipes, fork, wire standard streams, exec.
//!
//! ```text
//!   parent                               child
//!   ──────                               ─────
//!   resolve program, build argv/envp
//!   lock LAUNCH_LOCK
//!   pipe() + FD_CLOEXEC  ─────────────▶  (inherits both ends)
//!   fork() ───────────────────────────▶  chdir(cwd)
//!                                        dup2(ends → 0/1/2), close ends
//!                                        reset signal dispositions + mask
//!                                        execve() or _exit(126/127)
//!   close child ends, unlock
//!   return pid + parent ends
//! ```
//!
//! Everything the child touches is allocated before `fork()`; after it the
//! child only makes async-signal-safe calls, so launching from a
//! multi-threaded program is sound.

use std::collections::BTreeMap;
use std::ffi::{CString, OsString};
use std::fs::OpenOptions;
use std::os::fd::{AsRawFd, OwnedFd, RawFd};
use std::os::unix::ffi::{OsStrExt, OsStringExt};
use std::path::{Path, PathBuf};
use std::ptr;
use std::sync::Mutex;

use nix::errno::Errno;
use nix::fcntl::{FcntlArg, FdFlag, fcntl};
use nix::libc;
use nix::sys::signal::{SaFlags, SigAction, SigHandler, SigSet, SigmaskHow, Signal, sigaction, sigprocmask};
use nix::unistd::{ForkResult, Pid, fork, pipe};

use crate::error::{Error, Result};

/// Exit status of a child whose program could not be found.
pub const EXIT_NOT_FOUND: i32 = 127;

/// Exit status of a child that could not be set up or exec'd.
pub const EXIT_NOT_EXECUTABLE: i32 = 126;

/// Serializes pipe allocation against fork.
///
/// Pipe ends are marked close-on-exec right after creation; holding this
/// lock across both steps and across `fork()` means no child can inherit a
/// pipe another thread has not yet marked. Never taken by the I/O driver.
static LAUNCH_LOCK: Mutex<()> = Mutex::new(());

/// What to connect a child's standard stream to.
#[derive(Debug, Default)]
pub enum Stdio {
    /// Share the caller's descriptor.
    #[default]
    Inherit,
    /// Create a pipe; the caller receives the other end.
    Pipe,
    /// Send stderr wherever stdout goes. Only valid for stderr.
    MergeWithStdout,
    /// Connect to `/dev/null`.
    Null,
    /// Hand over an existing descriptor (e.g. the read end of a previous stage).
    Fd(OwnedFd),
}

impl Stdio {
    pub fn is_inherit(&self) -> bool {
        matches!(self, Stdio::Inherit)
    }

    /// Duplicate the directive; an `Fd` gets its own descriptor.
    pub fn try_clone(&self) -> std::io::Result<Stdio> {
        Ok(match self {
            Stdio::Inherit => Stdio::Inherit,
            Stdio::Pipe => Stdio::Pipe,
            Stdio::MergeWithStdout => Stdio::MergeWithStdout,
            Stdio::Null => Stdio::Null,
            Stdio::Fd(fd) => Stdio::Fd(fd.try_clone()?),
        })
    }
}

/// Environment for the child.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum Env {
    /// The caller's environment, unchanged.
    #[default]
    Inherit,
    /// The caller's environment with these variables set.
    Overlay(BTreeMap<String, String>),
    /// Exactly these variables.
    Exact(BTreeMap<String, String>),
}

/// One process to start.
#[derive(Debug)]
pub struct LaunchRequest {
    pub(crate) argv: Vec<String>,
    pub(crate) env: Env,
    pub(crate) stdin: Stdio,
    pub(crate) stdout: Stdio,
    pub(crate) stderr: Stdio,
    pub(crate) cwd: Option<PathBuf>,
}

impl LaunchRequest {
    pub fn new<I, S>(argv: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            argv: argv.into_iter().map(Into::into).collect(),
            env: Env::Inherit,
            stdin: Stdio::Inherit,
            stdout: Stdio::Inherit,
            stderr: Stdio::Inherit,
            cwd: None,
        }
    }

    pub fn env(mut self, env: Env) -> Self {
        self.env = env;
        self
    }

    pub fn stdin(mut self, stdin: Stdio) -> Self {
        self.stdin = stdin;
        self
    }

    pub fn stdout(mut self, stdout: Stdio) -> Self {
        self.stdout = stdout;
        self
    }

    pub fn stderr(mut self, stderr: Stdio) -> Self {
        self.stderr = stderr;
        self
    }

    pub fn cwd(mut self, cwd: impl Into<PathBuf>) -> Self {
        self.cwd = Some(cwd.into());
        self
    }

    pub fn argv(&self) -> &[String] {
        &self.argv
    }
}

/// A started process and the caller's ends of any pipes it asked for.
#[derive(Debug)]
pub struct Launched {
    pub pid: Pid,
    /// Write end feeding the child's stdin.
    pub stdin: Option<OwnedFd>,
    /// Read end of the child's stdout.
    pub stdout: Option<OwnedFd>,
    /// Read end of the child's stderr.
    pub stderr: Option<OwnedFd>,
}

/// Everything `execve` needs, built before forking.
struct ExecImage {
    /// Resolved program; `None` makes the child exit with [`EXIT_NOT_FOUND`].
    path: Option<CString>,
    argv: Vec<CString>,
    envp: Vec<CString>,
    cwd: Option<CString>,
}

fn cstring(bytes: impl Into<Vec<u8>>, what: &str) -> Result<CString> {
    CString::new(bytes).map_err(|_| Error::InvalidArgument(format!("{what} contains a NUL byte")))
}

fn null_terminated(strings: &[CString]) -> Vec<*const libc::c_char> {
    strings
        .iter()
        .map(|s| s.as_ptr())
        .chain(std::iter::once(ptr::null()))
        .collect()
}

impl ExecImage {
    fn new(argv: &[String], env: &Env, cwd: Option<&Path>) -> Result<Self> {
        let program = argv
            .first()
            .ok_or_else(|| Error::InvalidArgument("empty argument list".into()))?;

        let path = if program.contains('/') {
            Some(PathBuf::from(program))
        } else {
            let path_var = std::env::var("PATH").unwrap_or_default();
            resolve_in_path(program, &path_var)
        };
        if path.is_none() {
            tracing::debug!(program = %program, "not found in PATH; child will exit {}", EXIT_NOT_FOUND);
        }

        Ok(Self {
            path: path
                .map(|p| cstring(p.into_os_string().into_vec(), "program path"))
                .transpose()?,
            argv: argv
                .iter()
                .map(|a| cstring(a.as_bytes(), "argument"))
                .collect::<Result<_>>()?,
            envp: build_envp(env)?,
            cwd: cwd
                .map(|c| cstring(c.as_os_str().as_bytes(), "working directory"))
                .transpose()?,
        })
    }
}

fn build_envp(env: &Env) -> Result<Vec<CString>> {
    let (mut vars, overrides): (BTreeMap<OsString, OsString>, _) = match env {
        Env::Inherit => (std::env::vars_os().collect(), None),
        Env::Overlay(map) => (std::env::vars_os().collect(), Some(map)),
        Env::Exact(map) => (BTreeMap::new(), Some(map)),
    };
    for (key, value) in overrides.into_iter().flatten() {
        if key.is_empty() || key.contains('=') {
            return Err(Error::InvalidArgument(format!("invalid environment variable name: {key:?}")));
        }
        vars.insert(key.into(), value.into());
    }
    vars.into_iter()
        .map(|(key, value)| {
            let mut entry = key.into_vec();
            entry.push(b'=');
            entry.extend(value.into_vec());
            cstring(entry, "environment entry")
        })
        .collect()
}

/// Resolve a command name in PATH.
///
/// Searches each directory in `path_var` (colon-separated) for an executable
/// file named `name`. Returns the full path if found.
pub fn resolve_in_path(name: &str, path_var: &str) -> Option<PathBuf> {
    use std::os::unix::fs::PermissionsExt;

    for dir in path_var.split(':') {
        if dir.is_empty() {
            continue;
        }
        let candidate = Path::new(dir).join(name);
        if let Ok(metadata) = candidate.metadata()
            && metadata.is_file()
            && metadata.permissions().mode() & 0o111 != 0
        {
            return Some(candidate);
        }
    }
    None
}

/// A pipe whose ends are both close-on-exec. Caller holds `LAUNCH_LOCK`.
fn cloexec_pipe() -> Result<(OwnedFd, OwnedFd)> {
    let (read, write) = pipe()?;
    for fd in [&read, &write] {
        fcntl(fd.as_raw_fd(), FcntlArg::F_SETFD(FdFlag::FD_CLOEXEC))?;
    }
    Ok((read, write))
}

fn dev_null(writable: bool) -> Result<OwnedFd> {
    let file = OpenOptions::new()
        .read(!writable)
        .write(writable)
        .open("/dev/null")?;
    Ok(OwnedFd::from(file))
}

/// Split a directive into (child end, parent end). `child_reads` is true for stdin.
fn stream_ends(spec: Stdio, child_reads: bool) -> Result<(Option<OwnedFd>, Option<OwnedFd>)> {
    match spec {
        Stdio::Inherit => Ok((None, None)),
        Stdio::Pipe => {
            let (read, write) = cloexec_pipe()?;
            if child_reads {
                Ok((Some(read), Some(write)))
            } else {
                Ok((Some(write), Some(read)))
            }
        }
        Stdio::Null => Ok((Some(dev_null(!child_reads)?), None)),
        Stdio::Fd(fd) => Ok((Some(fd), None)),
        Stdio::MergeWithStdout => Err(Error::InvalidArgument(
            "only stderr can be merged with stdout".into(),
        )),
    }
}

/// Start a process.
///
/// Returns once the child exists; exec failures are reported later through
/// its exit status ([`EXIT_NOT_FOUND`], [`EXIT_NOT_EXECUTABLE`]). Pipe or
/// fork failures are returned as errors, with every descriptor allocated so
/// far closed.
#[tracing::instrument(level = "debug", skip(req), fields(program = req.argv.first().map(String::as_str).unwrap_or("")))]
pub fn launch(req: LaunchRequest) -> Result<Launched> {
    let LaunchRequest {
        argv,
        env,
        stdin,
        stdout,
        stderr,
        cwd,
    } = req;

    let image = ExecImage::new(&argv, &env, cwd.as_deref())?;
    let argv_ptrs = null_terminated(&image.argv);
    let envp_ptrs = null_terminated(&image.envp);

    let _guard = LAUNCH_LOCK.lock().unwrap_or_else(|e| e.into_inner());

    let (child_in, parent_in) = stream_ends(stdin, true)?;
    let (child_out, parent_out) = stream_ends(stdout, false)?;
    let merge_stderr = matches!(stderr, Stdio::MergeWithStdout);
    let (child_err, parent_err) = if merge_stderr {
        (None, None)
    } else {
        stream_ends(stderr, false)?
    };

    let targets = [
        child_in.as_ref().map(AsRawFd::as_raw_fd),
        child_out.as_ref().map(AsRawFd::as_raw_fd),
        child_err.as_ref().map(AsRawFd::as_raw_fd),
    ];

    // SAFETY: the child branch only touches memory prepared above and makes
    // async-signal-safe calls before execve or _exit.
    match unsafe { fork() }? {
        ForkResult::Child => unsafe { exec_child(&image, &argv_ptrs, &envp_ptrs, targets, merge_stderr) },
        ForkResult::Parent { child } => {
            drop((child_in, child_out, child_err));
            tracing::debug!(pid = child.as_raw(), argv = ?argv, "launched");
            Ok(Launched {
                pid: child,
                stdin: parent_in,
                stdout: parent_out,
                stderr: parent_err,
            })
        }
    }
}

/// Child side of [`launch`]. Never returns.
///
/// # Safety
///
/// Must only be called in a freshly forked child. All pointers must come
/// from `image` and stay valid until `execve`.
unsafe fn exec_child(
    image: &ExecImage,
    argv: &[*const libc::c_char],
    envp: &[*const libc::c_char],
    targets: [Option<RawFd>; 3],
    merge_stderr: bool,
) -> ! {
    unsafe {
        if let Some(cwd) = &image.cwd
            && libc::chdir(cwd.as_ptr()) != 0
        {
            libc::_exit(EXIT_NOT_EXECUTABLE);
        }

        // Lift sources off 0..=2 first so no dup2 clobbers a later source.
        let mut fds = targets;
        for fd in fds.iter_mut().flatten() {
            if *fd <= 2 {
                let moved = libc::fcntl(*fd, libc::F_DUPFD_CLOEXEC, 3);
                if moved < 0 {
                    libc::_exit(EXIT_NOT_EXECUTABLE);
                }
                *fd = moved;
            }
        }
        for (target, fd) in fds.iter().enumerate() {
            if let Some(fd) = fd
                && libc::dup2(*fd, target as libc::c_int) < 0
            {
                libc::_exit(EXIT_NOT_EXECUTABLE);
            }
        }
        if merge_stderr && libc::dup2(1, 2) < 0 {
            libc::_exit(EXIT_NOT_EXECUTABLE);
        }
        for fd in fds.iter().flatten() {
            libc::close(*fd);
        }

        let default = SigAction::new(SigHandler::SigDfl, SaFlags::empty(), SigSet::empty());
        for signal in Signal::iterator() {
            if signal != Signal::SIGKILL && signal != Signal::SIGSTOP {
                let _ = sigaction(signal, &default);
            }
        }
        let _ = sigprocmask(SigmaskHow::SIG_SETMASK, Some(&SigSet::empty()), None);

        match &image.path {
            Some(path) => {
                libc::execve(path.as_ptr(), argv.as_ptr(), envp.as_ptr());
                let code = if Errno::last() == Errno::ENOENT {
                    EXIT_NOT_FOUND
                } else {
                    EXIT_NOT_EXECUTABLE
                };
                libc::_exit(code)
            }
            None => libc::_exit(EXIT_NOT_FOUND),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resolves_sh() {
        let path = resolve_in_path("sh", "/nonexistent:/bin:/usr/bin");
        assert!(path.is_some(), "sh should be in /bin or /usr/bin");
    }

    #[test]
    fn unresolvable_is_none() {
        assert!(resolve_in_path("definitely_not_a_real_command_12345", "/bin:/usr/bin").is_none());
        assert!(resolve_in_path("sh", "").is_none());
    }

    #[test]
    fn exact_env_contains_only_given_vars() {
        let env = Env::Exact(BTreeMap::from([("A".to_string(), "1".to_string())]));
        let envp = build_envp(&env).unwrap();
        assert_eq!(envp, vec![CString::new("A=1").unwrap()]);
    }

    #[test]
    fn overlay_rejects_bad_key() {
        let env = Env::Overlay(BTreeMap::from([("A=B".to_string(), "1".to_string())]));
        assert!(matches!(build_envp(&env), Err(Error::InvalidArgument(_))));
    }

    #[test]
    fn merge_only_valid_for_stderr() {
        let req = LaunchRequest::new(["true"]).stdout(Stdio::MergeWithStdout);
        assert!(matches!(launch(req), Err(Error::InvalidArgument(_))));
    }

    #[test]
    fn empty_argv_rejected() {
        let req = LaunchRequest::new(Vec::<String>::new());
        assert!(matches!(launch(req), Err(Error::InvalidArgument(_))));
    }
}
