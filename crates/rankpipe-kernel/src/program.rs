//! Program descriptions: things that know how to launch themselves.
//!
//! A [`ProgramDescription`] pushes one or more launch requests into a
//! [`PipelineBuilder`]. The pipeline decides how consecutive requests are
//! wired together; a description only says what to run.
//!
//! - [`Command`]: one program with arguments, environment and directives.
//! - [`Chain`]: several descriptions in sequence, built with `|`.
//! - [`Rank`]: one rank run directly, its environment overrides applied.
//! - [`LaunchedGroup`](crate::launcher::LaunchedGroup): a whole rank tree
//!   compiled into one launcher command line.

use std::collections::BTreeMap;
use std::ops::BitOr;
use std::path::PathBuf;

use rankpipe_types::Rank;

use crate::error::{Error, Result};
use crate::launch::{Env, LaunchRequest, Stdio};
use crate::pipeline::PipelineBuilder;

/// Anything that can emit launch requests into a pipeline.
pub trait ProgramDescription {
    fn emit(&self, pipeline: &mut PipelineBuilder) -> Result<()>;
}

impl<T: ProgramDescription + ?Sized> ProgramDescription for &T {
    fn emit(&self, pipeline: &mut PipelineBuilder) -> Result<()> {
        (**self).emit(pipeline)
    }
}

impl<T: ProgramDescription + ?Sized> ProgramDescription for Box<T> {
    fn emit(&self, pipeline: &mut PipelineBuilder) -> Result<()> {
        (**self).emit(pipeline)
    }
}

/// A single program invocation.
///
/// ```no_run
/// # use rankpipe_kernel::{Command, Pipeline};
/// let mut p = Pipeline::new(&(Command::new("ls").arg("-l") | Command::new("wc").arg("-l")))?;
/// println!("{}", p.communicate()?.out.as_deref().unwrap_or(""));
/// # Ok::<(), rankpipe_kernel::Error>(())
/// ```
#[derive(Debug)]
pub struct Command {
    argv: Vec<String>,
    env: BTreeMap<String, String>,
    env_clear: bool,
    cwd: Option<PathBuf>,
    stdin: Stdio,
    stdout: Stdio,
    stderr: Stdio,
}

impl Command {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            argv: vec![program.into()],
            env: BTreeMap::new(),
            env_clear: false,
            cwd: None,
            stdin: Stdio::Inherit,
            stdout: Stdio::Inherit,
            stderr: Stdio::Inherit,
        }
    }

    /// Build from a full argument vector; the first element is the program.
    pub fn from_argv<I, S>(argv: I) -> Result<Self>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut argv = argv.into_iter().map(Into::into);
        let program = argv
            .next()
            .filter(|p: &String| !p.is_empty())
            .ok_or_else(|| Error::InvalidArgument("empty command".into()))?;
        Ok(Self::new(program).args(argv))
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.argv.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.argv.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    /// Start from an empty environment instead of the caller's.
    pub fn env_clear(mut self) -> Self {
        self.env_clear = true;
        self
    }

    pub fn cwd(mut self, dir: impl Into<PathBuf>) -> Self {
        self.cwd = Some(dir.into());
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

    pub fn argv(&self) -> &[String] {
        &self.argv
    }

    fn environment(&self) -> Env {
        if self.env_clear {
            Env::Exact(self.env.clone())
        } else if self.env.is_empty() {
            Env::Inherit
        } else {
            Env::Overlay(self.env.clone())
        }
    }
}

impl ProgramDescription for Command {
    fn emit(&self, pipeline: &mut PipelineBuilder) -> Result<()> {
        let mut request = LaunchRequest::new(self.argv.iter().cloned())
            .env(self.environment())
            .stdin(self.stdin.try_clone()?)
            .stdout(self.stdout.try_clone()?)
            .stderr(self.stderr.try_clone()?);
        if let Some(cwd) = &self.cwd {
            request = request.cwd(cwd);
        }
        pipeline.push(request);
        Ok(())
    }
}

/// Descriptions run in sequence, each stage's stdout feeding the next.
#[derive(Default)]
pub struct Chain {
    stages: Vec<Box<dyn ProgramDescription>>,
}

impl Chain {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a stage.
    pub fn then(mut self, stage: impl ProgramDescription + 'static) -> Self {
        self.stages.push(Box::new(stage));
        self
    }

    pub fn len(&self) -> usize {
        self.stages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.stages.is_empty()
    }
}

impl std::fmt::Debug for Chain {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Chain").field("stages", &self.stages.len()).finish()
    }
}

impl ProgramDescription for Chain {
    fn emit(&self, pipeline: &mut PipelineBuilder) -> Result<()> {
        for stage in &self.stages {
            stage.emit(pipeline)?;
        }
        Ok(())
    }
}

impl<R: ProgramDescription + 'static> BitOr<R> for Command {
    type Output = Chain;

    fn bitor(self, rhs: R) -> Chain {
        Chain::new().then(self).then(rhs)
    }
}

impl<R: ProgramDescription + 'static> BitOr<R> for Chain {
    type Output = Chain;

    fn bitor(self, rhs: R) -> Chain {
        self.then(rhs)
    }
}

/// A rank run on its own, without a parallel launcher.
///
/// Environment overrides (and the thread count) overlay the caller's
/// environment. Local launch options and the turbo hint only mean something
/// to a launcher, so a rank carrying them is rejected here; bind its group to
/// a [`Launcher`](crate::launcher::Launcher) instead.
impl ProgramDescription for Rank {
    fn emit(&self, pipeline: &mut PipelineBuilder) -> Result<()> {
        if self.has_launch_semantics() {
            return Err(Error::InvalidArgument(format!(
                "{}: rank has launcher options; run it through a launcher",
                self.program()
            )));
        }
        let env = self.effective_env();
        let env = if env.is_empty() { Env::Inherit } else { Env::Overlay(env) };
        pipeline.push(LaunchRequest::new(self.argv().iter().cloned()).env(env));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bitor_builds_a_flat_chain() {
        let chain = Command::new("a") | Command::new("b") | Command::new("c");
        assert_eq!(chain.len(), 3);
        let mut builder = PipelineBuilder::new();
        chain.emit(&mut builder).unwrap();
        let programs: Vec<_> = builder.stages().iter().map(|s| s.argv()[0].clone()).collect();
        assert_eq!(programs, ["a", "b", "c"]);
    }

    #[test]
    fn from_argv_rejects_empty() {
        assert!(Command::from_argv(Vec::<String>::new()).is_err());
        assert!(Command::from_argv([""]).is_err());
        assert_eq!(Command::from_argv(["echo", "hi"]).unwrap().argv(), ["echo", "hi"]);
    }

    #[test]
    fn rank_with_launcher_options_needs_a_launcher() {
        let rank = Rank::new(["a.out"]).unwrap().local_opt("--bind").unwrap();
        assert!(matches!(
            rank.emit(&mut PipelineBuilder::new()),
            Err(Error::InvalidArgument(_))
        ));
    }

    #[test]
    fn rank_threads_become_environment() {
        let rank = Rank::new(["a.out"]).unwrap().threads(3);
        let mut builder = PipelineBuilder::new();
        rank.emit(&mut builder).unwrap();
        let expected = BTreeMap::from([("OMP_NUM_THREADS".to_string(), "3".to_string())]);
        assert_eq!(builder.stages()[0].env, Env::Overlay(expected));
    }
}
