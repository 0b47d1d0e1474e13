//! Parallel launchers: run a whole rank tree as one command line.
//!
//! A [`Launcher`] is a set of argument-list decorations. Binding a rank group
//! to it yields a [`LaunchedGroup`], which compiles the collapsed tree
//! through [`to_arg_list`] and launches the result as a single process:
//!
//! ```text
//!   (a.out × 3) + (b.out × 2)   ──mpiexec()──▶   mpiexec -n 3 a.out : -n 2 b.out
//! ```

use rankpipe_types::{Rank, RankGroup, Turbo};

use crate::arglist::{ArgListOptions, CompileError, to_arg_list};
use crate::error::{Error, Result};
use crate::launch::LaunchRequest;
use crate::pipeline::PipelineBuilder;
use crate::program::ProgramDescription;

fn strings<I, S>(items: I) -> Vec<String>
where
    I: IntoIterator<Item = S>,
    S: Into<String>,
{
    items.into_iter().map(Into::into).collect()
}

/// Decorations for one launcher program.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Launcher {
    pre: Vec<String>,
    before: Vec<String>,
    between: Vec<String>,
    after: Vec<String>,
    post: Vec<String>,
    expand: bool,
    shell: bool,
    density_flag: Option<String>,
    turbo_flags: Option<(String, String)>,
}

impl Launcher {
    /// A launcher invoked as `pre...`, with no per-group decorations yet.
    pub fn new<I, S>(pre: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            pre: strings(pre),
            before: Vec::new(),
            between: Vec::new(),
            after: Vec::new(),
            post: Vec::new(),
            expand: false,
            shell: false,
            density_flag: None,
            turbo_flags: None,
        }
    }

    /// MPMD-style `mpiexec -n N prog : -n M prog2`.
    pub fn mpiexec() -> Self {
        Self::mpiexec_style("mpiexec")
    }

    /// The `mpiexec` decorations under another program name (`mpirun`, a wrapper, ...).
    pub fn mpiexec_style(program: impl Into<String>) -> Self {
        Self::new([program.into()]).before(["-n", "%(n)d"]).between([":"])
    }

    pub fn before<I: IntoIterator<Item = S>, S: Into<String>>(mut self, items: I) -> Self {
        self.before = strings(items);
        self
    }

    pub fn between<I: IntoIterator<Item = S>, S: Into<String>>(mut self, items: I) -> Self {
        self.between = strings(items);
        self
    }

    pub fn after<I: IntoIterator<Item = S>, S: Into<String>>(mut self, items: I) -> Self {
        self.after = strings(items);
        self
    }

    pub fn post<I: IntoIterator<Item = S>, S: Into<String>>(mut self, items: I) -> Self {
        self.post = strings(items);
        self
    }

    /// One segment per rank instead of one per collapsed run.
    pub fn expand(mut self, expand: bool) -> Self {
        self.expand = expand;
        self
    }

    /// Render each group's command as one shell-quoted word.
    pub fn to_shell(mut self, shell: bool) -> Self {
        self.shell = shell;
        self
    }

    /// Flag carrying a group's ranks-per-node hint, e.g. `-ppn`. Emitted
    /// only for ranks whose density is set.
    pub fn density_flag(mut self, flag: impl Into<String>) -> Self {
        self.density_flag = Some(flag.into());
        self
    }

    /// Flags for an explicit turbo setting, on and off respectively.
    pub fn turbo_flags(mut self, on: impl Into<String>, off: impl Into<String>) -> Self {
        self.turbo_flags = Some((on.into(), off.into()));
        self
    }

    fn rank_flags(&self, rank: &Rank) -> Vec<String> {
        let mut flags = Vec::new();
        if let Some(flag) = &self.density_flag
            && rank.density() > 0
        {
            flags.push(flag.clone());
            flags.push(rank.density().to_string());
        }
        if let Some((on, off)) = &self.turbo_flags {
            match rank.turbo_flag() {
                Turbo::On => flags.push(on.clone()),
                Turbo::Off => flags.push(off.clone()),
                Turbo::Unset => {}
            }
        }
        flags
    }

    /// Compile `group` into this launcher's command line.
    ///
    /// The group is collapsed first so adjacent identical runs become one
    /// segment.
    pub fn arg_list(&self, group: &RankGroup) -> std::result::Result<Vec<String>, CompileError> {
        let flags = |rank: &Rank| self.rank_flags(rank);
        let opts = ArgListOptions::new()
            .expand(self.expand)
            .to_shell(self.shell)
            .rank_flags(&flags)
            .pre(self.pre.iter().cloned())
            .before(self.before.iter().cloned())
            .between(self.between.iter().cloned())
            .after(self.after.iter().cloned())
            .post(self.post.iter().cloned());
        to_arg_list(&group.collapse(), &opts)
    }

    /// Pair `group` with this launcher so it can run as a pipeline.
    pub fn bind<'a>(&'a self, group: &'a RankGroup) -> LaunchedGroup<'a> {
        LaunchedGroup {
            launcher: self,
            group,
        }
    }
}

/// A rank group and the launcher that will start it.
#[derive(Debug, Clone, Copy)]
pub struct LaunchedGroup<'a> {
    launcher: &'a Launcher,
    group: &'a RankGroup,
}

impl LaunchedGroup<'_> {
    pub fn arg_list(&self) -> std::result::Result<Vec<String>, CompileError> {
        self.launcher.arg_list(self.group)
    }
}

impl ProgramDescription for LaunchedGroup<'_> {
    fn emit(&self, pipeline: &mut PipelineBuilder) -> Result<()> {
        if self.group.is_empty() {
            return Err(Error::InvalidArgument("rank group has no ranks".into()));
        }
        let argv = self.arg_list()?;
        tracing::debug!(nranks = self.group.nranks(), argv = ?argv, "compiled rank group");
        pipeline.push(LaunchRequest::new(argv));
        Ok(())
    }
}
