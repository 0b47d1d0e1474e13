//! Argument-list compiler: flattens a rank tree into a launcher command line.
//!
//! ```text
//!   pre..  [before.. args.. after..] between.. [before.. args.. after..] ..  post..
//!          └──────── group 1 ──────┘          └──────── group 2 ──────┘
//! ```
//!
//! Decorations are templates. `%(world)d` expands to the total rank count of
//! the tree and `%(n)d` to the rank count of the current group (`s` works as
//! the conversion too); `%%` is a literal percent sign. In `pre` and `post`,
//! `%(n)d` equals `%(world)d`.

use thiserror::Error;

use rankpipe_types::{Rank, RankGroup};

/// Errors from compiling a rank tree.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CompileError {
    #[error("bad decoration template {template:?}: {reason}")]
    BadTemplate { template: String, reason: String },
    #[error("{program}: rank carries launcher options and cannot be rendered as a shell command")]
    NotShellRepresentable { program: String },
    #[error("shell validator rejected {command:?}: {reason}")]
    Rejected { command: String, reason: String },
}

/// Post-processor for rendered shell commands (e.g. platform quoting).
pub type ShellValidator<'a> = &'a dyn Fn(String) -> Result<String, String>;

/// Extra per-group flags derived from the group's rank (density, turbo, ...).
pub type RankFlags<'a> = &'a dyn Fn(&Rank) -> Vec<String>;

/// How to flatten a tree. Built with chained setters.
#[derive(Default, Clone)]
pub struct ArgListOptions<'a> {
    expand: bool,
    to_shell: bool,
    shell_validate: Option<ShellValidator<'a>>,
    rank_flags: Option<RankFlags<'a>>,
    pre: Vec<String>,
    before: Vec<String>,
    between: Vec<String>,
    after: Vec<String>,
    post: Vec<String>,
}

fn strings<I, S>(items: I) -> Vec<String>
where
    I: IntoIterator<Item = S>,
    S: Into<String>,
{
    items.into_iter().map(Into::into).collect()
}

impl<'a> ArgListOptions<'a> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Emit one segment per rank instead of one per collapsed run.
    pub fn expand(mut self, expand: bool) -> Self {
        self.expand = expand;
        self
    }

    /// Render each segment's command as a single shell-quoted string.
    pub fn to_shell(mut self, to_shell: bool) -> Self {
        self.to_shell = to_shell;
        self
    }

    pub fn shell_validate(mut self, validate: ShellValidator<'a>) -> Self {
        self.shell_validate = Some(validate);
        self
    }

    /// Flags emitted right after `before` for each group, computed from its rank.
    pub fn rank_flags(mut self, flags: RankFlags<'a>) -> Self {
        self.rank_flags = Some(flags);
        self
    }

    pub fn pre<I: IntoIterator<Item = S>, S: Into<String>>(mut self, items: I) -> Self {
        self.pre = strings(items);
        self
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
}

impl std::fmt::Debug for ArgListOptions<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ArgListOptions")
            .field("expand", &self.expand)
            .field("to_shell", &self.to_shell)
            .field("shell_validate", &self.shell_validate.is_some())
            .field("rank_flags", &self.rank_flags.is_some())
            .field("pre", &self.pre)
            .field("before", &self.before)
            .field("between", &self.between)
            .field("after", &self.after)
            .field("post", &self.post)
            .finish()
    }
}

/// Flatten `group` into a launcher argument list.
pub fn to_arg_list(group: &RankGroup, opts: &ArgListOptions<'_>) -> Result<Vec<String>, CompileError> {
    let world = group.nranks();
    let segments = group.segments(opts.expand);

    let mut out = Vec::new();
    push_templates(&mut out, &opts.pre, world, world)?;
    for (i, (rank, count)) in segments.iter().enumerate() {
        if i > 0 {
            push_templates(&mut out, &opts.between, world, *count)?;
        }
        push_templates(&mut out, &opts.before, world, *count)?;
        if let Some(flags) = opts.rank_flags {
            out.extend(flags(*rank));
        }
        if opts.to_shell {
            out.push(render_shell(rank, opts.shell_validate)?);
        } else {
            push_rank(&mut out, rank);
        }
        push_templates(&mut out, &opts.after, world, *count)?;
    }
    push_templates(&mut out, &opts.post, world, world)?;
    Ok(out)
}

/// Raw-argument rendering: local options, an `env` prefix for the effective
/// environment, then the rank's own arguments.
fn push_rank(out: &mut Vec<String>, rank: &Rank) {
    out.extend(rank.local_opts().iter().cloned());
    let env = rank.effective_env();
    if !env.is_empty() {
        out.push("env".to_string());
        out.extend(env.iter().map(|(k, v)| format!("{k}={v}")));
    }
    out.extend(rank.argv().iter().cloned());
}

fn render_shell(rank: &Rank, validate: Option<ShellValidator<'_>>) -> Result<String, CompileError> {
    if rank.has_launch_semantics() {
        return Err(CompileError::NotShellRepresentable {
            program: rank.program().to_string(),
        });
    }
    let command = rank.to_shell();
    match validate {
        Some(validate) => validate(command.clone())
            .map_err(|reason| CompileError::Rejected { command, reason }),
        None => Ok(command),
    }
}

fn push_templates(
    out: &mut Vec<String>,
    templates: &[String],
    world: usize,
    n: usize,
) -> Result<(), CompileError> {
    for template in templates {
        out.push(substitute(template, world, n)?);
    }
    Ok(())
}

/// Expand `%(world)d`, `%(n)d` and `%%` in one template.
pub fn substitute(template: &str, world: usize, n: usize) -> Result<String, CompileError> {
    let bad = |reason: &str| CompileError::BadTemplate {
        template: template.to_string(),
        reason: reason.to_string(),
    };

    let mut out = String::with_capacity(template.len());
    let mut chars = template.chars();
    while let Some(c) = chars.next() {
        if c != '%' {
            out.push(c);
            continue;
        }
        match chars.next() {
            Some('%') => out.push('%'),
            Some('(') => {
                let mut key = String::new();
                loop {
                    match chars.next() {
                        Some(')') => break,
                        Some(k) => key.push(k),
                        None => return Err(bad("unterminated %( key")),
                    }
                }
                match chars.next() {
                    Some('d' | 's') => {}
                    Some(other) => return Err(bad(&format!("unsupported conversion '{other}'"))),
                    None => return Err(bad("missing conversion after key")),
                }
                let value = match key.as_str() {
                    "world" => world,
                    "n" => n,
                    other => return Err(bad(&format!("unknown key '{other}'"))),
                };
                out.push_str(&value.to_string());
            }
            Some(other) => return Err(bad(&format!("unexpected '%{other}'"))),
            None => return Err(bad("dangling '%'")),
        }
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn substitutes_counts() {
        assert_eq!(substitute("-n %(n)d", 8, 3).unwrap(), "-n 3");
        assert_eq!(substitute("%(world)s ranks", 8, 3).unwrap(), "8 ranks");
        assert_eq!(substitute("100%%", 1, 1).unwrap(), "100%");
        assert_eq!(substitute("plain", 1, 1).unwrap(), "plain");
    }

    #[test]
    fn rejects_bad_templates() {
        for template in ["%(nodes)d", "%(n", "%(n)", "%(n)x", "50%", "%d"] {
            assert!(
                matches!(substitute(template, 1, 1), Err(CompileError::BadTemplate { .. })),
                "{template} should be rejected"
            );
        }
    }

    #[test]
    fn local_opts_precede_env_and_args() {
        let rank = Rank::new(["a.out"])
            .unwrap()
            .local_opt("--cpu-bind=core")
            .unwrap()
            .threads(2);
        let mut out = Vec::new();
        push_rank(&mut out, &rank);
        assert_eq!(out, ["--cpu-bind=core", "env", "OMP_NUM_THREADS=2", "a.out"]);
    }
}
