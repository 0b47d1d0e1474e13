//! A single rank: one executable with arguments and launch attributes.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::GroupError;

/// Environment variable that carries a rank's thread count.
pub const THREADS_ENV: &str = "OMP_NUM_THREADS";

/// Tri-state "turbo" hint passed to the launch layer.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Turbo {
    /// No preference; the launcher decides.
    #[default]
    Unset,
    On,
    Off,
}

impl Turbo {
    pub fn is_set(self) -> bool {
        self != Turbo::Unset
    }
}

/// One unit of execution within a job.
///
/// A rank is an immutable value: every setter consumes `self` and returns a
/// new rank. Arguments and environment values are checked at construction so
/// that anything reaching the launcher can be handed to `execve` as-is.
///
/// Equality is structural over every field. Two ranks that compare equal
/// launch identically, which is what makes collapsing them into one SPMD
/// group safe.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "RankSpec")]
pub struct Rank {
    args: Vec<String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    env: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    threads: Option<u32>,
    #[serde(default, skip_serializing_if = "is_zero")]
    ranks_per_node: u32,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    local_opts: Vec<String>,
    #[serde(default, skip_serializing_if = "is_unset")]
    turbo: Turbo,
}

fn is_zero(n: &u32) -> bool {
    *n == 0
}

fn is_unset(t: &Turbo) -> bool {
    !t.is_set()
}

/// Unchecked wire form of a rank, validated into `Rank` on deserialize.
#[derive(Deserialize)]
struct RankSpec {
    args: Vec<String>,
    #[serde(default)]
    env: BTreeMap<String, String>,
    #[serde(default)]
    threads: Option<u32>,
    #[serde(default)]
    ranks_per_node: u32,
    #[serde(default)]
    local_opts: Vec<String>,
    #[serde(default)]
    turbo: Turbo,
}

impl TryFrom<RankSpec> for Rank {
    type Error = GroupError;

    fn try_from(spec: RankSpec) -> Result<Self, Self::Error> {
        let mut rank = Rank::new(spec.args)?;
        for (key, value) in spec.env {
            rank = rank.env(key, value)?;
        }
        for opt in spec.local_opts {
            rank = rank.local_opt(opt)?;
        }
        rank.threads = spec.threads;
        rank.ranks_per_node = spec.ranks_per_node;
        rank.turbo = spec.turbo;
        Ok(rank)
    }
}

fn check_arg(arg: &str) -> Result<(), GroupError> {
    if arg.contains('\0') {
        return Err(GroupError::NulByte(arg.replace('\0', "\\0")));
    }
    Ok(())
}

impl Rank {
    /// Create a rank from an executable and its arguments.
    ///
    /// The first element is the program. Fails if the list is empty or any
    /// element contains a NUL byte.
    pub fn new<I, S>(args: I) -> Result<Self, GroupError>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let args: Vec<String> = args.into_iter().map(Into::into).collect();
        if args.is_empty() || args[0].is_empty() {
            return Err(GroupError::EmptyArgs);
        }
        for arg in &args {
            check_arg(arg)?;
        }
        Ok(Self {
            args,
            env: BTreeMap::new(),
            threads: None,
            ranks_per_node: 0,
            local_opts: Vec::new(),
            turbo: Turbo::Unset,
        })
    }

    /// Append arguments.
    pub fn args<I, S>(mut self, more: I) -> Result<Self, GroupError>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        for arg in more {
            let arg = arg.into();
            check_arg(&arg)?;
            self.args.push(arg);
        }
        Ok(self)
    }

    /// Add an environment override.
    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Result<Self, GroupError> {
        let key = key.into();
        let value = value.into();
        if key.is_empty() || key.contains('=') || key.contains('\0') {
            return Err(GroupError::InvalidEnvKey(key));
        }
        check_arg(&value)?;
        self.env.insert(key, value);
        Ok(self)
    }

    /// Add an implementation-local launch option, passed to the launcher untouched.
    pub fn local_opt(mut self, opt: impl Into<String>) -> Result<Self, GroupError> {
        let opt = opt.into();
        check_arg(&opt)?;
        self.local_opts.push(opt);
        Ok(self)
    }

    pub fn threads(mut self, threads: u32) -> Self {
        self.threads = Some(threads);
        self
    }

    /// Ranks-per-node density hint. Zero means unspecified.
    pub fn ranks_per_node(mut self, ppn: u32) -> Self {
        self.ranks_per_node = ppn;
        self
    }

    pub fn turbo(mut self, turbo: Turbo) -> Self {
        self.turbo = turbo;
        self
    }

    /// The executable (first argument).
    pub fn program(&self) -> &str {
        &self.args[0]
    }

    pub fn argv(&self) -> &[String] {
        &self.args
    }

    pub fn env_overrides(&self) -> &BTreeMap<String, String> {
        &self.env
    }

    /// Environment overrides plus `OMP_NUM_THREADS` when a thread count is set
    /// and not already overridden explicitly.
    pub fn effective_env(&self) -> BTreeMap<String, String> {
        let mut env = self.env.clone();
        if let Some(threads) = self.threads {
            env.entry(THREADS_ENV.to_string())
                .or_insert_with(|| threads.to_string());
        }
        env
    }

    pub fn thread_count(&self) -> Option<u32> {
        self.threads
    }

    pub fn density(&self) -> u32 {
        self.ranks_per_node
    }

    pub fn local_opts(&self) -> &[String] {
        &self.local_opts
    }

    pub fn turbo_flag(&self) -> Turbo {
        self.turbo
    }

    /// Whether this rank carries launcher-level semantics that a plain shell
    /// command cannot express.
    pub fn has_launch_semantics(&self) -> bool {
        !self.local_opts.is_empty() || self.turbo.is_set()
    }

    /// Render this rank as a single POSIX shell command.
    ///
    /// The effective environment becomes an `env K=V` prefix. Launch attributes are
    /// not representable and are the caller's concern; see
    /// [`Rank::has_launch_semantics`].
    pub fn to_shell(&self) -> String {
        let env = self.effective_env();
        let mut words = Vec::with_capacity(self.args.len() + env.len() + 1);
        if !env.is_empty() {
            words.push("env".to_string());
            for (key, value) in &env {
                words.push(shell_quote(&format!("{key}={value}")));
            }
        }
        words.extend(self.args.iter().map(|a| shell_quote(a)));
        words.join(" ")
    }
}

impl fmt::Display for Rank {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_shell())
    }
}

/// Quote a word for a POSIX shell.
///
/// Words made only of safe characters pass through unchanged; everything else
/// is wrapped in single quotes, with embedded single quotes spelled `'\''`.
pub fn shell_quote(word: &str) -> String {
    let safe = !word.is_empty()
        && word
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || b"@%+=:,./-_".contains(&b));
    if safe {
        word.to_string()
    } else {
        format!("'{}'", word.replace('\'', "'\\''"))
    }
}
