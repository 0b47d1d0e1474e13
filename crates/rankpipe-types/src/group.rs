//! Rank groups: SPMD repetition, MPMD composition, and collapsing.
//!
//! A job is described as a tree:
//!
//! ```text
//!   RankGroup::Mpmd ─┬─ RankGroup::Spmd { rank: a.out, count: 3 }
//!                    ├─ RankGroup::Rank(b.out)
//!                    └─ RankGroup::Mpmd ─┬─ ...
//! ```
//!
//! Trees are composed with `+` (append, merging identical neighbours) and
//! `*` (repeat). [`RankGroup::collapse`] normalizes any tree into the minimal
//! sequence of runs of identical ranks, which is what the argument-list
//! compiler emits to a launcher.

use std::fmt;
use std::ops::{Add, Mul};

use serde::{Deserialize, Serialize};

use crate::error::GroupError;
use crate::rank::Rank;

/// A composable description of one or more ranks.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RankGroup {
    /// A single rank.
    Rank(Rank),
    /// One rank repeated `count` times.
    Spmd(SpmdGroup),
    /// An ordered list of (possibly different) groups.
    Mpmd(MpmdGroup),
}

/// Homogeneous group: one rank repeated. A count of zero means "no ranks".
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SpmdGroup {
    rank: Rank,
    count: usize,
}

impl SpmdGroup {
    pub fn rank(&self) -> &Rank {
        &self.rank
    }

    pub fn count(&self) -> usize {
        self.count
    }
}

/// Heterogeneous group: an ordered list of sub-groups.
///
/// Immutable once built, so the rank and group totals are computed once.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "Vec<RankGroup>", into = "Vec<RankGroup>")]
pub struct MpmdGroup {
    groups: Vec<RankGroup>,
    nranks: usize,
    ngroups: usize,
}

impl MpmdGroup {
    pub fn new(groups: Vec<RankGroup>) -> Self {
        let nranks = groups.iter().map(RankGroup::nranks).sum();
        let ngroups = groups.iter().map(RankGroup::ngroups).sum();
        Self {
            groups,
            nranks,
            ngroups,
        }
    }

    pub fn groups(&self) -> &[RankGroup] {
        &self.groups
    }

    pub fn into_groups(self) -> Vec<RankGroup> {
        self.groups
    }
}

impl From<Vec<RankGroup>> for MpmdGroup {
    fn from(groups: Vec<RankGroup>) -> Self {
        Self::new(groups)
    }
}

impl From<MpmdGroup> for Vec<RankGroup> {
    fn from(group: MpmdGroup) -> Self {
        group.groups
    }
}

impl RankGroup {
    /// `rank` repeated `count` times.
    pub fn spmd(rank: Rank, count: usize) -> Self {
        RankGroup::Spmd(SpmdGroup { rank, count })
    }

    pub fn mpmd(groups: Vec<RankGroup>) -> Self {
        RankGroup::Mpmd(MpmdGroup::new(groups))
    }

    /// Total number of ranks.
    pub fn nranks(&self) -> usize {
        match self {
            RankGroup::Rank(_) => 1,
            RankGroup::Spmd(g) => g.count,
            RankGroup::Mpmd(g) => g.nranks,
        }
    }

    /// Number of non-empty leaf groups.
    pub fn ngroups(&self) -> usize {
        match self {
            RankGroup::Rank(_) => 1,
            RankGroup::Spmd(g) => usize::from(g.count > 0),
            RankGroup::Mpmd(g) => g.ngroups,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.nranks() == 0
    }

    /// The rank and count if this is a single run.
    fn as_run(&self) -> Option<(&Rank, usize)> {
        match self {
            RankGroup::Rank(r) => Some((r, 1)),
            RankGroup::Spmd(g) => Some((&g.rank, g.count)),
            RankGroup::Mpmd(_) => None,
        }
    }

    /// Leaf groups in order, skipping empty ones. Adjacent leaves are not merged.
    pub fn leaves(&self) -> Vec<(&Rank, usize)> {
        let mut out = Vec::with_capacity(self.ngroups());
        self.push_leaves(&mut out);
        out
    }

    fn push_leaves<'a>(&'a self, out: &mut Vec<(&'a Rank, usize)>) {
        match self {
            RankGroup::Mpmd(g) => {
                for child in &g.groups {
                    child.push_leaves(out);
                }
            }
            other => {
                if let Some((rank, count)) = other.as_run()
                    && count > 0
                {
                    out.push((rank, count));
                }
            }
        }
    }

    /// Maximal runs of identical ranks, in order.
    pub fn runs(&self) -> Vec<(&Rank, usize)> {
        let mut runs: Vec<(&Rank, usize)> = Vec::new();
        for (rank, count) in self.leaves() {
            if let Some((last, total)) = runs.last_mut()
                && *last == rank
            {
                *total += count;
                continue;
            }
            runs.push((rank, count));
        }
        runs
    }

    /// Every rank, once per process.
    pub fn ranks(&self) -> impl Iterator<Item = &Rank> + '_ {
        self.leaves()
            .into_iter()
            .flat_map(|(rank, count)| std::iter::repeat_n(rank, count))
    }

    /// Segments for argument compilation: one per rank when `expand` is set,
    /// otherwise one per collapsed run.
    pub fn segments(&self, expand: bool) -> Vec<(&Rank, usize)> {
        if expand {
            self.ranks().map(|rank| (rank, 1)).collect()
        } else {
            self.runs()
        }
    }

    /// Normalize into the minimal sequence of runs.
    ///
    /// A single run of one rank becomes `Rank`, a single longer run becomes
    /// `Spmd`, anything else becomes a flat `Mpmd` of those.
    pub fn collapse(&self) -> RankGroup {
        let mut runs: Vec<RankGroup> = self
            .runs()
            .into_iter()
            .map(|(rank, count)| match count {
                1 => RankGroup::Rank(rank.clone()),
                n => RankGroup::spmd(rank.clone(), n),
            })
            .collect();
        if runs.len() == 1 {
            runs.remove(0)
        } else {
            RankGroup::mpmd(runs)
        }
    }

    /// Whether two trees launch the same ranks in the same order,
    /// regardless of how they are grouped.
    pub fn equivalent(&self, other: &RankGroup) -> bool {
        self.runs() == other.runs()
    }

    /// Checked repetition for factors from untyped sources.
    ///
    /// Fails instead of panicking when the rank count or the MPMD group list
    /// would not fit.
    pub fn repeat(self, factor: i64) -> Result<RankGroup, GroupError> {
        if factor < 0 {
            return Err(GroupError::NegativeFactor(factor));
        }
        let overflow = GroupError::Overflow(factor);
        let times = usize::try_from(factor).map_err(|_| overflow.clone())?;
        if self.nranks().checked_mul(times).is_none() {
            return Err(overflow);
        }
        if let RankGroup::Mpmd(g) = &self {
            let max_groups = isize::MAX as usize / std::mem::size_of::<RankGroup>();
            if g.groups.len().checked_mul(times).is_none_or(|n| n > max_groups) {
                return Err(overflow);
            }
        }
        Ok(self * times)
    }
}

impl From<Rank> for RankGroup {
    fn from(rank: Rank) -> Self {
        RankGroup::Rank(rank)
    }
}

impl From<SpmdGroup> for RankGroup {
    fn from(group: SpmdGroup) -> Self {
        RankGroup::Spmd(group)
    }
}

impl From<MpmdGroup> for RankGroup {
    fn from(group: MpmdGroup) -> Self {
        RankGroup::Mpmd(group)
    }
}

impl Add for RankGroup {
    type Output = RankGroup;

    fn add(self, rhs: RankGroup) -> RankGroup {
        if self.is_empty() {
            return rhs;
        }
        if rhs.is_empty() {
            return self;
        }
        match (self, rhs) {
            (RankGroup::Mpmd(lhs), RankGroup::Mpmd(rhs)) => {
                let mut groups = lhs.groups;
                groups.extend(rhs.groups);
                RankGroup::mpmd(groups)
            }
            (RankGroup::Mpmd(lhs), rhs) => {
                let mut groups = lhs.groups;
                groups.push(rhs);
                RankGroup::mpmd(groups)
            }
            (lhs, RankGroup::Mpmd(rhs)) => {
                let mut groups = Vec::with_capacity(rhs.groups.len() + 1);
                groups.push(lhs);
                groups.extend(rhs.groups);
                RankGroup::mpmd(groups)
            }
            (lhs, rhs) => {
                if let (Some((a, n)), Some((b, m))) = (lhs.as_run(), rhs.as_run())
                    && a == b
                {
                    return RankGroup::spmd(a.clone(), n + m);
                }
                RankGroup::mpmd(vec![lhs, rhs])
            }
        }
    }
}

impl Add<Rank> for RankGroup {
    type Output = RankGroup;

    fn add(self, rhs: Rank) -> RankGroup {
        self + RankGroup::Rank(rhs)
    }
}

impl Add for Rank {
    type Output = RankGroup;

    fn add(self, rhs: Rank) -> RankGroup {
        RankGroup::Rank(self) + RankGroup::Rank(rhs)
    }
}

impl Add<RankGroup> for Rank {
    type Output = RankGroup;

    fn add(self, rhs: RankGroup) -> RankGroup {
        RankGroup::Rank(self) + rhs
    }
}

/// Repetition. Overflows like integer `*`; use [`RankGroup::repeat`] for a
/// checked version.
impl Mul<usize> for RankGroup {
    type Output = RankGroup;

    fn mul(self, factor: usize) -> RankGroup {
        match self {
            RankGroup::Rank(rank) => RankGroup::spmd(rank, factor),
            RankGroup::Spmd(g) => RankGroup::spmd(g.rank, g.count * factor),
            RankGroup::Mpmd(g) => {
                let mut groups = Vec::with_capacity(g.groups.len() * factor);
                for _ in 0..factor {
                    groups.extend(g.groups.iter().cloned());
                }
                RankGroup::mpmd(groups)
            }
        }
    }
}

impl Mul<usize> for Rank {
    type Output = RankGroup;

    fn mul(self, factor: usize) -> RankGroup {
        RankGroup::spmd(self, factor)
    }
}

impl fmt::Display for RankGroup {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let runs = self.runs();
        if runs.is_empty() {
            return write!(f, "(no ranks)");
        }
        for (i, (rank, count)) in runs.iter().enumerate() {
            if i > 0 {
                write!(f, " : ")?;
            }
            write!(f, "{count}x {rank}")?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rank(name: &str) -> Rank {
        Rank::new([name]).unwrap()
    }

    #[test]
    fn same_ranks_add_to_spmd() {
        let a = rank("a.out");
        assert_eq!(a.clone() + a.clone(), RankGroup::spmd(a, 2));
    }

    #[test]
    fn different_ranks_add_to_mpmd() {
        let g = rank("a.out") + rank("b.out");
        assert!(matches!(g, RankGroup::Mpmd(_)));
        assert_eq!(g.nranks(), 2);
        assert_eq!(g.ngroups(), 2);
    }

    #[test]
    fn mpmd_appends_in_order() {
        let g = (rank("a") + rank("b")) + rank("c");
        let names: Vec<_> = g.ranks().map(Rank::program).collect();
        assert_eq!(names, ["a", "b", "c"]);
        let RankGroup::Mpmd(m) = &g else {
            panic!("expected mpmd, got {g:?}");
        };
        assert_eq!(m.groups().len(), 3);
    }

    #[test]
    fn empty_spmd_is_absent() {
        let empty = rank("a") * 0;
        assert_eq!(empty.nranks(), 0);
        assert_eq!(empty.ngroups(), 0);
        assert!(empty.leaves().is_empty());
        assert_eq!(empty + rank("b"), RankGroup::Rank(rank("b")));
    }

    #[test]
    fn mpmd_multiplies_by_repeating_list() {
        let g = (rank("a") + rank("b")) * 2;
        let names: Vec<_> = g.ranks().map(Rank::program).collect();
        assert_eq!(names, ["a", "b", "a", "b"]);
    }

    #[test]
    fn negative_repeat_is_error() {
        assert_eq!(
            RankGroup::from(rank("a")).repeat(-1),
            Err(GroupError::NegativeFactor(-1))
        );
        assert_eq!(RankGroup::from(rank("a")).repeat(3).unwrap().nranks(), 3);
    }

    #[test]
    fn collapse_merges_adjacent_runs() {
        let a = rank("a");
        let tree = RankGroup::mpmd(vec![a.clone().into(), a.clone().into(), a.clone().into()]);
        assert_eq!(tree.collapse(), RankGroup::spmd(a, 3));
    }

    #[test]
    fn display_lists_runs() {
        let g = rank("a") * 3 + rank("b");
        assert_eq!(g.to_string(), "3x a : 1x b");
    }
}
