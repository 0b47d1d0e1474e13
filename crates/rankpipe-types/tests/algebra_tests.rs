//! Rank group algebra tests: composition, repetition, collapsing, serde.

use rankpipe_types::{GroupError, Rank, RankGroup, Turbo};
use rstest::rstest;

fn rank(args: &[&str]) -> Rank {
    Rank::new(args.iter().copied()).expect("valid rank")
}

fn a() -> Rank {
    rank(&["a.out", "--input", "in.nc"])
}

fn b() -> Rank {
    rank(&["b.out"])
}

// ============================================================================
// Composition
// ============================================================================

#[test]
fn rank_plus_itself_is_spmd_of_two() {
    let g = a() + a();
    let RankGroup::Spmd(spmd) = &g else {
        panic!("expected spmd group, got {g:?}");
    };
    assert_eq!(spmd.count(), 2);
    assert_eq!(spmd.rank(), &a());
}

#[test]
fn three_appended_ranks_collapse_to_one_group() {
    let g = a() + a() + a();
    let collapsed = g.collapse();
    assert_eq!(collapsed, RankGroup::spmd(a(), 3));
    assert_eq!(collapsed.ngroups(), 1);
}

#[test]
fn same_rank_groups_merge_to_five() {
    let g = (a() * 3) + (a() * 2);
    assert_eq!(g.collapse(), RankGroup::spmd(a(), 5));
}

#[test]
fn distinct_rank_groups_stay_separate() {
    let g = (a() * 3) + (b() * 2);
    let collapsed = g.collapse();
    let RankGroup::Mpmd(m) = &collapsed else {
        panic!("expected mpmd group, got {collapsed:?}");
    };
    assert_eq!(m.groups().len(), 2);
    assert_eq!(m.groups()[0], RankGroup::spmd(a(), 3));
    assert_eq!(m.groups()[1], RankGroup::spmd(b(), 2));
}

#[test]
fn attributes_prevent_merging() {
    let fast = a().turbo(Turbo::On);
    let g = (a() * 2) + (fast.clone() * 2);
    assert_eq!(g.collapse().ngroups(), 2);

    let dense = a().ranks_per_node(8);
    assert_eq!(((a() * 2) + (dense * 2)).collapse().ngroups(), 2);
}

#[test]
fn collapse_is_idempotent() {
    let g = a() + b() + b() + a() + (a() * 4);
    let once = g.collapse();
    assert_eq!(once.collapse(), once);
    assert!(once.equivalent(&g));
}

#[test]
fn collapse_drops_empty_groups() {
    let g = RankGroup::mpmd(vec![a() * 2, b() * 0, a() * 1]);
    assert_eq!(g.collapse(), RankGroup::spmd(a(), 3));
}

#[test]
fn nested_mpmd_flattens_on_collapse() {
    let inner = RankGroup::mpmd(vec![b().into(), a().into()]);
    let g = RankGroup::mpmd(vec![a().into(), inner, a().into()]);
    let runs: Vec<_> = g
        .collapse()
        .runs()
        .into_iter()
        .map(|(r, n)| (r.program().to_string(), n))
        .collect();
    assert_eq!(
        runs,
        [("a.out".to_string(), 1), ("b.out".to_string(), 1), ("a.out".to_string(), 2)]
    );
}

// ============================================================================
// Counting
// ============================================================================

#[rstest]
#[case(a().into(), b().into())]
#[case(a() * 3, b() * 2)]
#[case(a() * 3, a() * 2)]
#[case(a() + b(), a() * 4)]
#[case((a() + b()) * 3, b() + a())]
#[case(a() * 0, b() * 7)]
fn nranks_is_additive(#[case] x: RankGroup, #[case] y: RankGroup) {
    let expected = x.nranks() + y.nranks();
    assert_eq!((x + y).nranks(), expected);
}

#[rstest]
#[case(0)]
#[case(1)]
#[case(4)]
fn mpmd_multiplication_scales_counts(#[case] factor: usize) {
    let g = (a() * 2 + b()) * factor;
    assert_eq!(g.nranks(), 3 * factor);
    assert_eq!(g.ranks().count(), 3 * factor);
}

#[test]
fn expanded_segments_are_per_rank() {
    let g = a() * 2 + b();
    let segs = g.segments(true);
    assert_eq!(segs.len(), 3);
    assert!(segs.iter().all(|(_, n)| *n == 1));
    assert_eq!(g.segments(false).len(), 2);
}

// ============================================================================
// Construction errors
// ============================================================================

#[test]
fn negative_factor_is_domain_error() {
    let err = RankGroup::from(a()).repeat(-2).unwrap_err();
    assert_eq!(err, GroupError::NegativeFactor(-2));
    assert!(err.to_string().contains("negative"));
}

#[rstest]
#[case::spmd(a() * 3)]
#[case::mpmd(a() + b())]
fn huge_factor_is_overflow_not_panic(#[case] group: RankGroup) {
    assert_eq!(group.repeat(i64::MAX), Err(GroupError::Overflow(i64::MAX)));
}

#[test]
fn checked_repeat_matches_multiplication() {
    let group = a() + b();
    assert_eq!(group.clone().repeat(3), Ok(group.clone() * 3));
    assert_eq!(group.repeat(3).map(|g| g.nranks()), Ok(6));
}

#[test]
fn unusable_arguments_rejected() {
    assert_eq!(Rank::new(Vec::<String>::new()), Err(GroupError::EmptyArgs));
    assert!(matches!(
        Rank::new(["a.out", "bad\0arg"]),
        Err(GroupError::NulByte(_))
    ));
}

// ============================================================================
// Serde
// ============================================================================

#[test]
fn job_description_from_json() {
    let json = r#"{
        "mpmd": [
            {"spmd": {"rank": {"args": ["a.out", "--input", "in.nc"]}, "count": 3}},
            {"rank": {"args": ["b.out"], "env": {"OMP_NUM_THREADS": "2"}}}
        ]
    }"#;
    let g: RankGroup = serde_json::from_str(json).unwrap();
    assert_eq!(g.nranks(), 4);
    assert_eq!(g.ngroups(), 2);
    let leaves = g.leaves();
    assert_eq!(leaves[0].0, &a());
    assert_eq!(
        leaves[1].0.env_overrides().get("OMP_NUM_THREADS").map(String::as_str),
        Some("2")
    );
}

#[test]
fn json_rejects_non_string_arguments() {
    let json = r#"{"rank": {"args": ["a.out", 42]}}"#;
    assert!(serde_json::from_str::<RankGroup>(json).is_err());
}

#[test]
fn json_rejects_negative_count() {
    let json = r#"{"spmd": {"rank": {"args": ["a.out"]}, "count": -1}}"#;
    assert!(serde_json::from_str::<RankGroup>(json).is_err());
}

#[test]
fn json_round_trip_preserves_tree() {
    let g = (a() * 3) + b().threads(4);
    let text = serde_json::to_string(&g).unwrap();
    let back: RankGroup = serde_json::from_str(&text).unwrap();
    assert_eq!(back, g);
}
