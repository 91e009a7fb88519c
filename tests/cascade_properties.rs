use std::collections::HashSet;
use std::sync::Arc;

use cascade_match::cascade::{reconcile, Candidate, CascadeRanker, Fallback};
use cascade_match::catalog::{CatalogItem, Idx};
use cascade_match::controls::{Budgets, RetryPolicy, ShortfallPolicy};
use cascade_match::oracle::{Reply, StaticOracle};
use proptest::prelude::*;

fn distinct_ids(max: usize) -> impl Strategy<Value = Vec<Idx>> {
    prop::collection::hash_set(0u64..500, 0..max).prop_map(|ids| ids.into_iter().collect())
}

fn reply() -> impl Strategy<Value = Reply> {
    prop_oneof![
        4 => prop::collection::vec(0u64..600, 0..40).prop_map(Reply::Select),
        1 => Just(Reply::Malformed),
        1 => Just(Reply::Unavailable),
    ]
}

fn policy() -> impl Strategy<Value = ShortfallPolicy> {
    prop_oneof![Just(ShortfallPolicy::Fallback), Just(ShortfallPolicy::Backfill)]
}

fn candidates(ids: &[Idx]) -> Vec<Candidate> {
    ids.iter()
        .enumerate()
        .map(|(pos, idx)| Candidate {
            item: CatalogItem::new(*idx, format!("item {idx}")),
            similarity: 1.0 - pos as f32 / 1000.0,
        })
        .collect()
}

proptest! {
    #[test]
    fn reconciled_ids_come_from_the_input(
        input in distinct_ids(40),
        picks in prop::collection::vec(0u64..600, 0..60),
        wanted in 0usize..50,
        keep_input_order in any::<bool>(),
        policy in policy(),
    ) {
        let out = reconcile(&input, Ok(picks.as_slice()), wanted, keep_input_order, policy);
        let offered: HashSet<Idx> = input.iter().copied().collect();
        prop_assert!(out.ids.len() <= wanted.min(input.len()));
        prop_assert!(out.ids.iter().all(|idx| offered.contains(idx)));
        let unique: HashSet<Idx> = out.ids.iter().copied().collect();
        prop_assert_eq!(unique.len(), out.ids.len());
        let invented = picks.iter().filter(|idx| !offered.contains(idx)).count();
        prop_assert!(out.discarded >= invented);
    }

    #[test]
    fn failed_answers_truncate_in_input_order(
        input in distinct_ids(40),
        wanted in 0usize..50,
    ) {
        let out = reconcile(
            &input,
            Err(Fallback::Malformed),
            wanted,
            false,
            ShortfallPolicy::Fallback,
        );
        let expected: Vec<Idx> = input.iter().copied().take(wanted).collect();
        prop_assert_eq!(out.ids, expected);
        prop_assert_eq!(out.fallback, Some(Fallback::Malformed));
    }

    #[test]
    fn cascade_output_is_a_subset_chain(
        ann in distinct_ids(60),
        titles in reply(),
        details in reply(),
        (k0, k1, k2) in (1usize..60).prop_flat_map(|k0| (Just(k0), 1..=k0))
            .prop_flat_map(|(k0, k1)| (Just(k0), Just(k1), 1..=k1)),
        shortfall in policy(),
    ) {
        let budgets = Budgets::new(k0, k1, k2).unwrap();
        let ranker = CascadeRanker::new(Arc::new(StaticOracle::new(titles, details)))
            .with_retry(RetryPolicy::none())
            .with_shortfall(shortfall);
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_time()
            .build()
            .unwrap();
        let outcome = runtime.block_on(ranker.rank("profile", candidates(&ann), &budgets));

        let retrieved: HashSet<Idx> = ann.iter().copied().take(k0).collect();
        let stage1: HashSet<Idx> = outcome.stage1.selected.iter().copied().collect();
        prop_assert!(outcome.stage1.selected.len() <= k1);
        prop_assert!(stage1.is_subset(&retrieved));
        prop_assert!(outcome.ranked.len() <= k2);
        for ranked in &outcome.ranked {
            prop_assert!(stage1.contains(&ranked.candidate.idx()));
            prop_assert!(ranked.match_score > 0.0 && ranked.match_score <= 1.0);
        }
        if let Some(top) = outcome.ranked.first() {
            prop_assert_eq!(top.match_score, 1.0);
        }
    }
}
