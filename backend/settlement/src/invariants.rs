#![allow(dead_code)]

use crate::money::Amount;
use crate::types::{Aggregate, Contribution, VerifiedSet};

/// Collected must equal the sum of amounts over verified contributions only,
/// and the verified count must match that same subset.
pub fn assert_aggregate_consistent(agg: &Aggregate, contributions: &[Contribution], verified: &VerifiedSet) {
    let settled: Vec<&Contribution> = contributions.iter().filter(|c| verified.contains(&c.id)).collect();
    let expected: Amount = settled.iter().map(|c| c.amount).sum();

    assert_eq!(
        agg.collected, expected,
        "collected {} does not match the verified sum {}",
        agg.collected, expected
    );
    assert_eq!(
        agg.finally_verified_count,
        settled.len() as u64,
        "verified count {} does not match {} verified contributions",
        agg.finally_verified_count,
        settled.len()
    );
    assert_eq!(agg.participants, contributions.len() as u64);
    assert_verified_within_participants(agg);
}

pub fn assert_verified_within_participants(agg: &Aggregate) {
    assert!(
        agg.finally_verified_count <= agg.participants,
        "{} verified out of only {} participants",
        agg.finally_verified_count,
        agg.participants
    );
}

/// Verification never reverts: every id verified before is still verified.
pub fn assert_verified_monotonic(before: &VerifiedSet, after: &VerifiedSet) {
    for id in before.iter() {
        assert!(after.contains(id), "contribution {id} lost its final verification");
    }
}

/// Totals can only grow between passes over an unchanged contribution list.
pub fn assert_aggregate_monotonic(before: &Aggregate, after: &Aggregate) {
    assert!(after.collected >= before.collected, "collected went down");
    assert!(
        after.finally_verified_count >= before.finally_verified_count,
        "verified count went down"
    );
}
