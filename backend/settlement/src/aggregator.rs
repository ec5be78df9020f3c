//! Settlement aggregation.
//!
//! `collected` and `finally_verified_count` are computed over exactly the
//! contributions in the [`VerifiedSet`]; `participants` counts every
//! submission. Both predicates run over the same contribution list, so
//! `finally_verified_count <= participants` always holds.

use std::collections::HashMap;

use crate::money::Amount;
use crate::types::{Aggregate, Contribution, VerifiedSet};

/// Compute the derived figures for one fundraiser's contributions.
pub fn aggregate(contributions: &[Contribution], verified: &VerifiedSet) -> Aggregate {
    let settled: Vec<&Contribution> = contributions
        .iter()
        .filter(|c| verified.contains(&c.id))
        .collect();

    Aggregate {
        collected: settled.iter().map(|c| c.amount).sum::<Amount>(),
        participants: contributions.len() as u64,
        finally_verified_count: settled.len() as u64,
    }
}

/// Split an owner-wide contribution list by fundraiser.
pub fn group_by_fundraiser(contributions: Vec<Contribution>) -> HashMap<String, Vec<Contribution>> {
    let mut grouped: HashMap<String, Vec<Contribution>> = HashMap::new();
    for c in contributions {
        grouped.entry(c.fundraiser_id.clone()).or_default().push(c);
    }
    grouped
}
