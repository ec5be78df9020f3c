//! Owner review listing: contributions with their verification flag, the
//! way the organiser works through pending claims.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use crate::backend::ContributionBackend;
use crate::errors::Result;
use crate::money::Amount;
use crate::resolver::VerificationResolver;
use crate::types::{Contribution, VerifiedSet};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StatusFilter {
    #[default]
    All,
    Verified,
    Pending,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReviewQuery {
    /// Restrict to one fundraiser; all owned fundraisers otherwise.
    pub fundraiser_id: Option<String>,
    #[serde(default)]
    pub status: StatusFilter,
    /// Case-insensitive match on name, reference, fundraiser title or email.
    pub search: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ReviewEntry {
    #[serde(flatten)]
    pub contribution: Contribution,
    pub finally_verified: bool,
}

/// Stats cover the whole listing, before status/search filtering.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ReviewStats {
    pub total: u64,
    /// Sum of all claimed amounts, verified or not.
    pub claimed_amount: Amount,
    pub verified: u64,
    pub pending: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct Review {
    pub entries: Vec<ReviewEntry>,
    pub stats: ReviewStats,
}

/// Fetch, resolve and filter in one go.
pub async fn review(
    backend: &Arc<dyn ContributionBackend>,
    resolver: &Arc<dyn VerificationResolver>,
    query: &ReviewQuery,
    cancel: &CancellationToken,
) -> Result<Review> {
    let contributions = match query.fundraiser_id.as_deref() {
        Some(id) => backend.fundraiser_contributions(id).await?,
        None => backend.owner_contributions().await?,
    };
    let verified = resolver.resolve(&contributions, cancel).await?;
    Ok(build_review(contributions, &verified, query))
}

pub fn build_review(contributions: Vec<Contribution>, verified: &VerifiedSet, query: &ReviewQuery) -> Review {
    let verified_count = contributions.iter().filter(|c| verified.contains(&c.id)).count() as u64;
    let stats = ReviewStats {
        total: contributions.len() as u64,
        claimed_amount: contributions.iter().map(|c| c.amount).sum(),
        verified: verified_count,
        pending: contributions.len() as u64 - verified_count,
    };

    let needle = query
        .search
        .as_deref()
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_lowercase);

    let entries = contributions
        .into_iter()
        .map(|c| ReviewEntry {
            finally_verified: verified.contains(&c.id),
            contribution: c,
        })
        .filter(|e| match query.status {
            StatusFilter::All => true,
            StatusFilter::Verified => e.finally_verified,
            StatusFilter::Pending => !e.finally_verified,
        })
        .filter(|e| needle.as_deref().map_or(true, |n| matches_search(&e.contribution, n)))
        .collect();

    Review { entries, stats }
}

fn matches_search(c: &Contribution, needle: &str) -> bool {
    c.participant_name.to_lowercase().contains(needle)
        || c.payment_reference.contains(needle)
        || c
            .fundraiser_title
            .as_deref()
            .is_some_and(|t| t.to_lowercase().contains(needle))
        || c
            .email
            .as_deref()
            .is_some_and(|e| e.to_lowercase().contains(needle))
}
