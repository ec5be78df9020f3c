//! Verification status resolution.
//!
//! Builds a [`VerifiedSet`] for a batch of contributions. Resolution is
//! fail-open: a status check that errors counts as "not verified" and never
//! aborts the rest of the batch, because pending is the expected state for
//! most contributions. A resolver returns an error in two cases only, and then
//! no partial set escapes:
//!
//! - [`SettlementError::Cancelled`] when the pass is abandoned;
//! - an authentication failure ([`SettlementError::requires_login`]).
//!
//! Every pass resolves every id again; nothing is cached across passes.

use std::collections::HashSet;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::backend::ContributionBackend;
use crate::config::{Config, ResolverStrategy};
use crate::errors::{Result, SettlementError};
use crate::types::{Contribution, VerifiedSet};

#[async_trait]
pub trait VerificationResolver: Send + Sync {
    /// Resolve every contribution. Returns only once each id has either been
    /// classified or failed (treated as pending), unless the session is gone.
    async fn resolve(&self, contributions: &[Contribution], cancel: &CancellationToken) -> Result<VerifiedSet>;
}

pub fn build(config: &Config, backend: Arc<dyn ContributionBackend>) -> Arc<dyn VerificationResolver> {
    let per_id = PerContributionResolver::new(backend.clone(), config.resolver_concurrency);
    match config.resolver_strategy {
        ResolverStrategy::PerContribution => Arc::new(per_id),
        ResolverStrategy::Batched => Arc::new(BatchedResolver::new(backend, per_id, config.resolver_batch_size)),
    }
}

/// Distinct ids, first occurrence order.
fn distinct_ids(contributions: &[Contribution]) -> Vec<String> {
    let mut seen = HashSet::new();
    contributions
        .iter()
        .filter(|c| seen.insert(c.id.as_str()))
        .map(|c| c.id.clone())
        .collect()
}

// ─────────────────────────────────────────────────────────
// One query per contribution
// ─────────────────────────────────────────────────────────

pub struct PerContributionResolver {
    backend: Arc<dyn ContributionBackend>,
    concurrency: usize,
}

impl PerContributionResolver {
    pub fn new(backend: Arc<dyn ContributionBackend>, concurrency: usize) -> Self {
        PerContributionResolver {
            backend,
            concurrency: concurrency.max(1),
        }
    }

    async fn resolve_ids(&self, ids: Vec<String>, cancel: &CancellationToken) -> Result<VerifiedSet> {
        let permits = Arc::new(Semaphore::new(self.concurrency));
        let mut tasks = JoinSet::new();

        for id in ids {
            let backend = self.backend.clone();
            let permits = permits.clone();
            tasks.spawn(async move {
                let _permit = permits.acquire_owned().await;
                let status = backend.verification_status(&id).await;
                (id, status)
            });
        }

        let mut verified = VerifiedSet::new();
        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    tasks.abort_all();
                    return Err(SettlementError::Cancelled);
                }
                next = tasks.join_next() => match next {
                    None => break,
                    Some(Ok((id, Ok(true)))) => {
                        debug!("Contribution {id} is finally verified");
                        verified.insert(id);
                    }
                    Some(Ok((id, Ok(false)))) => debug!("Contribution {id} is pending"),
                    Some(Ok((id, Err(e)))) if e.requires_login() => {
                        warn!("Status check for {id} needs a new login, abandoning resolution: {e}");
                        tasks.abort_all();
                        return Err(e);
                    }
                    Some(Ok((id, Err(e)))) => {
                        warn!("Status check for {id} failed, treating as pending: {e}");
                    }
                    Some(Err(e)) => warn!("Status check task failed, treating as pending: {e}"),
                },
            }
        }
        Ok(verified)
    }
}

#[async_trait]
impl VerificationResolver for PerContributionResolver {
    async fn resolve(&self, contributions: &[Contribution], cancel: &CancellationToken) -> Result<VerifiedSet> {
        self.resolve_ids(distinct_ids(contributions), cancel).await
    }
}

// ─────────────────────────────────────────────────────────
// Bulk queries with per-id fallback
// ─────────────────────────────────────────────────────────

pub struct BatchedResolver {
    backend: Arc<dyn ContributionBackend>,
    fallback: PerContributionResolver,
    batch_size: usize,
}

impl BatchedResolver {
    pub fn new(backend: Arc<dyn ContributionBackend>, fallback: PerContributionResolver, batch_size: usize) -> Self {
        BatchedResolver {
            backend,
            fallback,
            batch_size: batch_size.max(1),
        }
    }
}

#[async_trait]
impl VerificationResolver for BatchedResolver {
    async fn resolve(&self, contributions: &[Contribution], cancel: &CancellationToken) -> Result<VerifiedSet> {
        let mut verified = VerifiedSet::new();

        for chunk in distinct_ids(contributions).chunks(self.batch_size) {
            let answer = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(SettlementError::Cancelled),
                answer = self.backend.verification_statuses(chunk) => answer,
            };
            match answer {
                Ok(results) => verified.extend(
                    chunk
                        .iter()
                        .filter(|id| results.get(id.as_str()).copied().unwrap_or(false))
                        .cloned(),
                ),
                Err(e) if e.requires_login() => return Err(e),
                Err(e) => {
                    warn!(
                        "Bulk status check for {} contributions failed, falling back to per-id: {e}",
                        chunk.len()
                    );
                    let resolved = self.fallback.resolve_ids(chunk.to_vec(), cancel).await?;
                    verified.extend(resolved.iter().cloned());
                }
            }
        }
        Ok(verified)
    }
}
