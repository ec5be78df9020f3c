//! Reconciliation trigger: the owner dashboard and its refresh lifecycle.
//!
//! ## Per-fundraiser state
//!
//! ```text
//! Idle{cached} ──► Refreshing{last_good} ──► Fresh(snapshot)
//!                          │
//!                          └──► Stale{last_good}
//! ```
//!
//! Transitions happen only on mount, manual/scheduled refresh and a
//! successful final verification. A failed fetch never blanks a fundraiser:
//! it falls back to the last good snapshot and is flagged stale, while the
//! rest of the pass carries on.
//!
//! ## Single flight
//!
//! At most one pass runs per dashboard. A full refresh requested while
//! another full refresh is in flight waits for it and returns its summary
//! (marked `coalesced`) instead of fanning out again.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use sqlx::SqlitePool;
use tokio::sync::{Mutex, RwLock};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::aggregator;
use crate::backend::ContributionBackend;
use crate::config::ReconcileScope;
use crate::errors::{Result, SettlementError};
use crate::gate::{self, FinalVerificationGate};
use crate::money::Amount;
use crate::resolver::VerificationResolver;
use crate::review::{self, Review, ReviewQuery};
use crate::store;
use crate::types::{Aggregate, Contribution, Fundraiser, Notice, Snapshot, VerificationReceipt, VerifiedSet};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FundraiserState {
    /// Not reconciled since mount; shows the cached snapshot if there is one.
    Idle { cached: Option<Snapshot> },
    Refreshing { last_good: Option<Snapshot> },
    Fresh(Snapshot),
    /// The last refresh failed; shows the last good snapshot.
    Stale { last_good: Option<Snapshot> },
}

impl FundraiserState {
    pub fn last_good(&self) -> Option<Snapshot> {
        match self {
            Self::Idle { cached: s } | Self::Refreshing { last_good: s } | Self::Stale { last_good: s } => *s,
            Self::Fresh(s) => Some(*s),
        }
    }

    pub fn live_data_loaded(&self) -> bool {
        matches!(self, Self::Fresh(_))
    }

    pub fn label(&self) -> &'static str {
        match self {
            Self::Idle { .. } => "idle",
            Self::Refreshing { .. } => "refreshing",
            Self::Fresh(_) => "fresh",
            Self::Stale { .. } => "stale",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Trigger {
    Mount,
    Manual,
    Schedule,
    Verification,
}

/// Outcome of one reconciliation pass; carries the pass's single notice.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RefreshSummary {
    pub trigger: Trigger,
    pub refreshed: Vec<String>,
    pub stale: Vec<String>,
    /// This caller joined a pass that someone else started.
    pub coalesced: bool,
    pub finished_at: DateTime<Utc>,
    pub notice: Notice,
}

/// One row of the owner dashboard.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FundraiserView {
    #[serde(flatten)]
    pub fundraiser: Fundraiser,
    pub target: Option<Amount>,
    pub aggregate: Aggregate,
    pub state: &'static str,
    pub live_data_loaded: bool,
    pub computed_at: Option<DateTime<Utc>>,
}

/// Result of a verification triggered from the dashboard.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct VerificationOutcome {
    pub receipt: VerificationReceipt,
    pub summary: Option<RefreshSummary>,
    pub notice: Notice,
}

#[derive(Default)]
struct ViewState {
    fundraisers: Vec<Fundraiser>,
    states: HashMap<String, FundraiserState>,
    /// contribution id -> fundraiser id, from the last pass.
    owners: HashMap<String, String>,
}

struct Settled {
    aggregate: Aggregate,
    contribution_ids: Vec<String>,
}

pub struct Dashboard {
    backend: Arc<dyn ContributionBackend>,
    resolver: Arc<dyn VerificationResolver>,
    gate: FinalVerificationGate,
    pool: SqlitePool,
    scope: ReconcileScope,
    view: RwLock<ViewState>,
    pass_lock: Mutex<()>,
    completed_full_passes: AtomicU64,
    last_summary: RwLock<Option<RefreshSummary>>,
    last_full_summary: RwLock<Option<RefreshSummary>>,
    lifecycle: RwLock<CancellationToken>,
}

impl Dashboard {
    pub fn new(
        backend: Arc<dyn ContributionBackend>,
        resolver: Arc<dyn VerificationResolver>,
        pool: SqlitePool,
        scope: ReconcileScope,
    ) -> Self {
        Dashboard {
            gate: FinalVerificationGate::new(backend.clone()),
            backend,
            resolver,
            pool,
            scope,
            view: RwLock::new(ViewState::default()),
            pass_lock: Mutex::new(()),
            completed_full_passes: AtomicU64::new(0),
            last_summary: RwLock::new(None),
            last_full_summary: RwLock::new(None),
            lifecycle: RwLock::new(CancellationToken::new()),
        }
    }

    // ─────────────────────────────────────────────────────────
    // Lifecycle
    // ─────────────────────────────────────────────────────────

    /// Load the cached list and snapshots, then refresh if there is anything
    /// to show. Returns `None` when the cached list is empty.
    pub async fn mount(&self) -> Result<Option<RefreshSummary>> {
        {
            let mut lifecycle = self.lifecycle.write().await;
            if lifecycle.is_cancelled() {
                *lifecycle = CancellationToken::new();
            }
        }

        let fundraisers = store::load_fundraisers(&self.pool).await?;
        let snapshots = store::load_snapshots(&self.pool).await?;
        {
            let mut view = self.view.write().await;
            view.states = fundraisers
                .iter()
                .map(|f| {
                    let cached = snapshots.get(&f.id).copied();
                    (f.id.clone(), FundraiserState::Idle { cached })
                })
                .collect();
            view.fundraisers = fundraisers;
        }

        if self.view.read().await.fundraisers.is_empty() {
            debug!("Mounted with an empty fundraiser cache");
            return Ok(None);
        }
        self.refresh(Trigger::Mount).await.map(Some)
    }

    /// Cancel in-flight work; nothing started before this writes state again.
    pub async fn unmount(&self) {
        self.lifecycle.read().await.cancel();
        info!("Dashboard unmounted");
    }

    /// Replace the fundraiser list from the backend and cache it.
    pub async fn reload_fundraisers(&self) -> Result<usize> {
        let fundraisers = self.backend.owner_fundraisers().await?;
        if let Err(e) = store::save_fundraisers(&self.pool, &fundraisers).await {
            warn!("Failed to cache fundraiser list: {e}");
        }

        let kept: HashSet<&str> = fundraisers.iter().map(|f| f.id.as_str()).collect();
        let mut view = self.view.write().await;
        view.owners.retain(|_, fundraiser_id| kept.contains(fundraiser_id.as_str()));
        let mut states = std::mem::take(&mut view.states);
        view.states = fundraisers
            .iter()
            .map(|f| {
                let state = states
                    .remove(&f.id)
                    .unwrap_or(FundraiserState::Idle { cached: None });
                (f.id.clone(), state)
            })
            .collect();
        view.fundraisers = fundraisers;
        info!("Loaded {} fundraisers", view.fundraisers.len());
        Ok(view.fundraisers.len())
    }

    // ─────────────────────────────────────────────────────────
    // Reads
    // ─────────────────────────────────────────────────────────

    pub async fn views(&self) -> Vec<FundraiserView> {
        let view = self.view.read().await;
        view.fundraisers
            .iter()
            .map(|f| {
                let state = view
                    .states
                    .get(&f.id)
                    .cloned()
                    .unwrap_or(FundraiserState::Idle { cached: None });
                let last_good = state.last_good();
                FundraiserView {
                    target: f.target(),
                    aggregate: last_good
                        .map(|s| s.aggregate)
                        .unwrap_or_else(|| f.reported_aggregate()),
                    state: state.label(),
                    live_data_loaded: state.live_data_loaded(),
                    computed_at: last_good.map(|s| s.computed_at),
                    fundraiser: f.clone(),
                }
            })
            .collect()
    }

    pub async fn state(&self, fundraiser_id: &str) -> Option<FundraiserState> {
        self.view.read().await.states.get(fundraiser_id).cloned()
    }

    pub fn is_refreshing(&self) -> bool {
        self.pass_lock.try_lock().is_err()
    }

    pub async fn last_summary(&self) -> Option<RefreshSummary> {
        self.last_summary.read().await.clone()
    }

    #[cfg(test)]
    pub(crate) async fn owner_of(&self, contribution_id: &str) -> Option<String> {
        self.view.read().await.owners.get(contribution_id).cloned()
    }

    pub async fn review(&self, query: &ReviewQuery) -> Result<Review> {
        let cancel = self.lifecycle.read().await.child_token();
        review::review(&self.backend, &self.resolver, query, &cancel).await
    }

    // ─────────────────────────────────────────────────────────
    // Transitions
    // ─────────────────────────────────────────────────────────

    /// Reconcile every fundraiser, coalescing with a full pass already in flight.
    pub async fn refresh(&self, trigger: Trigger) -> Result<RefreshSummary> {
        let observed = self.completed_full_passes.load(Ordering::SeqCst);
        let _guard = match self.pass_lock.try_lock() {
            Ok(guard) => guard,
            Err(_) => {
                debug!("Refresh already in flight; waiting for it");
                let guard = self.pass_lock.lock().await;
                if self.completed_full_passes.load(Ordering::SeqCst) > observed {
                    if let Some(mut summary) = self.last_full_summary.read().await.clone() {
                        summary.coalesced = true;
                        return Ok(summary);
                    }
                }
                guard
            }
        };

        let summary = self.run_pass(None, trigger).await?;
        *self.last_full_summary.write().await = Some(summary.clone());
        self.completed_full_passes.fetch_add(1, Ordering::SeqCst);
        Ok(summary)
    }

    /// Finally verify a contribution, then reconcile the fundraiser it belongs
    /// to (every fundraiser when it is not known from the last pass).
    pub async fn verify_contribution(&self, contribution_id: &str, notes: Option<&str>) -> Result<VerificationOutcome> {
        let receipt = self.gate.verify(contribution_id, notes).await?;

        let target = self.view.read().await.owners.get(receipt.contribution_id.as_str()).cloned();
        let summary = {
            let _guard = self.pass_lock.lock().await;
            match self.run_pass(target.map(|id| vec![id]), Trigger::Verification).await {
                Ok(summary) => Some(summary),
                Err(SettlementError::Cancelled) => None,
                Err(e) => return Err(e),
            }
        };

        let notice = match &summary {
            Some(s) if s.stale.is_empty() => gate::notice_for(&Ok(receipt.clone())),
            _ => Notice::Degraded(
                "Contribution verified; totals will update on the next refresh".to_string(),
            ),
        };
        Ok(VerificationOutcome {
            receipt,
            summary,
            notice,
        })
    }

    // ─────────────────────────────────────────────────────────
    // Pass internals
    // ─────────────────────────────────────────────────────────

    /// Run one pass over `targets` (all fundraisers when `None`). The caller
    /// holds `pass_lock`.
    async fn run_pass(&self, targets: Option<Vec<String>>, trigger: Trigger) -> Result<RefreshSummary> {
        let cancel = self.lifecycle.read().await.child_token();
        if cancel.is_cancelled() {
            return Err(SettlementError::Cancelled);
        }

        let (ids, previous) = {
            let mut view = self.view.write().await;
            let ids: Vec<String> = view
                .fundraisers
                .iter()
                .map(|f| f.id.clone())
                .filter(|id| targets.as_ref().map_or(true, |t| t.contains(id)))
                .collect();
            let mut previous = HashMap::new();
            for id in &ids {
                let state = view
                    .states
                    .get(id)
                    .cloned()
                    .unwrap_or(FundraiserState::Idle { cached: None });
                view.states.insert(
                    id.clone(),
                    FundraiserState::Refreshing {
                        last_good: state.last_good(),
                    },
                );
                previous.insert(id.clone(), state);
            }
            (ids, previous)
        };

        let outcomes = match self.scope {
            ReconcileScope::PerFundraiser => self.settle_each(&ids, &cancel).await,
            ReconcileScope::Owner => self.settle_owner_wide(&ids, &cancel).await,
        };

        let outcomes = match outcomes {
            Ok(outcomes) if !cancel.is_cancelled() => outcomes,
            _ => {
                let mut view = self.view.write().await;
                view.states.extend(previous);
                info!("Reconciliation pass ({trigger:?}) cancelled");
                return Err(SettlementError::Cancelled);
            }
        };

        let mut refreshed = Vec::new();
        let mut stale = Vec::new();
        let mut fresh_snapshots = Vec::new();
        {
            let mut view = self.view.write().await;
            for id in &ids {
                let last_good = previous.get(id).and_then(FundraiserState::last_good);
                match outcomes.get(id) {
                    Some(Ok(settled)) => {
                        let snapshot = Snapshot::now(settled.aggregate);
                        for cid in &settled.contribution_ids {
                            view.owners.insert(cid.clone(), id.clone());
                        }
                        view.states.insert(id.clone(), FundraiserState::Fresh(snapshot));
                        fresh_snapshots.push((id.clone(), snapshot));
                        refreshed.push(id.clone());
                    }
                    Some(Err(reason)) => {
                        warn!("Fundraiser {id} kept its last good figures: {reason}");
                        view.states.insert(id.clone(), FundraiserState::Stale { last_good });
                        stale.push(id.clone());
                    }
                    None => {
                        view.states.insert(id.clone(), FundraiserState::Stale { last_good });
                        stale.push(id.clone());
                    }
                }
            }
        }

        for (id, snapshot) in &fresh_snapshots {
            if let Err(e) = store::save_snapshot(&self.pool, id, snapshot).await {
                warn!("Failed to persist snapshot for {id}: {e}");
            }
        }

        let notice = pass_notice(refreshed.len(), stale.len());
        info!(
            "Reconciliation pass ({trigger:?}): {} fresh, {} stale: {}",
            refreshed.len(),
            stale.len(),
            notice.message()
        );
        let summary = RefreshSummary {
            trigger,
            refreshed,
            stale,
            coalesced: false,
            finished_at: Utc::now(),
            notice,
        };
        *self.last_summary.write().await = Some(summary.clone());
        Ok(summary)
    }

    /// One contribution fetch and resolver pass per fundraiser, concurrently.
    async fn settle_each(
        &self,
        ids: &[String],
        cancel: &CancellationToken,
    ) -> Result<HashMap<String, std::result::Result<Settled, String>>> {
        let mut tasks = JoinSet::new();
        for id in ids {
            let id = id.clone();
            let backend = self.backend.clone();
            let resolver = self.resolver.clone();
            let cancel = cancel.clone();
            tasks.spawn(async move {
                let outcome = settle_one(backend.as_ref(), resolver.as_ref(), &id, &cancel).await;
                (id, outcome)
            });
        }

        let mut outcomes = HashMap::new();
        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    tasks.abort_all();
                    return Err(SettlementError::Cancelled);
                }
                next = tasks.join_next() => match next {
                    None => break,
                    Some(Ok((_, Err(SettlementError::Cancelled)))) => {
                        tasks.abort_all();
                        return Err(SettlementError::Cancelled);
                    }
                    Some(Ok((id, outcome))) => {
                        outcomes.insert(id, outcome.map_err(|e| e.to_string()));
                    }
                    Some(Err(e)) => warn!("Reconciliation task failed: {e}"),
                },
            }
        }
        Ok(outcomes)
    }

    /// A single owner-wide fetch, one resolver pass, aggregates per fundraiser.
    async fn settle_owner_wide(
        &self,
        ids: &[String],
        cancel: &CancellationToken,
    ) -> Result<HashMap<String, std::result::Result<Settled, String>>> {
        let fetched = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(SettlementError::Cancelled),
            fetched = self.backend.owner_contributions() => fetched,
        };
        let contributions = match fetched {
            Ok(list) => list,
            Err(e) => {
                let reason = e.to_string();
                return Ok(ids.iter().map(|id| (id.clone(), Err(reason.clone()))).collect());
            }
        };

        let verified = match self.resolver.resolve(&contributions, cancel).await {
            Ok(verified) => verified,
            Err(SettlementError::Cancelled) => return Err(SettlementError::Cancelled),
            Err(e) => {
                let reason = e.to_string();
                return Ok(ids.iter().map(|id| (id.clone(), Err(reason.clone()))).collect());
            }
        };
        let mut grouped = aggregator::group_by_fundraiser(contributions);
        Ok(ids
            .iter()
            .map(|id| {
                let list = grouped.remove(id).unwrap_or_default();
                (id.clone(), Ok(settle(&list, &verified)))
            })
            .collect())
    }
}

async fn settle_one(
    backend: &dyn ContributionBackend,
    resolver: &dyn VerificationResolver,
    fundraiser_id: &str,
    cancel: &CancellationToken,
) -> Result<Settled> {
    let contributions = backend.fundraiser_contributions(fundraiser_id).await?;
    let verified = resolver.resolve(&contributions, cancel).await?;
    Ok(settle(&contributions, &verified))
}

fn settle(contributions: &[Contribution], verified: &VerifiedSet) -> Settled {
    Settled {
        aggregate: aggregator::aggregate(contributions, verified),
        contribution_ids: contributions.iter().map(|c| c.id.clone()).collect(),
    }
}

fn pass_notice(fresh: usize, stale: usize) -> Notice {
    match (fresh, stale) {
        (0, 0) => Notice::Success("No fundraisers to refresh".to_string()),
        (_, 0) => Notice::Success("Dashboard refreshed with live data".to_string()),
        (0, _) => Notice::Failure("Refresh failed, showing cached data".to_string()),
        (fresh, stale) => Notice::Degraded(format!(
            "Refreshed {fresh} of {} fundraisers; showing cached figures for {stale}",
            fresh + stale
        )),
    }
}
