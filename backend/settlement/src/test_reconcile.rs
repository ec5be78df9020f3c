use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use crate::backend::ContributionBackend;
use crate::config::ReconcileScope;
use crate::errors::SettlementError;
use crate::fake_backend::FakeBackend;
use crate::invariants::{
    assert_aggregate_consistent, assert_aggregate_monotonic, assert_verified_monotonic,
    assert_verified_within_participants,
};
use crate::money::Amount;
use crate::reconcile::{Dashboard, FundraiserState, FundraiserView, Trigger};
use crate::resolver::{BatchedResolver, PerContributionResolver, VerificationResolver};
use crate::store;
use crate::submission::{self, SubmissionForm};
use crate::types::{Aggregate, Category, Notice};

const OWNER: &str = "asha";

async fn dashboard_with(fake: &Arc<FakeBackend>, scope: ReconcileScope) -> Dashboard {
    let pool = store::init_pool("sqlite::memory:").await.unwrap();
    let backend: Arc<dyn ContributionBackend> = fake.clone();
    let resolver: Arc<dyn VerificationResolver> = Arc::new(PerContributionResolver::new(backend.clone(), 4));
    let dashboard = Dashboard::new(backend, resolver, pool, scope);
    dashboard.reload_fundraisers().await.unwrap();
    dashboard
}

async fn dashboard(fake: &Arc<FakeBackend>) -> Dashboard {
    dashboard_with(fake, ReconcileScope::PerFundraiser).await
}

async fn view(dashboard: &Dashboard, fundraiser_id: &str) -> FundraiserView {
    dashboard
        .views()
        .await
        .into_iter()
        .find(|v| v.fundraiser.id == fundraiser_id)
        .unwrap()
}

fn per_id(fake: &Arc<FakeBackend>) -> PerContributionResolver {
    PerContributionResolver::new(fake.clone(), 4)
}

fn form(fundraiser_id: &str, name: &str, reference: &str, amount: i64) -> SubmissionForm {
    SubmissionForm {
        fundraiser_id: fundraiser_id.to_string(),
        participant_name: name.to_string(),
        payment_reference: reference.to_string(),
        amount: Some(Amount::from_major(amount)),
        email: None,
        fundraiser_type: Some(Category::Donation),
        fundraiser_title: "Temple Roof".to_string(),
    }
}

#[tokio::test]
async fn claimed_then_verified_payment_flows_into_collected() {
    let fake = Arc::new(FakeBackend::new(OWNER));
    fake.add_fundraiser("f1", OWNER).await;
    let dashboard = dashboard(&fake).await;

    let a = submission::submit(fake.as_ref(), &form("f1", "Kiran", "111111111111", 500))
        .await
        .unwrap();
    submission::submit(fake.as_ref(), &form("f1", "Meera", "222222222222", 300))
        .await
        .unwrap();

    dashboard.refresh(Trigger::Manual).await.unwrap();
    let before = view(&dashboard, "f1").await;
    assert_eq!(
        before.aggregate,
        Aggregate {
            collected: Amount::ZERO,
            participants: 2,
            finally_verified_count: 0,
        }
    );
    assert!(before.live_data_loaded);

    let outcome = dashboard.verify_contribution(&a.id, Some("seen in bank statement")).await.unwrap();
    assert!(!outcome.receipt.already_verified);
    assert_eq!(outcome.summary.as_ref().unwrap().refreshed, vec!["f1".to_string()]);
    assert!(matches!(outcome.notice, Notice::Success(_)));

    let after = view(&dashboard, "f1").await;
    assert_eq!(
        after.aggregate,
        Aggregate {
            collected: Amount::from_major(500),
            participants: 2,
            finally_verified_count: 1,
        }
    );
    assert_aggregate_monotonic(&before.aggregate, &after.aggregate);
}

#[tokio::test]
async fn collected_counts_verified_contributions_only() {
    let fake = Arc::new(FakeBackend::new(OWNER));
    fake.add_fundraiser("f1", OWNER).await;
    let a = fake.add_contribution("f1", "Kiran", "111111111111", "120.50").await;
    fake.add_contribution("f1", "Meera", "222222222222", "80").await;
    let c = fake.add_contribution("f1", "Arjun", "333333333333", "0.25").await;
    fake.mark_verified(&a).await;
    fake.mark_verified(&c).await;

    let contributions = fake.fundraiser_contributions("f1").await.unwrap();
    let verified = per_id(&fake)
        .resolve(&contributions, &CancellationToken::new())
        .await
        .unwrap();
    let agg = crate::aggregator::aggregate(&contributions, &verified);

    assert_eq!(agg.collected, Amount::from_minor(12_075));
    assert_aggregate_consistent(&agg, &contributions, &verified);
}

#[tokio::test]
async fn resolving_twice_gives_the_same_set() {
    let fake = Arc::new(FakeBackend::new(OWNER));
    fake.add_fundraiser("f1", OWNER).await;
    for i in 0..6 {
        let id = fake
            .add_contribution("f1", &format!("p{i}"), &format!("{i:012}"), "10")
            .await;
        if i % 2 == 0 {
            fake.mark_verified(&id).await;
        }
    }
    let contributions = fake.fundraiser_contributions("f1").await.unwrap();
    let resolver = per_id(&fake);
    let cancel = CancellationToken::new();

    let first = resolver.resolve(&contributions, &cancel).await.unwrap();
    let second = resolver.resolve(&contributions, &cancel).await.unwrap();
    assert_eq!(first, second);
    assert_eq!(first.len(), 3);
    assert_verified_monotonic(&first, &second);
    // No caching between passes.
    assert_eq!(fake.status_calls.load(Ordering::SeqCst), 12);
}

#[tokio::test]
async fn failed_status_check_counts_as_pending() {
    let fake = Arc::new(FakeBackend::new(OWNER));
    fake.add_fundraiser("f1", OWNER).await;
    let a = fake.add_contribution("f1", "Kiran", "111111111111", "500").await;
    let b = fake.add_contribution("f1", "Meera", "222222222222", "300").await;
    fake.mark_verified(&a).await;
    fake.mark_verified(&b).await;
    fake.failing_status.lock().await.insert(a.clone());

    let dashboard = dashboard(&fake).await;
    let summary = dashboard.refresh(Trigger::Manual).await.unwrap();

    assert!(summary.stale.is_empty());
    let row = view(&dashboard, "f1").await;
    assert_eq!(row.aggregate.collected, Amount::from_major(300));
    assert_eq!(row.aggregate.finally_verified_count, 1);
    assert_eq!(row.aggregate.participants, 2);
    assert_verified_within_participants(&row.aggregate);
}

#[tokio::test]
async fn failing_fundraiser_keeps_last_good_while_others_update() {
    let fake = Arc::new(FakeBackend::new(OWNER));
    fake.add_fundraiser("f1", OWNER).await;
    fake.add_fundraiser("f2", OWNER).await;
    let a = fake.add_contribution("f1", "Kiran", "111111111111", "500").await;
    let b = fake.add_contribution("f2", "Meera", "222222222222", "300").await;
    fake.mark_verified(&a).await;

    let dashboard = dashboard(&fake).await;
    dashboard.refresh(Trigger::Manual).await.unwrap();
    let good = dashboard.state("f1").await.unwrap().last_good().unwrap();

    fake.mark_verified(&b).await;
    fake.failing_fundraisers.lock().await.insert("f1".to_string());
    let summary = dashboard.refresh(Trigger::Manual).await.unwrap();

    assert_eq!(summary.stale, vec!["f1".to_string()]);
    assert_eq!(summary.refreshed, vec!["f2".to_string()]);
    assert!(matches!(summary.notice, Notice::Degraded(_)));
    assert_eq!(
        dashboard.state("f1").await,
        Some(FundraiserState::Stale { last_good: Some(good) })
    );

    let f1 = view(&dashboard, "f1").await;
    assert_eq!(f1.aggregate.collected, Amount::from_major(500));
    assert!(!f1.live_data_loaded);
    assert_eq!(f1.state, "stale");

    let f2 = view(&dashboard, "f2").await;
    assert_eq!(f2.aggregate.collected, Amount::from_major(300));
    assert!(f2.live_data_loaded);
}

#[tokio::test]
async fn stale_without_history_shows_reported_figures() {
    let fake = Arc::new(FakeBackend::new(OWNER));
    fake.add_fundraiser("f1", OWNER).await;
    {
        let mut list = fake.fundraisers.lock().await;
        list[0].participants = 7;
        list[0].collected = Amount::from_major(40);
        list[0].finally_verified_count = 2;
    }
    fake.failing_fundraisers.lock().await.insert("f1".to_string());

    let dashboard = dashboard(&fake).await;
    let summary = dashboard.refresh(Trigger::Manual).await.unwrap();

    assert!(matches!(summary.notice, Notice::Failure(_)));
    let row = view(&dashboard, "f1").await;
    assert_eq!(row.aggregate.participants, 7);
    assert_eq!(row.aggregate.collected, Amount::from_major(40));
    assert_eq!(row.computed_at, None);
}

#[tokio::test]
async fn concurrent_refreshes_share_one_pass() {
    let fake = Arc::new(FakeBackend {
        read_delay: Duration::from_millis(100),
        ..FakeBackend::new(OWNER)
    });
    fake.add_fundraiser("f1", OWNER).await;
    fake.add_fundraiser("f2", OWNER).await;
    let dashboard = dashboard(&fake).await;

    let (first, second) = tokio::join!(
        dashboard.refresh(Trigger::Manual),
        dashboard.refresh(Trigger::Manual)
    );
    let (first, second) = (first.unwrap(), second.unwrap());

    assert!(!first.coalesced);
    assert!(second.coalesced);
    assert_eq!(first.finished_at, second.finished_at);
    assert_eq!(fake.listing_calls.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn unmount_cancels_pass_and_leaves_state_untouched() {
    let fake = Arc::new(FakeBackend {
        read_delay: Duration::from_millis(300),
        ..FakeBackend::new(OWNER)
    });
    fake.add_fundraiser("f1", OWNER).await;
    fake.add_contribution("f1", "Kiran", "111111111111", "500").await;
    let dashboard = Arc::new(dashboard(&fake).await);

    let running = {
        let dashboard = dashboard.clone();
        tokio::spawn(async move { dashboard.refresh(Trigger::Manual).await })
    };
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(dashboard.is_refreshing());
    dashboard.unmount().await;

    let result = running.await.unwrap();
    assert!(matches!(result, Err(SettlementError::Cancelled)));
    assert_eq!(
        dashboard.state("f1").await,
        Some(FundraiserState::Idle { cached: None })
    );
    assert!(dashboard.last_summary().await.is_none());

    // Further passes are refused until the next mount.
    assert!(matches!(
        dashboard.refresh(Trigger::Manual).await,
        Err(SettlementError::Cancelled)
    ));
}

#[tokio::test]
async fn remount_shows_cached_snapshot_when_backend_is_down() {
    let fake = Arc::new(FakeBackend::new(OWNER));
    fake.add_fundraiser("f1", OWNER).await;
    let a = fake.add_contribution("f1", "Kiran", "111111111111", "500").await;
    fake.mark_verified(&a).await;

    let dashboard = dashboard(&fake).await;
    dashboard.refresh(Trigger::Manual).await.unwrap();
    let good = dashboard.state("f1").await.unwrap().last_good().unwrap();
    dashboard.unmount().await;

    fake.failing_fundraisers.lock().await.insert("f1".to_string());
    let summary = dashboard.mount().await.unwrap().unwrap();

    assert_eq!(summary.trigger, Trigger::Mount);
    assert_eq!(summary.stale, vec!["f1".to_string()]);
    // Snapshots are persisted at second precision.
    let state = dashboard.state("f1").await.unwrap();
    assert_eq!(state.label(), "stale");
    let cached = state.last_good().unwrap();
    assert_eq!(cached.aggregate, good.aggregate);
    assert_eq!(cached.computed_at.timestamp(), good.computed_at.timestamp());
}

#[tokio::test]
async fn mount_with_empty_cache_does_not_refresh() {
    let fake = Arc::new(FakeBackend::new(OWNER));
    let pool = store::init_pool("sqlite::memory:").await.unwrap();
    let backend: Arc<dyn ContributionBackend> = fake.clone();
    let resolver: Arc<dyn VerificationResolver> = Arc::new(PerContributionResolver::new(backend.clone(), 2));
    let dashboard = Dashboard::new(backend, resolver, pool, ReconcileScope::PerFundraiser);

    assert!(dashboard.mount().await.unwrap().is_none());
    assert_eq!(fake.listing_calls.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn verification_of_unknown_contribution_refreshes_everything() {
    let fake = Arc::new(FakeBackend::new(OWNER));
    fake.add_fundraiser("f1", OWNER).await;
    fake.add_fundraiser("f2", OWNER).await;
    let a = fake.add_contribution("f2", "Kiran", "111111111111", "75").await;
    let dashboard = dashboard(&fake).await;

    let outcome = dashboard.verify_contribution(&a, None).await.unwrap();
    let summary = outcome.summary.unwrap();
    assert_eq!(summary.trigger, Trigger::Verification);
    assert_eq!(summary.refreshed.len(), 2);
    assert_eq!(view(&dashboard, "f2").await.aggregate.collected, Amount::from_major(75));
}

#[tokio::test]
async fn owner_scope_fetches_once_and_splits_by_fundraiser() {
    let fake = Arc::new(FakeBackend::new(OWNER));
    fake.add_fundraiser("f1", OWNER).await;
    fake.add_fundraiser("f2", OWNER).await;
    fake.add_fundraiser("f3", OWNER).await;
    let a = fake.add_contribution("f1", "Kiran", "111111111111", "500").await;
    fake.add_contribution("f1", "Meera", "222222222222", "300").await;
    let c = fake.add_contribution("f2", "Arjun", "333333333333", "45.50").await;
    fake.mark_verified(&a).await;
    fake.mark_verified(&c).await;

    let dashboard = dashboard_with(&fake, ReconcileScope::Owner).await;
    let summary = dashboard.refresh(Trigger::Manual).await.unwrap();

    assert_eq!(summary.refreshed.len(), 3);
    assert_eq!(fake.listing_calls.load(Ordering::SeqCst), 1);
    assert_eq!(view(&dashboard, "f1").await.aggregate.collected, Amount::from_major(500));
    assert_eq!(view(&dashboard, "f2").await.aggregate.collected, Amount::from_minor(4_550));
    assert_eq!(view(&dashboard, "f3").await.aggregate, Aggregate::default());
}

#[tokio::test]
async fn owner_scope_listing_failure_marks_everything_stale() {
    let fake = Arc::new(FakeBackend::new(OWNER));
    fake.add_fundraiser("f1", OWNER).await;
    fake.add_fundraiser("f2", OWNER).await;
    fake.fail_owner_listing.store(true, Ordering::SeqCst);

    let dashboard = dashboard_with(&fake, ReconcileScope::Owner).await;
    let summary = dashboard.refresh(Trigger::Manual).await.unwrap();

    assert_eq!(summary.stale.len(), 2);
    assert!(summary.refreshed.is_empty());
    assert!(matches!(summary.notice, Notice::Failure(_)));
}

#[tokio::test]
async fn batched_resolver_chunks_requests() {
    let fake = Arc::new(FakeBackend::new(OWNER));
    fake.add_fundraiser("f1", OWNER).await;
    for i in 0..5 {
        let id = fake.add_contribution("f1", &format!("p{i}"), &format!("{i:012}"), "1").await;
        if i < 2 {
            fake.mark_verified(&id).await;
        }
    }
    let contributions = fake.fundraiser_contributions("f1").await.unwrap();
    let resolver = BatchedResolver::new(fake.clone(), per_id(&fake), 2);

    let verified = resolver.resolve(&contributions, &CancellationToken::new()).await.unwrap();
    assert_eq!(verified.len(), 2);
    assert_eq!(fake.bulk_calls.load(Ordering::SeqCst), 3);
    assert_eq!(fake.status_calls.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn batched_resolver_falls_back_to_per_id_checks() {
    let fake = Arc::new(FakeBackend::new(OWNER));
    fake.add_fundraiser("f1", OWNER).await;
    let a = fake.add_contribution("f1", "Kiran", "111111111111", "500").await;
    fake.add_contribution("f1", "Meera", "222222222222", "300").await;
    fake.mark_verified(&a).await;
    fake.fail_bulk.store(true, Ordering::SeqCst);

    let contributions = fake.fundraiser_contributions("f1").await.unwrap();
    let resolver = BatchedResolver::new(fake.clone(), per_id(&fake), 100);

    let verified = resolver.resolve(&contributions, &CancellationToken::new()).await.unwrap();
    assert!(verified.contains(&a));
    assert_eq!(verified.len(), 1);
    assert_eq!(fake.bulk_calls.load(Ordering::SeqCst), 1);
    assert_eq!(fake.status_calls.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn cancelled_resolution_returns_no_partial_set() {
    let fake = Arc::new(FakeBackend {
        read_delay: Duration::from_millis(200),
        ..FakeBackend::new(OWNER)
    });
    fake.add_fundraiser("f1", OWNER).await;
    fake.add_contribution("f1", "Kiran", "111111111111", "500").await;
    let contributions = fake.fundraiser_contributions("f1").await.unwrap();

    let cancel = CancellationToken::new();
    cancel.cancel();
    let result = per_id(&fake).resolve(&contributions, &cancel).await;
    assert!(matches!(result, Err(SettlementError::Cancelled)));
}

#[tokio::test]
async fn expired_session_during_status_checks_keeps_last_good_figures() {
    let fake = Arc::new(FakeBackend::new(OWNER));
    fake.add_fundraiser("f1", OWNER).await;
    let a = fake.add_contribution("f1", "Kiran", "111111111111", "500").await;
    fake.mark_verified(&a).await;

    let dashboard = dashboard(&fake).await;
    dashboard.refresh(Trigger::Manual).await.unwrap();
    let good = dashboard.state("f1").await.unwrap().last_good().unwrap();

    fake.session_expired.store(true, Ordering::SeqCst);
    let summary = dashboard.refresh(Trigger::Manual).await.unwrap();

    assert_eq!(summary.stale, vec!["f1".to_string()]);
    assert!(summary.refreshed.is_empty());
    assert!(matches!(summary.notice, Notice::Failure(_)));
    assert_eq!(
        dashboard.state("f1").await,
        Some(FundraiserState::Stale { last_good: Some(good) })
    );
    let row = view(&dashboard, "f1").await;
    assert_eq!(row.aggregate.collected, Amount::from_major(500));
    assert!(!row.live_data_loaded);

    // The persisted snapshot was not overwritten either.
    dashboard.mount().await.unwrap();
    let cached = dashboard.state("f1").await.unwrap().last_good().unwrap();
    assert_eq!(cached.aggregate, good.aggregate);
}

#[tokio::test]
async fn owner_scope_expired_session_marks_everything_stale() {
    let fake = Arc::new(FakeBackend::new(OWNER));
    fake.add_fundraiser("f1", OWNER).await;
    fake.add_fundraiser("f2", OWNER).await;
    let a = fake.add_contribution("f1", "Kiran", "111111111111", "500").await;
    fake.mark_verified(&a).await;

    let dashboard = dashboard_with(&fake, ReconcileScope::Owner).await;
    dashboard.refresh(Trigger::Manual).await.unwrap();

    fake.session_expired.store(true, Ordering::SeqCst);
    let summary = dashboard.refresh(Trigger::Manual).await.unwrap();

    assert_eq!(summary.stale.len(), 2);
    assert!(summary.refreshed.is_empty());
    assert_eq!(view(&dashboard, "f1").await.aggregate.collected, Amount::from_major(500));
}

#[tokio::test]
async fn resolvers_give_up_on_an_expired_session() {
    let fake = Arc::new(FakeBackend::new(OWNER));
    fake.add_fundraiser("f1", OWNER).await;
    let a = fake.add_contribution("f1", "Kiran", "111111111111", "500").await;
    fake.mark_verified(&a).await;
    fake.session_expired.store(true, Ordering::SeqCst);
    let contributions = fake.fundraiser_contributions("f1").await.unwrap();
    let cancel = CancellationToken::new();

    let per_id_result = per_id(&fake).resolve(&contributions, &cancel).await;
    assert!(matches!(per_id_result, Err(SettlementError::Authentication(_))));

    let batched = BatchedResolver::new(fake.clone(), per_id(&fake), 10);
    let batched_result = batched.resolve(&contributions, &cancel).await;
    assert!(matches!(batched_result, Err(SettlementError::Authentication(_))));
    // No per-id fallback after the bulk check was rejected.
    assert_eq!(fake.status_calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn coalesced_refresh_reports_the_full_pass_not_a_verification() {
    let fake = Arc::new(FakeBackend {
        read_delay: Duration::from_millis(100),
        ..FakeBackend::new(OWNER)
    });
    fake.add_fundraiser("f1", OWNER).await;
    fake.add_fundraiser("f2", OWNER).await;
    let a = fake.add_contribution("f1", "Kiran", "111111111111", "500").await;
    fake.add_contribution("f2", "Meera", "222222222222", "300").await;
    let dashboard = Arc::new(dashboard(&fake).await);
    dashboard.refresh(Trigger::Manual).await.unwrap();

    let full = {
        let dashboard = dashboard.clone();
        tokio::spawn(async move { dashboard.refresh(Trigger::Manual).await })
    };
    tokio::time::sleep(Duration::from_millis(20)).await;
    let verification = {
        let dashboard = dashboard.clone();
        tokio::spawn(async move { dashboard.verify_contribution(&a, None).await })
    };
    tokio::time::sleep(Duration::from_millis(20)).await;
    let waiter = dashboard.refresh(Trigger::Manual).await.unwrap();

    let full = full.await.unwrap().unwrap();
    let targeted = verification.await.unwrap().unwrap().summary.unwrap();
    assert_eq!(targeted.refreshed, vec!["f1".to_string()]);

    assert!(waiter.coalesced);
    assert_eq!(waiter.trigger, Trigger::Manual);
    assert_eq!(waiter.refreshed.len(), 2);
    assert_eq!(waiter.finished_at, full.finished_at);
}

#[tokio::test]
async fn reload_forgets_contributions_of_dropped_fundraisers() {
    let fake = Arc::new(FakeBackend::new(OWNER));
    fake.add_fundraiser("f1", OWNER).await;
    fake.add_fundraiser("f2", OWNER).await;
    let a = fake.add_contribution("f1", "Kiran", "111111111111", "500").await;
    let b = fake.add_contribution("f2", "Meera", "222222222222", "300").await;

    let dashboard = dashboard(&fake).await;
    dashboard.refresh(Trigger::Manual).await.unwrap();
    assert_eq!(dashboard.owner_of(&b).await.as_deref(), Some("f2"));

    fake.fundraisers.lock().await.retain(|f| f.id != "f2");
    assert_eq!(dashboard.reload_fundraisers().await.unwrap(), 1);

    assert_eq!(dashboard.owner_of(&b).await, None);
    assert_eq!(dashboard.owner_of(&a).await.as_deref(), Some("f1"));
    assert_eq!(dashboard.state("f2").await, None);
}
