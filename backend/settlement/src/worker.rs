//! Long-running background task that keeps the dashboard reconciled.

use std::sync::Arc;
use std::time::Duration;

use tokio::time::{interval_at, Instant, Interval, MissedTickBehavior};
use tracing::{error, info, warn};

use crate::reconcile::{Dashboard, Trigger};
use crate::session::{Session, SessionStatus};

pub struct WorkerState {
    pub dashboard: Arc<Dashboard>,
    pub session: Arc<Session>,
    pub refresh_interval: Option<Duration>,
}

/// Mount the dashboard, then refresh on schedule and after every re-login
/// until the session channel closes.
pub async fn run(state: Arc<WorkerState>) {
    info!("Reconciler starting");
    start(&state.dashboard).await;

    let mut status = state.session.subscribe();
    let mut ticker = state.refresh_interval.map(|period| {
        let mut ticker = interval_at(Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        ticker
    });

    loop {
        tokio::select! {
            changed = status.changed() => {
                if changed.is_err() {
                    break;
                }
                let current = status.borrow_and_update().clone();
                match current {
                    SessionStatus::Expired(reason) => {
                        warn!("Session expired ({reason}); log in again with PUT /session");
                    }
                    SessionStatus::Active => {
                        info!("Session active, reconciling");
                        start(&state.dashboard).await;
                    }
                }
            }
            _ = next_tick(&mut ticker) => {
                if let Err(e) = state.dashboard.refresh(Trigger::Schedule).await {
                    error!("Scheduled refresh failed: {e}");
                }
            }
        }
    }
    info!("Reconciler stopped");
}

/// Mount from cache; with nothing cached, pull the list from the backend.
async fn start(dashboard: &Dashboard) {
    match dashboard.mount().await {
        Ok(Some(_)) => {}
        Ok(None) => match dashboard.reload_fundraisers().await {
            Ok(0) => info!("No fundraisers to reconcile"),
            Ok(_) => {
                if let Err(e) = dashboard.refresh(Trigger::Mount).await {
                    error!("Initial refresh failed: {e}");
                }
            }
            Err(e) => error!("Failed to load fundraisers: {e}"),
        },
        Err(e) => error!("Failed to mount dashboard: {e}"),
    }
}

async fn next_tick(ticker: &mut Option<Interval>) {
    match ticker {
        Some(ticker) => {
            ticker.tick().await;
        }
        None => std::future::pending().await,
    }
}
