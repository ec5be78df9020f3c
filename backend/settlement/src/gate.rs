//! Final verification gate: the owner-only promotion of a claimed
//! contribution to finally verified.
//!
//! The promotion never reverts, so repeating it is harmless. A repeat call is
//! reported as a successful receipt with `already_verified` set rather than
//! as an error.

use std::sync::Arc;

use tracing::{info, warn};

use crate::backend::ContributionBackend;
use crate::errors::{Result, SettlementError};
use crate::types::{Notice, VerificationReceipt};

pub struct FinalVerificationGate {
    backend: Arc<dyn ContributionBackend>,
}

impl FinalVerificationGate {
    pub fn new(backend: Arc<dyn ContributionBackend>) -> Self {
        FinalVerificationGate { backend }
    }

    /// Finally verify one contribution. Aggregates are not updated here;
    /// callers re-run reconciliation to observe the new totals.
    pub async fn verify(&self, contribution_id: &str, notes: Option<&str>) -> Result<VerificationReceipt> {
        let contribution_id = contribution_id.trim();
        if contribution_id.is_empty() {
            return Err(SettlementError::NotFound("empty contribution id".to_string()));
        }
        let notes = notes.map(str::trim).filter(|n| !n.is_empty());

        match self.backend.finally_verify(contribution_id, notes).await {
            Ok(receipt) => {
                info!("Contribution {contribution_id} finally verified");
                Ok(receipt)
            }
            Err(SettlementError::AlreadyVerified(_)) => {
                info!("Contribution {contribution_id} was already finally verified");
                Ok(VerificationReceipt {
                    contribution_id: contribution_id.to_string(),
                    verified_by: None,
                    verified_at: None,
                    notes: notes.map(String::from),
                    already_verified: true,
                })
            }
            Err(e) => {
                warn!("Final verification of {contribution_id} failed: {e}");
                Err(e)
            }
        }
    }
}

/// The one notice shown for a verification attempt.
pub fn notice_for(result: &Result<VerificationReceipt>) -> Notice {
    match result {
        Ok(r) if r.already_verified => Notice::Success("Contribution was already verified".to_string()),
        Ok(_) => Notice::Success("Contribution finally verified".to_string()),
        Err(SettlementError::Authorization(m)) => Notice::Failure(m.clone()),
        Err(e) if e.requires_login() => {
            Notice::Failure("Your session has expired. Please log in again.".to_string())
        }
        Err(e) => Notice::Failure(format!("Verification failed: {e}")),
    }
}
