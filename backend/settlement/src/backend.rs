//! The backend contract the settlement engine depends on.
//!
//! | Call                         | REST                                                  |
//! |------------------------------|-------------------------------------------------------|
//! | `submit_contribution`        | `POST /contributions`                                 |
//! | `fundraiser_contributions`   | `GET /fundraisers/{id}/contributions`                 |
//! | `owner_contributions`        | `GET /contributions`                                  |
//! | `owner_fundraisers`          | `GET /fundraisers`                                    |
//! | `verification_status`        | `GET /contributions/{id}/final-verification`          |
//! | `verification_statuses`      | `POST /contributions/final-verification/bulk-check`   |
//! | `finally_verify`             | `POST /contributions/{id}/final-verification`         |
//!
//! [`crate::client::BackendClient`] is the HTTP implementation; tests use an
//! in-memory fake.

use std::collections::HashMap;

use async_trait::async_trait;

use crate::errors::Result;
use crate::types::{Contribution, Fundraiser, NewContribution, VerificationReceipt};

#[async_trait]
pub trait ContributionBackend: Send + Sync {
    /// Record a claimed contribution. Duplicate references on the same
    /// fundraiser fail with `ValidationError::DuplicateReference`.
    async fn submit_contribution(&self, contribution: &NewContribution) -> Result<Contribution>;

    async fn fundraiser_contributions(&self, fundraiser_id: &str) -> Result<Vec<Contribution>>;

    /// Every contribution across the caller's own fundraisers.
    async fn owner_contributions(&self) -> Result<Vec<Contribution>>;

    async fn owner_fundraisers(&self) -> Result<Vec<Fundraiser>>;

    async fn verification_status(&self, contribution_id: &str) -> Result<bool>;

    /// Bulk status check. Ids missing from the answer are not verified.
    async fn verification_statuses(&self, contribution_ids: &[String]) -> Result<HashMap<String, bool>>;

    /// Promote a claimed contribution to finally verified. Only the owner of
    /// the parent fundraiser may do this.
    async fn finally_verify(&self, contribution_id: &str, notes: Option<&str>) -> Result<VerificationReceipt>;
}
