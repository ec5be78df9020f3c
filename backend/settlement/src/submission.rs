//! Contribution submission: a contributor's claim that they paid.
//!
//! Submitting only records the claim. It never touches a fundraiser's
//! `collected` / `participants` figures; those are recomputed by the
//! aggregator on the next reconciliation pass.

use tracing::info;

use crate::backend::ContributionBackend;
use crate::errors::{Result, SettlementError, ValidationError};
use crate::money::Amount;
use crate::types::{Category, Contribution, NewContribution, Notice};

/// Length of a payment reference (UPI transaction reference number).
pub const REFERENCE_LEN: usize = 12;

/// Raw form input, before validation.
#[derive(Debug, Clone, Default, serde::Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubmissionForm {
    pub fundraiser_id: String,
    pub participant_name: String,
    pub payment_reference: String,
    pub amount: Option<Amount>,
    #[serde(default)]
    pub email: Option<String>,
    pub fundraiser_type: Option<Category>,
    #[serde(default)]
    pub fundraiser_title: String,
}

pub fn is_valid_reference(reference: &str) -> bool {
    reference.len() == REFERENCE_LEN && reference.bytes().all(|b| b.is_ascii_digit())
}

/// Check and normalise a form. Nothing is sent when this fails.
pub fn validate(form: &SubmissionForm) -> std::result::Result<NewContribution, ValidationError> {
    let fundraiser_id = form.fundraiser_id.trim();
    if fundraiser_id.is_empty() {
        return Err(ValidationError::MissingField("fundraiserId"));
    }
    let participant_name = form.participant_name.trim();
    if participant_name.is_empty() {
        return Err(ValidationError::EmptyName);
    }
    let payment_reference = form.payment_reference.trim();
    if !is_valid_reference(payment_reference) {
        return Err(ValidationError::MalformedReference);
    }
    let amount = form.amount.ok_or(ValidationError::MissingField("amount"))?;
    if !amount.is_positive() {
        return Err(ValidationError::NonPositiveAmount);
    }
    let fundraiser_type = form
        .fundraiser_type
        .ok_or(ValidationError::MissingField("fundraiserType"))?;

    let email = match form.email.as_deref().map(str::trim) {
        None | Some("") => None,
        Some(e) if looks_like_email(e) => Some(e.to_string()),
        Some(_) => return Err(ValidationError::MalformedEmail),
    };

    Ok(NewContribution {
        fundraiser_id: fundraiser_id.to_string(),
        participant_name: participant_name.to_string(),
        payment_reference: payment_reference.to_string(),
        amount,
        email,
        fundraiser_type,
        fundraiser_title: form.fundraiser_title.trim().to_string(),
    })
}

fn looks_like_email(s: &str) -> bool {
    match s.split_once('@') {
        Some((local, domain)) => !local.is_empty() && domain.contains('.') && !domain.starts_with('.'),
        None => false,
    }
}

/// Validate and record a claimed contribution.
pub async fn submit(backend: &dyn ContributionBackend, form: &SubmissionForm) -> Result<Contribution> {
    let request = validate(form)?;
    let created = backend.submit_contribution(&request).await?;
    info!(
        "Contribution {} claimed on fundraiser {} ({})",
        created.id, created.fundraiser_id, created.amount
    );
    Ok(created)
}

/// The one notice shown for a submission attempt.
pub fn notice_for(result: &Result<Contribution>) -> Notice {
    match result {
        Ok(c) => Notice::Success(format!(
            "Payment of {} recorded for {}; it counts once the organiser verifies it",
            c.amount, c.participant_name
        )),
        Err(SettlementError::Validation(v)) => Notice::Failure(v.to_string()),
        Err(e) if e.requires_login() => {
            Notice::Failure("Your session has expired. Please log in again.".to_string())
        }
        Err(e) => Notice::Failure(format!("Could not record payment: {e}")),
    }
}
