//! # Types
//!
//! Shared data structures used across the settlement engine.
//!
//! ## Contribution lifecycle
//!
//! A contribution is a contributor's *claim* of payment. Only the owner of
//! the parent fundraiser can promote it, and the promotion is one-way:
//!
//! ```text
//! Claimed ──► FinallyVerified
//! ```
//!
//! There is no rejected state; a claim that is never verified simply stays
//! pending and keeps counting as a participant.
//!
//! ## Derived fundraiser fields
//!
//! `collected`, `participants` and `finally_verified_count` are never
//! incremented in place. They are recomputed from scratch on every
//! reconciliation pass into an [`Aggregate`].

use std::collections::HashSet;

use chrono::{DateTime, NaiveDateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};

use crate::money::Amount;

/// Kind of fundraiser. Only events ask every participant for a fixed amount.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Category {
    Donation,
    Event,
    Gift,
}

impl Category {
    pub fn is_fixed_amount(self) -> bool {
        matches!(self, Category::Event)
    }
}

/// A fundraiser as listed for its owner.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Fundraiser {
    pub id: String,
    #[serde(alias = "createdBy", alias = "creatorUsername", alias = "createdByUsername")]
    pub owner: String,
    #[serde(alias = "type")]
    pub category: Category,
    #[serde(alias = "eventTitle")]
    pub title: String,
    #[serde(default, alias = "eventDescription")]
    pub description: String,
    #[serde(default, alias = "amount", alias = "eventAmount")]
    pub target_amount: Option<Amount>,
    #[serde(default, alias = "upiId")]
    pub payment_id: String,
    #[serde(default, alias = "paymentMessage", alias = "upiMsg")]
    pub message: String,
    #[serde(default, alias = "imageUrl", alias = "imageDataUrl")]
    pub image: Option<String>,
    /// Backend-reported values, shown until the first reconciliation succeeds.
    #[serde(default)]
    pub collected: Amount,
    #[serde(default, deserialize_with = "count_or_list")]
    pub participants: u64,
    #[serde(default)]
    pub finally_verified_count: u64,
}

impl Fundraiser {
    /// Target amount, present only for fixed-amount categories.
    pub fn target(&self) -> Option<Amount> {
        if self.category.is_fixed_amount() {
            self.target_amount
        } else {
            None
        }
    }

    /// The derived fields as reported with the fundraiser record itself.
    pub fn reported_aggregate(&self) -> Aggregate {
        Aggregate {
            collected: self.collected,
            participants: self.participants,
            finally_verified_count: self.finally_verified_count.min(self.participants),
        }
    }
}

/// Some backends list participant usernames instead of a count.
fn count_or_list<'de, D: Deserializer<'de>>(deserializer: D) -> Result<u64, D::Error> {
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum CountOrList {
        Count(u64),
        List(Vec<serde_json::Value>),
        Null(Option<()>),
    }

    Ok(match CountOrList::deserialize(deserializer)? {
        CountOrList::Count(n) => n,
        CountOrList::List(items) => items.len() as u64,
        CountOrList::Null(_) => 0,
    })
}

/// A submitted payment claim.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Contribution {
    #[serde(alias = "participantId", alias = "contributionId")]
    pub id: String,
    pub fundraiser_id: String,
    pub participant_name: String,
    #[serde(alias = "utrNumber")]
    pub payment_reference: String,
    #[serde(alias = "amountPaid")]
    pub amount: Amount,
    #[serde(default)]
    pub email: Option<String>,
    #[serde(default)]
    pub fundraiser_type: Option<Category>,
    #[serde(default)]
    pub fundraiser_title: Option<String>,
}

/// Body of a new payment claim.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewContribution {
    pub fundraiser_id: String,
    pub participant_name: String,
    pub payment_reference: String,
    pub amount: Amount,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
    pub fundraiser_type: Category,
    pub fundraiser_title: String,
}

/// Outcome of a final-verification call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VerificationReceipt {
    pub contribution_id: String,
    #[serde(default)]
    pub verified_by: Option<String>,
    #[serde(default, deserialize_with = "lenient_timestamp")]
    pub verified_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub notes: Option<String>,
    /// The contribution was already finally verified before this call.
    #[serde(default)]
    pub already_verified: bool,
}

/// Accepts RFC 3339 and zone-less ISO timestamps (the latter read as UTC).
pub fn parse_timestamp(raw: &str) -> Option<DateTime<Utc>> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(raw) {
        return Some(dt.with_timezone(&Utc));
    }
    NaiveDateTime::parse_from_str(raw, "%Y-%m-%dT%H:%M:%S%.f")
        .ok()
        .map(|naive| naive.and_utc())
}

fn lenient_timestamp<'de, D: Deserializer<'de>>(
    deserializer: D,
) -> Result<Option<DateTime<Utc>>, D::Error> {
    let raw: Option<String> = Option::deserialize(deserializer)?;
    Ok(raw.as_deref().and_then(parse_timestamp))
}

/// Ids of contributions known to be finally verified during one pass.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct VerifiedSet(HashSet<String>);

impl VerifiedSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, id: impl Into<String>) -> bool {
        self.0.insert(id.into())
    }

    pub fn contains(&self, id: &str) -> bool {
        self.0.contains(id)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &String> {
        self.0.iter()
    }
}

impl FromIterator<String> for VerifiedSet {
    fn from_iter<I: IntoIterator<Item = String>>(iter: I) -> Self {
        VerifiedSet(iter.into_iter().collect())
    }
}

impl Extend<String> for VerifiedSet {
    fn extend<I: IntoIterator<Item = String>>(&mut self, iter: I) {
        self.0.extend(iter)
    }
}

/// Derived settlement figures for one fundraiser.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Aggregate {
    /// Sum of finally-verified amounts only.
    pub collected: Amount,
    /// Every submitted contribution, verified or not.
    pub participants: u64,
    pub finally_verified_count: u64,
}

/// An aggregate plus the moment it was computed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Snapshot {
    pub aggregate: Aggregate,
    pub computed_at: DateTime<Utc>,
}

impl Snapshot {
    pub fn now(aggregate: Aggregate) -> Self {
        Snapshot {
            aggregate,
            computed_at: Utc::now(),
        }
    }
}

/// The single user-visible message produced by a user-initiated action.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "level", content = "message", rename_all = "snake_case")]
pub enum Notice {
    Success(String),
    Degraded(String),
    Failure(String),
}

impl Notice {
    pub fn message(&self) -> &str {
        match self {
            Notice::Success(m) | Notice::Degraded(m) | Notice::Failure(m) => m,
        }
    }
}
