//! Contribution verification and settlement reconciliation.
//!
//! Participants claim a payment by submitting a contribution with a 12-digit
//! payment reference. The fundraiser owner later confirms receipt through the
//! final-verification gate. Only finally verified contributions count towards
//! a fundraiser's collected total.
//!
//! | Phase            | Module          | Operation                                   |
//! |------------------|-----------------|---------------------------------------------|
//! | Submission       | [`submission`]  | validate and record a claimed payment       |
//! | Gate             | [`gate`]        | owner-only promotion to finally verified    |
//! | Resolution       | [`resolver`]    | fail-open verified set for a contribution list |
//! | Aggregation      | [`aggregator`]  | collected / participants / verified count   |
//! | Reconciliation   | [`reconcile`]   | dashboard refresh lifecycle                 |
//!
//! [`client::BackendClient`] talks to the REST backend, [`store`] caches the
//! session and the last good snapshots, and [`api`] exposes it all locally.

pub mod aggregator;
pub mod api;
pub mod backend;
pub mod client;
pub mod config;
pub mod errors;
pub mod gate;
pub mod money;
pub mod reconcile;
pub mod resolver;
pub mod review;
pub mod session;
pub mod store;
pub mod submission;
pub mod types;
pub mod worker;

#[cfg(test)]
mod invariants;
#[cfg(test)]
mod test_reconcile;
