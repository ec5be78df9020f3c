//! REST client for the fundraising backend.
//!
//! ## Resilience
//!
//! * Idempotent reads retry transport errors, `429` and `5xx` responses with
//!   exponential back-off, up to `max_retries` extra attempts.
//! * Writes (submission, final verification) are sent exactly once.
//!
//! ## Session handling
//!
//! Every call carries the bearer token from [`Session`]. A `401` (or a `403`
//! outside the final-verification gate) invalidates the session through
//! [`Session::invalidate_if_current`] with the token the request carried. A
//! `403` from the gate is an ownership failure and leaves the session alone.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, Method, StatusCode, Url};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::{debug, warn};

use crate::backend::ContributionBackend;
use crate::config::Config;
use crate::errors::{Result, SettlementError, ValidationError, OWNERSHIP_MESSAGE};
use crate::session::Session;
use crate::types::{parse_timestamp, Contribution, Fundraiser, NewContribution, VerificationReceipt};

/// Substring the backend puts in a duplicate payment reference rejection.
pub const DUPLICATE_REFERENCE_INDICATOR: &str = "already exists";

const MAX_BACKOFF: Duration = Duration::from_secs(30);

/// Which call a response belongs to; decides how `400`/`403` are read.
#[derive(Debug, Clone, Copy)]
enum Call<'a> {
    Read,
    Submit,
    Verify { contribution_id: &'a str },
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct StatusResponse {
    is_finally_verified: bool,
}

#[derive(Debug, Deserialize)]
struct BulkStatusResponse {
    #[serde(default)]
    results: HashMap<String, bool>,
}

pub struct BackendClient {
    http: Client,
    base_url: Url,
    session: Arc<Session>,
    max_retries: u32,
    initial_backoff: Duration,
}

impl BackendClient {
    pub fn new(
        http: Client,
        base_url: &str,
        session: Arc<Session>,
        max_retries: u32,
        initial_backoff: Duration,
    ) -> Result<Self> {
        let base_url = Url::parse(base_url)
            .map_err(|e| SettlementError::Config(format!("Invalid BACKEND_URL {base_url}: {e}")))?;
        if base_url.cannot_be_a_base() {
            return Err(SettlementError::Config(format!("Invalid BACKEND_URL {base_url}")));
        }
        Ok(BackendClient {
            http,
            base_url,
            session,
            max_retries,
            initial_backoff,
        })
    }

    pub fn from_config(config: &Config, session: Arc<Session>) -> Result<Self> {
        let http = Client::builder().timeout(config.request_timeout).build()?;
        Self::new(
            http,
            &config.backend_url,
            session,
            config.max_retries,
            config.retry_backoff,
        )
    }

    fn url(&self, segments: &[&str]) -> Url {
        let mut url = self.base_url.clone();
        if let Ok(mut path) = url.path_segments_mut() {
            path.pop_if_empty().extend(segments);
        }
        url
    }

    /// Send an idempotent request, retrying transient failures.
    async fn read<T: DeserializeOwned>(&self, method: Method, url: Url, body: Option<&Value>) -> Result<T> {
        let mut backoff = self.initial_backoff;
        let mut attempt = 0u32;

        loop {
            let token = self.session.bearer().await?;
            let mut request = self.http.request(method.clone(), url.clone()).bearer_auth(&token);
            if let Some(body) = body {
                request = request.json(body);
            }

            let retryable = match request.send().await {
                Err(e) => SettlementError::Http(e),
                Ok(resp) => {
                    let status = resp.status();
                    if status == StatusCode::TOO_MANY_REQUESTS || status.is_server_error() {
                        let message = error_message(resp).await;
                        SettlementError::Backend {
                            status: status.as_u16(),
                            message,
                        }
                    } else {
                        let resp = self.check(resp, Call::Read, &token).await?;
                        return Ok(resp.json().await?);
                    }
                }
            };

            if attempt >= self.max_retries {
                return Err(retryable);
            }
            attempt += 1;
            warn!("{method} {url} failed (retry {attempt}/{} in {backoff:?}): {retryable}", self.max_retries);
            tokio::time::sleep(backoff).await;
            backoff = (backoff * 2).min(MAX_BACKOFF);
        }
    }

    /// Send a non-idempotent request exactly once.
    async fn write(&self, url: Url, body: &Value, call: Call<'_>) -> Result<Value> {
        let token = self.session.bearer().await?;
        let resp = self
            .http
            .post(url)
            .bearer_auth(&token)
            .json(body)
            .send()
            .await?;
        let resp = self.check(resp, call, &token).await?;
        let text = resp.text().await?;
        if text.trim().is_empty() {
            return Ok(Value::Null);
        }
        Ok(serde_json::from_str(&text).unwrap_or(Value::String(text)))
    }

    /// Pass successful responses through; turn everything else into a typed error.
    async fn check(&self, resp: reqwest::Response, call: Call<'_>, token: &str) -> Result<reqwest::Response> {
        let status = resp.status();
        if status.is_success() {
            return Ok(resp);
        }
        let message = error_message(resp).await;
        let err = classify(status, message, call);
        if let SettlementError::Authentication(reason) = &err {
            self.session.invalidate_if_current(token, reason).await;
        }
        Err(err)
    }
}

/// Map a failed response onto the error taxonomy.
fn classify(status: StatusCode, message: String, call: Call<'_>) -> SettlementError {
    let lower = message.to_lowercase();
    match (status, call) {
        (StatusCode::UNAUTHORIZED, _) => SettlementError::Authentication(message),
        (StatusCode::FORBIDDEN, Call::Verify { .. }) => {
            SettlementError::Authorization(OWNERSHIP_MESSAGE.to_string())
        }
        (StatusCode::FORBIDDEN, _) => SettlementError::Authentication(message),
        (StatusCode::BAD_REQUEST | StatusCode::CONFLICT, Call::Submit) => {
            if lower.contains(DUPLICATE_REFERENCE_INDICATOR) {
                ValidationError::DuplicateReference(message).into()
            } else {
                ValidationError::Rejected(message).into()
            }
        }
        (StatusCode::BAD_REQUEST | StatusCode::CONFLICT, Call::Verify { contribution_id }) => {
            if lower.contains("already") && lower.contains("verified") {
                SettlementError::AlreadyVerified(contribution_id.to_string())
            } else if lower.contains("your own fundraisers") {
                SettlementError::Authorization(OWNERSHIP_MESSAGE.to_string())
            } else if lower.contains("not found") {
                SettlementError::NotFound(message)
            } else {
                ValidationError::Rejected(message).into()
            }
        }
        (StatusCode::NOT_FOUND, _) => SettlementError::NotFound(message),
        _ => SettlementError::Backend {
            status: status.as_u16(),
            message,
        },
    }
}

/// Error bodies come as plain text or as JSON with `message` / `error`.
async fn error_message(resp: reqwest::Response) -> String {
    let status = resp.status();
    let text = resp.text().await.unwrap_or_default();
    extract_message(&text).unwrap_or_else(|| {
        status
            .canonical_reason()
            .unwrap_or("request failed")
            .to_string()
    })
}

fn extract_message(body: &str) -> Option<String> {
    let body = body.trim();
    if body.is_empty() {
        return None;
    }
    match serde_json::from_str::<Value>(body) {
        Ok(Value::Object(map)) => ["message", "error"]
            .iter()
            .find_map(|k| map.get(*k).and_then(|v| v.as_str()).map(String::from))
            .or_else(|| Some(body.to_string())),
        Ok(Value::String(s)) => Some(s),
        _ => Some(body.to_string()),
    }
}

fn string_field(value: &Value, keys: &[&str]) -> Option<String> {
    keys.iter().find_map(|k| match value.get(k)? {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    })
}

#[async_trait]
impl ContributionBackend for BackendClient {
    async fn submit_contribution(&self, contribution: &NewContribution) -> Result<Contribution> {
        let body = serde_json::to_value(contribution)?;
        let created = self.write(self.url(&["contributions"]), &body, Call::Submit).await?;

        // Either the full record or an acknowledgement carrying the new id.
        if let Ok(record) = serde_json::from_value::<Contribution>(created.clone()) {
            return Ok(record);
        }
        let id = string_field(&created, &["id", "contributionId", "participantId"]).ok_or_else(|| {
            SettlementError::Backend {
                status: 201,
                message: "submission response carried no contribution id".to_string(),
            }
        })?;
        debug!("Contribution {id} recorded for fundraiser {}", contribution.fundraiser_id);
        Ok(Contribution {
            id,
            fundraiser_id: contribution.fundraiser_id.clone(),
            participant_name: contribution.participant_name.clone(),
            payment_reference: contribution.payment_reference.clone(),
            amount: contribution.amount,
            email: contribution.email.clone(),
            fundraiser_type: Some(contribution.fundraiser_type),
            fundraiser_title: Some(contribution.fundraiser_title.clone()),
        })
    }

    async fn fundraiser_contributions(&self, fundraiser_id: &str) -> Result<Vec<Contribution>> {
        let url = self.url(&["fundraisers", fundraiser_id, "contributions"]);
        let list: Option<Vec<Contribution>> = self.read(Method::GET, url, None).await?;
        Ok(list.unwrap_or_default())
    }

    async fn owner_contributions(&self) -> Result<Vec<Contribution>> {
        let list: Option<Vec<Contribution>> =
            self.read(Method::GET, self.url(&["contributions"]), None).await?;
        Ok(list.unwrap_or_default())
    }

    async fn owner_fundraisers(&self) -> Result<Vec<Fundraiser>> {
        let list: Option<Vec<Fundraiser>> =
            self.read(Method::GET, self.url(&["fundraisers"]), None).await?;
        Ok(list.unwrap_or_default())
    }

    async fn verification_status(&self, contribution_id: &str) -> Result<bool> {
        let url = self.url(&["contributions", contribution_id, "final-verification"]);
        let status: StatusResponse = self.read(Method::GET, url, None).await?;
        Ok(status.is_finally_verified)
    }

    async fn verification_statuses(&self, contribution_ids: &[String]) -> Result<HashMap<String, bool>> {
        let url = self.url(&["contributions", "final-verification", "bulk-check"]);
        let body = json!({ "contributionIds": contribution_ids });
        let resp: BulkStatusResponse = self.read(Method::POST, url, Some(&body)).await?;
        Ok(resp.results)
    }

    async fn finally_verify(&self, contribution_id: &str, notes: Option<&str>) -> Result<VerificationReceipt> {
        let url = self.url(&["contributions", contribution_id, "final-verification"]);
        let body = match notes {
            Some(notes) => json!({ "notes": notes }),
            None => json!({}),
        };
        let resp = self.write(url, &body, Call::Verify { contribution_id }).await?;

        Ok(VerificationReceipt {
            contribution_id: string_field(&resp, &["contributionId", "participantId"])
                .unwrap_or_else(|| contribution_id.to_string()),
            verified_by: string_field(&resp, &["verifiedBy"]),
            verified_at: string_field(&resp, &["verifiedAt"])
                .as_deref()
                .and_then(parse_timestamp),
            notes: notes.map(String::from),
            already_verified: false,
        })
    }
}
