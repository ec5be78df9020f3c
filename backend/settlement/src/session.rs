//! Bearer-token session shared by every backend call.
//!
//! The session is cleared in one place, behind the token lock. It wipes the
//! token in memory and in the local store, then publishes
//! [`SessionStatus::Expired`] so every observer (API layer, background
//! reconciler) learns about it at the same time.
//!
//! Failed requests go through [`Session::invalidate_if_current`] with the
//! token they were sent with, so a late rejection of a replaced token leaves
//! the new login alone.

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use chrono::{DateTime, Duration, TimeZone, Utc};
use serde::Deserialize;
use sqlx::SqlitePool;
use tokio::sync::{watch, RwLock};
use tracing::{debug, info, warn};

use crate::errors::{Result, SettlementError};
use crate::store;

/// Tokens that expire within this window are treated as already expired.
const EXPIRY_LEEWAY_SECS: i64 = 30;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionStatus {
    Active,
    /// The user has to log in again; carries the reason shown to them.
    Expired(String),
}

pub struct Session {
    token: RwLock<Option<String>>,
    pool: Option<SqlitePool>,
    status: watch::Sender<SessionStatus>,
}

impl Session {
    /// Restore the persisted token, if any.
    pub async fn load(pool: SqlitePool) -> Result<Self> {
        let token = store::load_token(&pool).await?;
        let status = if token.is_some() {
            SessionStatus::Active
        } else {
            SessionStatus::Expired("not logged in".to_string())
        };
        Ok(Session {
            token: RwLock::new(token),
            pool: Some(pool),
            status: watch::channel(status).0,
        })
    }

    /// A session that lives only in memory.
    pub fn ephemeral(token: Option<String>) -> Self {
        let status = if token.is_some() {
            SessionStatus::Active
        } else {
            SessionStatus::Expired("not logged in".to_string())
        };
        Session {
            token: RwLock::new(token),
            pool: None,
            status: watch::channel(status).0,
        }
    }

    pub fn subscribe(&self) -> watch::Receiver<SessionStatus> {
        self.status.subscribe()
    }

    pub fn status(&self) -> SessionStatus {
        self.status.borrow().clone()
    }

    /// Store a fresh token (the re-login entry point).
    pub async fn install(&self, token: String) -> Result<()> {
        let token = token.trim().to_string();
        if token.is_empty() || token == "null" || token == "undefined" {
            return Err(SettlementError::Authentication("empty session token".to_string()));
        }
        let mut slot = self.token.write().await;
        if let Some(pool) = &self.pool {
            store::save_token(pool, &token).await?;
        }
        *slot = Some(token);
        self.status.send_replace(SessionStatus::Active);
        info!("Session token installed");
        Ok(())
    }

    /// Return a token that is safe to send, or fail with an authentication error.
    ///
    /// A token whose JWT `exp` claim is already (or about to be) in the past
    /// invalidates the session without any network round-trip.
    pub async fn bearer(&self) -> Result<String> {
        let token = self.token.read().await.clone();
        let Some(token) = token else {
            return Err(SettlementError::Authentication("not logged in".to_string()));
        };
        if is_expired(&token, Utc::now()) {
            self.invalidate_if_current(&token, "session expired").await;
            return Err(SettlementError::Authentication("session expired".to_string()));
        }
        Ok(token)
    }

    /// Clear the session everywhere and notify observers.
    pub async fn invalidate(&self, reason: &str) {
        let mut slot = self.token.write().await;
        self.clear(&mut slot, reason).await;
    }

    /// Clear the session only if `token` is still the one in use.
    pub async fn invalidate_if_current(&self, token: &str, reason: &str) {
        let mut slot = self.token.write().await;
        if slot.as_deref() != Some(token) {
            debug!("Ignoring rejection of a replaced session token: {reason}");
            return;
        }
        self.clear(&mut slot, reason).await;
    }

    async fn clear(&self, slot: &mut Option<String>, reason: &str) {
        let had_token = slot.take().is_some();
        if let Some(pool) = &self.pool {
            if let Err(e) = store::clear_token(pool).await {
                warn!("Failed to clear persisted session: {e}");
            }
        }
        if had_token {
            warn!("Session invalidated: {reason}");
        }
        self.status
            .send_replace(SessionStatus::Expired(reason.to_string()));
    }
}

#[derive(Deserialize)]
struct Claims {
    exp: Option<i64>,
}

/// Expiry time of a JWT, or `None` for opaque tokens and tokens without `exp`.
pub fn token_expiry(token: &str) -> Option<DateTime<Utc>> {
    let mut parts = token.split('.');
    let (_header, payload, _sig) = (parts.next()?, parts.next()?, parts.next()?);
    let bytes = URL_SAFE_NO_PAD.decode(payload.trim_end_matches('=')).ok()?;
    let claims: Claims = serde_json::from_slice(&bytes).ok()?;
    Utc.timestamp_opt(claims.exp?, 0).single()
}

/// Opaque tokens are never considered expired locally; the backend decides.
pub fn is_expired(token: &str, now: DateTime<Utc>) -> bool {
    match token_expiry(token) {
        Some(exp) => exp < now + Duration::seconds(EXPIRY_LEEWAY_SECS),
        None => false,
    }
}

#[cfg(test)]
pub(crate) fn jwt_expiring_at(exp: i64) -> String {
    let header = URL_SAFE_NO_PAD.encode(br#"{"alg":"HS256","typ":"JWT"}"#);
    let payload = URL_SAFE_NO_PAD.encode(format!(r#"{{"sub":"asha","exp":{exp}}}"#));
    format!("{header}.{payload}.signature")
}
