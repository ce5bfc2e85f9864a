//! OAuth access-token acquisition and near-expiry refresh.
//!
//! Token acquisition is itself an [`ApiFetcher`] pointed at the vendor's
//! token endpoint, so adapters configure it with the same method, URL,
//! headers, and body machinery as any data request. The session caches
//! the access token with its absolute expiry and refreshes on demand
//! before data calls.

use chrono::{DateTime, Utc};
use serde_json::Value;

use super::ApiFetcher;
use crate::error::FetchError;
use crate::template::JsonPath;

/// Pre-expiry refresh window in seconds.
pub const REFRESH_SKEW_SECS: i64 = 60;

/// Default response path for the access token.
pub const DEFAULT_TOKEN_PATH: &str = "access_token";

/// Default response path for the token lifetime.
pub const DEFAULT_EXPIRES_PATH: &str = "expires_in";

/// A cached access token with its absolute expiry.
#[derive(Debug, Clone)]
pub struct TokenState {
    /// The bearer access token.
    pub access_token: String,
    /// When the token expires (UTC).
    pub expires_at: DateTime<Utc>,
}

impl TokenState {
    /// A token is fresh while its expiry is comfortably past the skew
    /// window; otherwise a refresh is required before the next data call.
    pub fn is_fresh(&self) -> bool {
        self.expires_at > Utc::now() + chrono::Duration::seconds(REFRESH_SKEW_SECS)
    }
}

/// Token lifecycle for one OAuth-bound source.
///
/// Each source's session is mutated only by its own worker; there is no
/// cross-source sharing.
pub struct OAuthSession {
    token_request: ApiFetcher,
    token_path: JsonPath,
    expires_path: JsonPath,
    state: Option<TokenState>,
}

impl OAuthSession {
    /// Create a session around a configured token request, using the
    /// default `access_token` / `expires_in` response paths.
    pub fn new(token_request: ApiFetcher) -> Self {
        Self {
            token_request,
            token_path: JsonPath::parse(DEFAULT_TOKEN_PATH).expect("default token path is valid"),
            expires_path: JsonPath::parse(DEFAULT_EXPIRES_PATH)
                .expect("default expires path is valid"),
            state: None,
        }
    }

    /// Override the response paths the token and its lifetime are read
    /// from.
    pub fn with_paths(
        mut self,
        token_path: &str,
        expires_path: &str,
    ) -> Result<Self, crate::error::TemplateError> {
        self.token_path = JsonPath::parse(token_path)?;
        self.expires_path = JsonPath::parse(expires_path)?;
        Ok(self)
    }

    /// Whether a cached token exists and is still fresh.
    pub fn is_fresh(&self) -> bool {
        self.state.as_ref().is_some_and(TokenState::is_fresh)
    }

    /// Return a fresh access token, refreshing from the token endpoint if
    /// the cached one is stale or absent.
    ///
    /// A refresh failure keeps the cached token (it may still work until
    /// its server-side expiry) and propagates as a transient error for
    /// the tick.
    pub async fn ensure_fresh(&mut self) -> Result<String, FetchError> {
        if let Some(state) = &self.state {
            if state.is_fresh() {
                return Ok(state.access_token.clone());
            }
        }
        self.refresh().await
    }

    async fn refresh(&mut self) -> Result<String, FetchError> {
        tracing::debug!(
            token_endpoint = %self.token_request.name,
            "sending request to update the access token"
        );
        let res = self
            .token_request
            .execute()
            .await
            .map_err(|e| FetchError::TokenRefresh {
                message: e.to_string(),
            })?;

        let access_token = self
            .token_path
            .resolve(&res)
            .and_then(|v| v.as_str().map(ToOwned::to_owned))
            .ok_or_else(|| FetchError::TokenRefresh {
                message: format!("token endpoint response has no '{}' field", self.token_path),
            })?;
        let expires_in = self
            .expires_path
            .resolve(&res)
            .and_then(|v| expires_in_seconds(&v))
            .unwrap_or(0);

        let expires_at = Utc::now() + chrono::Duration::seconds(expires_in);
        tracing::info!(
            token_endpoint = %self.token_request.name,
            expires_at = %expires_at,
            "access token refreshed"
        );
        self.state = Some(TokenState {
            access_token: access_token.clone(),
            expires_at,
        });
        Ok(access_token)
    }
}

/// Token endpoints report the lifetime as a number, but some encode it as
/// a string.
fn expires_in_seconds(value: &Value) -> Option<i64> {
    match value {
        Value::Number(n) => n.as_i64(),
        Value::String(s) => s.parse().ok(),
        _ => None,
    }
}
