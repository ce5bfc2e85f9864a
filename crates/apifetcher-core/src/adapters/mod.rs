//! Vendor adapters: constructors that pre-fill the generic engine.
//!
//! The engine never hard-codes vendor literals; each adapter builds a
//! [`Source`] — an [`ApiFetcher`] plus optional OAuth session plus a
//! [`SourceHook`] — from its own manifest entry. Hooks are a tagged
//! variant with a small capability surface: `on_before_call` mutates the
//! request right before each tick's primary call, `on_after_tick` runs
//! cursor bookkeeping after a successful tick, and `on_auth_failure`
//! reacts to a rejected credential.
//!
//! Submodules:
//! - [`azure`]: Azure Graph and Azure Mail Reports.
//! - [`cloudflare`]: Cloudflare audit logs.
//! - [`dockerhub`]: DockerHub audit logs with JWT login exchange.
//! - [`onepassword`]: 1Password events (body cursor).
//! - [`google_workspace`]: Google Workspace activity (body cursor).
//! - [`cisco_xdr`]: Cisco XDR client-credentials OAuth.

pub mod azure;
pub mod cisco_xdr;
pub mod cloudflare;
pub mod dockerhub;
pub mod google_workspace;
pub mod onepassword;

#[cfg(test)]
mod tests;

use chrono::Utc;
use regex::Regex;
use serde_json::Value;

use crate::config::{ApiEntry, GeneralApiConfig, OAuthApiConfig};
use crate::error::{ConfigError, FetchError};
use crate::fetcher::oauth::{OAuthSession, DEFAULT_EXPIRES_PATH, DEFAULT_TOKEN_PATH};
use crate::fetcher::pagination::PaginationSettings;
use crate::fetcher::{ApiFetcher, ReqMethod};
use crate::template::JsonPath;

/// Timestamp format for date filters embedded in request URLs.
pub const URL_DATE_FORMAT: &str = "%Y-%m-%dT%H:%M:%SZ";

/// One configured source: the generic fetcher, its authentication, and
/// the vendor hook specializing its tick.
pub struct Source {
    /// The generic engine state.
    pub fetcher: ApiFetcher,
    /// Token lifecycle for OAuth-bound sources.
    pub auth: Option<OAuthSession>,
    /// Vendor specialization applied around each tick.
    pub hook: SourceHook,
}

impl Source {
    /// A plain source with no authentication and no vendor hook.
    pub fn new(fetcher: ApiFetcher) -> Self {
        Self {
            fetcher,
            auth: None,
            hook: SourceHook::None,
        }
    }

    /// Attach an OAuth session.
    #[must_use]
    pub fn with_auth(mut self, auth: OAuthSession) -> Self {
        self.auth = Some(auth);
        self
    }

    /// Attach a vendor hook.
    #[must_use]
    pub fn with_hook(mut self, hook: SourceHook) -> Self {
        self.hook = hook;
        self
    }

    /// The source's stable name.
    pub fn name(&self) -> &str {
        &self.fetcher.name
    }

    /// Execute one scheduled tick: token refresh, pre-request hook,
    /// fetch/paginate/advance, post-tick hook.
    pub async fn run_tick(&mut self) -> Result<Vec<Value>, FetchError> {
        if let Some(auth) = &mut self.auth {
            let token = auth.ensure_fresh().await?;
            self.fetcher
                .headers
                .insert("Authorization".to_string(), format!("Bearer {token}"));
        }

        self.hook.on_before_call(&mut self.fetcher).await?;

        let result = self.fetcher.poll_once().await;
        match &result {
            Ok(records) => self.hook.on_after_tick(&mut self.fetcher, records),
            Err(FetchError::Auth { .. }) => self.hook.on_auth_failure(),
            Err(_) => {}
        }
        result
    }
}

/// Vendor specialization applied around each tick.
pub enum SourceHook {
    /// No specialization.
    None,

    /// After a tick that emitted records, shift a date captured in the
    /// URL by `seconds` so the boundary record is not re-delivered.
    UrlDateBump {
        /// Seconds to add to the stored date.
        seconds: i64,
        /// chrono format of the date in the URL.
        format: String,
        /// Pattern exposing the date as capture group 1.
        pattern: Regex,
        /// Bump even when the tick emitted nothing.
        advance_on_empty: bool,
    },

    /// Before every call, rewrite a placeholder token in the URL to the
    /// current UTC instant.
    NowDate {
        /// The placeholder text, e.g. `NOW_DATE`.
        token: String,
        /// chrono format for the replacement.
        format: String,
    },

    /// Before the first call (and again after a 401), exchange
    /// username/password for a short-lived JWT and install it as the
    /// bearer.
    JwtLogin {
        /// Login endpoint URL.
        login_url: String,
        /// Account username.
        username: String,
        /// Account password or personal access token.
        password: String,
        /// Cached JWT for the process lifetime.
        jwt: Option<String>,
    },

    /// After a tick that emitted records, copy the last record's
    /// timestamp into a body field so the next tick resumes from it.
    BodyCursor {
        /// Key in the request body to update.
        body_key: String,
        /// Path of the timestamp within a record.
        timestamp_path: JsonPath,
    },
}

impl SourceHook {
    /// Mutate the request immediately before a tick's primary call.
    pub async fn on_before_call(&mut self, fetcher: &mut ApiFetcher) -> Result<(), FetchError> {
        match self {
            SourceHook::None | SourceHook::UrlDateBump { .. } | SourceHook::BodyCursor { .. } => {
                Ok(())
            }
            SourceHook::NowDate { token, format } => {
                let now = Utc::now().format(format).to_string();
                fetcher.url = fetcher.url.replace(token.as_str(), &now);
                Ok(())
            }
            SourceHook::JwtLogin {
                login_url,
                username,
                password,
                jwt,
            } => {
                let token = match jwt {
                    Some(token) => token.clone(),
                    None => {
                        let token = jwt_login(login_url, username, password).await?;
                        *jwt = Some(token.clone());
                        token
                    }
                };
                fetcher
                    .headers
                    .insert("Authorization".to_string(), format!("Bearer {token}"));
                Ok(())
            }
        }
    }

    /// Run cursor bookkeeping after a successful tick.
    pub fn on_after_tick(&mut self, fetcher: &mut ApiFetcher, records: &[Value]) {
        match self {
            SourceHook::None | SourceHook::NowDate { .. } | SourceHook::JwtLogin { .. } => {}
            SourceHook::UrlDateBump {
                seconds,
                format,
                pattern,
                advance_on_empty,
            } => {
                if records.is_empty() && !*advance_on_empty {
                    return;
                }
                fetcher.bump_url_date(*seconds, format, pattern);
            }
            SourceHook::BodyCursor {
                body_key,
                timestamp_path,
            } => {
                let Some(last) = records.last() else { return };
                let Some(timestamp) = timestamp_path.resolve(last) else {
                    tracing::warn!(
                        source = %fetcher.name,
                        path = %timestamp_path,
                        "latest record has no timestamp, cursor body not advanced"
                    );
                    return;
                };
                let Some(mut body) = fetcher
                    .body
                    .as_deref()
                    .and_then(|b| serde_json::from_str::<Value>(b).ok())
                    .and_then(|v| v.as_object().cloned())
                else {
                    tracing::error!(
                        source = %fetcher.name,
                        "request body is not a JSON object, cursor body not advanced"
                    );
                    return;
                };
                body.insert(body_key.clone(), timestamp);
                fetcher.body = Some(Value::Object(body).to_string());
            }
        }
    }

    /// React to the data endpoint rejecting our credential.
    pub fn on_auth_failure(&mut self) {
        if let SourceHook::JwtLogin { jwt, .. } = self {
            tracing::warn!("data endpoint rejected the JWT, will log in again next tick");
            *jwt = None;
        }
    }
}

/// Exchange username/password for a short-lived JWT.
async fn jwt_login(login_url: &str, username: &str, password: &str) -> Result<String, FetchError> {
    let login = ApiFetcher::new(login_url)
        .with_name(format!("{login_url} login"))
        .with_method(ReqMethod::Post)
        .with_header("Content-Type", "application/json")
        .with_body(&serde_json::json!({
            "username": username,
            "password": password,
        }));
    let res = login.execute().await.map_err(|e| FetchError::TokenRefresh {
        message: format!("JWT login failed: {e}"),
    })?;
    res.get("token")
        .and_then(Value::as_str)
        .map(ToOwned::to_owned)
        .ok_or_else(|| FetchError::TokenRefresh {
            message: "JWT login response has no 'token' field".to_string(),
        })
}

/// Build a [`ConfigError::InvalidValue`] from a template or parse error.
pub(crate) fn invalid(field: &str, err: impl std::fmt::Display) -> ConfigError {
    ConfigError::InvalidValue {
        field: field.to_string(),
        message: err.to_string(),
    }
}

/// Instantiate the generic engine from the common declarative fields.
pub(crate) fn fetcher_from_config(cfg: GeneralApiConfig) -> Result<ApiFetcher, ConfigError> {
    if cfg.scrape_interval == 0 {
        return Err(ConfigError::InvalidValue {
            field: "scrape_interval".to_string(),
            message: "must be at least 1 minute".to_string(),
        });
    }

    let mut fetcher = ApiFetcher::new(cfg.url)
        .with_method(cfg.method)
        .with_headers(cfg.headers)
        .with_scrape_interval_minutes(cfg.scrape_interval)
        .with_wrap_response_as_record(cfg.wrap_response_as_record)
        .with_additional_fields(cfg.additional_fields);

    if let Some(name) = cfg.name {
        fetcher = fetcher.with_name(name);
    }
    if let Some(body) = &cfg.body {
        fetcher = fetcher.with_body(body);
    }
    if let Some(next_url) = &cfg.next_url {
        fetcher = fetcher
            .with_next_url(next_url)
            .map_err(|e| invalid("next_url", e))?;
    }
    if let Some(next_body) = &cfg.next_body {
        fetcher = fetcher
            .with_next_body(next_body)
            .map_err(|e| invalid("next_body", e))?;
    }
    if let Some(path) = &cfg.response_data_path {
        fetcher = fetcher
            .with_response_data_path(path)
            .map_err(|e| invalid("response_data_path", e))?;
    }
    if let Some(pagination) = &cfg.pagination {
        fetcher = fetcher.with_pagination(PaginationSettings::from_config(pagination)?);
    }
    Ok(fetcher)
}

/// Build a runnable source from one manifest entry.
pub fn build_source(entry: ApiEntry) -> Result<Source, ConfigError> {
    match entry {
        ApiEntry::General(cfg) => Ok(Source::new(fetcher_from_config(cfg)?)),
        ApiEntry::Oauth(cfg) => build_oauth(cfg),
        ApiEntry::AzureGraph(cfg) => azure::graph(cfg),
        ApiEntry::AzureMailReports(cfg) => azure::mail_reports(cfg),
        ApiEntry::Cloudflare(cfg) => cloudflare::build(cfg),
        ApiEntry::Dockerhub(cfg) => dockerhub::build(cfg),
        ApiEntry::Onepassword(cfg) => onepassword::build(cfg),
        ApiEntry::GoogleWorkspace(cfg) => google_workspace::build(cfg),
        ApiEntry::CiscoXdr(cfg) => cisco_xdr::build(cfg),
    }
}

/// Build a declarative OAuth source: token request plus data request.
fn build_oauth(cfg: OAuthApiConfig) -> Result<Source, ConfigError> {
    if cfg.scrape_interval == 0 {
        return Err(ConfigError::InvalidValue {
            field: "scrape_interval".to_string(),
            message: "must be at least 1 minute".to_string(),
        });
    }
    let token_fetcher = fetcher_from_config(cfg.token_request)?;

    let mut data = fetcher_from_config(cfg.data_request)?
        .with_scrape_interval_minutes(cfg.scrape_interval)
        .with_additional_fields(cfg.additional_fields);
    if let Some(name) = cfg.name {
        data = data.with_name(name);
    }
    data.headers
        .entry("Content-Type".to_string())
        .or_insert_with(|| "application/json".to_string());

    let session = OAuthSession::new(token_fetcher)
        .with_paths(
            cfg.token_path.as_deref().unwrap_or(DEFAULT_TOKEN_PATH),
            cfg.expires_path.as_deref().unwrap_or(DEFAULT_EXPIRES_PATH),
        )
        .map_err(|e| invalid("token_path", e))?;

    Ok(Source::new(data).with_auth(session))
}
