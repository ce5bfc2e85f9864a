//! Google Workspace activity adapter.
//!
//! Same body-cursor shape as 1Password (server cursor, stop on
//! `has_more == false`, `start_time` bumped to the latest record's
//! timestamp), with a refresh-token grant at the Google token endpoint
//! supplying the bearer.

use chrono::Utc;
use serde::Deserialize;
use serde_json::{json, Value};

use super::{fetcher_from_config, invalid, Source, SourceHook};
use crate::config::GeneralApiConfig;
use crate::error::ConfigError;
use crate::fetcher::oauth::OAuthSession;
use crate::fetcher::pagination::{PaginationSettings, StopCondition, StopPredicate};
use crate::fetcher::{ApiFetcher, ReqMethod};
use crate::template::JsonPath;

/// Google OAuth2 token endpoint.
pub const TOKEN_URL: &str = "https://oauth2.googleapis.com/token";

/// Timestamp format for the `start_time` filter (microsecond precision).
const START_TIME_FORMAT: &str = "%Y-%m-%dT%H:%M:%S%.6fZ";

fn default_days_back() -> i64 {
    -1
}

fn default_limit() -> u32 {
    100
}

/// Manifest entry for Google Workspace sources.
#[derive(Debug, Deserialize)]
pub struct GoogleWorkspaceConfig {
    /// The generic request fields.
    #[serde(flatten)]
    pub request: GeneralApiConfig,

    /// The Google OAuth client id.
    pub google_workspace_client_id: String,

    /// The Google OAuth client secret.
    pub google_workspace_client_secret: String,

    /// A refresh token previously granted for the reports scopes.
    pub google_workspace_refresh_token: String,

    /// Disable pagination entirely.
    #[serde(default)]
    pub pagination_off: bool,

    /// Days to fetch back on the first request; negative or absent
    /// disables the `start_time` filter.
    #[serde(default = "default_days_back")]
    pub days_back_fetch: i64,

    /// Events per request (1..=1000).
    #[serde(default = "default_limit")]
    pub google_workspace_limit: u32,
}

/// Build a Google Workspace source.
pub fn build(mut cfg: GoogleWorkspaceConfig) -> Result<Source, ConfigError> {
    if !(1..=1000).contains(&cfg.google_workspace_limit) {
        return Err(ConfigError::InvalidValue {
            field: "google_workspace_limit".to_string(),
            message: "must be between 1 and 1000".to_string(),
        });
    }

    cfg.request.response_data_path = Some("items".to_string());
    let mut body = json!({ "limit": cfg.google_workspace_limit });
    if cfg.days_back_fetch > 0 {
        let start_time = (Utc::now() - chrono::Duration::days(cfg.days_back_fetch))
            .format(START_TIME_FORMAT)
            .to_string();
        body["start_time"] = json!(start_time);
    }
    cfg.request.body = Some(body);
    cfg.request.pagination = None;

    let pagination = if cfg.pagination_off {
        None
    } else {
        Some(
            PaginationSettings::body(&json!({ "cursor": "{res.cursor}" }))
                .map_err(|e| invalid("pagination", e))?
                .with_stop(StopPredicate::new(
                    "has_more",
                    StopCondition::Equals,
                    Some(json!(false)),
                )?),
        )
    };

    let mut fetcher =
        fetcher_from_config(cfg.request)?.with_header("Content-Type", "application/json");
    if let Some(pagination) = pagination {
        fetcher = fetcher.with_pagination(pagination);
    }

    let token_request = ApiFetcher::new(TOKEN_URL)
        .with_name("google workspace token endpoint")
        .with_method(ReqMethod::Post)
        .with_header("Content-Type", "application/x-www-form-urlencoded")
        .with_body(&Value::String(format!(
            "client_id={client_id}&client_secret={client_secret}&refresh_token={refresh_token}&grant_type=refresh_token",
            client_id = cfg.google_workspace_client_id,
            client_secret = cfg.google_workspace_client_secret,
            refresh_token = cfg.google_workspace_refresh_token,
        )));

    Ok(Source::new(fetcher)
        .with_auth(OAuthSession::new(token_request))
        .with_hook(SourceHook::BodyCursor {
            body_key: "start_time".to_string(),
            timestamp_path: JsonPath::parse("timestamp").map_err(|e| invalid("timestamp", e))?,
        }))
}
