//! 1Password events adapter.
//!
//! Body-based pagination with a server-returned cursor: page with
//! `{"cursor": ...}` until `has_more` is false. After each tick the
//! body's `start_time` is set to the latest record's timestamp — in
//! 1Password responses the latest event is ordered last.

use chrono::Utc;
use serde::Deserialize;
use serde_json::json;

use super::{fetcher_from_config, invalid, Source, SourceHook};
use crate::config::GeneralApiConfig;
use crate::error::ConfigError;
use crate::fetcher::pagination::{PaginationSettings, StopCondition, StopPredicate};
use crate::template::JsonPath;

/// Timestamp format for the `start_time` filter (microsecond precision).
const START_TIME_FORMAT: &str = "%Y-%m-%dT%H:%M:%S%.6fZ";

fn default_days_back() -> i64 {
    -1
}

fn default_limit() -> u32 {
    100
}

/// Manifest entry for 1Password sources.
#[derive(Debug, Deserialize)]
pub struct OnePasswordConfig {
    /// The generic request fields.
    #[serde(flatten)]
    pub request: GeneralApiConfig,

    /// The 1Password bearer token.
    pub onepassword_bearer_token: String,

    /// Disable pagination entirely.
    #[serde(default)]
    pub pagination_off: bool,

    /// Days to fetch back on the first request; negative or absent
    /// disables the `start_time` filter.
    #[serde(default = "default_days_back")]
    pub days_back_fetch: i64,

    /// Events per request (1..=1000).
    #[serde(default = "default_limit")]
    pub onepassword_limit: u32,
}

/// Build a 1Password source.
pub fn build(mut cfg: OnePasswordConfig) -> Result<Source, ConfigError> {
    if !(1..=1000).contains(&cfg.onepassword_limit) {
        return Err(ConfigError::InvalidValue {
            field: "onepassword_limit".to_string(),
            message: "must be between 1 and 1000".to_string(),
        });
    }

    cfg.request.response_data_path = Some("items".to_string());
    let mut body = json!({ "limit": cfg.onepassword_limit });
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

    let bearer = cfg.onepassword_bearer_token.clone();
    let mut fetcher = fetcher_from_config(cfg.request)?
        .with_header("Content-Type", "application/json")
        .with_header("Authorization", format!("Bearer {bearer}"));
    if let Some(pagination) = pagination {
        fetcher = fetcher.with_pagination(pagination);
    }

    Ok(Source::new(fetcher).with_hook(SourceHook::BodyCursor {
        body_key: "start_time".to_string(),
        timestamp_path: JsonPath::parse("timestamp").map_err(|e| invalid("timestamp", e))?,
    }))
}
