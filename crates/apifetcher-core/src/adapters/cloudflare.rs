//! Cloudflare audit logs adapter.
//!
//! Page-number pagination appended to the first URL, with the records
//! under `result`. An optional `since=` date filter is seeded from
//! `days_back_fetch` and bumped one second after each tick that emitted
//! records.

use chrono::Utc;
use regex::Regex;
use serde::Deserialize;

use super::{fetcher_from_config, invalid, Source, SourceHook, URL_DATE_FORMAT};
use crate::config::GeneralApiConfig;
use crate::error::ConfigError;
use crate::fetcher::pagination::{PaginationSettings, StopCondition, StopPredicate};

fn default_days_back() -> i64 {
    -1
}

/// Manifest entry for Cloudflare sources.
#[derive(Debug, Deserialize)]
pub struct CloudflareConfig {
    /// The generic request fields; the URL may carry an `{account_id}`
    /// placeholder.
    #[serde(flatten)]
    pub request: GeneralApiConfig,

    /// The Cloudflare account id.
    pub cloudflare_account_id: String,

    /// The Cloudflare bearer token.
    pub cloudflare_bearer_token: String,

    /// Disable pagination entirely.
    #[serde(default)]
    pub pagination_off: bool,

    /// Days to fetch back on the first request; negative or absent
    /// disables the `since=` filter.
    #[serde(default = "default_days_back")]
    pub days_back_fetch: i64,

    /// Bump the `since=` date even on ticks that emitted nothing.
    #[serde(default)]
    pub advance_on_empty: bool,
}

/// Build a Cloudflare source.
pub fn build(mut cfg: CloudflareConfig) -> Result<Source, ConfigError> {
    cfg.request.url = cfg
        .request
        .url
        .replace("{account_id}", &cfg.cloudflare_account_id);
    if let Some(next_url) = cfg.request.next_url.take() {
        cfg.request.next_url = Some(next_url.replace("{account_id}", &cfg.cloudflare_account_id));
    }
    cfg.request.response_data_path = Some("result".to_string());
    // Pagination is owned by the adapter, not the manifest entry.
    cfg.request.pagination = None;

    let mut hook = SourceHook::None;
    if cfg.days_back_fetch > 0 {
        let since = (Utc::now() - chrono::Duration::days(cfg.days_back_fetch))
            .format(URL_DATE_FORMAT)
            .to_string();
        let separator = if cfg.request.url.contains('?') { '&' } else { '?' };
        cfg.request.url = format!("{}{}since={}", cfg.request.url, separator, since);
        hook = SourceHook::UrlDateBump {
            seconds: 1,
            format: URL_DATE_FORMAT.to_string(),
            pattern: Regex::new(r"since=([^&\s]+)").expect("since filter regex must compile"),
            advance_on_empty: cfg.advance_on_empty,
        };
    }

    let page_fragment = if cfg.request.url.contains('?') {
        "&page={res.result_info.page+1}"
    } else {
        "?page={res.result_info.page+1}"
    };
    let pagination = if cfg.pagination_off {
        None
    } else {
        Some(
            PaginationSettings::url(page_fragment)
                .map_err(|e| invalid("pagination", e))?
                .append_to_first_url(true)
                .with_stop(StopPredicate::new("result", StopCondition::Empty, None)?),
        )
    };

    let bearer = cfg.cloudflare_bearer_token.clone();
    let mut fetcher = fetcher_from_config(cfg.request)?
        .with_header("Content-Type", "application/json")
        .with_header("Authorization", format!("Bearer {bearer}"));
    if let Some(pagination) = pagination {
        fetcher = fetcher.with_pagination(pagination);
    }

    Ok(Source::new(fetcher).with_hook(hook))
}
