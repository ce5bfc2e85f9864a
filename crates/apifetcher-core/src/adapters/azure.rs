//! Azure adapters: Graph and Mail Reports.
//!
//! Both authenticate with client credentials against the tenant's
//! `login.microsoftonline.com` token endpoint and embed their cursor as a
//! date filter in the request URL. Graph bumps the trailing date by one
//! second after each tick so the boundary record is not re-delivered;
//! Mail Reports carries both a start and an end date and rewrites its
//! `NOW_DATE` placeholder to the current UTC instant before every call.

use chrono::Utc;
use regex::Regex;
use serde::Deserialize;
use serde_json::{Map, Value};

use super::{fetcher_from_config, invalid, Source, SourceHook, URL_DATE_FORMAT};
use crate::config::GeneralApiConfig;
use crate::error::ConfigError;
use crate::fetcher::oauth::OAuthSession;
use crate::fetcher::pagination::{PaginationSettings, StopCondition, StopPredicate};
use crate::fetcher::{ApiFetcher, ReqMethod};

/// Default OAuth scope for Graph requests.
const DEFAULT_GRAPH_SCOPE: &str = "https://graph.microsoft.com/.default";

fn default_days_back() -> i64 {
    1
}

fn default_date_filter_key() -> String {
    "createdDateTime".to_string()
}

fn default_start_date_key() -> String {
    "StartDate".to_string()
}

fn default_end_date_key() -> String {
    "EndDate".to_string()
}

fn default_scrape_interval() -> u64 {
    1
}

/// Manifest entry for Azure Graph sources.
#[derive(Debug, Deserialize)]
pub struct AzureGraphConfig {
    /// Optional identifier.
    #[serde(default)]
    pub name: Option<String>,

    /// The Azure AD tenant id.
    pub azure_ad_tenant_id: String,

    /// The Azure AD client id.
    pub azure_ad_client_id: String,

    /// The Azure AD client secret value.
    pub azure_ad_secret_value: String,

    /// The data request (at minimum its URL).
    pub data_request: GeneralApiConfig,

    /// OAuth scope override.
    #[serde(default)]
    pub scope: Option<String>,

    /// Days to fetch back on the first request.
    #[serde(default = "default_days_back")]
    pub days_back_fetch: i64,

    /// Key used for the date filter in the URL params.
    #[serde(default = "default_date_filter_key")]
    pub date_filter_key: String,

    /// Static fields merged into every emitted record.
    #[serde(default)]
    pub additional_fields: Map<String, Value>,

    /// Minutes between scheduled ticks (≥ 1).
    #[serde(default = "default_scrape_interval")]
    pub scrape_interval: u64,
}

/// Manifest entry for Azure Mail Reports sources.
#[derive(Debug, Deserialize)]
pub struct AzureMailReportsConfig {
    /// Optional identifier.
    #[serde(default)]
    pub name: Option<String>,

    /// The Azure AD tenant id.
    pub azure_ad_tenant_id: String,

    /// The Azure AD client id.
    pub azure_ad_client_id: String,

    /// The Azure AD client secret value.
    pub azure_ad_secret_value: String,

    /// The data request (at minimum its URL).
    pub data_request: GeneralApiConfig,

    /// OAuth scope override.
    #[serde(default)]
    pub scope: Option<String>,

    /// Days to fetch back on the first request.
    #[serde(default = "default_days_back")]
    pub days_back_fetch: i64,

    /// Key used for the start date filter in the URL params.
    #[serde(default = "default_start_date_key")]
    pub start_date_filter_key: String,

    /// Key used for the end date filter in the URL params.
    #[serde(default = "default_end_date_key")]
    pub end_date_filter_key: String,

    /// Static fields merged into every emitted record.
    #[serde(default)]
    pub additional_fields: Map<String, Value>,

    /// Minutes between scheduled ticks (≥ 1).
    #[serde(default = "default_scrape_interval")]
    pub scrape_interval: u64,
}

/// Build the client-credentials token request shared by the Azure
/// adapters.
fn token_request(tenant_id: &str, client_id: &str, secret: &str, scope: &str) -> ApiFetcher {
    ApiFetcher::new(format!(
        "https://login.microsoftonline.com/{tenant_id}/oauth2/v2.0/token"
    ))
    .with_name("azure token endpoint")
    .with_method(ReqMethod::Post)
    .with_header("Content-Type", "application/x-www-form-urlencoded")
    .with_body(&Value::String(format!(
        "client_id={client_id}&scope={scope}&client_secret={secret}&grant_type=client_credentials"
    )))
}

/// The initial "since" date, `days_back` days before now.
fn start_fetch_date(days_back: i64) -> String {
    (Utc::now() - chrono::Duration::days(days_back))
        .format(URL_DATE_FORMAT)
        .to_string()
}

/// Build an Azure Graph source.
///
/// URL shape: `https://url/from/input?$filter=createdDateTime gt
/// 2024-05-28T13:08:54Z`. The `next_url` template rewrites the trailing
/// date from the first record of each response; the post-tick hook then
/// adds one second to it.
pub fn graph(cfg: AzureGraphConfig) -> Result<Source, ConfigError> {
    if cfg.scrape_interval == 0 {
        return Err(ConfigError::InvalidValue {
            field: "scrape_interval".to_string(),
            message: "must be at least 1 minute".to_string(),
        });
    }

    let base_url = cfg.data_request.url.clone();
    let pagination = PaginationSettings::url("{res.@odata\\.nextLink}")
        .map_err(|e| invalid("pagination", e))?
        .with_stop(StopPredicate::new("value", StopCondition::Empty, None)?);

    let mut fetcher = fetcher_from_config(cfg.data_request)?
        .with_pagination(pagination)
        .with_response_data_path("value")
        .map_err(|e| invalid("response_data_path", e))?
        .with_scrape_interval_minutes(cfg.scrape_interval)
        .with_additional_fields(cfg.additional_fields)
        .with_name(cfg.name.unwrap_or_else(|| "azure graph".to_string()));

    fetcher.url = format!(
        "{base_url}?$filter={key} gt {start}",
        key = cfg.date_filter_key,
        start = start_fetch_date(cfg.days_back_fetch)
    );
    fetcher
        .set_next_url(&format!(
            "{base_url}?$filter={key} gt {{res.value.[0].{key}}}",
            key = cfg.date_filter_key
        ))
        .map_err(|e| invalid("next_url", e))?;

    let scope = cfg.scope.as_deref().unwrap_or(DEFAULT_GRAPH_SCOPE);
    let auth = OAuthSession::new(token_request(
        &cfg.azure_ad_tenant_id,
        &cfg.azure_ad_client_id,
        &cfg.azure_ad_secret_value,
        scope,
    ));

    Ok(Source::new(fetcher).with_auth(auth).with_hook(SourceHook::UrlDateBump {
        seconds: 1,
        format: URL_DATE_FORMAT.to_string(),
        pattern: Regex::new(r"gt (\S+)$").expect("graph date filter regex must compile"),
        advance_on_empty: false,
    }))
}

/// Build an Azure Mail Reports source.
///
/// URL shape: `https://url/from/input?$filter=StartDate eq datetime
/// '2024-05-28T13:08:54Z' and EndDate eq datetime '2024-05-29T13:08:54Z'`.
/// The `next_url` template re-inserts a literal `NOW_DATE` end marker,
/// which the pre-call hook rewrites to the current instant.
pub fn mail_reports(cfg: AzureMailReportsConfig) -> Result<Source, ConfigError> {
    if cfg.scrape_interval == 0 {
        return Err(ConfigError::InvalidValue {
            field: "scrape_interval".to_string(),
            message: "must be at least 1 minute".to_string(),
        });
    }

    let base_url = cfg.data_request.url.clone();
    let pagination = PaginationSettings::url("{res.d.@odata\\.nextLink}")
        .map_err(|e| invalid("pagination", e))?
        .with_stop(StopPredicate::new("d.results", StopCondition::Empty, None)?);

    let mut fetcher = fetcher_from_config(cfg.data_request)?
        .with_pagination(pagination)
        .with_response_data_path("d.results")
        .map_err(|e| invalid("response_data_path", e))?
        .with_scrape_interval_minutes(cfg.scrape_interval)
        .with_additional_fields(cfg.additional_fields)
        .with_name(cfg.name.unwrap_or_else(|| "azure mail reports".to_string()));

    let start_cursor = format!("{{res.d.results.[0].{}}}", cfg.end_date_filter_key);
    let next_url = format!(
        "{base_url}?$filter={start_key} eq datetime '{start_cursor}' and {end_key} eq datetime 'NOW_DATE'",
        start_key = cfg.start_date_filter_key,
        end_key = cfg.end_date_filter_key,
    );
    fetcher
        .set_next_url(&next_url)
        .map_err(|e| invalid("next_url", e))?;
    fetcher.url = next_url
        .replace(&start_cursor, &start_fetch_date(cfg.days_back_fetch))
        .replace("NOW_DATE", &Utc::now().format(URL_DATE_FORMAT).to_string());

    let scope = cfg.scope.as_deref().unwrap_or(DEFAULT_GRAPH_SCOPE);
    let auth = OAuthSession::new(token_request(
        &cfg.azure_ad_tenant_id,
        &cfg.azure_ad_client_id,
        &cfg.azure_ad_secret_value,
        scope,
    ));

    Ok(Source::new(fetcher).with_auth(auth).with_hook(SourceHook::NowDate {
        token: "NOW_DATE".to_string(),
        format: URL_DATE_FORMAT.to_string(),
    }))
}
