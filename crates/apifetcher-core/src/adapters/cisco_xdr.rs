//! Cisco XDR adapter.
//!
//! OAuth2 client credentials with HTTP Basic at the token endpoint; the
//! data request is pre-populated with JSON content headers (explicit
//! manifest headers win).

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use serde::Deserialize;
use serde_json::{Map, Value};

use super::{fetcher_from_config, Source};
use crate::config::GeneralApiConfig;
use crate::error::ConfigError;
use crate::fetcher::oauth::OAuthSession;
use crate::fetcher::{ApiFetcher, ReqMethod};

/// Cisco XDR OAuth2 token endpoint.
pub const TOKEN_URL: &str = "https://visibility.amp.cisco.com/iroh/oauth2/token";

fn default_scrape_interval() -> u64 {
    1
}

/// Manifest entry for Cisco XDR sources.
#[derive(Debug, Deserialize)]
pub struct CiscoXdrConfig {
    /// Optional identifier.
    #[serde(default)]
    pub name: Option<String>,

    /// The Cisco client id.
    pub cisco_client_id: String,

    /// The Cisco client password.
    pub client_password: String,

    /// The data request.
    pub data_request: GeneralApiConfig,

    /// Static fields merged into every emitted record.
    #[serde(default)]
    pub additional_fields: Map<String, Value>,

    /// Minutes between scheduled ticks (≥ 1).
    #[serde(default = "default_scrape_interval")]
    pub scrape_interval: u64,
}

/// Build a Cisco XDR source.
pub fn build(mut cfg: CiscoXdrConfig) -> Result<Source, ConfigError> {
    if cfg.scrape_interval == 0 {
        return Err(ConfigError::InvalidValue {
            field: "scrape_interval".to_string(),
            message: "must be at least 1 minute".to_string(),
        });
    }

    let credentials = format!("{}:{}", cfg.cisco_client_id, cfg.client_password);
    let token_request = ApiFetcher::new(TOKEN_URL)
        .with_name("cisco xdr token endpoint")
        .with_method(ReqMethod::Post)
        .with_header("Content-Type", "application/x-www-form-urlencoded")
        .with_header("Accept", "application/json")
        .with_header("Authorization", format!("Basic {}", BASE64.encode(credentials)))
        .with_body(&Value::String("grant_type=client_credentials".to_string()));

    // Default JSON content headers; explicit manifest headers win.
    cfg.data_request
        .headers
        .entry("Content-Type".to_string())
        .or_insert_with(|| "application/json".to_string());
    cfg.data_request
        .headers
        .entry("Accept".to_string())
        .or_insert_with(|| "application/json".to_string());

    let mut fetcher = fetcher_from_config(cfg.data_request)?
        .with_scrape_interval_minutes(cfg.scrape_interval)
        .with_additional_fields(cfg.additional_fields);
    if let Some(name) = cfg.name {
        fetcher = fetcher.with_name(name);
    }

    Ok(Source::new(fetcher).with_auth(OAuthSession::new(token_request)))
}
