//! DockerHub audit logs adapter.
//!
//! DockerHub issues short-lived JWTs in exchange for username/password at
//! a fixed login endpoint. The JWT is cached for the process lifetime and
//! re-acquired when the data endpoint answers 401.

use chrono::Utc;
use serde::Deserialize;

use super::{fetcher_from_config, Source, SourceHook};
use crate::config::GeneralApiConfig;
use crate::error::ConfigError;

/// Fixed login endpoint for the JWT exchange.
pub const LOGIN_URL: &str = "https://hub.docker.com/v2/users/login";

/// Timestamp format for the `from=` filter (microsecond precision).
const FROM_DATE_FORMAT: &str = "%Y-%m-%dT%H:%M:%S%.6fZ";

fn default_days_back() -> i64 {
    -1
}

fn default_page_size() -> u32 {
    100
}

/// Manifest entry for DockerHub sources.
#[derive(Debug, Deserialize)]
pub struct DockerHubConfig {
    /// The generic request fields.
    #[serde(flatten)]
    pub request: GeneralApiConfig,

    /// The DockerHub username.
    pub dockerhub_user: String,

    /// The DockerHub personal access token or password.
    pub dockerhub_token: String,

    /// Days to fetch back on the first request; negative or absent
    /// disables the `from=` filter.
    #[serde(default = "default_days_back")]
    pub days_back_fetch: i64,

    /// Events per page.
    #[serde(default = "default_page_size")]
    pub page_size: u32,
}

/// Build a DockerHub source.
pub fn build(mut cfg: DockerHubConfig) -> Result<Source, ConfigError> {
    cfg.request.response_data_path = Some("logs".to_string());

    let mut query = format!("page_size={}", cfg.page_size);
    if cfg.days_back_fetch > 0 {
        let from = (Utc::now() - chrono::Duration::days(cfg.days_back_fetch))
            .format(FROM_DATE_FORMAT)
            .to_string();
        query.push_str(&format!("&from={from}"));
    }
    let separator = if cfg.request.url.contains('?') { '&' } else { '?' };
    cfg.request.url = format!("{}{}{}", cfg.request.url, separator, query);

    let fetcher = fetcher_from_config(cfg.request)?.with_header("Content-Type", "application/json");

    Ok(Source::new(fetcher).with_hook(SourceHook::JwtLogin {
        login_url: LOGIN_URL.to_string(),
        username: cfg.dockerhub_user,
        password: cfg.dockerhub_token,
        jwt: None,
    }))
}
