//! Declarative manifest for sources and outputs.
//!
//! The manifest is a YAML document with two sections: `apis` (ordered
//! list of source entries, dispatched on their `type` field) and `logzio`
//! (either a single output applied to all sources, or a list of outputs
//! each declaring the `inputs` it receives). Binding the manifest into
//! runnable sources lives in [`binding`].

pub mod binding;

use std::collections::HashMap;
use std::path::Path;

use serde::Deserialize;
use serde_json::{Map, Value};

use crate::adapters::azure::{AzureGraphConfig, AzureMailReportsConfig};
use crate::adapters::cisco_xdr::CiscoXdrConfig;
use crate::adapters::cloudflare::CloudflareConfig;
use crate::adapters::dockerhub::DockerHubConfig;
use crate::adapters::google_workspace::GoogleWorkspaceConfig;
use crate::adapters::onepassword::OnePasswordConfig;
use crate::error::ConfigError;
use crate::fetcher::pagination::{PaginationKind, StopCondition, DEFAULT_MAX_CALLS};
use crate::fetcher::ReqMethod;

fn default_scrape_interval() -> u64 {
    1
}

fn default_max_calls() -> u32 {
    DEFAULT_MAX_CALLS
}

fn default_wrap_response() -> bool {
    true
}

fn default_listener() -> String {
    "https://listener.logz.io:8071".to_string()
}

/// The whole configuration document.
#[derive(Debug, Deserialize)]
pub struct Manifest {
    /// Ordered list of API sources.
    #[serde(default)]
    pub apis: Vec<ApiEntry>,

    /// Output section: one shipper for everything, or a routed list.
    #[serde(default)]
    pub logzio: Option<LogzioSection>,
}

impl Manifest {
    /// Read and parse a manifest file.
    pub fn from_path(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        tracing::debug!(path = %path.display(), "reading config file");
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::ReadError {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_str(&text)
    }

    /// Parse a manifest from YAML text.
    #[allow(clippy::should_implement_trait)]
    pub fn from_str(text: &str) -> Result<Self, ConfigError> {
        serde_yaml::from_str(text).map_err(|source| ConfigError::ParseError { source })
    }
}

/// One `apis` entry, dispatched on its `type` field.
#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ApiEntry {
    /// Fully declarative source with no vendor specialization.
    General(GeneralApiConfig),
    /// Declarative OAuth source: a token request plus a data request.
    Oauth(OAuthApiConfig),
    /// Azure Graph audit/sign-in logs.
    AzureGraph(AzureGraphConfig),
    /// Azure Mail Reports (message trace).
    AzureMailReports(AzureMailReportsConfig),
    /// Cloudflare audit logs.
    Cloudflare(CloudflareConfig),
    /// DockerHub audit logs.
    Dockerhub(DockerHubConfig),
    /// 1Password events.
    Onepassword(OnePasswordConfig),
    /// Google Workspace activity events.
    GoogleWorkspace(GoogleWorkspaceConfig),
    /// Cisco XDR incidents.
    CiscoXdr(CiscoXdrConfig),
}

/// Fields common to every declarative request.
#[derive(Debug, Deserialize)]
pub struct GeneralApiConfig {
    /// Optional identifier; defaults to the URL.
    #[serde(default)]
    pub name: Option<String>,

    /// The URL to send the request to.
    pub url: String,

    /// HTTP method, GET by default.
    #[serde(default)]
    pub method: ReqMethod,

    /// Request headers.
    #[serde(default)]
    pub headers: HashMap<String, String>,

    /// Request body; structured bodies are canonicalized to JSON strings.
    #[serde(default)]
    pub body: Option<Value>,

    /// Template rewriting the URL after each tick (cursor advancement).
    #[serde(default)]
    pub next_url: Option<String>,

    /// Template rewriting the body after each tick (cursor advancement).
    #[serde(default)]
    pub next_body: Option<Value>,

    /// Path to the records within the response.
    #[serde(default)]
    pub response_data_path: Option<String>,

    /// Pagination behavior.
    #[serde(default)]
    pub pagination: Option<PaginationConfig>,

    /// Static fields merged into every emitted record.
    #[serde(default)]
    pub additional_fields: Map<String, Value>,

    /// Minutes between scheduled ticks (≥ 1).
    #[serde(default = "default_scrape_interval")]
    pub scrape_interval: u64,

    /// When `response_data_path` is unset, emit the whole response as one
    /// record (default) or nothing.
    #[serde(default = "default_wrap_response")]
    pub wrap_response_as_record: bool,
}

/// A declarative OAuth source: the token request is itself a full request
/// description pointed at the vendor's token endpoint.
#[derive(Debug, Deserialize)]
pub struct OAuthApiConfig {
    /// Optional identifier; defaults to the data request's URL.
    #[serde(default)]
    pub name: Option<String>,

    /// Request that acquires the access token.
    pub token_request: GeneralApiConfig,

    /// Request that fetches the data.
    pub data_request: GeneralApiConfig,

    /// Response path of the access token (default `access_token`).
    #[serde(default)]
    pub token_path: Option<String>,

    /// Response path of the token lifetime (default `expires_in`).
    #[serde(default)]
    pub expires_path: Option<String>,

    /// Static fields merged into every emitted record.
    #[serde(default)]
    pub additional_fields: Map<String, Value>,

    /// Minutes between scheduled ticks (≥ 1).
    #[serde(default = "default_scrape_interval")]
    pub scrape_interval: u64,
}

/// Declarative pagination settings.
#[derive(Debug, Deserialize)]
pub struct PaginationConfig {
    /// Which part of the request the template rewrites.
    #[serde(rename = "type")]
    pub kind: PaginationKind,

    /// URL (or URL fragment) template; required when `type: url`.
    #[serde(default)]
    pub url_format: Option<String>,

    /// Body template; required when `type: body`.
    #[serde(default)]
    pub body_format: Option<Value>,

    /// Headers template; required when `type: headers`.
    #[serde(default)]
    pub headers_format: Option<HashMap<String, String>>,

    /// Append the substituted fragment to the first URL instead of
    /// replacing it.
    #[serde(default)]
    pub update_first_url: bool,

    /// Condition that terminates pagination.
    #[serde(default)]
    pub stop_indication: Option<StopConfig>,

    /// Safety ceiling on pagination calls per tick.
    #[serde(default = "default_max_calls")]
    pub max_calls: u32,
}

/// Declarative stop predicate.
#[derive(Debug, Deserialize)]
pub struct StopConfig {
    /// Dotted path into the response.
    pub field: String,

    /// Comparison to apply.
    pub condition: StopCondition,

    /// Comparison value; required for `equals` and `contains`.
    #[serde(default)]
    pub value: Option<Value>,
}

/// The `logzio` output section.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
pub enum LogzioSection {
    /// One shipper applied to all sources.
    Single(LogzioConfig),
    /// A routed list of shippers.
    Many(Vec<LogzioOutputConfig>),
}

/// A single output destination.
#[derive(Debug, Deserialize)]
pub struct LogzioConfig {
    /// Listener endpoint.
    #[serde(default = "default_listener")]
    pub url: String,

    /// Shipping token.
    pub token: String,
}

/// An output destination with explicit input routing.
#[derive(Debug, Deserialize)]
pub struct LogzioOutputConfig {
    /// Listener endpoint.
    #[serde(default = "default_listener")]
    pub url: String,

    /// Shipping token.
    pub token: String,

    /// Names of the sources whose records this output receives.
    #[serde(default)]
    pub inputs: Vec<String>,
}
