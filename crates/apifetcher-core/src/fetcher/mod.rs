//! The generic API fetcher: one configured source and its tick execution.
//!
//! An [`ApiFetcher`] owns everything needed to poll one external REST API:
//! method, URL, headers, body, pagination settings, cursor templates, and
//! the additional fields stamped onto every emitted record. The cursor is
//! deliberately *not* a separate variable — it lives inside the URL or
//! body, where the `next_url` / `next_body` templates rewrite it after
//! each successful tick.
//!
//! Submodules:
//! - [`pagination`]: stop predicates and next-request derivation.
//! - [`oauth`]: access-token acquisition and near-expiry refresh.

pub mod oauth;
pub mod pagination;


use std::collections::HashMap;
use std::time::Duration;

use chrono::NaiveDateTime;
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::{FetchError, TemplateError};
use crate::masking;
use crate::template::{JsonPath, Template};

use pagination::PaginationSettings;

/// Connection/read timeout applied to every request.
pub const CONNECTION_TIMEOUT: Duration = Duration::from_secs(5);

/// Default value of the `type` field stamped onto emitted records.
pub const DEFAULT_LOG_TYPE: &str = "api-fetcher";

/// Supported methods for the API request.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ReqMethod {
    /// HTTP GET.
    #[default]
    Get,
    /// HTTP POST.
    Post,
}

/// A concrete request about to be sent.
///
/// Pagination operates on owned `PreparedRequest` values rather than
/// mutating the source in place, so the cursor committed at the end of a
/// tick is independent of whatever pagination did along the way.
#[derive(Debug, Clone)]
pub struct PreparedRequest {
    /// HTTP method.
    pub method: ReqMethod,
    /// Full request URL.
    pub url: String,
    /// Request headers.
    pub headers: HashMap<String, String>,
    /// Request body, already serialized.
    pub body: Option<String>,
}

/// One configured API source and its polling state.
pub struct ApiFetcher {
    /// Stable identifier used in logs; defaults to the URL.
    pub name: String,
    /// Current request URL (may embed the cursor).
    pub url: String,
    /// Current request headers.
    pub headers: HashMap<String, String>,
    /// Current request body (may embed the cursor).
    pub body: Option<String>,
    method: ReqMethod,
    pagination: Option<PaginationSettings>,
    next_url: Option<Template>,
    next_body: Option<Template>,
    response_data_path: Option<JsonPath>,
    wrap_response_as_record: bool,
    additional_fields: Map<String, Value>,
    scrape_interval: Duration,
    client: reqwest::Client,
}

impl ApiFetcher {
    /// Create a fetcher for the given URL with defaults: GET, no headers,
    /// no body, one-minute interval, and a `type: api-fetcher` field.
    pub fn new(url: impl Into<String>) -> Self {
        let url = url.into();
        let mut additional_fields = Map::new();
        additional_fields.insert("type".to_string(), Value::String(DEFAULT_LOG_TYPE.to_string()));
        Self {
            name: url.clone(),
            url,
            headers: HashMap::new(),
            body: None,
            method: ReqMethod::default(),
            pagination: None,
            next_url: None,
            next_body: None,
            response_data_path: None,
            wrap_response_as_record: true,
            additional_fields,
            scrape_interval: Duration::from_secs(60),
            client: reqwest::Client::new(),
        }
    }

    /// Override the source name.
    #[must_use]
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    /// Set the HTTP method.
    #[must_use]
    pub fn with_method(mut self, method: ReqMethod) -> Self {
        self.method = method;
        self
    }

    /// Replace the request headers.
    #[must_use]
    pub fn with_headers(mut self, headers: HashMap<String, String>) -> Self {
        self.headers = headers;
        self
    }

    /// Set a single request header.
    #[must_use]
    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(name.into(), value.into());
        self
    }

    /// Set the request body. Structured (map/array) bodies are
    /// canonicalized to their JSON string form.
    #[must_use]
    pub fn with_body(mut self, body: &Value) -> Self {
        self.body = Some(format_body(body));
        self
    }

    /// Attach pagination settings.
    #[must_use]
    pub fn with_pagination(mut self, pagination: PaginationSettings) -> Self {
        self.pagination = Some(pagination);
        self
    }

    /// Compile the `next_url` cursor template.
    pub fn with_next_url(mut self, next_url: &str) -> Result<Self, TemplateError> {
        self.next_url = Some(Template::compile(next_url)?);
        Ok(self)
    }

    /// Compile the `next_body` cursor template.
    pub fn with_next_body(mut self, next_body: &Value) -> Result<Self, TemplateError> {
        self.next_body = Some(Template::from_value(next_body)?);
        Ok(self)
    }

    /// Compile the path at which records are found in the response.
    pub fn with_response_data_path(mut self, path: &str) -> Result<Self, TemplateError> {
        self.response_data_path = Some(JsonPath::parse(path)?);
        Ok(self)
    }

    /// When `response_data_path` is unset, controls whether a non-array
    /// response is emitted as a single record (default) or dropped.
    #[must_use]
    pub fn with_wrap_response_as_record(mut self, wrap: bool) -> Self {
        self.wrap_response_as_record = wrap;
        self
    }

    /// Merge fields into the record enrichment set. An explicit `type`
    /// here overrides the default.
    #[must_use]
    pub fn with_additional_fields(mut self, fields: Map<String, Value>) -> Self {
        for (key, value) in fields {
            self.additional_fields.insert(key, value);
        }
        self
    }

    /// Set the scrape interval in minutes.
    #[must_use]
    pub fn with_scrape_interval_minutes(mut self, minutes: u64) -> Self {
        self.scrape_interval = Duration::from_secs(minutes * 60);
        self
    }

    /// Replace the `next_url` cursor template after construction.
    ///
    /// Adapters use this when the template depends on state assembled
    /// during their own setup.
    pub fn set_next_url(&mut self, next_url: &str) -> Result<(), TemplateError> {
        self.next_url = Some(Template::compile(next_url)?);
        Ok(())
    }

    /// The interval between scheduled ticks.
    pub fn scrape_interval(&self) -> Duration {
        self.scrape_interval
    }

    /// Fields merged into every emitted record.
    pub fn additional_fields(&self) -> &Map<String, Value> {
        &self.additional_fields
    }

    /// Execute one scheduled tick: primary request, record extraction,
    /// pagination, and cursor advancement.
    ///
    /// Records are returned in the order they appeared across pages. On
    /// success with at least one record, `next_url` / `next_body` are
    /// rendered against the *first* response and committed; a missing
    /// reference leaves the cursor unchanged (never regress — wait for
    /// the next tick).
    pub async fn poll_once(&mut self) -> Result<Vec<Value>, FetchError> {
        let first_request = self.prepared_request();
        let first = self.send(&first_request).await?;

        let mut records = self.extract_records(&first);
        if records.is_empty() {
            tracing::info!(source = %self.name, "no new data available");
            return Ok(records);
        }

        if let Some(pagination) = &self.pagination {
            let first_url = first_request.url.clone();
            let mut working = first_request;
            let mut last = first.clone();
            let mut calls: u32 = 0;

            while !pagination.should_stop(&last, calls, &self.name) {
                working = match pagination.next_request(&working, &first_url, &last) {
                    Ok(request) => request,
                    Err(e) => {
                        tracing::debug!(
                            source = %self.name,
                            error = %e,
                            "stopping pagination, could not build the next request"
                        );
                        break;
                    }
                };
                calls += 1;
                tracing::debug!(
                    source = %self.name,
                    call = calls,
                    url = %masking::mask(&working.url),
                    "sending pagination call"
                );
                match self.send(&working).await {
                    Ok(res) => {
                        records.extend(self.extract_records(&res));
                        last = res;
                    }
                    Err(e) => {
                        tracing::warn!(
                            source = %self.name,
                            error = %e,
                            "pagination call failed, emitting what accumulated"
                        );
                        break;
                    }
                }
            }
        }

        if let Some(template) = &self.next_url {
            match template.render(&first) {
                Ok(url) => self.url = url,
                Err(e) => {
                    tracing::warn!(source = %self.name, error = %e, "cursor URL not advanced");
                }
            }
        }
        if let Some(template) = &self.next_body {
            match template.render(&first) {
                Ok(body) => self.body = Some(body),
                Err(e) => {
                    tracing::warn!(source = %self.name, error = %e, "cursor body not advanced");
                }
            }
        }

        Ok(records)
    }

    /// Send the current request once and return the parsed response.
    ///
    /// Used for token endpoints and login exchanges, where the raw
    /// response matters rather than extracted records.
    pub async fn execute(&self) -> Result<Value, FetchError> {
        let request = self.prepared_request();
        self.send(&request).await
    }

    /// Rewrite a date captured in the URL, shifted by `seconds`.
    ///
    /// `pattern` must expose the date as capture group 1; `format` is the
    /// chrono format the date is stored in. Adapters use this to bump the
    /// cursor past the boundary record after a successful tick.
    pub fn bump_url_date(&mut self, seconds: i64, format: &str, pattern: &Regex) {
        let Some(original) = pattern
            .captures(&self.url)
            .and_then(|caps| caps.get(1))
            .map(|m| m.as_str().to_string())
        else {
            tracing::error!(
                source = %self.name,
                url = %masking::mask(&self.url),
                "failed to locate the date filter in the URL"
            );
            return;
        };
        match NaiveDateTime::parse_from_str(&original, format) {
            Ok(date) => {
                let bumped = (date + chrono::Duration::seconds(seconds))
                    .format(format)
                    .to_string();
                self.url = self.url.replace(&original, &bumped);
            }
            Err(_) => {
                tracing::error!(
                    source = %self.name,
                    url = %masking::mask(&self.url),
                    "failed to parse the date filter in the URL"
                );
            }
        }
    }

    pub(crate) fn prepared_request(&self) -> PreparedRequest {
        PreparedRequest {
            method: self.method,
            url: self.url.clone(),
            headers: self.headers.clone(),
            body: self.body.clone(),
        }
    }

    /// Extract the records a response contributes to the tick.
    fn extract_records(&self, res: &Value) -> Vec<Value> {
        if let Some(path) = &self.response_data_path {
            return match path.resolve(res) {
                Some(Value::Array(items)) => items,
                Some(Value::Null) | None => {
                    tracing::debug!(
                        source = %self.name,
                        path = %path,
                        "no data at the configured response path"
                    );
                    Vec::new()
                }
                Some(single) => vec![single],
            };
        }
        if res.is_null() || !self.wrap_response_as_record {
            return Vec::new();
        }
        vec![res.clone()]
    }

    async fn send(&self, request: &PreparedRequest) -> Result<Value, FetchError> {
        tracing::debug!(
            source = %self.name,
            method = ?request.method,
            url = %masking::mask(&request.url),
            body = %masking::mask(request.body.as_deref().unwrap_or("")),
            "sending API call"
        );

        let mut builder = match request.method {
            ReqMethod::Get => self.client.get(&request.url),
            ReqMethod::Post => self.client.post(&request.url),
        }
        .timeout(CONNECTION_TIMEOUT);
        for (name, value) in &request.headers {
            builder = builder.header(name, value);
        }
        if let Some(body) = &request.body {
            builder = builder.body(body.clone());
        }

        let response = builder
            .send()
            .await
            .map_err(|source| FetchError::Network { source })?;
        let status = response.status().as_u16();
        let text = response
            .text()
            .await
            .map_err(|source| FetchError::Network { source })?;

        if !(200..300).contains(&status) {
            return Err(FetchError::from_status(status, text));
        }
        if !matches!(status, 200 | 204) {
            tracing::warn!(source = %self.name, status, "unexpected success status from API");
        }
        if text.is_empty() {
            return Ok(Value::Null);
        }
        Ok(serde_json::from_str(&text).unwrap_or(Value::String(text)))
    }
}

/// Canonicalize a body value: structured bodies become JSON strings,
/// string bodies pass through.
pub fn format_body(body: &Value) -> String {
    match body {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}
