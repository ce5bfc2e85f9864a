//! Pagination settings, stop predicates, and next-request derivation.
//!
//! A paginated source repeats its call until a stop predicate is satisfied
//! or the `max_calls` safety limit is reached. Each iteration derives the
//! next request (URL, body, or headers) from the previous response via
//! compiled templates. The driver in [`super::ApiFetcher`] operates on an
//! owned [`PreparedRequest`] value, so pagination never disturbs the
//! source's own cursor state.

use std::collections::HashMap;

use serde::Deserialize;
use serde_json::Value;

use super::PreparedRequest;
use crate::config::{PaginationConfig, StopConfig};
use crate::error::{ConfigError, TemplateError};
use crate::template::{JsonPath, Template};

/// Default ceiling on pagination calls per tick.
pub const DEFAULT_MAX_CALLS: u32 = 20;

/// Which part of the request the pagination template rewrites.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PaginationKind {
    /// The next page is addressed by URL.
    Url,
    /// The next page is requested via the body.
    Body,
    /// The next page is requested via headers.
    Headers,
}

/// Comparison applied to the stop field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StopCondition {
    /// Stop when the field is missing, null, or empty.
    Empty,
    /// Stop when the field equals the configured value.
    Equals,
    /// Stop when the field's string form contains the configured value.
    Contains,
}

/// The condition under which pagination for a tick terminates.
#[derive(Debug, Clone)]
pub struct StopPredicate {
    field: JsonPath,
    condition: StopCondition,
    value: Option<Value>,
}

impl StopPredicate {
    /// Build a stop predicate, enforcing that `value` is present exactly
    /// when the condition compares against one.
    pub fn new(
        field: &str,
        condition: StopCondition,
        value: Option<Value>,
    ) -> Result<Self, ConfigError> {
        match condition {
            StopCondition::Empty => {
                if value.is_some() {
                    return Err(ConfigError::InvalidValue {
                        field: "stop_indication.value".to_string(),
                        message: "'empty' condition takes no value".to_string(),
                    });
                }
            }
            StopCondition::Equals | StopCondition::Contains => {
                if value.is_none() {
                    return Err(ConfigError::MissingField {
                        field: "stop_indication.value".to_string(),
                    });
                }
            }
        }
        let field = JsonPath::parse(field).map_err(|e| ConfigError::InvalidValue {
            field: "stop_indication.field".to_string(),
            message: e.to_string(),
        })?;
        Ok(Self {
            field,
            condition,
            value,
        })
    }

    /// Evaluate the predicate against the last response.
    pub fn should_stop(&self, res: &Value) -> bool {
        let resolved = self.field.resolve(res);
        match self.condition {
            StopCondition::Empty => resolved.as_ref().map_or(true, is_empty_value),
            StopCondition::Equals => resolved
                .as_ref()
                .zip(self.value.as_ref())
                .is_some_and(|(got, want)| got == want),
            StopCondition::Contains => resolved
                .as_ref()
                .zip(self.value.as_ref())
                .is_some_and(|(got, want)| {
                    string_form(got).contains(string_form(want).as_str())
                }),
        }
    }
}

/// EMPTY semantics: null, empty string/sequence/map, false, and zero all
/// count as empty.
fn is_empty_value(value: &Value) -> bool {
    match value {
        Value::Null => true,
        Value::Bool(b) => !b,
        Value::Number(n) => n.as_f64() == Some(0.0),
        Value::String(s) => s.is_empty(),
        Value::Array(items) => items.is_empty(),
        Value::Object(map) => map.is_empty(),
    }
}

fn string_form(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// How a source pages through results within one tick.
#[derive(Debug, Clone)]
pub struct PaginationSettings {
    kind: PaginationKind,
    url_template: Option<Template>,
    body_template: Option<Template>,
    headers_template: Option<Vec<(String, Template)>>,
    update_first_url: bool,
    stop: Option<StopPredicate>,
    max_calls: u32,
}

impl PaginationSettings {
    /// URL pagination from a URL (or URL fragment) template.
    pub fn url(format: &str) -> Result<Self, TemplateError> {
        Ok(Self {
            kind: PaginationKind::Url,
            url_template: Some(Template::compile(format)?),
            body_template: None,
            headers_template: None,
            update_first_url: false,
            stop: None,
            max_calls: DEFAULT_MAX_CALLS,
        })
    }

    /// Body pagination from a structured or string body template.
    pub fn body(format: &Value) -> Result<Self, TemplateError> {
        Ok(Self {
            kind: PaginationKind::Body,
            url_template: None,
            body_template: Some(Template::from_value(format)?),
            headers_template: None,
            update_first_url: false,
            stop: None,
            max_calls: DEFAULT_MAX_CALLS,
        })
    }

    /// Headers pagination: every header value is a template.
    pub fn headers(format: &HashMap<String, String>) -> Result<Self, TemplateError> {
        let mut compiled = Vec::with_capacity(format.len());
        for (name, value) in format {
            compiled.push((name.clone(), Template::compile(value)?));
        }
        Ok(Self {
            kind: PaginationKind::Headers,
            url_template: None,
            body_template: None,
            headers_template: Some(compiled),
            update_first_url: false,
            stop: None,
            max_calls: DEFAULT_MAX_CALLS,
        })
    }

    /// Attach a stop predicate.
    #[must_use]
    pub fn with_stop(mut self, stop: StopPredicate) -> Self {
        self.stop = Some(stop);
        self
    }

    /// Override the `max_calls` safety limit.
    #[must_use]
    pub fn with_max_calls(mut self, max_calls: u32) -> Self {
        self.max_calls = max_calls;
        self
    }

    /// For URL pagination: append the substituted fragment to the first
    /// URL instead of replacing it. Some APIs require re-specifying their
    /// filters alongside the page token.
    #[must_use]
    pub fn append_to_first_url(mut self, update_first_url: bool) -> Self {
        self.update_first_url = update_first_url;
        self
    }

    /// Compile pagination settings from a manifest entry.
    pub fn from_config(cfg: &PaginationConfig) -> Result<Self, ConfigError> {
        let invalid = |field: &str, e: TemplateError| ConfigError::InvalidValue {
            field: format!("pagination.{field}"),
            message: e.to_string(),
        };

        let mut settings = match cfg.kind {
            PaginationKind::Url => {
                let format = cfg.url_format.as_deref().ok_or(ConfigError::MissingField {
                    field: "pagination.url_format".to_string(),
                })?;
                Self::url(format).map_err(|e| invalid("url_format", e))?
            }
            PaginationKind::Body => {
                let format = cfg.body_format.as_ref().ok_or(ConfigError::MissingField {
                    field: "pagination.body_format".to_string(),
                })?;
                Self::body(format).map_err(|e| invalid("body_format", e))?
            }
            PaginationKind::Headers => {
                let format = cfg
                    .headers_format
                    .as_ref()
                    .ok_or(ConfigError::MissingField {
                        field: "pagination.headers_format".to_string(),
                    })?;
                Self::headers(format).map_err(|e| invalid("headers_format", e))?
            }
        };

        settings.update_first_url = cfg.update_first_url;
        settings.max_calls = cfg.max_calls;
        if let Some(stop) = &cfg.stop_indication {
            settings.stop = Some(StopPredicate::from_config(stop)?);
        }
        Ok(settings)
    }

    /// Whether pagination should halt before another call is made.
    ///
    /// Without a stop predicate the loop runs until `max_calls` or a
    /// request failure.
    pub fn should_stop(&self, res: &Value, calls_made: u32, source: &str) -> bool {
        if calls_made >= self.max_calls {
            tracing::debug!(
                source,
                max_calls = self.max_calls,
                "pagination reached the max calls limit, stopping"
            );
            return true;
        }
        self.stop.as_ref().is_some_and(|stop| stop.should_stop(res))
    }

    /// Derive the next request from the current one and the last response.
    pub fn next_request(
        &self,
        current: &PreparedRequest,
        first_url: &str,
        res: &Value,
    ) -> Result<PreparedRequest, TemplateError> {
        let mut next = current.clone();
        match self.kind {
            PaginationKind::Url => {
                let template = self
                    .url_template
                    .as_ref()
                    .expect("url pagination always holds a url template");
                let fragment = template.render(res)?;
                next.url = if self.update_first_url {
                    format!("{first_url}{fragment}")
                } else {
                    fragment
                };
            }
            PaginationKind::Body => {
                let template = self
                    .body_template
                    .as_ref()
                    .expect("body pagination always holds a body template");
                next.body = Some(template.render(res)?);
            }
            PaginationKind::Headers => {
                let templates = self
                    .headers_template
                    .as_ref()
                    .expect("headers pagination always holds header templates");
                for (name, template) in templates {
                    let value = template.render(res)?;
                    next.headers.insert(name.clone(), value);
                }
            }
        }
        Ok(next)
    }
}

impl StopPredicate {
    /// Compile a stop predicate from a manifest entry.
    pub fn from_config(cfg: &StopConfig) -> Result<Self, ConfigError> {
        Self::new(&cfg.field, cfg.condition, cfg.value.clone())
    }
}
