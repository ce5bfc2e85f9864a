//! Error types for the apifetcher core library.
//!
//! Each module boundary has its own error enum to keep handling policies
//! visible at the call site. The library uses `thiserror` for structured,
//! typed errors.

/// Errors related to manifest loading, parsing, and source binding.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// A required configuration field is absent.
    #[error("missing required config field: {field}")]
    MissingField {
        /// The name of the missing field.
        field: String,
    },

    /// A configuration field has an unacceptable value.
    #[error("invalid value for config field '{field}': {message}")]
    InvalidValue {
        /// The name of the invalid field.
        field: String,
        /// A description of why the value is invalid.
        message: String,
    },

    /// The manifest file could not be read.
    #[error("failed to read config file {path}: {source}")]
    ReadError {
        /// The path that was attempted.
        path: String,
        /// The underlying I/O error.
        #[source]
        source: std::io::Error,
    },

    /// YAML deserialization failed.
    #[error("failed to parse config file: {source}")]
    ParseError {
        /// The underlying YAML parse error.
        #[source]
        source: serde_yaml::Error,
    },

    /// Every `apis` entry in the manifest was rejected.
    #[error("no valid api inputs configured")]
    NoValidSources,
}

/// Errors from compiling or rendering `{res.path}` templates.
#[derive(Debug, Clone, thiserror::Error)]
pub enum TemplateError {
    /// The path expression contained no segments.
    #[error("empty path expression")]
    EmptyPath,

    /// A path segment could not be parsed.
    #[error("invalid path segment '{segment}' in '{path}'")]
    InvalidSegment {
        /// The offending segment text.
        segment: String,
        /// The full path expression.
        path: String,
    },

    /// A referenced path resolved to nothing or null, so the whole
    /// substitution is abandoned and the template left untouched.
    #[error("response has no value at '{path}', leaving '{template}' untouched")]
    PathMiss {
        /// The path that missed.
        path: String,
        /// The raw template being rendered.
        template: String,
    },
}

/// Errors from executing a source's data or token requests.
#[derive(Debug, thiserror::Error)]
pub enum FetchError {
    /// Network-level failure reaching the API (includes timeouts).
    #[error("failed to reach the API: {source}")]
    Network {
        /// The underlying HTTP client error.
        #[source]
        source: reqwest::Error,
    },

    /// The API rejected our credentials (HTTP 401).
    #[error("API authentication rejected (HTTP 401): {message}")]
    Auth {
        /// The error body from the API.
        message: String,
    },

    /// The API rejected the request itself (other 4xx).
    #[error("API client error (HTTP {status}): {message}")]
    Client {
        /// The HTTP status code.
        status: u16,
        /// The error body from the API.
        message: String,
    },

    /// The API failed server-side (5xx) or returned an unexpected status.
    #[error("API error (HTTP {status}): {message}")]
    Api {
        /// The HTTP status code.
        status: u16,
        /// The error body from the API.
        message: String,
    },

    /// The token endpoint could not produce a usable access token.
    #[error("token refresh failed: {message}")]
    TokenRefresh {
        /// Details about the refresh failure.
        message: String,
    },

    /// A request template referenced a path missing from the response.
    #[error(transparent)]
    Template(#[from] TemplateError),
}

impl FetchError {
    /// Classify an HTTP error status into the matching variant.
    pub fn from_status(status: u16, message: String) -> Self {
        match status {
            401 => FetchError::Auth { message },
            400..=499 => FetchError::Client { status, message },
            _ => FetchError::Api { status, message },
        }
    }

    /// Whether the next scheduled tick may reasonably succeed without
    /// operator intervention.
    pub fn is_transient(&self) -> bool {
        !matches!(self, FetchError::Client { .. } | FetchError::Template(_))
    }
}

/// Errors from shipping log bulks to a listener.
#[derive(Debug, thiserror::Error)]
pub enum ShipperError {
    /// Network-level failure reaching the listener (includes timeouts).
    #[error("failed to reach the listener: {source}")]
    Network {
        /// The underlying HTTP client error.
        #[source]
        source: reqwest::Error,
    },

    /// Gzip compression of the bulk failed.
    #[error("failed to compress log bulk: {source}")]
    Compression {
        /// The underlying I/O error.
        #[source]
        source: std::io::Error,
    },

    /// The listener rejected the payload as malformed (HTTP 400).
    #[error("listener rejected the bulk as malformed (HTTP 400): {message}")]
    BadRequest {
        /// The error body from the listener.
        message: String,
    },

    /// The shipping token is missing or invalid (HTTP 401).
    #[error("shipping token is missing or invalid, make sure you're using the right account token")]
    Unauthorized,

    /// Any other non-success response from the listener.
    #[error("listener error (HTTP {status}): {message}")]
    Status {
        /// The HTTP status code.
        status: u16,
        /// The error body from the listener.
        message: String,
    },
}

impl ShipperError {
    /// Fatal errors indicate a misconfiguration or a bug in the payload;
    /// the scheduler stops the process rather than retrying forever.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            ShipperError::BadRequest { .. } | ShipperError::Unauthorized
        )
    }

    /// Whether the send may be retried within the same flush.
    pub fn is_retryable(&self) -> bool {
        match self {
            ShipperError::Network { .. } => true,
            ShipperError::Status { status, .. } => matches!(status, 500 | 502 | 503 | 504),
            _ => false,
        }
    }
}
