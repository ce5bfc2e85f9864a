//! Batching, gzip-compressing log shipper.
//!
//! Records accumulate into a bulk until adding one more would exceed the
//! bulk ceiling, at which point the pending bulk is flushed first. A
//! flush gzips the newline-joined records and POSTs them to the listener
//! with exponential-backoff retries on transient failures. 400 and 401
//! are terminal: they indicate a malformed payload or a bad token, and
//! the scheduler treats them as fatal.
//!
//! Each shipper instance is private to one source worker; the config
//! binding instantiates a separate shipper per (source, output) pair so
//! batches never need locking.

use std::io::Write;
use std::time::Duration;

use flate2::write::GzEncoder;
use flate2::Compression;
use serde_json::{Map, Value};

use crate::error::ShipperError;
use crate::masking;

/// Largest body the listener accepts.
pub const MAX_BODY_SIZE_BYTES: usize = 10 * 1024 * 1024;

/// Bulk ceiling: a tenth of the body ceiling.
pub const MAX_BULK_SIZE_BYTES: usize = MAX_BODY_SIZE_BYTES / 10;

/// Largest single record the listener accepts.
pub const MAX_LOG_SIZE_BYTES: usize = 500_000;

/// Retries per flush on transient failures.
const MAX_RETRIES: u32 = 3;

/// Exponential backoff factor between attempts, in seconds.
const BACKOFF_FACTOR: u64 = 1;

/// Connection/read timeout for the shipping request.
const CONNECTION_TIMEOUT: Duration = Duration::from_secs(5);

/// One configured destination with batching and retry.
pub struct LogzioShipper {
    listener: String,
    client: reqwest::Client,
    batch: Vec<String>,
    batch_bytes: usize,
}

impl LogzioShipper {
    /// Create a shipper for the given listener endpoint and shipping
    /// token.
    pub fn new(listener: &str, token: &str) -> Self {
        Self {
            listener: format!("{listener}/?token={token}"),
            client: reqwest::Client::new(),
            batch: Vec::new(),
            batch_bytes: 0,
        }
    }

    /// Number of records waiting in the current bulk.
    pub fn pending_records(&self) -> usize {
        self.batch.len()
    }

    /// Byte size of the current bulk.
    pub fn pending_bytes(&self) -> usize {
        self.batch_bytes
    }

    /// Serialize a record, merge the additional fields, and enqueue it.
    ///
    /// String records are parsed as JSON when possible, otherwise wrapped
    /// as `{"message": ...}`. Additional fields never overwrite keys the
    /// record already carries, so enrichment is idempotent. A record
    /// whose serialized form exceeds [`MAX_LOG_SIZE_BYTES`] is dropped
    /// with an error log and does not fail the tick. If the bulk would
    /// exceed [`MAX_BULK_SIZE_BYTES`], it is flushed first.
    pub async fn add_record(
        &mut self,
        record: &Value,
        additional_fields: &Map<String, Value>,
    ) -> Result<(), ShipperError> {
        let enriched = enrich_record(record, additional_fields);
        let size = enriched.len();

        if size > MAX_LOG_SIZE_BYTES {
            tracing::error!(
                size,
                limit = MAX_LOG_SIZE_BYTES,
                "record exceeds the allowed log size, not sending it"
            );
            return Ok(());
        }

        if self.batch_bytes + size > MAX_BULK_SIZE_BYTES {
            self.flush().await?;
        }

        self.batch.push(enriched);
        self.batch_bytes += size;
        Ok(())
    }

    /// Send the pending bulk, if any.
    ///
    /// The bulk is gzip-compressed NDJSON. On success the batch is
    /// cleared; on terminal failure the error propagates to the
    /// scheduler for classification.
    pub async fn flush(&mut self) -> Result<(), ShipperError> {
        if self.batch.is_empty() {
            return Ok(());
        }

        let payload = self.batch.join("\n");
        let compressed = gzip(payload.as_bytes())?;
        self.post_with_retries(compressed).await?;

        tracing::info!(
            bytes = self.batch_bytes,
            records = self.batch.len(),
            "successfully sent bulk to the listener"
        );
        self.batch.clear();
        self.batch_bytes = 0;
        Ok(())
    }

    async fn post_with_retries(&self, body: Vec<u8>) -> Result<(), ShipperError> {
        let mut attempt: u32 = 0;
        loop {
            match self.post_once(body.clone()).await {
                Ok(()) => return Ok(()),
                Err(e) if e.is_retryable() && attempt < MAX_RETRIES => {
                    attempt += 1;
                    let delay = Duration::from_secs(BACKOFF_FACTOR << (attempt - 1));
                    tracing::warn!(
                        attempt,
                        max_retries = MAX_RETRIES,
                        delay_secs = delay.as_secs(),
                        error = %e,
                        "bulk send failed, retrying"
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(e) => {
                    if e.is_retryable() {
                        tracing::error!(
                            max_retries = MAX_RETRIES,
                            listener = %masking::mask(&self.listener),
                            "bulk send failed, max retries reached"
                        );
                    }
                    return Err(e);
                }
            }
        }
    }

    async fn post_once(&self, body: Vec<u8>) -> Result<(), ShipperError> {
        let response = self
            .client
            .post(&self.listener)
            .timeout(CONNECTION_TIMEOUT)
            .header("Content-Type", "application/json")
            .header("Content-Encoding", "gzip")
            .header(
                "Logzio-Shipper",
                concat!("logzio-api-fetcher/", env!("CARGO_PKG_VERSION")),
            )
            .body(body)
            .send()
            .await
            .map_err(|source| ShipperError::Network { source })?;

        let status = response.status().as_u16();
        match status {
            200 | 204 => Ok(()),
            400 => Err(ShipperError::BadRequest {
                message: response.text().await.unwrap_or_default(),
            }),
            401 => Err(ShipperError::Unauthorized),
            _ => Err(ShipperError::Status {
                status,
                message: response.text().await.unwrap_or_default(),
            }),
        }
    }
}

/// Serialize a record to one JSON object line with the additional fields
/// merged in (keys already present in the record win).
fn enrich_record(record: &Value, additional_fields: &Map<String, Value>) -> String {
    let mut object = match record {
        Value::Object(map) => map.clone(),
        Value::String(text) => match serde_json::from_str::<Value>(text) {
            Ok(Value::Object(map)) => map,
            _ => {
                let mut map = Map::new();
                map.insert("message".to_string(), Value::String(text.clone()));
                map
            }
        },
        other => {
            let mut map = Map::new();
            map.insert("message".to_string(), other.clone());
            map
        }
    };

    for (key, value) in additional_fields {
        object
            .entry(key.clone())
            .or_insert_with(|| value.clone());
    }
    Value::Object(object).to_string()
}

fn gzip(payload: &[u8]) -> Result<Vec<u8>, ShipperError> {
    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    encoder
        .write_all(payload)
        .and_then(|()| encoder.finish())
        .map_err(|source| ShipperError::Compression { source })
}
