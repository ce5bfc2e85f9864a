//! Binding a parsed manifest into runnable sources with their shippers.
//!
//! Invalid entries are skipped with a descriptive error so the remaining
//! sources proceed; a manifest with zero valid sources is a startup
//! failure. Every (source, output) pair gets its own shipper instance:
//! batches stay single-owner, so a sink fanned out from several sources
//! never needs a lock.

use super::{LogzioSection, Manifest};
use crate::adapters::{build_source, Source};
use crate::error::ConfigError;
use crate::shipper::LogzioShipper;

/// A source wired to the shippers that receive its records.
pub struct BoundSource {
    /// The runnable source.
    pub source: Source,
    /// The shippers fanned out to on every tick, in manifest order.
    pub shippers: Vec<LogzioShipper>,
}

/// Validate the manifest and instantiate one bound source per valid
/// entry.
pub fn bind(manifest: Manifest) -> Result<Vec<BoundSource>, ConfigError> {
    let mut sources = Vec::new();
    for (index, entry) in manifest.apis.into_iter().enumerate() {
        match build_source(entry) {
            Ok(source) => {
                tracing::debug!(source = %source.name(), "created api fetcher");
                sources.push(source);
            }
            Err(e) => {
                tracing::error!(index, error = %e, "skipping invalid api entry");
            }
        }
    }
    if sources.is_empty() {
        return Err(ConfigError::NoValidSources);
    }

    let bound = match manifest.logzio {
        None => {
            tracing::warn!(
                "no logzio output defined, collected records will not be shipped anywhere"
            );
            sources
                .into_iter()
                .map(|source| BoundSource {
                    source,
                    shippers: Vec::new(),
                })
                .collect()
        }
        Some(LogzioSection::Single(cfg)) => sources
            .into_iter()
            .map(|source| BoundSource {
                shippers: vec![LogzioShipper::new(&cfg.url, &cfg.token)],
                source,
            })
            .collect(),
        Some(LogzioSection::Many(outputs)) => {
            let names: Vec<String> = sources.iter().map(|s| s.name().to_string()).collect();
            for output in &outputs {
                for input in &output.inputs {
                    if !names.iter().any(|name| name == input) {
                        tracing::warn!(input = %input, "output references an unknown source");
                    }
                }
            }
            sources
                .into_iter()
                .map(|source| {
                    let shippers: Vec<LogzioShipper> = outputs
                        .iter()
                        .filter(|output| output.inputs.iter().any(|i| i == source.name()))
                        .map(|output| LogzioShipper::new(&output.url, &output.token))
                        .collect();
                    if shippers.is_empty() {
                        tracing::warn!(
                            source = %source.name(),
                            "no output matches this source, its records will not be shipped"
                        );
                    }
                    BoundSource { source, shippers }
                })
                .collect()
        }
    };
    Ok(bound)
}
