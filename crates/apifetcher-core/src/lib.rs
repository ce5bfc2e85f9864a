/// Core library for the Logz.io API fetcher agent.
///
/// This crate contains the generic API fetcher engine (request templates,
/// pagination, OAuth token management), the vendor adapters that specialize
/// it, the batching log shipper, the per-source scheduler, and the manifest
/// binding used by the CLI binary.
pub mod adapters;
pub mod config;
pub mod error;
pub mod fetcher;
pub mod masking;
pub mod scheduler;
pub mod shipper;
pub mod template;

pub use error::*;

/// Returns the version of the apifetcher-core library.
pub fn version() -> &'static str {
    env!("CARGO_PKG_VERSION")
}
