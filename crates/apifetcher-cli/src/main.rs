/// Logz.io API fetcher CLI.
///
/// Entry point for the apifetcher binary. Parses arguments, initializes
/// logging, binds the manifest into sources and shippers, spawns one
/// worker per source, and runs until a shutdown signal is received.
use std::path::PathBuf;

use clap::Parser;
use tracing_subscriber::EnvFilter;

use apifetcher_core::config::binding::{bind, BoundSource};
use apifetcher_core::config::Manifest;
use apifetcher_core::scheduler::{run_source_worker, Runtime};

/// Fetch logs from external APIs and ship them to Logz.io
#[derive(Parser)]
#[command(name = "apifetcher")]
#[command(version)]
#[command(about = "Fetch logs from external APIs and ship them to Logz.io")]
struct Cli {
    /// Path to the YAML configuration file
    #[arg(long, default_value = "./config.yaml")]
    config: PathBuf,

    /// Logging level
    #[arg(long, default_value = "INFO", value_parser = ["INFO", "WARN", "ERROR", "DEBUG"])]
    level: String,

    /// Test mode: force DEBUG logging and stop every source after one tick
    #[arg(long)]
    test: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let level = if cli.test { "DEBUG" } else { cli.level.as_str() };
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::new(level.to_lowercase()))
        .init();
    tracing::info!(
        level,
        version = apifetcher_core::version(),
        "starting the api fetcher"
    );

    let manifest = match Manifest::from_path(&cli.config) {
        Ok(manifest) => manifest,
        Err(e) => {
            tracing::error!(error = %e, "could not load the configuration");
            anyhow::bail!("invalid configuration: {e}");
        }
    };
    let bound = match bind(manifest) {
        Ok(bound) => bound,
        Err(e) => {
            tracing::error!(error = %e, "could not start any api input");
            anyhow::bail!("invalid configuration: {e}");
        }
    };

    let mut runtime = Runtime::new();
    for BoundSource { source, shippers } in bound {
        let cancel = runtime.cancel_token();
        let name = format!("source-{}", source.name());
        runtime.spawn(name, run_source_worker(source, shippers, cancel, cli.test));
    }

    if cli.test {
        // Every worker exits on its own after one tick.
        runtime.join_all().await;
    } else {
        runtime.run_until_shutdown().await;
    }

    tracing::info!("api fetcher stopped");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_applied() {
        let cli = Cli::try_parse_from(["apifetcher"]).unwrap();
        assert_eq!(cli.config, PathBuf::from("./config.yaml"));
        assert_eq!(cli.level, "INFO");
        assert!(!cli.test);
    }

    #[test]
    fn level_accepts_the_documented_values() {
        for level in ["INFO", "WARN", "ERROR", "DEBUG"] {
            let cli = Cli::try_parse_from(["apifetcher", "--level", level]).unwrap();
            assert_eq!(cli.level, level);
        }
    }

    #[test]
    fn unknown_level_is_rejected() {
        assert!(Cli::try_parse_from(["apifetcher", "--level", "TRACE"]).is_err());
    }

    #[test]
    fn test_flag_parses() {
        let cli = Cli::try_parse_from(["apifetcher", "--test"]).unwrap();
        assert!(cli.test);
    }
}
