//! legacy-forge binary.

use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// `RUST_LOG` wins over `--log-level`; an unparseable level falls back to `info`.
fn log_filter(cli_level: &str) -> EnvFilter {
    EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(cli_level))
        .unwrap_or_else(|_| EnvFilter::new("info"))
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = legacy_forge::cli::parse_cli();

    // stdout carries the --json summary
    tracing_subscriber::registry()
        .with(fmt::layer().with_target(false).with_writer(std::io::stderr))
        .with(log_filter(&cli.log_level))
        .init();

    legacy_forge::cli::run_with_cli(cli).await
}
