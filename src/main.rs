use anyhow::{Context, Result};
use clap::Parser;
use premium_gate::cli::{handle_premium_command, PremiumCli};
use premium_gate::ClientConfig;
use std::fs::OpenOptions;
use std::sync::Mutex;
use tracing::info;

use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, EnvFilter};

const LOG_FILE: &str = "premium.log";

#[tokio::main]
async fn main() -> Result<()> {
    let cli = PremiumCli::parse();
    let config = cli.apply_overrides(ClientConfig::load()?);

    std::fs::create_dir_all(&config.state_dir).with_context(|| {
        format!("Failed to create state directory {}", config.state_dir.display())
    })?;
    let log_path = config.state_dir.join(LOG_FILE);
    let file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(&log_path)
        .with_context(|| format!("Failed to open log file {}", log_path.display()))?;

    tracing_subscriber::registry()
        .with(
            fmt::layer()
                .json()
                .with_writer(Mutex::new(file))
                .with_current_span(false)
                .with_span_list(false),
        )
        .with(EnvFilter::from_default_env().add_directive("premium_gate=debug".parse()?))
        .init();

    info!(
        api = %config.api_base_url,
        state_dir = %config.state_dir.display(),
        payment_timeout_secs = config.payment_timeout.as_secs(),
        "Starting premium client"
    );

    handle_premium_command(cli, config).await
}
