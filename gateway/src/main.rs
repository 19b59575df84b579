use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use gateway_common::config::GatewayConfig;
use gateway_core::Manager;
use time::{format_description, UtcOffset};
use tracing::info;
use tracing_subscriber::fmt::time::OffsetTime;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer};

fn init_logging() {
    if std::env::var("RUST_LOG").is_err() {
        std::env::set_var("RUST_LOG", "info");
    }
    let offset = UtcOffset::current_local_offset().unwrap_or(UtcOffset::UTC);
    let timer = OffsetTime::new(
        offset,
        format_description::parse("[day].[month].[year] [hour]:[minute]:[second]")
            .expect("built-in time format is valid"),
    );
    let fmt_layer = tracing_subscriber::fmt::layer()
        .with_timer(timer)
        .with_filter(EnvFilter::from_default_env());
    tracing_subscriber::registry().with(fmt_layer).init();
}

fn load_config(path: &PathBuf) -> Result<GatewayConfig> {
    let raw = std::fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
    serde_yaml::from_str(&raw).with_context(|| format!("parsing {}", path.display()))
}

#[tokio::main]
async fn main() -> Result<()> {
    init_logging();

    let config_path = std::env::args_os()
        .nth(1)
        .map(PathBuf::from)
        .context("usage: gateway <config.yaml>")?;
    let config = load_config(&config_path)?;

    let _manager = Arc::new(Manager::new(config));
    info!("gateway authentication core ready");

    tokio::signal::ctrl_c().await.context("waiting for shutdown signal")?;
    info!("shutting down");
    Ok(())
}
