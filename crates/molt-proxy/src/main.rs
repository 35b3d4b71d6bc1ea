//! moltd: TCP proxy daemon with zero-downtime restart.

use std::path::PathBuf;

use anyhow::Context;
use clap::Parser;
use molt_core::config::HandoffConfig;
use molt_proxy::coordinator;
use molt_proxy::engine::Engine;
use molt_proxy::reload;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "moltd", version, about = "TCP proxy with zero-downtime restart")]
struct Args {
    /// Path to the TOML configuration file.
    #[arg(long, default_value = "molt.toml")]
    config: PathBuf,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();
    let config = HandoffConfig::from_file(&args.config)
        .with_context(|| format!("loading config from {}", args.config.display()))?;
    std::fs::create_dir_all(&config.handoff.runtime_dir).with_context(|| {
        format!(
            "creating runtime dir {}",
            config.handoff.runtime_dir.display()
        )
    })?;

    let mut engine = Engine::new();

    if reload::spawned_as_successor() {
        info!(pid = std::process::id(), "starting as successor");
        match coordinator::run_taker(&mut engine, &config).await {
            Ok(outcome) => info!(
                listeners = outcome.listeners_adopted,
                connections = outcome.connections_adopted,
                "takeover succeeded"
            ),
            Err(e) => {
                if engine.listener_addresses().await.is_empty() {
                    warn!(error = %e, "takeover failed, falling back to cold start");
                    engine
                        .bind_listeners(&config.listeners)
                        .await
                        .context("cold start bind")?;
                } else {
                    // Rebinding would collide with the listeners this
                    // engine already adopted; keep serving with them.
                    warn!(error = %e, "takeover failed after listeners were adopted, serving with adopted set");
                }
            },
        }
    } else {
        info!(pid = std::process::id(), "cold start");
        engine
            .bind_listeners(&config.listeners)
            .await
            .context("cold start bind")?;
    }

    match reload::serve_until_handoff(&mut engine, &config, &args.config).await? {
        Some(report) => info!(
            session = %report.session_id,
            taker_pid = report.taker_pid,
            "resources handed off, exiting"
        ),
        None => info!("shutdown complete"),
    }
    Ok(())
}
