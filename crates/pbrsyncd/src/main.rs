//! pbrsyncd - policy-based routing rule synchronization daemon
//!
//! Loads the declared policy, installs the derived kernel rules, then
//! listens for kernel rule notifications and reasserts anything
//! removed out-of-band.

use anyhow::Context;
use clap::Parser;
use pbrsyncd::{NetlinkRuleChannel, PbrConfig, PbrContext, PbrSync, RuleListener};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::signal;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

/// Poll interval for the notification socket.
const NOTIFICATION_POLL_MS: u64 = 100;

#[derive(Debug, Parser)]
#[command(name = "pbrsyncd", about = "Policy-based routing rule synchronization daemon")]
struct Args {
    /// Startup configuration file (JSON).
    #[arg(long)]
    config: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_logging();

    let args = Args::parse();
    info!("--- Starting pbrsyncd ---");

    let mut ctx = PbrContext::default();
    #[cfg(target_os = "linux")]
    {
        let count = ctx
            .interfaces
            .populate_from_system()
            .context("failed to load interface inventory")?;
        info!(count, "loaded system interface inventory");
    }

    let channel = NetlinkRuleChannel::new().context("failed to open kernel rule channel")?;
    let mut sync = PbrSync::new(ctx, channel);

    if let Some(path) = &args.config {
        let config = PbrConfig::load(path).context("failed to load configuration")?;
        config
            .apply(&mut sync)
            .context("failed to apply configuration")?;
    }

    let mut listener = RuleListener::new().context("failed to open rule listener")?;
    let shutdown = setup_signal_handlers();

    info!("pbrsyncd: listening for kernel rule changes...");
    loop {
        if shutdown.load(Ordering::Relaxed) {
            info!("pbrsyncd: received shutdown signal");
            break;
        }

        tokio::time::sleep(tokio::time::Duration::from_millis(NOTIFICATION_POLL_MS)).await;

        let events = match listener.try_poll(&sync.context().interfaces) {
            Ok(events) => events,
            Err(e) => {
                warn!(error = %e, "pbrsyncd: error receiving rule notifications");
                continue;
            }
        };
        for (op, rule) in events {
            if let Err(e) = sync.handle_notification(op, rule) {
                warn!(error = %e, "pbrsyncd: error handling rule notification");
            }
        }
    }

    info!("pbrsyncd: graceful shutdown complete");
    Ok(())
}

fn init_logging() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_target(false)
        .with_thread_ids(true)
        .init();
}

fn setup_signal_handlers() -> Arc<AtomicBool> {
    let shutdown_flag = Arc::new(AtomicBool::new(false));
    let shutdown_flag_clone = shutdown_flag.clone();

    tokio::spawn(async move {
        if signal::ctrl_c().await.is_ok() {
            info!("pbrsyncd: received SIGINT/SIGTERM");
            shutdown_flag_clone.store(true, Ordering::Relaxed);
        }
    });

    shutdown_flag
}
