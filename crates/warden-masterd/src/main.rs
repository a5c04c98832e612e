// SPDX-License-Identifier: MIT OR Apache-2.0
#![deny(unsafe_code)]
use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "ward-masterd", version, about = "Warden master daemon")]
struct Args {
    /// Path to a `config.toml`. Defaults to built-in defaults plus `WARD_MASTER_*` env overrides.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Directory holding `master.db`, the CA, images, and the module signing key.
    #[arg(long)]
    data_dir: Option<String>,

    /// Address the control-plane and admin REST surface bind on.
    #[arg(long)]
    bind_addr: Option<String>,

    /// Enable debug logging.
    #[arg(long)]
    debug: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let filter = if args.debug {
        EnvFilter::new("warden=debug")
    } else {
        EnvFilter::new("warden=info")
    };
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let mut config = warden_config::load_master_config(args.config.as_deref()).context("load master config")?;
    if let Some(data_dir) = args.data_dir {
        config.data_dir = data_dir;
    }
    if let Some(bind_addr) = args.bind_addr {
        config.bind_addr = bind_addr;
    }
    warden_config::validate_master_config(&config).map_err(|e| anyhow::anyhow!("{e}"))?;

    let listener = warden_masterd::bootstrap(&config).await.context("bootstrap master services")?;
    tracing::info!(bind = %config.bind_addr, "warden master listening (mTLS)");

    warden_masterd::serve(listener, shutdown_signal())
        .await
        .context("serve")
}

async fn shutdown_signal() {
    let ctrl_c = async {
        let _ = tokio::signal::ctrl_c().await;
    };

    #[cfg(unix)]
    let terminate = async {
        let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler");
        sigterm.recv().await;
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {}
        () = terminate => {}
    }
    tracing::info!("shutdown signal received");
}
