// SPDX-License-Identifier: MIT OR Apache-2.0
#![deny(unsafe_code)]
use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;
use tracing_subscriber::EnvFilter;
use warden_agentd::{AgentIdentity, Daemon};

#[derive(Parser, Debug)]
#[command(name = "wardend", version, about = "Warden agent daemon")]
struct Args {
    /// Path to a `config.toml`. Defaults to built-in defaults plus `WARDEN_*` env overrides.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Directory holding `agent.db`, certs, and the module cache.
    #[arg(long)]
    data_dir: Option<String>,

    /// `host:port` of the master's control-plane endpoint.
    #[arg(long)]
    master_addr: Option<String>,

    /// Pairing token to redeem on first boot. Required only when no identity is enrolled yet.
    #[arg(long)]
    token: Option<String>,

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

    let mut config = warden_config::load_agent_config(args.config.as_deref()).context("load agent config")?;
    if let Some(data_dir) = args.data_dir {
        config.data_dir = data_dir;
    }
    if let Some(master_addr) = args.master_addr {
        config.master_addr = master_addr;
    }
    warden_config::validate_agent_config(&config).map_err(|e| anyhow::anyhow!("{e}"))?;

    let data_dir = PathBuf::from(&config.data_dir);
    std::fs::create_dir_all(&data_dir).with_context(|| format!("create data dir {}", data_dir.display()))?;

    let identity = match AgentIdentity::load(&data_dir).context("load identity")? {
        Some(identity) => identity,
        None => {
            let token = args
                .token
                .context("no enrolled identity found; pass --token to enroll with the master")?;
            AgentIdentity::enroll(&data_dir, &config.master_addr, &token, &reqwest::Client::new())
                .await
                .context("enroll with master")?
        }
    };

    let http = identity.mtls_client().context("build mTLS client")?;

    tracing::info!(agent_id = %identity.agent_id, master = %config.master_addr, "starting warden agent");

    let daemon = Daemon::bootstrap(&config, &identity, http).await.context("bootstrap daemon")?;

    daemon.run(shutdown_signal()).await;
    Ok(())
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
